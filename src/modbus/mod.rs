//! Modbus master transport seam.
//!
//! The bridge engine talks to the field bus through [`ModbusTransport`], one
//! request at a time. The serial RTU implementation lives in [`rtu`]; tests
//! use a scripted in-memory transport.

pub mod rtu;

use thiserror::Error;

/// Errors surfaced by a Modbus transaction.
///
/// Timeouts drive slave online/offline tracking and retry gating; an illegal
/// data address (Modbus exception code 2) is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModbusError {
    #[error("no response from slave (timeout)")]
    Timeout,
    #[error("illegal data address")]
    IllegalDataAddress,
    #[error("{0}")]
    Other(String),
}

/// One-request-at-a-time Modbus master operations.
///
/// Read results are delivered uniformly as `u16` per register; bit classes
/// (coils, discrete inputs) yield 0 or 1 per element. Addresses are in-class
/// offsets, not Modicon register numbers.
pub trait ModbusTransport {
    /// FC1
    fn read_coils(&mut self, slave: u8, addr: u16, count: u16) -> Result<Vec<u16>, ModbusError>;
    /// FC2
    fn read_discrete_inputs(
        &mut self,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;
    /// FC4
    fn read_input_registers(
        &mut self,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;
    /// FC3
    fn read_holding_registers(
        &mut self,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError>;
    /// FC6
    fn write_single_register(
        &mut self,
        slave: u8,
        addr: u16,
        value: u16,
    ) -> Result<(), ModbusError>;
    /// FC5
    fn write_single_coil(&mut self, slave: u8, addr: u16, value: bool)
        -> Result<(), ModbusError>;
}

#[cfg(test)]
pub mod testing {
    use super::{ModbusError, ModbusTransport};
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    /// A request as seen on the wire, recorded by the mock transport.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct BusRequest {
        pub function: u8,
        pub slave: u8,
        pub address: u16,
        pub count: u16,
        pub value: u16,
    }

    #[derive(Default)]
    pub struct MockTransport {
        pub read_results: VecDeque<Result<Vec<u16>, ModbusError>>,
        pub write_results: VecDeque<Result<(), ModbusError>>,
        pub requests: Vec<BusRequest>,
    }

    impl MockTransport {
        fn pop_read(&mut self) -> Result<Vec<u16>, ModbusError> {
            self.read_results
                .pop_front()
                .unwrap_or_else(|| Err(ModbusError::Other("unscripted read".to_string())))
        }

        fn pop_write(&mut self) -> Result<(), ModbusError> {
            self.write_results
                .pop_front()
                .unwrap_or_else(|| Err(ModbusError::Other("unscripted write".to_string())))
        }

        fn record_read(
            &mut self,
            function: u8,
            slave: u8,
            address: u16,
            count: u16,
        ) -> Result<Vec<u16>, ModbusError> {
            self.requests.push(BusRequest {
                function,
                slave,
                address,
                count,
                value: 0,
            });
            self.pop_read()
        }
    }

    /// Clonable handle so a test can keep inspecting the transport after
    /// handing it to the engine.
    #[derive(Clone, Default)]
    pub struct SharedMockTransport(pub Rc<RefCell<MockTransport>>);

    impl SharedMockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_read(&self, result: Result<Vec<u16>, ModbusError>) {
            self.0.borrow_mut().read_results.push_back(result);
        }

        pub fn push_write(&self, result: Result<(), ModbusError>) {
            self.0.borrow_mut().write_results.push_back(result);
        }

        pub fn requests(&self) -> Vec<BusRequest> {
            self.0.borrow().requests.clone()
        }

        pub fn clear_requests(&self) {
            self.0.borrow_mut().requests.clear();
        }
    }

    impl ModbusTransport for SharedMockTransport {
        fn read_coils(&mut self, slave: u8, addr: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
            self.0.borrow_mut().record_read(1, slave, addr, count)
        }

        fn read_discrete_inputs(
            &mut self,
            slave: u8,
            addr: u16,
            count: u16,
        ) -> Result<Vec<u16>, ModbusError> {
            self.0.borrow_mut().record_read(2, slave, addr, count)
        }

        fn read_input_registers(
            &mut self,
            slave: u8,
            addr: u16,
            count: u16,
        ) -> Result<Vec<u16>, ModbusError> {
            self.0.borrow_mut().record_read(4, slave, addr, count)
        }

        fn read_holding_registers(
            &mut self,
            slave: u8,
            addr: u16,
            count: u16,
        ) -> Result<Vec<u16>, ModbusError> {
            self.0.borrow_mut().record_read(3, slave, addr, count)
        }

        fn write_single_register(
            &mut self,
            slave: u8,
            addr: u16,
            value: u16,
        ) -> Result<(), ModbusError> {
            let mut inner = self.0.borrow_mut();
            inner.requests.push(BusRequest {
                function: 6,
                slave,
                address: addr,
                count: 1,
                value,
            });
            inner.pop_write()
        }

        fn write_single_coil(
            &mut self,
            slave: u8,
            addr: u16,
            value: bool,
        ) -> Result<(), ModbusError> {
            let mut inner = self.0.borrow_mut();
            inner.requests.push(BusRequest {
                function: 5,
                slave,
                address: addr,
                count: 1,
                value: u16::from(value),
            });
            inner.pop_write()
        }
    }
}
