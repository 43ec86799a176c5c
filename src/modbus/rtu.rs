//! Serial Modbus RTU master.
//!
//! Frames are generated and validated with `rmodbus`; the serial port is
//! opened 8N1 with exclusive access and a per-request read timeout. The link
//! is half duplex, so exactly one request is in flight at any time and the
//! receive buffer is cleared before each request.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Result};
use rmodbus::{client::ModbusRequest, ModbusProto};

use super::{ModbusError, ModbusTransport};

pub struct RtuTransport {
    port: Box<dyn serialport::SerialPort>,
    debug_level: u8,
}

impl RtuTransport {
    /// Open the serial device with the requested response timeout.
    pub fn open(
        device: &str,
        baud_rate: u32,
        response_timeout: Duration,
        debug_level: u8,
    ) -> Result<Self> {
        let builder = serialport::new(device, baud_rate)
            .parity(serialport::Parity::None)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .timeout(response_timeout);

        #[cfg(unix)]
        let port: Box<dyn serialport::SerialPort> = {
            let mut handle = builder
                .open_native()
                .map_err(|err| anyhow!("Failed to open port {device}: {err}"))?;
            handle
                .set_exclusive(true)
                .map_err(|err| anyhow!("Failed to acquire exclusive access to {device}: {err}"))?;
            Box::new(handle)
        };

        #[cfg(not(unix))]
        let port: Box<dyn serialport::SerialPort> = builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {device}: {err}"))?;

        Ok(Self { port, debug_level })
    }

    /// Send one request frame and collect the response.
    fn transact(&mut self, request: &[u8], expected: usize) -> Result<Vec<u8>, ModbusError> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|err| ModbusError::Other(err.to_string()))?;
        if self.debug_level > 1 {
            log::debug!("tx {}", hex_dump(request));
        }
        self.port.write_all(request).map_err(io_error)?;
        self.port.flush().map_err(io_error)?;
        let response = self.read_response(expected)?;
        if self.debug_level > 1 {
            log::debug!("rx {}", hex_dump(&response));
        }
        Ok(response)
    }

    /// Read until the expected frame length, an exception frame (5 bytes,
    /// function code with the high bit set) or the port timeout.
    fn read_response(&mut self, expected: usize) -> Result<Vec<u8>, ModbusError> {
        let mut buffer = vec![0u8; expected.max(5)];
        let mut collected = 0usize;
        while collected < buffer.len() {
            match self.port.read(&mut buffer[collected..]) {
                Ok(0) => break,
                Ok(n) => {
                    collected += n;
                    if collected >= 5 && buffer[1] & 0x80 != 0 {
                        break;
                    }
                    if collected >= expected {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    if collected == 0 {
                        return Err(ModbusError::Timeout);
                    }
                    break;
                }
                Err(err) => return Err(ModbusError::Other(err.to_string())),
            }
        }
        if collected == 0 {
            return Err(ModbusError::Timeout);
        }
        buffer.truncate(collected);
        Ok(buffer)
    }

    fn read_registers(
        &mut self,
        function: ReadFunction,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        let mut request = ModbusRequest::new(slave, ModbusProto::Rtu);
        let mut frame = Vec::with_capacity(8);
        match function {
            ReadFunction::Coils => request.generate_get_coils(addr, count, &mut frame),
            ReadFunction::Discretes => request.generate_get_discretes(addr, count, &mut frame),
            ReadFunction::Inputs => request.generate_get_inputs(addr, count, &mut frame),
            ReadFunction::Holdings => request.generate_get_holdings(addr, count, &mut frame),
        }
        .map_err(protocol_error)?;

        if self.debug_level > 0 {
            log::debug!("read #{slave} {} {addr} qty {count}", function.name());
        }

        let expected = match function {
            ReadFunction::Coils | ReadFunction::Discretes => bit_response_len(count),
            ReadFunction::Inputs | ReadFunction::Holdings => register_response_len(count),
        };
        let response = self.transact(&frame, expected)?;
        request.parse_ok(&response).map_err(protocol_error)?;

        match function {
            ReadFunction::Coils | ReadFunction::Discretes => Ok(parse_bit_values(&response, count)),
            ReadFunction::Inputs | ReadFunction::Holdings => Ok(parse_register_values(&response)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ReadFunction {
    Coils,
    Discretes,
    Inputs,
    Holdings,
}

impl ReadFunction {
    fn name(self) -> &'static str {
        match self {
            ReadFunction::Coils => "coils",
            ReadFunction::Discretes => "discretes",
            ReadFunction::Inputs => "inputs",
            ReadFunction::Holdings => "holdings",
        }
    }
}

impl ModbusTransport for RtuTransport {
    fn read_coils(&mut self, slave: u8, addr: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        self.read_registers(ReadFunction::Coils, slave, addr, count)
    }

    fn read_discrete_inputs(
        &mut self,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.read_registers(ReadFunction::Discretes, slave, addr, count)
    }

    fn read_input_registers(
        &mut self,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.read_registers(ReadFunction::Inputs, slave, addr, count)
    }

    fn read_holding_registers(
        &mut self,
        slave: u8,
        addr: u16,
        count: u16,
    ) -> Result<Vec<u16>, ModbusError> {
        self.read_registers(ReadFunction::Holdings, slave, addr, count)
    }

    fn write_single_register(
        &mut self,
        slave: u8,
        addr: u16,
        value: u16,
    ) -> Result<(), ModbusError> {
        let mut request = ModbusRequest::new(slave, ModbusProto::Rtu);
        let mut frame = Vec::with_capacity(8);
        request
            .generate_set_holding(addr, value, &mut frame)
            .map_err(protocol_error)?;
        if self.debug_level > 0 {
            log::debug!("write #{slave} holding {addr} = {value}");
        }
        // FC6 response echoes the 8-byte request
        let response = self.transact(&frame, 8)?;
        request.parse_ok(&response).map_err(protocol_error)
    }

    fn write_single_coil(
        &mut self,
        slave: u8,
        addr: u16,
        value: bool,
    ) -> Result<(), ModbusError> {
        let mut request = ModbusRequest::new(slave, ModbusProto::Rtu);
        let mut frame = Vec::with_capacity(8);
        request
            .generate_set_coil(addr, value, &mut frame)
            .map_err(protocol_error)?;
        if self.debug_level > 0 {
            log::debug!("write #{slave} coil {addr} = {}", u8::from(value));
        }
        let response = self.transact(&frame, 8)?;
        request.parse_ok(&response).map_err(protocol_error)
    }
}

fn io_error(err: std::io::Error) -> ModbusError {
    if err.kind() == std::io::ErrorKind::TimedOut {
        ModbusError::Timeout
    } else {
        ModbusError::Other(err.to_string())
    }
}

fn protocol_error(err: rmodbus::ErrorKind) -> ModbusError {
    match err {
        rmodbus::ErrorKind::IllegalDataAddress => ModbusError::IllegalDataAddress,
        other => ModbusError::Other(other.to_string()),
    }
}

fn register_response_len(count: u16) -> usize {
    // addr + func + byte count + data + crc
    3 + count as usize * 2 + 2
}

fn bit_response_len(count: u16) -> usize {
    3 + (count as usize + 7) / 8 + 2
}

fn parse_register_values(response: &[u8]) -> Vec<u16> {
    if response.len() < 5 {
        return Vec::new();
    }
    response[3..response.len() - 2]
        .chunks_exact(2)
        .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// First coil corresponds to the LSB of the first data byte.
fn parse_bit_values(response: &[u8], count: u16) -> Vec<u16> {
    if response.len() < 5 {
        return Vec::new();
    }
    let mut values = response[3..response.len() - 2]
        .iter()
        .flat_map(|byte| (0..8).map(move |bit| u16::from((byte >> bit) & 1)))
        .collect::<Vec<u16>>();
    values.truncate(count as usize);
    values
}

fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_values_are_big_endian_pairs() {
        // addr, func, byte count, 0x01A7 = 423, 0x0002, crc
        let response = [0x03, 0x03, 0x04, 0x01, 0xA7, 0x00, 0x02, 0xAA, 0xBB];
        assert_eq!(parse_register_values(&response), vec![423, 2]);
    }

    #[test]
    fn bit_values_unpack_lsb_first() {
        // 0b0000_0101: coils 0 and 2 set
        let response = [0x03, 0x01, 0x01, 0x05, 0xAA, 0xBB];
        assert_eq!(parse_bit_values(&response, 4), vec![1, 0, 1, 0]);
    }

    #[test]
    fn truncated_responses_yield_no_values() {
        assert!(parse_register_values(&[0x03, 0x83]).is_empty());
        assert!(parse_bit_values(&[0x03, 0x81, 0x02], 8).is_empty());
    }

    #[test]
    fn expected_lengths_cover_data_and_crc() {
        assert_eq!(register_response_len(1), 7);
        assert_eq!(register_response_len(4), 13);
        assert_eq!(bit_response_len(1), 6);
        assert_eq!(bit_response_len(9), 7);
    }

    #[test]
    fn timeouts_map_to_timeout_errors() {
        let err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert_eq!(io_error(err), ModbusError::Timeout);
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(io_error(err), ModbusError::Other(_)));
    }
}
