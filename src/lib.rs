//! mbbridge: Modbus RTU to MQTT bridge daemon
//!
//! The bridge cyclically polls registers on a set of Modbus RTU slaves over a
//! shared half-duplex serial link, publishes their scaled values to an MQTT
//! broker, and turns messages on subscribed topics into Modbus writes back to
//! the same slaves. Everything runs on a single cooperative main loop; the
//! only other thread is the MQTT network driver, which feeds events into the
//! loop through a channel.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod modbus;
pub mod mqtt;
pub mod signal;
