pub mod modbus;
pub mod poll;
