#![allow(dead_code)]

use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    sync::Arc,
    time::Duration,
};

use servolink::{
    api::modbus::{ConnectionConfig, Link, LinkOpener, RegisterClient, TransportSession},
    core::logs::{Logger, MemoryLogSink},
    protocol::modbus::frame::append_crc,
};

pub const PORT: &str = "fake0";
pub const UNIT: u8 = 1;

struct Rule {
    function: u8,
    address: u16,
    count: Option<u16>,
    code: u8,
}

#[derive(Default)]
struct DeviceState {
    registers: HashMap<u16, u16>,
    rules: Vec<Rule>,
    delay: Duration,
    silent: bool,
    corrupt: bool,
    requests: usize,
    opens: usize,
    close_fails: bool,
    open_fails: bool,
    open_delay: Duration,
}

/// Scripted RTU slave shared between a test and the links it hands out
#[derive(Clone, Default)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: u16, value: u16) {
        self.state.lock().registers.insert(address, value);
    }

    pub fn set_many(&self, address: u16, values: &[u16]) {
        let mut state = self.state.lock();
        for (offset, value) in values.iter().enumerate() {
            state.registers.insert(address + offset as u16, *value);
        }
    }

    pub fn register(&self, address: u16) -> Option<u16> {
        self.state.lock().registers.get(&address).copied()
    }

    /// Answer `function` at `address` with exception `code`; `count` narrows the
    /// rule to requests of that register count
    pub fn reject(&self, function: u8, address: u16, count: Option<u16>, code: u8) {
        self.state.lock().rules.push(Rule {
            function,
            address,
            count,
            code,
        });
    }

    pub fn clear_rejections(&self) {
        self.state.lock().rules.clear();
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Answer with a damaged CRC
    pub fn set_corrupt(&self, corrupt: bool) {
        self.state.lock().corrupt = corrupt;
    }

    pub fn set_close_fails(&self, fails: bool) {
        self.state.lock().close_fails = fails;
    }

    pub fn set_open_fails(&self, fails: bool) {
        self.state.lock().open_fails = fails;
    }

    pub fn set_open_delay(&self, delay: Duration) {
        self.state.lock().open_delay = delay;
    }

    pub fn requests(&self) -> usize {
        self.state.lock().requests
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn opener(&self) -> FakeOpener {
        FakeOpener {
            device: self.clone(),
        }
    }

    fn respond(&self, request: &[u8]) -> (Option<Vec<u8>>, Duration) {
        let mut state = self.state.lock();
        state.requests += 1;
        let delay = state.delay;
        if state.silent || request.len() < 8 {
            return (None, delay);
        }

        let unit = request[0];
        let function = request[1];
        let address = u16::from_be_bytes([request[2], request[3]]);
        let count = u16::from_be_bytes([request[4], request[5]]);

        let rejected = state
            .rules
            .iter()
            .find(|rule| {
                rule.function == function
                    && rule.address == address
                    && match (function, rule.count) {
                        (0x03 | 0x10, Some(expected)) => expected == count,
                        _ => true,
                    }
            })
            .map(|rule| rule.code);
        let mut response = vec![unit];
        if let Some(code) = rejected {
            response.extend_from_slice(&[function | 0x80, code]);
        } else {
            match function {
                0x03 => {
                    response.extend_from_slice(&[function, (count * 2) as u8]);
                    for register in address..address + count {
                        let value = state.registers.get(&register).copied().unwrap_or(0);
                        response.extend_from_slice(&value.to_be_bytes());
                    }
                }
                0x06 => {
                    state.registers.insert(address, count);
                    response.extend_from_slice(&request[1..6]);
                }
                0x10 => {
                    for offset in 0..count {
                        let at = 7 + offset as usize * 2;
                        let value = u16::from_be_bytes([request[at], request[at + 1]]);
                        state.registers.insert(address + offset, value);
                    }
                    response.extend_from_slice(&request[1..6]);
                }
                _ => response.extend_from_slice(&[function | 0x80, 0x01]),
            }
        }
        append_crc(&mut response);
        if state.corrupt {
            if let Some(last) = response.last_mut() {
                *last ^= 0xFF;
            }
        }
        (Some(response), delay)
    }
}

pub struct FakeOpener {
    device: FakeDevice,
}

impl LinkOpener for FakeOpener {
    fn open(&mut self, _config: &ConnectionConfig) -> io::Result<Box<dyn Link>> {
        let (fails, delay) = {
            let mut state = self.device.state.lock();
            state.opens += 1;
            (state.open_fails, state.open_delay)
        };
        std::thread::sleep(delay);
        if fails {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such port"));
        }
        Ok(Box::new(FakeLink {
            device: self.device.clone(),
            pending: VecDeque::new(),
        }))
    }
}

struct FakeLink {
    device: FakeDevice,
    pending: VecDeque<u8>,
}

impl Read for FakeLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut n = 0;
        while n < buf.len() {
            match self.pending.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Write for FakeLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (response, delay) = self.device.respond(buf);
        std::thread::sleep(delay);
        if let Some(response) = response {
            self.pending.extend(response);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for FakeLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        if self.device.state.lock().close_fails {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port vanished"));
        }
        Ok(())
    }
}

pub fn connection() -> ConnectionConfig {
    ConnectionConfig::new(PORT, 9600, UNIT)
}

pub fn memory_logger() -> (Logger, Arc<MemoryLogSink>) {
    let sink = Arc::new(MemoryLogSink::new(100_000));
    (Logger::new("test", sink.clone()), sink)
}

/// Client wired to `device`, not yet connected
pub fn client_for(device: &FakeDevice, logger: &Logger) -> RegisterClient {
    let session = TransportSession::new(Box::new(device.opener()), logger.child("session"));
    RegisterClient::new(session, logger.child("client"))
}

pub fn connected_client(device: &FakeDevice, logger: &Logger) -> RegisterClient {
    let mut client = client_for(device, logger);
    client
        .connect(&connection())
        .expect("fake device should accept the connection");
    client
}
