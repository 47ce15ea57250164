#![allow(dead_code)]

use std::{collections::VecDeque, fmt, time::Duration};

use tokio::time::{sleep, sleep_until, Instant};

use esploader::{
    error::{ConnectionError, Error},
    slip::{self, SlipDecoder},
    Transport,
};

pub const OP_MEM_BEGIN: u8 = 0x05;
pub const OP_MEM_END: u8 = 0x06;
pub const OP_MEM_DATA: u8 = 0x07;
pub const OP_SYNC: u8 = 0x08;
pub const OP_WRITE_REG: u8 = 0x09;
pub const OP_READ_REG: u8 = 0x0a;
pub const OP_FLASH_BEGIN: u8 = 0x02;
pub const OP_FLASH_DATA: u8 = 0x03;
pub const OP_FLASH_END: u8 = 0x04;

pub const MAGIC_REG: u32 = 0x4000_1000;
pub const ESP32_MAGIC: u32 = 0x00f0_1d83;
pub const ESP8266_MAGIC: u32 = 0xfff0_c101;
pub const ESP32_EFUSE_BASE: u32 = 0x3ff5_a000;
pub const ESP8266_EFUSE_BASE: u32 = 0x3ff0_0050;

/// A request as the device received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub op: u8,
    pub checksum: u32,
    pub payload: Vec<u8>,
}

impl Request {
    /// The `n`th little-endian word of the payload
    pub fn word(&self, n: usize) -> u32 {
        let bytes = &self.payload[n * 4..n * 4 + 4];
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

type Responder = Box<dyn FnMut(&Request) -> Vec<Vec<u8>>>;

/// A scripted device: every decoded request is logged and answered with the
/// frames the responder returns for it
pub struct MockDevice {
    decoder: SlipDecoder,
    rx: VecDeque<u8>,
    responder: Responder,
    pub requests: Vec<Request>,
    pub baud: u32,
    pub resets: usize,
    /// Reads fail as if the port went away
    pub disconnected: bool,
    /// How long replies take to arrive after each request
    pub reply_delay: Duration,
    replies_at: Instant,
}

impl MockDevice {
    pub fn new(responder: impl FnMut(&Request) -> Vec<Vec<u8>> + 'static) -> Self {
        MockDevice {
            decoder: SlipDecoder::new(),
            rx: VecDeque::new(),
            responder: Box::new(responder),
            requests: Vec::new(),
            baud: 115_200,
            resets: 0,
            disconnected: false,
            reply_delay: Duration::ZERO,
            replies_at: Instant::now(),
        }
    }

    /// A device which never answers
    pub fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// Queue raw bytes, outside of any exchange
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    pub fn count(&self, op: u8) -> usize {
        self.requests.iter().filter(|r| r.op == op).count()
    }

    pub fn of(&self, op: u8) -> Vec<&Request> {
        self.requests.iter().filter(|r| r.op == op).collect()
    }
}

impl fmt::Debug for MockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDevice")
            .field("requests", &self.requests)
            .field("baud", &self.baud)
            .finish_non_exhaustive()
    }
}

impl Transport for MockDevice {
    async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        for &byte in data {
            let Some(packet) = self.decoder.push(byte).map_err(Error::Connection)? else {
                continue;
            };

            let request = Request {
                op: packet[1],
                checksum: u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]),
                payload: packet[8..].to_vec(),
            };

            self.replies_at = Instant::now() + self.reply_delay;
            for frame in (self.responder)(&request) {
                self.rx.extend(slip::encode(&frame));
            }
            self.requests.push(request);
        }

        Ok(())
    }

    async fn read_byte(&mut self, timeout: Duration) -> Result<u8, Error> {
        if self.disconnected {
            return Err(Error::Connection(ConnectionError::Disconnected));
        }

        let now = Instant::now();
        if !self.rx.is_empty() && self.replies_at > now {
            if self.replies_at - now > timeout {
                sleep(timeout).await;
                return Err(Error::Connection(ConnectionError::Timeout(Default::default())));
            }
            sleep_until(self.replies_at).await;
        }

        match self.rx.pop_front() {
            Some(byte) => Ok(byte),
            None => {
                sleep(timeout).await;
                Err(Error::Connection(ConnectionError::Timeout(Default::default())))
            }
        }
    }

    fn discard_input(&mut self) {
        self.rx.clear();
    }

    async fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.baud = baud;
        Ok(())
    }

    fn baud(&self) -> u32 {
        self.baud
    }

    async fn reset_to_bootloader(&mut self) -> Result<(), Error> {
        self.resets += 1;
        Ok(())
    }
}

/// A response frame: header, then `data` (status included)
pub fn response(op: u8, value: u32, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![0x01, op];
    frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
    frame.extend_from_slice(&value.to_le_bytes());
    frame.extend_from_slice(data);
    frame
}

/// A successful response carrying `status_len` zero status bytes
pub fn ok(op: u8, value: u32, status_len: usize) -> Vec<u8> {
    response(op, value, &vec![0; status_len])
}

/// The eight replies the ROM sends for one SYNC request
pub fn rom_sync_replies() -> Vec<Vec<u8>> {
    (0..8)
        .map(|_| response(OP_SYNC, 0x2070_7000, &[0, 0]))
        .collect()
}

/// Answer register reads from a table, everything else with success
pub fn register_device(
    status_len: usize,
    registers: Vec<(u32, u32)>,
) -> impl FnMut(&Request) -> Vec<Vec<u8>> {
    move |request| match request.op {
        OP_SYNC => rom_sync_replies(),
        OP_READ_REG => {
            let addr = request.word(0);
            let value = registers
                .iter()
                .find(|(reg, _)| *reg == addr)
                .map(|(_, value)| *value)
                .unwrap_or(0);
            vec![ok(OP_READ_REG, value, status_len)]
        }
        op => vec![ok(op, 0, status_len)],
    }
}
