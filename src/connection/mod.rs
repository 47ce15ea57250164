//! Establish a connection with a target device
//!
//! The [Connection] struct abstracts over the byte transport and the
//! sending/decoding of commands, and provides register access on top of it.

use std::time::Duration;

use log::{debug, trace};

use self::command::{
    write_packet, Command, CommandType, DIRECTION_RESPONSE, MAX_TIMEOUT,
};
pub use self::transport::{ByteQueue, StreamTransport, Transport};
use crate::{
    error::{ConnectionError, Error, ResultExt, RomError},
    slip::{self, SlipDecoder},
};

pub mod command;
pub mod reset;
#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub mod serial;
pub mod transport;

/// Baud rate the ROM bootloader starts with
pub const ESP_ROM_BAUD: u32 = 115_200;

/// Frames examined while looking for the response to a command
const MAX_RESPONSE_ATTEMPTS: usize = 100;
/// Direction, opcode, length and value
const RESPONSE_HEADER_LEN: usize = 8;
/// Status code the ROM uses for commands it doesn't implement
const ROM_INVALID_RECV_MSG: u8 = 0x05;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponseValue {
    ValueU32(u32),
    Vector(Vec<u8>),
}

impl TryFrom<CommandResponseValue> for u32 {
    type Error = Error;

    fn try_from(value: CommandResponseValue) -> Result<Self, Self::Error> {
        match value {
            CommandResponseValue::ValueU32(value) => Ok(value),
            CommandResponseValue::Vector(data) => Err(Error::InvalidResponse {
                expected: 0,
                got: data.len(),
            }),
        }
    }
}

impl From<CommandResponseValue> for Vec<u8> {
    fn from(value: CommandResponseValue) -> Self {
        match value {
            CommandResponseValue::ValueU32(value) => value.to_le_bytes().to_vec(),
            CommandResponseValue::Vector(data) => data,
        }
    }
}

/// A response from a target device following a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    pub return_op: u8,
    pub value: u32,
    /// Everything following the header, status bytes included
    pub data: Vec<u8>,
}

impl CommandResponse {
    fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < RESPONSE_HEADER_LEN || frame[0] != DIRECTION_RESPONSE {
            return None;
        }

        Some(CommandResponse {
            return_op: frame[1],
            value: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
            data: frame[RESPONSE_HEADER_LEN..].to_vec(),
        })
    }

    /// The device rejected the command as one it does not implement
    fn is_invalid_command(&self) -> bool {
        matches!(self.data.as_slice(), [fail, ROM_INVALID_RECV_MSG, ..] if *fail != 0)
    }
}

/// How to treat SLIP framing errors while waiting for a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Count the broken frame as a stray one and keep looking
    Tolerant,
    /// Fail immediately
    Strict,
}

/// An established connection with a target device
#[derive(Debug)]
pub struct Connection<T> {
    transport: T,
    decoder: SlipDecoder,
    timeout: Duration,
    status_len: usize,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Connection {
            transport,
            decoder: SlipDecoder::new(),
            timeout: command::DEFAULT_TIMEOUT,
            status_len: 4,
        }
    }

    /// Length of the status region trailing every response
    pub fn status_len(&self) -> usize {
        self.status_len
    }

    pub(crate) fn set_status_len(&mut self, len: usize) {
        self.status_len = len;
    }

    /// The read timeout used by the command currently in flight
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back to the caller
    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Set baud rate for the transport
    pub async fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.transport.set_baud(baud).await
    }

    /// Get the current baud rate of the transport
    pub fn baud(&self) -> u32 {
        self.transport.baud()
    }

    /// Send a request packet without waiting for its response
    ///
    /// Anything still queued from earlier exchanges is dropped first.
    pub async fn send(&mut self, opcode: u8, payload: &[u8], checksum: u32) -> Result<(), Error> {
        let mut packet = Vec::with_capacity(payload.len() + 8);
        write_packet(&mut packet, opcode, payload, checksum)?;
        self.send_packet(&packet).await
    }

    /// Write a command to the transport
    pub async fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:02x?}", command.command_type());
        self.send_packet(&command.to_bytes()?).await
    }

    async fn send_packet(&mut self, packet: &[u8]) -> Result<(), Error> {
        trace!("Sending packet: {:02x?}", packet);
        self.transport.discard_input();
        self.decoder.reset();
        self.transport.write(&slip::encode(packet)).await
    }

    /// Read one SLIP frame, waiting at most `timeout` for each byte
    pub async fn read_frame(&mut self, timeout: Duration) -> Result<Vec<u8>, Error> {
        loop {
            let byte = match self.transport.read_byte(timeout).await {
                Ok(byte) => byte,
                Err(err) => {
                    self.decoder.reset();
                    return Err(err);
                }
            };

            if let Some(frame) = self.decoder.push(byte).map_err(Error::Connection)? {
                trace!("Received frame: {:02x?}", frame);
                return Ok(frame);
            }
        }
    }

    /// Wait for the response to `expected`, or to any command when `None`
    ///
    /// Frames which aren't responses, or answer some other command, are
    /// skipped.
    pub async fn receive(
        &mut self,
        expected: Option<CommandType>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        self.receive_with(expected, timeout, Framing::Tolerant)
            .await
    }

    pub(crate) async fn receive_with(
        &mut self,
        expected: Option<CommandType>,
        timeout: Duration,
        framing: Framing,
    ) -> Result<CommandResponse, Error> {
        for _ in 0..MAX_RESPONSE_ATTEMPTS {
            let frame = match self.read_frame(timeout).await {
                Ok(frame) => frame,
                Err(Error::Connection(err))
                    if err.is_framing() && framing == Framing::Tolerant =>
                {
                    debug!("Dropping malformed frame: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            };

            let Some(response) = CommandResponse::parse(&frame) else {
                continue;
            };

            match expected {
                None => return Ok(response),
                Some(ty) if response.return_op == ty as u8 => return Ok(response),
                Some(ty) if response.is_invalid_command() => {
                    self.transport.discard_input();
                    return Err(Error::UnsupportedCommand(ty));
                }
                Some(_) => {
                    debug!(
                        "Skipping response to opcode {:#04x} while waiting for {:?}",
                        response.return_op, expected
                    );
                }
            }
        }

        Err(match expected {
            Some(ty) => Error::ResponseMismatch(ty),
            None => Error::Connection(ConnectionError::Timeout(Default::default())),
        })
    }

    /// Send a raw request and check the status of its response
    pub async fn execute(
        &mut self,
        ty: CommandType,
        payload: &[u8],
        checksum: u32,
        timeout: Duration,
    ) -> Result<CommandResponseValue, Error> {
        self.send(ty as u8, payload, checksum)
            .await
            .for_command(ty)?;
        self.finish_command(ty, timeout).await
    }

    /// Write a command and read the response, using its default timeout
    pub async fn command(&mut self, command: Command<'_>) -> Result<CommandResponseValue, Error> {
        let timeout = command.command_type().timeout();
        self.command_with_timeout(command, timeout).await
    }

    /// Write a command and read the response
    pub async fn command_with_timeout(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponseValue, Error> {
        let ty = command.command_type();
        self.write_command(command).await.for_command(ty)?;
        self.finish_command(ty, timeout).await
    }

    /// Write a command and return its response with the status left in place
    pub async fn command_raw(
        &mut self,
        command: Command<'_>,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let ty = command.command_type();
        self.write_command(command).await.for_command(ty)?;

        self.timeout = timeout.min(MAX_TIMEOUT);
        let response = self.receive(Some(ty), self.timeout).await.for_command(ty);
        self.timeout = command::DEFAULT_TIMEOUT;

        response
    }

    async fn finish_command(
        &mut self,
        ty: CommandType,
        timeout: Duration,
    ) -> Result<CommandResponseValue, Error> {
        self.timeout = timeout.min(MAX_TIMEOUT);
        let response = self.receive(Some(ty), self.timeout).await.for_command(ty)?;
        self.timeout = command::DEFAULT_TIMEOUT;

        let mut data = response.data;
        let status_len = match data.len() {
            // Scalar-only replies from a loader with the short status format
            2 if self.status_len > 2 => 2,
            len if len < self.status_len => {
                return Err(Error::InvalidResponse {
                    expected: self.status_len,
                    got: len,
                })
            }
            _ => self.status_len,
        };
        let status = data.split_off(data.len() - status_len);

        if status[0] != 0 {
            if status[1] == ROM_INVALID_RECV_MSG {
                return Err(Error::UnsupportedCommand(ty));
            }
            return Err(RomError::new(ty, status[1]).into());
        }

        if data.is_empty() {
            Ok(CommandResponseValue::ValueU32(response.value))
        } else {
            Ok(CommandResponseValue::Vector(data))
        }
    }

    /// Read a register command with a timeout
    pub async fn read_reg(&mut self, reg: u32) -> Result<u32, Error> {
        self.command(Command::ReadReg { address: reg })
            .await?
            .try_into()
    }

    /// Write a register command with a timeout
    pub async fn write_reg(&mut self, addr: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.command(Command::WriteReg {
            address: addr,
            value,
            mask,
        })
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::TimedOutCommand;

    /// Replays canned bytes and records what was written
    #[derive(Default)]
    struct Replay {
        rx: VecDeque<u8>,
        written: Vec<Vec<u8>>,
        queued: Vec<Vec<u8>>,
    }

    impl Replay {
        /// Frames become readable once the next packet is written
        fn reply(mut self, frame: &[u8]) -> Self {
            self.queued.push(slip::encode(frame));
            self
        }

        fn noise(mut self, bytes: &[u8]) -> Self {
            self.queued.push(bytes.to_vec());
            self
        }
    }

    impl Transport for Replay {
        async fn write(&mut self, data: &[u8]) -> Result<(), Error> {
            self.written.push(data.to_vec());
            for chunk in self.queued.drain(..) {
                self.rx.extend(chunk);
            }
            Ok(())
        }

        async fn read_byte(&mut self, _timeout: Duration) -> Result<u8, Error> {
            self.rx.pop_front().ok_or(Error::Connection(ConnectionError::Timeout(
                TimedOutCommand::default(),
            )))
        }

        fn discard_input(&mut self) {
            self.rx.clear();
        }

        async fn set_baud(&mut self, _baud: u32) -> Result<(), Error> {
            Ok(())
        }

        fn baud(&self) -> u32 {
            ESP_ROM_BAUD
        }

        async fn reset_to_bootloader(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    fn response(op: u8, value: u32, data: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x01, op];
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes());
        frame.extend_from_slice(&value.to_le_bytes());
        frame.extend_from_slice(data);
        frame
    }

    #[tokio::test]
    async fn send_frames_the_packet() {
        let mut connection = Connection::new(Replay::default());
        connection.send(0x0a, &[0xc0, 0, 0, 0x40], 0).await.unwrap();

        let written = &connection.transport().written[0];
        assert_eq!(
            written,
            &vec![0xc0, 0x00, 0x0a, 4, 0, 0, 0, 0, 0, 0xdb, 0xdc, 0, 0, 0x40, 0xc0]
        );
    }

    #[tokio::test]
    async fn oversized_payloads_are_not_sent() {
        let mut connection = Connection::new(Replay::default());
        let payload = vec![0; 0x1_0000];

        let err = connection.send(0x07, &payload, 0).await.unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(0x1_0000)));

        let err = connection
            .write_command(Command::MemData {
                data: &payload[..0xfff8],
                sequence: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(0x1_0008)));

        assert!(connection.transport().written.is_empty());
    }

    #[tokio::test]
    async fn skips_stray_and_short_frames() {
        let replay = Replay::default()
            .noise(b"garbage")
            .reply(&[0x01, 0x0a])
            .reply(&response(0x08, 0, &[0, 0, 0, 0]))
            .reply(&response(0x0a, 0x1234_5678, &[0, 0, 0, 0]));
        let mut connection = Connection::new(replay);

        let value = connection.read_reg(0x4000_1000).await.unwrap();
        assert_eq!(value, 0x1234_5678);
    }

    #[tokio::test]
    async fn strips_status_by_session_policy() {
        let payload = [0xaa, 0xbb, 0xcc, 0xdd, 0x00, 0x00, 0x00, 0x00];

        let mut connection =
            Connection::new(Replay::default().reply(&response(0x13, 0, &payload)));
        connection.set_status_len(2);
        let data = connection
            .execute(CommandType::FlashMd5, &[], 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            data,
            CommandResponseValue::Vector(vec![0xaa, 0xbb, 0xcc, 0xdd, 0x00, 0x00])
        );

        let mut connection =
            Connection::new(Replay::default().reply(&response(0x13, 0, &payload)));
        connection.set_status_len(4);
        let data = connection
            .execute(CommandType::FlashMd5, &[], 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            data,
            CommandResponseValue::Vector(vec![0xaa, 0xbb, 0xcc, 0xdd])
        );
    }

    #[tokio::test]
    async fn failed_status_is_a_rom_error() {
        let replay = Replay::default().reply(&response(0x03, 0, &[0x01, 0xc1, 0, 0]));
        let mut connection = Connection::new(replay);

        let err = connection
            .execute(CommandType::FlashData, &[], 0, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            Error::RomError(err) => {
                assert_eq!(err.command(), CommandType::FlashData);
                assert_eq!(err.raw_code(), 0xc1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_message_status_is_unsupported_command() {
        let replay = Replay::default().reply(&response(0xd0, 0, &[0x01, 0x05, 0, 0]));
        let mut connection = Connection::new(replay);

        let err = connection
            .command(Command::EraseFlash)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedCommand(CommandType::EraseFlash)
        ));
    }

    #[tokio::test]
    async fn rejection_under_another_opcode_fails_fast() {
        // Some ROMs answer unknown opcodes with a generic failure frame.
        let replay = Replay::default().reply(&response(0x00, 0, &[0x01, 0x05]));
        let mut connection = Connection::new(replay);
        let err = connection
            .command(Command::EraseRegion {
                offset: 0,
                size: 0x1000,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedCommand(CommandType::EraseRegion)
        ));
    }

    #[tokio::test]
    async fn silence_is_a_timeout_for_the_command() {
        let mut connection = Connection::new(Replay::default());

        let err = connection.read_reg(0).await.unwrap_err();
        match err {
            Error::Connection(ConnectionError::Timeout(cmd)) => {
                assert_eq!(cmd.command(), Some(CommandType::ReadReg));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn gives_up_after_bounded_stray_frames() {
        let mut replay = Replay::default();
        for _ in 0..MAX_RESPONSE_ATTEMPTS {
            replay = replay.reply(&response(0x08, 0, &[0, 0, 0, 0]));
        }
        replay = replay.reply(&response(0x0a, 7, &[0, 0, 0, 0]));
        let mut connection = Connection::new(replay);

        let err = connection.read_reg(0).await.unwrap_err();
        assert!(matches!(err, Error::ResponseMismatch(CommandType::ReadReg)));
    }
}
