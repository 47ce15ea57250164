//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
    ops::Range,
};

use miette::Diagnostic;
use strum::VariantNames;
use thiserror::Error;

use crate::{connection::command::CommandType, targets::Chip};

/// All possible errors returned by esploader
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Unrecognized magic value: {0:#x}")]
    #[diagnostic(
        code(esploader::chip_detect_error),
        help("Supported chips are: {}\n\
              If your chip is supported, try hard-resetting the device and try again",
             Chip::VARIANTS.join(", "))
    )]
    ChipDetectError(u32),

    #[error("The {0} has no entry in the chip registry")]
    #[diagnostic(code(esploader::unsupported_chip))]
    UnsupportedChip(Chip),

    #[error("Unknown OUI, efuse words: {0:08x?}")]
    #[diagnostic(
        code(esploader::unknown_oui),
        help("The factory MAC efuses hold a pattern that is not documented for this chip")
    )]
    UnknownOui([u32; 4]),

    #[error("The chip has not been detected yet")]
    #[diagnostic(code(esploader::chip_not_detected))]
    ChipNotDetected,

    #[error("The efuses have not been read yet")]
    #[diagnostic(code(esploader::efuses_not_read))]
    EfusesNotRead,

    #[error("Couldn't sync to the bootloader after {0} attempts")]
    #[diagnostic(
        code(esploader::sync_failed),
        help("Hold the BOOT button, reset the device and try again")
    )]
    SyncFailed(usize),

    #[error("The bootloader rejected the {0} command as unsupported")]
    #[diagnostic(
        code(esploader::unsupported_command),
        help("The command may only be available on another chip family or when the RAM stub is running")
    )]
    UnsupportedCommand(CommandType),

    #[error("No response matching the {0} command was received")]
    #[diagnostic(code(esploader::response_mismatch))]
    ResponseMismatch(CommandType),

    #[error("Unable to change the baud rate to {0}")]
    #[diagnostic(
        code(esploader::baud_change_failed),
        help("Try setting the connection speed from {0} to 115200 and reconnecting")
    )]
    BaudChangeFailed(u32),

    #[error(
        "Flasher stub is resident at {resident:#010x?}, can't load to overlapping address range {load:#010x?}"
    )]
    #[diagnostic(
        code(esploader::overlapping_load_address),
        help("Try changing the binary loading address")
    )]
    OverlappingLoadAddress { resident: Range<u64>, load: Range<u64> },

    #[error("Failed to start the flasher stub, unexpected response: {0:02x?}")]
    #[diagnostic(code(esploader::stub_handshake_failed))]
    StubHandshakeFailed(Vec<u8>),

    #[error("Invalid flasher stub: {0}")]
    #[diagnostic(code(esploader::invalid_stub))]
    InvalidStub(String),

    #[error("SPI flash command too long: {data_len} bytes of data, {read_bits} bits to read")]
    #[diagnostic(
        code(esploader::spi_command_too_long),
        help("At most 64 bytes can be written and 32 bits read back by a single SPI command")
    )]
    SpiCommandTooLong { data_len: usize, read_bits: u32 },

    #[error("Packet payload of {0} bytes does not fit the 16-bit length field")]
    #[diagnostic(code(esploader::payload_too_large))]
    PayloadTooLarge(usize),

    #[error("SPI command did not complete in time")]
    #[diagnostic(code(esploader::spi_timeout))]
    SpiTimeout,

    #[error("This command requires using the RAM stub")]
    #[diagnostic(
        code(esploader::stub_required),
        help("Don't use the `--no-stub` option with the command")
    )]
    StubRequired,

    #[error("The session can no longer be used after a transport failure")]
    #[diagnostic(
        code(esploader::session_faulted),
        help("Reconnect to the device to start a new session")
    )]
    SessionFaulted,

    #[error("The flash size '{0}' is invalid")]
    #[diagnostic(
        code(esploader::invalid_flash_size),
        help("The accepted values are: {:?}", crate::flasher::FlashSize::VARIANTS)
    )]
    InvalidFlashSize(String),

    #[error("Flash chip not supported, unrecognized flash ID: {0:#x}")]
    #[diagnostic(code(esploader::unrecognized_flash))]
    UnsupportedFlash(u8),

    #[error("Error while connecting to device")]
    #[diagnostic(transparent)]
    Connection(#[source] ConnectionError),

    #[error("Communication error while flashing device")]
    #[diagnostic(transparent)]
    Flashing(#[source] ConnectionError),

    #[error("The bootloader returned an error")]
    #[diagnostic(transparent)]
    RomError(#[from] RomError),

    #[error("Verification of flash content failed")]
    #[diagnostic(code(esploader::verify_failed))]
    VerifyFailed,

    #[error("Invalid response length, expected >= {expected}, got {got}")]
    #[diagnostic(code(esploader::invalid_response))]
    InvalidResponse { expected: usize, got: usize },

    #[error("Failed to open file: {0}")]
    FileOpenError(String, #[source] io::Error),

    #[cfg(feature = "cli")]
    #[error("Failed to parse configuration file: {0}")]
    #[diagnostic(code(esploader::invalid_config))]
    InvalidConfig(String, #[source] toml::de::Error),
}

impl Error {
    /// Whether the error means the underlying transport is gone
    pub(crate) fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Error::Connection(err) | Error::Flashing(err) if err.is_fatal()
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.into())
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Connection(err.into())
    }
}

/// Connection-related errors
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Timeout while running {0}command")]
    #[diagnostic(code(esploader::timeout))]
    Timeout(TimedOutCommand),

    #[error("Discarded {0} bytes received outside of a SLIP frame")]
    #[diagnostic(
        code(esploader::slip_header),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    InvalidHeader(usize),

    #[error("Received invalid SLIP escape sequence 0xdb {0:#04x}")]
    #[diagnostic(
        code(esploader::slip_escape),
        help("Try hard-resetting the device and try again, if the error persists your ROM may be corrupted")
    )]
    InvalidEscape(u8),

    #[error("The transport was closed")]
    #[diagnostic(
        code(esploader::disconnected),
        help("Ensure that the device is still connected to the host system")
    )]
    Disconnected,

    #[error("Serial port not found")]
    #[diagnostic(
        code(esploader::device_not_found),
        help("Ensure that the device is connected and your host recognizes the serial adapter")
    )]
    DeviceNotFound,

    #[error("IO error while using the transport: {0}")]
    #[diagnostic(code(esploader::io_error))]
    Io(#[source] io::Error),

    #[cfg(feature = "serialport")]
    #[error("IO error while using serial port: {0}")]
    #[diagnostic(code(esploader::serial_error))]
    Serial(#[source] serialport::Error),
}

impl ConnectionError {
    /// Framing errors, produced by noise on the line rather than by a broken
    /// transport
    pub fn is_framing(&self) -> bool {
        matches!(self, Self::InvalidHeader(_) | Self::InvalidEscape(_))
    }

    pub(crate) fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::Timeout(_) | Self::InvalidHeader(_) | Self::InvalidEscape(_)
        )
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut => ConnectionError::Timeout(TimedOutCommand::default()),
            io::ErrorKind::NotFound => ConnectionError::DeviceNotFound,
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => ConnectionError::Disconnected,
            _ => ConnectionError::Io(err),
        }
    }
}

#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
impl From<serialport::Error> for ConnectionError {
    fn from(err: serialport::Error) -> Self {
        use serialport::ErrorKind;

        match err.kind() {
            ErrorKind::Io(io::ErrorKind::TimedOut) => {
                ConnectionError::Timeout(TimedOutCommand::default())
            }
            ErrorKind::NoDevice => ConnectionError::DeviceNotFound,
            _ => ConnectionError::Serial(err),
        }
    }
}

/// An executed command which has timed out
#[derive(Clone, Debug, Default)]
pub struct TimedOutCommand {
    command: Option<CommandType>,
}

impl TimedOutCommand {
    pub fn command(&self) -> Option<CommandType> {
        self.command
    }
}

impl Display for TimedOutCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.command {
            Some(command) => write!(f, "{} ", command),
            None => Ok(()),
        }
    }
}

impl From<CommandType> for TimedOutCommand {
    fn from(ct: CommandType) -> Self {
        TimedOutCommand { command: Some(ct) }
    }
}

/// Errors originating from a device's ROM functionality
#[derive(Clone, Copy, Debug, Default, Diagnostic, Error, PartialEq, Eq, strum::FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum RomErrorKind {
    #[error("Invalid message received")]
    #[diagnostic(code(esploader::rom::invalid_message))]
    InvalidMessage = 0x05,

    #[error("Bootloader failed to execute command")]
    #[diagnostic(code(esploader::rom::failed))]
    FailedToAct = 0x06,

    #[error("Received message has invalid CRC")]
    #[diagnostic(code(esploader::rom::crc))]
    InvalidCrc = 0x07,

    #[error("Bootloader failed to write to flash")]
    #[diagnostic(code(esploader::rom::flash_write))]
    FlashWriteError = 0x08,

    #[error("Bootloader failed to read from flash")]
    #[diagnostic(code(esploader::rom::flash_read))]
    FlashReadError = 0x09,

    #[error("Invalid length for flash read")]
    #[diagnostic(code(esploader::rom::flash_read_length))]
    FlashReadLengthError = 0x0a,

    #[error("Malformed compressed data received")]
    #[diagnostic(code(esploader::rom::deflate))]
    DeflateError = 0x0b,

    #[error("Bad data length")]
    #[diagnostic(code(esploader::rom::data_len))]
    BadDataLen = 0xc0,

    #[error("Bad data checksum")]
    #[diagnostic(code(esploader::rom::data_crc))]
    BadDataChecksum = 0xc1,

    #[error("Bad block size")]
    #[diagnostic(code(esploader::rom::block_size))]
    BadBlocksize = 0xc2,

    #[error("Invalid command")]
    #[diagnostic(code(esploader::rom::cmd))]
    InvalidCommand = 0xc3,

    #[error("SPI operation failed")]
    #[diagnostic(code(esploader::rom::spi))]
    FailedSpiOp = 0xc4,

    #[error("SPI unlock failed")]
    #[diagnostic(code(esploader::rom::spi_unlock))]
    FailedSpiUnlock = 0xc5,

    #[error("Not in flash mode")]
    #[diagnostic(code(esploader::rom::flash_mode))]
    NotInFlashMode = 0xc6,

    #[error("Error when uncompressing the data")]
    #[diagnostic(code(esploader::rom::inflate))]
    InflateError = 0xc7,

    #[error("Didn't receive enough data")]
    #[diagnostic(code(esploader::rom::not_enough))]
    NotEnoughData = 0xc8,

    #[error("Received too much data")]
    #[diagnostic(code(esploader::rom::too_much_data))]
    TooMuchData = 0xc9,

    #[default]
    #[error("Other")]
    #[diagnostic(code(esploader::rom::other))]
    Other = 0xff,
}

impl From<u8> for RomErrorKind {
    fn from(raw: u8) -> Self {
        Self::from_repr(raw).unwrap_or_default()
    }
}

/// A command which completed with a non-zero status
#[derive(Clone, Copy, Debug, Diagnostic, Error)]
#[error("Error while running {command} command (code {code:#04x})")]
#[non_exhaustive]
pub struct RomError {
    command: CommandType,
    code: u8,
    #[source]
    kind: RomErrorKind,
}

impl RomError {
    pub fn new(command: CommandType, code: u8) -> RomError {
        RomError {
            command,
            code,
            kind: RomErrorKind::from(code),
        }
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    /// The raw error code from the second status byte
    pub fn raw_code(&self) -> u8 {
        self.code
    }

    pub fn kind(&self) -> RomErrorKind {
        self.kind
    }
}

pub(crate) trait ResultExt {
    /// Mark an error as having occurred during the flashing stage
    fn flashing(self) -> Self;
    /// Mark the command from which this error originates
    fn for_command(self, command: CommandType) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn flashing(self) -> Self {
        match self {
            Err(Error::Connection(err)) => Err(Error::Flashing(err)),
            res => res,
        }
    }

    fn for_command(self, command: CommandType) -> Self {
        match self {
            Err(Error::Connection(ConnectionError::Timeout(_))) => {
                Err(Error::Connection(ConnectionError::Timeout(command.into())))
            }
            Err(Error::Flashing(ConnectionError::Timeout(_))) => {
                Err(Error::Flashing(ConnectionError::Timeout(command.into())))
            }
            res => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rom_error_keeps_raw_code() {
        let err = RomError::new(CommandType::FlashData, 0xc1);
        assert_eq!(err.kind(), RomErrorKind::BadDataChecksum);
        assert_eq!(err.raw_code(), 0xc1);

        let err = RomError::new(CommandType::FlashData, 0x42);
        assert_eq!(err.kind(), RomErrorKind::Other);
        assert_eq!(err.raw_code(), 0x42);
    }

    #[test]
    fn rom_errors_forward_their_diagnostic() {
        let err = Error::from(RomError::new(CommandType::FlashData, 0xc1));

        let code = Diagnostic::code(&err).map(|code| code.to_string());
        assert_eq!(code, None);
        assert!(matches!(&err, Error::RomError(rom) if rom.raw_code() == 0xc1));

        let err = Error::SpiTimeout;
        let code = Diagnostic::code(&err).map(|code| code.to_string());
        assert_eq!(code.as_deref(), Some("esploader::spi_timeout"));
    }

    #[test]
    fn timeouts_are_tagged_with_their_command() {
        let res: Result<(), Error> = Err(Error::Connection(ConnectionError::Timeout(
            TimedOutCommand::default(),
        )));

        match res.for_command(CommandType::ReadReg).flashing() {
            Err(Error::Flashing(ConnectionError::Timeout(cmd))) => {
                assert_eq!(cmd.command(), Some(CommandType::ReadReg));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn only_transport_loss_is_fatal() {
        assert!(!ConnectionError::InvalidHeader(3).is_fatal());
        assert!(!ConnectionError::Timeout(TimedOutCommand::default()).is_fatal());
        assert!(ConnectionError::Disconnected.is_fatal());
        assert!(Error::Connection(ConnectionError::Disconnected).is_transport_fault());
        assert!(!Error::SyncFailed(5).is_transport_fault());
    }
}
