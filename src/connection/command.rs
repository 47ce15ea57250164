//! Commands understood by the ROM bootloader and the flasher stub

use std::{io::Write, mem::size_of, time::Duration};

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::{Display, FromRepr};

use crate::{
    error::Error,
    flasher::{SpiAttachParams, SpiSetParams},
};

/// Largest payload the 16-bit length field can describe
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const CHIP_ERASE_TIMEOUT: Duration = Duration::from_secs(600);
/// Longest any single command is allowed to run
pub const MAX_TIMEOUT: Duration = Duration::from_secs(1200);
pub const ERASE_REGION_TIMEOUT_PER_MB: Duration = Duration::from_secs(30);
const ERASE_WRITE_TIMEOUT_PER_MB: Duration = Duration::from_secs(40);
const MD5_TIMEOUT_PER_MB: Duration = Duration::from_secs(8);
pub const MEM_END_ROM_TIMEOUT: Duration = Duration::from_millis(50);
pub const SYNC_TIMEOUT: Duration = Duration::from_millis(100);

/// Input data for SYNC command (36 bytes: 0x07 0x07 0x12 0x20, followed by
/// 32 x 0x55)
pub const SYNC_FRAME: [u8; 36] = [
    0x07, 0x07, 0x12, 0x20, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55, 0x55,
    0x55, 0x55, 0x55, 0x55,
];

/// Seed of the XOR checksum carried by data commands
pub const CHECKSUM_INIT: u8 = 0xEF;

/// Direction byte of a request packet
pub const DIRECTION_REQUEST: u8 = 0x00;
/// Direction byte of a response packet
pub const DIRECTION_RESPONSE: u8 = 0x01;

/// Types of commands that can be sent to a target device
///
/// https://docs.espressif.com/projects/esptool/en/latest/esp32c3/advanced-topics/serial-protocol.html#supported-by-stub-loader-and-rom-loader
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, FromRepr)]
#[non_exhaustive]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    MemBegin = 0x05,
    MemEnd = 0x06,
    MemData = 0x07,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    // Commands supported by the 32-bit chips' bootloaders
    SpiSetParams = 0x0B,
    SpiAttach = 0x0D,
    ChangeBaudrate = 0x0F,
    FlashDeflBegin = 0x10,
    FlashDeflData = 0x11,
    FlashDeflEnd = 0x12,
    FlashMd5 = 0x13,
    // Stub-only commands
    EraseFlash = 0xD0,
    EraseRegion = 0xD1,
}

impl CommandType {
    /// Return a timeout based on the command type
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::EraseFlash => CHIP_ERASE_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }

    /// Return a timeout scaled by the amount of data the command works on
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        match self {
            CommandType::FlashBegin | CommandType::FlashDeflBegin | CommandType::EraseRegion => {
                timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashData | CommandType::FlashDeflData => {
                timeout_per_mb(ERASE_WRITE_TIMEOUT_PER_MB, size)
            }
            CommandType::FlashMd5 => timeout_per_mb(MD5_TIMEOUT_PER_MB, size),
            _ => self.timeout(),
        }
    }

    /// Commands only the flasher stub implements
    pub fn is_stub_only(&self) -> bool {
        matches!(self, CommandType::EraseFlash | CommandType::EraseRegion)
    }
}

/// Scale a per-megabyte timeout to `size` bytes, never going below
/// [DEFAULT_TIMEOUT]
pub fn timeout_per_mb(timeout_per_mb: Duration, size: u32) -> Duration {
    let millis = timeout_per_mb.as_millis() as u64 * size as u64 / 1_000_000;
    std::cmp::max(DEFAULT_TIMEOUT, Duration::from_millis(millis))
}

/// Available commands
#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub enum Command<'a> {
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
        encrypted: bool,
    },
    FlashData {
        data: &'a [u8],
        pad_to: usize,
        pad_byte: u8,
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    MemBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    MemEnd {
        no_entry: bool,
        entry: u32,
    },
    MemData {
        data: &'a [u8],
        sequence: u32,
    },
    Sync,
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    SpiSetParams {
        spi_params: SpiSetParams,
    },
    SpiAttach {
        spi_params: SpiAttachParams,
    },
    ChangeBaudrate {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate ('0' for ROM flasher)
        prior_baud: u32,
    },
    FlashDeflBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
        supports_encryption: bool,
        encrypted: bool,
    },
    FlashDeflData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashDeflEnd {
        reboot: bool,
    },
    FlashMd5 {
        offset: u32,
        size: u32,
    },
    EraseFlash,
    EraseRegion {
        offset: u32,
        size: u32,
    },
}

impl Command<'_> {
    /// Return the command type
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::MemBegin { .. } => CommandType::MemBegin,
            Command::MemData { .. } => CommandType::MemData,
            Command::MemEnd { .. } => CommandType::MemEnd,
            Command::Sync => CommandType::Sync,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiSetParams { .. } => CommandType::SpiSetParams,
            Command::SpiAttach { .. } => CommandType::SpiAttach,
            Command::ChangeBaudrate { .. } => CommandType::ChangeBaudrate,
            Command::FlashDeflBegin { .. } => CommandType::FlashDeflBegin,
            Command::FlashDeflData { .. } => CommandType::FlashDeflData,
            Command::FlashDeflEnd { .. } => CommandType::FlashDeflEnd,
            Command::FlashMd5 { .. } => CommandType::FlashMd5,
            Command::EraseFlash => CommandType::EraseFlash,
            Command::EraseRegion { .. } => CommandType::EraseRegion,
        }
    }

    /// Return a timeout based on the size
    pub fn timeout_for_size(&self, size: u32) -> Duration {
        self.command_type().timeout_for_size(size)
    }

    /// Write the complete, unframed request packet
    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), Error> {
        // Write the Direction and Command Identifier
        writer.write_all(&[DIRECTION_REQUEST, self.command_type() as u8])?;
        match *self {
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
                encrypted,
            }
            | Command::FlashDeflBegin {
                size,
                blocks,
                block_size,
                offset,
                supports_encryption,
                encrypted,
            } => {
                begin_command(
                    writer,
                    BeginParams {
                        size,
                        blocks,
                        block_size,
                        offset,
                        encrypted: u32::from(encrypted),
                    },
                    supports_encryption,
                )?;
            }
            Command::MemBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                begin_command(
                    writer,
                    BeginParams {
                        size,
                        blocks,
                        block_size,
                        offset,
                        encrypted: 0,
                    },
                    false,
                )?;
            }
            Command::FlashData {
                data,
                pad_to,
                pad_byte,
                sequence,
            } => {
                data_command(writer, data, pad_to, pad_byte, sequence)?;
            }
            Command::MemData { data, sequence } | Command::FlashDeflData { data, sequence } => {
                data_command(writer, data, 0, 0, sequence)?;
            }
            Command::FlashEnd { reboot } | Command::FlashDeflEnd { reboot } => {
                // 0 means reboot, 1 means stay in the loader
                write_basic(writer, &u32::from(!reboot).to_le_bytes(), 0)?;
            }
            Command::MemEnd { no_entry, entry } => {
                #[derive(Zeroable, Pod, Copy, Clone)]
                #[repr(C)]
                struct EntryParams {
                    no_entry: u32,
                    entry: u32,
                }
                let params = EntryParams {
                    no_entry: u32::from(no_entry),
                    entry,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::Sync => {
                write_basic(writer, &SYNC_FRAME, 0)?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    address: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    address,
                    value,
                    mask: mask.unwrap_or(0xFFFFFFFF),
                    delay_us: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiSetParams { spi_params } => {
                write_basic(writer, bytes_of(&spi_params), 0)?;
            }
            Command::SpiAttach { spi_params } => {
                write_basic(writer, &spi_params.encode(), 0)?;
            }
            Command::ChangeBaudrate {
                new_baud,
                prior_baud,
            } => {
                write_basic(writer, bytes_of(&[new_baud, prior_baud]), 0)?;
            }
            Command::FlashMd5 { offset, size } => {
                write_basic(writer, bytes_of(&[offset, size, 0, 0]), 0)?;
            }
            Command::EraseFlash => {
                write_basic(writer, &[], 0)?;
            }
            Command::EraseRegion { offset, size } => {
                write_basic(writer, bytes_of(&[offset, size]), 0)?;
            }
        };
        Ok(())
    }

    /// Encode into a byte vector
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut packet = Vec::new();
        self.write(&mut packet)?;
        Ok(packet)
    }
}

/// Write an arbitrary request packet, for opcodes without a [Command] variant
pub fn write_packet<W: Write>(
    mut writer: W,
    opcode: u8,
    data: &[u8],
    checksum: u32,
) -> Result<(), Error> {
    writer.write_all(&[DIRECTION_REQUEST, opcode])?;
    write_basic(writer, data, checksum)
}

/// Write a data array and its checksum to a writer
fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> Result<(), Error> {
    writer.write_all(&length_field(data.len())?)?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

#[derive(Zeroable, Pod, Copy, Clone, Debug)]
#[repr(C)]
struct BeginParams {
    size: u32,
    blocks: u32,
    block_size: u32,
    offset: u32,
    encrypted: u32,
}

/// Write a Begin command to a writer
fn begin_command<W: Write>(
    writer: W,
    params: BeginParams,
    supports_encryption: bool,
) -> Result<(), Error> {
    let bytes = bytes_of(&params);
    let data = if !supports_encryption {
        // Families without the `encrypted` field get the first four words only
        &bytes[..bytes.len() - 4]
    } else {
        bytes
    };
    write_basic(writer, data, 0)
}

/// Write a Data command to a writer
fn data_command<W: Write>(
    mut writer: W,
    block_data: &[u8],
    pad_to: usize,
    pad_byte: u8,
    sequence: u32,
) -> Result<(), Error> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let pad_length = pad_to.saturating_sub(block_data.len());

    let params = BlockParams {
        size: (block_data.len() + pad_length) as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let mut check = checksum(block_data, CHECKSUM_INIT);

    for _ in 0..pad_length {
        check = checksum(&[pad_byte], check);
    }

    let total_length = size_of::<BlockParams>() + block_data.len() + pad_length;
    writer.write_all(&length_field(total_length)?)?;
    writer.write_all(&(u32::from(check).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    for _ in 0..pad_length {
        writer.write_all(&[pad_byte])?;
    }
    Ok(())
}

fn length_field(len: usize) -> Result<[u8; 2], Error> {
    u16::try_from(len)
        .map(u16::to_le_bytes)
        .map_err(|_| Error::PayloadTooLarge(len))
}

/// XOR-fold `data` into `checksum`
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn checksum_of_nothing_is_the_seed() {
        assert_eq!(checksum(&[], CHECKSUM_INIT), 0xEF);
    }

    #[test]
    fn checksum_is_order_independent() {
        let data = [0x01, 0x80, 0xff, 0x3c, 0x00, 0x5a];
        let folded = data.iter().fold(0x12, |acc, b| acc ^ b);
        let mut reversed = data;
        reversed.reverse();

        assert_eq!(checksum(&data, 0x12), folded);
        assert_eq!(checksum(&reversed, 0x12), folded);
    }

    #[test]
    fn sync_packet_layout() {
        let packet = Command::Sync.to_bytes().unwrap();

        assert_eq!(&packet[..8], &[0x00, 0x08, 36, 0, 0, 0, 0, 0]);
        assert_eq!(&packet[8..12], &[0x07, 0x07, 0x12, 0x20]);
        assert!(packet[12..].iter().all(|&b| b == 0x55));
        assert_eq!(packet.len(), 8 + 36);
    }

    #[test]
    fn flash_data_pads_with_erased_bytes() {
        let data = [0x11u8; 0x400 - 3];
        let packet = Command::FlashData {
            data: &data,
            pad_to: 0x400,
            pad_byte: 0xff,
            sequence: 7,
        }
        .to_bytes()
        .unwrap();

        let payload = &packet[8..];
        assert_eq!(payload.len(), 16 + 0x400);
        assert_eq!(&payload[..4], &0x400u32.to_le_bytes());
        assert_eq!(&payload[4..8], &7u32.to_le_bytes());
        assert_eq!(&payload[8..16], &[0; 8]);
        assert_eq!(&payload[16 + data.len()..], &[0xff, 0xff, 0xff]);

        let expected = checksum(&payload[16..], CHECKSUM_INIT);
        assert_eq!(&packet[4..8], &u32::from(expected).to_le_bytes());
    }

    #[test]
    fn length_field_bounds_the_payload() {
        let mut packet = Vec::new();
        write_packet(&mut packet, 0x0a, &[0; MAX_PAYLOAD_LEN], 0).unwrap();
        assert_eq!(&packet[2..4], &[0xff, 0xff]);

        let mut packet = Vec::new();
        let err = write_packet(&mut packet, 0x0a, &[0; MAX_PAYLOAD_LEN + 1], 0).unwrap_err();
        assert!(matches!(err, Error::PayloadTooLarge(0x1_0000)));
    }

    #[test]
    fn mem_data_is_not_padded() {
        let data = [0xaa, 0xbb, 0xcc];
        let packet = Command::MemData {
            data: &data,
            sequence: 1,
        }
        .to_bytes()
        .unwrap();

        assert_eq!(packet.len(), 8 + 16 + 3);
        assert_eq!(&packet[2..4], &19u16.to_le_bytes());
        assert_eq!(
            &packet[4..8],
            &u32::from(0xefu8 ^ 0xaa ^ 0xbb ^ 0xcc).to_le_bytes()
        );
    }

    #[test]
    fn begin_carries_encryption_word_only_when_supported() {
        let begin = |supports_encryption| Command::FlashBegin {
            size: 0x1000,
            blocks: 4,
            block_size: 0x400,
            offset: 0x10000,
            supports_encryption,
            encrypted: true,
        };

        let plain = begin(false).to_bytes().unwrap();
        assert_eq!(plain.len(), 8 + 16);

        let with_flag = begin(true).to_bytes().unwrap();
        assert_eq!(with_flag.len(), 8 + 20);
        assert_eq!(&with_flag[24..], &1u32.to_le_bytes());
    }

    #[test]
    fn mem_end_flags_missing_entry() {
        let packet = Command::MemEnd {
            no_entry: true,
            entry: 0,
        }
        .to_bytes()
        .unwrap();
        assert_eq!(&packet[8..], &[1, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn size_scaled_timeouts() {
        assert_eq!(
            CommandType::FlashBegin.timeout_for_size(1024),
            DEFAULT_TIMEOUT
        );
        assert_eq!(
            CommandType::EraseRegion.timeout_for_size(4_000_000),
            Duration::from_secs(120)
        );
        assert_eq!(CommandType::EraseFlash.timeout(), CHIP_ERASE_TIMEOUT);
    }
}
