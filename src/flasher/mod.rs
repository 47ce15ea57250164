//! Talk to a device's serial bootloader
//!
//! The [Flasher] struct is one session with a connected device: it syncs with
//! the ROM loader, detects the chip, optionally boots the RAM stub and then
//! drives flash and RAM writes through its [Connection].

use std::{ops::Range, str::FromStr, time::Duration};

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use log::{debug, info, warn};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, IntoEnumIterator, VariantNames};
use tokio::time::sleep;

pub use self::stubs::FlashStub;
use crate::{
    connection::{
        command::{Command, CommandType, DIRECTION_RESPONSE, SYNC_TIMEOUT},
        Connection, Framing, Transport,
    },
    error::{ConnectionError, Error, ResultExt as _, RomError},
    targets::{
        flash_target::FlashTarget, format_mac, Chip, ChipDescriptor, FlashProgrammer,
        ProgressCallbacks, RamTarget, Segment, CHIP_DETECT_MAGIC_REG_ADDR,
    },
};

pub mod stubs;

/// Minimum unit of erase
pub const FLASH_SECTOR_SIZE: usize = 0x1000;
/// Flash block size accepted by the ROM loader
pub const FLASH_WRITE_SIZE: usize = 0x400;
/// Flash block size accepted by the stub
pub const STUB_FLASH_WRITE_SIZE: usize = 0x4000;

const SYNC_ATTEMPTS: usize = 5;
/// Replies a single SYNC request produces
const SYNC_POLLS: usize = 8;
const SYNC_BACKOFF: Duration = Duration::from_millis(100);
const BAUD_SETTLE_DELAY: Duration = Duration::from_millis(50);
const ERASE_SETTLE_DELAY: Duration = Duration::from_millis(50);

const EXPECTED_STUB_HANDSHAKE: &[u8] = b"OHAI";
/// MEM_END replies which may still be queued ahead of the stub's greeting
const STALE_HANDSHAKE_FRAMES: usize = 2;
/// The stub greets as soon as it starts
const STUB_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(100);

const SPI_CMD_RDID: u8 = 0x9f;
const SPI_MAX_DATA_LEN: usize = 64;
const SPI_MAX_READ_BITS: u32 = 32;
const SPI_POLL_ATTEMPTS: usize = 10;
/// Start bit of a user-defined transaction in the SPI command register
const SPI_CMD_USR: u32 = 1 << 18;
const SPI_USR2_COMMAND_LEN_SHIFT: u32 = 28;
const SPI_USR1_ADDR_LEN_SHIFT: u32 = 26;
const SPI_USR1_LEGACY_MISO_LEN_SHIFT: u32 = 8;
const SPI_USR1_LEGACY_MOSI_LEN_SHIFT: u32 = 17;

bitflags! {
    /// Phases of a user-defined SPI transaction
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct SpiUsr: u32 {
        const COMMAND = 1 << 31;
        const ADDR = 1 << 30;
        const DUMMY = 1 << 29;
        const MISO = 1 << 28;
        const MOSI = 1 << 27;
    }
}

/// Supported flash sizes
///
/// Note that not all sizes are supported by each target device.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    Hash,
    Display,
    VariantNames,
    EnumIter,
    Serialize,
    Deserialize,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum FlashSize {
    /// 256 KB
    #[strum(serialize = "256KB")]
    #[serde(rename = "256KB")]
    _256Kb,
    /// 512 KB
    #[strum(serialize = "512KB")]
    #[serde(rename = "512KB")]
    _512Kb,
    /// 1 MB
    #[strum(serialize = "1MB")]
    #[serde(rename = "1MB")]
    _1Mb,
    /// 2 MB
    #[strum(serialize = "2MB")]
    #[serde(rename = "2MB")]
    _2Mb,
    /// 4 MB
    #[default]
    #[strum(serialize = "4MB")]
    #[serde(rename = "4MB")]
    _4Mb,
    /// 8 MB
    #[strum(serialize = "8MB")]
    #[serde(rename = "8MB")]
    _8Mb,
    /// 16 MB
    #[strum(serialize = "16MB")]
    #[serde(rename = "16MB")]
    _16Mb,
    /// 32 MB
    #[strum(serialize = "32MB")]
    #[serde(rename = "32MB")]
    _32Mb,
    /// 64 MB
    #[strum(serialize = "64MB")]
    #[serde(rename = "64MB")]
    _64Mb,
}

impl FlashSize {
    /// Create a [FlashSize] from the capacity byte of a JEDEC flash ID
    pub const fn from_detected(value: u8) -> Result<FlashSize, Error> {
        match value {
            0x12 => Ok(FlashSize::_256Kb),
            0x13 => Ok(FlashSize::_512Kb),
            0x14 => Ok(FlashSize::_1Mb),
            0x15 => Ok(FlashSize::_2Mb),
            0x16 => Ok(FlashSize::_4Mb),
            0x17 => Ok(FlashSize::_8Mb),
            0x18 => Ok(FlashSize::_16Mb),
            0x19 => Ok(FlashSize::_32Mb),
            0x1a => Ok(FlashSize::_64Mb),
            _ => Err(Error::UnsupportedFlash(value)),
        }
    }

    /// Returns the flash size in bytes
    pub const fn size(self) -> u32 {
        match self {
            FlashSize::_256Kb => 0x0040000,
            FlashSize::_512Kb => 0x0080000,
            FlashSize::_1Mb => 0x0100000,
            FlashSize::_2Mb => 0x0200000,
            FlashSize::_4Mb => 0x0400000,
            FlashSize::_8Mb => 0x0800000,
            FlashSize::_16Mb => 0x1000000,
            FlashSize::_32Mb => 0x2000000,
            FlashSize::_64Mb => 0x4000000,
        }
    }

    /// Image header encoding of this size for `chip`
    pub fn header_code(self, chip: Chip) -> Result<u8, Error> {
        chip.descriptor()?
            .flash_size_code(&self.to_string())
            .ok_or(Error::InvalidFlashSize(self.to_string()))
    }
}

impl FromStr for FlashSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FlashSize::VARIANTS
            .iter()
            .copied()
            .zip(FlashSize::iter())
            .find(|(name, _)| *name == s.to_uppercase())
            .map(|(_, variant)| variant)
            .ok_or_else(|| Error::InvalidFlashSize(s.to_string()))
    }
}

/// Parameters of the attached SPI flash chip (sizes, etc).
///
/// See: <https://github.com/espressif/esptool/blob/da31d9d/esptool.py#L655>
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
#[repr(C)]
pub struct SpiSetParams {
    /// Flash chip ID
    fl_id: u32,
    /// Total size in bytes
    total_size: u32,
    /// Block size
    block_size: u32,
    /// Sector size
    sector_size: u32,
    /// Page size
    page_size: u32,
    /// Status mask
    status_mask: u32,
}

impl SpiSetParams {
    pub const fn default(size: u32) -> Self {
        SpiSetParams {
            fl_id: 0,
            total_size: size,
            block_size: 64 * 1024,
            sector_size: 4 * 1024,
            page_size: 256,
            status_mask: 0xFFFF,
        }
    }
}

/// Parameters for attaching to a target devices SPI flash
///
/// All zeroes selects the pins configured in the eFuses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SpiAttachParams {
    clk: u8,
    q: u8,
    d: u8,
    hd: u8,
    cs: u8,
}

impl SpiAttachParams {
    /// Encode the parameters as the ROM expects them
    pub fn encode(self) -> Vec<u8> {
        let packed = ((self.hd as u32) << 24)
            | ((self.cs as u32) << 18)
            | ((self.d as u32) << 12)
            | ((self.q as u32) << 6)
            | (self.clk as u32);

        let mut encoded = packed.to_le_bytes().to_vec();
        // Legacy "is legacy mode" word, ignored by current ROMs
        encoded.extend_from_slice(&[0u8; 4]);
        encoded
    }
}

/// What the loader on the other end of a session can do
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// The flasher stub is running instead of the ROM loader
    pub is_stub: bool,
    /// Size of each FLASH_DATA/FLASH_DEFL_DATA block
    pub write_size: usize,
    /// Length of the status trailer of each response
    pub status_len: usize,
    /// ERASE_FLASH and ERASE_REGION are available
    pub direct_erase: bool,
}

impl Capabilities {
    /// Capabilities of a ROM loader using `status_len` byte statuses
    pub const fn rom(status_len: usize) -> Self {
        Capabilities {
            is_stub: false,
            write_size: FLASH_WRITE_SIZE,
            status_len,
            direct_erase: false,
        }
    }

    pub const fn stub() -> Self {
        Capabilities {
            is_stub: true,
            write_size: STUB_FLASH_WRITE_SIZE,
            status_len: 4,
            direct_erase: true,
        }
    }
}

/// Progress of a session through the connection handshake
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum SessionState {
    Disconnected,
    Syncing,
    Synced,
    ChipKnown,
    StubActive,
    /// The transport failed; the session can't be used anymore
    Faulted,
}

/// Information about the connected device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// The chip being used
    pub chip: Chip,
    /// Part name, telling apart SKUs of the same family
    pub name: &'static str,
    /// The total available flash size
    pub flash_size: FlashSize,
    /// MAC address
    pub mac_address: [u8; 6],
    /// Whether the flasher stub is running
    pub stub: bool,
}

/// Connect to and flash a target device
#[derive(Debug)]
pub struct Flasher<T> {
    /// Connection for flash operations
    connection: Connection<T>,
    state: SessionState,
    /// Resolved on first access
    chip: Option<Chip>,
    efuses: Option<[u32; 4]>,
    /// Flash size, assumed until detected
    flash_size: FlashSize,
    capabilities: Capabilities,
    /// The last sync looked like it was answered by a running stub
    stub_detected: bool,
    /// Address ranges occupied by the running stub
    resident: Vec<Range<u64>>,
    /// Compare the flash MD5 with the image after writing it
    verify: bool,
    /// Send images deflated where the loader can inflate them
    compress: bool,
    /// Ask the ROM to encrypt written data
    encrypt: bool,
}

impl<T: Transport> Flasher<T> {
    /// Start a session over `transport` without touching the device
    pub fn new(transport: T) -> Self {
        Flasher {
            connection: Connection::new(transport),
            state: SessionState::Disconnected,
            chip: None,
            efuses: None,
            flash_size: FlashSize::default(),
            capabilities: Capabilities::rom(4),
            stub_detected: false,
            resident: Vec::new(),
            verify: false,
            compress: true,
            encrypt: false,
        }
    }

    /// Reset the device into its bootloader, sync and identify it
    pub async fn connect(transport: T) -> Result<Self, Error> {
        let mut flasher = Flasher::new(transport);

        let result = flasher.connection.transport_mut().reset_to_bootloader().await;
        flasher.track(result)?;
        flasher.sync().await?;
        flasher.detect_chip().await?;
        flasher.read_efuses().await?;

        info!("Connected to {}", flasher.chip_name()?);
        info!("MAC address: {}", format_mac(&flasher.mac_addr()?));

        Ok(flasher)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The chip type that the flasher is connected to, once detected
    pub fn chip(&self) -> Option<Chip> {
        self.chip
    }

    pub fn is_stub(&self) -> bool {
        self.capabilities.is_stub
    }

    /// Whether the last sync was answered the way a running stub answers
    ///
    /// A single reply with a non-zero value field clears this, so a stub may
    /// go unnoticed on a noisy line.
    pub fn stub_detected(&self) -> bool {
        self.stub_detected
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn flash_size(&self) -> FlashSize {
        self.flash_size
    }

    pub fn set_flash_size(&mut self, flash_size: FlashSize) {
        self.flash_size = flash_size;
    }

    /// Verify written images against the flash MD5
    pub fn set_verify(&mut self, verify: bool) {
        self.verify = verify;
    }

    /// Deflate images before sending them, if the loader supports it
    pub fn set_compression(&mut self, compress: bool) {
        self.compress = compress;
    }

    /// Have the ROM encrypt data as it is written, on families supporting it
    pub fn set_encrypted_writes(&mut self, encrypt: bool) {
        self.encrypt = encrypt;
    }

    /// The active connection being used by the flasher
    pub fn connection(&mut self) -> &mut Connection<T> {
        &mut self.connection
    }

    /// End the session, handing back the transport
    pub fn into_transport(self) -> T {
        self.connection.into_transport()
    }

    fn ensure_usable(&self) -> Result<(), Error> {
        if self.state == SessionState::Faulted {
            return Err(Error::SessionFaulted);
        }
        Ok(())
    }

    /// Move to `state` unless the session already got further
    fn advance(&mut self, state: SessionState) {
        if self.state < state {
            self.state = state;
        }
    }

    /// Fault the session if `result` is a lost transport
    fn track<R>(&mut self, result: Result<R, Error>) -> Result<R, Error> {
        if let Err(err) = &result {
            if err.is_transport_fault() {
                warn!("Transport failure, the session is no longer usable: {err}");
                self.state = SessionState::Faulted;
            }
        }
        result
    }

    fn descriptor(&self) -> Result<&'static ChipDescriptor, Error> {
        self.chip.ok_or(Error::ChipNotDetected)?.descriptor()
    }

    /// Synchronize with the loader
    pub async fn sync(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        self.advance(SessionState::Syncing);

        for attempt in 1..=SYNC_ATTEMPTS {
            let result = self.sync_attempt().await;
            match self.track(result) {
                Ok(true) => {
                    debug!("Synced on attempt {attempt}");
                    sleep(SYNC_BACKOFF).await;
                    self.advance(SessionState::Synced);
                    return Ok(());
                }
                Ok(false) => debug!("Sync attempt {attempt} got no answer"),
                Err(err) if err.is_transport_fault() => return Err(err),
                Err(err) => debug!("Sync attempt {attempt} failed: {err}"),
            }

            sleep(SYNC_BACKOFF).await;
        }

        Err(Error::SyncFailed(SYNC_ATTEMPTS))
    }

    /// Send one SYNC and collect the replies it produces
    async fn sync_attempt(&mut self) -> Result<bool, Error> {
        self.connection.write_command(Command::Sync).await?;

        let mut synced = false;
        let mut received = 0;
        let mut timeouts = 0;
        let mut all_zero = true;

        for _ in 0..SYNC_POLLS {
            match self
                .connection
                .receive_with(Some(CommandType::Sync), SYNC_TIMEOUT, Framing::Strict)
                .await
            {
                Ok(response) => {
                    received += 1;
                    all_zero &= response.value == 0;
                    if let [0, 0, ..] = response.data.as_slice() {
                        synced = true;
                    }
                }
                // Slow bridges may only deliver the first replies late
                Err(Error::Connection(ConnectionError::Timeout(_))) => timeouts += 1,
                Err(err) => return Err(err),
            }
        }

        if timeouts > 0 {
            debug!("{timeouts} of {SYNC_POLLS} sync polls timed out");
        }

        // The ROM fills the value field of its replies, the stub leaves it zero
        self.stub_detected = received == SYNC_POLLS && timeouts == 0 && all_zero;

        Ok(synced)
    }

    /// Detect which chip we are connected to
    pub async fn detect_chip(&mut self) -> Result<Chip, Error> {
        self.ensure_usable()?;
        if let Some(chip) = self.chip {
            return Ok(chip);
        }

        let result = self.connection.read_reg(CHIP_DETECT_MAGIC_REG_ADDR).await;
        let magic = self.track(result)?;
        let descriptor = crate::targets::detect(magic)?;
        info!("Detected {}", descriptor.name);

        self.chip = Some(descriptor.chip);
        if !self.capabilities.is_stub {
            self.capabilities = Capabilities::rom(descriptor.rom_status_len);
            self.connection.set_status_len(descriptor.rom_status_len);
        }
        self.advance(SessionState::ChipKnown);

        Ok(descriptor.chip)
    }

    /// Read the four eFuse words holding the MAC, detecting the chip first if
    /// needed
    pub async fn read_efuses(&mut self) -> Result<[u32; 4], Error> {
        let chip = self.detect_chip().await?;
        let descriptor = chip.descriptor()?;

        let mut efuses = [0; 4];
        for (n, word) in efuses.iter_mut().enumerate() {
            let result = self.connection.read_reg(descriptor.efuse_reg(n as u32)).await;
            *word = self.track(result)?;
        }
        debug!("eFuses: {efuses:08x?}");

        self.efuses = Some(efuses);
        Ok(efuses)
    }

    /// The factory MAC address, from the cached eFuses
    pub fn mac_addr(&self) -> Result<[u8; 6], Error> {
        let chip = self.chip.ok_or(Error::ChipNotDetected)?;
        let efuses = self.efuses.ok_or(Error::EfusesNotRead)?;

        chip.mac_address(efuses)
    }

    /// Name of the connected part, from the cached eFuses
    pub fn chip_name(&self) -> Result<&'static str, Error> {
        let chip = self.chip.ok_or(Error::ChipNotDetected)?;
        let efuses = self.efuses.ok_or(Error::EfusesNotRead)?;

        chip.name(efuses)
    }

    pub async fn read_reg(&mut self, addr: u32) -> Result<u32, Error> {
        self.ensure_usable()?;
        let result = self.connection.read_reg(addr).await;
        self.track(result)
    }

    pub async fn write_reg(&mut self, addr: u32, value: u32, mask: Option<u32>) -> Result<(), Error> {
        self.ensure_usable()?;
        let result = self.connection.write_reg(addr, value, mask).await;
        self.track(result)
    }

    /// Change the line speed on both ends
    pub async fn change_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.ensure_usable()?;
        let descriptor = self.descriptor()?;

        if !descriptor.baud_change {
            warn!(
                "The {} loader can't change its baud rate, staying at {}",
                descriptor.name,
                self.connection.baud()
            );
            return Ok(());
        }

        debug!("Change baud to: {}", baud);
        let result = self.set_baud(baud).await;
        self.track(result)
    }

    async fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        // The stub needs its current rate to compute the new divider
        let prior_baud = match self.capabilities.is_stub {
            true => self.connection.baud(),
            false => 0,
        };

        self.connection
            .command(Command::ChangeBaudrate {
                new_baud: baud,
                prior_baud,
            })
            .await
            .map_err(|err| match err {
                err if err.is_transport_fault() => err,
                _ => Error::BaudChangeFailed(baud),
            })?;

        self.connection.set_baud(baud).await?;
        sleep(BAUD_SETTLE_DELAY).await;
        self.connection.transport_mut().discard_input();

        Ok(())
    }

    /// Run a raw command on the SPI flash chip
    ///
    /// At most 64 bytes are sent and 32 bits read back. `addr_len` and
    /// `dummy_len` are in bits; the address phase is skipped when `addr_len`
    /// is zero.
    pub async fn run_spi_flash_command(
        &mut self,
        command: u8,
        data: &[u8],
        read_bits: u32,
        addr: Option<u32>,
        addr_len: u32,
        dummy_len: u32,
    ) -> Result<u32, Error> {
        self.ensure_usable()?;

        if data.len() > SPI_MAX_DATA_LEN || read_bits > SPI_MAX_READ_BITS {
            return Err(Error::SpiCommandTooLong {
                data_len: data.len(),
                read_bits,
            });
        }

        let result = self
            .spi_command(command, data, read_bits, addr, addr_len, dummy_len)
            .await;
        self.track(result)
    }

    async fn spi_command(
        &mut self,
        command: u8,
        data: &[u8],
        read_bits: u32,
        addr: Option<u32>,
        addr_len: u32,
        dummy_len: u32,
    ) -> Result<u32, Error> {
        let spi_registers = &self.descriptor()?.spi_registers;
        let connection = &mut self.connection;

        let old_spi_usr = connection.read_reg(spi_registers.usr()).await?;
        let old_spi_usr2 = connection.read_reg(spi_registers.usr2()).await?;

        let mosi_bits = data.len() as u32 * 8;

        let mut flags = SpiUsr::COMMAND;
        flags.set(SpiUsr::MISO, read_bits > 0);
        flags.set(SpiUsr::MOSI, mosi_bits > 0);
        flags.set(SpiUsr::ADDR, addr_len > 0);
        flags.set(SpiUsr::DUMMY, dummy_len > 0);

        let mut usr1 = 0;
        if dummy_len > 0 {
            usr1 |= dummy_len - 1;
        }
        if addr_len > 0 {
            usr1 |= (addr_len - 1) << SPI_USR1_ADDR_LEN_SHIFT;
        }

        if let (Some(mosi_length), Some(miso_length)) =
            (spi_registers.mosi_length(), spi_registers.miso_length())
        {
            if mosi_bits > 0 {
                connection.write_reg(mosi_length, mosi_bits - 1, None).await?;
            }
            if read_bits > 0 {
                connection.write_reg(miso_length, read_bits - 1, None).await?;
            }
            if usr1 != 0 {
                connection.write_reg(spi_registers.usr1(), usr1, None).await?;
            }
        } else {
            // Data lengths share the USR1 register on the legacy layout
            usr1 |= read_bits.saturating_sub(1) << SPI_USR1_LEGACY_MISO_LEN_SHIFT;
            usr1 |= mosi_bits.saturating_sub(1) << SPI_USR1_LEGACY_MOSI_LEN_SHIFT;
            connection.write_reg(spi_registers.usr1(), usr1, None).await?;
        }

        connection
            .write_reg(spi_registers.usr(), flags.bits(), None)
            .await?;
        connection
            .write_reg(
                spi_registers.usr2(),
                (7 << SPI_USR2_COMMAND_LEN_SHIFT) | command as u32,
                None,
            )
            .await?;

        if let (Some(addr), true) = (addr, addr_len > 0) {
            connection.write_reg(spi_registers.addr(), addr, None).await?;
        }

        if data.is_empty() {
            connection.write_reg(spi_registers.w0(), 0, None).await?;
        } else {
            for (i, bytes) in data.chunks(4).enumerate() {
                let mut word = [0; 4];
                word[..bytes.len()].copy_from_slice(bytes);
                connection
                    .write_reg(
                        spi_registers.w0() + 4 * i as u32,
                        u32::from_le_bytes(word),
                        None,
                    )
                    .await?;
            }
        }

        connection
            .write_reg(spi_registers.cmd(), SPI_CMD_USR, None)
            .await?;

        let mut done = false;
        for _ in 0..SPI_POLL_ATTEMPTS {
            if connection.read_reg(spi_registers.cmd()).await? & SPI_CMD_USR == 0 {
                done = true;
                break;
            }
        }
        if !done {
            return Err(Error::SpiTimeout);
        }

        let result = connection.read_reg(spi_registers.w0()).await?;
        connection
            .write_reg(spi_registers.usr(), old_spi_usr, None)
            .await?;
        connection
            .write_reg(spi_registers.usr2(), old_spi_usr2, None)
            .await?;

        Ok(result)
    }

    /// JEDEC ID of the attached flash chip
    pub async fn flash_id(&mut self) -> Result<u32, Error> {
        self.run_spi_flash_command(SPI_CMD_RDID, &[], 24, None, 0, 0)
            .await
    }

    /// Read the flash size from the flash ID and use it for this session
    pub async fn detect_flash_size(&mut self) -> Result<FlashSize, Error> {
        let flash_id = self.flash_id().await?;
        let size_id = (flash_id >> 16) as u8;

        let flash_size = match FlashSize::from_detected(size_id) {
            Ok(size) => size,
            Err(_) => {
                warn!(
                    "Could not detect flash size (FlashID=0x{:02X}, SizeID=0x{:02X}), defaulting to {}",
                    flash_id, size_id, self.flash_size
                );
                self.flash_size
            }
        };

        self.flash_size = flash_size;
        Ok(flash_size)
    }

    /// Read and print any information we can about the connected device
    pub async fn device_info(&mut self) -> Result<DeviceInfo, Error> {
        let chip = self.detect_chip().await?;
        if self.efuses.is_none() {
            self.read_efuses().await?;
        }

        Ok(DeviceInfo {
            chip,
            name: self.chip_name()?,
            flash_size: self.flash_size,
            mac_address: self.mac_addr()?,
            stub: self.capabilities.is_stub,
        })
    }

    /// MD5 of a flash region, as computed by the device
    pub async fn checksum_md5(&mut self, offset: u32, size: u32) -> Result<[u8; 16], Error> {
        self.ensure_usable()?;
        let result = self.flash_md5(offset, size).await;
        self.track(result)
    }

    async fn flash_md5(&mut self, offset: u32, size: u32) -> Result<[u8; 16], Error> {
        let response = self
            .connection
            .command_raw(
                Command::FlashMd5 { offset, size },
                CommandType::FlashMd5.timeout_for_size(size),
            )
            .await?;

        // The ROM answers with 32 hex digits, the stub with 16 raw bytes; the
        // status follows either way.
        let data = response.data;
        let (digest, status) = if data.len() >= 34 {
            let (hex, status) = data.split_at(32);
            (decode_hex_digest(hex)?, status)
        } else if data.len() >= 18 {
            let (raw, status) = data.split_at(16);
            let mut digest = [0; 16];
            digest.copy_from_slice(raw);
            (digest, status)
        } else {
            return Err(Error::InvalidResponse {
                expected: 18,
                got: data.len(),
            });
        };

        if status[0] != 0 {
            return Err(RomError::new(CommandType::FlashMd5, status[1]).into());
        }

        Ok(digest)
    }

    fn require_loader_support(&self, command: CommandType) -> Result<(), Error> {
        if command.is_stub_only() && !self.capabilities.direct_erase {
            return Err(Error::StubRequired);
        }
        Ok(())
    }

    /// Erase the entire flash
    pub async fn erase_flash(&mut self) -> Result<(), Error> {
        self.ensure_usable()?;
        self.require_loader_support(CommandType::EraseFlash)?;

        info!("Erasing the entire flash");
        let started = tokio::time::Instant::now();
        let result = self.connection.command(Command::EraseFlash).await;
        self.track(result)?;
        info!("Chip erase completed in {:.2?}", started.elapsed());

        sleep(ERASE_SETTLE_DELAY).await;
        self.connection.transport_mut().discard_input();

        Ok(())
    }

    /// Erase `size` bytes of flash starting at `offset`
    pub async fn erase_region(&mut self, offset: u32, size: u32) -> Result<(), Error> {
        self.ensure_usable()?;
        self.require_loader_support(CommandType::EraseRegion)?;

        debug!("Erasing region of 0x{:x}B at 0x{:08x}", size, offset);
        let command = Command::EraseRegion { offset, size };
        let result = self
            .connection
            .command_with_timeout(command, command.timeout_for_size(size))
            .await;
        self.track(result)?;

        sleep(ERASE_SETTLE_DELAY).await;
        self.connection.transport_mut().discard_input();

        Ok(())
    }

    /// Write a binary image to flash at `offset`
    pub async fn write_image(
        &mut self,
        data: &[u8],
        offset: u32,
        progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        self.write_segments(&[Segment::new(offset, data)], false, progress)
            .await?;

        info!("Binary successfully written to flash!");
        Ok(())
    }

    /// Write several images to flash, rebooting into them afterwards if asked
    pub async fn write_segments(
        &mut self,
        segments: &[Segment<'_>],
        reboot: bool,
        progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        self.ensure_usable()?;
        self.detect_chip().await?;

        let result = self.flash_segments(segments, reboot, progress).await;
        self.track(result.flashing())
    }

    async fn flash_segments(
        &mut self,
        segments: &[Segment<'_>],
        reboot: bool,
        mut progress: Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let mut target =
            FlashProgrammer::new(self.descriptor()?, self.capabilities, self.flash_size)
                .compress(self.compress)
                .encrypted(self.encrypt);

        for segment in segments {
            target
                .write_segment(&mut self.connection, segment.borrow(), &mut progress)
                .await?;
        }

        // Verify before leaving the loader
        if self.verify {
            for segment in segments {
                self.verify_segment(segment).await?;
            }
        }

        target.finish(&mut self.connection, reboot).await
    }

    async fn verify_segment(&mut self, segment: &Segment<'_>) -> Result<(), Error> {
        let expected: [u8; 16] = Md5::digest(&segment.data).into();
        let actual = self
            .flash_md5(segment.addr, segment.data.len() as u32)
            .await?;

        if expected != actual {
            return Err(Error::VerifyFailed);
        }

        debug!("Verified {} bytes at {:#010x}", segment.data.len(), segment.addr);
        Ok(())
    }

    /// Load segments into RAM and jump to `entry`, or just leave the loader if
    /// it is zero
    pub async fn load_ram(&mut self, segments: &[Segment<'_>], entry: u32) -> Result<(), Error> {
        self.ensure_usable()?;
        self.detect_chip().await?;

        let result = self.load_segments(segments, entry).await;
        self.track(result.flashing())
    }

    async fn load_segments(&mut self, segments: &[Segment<'_>], entry: u32) -> Result<(), Error> {
        let mut target = RamTarget::new(Some(entry), self.descriptor()?.ram_block_size);
        if self.capabilities.is_stub {
            target = target.through_stub(self.resident.clone());
        }

        // Nothing may be sent if any of the segments would hit the stub
        for segment in segments {
            target.check_overlap(segment)?;
        }

        for segment in segments.iter().filter(|segment| !segment.data.is_empty()) {
            target
                .write_segment(&mut self.connection, segment.borrow(), &mut None)
                .await?;
        }

        target.finish(&mut self.connection, true).await
    }

    /// Boot the flasher stub, returning the upgraded session
    ///
    /// When the last sync suggested a stub is already running, the upload is
    /// skipped.
    pub async fn run_stub(mut self, stub: &FlashStub) -> Result<Self, Error> {
        self.ensure_usable()?;
        let chip = self.detect_chip().await?;

        if self.capabilities.is_stub {
            return Ok(self);
        }

        if self.stub_detected {
            info!("Flasher stub is already running");
        } else {
            debug!("Loading flash stub for chip: {:?}", chip);
            let result = self.upload_stub(stub).await;
            self.track(result)?;
            info!("Stub running");
        }

        self.capabilities = Capabilities::stub();
        self.connection.set_status_len(self.capabilities.status_len);
        self.resident = stub.resident_ranges();
        self.advance(SessionState::StubActive);

        Ok(self)
    }

    async fn upload_stub(&mut self, stub: &FlashStub) -> Result<(), Error> {
        let (text_addr, text) = stub.text();
        let (data_addr, data) = stub.data();
        let segments = [Segment::new(text_addr, text), Segment::new(data_addr, data)];

        debug!("Write {} byte stub text", text.len());
        debug!("Write {} byte stub data", data.len());
        self.load_segments(&segments, stub.entry())
            .await
            .flashing()?;

        self.read_stub_handshake().await
    }

    async fn read_stub_handshake(&mut self) -> Result<(), Error> {
        for _ in 0..=STALE_HANDSHAKE_FRAMES {
            let frame = self
                .connection
                .read_frame(STUB_HANDSHAKE_TIMEOUT)
                .await?;

            if frame == EXPECTED_STUB_HANDSHAKE {
                return Ok(());
            }

            let late_mem_end = matches!(
                frame.as_slice(),
                [DIRECTION_RESPONSE, op, ..] if *op == CommandType::MemEnd as u8
            );
            if !late_mem_end {
                return Err(Error::StubHandshakeFailed(frame));
            }
            debug!("Skipping late MEM_END response");
        }

        Err(Error::StubHandshakeFailed(Vec::new()))
    }

    /// Reset the device and let it boot from flash
    pub async fn hard_reset(&mut self) -> Result<(), Error> {
        let result = self.connection.transport_mut().hard_reset().await;
        self.track(result)
    }
}

/// Parse the ASCII hex digest the ROM returns for SPI_FLASH_MD5
fn decode_hex_digest(hex: &[u8]) -> Result<[u8; 16], Error> {
    let invalid = || Error::InvalidResponse {
        expected: 32,
        got: hex.len(),
    };

    let mut digest = [0; 16];
    for (byte, pair) in digest.iter_mut().zip(hex.chunks_exact(2)) {
        let pair = std::str::from_utf8(pair).map_err(|_| invalid())?;
        *byte = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
    }

    Ok(digest)
}
