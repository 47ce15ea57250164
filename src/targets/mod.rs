//! Supported target devices
//!
//! Every chip family is described by a static [ChipDescriptor]: how to
//! recognize it, where its eFuses and SPI controller live, and which parts of
//! the bootloader protocol behave differently on it. Only the algorithms which
//! genuinely differ between families (MAC address layout, SKU naming) are
//! dispatched on [Chip] directly.

use strum::{Display, EnumIter, EnumString, VariantNames};

pub use self::flash_target::{FlashProgrammer, ProgressCallbacks, RamTarget, Segment};
use crate::error::Error;

mod esp32;
mod esp32c3;
mod esp32c6;
mod esp32h2;
mod esp32s2;
mod esp32s3;
mod esp8266;

pub mod flash_target;

/// Register holding a per-family magic value, readable from the ROM
pub const CHIP_DETECT_MAGIC_REG_ADDR: u32 = 0x4000_1000;

/// Descriptors of every supported family, in lookup order
static REGISTRY: [&ChipDescriptor; 7] = [
    &esp8266::DESCRIPTOR,
    &esp32::DESCRIPTOR,
    &esp32s2::DESCRIPTOR,
    &esp32s3::DESCRIPTOR,
    &esp32c3::DESCRIPTOR,
    &esp32c6::DESCRIPTOR,
    &esp32h2::DESCRIPTOR,
];

/// All supported devices
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter, EnumString, VariantNames)]
#[non_exhaustive]
#[strum(serialize_all = "lowercase")]
pub enum Chip {
    /// ESP8266, ESP8285
    Esp8266,
    /// ESP32
    Esp32,
    /// ESP32-S2
    Esp32s2,
    /// ESP32-S3
    Esp32s3,
    /// ESP32-C3, ESP8685
    Esp32c3,
    /// ESP32-C6
    Esp32c6,
    /// ESP32-H2
    Esp32h2,
}

impl Chip {
    /// Resolve the family reporting `magic` from [CHIP_DETECT_MAGIC_REG_ADDR]
    pub fn from_magic(magic: u32) -> Result<Self, Error> {
        detect(magic).map(|descriptor| descriptor.chip)
    }

    /// The static description of this family
    pub fn descriptor(&self) -> Result<&'static ChipDescriptor, Error> {
        describe(*self)
    }

    /// Compose the factory MAC address from the four eFuse words read from
    /// [ChipDescriptor::efuse_base]
    pub fn mac_address(&self, efuses: [u32; 4]) -> Result<[u8; 6], Error> {
        match self {
            Chip::Esp8266 => esp8266::mac_address(efuses),
            Chip::Esp32 => Ok(esp32::mac_address(efuses)),
            Chip::Esp32s2 | Chip::Esp32s3 | Chip::Esp32c3 | Chip::Esp32c6 | Chip::Esp32h2 => {
                Ok(mac_from_low_words(efuses))
            }
        }
    }

    /// Marketing name of the connected part
    ///
    /// Only the ESP8266 family ships distinct SKUs which can be told apart
    /// from its eFuses.
    pub fn name(&self, efuses: [u32; 4]) -> Result<&'static str, Error> {
        match self {
            Chip::Esp8266 if esp8266::is_esp8285(efuses) => Ok("ESP8285"),
            Chip::Esp8266 => Ok("ESP8266EX"),
            chip => Ok(chip.descriptor()?.name),
        }
    }
}

/// Find the descriptor whose magic value set contains `magic`
pub fn detect(magic: u32) -> Result<&'static ChipDescriptor, Error> {
    REGISTRY
        .iter()
        .copied()
        .find(|descriptor| descriptor.has_magic_value(magic))
        .ok_or(Error::ChipDetectError(magic))
}

/// Look up the descriptor of `chip`
pub fn describe(chip: Chip) -> Result<&'static ChipDescriptor, Error> {
    REGISTRY
        .iter()
        .copied()
        .find(|descriptor| descriptor.chip == chip)
        .ok_or(Error::UnsupportedChip(chip))
}

/// Immutable description of a chip family
#[derive(Debug)]
pub struct ChipDescriptor {
    pub chip: Chip,
    /// Human readable family name
    pub name: &'static str,
    /// Values of the magic register identifying the family, one per silicon
    /// revision
    pub magic_values: &'static [u32],
    /// Address of the first of the four eFuse words holding the MAC
    pub efuse_base: u32,
    pub spi_registers: SpiRegisters,
    /// Name of the flasher stub image for this family
    pub stub_key: &'static str,
    /// Image header encodings of the supported flash sizes
    pub flash_sizes: &'static [(&'static str, u8)],
    /// RAM upload block size
    pub ram_block_size: usize,
    /// Length of the status trailer in ROM responses
    pub rom_status_len: usize,
    /// The ROM needs SPI_ATTACH before flash can be accessed
    pub rom_spi_attach: bool,
    /// The flash geometry has to be configured with SPI_SET_PARAMS
    pub spi_set_params: bool,
    /// The ROM's FLASH_BEGIN takes a fifth word flagging encrypted writes
    pub rom_encrypted_begin: bool,
    /// The loader implements CHANGE_BAUDRATE
    pub baud_change: bool,
    /// The ROM erases in whole 64 KiB blocks regardless of the requested
    /// offset, and needs a corrected erase size
    pub rom_erase_workaround: bool,
}

impl ChipDescriptor {
    /// Check if the magic value contains the specified value
    pub fn has_magic_value(&self, value: u32) -> bool {
        self.magic_values.contains(&value)
    }

    /// Address of the `n`th eFuse word
    pub fn efuse_reg(&self, n: u32) -> u32 {
        self.efuse_base + n * 0x4
    }

    /// Image header code for a flash size, by name (e.g. `4MB`)
    pub fn flash_size_code(&self, size: &str) -> Option<u8> {
        self.flash_sizes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(size))
            .map(|(_, code)| *code)
    }
}

/// SPI register addresses
#[derive(Debug)]
pub struct SpiRegisters {
    base: u32,
    usr_offset: u32,
    usr1_offset: u32,
    usr2_offset: u32,
    w0_offset: u32,
    mosi_length_offset: Option<u32>,
    miso_length_offset: Option<u32>,
}

impl SpiRegisters {
    pub fn cmd(&self) -> u32 {
        self.base
    }

    pub fn addr(&self) -> u32 {
        self.base + 0x4
    }

    pub fn usr(&self) -> u32 {
        self.base + self.usr_offset
    }

    pub fn usr1(&self) -> u32 {
        self.base + self.usr1_offset
    }

    pub fn usr2(&self) -> u32 {
        self.base + self.usr2_offset
    }

    pub fn w0(&self) -> u32 {
        self.base + self.w0_offset
    }

    /// Data length registers, absent on the legacy layout where lengths are
    /// packed into `usr1`
    pub fn mosi_length(&self) -> Option<u32> {
        self.mosi_length_offset.map(|offset| self.base + offset)
    }

    pub fn miso_length(&self) -> Option<u32> {
        self.miso_length_offset.map(|offset| self.base + offset)
    }
}

/// Header codes shared by the 32-bit families
const ESP32_FLASH_SIZES: &[(&str, u8)] = &[
    ("1MB", 0x00),
    ("2MB", 0x10),
    ("4MB", 0x20),
    ("8MB", 0x30),
    ("16MB", 0x40),
    ("32MB", 0x19),
    ("64MB", 0x1a),
];

/// SPI controller layout of the chips derived from the ESP32-S2
const fn spi_registers(base: u32) -> SpiRegisters {
    SpiRegisters {
        base,
        usr_offset: 0x18,
        usr1_offset: 0x1c,
        usr2_offset: 0x20,
        w0_offset: 0x58,
        mosi_length_offset: Some(0x24),
        miso_length_offset: Some(0x28),
    }
}

/// MAC layout of the families storing it in two consecutive words
fn mac_from_low_words([word0, word1, ..]: [u32; 4]) -> [u8; 6] {
    let [_, _, b0, b1] = word1.to_be_bytes();
    let [b2, b3, b4, b5] = word0.to_be_bytes();

    [b0, b1, b2, b3, b4, b5]
}

/// Format a MAC address as colon-separated hex
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn detects_esp32_from_magic() {
        assert_eq!(Chip::from_magic(0x00f0_1d83).unwrap(), Chip::Esp32);
    }

    #[test]
    fn any_revision_magic_matches() {
        assert_eq!(Chip::from_magic(0x6921_506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x1b31_506f).unwrap(), Chip::Esp32c3);
        assert_eq!(Chip::from_magic(0x0000_0009).unwrap(), Chip::Esp32s3);
        assert_eq!(Chip::from_magic(0xeb00_4136).unwrap(), Chip::Esp32s3);
    }

    #[test]
    fn unknown_magic_is_rejected() {
        assert!(matches!(
            Chip::from_magic(0xdead_beef),
            Err(Error::ChipDetectError(0xdead_beef))
        ));
    }

    #[test]
    fn every_chip_is_registered_once() {
        for chip in Chip::iter() {
            let descriptor = describe(chip).unwrap();
            assert_eq!(descriptor.chip, chip);
            assert_eq!(
                REGISTRY.iter().filter(|d| d.chip == chip).count(),
                1,
                "{chip} registered more than once"
            );
        }
    }

    #[test]
    fn magic_values_are_unambiguous() {
        for descriptor in REGISTRY {
            for magic in descriptor.magic_values {
                assert_eq!(detect(*magic).unwrap().chip, descriptor.chip);
            }
        }
    }

    #[test]
    fn stub_keys_match_chip_names() {
        for chip in Chip::iter() {
            assert_eq!(describe(chip).unwrap().stub_key, chip.to_string());
        }
    }

    #[test]
    fn mac_from_newer_efuse_layout() {
        let efuses = [0x4455_6677, 0x0000_2233, 0, 0];
        assert_eq!(
            Chip::Esp32c3.mac_address(efuses).unwrap(),
            [0x22, 0x33, 0x44, 0x55, 0x66, 0x77]
        );
    }

    #[test]
    fn flash_size_codes_per_family() {
        let esp8266 = describe(Chip::Esp8266).unwrap();
        let esp32 = describe(Chip::Esp32).unwrap();

        assert_eq!(esp8266.flash_size_code("4MB"), Some(0x40));
        assert_eq!(esp8266.flash_size_code("2MB-c1"), Some(0x50));
        assert_eq!(esp32.flash_size_code("4mb"), Some(0x20));
        assert_eq!(esp32.flash_size_code("64MB"), Some(0x1a));
        assert_eq!(esp32.flash_size_code("256KB"), None);
    }

    #[test]
    fn legacy_spi_layout_has_no_length_registers() {
        let regs = &describe(Chip::Esp8266).unwrap().spi_registers;
        assert_eq!(regs.mosi_length(), None);
        assert_eq!(regs.w0(), 0x6000_0240);

        let regs = &describe(Chip::Esp32).unwrap().spi_registers;
        assert_eq!(regs.mosi_length(), Some(0x3ff4_2028));
        assert_eq!(regs.miso_length(), Some(0x3ff4_202c));
    }

    #[test]
    fn mac_formatting() {
        assert_eq!(
            format_mac(&[0x24, 0x0a, 0xc4, 0x00, 0x01, 0xff]),
            "24:0a:c4:00:01:ff"
        );
    }
}
