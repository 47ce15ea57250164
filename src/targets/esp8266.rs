use super::{ChipDescriptor, SpiRegisters};
use crate::{error::Error, targets::Chip};

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0xfff0_c101];

/// Header codes, including the two "-c1" layouts used by some modules
const FLASH_SIZES: &[(&str, u8)] = &[
    ("512KB", 0x00),
    ("256KB", 0x10),
    ("1MB", 0x20),
    ("2MB", 0x30),
    ("4MB", 0x40),
    ("2MB-c1", 0x50),
    ("4MB-c1", 0x60),
    ("8MB", 0x80),
    ("16MB", 0x90),
];

/// Espressif's original OUI
const OUI_18FE34: [u8; 3] = [0x18, 0xfe, 0x34];
const OUI_ACD074: [u8; 3] = [0xac, 0xd0, 0x74];

pub(super) static DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    chip: Chip::Esp8266,
    name: "ESP8266",
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    efuse_base: 0x3ff0_0050,
    spi_registers: SpiRegisters {
        base: 0x6000_0200,
        usr_offset: 0x1c,
        usr1_offset: 0x20,
        usr2_offset: 0x24,
        w0_offset: 0x40,
        mosi_length_offset: None,
        miso_length_offset: None,
    },
    stub_key: "esp8266",
    flash_sizes: FLASH_SIZES,
    ram_block_size: 0x1800,
    rom_status_len: 2,
    rom_spi_attach: false,
    spi_set_params: false,
    rom_encrypted_begin: false,
    baud_change: false,
    rom_erase_workaround: true,
};

/// The ESP8285 has the flash die in package, flagged in the eFuses
pub(super) fn is_esp8285([word0, _, word2, _]: [u32; 4]) -> bool {
    word0 & (1 << 4) != 0 || word2 & (1 << 16) != 0
}

pub(super) fn mac_address(efuses: [u32; 4]) -> Result<[u8; 6], Error> {
    let [word0, word1, _, word3] = efuses;

    // First determine the OUI portion of the MAC address
    let oui = if word3 != 0 {
        let [_, a, b, c] = word3.to_be_bytes();
        [a, b, c]
    } else {
        match (word1 >> 16) & 0xff {
            0 => OUI_18FE34,
            1 => OUI_ACD074,
            _ => return Err(Error::UnknownOui(efuses)),
        }
    };

    // Add the remaining NIC portion of the MAC address
    let [_, _, d, e] = word1.to_be_bytes();
    let [f, ..] = word0.to_be_bytes();

    Ok([oui[0], oui[1], oui[2], d, e, f])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oui_from_third_word() {
        let mac = mac_address([0xaa00_0000, 0x0000_bbcc, 0, 0x0012_3456]).unwrap();
        assert_eq!(mac, [0x12, 0x34, 0x56, 0xbb, 0xcc, 0xaa]);
    }

    #[test]
    fn oui_from_discriminant() {
        let mac = mac_address([0x0100_0000, 0x0000_0203, 0, 0]).unwrap();
        assert_eq!(mac, [0x18, 0xfe, 0x34, 0x02, 0x03, 0x01]);

        let mac = mac_address([0x0100_0000, 0x0001_0203, 0, 0]).unwrap();
        assert_eq!(mac, [0xac, 0xd0, 0x74, 0x02, 0x03, 0x01]);
    }

    #[test]
    fn undocumented_discriminant_is_an_error() {
        let efuses = [0, 0x0002_0000, 0, 0];
        assert!(matches!(
            mac_address(efuses),
            Err(Error::UnknownOui(words)) if words == efuses
        ));
    }

    #[test]
    fn esp8285_sku_bits() {
        assert!(!is_esp8285([0, 0, 0, 0]));
        assert!(is_esp8285([1 << 4, 0, 0, 0]));
        assert!(is_esp8285([0, 0, 1 << 16, 0]));
        assert_eq!(Chip::Esp8266.name([0, 0, 1 << 16, 0]).unwrap(), "ESP8285");
        assert_eq!(Chip::Esp8266.name([0; 4]).unwrap(), "ESP8266EX");
    }
}
