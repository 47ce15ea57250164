use super::{ChipDescriptor, SpiRegisters, ESP32_FLASH_SIZES};
use crate::targets::Chip;

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x00f0_1d83];

pub(super) static DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    chip: Chip::Esp32,
    name: "ESP32",
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    efuse_base: 0x3ff5_a000,
    spi_registers: SpiRegisters {
        base: 0x3ff4_2000,
        usr_offset: 0x1c,
        usr1_offset: 0x20,
        usr2_offset: 0x24,
        w0_offset: 0x80,
        mosi_length_offset: Some(0x28),
        miso_length_offset: Some(0x2c),
    },
    stub_key: "esp32",
    flash_sizes: ESP32_FLASH_SIZES,
    ram_block_size: 0x800,
    rom_status_len: 4,
    rom_spi_attach: true,
    spi_set_params: true,
    rom_encrypted_begin: false,
    baud_change: true,
    rom_erase_workaround: false,
};

/// The factory MAC spans eFuse words 1 and 2 of block 0
pub(super) fn mac_address([_, word1, word2, _]: [u32; 4]) -> [u8; 6] {
    let [_, _, b0, b1] = word2.to_be_bytes();
    let [b2, b3, b4, b5] = word1.to_be_bytes();

    [b0, b1, b2, b3, b4, b5]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_layout() {
        let efuses = [0xffff_ffff, 0xc400_0102, 0x0000_240a, 0];
        assert_eq!(mac_address(efuses), [0x24, 0x0a, 0xc4, 0x00, 0x01, 0x02]);
        assert_eq!(
            Chip::Esp32.mac_address(efuses).unwrap(),
            [0x24, 0x0a, 0xc4, 0x00, 0x01, 0x02]
        );
    }
}
