use super::{spi_registers, ChipDescriptor, ESP32_FLASH_SIZES};
use crate::targets::Chip;

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[0x0000_07c6];

pub(super) static DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    chip: Chip::Esp32s2,
    name: "ESP32-S2",
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    efuse_base: 0x3f41_a044,
    spi_registers: spi_registers(0x3f40_2000),
    stub_key: "esp32s2",
    flash_sizes: ESP32_FLASH_SIZES,
    ram_block_size: 0x800,
    rom_status_len: 4,
    rom_spi_attach: true,
    spi_set_params: false,
    rom_encrypted_begin: true,
    baud_change: true,
    rom_erase_workaround: false,
};
