use super::{spi_registers, ChipDescriptor, ESP32_FLASH_SIZES};
use crate::targets::Chip;

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[
    0x6921_506f, // ECO1 + ECO2
    0x1b31_506f, // ECO3
    0x4881_606f, // ECO6
];

pub(super) static DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    chip: Chip::Esp32c3,
    name: "ESP32-C3",
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    efuse_base: 0x6000_8844,
    spi_registers: spi_registers(0x6000_2000),
    stub_key: "esp32c3",
    flash_sizes: ESP32_FLASH_SIZES,
    ram_block_size: 0x800,
    rom_status_len: 4,
    rom_spi_attach: true,
    spi_set_params: false,
    rom_encrypted_begin: true,
    baud_change: true,
    rom_erase_workaround: false,
};
