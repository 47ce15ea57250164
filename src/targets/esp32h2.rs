use super::{spi_registers, ChipDescriptor, ESP32_FLASH_SIZES};
use crate::targets::Chip;

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[
    0xca26_cc22, // beta1
    0xd7b7_3e80, // beta2
];

pub(super) static DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    chip: Chip::Esp32h2,
    name: "ESP32-H2",
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    efuse_base: 0x600b_0844,
    spi_registers: spi_registers(0x6000_3000),
    stub_key: "esp32h2",
    flash_sizes: ESP32_FLASH_SIZES,
    ram_block_size: 0x800,
    rom_status_len: 4,
    rom_spi_attach: true,
    spi_set_params: false,
    rom_encrypted_begin: true,
    baud_change: true,
    rom_erase_workaround: false,
};
