use super::{spi_registers, ChipDescriptor, ESP32_FLASH_SIZES};
use crate::targets::Chip;

const CHIP_DETECT_MAGIC_VALUES: &[u32] = &[
    0x0000_0009,
    0xeb00_4136, // beta2
];

pub(super) static DESCRIPTOR: ChipDescriptor = ChipDescriptor {
    chip: Chip::Esp32s3,
    name: "ESP32-S3",
    magic_values: CHIP_DETECT_MAGIC_VALUES,
    efuse_base: 0x6000_7044,
    spi_registers: spi_registers(0x6000_2000),
    stub_key: "esp32s3",
    flash_sizes: ESP32_FLASH_SIZES,
    ram_block_size: 0x800,
    rom_status_len: 4,
    rom_spi_attach: true,
    spi_set_params: false,
    rom_encrypted_begin: true,
    baud_change: true,
    rom_erase_workaround: false,
};
