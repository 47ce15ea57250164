use std::{io::Write, time::Duration};

use flate2::{
    write::{ZlibDecoder, ZlibEncoder},
    Compression,
};
use log::{debug, info};
use tokio::time::Instant;

use super::{percent_done, FlashTarget, ProgressCallbacks, Segment};
use crate::{
    connection::{
        command::{
            timeout_per_mb, Command, CommandType, DEFAULT_TIMEOUT, ERASE_REGION_TIMEOUT_PER_MB,
        },
        Connection, Transport,
    },
    error::Error,
    flasher::{Capabilities, FlashSize, SpiAttachParams, SpiSetParams, FLASH_SECTOR_SIZE},
    targets::ChipDescriptor,
};

/// Sectors erased together by the legacy ROM's erase routine
const FLASH_SECTORS_PER_BLOCK: u32 = 16;

/// Erased state of NOR flash, used to pad partial blocks
const ERASED_BYTE: u8 = 0xff;

/// Erase size to request from a ROM which erases whole blocks
///
/// The ESP8266 ROM erases everything up to the end of the 64 KiB block
/// containing the start of the region, and then the requested size again from
/// there. Shrinking the request compensates for the head sectors erased by
/// that first pass; small writes straddling a block boundary are rounded up to
/// half their sector count instead.
pub fn rom_erase_size(offset: u32, size: u32) -> u32 {
    let sector_size = FLASH_SECTOR_SIZE as u32;
    let num_sectors = size.div_ceil(sector_size);
    let start_sector = offset / sector_size;

    let head_sectors = (FLASH_SECTORS_PER_BLOCK - start_sector % FLASH_SECTORS_PER_BLOCK)
        .min(num_sectors);

    if num_sectors < 2 * head_sectors {
        (num_sectors + 1).div_ceil(2) * sector_size
    } else {
        (num_sectors - head_sectors) * sector_size
    }
}

/// Writes images into SPI flash with FLASH_* or FLASH_DEFL_* commands
#[derive(Debug)]
pub struct FlashProgrammer {
    descriptor: &'static ChipDescriptor,
    capabilities: Capabilities,
    flash_size: FlashSize,
    compress: bool,
    encrypted: bool,
    need_deflate_end: bool,
    part: usize,
}

impl FlashProgrammer {
    pub fn new(
        descriptor: &'static ChipDescriptor,
        capabilities: Capabilities,
        flash_size: FlashSize,
    ) -> Self {
        FlashProgrammer {
            descriptor,
            capabilities,
            flash_size,
            // The ESP8266 ROM has no inflater
            compress: capabilities.is_stub || !descriptor.rom_erase_workaround,
            encrypted: false,
            need_deflate_end: false,
            part: 0,
        }
    }

    /// Send images deflated, where the loader supports it
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress =
            compress && (self.capabilities.is_stub || !self.descriptor.rom_erase_workaround);
        self
    }

    /// Ask the ROM to encrypt written data
    pub fn encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn write_size(&self) -> usize {
        self.capabilities.write_size
    }

    /// Number of bytes the loader is asked to erase for an uncompressed write
    pub fn erase_size(&self, offset: u32, size: u32) -> u32 {
        if self.descriptor.rom_erase_workaround && !self.capabilities.is_stub {
            rom_erase_size(offset, size)
        } else {
            size
        }
    }

    fn begin_timeout(&self, erase_size: u32) -> Duration {
        if self.capabilities.is_stub {
            DEFAULT_TIMEOUT
        } else {
            timeout_per_mb(ERASE_REGION_TIMEOUT_PER_MB, erase_size)
        }
    }

    fn supports_encryption(&self) -> bool {
        self.descriptor.rom_encrypted_begin && !self.capabilities.is_stub
    }

    /// Make the flash chip accessible to the loader
    async fn attach<T: Transport>(&self, connection: &mut Connection<T>) -> Result<(), Error> {
        // The stub attaches on its own
        if self.descriptor.rom_spi_attach && !self.capabilities.is_stub {
            connection
                .command(Command::SpiAttach {
                    spi_params: SpiAttachParams::default(),
                })
                .await?;
        }

        if self.descriptor.spi_set_params {
            connection
                .command(Command::SpiSetParams {
                    spi_params: SpiSetParams::default(self.flash_size.size()),
                })
                .await?;
        }

        Ok(())
    }

    /// Start an uncompressed write of `size` bytes at `offset`, returning the
    /// number of blocks the loader now expects
    pub async fn begin<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        size: u32,
        offset: u32,
        encrypted: bool,
    ) -> Result<u32, Error> {
        self.attach(connection).await?;

        let write_size = self.write_size() as u32;
        let blocks = size.div_ceil(write_size);
        let erase_size = self.erase_size(offset, size);
        debug!("Flash begin: {size} bytes at {offset:#010x}, erasing {erase_size} bytes");

        connection
            .command_with_timeout(
                Command::FlashBegin {
                    size: erase_size,
                    blocks,
                    block_size: write_size,
                    offset,
                    supports_encryption: self.supports_encryption(),
                    encrypted,
                },
                self.begin_timeout(erase_size),
            )
            .await?;

        Ok(blocks)
    }

    /// Write one block, padded with erased bytes to the write size
    pub async fn write_block<T: Transport>(
        &self,
        connection: &mut Connection<T>,
        data: &[u8],
        sequence: u32,
        timeout: Duration,
    ) -> Result<(), Error> {
        connection
            .command_with_timeout(
                Command::FlashData {
                    data,
                    pad_to: self.write_size(),
                    pad_byte: ERASED_BYTE,
                    sequence,
                },
                timeout,
            )
            .await?;

        Ok(())
    }

    /// Leave flash write mode, optionally rebooting into the new image
    pub async fn end<T: Transport>(
        &self,
        connection: &mut Connection<T>,
        reboot: bool,
    ) -> Result<(), Error> {
        connection.command(Command::FlashEnd { reboot }).await?;
        Ok(())
    }

    /// Start a compressed write
    ///
    /// Blocks are counted in compressed bytes while the erase covers the
    /// uncompressed image; the ROM additionally rounds it up to whole blocks.
    pub async fn defl_begin<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        size: u32,
        compressed_size: u32,
        offset: u32,
        encrypted: bool,
    ) -> Result<u32, Error> {
        self.attach(connection).await?;

        let write_size = self.write_size() as u32;
        let blocks = compressed_size.div_ceil(write_size);
        let erase_size = if self.capabilities.is_stub {
            size
        } else {
            size.div_ceil(write_size) * write_size
        };
        debug!(
            "Deflate begin: {size} bytes ({compressed_size} compressed) at {offset:#010x}, erasing {erase_size} bytes"
        );

        connection
            .command_with_timeout(
                Command::FlashDeflBegin {
                    size: erase_size,
                    blocks,
                    block_size: write_size,
                    offset,
                    supports_encryption: self.supports_encryption(),
                    encrypted,
                },
                self.begin_timeout(erase_size),
            )
            .await?;
        self.need_deflate_end = true;

        Ok(blocks)
    }

    /// Write one block of the compressed stream, unpadded
    pub async fn write_deflated_block<T: Transport>(
        &self,
        connection: &mut Connection<T>,
        data: &[u8],
        sequence: u32,
        timeout: Duration,
    ) -> Result<(), Error> {
        connection
            .command_with_timeout(Command::FlashDeflData { data, sequence }, timeout)
            .await?;

        Ok(())
    }

    /// Finish a compressed write
    ///
    /// The ROM leaves its loader when it receives FLASH_DEFL_END, so it is
    /// only sent there when a reboot was asked for.
    pub async fn defl_end<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        reboot: bool,
    ) -> Result<(), Error> {
        self.need_deflate_end = false;

        if !self.capabilities.is_stub && !reboot {
            debug!("Keeping the ROM loader running, skipping FLASH_DEFL_END");
            return Ok(());
        }

        connection.command(Command::FlashDeflEnd { reboot }).await?;
        Ok(())
    }

    async fn write_raw<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        addr: u32,
        data: &[u8],
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let started = Instant::now();
        let blocks = self
            .begin(connection, data.len() as u32, addr, self.encrypted)
            .await? as usize;
        if !data.is_empty() {
            debug!("Took {:.2?} to erase flash block", started.elapsed());
        }

        if let Some(cb) = progress.as_mut() {
            cb.init(addr, blocks)
        }

        for (i, block) in data.chunks(self.write_size()).enumerate() {
            let timeout = CommandType::FlashData.timeout_for_size(block.len() as u32);
            self.write_block(connection, block, i as u32, timeout)
                .await?;

            if let Some(cb) = progress.as_mut() {
                cb.update(self.part, percent_done(i, blocks))
            }
        }

        if !data.is_empty() {
            info!(
                "Wrote {} bytes at {addr:#010x} in {:.2?}",
                data.len(),
                started.elapsed()
            );
        }

        Ok(())
    }

    async fn write_deflated<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        addr: u32,
        data: &[u8],
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;

        let started = Instant::now();
        let blocks = self
            .defl_begin(
                connection,
                data.len() as u32,
                compressed.len() as u32,
                addr,
                self.encrypted,
            )
            .await? as usize;
        if !data.is_empty() {
            debug!("Took {:.2?} to erase flash block", started.elapsed());
        }

        if let Some(cb) = progress.as_mut() {
            cb.init(addr, blocks)
        }

        // Inflate alongside the device to size each block's timeout by the
        // bytes it will actually write
        let mut decoder = ZlibDecoder::new(Vec::new());
        let mut decoded_size = 0;

        for (i, block) in compressed.chunks(self.write_size()).enumerate() {
            decoder.write_all(block)?;
            decoder.flush()?;
            let size = decoder.get_ref().len() - decoded_size;
            decoded_size = decoder.get_ref().len();

            let timeout = CommandType::FlashDeflData.timeout_for_size(size as u32);
            self.write_deflated_block(connection, block, i as u32, timeout)
                .await?;

            if let Some(cb) = progress.as_mut() {
                cb.update(self.part, percent_done(i, blocks))
            }
        }

        if !data.is_empty() {
            info!(
                "Wrote {} bytes ({} compressed) at {addr:#010x} in {:.2?}",
                data.len(),
                compressed.len(),
                started.elapsed()
            );
        }

        Ok(())
    }
}

impl FlashTarget for FlashProgrammer {
    async fn write_segment<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        segment: Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        if self.compress {
            self.write_deflated(connection, segment.addr, &segment.data, progress)
                .await?;
        } else {
            self.write_raw(connection, segment.addr, &segment.data, progress)
                .await?;
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish(self.part)
        }
        self.part += 1;

        Ok(())
    }

    async fn finish<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        reboot: bool,
    ) -> Result<(), Error> {
        if self.need_deflate_end {
            self.defl_end(connection, reboot).await
        } else {
            self.end(connection, reboot).await
        }
    }
}
