//! Types and functions for the command-line interface
//!
//! No stability guaranties apply

use std::{fs, num::ParseIntError, path::PathBuf};

use clap::Args;
use indicatif::{HumanCount, ProgressBar, ProgressStyle};
use log::{info, warn};
use miette::{IntoDiagnostic, Result, WrapErr};

use self::config::Config;
use crate::{
    connection::{serial::SerialTransport, ESP_ROM_BAUD},
    error::Error,
    flasher::{FlashStub, Flasher},
    targets::{format_mac, ProgressCallbacks},
};

pub mod config;

/// Establish a connection with a target device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ConnectArgs {
    /// Serial port connected to target device
    #[arg(short = 'p', long, env = "ESPLOADER_PORT")]
    pub port: Option<String>,
    /// Baud rate at which to communicate with target device
    #[arg(short = 'b', long, env = "ESPLOADER_BAUD")]
    pub baud: Option<u32>,
    /// Stay with the ROM loader instead of uploading the flasher stub
    #[arg(long)]
    pub no_stub: bool,
    /// Directory holding the flasher stub images
    #[arg(long, env = "ESPLOADER_STUB_DIR")]
    pub stub_dir: Option<PathBuf>,
}

/// Writes a binary file to a specific address in the chip's flash
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct WriteBinArgs {
    /// Address at which to write the binary file
    #[arg(value_parser = parse_u32)]
    pub addr: u32,
    /// File containing the binary data to write
    pub file: PathBuf,
    /// Compare the flash contents with the file after writing
    #[arg(long)]
    pub verify: bool,
    /// Send the image uncompressed
    #[arg(long)]
    pub no_compress: bool,
    /// Have the ROM encrypt the image as it is written
    #[arg(long)]
    pub encrypt: bool,
    /// Connection configuration
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
}

/// Erase part of the flash
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct EraseRegionArgs {
    /// Offset to start erasing from
    #[arg(value_parser = parse_u32)]
    pub addr: u32,
    /// Size of the region to erase
    #[arg(value_parser = parse_u32)]
    pub size: u32,
    /// Connection configuration
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
}

/// Compute the MD5 of a flash region on the device
#[derive(Debug, Args)]
#[non_exhaustive]
pub struct ChecksumMd5Args {
    /// Start address
    #[arg(value_parser = parse_u32)]
    pub addr: u32,
    /// Length of the region
    #[arg(value_parser = parse_u32)]
    pub size: u32,
    /// Connection configuration
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
}

/// Parse a decimal or `0x` prefixed hexadecimal integer
pub fn parse_u32(input: &str) -> Result<u32, ParseIntError> {
    match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => input.replace('_', "").parse(),
    }
}

/// Open the serial port, connect and, unless disabled, start the flasher stub
pub async fn connect(args: &ConnectArgs, config: &Config) -> Result<Flasher<SerialTransport>> {
    let port = args
        .port
        .as_deref()
        .or(config.serial.as_deref())
        .ok_or_else(|| {
            miette::miette!(
                help = "Pass --port or set `serial` in esploader.toml",
                "No serial port selected"
            )
        })?;

    info!("Serial port: '{}'", port);
    info!("Connecting...");

    let transport = SerialTransport::open(port, ESP_ROM_BAUD)
        .wrap_err_with(|| format!("Failed to open serial port {port}"))?;

    let mut flasher = Flasher::connect(transport).await?;

    if !(args.no_stub || config.no_stub) {
        flasher = start_stub(flasher, args, config).await?;
    }

    if let Some(baud) = args.baud.or(config.baudrate) {
        flasher.change_baud(baud).await?;
    }

    Ok(flasher)
}

async fn start_stub(
    flasher: Flasher<SerialTransport>,
    args: &ConnectArgs,
    config: &Config,
) -> Result<Flasher<SerialTransport>> {
    let Some(dir) = args.stub_dir.as_ref().or(config.stub_dir.as_ref()) else {
        warn!("No stub directory configured, staying with the ROM loader");
        return Ok(flasher);
    };

    let chip = flasher.chip().ok_or(Error::ChipNotDetected)?;
    let stub = FlashStub::load(dir, chip)?;

    Ok(flasher.run_stub(&stub).await?)
}

/// Print information about the connected board
pub async fn board_info(args: &ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(args, config).await?;
    let flash_id = flasher.flash_id().await?;
    flasher.detect_flash_size().await?;
    let info = flasher.device_info().await?;

    println!("Chip type:         {} ({})", info.chip, info.name);
    println!("Flash ID:          {:#08x}", flash_id);
    println!("Flash size:        {}", info.flash_size);
    println!("MAC address:       {}", format_mac(&info.mac_address));
    println!("Loader:            {}", if info.stub { "stub" } else { "ROM" });

    Ok(())
}

/// Write a binary file to flash
pub async fn write_bin(args: &WriteBinArgs, config: &Config) -> Result<()> {
    let data = fs::read(&args.file)
        .into_diagnostic()
        .wrap_err_with(|| format!("Failed to open file {}", args.file.display()))?;

    let mut flasher = connect(&args.connect_args, config).await?;
    flasher.detect_flash_size().await?;
    flasher.set_verify(args.verify);
    flasher.set_compression(!args.no_compress);
    flasher.set_encrypted_writes(args.encrypt);

    let mut progress = EsploaderProgress::default();
    flasher
        .write_image(&data, args.addr, Some(&mut progress))
        .await?;

    flasher.hard_reset().await?;
    Ok(())
}

/// Erase the whole flash
pub async fn erase_flash(args: &ConnectArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(args, config).await?;
    flasher.erase_flash().await?;

    info!("Flash has been erased!");
    Ok(())
}

/// Erase a region of the flash
pub async fn erase_region(args: &EraseRegionArgs, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config).await?;

    info!(
        "Erasing region at {:#010x} ({} bytes)",
        args.addr,
        HumanCount(args.size as u64)
    );
    flasher.erase_region(args.addr, args.size).await?;

    info!("Erase successful");
    Ok(())
}

/// Print the MD5 of a flash region
pub async fn checksum_md5(args: &ChecksumMd5Args, config: &Config) -> Result<()> {
    let mut flasher = connect(&args.connect_args, config).await?;
    let digest = flasher.checksum_md5(args.addr, args.size).await?;

    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    println!("{hex}");

    Ok(())
}

/// Progress bar shown while writing to the device
#[derive(Default)]
pub struct EsploaderProgress {
    pb: Option<ProgressBar>,
}

impl ProgressCallbacks for EsploaderProgress {
    fn init(&mut self, addr: u32, total_blocks: usize) {
        let pb = ProgressBar::new(100)
            .with_message(format!("{addr:#X} ({total_blocks} blocks)"))
            .with_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] [{bar:40}] {pos:>3}% {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=> "),
            );

        self.pb = Some(pb);
    }

    fn update(&mut self, _part: usize, percent: u8) {
        if let Some(pb) = &self.pb {
            pb.set_position(percent as u64);
        }
    }

    fn finish(&mut self, _part: usize) {
        if let Some(pb) = self.pb.take() {
            pb.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addresses_in_either_radix() {
        assert_eq!(parse_u32("0x1000").unwrap(), 0x1000);
        assert_eq!(parse_u32("0X10_000").unwrap(), 0x10000);
        assert_eq!(parse_u32("4096").unwrap(), 4096);
        assert!(parse_u32("0xg").is_err());
    }
}
