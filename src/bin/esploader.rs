use clap::{Parser, Subcommand};
use esploader::{
    cli::{
        board_info, checksum_md5, config::Config, erase_flash, erase_region, write_bin,
        ChecksumMd5Args, ConnectArgs, EraseRegionArgs, WriteBinArgs,
    },
    logging::initialize_logger,
};
use log::{debug, LevelFilter};
use miette::Result;

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print information about a connected target device
    BoardInfo(ConnectArgs),
    /// Write a binary file to a specific address in the chip's flash
    WriteBin(WriteBinArgs),
    /// Erase the entire flash of the target device
    ///
    /// Requires the flasher stub.
    EraseFlash(ConnectArgs),
    /// Erase a region of the flash
    ///
    /// Requires the flasher stub.
    EraseRegion(EraseRegionArgs),
    /// Print the MD5 of a flash region, as computed by the device
    ChecksumMd5(ChecksumMd5Args),
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();
    initialize_logger(LevelFilter::Info);

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse().subcommand;
    debug!("{:#?}", args);

    // Load any user configuration, if present.
    let config = Config::load()?;

    match args {
        Commands::BoardInfo(args) => board_info(&args, &config).await,
        Commands::WriteBin(args) => write_bin(&args, &config).await,
        Commands::EraseFlash(args) => erase_flash(&args, &config).await,
        Commands::EraseRegion(args) => erase_region(&args, &config).await,
        Commands::ChecksumMd5(args) => checksum_md5(&args, &config).await,
    }
}
