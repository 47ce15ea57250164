//! A library and application for talking to the serial bootloader of Espressif
//! devices.
//!
//! A session starts out with the ROM loader of the chip; [Flasher::run_stub]
//! upgrades it to the faster flasher stub running from RAM. Both are driven
//! over any [Transport], such as a serial port (with the `serialport`
//! feature) or an in-memory stream in tests.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use self::{
    connection::Transport,
    error::Error,
    flasher::{FlashStub, Flasher},
    targets::Chip,
};

pub mod connection;
pub mod error;
pub mod flasher;
pub mod slip;
pub mod targets;

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::{Builder, Env};
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    ///
    /// `RUST_LOG` takes precedence over `filter`.
    pub fn initialize_logger(filter: LevelFilter) {
        Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .format_timestamp(None)
            .init();
    }
}
