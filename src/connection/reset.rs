//! Reset sequences driven through the DTR and RTS control lines

use std::time::Duration;

use log::debug;
use tokio::time::sleep;

use crate::error::Error;

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: Duration = Duration::from_millis(50);

/// Control over the modem lines and line speed of a transport
pub trait LineControl {
    fn set_dtr(&mut self, level: bool) -> Result<(), Error>;

    fn set_rts(&mut self, level: bool) -> Result<(), Error>;

    fn set_baud(&mut self, baud: u32) -> Result<(), Error>;
}

/// For streams without control lines, e.g. a TCP bridge or an in-memory pipe
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLineControl;

impl LineControl for NoLineControl {
    fn set_dtr(&mut self, _level: bool) -> Result<(), Error> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<(), Error> {
        Ok(())
    }

    fn set_baud(&mut self, _baud: u32) -> Result<(), Error> {
        Ok(())
    }
}

/// Some strategy for resetting a target device
#[allow(async_fn_in_trait)]
pub trait ResetStrategy {
    async fn reset<L: LineControl + ?Sized>(&self, lines: &mut L) -> Result<(), Error>;
}

/// Classic reset sequence, sets DTR and RTS sequentially.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: Duration,
}

impl Default for ClassicReset {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RESET_DELAY,
        }
    }
}

impl ResetStrategy for ClassicReset {
    async fn reset<L: LineControl + ?Sized>(&self, lines: &mut L) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay.as_millis()
        );

        lines.set_dtr(false)?; // IO0 = HIGH
        lines.set_rts(true)?; // EN = LOW, chip in reset

        sleep(Duration::from_millis(100)).await;

        lines.set_dtr(true)?; // IO0 = LOW
        lines.set_rts(false)?; // EN = HIGH, chip out of reset

        sleep(self.delay).await;

        lines.set_dtr(false)?; // IO0 = HIGH, done

        Ok(())
    }
}

/// Pulse the EN line, booting whatever is in flash
#[derive(Debug, Clone, Copy, Default)]
pub struct HardReset;

impl ResetStrategy for HardReset {
    async fn reset<L: LineControl + ?Sized>(&self, lines: &mut L) -> Result<(), Error> {
        debug!("Using HardReset reset strategy");

        lines.set_rts(true)?;
        sleep(Duration::from_millis(100)).await;
        lines.set_rts(false)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<(&'static str, bool)>);

    impl LineControl for Recorder {
        fn set_dtr(&mut self, level: bool) -> Result<(), Error> {
            self.0.push(("dtr", level));
            Ok(())
        }

        fn set_rts(&mut self, level: bool) -> Result<(), Error> {
            self.0.push(("rts", level));
            Ok(())
        }

        fn set_baud(&mut self, _baud: u32) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn classic_reset_sequence() {
        let mut lines = Recorder::default();
        ClassicReset::default().reset(&mut lines).await.unwrap();

        assert_eq!(
            lines.0,
            vec![
                ("dtr", false),
                ("rts", true),
                ("dtr", true),
                ("rts", false),
                ("dtr", false)
            ]
        );
    }
}
