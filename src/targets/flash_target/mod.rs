use std::borrow::Cow;

pub use self::{
    flash::{rom_erase_size, FlashProgrammer},
    ram::RamTarget,
};
use crate::{
    connection::{Connection, Transport},
    error::Error,
};

mod flash;
mod ram;

/// Progress update callbacks
///
/// Reporting is a side effect only, a sink can't abort a write.
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, _addr: u32, _total_blocks: usize) {}
    /// Update some progress report
    fn update(&mut self, part: usize, percent: u8);
    /// Finish some progress report
    fn finish(&mut self, _part: usize) {}
}

impl<F> ProgressCallbacks for F
where
    F: FnMut(usize, u8),
{
    fn update(&mut self, part: usize, percent: u8) {
        self(part, percent)
    }
}

/// A contiguous block of bytes destined for a device address
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment<'a> {
    pub addr: u32,
    pub data: Cow<'a, [u8]>,
}

impl<'a> Segment<'a> {
    pub fn new(addr: u32, data: &'a [u8]) -> Self {
        Segment {
            addr,
            data: Cow::Borrowed(data),
        }
    }

    /// Address one past the last byte, which may lie past the 32-bit space
    pub fn end(&self) -> u64 {
        self.addr as u64 + self.data.len() as u64
    }

    /// Return a segment borrowing from this one
    pub fn borrow<'b>(&'b self) -> Segment<'b> {
        Segment {
            addr: self.addr,
            data: Cow::Borrowed(self.data.as_ref()),
        }
    }
}

/// Operations for interacting with a flash target
#[allow(async_fn_in_trait)]
pub trait FlashTarget {
    /// Write a segment to the target device
    async fn write_segment<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        segment: Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error>;

    /// Complete the flashing operation
    async fn finish<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        reboot: bool,
    ) -> Result<(), Error>;
}

/// Percentage of `total` blocks done after block `sequence`
pub(crate) fn percent_done(sequence: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }

    (100 * (sequence + 1) / total).min(100) as u8
}
