use std::ops::Range;

use log::debug;

use super::{percent_done, FlashTarget, ProgressCallbacks, Segment};
use crate::{
    connection::{
        command::{Command, DEFAULT_TIMEOUT, MEM_END_ROM_TIMEOUT},
        Connection, Transport,
    },
    error::Error,
};

/// Applications running in the target device's RAM
#[derive(Debug)]
pub struct RamTarget {
    entry: Option<u32>,
    block_size: usize,
    is_stub: bool,
    /// Address ranges occupied by the running flasher stub
    resident: Vec<Range<u64>>,
    part: usize,
}

impl RamTarget {
    pub fn new(entry: Option<u32>, block_size: usize) -> Self {
        RamTarget {
            entry,
            block_size,
            is_stub: false,
            resident: Vec::new(),
            part: 0,
        }
    }

    /// Load through a running stub, refusing to overwrite its `resident` ranges
    pub fn through_stub(mut self, resident: Vec<Range<u64>>) -> Self {
        self.is_stub = true;
        self.resident = resident;
        self
    }

    /// Fail if `segment` would overwrite the running stub
    pub fn check_overlap(&self, segment: &Segment<'_>) -> Result<(), Error> {
        if !self.is_stub {
            return Ok(());
        }

        let load = segment.addr as u64..segment.end();
        match self
            .resident
            .iter()
            .find(|resident| load.start < resident.end && resident.start < load.end)
        {
            Some(resident) => Err(Error::OverlappingLoadAddress {
                resident: resident.clone(),
                load,
            }),
            None => Ok(()),
        }
    }
}

impl FlashTarget for RamTarget {
    async fn write_segment<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        segment: Segment<'_>,
        progress: &mut Option<&mut dyn ProgressCallbacks>,
    ) -> Result<(), Error> {
        self.check_overlap(&segment)?;

        let addr = segment.addr;
        let block_count = segment.data.len().div_ceil(self.block_size);

        connection
            .command(Command::MemBegin {
                size: segment.data.len() as u32,
                blocks: block_count as u32,
                block_size: self.block_size as u32,
                offset: addr,
            })
            .await?;

        if let Some(cb) = progress.as_mut() {
            cb.init(addr, block_count)
        }

        for (i, block) in segment.data.chunks(self.block_size).enumerate() {
            connection
                .command(Command::MemData {
                    sequence: i as u32,
                    data: block,
                })
                .await?;

            if let Some(cb) = progress.as_mut() {
                cb.update(self.part, percent_done(i, block_count))
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb.finish(self.part)
        }
        self.part += 1;

        Ok(())
    }

    /// Jump to the entry point, or just leave the loader when there is none
    async fn finish<T: Transport>(
        &mut self,
        connection: &mut Connection<T>,
        _reboot: bool,
    ) -> Result<(), Error> {
        let entry = self.entry.unwrap_or_default();
        let timeout = if self.is_stub {
            DEFAULT_TIMEOUT
        } else {
            MEM_END_ROM_TIMEOUT
        };

        let result = connection
            .command_with_timeout(
                Command::MemEnd {
                    no_entry: entry == 0,
                    entry,
                },
                timeout,
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            // The ROM may reset its UART before acknowledging the jump
            Err(err) if !self.is_stub && !err.is_transport_fault() => {
                debug!("Ignoring MEM_END error from the ROM: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resident() -> Vec<Range<u64>> {
        vec![0x4010_0000..0x4010_2000, 0x3ffe_8000..0x3ffe_9000]
    }

    #[test]
    fn rom_loads_are_never_checked() {
        let target = RamTarget::new(None, 0x800);
        let segment = Segment::new(0x4010_0000, &[0; 16]);
        assert!(target.check_overlap(&segment).is_ok());
    }

    #[test]
    fn overlapping_load_names_both_ranges() {
        let target = RamTarget::new(None, 0x800).through_stub(resident());
        let segment = Segment::new(0x3ffe_8ff0, &[0; 0x20]);

        match target.check_overlap(&segment) {
            Err(Error::OverlappingLoadAddress { resident, load }) => {
                assert_eq!(resident, 0x3ffe_8000..0x3ffe_9000);
                assert_eq!(load, 0x3ffe_8ff0..0x3ffe_9010);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        let target = RamTarget::new(None, 0x800).through_stub(resident());

        let below = Segment::new(0x400f_f000, &[0; 0x1000]);
        let above = Segment::new(0x4010_2000, &[0; 0x1000]);
        assert!(target.check_overlap(&below).is_ok());
        assert!(target.check_overlap(&above).is_ok());
    }

    #[test]
    fn segments_may_reach_past_the_address_space() {
        let segment = Segment::new(0xffff_fff0, &[0; 0x20]);
        assert_eq!(segment.end(), 0x1_0000_0010);

        let target = RamTarget::new(None, 0x800).through_stub(resident());
        assert!(target.check_overlap(&segment).is_ok());

        let target = RamTarget::new(None, 0x800).through_stub(vec![0xffff_ff00..0x1_0000_0000]);
        assert!(matches!(
            target.check_overlap(&segment),
            Err(Error::OverlappingLoadAddress { .. })
        ));
    }
}
