//! Laying down a fresh file system.

use log::info;

use crate::bus::ExiBus;
use crate::clock::Clock;
use crate::dir::Directory;
use crate::error::{CardError, CardResult};
use crate::fat::Fat;
use crate::id::{format_id, IdRecord};
use crate::layout::{Table, BLOCK_ID, NUM_SYSTEM_BLOCK, SYSTEM_BLOCK_SIZE};
use crate::sram::IdentityStore;
use crate::system::{CardCallback, CardSystem, Io, Job, MountState, Output, Purpose, Stage};

impl<B: ExiBus, S: IdentityStore, C: Clock> CardSystem<B, S, C> {
    /// Formats the card under the configured font encoding.
    pub fn format(&mut self, chan: usize) -> CardResult<()> {
        self.run_sync(chan, |card, callback| card.format_async(chan, callback))
            .map(|_| ())
    }

    pub fn format_async(&mut self, chan: usize, callback: CardCallback) -> CardResult<()> {
        let encode = self.sram.font_encode();
        self.format_region_async(chan, encode, callback)
    }

    /// Formats the card stamping `encode` into its id block.
    ///
    /// A detached slot is brought up (probed and unlocked) first.
    pub fn format_region_async(
        &mut self,
        chan: usize,
        encode: u16,
        callback: CardCallback,
    ) -> CardResult<()> {
        let ch = self.channels.get(chan).ok_or(CardError::FatalError)?;
        if !ch.attached {
            return self.bring_up(chan, Purpose::Format { encode }, callback);
        }
        self.get_control_block(chan)?;
        self.channels[chan].callback = Some(callback);
        self.start_format(chan, encode);
        self.poll(chan);
        Ok(())
    }

    pub(crate) fn start_format(&mut self, chan: usize, encode: u16) {
        let geometry = match self.channels[chan].geometry() {
            Ok(geometry) => geometry,
            Err(err) => return self.finish(chan, Err(err), Output::default()),
        };
        let record = IdRecord {
            format_time: self.clock.ticks(),
            counter_bias: self.sram.counter_bias(),
            language: u32::from(self.sram.language()),
            size_mbit: geometry.size_mbit,
            encode,
        };
        let flash_id = self.sram.flash_id(chan);

        let ch = &mut self.channels[chan];
        format_id(ch.work.block_mut(BLOCK_ID), &record, &flash_id);
        for copy in 0..2 {
            Directory::new(ch.work.at_mut(Table::Dir.offset(copy))).format(copy as u16);
            Fat::new(ch.work.at_mut(Table::Fat.offset(copy)), geometry.cblock).format(copy as u16);
        }
        for table in [Table::Dir, Table::Fat] {
            ch.work.mirror(table.offset(1), table.offset(0));
            *ch.current_slot(table) = Some(table.offset(0));
        }
        ch.fat_pending = false;

        info!(
            "chan {chan}: formatting {} Mbit card ({} data blocks)",
            geometry.size_mbit,
            geometry.data_blocks()
        );
        self.format_block(chan, 0, Stage::Erase);
    }

    fn format_block(&mut self, chan: usize, block: usize, stage: Stage) {
        let sector_size = match self.channels[chan].geometry() {
            Ok(geometry) => geometry.sector_size,
            Err(err) => return self.finish(chan, Err(err), Output::default()),
        };
        let addr = sector_size * block as u32;
        let io = match stage {
            Stage::Erase => Io::Erase { addr },
            Stage::Write => Io::WriteSystem {
                offset: block * SYSTEM_BLOCK_SIZE,
                addr,
            },
        };
        self.park(chan, Job::Format { block, stage }, io);
    }

    pub(crate) fn format_step(&mut self, chan: usize, block: usize, stage: Stage) {
        match stage {
            Stage::Erase => self.format_block(chan, block, Stage::Write),
            Stage::Write if block + 1 < usize::from(NUM_SYSTEM_BLOCK) => {
                self.format_block(chan, block + 1, Stage::Erase)
            }
            Stage::Write => {
                info!("chan {chan}: format complete");
                self.channels[chan].mount = MountState::Ready;
                self.finish(chan, Ok(()), Output::default());
            }
        }
    }
}
