//! Committing a directory or FAT copy to the medium.
//!
//! The current copy's sector is erased and rewritten. Once it is on the card
//! the copy is mirrored into its twin and the twin becomes current, so the
//! next commit lands in the other slot and the medium always keeps the
//! previous generation.

use log::debug;

use crate::bus::ExiBus;
use crate::clock::Clock;
use crate::error::CardError;
use crate::layout::{Table, SYSTEM_BLOCK_SIZE};
use crate::sram::IdentityStore;
use crate::system::{CardSystem, Io, Job, Output, Stage, Then};

impl<B: ExiBus, S: IdentityStore, C: Clock> CardSystem<B, S, C> {
    /// Writes the current copy of `table`, then continues with `then`.
    ///
    /// The caller bumps the check code beforehand.
    pub(crate) fn persist(&mut self, chan: usize, table: Table, then: Then) {
        let ch = &mut self.channels[chan];
        let (Some(offset), Ok(geometry)) = (*ch.current_slot(table), ch.geometry()) else {
            return self.finish(chan, Err(CardError::Broken), Output::default());
        };
        let addr = geometry.sector_size * (offset / SYSTEM_BLOCK_SIZE) as u32;
        debug!("chan {chan}: committing {} at {addr:#x}", table.name());
        let job = Job::Persist {
            table,
            offset,
            addr,
            stage: Stage::Erase,
            then,
        };
        self.park(chan, job, Io::Erase { addr });
    }

    pub(crate) fn persist_step(
        &mut self,
        chan: usize,
        table: Table,
        offset: usize,
        addr: u32,
        stage: Stage,
        then: Then,
    ) {
        match stage {
            Stage::Erase => {
                let job = Job::Persist {
                    table,
                    offset,
                    addr,
                    stage: Stage::Write,
                    then,
                };
                self.park(chan, job, Io::WriteSystem { offset, addr });
            }
            Stage::Write => {
                let ch = &mut self.channels[chan];
                let twin = table.offset(table.copy_at(offset) ^ 1);
                ch.work.mirror(offset, twin);
                *ch.current_slot(table) = Some(twin);
                if table == Table::Fat {
                    ch.fat_pending = false;
                }
                self.proceed(chan, then);
            }
        }
    }

    fn proceed(&mut self, chan: usize, then: Then) {
        match then {
            Then::Finish(output) => self.finish(chan, Ok(()), output),
            Then::FillCreated { file, start_block } => self.fill_created(chan, file, start_block),
            Then::FreeChain { start_block } => {
                let freed = self.channels[chan]
                    .fat_mut()
                    .and_then(|mut fat| fat.free_chain(start_block));
                match freed {
                    Ok(()) => self.persist(chan, Table::Fat, Then::Finish(Output::default())),
                    Err(err) => self.finish(chan, Err(err), Output::default()),
                }
            }
        }
    }
}
