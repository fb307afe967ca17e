//! Card bring-up: probe, unlock, load the system blocks and verify them.

use log::{debug, info, warn};

use crate::bus::{ExiBus, STATUS_UNLOCKED};
use crate::clock::Clock;
use crate::error::{CardError, CardResult};
use crate::geometry::Geometry;
use crate::id;
use crate::layout::{Table, NUM_SYSTEM_BLOCK};
use crate::sram::{flash_id_checksum, IdentityStore};
use crate::system::{
    CardCallback, CardSystem, Io, Job, MountState, MountStep, Output, Purpose,
};
use crate::unlock;

impl<B: ExiBus, S: IdentityStore, C: Clock> CardSystem<B, S, C> {
    /// Mounts the card in `chan` and waits for the outcome.
    ///
    /// A card whose directory or FAT has one damaged copy stays attached and
    /// reports `Broken`; [`check`](Self::check) repairs it. `Encoding` also
    /// leaves the card attached so it can be formatted.
    pub fn mount(&mut self, chan: usize) -> CardResult<()> {
        self.run_sync(chan, |card, callback| card.mount_async(chan, callback))
            .map(|_| ())
    }

    pub fn mount_async(&mut self, chan: usize, callback: CardCallback) -> CardResult<()> {
        self.bring_up(chan, Purpose::Mount, callback)
    }

    /// Detaches `chan`. Whoever still waits on it is told `NoCard`.
    pub fn unmount(&mut self, chan: usize) -> CardResult<()> {
        if chan >= self.channels.len() {
            return Err(CardError::FatalError);
        }
        info!("chan {chan}: unmounted");
        self.detach(chan, CardError::NoCard, MountState::Unmounted);
        Ok(())
    }

    pub(crate) fn bring_up(
        &mut self,
        chan: usize,
        purpose: Purpose,
        callback: CardCallback,
    ) -> CardResult<()> {
        let ch = self.channels.get_mut(chan).ok_or(CardError::FatalError)?;
        if ch.result == Err(CardError::Busy) {
            return Err(CardError::Busy);
        }
        if !ch.attached && self.bus.is_attached(chan) {
            return Err(CardError::WrongDevice);
        }

        ch.result = Err(CardError::Busy);
        if !ch.attached {
            if !self.bus.attach(chan) {
                ch.result = Err(CardError::NoCard);
                return Err(CardError::NoCard);
            }
            ch.attached = true;
        }
        ch.current_dir = None;
        ch.current_fat = None;
        ch.fat_pending = false;
        ch.callback = Some(callback);

        self.probe_device(chan, purpose);
        self.poll(chan);
        Ok(())
    }

    fn probe_device(&mut self, chan: usize, purpose: Purpose) {
        self.channels[chan].mount = MountState::Probing;
        let Some(id) = self.bus.get_id(chan) else {
            return self.bring_up_failed(chan, CardError::NoCard);
        };
        let has_vendor_id = self.bus.has_vendor_id(chan);
        let Some(geometry) = Geometry::from_device_id(id, has_vendor_id) else {
            warn!("chan {chan}: device id {id:#x} is not a memory card");
            return self.bring_up_failed(chan, CardError::WrongDevice);
        };
        debug!(
            "chan {chan}: {} Mbit card, {} byte sectors, {} blocks",
            geometry.size_mbit, geometry.sector_size, geometry.cblock
        );
        self.channels[chan].geometry = Some(geometry);

        let step = MountStep::Status { unlocked: false };
        self.park(chan, Job::Mount { step, purpose }, Io::Status);
    }

    pub(crate) fn mount_step(&mut self, chan: usize, step: MountStep, purpose: Purpose) {
        match step {
            MountStep::Status { unlocked } => self.status_read(chan, unlocked, purpose),
            MountStep::Unlock => {
                if let Some(flash_id) = self.channels[chan].unlocked_id.take() {
                    self.sram.store_flash_id(chan, &flash_id);
                }
                let step = MountStep::Status { unlocked: true };
                self.park(chan, Job::Mount { step, purpose }, Io::Status);
            }
            MountStep::Load(block) => {
                let next = block + 1;
                if next < usize::from(NUM_SYSTEM_BLOCK) {
                    self.load_block(chan, next, purpose);
                } else {
                    self.verify_mount(chan);
                }
            }
        }
    }

    fn status_read(&mut self, chan: usize, unlocked: bool, purpose: Purpose) {
        let ch = &mut self.channels[chan];
        if ch.status & STATUS_UNLOCKED == 0 {
            if unlocked {
                return self.bring_up_failed(chan, CardError::IoError);
            }
            let latency = match ch.geometry() {
                Ok(geometry) => geometry.latency,
                Err(err) => return self.bring_up_failed(chan, err),
            };
            ch.mount = MountState::Unlocking;
            let challenge = unlock::challenge(self.clock.ticks() as u32, latency);
            debug!("chan {chan}: unlocking with challenge {challenge:#010x}");
            let job = Job::Mount {
                step: MountStep::Unlock,
                purpose,
            };
            return self.park(chan, job, Io::Unlock { challenge });
        }

        let flash_id = self.sram.flash_id(chan);
        if self.sram.flash_id_checksum(chan) != flash_id_checksum(&flash_id) {
            warn!("chan {chan}: stored flash id fails its checksum");
            return self.bring_up_failed(chan, CardError::IoError);
        }

        match purpose {
            Purpose::Mount => self.load_block(chan, 0, purpose),
            Purpose::Format { encode } => self.start_format(chan, encode),
        }
    }

    fn load_block(&mut self, chan: usize, block: usize, purpose: Purpose) {
        let ch = &mut self.channels[chan];
        let sector_size = match ch.geometry() {
            Ok(geometry) => geometry.sector_size,
            Err(err) => return self.bring_up_failed(chan, err),
        };
        ch.mount = MountState::LoadingBlock(block);
        let addr = sector_size * block as u32;
        let job = Job::Mount {
            step: MountStep::Load(block),
            purpose,
        };
        self.park(chan, job, Io::ReadSystem { block, addr });
    }

    /// One-shot verification with no repair writes.
    fn verify_mount(&mut self, chan: usize) {
        let encode = self.sram.font_encode();
        let flash_id = self.sram.flash_id(chan);
        let ch = &mut self.channels[chan];
        ch.mount = MountState::Verifying;
        let geometry = match ch.geometry() {
            Ok(geometry) => geometry,
            Err(err) => return self.bring_up_failed(chan, err),
        };

        match id::verify_id(ch.work.id(), geometry.size_mbit, encode, &flash_id) {
            Ok(()) => {}
            Err(CardError::Encoding) => {
                warn!("chan {chan}: card was formatted under another encoding");
                ch.mount = MountState::Failed(CardError::Encoding);
                return self.finish(chan, Err(CardError::Encoding), Output::default());
            }
            Err(err) => return self.bring_up_failed(chan, err),
        }

        let (dir_errors, _) = ch.verify_pair(Table::Dir, geometry.cblock);
        let (fat_errors, _) = ch.verify_pair(Table::Fat, geometry.cblock);
        match dir_errors + fat_errors {
            0 => {
                info!("chan {chan}: mounted");
                ch.mount = MountState::Ready;
                self.finish(chan, Ok(()), Output::default());
            }
            1 => {
                warn!("chan {chan}: one system block copy is damaged");
                ch.mount = MountState::Failed(CardError::Broken);
                self.finish(chan, Err(CardError::Broken), Output::default());
            }
            errors => {
                warn!("chan {chan}: {errors} system block copies are damaged");
                self.bring_up_failed(chan, CardError::Broken);
            }
        }
    }

    pub(crate) fn bring_up_failed(&mut self, chan: usize, err: CardError) {
        warn!("chan {chan}: mount failed: {err}");
        self.detach(chan, err, MountState::Failed(err));
    }
}
