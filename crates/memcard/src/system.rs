//! Channel table, control blocks and the transfer driver.
//!
//! Every operation that touches the medium runs as a chain of jobs. A job
//! records where a chain is; an [`Io`] is the single bus transfer the job is
//! waiting on. [`CardSystem::poll`] collects finished transfers and hands
//! them back to the job's step function, which either parks the next job or
//! finishes the chain by releasing the control block and invoking the
//! caller's callback.

use std::cell::RefCell;
use std::rc::Rc;

use log::{debug, trace};

use crate::bus::{self, ExiBus, Issue, Probe};
use crate::clock::{Clock, SystemClock};
use crate::dir::{DirEntry, Directory, DiskId};
use crate::error::{result_code, CardError, CardResult};
use crate::fat::Fat;
use crate::geometry::Geometry;
use crate::id::{self, FlashId};
use crate::layout::{Table, WorkArea};
use crate::sram::{IdentityStore, Sram, CHANNELS};

/// Invoked exactly once when an asynchronous operation completes.
pub type CardCallback = Box<dyn FnOnce(Completion)>;

/// Open file handle.
///
/// `length` is the number of bytes still to move in the transfer in
/// progress; a negative value asks the running transfer to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub chan: usize,
    pub file_no: usize,
    pub offset: u32,
    pub length: i32,
    pub block: u16,
}

/// What an asynchronous operation reports to its callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub chan: usize,
    pub result: CardResult<()>,
    /// Handle as it stands after the operation (create, read, write).
    pub file: Option<FileInfo>,
    /// Bytes returned by a read.
    pub data: Option<Vec<u8>>,
    /// Bytes written to the medium by a check or moved by a transfer.
    pub transferred: u32,
}

impl Completion {
    fn failed(chan: usize, err: CardError) -> Self {
        Self {
            chan,
            result: Err(err),
            file: None,
            data: None,
            transferred: 0,
        }
    }
}

/// Progress of bringing a card up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Probing,
    Unlocking,
    LoadingBlock(usize),
    Verifying,
    Ready,
    Failed(CardError),
}

#[derive(Debug, Default)]
pub(crate) struct Output {
    pub(crate) file: Option<FileInfo>,
    pub(crate) data: Option<Vec<u8>>,
    pub(crate) transferred: u32,
}

impl Output {
    pub(crate) fn file(file: FileInfo) -> Self {
        Self {
            file: Some(file),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Purpose {
    Mount,
    Format { encode: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MountStep {
    Status { unlocked: bool },
    Unlock,
    Load(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Erase,
    Write,
}

/// Where a chain continues once a system block has been committed.
#[derive(Debug)]
pub(crate) enum Then {
    Finish(Output),
    FillCreated { file: FileInfo, start_block: u16 },
    FreeChain { start_block: u16 },
}

#[derive(Debug)]
pub(crate) enum Job {
    Mount {
        step: MountStep,
        purpose: Purpose,
    },
    Format {
        block: usize,
        stage: Stage,
    },
    Persist {
        table: Table,
        offset: usize,
        addr: u32,
        stage: Stage,
        then: Then,
    },
    Read {
        file: FileInfo,
        data: Vec<u8>,
        filled: usize,
    },
    Write {
        file: FileInfo,
        data: Vec<u8>,
        written: usize,
        stage: Stage,
    },
}

/// A single bus transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Io {
    Status,
    Unlock { challenge: u32 },
    /// One system block into the work area.
    ReadSystem { block: usize, addr: u32 },
    /// Into the running read job's buffer at `at`.
    ReadData { addr: u32, at: usize, len: usize },
    Erase { addr: u32 },
    /// The work-area block at `offset`.
    WriteSystem { offset: usize, addr: u32 },
    /// From the running write job's buffer at `at`.
    WriteData { addr: u32, at: usize, len: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    Idle,
    Transfer,
    Retry,
}

pub(crate) struct Channel {
    pub(crate) attached: bool,
    pub(crate) result: CardResult<()>,
    pub(crate) geometry: Option<Geometry>,
    pub(crate) work: WorkArea,
    pub(crate) current_dir: Option<usize>,
    pub(crate) current_fat: Option<usize>,
    /// FAT changes made in memory by a check that still need writing.
    pub(crate) fat_pending: bool,
    pub(crate) mount: MountState,
    pub(crate) job: Option<Job>,
    pub(crate) callback: Option<CardCallback>,
    pub(crate) wait: Wait,
    pub(crate) pending_io: Option<Io>,
    pub(crate) status: u8,
    pub(crate) unlocked_id: Option<FlashId>,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            attached: false,
            result: Err(CardError::NoCard),
            geometry: None,
            work: WorkArea::default(),
            current_dir: None,
            current_fat: None,
            fat_pending: false,
            mount: MountState::Unmounted,
            job: None,
            callback: None,
            wait: Wait::Idle,
            pending_io: None,
            status: 0,
            unlocked_id: None,
        }
    }
}

impl Channel {
    pub(crate) fn geometry(&self) -> CardResult<Geometry> {
        self.geometry.ok_or(CardError::NoCard)
    }

    pub(crate) fn current_slot(&mut self, table: Table) -> &mut Option<usize> {
        match table {
            Table::Dir => &mut self.current_dir,
            Table::Fat => &mut self.current_fat,
        }
    }

    /// The authoritative directory copy; `Broken` until one is verified.
    pub(crate) fn dir(&self) -> CardResult<Directory<&[u8]>> {
        let offset = self.current_dir.ok_or(CardError::Broken)?;
        Ok(Directory::new(self.work.at(offset)))
    }

    pub(crate) fn dir_mut(&mut self) -> CardResult<Directory<&mut [u8]>> {
        let offset = self.current_dir.ok_or(CardError::Broken)?;
        Ok(Directory::new(self.work.at_mut(offset)))
    }

    pub(crate) fn fat(&self) -> CardResult<Fat<&[u8]>> {
        let offset = self.current_fat.ok_or(CardError::Broken)?;
        let cblock = self.geometry()?.cblock;
        Ok(Fat::new(self.work.at(offset), cblock))
    }

    pub(crate) fn fat_mut(&mut self) -> CardResult<Fat<&mut [u8]>> {
        let offset = self.current_fat.ok_or(CardError::Broken)?;
        let cblock = self.geometry()?.cblock;
        Ok(Fat::new(self.work.at_mut(offset), cblock))
    }

    fn reset_io(&mut self) {
        self.job = None;
        self.wait = Wait::Idle;
        self.pending_io = None;
    }
}

/// The CARD layer for both slots.
pub struct CardSystem<B, S = Sram, C = SystemClock> {
    pub(crate) bus: B,
    pub(crate) sram: S,
    pub(crate) clock: C,
    pub(crate) disk_id: Option<DiskId>,
    pub(crate) channels: [Channel; CHANNELS],
}

impl<B: ExiBus> CardSystem<B> {
    pub fn new(bus: B) -> Self {
        Self::with_parts(bus, Sram::default(), SystemClock)
    }
}

impl<B: ExiBus, S: IdentityStore, C: Clock> CardSystem<B, S, C> {
    /// Both channels start detached with a `NoCard` result.
    pub fn with_parts(bus: B, sram: S, clock: C) -> Self {
        Self {
            bus,
            sram,
            clock,
            disk_id: None,
            channels: Default::default(),
        }
    }

    /// Restricts lookups and ownership checks to files of `disk_id`.
    /// `None` accepts every owner.
    pub fn set_disk_id(&mut self, disk_id: Option<DiskId>) {
        self.disk_id = disk_id;
    }

    pub fn disk_id(&self) -> Option<DiskId> {
        self.disk_id
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn sram(&self) -> &S {
        &self.sram
    }

    pub fn sram_mut(&mut self) -> &mut S {
        &mut self.sram
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn into_parts(self) -> (B, S, C) {
        (self.bus, self.sram, self.clock)
    }

    pub fn mount_state(&self, chan: usize) -> MountState {
        self.channels
            .get(chan)
            .map_or(MountState::Unmounted, |ch| ch.mount)
    }

    pub fn is_attached(&self, chan: usize) -> bool {
        self.channels.get(chan).is_some_and(|ch| ch.attached)
    }

    pub fn geometry(&self, chan: usize) -> Option<Geometry> {
        self.channels.get(chan).and_then(|ch| ch.geometry)
    }

    /// In-memory mirror of the system blocks.
    pub fn work_area(&self, chan: usize) -> Option<&WorkArea> {
        self.channels.get(chan).map(|ch| &ch.work)
    }

    /// Work-area offsets of the current directory and FAT copies.
    pub fn current_copies(&self, chan: usize) -> (Option<usize>, Option<usize>) {
        self.channels
            .get(chan)
            .map_or((None, None), |ch| (ch.current_dir, ch.current_fat))
    }

    /// Result of the last operation on `chan` as a numeric code.
    pub fn result_code(&self, chan: usize) -> i32 {
        match self.channels.get(chan) {
            Some(ch) => result_code(ch.result),
            None => CardError::FatalError.code(),
        }
    }

    pub fn is_busy(&self, chan: usize) -> bool {
        self.channels
            .get(chan)
            .is_some_and(|ch| ch.result == Err(CardError::Busy))
    }

    pub fn probe(&mut self, chan: usize) -> bool {
        chan < CHANNELS && self.bus.probe(chan) == Probe::Present
    }

    /// Classifies the device in `chan` without mounting it.
    ///
    /// Returns the card size in megabits and its sector size.
    pub fn probe_ex(&mut self, chan: usize) -> CardResult<(u16, u32)> {
        let ch = self.channels.get(chan).ok_or(CardError::FatalError)?;
        match self.bus.probe(chan) {
            Probe::Absent => Err(CardError::NoCard),
            Probe::Busy => Err(CardError::Busy),
            Probe::Present if ch.attached => match ch.mount {
                MountState::Probing | MountState::Unlocking => Err(CardError::Busy),
                _ => ch
                    .geometry
                    .map(|geo| (geo.size_mbit, geo.sector_size))
                    .ok_or(CardError::Busy),
            },
            Probe::Present if self.bus.is_attached(chan) => Err(CardError::WrongDevice),
            Probe::Present => {
                let id = self.bus.get_id(chan).ok_or(CardError::Busy)?;
                let has_vendor_id = self.bus.has_vendor_id(chan);
                Geometry::from_device_id(id, has_vendor_id)
                    .map(|geo| (geo.size_mbit, geo.sector_size))
                    .ok_or(CardError::WrongDevice)
            }
        }
    }

    /// Serial number of the mounted card, derived from its id block.
    pub fn get_serial_no(&mut self, chan: usize) -> CardResult<u64> {
        self.get_control_block(chan)?;
        let serial = id::serial_number(self.channels[chan].work.id());
        self.put_control_block(chan, Ok(serial))
    }

    /// Free space in bytes and the number of unused directory slots.
    pub fn free_blocks(&mut self, chan: usize) -> CardResult<(u32, usize)> {
        self.get_control_block(chan)?;
        let ch = &self.channels[chan];
        let result = ch.geometry().and_then(|geo| {
            let free = ch.fat()?.free_blocks();
            let slots = ch.dir()?.unused_slots();
            let bytes = geo
                .sector_size
                .checked_mul(u32::from(free))
                .ok_or(CardError::Broken)?;
            Ok((bytes, slots))
        });
        self.put_control_block(chan, result)
    }

    /// Files visible under the current disk id.
    pub fn entries(&mut self, chan: usize) -> CardResult<Vec<(usize, DirEntry)>> {
        self.get_control_block(chan)?;
        let disk_id = self.disk_id;
        let result = self.channels[chan].dir().map(|dir| {
            dir.entries()
                .filter(|(_, entry)| crate::dir::access(entry, disk_id.as_ref()).is_ok())
                .collect()
        });
        self.put_control_block(chan, result)
    }

    /// Asks the read or write running on `file` to stop at its next step.
    pub fn cancel(&mut self, file: &FileInfo) -> bool {
        let job = self
            .channels
            .get_mut(file.chan)
            .and_then(|ch| ch.job.as_mut());
        match job {
            Some(Job::Read { file: active, .. } | Job::Write { file: active, .. })
                if active.file_no == file.file_no =>
            {
                active.length = -1;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn get_control_block(&mut self, chan: usize) -> CardResult<()> {
        let ch = self.channels.get_mut(chan).ok_or(CardError::FatalError)?;
        if !ch.attached {
            return Err(CardError::NoCard);
        }
        if ch.result == Err(CardError::Busy) {
            return Err(CardError::Busy);
        }
        ch.result = Err(CardError::Busy);
        Ok(())
    }

    /// Releases the control block with `result` and hands `result` back.
    pub(crate) fn put_control_block<T>(&mut self, chan: usize, result: CardResult<T>) -> CardResult<T> {
        let ch = &mut self.channels[chan];
        if ch.attached || ch.result == Err(CardError::Busy) {
            ch.result = result.as_ref().map(|_| ()).map_err(|&err| err);
        }
        result
    }

    /// Releases the control block only when `result` is a failure.
    pub(crate) fn release_on_error<T>(&mut self, chan: usize, result: CardResult<T>) -> CardResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => self.put_control_block(chan, Err(err)),
        }
    }

    /// Stores `job` and starts its transfer.
    pub(crate) fn park(&mut self, chan: usize, job: Job, io: Io) {
        self.channels[chan].job = Some(job);
        self.issue(chan, io);
    }

    fn issue(&mut self, chan: usize, io: Io) {
        match self.transfer(chan, io) {
            Ok(()) => self.channels[chan].wait = Wait::Transfer,
            Err(Issue::Busy) => {
                trace!("chan {chan}: bus busy, retrying {io:?}");
                let ch = &mut self.channels[chan];
                ch.pending_io = Some(io);
                ch.wait = Wait::Retry;
            }
            Err(Issue::Failed) => {
                debug!("chan {chan}: {io:?} failed");
                self.channels[chan].wait = Wait::Idle;
                self.fail(chan, CardError::NoCard);
            }
        }
    }

    fn transfer(&mut self, chan: usize, io: Io) -> Result<(), Issue> {
        let Self {
            bus: exi, channels, ..
        } = self;
        let ch = &mut channels[chan];
        match io {
            Io::Status => {
                ch.status = bus::read_status(exi, chan)?;
                Ok(())
            }
            Io::Unlock { challenge } => {
                ch.unlocked_id = Some(bus::unlock(exi, chan, challenge)?);
                Ok(())
            }
            Io::ReadSystem { block, addr } => bus::read(exi, chan, addr, ch.work.block_mut(block)),
            Io::ReadData { addr, at, len } => match &mut ch.job {
                Some(Job::Read { data, .. }) => bus::read(exi, chan, addr, &mut data[at..at + len]),
                _ => Err(Issue::Failed),
            },
            Io::Erase { addr } => bus::erase_sector(exi, chan, addr),
            Io::WriteSystem { offset, addr } => bus::write(exi, chan, addr, ch.work.at(offset)),
            Io::WriteData { addr, at, len } => match &ch.job {
                Some(Job::Write { data, .. }) => bus::write(exi, chan, addr, &data[at..at + len]),
                _ => Err(Issue::Failed),
            },
        }
    }

    /// Drives the work in flight on `chan` as far as the bus allows.
    ///
    /// Returns `true` once the channel has nothing left in flight.
    pub fn poll(&mut self, chan: usize) -> bool {
        if chan >= CHANNELS {
            return true;
        }
        loop {
            match self.channels[chan].wait {
                Wait::Idle => return self.channels[chan].job.is_none(),
                Wait::Transfer => {
                    if !self.bus.complete(chan) {
                        return false;
                    }
                    self.channels[chan].wait = Wait::Idle;
                    self.resume(chan);
                }
                Wait::Retry => {
                    let ch = &mut self.channels[chan];
                    ch.wait = Wait::Idle;
                    let Some(io) = ch.pending_io.take() else {
                        continue;
                    };
                    self.issue(chan, io);
                    if self.channels[chan].wait == Wait::Retry {
                        return false;
                    }
                }
            }
        }
    }

    fn resume(&mut self, chan: usize) {
        let Some(job) = self.channels[chan].job.take() else {
            return;
        };
        match job {
            Job::Mount { step, purpose } => self.mount_step(chan, step, purpose),
            Job::Format { block, stage } => self.format_step(chan, block, stage),
            Job::Persist {
                table,
                offset,
                addr,
                stage,
                then,
            } => self.persist_step(chan, table, offset, addr, stage, then),
            Job::Read { file, data, filled } => self.read_step(chan, file, data, filled),
            Job::Write {
                file,
                data,
                written,
                stage,
            } => self.write_step(chan, file, data, written, stage),
        }
    }

    fn fail(&mut self, chan: usize, err: CardError) {
        if matches!(self.channels[chan].job, Some(Job::Mount { .. })) {
            self.bring_up_failed(chan, err);
        } else {
            self.finish(chan, Err(err), Output::default());
        }
    }

    /// Ends the chain on `chan`: releases the control block and reports.
    pub(crate) fn finish(&mut self, chan: usize, result: CardResult<()>, output: Output) {
        let ch = &mut self.channels[chan];
        ch.reset_io();
        let callback = ch.callback.take();
        let result = self.put_control_block(chan, result);
        if let Some(callback) = callback {
            callback(Completion {
                chan,
                result,
                file: output.file,
                data: output.data,
                transferred: output.transferred,
            });
        }
    }

    /// Detaches the slot and reports `result` to whoever is waiting.
    pub(crate) fn detach(&mut self, chan: usize, result: CardError, state: MountState) {
        if self.channels[chan].attached {
            self.bus.detach(chan);
        }
        let ch = &mut self.channels[chan];
        ch.attached = false;
        ch.result = Err(result);
        ch.mount = state;
        ch.current_dir = None;
        ch.current_fat = None;
        ch.reset_io();
        if let Some(callback) = ch.callback.take() {
            callback(Completion::failed(chan, result));
        }
    }

    /// Runs an asynchronous entry point to completion.
    pub(crate) fn run_sync(
        &mut self,
        chan: usize,
        start: impl FnOnce(&mut Self, CardCallback) -> CardResult<()>,
    ) -> CardResult<Completion> {
        let slot: Rc<RefCell<Option<Completion>>> = Rc::default();
        let sink = Rc::clone(&slot);
        start(
            self,
            Box::new(move |done| {
                *sink.borrow_mut() = Some(done);
            }),
        )?;
        loop {
            if let Some(done) = slot.borrow_mut().take() {
                return done.result.map(|()| done);
            }
            if self.poll(chan) && slot.borrow().is_none() {
                return Err(CardError::FatalError);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimBus;

    #[test]
    fn channels_start_without_a_card() {
        let mut card = CardSystem::new(SimBus::new());
        assert_eq!(card.result_code(0), CardError::NoCard.code());
        assert_eq!(card.result_code(7), CardError::FatalError.code());
        assert_eq!(card.mount_state(1), MountState::Unmounted);
        assert_eq!(card.free_blocks(0), Err(CardError::NoCard));
        assert_eq!(card.get_serial_no(5), Err(CardError::FatalError));
    }

    #[test]
    fn control_block_is_a_single_slot_lock() {
        let mut card = CardSystem::new(SimBus::new());
        card.channels[0].attached = true;
        card.channels[0].result = Ok(());

        assert_eq!(card.get_control_block(0), Ok(()));
        assert!(card.is_busy(0));
        assert_eq!(card.get_control_block(0), Err(CardError::Busy));

        assert_eq!(card.put_control_block(0, Err::<(), _>(CardError::Limit)), Err(CardError::Limit));
        assert_eq!(card.result_code(0), CardError::Limit.code());
        assert_eq!(card.get_control_block(0), Ok(()));
    }

    #[test]
    fn current_tables_are_broken_until_verified() {
        let mut ch = Channel::default();
        assert_eq!(ch.dir().err(), Some(CardError::Broken));
        ch.geometry = Geometry::from_device_id(0x0004, false);
        ch.current_fat = Some(Table::Fat.offset(1));
        assert_eq!(ch.fat().map(|fat| fat.cblock()).ok(), Some(64));
    }
}
