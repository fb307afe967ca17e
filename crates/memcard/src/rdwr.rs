//! Seeking, reading and writing file data.
//!
//! Reads move at most one sector per transfer and may start mid-sector on a
//! segment boundary. Writes replace whole sectors: each one is erased and
//! then programmed. The directory entry's time is bumped once, after the last
//! sector of a write.

use log::{debug, trace};

use crate::bus::ExiBus;
use crate::clock::Clock;
use crate::dir::{access, access_or_public};
use crate::error::{CardError, CardResult};
use crate::layout::{Table, MAX_FILE, SEGMENT_SIZE};
use crate::sram::IdentityStore;
use crate::system::{CardCallback, CardSystem, Channel, FileInfo, Io, Job, Output, Stage, Then};

fn trunc(n: u32, align: u32) -> u32 {
    n & !(align - 1)
}

impl Channel {
    /// Positions `file` at `offset` for a transfer of `length` bytes,
    /// following the FAT chain from the nearest known block.
    fn seek(&self, file: &mut FileInfo, length: i32, offset: u32) -> CardResult<()> {
        if file.file_no >= MAX_FILE {
            return Err(CardError::FatalError);
        }
        let geometry = self.geometry()?;
        let sector = geometry.sector_size;
        if !geometry.is_valid_block(file.block) || geometry.capacity() <= file.offset {
            return Err(CardError::FatalError);
        }

        let entry = self.dir()?.entry(file.file_no);
        let limit = i64::from(entry.length) * i64::from(sector);
        if limit <= i64::from(offset) || limit < i64::from(offset) + i64::from(length) {
            return Err(CardError::Limit);
        }

        file.length = length;
        if offset < file.offset {
            file.offset = 0;
            file.block = entry.start_block;
            if !geometry.is_valid_block(file.block) {
                return Err(CardError::Broken);
            }
        }

        let fat = self.fat()?;
        while file.offset < trunc(offset, sector) {
            file.offset += sector;
            file.block = fat.entry(file.block);
            if !geometry.is_valid_block(file.block) {
                return Err(CardError::Broken);
            }
        }
        file.offset = offset;
        Ok(())
    }

    /// Steps `file` onto the next block of its chain.
    fn next_block(&self, file: &mut FileInfo) -> CardResult<()> {
        let geometry = self.geometry()?;
        file.block = self.fat()?.entry(file.block);
        if geometry.is_valid_block(file.block) {
            Ok(())
        } else {
            Err(CardError::Broken)
        }
    }
}

impl<B: ExiBus, S: IdentityStore, C: Clock> CardSystem<B, S, C> {
    /// Moves the handle to `offset` without transferring anything.
    pub fn seek(&mut self, file: &mut FileInfo, length: i32, offset: u32) -> CardResult<()> {
        self.get_control_block(file.chan)?;
        let mut moved = *file;
        let result = self.channels[file.chan].seek(&mut moved, length, offset);
        if result.is_ok() {
            *file = moved;
        }
        self.put_control_block(file.chan, result)
    }

    /// Fills `buf` from `offset` and leaves `file` where the read stopped.
    pub fn read(&mut self, file: &mut FileInfo, buf: &mut [u8], offset: u32) -> CardResult<()> {
        let length = buf.len() as u32;
        let handle = *file;
        let done = self.run_sync(file.chan, |card, callback| {
            card.read_async(handle, length, offset, callback)
        })?;
        if let Some(data) = &done.data {
            buf.copy_from_slice(data);
        }
        if let Some(moved) = done.file {
            *file = moved;
        }
        Ok(())
    }

    /// Reads `length` bytes at `offset`. Both must be multiples of the
    /// 512-byte segment. The data arrives in the completion.
    pub fn read_async(
        &mut self,
        file: FileInfo,
        length: u32,
        offset: u32,
        callback: CardCallback,
    ) -> CardResult<()> {
        if length == 0 || offset % SEGMENT_SIZE != 0 || length % SEGMENT_SIZE != 0 {
            return Err(CardError::FatalError);
        }
        let length = i32::try_from(length).map_err(|_| CardError::Limit)?;
        let chan = file.chan;
        self.get_control_block(chan)?;

        let mut file = file;
        let disk_id = self.disk_id;
        let ch = &self.channels[chan];
        let started = ch
            .seek(&mut file, length, offset)
            .and_then(|()| access_or_public(&ch.dir()?.entry(file.file_no), disk_id.as_ref()))
            .and_then(|()| ch.geometry());
        let geometry = self.release_on_error(chan, started)?;

        let sector = geometry.sector_size;
        let within = file.offset % sector;
        let first = (length as u32).min(sector - within) as usize;
        let addr = sector * u32::from(file.block) + within;
        debug!("chan {chan}: reading {length} bytes of file {} at {offset}", file.file_no);

        self.channels[chan].callback = Some(callback);
        let job = Job::Read {
            file,
            data: vec![0; length as usize],
            filled: first,
        };
        self.park(chan, job, Io::ReadData { addr, at: 0, len: first });
        self.poll(chan);
        Ok(())
    }

    pub(crate) fn read_step(&mut self, chan: usize, mut file: FileInfo, data: Vec<u8>, filled: usize) {
        if file.length < 0 {
            return self.finish(chan, Err(CardError::Canceled), Output::default());
        }
        let ch = &self.channels[chan];
        let sector = match ch.geometry() {
            Ok(geometry) => geometry.sector_size,
            Err(err) => return self.finish(chan, Err(err), Output::default()),
        };

        let to_boundary = trunc(file.offset + sector, sector) - file.offset;
        file.length -= to_boundary as i32;
        if file.length <= 0 {
            let output = Output {
                file: Some(file),
                transferred: data.len() as u32,
                data: Some(data),
            };
            return self.finish(chan, Ok(()), output);
        }

        file.offset += to_boundary;
        if let Err(err) = ch.next_block(&mut file) {
            return self.finish(chan, Err(err), Output::default());
        }
        let len = (file.length as u32).min(sector) as usize;
        let addr = sector * u32::from(file.block);
        trace!("chan {chan}: reading block {} into {filled}", file.block);
        let job = Job::Read {
            file,
            data,
            filled: filled + len,
        };
        self.park(chan, job, Io::ReadData { addr, at: filled, len });
    }

    /// Replaces whole sectors of the file starting at `offset`.
    pub fn write(&mut self, file: &mut FileInfo, data: &[u8], offset: u32) -> CardResult<()> {
        let handle = *file;
        let done = self.run_sync(file.chan, |card, callback| {
            card.write_async(handle, data.to_vec(), offset, callback)
        })?;
        if let Some(moved) = done.file {
            *file = moved;
        }
        Ok(())
    }

    /// Writes `data` at `offset`. Both must be whole sectors and only the
    /// owner may write.
    pub fn write_async(
        &mut self,
        file: FileInfo,
        data: Vec<u8>,
        offset: u32,
        callback: CardCallback,
    ) -> CardResult<()> {
        let length = i32::try_from(data.len()).map_err(|_| CardError::Limit)?;
        let chan = file.chan;
        self.get_control_block(chan)?;

        let mut file = file;
        let disk_id = self.disk_id;
        let ch = &self.channels[chan];
        let started = ch.seek(&mut file, length, offset).and_then(|()| {
            let sector = ch.geometry()?.sector_size;
            if data.is_empty() || offset % sector != 0 || data.len() as u32 % sector != 0 {
                return Err(CardError::FatalError);
            }
            access(&ch.dir()?.entry(file.file_no), disk_id.as_ref())?;
            Ok(sector)
        });
        let sector = self.release_on_error(chan, started)?;
        debug!("chan {chan}: writing {length} bytes of file {} at {offset}", file.file_no);

        self.channels[chan].callback = Some(callback);
        let addr = sector * u32::from(file.block);
        let job = Job::Write {
            file,
            data,
            written: 0,
            stage: Stage::Erase,
        };
        self.park(chan, job, Io::Erase { addr });
        self.poll(chan);
        Ok(())
    }

    pub(crate) fn write_step(
        &mut self,
        chan: usize,
        mut file: FileInfo,
        data: Vec<u8>,
        written: usize,
        stage: Stage,
    ) {
        let sector = match self.channels[chan].geometry() {
            Ok(geometry) => geometry.sector_size,
            Err(err) => return self.finish(chan, Err(err), Output::default()),
        };
        let addr = sector * u32::from(file.block);

        if stage == Stage::Erase {
            let len = sector as usize;
            let job = Job::Write {
                file,
                data,
                written,
                stage: Stage::Write,
            };
            return self.park(chan, job, Io::WriteData { addr, at: written, len });
        }

        if file.length < 0 {
            return self.finish(chan, Err(CardError::Canceled), Output::default());
        }
        file.length -= sector as i32;
        let written = written + sector as usize;
        if file.length <= 0 {
            return self.stamp_written(chan, file, written as u32);
        }

        file.offset += sector;
        if let Err(err) = self.channels[chan].next_block(&mut file) {
            return self.finish(chan, Err(err), Output::default());
        }
        trace!("chan {chan}: writing block {}", file.block);
        let job = Job::Write {
            file,
            data,
            written,
            stage: Stage::Erase,
        };
        let addr = sector * u32::from(file.block);
        self.park(chan, job, Io::Erase { addr });
    }

    fn stamp_written(&mut self, chan: usize, file: FileInfo, transferred: u32) {
        let time = self.clock.seconds();
        let stamped = self.channels[chan].dir_mut().map(|mut dir| {
            let mut entry = dir.entry(file.file_no);
            entry.time = time;
            dir.set_entry(file.file_no, &entry);
            dir.update();
        });
        match stamped {
            Ok(()) => {
                let output = Output {
                    file: Some(file),
                    transferred,
                    data: None,
                };
                self.persist(chan, Table::Dir, Then::Finish(output));
            }
            Err(err) => self.finish(chan, Err(err), Output::default()),
        }
    }
}
