//! Creating, deleting and opening files.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, info};

use crate::bus::ExiBus;
use crate::clock::Clock;
use crate::dir::{access, access_or_public, encode_file_name, DiskId, ATTR_PUBLIC};
use crate::error::{CardError, CardResult};
use crate::layout::{Table, FILENAME_MAX, MAX_FILE};
use crate::sram::IdentityStore;
use crate::stat::{NO_ADDRESS, SPEED_FAST};
use crate::system::{CardCallback, CardSystem, FileInfo, Output, Then};

const ENTRY_FILE_NAME: usize = 8;
const ENTRY_LENGTH: usize = 56;

impl<B: ExiBus, S: IdentityStore, C: Clock> CardSystem<B, S, C> {
    /// Creates a file of `size` bytes (a whole number of sectors) and opens
    /// it.
    pub fn create(&mut self, chan: usize, name: &str, size: u32) -> CardResult<FileInfo> {
        self.run_sync(chan, |card, callback| {
            card.create_async(chan, name, size, callback)
        })?
        .file
        .ok_or(CardError::FatalError)
    }

    pub fn create_async(
        &mut self,
        chan: usize,
        name: &str,
        size: u32,
        callback: CardCallback,
    ) -> CardResult<()> {
        let name = name.as_bytes();
        if name.is_empty() {
            return Err(CardError::FatalError);
        }
        if name.len() > FILENAME_MAX {
            return Err(CardError::NameTooLong);
        }
        self.get_control_block(chan)?;
        let reserved = self.reserve(chan, name, size);
        let (file_no, start_block) = self.release_on_error(chan, reserved)?;
        debug!("chan {chan}: file {file_no} gets blocks from {start_block}");

        let file = FileInfo {
            chan,
            file_no,
            offset: 0,
            length: 0,
            block: start_block,
        };
        self.channels[chan].callback = Some(callback);
        self.persist(chan, Table::Fat, Then::FillCreated { file, start_block });
        self.poll(chan);
        Ok(())
    }

    /// Claims a directory slot and allocates the chain. Nothing is touched
    /// unless every check passes.
    fn reserve(&mut self, chan: usize, name: &[u8], size: u32) -> CardResult<(usize, u16)> {
        let owner = self.disk_id.unwrap_or(DiskId::NONE);
        let ch = &mut self.channels[chan];
        let geometry = ch.geometry()?;
        if size == 0 || size % geometry.sector_size != 0 {
            return Err(CardError::FatalError);
        }

        let dir = ch.dir()?;
        let mut free_no = None;
        for (file_no, entry) in dir.entries() {
            if entry.is_free() {
                free_no.get_or_insert(file_no);
            } else if entry.disk_id() == owner && entry.name_matches(name) {
                return Err(CardError::Exist);
            }
        }
        let free_no = free_no.ok_or(CardError::NoEnt)?;

        let free = ch.fat()?.free_blocks();
        if u64::from(geometry.sector_size) * u64::from(free) < u64::from(size) {
            return Err(CardError::InsufficientSpace);
        }

        let count = (size / geometry.sector_size) as u16;
        let mut dir = ch.dir_mut()?;
        let entry = dir.entry_bytes_mut(free_no);
        BigEndian::write_u16(&mut entry[ENTRY_LENGTH..ENTRY_LENGTH + 2], count);
        entry[ENTRY_FILE_NAME..ENTRY_FILE_NAME + FILENAME_MAX]
            .copy_from_slice(&encode_file_name(name));

        let start_block = ch.fat_mut()?.allocate(count)?;
        Ok((free_no, start_block))
    }

    /// Stamps ownership, defaults and time on a freshly allocated entry and
    /// commits the directory.
    pub(crate) fn fill_created(&mut self, chan: usize, file: FileInfo, start_block: u16) {
        let owner = self.disk_id.unwrap_or(DiskId::NONE);
        let time = self.clock.seconds();
        let filled = self.channels[chan].dir_mut().map(|mut dir| {
            let mut entry = dir.entry(file.file_no);
            entry.game_name = owner.game;
            entry.company = owner.company;
            entry.permission = ATTR_PUBLIC;
            entry.copy_times = 0;
            entry.start_block = start_block;
            entry.banner_format = 0;
            entry.icon_addr = NO_ADDRESS;
            entry.icon_format = 0;
            entry.icon_speed = SPEED_FAST;
            entry.comment_addr = NO_ADDRESS;
            entry.time = time;
            info!("chan {chan}: created {:?} ({} blocks)", entry.name(), entry.length);
            dir.set_entry(file.file_no, &entry);
            dir.update();
        });
        match filled {
            Ok(()) => self.persist(chan, Table::Dir, Then::Finish(Output::file(file))),
            Err(err) => self.finish(chan, Err(err), Output::default()),
        }
    }

    pub fn delete(&mut self, chan: usize, name: &str) -> CardResult<()> {
        self.run_sync(chan, |card, callback| card.delete_async(chan, name, callback))
            .map(|_| ())
    }

    /// Frees the file's directory slot, then its blocks.
    pub fn delete_async(&mut self, chan: usize, name: &str, callback: CardCallback) -> CardResult<()> {
        if name.len() > FILENAME_MAX {
            return Err(CardError::NameTooLong);
        }
        self.get_control_block(chan)?;
        let disk_id = self.disk_id;
        let found = self.channels[chan]
            .dir()
            .and_then(|dir| dir.find(disk_id.as_ref(), name.as_bytes()));
        let file_no = self.release_on_error(chan, found)?;
        self.unlink(chan, file_no, callback)
    }

    pub fn fast_delete(&mut self, chan: usize, file_no: usize) -> CardResult<()> {
        self.run_sync(chan, |card, callback| {
            card.fast_delete_async(chan, file_no, callback)
        })
        .map(|_| ())
    }

    /// Deletes by directory index. Only the owner may delete.
    pub fn fast_delete_async(
        &mut self,
        chan: usize,
        file_no: usize,
        callback: CardCallback,
    ) -> CardResult<()> {
        if file_no >= MAX_FILE {
            return Err(CardError::FatalError);
        }
        self.get_control_block(chan)?;
        let disk_id = self.disk_id;
        let allowed = self.channels[chan]
            .dir()
            .and_then(|dir| access(&dir.entry(file_no), disk_id.as_ref()));
        self.release_on_error(chan, allowed)?;
        self.unlink(chan, file_no, callback)
    }

    fn unlink(&mut self, chan: usize, file_no: usize, callback: CardCallback) -> CardResult<()> {
        let cleared = self.channels[chan].dir_mut().map(|mut dir| {
            let entry = dir.entry(file_no);
            info!("chan {chan}: deleting {:?}", entry.name());
            dir.clear(file_no);
            dir.update();
            entry.start_block
        });
        let start_block = self.release_on_error(chan, cleared)?;
        self.channels[chan].callback = Some(callback);
        self.persist(chan, Table::Dir, Then::FreeChain { start_block });
        self.poll(chan);
        Ok(())
    }

    /// Opens a file by name among those the disk id may access.
    pub fn open(&mut self, chan: usize, name: &str) -> CardResult<FileInfo> {
        self.get_control_block(chan)?;
        let disk_id = self.disk_id;
        let opened = self.channels[chan]
            .dir()
            .and_then(|dir| dir.find(disk_id.as_ref(), name.as_bytes()))
            .and_then(|file_no| self.handle(chan, file_no));
        self.put_control_block(chan, opened)
    }

    /// Opens a file by directory index. Public files of other owners may be
    /// opened too.
    pub fn fast_open(&mut self, chan: usize, file_no: usize) -> CardResult<FileInfo> {
        if file_no >= MAX_FILE {
            return Err(CardError::FatalError);
        }
        self.get_control_block(chan)?;
        let disk_id = self.disk_id;
        let opened = self.channels[chan]
            .dir()
            .and_then(|dir| access_or_public(&dir.entry(file_no), disk_id.as_ref()))
            .and_then(|()| self.handle(chan, file_no));
        self.put_control_block(chan, opened)
    }

    pub fn close(&mut self, file: FileInfo) -> CardResult<()> {
        self.get_control_block(file.chan)?;
        self.put_control_block(file.chan, Ok(()))
    }

    fn handle(&self, chan: usize, file_no: usize) -> CardResult<FileInfo> {
        let ch = &self.channels[chan];
        let start_block = ch.dir()?.entry(file_no).start_block;
        if !ch.geometry()?.is_valid_block(start_block) {
            return Err(CardError::Broken);
        }
        Ok(FileInfo {
            chan,
            file_no,
            offset: 0,
            length: 0,
            block: start_block,
        })
    }
}
