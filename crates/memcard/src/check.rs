//! Consistency check and repair of the redundant system blocks.

use log::{info, warn};

use crate::bus::ExiBus;
use crate::clock::Clock;
use crate::dir::Directory;
use crate::error::{CardError, CardResult};
use crate::fat::{Fat, AVAIL, EOC, FREE_BLOCKS};
use crate::id;
use crate::layout::{Table, NUM_SYSTEM_BLOCK, SYSTEM_BLOCK_SIZE};
use crate::sram::IdentityStore;
use crate::system::{CardCallback, CardSystem, Channel, MountState, Output, Then};

/// What a check pass left to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Repair {
    None,
    Dir,
    Fat,
}

impl Channel {
    /// Validates both copies of `table`.
    ///
    /// Returns the number of bad copies and the index of the copy that is,
    /// or should become, current. A bad copy clears the current pointer.
    /// With two good copies and no current pointer, the copy with the lower
    /// check code becomes current and takes over the other copy's contents.
    pub(crate) fn verify_pair(&mut self, table: Table, cblock: u16) -> (usize, usize) {
        let mut errors = 0;
        let mut current = 0;
        for copy in 0..2 {
            let block = self.work.at(table.offset(copy));
            let sound = match table {
                Table::Dir => Directory::new(block).checksum_ok(),
                Table::Fat => {
                    let fat = Fat::new(block, cblock);
                    fat.checksum_ok() && fat.count_available() == fat.free_blocks()
                }
            };
            if !sound {
                errors += 1;
                current = copy;
                *self.current_slot(table) = None;
            }
        }
        if errors > 0 {
            return (errors, current);
        }

        let selected = *self.current_slot(table);
        match selected {
            Some(offset) => current = table.copy_at(offset),
            None => {
                let code = |copy| i32::from(self.check_code(table, copy, cblock) as i16);
                current = if code(0) - code(1) < 0 { 0 } else { 1 };
                *self.current_slot(table) = Some(table.offset(current));
                self.work.mirror(table.offset(current ^ 1), table.offset(current));
            }
        }
        (errors, current)
    }

    fn check_code(&self, table: Table, copy: usize, cblock: u16) -> u16 {
        let block = self.work.at(table.offset(copy));
        match table {
            Table::Dir => Directory::new(block).check_code(),
            Table::Fat => Fat::new(block, cblock).check_code(),
        }
    }

    /// Rebuilds a damaged copy from its twin and makes it current.
    fn restore_copy(&mut self, table: Table, bad: usize) {
        warn!("restoring {} copy {bad} from its twin", table.name());
        self.work.mirror(table.offset(bad ^ 1), table.offset(bad));
        *self.current_slot(table) = Some(table.offset(bad));
    }

    /// Walks every file chain, drops orphaned blocks and fixes the free count.
    ///
    /// Returns whether the FAT changed.
    fn reclaim(&mut self) -> CardResult<bool> {
        let cblock = self.geometry()?.cblock;
        let dir = self.dir()?;
        let fat = self.fat()?;

        let mut owners = vec![0u8; usize::from(cblock)];
        for (file_no, entry) in dir.entries().filter(|(_, entry)| !entry.is_free()) {
            let mut block = entry.start_block;
            let mut count = 0u16;
            while block != EOC && count < entry.length {
                if !fat.is_valid_block(block) {
                    warn!("file {file_no} links to block {block}, outside the card");
                    return Err(CardError::Broken);
                }
                let owner = &mut owners[usize::from(block)];
                *owner += 1;
                if *owner > 1 {
                    warn!("block {block} is claimed twice");
                    return Err(CardError::Broken);
                }
                block = fat.entry(block);
                count += 1;
            }
            if count != entry.length || block != EOC {
                warn!("file {file_no} chain does not match its length of {}", entry.length);
                return Err(CardError::Broken);
            }
        }

        let mut orphans = Vec::new();
        let mut free = 0u16;
        for block in NUM_SYSTEM_BLOCK..cblock {
            if owners[usize::from(block)] == 0 {
                if fat.entry(block) != AVAIL {
                    orphans.push(block);
                }
                free += 1;
            }
        }

        let mut fat = self.fat_mut()?;
        let mut changed = !orphans.is_empty();
        for &block in &orphans {
            fat.set_entry(block, AVAIL);
        }
        if !orphans.is_empty() {
            warn!("reclaimed {} orphaned blocks", orphans.len());
        }
        if free != fat.free_blocks() {
            warn!("free block count {} corrected to {free}", fat.free_blocks());
            fat.set_entry(FREE_BLOCKS, free);
            changed = true;
        }
        if changed {
            fat.seal();
        }
        Ok(changed)
    }
}

impl<B: ExiBus, S: IdentityStore, C: Clock> CardSystem<B, S, C> {
    /// Verifies the mounted card and repairs what can be repaired.
    ///
    /// Returns the number of bytes written back. At most one system block is
    /// committed per call, directory first, so a card with a damaged
    /// directory and a stale FAT needs a second call.
    pub fn check(&mut self, chan: usize) -> CardResult<u32> {
        self.run_sync(chan, |card, callback| card.check_async(chan, callback))
            .map(|done| done.transferred)
    }

    pub fn check_async(&mut self, chan: usize, callback: CardCallback) -> CardResult<()> {
        self.get_control_block(chan)?;
        let repair = self.check_pass(chan);
        let repair = self.release_on_error(chan, repair)?;

        let ch = &mut self.channels[chan];
        ch.callback = Some(callback);
        let table = match repair {
            Repair::None => {
                info!("chan {chan}: card is consistent");
                ch.mount = MountState::Ready;
                self.finish(chan, Ok(()), Output::default());
                self.poll(chan);
                return Ok(());
            }
            Repair::Dir => Table::Dir,
            Repair::Fat => Table::Fat,
        };
        let sealed = match table {
            Table::Dir => ch.dir_mut().map(|mut dir| dir.update()),
            Table::Fat => ch.fat_mut().map(|mut fat| fat.update()),
        };
        match sealed {
            Ok(()) => {
                let output = Output {
                    transferred: SYSTEM_BLOCK_SIZE as u32,
                    ..Output::default()
                };
                self.persist(chan, table, Then::Finish(output));
            }
            Err(err) => self.finish(chan, Err(err), Output::default()),
        }
        self.poll(chan);
        Ok(())
    }

    fn check_pass(&mut self, chan: usize) -> CardResult<Repair> {
        let encode = self.sram.font_encode();
        let flash_id = self.sram.flash_id(chan);
        let ch = &mut self.channels[chan];
        let geometry = ch.geometry()?;
        id::verify_id(ch.work.id(), geometry.size_mbit, encode, &flash_id)?;

        let (dir_errors, dir_current) = ch.verify_pair(Table::Dir, geometry.cblock);
        let (fat_errors, fat_current) = ch.verify_pair(Table::Fat, geometry.cblock);
        if dir_errors + fat_errors > 1 {
            warn!("chan {chan}: {} damaged system block copies", dir_errors + fat_errors);
            return Err(CardError::Broken);
        }

        let mut repair = Repair::None;
        if dir_errors + fat_errors == 1 {
            if ch.current_dir.is_none() {
                ch.restore_copy(Table::Dir, dir_current);
                repair = Repair::Dir;
            } else {
                ch.restore_copy(Table::Fat, fat_current);
                repair = Repair::Fat;
            }
        }

        // A FAT fix found while the directory is being restored waits for
        // the next pass.
        let reclaimed = ch.reclaim()?;
        match repair {
            Repair::None if reclaimed || ch.fat_pending => repair = Repair::Fat,
            Repair::Dir if reclaimed => ch.fat_pending = true,
            _ => {}
        }

        if let Some(current) = ch.current_fat {
            let other = Table::Fat.offset(Table::Fat.copy_at(current) ^ 1);
            ch.work.mirror(current, other);
        }
        Ok(repair)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Geometry;

    fn formatted_channel() -> Channel {
        let mut ch = Channel::default();
        let geometry = Geometry::from_device_id(0x0004, false);
        ch.geometry = geometry;
        for copy in 0..2 {
            Directory::new(ch.work.at_mut(Table::Dir.offset(copy))).format(copy as u16);
            Fat::new(ch.work.at_mut(Table::Fat.offset(copy)), 64).format(copy as u16);
        }
        ch
    }

    #[test]
    fn lower_check_code_slot_takes_the_newer_copy() {
        let mut ch = formatted_channel();
        assert_eq!(ch.verify_pair(Table::Dir, 64), (0, 0));
        assert_eq!(ch.current_dir, Some(Table::Dir.offset(0)));
        assert_eq!(Directory::new(ch.work.at(Table::Dir.offset(0))).check_code(), 1);

        assert_eq!(ch.verify_pair(Table::Dir, 64), (0, 0));
    }

    #[test]
    fn check_code_order_is_signed() {
        let mut ch = formatted_channel();
        let block = ch.work.at_mut(Table::Dir.offset(0));
        block[SYSTEM_BLOCK_SIZE - 6..SYSTEM_BLOCK_SIZE - 4].copy_from_slice(&0x8000u16.to_be_bytes());
        Directory::new(block).seal();
        // Copy 0 now holds 0x8000, which reads as negative.
        assert_eq!(ch.verify_pair(Table::Dir, 64), (0, 0));
        assert_eq!(Directory::new(ch.work.at(Table::Dir.offset(0))).check_code(), 1);
    }

    #[test]
    fn stale_free_count_is_a_bad_copy() {
        let mut ch = formatted_channel();
        let mut fat = Fat::new(ch.work.at_mut(Table::Fat.offset(1)), 64);
        fat.set_entry(FREE_BLOCKS, 3);
        fat.seal();

        assert_eq!(ch.verify_pair(Table::Fat, 64), (1, 1));
        assert_eq!(ch.current_fat, None);
    }

    #[test]
    fn reclaim_frees_orphans_and_rejects_shared_blocks() {
        let mut ch = formatted_channel();
        ch.verify_pair(Table::Dir, 64);
        ch.verify_pair(Table::Fat, 64);

        let mut fat = ch.fat_mut().expect("current FAT");
        fat.set_entry(9, EOC);
        fat.update();
        assert_eq!(ch.reclaim(), Ok(true));
        let fat = ch.fat().expect("current FAT");
        assert_eq!(fat.entry(9), AVAIL);
        assert_eq!(fat.free_blocks(), 59);
        assert!(fat.checksum_ok());
        assert_eq!(ch.reclaim(), Ok(false));

        let mut fat = ch.fat_mut().expect("current FAT");
        fat.set_entry(7, EOC);
        let mut dir = ch.dir_mut().expect("current directory");
        for file_no in 0..2 {
            let mut entry = dir.entry(file_no);
            entry.game_name = *b"GALE";
            entry.start_block = 7;
            entry.length = 1;
            dir.set_entry(file_no, &entry);
        }
        assert_eq!(ch.reclaim(), Err(CardError::Broken));
    }
}
