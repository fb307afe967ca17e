//! Block allocation table.
//!
//! A FAT copy is one system block of big-endian `u16` entries. The first five
//! entries are bookkeeping, the rest are chain links for the data blocks.

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::checksum::checksum;
use crate::error::{CardError, CardResult};
use crate::layout::{NUM_SYSTEM_BLOCK, SYSTEM_BLOCK_SIZE};

pub const CHECKSUM: u16 = 0;
pub const CHECKSUM_INV: u16 = 1;
pub const CHECK_CODE: u16 = 2;
pub const FREE_BLOCKS: u16 = 3;
pub const LAST_SLOT: u16 = 4;

/// Link value of an unallocated block.
pub const AVAIL: u16 = 0x0000;
/// Link value of the last block of a chain.
pub const EOC: u16 = 0xFFFF;

/// Byte offset of the region the checksum covers (from the check code on).
const SEALED_FROM: usize = CHECK_CODE as usize * 2;

pub fn is_valid_block(cblock: u16, block: u16) -> bool {
    NUM_SYSTEM_BLOCK <= block && block < cblock
}

/// View over one FAT copy for a card of `cblock` blocks.
pub struct Fat<B> {
    buf: B,
    cblock: u16,
}

impl<B: AsRef<[u8]>> Fat<B> {
    pub fn new(buf: B, cblock: u16) -> Self {
        Self { buf, cblock }
    }

    pub fn cblock(&self) -> u16 {
        self.cblock
    }

    pub fn entry(&self, index: u16) -> u16 {
        let at = index as usize * 2;
        BigEndian::read_u16(&self.buf.as_ref()[at..at + 2])
    }

    pub fn free_blocks(&self) -> u16 {
        self.entry(FREE_BLOCKS)
    }

    pub fn check_code(&self) -> u16 {
        self.entry(CHECK_CODE)
    }

    pub fn last_slot(&self) -> u16 {
        self.entry(LAST_SLOT)
    }

    pub fn is_valid_block(&self, block: u16) -> bool {
        is_valid_block(self.cblock, block)
    }

    pub fn checksum_ok(&self) -> bool {
        let bytes = self.buf.as_ref();
        checksum(&bytes[SEALED_FROM..SYSTEM_BLOCK_SIZE])
            == (self.entry(CHECKSUM), self.entry(CHECKSUM_INV))
    }

    /// Number of data blocks whose link reads `AVAIL`.
    pub fn count_available(&self) -> u16 {
        (NUM_SYSTEM_BLOCK..self.cblock)
            .filter(|&block| self.entry(block) == AVAIL)
            .count() as u16
    }

    /// Follows a chain from `start` to the end-of-chain marker.
    #[cfg(test)]
    pub fn chain(&self, start: u16) -> CardResult<Vec<u16>> {
        let mut blocks = Vec::new();
        let mut block = start;
        while block != EOC {
            if !self.is_valid_block(block) || blocks.len() >= self.cblock as usize {
                return Err(CardError::Broken);
            }
            blocks.push(block);
            block = self.entry(block);
        }
        Ok(blocks)
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Fat<B> {
    pub fn set_entry(&mut self, index: u16, value: u16) {
        let at = index as usize * 2;
        BigEndian::write_u16(&mut self.buf.as_mut()[at..at + 2], value);
    }

    /// Writes an empty table: every data block available, allocation hint on
    /// the last system block.
    pub fn format(&mut self, check_code: u16) {
        self.buf.as_mut()[..SYSTEM_BLOCK_SIZE].fill(0);
        self.set_entry(CHECK_CODE, check_code);
        self.set_entry(FREE_BLOCKS, self.cblock - NUM_SYSTEM_BLOCK);
        self.set_entry(LAST_SLOT, NUM_SYSTEM_BLOCK - 1);
        self.seal();
    }

    /// Recomputes the checksum pair without touching the check code.
    pub fn seal(&mut self) {
        let (sum, inv) = checksum(&self.buf.as_ref()[SEALED_FROM..SYSTEM_BLOCK_SIZE]);
        self.set_entry(CHECKSUM, sum);
        self.set_entry(CHECKSUM_INV, inv);
    }

    /// Bumps the check code and reseals. Every committed FAT goes through here.
    pub fn update(&mut self) {
        let code = self.check_code().wrapping_add(1);
        self.set_entry(CHECK_CODE, code);
        self.seal();
    }

    /// Links `count` available blocks into a new chain and returns its first
    /// block.
    ///
    /// The scan starts just past the allocation hint and wraps from the end of
    /// the card back to the first data block.
    pub fn allocate(&mut self, count: u16) -> CardResult<u16> {
        let free = self.free_blocks();
        if free < count {
            return Err(CardError::InsufficientSpace);
        }
        self.set_entry(FREE_BLOCKS, free - count);

        let usable = self.cblock - NUM_SYSTEM_BLOCK;
        let mut remaining = count;
        let mut start = EOC;
        let mut prev = 0u16;
        let mut block = self.last_slot();
        let mut scanned = 0u16;

        while remaining > 0 {
            scanned += 1;
            if scanned > usable {
                return Err(CardError::Broken);
            }

            block = block.wrapping_add(1);
            if !self.is_valid_block(block) {
                block = NUM_SYSTEM_BLOCK;
            }

            if self.entry(block) == AVAIL {
                if start == EOC {
                    start = block;
                } else {
                    self.set_entry(prev, block);
                }
                prev = block;
                self.set_entry(block, EOC);
                remaining -= 1;
            }
        }

        self.set_entry(LAST_SLOT, block);
        self.update();
        debug!("allocated {count} blocks starting at {start}");
        Ok(start)
    }

    /// Returns every block of the chain at `start` to the free pool.
    pub fn free_chain(&mut self, start: u16) -> CardResult<()> {
        let mut block = start;
        while block != EOC {
            if !self.is_valid_block(block) {
                return Err(CardError::Broken);
            }
            let next = self.entry(block);
            self.set_entry(block, AVAIL);
            let free = self.free_blocks().wrapping_add(1);
            self.set_entry(FREE_BLOCKS, free);
            trace!("freed block {block}");
            block = next;
        }
        self.update();
        Ok(())
    }
}
