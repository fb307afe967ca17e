//! On-media geometry of the system area and the in-memory work area that
//! caches it.

/// Size of every system block image, independent of the device sector size.
pub const SYSTEM_BLOCK_SIZE: usize = 8 * 1024;
pub const NUM_SYSTEM_BLOCK: u16 = 5;
pub const WORK_AREA_SIZE: usize = SYSTEM_BLOCK_SIZE * NUM_SYSTEM_BLOCK as usize;

pub const MAX_FILE: usize = 127;
pub const DIR_ENTRY_SIZE: usize = 64;
pub const FILENAME_MAX: usize = 32;

/// Bytes of block 0 covered by the card id record.
pub const ID_SIZE: usize = 512;

/// Read granularity.
pub const SEGMENT_SIZE: u32 = 512;
/// Program granularity of a write command.
pub const PAGE_SIZE: usize = 128;

pub const ICON_MAX: usize = 8;
pub const COMMENT_SIZE: u32 = 64;
/// Icons and banners must start inside the first segment of a file.
pub const READ_SIZE: u32 = 512;

pub const BLOCK_ID: usize = 0;

/// The two redundant structures of the system area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Table {
    Dir,
    Fat,
}

impl Table {
    pub const fn first_block(self) -> usize {
        match self {
            Table::Dir => 1,
            Table::Fat => 3,
        }
    }

    /// Work-area offset of copy 0 or 1.
    pub const fn offset(self, copy: usize) -> usize {
        (self.first_block() + copy) * SYSTEM_BLOCK_SIZE
    }

    /// Which copy lives at `offset`.
    pub const fn copy_at(self, offset: usize) -> usize {
        offset / SYSTEM_BLOCK_SIZE - self.first_block()
    }

    pub const fn name(self) -> &'static str {
        match self {
            Table::Dir => "directory",
            Table::Fat => "FAT",
        }
    }
}

/// Owned cache of the five system blocks. Everything else in the engine
/// refers into it by byte offset.
#[derive(Clone)]
pub struct WorkArea {
    bytes: Vec<u8>,
}

impl Default for WorkArea {
    fn default() -> Self {
        Self {
            bytes: vec![0; WORK_AREA_SIZE],
        }
    }
}

impl WorkArea {
    pub fn block(&self, index: usize) -> &[u8] {
        self.at(index * SYSTEM_BLOCK_SIZE)
    }

    pub fn block_mut(&mut self, index: usize) -> &mut [u8] {
        self.at_mut(index * SYSTEM_BLOCK_SIZE)
    }

    /// One system block starting at a work-area offset.
    pub fn at(&self, offset: usize) -> &[u8] {
        &self.bytes[offset..offset + SYSTEM_BLOCK_SIZE]
    }

    pub fn at_mut(&mut self, offset: usize) -> &mut [u8] {
        &mut self.bytes[offset..offset + SYSTEM_BLOCK_SIZE]
    }

    pub fn id(&self) -> &[u8] {
        &self.bytes[..ID_SIZE]
    }

    /// Copies the block at `from` over the block at `to`.
    pub fn mirror(&mut self, from: usize, to: usize) {
        if from != to {
            self.bytes.copy_within(from..from + SYSTEM_BLOCK_SIZE, to);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_offsets_follow_block_order() {
        assert_eq!(Table::Dir.offset(0), 0x2000);
        assert_eq!(Table::Dir.offset(1), 0x4000);
        assert_eq!(Table::Fat.offset(0), 0x6000);
        assert_eq!(Table::Fat.offset(1), 0x8000);
        assert_eq!(Table::Fat.copy_at(0x8000), 1);
    }

    #[test]
    fn mirror_copies_a_whole_block() {
        let mut work = WorkArea::default();
        work.block_mut(3).fill(0xA5);
        work.mirror(Table::Fat.offset(0), Table::Fat.offset(1));
        assert!(work.block(4).iter().all(|&b| b == 0xA5));
        assert!(work.block(2).iter().all(|&b| b == 0));
    }
}
