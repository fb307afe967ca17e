//! File status: the icon, banner and comment layout stored in a directory
//! entry, and where each image lands inside the file.

use log::debug;

use crate::bus::ExiBus;
use crate::clock::Clock;
use crate::dir::{access_or_public, DirEntry};
use crate::error::{CardError, CardResult};
use crate::layout::{Table, COMMENT_SIZE, FILENAME_MAX, ICON_MAX, MAX_FILE, READ_SIZE, SYSTEM_BLOCK_SIZE};
use crate::sram::IdentityStore;
use crate::system::{CardCallback, CardSystem, Output, Then};

pub const BANNER_WIDTH: u32 = 96;
pub const BANNER_HEIGHT: u32 = 32;
pub const ICON_WIDTH: u32 = 32;
pub const ICON_HEIGHT: u32 = 32;
/// Size of a 256-colour palette.
pub const TLUT_SIZE: u32 = 2 * 256;

pub const BANNER_NONE: u8 = 0;
pub const BANNER_C8: u8 = 1;
pub const BANNER_RGB5A3: u8 = 2;
pub const BANNER_MASK: u8 = 3;

pub const ICON_NONE: u16 = 0;
pub const ICON_C8: u16 = 1;
pub const ICON_RGB5A3: u16 = 2;
pub const ICON_MASK: u16 = 3;

pub const SPEED_END: u16 = 0;
pub const SPEED_FAST: u16 = 1;
pub const SPEED_MIDDLE: u16 = 2;
pub const SPEED_SLOW: u16 = 3;
pub const SPEED_MASK: u16 = 3;

/// Address and offset value meaning "not present".
pub const NO_ADDRESS: u32 = 0xFFFF_FFFF;

/// Caller-visible status of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardStat {
    pub file_name: [u8; FILENAME_MAX],
    /// File size in bytes.
    pub length: u32,
    pub time: u32,
    pub game_name: [u8; 4],
    pub company: [u8; 2],

    pub banner_format: u8,
    pub icon_addr: u32,
    pub icon_format: u16,
    pub icon_speed: u16,
    pub comment_addr: u32,

    pub offset_banner: u32,
    pub offset_banner_tlut: u32,
    pub offset_icon: [u32; ICON_MAX],
    pub offset_icon_tlut: u32,
    pub offset_data: u32,
}

impl CardStat {
    pub fn name(&self) -> String {
        let end = self
            .file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_MAX);
        String::from_utf8_lossy(&self.file_name[..end]).into_owned()
    }

    /// Format of icon frame `icon` (0..8).
    pub fn icon_format_of(&self, icon: usize) -> u16 {
        icon_format_of(self.icon_format, icon)
    }

    pub fn icon_speed_of(&self, icon: usize) -> u16 {
        icon_format_of(self.icon_speed, icon)
    }

    pub fn set_icon_format(&mut self, icon: usize, format: u16) {
        self.icon_format = set_field(self.icon_format, icon, format);
    }

    pub fn set_icon_speed(&mut self, icon: usize, speed: u16) {
        self.icon_speed = set_field(self.icon_speed, icon, speed);
    }
}

fn icon_format_of(packed: u16, icon: usize) -> u16 {
    if icon >= ICON_MAX {
        return ICON_NONE;
    }
    (packed >> (2 * icon)) & ICON_MASK
}

fn set_field(packed: u16, icon: usize, value: u16) -> u16 {
    if icon >= ICON_MAX {
        return packed;
    }
    let shift = 2 * icon;
    (packed & !(ICON_MASK << shift)) | ((value & ICON_MASK) << shift)
}

/// Lays the banner, icons and palettes out from the entry's icon address and
/// records where the file's own data begins.
pub fn update_icon_offsets(entry: &DirEntry, stat: &mut CardStat) {
    let mut offset = entry.icon_addr;
    if offset == NO_ADDRESS {
        stat.banner_format = BANNER_NONE;
        stat.icon_format = ICON_NONE;
        stat.icon_speed = SPEED_END;
        offset = 0;
    }

    match entry.banner_format & BANNER_MASK {
        BANNER_C8 => {
            stat.offset_banner = offset;
            offset += BANNER_WIDTH * BANNER_HEIGHT;
            stat.offset_banner_tlut = offset;
            offset += TLUT_SIZE;
        }
        BANNER_RGB5A3 => {
            stat.offset_banner = offset;
            offset += 2 * BANNER_WIDTH * BANNER_HEIGHT;
            stat.offset_banner_tlut = NO_ADDRESS;
        }
        _ => {
            stat.offset_banner = NO_ADDRESS;
            stat.offset_banner_tlut = NO_ADDRESS;
        }
    }

    let mut icon_tlut = false;
    for (icon, slot) in stat.offset_icon.iter_mut().enumerate() {
        match icon_format_of(entry.icon_format, icon) {
            ICON_C8 => {
                *slot = offset;
                offset += ICON_WIDTH * ICON_HEIGHT;
                icon_tlut = true;
            }
            ICON_RGB5A3 => {
                *slot = offset;
                offset += 2 * ICON_WIDTH * ICON_HEIGHT;
            }
            _ => *slot = NO_ADDRESS,
        }
    }

    if icon_tlut {
        stat.offset_icon_tlut = offset;
        offset += TLUT_SIZE;
    } else {
        stat.offset_icon_tlut = NO_ADDRESS;
    }
    stat.offset_data = offset;
}

impl<B: ExiBus, S: IdentityStore, C: Clock> CardSystem<B, S, C> {
    /// Reads the status of file `file_no`. Public files of other owners are
    /// visible too.
    pub fn get_status(&mut self, chan: usize, file_no: usize) -> CardResult<CardStat> {
        if file_no >= MAX_FILE {
            return Err(CardError::FatalError);
        }
        self.get_control_block(chan)?;
        let disk_id = self.disk_id;
        let ch = &self.channels[chan];
        let result = ch.geometry().and_then(|geometry| {
            let entry = ch.dir()?.entry(file_no);
            access_or_public(&entry, disk_id.as_ref())?;
            let mut stat = CardStat {
                file_name: entry.file_name,
                length: u32::from(entry.length)
                    .checked_mul(geometry.sector_size)
                    .ok_or(CardError::Broken)?,
                time: entry.time,
                game_name: entry.game_name,
                company: entry.company,
                banner_format: entry.banner_format,
                icon_addr: entry.icon_addr,
                icon_format: entry.icon_format,
                icon_speed: entry.icon_speed,
                comment_addr: entry.comment_addr,
                ..CardStat::default()
            };
            update_icon_offsets(&entry, &mut stat);
            Ok(stat)
        });
        self.put_control_block(chan, result)
    }

    /// Stores the layout fields of `stat` in the entry and fills in the
    /// computed offsets.
    pub fn set_status(&mut self, chan: usize, file_no: usize, stat: &mut CardStat) -> CardResult<()> {
        self.run_sync(chan, |card, callback| {
            card.set_status_async(chan, file_no, stat, callback)
        })
        .map(|_| ())
    }

    pub fn set_status_async(
        &mut self,
        chan: usize,
        file_no: usize,
        stat: &mut CardStat,
        callback: CardCallback,
    ) -> CardResult<()> {
        if file_no >= MAX_FILE {
            return Err(CardError::FatalError);
        }
        if stat.icon_addr != NO_ADDRESS && stat.icon_addr >= READ_SIZE {
            return Err(CardError::FatalError);
        }
        let block = SYSTEM_BLOCK_SIZE as u32;
        if stat.comment_addr != NO_ADDRESS && stat.comment_addr % block > block - COMMENT_SIZE {
            return Err(CardError::FatalError);
        }
        self.get_control_block(chan)?;

        let disk_id = self.disk_id;
        let time = self.clock.seconds();
        let updated = self.channels[chan].dir_mut().and_then(|mut dir| {
            let mut entry = dir.entry(file_no);
            access_or_public(&entry, disk_id.as_ref())?;
            entry.banner_format = stat.banner_format;
            entry.icon_addr = stat.icon_addr;
            entry.icon_format = stat.icon_format;
            entry.icon_speed = stat.icon_speed;
            entry.comment_addr = stat.comment_addr;
            update_icon_offsets(&entry, stat);
            if entry.icon_addr == NO_ADDRESS {
                entry.icon_speed = (entry.icon_speed & !SPEED_MASK) | SPEED_FAST;
                stat.icon_speed = SPEED_FAST;
            }
            entry.time = time;
            dir.set_entry(file_no, &entry);
            dir.update();
            Ok(())
        });
        self.release_on_error(chan, updated)?;
        debug!("chan {chan}: status of file {file_no} updated");

        self.channels[chan].callback = Some(callback);
        self.persist(chan, Table::Dir, Then::Finish(Output::default()));
        self.poll(chan);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dir::FREE_MARK;
    use crate::layout::DIR_ENTRY_SIZE;

    fn entry(banner: u8, icon_addr: u32, icon_format: u16) -> DirEntry {
        let mut entry = DirEntry::parse(&[FREE_MARK; DIR_ENTRY_SIZE]);
        entry.banner_format = banner;
        entry.icon_addr = icon_addr;
        entry.icon_format = icon_format;
        entry
    }

    #[test]
    fn c8_banner_and_mixed_icons() {
        let mut stat = CardStat::default();
        // Icon 0 C8, icon 1 RGB5A3, the rest absent.
        update_icon_offsets(&entry(BANNER_C8, 0x40, 0b1001), &mut stat);

        assert_eq!(stat.offset_banner, 0x40);
        assert_eq!(stat.offset_banner_tlut, 0x40 + 3072);
        assert_eq!(stat.offset_icon[0], 0x40 + 3072 + 512);
        assert_eq!(stat.offset_icon[1], 0x40 + 3072 + 512 + 1024);
        assert_eq!(stat.offset_icon[2], NO_ADDRESS);
        assert_eq!(stat.offset_icon_tlut, 0x40 + 3072 + 512 + 1024 + 2048);
        assert_eq!(stat.offset_data, 0x40 + 3072 + 512 + 1024 + 2048 + 512);
    }

    #[test]
    fn rgb_banner_needs_no_palette() {
        let mut stat = CardStat::default();
        update_icon_offsets(&entry(BANNER_RGB5A3, 0, 0), &mut stat);
        assert_eq!(stat.offset_banner, 0);
        assert_eq!(stat.offset_banner_tlut, NO_ADDRESS);
        assert_eq!(stat.offset_icon_tlut, NO_ADDRESS);
        assert_eq!(stat.offset_data, 2 * 96 * 32);
    }

    #[test]
    fn missing_icon_address_clears_formats() {
        let mut stat = CardStat {
            banner_format: BANNER_C8,
            icon_format: 0xFFFF,
            icon_speed: 0xFFFF,
            ..CardStat::default()
        };
        update_icon_offsets(&entry(BANNER_NONE, NO_ADDRESS, 0), &mut stat);
        assert_eq!(stat.banner_format, BANNER_NONE);
        assert_eq!(stat.icon_format, ICON_NONE);
        assert_eq!(stat.icon_speed, SPEED_END);
        assert_eq!(stat.offset_banner, NO_ADDRESS);
        assert!(stat.offset_icon.iter().all(|&offset| offset == NO_ADDRESS));
        assert_eq!(stat.offset_data, 0);
    }

    #[test]
    fn packed_icon_fields() {
        let mut stat = CardStat::default();
        stat.set_icon_format(3, ICON_RGB5A3);
        stat.set_icon_speed(7, SPEED_SLOW);
        assert_eq!(stat.icon_format, 0b10 << 6);
        assert_eq!(stat.icon_format_of(3), ICON_RGB5A3);
        assert_eq!(stat.icon_speed_of(7), SPEED_SLOW);
        assert_eq!(stat.icon_format_of(8), ICON_NONE);
    }
}
