//! Directory blocks: 127 fixed 64-byte entries and a check footer.

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::checksum;
use crate::error::{CardError, CardResult};
use crate::layout::{DIR_ENTRY_SIZE, FILENAME_MAX, MAX_FILE, SYSTEM_BLOCK_SIZE};

pub const ATTR_PUBLIC: u8 = 0x04;

/// Marker byte of an unused slot (erased flash).
pub const FREE_MARK: u8 = 0xFF;

const FOOTER: usize = MAX_FILE * DIR_ENTRY_SIZE;
const FOOTER_CHECK_CODE: usize = FOOTER + DIR_ENTRY_SIZE - 6;
const FOOTER_CHECKSUM: usize = FOOTER + DIR_ENTRY_SIZE - 4;
const FOOTER_CHECKSUM_INV: usize = FOOTER + DIR_ENTRY_SIZE - 2;

/// Owning application of a file: 4-byte game code and 2-byte maker code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskId {
    pub game: [u8; 4],
    pub company: [u8; 2],
}

impl DiskId {
    /// Identity stamped on files created while no disk id is configured.
    pub const NONE: DiskId = DiskId {
        game: [0; 4],
        company: [0; 2],
    };

    pub const fn new(game: [u8; 4], company: [u8; 2]) -> Self {
        Self { game, company }
    }

    /// Builds an id from printable codes such as `"GALE"` and `"01"`.
    pub fn from_codes(game: &str, company: &str) -> Option<Self> {
        let game: [u8; 4] = game.as_bytes().try_into().ok()?;
        let company: [u8; 2] = company.as_bytes().try_into().ok()?;
        Some(Self { game, company })
    }
}

/// One decoded directory slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub game_name: [u8; 4],
    pub company: [u8; 2],
    pub padding0: u8,
    pub banner_format: u8,
    pub file_name: [u8; FILENAME_MAX],
    pub time: u32,
    pub icon_addr: u32,
    pub icon_format: u16,
    pub icon_speed: u16,
    pub permission: u8,
    pub copy_times: u8,
    pub start_block: u16,
    pub length: u16,
    pub padding1: u16,
    pub comment_addr: u32,
}

impl DirEntry {
    pub fn parse(bytes: &[u8]) -> Self {
        let mut game_name = [0u8; 4];
        game_name.copy_from_slice(&bytes[0..4]);
        let mut company = [0u8; 2];
        company.copy_from_slice(&bytes[4..6]);
        let mut file_name = [0u8; FILENAME_MAX];
        file_name.copy_from_slice(&bytes[8..40]);

        Self {
            game_name,
            company,
            padding0: bytes[6],
            banner_format: bytes[7],
            file_name,
            time: BigEndian::read_u32(&bytes[40..44]),
            icon_addr: BigEndian::read_u32(&bytes[44..48]),
            icon_format: BigEndian::read_u16(&bytes[48..50]),
            icon_speed: BigEndian::read_u16(&bytes[50..52]),
            permission: bytes[52],
            copy_times: bytes[53],
            start_block: BigEndian::read_u16(&bytes[54..56]),
            length: BigEndian::read_u16(&bytes[56..58]),
            padding1: BigEndian::read_u16(&bytes[58..60]),
            comment_addr: BigEndian::read_u32(&bytes[60..64]),
        }
    }

    pub fn write(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.game_name);
        bytes[4..6].copy_from_slice(&self.company);
        bytes[6] = self.padding0;
        bytes[7] = self.banner_format;
        bytes[8..40].copy_from_slice(&self.file_name);
        BigEndian::write_u32(&mut bytes[40..44], self.time);
        BigEndian::write_u32(&mut bytes[44..48], self.icon_addr);
        BigEndian::write_u16(&mut bytes[48..50], self.icon_format);
        BigEndian::write_u16(&mut bytes[50..52], self.icon_speed);
        bytes[52] = self.permission;
        bytes[53] = self.copy_times;
        BigEndian::write_u16(&mut bytes[54..56], self.start_block);
        BigEndian::write_u16(&mut bytes[56..58], self.length);
        BigEndian::write_u16(&mut bytes[58..60], self.padding1);
        BigEndian::write_u32(&mut bytes[60..64], self.comment_addr);
    }

    pub fn is_free(&self) -> bool {
        self.game_name[0] == FREE_MARK
    }

    pub fn disk_id(&self) -> DiskId {
        DiskId::new(self.game_name, self.company)
    }

    pub fn is_public(&self) -> bool {
        self.permission & ATTR_PUBLIC != 0
    }

    /// File name up to the first NUL, lossily decoded.
    pub fn name(&self) -> String {
        let end = self
            .file_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(FILENAME_MAX);
        String::from_utf8_lossy(&self.file_name[..end]).into_owned()
    }

    pub fn name_matches(&self, name: &[u8]) -> bool {
        compare_file_name(&self.file_name, name)
    }
}

/// Compares a stored name field with a query name.
///
/// The field is NUL padded. A query of exactly 32 bytes matches a field with
/// no terminator; anything longer never matches.
pub fn compare_file_name(field: &[u8; FILENAME_MAX], name: &[u8]) -> bool {
    for (i, &stored) in field.iter().enumerate() {
        let wanted = name.get(i).copied().unwrap_or(0);
        if stored != wanted {
            return false;
        }
        if wanted == 0 {
            return true;
        }
    }
    name.get(FILENAME_MAX).copied().unwrap_or(0) == 0
}

/// Encodes a name into a NUL-padded field, stopping at an embedded NUL.
pub fn encode_file_name(name: &[u8]) -> [u8; FILENAME_MAX] {
    let mut field = [0u8; FILENAME_MAX];
    for (slot, &byte) in field.iter_mut().zip(name.iter()) {
        if byte == 0 {
            break;
        }
        *slot = byte;
    }
    field
}

/// Ownership check: `disk_id` of `None` means the caller accepts any owner.
pub fn access(entry: &DirEntry, disk_id: Option<&DiskId>) -> CardResult<()> {
    if entry.is_free() {
        return Err(CardError::NoFile);
    }
    match disk_id {
        None => Ok(()),
        Some(id) if entry.game_name == id.game && entry.company == id.company => Ok(()),
        Some(_) => Err(CardError::NoPerm),
    }
}

pub fn is_public(entry: &DirEntry) -> CardResult<()> {
    if entry.is_free() {
        return Err(CardError::NoFile);
    }
    if entry.is_public() {
        Ok(())
    } else {
        Err(CardError::NoPerm)
    }
}

/// Ownership check that lets public files through for read-only use.
pub fn access_or_public(entry: &DirEntry, disk_id: Option<&DiskId>) -> CardResult<()> {
    match access(entry, disk_id) {
        Err(CardError::NoPerm) => is_public(entry),
        other => other,
    }
}

/// View over one directory copy.
pub struct Directory<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Directory<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    pub fn entry_bytes(&self, file_no: usize) -> &[u8] {
        let at = file_no * DIR_ENTRY_SIZE;
        &self.buf.as_ref()[at..at + DIR_ENTRY_SIZE]
    }

    pub fn entry(&self, file_no: usize) -> DirEntry {
        DirEntry::parse(self.entry_bytes(file_no))
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, DirEntry)> + '_ {
        (0..MAX_FILE).map(move |file_no| (file_no, self.entry(file_no)))
    }

    pub fn check_code(&self) -> u16 {
        BigEndian::read_u16(&self.buf.as_ref()[FOOTER_CHECK_CODE..])
    }

    pub fn checksum_ok(&self) -> bool {
        let bytes = self.buf.as_ref();
        checksum(&bytes[..SYSTEM_BLOCK_SIZE - 4])
            == (
                BigEndian::read_u16(&bytes[FOOTER_CHECKSUM..]),
                BigEndian::read_u16(&bytes[FOOTER_CHECKSUM_INV..]),
            )
    }

    /// Looks a name up among the files `disk_id` may access.
    pub fn find(&self, disk_id: Option<&DiskId>, name: &[u8]) -> CardResult<usize> {
        self.entries()
            .find(|(_, entry)| access(entry, disk_id).is_ok() && entry.name_matches(name))
            .map(|(file_no, _)| file_no)
            .ok_or(CardError::NoFile)
    }

    /// Slots whose name field still reads erased.
    pub fn unused_slots(&self) -> usize {
        (0..MAX_FILE)
            .filter(|&file_no| self.entry_bytes(file_no)[8] == FREE_MARK)
            .count()
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Directory<B> {
    pub fn entry_bytes_mut(&mut self, file_no: usize) -> &mut [u8] {
        let at = file_no * DIR_ENTRY_SIZE;
        &mut self.buf.as_mut()[at..at + DIR_ENTRY_SIZE]
    }

    pub fn set_entry(&mut self, file_no: usize, entry: &DirEntry) {
        entry.write(self.entry_bytes_mut(file_no));
    }

    pub fn clear(&mut self, file_no: usize) {
        self.entry_bytes_mut(file_no).fill(FREE_MARK);
    }

    /// Writes an empty directory with the given check code.
    pub fn format(&mut self, check_code: u16) {
        self.buf.as_mut()[..SYSTEM_BLOCK_SIZE].fill(FREE_MARK);
        BigEndian::write_u16(&mut self.buf.as_mut()[FOOTER_CHECK_CODE..], check_code);
        self.seal();
    }

    pub fn seal(&mut self) {
        let (sum, inv) = checksum(&self.buf.as_ref()[..SYSTEM_BLOCK_SIZE - 4]);
        let bytes = self.buf.as_mut();
        BigEndian::write_u16(&mut bytes[FOOTER_CHECKSUM..], sum);
        BigEndian::write_u16(&mut bytes[FOOTER_CHECKSUM_INV..], inv);
    }

    /// Bumps the check code and reseals.
    pub fn update(&mut self) {
        let code = self.check_code().wrapping_add(1);
        BigEndian::write_u16(&mut self.buf.as_mut()[FOOTER_CHECK_CODE..], code);
        self.seal();
    }
}
