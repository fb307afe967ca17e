//! Battery-backed settings the CARD layer reads and writes.

use crate::id::FlashId;

pub const CHANNELS: usize = 2;

pub const FONT_ENCODE_ANSI: u16 = 0;
pub const FONT_ENCODE_SJIS: u16 = 1;

/// Per-slot secrets and locale settings consulted during unlock, format and
/// id verification.
pub trait IdentityStore {
    fn flash_id(&self, chan: usize) -> FlashId;

    fn flash_id_checksum(&self, chan: usize) -> u8;

    /// Records the flash id a card reported while unlocking.
    fn store_flash_id(&mut self, chan: usize, flash_id: &FlashId);

    fn counter_bias(&self) -> u32;

    fn language(&self) -> u8;

    fn font_encode(&self) -> u16;
}

/// Checksum byte stored next to a flash id.
pub fn flash_id_checksum(flash_id: &FlashId) -> u8 {
    !flash_id.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Plain in-memory settings record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sram {
    pub flash_id: [FlashId; CHANNELS],
    pub flash_id_checksum: [u8; CHANNELS],
    pub counter_bias: u32,
    pub language: u8,
    pub font_encode: u16,
}

impl Sram {
    /// Settings that already trust `flash_id` on every channel.
    pub fn with_flash_id(flash_id: FlashId) -> Self {
        let mut sram = Self::default();
        for chan in 0..CHANNELS {
            sram.store_flash_id(chan, &flash_id);
        }
        sram
    }
}

impl IdentityStore for Sram {
    fn flash_id(&self, chan: usize) -> FlashId {
        self.flash_id[chan]
    }

    fn flash_id_checksum(&self, chan: usize) -> u8 {
        self.flash_id_checksum[chan]
    }

    fn store_flash_id(&mut self, chan: usize, flash_id: &FlashId) {
        self.flash_id[chan] = *flash_id;
        self.flash_id_checksum[chan] = flash_id_checksum(flash_id);
    }

    fn counter_bias(&self) -> u32 {
        self.counter_bias
    }

    fn language(&self) -> u8 {
        self.language
    }

    fn font_encode(&self) -> u16 {
        self.font_encode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_complement_of_byte_sum() {
        assert_eq!(flash_id_checksum(&[0; 12]), 0xFF);
        assert_eq!(flash_id_checksum(&[1; 12]), !12u8);

        let sram = Sram::with_flash_id([0x80; 12]);
        assert_eq!(sram.flash_id_checksum(1), 0xFF);
    }
}
