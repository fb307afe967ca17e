//! Block 0: the card id record written at format time.
//!
//! The first 12 bytes are a signature tying the medium to the flash id the
//! slot reported during unlock, so a card formatted in one console is
//! recognised as foreign in another.

use byteorder::{BigEndian, ByteOrder};

use crate::checksum::checksum;
use crate::error::{CardError, CardResult};
use crate::layout::ID_SIZE;

pub const SIGNATURE_LEN: usize = 12;
pub const OFF_FORMAT_TIME: usize = 12;
pub const OFF_COUNTER_BIAS: usize = 20;
pub const OFF_LANGUAGE: usize = 24;
pub const OFF_DTV_STATUS: usize = 28;
pub const OFF_DEVICE_ID: usize = 32;
pub const OFF_SIZE: usize = 34;
pub const OFF_ENCODE: usize = 36;
pub const OFF_CHECKSUM: usize = ID_SIZE - 4;
pub const OFF_CHECKSUM_INV: usize = ID_SIZE - 2;

pub type FlashId = [u8; SIGNATURE_LEN];

fn lcg(x: u64) -> u64 {
    x.wrapping_mul(1_103_515_245).wrapping_add(12_345) >> 16
}

/// Derives the signature bytes from a flash id and the format time stamp.
pub fn signature(flash_id: &FlashId, format_time: u64) -> FlashId {
    let mut out = [0u8; SIGNATURE_LEN];
    let mut rand = format_time;
    for (byte, &secret) in out.iter_mut().zip(flash_id.iter()) {
        rand = lcg(rand);
        *byte = secret.wrapping_add(rand as u8);
        rand = lcg(rand) & 0x7FFF;
    }
    out
}

/// Values stamped into a freshly formatted id block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdRecord {
    pub format_time: u64,
    pub counter_bias: u32,
    pub language: u32,
    pub size_mbit: u16,
    pub encode: u16,
}

/// Fills `block` (one full system block) with an id record.
pub fn format_id(block: &mut [u8], record: &IdRecord, flash_id: &FlashId) {
    block.fill(0xFF);
    block[..SIGNATURE_LEN].copy_from_slice(&signature(flash_id, record.format_time));
    BigEndian::write_u64(&mut block[OFF_FORMAT_TIME..], record.format_time);
    BigEndian::write_u32(&mut block[OFF_COUNTER_BIAS..], record.counter_bias);
    BigEndian::write_u32(&mut block[OFF_LANGUAGE..], record.language);
    BigEndian::write_u32(&mut block[OFF_DTV_STATUS..], 0);
    BigEndian::write_u16(&mut block[OFF_DEVICE_ID..], 0);
    BigEndian::write_u16(&mut block[OFF_SIZE..], record.size_mbit);
    BigEndian::write_u16(&mut block[OFF_ENCODE..], record.encode);

    let (sum, inv) = checksum(&block[..OFF_CHECKSUM]);
    BigEndian::write_u16(&mut block[OFF_CHECKSUM..], sum);
    BigEndian::write_u16(&mut block[OFF_CHECKSUM_INV..], inv);
}

/// Validates an id block against the mounted geometry, the active font
/// encoding and the slot's flash id.
///
/// Geometry and checksum failures, and a foreign signature, are `Broken`.
/// A block that is otherwise sound but written under another encoding is
/// `Encoding`.
pub fn verify_id(block: &[u8], size_mbit: u16, encode: u16, flash_id: &FlashId) -> CardResult<()> {
    if device_id(block) != 0 || size(block) != size_mbit {
        return Err(CardError::Broken);
    }

    let stored = (
        BigEndian::read_u16(&block[OFF_CHECKSUM..]),
        BigEndian::read_u16(&block[OFF_CHECKSUM_INV..]),
    );
    if checksum(&block[..OFF_CHECKSUM]) != stored {
        return Err(CardError::Broken);
    }

    if self::encode(block) != encode {
        return Err(CardError::Encoding);
    }

    if block[..SIGNATURE_LEN] != signature(flash_id, format_time(block)) {
        return Err(CardError::Broken);
    }
    Ok(())
}

pub fn device_id(block: &[u8]) -> u16 {
    BigEndian::read_u16(&block[OFF_DEVICE_ID..])
}

pub fn size(block: &[u8]) -> u16 {
    BigEndian::read_u16(&block[OFF_SIZE..])
}

pub fn encode(block: &[u8]) -> u16 {
    BigEndian::read_u16(&block[OFF_ENCODE..])
}

pub fn format_time(block: &[u8]) -> u64 {
    BigEndian::read_u64(&block[OFF_FORMAT_TIME..])
}

/// XOR of the four big-endian words making up the first 32 bytes.
pub fn serial_number(block: &[u8]) -> u64 {
    block[..32]
        .chunks_exact(8)
        .fold(0, |acc, word| acc ^ BigEndian::read_u64(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::SYSTEM_BLOCK_SIZE;

    const FLASH_ID: FlashId = [
        0x10, 0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A, 0x1B,
    ];

    fn record() -> IdRecord {
        IdRecord {
            format_time: 0x0123_4567_89AB_CDEF,
            counter_bias: 0,
            language: 0,
            size_mbit: 4,
            encode: 0,
        }
    }

    #[test]
    fn signature_matches_known_stream() {
        assert_eq!(
            signature(&FLASH_ID, 0x0123_4567_89AB_CDEF),
            [0xCF, 0x85, 0x19, 0xE4, 0x21, 0xB3, 0x25, 0x79, 0xB3, 0x2B, 0x72, 0x58]
        );
        assert_eq!(signature(&[0; 12], 0), [0; 12]);
    }

    #[test]
    fn formatted_block_verifies() {
        let mut block = vec![0u8; SYSTEM_BLOCK_SIZE];
        format_id(&mut block, &record(), &FLASH_ID);

        assert_eq!(verify_id(&block, 4, 0, &FLASH_ID), Ok(()));
        assert_eq!(format_time(&block), 0x0123_4567_89AB_CDEF);
        assert_eq!(block[ID_SIZE], 0xFF);
    }

    #[test]
    fn verify_reports_each_failure() {
        let mut block = vec![0u8; SYSTEM_BLOCK_SIZE];
        format_id(&mut block, &record(), &FLASH_ID);

        assert_eq!(verify_id(&block, 8, 0, &FLASH_ID), Err(CardError::Broken));
        assert_eq!(verify_id(&block, 4, 1, &FLASH_ID), Err(CardError::Encoding));

        let mut other = FLASH_ID;
        other[0] ^= 1;
        assert_eq!(verify_id(&block, 4, 0, &other), Err(CardError::Broken));

        block[100] ^= 0x40;
        assert_eq!(verify_id(&block, 4, 0, &FLASH_ID), Err(CardError::Broken));
    }

    #[test]
    fn serial_number_folds_the_first_32_bytes() {
        let block: Vec<u8> = (0..64u32).map(|i| ((i * i + 3) & 0xFF) as u8).collect();
        assert_eq!(serial_number(&block), 0x0000_80C0_0040_8000);
    }
}
