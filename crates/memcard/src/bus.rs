//! Expansion-bus seam between the CARD layer and the slot hardware.
//!
//! The engine only ever talks to a card through [`ExiBus`]. Every data
//! transfer is framed by a five byte command: one opcode and the byte
//! address spread over the remaining four bytes.

use log::trace;

use crate::id::FlashId;
use crate::layout::{PAGE_SIZE, SEGMENT_SIZE};

pub const CMD_READ: u8 = 0x52;
pub const CMD_WRITE_PAGE: u8 = 0xF2;
pub const CMD_ERASE_SECTOR: u8 = 0xF1;
pub const CMD_READ_STATUS: u8 = 0x83;
pub const CMD_CLEAR_STATUS: u8 = 0x89;

/// Status bit raised once the unlock handshake succeeded.
pub const STATUS_UNLOCKED: u8 = 0x40;
/// Status bits reset by `CMD_CLEAR_STATUS`.
pub const STATUS_ERRORS: u8 = 0x18;

/// Outcome of asking a slot whether something is plugged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Absent,
    Busy,
    Present,
}

/// Slot-level primitives.
///
/// Methods returning `bool` report whether the device acknowledged the
/// request. Transfers may finish later than they are issued: the engine
/// calls [`complete`](ExiBus::complete) until it reports `true` before it
/// treats a transfer as done.
pub trait ExiBus {
    fn probe(&mut self, chan: usize) -> Probe;

    /// Device id of whatever sits in the slot.
    fn get_id(&mut self, chan: usize) -> Option<u32>;

    /// Whether the slot carries a vendor id (needed by some large cards).
    fn has_vendor_id(&mut self, _chan: usize) -> bool {
        false
    }

    /// Whether some other driver already claimed the slot.
    fn is_attached(&mut self, _chan: usize) -> bool {
        false
    }

    fn attach(&mut self, chan: usize) -> bool;

    fn detach(&mut self, chan: usize);

    /// Claims the bus for one transaction; `false` means someone else holds it.
    fn lock(&mut self, chan: usize) -> bool;

    fn release(&mut self, chan: usize);

    fn select(&mut self, chan: usize) -> bool;

    fn deselect(&mut self, chan: usize) -> bool;

    fn imm_write(&mut self, chan: usize, data: &[u8]) -> bool;

    fn imm_read(&mut self, chan: usize, data: &mut [u8]) -> bool;

    fn dma_read(&mut self, chan: usize, buf: &mut [u8]) -> bool;

    fn dma_write(&mut self, chan: usize, buf: &[u8]) -> bool;

    /// Runs the unlock exchange and returns the flash id the card reveals.
    fn handshake(&mut self, chan: usize, challenge: u32) -> Option<FlashId>;

    /// Reports whether the last issued transfer has finished.
    fn complete(&mut self, _chan: usize) -> bool {
        true
    }
}

pub fn encode_command(opcode: u8, addr: u32) -> [u8; 5] {
    [
        opcode,
        ((addr >> 17) & 0x7F) as u8,
        ((addr >> 9) & 0xFF) as u8,
        ((addr >> 7) & 0x03) as u8,
        (addr & 0x7F) as u8,
    ]
}

pub fn decode_address(command: &[u8]) -> Option<u32> {
    let bytes: [u8; 5] = command.get(..5)?.try_into().ok()?;
    let [_, a, b, c, d] = bytes;
    Some(
        (u32::from(a) & 0x7F) << 17
            | u32::from(b) << 9
            | (u32::from(c) & 0x03) << 7
            | (u32::from(d) & 0x7F),
    )
}

/// Why a transfer could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Issue {
    /// The bus is held elsewhere; try the same step again later.
    Busy,
    /// The device did not acknowledge.
    Failed,
}

fn locked<B: ExiBus + ?Sized, T>(
    bus: &mut B,
    chan: usize,
    f: impl FnOnce(&mut B) -> Option<T>,
) -> Result<T, Issue> {
    if !bus.lock(chan) {
        return Err(Issue::Busy);
    }
    let result = f(bus);
    bus.release(chan);
    result.ok_or(Issue::Failed)
}

fn selected<B: ExiBus + ?Sized>(bus: &mut B, chan: usize, f: impl FnOnce(&mut B) -> bool) -> bool {
    if !bus.select(chan) {
        return false;
    }
    let ok = f(bus);
    bus.deselect(chan) && ok
}

/// Clears the error bits and returns the status register.
pub(crate) fn read_status<B: ExiBus + ?Sized>(bus: &mut B, chan: usize) -> Result<u8, Issue> {
    locked(bus, chan, |bus| {
        if !selected(bus, chan, |bus| bus.imm_write(chan, &[CMD_CLEAR_STATUS])) {
            return None;
        }
        let mut status = [0u8; 1];
        let ok = selected(bus, chan, |bus| {
            bus.imm_write(chan, &[CMD_READ_STATUS, 0]) && bus.imm_read(chan, &mut status)
        });
        ok.then_some(status[0])
    })
}

/// Reads `buf.len()` bytes from `addr`, one segment per command.
pub(crate) fn read<B: ExiBus + ?Sized>(
    bus: &mut B,
    chan: usize,
    addr: u32,
    buf: &mut [u8],
) -> Result<(), Issue> {
    trace!("chan {chan}: read {:#x} bytes at {addr:#x}", buf.len());
    locked(bus, chan, |bus| {
        let mut at = addr;
        for segment in buf.chunks_mut(SEGMENT_SIZE as usize) {
            let command = encode_command(CMD_READ, at);
            let ok = selected(bus, chan, |bus| {
                bus.imm_write(chan, &command) && bus.dma_read(chan, segment)
            });
            if !ok {
                return None;
            }
            at += segment.len() as u32;
        }
        Some(())
    })
}

pub(crate) fn erase_sector<B: ExiBus + ?Sized>(
    bus: &mut B,
    chan: usize,
    addr: u32,
) -> Result<(), Issue> {
    trace!("chan {chan}: erase sector at {addr:#x}");
    let command = encode_command(CMD_ERASE_SECTOR, addr);
    locked(bus, chan, |bus| {
        selected(bus, chan, |bus| bus.imm_write(chan, &command)).then_some(())
    })
}

/// Programs `data` at `addr`, one page per command.
pub(crate) fn write<B: ExiBus + ?Sized>(
    bus: &mut B,
    chan: usize,
    addr: u32,
    data: &[u8],
) -> Result<(), Issue> {
    trace!("chan {chan}: write {:#x} bytes at {addr:#x}", data.len());
    locked(bus, chan, |bus| {
        let mut at = addr;
        for page in data.chunks(PAGE_SIZE) {
            let command = encode_command(CMD_WRITE_PAGE, at);
            let ok = selected(bus, chan, |bus| {
                bus.imm_write(chan, &command) && bus.dma_write(chan, page)
            });
            if !ok {
                return None;
            }
            at += page.len() as u32;
        }
        Some(())
    })
}

pub(crate) fn unlock<B: ExiBus + ?Sized>(
    bus: &mut B,
    chan: usize,
    challenge: u32,
) -> Result<FlashId, Issue> {
    locked(bus, chan, |bus| bus.handshake(chan, challenge))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_spreads_address_over_four_bytes() {
        assert_eq!(encode_command(CMD_READ, 0x2000), [0x52, 0x00, 0x10, 0x00, 0x00]);
        assert_eq!(
            encode_command(CMD_WRITE_PAGE, 0x0001_2380),
            [0xF2, 0x00, 0x91, 0x03, 0x00]
        );
    }

    #[test]
    fn decode_recovers_page_aligned_addresses() {
        for addr in [0u32, 0x80, 0x2000, 0x7E_0000, 0xFF_FF80, 0x12_3456] {
            let command = encode_command(CMD_ERASE_SECTOR, addr);
            assert_eq!(decode_address(&command), Some(addr));
        }
        assert_eq!(decode_address(&[CMD_READ, 0, 0]), None);
    }
}
