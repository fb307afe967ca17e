//! A memory card emulated on top of a [`BackingStore`], plugged into a
//! two-slot bus.

use std::io;

use log::{debug, warn};

use crate::bus::{
    decode_address, ExiBus, Probe, CMD_CLEAR_STATUS, CMD_ERASE_SECTOR, CMD_READ,
    CMD_READ_STATUS, CMD_WRITE_PAGE, STATUS_ERRORS, STATUS_UNLOCKED,
};
use crate::geometry::Geometry;
use crate::id::FlashId;
use crate::layout::PAGE_SIZE;
use crate::sram::CHANNELS;
use crate::store::{BackingStore, MemStore};

/// Card device that answers the CARD command set.
pub struct SimCard {
    device_id: u32,
    geometry: Geometry,
    flash_id: FlashId,
    status: u8,
    store: Box<dyn BackingStore>,
    last_challenge: Option<u32>,
}

impl SimCard {
    /// Card of the given shape over `store`. Fails when the shape is not a
    /// valid card or the store is smaller than the card.
    pub fn new(
        size_mbit: u16,
        sector_size: u32,
        flash_id: FlashId,
        store: Box<dyn BackingStore>,
    ) -> Option<Self> {
        let device_id = Geometry::device_id(size_mbit, sector_size)?;
        let geometry = Geometry::from_device_id(device_id, false)?;
        if store.len() < geometry.capacity() as usize {
            return None;
        }
        Some(Self {
            device_id,
            geometry,
            flash_id,
            status: 0,
            store,
            last_challenge: None,
        })
    }

    /// Erased card held in memory.
    pub fn blank(size_mbit: u16, sector_size: u32, flash_id: FlashId) -> Option<Self> {
        let device_id = Geometry::device_id(size_mbit, sector_size)?;
        let geometry = Geometry::from_device_id(device_id, false)?;
        let store = MemStore::new(geometry.capacity() as usize);
        Self::new(size_mbit, sector_size, flash_id, Box::new(store))
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn flash_id(&self) -> FlashId {
        self.flash_id
    }

    pub fn is_unlocked(&self) -> bool {
        self.status & STATUS_UNLOCKED != 0
    }

    pub fn last_challenge(&self) -> Option<u32> {
        self.last_challenge
    }

    pub fn store(&self) -> &dyn BackingStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn BackingStore {
        self.store.as_mut()
    }

    pub fn into_store(self) -> Box<dyn BackingStore> {
        self.store
    }

    /// Reads raw media bytes, bypassing the command interface.
    pub fn peek(&self, offset: usize, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.store.read(offset, &mut buf)?;
        Ok(buf)
    }

    /// Writes raw media bytes, bypassing the command interface.
    pub fn poke(&mut self, offset: usize, data: &[u8]) -> io::Result<()> {
        self.store.write(offset, data)
    }

    fn sector_base(&self, addr: u32) -> u32 {
        addr & !(self.geometry.sector_size - 1)
    }

    fn execute_read(&mut self, command: &[u8], buf: &mut [u8]) -> bool {
        if command.first() != Some(&CMD_READ) || !self.is_unlocked() {
            return false;
        }
        let Some(addr) = decode_address(command) else {
            return false;
        };
        match self.store.read(addr as usize, buf) {
            Ok(()) => true,
            Err(err) => {
                warn!("sim card: read at {addr:#x} failed: {err}");
                false
            }
        }
    }

    fn execute_write(&mut self, command: &[u8], page: &[u8]) -> bool {
        if command.first() != Some(&CMD_WRITE_PAGE) || !self.is_unlocked() || page.len() > PAGE_SIZE
        {
            return false;
        }
        let Some(addr) = decode_address(command) else {
            return false;
        };
        match self.store.write(addr as usize, page) {
            Ok(()) => true,
            Err(err) => {
                warn!("sim card: write at {addr:#x} failed: {err}");
                false
            }
        }
    }

    /// Commands that take effect when the card is deselected.
    fn finish_command(&mut self, command: &[u8]) -> bool {
        match command.first() {
            Some(&CMD_CLEAR_STATUS) => {
                self.status &= !STATUS_ERRORS;
                true
            }
            Some(&CMD_ERASE_SECTOR) => {
                if !self.is_unlocked() {
                    return false;
                }
                let Some(addr) = decode_address(command) else {
                    return false;
                };
                let base = self.sector_base(addr);
                let len = self.geometry.sector_size as usize;
                self.store.erase(base as usize, len).is_ok()
            }
            _ => true,
        }
    }
}

#[derive(Default)]
struct Slot {
    card: Option<SimCard>,
    attached: bool,
    locked: bool,
    held: u32,
    selected: bool,
    command: Vec<u8>,
    outstanding: bool,
}

/// Two-slot bus with optional deferred completion and fault injection.
#[derive(Default)]
pub struct SimBus {
    slots: [Slot; CHANNELS],
    deferred: bool,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_card(chan: usize, card: SimCard) -> Self {
        let mut bus = Self::new();
        bus.insert(chan, card);
        bus
    }

    pub fn insert(&mut self, chan: usize, card: SimCard) {
        self.slots[chan].card = Some(card);
    }

    /// Pulls the card out; outstanding and later transfers fail.
    pub fn eject(&mut self, chan: usize) -> Option<SimCard> {
        let slot = &mut self.slots[chan];
        slot.selected = false;
        slot.command.clear();
        slot.card.take()
    }

    pub fn card(&self, chan: usize) -> Option<&SimCard> {
        self.slots[chan].card.as_ref()
    }

    pub fn card_mut(&mut self, chan: usize) -> Option<&mut SimCard> {
        self.slots[chan].card.as_mut()
    }

    /// When set, each transaction completes only on the next poll.
    pub fn set_deferred(&mut self, deferred: bool) {
        self.deferred = deferred;
    }

    /// Makes the next `attempts` lock requests on `chan` fail.
    pub fn hold_lock(&mut self, chan: usize, attempts: u32) {
        self.slots[chan].held = attempts;
    }

    pub fn is_locked(&self, chan: usize) -> bool {
        self.slots[chan].locked
    }

    pub fn flush(&mut self, chan: usize) -> io::Result<()> {
        match self.slots[chan].card.as_mut() {
            Some(card) => card.store.flush(),
            None => Ok(()),
        }
    }

    fn active(&mut self, chan: usize) -> Option<(&mut SimCard, &mut Vec<u8>)> {
        let slot = self.slots.get_mut(chan)?;
        if !slot.selected {
            return None;
        }
        let card = slot.card.as_mut()?;
        Some((card, &mut slot.command))
    }
}

impl ExiBus for SimBus {
    fn probe(&mut self, chan: usize) -> Probe {
        match self.slots.get(chan) {
            Some(slot) if slot.card.is_some() => Probe::Present,
            _ => Probe::Absent,
        }
    }

    fn get_id(&mut self, chan: usize) -> Option<u32> {
        self.slots.get(chan)?.card.as_ref().map(|card| card.device_id)
    }

    fn attach(&mut self, chan: usize) -> bool {
        match self.slots.get_mut(chan) {
            Some(slot) if slot.card.is_some() && !slot.attached => {
                slot.attached = true;
                true
            }
            _ => false,
        }
    }

    fn detach(&mut self, chan: usize) {
        if let Some(slot) = self.slots.get_mut(chan) {
            slot.attached = false;
            slot.locked = false;
            slot.selected = false;
            slot.outstanding = false;
        }
    }

    fn lock(&mut self, chan: usize) -> bool {
        let Some(slot) = self.slots.get_mut(chan) else {
            return false;
        };
        if slot.held > 0 {
            slot.held -= 1;
            debug!("sim bus: lock on channel {chan} refused");
            return false;
        }
        if slot.locked {
            return false;
        }
        slot.locked = true;
        true
    }

    fn release(&mut self, chan: usize) {
        if let Some(slot) = self.slots.get_mut(chan) {
            slot.locked = false;
        }
    }

    fn select(&mut self, chan: usize) -> bool {
        match self.slots.get_mut(chan) {
            Some(slot) if slot.card.is_some() && slot.locked && !slot.selected => {
                slot.selected = true;
                slot.command.clear();
                true
            }
            _ => false,
        }
    }

    fn deselect(&mut self, chan: usize) -> bool {
        let deferred = self.deferred;
        let Some(slot) = self.slots.get_mut(chan) else {
            return false;
        };
        if !slot.selected {
            return false;
        }
        slot.selected = false;
        let command = std::mem::take(&mut slot.command);
        let ok = match slot.card.as_mut() {
            Some(card) => card.finish_command(&command),
            None => false,
        };
        slot.outstanding |= deferred;
        ok
    }

    fn imm_write(&mut self, chan: usize, data: &[u8]) -> bool {
        match self.active(chan) {
            Some((_, command)) => {
                command.extend_from_slice(data);
                true
            }
            None => false,
        }
    }

    fn imm_read(&mut self, chan: usize, data: &mut [u8]) -> bool {
        let Some((card, command)) = self.active(chan) else {
            return false;
        };
        data.fill(0);
        if command.first() == Some(&CMD_READ_STATUS) {
            if let Some(first) = data.first_mut() {
                *first = card.status;
            }
        }
        true
    }

    fn dma_read(&mut self, chan: usize, buf: &mut [u8]) -> bool {
        match self.active(chan) {
            Some((card, command)) => card.execute_read(command, buf),
            None => false,
        }
    }

    fn dma_write(&mut self, chan: usize, buf: &[u8]) -> bool {
        match self.active(chan) {
            Some((card, command)) => card.execute_write(command, buf),
            None => false,
        }
    }

    fn handshake(&mut self, chan: usize, challenge: u32) -> Option<FlashId> {
        let deferred = self.deferred;
        let slot = self.slots.get_mut(chan)?;
        if !slot.locked {
            return None;
        }
        let card = slot.card.as_mut()?;
        card.last_challenge = Some(challenge);
        card.status |= STATUS_UNLOCKED;
        slot.outstanding |= deferred;
        debug!("sim card on channel {chan} unlocked");
        Some(card.flash_id)
    }

    fn complete(&mut self, chan: usize) -> bool {
        match self.slots.get_mut(chan) {
            Some(slot) if slot.outstanding => {
                slot.outstanding = false;
                false
            }
            _ => true,
        }
    }
}
