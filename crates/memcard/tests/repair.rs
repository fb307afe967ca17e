use memcard::fat::{Fat, EOC, FREE_BLOCKS};
use memcard::layout::SYSTEM_BLOCK_SIZE;
use memcard::{CardError, CardSystem, MountState, SimBus, SimCard, Sram, StepClock};

const FLASH_ID: [u8; 12] = *b"MEMCARD-TEST";
const SECTOR: u32 = 8192;

type Card = CardSystem<SimBus, Sram, StepClock>;

/// Formatted 4 Mbit card holding one two-block file.
fn card_with_file() -> Card {
    let card = SimCard::blank(4, SECTOR, FLASH_ID).expect("4 Mbit card");
    let mut system = CardSystem::with_parts(SimBus::with_card(0, card), Sram::default(), StepClock::new(0));
    system.format(0).expect("format");
    system.create(0, "save", 2 * SECTOR).expect("create");
    system
}

fn block_offset(block: usize) -> usize {
    block * SYSTEM_BLOCK_SIZE
}

/// Flips one byte of a system block on the medium.
fn damage(system: &mut Card, block: usize, at: usize) {
    let card = system.bus_mut().card_mut(0).expect("card in slot 0");
    let offset = block_offset(block) + at;
    let byte = card.peek(offset, 1).expect("peek")[0];
    card.poke(offset, &[!byte]).expect("poke");
}

/// Marks `block` as allocated in both FAT copies without any file owning it.
fn leak_block(system: &mut Card, block: u16) {
    let card = system.bus_mut().card_mut(0).expect("card in slot 0");
    for fat_block in [3, 4] {
        let offset = block_offset(fat_block);
        let mut bytes = card.peek(offset, SYSTEM_BLOCK_SIZE).expect("peek");
        let mut fat = Fat::new(&mut bytes[..], 64);
        fat.set_entry(block, EOC);
        let free = fat.free_blocks() - 1;
        fat.set_entry(FREE_BLOCKS, free);
        fat.seal();
        card.poke(offset, &bytes).expect("poke");
    }
}

fn remount(system: &mut Card) -> Result<(), CardError> {
    system.unmount(0)?;
    system.mount(0)
}

#[test]
fn damaged_directory_copy_is_restored() {
    let mut system = card_with_file();
    // Block 2 still holds the directory as it was before the create.
    damage(&mut system, 2, 100);

    assert_eq!(remount(&mut system), Err(CardError::Broken));
    assert!(system.is_attached(0));
    assert_eq!(system.mount_state(0), MountState::Failed(CardError::Broken));
    assert_eq!(system.result_code(0), CardError::Broken.code());

    assert_eq!(system.check(0), Ok(SECTOR));
    assert_eq!(system.mount_state(0), MountState::Failed(CardError::Broken));
    assert_eq!(system.check(0), Ok(0));
    assert_eq!(system.mount_state(0), MountState::Ready);
    assert!(system.open(0, "save").is_ok());
    assert_eq!(remount(&mut system), Ok(()));
}

#[test]
fn restoring_from_the_older_copy_loses_the_last_commit() {
    let mut system = card_with_file();
    damage(&mut system, 1, 100);

    assert_eq!(remount(&mut system), Err(CardError::Broken));
    // The surviving directory predates the file, so its blocks are orphans.
    assert_eq!(system.check(0), Ok(SECTOR));
    assert_eq!(system.check(0), Ok(SECTOR));
    assert_eq!(system.check(0), Ok(0));
    assert_eq!(system.open(0, "save"), Err(CardError::NoFile));
    assert_eq!(system.free_blocks(0), Ok((59 * SECTOR, 127)));
}

#[test]
fn damaged_fat_copy_is_restored() {
    let mut system = card_with_file();
    damage(&mut system, 4, 300);

    assert_eq!(remount(&mut system), Err(CardError::Broken));
    assert_eq!(system.check(0), Ok(SECTOR));
    assert_eq!(remount(&mut system), Ok(()));
    assert_eq!(system.free_blocks(0), Ok((57 * SECTOR, 126)));
}

#[test]
fn two_damaged_copies_unmount_the_card() {
    let mut system = card_with_file();
    damage(&mut system, 1, 100);
    damage(&mut system, 2, 100);

    assert_eq!(remount(&mut system), Err(CardError::Broken));
    assert!(!system.is_attached(0));
    assert_eq!(system.check(0), Err(CardError::NoCard));

    let mut system = card_with_file();
    damage(&mut system, 2, 40);
    damage(&mut system, 3, 40);
    assert_eq!(remount(&mut system), Err(CardError::Broken));
    assert!(!system.is_attached(0));
}

#[test]
fn damaged_id_block_unmounts_the_card() {
    let mut system = card_with_file();
    damage(&mut system, 0, 20);
    assert_eq!(remount(&mut system), Err(CardError::Broken));
    assert!(!system.is_attached(0));
}

#[test]
fn orphaned_blocks_are_reclaimed() {
    let mut system = card_with_file();
    leak_block(&mut system, 20);

    remount(&mut system).expect("both copies agree");
    assert_eq!(system.free_blocks(0), Ok((56 * SECTOR, 126)));

    assert_eq!(system.check(0), Ok(SECTOR));
    assert_eq!(system.free_blocks(0), Ok((57 * SECTOR, 126)));
    assert_eq!(system.check(0), Ok(0));

    remount(&mut system).expect("repaired card mounts");
    assert_eq!(system.free_blocks(0), Ok((57 * SECTOR, 126)));
}

#[test]
fn directory_and_fat_repairs_take_two_passes() {
    let mut system = card_with_file();
    leak_block(&mut system, 30);
    damage(&mut system, 2, 100);

    assert_eq!(remount(&mut system), Err(CardError::Broken));
    assert_eq!(system.check(0), Ok(SECTOR));
    assert_eq!(system.check(0), Ok(SECTOR));
    assert_eq!(system.check(0), Ok(0));

    remount(&mut system).expect("repaired card mounts");
    assert_eq!(system.free_blocks(0), Ok((57 * SECTOR, 126)));
}

#[test]
fn foreign_encoding_keeps_the_card_for_formatting() {
    let mut system = card_with_file();
    system.sram_mut().font_encode = 1;

    assert_eq!(remount(&mut system), Err(CardError::Encoding));
    assert!(system.is_attached(0));
    assert_eq!(system.mount_state(0), MountState::Failed(CardError::Encoding));

    system.format(0).expect("format under the new encoding");
    assert_eq!(remount(&mut system), Ok(()));
    assert_eq!(system.free_blocks(0), Ok((59 * SECTOR, 127)));
}
