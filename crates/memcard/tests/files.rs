use memcard::dir::Directory;
use memcard::layout::SYSTEM_BLOCK_SIZE;
use memcard::stat::{BANNER_C8, ICON_C8, NO_ADDRESS, SPEED_FAST, SPEED_SLOW};
use memcard::{
    CardError, CardSystem, DiskId, MountState, SimBus, SimCard, Sram, StepClock,
};

const FLASH_ID: [u8; 12] = *b"MEMCARD-TEST";
const SECTOR: u32 = 8192;

type Card = CardSystem<SimBus, Sram, StepClock>;

fn formatted_card(size_mbit: u16) -> Card {
    let card = SimCard::blank(size_mbit, SECTOR, FLASH_ID).expect("card shape");
    let mut system = CardSystem::with_parts(SimBus::with_card(0, card), Sram::default(), StepClock::new(0));
    system.format(0).expect("format");
    system
}

fn card_bytes(system: &Card) -> Vec<u8> {
    let card = system.bus().card(0).expect("card in slot 0");
    card.peek(0, card.geometry().capacity() as usize).expect("peek")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn format_unlocks_and_leaves_a_clean_card() {
    let mut system = formatted_card(4);
    assert_eq!(system.mount_state(0), MountState::Ready);
    assert!(system
        .bus()
        .card(0)
        .is_some_and(|card| card.is_unlocked() && card.last_challenge().is_some()));
    assert_eq!(system.sram().flash_id[0], FLASH_ID);

    assert_eq!(system.check(0), Ok(0));
    assert_eq!(system.free_blocks(0), Ok((59 * SECTOR, 127)));
    assert_eq!(system.probe_ex(0), Ok((4, SECTOR)));

    system.unmount(0).expect("unmount");
    assert_eq!(system.free_blocks(0), Err(CardError::NoCard));
    system.mount(0).expect("mount");
    assert_eq!(system.mount_state(0), MountState::Ready);
    assert_eq!(system.check(0), Ok(0));
}

#[test]
fn create_allocates_from_the_first_data_block() {
    let mut system = formatted_card(4);
    let file = system.create(0, "save", 2 * SECTOR).expect("create");
    assert_eq!(file.block, 5);
    assert_eq!(file.offset, 0);
    assert_eq!(system.free_blocks(0), Ok((57 * SECTOR, 126)));

    let entries = system.entries(0).expect("entries");
    assert_eq!(entries.len(), 1);
    let (file_no, entry) = &entries[0];
    assert_eq!(*file_no, file.file_no);
    assert_eq!(entry.name(), "save");
    assert_eq!(entry.start_block, 5);
    assert_eq!(entry.length, 2);
    assert_eq!(entry.icon_addr, NO_ADDRESS);
    assert_eq!(entry.icon_speed, SPEED_FAST);
    assert_eq!(entry.disk_id(), DiskId::NONE);
    assert_eq!(system.check(0), Ok(0));

    system.unmount(0).expect("unmount");
    system.mount(0).expect("mount");
    let opened = system.open(0, "save").expect("open");
    assert_eq!(opened.block, 5);
    system.close(opened).expect("close");
}

#[test]
fn rejected_creates_leave_the_card_untouched() {
    let mut system = formatted_card(4);
    system.create(0, "save", SECTOR).expect("create");
    let before = card_bytes(&system);
    let work = system.work_area(0).expect("work area").as_bytes().to_vec();

    assert_eq!(system.create(0, "save", SECTOR), Err(CardError::Exist));
    assert_eq!(system.create(0, "big", 59 * SECTOR), Err(CardError::InsufficientSpace));
    assert_eq!(system.create(0, "odd", SECTOR + 1), Err(CardError::FatalError));
    assert_eq!(system.create(0, "", SECTOR), Err(CardError::FatalError));
    assert_eq!(system.create(0, &"n".repeat(33), SECTOR), Err(CardError::NameTooLong));

    assert_eq!(card_bytes(&system), before);
    assert_eq!(system.work_area(0).expect("work area").as_bytes(), &work[..]);
    // Argument errors caught before the control block leave the last result.
    assert_eq!(system.result_code(0), CardError::FatalError.code());
}

#[test]
fn full_directory_is_no_ent() {
    let mut system = formatted_card(16);
    for n in 0..127 {
        system.create(0, &format!("f{n:03}"), SECTOR).expect("create");
    }
    assert_eq!(system.create(0, "one-more", SECTOR), Err(CardError::NoEnt));
    assert_eq!(system.free_blocks(0), Ok(((251 - 127) * SECTOR, 0)));
    assert_eq!(system.check(0), Ok(0));
}

#[test]
fn write_then_read_back() -> Result<(), Box<dyn std::error::Error>> {
    let mut system = formatted_card(4);
    let mut file = system.create(0, "save", 2 * SECTOR)?;
    let data = pattern(2 * SECTOR as usize);

    let clock_before = system.clock().current();
    system.write(&mut file, &data, 0)?;
    // One time stamp per write, not per sector.
    assert_eq!(system.clock().current(), clock_before + 1);
    assert_eq!(system.get_status(0, file.file_no)?.time, clock_before + 1);

    let mut buf = vec![0u8; data.len()];
    system.read(&mut file, &mut buf, 0)?;
    assert_eq!(buf, data);

    // Straddling the sector boundary.
    let mut buf = vec![0u8; 1024];
    system.read(&mut file, &mut buf, SECTOR - 512)?;
    assert_eq!(&buf[..], &data[SECTOR as usize - 512..SECTOR as usize + 512]);

    let mut buf = vec![0u8; 512];
    system.read(&mut file, &mut buf, SECTOR + 512)?;
    assert_eq!(&buf[..], &data[SECTOR as usize + 512..SECTOR as usize + 1024]);
    assert_eq!(file.block, 6);

    // Rewrite only the second sector.
    let second = vec![0xA5; SECTOR as usize];
    system.write(&mut file, &second, SECTOR)?;
    let mut buf = vec![0u8; data.len()];
    system.read(&mut file, &mut buf, 0)?;
    assert_eq!(&buf[..SECTOR as usize], &data[..SECTOR as usize]);
    assert_eq!(&buf[SECTOR as usize..], &second[..]);
    Ok(())
}

#[test]
fn transfers_outside_the_rules_are_refused() {
    let mut system = formatted_card(4);
    let mut file = system.create(0, "save", 2 * SECTOR).expect("create");

    let mut buf = vec![0u8; 512];
    assert_eq!(system.read(&mut file, &mut buf, 2 * SECTOR), Err(CardError::Limit));
    assert_eq!(system.read(&mut file, &mut buf, 100), Err(CardError::FatalError));
    let mut short = vec![0u8; 100];
    assert_eq!(system.read(&mut file, &mut short, 0), Err(CardError::FatalError));
    assert_eq!(system.read(&mut file, &mut [], 0), Err(CardError::FatalError));

    assert_eq!(system.write(&mut file, &[0; 512], 0), Err(CardError::FatalError));
    assert_eq!(system.write(&mut file, &[], 0), Err(CardError::FatalError));
    assert_eq!(
        system.write(&mut file, &vec![0; 3 * SECTOR as usize], 0),
        Err(CardError::Limit)
    );
    assert!(!system.is_busy(0));
}

#[test]
fn delete_returns_blocks() {
    let mut system = formatted_card(4);
    system.create(0, "first", 3 * SECTOR).expect("create");
    let second = system.create(0, "second", 2 * SECTOR).expect("create");
    assert_eq!(second.block, 8);

    system.delete(0, "first").expect("delete");
    assert_eq!(system.free_blocks(0), Ok((57 * SECTOR, 126)));
    assert_eq!(system.open(0, "first"), Err(CardError::NoFile));
    assert_eq!(system.delete(0, "first"), Err(CardError::NoFile));
    assert_eq!(system.check(0), Ok(0));

    system.fast_delete(0, second.file_no).expect("fast delete");
    assert_eq!(system.free_blocks(0), Ok((59 * SECTOR, 127)));
    assert_eq!(system.fast_delete(0, second.file_no), Err(CardError::NoFile));
    assert_eq!(system.fast_delete(0, 127), Err(CardError::FatalError));
}

#[test]
fn ownership_follows_the_disk_id() {
    let mut system = formatted_card(4);
    let game = DiskId::new(*b"GALE", *b"01");
    let other = DiskId::new(*b"GMPE", *b"01");

    system.set_disk_id(Some(game));
    let file = system.create(0, "shared", SECTOR).expect("create");
    system.set_disk_id(Some(other));
    system.create(0, "shared", SECTOR).expect("same name, other owner");

    // Files start public: others can open by index but never modify.
    let mut opened = system.fast_open(0, file.file_no).expect("fast open");
    let mut buf = vec![0u8; 512];
    system.read(&mut opened, &mut buf, 0).expect("read public file");
    assert_eq!(
        system.write(&mut opened, &vec![0; SECTOR as usize], 0),
        Err(CardError::NoPerm)
    );
    assert_eq!(system.fast_delete(0, file.file_no), Err(CardError::NoPerm));

    let mine = system.open(0, "shared").expect("open own file");
    assert_ne!(mine.file_no, file.file_no);
    assert_eq!(system.entries(0).map(|entries| entries.len()), Ok(1));

    system.set_disk_id(None);
    assert_eq!(system.entries(0).map(|entries| entries.len()), Ok(2));
}

#[test]
fn status_layout_round_trips() -> Result<(), Box<dyn std::error::Error>> {
    let mut system = formatted_card(4);
    let file = system.create(0, "save", SECTOR)?;

    let mut stat = system.get_status(0, file.file_no)?;
    assert_eq!(stat.name(), "save");
    assert_eq!(stat.length, SECTOR);
    assert_eq!(stat.offset_data, 0);

    stat.icon_addr = 0;
    stat.banner_format = BANNER_C8;
    stat.icon_format = 0;
    stat.set_icon_format(0, ICON_C8);
    stat.set_icon_speed(0, SPEED_SLOW);
    stat.comment_addr = 0x1000;
    system.set_status(0, file.file_no, &mut stat)?;
    assert_eq!(stat.offset_banner_tlut, 96 * 32);
    assert_eq!(stat.offset_icon[0], 96 * 32 + 512);
    assert_eq!(stat.offset_icon_tlut, 96 * 32 + 512 + 32 * 32);
    assert_eq!(stat.offset_data, 96 * 32 + 512 + 32 * 32 + 512);

    let read_back = system.get_status(0, file.file_no)?;
    assert_eq!(read_back.icon_format_of(0), ICON_C8);
    assert_eq!(read_back.icon_speed_of(0), SPEED_SLOW);
    assert_eq!(read_back.comment_addr, 0x1000);
    assert_eq!(read_back.offset_data, stat.offset_data);

    let mut bad = read_back.clone();
    bad.icon_addr = 512;
    assert_eq!(system.set_status(0, file.file_no, &mut bad), Err(CardError::FatalError));
    let mut bad = read_back.clone();
    bad.comment_addr = 8192 - 63;
    assert_eq!(system.set_status(0, file.file_no, &mut bad), Err(CardError::FatalError));

    let mut plain = read_back;
    plain.icon_addr = NO_ADDRESS;
    plain.icon_speed = 0xFFFF;
    system.set_status(0, file.file_no, &mut plain)?;
    assert_eq!(plain.icon_speed, SPEED_FAST);
    let entries = system.entries(0)?;
    assert_eq!(entries[0].1.icon_speed, 0xFFFD);
    assert_eq!(system.check(0), Ok(0));
    Ok(())
}

#[test]
fn oversized_entry_length_is_broken() {
    const BIG_SECTOR: u32 = 128 * 1024;
    let card = SimCard::blank(128, BIG_SECTOR, FLASH_ID).expect("128 Mbit card");
    let mut system = CardSystem::with_parts(SimBus::with_card(0, card), Sram::default(), StepClock::new(0));
    system.format(0).expect("format");
    let file = system.create(0, "save", BIG_SECTOR).expect("create");
    assert_eq!(system.get_status(0, file.file_no).map(|stat| stat.length), Ok(BIG_SECTOR));

    // A directory with a valid footer can still claim more bytes than fit in a u32.
    let card = system.bus_mut().card_mut(0).expect("card in slot 0");
    let copies: Vec<Vec<u8>> = [1usize, 2]
        .iter()
        .map(|block| card.peek(block * BIG_SECTOR as usize, SYSTEM_BLOCK_SIZE).expect("peek"))
        .collect();
    let mut entry = copies
        .iter()
        .map(|bytes| Directory::new(&bytes[..]).entry(file.file_no))
        .find(|entry| !entry.is_free())
        .expect("entry on the medium");
    entry.length = u16::MAX;
    for (block, mut bytes) in [1usize, 2].into_iter().zip(copies) {
        let mut dir = Directory::new(&mut bytes[..]);
        dir.set_entry(file.file_no, &entry);
        dir.seal();
        card.poke(block * BIG_SECTOR as usize, &bytes).expect("poke");
    }

    system.unmount(0).expect("unmount");
    system.mount(0).expect("footers still verify");
    assert_eq!(system.get_status(0, file.file_no), Err(CardError::Broken));
}
