use std::env;
use std::path::Path;
use std::process;

use memcard::clock::to_datetime;
use memcard::{CardSystem, ImageFile, SimBus, SimCard};

const FLASH_ID: [u8; 12] = [0; 12];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let path = env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: cargo run --example inspect -- <path-to-card-image> [size-mbit]");
        process::exit(1);
    });
    let size_mbit: u16 = match env::args().nth(2) {
        Some(size) => size.parse()?,
        None => 4,
    };

    let capacity = usize::from(size_mbit) * 1024 * 1024 / 8;
    let image = ImageFile::open(Path::new(&path), capacity)?;
    let card = SimCard::new(size_mbit, 8192, FLASH_ID, Box::new(image))
        .ok_or("unsupported card size")?;
    let mut system = CardSystem::new(SimBus::with_card(0, card));

    if let Err(err) = system.mount(0) {
        eprintln!("mount failed: {err}");
        if !system.is_attached(0) {
            process::exit(1);
        }
    }

    let (free, slots) = system.free_blocks(0)?;
    eprintln!("{free} bytes free, {slots} directory slots unused");
    for (file_no, entry) in system.entries(0)? {
        eprintln!(
            "{file_no:3} {}{} {:32} {:4} blocks  {}",
            String::from_utf8_lossy(&entry.game_name),
            String::from_utf8_lossy(&entry.company),
            entry.name(),
            entry.length,
            to_datetime(entry.time)
        );
    }

    Ok(())
}
