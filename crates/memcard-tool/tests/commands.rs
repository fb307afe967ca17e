use memcard_tool::{
    check, create, delete, export, format_card, import, info, init_config, list, load_config,
    Config, Error,
};
use memcard::CardError;
use std::fs;
use tempfile::tempdir;

const SECTOR: usize = 8192;

fn formatted(dir: &std::path::Path) -> Result<Config, Box<dyn std::error::Error>> {
    let config = Config::new(dir.join("card.raw"));
    format_card(&config)?;
    Ok(config)
}

#[test]
fn import_list_export_delete() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = tempdir()?;
    let config = formatted(workspace.path())?;
    assert_eq!(fs::metadata(&config.image)?.len(), 512 * 1024);

    let source = workspace.path().join("save.bin");
    let payload: Vec<u8> = (0..10_000).map(|i| (i % 251) as u8).collect();
    fs::write(&source, &payload)?;
    import(&config, &source, None)?;

    let files = list(&config)?;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "save.bin");
    assert_eq!(files[0].blocks, 2);
    assert_eq!(files[0].bytes, 2 * SECTOR as u64);

    let exported = workspace.path().join("out.bin");
    export(&config, "save.bin", &exported)?;
    let mut expected = payload.clone();
    expected.resize(2 * SECTOR, 0);
    assert_eq!(fs::read(&exported)?, expected);

    assert_eq!(info(&config)?.free_bytes, 57 * SECTOR as u32);
    delete(&config, "save.bin")?;
    assert!(list(&config)?.is_empty());
    assert_eq!(info(&config)?.free_bytes, 59 * SECTOR as u32);
    assert_eq!(check(&config)?, 0);
    Ok(())
}

#[test]
fn info_reports_the_card_shape() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = tempdir()?;
    let config = formatted(workspace.path())?;

    let card = info(&config)?;
    assert_eq!(card.size_mbit, 4);
    assert_eq!(card.sector_size, SECTOR as u32);
    assert_eq!(card.blocks, 64);
    assert_eq!(card.free_slots, 127);
    Ok(())
}

#[test]
fn duplicate_names_are_refused() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = tempdir()?;
    let config = formatted(workspace.path())?;

    create(&config, "slot", 3)?;
    assert!(matches!(
        create(&config, "slot", 1),
        Err(Error::Card(CardError::Exist))
    ));
    assert!(matches!(
        create(&config, "huge", 100),
        Err(Error::Card(CardError::InsufficientSpace))
    ));
    assert_eq!(list(&config)?.len(), 1);
    Ok(())
}

#[test]
fn block_counts_past_the_size_range_are_refused() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = tempdir()?;
    let config = formatted(workspace.path())?;

    // 524 289 sectors of 8 KiB is just past u32::MAX bytes.
    assert!(matches!(
        create(&config, "wrap", 524_289),
        Err(Error::ConfigError(_))
    ));
    assert!(list(&config)?.is_empty());
    assert_eq!(info(&config)?.free_bytes, 59 * SECTOR as u32);
    Ok(())
}

#[test]
fn unformatted_image_does_not_mount() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = tempdir()?;
    let config = Config::new(workspace.path().join("blank.raw"));
    assert!(matches!(list(&config), Err(Error::Card(_))));
    Ok(())
}

#[test]
fn init_writes_a_loadable_config() -> Result<(), Box<dyn std::error::Error>> {
    let workspace = tempdir()?;
    let path = workspace.path().join("card.toml");

    init_config(&path, std::path::Path::new("card.raw"))?;
    let config = load_config(&path)?;
    assert_eq!(config.image, workspace.path().join("card.raw"));
    assert_eq!(config.size_mbit, 4);
    assert!(config.disk_id.is_none());

    assert!(matches!(
        init_config(&path, std::path::Path::new("other.raw")),
        Err(Error::ConfigError(_))
    ));
    Ok(())
}
