use chrono::NaiveDateTime;
use colored::Colorize;
use log::{debug, warn};
use memcard::clock::to_datetime;
use memcard::id::FlashId;
use memcard::{
    CardError, CardSystem, DiskId, ImageFile, SimBus, SimCard, Sram, SystemClock,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG: &str = "card.toml";

pub type Card = CardSystem<SimBus, Sram, SystemClock>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub image: PathBuf,
    pub size_mbit: u16,
    pub sector_size: u32,
    pub channel: usize,
    pub disk_id: Option<DiskId>,
    pub flash_id: FlashId,
    pub font_encode: u16,
    pub language: u8,
    pub counter_bias: u32,
}

#[derive(Debug, Deserialize, Serialize)]
struct ConfigFile {
    card: CardSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identity: Option<IdentitySection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sram: Option<SramSection>,
}

#[derive(Debug, Deserialize, Serialize)]
struct CardSection {
    image: PathBuf,
    #[serde(default = "default_size_mbit")]
    size_mbit: u16,
    #[serde(default = "default_sector_size")]
    sector_size: u32,
    #[serde(default, skip_serializing_if = "is_zero")]
    channel: usize,
}

#[derive(Debug, Deserialize, Serialize)]
struct IdentitySection {
    game: String,
    company: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct SramSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    flash_id: Option<String>,
    #[serde(default)]
    font_encode: u16,
    #[serde(default)]
    language: u8,
    #[serde(default)]
    counter_bias: u32,
}

fn default_size_mbit() -> u16 {
    4
}

fn default_sector_size() -> u32 {
    8 * 1024
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

fn parse_flash_id(hex: &str) -> Result<FlashId, Error> {
    let invalid = || Error::ConfigError(format!("flash_id must be 24 hex digits, got {hex:?}"));
    if hex.len() != 2 * 12 || !hex.is_ascii() {
        return Err(invalid());
    }
    let mut flash_id = FlashId::default();
    for (byte, pair) in flash_id.iter_mut().zip(hex.as_bytes().chunks(2)) {
        let pair = std::str::from_utf8(pair).map_err(|_| invalid())?;
        *byte = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
    }
    Ok(flash_id)
}

fn format_flash_id(flash_id: &FlashId) -> String {
    flash_id.iter().map(|b| format!("{b:02x}")).collect()
}

impl TryFrom<ConfigFile> for Config {
    type Error = Error;

    fn try_from(file: ConfigFile) -> Result<Self, Error> {
        let ConfigFile {
            card,
            identity,
            sram,
        } = file;

        let disk_id = match identity {
            Some(identity) => Some(
                DiskId::from_codes(&identity.game, &identity.company).ok_or_else(|| {
                    Error::ConfigError(
                        "identity needs a 4 character game code and a 2 character company code"
                            .to_string(),
                    )
                })?,
            ),
            None => None,
        };
        let sram = sram.unwrap_or_default();
        let flash_id = match &sram.flash_id {
            Some(hex) => parse_flash_id(hex)?,
            None => FlashId::default(),
        };

        Ok(Self {
            image: card.image,
            size_mbit: card.size_mbit,
            sector_size: card.sector_size,
            channel: card.channel,
            disk_id,
            flash_id,
            font_encode: sram.font_encode,
            language: sram.language,
            counter_bias: sram.counter_bias,
        })
    }
}

impl Config {
    /// Defaults for a 4 Mbit card stored at `image`.
    pub fn new(image: impl Into<PathBuf>) -> Self {
        Self {
            image: image.into(),
            size_mbit: default_size_mbit(),
            sector_size: default_sector_size(),
            channel: 0,
            disk_id: None,
            flash_id: FlashId::default(),
            font_encode: 0,
            language: 0,
            counter_bias: 0,
        }
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        let card = CardSection {
            image: self.image.clone(),
            size_mbit: self.size_mbit,
            sector_size: self.sector_size,
            channel: self.channel,
        };
        let identity = self.disk_id.map(|id| IdentitySection {
            game: String::from_utf8_lossy(&id.game).into_owned(),
            company: String::from_utf8_lossy(&id.company).into_owned(),
        });
        let sram = SramSection {
            flash_id: Some(format_flash_id(&self.flash_id)),
            font_encode: self.font_encode,
            language: self.language,
            counter_bias: self.counter_bias,
        };

        let config_file = ConfigFile {
            card,
            identity,
            sram: Some(sram),
        };
        toml::to_string_pretty(&config_file)
    }

    /// Bytes the image file must hold.
    pub fn capacity(&self) -> usize {
        usize::from(self.size_mbit) * 1024 * 1024 / 8
    }

    fn sram(&self) -> Sram {
        Sram {
            counter_bias: self.counter_bias,
            language: self.language,
            font_encode: self.font_encode,
            ..Sram::with_flash_id(self.flash_id)
        }
    }
}

pub fn parse_config(str: &str) -> Result<Config, Error> {
    let config_file =
        toml::from_str::<ConfigFile>(str).map_err(|e| Error::ConfigError(e.to_string()))?;
    config_file.try_into()
}

pub fn load_config(path: &Path) -> Result<Config, Error> {
    let str = std::fs::read_to_string(path)?;
    let mut config = parse_config(&str)?;
    // Relative image paths are taken from the config file's directory.
    if config.image.is_relative() {
        if let Some(dir) = path.parent() {
            config.image = dir.join(&config.image);
        }
    }
    Ok(config)
}

/// Writes a starter configuration for `image` unless `path` already exists.
pub fn init_config(path: &Path, image: &Path) -> Result<Config, Error> {
    if path.exists() {
        return Err(Error::ConfigError(format!(
            "{} already exists",
            path.display()
        )));
    }
    let config = Config::new(image);
    let str = config
        .to_toml_string()
        .map_err(|e| Error::ConfigError(e.to_string()))?;
    std::fs::write(path, str)?;
    Ok(config)
}

/// A card image plugged into the configured slot.
pub struct Session {
    card: Card,
    chan: usize,
}

impl Session {
    pub fn open(cfg: &Config) -> Result<Self, Error> {
        let image = ImageFile::open(&cfg.image, cfg.capacity())?;
        let sim = SimCard::new(cfg.size_mbit, cfg.sector_size, cfg.flash_id, Box::new(image))
            .ok_or_else(|| {
                Error::ConfigError(format!(
                    "unsupported card shape: {} Mbit with {} byte sectors",
                    cfg.size_mbit, cfg.sector_size
                ))
            })?;
        if cfg.channel > 1 {
            return Err(Error::ConfigError("channel must be 0 or 1".to_string()));
        }

        let mut bus = SimBus::new();
        bus.insert(cfg.channel, sim);
        let mut card = CardSystem::with_parts(bus, cfg.sram(), SystemClock);
        card.set_disk_id(cfg.disk_id);
        debug!("opened {} in slot {}", cfg.image.display(), cfg.channel);
        Ok(Self {
            card,
            chan: cfg.channel,
        })
    }

    /// Opens and mounts the image. A card with one damaged system block is
    /// kept when `allow_broken` is set so it can be repaired.
    pub fn mount(cfg: &Config, allow_broken: bool) -> Result<Self, Error> {
        let mut session = Self::open(cfg)?;
        match session.card.mount(session.chan) {
            Ok(()) => Ok(session),
            Err(CardError::Broken) if allow_broken && session.card.is_attached(session.chan) => {
                warn!("card needs repair");
                Ok(session)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn card(&mut self) -> &mut Card {
        &mut self.card
    }

    pub fn chan(&self) -> usize {
        self.chan
    }

    /// Writes the image back to disk.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.card.bus_mut().flush(self.chan)?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub file_no: usize,
    pub name: String,
    pub owner: String,
    pub blocks: u16,
    pub bytes: u64,
    pub modified: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardInfo {
    pub size_mbit: u16,
    pub sector_size: u32,
    pub blocks: u16,
    pub serial_no: u64,
    pub free_bytes: u32,
    pub free_slots: usize,
}

pub fn format_card(cfg: &Config) -> Result<(), Error> {
    let mut session = Session::open(cfg)?;
    let chan = session.chan;
    session.card.format(chan)?;
    session.flush()?;
    println!("{} {}", "Formatted".green(), cfg.image.display());
    Ok(())
}

pub fn list(cfg: &Config) -> Result<Vec<Listing>, Error> {
    let mut session = Session::mount(cfg, false)?;
    let chan = session.chan;
    let sector_size = session.card.geometry(chan).map_or(0, |geo| geo.sector_size);
    let entries = session.card.entries(chan)?;
    Ok(entries
        .into_iter()
        .map(|(file_no, entry)| Listing {
            file_no,
            name: entry.name(),
            owner: format!(
                "{}{}",
                String::from_utf8_lossy(&entry.game_name),
                String::from_utf8_lossy(&entry.company)
            ),
            blocks: entry.length,
            bytes: u64::from(entry.length) * u64::from(sector_size),
            modified: to_datetime(entry.time),
        })
        .collect())
}

pub fn info(cfg: &Config) -> Result<CardInfo, Error> {
    let mut session = Session::mount(cfg, false)?;
    let chan = session.chan;
    let geometry = session.card.geometry(chan).ok_or(CardError::NoCard)?;
    let serial_no = session.card.get_serial_no(chan)?;
    let (free_bytes, free_slots) = session.card.free_blocks(chan)?;
    Ok(CardInfo {
        size_mbit: geometry.size_mbit,
        sector_size: geometry.sector_size,
        blocks: geometry.cblock,
        serial_no,
        free_bytes,
        free_slots,
    })
}

/// Runs the checker until nothing is left to repair. Returns the bytes
/// written back.
pub fn check(cfg: &Config) -> Result<u32, Error> {
    let mut session = Session::mount(cfg, true)?;
    let chan = session.chan;
    let mut repaired = 0;
    loop {
        let written = session.card.check(chan)?;
        if written == 0 {
            break;
        }
        repaired += written;
    }
    if repaired > 0 {
        session.flush()?;
        println!("{} {} bytes", "Repaired".green(), repaired);
    }
    Ok(repaired)
}

pub fn create(cfg: &Config, name: &str, blocks: u32) -> Result<(), Error> {
    let mut session = Session::mount(cfg, false)?;
    let chan = session.chan;
    let size = blocks.checked_mul(cfg.sector_size).ok_or_else(|| {
        Error::ConfigError(format!("{blocks} blocks exceed the largest file size"))
    })?;
    let file = session.card.create(chan, name, size)?;
    session.card.close(file)?;
    session.flush()?;
    println!("+ {} {}", "Created".green(), name.green());
    Ok(())
}

/// Copies a host file onto the card, padded to whole sectors.
pub fn import(cfg: &Config, source: &Path, name: Option<&str>) -> Result<(), Error> {
    let name = match name {
        Some(name) => name.to_string(),
        None => source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::ConfigError(format!("{} has no file name", source.display())))?,
    };
    let mut data = std::fs::read(source)?;
    let sector = cfg.sector_size as usize;
    let padded = data.len().div_ceil(sector).max(1) * sector;
    data.resize(padded, 0);

    let mut session = Session::mount(cfg, false)?;
    let chan = session.chan;
    let size = u32::try_from(padded).map_err(|_| {
        Error::ConfigError(format!("{} is too large for a card", source.display()))
    })?;
    let mut file = session.card.create(chan, &name, size)?;
    session.card.write(&mut file, &data, 0)?;
    session.card.close(file)?;
    session.flush()?;
    println!("+ {} {}", "Adding".green(), name.green());
    Ok(())
}

pub fn export(cfg: &Config, name: &str, output: &Path) -> Result<(), Error> {
    let mut session = Session::mount(cfg, false)?;
    let chan = session.chan;
    let mut file = session.card.open(chan, name)?;
    let length = session.card.get_status(chan, file.file_no)?.length;
    let mut data = vec![0u8; length as usize];
    session.card.read(&mut file, &mut data, 0)?;
    session.card.close(file)?;
    std::fs::write(output, data)?;
    println!(
        "{} {} {} {}",
        "Exported".green(),
        name.green(),
        "to".dimmed(),
        output.display()
    );
    Ok(())
}

pub fn delete(cfg: &Config, name: &str) -> Result<(), Error> {
    let mut session = Session::mount(cfg, false)?;
    let chan = session.chan;
    session.card.delete(chan, name)?;
    session.flush()?;
    println!("- {} {}", "Deleted".red(), name);
    Ok(())
}

#[derive(Debug)]
pub enum Error {
    IOError(std::io::Error),
    ConfigError(String),
    Card(CardError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::IOError(err) => write!(f, "{err:?}"),
            Error::ConfigError(err) => write!(f, "{err}"),
            Error::Card(err) => write!(f, "{err} ({})", err.code()),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IOError(err)
    }
}

impl From<CardError> for Error {
    fn from(err: CardError) -> Self {
        Error::Card(err)
    }
}
