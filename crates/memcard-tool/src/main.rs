use argh::FromArgs;
use colored::Colorize;
use log::info;
use memcard_tool::{load_config, Config, Error};
use std::path::PathBuf;

#[derive(FromArgs)]
/// Inspect and edit GameCube memory card images.
struct Args {
    /// configuration file describing the card
    #[argh(option, short = 'c', default = "PathBuf::from(memcard_tool::DEFAULT_CONFIG)")]
    config: PathBuf,

    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Init(InitArgs),
    Format(FormatArgs),
    List(ListArgs),
    Info(InfoArgs),
    Check(CheckArgs),
    Create(CreateArgs),
    Import(ImportArgs),
    Export(ExportArgs),
    Delete(DeleteArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "init")]
/// Write a starter configuration.
struct InitArgs {
    /// card image the configuration points at
    #[argh(positional, default = "PathBuf::from(\"card.raw\")")]
    image: PathBuf,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "format")]
/// Erase the card and lay down an empty file system.
struct FormatArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "list")]
/// List the files on the card.
struct ListArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "info")]
/// Show card geometry and free space.
struct InfoArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
/// Repair the system area.
struct CheckArgs {}

#[derive(FromArgs)]
#[argh(subcommand, name = "create")]
/// Allocate an empty file.
struct CreateArgs {
    #[argh(positional)]
    name: String,
    /// number of blocks to reserve
    #[argh(positional)]
    blocks: u32,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "import")]
/// Copy a host file onto the card.
struct ImportArgs {
    #[argh(positional)]
    file: PathBuf,
    /// name on the card, defaults to the host file name
    #[argh(option)]
    name: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "export")]
/// Copy a file from the card to the host.
struct ExportArgs {
    #[argh(positional)]
    name: String,
    #[argh(positional)]
    out: PathBuf,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "delete")]
/// Remove a file from the card.
struct DeleteArgs {
    #[argh(positional)]
    name: String,
}

fn main() {
    env_logger::init();
    let args: Args = argh::from_env();

    if let Err(err) = run(args) {
        eprintln!("{} {}", "Error:".red(), err);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Error> {
    if let Command::Init(init) = &args.command {
        let config = memcard_tool::init_config(&args.config, &init.image)?;
        println!(
            "{} {} {} {}",
            "Wrote".green(),
            args.config.display(),
            "for".dimmed(),
            config.image.display()
        );
        return Ok(());
    }

    let cfg = load_config(&args.config)?;
    info!("using {}", cfg.image.display());
    match args.command {
        Command::Init(_) => Ok(()),
        Command::Format(_) => memcard_tool::format_card(&cfg),
        Command::List(_) => print_listing(&cfg),
        Command::Info(_) => print_info(&cfg),
        Command::Check(_) => {
            if memcard_tool::check(&cfg)? == 0 {
                println!("{}", "Card is consistent".green());
            }
            Ok(())
        }
        Command::Create(create) => memcard_tool::create(&cfg, &create.name, create.blocks),
        Command::Import(import) => memcard_tool::import(&cfg, &import.file, import.name.as_deref()),
        Command::Export(export) => memcard_tool::export(&cfg, &export.name, &export.out),
        Command::Delete(delete) => memcard_tool::delete(&cfg, &delete.name),
    }
}

fn print_listing(cfg: &Config) -> Result<(), Error> {
    let files = memcard_tool::list(cfg)?;
    if files.is_empty() {
        println!("{}", "No files".dimmed());
    }
    for file in files {
        println!(
            "{:3} {} {:32} {:4} {} {}",
            file.file_no,
            file.owner.dimmed(),
            file.name.green(),
            file.blocks,
            "blocks".dimmed(),
            file.modified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn print_info(cfg: &Config) -> Result<(), Error> {
    let info = memcard_tool::info(cfg)?;
    println!("{} {} Mbit", "Size".dimmed(), info.size_mbit);
    println!("{} {} bytes", "Sector".dimmed(), info.sector_size);
    println!("{} {}", "Blocks".dimmed(), info.blocks);
    println!("{} {:016x}", "Serial".dimmed(), info.serial_no);
    println!(
        "{} {} bytes, {} directory slots",
        "Free".dimmed(),
        info.free_bytes,
        info.free_slots
    );
    Ok(())
}
