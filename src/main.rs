use anyhow::{bail, Context, Result};
use modsync::{
    config::LauncherConfig,
    logging,
    mods::{self, Mod},
    task::drive,
    verify::{self, ModChecked, NoHook},
};
use std::path::PathBuf;

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "json" => Some(OutputFormat::Json),
            "text" => Some(OutputFormat::Text),
            _ => None,
        }
    }
}

enum Action {
    Check { mods_file: PathBuf, format: OutputFormat },
    Help,
    Version,
}

fn main() -> Result<()> {
    match parse_args(std::env::args().skip(1))? {
        Action::Help => {
            print_help();
            Ok(())
        }
        Action::Version => {
            println!("modsync {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Action::Check { mods_file, format } => run_check(mods_file, format),
    }
}

fn parse_args(args: impl Iterator<Item = String>) -> Result<Action> {
    let mut args = args.peekable();
    let mut mods_file = None;
    let mut format = OutputFormat::Text;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--check" | "-c" => match args.next() {
                Some(path) => mods_file = Some(PathBuf::from(path)),
                None => bail!("--check requires a path"),
            },
            "--format" => {
                let value = args.next().unwrap_or_default();
                format = match OutputFormat::parse(&value) {
                    Some(format) => format,
                    None => bail!("unknown format {value:?} (expected text or json)"),
                };
            }
            "--help" | "-h" => return Ok(Action::Help),
            "--version" | "-V" => return Ok(Action::Version),
            other => bail!("unknown argument {other:?}, see --help"),
        }
    }

    match mods_file {
        Some(mods_file) => Ok(Action::Check { mods_file, format }),
        None => Ok(Action::Help),
    }
}

fn print_help() {
    println!("modsync");
    println!("  --check <mods.json>   Check which mods are installed and up to date");
    println!("  --format <text|json>  Output format for --check (default text)");
    println!("  --version             Print version");
}

fn run_check(mods_file: PathBuf, format: OutputFormat) -> Result<()> {
    let config = LauncherConfig::load_or_create()?;
    let _guard = logging::init(&config.data_dir)?;

    let records = mods::load_mod_records(&mods_file)?;
    let mods: Vec<Mod> = records
        .into_iter()
        .map(|record| Mod::from_record(record, &config))
        .collect();
    tracing::info!(count = mods.len(), file = ?mods_file, "checking mods");

    let tick = config.poll_interval();
    let handle = verify::spawn_check_mods(config, mods, Box::new(NoHook))
        .context("start check worker")?;
    let checked = drive(handle, tick, |checked: ModChecked, _| {
        if format == OutputFormat::Text {
            let state = if checked.up_to_date { "ok" } else { "needs sync" };
            println!("{:<40} {}", checked.name, state);
        }
    })
    .map_err(|failure| anyhow::anyhow!(failure.message))
    .context("check mods")?;

    if format == OutputFormat::Json {
        let summary: Vec<ModChecked> = checked
            .iter()
            .map(|mod_entry| ModChecked {
                name: mod_entry.foldername.clone(),
                up_to_date: mod_entry.up_to_date,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }
    Ok(())
}
