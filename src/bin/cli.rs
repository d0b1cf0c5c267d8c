use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use rai_lang::error::AppError;
use rai_lang::paths;
use rai_lang::settings::{self, CompilerSettings};
use rai_lang::state::Workspace;

// ── CLI argument parsing ─────────────────────────────────────────

#[derive(Parser)]
#[command(name = "raic", about = "Compiler for .rai character scripts", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (default: ./raic.json)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Builtins table, overrides the settings file
    #[arg(long, global = true)]
    builtins: Option<PathBuf>,

    /// Root for #out paths, overrides the settings file
    #[arg(long, global = true)]
    character_dir: Option<PathBuf>,

    /// Output raw JSON instead of formatted text
    #[arg(long, global = true)]
    json: bool,

    /// Debug logging on stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a script directory and write every layer's #out file
    Build { dir: PathBuf },
    /// Compile without writing anything
    Check { dir: PathBuf },
    /// List every name visible to a script directory
    Symbols {
        dir: PathBuf,
        /// Also list params and locals of this script or function
        #[arg(long = "in", value_name = "CALLABLE")]
        within: Option<String>,
    },
    /// Where a name is declared
    Definition { dir: PathBuf, name: String },
    /// Dump the builtins table
    Builtins,
    /// Write the effective settings (file plus flags) to the settings file
    Init,
}

// ── Setup ────────────────────────────────────────────────────────

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .try_init();
}

fn settings_file(cli: &Cli) -> Result<PathBuf, AppError> {
    match &cli.settings {
        Some(path) => Ok(path.clone()),
        None => Ok(paths::settings_path(&std::env::current_dir()?)),
    }
}

fn load_settings(cli: &Cli) -> Result<CompilerSettings, AppError> {
    let mut loaded = settings::load_settings(&settings_file(cli)?)?;
    if let Some(builtins) = &cli.builtins {
        loaded.builtins_path = Some(builtins.clone());
    }
    if let Some(dir) = &cli.character_dir {
        loaded.character_dir = Some(dir.clone());
    }
    Ok(loaded)
}

// ── Output formatting ────────────────────────────────────────────

fn print_json<T: Serialize>(value: &T) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
}

fn print_error(err: &AppError, raw_json: bool) {
    if raw_json {
        print_json(err);
        return;
    }
    eprintln!("Error: {err}");
    if let AppError::CompileError { diagnostic } = err {
        if let Some(related) = &diagnostic.related {
            eprintln!("  first declared at {related}");
        }
    }
}

// ── Commands ─────────────────────────────────────────────────────

fn run(cli: &Cli) -> Result<(), AppError> {
    let loaded = load_settings(cli)?;
    let workspace = Workspace::new(loaded.clone());
    let raw = cli.json;

    match &cli.command {
        Commands::Build { dir } => {
            let written = workspace.build(dir)?;
            if raw {
                print_json(&written);
            } else {
                for path in &written {
                    println!("{}", path.display());
                }
            }
        }
        Commands::Check { dir } => {
            let compiled = workspace.check(dir)?;
            if raw {
                let sizes: Vec<usize> = compiled.images.iter().map(Vec::len).collect();
                print_json(&serde_json::json!({ "ok": true, "layers": sizes }));
            } else {
                for (layer, image) in compiled.layers.iter().zip(&compiled.images) {
                    println!("{}: {} bytes", layer.dir.display(), image.len());
                }
            }
        }
        Commands::Symbols { dir, within } => {
            let symbols = match within {
                Some(callable) => workspace.symbols_in(dir, callable)?,
                None => workspace.symbols(dir)?,
            };
            if raw {
                print_json(&symbols);
            } else {
                for symbol in &symbols {
                    match &symbol.detail {
                        Some(detail) => println!("{:?} {} {detail}", symbol.kind, symbol.name),
                        None => println!("{:?} {}", symbol.kind, symbol.name),
                    }
                }
            }
        }
        Commands::Definition { dir, name } => {
            let ident = workspace.definition(dir, name)?;
            if raw {
                print_json(&ident);
            } else {
                println!("{:?} {} @ {}", ident.kind, ident.name, ident.pos);
            }
        }
        Commands::Builtins => {
            let table = workspace.builtins()?;
            if raw {
                let commands: Vec<_> = table.commands().collect();
                let globals: Vec<_> = table.globals().collect();
                print_json(&serde_json::json!({ "commands": commands, "globals": globals }));
            } else {
                for cmd in table.commands() {
                    println!("cmd {}: 0x{:02X} {}", cmd.name, cmd.opcode, cmd.params.join(" "));
                }
                for glob in table.globals() {
                    println!("glob {}: 0x{:02X}", glob.name, glob.slot);
                }
            }
        }
        Commands::Init => {
            let path = settings_file(cli)?;
            settings::save_settings(&path, &loaded)?;
            if raw {
                print_json(&loaded);
            } else {
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli) {
        print_error(&e, cli.json);
        process::exit(1);
    }
}
