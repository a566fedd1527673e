use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use v8unpack::container::{BlockBody, Container};
use v8unpack::pipeline::{self, BuildOptions, ExtractOptions, RunReport};
use v8unpack::products;
use v8unpack::version::DEFAULT_VERSION;

#[derive(Parser)]
#[command(name = "v8unpack", version, about = "Unpack and build 1C:Enterprise 8 binary files")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Log as JSON lines instead of text
    #[arg(long, global = true)]
    json_log: bool,
}

#[derive(Args)]
struct RunArgs {
    /// Scratch directory (cleared before use)
    #[arg(long)]
    temp: Option<PathBuf>,
    /// Index file redirecting logical paths to shared locations
    #[arg(long)]
    index: Option<PathBuf>,
    /// Platform code 801/802/803, or compatibility code such as 80306
    #[arg(long, default_value = DEFAULT_VERSION)]
    version: String,
    /// Descent layer id, e.g. 3.0.75.100
    #[arg(long)]
    descent: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Unpack a binary file into a source directory
    Extract {
        file: PathBuf,
        src:  PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Build a binary file from a source directory
    Build {
        src:  PathBuf,
        file: PathBuf,
        #[command(flatten)]
        run: RunArgs,
        /// Interface compatibility override: 0 = 8.2, 1 = 8.2 allow Taxi, 2 = Taxi allow 8.2, 3 = Taxi
        #[arg(long, value_parser = clap::value_parser!(u8).range(0..=3))]
        gui: Option<u8>,
    },
    /// Extract every product listed in a products file
    ExtractAll {
        products: PathBuf,
        code: Option<String>,
    },
    /// Build every product listed in a products file
    BuildAll {
        products: PathBuf,
        code: Option<String>,
    },
    /// Show the container header and block table
    Info {
        file: PathBuf,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.json_log);

    let reports: Vec<RunReport> = match cli.command {

        // ── Extract ──────────────────────────────────────────────────────────
        Commands::Extract { file, src, run } => {
            let options = ExtractOptions {
                temp_dir: run.temp,
                index:    run.index,
                version:  run.version,
                descent:  run.descent,
            };
            vec![pipeline::extract(&file, &src, &options)]
        }

        // ── Build ────────────────────────────────────────────────────────────
        Commands::Build { src, file, run, gui } => {
            let options = BuildOptions {
                temp_dir: run.temp,
                index:    run.index,
                version:  run.version,
                descent:  run.descent,
                gui,
            };
            vec![pipeline::build(&src, &file, &options)]
        }

        // ── Batch ────────────────────────────────────────────────────────────
        Commands::ExtractAll { products, code } => match products::extract_all(&products, code.as_deref()) {
            Ok(reports) => reports,
            Err(e) => {
                eprintln!("{}", v8unpack::error::chain(&e));
                return ExitCode::FAILURE;
            }
        },
        Commands::BuildAll { products, code } => match products::build_all(&products, code.as_deref()) {
            Ok(reports) => reports,
            Err(e) => {
                eprintln!("{}", v8unpack::error::chain(&e));
                return ExitCode::FAILURE;
            }
        },

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { file } => {
            return match info(&file) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("{}", v8unpack::error::chain(&e));
                    ExitCode::FAILURE
                }
            };
        }
    };

    for report in &reports {
        println!("{}", report.status_line());
    }
    if reports.iter().all(|r| r.success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn info(path: &PathBuf) -> v8unpack::Result<()> {
    let data = std::fs::read(path).map_err(|e| v8unpack::Error::io(path, e))?;
    let container = Container::parse(&data, false)?;
    let header = &container.header;

    println!("── v8 container ─────────────────────────────────────────");
    println!("  Path             {}", path.display());
    println!("  Size             {} B", data.len());
    println!("  Page size        {}", header.page_size);
    println!("  Storage version  {}", header.storage_version);
    println!("  Blocks           {}", container.blocks.len());
    println!("{:<40} {:>12}  {:>16}", "Name", "Size", "Modified");
    for block in &container.blocks {
        let size = match &block.body {
            BlockBody::Leaf(data) => data.len(),
            BlockBody::Nested(_) => 0,
        };
        println!("{:<40} {:>12}  {:>16x}", block.name, size, block.mtime);
    }
    Ok(())
}
