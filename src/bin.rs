//! Command-line front end: print the PDB signature of a PE file and
//! download the matching PDB from a symbol server.
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Parser};
use pdbfetch::symsrv::DEFAULT_SYMBOL_STORE;
use pdbfetch::{run, MessageFormat, Options, Report};
use serde_json::json;
use tracing_subscriber::EnvFilter;

/// This tool extracts the PDB signature from a PE file and downloads the PDB from a symbol server
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the PE file
    #[arg(short, long)]
    file: PathBuf,
    /// The symbol store URL
    #[arg(short, long, env = "PDBFETCH_STORE", default_value = DEFAULT_SYMBOL_STORE)]
    store: String,
    /// No download. Only print the PDB info
    #[arg(short = 'n', long)]
    no_download: bool,
    /// Output file path. Takes precedence over --output-dir
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// Output directory; the PDB is written under its own name
    #[arg(short = 'd', long)]
    output_dir: Option<PathBuf>,
    /// Give up on the download after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
    /// The format to print the result in
    #[arg(long, value_enum, default_value_t = MessageFormat::Human)]
    message_format: MessageFormat,
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

impl From<&Args> for Options {
    fn from(args: &Args) -> Self {
        Options {
            file: args.file.clone(),
            store: args.store.clone(),
            no_download: args.no_download,
            output: args.output.clone(),
            output_dir: args.output_dir.clone(),
            timeout: args.timeout.map(Duration::from_secs),
            progress: args.message_format == MessageFormat::Human,
        }
    }
}

/// Logs go to stderr so stdout stays reserved for the report.
/// `RUST_LOG` overrides the level picked by `--verbose`.
fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn report_json(report: &Report) -> serde_json::Value {
    json!({
        "status": "success",
        "signature": report.identifier.signature,
        "filename": report.identifier.filename,
        "path": report.written_to.as_ref().map(|p| p.to_string_lossy()),
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&Options::from(&args)).await {
        Ok(report) => {
            match args.message_format {
                MessageFormat::Human => println!("{report}"),
                MessageFormat::Json => println!("{}", report_json(&report)),
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            if args.message_format == MessageFormat::Json {
                println!(
                    "{}",
                    json!({
                        "status": "failed",
                        "message": e.to_string(),
                    })
                );
            }

            ExitCode::FAILURE
        }
    }
}
