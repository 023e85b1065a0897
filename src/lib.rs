//! This is a tiny project to grab the PDB belonging to a single PE file.
//!
//! The CodeView record in the PE's debug directory names the PDB and carries
//! its GUID and age. Those form the path of the PDB on a symbol server, which
//! is then downloaded with a single HTTP request. This is the moral equivalent
//! of `symchk /s <symbol path> <file>` without needing the debugging tools
//! installed.
#![forbid(unsafe_code)]

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use indicatif::MultiProgress;
use thiserror::Error;
use tracing::{debug, info, warn};

use pe::ParseError;
use symsrv::{nonblocking::SymSrv, Fetch, FetchError, SymSrvSpec, SymbolIdentifier};

pub mod pe;
pub mod symsrv;

#[derive(Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum MessageFormat {
    Human,
    Json,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse PE file: {0}")]
    Parse(#[from] ParseError),

    #[error("failed to download PDB: {0}")]
    Fetch(#[from] FetchError),
}

impl Error {
    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Everything a single run needs to know.
#[derive(Clone, Debug)]
pub struct Options {
    /// The PE file to read.
    pub file: PathBuf,
    /// Base URL of the symbol store.
    pub store: String,
    /// Only report the PDB identifier; never touch the network.
    pub no_download: bool,
    /// Exact path to write the PDB to. Takes precedence over `output_dir`.
    pub output: Option<PathBuf>,
    /// Directory to write the PDB into, under its own name.
    pub output_dir: Option<PathBuf>,
    /// Bound on the whole download request.
    pub timeout: Option<Duration>,
    /// Show a progress bar while downloading.
    pub progress: bool,
}

impl Options {
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: file.into(),
            store: symsrv::DEFAULT_SYMBOL_STORE.to_string(),
            no_download: false,
            output: None,
            output_dir: None,
            timeout: None,
            progress: false,
        }
    }
}

/// The outcome of a successful run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Report {
    pub identifier: SymbolIdentifier,
    /// Where the PDB was written, if it was downloaded.
    pub written_to: Option<PathBuf>,
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PDB signature: {}", self.identifier.signature)?;
        write!(f, "PDB filename: {}", self.identifier.filename)?;
        if let Some(path) = &self.written_to {
            write!(f, "\nPDB written to {}", path.display())?;
        }

        Ok(())
    }
}

/// Decide where a downloaded PDB goes.
///
/// An explicit output path wins over an output directory. Without either,
/// the PDB lands in the current directory under its own name.
pub fn resolve_output_path(options: &Options, id: &SymbolIdentifier) -> PathBuf {
    match (&options.output, &options.output_dir) {
        (Some(output), _) => output.clone(),
        (None, Some(dir)) => dir.join(id.basename()),
        (None, None) => PathBuf::from(id.basename()),
    }
}

/// Read the PE named by `options`, derive its PDB identifier, and unless
/// downloads are disabled, fetch the PDB through `fetcher` and write it out.
pub async fn process<F: Fetch + ?Sized>(options: &Options, fetcher: &F) -> Result<Report, Error> {
    let data = tokio::fs::read(&options.file)
        .await
        .map_err(Error::io(&options.file))?;

    let identifier = pe::extract(&data)?;
    info!(
        signature = %identifier.signature,
        filename = %identifier.filename,
        "resolved PDB identifier"
    );

    if options.no_download {
        debug!("download disabled, skipping fetch");
        return Ok(Report {
            identifier,
            written_to: None,
        });
    }

    if options.output.is_some() && options.output_dir.is_some() {
        warn!("both an output path and an output directory were given; using the output path");
    }

    let pdb = fetcher.fetch(&identifier).await?;
    let path = resolve_output_path(options, &identifier);
    info!(bytes = pdb.len(), path = %path.display(), "downloaded PDB");

    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(Error::io(dir))?;
    }

    tokio::fs::write(&path, &pdb)
        .await
        .map_err(Error::io(&path))?;

    Ok(Report {
        identifier,
        written_to: Some(path),
    })
}

/// [`process`] against the symbol server configured in `options`.
pub async fn run(options: &Options) -> Result<Report, Error> {
    let spec: SymSrvSpec = options.store.parse()?;
    debug!(store = %spec, timeout = ?options.timeout, "using symbol store");

    let mut srv = SymSrv::connect(spec, options.timeout)?;
    if options.progress {
        srv = srv.with_progress(MultiProgress::new());
    }

    process(options, &srv).await
}
