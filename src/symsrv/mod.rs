pub mod blocking;
pub mod nonblocking;

use std::error::Error as _;
use std::str::FromStr;

use futures::future::BoxFuture;
use thiserror::Error;
use url::Url;

use crate::pe::Guid;

/// The public Microsoft symbol server.
pub const DEFAULT_SYMBOL_STORE: &str = "https://msdl.microsoft.com/download/symbols";

/// The key a symbol server indexes a PDB by.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SymbolIdentifier {
    /// GUID and age, e.g: `32C1A669D5FFEFD41091F636CFDB6E991`
    pub signature: String,
    /// The PDB path recorded in the executable. Often just a file name,
    /// but linkers may record a full build path.
    pub filename: String,
}

impl SymbolIdentifier {
    pub fn new(guid: &Guid, age: u32, filename: impl Into<String>) -> Self {
        Self {
            signature: format!("{}{:X}", guid, age),
            filename: filename.into(),
        }
    }

    /// The last component of `filename`.
    ///
    /// Both `\` and `/` are treated as separators, whatever the host platform
    /// is, since the path was recorded on the machine that built the binary.
    pub fn basename(&self) -> &str {
        match self.filename.rfind(|c: char| c == '/' || c == '\\') {
            Some(i) => &self.filename[i + 1..],
            None => &self.filename,
        }
    }

    /// The resource path relative to the root of a symbol store:
    /// `<name>/<signature>/<name>`
    pub fn rel_path(&self) -> String {
        let name = self.basename();
        format!("{}/{}/{}", name, self.signature, name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Server returned a 404 error.
    #[error("symbol store returned 404, PDB not found")]
    NotFound,

    #[error("error requesting file: {0}")]
    TransportError(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return FetchError::TransportError("timeout".to_string());
        }

        // reqwest keeps the interesting part (refused, dns...) in the source chain.
        let mut detail = e.to_string();
        let mut source = e.source();
        while let Some(s) = source {
            detail.push_str(": ");
            detail.push_str(&s.to_string());
            source = s.source();
        }

        FetchError::TransportError(detail)
    }
}

/// A symbol server reachable over HTTP(S).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymSrvSpec {
    /// The base URL for a symbol server, e.g: `https://msdl.microsoft.com/download/symbols`
    pub server_url: String,
}

impl SymSrvSpec {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    /// The full URL of the PDB identified by `id` on this server.
    pub fn request_url(&self, id: &SymbolIdentifier) -> Result<Url, FetchError> {
        // e.g: "https://msdl.microsoft.com/download/symbols/ntkrnlmp.pdb/32C1A669D5FFEFD41091F636CFDB6E991/ntkrnlmp.pdb"
        let url = format!("{}/{}", self.server_url, id.rel_path());

        Url::parse(&url)
            .map_err(|e| FetchError::TransportError(format!("invalid URL \"{url}\": {e}")))
    }
}

impl FromStr for SymSrvSpec {
    type Err = FetchError;

    /// Parse a symbol store base URL, e.g: `https://msdl.microsoft.com/download/symbols/`
    fn from_str(srv: &str) -> Result<Self, Self::Err> {
        let spec = Self::new(srv);
        Url::parse(&spec.server_url).map_err(|e| {
            FetchError::TransportError(format!("invalid symbol store URL \"{srv}\": {e}"))
        })?;

        Ok(spec)
    }
}

impl Default for SymSrvSpec {
    fn default() -> Self {
        Self::new(DEFAULT_SYMBOL_STORE)
    }
}

impl std::fmt::Display for SymSrvSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.server_url)
    }
}

/// Something that can retrieve the contents of a PDB given its identifier.
pub trait Fetch {
    fn fetch<'a>(&'a self, id: &'a SymbolIdentifier) -> BoxFuture<'a, Result<Vec<u8>, FetchError>>;
}
