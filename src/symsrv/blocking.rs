use std::time::Duration;

use super::{nonblocking, FetchError, SymSrvSpec, SymbolIdentifier};

use tokio::runtime::Runtime;

/// A synchronous symbol server client, for callers without an async runtime.
#[derive(Debug)]
pub struct SymSrv {
    inner: nonblocking::SymSrv,
    rt: Runtime,
}

impl SymSrv {
    pub fn new(spec: SymSrvSpec, timeout: Option<Duration>) -> anyhow::Result<Self> {
        Ok(Self {
            inner: nonblocking::SymSrv::connect(spec, timeout)?,
            rt: tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?,
        })
    }

    /// Download a single PDB, blocking the current thread until the
    /// request completes or fails.
    pub fn fetch(&self, id: &SymbolIdentifier) -> Result<Vec<u8>, FetchError> {
        self.rt.block_on(self.inner.fetch(id))
    }
}
