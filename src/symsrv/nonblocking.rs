use std::time::Duration;

use futures::future::BoxFuture;
use indicatif::{MultiProgress, ProgressBar};
use reqwest::StatusCode;
use url::Url;

use super::{Fetch, FetchError, SymSrvSpec, SymbolIdentifier};

/// Symbol servers commonly key behavior off the debugger's user agent.
pub const USER_AGENT: &str = "Microsoft-Symbol-Server/10.0.0.0";

mod style {
    use indicatif::ProgressStyle;

    pub fn bar() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template(
                "[{elapsed_precise}] {bar:.cyan/blue} {bytes:>12}/{total_bytes:12} {wide_msg}",
            )
            .unwrap()
            .progress_chars("█▉▊▋▌▍▎▏  ")
    }

    pub fn spinner() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {spinner} {bytes_per_sec:>10} {wide_msg}")
            .unwrap()
    }
}

/// Attempt to download a single resource with a single GET request.
async fn download_single(
    client: &reqwest::Client,
    url: Url,
    mp: Option<&MultiProgress>,
    label: &str,
) -> Result<Vec<u8>, FetchError> {
    let mut res = client.get(url).send().await?;
    match res.status() {
        StatusCode::OK => {}
        StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
        status => {
            return Err(FetchError::TransportError(format!(
                "unexpected status code {}",
                status.as_u16()
            )))
        }
    }

    // N.B: If the server sends us a content-length header, use it to display a progress bar.
    // Otherwise, just display a spinner progress bar.
    let dl_pb = mp.map(|m| {
        let dl_pb = match res.content_length() {
            Some(len) => {
                let dl_pb = m.add(ProgressBar::new(len));
                dl_pb.set_style(style::bar());

                dl_pb
            }

            None => {
                let dl_pb = m.add(ProgressBar::new_spinner());
                dl_pb.set_style(style::spinner());
                dl_pb.enable_steady_tick(Duration::from_millis(5));

                dl_pb
            }
        };

        dl_pb.set_message(label.to_string());
        dl_pb
    });

    // Don't trust the server's length for more than a reasonable preallocation.
    let capacity = res.content_length().unwrap_or(0).min(64 << 20) as usize;
    let mut body = Vec::with_capacity(capacity);

    while let Some(chunk) = res.chunk().await? {
        if let Some(dl_pb) = &dl_pb {
            dl_pb.inc(chunk.len() as u64);
        }

        body.extend_from_slice(&chunk);
    }

    if let Some(dl_pb) = dl_pb {
        dl_pb.finish_and_clear();
    }

    Ok(body)
}

fn connect_server(timeout: Option<Duration>) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    Ok(builder.build()?)
}

#[derive(Debug, Clone)]
pub struct SymSrv {
    spec: SymSrvSpec,
    client: reqwest::Client,
    progress: Option<MultiProgress>,
}

impl SymSrv {
    /// Set up a client for the specified symbol server.
    ///
    /// No connection is made until the first fetch. `timeout` bounds each
    /// whole request, from connecting to reading the last byte.
    pub fn connect(spec: SymSrvSpec, timeout: Option<Duration>) -> Result<Self, FetchError> {
        Ok(Self {
            client: connect_server(timeout)?,
            spec,
            progress: None,
        })
    }

    /// Display download progress on `mp` for every subsequent fetch.
    pub fn with_progress(mut self, mp: MultiProgress) -> Self {
        self.progress = Some(mp);
        self
    }

    /// Download a single PDB from the symbol server and return its contents.
    pub async fn fetch(&self, id: &SymbolIdentifier) -> Result<Vec<u8>, FetchError> {
        let url = self.spec.request_url(id)?;

        download_single(&self.client, url, self.progress.as_ref(), &id.rel_path()).await
    }
}

impl Fetch for SymSrv {
    fn fetch<'a>(&'a self, id: &'a SymbolIdentifier) -> BoxFuture<'a, Result<Vec<u8>, FetchError>> {
        Box::pin(SymSrv::fetch(self, id))
    }
}
