//! Byte fetching for `file://` and `http(s)://` artifact locations.

use std::io::Read;
use std::time::Duration;

use anyhow::Context;
use url::Url;

/// Smallest artifact accepted as a real binary.
pub const MIN_BINARY_LEN: usize = 10;

/// Blocking fetcher shared by the resolver and the deployment store.
///
/// HTTP requests run on a private single-threaded tokio runtime, so callers
/// stay synchronous.
pub struct Fetcher {
    client: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher").finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Create a new Fetcher whose HTTP requests time out after `timeout`.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create tokio runtime: {}", e))?;
        Ok(Self { client, runtime })
    }

    /// Read the whole resource.
    pub fn read(&self, url: &Url) -> anyhow::Result<Vec<u8>> {
        match url.scheme() {
            "file" => {
                let path = file_path(url)?;
                std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))
            }
            "http" | "https" => self.runtime.block_on(self.download(url, None)),
            scheme => anyhow::bail!("Unsupported URI scheme '{}' in {}", scheme, url),
        }
    }

    pub fn read_to_string(&self, url: &Url) -> anyhow::Result<String> {
        let bytes = self.read(url)?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", url))
    }

    /// Whether the location serves at least [`MIN_BINARY_LEN`] bytes.
    ///
    /// HTTP locations are probed with a range GET rather than HEAD; some
    /// repositories answer HEAD for artifacts they cannot serve.
    pub fn is_valid_binary(&self, url: &Url) -> bool {
        let result = match url.scheme() {
            "file" => file_path(url).and_then(|path| {
                let file = std::fs::File::open(&path)
                    .with_context(|| format!("Failed to open {}", path.display()))?;
                let mut prefix = Vec::with_capacity(MIN_BINARY_LEN);
                file.take(MIN_BINARY_LEN as u64)
                    .read_to_end(&mut prefix)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Ok(prefix)
            }),
            "http" | "https" => {
                let range = format!("bytes=0-{}", MIN_BINARY_LEN - 1);
                self.runtime.block_on(self.download(url, Some(range)))
            }
            scheme => Err(anyhow::anyhow!("Unsupported URI scheme '{}'", scheme)),
        };
        match result {
            Ok(bytes) => bytes.len() >= MIN_BINARY_LEN,
            Err(e) => {
                tracing::debug!("probe of {} failed: {:#}", url, e);
                false
            }
        }
    }

    async fn download(&self, url: &Url, range: Option<String>) -> anyhow::Result<Vec<u8>> {
        let mut request = self.client.get(url.clone());
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to download {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to download: HTTP {} from {}", response.status(), url);
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read response body from {}", url))?;
        Ok(bytes.to_vec())
    }
}

fn file_path(url: &Url) -> anyhow::Result<std::path::PathBuf> {
    url.to_file_path()
        .map_err(|_| anyhow::anyhow!("Invalid file URI: {}", url))
}
