//! Resolves the configured ISO source to a local file for the upload step.
//!
//! Local paths and `file://` URLs are used in place. HTTP(S) sources are
//! streamed into the cache directory and reused on later builds when the
//! configured checksum still matches.

use crate::config::Config;
use crate::multistep::{StateBag, Step, StepAction, Ui};
use crate::steps::upload_iso::iso_filename;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::{ParseError, Url};

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

pub struct StepDownloadIso;

#[async_trait]
impl Step for StepDownloadIso {
    fn name(&self) -> &'static str {
        "download_iso"
    }

    async fn run(&self, state: &mut StateBag) -> StepAction {
        if !state.config().should_upload_iso() {
            return StepAction::Continue;
        }

        match download(state.config(), state.ui()).await {
            Ok(path) => {
                state.put_download_path(path);
                StepAction::Continue
            }
            Err(e) => state.halt(e),
        }
    }
}

/// Expected SHA-256 digest of the ISO, lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checksum(String);

impl Checksum {
    /// Parse `sha256:<hex>` or bare hex. `none` disables verification.
    pub fn parse(value: &str) -> Result<Option<Checksum>> {
        let value = value.trim();
        if value.is_empty() || value.eq_ignore_ascii_case("none") {
            return Ok(None);
        }

        let hex_digest = match value.split_once(':') {
            Some((algorithm, digest)) if algorithm.eq_ignore_ascii_case("sha256") => digest,
            Some((algorithm, _)) => bail!("Unsupported checksum type: {}", algorithm),
            None => value,
        };

        let bytes = hex::decode(hex_digest)
            .with_context(|| format!("Checksum is not valid hex: {}", hex_digest))?;
        if bytes.len() != 32 {
            bail!(
                "SHA-256 checksum must be 32 bytes, got {} bytes",
                bytes.len()
            );
        }
        Ok(Some(Checksum(hex::encode(bytes))))
    }

    pub async fn verify(&self, path: &Path) -> Result<()> {
        let actual = sha256_file(path).await?;
        if actual != self.0 {
            bail!(
                "Checksum mismatch for {}: expected {}, got {}",
                path.display(),
                self.0,
                actual
            );
        }
        Ok(())
    }
}

async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn download(config: &Config, ui: Arc<dyn Ui>) -> Result<PathBuf> {
    let source = config
        .iso_urls
        .first()
        .ok_or_else(|| anyhow!("No ISO URL configured"))?;
    let checksum = match config.iso_checksum.as_deref() {
        Some(value) => Checksum::parse(value)?,
        None => None,
    };

    let path = match Url::parse(source) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| anyhow!("Invalid file URL: {}", source))?,
        Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
            let target = config.iso_cache_dir.join(iso_filename(source)?);
            return fetch(&url, &target, checksum.as_ref(), ui.as_ref()).await;
        }
        Ok(url) => bail!("Unsupported ISO URL scheme: {}", url.scheme()),
        Err(ParseError::RelativeUrlWithoutBase) => PathBuf::from(source),
        Err(e) => return Err(e).with_context(|| format!("Invalid ISO URL: {}", source)),
    };

    tokio::fs::metadata(&path)
        .await
        .with_context(|| format!("ISO not found: {}", path.display()))?;
    if let Some(checksum) = &checksum {
        ui.say(&format!("Verifying checksum of {}", path.display()));
        checksum.verify(&path).await?;
    }
    Ok(path)
}

async fn fetch(
    url: &Url,
    target: &Path,
    checksum: Option<&Checksum>,
    ui: &dyn Ui,
) -> Result<PathBuf> {
    if let Some(checksum) = checksum {
        match tokio::fs::try_exists(target).await {
            Ok(true) => match checksum.verify(target).await {
                Ok(()) => {
                    ui.say(&format!("Using cached ISO {}", target.display()));
                    return Ok(target.to_path_buf());
                }
                Err(e) => tracing::debug!("Cached ISO is stale, downloading again: {:#}", e),
            },
            Ok(false) => {}
            Err(e) => tracing::debug!(
                "Could not check cached ISO {}, downloading again: {}",
                target.display(),
                e
            ),
        }
    }

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
    }

    ui.say(&format!("Downloading {}", url));
    let response = reqwest::get(url.clone())
        .await
        .with_context(|| format!("Failed GET {}", url))?;
    let status = response.status();
    if !status.is_success() {
        bail!("GET {} failed ({})", url, status);
    }

    let partial = partial_path(target);
    if let Err(e) = store(response, url, &partial, target, checksum).await {
        if let Err(rm) = tokio::fs::remove_file(&partial).await {
            tracing::debug!("Could not remove {}: {}", partial.display(), rm);
        }
        return Err(e);
    }

    Ok(target.to_path_buf())
}

/// `<target>.part`, keeping the full file name of the target.
fn partial_path(target: &Path) -> PathBuf {
    let mut partial = target.as_os_str().to_os_string();
    partial.push(".part");
    PathBuf::from(partial)
}

/// Stream the response body into `partial`, verify it and move it to `target`.
async fn store(
    response: reqwest::Response,
    url: &Url,
    partial: &Path,
    target: &Path,
    checksum: Option<&Checksum>,
) -> Result<()> {
    let mut file = tokio::fs::File::create(partial)
        .await
        .with_context(|| format!("Failed to create {}", partial.display()))?;
    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("Failed to download {}", url))?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        downloaded += chunk.len() as u64;
    }
    file.flush().await?;
    drop(file);
    tracing::debug!("Downloaded {} bytes from {}", downloaded, url);

    if let Some(checksum) = checksum {
        checksum.verify(partial).await?;
    }
    tokio::fs::rename(partial, target)
        .await
        .with_context(|| format!("Failed to move download to {}", target.display()))
}
