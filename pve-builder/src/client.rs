//! Proxmox VE API client used by the build steps.
//!
//! API docs: https://pve.proxmox.com/wiki/Proxmox_VE_API

use crate::config::Config;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::Stream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, COOKIE};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Proxy, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const CSRF_HEADER: &str = "CSRFPreventionToken";
/// Upper bound on the buffer reserved up front for one upload frame.
const MAX_FRAME_PREALLOC: usize = 8 * 1024 * 1024;

/// Environment override that turns on API debug logging.
pub const DEBUG_ENV_VAR: &str = "PACKER_LOG";

/// Upload capability the ISO step depends on.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `file` to `storage` on `node` in a single request body.
    async fn upload(
        &self,
        node: &str,
        storage: &str,
        content_type: &str,
        filename: &str,
        file: File,
    ) -> Result<()>;

    /// Upload `file` streamed in frames of `chunk_size` bytes.
    async fn upload_chunked(
        &self,
        node: &str,
        storage: &str,
        content_type: &str,
        filename: &str,
        file: File,
        chunk_size: i64,
    ) -> Result<()>;
}

/// Request/response tracing for the API client, decided once at construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiDebug {
    enabled: bool,
}

impl ApiDebug {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Enabled by the `debug` setting or by `PACKER_LOG=1`.
    pub fn from_config(config: &Config) -> Self {
        Self::resolve(config.debug, std::env::var(DEBUG_ENV_VAR).ok().as_deref())
    }

    fn resolve(debug: bool, env_value: Option<&str>) -> Self {
        Self::new(debug || env_value == Some("1"))
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Auth {
    Anonymous,
    Token { header: String },
    Ticket { ticket: String, csrf_token: String },
}

pub struct ProxmoxClient {
    client: Client,
    base_url: String,
    auth: Auth,
    task_timeout: Duration,
    debug: ApiDebug,
}

/// Proxmox API response wrapper.
#[derive(Deserialize, Debug)]
struct ProxmoxResponse<T> {
    data: T,
}

/// Task UPID response (for async operations like uploads).
#[derive(Deserialize, Debug)]
#[serde(untagged)]
enum TaskResponse {
    Upid(String),
    Object { upid: String },
}

impl TaskResponse {
    fn upid(self) -> String {
        match self {
            TaskResponse::Upid(upid) => upid,
            TaskResponse::Object { upid } => upid,
        }
    }
}

/// Task status response.
#[derive(Deserialize, Debug)]
struct TaskStatus {
    status: String,
    exitstatus: Option<String>,
}

#[derive(Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_prevention_token: String,
}

/// Build an authenticated client from the builder configuration.
pub async fn connect(config: &Config) -> Result<ProxmoxClient> {
    connect_with(config, ApiDebug::from_config(config)).await
}

pub async fn connect_with(config: &Config, api_debug: ApiDebug) -> Result<ProxmoxClient> {
    let mut client = ProxmoxClient::new(config, api_debug)?;
    tracing::info!("Proxmox API debug {}", api_debug.enabled());

    if let Some(token) = config.token() {
        tracing::info!("using token auth");
        client.set_api_token(&config.username, token);
    } else {
        tracing::info!("using password auth");
        client
            .login(&config.username, config.password().unwrap_or_default())
            .await?;
    }

    Ok(client)
}

impl ProxmoxClient {
    pub fn new(config: &Config, api_debug: ApiDebug) -> Result<Self> {
        let mut builder = Client::builder()
            .default_headers(header_map(&config.http_headers)?)
            .danger_accept_invalid_certs(config.insecure_skip_tls_verify);

        if let Some(proxy) = config.proxy_server.as_deref().filter(|p| !p.is_empty()) {
            let proxy = Proxy::all(proxy)
                .with_context(|| format!("Invalid proxy server: {}", proxy))?;
            builder = builder.proxy(proxy);
        }

        let client = builder.build().context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.proxmox_url.trim_end_matches('/').to_string(),
            auth: Auth::Anonymous,
            task_timeout: config.task_timeout(),
            debug: api_debug,
        })
    }

    /// Authenticate with an API token; `user_id` is `user@realm!tokenid`.
    pub fn set_api_token(&mut self, user_id: &str, token: &str) {
        self.auth = Auth::Token {
            header: format!("PVEAPIToken={}={}", user_id, token),
        };
    }

    /// Obtain a ticket for `username` via the password login endpoint.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let params = [("username", username), ("password", password)];
        let data: TicketData = self
            .api_post("/access/ticket", &params)
            .await
            .context("Proxmox authentication failed")?;

        self.auth = Auth::Ticket {
            ticket: data.ticket,
            csrf_token: data.csrf_prevention_token,
        };
        Ok(())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: RequestBuilder, write: bool) -> RequestBuilder {
        match &self.auth {
            Auth::Anonymous => request,
            Auth::Token { header } => request.header(AUTHORIZATION, header),
            Auth::Ticket { ticket, csrf_token } => {
                let request = request.header(COOKIE, format!("PVEAuthCookie={}", ticket));
                if write {
                    request.header(CSRF_HEADER, csrf_token)
                } else {
                    request
                }
            }
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        request: RequestBuilder,
    ) -> Result<T> {
        if self.debug.enabled() {
            tracing::debug!("{} {}", method, self.url(path));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed {} {}", method, path))?;

        let status = response.status();
        if self.debug.enabled() {
            tracing::debug!("{} {} -> {}", method, path, status);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{} {} failed ({}): {}", method, path, status, body);
        }

        let result: ProxmoxResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} {} response", method, path))?;

        Ok(result.data)
    }

    /// Execute a GET request to the Proxmox API.
    async fn api_get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let request = self.authorize(self.client.get(self.url(path)), false);
        self.send("GET", path, request).await
    }

    /// Execute a form POST request to the Proxmox API.
    async fn api_post<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, &str)],
    ) -> Result<T> {
        let request = self.authorize(self.client.post(self.url(path)).form(params), true);
        self.send("POST", path, request).await
    }

    /// Poll a task until it stops, bounded by the configured task timeout.
    pub async fn wait_for_task(&self, upid: &str) -> Result<()> {
        let parts: Vec<&str> = upid.split(':').collect();
        if parts.len() < 2 {
            bail!("Invalid UPID format: {}", upid);
        }
        let node = parts[1];
        let path = format!(
            "/nodes/{}/tasks/{}/status",
            node,
            urlencoding::encode(upid)
        );

        let deadline = Instant::now() + self.task_timeout;
        loop {
            let task_status: TaskStatus = self.api_get(&path).await?;

            if task_status.status == "stopped" {
                return match task_status.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    Some(exit) => bail!("Task failed with status: {}", exit),
                    None => bail!("Task stopped without exit status"),
                };
            }

            if Instant::now() + TASK_POLL_INTERVAL > deadline {
                bail!(
                    "Task {} did not complete within {} seconds",
                    upid,
                    self.task_timeout.as_secs()
                );
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    async fn upload_part(
        &self,
        node: &str,
        storage: &str,
        content_type: &str,
        filename: &str,
        part: Part,
    ) -> Result<()> {
        let part = part
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")?;
        // Proxmox reads the plain `filename` parameter only, not RFC 5987 `filename*`.
        let form = Form::new()
            .percent_encode_noop()
            .text("content", content_type.to_string())
            .part("filename", part);

        let path = format!("/nodes/{}/storage/{}/upload", node, storage);
        let request = self.authorize(self.client.post(self.url(&path)).multipart(form), true);
        let task: TaskResponse = self
            .send("POST", &path, request)
            .await
            .with_context(|| format!("Failed to upload {} to {}", filename, storage))?;

        let upid = task.upid();
        tracing::debug!("Waiting for upload task: {}", upid);
        self.wait_for_task(&upid)
            .await
            .with_context(|| format!("Upload task for {} failed", filename))
    }
}

#[async_trait]
impl Uploader for ProxmoxClient {
    async fn upload(
        &self,
        node: &str,
        storage: &str,
        content_type: &str,
        filename: &str,
        file: File,
    ) -> Result<()> {
        let length = file
            .metadata()
            .await
            .context("Failed to read ISO file metadata")?
            .len();
        tracing::info!("Uploading {} ({} bytes) to {}", filename, length, storage);

        let body = Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, length);
        self.upload_part(node, storage, content_type, filename, part)
            .await
    }

    async fn upload_chunked(
        &self,
        node: &str,
        storage: &str,
        content_type: &str,
        filename: &str,
        file: File,
        chunk_size: i64,
    ) -> Result<()> {
        let chunk_size = usize::try_from(chunk_size)
            .ok()
            .filter(|size| *size > 0)
            .with_context(|| format!("Invalid upload chunk size: {}", chunk_size))?;
        tracing::info!(
            "Uploading {} to {} in chunks of {} bytes",
            filename,
            storage,
            chunk_size
        );

        let body = Body::wrap_stream(chunk_stream(file, chunk_size));
        self.upload_part(node, storage, content_type, filename, Part::stream(body))
            .await
    }
}

/// Read `file` as a stream of frames holding exactly `chunk_size` bytes, the
/// last frame holding whatever remains.
pub(crate) fn chunk_stream(
    file: File,
    chunk_size: usize,
) -> impl Stream<Item = std::io::Result<Vec<u8>>> + Send + 'static {
    futures::stream::try_unfold(file, move |mut file| async move {
        let mut chunk = Vec::with_capacity(chunk_size.min(MAX_FRAME_PREALLOC));
        (&mut file)
            .take(chunk_size as u64)
            .read_to_end(&mut chunk)
            .await?;

        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some((chunk, file)))
        }
    })
}

fn header_map(headers: &BTreeMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("Invalid HTTP header name: {}", name))?;
        let header_value = HeaderValue::from_str(value)
            .with_context(|| format!("Invalid value for HTTP header {}", name))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod client_tests;
