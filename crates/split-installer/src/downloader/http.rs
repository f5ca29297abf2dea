//! `Downloader` over HTTP, built on `reqwest` and the tokio runtime.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{AlwaysOnline, DownloadCallback, DownloadRequest, Downloader, NetworkMonitor};
use crate::error::ErrorCode;

const DEFAULT_USER_AGENT: &str = concat!("split-installer/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
const DEFAULT_NETWORK_POLL_INTERVAL: Duration = Duration::from_secs(30);
const PARTIAL_SUFFIX: &str = "tmp";

#[derive(Debug, Error)]
enum FetchError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP {status}: {url}")]
    HttpStatus { status: u16, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    fn code(&self) -> ErrorCode {
        match self {
            FetchError::HttpStatus { status, .. } if *status == 401 || *status == 403 => ErrorCode::AccessDenied,
            FetchError::Request(e) if e.is_connect() || e.is_timeout() => ErrorCode::NetworkError,
            _ => ErrorCode::DownloadFailed,
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            FetchError::HttpStatus { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            FetchError::Request(_) => true,
            FetchError::Io(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpDownloaderConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub user_agent: String,
    /// Negative means no confirmation is ever needed.
    pub metered_threshold: i64,
    pub deferred_only_unmetered: bool,
    /// How often a held-back deferred download rechecks the network.
    pub network_poll_interval: Duration,
}

impl Default for HttpDownloaderConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            metered_threshold: -1,
            deferred_only_unmetered: true,
            network_poll_interval: DEFAULT_NETWORK_POLL_INTERVAL,
        }
    }
}

impl HttpDownloaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_metered_threshold(mut self, bytes: i64) -> Self {
        self.metered_threshold = bytes;
        self
    }

    pub fn with_network_poll_interval(mut self, interval: Duration) -> Self {
        self.network_poll_interval = interval;
        self
    }
}

struct Task {
    handle: JoinHandle<()>,
    callback: Arc<dyn DownloadCallback>,
}

type TaskTable = Arc<Mutex<HashMap<u32, Task>>>;

/// Downloads each session's requests sequentially on one tokio task.
///
/// Deferred downloads that may not use a metered network wait on the
/// [`NetworkMonitor`] (unmetered and always online by default) before they
/// start.
pub struct HttpDownloader {
    client: Client,
    runtime: Handle,
    config: HttpDownloaderConfig,
    network: Arc<dyn NetworkMonitor>,
    tasks: TaskTable,
}

impl HttpDownloader {
    pub fn new(runtime: Handle) -> Result<Self, reqwest::Error> {
        Self::with_config(runtime, HttpDownloaderConfig::default())
    }

    pub fn with_config(runtime: Handle, config: HttpDownloaderConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .gzip(true)
            .user_agent(&config.user_agent)
            .build()?;

        Ok(Self {
            client,
            runtime,
            config,
            network: Arc::new(AlwaysOnline),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn with_network(mut self, network: Arc<dyn NetworkMonitor>) -> Self {
        self.network = network;
        self
    }

    /// Number of sessions still downloading.
    pub fn active_downloads(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn spawn(
        &self,
        session_id: u32,
        requests: Vec<DownloadRequest>,
        callback: Arc<dyn DownloadCallback>,
        wait_for_unmetered: bool,
    ) {
        // Held across spawn so the task cannot finish before it is tracked.
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.contains_key(&session_id) {
            log::warn!("Session {} is already downloading", session_id);
            return;
        }

        let client = self.client.clone();
        let config = self.config.clone();
        let table = self.tasks.clone();
        let task_callback = callback.clone();
        let network = self.network.clone();

        let handle = self.runtime.spawn(async move {
            if wait_for_unmetered {
                wait_for_unmetered_network(network.as_ref(), config.network_poll_interval, session_id).await;
            }
            task_callback.on_start();
            let outcome = download_all(&client, &config, &requests, task_callback.as_ref()).await;

            let still_tracked = table
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&session_id)
                .is_some();
            if !still_tracked {
                return;
            }

            match outcome {
                Ok(()) => task_callback.on_completed(),
                Err(e) => {
                    log::error!("Download of session {} failed: {}", session_id, e);
                    task_callback.on_error(e.code());
                }
            }
        });

        tasks.insert(session_id, Task { handle, callback });
    }
}

async fn wait_for_unmetered_network(network: &dyn NetworkMonitor, poll: Duration, session_id: u32) {
    if network.is_available() && !network.is_metered() {
        return;
    }
    log::info!("Holding back deferred download {} until an unmetered network is available", session_id);
    while !network.is_available() || network.is_metered() {
        tokio::time::sleep(poll).await;
    }
    log::debug!("Resuming deferred download {}", session_id);
}

/// Exponential backoff before retry `attempt` (zero based), capped.
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt)).min(MAX_RETRY_DELAY)
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

async fn download_all(
    client: &Client,
    config: &HttpDownloaderConfig,
    requests: &[DownloadRequest],
    callback: &dyn DownloadCallback,
) -> Result<(), FetchError> {
    let mut downloaded = 0u64;
    for request in requests {
        downloaded = download_with_retries(client, config, request, downloaded, callback).await?;
    }
    Ok(())
}

async fn download_with_retries(
    client: &Client,
    config: &HttpDownloaderConfig,
    request: &DownloadRequest,
    base: u64,
    callback: &dyn DownloadCallback,
) -> Result<u64, FetchError> {
    let mut attempt = 0;
    loop {
        match download_one(client, request, base, callback).await {
            Ok(total) => return Ok(total),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                log::warn!("Downloading {} failed (attempt {}): {}", request.url, attempt + 1, e);
                tokio::time::sleep(retry_backoff(config.retry_delay, attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn download_one(
    client: &Client,
    request: &DownloadRequest,
    base: u64,
    callback: &dyn DownloadCallback,
) -> Result<u64, FetchError> {
    let response = client.get(&request.url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: request.url.clone(),
        });
    }

    tokio::fs::create_dir_all(&request.file_dir).await?;
    let target = request.target();
    let partial = partial_path(&target);
    let mut file = File::create(&partial).await?;
    let mut downloaded = base;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        callback.on_progress(downloaded);
    }

    file.flush().await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&partial, &target).await?;

    log::debug!("Downloaded {} to {}", request.url, target.display());
    Ok(downloaded)
}

impl Downloader for HttpDownloader {
    fn start_download(&self, session_id: u32, requests: Vec<DownloadRequest>, callback: Arc<dyn DownloadCallback>) {
        self.spawn(session_id, requests, callback, false);
    }

    fn deferred_download(
        &self,
        session_id: u32,
        requests: Vec<DownloadRequest>,
        callback: Arc<dyn DownloadCallback>,
        allow_metered_network: bool,
    ) {
        log::debug!(
            "Deferred download for session {} (metered allowed: {})",
            session_id,
            allow_metered_network
        );
        self.spawn(session_id, requests, callback, !allow_metered_network);
    }

    fn cancel_download_sync(&self, session_id: u32) -> bool {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id);
        match task {
            Some(task) => {
                task.handle.abort();
                task.callback.on_canceled();
                true
            }
            None => false,
        }
    }

    fn download_size_threshold_when_metered(&self) -> i64 {
        self.config.metered_threshold
    }

    fn is_deferred_download_only_on_unmetered(&self) -> bool {
        self.config.deferred_only_unmetered
    }
}
