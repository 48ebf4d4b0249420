use crate::config::ProbeConfig;
use crate::error::ProbeError;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use reqwest::{Client, Url};
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};

/// An endpoint the download rate is measured against.
#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub name: String,
    pub sponsor: String,
    /// Any URL inside the server's test directory; payloads are resolved
    /// relative to it.
    pub url: String,
    pub latency: Option<Duration>,
}

impl Server {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sponsor: String::new(),
            url: url.into(),
            latency: None,
        }
    }

    fn resource(&self, file: &str) -> Result<Url, ProbeError> {
        Url::parse(&self.url)
            .and_then(|base| base.join(file))
            .map_err(|e| ProbeError::Other(format!("invalid server url {:?}: {}", self.url, e)))
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.sponsor.is_empty() {
            write!(f, " ({})", self.sponsor)?;
        }
        if let Some(latency) = self.latency {
            write!(f, " [{:.1} ms]", latency.as_secs_f64() * 1000.0)?;
        }
        Ok(())
    }
}

/// Download-throughput measurement service.
pub trait Probe {
    /// Picks the endpoint to measure against.
    fn best_server(&self) -> impl Future<Output = Result<Server, ProbeError>> + Send;

    /// Measures the download rate against `server`, in bits per second.
    fn download(&self, server: &Server) -> impl Future<Output = Result<f64, ProbeError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    url: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    sponsor: String,
}

/// Speedtest-style probe over plain HTTP: servers expose `latency.txt` and
/// `random{N}x{N}.jpg` payloads next to the URL from the server list.
pub struct HttpProbe {
    client: Client,
    config: ProbeConfig,
}

impl HttpProbe {
    pub fn new(config: ProbeConfig) -> Result<Self> {
        // No overall timeout: payload bodies are cut off by the download budget.
        let client = Client::builder()
            .connect_timeout(config.request_timeout())
            .read_timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { client, config })
    }

    async fn fetch_servers(&self) -> Result<Vec<Server>, ProbeError> {
        debug!("Fetching server list from {}", self.config.server_list_url);

        let body = self
            .client
            .get(&self.config.server_list_url)
            .timeout(self.config.request_timeout())
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| classify(&e))?
            .text()
            .await
            .map_err(|e| classify(&e))?;

        parse_server_list(&body)
    }

    /// Mean round-trip time for `latency.txt`, or `None` if any sample failed.
    async fn latency(&self, server: &Server) -> Option<Duration> {
        let url = server.resource("latency.txt").ok()?;
        let samples = self.config.latency_samples.max(1);
        let mut total = Duration::ZERO;

        for _ in 0..samples {
            let start = Instant::now();
            let result = self
                .client
                .get(url.clone())
                .timeout(self.config.request_timeout())
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(response) => {
                    if let Err(e) = response.bytes().await {
                        debug!("Latency sample to {} failed: {}", server.name, e);
                        return None;
                    }
                }
                Err(e) => {
                    debug!("Latency sample to {} failed: {}", server.name, e);
                    return None;
                }
            }
            total += start.elapsed();
        }

        Some(total / samples)
    }

    fn payload_urls(&self, server: &Server) -> Result<Vec<Url>, ProbeError> {
        let mut urls = Vec::new();
        for size in &self.config.download_sizes {
            let url = server.resource(&format!("random{0}x{0}.jpg", size))?;
            for _ in 0..self.config.download_repeats.max(1) {
                urls.push(url.clone());
            }
        }
        Ok(urls)
    }
}

impl Probe for HttpProbe {
    async fn best_server(&self) -> Result<Server, ProbeError> {
        let servers = self.fetch_servers().await?;
        if servers.is_empty() {
            return Err(ProbeError::NoServer("no servers".to_string()));
        }

        let mut best: Option<Server> = None;
        for mut server in servers.into_iter().take(self.config.max_candidates.max(1)) {
            match self.latency(&server).await {
                Some(latency) => {
                    debug!("{} latency {:?}", server.name, latency);
                    server.latency = Some(latency);
                    if best.as_ref().and_then(|b| b.latency).map_or(true, |l| latency < l) {
                        best = Some(server);
                    }
                }
                None => warn!("Server {} did not answer latency probe", server.name),
            }
        }

        best.ok_or_else(|| {
            ProbeError::NoServer("unable to connect to servers to test latency".to_string())
        })
    }

    async fn download(&self, server: &Server) -> Result<f64, ProbeError> {
        let urls = self.payload_urls(server)?;
        info!("Downloading {} payloads from {}", urls.len(), server);

        let permits = Arc::new(Semaphore::new(self.config.download_concurrency.max(1)));
        let mut tasks: JoinSet<Result<u64, ProbeError>> = JoinSet::new();
        let start = Instant::now();
        let deadline = start + self.config.download_budget();

        for url in urls {
            let client = self.client.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = match timeout_at(deadline, permits.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(e)) => return Err(ProbeError::Other(e.to_string())),
                    Err(_) => return Ok(0),
                };
                fetch_until(&client, url, deadline).await
            });
        }

        let mut total_bytes: u64 = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(len)) => total_bytes += len,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(ProbeError::Other(format!("download task failed: {}", e)));
                }
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        if total_bytes == 0 {
            return Err(ProbeError::Timeout(format!(
                "no data received within {:?}",
                self.config.download_budget()
            )));
        }
        if elapsed <= 0.0 {
            return Err(ProbeError::Other("download finished in zero time".to_string()));
        }

        debug!("Received {} bytes in {:.2}s", total_bytes, elapsed);
        Ok(total_bytes as f64 * 8.0 / elapsed)
    }
}

/// Counts body bytes received from `url` before `deadline`. Running out of
/// time is not an error; the bytes seen so far still count.
async fn fetch_until(client: &Client, url: Url, deadline: Instant) -> Result<u64, ProbeError> {
    let mut response = match timeout_at(deadline, client.get(url).send()).await {
        Ok(sent) => sent
            .and_then(|response| response.error_for_status())
            .map_err(|e| classify(&e))?,
        Err(_) => return Ok(0),
    };

    let mut len = 0u64;
    loop {
        match timeout_at(deadline, response.chunk()).await {
            Ok(Ok(Some(chunk))) => len += chunk.len() as u64,
            Ok(Ok(None)) | Err(_) => break,
            Ok(Err(e)) => return Err(classify(&e)),
        }
    }
    Ok(len)
}

fn parse_server_list(body: &str) -> Result<Vec<Server>, ProbeError> {
    let entries: Vec<ServerEntry> = serde_json::from_str(body)
        .map_err(|e| ProbeError::Other(format!("invalid server list: {}", e)))?;

    Ok(entries
        .into_iter()
        .map(|entry| Server {
            sponsor: entry.sponsor,
            ..Server::new(entry.name, entry.url)
        })
        .collect())
}

fn classify(err: &reqwest::Error) -> ProbeError {
    let detail = describe(err);
    if err.is_timeout() {
        ProbeError::Timeout(detail)
    } else if err.is_connect() {
        // DNS resolution failures surface as connect errors
        ProbeError::Unreachable(detail)
    } else {
        ProbeError::Other(detail)
    }
}

/// Flattens an error and its sources into one line.
fn describe(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !text.contains(&cause_text) {
            text.push_str(": ");
            text.push_str(&cause_text);
        }
        source = cause.source();
    }
    text
}
