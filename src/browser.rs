use std::future::Future;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::error::CdpError;
use chromiumoxide::{Browser, Element, Page};
use futures::StreamExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::settings::Settings;

const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// Why a single page interaction failed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PageError {
    #[error("timed out")]
    Timeout,
    #[error("element not found")]
    NotFound,
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("driver error: {0}")]
    Driver(String),
}

impl From<CdpError> for PageError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::Timeout => PageError::Timeout,
            CdpError::NotFound => PageError::NotFound,
            other => PageError::Driver(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no DevTools endpoint on 127.0.0.1:{port}: {source}")]
    Endpoint {
        port: u16,
        #[source]
        source: reqwest::Error,
    },
    #[error("DevTools handshake failed: {0}")]
    Handshake(#[from] CdpError),
    #[error("failed to launch Chrome at {path:?}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The slice of a browser tab the collector needs. One navigation at a time.
#[async_trait]
pub trait PageClient: Send + Sync {
    type Element: Send + Sync;

    async fn navigate(&self, url: &str) -> Result<(), PageError>;

    /// Best-effort wait. Never fails; returns whether the selector showed up.
    async fn wait_for_selector(&self, selector: &str, timeout: Duration) -> bool;

    async fn query_all(&self, selector: &str) -> Result<Vec<Self::Element>, PageError>;

    async fn read_text(&self, element: &Self::Element) -> Result<String, PageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Chrome is already running with the debug port open.
    Attach,
    /// Spawn Chrome with the configured profile, then attach.
    LaunchThenAttach,
}

impl ConnectMode {
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.auto_launch {
            ConnectMode::LaunchThenAttach
        } else {
            ConnectMode::Attach
        }
    }
}

/// A tab in a Chrome instance reached over the DevTools protocol.
pub struct ChromeClient {
    _browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
    nav_timeout: Duration,
}

impl Drop for ChromeClient {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[derive(Deserialize)]
struct VersionInfo {
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

pub async fn connect(settings: &Settings, mode: ConnectMode) -> Result<ChromeClient, ConnectError> {
    if mode == ConnectMode::LaunchThenAttach {
        launch_chrome(settings)?;
        info!("Waiting {:.1}s for Chrome to start", settings.launch_wait_secs);
        sleep(settings.launch_wait()).await;
    }

    with_retry(settings.connect_attempts, settings.connect_retry(), |attempt| {
        info!(
            "Attaching to Chrome on port {} (attempt {}/{})",
            settings.debug_port, attempt, settings.connect_attempts
        );
        attach(settings)
    })
    .await
}

fn launch_chrome(settings: &Settings) -> Result<(), ConnectError> {
    let launch_err = |source| ConnectError::Launch {
        path: settings.chrome_path.clone(),
        source,
    };
    std::fs::create_dir_all(&settings.user_data_dir).map_err(launch_err)?;

    info!("Launching Chrome: {}", settings.chrome_command_line());
    Command::new(&settings.chrome_path)
        .arg(format!("--remote-debugging-port={}", settings.debug_port))
        .arg(format!("--user-data-dir={}", settings.user_data_dir.display()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(launch_err)?;
    Ok(())
}

async fn attach(settings: &Settings) -> Result<ChromeClient, ConnectError> {
    let port = settings.debug_port;
    let endpoint = format!("http://127.0.0.1:{}/json/version", port);
    let version = fetch_version(&endpoint)
        .await
        .map_err(|source| ConnectError::Endpoint { port, source })?;

    let (browser, mut handler) = Browser::connect(version.ws_url).await?;
    let handler = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("CDP handler: {}", e);
            }
        }
    });

    let page = match browser.pages().await?.into_iter().next() {
        Some(page) => page,
        None => browser.new_page("about:blank").await?,
    };
    info!("Attached to Chrome on port {}", port);

    Ok(ChromeClient {
        _browser: browser,
        page,
        handler,
        nav_timeout: settings.page_load_timeout(),
    })
}

async fn fetch_version(endpoint: &str) -> Result<VersionInfo, reqwest::Error> {
    reqwest::get(endpoint).await?.error_for_status()?.json().await
}

#[async_trait]
impl PageClient for ChromeClient {
    type Element = Element;

    async fn navigate(&self, url: &str) -> Result<(), PageError> {
        match timeout(self.nav_timeout, self.page.goto(url)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(PageError::Navigation(e.to_string())),
            Err(_) => Err(PageError::Timeout),
        }
    }

    async fn wait_for_selector(&self, selector: &str, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            match self.page.find_elements(selector).await {
                Ok(found) if !found.is_empty() => return true,
                Ok(_) => {}
                Err(e) => debug!("Waiting for {}: {}", selector, e),
            }
            if Instant::now() >= deadline {
                debug!("Gave up waiting for {} after {:?}", selector, limit);
                return false;
            }
            sleep(SELECTOR_POLL).await;
        }
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Element>, PageError> {
        Ok(self.page.find_elements(selector).await?)
    }

    async fn read_text(&self, element: &Element) -> Result<String, PageError> {
        Ok(element.inner_text().await?.unwrap_or_default())
    }
}

/// Run `op` up to `attempts` times with a fixed pause in between.
/// Returns the first success or the last error.
pub async fn with_retry<T, E, F, Fut>(attempts: u32, pause: Duration, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                warn!(
                    "Attempt {}/{} failed: {}; retrying in {:.1}s",
                    attempt,
                    attempts,
                    e,
                    pause.as_secs_f64()
                );
                sleep(pause).await;
                attempt += 1;
            }
        }
    }
}
