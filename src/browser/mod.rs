//! Stealth Chrome session management.
//!
//! Every crawl attempt runs in a dedicated browser process bound to a
//! single proxy for its whole lifetime. Sessions are never reused across
//! attempts; a blocked session is closed and a fresh one is opened with
//! the next proxy.

mod driver;
mod stealth;

pub use driver::{ElementDriver, PageDriver};
pub use stealth::{pick_user_agent, STEALTH_SCRIPTS, USER_AGENTS};

#[cfg(feature = "browser")]
pub use driver::CdpPage;

use async_trait::async_trait;

use crate::config::BrowserSettings;
use crate::error::{CrawlError, Result};

#[cfg(feature = "browser")]
use std::path::{Path, PathBuf};
#[cfg(feature = "browser")]
use std::time::Duration;

#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
#[cfg(feature = "browser")]
use chromiumoxide::handler::HandlerConfig;
#[cfg(feature = "browser")]
use chromiumoxide::{Browser, BrowserConfig};
#[cfg(feature = "browser")]
use futures::StreamExt;
#[cfg(feature = "browser")]
use tracing::{debug, info, warn};

/// A live session: one browser process, one page, one proxy.
#[async_trait]
pub trait CrawlSession: Send + Sync {
    /// Page driver for this session.
    fn driver(&self) -> &dyn PageDriver;

    /// Proxy the session egresses through, if any.
    fn proxy(&self) -> Option<&str>;

    /// User agent presented by this session.
    fn user_agent(&self) -> &str;

    /// Tear down the page and the browser process.
    async fn close(self: Box<Self>);
}

/// Opens fresh sessions for the scheduler and the crawl loop.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self, proxy: Option<&str>) -> Result<Box<dyn CrawlSession>>;
}

/// Common Chrome executable locations checked before falling back to PATH.
#[cfg(feature = "browser")]
const CHROME_PATHS: &[&str] = &[
    // Linux
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    // macOS
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

#[cfg(feature = "browser")]
const CHROME_COMMANDS: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

/// [`SessionFactory`] that launches local Chrome processes, or attaches
/// to a remote instance when `browser.remote_url` is configured.
#[cfg(feature = "browser")]
pub struct ChromeSessionFactory {
    settings: BrowserSettings,
}

#[cfg(feature = "browser")]
impl ChromeSessionFactory {
    pub fn new(settings: BrowserSettings) -> Self {
        Self { settings }
    }

    /// Find a usable Chrome executable.
    fn find_chrome(&self) -> Result<PathBuf> {
        // Explicit configuration wins over discovery
        if let Some(ref path) = self.settings.chrome_binary {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(CrawlError::Session(format!(
                "configured chrome binary not found: {}",
                path.display()
            )));
        }

        for path in CHROME_PATHS {
            let p = Path::new(path);
            if p.exists() {
                info!("Found Chrome at: {}", path);
                return Ok(p.to_path_buf());
            }
        }

        for cmd in CHROME_COMMANDS {
            if let Ok(path) = which::which(cmd) {
                info!("Found Chrome in PATH: {}", path.display());
                return Ok(path);
            }
        }

        Err(CrawlError::Session(
            "Chrome/Chromium not found; install it or set browser.chrome_binary".to_string(),
        ))
    }

    async fn launch_local(&self, proxy: Option<&str>) -> Result<Browser> {
        let chrome_path = self.find_chrome()?;

        info!("Launching browser (headless={})", self.settings.headless);

        let mut builder = BrowserConfig::builder().chrome_executable(chrome_path);

        // with_head means NOT headless
        if !self.settings.headless {
            builder = builder.with_head();
        }

        if let Some(proxy) = proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }

        builder = builder
            .window_size(self.settings.window_width, self.settings.window_height)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-background-networking")
            .arg("--disable-sync")
            .arg("--no-sandbox") // needed for headless in containers
            .arg("--disable-setuid-sandbox")
            .arg("--disable-gpu")
            .arg("--disable-web-security")
            .arg("--allow-running-insecure-content")
            .arg("--start-maximized");

        for arg in &self.settings.chrome_args {
            builder = builder.arg(arg);
        }

        let config = builder
            .build()
            .map_err(|e| CrawlError::Session(format!("browser config: {}", e)))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| CrawlError::Session(format!("browser launch failed: {}", e)))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        Ok(browser)
    }

    /// Attach to an already-running Chrome over the DevTools protocol.
    async fn connect_remote(&self, remote_url: &str) -> Result<Browser> {
        info!("Connecting to remote browser at {}", remote_url);

        // The version endpoint speaks HTTP even when the configured URL is ws://
        let http_url = remote_url
            .replace("ws://", "http://")
            .replace("wss://", "https://");
        let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

        let client = reqwest::Client::new();
        let resp: serde_json::Value = client
            .get(&version_url)
            .send()
            .await
            .map_err(|e| CrawlError::Session(format!("remote browser unreachable: {}", e)))?
            .json()
            .await
            .map_err(|e| CrawlError::Session(format!("invalid version response: {}", e)))?;

        let ws_url = resp
            .get("webSocketDebuggerUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CrawlError::Session("no webSocketDebuggerUrl in version response".to_string())
            })?;

        debug!("Connecting to WebSocket: {}", ws_url);

        let handler_config = HandlerConfig {
            request_timeout: Duration::from_secs(self.settings.timeout),
            ..Default::default()
        };

        let (browser, mut handler) = Browser::connect_with_config(ws_url, handler_config)
            .await
            .map_err(|e| CrawlError::Session(format!("remote browser connect failed: {}", e)))?;

        tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        Ok(browser)
    }

    async fn open_page(&self, browser: &Browser, user_agent: &str) -> Result<CdpPage> {
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| CrawlError::Session(format!("could not open page: {}", e)))?;

        // UA must be set before the first navigation
        page.execute(SetUserAgentOverrideParams::new(user_agent.to_string()))
            .await
            .map_err(|e| CrawlError::Session(format!("user agent override failed: {}", e)))?;

        Ok(CdpPage::new(page, Duration::from_secs(self.settings.timeout)))
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self, proxy: Option<&str>) -> Result<Box<dyn CrawlSession>> {
        // Desynchronize launches so parallel attempts do not start in lockstep
        crate::pacing::jitter(
            self.settings.startup_delay_min_secs,
            self.settings.startup_delay_max_secs,
        )
        .await;

        let browser = match self.settings.remote_url {
            Some(ref remote_url) => {
                if proxy.is_some() {
                    warn!("Remote browser uses its own egress; per-session proxy is ignored");
                }
                self.connect_remote(remote_url).await?
            }
            None => self.launch_local(proxy).await?,
        };

        let user_agent = pick_user_agent();
        match self.open_page(&browser, user_agent).await {
            Ok(page) => {
                debug!("Session opened (proxy={:?}, ua={})", proxy, user_agent);
                Ok(Box::new(ChromeSession {
                    browser,
                    page,
                    proxy: proxy.map(|p| p.to_string()),
                    user_agent,
                }))
            }
            Err(e) => {
                let mut browser = browser;
                let _ = browser.close().await;
                let _ = browser.wait().await;
                Err(e)
            }
        }
    }
}

#[cfg(feature = "browser")]
struct ChromeSession {
    browser: Browser,
    page: CdpPage,
    proxy: Option<String>,
    user_agent: &'static str,
}

#[cfg(feature = "browser")]
#[async_trait]
impl CrawlSession for ChromeSession {
    fn driver(&self) -> &dyn PageDriver {
        &self.page
    }

    fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    fn user_agent(&self) -> &str {
        self.user_agent
    }

    async fn close(self: Box<Self>) {
        let this = *self;
        let _ = this.page.close().await;
        let mut browser = this.browser;
        let _ = browser.close().await;
        let _ = browser.wait().await;
    }
}

// Stub for when the browser feature is disabled
#[cfg(not(feature = "browser"))]
pub struct ChromeSessionFactory;

#[cfg(not(feature = "browser"))]
impl ChromeSessionFactory {
    pub fn new(_settings: BrowserSettings) -> Self {
        Self
    }
}

#[cfg(not(feature = "browser"))]
#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self, _proxy: Option<&str>) -> Result<Box<dyn CrawlSession>> {
        Err(CrawlError::Session(
            "browser support not compiled; rebuild with --features browser".to_string(),
        ))
    }
}

#[cfg(all(test, feature = "browser"))]
mod tests {
    use super::*;

    #[test]
    fn test_find_chrome_rejects_missing_configured_binary() {
        let mut settings = BrowserSettings::default();
        settings.chrome_binary = Some(PathBuf::from("/nonexistent/chrome-binary"));
        let factory = ChromeSessionFactory::new(settings);
        assert!(factory.find_chrome().is_err());
    }
}
