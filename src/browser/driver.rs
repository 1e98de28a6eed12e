//! Page capability surface used by the crawl pipeline.
//!
//! The load controller, harvester, and scheduler talk to pages through
//! [`PageDriver`] so the pipeline logic can be exercised in tests without
//! a running Chrome instance.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

#[cfg(feature = "browser")]
use std::time::Duration;

#[cfg(feature = "browser")]
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
#[cfg(feature = "browser")]
use chromiumoxide::{Element, Page};

#[cfg(feature = "browser")]
use crate::error::CrawlError;

/// Operations the crawl pipeline needs from a live page.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate to `url` and wait for the load to be committed.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Serialized DOM of the current document.
    async fn content(&self) -> Result<String>;

    /// Run a script in the page and return its JSON result.
    async fn evaluate(&self, script: &str) -> Result<Value>;

    /// All elements currently matching a CSS selector.
    async fn select_all(&self, selector: &str) -> Result<Vec<Box<dyn ElementDriver>>>;

    /// Close the underlying page.
    async fn close(&self) -> Result<()>;
}

/// Operations on a single matched element.
#[async_trait]
pub trait ElementDriver: Send + Sync {
    async fn click(&self) -> Result<()>;
    async fn text(&self) -> Result<String>;
    async fn attribute(&self, name: &str) -> Result<Option<String>>;
}

/// [`PageDriver`] backed by a chromiumoxide CDP page.
#[cfg(feature = "browser")]
pub struct CdpPage {
    page: Page,
    nav_timeout: Duration,
}

#[cfg(feature = "browser")]
impl CdpPage {
    pub(crate) fn new(page: Page, nav_timeout: Duration) -> Self {
        Self { page, nav_timeout }
    }
}

#[cfg(feature = "browser")]
#[async_trait]
impl PageDriver for CdpPage {
    async fn navigate(&self, url: &str) -> Result<()> {
        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| CrawlError::Navigation {
                url: url.to_string(),
                reason: format!("invalid url: {}", e),
            })?;

        tokio::time::timeout(self.nav_timeout, self.page.execute(nav_params))
            .await
            .map_err(|_| CrawlError::Navigation {
                url: url.to_string(),
                reason: format!("timed out after {}s", self.nav_timeout.as_secs()),
            })?
            .map_err(|e| CrawlError::Navigation {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn content(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| CrawlError::Driver(e.to_string()))
    }

    async fn evaluate(&self, script: &str) -> Result<Value> {
        let result = self
            .page
            .evaluate(script.to_string())
            .await
            .map_err(|e| CrawlError::Driver(e.to_string()))?;
        Ok(result.into_value::<Value>().unwrap_or(Value::Null))
    }

    async fn select_all(&self, selector: &str) -> Result<Vec<Box<dyn ElementDriver>>> {
        let elements = self
            .page
            .find_elements(selector)
            .await
            .map_err(|e| CrawlError::Driver(e.to_string()))?;
        Ok(elements
            .into_iter()
            .map(|element| Box::new(CdpElement { element }) as Box<dyn ElementDriver>)
            .collect())
    }

    async fn close(&self) -> Result<()> {
        // Page::close takes ownership; handles are cheap clones.
        self.page
            .clone()
            .close()
            .await
            .map_err(|e| CrawlError::Driver(e.to_string()))
    }
}

#[cfg(feature = "browser")]
struct CdpElement {
    element: Element,
}

#[cfg(feature = "browser")]
#[async_trait]
impl ElementDriver for CdpElement {
    async fn click(&self) -> Result<()> {
        self.element
            .click()
            .await
            .map(|_| ())
            .map_err(|e| CrawlError::Driver(e.to_string()))
    }

    async fn text(&self) -> Result<String> {
        Ok(self
            .element
            .inner_text()
            .await
            .map_err(|e| CrawlError::Driver(e.to_string()))?
            .unwrap_or_default())
    }

    async fn attribute(&self, name: &str) -> Result<Option<String>> {
        self.element
            .attribute(name)
            .await
            .map_err(|e| CrawlError::Driver(e.to_string()))
    }
}
