//! Browser lifecycle management using Chrome DevTools Protocol

use applier_core::config::BrowserConfig;
use applier_core::{ApplierError, Result};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use std::sync::Arc;
use tracing::{debug, info};

use crate::cdp::ChromePage;
use crate::page::{Page, PageFactory};

/// Running Chrome instance that opens [`ChromePage`] tabs
pub struct BrowserSession {
    browser: Browser,
    config: BrowserConfig,
}

impl BrowserSession {
    /// Launch a new browser instance
    ///
    /// # Example
    /// ```no_run
    /// use applier_browser::{BrowserSession, PageFactory};
    /// use applier_core::config::BrowserConfig;
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let session = BrowserSession::launch(BrowserConfig::default()).unwrap();
    ///     let page = session.open_page("https://example.com").await.unwrap();
    /// }
    /// ```
    pub fn launch(config: BrowserConfig) -> Result<Self> {
        info!(
            "Launching browser (headless: {}, size: {}x{})",
            config.headless, config.window_width, config.window_height
        );

        let launch_options = LaunchOptions::default_builder()
            .headless(config.headless)
            .window_size(Some((config.window_width, config.window_height)))
            .build()
            .map_err(|e| ApplierError::Browser(format!("Failed to launch browser: {}", e)))?;

        let browser = Browser::new(launch_options)
            .map_err(|e| ApplierError::Browser(format!("Failed to launch browser: {}", e)))?;

        info!("Browser launched successfully");
        Ok(Self { browser, config })
    }

    /// Connect to an existing browser instance
    ///
    /// # Arguments
    /// * `port` - Chrome DevTools Protocol port (typically 9222)
    pub fn connect(port: u16, config: BrowserConfig) -> Result<Self> {
        info!("Connecting to existing browser on port {}", port);

        let browser = Browser::connect(format!("http://127.0.0.1:{}", port))
            .map_err(|e| ApplierError::Browser(format!("Failed to connect to browser: {}", e)))?;

        info!("Connected to browser successfully");
        Ok(Self { browser, config })
    }

    pub fn config(&self) -> &BrowserConfig {
        &self.config
    }
}

#[async_trait]
impl PageFactory for BrowserSession {
    async fn open_page(&self, url: &str) -> Result<Arc<dyn Page>> {
        let tab = self
            .browser
            .new_tab()
            .map_err(|e| ApplierError::Browser(format!("Failed to create tab: {}", e)))?;

        tab.set_default_timeout(self.config.navigation_timeout());
        tab.navigate_to(url)
            .map_err(|e| ApplierError::Browser(format!("Failed to navigate to {}: {}", url, e)))?;

        let waiting = Arc::clone(&tab);
        tokio::task::spawn_blocking(move || waiting.wait_until_navigated().map(|_| ()))
            .await
            .map_err(|e| ApplierError::Browser(format!("Navigation task failed: {}", e)))?
            .map_err(|e| ApplierError::Browser(format!("Navigation timeout for {}: {}", url, e)))?;

        debug!("Opened tab on {}", url);
        Ok(Arc::new(ChromePage::attach(tab, self.config.poll_interval())))
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        debug!("BrowserSession dropped, browser will be cleaned up");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrowserConfig::default();
        assert!(config.headless);
        assert_eq!(config.window_width, 1920);
        assert_eq!(config.window_height, 1080);
        assert_eq!(config.navigation_timeout_secs, 30);
    }
}
