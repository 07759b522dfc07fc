//! Chromium-backed driver: launches headless processes over CDP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::driver::{
    BrowserDriver, BrowserHandle, BrowserPage, DisconnectHook, DriverError, PdfPrintParams,
};

const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

// Chosen to keep Chromium alive inside constrained containers.
const LAUNCH_ARGS: &[&str] = &[
    "--disable-dev-shm-usage",
    "--disable-gpu",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-sync",
    "--no-first-run",
    "--mute-audio",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct ChromiumDriver;

impl ChromiumDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserDriver for ChromiumDriver {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, DriverError> {
        let config = BrowserConfig::builder()
            .no_sandbox()
            .args(LAUNCH_ARGS.iter().copied())
            .build()
            .map_err(DriverError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| DriverError::Launch(err.to_string()))?;

        let connected = Arc::new(AtomicBool::new(true));
        let hook: Arc<Mutex<Option<DisconnectHook>>> = Arc::new(Mutex::new(None));

        {
            let connected = Arc::clone(&connected);
            let hook = Arc::clone(&hook);
            tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
                connected.store(false, Ordering::SeqCst);
                let pending = hook.lock().unwrap_or_else(|e| e.into_inner()).take();
                if let Some(pending) = pending {
                    debug!(target: "platen::browser", "chromium connection ended");
                    pending();
                }
            });
        }

        Ok(Arc::new(ChromiumBrowser {
            browser: tokio::sync::Mutex::new(browser),
            connected,
            hook,
        }))
    }
}

struct ChromiumBrowser {
    browser: tokio::sync::Mutex<Browser>,
    connected: Arc<AtomicBool>,
    hook: Arc<Mutex<Option<DisconnectHook>>>,
}

#[async_trait]
impl BrowserHandle for ChromiumBrowser {
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>, DriverError> {
        let browser = self.browser.lock().await;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|err| DriverError::Page(err.to_string()))?;
        Ok(Box::new(ChromiumPage { page }))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_disconnect_hook(&self, hook: DisconnectHook) {
        // The connection may already be gone; fire immediately in that
        // case rather than never.
        if !self.is_connected() {
            hook();
            return;
        }
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut browser = self.browser.lock().await;
        if let Err(err) = browser.close().await {
            warn!(target: "platen::browser", error = %err, "browser close failed");
        }
        if let Err(err) = browser.wait().await {
            warn!(target: "platen::browser", error = %err, "browser did not exit cleanly");
        }
    }
}

struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl BrowserPage for ChromiumPage {
    async fn load_html(&self, html: &str) -> Result<(), DriverError> {
        match timeout(PAGE_LOAD_TIMEOUT, self.page.set_content(html)).await {
            Err(_elapsed) => Err(DriverError::Load(format!(
                "document did not settle within {PAGE_LOAD_TIMEOUT:?}"
            ))),
            Ok(Err(err)) => Err(DriverError::Load(err.to_string())),
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn print_pdf(&self, params: &PdfPrintParams) -> Result<Vec<u8>, DriverError> {
        let params = cdp_params(params);
        self.page
            .pdf(params)
            .await
            .map_err(|err| DriverError::Pdf(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.page.clone().close().await {
            debug!(target: "platen::browser", error = %err, "page close failed");
        }
    }
}

fn cdp_params(params: &PdfPrintParams) -> PrintToPdfParams {
    PrintToPdfParams {
        landscape: Some(params.landscape),
        display_header_footer: Some(params.display_header_footer),
        print_background: Some(params.print_background),
        scale: Some(params.scale),
        paper_width: Some(params.paper_width_in),
        paper_height: Some(params.paper_height_in),
        margin_top: params.margin_top_in,
        margin_bottom: params.margin_bottom_in,
        margin_left: params.margin_left_in,
        margin_right: params.margin_right_in,
        header_template: params.header_template.clone(),
        footer_template: params.footer_template.clone(),
        ..PrintToPdfParams::default()
    }
}
