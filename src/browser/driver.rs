//! Driver seam between the pool and a concrete headless browser.
//!
//! The pool only ever sees these traits; the chromium implementation and
//! the scripted test driver both plug in here.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Fired at most once, when the underlying browser process goes away.
pub type DisconnectHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("page could not be opened: {0}")]
    Page(String),
    #[error("page load failed: {0}")]
    Load(String),
    #[error("pdf generation failed: {0}")]
    Pdf(String),
}

/// Launches fresh browser instances on demand.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn BrowserHandle>, DriverError>;
}

/// One long-lived browser process owned by the pool.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Open a fresh ephemeral page.
    async fn new_page(&self) -> Result<Box<dyn BrowserPage>, DriverError>;

    /// Whether the process is still reachable.
    fn is_connected(&self) -> bool;

    /// Register the single disconnect observer. The hook must hold no
    /// owning reference back to the pool.
    fn set_disconnect_hook(&self, hook: DisconnectHook);

    /// Best-effort process teardown.
    async fn close(&self);
}

/// A page that lives for exactly one render.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Load the document and wait for it to settle, within the driver's
    /// load budget.
    async fn load_html(&self, html: &str) -> Result<(), DriverError>;

    /// Produce PDF bytes for the current document.
    async fn print_pdf(&self, params: &PdfPrintParams) -> Result<Vec<u8>, DriverError>;

    /// Best-effort page teardown.
    async fn close(&self);
}

/// Browser-agnostic print parameters, already reduced to what the CDP
/// call needs (lengths in inches).
#[derive(Debug, Clone, PartialEq)]
pub struct PdfPrintParams {
    pub landscape: bool,
    pub print_background: bool,
    pub scale: f64,
    pub paper_width_in: f64,
    pub paper_height_in: f64,
    pub display_header_footer: bool,
    pub header_template: Option<String>,
    pub footer_template: Option<String>,
    pub margin_top_in: Option<f64>,
    pub margin_bottom_in: Option<f64>,
    pub margin_left_in: Option<f64>,
    pub margin_right_in: Option<f64>,
}

impl Default for PdfPrintParams {
    fn default() -> Self {
        Self {
            landscape: false,
            print_background: true,
            scale: 1.0,
            paper_width_in: 8.27,
            paper_height_in: 11.69,
            display_header_footer: false,
            header_template: None,
            footer_template: None,
            margin_top_in: None,
            margin_bottom_in: None,
            margin_left_in: None,
            margin_right_in: None,
        }
    }
}
