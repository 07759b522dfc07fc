//! Headless-browser pool and its driver seam.

pub mod chromium;
pub mod driver;
pub mod pool;

pub use chromium::ChromiumDriver;
pub use driver::{BrowserDriver, BrowserHandle, BrowserPage, DriverError, PdfPrintParams};
pub use pool::{BrowserLease, BrowserPool, PoolError, PoolSettings};
