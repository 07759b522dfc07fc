//! platen: a document render service.
//!
//! Turns self-contained document templates (Handlebars-style HTML with an
//! optional CSS companion, branding, a free-form variable bag, and paper
//! settings) into PDF byte streams through a bounded pool of headless
//! browsers. Requests arrive from a message broker or from template files
//! on disk.

pub mod browser;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod infra;
pub mod render;
pub mod transport;
