//! HTML-to-PDF rendering over the browser pool, and the request pipeline.

pub mod pdf;
pub mod pipeline;

pub use pdf::PdfRenderer;
pub use pipeline::RenderPipeline;
