//! Pure data structures describing render jobs and their outcomes.

pub mod error;
pub mod message;
pub mod template;
pub mod value;

pub use error::RenderError;
pub use message::{RenderReplyEnvelope, RenderRequest, RenderRequestEnvelope, RenderResult};
pub use template::{
    Branding, DocumentTemplate, PageMargins, PaperFormat, PdfOptions, TemplateContent,
};
pub use value::{TemplateMap, TemplateValue};
