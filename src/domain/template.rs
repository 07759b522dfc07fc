//! Document template model: the immutable description of one render job.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::value::TemplateMap;

/// A self-contained render job description as it arrives on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DocumentTemplate {
    pub document_type: String,
    pub version: String,
    pub branding: Branding,
    pub template: TemplateContent,
    pub variables: TemplateMap,
    pub pdf: PdfOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Branding {
    pub company_name: String,
    pub logo_url: Option<String>,
    pub primary_colour: Option<String>,
    pub secondary_colour: Option<String>,
    pub heading_font: Option<String>,
    pub body_font: Option<String>,
    pub custom: IndexMap<String, String>,
}

/// Template body plus optional CSS companion and per-request partials.
///
/// `html_path`/`css_path` are file references resolved by an upstream
/// collaborator; once resolved the inline fields are authoritative and the
/// paths are only carried through.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemplateContent {
    pub html: String,
    pub css: Option<String>,
    pub html_path: Option<String>,
    pub css_path: Option<String>,
    pub partials: IndexMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PdfOptions {
    pub format: String,
    pub width: Option<String>,
    pub height: Option<String>,
    pub landscape: bool,
    pub print_background: bool,
    pub scale: f64,
    pub margins: Option<PageMargins>,
    pub header_template: Option<String>,
    pub footer_template: Option<String>,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            format: PaperFormat::A4.name().to_string(),
            width: None,
            height: None,
            landscape: false,
            print_background: true,
            scale: 1.0,
            margins: None,
            header_template: None,
            footer_template: None,
        }
    }
}

impl PdfOptions {
    /// True when both explicit dimensions are present and non-empty, which
    /// makes them shadow `format`.
    pub fn has_explicit_dimensions(&self) -> bool {
        fn filled(value: &Option<String>) -> bool {
            value.as_deref().is_some_and(|text| !text.trim().is_empty())
        }
        filled(&self.width) && filled(&self.height)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageMargins {
    pub top: Option<String>,
    pub bottom: Option<String>,
    pub left: Option<String>,
    pub right: Option<String>,
}

/// Named paper sizes the browser understands. Anything unrecognised maps
/// to A4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaperFormat {
    A2,
    A3,
    A4,
    Letter,
    Legal,
    Tabloid,
}

impl PaperFormat {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_uppercase().as_str() {
            "A2" => PaperFormat::A2,
            "A3" => PaperFormat::A3,
            "LETTER" => PaperFormat::Letter,
            "LEGAL" => PaperFormat::Legal,
            "TABLOID" => PaperFormat::Tabloid,
            _ => PaperFormat::A4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PaperFormat::A2 => "A2",
            PaperFormat::A3 => "A3",
            PaperFormat::A4 => "A4",
            PaperFormat::Letter => "Letter",
            PaperFormat::Legal => "Legal",
            PaperFormat::Tabloid => "Tabloid",
        }
    }

    /// Paper dimensions in inches, portrait orientation.
    pub fn dimensions(self) -> (f64, f64) {
        match self {
            PaperFormat::A2 => (16.54, 23.39),
            PaperFormat::A3 => (11.69, 16.54),
            PaperFormat::A4 => (8.27, 11.69),
            PaperFormat::Letter => (8.5, 11.0),
            PaperFormat::Legal => (8.5, 14.0),
            PaperFormat::Tabloid => (11.0, 17.0),
        }
    }
}
