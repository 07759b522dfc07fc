//! Templating engine: expands Handlebars-style documents against the
//! request context and inlines the CSS companion.

mod codes;
mod helpers;

use handlebars::Handlebars;
use serde_json::json;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::sync::CancellationToken;

use crate::domain::{DocumentTemplate, RenderError};

const MAIN_TEMPLATE: &str = "__document";
const CSS_TEMPLATE: &str = "__stylesheet";
const HEAD_CLOSE: &str = "</head>";

/// Stateless engine front. Each render builds its own registry so
/// per-request partials never leak across jobs; only the built-in helper
/// set is shared, and that is immutable.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemplateEngine;

impl TemplateEngine {
    pub fn new() -> Self {
        Self
    }

    /// Produce the complete HTML document for one render job.
    pub fn render(
        &self,
        template: &DocumentTemplate,
        cancel: &CancellationToken,
    ) -> Result<String, RenderError> {
        if cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }

        let mut registry = build_registry();
        for (name, body) in &template.template.partials {
            registry
                .register_partial(name, body)
                .map_err(|err| RenderError::TemplateParse(err.to_string()))?;
        }
        registry
            .register_template_string(MAIN_TEMPLATE, &template.template.html)
            .map_err(|err| RenderError::TemplateParse(err.to_string()))?;

        let context = build_context(template);
        let html = registry
            .render(MAIN_TEMPLATE, &context)
            .map_err(|err| RenderError::TemplateEval(err.to_string()))?;

        match template.template.css.as_deref() {
            Some(css) if !css.is_empty() => {
                // The parser reads `}}}` as a closing delimiter, which
                // plain CSS produces whenever rules end back to back.
                let defused = css.replace("}}}", "}} }");
                registry
                    .register_template_string(CSS_TEMPLATE, &defused)
                    .map_err(|err| RenderError::TemplateParse(err.to_string()))?;
                let css = registry
                    .render(CSS_TEMPLATE, &context)
                    .map_err(|err| RenderError::TemplateEval(err.to_string()))?;
                Ok(inject_css(&html, &css))
            }
            _ => Ok(html),
        }
    }
}

fn build_registry() -> Handlebars<'static> {
    let mut registry = Handlebars::new();
    registry.register_helper("upper", Box::new(helpers::UpperHelper));
    registry.register_helper("lower", Box::new(helpers::LowerHelper));
    registry.register_helper("formatDate", Box::new(helpers::FormatDateHelper));
    registry.register_helper("currency", Box::new(helpers::CurrencyHelper));
    registry.register_helper("ifEquals", Box::new(helpers::IfEqualsHelper));
    registry.register_helper("qrCode", Box::new(codes::QrCodeHelper));
    registry.register_helper("barCode", Box::new(codes::BarCodeHelper));
    registry
}

fn build_context(template: &DocumentTemplate) -> serde_json::Value {
    let generated_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();

    json!({
        "branding": &template.branding,
        "variables": &template.variables,
        "meta": {
            "documentType": &template.document_type,
            "version": &template.version,
            "generatedAt": generated_at,
        },
    })
}

/// Place the style block just before `</head>` (any casing), or prepend
/// it when the document has no head section.
fn inject_css(html: &str, css: &str) -> String {
    let style = format!("<style>{css}</style>");
    match find_case_insensitive(html, HEAD_CLOSE) {
        Some(position) => format!("{}{}{}", &html[..position], style, &html[position..]),
        None => format!("{style}{html}"),
    }
}

fn find_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}
