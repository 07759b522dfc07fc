//! PDF renderer: one leased browser, one ephemeral page, one document.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserPage, BrowserPool, DriverError, PdfPrintParams};
use crate::domain::{PaperFormat, PdfOptions, RenderError};

const EMPTY_SECTION: &str = "<span></span>";
const MIN_SCALE: f64 = 0.1;
const MAX_SCALE: f64 = 2.0;

pub struct PdfRenderer {
    pool: Arc<BrowserPool>,
}

impl PdfRenderer {
    pub fn new(pool: Arc<BrowserPool>) -> Self {
        Self { pool }
    }

    /// Render `html` to PDF bytes using a pooled browser.
    ///
    /// Any failure after the page exists invalidates the lease so the
    /// pool replaces the instance; the page itself is always closed
    /// best-effort.
    pub async fn render_pdf(
        &self,
        html: &str,
        options: &PdfOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, RenderError> {
        let lease = self.pool.acquire(cancel).await?;

        let page = match lease.browser().new_page().await {
            Ok(page) => page,
            Err(err) => {
                lease.invalidate().await;
                return Err(map_driver_error(err));
            }
        };

        let outcome = print_document(page.as_ref(), html, options, cancel).await;
        page.close().await;

        match outcome {
            Ok(bytes) => {
                lease.release().await;
                Ok(bytes)
            }
            Err(err) => {
                lease.invalidate().await;
                Err(err)
            }
        }
    }
}

async fn print_document(
    page: &dyn BrowserPage,
    html: &str,
    options: &PdfOptions,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, RenderError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(RenderError::Cancelled),
        loaded = page.load_html(html) => loaded.map_err(map_driver_error)?,
    }

    let params = map_pdf_options(options);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RenderError::Cancelled),
        printed = page.print_pdf(&params) => printed.map_err(map_driver_error),
    }
}

fn map_driver_error(error: DriverError) -> RenderError {
    match error {
        DriverError::Launch(message) => RenderError::BrowserLaunch(message),
        DriverError::Page(message) | DriverError::Load(message) => RenderError::PageLoad(message),
        DriverError::Pdf(message) => RenderError::PdfGeneration(message),
    }
}

/// Reduce the request's paper settings to the browser's print parameters.
pub(crate) fn map_pdf_options(options: &PdfOptions) -> PdfPrintParams {
    let (paper_width_in, paper_height_in) = resolve_paper_size(options);
    let display_header_footer =
        options.header_template.is_some() || options.footer_template.is_some();

    let section = |value: &Option<String>| {
        if display_header_footer {
            Some(
                value
                    .clone()
                    .unwrap_or_else(|| EMPTY_SECTION.to_string()),
            )
        } else {
            None
        }
    };

    let margin = |value: &Option<String>| value.as_deref().and_then(css_length_to_inches);
    let margins = options.margins.as_ref();

    PdfPrintParams {
        landscape: options.landscape,
        print_background: options.print_background,
        scale: options.scale.clamp(MIN_SCALE, MAX_SCALE),
        paper_width_in,
        paper_height_in,
        display_header_footer,
        header_template: section(&options.header_template),
        footer_template: section(&options.footer_template),
        margin_top_in: margins.and_then(|m| margin(&m.top)),
        margin_bottom_in: margins.and_then(|m| margin(&m.bottom)),
        margin_left_in: margins.and_then(|m| margin(&m.left)),
        margin_right_in: margins.and_then(|m| margin(&m.right)),
    }
}

/// Explicit width+height override the named format; otherwise the format
/// (with A4 fallback) decides.
fn resolve_paper_size(options: &PdfOptions) -> (f64, f64) {
    if options.has_explicit_dimensions() {
        let width = options.width.as_deref().and_then(css_length_to_inches);
        let height = options.height.as_deref().and_then(css_length_to_inches);
        if let (Some(width), Some(height)) = (width, height) {
            return (width, height);
        }
    }
    PaperFormat::parse(&options.format).dimensions()
}

/// Convert a CSS length to inches. Bare numbers are pixels.
fn css_length_to_inches(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let (number, per_inch) = if let Some(raw) = value.strip_suffix("px") {
        (raw, 96.0)
    } else if let Some(raw) = value.strip_suffix("in") {
        (raw, 1.0)
    } else if let Some(raw) = value.strip_suffix("cm") {
        (raw, 2.54)
    } else if let Some(raw) = value.strip_suffix("mm") {
        (raw, 25.4)
    } else if let Some(raw) = value.strip_suffix("pt") {
        (raw, 72.0)
    } else {
        (value, 96.0)
    };

    let number: f64 = number.trim().parse().ok()?;
    (number.is_finite() && number >= 0.0).then(|| number / per_inch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::PoolSettings;
    use crate::browser::driver::mock::MockDriver;
    use crate::domain::PageMargins;

    fn options() -> PdfOptions {
        PdfOptions::default()
    }

    #[test]
    fn defaults_map_to_a4_portrait() {
        let params = map_pdf_options(&options());
        assert_eq!(params.paper_width_in, 8.27);
        assert_eq!(params.paper_height_in, 11.69);
        assert!(!params.landscape);
        assert!(params.print_background);
        assert!(!params.display_header_footer);
        assert!(params.header_template.is_none());
    }

    #[test]
    fn named_formats_resolve_case_insensitively() {
        let mut opts = options();
        opts.format = "letter".to_string();
        let params = map_pdf_options(&opts);
        assert_eq!((params.paper_width_in, params.paper_height_in), (8.5, 11.0));

        opts.format = "unknown-size".to_string();
        let params = map_pdf_options(&opts);
        assert_eq!((params.paper_width_in, params.paper_height_in), (8.27, 11.69));
    }

    #[test]
    fn explicit_dimensions_override_format() {
        let mut opts = options();
        opts.format = "Letter".to_string();
        opts.width = Some("210mm".to_string());
        opts.height = Some("297mm".to_string());

        let params = map_pdf_options(&opts);
        assert!((params.paper_width_in - 210.0 / 25.4).abs() < 1e-9);
        assert!((params.paper_height_in - 297.0 / 25.4).abs() < 1e-9);
    }

    #[test]
    fn one_sided_dimensions_fall_back_to_format() {
        let mut opts = options();
        opts.width = Some("210mm".to_string());
        let params = map_pdf_options(&opts);
        assert_eq!((params.paper_width_in, params.paper_height_in), (8.27, 11.69));
    }

    #[test]
    fn header_presence_enables_both_sections() {
        let mut opts = options();
        opts.header_template = Some("<div>page</div>".to_string());

        let params = map_pdf_options(&opts);
        assert!(params.display_header_footer);
        assert_eq!(params.header_template.as_deref(), Some("<div>page</div>"));
        assert_eq!(params.footer_template.as_deref(), Some("<span></span>"));
    }

    #[test]
    fn scale_is_clamped_to_the_valid_range() {
        let mut opts = options();
        opts.scale = 9.0;
        assert_eq!(map_pdf_options(&opts).scale, 2.0);
        opts.scale = 0.0;
        assert_eq!(map_pdf_options(&opts).scale, 0.1);
    }

    #[test]
    fn margins_convert_per_side() {
        let mut opts = options();
        opts.margins = Some(PageMargins {
            top: Some("1in".to_string()),
            bottom: Some("96px".to_string()),
            left: None,
            right: Some("2.54cm".to_string()),
        });

        let params = map_pdf_options(&opts);
        assert_eq!(params.margin_top_in, Some(1.0));
        assert_eq!(params.margin_bottom_in, Some(1.0));
        assert_eq!(params.margin_left_in, None);
        assert_eq!(params.margin_right_in, Some(1.0));
    }

    #[test]
    fn css_lengths_cover_the_common_units() {
        assert_eq!(css_length_to_inches("96px"), Some(1.0));
        assert_eq!(css_length_to_inches("72pt"), Some(1.0));
        assert_eq!(css_length_to_inches("25.4mm"), Some(1.0));
        assert_eq!(css_length_to_inches("48"), Some(0.5));
        assert_eq!(css_length_to_inches(" 1 in "), Some(1.0));
        assert_eq!(css_length_to_inches("wide"), None);
        assert_eq!(css_length_to_inches(""), None);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_render_releases_the_lease() {
        let driver = MockDriver::new();
        let pool = Arc::new(BrowserPool::new(driver.clone(), PoolSettings::default()));
        let renderer = PdfRenderer::new(Arc::clone(&pool));

        let bytes = renderer
            .render_pdf("<p>x</p>", &options(), &CancellationToken::new())
            .await
            .expect("render");

        assert_eq!(bytes, vec![0x25, 0x50, 0x44, 0x46]);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pdf_failure_invalidates_the_lease() {
        let driver = MockDriver::new();
        driver.fail_next_pdf();
        let pool = Arc::new(BrowserPool::new(driver.clone(), PoolSettings::default()));
        let renderer = PdfRenderer::new(Arc::clone(&pool));

        let error = renderer
            .render_pdf("<p>x</p>", &options(), &CancellationToken::new())
            .await
            .expect_err("must fail");

        assert!(matches!(error, RenderError::PdfGeneration(_)));
        assert_eq!(pool.pool_size(), 0);
        assert_eq!(driver.browser(0).close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_render_surfaces_cancelled() {
        let driver = MockDriver::new();
        let pool = Arc::new(BrowserPool::new(driver, PoolSettings::default()));
        let renderer = PdfRenderer::new(pool);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = renderer
            .render_pdf("<p>x</p>", &options(), &cancel)
            .await
            .expect_err("must cancel");
        assert!(matches!(error, RenderError::Cancelled));
    }
}
