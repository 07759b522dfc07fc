//! Pipeline: template expansion followed by PDF generation, timed.

use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{RenderError, RenderRequest, RenderResult};
use crate::engine::TemplateEngine;

use super::pdf::PdfRenderer;

pub struct RenderPipeline {
    engine: TemplateEngine,
    renderer: PdfRenderer,
}

impl RenderPipeline {
    pub fn new(engine: TemplateEngine, renderer: PdfRenderer) -> Self {
        Self { engine, renderer }
    }

    /// Run one request end to end. Errors propagate unchanged; no partial
    /// result is ever produced.
    pub async fn execute(
        &self,
        request: &RenderRequest,
        cancel: &CancellationToken,
    ) -> Result<RenderResult, RenderError> {
        let started = Instant::now();

        let html = self.engine.render(&request.template, cancel)?;
        let pdf_bytes = self
            .renderer
            .render_pdf(&html, &request.template.pdf, cancel)
            .await?;

        let elapsed = started.elapsed();
        debug!(
            target: "platen::render",
            job_id = %request.job_id,
            document_type = request.template.document_type,
            elapsed_ms = elapsed.as_millis() as u64,
            pdf_bytes = pdf_bytes.len(),
            "render complete"
        );

        Ok(RenderResult {
            job_id: request.job_id,
            document_type: request.template.document_type.clone(),
            pdf_bytes,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::browser::driver::mock::MockDriver;
    use crate::browser::{BrowserPool, PoolSettings};
    use crate::domain::{DocumentTemplate, TemplateContent};

    fn pipeline(driver: Arc<MockDriver>) -> RenderPipeline {
        let pool = Arc::new(BrowserPool::new(driver, PoolSettings::default()));
        RenderPipeline::new(TemplateEngine::new(), PdfRenderer::new(pool))
    }

    fn request(html: &str) -> RenderRequest {
        RenderRequest::new(DocumentTemplate {
            document_type: "statement".to_string(),
            template: TemplateContent {
                html: html.to_string(),
                ..TemplateContent::default()
            },
            ..DocumentTemplate::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn execute_produces_a_timed_result() {
        let pipeline = pipeline(MockDriver::new());
        let request = request("<p>{{meta.documentType}}</p>");

        let result = pipeline
            .execute(&request, &CancellationToken::new())
            .await
            .expect("execute");

        assert_eq!(result.job_id, request.job_id);
        assert_eq!(result.document_type, "statement");
        assert_eq!(result.pdf_bytes, vec![0x25, 0x50, 0x44, 0x46]);
    }

    #[tokio::test(start_paused = true)]
    async fn engine_failures_propagate_unchanged() {
        let pipeline = pipeline(MockDriver::new());
        let request = request("{{#each}}");

        let error = pipeline
            .execute(&request, &CancellationToken::new())
            .await
            .expect_err("must fail");
        assert!(matches!(error, RenderError::TemplateParse(_)));
    }
}
