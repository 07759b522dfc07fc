use thiserror::Error;

/// Failure vocabulary of the render pipeline.
///
/// Components surface these without attempting recovery; the dispatcher is
/// the single recovery point and uses [`RenderError::is_retryable`] to
/// split transient failures from terminal ones.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template parse failed: {0}")]
    TemplateParse(String),
    #[error("template evaluation failed: {0}")]
    TemplateEval(String),
    #[error("timed out waiting for a browser lease")]
    PoolTimeout,
    #[error("browser pool is shut down")]
    PoolDisposed,
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),
    #[error("page load failed: {0}")]
    PageLoad(String),
    #[error("pdf generation failed: {0}")]
    PdfGeneration(String),
    #[error("render cancelled")]
    Cancelled,
    #[error("output write failed: {0}")]
    OutputIo(#[from] std::io::Error),
}

impl RenderError {
    /// Whether the queue dispatcher may hand the message back for another
    /// attempt. Cancellation and a disposed pool are terminal.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RenderError::Cancelled | RenderError::PoolDisposed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_and_disposal_are_terminal() {
        assert!(!RenderError::Cancelled.is_retryable());
        assert!(!RenderError::PoolDisposed.is_retryable());
    }

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(RenderError::PoolTimeout.is_retryable());
        assert!(RenderError::PageLoad("net::ERR_FAILED".into()).is_retryable());
        assert!(RenderError::TemplateEval("helper blew up".into()).is_retryable());
    }
}
