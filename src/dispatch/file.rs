//! File-mode dispatcher: render every template JSON under a directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::FileSettings;
use crate::domain::{DocumentTemplate, RenderError, RenderRequest};
use crate::render::RenderPipeline;

pub struct FileDispatcher {
    pipeline: Arc<RenderPipeline>,
    settings: FileSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Error)]
enum FileJobError {
    #[error("template file unreadable: {0}")]
    Read(std::io::Error),
    #[error("template file rejected: {0}")]
    Parse(serde_json::Error),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("output write failed: {0}")]
    Write(std::io::Error),
}

impl FileDispatcher {
    pub fn new(pipeline: Arc<RenderPipeline>, settings: FileSettings) -> Self {
        Self { pipeline, settings }
    }

    /// Render the whole batch. Individual failures are logged and counted
    /// but never stop the scan.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<BatchSummary, std::io::Error> {
        if !self.settings.templates_dir.exists() {
            warn!(
                target: "platen::dispatch",
                directory = %self.settings.templates_dir.display(),
                "templates directory missing; creating it"
            );
            tokio::fs::create_dir_all(&self.settings.templates_dir).await?;
        }
        tokio::fs::create_dir_all(&self.settings.output_dir).await?;

        let mut files: Vec<PathBuf> = WalkDir::new(&self.settings.templates_dir)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
            })
            .map(|entry| entry.into_path())
            .collect();
        files.sort();

        info!(
            target: "platen::dispatch",
            count = files.len(),
            directory = %self.settings.templates_dir.display(),
            "starting file batch"
        );

        let succeeded = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        futures::stream::iter(files)
            .for_each_concurrent(Some(self.settings.concurrency), |path| {
                let succeeded = &succeeded;
                let failed = &failed;
                async move {
                    match self.render_file(&path, cancel).await {
                        Ok(output) => {
                            info!(
                                target: "platen::dispatch",
                                template = %path.display(),
                                output = %output.display(),
                                "template rendered"
                            );
                            succeeded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(error) => {
                            warn!(
                                target: "platen::dispatch",
                                template = %path.display(),
                                error = %error,
                                "template failed"
                            );
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        let summary = BatchSummary {
            succeeded: succeeded.into_inner(),
            failed: failed.into_inner(),
        };
        info!(
            target: "platen::dispatch",
            succeeded = summary.succeeded,
            failed = summary.failed,
            "file batch finished"
        );
        Ok(summary)
    }

    async fn render_file(
        &self,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, FileJobError> {
        let bytes = tokio::fs::read(path).await.map_err(FileJobError::Read)?;
        let template: DocumentTemplate =
            serde_json::from_slice(&bytes).map_err(FileJobError::Parse)?;

        let request = RenderRequest::new(template);
        let result = self.pipeline.execute(&request, cancel).await?;

        let file_name = format!(
            "{}_{}.pdf",
            result.document_type,
            result.job_id.simple()
        );
        let output = self.settings.output_dir.join(file_name);
        tokio::fs::write(&output, &result.pdf_bytes)
            .await
            .map_err(FileJobError::Write)?;
        Ok(output)
    }
}
