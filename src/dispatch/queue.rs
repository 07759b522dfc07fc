//! Queue-mode dispatcher: the concurrency envelope around the pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::QueueSettings;
use crate::domain::{RenderError, RenderRequest, RenderRequestEnvelope, RenderResult};
use crate::render::RenderPipeline;
use crate::transport::{Delivery, QueueTransport, RetryOutcome};

use super::metrics::DispatchMetrics;

const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct QueueDispatcher {
    pipeline: Arc<RenderPipeline>,
    transport: Arc<dyn QueueTransport>,
    metrics: Arc<DispatchMetrics>,
    settings: QueueSettings,
}

impl QueueDispatcher {
    pub fn new(
        pipeline: Arc<RenderPipeline>,
        transport: Arc<dyn QueueTransport>,
        settings: QueueSettings,
        pool_max_size: usize,
    ) -> Self {
        if settings.max_concurrent_renders > pool_max_size {
            warn!(
                target: "platen::dispatch",
                max_concurrent_renders = settings.max_concurrent_renders,
                pool_max_size,
                "queue concurrency exceeds browser pool capacity; leases will time out under load"
            );
        }

        Self {
            pipeline,
            transport,
            metrics: Arc::new(DispatchMetrics::new()),
            settings,
        }
    }

    pub fn metrics(&self) -> Arc<DispatchMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Consume until the transport closes or shutdown is requested, then
    /// drain in-flight work.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let concurrency = self.settings.max_concurrent_renders;
        let limiter = Arc::new(Semaphore::new(concurrency));
        info!(
            target: "platen::dispatch",
            concurrency,
            request_topic = self.settings.request_topic,
            "queue dispatcher started"
        );

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                acquired = Arc::clone(&limiter).acquire_owned() => match acquired {
                    Ok(permit) => permit,
                    Err(_closed) => break,
                },
            };

            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.transport.receive() => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let dispatcher = Arc::clone(&self);
                    let cancel = shutdown.child_token();
                    tokio::spawn(async move {
                        dispatcher.handle_delivery(delivery, &cancel).await;
                        drop(permit);
                    });
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(target: "platen::dispatch", error = %err, "receive failed; backing off");
                    drop(permit);
                    tokio::time::sleep(RECEIVE_ERROR_BACKOFF).await;
                }
            }
        }

        // Wait for every in-flight render before reporting drained.
        let _ = limiter.acquire_many(concurrency as u32).await;
        info!(target: "platen::dispatch", "queue dispatcher drained");
    }

    async fn handle_delivery(&self, delivery: Delivery, cancel: &CancellationToken) {
        let envelope: RenderRequestEnvelope = match serde_json::from_slice(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(target: "platen::dispatch", error = %err, "rejecting malformed request envelope");
                let reason = format!("malformed request envelope: {err}");
                if let Err(dlq_err) = self.transport.dead_letter(delivery, &reason).await {
                    error!(target: "platen::dispatch", error = %dlq_err, "dead-letter publish failed");
                }
                self.metrics.record_failure();
                return;
            }
        };

        debug!(
            target: "platen::dispatch",
            correlation_id = %envelope.correlation_id,
            device_id = envelope.device_id,
            attempt = delivery.attempt,
            "render request received"
        );

        let request = RenderRequest::with_job_id(
            envelope.correlation_id,
            envelope.template.clone(),
            envelope.requested_at,
        );

        match self.pipeline.execute(&request, cancel).await {
            Ok(result) => self.handle_success(&envelope, delivery, &result).await,
            Err(error) => self.handle_failure(&envelope, delivery, &error).await,
        }
    }

    async fn handle_success(
        &self,
        envelope: &RenderRequestEnvelope,
        delivery: Delivery,
        result: &RenderResult,
    ) {
        let reply = if envelope.return_pdf_inline {
            envelope.reply_inline(result)
        } else {
            match self.write_pdf(envelope, result).await {
                Ok(path) => envelope.reply_path(result, &path),
                Err(error) => {
                    return self.handle_failure(envelope, delivery, &error).await;
                }
            }
        };

        if let Err(err) = self.transport.publish_reply(&reply).await {
            error!(
                target: "platen::dispatch",
                correlation_id = %envelope.correlation_id,
                error = %err,
                "reply publish failed"
            );
        }
        if let Err(err) = self.transport.complete(delivery).await {
            warn!(target: "platen::dispatch", error = %err, "message completion failed");
        }
        self.metrics.record_success();
        info!(
            target: "platen::dispatch",
            correlation_id = %envelope.correlation_id,
            document_type = envelope.template.document_type,
            elapsed_ms = result.elapsed.as_millis() as u64,
            inline = envelope.return_pdf_inline,
            "render dispatched"
        );
    }

    async fn handle_failure(
        &self,
        envelope: &RenderRequestEnvelope,
        delivery: Delivery,
        error: &RenderError,
    ) {
        warn!(
            target: "platen::dispatch",
            correlation_id = %envelope.correlation_id,
            attempt = delivery.attempt,
            error = %error,
            "render failed"
        );

        if error.is_retryable() {
            match self.transport.retry(delivery, &error.to_string()).await {
                Ok(RetryOutcome::Scheduled { next_attempt }) => {
                    self.metrics.record_retry();
                    debug!(
                        target: "platen::dispatch",
                        correlation_id = %envelope.correlation_id,
                        next_attempt,
                        "render scheduled for retry"
                    );
                    return;
                }
                Ok(RetryOutcome::Exhausted) => {}
                Err(err) => {
                    error!(target: "platen::dispatch", error = %err, "retry hand-off failed");
                }
            }
        } else if let Err(err) = self.transport.complete(delivery).await {
            warn!(target: "platen::dispatch", error = %err, "message completion failed");
        }

        let reply = envelope.reply_failure(error.to_string());
        if let Err(err) = self.transport.publish_reply(&reply).await {
            error!(
                target: "platen::dispatch",
                correlation_id = %envelope.correlation_id,
                error = %err,
                "failure reply publish failed"
            );
        }
        self.metrics.record_failure();
    }

    /// Write the PDF beside its correlation id; redelivery overwrites the
    /// same file, which keeps the operation idempotent.
    async fn write_pdf(
        &self,
        envelope: &RenderRequestEnvelope,
        result: &RenderResult,
    ) -> Result<PathBuf, RenderError> {
        let directory = &self.settings.pdf_output_path;
        tokio::fs::create_dir_all(directory).await?;

        let file_name = format!(
            "{}_{}.pdf",
            envelope.template.document_type,
            envelope.correlation_id.simple()
        );
        let path = directory.join(file_name);
        tokio::fs::write(&path, &result.pdf_bytes).await?;
        Ok(std::path::absolute(&path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::driver::mock::MockDriver;
    use crate::browser::{BrowserPool, PoolSettings};
    use crate::domain::{DocumentTemplate, TemplateContent};
    use crate::engine::TemplateEngine;
    use crate::render::PdfRenderer;
    use crate::transport::ChannelTransport;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn pipeline(driver: Arc<MockDriver>) -> Arc<RenderPipeline> {
        let pool = Arc::new(BrowserPool::new(driver, PoolSettings::default()));
        Arc::new(RenderPipeline::new(
            TemplateEngine::new(),
            PdfRenderer::new(pool),
        ))
    }

    fn envelope(html: &str, inline: bool) -> RenderRequestEnvelope {
        RenderRequestEnvelope {
            correlation_id: Uuid::new_v4(),
            device_id: "till-4".to_string(),
            session_id: Some("shift-9".to_string()),
            template: DocumentTemplate {
                document_type: "receipt".to_string(),
                template: TemplateContent {
                    html: html.to_string(),
                    ..TemplateContent::default()
                },
                ..DocumentTemplate::default()
            },
            return_pdf_inline: inline,
            requested_at: OffsetDateTime::now_utc(),
        }
    }

    fn queue_settings(max_retries: u32, output: PathBuf) -> QueueSettings {
        QueueSettings {
            max_retries,
            retry_delay: Duration::from_millis(10),
            max_concurrent_renders: 2,
            pdf_output_path: output,
            ..QueueSettings::default()
        }
    }

    async fn run_dispatcher(
        settings: QueueSettings,
        driver: Arc<MockDriver>,
        transport: Arc<ChannelTransport>,
    ) -> Arc<QueueDispatcher> {
        let dispatcher = Arc::new(QueueDispatcher::new(
            pipeline(driver),
            transport,
            settings,
            4,
        ));
        Arc::clone(&dispatcher)
            .run(CancellationToken::new())
            .await;
        dispatcher
    }

    #[tokio::test(start_paused = true)]
    async fn success_reply_carries_inline_base64() {
        let transport = Arc::new(ChannelTransport::new(0, Duration::from_millis(10)));
        let request = envelope("<p>ok</p>", true);
        transport.push_request(&request);
        transport.close();

        let dispatcher = run_dispatcher(
            queue_settings(0, PathBuf::from("unused")),
            MockDriver::new(),
            Arc::clone(&transport),
        )
        .await;

        let replies = transport.replies();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert!(reply.success);
        assert_eq!(reply.pdf_base64.as_deref(), Some("JVBERg=="));
        assert!(reply.pdf_path.is_none());
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.device_id, request.device_id);
        assert_eq!(reply.session_id, request.session_id);
        assert_eq!(reply.document_type, "receipt");

        let metrics = dispatcher.metrics().snapshot();
        assert_eq!(metrics.rendered, 1);
        assert_eq!(metrics.failed, 0);
        assert_eq!(transport.completed_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_failure_produces_one_failure_reply() {
        let transport = Arc::new(ChannelTransport::new(0, Duration::from_millis(10)));
        let request = envelope("{{#if}}", true);
        transport.push_request(&request);
        transport.close();

        let dispatcher = run_dispatcher(
            queue_settings(0, PathBuf::from("unused")),
            MockDriver::new(),
            Arc::clone(&transport),
        )
        .await;

        let replies = transport.replies();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert!(!reply.success);
        assert!(reply.error_message.as_deref().unwrap_or_default().starts_with("template parse failed"));
        assert!(reply.pdf_base64.is_none());
        assert!(reply.pdf_path.is_none());

        let metrics = dispatcher.metrics().snapshot();
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.rendered, 0);
        assert_eq!(transport.dead_letters().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_go_back_to_the_transport_first() {
        let transport = Arc::new(ChannelTransport::new(1, Duration::from_millis(10)));
        let request = envelope("{{#if}}", true);
        transport.push_request(&request);
        transport.close();

        let dispatcher = run_dispatcher(
            queue_settings(1, PathBuf::from("unused")),
            MockDriver::new(),
            Arc::clone(&transport),
        )
        .await;

        let metrics = dispatcher.metrics().snapshot();
        assert_eq!(metrics.retried, 1);
        assert_eq!(metrics.failed, 1);

        // One failure reply after exhaustion, and the message is parked.
        let replies = transport.replies();
        assert_eq!(replies.len(), 1);
        assert!(!replies[0].success);
        assert_eq!(transport.dead_letters().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn non_inline_success_writes_the_pdf_to_disk() {
        let output = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ChannelTransport::new(0, Duration::from_millis(10)));
        let request = envelope("<p>ok</p>", false);
        transport.push_request(&request);
        transport.close();

        run_dispatcher(
            queue_settings(0, output.path().to_path_buf()),
            MockDriver::new(),
            Arc::clone(&transport),
        )
        .await;

        let replies = transport.replies();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0];
        assert!(reply.success);
        assert!(reply.pdf_base64.is_none());

        let expected_name = format!("receipt_{}.pdf", request.correlation_id.simple());
        let path = PathBuf::from(reply.pdf_path.as_deref().expect("path"));
        assert!(path.is_absolute());
        assert!(path.ends_with(&expected_name));
        let written = std::fs::read(&path).expect("pdf on disk");
        assert_eq!(written, vec![0x25, 0x50, 0x44, 0x46]);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_payloads_are_dead_lettered() {
        let transport = Arc::new(ChannelTransport::new(3, Duration::from_millis(10)));
        transport.push_bytes(b"not an envelope".to_vec(), None);
        transport.close();

        let dispatcher = run_dispatcher(
            queue_settings(3, PathBuf::from("unused")),
            MockDriver::new(),
            Arc::clone(&transport),
        )
        .await;

        assert!(transport.replies().is_empty());
        let parked = transport.dead_letters();
        assert_eq!(parked.len(), 1);
        assert!(parked[0].1.contains("malformed"));
        assert_eq!(dispatcher.metrics().snapshot().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_intake() {
        let transport = Arc::new(ChannelTransport::new(0, Duration::from_millis(10)));
        let dispatcher = Arc::new(QueueDispatcher::new(
            pipeline(MockDriver::new()),
            Arc::clone(&transport) as Arc<dyn QueueTransport>,
            queue_settings(0, PathBuf::from("unused")),
            4,
        ));

        let shutdown = CancellationToken::new();
        let running = tokio::spawn(Arc::clone(&dispatcher).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.cancel();
        running.await.expect("dispatcher stops");

        assert!(transport.replies().is_empty());
    }
}
