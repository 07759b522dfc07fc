use std::process;
use std::sync::Arc;

use platen::{
    browser::{BrowserPool, ChromiumDriver},
    config::{self, Command, ServeArgs},
    dispatch::{FileDispatcher, QueueDispatcher},
    engine::TemplateEngine,
    infra::telemetry,
    render::{PdfRenderer, RenderPipeline},
    transport::{KafkaTransport, TransportError},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[derive(Debug, Error)]
enum HostError {
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] config::LoadError),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error("transport startup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("file batch failed: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_host_error(&error);
        process::exit(1);
    }
}

fn report_host_error(error: &HostError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "host error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "host error");
    });
}

async fn run() -> Result<(), HostError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    let command = cli_args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));

    match command {
        Command::Serve(_) => run_serve(settings).await,
        Command::RenderDir(_) => run_render_dir(settings).await,
    }
}

fn build_pipeline(settings: &config::Settings) -> (Arc<BrowserPool>, Arc<RenderPipeline>) {
    let driver = Arc::new(ChromiumDriver::new());
    let pool = Arc::new(BrowserPool::new(driver, settings.browser_pool.clone()));
    let pipeline = Arc::new(RenderPipeline::new(
        TemplateEngine::new(),
        PdfRenderer::new(Arc::clone(&pool)),
    ));
    (pool, pipeline)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target: "platen::host", "shutdown requested");
                shutdown.cancel();
            }
        });
    }
    shutdown
}

async fn run_serve(settings: config::Settings) -> Result<(), HostError> {
    let (pool, pipeline) = build_pipeline(&settings);
    let transport = Arc::new(KafkaTransport::new(&settings.queue)?);
    let dispatcher = Arc::new(QueueDispatcher::new(
        pipeline,
        transport,
        settings.queue.clone(),
        pool.max_size(),
    ));

    info!(
        target: "platen::host",
        request_topic = settings.queue.request_topic,
        group = settings.queue.consumer_group_id,
        "starting queue mode"
    );

    let shutdown = shutdown_on_ctrl_c();
    Arc::clone(&dispatcher).run(shutdown).await;

    let metrics = dispatcher.metrics().snapshot();
    info!(
        target: "platen::host",
        rendered = metrics.rendered,
        failed = metrics.failed,
        retried = metrics.retried,
        "queue mode stopped"
    );

    pool.shutdown().await;
    Ok(())
}

async fn run_render_dir(settings: config::Settings) -> Result<(), HostError> {
    let (pool, pipeline) = build_pipeline(&settings);
    let dispatcher = FileDispatcher::new(pipeline, settings.files.clone());

    info!(
        target: "platen::host",
        templates = %settings.files.templates_dir.display(),
        outputs = %settings.files.output_dir.display(),
        "starting file mode"
    );

    let shutdown = shutdown_on_ctrl_c();
    let summary = dispatcher.run(&shutdown).await?;
    pool.shutdown().await;

    info!(
        target: "platen::host",
        succeeded = summary.succeeded,
        failed = summary.failed,
        "file mode finished"
    );
    Ok(())
}
