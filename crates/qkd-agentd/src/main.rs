use std::{sync::Arc, time::Duration};

use anyhow::Context;
use qkd_api::{ControllerAdapter, HttpApi};
use qkd_core::{
    CommandRateProbe, Controller, DataRoot, EventBus, FaultPolicy, PartnerLink, Pipeline, Relay, StageContext, StagePipeline,
    StatusBoard, Subscribe, Watchdog, system,
};
use qkd_model::LinkConfig;
use qkd_observe::{Journal, LoggerConfig, logger_init};
use qkd_prometheus::LinkMetrics;
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const CONFIG_ENV: &str = "QKD_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1) Config
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV).ok())
        .with_context(|| format!("usage: qkd-agentd <config.json> (or set {CONFIG_ENV})"))?;
    let cfg = LinkConfig::from_file(&path).with_context(|| format!("loading {path}"))?;

    // 2) Logger
    let log = &cfg.logging;
    logger_init(&LoggerConfig::from_options(&log.format, &log.level, log.with_targets)?)?;
    system::init_uptime();
    let node = system::node_name(cfg.node_name.as_deref());
    info!(%node, config = %path, "logger initialized");

    // 3) Data root
    let layout = DataRoot::new(&cfg.data_root);
    layout
        .prepare()
        .with_context(|| format!("preparing data root {}", cfg.data_root.display()))?;
    let board = StatusBoard::new(node);

    // 4) Relay to the partner
    let (events, events_rx) = mpsc::unbounded_channel();
    let probe = Arc::new(CommandRateProbe::new(
        cfg.programs.rate_probe.clone(),
        Duration::from_millis(cfg.negotiation.rate_probe_timeout_ms),
    ));
    let mut relay = Relay::start(&cfg, &layout, probe, events.clone()).await?;
    let link: Arc<dyn PartnerLink> = Arc::new(relay.handle());

    // 5) Stages
    let cfg = Arc::new(cfg);
    let policy = FaultPolicy::default();
    let ctx = StageContext {
        cfg: Arc::clone(&cfg),
        layout,
        events: events.clone(),
        taps: relay.handle().taps().clone(),
        board: board.clone(),
        policy: policy.clone(),
    };
    let pipeline: Arc<dyn Pipeline> = Arc::new(StagePipeline::from_config(ctx).with_transfer(relay.liveness()));

    // 6) Controller + subscribers
    let metrics = LinkMetrics::new()?;
    let subscribers: Vec<Arc<dyn Subscribe>> = vec![Arc::new(Journal::new()), Arc::new(metrics.clone())];
    let controller = Arc::new(Controller::new(
        Arc::clone(&pipeline),
        Arc::clone(&link),
        board.clone(),
        Arc::new(EventBus::new(subscribers)),
        events.clone(),
        Duration::from_millis(cfg.negotiation.timeout_ms),
    )
    .with_policy(policy));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(Arc::clone(&controller).run(events_rx, cancel.clone())));

    // 7) Watchdog
    let watchdog = Watchdog::new(pipeline, link, board.clone(), events);
    let period = Duration::from_millis(cfg.health.watchdog_interval_ms);
    tasks.push(tokio::spawn(watchdog.run(period, cancel.clone())));

    // 8) HTTP API
    let listener = TcpListener::bind(&cfg.api.listen)
        .await
        .with_context(|| format!("binding {}", cfg.api.listen))?;
    let handler = Arc::new(ControllerAdapter::new(Arc::clone(&controller), board.clone()));
    let router = HttpApi::new(handler).with_metrics(metrics, board).router();
    let shutdown = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum_serve(listener, router, shutdown).await {
            warn!(error = %e, "http api stopped");
        }
    }));
    info!(listen = %cfg.api.listen, "agent is running; press Ctrl+C to stop");

    // 9) Shutdown
    tokio::signal::ctrl_c().await?;
    info!("shutting down...");
    cancel.cancel();
    controller.shutdown().await;
    relay.stop().await;
    for task in tasks {
        let _ = task.await;
    }
    info!("stopped");
    Ok(())
}

async fn axum_serve(
    listener: TcpListener,
    router: qkd_api::axum::Router,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    qkd_api::axum::serve(listener, router)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
