use std::sync::Arc;

use anyhow::Context;
use streamvisor::{
    load_startup_frame, Backend, BrokerConfig, Collaborators, Config, FfmpegLauncher, LogConfig,
    LogWriter, MemoryTransport, StillImageSource, StreamSupervisor, Subscribe, Transport,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = Config::resolve_path(std::env::args().nth(1));
    let cfg = match Config::load(&path) {
        Ok(cfg) => cfg,
        Err(e) => {
            init_tracing(&LogConfig::default().filter);
            error!(path = %path.display(), error = %e, label = e.as_label(), "configuration rejected");
            std::process::exit(1);
        }
    };
    init_tracing(&cfg.log.filter);
    info!(path = %path.display(), backend = ?cfg.broker.backend, "configuration loaded");

    let transport = transport(&cfg.broker).await?;
    let parts = Collaborators {
        transport,
        launcher: Arc::new(FfmpegLauncher::new(cfg.encoder.clone(), &cfg.stream)),
        source: Arc::new(StillImageSource::new(cfg.stream.startup_image.clone())),
    };
    let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
    let frame = load_startup_frame(&cfg.stream.startup_image).await;

    let sup = StreamSupervisor::new(&cfg, parts, subs, frame);

    let faults = sup.fault_reporter();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        faults.report(format!("panic: {info}"));
    }));

    let code = sup.run().await;
    info!(code, "exiting");
    std::process::exit(code);
}

fn init_tracing(fallback: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

async fn transport(cfg: &BrokerConfig) -> anyhow::Result<Arc<dyn Transport>> {
    match cfg.backend {
        #[cfg(feature = "redis")]
        Backend::Redis => {
            let redis = streamvisor::RedisTransport::open(&cfg.url)
                .with_context(|| format!("opening redis at {}", cfg.url))?;
            Ok(Arc::new(redis))
        }
        #[cfg(not(feature = "redis"))]
        Backend::Redis => anyhow::bail!("built without the `redis` feature; set broker.backend = \"memory\""),
        Backend::Memory => {
            warn!("memory broker backend: the control plane is only reachable in-process");
            let memory = MemoryTransport::new();
            memory
                .answer_probes(&format!("{}.ping", cfg.outbound_namespace))
                .await
                .context("starting the in-process probe responder")?;
            Ok(Arc::new(memory))
        }
    }
}
