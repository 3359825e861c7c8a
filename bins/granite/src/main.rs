use std::sync::Arc;

use anyhow::Context;
use basalt_mmap::ShmNamespace;
use granite_config::GraniteConfig;
use granite_core::{
    ColumnarPublisher, DataManager, FundamentalsCache, IdleDataManager, MarketState,
    PublishingListener, SnapshotPublisher,
};
use granite_server::{ArbitrationListener, Server, ServerSettings, Services};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const CONFIG_ENV: &str = "GRANITE_CONFIG";

fn load_config() -> anyhow::Result<GraniteConfig> {
    let path = std::env::args().nth(1).or_else(|| std::env::var(CONFIG_ENV).ok());
    match path {
        Some(path) => GraniteConfig::load(path.as_str()).with_context(|| format!("loading {path}")),
        None => Ok(GraniteConfig::default()),
    }
}

fn main() -> anyhow::Result<()> {
    let cfg = load_config()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    install_panic_hook();

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    rt.block_on(async {
        let cancel = CancellationToken::new();
        let shutdown = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("received Ctrl+C, shutting down"),
                Err(e) => tracing::error!(error = %e, "signal handler failed, shutting down"),
            }
            shutdown.cancel();
        });
        run(cfg, cancel).await
    })
}

/// Route panic reports through tracing instead of bare stderr.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic".to_string());
        match info.location() {
            Some(loc) => tracing::error!(payload = %message, file = loc.file(), line = loc.line(), "panic"),
            None => tracing::error!(payload = %message, "panic"),
        }
    }));
}

/// Serve until `cancel` fires. Every shared-memory region created here is
/// unlinked before this returns.
async fn run(cfg: GraniteConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    let ns = ShmNamespace::new(&cfg.shm_dir);
    let state = Arc::new(MarketState::new());
    let fundamentals = Arc::new(FundamentalsCache::from_config(&cfg.fundamentals));
    let manager: Arc<dyn DataManager> = Arc::new(IdleDataManager::new());

    let snapshot = SnapshotPublisher::create(ns.clone(), &cfg.snapshot, Arc::clone(&state))
        .context("creating snapshot region")?
        .with_fundamentals(Arc::clone(&fundamentals));
    let mut publishing = PublishingListener::new(&manager).with_snapshot(Arc::new(snapshot));

    if cfg.columnar.enabled {
        let columnar = ColumnarPublisher::from_config(&ns, &cfg.columnar, Arc::clone(&state))
            .context("creating columnar region")?;
        tracing::info!(region = %columnar.region_name(), "columnar publishing enabled");
        publishing = publishing.with_columnar(Arc::new(columnar));
    }
    manager.register_listener(Arc::new(publishing));

    let services = Services {
        state,
        manager: Arc::clone(&manager),
        fundamentals,
        fundamentals_source: None,
    };
    let server = Server::bind(&cfg.bind_addr(), services, ServerSettings::from(&cfg.server)).await?;
    manager.register_listener(Arc::new(ArbitrationListener::new(server.handle())));

    let agent = Arc::clone(&manager);
    let agent = tokio::task::spawn_blocking(move || agent.start_downloader_agent());

    server.run(cancel).await?;
    if let Err(e) = agent.await {
        tracing::warn!(error = %e, "downloader agent task failed");
    }
    // The manager owns the listeners and through them the publishers; they
    // unlink their regions once the last offloaded call lets go of it.
    drop(manager);
    tracing::info!("granite stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn regions_are_unlinked_after_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let ns = ShmNamespace::new(dir.path());
        let cfg = GraniteConfig::parse(&format!(
            r#"
            shm_dir = "{}"

            [server]
            port = 0

            [columnar]
            enabled = true
            tickers = [{{ ticker = "AAPL", capacity = 16 }}]
            "#,
            dir.path().display()
        ))
        .unwrap();
        let snapshot = cfg.snapshot.region_name.clone();
        let columnar = cfg.columnar.region_name.clone();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(cfg, cancel.clone()));
        wait_until("regions created", || ns.exists(&snapshot) && ns.exists(&columnar)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("granite did not stop")
            .unwrap()
            .unwrap();

        assert!(!ns.exists(&snapshot), "snapshot region left behind");
        assert!(!ns.exists(&columnar), "columnar region left behind");
    }
}
