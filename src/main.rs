//  ██████╗ ██████╗ ██╗██████╗ ██╗██████╗  ██████╗ ███╗   ██╗
// ██╔════╝ ██╔══██╗██║██╔══██╗██║██╔══██╗██╔═══██╗████╗  ██║
// ██║  ███╗██████╔╝██║██║  ██║██║██████╔╝██║   ██║██╔██╗ ██║
// ██║   ██║██╔══██╗██║██║  ██║██║██╔══██╗██║   ██║██║╚██╗██║
// ╚██████╔╝██║  ██║██║██████╔╝██║██║  ██║╚██████╔╝██║ ╚████║
//  ╚═════╝ ╚═╝  ╚═╝╚═╝╚═════╝ ╚═╝╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═══╝
//
// G A T E W A Y
//
// Stands between the playoff fantasy platform and every flaky stats feed it
// depends on. When the provider melts down at 4:25pm on a Sunday, the
// leaderboard keeps rendering.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use gridiron_gateway::alerts::{AlertPublisher, AlertSink};
use gridiron_gateway::clock::{SharedClock, SystemClock};
use gridiron_gateway::config::GatewayConfig;
use gridiron_gateway::gateway::Gateway;
use gridiron_gateway::health::HealthProber;
use gridiron_gateway::metrics;
use gridiron_gateway::rate_limiter::store::{RedisTokenStore, TokenStore};
use gridiron_gateway::transport::{ReqwestTransport, Transport};

fn print_banner() {
    let banner = r#"

    ╔══════════════════════════════════════════════════════════════════╗
    ║                                                                  ║
    ║          🏈  G R I D I R O N   G A T E W A Y  🏈                 ║
    ║                                                                  ║
    ║   Breakers:   per endpoint, one trial at a time                  ║
    ║   Limiter:    token buckets, shared through Redis if asked       ║
    ║   Retries:    exponential backoff with jitter                    ║
    ║   Fallback:   secondary -> cache -> stale cache (labeled)        ║
    ║   Probes:     we find the outage before the users do             ║
    ║                                                                  ║
    ║   "The stats feed is down. The leaderboard is not."              ║
    ║                                                                  ║
    ╚══════════════════════════════════════════════════════════════════╝

    "#;
    println!("{}", banner);
}

#[tokio::main(flavor = "multi_thread", worker_threads = 8)]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(true)
        .init();

    print_banner();

    info!("🏈 GRIDIRON GATEWAY initializing...");

    let config = GatewayConfig::from_env();
    config.validate()?;
    info!(
        endpoints = config.endpoints.len(),
        tier = ?config.rate_limit.tier,
        distributed = config.rate_limit.distributed,
        "✅ Configuration loaded"
    );

    let clock: SharedClock = Arc::new(SystemClock);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Alerts: lock-free channel from the hot path to the Redis publisher
    let (alerts, alert_rx) = AlertSink::channel(1_000);
    let (publisher, publisher_stats) = AlertPublisher::new(
        config.redis_url.clone(),
        config.redis_alert_channel.clone(),
        config.redis_alert_history.clone(),
        alert_rx,
        shutdown_rx.clone(),
    );
    let publisher_handle = tokio::spawn(async move {
        info!("📤 Alert publisher: ONLINE");
        if let Err(e) = publisher.run().await {
            error!("📤 Alert publisher error: {}", e);
        }
        info!("📤 Alert publisher: OFFLINE");
    });

    // Shared token counter, only when running more than one instance
    let store: Option<Arc<dyn TokenStore>> = if config.rate_limit.distributed {
        match RedisTokenStore::new(&config.redis_url, config.rate_limit.store_timeout) {
            Ok(store) => {
                info!(
                    instances = config.rate_limit.instance_count,
                    "✅ Distributed rate limiting via Redis"
                );
                Some(Arc::new(store))
            }
            Err(e) => {
                warn!(error = %e, "Redis token store unavailable, limiting locally");
                None
            }
        }
    } else {
        None
    };

    let transport: Arc<dyn Transport> =
        Arc::new(ReqwestTransport::new(&config.user_agent, config.api_key.clone())?);
    let gateway = Arc::new(Gateway::new(
        &config,
        transport.clone(),
        clock.clone(),
        alerts.clone(),
        store,
    ));

    // ═══════════════════════════════════════════
    // HEALTH PROBERS, one per endpoint
    // ═══════════════════════════════════════════
    let prober = Arc::new(HealthProber::new(
        gateway.registry().clone(),
        transport,
        config.health.clone(),
        clock,
        alerts,
    ));
    let probe_handles = prober.spawn_all(shutdown_rx.clone());

    // ═══════════════════════════════════════════
    // METRICS HTTP SERVER
    // ═══════════════════════════════════════════
    let metrics_gateway = gateway.clone();
    let metrics_port = config.metrics_port;
    let mut metrics_shutdown = shutdown_rx.clone();
    let metrics_handle = tokio::spawn(async move {
        metrics::run_metrics_server(
            metrics_gateway,
            Some(publisher_stats),
            metrics_port,
            &mut metrics_shutdown,
        )
        .await;
        info!("📊 Metrics server: OFFLINE");
    });

    // ═══════════════════════════════════════════
    // CACHE WARM-UP
    // ═══════════════════════════════════════════
    if !config.warm_keys.is_empty() {
        let warm_gateway = gateway.clone();
        let warm_keys = config.warm_keys.clone();
        tokio::spawn(async move {
            for (endpoint, key) in warm_keys {
                if let Err(e) = warm_gateway.warm(&endpoint, [key]).await {
                    warn!(endpoint = %endpoint, error = %e, "Warm-up skipped");
                }
            }
        });
    }

    info!("═══════════════════════════════════════════════════════");
    info!("  🟢 GRIDIRON GATEWAY ACTIVE");
    info!("  🏟️  {} endpoints under guard", gateway.registry().len());
    info!("  📤 Alerts to Redis channel {}", config.redis_alert_channel);
    info!("  📊 Metrics at http://0.0.0.0:{}/", config.metrics_port);
    info!("  ⚡ Press Ctrl+C for graceful shutdown");
    info!("═══════════════════════════════════════════════════════");

    match signal::ctrl_c().await {
        Ok(()) => {
            warn!("🛑 Shutdown signal received!");
        }
        Err(err) => {
            error!("❌ Signal listener error: {}", err);
        }
    }
    let _ = shutdown_tx.send(true);

    info!("⏳ Waiting for tasks to complete (timeout: 10s)...");
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        futures::future::join_all(probe_handles).await;
        let _ = tokio::join!(publisher_handle, metrics_handle);
    })
    .await;

    info!("🏁 GRIDIRON GATEWAY: OFFLINE");
    Ok(())
}
