//! Minimal demo binary: registers a couple of services and runs the engine
//! until ctrl-c, to exercise the supervisor end to end.

use std::time::Duration;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use warden_core::config::{AppConfig, EngineSection, ServicesSection, StatsSection};
use warden_core::{EngineConfig, EventValue, ServiceDefinition};
use warden_runtime::Engine;

fn demo_config() -> EngineConfig {
    EngineConfig {
        version: "1".into(),
        app: AppConfig {
            name: "warden-demo".into(),
            address: "warden://warden-demo/primary/app".into(),
            engine: EngineSection {
                throttle_ticks: Duration::from_secs(1),
                ..EngineSection::default()
            },
            stats: StatsSection {
                enabled: true,
                sample_interval: Duration::from_secs(10),
            },
            services: ServicesSection::default(),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();

    let engine = Engine::new(demo_config())?;

    let heartbeat = ServiceDefinition::builder("heartbeat", "heartbeat")
        .on_start(|_| {
            info!("heartbeat service starting");
            Ok(())
        })
        .on_tick(|session, now, elapsed| {
            info!(?now, ?elapsed, "heartbeat tick");
            session.dispatch(warden_core::Event::new(
                "heartbeat",
                "tick",
                EventValue::Int(now.timestamp()),
            ));
            Ok(())
        })
        .on_stop(|_, err| {
            let reason = err.map(|e| e.to_string());
            info!(?reason, "heartbeat service stopping");
            Ok(())
        })
        .build();

    let watchdog = ServiceDefinition::builder("watchdog", "watchdog")
        .on_event("heartbeat.tick", |_, event| {
            info!(value = %event.value(), "watchdog observed a heartbeat");
            Ok(())
        })
        .build();

    engine.register(heartbeat).await?;
    engine.register(watchdog).await?;
    engine.start().await?;

    let cancel = engine.cancellation_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            engine.request_shutdown();
        }
        _ = cancel.cancelled() => {}
    }

    engine.run_until_shutdown(Duration::from_secs(10)).await;

    Ok(())
}
