//! `newsdesk-monitor` -- headless collection-run monitor.
//!
//! Connects to the collection service event stream, keeps the job list
//! and collector status fresh (push + polling), and logs every observed
//! run transition until interrupted with Ctrl-C.
//!
//! # Environment variables
//!
//! | Variable               | Required | Default                 | Description                          |
//! |------------------------|----------|-------------------------|--------------------------------------|
//! | `NEWSDESK_API_URL`     | no       | `http://localhost:8000` | HTTP base URL of the service         |
//! | `NEWSDESK_WS_URL`      | no       | derived from API URL    | WebSocket base URL                   |
//! | `REQUEST_TIMEOUT_SECS` | no       | `30`                    | HTTP request timeout                 |
//! | `POLL_INTERVAL_MS`     | no       | `2000`                  | Status polling interval              |
//! | `RECONNECT_DELAY_SECS` | no       | `3`                     | Delay between reconnect attempts     |
//! | `JOB_LIST_LIMIT`       | no       | `20`                    | Runs fetched for the job list        |

use std::sync::Arc;

use anyhow::Context;
use newsdesk_core::job::RunnerStatus;
use newsdesk_core::job_events::MSG_TYPE_JOB_TRANSITION;
use newsdesk_events::{EventBus, Topic};
use newsdesk_sync::{HttpJobsRemote, JobController, JobsRemote, SyncConfig};
use newsdesk_transport::{ReconnectConfig, TransportChannel};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "newsdesk_monitor=info,newsdesk_sync=info,newsdesk_transport=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SyncConfig::from_env().context("invalid configuration")?;

    tracing::info!(
        api_url = %config.api_url,
        ws_url = %config.ws_url,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "Starting newsdesk-monitor",
    );

    let bus = Arc::new(EventBus::new());
    let channel = TransportChannel::new(config.ws_url.clone(), Arc::clone(&bus))
        .with_reconnect(ReconnectConfig::fixed(config.reconnect_delay));

    let remote: Arc<dyn JobsRemote> = Arc::new(
        HttpJobsRemote::new(config.api_url.clone(), config.request_timeout)
            .context("failed to build HTTP client")?,
    );
    let controller = Arc::new(JobController::new(remote, config));
    controller.bind(&bus);

    let transitions = bus.on(Topic::Custom(MSG_TYPE_JOB_TRANSITION.into()), |event| {
        tracing::info!(change = %event.payload, "Run changed");
        Ok(())
    });
    let transport_errors = bus.on(Topic::Error, |event| {
        tracing::warn!(detail = %event.payload, "Event stream error, relying on polling");
        Ok(())
    });

    let cancel = CancellationToken::new();
    let tracker = controller.spawn_transition_tracker(Arc::clone(&bus), cancel.clone());
    let _jobs = controller.watch_jobs();
    let mut status = controller.watch_status();

    channel.connect();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut last_status: Option<RunnerStatus> = None;
    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("failed to listen for Ctrl-C")?;
                tracing::info!("Shutdown requested");
                break;
            }
            alive = status.changed() => {
                if !alive {
                    break;
                }
                let snapshot = status.snapshot();
                if let Some(summary) = snapshot.data {
                    if last_status != Some(summary.status) {
                        tracing::info!(
                            status = ?summary.status,
                            message = ?summary.message,
                            can_start = controller.can_start(),
                            "Collector status",
                        );
                        last_status = Some(summary.status);
                    }
                }
                if let (false, Some(e)) = (snapshot.is_loading, &snapshot.error) {
                    tracing::warn!(error = %e, "Status refresh failed");
                }
            }
        }
    }

    cancel.cancel();
    if let Err(e) = tracker.await {
        tracing::warn!(error = %e, "Transition tracker ended abnormally");
    }
    controller.unbind();
    transitions.unsubscribe();
    transport_errors.unsubscribe();
    channel.disconnect();

    tracing::info!("newsdesk-monitor stopped");
    Ok(())
}
