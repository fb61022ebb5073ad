//! Logging and metrics setup.
//!
//! Metrics go through the `metrics` facade; without an installed recorder
//! every macro call is a no-op. The binary installs the Prometheus exporter
//! when `--metrics-addr` is given.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Metric names
// ---------------------------------------------------------------------------

pub const REQUESTS_PUBLISHED: &str = "mqrpc_requests_published_total";
pub const REPLIES_RESOLVED: &str = "mqrpc_replies_resolved_total";
/// Labelled by `reason`: `unmatched`, `missing_correlation_id`.
pub const REPLIES_DISCARDED: &str = "mqrpc_replies_discarded_total";
pub const REQUESTS_TIMED_OUT: &str = "mqrpc_requests_timed_out_total";
/// Labelled by `role` and `reason`.
pub const MALFORMED_MESSAGES: &str = "mqrpc_malformed_messages_total";
/// Labelled by `operation` and `outcome`.
pub const OPERATIONS: &str = "mqrpc_operations_total";
/// Labelled by `reason`: `overloaded`, `timeout`, `internal`.
pub const OPERATIONS_FAILED: &str = "mqrpc_operations_failed_total";
pub const OPERATION_DURATION: &str = "mqrpc_operation_duration_seconds";

/// Registers descriptions with the installed recorder.
pub fn describe_metrics() {
    metrics::describe_counter!(REQUESTS_PUBLISHED, "Requests published by the client");
    metrics::describe_counter!(REPLIES_RESOLVED, "Replies matched to a waiting caller");
    metrics::describe_counter!(REPLIES_DISCARDED, "Replies with no waiting caller");
    metrics::describe_counter!(REQUESTS_TIMED_OUT, "Requests failed by the reaper");
    metrics::describe_counter!(MALFORMED_MESSAGES, "Messages that could not be decoded");
    metrics::describe_counter!(OPERATIONS, "Operations run by the server");
    metrics::describe_counter!(OPERATIONS_FAILED, "Operations rejected or failed in the pipeline");
    metrics::describe_histogram!(
        OPERATION_DURATION,
        metrics::Unit::Seconds,
        "Handler execution time"
    );
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Installs the global subscriber. The filter comes from `RUST_LOG` and
/// defaults to `info`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), TryInitError> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .try_init(),
    }
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
///
/// Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if a recorder is already installed or the listener
/// cannot be bound.
pub fn install_prometheus(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed() {
        for name in [
            REQUESTS_PUBLISHED,
            REPLIES_RESOLVED,
            REPLIES_DISCARDED,
            REQUESTS_TIMED_OUT,
            MALFORMED_MESSAGES,
            OPERATIONS,
            OPERATIONS_FAILED,
            OPERATION_DURATION,
        ] {
            assert!(name.starts_with("mqrpc_"), "{name}");
        }
    }

    #[test]
    fn describing_without_recorder_is_noop() {
        describe_metrics();
    }

    #[test]
    fn default_log_format_is_pretty() {
        assert_eq!(LogFormat::default(), LogFormat::Pretty);
    }
}
