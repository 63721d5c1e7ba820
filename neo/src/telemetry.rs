use crate::config::{CommonConfig, LoggingConfig, MetricsConfig};
use metrics_exporter_statsd::StatsdBuilder;
use shared::metrics_defs::describe_all;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(thiserror::Error, Debug)]
pub enum TelemetryError {
    #[error("invalid sentry dsn: {0}")]
    SentryDsn(#[from] sentry::types::ParseDsnError),
    #[error("could not install log subscriber: {0}")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
    #[error("could not build statsd exporter: {0}")]
    Statsd(String),
    #[error("a global metrics recorder is already installed")]
    RecorderInstalled,
}

/// Sets up error reporting, logging and metrics, in that order.
///
/// The returned guard flushes pending Sentry events on drop and must live
/// until the process exits.
pub fn init(config: &CommonConfig) -> Result<Option<sentry::ClientInitGuard>, TelemetryError> {
    let guard = init_sentry(&config.logging)?;
    init_logging(&config.logging, guard.is_some())?;
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }
    Ok(guard)
}

fn init_sentry(config: &LoggingConfig) -> Result<Option<sentry::ClientInitGuard>, TelemetryError> {
    let Some(dsn) = config.sentry_dsn.as_deref() else {
        return Ok(None);
    };

    let guard = sentry::init(sentry::ClientOptions {
        dsn: Some(dsn.parse()?),
        release: sentry::release_name!(),
        ..Default::default()
    });
    Ok(Some(guard))
}

fn init_logging(config: &LoggingConfig, with_sentry: bool) -> Result<(), TelemetryError> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));
    let sentry_layer = if with_sentry {
        Some(sentry::integrations::tracing::layer())
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .try_init()?;
    Ok(())
}

fn init_metrics(config: &MetricsConfig) -> Result<(), TelemetryError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))
        .map_err(|e| TelemetryError::Statsd(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|_| TelemetryError::RecorderInstalled)?;

    describe_all(neo_count::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "Sending metrics to statsd"
    );
    Ok(())
}
