//! Periodic crawl scheduling
//!
//! One ticker drives both phases: each tick extracts the last interval's
//! window, then transforms a window shifted back so extraction has already
//! landed the rows the correlator reads. Windows are validated at the
//! trigger boundary; a malformed window never enters the workflow tree.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::extract::extract_tenants;
use crate::models::TimePeriod;
use crate::store::ControlDb;
use crate::transform::transform_tenants;
use crate::workflow::Dispatcher;
use tracing::{error, info};

/// Window for the extraction phase of a tick firing now
pub fn extract_period(config: &Config) -> Result<TimePeriod> {
    let window = TimePeriod::last(config.extract_window());
    TimePeriod::new(window.from, window.to)
}

/// Window for the transform phase of the same tick, trailing the given
/// extraction window so both phases share one trigger instant
pub fn transform_period(config: &Config, extract: &TimePeriod) -> Result<TimePeriod> {
    let window = extract.offset_back(config.transform_offset());
    TimePeriod::new(window.from, window.to)
}

/// One full scheduler tick: extract, then transform
pub async fn run_cycle(
    config: &Config,
    control: &ControlDb,
    dispatcher: &Dispatcher,
    tenant_filter: Option<&str>,
) -> Result<()> {
    let extract_window = extract_period(config)?;
    let summary = extract_tenants(config, control, dispatcher, tenant_filter, extract_window).await?;
    info!(
        tenants = summary.tenants,
        repositories = summary.repositories,
        merge_requests = summary.merge_requests,
        failures = summary.failures,
        "Extraction cycle complete"
    );

    let transform_window = transform_period(config, &extract_window)?;
    let summary =
        transform_tenants(config, control, dispatcher, tenant_filter, transform_window).await?;
    info!(
        tenants = summary.tenants,
        repositories = summary.repositories,
        metrics = summary.metrics,
        failures = summary.failures,
        "Transform cycle complete"
    );
    Ok(())
}

/// Run the scheduler until the process is stopped. Each tick gets a fresh
/// dispatcher; idempotency across ticks comes from the window-derived
/// workflow ids colliding at the storage layer, not from process memory.
pub async fn run(config: &Config, control: &ControlDb, tenant_filter: Option<&str>) -> Result<()> {
    let interval = config
        .extract_window()
        .to_std()
        .map_err(|_| Error::Config("schedule.extract_interval_mins must be positive".into()))?;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!(
        interval_secs = interval.as_secs(),
        "Scheduler started"
    );
    loop {
        ticker.tick().await;
        let dispatcher = Dispatcher::new();
        if let Err(e) = run_cycle(config, control, &dispatcher, tenant_filter).await {
            // A failed cycle must not kill the scheduler
            error!("Crawl cycle failed: {}", e);
        }
    }
}
