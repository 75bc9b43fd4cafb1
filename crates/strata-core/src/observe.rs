//! Optional metrics instrumentation for strata.
//!
//! When the `observe` feature is enabled, key operations emit counters,
//! histograms, and gauges via the [`metrics`] crate. A downstream
//! application must install a metrics recorder (e.g. `metrics-exporter-prometheus`)
//! to collect the data.
//!
//! When the feature is **not** enabled every function in this module is a
//! zero-cost no-op.

/// Record a pusher transaction.
///
/// - `strata.push.total` – counter with `projection` label
/// - `strata.push.statements_applied_total` – counter
/// - `strata.push.duration_seconds` – histogram
#[inline]
pub fn record_push(projection: &str, duration: std::time::Duration, applied: u64) {
    #[cfg(feature = "observe")]
    {
        let projection = projection.to_string();
        metrics::counter!("strata.push.total", "projection" => projection.clone()).increment(1);
        metrics::counter!("strata.push.statements_applied_total", "projection" => projection)
            .increment(applied);
        metrics::histogram!("strata.push.duration_seconds").record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (projection, duration, applied);
    }
}

/// Record a failed statement execution.
///
/// - `strata.statement.failures_total` – counter with `outcome` label
///   (`retry` / `skipped`)
#[inline]
pub fn record_statement_failure(projection: &str, skipped: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if skipped { "skipped" } else { "retry" };
        metrics::counter!(
            "strata.statement.failures_total",
            "projection" => projection.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (projection, skipped);
    }
}

/// Record a lease acquisition attempt or a lost lease.
///
/// - `strata.lease.total` – counter with `outcome` label
///   (`acquired` / `contended` / `lost`)
#[inline]
pub fn record_lease(projection: &str, outcome: &'static str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!(
            "strata.lease.total",
            "projection" => projection.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (projection, outcome);
    }
}

/// Record a scheduler tick (counter + duration + events processed).
///
/// - `strata.scheduler.ticks_total` – counter with `outcome` label
/// - `strata.scheduler.tick_duration_seconds` – histogram
/// - `strata.scheduler.events_processed_total` – counter
#[inline]
pub fn record_tick(duration: std::time::Duration, events_processed: u64, success: bool) {
    #[cfg(feature = "observe")]
    {
        let outcome = if success { "ok" } else { "fail" };
        metrics::counter!("strata.scheduler.ticks_total", "outcome" => outcome).increment(1);
        metrics::histogram!("strata.scheduler.tick_duration_seconds")
            .record(duration.as_secs_f64());
        metrics::counter!("strata.scheduler.events_processed_total").increment(events_processed);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = (duration, events_processed, success);
    }
}
