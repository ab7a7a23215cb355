//! Latency health evaluation of the API client pool

use super::info::ClientInfo;
use super::pool::ApiClientPool;
use crate::config::WorkerConfig;
use crate::shutdown::Shutdown;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Round to millisecond precision
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; zero for an empty set
pub fn population_std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = mean(values);
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    round3(variance.sqrt())
}

/// Refresh every handle's mean and stale flag; returns the pool-wide mean
/// and the per-handle means that took part in it
///
/// Samples younger than `window` are averaged. A handle whose samples are
/// all older is marked grown and averaged over everything it has; a handle
/// without samples keeps its last mean (and is marked grown) if it has one.
pub fn average_request_durations(
    infos: &mut HashMap<String, ClientInfo>,
    now: DateTime<Utc>,
    window: Duration,
) -> (f64, Vec<f64>) {
    let cutoff = TimeDelta::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut durations = Vec::with_capacity(infos.len());

    for info in infos.values_mut() {
        if info.samples.is_empty() {
            if info.avg_duration > 0.0 {
                info.grown = true;
                durations.push(info.avg_duration);
            }
            continue;
        }

        let recent: Vec<f64> = info
            .samples
            .iter()
            .filter(|(at, _)| *at > cutoff)
            .map(|(_, duration)| *duration)
            .collect();
        if recent.is_empty() {
            let all: Vec<f64> = info.samples.iter().map(|(_, d)| *d).collect();
            info.avg_duration = round3(mean(&all));
            info.grown = true;
        } else {
            info.avg_duration = round3(mean(&recent));
            info.grown = false;
        }
        durations.push(info.avg_duration);
    }

    (round3(mean(&durations)), durations)
}

/// Step sizes and threshold of the marking policy, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MonitorPolicy {
    pub inc_step: f64,
    pub dec_step: f64,
    pub drop_threshold: f64,
}

impl From<&WorkerConfig> for MonitorPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            inc_step: config.client_inc_step_timeout,
            dec_step: config.client_dec_step_timeout,
            drop_threshold: config.drop_threshold_client_cookies,
        }
    }
}

/// Outcome of one evaluation period
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub mean: f64,
    pub std_dev: f64,
    pub grown: usize,
    pub slowed: Vec<String>,
    pub sped_up: Vec<String>,
    pub rotated: Vec<String>,
}

/// Apply the marking policy to every handle that took part in the means,
/// then clear all sample windows
pub fn mark_bad_clients(
    infos: &mut HashMap<String, ClientInfo>,
    mean: f64,
    std_dev: f64,
    policy: &MonitorPolicy,
) -> PerformanceReport {
    let dev = round3(mean + std_dev);
    let mut report = PerformanceReport {
        mean,
        std_dev,
        ..PerformanceReport::default()
    };

    for (id, info) in infos.iter_mut() {
        if info.avg_duration <= 0.0 && info.samples.is_empty() {
            continue;
        }

        if info.request_interval >= policy.drop_threshold
            || (info.grown && info.avg_duration > dev)
        {
            info.mark_for_rotation();
            report.rotated.push(id.clone());
        } else if info.avg_duration > dev {
            info.request_interval = round3(info.request_interval + policy.inc_step);
            report.slowed.push(id.clone());
        } else if info.avg_duration < mean && info.request_interval > 0.0 {
            info.request_interval = round3((info.request_interval - policy.dec_step).max(0.0));
            report.sped_up.push(id.clone());
        }

        if info.grown {
            report.grown += 1;
        }
    }

    for info in infos.values_mut() {
        info.samples.clear();
    }
    report
}

/// Periodic health evaluation of the client pool
pub struct PerformanceMonitor {
    pool: Arc<ApiClientPool>,
    window: Duration,
    policy: MonitorPolicy,
}

impl PerformanceMonitor {
    pub fn new(pool: Arc<ApiClientPool>, window: Duration, policy: MonitorPolicy) -> Self {
        Self {
            pool,
            window,
            policy,
        }
    }

    /// Evaluate the samples collected up to `now`
    pub fn evaluate(&self, now: DateTime<Utc>) -> PerformanceReport {
        self.pool.with_client_infos(|infos| {
            let (mean, durations) = average_request_durations(infos, now, self.window);
            let std_dev = population_std_dev(&durations);
            mark_bad_clients(infos, mean, std_dev, &self.policy)
        })
    }

    pub async fn run(&self, shutdown: Shutdown) {
        info!(window_secs = self.window.as_secs_f64(), "Performance watcher started");
        while shutdown.sleep(self.window).await {
            let report = self.evaluate(Utc::now());
            for id in &report.rotated {
                info!(message_id = "marked_as_bad", client_id = %id, "API client marked for session rotation");
            }
            debug!(
                mean = report.mean,
                std_dev = report.std_dev,
                grown = report.grown,
                slowed = report.slowed.len(),
                sped_up = report.sped_up.len(),
                rotated = report.rotated.len(),
                "Performance watcher tick"
            );
        }
        info!("Performance watcher stopped");
    }
}
