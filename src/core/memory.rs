//! Memory backpressure for the import pipeline.
//!
//! Pressure is `used / ceiling`, clamped to `0..=1`. Chunk sizes shrink linearly
//! between 40% and 80% pressure down to a quarter of the base size, and at the
//! high-pressure threshold the importer pauses until usage drops or the maximum
//! wait runs out.
//!
//! There is no collector to force here: allocations are released when chunk
//! buffers drop, so a pause is a sleep followed by a fresh sample.

use crate::{
    config::settings::MemorySettings,
    core::metrics::Metrics,
    errors::{Error, Result},
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior, interval, sleep};
use tracing::{debug, info, warn};

/// Pressure below which chunks run at full size
pub const SCALE_START: f64 = 0.4;
/// Pressure at and above which chunks run at the minimum fraction
pub const SCALE_FLOOR_AT: f64 = 0.8;
/// Smallest fraction of the base chunk size
pub const MIN_CHUNK_FRACTION: f64 = 0.25;

/// Source of memory usage readings.
pub trait MemorySampler: Send + Sync {
    /// Bytes currently in use, or `None` when unavailable
    fn used_bytes(&self) -> Option<u64>;
}

/// Reads the resident memory of the current process.
pub struct ProcessMemorySampler {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessMemorySampler {
    /// Creates a sampler for this process
    #[must_use]
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid()
            .map_err(|e| warn!(error = e, "Current pid unavailable, memory sampling disabled"))
            .ok();
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for ProcessMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for ProcessMemorySampler {
    fn used_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(sysinfo::Process::memory)
    }
}

/// Chunk-size multiplier for a pressure ratio.
#[must_use]
pub fn scale_factor(pressure: f64) -> f64 {
    if pressure < SCALE_START {
        1.0
    } else if pressure >= SCALE_FLOOR_AT {
        MIN_CHUNK_FRACTION
    } else {
        let progress = (pressure - SCALE_START) / (SCALE_FLOOR_AT - SCALE_START);
        (1.0 - MIN_CHUNK_FRACTION).mul_add(-progress, 1.0)
    }
}

/// Tracks memory pressure and applies backpressure to importers.
pub struct MemoryMonitor {
    sampler: Arc<dyn MemorySampler>,
    settings: MemorySettings,
    metrics: Arc<Metrics>,
    last_pressure: AtomicU64,
}

impl MemoryMonitor {
    /// Creates a monitor reading from `sampler`
    #[must_use]
    pub fn new(sampler: Arc<dyn MemorySampler>, settings: MemorySettings, metrics: Arc<Metrics>) -> Self {
        Self {
            sampler,
            settings,
            metrics,
            last_pressure: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Monitor over this process's memory
    #[must_use]
    pub fn for_process(settings: MemorySettings, metrics: Arc<Metrics>) -> Self {
        Self::new(Arc::new(ProcessMemorySampler::new()), settings, metrics)
    }

    /// Takes a fresh sample and returns the pressure. Keeps the previous value
    /// when the sampler has no reading.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&self) -> f64 {
        let Some(used) = self.sampler.used_bytes() else {
            return self.pressure();
        };
        let ceiling = self.settings.ceiling_bytes.max(1) as f64;
        let pressure = (used as f64 / ceiling).clamp(0.0, 1.0);
        self.last_pressure.store(pressure.to_bits(), Ordering::Relaxed);
        pressure
    }

    /// Most recently sampled pressure
    #[must_use]
    pub fn pressure(&self) -> f64 {
        f64::from_bits(self.last_pressure.load(Ordering::Relaxed))
    }

    /// Chunk size to use for `base` rows at the current pressure; never below one.
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn scaled_chunk_size(&self, base: usize) -> usize {
        let factor = scale_factor(self.sample());
        ((base as f64 * factor).floor() as usize).max(1)
    }

    /// Returns once pressure is below the high-pressure threshold.
    ///
    /// # Errors
    /// `MemoryPressure` when pressure stays high for longer than the configured
    /// maximum wait.
    pub async fn wait_for_capacity(&self) -> Result<()> {
        let threshold = self.settings.high_pressure;
        let mut pressure = self.sample();
        if pressure < threshold {
            return Ok(());
        }

        self.metrics.add_memory_pauses(1);
        warn!(pressure, threshold, "Memory pressure high, pausing import");
        let started = Instant::now();
        let max_wait = Duration::from_secs(self.settings.max_wait_secs);
        let poll = Duration::from_millis(self.settings.pause_poll_ms.max(1));

        loop {
            if started.elapsed() >= max_wait {
                return Err(Error::MemoryPressure {
                    pressure,
                    threshold,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            sleep(poll).await;
            pressure = self.sample();
            if pressure < threshold {
                info!(pressure, waited_ms = started.elapsed().as_millis(), "Memory pressure relieved, resuming");
                return Ok(());
            }
        }
    }

    /// Samples on the configured interval until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(Duration::from_millis(self.settings.sample_interval_ms.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            ceiling = self.settings.ceiling_bytes,
            interval_ms = self.settings.sample_interval_ms,
            "Memory monitor started"
        );

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let pressure = self.sample();
                    debug!(pressure, "Memory sampled");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Memory monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::float_cmp)]
    use super::*;
    use crate::test_utils::StaticSampler;

    fn settings(max_wait_secs: u64) -> MemorySettings {
        MemorySettings {
            ceiling_bytes: 1000,
            sample_interval_ms: 10,
            high_pressure: 0.9,
            max_wait_secs,
            pause_poll_ms: 10,
        }
    }

    fn monitor(used: u64, max_wait_secs: u64) -> (Arc<StaticSampler>, MemoryMonitor) {
        let sampler = Arc::new(StaticSampler::new(used));
        let monitor = MemoryMonitor::new(
            Arc::clone(&sampler) as Arc<dyn MemorySampler>,
            settings(max_wait_secs),
            Arc::new(Metrics::new()),
        );
        (sampler, monitor)
    }

    #[test]
    fn test_scale_ladder() {
        assert_eq!(scale_factor(0.0), 1.0);
        assert_eq!(scale_factor(0.39), 1.0);
        assert!((scale_factor(0.6) - 0.625).abs() < 1e-9);
        assert_eq!(scale_factor(0.8), 0.25);
        assert_eq!(scale_factor(0.95), 0.25);
        assert!(scale_factor(0.5) > scale_factor(0.7));
    }

    #[test]
    fn test_scaled_chunk_size() {
        let (sampler, monitor) = monitor(100, 1);
        assert_eq!(monitor.scaled_chunk_size(1000), 1000);
        sampler.set(600);
        assert_eq!(monitor.scaled_chunk_size(1000), 625);
        sampler.set(850);
        assert_eq!(monitor.scaled_chunk_size(1000), 250);
        assert_eq!(monitor.scaled_chunk_size(2), 1);
        assert_eq!(monitor.pressure(), 0.85);
    }

    #[test]
    fn test_missing_reading_keeps_last_pressure() {
        let (sampler, monitor) = monitor(500, 1);
        assert_eq!(monitor.sample(), 0.5);
        sampler.clear();
        assert_eq!(monitor.sample(), 0.5);
    }

    #[tokio::test]
    async fn test_wait_passes_under_threshold() {
        let (_, monitor) = monitor(100, 1);
        monitor.wait_for_capacity().await.unwrap();
        assert_eq!(monitor.metrics.snapshot().memory_pauses, 0);
    }

    #[tokio::test]
    async fn test_wait_resumes_when_pressure_drops() {
        let (sampler, monitor) = monitor(950, 5);
        let release = {
            let sampler = Arc::clone(&sampler);
            tokio::spawn(async move {
                sleep(Duration::from_millis(50)).await;
                sampler.set(300);
            })
        };
        monitor.wait_for_capacity().await.unwrap();
        release.await.unwrap();
        assert_eq!(monitor.metrics.snapshot().memory_pauses, 1);
    }

    #[tokio::test]
    async fn test_wait_fails_after_max_wait() {
        let (_, monitor) = monitor(990, 1);
        let result = monitor.wait_for_capacity().await;
        assert!(matches!(result, Err(Error::MemoryPressure { waited_secs: 1, .. })));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_, monitor) = monitor(400, 1);
        let monitor = Arc::new(monitor);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&monitor).run(rx));
        sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(monitor.pressure(), 0.4);
    }

    #[test]
    fn test_process_sampler_reads_something() {
        let sampler = ProcessMemorySampler::new();
        assert!(sampler.used_bytes().is_some_and(|b| b > 0));
    }
}
