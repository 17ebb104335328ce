use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerPhase {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub scheduler_phase: SchedulerPhase,
    pub ticks_completed: u64,
    pub ticks_skipped: u64,
    pub readings_generated: u64,
    pub persistence_failures: u64,
    pub anomalies_detected: u64,
    pub decisions_applied: u64,
    pub decisions_failed: u64,
    pub decisions_rejected: u64,
    pub decisions_in_flight: usize,
    pub subscribers: usize,
    pub memory_usage_mb: f32,
}

#[derive(Default)]
struct Counters {
    ticks_completed: AtomicU64,
    ticks_skipped: AtomicU64,
    readings_generated: AtomicU64,
    persistence_failures: AtomicU64,
    anomalies_detected: AtomicU64,
    decisions_applied: AtomicU64,
    decisions_failed: AtomicU64,
    decisions_rejected: AtomicU64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    in_flight: Arc<AtomicUsize>,
    phase: Arc<parking_lot::Mutex<SchedulerPhase>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            phase: Arc::new(parking_lot::Mutex::new(SchedulerPhase::Idle)),
        }
    }

    pub fn set_phase(&self, phase: SchedulerPhase) {
        *self.phase.lock() = phase;
    }

    pub fn phase(&self) -> SchedulerPhase {
        *self.phase.lock()
    }

    pub fn record_tick(&self, readings: usize, anomalies: usize) {
        self.counters.ticks_completed.fetch_add(1, Ordering::Relaxed);
        self.counters.readings_generated.fetch_add(readings as u64, Ordering::Relaxed);
        self.counters.anomalies_detected.fetch_add(anomalies as u64, Ordering::Relaxed);
    }

    pub fn record_skipped(&self, fires: u64) {
        self.counters.ticks_skipped.fetch_add(fires, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.counters.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_applied(&self) {
        self.counters.decisions_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_failed(&self) {
        self.counters.decisions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decision_rejected(&self) {
        self.counters.decisions_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Compteur partagé des décisions en file ou en cours
    pub fn decisions_in_flight(&self) -> Arc<AtomicUsize> {
        self.in_flight.clone()
    }

    pub fn ticks_completed(&self) -> u64 {
        self.counters.ticks_completed.load(Ordering::Relaxed)
    }

    pub fn ticks_skipped(&self) -> u64 {
        self.counters.ticks_skipped.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, subscribers: usize) -> KernelHealth {
        let c = &self.counters;
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            scheduler_phase: self.phase(),
            ticks_completed: c.ticks_completed.load(Ordering::Relaxed),
            ticks_skipped: c.ticks_skipped.load(Ordering::Relaxed),
            readings_generated: c.readings_generated.load(Ordering::Relaxed),
            persistence_failures: c.persistence_failures.load(Ordering::Relaxed),
            anomalies_detected: c.anomalies_detected.load(Ordering::Relaxed),
            decisions_applied: c.decisions_applied.load(Ordering::Relaxed),
            decisions_failed: c.decisions_failed.load(Ordering::Relaxed),
            decisions_rejected: c.decisions_rejected.load(Ordering::Relaxed),
            decisions_in_flight: self.in_flight.load(Ordering::Relaxed),
            subscribers,
            memory_usage_mb: get_memory_usage_mb(),
        }
    }

    /// Log périodique de l'état du kernel
    pub fn spawn_health_reporter(&self, hub: Arc<crate::hub::BroadcastHub>, every: Duration) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let health = tracker.get_health(hub.len());
                info!(
                    uptime = health.uptime_seconds,
                    ticks = health.ticks_completed,
                    skipped = health.ticks_skipped,
                    anomalies = health.anomalies_detected,
                    applied = health.decisions_applied,
                    failed = health.decisions_failed,
                    in_flight = health.decisions_in_flight,
                    subscribers = health.subscribers,
                    "kernel health"
                );
            }
        })
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
