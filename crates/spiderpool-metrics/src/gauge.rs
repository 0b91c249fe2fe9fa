use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A gauge observed asynchronously: the hot path updates a protected
/// current-value cell, and a publisher periodically copies it to the pull
/// endpoint.
pub struct AsyncGauge {
    name: &'static str,
    value: RwLock<f64>,
}

impl AsyncGauge {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            value: RwLock::new(0.0),
        })
    }

    /// Update the value to report at the next publish tick
    pub fn record(&self, value: f64) {
        *self.value.write() = value;
    }

    pub fn observe(&self) -> f64 {
        *self.value.read()
    }

    fn publish(&self) {
        metrics::gauge!(self.name).set(self.observe());
    }
}

/// Publishes a fixed set of async gauges on an interval.
///
/// Registered once at startup; the gauge set is read-only afterwards.
pub struct GaugePublisher {
    gauges: Vec<Arc<AsyncGauge>>,
    interval: Duration,
}

impl GaugePublisher {
    pub fn new(gauges: Vec<Arc<AsyncGauge>>, interval: Duration) -> Self {
        Self { gauges, interval }
    }

    pub async fn run(self, token: CancellationToken) {
        let mut tick = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Gauge publisher shutting down");
                    return;
                }
                _ = tick.tick() => {
                    for gauge in &self.gauges {
                        gauge.publish();
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct DurationStats {
    count: u64,
    total: f64,
    max: f64,
    min: f64,
    latest: f64,
}

/// Tracks operation durations, feeding a histogram plus the
/// average/max/min/latest gauges.
pub struct DurationRecorder {
    histogram: &'static str,
    average: Arc<AsyncGauge>,
    max: Arc<AsyncGauge>,
    min: Arc<AsyncGauge>,
    latest: Arc<AsyncGauge>,
    stats: Mutex<DurationStats>,
}

impl DurationRecorder {
    pub fn new(
        histogram: &'static str,
        average: &'static str,
        max: &'static str,
        min: &'static str,
        latest: &'static str,
    ) -> Self {
        Self {
            histogram,
            average: AsyncGauge::new(average),
            max: AsyncGauge::new(max),
            min: AsyncGauge::new(min),
            latest: AsyncGauge::new(latest),
            stats: Mutex::new(DurationStats::default()),
        }
    }

    /// The gauges to hand to the [`GaugePublisher`]
    pub fn gauges(&self) -> Vec<Arc<AsyncGauge>> {
        vec![
            Arc::clone(&self.average),
            Arc::clone(&self.max),
            Arc::clone(&self.min),
            Arc::clone(&self.latest),
        ]
    }

    /// Record one operation duration
    pub fn observe(&self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        metrics::histogram!(self.histogram).record(seconds);

        let mut stats = self.stats.lock();
        stats.count += 1;
        stats.total += seconds;
        stats.latest = seconds;
        if seconds > stats.max {
            stats.max = seconds;
        }
        if stats.min == 0.0 || seconds < stats.min {
            stats.min = seconds;
        }

        self.average.record(stats.total / stats.count as f64);
        self.max.record(stats.max);
        self.min.record(stats.min);
        self.latest.record(seconds);
    }
}
