use std::time::Duration;

/// Smoothing window for the rate average, in seconds.
const INVERSE_GAIN: f64 = 5.0;

/// An exponentially weighted moving average of a byte rate.
///
/// Bytes are accumulated as they transfer; [`RateEstimator::tick`] folds the
/// accumulator into the average once per second and tracks the peak.
#[derive(Debug, Clone, Default)]
pub struct RateEstimator {
    rate: f64,
    peak: u64,
    total: u64,
    accumulator: u64,
}

impl RateEstimator {
    pub fn add(&mut self, bytes: usize) {
        self.accumulator += bytes as u64;
        self.total += bytes as u64;
    }

    pub fn tick(&mut self, interval: Duration) {
        let secs = interval.as_secs_f64();
        if secs <= 0.0 {
            return;
        }
        let sample = self.accumulator as f64 / secs;
        self.accumulator = 0;
        self.rate += (sample - self.rate) / INVERSE_GAIN;
        if self.rate as u64 > self.peak {
            self.peak = self.rate as u64;
        }
    }

    /// Current smoothed rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }

    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Per-peer transfer statistics: payload and protocol overhead, both
/// directions.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    pub download_payload: RateEstimator,
    pub upload_payload: RateEstimator,
    pub download_protocol: RateEstimator,
    pub upload_protocol: RateEstimator,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received_bytes(&mut self, payload: usize, protocol: usize) {
        self.download_payload.add(payload);
        self.download_protocol.add(protocol);
    }

    pub fn sent_bytes(&mut self, payload: usize, protocol: usize) {
        self.upload_payload.add(payload);
        self.upload_protocol.add(protocol);
    }

    pub fn tick(&mut self, interval: Duration) {
        self.download_payload.tick(interval);
        self.upload_payload.tick(interval);
        self.download_protocol.tick(interval);
        self.upload_protocol.tick(interval);
    }

    pub fn download_rate(&self) -> u64 {
        self.download_payload.rate() + self.download_protocol.rate()
    }

    pub fn upload_rate(&self) -> u64 {
        self.upload_payload.rate() + self.upload_protocol.rate()
    }
}
