//! Closed-loop tuning of batch size and worker count.
//!
//! The controller feeds one [`LoadSample`] per tick into [`AdaptiveTuner`],
//! which folds it into its moving averages and produces the next
//! [`Tuning`]. Factors are multiplicative and clamped, so a single noisy
//! sample cannot swing the pool far.

use std::time::Duration;

/// Exponential moving average.
#[derive(Debug, Clone, Copy)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(alpha: f64) -> Self {
        Self { alpha: alpha.clamp(0.0, 1.0), value: None }
    }

    pub fn observe(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(current) => current + self.alpha * (sample - current),
        };
        self.value = Some(next);
        next
    }

    pub fn get(&self) -> Option<f64> {
        self.value
    }
}

/// CPU utilization source, percent in [0, 100].
pub trait CpuSampler: Send + std::fmt::Debug {
    fn sample(&mut self) -> f64;
}

/// Production sampler backed by `sysinfo`.
#[derive(Debug)]
pub struct SysinfoCpuSampler {
    system: sysinfo::System,
}

impl SysinfoCpuSampler {
    pub fn new() -> Self {
        Self { system: sysinfo::System::new() }
    }
}

impl Default for SysinfoCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SysinfoCpuSampler {
    fn sample(&mut self) -> f64 {
        self.system.refresh_cpu_usage();
        f64::from(self.system.global_cpu_usage())
    }
}

/// Fixed-value sampler for tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedCpuSampler(pub f64);

impl CpuSampler for FixedCpuSampler {
    fn sample(&mut self) -> f64 {
        self.0
    }
}

/// The values workers read at every dequeue boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub batch_size: usize,
    pub workers: usize,
}

/// One controller tick's worth of observations.
#[derive(Debug, Clone, Copy)]
pub struct LoadSample {
    pub cpu_percent: f64,
    /// Items that reached a final outcome this window.
    pub items_completed: u64,
    /// Of those, how many failed.
    pub items_failed: u64,
    /// Wall time covered by this sample.
    pub window: Duration,
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct TunerConfig {
    pub min_batch: usize,
    pub max_batch: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub target_cpu_percent: f64,
    pub drain_sla: Duration,
}

/// Multiplicative controller over batch size and worker count.
#[derive(Debug)]
pub struct AdaptiveTuner {
    config: TunerConfig,
    cpu_ema: Ema,
    throughput_short: Ema,
    throughput_long: Ema,
}

impl AdaptiveTuner {
    pub fn new(config: TunerConfig) -> Self {
        Self {
            config,
            cpu_ema: Ema::new(0.5),
            throughput_short: Ema::new(0.5),
            throughput_long: Ema::new(0.1),
        }
    }

    /// Fold in one sample and compute the next tuning.
    pub fn evaluate(&mut self, current: Tuning, sample: &LoadSample) -> Tuning {
        let cpu = self.cpu_ema.observe(sample.cpu_percent.clamp(0.0, 100.0));
        let window_secs = sample.window.as_secs_f64().max(0.001);
        let throughput = sample.items_completed as f64 / window_secs;
        let short = self.throughput_short.observe(throughput);
        let long = self.throughput_long.observe(throughput);

        let error_rate = if sample.items_completed == 0 {
            0.0
        } else {
            sample.items_failed as f64 / sample.items_completed as f64
        };

        let cpu_factor = (self.config.target_cpu_percent / cpu.max(1.0)).clamp(0.5, 2.0);
        let error_factor = 1.0 / (1.0 + error_rate * 10.0);
        let trend_factor = if long > 0.0 { (short / long).clamp(0.7, 1.3) } else { 1.0 };

        let batch_size = ((current.batch_size as f64) * cpu_factor * error_factor * trend_factor)
            .round() as usize;
        let batch_size = batch_size.clamp(self.config.min_batch, self.config.max_batch);

        let workers = ((current.workers as f64) * cpu_factor).round() as usize;
        let workers = workers
            .max(self.drain_floor(sample, current.workers, throughput))
            .clamp(self.config.min_workers, self.config.max_workers);

        Tuning { batch_size, workers }
    }

    /// Workers needed to drain the current queue depth within the drain SLA
    /// at the observed per-worker rate. The controller never shrinks below
    /// this.
    fn drain_floor(&self, sample: &LoadSample, current_workers: usize, throughput: f64) -> usize {
        if sample.queue_depth == 0 || throughput <= 0.0 || current_workers == 0 {
            return self.config.min_workers;
        }
        let per_worker_rate = throughput / current_workers as f64;
        let drain_secs = self.config.drain_sla.as_secs_f64().max(0.001);
        let needed = sample.queue_depth as f64 / (per_worker_rate * drain_secs);
        needed.ceil() as usize
    }
}
