//! Planner and Executor timing statistics.

use heapless::HistoryBuf;

/// Samples retained per task.
pub const PERF_WINDOW: usize = 128;

/// Rolling window of elapsed-time samples in microseconds.
pub struct SampleWindow {
    samples: HistoryBuf<u32, PERF_WINDOW>,
}

impl SampleWindow {
    pub const fn new() -> Self {
        Self {
            samples: HistoryBuf::new(),
        }
    }

    pub fn record(&mut self, sample_us: u32) {
        self.samples.write(sample_us);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Nearest-rank percentile over the retained samples; zero when empty.
    pub fn percentile(&self, pct: u8) -> u32 {
        let count = self.samples.len();
        if count == 0 {
            return 0;
        }
        let mut sorted = [0_u32; PERF_WINDOW];
        for (slot, sample) in sorted.iter_mut().zip(self.samples.as_slice()) {
            *slot = *sample;
        }
        let sorted = &mut sorted[..count];
        sorted.sort_unstable();
        let index = (count - 1) * usize::from(pct.min(100)) / 100;
        sorted[index]
    }
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing record for one task.
#[derive(Default)]
pub struct TaskPerf {
    window: SampleWindow,
    last_us: u32,
    max_us: u32,
    deadline_misses: u32,
}

impl TaskPerf {
    pub const fn new() -> Self {
        Self {
            window: SampleWindow::new(),
            last_us: 0,
            max_us: 0,
            deadline_misses: 0,
        }
    }

    fn record(&mut self, elapsed_us: u32, missed: bool) {
        self.last_us = elapsed_us;
        self.max_us = self.max_us.max(elapsed_us);
        if missed {
            self.deadline_misses = self.deadline_misses.wrapping_add(1);
        }
        self.window.record(elapsed_us);
    }

    pub fn summary(&self) -> TaskPerfSummary {
        TaskPerfSummary {
            last_us: self.last_us,
            max_us: self.max_us,
            p95_us: self.window.percentile(95),
            p99_us: self.window.percentile(99),
            deadline_misses: self.deadline_misses,
            samples: u16::try_from(self.window.len()).unwrap_or(u16::MAX),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskPerfSummary {
    pub last_us: u32,
    pub max_us: u32,
    pub p95_us: u32,
    pub p99_us: u32,
    pub deadline_misses: u32,
    pub samples: u16,
}

/// Pipeline timing, written only by the Planner and Executor themselves.
pub struct PerfStats {
    planner_deadline_us: u32,
    planner: TaskPerf,
    executor: TaskPerf,
    queue_overruns: u32,
    queue_depth_peak: u32,
    stale_drops: u32,
}

impl PerfStats {
    pub const fn new(planner_deadline_us: u32) -> Self {
        Self {
            planner_deadline_us,
            planner: TaskPerf::new(),
            executor: TaskPerf::new(),
            queue_overruns: 0,
            queue_depth_peak: 0,
            stale_drops: 0,
        }
    }

    pub fn record_planner(&mut self, elapsed_us: u32) {
        let missed = elapsed_us > self.planner_deadline_us;
        self.planner.record(elapsed_us, missed);
    }

    /// Executor cycles miss their deadline when the command they applied
    /// waited longer than one planner budget in the ring.
    pub fn record_executor(&mut self, elapsed_us: u32, queue_age_us: u32) {
        let missed = queue_age_us > self.planner_deadline_us;
        self.executor.record(elapsed_us, missed);
    }

    /// A stale command counts as an executor cycle that did nothing.
    pub fn record_stale(&mut self, queue_age_us: u32) {
        self.stale_drops = self.stale_drops.wrapping_add(1);
        self.record_executor(0, queue_age_us);
    }

    pub fn record_ring(&mut self, overruns: u32, depth: usize) {
        self.queue_overruns = overruns;
        let depth = u32::try_from(depth).unwrap_or(u32::MAX);
        self.queue_depth_peak = self.queue_depth_peak.max(depth);
    }

    pub fn summary(&self) -> PerfSummary {
        PerfSummary {
            planner: self.planner.summary(),
            executor: self.executor.summary(),
            queue_overruns: self.queue_overruns,
            queue_depth_peak: self.queue_depth_peak,
            stale_drops: self.stale_drops,
        }
    }
}

impl Default for PerfStats {
    fn default() -> Self {
        Self::new(super::PLANNER_DEADLINE_US)
    }
}

/// Copyable view of [`PerfStats`] for diagnostics.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PerfSummary {
    pub planner: TaskPerfSummary,
    pub executor: TaskPerfSummary,
    pub queue_overruns: u32,
    pub queue_depth_peak: u32,
    pub stale_drops: u32,
}
