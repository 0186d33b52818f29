//! Fixed-frequency loop runner.
//!
//! Every control loop runs its cycle function on a dedicated blocking thread
//! so that a slow loop can never starve another one. Timing is soft real
//! time: an overrun is counted and logged, the schedule slips, nothing is
//! skipped or compensated.

use crate::config::LoopConfig;
use crate::error::{ControlError, ControlResult};
use crate::events::{ControlEvent, EventBus};
use crate::lock;
use heapless::HistoryBuffer;
use serde::Serialize;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const TIMING_WINDOW: usize = 64;

/// Read-only snapshot of a loop's timing record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LoopStatistics {
    pub cycles: u64,
    pub violations: u64,
    pub consecutive_violations: u32,
    pub timing_faults: u32,
    pub last_cycle: Duration,
    /// Max over the whole run.
    pub max_cycle: Duration,
    /// Max and mean over the last `TIMING_WINDOW` cycles.
    pub rolling_max_cycle: Duration,
    pub rolling_mean_cycle: Duration,
}

/// Cycle-time accounting, independent of how cycles are paced.
#[derive(Debug)]
pub struct TimingMonitor {
    name: &'static str,
    budget: Duration,
    max_consecutive: u32,
    stats: LoopStatistics,
    window: HistoryBuffer<Duration, TIMING_WINDOW>,
    fault_raised: bool,
}

impl TimingMonitor {
    pub fn new(name: &'static str, config: &LoopConfig) -> Self {
        Self {
            name,
            budget: config.cycle_budget(),
            max_consecutive: config.max_consecutive_violations,
            stats: LoopStatistics::default(),
            window: HistoryBuffer::new(),
            fault_raised: false,
        }
    }

    /// Account one cycle. Returns `PersistentTimingFault` once per streak of
    /// overruns longer than the configured threshold.
    pub fn record(&mut self, elapsed: Duration) -> Option<ControlError> {
        let stats = &mut self.stats;
        stats.cycles += 1;
        stats.last_cycle = elapsed;
        stats.max_cycle = stats.max_cycle.max(elapsed);

        self.window.write(elapsed);
        let samples = self.window.as_slice();
        stats.rolling_max_cycle = samples.iter().copied().max().unwrap_or_default();
        stats.rolling_mean_cycle = samples.iter().sum::<Duration>() / samples.len().max(1) as u32;

        if elapsed <= self.budget {
            stats.consecutive_violations = 0;
            self.fault_raised = false;
            return None;
        }

        stats.violations += 1;
        stats.consecutive_violations = stats.consecutive_violations.saturating_add(1);
        warn!(
            loop_name = self.name,
            elapsed_us = elapsed.as_micros() as u64,
            budget_us = self.budget.as_micros() as u64,
            consecutive = stats.consecutive_violations,
            "cycle exceeded its budget"
        );

        if stats.consecutive_violations > self.max_consecutive && !self.fault_raised {
            self.fault_raised = true;
            stats.timing_faults += 1;
            return Some(ControlError::PersistentTimingFault {
                loop_name: self.name,
                consecutive: stats.consecutive_violations,
            });
        }
        None
    }

    pub fn statistics(&self) -> LoopStatistics {
        self.stats
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleContext {
    pub index: u64,
    pub period: Duration,
}

struct Running {
    config: LoopConfig,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// A named periodic task. `start` it with a cycle function, `stop` it to drain.
pub struct RtLoop {
    name: &'static str,
    events: EventBus,
    stats: Arc<Mutex<LoopStatistics>>,
    running: Option<Running>,
}

impl RtLoop {
    pub fn new(name: &'static str, events: EventBus) -> Self {
        Self { name, events, stats: Arc::default(), running: None }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|r| !r.handle.is_finished())
    }

    pub fn config(&self) -> Option<LoopConfig> {
        self.running.as_ref().map(|r| r.config)
    }

    pub fn statistics(&self) -> LoopStatistics {
        *lock(&self.stats)
    }

    /// Begin periodic execution on the current tokio runtime.
    pub fn start<F>(&mut self, config: LoopConfig, cycle: F) -> ControlResult<()>
    where
        F: FnMut(&CycleContext) + Send + 'static,
    {
        if self.running.is_some() {
            return Err(ControlError::AlreadyRunning(self.name));
        }
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ControlError::InvalidConfig(format!("loop '{}' needs a tokio runtime: {e}", self.name)))?;

        let (stop_tx, stop_rx) = mpsc::channel();
        *lock(&self.stats) = LoopStatistics::default();
        let name = self.name;
        let stats = Arc::clone(&self.stats);
        let events = self.events.clone();
        let handle = runtime.spawn_blocking(move || run(name, config, cycle, &stop_rx, &stats, &events));

        info!(loop_name = self.name, frequency_hz = config.frequency_hz, "loop started");
        self.running = Some(Running { config, stop_tx, handle });
        Ok(())
    }

    /// Request a cooperative stop and wait for the in-flight cycle to finish.
    pub async fn stop(&mut self) -> ControlResult<LoopStatistics> {
        let running = self.running.take().ok_or(ControlError::NotRunning(self.name))?;
        // A send error means the loop thread already exited.
        let _ = running.stop_tx.send(());
        if let Err(e) = running.handle.await {
            error!(loop_name = self.name, error = %e, "loop thread ended abnormally");
            return Err(ControlError::LoopPanicked(self.name));
        }
        let stats = self.statistics();
        info!(loop_name = self.name, cycles = stats.cycles, violations = stats.violations, "loop stopped");
        Ok(stats)
    }
}

fn run<F>(
    name: &'static str,
    config: LoopConfig,
    mut cycle: F,
    stop_rx: &mpsc::Receiver<()>,
    stats: &Mutex<LoopStatistics>,
    events: &EventBus,
) where
    F: FnMut(&CycleContext),
{
    let period = config.cycle_budget();
    let mut timing = TimingMonitor::new(name, &config);
    let mut next_tick = Instant::now();
    let mut index = 0u64;

    loop {
        let now = Instant::now();
        let stop_requested = if next_tick > now {
            !matches!(stop_rx.recv_timeout(next_tick - now), Err(RecvTimeoutError::Timeout))
        } else {
            !matches!(stop_rx.try_recv(), Err(TryRecvError::Empty))
        };
        if stop_requested {
            debug!(loop_name = name, index, "stop observed between cycles");
            break;
        }

        let started = Instant::now();
        cycle(&CycleContext { index, period });
        let elapsed = started.elapsed();

        let fault = timing.record(elapsed);
        *lock(stats) = timing.statistics();
        if let Some(ControlError::PersistentTimingFault { loop_name, consecutive }) = fault {
            error!(loop_name, consecutive, "persistent timing fault");
            events.publish(ControlEvent::TimingFault { loop_name, consecutive });
        }

        // A late cycle moves the schedule instead of bunching the next ticks.
        next_tick += period;
        let now = Instant::now();
        if next_tick < now {
            next_tick = now;
        }
        index += 1;
    }
}
