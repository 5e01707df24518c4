//! Progress tracking and callbacks for registration runs.
//!
//! The toolkit reports progress on stdout when run verbosely. Each line is
//! turned into a [`ToolkitEvent`] by [`parse_line`], and a [`ProgressTracker`]
//! turns those events into [`ProgressInfo`] for its callbacks.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Progress-relevant event reported by the toolkit.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolkitEvent {
    /// A new stage began (zero-based, as the toolkit numbers them).
    StageStarted { stage: usize },
    /// A new resolution level began (one-based).
    LevelStarted { level: usize, total: usize },
    /// One optimizer iteration finished.
    Iteration {
        iteration: usize,
        metric: f64,
        convergence: Option<f64>,
    },
}

/// Parse one line of verbose `antsRegistration` output.
///
/// Recognizes `Stage N`, `Current level = L of N` and `DIAGNOSTIC` rows;
/// everything else (including the DIAGNOSTIC column header) yields `None`.
pub fn parse_line(line: &str) -> Option<ToolkitEvent> {
    let line = line.trim();

    if let Some(rest) = line.strip_prefix("Stage ") {
        let stage = rest.split_whitespace().next()?.parse().ok()?;
        return Some(ToolkitEvent::StageStarted { stage });
    }

    if let Some(rest) = line.strip_prefix("Current level = ") {
        let mut parts = rest.split(" of ");
        let level = parts.next()?.trim().parse().ok()?;
        let total = parts.next()?.trim().parse().ok()?;
        return Some(ToolkitEvent::LevelStarted { level, total });
    }

    // Rows look like "1DIAGNOSTIC,     3, -4.5e-01, 2.1e-03, 1.2e+00, 4.0e-01, ".
    let (_, rest) = line.split_once("DIAGNOSTIC,")?;
    let mut fields = rest.split(',').map(str::trim);
    let iteration = fields.next()?.parse().ok()?;
    let metric = fields.next()?.parse().ok()?;
    let convergence = fields.next().and_then(|c| c.parse::<f64>().ok()).filter(|c| c.is_finite());

    Some(ToolkitEvent::Iteration {
        iteration,
        metric,
        convergence,
    })
}

/// Progress information for one toolkit iteration.
#[derive(Debug, Clone)]
pub struct ProgressInfo {
    /// Zero-based stage index.
    pub stage: usize,
    /// Number of stages, if known.
    pub total_stages: Option<usize>,
    /// One-based resolution level within the stage.
    pub level: usize,
    /// Iteration within the level.
    pub iteration: usize,
    /// Iteration budget of the level, if known.
    pub total_iterations: Option<usize>,
    /// Current metric value.
    pub metric: f64,
    /// Convergence measure, once the toolkit reports a finite one.
    pub convergence: Option<f64>,
    /// Time elapsed since the registration started.
    pub elapsed: Duration,
    /// Time elapsed since the current level started.
    pub level_elapsed: Duration,
    /// Estimated remaining time for the current level.
    pub estimated_remaining: Option<Duration>,
}

impl ProgressInfo {
    /// Percentage of the level's iteration budget consumed.
    pub fn progress_percent(&self) -> Option<f64> {
        self.total_iterations
            .filter(|&total| total > 0)
            .map(|total| (self.iteration as f64 / total as f64) * 100.0)
    }

    /// Extrapolate the remaining time of the level from its average iteration time.
    pub fn calculate_remaining(&mut self) {
        if let Some(total) = self.total_iterations {
            if self.iteration > 0 {
                let avg_time_per_iter = self.level_elapsed.as_secs_f64() / self.iteration as f64;
                let remaining_iters = total.saturating_sub(self.iteration);
                self.estimated_remaining =
                    Some(Duration::from_secs_f64(avg_time_per_iter * remaining_iters as f64));
            }
        }
    }
}

/// Progress callback trait for monitoring a registration run.
pub trait ProgressCallback: Send + Sync {
    /// Called for each reported iteration.
    fn on_progress(&self, info: &ProgressInfo);

    /// Called when the toolkit is launched.
    fn on_start(&self) {}

    /// Called when a stage or resolution level begins.
    fn on_stage(&self, _stage: usize, _level: usize, _total_levels: usize) {}

    /// Called when the toolkit exits successfully.
    fn on_complete(&self, _elapsed: Duration) {}

    /// Called when the run fails.
    fn on_error(&self, _error: &str) {}
}

/// Console progress callback that logs to tracing.
#[derive(Debug, Clone)]
pub struct ConsoleProgressCallback {
    /// Log interval (iterations).
    pub log_interval: usize,
}

impl Default for ConsoleProgressCallback {
    fn default() -> Self {
        Self { log_interval: 50 }
    }
}

impl ConsoleProgressCallback {
    pub fn new(log_interval: usize) -> Self {
        Self {
            log_interval: log_interval.max(1),
        }
    }
}

impl ProgressCallback for ConsoleProgressCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        let interval = self.log_interval.max(1);
        if info.iteration % interval == 0 || info.total_iterations == Some(info.iteration) {
            let remaining = info
                .estimated_remaining
                .map(|d| format!("{:.1}s", d.as_secs_f64()))
                .unwrap_or_else(|| "N/A".to_string());

            tracing::info!(
                "Stage {} level {} iter {}/{} | Metric: {:.6} | Elapsed: {:.1}s | ETA: {}",
                info.stage,
                info.level,
                info.iteration,
                info.total_iterations
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| "?".to_string()),
                info.metric,
                info.elapsed.as_secs_f64(),
                remaining
            );
        }
    }

    fn on_start(&self) {
        tracing::info!("Registration started");
    }

    fn on_stage(&self, stage: usize, level: usize, total_levels: usize) {
        tracing::info!("Stage {}: level {} of {}", stage, level, total_levels);
    }

    fn on_complete(&self, elapsed: Duration) {
        tracing::info!("Registration completed in {:.1}s", elapsed.as_secs_f64());
    }

    fn on_error(&self, error: &str) {
        tracing::error!("Registration failed: {}", error);
    }
}

/// History callback that records all progress information.
#[derive(Debug, Clone, Default)]
pub struct HistoryCallback {
    history: Arc<Mutex<Vec<ProgressInfo>>>,
    stages: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl HistoryCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded iterations.
    pub fn get_history(&self) -> Vec<ProgressInfo> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// Recorded `(stage, level)` transitions.
    pub fn get_stages(&self) -> Vec<(usize, usize)> {
        self.stages.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.clear();
        }
        if let Ok(mut stages) = self.stages.lock() {
            stages.clear();
        }
    }
}

impl ProgressCallback for HistoryCallback {
    fn on_progress(&self, info: &ProgressInfo) {
        if let Ok(mut history) = self.history.lock() {
            history.push(info.clone());
        }
    }

    fn on_stage(&self, stage: usize, level: usize, _total_levels: usize) {
        if let Ok(mut stages) = self.stages.lock() {
            stages.push((stage, level));
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    started: Option<Instant>,
    level_started: Option<Instant>,
    stage: usize,
    level: usize,
}

/// Progress tracker that manages multiple callbacks.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    callbacks: Vec<Arc<dyn ProgressCallback>>,
    /// Iteration budget per level, per stage.
    schedule: Vec<Vec<u32>>,
    state: Arc<Mutex<TrackerState>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that knows the iteration budget of every level.
    pub fn with_schedule(schedule: Vec<Vec<u32>>) -> Self {
        Self {
            schedule,
            ..Self::default()
        }
    }

    pub fn add_callback(&mut self, callback: Arc<dyn ProgressCallback>) {
        self.callbacks.push(callback);
    }

    pub fn set_schedule(&mut self, schedule: Vec<Vec<u32>>) {
        self.schedule = schedule;
    }

    /// Start tracking.
    pub fn start(&self) {
        if let Ok(mut state) = self.state.lock() {
            let now = Instant::now();
            *state = TrackerState {
                started: Some(now),
                level_started: Some(now),
                stage: 0,
                level: 1,
            };
        }
        for callback in &self.callbacks {
            callback.on_start();
        }
    }

    /// Feed one event from the toolkit.
    pub fn handle(&self, event: ToolkitEvent) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        match event {
            ToolkitEvent::StageStarted { stage } => {
                state.stage = stage;
                state.level = 1;
                state.level_started = Some(Instant::now());
            }
            ToolkitEvent::LevelStarted { level, total } => {
                state.level = level;
                state.level_started = Some(Instant::now());
                let stage = state.stage;
                drop(state);
                for callback in &self.callbacks {
                    callback.on_stage(stage, level, total);
                }
            }
            ToolkitEvent::Iteration {
                iteration,
                metric,
                convergence,
            } => {
                let elapsed = state.started.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                let level_elapsed = state
                    .level_started
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                let total_iterations = self
                    .schedule
                    .get(state.stage)
                    .and_then(|levels| levels.get(state.level.saturating_sub(1)))
                    .map(|&n| n as usize);

                let mut info = ProgressInfo {
                    stage: state.stage,
                    total_stages: (!self.schedule.is_empty()).then_some(self.schedule.len()),
                    level: state.level,
                    iteration,
                    total_iterations,
                    metric,
                    convergence,
                    elapsed,
                    level_elapsed,
                    estimated_remaining: None,
                };
                drop(state);
                info.calculate_remaining();

                for callback in &self.callbacks {
                    callback.on_progress(&info);
                }
            }
        }
    }

    /// Complete tracking.
    pub fn complete(&self) {
        let elapsed = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.started)
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);

        for callback in &self.callbacks {
            callback.on_complete(elapsed);
        }
    }

    /// Report error.
    pub fn error(&self, error: &str) {
        for callback in &self.callbacks {
            callback.on_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stage_and_level() {
        assert_eq!(parse_line("Stage 1"), Some(ToolkitEvent::StageStarted { stage: 1 }));
        assert_eq!(
            parse_line("  Current level = 2 of 3"),
            Some(ToolkitEvent::LevelStarted { level: 2, total: 3 })
        );
    }

    #[test]
    fn test_parse_diagnostic_row() {
        let event = parse_line(
            " 1DIAGNOSTIC,     5, -4.512345678901e-01, 2.301200000000e-03, 1.2345e+00, 2.4000e-01, ",
        );
        assert_eq!(
            event,
            Some(ToolkitEvent::Iteration {
                iteration: 5,
                metric: -4.512345678901e-01,
                convergence: Some(2.3012e-03),
            })
        );
    }

    #[test]
    fn test_parse_diagnostic_with_infinite_convergence() {
        let event = parse_line("2DIAGNOSTIC,     1, -5.000000000000e-01, inf, 1.0e+00, 1.0e+00, ");
        assert_eq!(
            event,
            Some(ToolkitEvent::Iteration {
                iteration: 1,
                metric: -0.5,
                convergence: None,
            })
        );
    }

    #[test]
    fn test_parse_ignores_header_and_noise() {
        assert_eq!(
            parse_line("XDIAGNOSTIC,Iteration,metricValue,convergenceValue,ITERATION_TIME_INDEX,SINCE_LAST"),
            None
        );
        assert_eq!(parse_line("All_Command_lines_OK"), None);
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("Stage of the art"), None);
    }

    #[test]
    fn test_progress_info_remaining() {
        let mut info = ProgressInfo {
            stage: 0,
            total_stages: Some(2),
            level: 1,
            iteration: 10,
            total_iterations: Some(100),
            metric: -0.5,
            convergence: None,
            elapsed: Duration::from_secs(20),
            level_elapsed: Duration::from_secs(10),
            estimated_remaining: None,
        };
        assert_eq!(info.progress_percent(), Some(10.0));
        info.calculate_remaining();
        assert_eq!(info.estimated_remaining, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_zero_budget_has_no_percentage() {
        let info = ProgressInfo {
            stage: 1,
            total_stages: None,
            level: 3,
            iteration: 0,
            total_iterations: Some(0),
            metric: 0.0,
            convergence: None,
            elapsed: Duration::ZERO,
            level_elapsed: Duration::ZERO,
            estimated_remaining: None,
        };
        assert_eq!(info.progress_percent(), None);
    }

    #[test]
    fn test_console_callback_with_zero_interval() {
        let callback = ConsoleProgressCallback { log_interval: 0 };
        let info = ProgressInfo {
            stage: 0,
            total_stages: Some(1),
            level: 1,
            iteration: 7,
            total_iterations: Some(40),
            metric: -0.2,
            convergence: Some(1e-3),
            elapsed: Duration::from_secs(1),
            level_elapsed: Duration::from_secs(1),
            estimated_remaining: None,
        };
        callback.on_progress(&info);
        assert_eq!(ConsoleProgressCallback::new(0).log_interval, 1);
    }

    #[test]
    fn test_tracker_uses_schedule() {
        let history = Arc::new(HistoryCallback::new());
        let mut tracker = ProgressTracker::with_schedule(vec![vec![100, 50], vec![40, 20, 0]]);
        tracker.add_callback(history.clone());

        tracker.start();
        tracker.handle(ToolkitEvent::StageStarted { stage: 0 });
        tracker.handle(ToolkitEvent::LevelStarted { level: 2, total: 2 });
        tracker.handle(ToolkitEvent::Iteration {
            iteration: 3,
            metric: -0.4,
            convergence: None,
        });
        tracker.handle(ToolkitEvent::StageStarted { stage: 1 });
        tracker.handle(ToolkitEvent::LevelStarted { level: 1, total: 3 });
        tracker.handle(ToolkitEvent::Iteration {
            iteration: 1,
            metric: -0.6,
            convergence: Some(0.01),
        });
        tracker.complete();

        let recorded = history.get_history();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].total_iterations, Some(50));
        assert_eq!(recorded[1].stage, 1);
        assert_eq!(recorded[1].total_iterations, Some(40));
        assert_eq!(recorded[1].total_stages, Some(2));
        assert_eq!(history.get_stages(), vec![(0, 2), (1, 1)]);
    }

    #[test]
    fn test_history_clear() {
        let callback = HistoryCallback::new();
        callback.on_stage(0, 1, 4);
        callback.clear();
        assert!(callback.get_stages().is_empty());
        assert!(callback.get_history().is_empty());
    }
}
