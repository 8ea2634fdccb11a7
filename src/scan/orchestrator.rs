//! Scan state machine and its worker thread.
//!
//! `start` validates the preconditions on the caller's thread, then hands the
//! plan to a dedicated worker that walks the path. Outward communication is a
//! fire-and-forget event channel per subscriber; a slow or vanished subscriber
//! never blocks the scan.

use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use super::gate::gated_extrema;
use super::plan::ScanPlan;
use super::result::{PointStatus, ScanResult, ScanSample};
use crate::acquisition::PulseSource;
use crate::error::ScanError;
use crate::humidity::HumiditySource;
use crate::stage::Positioner;
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Running,
    Completed,
    Stopped,
    Failed,
}

/// Cooperative stop request, honored before each path point
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Percentage of path points visited, successful or not
    Progress(u8),
    /// Target of the point about to be visited
    Position { x: f64, y: f64 },
    Status(String),
    /// Waveform of a successfully acquired point
    Sample(Vec<f64>),
    Completed { success: bool, message: String },
}

/// What the worker hands back when it finishes
#[derive(Debug)]
pub struct ScanReport {
    pub state: ScanState,
    pub result: ScanResult,
    pub saved_to: Option<PathBuf>,
}

enum RunOutcome {
    Finished,
    Stopped,
}

pub struct ScanOrchestrator {
    positioner: Arc<dyn Positioner>,
    source: Arc<dyn PulseSource>,
    humidity: Arc<dyn HumiditySource>,
    plan: Option<ScanPlan>,
    time_axis: Option<Vec<f64>>,
    output_dir: Option<PathBuf>,
    subscribers: Vec<Sender<ScanEvent>>,
    state: Arc<Mutex<ScanState>>,
    stop: StopToken,
    worker: Option<JoinHandle<ScanReport>>,
    previous: Option<ScanReport>,
}

impl ScanOrchestrator {
    pub fn new(
        positioner: Arc<dyn Positioner>,
        source: Arc<dyn PulseSource>,
        humidity: Arc<dyn HumiditySource>,
    ) -> Self {
        Self {
            positioner,
            source,
            humidity,
            plan: None,
            time_axis: None,
            output_dir: None,
            subscribers: Vec::new(),
            state: Arc::new(Mutex::new(ScanState::Idle)),
            stop: StopToken::new(),
            worker: None,
            previous: None,
        }
    }

    /// Save completed scans into `dir`
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn configure(&mut self, plan: ScanPlan) -> Result<(), ScanError> {
        if self.state() == ScanState::Running {
            return Err(ScanError::AlreadyRunning);
        }
        plan.validate()?;
        info!(
            "Scan configured: {} x {} points around ({:.2}, {:.2})",
            plan.x_steps(),
            plan.y_steps(),
            plan.center_x,
            plan.center_y
        );
        self.plan = Some(plan);
        Ok(())
    }

    pub fn plan(&self) -> Option<&ScanPlan> {
        self.plan.as_ref()
    }

    /// Provide the time axis up front instead of fetching it at start
    pub fn set_time_axis(&mut self, time_axis: Vec<f64>) {
        self.time_axis = Some(time_axis);
    }

    pub fn time_axis(&self) -> Option<&[f64]> {
        self.time_axis.as_deref()
    }

    /// New receiver for every event emitted from now on
    pub fn subscribe(&mut self) -> Receiver<ScanEvent> {
        let (sender, receiver) = unbounded();
        self.subscribers.push(sender);
        receiver
    }

    pub fn state(&self) -> ScanState {
        *self.state.lock()
    }

    pub fn stop_token(&self) -> StopToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        if self.state() == ScanState::Running {
            info!("Scan stop requested");
        }
        self.stop.request_stop();
    }

    pub fn start(&mut self) -> Result<(), ScanError> {
        if self.state() == ScanState::Running {
            return Err(ScanError::AlreadyRunning);
        }
        if let Some(handle) = self.worker.take() {
            self.retain_unclaimed(handle);
        }

        let plan = self.plan.clone().ok_or(ScanError::NotConfigured)?;
        plan.validate()?;

        if !self.positioner.is_ready() {
            return Err(ScanError::NotReady(
                "motors are not connected".to_string(),
            ));
        }

        let time_axis = match &self.time_axis {
            Some(time_axis) => time_axis.clone(),
            None => {
                let fetched = self.source.time_axis().map_err(|e| {
                    warn!("Can't get time axis: {e}");
                    ScanError::TimeAxis(e)
                })?;
                self.time_axis = Some(fetched.clone());
                fetched
            }
        };

        self.stop.reset();
        *self.state.lock() = ScanState::Running;

        let worker = ScanWorker {
            plan,
            time_axis,
            positioner: self.positioner.clone(),
            source: self.source.clone(),
            humidity: self.humidity.clone(),
            output_dir: self.output_dir.clone(),
            events: self.subscribers.clone(),
            state: self.state.clone(),
            stop: self.stop.clone(),
        };

        let handle = thread::Builder::new()
            .name("scan-worker".to_string())
            .spawn(move || worker.run())
            .map_err(|e| {
                *self.state.lock() = ScanState::Failed;
                ScanError::Internal(format!("failed to spawn scan worker: {e}"))
            })?;

        self.worker = Some(handle);
        Ok(())
    }

    /// Block until the running scan ends. `None` if no scan was started.
    pub fn wait(&mut self) -> Option<ScanReport> {
        let handle = self.worker.take()?;
        match handle.join() {
            Ok(report) => Some(report),
            Err(_) => {
                error!("Scan worker terminated abnormally");
                *self.state.lock() = ScanState::Failed;
                None
            }
        }
    }

    /// Report of a scan that finished without `wait` being called, kept
    /// until the next `start` or until taken here
    pub fn take_previous_report(&mut self) -> Option<ScanReport> {
        self.previous.take()
    }

    fn retain_unclaimed(&mut self, handle: JoinHandle<ScanReport>) {
        let Ok(report) = handle.join() else {
            error!("Scan worker terminated abnormally");
            return;
        };
        if report.saved_to.is_none() && report.result.collected() > 0 {
            warn!(
                "Previous scan ({:?}) was never collected, keeping its {} unsaved points",
                report.state,
                report.result.collected()
            );
        } else {
            debug!("Keeping report of the previous scan");
        }
        if let Some(dropped) = self.previous.replace(report) {
            if dropped.saved_to.is_none() && dropped.result.collected() > 0 {
                warn!(
                    "Discarding {} unsaved points of an older scan",
                    dropped.result.collected()
                );
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(|h| h.is_finished())
    }
}

struct ScanWorker {
    plan: ScanPlan,
    time_axis: Vec<f64>,
    positioner: Arc<dyn Positioner>,
    source: Arc<dyn PulseSource>,
    humidity: Arc<dyn HumiditySource>,
    output_dir: Option<PathBuf>,
    events: Vec<Sender<ScanEvent>>,
    state: Arc<Mutex<ScanState>>,
    stop: StopToken,
}

impl ScanWorker {
    fn emit(&self, event: ScanEvent) {
        for sender in &self.events {
            let _ = sender.try_send(event.clone());
        }
    }

    fn status(&self, message: String) {
        info!("{message}");
        self.emit(ScanEvent::Status(message));
    }

    fn run(self) -> ScanReport {
        let start_humidity = self.humidity.current_humidity();
        if let Some(h) = start_humidity {
            self.status(format!("Scan start humidity: {h:.2}%"));
        }

        let mut result = ScanResult::new(self.plan.clone(), self.time_axis.clone(), start_humidity);
        let total = self.plan.total_points();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.visit_points(&mut result)))
            .unwrap_or_else(|payload| Err(ScanError::Internal(panic_message(payload.as_ref()))));

        let collected = result.collected();
        let mut saved_to = None;
        let (state, success, message) = match outcome {
            Ok(RunOutcome::Finished) => {
                result.end_humidity = self.humidity.current_humidity();
                if let Some(h) = result.end_humidity {
                    self.status(format!("Scan end humidity: {h:.2}%"));
                }
                result.completed = true;
                result.message = format!("Scan completed. Collected {collected}/{total} points");
                saved_to = self.autosave(&result);
                (ScanState::Completed, true, result.message.clone())
            }
            Ok(RunOutcome::Stopped) => {
                result.message = format!("scan stopped. Collected {collected}/{total} points");
                (ScanState::Stopped, false, result.message.clone())
            }
            Err(e) => {
                error!("Scan failed: {e}");
                result.message = format!("scan error: {e}");
                (ScanState::Failed, false, result.message.clone())
            }
        };

        *self.state.lock() = state;
        info!("{message}");
        self.emit(ScanEvent::Completed { success, message });

        ScanReport {
            state,
            result,
            saved_to,
        }
    }

    fn visit_points(&self, result: &mut ScanResult) -> Result<RunOutcome, ScanError> {
        let total = self.plan.total_points();
        let settle = self.plan.settle_time();
        let mut visited = 0usize;

        for point in self.plan.path() {
            if self.stop.is_stop_requested() {
                return Ok(RunOutcome::Stopped);
            }

            let (x, y) = (point.x, point.y);
            self.emit(ScanEvent::Position { x, y });
            self.status(format!("Moving to ({x:.2}, {y:.2})"));

            let sample = match self.positioner.move_to(x, y) {
                Err(e) => {
                    warn!("Skipping point ({x:.2}, {y:.2}): {e}");
                    self.emit(ScanEvent::Status(format!("move failed: ({x:.2}, {y:.2})")));
                    ScanSample::skipped(x, y, PointStatus::MoveFailed)
                }
                Ok(()) => {
                    thread::sleep(settle);
                    self.acquire_point(x, y, &result.time_axis)?
                }
            };
            result.samples.push(sample);

            visited += 1;
            let progress = (visited * 100 / total) as u8;
            self.emit(ScanEvent::Progress(progress));
        }

        Ok(RunOutcome::Finished)
    }

    fn acquire_point(&self, x: f64, y: f64, time_axis: &[f64]) -> Result<ScanSample, ScanError> {
        self.status(format!("Acquiring spectrum at ({x:.2}, {y:.2})"));

        let waveform = match self.source.latest_waveform() {
            Ok(waveform) => waveform,
            Err(e) => {
                warn!("Skipping point ({x:.2}, {y:.2}): {e}");
                self.emit(ScanEvent::Status(format!(
                    "data acquire failed: ({x:.2}, {y:.2})"
                )));
                return Ok(ScanSample::skipped(x, y, PointStatus::AcquireFailed));
            }
        };

        let (max, min) = gated_extrema(time_axis, &waveform, self.plan.t_min, self.plan.t_max)?;
        self.emit(ScanEvent::Sample(waveform.clone()));
        self.status(format!(
            "point ({x:.2}, {y:.2}): max={max:.4}, min={min:.4}"
        ));
        Ok(ScanSample::acquired(x, y, waveform, max, min))
    }

    fn autosave(&self, result: &ScanResult) -> Option<PathBuf> {
        let dir = self.output_dir.as_ref()?;
        match store::save(result, dir) {
            Ok(path) => {
                self.status(format!("Data is saved: {}", path.display()));
                Some(path)
            }
            Err(e) => {
                warn!("Saving scan to {} failed: {e}", dir.display());
                self.emit(ScanEvent::Status(format!(
                    "Scan finished but saved failed: {e}"
                )));
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AcqError, MotionError};
    use crate::humidity::SharedHumidity;
    use crate::axis::{Axis, Opcode};
    use crate::stage::StagePosition;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct MockPositioner {
        not_ready: bool,
        fail_on_move: Option<usize>,
        stop_after_moves: Option<(usize, StopToken)>,
        move_delay: Duration,
        moves: Mutex<Vec<(f64, f64)>>,
    }

    impl Positioner for MockPositioner {
        fn is_ready(&self) -> bool {
            !self.not_ready
        }

        fn move_to(&self, x: f64, y: f64) -> Result<(), MotionError> {
            thread::sleep(self.move_delay);
            let mut moves = self.moves.lock();
            moves.push((x, y));
            let count = moves.len();

            if let Some((after, token)) = &self.stop_after_moves {
                if count == *after {
                    token.request_stop();
                }
            }
            if self.fail_on_move == Some(count) {
                return Err(MotionError::Timeout {
                    axis: Axis::X,
                    command: Opcode::ExecuteMove,
                    timeout: Duration::from_secs(1),
                });
            }
            Ok(())
        }

        fn position(&self) -> StagePosition {
            self.moves
                .lock()
                .last()
                .map(|&(x, y)| StagePosition { x, y })
                .unwrap_or_default()
        }
    }

    struct MockSource {
        time_axis: Option<Vec<f64>>,
        waveform: Vec<f64>,
        fail_on_acquire: Option<usize>,
        acquisitions: AtomicUsize,
    }

    impl MockSource {
        fn new() -> Self {
            Self {
                time_axis: Some(vec![0.0, 1.0, 2.0, 3.0]),
                waveform: vec![9.0, 2.0, -1.0, -9.0],
                fail_on_acquire: None,
                acquisitions: AtomicUsize::new(0),
            }
        }
    }

    impl PulseSource for MockSource {
        fn time_axis(&self) -> Result<Vec<f64>, AcqError> {
            self.time_axis.clone().ok_or(AcqError::Timeout)
        }

        fn latest_waveform(&self) -> Result<Vec<f64>, AcqError> {
            let count = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_acquire == Some(count) {
                return Err(AcqError::BadLength(7));
            }
            Ok(self.waveform.clone())
        }
    }

    /// 5 x 2 grid, gate [1, 2], no settle time
    fn ten_point_plan() -> ScanPlan {
        ScanPlan {
            center_x: 2.0,
            center_y: 0.5,
            width: 4.0,
            height: 1.0,
            step_x: 1.0,
            step_y: 1.0,
            t_min: 1.0,
            t_max: 2.0,
            wait_time_secs: 0.0,
        }
    }

    fn orchestrator(positioner: MockPositioner, source: MockSource) -> ScanOrchestrator {
        let mut orchestrator = ScanOrchestrator::new(
            Arc::new(positioner),
            Arc::new(source),
            Arc::new(SharedHumidity::new()),
        );
        orchestrator.configure(ten_point_plan()).unwrap();
        orchestrator
    }

    #[test]
    fn test_move_failure_skips_point_and_continues() {
        let positioner = MockPositioner {
            fail_on_move: Some(5),
            ..Default::default()
        };
        let mut scan = orchestrator(positioner, MockSource::new());
        let events = scan.subscribe();

        scan.start().unwrap();
        let report = scan.wait().unwrap();

        assert_eq!(report.state, ScanState::Completed);
        assert_eq!(scan.state(), ScanState::Completed);
        assert_eq!(report.result.samples.len(), 10);
        assert_eq!(report.result.collected(), 9);

        let skipped = &report.result.samples[4];
        assert_eq!(skipped.status, PointStatus::MoveFailed);
        assert_eq!((skipped.max, skipped.min), (0.0, 0.0));

        let acquired = &report.result.samples[0];
        assert_eq!((acquired.max, acquired.min), (2.0, -1.0));

        let events: Vec<ScanEvent> = events.try_iter().collect();
        let progress: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                ScanEvent::Progress(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 100]);
        assert_eq!(
            events.last(),
            Some(&ScanEvent::Completed {
                success: true,
                message: "Scan completed. Collected 9/10 points".to_string()
            })
        );
        assert!(events.contains(&ScanEvent::Status("move failed: (4.00, 0.00)".to_string())));
    }

    #[test]
    fn test_scan_follows_serpentine_path() {
        let positioner = Arc::new(MockPositioner::default());
        let mut scan = ScanOrchestrator::new(
            positioner.clone(),
            Arc::new(MockSource::new()),
            Arc::new(SharedHumidity::new()),
        );
        scan.configure(ten_point_plan()).unwrap();
        scan.start().unwrap();
        scan.wait().unwrap();

        let xs: Vec<f64> = positioner.moves.lock().iter().map(|m| m.0).collect();
        assert_eq!(xs, vec![0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 3.0, 2.0, 1.0, 0.0]);
        assert_eq!(positioner.position(), StagePosition { x: 0.0, y: 1.0 });
    }

    #[test]
    fn test_acquire_failure_is_recorded_as_skipped() {
        let source = MockSource {
            fail_on_acquire: Some(2),
            ..MockSource::new()
        };
        let mut scan = orchestrator(MockPositioner::default(), source);

        scan.start().unwrap();
        let report = scan.wait().unwrap();

        assert_eq!(report.result.collected(), 9);
        assert_eq!(report.result.samples[1].status, PointStatus::AcquireFailed);
        assert!(report.result.samples[1].waveform.is_empty());
    }

    #[test]
    fn test_stop_is_honored_at_next_point() {
        let mut scan = ScanOrchestrator::new(
            Arc::new(MockPositioner::default()),
            Arc::new(MockSource::new()),
            Arc::new(SharedHumidity::new()),
        );
        let token = scan.stop_token();
        let positioner = MockPositioner {
            stop_after_moves: Some((3, token)),
            ..Default::default()
        };
        scan.positioner = Arc::new(positioner);
        scan.configure(ten_point_plan()).unwrap();
        let events = scan.subscribe();

        scan.start().unwrap();
        let report = scan.wait().unwrap();

        assert_eq!(report.state, ScanState::Stopped);
        assert_eq!(report.result.samples.len(), 3);
        assert!(!report.result.completed);
        assert!(report.saved_to.is_none());
        assert_eq!(
            events.try_iter().last(),
            Some(ScanEvent::Completed {
                success: false,
                message: "scan stopped. Collected 3/10 points".to_string()
            })
        );
    }

    #[test]
    fn test_start_requires_ready_positioner() {
        let positioner = MockPositioner {
            not_ready: true,
            ..Default::default()
        };
        let mut scan = orchestrator(positioner, MockSource::new());

        assert!(matches!(scan.start(), Err(ScanError::NotReady(_))));
        assert_eq!(scan.state(), ScanState::Idle);
        assert!(scan.wait().is_none());
    }

    #[test]
    fn test_start_requires_plan_and_time_axis() {
        let mut unconfigured = ScanOrchestrator::new(
            Arc::new(MockPositioner::default()),
            Arc::new(MockSource::new()),
            Arc::new(SharedHumidity::new()),
        );
        assert!(matches!(unconfigured.start(), Err(ScanError::NotConfigured)));

        let source = MockSource {
            time_axis: None,
            ..MockSource::new()
        };
        let mut scan = orchestrator(MockPositioner::default(), source);
        assert!(matches!(scan.start(), Err(ScanError::TimeAxis(AcqError::Timeout))));
        assert_eq!(scan.state(), ScanState::Idle);
    }

    #[test]
    fn test_time_axis_fetched_once() {
        let mut scan = orchestrator(MockPositioner::default(), MockSource::new());
        assert!(scan.time_axis().is_none());

        scan.start().unwrap();
        scan.wait().unwrap();
        assert_eq!(scan.time_axis(), Some(&[0.0, 1.0, 2.0, 3.0][..]));
    }

    #[test]
    fn test_short_waveform_fails_scan() {
        let source = MockSource {
            waveform: vec![1.0, 2.0],
            ..MockSource::new()
        };
        let mut scan = orchestrator(MockPositioner::default(), source);
        let events = scan.subscribe();

        scan.start().unwrap();
        let report = scan.wait().unwrap();

        assert_eq!(report.state, ScanState::Failed);
        assert_eq!(scan.state(), ScanState::Failed);
        assert!(report.result.message.starts_with("scan error:"));
        assert!(matches!(
            events.try_iter().last(),
            Some(ScanEvent::Completed { success: false, .. })
        ));
    }

    #[test]
    fn test_unclaimed_report_survives_next_start() {
        let mut scan = ScanOrchestrator::new(
            Arc::new(MockPositioner::default()),
            Arc::new(MockSource::new()),
            Arc::new(SharedHumidity::new()),
        );
        scan.positioner = Arc::new(MockPositioner {
            stop_after_moves: Some((3, scan.stop_token())),
            ..Default::default()
        });
        scan.configure(ten_point_plan()).unwrap();

        scan.start().unwrap();
        while !scan.is_finished() {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(scan.take_previous_report().is_none());

        scan.start().unwrap();
        let second = scan.wait().unwrap();
        assert_eq!(second.state, ScanState::Completed);

        let first = scan.take_previous_report().unwrap();
        assert_eq!(first.state, ScanState::Stopped);
        assert_eq!(first.result.collected(), 3);
        assert!(scan.take_previous_report().is_none());
    }

    #[test]
    fn test_second_start_while_running_is_rejected() {
        let positioner = MockPositioner {
            move_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let mut scan = orchestrator(positioner, MockSource::new());

        scan.start().unwrap();
        assert!(matches!(scan.start(), Err(ScanError::AlreadyRunning)));
        assert!(matches!(
            scan.configure(ten_point_plan()),
            Err(ScanError::AlreadyRunning)
        ));

        scan.stop();
        let report = scan.wait().unwrap();
        assert_eq!(report.state, ScanState::Stopped);
        assert!(report.result.samples.len() < 10);
    }

    #[test]
    fn test_humidity_bookends_and_autosave() {
        let dir = tempfile::tempdir().unwrap();
        let humidity = SharedHumidity::new();
        humidity.set(40.0);

        let mut scan = ScanOrchestrator::new(
            Arc::new(MockPositioner::default()),
            Arc::new(MockSource::new()),
            Arc::new(humidity.clone()),
        )
        .with_output_dir(dir.path());
        scan.configure(ten_point_plan()).unwrap();
        let events = scan.subscribe();

        scan.start().unwrap();
        let report = scan.wait().unwrap();

        assert_eq!(report.result.start_humidity, Some(40.0));
        assert_eq!(report.result.end_humidity, Some(40.0));

        let saved = report.saved_to.unwrap();
        assert!(saved.exists());
        assert!(events
            .try_iter()
            .any(|e| e == ScanEvent::Status(format!("Data is saved: {}", saved.display()))));
    }
}
