use crate::agent::DrowsinessTracker;
use crate::alert::AlertSink;
use crate::classifier::Classifier;
use crate::config::MonitorConfig;
use crate::error::{AgentError, AgentResult};
use crate::frame::FrameSource;
use crate::types::{Action, CycleMetrics, ObservationState, Session, StatusSnapshot, SystemState};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Drives the capture → classify → update → wait loop.
///
/// Cycles never overlap: the next one is armed only after the current one
/// has finished. `stop()` cancels the armed timer but cannot cancel an
/// in-flight classifier call; that call's result is dropped on return
/// because its generation no longer matches.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: MonitorConfig,
    tracker: DrowsinessTracker,
    frames: Arc<dyn FrameSource>,
    classifier: Arc<dyn Classifier>,
    alert: Arc<dyn AlertSink>,
    run: Mutex<RunState>,
    status_tx: watch::Sender<StatusSnapshot>,
}

#[derive(Default)]
struct RunState {
    session: Session,
    active: bool,
    generation: u64,
    error: Option<AgentError>,
    pending: Option<JoinHandle<()>>,
    skip_streak: u32,
    metrics: CycleMetrics,
}

impl RunState {
    fn is_current(&self, generation: u64) -> bool {
        self.active && self.generation == generation
    }

    fn cancel_pending(&mut self) {
        if let Some(timer) = self.pending.take() {
            timer.abort();
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: SystemState::derive(self.active, self.session.alarm),
            active: self.active,
            observation: self.session.observation,
            drowsy_count: self.session.drowsy_count,
            alarm: self.session.alarm,
            error: self.error.as_ref().map(ToString::to_string),
            metrics: self.metrics,
        }
    }
}

impl Scheduler {
    pub fn new(
        config: MonitorConfig,
        frames: Arc<dyn FrameSource>,
        classifier: Arc<dyn Classifier>,
        alert: Arc<dyn AlertSink>,
    ) -> Self {
        let tracker = DrowsinessTracker::new(config.drowsiness_threshold);
        let (status_tx, _) = watch::channel(StatusSnapshot::default());

        Self {
            inner: Arc::new(Inner {
                config,
                tracker,
                frames,
                classifier,
                alert,
                run: Mutex::new(RunState::default()),
                status_tx,
            }),
        }
    }

    /// Begins a fresh run and fires the first cycle immediately.
    ///
    /// Calling this while already active is not a no-op: it restarts the run
    /// with a new generation and samples at once instead of waiting for the
    /// armed timer. Any call still in flight from the previous run is
    /// discarded, and a set alarm is cleared and its alert ended.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> AgentResult<()> {
        if !self.inner.frames.is_ready() {
            warn!("Cannot start detection: frame source not ready");
            return Err(AgentError::NotReady);
        }

        let generation = {
            let mut run = self.lock();
            run.cancel_pending();
            run.error = None;
            if run.session.alarm
                && self.inner.tracker.reset_alert(&mut run.session) == Action::EndAlert
            {
                self.inner.alert.end_alert();
            }
            run.session.reset();
            run.skip_streak = 0;
            run.active = true;
            run.generation += 1;
            self.publish(&run);
            run.generation
        };

        info!(
            generation,
            threshold = self.inner.tracker.threshold(),
            interval_ms = self.inner.config.analysis_interval_ms,
            "Detection started"
        );
        self.spawn_cycle(generation);
        Ok(())
    }

    /// Ends the run. The alarm flag survives until `reset_alert()`.
    pub fn stop(&self) {
        let mut run = self.lock();
        let was_active = run.active;
        run.active = false;
        run.cancel_pending();
        run.session.end_run();
        self.publish(&run);

        if was_active {
            info!(generation = run.generation, "Detection stopped");
        }
    }

    /// Clears the alarm and counter and ends the alert. Valid at any time.
    pub fn reset_alert(&self) {
        let mut run = self.lock();
        let was_alarmed = run.session.alarm;
        if self.inner.tracker.reset_alert(&mut run.session) == Action::EndAlert {
            self.inner.alert.end_alert();
        }
        self.publish(&run);

        if was_alarmed {
            info!("Alarm acknowledged");
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.lock().snapshot()
    }

    /// Receives a new snapshot after every state change.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.status_tx.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.inner.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, run: &RunState) {
        self.inner.status_tx.send_replace(run.snapshot());
    }

    fn spawn_cycle(&self, generation: u64) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_cycle(generation).await;
        });
    }

    /// Arms the timer for the next cycle if this run is still current.
    fn schedule_next(&self, generation: u64) {
        let mut run = self.lock();
        if !run.is_current(generation) {
            return;
        }

        let scheduler = self.clone();
        let delay = self.inner.config.analysis_interval();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            scheduler.spawn_cycle(generation);
        });

        if let Some(previous) = run.pending.replace(timer) {
            previous.abort();
        }
    }

    async fn run_cycle(&self, generation: u64) {
        let frame = {
            let mut run = self.lock();
            if !run.is_current(generation) {
                return;
            }

            match self.inner.frames.current_frame() {
                Some(frame) => {
                    run.skip_streak = 0;
                    run.session.observation = ObservationState::Analyzing;
                    self.publish(&run);
                    frame
                }
                None => {
                    run.skip_streak += 1;
                    run.metrics.skipped_cycles += 1;
                    if run.skip_streak == self.inner.config.frame_skip_warn_after {
                        warn!(
                            skipped = run.skip_streak,
                            "No frame available for several consecutive cycles"
                        );
                    } else {
                        debug!(generation, "No frame available, skipping cycle");
                    }
                    self.publish(&run);
                    drop(run);
                    self.schedule_next(generation);
                    return;
                }
            }
        };

        let started = Instant::now();
        let result = self.inner.classifier.classify(&frame).await;
        let elapsed = started.elapsed();

        {
            let mut run = self.lock();
            if !run.is_current(generation) {
                debug!(generation, "Discarding result from a stopped run");
                return;
            }

            record_latency(&mut run.metrics, elapsed, self.inner.config.analysis_interval());

            match result {
                Ok(obs) => {
                    let action = self.inner.tracker.step(&mut run.session, obs);
                    debug!(
                        generation,
                        observation = %obs,
                        drowsy_count = run.session.drowsy_count,
                        "Cycle complete"
                    );
                    if action == Action::BeginAlert {
                        warn!(
                            drowsy_count = run.session.drowsy_count,
                            "Drowsiness threshold reached"
                        );
                        self.inner.alert.begin_alert();
                    }
                    self.publish(&run);
                }
                Err(err) => {
                    error!(generation, error = %err, "Frame analysis failed, stopping detection");
                    run.error = Some(AgentError::AnalysisFailed(err.to_string()));
                    run.active = false;
                    run.cancel_pending();
                    run.session.end_run();
                    self.publish(&run);
                    return;
                }
            }
        }

        self.schedule_next(generation);
    }
}

fn record_latency(metrics: &mut CycleMetrics, elapsed: Duration, budget: Duration) {
    metrics.total_cycles += 1;

    if elapsed > budget {
        metrics.slow_cycles += 1;
    }

    let elapsed_ms = elapsed.as_millis().min(u64::MAX as u128) as u64;
    if elapsed_ms > metrics.worst_case_ms {
        metrics.worst_case_ms = elapsed_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::TerminalBell;
    use crate::classifier::ClassifierError;
    use crate::frame::{Frame, LatestFrame};
    use crate::types::Observation::{self, Closed, Open, Yawn};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const INTERVAL: Duration = Duration::from_millis(2000);

    /// Replays queued results, then answers OPEN.
    #[derive(Default)]
    struct ScriptedClassifier {
        script: Mutex<VecDeque<Result<Observation, ClassifierError>>>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedClassifier {
        fn new(script: Vec<Result<Observation, ClassifierError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }

        fn gated(script: Vec<Result<Observation, ClassifierError>>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(script)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Classifier for ScriptedClassifier {
        async fn classify(&self, _frame: &Frame) -> Result<Observation, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(Open))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        begins: AtomicUsize,
        ends: AtomicUsize,
    }

    impl AlertSink for RecordingSink {
        fn begin_alert(&self) {
            self.begins.fetch_add(1, Ordering::SeqCst);
        }

        fn end_alert(&self) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        scheduler: Scheduler,
        frames: Arc<LatestFrame>,
        classifier: Arc<ScriptedClassifier>,
        sink: Arc<RecordingSink>,
    }

    fn harness(classifier: ScriptedClassifier) -> Harness {
        let frames = Arc::new(LatestFrame::new());
        frames.publish(Frame::jpeg(vec![1, 2, 3]));
        let classifier = Arc::new(classifier);
        let sink = Arc::new(RecordingSink::default());

        let scheduler = Scheduler::new(
            MonitorConfig::default(),
            frames.clone(),
            classifier.clone(),
            sink.clone(),
        );

        Harness {
            scheduler,
            frames,
            classifier,
            sink,
        }
    }

    fn failure() -> ClassifierError {
        ClassifierError::Status {
            status: 503,
            body: "unavailable".to_string(),
        }
    }

    /// Lets spawned cycles run without reaching the next timer.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn next_cycle() {
        tokio::time::sleep(INTERVAL).await;
    }

    #[tokio::test(start_paused = true)]
    async fn alarm_after_three_closed_cycles() {
        let h = harness(ScriptedClassifier::new(vec![
            Ok(Open),
            Ok(Closed),
            Ok(Closed),
            Ok(Closed),
        ]));

        h.scheduler.start().unwrap();
        settle().await;
        assert_eq!(h.scheduler.snapshot().drowsy_count, 0);

        next_cycle().await;
        next_cycle().await;
        let snapshot = h.scheduler.snapshot();
        assert_eq!(snapshot.drowsy_count, 2);
        assert!(!snapshot.alarm);

        next_cycle().await;
        let snapshot = h.scheduler.snapshot();
        assert_eq!(snapshot.drowsy_count, 3);
        assert!(snapshot.alarm);
        assert_eq!(snapshot.state, SystemState::Alarmed);
        assert_eq!(h.sink.begins.load(Ordering::SeqCst), 1);
        assert_eq!(h.classifier.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_run_never_alarms() {
        let h = harness(ScriptedClassifier::new(vec![
            Ok(Closed),
            Ok(Closed),
            Ok(Open),
            Ok(Closed),
            Ok(Closed),
        ]));

        h.scheduler.start().unwrap();
        settle().await;
        for _ in 0..4 {
            next_cycle().await;
        }

        let snapshot = h.scheduler.snapshot();
        assert_eq!(snapshot.drowsy_count, 2);
        assert!(!snapshot.alarm);
        assert_eq!(h.sink.begins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn continued_drowsiness_does_not_refire() {
        let h = harness(ScriptedClassifier::new(vec![
            Ok(Closed),
            Ok(Yawn),
            Ok(Closed),
            Ok(Yawn),
            Ok(Open),
        ]));

        h.scheduler.start().unwrap();
        settle().await;
        for _ in 0..4 {
            next_cycle().await;
        }

        let snapshot = h.scheduler.snapshot();
        assert!(snapshot.alarm, "alarm must stay set after an OPEN");
        assert_eq!(snapshot.drowsy_count, 0);
        assert_eq!(h.sink.begins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn classifier_failure_stops_the_run() {
        let h = harness(ScriptedClassifier::new(vec![Ok(Closed), Err(failure())]));

        h.scheduler.start().unwrap();
        settle().await;
        next_cycle().await;

        let snapshot = h.scheduler.snapshot();
        assert!(!snapshot.active);
        assert_eq!(snapshot.state, SystemState::Idle);
        assert_eq!(snapshot.drowsy_count, 0);
        assert!(snapshot
            .error
            .as_deref()
            .is_some_and(|e| e.starts_with("failed to analyze frame")));

        for _ in 0..3 {
            next_cycle().await;
        }
        assert_eq!(h.classifier.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_frames_is_not_ready() {
        let frames = Arc::new(LatestFrame::new());
        let classifier = Arc::new(ScriptedClassifier::default());
        let scheduler = Scheduler::new(
            MonitorConfig::default(),
            frames,
            classifier.clone(),
            Arc::new(RecordingSink::default()),
        );

        assert_eq!(scheduler.start(), Err(AgentError::NotReady));
        settle().await;

        assert_eq!(scheduler.snapshot(), StatusSnapshot::default());
        assert_eq!(classifier.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_discards_in_flight_result() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedClassifier::gated(vec![Ok(Closed)], gate.clone()));

        h.scheduler.start().unwrap();
        settle().await;
        assert_eq!(h.scheduler.snapshot().observation, ObservationState::Analyzing);

        h.scheduler.stop();
        gate.notify_one();
        settle().await;

        let snapshot = h.scheduler.snapshot();
        assert_eq!(snapshot.drowsy_count, 0);
        assert_eq!(snapshot.observation, ObservationState::default());
        assert_eq!(snapshot.metrics.total_cycles, 0);

        next_cycle().await;
        next_cycle().await;
        assert_eq!(h.classifier.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_ignores_stale_generation() {
        let gate = Arc::new(Notify::new());
        let h = harness(ScriptedClassifier::gated(
            vec![Ok(Closed), Ok(Closed)],
            gate.clone(),
        ));

        h.scheduler.start().unwrap();
        settle().await;
        h.scheduler.stop();
        h.scheduler.start().unwrap();
        settle().await;
        assert_eq!(h.classifier.calls(), 2);

        // Both calls return; only the second run's result counts.
        gate.notify_waiters();
        settle().await;

        let snapshot = h.scheduler.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.drowsy_count, 1);
        assert_eq!(snapshot.metrics.total_cycles, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_cycle() {
        let h = harness(ScriptedClassifier::default());

        h.scheduler.start().unwrap();
        settle().await;
        assert_eq!(h.classifier.calls(), 1);

        h.scheduler.stop();
        next_cycle().await;
        next_cycle().await;

        assert_eq!(h.classifier.calls(), 1);
        assert!(!h.scheduler.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_does_not_resurrect_alarm() {
        let h = harness(ScriptedClassifier::new(vec![
            Ok(Closed),
            Ok(Closed),
            Ok(Closed),
        ]));

        h.scheduler.start().unwrap();
        settle().await;
        next_cycle().await;
        next_cycle().await;
        assert!(h.scheduler.snapshot().alarm);

        h.scheduler.stop();
        let stopped = h.scheduler.snapshot();
        assert!(stopped.alarm, "stop leaves the alarm for acknowledgement");
        assert_eq!(stopped.state, SystemState::Alarmed);

        assert_eq!(h.sink.ends.load(Ordering::SeqCst), 0);

        h.scheduler.start().unwrap();
        let restarted = h.scheduler.snapshot();
        assert!(!restarted.alarm);
        assert_eq!(restarted.drowsy_count, 0);
        assert_eq!(restarted.observation, ObservationState::default());
        assert_eq!(h.sink.ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_ends_bell_and_next_alarm_rings_again() {
        let frames = Arc::new(LatestFrame::new());
        frames.publish(Frame::jpeg(vec![1]));
        let bell = Arc::new(TerminalBell::new(Duration::from_millis(100)));
        let config = MonitorConfig {
            drowsiness_threshold: 1,
            ..MonitorConfig::default()
        };
        let scheduler = Scheduler::new(
            config,
            frames,
            Arc::new(ScriptedClassifier::new(vec![Ok(Closed), Ok(Closed)])),
            bell.clone(),
        );

        scheduler.start().unwrap();
        settle().await;
        assert!(bell.is_ringing());

        scheduler.stop();
        assert!(bell.is_ringing(), "stop leaves the alert running");

        scheduler.start().unwrap();
        assert!(!scheduler.snapshot().alarm);
        assert!(!bell.is_ringing());

        settle().await;
        assert!(scheduler.snapshot().alarm);
        assert!(bell.is_ringing());

        scheduler.stop();
        scheduler.reset_alert();
        assert!(!bell.is_ringing());
    }

    #[tokio::test(start_paused = true)]
    async fn not_ready_leaves_alarmed_session_untouched() {
        let h = harness(ScriptedClassifier::new(vec![
            Ok(Closed),
            Ok(Closed),
            Ok(Closed),
            Err(failure()),
        ]));

        h.scheduler.start().unwrap();
        settle().await;
        next_cycle().await;
        next_cycle().await;
        next_cycle().await;

        let before = h.scheduler.snapshot();
        assert!(before.alarm);
        assert!(!before.active);
        assert!(before.error.is_some());

        h.frames.clear();
        assert_eq!(h.scheduler.start(), Err(AgentError::NotReady));
        settle().await;

        assert_eq!(h.scheduler.snapshot(), before);
        assert_eq!(h.sink.ends.load(Ordering::SeqCst), 0);
        assert_eq!(h.classifier.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_alert_while_stopped() {
        let h = harness(ScriptedClassifier::new(vec![Ok(Closed), Ok(Closed), Ok(Closed)]));
        let mut status = h.scheduler.subscribe();

        h.scheduler.start().unwrap();
        settle().await;
        next_cycle().await;
        next_cycle().await;
        h.scheduler.stop();

        h.scheduler.reset_alert();
        let snapshot = h.scheduler.snapshot();
        assert!(!snapshot.alarm);
        assert_eq!(snapshot.drowsy_count, 0);
        assert_eq!(snapshot.state, SystemState::Idle);
        assert_eq!(h.sink.ends.load(Ordering::SeqCst), 1);

        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), snapshot);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_frame_skips_without_stopping() {
        let h = harness(ScriptedClassifier::new(vec![Ok(Closed), Ok(Closed)]));

        h.scheduler.start().unwrap();
        settle().await;
        assert_eq!(h.scheduler.snapshot().drowsy_count, 1);

        h.frames.clear();
        next_cycle().await;
        next_cycle().await;

        let snapshot = h.scheduler.snapshot();
        assert!(snapshot.active);
        assert_eq!(snapshot.metrics.skipped_cycles, 2);
        assert_eq!(snapshot.drowsy_count, 1);
        assert_eq!(h.classifier.calls(), 1);

        h.frames.publish(Frame::jpeg(vec![9]));
        next_cycle().await;
        assert_eq!(h.scheduler.snapshot().drowsy_count, 2);
        assert_eq!(h.classifier.calls(), 2);
    }

    #[test]
    fn record_latency_tracks_budget() {
        let mut metrics = CycleMetrics::default();

        record_latency(&mut metrics, Duration::from_millis(40), INTERVAL);
        record_latency(&mut metrics, Duration::from_millis(2500), INTERVAL);

        assert_eq!(metrics.total_cycles, 2);
        assert_eq!(metrics.slow_cycles, 1);
        assert_eq!(metrics.worst_case_ms, 2500);
    }
}
