//! Capture session: a dedicated acquisition thread that owns the camera,
//! publishes the latest frame and status, and emits one-shot capture
//! events when alignment has been held long enough.

use cardbooth_core::alignment::{AlignmentGate, AlignmentTracker, DEFAULT_DEBOUNCE_THRESHOLD};
use cardbooth_core::FaceLocator;
use cardbooth_hw::{Frame, FrameSource};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("capture session already running")]
    AlreadyRunning,
    #[error("previous capture loop has not released its device yet")]
    DeviceBusy,
    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Target period of the acquisition loop.
    pub frame_interval: Duration,
    /// Consecutive aligned frames required for a capture.
    pub debounce_threshold: u32,
    /// How long `stop` waits for the loop before detaching it.
    pub stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(30),
            debounce_threshold: DEFAULT_DEBOUNCE_THRESHOLD,
            stop_timeout: Duration::from_secs(2),
        }
    }
}

/// Snapshot of the acquisition loop, published after every iteration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStatus {
    pub running: bool,
    pub aligned: bool,
    pub consecutive: u32,
    pub frames_read: u64,
    pub read_failures: u64,
    pub last_error: Option<String>,
}

/// Fired once per debounce threshold crossing.
#[derive(Debug, Clone)]
pub struct CaptureEvent {
    /// The frame that completed the aligned run (unmirrored).
    pub frame: Arc<Frame>,
}

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct CaptureSession {
    config: SessionConfig,
    state: SessionState,
    worker: Option<Worker>,
    /// A loop that did not exit within the stop timeout. It still owns its
    /// device until its current read returns.
    orphan: Option<JoinHandle<()>>,
    frame_tx: Arc<watch::Sender<Option<Arc<Frame>>>>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
}

impl CaptureSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            worker: None,
            orphan: None,
            frame_tx: Arc::new(watch::channel(None).0),
            status_tx: Arc::new(watch::channel(SessionStatus::default()).0),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Watch the latest-frame slot. Readers get a shared handle to an
    /// immutable frame; the loop replaces the whole slot each iteration.
    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frame_tx.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Hand `source` to a new acquisition thread.
    ///
    /// The thread becomes the only reader of the device and releases it
    /// when it exits. Returns the receiving end of the capture events.
    pub fn start<S, L>(
        &mut self,
        source: S,
        gate: AlignmentGate<L>,
    ) -> Result<mpsc::UnboundedReceiver<CaptureEvent>, SessionError>
    where
        S: FrameSource + 'static,
        L: FaceLocator + Send + 'static,
    {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyRunning);
        }
        if let Some(orphan) = self.orphan.take() {
            if !orphan.is_finished() {
                self.orphan = Some(orphan);
                return Err(SessionError::DeviceBusy);
            }
            if orphan.join().is_err() {
                tracing::warn!("detached capture loop had panicked");
            }
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let ctx = LoopContext {
            stop: Arc::clone(&stop),
            frame_interval: self.config.frame_interval,
            tracker: AlignmentTracker::new(self.config.debounce_threshold),
            frame_tx: Arc::clone(&self.frame_tx),
            status_tx: Arc::clone(&self.status_tx),
            events: event_tx,
        };

        tracing::info!(
            source = %source.describe(),
            threshold = self.config.debounce_threshold,
            interval_ms = self.config.frame_interval.as_millis() as u64,
            "starting capture session"
        );

        let handle = std::thread::Builder::new()
            .name("cardbooth-capture".into())
            .spawn(move || run_loop(source, gate, ctx))?;

        self.worker = Some(Worker { stop, handle });
        self.state = SessionState::Running;
        Ok(event_rx)
    }

    /// Signal the loop to stop and wait up to the stop timeout for it to
    /// exit and release its device.
    ///
    /// Returns `false` when the loop was still inside a read at the
    /// deadline; it is then detached and the session refuses to start
    /// again until it has finished.
    pub fn stop(&mut self) -> bool {
        let Some(worker) = self.worker.take() else {
            self.state = SessionState::Idle;
            return true;
        };
        self.state = SessionState::Stopping;
        worker.stop.store(true, Ordering::Release);

        let deadline = Instant::now() + self.config.stop_timeout;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        let joined = if worker.handle.is_finished() {
            if worker.handle.join().is_err() {
                tracing::warn!("capture loop panicked");
            }
            tracing::info!("capture session stopped");
            true
        } else {
            tracing::warn!(
                timeout_ms = self.config.stop_timeout.as_millis() as u64,
                "capture loop did not exit in time; detaching"
            );
            self.orphan = Some(worker.handle);
            false
        };

        self.state = SessionState::Idle;
        joined
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

struct LoopContext {
    stop: Arc<AtomicBool>,
    frame_interval: Duration,
    tracker: AlignmentTracker,
    frame_tx: Arc<watch::Sender<Option<Arc<Frame>>>>,
    status_tx: Arc<watch::Sender<SessionStatus>>,
    events: mpsc::UnboundedSender<CaptureEvent>,
}

/// Publishes the stopped status when the loop exits, including by panic.
struct LoopExit<'a> {
    status_tx: &'a watch::Sender<SessionStatus>,
}

impl Drop for LoopExit<'_> {
    fn drop(&mut self) {
        let panicked = std::thread::panicking();
        self.status_tx.send_modify(|s| {
            s.running = false;
            s.aligned = false;
            s.consecutive = 0;
            if panicked {
                s.last_error = Some("capture loop panicked".into());
            }
        });
        if panicked {
            tracing::error!("capture loop panicked");
        }
    }
}

fn run_loop<S: FrameSource, L: FaceLocator>(
    source: S,
    mut gate: AlignmentGate<L>,
    mut ctx: LoopContext,
) {
    let status_tx = Arc::clone(&ctx.status_tx);
    let _exit = LoopExit {
        status_tx: &status_tx,
    };
    // Bound after the guard so an unwinding loop releases the device first.
    let mut source = source;

    let mut status = SessionStatus {
        running: true,
        ..SessionStatus::default()
    };
    ctx.status_tx.send_replace(status.clone());

    while !ctx.stop.load(Ordering::Acquire) {
        let tick = Instant::now();

        match source.read_frame() {
            Ok(frame) => {
                status.frames_read += 1;
                let frame = Arc::new(frame);
                ctx.frame_tx.send_replace(Some(Arc::clone(&frame)));

                let result = gate.evaluate(&frame);
                let fired = ctx.tracker.observe(result.aligned);
                status.aligned = result.aligned;
                status.consecutive = ctx.tracker.consecutive();

                if fired {
                    tracing::info!(seq = frame.sequence, "alignment held; capture triggered");
                    if ctx.events.send(CaptureEvent { frame }).is_err() {
                        tracing::debug!("capture event dropped; no consumer");
                    }
                }
            }
            Err(e) => {
                status.read_failures += 1;
                status.last_error = Some(e.to_string());
                tracing::debug!(
                    error = %e,
                    failures = status.read_failures,
                    "frame read failed"
                );
            }
        }
        ctx.status_tx.send_replace(status.clone());

        if let Some(rest) = ctx.frame_interval.checked_sub(tick.elapsed()) {
            std::thread::sleep(rest);
        }
    }

    let described = source.describe();
    drop(source);
    tracing::debug!(source = %described, "capture loop released device");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardbooth_core::detector::DetectorError;
    use cardbooth_core::BoundingBox;
    use cardbooth_hw::CameraError;

    const SIZE: u32 = 300;

    /// Produces 300×300 grey frames; every `fail_every`-th read fails.
    struct FakeSource {
        reads: u32,
        fail_every: Option<u32>,
        read_delay: Duration,
        released: Arc<AtomicBool>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                reads: 0,
                fail_every: None,
                read_delay: Duration::ZERO,
                released: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl FrameSource for FakeSource {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            if !self.read_delay.is_zero() {
                std::thread::sleep(self.read_delay);
            }
            self.reads += 1;
            if self.fail_every.is_some_and(|n| self.reads % n == 0) {
                return Err(CameraError::CaptureFailed("dropped buffer".into()));
            }
            let data = vec![128; (SIZE * SIZE * 3) as usize];
            Ok(Frame::from_rgb(data, SIZE, SIZE, self.reads).unwrap())
        }
    }

    impl Drop for FakeSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Reports a centred face while the script says so, then nothing.
    struct ScriptedLocator {
        script: Vec<bool>,
        calls: usize,
    }

    impl FaceLocator for ScriptedLocator {
        fn locate(
            &mut self,
            _gray: &[u8],
            width: u32,
            height: u32,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            let aligned = self.script.get(self.calls).copied().unwrap_or(false);
            self.calls += 1;
            if !aligned {
                return Ok(Vec::new());
            }
            Ok(vec![BoundingBox {
                x: width as f32 / 2.0 - 60.0,
                y: height as f32 / 2.0 - 60.0,
                width: 120.0,
                height: 120.0,
                confidence: 0.9,
            }])
        }
    }

    /// Fails hard on the third frame.
    struct PanickingLocator {
        calls: usize,
    }

    impl FaceLocator for PanickingLocator {
        fn locate(
            &mut self,
            _gray: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<BoundingBox>, DetectorError> {
            self.calls += 1;
            assert!(self.calls < 3, "inference backend crashed");
            Ok(Vec::new())
        }
    }

    fn gate(script: Vec<bool>) -> AlignmentGate<ScriptedLocator> {
        AlignmentGate::new(ScriptedLocator { script, calls: 0 })
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            frame_interval: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    fn wait_for(session: &CaptureSession, pred: impl Fn(&SessionStatus) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !pred(&session.status()) {
            let status = session.status();
            assert!(Instant::now() < deadline, "timed out; status = {status:?}");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_interrupted_run_then_full_run_fires_once() {
        // 29 aligned, 1 not, 30 aligned, then never aligned again.
        let mut script = vec![true; 29];
        script.push(false);
        script.extend(std::iter::repeat(true).take(30));

        let mut session = CaptureSession::new(fast_config());
        let mut events = session.start(FakeSource::new(), gate(script)).unwrap();
        wait_for(&session, |s| s.frames_read >= 100);
        assert!(session.stop());

        let event = events.try_recv().unwrap();
        assert_eq!(event.frame.sequence, 60);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_sustained_alignment_fires_every_threshold() {
        let mut session = CaptureSession::new(SessionConfig {
            debounce_threshold: 5,
            ..fast_config()
        });
        let mut events = session.start(FakeSource::new(), gate(vec![true; 15])).unwrap();
        wait_for(&session, |s| s.frames_read >= 30);
        session.stop();

        let seqs: Vec<u32> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.frame.sequence)
            .collect();
        assert_eq!(seqs, vec![5, 10, 15]);
    }

    #[test]
    fn test_read_failures_are_counted_not_fatal() {
        let mut source = FakeSource::new();
        source.fail_every = Some(2);
        let mut session = CaptureSession::new(fast_config());
        let _events = session.start(source, gate(Vec::new())).unwrap();
        wait_for(&session, |s| s.read_failures >= 10 && s.frames_read >= 10);

        let status = session.status();
        assert!(status.running);
        let last_error = status.last_error.as_deref();
        assert_eq!(last_error, Some("capture failed: dropped buffer"));
        let latest = session.subscribe_frames().borrow().clone();
        assert_eq!(latest.map(|f| f.width), Some(SIZE));
        session.stop();
    }

    #[test]
    fn test_stop_releases_device_and_publishes_idle_status() {
        let source = FakeSource::new();
        let released = Arc::clone(&source.released);
        let mut session = CaptureSession::new(fast_config());
        let _events = session.start(source, gate(Vec::new())).unwrap();
        assert_eq!(session.state(), SessionState::Running);
        wait_for(&session, |s| s.frames_read >= 1);

        assert!(session.stop());
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.status().running);
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut session = CaptureSession::new(fast_config());
        let _events = session.start(FakeSource::new(), gate(Vec::new())).unwrap();
        let second = session.start(FakeSource::new(), gate(Vec::new()));
        assert!(matches!(second, Err(SessionError::AlreadyRunning)));
        session.stop();
    }

    #[test]
    fn test_slow_read_detaches_and_blocks_restart_until_released() {
        let mut slow = FakeSource::new();
        slow.read_delay = Duration::from_millis(400);
        let released = Arc::clone(&slow.released);

        let mut session = CaptureSession::new(SessionConfig {
            stop_timeout: Duration::from_millis(50),
            ..fast_config()
        });
        let _events = session.start(slow, gate(Vec::new())).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert!(!session.stop());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(matches!(
            session.start(FakeSource::new(), gate(Vec::new())),
            Err(SessionError::DeviceBusy)
        ));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !released.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        // Give the detached thread a moment to finish after dropping the source.
        std::thread::sleep(Duration::from_millis(50));

        let _events = session.start(FakeSource::new(), gate(Vec::new())).unwrap();
        assert!(session.stop());
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let mut session = CaptureSession::new(fast_config());
        assert!(session.stop());
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_loop_panic_is_visible_in_status() {
        let source = FakeSource::new();
        let released = Arc::clone(&source.released);
        let mut session = CaptureSession::new(fast_config());
        let _events = session
            .start(source, AlignmentGate::new(PanickingLocator { calls: 0 }))
            .unwrap();

        wait_for(&session, |s| !s.running && s.frames_read >= 2);
        let status = session.status();
        assert_eq!(status.frames_read, 2);
        assert_eq!(status.last_error.as_deref(), Some("capture loop panicked"));
        assert!(released.load(Ordering::SeqCst));

        assert!(session.stop());
        assert_eq!(session.state(), SessionState::Idle);
    }
}
