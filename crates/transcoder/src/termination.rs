//! Stop requests and the state machine that turns them into one kill.
//!
//! Every cancellation source (OS signal, user skip, early-abort heuristic)
//! writes a [`StopRequest`] into one channel. The coordinator acts on the
//! first request only and then closes the channel.

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use crate::supervisor::Supervisor;

/// Room for every source to deliver once without blocking
const STOP_CHANNEL_CAPACITY: usize = 4;

/// Why a job was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    UserSkip,
    OsSignal,
    HeuristicAbort,
}

/// Cloneable producer side of the stop channel
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: mpsc::Sender<StopRequest>,
}

impl StopHandle {
    /// Ask the job to stop. Never blocks; returns false when the request can
    /// no longer matter (job already decided or channel full).
    pub fn request(&self, reason: StopRequest) -> bool {
        match self.tx.try_send(reason) {
            Ok(()) => {
                debug!("Stop requested: {:?}", reason);
                true
            }
            Err(e) => {
                debug!("Stop request {:?} ignored: {}", reason, e);
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    StopRequested(StopRequest),
    Killed(StopRequest),
    CompletedNormally,
}

impl TerminationState {
    pub fn was_killed(&self) -> bool {
        matches!(self, TerminationState::Killed(_))
    }

    pub fn was_user_skipped(&self) -> bool {
        matches!(self, TerminationState::Killed(StopRequest::UserSkip))
    }
}

/// Single consumer of stop requests for one job
#[derive(Debug)]
pub struct TerminationCoordinator {
    state: TerminationState,
    rx: mpsc::Receiver<StopRequest>,
}

impl TerminationCoordinator {
    pub fn new() -> (Self, StopHandle) {
        let (tx, rx) = mpsc::channel(STOP_CHANNEL_CAPACITY);
        let coordinator = Self { state: TerminationState::Running, rx };
        (coordinator, StopHandle { tx })
    }

    pub fn state(&self) -> TerminationState {
        self.state
    }

    /// Run until the encoder exits on its own or the first stop request has
    /// been carried out. Returns the final state; the process is reaped and,
    /// if killed, its temp output removed.
    pub async fn run(&mut self, supervisor: &mut Supervisor) -> TerminationState {
        if self.state != TerminationState::Running {
            return self.state;
        }

        let request = tokio::select! {
            biased;
            Some(request) = self.rx.recv() => Some(request),
            _ = supervisor.wait() => None,
        };
        self.rx.close();

        match request {
            None => {
                self.state = TerminationState::CompletedNormally;
            }
            Some(request) => {
                self.state = TerminationState::StopRequested(request);
                info!("Stopping ffmpeg: {:?}", request);
                supervisor.kill().await;
                self.state = TerminationState::Killed(request);
            }
        }

        // Anything queued behind the winning request is dropped here
        while let Ok(late) = self.rx.try_recv() {
            debug!("Ignoring late stop request: {:?}", late);
        }

        self.state
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl-C outside unix)
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// Forward the first host termination signal as [`StopRequest::OsSignal`]
pub fn spawn_signal_listener(stop: StopHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        match shutdown_signal().await {
            Ok(()) => {
                warn!("Termination signal received");
                stop.request(StopRequest::OsSignal);
            }
            Err(e) => warn!("Could not listen for termination signals: {}", e),
        }
    })
}

/// Forward a shared shutdown flag as [`StopRequest::OsSignal`].
///
/// The flag keeps its value, so a shutdown raised before this is spawned is
/// forwarded immediately. A dropped sender without shutdown forwards nothing.
pub fn spawn_shutdown_forwarder(mut shutdown: watch::Receiver<bool>, stop: StopHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        if shutdown.wait_for(|down| *down).await.is_ok() {
            stop.request(StopRequest::OsSignal);
        }
    })
}

/// Forward a `true` from the skip channel as [`StopRequest::UserSkip`]
pub fn spawn_skip_listener(skip: oneshot::Receiver<bool>, stop: StopHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        match skip.await {
            Ok(true) => {
                info!("Skip requested");
                stop.request(StopRequest::UserSkip);
            }
            Ok(false) => debug!("Skip channel delivered false, ignoring"),
            Err(_) => debug!("Skip channel closed without a request"),
        }
    })
}

/// Aborts the wrapped listener tasks when dropped
#[derive(Debug, Default)]
pub struct ListenerGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerGuard {
    pub fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
