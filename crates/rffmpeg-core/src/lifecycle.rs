//! Process lifecycle: state record registration and termination signals.
//!
//! A [`Registration`] owns this process's state record and removes it when
//! dropped, so normal returns and error returns both clean up. Termination
//! signals are raced against the dispatch by [`run_until_terminated`]; the
//! losing future is dropped, the registration goes out of scope, and the
//! caller exits with the signal's conventional status.

use std::fmt;
use std::future::Future;

use rffmpeg_proto::SelectedTarget;
use tracing::{debug, info, warn};

use crate::tracker::{LoadTracker, TrackerError};

/// A state record claimed for the lifetime of this value.
pub struct Registration<'a, T: LoadTracker + ?Sized> {
    tracker: &'a T,
    pid: u32,
    claimed: String,
    released: bool,
}

impl<'a, T: LoadTracker + ?Sized> Registration<'a, T> {
    /// Writes the claim for `target`, making this process visible to snapshots.
    pub fn register(
        tracker: &'a T,
        pid: u32,
        target: &SelectedTarget,
    ) -> Result<Self, TrackerError> {
        let claimed = target.claim_name().to_string();
        tracker.claim(&claimed, pid)?;
        debug!(pid, host = %claimed, "Registered state record");
        Ok(Self {
            tracker,
            pid,
            claimed,
            released: false,
        })
    }

    pub fn claimed(&self) -> &str {
        &self.claimed
    }

    /// Removes the state record. Safe to call more than once.
    pub fn deregister(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.tracker.release(self.pid) {
            Ok(()) => debug!(pid = self.pid, "Removed state record"),
            Err(e) => warn!(pid = self.pid, "Failed to remove state record: {}", e),
        }
    }
}

impl<T: LoadTracker + ?Sized> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl<T: LoadTracker + ?Sized> fmt::Debug for Registration<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("pid", &self.pid)
            .field("claimed", &self.claimed)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// A termination signal that ends the dispatch early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
}

impl Termination {
    pub fn signal_number(self) -> i32 {
        match self {
            Termination::Hangup => 1,
            Termination::Interrupt => 2,
            Termination::Quit => 3,
            Termination::Terminate => 15,
        }
    }

    /// Conventional shell status for a process ended by this signal.
    pub fn exit_code(self) -> i32 {
        128 + self.signal_number()
    }

    pub fn name(self) -> &'static str {
        match self {
            Termination::Interrupt => "SIGINT",
            Termination::Terminate => "SIGTERM",
            Termination::Quit => "SIGQUIT",
            Termination::Hangup => "SIGHUP",
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a raced future ended.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome<T> {
    Completed(T),
    Terminated(Termination),
}

/// Listens for SIGINT, SIGTERM, SIGQUIT and SIGHUP.
///
/// Install it before registering so a signal that arrives between
/// registration and dispatch is still observed.
#[cfg(unix)]
pub struct SignalListener {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};

        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    /// Waits for the next termination signal.
    pub async fn recv(&mut self) -> Termination {
        tokio::select! {
            _ = self.interrupt.recv() => Termination::Interrupt,
            _ = self.terminate.recv() => Termination::Terminate,
            _ = self.quit.recv() => Termination::Quit,
            _ = self.hangup.recv() => Termination::Hangup,
        }
    }
}

#[cfg(not(unix))]
pub struct SignalListener;

#[cfg(not(unix))]
impl SignalListener {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> Termination {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Termination::Interrupt,
            Err(_) => std::future::pending().await,
        }
    }
}

impl fmt::Debug for SignalListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalListener").finish_non_exhaustive()
    }
}

/// Drives `fut` to completion unless a termination signal arrives first.
///
/// A future that is already finished wins over a pending signal. On a
/// signal `fut` is dropped; an in-flight child process is left to the
/// transport's own timeouts.
pub async fn run_until_terminated<F: Future>(
    signals: &mut SignalListener,
    fut: F,
) -> Outcome<F::Output> {
    tokio::select! {
        biased;
        output = fut => Outcome::Completed(output),
        termination = signals.recv() => {
            info!("Received {}, cleaning up", termination);
            Outcome::Terminated(termination)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{MemoryTracker, RecordId};
    use rffmpeg_proto::HostRecord;

    #[test]
    fn test_register_writes_claim() {
        let tracker = MemoryTracker::new();
        let target = SelectedTarget::Remote(HostRecord::new("gpu1", "10.0.0.5", "u", "/k"));

        let registration = Registration::register(&tracker, 42, &target).unwrap();
        assert_eq!(registration.claimed(), "gpu1");
        assert_eq!(tracker.snapshot().active("gpu1"), 1);
    }

    #[test]
    fn test_local_target_claims_localhost() {
        let tracker = MemoryTracker::new();
        let _registration = Registration::register(&tracker, 7, &SelectedTarget::Local).unwrap();
        assert_eq!(tracker.snapshot().active("localhost"), 1);
    }

    #[test]
    fn test_drop_removes_record() {
        let tracker = MemoryTracker::new();
        {
            let _registration =
                Registration::register(&tracker, 9, &SelectedTarget::Local).unwrap();
            assert!(tracker.contains(RecordId::Process(9)));
        }
        assert!(!tracker.contains(RecordId::Process(9)));
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let tracker = MemoryTracker::new();
        let mut registration =
            Registration::register(&tracker, 11, &SelectedTarget::Local).unwrap();

        registration.deregister();
        // Another process reusing the pid later must not be touched by our drop
        tracker.claim("other", 11).unwrap();
        registration.deregister();
        drop(registration);

        assert!(tracker.contains(RecordId::Process(11)));
    }

    #[test]
    fn test_record_removed_on_error_path() {
        fn failing_dispatch(tracker: &MemoryTracker) -> Result<(), String> {
            let _registration = Registration::register(tracker, 5, &SelectedTarget::Local)
                .map_err(|e| e.to_string())?;
            Err("spawn failed".to_string())
        }

        let tracker = MemoryTracker::new();
        assert!(failing_dispatch(&tracker).is_err());
        assert!(!tracker.contains(RecordId::Process(5)));
    }

    #[test]
    fn test_termination_exit_codes() {
        assert_eq!(Termination::Hangup.exit_code(), 129);
        assert_eq!(Termination::Interrupt.exit_code(), 130);
        assert_eq!(Termination::Quit.exit_code(), 131);
        assert_eq!(Termination::Terminate.exit_code(), 143);
        assert_eq!(Termination::Terminate.to_string(), "SIGTERM");
    }

    #[tokio::test]
    async fn test_run_until_terminated_completes() {
        let mut signals = SignalListener::install().unwrap();
        let outcome = run_until_terminated(&mut signals, async { 2 }).await;
        assert_eq!(outcome, Outcome::Completed(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_until_terminated_observes_signal() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let mut signals = SignalListener::install().unwrap();
        kill(Pid::this(), Signal::SIGHUP).unwrap();

        let outcome = run_until_terminated(&mut signals, std::future::pending::<()>()).await;
        assert_eq!(outcome, Outcome::Terminated(Termination::Hangup));
    }
}
