//! One dispatch from host selection to cleanup.

use std::fmt;

use rffmpeg_proto::ToolInvocation;
use tracing::{debug, error, info, warn};

use crate::catalog::HostCatalog;
use crate::dispatcher::Dispatcher;
use crate::lifecycle::{Outcome, Registration, SignalListener, run_until_terminated};
use crate::selector::select;
use crate::tracker::LoadTracker;

/// Phases a dispatching process moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    HostSelected,
    Dispatching,
    Completed,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Start => "start",
            Phase::HostSelected => "host-selected",
            Phase::Dispatching => "dispatching",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Selects a target, claims it, runs the tool, and cleans up.
///
/// Returns the exit code the process should terminate with. The state
/// record is gone by the time this returns, whichever way the dispatch ended.
pub async fn dispatch<T: LoadTracker + ?Sized>(
    dispatcher: &Dispatcher,
    catalog: &HostCatalog,
    tracker: &T,
    invocation: &ToolInvocation,
    pid: u32,
    signals: &mut SignalListener,
) -> i32 {
    info!("{}", "-".repeat(70));
    info!("Starting rffmpeg PID {}", pid);
    debug!(pid, phase = %Phase::Start, personality = %invocation.personality);

    info!("Determining target host");
    let view = tracker.snapshot();
    let target = select(catalog.hosts(), &view);
    info!("Selected target host '{}'", target);
    debug!(pid, phase = %Phase::HostSelected);

    // Load accounting is best effort; an unwritable state directory must not
    // stop the tool from running.
    let mut registration = match Registration::register(tracker, pid, &target) {
        Ok(registration) => Some(registration),
        Err(e) => {
            warn!("Failed to write state record, continuing untracked: {}", e);
            None
        }
    };

    debug!(pid, phase = %Phase::Dispatching);
    let outcome = run_until_terminated(signals, dispatcher.execute(&target, invocation)).await;

    let (phase, code) = match outcome {
        Outcome::Completed(Ok(code)) if code == 0 => (Phase::Completed, code),
        Outcome::Completed(Ok(code)) => (Phase::Failed, code),
        Outcome::Completed(Err(e)) => {
            error!("Dispatch failed: {}", e);
            (Phase::Failed, e.exit_code())
        }
        Outcome::Terminated(termination) => (Phase::Failed, termination.exit_code()),
    };

    if let Some(registration) = registration.as_mut() {
        registration.deregister();
    }
    debug!(pid, phase = %phase, code);
    info!("Finished rffmpeg PID {} with return code {}", pid, code);
    code
}
