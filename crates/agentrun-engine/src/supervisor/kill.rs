//! Process-tree termination.
//!
//! Agents are spawned as process-group leaders, so signalling the negative pid
//! reaches every descendant. Windows has no process groups; `taskkill /T`
//! walks the tree instead.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

/// Delay between terminate and kill on timeout, and between interrupt and
/// terminate on a user stop.
pub const TERMINATE_GRACE: Duration = Duration::from_millis(1_200);

/// Delay between interrupt and kill on a user stop.
pub const KILL_DEADLINE: Duration = Duration::from_millis(2_600);

/// How hard to push when ending a process tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// Timeouts: terminate, then kill after [`TERMINATE_GRACE`].
    Forced,
    /// User stops: interrupt, terminate at [`TERMINATE_GRACE`], kill at [`KILL_DEADLINE`].
    Graceful,
}

/// Run the escalation ladder in the background.
///
/// The ladder keeps going after the leader exits, so descendants that ignored
/// earlier signals are still killed. It signals only the process group, whose
/// id cannot be reused while a member is alive, and ends early once the group
/// is empty.
pub fn terminate_process_tree(pid: u32, escalation: Escalation) -> JoinHandle<()> {
    tokio::spawn(async move {
        match escalation {
            Escalation::Forced => {
                if !platform::signal_group(pid, Signal::Terminate).await {
                    return;
                }
                tokio::time::sleep(TERMINATE_GRACE).await;
                platform::signal_group(pid, Signal::Kill).await;
            }
            Escalation::Graceful => {
                if !platform::signal_group(pid, Signal::Interrupt).await {
                    return;
                }
                tokio::time::sleep(TERMINATE_GRACE).await;
                if !platform::signal_group(pid, Signal::Terminate).await {
                    return;
                }
                tokio::time::sleep(KILL_DEADLINE - TERMINATE_GRACE).await;
                platform::signal_group(pid, Signal::Kill).await;
            }
        }
        debug!(pid, ?escalation, "Termination ladder finished");
    })
}

/// Kill a process tree immediately.
pub async fn kill_process_tree(pid: u32) {
    platform::signal_tree(pid, Signal::Kill).await;
}

/// Ask a process tree to stop (SIGINT on unix).
pub async fn interrupt_process_tree(pid: u32) {
    platform::signal_tree(pid, Signal::Interrupt).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupt,
    Terminate,
    Kill,
}

#[cfg(unix)]
mod platform {
    use super::{debug, Signal};

    fn raw(sig: Signal) -> libc::c_int {
        match sig {
            Signal::Interrupt => libc::SIGINT,
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }

    fn send(pid: libc::pid_t, sig: libc::c_int) -> bool {
        // SAFETY: kill(2) has no memory-safety preconditions; a stale or
        // foreign pid only yields ESRCH/EPERM.
        unsafe { libc::kill(pid, sig) == 0 }
    }

    fn checked(pid: u32) -> Option<libc::pid_t> {
        libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
    }

    /// Signal the process group led by `pid`. False once the group is empty.
    pub(super) async fn signal_group(pid: u32, sig: Signal) -> bool {
        let Some(pid) = checked(pid) else {
            return false;
        };
        let delivered = send(-pid, raw(sig));
        debug!(pid, signal = ?sig, delivered, "Signalled process group");
        delivered
    }

    /// Signal the group led by `pid`, falling back to the process itself.
    pub(super) async fn signal_tree(pid: u32, sig: Signal) -> bool {
        if signal_group(pid, sig).await {
            return true;
        }
        let Some(pid) = checked(pid) else {
            return false;
        };
        let delivered = send(pid, raw(sig));
        debug!(pid, signal = ?sig, delivered, "Signalled single process");
        delivered
    }
}

#[cfg(windows)]
mod platform {
    use super::{debug, Signal};
    use std::process::Stdio;
    use tokio::process::Command;

    // There is no soft terminate on Windows; every step but the interrupt
    // forces the tree down.
    pub(super) async fn signal_tree(pid: u32, sig: Signal) -> bool {
        let force = sig != Signal::Interrupt;
        let mut cmd = Command::new("taskkill");
        cmd.arg("/PID").arg(pid.to_string()).arg("/T");
        if force {
            cmd.arg("/F");
        }
        let ok = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false);
        debug!(pid, force, ok, "taskkill");
        ok
    }

    pub(super) async fn signal_group(pid: u32, sig: Signal) -> bool {
        signal_tree(pid, sig).await
    }
}
