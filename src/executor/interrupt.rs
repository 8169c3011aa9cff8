//! Run cancellation
//!
//! Interrupts escalate a run through `Running → Draining → Finalized`. Any
//! number of [`InterruptHandle`] clones may feed the same run.

use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Running,
    /// No new dispatches; in-flight tasks get the grace period to finish
    Draining,
    /// Workers killed; whatever arrived is the result
    Finalized,
}

impl RunState {
    /// State after one more interrupt
    pub fn escalate(self) -> Self {
        match self {
            RunState::Running => RunState::Draining,
            RunState::Draining | RunState::Finalized => RunState::Finalized,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Draining => write!(f, "draining"),
            RunState::Finalized => write!(f, "finalized"),
        }
    }
}

/// Sends interrupts to a run
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    tx: mpsc::UnboundedSender<()>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        if self.tx.send(()).is_err() {
            debug!("Interrupt after the run finished");
        }
    }

    /// Forward every Ctrl-C to the run until the run ends
    pub fn listen_for_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Cannot listen for Ctrl-C: {}", e);
                    return;
                }
                if handle.tx.is_closed() {
                    return;
                }
                eprintln!();
                warn!("Interrupted");
                handle.interrupt();
            }
        })
    }
}

/// Receiving side, owned by the coordinator
#[derive(Debug)]
pub struct Interrupts {
    rx: mpsc::UnboundedReceiver<()>,
}

impl Interrupts {
    pub fn new() -> (InterruptHandle, Interrupts) {
        let (tx, rx) = mpsc::unbounded_channel();
        (InterruptHandle { tx }, Interrupts { rx })
    }

    /// Next interrupt; pending forever once every handle is gone
    pub async fn recv(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_escalation() {
        assert_eq!(RunState::Running.escalate(), RunState::Draining);
        assert_eq!(RunState::Draining.escalate(), RunState::Finalized);
        assert_eq!(RunState::Finalized.escalate(), RunState::Finalized);
        assert_eq!(RunState::Draining.to_string(), "draining");
    }

    #[tokio::test]
    async fn test_interrupts_delivered_from_clones() {
        let (handle, mut interrupts) = Interrupts::new();
        let other = handle.clone();
        handle.interrupt();
        other.interrupt();
        interrupts.recv().await;
        interrupts.recv().await;
    }

    #[tokio::test]
    async fn test_dropped_handles_never_fire() {
        let (handle, mut interrupts) = Interrupts::new();
        drop(handle);
        let waited = tokio::time::timeout(Duration::from_millis(50), interrupts.recv()).await;
        assert!(waited.is_err());
    }
}
