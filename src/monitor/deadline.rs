use std::{fmt, future, time::Duration};

use tokio::{
    sync::watch,
    time::{Instant, sleep_until, timeout},
};

use crate::monitor::traits::process::{ExitOutcome, ProcessError, ProcessHandle};

/// How long a terminated subject gets to be reaped before we give up on it.
const REAP_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TripReason {
    Overall { timeout_ms: u64 },
    /// The heartbeat after `after_sequence` never arrived in time.
    Stalled { after_sequence: u32 },
}

impl fmt::Display for TripReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TripReason::Overall { timeout_ms } => {
                write!(f, "overall deadline of {}ms exceeded", timeout_ms)
            }
            TripReason::Stalled { after_sequence } => write!(
                f,
                "no progress within the allowed window after heartbeat #{}",
                after_sequence
            ),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SupervisorState {
    Armed,
    Tripped(TripReason),
    Disarmed,
}

/// Latest point in time by which the subject must show progress again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StallDeadline {
    pub after_sequence: u32,
    pub at: Instant,
}

pub type StallUpdates = watch::Receiver<Option<StallDeadline>>;

#[derive(Debug)]
pub struct Supervision {
    pub state: SupervisorState,
    pub exit: Result<ExitOutcome, ProcessError>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct DeadlineSupervisor {
    overall: Duration,
    state: SupervisorState,
    stall_updates: Option<StallUpdates>,
}

impl DeadlineSupervisor {
    pub fn new(overall: Duration) -> Self {
        Self {
            overall,
            state: SupervisorState::Armed,
            stall_updates: None,
        }
    }

    pub fn with_stall_updates(self, stall_updates: StallUpdates) -> Self {
        Self {
            stall_updates: Some(stall_updates),
            ..self
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Waits for the subject to exit, killing it if a deadline passes first.
    /// `started` is when the run began; the overall deadline counts from there.
    #[tracing::instrument(skip(self, handle), fields(pid = ?handle.id()))]
    pub async fn supervise(
        &mut self,
        handle: &mut dyn ProcessHandle,
        started: Instant,
    ) -> Supervision {
        let deadline = started + self.overall;
        let mut stall: Option<StallDeadline> = None;
        let mut updates = self.stall_updates.take();

        let trip = loop {
            tokio::select! {
                biased;

                exit = handle.wait() => {
                    self.state = SupervisorState::Disarmed;
                    tracing::debug!("Subject finished before deadline: {:?}", exit);
                    return Supervision {
                        state: self.state,
                        exit,
                        elapsed: started.elapsed(),
                    };
                }
                _ = sleep_until(deadline) => {
                    break TripReason::Overall {
                        timeout_ms: self.overall.as_millis() as u64,
                    };
                }
                _ = sleep_until_stalled(stall) => {
                    let after_sequence = stall.map(|s| s.after_sequence).unwrap_or_default();
                    break TripReason::Stalled { after_sequence };
                }
                update = next_stall_update(updates.as_mut()) => match update {
                    Some(next) => stall = next,
                    None => updates = None,
                },
            }
        };

        self.state = SupervisorState::Tripped(trip);
        tracing::warn!("Deadline tripped: {}", trip);

        if let Err(err) = handle.terminate().await {
            tracing::error!("Failed to terminate subject: {}", err);
        }
        let exit = match timeout(REAP_GRACE, handle.wait()).await {
            Ok(exit) => exit,
            Err(_) => Err(ProcessError::Wait {
                msg: format!("subject not reaped within {}ms of kill", REAP_GRACE.as_millis()),
            }),
        };

        Supervision {
            state: self.state,
            exit,
            elapsed: started.elapsed(),
        }
    }
}

async fn sleep_until_stalled(stall: Option<StallDeadline>) {
    match stall {
        Some(stall) => sleep_until(stall.at).await,
        None => future::pending().await,
    }
}

/// Resolves with the next published stall deadline, or `None` once the
/// publisher is gone. Never resolves when there is no publisher at all.
async fn next_stall_update(updates: Option<&mut StallUpdates>) -> Option<Option<StallDeadline>> {
    let Some(updates) = updates else {
        return future::pending().await;
    };
    match updates.changed().await {
        Ok(()) => Some(*updates.borrow_and_update()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stubs::subject::SubjectScript;

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_on_normal_exit() {
        let mut handle = SubjectScript::new()
            .line(Duration::from_millis(100), "12:00:00.000 SLEEPING FOR 3 SECONDS")
            .exit(ExitOutcome::Exited(0))
            .spawn();

        let mut supervisor = DeadlineSupervisor::new(Duration::from_secs(5));
        assert_eq!(supervisor.state(), SupervisorState::Armed);

        let supervision = supervisor.supervise(&mut handle, Instant::now()).await;

        assert_eq!(supervision.state, SupervisorState::Disarmed);
        assert_eq!(supervision.exit, Ok(ExitOutcome::Exited(0)));
        assert_eq!(handle.terminations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_on_hung_subject() {
        let mut handle = SubjectScript::new().hang().spawn();
        let started = Instant::now();

        let mut supervisor = DeadlineSupervisor::new(Duration::from_millis(1500));
        let supervision = supervisor.supervise(&mut handle, started).await;

        assert_eq!(
            supervision.state,
            SupervisorState::Tripped(TripReason::Overall { timeout_ms: 1500 })
        );
        assert_eq!(supervision.elapsed, Duration::from_millis(1500));
        assert!(matches!(supervision.exit, Ok(ExitOutcome::Signaled(_))));
        assert_eq!(handle.terminations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trips_on_stall_deadline() {
        let mut handle = SubjectScript::new().hang().spawn();
        let started = Instant::now();
        let (stall_tx, stall_rx) = watch::channel(None);

        let mut supervisor =
            DeadlineSupervisor::new(Duration::from_secs(60)).with_stall_updates(stall_rx);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            stall_tx.send_replace(Some(StallDeadline {
                after_sequence: 1,
                at: Instant::now() + Duration::from_millis(300),
            }));
            // Publisher goes away; the last deadline must still hold.
        });

        let supervision = supervisor.supervise(&mut handle, started).await;

        assert_eq!(
            supervision.state,
            SupervisorState::Tripped(TripReason::Stalled { after_sequence: 1 })
        );
        assert_eq!(supervision.elapsed, Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_after_exit_is_harmless() {
        let mut handle = SubjectScript::new().exit(ExitOutcome::Exited(3)).spawn();

        assert_eq!(handle.wait().await, Ok(ExitOutcome::Exited(3)));
        assert_eq!(handle.terminate().await, Ok(()));
        assert_eq!(handle.terminate().await, Ok(()));
        assert_eq!(handle.wait().await, Ok(ExitOutcome::Exited(3)));
    }
}
