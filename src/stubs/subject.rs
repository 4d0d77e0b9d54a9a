use std::{
    future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::monitor::{
    domain::SubjectCommand,
    traits::process::{
        ExitOutcome, LaunchError, OutputLine, OutputLines, ProcessError, ProcessHandle,
        ProcessRunner,
    },
};

const SIGKILL: i32 = 9;

#[derive(Debug, Clone)]
struct ScriptStep {
    delay: Duration,
    line: OutputLine,
}

/// Scripted stand-in for a subject process: emits lines after fixed delays,
/// then exits (or hangs) the way it was told to.
#[derive(Debug, Clone)]
pub struct SubjectScript {
    steps: Vec<ScriptStep>,
    exit: Option<ExitOutcome>,
    linger_output: bool,
}

impl Default for SubjectScript {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            exit: Some(ExitOutcome::Exited(0)),
            linger_output: false,
        }
    }
}

impl SubjectScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(mut self, delay: Duration, text: &str) -> Self {
        self.steps.push(ScriptStep {
            delay,
            line: OutputLine::stdout(text),
        });
        self
    }

    pub fn stderr(mut self, delay: Duration, text: &str) -> Self {
        self.steps.push(ScriptStep {
            delay,
            line: OutputLine::stderr(text),
        });
        self
    }

    pub fn exit(mut self, outcome: ExitOutcome) -> Self {
        self.exit = Some(outcome);
        self
    }

    /// Never exit on its own.
    pub fn hang(mut self) -> Self {
        self.exit = None;
        self
    }

    /// Keep the output stream open after exiting, like an orphaned child
    /// still holding the pipe.
    pub fn linger_output(mut self) -> Self {
        self.linger_output = true;
        self
    }

    pub fn spawn(&self) -> StubProcess {
        self.spawn_counted(Arc::new(AtomicUsize::new(0)))
    }

    fn spawn_counted(&self, terminations: Arc<AtomicUsize>) -> StubProcess {
        let (line_tx, line_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = watch::channel(None);
        let exit_tx = Arc::new(exit_tx);

        let steps = self.steps.clone();
        let exit = self.exit;
        let linger = self.linger_output;
        let player_exit_tx = exit_tx.clone();

        let player = tokio::spawn(async move {
            for step in steps {
                tokio::time::sleep(step.delay).await;
                if line_tx.send(step.line).await.is_err() {
                    break;
                }
            }
            let Some(outcome) = exit else {
                return future::pending::<()>().await;
            };
            player_exit_tx.send_replace(Some(outcome));
            if linger {
                let _held = line_tx;
                future::pending::<()>().await;
            }
        });

        StubProcess {
            output: Some(line_rx),
            exit_tx,
            exit_rx,
            player,
            terminations,
        }
    }
}

#[derive(Debug)]
pub struct StubProcess {
    output: Option<OutputLines>,
    exit_tx: Arc<watch::Sender<Option<ExitOutcome>>>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    player: JoinHandle<()>,
    terminations: Arc<AtomicUsize>,
}

impl StubProcess {
    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ProcessHandle for StubProcess {
    fn id(&self) -> Option<u32> {
        None
    }

    fn take_output(&mut self) -> Option<OutputLines> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<ExitOutcome, ProcessError> {
        let outcome = *self
            .exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| ProcessError::Wait { msg: e.to_string() })?;
        outcome.ok_or_else(|| ProcessError::Wait {
            msg: "exit status missing".to_string(),
        })
    }

    async fn terminate(&mut self) -> Result<(), ProcessError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.player.abort();
        self.exit_tx.send_if_modified(|exit| {
            if exit.is_none() {
                *exit = Some(ExitOutcome::Signaled(Some(SIGKILL)));
                true
            } else {
                false
            }
        });
        Ok(())
    }
}

/// Runner that "launches" a script instead of a real executable.
#[derive(Debug, Clone)]
pub struct SubjectStub {
    script: Result<SubjectScript, LaunchError>,
    launched: Arc<Mutex<Vec<SubjectCommand>>>,
    terminations: Arc<AtomicUsize>,
}

impl SubjectStub {
    pub fn new(script: SubjectScript) -> Self {
        Self {
            script: Ok(script),
            launched: Arc::default(),
            terminations: Arc::default(),
        }
    }

    pub fn failing(err: LaunchError) -> Self {
        Self {
            script: Err(err),
            launched: Arc::default(),
            terminations: Arc::default(),
        }
    }

    pub fn launched(&self) -> Vec<SubjectCommand> {
        self.launched
            .lock()
            .map(|launched| launched.clone())
            .unwrap_or_default()
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ProcessRunner for SubjectStub {
    #[tracing::instrument]
    async fn start(
        &self,
        command: &SubjectCommand,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        if let Ok(mut launched) = self.launched.lock() {
            launched.push(command.clone());
        }
        let script = self.script.clone()?;
        tracing::debug!("Playing scripted subject: {:?}", script);
        Ok(Box::new(script.spawn_counted(self.terminations.clone())))
    }
}
