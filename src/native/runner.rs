use std::{io::ErrorKind, process::Stdio};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::{Child, Command},
    sync::mpsc::{self, Sender},
};

use crate::monitor::{
    domain::SubjectCommand,
    traits::process::{
        ExitOutcome, LaunchError, OutputLine, OutputLines, OutputSource, ProcessError,
        ProcessHandle, ProcessRunner,
    },
};

const OUTPUT_BUFFER_LINES: usize = 256;
/// Longer lines are split into chunks of this size.
pub const MAX_LINE_BYTES: u64 = 64 * 1024;

#[derive(Clone, Debug, Default)]
pub struct NativeRunner;

impl NativeRunner {
    pub fn new() -> Self {
        NativeRunner
    }
}

#[async_trait::async_trait]
impl ProcessRunner for NativeRunner {
    #[tracing::instrument]
    async fn start(
        &self,
        command: &SubjectCommand,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        let path = command.program.display().to_string();

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The subject leads its own process group so terminate reaches its children.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            ErrorKind::NotFound => LaunchError::NotFound { path: path.clone() },
            _ => LaunchError::SpawnFailed {
                path: path.clone(),
                msg: e.to_string(),
            },
        })?;

        let (line_tx, line_rx) = mpsc::channel(OUTPUT_BUFFER_LINES);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, OutputSource::Stdout, line_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, OutputSource::Stderr, line_tx));
        }

        let group = child.id();
        tracing::debug!("Spawned subject {} with pid {:?}", path, group);
        Ok(Box::new(NativeProcess {
            child,
            group,
            output: Some(line_rx),
        }))
    }
}

/// Forwards one pipe line by line until EOF. Invalid UTF-8 is replaced
/// rather than dropped, and lines longer than [`MAX_LINE_BYTES`] arrive in
/// pieces.
async fn pump_lines<R>(reader: R, source: OutputSource, line_tx: Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match (&mut reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut buf)
            .await
        {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                let line = OutputLine {
                    source: source.clone(),
                    text,
                };
                if line_tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!("Failed to read subject {:?}: {}", source, err);
                break;
            }
        }
    }
}

#[derive(Debug)]
pub struct NativeProcess {
    child: Child,
    /// Process group led by the subject, recorded at spawn.
    group: Option<u32>,
    output: Option<OutputLines>,
}

#[async_trait::async_trait]
impl ProcessHandle for NativeProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    fn take_output(&mut self) -> Option<OutputLines> {
        self.output.take()
    }

    async fn wait(&mut self) -> Result<ExitOutcome, ProcessError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ProcessError::Wait { msg: e.to_string() })?;

        Ok(match status.code() {
            Some(code) => ExitOutcome::Exited(code),
            None => ExitOutcome::Signaled(signal_of(&status)),
        })
    }

    /// Kills the subject together with everything left in its process group.
    async fn terminate(&mut self) -> Result<(), ProcessError> {
        kill_group(self.group)?;
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(ProcessError::Terminate { msg: e.to_string() }),
        }
    }
}

#[cfg(unix)]
fn kill_group(group: Option<u32>) -> Result<(), ProcessError> {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(group) = group.and_then(|id| i32::try_from(id).ok()) else {
        return Ok(());
    };
    match killpg(Pid::from_raw(group), Signal::SIGKILL) {
        // Group already empty.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(ProcessError::Terminate {
            msg: format!("failed to kill process group {}: {}", group, errno),
        }),
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>) -> Result<(), ProcessError> {
    Ok(())
}

#[cfg(unix)]
fn signal_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn signal_of(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    #[cfg(target_os = "linux")]
    use crate::stubs::host::{gone_within, is_running};

    fn sh(script: &str) -> SubjectCommand {
        SubjectCommand::new("/bin/sh").args(["-c", script])
    }

    async fn collect(mut lines: OutputLines) -> Vec<OutputLine> {
        let mut collected = Vec::new();
        while let Some(line) = lines.recv().await {
            collected.push(line);
        }
        collected
    }

    #[tokio::test]
    async fn test_start_captures_stdout_and_exit_code() {
        let mut handle = NativeRunner::new()
            .start(&sh("echo first; printf 'second\\r\\n'; exit 4"))
            .await
            .expect("sh should start");

        let output = handle.take_output().unwrap();
        assert!(handle.take_output().is_none());

        assert_eq!(handle.wait().await, Ok(ExitOutcome::Exited(4)));
        let lines = collect(output).await;
        assert_eq!(
            lines,
            vec![OutputLine::stdout("first"), OutputLine::stdout("second")]
        );
    }

    #[tokio::test]
    async fn test_stderr_is_tagged() {
        let mut handle = NativeRunner::new()
            .start(&sh("echo oops >&2"))
            .await
            .unwrap();
        let output = handle.take_output().unwrap();

        assert_eq!(handle.wait().await, Ok(ExitOutcome::Exited(0)));
        assert_eq!(collect(output).await, vec![OutputLine::stderr("oops")]);
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let result = NativeRunner::new()
            .start(&SubjectCommand::new("/definitely/not/a/subject"))
            .await;

        assert!(matches!(result, Err(LaunchError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_non_executable_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let result = NativeRunner::new()
            .start(&SubjectCommand::new(file.path()))
            .await;

        assert!(matches!(result, Err(LaunchError::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn test_long_lines_are_split() {
        let mut handle = NativeRunner::new()
            .start(&sh("head -c 200000 /dev/zero | tr '\\0' x; echo; echo tail"))
            .await
            .unwrap();
        let output = handle.take_output().unwrap();

        assert_eq!(handle.wait().await, Ok(ExitOutcome::Exited(0)));
        let lines = collect(output).await;
        assert_eq!(lines.len(), 5);
        assert!(
            lines
                .iter()
                .all(|line| line.text.len() as u64 <= MAX_LINE_BYTES)
        );
        let total: usize = lines[..4].iter().map(|line| line.text.len()).sum();
        assert_eq!(total, 200_000);
        assert_eq!(lines[4], OutputLine::stdout("tail"));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_kills_the_whole_group() {
        let mut handle = NativeRunner::new()
            .start(&sh("sleep 30 & echo $!; wait"))
            .await
            .unwrap();
        let mut output = handle.take_output().unwrap();
        let grandchild: u32 = output.recv().await.unwrap().text.parse().unwrap();
        assert!(is_running(grandchild));

        assert_eq!(handle.terminate().await, Ok(()));
        assert_eq!(handle.wait().await, Ok(ExitOutcome::Signaled(Some(9))));

        assert!(gone_within(grandchild, Duration::from_secs(2)).await);
        // Both pipe ends are closed once the group is gone.
        let rest = tokio::time::timeout(Duration::from_secs(2), collect(output)).await;
        assert_eq!(rest.map(|lines| lines.is_empty()), Ok(true));
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let mut handle = NativeRunner::new().start(&sh("exec sleep 30")).await.unwrap();

        assert_eq!(handle.terminate().await, Ok(()));
        let exit = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("killed subject should be reaped");
        assert_eq!(exit, Ok(ExitOutcome::Signaled(Some(9))));

        assert_eq!(handle.terminate().await, Ok(()));
    }
}
