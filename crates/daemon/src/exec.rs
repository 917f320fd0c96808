use std::path::Path;
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::error::OperationError;

/// Which pipe of the child carries the human-readable progress lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPipe {
    Stdout,
    Stderr,
}

/// Build a command for `program`, wrapped in `ionice -c3 nice -n19` when
/// `use_nice` is set so the child runs in the idle I/O class at the lowest
/// CPU priority.
pub fn niced_command(program: &Path, use_nice: bool) -> Command {
    if use_nice {
        let mut cmd = Command::new("ionice");
        cmd.arg("-c3").arg("nice").arg("-n19").arg(program);
        cmd
    } else {
        Command::new(program)
    }
}

/// Spawn a command, stream one pipe line-by-line to `on_line`, and wait for
/// it to exit. A non-zero exit code becomes an external-tool error carrying
/// the child's diagnostic output. No timeout is imposed: a hung tool hangs
/// the caller.
pub async fn run_streaming(
    mut cmd: Command,
    progress_pipe: ProgressPipe,
    mut on_line: impl FnMut(&str) + Send,
) -> Result<(), OperationError> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| OperationError::ExternalTool(format!("failed to spawn process: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OperationError::ExternalTool("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| OperationError::ExternalTool("failed to capture stderr".to_string()))?;

    // The other pipe is drained in the background so the child never blocks
    // on a full pipe buffer; its content feeds the error message.
    let (progress_tail, other_output) = match progress_pipe {
        ProgressPipe::Stdout => {
            let collector = tokio::spawn(collect_output(stderr));
            let tail = stream_lines(stdout, &mut on_line).await;
            (tail, collector.await.unwrap_or_default())
        }
        ProgressPipe::Stderr => {
            let collector = tokio::spawn(collect_output(stdout));
            let tail = stream_lines(stderr, &mut on_line).await;
            (tail, collector.await.unwrap_or_default())
        }
    };

    let status = child
        .wait()
        .await
        .map_err(|e| OperationError::ExternalTool(format!("failed to wait for process: {}", e)))?;

    if !status.success() {
        let mut diagnostics = other_output.trim().to_string();
        if diagnostics.is_empty() {
            diagnostics = progress_tail.join("\n");
        }
        return Err(OperationError::ExternalTool(format!(
            "process exited with code {}: {}",
            status.code().unwrap_or(-1),
            diagnostics
        )));
    }

    Ok(())
}

/// Feed non-empty lines to the callback, keeping a bounded tail for error
/// reporting.
async fn stream_lines<R: AsyncRead + Unpin>(
    reader: R,
    on_line: &mut (impl FnMut(&str) + Send),
) -> Vec<String> {
    let mut tail: Vec<String> = Vec::new();
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        on_line(&line);
        tail.push(line);
        if tail.len() > 50 {
            tail.remove(0);
        }
    }
    tail
}

async fn collect_output<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut buf = String::new();
    let mut reader = BufReader::new(reader);
    let _ = reader.read_to_string(&mut buf).await;
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_niced_command_wraps_program() {
        let cmd = niced_command(Path::new("rsync"), true);
        assert_eq!(cmd.as_std().get_program(), "ionice");
        let args: Vec<_> = cmd.as_std().get_args().collect();
        assert_eq!(args, ["-c3", "nice", "-n19", "rsync"]);
    }

    #[test]
    fn test_plain_command_is_unwrapped() {
        let cmd = niced_command(&PathBuf::from("/usr/bin/ffmpeg"), false);
        assert_eq!(cmd.as_std().get_program(), "/usr/bin/ffmpeg");
        assert_eq!(cmd.as_std().get_args().count(), 0);
    }

    #[tokio::test]
    async fn test_run_streaming_collects_lines() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'one\\ntwo\\n'");
        let mut seen = Vec::new();
        run_streaming(cmd, ProgressPipe::Stdout, |line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_run_streaming_reads_stderr_pipe() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo progress >&2");
        let mut seen = Vec::new();
        run_streaming(cmd, ProgressPipe::Stderr, |line| seen.push(line.to_string()))
            .await
            .unwrap();
        assert_eq!(seen, vec!["progress"]);
    }

    #[tokio::test]
    async fn test_run_streaming_nonzero_exit_is_error() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo boom >&2; exit 3");
        let err = run_streaming(cmd, ProgressPipe::Stdout, |_| {}).await.unwrap_err();
        match err {
            OperationError::ExternalTool(msg) => {
                assert!(msg.contains("code 3"));
                assert!(msg.contains("boom"));
            }
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_streaming_missing_binary_is_error() {
        let cmd = Command::new("/nonexistent/binary");
        let err = run_streaming(cmd, ProgressPipe::Stdout, |_| {}).await.unwrap_err();
        assert!(matches!(err, OperationError::ExternalTool(_)));
    }
}
