// src/utils/streams.rs
use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use crate::config::defs::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// Reads all lines of a spawned child's stdout or stderr.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to drain.
///
/// # Returns
/// Vec of lines, newline stripped.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    match stream {
        ChildStream::Stdout => {
            let out = child.stdout.take().ok_or_else(|| anyhow!("Child stdout not piped"))?;
            read_lines(out).await
        }
        ChildStream::Stderr => {
            let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr not piped"))?;
            read_lines(err).await
        }
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> Result<Vec<String>> {
    let mut lines = BufReader::new(reader).lines();
    let mut out = Vec::new();
    while let Some(line) = lines.next_line().await? {
        out.push(line);
    }
    Ok(out)
}

/// Takes the child's stderr and drains it on its own task so a chatty tool never
/// blocks on a full pipe.
pub fn spawn_stderr_collector(child: &mut Child) -> Result<JoinHandle<Result<Vec<String>>>> {
    let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr not piped"))?;
    Ok(tokio::spawn(read_lines(err)))
}

/// Awaits a spawned task, folding a panic/cancel and the task's own error into PipelineError.
pub async fn join_with_error_handling<T>(
    handle: JoinHandle<Result<T, PipelineError>>,
) -> Result<T, PipelineError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(PipelineError::Other(anyhow!("Task failed to complete: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_read_child_output_to_vec() -> Result<()> {
        let mut child = Command::new("sh")
            .args(["-c", "printf 'one\\ntwo\\n'; echo err >&2"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let out = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
        let err = read_child_output_to_vec(&mut child, ChildStream::Stderr).await?;
        child.wait().await?;
        assert_eq!(out, vec!["one", "two"]);
        assert_eq!(err, vec!["err"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_spawn_stderr_collector() -> Result<()> {
        let mut child = Command::new("sh")
            .args(["-c", "echo a >&2; echo b >&2"])
            .stderr(Stdio::piped())
            .spawn()?;
        let handle = spawn_stderr_collector(&mut child)?;
        child.wait().await?;
        assert_eq!(handle.await??, vec!["a", "b"]);
        assert!(spawn_stderr_collector(&mut child).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_join_with_error_handling() {
        let ok = tokio::spawn(async { Ok::<u64, PipelineError>(7) });
        assert_eq!(join_with_error_handling(ok).await.unwrap(), 7);

        let bad = tokio::spawn(async { Err::<u64, _>(PipelineError::Resource("fifo".into())) });
        assert!(matches!(join_with_error_handling(bad).await, Err(PipelineError::Resource(_))));
    }
}
