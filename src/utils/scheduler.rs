// Bounded concurrent execution of external tool jobs.
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use anyhow::anyhow;
use futures::future::join_all;
use log::{debug, info, warn};
use tokio::process::Command;
use tokio::sync::Semaphore;
use crate::config::defs::PipelineError;
use crate::utils::command::DatabaseJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub name: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub name: String,
    pub command: String,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct BatchReport {
    pub results: Vec<JobResult>,
    /// Highest number of jobs observed running at the same time.
    pub peak_running: usize,
}

/// Runs jobs with at most `limit` external processes alive at once.
///
/// Every job is allowed to finish; if any of them failed the whole batch is
/// reported as one ToolFailure listing each failing command and exit code.
///
/// # Arguments
///
/// * `jobs` - Jobs in the order they should be started.
/// * `limit` - Maximum concurrently running processes, >= 1.
///
/// # Returns
/// BatchReport with per-job results in input order.
pub async fn run_jobs(jobs: Vec<DatabaseJob>, limit: usize) -> Result<BatchReport, PipelineError> {
    if limit == 0 {
        return Err(PipelineError::Configuration("Process limit must be at least 1".to_string()));
    }
    if jobs.is_empty() {
        return Ok(BatchReport { results: Vec::new(), peak_running: 0 });
    }

    info!("Scheduling {} job(s), at most {} at a time", jobs.len(), limit);
    let semaphore = Arc::new(Semaphore::new(limit));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job| {
            let semaphore = semaphore.clone();
            let running = running.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                debug!("[{}] {:?}", job.name, JobState::Pending);
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| anyhow!("Scheduler semaphore closed: {}", e))?;

                let now_running = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now_running, Ordering::SeqCst);
                debug!("[{}] {:?} ({} running)", job.name, JobState::Running, now_running);

                let result = run_job(&job).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<JobResult, anyhow::Error>(result)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for outcome in join_all(handles).await {
        let result = outcome.map_err(|e| anyhow!("Job task failed to complete: {}", e))??;
        results.push(result);
    }

    let failures: Vec<JobFailure> = results
        .iter()
        .filter(|r| r.state == JobState::Failed)
        .map(|r| JobFailure {
            name: r.name.clone(),
            command: r.command.clone(),
            exit_code: r.exit_code,
            reason: last_line(&r.stderr),
        })
        .collect();

    if !failures.is_empty() {
        return Err(PipelineError::ToolFailure { failures });
    }

    Ok(BatchReport {
        results,
        peak_running: peak.load(Ordering::SeqCst),
    })
}

async fn run_job(job: &DatabaseJob) -> JobResult {
    let start = Instant::now();
    let command = job.command_line();
    info!("Running {}: {}", job.name, command);

    let output = Command::new(job.program())
        .args(job.args.iter().skip(1))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await;

    let elapsed = start.elapsed();
    match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let state = if output.status.success() { JobState::Succeeded } else { JobState::Failed };

            if !stdout.trim().is_empty() {
                debug!("[{}] stdout:\n{}", job.name, stdout.trim_end());
            }
            match state {
                JobState::Succeeded => {
                    if !stderr.trim().is_empty() {
                        debug!("[{}] stderr:\n{}", job.name, stderr.trim_end());
                    }
                    info!("Finished {} in {} ms", job.name, elapsed.as_millis());
                }
                _ => {
                    warn!("[{}] exited with {}; stderr:\n{}", job.name, output.status, stderr.trim_end());
                }
            }

            JobResult {
                name: job.name.clone(),
                command,
                state,
                exit_code: output.status.code(),
                stdout,
                stderr,
                elapsed,
            }
        }
        Err(e) => {
            warn!("[{}] failed to start: {}", job.name, e);
            JobResult {
                name: job.name.clone(),
                command,
                state: JobState::Failed,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("failed to start: {}", e),
                elapsed,
            }
        }
    }
}

fn last_line(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("no output")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh_job(name: &str, script: &str) -> DatabaseJob {
        DatabaseJob {
            name: name.to_string(),
            database: name.to_string(),
            args: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            inputs: vec![],
            outputs: vec![],
            primary_output: None::<PathBuf>,
        }
    }

    #[tokio::test]
    async fn test_concurrency_bound() -> anyhow::Result<()> {
        let jobs: Vec<_> = (0..6).map(|i| sh_job(&format!("j{}", i), "sleep 0.2")).collect();
        let report = run_jobs(jobs, 2).await?;
        assert_eq!(report.results.len(), 6);
        assert!(report.peak_running <= 2, "peak {} exceeded limit", report.peak_running);
        assert!(report.peak_running >= 1);
        assert!(report.results.iter().all(|r| r.state == JobState::Succeeded));
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_names_every_failed_job() {
        let jobs = vec![
            sh_job("ok", "echo fine"),
            sh_job("bad", "echo broken index >&2; exit 3"),
            sh_job("worse", "exit 5"),
            sh_job("late", "sleep 0.1"),
        ];
        let err = run_jobs(jobs, 2).await.unwrap_err();
        match &err {
            PipelineError::ToolFailure { failures } => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].name, "bad");
                assert_eq!(failures[0].exit_code, Some(3));
                assert_eq!(failures[0].reason, "broken index");
                assert_eq!(failures[1].exit_code, Some(5));
            }
            other => panic!("unexpected error {:?}", other),
        }
        let msg = err.to_string();
        assert!(msg.contains("sh -c echo broken index >&2; exit 3"));
        assert!(msg.contains("exit code 3"));
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test]
    async fn test_unspawnable_program_fails_batch() {
        let mut job = sh_job("ghost", "");
        job.args = vec!["definitely-not-a-real-tool-xyz".to_string()];
        let err = run_jobs(vec![job], 1).await.unwrap_err();
        assert!(matches!(err, PipelineError::ToolFailure { ref failures } if failures[0].exit_code.is_none()));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_zero_limit_and_empty_batch() -> anyhow::Result<()> {
        assert!(matches!(run_jobs(vec![sh_job("a", "true")], 0).await, Err(PipelineError::Configuration(_))));
        let report = run_jobs(vec![], 3).await?;
        assert_eq!(report.peak_running, 0);
        Ok(())
    }
}
