use anyhow::{Context, Result};
use async_trait::async_trait;
use meshwork_protocol::{Job, JobResult};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Everything a job needs to run.
#[derive(Debug, Clone)]
pub struct JobInput {
    pub job: Job,
    pub files: BTreeMap<String, Vec<u8>>,
    pub dependency: Option<JobResult>,
}

/// Runs one job to completion and returns its result data.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, input: JobInput) -> Result<Value>;
}

/// Runs each job in its own child process.
///
/// The job's input files are written to a scratch directory which becomes
/// the child's working directory. `{parameters, files, dependency}` is
/// written to stdin as JSON and the last line of stdout that parses as
/// JSON is the result.
pub struct ProcessExecutor {
    program: String,
    args: Vec<String>,
    work_dir: PathBuf,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(program: String, args: Vec<String>, work_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            program,
            args,
            work_dir,
            timeout,
        }
    }

    async fn prepare(&self, input: &JobInput) -> Result<PathBuf> {
        let dir = self.work_dir.join(&input.job.uuid);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        for (name, bytes) in &input.files {
            if name.contains("..") || name.starts_with('/') {
                anyhow::bail!("Input file name {name:?} escapes the job directory");
            }
            tokio::fs::write(dir.join(name), bytes)
                .await
                .with_context(|| format!("Failed to write input file {name}"))?;
        }
        Ok(dir)
    }

    async fn run(&self, input: &JobInput, dir: &PathBuf) -> Result<Value> {
        let job_id = &input.job.uuid;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Spawn failed: {}", self.program))?;

        let payload = json!({
            "parameters": input.job.parameters,
            "files": input.files.keys().collect::<Vec<_>>(),
            "dependency": input.dependency.as_ref().map(|d| &d.data),
        });
        let mut stdin = child.stdin.take().context("child has no stdin")?;
        let stdout = child.stdout.take().context("child has no stdout")?;
        let stderr = child.stderr.take().context("child has no stderr")?;

        let body = serde_json::to_vec(&payload)?;
        // a child that ignores its input may close stdin early
        if let Err(e) = stdin.write_all(&body).await {
            tracing::debug!(job = %job_id, "stdin write failed: {e}");
        }
        drop(stdin);

        let job_err = job_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut lines = Vec::new();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(job = %job_err, "stderr: {line}");
                lines.push(line);
            }
            lines
        });

        let read_output = async {
            let mut reader = BufReader::new(stdout).lines();
            let mut last = None;
            while let Ok(Some(line)) = reader.next_line().await {
                if let Ok(value) = serde_json::from_str::<Value>(line.trim()) {
                    last = Some(value);
                }
            }
            let status = child.wait().await;
            (last, status)
        };

        let (output, status) = match tokio::time::timeout(self.timeout, read_output).await {
            Ok(done) => done,
            Err(_) => {
                tracing::warn!(job = %job_id, "Job timed out, killing");
                stderr_task.abort();
                anyhow::bail!("Job timed out after {}s", self.timeout.as_secs());
            }
        };
        let status = status.context("Failed to wait for child")?;
        let stderr_lines = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let tail: Vec<_> = stderr_lines.iter().rev().take(5).rev().cloned().collect();
            anyhow::bail!("Process exited with {status}: {}", tail.join("\n"));
        }
        output.context("Process printed no JSON result")
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, input: JobInput) -> Result<Value> {
        let dir = self.prepare(&input).await?;
        tracing::info!(job = %input.job.uuid, program = %self.program, "Spawning job process");
        let outcome = self.run(&input, &dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            tracing::debug!(dir = %dir.display(), "Scratch cleanup failed: {e}");
        }
        outcome
    }
}

/// Executor driven by a closure.
#[cfg(test)]
pub struct FnExecutor<F>(F);

#[cfg(test)]
impl<F> FnExecutor<F>
where
    F: Fn(&JobInput) -> Result<Value> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[cfg(test)]
#[async_trait]
impl<F> JobExecutor for FnExecutor<F>
where
    F: Fn(&JobInput) -> Result<Value> + Send + Sync,
{
    async fn execute(&self, input: JobInput) -> Result<Value> {
        (self.0)(&input)
    }
}
