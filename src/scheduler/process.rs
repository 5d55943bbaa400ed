// Job executor that runs each job as an external process

use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ExecutionStatus, JobDescriptor, JobExecutor, JobOutcome, RunLayout};

const DEFAULT_LAUNCHER: &str = "bash scripts/run_single_containerized.sh";

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// Program and leading arguments used to start a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// Split a whitespace-separated command line.
    pub fn parse(cmdline: &str) -> Result<Self> {
        let mut parts = cmdline.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("launcher command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            program: "bash".into(),
            args: vec!["scripts/run_single_containerized.sh".into()],
        }
    }
}

/// Runs `<launcher> <job id> <tag> <model> <provider> <max steps>` and
/// streams its combined output into the job's log file.
pub struct ProcessExecutor {
    launch: LaunchSpec,
    layout: Arc<RunLayout>,
    provider: String,
    max_steps: String,
    grace_period: Duration,
}

impl ProcessExecutor {
    pub fn new(
        launch: LaunchSpec,
        layout: Arc<RunLayout>,
        provider: impl Into<String>,
        max_steps: impl Into<String>,
    ) -> Self {
        Self {
            launch,
            layout,
            provider: provider.into(),
            max_steps: max_steps.into(),
            grace_period: Duration::from_secs(5),
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn default_launcher() -> &'static str {
        DEFAULT_LAUNCHER
    }

    fn command_args(&self, job: &JobDescriptor) -> Vec<String> {
        let mut args = self.launch.args.clone();
        args.extend([
            job.id.clone(),
            self.layout.tag.clone(),
            self.layout.model.clone(),
            self.provider.clone(),
            self.max_steps.clone(),
        ]);
        args
    }

    async fn supervise(
        &self,
        job: &JobDescriptor,
        log_path: &Path,
        timeout: Duration,
    ) -> Result<(ExecutionStatus, Option<i32>)> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let args = self.command_args(job);
        let cmdline = std::iter::once(self.launch.program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let mut log = File::create(log_path).await?;
        log.write_all(format!("[{}] Command: {}\n{}\n", timestamp(), cmdline, "=".repeat(80)).as_bytes())
            .await?;
        log.flush().await?;

        let mut cmd = Command::new(&self.launch.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        debug!(job = %job.id, pid = ?child.id(), "job process started");

        // The group id outlives the leader, so stragglers can still be signalled.
        let pgid = child.id();
        let mut pump = spawn_output_pump(&mut child, log);

        // One deadline covers the exit and the end of the job's output.
        let deadline = Instant::now() + timeout;
        let finished = tokio::time::timeout_at(deadline, async {
            let status = child.wait().await?;
            let log = (&mut pump).await?;
            anyhow::Ok((status, log))
        })
        .await;

        match finished {
            Ok(done) => {
                let (status, mut log) = done?;
                let code = status.code().or_else(|| status.signal().map(|s| -s));
                log.write_all(
                    format!("[{}] Process ended with code: {}\n", timestamp(), code.unwrap_or(-1)).as_bytes(),
                )
                .await?;
                log.flush().await?;
                let outcome = if status.success() {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                };
                Ok((outcome, code))
            }
            Err(_) => {
                warn!(job = %job.id, timeout_secs = timeout.as_secs(), "job timed out, terminating");
                terminate_group(&mut child, pgid, self.grace_period).await;

                // Output readers end once the group's pipes close.
                let log = match tokio::time::timeout(self.grace_period, &mut pump).await {
                    Ok(joined) => Some(joined?),
                    Err(_) => {
                        pump.abort();
                        None
                    }
                };
                let mut log = match log {
                    Some(log) => log,
                    None => OpenOptions::new().append(true).open(log_path).await?,
                };
                log.write_all(format!("\n[{}] TIMEOUT after {} seconds\n", timestamp(), timeout.as_secs()).as_bytes())
                    .await?;
                log.flush().await?;
                Ok((ExecutionStatus::Timeout, None))
            }
        }
    }
}

/// Merge stdout and stderr line by line into `log`; the handle yields the
/// file back once both streams hit EOF.
fn spawn_output_pump(child: &mut Child, mut log: File) -> tokio::task::JoinHandle<File> {
    let (tx, mut rx) = mpsc::channel::<String>(256);
    if let Some(out) = child.stdout.take() {
        tokio::spawn(forward_lines(out, tx.clone()));
    }
    if let Some(err) = child.stderr.take() {
        tokio::spawn(forward_lines(err, tx.clone()));
    }
    drop(tx);

    tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if log.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        let _ = log.flush().await;
        log
    })
}

/// Forward raw lines, decoded lossily. Keeps reading to EOF even when
/// nobody is listening so the job never sees a closed pipe.
async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<String>) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut forwarding = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                if forwarding {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    forwarding = tx.send(line).await.is_ok();
                }
            }
            Err(e) => {
                debug!(error = %e, "job output stream closed with error");
                break;
            }
        }
    }
}

/// SIGTERM the job's process group, then SIGKILL it if it outlives `grace`.
async fn terminate_group(child: &mut Child, pgid: Option<u32>, grace: Duration) {
    let Some(pgid) = pgid else {
        return;
    };
    let pgid = Pid::from_raw(pgid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        warn!(pgid = pgid.as_raw(), "job ignored SIGTERM, killing process group");
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = child.wait().await;
    } else {
        // Stragglers in the group that outlived the leader.
        let _ = killpg(pgid, Signal::SIGKILL);
    }
}

#[async_trait]
impl JobExecutor for ProcessExecutor {
    async fn execute(&self, job: &JobDescriptor, timeout: Duration) -> JobOutcome {
        let started = Instant::now();
        let log_path = self.layout.log_path(job);
        info!(job = %job.id, log = %log_path.display(), "starting job");

        let (status, exit_code, error) = match self.supervise(job, &log_path, timeout).await {
            Ok((status, code)) => (status, code, None),
            Err(e) => {
                warn!(job = %job.id, error = %e, "job could not be run");
                if let Ok(mut log) = OpenOptions::new().create(true).append(true).open(&log_path).await {
                    let _ = log
                        .write_all(format!("\n[{}] ERROR: {}\n", timestamp(), e).as_bytes())
                        .await;
                }
                (ExecutionStatus::Failed, None, Some(e.to_string()))
            }
        };

        let error = error.or_else(|| match status {
            ExecutionStatus::Timeout => Some(format!("timed out after {} seconds", timeout.as_secs())),
            ExecutionStatus::Failed => Some(format!("exit code {}", exit_code.unwrap_or(-1))),
            ExecutionStatus::Success => None,
        });

        JobOutcome {
            job_id: job.id.clone(),
            status,
            elapsed: started.elapsed(),
            log_path: Some(log_path),
            exit_code,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn executor(dir: &TempDir, script: &str) -> ProcessExecutor {
        let layout = Arc::new(RunLayout::new(dir.path(), "pool", "model", "t1"));
        let launch = LaunchSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into(), "job".into()],
        };
        ProcessExecutor::new(launch, layout, "prov", "50").with_grace_period(Duration::from_millis(500))
    }

    #[test]
    fn test_launch_spec_parse() {
        let spec = LaunchSpec::parse(DEFAULT_LAUNCHER).unwrap();
        assert_eq!(spec, LaunchSpec::default());
        assert!(LaunchSpec::parse("   ").is_err());
    }

    #[tokio::test]
    async fn test_success_streams_output_and_exit_line() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir, "echo out-$1; echo err-$5 >&2");
        let job = JobDescriptor::new("pool/alpha");

        let outcome = exec.execute(&job, Duration::from_secs(10)).await;
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));

        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert!(lines[0].contains("] Command: sh -c"));
        assert!(lines[0].ends_with("pool/alpha t1 model prov 50"));
        assert_eq!(lines[1], "=".repeat(80));
        assert!(log.contains("out-pool/alpha\n"));
        assert!(log.contains("err-50\n"));
        assert!(lines.last().unwrap().ends_with("Process ended with code: 0"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let dir = TempDir::new().unwrap();
        let exec = executor(&dir, "exit 3");
        let outcome = exec.execute(&JobDescriptor::new("pool/beta"), Duration::from_secs(10)).await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.error.as_deref(), Some("exit code 3"));
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("pid");
        let script = format!("echo $$ > {}; sleep 30", pid_file.display());
        let exec = executor(&dir, &script);

        let outcome = exec.execute(&JobDescriptor::new("pool/slow"), Duration::from_secs(1)).await;
        assert_eq!(outcome.status, ExecutionStatus::Timeout);

        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        assert!(log.contains("TIMEOUT after 1 seconds"));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        assert!(nix::sys::signal::kill(Pid::from_raw(pid), None).is_err());
    }

    /// Gone or reaped-pending counts as dead.
    fn alive(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat.rsplit(')').next().unwrap_or("").trim_start().starts_with('Z'),
            Err(_) => false,
        }
    }

    #[tokio::test]
    async fn test_background_child_holding_output_times_out() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 30 & echo $! > {}; exit 0", pid_file.display());
        let exec = executor(&dir, &script);

        let outcome = exec.execute(&JobDescriptor::new("pool/leaky"), Duration::from_secs(1)).await;
        assert_eq!(outcome.status, ExecutionStatus::Timeout);
        assert!(outcome.elapsed < Duration::from_secs(10));

        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        assert!(log.contains("TIMEOUT after 1 seconds"));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let mut gone = false;
        for _ in 0..40 {
            if !alive(pid) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "background process {pid} survived the timeout");
    }

    #[tokio::test]
    async fn test_invalid_utf8_output_keeps_streaming() {
        let dir = TempDir::new().unwrap();
        let exec = executor(
            &dir,
            "printf 'before\\n\\377\\nafter\\n'; head -c 300000 /dev/zero | tr '\\0' a; echo; echo done",
        );

        let outcome = exec.execute(&JobDescriptor::new("pool/binary"), Duration::from_secs(10)).await;
        assert_eq!(outcome.status, ExecutionStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));

        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        assert!(log.contains("before\n"));
        assert!(log.contains("\u{FFFD}\n"));
        assert!(log.contains("after\n"));
        assert!(log.contains("done\n"));
        assert!(log.lines().last().unwrap().ends_with("Process ended with code: 0"));
    }

    #[tokio::test]
    async fn test_spawn_error_is_logged() {
        let dir = TempDir::new().unwrap();
        let layout = Arc::new(RunLayout::new(dir.path(), "pool", "model", "t1"));
        let launch = LaunchSpec {
            program: "/nonexistent/launcher".into(),
            args: vec![],
        };
        let exec = ProcessExecutor::new(launch, layout, "prov", "50");

        let outcome = exec.execute(&JobDescriptor::new("pool/gamma"), Duration::from_secs(5)).await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.error.is_some());
        let log = std::fs::read_to_string(outcome.log_path.unwrap()).unwrap();
        assert!(log.contains("] ERROR: "));
    }
}
