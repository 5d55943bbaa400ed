//! Artifact-based verdicts and the aggregate JSON report.
//!
//! Verdicts come from each job's `eval_res.json`, independent of how its
//! process exited.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{JobDescriptor, RunLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Passed,
    Failed,
    NotExecuted,
    Invalid,
}

/// Classify one result artifact. Never reports `Passed` unless the file
/// holds a JSON object whose `pass` is literally `true`.
pub fn classify_artifact(path: &Path) -> Verdict {
    if !path.exists() {
        return Verdict::NotExecuted;
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unreadable artifact");
            return Verdict::Invalid;
        }
    };
    let value: Value = match serde_json::from_str(&raw) {
        Ok(v) => v,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "artifact is not valid JSON");
            return Verdict::Invalid;
        }
    };
    match value.as_object().and_then(|o| o.get("pass")) {
        Some(Value::Bool(true)) => Verdict::Passed,
        Some(_) => Verdict::Failed,
        None => Verdict::Invalid,
    }
}

/// Job ids grouped by verdict, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerdictSummary {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub not_executed: Vec<String>,
    pub invalid: Vec<String>,
}

impl VerdictSummary {
    pub fn total(&self) -> usize {
        self.passed.len() + self.failed.len() + self.not_executed.len() + self.invalid.len()
    }

    fn push(&mut self, verdict: Verdict, id: String) {
        match verdict {
            Verdict::Passed => self.passed.push(id),
            Verdict::Failed => self.failed.push(id),
            Verdict::NotExecuted => self.not_executed.push(id),
            Verdict::Invalid => self.invalid.push(id),
        }
    }
}

pub fn analyze_artifacts(layout: &RunLayout, jobs: &[JobDescriptor]) -> VerdictSummary {
    let mut summary = VerdictSummary::default();
    for job in jobs {
        let verdict = classify_artifact(&layout.artifact_path(job));
        debug!(job = %job.id, ?verdict, "classified artifact");
        summary.push(verdict, job.id.clone());
    }
    summary
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfiguration {
    pub tasks_folder: String,
    pub model_short_name: String,
    pub provider: String,
    pub maxstep: String,
    pub workers: usize,
    pub timeout: u64,
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total_tasks: usize,
    pub passed: usize,
    pub failed: usize,
    pub not_executed: usize,
    pub error: usize,
    pub pass_rate_all: String,
    pub pass_rate_all_percent: Option<f64>,
    pub pass_rate_executed: String,
    pub pass_rate_executed_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDetails {
    pub passed_tasks: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub not_executed_tasks: Vec<String>,
    pub error_tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub execution_time: String,
    pub configuration: RunConfiguration,
    pub summary: ReportSummary,
    pub details: ReportDetails,
}

fn rate(passed: usize, of: usize) -> (String, Option<f64>) {
    if of == 0 {
        ("N/A".to_string(), None)
    } else {
        (format!("{passed}/{of}"), Some(passed as f64 / of as f64 * 100.0))
    }
}

impl ExecutionReport {
    pub fn build(configuration: RunConfiguration, verdicts: &VerdictSummary) -> Self {
        let total = verdicts.total();
        let passed = verdicts.passed.len();
        let executed = passed + verdicts.failed.len();
        let (pass_rate_all, pass_rate_all_percent) = rate(passed, total);
        let (pass_rate_executed, pass_rate_executed_percent) = rate(passed, executed);

        Self {
            execution_time: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.6f").to_string(),
            configuration,
            summary: ReportSummary {
                total_tasks: total,
                passed,
                failed: verdicts.failed.len(),
                not_executed: verdicts.not_executed.len(),
                error: verdicts.invalid.len(),
                pass_rate_all,
                pass_rate_all_percent,
                pass_rate_executed,
                pass_rate_executed_percent,
            },
            details: ReportDetails {
                passed_tasks: verdicts.passed.clone(),
                failed_tasks: verdicts.failed.clone(),
                not_executed_tasks: verdicts.not_executed.clone(),
                error_tasks: verdicts.invalid.clone(),
            },
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("failed to write report {}", path.display()))?;
        info!(path = %path.display(), "execution report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn artifact(dir: &TempDir, name: &str, body: Option<&str>) -> std::path::PathBuf {
        let path = dir.path().join(name).join("eval_res.json");
        if let Some(body) = body {
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, body).unwrap();
        }
        path
    }

    #[test]
    fn test_classify_artifact() {
        let dir = TempDir::new().unwrap();
        let cases = [
            ("pass", Some(r#"{"pass": true, "details": "ok"}"#), Verdict::Passed),
            ("fail", Some(r#"{"pass": false}"#), Verdict::Failed),
            ("stringly", Some(r#"{"pass": "true"}"#), Verdict::Failed),
            ("missing_field", Some(r#"{"score": 1}"#), Verdict::Invalid),
            ("garbage", Some("not json {"), Verdict::Invalid),
            ("array", Some("[true]"), Verdict::Invalid),
            ("absent", None, Verdict::NotExecuted),
        ];
        for (name, body, expected) in cases {
            let path = artifact(&dir, name, body);
            assert_eq!(classify_artifact(&path), expected, "case {name}");
        }
    }

    #[test]
    fn test_passing_artifact_wins_over_exit_code() {
        // The executor is never consulted: a job whose process failed but
        // left a passing artifact is still counted as passed.
        let dir = TempDir::new().unwrap();
        let layout = RunLayout::new(dir.path(), "pool", "m", "t");
        let job = JobDescriptor::new("pool/crashy");
        let path = layout.artifact_path(&job);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"pass": true}"#).unwrap();

        let summary = analyze_artifacts(&layout, &[job, JobDescriptor::new("pool/never")]);
        assert_eq!(summary.passed, vec!["pool/crashy"]);
        assert_eq!(summary.not_executed, vec!["pool/never"]);
    }

    fn config() -> RunConfiguration {
        RunConfiguration {
            tasks_folder: "pool".into(),
            model_short_name: "m".into(),
            provider: "p".into(),
            maxstep: "100".into(),
            workers: 4,
            timeout: 1800,
            tag: "t".into(),
        }
    }

    #[test]
    fn test_report_rates() {
        let verdicts = VerdictSummary {
            passed: vec!["a".into()],
            failed: vec!["b".into(), "c".into(), "d".into()],
            not_executed: vec!["e".into()],
            invalid: vec![],
        };
        let report = ExecutionReport::build(config(), &verdicts);
        assert_eq!(report.summary.total_tasks, 5);
        assert_eq!(report.summary.pass_rate_all, "1/5");
        assert_eq!(report.summary.pass_rate_all_percent, Some(20.0));
        assert_eq!(report.summary.pass_rate_executed, "1/4");
        assert_eq!(report.summary.pass_rate_executed_percent, Some(25.0));
    }

    #[test]
    fn test_report_without_executions_and_write() {
        let verdicts = VerdictSummary {
            not_executed: vec!["a".into()],
            invalid: vec!["b".into()],
            ..Default::default()
        };
        let report = ExecutionReport::build(config(), &verdicts);
        assert_eq!(report.summary.pass_rate_executed, "N/A");
        assert_eq!(report.summary.pass_rate_executed_percent, None);
        assert_eq!(report.summary.error, 1);

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results").join("report.json");
        report.write(&path).unwrap();

        let raw: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["summary"]["pass_rate_executed_percent"], Value::Null);
        assert_eq!(raw["details"]["error_tasks"][0], "b");
        assert_eq!(raw["configuration"]["workers"], 4);
    }
}
