// On-disk layout of one batch run

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

/// One schedulable job. `id` is `<folder>/<task>`, `name` the task part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobDescriptor {
    pub id: String,
}

impl JobDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Last path component; conflict groups refer to jobs by this.
    pub fn name(&self) -> &str {
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

/// Where a run reads tasks from and writes logs, artifacts and the report.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub root: PathBuf,
    pub tasks_folder: String,
    pub model: String,
    pub tag: String,
}

impl RunLayout {
    pub fn new(
        root: impl Into<PathBuf>,
        tasks_folder: impl Into<String>,
        model: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            root: root.into(),
            tasks_folder: tasks_folder.into(),
            model: model.into(),
            tag: tag.into(),
        }
    }

    /// Short random tag for runs that were not given one.
    pub fn generate_tag() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.root.join("tasks").join(&self.tasks_folder)
    }

    pub fn default_conflict_file(&self) -> PathBuf {
        self.tasks_dir().join("task_conflict.json")
    }

    pub fn log_path(&self, job: &JobDescriptor) -> PathBuf {
        self.root
            .join("logs_containers")
            .join(&self.tasks_folder)
            .join(job.name())
            .join(format!("{}_{}.log", self.model, self.tag))
    }

    pub fn artifact_path(&self, job: &JobDescriptor) -> PathBuf {
        self.root
            .join("dumps")
            .join(&self.tasks_folder)
            .join(job.name())
            .join(format!("{}_{}_output", self.model, self.tag))
            .join("eval_res.json")
    }

    pub fn report_path(&self) -> PathBuf {
        self.root.join("results").join(format!(
            "execution_report_{}_{}_{}.json",
            self.tasks_folder, self.model, self.tag
        ))
    }

    /// Every sub-directory of the tasks folder, sorted by name.
    pub fn discover_jobs(&self) -> Result<Vec<JobDescriptor>> {
        discover_jobs(&self.tasks_dir(), &self.tasks_folder)
    }
}

fn discover_jobs(dir: &Path, folder: &str) -> Result<Vec<JobDescriptor>> {
    if !dir.is_dir() {
        return Err(anyhow!("tasks directory {} does not exist", dir.display()));
    }
    let mut names: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("failed to read {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    Ok(names
        .into_iter()
        .map(|n| JobDescriptor::new(format!("{folder}/{n}")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_follow_run_layout() {
        let layout = RunLayout::new("/work", "finalpool", "gpt-5", "ab12");
        let job = JobDescriptor::new("finalpool/find-alita-paper");
        assert_eq!(job.name(), "find-alita-paper");
        assert_eq!(
            layout.log_path(&job),
            PathBuf::from("/work/logs_containers/finalpool/find-alita-paper/gpt-5_ab12.log")
        );
        assert_eq!(
            layout.artifact_path(&job),
            PathBuf::from("/work/dumps/finalpool/find-alita-paper/gpt-5_ab12_output/eval_res.json")
        );
        assert_eq!(
            layout.report_path(),
            PathBuf::from("/work/results/execution_report_finalpool_gpt-5_ab12.json")
        );
        assert_eq!(
            layout.default_conflict_file(),
            PathBuf::from("/work/tasks/finalpool/task_conflict.json")
        );
    }

    #[test]
    fn test_discover_jobs_sorted_dirs_only() {
        let dir = TempDir::new().unwrap();
        let tasks = dir.path().join("tasks").join("pool");
        for name in ["zeta", "alpha", "mid"] {
            fs::create_dir_all(tasks.join(name)).unwrap();
        }
        fs::write(tasks.join("task_conflict.json"), "{}").unwrap();

        let layout = RunLayout::new(dir.path(), "pool", "m", "t");
        let ids: Vec<String> = layout.discover_jobs().unwrap().into_iter().map(|j| j.id).collect();
        assert_eq!(ids, vec!["pool/alpha", "pool/mid", "pool/zeta"]);
    }

    #[test]
    fn test_discover_jobs_missing_folder() {
        let dir = TempDir::new().unwrap();
        let layout = RunLayout::new(dir.path(), "nope", "m", "t");
        assert!(layout.discover_jobs().is_err());
    }

    #[test]
    fn test_generated_tag_is_short() {
        let tag = RunLayout::generate_tag();
        assert_eq!(tag.len(), 8);
        assert_ne!(tag, RunLayout::generate_tag());
    }
}
