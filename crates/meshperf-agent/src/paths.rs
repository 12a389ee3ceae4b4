//! Agent-local filesystem layout.
//!
//! - `logs/<agent_name>.log` — human-readable log.
//! - `results/<agent_name>/task_<id>[_server]_<ts>.json` — persisted reports.
//! - `temp/<agent_name>/server_task_<id>.json` — live server stdout,
//!   deleted after a successful capture.

use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub logs_dir: PathBuf,
    pub results_dir: PathBuf,
    pub temp_dir: PathBuf,
    agent_name: String,
}

impl AgentPaths {
    pub fn new(agent_name: &str) -> anyhow::Result<Self> {
        Self::rooted(Path::new("."), agent_name)
    }

    pub fn rooted(root: &Path, agent_name: &str) -> anyhow::Result<Self> {
        let logs_dir = root.join("logs");
        let results_dir = root.join("results").join(agent_name);
        let temp_dir = root.join("temp").join(agent_name);

        std::fs::create_dir_all(&logs_dir).context("create logs dir")?;
        std::fs::create_dir_all(&results_dir).context("create results dir")?;
        std::fs::create_dir_all(&temp_dir).context("create temp dir")?;

        Ok(Self {
            logs_dir,
            results_dir,
            temp_dir,
            agent_name: agent_name.to_string(),
        })
    }

    pub fn log_file(&self) -> PathBuf {
        self.logs_dir.join(format!("{}.log", self.agent_name))
    }

    pub fn temp_server_file(&self, task_id: i64) -> PathBuf {
        self.temp_dir.join(format!("server_task_{task_id}.json"))
    }

    pub fn result_file(&self, task_id: i64, server: bool) -> PathBuf {
        self.results_dir
            .join(result_file_name(task_id, server, Utc::now()))
    }

    /// Delete leftover server stdout files from a previous run; the process
    /// table is the only live state and it did not survive the restart.
    pub fn clean_stale_temp(&self) -> anyhow::Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.temp_dir).context("read temp dir")? {
            let entry = entry.context("read temp dir entry")?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("server_task_") && name.ends_with(".json") {
                std::fs::remove_file(entry.path())
                    .with_context(|| format!("remove stale temp file {name}"))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

pub fn result_file_name(task_id: i64, server: bool, now: DateTime<Utc>) -> String {
    let ts = now.format("%Y%m%d_%H%M%S");
    if server {
        format!("task_{task_id}_server_{ts}.json")
    } else {
        format!("task_{task_id}_{ts}.json")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn result_file_names_carry_timestamp_and_role() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        assert_eq!(
            result_file_name(7, false, now),
            "task_7_20250314_092653.json"
        );
        assert_eq!(
            result_file_name(7, true, now),
            "task_7_server_20250314_092653.json"
        );
    }

    #[test]
    fn clean_stale_temp_only_touches_server_files() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let paths = AgentPaths::rooted(root.path(), "a1")?;

        std::fs::write(paths.temp_server_file(3), "{}")?;
        std::fs::write(paths.temp_dir.join("keep.txt"), "x")?;

        let removed = paths.clean_stale_temp()?;
        assert_eq!(removed, 1);
        assert!(!paths.temp_server_file(3).exists());
        assert!(paths.temp_dir.join("keep.txt").exists());
        Ok(())
    }
}
