// src/history.rs

//! Persisted run layout and the history index.
//!
//! Every scheduled workflow gets a working directory under the workdir root
//! holding generated scripts, body files, the submission log and the event
//! log. A `history.jsonl` index at the root lists one entry per run and is
//! what the `list` command reads back.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::errors::Result;

/// Working directory of a single run.
#[derive(Debug, Clone)]
pub struct RunDir {
    pub name: String,
    pub workflow_id: Uuid,
    path: PathBuf,
}

impl RunDir {
    /// Create `<root>/<name>/`, defaulting the name to a timestamp.
    pub fn create(root: &Path, name: Option<String>) -> Result<Self> {
        let name = name.unwrap_or_else(|| Utc::now().format("%y%m%d_%H%M%S").to_string());
        let path = root.join(&name);
        fs::create_dir_all(&path)?;

        debug!(run = %name, path = %path.display(), "created run directory");
        Ok(Self {
            name,
            workflow_id: Uuid::new_v4(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Submission script for a job.
    pub fn script_path(&self, job: &str) -> PathBuf {
        self.path.join(format!("{job}.sbatch"))
    }

    /// Serialised body for a job, invoked by the submission script.
    pub fn body_path(&self, job: &str) -> PathBuf {
        self.path.join(format!("{job}.body.sh"))
    }

    pub fn events_path(&self) -> PathBuf {
        self.path.join("events.jsonl")
    }

    /// Persist the job-name to external-id mapping.
    pub fn write_submissions(&self, ids: &BTreeMap<String, String>) -> Result<()> {
        let file = fs::File::create(self.path.join("submissions.json"))?;
        serde_json::to_writer_pretty(file, ids).map_err(anyhow::Error::from)?;
        Ok(())
    }
}

/// One line of the history index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub name: String,
    pub workflow_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub backend: String,
    pub job_count: usize,
    pub error_count: usize,
}

fn index_path(root: &Path) -> PathBuf {
    root.join("history.jsonl")
}

/// Append an entry to `<root>/history.jsonl`, creating it as needed.
pub fn append_history(root: &Path, entry: &HistoryEntry) -> Result<()> {
    fs::create_dir_all(root)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(index_path(root))?;
    let line = serde_json::to_string(entry).map_err(anyhow::Error::from)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Read the history index, oldest entry first. Missing index means no runs.
pub fn read_history(root: &Path) -> Result<Vec<HistoryEntry>> {
    let path = index_path(root);
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = fs::File::open(path)?;
    let mut entries = Vec::new();
    for line in std::io::BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line).map_err(anyhow::Error::from)?);
    }
    Ok(entries)
}
