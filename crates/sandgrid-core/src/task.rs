//! Task and Result manifests.
//!
//! A [`Task`] is what a client submits and what the container sees as
//! `kolejka_task.json` in its task directory. A [`TaskResult`] is written
//! by the sandbox as `kolejka_result.json` and pushed back to the store.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{CoreError, CoreResult};
use crate::limits::ResourceLimits;
use crate::usage::ResourceUsage;

/// Task manifest file name inside a task directory.
pub const TASK_MANIFEST: &str = "kolejka_task.json";
/// Result manifest file name inside a result directory.
pub const RESULT_MANIFEST: &str = "kolejka_result.json";

/// A file in a task or result manifest: a local path, a blob reference, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl FileEntry {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            reference: None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.path.is_some()
    }

    /// True if the local path cannot escape `root`.
    ///
    /// Checked lexically: absolute paths and `..` components are rejected.
    pub fn is_contained(&self) -> bool {
        match &self.path {
            None => true,
            Some(path) => Path::new(path)
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir)),
        }
    }
}

/// A post-execution collection rule, evaluated against the result directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectRule {
    pub glob: String,
    /// Leading path components to drop.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub strip: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

/// Translate a shell glob into an anchored regex over `/`-separated paths.
///
/// `**` crosses directory boundaries, `*` and `?` do not.
fn glob_to_regex(glob: &str) -> CoreResult<Regex> {
    let mut pattern = String::from("^");
    let mut chars = glob.trim_start_matches("./").chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    pattern.push_str("(?:.*/)?");
                } else {
                    pattern.push_str(".*");
                }
            }
            '*' => pattern.push_str("[^/]*"),
            '?' => pattern.push_str("[^/]"),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    Regex::new(&pattern).map_err(|_| CoreError::parse("glob", glob))
}

impl CollectRule {
    pub fn new(glob: impl Into<String>) -> Self {
        Self {
            glob: glob.into(),
            strip: 0,
            prefix: String::new(),
        }
    }

    /// Match files under `root`, returning destination name → absolute path.
    pub fn collect(&self, root: &Path) -> CoreResult<BTreeMap<String, PathBuf>> {
        let matcher = glob_to_regex(&self.glob)?;
        let prefix = self.prefix.trim_matches('/');
        let mut found = BTreeMap::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| CoreError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if !matcher.is_match(&relative) {
                continue;
            }
            let parts: Vec<&str> = relative.split('/').collect();
            let skip = self.strip.min(parts.len() - 1);
            let mut name = parts[skip..].join("/");
            if !prefix.is_empty() {
                name = format!("{prefix}/{name}");
            }
            found.insert(name, entry.path().to_path_buf());
        }
        Ok(found)
    }
}

/// A sandboxed computational task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Tags a machine must carry to run this task.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
    #[serde(default)]
    pub collect: Vec<CollectRule>,
}

fn read_manifest<T: serde::de::DeserializeOwned>(path: &Path) -> CoreResult<T> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn write_manifest<T: Serialize>(path: &Path, value: &T) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(value)?;
    fs::write(path, text)?;
    debug!(path = %path.display(), "manifest written");
    Ok(())
}

impl Task {
    /// The single typed entry point for task documents.
    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        let mut task: Task = serde_json::from_str(json)?;
        task.limits.normalize();
        Ok(task)
    }

    /// Load `kolejka_task.json` from a task directory.
    pub fn load(dir: &Path) -> CoreResult<Self> {
        let mut task: Task = read_manifest(&dir.join(TASK_MANIFEST))?;
        task.limits.normalize();
        Ok(task)
    }

    /// Write `kolejka_task.json` into a task directory.
    pub fn commit(&self, dir: &Path) -> CoreResult<()> {
        write_manifest(&dir.join(TASK_MANIFEST), self)
    }

    /// Reject manifests whose local files point outside the task directory.
    pub fn validate(&self) -> CoreResult<()> {
        for (name, entry) in &self.files {
            if !entry.is_contained() {
                return Err(CoreError::Manifest(format!(
                    "file {name:?} escapes the task directory"
                )));
            }
            if entry.path.is_none() && entry.reference.is_none() {
                return Err(CoreError::Manifest(format!(
                    "file {name:?} has neither path nor reference"
                )));
            }
        }
        Ok(())
    }

    /// Evaluate every collect rule against `root`.
    pub fn collect_files(&self, root: &Path) -> CoreResult<BTreeMap<String, PathBuf>> {
        let mut found = BTreeMap::new();
        for rule in &self.collect {
            found.extend(rule.collect(root)?);
        }
        Ok(found)
    }
}

/// The outcome of one task execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tags of the machine that ran the task.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Limits actually granted.
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub stats: ResourceUsage,
    /// Process exit code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, FileEntry>,
}

impl TaskResult {
    pub fn from_json_str(json: &str) -> CoreResult<Self> {
        let mut result: TaskResult = serde_json::from_str(json)?;
        result.limits.normalize();
        Ok(result)
    }

    /// Load `kolejka_result.json` from a result directory.
    pub fn load(dir: &Path) -> CoreResult<Self> {
        read_manifest(&dir.join(RESULT_MANIFEST))
    }

    pub fn commit(&self, dir: &Path) -> CoreResult<()> {
        write_manifest(&dir.join(RESULT_MANIFEST), self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_with_huge_time_limit_is_rejected() {
        assert!(Task::from_json_str(r#"{"limits":{"time":1e300}}"#).is_err());
        assert!(Task::from_json_str(r#"{"limits":{"time":"1e300s"}}"#).is_err());
    }

    #[test]
    fn task_from_json_normalizes_limits() {
        let task = Task::from_json_str(
            r#"{
                "id": "t1",
                "image": "img:latest",
                "requires": ["gpu"],
                "exclusive": true,
                "limits": {"cpus": 2, "memory": "1g", "gpus": 0, "gpu_memory": "2g"},
                "args": ["run.sh"],
                "files": {"input.txt": {"reference": "abc"}}
            }"#,
        )
        .unwrap();
        assert_eq!(task.id.as_deref(), Some("t1"));
        assert!(task.exclusive);
        assert_eq!(task.limits.cpus, Some(2));
        assert_eq!(task.limits.gpu_memory, None);
        assert_eq!(task.files["input.txt"].reference.as_deref(), Some("abc"));
        assert!(task.collect.is_empty());
    }

    #[test]
    fn manifest_commit_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut task = Task::from_json_str(r#"{"id": "t2", "args": ["true"]}"#).unwrap();
        task.environment.insert("A".into(), "1".into());
        task.commit(dir.path()).unwrap();
        assert!(dir.path().join(TASK_MANIFEST).exists());
        assert_eq!(Task::load(dir.path()).unwrap(), task);
    }

    #[test]
    fn escaping_files_are_rejected() {
        let mut task = Task::default();
        task.files.insert("x".into(), FileEntry::local("../etc/passwd"));
        assert!(task.validate().is_err());

        let mut task = Task::default();
        task.files.insert("x".into(), FileEntry::local("data/x.txt"));
        assert!(task.validate().is_ok());
    }

    #[test]
    fn collect_with_strip_and_prefix() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("out/deep")).unwrap();
        fs::write(dir.path().join("out/a.txt"), "a").unwrap();
        fs::write(dir.path().join("out/deep/b.txt"), "b").unwrap();
        fs::write(dir.path().join("out/c.log"), "c").unwrap();

        let rule = CollectRule {
            glob: "out/**/*.txt".into(),
            strip: 1,
            prefix: "/res/".into(),
        };
        let found = rule.collect(dir.path()).unwrap();
        let names: Vec<&str> = found.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["res/a.txt", "res/deep/b.txt"]);
    }

    #[test]
    fn single_star_stays_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("top.txt"), "").unwrap();
        fs::write(dir.path().join("sub/inner.txt"), "").unwrap();
        let found = CollectRule::new("*.txt").collect(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains_key("top.txt"));
    }

    #[test]
    fn result_commit_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let result = TaskResult {
            id: Some("t3".into()),
            result: Some(0),
            ..Default::default()
        };
        result.commit(dir.path()).unwrap();
        assert_eq!(TaskResult::load(dir.path()).unwrap(), result);
    }
}
