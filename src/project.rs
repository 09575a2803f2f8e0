//! Project discovery, id validation, and git/worktree status (§4.4).
//!
//! Adapted from the teacher's worktree-management code: same "shell out to
//! `git`, parse plumbing/porcelain output" style, generalized from
//! issue-numbered agent worktrees to the spec's `{parentRepoId}--{safeBranch}`
//! naming and read-only git-status reporting.

use std::{fs, path::{Path, PathBuf}};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Files/directories whose presence in a directory marks it as a project.
const PROJECT_MARKERS: &[&str] = &[
    "package.json",
    "Cargo.toml",
    "go.mod",
    "pyproject.toml",
    "setup.py",
    ".git",
    "Makefile",
    "CMakeLists.txt",
    "pom.xml",
    "build.gradle",
];

/// Reject ids containing traversal or path separators, matching the spec's
/// `^[^/\\\0]+$` and "contains no .." rule.
pub fn validate_project_id(id: &str) -> Result<(), AppError> {
    if id.is_empty() || id.contains("..") || id.contains('/') || id.contains('\\') || id.contains('\0') {
        return Err(AppError::InvalidProject(id.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct WorktreeInfo {
    #[serde(rename = "parentRepoId")]
    pub parent_repo_id: String,
    pub branch: String,
    #[serde(rename = "mainWorktreePath", skip_serializing)]
    pub main_worktree_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    #[serde(rename = "lastAccessed")]
    pub last_accessed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree: Option<WorktreeInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitFile {
    pub status: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GitStatus {
    pub branch: String,
    #[serde(rename = "isDirty")]
    pub is_dirty: bool,
    #[serde(rename = "changedFiles")]
    pub changed_files: usize,
    pub files: Vec<GitFile>,
    pub ahead: u32,
    pub behind: u32,
    #[serde(rename = "isWorktree")]
    pub is_worktree: bool,
    #[serde(rename = "parentRepoId")]
    pub parent_repo_id: Option<String>,
    pub branches: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorktreeEntry {
    pub path: String,
    pub branch: String,
    #[serde(rename = "isCurrent")]
    pub is_current: bool,
}

/// Discovers and validates projects under a single base directory.
#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    base_dir: PathBuf,
}

impl ProjectRegistry {
    #[must_use]
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Scan the base directory for project-marker children.
    pub fn list(&self) -> Result<Vec<Project>> {
        let mut projects = Vec::new();
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(projects),
            Err(e) => return Err(e).context("reading projects base directory"),
        };

        for entry in entries {
            let entry = entry.context("reading project directory entry")?;
            let path = entry.path();
            if !path.is_dir() || !has_project_marker(&path) {
                continue;
            }
            let Some(id) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
                continue;
            };
            if validate_project_id(&id).is_err() {
                continue;
            }
            projects.push(self.build_project(id, path));
        }

        Ok(projects)
    }

    /// Look up one project by id, failing with `InvalidProject` if absent or
    /// the id does not resolve under the base directory.
    pub fn get(&self, id: &str) -> Result<Project, AppError> {
        validate_project_id(id)?;
        let path = self.base_dir.join(id);
        if !path.is_dir() || !has_project_marker(&path) {
            return Err(AppError::InvalidProject(id.to_string()));
        }
        Ok(self.build_project(id.to_string(), path))
    }

    fn build_project(&self, id: String, path: PathBuf) -> Project {
        let worktree = detect_worktree(&path);
        let mut name = read_manifest_name(&path).unwrap_or_else(|| id.clone());
        if let Some(wt) = &worktree {
            name = format!("{name} [{}]", wt.branch);
        }
        let last_accessed = fs::metadata(&path).and_then(|m| m.modified()).ok().map(DateTime::<Utc>::from);
        Project { id, path, name, last_accessed, worktree }
    }

    /// `GET /api/projects/{id}/git` data.
    pub fn git_status(&self, id: &str) -> Result<GitStatus, AppError> {
        let project = self.get(id)?;
        git_status_for(&project).map_err(|e| AppError::GitFailure(e.to_string()))
    }

    /// `GET /api/projects/{id}/worktrees`.
    pub fn list_worktrees(&self, id: &str) -> Result<Vec<WorktreeEntry>, AppError> {
        let project = self.get(id)?;
        let repo_path = match &project.worktree {
            Some(wt) => wt.main_worktree_path.clone(),
            None => project.path.clone(),
        };

        let output = run_git(&repo_path, &["worktree", "list", "--porcelain"])
            .map_err(|e| AppError::GitFailure(e.to_string()))?;

        let mut entries = Vec::new();
        let mut current_path: Option<String> = None;
        let mut current_branch = String::new();
        for line in output.lines().chain(std::iter::once("")) {
            if line.is_empty() {
                if let Some(path) = current_path.take() {
                    let is_current = Path::new(&path) == project.path;
                    entries.push(WorktreeEntry {
                        path,
                        branch: std::mem::take(&mut current_branch),
                        is_current,
                    });
                }
                continue;
            }
            if let Some(path) = line.strip_prefix("worktree ") {
                current_path = Some(path.to_string());
            } else if let Some(branch_ref) = line.strip_prefix("branch ") {
                current_branch = branch_ref.trim_start_matches("refs/heads/").to_string();
            }
        }
        Ok(entries)
    }

    /// Create a worktree off the project, branching at `{parentRepoId}--{safeBranch}`.
    pub fn create_worktree(&self, parent_id: &str, branch: &str) -> Result<Project, AppError> {
        let parent = self.get(parent_id)?;
        if parent.worktree.is_some() {
            return Err(AppError::GitFailure("cannot branch a worktree from a worktree".into()));
        }

        let safe_branch = branch.replace('/', "-");
        let target_dir = self.base_dir.join(format!("{parent_id}--{safe_branch}"));
        if target_dir.exists() {
            return Err(AppError::GitFailure(format!(
                "target directory {} already exists",
                target_dir.display()
            )));
        }

        let branch_exists = git_branch_exists(&parent.path, branch);
        let target_str = target_dir.to_string_lossy().to_string();
        let args: Vec<&str> = if branch_exists {
            vec!["worktree", "add", &target_str, branch]
        } else {
            vec!["worktree", "add", "-b", branch, &target_str]
        };
        run_git(&parent.path, &args).map_err(|e| AppError::GitFailure(e.to_string()))?;

        let new_id = format!("{parent_id}--{safe_branch}");
        Ok(self.build_project(new_id, target_dir))
    }

    /// Remove a linked worktree. Refuses on a main (non-worktree) project.
    pub fn remove_worktree(&self, id: &str) -> Result<(), AppError> {
        let project = self.get(id)?;
        let Some(wt) = &project.worktree else {
            return Err(AppError::GitFailure("not a worktree".into()));
        };

        run_git(
            &wt.main_worktree_path,
            &["worktree", "remove", &project.path.to_string_lossy(), "--force"],
        )
        .map_err(|e| AppError::GitFailure(e.to_string()))?;
        Ok(())
    }
}

fn has_project_marker(dir: &Path) -> bool {
    PROJECT_MARKERS.iter().any(|marker| dir.join(marker).exists())
}

/// Read the `name` field from `package.json` or `Cargo.toml`.
fn read_manifest_name(dir: &Path) -> Option<String> {
    if let Ok(content) = fs::read_to_string(dir.join("package.json")) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) {
            if let Some(name) = value.get("name").and_then(serde_json::Value::as_str) {
                return Some(name.to_string());
            }
        }
    }
    if let Ok(content) = fs::read_to_string(dir.join("Cargo.toml")) {
        for line in content.lines() {
            let line = line.trim();
            if let Some(rest) = line.strip_prefix("name") {
                let rest = rest.trim_start();
                if let Some(rest) = rest.strip_prefix('=') {
                    let name = rest.trim().trim_matches('"');
                    if !name.is_empty() {
                        return Some(name.to_string());
                    }
                }
            }
        }
    }
    None
}

/// `.git` is a regular file ⇒ linked worktree; parse its `gitdir:` line.
fn detect_worktree(dir: &Path) -> Option<WorktreeInfo> {
    let git_path = dir.join(".git");
    if !git_path.is_file() {
        return None;
    }

    let content = fs::read_to_string(&git_path).ok()?;
    let gitdir_line = content.lines().find_map(|l| l.strip_prefix("gitdir:"))?;
    let worktree_git_dir = PathBuf::from(gitdir_line.trim());

    // worktree_git_dir looks like <main>/.git/worktrees/<name>; the main
    // repo's .git directory is three levels up, and its parent is the repo.
    let main_git_dir = worktree_git_dir.ancestors().nth(2)?;
    let main_repo_path = main_git_dir.parent()?.to_path_buf();

    let branch = git_current_branch(dir).unwrap_or_else(|_| "HEAD".to_string());
    let parent_repo_id = main_repo_path.file_name()?.to_string_lossy().to_string();

    Some(WorktreeInfo { parent_repo_id, branch, main_worktree_path: main_repo_path })
}

fn git_current_branch(dir: &Path) -> Result<String> {
    let output = run_git(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    Ok(output.trim().to_string())
}

fn git_branch_exists(dir: &Path, branch: &str) -> bool {
    std::process::Command::new("git")
        .args(["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")])
        .current_dir(dir)
        .output()
        .is_ok_and(|o| o.status.success())
}

fn run_git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .with_context(|| format!("running git {args:?}"))?;
    if !output.status.success() {
        anyhow::bail!("git {args:?} failed: {}", String::from_utf8_lossy(&output.stderr));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn git_status_for(project: &Project) -> Result<GitStatus> {
    let branch = git_current_branch(&project.path).unwrap_or_else(|_| "HEAD".to_string());

    let porcelain = run_git(&project.path, &["status", "--porcelain"])?;
    let files: Vec<GitFile> = porcelain
        .lines()
        .filter(|l| !l.is_empty())
        .map(|line| {
            let status = line.get(0..2).unwrap_or("??").trim().to_string();
            let path = line.get(3..).unwrap_or("").to_string();
            GitFile { status, path }
        })
        .collect();

    let (ahead, behind) = git_ahead_behind(&project.path, &branch);

    let branches_raw = run_git(&project.path, &["branch", "--list", "--format=%(refname:short)"])
        .unwrap_or_default();
    let branches: Vec<String> = branches_raw.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from).collect();

    Ok(GitStatus {
        branch,
        is_dirty: !files.is_empty(),
        changed_files: files.len(),
        files,
        ahead,
        behind,
        is_worktree: project.worktree.is_some(),
        parent_repo_id: project.worktree.as_ref().map(|w| w.parent_repo_id.clone()),
        branches,
    })
}

fn git_ahead_behind(dir: &Path, branch: &str) -> (u32, u32) {
    let upstream = format!("{branch}@{{upstream}}");
    let Ok(output) = run_git(dir, &["rev-list", "--left-right", "--count", &format!("{upstream}...HEAD")]) else {
        return (0, 0);
    };
    let mut parts = output.split_whitespace();
    let behind = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let ahead = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (ahead, behind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn validate_rejects_traversal_and_separators() {
        assert!(validate_project_id("demo").is_ok());
        assert!(validate_project_id("demo.app").is_ok());
        assert!(validate_project_id("a--b").is_ok());
        assert!(validate_project_id("").is_err());
        assert!(validate_project_id("..").is_err());
        assert!(validate_project_id("../x").is_err());
        assert!(validate_project_id("a/b").is_err());
        assert!(validate_project_id("a\\b").is_err());
        assert!(validate_project_id("a\0b").is_err());
    }

    #[test]
    fn list_finds_marker_directories_only() {
        let base = TempDir::new().unwrap();
        fs::create_dir(base.path().join("has-cargo")).unwrap();
        fs::write(base.path().join("has-cargo/Cargo.toml"), "[package]\nname=\"demo\"\n").unwrap();
        fs::create_dir(base.path().join("no-marker")).unwrap();

        let registry = ProjectRegistry::new(base.path().to_path_buf());
        let projects = registry.list().unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, "has-cargo");
        assert_eq!(projects[0].name, "demo");
    }

    #[test]
    fn get_rejects_invalid_id_before_touching_disk() {
        let base = TempDir::new().unwrap();
        let registry = ProjectRegistry::new(base.path().to_path_buf());
        assert!(matches!(registry.get("../etc"), Err(AppError::InvalidProject(_))));
    }

    #[test]
    fn get_missing_project_is_invalid_project() {
        let base = TempDir::new().unwrap();
        let registry = ProjectRegistry::new(base.path().to_path_buf());
        assert!(matches!(registry.get("nope"), Err(AppError::InvalidProject(_))));
    }
}
