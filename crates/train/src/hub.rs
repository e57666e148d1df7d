//! Publishing the fine-tuned policy to a model hub.
//!
//! [`ModelHub`] is the seam; [`LocalHub`] is a filesystem implementation
//! laid out as `root/<user>/<repo>/{main,branches/<name>}` with a
//! `commits.jsonl` log per repo. Each push uploads model and tokenizer to
//! `main` and then snapshots it into a `step-NNNNN` branch named after the
//! number of prompts trained on.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use rewardtune_common::{TextTokenizer, TrainingArguments};
use rewardtune_core::PolicyModel;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("branch {branch} already exists in {repo_id}")]
    BranchExists { repo_id: String, branch: String },

    #[error("repository {0} not found")]
    RepoNotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HubResult<T> = std::result::Result<T, HubError>;

/// Destination for published models.
pub trait ModelHub {
    /// Account namespace that repo names are created under.
    fn whoami(&self) -> HubResult<String>;

    /// Upload files to the main revision of `repo_id`, creating the repo if
    /// needed. `write` fills the given directory. Returns a commit reference.
    fn upload(
        &self,
        repo_id: &str,
        commit_message: &str,
        write: &mut dyn FnMut(&Path) -> anyhow::Result<()>,
    ) -> HubResult<String>;

    /// Create `branch` from the current main revision.
    fn create_branch(&self, repo_id: &str, branch: &str) -> HubResult<String>;

    fn delete_branch(&self, repo_id: &str, branch: &str) -> HubResult<()>;
}

// ── LocalHub ────────────────────────────────────────────────────────────────

pub struct LocalHub {
    root: PathBuf,
    user: String,
}

#[derive(Serialize)]
struct CommitEntry<'a> {
    revision: usize,
    message: &'a str,
    timestamp: String,
}

impl LocalHub {
    pub fn new(root: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            user: user.into(),
        }
    }

    fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.root.join(repo_id)
    }

    fn branch_dir(&self, repo_id: &str, branch: &str) -> PathBuf {
        self.repo_dir(repo_id).join("branches").join(branch)
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

impl ModelHub for LocalHub {
    fn whoami(&self) -> HubResult<String> {
        Ok(self.user.clone())
    }

    fn upload(
        &self,
        repo_id: &str,
        commit_message: &str,
        write: &mut dyn FnMut(&Path) -> anyhow::Result<()>,
    ) -> HubResult<String> {
        let repo = self.repo_dir(repo_id);
        let main = repo.join("main");
        std::fs::create_dir_all(&main)?;
        write(&main)?;

        let log_path = repo.join("commits.jsonl");
        let revision = std::fs::read_to_string(&log_path)
            .map(|s| s.lines().count())
            .unwrap_or(0);
        let entry = CommitEntry {
            revision,
            message: commit_message,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        writeln!(log, "{}", serde_json::to_string(&entry).map_err(anyhow::Error::from)?)?;
        Ok(format!("{}@{revision}", repo.display()))
    }

    fn create_branch(&self, repo_id: &str, branch: &str) -> HubResult<String> {
        let main = self.repo_dir(repo_id).join("main");
        if !main.exists() {
            return Err(HubError::RepoNotFound(repo_id.to_string()));
        }
        let dir = self.branch_dir(repo_id, branch);
        if dir.exists() {
            return Err(HubError::BranchExists {
                repo_id: repo_id.to_string(),
                branch: branch.to_string(),
            });
        }
        copy_dir(&main, &dir)?;
        Ok(dir.display().to_string())
    }

    fn delete_branch(&self, repo_id: &str, branch: &str) -> HubResult<()> {
        std::fs::remove_dir_all(self.branch_dir(repo_id, branch))?;
        Ok(())
    }
}

// ── Push policy ─────────────────────────────────────────────────────────────

/// Whether to publish after `completed` of `total` superbatches.
pub fn should_push(completed: usize, total: usize, args: &TrainingArguments) -> bool {
    if !args.publishing_enabled() {
        return false;
    }
    let listed = args.push_to_hub_additional_indices.contains(&completed);
    if completed == 0 && !listed {
        return false;
    }
    completed % args.push_to_hub_interval == 0 || completed == total || listed
}

/// Repo name with the optional `-{param}-{value}` sweep suffix.
pub fn repo_name(args: &TrainingArguments) -> Option<String> {
    let base = args.hub_repo_id.as_deref()?;
    Some(match args.sweep_param_value() {
        Some(value) => format!("{base}-{}-{value}", args.sweep_param_name),
        None => base.to_string(),
    })
}

/// Branch named after the number of prompts trained on.
pub fn branch_name(completed: usize, prompts_per_superbatch: usize) -> String {
    format!("step-{:05}", completed * prompts_per_superbatch)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Skipped,
    /// The repo name contains "debug": logged, nothing uploaded.
    DryRun { repo_name: String },
    Pushed { repo_id: String, branch: String },
}

/// Publish model and tokenizer if the cadence says so. A branch that
/// already exists is deleted and recreated.
pub fn publish<M: PolicyModel + ?Sized>(
    hub: &dyn ModelHub,
    args: &TrainingArguments,
    model: &M,
    tokenizer: &TextTokenizer,
    completed: usize,
    total: usize,
    prompts_per_superbatch: usize,
) -> anyhow::Result<PublishOutcome> {
    if !should_push(completed, total, args) {
        return Ok(PublishOutcome::Skipped);
    }
    let Some(name) = repo_name(args) else {
        return Ok(PublishOutcome::Skipped);
    };
    info!("Pushing model and tokenizer to the hub");
    if args
        .hub_repo_id
        .as_deref()
        .is_some_and(|id| id.contains("debug"))
    {
        info!("{name} (not actually pushed due to 'debug' in name)");
        return Ok(PublishOutcome::DryRun { repo_name: name });
    }

    let repo_id = format!("{}/{name}", hub.whoami()?);
    let commit = hub.upload(
        &repo_id,
        &format!("Upload model from superbatch {completed}"),
        &mut |dir| model.save_weights(dir),
    )?;
    info!("Uploaded {commit}");
    let commit = hub.upload(
        &repo_id,
        &format!("Upload tokenizer from superbatch {completed}"),
        &mut |dir| tokenizer.save(dir),
    )?;
    info!("Uploaded {commit}");

    let branch = branch_name(completed, prompts_per_superbatch);
    let created = match hub.create_branch(&repo_id, &branch) {
        Err(HubError::BranchExists { .. }) => {
            warn!("Branch {branch} exists in {repo_id}, recreating it");
            hub.delete_branch(&repo_id, &branch)?;
            hub.create_branch(&repo_id, &branch)?
        }
        other => other?,
    };
    info!("Created branch {created}");
    Ok(PublishOutcome::Pushed { repo_id, branch })
}
