//! Default git-backed effect handlers.
//!
//! The engine only knows the effect ABI; these handlers are the CLI host's
//! implementations of the required set: `commit`, `snapshot`,
//! `worktree.create`, `worktree.remove`, and `review.post`. All of them
//! shell out to the `git` binary in the run's working directory, except
//! `review.post`, which appends to a local review log.

use clap::ValueEnum;
use conductor_core::{EffectRegistry, EngineError, Result};
use serde_json::{json, Value};
use std::path::Path;
use tokio::process::Command;
use tracing::info;

/// How `commit` folds work into the target branch, when one is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

/// Host-level options threaded from the CLI flags.
#[derive(Debug, Clone)]
pub struct GitEffectOptions {
    pub target_branch: Option<String>,
    pub merge_method: MergeMethod,
    pub skip_rebase: bool,
}

impl Default for GitEffectOptions {
    fn default() -> Self {
        Self {
            target_branch: None,
            merge_method: MergeMethod::Merge,
            skip_rebase: false,
        }
    }
}

async fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await
        .map_err(|e| EngineError::EffectFailed {
            name: "git".into(),
            message: format!("failed to run git: {e}"),
        })?;
    if !output.status.success() {
        return Err(EngineError::EffectFailed {
            name: "git".into(),
            message: format!(
                "git {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Build the registry with every handler the core requires from its host.
pub fn registry(options: GitEffectOptions) -> EffectRegistry {
    let mut registry = EffectRegistry::new();

    let commit_options = options.clone();
    registry.register("commit", move |spec, ctx| {
        let options = commit_options.clone();
        Box::pin(async move {
            let message = arg_str(&spec.args, "message").unwrap_or_else(|| "conductor commit".into());
            let full_message = match arg_str(&spec.args, "notes") {
                Some(notes) => format!("{message}\n\n{notes}"),
                None => message.clone(),
            };
            git(&ctx.working_dir, &["add", "-A"]).await?;
            git(&ctx.working_dir, &["commit", "-m", &full_message, "--allow-empty"]).await?;
            let sha = git(&ctx.working_dir, &["rev-parse", "HEAD"]).await?;
            info!(sha = %sha, "committed");

            if let Some(target) = &options.target_branch {
                if !options.skip_rebase {
                    git(&ctx.working_dir, &["rebase", target]).await?;
                }
                if spec.args.get("merge").and_then(Value::as_bool) == Some(true) {
                    let head = git(&ctx.working_dir, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
                    git(&ctx.working_dir, &["checkout", target]).await?;
                    match options.merge_method {
                        MergeMethod::Merge => {
                            git(&ctx.working_dir, &["merge", "--no-edit", &head]).await?;
                        }
                        MergeMethod::Squash => {
                            git(&ctx.working_dir, &["merge", "--squash", &head]).await?;
                            git(&ctx.working_dir, &["commit", "-m", &message]).await?;
                        }
                        MergeMethod::Rebase => {
                            git(&ctx.working_dir, &["rebase", &head]).await?;
                        }
                    }
                    git(&ctx.working_dir, &["checkout", &head]).await?;
                }
            }
            Ok(json!({ "sha": sha }))
        })
    });

    registry.register("snapshot", |spec, ctx| {
        Box::pin(async move {
            // `stash create` records the tree without touching the index or
            // moving HEAD.
            let description = arg_str(&spec.args, "description").unwrap_or_default();
            let oid = git(&ctx.working_dir, &["stash", "create", &description]).await?;
            Ok(json!({ "snapshot": oid, "description": description }))
        })
    });

    registry.register("worktree.create", {
        let options = options.clone();
        move |spec, ctx| {
            let options = options.clone();
            Box::pin(async move {
                let path = arg_str(&spec.args, "path").ok_or_else(|| EngineError::EffectFailed {
                    name: "worktree.create".into(),
                    message: "missing 'path'".into(),
                })?;
                let branch = arg_str(&spec.args, "branch").ok_or_else(|| {
                    EngineError::EffectFailed {
                        name: "worktree.create".into(),
                        message: "missing 'branch'".into(),
                    }
                })?;
                let base = arg_str(&spec.args, "base")
                    .or_else(|| options.target_branch.clone())
                    .unwrap_or_else(|| "HEAD".into());
                git(&ctx.working_dir, &["worktree", "add", "-b", &branch, &path, &base]).await?;
                Ok(json!({ "path": path, "branch": branch, "base": base }))
            })
        }
    });

    registry.register("worktree.remove", |spec, ctx| {
        Box::pin(async move {
            let path = arg_str(&spec.args, "path").ok_or_else(|| EngineError::EffectFailed {
                name: "worktree.remove".into(),
                message: "missing 'path'".into(),
            })?;
            git(&ctx.working_dir, &["worktree", "remove", "--force", &path]).await?;
            Ok(json!({ "removed": path }))
        })
    });

    registry.register("review.post", |spec, ctx| {
        Box::pin(async move {
            let body = arg_str(&spec.args, "body")
                .or_else(|| arg_str(&spec.args, "message"))
                .unwrap_or_default();
            let dir = ctx.working_dir.join(".conductor");
            tokio::fs::create_dir_all(&dir).await.map_err(|e| EngineError::EffectFailed {
                name: "review.post".into(),
                message: e.to_string(),
            })?;
            let line = json!({
                "execution": ctx.execution_id,
                "node": spec.node_path,
                "body": body,
            })
            .to_string();
            let path = dir.join("reviews.jsonl");
            let mut existing = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            existing.push_str(&line);
            existing.push('\n');
            tokio::fs::write(&path, existing).await.map_err(|e| EngineError::EffectFailed {
                name: "review.post".into(),
                message: e.to_string(),
            })?;
            Ok(json!({ "posted": true }))
        })
    });

    registry
}
