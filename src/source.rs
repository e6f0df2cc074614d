use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::PreviewError;
use crate::process::{CommandSpec, ProcessRunner};

/// Produces a local source tree for a repository at a given ref.
///
/// The caller owns the returned directory and removes it after use.
#[async_trait]
pub trait SourceProvider: Send + Sync {
    async fn clone_source(
        &self,
        repo_owner: &str,
        repo_name: &str,
        git_ref: Option<&str>,
        output: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<PathBuf, PreviewError>;
}

/// Clones with the `git` CLI into a fresh directory under `workspace_dir`.
pub struct GitSource {
    runner: Arc<dyn ProcessRunner>,
    git_bin: String,
    url_template: String,
    workspace_dir: PathBuf,
}

impl GitSource {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        git_bin: impl Into<String>,
        url_template: impl Into<String>,
        workspace_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            runner,
            git_bin: git_bin.into(),
            url_template: url_template.into(),
            workspace_dir: workspace_dir.as_ref().to_path_buf(),
        }
    }

    pub fn clone_url(&self, repo_owner: &str, repo_name: &str) -> String {
        self.url_template
            .replace("{owner}", repo_owner)
            .replace("{repo}", repo_name)
    }

    async fn run_git(
        &self,
        args: &[&str],
        cwd: Option<&Path>,
        output: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), PreviewError> {
        let mut cmd = CommandSpec::new(&self.git_bin).args(args.iter().copied());
        if let Some(dir) = cwd {
            cmd = cmd.current_dir(dir);
        }
        output(&format!("$ {}\n", cmd));
        let code = self
            .runner
            .execute(&cmd, output)
            .await
            .map_err(|e| PreviewError::CloneFailed(format!("{:#}", e)))?;
        if code != 0 {
            return Err(PreviewError::CloneFailed(format!(
                "`git {}` exited with status {}",
                args.first().copied().unwrap_or_default(),
                code
            )));
        }
        Ok(())
    }

    async fn checkout(
        &self,
        url: &str,
        target: &Path,
        git_ref: Option<&str>,
        output: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<(), PreviewError> {
        let target_str = target.to_string_lossy();
        self.run_git(&["clone", "--quiet", url, &*target_str], None, output)
            .await?;
        if let Some(git_ref) = git_ref.filter(|r| !r.is_empty()) {
            self.run_git(&["fetch", "--quiet", "origin", git_ref], Some(target), output)
                .await?;
            self.run_git(
                &["checkout", "--quiet", "--detach", "FETCH_HEAD"],
                Some(target),
                output,
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn clone_source(
        &self,
        repo_owner: &str,
        repo_name: &str,
        git_ref: Option<&str>,
        output: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<PathBuf, PreviewError> {
        tokio::fs::create_dir_all(&self.workspace_dir)
            .await
            .map_err(|e| {
                PreviewError::CloneFailed(format!(
                    "cannot create workspace {}: {}",
                    self.workspace_dir.display(),
                    e
                ))
            })?;

        let target = self.workspace_dir.join(format!(
            "{}-{}",
            crate::sanitize_name(repo_name),
            Uuid::new_v4().simple()
        ));
        let url = self.clone_url(repo_owner, repo_name);

        tracing::info!(repo = %url, git_ref, target = %target.display(), "Cloning source");
        if let Err(e) = self.checkout(&url, &target, git_ref, output).await {
            if let Err(rm) = tokio::fs::remove_dir_all(&target).await
                && rm.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(error = %rm, target = %target.display(), "Failed to remove partial clone");
            }
            return Err(e);
        }
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDocker;

    #[test]
    fn clone_url_substitutes_owner_and_repo() {
        let source = GitSource::new(
            Arc::new(FakeDocker::default()),
            "git",
            "https://github.com/{owner}/{repo}.git",
            "/tmp/previewd",
        );
        assert_eq!(
            source.clone_url("acme", "shop"),
            "https://github.com/acme/shop.git"
        );
    }

    #[tokio::test]
    async fn fetches_ref_after_clone() {
        let workspace = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeDocker::default());
        let source = GitSource::new(runner.clone(), "git", "file:///{owner}/{repo}", workspace.path());

        let mut log = String::new();
        let path = source
            .clone_source("acme", "Shop", Some("refs/pull/42/head"), &mut |c| log.push_str(c))
            .await
            .unwrap();

        assert!(path.starts_with(workspace.path()));
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("shop-"));
        let calls = runner.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0].args[0], "clone");
        assert_eq!(calls[1].args, vec!["fetch", "--quiet", "origin", "refs/pull/42/head"]);
        assert_eq!(calls[2].cwd.as_deref(), Some(path.as_path()));
        assert!(log.contains("$ git clone --quiet file:///acme/Shop"));
    }

    #[tokio::test]
    async fn failed_clone_reports_clone_failed() {
        let workspace = tempfile::tempdir().unwrap();
        let runner = Arc::new(FakeDocker::default());
        runner.fail_when("clone", 128, "fatal: repository not found\n");
        let source = GitSource::new(runner, "git", "file:///{owner}/{repo}", workspace.path());

        let mut log = String::new();
        let err = source
            .clone_source("acme", "missing", None, &mut |c| log.push_str(c))
            .await
            .unwrap_err();

        assert!(matches!(err, PreviewError::CloneFailed(_)));
        assert!(log.contains("repository not found"));
        assert_eq!(std::fs::read_dir(workspace.path()).unwrap().count(), 0);
    }
}
