//! Source-control capability backed by libgit2.
//!
//! The lifecycle engine only needs three things from git: clone a remote into
//! a fresh directory, read back the `origin` URL of an existing working tree,
//! and describe the checked-out HEAD commit. [`SourceControl`] is that seam;
//! [`Git2Source`] is the real implementation.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use git2::build::RepoBuilder;
use git2::{Cred, CredentialType, Direction, FetchOptions, RemoteCallbacks, Repository};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Metadata of the checked-out commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Abbreviated (7 character) commit id.
    pub hash: String,
    pub message: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Display for CommitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} by {} at {}",
            self.hash,
            self.message,
            self.author,
            self.timestamp.to_rfc3339()
        )
    }
}

/// Credentials used for ssh remotes, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitAuth {
    /// Private key file (no passphrase).
    KeyFile(PathBuf),
    /// Ask the running ssh-agent.
    Agent,
}

impl GitAuth {
    /// Pick a key: the configured one, then `~/.ssh/id_rsa`, then
    /// `~/.ssh/id_ed25519`, falling back to the ssh agent.
    pub fn resolve(configured: Option<&Path>) -> Self {
        if let Some(key) = configured {
            return GitAuth::KeyFile(key.to_path_buf());
        }

        dirs::home_dir()
            .map(|home| home.join(".ssh"))
            .into_iter()
            .flat_map(|ssh| [ssh.join("id_rsa"), ssh.join("id_ed25519")])
            .find(|key| key.is_file())
            .map_or(GitAuth::Agent, GitAuth::KeyFile)
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let attempts = Cell::new(0u8);
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |url, username_from_url, allowed| {
            // libgit2 keeps asking while credentials are rejected.
            attempts.set(attempts.get() + 1);
            if attempts.get() > 3 {
                return Err(git2::Error::from_str(&format!(
                    "authentication failed for {}",
                    url
                )));
            }

            let user = username_from_url.unwrap_or("git");
            if allowed.contains(CredentialType::SSH_KEY) {
                return match self {
                    GitAuth::KeyFile(key) => Cred::ssh_key(user, None, key, None),
                    GitAuth::Agent => Cred::ssh_key_from_agent(user),
                };
            }
            if allowed.contains(CredentialType::USERNAME) {
                return Cred::username(user);
            }
            Cred::default()
        });
        callbacks
    }
}

/// What the app lifecycle needs from source control. Implementations are
/// blocking; callers run them on the blocking thread pool.
pub trait SourceControl: Send + Sync {
    /// Clone `url` into `dest`, which must not exist yet. Shallow and
    /// single-branch where the transport allows it.
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()>;

    /// URL of the `origin` remote of the working tree at `dir`.
    fn remote_url(&self, dir: &Path) -> Result<String>;

    /// Metadata of HEAD in the working tree at `dir`.
    fn head_commit(&self, dir: &Path) -> Result<CommitInfo>;
}

/// [`SourceControl`] over libgit2.
#[derive(Debug, Clone)]
pub struct Git2Source {
    auth: GitAuth,
}

impl Git2Source {
    pub fn new(auth: GitAuth) -> Self {
        Self { auth }
    }

    /// Ask the remote which branch its HEAD points to, e.g. `main`.
    fn default_branch(&self, url: &str) -> Result<String> {
        let mut remote = git2::Remote::create_detached(url)?;
        let connection = remote.connect_auth(Direction::Fetch, Some(self.auth.callbacks()), None)?;
        let head = connection.default_branch()?;
        let head = head
            .as_str()
            .context("remote default branch is not valid UTF-8")?;
        let branch = head
            .strip_prefix("refs/heads/")
            .with_context(|| format!("unexpected remote HEAD {}", head))?;
        Ok(branch.to_string())
    }
}

/// Local paths go through libgit2's local transport, which cannot fetch
/// shallow.
fn is_local_url(url: &str) -> bool {
    url.starts_with("file://") || Path::new(url).exists()
}

impl SourceControl for Git2Source {
    fn clone_repo(&self, url: &str, dest: &Path) -> Result<()> {
        let mut fetch = FetchOptions::new();
        fetch.remote_callbacks(self.auth.callbacks());
        if !is_local_url(url) {
            fetch.depth(1);
        }

        let mut builder = RepoBuilder::new();
        builder.fetch_options(fetch);

        match self.default_branch(url) {
            Ok(branch) => {
                let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);
                builder.branch(&branch);
                builder.remote_create(move |repo, name, url| {
                    repo.remote_with_fetch(name, url, &refspec)
                });
            }
            Err(e) => {
                debug!(url, error = %e, "default branch discovery failed, cloning all branches");
            }
        }

        builder
            .clone(url, dest)
            .with_context(|| format!("Failed to clone {} into {}", url, dest.display()))?;
        Ok(())
    }

    fn remote_url(&self, dir: &Path) -> Result<String> {
        let repo = Repository::open(dir).context("Failed to open git repository")?;
        let remote = repo
            .find_remote("origin")
            .context("Repository has no origin remote")?;
        let url = remote
            .url()
            .context("origin remote URL is not valid UTF-8")?;
        Ok(url.to_string())
    }

    fn head_commit(&self, dir: &Path) -> Result<CommitInfo> {
        let repo = Repository::open(dir).context("Failed to open git repository")?;
        let commit = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .context("Failed to resolve HEAD commit")?;

        let id = commit.id().to_string();
        let author = commit.author();
        let when = author.when();
        let timestamp = Utc
            .timestamp_opt(when.seconds(), 0)
            .single()
            .context("commit timestamp out of range")?;

        Ok(CommitInfo {
            hash: id[..7].to_string(),
            message: commit
                .message()
                .unwrap_or_default()
                .trim_end_matches('\n')
                .to_string(),
            author: author.to_string(),
            timestamp,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    /// Create a repository at `dir` with one commit containing `files`.
    pub(crate) fn init_repo(dir: &Path, files: &[(&str, &str)], msg: &str) -> Repository {
        let repo = Repository::init(dir).unwrap();
        commit_files(&repo, files, msg);
        repo
    }

    pub(crate) fn commit_files(repo: &Repository, files: &[(&str, &str)], msg: &str) {
        let root = repo.workdir().unwrap().to_path_buf();
        for (name, content) in files {
            fs::write(root.join(name), content).unwrap();
        }
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
            Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent]),
            None => repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[]),
        }
        .unwrap();
    }

    #[test]
    fn test_clone_then_read_metadata() {
        let upstream = tempdir().unwrap();
        init_repo(upstream.path(), &[("README", "hi\n")], "initial commit\n");
        let url = upstream.path().to_str().unwrap();

        let work = tempdir().unwrap();
        let dest = work.path().join("clone");
        let git = Git2Source::new(GitAuth::Agent);
        git.clone_repo(url, &dest).unwrap();

        assert!(dest.join("README").is_file());
        assert_eq!(git.remote_url(&dest).unwrap(), url);

        let commit = git.head_commit(&dest).unwrap();
        assert_eq!(commit.hash.len(), 7);
        assert_eq!(commit.message, "initial commit");
        assert_eq!(commit.author, "test <test@test.com>");
        let text = commit.to_string();
        assert!(text.starts_with(&commit.hash));
        assert!(text.contains("initial commit by test <test@test.com> at "));
    }

    #[test]
    fn test_clone_checks_out_latest_commit() {
        let upstream = tempdir().unwrap();
        let repo = init_repo(upstream.path(), &[("a.txt", "1")], "first");
        commit_files(&repo, &[("a.txt", "2")], "second");

        let work = tempdir().unwrap();
        let dest = work.path().join("clone");
        let git = Git2Source::new(GitAuth::Agent);
        git.clone_repo(upstream.path().to_str().unwrap(), &dest)
            .unwrap();

        assert_eq!(fs::read_to_string(dest.join("a.txt")).unwrap(), "2");
        assert_eq!(git.head_commit(&dest).unwrap().message, "second");
    }

    #[test]
    fn test_clone_fetches_only_default_branch() {
        let upstream = tempdir().unwrap();
        let repo = init_repo(upstream.path(), &[("a.txt", "1")], "first");
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        repo.branch("feature", &head, false).unwrap();
        let default = repo.head().unwrap().shorthand().unwrap().to_string();

        let work = tempdir().unwrap();
        let dest = work.path().join("clone");
        let git = Git2Source::new(GitAuth::Agent);
        git.clone_repo(upstream.path().to_str().unwrap(), &dest)
            .unwrap();

        let clone = Repository::open(&dest).unwrap();
        assert!(
            clone
                .find_reference(&format!("refs/remotes/origin/{}", default))
                .is_ok()
        );
        assert!(clone.find_reference("refs/remotes/origin/feature").is_err());
        assert!(clone.find_branch("feature", git2::BranchType::Local).is_err());
        let origin = clone.find_remote("origin").unwrap();
        let refspecs: Vec<String> = origin
            .fetch_refspecs()
            .unwrap()
            .iter()
            .flatten()
            .map(str::to_string)
            .collect();
        assert_eq!(
            refspecs,
            vec![format!("+refs/heads/{0}:refs/remotes/origin/{0}", default)]
        );
    }

    #[test]
    fn test_clone_of_missing_remote_fails() {
        let work = tempdir().unwrap();
        let git = Git2Source::new(GitAuth::Agent);
        let missing = work.path().join("does-not-exist");
        let err = git
            .clone_repo(missing.to_str().unwrap(), &work.path().join("clone"))
            .unwrap_err();
        assert!(err.to_string().contains("Failed to clone"));
    }

    #[test]
    fn test_metadata_of_non_repository_fails() {
        let dir = tempdir().unwrap();
        let git = Git2Source::new(GitAuth::Agent);
        assert!(git.remote_url(dir.path()).is_err());
        assert!(git.head_commit(dir.path()).is_err());
    }

    #[test]
    fn test_resolve_prefers_configured_key() {
        let key = PathBuf::from("/keys/deploy");
        assert_eq!(GitAuth::resolve(Some(&key)), GitAuth::KeyFile(key));
    }

    #[test]
    fn test_local_url_detection() {
        let dir = tempdir().unwrap();
        assert!(is_local_url(dir.path().to_str().unwrap()));
        assert!(is_local_url("file:///srv/git/app.git"));
        assert!(!is_local_url("git@github.com:owner/repo.git"));
        assert!(!is_local_url("https://github.com/owner/repo.git"));
    }
}
