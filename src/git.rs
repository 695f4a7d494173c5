use derive_more::{Display, From};
use git2::build::RepoBuilder;
use git2::{
    Commit, Cred, CredentialType, FetchOptions, IndexAddOption, Oid, PushOptions,
    RemoteCallbacks, Repository, Signature,
};
use log::debug;
use std::path::Path;

#[derive(Debug, From, Display)]
pub enum GitError {
    #[display(fmt = "{}", _0)]
    Git(git2::Error),
    #[from(ignore)]
    #[display(fmt = "HEAD does not point to a branch")]
    DetachedHead,
    #[from(ignore)]
    #[display(fmt = "Remote rejected {}: {}", refname, message)]
    PushRejected { refname: String, message: String },
}

impl std::error::Error for GitError {}

pub type GitResult<T> = Result<T, GitError>;

/// Author and message used for the overlay commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
    pub message: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "Git the Pusher".to_string(),
            email: "git@push.org".to_string(),
            message: "Go push faster".to_string(),
        }
    }
}

/// The version control operations a pipeline needs. Every operation
/// works on the repository found at `path`.
pub trait VersionControl: Send + Sync {
    fn clone_repository(&self, url: &str, path: &Path) -> GitResult<()>;

    /// Adds every working tree change to the index
    fn stage_all(&self, path: &Path) -> GitResult<()>;

    /// Commits the index on top of HEAD with the current time
    fn commit(&self, path: &Path, identity: &CommitIdentity) -> GitResult<Oid>;

    /// Pushes the branch HEAD points at to the same branch on origin
    fn push(&self, path: &Path) -> GitResult<()>;
}

/// [`VersionControl`] backed by libgit2
#[derive(Debug, Default, Clone, Copy)]
pub struct Git2;

/// Callbacks authenticating against remotes. SSH remotes use the
/// running ssh-agent and everything else libgit2's defaults.
fn remote_callbacks<'a>() -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    let mut attempts = 0;
    callbacks.credentials(move |url, username, allowed| {
        // libgit2 keeps asking while the remote refuses the credentials
        attempts += 1;
        if attempts > 1 {
            return Err(git2::Error::from_str(&format!(
                "Authentication failed for {url}"
            )));
        }
        let username = username.unwrap_or("git");
        if allowed.contains(CredentialType::SSH_KEY) {
            Cred::ssh_key_from_agent(username)
        } else if allowed.contains(CredentialType::USERNAME) {
            Cred::username(username)
        } else {
            Cred::default()
        }
    });
    callbacks
}

impl VersionControl for Git2 {
    fn clone_repository(&self, url: &str, path: &Path) -> GitResult<()> {
        let mut fetch_options = FetchOptions::new();
        fetch_options.remote_callbacks(remote_callbacks());
        RepoBuilder::new()
            .fetch_options(fetch_options)
            .clone(url, path)?;
        Ok(())
    }

    fn stage_all(&self, path: &Path) -> GitResult<()> {
        let repo = Repository::open(path)?;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }

    fn commit(&self, path: &Path, identity: &CommitIdentity) -> GitResult<Oid> {
        let repo = Repository::open(path)?;
        let mut index = repo.index()?;
        let tree = repo.find_tree(index.write_tree()?)?;
        let signature = Signature::now(&identity.name, &identity.email)?;

        // Cloning an empty repository leaves HEAD unborn
        let parent = repo.head().ok().and_then(|head| head.peel_to_commit().ok());
        let parents: Vec<&Commit> = parent.iter().collect();

        let oid = repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &identity.message,
            &tree,
            &parents,
        )?;
        Ok(oid)
    }

    fn push(&self, path: &Path) -> GitResult<()> {
        let repo = Repository::open(path)?;
        let head = repo.head()?;
        if !head.is_branch() {
            return Err(GitError::DetachedHead);
        }
        let refname = head.name().ok_or(GitError::DetachedHead)?.to_string();
        let mut remote = repo.find_remote("origin")?;

        let mut rejected: Option<(String, String)> = None;
        {
            let mut callbacks = remote_callbacks();
            callbacks.push_update_reference(|name, status| {
                if let Some(message) = status {
                    rejected = Some((name.to_string(), message.to_string()));
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(callbacks);
            remote.push(&[format!("{refname}:{refname}")], Some(&mut options))?;
        }

        if let Some((refname, message)) = rejected {
            return Err(GitError::PushRejected { refname, message });
        }
        debug!("Pushed {refname} from {}", path.display());
        Ok(())
    }
}
