use std::path::Path;
use std::time::Duration;

use git2::{Cred, FetchOptions, IndexAddOption, PushOptions, RemoteCallbacks, Repository, Signature};

use crate::error::{AppError, Result};

const COMMIT_AUTHOR_NAME: &str = "Graft Bot";
const COMMIT_AUTHOR_EMAIL: &str = "graft[bot]@users.noreply.github.com";

/// Validate a branch name. Names starting with `-` are rejected so they
/// can never be mistaken for flags by downstream tooling.
pub fn validate_branch_name(name: &str) -> Result<()> {
    if name.starts_with('-') {
        return Err(AppError::Git(format!(
            "Invalid branch name (starts with '-'): {name}"
        )));
    }
    Ok(())
}

/// Build `FetchOptions` that authenticate via credential callback.
/// The token is captured by the closure and never written to disk.
fn make_fetch_options(token: &str) -> FetchOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
        Cred::userpass_plaintext("x-access-token", token)
    });
    let mut opts = FetchOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

/// Build `PushOptions` that authenticate via credential callback.
fn make_push_options(token: &str) -> PushOptions<'_> {
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |_url, _username_from_url, _allowed_types| {
        Cred::userpass_plaintext("x-access-token", token)
    });
    let mut opts = PushOptions::new();
    opts.remote_callbacks(callbacks);
    opts
}

/// Map a fetch/push failure to the error taxonomy. Auth, certificate,
/// bad-ref, and non-fast-forward failures do not improve with retries;
/// everything else is treated as a network blip.
fn remote_error(op_name: &str, branch: &str, e: git2::Error) -> AppError {
    let message = format!("{op_name} of {branch} failed: {}", e.message());
    match e.code() {
        git2::ErrorCode::Auth
        | git2::ErrorCode::Certificate
        | git2::ErrorCode::NotFound
        | git2::ErrorCode::InvalidSpec
        | git2::ErrorCode::NotFastForward => AppError::Git(message),
        _ => AppError::Transient(message),
    }
}

/// Run a blocking git network operation with a deadline. Hitting the
/// deadline surfaces as a transient failure, never a hang.
async fn with_deadline<T, F>(op_name: &str, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let joined = tokio::time::timeout(timeout, tokio::task::spawn_blocking(f)).await;
    match joined {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(AppError::Git(format!("{op_name} task panicked: {e}"))),
        Err(_) => Err(AppError::Transient(format!(
            "{op_name} timed out after {}s",
            timeout.as_secs()
        ))),
    }
}

/// Fetch a branch from origin so `refs/remotes/origin/<branch>` points at
/// the remote tip. Always called before any branch creation.
pub async fn fetch_branch(
    repo_root: &Path,
    branch: &str,
    token: &str,
    timeout: Duration,
) -> Result<()> {
    validate_branch_name(branch)?;

    let repo_root = repo_root.to_path_buf();
    let branch = branch.to_string();
    let token = token.to_string();

    with_deadline("Fetch", timeout, move || {
        let repo = Repository::open(&repo_root)?;
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("+refs/heads/{branch}:refs/remotes/origin/{branch}");
        let mut fetch_opts = make_fetch_options(&token);
        remote
            .fetch(&[&refspec], Some(&mut fetch_opts), None)
            .map_err(|e| remote_error("Fetch", &branch, e))?;
        Ok(())
    })
    .await
}

/// Check if there are any staged or unstaged changes.
pub async fn has_changes(dir: &Path) -> Result<bool> {
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    })
    .await
    .map_err(|e| AppError::Git(format!("Status task panicked: {e}")))?
}

/// Stage everything and commit. Returns false when there was nothing to
/// commit.
pub async fn commit_all(dir: &Path, message: &str) -> Result<bool> {
    let dir = dir.to_path_buf();
    let message = message.to_string();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;

        let statuses = repo.statuses(None)?;
        if statuses.is_empty() {
            return Ok(false);
        }

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let sig = Signature::now(COMMIT_AUTHOR_NAME, COMMIT_AUTHOR_EMAIL)?;
        let tree_oid = index.write_tree()?;
        let tree = repo.find_tree(tree_oid)?;
        let head = repo.head()?;
        let parent = head.peel_to_commit()?;
        repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?;
        Ok(true)
    })
    .await
    .map_err(|e| AppError::Git(format!("Commit task panicked: {e}")))?
}

/// Push a branch to origin. Network failures are transient (retried by
/// the caller's budget); hard failures surface immediately.
pub async fn push(repo_dir: &Path, branch: &str, token: &str, timeout: Duration) -> Result<()> {
    validate_branch_name(branch)?;

    let repo_dir = repo_dir.to_path_buf();
    let branch = branch.to_string();
    let token = token.to_string();

    with_deadline("Push", timeout, move || {
        let repo = Repository::open(&repo_dir)?;
        let mut remote = repo.find_remote("origin")?;
        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let mut push_opts = make_push_options(&token);
        remote
            .push(&[&refspec], Some(&mut push_opts))
            .map_err(|e| remote_error("Push", &branch, e))?;
        Ok(())
    })
    .await
}

/// Current branch shorthand of a checkout.
pub async fn current_branch(dir: &Path) -> Result<String> {
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || {
        let repo = Repository::open(&dir)?;
        let head = repo.head()?;
        head.shorthand()
            .map(|s| s.to_string())
            .ok_or_else(|| AppError::Git("HEAD is not a branch".to_string()))
    })
    .await
    .map_err(|e| AppError::Git(format!("Branch task panicked: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_validate_branch_name_rejects_dash_prefix() {
        assert!(validate_branch_name("-evil").is_err());
        assert!(validate_branch_name("--upload-pack").is_err());
    }

    #[test]
    fn test_validate_branch_name_accepts_normal() {
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("graft/bug-42-abc12345").is_ok());
    }

    #[test]
    fn test_remote_error_classification() {
        use git2::{Error, ErrorClass, ErrorCode};

        // Bad credentials and missing refs do not get the retry budget.
        let auth = Error::new(ErrorCode::Auth, ErrorClass::Http, "authentication required");
        assert!(matches!(remote_error("Push", "main", auth), AppError::Git(_)));

        let missing = Error::new(ErrorCode::NotFound, ErrorClass::Reference, "ref not found");
        assert!(matches!(remote_error("Fetch", "main", missing), AppError::Git(_)));

        let rejected = Error::new(
            ErrorCode::NotFastForward,
            ErrorClass::Reference,
            "non-fast-forward",
        );
        assert!(matches!(remote_error("Push", "main", rejected), AppError::Git(_)));

        // Everything else stays retryable.
        let reset = Error::new(ErrorCode::GenericError, ErrorClass::Net, "connection reset");
        assert!(matches!(
            remote_error("Fetch", "main", reset),
            AppError::Transient(_)
        ));
    }

    fn init_repo_with_commit(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            fs::write(dir.join("README.md"), "hello").unwrap();
            let mut index = repo.index().unwrap();
            index
                .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
                .unwrap();
            index.write().unwrap();
            let tree_oid = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_oid).unwrap();
            let sig = Signature::now("t", "t@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        repo
    }

    #[tokio::test]
    async fn test_has_changes_clean_and_dirty() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo_with_commit(tmp.path());

        assert!(!has_changes(tmp.path()).await.unwrap());

        fs::write(tmp.path().join("new.txt"), "world").unwrap();
        assert!(has_changes(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_all_commits_and_reports_no_changes() {
        let tmp = tempfile::tempdir().unwrap();
        init_repo_with_commit(tmp.path());

        // Nothing dirty: no commit is made.
        assert!(!commit_all(tmp.path(), "noop").await.unwrap());

        fs::write(tmp.path().join("feature.rs"), "fn f() {}").unwrap();
        assert!(commit_all(tmp.path(), "add feature").await.unwrap());

        let repo = Repository::open(tmp.path()).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        assert_eq!(head.message(), Some("add feature"));
        assert!(!has_changes(tmp.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_current_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo_with_commit(tmp.path());
        let name = current_branch(tmp.path()).await.unwrap();
        let head = repo.head().unwrap();
        assert_eq!(Some(name.as_str()), head.shorthand());
    }
}
