use octocrab::Octocrab;

use crate::config::GitHubConfig;
use crate::error::{AppError, Result};
use crate::scm::with_retries;

/// A full issue with its comment thread.
#[derive(Debug, Clone)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone)]
pub struct Comment {
    pub author: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct CreatePullRequest {
    pub title: String,
    pub body: String,
    pub head_branch: String,
    pub base_branch: String,
}

#[derive(Debug, Clone)]
pub struct PullRequestRef {
    pub number: u64,
    pub url: String,
    pub head_branch: String,
    pub base_branch: String,
}

/// GitHub API client scoped to the configured repository. Every outbound
/// comment carries the bot marker, which doubles as the inbound loop
/// filter.
pub struct GitHubClient {
    client: Octocrab,
    owner: String,
    repo: String,
    token: String,
    bot_marker: String,
    max_retries: u32,
}

impl GitHubClient {
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(config.token.clone())
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build GitHub client: {e}")))?;

        Ok(Self {
            client,
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            token: config.token.clone(),
            bot_marker: config.bot_marker.clone(),
            max_retries: config.max_retries,
        })
    }

    /// Token for git credential callbacks.
    pub fn git_token(&self) -> &str {
        &self.token
    }

    pub fn bot_marker(&self) -> &str {
        &self.bot_marker
    }

    pub async fn get_issue(&self, issue_number: u64) -> Result<Issue> {
        let issue = self
            .client
            .issues(&self.owner, &self.repo)
            .get(issue_number)
            .await?;

        let comments = self
            .client
            .issues(&self.owner, &self.repo)
            .list_comments(issue_number)
            .per_page(100)
            .send()
            .await?;

        Ok(Issue {
            number: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            labels: issue.labels.into_iter().map(|l| l.name).collect(),
            comments: comments
                .items
                .into_iter()
                .map(|c| Comment {
                    author: c.user.login,
                    body: c.body.unwrap_or_default(),
                })
                .collect(),
        })
    }

    /// Post a comment prefixed with the bot marker. Retried on transient
    /// failures.
    pub async fn post_comment(&self, issue_number: u64, body: &str) -> Result<()> {
        let full_body = format!("{}\n\n{}", self.bot_marker, body);
        with_retries("post_comment", self.max_retries, || async {
            self.client
                .issues(&self.owner, &self.repo)
                .create_comment(issue_number, &full_body)
                .await?;
            Ok(())
        })
        .await
    }

    pub async fn create_pull_request(&self, pr: &CreatePullRequest) -> Result<PullRequestRef> {
        let created = with_retries("create_pull_request", self.max_retries, || async {
            Ok(self
                .client
                .pulls(&self.owner, &self.repo)
                .create(&pr.title, &pr.head_branch, &pr.base_branch)
                .body(&pr.body)
                .send()
                .await?)
        })
        .await?;

        Ok(PullRequestRef {
            number: created.number,
            url: created
                .html_url
                .map(|u| u.to_string())
                .unwrap_or_default(),
            head_branch: created.head.ref_field.clone(),
            base_branch: created.base.ref_field.clone(),
        })
    }

    /// Find the open PR whose head is the given branch, if any. Used to
    /// keep PR creation idempotent across repeated build phases.
    pub async fn find_pr_for_branch(&self, branch: &str) -> Result<Option<PullRequestRef>> {
        let page = self
            .client
            .pulls(&self.owner, &self.repo)
            .list()
            .state(octocrab::params::State::Open)
            .head(format!("{}:{}", self.owner, branch))
            .per_page(1)
            .send()
            .await?;

        Ok(page.items.into_iter().next().map(|pr| PullRequestRef {
            number: pr.number,
            url: pr.html_url.map(|u| u.to_string()).unwrap_or_default(),
            head_branch: pr.head.ref_field.clone(),
            base_branch: pr.base.ref_field.clone(),
        }))
    }

    /// Merge a pull request. GitHub reports an unmergeable PR as an API
    /// error, which the caller turns into manual-merge instructions.
    pub async fn merge_pull_request(&self, pr_number: u64, method: &str) -> Result<()> {
        with_retries("merge_pull_request", self.max_retries, || async {
            let method = match method {
                "merge" => octocrab::params::pulls::MergeMethod::Merge,
                "rebase" => octocrab::params::pulls::MergeMethod::Rebase,
                _ => octocrab::params::pulls::MergeMethod::Squash,
            };
            self.client
                .pulls(&self.owner, &self.repo)
                .merge(pr_number)
                .method(method)
                .send()
                .await?;
            Ok(())
        })
        .await
    }
}

impl std::fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubClient")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("token", &"[REDACTED]")
            .field("bot_marker", &self.bot_marker)
            .finish()
    }
}
