use serde::Deserialize;

/// Top-level webhook event parsed from the payload based on the
/// X-GitHub-Event header.
#[derive(Debug)]
pub enum WebhookEvent {
    Issues(IssuesEvent),
    IssueComment(IssueCommentEvent),
    PullRequest(PullRequestEvent),
    PullRequestReview(PullRequestReviewEvent),
    Ping,
    Unsupported(String),
}

#[derive(Debug, Deserialize)]
pub struct IssuesEvent {
    pub action: String,
    pub issue: IssuePayload,
    pub label: Option<LabelPayload>,
}

#[derive(Debug, Deserialize)]
pub struct IssueCommentEvent {
    pub action: String,
    pub issue: IssuePayload,
    pub comment: CommentPayload,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestEvent {
    pub action: String,
    pub number: u64,
    pub pull_request: PullRequestPayload,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestReviewEvent {
    pub action: String,
    pub review: ReviewPayload,
    pub pull_request: PullRequestPayload,
}

#[derive(Debug, Deserialize)]
pub struct IssuePayload {
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub labels: Vec<LabelPayload>,
    pub user: UserPayload,
    /// Present when the "issue" is actually a pull request.
    pub pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct LabelPayload {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct CommentPayload {
    pub id: u64,
    pub body: Option<String>,
    pub user: UserPayload,
}

#[derive(Debug, Deserialize)]
pub struct ReviewPayload {
    pub id: u64,
    pub body: Option<String>,
    pub state: String, // "approved", "changes_requested", "commented"
    pub user: UserPayload,
}

#[derive(Debug, Deserialize)]
pub struct PullRequestPayload {
    pub number: u64,
    pub title: String,
    pub head: BranchRef,
    pub base: BranchRef,
}

#[derive(Debug, Deserialize)]
pub struct BranchRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub struct UserPayload {
    pub login: String,
    #[serde(rename = "type", default)]
    pub user_type: String,
}

impl WebhookEvent {
    pub fn parse(event_type: &str, payload: &[u8]) -> Result<Self, serde_json::Error> {
        match event_type {
            "issues" => {
                let event: IssuesEvent = serde_json::from_slice(payload)?;
                Ok(WebhookEvent::Issues(event))
            }
            "issue_comment" => {
                let event: IssueCommentEvent = serde_json::from_slice(payload)?;
                Ok(WebhookEvent::IssueComment(event))
            }
            "pull_request" => {
                let event: PullRequestEvent = serde_json::from_slice(payload)?;
                Ok(WebhookEvent::PullRequest(event))
            }
            "pull_request_review" => {
                let event: PullRequestReviewEvent = serde_json::from_slice(payload)?;
                Ok(WebhookEvent::PullRequestReview(event))
            }
            "ping" => Ok(WebhookEvent::Ping),
            other => Ok(WebhookEvent::Unsupported(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_issues_event() {
        let payload = serde_json::json!({
            "action": "labeled",
            "issue": {
                "number": 42,
                "title": "Fix login",
                "body": "details",
                "labels": [{"name": "bug"}],
                "user": {"login": "alice", "type": "User"}
            },
            "label": {"name": "bug"}
        });
        let event = WebhookEvent::parse("issues", payload.to_string().as_bytes()).unwrap();
        let WebhookEvent::Issues(event) = event else {
            panic!("wrong variant");
        };
        assert_eq!(event.action, "labeled");
        assert_eq!(event.issue.number, 42);
        assert_eq!(event.label.unwrap().name, "bug");
    }

    #[test]
    fn test_parse_pull_request_event() {
        let payload = serde_json::json!({
            "action": "opened",
            "number": 9,
            "pull_request": {
                "number": 9,
                "title": "bug: fix login",
                "head": {"ref": "graft/bug-42-abc12345", "sha": "deadbeef"},
                "base": {"ref": "main", "sha": "cafebabe"}
            }
        });
        let event = WebhookEvent::parse("pull_request", payload.to_string().as_bytes()).unwrap();
        let WebhookEvent::PullRequest(event) = event else {
            panic!("wrong variant");
        };
        assert_eq!(event.pull_request.head.ref_name, "graft/bug-42-abc12345");
    }

    #[test]
    fn test_unknown_event_type_is_unsupported() {
        let event = WebhookEvent::parse("workflow_run", b"{}").unwrap();
        assert!(matches!(event, WebhookEvent::Unsupported(t) if t == "workflow_run"));
    }
}
