use crate::config::AppConfig;
use crate::dispatch;
use crate::error::Result;
use crate::scm::github::{GitHubClient, Issue, PullRequestRef};
use crate::state::{new_workflow_id, AttemptStore, StateStore};
use crate::workflow::Phase;

use super::{ReviewOutcome, ReviewStatus};

/// Handles needed by the review outcome logic. Both the review phase and
/// the webhook's changes-requested path construct one of these.
pub struct ReviewActionContext<'a> {
    pub config: &'a AppConfig,
    pub config_path: Option<&'a str>,
    pub store: &'a StateStore,
    pub attempts: &'a AttemptStore,
    pub github: &'a GitHubClient,
}

/// What `handle_review_outcome` did, so the caller can chain (or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAction {
    Merged,
    MergeFailed,
    ReimplementationStarted { workflow_id: String },
    MaxAttemptsReached,
    CommentedOnly,
}

/// Act on a parsed review: merge on approval, start a reimplementation
/// cycle on requested changes (bounded by the attempt cap), or surface the
/// report for humans. Posts exactly one issue comment per branch taken.
pub async fn handle_review_outcome(
    ctx: &ReviewActionContext<'_>,
    issue_number: u64,
    review_workflow_id: &str,
    pr: &PullRequestRef,
    outcome: &ReviewOutcome,
) -> Result<ReviewAction> {
    match outcome.status {
        ReviewStatus::Approved => handle_approved(ctx, issue_number, pr).await,
        ReviewStatus::ChangesRequested => {
            handle_changes_requested(ctx, issue_number, review_workflow_id, pr, outcome).await
        }
        ReviewStatus::NeedsDiscussion | ReviewStatus::Unparseable => {
            ctx.github
                .post_comment(
                    issue_number,
                    &format!(
                        "**Review Needs Discussion**\n\n\
                         **PR:** [#{}]({})\n\
                         **Workflow:** `{review_workflow_id}`\n\n\
                         The review did not reach a clear verdict. \
                         Reviewer output follows:\n\n---\n\n{}",
                        pr.number, pr.url, outcome.raw
                    ),
                )
                .await?;
            Ok(ReviewAction::CommentedOnly)
        }
    }
}

async fn handle_approved(
    ctx: &ReviewActionContext<'_>,
    issue_number: u64,
    pr: &PullRequestRef,
) -> Result<ReviewAction> {
    let review = &ctx.config.review;

    if !review.auto_merge {
        ctx.github
            .post_comment(
                issue_number,
                &format!(
                    "**Review Approved**\n\n\
                     **PR:** [#{}]({})\n\n\
                     Automatic merging is disabled. Merge the pull request \
                     manually when ready.",
                    pr.number, pr.url
                ),
            )
            .await?;
        return Ok(ReviewAction::CommentedOnly);
    }

    tracing::info!(pr = pr.number, "Review approved, merging");
    let merged = ctx
        .github
        .merge_pull_request(pr.number, &review.merge_method)
        .await;

    match merged {
        Ok(()) => {
            // A merged cycle closes the loop-protection window for this issue.
            ctx.attempts.reset(issue_number)?;
            ctx.github
                .post_comment(
                    issue_number,
                    &format!(
                        "**PR Merged**\n\n\
                         **PR:** [#{}]({})\n\n\
                         The pull request passed review and was merged ({}).",
                        pr.number, pr.url, review.merge_method
                    ),
                )
                .await?;
            Ok(ReviewAction::Merged)
        }
        Err(e) => {
            tracing::error!(pr = pr.number, error = %e, "Automatic merge failed");
            ctx.github
                .post_comment(
                    issue_number,
                    &format!(
                        "**Automatic Merge Failed**\n\n\
                         **PR:** [#{}]({})\n\n\
                         The pull request was approved but could not be merged:\n\
                         ```\n{e}\n```\n\
                         Check for conflicts or failing required checks, then \
                         merge manually.",
                        pr.number, pr.url
                    ),
                )
                .await?;
            Ok(ReviewAction::MergeFailed)
        }
    }
}

async fn handle_changes_requested(
    ctx: &ReviewActionContext<'_>,
    issue_number: u64,
    review_workflow_id: &str,
    pr: &PullRequestRef,
    outcome: &ReviewOutcome,
) -> Result<ReviewAction> {
    let review = &ctx.config.review;

    if !review.auto_reimplement {
        ctx.github
            .post_comment(
                issue_number,
                &format!(
                    "**Changes Requested**\n\n\
                     **PR:** [#{}]({})\n\n\
                     Automatic reimplementation is disabled. \
                     Reviewer output follows:\n\n---\n\n{}",
                    pr.number, pr.url, outcome.raw
                ),
            )
            .await?;
        return Ok(ReviewAction::CommentedOnly);
    }

    let max = review.max_reimplement_attempts;
    if !ctx.attempts.is_allowed(issue_number, max) {
        let count = ctx.attempts.count(issue_number);
        tracing::warn!(
            issue_number,
            attempts = count,
            max,
            "Reimplementation attempt cap reached"
        );
        ctx.github
            .post_comment(
                issue_number,
                &format!(
                    "**Maximum Reimplementation Attempts Reached**\n\n\
                     **Attempts:** {count}/{max}\n\n\
                     Automatic reimplementation has hit its cap for this \
                     issue, so manual intervention is required. Review the \
                     previous attempts and either fix the branch by hand or \
                     clarify the requirements. Merging a PR for this issue \
                     resets the counter."
                ),
            )
            .await?;
        return Ok(ReviewAction::MaxAttemptsReached);
    }

    let issue = ctx.github.get_issue(issue_number).await?;
    let feedback = format_feedback(outcome, &issue);
    let (new_id, attempt) =
        start_reimplementation(ctx.store, ctx.attempts, ctx.config_path, issue_number, &feedback)?;

    ctx.github
        .post_comment(
            issue_number,
            &format!(
                "**Reimplementation Started** (attempt {attempt}/{max})\n\n\
                 **Reviewed PR:** [#{}]({})\n\
                 **Previous workflow:** `{review_workflow_id}`\n\
                 **New workflow:** `{new_id}`\n\n\
                 The review requested changes; a fresh implementation cycle \
                 is addressing the feedback below.\n\n{}",
                pr.number,
                pr.url,
                truncate(&feedback, 2000)
            ),
        )
        .await?;

    Ok(ReviewAction::ReimplementationStarted { workflow_id: new_id })
}

/// Mint a new cycle: write the feedback into the fresh workflow's
/// directory, spawn its plan phase, and only then consume an attempt. A
/// failure on the way in leaves the loop-protection counter untouched.
fn start_reimplementation(
    store: &StateStore,
    attempts: &AttemptStore,
    config_path: Option<&str>,
    issue_number: u64,
    feedback: &str,
) -> Result<(String, u32)> {
    let new_id = new_workflow_id();
    store.write_feedback(&new_id, feedback)?;
    dispatch::spawn_phase(config_path, store, Phase::Plan, issue_number, &new_id, true)?;
    let attempt = attempts.increment(issue_number)?;
    Ok((new_id, attempt))
}

/// Assemble the feedback document handed to the next plan phase: the
/// review's findings plus the original task, so the new cycle does not
/// depend on any earlier workflow's files.
pub fn format_feedback(outcome: &ReviewOutcome, issue: &Issue) -> String {
    let mut out = String::new();

    if !outcome.summary.is_empty() {
        out.push_str("## Summary\n");
        out.push_str(&outcome.summary);
        out.push_str("\n\n");
    }

    if !outcome.findings.is_empty() {
        out.push_str("## Issues Found\n");
        for (severity, items) in [
            ("Critical", &outcome.findings.critical),
            ("Moderate", &outcome.findings.moderate),
            ("Minor", &outcome.findings.minor),
        ] {
            if items.is_empty() {
                continue;
            }
            out.push_str(&format!("### {severity}\n"));
            for item in items {
                out.push_str(&format!("- {item}\n"));
            }
        }
        out.push('\n');
    }

    if !outcome.recommendations.is_empty() {
        out.push_str("## Recommendations\n");
        for (i, rec) in outcome.recommendations.iter().enumerate() {
            out.push_str(&format!("{}. {rec}\n", i + 1));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "## Original Task\n### {} (#{})\n{}\n",
        issue.title, issue.number, issue.body
    ));

    out
}

fn truncate(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::review::Findings;

    fn outcome() -> ReviewOutcome {
        ReviewOutcome {
            status: ReviewStatus::ChangesRequested,
            summary: "Validation gaps remain.".to_string(),
            recommendations: vec!["Validate limits".to_string()],
            findings: Findings {
                critical: vec!["Missing input validation".to_string()],
                moderate: vec![],
                minor: vec!["Typo in comment".to_string()],
            },
            raw: String::new(),
        }
    }

    fn issue() -> Issue {
        Issue {
            number: 42,
            title: "Add rate limiting".to_string(),
            body: "Requests should be limited per client.".to_string(),
            labels: vec!["bug".to_string()],
            comments: vec![],
        }
    }

    #[test]
    fn test_feedback_contains_findings_and_original_task() {
        let feedback = format_feedback(&outcome(), &issue());
        assert!(feedback.contains("## Summary\nValidation gaps remain."));
        assert!(feedback.contains("### Critical\n- Missing input validation"));
        assert!(feedback.contains("### Minor\n- Typo in comment"));
        assert!(!feedback.contains("### Moderate"));
        assert!(feedback.contains("1. Validate limits"));
        assert!(feedback.contains("## Original Task"));
        assert!(feedback.contains("Add rate limiting (#42)"));
    }

    #[test]
    fn test_feedback_without_sections_still_has_task() {
        let bare = ReviewOutcome {
            status: ReviewStatus::ChangesRequested,
            summary: String::new(),
            recommendations: vec![],
            findings: Findings::default(),
            raw: String::new(),
        };
        let feedback = format_feedback(&bare, &issue());
        assert!(feedback.starts_with("## Original Task"));
    }

    #[test]
    fn test_failed_cycle_start_consumes_no_attempt() {
        // data_dir points at a regular file, so writing the new
        // workflow's feedback fails before anything is spawned.
        let tmp = tempfile::tempdir().unwrap();
        let blocked = tmp.path().join("blocked");
        std::fs::write(&blocked, b"").unwrap();

        let store = StateStore::new(&blocked);
        let attempts = AttemptStore::new(tmp.path().join("attempts.json"));

        let result = start_reimplementation(&store, &attempts, None, 42, "## Summary\nfix it");
        assert!(result.is_err());
        assert_eq!(attempts.count(42), 0);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "héllo".repeat(100);
        let cut = truncate(&s, 7);
        assert!(cut.len() <= 7);
        assert!(s.starts_with(cut));
    }
}
