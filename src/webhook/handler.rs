use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::dispatch::{self, Directive};
use crate::review::actions::{handle_review_outcome, ReviewActionContext};
use crate::review::{Findings, ReviewOutcome, ReviewStatus};
use crate::server::AppState;
use crate::state::new_workflow_id;
use crate::webhook::events::WebhookEvent;
use crate::webhook::signature::verify_signature;
use crate::workflow::{ops, Phase};

/// Issue labels that start a workflow when added.
const TRIGGER_LABELS: [&str; 5] = ["bug", "implement", "feature", "chore", "plan"];

pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    // Extract required headers
    let signature = match headers.get("x-hub-signature-256").and_then(|v| v.to_str().ok()) {
        Some(sig) => sig.to_string(),
        None => {
            tracing::warn!("Missing X-Hub-Signature-256 header");
            return StatusCode::UNAUTHORIZED;
        }
    };

    let event_type = match headers.get("x-github-event").and_then(|v| v.to_str().ok()) {
        Some(et) => et.to_string(),
        None => {
            tracing::warn!("Missing X-GitHub-Event header");
            return StatusCode::BAD_REQUEST;
        }
    };

    // Verify signature
    if let Err(e) = verify_signature(state.config.webhook_secret(), &body, &signature) {
        tracing::warn!(error = %e, "Webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    // Parse event
    let event = match WebhookEvent::parse(&event_type, &body) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(error = %e, event_type = %event_type, "Failed to parse webhook event");
            return StatusCode::BAD_REQUEST;
        }
    };

    tracing::info!(event_type = %event_type, "Received webhook event");

    match event {
        WebhookEvent::Issues(event) => handle_issues_event(&state, event).await,
        WebhookEvent::IssueComment(event) => handle_issue_comment_event(&state, event).await,
        WebhookEvent::PullRequest(event) => handle_pull_request_event(&state, event).await,
        WebhookEvent::PullRequestReview(event) => handle_pr_review_event(&state, event).await,
        WebhookEvent::Ping => {
            tracing::info!("Received ping event");
            StatusCode::OK
        }
        WebhookEvent::Unsupported(event_type) => {
            tracing::debug!(event_type = %event_type, "Ignoring unsupported event");
            StatusCode::OK
        }
    }
}

async fn handle_issues_event(
    state: &AppState,
    event: crate::webhook::events::IssuesEvent,
) -> StatusCode {
    // Don't process pull requests via the issues event
    if event.issue.pull_request.is_some() {
        return StatusCode::OK;
    }

    let triggered = match event.action.as_str() {
        "labeled" => event
            .label
            .as_ref()
            .is_some_and(|l| TRIGGER_LABELS.contains(&l.name.as_str())),
        "opened" => event
            .issue
            .labels
            .iter()
            .any(|l| TRIGGER_LABELS.contains(&l.name.as_str())),
        _ => false,
    };
    if !triggered {
        return StatusCode::OK;
    }

    let issue_number = event.issue.number;
    if !state.dedup.should_dispatch(issue_number, Phase::Plan) {
        tracing::debug!(issue_number, "Duplicate plan trigger suppressed");
        return StatusCode::OK;
    }

    let workflow_id = new_workflow_id();
    tracing::info!(
        issue_number,
        %workflow_id,
        action = %event.action,
        "Trigger label present, dispatching plan phase"
    );

    match dispatch::spawn_phase(
        state.config_path.as_deref(),
        &state.store,
        Phase::Plan,
        issue_number,
        &workflow_id,
        true,
    ) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::error!(issue_number, error = %e, "Failed to dispatch plan phase");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn handle_issue_comment_event(
    state: &AppState,
    event: crate::webhook::events::IssueCommentEvent,
) -> StatusCode {
    if event.action != "created" {
        return StatusCode::OK;
    }

    // Ignore comments from bots, and anything carrying our own marker,
    // to prevent feedback loops
    let user = &event.comment.user;
    let body = event.comment.body.clone().unwrap_or_default();
    if user.user_type == "Bot"
        || user.login.ends_with("[bot]")
        || body.contains(state.github.bot_marker())
    {
        tracing::debug!(user = %user.login, "Ignoring bot comment");
        return StatusCode::OK;
    }

    // Directives live on issues, not on PR conversations
    if event.issue.pull_request.is_some() {
        return StatusCode::OK;
    }

    let issue_number = event.issue.number;
    let (phase, workflow_id) = match dispatch::parse_directive(&body) {
        Directive::None => return StatusCode::OK,
        Directive::Invalid(reason) => {
            tracing::info!(issue_number, %reason, "Rejected malformed directive");
            let _ = state
                .github
                .post_comment(issue_number, &format!("**Directive Error**\n\n{reason}"))
                .await;
            return StatusCode::OK;
        }
        Directive::Command { phase, workflow_id } => (phase, workflow_id),
    };

    let workflow_id = match (phase, workflow_id) {
        (_, Some(id)) => id,
        (Phase::Plan, None) => new_workflow_id(),
        (other, None) => {
            let _ = state
                .github
                .post_comment(
                    issue_number,
                    &format!(
                        "**Directive Error**\n\nPhase `{other}` needs a workflow id: \
                         `/graft {other} <workflow_id>`"
                    ),
                )
                .await;
            return StatusCode::OK;
        }
    };

    if !state.dedup.should_dispatch(issue_number, phase) {
        tracing::debug!(issue_number, %phase, "Duplicate directive suppressed");
        return StatusCode::OK;
    }

    tracing::info!(issue_number, %phase, %workflow_id, "Dispatching directive");
    match dispatch::spawn_phase(
        state.config_path.as_deref(),
        &state.store,
        phase,
        issue_number,
        &workflow_id,
        true,
    ) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::error!(issue_number, error = %e, "Failed to dispatch directive");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn handle_pull_request_event(
    state: &AppState,
    event: crate::webhook::events::PullRequestEvent,
) -> StatusCode {
    if event.action != "opened" && event.action != "synchronize" {
        return StatusCode::OK;
    }

    let branch = &event.pull_request.head.ref_name;
    let Some((issue_number, workflow_id)) = ops::parse_workflow_branch(branch) else {
        return StatusCode::OK;
    };

    if !state.dedup.should_dispatch(issue_number, Phase::Review) {
        tracing::debug!(issue_number, "Duplicate review trigger suppressed");
        return StatusCode::OK;
    }

    tracing::info!(
        pr = event.number,
        issue_number,
        %workflow_id,
        action = %event.action,
        "Workflow branch PR activity, dispatching review phase"
    );
    match dispatch::spawn_phase(
        state.config_path.as_deref(),
        &state.store,
        Phase::Review,
        issue_number,
        &workflow_id,
        false,
    ) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::error!(issue_number, error = %e, "Failed to dispatch review phase");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// A human review requesting changes is treated like an agent review with
/// the same verdict: it goes straight into the reimplementation logic,
/// subject to the same attempt cap.
async fn handle_pr_review_event(
    state: &AppState,
    event: crate::webhook::events::PullRequestReviewEvent,
) -> StatusCode {
    if event.action != "submitted" || event.review.state != "changes_requested" {
        return StatusCode::OK;
    }

    if event.review.user.user_type == "Bot" || event.review.user.login.ends_with("[bot]") {
        return StatusCode::OK;
    }

    let branch = &event.pull_request.head.ref_name;
    let Some((issue_number, workflow_id)) = ops::parse_workflow_branch(branch) else {
        return StatusCode::OK;
    };

    if !state.dedup.should_dispatch(issue_number, Phase::Plan) {
        tracing::debug!(issue_number, "Duplicate changes-requested trigger suppressed");
        return StatusCode::OK;
    }

    let pr = match state.github.find_pr_for_branch(branch).await {
        Ok(Some(pr)) => pr,
        Ok(None) => {
            tracing::warn!(%branch, "Changes requested but no open PR for branch");
            return StatusCode::OK;
        }
        Err(e) => {
            tracing::error!(%branch, error = %e, "Failed to look up PR for branch");
            return StatusCode::INTERNAL_SERVER_ERROR;
        }
    };

    let body = event.review.body.clone().unwrap_or_default();
    let outcome = ReviewOutcome {
        status: ReviewStatus::ChangesRequested,
        summary: body.clone(),
        recommendations: Vec::new(),
        findings: Findings::default(),
        raw: body,
    };

    tracing::info!(
        pr = pr.number,
        issue_number,
        %workflow_id,
        reviewer = %event.review.user.login,
        "Human requested changes, starting reimplementation handling"
    );

    let action_ctx = ReviewActionContext {
        config: &state.config,
        config_path: state.config_path.as_deref(),
        store: &state.store,
        attempts: &state.attempts,
        github: &state.github,
    };
    match handle_review_outcome(&action_ctx, issue_number, &workflow_id, &pr, &outcome).await {
        Ok(_) => StatusCode::ACCEPTED,
        Err(e) => {
            tracing::error!(issue_number, error = %e, "Failed to handle requested changes");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
