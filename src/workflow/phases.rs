use std::path::PathBuf;
use std::time::Duration;

use crate::agent::AgentTask;
use crate::dispatch;
use crate::error::{AppError, Result};
use crate::review::actions::{handle_review_outcome, ReviewAction, ReviewActionContext};
use crate::review::parse_review;
use crate::scm::{self, with_retries};
use crate::state::{ModelTier, PhaseLock, StateStore, WorkflowState};

use super::{ops, Phase, WorkflowContext};

/// A phase's hold on a workflow: the advisory lock plus loaded state. The
/// lock lives as long as the session, so two phases of one workflow can
/// never interleave.
struct PhaseSession {
    _lock: PhaseLock,
    state: WorkflowState,
}

fn open_session(ctx: &WorkflowContext, workflow_id: &str, issue_number: u64) -> Result<PhaseSession> {
    let lock = ctx.store.lock_phase(workflow_id)?;
    let mut state = ctx.store.load(workflow_id);

    match state.issue_number {
        None => state.issue_number = Some(issue_number),
        Some(existing) if existing != issue_number => {
            return Err(AppError::Validation(format!(
                "Workflow {workflow_id} belongs to issue #{existing}, not #{issue_number}"
            )));
        }
        Some(_) => {}
    }

    Ok(PhaseSession { _lock: lock, state })
}

/// Resolve and validate the workspace for a phase that needs one. A
/// disagreement between state, disk, and git aborts the phase; the
/// failure wrapper surfaces the diagnostic on the issue.
async fn workspace(ctx: &WorkflowContext, state: &WorkflowState) -> Result<PathBuf> {
    ctx.worktrees.validate(state).await?;
    Ok(state.worktree_path.clone().unwrap_or_default())
}

/// Append a failed entry to the phase audit trail and persist it. Kept
/// separate from commenting so a state-save problem never hides the
/// original failure.
fn record_failed_phase(
    store: &StateStore,
    state: &mut WorkflowState,
    phase: Phase,
    error: &AppError,
) {
    state.record_phase(phase, false, Some(error.to_string()), None);
    if let Err(save_err) = store.save(state) {
        tracing::error!(
            workflow_id = %state.workflow_id,
            error = %save_err,
            "Failed to persist state after phase failure"
        );
    }
}

async fn report_failure(
    ctx: &WorkflowContext,
    issue_number: u64,
    workflow_id: &str,
    phase: Phase,
    detail: &str,
) {
    let body = format!(
        "**Phase Failed: {phase}**\n\n\
         **Workflow:** `{workflow_id}`\n\n```\n{detail}\n```"
    );
    if let Err(e) = ctx.github.post_comment(issue_number, &body).await {
        tracing::error!(issue_number, error = %e, "Failed to post failure comment");
    }
}

/// Close out a phase body. Any error is recorded in state and posted to
/// the triggering issue before it propagates; a workflow a human is
/// waiting on never fails without a trace.
async fn finish(
    ctx: &WorkflowContext,
    state: &mut WorkflowState,
    phase: Phase,
    issue_number: u64,
    workflow_id: &str,
    result: Result<()>,
) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            record_failed_phase(&ctx.store, state, phase, &e);
            report_failure(ctx, issue_number, workflow_id, phase, &e.to_string()).await;
            Err(e)
        }
    }
}

/// Commit everything in the worktree and push the branch. Returns whether
/// a commit was created.
async fn commit_and_push(
    ctx: &WorkflowContext,
    dir: &PathBuf,
    branch: &str,
    message: &str,
) -> Result<bool> {
    let committed = scm::git::commit_all(dir, message).await?;
    if committed {
        let timeout = Duration::from_secs(ctx.config.github.network_timeout_secs);
        with_retries("push", ctx.config.github.max_retries, || {
            scm::git::push(dir, branch, ctx.github.git_token(), timeout)
        })
        .await?;
    }
    Ok(committed)
}

fn chain_next(
    ctx: &WorkflowContext,
    phase: Phase,
    issue_number: u64,
    workflow_id: &str,
    chain: bool,
) -> Result<()> {
    if !chain {
        return Ok(());
    }
    let Some(next) = phase.next_in_chain() else {
        return Ok(());
    };
    dispatch::spawn_phase(
        ctx.config_path.as_deref(),
        &ctx.store,
        next,
        issue_number,
        workflow_id,
        true,
    )
}

/// Plan: classify the issue, create branch + worktree + ports, and have
/// the agent write an implementation plan.
pub async fn run_plan(
    ctx: &WorkflowContext,
    workflow_id: &str,
    issue_number: u64,
    chain: bool,
) -> Result<()> {
    let mut session = open_session(ctx, workflow_id, issue_number)?;
    let result = plan_phase(ctx, &mut session.state, workflow_id, issue_number, chain).await;
    finish(ctx, &mut session.state, Phase::Plan, issue_number, workflow_id, result).await
}

async fn plan_phase(
    ctx: &WorkflowContext,
    state: &mut WorkflowState,
    workflow_id: &str,
    issue_number: u64,
    chain: bool,
) -> Result<()> {
    let issue = ctx.github.get_issue(issue_number).await?;
    let feedback = ctx.store.read_feedback(workflow_id);
    if feedback.is_some() {
        // Reimplementation cycles get the stronger model.
        state.model_tier = ModelTier::Heavy;
    }

    let class = match state.issue_class {
        Some(class) => class,
        None => {
            let class = ops::classify_issue(
                ctx.invoker.as_ref(),
                &issue,
                &ctx.config.worktree.repo_root,
            )
            .await?;
            state.issue_class = Some(class);
            class
        }
    };

    let branch = state
        .branch_name
        .clone()
        .unwrap_or_else(|| ops::branch_name(class, issue_number, workflow_id));
    state.branch_name = Some(branch.clone());

    let worktree_path = match &state.worktree_path {
        Some(path) if path.exists() => path.clone(),
        _ => {
            let worktree = ctx
                .worktrees
                .create(
                    workflow_id,
                    &branch,
                    &ctx.config.github.base_branch,
                    ctx.github.git_token(),
                )
                .await?;
            state.worktree_path = Some(worktree.path.clone());
            state.backend_port = Some(worktree.backend_port);
            state.frontend_port = Some(worktree.frontend_port);
            worktree.path
        }
    };

    let plan_file = ops::plan_file_name(workflow_id);
    let task = AgentTask::new(
        "planner",
        ops::planner_prompt(&issue, &plan_file, feedback.as_deref()),
        state.model_tier,
    );
    let response = ctx.invoker.invoke(&task, &worktree_path).await?;

    if !response.success {
        return Err(AppError::Agent(
            "The planner agent exited with an error.".to_string(),
        ));
    }

    let Some(plan_file) = ops::find_plan_file(&worktree_path, workflow_id, &response.output) else {
        return Err(AppError::Agent(
            "The planner finished but no plan file was found in specs/.".to_string(),
        ));
    };

    commit_and_push(
        ctx,
        &worktree_path,
        &branch,
        &format!("plan: {} (#{issue_number})", issue.title),
    )
    .await?;

    state.plan_file = Some(plan_file.clone());
    state.record_phase(
        Phase::Plan,
        true,
        Some(plan_file.clone()),
        response.session_id.clone(),
    );
    ctx.store.save(state)?;

    ctx.github
        .post_comment(
            issue_number,
            &format!(
                "**Plan Ready**\n\n\
                 **Workflow:** `{workflow_id}`\n\
                 **Class:** {class}\n\
                 **Branch:** `{branch}`\n\
                 **Plan:** `{plan_file}`\n\n\
                 The implementation plan is committed to the branch."
            ),
        )
        .await?;

    chain_next(ctx, Phase::Plan, issue_number, workflow_id, chain)
}

/// Build: implement the committed plan, push, and open (or reuse) the PR.
pub async fn run_build(
    ctx: &WorkflowContext,
    workflow_id: &str,
    issue_number: u64,
    chain: bool,
) -> Result<()> {
    let mut session = open_session(ctx, workflow_id, issue_number)?;
    let result = build_phase(ctx, &mut session.state, workflow_id, issue_number, chain).await;
    finish(ctx, &mut session.state, Phase::Build, issue_number, workflow_id, result).await
}

async fn build_phase(
    ctx: &WorkflowContext,
    state: &mut WorkflowState,
    workflow_id: &str,
    issue_number: u64,
    chain: bool,
) -> Result<()> {
    let worktree_path = workspace(ctx, state).await?;

    let plan_file = state.plan_file.clone().ok_or_else(|| {
        AppError::Validation(format!(
            "Workflow {workflow_id} has no plan file; run the plan phase first"
        ))
    })?;
    let branch = state.branch_name.clone().ok_or_else(|| {
        AppError::Validation(format!("Workflow {workflow_id} has no branch name"))
    })?;

    let task = AgentTask::new(
        "implementor",
        ops::implementor_prompt(&plan_file),
        state.model_tier,
    );
    let response = ctx.invoker.invoke(&task, &worktree_path).await?;

    if !response.success {
        return Err(AppError::Agent(
            "The implementor agent exited with an error.".to_string(),
        ));
    }

    let issue = ctx.github.get_issue(issue_number).await?;
    commit_and_push(
        ctx,
        &worktree_path,
        &branch,
        &format!("{}: {} (#{issue_number})", state.issue_class.map(|c| c.to_string()).unwrap_or_else(|| "change".to_string()), issue.title),
    )
    .await?;

    // One PR per branch: reuse an open one from an earlier build run.
    let pr = match ctx.github.find_pr_for_branch(&branch).await? {
        Some(existing) => existing,
        None => {
            ctx.github
                .create_pull_request(&crate::scm::github::CreatePullRequest {
                    title: issue.title.clone(),
                    body: format!(
                        "Implements the plan in `{plan_file}`.\n\n\
                         Closes #{issue_number}\n\n\
                         Workflow: `{workflow_id}`"
                    ),
                    head_branch: branch.clone(),
                    base_branch: ctx.config.github.base_branch.clone(),
                })
                .await?
        }
    };

    state.record_phase(
        Phase::Build,
        true,
        Some(format!("PR #{}", pr.number)),
        response.session_id.clone(),
    );
    ctx.store.save(state)?;

    ctx.github
        .post_comment(
            issue_number,
            &format!(
                "**Build Complete**\n\n\
                 **Workflow:** `{workflow_id}`\n\
                 **PR:** [#{}]({})\n\n\
                 The implementation is pushed and ready for testing.",
                pr.number, pr.url
            ),
        )
        .await?;

    chain_next(ctx, Phase::Build, issue_number, workflow_id, chain)
}

/// Test: run the suite via the agent. A failing suite is recorded and
/// reported but does not stop the chain; the review phase sees the branch
/// as it is.
pub async fn run_test(
    ctx: &WorkflowContext,
    workflow_id: &str,
    issue_number: u64,
    chain: bool,
) -> Result<()> {
    let mut session = open_session(ctx, workflow_id, issue_number)?;
    let result = test_phase(ctx, &mut session.state, workflow_id, issue_number, chain).await;
    finish(ctx, &mut session.state, Phase::Test, issue_number, workflow_id, result).await
}

async fn test_phase(
    ctx: &WorkflowContext,
    state: &mut WorkflowState,
    workflow_id: &str,
    issue_number: u64,
    chain: bool,
) -> Result<()> {
    let worktree_path = workspace(ctx, state).await?;

    let branch = state.branch_name.clone().ok_or_else(|| {
        AppError::Validation(format!("Workflow {workflow_id} has no branch name"))
    })?;

    let task = AgentTask::new(
        "tester",
        ops::tester_prompt(state.backend_port, state.frontend_port),
        state.model_tier,
    );
    let response = ctx.invoker.invoke(&task, &worktree_path).await?;

    let passed = response.success
        && response
            .output
            .trim_end()
            .lines()
            .last()
            .map(|line| line.starts_with("PASSED"))
            .unwrap_or(false);

    // The tester may have fixed failures; keep those on the branch either way.
    commit_and_push(
        ctx,
        &worktree_path,
        &branch,
        &format!("test: fixes for #{issue_number}"),
    )
    .await?;

    state.record_phase(
        Phase::Test,
        passed,
        Some(if passed { "tests passed" } else { "tests failed" }.to_string()),
        response.session_id.clone(),
    );
    ctx.store.save(state)?;

    let body = if passed {
        format!(
            "**Tests Passed**\n\n**Workflow:** `{workflow_id}`\n\n\
             The suite passed on the workflow branch."
        )
    } else {
        format!(
            "**Tests Failed**\n\n**Workflow:** `{workflow_id}`\n\n\
             The suite did not pass. The review phase will still run; the \
             reviewer sees the failing state.\n\n\
             Tester output tail:\n```\n{}\n```",
            tail(&response.output, 1500)
        )
    };
    ctx.github.post_comment(issue_number, &body).await?;

    chain_next(ctx, Phase::Test, issue_number, workflow_id, chain)
}

/// Review: have the agent review the branch, parse the verdict, and let
/// the outcome logic merge, reimplement, or hand off to humans. A merged
/// PR is followed by the document phase.
pub async fn run_review(ctx: &WorkflowContext, workflow_id: &str, issue_number: u64) -> Result<()> {
    let mut session = open_session(ctx, workflow_id, issue_number)?;
    let result = review_phase(ctx, &mut session.state, workflow_id, issue_number).await;
    finish(ctx, &mut session.state, Phase::Review, issue_number, workflow_id, result).await
}

async fn review_phase(
    ctx: &WorkflowContext,
    state: &mut WorkflowState,
    workflow_id: &str,
    issue_number: u64,
) -> Result<()> {
    let worktree_path = workspace(ctx, state).await?;

    let branch = state.branch_name.clone().ok_or_else(|| {
        AppError::Validation(format!("Workflow {workflow_id} has no branch name"))
    })?;
    let Some(pr) = ctx.github.find_pr_for_branch(&branch).await? else {
        return Err(AppError::Validation(format!(
            "No open pull request for branch {branch}; run the build phase first"
        )));
    };

    let task = AgentTask::new(
        "reviewer",
        ops::reviewer_prompt(state.plan_file.as_deref()),
        state.model_tier,
    );
    let response = ctx.invoker.invoke(&task, &worktree_path).await?;

    if !response.success {
        return Err(AppError::Agent(
            "The reviewer agent exited with an error.".to_string(),
        ));
    }

    let outcome = parse_review(&response.output);
    tracing::info!(status = %outcome.status, pr = pr.number, "Review parsed");

    let action_ctx = ReviewActionContext {
        config: &ctx.config,
        config_path: ctx.config_path.as_deref(),
        store: &ctx.store,
        attempts: &ctx.attempts,
        github: &ctx.github,
    };
    let action = handle_review_outcome(&action_ctx, issue_number, workflow_id, &pr, &outcome).await?;

    state.record_phase(
        Phase::Review,
        outcome.status == crate::review::ReviewStatus::Approved,
        Some(outcome.status.to_string()),
        response.session_id.clone(),
    );
    ctx.store.save(state)?;

    if action == ReviewAction::Merged {
        dispatch::spawn_phase(
            ctx.config_path.as_deref(),
            &ctx.store,
            Phase::Document,
            issue_number,
            workflow_id,
            false,
        )?;
    }
    Ok(())
}

/// Document: update docs for the merged change and push them to the
/// workflow branch.
pub async fn run_document(ctx: &WorkflowContext, workflow_id: &str, issue_number: u64) -> Result<()> {
    let mut session = open_session(ctx, workflow_id, issue_number)?;
    let result = document_phase(ctx, &mut session.state, workflow_id, issue_number).await;
    finish(ctx, &mut session.state, Phase::Document, issue_number, workflow_id, result).await
}

async fn document_phase(
    ctx: &WorkflowContext,
    state: &mut WorkflowState,
    workflow_id: &str,
    issue_number: u64,
) -> Result<()> {
    let worktree_path = workspace(ctx, state).await?;

    let branch = state.branch_name.clone().ok_or_else(|| {
        AppError::Validation(format!("Workflow {workflow_id} has no branch name"))
    })?;

    let task = AgentTask::new(
        "documenter",
        ops::documenter_prompt(state.plan_file.as_deref()),
        state.model_tier,
    );
    let response = ctx.invoker.invoke(&task, &worktree_path).await?;

    if !response.success {
        return Err(AppError::Agent(
            "The documenter agent exited with an error.".to_string(),
        ));
    }

    let committed = commit_and_push(
        ctx,
        &worktree_path,
        &branch,
        &format!("docs: update for #{issue_number}"),
    )
    .await?;

    state.record_phase(Phase::Document, true, None, response.session_id.clone());
    ctx.store.save(state)?;

    let body = if committed {
        format!(
            "**Documentation Updated**\n\n**Workflow:** `{workflow_id}`\n\n\
             Documentation changes are pushed to `{branch}`."
        )
    } else {
        format!(
            "**Documentation Checked**\n\n**Workflow:** `{workflow_id}`\n\n\
             No documentation changes were needed."
        )
    };
    ctx.github.post_comment(issue_number, &body).await?;
    Ok(())
}

fn tail(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_keeps_end_of_output() {
        let s = "a".repeat(10) + "END";
        assert_eq!(tail(&s, 3), "END");
        assert_eq!(tail("short", 100), "short");
    }

    #[test]
    fn test_failed_phase_is_recorded_and_persisted() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        let mut state = store.load("abc12345");
        state.issue_number = Some(7);

        let err = AppError::Agent("The planner agent exited with an error.".to_string());
        record_failed_phase(&store, &mut state, Phase::Plan, &err);

        let loaded = store.load("abc12345");
        assert_eq!(loaded.phases.len(), 1);
        assert!(!loaded.phases[0].success);
        assert!(loaded.phases[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("planner agent exited"));
    }

    #[test]
    fn test_fatal_errors_carry_their_detail() {
        // The text surfaced on the issue is the error's own message, so
        // no failure path can end up with an empty diagnostic.
        let tmp = tempfile::tempdir().unwrap();
        let store = StateStore::new(tmp.path());
        let mut state = store.load("def67890");
        state.issue_number = Some(9);

        let err = AppError::Validation(
            "Workflow def67890 has no plan file; run the plan phase first".to_string(),
        );
        record_failed_phase(&store, &mut state, Phase::Build, &err);

        let loaded = store.load("def67890");
        assert_eq!(
            loaded.phases[0].detail.as_deref(),
            Some(err.to_string().as_str())
        );
        assert!(loaded.phases[0].agent_session_id.is_none());
    }
}
