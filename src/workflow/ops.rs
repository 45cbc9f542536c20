use std::path::Path;

use regex::Regex;

use crate::agent::{AgentInvoker, AgentTask};
use crate::error::{AppError, Result};
use crate::scm::github::Issue;
use crate::state::{IssueClass, ModelTier};

/// Labels that map straight to an issue class, skipping the classifier.
fn class_from_labels(labels: &[String]) -> Option<IssueClass> {
    for label in labels {
        match label.as_str() {
            "bug" => return Some(IssueClass::Bug),
            "feature" | "implement" => return Some(IssueClass::Feature),
            "chore" | "plan" => return Some(IssueClass::Chore),
            _ => {}
        }
    }
    None
}

/// Determine the issue class: trust an explicit label, otherwise ask the
/// agent. An unclassifiable issue fails the plan phase rather than
/// guessing a class into the branch name.
pub async fn classify_issue(
    invoker: &dyn AgentInvoker,
    issue: &Issue,
    repo_root: &Path,
) -> Result<IssueClass> {
    if let Some(class) = class_from_labels(&issue.labels) {
        return Ok(class);
    }

    let prompt = format!(
        "Classify the following GitHub issue as exactly one of: chore, bug, feature.\n\
         Respond with only that single word.\n\n\
         # Issue #{}: {}\n\n{}",
        issue.number, issue.title, issue.body
    );
    let task = AgentTask::new("classifier", prompt, ModelTier::Base);
    let response = invoker.invoke(&task, repo_root).await?;

    let output = response.output.to_lowercase();
    if output.contains("bug") {
        Ok(IssueClass::Bug)
    } else if output.contains("feature") {
        Ok(IssueClass::Feature)
    } else if output.contains("chore") {
        Ok(IssueClass::Chore)
    } else {
        Err(AppError::Agent(format!(
            "Classifier returned no recognizable class for issue #{}: {:?}",
            issue.number,
            response.output.trim()
        )))
    }
}

pub fn branch_name(class: IssueClass, issue_number: u64, workflow_id: &str) -> String {
    format!("graft/{class}-{issue_number}-{workflow_id}")
}

/// Recover (issue_number, workflow_id) from a workflow branch name.
/// Returns None for branches this system did not create.
pub fn parse_workflow_branch(branch: &str) -> Option<(u64, String)> {
    let rest = branch.strip_prefix("graft/")?;
    let mut parts = rest.rsplitn(3, '-');
    let workflow_id = parts.next()?;
    let issue_number: u64 = parts.next()?.parse().ok()?;
    parts.next()?;
    if workflow_id.is_empty() {
        return None;
    }
    Some((issue_number, workflow_id.to_string()))
}

/// Relative path of the plan file the planner is told to write.
pub fn plan_file_name(workflow_id: &str) -> String {
    format!("specs/graft-{workflow_id}-plan.md")
}

/// Locate the plan file after the planner ran: the conventional path
/// first, then any specs/*.md path the agent mentioned in its output.
pub fn find_plan_file(worktree: &Path, workflow_id: &str, agent_output: &str) -> Option<String> {
    let conventional = plan_file_name(workflow_id);
    if worktree.join(&conventional).exists() {
        return Some(conventional);
    }

    let re = Regex::new(r"specs/[A-Za-z0-9._-]+\.md").ok()?;
    for m in re.find_iter(agent_output) {
        if worktree.join(m.as_str()).exists() {
            return Some(m.as_str().to_string());
        }
    }
    None
}

fn render_issue(issue: &Issue) -> String {
    let mut out = format!("# Issue #{}: {}\n\n{}\n", issue.number, issue.title, issue.body);
    if !issue.comments.is_empty() {
        out.push_str("\n## Discussion\n");
        for comment in &issue.comments {
            out.push_str(&format!("\n**{}**:\n{}\n", comment.author, comment.body));
        }
    }
    out
}

pub fn planner_prompt(issue: &Issue, plan_file: &str, feedback: Option<&str>) -> String {
    let mut prompt = format!(
        "You are planning work in this repository. Study the codebase, then \
         write an implementation plan to `{plan_file}` (create the specs/ \
         directory if needed). The plan must list the concrete changes, the \
         files involved, and how to verify the result. Do not implement \
         anything else in this step.\n\n{}",
        render_issue(issue)
    );
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\n## Review Feedback\nA previous implementation of this task was \
             rejected in review. The plan must address every point below:\n\n{feedback}\n"
        ));
    }
    prompt
}

pub fn implementor_prompt(plan_file: &str) -> String {
    format!(
        "Implement the plan in `{plan_file}`. Follow it step by step, keeping \
         changes scoped to what the plan calls for. Update the plan file's \
         task list as you complete items."
    )
}

pub fn tester_prompt(backend_port: Option<u16>, frontend_port: Option<u16>) -> String {
    let mut prompt = String::from(
        "Run the test suite for this repository and fix any failures caused \
         by the changes on this branch. Report the final result, starting \
         your last line with either PASSED or FAILED.",
    );
    if let (Some(backend), Some(frontend)) = (backend_port, frontend_port) {
        prompt.push_str(&format!(
            "\n\nIf tests need running servers, use port {backend} for the \
             backend and {frontend} for the frontend. These ports are \
             reserved for this workspace."
        ));
    }
    prompt
}

pub fn reviewer_prompt(plan_file: Option<&str>) -> String {
    let plan_line = match plan_file {
        Some(p) => format!("The implementation plan is in `{p}`. "),
        None => String::new(),
    };
    format!(
        "Review the changes on this branch against the base branch. \
         {plan_line}Judge correctness, completeness against the plan, and \
         code quality.\n\n\
         Structure your report exactly as:\n\n\
         ## Summary\n<one paragraph>\n\n\
         ## Issues Found\n### Critical\n<bulleted list or None>\n\
         ### Moderate\n<bulleted list or None>\n\
         ### Minor\n<bulleted list or None>\n\n\
         ## Recommendations\n<numbered list>\n\n\
         ## Approval Status\n\
         [APPROVED] or [CHANGES REQUESTED] or [NEEDS DISCUSSION]\n\n\
         Critical issues always mean CHANGES REQUESTED."
    )
}

pub fn documenter_prompt(plan_file: Option<&str>) -> String {
    let plan_line = match plan_file {
        Some(p) => format!(" The implementation plan is in `{p}`."),
        None => String::new(),
    };
    format!(
        "Update the repository documentation to reflect the changes on this \
         branch.{plan_line} Touch README, docs/, and inline docs where the \
         behavior changed; do not modify code."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(labels: &[&str]) -> Issue {
        Issue {
            number: 7,
            title: "Fix login redirect".to_string(),
            body: "Redirect loops after login.".to_string(),
            labels: labels.iter().map(|s| s.to_string()).collect(),
            comments: vec![],
        }
    }

    #[test]
    fn test_class_from_labels() {
        assert_eq!(class_from_labels(&issue(&["bug"]).labels), Some(IssueClass::Bug));
        assert_eq!(
            class_from_labels(&issue(&["implement"]).labels),
            Some(IssueClass::Feature)
        );
        assert_eq!(
            class_from_labels(&issue(&["plan"]).labels),
            Some(IssueClass::Chore)
        );
        assert_eq!(class_from_labels(&issue(&["question"]).labels), None);
    }

    #[test]
    fn test_branch_name_round_trip() {
        let branch = branch_name(IssueClass::Bug, 123, "abc12345");
        assert_eq!(branch, "graft/bug-123-abc12345");
        assert_eq!(
            parse_workflow_branch(&branch),
            Some((123, "abc12345".to_string()))
        );
    }

    #[test]
    fn test_parse_branch_rejects_foreign_branches() {
        assert_eq!(parse_workflow_branch("main"), None);
        assert_eq!(parse_workflow_branch("feature/login"), None);
        assert_eq!(parse_workflow_branch("graft/bug"), None);
        assert_eq!(parse_workflow_branch("graft/bug-notanumber-abc12345"), None);
    }

    #[test]
    fn test_parse_branch_with_hyphenated_class() {
        // Only the trailing two segments are positional; anything before
        // them may contain hyphens.
        assert_eq!(
            parse_workflow_branch("graft/feature-extra-55-deadbeef"),
            Some((55, "deadbeef".to_string()))
        );
    }

    #[test]
    fn test_find_plan_file_prefers_conventional_path() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("specs")).unwrap();
        std::fs::write(tmp.path().join("specs/graft-abc12345-plan.md"), "plan").unwrap();

        let found = find_plan_file(tmp.path(), "abc12345", "").unwrap();
        assert_eq!(found, "specs/graft-abc12345-plan.md");
    }

    #[test]
    fn test_find_plan_file_falls_back_to_output_mention() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("specs")).unwrap();
        std::fs::write(tmp.path().join("specs/other-plan.md"), "plan").unwrap();

        let output = "I wrote the plan to specs/other-plan.md as requested.";
        let found = find_plan_file(tmp.path(), "abc12345", output).unwrap();
        assert_eq!(found, "specs/other-plan.md");

        assert_eq!(find_plan_file(tmp.path(), "abc12345", "no plan here"), None);
    }

    #[tokio::test]
    async fn test_classify_uses_label_without_agent() {
        struct PanicInvoker;
        #[async_trait::async_trait]
        impl AgentInvoker for PanicInvoker {
            async fn invoke(
                &self,
                _task: &AgentTask,
                _dir: &Path,
            ) -> crate::error::Result<crate::agent::AgentResponse> {
                panic!("classifier must not run when a label decides the class");
            }
        }

        let class = classify_issue(&PanicInvoker, &issue(&["bug"]), Path::new("."))
            .await
            .unwrap();
        assert_eq!(class, IssueClass::Bug);
    }

    #[tokio::test]
    async fn test_classify_via_agent_output() {
        struct Scripted(&'static str);
        #[async_trait::async_trait]
        impl AgentInvoker for Scripted {
            async fn invoke(
                &self,
                _task: &AgentTask,
                _dir: &Path,
            ) -> crate::error::Result<crate::agent::AgentResponse> {
                Ok(crate::agent::AgentResponse {
                    success: true,
                    output: self.0.to_string(),
                    session_id: None,
                })
            }
        }

        let class = classify_issue(&Scripted("This is a feature.\n"), &issue(&[]), Path::new("."))
            .await
            .unwrap();
        assert_eq!(class, IssueClass::Feature);

        let err = classify_issue(&Scripted("no idea"), &issue(&[]), Path::new("."))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Agent(_)));
    }
}
