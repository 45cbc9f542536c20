use regex::Regex;

use super::{Findings, ReviewOutcome, ReviewStatus};

/// Parse a reviewer's report. Total over arbitrary input: garbage yields
/// `NeedsDiscussion`, empty input yields `Unparseable`, and no input
/// can make this panic or error.
pub fn parse_review(text: &str) -> ReviewOutcome {
    if text.trim().is_empty() {
        return ReviewOutcome {
            status: ReviewStatus::Unparseable,
            summary: String::new(),
            recommendations: Vec::new(),
            findings: Findings::default(),
            raw: text.to_string(),
        };
    }

    ReviewOutcome {
        status: parse_status(text),
        summary: section(text, "Summary").unwrap_or_default(),
        recommendations: section(text, "Recommendations")
            .map(|body| list_items(&body))
            .unwrap_or_default(),
        findings: parse_findings(text),
        raw: text.to_string(),
    }
}

fn parse_status(text: &str) -> ReviewStatus {
    // Structured form first: "## Approval Status" followed by the verdict,
    // optionally bracketed.
    let structured = Regex::new(
        r"(?i)##\s*Approval\s*Status\s*\n\s*\[?\s*(APPROVED|CHANGES[\s_]*REQUESTED|NEEDS[\s_]*DISCUSSION)",
    )
    .ok()
    .and_then(|re| re.captures(text).map(|c| c[1].to_uppercase()));

    if let Some(verdict) = structured {
        return if verdict.starts_with("APPROVED") {
            ReviewStatus::Approved
        } else if verdict.starts_with("CHANGES") {
            ReviewStatus::ChangesRequested
        } else {
            ReviewStatus::NeedsDiscussion
        };
    }

    // Fallback: verdict keywords anywhere in the report. Word boundaries
    // keep "DISAPPROVED" out, and a negated verdict ("NOT APPROVED") must
    // never read as approval.
    let matches = |pattern: &str| {
        Regex::new(pattern)
            .map(|re| re.is_match(text))
            .unwrap_or(false)
    };

    if matches(r"\bCHANGES[\s_]+REQUESTED\b") {
        ReviewStatus::ChangesRequested
    } else if matches(r"\bAPPROVED\b") && !matches(r"\bNOT\s+APPROVED\b") {
        ReviewStatus::Approved
    } else {
        ReviewStatus::NeedsDiscussion
    }
}

/// Extract the body of a `## <name>` section, up to the next `##` heading
/// or end of input.
fn section(text: &str, name: &str) -> Option<String> {
    let re = Regex::new(&format!(r"(?is)##\s*{name}\s*\n(.*?)(?:\n##|\z)")).ok()?;
    re.captures(text)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_findings(text: &str) -> Findings {
    // "## Issues Found" runs to the next top-level heading. "\n##[^#]"
    // stops at "## Foo" without swallowing "### Severity" subsections.
    let body = Regex::new(r"(?is)##\s*Issues\s*Found\s*\n(.*?)(?:\n##[^#]|\z)")
        .ok()
        .and_then(|re| re.captures(text).map(|c| c[1].to_string()));

    let Some(body) = body else {
        return Findings::default();
    };

    Findings {
        critical: severity_items(&body, "Critical"),
        moderate: severity_items(&body, "Moderate"),
        minor: severity_items(&body, "Minor"),
    }
}

fn severity_items(issues_body: &str, severity: &str) -> Vec<String> {
    let re = match Regex::new(&format!(
        r"(?is)###\s*{severity}\s*\n(.*?)(?:\n###|\n##[^#]|\z)"
    )) {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    let Some(caps) = re.captures(issues_body) else {
        return Vec::new();
    };
    let body = caps[1].trim();
    if body.eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    list_items(body)
}

/// Items of a bulleted or numbered markdown list.
fn list_items(body: &str) -> Vec<String> {
    let re = match Regex::new(r"(?m)^\s*(?:-|\*|\d+\.)\s+(.+)$") {
        Ok(re) => re,
        Err(_) => return Vec::new(),
    };
    re.captures_iter(body)
        .map(|c| c[1].trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
