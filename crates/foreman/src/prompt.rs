//! Prompt assembly.
//!
//! Builds a single prompt from a [`PromptContext`], section by section.
//! Sections are independently optional; the execution directive is always
//! the tail. Baseline issues get an additional self-healing directive
//! with the failure-classification and verification protocol.

use dispatch::baseline::is_baseline_issue;
use dispatch::tracker::types::Issue;

use crate::context::PromptContext;

/// Tail section enforcing autonomous behavior.
const EXECUTION_DIRECTIVE: &str = "\
## Execution Directive

You are running unattended. Complete the task fully: make the changes, \
run the relevant tests, and leave the working tree in a consistent state. \
Do not ask questions, do not wait for confirmation, and do not stop at a \
plan. If you discover separate problems outside this task's scope, note \
them in your final summary instead of fixing them.";

/// Extra directive appended for baseline (broken-gate) issues.
const SELF_HEALING_DIRECTIVE: &str = "\
## Self-Healing Protocol

This issue tracks a failing repository-wide quality gate. Work it as follows:

1. Classify each failure before changing anything:
   - **flaky**: passes on re-run without changes
   - **real**: a genuine defect in code or test
   - **environmental**: toolchain, network, or machine state
2. Verification: re-run any test you believe is flaky 10 times in a row; \
only call it stable when all 10 runs pass.
3. Fix real failures at the root cause. Never delete or skip a test to \
make the gate pass.
4. Commit message format: `baseline(<gate>): <what was fixed>` with one \
line per repaired failure in the body.";

fn push_issue_line(out: &mut String, issue: &Issue) {
    out.push_str(&format!(
        "- {} [{}] (P{}, {}): {}\n",
        issue.id, issue.issue_type, issue.priority, issue.status, issue.title
    ));
}

/// Render the prompt for `ctx`.
pub fn build_prompt(ctx: &PromptContext) -> String {
    let issue = &ctx.issue;
    let mut out = String::new();

    if let Some(mission) = &ctx.mission {
        out.push_str(&format!(
            "# Mission: {}\n\n{}\n\n",
            mission.title,
            mission.description.trim()
        ));
    }

    out.push_str(&format!("# Task {}: {}\n\n", issue.id, issue.title));
    if !issue.description.trim().is_empty() {
        out.push_str(issue.description.trim());
        out.push_str("\n\n");
    }
    if !issue.design.trim().is_empty() {
        out.push_str("## Design Notes\n");
        out.push_str(issue.design.trim());
        out.push_str("\n\n");
    }
    if !issue.acceptance_criteria.trim().is_empty() {
        out.push_str("## Acceptance Criteria\n");
        out.push_str(issue.acceptance_criteria.trim());
        out.push_str("\n\n");
    }

    if let Some(sandbox) = &ctx.sandbox_path {
        out.push_str(&format!("## Workspace\n{}\n", sandbox.display()));
        if let Some(git) = &ctx.git_state {
            if !git.modified_files.is_empty() {
                out.push_str("Modified files already present:\n");
                for file in &git.modified_files {
                    out.push_str(&format!("- {file}\n"));
                }
            }
        }
        out.push('\n');
    }

    if let Some(git) = &ctx.git_state {
        out.push_str(&format!(
            "## Git State\nBranch `{}` at `{}`\n\n",
            git.branch, git.head
        ));
    }

    if !ctx.blockers.is_empty() {
        out.push_str("## Open Blockers (context only — do not work these)\n");
        for blocker in &ctx.blockers {
            push_issue_line(&mut out, blocker);
        }
        out.push('\n');
    }
    if !ctx.dependents.is_empty() {
        out.push_str("## Waiting On This Task\n");
        for dependent in &ctx.dependents {
            push_issue_line(&mut out, dependent);
        }
        out.push('\n');
    }
    if !ctx.siblings.is_empty() {
        out.push_str("## Sibling Tasks\n");
        for sibling in &ctx.siblings {
            push_issue_line(&mut out, sibling);
        }
        out.push('\n');
    }

    if !ctx.attempts.is_empty() {
        out.push_str("## Previous Attempts\n");
        for attempt in &ctx.attempts {
            let outcome = match attempt.success {
                Some(true) => "succeeded",
                Some(false) => "failed",
                None => "did not complete",
            };
            out.push_str(&format!("- Attempt #{} {}\n", attempt.attempt_number, outcome));
        }
        if let Some(hint) = &ctx.resume_hint {
            out.push_str(&format!("\n{hint}\n"));
        }
        out.push('\n');
    }

    if !ctx.failed_gates.is_empty() {
        out.push_str("## Failing Quality Gates\n");
        for gate in &ctx.failed_gates {
            out.push_str(&format!("### {}\n```\n{}\n```\n", gate.gate, gate.output.trim()));
        }
        out.push('\n');
    }

    if let Some(notes) = &ctx.notes {
        out.push_str("## Notes\n");
        out.push_str(notes.trim());
        out.push_str("\n\n");
    }

    out.push_str(EXECUTION_DIRECTIVE);
    if is_baseline_issue(&issue.id) {
        out.push_str("\n\n");
        out.push_str(SELF_HEALING_DIRECTIVE);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatch::baseline::{baseline_issue_id, GateKind};
    use dispatch::tracker::types::IssueType;

    fn minimal_ctx() -> PromptContext {
        PromptContext::for_issue(
            Issue::new("fm-0001", "Fix flaky retry logic", IssueType::Bug)
                .with_description("Retries fire twice under load.")
                .with_acceptance_criteria("Retry fires exactly once."),
        )
    }

    #[test]
    fn test_minimal_prompt_has_task_and_directive() {
        let prompt = build_prompt(&minimal_ctx());
        assert!(prompt.contains("# Task fm-0001: Fix flaky retry logic"));
        assert!(prompt.contains("Retries fire twice under load."));
        assert!(prompt.contains("## Acceptance Criteria"));
        assert!(prompt.ends_with(EXECUTION_DIRECTIVE));
        assert!(!prompt.contains("Self-Healing Protocol"));
    }

    #[test]
    fn test_optional_sections_absent_when_empty() {
        let prompt = build_prompt(&minimal_ctx());
        for heading in [
            "## Previous Attempts",
            "## Failing Quality Gates",
            "## Open Blockers",
            "# Mission",
            "## Notes",
        ] {
            assert!(!prompt.contains(heading), "unexpected section {heading}");
        }
    }

    #[test]
    fn test_mission_and_relations_rendered() {
        let mut ctx = minimal_ctx();
        ctx.mission = Some(
            Issue::new("fm-m", "Stabilize networking", IssueType::Epic)
                .with_description("Make the retry layer boring."),
        );
        ctx.blockers
            .push(Issue::new("fm-b", "Upgrade runtime", IssueType::Task));

        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("# Mission: Stabilize networking"));
        assert!(prompt.contains("## Open Blockers"));
        assert!(prompt.contains("fm-b"));
    }

    #[test]
    fn test_baseline_issue_gets_self_healing_directive() {
        let id = baseline_issue_id("fm", GateKind::Test);
        let ctx = PromptContext::for_issue(Issue::new(id, "baseline: tests failing", IssueType::Bug));
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("Self-Healing Protocol"));
        assert!(prompt.contains("10 times"));
        // The self-healing protocol follows the execution directive.
        let directive_at = prompt.find("## Execution Directive").unwrap();
        let healing_at = prompt.find("## Self-Healing Protocol").unwrap();
        assert!(healing_at > directive_at);
    }

    #[test]
    fn test_failed_gates_section() {
        let mut ctx = minimal_ctx();
        ctx.failed_gates.push(crate::gates::GateResult {
            gate: GateKind::Lint,
            passed: false,
            output: "warning: unused variable `x`".into(),
            duration_ms: 900,
        });
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("## Failing Quality Gates"));
        assert!(prompt.contains("unused variable"));
    }
}
