//! Prompt builders for each pipeline phase.

use forge_providers::with_estimate;
use forge_types::{ChatMessage, ModelCallRequest, ModelSpec};

use crate::interpreter::{COMMANDS_END, COMMANDS_START};
use crate::pipeline::FinalPhaseContext;

/// Emitted by a debugger replica that found nothing to fix.
pub const NO_ISSUES_SENTINEL: &str = "NO_ISSUES_FOUND";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

impl Prompt {
    /// Builds the request: prior conversation turns, then this prompt as the last user turn.
    pub fn into_request(self, model: &ModelSpec, history: &[ChatMessage]) -> ModelCallRequest {
        let mut turns = history.to_vec();
        turns.push(ChatMessage::user(self.user));
        with_estimate(ModelCallRequest::new(model.clone(), turns).with_system_instruction(self.system))
    }
}

/// True when the reply's last non-empty line is the sentinel, allowing markdown emphasis
/// or code ticks around it and a trailing period.
pub fn signals_no_issues(text: &str) -> bool {
    text.lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .map(|line| line.trim_end_matches('.').trim_matches(|c| c == '`' || c == '*'))
        .is_some_and(|line| line == NO_ISSUES_SENTINEL)
}

fn with_project(mut body: String, project_context: &str) -> String {
    if !project_context.trim().is_empty() {
        body.push_str("\n\nCurrent project files:\n");
        body.push_str(project_context);
    }
    body
}

pub fn planner(request: &str, project_context: &str) -> Prompt {
    Prompt {
        system: "You are a senior software architect. Produce a concrete, numbered implementation \
                 plan for the user's request: files to touch, data structures, and the order of work. \
                 Do not write the code yet."
            .to_string(),
        user: with_project(format!("Request:\n{request}"), project_context),
    }
}

pub fn consolidation(request: &str, plans: &[String]) -> Prompt {
    let mut user = format!("Request:\n{request}\n\nCandidate plans:\n");
    for (index, plan) in plans.iter().enumerate() {
        user.push_str(&format!("\n### Plan {}\n{}\n", index + 1, plan.trim()));
    }
    Prompt {
        system: "You are a lead architect. Merge the candidate plans into one master plan, keeping \
                 the strongest ideas and resolving contradictions. Output only the master plan."
            .to_string(),
        user,
    }
}

/// Previous cycle's draft and consolidated review, fed into a later draft.
#[derive(Debug, Clone, Copy)]
pub struct Revision<'a> {
    pub draft: &'a str,
    pub review: &'a str,
}

pub fn draft(
    request: &str,
    master_plan: &str,
    revision: Option<Revision<'_>>,
    project_context: &str,
) -> Prompt {
    let mut user = format!("Request:\n{request}\n\nMaster plan:\n{master_plan}");
    if let Some(revision) = revision {
        user.push_str(&format!(
            "\n\nPrevious draft:\n{}\n\nReview of the previous draft:\n{}\n\nProduce a revised draft that addresses every point of the review.",
            revision.draft, revision.review
        ));
    }
    Prompt {
        system: "You are an expert programmer. Write the complete code for every file the plan \
                 touches. Show each file in full."
            .to_string(),
        user: with_project(user, project_context),
    }
}

pub fn debug(request: &str, master_plan: &str, draft: &str) -> Prompt {
    Prompt {
        system: format!(
            "You are a meticulous code reviewer. Look for bugs, missing pieces and deviations \
             from the plan. List concrete issues with fixes. If the draft has no issues at all, \
             reply with exactly {NO_ISSUES_SENTINEL}."
        ),
        user: format!("Request:\n{request}\n\nMaster plan:\n{master_plan}\n\nDraft:\n{draft}"),
    }
}

pub fn review(request: &str, draft: &str, feedback: &[String]) -> Prompt {
    let mut user = format!("Request:\n{request}\n\nDraft:\n{draft}\n\nReviewer feedback:\n");
    for (index, item) in feedback.iter().enumerate() {
        user.push_str(&format!("\n### Reviewer {}\n{}\n", index + 1, item.trim()));
    }
    Prompt {
        system: "You consolidate code review feedback. Deduplicate the reviewers' points and \
                 produce one prioritized list of changes for the next draft."
            .to_string(),
        user,
    }
}

pub fn final_implementation(context: &FinalPhaseContext) -> Prompt {
    let system = format!(
        "You apply the final code change to the user's project. Start with a short summary of \
         what changed. Then list file-system commands, one per line, between a line \
         `{COMMANDS_START}` and a line `{COMMANDS_END}`:\n\
         write <path> <<<EOF  (file content follows, ended by a line EOF)\n\
         write! <path> <<<EOF  (same, but ignore earlier moves of the path)\n\
         createFolder <path>\n\
         move <source> <destination>\n\
         delete <path>\n\
         Quote paths containing spaces. Write every file in full. Paths are relative to the \
         project root."
    );
    let mut user = format!(
        "Request:\n{}\n\nMaster plan:\n{}",
        context.user_request, context.master_plan
    );
    if let Some(draft) = &context.final_draft {
        user.push_str(&format!("\n\nFinal draft:\n{draft}"));
    }
    if let Some(review) = &context.final_review {
        user.push_str(&format!("\n\nReview of the final draft (apply it):\n{review}"));
    }
    Prompt {
        system,
        user: with_project(user, &context.project_context),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_must_close_the_reply_on_its_own_line() {
        assert!(signals_no_issues("NO_ISSUES_FOUND"));
        assert!(signals_no_issues("Looks good.\nNO_ISSUES_FOUND\n\n"));
        assert!(signals_no_issues("  **NO_ISSUES_FOUND**"));
        assert!(signals_no_issues("`NO_ISSUES_FOUND`."));
        assert!(!signals_no_issues("no issues found"));
        assert!(!signals_no_issues(
            "I can't say NO_ISSUES_FOUND: the loop is off by one."
        ));
        assert!(!signals_no_issues(
            "NO_ISSUES_FOUND\nActually, `parse` drops the last line."
        ));
        assert!(!signals_no_issues(""));
    }

    #[test]
    fn request_carries_history_and_estimate() {
        let model = ModelSpec::new("test", "m");
        let request = planner("add login", "").into_request(&model, &[ChatMessage::user("hi")]);
        assert_eq!(request.turns.len(), 2);
        assert!(request.turns[1].text_content().contains("add login"));
        assert!(request.system_instruction.is_some());
        assert!(request.estimated_input_tokens > 0);
    }

    #[test]
    fn final_prompt_includes_optional_artifacts() {
        let mut context = FinalPhaseContext {
            user_request: "req".to_string(),
            history: Vec::new(),
            master_plan: "plan".to_string(),
            final_draft: None,
            final_review: None,
            project_context: String::new(),
            earlier_phases: Vec::new(),
        };
        let without = final_implementation(&context);
        assert!(!without.user.contains("Final draft"));
        context.final_draft = Some("draft body".to_string());
        context.final_review = Some("review body".to_string());
        let with = final_implementation(&context);
        assert!(with.user.contains("draft body"));
        assert!(with.user.contains("review body"));
        assert!(with.system.contains(COMMANDS_START));
    }
}
