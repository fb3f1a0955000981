//! Instruction text for each model call.
//!
//! Inputs travel in [`crate::intelligence::CompletionRequest::context`]; the
//! prompt only states the task and the reply shape.

use crate::domain::FixDomain;

pub fn analyze(file_path: &str) -> String {
    format!(
        "Audit `{file_path}` (content in context) against WCAG 2.1 AA.\n\
         Reply with a JSON array; each element:\n\
         {{\"line\": <number or null>, \"severity\": \"critical|high|medium|low\", \
         \"wcag\": \"<criterion, e.g. 1.1.1>\", \
         \"category\": \"structural|contrast|keyboard-access|aria|other\", \
         \"description\": \"...\", \"impact\": \"...\", \"recommendation\": \"...\"}}\n\
         Reply with [] when the file has no issues."
    )
}

pub fn locate() -> String {
    "Find the exact source for the issue in context within the given file content.\n\
     Reply with one JSON object:\n\
     {\"exact_line\": <number>, \"end_line\": <number or null>, \
     \"code_snippet\": \"<verbatim source text to replace>\", \
     \"problematic_element\": \"...\", \"fix_approach\": \"...\"}\n\
     `code_snippet` must be copied verbatim from the file."
        .to_string()
}

pub fn fix(domain: FixDomain, revision: bool) -> String {
    let mut prompt = format!(
        "You are a {}. Rewrite the snippet in context so the issue is resolved \
         without changing unrelated behaviour.\n\
         Reply with one JSON object:\n\
         {{\"fixed_code\": \"<replacement for the snippet>\", \
         \"explanation\": \"...\", \"additional_notes\": \"...\"}}",
        domain.expert_title()
    );
    if revision {
        prompt.push_str(
            "\nA reviewer rejected the previous attempt (in context). \
             Address every point of their feedback.",
        );
    }
    prompt
}

pub fn review() -> String {
    "Critically review the proposed fix in context: does it resolve the issue, \
     follow WCAG 2.1, avoid new accessibility problems, and stay maintainable?\n\
     Reply with one JSON object:\n\
     {\"decision\": \"approved|revise|abandoned\", \"feedback\": \"...\", \
     \"criteria_checked\": [\"<wcag criterion>\"], \"rating\": <0-10>}\n\
     Use `abandoned` only when the issue cannot be fixed at this location."
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_prompt_mentions_feedback() {
        assert!(!fix(FixDomain::Css, false).contains("feedback"));
        assert!(fix(FixDomain::Css, true).contains("feedback"));
        assert!(fix(FixDomain::Css, true).starts_with("You are a CSS accessibility expert"));
    }
}
