//! App-name and commit-message generation via the fast model

use appforge_llm::{CompletionRequest, LlmGateway, Message};
use tracing::debug;

/// Kebab-case fallback derived from the prompt's leading words.
fn slugify(prompt: &str, max_words: usize) -> String {
    let words: Vec<String> = prompt
        .split_whitespace()
        .filter_map(|word| {
            let cleaned: String = word
                .chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase();
            if cleaned.is_empty() {
                None
            } else {
                Some(cleaned)
            }
        })
        .filter(|word| !matches!(word.as_str(), "a" | "an" | "the" | "implement" | "build" | "create" | "make"))
        .take(max_words)
        .collect();
    if words.is_empty() {
        "generated-app".to_string()
    } else {
        words.join("-")
    }
}

/// Short kebab-case application name, e.g. `counter-app`.
pub async fn generate_app_name(gateway: &LlmGateway, model: &str, user_prompt: &str) -> String {
    let request = CompletionRequest {
        model: model.to_string(),
        messages: vec![Message::user_text(format!(
            "Produce a short kebab-case name (2-4 words, lowercase, hyphens \
             only) for the application described below. Respond with the \
             name only.\n\n{}",
            user_prompt
        ))],
        max_tokens: 64,
        ..Default::default()
    };
    match gateway.complete(&request).await {
        Ok(completion) => {
            let raw = completion.into_message().text();
            let name = slugify(&raw, 4);
            if name == "generated-app" {
                slugify(user_prompt, 3)
            } else {
                name
            }
        }
        Err(e) => {
            debug!("App name generation failed, using heuristic: {}", e);
            slugify(user_prompt, 3)
        }
    }
}

/// One-line commit message for the turn's changes.
pub async fn generate_commit_message(
    gateway: &LlmGateway,
    model: &str,
    user_request: &str,
) -> String {
    let request = CompletionRequest {
        model: model.to_string(),
        messages: vec![Message::user_text(format!(
            "Write a one-line git commit message (imperative mood, under 72 \
             characters, no quotes) for changes implementing this request:\n\n{}",
            user_request
        ))],
        max_tokens: 64,
        ..Default::default()
    };
    match gateway.complete(&request).await {
        Ok(completion) => {
            let text = completion.into_message().text();
            let line = text.lines().find(|l| !l.trim().is_empty());
            match line {
                Some(line) => line.trim().trim_matches('"').to_string(),
                None => format!("Implement: {}", user_request.trim()),
            }
        }
        Err(e) => {
            debug!("Commit message generation failed, using fallback: {}", e);
            format!("Implement: {}", user_request.trim())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_drops_filler_words() {
        assert_eq!(slugify("Implement a counter app", 3), "counter-app");
        assert_eq!(slugify("Build the Todo List manager!", 3), "todo-list-manager");
        assert_eq!(slugify("", 3), "generated-app");
    }
}
