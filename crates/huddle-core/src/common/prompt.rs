//! Prompt rendering from the shared conversation history.
//!
//! The layout is a plain instruction transcript:
//!
//! ```text
//! ### System:
//! {system}
//!
//! ### User:
//! {earlier prompt}
//!
//! ### Response:
//! {earlier response}
//!
//! ### User:
//! {instruction}
//!
//! ### Response:
//! ```
//!
//! Earlier exchanges are emitted oldest-first.

use crate::types::HistoryEntry;

/// System text used when none is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an AI assistant that gives helpful answers. You answer the questions in a short and concise way.";

const USER_HEADER: &str = "### User:\n";
const RESPONSE_HEADER: &str = "\n\n### Response:\n";

/// Renders prompts for the generation engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PromptTemplate {
    system: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

impl PromptTemplate {
    pub fn new(system: impl Into<String>) -> Self {
        Self {
            system: system.into(),
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// Renders `instruction` after every exchange yielded by `history`.
    pub fn render<'a, I>(&self, history: I, instruction: &str) -> String
    where
        I: IntoIterator<Item = &'a HistoryEntry>,
    {
        let mut prompt = format!("### System:\n{}\n\n", self.system);

        for exchange in history {
            prompt.push_str(USER_HEADER);
            prompt.push_str(&exchange.prompt);
            prompt.push_str(RESPONSE_HEADER);
            prompt.push_str(&exchange.response);
            prompt.push_str("\n\n");
        }

        prompt.push_str(USER_HEADER);
        prompt.push_str(instruction);
        prompt.push_str(RESPONSE_HEADER);
        prompt
    }
}

/// Returns the trailing user instruction of a rendered prompt, if any.
pub fn last_instruction(prompt: &str) -> Option<&str> {
    let start = prompt.rfind(USER_HEADER)? + USER_HEADER.len();
    let rest = &prompt[start..];
    let end = rest.rfind(RESPONSE_HEADER)?;
    Some(&rest[..end])
}
