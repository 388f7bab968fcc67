//! File and commit summarization on top of a [`Generator`].

use anyhow::{bail, Context, Result};
use std::sync::Arc;

use crate::config::IngestConfig;
use crate::llm::Generator;

#[derive(Clone)]
pub struct Summarizer {
    generator: Arc<dyn Generator>,
    prefix_chars: usize,
    max_diff_chars: usize,
}

impl Summarizer {
    pub fn new(generator: Arc<dyn Generator>, config: &IngestConfig) -> Self {
        Self {
            generator,
            prefix_chars: config.summary_prefix_chars,
            max_diff_chars: config.max_diff_chars,
        }
    }

    /// A synopsis of at most 100 words, written for an onboarding engineer.
    /// Only the first `summary_prefix_chars` characters are shown to the model.
    pub async fn summarize_file(&self, path: &str, content: &str) -> Result<String> {
        let prompt = file_prompt(path, truncate_chars(content, self.prefix_chars));
        let summary = self
            .generator
            .generate(&prompt)
            .await
            .with_context(|| format!("Failed to summarize {}", path))?;
        non_empty(summary, path)
    }

    /// A bullet-point description of a commit diff.
    pub async fn summarize_commit(&self, hash: &str, diff: &str) -> Result<String> {
        let prompt = commit_prompt(truncate_chars(diff, self.max_diff_chars));
        let summary = self
            .generator
            .generate(&prompt)
            .await
            .with_context(|| format!("Failed to summarize commit {}", hash))?;
        non_empty(summary, hash)
    }
}

fn non_empty(summary: String, item: &str) -> Result<String> {
    let trimmed = summary.trim();
    if trimmed.is_empty() {
        bail!("model returned an empty summary for {}", item);
    }
    Ok(trimmed.to_string())
}

/// Longest prefix of `text` with at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn file_prompt(path: &str, excerpt: &str) -> String {
    format!(
        "You are a senior software engineer helping a new teammate find their way \
around a codebase.\n\
Explain what the file `{path}` is for and how it fits into the project. \
Use no more than 100 words.\n\n\
```\n{excerpt}\n```\n"
    )
}

fn commit_prompt(diff: &str) -> String {
    format!(
        "You are reviewing a git commit. Describe the change as a short list of bullet \
points.\n\
Each bullet starts with a past-tense verb such as Added, Fixed, Removed or Refactored, \
and names the affected files in square brackets when that helps, for example:\n\
- Fixed off-by-one error in pagination [src/api/list.rs]\n\
Leave out changes that carry no meaning, such as formatting.\n\n\
```diff\n{diff}\n```\n"
    )
}
