//! Slash-command payload parsing

use crate::error::{Error, Result};
use regex::Regex;

/// Default prompt when a repository URL arrives without instructions
const DEFAULT_REPO_PROMPT: &str = "Help me understand and improve this codebase";

/// Parsed slash-command payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    /// Extracted Git repository URL, if the payload contained one
    pub repo_url: Option<String>,
    /// The remaining free text
    pub prompt: String,
}

/// Compiled payload parser.
pub struct CommandParser {
    repo_pattern: Regex,
}

impl CommandParser {
    pub fn new() -> Result<Self> {
        // https and scp-like GitHub URL forms
        let repo_pattern =
            Regex::new(r"(?:git@github\.com:|https://github\.com/)[\w\-\.]+/[\w\-\.]+")
                .map_err(|e| Error::Config(format!("invalid repo pattern: {}", e)))?;
        Ok(Self { repo_pattern })
    }

    /// Split a payload into an optional repository URL and a prompt.
    ///
    /// With a URL present, the remainder becomes the prompt (or a default
    /// when empty); otherwise the whole payload is the prompt.
    pub fn parse(&self, content: &str) -> ParsedCommand {
        let content = content.trim();

        if let Some(found) = self.repo_pattern.find(content) {
            let repo_url = found.as_str().to_string();
            let prompt = format!("{}{}", &content[..found.start()], &content[found.end()..])
                .trim()
                .to_string();
            let prompt = if prompt.is_empty() {
                DEFAULT_REPO_PROMPT.to_string()
            } else {
                prompt
            };
            return ParsedCommand {
                repo_url: Some(repo_url),
                prompt,
            };
        }

        ParsedCommand {
            repo_url: None,
            prompt: content.to_string(),
        }
    }
}

/// Extract the repository name from a Git URL.
pub fn extract_repo_name(repo_url: &str) -> String {
    repo_url
        .trim_end_matches(".git")
        .rsplit(&['/', ':'][..])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("unknown-repo")
        .to_string()
}

/// Strip a leading `<@BOTID>` mention token from message text.
pub fn strip_mention(text: &str) -> &str {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix("<@") {
        if let Some((_, after)) = rest.split_once('>') {
            return after.trim();
        }
    }
    text
}
