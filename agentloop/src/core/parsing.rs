//! Parsers that split raw model output into `(thought, action)`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Model output did not match the configured format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatError {
    pub message: String,
}

impl FormatError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "format error: {}", self.message)
    }
}

impl std::error::Error for FormatError {}

/// Output format the model is instructed to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputParser {
    /// Free-form thought followed by the last top-level fenced code block.
    #[default]
    ThoughtAction,
    /// Thought with the action wrapped in `<command>...</command>`.
    XmlThoughtAction,
    /// Whole output is the action; its first word must be a known command.
    Action,
    /// Whole output is both thought and action.
    Identity,
}

impl OutputParser {
    /// Parse `output`. `command_names` is consulted by [`OutputParser::Action`] only.
    pub fn parse(
        self,
        output: &str,
        command_names: &[String],
    ) -> Result<(String, String), FormatError> {
        match self {
            OutputParser::ThoughtAction => parse_thought_action(output),
            OutputParser::XmlThoughtAction => parse_xml_thought_action(output),
            OutputParser::Action => parse_action(output, command_names),
            OutputParser::Identity => Ok((output.to_string(), output.to_string())),
        }
    }
}

fn parse_thought_action(output: &str) -> Result<(String, String), FormatError> {
    static FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?m)^```(\S*)\s*\n|^```\s*$").unwrap());

    // (start, end) of the fence lines bounding the last complete top-level block.
    let mut stack: Vec<(usize, usize)> = Vec::new();
    let mut last_block: Option<((usize, usize), (usize, usize))> = None;
    for caps in FENCE_RE.captures_iter(output) {
        let Some(whole) = caps.get(0) else { continue };
        let span = (whole.start(), whole.end());
        match caps.get(1).map(|m| m.as_str()) {
            // A bare fence closes the innermost open block, if any.
            Some("") | None if !stack.is_empty() => {
                if let Some(open) = stack.pop()
                    && stack.is_empty()
                {
                    last_block = Some((open, span));
                }
            }
            Some(_) => stack.push(span),
            None => {}
        }
    }

    let Some((open, close)) = last_block else {
        return Err(FormatError::new("no action found in model response"));
    };
    let thought = format!("{}{}", &output[..open.0], &output[close.1..]);
    let action = output[open.1..close.0].to_string();
    Ok((thought, action))
}

fn parse_xml_thought_action(output: &str) -> Result<(String, String), FormatError> {
    const OPEN: &str = "<command>";
    const CLOSE: &str = "</command>";
    let close = output
        .rfind(CLOSE)
        .ok_or_else(|| FormatError::new("no </command> tag in model response"))?;
    let open = output[..close]
        .rfind(OPEN)
        .ok_or_else(|| FormatError::new("no <command> tag in model response"))?;
    let action = output[open + OPEN.len()..close].trim_matches('\n').to_string();
    let thought = format!("{}{}", &output[..open], &output[close + CLOSE.len()..]);
    Ok((thought.trim().to_string(), action))
}

fn parse_action(output: &str, command_names: &[String]) -> Result<(String, String), FormatError> {
    let first = output
        .split_whitespace()
        .next()
        .ok_or_else(|| FormatError::new("empty model response"))?;
    if command_names.iter().any(|name| name == first) {
        return Ok((output.to_string(), output.to_string()));
    }
    Err(FormatError::new(format!("'{first}' is not a known command")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thought_action_takes_last_top_level_block() {
        let output = "Let me look.\n```\nls -a\n```\nthen\n```bash\ncat a\n```\n";
        let (thought, action) = OutputParser::ThoughtAction
            .parse(output, &[])
            .expect("parse");
        assert_eq!(action, "cat a\n");
        assert_eq!(thought, "Let me look.\n```\nls -a\n```\nthen\n");
    }

    #[test]
    fn thought_action_handles_nested_fences() {
        let output = "Write docs.\n```\nedit 1:1\n```python\nx = 1\n```\nend_of_edit\n```";
        let (thought, action) = OutputParser::ThoughtAction
            .parse(output, &[])
            .expect("parse");
        assert_eq!(thought, "Write docs.\n");
        assert_eq!(action, "edit 1:1\n```python\nx = 1\n```\nend_of_edit\n");
    }

    #[test]
    fn thought_action_without_block_is_a_format_error() {
        let err = OutputParser::ThoughtAction
            .parse("I will run ls", &[])
            .expect_err("format error");
        assert!(err.to_string().contains("no action"));
    }

    #[test]
    fn xml_parser_extracts_command_tag() {
        let (thought, action) = OutputParser::XmlThoughtAction
            .parse("Check files.\n<command>\nls\n</command>", &[])
            .expect("parse");
        assert_eq!(thought, "Check files.");
        assert_eq!(action, "ls");
    }

    #[test]
    fn action_parser_requires_known_command() {
        let names = vec!["open".to_string()];
        assert!(OutputParser::Action.parse("open a.py", &names).is_ok());
        assert!(OutputParser::Action.parse("rm -rf /", &names).is_err());
        assert!(OutputParser::Action.parse("   ", &names).is_err());
    }
}
