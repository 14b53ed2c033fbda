//! Declarative command table entries.

use serde::{Deserialize, Serialize};

/// A command the model may issue.
///
/// `end_name` present means a block command, closed by a line holding exactly the end
/// marker. Absent means a single-line command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub name: String,
    #[serde(default)]
    pub end_name: Option<String>,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub docs: String,
}

impl CommandSpec {
    pub fn single_line(name: &str) -> Self {
        Self {
            name: name.to_string(),
            end_name: None,
            code: String::new(),
            docs: String::new(),
        }
    }

    pub fn block(name: &str, end_name: &str) -> Self {
        Self {
            end_name: Some(end_name.to_string()),
            ..Self::single_line(name)
        }
    }

    pub fn is_block(&self) -> bool {
        self.end_name.is_some()
    }
}

/// Render the `command_docs` block shown in the system message.
pub fn render_command_docs<'a>(specs: impl IntoIterator<Item = &'a CommandSpec>) -> String {
    let mut buf = String::new();
    for spec in specs {
        buf.push_str(&spec.name);
        buf.push_str(":\n");
        let docs = spec.docs.trim();
        if !docs.is_empty() {
            for line in docs.lines() {
                buf.push_str("  ");
                buf.push_str(line);
                buf.push('\n');
            }
        }
        if let Some(end) = &spec.end_name {
            buf.push_str(&format!("  end with a line containing only: {end}\n"));
        }
    }
    buf
}
