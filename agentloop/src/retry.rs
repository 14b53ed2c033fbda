//! Output validation with bounded requery.
//!
//! Raw model output is turned into `(thought, action)`. Format errors and blocklisted
//! actions share one budget of [`MAX_REQUERIES`] requeries; exhausting it yields the
//! `exit_format` sentinel instead of an error.

use anyhow::Result;
use tracing::{debug, warn};

use crate::core::blocklist::Blocklist;
use crate::core::parsing::{FormatError, OutputParser};
use crate::core::types::ExitStatus;
use crate::io::model::ModelIdentity;

/// Requeries allowed after the first attempt (three parses in total).
pub const MAX_REQUERIES: u32 = 2;

/// Why an output was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feedback<'a> {
    Format(&'a FormatError),
    Blocked { name: &'a str },
}

/// Asks the model again after a rejected output. Implementations must not persist
/// the rejected exchange into the run's history.
pub trait Requery {
    fn requery(&mut self, rejected_output: &str, feedback: Feedback<'_>) -> Result<String>;
}

/// A validated model turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validated {
    pub thought: String,
    pub action: String,
    pub output: String,
}

impl Validated {
    fn format_exit(output: String) -> Self {
        Self {
            thought: "Exit due to format error".to_string(),
            action: ExitStatus::Format.as_action().to_string(),
            output,
        }
    }
}

/// Validation strategy, chosen once per runtime from the model identity.
#[derive(Debug, Clone)]
pub enum Validator {
    /// Output is the action, untouched.
    Passthrough,
    /// One lenient `thought_action` parse; unparseable output is taken as the action.
    ThoughtPassthrough,
    Checked {
        parser: OutputParser,
        blocklist: Blocklist,
        command_names: Vec<String>,
    },
}

impl Validator {
    pub fn for_identity(
        identity: ModelIdentity,
        parser: OutputParser,
        blocklist: Blocklist,
        command_names: Vec<String>,
    ) -> Self {
        match identity {
            ModelIdentity::Human => Validator::Passthrough,
            ModelIdentity::HumanThought => Validator::ThoughtPassthrough,
            ModelIdentity::Api => Validator::Checked {
                parser,
                blocklist,
                command_names,
            },
        }
    }

    /// Validate `output`, requerying through `requery` on rejection. Errors from the
    /// requery (including interrupts) propagate unchanged.
    pub fn validate(&self, output: String, requery: &mut dyn Requery) -> Result<Validated> {
        match self {
            Validator::Passthrough => Ok(Validated {
                thought: String::new(),
                action: output.clone(),
                output,
            }),
            Validator::ThoughtPassthrough => {
                let (thought, action) = OutputParser::ThoughtAction
                    .parse(&output, &[])
                    .unwrap_or_else(|_| (String::new(), output.clone()));
                Ok(Validated {
                    thought,
                    action,
                    output,
                })
            }
            Validator::Checked {
                parser,
                blocklist,
                command_names,
            } => validate_checked(*parser, blocklist, command_names, output, requery),
        }
    }
}

fn validate_checked(
    parser: OutputParser,
    blocklist: &Blocklist,
    command_names: &[String],
    mut output: String,
    requery: &mut dyn Requery,
) -> Result<Validated> {
    let mut format_fails = 0u32;
    let mut blocklist_fails = 0u32;
    loop {
        let rejection = match parser.parse(&output, command_names) {
            Ok((thought, action)) => match blocklist.blocked_name(&action) {
                None => {
                    debug!(format_fails, blocklist_fails, "model output accepted");
                    return Ok(Validated {
                        thought,
                        action,
                        output,
                    });
                }
                Some(name) => {
                    blocklist_fails += 1;
                    warn!(name, output = %output, "blocklisted output");
                    Rejection::Blocked(name.to_string())
                }
            },
            Err(err) => {
                format_fails += 1;
                warn!(error = %err, output = %output, "malformed output");
                Rejection::Format(err)
            }
        };

        if format_fails + blocklist_fails > MAX_REQUERIES {
            warn!(output = %output, "malformat limit reached");
            return Ok(Validated::format_exit(output));
        }
        let feedback = match &rejection {
            Rejection::Format(err) => Feedback::Format(err),
            Rejection::Blocked(name) => Feedback::Blocked { name },
        };
        output = requery.requery(&output, feedback)?;
    }
}

enum Rejection {
    Format(FormatError),
    Blocked(String),
}
