//! Action grammar: compiles the command table into leftmost-match patterns.
//!
//! Two name-keyed tables are built once per runtime:
//!
//! - **command patterns**: every configured command plus the submit command.
//! - **subroutine patterns**: every subroutine plus the submit command, since submit
//!   terminates any agent level.
//!
//! Callers never see the tables directly; they pick a [`PatternView`] and ask for the
//! leftmost match within it.

use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use regex::Regex;

use crate::core::commands::CommandSpec;

/// Which subset of the tables a lookup searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternView {
    /// Subroutine table only. Top-level dispatch uses this so delegated calls are
    /// recognized before plain text.
    Subroutine,
    /// Block and submit commands, plus block subroutines. Block commands stay with
    /// the owning agent.
    MultiLine,
    /// Block commands only. Used by the multi-line guard.
    MultiLineNoSubroutines,
}

/// A compiled matcher for one command name.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    name: String,
    regex: Regex,
    /// Came from the subroutine table; a match is a delegated call.
    delegates: bool,
}

impl CompiledPattern {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn single_line(name: &str) -> Result<Self> {
        let source = format!(r"(?m)^[ \t]*({})(?:[ \t]+(.*?))?[ \t]*$", regex::escape(name));
        Self::build(name, &source)
    }

    fn block(name: &str, end_name: &str) -> Result<Self> {
        let source = format!(
            r"(?ms)^[ \t]*({})(?:[ \t]*\n|[ \t]+|$)(.*?)^[ \t]*({})[ \t]*$",
            regex::escape(name),
            regex::escape(end_name)
        );
        Self::build(name, &source)
    }

    /// A bare line holding only `name`, with an always-empty argument group.
    fn bare(name: &str) -> Result<Self> {
        let source = format!(r"(?m)^[ \t]*({})()[ \t]*$", regex::escape(name));
        Self::build(name, &source)
    }

    fn for_spec(spec: &CommandSpec) -> Result<Self> {
        match &spec.end_name {
            Some(end) => Self::block(&spec.name, end),
            None => Self::single_line(&spec.name),
        }
    }

    fn build(name: &str, source: &str) -> Result<Self> {
        let regex = Regex::new(source).with_context(|| format!("compile pattern for '{name}'"))?;
        Ok(Self {
            name: name.to_string(),
            regex,
            delegates: false,
        })
    }

    fn delegating(mut self) -> Self {
        self.delegates = true;
        self
    }

    /// Leftmost match of this pattern in `text`.
    pub fn find<'t>(&self, text: &'t str) -> Option<PatternMatch<'t>> {
        let caps = self.regex.captures(text)?;
        let whole = caps.get(0)?;
        Some(PatternMatch {
            start: whole.start(),
            end: whole.end(),
            name: caps.get(1).map_or("", |m| m.as_str()),
            args: caps.get(2).map_or("", |m| m.as_str()),
            end_marker: caps.get(3).map(|m| m.as_str()),
            delegates: self.delegates,
        })
    }
}

/// A located command occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch<'t> {
    pub start: usize,
    pub end: usize,
    pub name: &'t str,
    pub args: &'t str,
    /// End marker text for block commands.
    pub end_marker: Option<&'t str>,
    /// Matched a subroutine pattern rather than a command of the owning agent.
    pub delegates: bool,
}

/// Both pattern tables plus the facts the views need.
#[derive(Debug, Clone)]
pub struct PatternTables {
    submit_command: String,
    commands: Vec<CompiledPattern>,
    subroutines: Vec<CompiledPattern>,
    block_names: BTreeSet<String>,
}

impl PatternTables {
    /// Compile the tables. Insertion order is preserved; a command named like the
    /// submit command is replaced in place by the submit pattern.
    pub fn compile(
        commands: &[CommandSpec],
        subroutines: &[CommandSpec],
        submit_command: &str,
        submit_end_name: Option<&str>,
    ) -> Result<Self> {
        if submit_command.trim().is_empty() {
            bail!("submit command must not be empty");
        }

        let mut block_names = BTreeSet::new();
        for spec in commands.iter().chain(subroutines) {
            if spec.name.trim().is_empty() {
                bail!("command names must not be empty");
            }
            if spec.is_block() {
                block_names.insert(spec.name.clone());
            }
        }

        let submit = match submit_end_name {
            Some(end) => {
                block_names.insert(submit_command.to_string());
                CompiledPattern::block(submit_command, end)?
            }
            None => CompiledPattern::bare(submit_command)?,
        };

        let mut command_table = Vec::with_capacity(commands.len() + 1);
        for spec in commands {
            upsert(&mut command_table, CompiledPattern::for_spec(spec)?);
        }
        upsert(&mut command_table, submit.clone());

        let mut subroutine_table = Vec::with_capacity(subroutines.len() + 1);
        for spec in subroutines {
            upsert(&mut subroutine_table, CompiledPattern::for_spec(spec)?.delegating());
        }
        upsert(&mut subroutine_table, submit);

        Ok(Self {
            submit_command: submit_command.to_string(),
            commands: command_table,
            subroutines: subroutine_table,
            block_names,
        })
    }

    pub fn submit_command(&self) -> &str {
        &self.submit_command
    }

    pub fn is_block_command(&self, name: &str) -> bool {
        self.block_names.contains(name)
    }

    /// Patterns searched by `view`, in table insertion order.
    pub fn view(&self, view: PatternView) -> Vec<&CompiledPattern> {
        match view {
            PatternView::Subroutine => self.subroutines.iter().collect(),
            PatternView::MultiLine => self
                .commands
                .iter()
                .filter(|p| self.is_block_command(&p.name) || p.name == self.submit_command)
                .chain(
                    self.subroutines
                        .iter()
                        .filter(|p| self.is_block_command(&p.name)),
                )
                .collect(),
            PatternView::MultiLineNoSubroutines => self
                .commands
                .iter()
                .filter(|p| self.is_block_command(&p.name))
                .collect(),
        }
    }

    /// The match with the smallest start offset across `view`. Ties go to the
    /// pattern inserted first.
    pub fn first_match<'t>(&self, text: &'t str, view: PatternView) -> Option<PatternMatch<'t>> {
        let mut best: Option<PatternMatch<'t>> = None;
        for pattern in self.view(view) {
            if let Some(found) = pattern.find(text)
                && best.is_none_or(|b| found.start < b.start)
            {
                best = Some(found);
            }
        }
        best
    }
}

fn upsert(table: &mut Vec<CompiledPattern>, pattern: CompiledPattern) {
    match table.iter_mut().find(|p| p.name == pattern.name) {
        Some(slot) => *slot = pattern,
        None => table.push(pattern),
    }
}
