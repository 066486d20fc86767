//! Operator interaction for interactive runs.

use anyhow::{Context, Result};
use dialoguer::Confirm;

/// Asks the person running the pipeline for decisions.
pub trait Operator {
    /// Ask a yes/no question. Declining is not an error.
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Prompts on the terminal; Enter accepts.
#[derive(Debug, Default)]
pub struct TerminalOperator;

impl Operator for TerminalOperator {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(true)
            .interact()
            .context("read operator confirmation")
    }
}

/// Answers yes to everything (`--yes` and non-interactive runs).
#[derive(Debug, Default)]
pub struct AutoApprove;

impl Operator for AutoApprove {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}
