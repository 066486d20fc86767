//! Test-only helpers: scripted nodes and operators.

use std::cell::RefCell;
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{Result, anyhow};

use crate::core::node::{FlowNode, OutputInfo};
use crate::core::types::{ChangeCheck, FlowContext, FlowResult};
use crate::io::operator::Operator;
use crate::io::outputs::scan_output_dir;

/// Shared, ordered record of `check:<name>`, `execute:<name>` and
/// `commit:<name>` calls.
pub type CallLog = Rc<RefCell<Vec<String>>>;

pub fn call_log() -> CallLog {
    Rc::new(RefCell::new(Vec::new()))
}

#[derive(Debug, Clone)]
enum ChangeScript {
    Stale(Vec<String>),
    Fresh,
    Error(String),
}

#[derive(Debug, Clone)]
enum ExecuteScript {
    Success(u64),
    Failure(String),
    Error(String),
}

/// A node whose behavior is fixed up front.
///
/// Defaults: stale ("scripted change"), executes successfully, no output
/// directory, always ready.
#[derive(Debug, Clone)]
pub struct ScriptedNode {
    name: String,
    dependencies: BTreeSet<String>,
    change: ChangeScript,
    execute: ExecuteScript,
    review: Option<String>,
    output_dir: Option<PathBuf>,
    ready: Option<bool>,
    writes: Vec<(String, String)>,
    log: Option<CallLog>,
}

impl ScriptedNode {
    pub fn new(name: &str, deps: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            dependencies: deps.iter().map(|dep| dep.to_string()).collect(),
            change: ChangeScript::Stale(vec!["scripted change".to_string()]),
            execute: ExecuteScript::Success(1),
            review: None,
            output_dir: None,
            ready: None,
            writes: Vec::new(),
            log: None,
        }
    }

    pub fn fresh(mut self) -> Self {
        self.change = ChangeScript::Fresh;
        self
    }

    pub fn stale(mut self, reasons: &[&str]) -> Self {
        self.change = ChangeScript::Stale(reasons.iter().map(|r| r.to_string()).collect());
        self
    }

    pub fn check_error(mut self, message: &str) -> Self {
        self.change = ChangeScript::Error(message.to_string());
        self
    }

    /// `execute` returns `Ok` with a failed result.
    pub fn failing(mut self, message: &str) -> Self {
        self.execute = ExecuteScript::Failure(message.to_string());
        self
    }

    /// `execute` returns `Err`.
    pub fn erroring(mut self, message: &str) -> Self {
        self.execute = ExecuteScript::Error(message.to_string());
        self
    }

    pub fn requiring_review(mut self, instructions: &str) -> Self {
        self.review = Some(instructions.to_string());
        self
    }

    /// Output info is scanned from `dir` unless readiness is overridden.
    pub fn with_output_dir(mut self, dir: &Path) -> Self {
        self.output_dir = Some(dir.to_path_buf());
        self
    }

    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = Some(ready);
        self
    }

    /// File (relative to the output directory) written on successful execute.
    pub fn writes(mut self, rel: &str, contents: &str) -> Self {
        self.writes.push((rel.to_string(), contents.to_string()));
        self
    }

    pub fn with_call_log(mut self, log: &CallLog) -> Self {
        self.log = Some(Rc::clone(log));
        self
    }

    fn record(&self, call: &str) {
        if let Some(log) = &self.log {
            log.borrow_mut().push(format!("{call}:{}", self.name));
        }
    }
}

impl FlowNode for ScriptedNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn dependencies(&self) -> &BTreeSet<String> {
        &self.dependencies
    }

    fn check_changes(&self, _ctx: &FlowContext) -> Result<ChangeCheck> {
        self.record("check");
        match &self.change {
            ChangeScript::Stale(reasons) => Ok(ChangeCheck::stale(reasons.clone())),
            ChangeScript::Fresh => Ok(ChangeCheck::fresh()),
            ChangeScript::Error(message) => Err(anyhow!(message.clone())),
        }
    }

    fn execute(&self, _ctx: &FlowContext) -> Result<FlowResult> {
        self.record("execute");
        match &self.execute {
            ExecuteScript::Success(items) => {
                if let Some(dir) = &self.output_dir {
                    for (rel, contents) in &self.writes {
                        let path = dir.join(rel);
                        if let Some(parent) = path.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::write(&path, contents)?;
                    }
                }
                let result = FlowResult::success(*items);
                Ok(match &self.review {
                    Some(instructions) => result.with_review(instructions.clone()),
                    None => result,
                })
            }
            ExecuteScript::Failure(message) => Ok(FlowResult::failure(message.clone())),
            ExecuteScript::Error(message) => Err(anyhow!(message.clone())),
        }
    }

    fn commit_changes(&self, _ctx: &FlowContext) -> Result<()> {
        self.record("commit");
        Ok(())
    }

    fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }

    fn output_info(&self) -> OutputInfo {
        let info = match &self.output_dir {
            Some(dir) => scan_output_dir(dir).unwrap_or_default(),
            None => OutputInfo::stateless(),
        };
        match self.ready {
            Some(ready) => info.with_ready(ready),
            None => info,
        }
    }
}

/// Operator that replays fixed answers (then answers yes) and records prompts.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: VecDeque<bool>,
    prompts: Vec<String>,
}

impl ScriptedOperator {
    pub fn new(answers: &[bool]) -> Self {
        Self {
            answers: answers.iter().copied().collect(),
            prompts: Vec::new(),
        }
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }
}

impl Operator for ScriptedOperator {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        self.prompts.push(prompt.to_string());
        Ok(self.answers.pop_front().unwrap_or(true))
    }
}

/// Write `contents` to `root/rel`, creating parent directories.
pub fn write_file(root: &Path, rel: &str, contents: &str) -> PathBuf {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(&path, contents).expect("write file");
    path
}
