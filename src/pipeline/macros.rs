/// Macro step lists: persistence and replay
///
/// A macro file is a JSON array of `[opcode, [args...]]` pairs. Loading
/// checks that exact shape; opcodes are resolved only at replay time so a
/// file written by a newer build still loads.

use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::Value;
use thiserror::Error;

use crate::data::SaveError;

use super::command::{Opcode, Operation};
use super::workspace::Workspace;

#[derive(Error, Debug)]
pub enum MacroError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed macro file: {0}")]
    Shape(String),
    #[error("bad arguments for {opcode}: {reason}")]
    Arguments { opcode: String, reason: String },
    #[error("unknown macro command: {0}")]
    UnknownOpcode(String),
}

/// One recorded invocation: opcode string plus positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacroStep(pub String, pub Vec<Value>);

impl MacroStep {
    pub fn from_operation(op: &Operation) -> Self {
        MacroStep(op.opcode().name().to_string(), op.args())
    }

    pub fn opcode(&self) -> &str {
        &self.0
    }

    pub fn to_operation(&self) -> Result<Operation, MacroError> {
        let opcode = Opcode::from_name(&self.0).ok_or_else(|| MacroError::UnknownOpcode(self.0.clone()))?;
        Operation::from_step(opcode, &self.1)
    }
}

/// Parse macro file text, validating the `[[opcode, [args]], ...]` shape.
pub fn parse_macro(text: &str) -> Result<Vec<MacroStep>, MacroError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| MacroError::Shape(format!("not valid JSON: {}", e)))?;
    let items = value
        .as_array()
        .ok_or_else(|| MacroError::Shape("top level must be an array".into()))?;
    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item.as_array().map(Vec::as_slice) {
            Some([Value::String(opcode), Value::Array(args)]) => Ok(MacroStep(opcode.clone(), args.clone())),
            _ => Err(MacroError::Shape(format!(
                "step {} must be a [opcode, [arguments]] pair",
                i + 1
            ))),
        })
        .collect()
}

/// Pretty-printed with a four-space indent.
pub fn macro_to_json(steps: &[MacroStep]) -> Result<String, serde_json::Error> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(b"    "));
    steps.serialize(&mut ser)?;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn save_macro(steps: &[MacroStep], path: &Path) -> Result<(), SaveError> {
    fs::write(path, macro_to_json(steps)?)?;
    log::info!("macro saved to {} ({} steps)", path.display(), steps.len());
    Ok(())
}

pub fn load_macro(path: &Path) -> Result<Vec<MacroStep>, MacroError> {
    let text = fs::read_to_string(path)?;
    parse_macro(&text)
}

/// Outcome of a best-effort replay.
#[derive(Debug, Default)]
pub struct ReplayReport {
    /// Steps that changed the dataset
    pub applied: usize,
    /// One message per skipped or failed step
    pub messages: Vec<String>,
}

/// Replay `steps` on a workspace. The redo stack is cleared once up front;
/// each step then goes through the normal apply path. Unknown opcodes and
/// failing steps are reported and skipped.
pub fn replay(
    ws: &mut Workspace,
    steps: &[MacroStep],
    mut recorder: Option<&mut Vec<MacroStep>>,
) -> ReplayReport {
    let mut report = ReplayReport::default();
    ws.clear_redo();
    for step in steps {
        let op = match step.to_operation() {
            Ok(op) => op,
            Err(e) => {
                log::warn!("{}", e);
                report.messages.push(e.to_string());
                continue;
            }
        };
        match ws.apply(op, recorder.as_deref_mut()) {
            Ok(true) => report.applied += 1,
            Ok(false) => {}
            Err(e) => {
                let message = format!("{}: {}", step.opcode(), e);
                log::warn!("{}", message);
                report.messages.push(message);
            }
        }
    }
    report
}
