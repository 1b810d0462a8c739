/// One open dataset with its undo/redo stacks
///
/// Recording is a flag on the workspace naming the macro being recorded.
/// The step list itself lives in the session's macro registry and is passed
/// in as `recorder` by the caller.

use crate::data::spectrum::SpectrumData;

use super::command::{Command, InverseCommand, Operation};
use super::macros::MacroStep;
use super::processing::OperationError;

#[derive(Debug, Clone)]
pub struct Workspace {
    spectrum: SpectrumData,
    undo_stack: Vec<InverseCommand>,
    redo_stack: Vec<Command>,
    recording: Option<String>,
    /// Steps taken off the recording macro by undo, restored by redo
    macro_redo: Vec<MacroStep>,
}

impl Workspace {
    pub fn new(spectrum: SpectrumData) -> Self {
        Self {
            spectrum,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            recording: None,
            macro_redo: Vec::new(),
        }
    }

    /// Copy of the dataset with fresh stacks and no recording.
    pub fn duplicate(&self) -> Self {
        Self::new(self.spectrum.clone())
    }

    pub fn spectrum(&self) -> &SpectrumData {
        &self.spectrum
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Operation the next undo would revert.
    pub fn peek_undo(&self) -> Option<&Operation> {
        self.undo_stack.last().map(InverseCommand::operation)
    }

    pub fn peek_redo(&self) -> Option<&Operation> {
        self.redo_stack.last().map(|command| &command.op)
    }

    /// Apply a forward operation. Returns `false` when the operation changed
    /// nothing; no-ops are neither pushed nor recorded.
    pub fn apply(
        &mut self,
        op: Operation,
        recorder: Option<&mut Vec<MacroStep>>,
    ) -> Result<bool, OperationError> {
        let command = Command::new(op);
        let inverse = match command.apply(&mut self.spectrum)? {
            Some(inverse) => inverse,
            None => return Ok(false),
        };
        self.undo_stack.push(inverse);
        self.redo_stack.clear();
        if let Some(steps) = recorder {
            steps.push(MacroStep::from_operation(&command.op));
            self.macro_redo.clear();
        }
        Ok(true)
    }

    pub fn clear_redo(&mut self) {
        self.redo_stack.clear();
    }

    /// Undo the latest operation. `Ok(false)` means there was nothing to
    /// undo. A failing inverse stays on the stack.
    pub fn undo(&mut self, recorder: Option<&mut Vec<MacroStep>>) -> Result<bool, OperationError> {
        let inverse = match self.undo_stack.pop() {
            Some(inverse) => inverse,
            None => return Ok(false),
        };
        match inverse.apply(&mut self.spectrum) {
            Ok(redo) => {
                self.redo_stack.push(redo);
                if let Some(step) = recorder.and_then(|steps| steps.pop()) {
                    self.macro_redo.push(step);
                }
                Ok(true)
            }
            Err(e) => {
                self.undo_stack.push(inverse);
                Err(e)
            }
        }
    }

    pub fn redo(&mut self, recorder: Option<&mut Vec<MacroStep>>) -> Result<bool, OperationError> {
        let command = match self.redo_stack.pop() {
            Some(command) => command,
            None => return Ok(false),
        };
        match command.apply(&mut self.spectrum) {
            Ok(inverse) => {
                if let Some(inverse) = inverse {
                    self.undo_stack.push(inverse);
                }
                if let Some(steps) = recorder {
                    let step = self
                        .macro_redo
                        .pop()
                        .unwrap_or_else(|| MacroStep::from_operation(&command.op));
                    steps.push(step);
                }
                Ok(true)
            }
            Err(e) => {
                self.redo_stack.push(command);
                Err(e)
            }
        }
    }

    /// Start recording into `name`; refused while another recording runs.
    pub fn start_recording(&mut self, name: &str) -> bool {
        if self.recording.is_some() {
            return false;
        }
        self.recording = Some(name.to_string());
        self.macro_redo.clear();
        true
    }

    /// Stop recording, returning the macro name that was active.
    pub fn stop_recording(&mut self) -> Option<String> {
        self.macro_redo.clear();
        self.recording.take()
    }

    pub fn recording(&self) -> Option<&str> {
        self.recording.as_deref()
    }

    pub(crate) fn rename_recording(&mut self, old: &str, new: &str) {
        if self.recording.as_deref() == Some(old) {
            self.recording = Some(new.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::spectrum::AxisParams;
    use num_complex::Complex64;

    fn sample() -> SpectrumData {
        let values = (0..8).map(|k| Complex64::new((k as f64).cos(), (k as f64).sin())).collect();
        let mut s = SpectrumData::from_vec(values, AxisParams::new(100e6, 1000.0, false)).unwrap();
        s.set_history(vec!["loaded".into()]);
        s
    }

    fn ops() -> Vec<Operation> {
        vec![
            Operation::Fourier { axis: 0 },
            Operation::FftShift { axis: 0, inverse: false },
            Operation::Freq { freq: 200e6, sw: 500.0, axis: 0 },
            Operation::Size { size: 4, axis: 0 },
            Operation::Abs,
        ]
    }

    #[test]
    fn test_stack_discipline() {
        let initial = sample();
        let mut ws = Workspace::new(initial.clone());
        for op in ops() {
            assert!(ws.apply(op, None).unwrap());
        }
        let n = ops().len();
        assert_eq!(ws.undo_depth(), n);
        for _ in 0..n {
            assert!(ws.undo(None).unwrap());
        }
        assert_eq!(ws.spectrum(), &initial);
        assert_eq!(ws.redo_depth(), n);
        assert!(!ws.undo(None).unwrap());

        assert_eq!(ws.peek_redo(), ops().first());
        ws.redo(None).unwrap();
        assert_eq!(ws.redo_depth(), n - 1);
        assert_eq!(ws.peek_undo(), ops().first());
        ws.apply(Operation::Real, None).unwrap();
        assert_eq!(ws.redo_depth(), 0);
        assert!(!ws.redo(None).unwrap());
    }

    #[test]
    fn test_redo_restores_final_state() {
        let mut ws = Workspace::new(sample());
        for op in ops() {
            ws.apply(op, None).unwrap();
        }
        let done = ws.spectrum().clone();
        while ws.undo(None).unwrap() {}
        while ws.redo(None).unwrap() {}
        assert_eq!(ws.spectrum(), &done);
        assert_eq!(ws.undo_depth(), ops().len());
    }

    #[test]
    fn test_no_op_is_not_pushed() {
        let mut ws = Workspace::new(sample());
        let mut steps = Vec::new();
        assert!(!ws.apply(Operation::Spec { spec: false, axis: 0 }, Some(&mut steps)).unwrap());
        assert_eq!(ws.undo_depth(), 0);
        assert!(steps.is_empty());
    }

    #[test]
    fn test_failed_apply_keeps_stacks() {
        let mut ws = Workspace::new(sample());
        ws.apply(Operation::Real, None).unwrap();
        ws.undo(None).unwrap();
        assert!(ws.apply(Operation::Diff { axis: 3 }, None).is_err());
        assert_eq!(ws.redo_depth(), 1);
        assert_eq!(ws.undo_depth(), 0);
    }

    #[test]
    fn test_recording_follows_undo_and_redo() {
        let mut ws = Workspace::new(sample());
        assert!(ws.start_recording("macro0"));
        assert!(!ws.start_recording("macro1"));
        let mut steps = Vec::new();
        ws.apply(Operation::Fourier { axis: 0 }, Some(&mut steps)).unwrap();
        ws.apply(Operation::Abs, Some(&mut steps)).unwrap();
        assert_eq!(steps.len(), 2);

        ws.undo(Some(&mut steps)).unwrap();
        assert_eq!(steps, vec![MacroStep::from_operation(&Operation::Fourier { axis: 0 })]);
        ws.redo(Some(&mut steps)).unwrap();
        assert_eq!(steps.last().map(|s| s.opcode()), Some("abs"));

        // a new action drops the buffered step
        ws.undo(Some(&mut steps)).unwrap();
        ws.apply(Operation::Real, Some(&mut steps)).unwrap();
        ws.redo(Some(&mut steps)).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(ws.stop_recording().as_deref(), Some("macro0"));
        assert_eq!(ws.recording(), None);
    }

    #[test]
    fn test_duplicate_has_fresh_stacks() {
        let mut ws = Workspace::new(sample());
        ws.apply(Operation::Real, None).unwrap();
        ws.start_recording("m");
        let copy = ws.duplicate();
        assert_eq!(copy.spectrum(), ws.spectrum());
        assert_eq!(copy.undo_depth(), 0);
        assert_eq!(copy.recording(), None);
    }
}
