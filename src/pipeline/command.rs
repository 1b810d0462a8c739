/// Reversible command values
///
/// An `Operation` is one named dataset mutation with typed positional
/// arguments. `Command::apply` runs it and yields an `InverseCommand`;
/// applying that restores the previous state and yields the `Command`
/// again, so undo and redo are plain value exchanges.

use std::fmt;

use ndarray::ArrayD;
use num_complex::Complex64;
use serde_json::{json, Value};

use crate::data::spectrum::{AxisParams, SpectrumData};

use super::macros::MacroError;
use super::processing::{self, Applied, OperationError};

// =========================================================================
//  Opcode table
// =========================================================================

/// Macro-file opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Reload,
    Real,
    Imag,
    Abs,
    Phase,
    Fourier,
    RealFourier,
    FftShift,
    Diff,
    Cumsum,
    Hilbert,
    Apodize,
    Freq,
    Ref,
    Size,
    Spec,
    SwapEcho,
    WholeEcho,
    Shift,
    States,
    StatesTppi,
    EchoAntiEcho,
    Integrate,
    Sum,
    Max,
    Min,
    Argmax,
    Argmin,
    Average,
    FlipLr,
    Delete,
    Multiply,
    SubtractAvg,
    Extract,
    SetXax,
    Concatenate,
    Split,
}

/// How an opcode's inverse is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InverseKind {
    /// Another operation undoes it (fftshift, fliplr)
    Operation,
    /// Only per-axis metadata changes
    AxisMetadata,
    /// Data and axes are copied before applying
    Snapshot,
}

impl Opcode {
    pub const ALL: [Opcode; 37] = [
        Opcode::Reload,
        Opcode::Real,
        Opcode::Imag,
        Opcode::Abs,
        Opcode::Phase,
        Opcode::Fourier,
        Opcode::RealFourier,
        Opcode::FftShift,
        Opcode::Diff,
        Opcode::Cumsum,
        Opcode::Hilbert,
        Opcode::Apodize,
        Opcode::Freq,
        Opcode::Ref,
        Opcode::Size,
        Opcode::Spec,
        Opcode::SwapEcho,
        Opcode::WholeEcho,
        Opcode::Shift,
        Opcode::States,
        Opcode::StatesTppi,
        Opcode::EchoAntiEcho,
        Opcode::Integrate,
        Opcode::Sum,
        Opcode::Max,
        Opcode::Min,
        Opcode::Argmax,
        Opcode::Argmin,
        Opcode::Average,
        Opcode::FlipLr,
        Opcode::Delete,
        Opcode::Multiply,
        Opcode::SubtractAvg,
        Opcode::Extract,
        Opcode::SetXax,
        Opcode::Concatenate,
        Opcode::Split,
    ];

    /// Opcode string as stored in macro files.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Reload => "reload",
            Opcode::Real => "real",
            Opcode::Imag => "imag",
            Opcode::Abs => "abs",
            Opcode::Phase => "phase",
            Opcode::Fourier => "fourier",
            Opcode::RealFourier => "realFourier",
            Opcode::FftShift => "fftshift",
            Opcode::Diff => "diff",
            Opcode::Cumsum => "cumsum",
            Opcode::Hilbert => "hilbert",
            Opcode::Apodize => "apodize",
            Opcode::Freq => "freq",
            Opcode::Ref => "ref",
            Opcode::Size => "size",
            Opcode::Spec => "spec",
            Opcode::SwapEcho => "swapecho",
            Opcode::WholeEcho => "wholeEcho",
            Opcode::Shift => "shift",
            Opcode::States => "states",
            Opcode::StatesTppi => "statesTPPI",
            Opcode::EchoAntiEcho => "echoAntiEcho",
            Opcode::Integrate => "integrate",
            Opcode::Sum => "sum",
            Opcode::Max => "max",
            Opcode::Min => "min",
            Opcode::Argmax => "argmax",
            Opcode::Argmin => "argmin",
            Opcode::Average => "average",
            Opcode::FlipLr => "fliplr",
            Opcode::Delete => "delete",
            Opcode::Multiply => "multiply",
            Opcode::SubtractAvg => "subtractAvg",
            Opcode::Extract => "extract",
            Opcode::SetXax => "setxax",
            Opcode::Concatenate => "concatenate",
            Opcode::Split => "split",
        }
    }

    /// Number of positional arguments.
    pub fn arity(self) -> usize {
        match self {
            Opcode::Reload | Opcode::Real | Opcode::Imag | Opcode::Abs => 0,
            Opcode::Fourier
            | Opcode::RealFourier
            | Opcode::Diff
            | Opcode::Cumsum
            | Opcode::Hilbert
            | Opcode::States
            | Opcode::StatesTppi
            | Opcode::EchoAntiEcho
            | Opcode::FlipLr
            | Opcode::Concatenate => 1,
            Opcode::FftShift
            | Opcode::Ref
            | Opcode::Size
            | Opcode::Spec
            | Opcode::SwapEcho
            | Opcode::WholeEcho
            | Opcode::Shift
            | Opcode::Delete
            | Opcode::Multiply
            | Opcode::SetXax
            | Opcode::Split => 2,
            Opcode::Phase
            | Opcode::Apodize
            | Opcode::Freq
            | Opcode::Integrate
            | Opcode::Sum
            | Opcode::Max
            | Opcode::Min
            | Opcode::Argmax
            | Opcode::Argmin
            | Opcode::Average
            | Opcode::SubtractAvg
            | Opcode::Extract => 3,
        }
    }

    pub fn inverse_kind(self) -> InverseKind {
        match self {
            Opcode::FftShift | Opcode::FlipLr => InverseKind::Operation,
            Opcode::Freq | Opcode::Ref | Opcode::Spec | Opcode::WholeEcho | Opcode::SetXax => {
                InverseKind::AxisMetadata
            }
            _ => InverseKind::Snapshot,
        }
    }

    pub fn from_name(name: &str) -> Option<Opcode> {
        Opcode::ALL.iter().copied().find(|op| op.name() == name)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =========================================================================
//  Operations
// =========================================================================

/// The seven slice reductions sharing `(pos1, pos2, axis)` arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Integrate,
    Sum,
    Max,
    Min,
    Argmax,
    Argmin,
    Average,
}

impl Reduction {
    fn opcode(self) -> Opcode {
        match self {
            Reduction::Integrate => Opcode::Integrate,
            Reduction::Sum => Opcode::Sum,
            Reduction::Max => Opcode::Max,
            Reduction::Min => Opcode::Min,
            Reduction::Argmax => Opcode::Argmax,
            Reduction::Argmin => Opcode::Argmin,
            Reduction::Average => Opcode::Average,
        }
    }
}

/// Multiplication factor: one scalar, or one value per point of the axis.
#[derive(Debug, Clone, PartialEq)]
pub enum Factor {
    Scalar(f64),
    PerPoint(Vec<f64>),
}

/// A dataset mutation with its positional arguments. Axis arguments may be
/// negative, counting from the last dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Reload,
    Real,
    Imag,
    Abs,
    /// Phases in radians
    Phase { phase0: f64, phase1: f64, axis: i64 },
    Fourier { axis: i64 },
    RealFourier { axis: i64 },
    FftShift { axis: i64, inverse: bool },
    Diff { axis: i64 },
    Cumsum { axis: i64 },
    Hilbert { axis: i64 },
    /// Line broadening in Hz
    Apodize { lor: f64, gauss: f64, axis: i64 },
    Freq { freq: f64, sw: f64, axis: i64 },
    Ref { reference: Option<f64>, axis: i64 },
    Size { size: usize, axis: i64 },
    Spec { spec: bool, axis: i64 },
    SwapEcho { index: i64, axis: i64 },
    WholeEcho { whole_echo: bool, axis: i64 },
    Shift { points: i64, axis: i64 },
    States { axis: i64 },
    StatesTppi { axis: i64 },
    EchoAntiEcho { axis: i64 },
    Reduce { kind: Reduction, pos1: i64, pos2: i64, axis: i64 },
    FlipLr { axis: i64 },
    Delete { indices: Vec<i64>, axis: i64 },
    Multiply { factor: Factor, axis: i64 },
    SubtractAvg { pos1: i64, pos2: i64, axis: i64 },
    Extract { pos1: i64, pos2: i64, axis: i64 },
    SetXax { values: Vec<f64>, axis: i64 },
    Concatenate { axis: i64 },
    Split { sections: usize, axis: i64 },
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::Reload => Opcode::Reload,
            Operation::Real => Opcode::Real,
            Operation::Imag => Opcode::Imag,
            Operation::Abs => Opcode::Abs,
            Operation::Phase { .. } => Opcode::Phase,
            Operation::Fourier { .. } => Opcode::Fourier,
            Operation::RealFourier { .. } => Opcode::RealFourier,
            Operation::FftShift { .. } => Opcode::FftShift,
            Operation::Diff { .. } => Opcode::Diff,
            Operation::Cumsum { .. } => Opcode::Cumsum,
            Operation::Hilbert { .. } => Opcode::Hilbert,
            Operation::Apodize { .. } => Opcode::Apodize,
            Operation::Freq { .. } => Opcode::Freq,
            Operation::Ref { .. } => Opcode::Ref,
            Operation::Size { .. } => Opcode::Size,
            Operation::Spec { .. } => Opcode::Spec,
            Operation::SwapEcho { .. } => Opcode::SwapEcho,
            Operation::WholeEcho { .. } => Opcode::WholeEcho,
            Operation::Shift { .. } => Opcode::Shift,
            Operation::States { .. } => Opcode::States,
            Operation::StatesTppi { .. } => Opcode::StatesTppi,
            Operation::EchoAntiEcho { .. } => Opcode::EchoAntiEcho,
            Operation::Reduce { kind, .. } => kind.opcode(),
            Operation::FlipLr { .. } => Opcode::FlipLr,
            Operation::Delete { .. } => Opcode::Delete,
            Operation::Multiply { .. } => Opcode::Multiply,
            Operation::SubtractAvg { .. } => Opcode::SubtractAvg,
            Operation::Extract { .. } => Opcode::Extract,
            Operation::SetXax { .. } => Opcode::SetXax,
            Operation::Concatenate { .. } => Opcode::Concatenate,
            Operation::Split { .. } => Opcode::Split,
        }
    }

    /// Positional arguments in macro-file form.
    pub fn args(&self) -> Vec<Value> {
        match self {
            Operation::Reload | Operation::Real | Operation::Imag | Operation::Abs => vec![],
            Operation::Phase { phase0, phase1, axis } => vec![json!(phase0), json!(phase1), json!(axis)],
            Operation::Fourier { axis }
            | Operation::RealFourier { axis }
            | Operation::Diff { axis }
            | Operation::Cumsum { axis }
            | Operation::Hilbert { axis }
            | Operation::States { axis }
            | Operation::StatesTppi { axis }
            | Operation::EchoAntiEcho { axis }
            | Operation::FlipLr { axis }
            | Operation::Concatenate { axis } => vec![json!(axis)],
            Operation::FftShift { axis, inverse } => vec![json!(axis), json!(inverse)],
            Operation::Apodize { lor, gauss, axis } => vec![json!(lor), json!(gauss), json!(axis)],
            Operation::Freq { freq, sw, axis } => vec![json!(freq), json!(sw), json!(axis)],
            Operation::Ref { reference, axis } => vec![json!(reference), json!(axis)],
            Operation::Size { size, axis } => vec![json!(size), json!(axis)],
            Operation::Spec { spec, axis } => vec![json!(spec), json!(axis)],
            Operation::SwapEcho { index, axis } => vec![json!(index), json!(axis)],
            Operation::WholeEcho { whole_echo, axis } => vec![json!(whole_echo), json!(axis)],
            Operation::Shift { points, axis } => vec![json!(points), json!(axis)],
            Operation::Reduce { pos1, pos2, axis, .. }
            | Operation::SubtractAvg { pos1, pos2, axis }
            | Operation::Extract { pos1, pos2, axis } => vec![json!(pos1), json!(pos2), json!(axis)],
            Operation::Delete { indices, axis } => vec![json!(indices), json!(axis)],
            Operation::Multiply { factor, axis } => {
                let factor = match factor {
                    Factor::Scalar(f) => json!(f),
                    Factor::PerPoint(v) => json!(v),
                };
                vec![factor, json!(axis)]
            }
            Operation::SetXax { values, axis } => vec![json!(values), json!(axis)],
            Operation::Split { sections, axis } => vec![json!(sections), json!(axis)],
        }
    }

    /// Build an operation from a macro step, checking arity and types.
    pub fn from_step(opcode: Opcode, args: &[Value]) -> Result<Operation, MacroError> {
        let a = Args { opcode, args };
        if args.len() != opcode.arity() {
            return Err(a.error(format!(
                "expected {} arguments, got {}",
                opcode.arity(),
                args.len()
            )));
        }
        let reduce = |kind| -> Result<Operation, MacroError> {
            Ok(Operation::Reduce {
                kind,
                pos1: a.int(0)?,
                pos2: a.int(1)?,
                axis: a.int(2)?,
            })
        };
        Ok(match opcode {
            Opcode::Reload => Operation::Reload,
            Opcode::Real => Operation::Real,
            Opcode::Imag => Operation::Imag,
            Opcode::Abs => Operation::Abs,
            Opcode::Phase => Operation::Phase {
                phase0: a.number(0)?,
                phase1: a.number(1)?,
                axis: a.int(2)?,
            },
            Opcode::Fourier => Operation::Fourier { axis: a.int(0)? },
            Opcode::RealFourier => Operation::RealFourier { axis: a.int(0)? },
            Opcode::FftShift => Operation::FftShift {
                axis: a.int(0)?,
                inverse: a.flag(1)?,
            },
            Opcode::Diff => Operation::Diff { axis: a.int(0)? },
            Opcode::Cumsum => Operation::Cumsum { axis: a.int(0)? },
            Opcode::Hilbert => Operation::Hilbert { axis: a.int(0)? },
            Opcode::Apodize => Operation::Apodize {
                lor: a.number(0)?,
                gauss: a.number(1)?,
                axis: a.int(2)?,
            },
            Opcode::Freq => Operation::Freq {
                freq: a.number(0)?,
                sw: a.number(1)?,
                axis: a.int(2)?,
            },
            Opcode::Ref => Operation::Ref {
                reference: a.optional_number(0)?,
                axis: a.int(1)?,
            },
            Opcode::Size => Operation::Size {
                size: a.count(0)?,
                axis: a.int(1)?,
            },
            Opcode::Spec => Operation::Spec {
                spec: a.flag(0)?,
                axis: a.int(1)?,
            },
            Opcode::SwapEcho => Operation::SwapEcho {
                index: a.int(0)?,
                axis: a.int(1)?,
            },
            Opcode::WholeEcho => Operation::WholeEcho {
                whole_echo: a.flag(0)?,
                axis: a.int(1)?,
            },
            Opcode::Shift => Operation::Shift {
                points: a.int(0)?,
                axis: a.int(1)?,
            },
            Opcode::States => Operation::States { axis: a.int(0)? },
            Opcode::StatesTppi => Operation::StatesTppi { axis: a.int(0)? },
            Opcode::EchoAntiEcho => Operation::EchoAntiEcho { axis: a.int(0)? },
            Opcode::Integrate => reduce(Reduction::Integrate)?,
            Opcode::Sum => reduce(Reduction::Sum)?,
            Opcode::Max => reduce(Reduction::Max)?,
            Opcode::Min => reduce(Reduction::Min)?,
            Opcode::Argmax => reduce(Reduction::Argmax)?,
            Opcode::Argmin => reduce(Reduction::Argmin)?,
            Opcode::Average => reduce(Reduction::Average)?,
            Opcode::FlipLr => Operation::FlipLr { axis: a.int(0)? },
            Opcode::Delete => Operation::Delete {
                indices: a.ints(0)?,
                axis: a.int(1)?,
            },
            Opcode::Multiply => Operation::Multiply {
                factor: match &args[0] {
                    Value::Array(_) => Factor::PerPoint(a.numbers(0)?),
                    _ => Factor::Scalar(a.number(0)?),
                },
                axis: a.int(1)?,
            },
            Opcode::SubtractAvg => Operation::SubtractAvg {
                pos1: a.int(0)?,
                pos2: a.int(1)?,
                axis: a.int(2)?,
            },
            Opcode::Extract => Operation::Extract {
                pos1: a.int(0)?,
                pos2: a.int(1)?,
                axis: a.int(2)?,
            },
            Opcode::SetXax => Operation::SetXax {
                values: a.numbers(0)?,
                axis: a.int(1)?,
            },
            Opcode::Concatenate => Operation::Concatenate { axis: a.int(0)? },
            Opcode::Split => Operation::Split {
                sections: a.count(0)?,
                axis: a.int(1)?,
            },
        })
    }

    /// The operation that undoes this one, for self-inverting opcodes.
    fn counterpart(&self) -> Option<Operation> {
        match self {
            Operation::FftShift { axis, inverse } => Some(Operation::FftShift {
                axis: *axis,
                inverse: !inverse,
            }),
            Operation::FlipLr { axis } => Some(Operation::FlipLr { axis: *axis }),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.opcode(), Value::Array(self.args()))
    }
}

/// Typed access to a step's argument list.
struct Args<'a> {
    opcode: Opcode,
    args: &'a [Value],
}

impl Args<'_> {
    fn error(&self, reason: String) -> MacroError {
        MacroError::Arguments {
            opcode: self.opcode.name().to_string(),
            reason,
        }
    }

    fn number(&self, i: usize) -> Result<f64, MacroError> {
        self.args[i]
            .as_f64()
            .ok_or_else(|| self.error(format!("argument {} must be a number", i + 1)))
    }

    fn optional_number(&self, i: usize) -> Result<Option<f64>, MacroError> {
        if self.args[i].is_null() {
            Ok(None)
        } else {
            self.number(i).map(Some)
        }
    }

    fn int(&self, i: usize) -> Result<i64, MacroError> {
        as_int(&self.args[i]).ok_or_else(|| self.error(format!("argument {} must be an integer", i + 1)))
    }

    fn count(&self, i: usize) -> Result<usize, MacroError> {
        self.int(i).and_then(|v| {
            usize::try_from(v).map_err(|_| self.error(format!("argument {} must not be negative", i + 1)))
        })
    }

    fn flag(&self, i: usize) -> Result<bool, MacroError> {
        match &self.args[i] {
            Value::Bool(b) => Ok(*b),
            Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0) != 0.0),
            _ => Err(self.error(format!("argument {} must be a boolean", i + 1))),
        }
    }

    fn numbers(&self, i: usize) -> Result<Vec<f64>, MacroError> {
        let items = self.args[i]
            .as_array()
            .ok_or_else(|| self.error(format!("argument {} must be a list of numbers", i + 1)))?;
        items
            .iter()
            .map(|v| v.as_f64().ok_or_else(|| self.error(format!("argument {} must be a list of numbers", i + 1))))
            .collect()
    }

    /// A list of integers; a bare integer counts as a one-element list.
    fn ints(&self, i: usize) -> Result<Vec<i64>, MacroError> {
        let bad = || self.error(format!("argument {} must be a list of integers", i + 1));
        match &self.args[i] {
            Value::Array(items) => items.iter().map(|v| as_int(v).ok_or_else(bad)).collect(),
            other => as_int(other).map(|v| vec![v]).ok_or_else(bad),
        }
    }
}

fn as_int(v: &Value) -> Option<i64> {
    v.as_i64().or_else(|| {
        v.as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
            .map(|f| f as i64)
    })
}

// =========================================================================
//  Command / InverseCommand
// =========================================================================

/// State captured to undo a snapshot-class operation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    data: ArrayD<Complex64>,
    axes: Vec<AxisParams>,
}

#[derive(Debug, Clone)]
enum Undo {
    Apply(Operation),
    Restore(Box<Snapshot>),
    RestoreAxes(Vec<AxisParams>),
}

impl Undo {
    fn capture(op: &Operation, ds: &SpectrumData) -> Undo {
        match (op.opcode().inverse_kind(), op.counterpart()) {
            (InverseKind::Operation, Some(inverse)) => Undo::Apply(inverse),
            (InverseKind::AxisMetadata, _) => Undo::RestoreAxes(ds.axes.clone()),
            _ => Undo::Restore(Box::new(Snapshot {
                data: ds.data.clone(),
                axes: ds.axes.clone(),
            })),
        }
    }

    /// Put captured state back; `Apply` has nothing captured.
    fn restore(&self, ds: &mut SpectrumData) {
        match self {
            Undo::Apply(_) => {}
            Undo::Restore(snapshot) => {
                ds.data = snapshot.data.clone();
                ds.axes = snapshot.axes.clone();
            }
            Undo::RestoreAxes(axes) => ds.axes = axes.clone(),
        }
    }
}

/// "Apply this operation": the redo half of the pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub op: Operation,
}

impl Command {
    pub fn new(op: Operation) -> Self {
        Self { op }
    }

    /// Mutate the dataset and return the inverse. `None` means the
    /// operation changed nothing and there is nothing to undo. On error the
    /// dataset is left as it was.
    pub fn apply(&self, ds: &mut SpectrumData) -> Result<Option<InverseCommand>, OperationError> {
        let undo = Undo::capture(&self.op, ds);
        let history_len = ds.history.len();
        match processing::execute(ds, &self.op) {
            Ok(Applied::Changed) => {
                log::debug!("applied {}", self.op);
                Ok(Some(InverseCommand {
                    undo,
                    redo: self.op.clone(),
                }))
            }
            Ok(Applied::Unchanged) => Ok(None),
            Err(e) => {
                undo.restore(ds);
                ds.history.truncate(history_len);
                Err(e)
            }
        }
    }
}

/// Restores the pre-operation state and hands back the redo `Command`.
#[derive(Debug, Clone)]
pub struct InverseCommand {
    undo: Undo,
    redo: Operation,
}

impl InverseCommand {
    /// The operation this inverse undoes.
    pub fn operation(&self) -> &Operation {
        &self.redo
    }

    pub fn apply(&self, ds: &mut SpectrumData) -> Result<Command, OperationError> {
        if let Undo::Apply(op) = &self.undo {
            processing::execute(ds, op)?;
            ds.remove_history();
        } else {
            self.undo.restore(ds);
        }
        // the forward operation's history line
        ds.remove_history();
        Ok(Command {
            op: self.redo.clone(),
        })
    }
}
