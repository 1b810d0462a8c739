/// Session: the single control actor
///
/// Owns every open workspace plus the macro and reference registries, and
/// talks to the outside world only through a `Frontend`. Every failure is
/// turned into a `report` message; nothing here aborts the process.

use std::f64::consts::PI;
use std::path::Path;

use crate::data::{bruker, reference, LoadError};
use crate::data::spectrum::SpectrumData;
use crate::log::journal::{ActionKind, SessionJournal};
use crate::pipeline::command::Operation;
use crate::pipeline::conversion;
use crate::pipeline::macros::{self, MacroStep, ReplayReport};
use crate::pipeline::processing::resolve_axis;
use crate::pipeline::registry::Registry;
use crate::pipeline::workspace::Workspace;

// ────────────────────────────────────────────────────────────────────────────
//  Frontend collaborator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Workspace,
    Macro,
    Reference,
}

/// A request for a unique name. `collision` carries the previous answer
/// when it was rejected.
#[derive(Debug, Clone)]
pub struct NameRequest {
    pub kind: NameKind,
    pub suggestion: String,
    pub collision: Option<String>,
}

pub trait Frontend {
    /// Non-fatal diagnostic.
    fn report(&mut self, message: &str);

    /// `None` cancels the action that asked.
    fn ask_unique_name(&mut self, request: &NameRequest) -> Option<String>;

    /// Called after every successful mutation, undo or redo.
    fn on_dataset_changed(&mut self, _workspace: &str) {}
}

/// Non-interactive frontend: reports go to the log, suggested names are
/// accepted as-is.
#[derive(Debug, Default)]
pub struct ConsoleFrontend;

impl Frontend for ConsoleFrontend {
    fn report(&mut self, message: &str) {
        log::warn!("{}", message);
    }

    fn ask_unique_name(&mut self, request: &NameRequest) -> Option<String> {
        Some(request.suggestion.clone())
    }
}

/// Prompt until the answer is non-empty and unused, or cancelled.
fn ask_name<T>(frontend: &mut dyn Frontend, registry: &Registry<T>, kind: NameKind) -> Option<String> {
    let mut request = NameRequest {
        kind,
        suggestion: registry.suggest_name(),
        collision: None,
    };
    loop {
        let answer = frontend.ask_unique_name(&request)?;
        match registry.check_name(&answer) {
            Ok(()) => return Some(answer),
            Err(e) => {
                frontend.report(&e.to_string());
                request.collision = Some(answer);
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
//  Session
// ────────────────────────────────────────────────────────────────────────────

pub struct Session {
    workspaces: Registry<Workspace>,
    current: Option<usize>,
    macros: Registry<Vec<MacroStep>>,
    references: Registry<f64>,
    journal: SessionJournal,
    frontend: Box<dyn Frontend>,
}

impl Session {
    pub fn new(frontend: Box<dyn Frontend>) -> Self {
        Self {
            workspaces: Registry::new("spectrum"),
            current: None,
            macros: Registry::new("macro"),
            references: Registry::new("ref"),
            journal: SessionJournal::new(),
            frontend,
        }
    }

    pub fn journal(&self) -> &SessionJournal {
        &self.journal
    }

    pub fn workspace_names(&self) -> Vec<&str> {
        self.workspaces.names()
    }

    pub fn workspace(&self, name: &str) -> Option<&Workspace> {
        self.workspaces.get(name)
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current
            .and_then(|i| self.workspaces.get_index(i))
            .map(|(name, _)| name)
    }

    pub fn current(&self) -> Option<&Workspace> {
        self.current
            .and_then(|i| self.workspaces.get_index(i))
            .map(|(_, ws)| ws)
    }

    fn report(&mut self, message: &str) {
        self.frontend.report(message);
    }

    /// Run `f` on the current workspace with the step list of the macro it
    /// is recording, if any.
    fn with_current<R>(
        &mut self,
        f: impl FnOnce(&mut Workspace, Option<&mut Vec<MacroStep>>) -> R,
    ) -> Option<(String, R)> {
        let index = match self.current {
            Some(index) => index,
            None => {
                self.frontend.report("no workspace open");
                return None;
            }
        };
        let (name, ws) = self.workspaces.get_index_mut(index)?;
        let name = name.to_string();
        let recording = ws.recording().map(str::to_string);
        let recorder = recording.as_deref().and_then(|m| self.macros.get_mut(m));
        Some((name, f(ws, recorder)))
    }

    // ── workspaces ─────────────────────────────────────────────────────────

    /// Detect, load and open `path` in a new workspace.
    pub fn load(&mut self, path: &Path) -> Option<String> {
        let loaded = match conversion::load_spectrum(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                if e.is_fatal() {
                    log::error!("{}: {}", path.display(), e);
                }
                self.report(&format!("Failed loading {}: {}", path.display(), e));
                return None;
            }
        };
        for warning in &loaded.warnings {
            self.report(warning);
        }
        self.open(loaded.spectrum)
    }

    /// Open a dataset in a new workspace under a user-confirmed name and
    /// make it current.
    pub fn open(&mut self, spectrum: SpectrumData) -> Option<String> {
        let name = ask_name(self.frontend.as_mut(), &self.workspaces, NameKind::Workspace)?;
        let description = spectrum
            .history()
            .last()
            .cloned()
            .unwrap_or_else(|| "dataset opened".to_string());
        self.workspaces.add(name.clone(), Workspace::new(spectrum)).ok()?;
        self.current = Some(self.workspaces.len() - 1);
        self.journal.record(&name, ActionKind::Load, description);
        self.frontend.on_dataset_changed(&name);
        Some(name)
    }

    /// Copy the current dataset into a new workspace with fresh stacks.
    pub fn duplicate(&mut self) -> Option<String> {
        let (source, copy) = match self.current.and_then(|i| self.workspaces.get_index(i)) {
            Some((name, ws)) => (name.to_string(), ws.duplicate()),
            None => {
                self.report("no workspace open");
                return None;
            }
        };
        let name = ask_name(self.frontend.as_mut(), &self.workspaces, NameKind::Workspace)?;
        self.workspaces.add(name.clone(), copy).ok()?;
        self.current = Some(self.workspaces.len() - 1);
        self.journal
            .record(&name, ActionKind::Workspace, format!("duplicated from {}", source));
        self.frontend.on_dataset_changed(&name);
        Some(name)
    }

    pub fn rename_workspace(&mut self, old: &str, new: &str) -> bool {
        match self.workspaces.rename(old, new) {
            Ok(()) => {
                self.journal
                    .record(new, ActionKind::Workspace, format!("renamed from {}", old));
                true
            }
            Err(e) => {
                self.report(&e.to_string());
                false
            }
        }
    }

    /// Close a workspace. Its recording, if any, ends with it.
    pub fn destroy(&mut self, name: &str) -> bool {
        let index = match self.workspaces.position(name) {
            Some(index) => index,
            None => {
                self.report(&format!("no workspace named '{}'", name));
                return false;
            }
        };
        if let Ok(mut ws) = self.workspaces.remove(name) {
            ws.stop_recording();
        }
        self.current = match self.current {
            _ if self.workspaces.is_empty() => None,
            Some(cur) if cur > index => Some(cur - 1),
            Some(cur) if cur == index => Some(index.min(self.workspaces.len() - 1)),
            other => other,
        };
        self.journal.record(name, ActionKind::Workspace, "closed");
        true
    }

    pub fn select(&mut self, name: &str) -> bool {
        match self.workspaces.position(name) {
            Some(index) => {
                self.current = Some(index);
                true
            }
            None => {
                self.report(&format!("no workspace named '{}'", name));
                false
            }
        }
    }

    // ── editing ────────────────────────────────────────────────────────────

    /// Apply one operation to the current workspace.
    pub fn apply(&mut self, op: Operation) -> bool {
        let description = op.to_string();
        let (name, result) = match self.with_current(|ws, recorder| ws.apply(op, recorder)) {
            Some(outcome) => outcome,
            None => return false,
        };
        match result {
            Ok(true) => {
                self.journal.record(&name, ActionKind::Apply, description);
                self.frontend.on_dataset_changed(&name);
                true
            }
            Ok(false) => {
                log::debug!("{} left {} unchanged", description, name);
                false
            }
            Err(e) => {
                self.report(&format!("{}: {}", description, e));
                false
            }
        }
    }

    /// Remove the Bruker digital filter delay with a first-order phase of
    /// `delay * 2π`, the delay coming from the `acqus` file next to `acqus`
    /// (or inside it when it is the experiment directory).
    pub fn correct_digital_filter(&mut self, acqus: &Path, axis: i64) -> bool {
        match bruker::read_filter_delay(acqus) {
            Ok(delay) => {
                log::info!("digital filter group delay {} points", delay);
                self.apply(Operation::Phase {
                    phase0: 0.0,
                    phase1: delay * 2.0 * PI,
                    axis,
                })
            }
            Err(LoadError::Unsupported(message)) => {
                self.report(&message);
                false
            }
            Err(e) => {
                self.report(&e.to_string());
                false
            }
        }
    }

    pub fn undo(&mut self) -> bool {
        let outcome = self.with_current(|ws, recorder| {
            let description = ws.peek_undo().map(Operation::to_string);
            (description, ws.undo(recorder))
        });
        match outcome {
            None => false,
            Some((name, (description, Ok(true)))) => {
                self.journal
                    .record(&name, ActionKind::Undo, description.unwrap_or_default());
                self.frontend.on_dataset_changed(&name);
                true
            }
            Some((_, (_, Ok(false)))) => {
                self.report("no undo information");
                false
            }
            Some((_, (_, Err(e)))) => {
                self.report(&format!("undo failed: {}", e));
                false
            }
        }
    }

    pub fn redo(&mut self) -> bool {
        let outcome = self.with_current(|ws, recorder| {
            let description = ws.peek_redo().map(Operation::to_string);
            (description, ws.redo(recorder))
        });
        match outcome {
            None => false,
            Some((name, (description, Ok(true)))) => {
                self.journal
                    .record(&name, ActionKind::Redo, description.unwrap_or_default());
                self.frontend.on_dataset_changed(&name);
                true
            }
            Some((_, (_, Ok(false)))) => {
                self.report("no redo information");
                false
            }
            Some((_, (_, Err(e)))) => {
                self.report(&format!("redo failed: {}", e));
                false
            }
        }
    }

    /// Save the current dataset; the writer follows the extension.
    pub fn save_current(&mut self, path: &Path, binary: bool) -> bool {
        let (name, result) = match self.current.and_then(|i| self.workspaces.get_index(i)) {
            Some((name, ws)) => (
                name.to_string(),
                conversion::save_spectrum(ws.spectrum(), name, path, binary),
            ),
            None => {
                self.report("no workspace open");
                return false;
            }
        };
        match result {
            Ok(format) => {
                self.journal.record(
                    &name,
                    ActionKind::Save,
                    format!("saved as {:?} to {}", format, path.display()),
                );
                true
            }
            Err(e) => {
                self.report(&format!("Failed saving {}: {}", path.display(), e));
                false
            }
        }
    }

    // ── macros ─────────────────────────────────────────────────────────────

    pub fn macro_names(&self) -> Vec<&str> {
        self.macros.names()
    }

    pub fn macro_steps(&self, name: &str) -> Option<&[MacroStep]> {
        self.macros.get(name).map(Vec::as_slice)
    }

    /// Start recording a new macro on the current workspace.
    pub fn start_recording(&mut self) -> Option<String> {
        let active = match self.current() {
            Some(ws) => ws.recording().map(str::to_string),
            None => {
                self.report("no workspace open");
                return None;
            }
        };
        if let Some(active) = active {
            self.report(&format!("already recording macro '{}'", active));
            return None;
        }
        let name = ask_name(self.frontend.as_mut(), &self.macros, NameKind::Macro)?;
        self.macros.add(name.clone(), Vec::new()).ok()?;
        let (workspace, _) = self.with_current(|ws, _| ws.start_recording(&name))?;
        self.journal
            .record(&workspace, ActionKind::Macro, format!("started recording {}", name));
        Some(name)
    }

    pub fn stop_recording(&mut self) -> Option<String> {
        let (workspace, stopped) = self.with_current(|ws, _| ws.stop_recording())?;
        match stopped {
            Some(name) => {
                let steps = self.macros.get(&name).map_or(0, Vec::len);
                self.journal.record(
                    &workspace,
                    ActionKind::Macro,
                    format!("stopped recording {} ({} steps)", name, steps),
                );
                Some(name)
            }
            None => {
                self.report("no macro is being recorded");
                None
            }
        }
    }

    /// Replay a stored macro on the current workspace.
    pub fn run_macro(&mut self, name: &str) -> Option<ReplayReport> {
        let steps = match self.macros.get(name) {
            Some(steps) => steps.clone(),
            None => {
                self.report(&format!("no macro named '{}'", name));
                return None;
            }
        };
        let (workspace, report) = self.with_current(|ws, recorder| macros::replay(ws, &steps, recorder))?;
        for message in &report.messages {
            self.frontend.report(message);
        }
        self.journal.record(
            &workspace,
            ActionKind::Replay,
            format!("{}: {} of {} steps applied", name, report.applied, steps.len()),
        );
        if report.applied > 0 {
            self.frontend.on_dataset_changed(&workspace);
        }
        Some(report)
    }

    pub fn rename_macro(&mut self, old: &str, new: &str) -> bool {
        if let Err(e) = self.macros.rename(old, new) {
            self.report(&e.to_string());
            return false;
        }
        for (_, ws) in self.workspaces.iter_mut() {
            ws.rename_recording(old, new);
        }
        true
    }

    /// Delete a macro, stopping any recording into it.
    pub fn delete_macro(&mut self, name: &str) -> bool {
        if let Err(e) = self.macros.remove(name) {
            self.report(&e.to_string());
            return false;
        }
        for (_, ws) in self.workspaces.iter_mut() {
            if ws.recording() == Some(name) {
                ws.stop_recording();
            }
        }
        self.journal.record("", ActionKind::Macro, format!("deleted {}", name));
        true
    }

    pub fn save_macro(&mut self, name: &str, path: &Path) -> bool {
        let result = match self.macros.get(name) {
            Some(steps) => macros::save_macro(steps, path),
            None => {
                self.report(&format!("no macro named '{}'", name));
                return false;
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.report(&format!("Failed saving macro {}: {}", name, e));
                false
            }
        }
    }

    /// Load a macro file under a new name. Recording on the current
    /// workspace stops first.
    pub fn load_macro(&mut self, path: &Path) -> Option<String> {
        if self.current().map_or(false, |ws| ws.recording().is_some()) {
            self.stop_recording();
        }
        let steps = match macros::load_macro(path) {
            Ok(steps) => steps,
            Err(e) => {
                self.report(&format!("Failed loading macro {}: {}", path.display(), e));
                return None;
            }
        };
        let name = ask_name(self.frontend.as_mut(), &self.macros, NameKind::Macro)?;
        self.macros.add(name.clone(), steps).ok()?;
        self.journal
            .record("", ActionKind::Macro, format!("loaded {} from {}", name, path.display()));
        Some(name)
    }

    // ── references ─────────────────────────────────────────────────────────

    pub fn reference_names(&self) -> Vec<&str> {
        self.references.names()
    }

    pub fn reference(&self, name: &str) -> Option<f64> {
        self.references.get(name).copied()
    }

    /// Store the current axis reference (or its spectrometer frequency
    /// when unset) under a new name.
    pub fn add_reference(&mut self, axis: i64) -> Option<String> {
        let value = match self.current() {
            Some(ws) => {
                let spectrum = ws.spectrum();
                match resolve_axis(axis, spectrum.ndim()) {
                    Ok(i) => spectrum.axes()[i].reference.unwrap_or(spectrum.axes()[i].freq),
                    Err(e) => {
                        self.report(&e.to_string());
                        return None;
                    }
                }
            }
            None => {
                self.report("no workspace open");
                return None;
            }
        };
        self.store_reference(value)
    }

    fn store_reference(&mut self, value: f64) -> Option<String> {
        let name = ask_name(self.frontend.as_mut(), &self.references, NameKind::Reference)?;
        self.references.add(name.clone(), value).ok()?;
        self.journal
            .record("", ActionKind::Reference, format!("{} = {}", name, value));
        Some(name)
    }

    /// Apply a stored reference to an axis of the current workspace.
    pub fn run_reference(&mut self, name: &str, axis: i64) -> bool {
        match self.reference(name) {
            Some(value) => self.apply(Operation::Ref {
                reference: Some(value),
                axis,
            }),
            None => {
                self.report(&format!("no reference named '{}'", name));
                false
            }
        }
    }

    pub fn clear_reference(&mut self, axis: i64) -> bool {
        self.apply(Operation::Ref {
            reference: None,
            axis,
        })
    }

    pub fn rename_reference(&mut self, old: &str, new: &str) -> bool {
        match self.references.rename(old, new) {
            Ok(()) => true,
            Err(e) => {
                self.report(&e.to_string());
                false
            }
        }
    }

    pub fn remove_reference(&mut self, name: &str) -> bool {
        match self.references.remove(name) {
            Ok(_) => true,
            Err(e) => {
                self.report(&e.to_string());
                false
            }
        }
    }

    pub fn save_reference(&mut self, name: &str, path: &Path) -> bool {
        let result = match self.reference(name) {
            Some(value) => reference::write_reference(value, path),
            None => {
                self.report(&format!("no reference named '{}'", name));
                return false;
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                self.report(&format!("Failed saving reference {}: {}", name, e));
                false
            }
        }
    }

    pub fn load_reference(&mut self, path: &Path) -> Option<String> {
        match reference::read_reference(path) {
            Ok(value) => self.store_reference(value),
            Err(e) => {
                self.report(&e.to_string());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::interchange;
    use crate::data::spectrum::AxisParams;
    use num_complex::Complex64;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::rc::Rc;

    #[derive(Default)]
    struct Shared {
        reports: Vec<String>,
        answers: VecDeque<Option<String>>,
        requests: Vec<NameRequest>,
        changes: usize,
    }

    /// Answers from a script, then falls back to the suggestion.
    struct Scripted(Rc<RefCell<Shared>>);

    impl Frontend for Scripted {
        fn report(&mut self, message: &str) {
            self.0.borrow_mut().reports.push(message.to_string());
        }

        fn ask_unique_name(&mut self, request: &NameRequest) -> Option<String> {
            let mut shared = self.0.borrow_mut();
            shared.requests.push(request.clone());
            shared
                .answers
                .pop_front()
                .unwrap_or_else(|| Some(request.suggestion.clone()))
        }

        fn on_dataset_changed(&mut self, _workspace: &str) {
            self.0.borrow_mut().changes += 1;
        }
    }

    fn session() -> (Session, Rc<RefCell<Shared>>) {
        let shared = Rc::new(RefCell::new(Shared::default()));
        (Session::new(Box::new(Scripted(shared.clone()))), shared)
    }

    fn fixture(dir: &Path) -> PathBuf {
        let values = (0..16)
            .map(|k| Complex64::from_polar((-(k as f64) / 6.0).exp(), 0.7 * k as f64))
            .collect();
        let spectrum = SpectrumData::from_vec(values, AxisParams::new(300e6, 5000.0, false)).unwrap();
        let path = dir.join("fid.json");
        interchange::write_json(&spectrum, &path).unwrap();
        path
    }

    fn last_report(shared: &Rc<RefCell<Shared>>) -> String {
        shared.borrow().reports.last().cloned().unwrap_or_default()
    }

    #[test]
    fn test_undo_redo_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, shared) = session();
        assert!(!s.undo());
        assert_eq!(last_report(&shared), "no workspace open");

        s.load(&fixture(dir.path())).unwrap();
        assert!(!s.undo());
        assert_eq!(last_report(&shared), "no undo information");
        assert!(!s.redo());
        assert_eq!(last_report(&shared), "no redo information");

        let loaded = s.current().unwrap().spectrum().clone();
        assert!(s.apply(Operation::Fourier { axis: 0 }));
        assert!(s.undo());
        assert_eq!(s.current().unwrap().spectrum(), &loaded);
        assert!(s.redo());
        assert!(s.current().unwrap().spectrum().axes()[0].spec);

        let kinds: Vec<ActionKind> = s.journal().entries.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::Load, ActionKind::Apply, ActionKind::Undo, ActionKind::Redo]
        );
        assert_eq!(s.journal().entries[2].description, "fourier[0]");
        assert_eq!(shared.borrow().changes, 4);
    }

    #[test]
    fn test_digital_filter_correction_is_undoable() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let acqus = dir.path().join("acqus");
        std::fs::write(&acqus, "##$DSPFVS= 20\n##$GRPDLY= 76\n").unwrap();
        let (mut s, _) = session();
        s.load(&path).unwrap();
        let loaded = s.current().unwrap().spectrum().clone();

        s.start_recording().unwrap();
        assert!(s.correct_digital_filter(&acqus, -1));
        let name = s.stop_recording().unwrap();
        let expected = Operation::Phase { phase0: 0.0, phase1: 76.0 * 2.0 * PI, axis: -1 };
        assert_eq!(s.macro_steps(&name).unwrap(), &[MacroStep::from_operation(&expected)]);
        assert!(s.journal().entries.iter().any(|e| e.kind == ActionKind::Apply));
        assert_ne!(s.current().unwrap().spectrum(), &loaded);

        assert!(s.undo());
        assert_eq!(s.current().unwrap().spectrum(), &loaded);
    }

    #[test]
    fn test_unknown_filter_firmware_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        std::fs::write(dir.path().join("acqus"), "##$DSPFVS= 10\n##$DECIM= 5\n").unwrap();
        let (mut s, shared) = session();
        s.load(&path).unwrap();
        assert!(!s.correct_digital_filter(dir.path(), -1));
        assert_eq!(
            last_report(&shared),
            "DSPFVS value not recognized (Bruker hardware version not known)"
        );
        assert_eq!(s.current().unwrap().undo_depth(), 0);
    }

    #[test]
    fn test_failed_apply_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, shared) = session();
        s.load(&fixture(dir.path())).unwrap();
        assert!(!s.apply(Operation::Fourier { axis: 2 }));
        assert!(last_report(&shared).starts_with("fourier[2]: axis 2 out of range"));
        assert_eq!(s.current().unwrap().undo_depth(), 0);
    }

    #[test]
    fn test_load_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, shared) = session();
        assert!(s.load(&dir.path().join("nothing.here")).is_none());
        assert!(last_report(&shared).starts_with("Failed loading"));
        assert!(s.workspace_names().is_empty());
    }

    #[test]
    fn test_workspace_names_and_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let (mut s, shared) = session();
        assert_eq!(s.load(&path).as_deref(), Some("spectrum0"));
        assert_eq!(s.load(&path).as_deref(), Some("spectrum1"));

        shared.borrow_mut().answers =
            VecDeque::from(vec![Some("spectrum0".to_string()), Some(String::new()), Some("copy".to_string())]);
        assert_eq!(s.duplicate().as_deref(), Some("copy"));
        assert_eq!(shared.borrow().reports.len(), 2);
        let last_request = shared.borrow().requests.last().cloned().unwrap();
        assert_eq!(last_request.collision.as_deref(), Some(""));
        assert_eq!(last_request.suggestion, "spectrum2");

        shared.borrow_mut().answers = VecDeque::from(vec![None]);
        assert!(s.duplicate().is_none());
        assert_eq!(s.workspace_names(), vec!["spectrum0", "spectrum1", "copy"]);
    }

    #[test]
    fn test_destroy_moves_current() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let (mut s, _) = session();
        s.load(&path);
        s.load(&path);
        s.load(&path);
        assert!(s.select("spectrum1"));
        assert!(s.destroy("spectrum0"));
        assert_eq!(s.current_name(), Some("spectrum1"));
        assert!(s.destroy("spectrum1"));
        assert_eq!(s.current_name(), Some("spectrum2"));
        assert!(s.rename_workspace("spectrum2", "last"));
        assert!(s.destroy("last"));
        assert_eq!(s.current_name(), None);
        assert!(!s.destroy("last"));
    }

    #[test]
    fn test_recorded_macro_reproduces_live_result() {
        let dir = tempfile::tempdir().unwrap();
        let path = fixture(dir.path());
        let (mut s, shared) = session();
        s.load(&path);
        assert_eq!(s.start_recording().as_deref(), Some("macro0"));
        assert!(s.start_recording().is_none());
        assert!(last_report(&shared).contains("already recording"));

        s.apply(Operation::Apodize { lor: 20.0, gauss: 0.0, axis: 0 });
        s.apply(Operation::Real);
        s.apply(Operation::Size { size: 32, axis: 0 });
        s.apply(Operation::Fourier { axis: 0 });
        s.undo();
        s.undo();
        s.redo();
        s.apply(Operation::Fourier { axis: 0 });
        assert_eq!(s.stop_recording().as_deref(), Some("macro0"));
        let names: Vec<&str> = s.macro_steps("macro0").unwrap().iter().map(MacroStep::opcode).collect();
        assert_eq!(names, vec!["apodize", "real", "size", "fourier"]);
        let live = s.current().unwrap().spectrum().clone();

        s.load(&path);
        let report = s.run_macro("macro0").unwrap();
        assert_eq!(report.applied, 4);
        let replayed = s.current().unwrap().spectrum();
        assert_eq!(replayed.data(), live.data());
        assert_eq!(replayed.axes(), live.axes());
        assert_eq!(s.current().unwrap().undo_depth(), 4);
    }

    #[test]
    fn test_delete_macro_stops_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, _) = session();
        s.load(&fixture(dir.path()));
        let name = s.start_recording().unwrap();
        assert!(s.rename_macro(&name, "proc"));
        assert_eq!(s.current().unwrap().recording(), Some("proc"));
        assert!(s.delete_macro("proc"));
        assert_eq!(s.current().unwrap().recording(), None);
        assert!(s.apply(Operation::Real));
        assert!(s.macro_names().is_empty());
    }

    #[test]
    fn test_loaded_macro_with_unknown_opcode() {
        let dir = tempfile::tempdir().unwrap();
        let macro_path = dir.path().join("m.json");
        std::fs::write(&macro_path, r#"[["real", []], ["frobnicate", [1]], ["fourier", [0]]]"#).unwrap();
        let (mut s, shared) = session();
        s.load(&fixture(dir.path()));
        s.start_recording();
        let name = s.load_macro(&macro_path).unwrap();
        assert_eq!(s.current().unwrap().recording(), None);
        let report = s.run_macro(&name).unwrap();
        assert_eq!(report.applied, 2);
        assert!(shared
            .borrow()
            .reports
            .contains(&"unknown macro command: frobnicate".to_string()));

        let out = dir.path().join("saved.json");
        assert!(s.save_macro(&name, &out));
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("\"frobnicate\""));

        std::fs::write(&macro_path, r#"{"real": []}"#).unwrap();
        assert!(s.load_macro(&macro_path).is_none());
        assert!(last_report(&shared).contains("malformed macro file"));
    }

    #[test]
    fn test_references() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, shared) = session();
        s.load(&fixture(dir.path()));
        assert_eq!(s.add_reference(0).as_deref(), Some("ref0"));
        assert_eq!(s.reference("ref0"), Some(300e6));

        std::fs::write(dir.path().join("r.txt"), "299999000.5\n").unwrap();
        let loaded = s.load_reference(&dir.path().join("r.txt")).unwrap();
        assert_eq!(loaded, "ref1");
        assert!(s.run_reference("ref1", -1));
        assert_eq!(s.current().unwrap().spectrum().axes()[0].reference, Some(299999000.5));
        assert!(s.clear_reference(0));
        assert_eq!(s.current().unwrap().spectrum().axes()[0].reference, None);
        assert!(s.undo());
        assert_eq!(s.current().unwrap().spectrum().axes()[0].reference, Some(299999000.5));

        assert!(s.save_reference("ref1", &dir.path().join("out.txt")));
        assert!(!s.rename_reference("ref1", "ref0"));
        assert!(last_report(&shared).contains("already exists"));
        assert!(s.remove_reference("ref0"));
        assert_eq!(s.reference_names(), vec!["ref1"]);

        std::fs::write(dir.path().join("bad.txt"), "abc").unwrap();
        assert!(s.load_reference(&dir.path().join("bad.txt")).is_none());
        assert!(last_report(&shared).contains("Failed loading"));
    }

    #[test]
    fn test_save_current_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let (mut s, shared) = session();
        assert!(!s.save_current(&dir.path().join("x.json"), false));
        s.load(&fixture(dir.path()));
        s.apply(Operation::Fourier { axis: 0 });
        let out = dir.path().join("out.json");
        assert!(s.save_current(&out, false));
        let back = conversion::load_spectrum(&out).unwrap().spectrum;
        assert_eq!(back.data(), s.current().unwrap().spectrum().data());
        assert!(!s.save_current(&dir.path().join("out.xyz"), false));
        assert!(last_report(&shared).starts_with("Failed saving"));
    }
}
