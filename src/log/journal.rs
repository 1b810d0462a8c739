/// Session journal
///
/// Timestamped audit trail of everything the session does to its
/// workspaces: loads, applied operations, undo, redo, macro replays and
/// saves. Exportable as human-readable text or JSON.

use std::fmt;
use std::io;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Load,
    Apply,
    Undo,
    Redo,
    Replay,
    Macro,
    Reference,
    Workspace,
    Save,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ActionKind::Load => "load",
            ActionKind::Apply => "apply",
            ActionKind::Undo => "undo",
            ActionKind::Redo => "redo",
            ActionKind::Replay => "replay",
            ActionKind::Macro => "macro",
            ActionKind::Reference => "reference",
            ActionKind::Workspace => "workspace",
            ActionKind::Save => "save",
        };
        f.pad(label)
    }
}

/// A single journal line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// 1-based
    pub sequence: usize,
    pub timestamp: DateTime<Local>,
    /// Workspace the action applied to; empty for session-level actions
    pub workspace: String,
    pub kind: ActionKind,
    pub description: String,
}

impl JournalEntry {
    pub fn to_text(&self) -> String {
        format!(
            "[{:03}] {} | {:<9} | {} | {}",
            self.sequence,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.kind,
            if self.workspace.is_empty() { "-" } else { &self.workspace },
            self.description
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionJournal {
    pub session_id: String,
    pub started: DateTime<Local>,
    pub software_version: String,
    pub entries: Vec<JournalEntry>,
}

impl SessionJournal {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            started: Local::now(),
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, workspace: &str, kind: ActionKind, description: impl Into<String>) {
        let sequence = self.entries.len() + 1;
        let description = description.into();
        log::debug!("[journal {:03}] {} {}: {}", sequence, kind, workspace, description);
        self.entries.push(JournalEntry {
            sequence,
            timestamp: Local::now(),
            workspace: workspace.to_string(),
            kind,
            description,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        out.push_str("═══════════════════════════════════════════════════════════════\n");
        out.push_str("  NMR Workbench Session Journal\n");
        out.push_str("═══════════════════════════════════════════════════════════════\n");
        out.push_str(&format!("  Session ID:  {}\n", self.session_id));
        out.push_str(&format!("  Started:     {}\n", self.started.format("%Y-%m-%d %H:%M:%S")));
        out.push_str(&format!("  Software:    nmr-workbench v{}\n", self.software_version));
        out.push_str(&format!("  Actions:     {}\n", self.entries.len()));
        out.push_str("───────────────────────────────────────────────────────────────\n");
        for entry in &self.entries {
            out.push_str(&entry.to_text());
            out.push('\n');
        }
        out
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("JSON error: {}", e))
    }

    /// Save as JSON when the extension is `.json`, text otherwise.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            std::fs::write(path, self.to_json())
        } else {
            std::fs::write(path, self.to_text())
        }
    }
}

impl Default for SessionJournal {
    fn default() -> Self {
        Self::new()
    }
}
