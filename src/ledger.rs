// SPDX-License-Identifier: AGPL-3.0-or-later
//! Progress ledger
//!
//! One entry per step, keyed by step id and kept in execution order. Every
//! status transition re-renders the Markdown checklist and the JSON state
//! from the map; entries are never located by text substitution.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::step::Outcome;

/// Status of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Done,
    Skipped,
    Failed,
}

impl LedgerStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LedgerStatus::Pending)
    }

    /// Checklist glyph
    pub fn glyph(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "[ ]",
            LedgerStatus::Done => "[x]",
            LedgerStatus::Skipped => "[-]",
            LedgerStatus::Failed => "[!]",
        }
    }
}

impl From<&Outcome> for LedgerStatus {
    fn from(outcome: &Outcome) -> Self {
        match outcome {
            Outcome::Success(_) => LedgerStatus::Done,
            Outcome::Skipped(_) => LedgerStatus::Skipped,
            Outcome::Failed(_) => LedgerStatus::Failed,
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerStatus::Pending => write!(formatter, "PENDING"),
            LedgerStatus::Done => write!(formatter, "DONE"),
            LedgerStatus::Skipped => write!(formatter, "SKIPPED"),
            LedgerStatus::Failed => write!(formatter, "FAILED"),
        }
    }
}

/// Status of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub step_id: String,
    pub display_name: String,
    pub status: LedgerStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

/// Serialized form of the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerState {
    started_at: DateTime<Utc>,
    entries: Vec<LedgerEntry>,
    #[serde(default)]
    details: Vec<String>,
}

/// Persisted record of step outcomes
#[derive(Debug)]
pub struct Ledger {
    entries: IndexMap<String, LedgerEntry>,
    details: Vec<String>,
    started_at: DateTime<Utc>,
    progress_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
}

impl Ledger {
    /// Ledger persisted to a Markdown checklist and a JSON state file
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(progress_path: P, state_path: Q) -> Self {
        Self {
            entries: IndexMap::new(),
            details: Vec::new(),
            started_at: Utc::now(),
            progress_path: Some(progress_path.into()),
            state_path: Some(state_path.into()),
        }
    }

    /// Ledger that never touches the filesystem
    pub fn in_memory() -> Self {
        Self {
            entries: IndexMap::new(),
            details: Vec::new(),
            started_at: Utc::now(),
            progress_path: None,
            state_path: None,
        }
    }

    /// Read a ledger persisted by a previous run
    pub fn load<P: AsRef<Path>>(state_path: P) -> Result<Self> {
        let state_path = state_path.as_ref();
        let contents = std::fs::read_to_string(state_path)?;
        let state: LedgerState = serde_json::from_str(&contents)?;

        Ok(Self {
            entries: state
                .entries
                .into_iter()
                .map(|entry| (entry.step_id.clone(), entry))
                .collect(),
            details: state.details,
            started_at: state.started_at,
            progress_path: None,
            state_path: Some(state_path.to_path_buf()),
        })
    }

    /// Create a Pending entry for every step and persist the initial ledger.
    /// Any previous content is discarded.
    pub fn initialize<'a, I>(&mut self, steps: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        self.started_at = Utc::now();
        self.details.clear();
        self.entries = steps
            .into_iter()
            .map(|(step_id, display_name)| {
                (
                    step_id.to_string(),
                    LedgerEntry {
                        step_id: step_id.to_string(),
                        display_name: display_name.to_string(),
                        status: LedgerStatus::Pending,
                        timestamp: self.started_at,
                        message: String::new(),
                    },
                )
            })
            .collect();

        self.persist();
    }

    /// Move `step_id` to its terminal status. Returns false (and changes
    /// nothing) for unknown ids or entries that are already terminal.
    pub fn record_outcome(&mut self, step_id: &str, outcome: &Outcome) -> bool {
        let Some(entry) = self.entries.get_mut(step_id) else {
            warn!(step = %step_id, "Outcome recorded for unknown step, ignoring");
            return false;
        };

        if entry.status.is_terminal() {
            warn!(
                step = %step_id,
                status = %entry.status,
                "Step already has a terminal status, ignoring"
            );
            return false;
        }

        let now = Utc::now();
        entry.status = LedgerStatus::from(outcome);
        entry.timestamp = now;
        entry.message = outcome.message().to_string();

        self.details.push(format!(
            "- {} `{}` {}: {}",
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
            step_id,
            entry.status,
            entry.message
        ));

        self.persist();
        true
    }

    pub fn get(&self, step_id: &str) -> Option<&LedgerEntry> {
        self.entries.get(step_id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn count(&self, status: LedgerStatus) -> usize {
        self.entries().filter(|entry| entry.status == status).count()
    }

    /// Markdown checklist plus the detail log
    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Nest provisioning progress\n\n");
        out.push_str(&format!(
            "Started: {}\n\n",
            self.started_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        out.push_str("## Steps\n\n");
        for entry in self.entries.values() {
            out.push_str(&format!(
                "- {} {} (`{}`)\n",
                entry.status.glyph(),
                entry.display_name,
                entry.step_id
            ));
        }
        out.push_str("\n## Log\n\n");
        for line in &self.details {
            out.push_str(line);
            out.push('\n');
        }
        out
    }

    fn persist(&self) {
        if let Some(path) = &self.progress_path {
            if let Err(e) = write_creating_parent(path, self.render_markdown().as_bytes()) {
                warn!(path = %path.display(), error = %e, "Could not write progress file");
            }
        }

        if let Some(path) = &self.state_path {
            let state = LedgerState {
                started_at: self.started_at,
                entries: self.entries.values().cloned().collect(),
                details: self.details.clone(),
            };
            let written = serde_json::to_vec_pretty(&state)
                .map_err(std::io::Error::from)
                .and_then(|json| write_creating_parent(path, &json));
            if let Err(e) = written {
                warn!(path = %path.display(), error = %e, "Could not write ledger state");
            }
        }

        debug!(entries = self.entries.len(), "Ledger persisted");
    }
}

fn write_creating_parent(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const STEPS: [(&str, &str); 3] = [
        ("package-update", "Update packages"),
        ("ssh-keys", "Authorize SSH key"),
        ("ssh-hardening", "Harden SSH"),
    ];

    #[test]
    fn test_initialize_creates_pending_entries_in_order() {
        let mut ledger = Ledger::in_memory();
        ledger.initialize(STEPS);

        let ids: Vec<_> = ledger.entries().map(|entry| entry.step_id.as_str()).collect();
        assert_eq!(ids, vec!["package-update", "ssh-keys", "ssh-hardening"]);
        assert_eq!(ledger.count(LedgerStatus::Pending), 3);
    }

    #[test]
    fn test_record_outcome_maps_status() {
        let mut ledger = Ledger::in_memory();
        ledger.initialize(STEPS);

        assert!(ledger.record_outcome("package-update", &Outcome::Success("ok".into())));
        assert!(ledger.record_outcome("ssh-keys", &Outcome::Skipped("no key".into())));
        assert!(ledger.record_outcome("ssh-hardening", &Outcome::Failed("boom".into())));

        assert_eq!(ledger.get("package-update").unwrap().status, LedgerStatus::Done);
        assert_eq!(ledger.get("ssh-keys").unwrap().status, LedgerStatus::Skipped);
        let failed = ledger.get("ssh-hardening").unwrap();
        assert_eq!(failed.status, LedgerStatus::Failed);
        assert_eq!(failed.message, "boom");
    }

    #[test]
    fn test_terminal_status_is_set_once() {
        let mut ledger = Ledger::in_memory();
        ledger.initialize(STEPS);

        assert!(ledger.record_outcome("ssh-keys", &Outcome::Failed("first".into())));
        assert!(!ledger.record_outcome("ssh-keys", &Outcome::Success("second".into())));
        assert_eq!(ledger.get("ssh-keys").unwrap().message, "first");
        assert!(!ledger.record_outcome("unknown", &Outcome::Success("x".into())));
    }

    #[test]
    fn test_prefix_ids_do_not_collide() {
        let mut ledger = Ledger::in_memory();
        ledger.initialize([("ssh", "SSH"), ("ssh-hardening", "Harden SSH")]);

        ledger.record_outcome("ssh", &Outcome::Success("done".into()));

        assert_eq!(ledger.get("ssh").unwrap().status, LedgerStatus::Done);
        assert_eq!(ledger.get("ssh-hardening").unwrap().status, LedgerStatus::Pending);

        let markdown = ledger.render_markdown();
        assert!(markdown.contains("- [x] SSH (`ssh`)"));
        assert!(markdown.contains("- [ ] Harden SSH (`ssh-hardening`)"));
    }

    #[test]
    fn test_persisted_files_are_rewritten() {
        let temp_dir = tempdir().unwrap();
        let progress = temp_dir.path().join("log/progress.md");
        let state = temp_dir.path().join("log/progress.json");

        let mut ledger = Ledger::new(&progress, &state);
        ledger.initialize(STEPS);
        let initial = std::fs::read_to_string(&progress).unwrap();
        assert_eq!(initial.matches("[ ]").count(), 3);
        assert!(initial.contains("Started: "));

        ledger.record_outcome("package-update", &Outcome::Success("upgraded 12 packages".into()));
        let updated = std::fs::read_to_string(&progress).unwrap();
        assert!(updated.contains("- [x] Update packages (`package-update`)"));
        assert!(updated.contains("`package-update` DONE: upgraded 12 packages"));
        assert_eq!(updated.matches("[ ]").count(), 2);

        let reloaded = Ledger::load(&state).unwrap();
        assert_eq!(
            reloaded.get("package-update").unwrap().status,
            LedgerStatus::Done
        );
        assert_eq!(reloaded.entries().count(), 3);
    }

    #[test]
    fn test_unwritable_location_does_not_panic() {
        let temp_dir = tempdir().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        // Parent is a regular file, so every write fails
        let mut ledger = Ledger::new(blocker.join("progress.md"), blocker.join("state.json"));
        ledger.initialize(STEPS);
        assert!(ledger.record_outcome("ssh-keys", &Outcome::Success("ok".into())));
    }
}
