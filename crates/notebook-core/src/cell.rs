//! Cell entity: source, output and execution status.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::id::{CellId, RunId};
use crate::settings::OutputPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CellKind {
    #[default]
    Code,
    Markdown,
}

impl std::fmt::Display for CellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellKind::Code => write!(f, "code"),
            CellKind::Markdown => write!(f, "markdown"),
        }
    }
}

/// Execution status of a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CellStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Error,
}

impl std::fmt::Display for CellStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellStatus::Idle => write!(f, "idle"),
            CellStatus::Running => write!(f, "running"),
            CellStatus::Completed => write!(f, "completed"),
            CellStatus::Error => write!(f, "error"),
        }
    }
}

/// Jupyter-style output kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stream,
    DisplayData,
    ExecuteResult,
    Error,
}

/// Output payload: plain text or a structured value (e.g. a MIME bundle).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputPayload {
    Text(String),
    Data(Value),
}

impl OutputPayload {
    /// Text rendering used by summaries and the CLI table.
    pub fn to_text(&self) -> String {
        match self {
            OutputPayload::Text(s) => s.clone(),
            OutputPayload::Data(v) => v.to_string(),
        }
    }
}

/// One output event produced by a run.
///
/// `timestamp` comes from the producer and is only used for display; events
/// are applied in arrival order regardless of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputEvent {
    pub id: String,
    pub kind: OutputKind,
    pub payload: OutputPayload,
    pub timestamp: i64,
}

impl OutputEvent {
    pub fn new(kind: OutputKind, payload: OutputPayload, timestamp: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            timestamp,
        }
    }

    pub fn stream(text: impl Into<String>, timestamp: i64) -> Self {
        Self::new(OutputKind::Stream, OutputPayload::Text(text.into()), timestamp)
    }

    pub fn error(message: impl Into<String>, timestamp: i64) -> Self {
        Self::new(OutputKind::Error, OutputPayload::Text(message.into()), timestamp)
    }
}

/// A cell as stored in a notebook.
///
/// The store only hands out shared references; every change goes through a
/// store operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub id: CellId,
    pub kind: CellKind,
    pub content: String,
    pub output: Vec<OutputEvent>,
    pub status: CellStatus,
    /// Number of completed runs; unset until the first one.
    pub execution_count: Option<u32>,
    #[serde(skip)]
    pub(crate) active_run: Option<RunId>,
}

impl Cell {
    pub(crate) fn from_draft(draft: CellDraft) -> Self {
        Self {
            id: CellId::generate(),
            kind: draft.kind,
            content: draft.content,
            output: Vec::new(),
            status: CellStatus::Idle,
            execution_count: None,
            active_run: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == CellStatus::Running
    }

    /// Token of the run currently allowed to commit into this cell.
    pub fn active_run(&self) -> Option<&RunId> {
        self.active_run.as_ref()
    }

    pub(crate) fn apply_patch(&mut self, patch: CellPatch) {
        if let Some(content) = patch.content {
            self.content = content;
        }
        if let Some(kind) = patch.kind {
            self.kind = kind;
        }
    }

    pub(crate) fn apply_output(&mut self, event: OutputEvent, policy: OutputPolicy) {
        match policy {
            OutputPolicy::ReplaceLatest => {
                self.output.clear();
                self.output.push(event);
            }
            OutputPolicy::Append => self.output.push(event),
        }
    }

    /// Latest output event, if any.
    pub fn last_output(&self) -> Option<&OutputEvent> {
        self.output.last()
    }
}

/// Initial values for a new cell. The store always assigns the ID.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDraft {
    #[serde(default)]
    pub kind: CellKind,
    #[serde(default)]
    pub content: String,
}

impl CellDraft {
    pub fn code(content: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Code,
            content: content.into(),
        }
    }

    pub fn markdown(content: impl Into<String>) -> Self {
        Self {
            kind: CellKind::Markdown,
            content: content.into(),
        }
    }

    /// Empty draft of the configured default kind.
    pub fn default_for(settings: &crate::settings::Settings) -> Self {
        Self {
            kind: settings.default_cell_kind,
            content: String::new(),
        }
    }
}

/// Partial update for a cell; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CellKind>,
}

impl CellPatch {
    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            kind: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_draft_starts_idle_without_output() {
        let cell = Cell::from_draft(CellDraft::code("x = 1"));

        assert_eq!(cell.kind, CellKind::Code);
        assert_eq!(cell.content, "x = 1");
        assert_eq!(cell.status, CellStatus::Idle);
        assert!(cell.output.is_empty());
        assert!(cell.execution_count.is_none());
        assert!(cell.active_run().is_none());
    }

    #[test]
    fn test_apply_patch_only_touches_given_fields() {
        let mut cell = Cell::from_draft(CellDraft::code("a"));

        cell.apply_patch(CellPatch {
            content: None,
            kind: Some(CellKind::Markdown),
        });
        assert_eq!(cell.content, "a");
        assert_eq!(cell.kind, CellKind::Markdown);

        cell.apply_patch(CellPatch::content("b"));
        assert_eq!(cell.content, "b");
        assert_eq!(cell.kind, CellKind::Markdown);
    }

    #[test]
    fn test_replace_latest_keeps_single_event() {
        let mut cell = Cell::from_draft(CellDraft::code("print(1)"));

        cell.apply_output(OutputEvent::stream("one", 1), OutputPolicy::ReplaceLatest);
        cell.apply_output(OutputEvent::stream("two", 2), OutputPolicy::ReplaceLatest);

        assert_eq!(cell.output.len(), 1);
        assert_eq!(cell.output[0].payload, OutputPayload::Text("two".into()));
    }

    #[test]
    fn test_append_keeps_arrival_order() {
        let mut cell = Cell::from_draft(CellDraft::code("print(1)"));

        // Timestamps deliberately out of order: arrival order wins.
        cell.apply_output(OutputEvent::stream("late", 20), OutputPolicy::Append);
        cell.apply_output(OutputEvent::stream("early", 10), OutputPolicy::Append);

        let texts: Vec<String> = cell.output.iter().map(|e| e.payload.to_text()).collect();
        assert_eq!(texts, vec!["late", "early"]);
    }

    #[test]
    fn test_cell_serialization() {
        let cell = Cell::from_draft(CellDraft::markdown("# Title"));
        let json = serde_json::to_value(&cell).unwrap();

        assert_eq!(json["kind"], "markdown");
        assert_eq!(json["status"], "idle");
        assert_eq!(json["content"], "# Title");
        assert!(json["execution_count"].is_null());
        assert!(json.get("active_run").is_none());
    }

    #[test]
    fn test_output_event_serialization() {
        let event = OutputEvent::new(
            OutputKind::DisplayData,
            OutputPayload::Data(serde_json::json!({"text/plain": "42"})),
            7,
        );
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["kind"], "display_data");
        assert_eq!(json["payload"]["text/plain"], "42");
        assert_eq!(json["timestamp"], 7);
    }
}
