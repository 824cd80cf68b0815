use crate::record::{ContextRecord, Priority, RecordStatus};
use serde::{Deserialize, Serialize};

/// Criteria for `list_archived` and `search`. Empty fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub priority: Option<Priority>,
    pub workflow_type: Option<String>,
    /// Matches when the record carries at least one of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Case-insensitive substring of the task description.
    pub text: Option<String>,
    pub status: Option<RecordStatus>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn workflow_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn status(mut self, status: RecordStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, record: &ContextRecord) -> bool {
        if let Some(priority) = self.priority {
            if record.priority != priority {
                return false;
            }
        }
        if let Some(workflow_type) = &self.workflow_type {
            if record.workflow_type.as_deref() != Some(workflow_type.as_str()) {
                return false;
            }
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| record.tags.contains(t)) {
            return false;
        }
        if let Some(text) = &self.text {
            if !record
                .task
                .to_lowercase()
                .contains(&text.to_lowercase())
            {
                return false;
            }
        }
        if let Some(status) = self.status {
            if !record.has_status(status) {
                return false;
            }
        }
        true
    }
}
