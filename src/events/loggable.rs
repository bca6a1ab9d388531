use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retention class of an audit entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Authorization and approval decisions; never trimmed.
    Critical,
    #[default]
    Important,
    /// Routine session churn (login/logout).
    Noise,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Important => "important",
            Severity::Noise => "noise",
        }
    }
}

/// Entities that can be written to the audit trail.
pub trait Loggable: Serialize + Send + Sync {
    /// Prefix of event names, e.g. `workflow` in `workflow.approved`.
    fn entity_type() -> &'static str;

    fn subject_id(&self) -> Uuid;

    fn severity(&self) -> Severity {
        Severity::Important
    }

    fn severity_for_action(&self, action: &str) -> Severity {
        match action {
            "deleted" => Severity::Critical,
            "created" | "updated" => self.severity(),
            _ => Severity::Important,
        }
    }
}
