use serde::{Deserialize, Serialize};

/// Closed set of reasons a failure can be classified under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A required capability (tool, hook, command) is not available.
    MissingCapability,
    /// A required credential is not configured.
    MissingCredential,
    /// A network call failed in a way that may succeed later.
    TransientNetwork,
    /// An operation exceeded its wall-clock budget.
    Timeout,
    /// Anything else.
    Unclassified,
}

impl FailureReason {
    /// All reasons, in declaration order.
    pub const ALL: [FailureReason; 5] = [
        FailureReason::MissingCapability,
        FailureReason::MissingCredential,
        FailureReason::TransientNetwork,
        FailureReason::Timeout,
        FailureReason::Unclassified,
    ];

    /// Reasons that are worth retrying on the same path before falling back.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureReason::TransientNetwork | FailureReason::Timeout)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::MissingCapability => write!(f, "missing_capability"),
            FailureReason::MissingCredential => write!(f, "missing_credential"),
            FailureReason::TransientNetwork => write!(f, "transient_network"),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Unclassified => write!(f, "unclassified"),
        }
    }
}
