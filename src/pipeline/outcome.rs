use serde::Serialize;

/// How a stage arrived at its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// The first model response satisfied the contract.
    Clean,
    /// A repair round-trip or a closed-world retry was needed.
    Repaired,
    /// No model call was made (nothing to do).
    Skipped,
    /// Every recovery step failed; the value is the fallback sentinel.
    Degraded,
}

/// A stage result. `value` always has the stage's output shape, even when
/// `status` is `Degraded`.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome<T> {
    pub value: T,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl<T> StageOutcome<T> {
    pub fn clean(value: T) -> Self {
        Self {
            value,
            status: StageStatus::Clean,
            detail: None,
        }
    }

    pub fn repaired(value: T, detail: impl Into<String>) -> Self {
        Self {
            value,
            status: StageStatus::Repaired,
            detail: Some(detail.into()),
        }
    }

    pub fn skipped(value: T, detail: impl Into<String>) -> Self {
        Self {
            value,
            status: StageStatus::Skipped,
            detail: Some(detail.into()),
        }
    }

    pub fn degraded(value: T, detail: impl Into<String>) -> Self {
        Self {
            value,
            status: StageStatus::Degraded,
            detail: Some(detail.into()),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.status == StageStatus::Degraded
    }
}
