//! Pure next-step decision for one endpoint key

use super::ActualTunnel;
use ngext_provider::{TunnelId, TunnelSpec};

/// A call to issue against the tunnel service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create(TunnelSpec),
    Update(TunnelId, TunnelSpec),
    Delete(TunnelId),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Create(_) => "create",
            Operation::Update(..) => "update",
            Operation::Delete(_) => "delete",
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Operation::Delete(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Step {
    /// Actual already matches desired
    Settled,
    Call(Operation),
}

/// Decide what brings `actual` closer to `desired`.
///
/// A pooling change cannot be applied in place: the old tunnel is deleted
/// first and the create happens on the next step, once the delete confirmed.
pub(crate) fn plan(desired: Option<&TunnelSpec>, actual: Option<&ActualTunnel>) -> Step {
    match (desired, actual) {
        (None, None) => Step::Settled,
        (None, Some(actual)) => Step::Call(Operation::Delete(actual.info.id.clone())),
        (Some(desired), None) => Step::Call(Operation::Create(desired.clone())),
        (Some(desired), Some(actual)) => {
            if desired.pooling_enabled != actual.applied.pooling_enabled {
                Step::Call(Operation::Delete(actual.info.id.clone()))
            } else if desired != &actual.applied {
                Step::Call(Operation::Update(actual.info.id.clone(), desired.clone()))
            } else {
                Step::Settled
            }
        }
    }
}
