//! Saga state machine.

use serde::{Deserialize, Serialize};

/// Steps of one order-creation run.
///
/// State transitions:
/// ```text
/// Validating ──► OrderPersisted ──► PaymentBranchSelected ──┬──► CorporateAutoApproved ──┐
///                                                           └──► GatewayPaymentInitiated ─┤
///                                                                                         ▼
///                                     Completed ◄── CartCleared ◄── ItemsMaterialized ◄───┘
///
/// Validating ──► OrderPersisted ──► ItemsMaterialized ──► CartCleared ──► LegacyCompleted
/// ```
/// `CartCleared` is skipped when the cart was empty. Any step may end in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    #[default]
    Validating,
    OrderPersisted,
    PaymentBranchSelected,
    CorporateAutoApproved,
    GatewayPaymentInitiated,
    ItemsMaterialized,
    CartCleared,
    /// Transaction committed (terminal state).
    Completed,
    /// Legacy path committed (terminal state).
    LegacyCompleted,
    /// Rolled back (terminal state).
    Failed,
}

impl SagaState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::LegacyCompleted | SagaState::Failed
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::Validating => "Validating",
            SagaState::OrderPersisted => "OrderPersisted",
            SagaState::PaymentBranchSelected => "PaymentBranchSelected",
            SagaState::CorporateAutoApproved => "CorporateAutoApproved",
            SagaState::GatewayPaymentInitiated => "GatewayPaymentInitiated",
            SagaState::ItemsMaterialized => "ItemsMaterialized",
            SagaState::CartCleared => "CartCleared",
            SagaState::Completed => "Completed",
            SagaState::LegacyCompleted => "LegacyCompleted",
            SagaState::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
