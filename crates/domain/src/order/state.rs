//! Order and payment status.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::OrderError;

/// Fulfilment-side status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Created, waiting on payment.
    #[default]
    Pending,
    /// Payment succeeded.
    Confirmed,
    Cancelled,
}

/// Payment status of an order.
///
/// ```text
/// Pending ──┬──► Succeeded
///           │        ▲
///           └──► Failed
/// ```
///
/// `Succeeded` is terminal; a failed payment may still be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

/// Outcome of asking for a payment status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PaymentTransition {
    /// The status changed.
    Applied {
        from: PaymentStatus,
        to: PaymentStatus,
    },
    /// Payment had already succeeded; nothing changed.
    AlreadySucceeded,
    /// Payment had already failed and another failure was reported.
    AlreadyFailed,
}

impl PaymentTransition {
    pub fn is_applied(&self) -> bool {
        matches!(self, PaymentTransition::Applied { .. })
    }
}

impl PaymentStatus {
    /// Transition for a reported successful payment.
    pub fn on_success(self) -> PaymentTransition {
        match self {
            PaymentStatus::Succeeded => PaymentTransition::AlreadySucceeded,
            from => PaymentTransition::Applied {
                from,
                to: PaymentStatus::Succeeded,
            },
        }
    }

    /// Transition for a reported failed payment.
    pub fn on_failure(self) -> PaymentTransition {
        match self {
            PaymentStatus::Succeeded => PaymentTransition::AlreadySucceeded,
            PaymentStatus::Failed => PaymentTransition::AlreadyFailed,
            PaymentStatus::Pending => PaymentTransition::Applied {
                from: PaymentStatus::Pending,
                to: PaymentStatus::Failed,
            },
        }
    }
}

macro_rules! status_strings {
    ($ty:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = OrderError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(OrderError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

status_strings!(OrderStatus, "order status", {
    Pending => "pending",
    Confirmed => "confirmed",
    Cancelled => "cancelled",
});

status_strings!(PaymentStatus, "payment status", {
    Pending => "pending",
    Succeeded => "succeeded",
    Failed => "failed",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_moves_forward() {
        assert_eq!(
            PaymentStatus::Pending.on_success(),
            PaymentTransition::Applied {
                from: PaymentStatus::Pending,
                to: PaymentStatus::Succeeded
            }
        );
        assert!(PaymentStatus::Pending.on_failure().is_applied());
    }

    #[test]
    fn test_failed_payment_can_be_retried() {
        assert_eq!(
            PaymentStatus::Failed.on_success(),
            PaymentTransition::Applied {
                from: PaymentStatus::Failed,
                to: PaymentStatus::Succeeded
            }
        );
        assert_eq!(
            PaymentStatus::Failed.on_failure(),
            PaymentTransition::AlreadyFailed
        );
    }

    #[test]
    fn test_succeeded_is_terminal() {
        assert_eq!(
            PaymentStatus::Succeeded.on_success(),
            PaymentTransition::AlreadySucceeded
        );
        assert_eq!(
            PaymentStatus::Succeeded.on_failure(),
            PaymentTransition::AlreadySucceeded
        );
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(PaymentStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(
            "confirmed".parse::<OrderStatus>().unwrap(),
            OrderStatus::Confirmed
        );
        assert!("paid".parse::<PaymentStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&OrderStatus::Pending).unwrap(),
            "\"pending\""
        );
    }
}
