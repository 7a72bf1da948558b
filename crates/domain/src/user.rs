use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{OrderError, UserId};

/// Kind of customer account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    #[default]
    Individual,
    /// Corporate accounts paying by bank transfer are approved without the gateway.
    Corporate,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Individual => "individual",
            AccountType::Corporate => "corporate",
        }
    }
}

impl std::fmt::Display for AccountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "individual" => Ok(AccountType::Individual),
            "corporate" => Ok(AccountType::Corporate),
            other => Err(OrderError::UnknownVariant {
                kind: "account type",
                value: other.to_string(),
            }),
        }
    }
}

/// The requesting user, as far as order creation cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub account_type: AccountType,
}

impl User {
    pub fn new(id: UserId, account_type: AccountType) -> Self {
        Self { id, account_type }
    }

    pub fn is_corporate(&self) -> bool {
        self.account_type == AccountType::Corporate
    }
}
