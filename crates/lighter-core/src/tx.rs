//! Transaction type and status codes of the signed-transaction endpoint.

use serde::{Deserialize, Serialize};

/// Transaction kinds the connector signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    CreateOrder,
    CancelOrder,
    CancelAllOrders,
}

impl TxType {
    pub fn code(&self) -> u8 {
        match self {
            Self::CreateOrder => 14,
            Self::CancelOrder => 15,
            Self::CancelAllOrders => 16,
        }
    }
}

/// Status reported for a submitted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Failed,
    Pending,
    Executed,
    PendingFinal,
}

impl TxStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Failed),
            1 => Some(Self::Pending),
            2 => Some(Self::Executed),
            3 => Some(Self::PendingFinal),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(TxType::CreateOrder.code(), 14);
        assert_eq!(TxType::CancelOrder.code(), 15);
        assert_eq!(TxType::CancelAllOrders.code(), 16);
        assert_eq!(TxStatus::from_code(2), Some(TxStatus::Executed));
        assert_eq!(TxStatus::from_code(9), None);
    }
}
