// ============================================================================
// Transaction State
// ============================================================================
//
// Lifecycle of a transaction or savepoint scope:
//
// ```text
// Active ──commit──> Committed
//   │
//   └──rollback / drop──> RolledBack
// ```
//
// Both terminal states are final; commit and rollback on a terminal handle
// are no-ops.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Scope is open and accepts statements
    Active,

    /// Transaction committed or savepoint released
    Committed,

    /// Transaction rolled back or savepoint rolled back to
    RolledBack,
}

impl TransactionState {
    /// Check if the scope can execute statements
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    /// Check if the scope is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::RolledBack => write!(f, "ROLLED BACK"),
        }
    }
}
