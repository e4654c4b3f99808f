//! Transaction lifecycle
//!
//! ```text
//! Created -> Active -> Committing -> Committed
//!              |            |
//!              +------------+-----> RolledBack
//! ```
//!
//! `Committed` and `RolledBack` are terminal.

use std::fmt;

/// Transaction identity. Write transactions get strictly increasing ids;
/// a read transaction's id is the last committed id it observes.
pub type TxId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Read,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Created,
    Active,
    Committing,
    Committed,
    RolledBack,
}

impl TxState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: TxState) -> bool {
        matches!(
            (self, next),
            (TxState::Created, TxState::Active)
                | (TxState::Active, TxState::Committing)
                | (TxState::Active, TxState::RolledBack)
                | (TxState::Committing, TxState::Committed)
                | (TxState::Committing, TxState::RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxState::Created => "created",
            TxState::Active => "active",
            TxState::Committing => "committing",
            TxState::Committed => "committed",
            TxState::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a transaction ended, passed to dispose hooks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOutcome {
    pub tx_id: TxId,
    pub committed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert!(TxState::Created.can_transition_to(TxState::Active));
        assert!(TxState::Active.can_transition_to(TxState::Committing));
        assert!(TxState::Committing.can_transition_to(TxState::Committed));
        assert!(TxState::Active.can_transition_to(TxState::RolledBack));
        assert!(TxState::Committing.can_transition_to(TxState::RolledBack));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for next in [
            TxState::Created,
            TxState::Active,
            TxState::Committing,
            TxState::Committed,
            TxState::RolledBack,
        ] {
            assert!(!TxState::Committed.can_transition_to(next));
            assert!(!TxState::RolledBack.can_transition_to(next));
        }
        assert!(TxState::Committed.is_terminal());
        assert!(!TxState::Committing.is_terminal());
    }

    #[test]
    fn test_cannot_skip_committing() {
        assert!(!TxState::Active.can_transition_to(TxState::Committed));
        assert!(!TxState::Created.can_transition_to(TxState::Committing));
    }
}
