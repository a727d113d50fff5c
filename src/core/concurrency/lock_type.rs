// src/core/concurrency/lock_type.rs
use std::fmt;

/// Multi-granularity lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// No lock.
    NL,
    /// Intention shared: shared locks will be taken below.
    IS,
    /// Intention exclusive: exclusive locks will be taken below.
    IX,
    /// Shared.
    S,
    /// Shared with intention exclusive.
    SIX,
    /// Exclusive.
    X,
}

impl LockType {
    /// Whether locks of type `a` and `b` may be held on one resource by two
    /// distinct transactions at the same time.
    #[must_use]
    pub fn compatible(a: Self, b: Self) -> bool {
        use LockType::{IS, IX, NL, S, SIX, X};
        match (a, b) {
            (NL, _) | (_, NL) => true,
            (IS, X) | (X, IS) => false,
            (IS, _) | (_, IS) => true,
            (IX, IX) => true,
            (IX, _) | (_, IX) => false,
            (S, S) => true,
            (S, _) | (_, S) => false,
            (SIX, _) | (_, SIX) | (X, X) => false,
        }
    }

    /// Whether `substitute` can stand in for `required`: every operation
    /// permitted under `required` must be permitted under `substitute`.
    #[must_use]
    pub fn substitutable(substitute: Self, required: Self) -> bool {
        use LockType::{IS, IX, NL, S, SIX, X};
        match required {
            NL => true,
            IS => matches!(substitute, IS | IX | S | SIX | X),
            IX => matches!(substitute, IX | SIX | X),
            S => matches!(substitute, S | SIX | X),
            SIX => matches!(substitute, SIX | X),
            X => matches!(substitute, X),
        }
    }
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NL => "NL",
            Self::IS => "IS",
            Self::IX => "IX",
            Self::S => "S",
            Self::SIX => "SIX",
            Self::X => "X",
        };
        write!(f, "{name}")
    }
}
