//! Hydration levels
//!
//! A code object moves through four levels in order and never moves back:
//!
//! ```text
//! Dehydrated -> PartiallyHydrated -> FullyHydrated -> Compiled
//! ```
//!
//! - **PartiallyHydrated**: scalar fields, names and code bytes decoded;
//!   constant slots still unresolved
//! - **FullyHydrated**: every constant slot materialized
//! - **Compiled**: detached from the container, independently owned

use serde::{Deserialize, Serialize};

/// Hydration level of a code object
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum HydrationLevel {
    /// Only the table index is known
    #[default]
    Dehydrated,
    /// Fields decoded, constants pending
    PartiallyHydrated,
    /// All constants materialized
    FullyHydrated,
    /// Detached from the container
    Compiled,
}

impl HydrationLevel {
    /// The level after this one, `None` at [`HydrationLevel::Compiled`]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Dehydrated => Some(Self::PartiallyHydrated),
            Self::PartiallyHydrated => Some(Self::FullyHydrated),
            Self::FullyHydrated => Some(Self::Compiled),
            Self::Compiled => None,
        }
    }

    /// Move forward to `target`.
    ///
    /// Returns `true` if the level changed. A target at or below the current
    /// level leaves it untouched.
    pub fn advance(&mut self, target: Self) -> bool {
        if target > *self {
            *self = target;
            true
        } else {
            false
        }
    }

    /// Lowercase name for logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dehydrated => "dehydrated",
            Self::PartiallyHydrated => "partially-hydrated",
            Self::FullyHydrated => "fully-hydrated",
            Self::Compiled => "compiled",
        }
    }
}

impl std::fmt::Display for HydrationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order() {
        assert!(HydrationLevel::Dehydrated < HydrationLevel::PartiallyHydrated);
        assert!(HydrationLevel::FullyHydrated < HydrationLevel::Compiled);
        assert_eq!(
            HydrationLevel::Dehydrated.next(),
            Some(HydrationLevel::PartiallyHydrated)
        );
        assert_eq!(HydrationLevel::Compiled.next(), None);
    }

    #[test]
    fn test_advance_never_regresses() {
        let mut level = HydrationLevel::default();
        assert!(level.advance(HydrationLevel::FullyHydrated));
        assert!(!level.advance(HydrationLevel::PartiallyHydrated));
        assert!(!level.advance(HydrationLevel::FullyHydrated));
        assert_eq!(level, HydrationLevel::FullyHydrated);
    }
}
