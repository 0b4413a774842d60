//! Capacity-relevant competition fields.

use serde::{Deserialize, Serialize};

use crate::types::{CompetitionId, Tokens};

/// Live capacity counters for one competition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Competition {
    /// Competition id.
    pub id: CompetitionId,
    /// Ceiling fixed at setup.
    pub total_tokens: Tokens,
    /// Tokens not yet granted.
    pub available_tokens: Tokens,
}

impl Competition {
    /// Tokens currently granted to reservations.
    pub fn allocated(&self) -> Tokens {
        self.total_tokens - self.available_tokens
    }

    /// True when `0 <= available <= total`.
    pub fn within_bounds(&self) -> bool {
        self.available_tokens >= 0 && self.available_tokens <= self.total_tokens
    }
}

/// Setup payload; available starts equal to total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCompetition {
    /// Competition id.
    pub id: CompetitionId,
    /// Ceiling for the lifetime of the competition.
    pub total_tokens: Tokens,
}
