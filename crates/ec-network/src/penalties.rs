//! Penalty definitions for peer misbehaviors.
//!
//! Penalties accumulate on a peer's score and decay over time. A peer whose
//! penalty crosses the ban threshold is dropped from the registry and banned
//! for a while, so a single hostile peer cannot stall sync for everyone else.

/// Penalty amounts for various peer misbehaviors.
pub struct Penalties;

impl Penalties {
    // ========== Moderate (20-60 points) ==========

    /// Response did not match what was asked for.
    pub const UNREQUESTED_DATA: u32 = 30;

    /// Response was structurally broken.
    pub const MALFORMED_RESPONSE: u32 = 40;

    /// Body or receipts did not match the header commitment.
    pub const COMMITMENT_MISMATCH: u32 = 50;

    /// Trie node or code did not hash to the requested key.
    pub const CONTENT_MISMATCH: u32 = 50;

    // ========== Severe (100-150 points) ==========

    /// Headers with broken parent linkage or non-monotonic numbers.
    pub const BROKEN_CHAIN: u32 = 100;

    /// Propagated a block that failed internal validation.
    pub const INVALID_BLOCK: u32 = 100;

    /// Exceeded the announcement budget.
    pub const ANNOUNCEMENT_FLOOD: u32 = 150;

    // ========== Critical (instant ban) ==========

    /// Malicious behavior detected.
    pub const MALICIOUS_BEHAVIOR: u32 = 1000;

    // ========== Thresholds and decay ==========

    /// Penalty score at which a peer is banned.
    pub const BAN_THRESHOLD: u32 = 500;

    /// Penalty decay per minute.
    pub const DECAY_PER_MINUTE: u32 = 10;

    /// Penalty saturates at this value.
    pub const MAX_PENALTY: u32 = 1000;
}

/// Reward amounts for good peer behavior.
pub struct Rewards;

impl Rewards {
    /// Delivered a requested item set.
    pub const SUCCESSFUL_DELIVERY: i32 = 1;

    /// Answered faster than the fast-response threshold.
    pub const FAST_RESPONSE: i32 = 1;

    /// Reward cap.
    pub const MAX_SCORE: i32 = 100;
}

/// Why a peer was penalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PenaltyReason {
    UnrequestedData,
    MalformedResponse,
    CommitmentMismatch,
    ContentMismatch,
    BrokenChain,
    InvalidBlock,
    AnnouncementFlood,
    MaliciousBehavior,
}

impl PenaltyReason {
    /// Penalty amount for this reason.
    pub fn penalty(&self) -> u32 {
        match self {
            Self::UnrequestedData => Penalties::UNREQUESTED_DATA,
            Self::MalformedResponse => Penalties::MALFORMED_RESPONSE,
            Self::CommitmentMismatch => Penalties::COMMITMENT_MISMATCH,
            Self::ContentMismatch => Penalties::CONTENT_MISMATCH,
            Self::BrokenChain => Penalties::BROKEN_CHAIN,
            Self::InvalidBlock => Penalties::INVALID_BLOCK,
            Self::AnnouncementFlood => Penalties::ANNOUNCEMENT_FLOOD,
            Self::MaliciousBehavior => Penalties::MALICIOUS_BEHAVIOR,
        }
    }

    /// Critical violations ban on first offence.
    pub fn is_critical(&self) -> bool {
        self.penalty() >= Penalties::BAN_THRESHOLD
    }
}

impl std::fmt::Display for PenaltyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UnrequestedData => "unrequested data",
            Self::MalformedResponse => "malformed response",
            Self::CommitmentMismatch => "commitment mismatch",
            Self::ContentMismatch => "content hash mismatch",
            Self::BrokenChain => "broken header chain",
            Self::InvalidBlock => "invalid block",
            Self::AnnouncementFlood => "announcement flood",
            Self::MaliciousBehavior => "malicious behavior",
        };
        f.write_str(s)
    }
}
