use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MarketError;

/// Action carried by a bid message. `Bid` opens a chain; the other three
/// resolve it. A chain takes exactly one outgoing edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidAction {
    Bid,
    Accept,
    Reject,
    Cancel,
}

impl BidAction {
    pub fn as_str(self) -> &'static str {
        match self {
            BidAction::Bid => "BID",
            BidAction::Accept => "ACCEPT",
            BidAction::Reject => "REJECT",
            BidAction::Cancel => "CANCEL",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "BID" => Some(BidAction::Bid),
            "ACCEPT" => Some(BidAction::Accept),
            "REJECT" => Some(BidAction::Reject),
            "CANCEL" => Some(BidAction::Cancel),
            _ => None,
        }
    }

    pub fn resolves(self) -> bool {
        !matches!(self, BidAction::Bid)
    }
}

/// Order lifecycle marker. The first four form a strictly forward ladder;
/// `Refunded` is a terminal exit reachable only from the middle of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    AwaitingEscrow,
    EscrowLocked,
    Shipping,
    Complete,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::AwaitingEscrow => "AWAITING_ESCROW",
            OrderStatus::EscrowLocked => "ESCROW_LOCKED",
            OrderStatus::Shipping => "SHIPPING",
            OrderStatus::Complete => "COMPLETE",
            OrderStatus::Refunded => "REFUNDED",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "AWAITING_ESCROW" => Some(OrderStatus::AwaitingEscrow),
            "ESCROW_LOCKED" => Some(OrderStatus::EscrowLocked),
            "SHIPPING" => Some(OrderStatus::Shipping),
            "COMPLETE" => Some(OrderStatus::Complete),
            "REFUNDED" => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    /// Position on the forward ladder; `Refunded` sits outside it.
    fn rank(self) -> Option<u8> {
        match self {
            OrderStatus::AwaitingEscrow => Some(0),
            OrderStatus::EscrowLocked => Some(1),
            OrderStatus::Shipping => Some(2),
            OrderStatus::Complete => Some(3),
            OrderStatus::Refunded => None,
        }
    }

    /// Single authority for legal status moves. Ladder moves advance by
    /// exactly one step; release from `EscrowLocked` walks through
    /// `Shipping` so observers never see a skipped step.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        match (self, next) {
            (OrderStatus::EscrowLocked, OrderStatus::Refunded)
            | (OrderStatus::Shipping, OrderStatus::Refunded) => true,
            (_, OrderStatus::Refunded) => false,
            (OrderStatus::Refunded, _) => false,
            (cur, nxt) => match (cur.rank(), nxt.rank()) {
                (Some(a), Some(b)) => b == a + 1,
                _ => false,
            },
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Complete | OrderStatus::Refunded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscrowKind {
    NoArbitration,
    MultiAuthDispute,
}

impl EscrowKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EscrowKind::NoArbitration => "no-arbitration",
            EscrowKind::MultiAuthDispute => "multi-auth-dispute",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "no-arbitration" => Some(EscrowKind::NoArbitration),
            "multi-auth-dispute" => Some(EscrowKind::MultiAuthDispute),
            _ => None,
        }
    }
}

/// Buyer/seller weighting (integer percent) used to authorize fund moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRatio {
    pub buyer: i64,
    pub seller: i64,
}

impl EscrowRatio {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.buyer <= 0 {
            return Err(MarketError::invalid_parameter("ratio.buyer", "must be positive"));
        }
        if self.seller <= 0 {
            return Err(MarketError::invalid_parameter("ratio.seller", "must be positive"));
        }
        Ok(())
    }

    /// Amount the buyer must have locked for a given item price.
    pub fn buyer_requirement(&self, price_sats: i64) -> i64 {
        price_sats.saturating_add(price_sats.saturating_mul(self.buyer) / 100)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProposalCategory {
    ItemFlag,
    PublicVote,
}

impl ProposalCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ProposalCategory::ItemFlag => "ITEM_FLAG",
            ProposalCategory::PublicVote => "PUBLIC_VOTE",
        }
    }

    pub fn from_str(raw: &str) -> Option<Self> {
        match raw {
            "ITEM_FLAG" => Some(ProposalCategory::ItemFlag),
            "PUBLIC_VOTE" => Some(ProposalCategory::PublicVote),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub id: i64,
    /// Stable identifier of the message that produced this row.
    pub msgid: String,
    pub action: BidAction,
    pub bidder: String,
    pub listing_item_id: i64,
    pub parent_bid_id: Option<i64>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    pub hash: String,
    pub buyer: String,
    pub seller: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub bid_id: i64,
    pub listing_item_id: i64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Escrow {
    pub id: i64,
    pub listing_item_template_id: i64,
    pub kind: EscrowKind,
    pub ratio: EscrowRatio,
    pub created_at: DateTime<Utc>,
}

/// Reserved fund source tied to a bid; unique per (txid, vout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedOutput {
    pub txid: String,
    pub vout: i32,
    pub amount_sats: i64,
    pub address: String,
    pub script_pub_key: String,
    pub bid_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingItem {
    pub id: i64,
    pub hash: String,
    pub template_id: i64,
    pub seller: String,
    pub price_sats: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ListingItem {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|e| e <= now).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingItemTemplate {
    pub id: i64,
    pub owner: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: i64,
    pub submitter: String,
    pub block_start: i64,
    pub block_end: i64,
    pub hash: String,
    pub category: ProposalCategory,
    pub title: String,
    /// Loaded only when requested with `ProposalLoad::WithOptions`.
    #[serde(default)]
    pub options: Vec<ProposalOption>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalOption {
    pub id: i64,
    pub proposal_id: i64,
    pub option_id: i32,
    pub description: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: i64,
    pub msgid: String,
    pub voter: String,
    pub proposal_option_id: i64,
    pub block: i64,
    pub weight: i64,
    pub created_at: DateTime<Utc>,
}

/// Frozen tally header. Immutable once created for a (proposal, block) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalResult {
    pub id: i64,
    pub proposal_id: i64,
    pub block: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalOptionResult {
    pub proposal_result_id: i64,
    pub proposal_option_id: i64,
    pub option_id: i32,
    pub weight: i64,
    pub voters: i64,
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Deterministic proposal hash: submitter, window and title pin identity
/// so the same submission always resolves to the same row.
pub fn proposal_hash(submitter: &str, block_start: i64, block_end: i64, title: &str) -> String {
    sha256_hex(&[
        submitter,
        &block_start.to_string(),
        &block_end.to_string(),
        title,
    ])
}

/// Order identity is pinned to the two messages that formed it, so the
/// same accepted bid always maps to the same order row.
pub fn order_hash(bid_msgid: &str, accept_msgid: &str) -> String {
    sha256_hex(&[bid_msgid, accept_msgid])
}

/// Option hashes are unique within a proposal, not globally.
pub fn option_hash(proposal_hash: &str, option_id: i32, description: &str) -> String {
    sha256_hex(&[proposal_hash, &option_id.to_string(), description])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ladder_is_forward_only() {
        use OrderStatus::*;
        assert!(AwaitingEscrow.can_transition_to(EscrowLocked));
        assert!(EscrowLocked.can_transition_to(Shipping));
        assert!(Shipping.can_transition_to(Complete));

        assert!(!EscrowLocked.can_transition_to(Complete));
        assert!(!EscrowLocked.can_transition_to(AwaitingEscrow));
        assert!(!Shipping.can_transition_to(EscrowLocked));
        assert!(!AwaitingEscrow.can_transition_to(Shipping));
        assert!(!AwaitingEscrow.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Shipping));
    }

    #[test]
    fn refund_exits_only_from_locked_or_shipping() {
        use OrderStatus::*;
        assert!(EscrowLocked.can_transition_to(Refunded));
        assert!(Shipping.can_transition_to(Refunded));
        assert!(!AwaitingEscrow.can_transition_to(Refunded));
        assert!(!Complete.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(AwaitingEscrow));
        assert!(Refunded.is_terminal());
    }

    #[test]
    fn ratio_guards_positive_values() {
        assert!(EscrowRatio { buyer: 100, seller: 100 }.validate().is_ok());
        assert!(EscrowRatio { buyer: 0, seller: 100 }.validate().is_err());
        assert!(EscrowRatio { buyer: 100, seller: -5 }.validate().is_err());
    }

    #[test]
    fn hashes_are_stable_and_distinct() {
        let a = proposal_hash("alice", 10, 20, "flag item");
        let b = proposal_hash("alice", 10, 20, "flag item");
        let c = proposal_hash("alice", 10, 21, "flag item");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(option_hash(&a, 0, "keep"), option_hash(&a, 1, "remove"));
    }
}
