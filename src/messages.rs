use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::bids::{BidEngine, BidOutput};
use crate::error::MarketError;
use crate::gateway::WalletGateway;
use crate::state::MarketState;
use crate::store::MarketStore;
use crate::tally::TallyEngine;

/// Signed action received from the network. The transport has already
/// verified the signature; `sender` is the authenticated identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMessage {
    /// Stable message identifier; the unit of idempotency.
    pub msgid: String,
    pub sender: String,
    pub received_at: DateTime<Utc>,
    pub payload: ActionPayload,
}

/// Action body. Resolution actions and votes reference prior messages and
/// entities by their stable identifiers, never by local row ids, so a
/// message means the same thing on every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionPayload {
    Bid {
        listing_hash: String,
        #[serde(default)]
        outputs: Vec<BidOutput>,
    },
    Accept { bid_msgid: String },
    Reject { bid_msgid: String },
    Cancel { bid_msgid: String },
    Vote {
        proposal_hash: String,
        option_id: i32,
        weight: i64,
        block: Option<i64>,
    },
}

/// What applying a message did. Journaled under the msgid so replays
/// observe the original effect instead of re-running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    BidOpened { bid_id: i64 },
    BidResolved { bid_id: i64, order_item_id: Option<i64> },
    VoteRecorded { vote_id: i64 },
}

/// Entry point for network messages: dedupe, dispatch to the engines,
/// journal the outcome. Only successful applications are journaled, so an
/// out-of-order message that fails (say an ACCEPT before its BID) can be
/// redelivered and land later.
pub struct MessageProcessor {
    store: Arc<dyn MarketStore>,
    state: Arc<MarketState>,
    bids: BidEngine,
    tally: TallyEngine,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn MarketStore>,
        gateway: Arc<dyn WalletGateway>,
        state: Arc<MarketState>,
    ) -> Self {
        let bids = BidEngine::new(store.clone(), gateway.clone(), state.clone());
        let tally = TallyEngine::new(store.clone(), gateway, state.clone());
        Self { store, state, bids, tally }
    }

    pub async fn apply(&self, msg: &ActionMessage) -> Result<ApplyOutcome, MarketError> {
        if let Some(outcome) = self.state.cached_outcome(&msg.msgid) {
            self.state.counters.messages_duplicate.fetch_add(1, Ordering::Relaxed);
            debug!("[messages] duplicate msgid={} (cache)", msg.msgid);
            return Ok(outcome);
        }

        // Concurrent deliveries of the same msgid serialize here; the
        // loser re-reads the journal and returns the recorded outcome.
        let _guard = self.state.lock_message(&msg.msgid).await;
        if let Some(outcome) = self.state.cached_outcome(&msg.msgid) {
            self.state.counters.messages_duplicate.fetch_add(1, Ordering::Relaxed);
            debug!("[messages] duplicate msgid={} (cache)", msg.msgid);
            return Ok(outcome);
        }
        if let Some(outcome) = self.store.applied_outcome(&msg.msgid).await? {
            self.state.counters.messages_duplicate.fetch_add(1, Ordering::Relaxed);
            self.state.cache_outcome(&msg.msgid, &outcome);
            debug!("[messages] duplicate msgid={} (journal)", msg.msgid);
            return Ok(outcome);
        }

        let outcome = self.dispatch(msg).await?;
        self.store.record_applied(&msg.msgid, &outcome).await?;
        self.state.cache_outcome(&msg.msgid, &outcome);
        Ok(outcome)
    }

    async fn dispatch(&self, msg: &ActionMessage) -> Result<ApplyOutcome, MarketError> {
        match &msg.payload {
            ActionPayload::Bid { listing_hash, outputs } => {
                let bid = self
                    .bids
                    .receive_bid(&msg.msgid, &msg.sender, listing_hash, outputs.clone())
                    .await?;
                Ok(ApplyOutcome::BidOpened { bid_id: bid.id })
            }
            ActionPayload::Accept { bid_msgid } => {
                let parent = self.parent_bid(bid_msgid).await?;
                let resolved = self.bids.accept_bid(&msg.msgid, &msg.sender, parent).await?;
                Ok(ApplyOutcome::BidResolved {
                    bid_id: parent,
                    order_item_id: resolved.order_item.map(|i| i.id),
                })
            }
            ActionPayload::Reject { bid_msgid } => {
                let parent = self.parent_bid(bid_msgid).await?;
                self.bids.reject_bid(&msg.msgid, &msg.sender, parent).await?;
                Ok(ApplyOutcome::BidResolved { bid_id: parent, order_item_id: None })
            }
            ActionPayload::Cancel { bid_msgid } => {
                let parent = self.parent_bid(bid_msgid).await?;
                self.bids.cancel_bid(&msg.msgid, &msg.sender, parent).await?;
                Ok(ApplyOutcome::BidResolved { bid_id: parent, order_item_id: None })
            }
            ActionPayload::Vote { proposal_hash, option_id, weight, block } => {
                let vote = self
                    .tally
                    .cast_vote(&msg.msgid, &msg.sender, proposal_hash, *option_id, *weight, *block)
                    .await?;
                Ok(ApplyOutcome::VoteRecorded { vote_id: vote.id })
            }
        }
    }

    async fn parent_bid(&self, bid_msgid: &str) -> Result<i64, MarketError> {
        self.store
            .bid_by_msgid(bid_msgid)
            .await?
            .map(|b| b.id)
            .ok_or_else(|| MarketError::not_found("bid", bid_msgid))
    }
}
