use std::sync::Arc;
use std::sync::atomic::Ordering;

use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::MarketError;
use crate::gateway::WalletGateway;
use crate::model::{order_hash, Bid, BidAction, LockedOutput};
use crate::state::MarketState;
use crate::store::{MarketStore, NewBid, NewOrder, ResolvedBid};

/// Fund source declared alongside an incoming BID, before a bid row
/// exists to attach it to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidOutput {
    pub txid: String,
    pub vout: i32,
    pub amount_sats: i64,
    pub address: String,
    pub script_pub_key: String,
}

/// Bid chain engine. A chain is rooted at one BID row and resolved by
/// exactly one ACCEPT, REJECT or CANCEL; resolution races collapse to one
/// winner through the store's conditional write.
pub struct BidEngine {
    store: Arc<dyn MarketStore>,
    gateway: Arc<dyn WalletGateway>,
    state: Arc<MarketState>,
}

impl BidEngine {
    pub fn new(
        store: Arc<dyn MarketStore>,
        gateway: Arc<dyn WalletGateway>,
        state: Arc<MarketState>,
    ) -> Self {
        Self { store, gateway, state }
    }

    /// Opens a bid chain on a listing. A bidder holds at most one
    /// unresolved BID per listing; declared outputs are registered against
    /// the new row.
    pub async fn receive_bid(
        &self,
        msgid: &str,
        bidder: &str,
        listing_hash: &str,
        outputs: Vec<BidOutput>,
    ) -> Result<Bid, MarketError> {
        let listing = self
            .store
            .listing_by_hash(listing_hash)
            .await?
            .ok_or_else(|| MarketError::not_found("listing_item", listing_hash))?;
        if listing.is_expired(Utc::now()) {
            return Err(MarketError::invalid_state(format!(
                "listing {} has expired",
                listing.hash
            )));
        }
        if let Some(open) = self.store.unresolved_bid(listing.id, bidder).await? {
            return Err(MarketError::invalid_state(format!(
                "bidder {} already has unresolved bid {} on listing {}",
                bidder, open.id, listing.id
            )));
        }
        let bid = self
            .store
            .insert_bid(NewBid {
                msgid: msgid.to_string(),
                action: BidAction::Bid,
                bidder: bidder.to_string(),
                listing_item_id: listing.id,
                parent_bid_id: None,
            })
            .await?;
        for out in outputs {
            self.store
                .insert_locked_output(LockedOutput {
                    txid: out.txid,
                    vout: out.vout,
                    amount_sats: out.amount_sats,
                    address: out.address,
                    script_pub_key: out.script_pub_key,
                    bid_id: bid.id,
                })
                .await?;
        }
        self.state.counters.bids_received.fetch_add(1, Ordering::Relaxed);
        info!("[bids] received bid={} bidder={} listing={}", bid.id, bidder, listing.id);
        Ok(bid)
    }

    /// Accepts an open bid. Only the owner of the listing's template may
    /// accept; on success the chain is closed and an order item is opened
    /// in `AwaitingEscrow`.
    pub async fn accept_bid(
        &self,
        msgid: &str,
        identity: &str,
        bid_id: i64,
    ) -> Result<ResolvedBid, MarketError> {
        let parent = self.load_open_root(bid_id).await?;
        let listing = self
            .store
            .listing_by_id(parent.listing_item_id)
            .await?
            .ok_or_else(|| MarketError::not_found("listing_item", parent.listing_item_id))?;
        if !self.gateway.owns_template(identity, listing.template_id).await? {
            return Err(MarketError::Unauthorized(format!(
                "{} does not own template {}",
                identity, listing.template_id
            )));
        }
        let order = NewOrder {
            hash: order_hash(&parent.msgid, msgid),
            buyer: parent.bidder.clone(),
            seller: listing.seller.clone(),
            listing_item_id: listing.id,
        };
        let _guard = self.state.lock_chain(parent.id).await;
        let resolved = self
            .store
            .resolve_bid(
                parent.id,
                NewBid {
                    msgid: msgid.to_string(),
                    action: BidAction::Accept,
                    bidder: identity.to_string(),
                    listing_item_id: listing.id,
                    parent_bid_id: Some(parent.id),
                },
                Some(order),
            )
            .await?;
        self.state.counters.bids_resolved.fetch_add(1, Ordering::Relaxed);
        info!(
            "[bids] accepted bid={} by={} order_item={:?}",
            parent.id,
            identity,
            resolved.order_item.as_ref().map(|i| i.id)
        );
        Ok(resolved)
    }

    /// Rejects an open bid; same authority as accept, no order is created.
    pub async fn reject_bid(
        &self,
        msgid: &str,
        identity: &str,
        bid_id: i64,
    ) -> Result<ResolvedBid, MarketError> {
        let parent = self.load_open_root(bid_id).await?;
        let listing = self
            .store
            .listing_by_id(parent.listing_item_id)
            .await?
            .ok_or_else(|| MarketError::not_found("listing_item", parent.listing_item_id))?;
        if !self.gateway.owns_template(identity, listing.template_id).await? {
            return Err(MarketError::Unauthorized(format!(
                "{} does not own template {}",
                identity, listing.template_id
            )));
        }
        let resolved = self
            .resolve_without_order(&parent, msgid, identity, BidAction::Reject)
            .await?;
        self.state.counters.bids_rejected.fetch_add(1, Ordering::Relaxed);
        info!("[bids] rejected bid={} by={}", parent.id, identity);
        Ok(resolved)
    }

    /// Withdraws an open bid. Only the original bidder may cancel.
    pub async fn cancel_bid(
        &self,
        msgid: &str,
        identity: &str,
        bid_id: i64,
    ) -> Result<ResolvedBid, MarketError> {
        let parent = self.load_open_root(bid_id).await?;
        if parent.bidder != identity {
            return Err(MarketError::Unauthorized(format!(
                "{} is not the bidder of bid {}",
                identity, parent.id
            )));
        }
        let resolved = self
            .resolve_without_order(&parent, msgid, identity, BidAction::Cancel)
            .await?;
        info!("[bids] cancelled bid={} by={}", parent.id, identity);
        Ok(resolved)
    }

    /// Current state of a bidder's chain on a listing: the action of the
    /// newest row in the chain rooted at their latest BID, picked by
    /// greatest (created_at, id). An untouched root reports `Bid`.
    pub async fn current_status(
        &self,
        listing_hash: &str,
        bidder: &str,
    ) -> Result<BidAction, MarketError> {
        let listing = self
            .store
            .listing_by_hash(listing_hash)
            .await?
            .ok_or_else(|| MarketError::not_found("listing_item", listing_hash))?;
        let root = self
            .store
            .latest_root_bid(listing.id, bidder)
            .await?
            .ok_or_else(|| MarketError::not_found("bid", format!("{bidder}@{listing_hash}")))?;
        let chain = self.store.chain(root.id).await?;
        chain
            .into_iter()
            .max_by_key(|b| (b.created_at, b.id))
            .map(|b| b.action)
            .ok_or_else(|| MarketError::not_found("bid", root.id))
    }

    async fn load_open_root(&self, bid_id: i64) -> Result<Bid, MarketError> {
        let bid = self
            .store
            .bid_by_id(bid_id)
            .await?
            .ok_or_else(|| MarketError::not_found("bid", bid_id))?;
        if bid.action != BidAction::Bid {
            return Err(MarketError::invalid_state(format!(
                "bid {} is a {} row, not a chain root",
                bid.id,
                bid.action.as_str()
            )));
        }
        // A resolved chain has taken its one edge; the bid is no longer
        // there to act on.
        if bid.resolved {
            return Err(MarketError::not_found("unresolved bid", bid.id));
        }
        Ok(bid)
    }

    async fn resolve_without_order(
        &self,
        parent: &Bid,
        msgid: &str,
        identity: &str,
        action: BidAction,
    ) -> Result<ResolvedBid, MarketError> {
        let _guard = self.state.lock_chain(parent.id).await;
        self.store
            .resolve_bid(
                parent.id,
                NewBid {
                    msgid: msgid.to_string(),
                    action,
                    bidder: identity.to_string(),
                    listing_item_id: parent.listing_item_id,
                    parent_bid_id: Some(parent.id),
                },
                None,
            )
            .await
    }
}
