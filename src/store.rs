use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::MarketError;
use crate::messages::ApplyOutcome;
use crate::model::{
    Bid, BidAction, Escrow, EscrowKind, EscrowRatio, ListingItem, ListingItemTemplate,
    LockedOutput, Order, OrderItem, OrderStatus, Proposal, ProposalCategory, ProposalOption,
    ProposalOptionResult, ProposalResult, Vote,
};
use crate::tally::ProposalSearchParams;

/// Explicit relation loading: call sites state what they pay for instead of
/// passing string relation paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalLoad {
    Bare,
    WithOptions,
}

#[derive(Debug, Clone)]
pub struct NewBid {
    pub msgid: String,
    pub action: BidAction,
    pub bidder: String,
    pub listing_item_id: i64,
    pub parent_bid_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub hash: String,
    pub buyer: String,
    pub seller: String,
    pub listing_item_id: i64,
}

#[derive(Debug, Clone)]
pub struct ResolvedBid {
    pub child: Bid,
    pub order_item: Option<OrderItem>,
}

#[derive(Debug, Clone)]
pub struct NewListing {
    pub hash: String,
    pub template_id: i64,
    pub seller: String,
    pub price_sats: i64,
    pub expires_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewProposal {
    pub submitter: String,
    pub block_start: i64,
    pub block_end: i64,
    pub hash: String,
    pub category: ProposalCategory,
    pub title: String,
    /// (option_id, description, hash) triples, already hashed by the caller.
    pub options: Vec<(i32, String, String)>,
}

#[derive(Debug, Clone)]
pub struct NewVote {
    pub msgid: String,
    pub voter: String,
    pub proposal_option_id: i64,
    pub block: i64,
    pub weight: i64,
}

/// One aggregated option row handed to `insert_result`.
#[derive(Debug, Clone)]
pub struct OptionTally {
    pub proposal_option_id: i64,
    pub option_id: i32,
    pub weight: i64,
    pub voters: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallySnapshot {
    pub result: ProposalResult,
    pub options: Vec<ProposalOptionResult>,
}

#[async_trait]
pub trait BidStore: Send + Sync {
    async fn insert_bid(&self, bid: NewBid) -> Result<Bid, MarketError>;
    async fn bid_by_id(&self, id: i64) -> Result<Option<Bid>, MarketError>;
    async fn bid_by_msgid(&self, msgid: &str) -> Result<Option<Bid>, MarketError>;
    async fn unresolved_bid(
        &self,
        listing_item_id: i64,
        bidder: &str,
    ) -> Result<Option<Bid>, MarketError>;
    /// Newest root BID for a (listing, bidder) pair, resolved or not.
    async fn latest_root_bid(
        &self,
        listing_item_id: i64,
        bidder: &str,
    ) -> Result<Option<Bid>, MarketError>;
    /// All bids in the chain rooted at `root_id` (root first, then children).
    async fn chain(&self, root_id: i64) -> Result<Vec<Bid>, MarketError>;
    /// Conditional write: mark the parent resolved only if it still is
    /// unresolved, insert the child and (for accepts) the order + item as
    /// one atomic unit. A resolved parent reads as absent, so the losing
    /// side of a race gets `NotFound`.
    async fn resolve_bid(
        &self,
        parent_id: i64,
        child: NewBid,
        order: Option<NewOrder>,
    ) -> Result<ResolvedBid, MarketError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, MarketError>;
    async fn order_item_by_id(&self, id: i64) -> Result<Option<OrderItem>, MarketError>;
    /// Compare-and-set status move; `InvalidState` when the current status
    /// is not `expected`, leaving the row untouched.
    async fn set_item_status(
        &self,
        item_id: i64,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<OrderItem, MarketError>;
    async fn items_by_listing(&self, listing_item_id: i64) -> Result<Vec<OrderItem>, MarketError>;
    async fn items_for_buyer(&self, buyer: &str) -> Result<Vec<OrderItem>, MarketError>;
    async fn items_for_seller(&self, seller: &str) -> Result<Vec<OrderItem>, MarketError>;
}

#[async_trait]
pub trait EscrowStore: Send + Sync {
    async fn escrow_by_template(&self, template_id: i64) -> Result<Option<Escrow>, MarketError>;
    async fn insert_escrow(
        &self,
        template_id: i64,
        kind: EscrowKind,
        ratio: EscrowRatio,
    ) -> Result<Escrow, MarketError>;
    async fn delete_escrow(&self, template_id: i64) -> Result<(), MarketError>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn listing_by_id(&self, id: i64) -> Result<Option<ListingItem>, MarketError>;
    async fn listing_by_hash(&self, hash: &str) -> Result<Option<ListingItem>, MarketError>;
    async fn template_by_id(&self, id: i64) -> Result<Option<ListingItemTemplate>, MarketError>;
    async fn template_has_listings(&self, template_id: i64) -> Result<bool, MarketError>;
    async fn insert_template(&self, owner: &str) -> Result<ListingItemTemplate, MarketError>;
    async fn insert_listing(&self, listing: NewListing) -> Result<ListingItem, MarketError>;
}

#[async_trait]
pub trait OutputStore: Send + Sync {
    /// Unique per (txid, vout); duplicates are rejected with `InvalidState`.
    async fn insert_locked_output(&self, output: LockedOutput) -> Result<(), MarketError>;
    async fn outputs_for_bid(&self, bid_id: i64) -> Result<Vec<LockedOutput>, MarketError>;
}

#[async_trait]
pub trait GovernanceStore: Send + Sync {
    async fn proposal_by_hash(
        &self,
        hash: &str,
        load: ProposalLoad,
    ) -> Result<Option<Proposal>, MarketError>;
    async fn insert_proposal(&self, proposal: NewProposal) -> Result<Proposal, MarketError>;
    async fn insert_vote(&self, vote: NewVote) -> Result<Vote, MarketError>;
    /// All votes for the proposal's options with `block <= snapshot_block`.
    async fn votes_upto(
        &self,
        proposal_id: i64,
        snapshot_block: i64,
    ) -> Result<Vec<Vote>, MarketError>;
    async fn result_for(
        &self,
        proposal_id: i64,
        block: i64,
    ) -> Result<Option<TallySnapshot>, MarketError>;
    /// First writer wins for a (proposal, block) key; a concurrent earlier
    /// insert is returned unchanged instead of duplicated.
    async fn insert_result(
        &self,
        proposal_id: i64,
        block: i64,
        options: Vec<OptionTally>,
    ) -> Result<TallySnapshot, MarketError>;
    async fn search_proposals(
        &self,
        params: &ProposalSearchParams,
    ) -> Result<Vec<Proposal>, MarketError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn applied_outcome(&self, msgid: &str) -> Result<Option<ApplyOutcome>, MarketError>;
    async fn record_applied(&self, msgid: &str, outcome: &ApplyOutcome) -> Result<(), MarketError>;
}

/// Full persistence surface. The engines hold one store behind this so a
/// single backend (memory or Postgres) serves every entity.
pub trait MarketStore:
    BidStore
    + OrderStore
    + EscrowStore
    + ListingStore
    + OutputStore
    + GovernanceStore
    + MessageStore
{
}

impl<T> MarketStore for T where
    T: BidStore
        + OrderStore
        + EscrowStore
        + ListingStore
        + OutputStore
        + GovernanceStore
        + MessageStore
{
}

/// In-memory entity store. The single-process authority used by the test
/// suites; conditional writes run under the map's write lock.
#[derive(Default)]
pub struct MemStore {
    next_id: AtomicI64,
    bids: RwLock<HashMap<i64, Bid>>,
    orders: RwLock<HashMap<i64, Order>>,
    order_items: RwLock<HashMap<i64, OrderItem>>,
    escrows: RwLock<HashMap<i64, Escrow>>,
    outputs: RwLock<HashMap<(String, i32), LockedOutput>>,
    listings: RwLock<HashMap<i64, ListingItem>>,
    templates: RwLock<HashMap<i64, ListingItemTemplate>>,
    proposals: RwLock<HashMap<i64, Proposal>>,
    votes: RwLock<Vec<Vote>>,
    results: RwLock<HashMap<(i64, i64), TallySnapshot>>,
    applied: RwLock<HashMap<String, ApplyOutcome>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self { next_id: AtomicI64::new(1), ..Self::default() }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn build_bid(&self, new: NewBid, resolved: bool) -> Bid {
        Bid {
            id: self.alloc_id(),
            msgid: new.msgid,
            action: new.action,
            bidder: new.bidder,
            listing_item_id: new.listing_item_id,
            parent_bid_id: new.parent_bid_id,
            resolved,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl BidStore for MemStore {
    async fn insert_bid(&self, bid: NewBid) -> Result<Bid, MarketError> {
        let row = self.build_bid(bid, false);
        self.bids.write().await.insert(row.id, row.clone());
        Ok(row)
    }

    async fn bid_by_id(&self, id: i64) -> Result<Option<Bid>, MarketError> {
        Ok(self.bids.read().await.get(&id).cloned())
    }

    async fn bid_by_msgid(&self, msgid: &str) -> Result<Option<Bid>, MarketError> {
        Ok(self
            .bids
            .read()
            .await
            .values()
            .find(|b| b.msgid == msgid)
            .cloned())
    }

    async fn unresolved_bid(
        &self,
        listing_item_id: i64,
        bidder: &str,
    ) -> Result<Option<Bid>, MarketError> {
        Ok(self
            .bids
            .read()
            .await
            .values()
            .filter(|b| {
                b.action == BidAction::Bid
                    && !b.resolved
                    && b.listing_item_id == listing_item_id
                    && b.bidder == bidder
            })
            .max_by_key(|b| (b.created_at, b.id))
            .cloned())
    }

    async fn latest_root_bid(
        &self,
        listing_item_id: i64,
        bidder: &str,
    ) -> Result<Option<Bid>, MarketError> {
        Ok(self
            .bids
            .read()
            .await
            .values()
            .filter(|b| {
                b.action == BidAction::Bid
                    && b.listing_item_id == listing_item_id
                    && b.bidder == bidder
            })
            .max_by_key(|b| (b.created_at, b.id))
            .cloned())
    }

    async fn chain(&self, root_id: i64) -> Result<Vec<Bid>, MarketError> {
        let bids = self.bids.read().await;
        let mut out: Vec<Bid> = bids
            .values()
            .filter(|b| b.id == root_id || b.parent_bid_id == Some(root_id))
            .cloned()
            .collect();
        out.sort_by_key(|b| (b.created_at, b.id));
        Ok(out)
    }

    async fn resolve_bid(
        &self,
        parent_id: i64,
        child: NewBid,
        order: Option<NewOrder>,
    ) -> Result<ResolvedBid, MarketError> {
        // Every map the resolution touches is locked up front, so a
        // reader never observes a resolved parent without its child,
        // order, and item already in place.
        let mut bids = self.bids.write().await;
        let mut orders = self.orders.write().await;
        let mut items = self.order_items.write().await;
        let parent = bids
            .get_mut(&parent_id)
            .ok_or_else(|| MarketError::not_found("unresolved bid", parent_id))?;
        if parent.resolved {
            return Err(MarketError::not_found("unresolved bid", parent_id));
        }
        parent.resolved = true;

        // Child rows are born resolved; only root BIDs carry the flag.
        let child_row = self.build_bid(child, true);
        bids.insert(child_row.id, child_row.clone());

        let order_item = if let Some(new_order) = order {
            let now = Utc::now();
            let order_row = Order {
                id: self.alloc_id(),
                hash: new_order.hash,
                buyer: new_order.buyer,
                seller: new_order.seller,
                created_at: now,
            };
            // The item points back at the root BID, where the buyer's
            // outputs were registered.
            let item_row = OrderItem {
                id: self.alloc_id(),
                order_id: order_row.id,
                bid_id: parent_id,
                listing_item_id: new_order.listing_item_id,
                status: OrderStatus::AwaitingEscrow,
                created_at: now,
                updated_at: now,
            };
            orders.insert(order_row.id, order_row);
            items.insert(item_row.id, item_row.clone());
            Some(item_row)
        } else {
            None
        };

        Ok(ResolvedBid { child: child_row, order_item })
    }
}

#[async_trait]
impl OrderStore for MemStore {
    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, MarketError> {
        Ok(self.orders.read().await.get(&id).cloned())
    }

    async fn order_item_by_id(&self, id: i64) -> Result<Option<OrderItem>, MarketError> {
        Ok(self.order_items.read().await.get(&id).cloned())
    }

    async fn set_item_status(
        &self,
        item_id: i64,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<OrderItem, MarketError> {
        let mut items = self.order_items.write().await;
        let item = items
            .get_mut(&item_id)
            .ok_or_else(|| MarketError::not_found("order item", item_id))?;
        if item.status != expected {
            return Err(MarketError::invalid_state(format!(
                "order item {item_id} is {}, expected {}",
                item.status.as_str(),
                expected.as_str()
            )));
        }
        item.status = next;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn items_by_listing(&self, listing_item_id: i64) -> Result<Vec<OrderItem>, MarketError> {
        let mut out: Vec<OrderItem> = self
            .order_items
            .read()
            .await
            .values()
            .filter(|i| i.listing_item_id == listing_item_id)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.id);
        Ok(out)
    }

    async fn items_for_buyer(&self, buyer: &str) -> Result<Vec<OrderItem>, MarketError> {
        let orders = self.orders.read().await;
        let ids: Vec<i64> = orders
            .values()
            .filter(|o| o.buyer == buyer)
            .map(|o| o.id)
            .collect();
        drop(orders);
        let mut out: Vec<OrderItem> = self
            .order_items
            .read()
            .await
            .values()
            .filter(|i| ids.contains(&i.order_id))
            .cloned()
            .collect();
        out.sort_by_key(|i| i.id);
        Ok(out)
    }

    async fn items_for_seller(&self, seller: &str) -> Result<Vec<OrderItem>, MarketError> {
        let orders = self.orders.read().await;
        let ids: Vec<i64> = orders
            .values()
            .filter(|o| o.seller == seller)
            .map(|o| o.id)
            .collect();
        drop(orders);
        let mut out: Vec<OrderItem> = self
            .order_items
            .read()
            .await
            .values()
            .filter(|i| ids.contains(&i.order_id))
            .cloned()
            .collect();
        out.sort_by_key(|i| i.id);
        Ok(out)
    }
}

#[async_trait]
impl EscrowStore for MemStore {
    async fn escrow_by_template(&self, template_id: i64) -> Result<Option<Escrow>, MarketError> {
        Ok(self.escrows.read().await.get(&template_id).cloned())
    }

    async fn insert_escrow(
        &self,
        template_id: i64,
        kind: EscrowKind,
        ratio: EscrowRatio,
    ) -> Result<Escrow, MarketError> {
        let mut escrows = self.escrows.write().await;
        if escrows.contains_key(&template_id) {
            return Err(MarketError::invalid_state(format!(
                "template {template_id} already has an escrow"
            )));
        }
        let row = Escrow {
            id: self.alloc_id(),
            listing_item_template_id: template_id,
            kind,
            ratio,
            created_at: Utc::now(),
        };
        escrows.insert(template_id, row.clone());
        Ok(row)
    }

    async fn delete_escrow(&self, template_id: i64) -> Result<(), MarketError> {
        match self.escrows.write().await.remove(&template_id) {
            Some(_) => Ok(()),
            None => Err(MarketError::not_found("escrow for template", template_id)),
        }
    }
}

#[async_trait]
impl ListingStore for MemStore {
    async fn listing_by_id(&self, id: i64) -> Result<Option<ListingItem>, MarketError> {
        Ok(self.listings.read().await.get(&id).cloned())
    }

    async fn listing_by_hash(&self, hash: &str) -> Result<Option<ListingItem>, MarketError> {
        Ok(self
            .listings
            .read()
            .await
            .values()
            .find(|l| l.hash == hash)
            .cloned())
    }

    async fn template_by_id(&self, id: i64) -> Result<Option<ListingItemTemplate>, MarketError> {
        Ok(self.templates.read().await.get(&id).cloned())
    }

    async fn template_has_listings(&self, template_id: i64) -> Result<bool, MarketError> {
        Ok(self
            .listings
            .read()
            .await
            .values()
            .any(|l| l.template_id == template_id))
    }

    async fn insert_template(&self, owner: &str) -> Result<ListingItemTemplate, MarketError> {
        let row = ListingItemTemplate {
            id: self.alloc_id(),
            owner: owner.to_string(),
            created_at: Utc::now(),
        };
        self.templates.write().await.insert(row.id, row.clone());
        Ok(row)
    }

    async fn insert_listing(&self, listing: NewListing) -> Result<ListingItem, MarketError> {
        let row = ListingItem {
            id: self.alloc_id(),
            hash: listing.hash,
            template_id: listing.template_id,
            seller: listing.seller,
            price_sats: listing.price_sats,
            expires_at: listing.expires_at,
            created_at: Utc::now(),
        };
        self.listings.write().await.insert(row.id, row.clone());
        Ok(row)
    }
}

#[async_trait]
impl OutputStore for MemStore {
    async fn insert_locked_output(&self, output: LockedOutput) -> Result<(), MarketError> {
        let key = (output.txid.clone(), output.vout);
        let mut outputs = self.outputs.write().await;
        if outputs.contains_key(&key) {
            return Err(MarketError::invalid_state(format!(
                "output {}:{} is already locked",
                key.0, key.1
            )));
        }
        outputs.insert(key, output);
        Ok(())
    }

    async fn outputs_for_bid(&self, bid_id: i64) -> Result<Vec<LockedOutput>, MarketError> {
        let mut out: Vec<LockedOutput> = self
            .outputs
            .read()
            .await
            .values()
            .filter(|o| o.bid_id == bid_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| (&a.txid, a.vout).cmp(&(&b.txid, b.vout)));
        Ok(out)
    }
}

#[async_trait]
impl GovernanceStore for MemStore {
    async fn proposal_by_hash(
        &self,
        hash: &str,
        load: ProposalLoad,
    ) -> Result<Option<Proposal>, MarketError> {
        let proposals = self.proposals.read().await;
        Ok(proposals.values().find(|p| p.hash == hash).map(|p| {
            let mut row = p.clone();
            if load == ProposalLoad::Bare {
                row.options = Vec::new();
            }
            row
        }))
    }

    async fn insert_proposal(&self, proposal: NewProposal) -> Result<Proposal, MarketError> {
        let mut proposals = self.proposals.write().await;
        if proposals.values().any(|p| p.hash == proposal.hash) {
            return Err(MarketError::invalid_state(format!(
                "proposal {} already exists",
                proposal.hash
            )));
        }
        let proposal_id = self.alloc_id();
        let options = proposal
            .options
            .into_iter()
            .map(|(option_id, description, hash)| ProposalOption {
                id: self.alloc_id(),
                proposal_id,
                option_id,
                description,
                hash,
            })
            .collect();
        let row = Proposal {
            id: proposal_id,
            submitter: proposal.submitter,
            block_start: proposal.block_start,
            block_end: proposal.block_end,
            hash: proposal.hash,
            category: proposal.category,
            title: proposal.title,
            options,
            created_at: Utc::now(),
        };
        proposals.insert(proposal_id, row.clone());
        Ok(row)
    }

    async fn insert_vote(&self, vote: NewVote) -> Result<Vote, MarketError> {
        let row = Vote {
            id: self.alloc_id(),
            msgid: vote.msgid,
            voter: vote.voter,
            proposal_option_id: vote.proposal_option_id,
            block: vote.block,
            weight: vote.weight,
            created_at: Utc::now(),
        };
        self.votes.write().await.push(row.clone());
        Ok(row)
    }

    async fn votes_upto(
        &self,
        proposal_id: i64,
        snapshot_block: i64,
    ) -> Result<Vec<Vote>, MarketError> {
        let option_ids: Vec<i64> = {
            let proposals = self.proposals.read().await;
            match proposals.get(&proposal_id) {
                Some(p) => p.options.iter().map(|o| o.id).collect(),
                None => return Err(MarketError::not_found("proposal", proposal_id)),
            }
        };
        let mut out: Vec<Vote> = self
            .votes
            .read()
            .await
            .iter()
            .filter(|v| v.block <= snapshot_block && option_ids.contains(&v.proposal_option_id))
            .cloned()
            .collect();
        out.sort_by_key(|v| v.id);
        Ok(out)
    }

    async fn result_for(
        &self,
        proposal_id: i64,
        block: i64,
    ) -> Result<Option<TallySnapshot>, MarketError> {
        Ok(self.results.read().await.get(&(proposal_id, block)).cloned())
    }

    async fn insert_result(
        &self,
        proposal_id: i64,
        block: i64,
        options: Vec<OptionTally>,
    ) -> Result<TallySnapshot, MarketError> {
        let mut results = self.results.write().await;
        if let Some(existing) = results.get(&(proposal_id, block)) {
            return Ok(existing.clone());
        }
        let result = ProposalResult {
            id: self.alloc_id(),
            proposal_id,
            block,
            created_at: Utc::now(),
        };
        let option_rows: Vec<ProposalOptionResult> = options
            .into_iter()
            .map(|t| ProposalOptionResult {
                proposal_result_id: result.id,
                proposal_option_id: t.proposal_option_id,
                option_id: t.option_id,
                weight: t.weight,
                voters: t.voters,
            })
            .collect();
        let snapshot = TallySnapshot { result, options: option_rows };
        results.insert((proposal_id, block), snapshot.clone());
        Ok(snapshot)
    }

    async fn search_proposals(
        &self,
        params: &ProposalSearchParams,
    ) -> Result<Vec<Proposal>, MarketError> {
        let proposals = self.proposals.read().await;
        let mut out: Vec<Proposal> = proposals
            .values()
            .filter(|p| params.matches(p))
            .cloned()
            .collect();
        params.sort(&mut out);
        out.truncate(params.limit);
        Ok(out)
    }
}

#[async_trait]
impl MessageStore for MemStore {
    async fn applied_outcome(&self, msgid: &str) -> Result<Option<ApplyOutcome>, MarketError> {
        Ok(self.applied.read().await.get(msgid).cloned())
    }

    async fn record_applied(
        &self,
        msgid: &str,
        outcome: &ApplyOutcome,
    ) -> Result<(), MarketError> {
        self.applied
            .write()
            .await
            .insert(msgid.to_string(), outcome.clone());
        Ok(())
    }
}
