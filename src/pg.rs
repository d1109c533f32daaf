use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::info;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::config::DatabaseConfig;
use crate::error::MarketError;
use crate::messages::ApplyOutcome;
use crate::model::{
    Bid, BidAction, Escrow, EscrowKind, EscrowRatio, ListingItem, ListingItemTemplate,
    LockedOutput, Order, OrderItem, OrderStatus, Proposal, ProposalCategory, ProposalOption,
    ProposalOptionResult, ProposalResult, Vote,
};
use crate::store::{
    BidStore, EscrowStore, GovernanceStore, ListingStore, MessageStore, NewBid, NewListing,
    NewOrder, NewProposal, NewVote, OptionTally, OrderStore, OutputStore, ProposalLoad,
    ResolvedBid, TallySnapshot,
};
use crate::tally::{BlockQuery, ProposalSearchParams, SortOrder};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS listing_item_templates (
    id BIGSERIAL PRIMARY KEY,
    owner_identity TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS listing_items (
    id BIGSERIAL PRIMARY KEY,
    hash TEXT NOT NULL UNIQUE,
    template_id BIGINT NOT NULL REFERENCES listing_item_templates(id),
    seller TEXT NOT NULL,
    price_sats BIGINT NOT NULL,
    expires_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_listing_items_template ON listing_items (template_id);

CREATE TABLE IF NOT EXISTS escrows (
    id BIGSERIAL PRIMARY KEY,
    listing_item_template_id BIGINT NOT NULL UNIQUE REFERENCES listing_item_templates(id),
    kind TEXT NOT NULL,
    ratio_buyer BIGINT NOT NULL,
    ratio_seller BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS bids (
    id BIGSERIAL PRIMARY KEY,
    msgid TEXT NOT NULL UNIQUE,
    action TEXT NOT NULL,
    bidder TEXT NOT NULL,
    listing_item_id BIGINT NOT NULL REFERENCES listing_items(id),
    parent_bid_id BIGINT REFERENCES bids(id),
    resolved BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_bids_listing_bidder ON bids (listing_item_id, bidder);
CREATE INDEX IF NOT EXISTS idx_bids_parent ON bids (parent_bid_id);

CREATE TABLE IF NOT EXISTS locked_outputs (
    txid TEXT NOT NULL,
    vout INT NOT NULL,
    amount_sats BIGINT NOT NULL,
    address TEXT NOT NULL,
    script_pub_key TEXT NOT NULL,
    bid_id BIGINT NOT NULL REFERENCES bids(id),
    PRIMARY KEY (txid, vout)
);
CREATE INDEX IF NOT EXISTS idx_locked_outputs_bid ON locked_outputs (bid_id);

CREATE TABLE IF NOT EXISTS orders (
    id BIGSERIAL PRIMARY KEY,
    hash TEXT NOT NULL UNIQUE,
    buyer TEXT NOT NULL,
    seller TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS order_items (
    id BIGSERIAL PRIMARY KEY,
    order_id BIGINT NOT NULL REFERENCES orders(id),
    bid_id BIGINT NOT NULL REFERENCES bids(id),
    listing_item_id BIGINT NOT NULL REFERENCES listing_items(id),
    status TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_order_items_listing ON order_items (listing_item_id);

CREATE TABLE IF NOT EXISTS proposals (
    id BIGSERIAL PRIMARY KEY,
    submitter TEXT NOT NULL,
    block_start BIGINT NOT NULL,
    block_end BIGINT NOT NULL,
    hash TEXT NOT NULL UNIQUE,
    category TEXT NOT NULL,
    title TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_proposals_window ON proposals (block_start, block_end);

CREATE TABLE IF NOT EXISTS proposal_options (
    id BIGSERIAL PRIMARY KEY,
    proposal_id BIGINT NOT NULL REFERENCES proposals(id),
    option_id INT NOT NULL,
    description TEXT NOT NULL,
    hash TEXT NOT NULL,
    UNIQUE (proposal_id, option_id)
);

CREATE TABLE IF NOT EXISTS votes (
    id BIGSERIAL PRIMARY KEY,
    msgid TEXT NOT NULL,
    voter TEXT NOT NULL,
    proposal_option_id BIGINT NOT NULL REFERENCES proposal_options(id),
    block BIGINT NOT NULL,
    weight BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
CREATE INDEX IF NOT EXISTS idx_votes_option_block ON votes (proposal_option_id, block);

CREATE TABLE IF NOT EXISTS proposal_results (
    id BIGSERIAL PRIMARY KEY,
    proposal_id BIGINT NOT NULL REFERENCES proposals(id),
    block BIGINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    UNIQUE (proposal_id, block)
);

CREATE TABLE IF NOT EXISTS proposal_option_results (
    proposal_result_id BIGINT NOT NULL REFERENCES proposal_results(id),
    proposal_option_id BIGINT NOT NULL REFERENCES proposal_options(id),
    option_id INT NOT NULL,
    weight BIGINT NOT NULL,
    voters BIGINT NOT NULL,
    PRIMARY KEY (proposal_result_id, proposal_option_id)
);

CREATE TABLE IF NOT EXISTS applied_messages (
    msgid TEXT PRIMARY KEY,
    outcome JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Postgres entity store. Conditional writes are plain UPDATEs guarded by
/// the expected prior state; rows_affected() decides the winner.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self, MarketError> {
        let url = cfg
            .url
            .as_deref()
            .ok_or(MarketError::MissingParameter("DATABASE_URL"))?;
        let pool = PgPoolOptions::new()
            .min_connections(cfg.min_pool_size)
            .max_connections(cfg.max_pool_size)
            .max_lifetime(Duration::from_secs(cfg.max_lifetime_seconds))
            .acquire_timeout(Duration::from_secs(cfg.acquire_timeout_seconds))
            .connect(url)
            .await?;
        info!("[pg] connected max_pool={}", cfg.max_pool_size);
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), MarketError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("[pg] schema ready");
        Ok(())
    }
}

fn parse_action(raw: &str) -> Result<BidAction, MarketError> {
    BidAction::from_str(raw).ok_or_else(|| MarketError::Store(format!("unknown action {raw}")))
}

fn parse_status(raw: &str) -> Result<OrderStatus, MarketError> {
    OrderStatus::from_str(raw).ok_or_else(|| MarketError::Store(format!("unknown status {raw}")))
}

fn parse_kind(raw: &str) -> Result<EscrowKind, MarketError> {
    EscrowKind::from_str(raw).ok_or_else(|| MarketError::Store(format!("unknown escrow kind {raw}")))
}

fn parse_category(raw: &str) -> Result<ProposalCategory, MarketError> {
    ProposalCategory::from_str(raw)
        .ok_or_else(|| MarketError::Store(format!("unknown category {raw}")))
}

fn bid_from_row(row: &PgRow) -> Result<Bid, MarketError> {
    Ok(Bid {
        id: row.try_get("id")?,
        msgid: row.try_get("msgid")?,
        action: parse_action(row.try_get::<&str, _>("action")?)?,
        bidder: row.try_get("bidder")?,
        listing_item_id: row.try_get("listing_item_id")?,
        parent_bid_id: row.try_get("parent_bid_id")?,
        resolved: row.try_get("resolved")?,
        created_at: row.try_get("created_at")?,
    })
}

fn order_from_row(row: &PgRow) -> Result<Order, MarketError> {
    Ok(Order {
        id: row.try_get("id")?,
        hash: row.try_get("hash")?,
        buyer: row.try_get("buyer")?,
        seller: row.try_get("seller")?,
        created_at: row.try_get("created_at")?,
    })
}

fn item_from_row(row: &PgRow) -> Result<OrderItem, MarketError> {
    Ok(OrderItem {
        id: row.try_get("id")?,
        order_id: row.try_get("order_id")?,
        bid_id: row.try_get("bid_id")?,
        listing_item_id: row.try_get("listing_item_id")?,
        status: parse_status(row.try_get::<&str, _>("status")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn escrow_from_row(row: &PgRow) -> Result<Escrow, MarketError> {
    Ok(Escrow {
        id: row.try_get("id")?,
        listing_item_template_id: row.try_get("listing_item_template_id")?,
        kind: parse_kind(row.try_get::<&str, _>("kind")?)?,
        ratio: EscrowRatio {
            buyer: row.try_get("ratio_buyer")?,
            seller: row.try_get("ratio_seller")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn listing_from_row(row: &PgRow) -> Result<ListingItem, MarketError> {
    Ok(ListingItem {
        id: row.try_get("id")?,
        hash: row.try_get("hash")?,
        template_id: row.try_get("template_id")?,
        seller: row.try_get("seller")?,
        price_sats: row.try_get("price_sats")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<ListingItemTemplate, MarketError> {
    Ok(ListingItemTemplate {
        id: row.try_get("id")?,
        owner: row.try_get("owner_identity")?,
        created_at: row.try_get("created_at")?,
    })
}

fn output_from_row(row: &PgRow) -> Result<LockedOutput, MarketError> {
    Ok(LockedOutput {
        txid: row.try_get("txid")?,
        vout: row.try_get("vout")?,
        amount_sats: row.try_get("amount_sats")?,
        address: row.try_get("address")?,
        script_pub_key: row.try_get("script_pub_key")?,
        bid_id: row.try_get("bid_id")?,
    })
}

fn proposal_from_row(row: &PgRow) -> Result<Proposal, MarketError> {
    Ok(Proposal {
        id: row.try_get("id")?,
        submitter: row.try_get("submitter")?,
        block_start: row.try_get("block_start")?,
        block_end: row.try_get("block_end")?,
        hash: row.try_get("hash")?,
        category: parse_category(row.try_get::<&str, _>("category")?)?,
        title: row.try_get("title")?,
        options: Vec::new(),
        created_at: row.try_get("created_at")?,
    })
}

fn option_from_row(row: &PgRow) -> Result<ProposalOption, MarketError> {
    Ok(ProposalOption {
        id: row.try_get("id")?,
        proposal_id: row.try_get("proposal_id")?,
        option_id: row.try_get("option_id")?,
        description: row.try_get("description")?,
        hash: row.try_get("hash")?,
    })
}

fn vote_from_row(row: &PgRow) -> Result<Vote, MarketError> {
    Ok(Vote {
        id: row.try_get("id")?,
        msgid: row.try_get("msgid")?,
        voter: row.try_get("voter")?,
        proposal_option_id: row.try_get("proposal_option_id")?,
        block: row.try_get("block")?,
        weight: row.try_get("weight")?,
        created_at: row.try_get("created_at")?,
    })
}

fn option_result_from_row(row: &PgRow) -> Result<ProposalOptionResult, MarketError> {
    Ok(ProposalOptionResult {
        proposal_result_id: row.try_get("proposal_result_id")?,
        proposal_option_id: row.try_get("proposal_option_id")?,
        option_id: row.try_get("option_id")?,
        weight: row.try_get("weight")?,
        voters: row.try_get("voters")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl BidStore for PgStore {
    async fn insert_bid(&self, bid: NewBid) -> Result<Bid, MarketError> {
        let row = sqlx::query(
            "INSERT INTO bids (msgid, action, bidder, listing_item_id, parent_bid_id, resolved) \
             VALUES ($1, $2, $3, $4, $5, FALSE) RETURNING *",
        )
        .bind(&bid.msgid)
        .bind(bid.action.as_str())
        .bind(&bid.bidder)
        .bind(bid.listing_item_id)
        .bind(bid.parent_bid_id)
        .fetch_one(&self.pool)
        .await?;
        bid_from_row(&row)
    }

    async fn bid_by_id(&self, id: i64) -> Result<Option<Bid>, MarketError> {
        let row = sqlx::query("SELECT * FROM bids WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bid_from_row).transpose()
    }

    async fn bid_by_msgid(&self, msgid: &str) -> Result<Option<Bid>, MarketError> {
        let row = sqlx::query("SELECT * FROM bids WHERE msgid = $1")
            .bind(msgid)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(bid_from_row).transpose()
    }

    async fn unresolved_bid(
        &self,
        listing_item_id: i64,
        bidder: &str,
    ) -> Result<Option<Bid>, MarketError> {
        let row = sqlx::query(
            "SELECT * FROM bids \
             WHERE listing_item_id = $1 AND bidder = $2 AND action = 'BID' AND NOT resolved \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(listing_item_id)
        .bind(bidder)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bid_from_row).transpose()
    }

    async fn latest_root_bid(
        &self,
        listing_item_id: i64,
        bidder: &str,
    ) -> Result<Option<Bid>, MarketError> {
        let row = sqlx::query(
            "SELECT * FROM bids \
             WHERE listing_item_id = $1 AND bidder = $2 AND action = 'BID' \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(listing_item_id)
        .bind(bidder)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bid_from_row).transpose()
    }

    async fn chain(&self, root_id: i64) -> Result<Vec<Bid>, MarketError> {
        let rows = sqlx::query(
            "SELECT * FROM bids WHERE id = $1 OR parent_bid_id = $1 ORDER BY created_at, id",
        )
        .bind(root_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bid_from_row).collect()
    }

    async fn resolve_bid(
        &self,
        parent_id: i64,
        child: NewBid,
        order: Option<NewOrder>,
    ) -> Result<ResolvedBid, MarketError> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query("UPDATE bids SET resolved = TRUE WHERE id = $1 AND NOT resolved")
            .bind(parent_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if claimed == 0 {
            // A resolved parent reads as absent: the chain has taken its
            // one outgoing edge.
            return Err(MarketError::not_found("unresolved bid", parent_id));
        }

        let child_row = sqlx::query(
            "INSERT INTO bids (msgid, action, bidder, listing_item_id, parent_bid_id, resolved) \
             VALUES ($1, $2, $3, $4, $5, TRUE) RETURNING *",
        )
        .bind(&child.msgid)
        .bind(child.action.as_str())
        .bind(&child.bidder)
        .bind(child.listing_item_id)
        .bind(child.parent_bid_id)
        .fetch_one(&mut *tx)
        .await?;
        let child_bid = bid_from_row(&child_row)?;

        let order_item = if let Some(new_order) = order {
            let order_row = sqlx::query(
                "INSERT INTO orders (hash, buyer, seller) VALUES ($1, $2, $3) RETURNING *",
            )
            .bind(&new_order.hash)
            .bind(&new_order.buyer)
            .bind(&new_order.seller)
            .fetch_one(&mut *tx)
            .await?;
            let order_id: i64 = order_row.try_get("id")?;
            let item_row = sqlx::query(
                "INSERT INTO order_items (order_id, bid_id, listing_item_id, status) \
                 VALUES ($1, $2, $3, $4) RETURNING *",
            )
            .bind(order_id)
            .bind(parent_id)
            .bind(new_order.listing_item_id)
            .bind(OrderStatus::AwaitingEscrow.as_str())
            .fetch_one(&mut *tx)
            .await?;
            Some(item_from_row(&item_row)?)
        } else {
            None
        };

        tx.commit().await?;
        Ok(ResolvedBid { child: child_bid, order_item })
    }
}

#[async_trait]
impl OrderStore for PgStore {
    async fn order_by_id(&self, id: i64) -> Result<Option<Order>, MarketError> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_from_row).transpose()
    }

    async fn order_item_by_id(&self, id: i64) -> Result<Option<OrderItem>, MarketError> {
        let row = sqlx::query("SELECT * FROM order_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn set_item_status(
        &self,
        item_id: i64,
        expected: OrderStatus,
        next: OrderStatus,
    ) -> Result<OrderItem, MarketError> {
        let row = sqlx::query(
            "UPDATE order_items SET status = $1, updated_at = now() \
             WHERE id = $2 AND status = $3 RETURNING *",
        )
        .bind(next.as_str())
        .bind(item_id)
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => item_from_row(&row),
            None => {
                let current = sqlx::query("SELECT status FROM order_items WHERE id = $1")
                    .bind(item_id)
                    .fetch_optional(&self.pool)
                    .await?;
                match current {
                    Some(row) => Err(MarketError::invalid_state(format!(
                        "order item {item_id} is {}, expected {}",
                        row.try_get::<&str, _>("status")?,
                        expected.as_str()
                    ))),
                    None => Err(MarketError::not_found("order item", item_id)),
                }
            }
        }
    }

    async fn items_by_listing(&self, listing_item_id: i64) -> Result<Vec<OrderItem>, MarketError> {
        let rows = sqlx::query("SELECT * FROM order_items WHERE listing_item_id = $1 ORDER BY id")
            .bind(listing_item_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn items_for_buyer(&self, buyer: &str) -> Result<Vec<OrderItem>, MarketError> {
        let rows = sqlx::query(
            "SELECT i.* FROM order_items i JOIN orders o ON o.id = i.order_id \
             WHERE o.buyer = $1 ORDER BY i.id",
        )
        .bind(buyer)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    async fn items_for_seller(&self, seller: &str) -> Result<Vec<OrderItem>, MarketError> {
        let rows = sqlx::query(
            "SELECT i.* FROM order_items i JOIN orders o ON o.id = i.order_id \
             WHERE o.seller = $1 ORDER BY i.id",
        )
        .bind(seller)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }
}

#[async_trait]
impl EscrowStore for PgStore {
    async fn escrow_by_template(&self, template_id: i64) -> Result<Option<Escrow>, MarketError> {
        let row = sqlx::query("SELECT * FROM escrows WHERE listing_item_template_id = $1")
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(escrow_from_row).transpose()
    }

    async fn insert_escrow(
        &self,
        template_id: i64,
        kind: EscrowKind,
        ratio: EscrowRatio,
    ) -> Result<Escrow, MarketError> {
        let row = sqlx::query(
            "INSERT INTO escrows (listing_item_template_id, kind, ratio_buyer, ratio_seller) \
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(template_id)
        .bind(kind.as_str())
        .bind(ratio.buyer)
        .bind(ratio.seller)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                MarketError::invalid_state(format!("template {template_id} already has an escrow"))
            } else {
                e.into()
            }
        })?;
        escrow_from_row(&row)
    }

    async fn delete_escrow(&self, template_id: i64) -> Result<(), MarketError> {
        let deleted = sqlx::query("DELETE FROM escrows WHERE listing_item_template_id = $1")
            .bind(template_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(MarketError::not_found("escrow for template", template_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgStore {
    async fn listing_by_id(&self, id: i64) -> Result<Option<ListingItem>, MarketError> {
        let row = sqlx::query("SELECT * FROM listing_items WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn listing_by_hash(&self, hash: &str) -> Result<Option<ListingItem>, MarketError> {
        let row = sqlx::query("SELECT * FROM listing_items WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn template_by_id(&self, id: i64) -> Result<Option<ListingItemTemplate>, MarketError> {
        let row = sqlx::query("SELECT * FROM listing_item_templates WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(template_from_row).transpose()
    }

    async fn template_has_listings(&self, template_id: i64) -> Result<bool, MarketError> {
        let row = sqlx::query("SELECT 1 FROM listing_items WHERE template_id = $1 LIMIT 1")
            .bind(template_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert_template(&self, owner: &str) -> Result<ListingItemTemplate, MarketError> {
        let row = sqlx::query(
            "INSERT INTO listing_item_templates (owner_identity) VALUES ($1) RETURNING *",
        )
        .bind(owner)
        .fetch_one(&self.pool)
        .await?;
        template_from_row(&row)
    }

    async fn insert_listing(&self, listing: NewListing) -> Result<ListingItem, MarketError> {
        let row = sqlx::query(
            "INSERT INTO listing_items (hash, template_id, seller, price_sats, expires_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(&listing.hash)
        .bind(listing.template_id)
        .bind(&listing.seller)
        .bind(listing.price_sats)
        .bind(listing.expires_at)
        .fetch_one(&self.pool)
        .await?;
        listing_from_row(&row)
    }
}

#[async_trait]
impl OutputStore for PgStore {
    async fn insert_locked_output(&self, output: LockedOutput) -> Result<(), MarketError> {
        sqlx::query(
            "INSERT INTO locked_outputs (txid, vout, amount_sats, address, script_pub_key, bid_id) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&output.txid)
        .bind(output.vout)
        .bind(output.amount_sats)
        .bind(&output.address)
        .bind(&output.script_pub_key)
        .bind(output.bid_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                MarketError::invalid_state(format!(
                    "output {}:{} is already locked",
                    output.txid, output.vout
                ))
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    async fn outputs_for_bid(&self, bid_id: i64) -> Result<Vec<LockedOutput>, MarketError> {
        let rows = sqlx::query("SELECT * FROM locked_outputs WHERE bid_id = $1 ORDER BY txid, vout")
            .bind(bid_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(output_from_row).collect()
    }
}

#[async_trait]
impl GovernanceStore for PgStore {
    async fn proposal_by_hash(
        &self,
        hash: &str,
        load: ProposalLoad,
    ) -> Result<Option<Proposal>, MarketError> {
        let row = sqlx::query("SELECT * FROM proposals WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut proposal = proposal_from_row(&row)?;
        if load == ProposalLoad::WithOptions {
            let rows = sqlx::query(
                "SELECT * FROM proposal_options WHERE proposal_id = $1 ORDER BY option_id",
            )
            .bind(proposal.id)
            .fetch_all(&self.pool)
            .await?;
            proposal.options = rows.iter().map(option_from_row).collect::<Result<_, _>>()?;
        }
        Ok(Some(proposal))
    }

    async fn insert_proposal(&self, proposal: NewProposal) -> Result<Proposal, MarketError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO proposals (submitter, block_start, block_end, hash, category, title) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(&proposal.submitter)
        .bind(proposal.block_start)
        .bind(proposal.block_end)
        .bind(&proposal.hash)
        .bind(proposal.category.as_str())
        .bind(&proposal.title)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                MarketError::invalid_state(format!("proposal {} already exists", proposal.hash))
            } else {
                MarketError::from(e)
            }
        })?;
        let mut created = proposal_from_row(&row)?;

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO proposal_options (proposal_id, option_id, description, hash) ",
        );
        qb.push_values(&proposal.options, |mut b, (option_id, description, hash)| {
            b.push_bind(created.id)
                .push_bind(option_id)
                .push_bind(description)
                .push_bind(hash);
        });
        qb.push(" RETURNING *");
        let rows = qb.build().fetch_all(&mut *tx).await?;
        created.options = rows.iter().map(option_from_row).collect::<Result<_, _>>()?;
        created.options.sort_by_key(|o| o.option_id);

        tx.commit().await?;
        Ok(created)
    }

    async fn insert_vote(&self, vote: NewVote) -> Result<Vote, MarketError> {
        let row = sqlx::query(
            "INSERT INTO votes (msgid, voter, proposal_option_id, block, weight) \
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(&vote.msgid)
        .bind(&vote.voter)
        .bind(vote.proposal_option_id)
        .bind(vote.block)
        .bind(vote.weight)
        .fetch_one(&self.pool)
        .await?;
        vote_from_row(&row)
    }

    async fn votes_upto(
        &self,
        proposal_id: i64,
        snapshot_block: i64,
    ) -> Result<Vec<Vote>, MarketError> {
        let exists = sqlx::query("SELECT 1 FROM proposals WHERE id = $1")
            .bind(proposal_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if !exists {
            return Err(MarketError::not_found("proposal", proposal_id));
        }
        let rows = sqlx::query(
            "SELECT v.* FROM votes v \
             JOIN proposal_options o ON o.id = v.proposal_option_id \
             WHERE o.proposal_id = $1 AND v.block <= $2 ORDER BY v.id",
        )
        .bind(proposal_id)
        .bind(snapshot_block)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(vote_from_row).collect()
    }

    async fn result_for(
        &self,
        proposal_id: i64,
        block: i64,
    ) -> Result<Option<TallySnapshot>, MarketError> {
        let row = sqlx::query("SELECT * FROM proposal_results WHERE proposal_id = $1 AND block = $2")
            .bind(proposal_id)
            .bind(block)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let result = ProposalResult {
            id: row.try_get("id")?,
            proposal_id: row.try_get("proposal_id")?,
            block: row.try_get("block")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        };
        let rows = sqlx::query(
            "SELECT * FROM proposal_option_results WHERE proposal_result_id = $1 ORDER BY option_id",
        )
        .bind(result.id)
        .fetch_all(&self.pool)
        .await?;
        let options = rows
            .iter()
            .map(option_result_from_row)
            .collect::<Result<_, _>>()?;
        Ok(Some(TallySnapshot { result, options }))
    }

    async fn insert_result(
        &self,
        proposal_id: i64,
        block: i64,
        options: Vec<OptionTally>,
    ) -> Result<TallySnapshot, MarketError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO proposal_results (proposal_id, block) VALUES ($1, $2) \
             ON CONFLICT (proposal_id, block) DO NOTHING RETURNING *",
        )
        .bind(proposal_id)
        .bind(block)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            // Another writer froze this key first; their snapshot stands.
            tx.rollback().await?;
            return self
                .result_for(proposal_id, block)
                .await?
                .ok_or_else(|| MarketError::Store("result vanished during insert".to_string()));
        };

        let result = ProposalResult {
            id: row.try_get("id")?,
            proposal_id: row.try_get("proposal_id")?,
            block: row.try_get("block")?,
            created_at: row.try_get("created_at")?,
        };
        let mut option_rows = Vec::with_capacity(options.len());
        for tally in &options {
            sqlx::query(
                "INSERT INTO proposal_option_results \
                 (proposal_result_id, proposal_option_id, option_id, weight, voters) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(result.id)
            .bind(tally.proposal_option_id)
            .bind(tally.option_id)
            .bind(tally.weight)
            .bind(tally.voters)
            .execute(&mut *tx)
            .await?;
            option_rows.push(ProposalOptionResult {
                proposal_result_id: result.id,
                proposal_option_id: tally.proposal_option_id,
                option_id: tally.option_id,
                weight: tally.weight,
                voters: tally.voters,
            });
        }
        tx.commit().await?;
        Ok(TallySnapshot { result, options: option_rows })
    }

    async fn search_proposals(
        &self,
        params: &ProposalSearchParams,
    ) -> Result<Vec<Proposal>, MarketError> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM proposals WHERE TRUE");
        match (params.start, params.end) {
            (BlockQuery::Open, BlockQuery::Open) => {}
            (BlockQuery::Open, BlockQuery::Height(end)) => {
                qb.push(" AND block_start < ").push_bind(end);
            }
            (BlockQuery::Height(start), BlockQuery::Open) => {
                qb.push(" AND block_end > ").push_bind(start);
            }
            (BlockQuery::Height(start), BlockQuery::Height(end)) => {
                qb.push(" AND block_start < ").push_bind(end.saturating_add(1));
                qb.push(" AND block_end > ").push_bind(start.saturating_sub(1));
            }
        }
        if let Some(category) = params.category {
            qb.push(" AND category = ").push_bind(category.as_str());
        }
        match params.order {
            SortOrder::Asc => qb.push(" ORDER BY block_start ASC, id ASC"),
            SortOrder::Desc => qb.push(" ORDER BY block_start DESC, id DESC"),
        };
        qb.push(" LIMIT ")
            .push_bind(i64::try_from(params.limit).unwrap_or(i64::MAX));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(proposal_from_row).collect()
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn applied_outcome(&self, msgid: &str) -> Result<Option<ApplyOutcome>, MarketError> {
        let row = sqlx::query("SELECT outcome FROM applied_messages WHERE msgid = $1")
            .bind(msgid)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let value: serde_json::Value = row.try_get("outcome")?;
        let outcome = serde_json::from_value(value)
            .map_err(|e| MarketError::Store(format!("corrupt applied outcome: {e}")))?;
        Ok(Some(outcome))
    }

    async fn record_applied(&self, msgid: &str, outcome: &ApplyOutcome) -> Result<(), MarketError> {
        let value = serde_json::to_value(outcome)
            .map_err(|e| MarketError::Store(format!("encode applied outcome: {e}")))?;
        sqlx::query(
            "INSERT INTO applied_messages (msgid, outcome) VALUES ($1, $2) \
             ON CONFLICT (msgid) DO NOTHING",
        )
        .bind(msgid)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
