use std::sync::Arc;
use std::sync::atomic::Ordering;

use log::info;

use crate::error::MarketError;
use crate::gateway::WalletGateway;
use crate::model::{Escrow, EscrowKind, EscrowRatio, Order, OrderItem, OrderStatus};
use crate::state::MarketState;
use crate::store::MarketStore;

/// Escrow engine: template-level escrow configuration plus the fund side
/// of the order status ladder. Every status move goes through the store's
/// compare-and-set, so concurrent movers collapse to one winner.
pub struct EscrowEngine {
    store: Arc<dyn MarketStore>,
    gateway: Arc<dyn WalletGateway>,
    state: Arc<MarketState>,
}

impl EscrowEngine {
    pub fn new(
        store: Arc<dyn MarketStore>,
        gateway: Arc<dyn WalletGateway>,
        state: Arc<MarketState>,
    ) -> Self {
        Self { store, gateway, state }
    }

    /// Attaches an escrow contract to a listing template. Refused once the
    /// template has listings, so live offers never change terms under a
    /// buyer.
    pub async fn create_for_template(
        &self,
        identity: &str,
        template_id: i64,
        kind: EscrowKind,
        ratio: EscrowRatio,
    ) -> Result<Escrow, MarketError> {
        ratio.validate()?;
        self.owned_template(identity, template_id).await?;
        if self.store.template_has_listings(template_id).await? {
            return Err(MarketError::not_modifiable("listing item template", template_id));
        }
        let escrow = self.store.insert_escrow(template_id, kind, ratio).await?;
        info!(
            "[escrow] created template={} kind={} ratio={}/{}",
            template_id,
            kind.as_str(),
            ratio.buyer,
            ratio.seller
        );
        Ok(escrow)
    }

    pub async fn destroy_for_template(
        &self,
        identity: &str,
        template_id: i64,
    ) -> Result<(), MarketError> {
        self.owned_template(identity, template_id).await?;
        if self.store.template_has_listings(template_id).await? {
            return Err(MarketError::not_modifiable("listing item template", template_id));
        }
        self.store.delete_escrow(template_id).await?;
        info!("[escrow] destroyed template={}", template_id);
        Ok(())
    }

    /// Buyer confirms funds are locked. Moves the item from
    /// `AwaitingEscrow` to `EscrowLocked` once the gateway sees enough
    /// locked value on the originating bid.
    pub async fn lock(&self, identity: &str, order_item_id: i64) -> Result<OrderItem, MarketError> {
        let (item, order) = self.load_item(order_item_id).await?;
        if order.buyer != identity {
            return Err(MarketError::Unauthorized(format!(
                "{} is not the buyer of order item {}",
                identity, item.id
            )));
        }
        if item.status != OrderStatus::AwaitingEscrow {
            return Err(MarketError::invalid_state(format!(
                "order item {} is {}, lock requires {}",
                item.id,
                item.status.as_str(),
                OrderStatus::AwaitingEscrow.as_str()
            )));
        }
        let (listing_price, ratio) = self.terms_for(&item).await?;
        let required = ratio.buyer_requirement(listing_price);
        if !self.gateway.verify_locked(item.bid_id, required).await? {
            return Err(MarketError::invalid_state(format!(
                "bid {} does not cover required {} sats",
                item.bid_id, required
            )));
        }
        let item = self
            .store
            .set_item_status(item.id, OrderStatus::AwaitingEscrow, OrderStatus::EscrowLocked)
            .await?;
        self.state.counters.escrow_locks.fetch_add(1, Ordering::Relaxed);
        info!("[escrow] locked order_item={} required_sats={}", item.id, required);
        Ok(item)
    }

    /// Seller marks the goods as underway: `EscrowLocked` to `Shipping`.
    pub async fn ship(&self, identity: &str, order_item_id: i64) -> Result<OrderItem, MarketError> {
        let (item, order) = self.load_item(order_item_id).await?;
        if order.seller != identity {
            return Err(MarketError::Unauthorized(format!(
                "{} is not the seller of order item {}",
                identity, item.id
            )));
        }
        let item = self
            .store
            .set_item_status(item.id, OrderStatus::EscrowLocked, OrderStatus::Shipping)
            .await?;
        info!("[escrow] shipping order_item={}", item.id);
        Ok(item)
    }

    /// Buyer releases the escrow to the seller. Allowed from
    /// `EscrowLocked` or `Shipping`; from `EscrowLocked` the item is
    /// stepped through `Shipping` so the ladder is never skipped.
    pub async fn release(
        &self,
        identity: &str,
        order_item_id: i64,
    ) -> Result<OrderItem, MarketError> {
        let (item, order) = self.load_item(order_item_id).await?;
        if order.buyer != identity {
            return Err(MarketError::Unauthorized(format!(
                "{} is not the buyer of order item {}",
                identity, item.id
            )));
        }
        let item = match item.status {
            OrderStatus::EscrowLocked => {
                self.store
                    .set_item_status(item.id, OrderStatus::EscrowLocked, OrderStatus::Shipping)
                    .await?;
                self.store
                    .set_item_status(item.id, OrderStatus::Shipping, OrderStatus::Complete)
                    .await?
            }
            OrderStatus::Shipping => {
                self.store
                    .set_item_status(item.id, OrderStatus::Shipping, OrderStatus::Complete)
                    .await?
            }
            other => {
                return Err(MarketError::invalid_state(format!(
                    "order item {} is {}, release requires locked escrow",
                    item.id,
                    other.as_str()
                )))
            }
        };
        let (_, ratio) = self.terms_for(&item).await?;
        self.gateway.release_to_seller(item.id, ratio).await?;
        self.state.counters.escrow_releases.fetch_add(1, Ordering::Relaxed);
        info!("[escrow] released order_item={}", item.id);
        Ok(item)
    }

    /// Seller returns the escrow to the buyer. Terminal: the item lands in
    /// `Refunded` and takes no further moves.
    pub async fn refund(
        &self,
        identity: &str,
        order_item_id: i64,
    ) -> Result<OrderItem, MarketError> {
        let (item, order) = self.load_item(order_item_id).await?;
        if order.seller != identity {
            return Err(MarketError::Unauthorized(format!(
                "{} is not the seller of order item {}",
                identity, item.id
            )));
        }
        if !matches!(item.status, OrderStatus::EscrowLocked | OrderStatus::Shipping) {
            return Err(MarketError::invalid_state(format!(
                "order item {} is {}, refund requires locked escrow",
                item.id,
                item.status.as_str()
            )));
        }
        let item = self
            .store
            .set_item_status(item.id, item.status, OrderStatus::Refunded)
            .await?;
        let (_, ratio) = self.terms_for(&item).await?;
        self.gateway.refund_to_buyer(item.id, ratio).await?;
        self.state.counters.escrow_refunds.fetch_add(1, Ordering::Relaxed);
        info!("[escrow] refunded order_item={}", item.id);
        Ok(item)
    }

    /// Status read model for a listing, addressed by its hash.
    pub async fn items_for_listing(&self, listing_hash: &str) -> Result<Vec<OrderItem>, MarketError> {
        let listing = self
            .store
            .listing_by_hash(listing_hash)
            .await?
            .ok_or_else(|| MarketError::not_found("listing_item", listing_hash))?;
        self.store.items_by_listing(listing.id).await
    }

    async fn owned_template(&self, identity: &str, template_id: i64) -> Result<(), MarketError> {
        let template = self
            .store
            .template_by_id(template_id)
            .await?
            .ok_or_else(|| MarketError::not_found("listing item template", template_id))?;
        if template.owner != identity {
            return Err(MarketError::Unauthorized(format!(
                "{} does not own template {}",
                identity, template_id
            )));
        }
        Ok(())
    }

    async fn load_item(&self, order_item_id: i64) -> Result<(OrderItem, Order), MarketError> {
        let item = self
            .store
            .order_item_by_id(order_item_id)
            .await?
            .ok_or_else(|| MarketError::not_found("order item", order_item_id))?;
        let order = self
            .store
            .order_by_id(item.order_id)
            .await?
            .ok_or_else(|| MarketError::not_found("order", item.order_id))?;
        Ok((item, order))
    }

    /// Listing price and escrow ratio governing an order item.
    async fn terms_for(&self, item: &OrderItem) -> Result<(i64, EscrowRatio), MarketError> {
        let listing = self
            .store
            .listing_by_id(item.listing_item_id)
            .await?
            .ok_or_else(|| MarketError::not_found("listing_item", item.listing_item_id))?;
        let escrow = self
            .store
            .escrow_by_template(listing.template_id)
            .await?
            .ok_or_else(|| MarketError::not_found("escrow for template", listing.template_id))?;
        Ok((listing.price_sats, escrow.ratio))
    }
}
