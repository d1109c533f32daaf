use std::sync::Arc;

use agora_core::config::EngineConfig;
use agora_core::model::{EscrowKind, EscrowRatio, ListingItem, OrderItem, OrderStatus};
use agora_core::store::{ListingStore, MemStore, NewListing, OrderStore};
use agora_core::{
    BidEngine, EscrowEngine, FundInstruction, MarketError, MarketState, StaticGateway,
};

const RATIO: EscrowRatio = EscrowRatio { buyer: 100, seller: 100 };

struct Harness {
    store: Arc<MemStore>,
    gateway: Arc<StaticGateway>,
    state: Arc<MarketState>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemStore::default()),
            gateway: Arc::new(StaticGateway::new(100)),
            state: Arc::new(MarketState::new(EngineConfig::default())),
        }
    }

    fn escrows(&self) -> EscrowEngine {
        EscrowEngine::new(self.store.clone(), self.gateway.clone(), self.state.clone())
    }

    fn bids(&self) -> BidEngine {
        BidEngine::new(self.store.clone(), self.gateway.clone(), self.state.clone())
    }

    async fn seed_template(&self, owner: &str) -> i64 {
        let template = self.store.insert_template(owner).await.unwrap();
        self.gateway.grant_template(owner, template.id);
        template.id
    }

    async fn seed_listing(&self, template_id: i64, seller: &str, price_sats: i64) -> ListingItem {
        self.store
            .insert_listing(NewListing {
                hash: format!("listing-{template_id}"),
                template_id,
                seller: seller.to_string(),
                price_sats,
                expires_at: None,
            })
            .await
            .unwrap()
    }

    /// Template with escrow, one listing, one accepted bid. Returns the
    /// order item in `AwaitingEscrow` plus the root bid id.
    async fn seed_accepted_order(&self, price_sats: i64) -> (OrderItem, i64) {
        let template_id = self.seed_template("seller").await;
        self.escrows()
            .create_for_template("seller", template_id, EscrowKind::NoArbitration, RATIO)
            .await
            .unwrap();
        let listing = self.seed_listing(template_id, "seller", price_sats).await;
        let bids = self.bids();
        let bid = bids
            .receive_bid("m1", "buyer", &listing.hash, Vec::new())
            .await
            .unwrap();
        let resolved = bids.accept_bid("m2", "seller", bid.id).await.unwrap();
        (resolved.order_item.unwrap(), bid.id)
    }
}

#[tokio::test]
async fn escrow_is_frozen_once_the_template_has_listings() {
    let h = Harness::new();
    let template_id = h.seed_template("seller").await;
    let escrows = h.escrows();
    escrows
        .create_for_template("seller", template_id, EscrowKind::NoArbitration, RATIO)
        .await
        .unwrap();
    h.seed_listing(template_id, "seller", 1000).await;

    let err = escrows
        .destroy_for_template("seller", template_id)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::NotModifiable { .. }), "got {err:?}");

    // And a bare template cannot grow a second escrow.
    let bare = h.seed_template("seller").await;
    escrows
        .create_for_template("seller", bare, EscrowKind::MultiAuthDispute, RATIO)
        .await
        .unwrap();
    let err = escrows
        .create_for_template("seller", bare, EscrowKind::NoArbitration, RATIO)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidState(_)), "got {err:?}");
}

#[tokio::test]
async fn create_requires_ownership_and_a_sane_ratio() {
    let h = Harness::new();
    let template_id = h.seed_template("seller").await;
    let escrows = h.escrows();

    let err = escrows
        .create_for_template("stranger", template_id, EscrowKind::NoArbitration, RATIO)
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized(_)), "got {err:?}");

    let err = escrows
        .create_for_template(
            "seller",
            template_id,
            EscrowKind::NoArbitration,
            EscrowRatio { buyer: 0, seller: 100 },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::InvalidParameter { .. }), "got {err:?}");
}

#[tokio::test]
async fn lock_requires_sufficient_locked_funds() {
    let h = Harness::new();
    let (item, bid_id) = h.seed_accepted_order(1000).await;
    let escrows = h.escrows();

    // ratio.buyer = 100 percent, so 1000 sats price requires 2000 locked.
    h.gateway.set_locked(bid_id, 1500);
    let err = escrows.lock("buyer", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidState(_)), "got {err:?}");
    let unchanged = h.store.order_item_by_id(item.id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, OrderStatus::AwaitingEscrow);

    h.gateway.set_locked(bid_id, 2000);
    let locked = escrows.lock("buyer", item.id).await.unwrap();
    assert_eq!(locked.status, OrderStatus::EscrowLocked);
}

#[tokio::test]
async fn lock_is_rejected_once_already_locked() {
    let h = Harness::new();
    let (item, bid_id) = h.seed_accepted_order(1000).await;
    h.gateway.set_locked(bid_id, 2000);
    let escrows = h.escrows();
    escrows.lock("buyer", item.id).await.unwrap();

    let err = escrows.lock("buyer", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidState(_)), "got {err:?}");
    let current = h.store.order_item_by_id(item.id).await.unwrap().unwrap();
    assert_eq!(current.status, OrderStatus::EscrowLocked);
}

#[tokio::test]
async fn only_the_buyer_locks_and_releases() {
    let h = Harness::new();
    let (item, bid_id) = h.seed_accepted_order(1000).await;
    h.gateway.set_locked(bid_id, 2000);
    let escrows = h.escrows();

    let err = escrows.lock("seller", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized(_)), "got {err:?}");

    escrows.lock("buyer", item.id).await.unwrap();
    let err = escrows.release("seller", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized(_)), "got {err:?}");
}

#[tokio::test]
async fn release_from_shipping_completes_and_pays_the_seller() {
    let h = Harness::new();
    let (item, bid_id) = h.seed_accepted_order(1000).await;
    h.gateway.set_locked(bid_id, 2000);
    let escrows = h.escrows();

    escrows.lock("buyer", item.id).await.unwrap();
    let shipping = escrows.ship("seller", item.id).await.unwrap();
    assert_eq!(shipping.status, OrderStatus::Shipping);

    let done = escrows.release("buyer", item.id).await.unwrap();
    assert_eq!(done.status, OrderStatus::Complete);
    assert_eq!(
        h.gateway.instructions(),
        vec![FundInstruction::Release { order_item_id: item.id, ratio_buyer: 100, ratio_seller: 100 }]
    );
}

#[tokio::test]
async fn release_from_locked_steps_through_shipping() {
    let h = Harness::new();
    let (item, bid_id) = h.seed_accepted_order(1000).await;
    h.gateway.set_locked(bid_id, 2000);
    let escrows = h.escrows();

    escrows.lock("buyer", item.id).await.unwrap();
    let done = escrows.release("buyer", item.id).await.unwrap();
    assert_eq!(done.status, OrderStatus::Complete);
    assert!(matches!(
        h.gateway.instructions().as_slice(),
        [FundInstruction::Release { .. }]
    ));

    // Terminal: nothing moves a completed item.
    let err = escrows.ship("seller", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidState(_)), "got {err:?}");
    let err = escrows.refund("seller", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidState(_)), "got {err:?}");
}

#[tokio::test]
async fn refund_is_terminal_and_returns_funds_to_the_buyer() {
    let h = Harness::new();
    let (item, bid_id) = h.seed_accepted_order(1000).await;
    h.gateway.set_locked(bid_id, 2000);
    let escrows = h.escrows();

    escrows.lock("buyer", item.id).await.unwrap();
    let err = escrows.refund("buyer", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::Unauthorized(_)), "got {err:?}");

    let refunded = escrows.refund("seller", item.id).await.unwrap();
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert_eq!(
        h.gateway.instructions(),
        vec![FundInstruction::Refund { order_item_id: item.id, ratio_buyer: 100, ratio_seller: 100 }]
    );

    let err = escrows.release("buyer", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidState(_)), "got {err:?}");
}

#[tokio::test]
async fn refund_requires_locked_escrow() {
    let h = Harness::new();
    let (item, _) = h.seed_accepted_order(1000).await;
    let err = h.escrows().refund("seller", item.id).await.unwrap_err();
    assert!(matches!(err, MarketError::InvalidState(_)), "got {err:?}");
}

#[tokio::test]
async fn listing_read_model_reports_item_statuses() {
    let h = Harness::new();
    let (item, bid_id) = h.seed_accepted_order(1000).await;
    h.gateway.set_locked(bid_id, 2000);
    let escrows = h.escrows();
    escrows.lock("buyer", item.id).await.unwrap();

    let listing = h
        .store
        .listing_by_id(item.listing_item_id)
        .await
        .unwrap()
        .unwrap();
    let items = escrows.items_for_listing(&listing.hash).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].status, OrderStatus::EscrowLocked);

    let bought = h.store.items_for_buyer("buyer").await.unwrap();
    let sold = h.store.items_for_seller("seller").await.unwrap();
    assert_eq!(bought.len(), 1);
    assert_eq!(sold.len(), 1);
    assert_eq!(bought[0].id, item.id);
    assert_eq!(sold[0].id, item.id);
}
