use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::MarketError;
use crate::model::EscrowRatio;

/// Wallet/chain capability consumed by the engines. Fund movement and
/// height queries are the only things the engines ever ask of it.
#[async_trait]
pub trait WalletGateway: Send + Sync {
    async fn chain_height(&self) -> Result<i64, MarketError>;
    async fn owns_template(&self, identity: &str, template_id: i64) -> Result<bool, MarketError>;
    /// True when the bid's locked outputs cover `required_sats`.
    async fn verify_locked(&self, bid_id: i64, required_sats: i64) -> Result<bool, MarketError>;
    async fn release_to_seller(
        &self,
        order_item_id: i64,
        ratio: EscrowRatio,
    ) -> Result<(), MarketError>;
    async fn refund_to_buyer(
        &self,
        order_item_id: i64,
        ratio: EscrowRatio,
    ) -> Result<(), MarketError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundInstruction {
    Release { order_item_id: i64, ratio_buyer: i64, ratio_seller: i64 },
    Refund { order_item_id: i64, ratio_buyer: i64, ratio_seller: i64 },
}

/// Deterministic gateway for tests and local runs: fixed height, declared
/// template owners, per-bid locked totals. Issued fund instructions are
/// recorded so callers can assert on them.
#[derive(Default)]
pub struct StaticGateway {
    height: AtomicI64,
    owners: Mutex<HashSet<(String, i64)>>,
    locked: Mutex<HashMap<i64, i64>>,
    instructions: Mutex<Vec<FundInstruction>>,
}

impl StaticGateway {
    pub fn new(height: i64) -> Self {
        let gw = Self::default();
        gw.height.store(height, Ordering::Relaxed);
        gw
    }

    pub fn set_height(&self, height: i64) {
        self.height.store(height, Ordering::Relaxed);
    }

    pub fn grant_template(&self, identity: &str, template_id: i64) {
        self.owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((identity.to_string(), template_id));
    }

    pub fn set_locked(&self, bid_id: i64, amount_sats: i64) {
        self.locked.lock().unwrap_or_else(|e| e.into_inner()).insert(bid_id, amount_sats);
    }

    pub fn instructions(&self) -> Vec<FundInstruction> {
        self.instructions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl WalletGateway for StaticGateway {
    async fn chain_height(&self) -> Result<i64, MarketError> {
        Ok(self.height.load(Ordering::Relaxed))
    }

    async fn owns_template(&self, identity: &str, template_id: i64) -> Result<bool, MarketError> {
        Ok(self
            .owners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&(identity.to_string(), template_id)))
    }

    async fn verify_locked(&self, bid_id: i64, required_sats: i64) -> Result<bool, MarketError> {
        let locked = self
            .locked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&bid_id)
            .copied()
            .unwrap_or(0);
        Ok(locked >= required_sats)
    }

    async fn release_to_seller(
        &self,
        order_item_id: i64,
        ratio: EscrowRatio,
    ) -> Result<(), MarketError> {
        self.instructions.lock().unwrap_or_else(|e| e.into_inner()).push(
            FundInstruction::Release {
                order_item_id,
                ratio_buyer: ratio.buyer,
                ratio_seller: ratio.seller,
            },
        );
        Ok(())
    }

    async fn refund_to_buyer(
        &self,
        order_item_id: i64,
        ratio: EscrowRatio,
    ) -> Result<(), MarketError> {
        self.instructions.lock().unwrap_or_else(|e| e.into_inner()).push(
            FundInstruction::Refund {
                order_item_id,
                ratio_buyer: ratio.buyer,
                ratio_seller: ratio.seller,
            },
        );
        Ok(())
    }
}
