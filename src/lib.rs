pub mod bids;
pub mod config;
pub mod error;
pub mod escrow;
pub mod gateway;
pub mod messages;
pub mod model;
pub mod pg;
pub mod state;
pub mod store;
pub mod tally;

pub use bids::{BidEngine, BidOutput};
pub use config::{load_config, AppConfig};
pub use error::MarketError;
pub use escrow::EscrowEngine;
pub use gateway::{FundInstruction, StaticGateway, WalletGateway};
pub use messages::{ActionMessage, ActionPayload, ApplyOutcome, MessageProcessor};
pub use pg::PgStore;
pub use state::{spawn_applied_cache_pruner, MarketState};
pub use store::{MarketStore, MemStore};
pub use tally::{BlockQuery, ProposalSearchParams, SortOrder, TallyEngine};

pub fn now_epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn now_epoch_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
