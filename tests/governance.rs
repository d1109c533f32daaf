use std::sync::Arc;

use chrono::Utc;

use agora_core::config::EngineConfig;
use agora_core::model::{Proposal, ProposalCategory};
use agora_core::store::MemStore;
use agora_core::{
    ActionMessage, ActionPayload, BlockQuery, MarketError, MarketState, MessageProcessor,
    ProposalSearchParams, SortOrder, StaticGateway, TallyEngine,
};

struct Harness {
    store: Arc<MemStore>,
    gateway: Arc<StaticGateway>,
    state: Arc<MarketState>,
}

impl Harness {
    fn new(height: i64) -> Self {
        Self {
            store: Arc::new(MemStore::default()),
            gateway: Arc::new(StaticGateway::new(height)),
            state: Arc::new(MarketState::new(EngineConfig::default())),
        }
    }

    fn tally(&self) -> TallyEngine {
        TallyEngine::new(self.store.clone(), self.gateway.clone(), self.state.clone())
    }

    fn processor(&self) -> MessageProcessor {
        MessageProcessor::new(self.store.clone(), self.gateway.clone(), self.state.clone())
    }

    async fn seed_proposal(&self, title: &str, start: i64, end: i64) -> Proposal {
        self.tally()
            .create_proposal(
                "alice",
                start,
                end,
                ProposalCategory::PublicVote,
                title,
                vec![(0, "option A".into()), (1, "option B".into())],
            )
            .await
            .unwrap()
    }
}

fn vote_message(msgid: &str, voter: &str, proposal_hash: &str, option_id: i32, weight: i64, block: i64) -> ActionMessage {
    ActionMessage {
        msgid: msgid.to_string(),
        sender: voter.to_string(),
        received_at: Utc::now(),
        payload: ActionPayload::Vote {
            proposal_hash: proposal_hash.to_string(),
            option_id,
            weight,
            block: Some(block),
        },
    }
}

#[tokio::test]
async fn last_vote_per_voter_wins() {
    let h = Harness::new(100);
    let proposal = h.seed_proposal("flag item", 1, 100).await;
    let tally = h.tally();

    tally
        .cast_vote("m1", "victor", &proposal.hash, 0, 5, Some(10))
        .await
        .unwrap();
    tally
        .cast_vote("m2", "victor", &proposal.hash, 1, 7, Some(20))
        .await
        .unwrap();

    let snapshot = tally.compute_result(&proposal.hash, Some(25)).await.unwrap();
    let a = snapshot.options.iter().find(|o| o.option_id == 0).unwrap();
    let b = snapshot.options.iter().find(|o| o.option_id == 1).unwrap();
    assert_eq!((a.weight, a.voters), (0, 0));
    assert_eq!((b.weight, b.voters), (7, 1));
}

#[tokio::test]
async fn snapshot_ignores_votes_after_its_block() {
    let h = Harness::new(100);
    let proposal = h.seed_proposal("flag item", 1, 100).await;
    let tally = h.tally();

    tally
        .cast_vote("m1", "victor", &proposal.hash, 0, 5, Some(10))
        .await
        .unwrap();
    tally
        .cast_vote("m2", "victor", &proposal.hash, 1, 7, Some(20))
        .await
        .unwrap();

    // At block 15 only the first vote exists.
    let snapshot = tally.compute_result(&proposal.hash, Some(15)).await.unwrap();
    let a = snapshot.options.iter().find(|o| o.option_id == 0).unwrap();
    let b = snapshot.options.iter().find(|o| o.option_id == 1).unwrap();
    assert_eq!((a.weight, a.voters), (5, 1));
    assert_eq!((b.weight, b.voters), (0, 0));
}

#[tokio::test]
async fn results_are_frozen_per_snapshot_block() {
    let h = Harness::new(100);
    let proposal = h.seed_proposal("flag item", 1, 100).await;
    let tally = h.tally();

    tally
        .cast_vote("m1", "victor", &proposal.hash, 0, 5, Some(10))
        .await
        .unwrap();
    let first = tally.compute_result(&proposal.hash, Some(25)).await.unwrap();

    // A later vote must not leak into the frozen snapshot.
    tally
        .cast_vote("m2", "wanda", &proposal.hash, 0, 9, Some(12))
        .await
        .unwrap();
    let second = tally.compute_result(&proposal.hash, Some(25)).await.unwrap();

    assert_eq!(first.result.id, second.result.id);
    assert_eq!(first.options, second.options);

    let counters = h.state.counters.snapshot_json();
    assert_eq!(counters["tally"]["computed"], 1);
    assert_eq!(counters["tally"]["reused"], 1);
    assert_eq!(counters["tally"]["votes"], 2);
}

#[tokio::test]
async fn snapshot_block_defaults_to_chain_height() {
    let h = Harness::new(30);
    let proposal = h.seed_proposal("flag item", 1, 100).await;
    let tally = h.tally();

    tally
        .cast_vote("m1", "victor", &proposal.hash, 0, 5, Some(10))
        .await
        .unwrap();
    let snapshot = tally.compute_result(&proposal.hash, None).await.unwrap();
    assert_eq!(snapshot.result.block, 30);
}

#[tokio::test]
async fn unknown_proposal_and_option_are_not_found() {
    let h = Harness::new(100);
    let proposal = h.seed_proposal("flag item", 1, 100).await;
    let tally = h.tally();

    let err = tally.compute_result("no-such-hash", Some(10)).await.unwrap_err();
    assert!(matches!(err, MarketError::NotFound { .. }), "got {err:?}");

    let err = tally
        .cast_vote("m1", "victor", &proposal.hash, 9, 5, Some(10))
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::NotFound { .. }), "got {err:?}");
}

#[tokio::test]
async fn resubmitting_a_proposal_returns_the_existing_row() {
    let h = Harness::new(100);
    let first = h.seed_proposal("flag item", 1, 100).await;
    let second = h.seed_proposal("flag item", 1, 100).await;
    assert_eq!(first.id, second.id);
    assert_eq!(second.options.len(), 2);
}

#[tokio::test]
async fn replayed_vote_messages_count_once() {
    let h = Harness::new(100);
    let proposal = h.seed_proposal("flag item", 1, 100).await;
    let proc = h.processor();

    let msg = vote_message("m1", "victor", &proposal.hash, 0, 5, 10);
    let first = proc.apply(&msg).await.unwrap();
    let replay = proc.apply(&msg).await.unwrap();
    assert_eq!(first, replay);

    let snapshot = h
        .tally()
        .compute_result(&proposal.hash, Some(25))
        .await
        .unwrap();
    let a = snapshot.options.iter().find(|o| o.option_id == 0).unwrap();
    assert_eq!((a.weight, a.voters), (5, 1));
}

#[tokio::test]
async fn window_search_matches_the_documented_modes() {
    let h = Harness::new(100);
    let proposal = h.seed_proposal("windowed", 50, 150).await;
    let tally = h.tally();

    let wanted = proposal.id;
    let hits = |params: ProposalSearchParams| {
        let tally = &tally;
        async move {
            tally
                .search_by(params)
                .await
                .unwrap()
                .iter()
                .any(|p| p.id == wanted)
        }
    };

    // Bounded window: any overlap counts.
    assert!(
        hits(ProposalSearchParams {
            start: BlockQuery::Height(100),
            end: BlockQuery::Height(200),
            ..Default::default()
        })
        .await
    );
    assert!(
        !hits(ProposalSearchParams {
            start: BlockQuery::Height(200),
            end: BlockQuery::Height(300),
            ..Default::default()
        })
        .await
    );
    // End-only: proposals starting before the bound, even if their
    // window is still running at it.
    assert!(
        hits(ProposalSearchParams {
            end: BlockQuery::Height(60),
            ..Default::default()
        })
        .await
    );
    assert!(
        !hits(ProposalSearchParams {
            end: BlockQuery::Height(40),
            ..Default::default()
        })
        .await
    );
    assert!(
        hits(ProposalSearchParams {
            start: BlockQuery::Height(60),
            ..Default::default()
        })
        .await
    );
    // Fully open: everything.
    assert!(hits(ProposalSearchParams::default()).await);
}

#[tokio::test]
async fn search_orders_by_block_start() {
    let h = Harness::new(100);
    let early = h.seed_proposal("early", 10, 20).await;
    let late = h.seed_proposal("late", 30, 40).await;
    let tally = h.tally();

    let asc = tally.search_by(ProposalSearchParams::default()).await.unwrap();
    assert_eq!(
        asc.iter().map(|p| p.id).collect::<Vec<_>>(),
        vec![early.id, late.id]
    );

    let desc = tally
        .search_by(ProposalSearchParams { order: SortOrder::Desc, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(
        desc.iter().map(|p| p.id).collect::<Vec<_>>(),
        vec![late.id, early.id]
    );

    let capped = tally
        .search_by(ProposalSearchParams { limit: 1, ..Default::default() })
        .await
        .unwrap();
    assert_eq!(capped.len(), 1);
    assert_eq!(capped[0].id, early.id);
}

#[tokio::test]
async fn category_filters_apply_to_search() {
    let h = Harness::new(100);
    h.seed_proposal("public", 10, 20).await;
    let tally = h.tally();
    let flagged = tally
        .create_proposal(
            "alice",
            10,
            20,
            ProposalCategory::ItemFlag,
            "flagged",
            vec![(0, "keep".into()), (1, "remove".into())],
        )
        .await
        .unwrap();

    let hits = tally
        .search_by(ProposalSearchParams {
            category: Some(ProposalCategory::ItemFlag),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, flagged.id);
}
