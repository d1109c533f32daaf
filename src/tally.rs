use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};

use crate::error::MarketError;
use crate::gateway::WalletGateway;
use crate::model::{option_hash, proposal_hash, Proposal, ProposalCategory, Vote};
use crate::state::MarketState;
use crate::store::{MarketStore, NewProposal, NewVote, OptionTally, ProposalLoad, TallySnapshot};

/// One side of a block-window query. `Open` leaves that side unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockQuery {
    Open,
    Height(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone)]
pub struct ProposalSearchParams {
    pub start: BlockQuery,
    pub end: BlockQuery,
    pub category: Option<ProposalCategory>,
    pub order: SortOrder,
    pub limit: usize,
}

impl ProposalSearchParams {
    /// Window semantics against a proposal's [block_start, block_end]:
    /// a bounded (start, end) query selects proposals whose window
    /// overlaps it, end-only selects proposals starting before `end`,
    /// start-only selects proposals ending after `start`.
    pub fn matches(&self, proposal: &Proposal) -> bool {
        if let Some(cat) = self.category {
            if proposal.category != cat {
                return false;
            }
        }
        match (self.start, self.end) {
            (BlockQuery::Open, BlockQuery::Open) => true,
            (BlockQuery::Open, BlockQuery::Height(end)) => proposal.block_start < end,
            (BlockQuery::Height(start), BlockQuery::Open) => proposal.block_end > start,
            (BlockQuery::Height(start), BlockQuery::Height(end)) => {
                proposal.block_start < end.saturating_add(1)
                    && proposal.block_end > start.saturating_sub(1)
            }
        }
    }

    pub fn sort(&self, proposals: &mut [Proposal]) {
        match self.order {
            SortOrder::Asc => proposals.sort_by_key(|p| (p.block_start, p.id)),
            SortOrder::Desc => {
                proposals.sort_by_key(|p| (std::cmp::Reverse(p.block_start), std::cmp::Reverse(p.id)))
            }
        }
    }
}

impl Default for ProposalSearchParams {
    fn default() -> Self {
        Self {
            start: BlockQuery::Open,
            end: BlockQuery::Open,
            category: None,
            order: SortOrder::Asc,
            limit: usize::MAX,
        }
    }
}

/// Governance engine: proposals, votes and frozen tallies keyed by
/// (proposal, block). Tallies are reproducible; once a snapshot exists
/// for a key it is returned unchanged forever.
pub struct TallyEngine {
    store: Arc<dyn MarketStore>,
    gateway: Arc<dyn WalletGateway>,
    state: Arc<MarketState>,
}

impl TallyEngine {
    pub fn new(
        store: Arc<dyn MarketStore>,
        gateway: Arc<dyn WalletGateway>,
        state: Arc<MarketState>,
    ) -> Self {
        Self { store, gateway, state }
    }

    /// Registers a proposal. Identity is the content hash, so resubmitting
    /// the same proposal returns the existing row.
    pub async fn create_proposal(
        &self,
        submitter: &str,
        block_start: i64,
        block_end: i64,
        category: ProposalCategory,
        title: &str,
        options: Vec<(i32, String)>,
    ) -> Result<Proposal, MarketError> {
        if block_end <= block_start {
            return Err(MarketError::invalid_parameter(
                "block_end",
                "must be greater than block_start",
            ));
        }
        if options.is_empty() {
            return Err(MarketError::MissingParameter("options"));
        }
        let hash = proposal_hash(submitter, block_start, block_end, title);
        if let Some(existing) = self
            .store
            .proposal_by_hash(&hash, ProposalLoad::WithOptions)
            .await?
        {
            return Ok(existing);
        }
        let option_rows = options
            .into_iter()
            .map(|(option_id, description)| {
                let oh = option_hash(&hash, option_id, &description);
                (option_id, description, oh)
            })
            .collect();
        let proposal = self
            .store
            .insert_proposal(NewProposal {
                submitter: submitter.to_string(),
                block_start,
                block_end,
                hash,
                category,
                title: title.to_string(),
                options: option_rows,
            })
            .await?;
        info!(
            "[tally] created proposal={} window={}..{} options={}",
            proposal.hash,
            proposal.block_start,
            proposal.block_end,
            proposal.options.len()
        );
        Ok(proposal)
    }

    /// Records a vote for one option of a proposal. A voter may vote more
    /// than once; the tally keeps only the last vote per voter.
    pub async fn cast_vote(
        &self,
        msgid: &str,
        voter: &str,
        proposal_hash: &str,
        option_id: i32,
        weight: i64,
        block: Option<i64>,
    ) -> Result<Vote, MarketError> {
        if weight <= 0 {
            return Err(MarketError::invalid_parameter("weight", "must be positive"));
        }
        let proposal = self
            .store
            .proposal_by_hash(proposal_hash, ProposalLoad::WithOptions)
            .await?
            .ok_or_else(|| MarketError::not_found("proposal", proposal_hash))?;
        let option = proposal
            .options
            .iter()
            .find(|o| o.option_id == option_id)
            .ok_or_else(|| MarketError::not_found("proposal_option", option_id))?;
        let block = match block {
            Some(b) => b,
            None => self.gateway.chain_height().await?,
        };
        let vote = self
            .store
            .insert_vote(NewVote {
                msgid: msgid.to_string(),
                voter: voter.to_string(),
                proposal_option_id: option.id,
                block,
                weight,
            })
            .await?;
        self.state
            .counters
            .votes_recorded
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(vote)
    }

    /// Computes (or retrieves) the tally of a proposal at a snapshot block.
    /// When `block` is absent the current chain height is used. The result
    /// set always carries one row per option, zero-weight rows included.
    pub async fn compute_result(
        &self,
        hash: &str,
        block: Option<i64>,
    ) -> Result<TallySnapshot, MarketError> {
        let proposal = self
            .store
            .proposal_by_hash(hash, ProposalLoad::WithOptions)
            .await?
            .ok_or_else(|| MarketError::not_found("proposal", hash))?;
        let snapshot_block = match block {
            Some(b) => b,
            None => self.gateway.chain_height().await?,
        };

        if let Some(existing) = self.store.result_for(proposal.id, snapshot_block).await? {
            self.state
                .counters
                .tallies_reused
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(existing);
        }

        let _guard = self.state.lock_tally(proposal.id, snapshot_block).await;
        // Re-check under the lock; a concurrent caller may have landed first.
        if let Some(existing) = self.store.result_for(proposal.id, snapshot_block).await? {
            self.state
                .counters
                .tallies_reused
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(existing);
        }

        let votes = self.store.votes_upto(proposal.id, snapshot_block).await?;
        let effective = fold_last_votes(&votes);
        debug!(
            "[tally] proposal={} block={} votes={} effective={}",
            proposal.hash,
            snapshot_block,
            votes.len(),
            effective.len()
        );

        let mut options: Vec<OptionTally> = proposal
            .options
            .iter()
            .map(|o| OptionTally {
                proposal_option_id: o.id,
                option_id: o.option_id,
                weight: 0,
                voters: 0,
            })
            .collect();
        options.sort_by_key(|t| t.option_id);
        for vote in effective.values() {
            if let Some(tally) = options
                .iter_mut()
                .find(|t| t.proposal_option_id == vote.proposal_option_id)
            {
                tally.weight += vote.weight;
                tally.voters += 1;
            }
        }

        let snapshot = self
            .store
            .insert_result(proposal.id, snapshot_block, options)
            .await?;
        self.state
            .counters
            .tallies_computed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        info!(
            "[tally] froze proposal={} block={} result_id={}",
            proposal.hash, snapshot_block, snapshot.result.id
        );
        Ok(snapshot)
    }

    /// Window search over proposals; page size is capped by configuration.
    pub async fn search_by(
        &self,
        mut params: ProposalSearchParams,
    ) -> Result<Vec<Proposal>, MarketError> {
        params.limit = params.limit.min(self.state.search_page_max());
        self.store.search_proposals(&params).await
    }
}

/// Last-vote-wins fold: one effective vote per voter, picked by greatest
/// (block, insertion id).
fn fold_last_votes(votes: &[Vote]) -> HashMap<&str, &Vote> {
    let mut effective: HashMap<&str, &Vote> = HashMap::new();
    for vote in votes {
        match effective.get(vote.voter.as_str()) {
            Some(current) if (current.block, current.id) >= (vote.block, vote.id) => {}
            _ => {
                effective.insert(vote.voter.as_str(), vote);
            }
        }
    }
    effective
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn proposal(block_start: i64, block_end: i64, category: ProposalCategory) -> Proposal {
        Proposal {
            id: 1,
            submitter: "alice".into(),
            block_start,
            block_end,
            hash: "h".into(),
            category,
            title: "t".into(),
            options: Vec::new(),
            created_at: Utc::now(),
        }
    }

    fn vote(id: i64, voter: &str, option: i64, block: i64, weight: i64) -> Vote {
        Vote {
            id,
            msgid: format!("m{id}"),
            voter: voter.into(),
            proposal_option_id: option,
            block,
            weight,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn bounded_window_selects_overlap() {
        let params = ProposalSearchParams {
            start: BlockQuery::Height(100),
            end: BlockQuery::Height(200),
            ..Default::default()
        };
        assert!(params.matches(&proposal(50, 150, ProposalCategory::ItemFlag)));
        assert!(params.matches(&proposal(150, 250, ProposalCategory::ItemFlag)));
        assert!(!params.matches(&proposal(201, 300, ProposalCategory::ItemFlag)));
        assert!(!params.matches(&proposal(10, 99, ProposalCategory::ItemFlag)));
        // Touching the boundary counts as overlap.
        assert!(params.matches(&proposal(200, 300, ProposalCategory::ItemFlag)));
        assert!(params.matches(&proposal(10, 100, ProposalCategory::ItemFlag)));
    }

    #[test]
    fn half_open_windows() {
        // End-only keys on where the proposal starts, so a window that is
        // still running at the bound is included.
        let upper = ProposalSearchParams {
            end: BlockQuery::Height(60),
            ..Default::default()
        };
        assert!(upper.matches(&proposal(50, 150, ProposalCategory::PublicVote)));
        let upper = ProposalSearchParams {
            end: BlockQuery::Height(40),
            ..Default::default()
        };
        assert!(!upper.matches(&proposal(50, 150, ProposalCategory::PublicVote)));
        assert!(!upper.matches(&proposal(40, 90, ProposalCategory::PublicVote)));

        let lower = ProposalSearchParams {
            start: BlockQuery::Height(60),
            ..Default::default()
        };
        assert!(lower.matches(&proposal(10, 61, ProposalCategory::PublicVote)));
        assert!(!lower.matches(&proposal(10, 60, ProposalCategory::PublicVote)));

        let all = ProposalSearchParams::default();
        assert!(all.matches(&proposal(0, 1, ProposalCategory::ItemFlag)));
    }

    #[test]
    fn extreme_window_bounds_do_not_overflow() {
        let widest = ProposalSearchParams {
            start: BlockQuery::Height(i64::MIN),
            end: BlockQuery::Height(i64::MAX),
            ..Default::default()
        };
        assert!(widest.matches(&proposal(50, 150, ProposalCategory::PublicVote)));
    }

    #[test]
    fn category_filter_applies_on_top_of_window() {
        let params = ProposalSearchParams {
            category: Some(ProposalCategory::ItemFlag),
            ..Default::default()
        };
        assert!(params.matches(&proposal(1, 2, ProposalCategory::ItemFlag)));
        assert!(!params.matches(&proposal(1, 2, ProposalCategory::PublicVote)));
    }

    #[test]
    fn last_vote_wins_by_block_then_id() {
        let votes = vec![
            vote(1, "v", 10, 10, 5),
            vote(2, "v", 20, 20, 7),
            vote(3, "w", 10, 15, 3),
            // Same block as id 3, later insertion: wins for w.
            vote(4, "w", 20, 15, 4),
        ];
        let effective = fold_last_votes(&votes);
        assert_eq!(effective.len(), 2);
        assert_eq!(effective["v"].id, 2);
        assert_eq!(effective["v"].proposal_option_id, 20);
        assert_eq!(effective["w"].id, 4);
    }
}
