//! Mint auction
//!
//! The only way new scrip enters the world. Agents escrow sealed bids
//! on their own artifacts; each period the highest bidder wins, pays
//! the second-highest bid (or the reserve when alone), has the
//! artifact scored, and receives newly minted scrip proportional to
//! the score. The clearing price is recycled to everyone else as UBI,
//! so resolution never destroys scrip.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use agora_audit::EventLog;
use agora_ledger::{Clock, Ledger, SystemClock};
use agora_llm::{CompletionProvider, CompletionRequest, Message};
use agora_store::ArtifactStore;
use agora_types::{ErrorCode, Scrip};

/// Auction timing and pricing knobs.
#[derive(Debug, Clone)]
pub struct MintConfig {
    pub minimum_bid: Scrip,
    pub first_auction_delay_seconds: f64,
    pub bidding_window_seconds: f64,
    pub period_seconds: f64,
    /// Score points per minted scrip.
    pub mint_ratio: i64,
}

impl Default for MintConfig {
    fn default() -> Self {
        Self {
            minimum_bid: 1,
            first_auction_delay_seconds: 20.0,
            bidding_window_seconds: 30.0,
            period_seconds: 60.0,
            mint_ratio: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MintSubmission {
    pub submission_id: String,
    pub principal_id: String,
    pub artifact_id: String,
    pub bid: Scrip,
    pub submitted_at_event: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MintResult {
    pub winner_id: Option<String>,
    pub artifact_id: Option<String>,
    pub winning_bid: Scrip,
    pub price_paid: Scrip,
    pub score: Option<i64>,
    pub score_reason: Option<String>,
    pub scrip_minted: Scrip,
    pub ubi_distributed: BTreeMap<String, Scrip>,
    pub error: Option<String>,
    pub resolved_at_event: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("artifact '{0}' not found")]
    ArtifactNotFound(String),
    #[error("bid must be >= {0}")]
    BidTooLow(Scrip),
    #[error("insufficient scrip for bid")]
    InsufficientScrip,
    #[error("submitter is not authorized for artifact")]
    NotAuthorized,
}

impl SubmitError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SubmitError::ArtifactNotFound(_) => ErrorCode::NotFound,
            SubmitError::BidTooLow(_) => ErrorCode::InvalidSubmission,
            SubmitError::InsufficientScrip => ErrorCode::InsufficientFunds,
            SubmitError::NotAuthorized => ErrorCode::NotAuthorized,
        }
    }
}

/// Scores the winning artifact 0..=100. Asks the model first and falls
/// back to a length heuristic when the model is unavailable or returns
/// something unusable.
pub struct MintScorer {
    provider: Arc<dyn CompletionProvider>,
    model: String,
}

impl MintScorer {
    pub fn new(provider: Arc<dyn CompletionProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    pub fn score_artifact(
        &self,
        artifact_id: &str,
        artifact_type: &str,
        content: &str,
        code: &str,
    ) -> (i64, String) {
        let content_head: String = content.chars().take(4000).collect();
        let code_head: String = code.chars().take(6000).collect();
        let prompt = format!(
            "Score this artifact from 0-100 for utility and correctness. \
             Return JSON: {{\"score\": int, \"reason\": str}}.\n\n\
             Artifact: {artifact_id}\nType: {artifact_type}\n\
             Content:\n{content_head}\n\nCode:\n{code_head}"
        );
        let request = CompletionRequest::new(&self.model, vec![Message::user(prompt)]);
        if let Ok(response) = self.provider.complete(&request) {
            if let Some((score, reason)) = parse_score(&response.content) {
                return (score.clamp(0, 100), reason);
            }
        }

        let length_score = (((content.len() + code.len()) / 120) as i64).clamp(10, 70);
        let bonus = if code.contains("fn run(") { 20 } else { 0 };
        (
            (length_score + bonus).clamp(0, 100),
            "fallback score based on artifact complexity".to_string(),
        )
    }
}

fn parse_score(payload: &str) -> Option<(i64, String)> {
    let start = payload.find('{')?;
    let end = payload.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&payload[start..=end]).ok()?;
    let score = parsed.get("score")?.as_i64()?;
    let reason = parsed
        .get("reason")
        .and_then(Value::as_str)
        .unwrap_or("model score")
        .to_string();
    Some((score, reason))
}

/// Auction state machine. The ledger, store, and event log belong to
/// the world; every operation borrows them for its duration so the
/// escrow moves stay in the same mutation scope as everything else.
pub struct MintAuction {
    config: MintConfig,
    scorer: MintScorer,
    clock: Arc<dyn Clock>,
    submissions: BTreeMap<String, MintSubmission>,
    history: Vec<MintResult>,
    start_time: f64,
    auction_started_at: Option<f64>,
}

impl MintAuction {
    pub fn new(config: MintConfig, scorer: MintScorer) -> Self {
        Self::with_clock(config, scorer, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MintConfig, scorer: MintScorer, clock: Arc<dyn Clock>) -> Self {
        let start_time = clock.now();
        Self {
            config,
            scorer,
            clock,
            submissions: BTreeMap::new(),
            history: Vec::new(),
            start_time,
            auction_started_at: None,
        }
    }

    pub fn minimum_bid(&self) -> Scrip {
        self.config.minimum_bid
    }

    pub fn submissions(&self) -> Vec<Value> {
        self.submissions
            .values()
            .filter_map(|s| serde_json::to_value(s).ok())
            .collect()
    }

    pub fn history(&self, limit: usize) -> Vec<Value> {
        let skip = self.history.len().saturating_sub(limit);
        self.history
            .iter()
            .skip(skip)
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect()
    }

    /// Escrow a bid on an artifact. The bid is deducted immediately;
    /// it comes back via cancellation, losing, or the winner refund.
    pub fn submit(
        &mut self,
        principal_id: &str,
        artifact_id: &str,
        bid: Scrip,
        ledger: &mut Ledger,
        store: &ArtifactStore,
        log: &mut dyn EventLog,
        event_number: u64,
    ) -> Result<String, SubmitError> {
        let artifact = store
            .get(artifact_id)
            .filter(|a| !a.deleted)
            .ok_or_else(|| SubmitError::ArtifactNotFound(artifact_id.to_string()))?;
        if bid < self.config.minimum_bid {
            return Err(SubmitError::BidTooLow(self.config.minimum_bid));
        }
        if !ledger.can_afford(principal_id, bid) {
            return Err(SubmitError::InsufficientScrip);
        }
        let authorized = principal_id == artifact.owner
            || principal_id == artifact.auth_writer()
            || principal_id == artifact.auth_principal();
        if !authorized {
            return Err(SubmitError::NotAuthorized);
        }

        if !ledger.deduct(principal_id, bid) {
            return Err(SubmitError::InsufficientScrip);
        }
        let submission_id = format!("mint_sub_{}", &Uuid::new_v4().simple().to_string()[..10]);
        self.submissions.insert(
            submission_id.clone(),
            MintSubmission {
                submission_id: submission_id.clone(),
                principal_id: principal_id.to_string(),
                artifact_id: artifact_id.to_string(),
                bid,
                submitted_at_event: event_number,
            },
        );
        log.log(
            "mint_submission",
            fields(&[
                ("event_number", json!(event_number)),
                ("principal_id", json!(principal_id)),
                ("artifact_id", json!(artifact_id)),
                ("bid", json!(bid)),
                ("submission_id", json!(submission_id)),
            ]),
        );
        Ok(submission_id)
    }

    /// Withdraw a pending submission and refund its escrow.
    pub fn cancel(
        &mut self,
        principal_id: &str,
        submission_id: &str,
        ledger: &mut Ledger,
        log: &mut dyn EventLog,
        event_number: u64,
    ) -> bool {
        let owned = self
            .submissions
            .get(submission_id)
            .is_some_and(|s| s.principal_id == principal_id);
        if !owned {
            return false;
        }
        if let Some(submission) = self.submissions.remove(submission_id) {
            ledger.credit(principal_id, submission.bid);
        }
        log.log(
            "mint_submission_cancelled",
            fields(&[
                ("event_number", json!(event_number)),
                ("submission_id", json!(submission_id)),
                ("principal_id", json!(principal_id)),
            ]),
        );
        true
    }

    pub fn status(&self) -> Value {
        let now = self.clock.now();
        let phase = if now - self.start_time < self.config.first_auction_delay_seconds {
            "waiting_first_auction"
        } else if self.auction_started_at.is_none() {
            "waiting_bidding_window"
        } else if self
            .auction_started_at
            .is_some_and(|t| now - t < self.config.bidding_window_seconds)
        {
            "bidding"
        } else {
            "resolving"
        };
        json!({
            "phase": phase,
            "pending_submissions": self.submissions.len(),
            "history_count": self.history.len(),
            "minimum_bid": self.config.minimum_bid,
        })
    }

    /// Advance the schedule; resolves at most one auction per call.
    pub fn update(
        &mut self,
        ledger: &mut Ledger,
        store: &ArtifactStore,
        log: &mut dyn EventLog,
        event_number: u64,
    ) -> Option<MintResult> {
        let now = self.clock.now();
        if now - self.start_time < self.config.first_auction_delay_seconds {
            return None;
        }
        let Some(started_at) = self.auction_started_at else {
            self.auction_started_at = Some(now);
            return None;
        };
        let elapsed = now - started_at;
        if elapsed < self.config.bidding_window_seconds {
            return None;
        }
        let result = self.resolve(ledger, store, log, event_number);
        // Keep the cadence unless we are already a full period behind.
        if elapsed >= self.config.period_seconds {
            self.auction_started_at = Some(now);
        } else {
            self.auction_started_at = Some(started_at + self.config.period_seconds);
        }
        Some(result)
    }

    /// Settle the pending pool: second-price clearing, scoring, mint,
    /// and UBI recycling of the clearing price.
    pub fn resolve(
        &mut self,
        ledger: &mut Ledger,
        store: &ArtifactStore,
        log: &mut dyn EventLog,
        event_number: u64,
    ) -> MintResult {
        if self.submissions.is_empty() {
            let result = MintResult {
                winner_id: None,
                artifact_id: None,
                winning_bid: 0,
                price_paid: 0,
                score: None,
                score_reason: None,
                scrip_minted: 0,
                ubi_distributed: BTreeMap::new(),
                error: Some("no submissions".to_string()),
                resolved_at_event: event_number,
            };
            self.history.push(result.clone());
            return result;
        }

        let mut ranked: Vec<MintSubmission> =
            self.submissions.values().cloned().collect();
        ranked.sort_by(|a, b| b.bid.cmp(&a.bid));

        let winner = ranked[0].clone();
        let price_paid = ranked
            .get(1)
            .map(|s| s.bid)
            .unwrap_or(self.config.minimum_bid);

        for losing in &ranked[1..] {
            ledger.credit(&losing.principal_id, losing.bid);
        }
        let winner_refund = winner.bid - price_paid;
        if winner_refund > 0 {
            ledger.credit(&winner.principal_id, winner_refund);
        }

        let (score, score_reason, minted, error) = match store.get(&winner.artifact_id) {
            None => (None, None, 0, Some("winner artifact disappeared".to_string())),
            Some(artifact) => {
                let (score, reason) = self.scorer.score_artifact(
                    &artifact.id,
                    &artifact.artifact_type,
                    &artifact.content,
                    &artifact.code,
                );
                let minted = score / self.config.mint_ratio.max(1);
                if minted > 0 {
                    ledger.credit(&winner.principal_id, minted);
                }
                (Some(score), Some(reason), minted, None)
            }
        };

        let ubi = ledger.distribute_ubi(price_paid, Some(&winner.principal_id));
        let result = MintResult {
            winner_id: Some(winner.principal_id.clone()),
            artifact_id: Some(winner.artifact_id.clone()),
            winning_bid: winner.bid,
            price_paid,
            score,
            score_reason,
            scrip_minted: minted,
            ubi_distributed: ubi,
            error,
            resolved_at_event: event_number,
        };

        self.history.push(result.clone());
        self.submissions.clear();
        info!(
            winner = %winner.principal_id,
            price_paid,
            minted,
            "mint auction resolved"
        );
        let mut event_fields = fields(&[("event_number", json!(event_number))]);
        if let Ok(Value::Object(result_fields)) = serde_json::to_value(&result) {
            for (key, value) in result_fields {
                event_fields.insert(key, value);
            }
        }
        log.log("mint_auction", event_fields);
        result
    }
}

fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_audit::MemoryEventLog;
    use agora_ledger::RateTracker;
    use agora_llm::DeterministicProvider;
    use agora_store::WriteRequest;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct ManualClock {
        millis: AtomicU64,
    }

    impl ManualClock {
        fn advance(&self, seconds: f64) {
            self.millis
                .fetch_add((seconds * 1000.0) as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> f64 {
            self.millis.load(Ordering::SeqCst) as f64 / 1000.0
        }
    }

    struct Fixture {
        auction: MintAuction,
        ledger: Ledger,
        store: ArtifactStore,
        log: MemoryEventLog,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let scorer = MintScorer::new(Arc::new(DeterministicProvider::new()), "test-model");
        let auction = MintAuction::with_clock(MintConfig::default(), scorer, clock.clone());
        let mut ledger = Ledger::new(RateTracker::new(60.0));
        let mut store = ArtifactStore::new();
        for pid in ["alpha_1", "alpha_2", "alpha_3"] {
            ledger.create_principal(pid, 100, &[]);
            store
                .write(
                    &format!("{pid}_note"),
                    pid,
                    WriteRequest {
                        artifact_type: "note".to_string(),
                        content: "x".repeat(3000),
                        ..Default::default()
                    },
                )
                .unwrap();
        }
        Fixture {
            auction,
            ledger,
            store,
            log: MemoryEventLog::default(),
            clock,
        }
    }

    fn submit(f: &mut Fixture, pid: &str, bid: Scrip) -> Result<String, SubmitError> {
        let artifact = format!("{pid}_note");
        f.auction
            .submit(pid, &artifact, bid, &mut f.ledger, &f.store, &mut f.log, 1)
    }

    #[test]
    fn second_price_settlement_with_ubi() {
        let mut f = fixture();
        submit(&mut f, "alpha_1", 10).unwrap();
        submit(&mut f, "alpha_2", 6).unwrap();
        assert_eq!(f.ledger.scrip("alpha_1"), 90);
        assert_eq!(f.ledger.scrip("alpha_2"), 94);

        let result = f.auction.resolve(&mut f.ledger, &f.store, &mut f.log, 2);
        assert_eq!(result.winner_id.as_deref(), Some("alpha_1"));
        assert_eq!(result.price_paid, 6);
        // Content is 3000 chars: fallback score 25, ratio 10 -> 2 minted.
        assert_eq!(result.score, Some(25));
        assert_eq!(result.scrip_minted, 2);

        // Winner: 100 - 10 + 4 refund + 2 minted.
        assert_eq!(f.ledger.scrip("alpha_1"), 96);
        // Loser refunded in full, then UBI: 6 split over alpha_2/alpha_3.
        assert_eq!(result.ubi_distributed.values().sum::<Scrip>(), 6);
        assert_eq!(f.ledger.scrip("alpha_2"), 103);
        assert_eq!(f.ledger.scrip("alpha_3"), 103);
    }

    #[test]
    fn sole_submission_pays_the_reserve() {
        let mut f = fixture();
        submit(&mut f, "alpha_1", 8).unwrap();
        let result = f.auction.resolve(&mut f.ledger, &f.store, &mut f.log, 2);
        assert_eq!(result.price_paid, 1);
        assert_eq!(result.winning_bid, 8);
        // 100 - 8 + 7 refund + 2 minted.
        assert_eq!(f.ledger.scrip("alpha_1"), 101);
    }

    #[test]
    fn submission_validations_are_distinct() {
        let mut f = fixture();
        assert_eq!(
            submit(&mut f, "alpha_1", 0).unwrap_err(),
            SubmitError::BidTooLow(1)
        );
        assert_eq!(
            submit(&mut f, "alpha_1", 1000).unwrap_err(),
            SubmitError::InsufficientScrip
        );
        let err = f
            .auction
            .submit(
                "alpha_1",
                "alpha_2_note",
                5,
                &mut f.ledger,
                &f.store,
                &mut f.log,
                1,
            )
            .unwrap_err();
        assert_eq!(err, SubmitError::NotAuthorized);
        let err = f
            .auction
            .submit("alpha_1", "missing", 5, &mut f.ledger, &f.store, &mut f.log, 1)
            .unwrap_err();
        assert!(matches!(err, SubmitError::ArtifactNotFound(_)));
    }

    #[test]
    fn cancel_refunds_the_escrow() {
        let mut f = fixture();
        let id = submit(&mut f, "alpha_1", 10).unwrap();
        assert_eq!(f.ledger.scrip("alpha_1"), 90);
        assert!(f.auction.cancel("alpha_2", &id, &mut f.ledger, &mut f.log, 2) == false);
        assert!(f.auction.cancel("alpha_1", &id, &mut f.ledger, &mut f.log, 2));
        assert_eq!(f.ledger.scrip("alpha_1"), 100);
        assert!(!f.auction.cancel("alpha_1", &id, &mut f.ledger, &mut f.log, 2));
    }

    #[test]
    fn phases_follow_the_schedule() {
        let mut f = fixture();
        assert_eq!(f.auction.status()["phase"], "waiting_first_auction");
        assert!(f
            .auction
            .update(&mut f.ledger, &f.store, &mut f.log, 1)
            .is_none());

        f.clock.advance(21.0);
        assert_eq!(f.auction.status()["phase"], "waiting_bidding_window");
        // First update past the delay opens the bidding window.
        assert!(f
            .auction
            .update(&mut f.ledger, &f.store, &mut f.log, 2)
            .is_none());
        assert_eq!(f.auction.status()["phase"], "bidding");

        f.clock.advance(31.0);
        assert_eq!(f.auction.status()["phase"], "resolving");
        submit(&mut f, "alpha_1", 3).unwrap();
        let result = f
            .auction
            .update(&mut f.ledger, &f.store, &mut f.log, 3)
            .unwrap();
        assert_eq!(result.winner_id.as_deref(), Some("alpha_1"));
    }

    #[test]
    fn empty_pool_resolves_in_band() {
        let mut f = fixture();
        let result = f.auction.resolve(&mut f.ledger, &f.store, &mut f.log, 1);
        assert_eq!(result.error.as_deref(), Some("no submissions"));
        assert_eq!(result.scrip_minted, 0);
        assert_eq!(f.auction.history(10).len(), 1);
    }
}
