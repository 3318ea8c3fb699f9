//! Race track: the per-guild registry of live races and the flow around
//! them (betting window, cancellation refunds, the race itself, settlement
//! and reaping of orphaned sessions).
//!
//! One race per guild. Each session sits behind its own async mutex, so a
//! long race in one guild never holds up bets or races in another.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::racing::{BetType, Horse, RaceBet, RaceSession, RaceStatus};
use super::rng::RngSource;
use super::settlement::{Settlement, SettlementRequest};
use crate::config::RacingConfig;
use crate::error::{EngineResult, Rejection};
use crate::types::{GameResult, GameType};

type SharedSession = Arc<AsyncMutex<RaceSession>>;

/// A race in progress is only presumed orphaned after this many TTLs.
const RACING_TTL_FACTOR: i32 = 4;

/// Read-only view of a race for display.
#[derive(Debug, Clone, Serialize)]
pub struct RaceSnapshot {
    pub race_id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub status: RaceStatus,
    pub horses: Vec<HorseCard>,
    pub bettors: usize,
    pub total_pool: f64,
    pub created_at: DateTime<Utc>,
    pub betting_ends_at: DateTime<Utc>,
    pub finish_order: Vec<u8>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HorseCard {
    #[serde(flatten)]
    pub horse: Horse,
    pub form: &'static str,
    pub multiplier: f64,
}

impl From<&RaceSession> for RaceSnapshot {
    fn from(s: &RaceSession) -> Self {
        Self {
            race_id: s.race_id.clone(),
            guild_id: s.guild_id.clone(),
            channel_id: s.channel_id.clone(),
            status: s.status,
            horses: s
                .horses
                .iter()
                .map(|h| HorseCard {
                    horse: h.clone(),
                    form: h.form(),
                    multiplier: h.multiplier(),
                })
                .collect(),
            bettors: s.bets.len(),
            total_pool: s.total_pool,
            created_at: s.created_at,
            betting_ends_at: s.betting_ends_at,
            finish_order: s.finish_order.clone(),
        }
    }
}

/// What happened when betting closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum BettingOutcome {
    /// Too few bettors; every stake refunded and the race removed.
    Cancelled { bettors: usize, refunded: usize },
    Started { bettors: usize },
}

#[derive(Debug, Clone, Serialize)]
pub struct RaceReport {
    pub race_id: String,
    pub guild_id: String,
    pub finish_order: Vec<u8>,
    pub podium: Vec<u8>,
    /// Winners only.
    pub payouts: BTreeMap<String, f64>,
    pub total_pool: f64,
    pub house_take: f64,
    pub settlement_failures: usize,
}

pub struct RaceTrack {
    settlement: Arc<Settlement>,
    config: RacingConfig,
    rng: Arc<RngSource>,
    sessions: Mutex<HashMap<String, SharedSession>>,
}

impl RaceTrack {
    pub fn new(settlement: Arc<Settlement>, config: RacingConfig, rng: Arc<RngSource>) -> Self {
        Self {
            settlement,
            config,
            rng,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, SharedSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, guild_id: &str) -> Result<SharedSession, Rejection> {
        self.registry()
            .get(guild_id)
            .cloned()
            .ok_or(Rejection::RaceNotFound)
    }

    fn remove(&self, guild_id: &str, race_id: &str) {
        let mut registry = self.registry();
        // Only drop the entry if it is still this race.
        let same_race = registry
            .get(guild_id)
            .and_then(|s| s.try_lock().ok().map(|s| s.race_id == race_id))
            .unwrap_or(true);
        if same_race {
            registry.remove(guild_id);
        }
    }

    pub fn active_count(&self) -> usize {
        self.registry().len()
    }

    /// Open betting on a new race. Fails if the guild already has one.
    pub fn start_race(&self, guild_id: &str, channel_id: &str) -> Result<RaceSnapshot, Rejection> {
        let mut registry = self.registry();
        if registry.contains_key(guild_id) {
            return Err(Rejection::RaceAlreadyActive);
        }

        let session = RaceSession::new(
            guild_id,
            channel_id,
            self.config.distance,
            self.config.betting_window(),
            self.rng.fork(),
        );
        let snapshot = RaceSnapshot::from(&session);
        registry.insert(guild_id.to_string(), Arc::new(AsyncMutex::new(session)));

        info!(guild_id, race_id = %snapshot.race_id, "Race opened for betting");
        Ok(snapshot)
    }

    /// Validate, escrow and record one bet.
    pub async fn place_bet(
        &self,
        guild_id: &str,
        user_id: &str,
        bet_type: BetType,
        horses: Vec<u8>,
        amount: f64,
    ) -> EngineResult<RaceBet> {
        let shared = self.session(guild_id)?;
        let mut session = shared.lock().await;

        session.validate_bet(user_id, bet_type, &horses)?;
        self.settlement.check_bet_range(amount)?;

        let picks = horses
            .iter()
            .map(|n| format!("#{n}"))
            .collect::<Vec<_>>()
            .join(", ");
        self.settlement
            .escrow(
                user_id,
                amount,
                GameType::Racing,
                &format!("{bet_type} bet on {picks} (race {})", session.race_id),
            )
            .await?;

        let bet = RaceBet::new(user_id, amount, bet_type, horses);
        session.record_bet(bet.clone());

        info!(
            guild_id,
            race_id = %session.race_id,
            user_id,
            bet_type = %bet_type,
            amount = format!("${amount:.2}"),
            pool = format!("${:.2}", session.total_pool),
            "Race bet placed"
        );
        Ok(bet)
    }

    /// Refund every stake that has not been settled yet. Returns how many
    /// refunds succeeded.
    async fn refund_unsettled(&self, session: &mut RaceSession, reason: &str) -> usize {
        let mut refunded = 0;
        for bet in session.unsettled_bets() {
            match self
                .settlement
                .refund(&bet.user_id, bet.amount, GameType::Racing, reason)
                .await
            {
                Ok(()) => {
                    session.settled.insert(bet.user_id.clone());
                    refunded += 1;
                }
                Err(e) => error!(
                    race_id = %session.race_id,
                    user_id = %bet.user_id,
                    error = %e,
                    "Race refund failed"
                ),
            }
        }
        refunded
    }

    /// End the betting window: cancel and refund if too few players bet,
    /// otherwise move the race to `Racing`.
    pub async fn close_betting(&self, guild_id: &str) -> EngineResult<BettingOutcome> {
        let shared = self.session(guild_id)?;
        let mut session = shared.lock().await;
        if session.status != RaceStatus::Betting {
            return Err(Rejection::BettingClosed.into());
        }

        let bettors = session.bets.len();
        if bettors < self.config.min_bettors {
            session.cancel();
            let refunded = self.refund_unsettled(&mut session, "race cancelled").await;
            let race_id = session.race_id.clone();
            if refunded == bettors {
                drop(session);
                self.remove(guild_id, &race_id);
            } else {
                warn!(race_id = %race_id, "Cancelled race kept for reaping: refunds outstanding");
            }
            info!(guild_id, race_id = %race_id, bettors, refunded, "Race cancelled: not enough bettors");
            return Ok(BettingOutcome::Cancelled { bettors, refunded });
        }

        session.start_racing();
        info!(guild_id, race_id = %session.race_id, bettors, "Betting closed, race starting");
        Ok(BettingOutcome::Started { bettors })
    }

    /// Run a started race to the finish with the configured tick pacing,
    /// then settle every bettor.
    pub async fn run_race(&self, guild_id: &str) -> EngineResult<RaceReport> {
        let shared = self.session(guild_id)?;
        {
            let session = shared.lock().await;
            if session.status != RaceStatus::Racing {
                return Err(Rejection::illegal("run race", "betting is still open").into());
            }
        }

        let tick = self.config.tick();
        loop {
            let done = {
                let mut session = shared.lock().await;
                let done = session.tick();
                debug!(race_id = %session.race_id, finished = session.finish_order.len(), "Race tick");
                done
            };
            if done {
                break;
            }
            if !tick.is_zero() {
                tokio::time::sleep(tick).await;
            }
        }

        let mut session = shared.lock().await;
        let report = self.settle(&mut session).await;
        let race_id = session.race_id.clone();
        drop(session);

        if report.settlement_failures == 0 {
            self.remove(guild_id, &race_id);
        } else {
            warn!(race_id = %race_id, failures = report.settlement_failures, "Finished race kept for reaping");
        }
        Ok(report)
    }

    /// Settle every bettor of a finished race. Winners are credited their
    /// payout; losers are settled with zero.
    async fn settle(&self, session: &mut RaceSession) -> RaceReport {
        let finish_order = session.finish_order.clone();
        let payouts = session.calculate_payouts(&finish_order);
        let podium = session.podium().to_vec();

        let pending = session.unsettled_bets();
        let settlements = pending.iter().map(|bet| {
            let payout = payouts.get(&bet.user_id).copied().unwrap_or(0.0);
            let result = if payout > 0.0 {
                GameResult::Win
            } else {
                GameResult::Loss
            };
            self.settlement.settle_result(SettlementRequest {
                account_id: bet.user_id.clone(),
                guild_id: session.guild_id.clone(),
                game_type: GameType::Racing,
                bet_amount: bet.amount,
                payout_amount: payout,
                result,
                game_data: json!({
                    "race_id": session.race_id,
                    "bet_type": bet.bet_type,
                    "horse_numbers": bet.horses,
                    "podium": podium,
                    "total_pool": session.total_pool,
                }),
            })
        });
        let results = join_all(settlements).await;

        let mut failures = 0;
        for (bet, result) in pending.iter().zip(results) {
            match result {
                Ok(_) => {
                    session.settled.insert(bet.user_id.clone());
                }
                Err(e) => {
                    failures += 1;
                    error!(race_id = %session.race_id, user_id = %bet.user_id, error = %e, "Race settlement failed");
                }
            }
        }

        let report = RaceReport {
            race_id: session.race_id.clone(),
            guild_id: session.guild_id.clone(),
            finish_order,
            podium,
            payouts,
            total_pool: session.total_pool,
            house_take: session.house_take(self.config.house_rake),
            settlement_failures: failures,
        };

        info!(
            race_id = %report.race_id,
            winner = ?report.finish_order.first(),
            winners = report.payouts.len(),
            pool = format!("${:.2}", report.total_pool),
            house_take = format!("${:.2}", report.house_take),
            "Race settled"
        );
        report
    }

    /// Betting window, close, and race, end to end. `None` if cancelled.
    pub async fn run_lifecycle(&self, guild_id: &str) -> EngineResult<Option<RaceReport>> {
        tokio::time::sleep(self.config.betting_window()).await;
        match self.close_betting(guild_id).await? {
            BettingOutcome::Cancelled { .. } => Ok(None),
            BettingOutcome::Started { .. } => self.run_race(guild_id).await.map(Some),
        }
    }

    /// Remove sessions older than the TTL that nobody is driving, refunding
    /// any stake not yet settled. Returns how many sessions were removed.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> usize {
        let ttl = chrono::Duration::from_std(std::time::Duration::from_secs(self.config.session_ttl_secs))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let candidates: Vec<(String, SharedSession)> = self
            .registry()
            .iter()
            .map(|(g, s)| (g.clone(), s.clone()))
            .collect();

        let mut reaped = 0;
        for (guild_id, shared) in candidates {
            // A locked session is being driven right now.
            let Ok(mut session) = shared.try_lock() else { continue };
            // Between ticks the driver releases the lock, so a running race
            // looks idle here.
            let limit = match session.status {
                RaceStatus::Racing => ttl * RACING_TTL_FACTOR,
                _ => ttl,
            };
            if session.created_at + limit > now {
                continue;
            }

            let outstanding = session.unsettled_bets().len();
            let refunded = self.refund_unsettled(&mut session, "race abandoned").await;
            if refunded < outstanding {
                warn!(race_id = %session.race_id, "Stale race not reaped: refunds outstanding");
                continue;
            }

            let race_id = session.race_id.clone();
            drop(session);
            self.remove(&guild_id, &race_id);
            reaped += 1;
            warn!(guild_id = %guild_id, race_id = %race_id, refunded, "Reaped stale race session");
        }
        reaped
    }

    pub async fn snapshot(&self, guild_id: &str) -> Option<RaceSnapshot> {
        let shared = self.session(guild_id).ok()?;
        let session = shared.lock().await;
        Some(RaceSnapshot::from(&*session))
    }

    /// Every live race, skipping any that is mid-update.
    pub fn snapshots(&self) -> Vec<RaceSnapshot> {
        self.registry()
            .values()
            .filter_map(|s| s.try_lock().ok().map(|s| RaceSnapshot::from(&*s)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GamblingConfig;
    use crate::storage::{LedgerStore, MemoryStore, TransactionFilter};
    use crate::types::{Account, TransactionKind};

    fn fast_config() -> RacingConfig {
        RacingConfig {
            betting_window_secs: 0,
            tick_millis: 0,
            ..RacingConfig::default()
        }
    }

    async fn track(players: &[&str]) -> (Arc<MemoryStore>, RaceTrack) {
        let store = Arc::new(MemoryStore::new());
        for p in players {
            store.insert_account(Account::new(p, p, p, 1000.0)).await.unwrap();
        }
        let settlement = Arc::new(Settlement::new(store.clone(), GamblingConfig::default(), "bank"));
        let track = RaceTrack::new(settlement, fast_config(), Arc::new(RngSource::new(Some(21))));
        (store, track)
    }

    async fn cash(store: &MemoryStore, id: &str) -> f64 {
        store.find_account(id).await.unwrap().unwrap().cash
    }

    #[tokio::test]
    async fn test_one_race_per_guild() {
        let (_, track) = track(&[]).await;
        track.start_race("g1", "c").unwrap();
        assert_eq!(track.start_race("g1", "c").unwrap_err(), Rejection::RaceAlreadyActive);
        assert!(track.start_race("g2", "c").is_ok());
        assert_eq!(track.active_count(), 2);
    }

    #[tokio::test]
    async fn test_bet_is_escrowed_immediately() {
        let (store, track) = track(&["a"]).await;
        track.start_race("g", "c").unwrap();
        track.place_bet("g", "a", BetType::Win, vec![1], 100.0).await.unwrap();
        assert_eq!(cash(&store, "a").await, 900.0);

        let err = track.place_bet("g", "a", BetType::Win, vec![2], 50.0).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::DuplicateBet { amount: 100.0 }));
        assert_eq!(cash(&store, "a").await, 900.0);
    }

    #[tokio::test]
    async fn test_bet_rejections_take_nothing() {
        let (store, track) = track(&["a"]).await;
        let err = track.place_bet("g", "a", BetType::Win, vec![1], 100.0).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::RaceNotFound));

        track.start_race("g", "c").unwrap();
        let err = track.place_bet("g", "a", BetType::Win, vec![1], 5000.0).await.unwrap_err();
        assert!(matches!(err.rejection(), Some(Rejection::BetOutOfRange { .. })));
        let err = track.place_bet("g", "ghost", BetType::Win, vec![1], 10.0).await.unwrap_err();
        assert_eq!(err.rejection(), Some(&Rejection::AccountNotFound));
        assert_eq!(cash(&store, "a").await, 1000.0);
    }

    #[tokio::test]
    async fn test_too_few_bettors_refunds_and_removes() {
        let (store, track) = track(&["a"]).await;
        track.start_race("g", "c").unwrap();
        track.place_bet("g", "a", BetType::Show, vec![4], 75.0).await.unwrap();

        let outcome = track.close_betting("g").await.unwrap();
        assert_eq!(outcome, BettingOutcome::Cancelled { bettors: 1, refunded: 1 });
        assert_eq!(cash(&store, "a").await, 1000.0);
        assert_eq!(track.active_count(), 0);

        let refunds = store
            .find_transactions(&TransactionFilter::for_account("a").kind(TransactionKind::GamblingRefund))
            .await
            .unwrap();
        assert_eq!(refunds.len(), 1);
        assert!(store.snapshot().await.history.is_empty());
    }

    #[tokio::test]
    async fn test_full_race_settles_every_bettor() {
        let (store, track) = track(&["a", "b", "c"]).await;
        track.start_race("g", "c").unwrap();
        track.place_bet("g", "a", BetType::Win, vec![1], 100.0).await.unwrap();
        track.place_bet("g", "b", BetType::Show, vec![2], 100.0).await.unwrap();
        track.place_bet("g", "c", BetType::Exacta, vec![3, 4], 100.0).await.unwrap();

        let report = track.run_lifecycle("g").await.unwrap().unwrap();
        assert_eq!(report.finish_order.len(), 8);
        assert_eq!(report.podium.len(), 4);
        assert_eq!(report.total_pool, 300.0);
        assert!((report.house_take - 30.0).abs() < 1e-9);
        assert_eq!(report.settlement_failures, 0);
        assert_eq!(track.active_count(), 0);

        // One history record per bettor; cash reflects stake plus payout.
        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.history.len(), 3);
        for p in ["a", "b", "c"] {
            let payout = report.payouts.get(p).copied().unwrap_or(0.0);
            assert!((cash(&store, p).await - (900.0 + payout)).abs() < 1e-9);
        }
        let settled: u64 = snapshot.accounts.values().map(|a| a.wins + a.losses).sum();
        assert_eq!(settled, 3);
    }

    #[tokio::test]
    async fn test_run_race_requires_closed_betting() {
        let (_, track) = track(&[]).await;
        track.start_race("g", "c").unwrap();
        let err = track.run_race("g").await.unwrap_err();
        assert!(matches!(err.rejection(), Some(Rejection::IllegalMove { .. })));
    }

    #[tokio::test]
    async fn test_reaper_refunds_orphaned_race() {
        let (store, track) = track(&["a", "b"]).await;
        track.start_race("g", "c").unwrap();
        track.place_bet("g", "a", BetType::Win, vec![1], 200.0).await.unwrap();
        track.place_bet("g", "b", BetType::Win, vec![2], 300.0).await.unwrap();

        // Not yet stale.
        assert_eq!(track.reap_stale(Utc::now()).await, 0);
        assert_eq!(track.active_count(), 1);

        let later = Utc::now() + chrono::Duration::seconds(901);
        assert_eq!(track.reap_stale(later).await, 1);
        assert_eq!(track.active_count(), 0);
        assert_eq!(cash(&store, "a").await, 1000.0);
        assert_eq!(cash(&store, "b").await, 1000.0);
    }

    #[tokio::test]
    async fn test_reaper_leaves_running_race_alone() {
        let (store, track) = track(&["a", "b"]).await;
        track.start_race("g", "c").unwrap();
        track.place_bet("g", "a", BetType::Win, vec![1], 200.0).await.unwrap();
        track.place_bet("g", "b", BetType::Win, vec![2], 300.0).await.unwrap();
        assert!(matches!(track.close_betting("g").await.unwrap(), BettingOutcome::Started { bettors: 2 }));

        // Past the TTL, but the race is still running.
        let later = Utc::now() + chrono::Duration::seconds(901);
        assert_eq!(track.reap_stale(later).await, 0);
        assert_eq!(track.active_count(), 1);
        assert_eq!(cash(&store, "a").await, 800.0);

        // Its driver is long gone by now.
        let much_later = Utc::now() + chrono::Duration::seconds(900 * 4 + 1);
        assert_eq!(track.reap_stale(much_later).await, 1);
        assert_eq!(track.active_count(), 0);
        assert_eq!(cash(&store, "a").await, 1000.0);
        assert_eq!(cash(&store, "b").await, 1000.0);
    }

    #[tokio::test]
    async fn test_snapshots() {
        let (_, track) = track(&["a"]).await;
        track.start_race("g", "c").unwrap();
        track.place_bet("g", "a", BetType::Win, vec![1], 10.0).await.unwrap();
        let snap = track.snapshot("g").await.unwrap();
        assert_eq!(snap.bettors, 1);
        assert_eq!(snap.horses.len(), 8);
        assert_eq!(track.snapshots().len(), 1);
        assert!(track.snapshot("other").await.is_none());
    }
}
