//! Blackjack tables: one live game per player, with the stake escrowed up
//! front and every extra stake (double, split, insurance) escrowed before
//! the action is applied. A completed game is settled once through
//! [`Settlement`] and removed.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use super::blackjack::{Action, BlackjackGame, Deck, GameOutcome, Hand};
use super::rng::RngSource;
use super::settlement::{Settlement, SettlementRequest};
use crate::config::BlackjackConfig;
use crate::error::{EngineResult, Rejection};
use crate::types::{GameResult, GameType};

struct Seat {
    game: BlackjackGame,
    guild_id: String,
    last_action: DateTime<Utc>,
}

type SharedSeat = Arc<AsyncMutex<Seat>>;

/// Player-facing view of a game. The dealer's hole card stays hidden
/// until the game is over.
#[derive(Debug, Clone, Serialize)]
pub struct TableView {
    pub player_id: String,
    pub main_hand: Hand,
    pub main_value: u32,
    pub split_hand: Option<Hand>,
    pub dealer: String,
    pub dealer_value: Option<u32>,
    pub active_hand: usize,
    pub total_staked: f64,
    pub insurance_available: bool,
    pub is_complete: bool,
    pub outcome: Option<GameOutcome>,
    pub history_id: Option<String>,
}

impl TableView {
    fn of(game: &BlackjackGame, history_id: Option<String>) -> Self {
        let done = game.is_complete;
        Self {
            player_id: game.player_id.clone(),
            main_hand: game.main_hand.clone(),
            main_value: game.main_hand.value(),
            split_hand: game.split_hand.clone(),
            dealer: game.dealer_hand.render(!done),
            dealer_value: done.then(|| game.dealer_hand.value()),
            active_hand: game.active_hand,
            total_staked: game.total_staked(),
            insurance_available: game.insurance_available && !game.insurance_taken && !done,
            is_complete: done,
            outcome: done.then(|| game.outcome()),
            history_id,
        }
    }
}

/// Net result of a whole game from the player's side.
pub fn game_result(staked: f64, returned: f64) -> GameResult {
    if returned > staked {
        GameResult::Win
    } else if returned < staked {
        GameResult::Loss
    } else {
        GameResult::Push
    }
}

pub struct BlackjackTables {
    settlement: Arc<Settlement>,
    config: BlackjackConfig,
    rng: Arc<RngSource>,
    seats: Mutex<HashMap<String, SharedSeat>>,
}

impl BlackjackTables {
    pub fn new(settlement: Arc<Settlement>, config: BlackjackConfig, rng: Arc<RngSource>) -> Self {
        Self {
            settlement,
            config,
            rng,
            seats: Mutex::new(HashMap::new()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<String, SharedSeat>> {
        self.seats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn seat(&self, player_id: &str) -> Result<SharedSeat, Rejection> {
        self.registry()
            .get(player_id)
            .cloned()
            .ok_or(Rejection::GameNotFound)
    }

    pub fn active_count(&self) -> usize {
        self.registry().len()
    }

    /// Escrow the bet and deal a new game. A natural on the deal settles
    /// immediately.
    pub async fn start(&self, player_id: &str, guild_id: &str, bet: f64) -> EngineResult<TableView> {
        self.start_with_deck(player_id, guild_id, bet, Deck::shuffled(self.rng.fork()))
            .await
    }

    /// Same as [`Self::start`] with a caller-supplied deck.
    pub async fn start_with_deck(
        &self,
        player_id: &str,
        guild_id: &str,
        bet: f64,
        deck: Deck,
    ) -> EngineResult<TableView> {
        if self.registry().contains_key(player_id) {
            return Err(Rejection::GameAlreadyActive.into());
        }
        self.settlement.check_bet_range(bet)?;
        self.settlement
            .escrow(player_id, bet, GameType::Blackjack, "initial bet")
            .await?;

        let seat = Seat {
            game: BlackjackGame::new(player_id, bet, deck),
            guild_id: guild_id.to_string(),
            last_action: Utc::now(),
        };

        if seat.game.is_complete {
            return match self.settle(&seat).await {
                Ok(history_id) => Ok(TableView::of(&seat.game, Some(history_id))),
                Err(e) => {
                    // Parked for the idle sweep to settle.
                    self.registry()
                        .insert(player_id.to_string(), Arc::new(AsyncMutex::new(seat)));
                    Err(e)
                }
            };
        }

        let view = TableView::of(&seat.game, None);
        let seated = {
            let mut registry = self.registry();
            match registry.entry(player_id.to_string()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(AsyncMutex::new(seat)));
                    true
                }
            }
        };
        if !seated {
            // Lost a race with a concurrent start: give the stake back.
            self.settlement
                .refund(player_id, bet, GameType::Blackjack, "duplicate game")
                .await?;
            return Err(Rejection::GameAlreadyActive.into());
        }

        info!(player_id, guild_id, bet = format!("${bet:.2}"), "Blackjack game dealt");
        Ok(view)
    }

    /// Apply one player action, escrowing any extra stake first. Settles
    /// and removes the game once it completes.
    pub async fn act(&self, player_id: &str, action: Action) -> EngineResult<TableView> {
        let shared = self.seat(player_id)?;
        let mut seat = shared.lock().await;

        seat.game.check(action)?;
        let extra = seat.game.extra_stake(action);
        if extra > 0.0 {
            self.settlement
                .escrow(player_id, extra, GameType::Blackjack, &action.to_string())
                .await?;
        }
        seat.game.apply(action)?;
        seat.last_action = Utc::now();

        if !seat.game.is_complete {
            return Ok(TableView::of(&seat.game, None));
        }

        let history_id = self.settle(&seat).await?;
        let view = TableView::of(&seat.game, Some(history_id));
        drop(seat);
        self.registry().remove(player_id);
        Ok(view)
    }

    /// Settle a completed game: bet is everything staked, payout everything
    /// returned.
    async fn settle(&self, seat: &Seat) -> EngineResult<String> {
        let game = &seat.game;
        let outcome = game.outcome();
        let result = game_result(outcome.total_staked, outcome.total_returned);

        let history_id = self
            .settlement
            .settle_result(SettlementRequest {
                account_id: game.player_id.clone(),
                guild_id: seat.guild_id.clone(),
                game_type: GameType::Blackjack,
                bet_amount: outcome.total_staked,
                payout_amount: outcome.total_returned,
                result,
                game_data: json!({
                    "player_hand": game.main_hand,
                    "split_hand": game.split_hand,
                    "dealer_hand": game.dealer_hand,
                    "player_value": game.main_hand.value(),
                    "dealer_value": game.dealer_hand.value(),
                    "surrendered": game.has_surrendered,
                    "outcome": outcome,
                }),
            })
            .await?;

        info!(
            player_id = %game.player_id,
            result = %result,
            staked = format!("${:.2}", outcome.total_staked),
            returned = format!("${:.2}", outcome.total_returned),
            "Blackjack game settled"
        );
        Ok(history_id)
    }

    /// Forfeit games with no action for longer than the idle timeout. The
    /// escrowed stakes are kept and the game is recorded as a loss. A game
    /// that finished but failed to settle is settled on its real outcome.
    pub async fn expire_idle(&self, now: DateTime<Utc>) -> usize {
        let timeout = chrono::Duration::from_std(std::time::Duration::from_secs(self.config.idle_timeout_secs))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let candidates: Vec<(String, SharedSeat)> = self
            .registry()
            .iter()
            .map(|(p, s)| (p.clone(), s.clone()))
            .collect();

        let mut expired = 0;
        for (player_id, shared) in candidates {
            let Ok(seat) = shared.try_lock() else { continue };
            if seat.last_action + timeout > now {
                continue;
            }

            let settled = if seat.game.is_complete {
                self.settle(&seat).await
            } else {
                self.forfeit(&seat).await
            };
            match settled {
                Ok(_) => {
                    drop(seat);
                    self.registry().remove(&player_id);
                    expired += 1;
                }
                Err(e) => error!(player_id = %player_id, error = %e, "Idle blackjack settlement failed"),
            }
        }
        expired
    }

    async fn forfeit(&self, seat: &Seat) -> EngineResult<String> {
        let game = &seat.game;
        let staked = game.total_staked();
        let history_id = self
            .settlement
            .settle_result(SettlementRequest {
                account_id: game.player_id.clone(),
                guild_id: seat.guild_id.clone(),
                game_type: GameType::Blackjack,
                bet_amount: staked,
                payout_amount: 0.0,
                result: GameResult::Loss,
                game_data: json!({
                    "player_hand": game.main_hand,
                    "dealer_hand": game.dealer_hand,
                    "forfeit": "idle timeout",
                }),
            })
            .await?;
        warn!(player_id = %game.player_id, staked = format!("${staked:.2}"), "Idle blackjack game forfeited");
        Ok(history_id)
    }

    pub async fn snapshot(&self, player_id: &str) -> Option<TableView> {
        let shared = self.seat(player_id).ok()?;
        let seat = shared.lock().await;
        Some(TableView::of(&seat.game, None))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
