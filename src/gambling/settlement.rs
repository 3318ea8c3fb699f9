//! Gambling settlement.
//!
//! Every game's financial outcome passes through [`Settlement::settle_result`]
//! exactly once. Games that collect the stake up front (racing, blackjack)
//! move it through [`Settlement::escrow`] when the bet is placed, and
//! settlement then only credits what comes back. Slots is collected at
//! settlement time.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::GamblingConfig;
use crate::error::{EngineResult, Rejection};
use crate::storage::{AccountUpdate, HistoryFilter, LedgerStore, UnitOfWork};
use crate::types::{
    generate_short_id, Account, GamblingHistoryRecord, GameResult, GameType, TransactionKind,
    TransactionRecord,
};

/// One player's resolved game, ready to be applied.
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub account_id: String,
    pub guild_id: String,
    pub game_type: GameType,
    /// Everything the player staked on this game.
    pub bet_amount: f64,
    /// Everything returned to the player, stake included.
    pub payout_amount: f64,
    pub result: GameResult,
    pub game_data: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GameStats {
    pub bets: u64,
    pub wagered: f64,
    pub won: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlayerStats {
    pub total_wins: u64,
    pub total_losses: u64,
    pub total_games: u64,
    pub total_wagered: f64,
    /// Payouts on winning games.
    pub total_won: f64,
    /// Everything returned (wins, pushes, partial refunds) minus everything wagered.
    pub net_profit: f64,
    pub games: BTreeMap<GameType, GameStats>,
}

/// Fold history records into per-player statistics.
pub fn aggregate_stats(records: &[GamblingHistoryRecord]) -> PlayerStats {
    let mut stats = PlayerStats::default();
    let mut returned = 0.0;

    for r in records {
        stats.total_games += 1;
        stats.total_wagered += r.bet_amount;
        returned += r.payout_amount;

        let game = stats.games.entry(r.game_type).or_default();
        game.bets += 1;
        game.wagered += r.bet_amount;

        match r.result {
            GameResult::Win => {
                stats.total_wins += 1;
                stats.total_won += r.payout_amount;
                game.won += r.payout_amount;
            }
            GameResult::Loss => stats.total_losses += 1,
            GameResult::Push => {}
        }
    }

    stats.net_profit = returned - stats.total_wagered;
    stats
}

pub struct Settlement {
    store: Arc<dyn LedgerStore>,
    config: GamblingConfig,
    bank_id: String,
}

impl Settlement {
    pub fn new(store: Arc<dyn LedgerStore>, config: GamblingConfig, bank_id: &str) -> Self {
        Self {
            store,
            config,
            bank_id: bank_id.to_string(),
        }
    }

    pub fn config(&self) -> &GamblingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Table limits for a single bet.
    pub fn check_bet_range(&self, amount: f64) -> Result<(), Rejection> {
        if !(self.config.min_bet..=self.config.max_bet).contains(&amount) {
            return Err(Rejection::BetOutOfRange {
                min: self.config.min_bet,
                max: self.config.max_bet,
            });
        }
        Ok(())
    }

    /// The account exists and can cover `amount` from cash.
    pub async fn validate_bet(&self, account_id: &str, amount: f64) -> EngineResult<Account> {
        let account = self
            .store
            .find_account(account_id)
            .await?
            .ok_or(Rejection::AccountNotFound)?;
        if account.cash < amount {
            return Err(Rejection::InsufficientFunds { available: account.cash }.into());
        }
        Ok(account)
    }

    /// Take a stake now, before the outcome is known.
    pub async fn escrow(
        &self,
        account_id: &str,
        amount: f64,
        game_type: GameType,
        description: &str,
    ) -> EngineResult<()> {
        self.validate_bet(account_id, amount).await?;

        let tx = TransactionRecord::new(
            TransactionKind::GamblingBet,
            account_id,
            &self.bank_id,
            amount,
            format!("{game_type}: {description}"),
        );
        self.store
            .commit(
                UnitOfWork::new()
                    .update(account_id, AccountUpdate::new().add_cash(-amount))
                    .transaction(tx),
            )
            .await?;

        debug!(account_id, amount, game = %game_type, "Stake escrowed");
        Ok(())
    }

    /// Return an escrowed stake without resolving a game.
    pub async fn refund(
        &self,
        account_id: &str,
        amount: f64,
        game_type: GameType,
        description: &str,
    ) -> EngineResult<()> {
        let tx = TransactionRecord::new(
            TransactionKind::GamblingRefund,
            &self.bank_id,
            account_id,
            amount,
            format!("{game_type}: {description}"),
        );
        self.store
            .commit(
                UnitOfWork::new()
                    .update(account_id, AccountUpdate::new().add_cash(amount))
                    .transaction(tx),
            )
            .await?;

        info!(account_id, amount = format!("${amount:.2}"), game = %game_type, "Stake refunded");
        Ok(())
    }

    /// Apply a resolved game: collect the stake (unless escrowed), credit
    /// the return, bump the win/loss counter and append the history record,
    /// all in one unit. Returns the history record id.
    ///
    /// Callers must settle each resolution exactly once.
    pub async fn settle_result(&self, req: SettlementRequest) -> EngineResult<String> {
        if self.store.find_account(&req.account_id).await?.is_none() {
            return Err(Rejection::AccountNotFound.into());
        }

        let SettlementRequest {
            account_id,
            guild_id,
            game_type,
            bet_amount,
            payout_amount,
            result,
            game_data,
        } = req;
        let id = account_id.as_str();

        let mut update = AccountUpdate::new();
        let mut unit = UnitOfWork::new();

        if !game_type.stake_collected_upfront() {
            update = update.add_cash(-bet_amount);
            unit = unit.transaction(TransactionRecord::new(
                TransactionKind::GamblingBet,
                id,
                &self.bank_id,
                bet_amount,
                format!("{game_type} bet"),
            ));
        }

        match result {
            GameResult::Win => {
                update = update.add_cash(payout_amount).add_win();
                unit = unit.transaction(TransactionRecord::new(
                    TransactionKind::GamblingPayout,
                    &self.bank_id,
                    id,
                    payout_amount,
                    format!("{game_type} win"),
                ));
            }
            GameResult::Loss => {
                update = update.add_loss();
                if payout_amount > 0.0 {
                    update = update.add_cash(payout_amount);
                    unit = unit.transaction(TransactionRecord::new(
                        TransactionKind::GamblingPayout,
                        &self.bank_id,
                        id,
                        payout_amount,
                        format!("{game_type} partial return"),
                    ));
                }
            }
            GameResult::Push => {
                update = update.add_cash(bet_amount);
                unit = unit.transaction(TransactionRecord::new(
                    TransactionKind::GamblingRefund,
                    &self.bank_id,
                    id,
                    bet_amount,
                    format!("{game_type} push"),
                ));
            }
        }

        let history = GamblingHistoryRecord {
            id: generate_short_id(),
            player_id: account_id.clone(),
            guild_id,
            game_type,
            result,
            bet_amount,
            payout_amount,
            timestamp: Utc::now(),
            game_data,
        };
        let history_id = history.id.clone();

        self.store
            .commit(unit.update(id, update).history(history))
            .await?;

        info!(
            account_id = id,
            game = %game_type,
            result = %result,
            bet = format!("${bet_amount:.2}"),
            payout = format!("${payout_amount:.2}"),
            "Game settled"
        );
        Ok(history_id)
    }

    pub async fn player_stats(&self, account_id: &str) -> anyhow::Result<PlayerStats> {
        let records = self.store.find_history(&HistoryFilter::for_player(account_id)).await?;
        Ok(aggregate_stats(&records))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
