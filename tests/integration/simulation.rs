//! Community simulation harness.
//!
//! Drives a small guild through registration, banking, a loan lifecycle,
//! weekly jobs, a race, blackjack and slots over one shared ledger, then
//! checks that money is accounted for end to end.

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use std::sync::Arc;

    use parlor::config::{AppConfig, RacingConfig};
    use parlor::economy::scheduler::run_weekly_jobs;
    use parlor::economy::{Bank, LoanDesk};
    use parlor::gambling::blackjack::{Action, Card, Deck, Rank, Suit};
    use parlor::gambling::racing::BetType;
    use parlor::gambling::settlement::aggregate_stats;
    use parlor::gambling::{BlackjackTables, RaceTrack, RngSource, Settlement, SlotMachine};
    use parlor::storage::{HistoryFilter, LedgerStore, MemoryStore, SqliteStore, TransactionFilter};
    use parlor::types::{LoanStatus, TransactionKind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct Guild {
        store: Arc<dyn LedgerStore>,
        bank: Bank,
        desk: LoanDesk,
        slots: SlotMachine,
        track: RaceTrack,
        tables: BlackjackTables,
    }

    fn guild(store: Arc<dyn LedgerStore>) -> Guild {
        let cfg = AppConfig::parse("[gambling]\nrng_seed = 42\n").unwrap();
        let rng = Arc::new(RngSource::new(cfg.gambling.rng_seed));
        let bank_id = cfg.economy.bank_account_id.clone();
        let settlement = Arc::new(Settlement::new(store.clone(), cfg.gambling.clone(), &bank_id));
        Guild {
            bank: Bank::new(store.clone(), cfg.economy.clone()),
            desk: LoanDesk::new(store.clone(), cfg.loans.clone(), &bank_id),
            slots: SlotMachine::new(settlement.clone(), rng.clone()),
            track: RaceTrack::new(
                settlement.clone(),
                RacingConfig {
                    betting_window_secs: 0,
                    tick_millis: 0,
                    ..cfg.racing.clone()
                },
                rng.clone(),
            ),
            tables: BlackjackTables::new(settlement, cfg.blackjack.clone(), rng),
            store,
        }
    }

    async fn cash(store: &dyn LedgerStore, id: &str) -> f64 {
        store.find_account(id).await.unwrap().unwrap().cash
    }

    #[tokio::test]
    async fn test_loan_lifecycle_end_to_end() {
        let g = guild(Arc::new(MemoryStore::new()));
        assert!(g.bank.register_account("alice", "alice", "Alice").await.unwrap());
        assert!(!g.bank.register_account("alice", "alice", "Alice").await.unwrap());

        let loan = g.desk.request_loan("alice", 1000.0, 4).await.unwrap();
        let acct = g.store.find_account("alice").await.unwrap().unwrap();
        assert_eq!(acct.cash, 2000.0);
        assert_eq!(acct.total_debt, 1000.0);
        assert_eq!(acct.credit_score, 495);

        let receipt = g.desk.make_payment("alice", &loan.loan_id, 500.0).await.unwrap();
        assert!(!receipt.paid_off);
        assert_eq!(receipt.remaining_balance, 500.0);
        assert_eq!(receipt.weeks_remaining, 3);

        let receipt = g.desk.make_payment("alice", &loan.loan_id, 500.0).await.unwrap();
        assert!(receipt.paid_off);
        assert_eq!(receipt.credit_score, 515);

        let acct = g.store.find_account("alice").await.unwrap().unwrap();
        assert_eq!(acct.cash, 1000.0);
        assert_eq!(acct.debts[0].status, LoanStatus::PaidOff);

        let loan_txs = g
            .store
            .find_transactions(&TransactionFilter::for_loan(&loan.loan_id))
            .await
            .unwrap();
        assert_eq!(loan_txs.len(), 3);
        assert_eq!(loan_txs[0].kind, TransactionKind::LoanDisbursement);
    }

    #[tokio::test]
    async fn test_weekly_accrual_then_payoff() {
        let g = guild(Arc::new(MemoryStore::new()));
        g.bank.register_account("bob", "bob", "Bob").await.unwrap();
        let loan = g.desk.request_loan("bob", 2000.0, 8).await.unwrap();

        let later = Utc::now() + Duration::days(15);
        let report = g.desk.weekly_accrual_at(later).await.unwrap();
        assert_eq!(report.loans_accrued, 1);
        // Running again in the same week changes nothing.
        assert_eq!(g.desk.weekly_accrual_at(later).await.unwrap().loans_accrued, 0);

        let acct = g.store.find_account("bob").await.unwrap().unwrap();
        let balance = acct.debts[0].remaining_balance;
        assert!(balance > 2000.0);
        assert!((acct.total_debt - balance).abs() < 1e-9);
        assert_eq!(acct.credit_score, 491);

        g.desk.make_payment("bob", &loan.loan_id, balance).await.unwrap();
        let acct = g.store.find_account("bob").await.unwrap().unwrap();
        assert!(acct.active_loans().next().is_none());
        assert!(acct.total_debt.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_race_night() {
        let g = guild(Arc::new(MemoryStore::new()));
        let players = ["ann", "ben", "cat", "dan"];
        for p in players {
            g.bank.register_account(p, p, p).await.unwrap();
        }

        g.track.start_race("guild", "chan").unwrap();
        g.track.place_bet("guild", "ann", BetType::Win, vec![1], 100.0).await.unwrap();
        g.track.place_bet("guild", "ben", BetType::Place, vec![3], 100.0).await.unwrap();
        g.track.place_bet("guild", "cat", BetType::Trifecta, vec![2, 5, 7], 50.0).await.unwrap();
        g.track
            .place_bet("guild", "dan", BetType::Superfecta, vec![1, 2, 3, 4], 20.0)
            .await
            .unwrap();

        let report = g.track.run_lifecycle("guild").await.unwrap().unwrap();
        assert_eq!(report.total_pool, 270.0);
        assert_eq!(report.settlement_failures, 0);

        let stakes = [100.0, 100.0, 50.0, 20.0];
        for (p, stake) in players.iter().zip(stakes) {
            let payout = report.payouts.get(*p).copied().unwrap_or(0.0);
            let expected = 1000.0 - stake + payout;
            assert!((cash(g.store.as_ref(), p).await - expected).abs() < 1e-9, "{p}");
        }
        assert_eq!(g.track.active_count(), 0);
    }

    #[tokio::test]
    async fn test_blackjack_split_hand_on_sqlite() {
        let store: Arc<dyn LedgerStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let g = guild(store);
        g.bank.register_account("eve", "eve", "Eve").await.unwrap();

        // Player 8, 8; dealer 10, 7; split deals 3 and 2, then 10 and 9.
        let cards = [
            Rank::Eight,
            Rank::Ten,
            Rank::Eight,
            Rank::Seven,
            Rank::Three,
            Rank::Two,
            Rank::Ten,
            Rank::Nine,
        ]
        .iter()
        .map(|&r| Card::new(r, Suit::Clubs))
        .collect();
        let deck = Deck::stacked(cards, StdRng::seed_from_u64(0));

        g.tables.start_with_deck("eve", "guild", 100.0, deck).await.unwrap();
        g.tables.act("eve", Action::Split).await.unwrap();
        assert_eq!(cash(g.store.as_ref(), "eve").await, 800.0);

        g.tables.act("eve", Action::Hit).await.unwrap();
        g.tables.act("eve", Action::Stand).await.unwrap();
        g.tables.act("eve", Action::Hit).await.unwrap();
        let view = g.tables.act("eve", Action::Stand).await.unwrap();
        assert!(view.is_complete);

        // Both hands beat the dealer's 17.
        assert_eq!(cash(g.store.as_ref(), "eve").await, 1200.0);
        let history = g
            .store
            .find_history(&HistoryFilter::for_player("eve"))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].bet_amount, 200.0);
        assert_eq!(history[0].payout_amount, 400.0);
    }

    #[tokio::test]
    async fn test_slots_session_balances() {
        let g = guild(Arc::new(MemoryStore::new()));
        g.bank.register_account("fay", "fay", "Fay").await.unwrap();

        let mut expected = 1000.0;
        for _ in 0..20 {
            let spin = g.slots.spin("fay", "guild", 10.0).await.unwrap();
            expected += spin.payout - 10.0;
        }
        assert!((cash(g.store.as_ref(), "fay").await - expected).abs() < 1e-9);

        let acct = g.store.find_account("fay").await.unwrap().unwrap();
        assert_eq!(acct.wins + acct.losses, 20);
        let records = g.store.find_history(&HistoryFilter::for_player("fay")).await.unwrap();
        assert_eq!(aggregate_stats(&records).total_games, 20);
    }

    #[tokio::test]
    async fn test_banking_round_trip_with_interest() {
        let g = guild(Arc::new(MemoryStore::new()));
        g.bank.register_account("gus", "gus", "Gus").await.unwrap();
        g.bank.deposit("gus", 400.0).await.unwrap();
        let report = g.bank.apply_weekly_interest().await.unwrap();
        assert_eq!(report.accounts_paid, 1);
        assert!((report.total_interest - 2.0).abs() < 1e-9);

        let summary = g.bank.withdraw("gus", 402.0).await.unwrap();
        assert!((summary.cash - 1002.0).abs() < 1e-9);
        assert!(summary.bank.abs() < 1e-9);

        let err = g.bank.withdraw("gus", 1.0).await.unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn test_memory_snapshot_survives_restart_after_weekly_run() {
        let memory = Arc::new(MemoryStore::new());
        let g = guild(memory.clone());
        g.bank.register_account("hal", "hal", "Hal").await.unwrap();
        g.bank.deposit("hal", 200.0).await.unwrap();
        let loan = g.desk.request_loan("hal", 500.0, 4).await.unwrap();

        let report = run_weekly_jobs(&g.bank, &g.desk).await;
        assert_eq!(report.interest.unwrap().accounts_paid, 1);

        let mut path = std::env::temp_dir();
        path.push(format!("parlor_restart_{}.json", uuid::Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();
        memory.save_snapshot(&path).await.unwrap();

        // A fresh process picks up the loan, the interest and the records.
        let restored = MemoryStore::load_snapshot(&path).unwrap();
        let before = memory.find_account("hal").await.unwrap().unwrap();
        let after = restored.find_account("hal").await.unwrap().unwrap();
        assert_eq!(after.cash, before.cash);
        assert_eq!(after.bank, before.bank);
        assert!(after.bank > 200.0);
        assert_eq!(after.total_debt, 500.0);
        assert_eq!(after.debts[0].loan_id, loan.loan_id);
        assert_eq!(
            restored.snapshot().await.transactions.len(),
            memory.snapshot().await.transactions.len()
        );
        assert!(!std::path::Path::new(&format!("{path}.tmp")).exists());

        std::fs::remove_file(&path).unwrap();
    }
}
