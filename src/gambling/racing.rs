//! Horse race engine.
//!
//! A [`RaceSession`] is the whole state of one race: the field of eight
//! horses, the bets, and the simulation. It does no I/O; escrow and
//! settlement are driven by [`super::race_track::RaceTrack`].
//!
//! Status flow: `Betting → Racing → Finished`, or `Betting → Cancelled`
//! when too few players bet.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::error::Rejection;
use crate::types::generate_short_id;

pub const HORSE_NAMES: [&str; 18] = [
    "Lightning Hooves",
    "Skibidi Rizz",
    "Debt Collector",
    "Who",
    "What",
    "I Don't Know",
    "Forrest Gump",
    "Horse Girl",
    "Birthday Suit",
    "Gallop",
    "Lucky Day",
    "Loser",
    "Crash and Burn",
    "Special Delivery",
    "Happy Hour",
    "Dash",
    "Prancer",
    "Sagittarius",
];

pub const FIELD_SIZE: usize = 8;
pub const PODIUM_SIZE: usize = 4;

const PLACE_FACTOR: f64 = 0.6;
const SHOW_FACTOR: f64 = 0.3;
/// Shortest stride a horse can take in one tick.
const MIN_STRIDE: f64 = 2.0;

// ---------------------------------------------------------------------------
// Horses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Horse {
    pub number: u8,
    pub name: String,
    pub position: f64,
    pub speed: u32,
    pub stamina: u32,
    pub finished: bool,
}

impl Horse {
    pub fn new(number: u8, name: &str, speed: u32, stamina: u32) -> Self {
        Self {
            number,
            name: name.to_string(),
            position: 0.0,
            speed,
            stamina,
            finished: false,
        }
    }

    fn random<R: Rng + ?Sized>(rng: &mut R, number: u8, name: &str) -> Self {
        let speed = rng.gen_range(5..=10);
        let stamina = rng.gen_range(3..=10);
        Self::new(number, name, speed, stamina)
    }

    /// Mean of speed and stamina.
    pub fn rating(&self) -> f64 {
        f64::from(self.speed + self.stamina) / 2.0
    }

    /// Base payout multiplier. Stronger horses pay less.
    pub fn multiplier(&self) -> f64 {
        match self.rating() {
            r if r >= 9.0 => 1.25,
            r if r >= 7.5 => 2.5,
            r if r >= 6.0 => 5.0,
            r if r >= 4.5 => 15.0,
            _ => 50.0,
        }
    }

    /// Form label shown next to the horse, using the same bands as `multiplier`.
    pub fn form(&self) -> &'static str {
        match self.rating() {
            r if r >= 9.0 => "Favorite",
            r if r >= 7.5 => "Strong",
            r if r >= 6.0 => "Average",
            r if r >= 4.5 => "Underdog",
            _ => "Long Shot",
        }
    }
}

// ---------------------------------------------------------------------------
// Bets
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetType {
    Win,
    Place,
    Show,
    Exacta,
    Trifecta,
    Superfecta,
}

impl BetType {
    /// How many horses the bet names.
    pub fn horses_required(self) -> usize {
        match self {
            BetType::Win | BetType::Place | BetType::Show => 1,
            BetType::Exacta => 2,
            BetType::Trifecta => 3,
            BetType::Superfecta => 4,
        }
    }

    /// Fixed multiplier for ordered bets.
    fn exotic_multiplier(self) -> Option<f64> {
        match self {
            BetType::Exacta => Some(15.0),
            BetType::Trifecta => Some(75.0),
            BetType::Superfecta => Some(200.0),
            _ => None,
        }
    }
}

impl fmt::Display for BetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BetType::Win => "win",
            BetType::Place => "place",
            BetType::Show => "show",
            BetType::Exacta => "exacta",
            BetType::Trifecta => "trifecta",
            BetType::Superfecta => "superfecta",
        };
        write!(f, "{s}")
    }
}

impl FromStr for BetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "win" => Ok(BetType::Win),
            "place" => Ok(BetType::Place),
            "show" => Ok(BetType::Show),
            "exacta" => Ok(BetType::Exacta),
            "trifecta" => Ok(BetType::Trifecta),
            "superfecta" => Ok(BetType::Superfecta),
            other => Err(format!("unknown bet type: {other}")),
        }
    }
}

/// One player's bet. Immutable once placed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RaceBet {
    pub user_id: String,
    pub amount: f64,
    pub bet_type: BetType,
    pub horses: Vec<u8>,
    pub placed_at: DateTime<Utc>,
}

impl RaceBet {
    pub fn new(user_id: &str, amount: f64, bet_type: BetType, horses: Vec<u8>) -> Self {
        Self {
            user_id: user_id.to_string(),
            amount,
            bet_type,
            horses,
            placed_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Betting,
    Racing,
    Finished,
    Cancelled,
}

pub struct RaceSession {
    pub race_id: String,
    pub guild_id: String,
    pub channel_id: String,
    pub status: RaceStatus,
    pub horses: Vec<Horse>,
    pub bets: BTreeMap<String, RaceBet>,
    pub total_pool: f64,
    pub distance: f64,
    pub created_at: DateTime<Utc>,
    pub betting_ends_at: DateTime<Utc>,
    /// Horse numbers in the order they crossed the line.
    pub finish_order: Vec<u8>,
    /// Bettors whose stake has been settled or refunded.
    pub settled: BTreeSet<String>,
    rng: StdRng,
}

impl RaceSession {
    /// Draw a field of eight distinctly named horses.
    pub fn new(
        guild_id: &str,
        channel_id: &str,
        distance: f64,
        betting_window: std::time::Duration,
        mut rng: StdRng,
    ) -> Self {
        let names: Vec<&str> = HORSE_NAMES.choose_multiple(&mut rng, FIELD_SIZE).copied().collect();
        let horses = names
            .iter()
            .enumerate()
            .map(|(i, name)| Horse::random(&mut rng, i as u8 + 1, name))
            .collect();
        Self::with_horses(guild_id, channel_id, horses, distance, betting_window, rng)
    }

    /// A session with a fixed field.
    pub fn with_horses(
        guild_id: &str,
        channel_id: &str,
        horses: Vec<Horse>,
        distance: f64,
        betting_window: std::time::Duration,
        rng: StdRng,
    ) -> Self {
        let created_at = Utc::now();
        let window = Duration::from_std(betting_window).unwrap_or_else(|_| Duration::seconds(60));
        Self {
            race_id: generate_short_id(),
            guild_id: guild_id.to_string(),
            channel_id: channel_id.to_string(),
            status: RaceStatus::Betting,
            horses,
            bets: BTreeMap::new(),
            total_pool: 0.0,
            distance,
            created_at,
            betting_ends_at: created_at + window,
            finish_order: Vec::new(),
            settled: BTreeSet::new(),
            rng,
        }
    }

    pub fn horse(&self, number: u8) -> Option<&Horse> {
        self.horses.iter().find(|h| h.number == number)
    }

    /// Everything about a bet that the session itself can check.
    pub fn validate_bet(&self, user_id: &str, bet_type: BetType, horses: &[u8]) -> Result<(), Rejection> {
        if self.status != RaceStatus::Betting {
            return Err(Rejection::BettingClosed);
        }
        if let Some(existing) = self.bets.get(user_id) {
            return Err(Rejection::DuplicateBet { amount: existing.amount });
        }
        if horses.len() != bet_type.horses_required() {
            return Err(Rejection::WrongHorseCount {
                bet_type: bet_type.to_string(),
                expected: bet_type.horses_required(),
            });
        }
        if let Some(&unknown) = horses.iter().find(|&&n| self.horse(n).is_none()) {
            return Err(Rejection::UnknownHorse(unknown));
        }
        let distinct: BTreeSet<_> = horses.iter().collect();
        if distinct.len() != horses.len() {
            return Err(Rejection::DuplicateHorse);
        }
        Ok(())
    }

    /// Record a validated, already-escrowed bet.
    pub fn record_bet(&mut self, bet: RaceBet) {
        self.total_pool += bet.amount;
        self.bets.insert(bet.user_id.clone(), bet);
    }

    /// Bets whose stake has not yet been settled or refunded.
    pub fn unsettled_bets(&self) -> Vec<RaceBet> {
        self.bets
            .values()
            .filter(|b| !self.settled.contains(&b.user_id))
            .cloned()
            .collect()
    }

    pub fn start_racing(&mut self) {
        self.status = RaceStatus::Racing;
    }

    pub fn cancel(&mut self) {
        self.status = RaceStatus::Cancelled;
    }

    pub fn is_finished(&self) -> bool {
        self.status == RaceStatus::Finished
    }

    /// Advance every running horse once. Returns true when the whole field
    /// has crossed the line.
    pub fn tick(&mut self) -> bool {
        for horse in self.horses.iter_mut().filter(|h| !h.finished) {
            let stride = self.rng.gen_range(MIN_STRIDE..=f64::from(horse.speed).max(MIN_STRIDE));
            let surge = self.rng.gen_range(0.0..=f64::from(horse.stamina) / 2.0);
            horse.position += stride + surge;

            if horse.position >= self.distance {
                horse.position = self.distance;
                horse.finished = true;
                self.finish_order.push(horse.number);
            }
        }

        let done = self.finish_order.len() == self.horses.len();
        if done {
            self.status = RaceStatus::Finished;
        }
        done
    }

    /// Tick until every horse has finished.
    pub fn run_to_finish(&mut self) -> &[u8] {
        while !self.tick() {}
        &self.finish_order
    }

    pub fn podium(&self) -> &[u8] {
        let n = self.finish_order.len().min(PODIUM_SIZE);
        &self.finish_order[..n]
    }

    /// What a bet returns for a given finishing order. Zero if it lost.
    pub fn payout_for(&self, bet: &RaceBet, finish_order: &[u8]) -> f64 {
        let podium = &finish_order[..finish_order.len().min(PODIUM_SIZE)];

        if let Some(fixed) = bet.bet_type.exotic_multiplier() {
            let n = bet.bet_type.horses_required();
            return if podium.len() >= n && podium[..n] == bet.horses[..] {
                bet.amount * fixed
            } else {
                0.0
            };
        }

        let Some(&pick) = bet.horses.first() else {
            return 0.0;
        };
        let Some(horse) = self.horse(pick) else {
            return 0.0;
        };
        let (places, factor) = match bet.bet_type {
            BetType::Win => (1, 1.0),
            BetType::Place => (2, PLACE_FACTOR),
            _ => (3, SHOW_FACTOR),
        };
        if podium.iter().take(places).any(|&n| n == pick) {
            bet.amount * horse.multiplier() * factor
        } else {
            0.0
        }
    }

    /// Winning bettors and what they receive. Losers are absent.
    pub fn calculate_payouts(&self, finish_order: &[u8]) -> BTreeMap<String, f64> {
        self.bets
            .iter()
            .filter_map(|(user, bet)| {
                let payout = self.payout_for(bet, finish_order);
                (payout > 0.0).then(|| (user.clone(), payout))
            })
            .collect()
    }

    /// Informational house share of the pool.
    pub fn house_take(&self, rake: f64) -> f64 {
        self.total_pool * rake
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
