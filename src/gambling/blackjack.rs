//! Blackjack engine.
//!
//! Pure game state: cards, hands, the player action state machine, dealer
//! policy and payout resolution. Money moves in
//! [`super::blackjack_table::BlackjackTables`].
//!
//! Flow: deal → player turn on hand 0 → player turn on hand 1 (after a
//! split) → dealer turn → complete. A natural on the deal, a surrender, or
//! insurance meeting a dealer blackjack completes the game early.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::Rejection;

pub const BLACKJACK_PAYOUT: f64 = 2.5;
pub const WIN_PAYOUT: f64 = 2.0;
pub const PUSH_PAYOUT: f64 = 1.0;
pub const SURRENDER_PAYOUT: f64 = 0.5;
/// Insurance returns its stake plus 2:1.
pub const INSURANCE_PAYOUT: f64 = 3.0;

const DEALER_STANDS_ON: u32 = 17;

// ---------------------------------------------------------------------------
// Cards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Suit {
    Clubs,
    Diamonds,
    Hearts,
    Spades,
}

impl Suit {
    pub const ALL: [Suit; 4] = [Suit::Clubs, Suit::Diamonds, Suit::Hearts, Suit::Spades];

    fn symbol(self) -> char {
        match self {
            Suit::Clubs => '♣',
            Suit::Diamonds => '♦',
            Suit::Hearts => '♥',
            Suit::Spades => '♠',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Ace,
    Two,
    Three,
    Four,
    Five,
    Six,
    Seven,
    Eight,
    Nine,
    Ten,
    Jack,
    Queen,
    King,
}

impl Rank {
    pub const ALL: [Rank; 13] = [
        Rank::Ace,
        Rank::Two,
        Rank::Three,
        Rank::Four,
        Rank::Five,
        Rank::Six,
        Rank::Seven,
        Rank::Eight,
        Rank::Nine,
        Rank::Ten,
        Rank::Jack,
        Rank::Queen,
        Rank::King,
    ];

    /// Blackjack value, with the ace counted high.
    pub fn value(self) -> u32 {
        match self {
            Rank::Ace => 11,
            Rank::Two => 2,
            Rank::Three => 3,
            Rank::Four => 4,
            Rank::Five => 5,
            Rank::Six => 6,
            Rank::Seven => 7,
            Rank::Eight => 8,
            Rank::Nine => 9,
            Rank::Ten | Rank::Jack | Rank::Queen | Rank::King => 10,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Rank::Ace => "A",
            Rank::Two => "2",
            Rank::Three => "3",
            Rank::Four => "4",
            Rank::Five => "5",
            Rank::Six => "6",
            Rank::Seven => "7",
            Rank::Eight => "8",
            Rank::Nine => "9",
            Rank::Ten => "10",
            Rank::Jack => "J",
            Rank::Queen => "Q",
            Rank::King => "K",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Card {
    pub rank: Rank,
    pub suit: Suit,
}

impl Card {
    pub fn new(rank: Rank, suit: Suit) -> Self {
        Self { rank, suit }
    }

    pub fn value(&self) -> u32 {
        self.rank.value()
    }
}

impl fmt::Display for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.suit.symbol(), self.rank.label())
    }
}

/// Draw pile. Refills with a freshly shuffled deck if it ever runs dry.
pub struct Deck {
    cards: VecDeque<Card>,
    rng: StdRng,
}

impl Deck {
    fn fresh(rng: &mut StdRng) -> VecDeque<Card> {
        let mut cards: Vec<Card> = Suit::ALL
            .iter()
            .flat_map(|&s| Rank::ALL.iter().map(move |&r| Card::new(r, s)))
            .collect();
        cards.shuffle(rng);
        cards.into()
    }

    /// A shuffled 52-card deck.
    pub fn shuffled(mut rng: StdRng) -> Self {
        let cards = Self::fresh(&mut rng);
        Self { cards, rng }
    }

    /// A deck that deals `cards` in order before falling back to shuffled decks.
    pub fn stacked(cards: Vec<Card>, rng: StdRng) -> Self {
        Self {
            cards: cards.into(),
            rng,
        }
    }

    pub fn remaining(&self) -> usize {
        self.cards.len()
    }

    pub fn draw(&mut self) -> Card {
        if let Some(card) = self.cards.pop_front() {
            return card;
        }
        warn!("Blackjack deck exhausted, opening a fresh deck");
        self.cards = Self::fresh(&mut self.rng);
        // A fresh deck always has 52 cards.
        self.cards
            .pop_front()
            .unwrap_or(Card::new(Rank::Ace, Suit::Spades))
    }
}

// ---------------------------------------------------------------------------
// Hands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Hand {
    pub cards: Vec<Card>,
}

impl Hand {
    pub fn new(cards: Vec<Card>) -> Self {
        Self { cards }
    }

    pub fn add(&mut self, card: Card) {
        self.cards.push(card);
    }

    /// Best total: aces drop from 11 to 1, one at a time, while over 21.
    pub fn value(&self) -> u32 {
        let mut total: u32 = self.cards.iter().map(Card::value).sum();
        let mut aces = self.cards.iter().filter(|c| c.rank == Rank::Ace).count();
        while total > 21 && aces > 0 {
            total -= 10;
            aces -= 1;
        }
        total
    }

    pub fn is_blackjack(&self) -> bool {
        self.cards.len() == 2 && self.value() == 21
    }

    pub fn is_busted(&self) -> bool {
        self.value() > 21
    }

    /// Two cards of equal blackjack value.
    pub fn can_split(&self) -> bool {
        self.cards.len() == 2 && self.cards[0].value() == self.cards[1].value()
    }

    /// Cards as text, optionally hiding everything after the first.
    pub fn render(&self, hide_hole: bool) -> String {
        if self.cards.is_empty() {
            return "Empty hand".to_string();
        }
        if hide_hole && self.cards.len() > 1 {
            return format!("{} 🂠", self.cards[0]);
        }
        self.cards
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandOutcome {
    Surrender,
    Blackjack,
    Win,
    Push,
    Loss,
}

impl HandOutcome {
    /// Total returned per unit staked.
    pub fn multiplier(self) -> f64 {
        match self {
            HandOutcome::Surrender => SURRENDER_PAYOUT,
            HandOutcome::Blackjack => BLACKJACK_PAYOUT,
            HandOutcome::Win => WIN_PAYOUT,
            HandOutcome::Push => PUSH_PAYOUT,
            HandOutcome::Loss => 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HandResult {
    pub outcome: HandOutcome,
    pub message: &'static str,
    pub bet: f64,
    pub payout: f64,
}

/// Resolve one player hand against the dealer. First matching rule wins:
/// surrender, bust, player natural, dealer natural, both natural, dealer
/// bust, then totals.
pub fn resolve_hand(hand: &Hand, dealer: &Hand, bet: f64, surrendered: bool) -> HandResult {
    let (outcome, message) = if surrendered {
        (HandOutcome::Surrender, "Surrender! Half your bet is returned.")
    } else if hand.is_busted() {
        (HandOutcome::Loss, "Bust! You went over 21.")
    } else if hand.is_blackjack() && !dealer.is_blackjack() {
        (HandOutcome::Blackjack, "Blackjack! Paid 3:2.")
    } else if dealer.is_blackjack() && !hand.is_blackjack() {
        (HandOutcome::Loss, "Dealer has blackjack.")
    } else if hand.is_blackjack() && dealer.is_blackjack() {
        (HandOutcome::Push, "Both have blackjack. Push.")
    } else if dealer.is_busted() {
        (HandOutcome::Win, "Dealer busts! You win.")
    } else if hand.value() > dealer.value() {
        (HandOutcome::Win, "Your hand beats the dealer.")
    } else if hand.value() < dealer.value() {
        (HandOutcome::Loss, "Dealer's hand wins.")
    } else {
        (HandOutcome::Push, "Push. Your bet is returned.")
    };

    HandResult {
        outcome,
        message,
        bet,
        payout: bet * outcome.multiplier(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsuranceResult {
    pub won: bool,
    pub bet: f64,
    pub payout: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameOutcome {
    pub main: HandResult,
    pub split: Option<HandResult>,
    pub insurance: Option<InsuranceResult>,
    pub total_staked: f64,
    pub total_returned: f64,
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Hit,
    Stand,
    DoubleDown,
    Split,
    Surrender,
    Insurance,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Hit => "hit",
            Action::Stand => "stand",
            Action::DoubleDown => "double down",
            Action::Split => "split",
            Action::Surrender => "surrender",
            Action::Insurance => "take insurance",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hit" => Ok(Action::Hit),
            "stand" => Ok(Action::Stand),
            "double" | "double_down" | "doubledown" => Ok(Action::DoubleDown),
            "split" => Ok(Action::Split),
            "surrender" => Ok(Action::Surrender),
            "insurance" => Ok(Action::Insurance),
            other => Err(format!("unknown blackjack action: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Game
// ---------------------------------------------------------------------------

pub struct BlackjackGame {
    pub player_id: String,
    deck: Deck,
    pub main_hand: Hand,
    pub split_hand: Option<Hand>,
    pub dealer_hand: Hand,
    pub main_bet: f64,
    pub split_bet: f64,
    pub insurance_bet: f64,
    /// 0 for the main hand, 1 for the split hand.
    pub active_hand: usize,
    pub is_complete: bool,
    pub has_surrendered: bool,
    pub insurance_available: bool,
    pub insurance_taken: bool,
    pub insurance_resolved: bool,
}

impl BlackjackGame {
    /// Deal player, dealer, player, dealer. A natural on either side ends
    /// the game at once.
    pub fn new(player_id: &str, bet: f64, mut deck: Deck) -> Self {
        let mut main_hand = Hand::default();
        let mut dealer_hand = Hand::default();
        for _ in 0..2 {
            main_hand.add(deck.draw());
            dealer_hand.add(deck.draw());
        }

        let insurance_available = dealer_hand.cards[0].rank == Rank::Ace;
        let is_complete = main_hand.is_blackjack() || dealer_hand.is_blackjack();

        Self {
            player_id: player_id.to_string(),
            deck,
            main_hand,
            split_hand: None,
            dealer_hand,
            main_bet: bet,
            split_bet: 0.0,
            insurance_bet: 0.0,
            active_hand: 0,
            is_complete,
            has_surrendered: false,
            insurance_available,
            insurance_taken: false,
            insurance_resolved: false,
        }
    }

    pub fn active(&self) -> &Hand {
        match (&self.split_hand, self.active_hand) {
            (Some(split), 1) => split,
            _ => &self.main_hand,
        }
    }

    fn active_mut(&mut self) -> &mut Hand {
        match (&mut self.split_hand, self.active_hand) {
            (Some(split), 1) => split,
            _ => &mut self.main_hand,
        }
    }

    fn active_bet(&self) -> f64 {
        if self.active_hand == 1 {
            self.split_bet
        } else {
            self.main_bet
        }
    }

    /// Whether `action` is legal right now, and why not if it isn't.
    pub fn check(&self, action: Action) -> Result<(), Rejection> {
        let deny = |reason: &str| Err(Rejection::illegal(&action.to_string(), reason));
        if self.is_complete {
            return deny("the game is over");
        }
        match action {
            Action::Hit | Action::Stand => Ok(()),
            Action::DoubleDown => {
                if self.active().cards.len() != 2 {
                    return deny("only on a two-card hand");
                }
                Ok(())
            }
            Action::Split => {
                if self.split_hand.is_some() {
                    return deny("already split");
                }
                if !self.main_hand.can_split() {
                    return deny("hand is not a pair");
                }
                Ok(())
            }
            Action::Surrender => {
                if self.split_hand.is_some() || self.main_hand.cards.len() != 2 {
                    return deny("only on the opening hand");
                }
                Ok(())
            }
            Action::Insurance => {
                if !self.insurance_available {
                    return deny("dealer is not showing an ace");
                }
                if self.insurance_taken {
                    return deny("insurance already taken");
                }
                Ok(())
            }
        }
    }

    /// Additional stake the action puts on the table.
    pub fn extra_stake(&self, action: Action) -> f64 {
        match action {
            Action::DoubleDown => self.active_bet(),
            Action::Split => self.main_bet,
            Action::Insurance => (self.main_bet / 2.0).floor(),
            _ => 0.0,
        }
    }

    /// Everything staked so far.
    pub fn total_staked(&self) -> f64 {
        self.main_bet + self.split_bet + self.insurance_bet
    }

    pub fn hit(&mut self) -> Result<Card, Rejection> {
        self.check(Action::Hit)?;
        Ok(self.draw_to_active())
    }

    fn draw_to_active(&mut self) -> Card {
        let card = self.deck.draw();
        self.active_mut().add(card);
        if self.active().is_busted() {
            self.finish_hand();
        }
        card
    }

    pub fn stand(&mut self) -> Result<(), Rejection> {
        self.check(Action::Stand)?;
        self.finish_hand();
        Ok(())
    }

    /// Double the active hand's bet, draw exactly one card, then stand.
    pub fn double_down(&mut self) -> Result<Card, Rejection> {
        self.check(Action::DoubleDown)?;
        if self.active_hand == 1 {
            self.split_bet *= 2.0;
        } else {
            self.main_bet *= 2.0;
        }
        let hand_before = self.active_hand;
        let card = self.draw_to_active();
        // A bust already moved play on.
        if self.active_hand == hand_before && !self.is_complete {
            self.finish_hand();
        }
        Ok(card)
    }

    /// Move the second card into a new hand and deal one card to each.
    pub fn split(&mut self) -> Result<(), Rejection> {
        self.check(Action::Split)?;
        let Some(second) = self.main_hand.cards.pop() else {
            return Err(Rejection::illegal("split", "hand is not a pair"));
        };
        let mut split = Hand::new(vec![second]);
        self.main_hand.add(self.deck.draw());
        split.add(self.deck.draw());
        self.split_hand = Some(split);
        self.split_bet = self.main_bet;
        self.active_hand = 0;
        Ok(())
    }

    pub fn surrender(&mut self) -> Result<(), Rejection> {
        self.check(Action::Surrender)?;
        self.has_surrendered = true;
        self.is_complete = true;
        Ok(())
    }

    /// Place the insurance side bet. Returns true if the dealer had
    /// blackjack, which ends the game.
    pub fn take_insurance(&mut self) -> Result<bool, Rejection> {
        self.check(Action::Insurance)?;
        self.insurance_bet = (self.main_bet / 2.0).floor();
        self.insurance_taken = true;
        if self.dealer_hand.is_blackjack() {
            self.insurance_resolved = true;
            self.is_complete = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Apply any action by name.
    pub fn apply(&mut self, action: Action) -> Result<(), Rejection> {
        match action {
            Action::Hit => self.hit().map(|_| ()),
            Action::Stand => self.stand(),
            Action::DoubleDown => self.double_down().map(|_| ()),
            Action::Split => self.split(),
            Action::Surrender => self.surrender(),
            Action::Insurance => self.take_insurance().map(|_| ()),
        }
    }

    /// The active hand is done: move to the split hand, or end the
    /// player's turn.
    fn finish_hand(&mut self) {
        if self.split_hand.is_some() && self.active_hand == 0 {
            self.active_hand = 1;
            return;
        }
        self.play_dealer();
        self.is_complete = true;
    }

    fn all_hands_busted(&self) -> bool {
        self.main_hand.is_busted() && self.split_hand.as_ref().map_or(true, Hand::is_busted)
    }

    /// Dealer draws to 17 unless every player hand is already bust.
    fn play_dealer(&mut self) {
        if self.all_hands_busted() {
            return;
        }
        while self.dealer_hand.value() < DEALER_STANDS_ON {
            let card = self.deck.draw();
            self.dealer_hand.add(card);
        }
    }

    /// Payout breakdown. Meaningful once `is_complete`.
    pub fn outcome(&self) -> GameOutcome {
        let main = resolve_hand(&self.main_hand, &self.dealer_hand, self.main_bet, self.has_surrendered);
        let split = self
            .split_hand
            .as_ref()
            .map(|h| resolve_hand(h, &self.dealer_hand, self.split_bet, false));
        let insurance = (self.insurance_bet > 0.0).then(|| {
            let won = self.dealer_hand.is_blackjack();
            InsuranceResult {
                won,
                bet: self.insurance_bet,
                payout: if won { self.insurance_bet * INSURANCE_PAYOUT } else { 0.0 },
            }
        });

        let total_returned = main.payout
            + split.as_ref().map_or(0.0, |s| s.payout)
            + insurance.as_ref().map_or(0.0, |i| i.payout);

        GameOutcome {
            main,
            split,
            insurance,
            total_staked: self.total_staked(),
            total_returned,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
