//! The deterministic half of the orchestrator: one owned [`GameState`] that
//! applies every mutation synchronously and pushes the resulting broadcast
//! events into an internal command list. The async shell drains that list
//! after each step and hands it to the hub, so the event order seen by
//! subscribers is exactly the mutation order.
//!
//! Nothing in here does I/O and nothing reads the clock; callers pass
//! `now_ms` in.

use crate::interpreter::Effect;
use protocol::{
    BetSummary, ChatEvent, FightResults, GamePhase, GameSnapshot, HitEntry, ServerEvent,
    SNAPSHOT_HISTORY_LEN, TOP_HITTERS_LEN, TopHitter,
};
use std::collections::HashMap;

/// All state of the single running game. Owned exclusively by the
/// orchestrator task; everyone else sees published snapshots.
pub struct GameState {
    coin: String,
    initial_hp: u32,
    phase: GamePhase,
    round_id: u64,
    boss_hp: u32,
    max_hp: u32,
    user_hits: HashMap<String, u32>,
    chronological: Vec<HitEntry>,
    total_hits: u32,
    last_hitter: Option<String>,
    betting_end_ms: Option<i64>,
    fight_end_ms: Option<i64>,
    betting_round_pda: Option<String>,
    escrow_pda: Option<String>,
    on_chain_bets: HashMap<String, BetSummary>,
    total_death_bets: u64,
    total_survival_bets: u64,
    chat_connected: bool,
    events: Vec<ServerEvent>,
}

impl GameState {
    pub fn new(coin: String, initial_hp: u32) -> Self {
        GameState {
            coin,
            initial_hp,
            phase: GamePhase::Idle,
            round_id: 0,
            boss_hp: initial_hp,
            max_hp: initial_hp,
            user_hits: HashMap::new(),
            chronological: Vec::new(),
            total_hits: 0,
            last_hitter: None,
            betting_end_ms: None,
            fight_end_ms: None,
            betting_round_pda: None,
            escrow_pda: None,
            on_chain_bets: HashMap::new(),
            total_death_bets: 0,
            total_survival_bets: 0,
            chat_connected: false,
            events: Vec::new(),
        }
    }

    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    pub fn round_id(&self) -> u64 {
        self.round_id
    }

    pub fn boss_hp(&self) -> u32 {
        self.boss_hp
    }

    /// Collects and clears all events produced since the last drain.
    pub fn drain_events(&mut self) -> Vec<ServerEvent> {
        std::mem::take(&mut self.events)
    }

    /// Opens a new betting window. Per-round state is zeroed first, so
    /// `user_hits` is empty and the boss is back at full HP afterwards.
    pub fn enter_betting(
        &mut self,
        round_id: u64,
        betting_round_pda: String,
        escrow_pda: String,
        now_ms: i64,
        betting_duration_ms: i64,
    ) {
        self.clear_round();
        self.round_id = round_id;
        self.betting_round_pda = Some(betting_round_pda);
        self.escrow_pda = Some(escrow_pda);
        self.phase = GamePhase::Betting;
        self.betting_end_ms = Some(now_ms + betting_duration_ms);
        self.events.push(ServerEvent::PhaseChange {
            phase: GamePhase::Betting,
            round_id,
            time_remaining_ms: Some(betting_duration_ms),
            message: None,
        });
    }

    /// Starts the fight window and installs the bet mirror scanned from the
    /// ledger. The totals are the authoritative on-chain values.
    pub fn enter_fighting(
        &mut self,
        now_ms: i64,
        fight_duration_ms: i64,
        bets: Vec<BetSummary>,
        total_death_bets: u64,
        total_survival_bets: u64,
    ) {
        self.phase = GamePhase::Fighting;
        self.betting_end_ms = None;
        self.fight_end_ms = Some(now_ms + fight_duration_ms);
        self.on_chain_bets = bets.into_iter().map(|b| (b.wallet.clone(), b)).collect();
        self.total_death_bets = total_death_bets;
        self.total_survival_bets = total_survival_bets;
        self.events.push(ServerEvent::PhaseChange {
            phase: GamePhase::Fighting,
            round_id: self.round_id,
            time_remaining_ms: Some(fight_duration_ms),
            message: None,
        });
        self.push_betting_update();
    }

    /// Applies a classified chat message. Only the Fighting phase mutates
    /// anything; heals touch neither `user_hits` nor `last_hitter`.
    /// Returns true when this write brought the boss from alive to 0 HP,
    /// which obliges the caller to run the fight-end flow immediately.
    pub fn apply_chat(&mut self, event: &ChatEvent, effect: Effect, now_ms: i64) -> bool {
        if self.phase != GamePhase::Fighting {
            return false;
        }
        let delta: i8 = match effect {
            Effect::Damage => -1,
            Effect::Heal => 1,
            Effect::Ignore => return false,
        };
        let hp_before = self.boss_hp;
        // Per-round the log must stay non-decreasing in ts even if the
        // source delivers a stale timestamp.
        let ts_floor = self.chronological.last().map(|e| e.ts_ms).unwrap_or(i64::MIN);
        let entry = HitEntry {
            username: event.username.clone(),
            message: event.message.clone(),
            ts_ms: event.ts_ms.max(ts_floor),
            delta,
        };
        match effect {
            Effect::Damage => {
                self.total_hits += 1;
                *self.user_hits.entry(event.username.clone()).or_insert(0) += 1;
                self.last_hitter = Some(event.username.clone());
                self.boss_hp = self.boss_hp.saturating_sub(1);
            }
            Effect::Heal => {
                self.boss_hp = self.boss_hp.saturating_add(1).min(self.max_hp);
            }
            Effect::Ignore => unreachable!(),
        }
        self.chronological.push(entry.clone());
        self.events.push(ServerEvent::Update {
            boss_hp: self.boss_hp,
            max_hp: self.max_hp,
            total_hits: self.total_hits,
            top_hitters: self.top_hitters(),
            last_hitter: self.last_hitter.clone(),
            entry,
            time_remaining_ms: self.time_remaining_ms(now_ms).unwrap_or(0),
        });
        hp_before > 0 && self.boss_hp == 0
    }

    /// Closes the fight: phase becomes Ended, the timer is gone and the
    /// results document is built. Publishes `fight_ended`.
    pub fn end_fight(&mut self, now_ms: i64) -> FightResults {
        self.phase = GamePhase::Ended;
        self.fight_end_ms = None;
        self.betting_end_ms = None;
        let mut user_hits: Vec<TopHitter> = self
            .user_hits
            .iter()
            .map(|(username, hits)| TopHitter {
                username: username.clone(),
                hits: *hits,
            })
            .collect();
        user_hits.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.username.cmp(&b.username)));
        let results = FightResults {
            round_id: self.round_id,
            coin: self.coin.clone(),
            boss_defeated: self.boss_hp == 0,
            final_hp: self.boss_hp,
            max_hp: self.max_hp,
            total_hits: self.total_hits,
            user_hits,
            last_hitter: self.last_hitter.clone(),
            chronological: self.chronological.clone(),
            total_death_bets: self.total_death_bets,
            total_survival_bets: self.total_survival_bets,
            ended_at_ms: now_ms,
        };
        self.events.push(ServerEvent::FightEnded {
            results: results.clone(),
        });
        results
    }

    /// Falls back to Idle after a failed transition, with a user-visible
    /// explanation. Round data stays around for inspection until the next
    /// `enter_betting` clears it.
    pub fn revert_to_idle(&mut self, message: &str) {
        self.phase = GamePhase::Idle;
        self.betting_end_ms = None;
        self.fight_end_ms = None;
        self.events.push(ServerEvent::PhaseChange {
            phase: GamePhase::Idle,
            round_id: self.round_id,
            time_remaining_ms: None,
            message: Some(message.to_string()),
        });
    }

    /// Admin reset: everything back to a fresh Idle state.
    pub fn reset(&mut self) {
        self.clear_round();
        self.round_id = 0;
        self.phase = GamePhase::Idle;
        self.events.push(ServerEvent::GameReset);
    }

    /// Client-driven mirror of a just-confirmed bet. Display only, the
    /// authoritative totals are refreshed from the chain on fight start.
    pub fn note_bet(&mut self, bet: BetSummary) {
        if self.phase != GamePhase::Betting {
            return;
        }
        self.on_chain_bets.insert(bet.wallet.clone(), bet);
        let (mut death, mut survival) = (0u64, 0u64);
        for bet in self.on_chain_bets.values() {
            match bet.prediction {
                protocol::Prediction::Death => death += bet.amount_lamports,
                protocol::Prediction::Survival => survival += bet.amount_lamports,
            }
        }
        self.total_death_bets = death;
        self.total_survival_bets = survival;
        self.push_betting_update();
    }

    pub fn set_chat_connected(&mut self, connected: bool, terminal: bool) {
        self.chat_connected = connected;
        self.events.push(ServerEvent::ConnectionStatus { connected, terminal });
    }

    /// Emits the advisory 100 ms timer tick while a phase timer runs.
    pub fn tick(&mut self, now_ms: i64) {
        if let Some(remaining) = self.time_remaining_ms(now_ms) {
            self.events.push(ServerEvent::TimerUpdate {
                phase: self.phase,
                time_remaining_ms: remaining,
            });
        }
    }

    /// Remaining time of whichever phase timer is active.
    pub fn time_remaining_ms(&self, now_ms: i64) -> Option<i64> {
        let end = match self.phase {
            GamePhase::Betting => self.betting_end_ms,
            GamePhase::Fighting => self.fight_end_ms,
            _ => None,
        }?;
        Some((end - now_ms).max(0))
    }

    /// The full public snapshot a fresh subscriber starts from.
    pub fn snapshot(&self, now_ms: i64) -> GameSnapshot {
        let recent_entries = self
            .chronological
            .iter()
            .rev()
            .take(SNAPSHOT_HISTORY_LEN)
            .rev()
            .cloned()
            .collect();
        GameSnapshot {
            phase: self.phase,
            round_id: self.round_id,
            boss_hp: self.boss_hp,
            max_hp: self.max_hp,
            total_hits: self.total_hits,
            top_hitters: self.top_hitters(),
            last_hitter: self.last_hitter.clone(),
            recent_entries,
            total_death_bets: self.total_death_bets,
            total_survival_bets: self.total_survival_bets,
            time_remaining_ms: self.time_remaining_ms(now_ms),
            chat_connected: self.chat_connected,
            betting_round_pda: self.betting_round_pda.clone(),
            escrow_pda: self.escrow_pda.clone(),
        }
    }

    fn top_hitters(&self) -> Vec<TopHitter> {
        let mut all: Vec<TopHitter> = self
            .user_hits
            .iter()
            .map(|(username, hits)| TopHitter {
                username: username.clone(),
                hits: *hits,
            })
            .collect();
        all.sort_by(|a, b| b.hits.cmp(&a.hits).then_with(|| a.username.cmp(&b.username)));
        all.truncate(TOP_HITTERS_LEN);
        all
    }

    fn push_betting_update(&mut self) {
        let mut bets: Vec<BetSummary> = self.on_chain_bets.values().cloned().collect();
        bets.sort_by_key(|b| b.ts_ms);
        self.events.push(ServerEvent::BettingUpdate {
            total_death_bets: self.total_death_bets,
            total_survival_bets: self.total_survival_bets,
            bets,
        });
    }

    fn clear_round(&mut self) {
        self.boss_hp = self.initial_hp;
        self.max_hp = self.initial_hp;
        self.user_hits.clear();
        self.chronological.clear();
        self.total_hits = 0;
        self.last_hitter = None;
        self.betting_end_ms = None;
        self.fight_end_ms = None;
        self.betting_round_pda = None;
        self.escrow_pda = None;
        self.on_chain_bets.clear();
        self.total_death_bets = 0;
        self.total_survival_bets = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(username: &str, message: &str, ts_ms: i64) -> ChatEvent {
        ChatEvent {
            username: username.to_string(),
            message: message.to_string(),
            ts_ms,
        }
    }

    fn fighting_state(initial_hp: u32) -> GameState {
        let mut state = GameState::new("coin".to_string(), initial_hp);
        state.enter_betting(1, "round".to_string(), "escrow".to_string(), 0, 1_000);
        state.enter_fighting(1_000, 5_000, Vec::new(), 0, 0);
        state.drain_events();
        state
    }

    fn count_damage_entries(state: &GameState) -> u32 {
        state.chronological.iter().filter(|e| e.delta == -1).count() as u32
    }

    #[test]
    fn happy_path_defeat() {
        let mut state = fighting_state(3);
        assert!(!state.apply_chat(&chat("alice", "HIT", 1_100), Effect::Damage, 1_100));
        assert!(!state.apply_chat(&chat("bob", "HIT", 1_200), Effect::Damage, 1_200));
        assert!(state.apply_chat(&chat("alice", "HIT", 1_300), Effect::Damage, 1_300));
        assert_eq!(state.boss_hp, 0);

        let results = state.end_fight(1_400);
        assert!(results.boss_defeated);
        assert_eq!(results.total_hits, 3);
        assert_eq!(results.last_hitter.as_deref(), Some("alice"));
        assert_eq!(
            results.user_hits,
            vec![
                TopHitter { username: "alice".to_string(), hits: 2 },
                TopHitter { username: "bob".to_string(), hits: 1 },
            ]
        );
        assert_eq!(state.phase(), GamePhase::Ended);
    }

    #[test]
    fn timeout_survival_keeps_hp() {
        let mut state = fighting_state(3);
        state.apply_chat(&chat("alice", "HIT", 1_100), Effect::Damage, 1_100);
        let results = state.end_fight(6_000);
        assert!(!results.boss_defeated);
        assert_eq!(results.final_hp, 2);
    }

    #[test]
    fn heal_does_not_touch_hitters() {
        let mut state = fighting_state(3);
        state.apply_chat(&chat("alice", "HIT", 1_100), Effect::Damage, 1_100);
        state.apply_chat(&chat("alice", "HIT", 1_200), Effect::Damage, 1_200);
        assert_eq!(state.boss_hp, 1);

        let ended = state.apply_chat(&chat("eve", "HEAL", 1_300), Effect::Heal, 1_300);
        assert!(!ended);
        assert_eq!(state.boss_hp, 2);
        assert_eq!(state.last_hitter.as_deref(), Some("alice"));
        assert!(!state.user_hits.contains_key("eve"));
    }

    #[test]
    fn heal_clamps_at_max_hp() {
        let mut state = fighting_state(3);
        state.apply_chat(&chat("eve", "HEAL", 1_100), Effect::Heal, 1_100);
        assert_eq!(state.boss_hp, 3);
    }

    #[test]
    fn damage_then_heal_round_trips_inside_bounds() {
        let mut state = fighting_state(3);
        state.apply_chat(&chat("alice", "HIT", 1_100), Effect::Damage, 1_100);
        let hp_mid = state.boss_hp;
        state.apply_chat(&chat("alice", "HIT", 1_200), Effect::Damage, 1_200);
        state.apply_chat(&chat("eve", "HEAL", 1_300), Effect::Heal, 1_300);
        assert_eq!(state.boss_hp, hp_mid);
    }

    #[test]
    fn ignore_and_out_of_phase_change_nothing() {
        let mut state = GameState::new("coin".to_string(), 3);
        // Idle phase: even a damage effect must not move anything.
        assert!(!state.apply_chat(&chat("alice", "HIT", 100), Effect::Damage, 100));
        assert_eq!(state.total_hits, 0);
        assert!(state.drain_events().is_empty());

        let mut state = fighting_state(3);
        state.apply_chat(&chat("mallory", "HIT and HEAL", 1_100), Effect::Ignore, 1_100);
        assert_eq!(state.total_hits, 0);
        assert_eq!(state.boss_hp, 3);
        assert!(state.drain_events().is_empty());
    }

    #[test]
    fn total_hits_matches_user_hits_and_log() {
        let mut state = fighting_state(10);
        for i in 0..4 {
            state.apply_chat(&chat("alice", "HIT", 1_100 + i), Effect::Damage, 1_100 + i);
        }
        state.apply_chat(&chat("bob", "HIT", 1_200), Effect::Damage, 1_200);
        state.apply_chat(&chat("eve", "HEAL", 1_300), Effect::Heal, 1_300);

        let sum: u32 = state.user_hits.values().sum();
        assert_eq!(state.total_hits, sum);
        assert_eq!(state.total_hits, count_damage_entries(&state));
    }

    #[test]
    fn chronological_timestamps_never_decrease() {
        let mut state = fighting_state(10);
        state.apply_chat(&chat("alice", "HIT", 2_000), Effect::Damage, 2_000);
        // Stale source timestamp gets floored to the previous entry.
        state.apply_chat(&chat("bob", "HIT", 1_500), Effect::Damage, 2_100);
        let ts: Vec<i64> = state.chronological.iter().map(|e| e.ts_ms).collect();
        assert_eq!(ts, vec![2_000, 2_000]);
    }

    #[test]
    fn enter_betting_zeroes_the_round() {
        let mut state = fighting_state(3);
        state.apply_chat(&chat("alice", "HIT", 1_100), Effect::Damage, 1_100);
        state.end_fight(6_000);

        state.enter_betting(2, "round2".to_string(), "escrow2".to_string(), 7_000, 60_000);
        assert!(state.user_hits.is_empty());
        assert_eq!(state.boss_hp, 3);
        assert_eq!(state.total_hits, 0);
        assert!(state.chronological.is_empty());
        assert_eq!(state.round_id(), 2);
        assert_eq!(state.time_remaining_ms(7_000), Some(60_000));
    }

    #[test]
    fn reset_clears_everything_and_broadcasts() {
        let mut state = fighting_state(3);
        state.apply_chat(&chat("alice", "HIT", 1_100), Effect::Damage, 1_100);
        state.drain_events();
        state.reset();
        assert_eq!(state.phase(), GamePhase::Idle);
        assert_eq!(state.round_id(), 0);
        assert_eq!(state.total_hits, 0);
        let events = state.drain_events();
        assert!(matches!(events.as_slice(), [ServerEvent::GameReset]));
    }

    #[test]
    fn phase_change_precedes_first_damage_update() {
        let mut state = GameState::new("coin".to_string(), 3);
        state.enter_betting(1, "round".to_string(), "escrow".to_string(), 0, 1_000);
        state.enter_fighting(1_000, 5_000, Vec::new(), 0, 0);
        state.apply_chat(&chat("alice", "HIT", 1_100), Effect::Damage, 1_100);
        let events = state.drain_events();
        let fighting_at = events
            .iter()
            .position(|e| matches!(e, ServerEvent::PhaseChange { phase: GamePhase::Fighting, .. }))
            .unwrap();
        let update_at = events
            .iter()
            .position(|e| matches!(e, ServerEvent::Update { .. }))
            .unwrap();
        assert!(fighting_at < update_at);
    }

    #[test]
    fn snapshot_history_is_capped() {
        let mut state = fighting_state(100);
        for i in 0..25 {
            state.apply_chat(&chat("alice", "HIT", 1_100 + i), Effect::Damage, 1_100 + i);
        }
        let snapshot = state.snapshot(2_000);
        assert_eq!(snapshot.recent_entries.len(), SNAPSHOT_HISTORY_LEN);
        assert_eq!(snapshot.recent_entries.last().unwrap().ts_ms, 1_124);
    }

    #[test]
    fn bet_note_updates_mirror_totals_in_betting_only() {
        let mut state = GameState::new("coin".to_string(), 3);
        state.enter_betting(1, "round".to_string(), "escrow".to_string(), 0, 60_000);
        state.drain_events();
        state.note_bet(BetSummary {
            username: "alice".to_string(),
            wallet: "w1".to_string(),
            amount_lamports: 500,
            prediction: protocol::Prediction::Death,
            ts_ms: 10,
        });
        assert_eq!(state.total_death_bets, 500);
        // Replacing the same wallet must not double count.
        state.note_bet(BetSummary {
            username: "alice".to_string(),
            wallet: "w1".to_string(),
            amount_lamports: 700,
            prediction: protocol::Prediction::Death,
            ts_ms: 20,
        });
        assert_eq!(state.total_death_bets, 700);

        state.enter_fighting(60_000, 60_000, Vec::new(), 0, 0);
        state.note_bet(BetSummary {
            username: "late".to_string(),
            wallet: "w2".to_string(),
            amount_lamports: 900,
            prediction: protocol::Prediction::Survival,
            ts_ms: 30,
        });
        assert_eq!(state.total_survival_bets, 0);
    }
}
