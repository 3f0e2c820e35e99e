//! The wire types shared between the fight server and its overlay clients.
//! Every broadcast is one variant of [`ServerEvent`] with a fixed schema, so
//! subscribers decode once and switch on the `type` tag.

use serde::{Deserialize, Serialize};

/// The buffer sizes for the channels for intra VPS communication.
pub const CHANNEL_BUFFER_SIZE: usize = 256;

/// How many chronological entries a fresh subscriber gets in its snapshot.
pub const SNAPSHOT_HISTORY_LEN: usize = 10;

/// How many top damagers are carried in snapshots and updates.
pub const TOP_HITTERS_LEN: usize = 3;

/// The phase the game is currently in. Idle -> Betting -> Fighting -> Ended.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    Idle,
    Betting,
    Fighting,
    Ended,
}

/// A normalized chat message as emitted by the ingestor. Timestamps are
/// preserved from the source, not reassigned on receipt.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ChatEvent {
    pub username: String,
    pub message: String,
    pub ts_ms: i64,
}

/// The side a bettor predicted. Matches the on-chain enum ordering.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Prediction {
    Death,
    Survival,
}

/// One entry of the per-round chronological hit log. `delta` is -1 for
/// damage and +1 for a heal.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct HitEntry {
    pub username: String,
    pub message: String,
    pub ts_ms: i64,
    pub delta: i8,
}

/// Display mirror of an on-chain bet. Authoritative values stay on-chain.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BetSummary {
    pub username: String,
    pub wallet: String,
    pub amount_lamports: u64,
    pub prediction: Prediction,
    pub ts_ms: i64,
}

/// A damager and their accumulated hits for the current round.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TopHitter {
    pub username: String,
    pub hits: u32,
}

/// The full public state a subscriber needs to render the overlay.
/// Sent as the first message after subscribing.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GameSnapshot {
    pub phase: GamePhase,
    pub round_id: u64,
    pub boss_hp: u32,
    pub max_hp: u32,
    pub total_hits: u32,
    pub top_hitters: Vec<TopHitter>,
    pub last_hitter: Option<String>,
    pub recent_entries: Vec<HitEntry>,
    pub total_death_bets: u64,
    pub total_survival_bets: u64,
    pub time_remaining_ms: Option<i64>,
    pub chat_connected: bool,
    pub betting_round_pda: Option<String>,
    pub escrow_pda: Option<String>,
}

/// One successful payout issued during settlement.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PayoutRecord {
    pub username: String,
    pub wallet: String,
    pub bet_amount: u64,
    pub prize_share: u64,
    pub total_payout: u64,
    pub signature: String,
}

/// Settlement summary for one round.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PayoutReport {
    pub round_id: u64,
    pub winning_side: Prediction,
    pub payouts: Vec<PayoutRecord>,
    pub failed_payouts: u32,
    pub total_paid_lamports: u64,
}

/// Everything there is to say about a finished fight. This is the payload
/// of `fight_ended` and the document the exporter writes.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FightResults {
    pub round_id: u64,
    pub coin: String,
    pub boss_defeated: bool,
    pub final_hp: u32,
    pub max_hp: u32,
    pub total_hits: u32,
    pub user_hits: Vec<TopHitter>,
    pub last_hitter: Option<String>,
    pub chronological: Vec<HitEntry>,
    pub total_death_bets: u64,
    pub total_survival_bets: u64,
    pub ended_at_ms: i64,
}

// Server -> Client

/// The tagged sum of everything the server broadcasts. Variant names are
/// the channel names the overlay switches on.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Full snapshot, initial only.
    State { state: GameSnapshot },
    /// HP / leaderboard diff during Fighting.
    Update {
        boss_hp: u32,
        max_hp: u32,
        total_hits: u32,
        top_hitters: Vec<TopHitter>,
        last_hitter: Option<String>,
        entry: HitEntry,
        time_remaining_ms: i64,
    },
    /// Emitted on every phase transition. `message` carries the reason for
    /// involuntary transitions (ledger failure).
    PhaseChange {
        phase: GamePhase,
        round_id: u64,
        time_remaining_ms: Option<i64>,
        message: Option<String>,
    },
    /// Refreshed bet totals, after a chain scan or a client notification.
    BettingUpdate {
        total_death_bets: u64,
        total_survival_bets: u64,
        bets: Vec<BetSummary>,
    },
    /// 100 ms cadence while a phase timer is running. Advisory, may be
    /// coalesced or dropped for slow subscribers.
    TimerUpdate { phase: GamePhase, time_remaining_ms: i64 },
    /// Results summary, precedes `payouts_processed` of the same round.
    FightEnded { results: FightResults },
    /// Settlement summary.
    PayoutsProcessed { report: PayoutReport },
    /// Upstream chat connectivity. `terminal` is set once reconnect
    /// attempts are exhausted.
    ConnectionStatus { connected: bool, terminal: bool },
    /// All per-round state was cleared.
    GameReset,
    /// Reply to the originating subscriber only, never broadcast.
    #[serde(rename = "admin:error")]
    AdminError { message: String },
}

// Client -> Server

/// What an admin asks the orchestrator to do. `EndFight` re-runs the
/// fight-end flow for a round whose on-chain end failed and was left
/// frozen.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum AdminAction {
    StartBetting,
    Reset,
    EndFight,
}

/// Commands a subscriber may send over the realtime channel. Anything that
/// does not parse into this enum is ignored.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    Admin {
        action: AdminAction,
        admin_key: String,
        wallet_address: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_their_channel_name_as_tag() {
        let event = ServerEvent::TimerUpdate {
            phase: GamePhase::Fighting,
            time_remaining_ms: 1500,
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "timer_update");
        assert_eq!(json["phase"], "fighting");
        assert_eq!(json["timeRemainingMs"], 1500);
    }

    #[test]
    fn admin_error_keeps_the_colon_form() {
        let event = ServerEvent::AdminError { message: "nope".to_string() };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "admin:error");
    }

    #[test]
    fn fields_are_camel_cased_on_the_wire() {
        let event = ServerEvent::BettingUpdate {
            total_death_bets: 5,
            total_survival_bets: 7,
            bets: Vec::new(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["totalDeathBets"], 5);
        assert_eq!(json["totalSurvivalBets"], 7);
    }

    #[test]
    fn admin_command_parses_from_overlay_json() {
        let raw = r#"{"type":"admin","action":"start_betting","adminKey":"s","walletAddress":"w"}"#;
        let command: ClientCommand = serde_json::from_str(raw).unwrap();
        let ClientCommand::Admin { action, admin_key, wallet_address } = command;
        assert_eq!(action, AdminAction::StartBetting);
        assert_eq!(admin_key, "s");
        assert_eq!(wallet_address, "w");
    }

    #[test]
    fn admin_actions_cover_the_full_command_set() {
        for (raw, expected) in [
            ("\"start_betting\"", AdminAction::StartBetting),
            ("\"reset\"", AdminAction::Reset),
            ("\"end_fight\"", AdminAction::EndFight),
        ] {
            let parsed: AdminAction = serde_json::from_str(raw).unwrap();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn predictions_use_lowercase_wire_names() {
        assert_eq!(serde_json::to_string(&Prediction::Death).unwrap(), "\"death\"");
        let parsed: Prediction = serde_json::from_str("\"survival\"").unwrap();
        assert_eq!(parsed, Prediction::Survival);
    }
}
