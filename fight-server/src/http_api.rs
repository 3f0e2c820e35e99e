//! The outside surface: the JSON endpoints the overlay and the betting UI
//! call, the `/ws` realtime channel, and the static overlay assets.
//!
//! Handlers never touch game state directly. Reads come from the snapshot
//! the orchestrator publishes, writes go through its input queue, and the
//! ledger client is shared for the read-only/bet-building calls.

use crate::config::Config;
use crate::hub::SUBSCRIBER_QUEUE_SIZE;
use crate::ledger::{BettingRoundAccount, LedgerClient, LedgerError};
use crate::orchestrator::Input;
use axum::Router;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use futures_util::stream::{SplitSink, SplitStream, StreamExt};
use futures_util::SinkExt;
use protocol::{BetSummary, ChatEvent, ClientCommand, GamePhase, GameSnapshot, Prediction, ServerEvent};
use serde::Deserialize;
use serde_json::{Value, json};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch};
use tower_http::services::{ServeDir, ServeFile};

pub struct AppState {
    pub cfg: Arc<Config>,
    pub inputs: mpsc::Sender<Input>,
    pub snapshot: watch::Receiver<GameSnapshot>,
    pub ledger: Arc<LedgerClient>,
    pub next_subscriber_id: AtomicU64,
}

/// JSON error envelope with the right status code.
struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: &str) -> Self {
        ApiError(StatusCode::BAD_REQUEST, message.to_string())
    }

    fn conflict(message: &str) -> Self {
        ApiError(StatusCode::CONFLICT, message.to_string())
    }

    fn upstream(err: LedgerError) -> Self {
        ApiError(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/game-status", get(game_status))
        .route("/api/current-round", get(current_round))
        .route("/api/betting-round/{round_id}", get(betting_round))
        .route("/api/place-bet", post(place_bet))
        .route("/api/bet-notification", post(bet_notification))
        .route("/api/bet-status/{wallet}/{round_id}", get(bet_status))
        .route("/test", get(test_inject))
        .route("/status", get(legacy_status))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .fallback_service(
            ServeDir::new("overlay").not_found_service(ServeFile::new("overlay/index.html")),
        )
}

/// Snapshot of the current public state.
async fn game_status(State(state): State<Arc<AppState>>) -> Json<GameSnapshot> {
    Json(state.snapshot.borrow().clone())
}

/// Round identity, PDAs and betting totals.
async fn current_round(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snap = state.snapshot.borrow().clone();
    Json(json!({
        "roundId": snap.round_id,
        "coin": state.cfg.coin_address,
        "phase": snap.phase,
        "bettingRoundPDA": snap.betting_round_pda,
        "escrowPDA": snap.escrow_pda,
        "totalDeathBets": snap.total_death_bets,
        "totalSurvivalBets": snap.total_survival_bets,
        "timeRemainingMs": snap.time_remaining_ms,
    }))
}

/// Proxy read of the on-chain round account.
async fn betting_round(
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<u64>,
) -> Result<Json<Value>, ApiError> {
    let round = state.ledger.read_round(round_id).await.map_err(ApiError::upstream)?;
    Ok(Json(round_view(&round)))
}

fn round_view(round: &BettingRoundAccount) -> Value {
    let phase = match round.phase {
        0 => "betting",
        1 => "fighting",
        _ => "ended",
    };
    json!({
        "roundId": round.round_id,
        "authority": Pubkey::new_from_array(round.authority).to_string(),
        "treasury": Pubkey::new_from_array(round.treasury).to_string(),
        "bettingStartTime": round.betting_start_time,
        "bettingEndTime": round.betting_end_time,
        "fightEndTime": round.fight_end_time,
        "initialHp": round.initial_hp,
        "currentHp": round.current_hp,
        "feePercentage": round.fee_percentage,
        "phase": phase,
        "totalDeathBets": round.total_death_bets,
        "totalSurvivalBets": round.total_survival_bets,
        "totalBetsCount": round.total_bets_count,
        "bossDefeated": round.boss_defeated,
        "payoutsProcessed": round.payouts_processed,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BetBody {
    wallet_address: String,
    username: String,
    amount: u64,
    prediction: Prediction,
}

/// Builds the unsigned bet transaction. Refused outside the betting window
/// and for wallets that already hold a bet in this round.
async fn place_bet(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BetBody>,
) -> Result<Json<Value>, ApiError> {
    let snap = state.snapshot.borrow().clone();
    if snap.phase != GamePhase::Betting {
        return Err(ApiError::conflict("betting is closed"));
    }
    let bettor = Pubkey::from_str(&body.wallet_address)
        .map_err(|_| ApiError::bad_request("invalid wallet address"))?;
    let existing = state
        .ledger
        .find_bet(snap.round_id, &bettor)
        .await
        .map_err(ApiError::upstream)?;
    if existing.is_some() {
        return Err(ApiError::conflict("bet already placed for this round"));
    }
    let prepared = state
        .ledger
        .prepare_bet_tx(snap.round_id, bettor, body.amount, body.prediction, &body.username)
        .await
        .map_err(ApiError::upstream)?;
    Ok(Json(json!({
        "transaction": prepared.transaction_base64,
        "betPDA": prepared.bet_pda.to_string(),
        "roundId": snap.round_id,
    })))
}

/// UI-liveness mirror of a just-confirmed bet. Does not touch the
/// authoritative totals, those are re-read from the chain on fight start.
async fn bet_notification(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BetBody>,
) -> Json<Value> {
    let bet = BetSummary {
        username: body.username,
        wallet: body.wallet_address,
        amount_lamports: body.amount,
        prediction: body.prediction,
        ts_ms: chrono::Utc::now().timestamp_millis(),
    };
    let _ = state.inputs.send(Input::BetNotification(bet)).await;
    Json(json!({ "ok": true }))
}

/// Bet existence and details for one wallet and round.
async fn bet_status(
    State(state): State<Arc<AppState>>,
    Path((wallet, round_id)): Path<(String, u64)>,
) -> Result<Json<Value>, ApiError> {
    let bettor =
        Pubkey::from_str(&wallet).map_err(|_| ApiError::bad_request("invalid wallet address"))?;
    let bet = state.ledger.find_bet(round_id, &bettor).await.map_err(ApiError::upstream)?;
    Ok(Json(match bet {
        None => json!({ "exists": false }),
        Some(bet) => json!({
            "exists": true,
            "bet": {
                "username": bet.username,
                "amountLamports": bet.amount,
                "prediction": bet.prediction(),
                "timestamp": bet.timestamp,
                "payoutClaimed": bet.payout_claimed,
            },
        }),
    }))
}

#[derive(Deserialize)]
struct TestParams {
    user: Option<String>,
    msg: Option<String>,
}

/// Synthetic chat injection for smoke tests. The orchestrator ignores it
/// outside the Fighting phase.
async fn test_inject(
    State(state): State<Arc<AppState>>,
    Query(params): Query<TestParams>,
) -> String {
    let (Some(user), Some(msg)) = (params.user, params.msg) else {
        return "usage: /test?user=<name>&msg=<message>".to_string();
    };
    let event = ChatEvent {
        username: user.clone(),
        message: msg.clone(),
        ts_ms: chrono::Utc::now().timestamp_millis(),
    };
    if state.inputs.send(Input::Chat(event)).await.is_err() {
        return "orchestrator unavailable".to_string();
    }
    format!("injected {user}: {msg}")
}

/// Legacy boss-HP snapshot kept for old overlay builds.
async fn legacy_status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let snap = state.snapshot.borrow().clone();
    Json(json!({
        "bossHP": snap.boss_hp,
        "maxHP": snap.max_hp,
        "phase": snap.phase,
        "totalHits": snap.total_hits,
        "lastHitter": snap.last_hitter,
    }))
}

/// This function gets immediately called and upgrades the web response to a
/// web socket.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| websocket(socket, state))
}

/// One overlay subscriber: register with the orchestrator (which answers
/// with the snapshot), then pump events out and admin commands in until
/// either side goes away.
async fn websocket(stream: WebSocket, state: Arc<AppState>) {
    // By splitting, we can send and receive at the same time.
    let (sender, receiver) = stream.split();
    let id = state.next_subscriber_id.fetch_add(1, Ordering::Relaxed);

    let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
    if state.inputs.send(Input::Subscribe { id, tx }).await.is_err() {
        return;
    }

    let mut send_task = tokio::spawn(send_events(sender, rx));
    let mut receive_task = tokio::spawn(receive_commands(receiver, state.inputs.clone(), id));

    // If any one of the tasks runs to completion, we abort the other.
    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    };

    let _ = state.inputs.send(Input::Unsubscribe { id }).await;
    tracing::debug!(subscriber = id, "overlay connection closed");
}

async fn send_events(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<ServerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(%err, "event serialization failed");
                continue;
            }
        };
        if sender.send(Message::Text(Utf8Bytes::from(payload))).await.is_err() {
            return;
        }
    }
    // Channel gone: the hub dropped us as too slow, or the server stops.
    let _ = sender.send(Message::Close(None)).await;
}

async fn receive_commands(
    mut receiver: SplitStream<WebSocket>,
    inputs: mpsc::Sender<Input>,
    id: u64,
) {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                // Everything that is not a known command is ignored.
                let Ok(ClientCommand::Admin { action, admin_key, wallet_address }) =
                    serde_json::from_str::<ClientCommand>(text.as_str())
                else {
                    continue;
                };
                let command = Input::Admin { subscriber: id, action, admin_key, wallet_address };
                if inputs.send(command).await.is_err() {
                    return;
                }
            }
            Ok(Message::Close(_)) | Err(_) => return,
            Ok(_) => {}
        }
    }
}
