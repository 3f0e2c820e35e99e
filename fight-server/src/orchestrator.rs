//! The single writer. Chat events, admin commands, timer expirations and
//! subscriber churn all arrive on one input queue and are applied to the
//! owned [`GameState`] one at a time; the events each step produces are
//! drained to the hub immediately afterwards, and a fresh snapshot is
//! published over a watch channel for the HTTP readers.
//!
//! The only awaits in here are ledger RPCs and the export write. While an
//! RPC is in flight the queue keeps draining through a nested dispatch that
//! serves subscriber join/leave, throws away chat (the phase that wanted it
//! is over or changing), and defers everything else — which is also why a
//! reset requested during settlement applies after it, never into it.

use crate::config::Config;
use crate::export;
use crate::game_state::GameState;
use crate::hub::Hub;
use crate::interpreter::{self, Effect};
use crate::ledger::{LedgerClient, LedgerError};
use crate::settlement;
use protocol::{AdminAction, BetSummary, ChatEvent, GamePhase, GameSnapshot, ServerEvent};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};

/// Cadence of the advisory `timer_update` broadcast.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Everything that can stimulate the orchestrator.
#[derive(Debug)]
pub enum Input {
    Chat(ChatEvent),
    ChatStatus { connected: bool, terminal: bool },
    Subscribe { id: u64, tx: mpsc::Sender<ServerEvent> },
    Unsubscribe { id: u64 },
    Admin {
        subscriber: u64,
        action: AdminAction,
        admin_key: String,
        wallet_address: String,
    },
    BetNotification(BetSummary),
    Shutdown,
}

pub struct Orchestrator {
    cfg: Arc<Config>,
    ledger: Arc<LedgerClient>,
    state: GameState,
    hub: Hub,
    inputs: mpsc::Receiver<Input>,
    inputs_open: bool,
    deferred: VecDeque<Input>,
    snapshot_tx: watch::Sender<GameSnapshot>,
    phase_deadline: Option<Instant>,
    /// Set once the fight-end flow has begun. While it is set no further
    /// chat mutates the round, even if the on-chain end failed and the
    /// phase is still Fighting awaiting an admin retry.
    fight_closing: bool,
    shutdown: bool,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl Orchestrator {
    pub fn new(
        cfg: Arc<Config>,
        ledger: Arc<LedgerClient>,
        inputs: mpsc::Receiver<Input>,
        snapshot_tx: watch::Sender<GameSnapshot>,
    ) -> Self {
        let state = GameState::new(cfg.coin_address.clone(), cfg.initial_hp);
        Orchestrator {
            cfg,
            ledger,
            state,
            hub: Hub::new(),
            inputs,
            inputs_open: true,
            deferred: VecDeque::new(),
            snapshot_tx,
            phase_deadline: None,
            fight_closing: false,
            shutdown: false,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if self.shutdown {
                break;
            }
            // Inputs that arrived during an RPC await go first, in order.
            if let Some(input) = self.deferred.pop_front() {
                self.handle_input(input).await;
                self.flush();
                continue;
            }
            let timer_running =
                matches!(self.state.phase(), GamePhase::Betting | GamePhase::Fighting);
            let deadline = self.phase_deadline;
            tokio::select! {
                maybe = self.inputs.recv(), if self.inputs_open => match maybe {
                    Some(input) => self.handle_input(input).await,
                    None => {
                        self.inputs_open = false;
                        self.shutdown = true;
                    }
                },
                _ = ticker.tick(), if timer_running => self.state.tick(now_ms()),
                _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                    self.on_deadline().await;
                }
                else => break,
            }
            self.flush();
        }
        tracing::info!("orchestrator stopped");
    }

    async fn handle_input(&mut self, input: Input) {
        match input {
            Input::Chat(event) => self.on_chat(event).await,
            Input::ChatStatus { connected, terminal } => {
                self.state.set_chat_connected(connected, terminal);
            }
            Input::Subscribe { id, tx } => self.on_subscribe(id, tx),
            Input::Unsubscribe { id } => self.hub.detach(id),
            Input::Admin { subscriber, action, admin_key, wallet_address } => {
                self.on_admin(subscriber, action, &admin_key, &wallet_address).await;
            }
            Input::BetNotification(bet) => self.state.note_bet(bet),
            Input::Shutdown => self.shutdown = true,
        }
    }

    /// Chat only matters during Fighting; everything else is silence.
    async fn on_chat(&mut self, event: ChatEvent) {
        if self.state.phase() != GamePhase::Fighting || self.fight_closing {
            return;
        }
        let effect = interpreter::classify(
            &event.message,
            &self.cfg.trigger_keywords,
            &self.cfg.heal_keywords,
        );
        if effect == Effect::Ignore {
            return;
        }
        let defeated = self.state.apply_chat(&event, effect, now_ms());
        if defeated {
            // The killing blow ends the fight on the same write.
            self.flush();
            self.finish_fight().await;
        }
    }

    fn on_subscribe(&mut self, id: u64, tx: mpsc::Sender<ServerEvent>) {
        self.hub.attach(id, tx);
        let snapshot = self.state.snapshot(now_ms());
        self.hub.send_to(id, ServerEvent::State { state: snapshot });
        tracing::info!(subscriber = id, total = self.hub.count(), "overlay subscribed");
    }

    async fn on_admin(
        &mut self,
        subscriber: u64,
        action: AdminAction,
        admin_key: &str,
        wallet_address: &str,
    ) {
        if admin_key != self.cfg.admin_secret || wallet_address != self.cfg.admin_wallet {
            tracing::warn!(subscriber, "rejected admin command");
            self.hub.send_to(
                subscriber,
                ServerEvent::AdminError { message: "invalid admin credentials".to_string() },
            );
            return;
        }
        match action {
            AdminAction::StartBetting => {
                if !matches!(self.state.phase(), GamePhase::Idle | GamePhase::Ended) {
                    self.hub.send_to(
                        subscriber,
                        ServerEvent::AdminError {
                            message: "a round is already in progress".to_string(),
                        },
                    );
                    return;
                }
                self.start_betting(subscriber).await;
            }
            AdminAction::Reset => {
                self.phase_deadline = None;
                self.fight_closing = false;
                self.state.reset();
                tracing::info!("game reset by admin");
            }
            AdminAction::EndFight => {
                // Only a round whose on-chain end already failed can be
                // retried; a healthy fight ends through its own timer.
                if self.state.phase() != GamePhase::Fighting || !self.fight_closing {
                    self.hub.send_to(
                        subscriber,
                        ServerEvent::AdminError {
                            message: "no stuck fight to end".to_string(),
                        },
                    );
                    return;
                }
                tracing::info!("fight end retry requested by admin");
                self.finish_fight().await;
            }
        }
    }

    /// Opens a round: fresh round id from the wall clock, PDAs derived,
    /// on-chain init first. Only a successful init leaves Idle.
    async fn start_betting(&mut self, subscriber: u64) {
        let round_id = now_ms() as u64;
        let pdas = self.ledger.round_pdas(round_id);
        let ledger = self.ledger.clone();
        let (betting, fight, hp, fee) = (
            self.cfg.betting_duration,
            self.cfg.fight_duration,
            self.cfg.initial_hp,
            self.cfg.fee_percentage,
        );
        let outcome = self
            .drain_while(async move { ledger.init_round(round_id, betting, fight, hp, fee).await })
            .await;
        match outcome {
            Ok(signature) => {
                tracing::info!(round_id, %signature, "betting round initialized on-chain");
                self.state.enter_betting(
                    round_id,
                    pdas.betting_round.to_string(),
                    pdas.escrow.to_string(),
                    now_ms(),
                    self.cfg.betting_duration.as_millis() as i64,
                );
                self.phase_deadline = Some(Instant::now() + self.cfg.betting_duration);
            }
            Err(err) => {
                tracing::error!(round_id, %err, "init_round failed, staying idle");
                self.hub.send_to(
                    subscriber,
                    ServerEvent::AdminError {
                        message: format!("could not open betting round: {err}"),
                    },
                );
            }
        }
    }

    async fn on_deadline(&mut self) {
        self.phase_deadline = None;
        match self.state.phase() {
            GamePhase::Betting => self.start_fighting().await,
            GamePhase::Fighting => self.finish_fight().await,
            _ => {}
        }
    }

    async fn start_fighting(&mut self) {
        let round_id = self.state.round_id();
        let ledger = self.ledger.clone();
        let started = self.drain_while(async move { ledger.start_fight(round_id).await }).await;
        if let Err(err) = started {
            tracing::error!(round_id, %err, "start_fight failed, reverting to idle");
            self.state
                .revert_to_idle("could not start the fight on-chain, round abandoned");
            return;
        }

        // Refresh the bet mirror from the chain. Display only; a failed
        // scan does not stop the fight.
        let ledger = self.ledger.clone();
        let scanned = self
            .drain_while(async move {
                let round = ledger.read_round(round_id).await?;
                let bets = ledger.scan_bets(round_id).await?;
                Ok::<_, LedgerError>((round, bets))
            })
            .await;
        let (bets, death, survival) = match scanned {
            Ok((round, bets)) => {
                let summaries = bets
                    .iter()
                    .map(|b| BetSummary {
                        username: b.account.username.clone(),
                        wallet: b.account.bettor_pubkey().to_string(),
                        amount_lamports: b.account.amount,
                        prediction: b.account.prediction(),
                        ts_ms: b.account.timestamp * 1000,
                    })
                    .collect();
                (summaries, round.total_death_bets, round.total_survival_bets)
            }
            Err(err) => {
                tracing::warn!(round_id, %err, "bet scan failed, fighting with empty mirror");
                (Vec::new(), 0, 0)
            }
        };

        self.state.enter_fighting(
            now_ms(),
            self.cfg.fight_duration.as_millis() as i64,
            bets,
            death,
            survival,
        );
        self.phase_deadline = Some(Instant::now() + self.cfg.fight_duration);
        tracing::info!(round_id, "fight started");
    }

    /// The fight-end flow: on-chain end, results + `fight_ended`, then
    /// settlement, then export. Chat arriving anywhere in here is discarded
    /// by the nested drain — the fight is over.
    ///
    /// If the on-chain end fails even after the client's retries, the phase
    /// stays Fighting with the round frozen (no further chat mutates it, no
    /// new round can start over it) and an informational `phase_change`
    /// tells the overlay; an admin `end_fight` re-enters this flow, so the
    /// escrow is never orphaned by minting a fresh round id on top of it.
    async fn finish_fight(&mut self) {
        self.phase_deadline = None;
        self.fight_closing = true;
        let round_id = self.state.round_id();

        // The program derives boss_defeated from the HP it was last told,
        // so a defeat has to be synced before end_fight. Survival needs no
        // write, the on-chain HP never moved.
        if self.state.boss_hp() == 0 {
            let ledger = self.ledger.clone();
            if let Err(err) =
                self.drain_while(async move { ledger.update_boss_hp(round_id, 0).await }).await
            {
                tracing::warn!(round_id, %err, "could not sync defeated boss hp on-chain");
            }
        }

        let ledger = self.ledger.clone();
        let ended = self.drain_while(async move { ledger.end_fight(round_id).await }).await;
        if let Err(err) = ended {
            tracing::error!(
                round_id, %err,
                "end_fight failed after retries, round frozen until an admin end_fight"
            );
            self.hub.broadcast(&ServerEvent::PhaseChange {
                phase: GamePhase::Fighting,
                round_id,
                time_remaining_ms: None,
                message: Some(
                    "could not end the fight on-chain, an admin retry is required".to_string(),
                ),
            });
            return;
        }

        let results = self.state.end_fight(now_ms());
        self.fight_closing = false;
        tracing::info!(
            round_id,
            boss_defeated = results.boss_defeated,
            total_hits = results.total_hits,
            "fight ended"
        );
        // fight_ended must reach subscribers before any payout event.
        self.flush();

        let ledger = self.ledger.clone();
        let report =
            self.drain_while(async move { settlement::run(&ledger, round_id).await }).await;
        match report {
            Ok(report) => {
                tracing::info!(
                    round_id,
                    winners = report.payouts.len(),
                    failed = report.failed_payouts,
                    "payouts processed"
                );
                self.hub.broadcast(&ServerEvent::PayoutsProcessed { report });
            }
            Err(err) => tracing::error!(round_id, %err, "settlement failed"),
        }

        if let Err(err) = export::write_results(&self.cfg.export_dir, &results).await {
            tracing::error!(round_id, %err, "result export failed");
        }
    }

    /// Runs a suspension-point future while keeping the input queue alive.
    /// Join/leave is served inline, chat is discarded, the rest waits its
    /// turn in arrival order.
    async fn drain_while<T>(&mut self, fut: impl Future<Output = T>) -> T {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                out = &mut fut => return out,
                maybe = self.inputs.recv(), if self.inputs_open => match maybe {
                    Some(Input::Subscribe { id, tx }) => self.on_subscribe(id, tx),
                    Some(Input::Unsubscribe { id }) => self.hub.detach(id),
                    Some(Input::Chat(_)) => {}
                    Some(other) => self.deferred.push_back(other),
                    None => self.inputs_open = false,
                },
            }
        }
    }

    /// Hands the step's events to the hub and publishes a fresh snapshot.
    fn flush(&mut self) {
        for event in self.state.drain_events() {
            self.hub.broadcast(&event);
        }
        self.snapshot_tx.send_replace(self.state.snapshot(now_ms()));
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400)
}
