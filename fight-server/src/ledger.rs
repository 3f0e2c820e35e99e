//! Thin facade over the on-chain betting program: PDA derivation, the
//! administrative phase transitions, settlement calls, bet transaction
//! building for browsers, and the bet-account scan.
//!
//! The authority keypair lives here and nowhere else. Every call carries the
//! client-wide RPC timeout; errors are classified so the orchestrator only
//! has to distinguish "betting still active" from everything else.

use base64::Engine as _;
use borsh::{BorshDeserialize, BorshSerialize};
use protocol::Prediction;
use sha2::{Digest, Sha256};
use solana_account_decoder::UiAccountEncoding;
use solana_client::client_error::ClientError;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction, InstructionError};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, read_keypair_file};
use solana_sdk::signer::Signer;
use solana_sdk::system_program;
use solana_sdk::transaction::{Transaction, TransactionError};
use std::path::Path;
use std::time::Duration;

/// Per-call RPC timeout.
const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// `start_fight_phase` attempts before giving up on a round.
pub const START_FIGHT_ATTEMPTS: u32 = 5;

/// Spacing between `start_fight_phase` attempts.
pub const START_FIGHT_RETRY_SPACING: Duration = Duration::from_secs(2);

/// `end_fight` attempts before the round is left for an admin retry.
pub const END_FIGHT_ATTEMPTS: u32 = 5;

/// Spacing between `end_fight` attempts.
pub const END_FIGHT_RETRY_SPACING: Duration = Duration::from_secs(2);

/// Anchor error code of `BettingStillActive` (6th entry of the program's
/// error enum, codes start at 6000).
const BETTING_STILL_ACTIVE_CODE: u32 = 6005;

/// Byte offset of `round_id` inside a bet account: 8 discriminator bytes
/// plus the 32-byte bettor key.
pub const BET_ROUND_ID_OFFSET: usize = 40;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("betting is still active on-chain")]
    BettingStillActive,
    #[error("{0} account data is malformed")]
    MalformedAccount(&'static str),
    #[error("rpc: {0}")]
    Rpc(#[from] ClientError),
    #[error("codec: {0}")]
    Codec(#[from] std::io::Error),
    #[error("transaction encoding: {0}")]
    Encode(#[from] bincode::Error),
}

/// The two round-level PDAs, as the overlay and the HTTP API want them.
#[derive(Clone, Copy, Debug)]
pub struct RoundAddresses {
    pub betting_round: Pubkey,
    pub escrow: Pubkey,
}

/// Mirror of the on-chain `BettingRound` account.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug)]
pub struct BettingRoundAccount {
    pub round_id: u64,
    pub authority: [u8; 32],
    pub treasury: [u8; 32],
    pub betting_start_time: i64,
    pub betting_end_time: i64,
    pub fight_end_time: i64,
    pub initial_hp: u32,
    pub current_hp: u32,
    pub fee_percentage: u8,
    pub phase: u8,
    pub total_death_bets: u64,
    pub total_survival_bets: u64,
    pub total_bets_count: u64,
    pub boss_defeated: bool,
    pub payouts_processed: bool,
    pub escrow_bump: u8,
}

/// Mirror of the on-chain `BetAccount`.
#[derive(BorshSerialize, BorshDeserialize, Clone, Debug)]
pub struct BetAccount {
    pub bettor: [u8; 32],
    pub round_id: u64,
    pub amount: u64,
    pub prediction: u8,
    pub username: String,
    pub timestamp: i64,
    pub payout_claimed: bool,
}

impl BetAccount {
    pub fn bettor_pubkey(&self) -> Pubkey {
        Pubkey::new_from_array(self.bettor)
    }

    pub fn prediction(&self) -> Prediction {
        if self.prediction == 0 { Prediction::Death } else { Prediction::Survival }
    }
}

/// One record yielded by the bet scan.
#[derive(Clone, Debug)]
pub struct ScannedBet {
    pub address: Pubkey,
    pub account: BetAccount,
}

/// An unsigned bet transaction ready for the browser wallet.
#[derive(Clone, Debug)]
pub struct PreparedBet {
    pub transaction_base64: String,
    pub bet_pda: Pubkey,
}

#[derive(BorshSerialize)]
struct InitializeBettingRoundArgs {
    round_id: u64,
    betting_duration: i64,
    fight_duration: i64,
    initial_hp: u32,
    fee_percentage: u8,
}

#[derive(BorshSerialize)]
struct PlaceBetArgs {
    amount: u64,
    prediction: u8,
    username: String,
}

pub struct LedgerClient {
    rpc: RpcClient,
    authority: Keypair,
    program_id: Pubkey,
    treasury: Pubkey,
}

impl LedgerClient {
    pub fn new(
        rpc_url: &str,
        keypair_path: &Path,
        program_id: Pubkey,
        treasury: Pubkey,
    ) -> anyhow::Result<Self> {
        let authority = read_keypair_file(keypair_path)
            .map_err(|e| anyhow::anyhow!("could not load authority keypair: {e}"))?;
        Ok(LedgerClient {
            rpc: RpcClient::new_with_timeout_and_commitment(
                rpc_url.to_string(),
                RPC_TIMEOUT,
                CommitmentConfig::confirmed(),
            ),
            authority,
            program_id,
            treasury,
        })
    }

    pub fn authority_pubkey(&self) -> Pubkey {
        self.authority.pubkey()
    }

    /// PDAs are pure functions of the round id and the program id.
    pub fn round_pdas(&self, round_id: u64) -> RoundAddresses {
        derive_round_pdas(&self.program_id, round_id)
    }

    pub fn bet_pda(&self, round_id: u64, bettor: &Pubkey) -> Pubkey {
        derive_bet_pda(&self.program_id, round_id, bettor)
    }

    /// Creates the on-chain betting round. Authority signs.
    pub async fn init_round(
        &self,
        round_id: u64,
        betting_duration: Duration,
        fight_duration: Duration,
        initial_hp: u32,
        fee_percentage: u8,
    ) -> Result<Signature, LedgerError> {
        let pdas = self.round_pdas(round_id);
        let args = InitializeBettingRoundArgs {
            round_id,
            betting_duration: betting_duration.as_secs() as i64,
            fight_duration: fight_duration.as_secs() as i64,
            initial_hp,
            fee_percentage,
        };
        let ix = Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(pdas.betting_round, false),
                AccountMeta::new(pdas.escrow, false),
                AccountMeta::new(self.authority.pubkey(), true),
                AccountMeta::new_readonly(self.treasury, false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: instruction_data("initialize_betting_round", Some(&args))?,
        };
        self.send_signed(ix).await
    }

    /// Flips the on-chain round into the fight phase. The program refuses
    /// while its clock still sees the betting window open, so this retries
    /// that one distinguished error with fixed spacing.
    pub async fn start_fight(&self, round_id: u64) -> Result<Signature, LedgerError> {
        let pdas = self.round_pdas(round_id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ix = Instruction {
                program_id: self.program_id,
                accounts: vec![
                    AccountMeta::new(pdas.betting_round, false),
                    AccountMeta::new_readonly(self.authority.pubkey(), true),
                ],
                data: instruction_data::<()>("start_fight_phase", None)?,
            };
            match self.send_signed(ix).await {
                Err(LedgerError::BettingStillActive) if attempt < START_FIGHT_ATTEMPTS => {
                    tracing::info!(round_id, attempt, "betting still active on-chain, retrying");
                    tokio::time::sleep(START_FIGHT_RETRY_SPACING).await;
                }
                other => return other,
            }
        }
    }

    /// Pushes the boss HP on-chain. The program derives `boss_defeated`
    /// from the HP it was last told, so the defeat has to be synced before
    /// `end_fight`; only that final write goes on-chain, individual hits
    /// stay off-chain.
    pub async fn update_boss_hp(&self, round_id: u64, new_hp: u32) -> Result<Signature, LedgerError> {
        let pdas = self.round_pdas(round_id);
        let ix = Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(pdas.betting_round, false),
                AccountMeta::new_readonly(self.authority.pubkey(), true),
            ],
            data: instruction_data("update_boss_hp", Some(&new_hp))?,
        };
        self.send_signed(ix).await
    }

    /// Ends the on-chain fight; the program records `boss_defeated` from the
    /// HP it was last told about and its own clock. Settlement is gated on
    /// this call, so transient failures are retried with fixed spacing
    /// before the round is handed back for an admin retry.
    pub async fn end_fight(&self, round_id: u64) -> Result<Signature, LedgerError> {
        let pdas = self.round_pdas(round_id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ix = Instruction {
                program_id: self.program_id,
                accounts: vec![
                    AccountMeta::new(pdas.betting_round, false),
                    AccountMeta::new_readonly(self.authority.pubkey(), true),
                ],
                data: instruction_data::<()>("end_fight", None)?,
            };
            match self.send_signed(ix).await {
                Err(err) if attempt < END_FIGHT_ATTEMPTS => {
                    tracing::warn!(round_id, attempt, %err, "end_fight failed, retrying");
                    tokio::time::sleep(END_FIGHT_RETRY_SPACING).await;
                }
                other => return other,
            }
        }
    }

    /// Reads the authoritative round account.
    pub async fn read_round(&self, round_id: u64) -> Result<BettingRoundAccount, LedgerError> {
        let pdas = self.round_pdas(round_id);
        let account = self.rpc.get_account(&pdas.betting_round).await?;
        parse_account("BettingRound", &account.data)
    }

    /// Returns the bet of `bettor` for the round, if one exists.
    pub async fn find_bet(
        &self,
        round_id: u64,
        bettor: &Pubkey,
    ) -> Result<Option<BetAccount>, LedgerError> {
        let pda = self.bet_pda(round_id, bettor);
        let response = self
            .rpc
            .get_account_with_commitment(&pda, CommitmentConfig::confirmed())
            .await?;
        match response.value {
            None => Ok(None),
            Some(account) => Ok(Some(parse_account("BetAccount", &account.data)?)),
        }
    }

    /// Builds the unsigned `place_bet` transaction with a fresh blockhash,
    /// serialized for the browser wallet to sign and submit.
    pub async fn prepare_bet_tx(
        &self,
        round_id: u64,
        bettor: Pubkey,
        amount_lamports: u64,
        prediction: Prediction,
        username: &str,
    ) -> Result<PreparedBet, LedgerError> {
        let pdas = self.round_pdas(round_id);
        let bet_pda = self.bet_pda(round_id, &bettor);
        let args = PlaceBetArgs {
            amount: amount_lamports,
            prediction: match prediction {
                Prediction::Death => 0,
                Prediction::Survival => 1,
            },
            username: username.to_string(),
        };
        let ix = Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(pdas.betting_round, false),
                AccountMeta::new(bet_pda, false),
                AccountMeta::new(pdas.escrow, false),
                AccountMeta::new(bettor, true),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: instruction_data("place_bet", Some(&args))?,
        };
        let mut tx = Transaction::new_with_payer(&[ix], Some(&bettor));
        tx.message.recent_blockhash = self.rpc.get_latest_blockhash().await?;
        let wire = bincode::serialize(&tx)?;
        Ok(PreparedBet {
            transaction_base64: base64::engine::general_purpose::STANDARD.encode(wire),
            bet_pda,
        })
    }

    /// Enumerates every bet account of the round: discriminator match at
    /// offset 0, little-endian round id match at offset 40. Accounts that
    /// fail to parse are logged and skipped, they cannot be settled anyway.
    pub async fn scan_bets(&self, round_id: u64) -> Result<Vec<ScannedBet>, LedgerError> {
        let filters = vec![
            RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
                0,
                account_discriminator("BetAccount").to_vec(),
            )),
            RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
                BET_ROUND_ID_OFFSET,
                round_id.to_le_bytes().to_vec(),
            )),
        ];
        let config = RpcProgramAccountsConfig {
            filters: Some(filters),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                ..Default::default()
            },
            ..Default::default()
        };
        let accounts = self
            .rpc
            .get_program_accounts_with_config(&self.program_id, config)
            .await?;
        let mut bets = Vec::with_capacity(accounts.len());
        for (address, account) in accounts {
            match parse_account::<BetAccount>("BetAccount", &account.data) {
                Ok(bet) => bets.push(ScannedBet { address, account: bet }),
                Err(err) => {
                    tracing::warn!(%address, %err, "skipping unparseable bet account");
                }
            }
        }
        Ok(bets)
    }

    /// Pays one winner out of escrow. The program closes the bet account on
    /// success, so a replay fails cleanly on-chain.
    pub async fn claim_payout(
        &self,
        round_id: u64,
        bettor: &Pubkey,
    ) -> Result<Signature, LedgerError> {
        let pdas = self.round_pdas(round_id);
        let ix = Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new_readonly(pdas.betting_round, false),
                AccountMeta::new(self.bet_pda(round_id, bettor), false),
                AccountMeta::new(pdas.escrow, false),
                AccountMeta::new(*bettor, false),
                AccountMeta::new_readonly(self.authority.pubkey(), true),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: instruction_data::<()>("claim_payout", None)?,
        };
        self.send_signed(ix).await
    }

    /// Drains the fee (and the flooring residue) to the treasury.
    pub async fn claim_fees(&self, round_id: u64) -> Result<Signature, LedgerError> {
        let pdas = self.round_pdas(round_id);
        let ix = Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new_readonly(pdas.betting_round, false),
                AccountMeta::new(pdas.escrow, false),
                AccountMeta::new(self.treasury, false),
                AccountMeta::new_readonly(self.authority.pubkey(), true),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data: instruction_data::<()>("claim_fees", None)?,
        };
        self.send_signed(ix).await
    }

    async fn send_signed(&self, ix: Instruction) -> Result<Signature, LedgerError> {
        let blockhash = self.rpc.get_latest_blockhash().await?;
        let tx = Transaction::new_signed_with_payer(
            &[ix],
            Some(&self.authority.pubkey()),
            &[&self.authority],
            blockhash,
        );
        self.rpc
            .send_and_confirm_transaction(&tx)
            .await
            .map_err(classify)
    }
}

/// Maps the program's distinguished retryable error, leaves the rest as-is.
fn classify(err: ClientError) -> LedgerError {
    if let Some(TransactionError::InstructionError(_, InstructionError::Custom(code))) =
        err.get_transaction_error()
        && code == BETTING_STILL_ACTIVE_CODE
    {
        return LedgerError::BettingStillActive;
    }
    // Preflight simulation failures sometimes only carry the code in text.
    if err.to_string().contains("custom program error: 0x1775") {
        return LedgerError::BettingStillActive;
    }
    LedgerError::Rpc(err)
}

pub fn derive_round_pdas(program_id: &Pubkey, round_id: u64) -> RoundAddresses {
    let le = round_id.to_le_bytes();
    let (betting_round, _) = Pubkey::find_program_address(&[b"betting_round", &le], program_id);
    let (escrow, _) = Pubkey::find_program_address(&[b"escrow", &le], program_id);
    RoundAddresses { betting_round, escrow }
}

pub fn derive_bet_pda(program_id: &Pubkey, round_id: u64, bettor: &Pubkey) -> Pubkey {
    let le = round_id.to_le_bytes();
    let (pda, _) = Pubkey::find_program_address(&[b"bet", &le, bettor.as_ref()], program_id);
    pda
}

/// First 8 bytes of `SHA256("account:<Name>")`.
pub fn account_discriminator(name: &str) -> [u8; 8] {
    discriminator("account", name)
}

fn instruction_discriminator(name: &str) -> [u8; 8] {
    discriminator("global", name)
}

fn discriminator(namespace: &str, name: &str) -> [u8; 8] {
    let digest = Sha256::digest(format!("{namespace}:{name}").as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&digest[..8]);
    out
}

fn instruction_data<A: BorshSerialize>(
    name: &str,
    args: Option<&A>,
) -> Result<Vec<u8>, LedgerError> {
    let mut data = instruction_discriminator(name).to_vec();
    if let Some(args) = args {
        args.serialize(&mut data)?;
    }
    Ok(data)
}

/// Strips the discriminator and deserializes the body. Anchor allocates
/// accounts at their maximum size, so trailing zero padding is expected and
/// must not fail the parse.
fn parse_account<T: BorshDeserialize>(
    name: &'static str,
    data: &[u8],
) -> Result<T, LedgerError> {
    if data.len() < 8 {
        return Err(LedgerError::MalformedAccount(name));
    }
    T::deserialize(&mut &data[8..]).map_err(|_| LedgerError::MalformedAccount(name))
}
