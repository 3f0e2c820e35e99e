//! All runtime configuration comes from the environment and is read exactly
//! once at boot. Missing required variables abort startup, nothing is
//! re-read later.

use anyhow::{Context, anyhow};
use solana_sdk::pubkey::Pubkey;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Fallback chat endpoint when `CHAT_WS_URL` is not set.
const DEFAULT_CHAT_WS_URL: &str = "wss://livechat.pump.fun/ws";

/// The resolved server configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// The chat room identifier (the coin address on the chat provider).
    pub coin_address: String,
    /// Upstream chat websocket endpoint.
    pub chat_ws_url: String,
    /// Damage trigger keywords, lower-cased.
    pub trigger_keywords: Vec<String>,
    /// Heal keywords, lower-cased.
    pub heal_keywords: Vec<String>,
    /// Boss HP at the start of every round.
    pub initial_hp: u32,
    /// Directory the result exporter writes into.
    pub export_dir: PathBuf,
    /// Ledger RPC endpoint.
    pub solana_rpc_url: String,
    /// File holding the authority secret key as a 64-byte JSON array.
    pub authority_keypair_path: PathBuf,
    /// Fee collection target.
    pub treasury_wallet: Pubkey,
    /// The betting program.
    pub program_id: Pubkey,
    /// Fee taken from the losing pool, in percent.
    pub fee_percentage: u8,
    /// Shared admin secret, checked together with the admin wallet.
    pub admin_secret: String,
    /// Wallet that has to accompany the admin secret.
    pub admin_wallet: String,
    /// Length of the betting window.
    pub betting_duration: Duration,
    /// Length of the fight window.
    pub fight_duration: Duration,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Reads the configuration from an arbitrary variable lookup.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let required = |name: &str| {
            var(name).ok_or_else(|| anyhow!("missing required environment variable {name}"))
        };

        let parse_pubkey = |name: &str| -> anyhow::Result<Pubkey> {
            let raw = required(name)?;
            Pubkey::from_str(raw.trim()).with_context(|| format!("{name} is not a valid address"))
        };

        Ok(Config {
            port: parse_or(&var, "PORT", 3001)?,
            coin_address: required("COIN_ADDRESS")?,
            chat_ws_url: var("CHAT_WS_URL").unwrap_or_else(|| DEFAULT_CHAT_WS_URL.to_string()),
            trigger_keywords: split_keywords(
                &var("TRIGGER_KEYWORDS").unwrap_or_else(|| "hit".to_string()),
            ),
            heal_keywords: split_keywords(&var("HEAL_KEYWORDS").unwrap_or_else(|| "heal".to_string())),
            initial_hp: parse_or(&var, "INITIAL_HP", 1000)?,
            export_dir: PathBuf::from(var("EXPORT_DIR").unwrap_or_else(|| "./exports".to_string())),
            solana_rpc_url: var("SOLANA_RPC_URL")
                .unwrap_or_else(|| "https://api.devnet.solana.com".to_string()),
            authority_keypair_path: PathBuf::from(required("AUTHORITY_KEYPAIR_PATH")?),
            treasury_wallet: parse_pubkey("TREASURY_WALLET")?,
            program_id: parse_pubkey("PROGRAM_ID")?,
            fee_percentage: parse_or(&var, "FEE_PERCENTAGE", 5)?,
            admin_secret: required("ADMIN_SECRET")?,
            admin_wallet: required("ADMIN_WALLET")?,
            betting_duration: Duration::from_secs(parse_or(&var, "BETTING_DURATION_SECS", 60)?),
            fight_duration: Duration::from_secs(parse_or(&var, "FIGHT_DURATION_SECS", 60)?),
        })
    }
}

/// Parses an optional variable, falling back to the given default.
fn parse_or<T: FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> anyhow::Result<T> {
    match var(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{name} has an unparseable value: {raw}")),
    }
}

/// Splits a comma-separated keyword list and lower-cases every entry.
/// Empty fragments are dropped.
fn split_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("COIN_ADDRESS", "So11111111111111111111111111111111111111112"),
            ("AUTHORITY_KEYPAIR_PATH", "/tmp/authority.json"),
            ("TREASURY_WALLET", "So11111111111111111111111111111111111111112"),
            ("PROGRAM_ID", "FtQbMDA7w8a9icfbMkuTxxQ695Wp9e6RQFSGVjmYQgz3"),
            ("ADMIN_SECRET", "sekrit"),
            ("ADMIN_WALLET", "AdminWallet111"),
        ])
    }

    fn lookup(vars: HashMap<&'static str, &'static str>) -> impl Fn(&str) -> Option<String> {
        move |name| vars.get(name).map(|v| v.to_string())
    }

    #[test]
    fn defaults_are_applied() {
        let cfg = Config::from_vars(lookup(base_vars())).unwrap();
        assert_eq!(cfg.port, 3001);
        assert_eq!(cfg.initial_hp, 1000);
        assert_eq!(cfg.fee_percentage, 5);
        assert_eq!(cfg.betting_duration, Duration::from_secs(60));
        assert_eq!(cfg.trigger_keywords, vec!["hit".to_string()]);
    }

    #[test]
    fn missing_treasury_is_fatal() {
        let mut vars = base_vars();
        vars.remove("TREASURY_WALLET");
        let err = Config::from_vars(lookup(vars)).unwrap_err();
        assert!(err.to_string().contains("TREASURY_WALLET"));
    }

    #[test]
    fn keywords_are_split_and_lowercased() {
        let mut vars = base_vars();
        vars.insert("TRIGGER_KEYWORDS", "HIT, Punch ,,kick");
        let cfg = Config::from_vars(lookup(vars)).unwrap();
        assert_eq!(cfg.trigger_keywords, vec!["hit", "punch", "kick"]);
    }

    #[test]
    fn bad_number_is_rejected() {
        let mut vars = base_vars();
        vars.insert("INITIAL_HP", "lots");
        assert!(Config::from_vars(lookup(vars)).is_err());
    }
}
