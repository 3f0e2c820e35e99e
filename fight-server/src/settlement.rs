//! Settlement: once the fight is over, winners are paid out of escrow
//! proportionally to their stake and the treasury takes the fee.
//!
//! The payout plan is a pure computation over the authoritative round
//! account and the scanned bets; only the issuing loop talks to the chain.
//! All arithmetic is integer lamports with floor rounding — every flooring
//! remainder deliberately stays in escrow and leaves with `claim_fees`.

use crate::ledger::{BettingRoundAccount, LedgerClient, LedgerError, ScannedBet};
use protocol::{PayoutRecord, PayoutReport, Prediction};
use solana_sdk::pubkey::Pubkey;

/// One winner and the lamports owed to them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedPayout {
    pub wallet: Pubkey,
    pub username: String,
    pub bet_amount: u64,
    pub prize_share: u64,
    pub total_payout: u64,
}

/// The full plan for a round.
#[derive(Clone, Debug)]
pub struct PayoutPlan {
    pub winning_side: Prediction,
    pub total_winner_bets: u64,
    pub total_loser_bets: u64,
    pub fee: u64,
    pub prize_pool: u64,
    pub entries: Vec<PlannedPayout>,
}

/// Computes who gets paid what. Bets already flagged as claimed are skipped,
/// a replayed settlement therefore plans no double payouts.
pub fn plan_payouts(round: &BettingRoundAccount, bets: &[ScannedBet]) -> PayoutPlan {
    let winning_side = if round.boss_defeated { Prediction::Death } else { Prediction::Survival };
    let (total_winner_bets, total_loser_bets) = if round.boss_defeated {
        (round.total_death_bets, round.total_survival_bets)
    } else {
        (round.total_survival_bets, round.total_death_bets)
    };

    let fee = floor_mul_div(total_loser_bets, round.fee_percentage as u64, 100);
    let prize_pool = total_loser_bets - fee;

    let mut entries = Vec::new();
    if total_winner_bets > 0 {
        for bet in bets {
            if bet.account.prediction() != winning_side || bet.account.payout_claimed {
                continue;
            }
            let prize_share = floor_mul_div(prize_pool, bet.account.amount, total_winner_bets);
            entries.push(PlannedPayout {
                wallet: bet.account.bettor_pubkey(),
                username: bet.account.username.clone(),
                bet_amount: bet.account.amount,
                prize_share,
                total_payout: bet.account.amount + prize_share,
            });
        }
    }

    PayoutPlan {
        winning_side,
        total_winner_bets,
        total_loser_bets,
        fee,
        prize_pool,
        entries,
    }
}

/// Runs settlement for a finished round: read the round account, pay every
/// winner, then drain the fee. A failing individual payout is logged and
/// skipped; the remaining winners still get theirs.
pub async fn run(ledger: &LedgerClient, round_id: u64) -> Result<PayoutReport, LedgerError> {
    let round = ledger.read_round(round_id).await?;

    let plan = if winner_pool(&round) == 0 {
        // Nobody to pay, the whole pot is fees.
        plan_payouts(&round, &[])
    } else {
        let bets = ledger.scan_bets(round_id).await?;
        plan_payouts(&round, &bets)
    };

    tracing::info!(
        round_id,
        winning_side = ?plan.winning_side,
        winners = plan.entries.len(),
        fee = plan.fee,
        prize_pool = plan.prize_pool,
        "settling round"
    );

    let mut payouts = Vec::with_capacity(plan.entries.len());
    let mut failed_payouts = 0u32;
    let mut total_paid_lamports = 0u64;
    for entry in &plan.entries {
        match ledger.claim_payout(round_id, &entry.wallet).await {
            Ok(signature) => {
                total_paid_lamports += entry.total_payout;
                payouts.push(PayoutRecord {
                    username: entry.username.clone(),
                    wallet: entry.wallet.to_string(),
                    bet_amount: entry.bet_amount,
                    prize_share: entry.prize_share,
                    total_payout: entry.total_payout,
                    signature: signature.to_string(),
                });
            }
            Err(err) => {
                failed_payouts += 1;
                tracing::error!(round_id, wallet = %entry.wallet, %err, "payout failed, skipping");
            }
        }
    }

    if let Err(err) = ledger.claim_fees(round_id).await {
        tracing::error!(round_id, %err, "fee claim failed");
    }

    Ok(PayoutReport {
        round_id,
        winning_side: plan.winning_side,
        payouts,
        failed_payouts,
        total_paid_lamports,
    })
}

fn winner_pool(round: &BettingRoundAccount) -> u64 {
    if round.boss_defeated { round.total_death_bets } else { round.total_survival_bets }
}

/// `⌊a · b / d⌋` without intermediate overflow.
fn floor_mul_div(a: u64, b: u64, d: u64) -> u64 {
    (a as u128 * b as u128 / d as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BetAccount;

    fn round(boss_defeated: bool, death: u64, survival: u64, fee_pct: u8) -> BettingRoundAccount {
        BettingRoundAccount {
            round_id: 1,
            authority: [1; 32],
            treasury: [2; 32],
            betting_start_time: 0,
            betting_end_time: 60,
            fight_end_time: 120,
            initial_hp: 1000,
            current_hp: if boss_defeated { 0 } else { 500 },
            fee_percentage: fee_pct,
            phase: 2,
            total_death_bets: death,
            total_survival_bets: survival,
            total_bets_count: 0,
            boss_defeated,
            payouts_processed: false,
            escrow_bump: 255,
        }
    }

    fn bet(amount: u64, prediction: u8, claimed: bool) -> ScannedBet {
        ScannedBet {
            address: Pubkey::new_unique(),
            account: BetAccount {
                bettor: Pubkey::new_unique().to_bytes(),
                round_id: 1,
                amount,
                prediction,
                username: "user".to_string(),
                timestamp: 0,
                payout_claimed: claimed,
            },
        }
    }

    #[test]
    fn winning_side_follows_boss_outcome() {
        assert_eq!(plan_payouts(&round(true, 10, 20, 5), &[]).winning_side, Prediction::Death);
        assert_eq!(plan_payouts(&round(false, 10, 20, 5), &[]).winning_side, Prediction::Survival);
    }

    #[test]
    fn no_winners_means_no_entries() {
        let plan = plan_payouts(&round(true, 0, 1_000, 5), &[bet(1_000, 1, false)]);
        assert!(plan.entries.is_empty());
        assert_eq!(plan.fee, 50);
    }

    #[test]
    fn flooring_leaves_residue_in_escrow() {
        // Losers staked 100, fee 5% => pool 95, three equal winners.
        let plan = plan_payouts(
            &round(true, 3, 100, 5),
            &[bet(1, 0, false), bet(1, 0, false), bet(1, 0, false)],
        );
        assert_eq!(plan.fee, 5);
        assert_eq!(plan.prize_pool, 95);
        let shares: Vec<u64> = plan.entries.iter().map(|e| e.prize_share).collect();
        assert_eq!(shares, vec![31, 31, 31]);
        // 95 - 93 = 2 lamports stay behind for claim_fees.
        assert_eq!(plan.prize_pool - shares.iter().sum::<u64>(), 2);
    }

    #[test]
    fn shares_are_proportional_to_stake() {
        let plan = plan_payouts(
            &round(false, 900, 300, 10),
            &[bet(100, 1, false), bet(200, 1, false), bet(300, 0, false)],
        );
        // Loser pool 900, fee 90, prize pool 810 split 1:2.
        assert_eq!(plan.entries.len(), 2);
        assert_eq!(plan.entries[0].prize_share, 270);
        assert_eq!(plan.entries[1].prize_share, 540);
        assert_eq!(plan.entries[0].total_payout, 370);
    }

    #[test]
    fn already_claimed_bets_are_skipped() {
        let plan = plan_payouts(
            &round(true, 200, 100, 5),
            &[bet(100, 0, true), bet(100, 0, false)],
        );
        assert_eq!(plan.entries.len(), 1);
    }

    #[test]
    fn losers_get_nothing() {
        let plan = plan_payouts(&round(true, 100, 100, 5), &[bet(100, 1, false)]);
        assert!(plan.entries.is_empty());
    }

    #[test]
    fn zero_fee_pays_out_the_whole_pool() {
        let plan = plan_payouts(&round(true, 100, 100, 0), &[bet(100, 0, false)]);
        assert_eq!(plan.fee, 0);
        assert_eq!(plan.entries[0].prize_share, 100);
        assert_eq!(plan.entries[0].total_payout, 200);
    }
}
