//! Writes the per-round result files: a JSON document with the full results
//! structure and a `username,hits` CSV. Failures are the caller's to log;
//! nothing in here touches game state.

use anyhow::Context;
use protocol::FightResults;
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Writes both export files and returns their paths.
pub async fn write_results(dir: &Path, results: &FightResults) -> anyhow::Result<(PathBuf, PathBuf)> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating export directory {}", dir.display()))?;

    let base = format!(
        "bossfight_{}_{}_{}",
        results.coin,
        results.round_id,
        chrono::Utc::now().timestamp_millis()
    );

    let json_path = dir.join(format!("{base}.json"));
    let json = serde_json::to_string_pretty(results).context("serializing results")?;
    fs::write(&json_path, json)
        .await
        .with_context(|| format!("writing {}", json_path.display()))?;

    let csv_path = dir.join(format!("{base}.csv"));
    let mut csv = String::from("username,hits\n");
    for row in &results.user_hits {
        csv.push_str(&format!("{},{}\n", csv_field(&row.username), row.hits));
    }
    fs::write(&csv_path, csv)
        .await
        .with_context(|| format!("writing {}", csv_path.display()))?;

    tracing::info!(
        round_id = results.round_id,
        json = %json_path.display(),
        csv = %csv_path.display(),
        "round results exported"
    );
    Ok((json_path, csv_path))
}

/// Quotes a CSV field when it contains a separator, quote or line break.
fn csv_field(raw: &str) -> Cow<'_, str> {
    if raw.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", raw.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::TopHitter;

    fn results() -> FightResults {
        FightResults {
            round_id: 77,
            coin: "coin".to_string(),
            boss_defeated: true,
            final_hp: 0,
            max_hp: 3,
            total_hits: 3,
            user_hits: vec![
                TopHitter { username: "alice".to_string(), hits: 2 },
                TopHitter { username: "a,b\"c".to_string(), hits: 1 },
            ],
            last_hitter: Some("alice".to_string()),
            chronological: Vec::new(),
            total_death_bets: 0,
            total_survival_bets: 0,
            ended_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn plain_fields_stay_unquoted() {
        assert_eq!(csv_field("alice"), "alice");
    }

    #[test]
    fn separators_and_quotes_get_escaped() {
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[tokio::test]
    async fn exports_both_files() {
        let dir = std::env::temp_dir().join(format!("bossfight-export-{}", std::process::id()));
        let (json_path, csv_path) = write_results(&dir, &results()).await.unwrap();

        let json = fs::read_to_string(&json_path).await.unwrap();
        assert!(json.contains("\"bossDefeated\": true"));
        assert!(json_path.file_name().unwrap().to_str().unwrap().starts_with("bossfight_coin_77_"));

        let csv = fs::read_to_string(&csv_path).await.unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("username,hits"));
        assert_eq!(lines.next(), Some("alice,2"));
        assert_eq!(lines.next(), Some("\"a,b\"\"c\",1"));

        let _ = fs::remove_dir_all(&dir).await;
    }
}
