//! Rollup refresh command.

use chrono::{Duration, NaiveDate};
use console::style;

use crate::config::Settings;

use super::super::helpers::open_pipeline;

/// Recompute the current snapshot and the buckets containing now, plus
/// every day since `since` when given.
pub async fn cmd_rollup(settings: &Settings, since: Option<&str>) -> anyhow::Result<()> {
    let pipeline = open_pipeline(settings).await?;
    let now = pipeline.now();

    let mut touched = Vec::new();
    if let Some(since) = since {
        let date = NaiveDate::parse_from_str(since, "%Y-%m-%d")
            .map_err(|e| anyhow::anyhow!("Invalid --since date '{}': {}", since, e))?;
        let mut day = date
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc())
            .ok_or_else(|| anyhow::anyhow!("Invalid --since date '{}'", since))?;
        while day < now {
            touched.push(day);
            day += Duration::days(1);
        }
    }

    let report = pipeline.refresh(&touched).await?;
    println!(
        "{} Refreshed {} bucket(s), {} rollups; current snapshot has {} keys",
        style("✓").green(),
        report.buckets,
        report.rollups_written,
        report.current_keys
    );
    Ok(())
}
