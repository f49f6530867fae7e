//! Weighted sentiment aggregation.
//!
//! Aggregation is a pure function of the item set, the bucket and the
//! weighting policy. Items are summed in `(timestamp, source_id)` order, so
//! the same set yields bit-identical rollups regardless of input order.
//! Each rollup keeps per-emotion weighted sums and total weights, which makes
//! [`merge_rollups`] exact.

mod bucket;
mod weighting;

pub use weighting::{sanitize_weight, Weighting, WeightingPolicy};

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::models::{Bucket, Contributor, Emotion, EmotionStat, ScoredItem, SentimentRollup, TopicKey};

/// Contributors kept per emotion.
pub const TOP_CONTRIBUTORS: usize = 3;

fn canonical_order(a: &&ScoredItem, b: &&ScoredItem) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.source_id.cmp(&b.source_id))
}

/// Highest contribution first; ties broken by source id.
fn contributor_order(a: &Contributor, b: &Contributor) -> Ordering {
    b.contribution
        .total_cmp(&a.contribution)
        .then_with(|| a.source_id.cmp(&b.source_id))
}

fn keep_top(mut contributors: Vec<Contributor>) -> Vec<Contributor> {
    contributors.sort_by(contributor_order);
    contributors.truncate(TOP_CONTRIBUTORS);
    contributors
}

/// Fold one group of items into a rollup.
///
/// Items outside `bucket` are skipped. Zero-weight items count toward
/// `item_count` but not toward any denominator. A label the item did not
/// score contributes zero.
pub fn aggregate_group(
    items: &[&ScoredItem],
    bucket: &Bucket,
    key: TopicKey,
    weighting: &dyn Weighting,
) -> SentimentRollup {
    let mut members: Vec<&ScoredItem> = items
        .iter()
        .copied()
        .filter(|item| bucket.contains(item.timestamp))
        .collect();
    members.sort_by(canonical_order);

    let mut rollup = SentimentRollup::empty(*bucket, key);
    rollup.item_count = members.len() as u64;

    let mut sums: BTreeMap<Emotion, f64> = BTreeMap::new();
    let mut total_weight = 0.0f64;
    let mut contributors: BTreeMap<Emotion, Vec<Contributor>> = BTreeMap::new();

    for item in &members {
        let w = sanitize_weight(weighting.weight(item, bucket));
        if w == 0.0 {
            continue;
        }
        total_weight += w;
        for emotion in Emotion::ALL {
            let score = item.scores.get(emotion).unwrap_or(0.0);
            let contribution = w * score;
            *sums.entry(emotion).or_insert(0.0) += contribution;
            if contribution > 0.0 {
                contributors.entry(emotion).or_default().push(Contributor {
                    source_id: item.source_id.clone(),
                    contribution,
                });
            }
        }
    }

    for emotion in Emotion::ALL {
        let sum = sums.get(&emotion).copied().unwrap_or(0.0);
        rollup
            .emotions
            .insert(emotion, EmotionStat::from_totals(sum, total_weight));
    }
    rollup.top_contributors = contributors
        .into_iter()
        .map(|(emotion, list)| (emotion, keep_top(list)))
        .collect();
    rollup
}

/// Aggregate `items` over `bucket`.
///
/// Produces one rollup per `subreddit/topic`, one per `subreddit/all`
/// spanning that subreddit's topics, and the global `all/all` rollup, which
/// is always present even when empty.
pub fn aggregate(
    items: &[ScoredItem],
    bucket: &Bucket,
    weighting: &dyn Weighting,
) -> BTreeMap<TopicKey, SentimentRollup> {
    let in_bucket: Vec<&ScoredItem> = items
        .iter()
        .filter(|item| bucket.contains(item.timestamp))
        .collect();

    let mut groups: BTreeMap<TopicKey, Vec<&ScoredItem>> = BTreeMap::new();
    for item in &in_bucket {
        let key = item.topic_key();
        let subreddit_wide = TopicKey::new(&key.subreddit, TopicKey::ALL);
        if subreddit_wide != key {
            groups.entry(subreddit_wide).or_default().push(item);
        }
        groups.entry(key).or_default().push(item);
    }

    let mut rollups: BTreeMap<TopicKey, SentimentRollup> = groups
        .into_iter()
        .map(|(key, members)| {
            let rollup = aggregate_group(&members, bucket, key.clone(), weighting);
            (key, rollup)
        })
        .collect();

    let global = TopicKey::global();
    let global_rollup = aggregate_group(&in_bucket, bucket, global.clone(), weighting);
    rollups.insert(global, global_rollup);
    rollups
}

/// Combine rollups of disjoint item sets into one rollup for `bucket`.
///
/// `mean = Σ weighted_sum / Σ total_weight` per emotion; unweighted means
/// are never averaged. Top contributors are re-ranked across the parts.
pub fn merge_rollups(parts: &[SentimentRollup], bucket: Bucket, key: TopicKey) -> SentimentRollup {
    let mut merged = SentimentRollup::empty(bucket, key);
    let mut contributors: BTreeMap<Emotion, Vec<Contributor>> = BTreeMap::new();

    for emotion in Emotion::ALL {
        let (sum, weight) = parts
            .iter()
            .filter_map(|p| p.emotions.get(&emotion))
            .fold((0.0, 0.0), |(s, w), stat| {
                (s + stat.weighted_sum, w + stat.total_weight)
            });
        merged
            .emotions
            .insert(emotion, EmotionStat::from_totals(sum, weight));
    }

    for part in parts {
        merged.item_count += part.item_count;
        for (emotion, list) in &part.top_contributors {
            contributors
                .entry(*emotion)
                .or_default()
                .extend(list.iter().cloned());
        }
    }
    merged.top_contributors = contributors
        .into_iter()
        .map(|(emotion, list)| (emotion, keep_top(list)))
        .collect();
    merged
}
