//! Anonymous, in-memory vent analytics.
//!
//! Only derived facts are kept (emotion category, word count, latency,
//! outcome), bucketed per UTC day. Vent text is inspected once for emotion
//! keywords and never stored.

use crate::vent::{Outcome, VentMode};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Timelike, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

pub const DEFAULT_PERIOD_DAYS: u32 = 30;
pub const MAX_PERIOD_DAYS: u32 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Sadness,
    Anxiety,
    Anger,
    Loneliness,
    Stress,
    Grief,
    Confusion,
    Hopelessness,
    Frustration,
    Fear,
    Other,
}

impl Emotion {
    pub fn as_str(self) -> &'static str {
        match self {
            Emotion::Sadness => "sadness",
            Emotion::Anxiety => "anxiety",
            Emotion::Anger => "anger",
            Emotion::Loneliness => "loneliness",
            Emotion::Stress => "stress",
            Emotion::Grief => "grief",
            Emotion::Confusion => "confusion",
            Emotion::Hopelessness => "hopelessness",
            Emotion::Frustration => "frustration",
            Emotion::Fear => "fear",
            Emotion::Other => "other",
        }
    }
}

/// Keyword table; on equal scores the earlier category wins.
const EMOTION_KEYWORDS: &[(Emotion, &[&str])] = &[
    (
        Emotion::Sadness,
        &["sad", "depressed", "crying", "tears", "heartbroken", "miserable", "unhappy"],
    ),
    (
        Emotion::Anxiety,
        &["anxious", "worried", "panic", "nervous", "scared", "fear", "terrified"],
    ),
    (
        Emotion::Anger,
        &["angry", "furious", "mad", "rage", "hate", "pissed", "frustrated"],
    ),
    (
        Emotion::Loneliness,
        &["lonely", "alone", "isolated", "nobody", "no one", "abandoned"],
    ),
    (
        Emotion::Stress,
        &["stressed", "overwhelmed", "pressure", "exhausted", "burnout", "tired"],
    ),
    (
        Emotion::Grief,
        &["grief", "loss", "died", "death", "mourning", "miss them", "passed away"],
    ),
    (
        Emotion::Confusion,
        &["confused", "lost", "don't know", "uncertain", "unsure", "what to do"],
    ),
    (
        Emotion::Hopelessness,
        &["hopeless", "pointless", "give up", "no point", "never", "can't anymore"],
    ),
    (
        Emotion::Frustration,
        &["frustrated", "stuck", "nothing works", "tried everything", "unfair"],
    ),
    (
        Emotion::Fear,
        &["afraid", "terrified", "scared", "fear", "nightmare", "dread"],
    ),
];

/// Keyword-based emotion guess. Intensity is `0.3 + 0.15 * matches`, capped
/// at 1.0; no match yields `(Other, 0.5)`.
pub fn detect_emotion(content: &str) -> (Emotion, f64) {
    let lower = content.to_lowercase();
    let mut best: Option<(Emotion, usize)> = None;

    for (emotion, keywords) in EMOTION_KEYWORDS {
        let score = keywords.iter().filter(|kw| lower.contains(*kw)).count();
        if score > 0 && best.map_or(true, |(_, top)| score > top) {
            best = Some((*emotion, score));
        }
    }

    match best {
        Some((emotion, score)) => (emotion, (0.3 + score as f64 * 0.15).min(1.0)),
        None => (Emotion::Other, 0.5),
    }
}

/// Facts recorded for one finished vent.
#[derive(Debug, Clone)]
pub struct VentRecord {
    pub at: DateTime<Utc>,
    /// Rate-limit key of the caller; only used for distinct counts.
    pub identity_key: String,
    pub mode: VentMode,
    pub word_count: usize,
    pub emotion: Emotion,
    pub intensity: f64,
    pub latency_ms: u64,
    pub tokens: usize,
    pub pii_detected: bool,
    pub continued_conversation: bool,
    pub outcome: Outcome,
}

#[derive(Debug, Default)]
struct DayBucket {
    vents: u64,
    word_count_sum: u64,
    latency_ms_sum: u64,
    intensity_sum: f64,
    pii_detected: u64,
    continued: u64,
    emotions: BTreeMap<Emotion, u64>,
    modes: BTreeMap<&'static str, u64>,
    outcomes: BTreeMap<&'static str, u64>,
    hours: [u64; 24],
    identities: HashSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateStats {
    pub period_days: u32,
    pub total_vents: u64,
    pub unique_users: u64,
    pub avg_word_count: f64,
    pub avg_response_latency_ms: f64,
    pub avg_emotion_intensity: f64,
    pub emotion_distribution: BTreeMap<String, u64>,
    pub mode_distribution: BTreeMap<String, u64>,
    pub outcome_distribution: BTreeMap<String, u64>,
    pub hour_distribution: BTreeMap<String, u64>,
    pub pii_detected_vents: u64,
    pub continued_conversations: u64,
}

/// Per-day aggregates for the last [`MAX_PERIOD_DAYS`] days.
#[derive(Debug, Default)]
pub struct Analytics {
    days: Mutex<BTreeMap<NaiveDate, DayBucket>>,
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: VentRecord) {
        let date = record.at.date_naive();
        let mut days = self.days.lock();

        let bucket = days.entry(date).or_default();
        bucket.vents += 1;
        bucket.word_count_sum += record.word_count as u64;
        bucket.latency_ms_sum += record.latency_ms;
        bucket.intensity_sum += record.intensity;
        bucket.pii_detected += u64::from(record.pii_detected);
        bucket.continued += u64::from(record.continued_conversation);
        *bucket.emotions.entry(record.emotion).or_default() += 1;
        *bucket.modes.entry(record.mode.as_str()).or_default() += 1;
        *bucket.outcomes.entry(record.outcome.as_str()).or_default() += 1;
        bucket.hours[record.at.hour() as usize] += 1;
        bucket.identities.insert(record.identity_key);

        let oldest = date - ChronoDuration::days(i64::from(MAX_PERIOD_DAYS));
        days.retain(|day, _| *day > oldest);
    }

    /// Aggregates over the last `days` days (clamped to 1..=365), today included.
    pub fn aggregate(&self, days: u32) -> AggregateStats {
        self.aggregate_at(days, Utc::now())
    }

    pub fn aggregate_at(&self, days: u32, now: DateTime<Utc>) -> AggregateStats {
        let period_days = days.clamp(1, MAX_PERIOD_DAYS);
        let today = now.date_naive();
        let first = today - ChronoDuration::days(i64::from(period_days - 1));

        let map = self.days.lock();
        let mut total = DayBucket::default();
        let mut identities: HashSet<&str> = HashSet::new();

        for (_, bucket) in map.range(first..=today) {
            total.vents += bucket.vents;
            total.word_count_sum += bucket.word_count_sum;
            total.latency_ms_sum += bucket.latency_ms_sum;
            total.intensity_sum += bucket.intensity_sum;
            total.pii_detected += bucket.pii_detected;
            total.continued += bucket.continued;
            for (emotion, count) in &bucket.emotions {
                *total.emotions.entry(*emotion).or_default() += count;
            }
            for (mode, count) in &bucket.modes {
                *total.modes.entry(*mode).or_default() += count;
            }
            for (outcome, count) in &bucket.outcomes {
                *total.outcomes.entry(*outcome).or_default() += count;
            }
            for (hour, count) in bucket.hours.iter().enumerate() {
                total.hours[hour] += count;
            }
            identities.extend(bucket.identities.iter().map(String::as_str));
        }

        let avg = |sum: f64| {
            if total.vents == 0 {
                0.0
            } else {
                sum / total.vents as f64
            }
        };

        AggregateStats {
            period_days,
            total_vents: total.vents,
            unique_users: identities.len() as u64,
            avg_word_count: round_to(avg(total.word_count_sum as f64), 1),
            avg_response_latency_ms: round_to(avg(total.latency_ms_sum as f64), 0),
            avg_emotion_intensity: round_to(avg(total.intensity_sum), 2),
            emotion_distribution: total
                .emotions
                .iter()
                .map(|(e, c)| (e.as_str().to_string(), *c))
                .collect(),
            mode_distribution: total
                .modes
                .iter()
                .map(|(m, c)| ((*m).to_string(), *c))
                .collect(),
            outcome_distribution: total
                .outcomes
                .iter()
                .map(|(o, c)| ((*o).to_string(), *c))
                .collect(),
            hour_distribution: total
                .hours
                .iter()
                .enumerate()
                .filter(|(_, c)| **c > 0)
                .map(|(h, c)| (h.to_string(), *c))
                .collect(),
            pii_detected_vents: total.pii_detected,
            continued_conversations: total.continued,
        }
    }
}
