//! Eviction scoring and victim selection
//!
//! Pure functions over a snapshot of entries; the proxy applies the plan
//! while holding its write lock.
//!
//! Score = `min(access_count, ACCESS_COUNT_CAP) - idle_days`. Lower scores
//! are evicted first, so rarely used and long idle entries go before popular
//! ones. The cap keeps an entry that was popular long ago from outscoring
//! current favourites forever.

use crate::pins::entry_identifier;
use crate::types::{Budget, CacheEntry, Category, Usage};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

pub const ACCESS_COUNT_CAP: u64 = 100;

const MS_PER_DAY: f64 = 86_400_000.0;

pub fn score(entry: &CacheEntry, now: DateTime<Utc>) -> f64 {
    let idle_ms = (now - entry.last_accessed).num_milliseconds().max(0);
    let idle_days = idle_ms as f64 / MS_PER_DAY;
    entry.access_count.min(ACCESS_COUNT_CAP) as f64 - idle_days
}

/// Whether usage after a soundfont write calls for an eviction run
pub fn needs_eviction(budget: &Budget, usage: &Usage) -> bool {
    usage.total > budget.trigger_usage()
        || usage.soundfont > budget.soundfont_limit
        || usage.soundfont_count > budget.entry_trigger()
}

/// How much an eviction run has to free.
///
/// `bytes`/`entries` is the soft target and is only met from entries outside
/// the recent-access grace. `required_bytes`/`required_entries` is the hard
/// floor and may take recently accessed entries too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Goal {
    pub bytes: u64,
    pub entries: usize,
    pub required_bytes: u64,
    pub required_entries: usize,
}

impl Goal {
    /// Bring usage to the budget target and the soundfont category within
    /// its limits. Whatever exceeds a hard limit is required.
    pub fn for_budget(budget: &Budget, usage: &Usage) -> Self {
        let by_total = usage.total.saturating_sub(budget.target_usage());
        let by_category = usage.soundfont.saturating_sub(budget.soundfont_limit);
        let over_total = usage.total.saturating_sub(budget.total_limit);
        let entries = if usage.soundfont_count > budget.entry_trigger() {
            usage.soundfont_count - budget.entry_target()
        } else {
            0
        };

        Self {
            bytes: by_total.max(by_category),
            entries,
            required_bytes: over_total.max(by_category),
            required_entries: usage
                .soundfont_count
                .saturating_sub(budget.max_soundfont_entries),
        }
    }

    /// Room that has to be made, recent entries included
    pub fn room(bytes: u64, entries: usize) -> Self {
        Self {
            bytes,
            entries,
            required_bytes: bytes,
            required_entries: entries,
        }
    }

    fn met(&self, freed: u64, removed: usize) -> bool {
        freed >= self.bytes && removed >= self.entries
    }

    fn required_met(&self, freed: u64, removed: usize) -> bool {
        freed >= self.required_bytes && removed >= self.required_entries
    }
}

/// What keeps an entry out of the candidate list
pub struct Exemptions<'a> {
    pub essential_keys: &'a [String],
    /// Pinned identifiers; an entry matching one is protected whatever its
    /// flag says
    pub pinned: &'a [String],
    /// Entry being written by the run's caller
    pub spare_url: Option<&'a str>,
    pub recent_access_grace: Duration,
    pub now: DateTime<Utc>,
}

impl Exemptions<'_> {
    fn is_protected(&self, entry: &CacheEntry, identifier: Option<&str>) -> bool {
        entry.protected || identifier.is_some_and(|id| self.pinned.iter().any(|p| p == id))
    }

    fn is_essential(&self, identifier: Option<&str>) -> bool {
        identifier.is_some_and(|id| self.essential_keys.iter().any(|k| k == id))
    }

    fn is_recent(&self, entry: &CacheEntry) -> bool {
        self.now - entry.last_accessed < self.recent_access_grace
    }
}

/// Victims chosen for a goal, lowest score first
#[derive(Debug, Default)]
pub struct EvictionPlan {
    pub victims: Vec<CacheEntry>,
    pub planned_bytes: u64,
    pub skipped_protected: usize,
    pub skipped_essential: usize,
    pub skipped_recent: usize,
}

impl EvictionPlan {
    fn take(&mut self, entry: &CacheEntry) {
        self.planned_bytes += entry.size_bytes;
        self.victims.push(entry.clone());
    }
}

pub fn plan(entries: &[CacheEntry], goal: Goal, exemptions: &Exemptions<'_>) -> EvictionPlan {
    let mut result = EvictionPlan::default();
    let mut candidates: Vec<(f64, &CacheEntry)> = Vec::new();
    let mut recent: Vec<(f64, &CacheEntry)> = Vec::new();

    for entry in entries.iter().filter(|e| e.category == Category::Soundfont) {
        let identifier = entry_identifier(entry);
        if exemptions.is_protected(entry, identifier.as_deref()) {
            result.skipped_protected += 1;
        } else if exemptions.is_essential(identifier.as_deref()) {
            result.skipped_essential += 1;
        } else if exemptions.spare_url == Some(entry.url.as_str()) {
            result.skipped_recent += 1;
        } else if exemptions.is_recent(entry) {
            recent.push((score(entry, exemptions.now), entry));
        } else {
            candidates.push((score(entry, exemptions.now), entry));
        }
    }

    candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
    recent.sort_by(|a, b| a.0.total_cmp(&b.0));

    for (_, entry) in candidates {
        if goal.met(result.planned_bytes, result.victims.len()) {
            break;
        }
        result.take(entry);
    }

    let mut recent = recent.into_iter();
    for (_, entry) in recent.by_ref() {
        if goal.required_met(result.planned_bytes, result.victims.len()) {
            result.skipped_recent += 1;
            break;
        }
        result.take(entry);
    }
    result.skipped_recent += recent.count();

    result
}

/// Outcome of one eviction run
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvictionReport {
    pub evicted: Vec<String>,
    pub freed_bytes: u64,
    pub usage_before: u64,
    pub usage_after: u64,
    pub target: u64,
    pub retained_protected: usize,
    pub retained_essential: usize,
    pub retained_recent: usize,
    /// Usage is still above the target after the run
    pub overshoot: bool,
    /// Usage is still above the total limit after the run
    pub over_limit: bool,
}
