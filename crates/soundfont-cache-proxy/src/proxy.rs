//! Request handling: classification, per-category cache policy and budget
//! enforcement
//!
//! Writes and the evictions they trigger run under one lock, so a write is
//! only acknowledged once usage is back under control.

use crate::error::{ProxyError, Result};
use crate::eviction::{self, EvictionReport, Exemptions, Goal};
use crate::pins::{url_identifier, PinSet};
use crate::store::{ProxyStore, StoreRequest};
use crate::types::{CacheStats, Category, ProxyConfig};
use crate::upstream::UpstreamFetcher;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Where a response came from, reported in the `X-Cache` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Upstream failed; served from cache
    Stale,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Stale => "STALE",
        }
    }
}

/// Install/activate lifecycle of a proxy instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Installing,
    /// Critical assets are precached; waiting to take over
    Waiting,
    Active,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Installing => "installing",
            Lifecycle::Waiting => "waiting",
            Lifecycle::Active => "active",
        }
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    pub data: Vec<u8>,
    pub content_type: String,
    pub category: Category,
    pub status: CacheStatus,
}

pub struct CacheProxy {
    config: ProxyConfig,
    store: ProxyStore,
    pins: PinSet,
    upstream: UpstreamFetcher,
    write_lock: Mutex<()>,
    lifecycle: RwLock<Lifecycle>,
}

impl CacheProxy {
    pub async fn open(config: ProxyConfig, upstream: UpstreamFetcher) -> Result<Self> {
        let store = ProxyStore::open(config.cache_dir.clone()).await?;
        let pins = PinSet::load(config.cache_dir.join("pins.json")).await;

        Ok(Self {
            config,
            store,
            pins,
            upstream,
            write_lock: Mutex::new(()),
            lifecycle: RwLock::new(Lifecycle::Installing),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn store(&self) -> &ProxyStore {
        &self.store
    }

    pub fn pins(&self) -> &PinSet {
        &self.pins
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    pub async fn stats(&self) -> CacheStats {
        self.store.stats().await
    }

    /// Names of the category stores, tagged with the proxy version
    pub fn cache_names(&self) -> Vec<String> {
        Category::ALL
            .iter()
            .map(|c| format!("soundfont-proxy-{}-v{}", c.as_str(), VERSION))
            .collect()
    }

    pub fn classify(&self, url: &str, hint: Option<&str>) -> Category {
        if self.config.critical_urls.iter().any(|u| u == url) {
            return Category::Critical;
        }
        if hint == Some(Category::Soundfont.as_str()) {
            return Category::Soundfont;
        }

        let path = Url::parse(url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| url.to_string());
        if self
            .config
            .soundfont_patterns
            .iter()
            .any(|p| path.contains(p.as_str()))
        {
            Category::Soundfont
        } else {
            Category::Generic
        }
    }

    pub async fn fetch(
        &self,
        url: &str,
        key: Option<&str>,
        hint: Option<&str>,
    ) -> Result<FetchOutcome> {
        let category = self.classify(url, hint);
        debug!(url, category = category.as_str(), "Handling fetch");

        match category {
            Category::Critical | Category::Soundfont => self.cache_first(url, key, category).await,
            Category::Generic => self.network_first(url).await,
        }
    }

    async fn cache_first(
        &self,
        url: &str,
        key: Option<&str>,
        category: Category,
    ) -> Result<FetchOutcome> {
        if let Some((data, entry)) = self.store.get(url).await {
            return Ok(FetchOutcome {
                data,
                content_type: entry.content_type,
                category,
                status: CacheStatus::Hit,
            });
        }

        // A missing critical asset gets this one refetch and no more
        let (data, content_type) = self.upstream.fetch(url).await.inspect_err(|e| {
            if category == Category::Critical {
                warn!(url, error = %e, "Critical asset refetch failed");
            }
        })?;

        self.store_best_effort(url, key, category, &content_type, &data)
            .await;

        Ok(FetchOutcome {
            data,
            content_type,
            category,
            status: CacheStatus::Miss,
        })
    }

    async fn network_first(&self, url: &str) -> Result<FetchOutcome> {
        match self.upstream.fetch(url).await {
            Ok((data, content_type)) => {
                self.store_best_effort(url, None, Category::Generic, &content_type, &data)
                    .await;
                Ok(FetchOutcome {
                    data,
                    content_type,
                    category: Category::Generic,
                    status: CacheStatus::Miss,
                })
            }
            Err(e) => match self.store.get(url).await {
                Some((data, entry)) => {
                    warn!(url, error = %e, "Upstream failed, serving cached copy");
                    Ok(FetchOutcome {
                        data,
                        content_type: entry.content_type,
                        category: Category::Generic,
                        status: CacheStatus::Stale,
                    })
                }
                None => Err(e),
            },
        }
    }

    /// A rejected write is logged; the response is still served
    async fn store_best_effort(
        &self,
        url: &str,
        key: Option<&str>,
        category: Category,
        content_type: &str,
        data: &[u8],
    ) {
        if let Err(e) = self.write(url, key, category, content_type, data).await {
            warn!(url, category = category.as_str(), error = %e, "Response not cached");
        }
    }

    /// Store a response within the budget. Soundfont writes evict to make
    /// room, and run a full eviction afterwards when usage crosses the
    /// trigger thresholds.
    pub async fn write(
        &self,
        url: &str,
        key: Option<&str>,
        category: Category,
        content_type: &str,
        data: &[u8],
    ) -> Result<Option<EvictionReport>> {
        let _guard = self.write_lock.lock().await;
        let budget = &self.config.budget;
        let size = data.len() as u64;

        // The entry being replaced is spared by eviction, so its size stays freed
        let replaced = self.store.entry(url).await;
        let replaces_same_category = replaced.as_ref().is_some_and(|e| e.category == category);
        let replaced_total = replaced.as_ref().map_or(0, |e| e.size_bytes);
        let replaced_same = if replaces_same_category {
            replaced_total
        } else {
            0
        };

        let mut usage = self.store.usage().await;
        match category {
            Category::Critical => {
                let critical_available = budget
                    .critical_limit
                    .saturating_sub(usage.critical - replaced_same);
                if size > critical_available {
                    return Err(ProxyError::QuotaExceeded {
                        size,
                        available: critical_available,
                    });
                }
            }
            Category::Soundfont => {
                if size > budget.soundfont_limit {
                    return Err(ProxyError::QuotaExceeded {
                        size,
                        available: budget.soundfont_limit,
                    });
                }

                let over_total = (usage.total - replaced_total + size)
                    .saturating_sub(budget.total_limit);
                let over_category = (usage.soundfont - replaced_same + size)
                    .saturating_sub(budget.soundfont_limit);
                let extra_entry = usize::from(!replaces_same_category);
                let over_count = (usage.soundfont_count + extra_entry)
                    .saturating_sub(budget.max_soundfont_entries);

                if over_total > 0 || over_category > 0 || over_count > 0 {
                    let room = Goal::room(over_total.max(over_category), over_count);
                    self.evict_locked(room, Some(url)).await;
                    usage = self.store.usage().await;
                }

                let category_available = budget
                    .soundfont_limit
                    .saturating_sub(usage.soundfont - replaced_same);
                if size > category_available {
                    return Err(ProxyError::QuotaExceeded {
                        size,
                        available: category_available,
                    });
                }
            }
            Category::Generic => {}
        }

        let available = budget
            .total_limit
            .saturating_sub(usage.total - replaced_total);
        if size > available {
            return Err(ProxyError::QuotaExceeded { size, available });
        }

        let identifier = key.map(str::to_string).or_else(|| url_identifier(url));
        let protected = match (category, identifier) {
            (Category::Soundfont, Some(id)) => self.pins.contains(&id).await,
            _ => false,
        };

        self.store
            .put(
                StoreRequest {
                    url,
                    resource_key: key,
                    category,
                    content_type,
                    protected,
                },
                data,
            )
            .await?;

        if category != Category::Soundfont {
            return Ok(None);
        }
        let usage = self.store.usage().await;
        if !eviction::needs_eviction(budget, &usage) {
            return Ok(None);
        }
        let report = self
            .evict_locked(Goal::for_budget(budget, &usage), Some(url))
            .await;
        Ok(Some(report))
    }

    /// Run eviction on demand. `required_space` is freed even if recently
    /// used entries have to go; without it usage is brought down to the
    /// budget target.
    pub async fn cleanup(&self, required_space: Option<u64>) -> EvictionReport {
        let _guard = self.write_lock.lock().await;
        let goal = match required_space {
            Some(bytes) => Goal::room(bytes, 0),
            None => Goal::for_budget(&self.config.budget, &self.store.usage().await),
        };
        self.evict_locked(goal, None).await
    }

    /// Caller must hold `write_lock`
    async fn evict_locked(&self, goal: Goal, spare_url: Option<&str>) -> EvictionReport {
        let entries = self.store.snapshot().await;
        let pinned = self.pins.list().await;
        let usage_before: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let exemptions = Exemptions {
            essential_keys: &self.config.essential_keys,
            pinned: &pinned,
            spare_url,
            recent_access_grace: chrono::Duration::from_std(self.config.recent_access_grace)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            now: Utc::now(),
        };
        let plan = eviction::plan(&entries, goal, &exemptions);

        let mut report = EvictionReport {
            usage_before,
            target: usage_before.saturating_sub(goal.bytes),
            retained_protected: plan.skipped_protected,
            retained_essential: plan.skipped_essential,
            retained_recent: plan.skipped_recent,
            ..Default::default()
        };

        for victim in plan.victims {
            if let Some(removed) = self.store.remove(&victim.url).await {
                debug!(url = %removed.url, size = removed.size_bytes, "Evicted soundfont");
                report.freed_bytes += removed.size_bytes;
                report.evicted.push(removed.url);
            }
        }
        if !report.evicted.is_empty() {
            if let Err(e) = self.store.persist().await {
                warn!(error = %e, "Failed to persist index after eviction");
            }
        }

        report.usage_after = self.store.usage().await.total;
        report.overshoot = report.usage_after > report.target;
        report.over_limit = report.usage_after > self.config.budget.total_limit;

        if report.overshoot {
            warn!(
                usage = report.usage_after,
                target = report.target,
                protected = report.retained_protected,
                essential = report.retained_essential,
                recent = report.retained_recent,
                over_limit = report.over_limit,
                "Eviction fell short of target; remaining entries are protected, essential or in use"
            );
        }
        info!(
            evicted = report.evicted.len(),
            freed = report.freed_bytes,
            usage = report.usage_after,
            "Eviction complete"
        );
        report
    }

    /// Pin an identifier; returns how many cached entries were flagged
    pub async fn protect(&self, identifier: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.pins.protect(identifier).await?;
        let flagged = self.store.set_protected(identifier, true).await?;
        info!(identifier, flagged, "Protected favorite");
        Ok(flagged)
    }

    pub async fn unprotect(&self, identifier: &str) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        self.pins.unprotect(identifier).await?;
        let cleared = self.store.set_protected(identifier, false).await?;
        info!(identifier, cleared, "Unprotected favorite");
        Ok(cleared)
    }

    /// Drop one cached response, e.g. a body the client could not decode.
    /// Returns false if nothing was cached for `url`.
    pub async fn invalidate(&self, url: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(removed) = self.store.remove(url).await else {
            return Ok(false);
        };
        self.store.persist().await?;
        info!(url, category = removed.category.as_str(), "Entry invalidated");
        Ok(true)
    }

    /// Persist access data recorded by reads since the last index write
    pub async fn flush(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        self.store.flush_access().await
    }

    /// Drop every non-critical entry
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let removed = self.store.clear_except(Category::Critical).await?;
        info!(removed, "Cache cleared");
        Ok(removed)
    }

    /// Precache the configured critical assets; returns how many are cached
    pub async fn precache_critical(&self) -> usize {
        let mut cached = 0;
        for url in &self.config.critical_urls {
            if self.store.entry(url).await.is_some() {
                cached += 1;
                continue;
            }

            let result = match self.upstream.fetch(url).await {
                Ok((data, content_type)) => self
                    .write(url, None, Category::Critical, &content_type, &data)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => cached += 1,
                Err(e) => warn!(url = %url, error = %e, "Failed to precache critical asset"),
            }
        }
        cached
    }

    /// Precache critical assets and move to `Waiting`
    pub async fn install(&self) -> usize {
        *self.lifecycle.write().await = Lifecycle::Installing;
        let cached = self.precache_critical().await;
        *self.lifecycle.write().await = Lifecycle::Waiting;
        info!(
            cached,
            configured = self.config.critical_urls.len(),
            "Proxy installed"
        );
        cached
    }

    /// Take over: drop critical entries no longer configured and move to
    /// `Active`. Returns how many stale entries were dropped.
    pub async fn activate(&self) -> Result<usize> {
        let stale = self.stale_critical().await;

        {
            let _guard = self.write_lock.lock().await;
            for url in &stale {
                self.store.remove(url).await;
            }
            if !stale.is_empty() {
                self.store.persist().await?;
            }
        }

        *self.lifecycle.write().await = Lifecycle::Active;
        info!(version = VERSION, dropped = stale.len(), "Proxy active");
        Ok(stale.len())
    }

    /// Install, then activate unless critical assets of an earlier
    /// configuration are still cached. Those keep the proxy waiting until
    /// `SKIP_WAITING`.
    pub async fn start(&self) -> Result<Lifecycle> {
        self.install().await;
        let stale = self.stale_critical().await;
        if stale.is_empty() {
            self.activate().await?;
        } else {
            info!(
                stale = stale.len(),
                "Earlier critical assets cached, waiting for SKIP_WAITING"
            );
        }
        Ok(self.lifecycle().await)
    }

    /// Cached critical entries no longer in the configured list
    async fn stale_critical(&self) -> Vec<String> {
        self.store
            .snapshot()
            .await
            .into_iter()
            .filter(|e| e.category == Category::Critical)
            .filter(|e| !self.config.critical_urls.contains(&e.url))
            .map(|e| e.url)
            .collect()
    }

    /// Activate now if waiting; true once the proxy is active
    pub async fn skip_waiting(&self) -> Result<bool> {
        if self.lifecycle().await == Lifecycle::Waiting {
            self.activate().await?;
        }
        Ok(self.lifecycle().await == Lifecycle::Active)
    }
}
