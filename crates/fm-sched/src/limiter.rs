//! Provider picking under rolling rate windows.
//!
//! Authed providers carry per-provider usage counters over a 5-hour and a
//! weekly rolling window. Given a desired tier the picker walks the
//! downgrade chain first, then upward, and returns the first provider with
//! budget in both windows. Free-tier providers always have budget.

use chrono::{DateTime, Duration, Utc};
use fm_core::config::{ProviderConfig, RateConfig};
use fm_core::store::{Store, StoreResult};
use fm_core::types::{Role, Tier};
use tracing::debug;

pub const WINDOW_5H: i64 = 5;
pub const WINDOW_WEEK_DAYS: i64 = 7;

/// Providers whose mean quality for a role drops below this (with enough
/// samples) are disqualified for that role.
pub const QUALITY_FLOOR: f64 = 0.2;
const QUALITY_MIN_SAMPLES: u64 = 5;

pub struct ProviderPicker {
    providers: Vec<ProviderConfig>,
    rate: RateConfig,
}

impl ProviderPicker {
    pub fn new(providers: Vec<ProviderConfig>, rate: RateConfig) -> Self {
        Self { providers, rate }
    }

    /// First provider with budget along the tier walk, or `None` when every
    /// candidate is exhausted — the bead is deferred, no state changes.
    pub async fn pick(
        &self,
        store: &Store,
        desired: Tier,
        role: Role,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ProviderConfig>> {
        for tier in desired.walk() {
            for provider in self.providers.iter().filter(|p| p.tier == tier) {
                if self.disqualified(store, provider, role, now).await? {
                    debug!(
                        provider = %provider.name,
                        role = %role,
                        "provider disqualified by quality signals"
                    );
                    continue;
                }
                if self.has_budget(store, provider, now).await? {
                    if provider.tier != desired {
                        debug!(
                            provider = %provider.name,
                            desired = %desired,
                            walked_to = %provider.tier,
                            "tier walk rerouted dispatch"
                        );
                    }
                    return Ok(Some(provider.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn disqualified(
        &self,
        store: &Store,
        provider: &ProviderConfig,
        role: Role,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        // Quality is keyed by model, the identity the dispatch rows carry.
        let since = now - Duration::days(WINDOW_WEEK_DAYS);
        let samples = store.quality_samples_since(&provider.model, role, since).await?;
        if samples < QUALITY_MIN_SAMPLES {
            return Ok(false);
        }
        let mean = store
            .mean_quality_since(&provider.model, role, since)
            .await?
            .unwrap_or(1.0);
        Ok(mean < QUALITY_FLOOR)
    }

    async fn has_budget(
        &self,
        store: &Store,
        provider: &ProviderConfig,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if !provider.authed {
            return Ok(true);
        }
        let purge_before = now - Duration::days(WINDOW_WEEK_DAYS);
        let in_5h = store
            .authed_count_since(&provider.name, now - Duration::hours(WINDOW_5H), purge_before)
            .await?;
        if in_5h >= self.rate.window_5h_cap {
            return Ok(false);
        }
        let in_week = store
            .authed_count_since(&provider.name, purge_before, purge_before)
            .await?;
        Ok(in_week < self.rate.weekly_cap)
    }

    /// Authed usage across all providers as a percentage of the weekly cap.
    pub async fn weekly_usage_pct(&self, store: &Store, now: DateTime<Utc>) -> StoreResult<f64> {
        if self.rate.weekly_cap == 0 {
            return Ok(100.0);
        }
        let used = store
            .authed_total_since(now - Duration::days(WINDOW_WEEK_DAYS))
            .await?;
        Ok(used as f64 / self.rate.weekly_cap as f64 * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn provider(name: &str, tier: Tier, authed: bool) -> ProviderConfig {
        ProviderConfig {
            name: name.into(),
            model: format!("{name}-model"),
            tier,
            authed,
            thinking_level: "medium".into(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    async fn exhaust(store: &Store, provider: &str, n: u64) {
        for i in 0..n {
            store
                .record_authed_dispatch(provider, "p1-coder", &format!("b-{i}"), t0())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn picks_desired_tier_when_budget_remains() {
        let store = Store::new_in_memory().await.unwrap();
        let picker = ProviderPicker::new(
            vec![
                provider("fastp", Tier::Fast, true),
                provider("balp", Tier::Balanced, true),
            ],
            RateConfig::default(),
        );
        let got = picker.pick(&store, Tier::Balanced, Role::Coder, t0()).await.unwrap().unwrap();
        assert_eq!(got.name, "balp");
    }

    #[tokio::test]
    async fn walks_down_to_free_tier_when_authed_exhausted() {
        let store = Store::new_in_memory().await.unwrap();
        let rate = RateConfig {
            window_5h_cap: 2,
            weekly_cap: 2,
        };
        let picker = ProviderPicker::new(
            vec![
                provider("balp", Tier::Balanced, true),
                provider("free", Tier::Fast, false),
            ],
            rate,
        );
        exhaust(&store, "balp", 2).await;
        let got = picker.pick(&store, Tier::Balanced, Role::Coder, t0()).await.unwrap().unwrap();
        assert_eq!(got.name, "free");
        assert_eq!(got.tier, Tier::Fast);
    }

    #[tokio::test]
    async fn walks_up_when_lower_tiers_have_no_provider() {
        let store = Store::new_in_memory().await.unwrap();
        let picker = ProviderPicker::new(
            vec![provider("prem", Tier::Premium, true)],
            RateConfig::default(),
        );
        let got = picker.pick(&store, Tier::Fast, Role::Coder, t0()).await.unwrap().unwrap();
        assert_eq!(got.name, "prem");
    }

    #[tokio::test]
    async fn everything_exhausted_defers() {
        let store = Store::new_in_memory().await.unwrap();
        let rate = RateConfig {
            window_5h_cap: 1,
            weekly_cap: 1,
        };
        let picker = ProviderPicker::new(vec![provider("only", Tier::Balanced, true)], rate);
        exhaust(&store, "only", 1).await;
        assert!(picker.pick(&store, Tier::Balanced, Role::Coder, t0()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn poor_quality_disqualifies_provider_for_role() {
        let store = Store::new_in_memory().await.unwrap();
        let picker = ProviderPicker::new(
            vec![
                provider("balp", Tier::Balanced, true),
                provider("fastp", Tier::Fast, true),
            ],
            RateConfig::default(),
        );
        for i in 0..5 {
            store
                .insert_quality_score(&fm_core::types::QualityScore {
                    dispatch_id: i,
                    provider: "balp-model".into(),
                    role: Role::Coder,
                    score: 0.0,
                    at: t0(),
                })
                .await
                .unwrap();
        }

        // Coders walk past the disqualified provider; reviewers still get it.
        let got = picker.pick(&store, Tier::Balanced, Role::Coder, t0()).await.unwrap().unwrap();
        assert_eq!(got.name, "fastp");
        let got = picker
            .pick(&store, Tier::Balanced, Role::Reviewer, t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.name, "balp");
    }

    #[tokio::test]
    async fn weekly_pct_reflects_usage() {
        let store = Store::new_in_memory().await.unwrap();
        let rate = RateConfig {
            window_5h_cap: 100,
            weekly_cap: 10,
        };
        let picker = ProviderPicker::new(vec![provider("p", Tier::Fast, true)], rate);
        exhaust(&store, "p", 5).await;
        let pct = picker.weekly_usage_pct(&store, t0()).await.unwrap();
        assert!((pct - 50.0).abs() < 1e-9);
    }
}
