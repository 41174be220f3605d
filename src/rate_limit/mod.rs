//! C6: fleet message-rate tracker.
//!
//! Tracks the fleet's message budget against the upstream agent provider —
//! distinct from [`crate::http_rate_limit`]'s `governor`-based throttling of
//! the control plane's own HTTP endpoints (§4.6).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::constants::{RATE_LIMIT_5H_SECS, RATE_LIMIT_ALERT_FRACTION, RATE_LIMIT_HISTORY_CAP};
use crate::events::{Event, EventBus, RateLimitEvent};
use crate::Result;

#[derive(Debug, Clone, Serialize)]
pub struct WindowUsage {
    pub used: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pace {
    pub current: f64,
    pub safe: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FleetUsageSnapshot {
    pub five_hour: WindowUsage,
    pub pace: Pace,
    pub daily: WindowUsage,
    pub daily_projected_end_of_day: u64,
    pub weekly: WindowUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Persisted {
    events: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    five_hour: u64,
    daily: u64,
    weekly: u64,
}

pub struct RateLimitTracker {
    events: Arc<RwLock<VecDeque<DateTime<Utc>>>>,
    limits: RwLock<Limits>,
    /// ISO weekday (1 = Monday .. 7 = Sunday) the weekly window resets on.
    reset_weekday: u32,
    persist_path: PathBuf,
    bus: EventBus,
}

impl RateLimitTracker {
    pub fn new(
        persist_path: PathBuf,
        five_hour_limit: u64,
        daily_limit: u64,
        weekly_limit: u64,
        reset_weekday: u32,
        bus: EventBus,
    ) -> Self {
        let seeded = std::fs::read_to_string(&persist_path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Persisted>(&raw).ok())
            .map(|p| p.events.into_iter().collect())
            .unwrap_or_default();

        Self {
            events: Arc::new(RwLock::new(seeded)),
            limits: RwLock::new(Limits { five_hour: five_hour_limit, daily: daily_limit, weekly: weekly_limit }),
            reset_weekday,
            persist_path,
            bus,
        }
    }

    /// `recordMessage()` — advances all three windows with one event.
    pub async fn record_message(&self) -> Result<()> {
        let mut guard = self.events.write().await;
        guard.push_back(Utc::now());
        while guard.len() > RATE_LIMIT_HISTORY_CAP {
            guard.pop_front();
        }
        Ok(())
    }

    /// Persists the sliding event list. Intended to run every
    /// `RATE_LIMIT_PERSIST_INTERVAL_SECS` from a background task.
    pub async fn persist(&self) -> Result<()> {
        let guard = self.events.read().await;
        let doc = Persisted { events: guard.iter().copied().collect() };
        drop(guard);
        if let Some(parent) = self.persist_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.persist_path, serde_json::to_vec(&doc)?)?;
        Ok(())
    }

    pub async fn snapshot(&self) -> FleetUsageSnapshot {
        let now = Utc::now();
        let guard = self.events.read().await;
        let limits = *self.limits.read().await;

        let five_hour_cutoff = now - Duration::seconds(RATE_LIMIT_5H_SECS);
        let five_hour_events: Vec<&DateTime<Utc>> = guard.iter().filter(|ts| **ts >= five_hour_cutoff).collect();
        let used_5h = five_hour_events.len() as u64;
        let oldest_in_window = five_hour_events.first().copied().copied().unwrap_or(now);
        let five_hour = WindowUsage {
            used: used_5h,
            limit: limits.five_hour,
            reset_at: oldest_in_window + Duration::seconds(RATE_LIMIT_5H_SECS),
        };

        let elapsed_secs = (now - oldest_in_window).num_seconds().max(1) as f64;
        let current_pace = used_5h as f64 / elapsed_secs;
        let safe_pace = limits.five_hour as f64 * RATE_LIMIT_ALERT_FRACTION / RATE_LIMIT_5H_SECS as f64;
        let pace = Pace { current: current_pace, safe: safe_pace };

        let local_now = Local::now();
        let day_start_local = local_now.date_naive().and_hms_opt(0, 0, 0).expect("valid midnight");
        let day_start = Local.from_local_datetime(&day_start_local).single().unwrap_or(local_now).with_timezone(&Utc);
        let day_events = guard.iter().filter(|ts| **ts >= day_start).count() as u64;
        let day_elapsed = (now - day_start).num_seconds().max(1) as f64;
        let day_fraction_elapsed = (day_elapsed / 86_400.0).min(1.0);
        let daily_projected_end_of_day = if day_fraction_elapsed > 0.0 {
            (day_events as f64 / day_fraction_elapsed) as u64
        } else {
            day_events
        };
        let daily = WindowUsage {
            used: day_events,
            limit: limits.daily,
            reset_at: day_start + Duration::days(1),
        };

        let days_since_reset = (local_now.weekday().number_from_monday() + 7 - self.reset_weekday) % 7;
        let week_start_local = (local_now.date_naive() - Duration::days(days_since_reset as i64))
            .and_hms_opt(0, 0, 0)
            .expect("valid midnight");
        let week_start = Local.from_local_datetime(&week_start_local).single().unwrap_or(local_now).with_timezone(&Utc);
        let week_events = guard.iter().filter(|ts| **ts >= week_start).count() as u64;
        let weekly = WindowUsage {
            used: week_events,
            limit: limits.weekly,
            reset_at: week_start + Duration::days(7),
        };

        FleetUsageSnapshot { five_hour, pace, daily, daily_projected_end_of_day, weekly }
    }

    /// `resetUsage()` — operator-triggered clear of all recorded events,
    /// persisted immediately so a restart doesn't resurrect the old window.
    pub async fn reset(&self) -> Result<()> {
        let mut guard = self.events.write().await;
        guard.clear();
        drop(guard);
        self.persist().await
    }

    /// Overrides the configured limits at runtime (`POST /api/usage/limits`).
    /// `None` leaves that window's limit unchanged.
    pub async fn set_limits(&self, five_hour: Option<u64>, daily: Option<u64>, weekly: Option<u64>) {
        let mut limits = self.limits.write().await;
        if let Some(v) = five_hour {
            limits.five_hour = v;
        }
        if let Some(v) = daily {
            limits.daily = v;
        }
        if let Some(v) = weekly {
            limits.weekly = v;
        }
    }

    /// `getAlerts()` — windows at or above the configured alert fraction.
    pub async fn get_alerts(&self) -> Vec<(&'static str, f64)> {
        let snapshot = self.snapshot().await;
        let mut alerts = Vec::new();
        let windows: [(&'static str, &WindowUsage); 3] =
            [("5h", &snapshot.five_hour), ("daily", &snapshot.daily), ("weekly", &snapshot.weekly)];
        for (name, window) in windows {
            if window.limit == 0 {
                continue;
            }
            let fraction = window.used as f64 / window.limit as f64;
            if fraction >= RATE_LIMIT_ALERT_FRACTION {
                alerts.push((name, fraction));
                let event = if fraction >= 1.0 {
                    RateLimitEvent::AlertCritical { window: name.to_string(), used_fraction: fraction }
                } else {
                    RateLimitEvent::AlertWarning { window: name.to_string(), used_fraction: fraction }
                };
                self.bus.publish(Event::RateLimit(event));
            }
        }
        alerts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn record_message_advances_five_hour_window() {
        let dir = tempdir().unwrap();
        let tracker = RateLimitTracker::new(dir.path().join("rl.json"), 100, 1000, 5000, 7, EventBus::new());
        tracker.record_message().await.unwrap();
        tracker.record_message().await.unwrap();
        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.five_hour.used, 2);
    }

    #[tokio::test]
    async fn alerts_fire_past_ninety_percent() {
        let dir = tempdir().unwrap();
        let tracker = RateLimitTracker::new(dir.path().join("rl.json"), 2, 1000, 5000, 7, EventBus::new());
        tracker.record_message().await.unwrap();
        tracker.record_message().await.unwrap();
        let alerts = tracker.get_alerts().await;
        assert!(alerts.iter().any(|(window, _)| *window == "5h"));
    }

    #[tokio::test]
    async fn persist_and_reload_round_trips_events() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rl.json");
        let tracker = RateLimitTracker::new(path.clone(), 100, 1000, 5000, 7, EventBus::new());
        tracker.record_message().await.unwrap();
        tracker.persist().await.unwrap();

        let reloaded = RateLimitTracker::new(path, 100, 1000, 5000, 7, EventBus::new());
        let snapshot = reloaded.snapshot().await;
        assert_eq!(snapshot.five_hour.used, 1);
    }

    #[tokio::test]
    async fn history_is_capped() {
        let dir = tempdir().unwrap();
        let tracker = RateLimitTracker::new(dir.path().join("rl.json"), 10_000, 10_000, 10_000, 7, EventBus::new());
        for _ in 0..(RATE_LIMIT_HISTORY_CAP + 10) {
            tracker.record_message().await.unwrap();
        }
        assert_eq!(tracker.events.read().await.len(), RATE_LIMIT_HISTORY_CAP);
    }

    #[tokio::test]
    async fn reset_clears_events_and_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rl.json");
        let tracker = RateLimitTracker::new(path.clone(), 100, 1000, 5000, 7, EventBus::new());
        tracker.record_message().await.unwrap();
        tracker.record_message().await.unwrap();
        assert_eq!(tracker.snapshot().await.five_hour.used, 2);

        tracker.reset().await.unwrap();
        assert_eq!(tracker.snapshot().await.five_hour.used, 0);

        let reloaded = RateLimitTracker::new(path, 100, 1000, 5000, 7, EventBus::new());
        assert_eq!(reloaded.snapshot().await.five_hour.used, 0);
    }

    #[tokio::test]
    async fn set_limits_overrides_only_given_windows() {
        let dir = tempdir().unwrap();
        let tracker = RateLimitTracker::new(dir.path().join("rl.json"), 100, 1000, 5000, 7, EventBus::new());

        tracker.set_limits(Some(200), None, Some(6000)).await;
        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.five_hour.limit, 200);
        assert_eq!(snapshot.daily.limit, 1000);
        assert_eq!(snapshot.weekly.limit, 6000);
    }
}
