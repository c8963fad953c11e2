//! Health tracking for one agent.
//!
//! Healthy --(failure rate over window > threshold)--> Unhealthy
//! Unhealthy --(cooldown elapsed, no failure meanwhile)--> Recovering
//! Recovering --(one success)--> Healthy
//! Recovering --(one failure)--> Unhealthy (cooldown restarts)
//!
//! An explicit health-check success restores Healthy from any state; a missed
//! heartbeat deadline marks the agent Unhealthy until the next heartbeat.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::config::BalancerConfig;
use crate::domain::Health;

/// A health flip, `(from, to)`.
pub type Transition = (Health, Health);

#[derive(Debug, Clone)]
pub struct HealthTracker {
    health: Health,

    /// Outcomes of the most recent releases, `true` = failure.
    outcomes: VecDeque<bool>,

    /// Start of the current cooldown.
    unhealthy_since: Option<DateTime<Utc>>,

    last_heartbeat: DateTime<Utc>,

    /// Unhealthy because the heartbeat deadline passed.
    stale: bool,
}

impl HealthTracker {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            health: Health::Healthy,
            outcomes: VecDeque::new(),
            unhealthy_since: None,
            last_heartbeat: now,
            stale: false,
        }
    }

    pub fn health(&self) -> Health {
        self.health
    }

    pub fn failure_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|failed| **failed).count();
        failures as f64 / self.outcomes.len() as f64
    }

    fn set(&mut self, to: Health, now: DateTime<Utc>) -> Option<Transition> {
        let from = self.health;
        match to {
            Health::Unhealthy => self.unhealthy_since = Some(now),
            Health::Healthy => {
                self.unhealthy_since = None;
                self.outcomes.clear();
            }
            Health::Recovering => {}
        }
        self.health = to;
        (from != to).then_some((from, to))
    }

    /// Feed the outcome of one release.
    pub fn record(
        &mut self,
        success: bool,
        now: DateTime<Utc>,
        config: &BalancerConfig,
    ) -> Option<Transition> {
        self.outcomes.push_back(!success);
        while self.outcomes.len() > config.window {
            self.outcomes.pop_front();
        }

        match (self.health, success) {
            (Health::Recovering, true) => self.set(Health::Healthy, now),
            (Health::Recovering, false) => self.set(Health::Unhealthy, now),
            // a task dispatched before the flip failed late: restart cooldown
            (Health::Unhealthy, false) => self.set(Health::Unhealthy, now),
            (Health::Unhealthy, true) => None,
            (Health::Healthy, _) => {
                if self.outcomes.len() >= config.min_samples
                    && self.failure_rate() > config.failure_threshold
                {
                    self.set(Health::Unhealthy, now)
                } else {
                    None
                }
            }
        }
    }

    /// Time-driven transitions: cooldown expiry and heartbeat staleness.
    pub fn refresh(&mut self, now: DateTime<Utc>, config: &BalancerConfig) -> Option<Transition> {
        if let Some(timeout) = config.heartbeat_timeout()
            && !self.stale
            && elapsed(self.last_heartbeat, now) > timeout
        {
            self.stale = true;
            return self.set(Health::Unhealthy, now);
        }

        if self.health == Health::Unhealthy
            && !self.stale
            && let Some(since) = self.unhealthy_since
            && elapsed(since, now) >= config.cooldown()
        {
            return self.set(Health::Recovering, now);
        }
        None
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        self.last_heartbeat = now;
        if self.stale {
            self.stale = false;
            return self.set(Health::Recovering, now);
        }
        None
    }

    pub fn health_check(&mut self, ok: bool, now: DateTime<Utc>) -> Option<Transition> {
        if ok {
            self.stale = false;
            self.last_heartbeat = now;
            self.set(Health::Healthy, now)
        } else {
            self.set(Health::Unhealthy, now)
        }
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> std::time::Duration {
    (now - since).to_std().unwrap_or_default()
}
