use arcana_core::{ArcanaError, ArcanaResult};
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// How often a recurring job fires: a fixed period or a cron expression.
///
/// In TOML: `{ every_secs = 60 }` or `{ cron = "0 0 3 * * * *" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cadence {
    Every { every_secs: u64 },
    Cron { cron: String },
}

impl Cadence {
    pub fn every(secs: u64) -> Self {
        Cadence::Every { every_secs: secs }
    }

    pub fn cron(expr: impl Into<String>) -> Self {
        Cadence::Cron { cron: expr.into() }
    }

    /// Reject zero periods and unparsable cron expressions.
    pub fn validate(&self) -> ArcanaResult<()> {
        match self {
            Cadence::Every { every_secs: 0 } => {
                Err(ArcanaError::Config("cadence period must be at least 1s".into()))
            }
            Cadence::Every { .. } => Ok(()),
            Cadence::Cron { cron } => parse_cron(cron).map(|_| ()),
        }
    }

    /// Build the timer driving this cadence. Interval timers fire once
    /// immediately, then every period; ticks missed while a job runs are
    /// skipped rather than replayed.
    pub fn timer(&self) -> ArcanaResult<CadenceTimer> {
        self.validate()?;
        match self {
            Cadence::Every { every_secs } => {
                let mut interval = tokio::time::interval(Duration::from_secs(*every_secs));
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Ok(CadenceTimer::Interval(interval))
            }
            Cadence::Cron { cron } => Ok(CadenceTimer::Cron(Box::new(parse_cron(cron)?))),
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cadence::Every { every_secs } => write!(f, "every {every_secs}s"),
            Cadence::Cron { cron } => write!(f, "cron '{cron}'"),
        }
    }
}

/// Parse a cron expression string into a [`cron::Schedule`].
///
/// Uses the 7-field cron format: sec min hour day-of-month month day-of-week year.
pub fn parse_cron(cron_expr: &str) -> ArcanaResult<Schedule> {
    Schedule::from_str(cron_expr)
        .map_err(|e| ArcanaError::Config(format!("Invalid cron expression '{cron_expr}': {e}")))
}

/// Compute the next fire time for a given cron expression.
pub fn next_fire_time(cron_expr: &str) -> ArcanaResult<DateTime<Utc>> {
    let schedule = parse_cron(cron_expr)?;
    schedule.upcoming(Utc).next().ok_or_else(|| {
        ArcanaError::Config(format!(
            "Cron expression '{cron_expr}' has no upcoming fire times"
        ))
    })
}

pub enum CadenceTimer {
    Interval(Interval),
    Cron(Box<Schedule>),
}

impl CadenceTimer {
    /// Wait for the next fire time. A cron schedule with no upcoming times
    /// never fires again.
    pub async fn tick(&mut self) {
        match self {
            CadenceTimer::Interval(interval) => {
                interval.tick().await;
            }
            CadenceTimer::Cron(schedule) => match schedule.upcoming(Utc).next() {
                Some(next) => {
                    let wait = (next - Utc::now()).to_std().unwrap_or_default();
                    tokio::time::sleep(wait).await;
                }
                None => std::future::pending::<()>().await,
            },
        }
    }
}
