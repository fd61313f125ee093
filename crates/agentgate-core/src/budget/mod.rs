//! Budget threshold enforcement for delegation tokens.
//!
//! Accumulates monetary cost events per delegation token and classifies
//! current spend against a four-state threshold ladder:
//! `ok` -> `soft_alert` -> `reauth_required` -> `hard_stop`
//! (plus `no_limit` when no budget row exists for the token).
//!
//! # Ledger semantics
//!
//! Total spend is always recomputed as the sum over an immutable,
//! append-only cost-event log — it is never stored as a running counter.
//! A derived aggregate cannot suffer the lost-update bug class that
//! mutable counters do under concurrent debits, and the event log stays
//! the single auditable source of truth. The state machine is therefore
//! stateless and idempotent: two [`BudgetEnforcer::check_budget`] calls
//! with no intervening cost event return identical results.
//!
//! # Enforcement
//!
//! [`BudgetEnforcer::check_budget`] is a pure read.
//! [`BudgetEnforcer::enforce_budget`] is the gate an orchestrator calls
//! before permitting further spend: it fails only in the `hard_stop`
//! state, with spend, limit, and ratio in the error.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{self, Migration, StoreError};

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "
        CREATE TABLE IF NOT EXISTS budget_limits (
            token_id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL DEFAULT '',
            max_budget_usd REAL NOT NULL,
            soft_alert_pct REAL NOT NULL DEFAULT 80,
            reauth_pct REAL NOT NULL DEFAULT 100,
            hard_stop_pct REAL NOT NULL DEFAULT 120,
            updated_at_ns INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS budget_cost_events (
            event_id TEXT PRIMARY KEY,
            token_id TEXT NOT NULL,
            tenant_id TEXT NOT NULL DEFAULT '',
            actor TEXT NOT NULL,
            cost_usd REAL NOT NULL,
            description TEXT NOT NULL,
            recorded_at_ns INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cost_events_token
            ON budget_cost_events (token_id, recorded_at_ns);
    ",
}];

/// Errors from budget operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BudgetError {
    /// Malformed budget limit arguments.
    #[error("invalid budget limit: {reason}")]
    InvalidLimit {
        /// Why the limit was rejected.
        reason: String,
    },

    /// Malformed cost event arguments.
    #[error("invalid cost event: {reason}")]
    InvalidCostEvent {
        /// Why the event was rejected.
        reason: String,
    },

    /// The token is in the `hard_stop` state; further spend is refused.
    #[error(
        "budget exceeded for token '{token_id}': spent {total_spend_usd:.4} of \
         {max_budget_usd:.4} USD ({ratio_pct:.1}%)"
    )]
    HardStop {
        /// The delegation token that breached its hard stop.
        token_id: String,
        /// Total spend across the token's cost events.
        total_spend_usd: f64,
        /// The configured budget.
        max_budget_usd: f64,
        /// Spend as a percentage of the budget.
        ratio_pct: f64,
    },

    /// The underlying store failed.
    #[error("budget storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },
}

impl From<StoreError> for BudgetError {
    fn from(err: StoreError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

/// Budget classification for a delegation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetState {
    /// No budget limit is configured for the token.
    NoLimit,
    /// Spend is below the soft-alert threshold.
    Ok,
    /// Spend reached the soft-alert threshold; flag but proceed.
    SoftAlert,
    /// Spend reached the reauthorization threshold; the delegation
    /// should be re-approved before further spend.
    ReauthRequired,
    /// Spend reached the hard-stop threshold; further spend is refused.
    HardStop,
}

impl BudgetState {
    /// Returns the wire-format state name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoLimit => "no_limit",
            Self::Ok => "ok",
            Self::SoftAlert => "soft_alert",
            Self::ReauthRequired => "reauth_required",
            Self::HardStop => "hard_stop",
        }
    }
}

impl std::fmt::Display for BudgetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Threshold ladder, as percentages of the budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetThresholds {
    /// Percentage at which spend is flagged.
    pub soft_alert_pct: f64,
    /// Percentage at which reauthorization is required.
    pub reauth_pct: f64,
    /// Percentage at which further spend is refused.
    pub hard_stop_pct: f64,
}

impl Default for BudgetThresholds {
    fn default() -> Self {
        Self {
            soft_alert_pct: 80.0,
            reauth_pct: 100.0,
            hard_stop_pct: 120.0,
        }
    }
}

impl BudgetThresholds {
    fn validate(&self) -> Result<(), BudgetError> {
        for (name, value) in [
            ("soft_alert_pct", self.soft_alert_pct),
            ("reauth_pct", self.reauth_pct),
            ("hard_stop_pct", self.hard_stop_pct),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(BudgetError::InvalidLimit {
                    reason: format!("{name} must be a positive finite percentage, got {value}"),
                });
            }
        }
        if self.soft_alert_pct > self.reauth_pct || self.reauth_pct > self.hard_stop_pct {
            return Err(BudgetError::InvalidLimit {
                reason: format!(
                    "thresholds must be ordered soft <= reauth <= hard, got {}/{}/{}",
                    self.soft_alert_pct, self.reauth_pct, self.hard_stop_pct
                ),
            });
        }
        Ok(())
    }
}

/// A budget limit row for one delegation token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimit {
    /// The delegation token the budget applies to.
    pub token_id: String,
    /// Tenant scope of the budget.
    pub tenant_id: String,
    /// Maximum budget in USD.
    pub max_budget_usd: f64,
    /// Threshold ladder.
    pub thresholds: BudgetThresholds,
    /// Last update timestamp (epoch nanoseconds).
    pub updated_at_ns: i64,
}

/// Arguments for [`BudgetEnforcer::set_budget_limit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLimitSpec {
    /// The delegation token the budget applies to.
    pub token_id: String,
    /// Tenant scope of the budget.
    pub tenant_id: String,
    /// Maximum budget in USD. Must be positive and finite.
    pub max_budget_usd: f64,
    /// Threshold ladder; defaults to 80/100/120.
    pub thresholds: BudgetThresholds,
}

impl BudgetLimitSpec {
    /// Creates a spec with default thresholds and an empty tenant scope.
    #[must_use]
    pub fn new(token_id: impl Into<String>, max_budget_usd: f64) -> Self {
        Self {
            token_id: token_id.into(),
            tenant_id: String::new(),
            max_budget_usd,
            thresholds: BudgetThresholds::default(),
        }
    }

    /// Sets the tenant scope.
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    /// Overrides the threshold ladder.
    #[must_use]
    pub const fn thresholds(mut self, thresholds: BudgetThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    fn validate(&self) -> Result<(), BudgetError> {
        if self.token_id.is_empty() {
            return Err(BudgetError::InvalidLimit {
                reason: "token_id must not be empty".to_string(),
            });
        }
        if !self.max_budget_usd.is_finite() || self.max_budget_usd <= 0.0 {
            return Err(BudgetError::InvalidLimit {
                reason: format!(
                    "max_budget_usd must be positive and finite, got {}",
                    self.max_budget_usd
                ),
            });
        }
        self.thresholds.validate()
    }
}

/// Arguments for [`BudgetEnforcer::record_cost_event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEventSpec {
    /// The delegation token charged by this event.
    pub token_id: String,
    /// Tenant scope of the event.
    pub tenant_id: String,
    /// Cost in USD. Must be non-negative and finite.
    pub cost_usd: f64,
    /// Actor that incurred the cost.
    pub actor: String,
    /// Human-readable description for the audit trail.
    pub description: String,
}

impl CostEventSpec {
    /// Creates a cost event spec with an empty tenant scope.
    #[must_use]
    pub fn new(
        token_id: impl Into<String>,
        cost_usd: f64,
        actor: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            token_id: token_id.into(),
            tenant_id: String::new(),
            cost_usd,
            actor: actor.into(),
            description: description.into(),
        }
    }

    /// Sets the tenant scope.
    #[must_use]
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    fn validate(&self) -> Result<(), BudgetError> {
        if self.token_id.is_empty() {
            return Err(BudgetError::InvalidCostEvent {
                reason: "token_id must not be empty".to_string(),
            });
        }
        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            return Err(BudgetError::InvalidCostEvent {
                reason: format!(
                    "cost_usd must be non-negative and finite, got {}",
                    self.cost_usd
                ),
            });
        }
        Ok(())
    }
}

/// An immutable cost event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEvent {
    /// Generated event identifier.
    pub event_id: String,
    /// The delegation token charged.
    pub token_id: String,
    /// Tenant scope.
    pub tenant_id: String,
    /// Actor that incurred the cost.
    pub actor: String,
    /// Cost in USD.
    pub cost_usd: f64,
    /// Audit description.
    pub description: String,
    /// When the event was recorded (epoch nanoseconds).
    pub recorded_at_ns: i64,
}

/// Result of a [`BudgetEnforcer::check_budget`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    /// The token that was checked.
    pub token_id: String,
    /// Classification against the threshold ladder.
    pub state: BudgetState,
    /// Sum over the token's cost events.
    pub total_spend_usd: f64,
    /// The configured budget, absent when no limit row exists.
    pub max_budget_usd: Option<f64>,
    /// Spend as a percentage of the budget, absent when no limit row
    /// exists.
    pub ratio_pct: Option<f64>,
    /// The configured threshold ladder, absent when no limit row exists.
    pub thresholds: Option<BudgetThresholds>,
}

impl BudgetStatus {
    /// Returns `true` if further spend is refused.
    #[must_use]
    pub const fn is_hard_stop(&self) -> bool {
        matches!(self.state, BudgetState::HardStop)
    }
}

/// The budget threshold enforcer engine.
///
/// One `SQLite` store (limits and the cost-event log), one mutex; every
/// public operation holds the mutex for its full duration — including
/// the conceptually read-only checks, since the storage handle is not
/// safe for unsynchronized access.
pub struct BudgetEnforcer {
    conn: Arc<Mutex<Connection>>,
}

impl BudgetEnforcer {
    /// Opens (or creates) a budget store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Storage`] if the store cannot be opened or
    /// migrated.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, BudgetError> {
        let conn = store::open_store(path, MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory budget store (tests, ephemeral use).
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Storage`] if the store cannot be opened or
    /// migrated.
    pub fn in_memory() -> Result<Self, BudgetError> {
        let conn = store::open_in_memory(MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Upserts the budget limit for a token. Replacing an existing limit
    /// discards the old thresholds — last write wins.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::InvalidLimit`] for malformed arguments.
    pub fn set_budget_limit(&self, spec: BudgetLimitSpec) -> Result<BudgetLimit, BudgetError> {
        spec.validate()?;
        let limit = BudgetLimit {
            token_id: spec.token_id,
            tenant_id: spec.tenant_id,
            max_budget_usd: spec.max_budget_usd,
            thresholds: spec.thresholds,
            updated_at_ns: store::now_ns(),
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO budget_limits
             (token_id, tenant_id, max_budget_usd, soft_alert_pct, reauth_pct,
              hard_stop_pct, updated_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(token_id) DO UPDATE SET
               tenant_id = excluded.tenant_id,
               max_budget_usd = excluded.max_budget_usd,
               soft_alert_pct = excluded.soft_alert_pct,
               reauth_pct = excluded.reauth_pct,
               hard_stop_pct = excluded.hard_stop_pct,
               updated_at_ns = excluded.updated_at_ns",
            params![
                limit.token_id,
                limit.tenant_id,
                limit.max_budget_usd,
                limit.thresholds.soft_alert_pct,
                limit.thresholds.reauth_pct,
                limit.thresholds.hard_stop_pct,
                limit.updated_at_ns,
            ],
        )
        .map_err(storage_err)?;
        Ok(limit)
    }

    /// Returns the budget limit for a token, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Storage`] if the store fails.
    pub fn get_budget_limit(&self, token_id: &str) -> Result<Option<BudgetLimit>, BudgetError> {
        let conn = self.lock()?;
        Self::read_limit(&conn, token_id)
    }

    /// Appends a cost event and returns its generated event ID.
    ///
    /// The event log is append-only: prior events are never mutated or
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::InvalidCostEvent`] for malformed
    /// arguments.
    pub fn record_cost_event(&self, spec: CostEventSpec) -> Result<String, BudgetError> {
        spec.validate()?;
        let event_id = Uuid::new_v4().to_string();

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO budget_cost_events
             (event_id, token_id, tenant_id, actor, cost_usd, description,
              recorded_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event_id,
                spec.token_id,
                spec.tenant_id,
                spec.actor,
                spec.cost_usd,
                spec.description,
                store::now_ns(),
            ],
        )
        .map_err(storage_err)?;
        Ok(event_id)
    }

    /// Classifies the token's current spend against its threshold
    /// ladder.
    ///
    /// Pure function of the limit row and the event sum; safe to call
    /// concurrently and repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Storage`] if the store fails.
    pub fn check_budget(&self, token_id: &str) -> Result<BudgetStatus, BudgetError> {
        let conn = self.lock()?;
        let limit = Self::read_limit(&conn, token_id)?;
        let total_spend_usd = Self::total_spend(&conn, token_id)?;

        let Some(limit) = limit else {
            return Ok(BudgetStatus {
                token_id: token_id.to_string(),
                state: BudgetState::NoLimit,
                total_spend_usd,
                max_budget_usd: None,
                ratio_pct: None,
                thresholds: None,
            });
        };

        let ratio_pct = total_spend_usd / limit.max_budget_usd * 100.0;
        let state = if ratio_pct >= limit.thresholds.hard_stop_pct {
            BudgetState::HardStop
        } else if ratio_pct >= limit.thresholds.reauth_pct {
            BudgetState::ReauthRequired
        } else if ratio_pct >= limit.thresholds.soft_alert_pct {
            BudgetState::SoftAlert
        } else {
            BudgetState::Ok
        };

        Ok(BudgetStatus {
            token_id: token_id.to_string(),
            state,
            total_spend_usd,
            max_budget_usd: Some(limit.max_budget_usd),
            ratio_pct: Some(ratio_pct),
            thresholds: Some(limit.thresholds),
        })
    }

    /// Gate for further spend under a delegation token.
    ///
    /// Returns the status unchanged unless the state is `hard_stop`.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::HardStop`] with spend, limit, and ratio
    /// when the hard-stop threshold is breached, and
    /// [`BudgetError::Storage`] if the store fails.
    pub fn enforce_budget(&self, token_id: &str) -> Result<BudgetStatus, BudgetError> {
        let status = self.check_budget(token_id)?;
        if status.is_hard_stop() {
            let max_budget_usd = status.max_budget_usd.unwrap_or(0.0);
            let ratio_pct = status.ratio_pct.unwrap_or(0.0);
            tracing::warn!(
                token_id,
                total_spend_usd = status.total_spend_usd,
                max_budget_usd,
                ratio_pct,
                "budget hard stop"
            );
            return Err(BudgetError::HardStop {
                token_id: token_id.to_string(),
                total_spend_usd: status.total_spend_usd,
                max_budget_usd,
                ratio_pct,
            });
        }
        Ok(status)
    }

    /// Lists the token's cost events, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`BudgetError::Storage`] if the store fails.
    pub fn list_cost_events(&self, token_id: &str) -> Result<Vec<CostEvent>, BudgetError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT event_id, token_id, tenant_id, actor, cost_usd, description,
                        recorded_at_ns
                 FROM budget_cost_events
                 WHERE token_id = ?1
                 ORDER BY recorded_at_ns DESC, event_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![token_id], |row| {
                Ok(CostEvent {
                    event_id: row.get(0)?,
                    token_id: row.get(1)?,
                    tenant_id: row.get(2)?,
                    actor: row.get(3)?,
                    cost_usd: row.get(4)?,
                    description: row.get(5)?,
                    recorded_at_ns: row.get(6)?,
                })
            })
            .map_err(storage_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
    }

    fn read_limit(conn: &Connection, token_id: &str) -> Result<Option<BudgetLimit>, BudgetError> {
        conn.query_row(
            "SELECT token_id, tenant_id, max_budget_usd, soft_alert_pct,
                    reauth_pct, hard_stop_pct, updated_at_ns
             FROM budget_limits WHERE token_id = ?1",
            params![token_id],
            |row| {
                Ok(BudgetLimit {
                    token_id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    max_budget_usd: row.get(2)?,
                    thresholds: BudgetThresholds {
                        soft_alert_pct: row.get(3)?,
                        reauth_pct: row.get(4)?,
                        hard_stop_pct: row.get(5)?,
                    },
                    updated_at_ns: row.get(6)?,
                })
            },
        )
        .optional()
        .map_err(storage_err)
    }

    fn total_spend(conn: &Connection, token_id: &str) -> Result<f64, BudgetError> {
        conn.query_row(
            "SELECT COALESCE(SUM(cost_usd), 0.0) FROM budget_cost_events
             WHERE token_id = ?1",
            params![token_id],
            |row| row.get(0),
        )
        .map_err(storage_err)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, BudgetError> {
        self.conn.lock().map_err(|_| BudgetError::Storage {
            message: "budget enforcer lock poisoned".to_string(),
        })
    }
}

fn storage_err(err: rusqlite::Error) -> BudgetError {
    BudgetError::Storage {
        message: err.to_string(),
    }
}
