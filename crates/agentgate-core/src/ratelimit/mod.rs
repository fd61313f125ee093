//! Sliding-window rate limiter.
//!
//! Bounds request volume per (agent, resource) pair over rolling time
//! windows. Policies are opt-in: a pair with no enabled policy is always
//! allowed. Each policy carries a burst allowance and a violation action
//! (`deny`, `throttle`, or `log` — a log-only policy records violations
//! but never blocks).
//!
//! # Evaluation
//!
//! [`RateLimiter::check_rate_limit`] both evaluates *and* records the
//! request — it is not a pure read. Every enabled policy matching the
//! pair is checked independently; the first violated policy determines
//! the outcome and appends an immutable violation record. Only a request
//! that violates zero policies is appended to the usage counter, and
//! headroom is reported relative to the most restrictive applicable
//! policy (lowest `max_requests + burst_allowance`).
//!
//! # Memory bound
//!
//! After each recorded request, usage timestamps older than twice the
//! *longest* applicable window are pruned. Pruning by the shortest window
//! would evict timestamps a longer-window policy on the same key still
//! counts, so the longest window is the bound that is both finite and
//! safe.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, params, params_from_iter};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::{self, Migration, StoreError};

/// Upper bound on policy windows (one year). Keeps nanosecond arithmetic
/// comfortably inside `i64`.
pub const MAX_WINDOW_SECONDS: u64 = 31_536_000;

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "
        CREATE TABLE IF NOT EXISTS rate_limit_policies (
            policy_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            resource TEXT NOT NULL,
            max_requests INTEGER NOT NULL,
            window_seconds INTEGER NOT NULL,
            burst_allowance INTEGER NOT NULL DEFAULT 0,
            action TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at_ns INTEGER NOT NULL,
            updated_at_ns INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rate_policies_pair
            ON rate_limit_policies (agent_id, resource);

        CREATE TABLE IF NOT EXISTS rate_limit_usage (
            agent_id TEXT NOT NULL,
            resource TEXT NOT NULL,
            requested_at_ns INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rate_usage_pair
            ON rate_limit_usage (agent_id, resource, requested_at_ns);

        CREATE TABLE IF NOT EXISTS rate_limit_violations (
            violation_id TEXT PRIMARY KEY,
            policy_id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            resource TEXT NOT NULL,
            observed_count INTEGER NOT NULL,
            effective_limit INTEGER NOT NULL,
            action TEXT NOT NULL,
            occurred_at_ns INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_rate_violations_agent
            ON rate_limit_violations (agent_id, occurred_at_ns);
    ",
}];

/// Errors from rate-limiter operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RateLimitError {
    /// Malformed policy arguments.
    #[error("invalid rate limit policy: {reason}")]
    InvalidPolicy {
        /// Why the policy was rejected.
        reason: String,
    },

    /// The referenced policy does not exist.
    #[error("rate limit policy not found: {policy_id}")]
    PolicyNotFound {
        /// The policy ID that was not found.
        policy_id: String,
    },

    /// The underlying store failed.
    #[error("rate limiter storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },
}

impl From<StoreError> for RateLimitError {
    fn from(err: StoreError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

/// What happens when a policy's effective limit is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    /// Reject the request outright.
    Deny,
    /// Reject the request; the caller is expected to back off and retry
    /// after `retry_after_seconds`.
    Throttle,
    /// Record the violation but admit the request.
    Log,
}

impl ViolationAction {
    /// Returns the string persisted in the action column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deny => "deny",
            Self::Throttle => "throttle",
            Self::Log => "log",
        }
    }

    /// Returns `true` if a violation under this action still admits the
    /// request.
    #[must_use]
    pub const fn admits(&self) -> bool {
        matches!(self, Self::Log)
    }
}

impl std::str::FromStr for ViolationAction {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deny" => Ok(Self::Deny),
            "throttle" => Ok(Self::Throttle),
            "log" => Ok(Self::Log),
            other => Err(RateLimitError::InvalidPolicy {
                reason: format!("unknown action '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for ViolationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted rate-limit policy row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Generated policy identifier.
    pub policy_id: String,
    /// Agent the policy applies to.
    pub agent_id: String,
    /// Resource the policy applies to.
    pub resource: String,
    /// Base request limit per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// Extra requests tolerated on top of `max_requests`.
    pub burst_allowance: u32,
    /// Action taken when the effective limit is exceeded.
    pub action: ViolationAction,
    /// Disabled policies are ignored by `check_rate_limit`.
    pub enabled: bool,
    /// Creation timestamp (epoch nanoseconds).
    pub created_at_ns: i64,
    /// Last update timestamp.
    pub updated_at_ns: i64,
}

impl RateLimitPolicy {
    /// The effective limit: `max_requests + burst_allowance`.
    #[must_use]
    pub const fn effective_limit(&self) -> u64 {
        self.max_requests as u64 + self.burst_allowance as u64
    }
}

/// Arguments for [`RateLimiter::create_policy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicySpec {
    /// Agent the policy applies to.
    pub agent_id: String,
    /// Resource the policy applies to.
    pub resource: String,
    /// Base request limit per window. Must be at least 1 — "always deny"
    /// is not expressible as a limit of zero.
    pub max_requests: u32,
    /// Window length in seconds, 1..=[`MAX_WINDOW_SECONDS`].
    pub window_seconds: u64,
    /// Extra requests tolerated on top of `max_requests`.
    pub burst_allowance: u32,
    /// Action taken on violation.
    pub action: ViolationAction,
}

impl RateLimitPolicySpec {
    /// Creates a spec with no burst allowance and the `deny` action.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        resource: impl Into<String>,
        max_requests: u32,
        window_seconds: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            resource: resource.into(),
            max_requests,
            window_seconds,
            burst_allowance: 0,
            action: ViolationAction::Deny,
        }
    }

    /// Sets the burst allowance.
    #[must_use]
    pub const fn burst_allowance(mut self, burst: u32) -> Self {
        self.burst_allowance = burst;
        self
    }

    /// Sets the violation action.
    #[must_use]
    pub const fn action(mut self, action: ViolationAction) -> Self {
        self.action = action;
        self
    }

    fn validate(&self) -> Result<(), RateLimitError> {
        if self.agent_id.is_empty() {
            return Err(RateLimitError::InvalidPolicy {
                reason: "agent_id must not be empty".to_string(),
            });
        }
        if self.resource.is_empty() {
            return Err(RateLimitError::InvalidPolicy {
                reason: "resource must not be empty".to_string(),
            });
        }
        if self.max_requests == 0 {
            return Err(RateLimitError::InvalidPolicy {
                reason: "max_requests must be at least 1".to_string(),
            });
        }
        if self.window_seconds == 0 || self.window_seconds > MAX_WINDOW_SECONDS {
            return Err(RateLimitError::InvalidPolicy {
                reason: format!(
                    "window_seconds must be within 1..={MAX_WINDOW_SECONDS}, got {}",
                    self.window_seconds
                ),
            });
        }
        Ok(())
    }
}

/// Partial update for [`RateLimiter::update_policy`]. `None` fields keep
/// their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicyUpdate {
    /// New base request limit.
    pub max_requests: Option<u32>,
    /// New window length in seconds.
    pub window_seconds: Option<u64>,
    /// New burst allowance.
    pub burst_allowance: Option<u32>,
    /// New violation action.
    pub action: Option<ViolationAction>,
    /// Enable or disable the policy.
    pub enabled: Option<bool>,
}

/// An immutable violation audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitViolation {
    /// Generated violation identifier.
    pub violation_id: String,
    /// The policy that was violated.
    pub policy_id: String,
    /// Agent that triggered the violation.
    pub agent_id: String,
    /// Resource the request targeted.
    pub resource: String,
    /// In-window request count observed at violation time.
    pub observed_count: u64,
    /// The violated policy's effective limit.
    pub effective_limit: u64,
    /// The violated policy's action at the time.
    pub action: ViolationAction,
    /// When the violation occurred (epoch nanoseconds).
    pub occurred_at_ns: i64,
}

/// Outcome of a [`RateLimiter::check_rate_limit`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitOutcome {
    /// No enabled policy matches the pair; the limiter is opt-in, so the
    /// request is allowed.
    NoPolicy,
    /// The request was admitted and recorded. Headroom is relative to
    /// the most restrictive applicable policy.
    Allowed {
        /// In-window request count including this request.
        current_count: u64,
        /// Effective limit of the most restrictive applicable policy.
        limit: u64,
        /// Requests left before that limit is reached.
        remaining: u64,
    },
    /// A policy's effective limit was exceeded. The request is admitted
    /// only if the policy's action is `log`.
    Violated {
        /// The violated policy.
        policy_id: String,
        /// The violated policy's action.
        action: ViolationAction,
        /// Seconds until the oldest in-window request leaves the window.
        retry_after_seconds: u64,
        /// In-window request count observed at check time.
        current_count: u64,
        /// The violated policy's effective limit.
        limit: u64,
        /// Always zero on violation; reported for uniform callers.
        remaining: u64,
    },
}

impl RateLimitOutcome {
    /// Returns `true` if the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        match self {
            Self::NoPolicy | Self::Allowed { .. } => true,
            Self::Violated { action, .. } => action.admits(),
        }
    }
}

/// The sliding-window rate limiter engine.
///
/// One `SQLite` store (policies, usage counters, violations), one mutex;
/// every public operation holds the mutex for its full duration.
pub struct RateLimiter {
    conn: Arc<Mutex<Connection>>,
}

impl RateLimiter {
    /// Opens (or creates) a rate-limiter store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] if the store cannot be opened
    /// or migrated.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, RateLimitError> {
        let conn = store::open_store(path, MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory rate limiter (tests, ephemeral use).
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] if the store cannot be opened
    /// or migrated.
    pub fn in_memory() -> Result<Self, RateLimitError> {
        let conn = store::open_in_memory(MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates a new policy and returns the persisted row.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::InvalidPolicy`] for malformed arguments
    /// (zero limits, empty identifiers).
    pub fn create_policy(
        &self,
        spec: RateLimitPolicySpec,
    ) -> Result<RateLimitPolicy, RateLimitError> {
        spec.validate()?;
        let now = store::now_ns();
        let policy = RateLimitPolicy {
            policy_id: Uuid::new_v4().to_string(),
            agent_id: spec.agent_id,
            resource: spec.resource,
            max_requests: spec.max_requests,
            window_seconds: spec.window_seconds,
            burst_allowance: spec.burst_allowance,
            action: spec.action,
            enabled: true,
            created_at_ns: now,
            updated_at_ns: now,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO rate_limit_policies
             (policy_id, agent_id, resource, max_requests, window_seconds,
              burst_allowance, action, enabled, created_at_ns, updated_at_ns)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                policy.policy_id,
                policy.agent_id,
                policy.resource,
                i64::from(policy.max_requests),
                to_i64(policy.window_seconds),
                i64::from(policy.burst_allowance),
                policy.action.as_str(),
                i64::from(policy.enabled),
                policy.created_at_ns,
                policy.updated_at_ns,
            ],
        )
        .map_err(storage_err)?;
        Ok(policy)
    }

    /// Applies a partial update to a policy and returns the updated row.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::PolicyNotFound`] for an unknown policy
    /// and [`RateLimitError::InvalidPolicy`] if the merged policy would
    /// be malformed.
    pub fn update_policy(
        &self,
        policy_id: &str,
        update: &RateLimitPolicyUpdate,
    ) -> Result<RateLimitPolicy, RateLimitError> {
        let conn = self.lock()?;
        let mut policy = Self::read_policy(&conn, policy_id)?;

        if let Some(max_requests) = update.max_requests {
            policy.max_requests = max_requests;
        }
        if let Some(window_seconds) = update.window_seconds {
            policy.window_seconds = window_seconds;
        }
        if let Some(burst) = update.burst_allowance {
            policy.burst_allowance = burst;
        }
        if let Some(action) = update.action {
            policy.action = action;
        }
        if let Some(enabled) = update.enabled {
            policy.enabled = enabled;
        }

        RateLimitPolicySpec {
            agent_id: policy.agent_id.clone(),
            resource: policy.resource.clone(),
            max_requests: policy.max_requests,
            window_seconds: policy.window_seconds,
            burst_allowance: policy.burst_allowance,
            action: policy.action,
        }
        .validate()?;

        policy.updated_at_ns = store::now_ns();
        conn.execute(
            "UPDATE rate_limit_policies
             SET max_requests = ?1, window_seconds = ?2, burst_allowance = ?3,
                 action = ?4, enabled = ?5, updated_at_ns = ?6
             WHERE policy_id = ?7",
            params![
                i64::from(policy.max_requests),
                to_i64(policy.window_seconds),
                i64::from(policy.burst_allowance),
                policy.action.as_str(),
                i64::from(policy.enabled),
                policy.updated_at_ns,
                policy_id,
            ],
        )
        .map_err(storage_err)?;
        Ok(policy)
    }

    /// Returns a policy by ID.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::PolicyNotFound`] for an unknown policy.
    pub fn get_policy(&self, policy_id: &str) -> Result<RateLimitPolicy, RateLimitError> {
        let conn = self.lock()?;
        Self::read_policy(&conn, policy_id)
    }

    /// Lists policies, optionally filtered by agent and/or resource.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] if the store fails.
    pub fn list_policies(
        &self,
        agent_id: Option<&str>,
        resource: Option<&str>,
    ) -> Result<Vec<RateLimitPolicy>, RateLimitError> {
        let conn = self.lock()?;
        let mut sql = String::from(
            "SELECT policy_id, agent_id, resource, max_requests, window_seconds,
                    burst_allowance, action, enabled, created_at_ns, updated_at_ns
             FROM rate_limit_policies",
        );
        let mut args: Vec<String> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();
        if let Some(agent) = agent_id {
            args.push(agent.to_string());
            clauses.push(format!("agent_id = ?{}", args.len()));
        }
        if let Some(resource) = resource {
            args.push(resource.to_string());
            clauses.push(format!("resource = ?{}", args.len()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at_ns, policy_id");

        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), policy_from_row)
            .map_err(storage_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
    }

    /// Deletes a policy. Usage counters and violation records are kept
    /// (violations are immutable audit data).
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::PolicyNotFound`] for an unknown policy.
    pub fn delete_policy(&self, policy_id: &str) -> Result<(), RateLimitError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM rate_limit_policies WHERE policy_id = ?1",
                params![policy_id],
            )
            .map_err(storage_err)?;
        if deleted == 0 {
            return Err(RateLimitError::PolicyNotFound {
                policy_id: policy_id.to_string(),
            });
        }
        Ok(())
    }

    /// Evaluates all enabled policies for the pair and records the
    /// request if it is admitted without violation.
    ///
    /// See the module docs for evaluation order and pruning.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] if the store fails; storage
    /// failures are never converted into an allow or deny.
    pub fn check_rate_limit(
        &self,
        agent_id: &str,
        resource: &str,
    ) -> Result<RateLimitOutcome, RateLimitError> {
        let conn = self.lock()?;
        let now = store::now_ns();
        let policies = Self::matching_policies(&conn, agent_id, resource)?;
        if policies.is_empty() {
            return Ok(RateLimitOutcome::NoPolicy);
        }

        // Tightest applicable policy: (in-window count, effective limit).
        let mut tightest: Option<(u64, u64)> = None;

        for policy in &policies {
            let window_ns = to_i64(policy.window_seconds).saturating_mul(1_000_000_000);
            let window_start = now.saturating_sub(window_ns);
            let count = Self::count_since(&conn, agent_id, resource, window_start)?;
            let limit = policy.effective_limit();

            if count >= limit {
                let violation_id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO rate_limit_violations
                     (violation_id, policy_id, agent_id, resource,
                      observed_count, effective_limit, action, occurred_at_ns)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        violation_id,
                        policy.policy_id,
                        agent_id,
                        resource,
                        to_i64(count),
                        to_i64(limit),
                        policy.action.as_str(),
                        now,
                    ],
                )
                .map_err(storage_err)?;

                let retry_after_seconds =
                    Self::retry_after(&conn, agent_id, resource, window_start, window_ns, now)?
                        .max(1);
                tracing::warn!(
                    agent_id,
                    resource,
                    policy_id = %policy.policy_id,
                    observed = count,
                    limit,
                    action = %policy.action,
                    "rate limit exceeded"
                );
                return Ok(RateLimitOutcome::Violated {
                    policy_id: policy.policy_id.clone(),
                    action: policy.action,
                    retry_after_seconds,
                    current_count: count,
                    limit,
                    remaining: limit.saturating_sub(count),
                });
            }

            if tightest.map_or(true, |(_, l)| limit < l) {
                tightest = Some((count, limit));
            }
        }

        // No policy violated: record the request and prune.
        conn.execute(
            "INSERT INTO rate_limit_usage (agent_id, resource, requested_at_ns)
             VALUES (?1, ?2, ?3)",
            params![agent_id, resource, now],
        )
        .map_err(storage_err)?;

        let longest_window = policies
            .iter()
            .map(|p| p.window_seconds)
            .max()
            .unwrap_or(0);
        let horizon = now.saturating_sub(
            to_i64(longest_window)
                .saturating_mul(1_000_000_000)
                .saturating_mul(2),
        );
        let pruned = conn
            .execute(
                "DELETE FROM rate_limit_usage
                 WHERE agent_id = ?1 AND resource = ?2 AND requested_at_ns < ?3",
                params![agent_id, resource, horizon],
            )
            .map_err(storage_err)?;
        if pruned > 0 {
            tracing::debug!(agent_id, resource, pruned, "pruned expired usage timestamps");
        }

        let (count, limit) = tightest.unwrap_or((0, 0));
        let current_count = count + 1;
        Ok(RateLimitOutcome::Allowed {
            current_count,
            limit,
            remaining: limit.saturating_sub(current_count),
        })
    }

    /// Lists violation records, newest first, optionally filtered by
    /// agent.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] if the store fails.
    pub fn get_violations(
        &self,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<RateLimitViolation>, RateLimitError> {
        let conn = self.lock()?;
        let mut sql = String::from(
            "SELECT violation_id, policy_id, agent_id, resource,
                    observed_count, effective_limit, action, occurred_at_ns
             FROM rate_limit_violations",
        );
        let mut args: Vec<String> = Vec::new();
        if let Some(agent) = agent_id {
            args.push(agent.to_string());
            sql.push_str(" WHERE agent_id = ?1");
        }
        sql.push_str(" ORDER BY occurred_at_ns DESC, violation_id LIMIT ");
        sql.push_str(&limit.to_string());

        let mut stmt = conn.prepare(&sql).map_err(storage_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), violation_from_row)
            .map_err(storage_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
    }

    /// Returns the number of stored usage timestamps for the pair.
    ///
    /// Useful for monitoring and for verifying pruning behavior.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] if the store fails.
    pub fn usage_count(&self, agent_id: &str, resource: &str) -> Result<u64, RateLimitError> {
        let conn = self.lock()?;
        Self::count_since(&conn, agent_id, resource, i64::MIN)
    }

    /// Deletes all usage timestamps for the pair (administrative/test
    /// reset). Violation records are kept. Returns the number of rows
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Storage`] if the store fails.
    pub fn reset_usage(&self, agent_id: &str, resource: &str) -> Result<u64, RateLimitError> {
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM rate_limit_usage WHERE agent_id = ?1 AND resource = ?2",
                params![agent_id, resource],
            )
            .map_err(storage_err)?;
        Ok(deleted as u64)
    }

    fn matching_policies(
        conn: &Connection,
        agent_id: &str,
        resource: &str,
    ) -> Result<Vec<RateLimitPolicy>, RateLimitError> {
        let mut stmt = conn
            .prepare(
                "SELECT policy_id, agent_id, resource, max_requests, window_seconds,
                        burst_allowance, action, enabled, created_at_ns, updated_at_ns
                 FROM rate_limit_policies
                 WHERE agent_id = ?1 AND resource = ?2 AND enabled = 1
                 ORDER BY created_at_ns, policy_id",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(params![agent_id, resource], policy_from_row)
            .map_err(storage_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(storage_err)
    }

    fn read_policy(conn: &Connection, policy_id: &str) -> Result<RateLimitPolicy, RateLimitError> {
        use rusqlite::OptionalExtension;
        conn.query_row(
            "SELECT policy_id, agent_id, resource, max_requests, window_seconds,
                    burst_allowance, action, enabled, created_at_ns, updated_at_ns
             FROM rate_limit_policies WHERE policy_id = ?1",
            params![policy_id],
            policy_from_row,
        )
        .optional()
        .map_err(storage_err)?
        .ok_or_else(|| RateLimitError::PolicyNotFound {
            policy_id: policy_id.to_string(),
        })
    }

    fn count_since(
        conn: &Connection,
        agent_id: &str,
        resource: &str,
        window_start: i64,
    ) -> Result<u64, RateLimitError> {
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM rate_limit_usage
                 WHERE agent_id = ?1 AND resource = ?2 AND requested_at_ns > ?3",
                params![agent_id, resource, window_start],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn retry_after(
        conn: &Connection,
        agent_id: &str,
        resource: &str,
        window_start: i64,
        window_ns: i64,
        now: i64,
    ) -> Result<u64, RateLimitError> {
        let oldest: Option<i64> = conn
            .query_row(
                "SELECT MIN(requested_at_ns) FROM rate_limit_usage
                 WHERE agent_id = ?1 AND resource = ?2 AND requested_at_ns > ?3",
                params![agent_id, resource, window_start],
                |row| row.get(0),
            )
            .map_err(storage_err)?;

        Ok(oldest.map_or_else(
            || u64::try_from(window_ns / 1_000_000_000).unwrap_or(1),
            |ts| {
                let free_in_ns = ts.saturating_add(window_ns).saturating_sub(now).max(0);
                // Ceil to whole seconds.
                u64::try_from((free_in_ns + 999_999_999) / 1_000_000_000).unwrap_or(1)
            },
        ))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RateLimitError> {
        self.conn.lock().map_err(|_| RateLimitError::Storage {
            message: "rate limiter lock poisoned".to_string(),
        })
    }
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RateLimitPolicy> {
    let action: String = row.get(6)?;
    let action = action.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(6, "action".to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(RateLimitPolicy {
        policy_id: row.get(0)?,
        agent_id: row.get(1)?,
        resource: row.get(2)?,
        max_requests: u32::try_from(row.get::<_, i64>(3)?).unwrap_or(u32::MAX),
        window_seconds: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
        burst_allowance: u32::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
        action,
        enabled: row.get::<_, i64>(7)? != 0,
        created_at_ns: row.get(8)?,
        updated_at_ns: row.get(9)?,
    })
}

fn violation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RateLimitViolation> {
    let action: String = row.get(6)?;
    let action = action.parse().map_err(|_| {
        rusqlite::Error::InvalidColumnType(6, "action".to_string(), rusqlite::types::Type::Text)
    })?;
    Ok(RateLimitViolation {
        violation_id: row.get(0)?,
        policy_id: row.get(1)?,
        agent_id: row.get(2)?,
        resource: row.get(3)?,
        observed_count: u64::try_from(row.get::<_, i64>(4)?).unwrap_or(0),
        effective_limit: u64::try_from(row.get::<_, i64>(5)?).unwrap_or(0),
        action,
        occurred_at_ns: row.get(7)?,
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn storage_err(err: rusqlite::Error) -> RateLimitError {
    RateLimitError::Storage {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn limiter_with(spec: RateLimitPolicySpec) -> (RateLimiter, RateLimitPolicy) {
        let limiter = RateLimiter::in_memory().unwrap();
        let policy = limiter.create_policy(spec).unwrap();
        (limiter, policy)
    }

    #[test]
    fn test_exact_limit_boundary() {
        let (limiter, _) = limiter_with(RateLimitPolicySpec::new("a1", "api", 3, 60));

        for i in 0..3 {
            let outcome = limiter.check_rate_limit("a1", "api").unwrap();
            assert!(outcome.is_allowed(), "request {i} should be allowed");
        }

        match limiter.check_rate_limit("a1", "api").unwrap() {
            RateLimitOutcome::Violated {
                current_count,
                limit,
                remaining,
                action,
                ..
            } => {
                assert_eq!(current_count, 3);
                assert_eq!(limit, 3);
                assert_eq!(remaining, 0);
                assert_eq!(action, ViolationAction::Deny);
            },
            other => panic!("expected Violated, got {other:?}"),
        }
    }

    #[test]
    fn test_burst_allowance_extends_limit() {
        let (limiter, _) =
            limiter_with(RateLimitPolicySpec::new("a1", "api", 2, 60).burst_allowance(1));

        for _ in 0..3 {
            assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
        }
        assert!(!limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
    }

    #[test]
    fn test_no_policy_is_allowed() {
        let limiter = RateLimiter::in_memory().unwrap();
        let outcome = limiter.check_rate_limit("a1", "api").unwrap();
        assert_eq!(outcome, RateLimitOutcome::NoPolicy);
        assert!(outcome.is_allowed());
    }

    #[test]
    fn test_log_action_records_but_admits() {
        let (limiter, policy) = limiter_with(
            RateLimitPolicySpec::new("a1", "api", 1, 60).action(ViolationAction::Log),
        );

        assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());

        let outcome = limiter.check_rate_limit("a1", "api").unwrap();
        match &outcome {
            RateLimitOutcome::Violated { action, policy_id, .. } => {
                assert_eq!(*action, ViolationAction::Log);
                assert_eq!(policy_id, &policy.policy_id);
            },
            other => panic!("expected Violated, got {other:?}"),
        }
        assert!(outcome.is_allowed());

        let violations = limiter.get_violations(Some("a1"), 10).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].action, ViolationAction::Log);
    }

    #[test]
    fn test_headroom_reported_against_tightest_policy() {
        let limiter = RateLimiter::in_memory().unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a1", "api", 5, 60))
            .unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a1", "api", 3, 60))
            .unwrap();

        match limiter.check_rate_limit("a1", "api").unwrap() {
            RateLimitOutcome::Allowed {
                current_count,
                limit,
                remaining,
            } => {
                assert_eq!(current_count, 1);
                assert_eq!(limit, 3);
                assert_eq!(remaining, 2);
            },
            other => panic!("expected Allowed, got {other:?}"),
        }
    }

    #[test]
    fn test_any_violated_policy_denies() {
        let limiter = RateLimiter::in_memory().unwrap();
        let tight = limiter
            .create_policy(RateLimitPolicySpec::new("a1", "api", 2, 60))
            .unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a1", "api", 5, 60))
            .unwrap();

        assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
        assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());

        match limiter.check_rate_limit("a1", "api").unwrap() {
            RateLimitOutcome::Violated { policy_id, .. } => {
                assert_eq!(policy_id, tight.policy_id);
            },
            other => panic!("expected Violated, got {other:?}"),
        }
    }

    #[test]
    fn test_pairs_tracked_separately() {
        let limiter = RateLimiter::in_memory().unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a1", "api", 1, 60))
            .unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a2", "api", 1, 60))
            .unwrap();

        assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
        assert!(!limiter.check_rate_limit("a1", "api").unwrap().is_allowed());

        // a2 has its own counter.
        assert!(limiter.check_rate_limit("a2", "api").unwrap().is_allowed());
    }

    #[test]
    fn test_disabled_policy_is_ignored() {
        let (limiter, policy) = limiter_with(RateLimitPolicySpec::new("a1", "api", 1, 60));

        limiter
            .update_policy(
                &policy.policy_id,
                &RateLimitPolicyUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(
            limiter.check_rate_limit("a1", "api").unwrap(),
            RateLimitOutcome::NoPolicy
        );
    }

    #[test]
    fn test_window_expiry_frees_quota() {
        let (limiter, _) = limiter_with(RateLimitPolicySpec::new("a1", "api", 1, 1));

        assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
        assert!(!limiter.check_rate_limit("a1", "api").unwrap().is_allowed());

        thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
    }

    #[test]
    fn test_retry_after_is_at_least_one_second() {
        let (limiter, _) = limiter_with(RateLimitPolicySpec::new("a1", "api", 1, 60));

        limiter.check_rate_limit("a1", "api").unwrap();
        match limiter.check_rate_limit("a1", "api").unwrap() {
            RateLimitOutcome::Violated {
                retry_after_seconds, ..
            } => {
                assert!(retry_after_seconds >= 1);
                assert!(retry_after_seconds <= 60);
            },
            other => panic!("expected Violated, got {other:?}"),
        }
    }

    #[test]
    fn test_pruning_bounds_usage() {
        let (limiter, _) = limiter_with(RateLimitPolicySpec::new("a1", "api", 10, 1));

        limiter.check_rate_limit("a1", "api").unwrap();
        assert_eq!(limiter.usage_count("a1", "api").unwrap(), 1);

        // Wait past twice the window so the first timestamp is prunable.
        thread::sleep(Duration::from_millis(2100));
        limiter.check_rate_limit("a1", "api").unwrap();
        assert_eq!(limiter.usage_count("a1", "api").unwrap(), 1);
    }

    #[test]
    fn test_pruning_keeps_longer_window_data() {
        // A short-window policy must not prune timestamps the
        // long-window policy on the same pair still counts.
        let limiter = RateLimiter::in_memory().unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a1", "api", 10, 1))
            .unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a1", "api", 10, 60))
            .unwrap();

        limiter.check_rate_limit("a1", "api").unwrap();
        thread::sleep(Duration::from_millis(2100));
        limiter.check_rate_limit("a1", "api").unwrap();

        // Pruning horizon is twice the 60s window, so both rows survive.
        assert_eq!(limiter.usage_count("a1", "api").unwrap(), 2);
    }

    #[test]
    fn test_zero_max_requests_rejected() {
        let limiter = RateLimiter::in_memory().unwrap();
        let result = limiter.create_policy(RateLimitPolicySpec::new("a1", "api", 0, 60));
        assert!(matches!(result, Err(RateLimitError::InvalidPolicy { .. })));
    }

    #[test]
    fn test_zero_window_rejected() {
        let limiter = RateLimiter::in_memory().unwrap();
        let result = limiter.create_policy(RateLimitPolicySpec::new("a1", "api", 1, 0));
        assert!(matches!(result, Err(RateLimitError::InvalidPolicy { .. })));
    }

    #[test]
    fn test_update_unknown_policy_not_found() {
        let limiter = RateLimiter::in_memory().unwrap();
        let result = limiter.update_policy("missing", &RateLimitPolicyUpdate::default());
        assert!(matches!(result, Err(RateLimitError::PolicyNotFound { .. })));
    }

    #[test]
    fn test_update_cannot_zero_max_requests() {
        let (limiter, policy) = limiter_with(RateLimitPolicySpec::new("a1", "api", 3, 60));
        let result = limiter.update_policy(
            &policy.policy_id,
            &RateLimitPolicyUpdate {
                max_requests: Some(0),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(RateLimitError::InvalidPolicy { .. })));
    }

    #[test]
    fn test_list_policies_filters() {
        let limiter = RateLimiter::in_memory().unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a1", "api", 1, 60))
            .unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a1", "tools", 1, 60))
            .unwrap();
        limiter
            .create_policy(RateLimitPolicySpec::new("a2", "api", 1, 60))
            .unwrap();

        assert_eq!(limiter.list_policies(None, None).unwrap().len(), 3);
        assert_eq!(limiter.list_policies(Some("a1"), None).unwrap().len(), 2);
        assert_eq!(
            limiter.list_policies(Some("a1"), Some("api")).unwrap().len(),
            1
        );
        assert_eq!(limiter.list_policies(None, Some("api")).unwrap().len(), 2);
    }

    #[test]
    fn test_delete_policy() {
        let (limiter, policy) = limiter_with(RateLimitPolicySpec::new("a1", "api", 1, 60));
        limiter.delete_policy(&policy.policy_id).unwrap();
        assert!(matches!(
            limiter.get_policy(&policy.policy_id),
            Err(RateLimitError::PolicyNotFound { .. })
        ));
        assert!(matches!(
            limiter.delete_policy(&policy.policy_id),
            Err(RateLimitError::PolicyNotFound { .. })
        ));
    }

    #[test]
    fn test_reset_usage_frees_quota_but_keeps_violations() {
        let (limiter, _) = limiter_with(RateLimitPolicySpec::new("a1", "api", 1, 60));

        limiter.check_rate_limit("a1", "api").unwrap();
        limiter.check_rate_limit("a1", "api").unwrap(); // violation

        assert_eq!(limiter.reset_usage("a1", "api").unwrap(), 1);
        assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
        assert_eq!(limiter.get_violations(Some("a1"), 10).unwrap().len(), 1);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ratelimit.sqlite");

        {
            let limiter = RateLimiter::open(&path).unwrap();
            limiter
                .create_policy(RateLimitPolicySpec::new("a1", "api", 2, 60))
                .unwrap();
            limiter.check_rate_limit("a1", "api").unwrap();
        }

        let limiter = RateLimiter::open(&path).unwrap();
        // One request already counted from the previous process.
        assert!(limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
        assert!(!limiter.check_rate_limit("a1", "api").unwrap().is_allowed());
    }

    #[test]
    fn test_action_round_trip() {
        for action in [ViolationAction::Deny, ViolationAction::Throttle, ViolationAction::Log] {
            assert_eq!(action.as_str().parse::<ViolationAction>().unwrap(), action);
        }
        assert!("block".parse::<ViolationAction>().is_err());
    }
}
