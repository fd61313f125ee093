//! Idempotent request ledger.
//!
//! Deduplicates externally-retried write requests so a side effect
//! executes at most once. Callers reserve a key before executing the
//! underlying operation and finalize it with the response afterwards;
//! any duplicate arrival replays the stored response instead of
//! re-executing.
//!
//! # Protocol
//!
//! 1. `reserve(key, request_hash)` — first arrival inserts a pending
//!    reservation and returns [`ReserveOutcome::Reserved`]; the caller
//!    must proceed to execute the operation.
//! 2. A duplicate arrival while the original is still in flight returns
//!    [`ReserveOutcome::Pending`]; the caller must not execute and should
//!    tell the requester to retry later.
//! 3. `finalize(key, ...)` — stores the response and marks the
//!    reservation completed, exactly once.
//! 4. Any later `reserve` with the same hash returns
//!    [`ReserveOutcome::Completed`] with the stored response, verbatim.
//!
//! Reusing an idempotency key with a *different* request body is a client
//! error: `reserve` returns [`ReserveOutcome::Mismatch`] and the request
//! must be rejected, never silently executed under the cached result.
//!
//! # Atomicity
//!
//! Uniqueness is enforced by a single-row insert on the five-tuple
//! natural key. `INSERT ... ON CONFLICT DO NOTHING` reporting zero
//! changed rows *is* the duplicate signal — the insert attempt and the
//! conflict check are one storage-level operation, so there is no
//! read-then-write race window beyond the engine mutex itself.
//!
//! A worker that crashes between `reserve` and `finalize` leaves the key
//! pending until `clear` is called; retention is the caller's concern.

use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::{self, Migration, StoreError};

/// Response headers that describe the original HTTP hop, not the logical
/// response. Stripped before storage so replay does not leak stale
/// framing metadata.
const HOP_HEADERS: &[&str] = &[
    "date",
    "server",
    "content-length",
    "connection",
    "transfer-encoding",
];

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: "
        CREATE TABLE IF NOT EXISTS idempotency_reservations (
            tenant_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            method TEXT NOT NULL,
            route TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            request_hash TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            response_status INTEGER,
            response_content_type TEXT,
            response_headers TEXT,
            response_body BLOB,
            created_at_ns INTEGER NOT NULL,
            completed_at_ns INTEGER,
            PRIMARY KEY (tenant_id, actor, method, route, idempotency_key)
        );
    ",
}];

/// Errors from request-ledger operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IdempotencyError {
    /// A component of the reservation key is empty.
    #[error("invalid reservation key: {reason}")]
    InvalidKey {
        /// Which component was rejected and why.
        reason: String,
    },

    /// `finalize` or `get_reservation` referenced a key with no
    /// reservation row.
    #[error("no reservation exists for idempotency key '{idempotency_key}'")]
    NotFound {
        /// The idempotency key component of the missing reservation.
        idempotency_key: String,
    },

    /// `finalize` was called on a reservation that already completed.
    ///
    /// A completed reservation's response is immutable; a retried worker
    /// must not replace an already-replayable response.
    #[error("reservation for idempotency key '{idempotency_key}' is already completed")]
    AlreadyCompleted {
        /// The idempotency key component of the completed reservation.
        idempotency_key: String,
    },

    /// The underlying store failed.
    #[error("request ledger storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },
}

impl From<StoreError> for IdempotencyError {
    fn from(err: StoreError) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

/// The five-tuple natural key scoping one logical request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    /// Tenant the request belongs to.
    pub tenant_id: String,
    /// Authenticated caller identity (supplied by the upstream auth
    /// layer; this core trusts it).
    pub actor: String,
    /// HTTP method of the write endpoint.
    pub method: String,
    /// Route of the write endpoint.
    pub route: String,
    /// Caller-supplied idempotency key.
    pub idempotency_key: String,
}

impl RequestKey {
    /// Creates a new request key.
    #[must_use]
    pub fn new(
        tenant_id: impl Into<String>,
        actor: impl Into<String>,
        method: impl Into<String>,
        route: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor: actor.into(),
            method: method.into(),
            route: route.into(),
            idempotency_key: idempotency_key.into(),
        }
    }

    fn validate(&self) -> Result<(), IdempotencyError> {
        for (field, value) in [
            ("tenant_id", &self.tenant_id),
            ("actor", &self.actor),
            ("method", &self.method),
            ("route", &self.route),
            ("idempotency_key", &self.idempotency_key),
        ] {
            if value.is_empty() {
                return Err(IdempotencyError::InvalidKey {
                    reason: format!("{field} must not be empty"),
                });
            }
        }
        Ok(())
    }
}

/// A response captured at finalize time and replayed on duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    /// HTTP status code of the original response.
    pub status_code: u16,
    /// Content type of the original response, if any.
    pub content_type: Option<String>,
    /// Response headers, hop-specific entries already stripped.
    pub headers: Vec<(String, String)>,
    /// Response body, replayed byte-for-byte.
    pub body: Vec<u8>,
}

/// Lifecycle state of a reservation row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Reserved; the underlying operation has not finished.
    Pending,
    /// Finalized; the stored response is replayable.
    Completed,
}

impl ReservationStatus {
    /// Returns the string persisted in the status column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }
}

/// A reservation row, as returned by [`RequestLedger::get_reservation`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    /// The natural key of the reservation.
    pub key: RequestKey,
    /// Content fingerprint of the request body. Never changes after
    /// creation.
    pub request_hash: String,
    /// Current lifecycle state.
    pub status: ReservationStatus,
    /// The stored response, present once completed.
    pub response: Option<StoredResponse>,
    /// When the reservation was created (epoch nanoseconds).
    pub created_at_ns: i64,
    /// When the reservation completed, if it has.
    pub completed_at_ns: Option<i64>,
}

/// Outcome of a [`RequestLedger::reserve`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    /// First arrival: the caller holds the reservation and must execute
    /// the underlying operation.
    Reserved,
    /// Another attempt is in flight; do not execute, retry later.
    Pending,
    /// The key was reused with a different request hash; reject the
    /// request as a client conflict.
    Mismatch,
    /// The operation already completed; replay this response without
    /// re-executing anything.
    Completed(StoredResponse),
}

impl ReserveOutcome {
    /// Returns `true` if the caller should execute the underlying
    /// operation.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved)
    }
}

/// SHA-256 hex fingerprint of a request body.
///
/// Callers derive `request_hash` through this helper so that byte-equal
/// bodies always map to the same fingerprint.
#[must_use]
pub fn request_fingerprint(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// The idempotent request ledger engine.
///
/// One `SQLite` store, one mutex; every public operation holds the mutex
/// for its full duration.
pub struct RequestLedger {
    conn: Arc<Mutex<Connection>>,
}

impl RequestLedger {
    /// Opens (or creates) a ledger store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Storage`] if the store cannot be
    /// opened or migrated.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, IdempotencyError> {
        let conn = store::open_store(path, MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Opens an in-memory ledger (tests, ephemeral use).
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Storage`] if the store cannot be
    /// opened or migrated.
    pub fn in_memory() -> Result<Self, IdempotencyError> {
        let conn = store::open_in_memory(MIGRATIONS)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Reserves `key` for execution, or reports why it cannot be
    /// reserved.
    ///
    /// See the module docs for the full protocol. The mismatch check
    /// takes precedence over the pending/completed distinction: a reused
    /// key with a different hash is always a conflict.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::InvalidKey`] for an empty key
    /// component and [`IdempotencyError::Storage`] if the store fails.
    pub fn reserve(
        &self,
        key: &RequestKey,
        request_hash: &str,
    ) -> Result<ReserveOutcome, IdempotencyError> {
        key.validate()?;
        if request_hash.is_empty() {
            return Err(IdempotencyError::InvalidKey {
                reason: "request_hash must not be empty".to_string(),
            });
        }

        let conn = self.lock()?;
        let inserted = conn
            .execute(
                "INSERT INTO idempotency_reservations
                 (tenant_id, actor, method, route, idempotency_key,
                  request_hash, status, created_at_ns)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)
                 ON CONFLICT(tenant_id, actor, method, route, idempotency_key)
                 DO NOTHING",
                params![
                    key.tenant_id,
                    key.actor,
                    key.method,
                    key.route,
                    key.idempotency_key,
                    request_hash,
                    store::now_ns(),
                ],
            )
            .map_err(storage_err)?;

        if inserted == 1 {
            return Ok(ReserveOutcome::Reserved);
        }

        // The row already exists; read it to decide what to tell the
        // caller.
        let existing = Self::read_reservation(&conn, key)?.ok_or_else(|| {
            IdempotencyError::Storage {
                message: "reservation row vanished between insert and read".to_string(),
            }
        })?;

        if existing.request_hash != request_hash {
            tracing::warn!(
                tenant_id = %key.tenant_id,
                actor = %key.actor,
                idempotency_key = %key.idempotency_key,
                "idempotency key reused with a different request hash"
            );
            return Ok(ReserveOutcome::Mismatch);
        }

        match existing.status {
            ReservationStatus::Pending => Ok(ReserveOutcome::Pending),
            ReservationStatus::Completed => {
                let response = existing.response.ok_or_else(|| IdempotencyError::Storage {
                    message: "completed reservation has no stored response".to_string(),
                })?;
                Ok(ReserveOutcome::Completed(response))
            },
        }
    }

    /// Transitions a pending reservation to completed, storing the
    /// response to replay on future duplicates.
    ///
    /// Hop-specific headers (`date`, `server`, `content-length`,
    /// `connection`, `transfer-encoding`) are stripped before storage.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::NotFound`] if no reservation exists
    /// for `key` and [`IdempotencyError::AlreadyCompleted`] if the
    /// reservation already completed.
    pub fn finalize(
        &self,
        key: &RequestKey,
        status_code: u16,
        content_type: Option<&str>,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<(), IdempotencyError> {
        key.validate()?;

        let stored_headers: Vec<(String, String)> = headers
            .iter()
            .filter(|(name, _)| {
                !HOP_HEADERS.contains(&name.to_ascii_lowercase().as_str())
            })
            .cloned()
            .collect();
        let headers_json =
            serde_json::to_string(&stored_headers).map_err(|e| IdempotencyError::Storage {
                message: format!("failed to encode response headers: {e}"),
            })?;

        let conn = self.lock()?;
        let existing = Self::read_reservation(&conn, key)?.ok_or_else(|| {
            IdempotencyError::NotFound {
                idempotency_key: key.idempotency_key.clone(),
            }
        })?;
        if existing.status == ReservationStatus::Completed {
            return Err(IdempotencyError::AlreadyCompleted {
                idempotency_key: key.idempotency_key.clone(),
            });
        }

        conn.execute(
            "UPDATE idempotency_reservations
             SET status = 'completed',
                 response_status = ?1,
                 response_content_type = ?2,
                 response_headers = ?3,
                 response_body = ?4,
                 completed_at_ns = ?5
             WHERE tenant_id = ?6 AND actor = ?7 AND method = ?8
               AND route = ?9 AND idempotency_key = ?10",
            params![
                i64::from(status_code),
                content_type,
                headers_json,
                body,
                store::now_ns(),
                key.tenant_id,
                key.actor,
                key.method,
                key.route,
                key.idempotency_key,
            ],
        )
        .map_err(storage_err)?;

        tracing::debug!(
            tenant_id = %key.tenant_id,
            idempotency_key = %key.idempotency_key,
            status_code,
            "reservation finalized"
        );
        Ok(())
    }

    /// Deletes the reservation row for `key`.
    ///
    /// Used to unblock tests or administrative retries (a crashed worker
    /// leaves its key pending forever otherwise). Returns `true` if a row
    /// was deleted.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Storage`] if the store fails.
    pub fn clear(&self, key: &RequestKey) -> Result<bool, IdempotencyError> {
        key.validate()?;
        let conn = self.lock()?;
        let deleted = conn
            .execute(
                "DELETE FROM idempotency_reservations
                 WHERE tenant_id = ?1 AND actor = ?2 AND method = ?3
                   AND route = ?4 AND idempotency_key = ?5",
                params![
                    key.tenant_id,
                    key.actor,
                    key.method,
                    key.route,
                    key.idempotency_key,
                ],
            )
            .map_err(storage_err)?;
        Ok(deleted > 0)
    }

    /// Returns the reservation row for `key`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Storage`] if the store fails.
    pub fn get_reservation(
        &self,
        key: &RequestKey,
    ) -> Result<Option<Reservation>, IdempotencyError> {
        key.validate()?;
        let conn = self.lock()?;
        Self::read_reservation(&conn, key)
    }

    fn read_reservation(
        conn: &Connection,
        key: &RequestKey,
    ) -> Result<Option<Reservation>, IdempotencyError> {
        conn.query_row(
            "SELECT request_hash, status, response_status, response_content_type,
                    response_headers, response_body, created_at_ns, completed_at_ns
             FROM idempotency_reservations
             WHERE tenant_id = ?1 AND actor = ?2 AND method = ?3
               AND route = ?4 AND idempotency_key = ?5",
            params![
                key.tenant_id,
                key.actor,
                key.method,
                key.route,
                key.idempotency_key,
            ],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<Vec<u8>>>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                ))
            },
        )
        .optional()
        .map_err(storage_err)?
        .map(
            |(hash, status, resp_status, content_type, headers_json, body, created, completed)| {
                let status = match status.as_str() {
                    "completed" => ReservationStatus::Completed,
                    _ => ReservationStatus::Pending,
                };
                let response = match (status, resp_status) {
                    (ReservationStatus::Completed, Some(code)) => {
                        let headers: Vec<(String, String)> = headers_json
                            .as_deref()
                            .map(serde_json::from_str)
                            .transpose()
                            .map_err(|e| IdempotencyError::Storage {
                                message: format!("failed to decode stored headers: {e}"),
                            })?
                            .unwrap_or_default();
                        Some(StoredResponse {
                            status_code: u16::try_from(code).unwrap_or(u16::MAX),
                            content_type,
                            headers,
                            body: body.unwrap_or_default(),
                        })
                    },
                    _ => None,
                };
                Ok(Reservation {
                    key: key.clone(),
                    request_hash: hash,
                    status,
                    response,
                    created_at_ns: created,
                    completed_at_ns: completed,
                })
            },
        )
        .transpose()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, IdempotencyError> {
        self.conn.lock().map_err(|_| IdempotencyError::Storage {
            message: "request ledger lock poisoned".to_string(),
        })
    }
}

fn storage_err(err: rusqlite::Error) -> IdempotencyError {
    IdempotencyError::Storage {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(idem: &str) -> RequestKey {
        RequestKey::new("tenant-1", "agent-a", "POST", "/v1/actions", idem)
    }

    #[test]
    fn test_first_reserve_is_reserved() {
        let ledger = RequestLedger::in_memory().unwrap();
        let outcome = ledger.reserve(&test_key("k1"), "hash-1").unwrap();
        assert_eq!(outcome, ReserveOutcome::Reserved);
        assert!(outcome.is_reserved());
    }

    #[test]
    fn test_duplicate_while_pending() {
        let ledger = RequestLedger::in_memory().unwrap();
        let key = test_key("k1");

        assert_eq!(ledger.reserve(&key, "hash-1").unwrap(), ReserveOutcome::Reserved);
        assert_eq!(ledger.reserve(&key, "hash-1").unwrap(), ReserveOutcome::Pending);
    }

    #[test]
    fn test_hash_mismatch_is_conflict() {
        let ledger = RequestLedger::in_memory().unwrap();
        let key = test_key("k1");

        ledger.reserve(&key, "hash-1").unwrap();
        assert_eq!(ledger.reserve(&key, "hash-2").unwrap(), ReserveOutcome::Mismatch);

        // Mismatch also wins after completion.
        ledger.finalize(&key, 201, Some("application/json"), &[], b"{}").unwrap();
        assert_eq!(ledger.reserve(&key, "hash-2").unwrap(), ReserveOutcome::Mismatch);
    }

    #[test]
    fn test_replay_is_byte_exact_and_repeatable() {
        let ledger = RequestLedger::in_memory().unwrap();
        let key = test_key("k1");
        let body = br#"{"id":"act-42","state":"created"}"#;

        assert!(ledger.reserve(&key, "hash-1").unwrap().is_reserved());
        ledger
            .finalize(
                &key,
                201,
                Some("application/json"),
                &[("x-request-id".to_string(), "r-1".to_string())],
                body,
            )
            .unwrap();

        for _ in 0..5 {
            match ledger.reserve(&key, "hash-1").unwrap() {
                ReserveOutcome::Completed(response) => {
                    assert_eq!(response.status_code, 201);
                    assert_eq!(response.content_type.as_deref(), Some("application/json"));
                    assert_eq!(response.body, body.to_vec());
                    assert_eq!(
                        response.headers,
                        vec![("x-request-id".to_string(), "r-1".to_string())]
                    );
                },
                other => panic!("expected Completed, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_hop_headers_stripped() {
        let ledger = RequestLedger::in_memory().unwrap();
        let key = test_key("k1");

        ledger.reserve(&key, "hash-1").unwrap();
        ledger
            .finalize(
                &key,
                200,
                None,
                &[
                    ("Date".to_string(), "Tue, 04 Aug 2026 10:00:00 GMT".to_string()),
                    ("Server".to_string(), "agentgate".to_string()),
                    ("Content-Length".to_string(), "2".to_string()),
                    ("x-trace".to_string(), "t-9".to_string()),
                ],
                b"ok",
            )
            .unwrap();

        match ledger.reserve(&key, "hash-1").unwrap() {
            ReserveOutcome::Completed(response) => {
                assert_eq!(response.headers, vec![("x-trace".to_string(), "t-9".to_string())]);
            },
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn test_finalize_unknown_key_is_not_found() {
        let ledger = RequestLedger::in_memory().unwrap();
        let result = ledger.finalize(&test_key("missing"), 200, None, &[], b"");
        assert!(matches!(result, Err(IdempotencyError::NotFound { .. })));
    }

    #[test]
    fn test_finalize_twice_is_conflict() {
        let ledger = RequestLedger::in_memory().unwrap();
        let key = test_key("k1");

        ledger.reserve(&key, "hash-1").unwrap();
        ledger.finalize(&key, 200, None, &[], b"first").unwrap();

        let result = ledger.finalize(&key, 200, None, &[], b"second");
        assert!(matches!(result, Err(IdempotencyError::AlreadyCompleted { .. })));

        // The first response is untouched.
        match ledger.reserve(&key, "hash-1").unwrap() {
            ReserveOutcome::Completed(response) => assert_eq!(response.body, b"first".to_vec()),
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn test_clear_unblocks_key() {
        let ledger = RequestLedger::in_memory().unwrap();
        let key = test_key("k1");

        ledger.reserve(&key, "hash-1").unwrap();
        assert!(ledger.clear(&key).unwrap());
        assert!(!ledger.clear(&key).unwrap());

        // Fresh reservation after clear.
        assert_eq!(ledger.reserve(&key, "hash-2").unwrap(), ReserveOutcome::Reserved);
    }

    #[test]
    fn test_keys_are_scoped_by_tuple() {
        let ledger = RequestLedger::in_memory().unwrap();

        ledger.reserve(&test_key("k1"), "hash-1").unwrap();

        // Same idempotency key, different route: independent reservation.
        let other = RequestKey::new("tenant-1", "agent-a", "POST", "/v1/other", "k1");
        assert_eq!(ledger.reserve(&other, "hash-1").unwrap(), ReserveOutcome::Reserved);
    }

    #[test]
    fn test_empty_key_component_rejected() {
        let ledger = RequestLedger::in_memory().unwrap();
        let key = RequestKey::new("tenant-1", "agent-a", "POST", "/v1/actions", "");
        assert!(matches!(
            ledger.reserve(&key, "hash-1"),
            Err(IdempotencyError::InvalidKey { .. })
        ));
    }

    #[test]
    fn test_get_reservation_reports_state() {
        let ledger = RequestLedger::in_memory().unwrap();
        let key = test_key("k1");

        assert!(ledger.get_reservation(&key).unwrap().is_none());

        ledger.reserve(&key, "hash-1").unwrap();
        let pending = ledger.get_reservation(&key).unwrap().unwrap();
        assert_eq!(pending.status, ReservationStatus::Pending);
        assert_eq!(pending.request_hash, "hash-1");
        assert!(pending.response.is_none());

        ledger.finalize(&key, 204, None, &[], b"").unwrap();
        let completed = ledger.get_reservation(&key).unwrap().unwrap();
        assert_eq!(completed.status, ReservationStatus::Completed);
        assert!(completed.completed_at_ns.is_some());
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.sqlite");
        let key = test_key("k1");

        {
            let ledger = RequestLedger::open(&path).unwrap();
            ledger.reserve(&key, "hash-1").unwrap();
            ledger.finalize(&key, 200, None, &[], b"persisted").unwrap();
        }

        let ledger = RequestLedger::open(&path).unwrap();
        match ledger.reserve(&key, "hash-1").unwrap() {
            ReserveOutcome::Completed(response) => {
                assert_eq!(response.body, b"persisted".to_vec());
            },
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[test]
    fn test_request_fingerprint_is_stable() {
        let a = request_fingerprint(b"hello");
        let b = request_fingerprint(b"hello");
        let c = request_fingerprint(b"hello!");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
