//! Admission-control engines for the agentgate platform.
//!
//! Before an agent-initiated action is allowed to execute it passes
//! through four independent engines, each owning one logical store and
//! exposing the shared contract "check/record an event for an identity,
//! return a decision":
//!
//! - [`idempotency`] — deduplicates externally-retried write requests so
//!   a side effect executes at most once.
//! - [`ratelimit`] — bounds request volume per (agent, resource) pair
//!   over rolling time windows.
//! - [`budget`] — accumulates monetary cost events per delegation token
//!   and classifies spend against a threshold ladder.
//! - [`policy`] — merges policy settings across a group-membership
//!   graph, most restrictive value per key.
//!
//! The engines never call each other. A host layer resolves an agent's
//! groups through the policy resolver, configures the rate limiter and
//! budget enforcer from the result, and consults the request ledger
//! around idempotent write endpoints. That composition — like
//! authentication and the HTTP surface itself — lives outside this
//! crate.
//!
//! # Concurrency
//!
//! Every operation is synchronous and request-driven. Each engine guards
//! its store with a single mutex held for the operation's full duration,
//! so operations on one engine instance are observed in lock-acquisition
//! order. There is no cross-engine locking and therefore no cross-engine
//! deadlock; callers composing engines must treat the composition as
//! non-atomic.
//!
//! # Storage
//!
//! The ledger, limiter, and budget engines persist to embedded `SQLite`
//! stores (see [`store`]) and survive process restart. The policy
//! resolver is in-memory by design. Storage failures propagate as
//! engine-unavailable errors; they are never converted into an allow or
//! deny decision.

pub mod budget;
pub mod config;
pub mod idempotency;
pub mod policy;
pub mod ratelimit;
pub mod store;
