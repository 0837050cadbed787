//! Domain model for reminders and offline mutations.
//!
//! # Responsibility
//! - Define the records persisted by the store and exchanged with callers.
//! - Validate every write-path request before persistence.
//!
//! # Invariants
//! - Payloads are tagged variants keyed by `kind`; no untyped blobs.
//! - Timestamps are Unix epoch milliseconds.

pub mod calendar;
pub mod notification;
pub mod offline_task;
pub mod validation;
