//! Readdb: an owner-aware reader/writer lock table for named resources.
//!
//! Locks are held by an [`Owner`] rather than by a guard, so an owner can
//! re-request a lock it already holds, upgrade its sole read lock to a write
//! lock, and drop everything it holds in one [`LockTable::release_all`] call.
pub use readdb_error::{Error, Result};
pub use readdb_lock::{LockMode, LockStats, LockTable, Owner, OwnerSession};
