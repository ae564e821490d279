use crate::Result;
use readdb_error::errinput;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

/// Next id handed out by [`Owner::new`]. Zero is the null identity and is never issued.
static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

/// The identity a lock is held by.
///
/// Two requests come from the same holder iff they present equal `Owner`s. Ids
/// from [`Owner::new`] are unique within the process; ids adopted through
/// [`Owner::from_raw`] share that namespace, so callers mixing both must keep
/// their raw ids out of the generated range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Owner(NonZeroU64);

impl Owner {
    /// Allocates a fresh, process-unique owner.
    pub fn new() -> Self {
        let id = NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need 2^64 allocations to wrap.
        Owner(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    /// Adopts an externally assigned id, e.g. a server task number.
    pub fn from_raw(id: u64) -> Result<Self> {
        match NonZeroU64::new(id) {
            Some(id) => Ok(Owner(id)),
            None => errinput!("owner id 0 is the null identity"),
        }
    }

    pub fn id(&self) -> u64 {
        self.0.get()
    }
}

impl Default for Owner {
    fn default() -> Self {
        Owner::new()
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}
