use crate::owner::Owner;
use crate::session::OwnerSession;
use crate::Result;
use readdb_error::errtimeout;
use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::pin::pin;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// The kind of lock an owner holds on a key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    Read,
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Read => f.write_str("read"),
            LockMode::Write => f.write_str("write"),
        }
    }
}

/// Point-in-time counters over a [`LockTable`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Keys with at least one reader.
    pub read_locked_keys: usize,
    /// Keys with a writer.
    pub write_locked_keys: usize,
    /// Reader entries summed over all keys.
    pub read_locks: usize,
}

/// Outcome of a single grant attempt made inside the critical section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Attempt {
    /// The owner already held this kind of lock; nothing changed.
    AlreadyHeld,
    /// The lock was granted by this attempt.
    Acquired,
    /// Another owner is in the way.
    Blocked,
}

/// The reader sets and writer slots. Both maps are only ever touched together,
/// under the table's single mutex.
#[derive(Debug)]
struct LockState<K> {
    readers: HashMap<K, HashSet<Owner>>,
    writers: HashMap<K, Owner>,
}

impl<K: Eq + Hash> LockState<K> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            readers: HashMap::with_capacity(capacity),
            writers: HashMap::with_capacity(capacity),
        }
    }

    fn is_reader<Q>(&self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.readers
            .get(key)
            .is_some_and(|owners| owners.contains(&owner))
    }

    fn is_writer<Q>(&self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.writers.get(key) == Some(&owner)
    }

    /// Readers are admitted whenever nobody holds the write lock.
    fn read_available<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        !self.writers.contains_key(key)
    }

    /// A writer is admitted when the key is free, or when the only reader is the
    /// writer itself (self-upgrade).
    fn write_available<Q>(&self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if self.writers.contains_key(key) {
            return false;
        }
        match self.readers.get(key) {
            None => true,
            Some(owners) => owners.len() == 1 && owners.contains(&owner),
        }
    }

    fn try_read<Q>(&mut self, owner: Owner, key: &Q) -> Attempt
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if self.is_reader(owner, key) {
            return Attempt::AlreadyHeld;
        }
        if !self.read_available(key) {
            return Attempt::Blocked;
        }
        match self.readers.get_mut(key) {
            Some(owners) => {
                owners.insert(owner);
            }
            None => {
                self.readers.insert(key.to_owned(), HashSet::from([owner]));
            }
        }
        Attempt::Acquired
    }

    fn try_write<Q>(&mut self, owner: Owner, key: &Q) -> Attempt
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        if self.is_writer(owner, key) {
            return Attempt::AlreadyHeld;
        }
        if !self.write_available(owner, key) {
            return Attempt::Blocked;
        }
        self.writers.insert(key.to_owned(), owner);
        Attempt::Acquired
    }

    fn attempt<Q>(&mut self, mode: LockMode, owner: Owner, key: &Q) -> Attempt
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
    {
        match mode {
            LockMode::Read => self.try_read(owner, key),
            LockMode::Write => self.try_write(owner, key),
        }
    }

    /// Removes `owner` from the key's reader set, dropping the set once empty.
    fn remove_reader<Q>(&mut self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(owners) = self.readers.get_mut(key) else {
            return false;
        };
        let removed = owners.remove(&owner);
        let now_empty = owners.is_empty();
        if now_empty {
            self.readers.remove(key);
        }
        removed
    }

    fn remove_writer<Q>(&mut self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if !self.is_writer(owner, key) {
            return false;
        }
        self.writers.remove(key);
        true
    }

    /// Strips every lock of `owner` and returns how many were removed.
    fn remove_owner(&mut self, owner: Owner) -> usize {
        let writers_before = self.writers.len();
        self.writers.retain(|_, writer| *writer != owner);
        let mut released = writers_before - self.writers.len();

        self.readers.retain(|_, owners| {
            if owners.remove(&owner) {
                released += 1;
            }
            !owners.is_empty()
        });
        released
    }
}

/// A table of reader/writer locks keyed by resource name and held by [`Owner`]s.
///
/// Unlike [`std::sync::RwLock`], a lock here belongs to an owner rather than to a
/// guard:
/// - re-acquiring a lock the owner already holds returns immediately;
/// - the sole reader of a key may take its write lock without releasing the read
///   lock first (self-upgrade);
/// - [`LockTable::release_all`] drops every lock of an owner in one call.
///
/// Keys only occupy the table while some owner holds a lock on them. There is no
/// fairness among waiters, and a writer can starve behind a steady stream of
/// readers. Lock-order deadlocks between owners are not detected.
pub struct LockTable<K = String> {
    state: Mutex<LockState<K>>,
    /// Signalled after every release that changed the table.
    released: Condvar,
    /// Async counterpart of `released`.
    notify: Notify,
}

impl<K: Debug> Debug for LockTable<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockTable")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl<K: Eq + Hash + Debug> Default for LockTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Debug> LockTable<K> {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Creates an empty lock table with room for `capacity` locked keys before
    /// its maps reallocate.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(LockState::with_capacity(capacity)),
            released: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Starts a session for a freshly allocated owner. Every lock taken through
    /// the session is released when it is dropped.
    pub fn session(&self) -> OwnerSession<'_, K> {
        OwnerSession::with_owner(self, Owner::new())
    }

    /// Locks the table state.
    ///
    /// Every critical section leaves both maps consistent before it can panic, so a
    /// poisoned mutex still guards valid state and is recovered rather than
    /// propagated. Cleanup after a panicking task must keep working.
    fn state(&self) -> MutexGuard<'_, LockState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_waiters(&self) {
        self.released.notify_all();
        self.notify.notify_waiters();
    }

    /// Blocks until `owner` holds a read lock on `key`.
    ///
    /// Returns immediately if `owner` already reads `key`. Otherwise waits until no
    /// owner holds the write lock on `key`. This includes `owner` itself: holding
    /// the write lock does not imply holding the read lock.
    pub fn acquire_read<Q>(&self, owner: Owner, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.acquire(LockMode::Read, owner, key)
    }

    /// Blocks until `owner` holds the write lock on `key`.
    ///
    /// Returns immediately if `owner` already writes `key`. Otherwise waits until
    /// no other owner writes `key` and no owner other than `owner` reads it.
    pub fn acquire_write<Q>(&self, owner: Owner, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.acquire(LockMode::Write, owner, key)
    }

    /// Takes a read lock only if that is possible without waiting. Returns whether
    /// `owner` holds the read lock afterwards.
    pub fn try_acquire_read<Q>(&self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.try_acquire(LockMode::Read, owner, key)
    }

    /// Takes the write lock only if that is possible without waiting. Returns
    /// whether `owner` holds the write lock afterwards.
    pub fn try_acquire_write<Q>(&self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.try_acquire(LockMode::Write, owner, key)
    }

    /// Like [`LockTable::acquire_read`], but gives up with [`readdb_error::Error::Timeout`]
    /// after `timeout`. The table is left untouched on timeout.
    pub fn acquire_read_timeout<Q>(&self, owner: Owner, key: &Q, timeout: Duration) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.acquire_timeout(LockMode::Read, owner, key, timeout)
    }

    /// Like [`LockTable::acquire_write`], but gives up with [`readdb_error::Error::Timeout`]
    /// after `timeout`. The table is left untouched on timeout.
    pub fn acquire_write_timeout<Q>(&self, owner: Owner, key: &Q, timeout: Duration) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.acquire_timeout(LockMode::Write, owner, key, timeout)
    }

    /// Async form of [`LockTable::acquire_read`]. Suspends the task instead of the
    /// thread. Dropping the future abandons the wait.
    pub async fn acquire_read_async<Q>(&self, owner: Owner, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.acquire_async(LockMode::Read, owner, key).await
    }

    /// Async form of [`LockTable::acquire_write`]. Suspends the task instead of the
    /// thread. Dropping the future abandons the wait.
    pub async fn acquire_write_async<Q>(&self, owner: Owner, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.acquire_async(LockMode::Write, owner, key).await
    }

    /// Releases `owner`'s read lock on `key`. A no-op if it holds none.
    pub fn release_read<Q>(&self, owner: Owner, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        let removed = self.state().remove_reader(owner, key);
        if removed {
            trace!(%owner, ?key, mode = %LockMode::Read, "lock released");
            self.wake_waiters();
        }
    }

    /// Releases `owner`'s write lock on `key`. A no-op if it is not the writer.
    ///
    /// A read lock kept across a self-upgrade stays held.
    pub fn release_write<Q>(&self, owner: Owner, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        let removed = self.state().remove_writer(owner, key);
        if removed {
            trace!(%owner, ?key, mode = %LockMode::Write, "lock released");
            self.wake_waiters();
        }
    }

    /// Releases every read and write lock held by `owner`, on every key, in a
    /// single critical section. Returns the number of locks released.
    ///
    /// Meant to run whenever a task finishes, whether it succeeded or not.
    pub fn release_all(&self, owner: Owner) -> usize {
        let released = self.state().remove_owner(owner);
        if released > 0 {
            debug!(%owner, released, "released all locks");
            self.wake_waiters();
        }
        released
    }

    /// Current readers of `key`, ordered by owner id.
    pub fn readers<Q>(&self, key: &Q) -> Vec<Owner>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut owners: Vec<Owner> = self
            .state()
            .readers
            .get(key)
            .map(|owners| owners.iter().copied().collect())
            .unwrap_or_default();
        owners.sort_unstable();
        owners
    }

    /// Current writer of `key`, if any.
    pub fn writer<Q>(&self, key: &Q) -> Option<Owner>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state().writers.get(key).copied()
    }

    pub fn holds_read<Q>(&self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state().is_reader(owner, key)
    }

    pub fn holds_write<Q>(&self, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.state().is_writer(owner, key)
    }

    /// Every lock `owner` holds, ordered by key and then read before write.
    pub fn locks_held_by(&self, owner: Owner) -> Vec<(K, LockMode)>
    where
        K: Clone + Ord,
    {
        let state = self.state();
        let mut held: Vec<(K, LockMode)> = state
            .readers
            .iter()
            .filter(|(_, owners)| owners.contains(&owner))
            .map(|(key, _)| (key.clone(), LockMode::Read))
            .chain(
                state
                    .writers
                    .iter()
                    .filter(|(_, writer)| **writer == owner)
                    .map(|(key, _)| (key.clone(), LockMode::Write)),
            )
            .collect();
        drop(state);
        held.sort_unstable();
        held
    }

    /// Returns true if no owner holds any lock.
    pub fn is_empty(&self) -> bool {
        let state = self.state();
        state.readers.is_empty() && state.writers.is_empty()
    }

    pub fn stats(&self) -> LockStats {
        let state = self.state();
        LockStats {
            read_locked_keys: state.readers.len(),
            write_locked_keys: state.writers.len(),
            read_locks: state.readers.values().map(HashSet::len).sum(),
        }
    }

    fn try_acquire<Q>(&self, mode: LockMode, owner: Owner, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        match self.state().attempt(mode, owner, key) {
            Attempt::AlreadyHeld => true,
            Attempt::Acquired => {
                trace!(%owner, ?key, %mode, "lock acquired");
                true
            }
            Attempt::Blocked => false,
        }
    }

    fn acquire<Q>(&self, mode: LockMode, owner: Owner, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        let mut state = self.state();
        loop {
            match state.attempt(mode, owner, key) {
                Attempt::AlreadyHeld => return,
                Attempt::Acquired => break,
                // The wait releases the mutex; the grant rule is re-checked on wake-up.
                Attempt::Blocked => {
                    state = self
                        .released
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
        drop(state);
        trace!(%owner, ?key, %mode, "lock acquired");
    }

    fn acquire_timeout<Q>(
        &self,
        mode: LockMode,
        owner: Owner,
        key: &Q,
        timeout: Duration,
    ) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        // A timeout too large to represent as an instant waits forever.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state();
        loop {
            match state.attempt(mode, owner, key) {
                Attempt::AlreadyHeld => return Ok(()),
                Attempt::Acquired => break,
                Attempt::Blocked => match deadline {
                    None => {
                        state = self
                            .released
                            .wait(state)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            drop(state);
                            debug!(%owner, ?key, %mode, ?timeout, "lock acquisition timed out");
                            return errtimeout!(
                                "{mode} lock on {key:?} for {owner} not granted within {timeout:?}"
                            );
                        }
                        state = match self.released.wait_timeout(state, remaining) {
                            Ok((state, _)) => state,
                            Err(poisoned) => poisoned.into_inner().0,
                        };
                    }
                },
            }
        }
        drop(state);
        trace!(%owner, ?key, %mode, "lock acquired");
        Ok(())
    }

    async fn acquire_async<Q>(&self, mode: LockMode, owner: Owner, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        loop {
            // Register for wake-ups before checking, so a release that lands between
            // the check and the await is not missed.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let attempt = self.state().attempt(mode, owner, key);
            match attempt {
                Attempt::AlreadyHeld => return,
                Attempt::Acquired => {
                    trace!(%owner, ?key, %mode, "lock acquired");
                    return;
                }
                Attempt::Blocked => notified.await,
            }
        }
    }
}
