use crate::lock_table::{LockMode, LockTable};
use crate::owner::Owner;
use crate::Result;
use core::fmt;
use std::borrow::Borrow;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

/// An owner bound to a [`LockTable`] for the length of one unit of work.
///
/// Every lock taken through the session belongs to its owner. When the session
/// is dropped, whether the work returned normally, bailed out with an error or
/// panicked, all of those locks are released with [`LockTable::release_all`].
pub struct OwnerSession<'a, K>
where
    K: Eq + Hash + Debug,
{
    table: &'a LockTable<K>,
    owner: Owner,
}

impl<K> fmt::Debug for OwnerSession<'_, K>
where
    K: Eq + Hash + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerSession")
            .field("owner", &self.owner)
            .finish()
    }
}

impl<'a, K> OwnerSession<'a, K>
where
    K: Eq + Hash + Debug,
{
    /// Binds `owner` to `table`. Dropping the session releases everything `owner`
    /// holds in `table`, including locks taken outside the session.
    pub fn with_owner(table: &'a LockTable<K>, owner: Owner) -> Self {
        OwnerSession { table, owner }
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn table(&self) -> &'a LockTable<K> {
        self.table
    }

    pub fn read<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.table.acquire_read(self.owner, key)
    }

    /// Takes the write lock, upgrading in place if the session is the key's sole
    /// reader.
    pub fn write<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.table.acquire_write(self.owner, key)
    }

    pub fn try_read<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.table.try_acquire_read(self.owner, key)
    }

    pub fn try_write<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.table.try_acquire_write(self.owner, key)
    }

    pub fn read_timeout<Q>(&self, key: &Q, timeout: Duration) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.table.acquire_read_timeout(self.owner, key, timeout)
    }

    pub fn write_timeout<Q>(&self, key: &Q, timeout: Duration) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.table.acquire_write_timeout(self.owner, key, timeout)
    }

    pub async fn read_async<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.table.acquire_read_async(self.owner, key).await
    }

    pub async fn write_async<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ToOwned<Owned = K> + ?Sized,
    {
        self.table.acquire_write_async(self.owner, key).await
    }

    pub fn release_read<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        self.table.release_read(self.owner, key)
    }

    pub fn release_write<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + Debug + ?Sized,
    {
        self.table.release_write(self.owner, key)
    }

    /// Locks currently held by the session's owner.
    pub fn held(&self) -> Vec<(K, LockMode)>
    where
        K: Clone + Ord,
    {
        self.table.locks_held_by(self.owner)
    }

    /// Ends the session now and returns how many locks were released.
    pub fn finish(self) -> usize {
        // Drop runs afterwards and finds nothing left to release.
        self.table.release_all(self.owner)
    }
}

impl<K> Drop for OwnerSession<'_, K>
where
    K: Eq + Hash + Debug,
{
    fn drop(&mut self) {
        self.table.release_all(self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_session_releases_on_drop() {
        let table: LockTable = LockTable::new();
        let owner;
        {
            let session = table.session();
            owner = session.owner();
            session.read("f1");
            session.read("f2");
            session.write("f3");
            assert_eq!(
                session.held(),
                vec![
                    ("f1".to_string(), LockMode::Read),
                    ("f2".to_string(), LockMode::Read),
                    ("f3".to_string(), LockMode::Write),
                ]
            );
        }
        assert!(table.locks_held_by(owner).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_session_finish_reports_released() {
        let table: LockTable = LockTable::new();
        let session = table.session();
        session.read("f");
        session.write("f");
        session.write("g");
        assert_eq!(session.finish(), 3);
        assert!(table.is_empty());
    }

    #[test]
    fn test_session_leaves_other_owners_alone() {
        let table: LockTable = LockTable::new();
        let other = Owner::new();
        table.acquire_read(other, "f");

        {
            let session = table.session();
            session.read("f");
            assert!(!session.try_write("f"));
            session.release_read("f");
            assert_eq!(table.readers("f"), vec![other]);
            session.write("g");
        }

        assert_eq!(table.readers("f"), vec![other]);
        assert_eq!(table.writer("g"), None);
    }

    #[test]
    fn test_session_with_existing_owner() {
        let table: LockTable = LockTable::new();
        let owner = Owner::from_raw(7).unwrap();
        table.acquire_write(owner, "f");

        let session = OwnerSession::with_owner(&table, owner);
        assert!(session.try_write("f"));
        session.release_write("f");
        assert_eq!(table.writer("f"), None);
        assert!(session.try_read("f"));
        drop(session);

        assert!(!table.holds_read(owner, "f"));
    }

    #[test]
    fn test_session_released_after_panic() {
        let table: LockTable = LockTable::new();
        let mut owner = None;

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let session = table.session();
            owner = Some(session.owner());
            session.read("f1");
            session.write("f2");
            panic!("task aborted");
        }));

        assert!(result.is_err());
        let owner = owner.expect("session was started");
        assert!(table.locks_held_by(owner).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    #[serial]
    fn test_session_drop_wakes_waiters() {
        let table: Arc<LockTable> = Arc::new(LockTable::new());
        let session = table.session();
        session.read("f");

        let done = Arc::new(AtomicBool::new(false));
        let local_table = Arc::clone(&table);
        let local_done = Arc::clone(&done);
        let handle = thread::spawn(move || {
            let writer = local_table.session();
            writer
                .write_timeout("f", Duration::from_secs(10))
                .expect("writer timed out");
            local_done.store(true, Ordering::SeqCst);
            writer.finish()
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!done.load(Ordering::SeqCst));

        drop(session);
        assert_eq!(handle.join().expect("writer thread panicked"), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_session_timeouts() {
        let table: LockTable = LockTable::new();
        let holder = table.session();
        holder.write("f");

        let waiter = table.session();
        assert!(waiter.read_timeout("f", Duration::from_millis(10)).is_err());
        assert!(waiter.write_timeout("f", Duration::ZERO).is_err());
        assert!(waiter.held().is_empty());
    }

    #[tokio::test]
    async fn test_session_async() {
        let table: LockTable = LockTable::new();
        let session = table.session();
        session.read_async("f").await;
        session.write_async("f").await;
        assert_eq!(session.finish(), 2);
    }
}
