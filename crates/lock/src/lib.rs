pub mod lock_table;
pub mod owner;
pub mod session;

pub use lock_table::{LockMode, LockStats, LockTable};
pub use owner::Owner;
pub use session::OwnerSession;

pub(crate) type Result<T> = std::result::Result<T, readdb_error::Error>;
