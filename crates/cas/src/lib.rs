//! Content addressable storage for mountaintools.
//!
//! Blobs are immutable and named by the SHA-1 of their bytes. The store is
//! used by:
//! - **the key/value store**: values too large to keep inline
//! - **job dispatch**: processor inputs and output artifacts
//! - **the share server**: blobs pushed by remote clients
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use cas::{Address, ContentStore, FileStore};
//!
//! let store = FileStore::at_path("/data/mountaintools/sha1").unwrap();
//!
//! let address = store.save_bytes(b"Hello, World!", Some("hello.txt")).unwrap();
//! println!("Stored as: {}", address); // sha1://0a0a9f2a.../hello.txt
//!
//! let data = store.load(&address).unwrap();
//! let path = store.realize(&address).unwrap();
//! println!("{} bytes at {}", data.len(), path.display());
//! ```
//!
//! # Shared Storage
//!
//! The layout is safe on shared filesystems:
//! - Content is write-once (content-addressed = no conflicts)
//! - Writes land in `tmp/` first and are renamed into place
//! - No locking required

pub mod config;
pub mod error;
pub mod hash;
pub mod metadata;
pub mod store;

pub use config::CasConfig;
pub use error::CasError;
pub use hash::{Address, HashError, Sha1Hash, SHA1_SCHEME};
pub use metadata::BlobInfo;
pub use store::{ContentStore, FileStore};
