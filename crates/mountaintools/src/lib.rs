//! Client for mountaintools storage.
//!
//! [`MountainClient`] combines the local content store and key/value store
//! with an optional [`RemoteClient`] for a collection on a share server.
//! A [`Policy`] decides, per client, which of the four paths (local read,
//! local write, remote read, remote write) are in play.
//!
//! ```rust,no_run
//! # async fn demo() -> Result<(), mountaintools::ClientError> {
//! use mountaintools::{Key, MountainClient};
//! use serde_json::json;
//!
//! let client = MountainClient::open("/data/mountaintools")?;
//! let address = client.save_text("hello", Some("hello.txt")).await?;
//!
//! let key: Key = json!({"study": "synth", "recording": 3}).into();
//! client.set_value(&key, None, Some(json!(address.to_string())), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod remote;

pub use cas::{Address, BlobInfo, Sha1Hash};
pub use client::{MountainClient, CONTENT_FIELD, KEY_SCHEME, MAX_INLINE_BYTES};
pub use error::ClientError;
pub use kvstore::{Key, KvOp, ValueRecord};
pub use mtconfig::PolicyConfig as Policy;
pub use remote::RemoteClient;
