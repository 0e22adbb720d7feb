//! # Tandem Client
//!
//! Runtime half of the Tandem local-first sync engine: the local store
//! adapter, the remote collection client, the sync scheduler and the
//! [`SyncEngine`] facade applications talk to.
//!
//! Data flows one way in and one way out. A save goes facade, local store
//! (immediately), scheduler (after a debounce), remote client. Remote data
//! goes remote client, merge, local store, change notification.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_client::{catalog, HttpRemote, LocalStore, FileBackend, SyncConfig, SyncEngine};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SyncConfig::default();
//! let store = Arc::new(LocalStore::new(Arc::new(FileBackend::open(&config.store_dir)?)));
//! let remote = HttpRemote::new("https://sync.example.com/rest/v1", config.request_timeout)?
//!     .with_token("token");
//!
//! let engine = SyncEngine::new(catalog::standard_schema(), store, Arc::new(remote), config);
//! engine.initialize_for_principal("user-1").await?;
//! println!("{:?}", engine.status());
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod local;
pub mod remote;
pub mod scheduler;
pub mod sync;

pub use config::{ConfigError, SyncConfig};
pub use error::{FailureKind, RemoteError, StorageError, SyncError};
pub use local::{
    ChangeEvent, ChangeOrigin, FileBackend, HandlerId, KeyValueBackend, LocalStore, MemoryBackend,
};
pub use remote::{HttpRemote, MemoryRemote, RemoteCall, RemoteCollection, RemoteOp, RemoteService};
pub use scheduler::{SchedulerState, SyncStatus};
pub use sync::SyncEngine;
