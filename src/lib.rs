//! Offline-capable synchronization core for a Firestore-style document
//! database client.
//!
//! Writes are applied to a local cache immediately and queued for the backend;
//! queries are answered from the cache and kept current by a watch stream. The
//! layers, bottom up:
//!
//! * [`local`]: the key-value substrate, mutation queue, document and target
//!   caches, the local store and LRU garbage collection, plus the state shared
//!   between several instances using one store.
//! * [`remote`]: persistent watch/write streams, the watch change aggregator
//!   and the remote store.
//! * [`core`]: queries, views, the sync engine and the caller-facing
//!   [`core::FirestoreClient`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use futures::StreamExt;
//! use firestore_sync::core::{FirestoreClient, ListenOptions, Query};
//! use firestore_sync::model::{DatabaseId, DocumentKey, Mutation, ResourcePath};
//! use firestore_sync::remote::InMemoryConnection;
//! use firestore_sync::value::MapValue;
//!
//! # async fn run() -> firestore_sync::error::FirestoreResult<()> {
//! let (connection, _server) = InMemoryConnection::new();
//! let client = FirestoreClient::builder(DatabaseId::default("demo"), Arc::new(connection))
//!     .build()
//!     .await?;
//!
//! let rooms = Query::at_path(ResourcePath::from_string("rooms")?);
//! let mut snapshots = client.listen(rooms, ListenOptions::default()).await?;
//!
//! let key = DocumentKey::from_string("rooms/eros")?;
//! let pending = client.write(vec![Mutation::set(key, MapValue::empty())]);
//! let snapshot = snapshots.next().await;
//! # let _ = (pending, snapshot);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod platform;
pub mod remote;
pub mod settings;
pub mod util;
pub mod value;
