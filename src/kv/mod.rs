//! A module for the distributed `Key`, `Value` directory (the DKV) that holds
//! every column, chunk, frame and cached statistic of a cloud in memory.
//!
//! Each node of a cloud runs one `KVStore`. A `Key` names the node that is
//! the `home` of its value: the home keeps the one authoritative copy and
//! every other node keeps a least-recently-used cache of the values it has
//! fetched. Values are stored as serialized blobs (a `Value` aka a `Vec<u8>`)
//! and deserialized into the requested type on `get`.
//!
//! ## Provided `KVStore` Functionality
//! - `get`: retrieve a value from the home node, or from this node's cache.
//!   Absent keys yield `Ok(None)`.
//! - `put`: publish or replace a value at its home. The write is visible to
//!   the writer as soon as `put` returns; other nodes drop their cached copy
//!   when the home broadcasts an invalidation.
//! - `remove`: delete a value at its home and invalidate cached copies.
//!
//! ## Message Processing
//!
//! The `KVStore` processes messages from its channel by doing the following:
//! 1. Asynchronously await new frames from the `Network`
//! 2. Spawn an asynchronous `tokio::task` to respond to the newly received
//!    message so as to not block further message processing.
//! 3. Based on the message type, do the following:
//!    - `Get` message: respond with a `Data` message holding the value, if
//!      any.
//!    - `Put`/`Remove` message: update our data, tell every other node to
//!      invalidate its cached copy and respond with an `Ack`.
//!    - `Invalidate` message: drop the key from our cache.
//!    - `Data`/`Ack` message: hand the reply to the request awaiting it.
use crate::network::Network;
use lru::LruCache;
use rand::{self, Rng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use tokio::sync::{oneshot, Mutex, RwLock};

mod kv_store;

/// A `Key` defines where in a `KVStore` a `Value` is stored, as well as
/// which node (and thus which `KVStore`) 'owns' the `Value`
#[derive(
    PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Debug, Clone,
)]
pub struct Key {
    /// Defines where in a `KVStore` a value is stored
    pub name: String,
    /// Defines which node 'owns' the associated `Value`
    pub home: usize,
}

/// A serialized blob of data. Is associated with a `Key` which defines where
/// this `Value` is stored in a `KVStore`, as well as its 'owner'
pub type Value = Vec<u8>;

impl Key {
    /// Creates a new `Key` that is owned by the `KVStore` running on the node
    /// with id `home`.
    pub fn new(name: &str, home: usize) -> Self {
        Key {
            name: String::from(name),
            home,
        }
    }

    /// Make a key with an automatically generated, unique name starting with
    /// `prefix`
    pub fn generate(prefix: &str, home: usize) -> Self {
        let mut rng = rand::thread_rng();
        Key {
            name: format!("{}-{}-{:016x}", prefix, home, rng.gen::<u64>()),
            home,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.home)
    }
}

/// One node's shard of the directory.
///
/// A `KVStore` is always used through an `Arc<KVStore>` handle that is passed
/// explicitly to whatever needs directory access.
pub struct KVStore {
    /// The data owned by this `KVStore`
    data: RwLock<HashMap<Key, Value>>,
    /// Values fetched from other nodes
    cache: Mutex<Cache>,
    /// The `network` layer, used to send messages to other `KVStore`s
    network: Network,
    /// Requests sent by this `KVStore` that are awaiting a reply, by
    /// message id
    pending: Mutex<HashMap<usize, oneshot::Sender<KVMessage>>>,
    /// The id of the next message sent by this `KVStore`
    msg_id: AtomicUsize,
    /// The `id` of the node this `KVStore` is running on
    pub(crate) id: usize,
    /// The total amount of memory (in bytes) this `KVStore` is allowed
    /// to keep in its cache
    max_cache_size: u64,
}

/// An `LRU` cache of serialized values that belong to other nodes, bounded
/// by the total size of the cached blobs
struct Cache {
    entries: LruCache<Key, Value>,
    size: u64,
    /// Bumped by every invalidation. A value fetched by a request that was
    /// sent in an earlier epoch may already be stale and is not cached.
    epoch: u64,
}

/// Represents the kind of messages that can be sent between distributed
/// `KVStore`s
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub enum KVMessage {
    /// Store the `Key`, `Value` pair at its home
    Put(Key, Value),
    /// Request the `Value` for the given `Key` from its home
    Get(Key),
    /// Delete the given `Key` at its home
    Remove(Key),
    /// Drop any cached copy of the given `Key`
    Invalidate(Key),
    /// The response to a `Get`, `None` if the key is absent
    Data(Option<Value>),
    /// The response to a `Put` or `Remove`
    Ack,
}

impl fmt::Debug for KVMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KVMessage::Put(k, v) => write!(f, "Put({}, {} bytes)", k, v.len()),
            KVMessage::Get(k) => write!(f, "Get({})", k),
            KVMessage::Remove(k) => write!(f, "Remove({})", k),
            KVMessage::Invalidate(k) => write!(f, "Invalidate({})", k),
            KVMessage::Data(Some(v)) => write!(f, "Data({} bytes)", v.len()),
            KVMessage::Data(None) => write!(f, "Data(absent)"),
            KVMessage::Ack => write!(f, "Ack"),
        }
    }
}
