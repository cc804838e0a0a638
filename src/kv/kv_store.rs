//! The `KVStore`
use crate::error::LiquidError;
use crate::kv::{Cache, KVMessage, KVStore, Key, Value};
use crate::network::{Frame, Message, Network};
use bincode::{deserialize, serialize};
use deepsize::DeepSizeOf;
use log::{debug, error, info};
use lru::LruCache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::sync::{oneshot, Mutex, RwLock};

impl KVStore {
    /// Creates a new `KVStore` that talks to the rest of the cloud through
    /// `network` and spawns the task processing its incoming messages.
    ///
    /// ## Parameters
    /// - `network`: the connections of this node to every node of the cloud
    /// - `receiver`: the receiving half of this node's channel
    /// - `max_cache_size`: the number of bytes of other nodes' values this
    ///    `KVStore` may cache
    pub(crate) fn new(
        network: Network,
        receiver: Receiver<Frame>,
        max_cache_size: u64,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let id = network.id;
        let kv = Arc::new(KVStore {
            data: RwLock::new(HashMap::new()),
            cache: Mutex::new(Cache {
                entries: LruCache::unbounded(),
                size: 0,
                epoch: 0,
            }),
            network,
            pending: Mutex::new(HashMap::new()),
            msg_id: AtomicUsize::new(0),
            id,
            max_cache_size,
        });
        let kv_clone = kv.clone();
        let handle = tokio::spawn(async move {
            KVStore::process_messages(kv_clone, receiver).await;
        });
        (kv, handle)
    }

    /// The id of the node this `KVStore` runs on
    pub fn id(&self) -> usize {
        self.id
    }

    /// The number of nodes in the cloud this `KVStore` belongs to
    pub fn num_nodes(&self) -> usize {
        self.network.num_nodes()
    }

    /// Retrieves and deserializes the value for `key`, from this node if it
    /// is the home of `key` or holds a cached copy, otherwise from the home
    /// node. Returns `Ok(None)` if the key is absent.
    ///
    /// ## Errors
    /// `LiquidError::Serialization` if the stored value is not a `T`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        key: &Key,
    ) -> Result<Option<T>, LiquidError> {
        match self.get_raw(key).await? {
            Some(blob) => Ok(Some(deserialize(&blob[..])?)),
            None => Ok(None),
        }
    }

    /// Like [`get`](KVStore::get) but an absent key is a
    /// `LiquidError::NotPresent` error.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        key: &Key,
    ) -> Result<T, LiquidError> {
        self.get(key)
            .await?
            .ok_or_else(|| LiquidError::NotPresent(key.clone()))
    }

    /// Retrieves the serialized value for `key`
    pub async fn get_raw(&self, key: &Key) -> Result<Option<Value>, LiquidError> {
        if key.home == self.id {
            return Ok(self.data.read().await.get(key).cloned());
        }
        let (cached, epoch) = {
            let mut cache = self.cache.lock().await;
            (cache.entries.get(key).cloned(), cache.epoch)
        };
        if let Some(blob) = cached {
            return Ok(Some(blob));
        }
        match self.request(key.home, KVMessage::Get(key.clone())).await? {
            KVMessage::Data(Some(blob)) => {
                self.add_to_cache(key.clone(), blob.clone(), epoch).await;
                Ok(Some(blob))
            }
            KVMessage::Data(None) => Ok(None),
            other => Err(LiquidError::Execution(format!(
                "Unexpected reply {:?} to a get of {}",
                other, key
            ))),
        }
    }

    /// Serializes `value` and publishes it at the home of `key`, replacing
    /// any previous value. Once this returns, reads of `key` from this node
    /// observe `value`.
    pub async fn put<T: Serialize>(
        &self,
        key: &Key,
        value: &T,
    ) -> Result<(), LiquidError> {
        let serial = serialize(value)?;
        self.put_raw(key.clone(), serial).await
    }

    /// Publishes an already serialized value at the home of `key`
    pub async fn put_raw(&self, key: Key, value: Value) -> Result<(), LiquidError> {
        if key.home == self.id {
            debug!("Put key: {} into KVStore {}", key, self.id);
            {
                self.data.write().await.insert(key.clone(), value);
            }
            self.broadcast_invalidate(&key, self.id).await
        } else {
            let started = { self.cache.lock().await.epoch };
            match self
                .request(key.home, KVMessage::Put(key.clone(), value.clone()))
                .await?
            {
                KVMessage::Ack => {
                    // reads of `key` that raced this write must not cache
                    // the value it replaced
                    let epoch = self.evict(&key).await;
                    if epoch == started + 1 {
                        self.add_to_cache(key, value, epoch).await;
                    }
                    Ok(())
                }
                other => Err(LiquidError::Execution(format!(
                    "Unexpected reply {:?} to a put of {}",
                    other, key
                ))),
            }
        }
    }

    /// Deletes `key` at its home and drops cached copies. Removing an absent
    /// key is not an error.
    pub async fn remove(&self, key: &Key) -> Result<(), LiquidError> {
        if key.home == self.id {
            debug!("Remove key: {} from KVStore {}", key, self.id);
            {
                self.data.write().await.remove(key);
            }
            self.broadcast_invalidate(key, self.id).await
        } else {
            self.evict(key).await;
            match self.request(key.home, KVMessage::Remove(key.clone())).await? {
                KVMessage::Ack => {
                    self.evict(key).await;
                    Ok(())
                }
                other => Err(LiquidError::Execution(format!(
                    "Unexpected reply {:?} to a remove of {}",
                    other, key
                ))),
            }
        }
    }

    /// The keys whose home is this node
    pub async fn local_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> =
            { self.data.read().await.keys().cloned().collect() };
        keys.sort();
        keys
    }

    /// Whether this node holds a cached copy of `key`
    pub async fn is_cached(&self, key: &Key) -> bool {
        self.cache.lock().await.entries.contains(key)
    }

    /// Processes frames from the queue that is populated by the `Network`,
    /// handling each message in its own task.
    pub(crate) async fn process_messages(
        kv: Arc<KVStore>,
        mut receiver: Receiver<Frame>,
    ) {
        while let Some(frame) = receiver.recv().await {
            let msg: Message<KVMessage> = match Message::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => {
                    error!("KVStore {} dropped an undecodable frame: {}", kv.id, e);
                    continue;
                }
            };
            let kv = kv.clone();
            tokio::spawn(async move {
                debug!(
                    "KVStore {} processing message {} from {}: {:?}",
                    kv.id, msg.msg_id, msg.sender_id, msg.msg
                );
                if let Err(e) = kv.handle(msg).await {
                    error!("KVStore {} failed to handle a message: {}", kv.id, e);
                }
            });
        }
        info!("KVStore {} stopped processing messages", kv.id);
    }

    async fn handle(&self, msg: Message<KVMessage>) -> Result<(), LiquidError> {
        match msg.msg {
            KVMessage::Get(k) => {
                let v = { self.data.read().await.get(&k).cloned() };
                self.reply(msg.sender_id, msg.msg_id, KVMessage::Data(v))
                    .await
            }
            KVMessage::Put(k, v) => {
                {
                    self.data.write().await.insert(k.clone(), v);
                }
                self.broadcast_invalidate(&k, msg.sender_id).await?;
                self.reply(msg.sender_id, msg.msg_id, KVMessage::Ack).await
            }
            KVMessage::Remove(k) => {
                {
                    self.data.write().await.remove(&k);
                }
                self.broadcast_invalidate(&k, msg.sender_id).await?;
                self.reply(msg.sender_id, msg.msg_id, KVMessage::Ack).await
            }
            KVMessage::Invalidate(k) => {
                self.evict(&k).await;
                Ok(())
            }
            reply @ (KVMessage::Data(_) | KVMessage::Ack) => {
                let waiting = { self.pending.lock().await.remove(&msg.msg_id) };
                match waiting {
                    // the requester may have given up, nothing to do then
                    Some(sender) => {
                        let _ = sender.send(reply);
                    }
                    None => error!(
                        "KVStore {} got a reply to unknown message {}",
                        self.id, msg.msg_id
                    ),
                }
                Ok(())
            }
        }
    }

    /// Sends `msg` to `target_id` and waits for its reply
    async fn request(
        &self,
        target_id: usize,
        msg: KVMessage,
    ) -> Result<KVMessage, LiquidError> {
        let msg_id = self.next_msg_id();
        let (sender, receiver) = oneshot::channel();
        {
            self.pending.lock().await.insert(msg_id, sender);
        }
        let sent = self
            .network
            .send_msg(Message::new(msg_id, self.id, target_id, msg))
            .await;
        if let Err(e) = sent {
            self.pending.lock().await.remove(&msg_id);
            return Err(e);
        }
        receiver
            .await
            .map_err(|_| LiquidError::NodeUnreachable(target_id))
    }

    async fn reply(
        &self,
        target_id: usize,
        msg_id: usize,
        msg: KVMessage,
    ) -> Result<(), LiquidError> {
        self.network
            .send_msg(Message::new(msg_id, self.id, target_id, msg))
            .await
    }

    /// Tells every node except this one and `except` to drop `key` from its
    /// cache
    async fn broadcast_invalidate(
        &self,
        key: &Key,
        except: usize,
    ) -> Result<(), LiquidError> {
        for target_id in 0..self.network.num_nodes() {
            if target_id == self.id || target_id == except {
                continue;
            }
            let msg = Message::new(
                self.next_msg_id(),
                self.id,
                target_id,
                KVMessage::Invalidate(key.clone()),
            );
            self.network.send_msg(msg).await?;
        }
        Ok(())
    }

    fn next_msg_id(&self) -> usize {
        self.msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Drops any cached copy of `key` and starts a new cache epoch, which
    /// is returned
    async fn evict(&self, key: &Key) -> u64 {
        let mut cache = self.cache.lock().await;
        if let Some(old) = cache.entries.pop(key) {
            cache.size -= old.deep_size_of() as u64;
        }
        cache.epoch += 1;
        cache.epoch
    }

    /// Caches `value`, unless the cache was invalidated since `epoch`
    async fn add_to_cache(&self, key: Key, value: Value, epoch: u64) {
        let v_size = value.deep_size_of() as u64;
        if v_size > self.max_cache_size {
            info!(
                "Value of size {} bytes for {} exceeds the max cache size of {}",
                v_size, key, self.max_cache_size
            );
            return;
        }
        let mut cache = self.cache.lock().await;
        if cache.epoch != epoch {
            debug!("Not caching {}, it was invalidated while in flight", key);
            return;
        }
        if let Some(old) = cache.entries.pop(&key) {
            cache.size -= old.deep_size_of() as u64;
        }
        while cache.size + v_size > self.max_cache_size {
            match cache.entries.pop_lru() {
                Some((_, temp)) => {
                    let temp_size = temp.deep_size_of() as u64;
                    debug!("Popped cached value of size {} bytes", temp_size);
                    cache.size -= temp_size;
                }
                None => break,
            }
        }
        cache.size += v_size;
        cache.entries.put(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, Duration};

    fn cloud(n: usize, max_cache_size: u64) -> Vec<Arc<KVStore>> {
        Network::connect(n, 16)
            .into_iter()
            .map(|(net, rx)| KVStore::new(net, rx, max_cache_size).0)
            .collect()
    }

    #[tokio::test]
    async fn test_local_put_get_remove() {
        let kvs = cloud(1, 1 << 20);
        let key = Key::new("a", 0);
        assert_eq!(kvs[0].get::<u64>(&key).await.unwrap(), None);
        kvs[0].put(&key, &42u64).await.unwrap();
        assert_eq!(kvs[0].get::<u64>(&key).await.unwrap(), Some(42));
        kvs[0].remove(&key).await.unwrap();
        assert_eq!(kvs[0].get::<u64>(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_remote_put_is_visible_to_writer_and_home() {
        let kvs = cloud(3, 1 << 20);
        let key = Key::new("remote", 2);
        kvs[0].put(&key, &String::from("v1")).await.unwrap();
        assert_eq!(
            kvs[0].get::<String>(&key).await.unwrap(),
            Some("v1".to_string())
        );
        assert_eq!(kvs[2].local_keys().await, vec![key.clone()]);
        // a fetch that overlaps the invalidation of the put is not cached
        sleep(Duration::from_millis(5)).await;
        assert_eq!(
            kvs[1].get::<String>(&key).await.unwrap(),
            Some("v1".to_string())
        );
        assert!(kvs[1].is_cached(&key).await);
    }

    #[tokio::test]
    async fn test_remote_remove_is_absent_everywhere() {
        let kvs = cloud(2, 1 << 20);
        let key = Key::new("gone", 1);
        kvs[0].put(&key, &1u8).await.unwrap();
        kvs[0].remove(&key).await.unwrap();
        assert_eq!(kvs[0].get::<u8>(&key).await.unwrap(), None);
        assert_eq!(kvs[1].get::<u8>(&key).await.unwrap(), None);
        assert!(matches!(
            kvs[0].fetch::<u8>(&key).await,
            Err(LiquidError::NotPresent(_))
        ));
    }

    #[tokio::test]
    async fn test_replacement_is_seen_after_invalidation() {
        let kvs = cloud(2, 1 << 20);
        let key = Key::new("k", 0);
        kvs[0].put(&key, &1u32).await.unwrap();
        assert_eq!(kvs[1].get::<u32>(&key).await.unwrap(), Some(1));
        // the replacing write happens on node 1, which is not the home
        kvs[1].put(&key, &2u32).await.unwrap();
        assert_eq!(kvs[1].get::<u32>(&key).await.unwrap(), Some(2));
        assert_eq!(kvs[0].get::<u32>(&key).await.unwrap(), Some(2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reads_racing_writes_do_not_cache_old_values() {
        let kvs = cloud(2, 1 << 20);
        let key = Key::new("raced", 0);
        for round in 0..500u32 {
            kvs[0].put(&key, &round).await.unwrap();
            let (reader, writer) = (kvs[1].clone(), kvs[0].clone());
            let (read_key, write_key) = (key.clone(), key.clone());
            let read = tokio::spawn(async move { reader.get::<u32>(&read_key).await });
            let write = tokio::spawn(async move { writer.put(&write_key, &(round + 1)).await });
            read.await.unwrap().unwrap();
            write.await.unwrap().unwrap();
            // let the invalidations of both writes arrive
            sleep(Duration::from_millis(1)).await;
            assert_eq!(
                kvs[1].get::<u32>(&key).await.unwrap(),
                Some(round + 1),
                "node 1 kept a replaced value in round {}",
                round
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_competing_remote_writers_agree_with_home() {
        let kvs = cloud(3, 1 << 20);
        let key = Key::new("contended", 0);
        for round in 0..300u32 {
            let (a, b) = (kvs[1].clone(), kvs[2].clone());
            let (key_a, key_b) = (key.clone(), key.clone());
            let put_a = tokio::spawn(async move { a.put(&key_a, &(round * 2)).await });
            let put_b = tokio::spawn(async move { b.put(&key_b, &(round * 2 + 1)).await });
            put_a.await.unwrap().unwrap();
            put_b.await.unwrap().unwrap();
            sleep(Duration::from_millis(1)).await;
            let home = kvs[0].get::<u32>(&key).await.unwrap();
            assert_eq!(kvs[1].get::<u32>(&key).await.unwrap(), home, "round {}", round);
            assert_eq!(kvs[2].get::<u32>(&key).await.unwrap(), home, "round {}", round);
        }
    }

    #[tokio::test]
    async fn test_cache_respects_max_size() {
        let kvs = cloud(2, 100);
        for i in 0..4 {
            let key = Key::new(&format!("blob{}", i), 1);
            kvs[1].put(&key, &vec![0u8; 40]).await.unwrap();
            assert!(kvs[0].get::<Vec<u8>>(&key).await.unwrap().is_some());
        }
        let cache = kvs[0].cache.lock().await;
        assert!(cache.size <= 100);
        assert!(cache.entries.len() < 4);
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_serialization_error() {
        let kvs = cloud(1, 1 << 20);
        let key = Key::new("short", 0);
        kvs[0].put(&key, &1u8).await.unwrap();
        assert!(matches!(
            kvs[0].get::<u64>(&key).await,
            Err(LiquidError::Serialization(_))
        ));
    }
}
