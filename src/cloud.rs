//! Defines the `Cloud`: the set of nodes that hold the directory, along with
//! its configuration and the creation and removal of columns and frames.
use crate::error::LiquidError;
use crate::frame::chunk::{Chunk, Encoding};
use crate::frame::column::{chunk_key, Column, ColumnData, Layout};
use crate::frame::frame::Frame;
use crate::kv::{KVStore, Key};
use crate::mr::MrTask;
use crate::network::Network;
use crate::ROW_COUNT_PER_CHUNK;
use deepsize::DeepSizeOf;
use log::{debug, info, warn};
use std::sync::Arc;
use sysinfo::System;
use tokio::task::JoinHandle;

/// The fraction of physical memory a node may use to cache other nodes'
/// values when no cache size is configured
const DEFAULT_CACHE_FRACTION: f64 = 0.33;

/// The configuration of a `Cloud`
#[derive(Clone, Debug, PartialEq)]
pub struct CloudConfig {
    /// The number of nodes
    pub num_nodes: usize,
    /// The number of worker threads each node maps partitions on
    pub n_threads: usize,
    /// The number of rows per chunk of newly created columns
    pub chunk_rows: u64,
    /// The number of bytes of other nodes' values each node may cache
    pub max_cache_size: u64,
    /// The number of frames each node's channel buffers
    pub channel_capacity: usize,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            num_nodes: 1,
            n_threads: num_cpus::get(),
            chunk_rows: ROW_COUNT_PER_CHUNK,
            max_cache_size: default_cache_size(),
            channel_capacity: 64,
        }
    }
}

impl CloudConfig {
    pub fn with_nodes(mut self, num_nodes: usize) -> Self {
        self.num_nodes = num_nodes;
        self
    }

    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads;
        self
    }

    pub fn with_chunk_rows(mut self, chunk_rows: u64) -> Self {
        self.chunk_rows = chunk_rows;
        self
    }

    pub fn with_cache_size(mut self, max_cache_size: u64) -> Self {
        self.max_cache_size = max_cache_size;
        self
    }

    fn validate(&self) -> Result<(), LiquidError> {
        if self.num_nodes == 0 {
            return Err(LiquidError::Config(
                "a cloud needs at least one node".to_string(),
            ));
        }
        if self.n_threads == 0 {
            return Err(LiquidError::Config(
                "a node needs at least one worker thread".to_string(),
            ));
        }
        if self.chunk_rows == 0 {
            return Err(LiquidError::Config(
                "chunks must hold at least one row".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(LiquidError::Config(
                "channels must buffer at least one frame".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_cache_size() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    (sys.total_memory() as f64 * DEFAULT_CACHE_FRACTION) as u64
}

/// A cloud of nodes running in this process. Each node owns a `KVStore`
/// and a task processing the messages other nodes send it; nodes only
/// exchange serialized messages.
///
/// Node 0 acts as the driver: the directory is accessed through its store
/// unless a specific node is asked for.
pub struct Cloud {
    pub(crate) nodes: Vec<Arc<KVStore>>,
    pub(crate) config: CloudConfig,
    handles: Vec<JoinHandle<()>>,
}

impl Cloud {
    /// Starts a cloud of `config.num_nodes` nodes. Must be called from
    /// within a `tokio` runtime.
    pub fn new(config: CloudConfig) -> Result<Self, LiquidError> {
        config.validate()?;
        let (nodes, handles) = Network::connect(config.num_nodes, config.channel_capacity)
            .into_iter()
            .map(|(network, receiver)| {
                KVStore::new(network, receiver, config.max_cache_size)
            })
            .unzip();
        info!(
            "Started a cloud of {} nodes with {} threads each",
            config.num_nodes, config.n_threads
        );
        Ok(Cloud {
            nodes,
            config,
            handles,
        })
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// The store of the driver node
    pub fn kv(&self) -> &Arc<KVStore> {
        &self.nodes[0]
    }

    /// The store of node `id`
    pub fn node(&self, id: usize) -> Option<&Arc<KVStore>> {
        self.nodes.get(id)
    }

    /// The default layout of a column of `rows` rows
    pub fn layout(&self, rows: u64) -> Layout {
        Layout::uniform(rows, self.config.chunk_rows, self.num_nodes())
    }

    /// The node that is home to the metadata published under `name`
    pub fn home_for(&self, name: &str) -> usize {
        (hash_str(name) % self.num_nodes() as u64) as usize
    }

    /// The total number of keys homed across all nodes
    pub async fn num_keys(&self) -> usize {
        let mut n = 0;
        for kv in &self.nodes {
            n += kv.local_keys().await.len();
        }
        n
    }

    /// Creates a column named `name` with the default layout, see
    /// [`Cloud::new_column_with_layout`]
    pub async fn new_column(
        &self,
        name: &str,
        data: ColumnData,
    ) -> Result<Column, LiquidError> {
        let layout = self.layout(data.len() as u64);
        self.new_column_with_layout(name, data, layout).await
    }

    /// Creates a column named `name` holding `data`, split into chunks as
    /// described by `layout`. Every chunk is published before the column
    /// metadata, so a column that can be read is complete.
    ///
    /// ## Errors
    /// - `KeyAlreadyExists` if a column named `name` exists
    /// - `LengthMismatch` if `data` and `layout` have different row counts
    /// - `InvalidDomain` if categorical data holds a code outside its
    ///   domain or a duplicated level
    pub async fn new_column_with_layout(
        &self,
        name: &str,
        data: ColumnData,
        layout: Layout,
    ) -> Result<Column, LiquidError> {
        let key = Key::new(name, self.home_for(name));
        if self.kv().get_raw(&key).await?.is_some() {
            return Err(LiquidError::KeyAlreadyExists(key));
        }
        if data.len() as u64 != layout.row_count() {
            return Err(LiquidError::LengthMismatch {
                left: data.len() as u64,
                right: layout.row_count(),
            });
        }
        layout.check_homes(self.num_nodes())?;
        data.validate()?;

        let (kind, domain, values) = data.into_parts();
        let column = Column {
            key,
            layout,
            kind,
            domain,
        };
        for idx in 0..column.n_chunks() {
            let rows = column.layout.chunk_range(idx);
            let chunk = Chunk::from_values(
                rows.start,
                values.slice(rows.start as usize..rows.end as usize),
            );
            debug!(
                "Publishing chunk {} of {} as {}",
                idx,
                column.key,
                chunk.encoding().name()
            );
            if let Err(e) = self.kv().put(&column.chunk_key(idx), &chunk).await {
                self.remove_chunks(&column).await;
                return Err(e);
            }
        }
        if let Err(e) = self.kv().put(&column.key, &column).await {
            self.remove_chunks(&column).await;
            return Err(e);
        }
        info!(
            "Created {} column {} of {} rows in {} chunks",
            column.kind,
            column.key,
            column.len(),
            column.n_chunks()
        );
        Ok(column)
    }

    /// Fetches the metadata of the column published under `key`
    pub async fn get_column(&self, key: &Key) -> Result<Option<Column>, LiquidError> {
        self.kv().get(key).await
    }

    /// Removes the column published under `key` along with every chunk and
    /// its cached rollups. Removing an absent column is not an error.
    pub async fn remove_column(&self, key: &Key) -> Result<(), LiquidError> {
        let column: Column = match self.kv().get(key).await? {
            Some(column) => column,
            None => return Ok(()),
        };
        self.kv().remove(key).await?;
        self.remove_chunks(&column).await;
        self.kv().remove(&column.rollups_key()).await?;
        debug!("Removed column {}", key);
        Ok(())
    }

    /// Removes every chunk of `column`, logging the chunks that could not
    /// be removed
    pub(crate) async fn remove_chunks(&self, column: &Column) {
        for idx in 0..column.n_chunks() {
            let key = chunk_key(&column.key, &column.layout, idx);
            if let Err(e) = self.kv().remove(&key).await {
                warn!("Could not remove chunk {}: {}", key, e);
            }
        }
    }

    /// Publishes `frame` under its key
    pub async fn put_frame(&self, frame: &Frame) -> Result<(), LiquidError> {
        self.kv().put(&frame.key, frame).await
    }

    /// Fetches the frame published under `key`
    pub async fn get_frame(&self, key: &Key) -> Result<Option<Frame>, LiquidError> {
        self.kv().get(key).await
    }

    /// Removes the frame published under `key` and every one of its
    /// columns
    pub async fn delete_frame(&self, key: &Key) -> Result<(), LiquidError> {
        let frame: Frame = match self.get_frame(key).await? {
            Some(frame) => frame,
            None => return Ok(()),
        };
        for column in frame.keys() {
            self.remove_column(column).await?;
        }
        self.kv().remove(key).await
    }

    /// A checksum of every value of every column of `frame`. Equal frames
    /// have equal checksums whatever their layout.
    pub async fn checksum(&self, frame: &Frame) -> Result<u64, LiquidError> {
        let columns = frame.columns(self.kv()).await?;
        if columns.is_empty() {
            return Ok(0);
        }
        let refs: Vec<&Column> = columns.iter().collect();
        self.run(Checksum, &refs).await
    }

    /// The number of bytes the chunks of `column` take in memory
    pub async fn byte_size(&self, column: &Column) -> Result<u64, LiquidError> {
        self.run(ByteSize, &[column]).await
    }
}

impl Drop for Cloud {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

/// FNV-1a
fn hash_str(s: &str) -> u64 {
    s.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

/// XORs a hash of every (column, row, value) triple, so the result does not
/// depend on how rows are partitioned or merged
struct Checksum;

impl MrTask for Checksum {
    type Output = u64;

    fn map(&self, chunks: &[Chunk]) -> Result<u64, LiquidError> {
        let mut sum = 0;
        for (col, chunk) in chunks.iter().enumerate() {
            for i in 0..chunk.len() {
                let value = if chunk.is_na(i) {
                    u64::MAX
                } else {
                    match chunk.encoding() {
                        Encoding::Str { .. } => hash_str(chunk.at_str(i).unwrap_or_default()),
                        Encoding::Uuid { .. } => {
                            let u = chunk.at_uuid(i).unwrap_or_default();
                            (u as u64) ^ mix((u >> 64) as u64)
                        }
                        _ => chunk.at(i).to_bits(),
                    }
                };
                let row = chunk.start() + i as u64;
                sum ^= mix(value ^ mix(row ^ mix(col as u64)));
            }
        }
        Ok(sum)
    }

    fn reduce(&self, left: u64, right: u64) -> Result<u64, LiquidError> {
        Ok(left ^ right)
    }
}

/// Sums the deep size of every chunk
struct ByteSize;

impl MrTask for ByteSize {
    type Output = u64;

    fn map(&self, chunks: &[Chunk]) -> Result<u64, LiquidError> {
        Ok(chunks.iter().map(|c| c.deep_size_of() as u64).sum())
    }

    fn reduce(&self, left: u64, right: u64) -> Result<u64, LiquidError> {
        Ok(left + right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::column::ColumnType;

    fn cloud(num_nodes: usize, chunk_rows: u64) -> Cloud {
        Cloud::new(
            CloudConfig::default()
                .with_nodes(num_nodes)
                .with_chunk_rows(chunk_rows),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let err = Cloud::new(CloudConfig::default().with_nodes(0));
        assert!(matches!(err, Err(LiquidError::Config(_))));
    }

    #[tokio::test]
    async fn test_new_column_and_accessors() {
        let cloud = cloud(3, 2);
        let data =
            ColumnData::with_domain(&["lo", "hi"], &[Some("hi"), None, Some("lo")]).unwrap();
        let col = cloud.new_column("grade", data).await.unwrap();
        assert_eq!(col.kind, ColumnType::Categorical);
        assert_eq!(col.n_chunks(), 2);
        let kv = cloud.node(2).unwrap();
        assert_eq!(col.at8(kv, 0).await.unwrap(), Some(1));
        assert!(col.is_na(kv, 1).await.unwrap());
        assert_eq!(col.level(0), Some("lo"));
        assert!(matches!(
            col.at(kv, 3).await,
            Err(LiquidError::RowIndexOutOfBounds)
        ));
        assert_eq!(cloud.get_column(&col.key).await.unwrap(), Some(col.clone()));

        let names = ColumnData::Text(vec![Some("x".to_string()), None]);
        let text = cloud.new_column("names", names).await.unwrap();
        assert_eq!(text.at_str(cloud.kv(), 0).await.unwrap(), Some("x".to_string()));
    }

    #[tokio::test]
    async fn test_name_collision_and_bad_data() {
        let cloud = cloud(2, 10);
        cloud
            .new_column("x", ColumnData::Numeric(vec![Some(1.0)]))
            .await
            .unwrap();
        assert!(matches!(
            cloud.new_column("x", ColumnData::Numeric(vec![])).await,
            Err(LiquidError::KeyAlreadyExists(_))
        ));
        let bad = ColumnData::Categorical {
            domain: vec!["a".to_string()],
            codes: vec![Some(3)],
        };
        assert!(matches!(
            cloud.new_column("bad", bad).await,
            Err(LiquidError::InvalidDomain(_))
        ));
        let layout = Layout::uniform(5, 5, 2);
        assert!(matches!(
            cloud
                .new_column_with_layout("short", ColumnData::Numeric(vec![None]), layout)
                .await,
            Err(LiquidError::LengthMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_column_cascades() {
        let cloud = cloud(3, 4);
        let data = ColumnData::Numeric((0..20).map(|i| Some(i as f64)).collect());
        let col = cloud.new_column("gone", data).await.unwrap();
        cloud.rollups(&col).await.unwrap();
        assert_eq!(cloud.num_keys().await, 7);
        cloud.remove_column(&col.key).await.unwrap();
        assert_eq!(cloud.num_keys().await, 0);
        cloud.remove_column(&col.key).await.unwrap();
    }

    #[tokio::test]
    async fn test_frames() {
        let cloud = cloud(2, 3);
        let a = cloud
            .new_column("a", ColumnData::Numeric(vec![Some(1.0), Some(2.0), None, Some(4.0)]))
            .await
            .unwrap();
        let b = cloud
            .new_column("b", ColumnData::categorical(&[Some("x"), Some("y"), Some("x"), None]))
            .await
            .unwrap();
        let mut frame = Frame::new(Key::new("frame", 1));
        frame.add("a", &a).unwrap();
        frame.add("b", &b).unwrap();
        cloud.put_frame(&frame).await.unwrap();
        let fetched = cloud.get_frame(&frame.key).await.unwrap().unwrap();
        assert_eq!(fetched, frame);
        assert_eq!(fetched.column(cloud.kv(), 1).await.unwrap(), b);
        assert_ne!(cloud.checksum(&fetched).await.unwrap(), 0);
        assert!(cloud.byte_size(&a).await.unwrap() > 0);
        cloud.delete_frame(&frame.key).await.unwrap();
        assert_eq!(cloud.num_keys().await, 0);
    }

    #[tokio::test]
    async fn test_checksum_ignores_layout() {
        let values: Vec<Option<f64>> = (0..30).map(|i| Some(i as f64 * 0.5)).collect();
        let one = cloud(1, 100);
        let many = cloud(3, 4);
        let mut checksums = Vec::new();
        for cloud in [&one, &many] {
            let col = cloud
                .new_column("v", ColumnData::Numeric(values.clone()))
                .await
                .unwrap();
            let mut frame = Frame::new(Key::new("f", 0));
            frame.add("v", &col).unwrap();
            checksums.push(cloud.checksum(&frame).await.unwrap());
        }
        assert_eq!(checksums[0], checksums[1]);
    }
}
