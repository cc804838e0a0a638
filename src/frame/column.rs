//! Defines a `Column`: the metadata of a distributed array whose values are
//! stored as `Chunk`s spread across the nodes of a cloud, along with the
//! `Layout` describing how rows are partitioned.
use crate::error::LiquidError;
use crate::frame::chunk::{Chunk, Values};
use crate::kv::{KVStore, Key};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Range;

/// How the rows of a column are partitioned into chunks and which node is
/// the home of each chunk.
///
/// `espc` ("element start per chunk") holds the global row index at which
/// each chunk starts, followed by the total row count, so chunk `i` covers
/// the rows `espc[i]..espc[i + 1]`. There is always at least one chunk, a
/// column of zero rows has one empty chunk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Layout {
    espc: Vec<u64>,
    homes: Vec<usize>,
}

impl Layout {
    /// Splits `rows` rows into chunks of `chunk_rows` rows (the last one may
    /// be shorter), assigning chunks to `num_nodes` nodes round-robin.
    pub fn uniform(rows: u64, chunk_rows: u64, num_nodes: usize) -> Self {
        let chunk_rows = chunk_rows.max(1);
        let n_chunks = ((rows + chunk_rows - 1) / chunk_rows).max(1);
        let mut espc: Vec<u64> =
            (0..n_chunks).map(|i| i * chunk_rows).collect();
        espc.push(rows);
        let homes = (0..n_chunks as usize).map(|i| i % num_nodes.max(1)).collect();
        Layout { espc, homes }
    }

    /// Creates a layout from explicit chunk boundaries, assigning chunks to
    /// `num_nodes` nodes round-robin.
    pub fn from_espc(espc: Vec<u64>, num_nodes: usize) -> Result<Self, LiquidError> {
        if espc.len() < 2 {
            return Err(LiquidError::InvalidLayout(
                "a layout needs at least one chunk".to_string(),
            ));
        }
        if espc[0] != 0 {
            return Err(LiquidError::InvalidLayout(
                "the first chunk must start at row 0".to_string(),
            ));
        }
        if espc.windows(2).any(|w| w[0] > w[1]) {
            return Err(LiquidError::InvalidLayout(
                "chunk starts must be non-decreasing".to_string(),
            ));
        }
        let homes = (0..espc.len() - 1).map(|i| i % num_nodes.max(1)).collect();
        Ok(Layout { espc, homes })
    }

    /// Replaces the home of every chunk with the given assignment
    pub fn with_homes(self, homes: Vec<usize>) -> Result<Self, LiquidError> {
        if homes.len() != self.n_chunks() {
            return Err(LiquidError::InvalidLayout(format!(
                "{} homes given for {} chunks",
                homes.len(),
                self.n_chunks()
            )));
        }
        Ok(Layout { homes, ..self })
    }

    /// The number of chunks
    pub fn n_chunks(&self) -> usize {
        self.homes.len()
    }

    /// The total number of rows
    pub fn row_count(&self) -> u64 {
        self.espc[self.espc.len() - 1]
    }

    pub fn espc(&self) -> &[u64] {
        &self.espc
    }

    pub fn homes(&self) -> &[usize] {
        &self.homes
    }

    /// The node that is home to chunk `idx`
    pub fn home(&self, idx: usize) -> usize {
        self.homes[idx]
    }

    /// The global row range covered by chunk `idx`
    pub fn chunk_range(&self, idx: usize) -> Range<u64> {
        self.espc[idx]..self.espc[idx + 1]
    }

    /// The number of rows in chunk `idx`
    pub fn chunk_len(&self, idx: usize) -> usize {
        (self.espc[idx + 1] - self.espc[idx]) as usize
    }

    /// The index of the chunk holding global row `row`, `None` if the row is
    /// past the end
    pub fn chunk_for_row(&self, row: u64) -> Option<usize> {
        if row >= self.row_count() {
            return None;
        }
        Some(self.espc.partition_point(|&start| start <= row) - 1)
    }

    /// The chunks homed on `node`, in index order
    pub fn chunks_on(&self, node: usize) -> Vec<usize> {
        (0..self.n_chunks()).filter(|&i| self.homes[i] == node).collect()
    }

    /// Checks that every home is one of `num_nodes` nodes
    pub(crate) fn check_homes(&self, num_nodes: usize) -> Result<(), LiquidError> {
        match self.homes.iter().find(|&&h| h >= num_nodes) {
            Some(h) => Err(LiquidError::InvalidLayout(format!(
                "chunk home {} is not a node of a {} node cloud",
                h, num_nodes
            ))),
            None => Ok(()),
        }
    }
}

/// The type tag of a column
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Numeric,
    /// Integer codes into the column's domain
    Categorical,
    Text,
    /// Milliseconds since the epoch
    Time,
    Uuid,
}

impl ColumnType {
    /// Whether values of this type are numbers a regression can compare
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Numeric | ColumnType::Time)
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Numeric => "numeric",
            ColumnType::Categorical => "categorical",
            ColumnType::Text => "text",
            ColumnType::Time => "time",
            ColumnType::Uuid => "uuid",
        };
        write!(f, "{}", name)
    }
}

/// The metadata of a distributed column, published under `key`. The values
/// live in one chunk per partition of `layout`, each published under
/// [`Column::chunk_key`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Column {
    pub key: Key,
    pub layout: Layout,
    pub kind: ColumnType,
    /// The levels of a categorical column, `None` for every other type
    pub domain: Option<Vec<String>>,
}

/// The key of chunk `idx` of the column published under `column`
pub(crate) fn chunk_key(column: &Key, layout: &Layout, idx: usize) -> Key {
    Key::new(&format!("{}#{}", column.name, idx), layout.home(idx))
}

impl Column {
    /// The key of chunk `idx` of this column
    pub fn chunk_key(&self, idx: usize) -> Key {
        chunk_key(&self.key, &self.layout, idx)
    }

    /// The key the rollup statistics of this column are cached under
    pub fn rollups_key(&self) -> Key {
        Key::new(&format!("{}$rollups", self.key.name), self.key.home)
    }

    /// The number of rows
    pub fn len(&self) -> u64 {
        self.layout.row_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_chunks(&self) -> usize {
        self.layout.n_chunks()
    }

    pub fn is_categorical(&self) -> bool {
        self.kind == ColumnType::Categorical
    }

    /// The levels of this column, if categorical
    pub fn domain(&self) -> Option<&[String]> {
        self.domain.as_deref()
    }

    /// The level name of categorical `code`
    pub fn level(&self, code: i64) -> Option<&str> {
        let domain = self.domain.as_ref()?;
        usize::try_from(code)
            .ok()
            .and_then(|i| domain.get(i))
            .map(|s| s.as_str())
    }

    /// Fetches chunk `idx` through the given store
    pub async fn chunk(&self, kv: &KVStore, idx: usize) -> Result<Chunk, LiquidError> {
        if idx >= self.n_chunks() {
            return Err(LiquidError::InvalidLayout(format!(
                "{} has no chunk {}",
                self.key, idx
            )));
        }
        kv.fetch(&self.chunk_key(idx)).await
    }

    /// Fetches the chunk that holds global row `row`
    pub async fn chunk_for_row(&self, kv: &KVStore, row: u64) -> Result<Chunk, LiquidError> {
        match self.layout.chunk_for_row(row) {
            Some(idx) => self.chunk(kv, idx).await,
            None => Err(LiquidError::RowIndexOutOfBounds),
        }
    }

    /// The value at global row `row` as a double, `NaN` if missing
    pub async fn at(&self, kv: &KVStore, row: u64) -> Result<f64, LiquidError> {
        let chunk = self.chunk_for_row(kv, row).await?;
        Ok(chunk.at((row - chunk.start()) as usize))
    }

    /// The value at global row `row` as an integer, `None` if missing
    pub async fn at8(&self, kv: &KVStore, row: u64) -> Result<Option<i64>, LiquidError> {
        let chunk = self.chunk_for_row(kv, row).await?;
        Ok(chunk.at8((row - chunk.start()) as usize))
    }

    pub async fn is_na(&self, kv: &KVStore, row: u64) -> Result<bool, LiquidError> {
        let chunk = self.chunk_for_row(kv, row).await?;
        Ok(chunk.is_na((row - chunk.start()) as usize))
    }

    pub async fn at_str(&self, kv: &KVStore, row: u64) -> Result<Option<String>, LiquidError> {
        let chunk = self.chunk_for_row(kv, row).await?;
        Ok(chunk.at_str((row - chunk.start()) as usize).map(String::from))
    }

    pub async fn at_uuid(&self, kv: &KVStore, row: u64) -> Result<Option<u128>, LiquidError> {
        let chunk = self.chunk_for_row(kv, row).await?;
        Ok(chunk.at_uuid((row - chunk.start()) as usize))
    }

    /// Decodes the global rows in `range`, fetching each chunk that
    /// overlaps it once.
    pub async fn slice(&self, kv: &KVStore, range: Range<u64>) -> Result<Values, LiquidError> {
        if range.end > self.len() || range.start > range.end {
            return Err(LiquidError::RowIndexOutOfBounds);
        }
        let mut values = None;
        if !range.is_empty() {
            let first = self.layout.chunk_for_row(range.start).unwrap_or(0);
            for idx in first..self.n_chunks() {
                let chunk_rows = self.layout.chunk_range(idx);
                if chunk_rows.start >= range.end {
                    break;
                }
                let from = range.start.max(chunk_rows.start);
                let to = range.end.min(chunk_rows.end);
                if from >= to {
                    continue;
                }
                let chunk = self.chunk(kv, idx).await?;
                let part = chunk.slice(
                    (from - chunk_rows.start) as usize..(to - chunk_rows.start) as usize,
                );
                match values.as_mut() {
                    None => values = Some(part),
                    Some(acc) => acc.append(part)?,
                }
            }
        }
        match values {
            Some(v) => Ok(v),
            None => Ok(self.chunk(kv, 0).await?.slice(0..0)),
        }
    }
}

/// The values of a column to create, see
/// [`Cloud::new_column`](crate::Cloud::new_column)
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    /// Codes into `domain`, which must hold distinct levels
    Categorical {
        domain: Vec<String>,
        codes: Vec<Option<u32>>,
    },
    Text(Vec<Option<String>>),
    /// Milliseconds since the epoch
    Time(Vec<Option<i64>>),
    Uuid(Vec<Option<u128>>),
}

impl ColumnData {
    /// Encodes `values` as a categorical column whose domain is the sorted
    /// set of distinct values
    pub fn categorical<S: AsRef<str>>(values: &[Option<S>]) -> Self {
        let mut domain: Vec<String> = values
            .iter()
            .flatten()
            .map(|s| s.as_ref().to_string())
            .collect();
        domain.sort();
        domain.dedup();
        let index: HashMap<&str, u32> = domain
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i as u32))
            .collect();
        let codes = values
            .iter()
            .map(|v| v.as_ref().map(|s| index[s.as_ref()]))
            .collect();
        ColumnData::Categorical { domain, codes }
    }

    /// Encodes `values` as codes into the given `domain`. A value that is
    /// not a level of `domain` is an `InvalidDomain` error.
    pub fn with_domain<S: AsRef<str>>(
        domain: &[&str],
        values: &[Option<S>],
    ) -> Result<Self, LiquidError> {
        let codes = values
            .iter()
            .map(|v| match v {
                None => Ok(None),
                Some(s) => domain
                    .iter()
                    .position(|level| *level == s.as_ref())
                    .map(|i| Some(i as u32))
                    .ok_or_else(|| {
                        LiquidError::InvalidDomain(format!(
                            "{} is not a level of {:?}",
                            s.as_ref(),
                            domain
                        ))
                    }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let data = ColumnData::Categorical {
            domain: domain.iter().map(|s| s.to_string()).collect(),
            codes,
        };
        data.validate()?;
        Ok(data)
    }

    /// The number of rows
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(v) => v.len(),
            ColumnData::Categorical { codes, .. } => codes.len(),
            ColumnData::Text(v) => v.len(),
            ColumnData::Time(v) => v.len(),
            ColumnData::Uuid(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ColumnType {
        match self {
            ColumnData::Numeric(_) => ColumnType::Numeric,
            ColumnData::Categorical { .. } => ColumnType::Categorical,
            ColumnData::Text(_) => ColumnType::Text,
            ColumnData::Time(_) => ColumnType::Time,
            ColumnData::Uuid(_) => ColumnType::Uuid,
        }
    }

    /// Checks that a categorical domain has no duplicate levels and that
    /// every code is an index into it
    pub(crate) fn validate(&self) -> Result<(), LiquidError> {
        if let ColumnData::Categorical { domain, codes } = self {
            let mut sorted: Vec<&String> = domain.iter().collect();
            sorted.sort();
            if sorted.windows(2).any(|w| w[0] == w[1]) {
                return Err(LiquidError::InvalidDomain(
                    "domain levels must be distinct".to_string(),
                ));
            }
            if let Some(code) = codes.iter().flatten().find(|&&c| c as usize >= domain.len()) {
                return Err(LiquidError::InvalidDomain(format!(
                    "code {} is not an index into a domain of {} levels",
                    code,
                    domain.len()
                )));
            }
        }
        Ok(())
    }

    /// Splits this data into its type tag, domain and decoded values
    pub(crate) fn into_parts(self) -> (ColumnType, Option<Vec<String>>, Values) {
        let kind = self.kind();
        match self {
            ColumnData::Numeric(v) => (kind, None, Values::Numeric(v)),
            ColumnData::Categorical { domain, codes } => (
                kind,
                Some(domain),
                Values::Numeric(codes.into_iter().map(|c| c.map(f64::from)).collect()),
            ),
            ColumnData::Text(v) => (kind, None, Values::Text(v)),
            ColumnData::Time(v) => (
                kind,
                None,
                Values::Numeric(v.into_iter().map(|t| t.map(|t| t as f64)).collect()),
            ),
            ColumnData::Uuid(v) => (kind, None, Values::Uuid(v)),
        }
    }
}
