//! Defines a `Frame`, an ordered collection of named columns sharing one
//! `Layout`.
use crate::error::LiquidError;
use crate::frame::column::{Column, Layout};
use crate::kv::{KVStore, Key};
use serde::{Deserialize, Serialize};

/// A descriptor of named columns. A `Frame` only holds column keys: the
/// columns themselves are separately published in the directory and fetched
/// on demand. A frame may be published under its `key` or kept transient by
/// its owner.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Frame {
    pub key: Key,
    names: Vec<String>,
    keys: Vec<Key>,
    /// The layout every column must have, fixed by the first column added
    layout: Option<Layout>,
}

impl Frame {
    /// Creates an empty `Frame`
    pub fn new(key: Key) -> Self {
        Frame {
            key,
            names: Vec::new(),
            keys: Vec::new(),
            layout: None,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub fn num_cols(&self) -> usize {
        self.names.len()
    }

    /// The number of rows, `0` for a frame that never had a column
    pub fn num_rows(&self) -> u64 {
        self.layout.as_ref().map_or(0, |l| l.row_count())
    }

    /// The index of the column named `name`
    pub fn find(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// The key of the column at `idx`
    pub fn key_of(&self, idx: usize) -> Result<&Key, LiquidError> {
        self.keys.get(idx).ok_or(LiquidError::ColIndexOutOfBounds)
    }

    /// Appends `column` under `name`. Fails if the name is taken or the
    /// column's layout differs from the frame's.
    pub fn add(&mut self, name: &str, column: &Column) -> Result<(), LiquidError> {
        if self.find(name).is_some() {
            return Err(LiquidError::NameAlreadyExists(name.to_string()));
        }
        self.check_layout(column)?;
        if self.layout.is_none() {
            self.layout = Some(column.layout.clone());
        }
        self.names.push(name.to_string());
        self.keys.push(column.key.clone());
        Ok(())
    }

    /// Removes the column at `idx`, returning its name and key. The layout
    /// is kept even when the last column is removed.
    pub fn remove(&mut self, idx: usize) -> Result<(String, Key), LiquidError> {
        if idx >= self.names.len() {
            return Err(LiquidError::ColIndexOutOfBounds);
        }
        Ok((self.names.remove(idx), self.keys.remove(idx)))
    }

    /// Points `name` at `column`, returning the key it replaced. The old
    /// column is not removed from the directory, that is up to its owner.
    pub fn replace(&mut self, name: &str, column: &Column) -> Result<Key, LiquidError> {
        let idx = self
            .find(name)
            .ok_or_else(|| LiquidError::MissingColumn(name.to_string()))?;
        self.check_layout(column)?;
        Ok(std::mem::replace(&mut self.keys[idx], column.key.clone()))
    }

    /// Fetches the metadata of the column at `idx`
    pub async fn column(&self, kv: &KVStore, idx: usize) -> Result<Column, LiquidError> {
        kv.fetch(self.key_of(idx)?).await
    }

    /// Fetches the metadata of every column, in order
    pub async fn columns(&self, kv: &KVStore) -> Result<Vec<Column>, LiquidError> {
        let mut columns = Vec::with_capacity(self.keys.len());
        for key in &self.keys {
            columns.push(kv.fetch(key).await?);
        }
        Ok(columns)
    }

    fn check_layout(&self, column: &Column) -> Result<(), LiquidError> {
        match &self.layout {
            Some(layout) if *layout != column.layout => Err(LiquidError::Misaligned),
            _ => Ok(()),
        }
    }
}
