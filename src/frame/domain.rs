//! Reconciliation of categorical domains, so that two columns encoded with
//! different level lists can be compared row by row.
use crate::cloud::Cloud;
use crate::error::LiquidError;
use crate::frame::chunk::{Chunk, Values};
use crate::frame::column::{Column, ColumnType};
use crate::kv::Key;
use crate::mr::{Job, MrTask};
use log::debug;
use std::collections::{BTreeSet, HashMap};

/// The largest domain a numeric column may be converted to
const MAX_CATEGORICAL_LEVELS: usize = 1_000_000;

/// The sorted union of the levels of `a` and `b`
pub fn domain_union(a: &[String], b: &[String]) -> Vec<String> {
    let mut union: Vec<String> = a.iter().chain(b.iter()).cloned().collect();
    union.sort();
    union.dedup();
    union
}

/// For each index of `original`, the index of the same level in `combined`.
///
/// ## Errors
/// `InvalidDomain` if a level of `original` is missing from `combined`.
pub fn domain_mapping(
    combined: &[String],
    original: &[String],
) -> Result<Vec<u32>, LiquidError> {
    let positions: HashMap<&str, u32> = combined
        .iter()
        .enumerate()
        .map(|(i, level)| (level.as_str(), i as u32))
        .collect();
    original
        .iter()
        .map(|level| {
            positions.get(level.as_str()).copied().ok_or_else(|| {
                LiquidError::InvalidDomain(format!(
                    "level {} is missing from the combined domain",
                    level
                ))
            })
        })
        .collect()
}

/// Whether `mapping` maps every index to itself
pub fn is_identity(mapping: &[u32]) -> bool {
    mapping.iter().enumerate().all(|(i, &m)| i as u32 == m)
}

/// Collects the distinct values of an integer-valued column
struct DistinctIntegers;

impl DistinctIntegers {
    fn check(&self, levels: &BTreeSet<i64>) -> Result<(), LiquidError> {
        if levels.len() > MAX_CATEGORICAL_LEVELS {
            return Err(LiquidError::TypeMismatch(format!(
                "more than {} distinct values can not be made categorical",
                MAX_CATEGORICAL_LEVELS
            )));
        }
        Ok(())
    }
}

impl MrTask for DistinctIntegers {
    type Output = BTreeSet<i64>;

    fn map(&self, chunks: &[Chunk]) -> Result<BTreeSet<i64>, LiquidError> {
        let chunk = &chunks[0];
        let mut levels = BTreeSet::new();
        for i in (0..chunk.len()).filter(|&i| !chunk.is_na(i)) {
            let v = chunk.at(i);
            if !v.is_finite() || v.fract() != 0.0 {
                return Err(LiquidError::TypeMismatch(format!(
                    "{} is not an integer",
                    v
                )));
            }
            levels.insert(v as i64);
        }
        self.check(&levels)?;
        Ok(levels)
    }

    fn reduce(
        &self,
        mut left: BTreeSet<i64>,
        mut right: BTreeSet<i64>,
    ) -> Result<BTreeSet<i64>, LiquidError> {
        left.append(&mut right);
        self.check(&left)?;
        Ok(left)
    }
}

impl Cloud {
    /// Re-expresses the categorical `column` against the domain `combined`
    /// as a new column under `key`: a value with code `c` gets the code
    /// `mapping[c]`. The original column is left untouched.
    pub async fn remap_domain(
        &self,
        job: &Job,
        column: &Column,
        mapping: &[u32],
        combined: &[String],
        key: Key,
    ) -> Result<Column, LiquidError> {
        let domain = column.domain().ok_or_else(|| {
            LiquidError::TypeMismatch(format!("{} is not categorical", column.key))
        })?;
        if mapping.len() != domain.len() {
            return Err(LiquidError::InvalidDomain(format!(
                "a mapping of {} levels for a domain of {}",
                mapping.len(),
                domain.len()
            )));
        }
        if mapping.iter().any(|&m| m as usize >= combined.len()) {
            return Err(LiquidError::InvalidDomain(
                "the mapping points outside the combined domain".to_string(),
            ));
        }
        debug!("Remapping {} onto {} levels", column.key, combined.len());
        let mapping = mapping.to_vec();
        self.transform(
            job,
            column,
            key,
            ColumnType::Categorical,
            Some(combined.to_vec()),
            move |chunk: &Chunk| {
                let codes = (0..chunk.len())
                    .map(|i| match chunk.at8(i) {
                        None => Ok(None),
                        Some(code) => usize::try_from(code)
                            .ok()
                            .and_then(|c| mapping.get(c))
                            .map(|&m| Some(m as f64))
                            .ok_or_else(|| {
                                LiquidError::InvalidDomain(format!(
                                    "code {} is outside the domain",
                                    code
                                ))
                            }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Values::Numeric(codes))
            },
        )
        .await
    }

    /// Converts the integer-valued numeric `column` into a categorical
    /// column under `key`, whose domain is the distinct values in
    /// ascending numeric order.
    ///
    /// ## Errors
    /// `TypeMismatch` if the column is not numeric or holds a value that
    /// is not an integer.
    pub async fn to_categorical(
        &self,
        job: &Job,
        column: &Column,
        key: Key,
    ) -> Result<Column, LiquidError> {
        if !column.kind.is_numeric() {
            return Err(LiquidError::TypeMismatch(format!(
                "a {} column can not be made categorical",
                column.kind
            )));
        }
        let levels: Vec<i64> = self
            .run_job(job, DistinctIntegers, &[column])
            .await?
            .into_iter()
            .collect();
        let domain = levels.iter().map(|v| v.to_string()).collect();
        self.transform(
            job,
            column,
            key,
            ColumnType::Categorical,
            Some(domain),
            move |chunk: &Chunk| {
                let codes = (0..chunk.len())
                    .map(|i| match chunk.at8(i) {
                        None => Ok(None),
                        Some(v) => levels
                            .binary_search(&v)
                            .map(|pos| Some(pos as f64))
                            .map_err(|_| {
                                LiquidError::InvalidDomain(format!(
                                    "{} is not a level",
                                    v
                                ))
                            }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Values::Numeric(codes))
            },
        )
        .await
    }
}
