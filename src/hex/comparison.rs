//! Compares a column of actual values with a column of predictions, giving a
//! confusion matrix when both are categorical or a mean squared error when
//! both are numeric.
use crate::cloud::Cloud;
use crate::error::LiquidError;
use crate::frame::chunk::Chunk;
use crate::frame::column::Column;
use crate::frame::domain::{domain_mapping, domain_union, is_identity};
use crate::kv::Key;
use crate::mr::{Job, MrTask};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of a comparison, one of two modes chosen from the types of
/// the compared columns
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Comparison {
    /// `matrix[actual][predicted]` counts the rows with each pair of
    /// levels of `domain`. The extra last row and column count NAs.
    Classification {
        domain: Vec<String>,
        matrix: Vec<Vec<u64>>,
    },
    /// The sum of squared errors over the `count` rows where neither value
    /// is NA
    Regression { sum: f64, count: u64 },
}

/// How a comparison treats its inputs
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompareOptions {
    /// Compare two integer-valued numeric columns as categorical columns
    /// whose levels are their distinct values
    pub to_categorical: bool,
}

impl Comparison {
    /// Compares the columns published under `actual` and `predicted`
    pub async fn compute(
        cloud: &Cloud,
        actual: &Key,
        predicted: &Key,
    ) -> Result<Comparison, LiquidError> {
        Comparison::compute_with(
            cloud,
            &Job::new(),
            actual,
            predicted,
            &CompareOptions::default(),
        )
        .await
    }

    /// Compares the columns published under `actual` and `predicted`.
    ///
    /// Both columns are resolved and checked before any partition work
    /// starts. Every temporary column the comparison creates, to convert,
    /// reconcile or align its inputs, is removed before this returns,
    /// whether it succeeds, fails or is cancelled through `job`.
    ///
    /// ## Errors
    /// - `MissingColumn` if either column is not published
    /// - `LengthMismatch` if the columns have different row counts
    /// - `TypeMismatch` unless both columns are categorical or both numeric
    pub async fn compute_with(
        cloud: &Cloud,
        job: &Job,
        actual: &Key,
        predicted: &Key,
        options: &CompareOptions,
    ) -> Result<Comparison, LiquidError> {
        let actual = resolve(cloud, actual, "actual").await?;
        let predicted = resolve(cloud, predicted, "predicted").await?;
        if actual.len() != predicted.len() {
            return Err(LiquidError::LengthMismatch {
                left: actual.len(),
                right: predicted.len(),
            });
        }
        let classify = match (actual.is_categorical(), predicted.is_categorical()) {
            (true, true) => true,
            (false, false) if actual.kind.is_numeric() && predicted.kind.is_numeric() => false,
            (true, false) => {
                return Err(LiquidError::TypeMismatch(
                    "the actual column is categorical but the predicted column is not"
                        .to_string(),
                ))
            }
            (false, true) => {
                return Err(LiquidError::TypeMismatch(
                    "the predicted column is categorical but the actual column is not"
                        .to_string(),
                ))
            }
            _ => {
                return Err(LiquidError::TypeMismatch(format!(
                    "can not compare a {} column with a {} column",
                    actual.kind, predicted.kind
                )))
            }
        };

        let mut temps = Vec::new();
        let result = if classify {
            classify_columns(cloud, job, actual, predicted, &mut temps).await
        } else {
            regress_columns(cloud, job, actual, predicted, options, &mut temps).await
        };
        for key in temps {
            if let Err(e) = cloud.remove_column(&key).await {
                warn!("Could not remove temporary column {}: {}", key, e);
            }
        }
        result
    }

    pub fn is_classification(&self) -> bool {
        matches!(self, Comparison::Classification { .. })
    }

    /// The confusion matrix of a classification
    pub fn matrix(&self) -> Option<&[Vec<u64>]> {
        match self {
            Comparison::Classification { matrix, .. } => Some(matrix),
            Comparison::Regression { .. } => None,
        }
    }

    /// The combined domain of a classification
    pub fn domain(&self) -> Option<&[String]> {
        match self {
            Comparison::Classification { domain, .. } => Some(domain),
            Comparison::Regression { .. } => None,
        }
    }

    /// The mean squared error of a regression, positive infinity if no row
    /// could be compared
    pub fn mse(&self) -> Option<f64> {
        match self {
            Comparison::Regression { count: 0, .. } => Some(f64::INFINITY),
            Comparison::Regression { sum, count } => Some(sum / *count as f64),
            Comparison::Classification { .. } => None,
        }
    }

    /// The fraction of rows of a classification whose predicted level is
    /// not the actual level, NA rows included
    pub fn error_rate(&self) -> Option<f64> {
        let matrix = self.matrix()?;
        let total: u64 = matrix.iter().flatten().sum();
        let right: u64 = (0..matrix.len().saturating_sub(1)).map(|i| matrix[i][i]).sum();
        Some(if total == 0 {
            0.0
        } else {
            (total - right) as f64 / total as f64
        })
    }
}

async fn resolve(cloud: &Cloud, key: &Key, role: &str) -> Result<Column, LiquidError> {
    cloud
        .get_column(key)
        .await?
        .ok_or_else(|| LiquidError::MissingColumn(format!("{} column {}", role, key)))
}

/// Runs a step that creates a temporary column, recording its key for
/// removal
async fn temporary(
    temps: &mut Vec<Key>,
    column: impl std::future::Future<Output = Result<Column, LiquidError>>,
) -> Result<Column, LiquidError> {
    let column = column.await?;
    temps.push(column.key.clone());
    Ok(column)
}

async fn classify_columns(
    cloud: &Cloud,
    job: &Job,
    mut actual: Column,
    mut predicted: Column,
    temps: &mut Vec<Key>,
) -> Result<Comparison, LiquidError> {
    let a_domain = actual.domain.clone().unwrap_or_default();
    let p_domain = predicted.domain.clone().unwrap_or_default();
    let domain = if a_domain == p_domain {
        a_domain
    } else {
        let combined = domain_union(&a_domain, &p_domain);
        debug!(
            "Reconciling domains of {} and {} into {} levels",
            actual.key,
            predicted.key,
            combined.len()
        );
        let a_map = domain_mapping(&combined, &a_domain)?;
        if !is_identity(&a_map) {
            let key = Key::generate("cm-actual", actual.key.home);
            actual = temporary(temps, cloud.remap_domain(job, &actual, &a_map, &combined, key))
                .await?;
        }
        let p_map = domain_mapping(&combined, &p_domain)?;
        if !is_identity(&p_map) {
            let key = Key::generate("cm-predicted", predicted.key.home);
            predicted =
                temporary(temps, cloud.remap_domain(job, &predicted, &p_map, &combined, key))
                    .await?;
        }
        combined
    };
    let predicted = align_to(cloud, job, &actual, predicted, temps).await?;
    let matrix = cloud
        .run_job(job, ConfusionTask { n: domain.len() }, &[&actual, &predicted])
        .await?;
    info!("Computed a {}x{} confusion matrix", matrix.len(), matrix.len());
    Ok(Comparison::Classification { domain, matrix })
}

async fn regress_columns(
    cloud: &Cloud,
    job: &Job,
    actual: Column,
    predicted: Column,
    options: &CompareOptions,
    temps: &mut Vec<Key>,
) -> Result<Comparison, LiquidError> {
    if options.to_categorical
        && cloud.rollups(&actual).await?.is_int
        && cloud.rollups(&predicted).await?.is_int
    {
        let key = Key::generate("cm-actual-enum", actual.key.home);
        let actual = temporary(temps, cloud.to_categorical(job, &actual, key)).await?;
        let key = Key::generate("cm-predicted-enum", predicted.key.home);
        let predicted = temporary(temps, cloud.to_categorical(job, &predicted, key)).await?;
        return classify_columns(cloud, job, actual, predicted, temps).await;
    }
    let predicted = align_to(cloud, job, &actual, predicted, temps).await?;
    let (sum, count) = cloud
        .run_job(job, MseTask, &[&actual, &predicted])
        .await?;
    info!("Compared {} rows, squared error sum {}", count, sum);
    Ok(Comparison::Regression { sum, count })
}

/// `column` re-chunked onto the layout of `target`, as a temporary column
/// if the layouts differ
async fn align_to(
    cloud: &Cloud,
    job: &Job,
    target: &Column,
    column: Column,
    temps: &mut Vec<Key>,
) -> Result<Column, LiquidError> {
    if column.layout == target.layout {
        return Ok(column);
    }
    let key = Key::generate("cm-aligned", column.key.home);
    temporary(temps, cloud.align(job, &column, &target.layout, key)).await
}

/// Counts (actual, predicted) code pairs, NA going to the extra level `n`
struct ConfusionTask {
    n: usize,
}

impl ConfusionTask {
    fn code(&self, chunk: &Chunk, i: usize) -> Result<usize, LiquidError> {
        match chunk.at8(i) {
            None => Ok(self.n),
            Some(c) if c >= 0 && (c as usize) < self.n => Ok(c as usize),
            Some(c) => Err(LiquidError::InvalidDomain(format!(
                "code {} is outside a domain of {} levels",
                c, self.n
            ))),
        }
    }
}

impl MrTask for ConfusionTask {
    type Output = Vec<Vec<u64>>;

    fn map(&self, chunks: &[Chunk]) -> Result<Vec<Vec<u64>>, LiquidError> {
        let (actual, predicted) = (&chunks[0], &chunks[1]);
        let mut matrix = vec![vec![0; self.n + 1]; self.n + 1];
        let shared = actual.len().min(predicted.len());
        for i in 0..shared {
            matrix[self.code(actual, i)?][self.code(predicted, i)?] += 1;
        }
        // rows only one side has are compared against NA
        for i in shared..actual.len() {
            matrix[self.code(actual, i)?][self.n] += 1;
        }
        for i in shared..predicted.len() {
            matrix[self.n][self.code(predicted, i)?] += 1;
        }
        Ok(matrix)
    }

    fn reduce(
        &self,
        mut left: Vec<Vec<u64>>,
        right: Vec<Vec<u64>>,
    ) -> Result<Vec<Vec<u64>>, LiquidError> {
        for (l, r) in left.iter_mut().zip(right) {
            l.iter_mut().zip(r).for_each(|(a, b)| *a += b);
        }
        Ok(left)
    }
}

/// Sums squared errors over rows where neither value is NA
struct MseTask;

impl MrTask for MseTask {
    type Output = (f64, u64);

    fn map(&self, chunks: &[Chunk]) -> Result<(f64, u64), LiquidError> {
        let (actual, predicted) = (&chunks[0], &chunks[1]);
        let mut sum = 0.0;
        let mut count = 0;
        for i in 0..actual.len().min(predicted.len()) {
            if actual.is_na(i) || predicted.is_na(i) {
                continue;
            }
            let err = predicted.at(i) - actual.at(i);
            sum += err * err;
            count += 1;
        }
        Ok((sum, count))
    }

    fn reduce(&self, l: (f64, u64), r: (f64, u64)) -> Result<(f64, u64), LiquidError> {
        Ok((l.0 + r.0, l.1 + r.1))
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (domain, matrix) = match self {
            Comparison::Regression { .. } => {
                return write!(f, "MSE: {}", self.mse().unwrap_or(f64::INFINITY))
            }
            Comparison::Classification { domain, matrix } => (domain, matrix),
        };
        let labels: Vec<&str> = domain
            .iter()
            .map(|s| s.as_str())
            .chain(std::iter::once("NA"))
            .collect();
        let width = labels
            .iter()
            .map(|l| l.len())
            .chain(std::iter::once("Act/Pred".len()))
            .chain(matrix.iter().flatten().map(|c| c.to_string().len()))
            .max()
            .unwrap_or(0)
            + 1;

        write!(f, "{:>w$}", "Act/Pred", w = width)?;
        for label in &labels {
            write!(f, "{:>w$}", label, w = width)?;
        }
        writeln!(f, "{:>w$}   Error", "Totals", w = width)?;

        let mut col_totals = vec![0u64; labels.len()];
        let (mut total, mut wrong) = (0u64, 0u64);
        for (a, row) in matrix.iter().enumerate() {
            let row_total: u64 = row.iter().sum();
            let row_wrong = row_total - if a < domain.len() { row[a] } else { 0 };
            write!(f, "{:>w$}", labels[a], w = width)?;
            for (p, count) in row.iter().enumerate() {
                col_totals[p] += count;
                write!(f, "{:>w$}", count, w = width)?;
            }
            let rate = if row_total == 0 {
                0.0
            } else {
                row_wrong as f64 / row_total as f64
            };
            writeln!(
                f,
                "{:>w$}   {:.3} = {} / {}",
                row_total,
                rate,
                row_wrong,
                row_total,
                w = width
            )?;
            total += row_total;
            wrong += row_wrong;
        }
        write!(f, "{:>w$}", "Totals", w = width)?;
        for count in &col_totals {
            write!(f, "{:>w$}", count, w = width)?;
        }
        let rate = if total == 0 {
            0.0
        } else {
            wrong as f64 / total as f64
        };
        write!(
            f,
            "{:>w$}   {:.3} = {} / {}",
            total,
            rate,
            wrong,
            total,
            w = width
        )
    }
}
