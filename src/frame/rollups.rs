//! Summary statistics of a column, computed on first request by a
//! map-reduce task and cached in the directory under the column's rollup key.
use crate::cloud::Cloud;
use crate::error::LiquidError;
use crate::frame::chunk::Chunk;
use crate::frame::column::Column;
use crate::mr::MrTask;
use deepsize::DeepSizeOf;
use log::debug;
use serde::{Deserialize, Serialize};

/// The number of smallest and largest distinct values kept
pub const MIN_MAX_COUNT: usize = 5;
/// The most bins a histogram is split into
pub const MAX_BINS: usize = 1000;
/// The percentiles computed with a histogram
pub const DEFAULT_PERCENTILES: [f64; 9] = [
    0.01,
    0.1,
    0.25,
    1.0 / 3.0,
    0.5,
    2.0 / 3.0,
    0.75,
    0.9,
    0.99,
];

/// Equal-width bins over the finite values of a column, with the
/// percentiles derived from them
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Histogram {
    /// The lower bound of the first bin
    pub base: f64,
    /// The width of a bin
    pub stride: f64,
    pub bins: Vec<u64>,
    /// The values at [`DEFAULT_PERCENTILES`]
    pub pctiles: Vec<f64>,
}

/// Summary statistics of a column. Text and UUID columns only count rows
/// and NAs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Rollups {
    pub rows: u64,
    pub na_cnt: u64,
    pub zero_cnt: u64,
    /// Non-missing, non-zero values
    pub nz_cnt: u64,
    pub pinf_cnt: u64,
    pub ninf_cnt: u64,
    /// Up to [`MIN_MAX_COUNT`] smallest distinct finite values, ascending
    pub mins: Vec<f64>,
    /// Up to [`MIN_MAX_COUNT`] largest distinct finite values, descending
    pub maxs: Vec<f64>,
    /// The mean of finite values, `NaN` if there are none
    pub mean: f64,
    /// The sample standard deviation of finite values
    pub sigma: f64,
    /// Whether there is a value and every value is a finite integer
    pub is_int: bool,
    /// The number of bytes the column's chunks take in memory
    pub byte_size: u64,
    histogram: Option<Histogram>,
}

impl Rollups {
    /// The smallest finite value
    pub fn min(&self) -> f64 {
        self.mins.first().copied().unwrap_or(f64::NAN)
    }

    /// The largest finite value
    pub fn max(&self) -> f64 {
        self.maxs.first().copied().unwrap_or(f64::NAN)
    }

    /// The histogram, only if it was already computed by
    /// [`Cloud::histogram`]
    pub fn histogram(&self) -> Option<&Histogram> {
        self.histogram.as_ref()
    }

    /// The percentiles, only if the histogram was already computed
    pub fn pctiles(&self) -> Option<&[f64]> {
        self.histogram.as_ref().map(|h| &h.pctiles[..])
    }

    /// Whether every row is missing
    pub fn is_bad(&self) -> bool {
        self.na_cnt == self.rows
    }

    /// Whether every non-missing value is the same
    pub fn is_const(&self) -> bool {
        self.rows > self.na_cnt
            && self.pinf_cnt + self.ninf_cnt == 0
            && self.min() == self.max()
    }
}

/// The partial state of a rollup computation
#[derive(Serialize, Deserialize, Clone, Debug)]
struct RollupAcc {
    rows: u64,
    na: u64,
    zeros: u64,
    pinfs: u64,
    ninfs: u64,
    /// The number of finite values
    n: u64,
    mean: f64,
    /// The sum of squared differences from the mean
    m2: f64,
    mins: Vec<f64>,
    maxs: Vec<f64>,
    is_int: bool,
    bytes: u64,
}

impl RollupAcc {
    fn new() -> Self {
        RollupAcc {
            rows: 0,
            na: 0,
            zeros: 0,
            pinfs: 0,
            ninfs: 0,
            n: 0,
            mean: 0.0,
            m2: 0.0,
            mins: Vec::new(),
            maxs: Vec::new(),
            is_int: true,
            bytes: 0,
        }
    }

    fn add(&mut self, v: f64) {
        if v == f64::INFINITY {
            self.pinfs += 1;
            self.is_int = false;
            return;
        }
        if v == f64::NEG_INFINITY {
            self.ninfs += 1;
            self.is_int = false;
            return;
        }
        if v == 0.0 {
            self.zeros += 1;
        }
        if v.fract() != 0.0 {
            self.is_int = false;
        }
        self.n += 1;
        let delta = v - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (v - self.mean);
        keep_extremes(&mut self.mins, v, |a, b| a < b);
        keep_extremes(&mut self.maxs, v, |a, b| a > b);
    }

    fn finish(self) -> Rollups {
        let (mean, sigma) = match self.n {
            0 => (f64::NAN, f64::NAN),
            1 => (self.mean, 0.0),
            n => (self.mean, (self.m2 / (n - 1) as f64).sqrt()),
        };
        Rollups {
            rows: self.rows,
            na_cnt: self.na,
            zero_cnt: self.zeros,
            nz_cnt: self.rows - self.na - self.zeros,
            pinf_cnt: self.pinfs,
            ninf_cnt: self.ninfs,
            mins: self.mins,
            maxs: self.maxs,
            mean,
            sigma,
            is_int: self.is_int && self.n > 0,
            byte_size: self.bytes,
            histogram: None,
        }
    }
}

/// Inserts `v` into the sorted, distinct `extremes` if it ranks among the
/// first `MIN_MAX_COUNT` by `before`
fn keep_extremes(extremes: &mut Vec<f64>, v: f64, before: fn(f64, f64) -> bool) {
    if extremes.contains(&v) {
        return;
    }
    let pos = extremes.iter().position(|&e| before(v, e)).unwrap_or(extremes.len());
    if pos < MIN_MAX_COUNT {
        extremes.insert(pos, v);
        extremes.truncate(MIN_MAX_COUNT);
    }
}

struct RollupTask;

impl MrTask for RollupTask {
    type Output = RollupAcc;

    fn map(&self, chunks: &[Chunk]) -> Result<RollupAcc, LiquidError> {
        let chunk = &chunks[0];
        let mut acc = RollupAcc::new();
        acc.rows = chunk.len() as u64;
        acc.bytes = chunk.deep_size_of() as u64;
        for i in 0..chunk.len() {
            if chunk.is_na(i) {
                acc.na += 1;
            } else if chunk.is_numeric() {
                acc.add(chunk.at(i));
            }
        }
        if !chunk.is_numeric() {
            acc.is_int = false;
        }
        Ok(acc)
    }

    /// Merges with Chan's parallel algorithm for the variance
    fn reduce(&self, l: RollupAcc, r: RollupAcc) -> Result<RollupAcc, LiquidError> {
        let n = l.n + r.n;
        let (mean, m2) = if n == 0 {
            (0.0, 0.0)
        } else {
            let delta = r.mean - l.mean;
            let mean = l.mean + delta * (r.n as f64 / n as f64);
            let m2 = l.m2 + r.m2 + delta * delta * (l.n as f64 * r.n as f64 / n as f64);
            (mean, m2)
        };
        let mut mins = l.mins;
        for v in r.mins {
            keep_extremes(&mut mins, v, |a, b| a < b);
        }
        let mut maxs = l.maxs;
        for v in r.maxs {
            keep_extremes(&mut maxs, v, |a, b| a > b);
        }
        Ok(RollupAcc {
            rows: l.rows + r.rows,
            na: l.na + r.na,
            zeros: l.zeros + r.zeros,
            pinfs: l.pinfs + r.pinfs,
            ninfs: l.ninfs + r.ninfs,
            n,
            mean,
            m2,
            mins,
            maxs,
            is_int: l.is_int && r.is_int,
            bytes: l.bytes + r.bytes,
        })
    }
}

/// Counts finite values into `nbins` bins of width `stride` from `base`
struct HistogramTask {
    base: f64,
    stride: f64,
    nbins: usize,
}

impl MrTask for HistogramTask {
    type Output = Vec<u64>;

    fn map(&self, chunks: &[Chunk]) -> Result<Vec<u64>, LiquidError> {
        let chunk = &chunks[0];
        let mut bins = vec![0; self.nbins];
        if !chunk.is_numeric() {
            return Ok(bins);
        }
        for i in (0..chunk.len()).filter(|&i| !chunk.is_na(i)) {
            let v = chunk.at(i);
            if v.is_finite() {
                let idx = ((v - self.base) / self.stride).floor() as i64;
                bins[idx.clamp(0, self.nbins as i64 - 1) as usize] += 1;
            }
        }
        Ok(bins)
    }

    fn reduce(&self, mut l: Vec<u64>, r: Vec<u64>) -> Result<Vec<u64>, LiquidError> {
        if l.len() != r.len() {
            return Err(LiquidError::Execution(
                "histograms with different bin counts".to_string(),
            ));
        }
        l.iter_mut().zip(r).for_each(|(a, b)| *a += b);
        Ok(l)
    }
}

/// The bin layout of the histogram of a column with the given rollups,
/// `None` if the column has no finite values
fn bin_layout(rollups: &Rollups) -> Option<(f64, f64, usize)> {
    let (min, max) = (rollups.min(), rollups.max());
    if min.is_nan() {
        return None;
    }
    let span = max - min;
    if rollups.is_int && span < MAX_BINS as f64 {
        Some((min, 1.0, span as usize + 1))
    } else if span == 0.0 {
        Some((min, 1.0, 1))
    } else {
        Some((min, span / MAX_BINS as f64, MAX_BINS))
    }
}

/// The value below which a fraction `p` of the counted values lie
fn percentile(
    bins: &[u64],
    base: f64,
    stride: f64,
    exact: bool,
    p: f64,
    bounds: (f64, f64),
) -> f64 {
    let total: u64 = bins.iter().sum();
    if total == 0 {
        return f64::NAN;
    }
    let target = (p * (total - 1) as f64).floor() as u64;
    let mut seen = 0;
    for (b, &count) in bins.iter().enumerate() {
        if count > 0 && target < seen + count {
            let value = if exact {
                base + b as f64
            } else {
                let within = (target - seen) as f64 + 0.5;
                base + stride * (b as f64 + within / count as f64)
            };
            return value.clamp(bounds.0, bounds.1);
        }
        seen += count;
    }
    bounds.1
}

impl Cloud {
    /// The rollups of `column`, computed and cached on first request
    pub async fn rollups(&self, column: &Column) -> Result<Rollups, LiquidError> {
        if let Some(rollups) = self.kv().get(&column.rollups_key()).await? {
            return Ok(rollups);
        }
        debug!("Computing rollups of {}", column.key);
        let rollups = self.run(RollupTask, &[column]).await?.finish();
        self.kv().put(&column.rollups_key(), &rollups).await?;
        Ok(rollups)
    }

    /// The rollups of `column` including its histogram and percentiles,
    /// computing and caching them if they were not yet
    pub async fn histogram(&self, column: &Column) -> Result<Rollups, LiquidError> {
        let mut rollups = self.rollups(column).await?;
        if rollups.histogram.is_some() {
            return Ok(rollups);
        }
        let (base, stride, nbins) = match bin_layout(&rollups) {
            Some(bins) => bins,
            None => return Ok(rollups),
        };
        debug!("Computing a {} bin histogram of {}", nbins, column.key);
        let bins = self.run(HistogramTask { base, stride, nbins }, &[column]).await?;
        let exact = rollups.is_int && stride == 1.0;
        let bounds = (rollups.min(), rollups.max());
        let pctiles = DEFAULT_PERCENTILES
            .iter()
            .map(|&p| percentile(&bins, base, stride, exact, p, bounds))
            .collect();
        rollups.histogram = Some(Histogram {
            base,
            stride,
            bins,
            pctiles,
        });
        self.kv().put(&column.rollups_key(), &rollups).await?;
        Ok(rollups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudConfig;
    use crate::frame::column::ColumnData;

    fn cloud(num_nodes: usize, chunk_rows: u64) -> Cloud {
        Cloud::new(
            CloudConfig::default()
                .with_nodes(num_nodes)
                .with_chunk_rows(chunk_rows),
        )
        .unwrap()
    }

    #[test]
    fn test_keep_extremes() {
        let mut mins = Vec::new();
        for v in [5.0, 3.0, 9.0, 3.0, 1.0, 7.0, 2.0, 8.0] {
            keep_extremes(&mut mins, v, |a, b| a < b);
        }
        assert_eq!(mins, vec![1.0, 2.0, 3.0, 5.0, 7.0]);
    }

    #[tokio::test]
    async fn test_infinities_are_not_integers() {
        let cloud = cloud(2, 2);
        let ints = vec![Some(1.0), None, Some(2.0)];
        let ints = cloud.new_column("ints", ColumnData::Numeric(ints)).await.unwrap();
        assert!(cloud.rollups(&ints).await.unwrap().is_int);

        for (name, inf) in [("pinf", f64::INFINITY), ("ninf", f64::NEG_INFINITY)] {
            let values = vec![Some(1.0), Some(inf), Some(2.0)];
            let col = cloud.new_column(name, ColumnData::Numeric(values)).await.unwrap();
            let r = cloud.rollups(&col).await.unwrap();
            assert!(!r.is_int);
            assert_eq!(r.pinf_cnt + r.ninf_cnt, 1);
            assert_eq!(r.mins, vec![1.0, 2.0]);
        }
    }

    #[tokio::test]
    async fn test_rollups() {
        let cloud = cloud(3, 3);
        let values = vec![
            Some(1.0),
            Some(0.0),
            None,
            Some(f64::INFINITY),
            Some(4.0),
            Some(-3.0),
            Some(0.0),
            Some(6.0),
        ];
        let col = cloud.new_column("r", ColumnData::Numeric(values)).await.unwrap();
        let r = cloud.rollups(&col).await.unwrap();
        assert_eq!(r.rows, 8);
        assert_eq!(r.na_cnt, 1);
        assert_eq!(r.zero_cnt, 2);
        assert_eq!(r.nz_cnt, 5);
        assert_eq!(r.pinf_cnt, 1);
        assert_eq!(r.ninf_cnt, 0);
        assert_eq!(r.mins, vec![-3.0, 0.0, 1.0, 4.0, 6.0]);
        assert_eq!(r.maxs, vec![6.0, 4.0, 1.0, 0.0, -3.0]);
        assert!((r.mean - 4.0 / 3.0).abs() < 1e-12);
        let var = [1.0f64, 0.0, 4.0, -3.0, 0.0, 6.0]
            .iter()
            .map(|v| (v - 4.0 / 3.0).powi(2))
            .sum::<f64>()
            / 5.0;
        assert!((r.sigma - var.sqrt()).abs() < 1e-12);
        // an infinity is not an integer
        assert!(!r.is_int);
        assert!(r.byte_size > 0);
        assert!(r.histogram().is_none());
        assert!(!r.is_bad());
        assert!(!r.is_const());
    }

    #[tokio::test]
    async fn test_rollups_are_cached() {
        let cloud = cloud(2, 2);
        let col = cloud
            .new_column("c", ColumnData::Numeric(vec![Some(2.5), Some(2.5), None]))
            .await
            .unwrap();
        let first = cloud.rollups(&col).await.unwrap();
        assert!(cloud.kv().get::<Rollups>(&col.rollups_key()).await.unwrap().is_some());
        let second = cloud.rollups(&col).await.unwrap();
        assert_eq!(first, second);
        assert!(first.is_const());
        assert!(!first.is_int);
    }

    #[tokio::test]
    async fn test_all_na_and_text() {
        let cloud = cloud(2, 2);
        let nas = cloud
            .new_column("nas", ColumnData::Numeric(vec![None; 3]))
            .await
            .unwrap();
        let r = cloud.histogram(&nas).await.unwrap();
        assert!(r.is_bad());
        assert!(r.mean.is_nan());
        assert!(r.histogram().is_none());

        let text = ColumnData::Text(vec![Some("a".to_string()), None]);
        let text = cloud.new_column("text", text).await.unwrap();
        let r = cloud.rollups(&text).await.unwrap();
        assert_eq!((r.rows, r.na_cnt), (2, 1));
        assert!(r.mins.is_empty());
        assert!(!r.is_int);
    }

    #[tokio::test]
    async fn test_integer_histogram_and_percentiles() {
        let cloud = cloud(2, 16);
        let values = (1..=100).map(|i| Some(i as f64)).collect();
        let col = cloud.new_column("h", ColumnData::Numeric(values)).await.unwrap();
        let r = cloud.histogram(&col).await.unwrap();
        let h = r.histogram().unwrap();
        assert_eq!(h.base, 1.0);
        assert_eq!(h.stride, 1.0);
        assert_eq!(h.bins.len(), 100);
        assert!(h.bins.iter().all(|&b| b == 1));
        let p = r.pctiles().unwrap();
        assert_eq!(p.len(), DEFAULT_PERCENTILES.len());
        assert_eq!(p[0], 1.0);
        assert_eq!(p[2], 25.0);
        assert_eq!(p[4], 50.0);
        assert_eq!(p[8], 99.0);
        // the cached rollups now carry the histogram
        assert!(cloud.rollups(&col).await.unwrap().histogram().is_some());
    }

    #[tokio::test]
    async fn test_real_histogram() {
        let cloud = cloud(1, 10);
        let values = (0..50).map(|i| Some(i as f64 / 4.0)).collect();
        let col = cloud.new_column("reals", ColumnData::Numeric(values)).await.unwrap();
        let r = cloud.histogram(&col).await.unwrap();
        let h = r.histogram().unwrap();
        assert_eq!(h.bins.len(), MAX_BINS);
        assert_eq!(h.bins.iter().sum::<u64>(), 50);
        let p = r.pctiles().unwrap();
        assert!(p.windows(2).all(|w| w[0] <= w[1]));
        assert!(p.iter().all(|&v| (0.0..=12.25).contains(&v)));
    }
}
