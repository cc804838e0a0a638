//! Defines the `Chunk`, one node-local partition of a column, and the compact
//! encodings a chunk's values are stored in.
use crate::error::LiquidError;
use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// The largest number of decimal digits a fixed-point encoding will keep
const MAX_EXPONENT: u8 = 6;
/// Integers with a magnitude above this can not be stored exactly in an `f64`
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0;
const NA_UUID: (i64, i64) = (i64::MIN, i64::MIN);

/// A contiguous run of one column's values, starting at global row `start`.
///
/// Chunks are immutable once published: a change to a column's values always
/// produces new chunks under a new column key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, DeepSizeOf)]
pub struct Chunk {
    start: u64,
    encoding: Encoding,
}

/// The storage of a chunk's values. Numeric encodings are chosen per chunk
/// by [`Encoding::compress`] to use the narrowest representation that
/// reproduces every value bit for bit.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, DeepSizeOf)]
pub enum Encoding {
    /// Every row holds the same value, `None` for a chunk of NAs
    Const { value: Option<f64>, len: usize },
    /// `value = x + bias`, NA is `u8::MAX`
    Int8 { data: Vec<u8>, bias: i64 },
    /// `value = x + bias`, NA is `u16::MAX`
    Int16 { data: Vec<u16>, bias: i64 },
    /// `value = x + bias`, NA is `u32::MAX`
    Int32 { data: Vec<u32>, bias: i64 },
    /// NA is `i64::MIN`
    Int64 { data: Vec<i64> },
    /// Fixed-point decimals, `value = (x + bias) / 10^exponent`, NA is
    /// `u16::MAX`
    Scaled16 {
        data: Vec<u16>,
        bias: i64,
        exponent: u8,
    },
    /// Fixed-point decimals, `value = (x + bias) / 10^exponent`, NA is
    /// `u32::MAX`
    Scaled32 {
        data: Vec<u32>,
        bias: i64,
        exponent: u8,
    },
    /// Raw doubles, NA is `NaN`
    Double { data: Vec<f64> },
    Str { data: Vec<Option<String>> },
    /// The low and high halves of each UUID, NA is `(i64::MIN, i64::MIN)`
    Uuid { lo: Vec<i64>, hi: Vec<i64> },
}

/// Decoded values of a run of rows, used to build chunks and to move rows
/// between chunks.
#[derive(Clone, Debug, PartialEq)]
pub enum Values {
    /// Numbers, categorical codes and timestamps
    Numeric(Vec<Option<f64>>),
    Text(Vec<Option<String>>),
    Uuid(Vec<Option<u128>>),
}

impl Values {
    /// The number of rows held
    pub fn len(&self) -> usize {
        match self {
            Values::Numeric(v) => v.len(),
            Values::Text(v) => v.len(),
            Values::Uuid(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty `Values` of the same kind as `self`
    pub fn empty_like(&self) -> Values {
        match self {
            Values::Numeric(_) => Values::Numeric(Vec::new()),
            Values::Text(_) => Values::Text(Vec::new()),
            Values::Uuid(_) => Values::Uuid(Vec::new()),
        }
    }

    /// Copies the rows in `range` out of `self`
    pub fn slice(&self, range: Range<usize>) -> Values {
        match self {
            Values::Numeric(v) => Values::Numeric(v[range].to_vec()),
            Values::Text(v) => Values::Text(v[range].to_vec()),
            Values::Uuid(v) => Values::Uuid(v[range].to_vec()),
        }
    }

    /// Appends the rows of `other` to `self`
    pub fn append(&mut self, other: Values) -> Result<(), LiquidError> {
        match (self, other) {
            (Values::Numeric(l), Values::Numeric(r)) => l.extend(r),
            (Values::Text(l), Values::Text(r)) => l.extend(r),
            (Values::Uuid(l), Values::Uuid(r)) => l.extend(r),
            _ => {
                return Err(LiquidError::TypeMismatch(
                    "Can not append values of a different kind".to_string(),
                ))
            }
        }
        Ok(())
    }
}

impl Encoding {
    /// Picks the narrowest encoding that stores every value of `values`
    /// exactly. `NaN` is treated as a missing value.
    pub fn compress(values: &[Option<f64>]) -> Encoding {
        let values: Vec<Option<f64>> =
            values.iter().map(|v| v.filter(|x| !x.is_nan())).collect();
        let len = values.len();
        match values.first() {
            None => return Encoding::Const { value: None, len: 0 },
            Some(first) => {
                if values.iter().all(|v| same_bits(*v, *first)) {
                    return Encoding::Const { value: *first, len };
                }
            }
        }

        if let Some(ints) = as_integers(&values) {
            return compress_integers(&ints);
        }
        for exponent in 1..=MAX_EXPONENT {
            if let Some(enc) = compress_scaled(&values, exponent) {
                return enc;
            }
        }
        Encoding::Double {
            data: values.iter().map(|v| v.unwrap_or(f64::NAN)).collect(),
        }
    }

    /// A short name of this encoding, for logging and inspection
    pub fn name(&self) -> &'static str {
        match self {
            Encoding::Const { .. } => "const",
            Encoding::Int8 { .. } => "int8",
            Encoding::Int16 { .. } => "int16",
            Encoding::Int32 { .. } => "int32",
            Encoding::Int64 { .. } => "int64",
            Encoding::Scaled16 { .. } => "scaled16",
            Encoding::Scaled32 { .. } => "scaled32",
            Encoding::Double { .. } => "double",
            Encoding::Str { .. } => "str",
            Encoding::Uuid { .. } => "uuid",
        }
    }
}

fn same_bits(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x.to_bits() == y.to_bits(),
        _ => false,
    }
}

fn as_integers(values: &[Option<f64>]) -> Option<Vec<Option<i64>>> {
    values
        .iter()
        .map(|v| match v {
            None => Some(None),
            Some(x) => {
                let i = *x as i64;
                if x.abs() <= MAX_EXACT_INT && (i as f64).to_bits() == x.to_bits()
                {
                    Some(Some(i))
                } else {
                    None
                }
            }
        })
        .collect()
}

fn min_max(values: &[Option<i64>]) -> Option<(i64, i64)> {
    values.iter().flatten().fold(None, |acc, &x| match acc {
        None => Some((x, x)),
        Some((lo, hi)) => Some((lo.min(x), hi.max(x))),
    })
}

macro_rules! biased {
    ($values:expr, $bias:expr, $ty:ty) => {
        $values
            .iter()
            .map(|v| match v {
                Some(x) => (x - $bias) as $ty,
                None => <$ty>::MAX,
            })
            .collect::<Vec<$ty>>()
    };
}

fn compress_integers(values: &[Option<i64>]) -> Encoding {
    let (min, max) = match min_max(values) {
        Some(bounds) => bounds,
        None => return Encoding::Const { value: None, len: values.len() },
    };
    let span = max - min;
    if span < u8::MAX as i64 {
        Encoding::Int8 { data: biased!(values, min, u8), bias: min }
    } else if span < u16::MAX as i64 {
        Encoding::Int16 { data: biased!(values, min, u16), bias: min }
    } else if span < u32::MAX as i64 {
        Encoding::Int32 { data: biased!(values, min, u32), bias: min }
    } else {
        Encoding::Int64 {
            data: values.iter().map(|v| v.unwrap_or(i64::MIN)).collect(),
        }
    }
}

fn compress_scaled(values: &[Option<f64>], exponent: u8) -> Option<Encoding> {
    let scale = 10f64.powi(exponent as i32);
    let scaled: Vec<Option<i64>> = values
        .iter()
        .map(|v| match v {
            None => Some(None),
            Some(x) => {
                let s = (x * scale).round();
                if s.abs() <= MAX_EXACT_INT
                    && ((s as i64) as f64 / scale).to_bits() == x.to_bits()
                {
                    Some(Some(s as i64))
                } else {
                    None
                }
            }
        })
        .collect::<Option<Vec<_>>>()?;
    let (min, max) = min_max(&scaled)?;
    let span = max - min;
    if span < u16::MAX as i64 {
        Some(Encoding::Scaled16 {
            data: biased!(scaled, min, u16),
            bias: min,
            exponent,
        })
    } else if span < u32::MAX as i64 {
        Some(Encoding::Scaled32 {
            data: biased!(scaled, min, u32),
            bias: min,
            exponent,
        })
    } else {
        None
    }
}

fn unscale(x: i64, exponent: u8) -> f64 {
    x as f64 / 10f64.powi(exponent as i32)
}

fn uuid_halves(v: Option<u128>) -> (i64, i64) {
    match v {
        Some(u) => (u as u64 as i64, (u >> 64) as u64 as i64),
        None => NA_UUID,
    }
}

/// The accessor contract of a chunk. Row indices are local to the chunk;
/// accessors panic if `i >= self.len()`, like slice indexing.
impl Chunk {
    /// Builds a chunk starting at global row `start` holding `values`,
    /// choosing its encoding.
    pub fn from_values(start: u64, values: Values) -> Self {
        let encoding = match values {
            Values::Numeric(v) => Encoding::compress(&v),
            Values::Text(data) => Encoding::Str { data },
            Values::Uuid(v) => {
                let (lo, hi) = v.into_iter().map(uuid_halves).unzip();
                Encoding::Uuid { lo, hi }
            }
        };
        Chunk { start, encoding }
    }

    /// The global row index of this chunk's first row
    pub fn start(&self) -> u64 {
        self.start
    }

    /// The number of rows in this chunk
    pub fn len(&self) -> usize {
        match &self.encoding {
            Encoding::Const { len, .. } => *len,
            Encoding::Int8 { data, .. } => data.len(),
            Encoding::Int16 { data, .. } => data.len(),
            Encoding::Int32 { data, .. } => data.len(),
            Encoding::Int64 { data } => data.len(),
            Encoding::Scaled16 { data, .. } => data.len(),
            Encoding::Scaled32 { data, .. } => data.len(),
            Encoding::Double { data } => data.len(),
            Encoding::Str { data } => data.len(),
            Encoding::Uuid { lo, .. } => lo.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The encoding of this chunk
    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    /// Whether this chunk holds numbers (including categorical codes and
    /// timestamps)
    pub fn is_numeric(&self) -> bool {
        !matches!(self.encoding, Encoding::Str { .. } | Encoding::Uuid { .. })
    }

    /// Whether local row `i` is missing
    pub fn is_na(&self, i: usize) -> bool {
        match &self.encoding {
            Encoding::Const { value, len } => {
                assert!(i < *len, "row {} out of bounds for chunk of {}", i, len);
                value.is_none()
            }
            Encoding::Int8 { data, .. } => data[i] == u8::MAX,
            Encoding::Int16 { data, .. } => data[i] == u16::MAX,
            Encoding::Int32 { data, .. } => data[i] == u32::MAX,
            Encoding::Int64 { data } => data[i] == i64::MIN,
            Encoding::Scaled16 { data, .. } => data[i] == u16::MAX,
            Encoding::Scaled32 { data, .. } => data[i] == u32::MAX,
            Encoding::Double { data } => data[i].is_nan(),
            Encoding::Str { data } => data[i].is_none(),
            Encoding::Uuid { lo, hi } => (lo[i], hi[i]) == NA_UUID,
        }
    }

    /// The value at local row `i` as a double, `NaN` if the row is missing
    /// or the chunk does not hold numbers
    pub fn at(&self, i: usize) -> f64 {
        if self.is_na(i) {
            return f64::NAN;
        }
        match &self.encoding {
            Encoding::Const { value, .. } => value.unwrap_or(f64::NAN),
            Encoding::Int8 { data, bias } => (data[i] as i64 + bias) as f64,
            Encoding::Int16 { data, bias } => (data[i] as i64 + bias) as f64,
            Encoding::Int32 { data, bias } => (data[i] as i64 + bias) as f64,
            Encoding::Int64 { data } => data[i] as f64,
            Encoding::Scaled16 {
                data,
                bias,
                exponent,
            } => unscale(data[i] as i64 + bias, *exponent),
            Encoding::Scaled32 {
                data,
                bias,
                exponent,
            } => unscale(data[i] as i64 + bias, *exponent),
            Encoding::Double { data } => data[i],
            Encoding::Str { .. } | Encoding::Uuid { .. } => f64::NAN,
        }
    }

    /// The value at local row `i` as an integer, `None` if the row is
    /// missing or the chunk does not hold numbers. Non-integral values are
    /// truncated.
    pub fn at8(&self, i: usize) -> Option<i64> {
        if self.is_na(i) {
            return None;
        }
        match &self.encoding {
            Encoding::Int8 { data, bias } => Some(data[i] as i64 + bias),
            Encoding::Int16 { data, bias } => Some(data[i] as i64 + bias),
            Encoding::Int32 { data, bias } => Some(data[i] as i64 + bias),
            Encoding::Int64 { data } => Some(data[i]),
            Encoding::Str { .. } | Encoding::Uuid { .. } => None,
            _ => Some(self.at(i) as i64),
        }
    }

    /// The string at local row `i`, `None` if missing or not a text chunk
    pub fn at_str(&self, i: usize) -> Option<&str> {
        match &self.encoding {
            Encoding::Str { data } => data[i].as_deref(),
            _ => None,
        }
    }

    /// The UUID at local row `i`, `None` if missing or not a UUID chunk
    pub fn at_uuid(&self, i: usize) -> Option<u128> {
        match &self.encoding {
            Encoding::Uuid { lo, hi } => {
                if (lo[i], hi[i]) == NA_UUID {
                    None
                } else {
                    Some(((hi[i] as u64 as u128) << 64) | lo[i] as u64 as u128)
                }
            }
            _ => None,
        }
    }

    /// The number of decimal digits this chunk's values carry: `0` for
    /// integers, the exponent for fixed-point decimals and `-1` when all
    /// digits are kept.
    pub fn precision(&self) -> i8 {
        match &self.encoding {
            Encoding::Const {
                value: Some(v), ..
            } if v.fract() != 0.0 => -1,
            Encoding::Const { .. }
            | Encoding::Int8 { .. }
            | Encoding::Int16 { .. }
            | Encoding::Int32 { .. }
            | Encoding::Int64 { .. } => 0,
            Encoding::Scaled16 { exponent, .. }
            | Encoding::Scaled32 { exponent, .. } => *exponent as i8,
            Encoding::Double { .. } | Encoding::Str { .. } | Encoding::Uuid { .. } => -1,
        }
    }

    /// Decodes the rows in `range` (local indices)
    pub fn slice(&self, range: Range<usize>) -> Values {
        match &self.encoding {
            Encoding::Str { data } => Values::Text(data[range].to_vec()),
            Encoding::Uuid { .. } => {
                Values::Uuid(range.map(|i| self.at_uuid(i)).collect())
            }
            _ => Values::Numeric(
                range
                    .map(|i| if self.is_na(i) { None } else { Some(self.at(i)) })
                    .collect(),
            ),
        }
    }

    /// Decodes every row of this chunk
    pub fn values(&self) -> Values {
        self.slice(0..self.len())
    }
}
