//! The response structs of each inspection api version.
use crate::cloud::Cloud;
use crate::error::LiquidError;
use crate::frame::chunk::Values;
use crate::frame::column::{Column, ColumnType};
use crate::frame::frame::Frame;
use crate::frame::rollups::{Rollups, DEFAULT_PERCENTILES};
use crate::kv::Key;
use serde::Serialize;

/// The number of rows shown when a request does not say
const DEFAULT_WINDOW: usize = 100;

/// A frame as described by version 1: its shape only
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FrameV1 {
    pub key: Key,
    pub rows: u64,
    pub columns: Vec<ColV1>,
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ColV1 {
    pub label: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
}

impl FrameV1 {
    pub(crate) async fn fill(cloud: &Cloud, frame: &Frame) -> Result<Self, LiquidError> {
        let columns = frame
            .columns(cloud.kv())
            .await?
            .into_iter()
            .zip(frame.names())
            .map(|(column, name)| ColV1 {
                label: name.clone(),
                kind: column.kind,
            })
            .collect();
        Ok(FrameV1 {
            key: frame.key.clone(),
            rows: frame.num_rows(),
            columns,
        })
    }
}

/// A frame as described by version 2: statistics of every column and a
/// window of rows
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct FrameV2 {
    pub key: Key,
    /// The 0-based first row of the window
    pub off: u64,
    /// The number of rows in the window
    pub len: usize,
    pub rows: u64,
    pub byte_size: u64,
    pub checksum: u64,
    pub default_pctiles: Vec<f64>,
    pub columns: Vec<ColV2>,
}

/// One column of a [`FrameV2`]
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ColV2 {
    pub label: String,
    pub missing: u64,
    pub zeros: u64,
    pub pinfs: u64,
    pub ninfs: u64,
    pub mins: Vec<f64>,
    pub maxs: Vec<f64>,
    pub mean: f64,
    pub sigma: f64,
    /// One of `enum`, `string`, `int`, `real`, `time` or `uuid`
    #[serde(rename = "type")]
    pub kind: String,
    pub domain: Option<Vec<String>>,
    /// The window of a numeric column
    pub data: Option<Vec<f64>>,
    /// The window of a text or UUID column
    pub str_data: Option<Vec<Option<String>>>,
    /// Decimal digits of the first chunk, `-1` for all digits
    pub precision: i8,
    /// Only present if the histogram was already computed
    pub bins: Option<Vec<u64>>,
    pub base: f64,
    pub stride: f64,
    pub pctiles: Option<Vec<f64>>,
}

fn type_name(column: &Column, rollups: &Rollups) -> &'static str {
    match column.kind {
        ColumnType::Categorical => "enum",
        ColumnType::Uuid => "uuid",
        ColumnType::Text => "string",
        ColumnType::Time => "time",
        ColumnType::Numeric if rollups.is_int => "int",
        ColumnType::Numeric => "real",
    }
}

/// Formats a UUID the usual 8-4-4-4-12 way
fn format_uuid(u: u128) -> String {
    let hex = format!("{:032x}", u);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

impl ColV2 {
    async fn fill(
        cloud: &Cloud,
        name: &str,
        column: &Column,
        off: u64,
        len: usize,
    ) -> Result<Self, LiquidError> {
        let rollups = cloud.rollups(column).await?;
        let start = off.min(column.len());
        let end = off.saturating_add(len as u64).min(column.len());
        let (data, str_data) = match column.slice(cloud.kv(), start..end).await? {
            Values::Numeric(v) => (
                Some(v.into_iter().map(|x| x.unwrap_or(f64::NAN)).collect()),
                None,
            ),
            Values::Text(v) => (None, Some(v)),
            Values::Uuid(v) => (
                None,
                Some(v.into_iter().map(|u| u.map(format_uuid)).collect()),
            ),
        };
        let precision = if column.is_empty() {
            -1
        } else {
            column.chunk_for_row(cloud.kv(), 0).await?.precision()
        };
        let histogram = rollups.histogram();
        Ok(ColV2 {
            label: name.to_string(),
            missing: rollups.na_cnt,
            zeros: rollups.zero_cnt,
            pinfs: rollups.pinf_cnt,
            ninfs: rollups.ninf_cnt,
            mins: rollups.mins.clone(),
            maxs: rollups.maxs.clone(),
            mean: rollups.mean,
            sigma: rollups.sigma,
            kind: type_name(column, &rollups).to_string(),
            domain: column.domain.clone(),
            data,
            str_data,
            precision,
            bins: histogram.map(|h| h.bins.clone()),
            base: histogram.map_or(0.0, |h| h.base),
            stride: histogram.map_or(0.0, |h| h.stride),
            pctiles: histogram.map(|h| h.pctiles.clone()),
        })
    }
}

impl FrameV2 {
    /// Describes `frame`, showing `len` rows from the 1-based row `offset`
    pub(crate) async fn fill(
        cloud: &Cloud,
        frame: &Frame,
        offset: u64,
        len: usize,
    ) -> Result<Self, LiquidError> {
        let off = offset.max(1) - 1;
        let len = if len == 0 { DEFAULT_WINDOW } else { len };
        let rows = frame.num_rows();
        let len = (len as u64).min(rows) as usize;
        let mut columns = Vec::with_capacity(frame.num_cols());
        let mut byte_size = 0;
        for (name, column) in frame.names().iter().zip(frame.columns(cloud.kv()).await?) {
            byte_size += cloud.byte_size(&column).await?;
            columns.push(ColV2::fill(cloud, name, &column, off, len).await?);
        }
        Ok(FrameV2 {
            key: frame.key.clone(),
            off,
            len,
            rows,
            byte_size,
            checksum: cloud.checksum(frame).await?,
            default_pctiles: DEFAULT_PERCENTILES.to_vec(),
            columns,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::CloudConfig;
    use crate::frame::column::ColumnData;

    #[test]
    fn test_format_uuid() {
        let u = 0x0123_4567_89ab_cdef_0011_2233_4455_6677u128;
        assert_eq!(format_uuid(u), "01234567-89ab-cdef-0011-223344556677");
    }

    #[tokio::test]
    async fn test_frame_v2() {
        let cloud = Cloud::new(CloudConfig::default().with_nodes(2).with_chunk_rows(3)).unwrap();
        let prices = ColumnData::Numeric(vec![Some(1.5), None, Some(2.25), Some(0.0), Some(4.0)]);
        let prices = cloud.new_column("prices", prices).await.unwrap();
        let kinds = ColumnData::categorical(&[Some("b"), Some("a"), None, Some("a"), Some("b")]);
        let kinds = cloud.new_column("kinds", kinds).await.unwrap();
        let ids = ColumnData::Uuid(vec![Some(1), None, Some(2), Some(3), Some(4)]);
        let ids = cloud.new_column("ids", ids).await.unwrap();
        let mut frame = Frame::new(Key::new("shop", 0));
        frame.add("prices", &prices).unwrap();
        frame.add("kinds", &kinds).unwrap();
        frame.add("ids", &ids).unwrap();

        let v2 = FrameV2::fill(&cloud, &frame, 2, 3).await.unwrap();
        assert_eq!((v2.off, v2.len, v2.rows), (1, 3, 5));
        assert!(v2.byte_size > 0);
        assert_eq!(v2.default_pctiles.len(), 9);

        let p = &v2.columns[0];
        assert_eq!(p.kind, "real");
        assert_eq!(p.missing, 1);
        assert_eq!(p.zeros, 1);
        assert_eq!(p.precision, 2);
        let data = p.data.as_ref().unwrap();
        assert!(data[0].is_nan());
        assert_eq!(&data[1..], &[2.25, 0.0]);
        assert!(p.bins.is_none());

        let k = &v2.columns[1];
        assert_eq!(k.kind, "enum");
        assert_eq!(k.domain, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(k.precision, 0);

        let i = &v2.columns[2];
        assert_eq!(i.kind, "uuid");
        assert!(i.data.is_none());
        let strs = i.str_data.as_ref().unwrap();
        assert_eq!(strs[0], None);
        assert_eq!(
            strs[1].as_deref(),
            Some("00000000-0000-0000-0000-000000000002")
        );

        // a computed histogram shows up in later inspections
        cloud.histogram(&prices).await.unwrap();
        let v2 = FrameV2::fill(&cloud, &frame, 0, 0).await.unwrap();
        assert_eq!((v2.off, v2.len), (0, 5));
        assert!(v2.columns[0].bins.is_some());
        assert_eq!(v2.columns[0].pctiles.as_ref().unwrap().len(), 9);

        // a window past the last row is empty
        let v2 = FrameV2::fill(&cloud, &frame, u64::MAX, 3).await.unwrap();
        assert_eq!(v2.off, u64::MAX - 1);
        assert_eq!(v2.columns[0].data, Some(vec![]));
        assert_eq!(v2.columns[2].str_data, Some(vec![]));
    }
}
