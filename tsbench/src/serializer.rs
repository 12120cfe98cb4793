//! Text encodings for generated points.
//!
//! Three line formats are supported, selected with [`Format`]:
//!
//! - **influx**: line protocol, `measurement[,tag=value]* field=value[,field=value]* ts_ns`.
//!   Integer fields carry an `i` suffix, text and byte values are double-quoted and floats are
//!   written with 16 fractional digits.
//! - **tsdb**: one line per field, `measurement_field#measurement <m> k v ...#value#ts_ms`. This
//!   is the format read back by the bulk loader.
//! - **tsdb-csv**: the same per-field rows as CSV, with the label block quoted as a single column
//!   of `key=value` pairs.
//!
//! Every serializer renders into a scratch buffer taken from a shared [`Pool`] and hands the
//! complete record to the writer in a single call.
//!
//! The out-of-band size marker `dataset-size:<points>,<values>` is parsed by external tooling
//! with the fixed pattern `dataset-size:(\d+),(\d+)` and must not change.

use std::fmt;
use std::io::Write;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::error::{Error, Result};
use crate::point::{FieldValue, Point};
use crate::pool::Pool;

/// Prefix of the dataset size marker line.
pub const DATASET_SIZE_MARKER: &str = "dataset-size:";

static DATASET_SIZE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{DATASET_SIZE_MARKER}(\d+),(\d+)")).expect("valid size marker pattern")
});

/// Encodes points into one of the supported wire formats.
pub trait Serializer: Send + Sync {
    /// Writes `point` in the serializer's primary format.
    fn serialize_point(&self, w: &mut dyn Write, point: &Point) -> Result<()>;

    /// Writes the dataset size marker, if the format carries one.
    fn serialize_size(&self, w: &mut dyn Write, points: u64, values: u64) -> Result<()>;

    /// Writes `point` as CSV rows, if the format has a CSV variant.
    fn serialize_to_csv(&self, w: &mut dyn Write, point: &Point) -> Result<()>;
}

/// Output formats understood by the data generator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// Line protocol.
    #[default]
    Influx,
    /// Pipe-delimited per-field rows.
    Tsdb,
    /// CSV variant of the per-field rows.
    TsdbCsv,
}

impl Format {
    /// Creates the serializer for this format, sharing the given scratch buffer pool.
    pub fn serializer(self, scratch: Arc<Pool<Vec<u8>>>) -> Box<dyn Serializer> {
        match self {
            Format::Influx => Box::new(InfluxSerializer::new(scratch)),
            Format::Tsdb | Format::TsdbCsv => Box::new(TsdbSerializer::new(scratch)),
        }
    }

    /// Writes one point in this format.
    pub fn write_point(
        self,
        serializer: &dyn Serializer,
        w: &mut dyn Write,
        point: &Point,
    ) -> Result<()> {
        match self {
            Format::TsdbCsv => serializer.serialize_to_csv(w, point),
            Format::Influx | Format::Tsdb => serializer.serialize_point(w, point),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Influx => "influx",
            Format::Tsdb => "tsdb",
            Format::TsdbCsv => "tsdb-csv",
        })
    }
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "influx" | "influx-bulk" => Ok(Format::Influx),
            "tsdb" => Ok(Format::Tsdb),
            "tsdb-csv" => Ok(Format::TsdbCsv),
            other => Err(format!(
                r#"unknown format "{other}": expected one of "influx", "tsdb", "tsdb-csv""#
            )),
        }
    }
}

/// Line protocol serializer.
#[derive(Debug)]
pub struct InfluxSerializer {
    scratch: Arc<Pool<Vec<u8>>>,
}

impl InfluxSerializer {
    /// Creates a serializer drawing scratch buffers from `scratch`.
    pub fn new(scratch: Arc<Pool<Vec<u8>>>) -> Self {
        Self { scratch }
    }
}

impl Serializer for InfluxSerializer {
    fn serialize_point(&self, w: &mut dyn Write, point: &Point) -> Result<()> {
        ensure_fields(point)?;
        let mut buf = self.scratch.get();

        buf.extend_from_slice(point.measurement.as_bytes());
        for (key, value) in &point.tags {
            buf.push(b',');
            buf.extend_from_slice(key.as_bytes());
            buf.push(b'=');
            buf.extend_from_slice(value.as_bytes());
        }

        buf.push(b' ');
        for (i, (key, value)) in point.fields.iter().enumerate() {
            if i > 0 {
                buf.push(b',');
            }
            buf.extend_from_slice(key.as_bytes());
            buf.push(b'=');
            append_value(&mut buf, value, b'"')?;
            if let FieldValue::Int(_) = value {
                buf.push(b'i');
            }
        }

        writeln!(buf, " {}", point.timestamp)?;
        let result = w.write_all(&buf);
        self.scratch.put(buf);
        Ok(result?)
    }

    fn serialize_size(&self, w: &mut dyn Write, points: u64, values: u64) -> Result<()> {
        write_size_marker(&self.scratch, w, points, values)
    }

    fn serialize_to_csv(&self, _w: &mut dyn Write, _point: &Point) -> Result<()> {
        Ok(())
    }
}

/// Per-field row serializer for the pipe-delimited and CSV formats.
#[derive(Debug)]
pub struct TsdbSerializer {
    scratch: Arc<Pool<Vec<u8>>>,
}

impl TsdbSerializer {
    /// Creates a serializer drawing scratch buffers from `scratch`.
    pub fn new(scratch: Arc<Pool<Vec<u8>>>) -> Self {
        Self { scratch }
    }
}

impl Serializer for TsdbSerializer {
    fn serialize_point(&self, w: &mut dyn Write, point: &Point) -> Result<()> {
        ensure_fields(point)?;
        let mut labels = self.scratch.get();
        let mut buf = self.scratch.get();

        labels.extend_from_slice(b"measurement ");
        labels.extend_from_slice(point.measurement.as_bytes());
        for (key, value) in &point.tags {
            labels.push(b' ');
            labels.extend_from_slice(key.as_bytes());
            labels.push(b' ');
            labels.extend_from_slice(value.as_bytes());
        }

        let timestamp = point.timestamp_millis();
        for (key, value) in &point.fields {
            buf.extend_from_slice(point.measurement.as_bytes());
            buf.push(b'_');
            buf.extend_from_slice(key.as_bytes());
            buf.push(b'#');
            buf.extend_from_slice(&labels);
            buf.push(b'#');
            append_value(&mut buf, value, b'\'')?;
            writeln!(buf, "#{timestamp}")?;
        }

        let result = w.write_all(&buf);
        self.scratch.put(labels);
        self.scratch.put(buf);
        Ok(result?)
    }

    fn serialize_size(&self, _w: &mut dyn Write, _points: u64, _values: u64) -> Result<()> {
        // Loaders of this format read every line as a row.
        Ok(())
    }

    fn serialize_to_csv(&self, w: &mut dyn Write, point: &Point) -> Result<()> {
        ensure_fields(point)?;
        let mut labels = self.scratch.get();
        let mut buf = self.scratch.get();

        labels.extend_from_slice(b"\"measurement=");
        labels.extend_from_slice(point.measurement.as_bytes());
        for (key, value) in &point.tags {
            labels.push(b',');
            labels.extend_from_slice(key.as_bytes());
            labels.push(b'=');
            labels.extend_from_slice(value.as_bytes());
        }
        labels.push(b'"');

        let timestamp = point.timestamp_millis();
        for (key, value) in &point.fields {
            buf.extend_from_slice(point.measurement.as_bytes());
            buf.push(b'_');
            buf.extend_from_slice(key.as_bytes());
            buf.push(b',');
            buf.extend_from_slice(&labels);
            buf.push(b',');
            append_value(&mut buf, value, b'"')?;
            writeln!(buf, ",{timestamp}")?;
        }

        let result = w.write_all(&buf);
        self.scratch.put(labels);
        self.scratch.put(buf);
        Ok(result?)
    }
}

/// Parses a dataset size marker line into `(points, values)`.
///
/// The first match of `dataset-size:(\d+),(\d+)` anywhere in the line is used. A match whose
/// counts do not fit in a `u64` yields `None`.
pub fn parse_size_marker(line: &str) -> Option<(u64, u64)> {
    let captures = DATASET_SIZE_RE.captures(line)?;
    let points = captures[1].parse().ok()?;
    let values = captures[2].parse().ok()?;
    Some((points, values))
}

fn write_size_marker(
    scratch: &Pool<Vec<u8>>,
    w: &mut dyn Write,
    points: u64,
    values: u64,
) -> Result<()> {
    let mut buf = scratch.get();
    writeln!(buf, "{DATASET_SIZE_MARKER}{points},{values}")?;
    let result = w.write_all(&buf);
    scratch.put(buf);
    Ok(result?)
}

fn ensure_fields(point: &Point) -> Result<()> {
    if point.fields.is_empty() {
        return Err(Error::EmptyPoint(point.measurement.clone()));
    }
    Ok(())
}

fn append_value(buf: &mut Vec<u8>, value: &FieldValue, quote: u8) -> std::io::Result<()> {
    match value {
        FieldValue::Int(v) => write!(buf, "{v}"),
        FieldValue::Float(v) => write!(buf, "{v:.16}"),
        FieldValue::Float32(v) => write!(buf, "{v:.16}"),
        FieldValue::Bool(v) => write!(buf, "{v}"),
        FieldValue::Bytes(v) => {
            buf.push(quote);
            buf.extend_from_slice(v);
            buf.push(quote);
            Ok(())
        }
        FieldValue::Str(v) => {
            buf.push(quote);
            buf.extend_from_slice(v.as_bytes());
            buf.push(quote);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn sample_point() -> Point {
        let mut point = Point::default();
        point.set_measurement("cpu");
        point.push_tag("hostname", "host_0");
        point.push_tag("region", "us-west-1");
        point.push_field("usage_user", FieldValue::Float(84.125));
        point.push_field("usage_idle", FieldValue::Int(7));
        point.timestamp = 1_514_764_800_000_000_000;
        point
    }

    fn render(format: Format, point: &Point) -> String {
        let serializer = format.serializer(Pool::shared());
        let mut out = Vec::new();
        format
            .write_point(serializer.as_ref(), &mut out, point)
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn influx_line_protocol() {
        assert_eq!(
            render(Format::Influx, &sample_point()),
            "cpu,hostname=host_0,region=us-west-1 \
             usage_user=84.1250000000000000,usage_idle=7i 1514764800000000000\n"
        );
    }

    #[test]
    fn influx_quotes_text_and_bytes() {
        let mut point = Point::default();
        point.set_measurement("log");
        point.push_field("msg", FieldValue::Str("hi".into()));
        point.push_field("raw", FieldValue::Bytes(Bytes::from_static(b"ab")));
        point.push_field("ok", FieldValue::Bool(true));
        point.timestamp = 5;

        assert_eq!(
            render(Format::Influx, &point),
            "log msg=\"hi\",raw=\"ab\",ok=true 5\n"
        );
    }

    #[test]
    fn tsdb_rows_per_field() {
        assert_eq!(
            render(Format::Tsdb, &sample_point()),
            "cpu_usage_user#measurement cpu hostname host_0 region us-west-1\
             #84.1250000000000000#1514764800000\n\
             cpu_usage_idle#measurement cpu hostname host_0 region us-west-1\
             #7#1514764800000\n"
        );
    }

    #[test]
    fn tsdb_quotes_text_with_single_quotes() {
        let mut point = Point::default();
        point.set_measurement("log");
        point.push_field("msg", FieldValue::Str("hi".into()));

        assert_eq!(
            render(Format::Tsdb, &point),
            "log_msg#measurement log#'hi'#0\n"
        );
    }

    #[test]
    fn tsdb_csv_rows() {
        assert_eq!(
            render(Format::TsdbCsv, &sample_point()),
            "cpu_usage_user,\"measurement=cpu,hostname=host_0,region=us-west-1\",\
             84.1250000000000000,1514764800000\n\
             cpu_usage_idle,\"measurement=cpu,hostname=host_0,region=us-west-1\",7,1514764800000\n"
        );
    }

    #[test]
    fn float32_uses_its_own_precision() {
        let mut point = Point::default();
        point.set_measurement("m");
        point.push_field("f", FieldValue::Float32(0.1));
        assert_eq!(render(Format::Tsdb, &point), "m_f#measurement m#0.1000000014901161#0\n");
    }

    #[test]
    fn points_without_fields_are_rejected() {
        let serializer = Format::Influx.serializer(Pool::shared());
        let mut point = Point::default();
        point.set_measurement("cpu");
        let err = serializer
            .serialize_point(&mut Vec::new(), &point)
            .unwrap_err();
        assert!(matches!(err, Error::EmptyPoint(name) if name == "cpu"));
    }

    #[test]
    fn size_marker_is_written_and_parsed() {
        let serializer = Format::Influx.serializer(Pool::shared());
        let mut out = Vec::new();
        serializer.serialize_size(&mut out, 42, 100).unwrap();
        assert_eq!(out, b"dataset-size:42,100\n");

        assert_eq!(parse_size_marker("dataset-size:42,100\n"), Some((42, 100)));
        assert_eq!(parse_size_marker("xx dataset-size:1,2 yy"), Some((1, 2)));
        assert_eq!(parse_size_marker("dataset-size:42;100"), None);
        assert_eq!(parse_size_marker("dataset-size:,100"), None);
        assert_eq!(parse_size_marker("cpu,host=a value=1 5"), None);
    }

    #[test]
    fn size_marker_uses_first_complete_match() {
        assert_eq!(parse_size_marker("dataset-size:x dataset-size:3,4"), Some((3, 4)));
        assert_eq!(parse_size_marker("dataset-size:7,8 dataset-size:1,2"), Some((7, 8)));
        assert_eq!(parse_size_marker("dataset-size:5,6abc"), Some((5, 6)));
    }

    #[test]
    fn oversized_size_marker_is_rejected() {
        assert_eq!(parse_size_marker("dataset-size:99999999999999999999999,1"), None);
        assert_eq!(
            parse_size_marker("dataset-size:18446744073709551615,0"),
            Some((u64::MAX, 0))
        );
    }

    #[test]
    fn tsdb_has_no_size_marker() {
        let serializer = Format::Tsdb.serializer(Pool::shared());
        let mut out = Vec::new();
        serializer.serialize_size(&mut out, 42, 100).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn scratch_buffers_are_returned() {
        let pool = Pool::shared();
        let serializer = Format::Tsdb.serializer(Arc::clone(&pool));
        serializer
            .serialize_point(&mut Vec::new(), &sample_point())
            .unwrap();
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn formats_parse() {
        assert_eq!("tsdb-csv".parse::<Format>().unwrap(), Format::TsdbCsv);
        assert_eq!("influx-bulk".parse::<Format>().unwrap(), Format::Influx);
        assert!("json".parse::<Format>().is_err());
    }
}
