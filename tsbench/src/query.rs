//! Query descriptors and the binary stream that carries them between processes.
//!
//! # Stream layout
//!
//! ```text
//! "TSBQ" <version: u8> ( <length: u32 LE> <bincode record> )*
//! ```
//!
//! Each record is a self-contained bincode (standard configuration) encoding of one query. The
//! stream ends cleanly at a record boundary; running out of bytes anywhere else is malformed
//! input. The sequence number of a query is not part of the record, it is assigned by the
//! consumer in stream order.
//!
//! Decoding borrows the strings of a record straight out of a reused buffer and copies them
//! into a pooled [`Query`], so a steady-state decode loop does not allocate.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::executor::{Decoder, WorkItem};
use crate::pool::Recycle;

/// Magic bytes at the start of every query stream.
pub const STREAM_MAGIC: &[u8; 4] = b"TSBQ";
/// Current version of the query stream format.
pub const STREAM_VERSION: u8 = 1;
/// Upper bound for a single encoded record.
const MAX_RECORD_LEN: usize = 16 * 1024 * 1024;

/// A request descriptor for a time-series query.
///
/// `human_label` buckets latency statistics, so it must be identical for all queries of the
/// same shape. `human_description` additionally identifies the concrete time window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    /// Shape label, e.g. `tsdb max cpu, rand    8 hosts, rand 1h0m0s by 1m`.
    pub human_label: String,
    /// Label plus the start of the queried window.
    pub human_description: String,
    /// Metric to query, e.g. `cpu_usage_user`.
    pub metric_name: String,
    /// Aggregation function, e.g. `max` or `avg`.
    pub aggregation_type: String,
    /// Inclusive start of the queried range, in milliseconds since the epoch.
    pub time_start: i64,
    /// Exclusive end of the queried range, in milliseconds since the epoch.
    pub time_end: i64,
    /// Filter expression, empty for none.
    pub filter: String,
    /// Aggregation step in milliseconds.
    pub step: i64,
    /// Sequence number assigned by the decode stage.
    pub id: u64,
}

impl Query {
    /// Clears the query for reuse. A released query must not be read again.
    pub fn release(&mut self) {
        self.recycle();
    }
}

impl Recycle for Query {
    fn recycle(&mut self) {
        self.human_label.clear();
        self.human_description.clear();
        self.metric_name.clear();
        self.aggregation_type.clear();
        self.time_start = 0;
        self.time_end = 0;
        self.filter.clear();
        self.step = 0;
        self.id = 0;
    }
}

impl WorkItem for Query {
    fn label(&self) -> &str {
        &self.human_label
    }

    fn series_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.human_label.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HumanLabel: {}, HumanDescription: {}, MetricName: {}, AggregationType: {}, \
             TimeStart: {}, TimeEnd: {}, Filter: {}, Step: {}",
            self.human_label,
            self.human_description,
            self.metric_name,
            self.aggregation_type,
            self.time_start,
            self.time_end,
            self.filter,
            self.step,
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct QueryRecord<'a> {
    human_label: &'a str,
    human_description: &'a str,
    metric_name: &'a str,
    aggregation_type: &'a str,
    time_start: i64,
    time_end: i64,
    filter: &'a str,
    step: i64,
}

impl<'a> From<&'a Query> for QueryRecord<'a> {
    fn from(query: &'a Query) -> Self {
        Self {
            human_label: &query.human_label,
            human_description: &query.human_description,
            metric_name: &query.metric_name,
            aggregation_type: &query.aggregation_type,
            time_start: query.time_start,
            time_end: query.time_end,
            filter: &query.filter,
            step: query.step,
        }
    }
}

impl QueryRecord<'_> {
    fn copy_into(&self, query: &mut Query) {
        set(&mut query.human_label, self.human_label);
        set(&mut query.human_description, self.human_description);
        set(&mut query.metric_name, self.metric_name);
        set(&mut query.aggregation_type, self.aggregation_type);
        query.time_start = self.time_start;
        query.time_end = self.time_end;
        set(&mut query.filter, self.filter);
        query.step = self.step;
    }
}

fn set(target: &mut String, value: &str) {
    target.clear();
    target.push_str(value);
}

/// Writes queries as a binary query stream.
#[derive(Debug)]
pub struct QueryWriter<W> {
    inner: W,
    buf: Vec<u8>,
    header_written: bool,
    written: u64,
}

impl<W: Write> QueryWriter<W> {
    /// Creates a writer. The stream header is written together with the first record, or by
    /// [`finish`](Self::finish) for an empty stream.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            header_written: false,
            written: 0,
        }
    }

    /// Appends one query record.
    pub fn write(&mut self, query: &Query) -> Result<()> {
        self.write_header()?;

        self.buf.clear();
        bincode::serde::encode_into_std_write(
            QueryRecord::from(query),
            &mut self.buf,
            bincode::config::standard(),
        )?;

        let len = u32::try_from(self.buf.len())
            .ok()
            .filter(|len| (*len as usize) <= MAX_RECORD_LEN)
            .ok_or_else(|| Error::Malformed {
                line: self.written,
                reason: format!("record of {} bytes is too large", self.buf.len()),
            })?;
        self.inner.write_all(&len.to_le_bytes())?;
        self.inner.write_all(&self.buf)?;
        self.written += 1;
        Ok(())
    }

    /// Returns the number of records written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Writes the header if nothing has been written yet, flushes, and returns the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.write_header()?;
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            self.inner.write_all(STREAM_MAGIC)?;
            self.inner.write_all(&[STREAM_VERSION])?;
            self.header_written = true;
        }
        Ok(())
    }
}

/// Reads queries from a binary query stream, one record at a time.
#[derive(Debug)]
pub struct QueryReader<R> {
    inner: R,
    buf: Vec<u8>,
    header_read: bool,
    records: u64,
}

impl<R: Read> QueryReader<R> {
    /// Creates a reader over `inner`. Wrap unbuffered sources in a [`io::BufReader`].
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            header_read: false,
            records: 0,
        }
    }

    /// Decodes the next record into `query`.
    ///
    /// Returns `Ok(false)` at the end of the stream, leaving `query` untouched.
    pub fn read_into(&mut self, query: &mut Query) -> Result<bool> {
        if !self.read_header()? {
            return Ok(false);
        }

        let mut len = [0; 4];
        if !self.read_exact_or_eof(&mut len)? {
            return Ok(false);
        }

        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_RECORD_LEN {
            return Err(self.malformed(format!("record length {len} exceeds the maximum")));
        }

        self.buf.resize(len, 0);
        if let Err(error) = self.inner.read_exact(&mut self.buf) {
            return Err(match error.kind() {
                io::ErrorKind::UnexpectedEof => self.malformed("truncated record".into()),
                _ => error.into(),
            });
        }

        let (record, _): (QueryRecord<'_>, usize) =
            bincode::serde::borrow_decode_from_slice(&self.buf, bincode::config::standard())
                .map_err(|cause| Error::Decode {
                    record: self.records,
                    cause,
                })?;
        record.copy_into(query);

        self.records += 1;
        Ok(true)
    }

    fn read_header(&mut self) -> Result<bool> {
        if self.header_read {
            return Ok(true);
        }

        let mut header = [0; 5];
        if !self.read_exact_or_eof(&mut header)? {
            return Ok(false);
        }
        if &header[..4] != STREAM_MAGIC {
            return Err(self.malformed("not a query stream".into()));
        }
        if header[4] != STREAM_VERSION {
            return Err(self.malformed(format!("unsupported stream version {}", header[4])));
        }

        self.header_read = true;
        Ok(true)
    }

    /// Fills `buf` completely, or returns `Ok(false)` if the stream ends before the first byte.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(self.malformed("truncated record header".into())),
                Ok(n) => filled += n,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(true)
    }

    fn malformed(&self, reason: String) -> Error {
        Error::Malformed {
            line: self.records,
            reason,
        }
    }
}

impl<R: Read + Send + 'static> Decoder for QueryReader<R> {
    type Item = Query;

    fn decode_next(&mut self, item: &mut Query) -> Result<bool> {
        let id = self.records;
        let decoded = self.read_into(item)?;
        if decoded {
            item.id = id;
        }
        Ok(decoded)
    }
}
