//! Write-only target speaking InfluxDB line protocol over HTTP.

use std::fmt;
use std::io::{self, Write as _};
use std::time::Duration;

use bytes::{BufMut, BytesMut};

use super::common::{Appender, Labels, METRIC_NAME_LABEL, TargetError, TargetResult};

/// User agent string used for outgoing requests.
pub const USER_AGENT: &str = concat!("tsbench/", env!("CARGO_PKG_VERSION"));

/// Default number of samples sent per request.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Creates a reqwest client with required defaults.
pub fn reqwest_client(timeout: Duration) -> TargetResult<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .build()
        .map_err(|cause| TargetError::Reqwest {
            context: "failed to build http client".to_owned(),
            cause,
        })
}

/// Buffers samples as line protocol and posts them in batches to `{url}/write?db={database}`.
///
/// Samples are rendered as `measurement[,tag=value]* value=<v> <timestamp_ns>`, where the
/// measurement is the series' metric name and every other label becomes a tag.
pub struct HttpAppender {
    client: reqwest::Client,
    write_url: String,
    buffer: BytesMut,
    pending: usize,
    batch_size: usize,
}

impl HttpAppender {
    /// Creates an appender for one worker.
    pub fn new(
        url: &str,
        database: &str,
        batch_size: usize,
        timeout: Duration,
    ) -> TargetResult<Self> {
        Ok(Self {
            client: reqwest_client(timeout)?,
            write_url: format!("{}/write?db={database}", url.trim_end_matches('/')),
            buffer: BytesMut::new(),
            pending: 0,
            batch_size: batch_size.max(1),
        })
    }

    fn render(&mut self, labels: &Labels, timestamp_nanos: i64, value: f64) -> io::Result<()> {
        let mut w = (&mut self.buffer).writer();
        w.write_all(labels.metric_name().unwrap_or("value").as_bytes())?;
        for (key, tag) in labels.iter() {
            if key != METRIC_NAME_LABEL {
                write!(w, ",{key}={tag}")?;
            }
        }
        writeln!(w, " value={value} {timestamp_nanos}")
    }

    #[tracing::instrument(level = "trace", skip_all)]
    async fn flush(&mut self) -> TargetResult<()> {
        if self.pending == 0 {
            return Ok(());
        }
        tracing::trace!(samples = self.pending, "sending batch");

        let body = self.buffer.split().freeze();
        self.pending = 0;

        let response = self
            .client
            .post(&self.write_url)
            .body(body)
            .send()
            .await
            .map_err(|cause| TargetError::Reqwest {
                context: format!("failed to send batch to {}", self.write_url),
                cause,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TargetError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

impl fmt::Debug for HttpAppender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAppender")
            .field("write_url", &self.write_url)
            .field("pending", &self.pending)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Appender for HttpAppender {
    async fn add(&mut self, labels: &Labels, timestamp_nanos: i64, value: f64) -> TargetResult<u64> {
        self.render(labels, timestamp_nanos, value)?;
        self.pending += 1;
        let reference = self.pending as u64;

        if self.pending >= self.batch_size {
            self.flush().await?;
        }
        Ok(reference)
    }

    async fn await_completion(&mut self, deadline: Duration) -> TargetResult<()> {
        tokio::time::timeout(deadline, self.flush())
            .await
            .map_err(|_| TargetError::Timeout(deadline))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_line_protocol() {
        let mut appender =
            HttpAppender::new("http://localhost:8086/", "bench", 10, Duration::from_secs(1))
                .unwrap();
        let labels = Labels::from_pairs([
            ("__name__", "cpu_usage_user"),
            ("hostname", "host_0"),
            ("region", "eu-west-1"),
        ]);

        appender.render(&labels, 1_451_606_400_000_000_000, 42.5).unwrap();
        appender.render(&labels, 1_451_606_410_000_000_000, 7.0).unwrap();

        assert_eq!(appender.write_url, "http://localhost:8086/write?db=bench");
        assert_eq!(
            &appender.buffer[..],
            b"cpu_usage_user,hostname=host_0,region=eu-west-1 value=42.5 1451606400000000000\n\
              cpu_usage_user,hostname=host_0,region=eu-west-1 value=7 1451606410000000000\n"
        );
    }

    #[tokio::test]
    async fn empty_completion_sends_nothing() {
        let mut appender =
            HttpAppender::new("http://127.0.0.1:9", "bench", 10, Duration::from_millis(50))
                .unwrap();
        appender
            .await_completion(Duration::from_millis(50))
            .await
            .unwrap();
    }
}
