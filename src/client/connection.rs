use crate::error::{CacheError, Result};
use crate::protocol::{
    read_end_marker, read_response, read_stream_header, read_stream_record, write_request, Command, ProtocolError,
    Request, Response,
};
use crate::routing::ShardIndex;
use crate::storage::Triple;
use std::time::Duration;
use tokio::io::{BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Connect attempts with capped exponential backoff and jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub connect_timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            connect_timeout: Duration::from_millis(1000),
            base_delay: Duration::from_millis(150),
            max_delay: Duration::from_millis(1200),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no waiting.
    pub fn once(connect_timeout: Duration) -> Self {
        Self {
            attempts: 1,
            connect_timeout,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16) as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

struct Link {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

/// The single connection from one client to one shard.
///
/// Requests and responses strictly alternate. Any failure that may leave the
/// link out of sync drops the socket; the next call then fails with
/// `NotConnected` until `connect` or `reconnect` succeeds.
pub struct ShardClient {
    shard: ShardIndex,
    address: String,
    policy: RetryPolicy,
    link: Option<Link>,
}

impl ShardClient {
    pub fn new(shard: ShardIndex, address: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            shard,
            address: address.into(),
            policy,
            link: None,
        }
    }

    pub fn shard(&self) -> ShardIndex {
        self.shard
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Points the client at a new address. Takes effect on the next connect.
    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    async fn open(&self) -> std::io::Result<Link> {
        let stream = tokio::time::timeout(self.policy.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", self.address),
                )
            })??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Link {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
        })
    }

    /// Connects using the retry policy. Replaces any existing link.
    pub async fn connect(&mut self) -> Result<()> {
        self.link = None;
        let attempts = self.policy.attempts.max(1);

        for attempt in 0..attempts {
            match self.open().await {
                Ok(link) => {
                    debug!("Connected to shard {} at {}", self.shard, self.address);
                    self.link = Some(link);
                    return Ok(());
                }
                Err(e) => {
                    if attempt + 1 == attempts {
                        warn!(
                            "Shard {} at {} unreachable after {} attempts: {}",
                            self.shard, self.address, attempts, e
                        );
                        return Err(CacheError::Io {
                            shard: self.shard,
                            source: e,
                        });
                    }
                    let jitter = Duration::from_millis(rand::random::<u64>() % 50);
                    tokio::time::sleep(self.policy.delay(attempt) + jitter).await;
                }
            }
        }

        Err(CacheError::NotConnected { shard: self.shard })
    }

    /// Exactly one immediate connect attempt.
    pub async fn reconnect(&mut self) -> Result<()> {
        self.link = None;
        match self.open().await {
            Ok(link) => {
                debug!("Reconnected to shard {} at {}", self.shard, self.address);
                self.link = Some(link);
                Ok(())
            }
            Err(source) => Err(CacheError::Io {
                shard: self.shard,
                source,
            }),
        }
    }

    pub fn disconnect(&mut self) {
        if self.link.take().is_some() {
            debug!("Disconnected from shard {}", self.shard);
        }
    }

    /// Maps a codec failure to a cache error. Remote errors keep the link;
    /// everything else drops it.
    fn fail(&mut self, error: ProtocolError) -> CacheError {
        match error {
            ProtocolError::Remote(message) => CacheError::Server {
                shard: self.shard,
                message,
            },
            ProtocolError::Io(source) => {
                self.disconnect();
                CacheError::Io {
                    shard: self.shard,
                    source,
                }
            }
            other => {
                self.disconnect();
                CacheError::Protocol {
                    shard: self.shard,
                    source: other,
                }
            }
        }
    }

    fn link(&mut self) -> Result<&mut Link> {
        let shard = self.shard;
        self.link.as_mut().ok_or(CacheError::NotConnected { shard })
    }

    async fn send(&mut self, request: &Request) -> Result<()> {
        let link = self.link()?;
        let sent = write_request(&mut link.writer, request).await;
        sent.map_err(|e| self.fail(e))
    }

    /// Sends one request and reads its single response.
    pub async fn request(&mut self, request: Request) -> Result<Response> {
        self.send(&request).await?;
        let link = self.link()?;
        let response = read_response(&mut link.reader).await;
        response.map_err(|e| self.fail(e))
    }

    async fn request_bool(&mut self, request: Request) -> Result<bool> {
        let response = self.request(request).await?;
        response.as_bool().map_err(|e| self.fail(e))
    }

    async fn request_u64(&mut self, request: Request) -> Result<u64> {
        let response = self.request(request).await?;
        response.as_u64().map_err(|e| self.fail(e))
    }

    pub async fn ping(&mut self) -> Result<()> {
        self.request(Request::bare(Command::Ping)).await.map(|_| ())
    }

    /// Set membership, or key presence on a map-set.
    pub async fn contains(&mut self, key: &str) -> Result<bool> {
        self.request_bool(Request::new(Command::Contains, vec![key.to_string()]))
            .await
    }

    pub async fn contains_entry(&mut self, key: &str, value: &str) -> Result<bool> {
        self.request_bool(Request::new(
            Command::ContainsEntry,
            vec![key.to_string(), value.to_string()],
        ))
        .await
    }

    pub async fn add(&mut self, record: &str) -> Result<bool> {
        self.request_bool(Request::new(Command::Add, vec![record.to_string()]))
            .await
    }

    pub async fn add_entry(&mut self, key: &str, value: &str) -> Result<bool> {
        self.request_bool(Request::new(Command::Add, vec![key.to_string(), value.to_string()]))
            .await
    }

    pub async fn add_all(&mut self, records: &[String]) -> Result<u64> {
        self.request_u64(Request::new(Command::AddAll, records.to_vec()))
            .await
    }

    pub async fn remove(&mut self, record: &str) -> Result<bool> {
        self.request_bool(Request::new(Command::Remove, vec![record.to_string()]))
            .await
    }

    pub async fn contains_triple(&mut self, triple: &Triple) -> Result<bool> {
        self.request_bool(Request::new(Command::Contains, triple.fields()))
            .await
    }

    pub async fn add_triple(&mut self, triple: &Triple) -> Result<bool> {
        self.request_bool(Request::new(Command::Add, triple.fields()))
            .await
    }

    pub async fn remove_triple(&mut self, triple: &Triple) -> Result<bool> {
        self.request_bool(Request::new(Command::Remove, triple.fields()))
            .await
    }

    /// Drops every record not in `records`. Returns whether anything was dropped.
    pub async fn retain_all(&mut self, records: &[String]) -> Result<bool> {
        self.request_bool(Request::new(Command::RetainAll, records.to_vec()))
            .await
    }

    pub async fn remove_entry(&mut self, key: &str, value: &str) -> Result<bool> {
        self.request_bool(Request::new(
            Command::Remove,
            vec![key.to_string(), value.to_string()],
        ))
        .await
    }

    pub async fn clear(&mut self) -> Result<()> {
        self.request(Request::bare(Command::Clear)).await.map(|_| ())
    }

    pub async fn is_empty(&mut self) -> Result<bool> {
        self.request_bool(Request::bare(Command::IsEmpty)).await
    }

    pub async fn size(&mut self) -> Result<u64> {
        self.request_u64(Request::bare(Command::Size)).await
    }

    /// Serialized membership filter, `None` when the shard keeps none.
    pub async fn filter(&mut self) -> Result<Option<Vec<u8>>> {
        let mut response = self.request(Request::bare(Command::Filter)).await?;
        match response.args.len() {
            0 => Ok(None),
            1 => Ok(response.args.pop()),
            got => Err(self.fail(ProtocolError::ArgCount { expected: 1, got })),
        }
    }

    /// Administrative reload of this shard alone from `path`.
    ///
    /// Unlike `CacheClient::load` nothing is published: the shard's contents
    /// and filter are replaced, but its loaded generation does not advance and
    /// other shards keep their data. Readers must call `refresh_filters` to see
    /// the new filter.
    pub async fn load(&mut self, path: &str, approx_records: u64, false_positive_rate: f64) -> Result<bool> {
        self.request_bool(Request::new(
            Command::Load,
            vec![
                path.to_string(),
                approx_records.to_string(),
                false_positive_rate.to_string(),
            ],
        ))
        .await
    }

    /// Asks the worker to shut down. The link is closed afterwards.
    pub async fn kill(&mut self) -> Result<()> {
        let result = self.request(Request::bare(Command::Kill)).await.map(|_| ());
        self.disconnect();
        result
    }

    // --- Streaming ---

    /// Sends a streaming request and returns the declared record count. The
    /// caller must read exactly that many records, then `finish_stream`.
    pub async fn begin_stream(&mut self, request: Request) -> Result<u32> {
        self.send(&request).await?;
        let link = self.link()?;
        let header = read_stream_header(&mut link.reader).await;
        header.map_err(|e| self.fail(e))
    }

    pub async fn next_record(&mut self) -> Result<Vec<String>> {
        let link = self.link()?;
        let record = read_stream_record(&mut link.reader).await;
        record.map_err(|e| self.fail(e))
    }

    pub async fn finish_stream(&mut self) -> Result<()> {
        let link = self.link()?;
        let end = read_end_marker(&mut link.reader).await;
        end.map_err(|e| self.fail(e))
    }

    pub async fn stream(&mut self, request: Request) -> Result<ShardStream<'_>> {
        let remaining = self.begin_stream(request).await?;
        Ok(ShardStream {
            client: self,
            remaining,
            finished: false,
        })
    }

    /// Every record on the shard, read eagerly.
    pub async fn scan(&mut self) -> Result<Vec<Vec<String>>> {
        self.stream(Request::bare(Command::Scan)).await?.collect().await
    }

    /// Values stored under `key` on a map-set.
    pub async fn get(&mut self, key: &str) -> Result<Vec<String>> {
        let records = self
            .stream(Request::new(Command::Get, vec![key.to_string()]))
            .await?
            .collect()
            .await?;
        Ok(records.into_iter().flatten().collect())
    }
}

/// Cursor over one streaming reply. Dropping it before the end marker is read
/// closes the link, since the remaining frames can no longer be skipped.
pub struct ShardStream<'a> {
    client: &'a mut ShardClient,
    remaining: u32,
    finished: bool,
}

impl ShardStream<'_> {
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub async fn next(&mut self) -> Result<Option<Vec<String>>> {
        if self.finished {
            return Ok(None);
        }
        if self.remaining == 0 {
            self.finished = true;
            self.client.finish_stream().await?;
            return Ok(None);
        }
        match self.client.next_record().await {
            Ok(record) => {
                self.remaining -= 1;
                Ok(Some(record))
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    pub async fn collect(mut self) -> Result<Vec<Vec<String>>> {
        let mut records = Vec::with_capacity(self.remaining as usize);
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }
}

impl Drop for ShardStream<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.client.disconnect();
        }
    }
}
