//! Resilient range reader for one fragment's bytes.
//!
//! A [`StreamSource`] keeps a read-ahead window filled by fixed-size range
//! fetches. Transient failures are retried by re-requesting the range at the
//! current absolute offset, so the byte accounting never drifts.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use symphonia::core::io::MediaSource;
use talkbook_types::Resource;

use crate::config::StreamConfig;
use crate::error::{PlayerError, Result};

/// Byte-range access to one remote payload.
pub trait RangeTransport: Send + Sync {
    /// Append up to `len` bytes starting at absolute offset `start` to `out`.
    ///
    /// Returns the total payload length when the transport learns it. On error,
    /// bytes appended before the failure stay in `out` and are kept by the caller.
    fn fetch(&self, start: u64, len: usize, out: &mut Vec<u8>) -> Result<Option<u64>>;
}

/// Builds transports for resources that are not in the local cache.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, resource: &Resource, config: &StreamConfig) -> Result<Box<dyn RangeTransport>>;
}

/// HTTP range transport backed by a shared ureq agent.
pub struct HttpTransport {
    agent: ureq::Agent,
    url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(agent: ureq::Agent, url: String, timeout: Duration) -> Self {
        Self { agent, url, timeout }
    }
}

impl RangeTransport for HttpTransport {
    fn fetch(&self, start: u64, len: usize, out: &mut Vec<u8>) -> Result<Option<u64>> {
        if len == 0 {
            return Ok(None);
        }
        let end = start.saturating_add(len as u64).saturating_sub(1);
        let range = format!("bytes={start}-{end}");
        let started = Instant::now();
        let resp = match self
            .agent
            .get(&self.url)
            .config()
            .timeout_per_call(Some(self.timeout))
            .build()
            .header("Range", &range)
            .call()
        {
            Ok(resp) => resp,
            // Range starts at or past the end: nothing left to read.
            Err(ureq::Error::StatusCode(416)) => return Ok(None),
            Err(ureq::Error::StatusCode(code)) if code >= 500 => {
                return Err(PlayerError::TransientIo(format!("http status {code}")));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(PlayerError::Protocol(format!("http status {code}")));
            }
            Err(e) => {
                return Err(PlayerError::TransientIo(format!("http range request failed: {e}")));
            }
        };

        let status = resp.status();
        let content_range = resp
            .headers()
            .get("Content-Range")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_length = resp
            .headers()
            .get("Content-Length")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let total = match status {
            ureq::http::StatusCode::PARTIAL_CONTENT => content_range
                .as_deref()
                .and_then(parse_content_range_total),
            ureq::http::StatusCode::OK if start == 0 => content_length,
            ureq::http::StatusCode::OK => {
                return Err(PlayerError::Protocol(format!(
                    "server ignored range request at offset {start}"
                )));
            }
            other => {
                return Err(PlayerError::Protocol(format!("unexpected http status {other}")));
            }
        };

        let before = out.len();
        let (_, body) = resp.into_parts();
        let mut reader = body.into_reader().take(len as u64);
        let mut scratch = [0u8; 16 * 1024];
        loop {
            match reader.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => out.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(PlayerError::TransientIo(format!("http read failed: {e}")));
                }
            }
        }

        let elapsed = started.elapsed();
        if elapsed > Duration::from_millis(250) {
            let bytes = out.len() - before;
            let kbps = if elapsed.as_millis() > 0 {
                (bytes as u128 * 1000 / elapsed.as_millis()) / 1024
            } else {
                0
            };
            tracing::warn!(
                took_ms = elapsed.as_millis() as u64,
                bytes,
                kbps = kbps as u64,
                range = range.as_str(),
                "http range fetch slow"
            );
        }
        Ok(total)
    }
}

/// Serves the head of a partially cached payload from disk and the rest from
/// the remote transport.
pub struct CachedPrefixTransport {
    file: Mutex<File>,
    /// Bytes available locally, starting at offset 0.
    cached: u64,
    /// Payload length from the catalog.
    declared: u64,
    remote: Box<dyn RangeTransport>,
}

impl CachedPrefixTransport {
    pub fn open(path: &Path, declared: u64, remote: Box<dyn RangeTransport>) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| PlayerError::TransientIo(format!("open {}: {e}", path.display())))?;
        let cached = file
            .metadata()
            .map_err(|e| PlayerError::TransientIo(format!("stat {}: {e}", path.display())))?
            .len()
            .min(declared);
        Ok(Self {
            file: Mutex::new(file),
            cached,
            declared,
            remote,
        })
    }
}

impl RangeTransport for CachedPrefixTransport {
    fn fetch(&self, start: u64, len: usize, out: &mut Vec<u8>) -> Result<Option<u64>> {
        if len == 0 || start >= self.cached {
            return self.remote.fetch(start, len, out);
        }
        let want = (self.cached - start).min(len as u64);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(start))
            .map_err(|e| PlayerError::TransientIo(format!("seek failed: {e}")))?;
        (&mut *file)
            .take(want)
            .read_to_end(out)
            .map_err(|e| PlayerError::TransientIo(format!("read failed: {e}")))?;
        Ok(Some(self.declared))
    }
}

/// Default factory: every remote resource is fetched over HTTP(S).
pub struct HttpTransportFactory {
    agent: ureq::Agent,
}

impl HttpTransportFactory {
    pub fn new() -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
        }
    }
}

impl Default for HttpTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFactory for HttpTransportFactory {
    fn connect(&self, resource: &Resource, config: &StreamConfig) -> Result<Box<dyn RangeTransport>> {
        if resource.remote_uri.is_empty() {
            return Err(PlayerError::State("resource has no remote location".to_string()));
        }
        Ok(Box::new(HttpTransport::new(
            self.agent.clone(),
            resource.remote_uri.clone(),
            config.timeout,
        )))
    }
}

/// Seekable, buffered, retrying reader over a [`RangeTransport`].
pub struct StreamSource {
    transport: Box<dyn RangeTransport>,
    config: StreamConfig,
    /// Absolute offset of the next byte handed to the caller.
    pos: u64,
    len: Option<u64>,
    declared_len: u64,
    buf: Vec<u8>,
    buf_start: u64,
    failed: Option<PlayerError>,
    closed: bool,
}

impl StreamSource {
    /// Open a session and fetch the first window so unreachable sources fail here.
    pub fn open(
        resource: &Resource,
        transport: Box<dyn RangeTransport>,
        config: StreamConfig,
    ) -> Result<Self> {
        let mut source = Self {
            transport,
            config,
            pos: 0,
            len: None,
            declared_len: resource.byte_size,
            buf: Vec::new(),
            buf_start: 0,
            failed: None,
            closed: false,
        };
        source.fill()?;
        tracing::debug!(
            uri = %resource.remote_uri,
            len = ?source.len,
            "stream source opened"
        );
        Ok(source)
    }

    /// Absolute offset of the next byte to be read.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Total length, once a transport reported it.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// Whether the retry budget was exhausted.
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// End the session. Every later operation returns [`PlayerError::Closed`].
    pub fn close(&mut self) {
        self.closed = true;
        self.buf = Vec::new();
    }

    fn buf_end(&self) -> u64 {
        self.buf_start.saturating_add(self.buf.len() as u64)
    }

    fn before_end(&self, offset: u64) -> bool {
        self.len.is_some_and(|len| offset < len)
    }

    /// Read one value from the session, honoring the closed and failed states.
    fn check_usable(&self) -> Result<()> {
        if self.closed {
            return Err(PlayerError::Closed);
        }
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }
        Ok(())
    }

    /// Record a failed attempt. Returns the error once the retry budget is spent.
    fn retry_or_fail(&mut self, attempts: &mut u32, offset: u64, err: PlayerError) -> Result<()> {
        *attempts += 1;
        if *attempts >= self.config.max_attempts.max(1) {
            tracing::error!(offset, attempts = *attempts, "range fetch failed: {err}");
            self.failed = Some(err.clone());
            return Err(err);
        }
        tracing::warn!(offset, attempt = *attempts, "range fetch failed, retrying: {err}");
        Ok(())
    }

    /// Replace the window with up to one chunk starting at `pos`.
    fn fill(&mut self) -> Result<()> {
        self.buf.clear();
        self.buf_start = self.pos;

        let mut want = self.config.chunk_size.max(1) as u64;
        if let Some(len) = self.len {
            want = want.min(len.saturating_sub(self.pos));
        }
        if want == 0 {
            return Ok(());
        }
        let want = want as usize;

        let mut attempts = 0u32;
        loop {
            let have = self.buf.len();
            let start = self.buf_start + have as u64;
            let err = match self.transport.fetch(start, want - have, &mut self.buf) {
                Ok(total) => {
                    if total.is_some() {
                        self.len = total;
                    }
                    if self.buf.len() > have || !self.before_end(start) {
                        return Ok(());
                    }
                    PlayerError::TransientIo(format!("empty response at offset {start}"))
                }
                Err(err) if err.is_transient() => {
                    let kept = self.buf.len() - have;
                    if kept > 0 {
                        tracing::warn!(offset = start, kept, "range fetch interrupted; keeping partial data");
                        return Ok(());
                    }
                    err
                }
                Err(err) => return Err(err),
            };
            self.retry_or_fail(&mut attempts, start, err)?;
        }
    }

    /// Learn the total length with one-byte fetches under the retry budget.
    fn ensure_len(&mut self) -> Result<u64> {
        self.check_usable()?;
        if let Some(len) = self.len {
            return Ok(len);
        }
        let mut attempts = 0u32;
        loop {
            let mut scratch = Vec::with_capacity(1);
            let err = match self.transport.fetch(0, 1, &mut scratch) {
                Ok(Some(len)) => {
                    self.len = Some(len);
                    return Ok(len);
                }
                Ok(None) => {
                    return Err(PlayerError::Protocol("content length unavailable".to_string()));
                }
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };
            self.retry_or_fail(&mut attempts, 0, err)?;
        }
    }

    fn read_inner(&mut self, out: &mut [u8]) -> Result<usize> {
        self.check_usable()?;
        if out.is_empty() {
            return Ok(0);
        }
        if self.len.is_some_and(|len| self.pos >= len) {
            return Ok(0);
        }

        if self.pos < self.buf_start || self.pos >= self.buf_end() {
            self.fill()?;
        }
        if self.pos >= self.buf_end() {
            return Ok(0);
        }

        let offset = (self.pos - self.buf_start) as usize;
        let to_copy = (self.buf.len() - offset).min(out.len());
        out[..to_copy].copy_from_slice(&self.buf[offset..offset + to_copy]);
        self.pos += to_copy as u64;
        Ok(to_copy)
    }

    fn seek_inner(&mut self, pos: SeekFrom) -> Result<u64> {
        if self.closed {
            return Err(PlayerError::Closed);
        }
        let target = match pos {
            SeekFrom::Start(x) => x as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
            SeekFrom::End(d) => self.ensure_len()? as i128 + d as i128,
        };
        if target < 0 {
            return Err(PlayerError::State(format!("seek to negative offset {target}")));
        }
        let mut target = u64::try_from(target).unwrap_or(u64::MAX);
        if let Some(len) = self.len {
            target = target.min(len);
        }

        if target < self.buf_start || target > self.buf_end() {
            self.buf.clear();
            self.buf_start = target;
        }
        self.pos = target;
        Ok(self.pos)
    }
}

impl Read for StreamSource {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.read_inner(out).map_err(io::Error::from)
    }
}

impl Seek for StreamSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.seek_inner(pos).map_err(io::Error::from)
    }
}

impl MediaSource for StreamSource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        self.len
            .or((self.declared_len > 0).then_some(self.declared_len))
    }
}

/// Extract the total length from a Content-Range header.
fn parse_content_range_total(header: &str) -> Option<u64> {
    // Format: "bytes start-end/total"
    let (_, total) = header.split_once('/')?;
    total.trim().parse::<u64>().ok()
}
