//! Transport abstraction for talking to a beanstalkd server.
//!
//! A [`Transport`] moves one encoded [`Command`] to the server and reads back
//! one [`Response`]. The typed primitives (`put`, `reserve`, `stats`, ...)
//! are provided on top of that single round-trip and interpret the replies,
//! so a transport only has to implement framing.
//!
//! [`TcpTransport`] is the real implementation. The protocol is strictly
//! request/response, so a transport must never have two requests in flight;
//! the `&mut self` receivers enforce that.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use crate::config::ClientConfig;
use crate::error::ProtocolError;
use crate::job::{Job, Stats};
use crate::proto::{self, Command, Reply};

/// Result type for wire-level operations.
pub type WireResult<T> = std::result::Result<T, ProtocolError>;

/// Longest status line accepted from the server.
const MAX_STATUS_LINE: u64 = 512;

/// Largest oversized data block drained to keep the stream aligned.
const MAX_SKIPPED_BLOCK: u64 = 1 << 30;

/// A status line plus its data block, if the reply carried one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Parsed status line.
    pub reply: Reply,
    /// Data block, empty when the reply has none.
    pub body: Vec<u8>,
}

impl Response {
    /// A reply without a data block.
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            body: Vec::new(),
        }
    }

    /// A reply followed by a data block.
    pub fn with_body(reply: Reply, body: impl Into<Vec<u8>>) -> Self {
        Self {
            reply,
            body: body.into(),
        }
    }
}

#[derive(Debug, Default)]
struct CloseSignal {
    closed: AtomicBool,
    notify: Notify,
}

/// Closes a connection from outside the task that owns it.
///
/// Closing wakes any request blocked on the connection (typically a
/// `reserve` without timeout), which then fails with [`ProtocolError::Closed`].
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    inner: Arc<CloseSignal>,
}

impl CloseHandle {
    /// Create an open handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the connection closed and wake any blocked request.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolve once `close` has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent close is not missed.
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

fn unexpected(reply: &Reply) -> ProtocolError {
    ProtocolError::UnexpectedResponse(format!("{:?}", reply))
}

fn job_from(response: Response) -> WireResult<Job> {
    match response.reply {
        Reply::Reserved { id, .. } | Reply::Found { id, .. } => Ok(Job::new(id, response.body)),
        other => Err(unexpected(&other)),
    }
}

fn stats_from(response: Response) -> WireResult<Stats> {
    match response.reply {
        Reply::Ok(_) => proto::parse_yaml_map(&response.body),
        other => Err(unexpected(&other)),
    }
}

fn list_from(response: Response) -> WireResult<Vec<String>> {
    match response.reply {
        Reply::Ok(_) => proto::parse_yaml_list(&response.body),
        other => Err(unexpected(&other)),
    }
}

/// A connection to one beanstalkd server.
///
/// Implementors provide [`send`](Transport::send) and lifecycle methods; the
/// primitives are implemented in terms of `send`.
#[async_trait]
pub trait Transport: Send {
    /// Write `cmd` and read its complete reply.
    ///
    /// Server error replies (`NOT_FOUND`, `TIMED_OUT`, ...) are returned as
    /// the matching [`ProtocolError`].
    async fn send(&mut self, cmd: &Command<'_>) -> WireResult<Response>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&mut self) -> WireResult<()>;

    /// Whether the connection has been closed or discarded.
    fn is_closed(&self) -> bool;

    /// A handle that closes this connection from another task, if supported.
    fn close_handle(&self) -> Option<CloseHandle> {
        None
    }

    // ========== Producer ==========

    /// `use <tube>`
    async fn use_tube(&mut self, tube: &str) -> WireResult<()> {
        match self.send(&Command::Use(tube)).await?.reply {
            Reply::Using(_) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// `put`, returning the new job id.
    async fn put(
        &mut self,
        priority: u32,
        delay: Duration,
        ttr: Duration,
        body: &[u8],
    ) -> WireResult<u64> {
        let cmd = Command::Put {
            priority,
            delay: proto::secs_floor(delay),
            ttr: proto::secs_floor(ttr),
            body,
        };
        match self.send(&cmd).await?.reply {
            Reply::Inserted(id) => Ok(id),
            Reply::Buried(Some(id)) => Err(ProtocolError::Buried(id)),
            other => Err(unexpected(&other)),
        }
    }

    // ========== Consumer ==========

    /// `watch <tube>`, returning the number of watched tubes.
    async fn watch(&mut self, tube: &str) -> WireResult<u64> {
        match self.send(&Command::Watch(tube)).await?.reply {
            Reply::Watching(count) => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    /// `ignore <tube>`, returning the number of watched tubes.
    async fn ignore(&mut self, tube: &str) -> WireResult<u64> {
        match self.send(&Command::Ignore(tube)).await?.reply {
            Reply::Watching(count) => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    /// `reserve-with-timeout`, or plain `reserve` when `timeout` is absent or zero.
    ///
    /// Timeouts are rounded up to whole seconds.
    async fn reserve(&mut self, timeout: Option<Duration>) -> WireResult<Job> {
        let cmd = match timeout {
            Some(t) if !t.is_zero() => Command::ReserveWithTimeout(proto::secs_ceil(t)),
            _ => Command::Reserve,
        };
        job_from(self.send(&cmd).await?)
    }

    /// `reserve-job <id>`
    async fn reserve_job(&mut self, id: u64) -> WireResult<Job> {
        job_from(self.send(&Command::ReserveJob(id)).await?)
    }

    /// `delete <id>`
    async fn delete(&mut self, id: u64) -> WireResult<()> {
        match self.send(&Command::Delete(id)).await?.reply {
            Reply::Deleted => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// `release <id> <pri> <delay>`
    async fn release(&mut self, id: u64, priority: u32, delay: Duration) -> WireResult<()> {
        let cmd = Command::Release {
            id,
            priority,
            delay: proto::secs_floor(delay),
        };
        match self.send(&cmd).await?.reply {
            Reply::Released => Ok(()),
            Reply::Buried(None) => Err(ProtocolError::Buried(id)),
            other => Err(unexpected(&other)),
        }
    }

    /// `bury <id> <pri>`
    async fn bury(&mut self, id: u64, priority: u32) -> WireResult<()> {
        match self.send(&Command::Bury { id, priority }).await?.reply {
            Reply::Buried(None) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// `touch <id>`
    async fn touch(&mut self, id: u64) -> WireResult<()> {
        match self.send(&Command::Touch(id)).await?.reply {
            Reply::Touched => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    // ========== Inspection ==========

    /// `peek <id>`
    async fn peek(&mut self, id: u64) -> WireResult<Job> {
        job_from(self.send(&Command::Peek(id)).await?)
    }

    /// `peek-ready` on the server's used tube.
    async fn peek_ready(&mut self) -> WireResult<Job> {
        job_from(self.send(&Command::PeekReady).await?)
    }

    /// `peek-delayed` on the server's used tube.
    async fn peek_delayed(&mut self) -> WireResult<Job> {
        job_from(self.send(&Command::PeekDelayed).await?)
    }

    /// `peek-buried` on the server's used tube.
    async fn peek_buried(&mut self) -> WireResult<Job> {
        job_from(self.send(&Command::PeekBuried).await?)
    }

    /// `kick <bound>`, returning how many jobs were kicked.
    async fn kick(&mut self, bound: u32) -> WireResult<u64> {
        match self.send(&Command::Kick(bound)).await?.reply {
            Reply::Kicked(Some(count)) => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    /// `kick-job <id>`
    async fn kick_job(&mut self, id: u64) -> WireResult<()> {
        match self.send(&Command::KickJob(id)).await?.reply {
            Reply::Kicked(None) => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// `stats`
    async fn stats(&mut self) -> WireResult<Stats> {
        stats_from(self.send(&Command::Stats).await?)
    }

    /// `stats-tube <tube>`
    async fn stats_tube(&mut self, tube: &str) -> WireResult<Stats> {
        stats_from(self.send(&Command::StatsTube(tube)).await?)
    }

    /// `stats-job <id>`
    async fn stats_job(&mut self, id: u64) -> WireResult<Stats> {
        stats_from(self.send(&Command::StatsJob(id)).await?)
    }

    /// `list-tubes`
    async fn list_tubes(&mut self) -> WireResult<Vec<String>> {
        list_from(self.send(&Command::ListTubes).await?)
    }

    /// `list-tube-used`
    async fn list_tube_used(&mut self) -> WireResult<String> {
        match self.send(&Command::ListTubeUsed).await?.reply {
            Reply::Using(tube) => Ok(tube),
            other => Err(unexpected(&other)),
        }
    }

    /// `list-tubes-watched`
    async fn list_tubes_watched(&mut self) -> WireResult<Vec<String>> {
        list_from(self.send(&Command::ListTubesWatched).await?)
    }

    /// `pause-tube <tube> <delay>`
    async fn pause_tube(&mut self, tube: &str, delay: Duration) -> WireResult<()> {
        let cmd = Command::PauseTube {
            tube,
            delay: proto::secs_floor(delay),
        };
        match self.send(&cmd).await?.reply {
            Reply::Paused => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&mut self, cmd: &Command<'_>) -> WireResult<Response> {
        (**self).send(cmd).await
    }

    async fn close(&mut self) -> WireResult<()> {
        (**self).close().await
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        (**self).close_handle()
    }
}

/// Failures after which the stream position is unknown.
fn breaks_framing(err: &ProtocolError) -> bool {
    matches!(
        err,
        ProtocolError::Io(_)
            | ProtocolError::ConnectionClosed
            | ProtocolError::Closed
            | ProtocolError::Abandoned
            | ProtocolError::UnexpectedResponse(_)
    )
}

fn eof_to_closed(err: std::io::Error) -> ProtocolError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(err)
    }
}

/// TCP transport speaking the beanstalkd text protocol.
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<BufReader<TcpStream>>,
    max_reply_size: usize,
    in_flight: bool,
    shutdown: CloseHandle,
}

impl TcpTransport {
    /// Connect to `config.addr`.
    pub async fn connect(config: &ClientConfig) -> WireResult<Self> {
        let connect = TcpStream::connect(config.addr.as_str());
        let stream = match config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| ProtocolError::ConnectTimeout)??,
            None => connect.await?,
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        tracing::debug!(addr = %config.addr, "Connected to beanstalkd");
        Ok(Self::from_stream(stream, config.max_reply_size))
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, max_reply_size: usize) -> Self {
        Self {
            stream: Some(BufReader::new(stream)),
            max_reply_size,
            in_flight: false,
            shutdown: CloseHandle::new(),
        }
    }

    async fn exchange(
        stream: &mut BufReader<TcpStream>,
        request: &[u8],
        limit: usize,
    ) -> WireResult<Response> {
        stream.get_mut().write_all(request).await?;

        let mut line = Vec::with_capacity(64);
        let n = (&mut *stream)
            .take(MAX_STATUS_LINE)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Err(ProtocolError::ConnectionClosed);
        }
        if !line.ends_with(b"\r\n") {
            return Err(ProtocolError::UnexpectedResponse(
                String::from_utf8_lossy(&line).into_owned(),
            ));
        }
        let text = std::str::from_utf8(&line).map_err(|_| {
            ProtocolError::UnexpectedResponse(String::from_utf8_lossy(&line).into_owned())
        })?;
        tracing::trace!(reply = text.trim_end(), "Reply line");
        let reply = Reply::parse(text)?;

        let body = match reply.body_len() {
            None => Vec::new(),
            Some(len) if len > limit => {
                // Skip the block so the next request still lines up.
                let expected = u64::try_from(len)
                    .ok()
                    .filter(|&n| n <= MAX_SKIPPED_BLOCK)
                    .and_then(|n| n.checked_add(2))
                    .ok_or_else(|| {
                        ProtocolError::UnexpectedResponse(format!(
                            "data block of {len} bytes"
                        ))
                    })?;
                let mut rest = (&mut *stream).take(expected);
                let skipped = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
                if skipped < expected {
                    return Err(ProtocolError::ConnectionClosed);
                }
                return Err(ProtocolError::ReplyTooLarge { size: len, limit });
            }
            Some(len) => {
                let mut buf = vec![0u8; len + 2];
                stream.read_exact(&mut buf).await.map_err(eof_to_closed)?;
                if !buf.ends_with(b"\r\n") {
                    return Err(ProtocolError::UnexpectedResponse(
                        "data block not terminated by CRLF".to_string(),
                    ));
                }
                buf.truncate(len);
                buf
            }
        };

        Ok(Response { reply, body })
    }

    fn discard(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Discarded beanstalkd connection");
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, cmd: &Command<'_>) -> WireResult<Response> {
        let request = cmd.encode()?;
        if self.in_flight {
            self.in_flight = false;
            self.discard();
            return Err(ProtocolError::Abandoned);
        }
        let limit = self.max_reply_size;
        let shutdown = self.shutdown.clone();
        let stream = self.stream.as_mut().ok_or(ProtocolError::Closed)?;

        tracing::trace!(command = cmd.name(), "Sending command");
        self.in_flight = true;
        let result = tokio::select! {
            biased;
            _ = shutdown.closed() => Err(ProtocolError::Closed),
            r = Self::exchange(stream, &request, limit) => r,
        };
        self.in_flight = false;

        if let Err(err) = &result {
            if breaks_framing(err) {
                self.discard();
            }
        }
        result
    }

    async fn close(&mut self) -> WireResult<()> {
        self.shutdown.close();
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        if !self.in_flight {
            if let Err(e) = stream.get_mut().write_all(b"quit\r\n").await {
                tracing::warn!(error = %e, "Failed to send quit");
            }
        }
        self.in_flight = false;
        stream.get_mut().shutdown().await?;
        tracing::debug!("Closed beanstalkd connection");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none() || self.shutdown.is_closed()
    }

    fn close_handle(&self) -> Option<CloseHandle> {
        Some(self.shutdown.clone())
    }
}
