//! Job client: job-lifecycle operations over one beanstalkd connection.

use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobId, PutOptions, Stats};
use crate::transport::{CloseHandle, TcpTransport, Transport};
use crate::tube::TubeRegistry;

/// Client for producing and consuming jobs on a beanstalkd server.
///
/// Every operation is a single round-trip; nothing is retried or cached. The
/// client owns one connection and is not meant to be shared: wrap it in a
/// lock if several tasks need it.
#[derive(Debug)]
pub struct Client<T: Transport = TcpTransport> {
    transport: T,
    tubes: TubeRegistry,
}

impl Client<TcpTransport> {
    /// Connect with the given configuration.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let transport = TcpTransport::connect(&config)
            .await
            .map_err(|e| Error::op("connect", e))?;
        Ok(Self::with_transport(transport))
    }

    /// Connect to `addr` with default options.
    pub async fn connect(addr: &str) -> Result<Self> {
        Self::new(ClientConfig::new(addr)).await
    }
}

impl<T: Transport> Client<T> {
    /// Create a client over an existing transport.
    ///
    /// The transport must be freshly connected: the client assumes the server
    /// is using and watching only `default`.
    pub fn with_transport(transport: T) -> Self {
        Self {
            transport,
            tubes: TubeRegistry::new(),
        }
    }

    /// Get a reference to the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Tube bookkeeping for this connection.
    pub fn tubes(&self) -> &TubeRegistry {
        &self.tubes
    }

    /// Tube that `put` targets.
    pub fn used_tube(&self) -> &str {
        self.tubes.used()
    }

    /// Tubes `reserve` draws from.
    pub fn watched_tubes(&self) -> &[String] {
        self.tubes.watched()
    }

    /// A handle that closes the connection from another task, unblocking any
    /// pending `reserve`.
    pub fn close_handle(&self) -> Option<CloseHandle> {
        self.transport.close_handle()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    // ========== Tubes ==========

    /// Direct subsequent `put`s (and `kick`/`peek-*`) at `tube`.
    ///
    /// Local only; the server sees the name on the next command that depends
    /// on it. Fails without a round-trip if the server would reject the name.
    pub fn use_tube(&mut self, tube: impl Into<String>) -> Result<()> {
        self.tubes.use_tube(tube)
    }

    /// Add `tube` to the watch set.
    ///
    /// Returns `false` if it was already watched. Fails without a round-trip
    /// if the server would reject the name.
    pub fn watch(&mut self, tube: impl Into<String>) -> Result<bool> {
        self.tubes.watch(tube)
    }

    /// Remove `tube` from the watch set.
    ///
    /// Fails without a round-trip if `tube` is the only watched tube or is not
    /// watched at all.
    pub fn ignore(&mut self, tube: &str) -> Result<()> {
        self.tubes.ignore(tube)
    }

    async fn sync_used(&mut self, op: &'static str) -> Result<()> {
        if let Some(tube) = self.tubes.pending_use().map(str::to_owned) {
            self.transport
                .use_tube(&tube)
                .await
                .map_err(|e| Error::op(op, e))?;
            self.tubes.mark_used(&tube);
            tracing::debug!(tube = %tube, "Using tube");
        }
        Ok(())
    }

    async fn sync_watched(&mut self, op: &'static str) -> Result<()> {
        let plan = self.tubes.watch_plan();
        for tube in &plan.watch {
            self.transport
                .watch(tube)
                .await
                .map_err(|e| Error::op(op, e))?;
            self.tubes.mark_watched(tube);
            tracing::debug!(tube = %tube, "Watching tube");
        }
        for tube in &plan.ignore {
            self.transport
                .ignore(tube)
                .await
                .map_err(|e| Error::op(op, e))?;
            self.tubes.mark_ignored(tube);
            tracing::debug!(tube = %tube, "Ignoring tube");
        }
        Ok(())
    }

    // ========== Producer ==========

    /// Put a job on the used tube.
    ///
    /// `delay` keeps it invisible for that long; `ttr` bounds how long a
    /// reservation may be held before the server releases it again.
    pub async fn put(
        &mut self,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId> {
        self.sync_used("put").await?;
        let id = self
            .transport
            .put(priority, delay, ttr, body)
            .await
            .map_err(|e| Error::op("put", e))?;

        tracing::debug!(job_id = id, tube = %self.tubes.used(), "Job put");
        Ok(JobId(id))
    }

    /// Put a job with options.
    pub async fn put_with_options(&mut self, body: &[u8], options: &PutOptions) -> Result<JobId> {
        self.put(body, options.priority, options.delay, options.ttr)
            .await
    }

    // ========== Consumer ==========

    /// Reserve a job from any watched tube.
    ///
    /// `None` or a zero duration waits indefinitely; the wait then ends only
    /// when a job arrives or the connection is closed through a
    /// [`CloseHandle`]. Finite timeouts are rounded up to whole seconds and
    /// fail with a `Timeout` error when no job arrives.
    pub async fn reserve(&mut self, timeout: Option<Duration>) -> Result<Job> {
        self.sync_watched("reserve").await?;
        let job = self
            .transport
            .reserve(timeout)
            .await
            .map_err(|e| Error::op("reserve", e))?;

        tracing::debug!(job_id = %job.id, bytes = job.body.len(), "Job reserved");
        Ok(job)
    }

    /// Reserve a specific job.
    pub async fn reserve_job(&mut self, id: impl Into<JobId>) -> Result<Job> {
        let id = id.into();
        let job = self
            .transport
            .reserve_job(id.0)
            .await
            .map_err(|e| Error::job_op("reserve job", id.0, e))?;

        tracing::debug!(job_id = %id, "Job reserved by id");
        Ok(job)
    }

    /// Delete a job. It must be reserved by this connection, ready, delayed or buried.
    pub async fn delete(&mut self, id: impl Into<JobId>) -> Result<()> {
        let id = id.into();
        self.transport
            .delete(id.0)
            .await
            .map_err(|e| Error::job_op("delete", id.0, e))?;

        tracing::debug!(job_id = %id, "Job deleted");
        Ok(())
    }

    /// Return a job reserved by this connection to the ready queue.
    pub async fn release(
        &mut self,
        id: impl Into<JobId>,
        priority: u32,
        delay: Duration,
    ) -> Result<()> {
        let id = id.into();
        self.transport
            .release(id.0, priority, delay)
            .await
            .map_err(|e| Error::job_op("release", id.0, e))?;

        tracing::debug!(job_id = %id, priority, delay_secs = delay.as_secs(), "Job released");
        Ok(())
    }

    /// Bury a job reserved by this connection.
    pub async fn bury(&mut self, id: impl Into<JobId>, priority: u32) -> Result<()> {
        let id = id.into();
        self.transport
            .bury(id.0, priority)
            .await
            .map_err(|e| Error::job_op("bury", id.0, e))?;

        tracing::debug!(job_id = %id, "Job buried");
        Ok(())
    }

    /// Ask for more time on a job reserved by this connection.
    pub async fn touch(&mut self, id: impl Into<JobId>) -> Result<()> {
        let id = id.into();
        self.transport
            .touch(id.0)
            .await
            .map_err(|e| Error::job_op("touch", id.0, e))
    }

    // ========== Kick ==========

    /// Move up to `bound` buried jobs (or delayed jobs, if none are buried)
    /// on the used tube back to ready. Returns how many moved.
    pub async fn kick(&mut self, bound: u32) -> Result<u64> {
        self.sync_used("kick").await?;
        let kicked = self
            .transport
            .kick(bound)
            .await
            .map_err(|e| Error::op("kick", e))?;

        tracing::debug!(tube = %self.tubes.used(), bound, kicked, "Jobs kicked");
        Ok(kicked)
    }

    /// Kick one buried or delayed job by id.
    pub async fn kick_job(&mut self, id: impl Into<JobId>) -> Result<()> {
        let id = id.into();
        self.transport
            .kick_job(id.0)
            .await
            .map_err(|e| Error::job_op("kick job", id.0, e))
    }

    // ========== Inspection ==========

    /// Fetch a job's body without reserving it.
    pub async fn peek(&mut self, id: impl Into<JobId>) -> Result<Vec<u8>> {
        let id = id.into();
        let job = self
            .transport
            .peek(id.0)
            .await
            .map_err(|e| Error::job_op("peek", id.0, e))?;
        Ok(job.body)
    }

    /// The next ready job on the used tube.
    pub async fn peek_ready(&mut self) -> Result<Job> {
        self.sync_used("peek ready").await?;
        self.transport
            .peek_ready()
            .await
            .map_err(|e| Error::op("peek ready", e))
    }

    /// The delayed job with the shortest delay left on the used tube.
    pub async fn peek_delayed(&mut self) -> Result<Job> {
        self.sync_used("peek delayed").await?;
        self.transport
            .peek_delayed()
            .await
            .map_err(|e| Error::op("peek delayed", e))
    }

    /// The next buried job on the used tube.
    pub async fn peek_buried(&mut self) -> Result<Job> {
        self.sync_used("peek buried").await?;
        self.transport
            .peek_buried()
            .await
            .map_err(|e| Error::op("peek buried", e))
    }

    /// Server-wide counters.
    pub async fn stats(&mut self) -> Result<Stats> {
        self.transport
            .stats()
            .await
            .map_err(|e| Error::op("get stats", e))
    }

    /// Counters for one tube.
    pub async fn stats_tube(&mut self, tube: &str) -> Result<Stats> {
        self.transport
            .stats_tube(tube)
            .await
            .map_err(|e| Error::op("get tube stats", e))
    }

    /// Counters for one job.
    pub async fn stats_job(&mut self, id: impl Into<JobId>) -> Result<Stats> {
        let id = id.into();
        self.transport
            .stats_job(id.0)
            .await
            .map_err(|e| Error::job_op("get job stats", id.0, e))
    }

    /// All tubes the server knows about, in server order.
    pub async fn list_tubes(&mut self) -> Result<Vec<String>> {
        self.transport
            .list_tubes()
            .await
            .map_err(|e| Error::op("list tubes", e))
    }

    /// The tube the server currently has this connection using.
    ///
    /// This is the server's view and may lag [`used_tube`](Self::used_tube)
    /// until the next command that syncs it.
    pub async fn list_tube_used(&mut self) -> Result<String> {
        self.transport
            .list_tube_used()
            .await
            .map_err(|e| Error::op("list used tube", e))
    }

    /// The tubes the server currently has this connection watching.
    ///
    /// Like [`list_tube_used`](Self::list_tube_used), this may lag the local
    /// watch set until the next `reserve`.
    pub async fn list_tubes_watched(&mut self) -> Result<Vec<String>> {
        self.transport
            .list_tubes_watched()
            .await
            .map_err(|e| Error::op("list watched tubes", e))
    }

    /// Stop handing out jobs from `tube` for `delay`.
    pub async fn pause_tube(&mut self, tube: &str, delay: Duration) -> Result<()> {
        self.transport
            .pause_tube(tube, delay)
            .await
            .map_err(|e| Error::op("pause tube", e))?;

        tracing::debug!(tube = %tube, delay_secs = delay.as_secs(), "Tube paused");
        Ok(())
    }

    /// Close the connection. Later operations fail with a transport error.
    pub async fn close(&mut self) -> Result<()> {
        self.transport
            .close()
            .await
            .map_err(|e| Error::op("close", e))
    }
}
