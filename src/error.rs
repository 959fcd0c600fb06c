//! Error types for the wg-beanstalkd client.

use thiserror::Error;

/// Failure reported by the wire layer: socket I/O, framing, or a server
/// error reply.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Socket-level I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection.
    #[error("connection closed by server")]
    ConnectionClosed,

    /// The client was closed locally.
    #[error("connection is closed")]
    Closed,

    /// An earlier request was cancelled before its reply was read, so the
    /// stream position is unknown and the connection was discarded.
    #[error("connection abandoned mid-request")]
    Abandoned,

    /// Connecting did not finish within the configured timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// The tube name would be rejected by the server.
    #[error("invalid tube name: {0:?}")]
    InvalidTubeName(String),

    /// A reply line or data block did not match the protocol.
    #[error("unexpected response: {0:?}")]
    UnexpectedResponse(String),

    /// A data block exceeded the configured reply size limit.
    #[error("reply of {size} bytes exceeds limit of {limit} bytes")]
    ReplyTooLarge { size: usize, limit: usize },

    /// `OUT_OF_MEMORY`
    #[error("out of memory")]
    OutOfMemory,

    /// `INTERNAL_ERROR`
    #[error("internal server error")]
    InternalError,

    /// `BAD_FORMAT`
    #[error("bad format")]
    BadFormat,

    /// `UNKNOWN_COMMAND`
    #[error("unknown command")]
    UnknownCommand,

    /// `EXPECTED_CRLF`
    #[error("expected CRLF")]
    ExpectedCrlf,

    /// `JOB_TOO_BIG`
    #[error("job too big")]
    JobTooBig,

    /// `DRAINING`
    #[error("server is draining")]
    Draining,

    /// `NOT_FOUND`
    #[error("not found")]
    NotFound,

    /// `TIMED_OUT`
    #[error("timeout")]
    TimedOut,

    /// `DEADLINE_SOON`
    #[error("deadline soon")]
    DeadlineSoon,

    /// `NOT_IGNORED`
    #[error("cannot ignore the last watched tube")]
    NotIgnored,

    /// `BURIED <id>`: the server buried the job instead of queueing it
    /// because it could not grow its priority queue.
    #[error("job {0} buried: server out of memory")]
    Buried(u64),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection or protocol failure, including disconnects and use after close.
    Transport,
    /// A reserve deadline elapsed without a job.
    Timeout,
    /// The referenced job or tube does not exist.
    NotFound,
    /// The operation would violate a client-side invariant.
    InvalidState,
    /// The server is out of capacity for the request.
    BufferFull,
    /// Any other condition reported by the server.
    Server,
    /// Invalid client configuration.
    Config,
    /// Misuse of the scripting-host binding.
    Host,
}

impl ProtocolError {
    /// Classify this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TimedOut => ErrorKind::Timeout,
            Self::NotFound => ErrorKind::NotFound,
            Self::OutOfMemory | Self::Buried(_) | Self::JobTooBig | Self::Draining => {
                ErrorKind::BufferFull
            }
            Self::DeadlineSoon | Self::NotIgnored => ErrorKind::Server,
            Self::Io(_)
            | Self::ConnectionClosed
            | Self::Closed
            | Self::Abandoned
            | Self::ConnectTimeout
            | Self::InvalidTubeName(_)
            | Self::UnexpectedResponse(_)
            | Self::ReplyTooLarge { .. }
            | Self::InternalError
            | Self::BadFormat
            | Self::UnknownCommand
            | Self::ExpectedCrlf => ErrorKind::Transport,
        }
    }
}

/// The main error type for the wg-beanstalkd client.
#[derive(Error, Debug)]
pub enum Error {
    /// A server round-trip failed.
    #[error("failed to {op}{}: {source}", job_suffix(.job))]
    Operation {
        /// Name of the attempted operation.
        op: &'static str,
        /// Job the operation targeted, if any.
        job: Option<u64>,
        /// Underlying wire-level failure.
        #[source]
        source: ProtocolError,
    },

    /// The operation would break a client-side invariant.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The tube is not in the watch set.
    #[error("tube {0} is not being watched")]
    NotWatched(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Scripting-host binding error.
    #[error("Host error: {0}")]
    Host(String),
}

fn job_suffix(job: &Option<u64>) -> String {
    match job {
        Some(id) => format!(" job {id}"),
        None => String::new(),
    }
}

impl Error {
    /// Wrap a wire failure with the operation that hit it.
    pub(crate) fn op(op: &'static str, source: ProtocolError) -> Self {
        Self::Operation {
            op,
            job: None,
            source,
        }
    }

    /// Wrap a wire failure with the operation and the job it targeted.
    pub(crate) fn job_op(op: &'static str, job: u64, source: ProtocolError) -> Self {
        Self::Operation {
            op,
            job: Some(job),
            source,
        }
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Operation { source, .. } => source.kind(),
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::NotWatched(_) => ErrorKind::NotFound,
            Self::Config(_) => ErrorKind::Config,
            Self::Host(_) => ErrorKind::Host,
        }
    }

    /// The operation name, for round-trip failures.
    pub fn operation(&self) -> Option<&'static str> {
        match self {
            Self::Operation { op, .. } => Some(*op),
            _ => None,
        }
    }

    /// The job id the failed operation targeted.
    pub fn job_id(&self) -> Option<u64> {
        match self {
            Self::Operation { job, .. } => *job,
            _ => None,
        }
    }

    /// The wire-level cause, for round-trip failures.
    pub fn protocol(&self) -> Option<&ProtocolError> {
        match self {
            Self::Operation { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Shorthand for `kind() == ErrorKind::Timeout`.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Shorthand for `kind() == ErrorKind::NotFound`.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
