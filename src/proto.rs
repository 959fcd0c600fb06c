//! Wire codec for the beanstalkd text protocol.
//!
//! Commands are single `\r\n`-terminated ASCII lines; `put` is followed by a
//! body and another `\r\n`. Replies start with a status line, and a few of
//! them (`RESERVED`, `FOUND`, `OK`) announce a data block that follows.

use std::time::Duration;

use crate::error::ProtocolError;
use crate::job::Stats;

/// Maximum tube name length accepted by the server.
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// Check `name` against the server's tube naming rules.
pub fn validate_tube_name(name: &str) -> Result<(), ProtocolError> {
    let valid_char =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '/' | ';' | '.' | '$' | '_' | '(' | ')');
    if name.is_empty()
        || name.len() > MAX_TUBE_NAME_LEN
        || name.starts_with('-')
        || !name.chars().all(valid_char)
    {
        return Err(ProtocolError::InvalidTubeName(name.to_string()));
    }
    Ok(())
}

/// Whole seconds, truncated, saturating at `u32::MAX`.
pub fn secs_floor(d: Duration) -> u32 {
    u32::try_from(d.as_secs()).unwrap_or(u32::MAX)
}

/// Whole seconds, rounded up, saturating at `u32::MAX`.
pub fn secs_ceil(d: Duration) -> u32 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// A request to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Put {
        priority: u32,
        delay: u32,
        ttr: u32,
        body: &'a [u8],
    },
    Use(&'a str),
    Reserve,
    ReserveWithTimeout(u32),
    ReserveJob(u64),
    Delete(u64),
    Release {
        id: u64,
        priority: u32,
        delay: u32,
    },
    Bury {
        id: u64,
        priority: u32,
    },
    Touch(u64),
    Watch(&'a str),
    Ignore(&'a str),
    Peek(u64),
    PeekReady,
    PeekDelayed,
    PeekBuried,
    Kick(u32),
    KickJob(u64),
    StatsJob(u64),
    StatsTube(&'a str),
    Stats,
    ListTubes,
    ListTubeUsed,
    ListTubesWatched,
    PauseTube {
        tube: &'a str,
        delay: u32,
    },
    Quit,
}

impl Command<'_> {
    /// Protocol command name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Put { .. } => "put",
            Self::Use(_) => "use",
            Self::Reserve => "reserve",
            Self::ReserveWithTimeout(_) => "reserve-with-timeout",
            Self::ReserveJob(_) => "reserve-job",
            Self::Delete(_) => "delete",
            Self::Release { .. } => "release",
            Self::Bury { .. } => "bury",
            Self::Touch(_) => "touch",
            Self::Watch(_) => "watch",
            Self::Ignore(_) => "ignore",
            Self::Peek(_) => "peek",
            Self::PeekReady => "peek-ready",
            Self::PeekDelayed => "peek-delayed",
            Self::PeekBuried => "peek-buried",
            Self::Kick(_) => "kick",
            Self::KickJob(_) => "kick-job",
            Self::StatsJob(_) => "stats-job",
            Self::StatsTube(_) => "stats-tube",
            Self::Stats => "stats",
            Self::ListTubes => "list-tubes",
            Self::ListTubeUsed => "list-tube-used",
            Self::ListTubesWatched => "list-tubes-watched",
            Self::PauseTube { .. } => "pause-tube",
            Self::Quit => "quit",
        }
    }

    /// Serialize to wire bytes, validating any tube name first.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let name = self.name();
        let line = match self {
            Self::Put {
                priority,
                delay,
                ttr,
                body,
            } => {
                let mut buf = format!("{name} {priority} {delay} {ttr} {}\r\n", body.len())
                    .into_bytes();
                buf.reserve(body.len() + 2);
                buf.extend_from_slice(body);
                buf.extend_from_slice(b"\r\n");
                return Ok(buf);
            }
            Self::Use(tube) | Self::Watch(tube) | Self::Ignore(tube) | Self::StatsTube(tube) => {
                validate_tube_name(tube)?;
                format!("{name} {tube}")
            }
            Self::PauseTube { tube, delay } => {
                validate_tube_name(tube)?;
                format!("{name} {tube} {delay}")
            }
            Self::ReserveWithTimeout(secs) => format!("{name} {secs}"),
            Self::Kick(bound) => format!("{name} {bound}"),
            Self::ReserveJob(id)
            | Self::Delete(id)
            | Self::Touch(id)
            | Self::Peek(id)
            | Self::KickJob(id)
            | Self::StatsJob(id) => format!("{name} {id}"),
            Self::Release {
                id,
                priority,
                delay,
            } => format!("{name} {id} {priority} {delay}"),
            Self::Bury { id, priority } => format!("{name} {id} {priority}"),
            Self::Reserve
            | Self::PeekReady
            | Self::PeekDelayed
            | Self::PeekBuried
            | Self::Stats
            | Self::ListTubes
            | Self::ListTubeUsed
            | Self::ListTubesWatched
            | Self::Quit => name.to_string(),
        };
        let mut buf = line.into_bytes();
        buf.extend_from_slice(b"\r\n");
        Ok(buf)
    }
}

/// A successful status line. Error replies are returned as [`ProtocolError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Inserted(u64),
    /// `BURIED` after bury/release, or `BURIED <id>` after put.
    Buried(Option<u64>),
    Using(String),
    /// Followed by a body of the given length.
    Reserved { id: u64, len: usize },
    Deleted,
    Released,
    Touched,
    Watching(u64),
    /// Followed by a body of the given length.
    Found { id: u64, len: usize },
    /// `KICKED <count>` after kick, bare `KICKED` after kick-job.
    Kicked(Option<u64>),
    /// Followed by a YAML body of the given length.
    Ok(usize),
    Paused,
}

impl Reply {
    /// Length of the data block announced by this reply, if any.
    pub fn body_len(&self) -> Option<usize> {
        match self {
            Self::Reserved { len, .. } | Self::Found { len, .. } | Self::Ok(len) => Some(*len),
            _ => None,
        }
    }

    /// Parse a status line, with or without its trailing `\r\n`.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split(' ');
        let word = parts.next().unwrap_or_default();
        let args: Vec<&str> = parts.collect();
        let unexpected = || ProtocolError::UnexpectedResponse(line.to_string());
        let num = |idx: usize| -> Result<u64, ProtocolError> {
            args.get(idx)
                .and_then(|s| s.parse::<u64>().ok())
                .ok_or_else(unexpected)
        };
        let len = |idx: usize| -> Result<usize, ProtocolError> {
            args.get(idx)
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(unexpected)
        };
        let arity = |n: usize| -> Result<(), ProtocolError> {
            if args.len() == n {
                Ok(())
            } else {
                Err(unexpected())
            }
        };

        match word {
            "INSERTED" => {
                arity(1)?;
                Ok(Self::Inserted(num(0)?))
            }
            "BURIED" => match args.len() {
                0 => Ok(Self::Buried(None)),
                1 => Ok(Self::Buried(Some(num(0)?))),
                _ => Err(unexpected()),
            },
            "USING" => {
                arity(1)?;
                Ok(Self::Using(args[0].to_string()))
            }
            "RESERVED" => {
                arity(2)?;
                Ok(Self::Reserved {
                    id: num(0)?,
                    len: len(1)?,
                })
            }
            "FOUND" => {
                arity(2)?;
                Ok(Self::Found {
                    id: num(0)?,
                    len: len(1)?,
                })
            }
            "OK" => {
                arity(1)?;
                Ok(Self::Ok(len(0)?))
            }
            "WATCHING" => {
                arity(1)?;
                Ok(Self::Watching(num(0)?))
            }
            "KICKED" => match args.len() {
                0 => Ok(Self::Kicked(None)),
                1 => Ok(Self::Kicked(Some(num(0)?))),
                _ => Err(unexpected()),
            },
            "DELETED" if args.is_empty() => Ok(Self::Deleted),
            "RELEASED" if args.is_empty() => Ok(Self::Released),
            "TOUCHED" if args.is_empty() => Ok(Self::Touched),
            "PAUSED" if args.is_empty() => Ok(Self::Paused),
            "OUT_OF_MEMORY" => Err(ProtocolError::OutOfMemory),
            "INTERNAL_ERROR" => Err(ProtocolError::InternalError),
            "BAD_FORMAT" => Err(ProtocolError::BadFormat),
            "UNKNOWN_COMMAND" => Err(ProtocolError::UnknownCommand),
            "EXPECTED_CRLF" => Err(ProtocolError::ExpectedCrlf),
            "JOB_TOO_BIG" => Err(ProtocolError::JobTooBig),
            "DRAINING" => Err(ProtocolError::Draining),
            "NOT_FOUND" => Err(ProtocolError::NotFound),
            "TIMED_OUT" => Err(ProtocolError::TimedOut),
            "DEADLINE_SOON" => Err(ProtocolError::DeadlineSoon),
            "NOT_IGNORED" => Err(ProtocolError::NotIgnored),
            _ => Err(unexpected()),
        }
    }
}

fn yaml_lines(body: &[u8]) -> Result<impl Iterator<Item = &str>, ProtocolError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| ProtocolError::UnexpectedResponse("non UTF-8 YAML body".to_string()))?;
    Ok(text
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty() && *l != "---"))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

/// Parse the flat YAML mapping returned by `stats`, `stats-tube` and `stats-job`.
pub fn parse_yaml_map(body: &[u8]) -> Result<Stats, ProtocolError> {
    let mut map = Stats::new();
    for line in yaml_lines(body)? {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| ProtocolError::UnexpectedResponse(line.to_string()))?;
        map.insert(key.trim().to_string(), unquote(value.trim()).to_string());
    }
    Ok(map)
}

/// Parse the YAML sequence returned by `list-tubes` and `list-tubes-watched`.
pub fn parse_yaml_list(body: &[u8]) -> Result<Vec<String>, ProtocolError> {
    yaml_lines(body)?
        .map(|line| {
            line.strip_prefix("- ")
                .map(|item| unquote(item.trim()).to_string())
                .ok_or_else(|| ProtocolError::UnexpectedResponse(line.to_string()))
        })
        .collect()
}
