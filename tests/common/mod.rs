//! In-process beanstalkd stand-in for integration tests.
//!
//! Implements the commands the client speaks with enough fidelity to check
//! tube routing, job states and blocking reserves. Every command line it
//! receives is recorded so tests can assert on what went over the wire.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

impl JobState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Delayed => "delayed",
            Self::Reserved => "reserved",
            Self::Buried => "buried",
        }
    }
}

#[derive(Debug)]
struct FakeJob {
    tube: String,
    priority: u32,
    body: Vec<u8>,
    state: JobState,
    ready_at: Instant,
    reserved_by: Option<u64>,
}

#[derive(Debug)]
struct Conn {
    id: u64,
    used: String,
    watched: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    next_job: u64,
    next_conn: u64,
    connections: usize,
    jobs: BTreeMap<u64, FakeJob>,
    tubes: BTreeSet<String>,
    totals: BTreeMap<String, u64>,
    paused: BTreeMap<String, Instant>,
    commands: Vec<String>,
}

/// Handle to a running fake server.
#[derive(Debug, Clone)]
pub struct FakeServer {
    addr: String,
    state: Arc<Mutex<State>>,
}

impl FakeServer {
    /// Start on the current tokio runtime.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = Self::bound_to(&listener);
        tokio::spawn(serve(listener, server.state.clone()));
        server
    }

    /// Start on a dedicated thread, for tests that drive blocking clients.
    pub fn start_in_thread() -> Self {
        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let server = FakeServer::bound_to(&listener);
                let state = server.state.clone();
                tx.send(server).unwrap();
                serve(listener, state).await;
            });
        });
        rx.recv().unwrap()
    }

    fn bound_to(listener: &TcpListener) -> Self {
        let mut state = State::default();
        state.tubes.insert("default".to_string());
        Self {
            addr: listener.local_addr().unwrap().to_string(),
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Command lines received so far, across all connections.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.state.lock().unwrap().commands.clear();
    }

    pub fn job_tube(&self, id: u64) -> Option<String> {
        self.state.lock().unwrap().jobs.get(&id).map(|j| j.tube.clone())
    }

    pub fn job_state(&self, id: u64) -> Option<JobState> {
        self.state.lock().unwrap().jobs.get(&id).map(|j| j.state)
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }
}

async fn serve(listener: TcpListener, state: Arc<Mutex<State>>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(handle(stream, state.clone()));
    }
}

async fn handle(stream: TcpStream, state: Arc<Mutex<State>>) {
    let id = {
        let mut s = state.lock().unwrap();
        s.next_conn += 1;
        s.connections += 1;
        s.next_conn
    };
    let mut conn = Conn {
        id,
        used: "default".to_string(),
        watched: vec!["default".to_string()],
    };

    let _ = session(stream, &state, &mut conn).await;

    // Reservations die with the connection.
    let mut s = state.lock().unwrap();
    s.connections -= 1;
    for job in s.jobs.values_mut() {
        if job.reserved_by == Some(id) {
            job.state = JobState::Ready;
            job.reserved_by = None;
        }
    }
}

async fn session(stream: TcpStream, state: &Mutex<State>, conn: &mut Conn) -> std::io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let cmd = line.trim_end().to_string();
        let body = if cmd.starts_with("put ") {
            Some(read_body(&mut reader, &cmd).await?)
        } else {
            None
        };

        let reply = if cmd == "quit" {
            state.lock().unwrap().commands.push(cmd);
            return Ok(());
        } else if cmd == "reserve" || cmd.starts_with("reserve-with-timeout ") {
            state.lock().unwrap().commands.push(cmd.clone());
            reserve(state, conn, &cmd).await
        } else {
            execute(state, conn, &cmd, body)
        };
        write.write_all(&reply).await?;
    }
}

fn execute(state: &Mutex<State>, conn: &mut Conn, cmd: &str, body: Option<Vec<u8>>) -> Vec<u8> {
    state.lock().unwrap().execute(conn, cmd, body)
}

async fn read_body(reader: &mut BufReader<OwnedReadHalf>, cmd: &str) -> std::io::Result<Vec<u8>> {
    let len = cmd
        .split(' ')
        .nth(4)
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(0);
    let mut buf = vec![0; len + 2];
    reader.read_exact(&mut buf).await?;
    buf.truncate(len);
    Ok(buf)
}

async fn reserve(state: &Mutex<State>, conn: &Conn, cmd: &str) -> Vec<u8> {
    let deadline = match cmd.strip_prefix("reserve-with-timeout ") {
        Some(secs) => match secs.parse::<u64>() {
            Ok(secs) => Some(Instant::now() + Duration::from_secs(secs)),
            Err(_) => return line("BAD_FORMAT"),
        },
        None => None,
    };
    loop {
        {
            let mut s = state.lock().unwrap();
            s.promote();
            if let Some(id) = s.next_ready(&conn.watched) {
                if let Some(job) = s.jobs.get_mut(&id) {
                    job.state = JobState::Reserved;
                    job.reserved_by = Some(conn.id);
                    return data(&format!("RESERVED {id}"), &job.body);
                }
            }
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return line("TIMED_OUT");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn line(text: &str) -> Vec<u8> {
    format!("{text}\r\n").into_bytes()
}

fn data(head: &str, body: &[u8]) -> Vec<u8> {
    let mut out = format!("{head} {}\r\n", body.len()).into_bytes();
    out.extend_from_slice(body);
    out.extend_from_slice(b"\r\n");
    out
}

fn yaml_map(pairs: &[(&str, String)]) -> Vec<u8> {
    let mut text = String::from("---\n");
    for (k, v) in pairs {
        text.push_str(&format!("{k}: {v}\n"));
    }
    data("OK", text.as_bytes())
}

fn yaml_list<'a>(items: impl IntoIterator<Item = &'a String>) -> Vec<u8> {
    let mut text = String::from("---\n");
    for item in items {
        text.push_str(&format!("- {item}\n"));
    }
    data("OK", text.as_bytes())
}

impl State {
    fn promote(&mut self) {
        let now = Instant::now();
        for job in self.jobs.values_mut() {
            if job.state == JobState::Delayed && job.ready_at <= now {
                job.state = JobState::Ready;
            }
        }
    }

    fn is_paused(&self, tube: &str) -> bool {
        self.paused
            .get(tube)
            .is_some_and(|until| *until > Instant::now())
    }

    fn next_ready(&self, tubes: &[String]) -> Option<u64> {
        self.jobs
            .iter()
            .filter(|(_, j)| {
                j.state == JobState::Ready && tubes.contains(&j.tube) && !self.is_paused(&j.tube)
            })
            .min_by_key(|(id, j)| (j.priority, **id))
            .map(|(id, _)| *id)
    }

    fn in_tube(&self, tube: &str, state: JobState) -> impl Iterator<Item = (&u64, &FakeJob)> {
        let tube = tube.to_string();
        self.jobs
            .iter()
            .filter(move |(_, j)| j.tube == tube && j.state == state)
    }

    fn found(&self, id: Option<u64>) -> Vec<u8> {
        match id.and_then(|id| self.jobs.get(&id).map(|j| (id, j))) {
            Some((id, job)) => data(&format!("FOUND {id}"), &job.body),
            None => line("NOT_FOUND"),
        }
    }

    fn owned_by(&mut self, id: Option<u64>, conn: &Conn) -> Option<&mut FakeJob> {
        self.jobs
            .get_mut(&id?)
            .filter(|j| j.state == JobState::Reserved && j.reserved_by == Some(conn.id))
    }

    fn count(&self, tube: &str, state: JobState) -> usize {
        self.in_tube(tube, state).count()
    }

    fn execute(&mut self, conn: &mut Conn, cmd: &str, body: Option<Vec<u8>>) -> Vec<u8> {
        self.commands.push(cmd.to_string());
        self.promote();

        let words: Vec<&str> = cmd.split(' ').collect();
        let arg = |i: usize| words.get(i).copied().unwrap_or_default();
        let num = |i: usize| arg(i).parse::<u64>().ok();

        match (words[0], words.len()) {
            ("put", 5) => {
                let (Some(priority), Some(delay)) = (num(1), num(2)) else {
                    return line("BAD_FORMAT");
                };
                self.next_job += 1;
                let id = self.next_job;
                let state = if delay > 0 {
                    JobState::Delayed
                } else {
                    JobState::Ready
                };
                self.tubes.insert(conn.used.clone());
                *self.totals.entry(conn.used.clone()).or_default() += 1;
                self.jobs.insert(
                    id,
                    FakeJob {
                        tube: conn.used.clone(),
                        priority: priority as u32,
                        body: body.unwrap_or_default(),
                        state,
                        ready_at: Instant::now() + Duration::from_secs(delay),
                        reserved_by: None,
                    },
                );
                line(&format!("INSERTED {id}"))
            }
            ("use", 2) => {
                conn.used = arg(1).to_string();
                self.tubes.insert(conn.used.clone());
                line(&format!("USING {}", conn.used))
            }
            ("watch", 2) => {
                let tube = arg(1).to_string();
                if !conn.watched.contains(&tube) {
                    conn.watched.push(tube.clone());
                }
                self.tubes.insert(tube);
                line(&format!("WATCHING {}", conn.watched.len()))
            }
            ("ignore", 2) => {
                let tube = arg(1);
                if conn.watched.iter().any(|t| t == tube) {
                    if conn.watched.len() == 1 {
                        return line("NOT_IGNORED");
                    }
                    conn.watched.retain(|t| t != tube);
                }
                line(&format!("WATCHING {}", conn.watched.len()))
            }
            ("reserve-job", 2) => match num(1).and_then(|id| self.jobs.get_mut(&id).map(|j| (id, j))) {
                Some((id, job)) if job.state != JobState::Reserved => {
                    job.state = JobState::Reserved;
                    job.reserved_by = Some(conn.id);
                    data(&format!("RESERVED {id}"), &job.body)
                }
                _ => line("NOT_FOUND"),
            },
            ("delete", 2) => {
                let deletable = num(1).and_then(|id| self.jobs.get(&id).map(|j| (id, j))).filter(
                    |(_, j)| j.reserved_by.is_none() || j.reserved_by == Some(conn.id),
                );
                match deletable.map(|(id, _)| id) {
                    Some(id) => {
                        self.jobs.remove(&id);
                        line("DELETED")
                    }
                    None => line("NOT_FOUND"),
                }
            }
            ("release", 4) => {
                let (priority, delay) = (num(2).unwrap_or(0), num(3).unwrap_or(0));
                match self.owned_by(num(1), conn) {
                    Some(job) => {
                        job.priority = priority as u32;
                        job.reserved_by = None;
                        job.ready_at = Instant::now() + Duration::from_secs(delay);
                        job.state = if delay > 0 {
                            JobState::Delayed
                        } else {
                            JobState::Ready
                        };
                        line("RELEASED")
                    }
                    None => line("NOT_FOUND"),
                }
            }
            ("bury", 3) => {
                let priority = num(2).unwrap_or(0);
                match self.owned_by(num(1), conn) {
                    Some(job) => {
                        job.priority = priority as u32;
                        job.reserved_by = None;
                        job.state = JobState::Buried;
                        line("BURIED")
                    }
                    None => line("NOT_FOUND"),
                }
            }
            ("touch", 2) => match self.owned_by(num(1), conn) {
                Some(_) => line("TOUCHED"),
                None => line("NOT_FOUND"),
            },
            ("peek", 2) => self.found(num(1)),
            ("peek-ready", 1) => {
                let id = self
                    .in_tube(&conn.used, JobState::Ready)
                    .min_by_key(|(id, j)| (j.priority, **id))
                    .map(|(id, _)| *id);
                self.found(id)
            }
            ("peek-delayed", 1) => {
                let id = self
                    .in_tube(&conn.used, JobState::Delayed)
                    .min_by_key(|(id, j)| (j.ready_at, **id))
                    .map(|(id, _)| *id);
                self.found(id)
            }
            ("peek-buried", 1) => {
                let id = self
                    .in_tube(&conn.used, JobState::Buried)
                    .map(|(id, _)| *id)
                    .next();
                self.found(id)
            }
            ("kick", 2) => {
                let bound = num(1).unwrap_or(0) as usize;
                let mut ids: Vec<u64> = self
                    .in_tube(&conn.used, JobState::Buried)
                    .map(|(id, _)| *id)
                    .take(bound)
                    .collect();
                if ids.is_empty() {
                    ids = self
                        .in_tube(&conn.used, JobState::Delayed)
                        .map(|(id, _)| *id)
                        .take(bound)
                        .collect();
                }
                for id in &ids {
                    if let Some(job) = self.jobs.get_mut(id) {
                        job.state = JobState::Ready;
                    }
                }
                line(&format!("KICKED {}", ids.len()))
            }
            ("kick-job", 2) => match num(1).and_then(|id| self.jobs.get_mut(&id)) {
                Some(job) if matches!(job.state, JobState::Buried | JobState::Delayed) => {
                    job.state = JobState::Ready;
                    line("KICKED")
                }
                _ => line("NOT_FOUND"),
            },
            ("stats-job", 2) => match num(1).and_then(|id| self.jobs.get(&id).map(|j| (id, j))) {
                Some((id, job)) => yaml_map(&[
                    ("id", id.to_string()),
                    ("tube", job.tube.clone()),
                    ("state", job.state.as_str().to_string()),
                    ("pri", job.priority.to_string()),
                ]),
                None => line("NOT_FOUND"),
            },
            ("stats-tube", 2) => {
                let tube = arg(1);
                if !self.tubes.contains(tube) {
                    return line("NOT_FOUND");
                }
                yaml_map(&[
                    ("name", tube.to_string()),
                    ("current-jobs-ready", self.count(tube, JobState::Ready).to_string()),
                    ("current-jobs-reserved", self.count(tube, JobState::Reserved).to_string()),
                    ("current-jobs-delayed", self.count(tube, JobState::Delayed).to_string()),
                    ("current-jobs-buried", self.count(tube, JobState::Buried).to_string()),
                    ("total-jobs", self.totals.get(tube).copied().unwrap_or(0).to_string()),
                ])
            }
            ("stats", 1) => {
                let by_state = |state: JobState| {
                    self.jobs
                        .values()
                        .filter(|j| j.state == state)
                        .count()
                        .to_string()
                };
                yaml_map(&[
                    ("current-jobs-ready", by_state(JobState::Ready)),
                    ("current-jobs-reserved", by_state(JobState::Reserved)),
                    ("current-connections", self.connections.to_string()),
                    ("total-jobs", self.next_job.to_string()),
                ])
            }
            ("list-tubes", 1) => yaml_list(&self.tubes),
            ("list-tube-used", 1) => line(&format!("USING {}", conn.used)),
            ("list-tubes-watched", 1) => yaml_list(&conn.watched),
            ("pause-tube", 3) => {
                let tube = arg(1).to_string();
                if !self.tubes.contains(&tube) {
                    return line("NOT_FOUND");
                }
                let delay = num(2).unwrap_or(0);
                self.paused
                    .insert(tube, Instant::now() + Duration::from_secs(delay));
                line("PAUSED")
            }
            _ => line("UNKNOWN_COMMAND"),
        }
    }
}
