use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};

use serde_json::json;

use crate::adapter::ProcessAdapter;
use crate::prompt::PromptPattern;

pub const DEFAULT_MAX_BUFFER_BYTES: usize = 2_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Waiting,
    PossiblyStuck,
    Completed,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::PossiblyStuck => "possibly-stuck",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Error)
    }

    /// The legal edges of the session state machine. Terminal states are
    /// absorbing; `possibly-stuck` may only step back as far as `waiting`.
    pub fn can_transition(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Idle, Running) | (Idle, Error) => true,
            (Running, Waiting) | (Running, PossiblyStuck) => true,
            (Running, Completed) | (Running, Error) => true,
            (Waiting, PossiblyStuck) | (Waiting, Completed) | (Waiting, Error) => true,
            (PossiblyStuck, Waiting) | (PossiblyStuck, Completed) | (PossiblyStuck, Error) => true,
            _ => false,
        }
    }
}

/// Rolling output buffer: an ordered queue of raw chunks, trimmed from the
/// front so the total stays within the byte cap. A single chunk larger than
/// the cap is kept whole rather than split.
#[derive(Debug)]
pub struct OutputBuffer {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
    max_bytes: usize,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            total_bytes: 0,
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        self.chunks.push_back(chunk.to_vec());
        self.total_bytes = self.total_bytes.saturating_add(chunk.len());
        while self.total_bytes > self.max_bytes && self.chunks.len() > 1 {
            if let Some(dropped) = self.chunks.pop_front() {
                self.total_bytes = self.total_bytes.saturating_sub(dropped.len());
            }
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn joined(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// The last `tail_bytes` of the joined buffer.
    pub fn tail(&self, tail_bytes: usize) -> Vec<u8> {
        let joined = self.joined();
        if joined.len() <= tail_bytes {
            return joined;
        }
        joined[joined.len() - tail_bytes..].to_vec()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// SIGTERM deadline for the whole run; `None` disables the timeout.
    pub timeout: Option<Duration>,
    pub quiet_window: Duration,
    pub waiting_after: Duration,
    pub stuck_after: Duration,
    pub max_buffer_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_millis(30_000)),
            quiet_window: Duration::from_millis(300),
            waiting_after: Duration::from_millis(10_000),
            stuck_after: Duration::from_millis(45_000),
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

pub struct SessionInner {
    pub status: SessionStatus,
    pub buffer: OutputBuffer,
    pub last_line: String,
    pub prompt: Option<PromptPattern>,
    pub last_byte_at: Instant,
    pub last_output_wall: SystemTime,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub exit_seen: bool,
    pub error_reason: Option<String>,
    pub timed_out: bool,
    pub quiet_deadline: Option<Instant>,
    pub kill_deadline: Option<Instant>,
    pub next_idle_tick: Instant,
    pub removal_deadline: Option<Instant>,
    pub adapter: Option<Arc<ProcessAdapter>>,
    pub command: String,
    pub cwd: Option<String>,
    pub shell: String,
    pub started_at: Instant,
    pub started_at_wall: SystemTime,
}

/// Point-in-time copy of the observable session state, taken under one lock
/// acquisition so callers never see a half-applied transition.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub id: String,
    pub status: SessionStatus,
    pub last_output_unix_ms: u128,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<String>,
    pub error_reason: Option<String>,
    pub total_bytes: usize,
    pub text: String,
}

pub struct Session {
    pub id: String,
    pub settings: SessionSettings,
    inner: Mutex<SessionInner>,
    state_changed: Condvar,
    monitor: Mutex<Option<std::thread::Thread>>,
}

impl Session {
    pub fn new(id: String, settings: SessionSettings, command: String, cwd: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            settings,
            inner: Mutex::new(SessionInner {
                status: SessionStatus::Idle,
                buffer: OutputBuffer::new(settings.max_buffer_bytes),
                last_line: String::new(),
                prompt: None,
                last_byte_at: now,
                last_output_wall: SystemTime::now(),
                exit_code: None,
                exit_signal: None,
                exit_seen: false,
                error_reason: None,
                timed_out: false,
                quiet_deadline: None,
                kill_deadline: None,
                next_idle_tick: now + Duration::from_secs(1),
                removal_deadline: None,
                adapter: None,
                command,
                cwd,
                shell: String::new(),
                started_at: now,
                started_at_wall: SystemTime::now(),
            }),
            state_changed: Condvar::new(),
            monitor: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, SessionInner> {
        self.inner.lock().expect("session mutex poisoned")
    }

    /// Applies a status transition if the state machine allows it. Returns
    /// whether the transition happened.
    pub fn transition(&self, inner: &mut SessionInner, next: SessionStatus) -> bool {
        if inner.status == next {
            return false;
        }
        if !inner.status.can_transition(next) {
            crate::diagnostics::warn(format!(
                "session {}: refused transition {} -> {}",
                self.id,
                inner.status.as_str(),
                next.as_str()
            ));
            return false;
        }
        crate::event_log::log_lazy("session_status", || {
            json!({
                "session_id": self.id,
                "from": inner.status.as_str(),
                "to": next.as_str(),
            })
        });
        inner.status = next;
        true
    }

    pub fn register_monitor(&self, thread: std::thread::Thread) {
        *self.monitor.lock().expect("monitor handle poisoned") = Some(thread);
    }

    /// Unparks the monitor thread so rearmed deadlines take effect promptly.
    pub fn wake(&self) {
        if let Some(thread) = self
            .monitor
            .lock()
            .expect("monitor handle poisoned")
            .as_ref()
        {
            thread.unpark();
        }
    }

    pub fn notify_waiters(&self) {
        self.state_changed.notify_all();
    }

    /// Blocks the caller until the session reaches `completed` or `error`.
    pub fn wait_until_terminal(&self) {
        let mut inner = self.lock();
        while !inner.status.is_terminal() {
            inner = self
                .state_changed
                .wait(inner)
                .expect("session mutex poisoned");
        }
    }

    pub fn view(&self, tail_bytes: Option<usize>) -> SessionView {
        let inner = self.lock();
        let text = match tail_bytes {
            Some(tail) => String::from_utf8_lossy(&inner.buffer.tail(tail)).into_owned(),
            None => String::from_utf8_lossy(&inner.buffer.joined()).into_owned(),
        };
        SessionView {
            id: self.id.clone(),
            status: inner.status,
            last_output_unix_ms: unix_ms(inner.last_output_wall),
            exit_code: inner.exit_code,
            exit_signal: inner.exit_signal.clone(),
            error_reason: inner.error_reason.clone(),
            total_bytes: inner.buffer.total_bytes(),
            text,
        }
    }
}

pub fn unix_ms(time: SystemTime) -> u128 {
    time.duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

#[derive(Debug)]
pub enum StoreError {
    LimitReached(usize),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::LimitReached(limit) => {
                write!(f, "session limit reached ({limit} live sessions)")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// The only structure shared across sessions: id → live session. Everything
/// else is owned by the session and its monitor thread.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    max_sessions: usize,
    pub session_timeout: Duration,
    next_seq: AtomicU64,
}

impl SessionStore {
    pub fn new(max_sessions: usize, session_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions,
            session_timeout,
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn create(
        &self,
        settings: SessionSettings,
        command: String,
        cwd: Option<String>,
    ) -> Result<Arc<Session>, StoreError> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        let live = sessions
            .values()
            .filter(|session| !session.lock().status.is_terminal())
            .count();
        if live >= self.max_sessions {
            return Err(StoreError::LimitReached(self.max_sessions));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("s-{}-{seq}", crate::event_log::unix_ms_now());
        let session = Arc::new(Session::new(id.clone(), settings, command, cwd));
        sessions.insert(id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session store poisoned")
            .get(id)
            .cloned()
    }

    pub fn list(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .expect("session store poisoned")
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .expect("session store poisoned")
            .remove(id)
    }
}
