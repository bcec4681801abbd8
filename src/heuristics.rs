use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde_json::json;

use crate::adapter::{AdapterSignal, ProcessAdapter};
use crate::ansi;
use crate::finish;
use crate::hooks::{CompletedCommand, CompletionSink, ProgressSink, ProgressUpdate};
use crate::prompt;
use crate::session::{Session, SessionInner, SessionStatus, SessionStore, unix_ms};

/// Terminal sessions stay queryable this long before the monitor removes them
/// from the store.
pub const REMOVAL_GRACE: Duration = Duration::from_secs(60);

const IDLE_POLL: Duration = Duration::from_secs(1);
const MIN_PARK: Duration = Duration::from_millis(5);
const TIMEOUT_REASON: &str = "Command timed out";

/// Per-session engine: ingests adapter chunks and the exit event, drives the
/// status state machine, and owns the session's monitor thread (quiet-complete
/// window, 1 Hz idle classification, run timeout, inactivity eviction, and
/// post-terminal removal).
///
/// Every mutation happens under the session mutex, so chunk ingestion, exit
/// handling, timer fires, and tool snapshots never interleave.
pub struct Heuristics {
    session: Arc<Session>,
    store: Arc<SessionStore>,
    progress: Arc<dyn ProgressSink>,
    completions: Arc<dyn CompletionSink>,
}

impl Heuristics {
    pub fn new(
        session: Arc<Session>,
        store: Arc<SessionStore>,
        progress: Arc<dyn ProgressSink>,
        completions: Arc<dyn CompletionSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            store,
            progress,
            completions,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Spawns the monitor thread. Call once, before or right after `begin`.
    pub fn start(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let handle = thread::Builder::new()
            .name(format!("monitor-{}", self.session.id))
            .spawn(move || engine.monitor_loop())
            .expect("failed to spawn session monitor thread");
        self.session.register_monitor(handle.thread().clone());
    }

    /// Wires a freshly spawned adapter into the session and moves it to
    /// `running`, arming the run timeout when one is configured.
    pub fn begin(&self, adapter: Arc<ProcessAdapter>) {
        let mut inner = self.session.lock();
        inner.shell = adapter.shell().to_string();
        let kind = adapter.kind();
        inner.adapter = Some(adapter);
        self.session.transition(&mut inner, SessionStatus::Running);
        let now = Instant::now();
        inner.started_at = now;
        inner.started_at_wall = SystemTime::now();
        inner.last_byte_at = now;
        inner.last_output_wall = SystemTime::now();
        inner.next_idle_tick = now + IDLE_POLL;
        if let Some(timeout) = self.session.settings.timeout {
            inner.kill_deadline = Some(now + timeout);
        }
        self.emit_progress(format!("command started under {} adapter", kind.as_str()));
        drop(inner);
        self.session.wake();
    }

    /// Marks a session whose adapter never spawned. Terminal immediately.
    pub fn fail_spawn(&self, reason: String) {
        let mut inner = self.session.lock();
        self.finish_with(&mut inner, SessionStatus::Error, Some(reason));
        drop(inner);
        self.session.wake();
    }

    /// Adapter data event. Splits the chunk on `\r?\n`, suppresses spinner
    /// repaints, calibrates and matches the prompt pattern, then appends the
    /// raw, unstripped bytes to the rolling buffer.
    pub fn on_chunk(&self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let mut inner = self.session.lock();
        if inner.status.is_terminal() {
            // Late bytes drained after completion still belong to the output.
            inner.buffer.push(chunk);
            return;
        }

        let text = String::from_utf8_lossy(chunk);
        let mut saw_spinner = false;
        let mut saw_real = false;
        let mut candidate = false;
        for raw_line in text.split('\n') {
            let line = raw_line.trim_matches('\r');
            if line.is_empty() {
                continue;
            }
            if ansi::is_spinner_frame(&inner.last_line, line) {
                saw_spinner = true;
                continue;
            }
            saw_real = true;
            inner.last_line = line.to_string();
            if inner.prompt.is_none()
                && let Some(pattern) = prompt::detect(line)
            {
                inner.prompt = Some(pattern);
                crate::event_log::log_lazy("prompt_calibrated", || {
                    json!({
                        "session_id": self.session.id,
                        "pattern": pattern.describe(),
                    })
                });
            }
            if let Some(pattern) = inner.prompt
                && pattern.matches(line)
            {
                candidate = true;
            }
            // Advisory only; a finish phrase never completes a session.
            let _ = finish::looks_finished(line);
        }

        let spinner_only = saw_spinner && !saw_real;
        if candidate {
            self.arm_quiet(&mut inner);
        } else if saw_real && !inner.exit_seen && inner.quiet_deadline.is_some() {
            // Output resumed before the quiet window elapsed: the candidate
            // completion is off. The exit-armed window stays, so late stdout
            // bytes after exit are absorbed rather than deadlocking the run.
            inner.quiet_deadline = None;
        }

        inner.buffer.push(chunk);
        if !spinner_only {
            inner.last_byte_at = Instant::now();
            inner.last_output_wall = SystemTime::now();
        }
        drop(inner);
        self.session.wake();
    }

    /// Adapter exit event; fires exactly once per session. Records exit info
    /// and arms the quiet window that absorbs late output before completion.
    pub fn on_exit(&self, code: Option<i32>, signal: Option<&'static str>) {
        let mut inner = self.session.lock();
        inner.exit_code = code;
        inner.exit_signal = signal.map(str::to_string);
        inner.exit_seen = true;
        crate::event_log::log_lazy("session_exit", || {
            json!({
                "session_id": self.session.id,
                "exit_code": code,
                "exit_signal": signal,
            })
        });
        if inner.status.is_terminal() {
            return;
        }
        self.arm_quiet(&mut inner);
        drop(inner);
        self.session.wake();
    }

    fn arm_quiet(&self, inner: &mut SessionInner) {
        inner.quiet_deadline = Some(Instant::now() + self.session.settings.quiet_window);
    }

    fn monitor_loop(&self) {
        loop {
            let now = Instant::now();
            let wait = {
                let mut inner = self.session.lock();
                if let Some(deadline) = inner.removal_deadline
                    && now >= deadline
                {
                    drop(inner);
                    self.store.remove(&self.session.id);
                    crate::diagnostics::debug(format!(
                        "session {} removed after grace period",
                        self.session.id
                    ));
                    crate::event_log::log_lazy("session_removed", || {
                        json!({ "session_id": self.session.id })
                    });
                    return;
                }
                self.service(&mut inner, now)
            };
            thread::park_timeout(wait.max(MIN_PARK));
        }
    }

    /// One monitor pass: fire expired deadlines, then report how long the
    /// thread may park until the nearest upcoming one.
    fn service(&self, inner: &mut SessionInner, now: Instant) -> Duration {
        if inner.status.is_terminal() {
            return self.removal_wait(inner, now);
        }

        if let Some(deadline) = inner.kill_deadline
            && now >= deadline
        {
            inner.kill_deadline = None;
            inner.timed_out = true;
            if let Some(adapter) = inner.adapter.clone() {
                if let Err(err) = adapter.signal(AdapterSignal::Terminate) {
                    crate::diagnostics::warn(format!(
                        "session {}: timeout signal failed: {err}",
                        self.session.id
                    ));
                }
            }
            self.emit_progress("run timeout elapsed; sent SIGTERM".to_string());
        }

        if let Some(deadline) = inner.quiet_deadline
            && now >= deadline
        {
            inner.quiet_deadline = None;
            self.finish(inner);
            return self.removal_wait(inner, now);
        }

        if now >= inner.next_idle_tick {
            inner.next_idle_tick = now + IDLE_POLL;
            self.classify_idle(inner, now);
            if inner.status.is_terminal() {
                return self.removal_wait(inner, now);
            }
        }

        let mut wait = inner.next_idle_tick.saturating_duration_since(now);
        for deadline in [inner.quiet_deadline, inner.kill_deadline] {
            if let Some(deadline) = deadline {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
        }
        wait
    }

    fn removal_wait(&self, inner: &SessionInner, now: Instant) -> Duration {
        inner
            .removal_deadline
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(REMOVAL_GRACE)
    }

    /// 1 Hz idle classification. Thresholds only ever push the status
    /// forward; `possibly-stuck` steps back no further than `waiting` once
    /// output resumes, and only on the next tick.
    fn classify_idle(&self, inner: &mut SessionInner, now: Instant) {
        let idle = now.saturating_duration_since(inner.last_byte_at);

        if idle >= self.store.session_timeout {
            self.finish_with(
                inner,
                SessionStatus::Error,
                Some("session evicted after inactivity".to_string()),
            );
            return;
        }

        let waiting_after = self.session.settings.waiting_after;
        let stuck_after = self.session.settings.stuck_after;
        match inner.status {
            SessionStatus::Running => {
                if idle > stuck_after {
                    if self.session.transition(inner, SessionStatus::PossiblyStuck) {
                        self.emit_progress(format!(
                            "no output for {}ms (stuck threshold {}ms); command may be stuck",
                            idle.as_millis(),
                            stuck_after.as_millis()
                        ));
                    }
                } else if idle > waiting_after
                    && self.session.transition(inner, SessionStatus::Waiting)
                {
                    self.emit_progress(format!(
                        "no output for {}ms (waiting threshold {}ms); command may expect input",
                        idle.as_millis(),
                        waiting_after.as_millis()
                    ));
                }
            }
            SessionStatus::Waiting => {
                if idle > stuck_after && self.session.transition(inner, SessionStatus::PossiblyStuck)
                {
                    self.emit_progress(format!(
                        "no output for {}ms (stuck threshold {}ms); command may be stuck",
                        idle.as_millis(),
                        stuck_after.as_millis()
                    ));
                }
            }
            SessionStatus::PossiblyStuck => {
                if idle <= stuck_after {
                    let _ = self.session.transition(inner, SessionStatus::Waiting);
                }
            }
            _ => {}
        }
    }

    /// Quiet window elapsed with the candidate completion still standing.
    fn finish(&self, inner: &mut SessionInner) {
        if inner.timed_out {
            self.finish_with(inner, SessionStatus::Error, Some(TIMEOUT_REASON.to_string()));
        } else {
            self.finish_with(inner, SessionStatus::Completed, None);
        }
    }

    /// The single terminal transition path: disarms every timer, releases the
    /// adapter (tearing down a still-live child), schedules removal, notifies
    /// blocked `run` callers, and hands the record to the completion sink on a
    /// detached thread.
    fn finish_with(&self, inner: &mut SessionInner, status: SessionStatus, reason: Option<String>) {
        if !self.session.transition(inner, status) {
            return;
        }
        if inner.error_reason.is_none() {
            inner.error_reason = reason;
        }
        inner.quiet_deadline = None;
        inner.kill_deadline = None;
        inner.removal_deadline = Some(Instant::now() + REMOVAL_GRACE);
        if let Some(adapter) = inner.adapter.take() {
            adapter.shutdown();
        }

        let record = CompletedCommand {
            session_id: self.session.id.clone(),
            command: inner.command.clone(),
            exit_code: inner.exit_code,
            exit_signal: inner.exit_signal.clone(),
            duration_ms: inner.started_at.elapsed().as_millis(),
            stdout: String::from_utf8_lossy(&inner.buffer.joined()).into_owned(),
            stderr: String::new(),
            cwd: inner.cwd.clone(),
            shell: inner.shell.clone(),
            started_at: unix_ms(inner.started_at_wall),
            ended_at: unix_ms(SystemTime::now()),
        };
        let sink = Arc::clone(&self.completions);
        thread::spawn(move || sink.completed(record));

        self.emit_progress(match status {
            SessionStatus::Completed => "command completed".to_string(),
            _ => format!(
                "command failed: {}",
                inner.error_reason.as_deref().unwrap_or("unknown error")
            ),
        });
        self.session.notify_waiters();
    }

    fn emit_progress(&self, message: String) {
        self.progress.progress(ProgressUpdate {
            tool: "terminal.run".to_string(),
            session_id: self.session.id.clone(),
            current: None,
            total: None,
            indeterminate: true,
            message,
        });
    }
}
