use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use std::io::{Read, Write};

#[cfg(target_family = "unix")]
use std::fs::File;
#[cfg(target_family = "unix")]
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
#[cfg(target_family = "unix")]
use std::os::unix::process::CommandExt;
#[cfg(target_family = "unix")]
use sysinfo::{Pid, ProcessesToUpdate, System};

use serde_json::json;

const PTY_COLS: u16 = 120;
const PTY_ROWS: u16 = 30;
const WRITE_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_TERM_GRACE: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);
const READ_BUFFER_BYTES: usize = 8192;

#[derive(Debug)]
pub enum AdapterError {
    Io(std::io::Error),
    Spawn(String),
    Closed,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterError::Io(err) => write!(f, "adapter io error: {err}"),
            AdapterError::Spawn(message) => write!(f, "failed to spawn command: {message}"),
            AdapterError::Closed => write!(f, "adapter is closed"),
        }
    }
}

impl std::error::Error for AdapterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AdapterError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(err: std::io::Error) -> Self {
        AdapterError::Io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Plain,
    Pty,
}

impl AdapterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AdapterKind::Plain => "plain",
            AdapterKind::Pty => "pty",
        }
    }
}

/// OS signals the adapter can deliver. The synthetic `CTRL_C` request is a
/// `write` of `0x03` at the tool layer and never reaches this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterSignal {
    Interrupt,
    Terminate,
    Kill,
}

impl AdapterSignal {
    #[cfg(target_family = "unix")]
    fn as_libc(self) -> i32 {
        match self {
            AdapterSignal::Interrupt => libc::SIGINT,
            AdapterSignal::Terminate => libc::SIGTERM,
            AdapterSignal::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnRequest {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub shell: Option<String>,
    pub env: Vec<(String, String)>,
    pub use_pty: bool,
    pub default_shell: Option<String>,
}

pub type DataCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type ExitCallback = Arc<dyn Fn(Option<i32>, Option<&'static str>) + Send + Sync>;

enum StdinCommand {
    Write {
        payload: Vec<u8>,
        reply: mpsc::Sender<Result<(), AdapterError>>,
    },
}

/// Handle to a spawned command: either a plain child with merged, piped
/// stdout/stderr or a child attached to a pseudo-terminal. All bytes reach the
/// data callback in adapter order; exit is reported exactly once.
pub struct ProcessAdapter {
    kind: AdapterKind,
    child_pid: u32,
    shell: String,
    stdin_tx: mpsc::Sender<StdinCommand>,
    exited: Arc<AtomicBool>,
}

impl ProcessAdapter {
    /// Spawns `request.command` under the configured shell. When the PTY
    /// variant is requested but fails to initialize, falls back to the plain
    /// variant with a logged warning.
    pub fn spawn(
        request: &SpawnRequest,
        on_data: DataCallback,
        on_exit: ExitCallback,
    ) -> Result<Arc<Self>, AdapterError> {
        if request.use_pty {
            match Self::spawn_pty(request, on_data.clone(), on_exit.clone()) {
                Ok(adapter) => return Ok(adapter),
                Err(err) => {
                    crate::diagnostics::warn(format!(
                        "pty adapter unavailable, falling back to plain: {err}"
                    ));
                    crate::event_log::log(
                        "adapter_pty_fallback",
                        json!({ "error": err.to_string() }),
                    );
                }
            }
        }
        Self::spawn_plain(request, on_data, on_exit)
    }

    pub fn kind(&self) -> AdapterKind {
        self.kind
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Writes bytes to the child verbatim. Callers append their own newline to
    /// submit a line.
    pub fn write(&self, bytes: &[u8]) -> Result<(), AdapterError> {
        if self.exited.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.stdin_tx
            .send(StdinCommand::Write {
                payload: bytes.to_vec(),
                reply: reply_tx,
            })
            .map_err(|_| AdapterError::Closed)?;
        match reply_rx.recv_timeout(WRITE_REPLY_TIMEOUT) {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Closed),
        }
    }

    /// Delivers a signal to the child's process group. The PTY variant
    /// ignores the requested signal and sends the terminal-hangup default.
    pub fn signal(&self, signal: AdapterSignal) -> Result<(), AdapterError> {
        match self.kind {
            AdapterKind::Plain => self.deliver(signal),
            AdapterKind::Pty => self.deliver_hangup(),
        }
    }

    /// Best-effort teardown of a child that outlived its session: TERM, a
    /// short grace window, then KILL. Runs on a detached thread so terminal
    /// state transitions never wait on a dying process.
    pub fn shutdown(self: &Arc<Self>) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.deliver(AdapterSignal::Terminate);
        let adapter = Arc::clone(self);
        thread::spawn(move || {
            let deadline = std::time::Instant::now() + SHUTDOWN_TERM_GRACE;
            while std::time::Instant::now() < deadline {
                if adapter.exited.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(SHUTDOWN_POLL);
            }
            let _ = adapter.deliver(AdapterSignal::Kill);
        });
    }

    fn spawn_plain(
        request: &SpawnRequest,
        on_data: DataCallback,
        on_exit: ExitCallback,
    ) -> Result<Arc<Self>, AdapterError> {
        let (program, args) = resolve_shell(request);
        let mut command = Command::new(&program);
        command.args(&args).arg(&request.command);
        configure_command(&mut command, request);
        #[cfg(target_family = "unix")]
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| AdapterError::Spawn(err.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AdapterError::Spawn("child stdin unavailable".to_string()))?;
        let stdin_tx = spawn_stdin_writer(stdin);
        spawn_output_reader(child.stdout.take(), on_data.clone());
        spawn_output_reader(child.stderr.take(), on_data);

        Ok(Self::finish_spawn(
            AdapterKind::Plain,
            program,
            child,
            stdin_tx,
            on_exit,
        ))
    }

    #[cfg(target_family = "unix")]
    fn spawn_pty(
        request: &SpawnRequest,
        on_data: DataCallback,
        on_exit: ExitCallback,
    ) -> Result<Arc<Self>, AdapterError> {
        let (program, args) = resolve_shell(request);
        let (master, slave) = open_pty_pair(PTY_COLS, PTY_ROWS)?;
        let slave_fd = slave.as_raw_fd();

        let mut command = Command::new(&program);
        command.args(&args).arg(&request.command);
        configure_command(&mut command, request);

        let stdin = slave.try_clone()?;
        let stdout = slave.try_clone()?;
        let stderr = slave;
        command
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        unsafe {
            command.pre_exec(move || {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .map_err(|err| AdapterError::Spawn(err.to_string()))?;

        // The child holds its own slave copies; ours went into Stdio above.
        let master_reader = master.try_clone()?;
        let stdin_tx = spawn_stdin_writer(master);
        spawn_output_reader(Some(master_reader), on_data);

        Ok(Self::finish_spawn(
            AdapterKind::Pty,
            program,
            child,
            stdin_tx,
            on_exit,
        ))
    }

    #[cfg(not(target_family = "unix"))]
    fn spawn_pty(
        _request: &SpawnRequest,
        _on_data: DataCallback,
        _on_exit: ExitCallback,
    ) -> Result<Arc<Self>, AdapterError> {
        Err(AdapterError::Spawn(
            "pty adapter requires a unix platform".to_string(),
        ))
    }

    fn finish_spawn(
        kind: AdapterKind,
        shell: String,
        child: Child,
        stdin_tx: mpsc::Sender<StdinCommand>,
        on_exit: ExitCallback,
    ) -> Arc<Self> {
        let exited = Arc::new(AtomicBool::new(false));
        let adapter = Arc::new(Self {
            kind,
            child_pid: child.id(),
            shell,
            stdin_tx,
            exited: exited.clone(),
        });
        spawn_exit_watcher(child, exited, on_exit);
        adapter
    }

    #[cfg(target_family = "unix")]
    fn deliver(&self, signal: AdapterSignal) -> Result<(), AdapterError> {
        self.deliver_raw(signal.as_libc())
    }

    #[cfg(target_family = "unix")]
    fn deliver_hangup(&self) -> Result<(), AdapterError> {
        self.deliver_raw(libc::SIGHUP)
    }

    #[cfg(target_family = "unix")]
    fn deliver_raw(&self, signal: i32) -> Result<(), AdapterError> {
        let pid = self.child_pid as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        // Process group already gone: nothing left to signal.
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        // Group signaling can fail when a descendant changed its group; fall
        // back to a process-table walk.
        self.kill_process_tree_scan(signal);
        Ok(())
    }

    #[cfg(target_family = "unix")]
    fn kill_process_tree_scan(&self, signal: i32) {
        let root = Pid::from_u32(self.child_pid);
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        let mut children: std::collections::HashMap<Pid, Vec<Pid>> =
            std::collections::HashMap::new();
        for (proc_pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*proc_pid);
            }
        }

        let mut stack = vec![root];
        let mut seen: std::collections::HashSet<Pid> = std::collections::HashSet::new();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(kids) = children.get(&current) {
                for child in kids {
                    if !seen.contains(child) {
                        stack.push(*child);
                    }
                }
            }
        }

        for pid in seen {
            let _ = unsafe { libc::kill(pid.as_u32() as i32, signal) };
        }
    }

    #[cfg(not(target_family = "unix"))]
    fn deliver(&self, signal: AdapterSignal) -> Result<(), AdapterError> {
        match signal {
            // No portable console-interrupt delivery; callers use CTRL_C.
            AdapterSignal::Interrupt => Ok(()),
            AdapterSignal::Terminate | AdapterSignal::Kill => {
                let status = Command::new("taskkill")
                    .args(["/PID", &self.child_pid.to_string(), "/T", "/F"])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()?;
                let _ = status;
                Ok(())
            }
        }
    }

    #[cfg(not(target_family = "unix"))]
    fn deliver_hangup(&self) -> Result<(), AdapterError> {
        self.deliver(AdapterSignal::Terminate)
    }
}

fn configure_command(command: &mut Command, request: &SpawnRequest) {
    if let Some(cwd) = &request.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &request.env {
        command.env(key, value);
    }
}

#[cfg(target_family = "unix")]
fn resolve_shell(request: &SpawnRequest) -> (String, Vec<String>) {
    let program = request
        .shell
        .clone()
        .or_else(|| request.default_shell.clone())
        .unwrap_or_else(|| "bash".to_string());
    (program, vec!["-lc".to_string()])
}

#[cfg(not(target_family = "unix"))]
fn resolve_shell(request: &SpawnRequest) -> (String, Vec<String>) {
    let program = request
        .shell
        .clone()
        .or_else(|| request.default_shell.clone())
        .unwrap_or_else(|| "powershell".to_string());
    (
        program,
        vec![
            "-NoLogo".to_string(),
            "-NoProfile".to_string(),
            "-Command".to_string(),
        ],
    )
}

#[cfg(target_family = "unix")]
fn open_pty_pair(cols: u16, rows: u16) -> Result<(File, File), AdapterError> {
    let mut master: RawFd = -1;
    let mut slave: RawFd = -1;
    let mut window = libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let result = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut window,
        )
    };
    if result != 0 {
        return Err(AdapterError::Io(std::io::Error::last_os_error()));
    }
    set_cloexec(master, true)?;
    set_cloexec(slave, false)?;
    let master = unsafe { File::from_raw_fd(master) };
    let slave = unsafe { File::from_raw_fd(slave) };
    Ok((master, slave))
}

#[cfg(target_family = "unix")]
fn set_cloexec(fd: RawFd, enabled: bool) -> Result<(), AdapterError> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(AdapterError::Io(std::io::Error::last_os_error()));
    }
    let flags = if enabled {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags) } < 0 {
        return Err(AdapterError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn spawn_output_reader<R>(stream: Option<R>, on_data: DataCallback)
where
    R: Read + Send + 'static,
{
    let Some(mut stream) = stream else {
        return;
    };
    thread::spawn(move || {
        let mut buffer = [0u8; READ_BUFFER_BYTES];
        loop {
            match stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => on_data(&buffer[..n]),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
}

fn spawn_stdin_writer<W>(stdin: W) -> mpsc::Sender<StdinCommand>
where
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<StdinCommand>();
    thread::spawn(move || {
        let mut writer = std::io::BufWriter::new(stdin);
        for command in rx {
            match command {
                StdinCommand::Write { payload, reply } => {
                    let result = writer
                        .write_all(&payload)
                        .and_then(|_| writer.flush())
                        .map_err(AdapterError::Io);
                    let _ = reply.send(result);
                }
            }
        }
    });
    tx
}

fn spawn_exit_watcher(mut child: Child, exited: Arc<AtomicBool>, on_exit: ExitCallback) {
    thread::spawn(move || {
        let status = child.wait();
        exited.store(true, Ordering::SeqCst);
        match status {
            Ok(status) => {
                let (code, signal) = split_exit_status(&status);
                on_exit(code, signal);
            }
            Err(err) => {
                crate::diagnostics::warn(format!("failed to reap child: {err}"));
                on_exit(None, None);
            }
        }
    });
}

#[cfg(target_family = "unix")]
fn split_exit_status(status: &std::process::ExitStatus) -> (Option<i32>, Option<&'static str>) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        return (None, Some(signal_name(signal)));
    }
    (status.code(), None)
}

#[cfg(not(target_family = "unix"))]
fn split_exit_status(status: &std::process::ExitStatus) -> (Option<i32>, Option<&'static str>) {
    (status.code(), None)
}

#[cfg(target_family = "unix")]
pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGKILL => "SIGKILL",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSEGV => "SIGSEGV",
        _ => "signal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    fn collecting_sinks() -> (
        DataCallback,
        ExitCallback,
        Arc<Mutex<Vec<u8>>>,
        Arc<Mutex<Option<(Option<i32>, Option<&'static str>)>>>,
    ) {
        let data = Arc::new(Mutex::new(Vec::new()));
        let exit = Arc::new(Mutex::new(None));
        let data_sink = data.clone();
        let exit_sink = exit.clone();
        let on_data: DataCallback = Arc::new(move |bytes: &[u8]| {
            data_sink.lock().unwrap().extend_from_slice(bytes);
        });
        let on_exit: ExitCallback = Arc::new(move |code, signal| {
            *exit_sink.lock().unwrap() = Some((code, signal));
        });
        (on_data, on_exit, data, exit)
    }

    fn wait_for_exit(
        exit: &Arc<Mutex<Option<(Option<i32>, Option<&'static str>)>>>,
        timeout: Duration,
    ) -> (Option<i32>, Option<&'static str>) {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = *exit.lock().unwrap() {
                return result;
            }
            assert!(Instant::now() < deadline, "timed out waiting for exit");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    #[cfg(unix)]
    fn plain_adapter_merges_output_and_reports_exit() {
        let (on_data, on_exit, data, exit) = collecting_sinks();
        let request = SpawnRequest {
            command: "echo out; echo err >&2".to_string(),
            ..SpawnRequest::default()
        };
        let adapter = ProcessAdapter::spawn(&request, on_data, on_exit).expect("spawn");
        assert_eq!(adapter.kind(), AdapterKind::Plain);

        let (code, signal) = wait_for_exit(&exit, Duration::from_secs(10));
        assert_eq!(code, Some(0));
        assert_eq!(signal, None);

        // Reader threads may still be draining right at exit.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let captured = data.lock().unwrap().clone();
            let text = String::from_utf8_lossy(&captured).to_string();
            if text.contains("out") && text.contains("err") {
                break;
            }
            assert!(Instant::now() < deadline, "output never arrived: {text:?}");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    #[cfg(unix)]
    fn write_reaches_child_stdin() {
        let (on_data, on_exit, data, exit) = collecting_sinks();
        let request = SpawnRequest {
            command: "read line; echo \"got:$line\"".to_string(),
            ..SpawnRequest::default()
        };
        let adapter = ProcessAdapter::spawn(&request, on_data, on_exit).expect("spawn");
        adapter.write(b"ping\n").expect("write");

        let (code, _) = wait_for_exit(&exit, Duration::from_secs(10));
        assert_eq!(code, Some(0));
        let captured = data.lock().unwrap().clone();
        let text = String::from_utf8_lossy(&captured).to_string();
        assert!(text.contains("got:ping"), "unexpected output: {text:?}");
    }

    #[test]
    #[cfg(unix)]
    fn terminate_signal_ends_the_child() {
        let (on_data, on_exit, _data, exit) = collecting_sinks();
        let request = SpawnRequest {
            command: "sleep 30".to_string(),
            ..SpawnRequest::default()
        };
        let adapter = ProcessAdapter::spawn(&request, on_data, on_exit).expect("spawn");
        adapter.signal(AdapterSignal::Terminate).expect("signal");

        let (code, signal) = wait_for_exit(&exit, Duration::from_secs(10));
        assert!(code.is_none() || code != Some(0));
        if let Some(name) = signal {
            assert_eq!(name, "SIGTERM");
        }
    }

    #[test]
    #[cfg(unix)]
    fn spawn_failure_is_reported() {
        let (on_data, on_exit, _data, _exit) = collecting_sinks();
        let request = SpawnRequest {
            command: "echo hi".to_string(),
            shell: Some("/nonexistent/shell-binary".to_string()),
            ..SpawnRequest::default()
        };
        let result = ProcessAdapter::spawn(&request, on_data, on_exit);
        assert!(matches!(result, Err(AdapterError::Spawn(_))));
    }

    #[test]
    #[cfg(unix)]
    fn pty_adapter_allocates_terminal() {
        let (on_data, on_exit, data, exit) = collecting_sinks();
        let request = SpawnRequest {
            command: "tty >/dev/null && echo is-a-tty; stty size".to_string(),
            use_pty: true,
            ..SpawnRequest::default()
        };
        let adapter = ProcessAdapter::spawn(&request, on_data, on_exit).expect("spawn");
        assert_eq!(adapter.kind(), AdapterKind::Pty);

        let (code, _) = wait_for_exit(&exit, Duration::from_secs(10));
        assert_eq!(code, Some(0));
        let captured = data.lock().unwrap().clone();
        let text = String::from_utf8_lossy(&captured).to_string();
        assert!(text.contains("is-a-tty"), "unexpected output: {text:?}");
        assert!(text.contains("30 120"), "unexpected geometry: {text:?}");
    }
}
