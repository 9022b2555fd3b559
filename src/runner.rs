use async_trait::async_trait;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::logs::LogSink;

/// Exit code reported when the process could not be spawned, was cancelled
/// or timed out.
pub const SYNTHETIC_EXIT_CODE: i32 = -1;

/// Upper bound on teardown after the process tree has been killed.
const KILL_WAIT: Duration = Duration::from_secs(3);

/// How long output is still read after the direct child has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.cancelled && !self.timed_out
    }

    fn spawn_failure(err: &std::io::Error) -> Self {
        Self {
            exit_code: SYNTHETIC_EXIT_CODE,
            stderr: err.to_string(),
            ..Self::default()
        }
    }

    /// Best short explanation of a failed run, for status messages.
    pub fn error_text(&self) -> String {
        if self.cancelled {
            return "cancelled".to_string();
        }
        if self.timed_out {
            return "timed out".to_string();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.lines().last().unwrap_or(stderr).trim().to_string();
        }
        match self.stdout.lines().rev().find(|l| !l.trim().is_empty()) {
            Some(line) => line.trim().to_string(),
            None => format!("exit code {}", self.exit_code),
        }
    }
}

/// Splits a byte stream into lines on `\n` and on `\r`, so progress bars that
/// redraw in place still produce one line per update.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, bytes: &[u8], mut emit: impl FnMut(String)) {
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                self.flush(&mut emit);
            } else {
                self.pending.push(b);
            }
        }
    }

    pub fn finish(&mut self, mut emit: impl FnMut(String)) {
        self.flush(&mut emit);
    }

    fn flush(&mut self, emit: &mut impl FnMut(String)) {
        if self.pending.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        emit(line);
    }
}

/// Seam between the supervisor and the external CLI.
#[async_trait]
pub trait CliRunner: Send + Sync {
    async fn run(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CommandOutput;

    /// Like `run`, but hands every output line to `on_line` as soon as it arrives.
    async fn run_streaming(
        &self,
        args: &[&str],
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CommandOutput;
}

pub struct CommandRunner {
    program: String,
    sink: Option<Arc<LogSink>>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn label(&self, args: &[&str]) -> String {
        if args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, args.join(" "))
        }
    }

    fn build_command(&self, args: &[&str]) -> Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so cancellation can take the whole tree down.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        let mut cmd = Command::from(cmd);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Spawn without waiting. The returned handle owns the process tree.
    pub fn spawn(&self, args: &[&str]) -> std::io::Result<RunningCommand> {
        let label = self.label(args);
        let child = self.build_command(args).spawn()?;
        log::debug!("[runner] spawned {} (pid {:?})", label, child.id());
        Ok(RunningCommand {
            child,
            label,
            sink: self.sink.clone(),
        })
    }

    fn record_spawn_failure(&self, args: &[&str], err: &std::io::Error) -> CommandOutput {
        let label = self.label(args);
        log::warn!("[runner] failed to start {}: {}", label, err);
        if let Some(sink) = &self.sink {
            sink.warn(&format!("[runner] failed to start {}: {}", label, err));
        }
        CommandOutput::spawn_failure(err)
    }
}

#[async_trait]
impl CliRunner for CommandRunner {
    async fn run(
        &self,
        args: &[&str],
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CommandOutput {
        let mut ignore = |_: &str| {};
        self.run_streaming(args, &mut ignore, timeout, cancel).await
    }

    async fn run_streaming(
        &self,
        args: &[&str],
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CommandOutput {
        match self.spawn(args) {
            Ok(running) => running.finish(on_line, timeout, cancel).await,
            Err(e) => self.record_spawn_failure(args, &e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    TimedOut,
}

/// A spawned CLI invocation. Dropping it kills the direct child.
pub struct RunningCommand {
    child: Child,
    label: String,
    sink: Option<Arc<LogSink>>,
}

impl RunningCommand {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Pump stdout line by line until the process exits, `cancel` fires or
    /// `timeout` elapses. Cancellation is checked between every read.
    ///
    /// Output still open after the direct child exited (a daemon it forked
    /// keeps the pipe) is drained for `DRAIN_GRACE` and then abandoned; the
    /// process group is only killed on cancellation or timeout.
    pub async fn finish(
        mut self,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CommandOutput {
        let pid = self.child.id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut stdout = self.child.stdout.take();
        let stderr_buf: Arc<Mutex<Vec<u8>>> = Arc::default();
        let mut stderr_task = self.child.stderr.take().map(|mut pipe| {
            let buf = stderr_buf.clone();
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match pipe.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.lock().unwrap_or_else(|p| p.into_inner()).extend_from_slice(&chunk[..n]),
                    }
                }
            })
        });

        let mut collected = String::new();
        let mut splitter = LineSplitter::default();
        let mut interrupt = None;
        let mut exited = false;
        let mut status = None;
        let mut drain_until: Option<Instant> = None;
        let mut buf = vec![0u8; 8192];
        let mut emit = |line: String| {
            on_line(&line);
            collected.push_str(&line);
            collected.push('\n');
        };

        while !(exited && stdout.is_none()) {
            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !exited => {
                    interrupt = Some(Interrupt::Cancelled);
                    break;
                }
                _ = deadline_elapsed(deadline), if !exited => {
                    interrupt = Some(Interrupt::TimedOut);
                    break;
                }
                _ = deadline_elapsed(drain_until), if drain_until.is_some() => {
                    log::debug!("[runner] {} exited but its output is still open; not waiting for it", self.label);
                    break;
                }
                r = read_some(stdout.as_mut(), &mut buf), if stdout.is_some() => match r {
                    Ok(0) => stdout = None,
                    Ok(n) => splitter.push(&buf[..n], &mut emit),
                    Err(e) => {
                        log::warn!("[runner] stdout read failed for {}: {}", self.label, e);
                        stdout = None;
                    }
                },
                s = self.child.wait(), if !exited => {
                    exited = true;
                    match s {
                        Ok(s) => status = Some(s),
                        Err(e) => log::warn!("[runner] wait failed for {}: {}", self.label, e),
                    }
                    drain_until = Some(Instant::now() + DRAIN_GRACE);
                }
            }
        }
        splitter.finish(&mut emit);
        drop(stdout);

        if interrupt.is_some() {
            kill_tree(pid, &mut self.child);
            match tokio::time::timeout(KILL_WAIT, self.child.wait()).await {
                Ok(_) => {}
                Err(_) => log::warn!("[runner] {} did not exit within {:?} after kill", self.label, KILL_WAIT),
            }
        }

        if let Some(task) = stderr_task.as_mut() {
            let limit = if interrupt.is_some() { KILL_WAIT } else { DRAIN_GRACE };
            if tokio::time::timeout(limit, &mut *task).await.is_err() {
                task.abort();
            }
        }
        let stderr = String::from_utf8_lossy(&stderr_buf.lock().unwrap_or_else(|p| p.into_inner())).into_owned();

        let exit_code = match (interrupt, status) {
            (None, Some(s)) => s.code().unwrap_or(SYNTHETIC_EXIT_CODE),
            _ => SYNTHETIC_EXIT_CODE,
        };

        let outcome = match interrupt {
            Some(Interrupt::Cancelled) => "cancelled".to_string(),
            Some(Interrupt::TimedOut) => "timed out".to_string(),
            None => format!("exit {}", exit_code),
        };
        log::info!("[runner] {} -> {}", self.label, outcome);
        if let Some(sink) = &self.sink {
            sink.info(&format!("[runner] {} -> {}", self.label, outcome));
        }

        CommandOutput {
            exit_code,
            stdout: collected,
            stderr,
            cancelled: interrupt == Some(Interrupt::Cancelled),
            timed_out: interrupt == Some(Interrupt::TimedOut),
        }
    }
}

async fn read_some(pipe: Option<&mut ChildStdout>, buf: &mut [u8]) -> std::io::Result<usize> {
    match pipe {
        Some(p) => p.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// Kill the child and everything it spawned.
fn kill_tree(pid: Option<u32>, child: &mut Child) {
    if let Some(pid) = pid {
        #[cfg(unix)]
        {
            // The child leads its own process group (see build_command).
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            let _ = std::process::Command::new("taskkill")
                .args(["/F", "/T", "/PID", &pid.to_string()])
                .creation_flags(CREATE_NO_WINDOW)
                .output();
        }
    }
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── line splitting ──

    #[test]
    fn test_splitter_handles_cr_and_lf() {
        let mut splitter = LineSplitter::default();
        let mut lines = vec![];
        splitter.push(b"Downloading 10%\rDownloading 55%\r\nDo", |l| lines.push(l));
        splitter.push(b"ne\n", |l| lines.push(l));
        splitter.push(b"tail", |l| lines.push(l));
        splitter.finish(|l| lines.push(l));
        assert_eq!(lines, vec!["Downloading 10%", "Downloading 55%", "Done", "tail"]);
    }

    #[test]
    fn test_splitter_lossy_utf8() {
        let mut splitter = LineSplitter::default();
        let mut lines = vec![];
        splitter.push(&[b'o', b'k', 0xff, b'\n'], |l| lines.push(l));
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok"));
    }

    #[test]
    fn test_error_text_prefers_stderr() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "line one\nline two\n".into(),
            stderr: "warning\nfatal: model not found\n".into(),
            ..CommandOutput::default()
        };
        assert_eq!(out.error_text(), "fatal: model not found");

        let out = CommandOutput {
            exit_code: 2,
            stdout: "line one\nline two\n\n".into(),
            ..CommandOutput::default()
        };
        assert_eq!(out.error_text(), "line two");

        let out = CommandOutput { exit_code: 3, ..CommandOutput::default() };
        assert_eq!(out.error_text(), "exit code 3");
    }

    // ── process execution ──

    #[tokio::test]
    async fn test_missing_program_is_synthetic_failure() {
        let runner = CommandRunner::new("inferdesk-no-such-program-4f1c");
        let out = runner.run(&["service", "status"], None, &CancellationToken::new()).await;
        assert_eq!(out.exit_code, SYNTHETIC_EXIT_CODE);
        assert!(!out.stderr.is_empty());
        assert!(!out.success());
        assert!(!out.cancelled);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout_stderr_and_exit_code() {
        let runner = CommandRunner::new("sh");
        let out = runner
            .run(&["-c", "echo hello; echo oops >&2; exit 3"], None, &CancellationToken::new())
            .await;
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_streaming_delivers_each_line() {
        let runner = CommandRunner::new("sh");
        let mut seen = vec![];
        let mut on_line = |l: &str| seen.push(l.to_string());
        let out = runner
            .run_streaming(&["-c", "printf 'a\\rb\\nc'"], &mut on_line, None, &CancellationToken::new())
            .await;
        assert!(out.success());
        assert_eq!(seen, vec!["a", "b", "c"]);
        assert_eq!(out.stdout, "a\nb\nc\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_returns_promptly() {
        let runner = CommandRunner::new("sh");
        let started = std::time::Instant::now();
        let out = runner
            .run(&["-c", "sleep 20"], Some(Duration::from_millis(200)), &CancellationToken::new())
            .await;
        assert!(out.timed_out);
        assert_eq!(out.exit_code, SYNTHETIC_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_cli_with_forked_daemon_is_not_killed() {
        let runner = CommandRunner::new("sh");
        let script = "sleep 30 & echo $!; echo 'Service is Started on http://127.0.0.1:5273/'; exit 0";
        let started = std::time::Instant::now();
        let out = runner
            .run(&["-c", script], Some(Duration::from_secs(10)), &CancellationToken::new())
            .await;
        assert!(started.elapsed() < Duration::from_secs(3), "waited on the daemon's pipe");
        assert!(out.success());
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("Service is Started on http://127.0.0.1:5273/"));

        let daemon: i32 = out.stdout.lines().next().unwrap().trim().parse().unwrap();
        let alive = unsafe { libc::kill(daemon, 0) } == 0;
        unsafe {
            libc::kill(daemon, libc::SIGKILL);
        }
        assert!(alive, "forked daemon was killed after a normal exit");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_streaming_without_timeout_returns_when_child_exits() {
        let runner = CommandRunner::new("sh");
        let mut seen = vec![];
        let mut on_line = |l: &str| seen.push(l.to_string());
        let out = tokio::time::timeout(
            Duration::from_secs(5),
            runner.run_streaming(
                &["-c", "sleep 30 & echo $!; echo loaded; exit 0"],
                &mut on_line,
                None,
                &CancellationToken::new(),
            ),
        )
        .await
        .expect("returned after the child exited");
        assert!(out.success());
        assert_eq!(seen.last().map(String::as_str), Some("loaded"));
        if let Ok(daemon) = seen[0].trim().parse::<i32>() {
            unsafe {
                libc::kill(daemon, libc::SIGKILL);
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn process_alive(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Ok(stat) => {
                let state = stat
                    .rsplit_once(')')
                    .and_then(|(_, rest)| rest.trim_start().chars().next());
                !matches!(state, Some('Z') | Some('X') | None)
            }
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_cancel_kills_whole_process_tree() {
        let runner = CommandRunner::new("sh");
        let cancel = CancellationToken::new();
        let running = runner.spawn(&["-c", "sleep 30 & echo $!; sleep 30"]).unwrap();
        let pid = running.pid().unwrap();

        let grandchild = Arc::new(Mutex::new(None::<u32>));
        let seen = grandchild.clone();
        let trigger = cancel.clone();
        let mut on_line = move |line: &str| {
            if let Ok(p) = line.trim().parse::<u32>() {
                *seen.lock().unwrap() = Some(p);
                trigger.cancel();
            }
        };

        let started = std::time::Instant::now();
        let out = running.finish(&mut on_line, Some(Duration::from_secs(20)), &cancel).await;
        assert!(out.cancelled);
        assert!(started.elapsed() < Duration::from_secs(6));

        let grandchild = grandchild.lock().unwrap().expect("background pid printed");
        let mut gone = false;
        for _ in 0..30 {
            if !process_alive(pid) && !process_alive(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(gone, "process tree still running after cancel");
    }
}
