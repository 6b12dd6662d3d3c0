//! External command execution with captured output and hard timeouts.
//!
//! Every process this crate starts goes through [`Cmd`]. Output is drained on
//! background threads so a chatty child can never fill a pipe and stall.
//! Each child leads its own process group, and the deadline covers both the
//! child and the pipes it shares with its descendants: on expiry the whole
//! group is killed and the child reaped before [`RuntimeError::Timeout`] is
//! returned. Nothing is retried.

use crate::RuntimeError;
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Default deadline for commands that do not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Stderr kept in error values is capped to this many bytes.
const STDERR_CAP: usize = 4096;

/// PATH used for processes started inside a chroot.
const CHROOT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or -1 if the process was terminated by a signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Builder for one external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Duration,
    chroot: Option<PathBuf>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            current_dir: None,
            envs: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            chroot: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the program with `root` as its filesystem root and `/` as its
    /// working directory. The program path is resolved inside `root`.
    pub fn chroot(mut self, root: &Path) -> Self {
        self.chroot = Some(root.to_path_buf());
        self
    }

    /// Do not turn a non-zero exit into [`RuntimeError::CommandFailed`].
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Command line for log output.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(&a.to_string_lossy());
        }
        s
    }

    pub fn run(self) -> Result<CommandOutput, RuntimeError> {
        debug!("exec: {}", self.display());

        let mut cmd = Command::new(&self.program);
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(ref root) = self.chroot {
            cmd.env("PATH", CHROOT_PATH);
            enter_root_before_exec(&mut cmd, root)?;
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied if self.chroot.is_some() => {
                RuntimeError::PermissionDenied(format!("chroot for '{}': {e}", self.program))
            }
            _ => RuntimeError::Spawn {
                program: self.program.clone(),
                source: e,
            },
        })?;

        let deadline = Instant::now() + self.timeout;
        let group = ProcessGroup::of(&child);
        let (tx, rx) = mpsc::channel();
        let mut readers = 0;
        readers += drain(child.stdout.take(), Stream::Stdout, &tx);
        readers += drain(child.stderr.take(), Stream::Stderr, &tx);
        drop(tx);

        let status = wait_deadline(&mut child, &group, deadline)?;
        // A descendant may outlive the child while still holding its pipes.
        let collected = status.and_then(|status| {
            let streams = collect(&rx, readers, deadline);
            if streams.is_none() {
                debug!("{}: pipes still open at the deadline", self.program);
                group.kill();
            }
            streams.map(|(stdout, stderr)| (status, stdout, stderr))
        });
        let Some((status, stdout, stderr)) = collected else {
            // Detached readers finish once every holder of the pipe is gone.
            return Err(RuntimeError::Timeout {
                program: self.program,
                after: self.timeout,
            });
        };

        let output = CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        };
        trace!(
            "{} exited with {}: {} bytes stdout",
            self.program,
            output.code(),
            output.stdout.len()
        );

        if !self.allow_fail && !output.success() {
            let mut stderr = output.stderr.trim().to_owned();
            truncate_at_char(&mut stderr, STDERR_CAP);
            return Err(RuntimeError::CommandFailed {
                program: self.program,
                code: output.code(),
                stderr,
            });
        }
        Ok(output)
    }
}

#[allow(unsafe_code)]
fn enter_root_before_exec(cmd: &mut Command, root: &Path) -> Result<(), RuntimeError> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;
    use std::os::unix::process::CommandExt;

    let c_root = CString::new(root.as_os_str().as_bytes()).map_err(|_| {
        RuntimeError::InvalidLayer(format!("root path contains NUL: {}", root.display()))
    })?;
    let c_slash = CString::new("/").map_err(|_| {
        RuntimeError::InvalidLayer("root path contains NUL".to_owned())
    })?;

    // SAFETY: the hook runs between fork and exec. It only calls chroot(2)
    // and chdir(2), both async-signal-safe, on C strings allocated before
    // the fork, and reads errno through last_os_error.
    unsafe {
        cmd.pre_exec(move || {
            if libc::chroot(c_root.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::chdir(c_slash.as_ptr()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    Ok(())
}

/// The process group a spawned child leads.
struct ProcessGroup(Option<libc::pid_t>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(libc::pid_t::try_from(child.id()).ok().filter(|pid| *pid > 0))
    }

    /// SIGKILL every process still in the group.
    #[allow(unsafe_code)]
    fn kill(&self) {
        let Some(pgid) = self.0 else { return };
        // SAFETY: kill(2) takes plain integers and touches no memory. The
        // negative pid addresses the group the child was spawned into.
        let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
        if rc != 0 {
            trace!("kill(-{pgid}): {}", std::io::Error::last_os_error());
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Read `pipe` to its end on a detached thread. Returns the number of
/// readers started.
fn drain<R: Read + Send + 'static>(
    pipe: Option<R>,
    stream: Stream,
    tx: &Sender<(Stream, Vec<u8>)>,
) -> usize {
    let Some(mut r) = pipe else { return 0 };
    let tx = tx.clone();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = r.read_to_end(&mut buf);
        let _ = tx.send((stream, buf));
    });
    1
}

/// Gather what the readers captured, or `None` if any pipe is still open
/// at `deadline`.
fn collect(
    rx: &Receiver<(Stream, Vec<u8>)>,
    readers: usize,
    deadline: Instant,
) -> Option<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for _ in 0..readers {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok((Stream::Stdout, buf)) => stdout = buf,
            Ok((Stream::Stderr, buf)) => stderr = buf,
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Some((stdout, stderr))
}

/// Wait for `child` until `deadline`. On expiry its whole group is killed,
/// the child reaped, and `None` returned.
fn wait_deadline(
    child: &mut Child,
    group: &ProcessGroup,
    deadline: Instant,
) -> Result<Option<ExitStatus>, RuntimeError> {
    let mut poll = Duration::from_millis(5);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            group.kill();
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(poll);
        poll = (poll * 2).min(Duration::from_millis(100));
    }
}

fn truncate_at_char(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Locate `program` on `PATH`, returning the first executable match.
pub fn which(program: &str) -> Option<PathBuf> {
    ::which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_stderr() {
        let out = Cmd::new("sh")
            .args(["-c", "echo out; echo err >&2"])
            .run()
            .unwrap();
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert_eq!(out.code(), 0);
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let err = Cmd::new("sh")
            .args(["-c", "echo boom >&2; exit 3"])
            .run()
            .unwrap_err();
        match err {
            RuntimeError::CommandFailed {
                program,
                code,
                stderr,
            } => {
                assert_eq!(program, "sh");
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn allow_fail_returns_output() {
        let out = Cmd::new("sh")
            .args(["-c", "exit 7"])
            .allow_fail()
            .run()
            .unwrap();
        assert_eq!(out.code(), 7);
        assert!(!out.success());
    }

    #[test]
    fn timeout_kills_the_child() {
        let start = Instant::now();
        let err = Cmd::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200))
            .run()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_covers_background_children_holding_the_pipes() {
        let start = Instant::now();
        let err = Cmd::new("sh")
            .args(["-c", "sleep 8 & echo started"])
            .timeout(Duration::from_secs(1))
            .run()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }), "{err}");
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn timeout_kills_the_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pidfile = dir.path().join("pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pidfile.display());
        let err = Cmd::new("sh")
            .args(["-c", &script])
            .timeout(Duration::from_millis(500))
            .run()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }));

        let pid = std::fs::read_to_string(&pidfile).unwrap();
        let stat = PathBuf::from(format!("/proc/{}/stat", pid.trim()));
        // Missing, or a zombie nobody has reaped yet.
        let gone = |p: &Path| match std::fs::read_to_string(p) {
            Ok(s) => s
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
            Err(_) => true,
        };
        let until = Instant::now() + Duration::from_secs(3);
        while !gone(&stat) && Instant::now() < until {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(gone(&stat), "background sleep survived the timeout");
    }

    #[test]
    fn exited_child_output_is_kept_when_descendants_close_their_pipes() {
        let out = Cmd::new("sh")
            .args(["-c", "sleep 8 >/dev/null 2>&1 & echo done"])
            .timeout(Duration::from_secs(5))
            .run()
            .unwrap();
        assert_eq!(out.stdout, "done\n");
    }

    #[test]
    fn large_output_does_not_deadlock() {
        let out = Cmd::new("sh")
            .args(["-c", "head -c 1048576 /dev/zero | tr '\\0' 'a'"])
            .timeout(Duration::from_secs(30))
            .run()
            .unwrap();
        assert_eq!(out.stdout.len(), 1_048_576);
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let err = Cmd::new("layerpack-definitely-not-installed")
            .run()
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Spawn { .. }));
    }

    #[test]
    fn runs_in_directory_with_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = Cmd::new("sh")
            .args(["-c", "pwd; echo $LAYERPACK_TEST"])
            .dir(dir.path())
            .env("LAYERPACK_TEST", "yes")
            .run()
            .unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        assert!(out.stdout.starts_with(canonical.to_str().unwrap()));
        assert!(out.stdout.ends_with("yes\n"));
    }

    #[test]
    fn which_finds_sh() {
        let sh = which("sh").unwrap();
        assert!(sh.is_absolute());
        assert!(which("layerpack-definitely-not-installed").is_none());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let mut s = "aé".repeat(10);
        truncate_at_char(&mut s, 4);
        assert_eq!(s, "aéa");
    }
}
