//! One pseudo-terminal pair driving one interactive shell.
//!
//! The master side is non-blocking and registered with the tokio reactor. A
//! pump task drains it continuously into a bounded channel, so output the
//! shell produces between requests is kept rather than lost, and readers
//! take it off the channel in production order.

use crate::error::{Error, Result};
use crate::process;
use nix::pty::{openpty, Winsize};
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 4096;

/// Chunks buffered between the pump and the readers.
const OUTPUT_CHANNEL_CAPACITY: usize = 1024;

/// A write blocked this long on a full terminal input queue fails.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Time allowed for a killed shell to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);

type Master = Arc<AsyncFd<File>>;

pub struct PtySession {
    id: String,
    env_id: String,
    pid: Option<u32>,
    master: StdRwLock<Option<Master>>,
    write_order: Mutex<()>,
    output: Mutex<mpsc::Receiver<Vec<u8>>>,
    child: Mutex<Child>,
    pump: StdMutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
    closed: AtomicBool,
    last_active: StdMutex<Instant>,
}

impl PtySession {
    /// Allocate a pty pair and start `argv` on its slave side as a session
    /// leader with the slave as controlling terminal.
    pub fn spawn(id: String, env_id: String, argv: &[String], cwd: &Path) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty shell command".to_string()))?;

        let winsize = Winsize {
            ws_row: 24,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None).map_err(std::io::Error::from)?;
        configure_master(&pty.master)?;

        let child = {
            let slave = pty.slave;
            let mut command = Command::new(program);
            command
                .args(args)
                .current_dir(cwd)
                .env("TERM", "xterm-256color")
                .env("PWD", cwd)
                .stdin(Stdio::from(slave.try_clone()?))
                .stdout(Stdio::from(slave.try_clone()?))
                .stderr(Stdio::from(slave))
                .kill_on_drop(true);
            // SAFETY: only async-signal-safe libc calls run between fork and exec.
            unsafe {
                command.pre_exec(|| {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
            command.spawn()?
            // `command` drops here, closing the parent's copies of the slave.
        };
        let pid = child.id();

        let master: Master = Arc::new(AsyncFd::new(File::from(pty.master))?);
        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump_output(id.clone(), master.clone(), tx, alive.clone()));

        info!(session_id = %id, env_id = %env_id, pid = ?pid, cwd = ?cwd, "Opened terminal session");
        Ok(Self {
            id,
            env_id,
            pid,
            master: StdRwLock::new(Some(master)),
            write_order: Mutex::new(()),
            output: Mutex::new(rx),
            child: Mutex::new(child),
            pump: StdMutex::new(Some(pump)),
            alive,
            closed: AtomicBool::new(false),
            last_active: StdMutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// False once closed or once the shell side of the terminal has gone away.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.alive.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .elapsed()
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|p| p.into_inner()) = Instant::now();
    }

    fn master(&self) -> Result<Master> {
        self.master
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| Error::not_found("session", self.id.clone()))
    }

    /// Write `line` and a newline to the terminal input.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut data = Vec::with_capacity(line.len() + 1);
        data.extend_from_slice(line.as_bytes());
        data.push(b'\n');
        self.write_all(&data).await
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(Error::not_found("session", self.id.clone()));
        }
        let master = self.master()?;
        // Holding the lock across the whole write keeps inputs in arrival order.
        let _order = self.write_order.lock().await;
        self.touch();
        tokio::time::timeout(WRITE_DEADLINE, write_to(&master, data))
            .await
            .map_err(|_| Error::Timeout(WRITE_DEADLINE))?
    }

    /// Take everything buffered so far.
    pub async fn drain(&self) -> String {
        let mut rx = self.output.lock().await;
        let mut bytes = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            bytes.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Wait for the next chunk of output; `None` once the terminal is gone
    /// and everything buffered has been read.
    pub async fn next_chunk(&self) -> Option<Vec<u8>> {
        let mut rx = self.output.lock().await;
        rx.recv().await
    }

    /// Kill the shell, stop the pump and release the pty. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.alive.store(false, Ordering::SeqCst);

        let pump = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(pump) = pump {
            pump.abort();
        }
        process::kill_group(self.pid);

        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(session_id = %self.id, error = %e, "Shell already exited");
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => debug!(session_id = %self.id, ?status, "Shell reaped"),
            Ok(Err(e)) => warn!(session_id = %self.id, error = %e, "Failed to reap shell"),
            Err(_) => error!(
                session_id = %self.id,
                pid = ?self.pid,
                "Shell survived SIGKILL past the grace period"
            ),
        }

        self.master
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        info!(session_id = %self.id, env_id = %self.env_id, "Closed terminal session");
    }
}

fn configure_master(master: &OwnedFd) -> Result<()> {
    let fd = master.as_raw_fd();
    // SAFETY: plain fcntl calls on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags == -1 || libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
    }
    Ok(())
}

async fn write_to(master: &AsyncFd<File>, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let mut guard = master.writable().await?;
        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.write(&data[written..])
        }) {
            Ok(Ok(n)) => written += n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => return Err(e.into()),
            Err(_would_block) => continue,
        }
    }
    Ok(())
}

async fn pump_output(
    session_id: String,
    master: Master,
    tx: mpsc::Sender<Vec<u8>>,
    alive: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Terminal poll failed");
                break;
            }
        };
        match guard.try_io(|inner| {
            let mut file: &File = inner.get_ref();
            file.read(&mut buf)
        }) {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Ok(Err(e)) => {
                // EIO: every slave descriptor is closed, the shell is gone.
                debug!(session_id = %session_id, error = %e, "Terminal closed");
                break;
            }
            Err(_would_block) => continue,
        }
    }
    alive.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::tests::wait_until_gone;

    fn shell(dir: &Path) -> PtySession {
        PtySession::spawn("s-1".into(), "env-1".into(), &["sh".to_string()], dir).unwrap()
    }

    /// Collect output until it contains `needle` or the deadline passes.
    async fn read_until(session: &PtySession, needle: &str) -> String {
        let mut seen = String::new();
        for _ in 0..50 {
            seen.push_str(&session.drain().await);
            if seen.contains(needle) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        seen
    }

    #[tokio::test]
    async fn shell_runs_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker-file"), "").unwrap();
        let session = shell(dir.path());
        session.send_line("ls; echo done-$((40+2))").await.unwrap();
        let output = read_until(&session, "done-42").await;
        assert!(output.contains("marker-file"), "output: {output}");
        session.close().await;
    }

    #[tokio::test]
    async fn output_produced_between_reads_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let session = shell(dir.path());
        session.send_line("sleep 0.3; echo late-$((1+1))").await.unwrap();
        tokio::time::sleep(Duration::from_millis(800)).await;
        let output = read_until(&session, "late-2").await;
        assert!(output.contains("late-2"), "output: {output}");
        session.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_kills_the_shell() {
        let dir = tempfile::tempdir().unwrap();
        let session = shell(dir.path());
        let pid = session.pid().unwrap() as i32;
        assert!(session.is_alive());

        session.close().await;
        session.close().await;

        assert!(!session.is_alive());
        assert!(wait_until_gone(pid).await);
        assert!(session.send_line("echo hi").await.is_err());
    }

    #[tokio::test]
    async fn shell_exit_marks_session_dead() {
        let dir = tempfile::tempdir().unwrap();
        let session = shell(dir.path());
        session.send_line("exit").await.unwrap();
        for _ in 0..50 {
            if !session.is_alive() {
                break;
            }
            // Keep the channel from filling while we wait.
            session.drain().await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!session.is_alive());
        session.close().await;
    }
}
