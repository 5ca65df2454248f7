//! PTY wrapper using portable-pty.
//!
//! Opens a pseudo-terminal running a given command and size. Output is read
//! on a dedicated thread and delivered as [`PtyEvent`]s in arrival order;
//! input is handed to a writer thread so `write` never blocks the caller.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use termrelay_core::{RelayError, RelayResult};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Read chunk size for PTY output.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Everything needed to start a process on a PTY.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    /// Extra environment, applied after the inherited environment and `TERM`.
    pub env: HashMap<String, String>,
}

/// Output and lifecycle events of a PTY process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of output. Never splits a UTF-8 sequence unless the process
    /// emitted invalid UTF-8.
    Data(Vec<u8>),
    /// The process exited. Sent exactly once, after the last `Data`.
    Exit { code: i32 },
}

/// A managed PTY instance.
pub struct PtyHandle {
    input_tx: std_mpsc::Sender<Vec<u8>>,
    /// Kept for resize operations (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_rx: watch::Receiver<Option<i32>>,
    pid: Option<u32>,
    cols: u16,
    rows: u16,
}

impl PtyHandle {
    /// Spawn a new PTY process.
    ///
    /// Fails with [`RelayError::Spawn`] if the working directory is not a
    /// directory or the program cannot be started.
    pub fn spawn(spec: &SpawnSpec) -> RelayResult<(Self, mpsc::UnboundedReceiver<PtyEvent>)> {
        if spec.program.trim().is_empty() {
            return Err(RelayError::Spawn("empty command".into()));
        }
        if !spec.cwd.is_dir() {
            return Err(RelayError::Spawn(format!(
                "working directory does not exist: {}",
                spec.cwd.display()
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(spec.cols, spec.rows))
            .map_err(|e| RelayError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| RelayError::Spawn(format!("failed to spawn {}: {e}", spec.program)))?;
        // The child holds its own copy; ours must go or reads never see EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let setup = (|| {
            let reader = pair
                .master
                .try_clone_reader()
                .map_err(|e| RelayError::Spawn(format!("failed to clone PTY reader: {e}")))?;
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| RelayError::Spawn(format!("failed to take PTY writer: {e}")))?;
            Ok::<_, RelayError>((reader, writer))
        })();
        let (reader, writer) = match setup {
            Ok(rw) => rw,
            Err(e) => {
                let _ = killer.kill();
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();

        let spawned = std::thread::Builder::new()
            .name("pty-reader".to_owned())
            .spawn(move || read_loop(reader, child, events_tx, exit_tx))
            .and_then(|_| {
                std::thread::Builder::new()
                    .name("pty-writer".to_owned())
                    .spawn(move || write_loop(writer, input_rx))
            });
        if let Err(e) = spawned {
            let _ = killer.kill();
            return Err(RelayError::Spawn(format!("failed to start PTY threads: {e}")));
        }

        info!(
            program = %spec.program,
            cwd = %spec.cwd.display(),
            pid = ?pid,
            cols = spec.cols,
            rows = spec.rows,
            "PTY spawned"
        );

        Ok((
            Self {
                input_tx,
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                exit_rx,
                pid,
                cols: spec.cols,
                rows: spec.rows,
            },
            events_rx,
        ))
    }

    /// [`PtyHandle::spawn`] on the blocking pool: opening the PTY and forking
    /// must not stall a runtime worker.
    pub async fn spawn_async(
        spec: SpawnSpec,
    ) -> RelayResult<(Self, mpsc::UnboundedReceiver<PtyEvent>)> {
        tokio::task::spawn_blocking(move || Self::spawn(&spec))
            .await
            .map_err(|e| RelayError::Spawn(format!("spawn task failed: {e}")))?
    }

    /// Queue bytes for the PTY input. Fire-and-forget: no backpressure is
    /// reported, only whether the process can still accept input.
    pub fn write(&self, data: &[u8]) -> RelayResult<()> {
        if self.has_exited() {
            return Err(RelayError::Other("process has exited".into()));
        }
        self.input_tx
            .send(data.to_vec())
            .map_err(|_| RelayError::Other("PTY writer closed".into()))
    }

    /// Resize the PTY.
    pub fn resize(&mut self, cols: u16, rows: u16) -> RelayResult<()> {
        if self.has_exited() {
            return Err(RelayError::Other("process has exited".into()));
        }
        let master = self
            .master
            .lock()
            .map_err(|_| RelayError::Other("PTY master lock poisoned".into()))?;
        master
            .resize(pty_size(cols, rows))
            .map_err(|e| RelayError::Other(format!("PTY resize failed: {e}")))?;
        drop(master);
        self.cols = cols;
        self.rows = rows;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }

    /// Kill the child process and its process group with `SIGKILL`. A no-op
    /// if it already exited.
    pub fn kill(&self) -> RelayResult<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.force_kill()?;
        info!(pid = ?self.pid, "PTY process killed");
        Ok(())
    }

    /// The child leads its own session (portable-pty calls `setsid`), so its
    /// process group also holds the foreground commands it started.
    #[cfg(unix)]
    fn force_kill(&self) -> RelayResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return self.kill_with_killer();
        };
        let pid = Pid::from_raw(pid);
        match killpg(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => debug!(pid = %pid, error = %e, "SIGKILL to process group failed"),
        }
        match kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(RelayError::Other(format!("SIGKILL to {pid} failed: {e}"))),
        }
    }

    #[cfg(not(unix))]
    fn force_kill(&self) -> RelayResult<()> {
        self.kill_with_killer()
    }

    fn kill_with_killer(&self) -> RelayResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| RelayError::Other("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| RelayError::Other(format!("kill failed: {e}")))
    }

    /// Wait until the child process has exited. Returns the exit code.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        let code = match rx.wait_for(Option::is_some).await {
            Ok(code) => (*code).unwrap_or(-1),
            // Reader thread gone without reporting.
            Err(_) => -1,
        };
        code
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// OS process id of the child, if the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current terminal size.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if !self.has_exited() {
            if let Err(e) = self.kill() {
                debug!(pid = ?self.pid, error = %e, "failed to kill PTY on drop");
            }
        }
    }
}

fn pty_size(cols: u16, rows: u16) -> PtySize {
    PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    events_tx: mpsc::UnboundedSender<PtyEvent>,
    exit_tx: watch::Sender<Option<i32>>,
) {
    let mut buf = [0u8; READ_CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let cut = utf8_boundary(&pending);
                if cut > 0 {
                    let chunk: Vec<u8> = pending.drain(..cut).collect();
                    // Keep draining even if nobody listens any more.
                    let _ = events_tx.send(PtyEvent::Data(chunk));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            // EIO once the slave side is gone (Linux).
            Err(e) => {
                debug!(error = %e, "PTY read ended");
                break;
            }
        }
    }
    if !pending.is_empty() {
        let _ = events_tx.send(PtyEvent::Data(pending));
    }

    let code = match child.wait() {
        Ok(status) => i32::try_from(status.exit_code()).unwrap_or(-1),
        Err(e) => {
            warn!(error = %e, "failed to reap PTY child");
            -1
        }
    };
    info!(code, "PTY child exited");
    let _ = exit_tx.send(Some(code));
    let _ = events_tx.send(PtyEvent::Exit { code });
}

fn write_loop(mut writer: Box<dyn Write + Send>, input_rx: std_mpsc::Receiver<Vec<u8>>) {
    while let Ok(data) = input_rx.recv() {
        if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
            debug!(error = %e, "PTY write failed, stopping writer");
            break;
        }
    }
}

/// Length of the prefix of `bytes` that does not end in an incomplete UTF-8
/// sequence. Invalid bytes count as complete.
fn utf8_boundary(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in (len.saturating_sub(4)..len).rev() {
        let b = bytes[i];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let needed = match b {
            b if b & 0x80 == 0 => 1,
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => 1,
        };
        return if i + needed > len { i } else { len };
    }
    len
}
