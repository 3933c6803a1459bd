// PTY 会话：在容器内挂一个交互 shell，独立读线程把输出推进通道。
use anyhow::{Context, Result};
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;
const OUTPUT_CHANNEL_SIZE: usize = 256;

/// One pseudo-terminal bound to a running container. At most one per
/// session; `alive` is true only while the shell process is up.
pub struct PtySession {
    session_id: String,
    alive: AtomicBool,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    reader_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl PtySession {
    /// Runs the engine-provided attach command under a fresh PTY pair and
    /// starts the reader thread. Returns the session plus the receiving
    /// end of the output channel; the caller owns the consumer side.
    pub fn spawn(
        session_id: &str,
        argv: &[String],
    ) -> Result<(Arc<Self>, mpsc::Receiver<String>)> {
        let (program, rest) = argv.split_first().context("empty shell command")?;
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("open pty")?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(rest);
        cmd.env("TERM", "xterm-256color");

        let child = pair.slave.spawn_command(cmd).context("spawn shell in container")?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("clone pty reader")?;
        let writer = pair.master.take_writer().context("take pty writer")?;

        let (output_tx, output_rx) = mpsc::channel::<String>(OUTPUT_CHANNEL_SIZE);

        let session = Arc::new(Self {
            session_id: session_id.to_string(),
            alive: AtomicBool::new(true),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            master: Mutex::new(Some(pair.master)),
            reader_thread: Mutex::new(None),
        });

        let reader_session = session.clone();
        let reader_id = session_id.to_string();
        let handle = std::thread::spawn(move || {
            let mut buffer = [0u8; 4096];
            loop {
                if !reader_session.alive.load(Ordering::SeqCst) {
                    break;
                }
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        // 非法字节替换而不是报错，终端输出允许半截序列。
                        let chunk = String::from_utf8_lossy(&buffer[..n]).to_string();
                        if output_tx.blocking_send(chunk).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            // A dead shell ends the loop silently; send_input starts
            // returning false once the flag flips.
            reader_session.alive.store(false, Ordering::SeqCst);
            debug!(session = %reader_id, "pty reader stopped");
        });
        *session.reader_thread.lock() = Some(handle);

        Ok((session, output_rx))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Writes raw bytes to the shell's stdin. Returns false once the
    /// session is closed or the underlying process has died.
    pub fn send_input(&self, bytes: &[u8]) -> bool {
        if !self.alive.load(Ordering::SeqCst) {
            return false;
        }
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return false;
        };
        if writer.write_all(bytes).is_err() || writer.flush().is_err() {
            self.alive.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// Idempotent teardown: flips the liveness flag, kills the shell, and
    /// releases the PTY pair. Killing the child unblocks the reader, so
    /// the thread exits within one read.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().take() {
            if let Err(err) = child.kill() {
                warn!(session = %self.session_id, "pty child kill failed: {err}");
            }
            let _ = child.wait();
        }
        self.writer.lock().take();
        self.master.lock().take();
        if let Some(handle) = self.reader_thread.lock().take() {
            // Join off the async scheduler; the reader is already
            // unblocked by the kill above.
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn_blocking(move || {
                        let _ = handle.join();
                    });
                }
                Err(_) => {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if self.alive.load(Ordering::SeqCst) {
            warn!(session = %self.session_id, "pty session dropped while alive");
            if let Some(mut child) = self.child.lock().take() {
                let _ = child.kill();
            }
        }
    }
}
