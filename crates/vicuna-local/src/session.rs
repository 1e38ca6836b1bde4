//! Process manager for the interactive inference executable.

use std::ffi::OsString;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::collector::{collect_response, OutputEvent, ResponseCollector, ResponseTerminator};
use crate::config::SessionConfig;
use crate::error::{Result, VicunaError};

/// Flags placed before `--model`: interactive instruct mode, greedy sampling
/// and unlimited generation.
pub const FIXED_ARGS: [&str; 16] = [
    "-i",
    "--interactive-first",
    "-r",
    "### Human:",
    "-t",
    "8",
    "--temp",
    "0",
    "-c",
    "2048",
    "-n",
    "-1",
    "--ignore-eos",
    "--repeat_penalty",
    "1.2",
    "--instruct",
];

const READ_BUFFER_SIZE: usize = 4096;

/// Time allowed between SIGTERM and a forced kill.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle state of a [`ProcessSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Starting,
    Ready,
    Busy,
}

/// Build the argument vector passed to the executable.
pub fn build_args(config: &SessionConfig) -> Vec<OsString> {
    let mut args: Vec<OsString> = FIXED_ARGS.iter().map(OsString::from).collect();
    args.push("--model".into());
    args.push(config.model_path().into());

    for (key, value) in config.decoder_options() {
        args.push(format!("--{}", key).into());
        args.push(value.to_string().into());
    }

    args
}

/// A running child and the pipes the session owns.
struct ProcessHandle {
    child: Child,
    stdin: ChildStdin,
    events: mpsc::UnboundedReceiver<OutputEvent>,
    output_closed: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

impl ProcessHandle {
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Set once the pump has seen EOF or a read error on stdout.
    fn output_closed(&self) -> bool {
        self.output_closed.load(Ordering::SeqCst)
    }

    /// Discard output produced between prompts.
    fn drain_stray_output(&mut self) -> Result<()> {
        loop {
            match self.events.try_recv() {
                Ok(OutputEvent::Chunk(text)) => trace!("discarding stray output: {:?}", text),
                Ok(OutputEvent::Failed(e)) => return Err(VicunaError::Io(e)),
                Ok(OutputEvent::Closed) | Err(TryRecvError::Disconnected) => {
                    return Err(VicunaError::ProcessExited)
                }
                Err(TryRecvError::Empty) => return Ok(()),
            }
        }
    }

    async fn write_prompt(&mut self, prompt: &str) -> Result<()> {
        let mut line = String::with_capacity(prompt.len() + 1);
        line.push_str(prompt);
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    /// Terminate the child, gracefully where the platform allows it.
    async fn terminate(self) {
        let ProcessHandle {
            mut child,
            stdin,
            pump,
            ..
        } = self;
        drop(stdin);

        info!("Stopping inference process (PID: {:?})", child.id());

        #[cfg(unix)]
        {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }

            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("Inference process exited with status: {}", status),
                Ok(Err(e)) => {
                    warn!("Error waiting for inference process: {}", e);
                    let _ = child.kill().await;
                }
                Err(_) => {
                    warn!("Inference process didn't exit gracefully, killing...");
                    let _ = child.kill().await;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = child.kill().await {
                warn!("Error killing inference process: {}", e);
            }
        }

        pump.abort();
        let _ = pump.await;
    }
}

/// Read stdout until EOF, forwarding decoded chunks in arrival order.
///
/// When the output ends while the session is idle, the session is marked
/// Closed; a send or start in progress handles the exit itself.
async fn pump_output(
    mut stdout: ChildStdout,
    events: mpsc::UnboundedSender<OutputEvent>,
    output_closed: Arc<AtomicBool>,
    state: Arc<watch::Sender<SessionState>>,
) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut pending = Vec::new();

    let ended = loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                if !pending.is_empty() {
                    let tail = String::from_utf8_lossy(&pending).into_owned();
                    let _ = events.send(OutputEvent::Chunk(tail));
                }
                let _ = events.send(OutputEvent::Closed);
                break true;
            }
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = decode_utf8(&mut pending);
                if !text.is_empty() && events.send(OutputEvent::Chunk(text)).is_err() {
                    break false;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = events.send(OutputEvent::Failed(e));
                break true;
            }
        }
    };

    if ended {
        output_closed.store(true, Ordering::SeqCst);
        let marked = state.send_if_modified(|current| {
            let idle = *current == SessionState::Ready;
            if idle {
                *current = SessionState::Closed;
            }
            idle
        });
        if marked {
            debug!("Inference process output ended while idle");
        }
    }
}

/// Take the longest decodable prefix of `pending`.
///
/// An incomplete multi-byte sequence at the end stays in `pending` for the
/// next read; invalid bytes become U+FFFD.
fn decode_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();

    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

/// Consume output until the executable shows its prompt marker.
async fn wait_ready(
    events: &mut mpsc::UnboundedReceiver<OutputEvent>,
    closed: &mut watch::Receiver<u64>,
    terminator: &dyn ResponseTerminator,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            _ = closed.changed() => return Err(VicunaError::SessionClosed),

            event = events.recv() => match event {
                Some(OutputEvent::Chunk(text)) => {
                    trace!("startup output: {:?}", text);
                    if terminator.is_ready(&text) {
                        return Ok(());
                    }
                }
                Some(OutputEvent::Failed(e)) => return Err(VicunaError::Io(e)),
                Some(OutputEvent::Closed) | None => return Err(VicunaError::ProcessExited),
            },
        }
    }
}

/// Owns at most one inference process and mediates all traffic with it.
///
/// Prompts are single-flight: concurrent [`send`](Self::send) calls wait their
/// turn in FIFO order. [`stop`](Self::stop) fails pending sends with
/// [`VicunaError::SessionClosed`].
pub struct ProcessSession {
    config: SessionConfig,
    handle: Mutex<Option<ProcessHandle>>,
    state: Arc<watch::Sender<SessionState>>,
    closing: watch::Sender<u64>,
}

impl ProcessSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
            state: Arc::new(watch::channel(SessionState::Closed).0),
            closing: watch::channel(0).0,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Mark the session Ready, unless the pump already saw the output end.
    fn publish_ready(&self, handle: &ProcessHandle) {
        self.state.send_replace(SessionState::Ready);
        if handle.output_closed() {
            self.state.send_replace(SessionState::Closed);
        }
    }

    /// PID of the running process, if any.
    pub async fn pid(&self) -> Option<u32> {
        self.handle.lock().await.as_ref().and_then(|h| h.child.id())
    }

    /// Launch the executable and wait until it is ready for a prompt.
    ///
    /// Any process started earlier is stopped first.
    pub async fn start(&self) -> Result<()> {
        self.stop().await;

        let mut closed = self.closing.subscribe();
        let mut slot = self.handle.lock().await;

        let exe = self.config.executable_path();
        let model = self.config.model_path();
        for (asset, path) in [("Inference executable", exe), ("Model weights", model)] {
            if !path.exists() {
                return Err(VicunaError::AssetMissing {
                    asset: asset.to_string(),
                    path: path.to_path_buf(),
                });
            }
        }

        self.state.send_replace(SessionState::Starting);
        match self.launch(&mut closed).await {
            Ok(handle) => {
                self.publish_ready(&handle);
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(SessionState::Closed);
                Err(e)
            }
        }
    }

    async fn launch(&self, closed: &mut watch::Receiver<u64>) -> Result<ProcessHandle> {
        let exe = self.config.executable_path();

        info!(
            "Starting {} with model {}",
            exe.display(),
            self.config.model()
        );

        let mut child = Command::new(exe)
            .args(build_args(&self.config))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| VicunaError::SpawnFailed {
                path: exe.to_path_buf(),
                source,
            })?;

        debug!("Inference process started with PID: {:?}", child.id());

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill().await;
                return Err(VicunaError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "child pipes unavailable",
                )));
            }
        };

        let (tx, mut events) = mpsc::unbounded_channel();
        let output_closed = Arc::new(AtomicBool::new(false));
        let pump = tokio::spawn(pump_output(
            stdout,
            tx,
            Arc::clone(&output_closed),
            Arc::clone(&self.state),
        ));

        let timeout = self.config.startup_timeout();
        let ready = tokio::time::timeout(
            timeout,
            wait_ready(&mut events, closed, self.config.terminator().as_ref()),
        )
        .await
        .unwrap_or(Err(VicunaError::StartupTimeout(timeout)));

        let handle = ProcessHandle {
            child,
            stdin,
            events,
            output_closed,
            pump,
        };

        match ready {
            Ok(()) => {
                info!("Inference process is ready");
                Ok(handle)
            }
            Err(e) => {
                warn!("Inference process failed to become ready: {}", e);
                handle.terminate().await;
                Err(e)
            }
        }
    }

    /// Send one prompt and collect the response.
    pub async fn send(&self, prompt: &str) -> Result<String> {
        let mut closed = self.closing.subscribe();

        let mut slot = tokio::select! {
            biased;
            _ = closed.changed() => return Err(VicunaError::SessionClosed),
            guard = self.handle.lock() => guard,
        };

        let handle = slot.as_mut().ok_or(VicunaError::NotReady)?;

        let pending = if handle.is_alive() {
            handle.drain_stray_output()
        } else {
            Err(VicunaError::ProcessExited)
        };
        if let Err(e) = pending {
            debug!("Inference process is gone: {}", e);
            if let Some(dead) = slot.take() {
                dead.terminate().await;
            }
            self.state.send_replace(SessionState::Closed);
            return Err(match e {
                VicunaError::ProcessExited => VicunaError::NotReady,
                other => other,
            });
        }

        self.state.send_replace(SessionState::Busy);
        debug!("Sending prompt ({} bytes)", prompt.len());

        let collector = ResponseCollector::new(
            self.config.terminator().clone(),
            self.config.on_token().clone(),
        );
        // A child that stops reading can block the write indefinitely.
        let written = tokio::select! {
            biased;
            _ = closed.changed() => Err(VicunaError::SessionClosed),
            written = handle.write_prompt(prompt) => written,
        };
        let result = match written {
            Ok(()) => {
                collect_response(
                    &mut handle.events,
                    &mut closed,
                    collector,
                    self.config.idle_timeout(),
                )
                .await
            }
            Err(e) => Err(e),
        };

        match &result {
            Err(VicunaError::SessionClosed) => {}
            _ if handle.is_alive() && !matches!(result, Err(VicunaError::ProcessExited)) => {
                self.publish_ready(handle);
            }
            _ => {
                if let Some(dead) = slot.take() {
                    dead.terminate().await;
                }
                self.state.send_replace(SessionState::Closed);
            }
        }

        result
    }

    /// Terminate the process, if any. Pending sends fail with `SessionClosed`.
    pub async fn stop(&self) {
        self.closing.send_modify(|epoch| *epoch += 1);

        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.terminate().await;
        }

        self.state.send_replace(SessionState::Closed);
    }
}
