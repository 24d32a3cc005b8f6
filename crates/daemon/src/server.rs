//! Unix socket accept loop and daemon lifecycle.
//!
//! One request/response exchange per connection, newline-framed JSON. All
//! session mutation funnels through a single mutex shared with the timers.

use std::sync::Arc;

use anyhow::{Context, Result};
use stashd_core::protocol::{self, Response};
use stashd_core::{Settings, Stash, StashError};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant, timeout};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::clipboard::Clipboard;
use crate::handlers;
use crate::process::PidLock;
use crate::timers;

pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Daemon {
    pub settings: Settings,
    pub session: Mutex<SessionState>,
    pub clipboard: Arc<dyn Clipboard>,
    /// Wakes the inactivity watcher after an unlock or fresh activity.
    pub activity: Notify,
    pub shutdown: Notify,
}

pub struct SessionState {
    pub stash: Stash,
    pub last_activity: Instant,
    pub clipboard_pending: Option<ClipboardPending>,
    pub clipboard_generation: u64,
}

pub struct ClipboardPending {
    pub fingerprint: [u8; 32],
    pub generation: u64,
}

impl SessionState {
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn cancel_clipboard(&mut self) {
        self.clipboard_pending = None;
    }

    /// Transition into LOCKED: wipe key and secrets, drop any pending
    /// clipboard clear.
    pub fn lock_now(&mut self) {
        self.stash.lock();
        self.cancel_clipboard();
    }
}

impl Daemon {
    pub fn new(settings: Settings, clipboard: Arc<dyn Clipboard>) -> Arc<Self> {
        let stash = Stash::new(settings.stash_path());
        Arc::new(Self {
            settings,
            session: Mutex::new(SessionState {
                stash,
                last_activity: Instant::now(),
                clipboard_pending: None,
                clipboard_generation: 0,
            }),
            clipboard,
            activity: Notify::new(),
            shutdown: Notify::new(),
        })
    }
}

pub async fn run(settings: Settings, clipboard: Arc<dyn Clipboard>) -> Result<()> {
    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("failed creating {}", settings.data_dir.display()))?;
    restrict_permissions(&settings.data_dir, 0o700)?;

    // Fail fast if another instance holds the pid lock; anything else on
    // disk is leftovers from a dead one.
    let pid_lock = PidLock::acquire(&settings.pid_path())?;

    let socket_path = settings.socket_path();
    if socket_path.exists() {
        info!("removing stale socket {}", socket_path.display());
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed removing stale socket {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed binding {}", socket_path.display()))?;
    restrict_permissions(&socket_path, 0o600)?;
    info!(
        "daemon listening on {} (pid {})",
        socket_path.display(),
        std::process::id()
    );

    let daemon = Daemon::new(settings, clipboard);

    // Eagerly parse the record so a corrupt or missing file shows up in the
    // log at startup. The ciphertext stays sealed until an unlock.
    match daemon.session.lock().await.stash.store().load() {
        Ok(data) => debug!(
            n = data.params.n,
            r = data.params.r,
            p = data.params.p,
            "stash record loaded"
        ),
        Err(StashError::NoStash) => info!("no stash record yet; run 'stash init' first"),
        Err(err) => warn!(error = %err, "stash record is unreadable"),
    }

    let watcher = tokio::spawn(timers::inactivity_watcher(daemon.clone()));

    let mut sigterm = signal(SignalKind::terminate()).context("failed installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed installing SIGINT handler")?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let daemon = daemon.clone();
                    tokio::spawn(handle_client(daemon, stream));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break;
            }
            _ = daemon.shutdown.notified() => break,
        }
    }

    watcher.abort();
    daemon.session.lock().await.lock_now();
    drop(listener);
    let _ = std::fs::remove_file(&socket_path);
    drop(pid_lock);
    info!("daemon stopped");
    Ok(())
}

async fn handle_client(daemon: Arc<Daemon>, stream: UnixStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    match timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        // No complete line within the deadline: close without a response.
        Err(_) => {
            debug!("request read timed out");
            return;
        }
        Ok(Err(err)) => {
            debug!(error = %err, "request read failed");
            return;
        }
        Ok(Ok(0)) => return,
        Ok(Ok(_)) => {}
    }

    let (response, stop_requested) = match protocol::decode_request(&line) {
        Ok(request) => {
            debug!(command = %request.command, "request");
            let stop = request.command == "stop";
            (handlers::dispatch(&daemon, request).await, stop)
        }
        Err(err) => (Response::from_error(&err), false),
    };
    line.zeroize();

    match protocol::encode_response(&response) {
        Ok(mut encoded) => {
            if let Err(err) = write_half.write_all(&encoded).await {
                debug!(error = %err, "response write failed");
            }
            let _ = write_half.shutdown().await;
            encoded.zeroize();
        }
        Err(err) => warn!(error = %err, "response encoding failed"),
    }

    // The response is on the wire before the listener goes away. notify_one
    // stores a permit, so the accept loop picks this up even if it is not
    // parked in select yet.
    if stop_requested && response.ok {
        daemon.shutdown.notify_one();
    }
}

fn restrict_permissions(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed restricting permissions on {}", path.display()))
}
