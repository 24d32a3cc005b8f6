use std::io::{BufRead, BufReader, IsTerminal, Write};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use stashd_core::Settings;
use stashd_core::protocol::{self, Request, Response};

const IO_TIMEOUT: Duration = Duration::from_secs(10);
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SPAWN_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// One-shot client: every request opens a fresh connection, sends one line,
/// and reads one line back.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(settings: &Settings) -> Self {
        Self {
            socket_path: settings.socket_path(),
        }
    }

    pub fn send(&self, request: &Request) -> Result<Response> {
        let stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "failed connecting to daemon at {}",
                self.socket_path.display()
            )
        })?;
        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let encoded = protocol::encode_request(request)?;
        (&stream).write_all(&encoded)?;

        let mut reply = String::new();
        BufReader::new(&stream)
            .read_line(&mut reply)
            .context("failed reading daemon response")?;
        if reply.is_empty() {
            bail!("daemon closed the connection without a response");
        }
        Ok(protocol::decode_response(&reply)?)
    }

    /// Send a request; when the daemon answers Locked and stdin is a
    /// terminal, prompt for the master password, unlock, and retry once.
    /// Non-interactive callers get the Locked response as-is.
    pub fn send_auto_unlock(
        &self,
        request: &Request,
        prompt: impl Fn() -> Result<String>,
    ) -> Result<Response> {
        let response = self.send(request)?;
        if response.ok
            || response.error_code() != Some("Locked")
            || !std::io::stdin().is_terminal()
        {
            return Ok(response);
        }
        let password = prompt()?;
        let unlock = self.send(&Request::new("unlock").with_param("password", password))?;
        if !unlock.ok {
            return Ok(unlock);
        }
        self.send(request)
    }
}

pub fn is_connectable(socket_path: &Path) -> bool {
    UnixStream::connect(socket_path).is_ok()
}

/// Make sure a daemon is accepting connections, spawning one detached when
/// needed and polling the socket until it comes up.
pub fn ensure_daemon(settings: &Settings) -> Result<()> {
    let socket_path = settings.socket_path();
    if is_connectable(&socket_path) {
        return Ok(());
    }

    spawn_daemon(settings)?;

    let deadline = Instant::now() + SPAWN_POLL_TIMEOUT;
    while Instant::now() < deadline {
        if is_connectable(&socket_path) {
            return Ok(());
        }
        std::thread::sleep(SPAWN_POLL_INTERVAL);
    }
    bail!(
        "daemon failed to start within {}s",
        SPAWN_POLL_TIMEOUT.as_secs()
    )
}

fn spawn_daemon(settings: &Settings) -> Result<()> {
    let binary = daemon_binary();
    Command::new(&binary)
        .arg("--data-dir")
        .arg(&settings.data_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()
        .with_context(|| format!("failed spawning daemon binary {}", binary.display()))?;
    Ok(())
}

fn daemon_binary() -> PathBuf {
    // Prefer the stashd installed next to this binary, fall back to PATH.
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join("stashd");
        if sibling.is_file() {
            return sibling;
        }
    }
    PathBuf::from("stashd")
}
