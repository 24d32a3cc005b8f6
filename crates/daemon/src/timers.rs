//! The two resettable one-shot timers: inactivity auto-lock and clipboard
//! clear. Both re-enter the session mutex and re-check state when they fire;
//! a timer that finds the session already locked does nothing.

use std::sync::Arc;

use stashd_core::crypto;
use tokio::time::{Duration, Instant, sleep, sleep_until};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use crate::server::Daemon;

/// Long-lived watcher for the inactivity deadline. Sleeps until
/// `last_activity + timeout`, then locks only if no request arrived in the
/// meantime; otherwise the deadline is recomputed from the newer activity.
/// Parks while the session is locked and is woken through `Daemon::activity`.
pub async fn inactivity_watcher(daemon: Arc<Daemon>) {
    let timeout_seconds = daemon.settings.inactivity_lock_seconds;
    if timeout_seconds == 0 {
        debug!("inactivity auto-lock disabled");
        return;
    }
    let period = Duration::from_secs(timeout_seconds);

    loop {
        let deadline = {
            let session = daemon.session.lock().await;
            session
                .stash
                .is_unlocked()
                .then(|| session.last_activity + period)
        };
        match deadline {
            None => daemon.activity.notified().await,
            Some(deadline) if Instant::now() >= deadline => {
                let mut session = daemon.session.lock().await;
                // A request may have slipped in between the deadline check
                // and this lock acquisition.
                if session.stash.is_unlocked() && session.last_activity.elapsed() >= period {
                    info!("inactivity timeout, locking stash");
                    session.lock_now();
                }
            }
            Some(deadline) => {
                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = daemon.activity.notified() => {}
                }
            }
        }
    }
}

/// One-shot clipboard clear. The generation stamp ties the task to the
/// schedule call that armed it: a newer schedule or a lock leaves the stale
/// task to wake up, notice the mismatch, and do nothing.
pub fn spawn_clipboard_clear(daemon: Arc<Daemon>, generation: u64) {
    let delay = Duration::from_secs(daemon.settings.clipboard_clear_seconds);
    tokio::spawn(async move {
        sleep(delay).await;

        let mut session = daemon.session.lock().await;
        let Some(pending) = session.clipboard_pending.as_ref() else {
            return;
        };
        if pending.generation != generation {
            return;
        }
        let fingerprint = pending.fingerprint;
        session.clipboard_pending = None;

        // Compare-and-clear, serialized with handlers on the session mutex:
        // only wipe the clipboard if it still holds the value we scheduled
        // for, never whatever the user copied since.
        match daemon.clipboard.get() {
            Ok(Some(mut text)) => {
                if crypto::fingerprint(&text) == fingerprint {
                    match daemon.clipboard.clear() {
                        Ok(()) => info!("clipboard cleared"),
                        Err(err) => warn!(error = %err, "failed to clear clipboard"),
                    }
                } else {
                    debug!("clipboard contents changed, leaving them alone");
                }
                text.zeroize();
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to read clipboard"),
        }
    });
}
