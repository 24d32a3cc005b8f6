use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use stashd_core::StashError;
use stashd_core::crypto::{self, KdfParams, MasterKey, SALT_LEN};
use stashd_core::protocol::{Request, Response};
use stashd_core::store::{StashStore, StoreData};
use tokio::task;
use tracing::info;
use zeroize::Zeroizing;

use crate::server::{ClipboardPending, Daemon, SessionState};
use crate::timers;

pub async fn dispatch(daemon: &Arc<Daemon>, request: Request) -> Response {
    let params = &request.params;
    let result = match request.command.as_str() {
        "health" => health(daemon).await,
        "unlock" => unlock(daemon, params).await,
        "lock" => lock(daemon).await,
        "list" => list(daemon, params).await,
        "get" => get(daemon, params).await,
        "add" => add(daemon, params).await,
        "delete" => delete(daemon, params).await,
        "rename" => rename(daemon, params).await,
        "change_password" => change_password(daemon, params).await,
        "schedule_clipboard_clear" => schedule_clipboard_clear(daemon, params).await,
        "stop" => stop(daemon).await,
        other => Err(StashError::BadRequest(format!("unknown command: {other}"))),
    };
    result.unwrap_or_else(|err| Response::from_error(&err))
}

fn require<'a>(params: &'a HashMap<String, String>, name: &str) -> Result<&'a str, StashError> {
    params
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| StashError::BadRequest(format!("missing '{name}' parameter")))
}

/// Mark activity on the unlocked session and kick the inactivity watcher so
/// it rearms to the new deadline.
fn touch_unlocked(daemon: &Daemon, session: &mut SessionState) {
    session.touch();
    daemon.activity.notify_one();
}

async fn health(daemon: &Arc<Daemon>) -> Result<Response, StashError> {
    let mut session = daemon.session.lock().await;
    let unlocked = session.stash.is_unlocked();
    if unlocked {
        touch_unlocked(daemon, &mut session);
    }
    Ok(Response::success_with(json!({
        "unlocked": unlocked,
        "pid": std::process::id(),
    })))
}

async fn unlock(
    daemon: &Arc<Daemon>,
    params: &HashMap<String, String>,
) -> Result<Response, StashError> {
    let password = Zeroizing::new(require(params, "password")?.to_string());
    let store = StashStore::new(daemon.settings.stash_path());

    // scrypt is a multi-hundred-millisecond CPU blocker: derive before
    // taking the session mutex, then validate against the record again under
    // it. If the record was re-encrypted in between, derive once more.
    for _ in 0..2 {
        let data = store.load()?;
        let salt = data.salt;
        let key = derive_blocking(password.clone(), salt, data.params).await?;

        let mut session = daemon.session.lock().await;
        let fresh = store.load()?;
        if fresh.salt != salt {
            continue;
        }
        let was_locked = !session.stash.is_unlocked();
        session.stash.install_session(key, fresh)?;
        if was_locked {
            // A pending clear from a previous session is stale.
            session.cancel_clipboard();
        }
        touch_unlocked(daemon, &mut session);
        info!("stash unlocked");
        return Ok(Response::success());
    }
    Err(StashError::Internal(
        "stash was re-encrypted during unlock, try again".into(),
    ))
}

async fn lock(daemon: &Arc<Daemon>) -> Result<Response, StashError> {
    let mut session = daemon.session.lock().await;
    if session.stash.is_unlocked() {
        info!("stash locked");
    }
    session.lock_now();
    Ok(Response::success())
}

async fn list(
    daemon: &Arc<Daemon>,
    params: &HashMap<String, String>,
) -> Result<Response, StashError> {
    let filter = params.get("filter").map(String::as_str).filter(|f| !f.is_empty());
    let mut session = daemon.session.lock().await;
    let keys = session.stash.list(filter)?;
    touch_unlocked(daemon, &mut session);
    Ok(Response::success_with(json!({ "keys": keys })))
}

async fn get(
    daemon: &Arc<Daemon>,
    params: &HashMap<String, String>,
) -> Result<Response, StashError> {
    let key = require(params, "key")?;
    let mut session = daemon.session.lock().await;
    let value = session.stash.get(key)?.to_string();
    touch_unlocked(daemon, &mut session);
    Ok(Response::success_with(json!({ "value": value })))
}

async fn add(
    daemon: &Arc<Daemon>,
    params: &HashMap<String, String>,
) -> Result<Response, StashError> {
    let key = require(params, "key")?;
    let value = require(params, "value")?.to_string();
    let mut session = daemon.session.lock().await;
    session.stash.add(key, value)?;
    touch_unlocked(daemon, &mut session);
    Ok(Response::success())
}

async fn delete(
    daemon: &Arc<Daemon>,
    params: &HashMap<String, String>,
) -> Result<Response, StashError> {
    let key = require(params, "key")?;
    let mut session = daemon.session.lock().await;
    session.stash.delete(key)?;
    touch_unlocked(daemon, &mut session);
    Ok(Response::success())
}

async fn rename(
    daemon: &Arc<Daemon>,
    params: &HashMap<String, String>,
) -> Result<Response, StashError> {
    let key = require(params, "key")?;
    let new_key = require(params, "new_key")?;
    let mut session = daemon.session.lock().await;
    session.stash.rename(key, new_key)?;
    touch_unlocked(daemon, &mut session);
    Ok(Response::success())
}

async fn change_password(
    daemon: &Arc<Daemon>,
    params: &HashMap<String, String>,
) -> Result<Response, StashError> {
    let old = Zeroizing::new(require(params, "old")?.to_string());
    let new = Zeroizing::new(require(params, "new")?.to_string());
    if new.is_empty() {
        return Err(StashError::EmptyPassword);
    }
    let store = StashStore::new(daemon.settings.stash_path());

    for _ in 0..2 {
        let data = store.load()?;
        let old_salt = data.salt;
        let kdf = data.params;
        let old_key = derive_blocking(old.clone(), old_salt, kdf).await?;
        let new_salt = crypto::random_salt();
        let new_key = derive_blocking(new.clone(), new_salt, kdf).await?;

        let mut session = daemon.session.lock().await;
        let fresh = store.load()?;
        if fresh.salt != old_salt {
            continue;
        }
        // Decrypting the stored ciphertext is the sole password check.
        let plaintext = crypto::decrypt(&old_key, &fresh.nonce, &fresh.ciphertext)?;
        let sealed = crypto::encrypt(&new_key, &plaintext)?;
        store.write(&StoreData {
            params: kdf,
            salt: new_salt,
            nonce: sealed.nonce,
            ciphertext: sealed.ciphertext,
        })?;
        session.stash.refresh_credentials(new_key, new_salt, kdf);
        if session.stash.is_unlocked() {
            touch_unlocked(daemon, &mut session);
        }
        info!("master password changed");
        return Ok(Response::success());
    }
    Err(StashError::Internal(
        "stash was re-encrypted during password change, try again".into(),
    ))
}

async fn schedule_clipboard_clear(
    daemon: &Arc<Daemon>,
    params: &HashMap<String, String>,
) -> Result<Response, StashError> {
    let value = require(params, "value")?;
    let generation;
    {
        let mut session = daemon.session.lock().await;
        if !session.stash.is_unlocked() {
            return Err(StashError::Locked);
        }
        // A newer schedule supersedes any armed one.
        session.clipboard_generation += 1;
        generation = session.clipboard_generation;
        session.clipboard_pending = Some(ClipboardPending {
            fingerprint: crypto::fingerprint(value),
            generation,
        });
        touch_unlocked(daemon, &mut session);
    }
    timers::spawn_clipboard_clear(daemon.clone(), generation);
    Ok(Response::success())
}

async fn stop(daemon: &Arc<Daemon>) -> Result<Response, StashError> {
    let mut session = daemon.session.lock().await;
    session.lock_now();
    info!("stop requested");
    Ok(Response::success())
}

async fn derive_blocking(
    password: Zeroizing<String>,
    salt: [u8; SALT_LEN],
    params: KdfParams,
) -> Result<MasterKey, StashError> {
    task::spawn_blocking(move || crypto::derive_key(&password, &salt, &params))
        .await
        .map_err(|err| StashError::Internal(format!("key derivation task failed: {err}")))?
        .map_err(StashError::from)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use stashd_core::{Settings, Stash};

    use super::*;
    use crate::clipboard::fake::FakeClipboard;
    use crate::timers;

    const PASSWORD: &str = "hunter2";

    fn test_params() -> KdfParams {
        KdfParams { n: 4096, r: 8, p: 1 }
    }

    fn test_settings(dir: &Path) -> Settings {
        Settings {
            data_dir: dir.to_path_buf(),
            inactivity_lock_seconds: 900,
            clipboard_clear_seconds: 30,
        }
    }

    struct Harness {
        daemon: Arc<Daemon>,
        clipboard: Arc<FakeClipboard>,
        _dir: tempfile::TempDir,
    }

    fn harness_with(settings_of: impl FnOnce(&Path) -> Settings) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings_of(dir.path());
        let clipboard = Arc::new(FakeClipboard::default());
        let daemon = Daemon::new(settings, clipboard.clone());
        Harness {
            daemon,
            clipboard,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(test_settings)
    }

    fn init_store(daemon: &Daemon) {
        Stash::new(daemon.settings.stash_path())
            .init(PASSWORD, &test_params())
            .expect("init");
    }

    async fn send(daemon: &Arc<Daemon>, command: &str, params: &[(&str, &str)]) -> Response {
        let mut request = Request::new(command);
        for (name, value) in params {
            request = request.with_param(*name, *value);
        }
        dispatch(daemon, request).await
    }

    async fn unlock_ok(daemon: &Arc<Daemon>) {
        let response = send(daemon, "unlock", &[("password", PASSWORD)]).await;
        assert!(response.ok, "unlock failed: {:?}", response.message);
    }

    #[tokio::test]
    async fn init_add_get_flow() {
        let h = harness();

        // No record yet: unlock reports the first-run state.
        let response = send(&h.daemon, "unlock", &[("password", PASSWORD)]).await;
        assert_eq!(response.error_code(), Some("NoStash"));

        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;

        let add = send(&h.daemon, "add", &[("key", "t"), ("value", "abc")]).await;
        assert!(add.ok);
        let get = send(&h.daemon, "get", &[("key", "t")]).await;
        assert!(get.ok);
        assert_eq!(get.data["value"], "abc");
    }

    #[tokio::test]
    async fn wrong_password_leaves_session_locked() {
        let h = harness();
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;
        assert!(send(&h.daemon, "lock", &[]).await.ok);

        let bad = send(&h.daemon, "unlock", &[("password", "hunter3")]).await;
        assert_eq!(bad.error_code(), Some("WrongPassword"));

        let list = send(&h.daemon, "list", &[]).await;
        assert_eq!(list.error_code(), Some("Locked"));
    }

    #[tokio::test]
    async fn change_password_takes_effect_for_a_fresh_daemon() {
        let h = harness();
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;
        assert!(
            send(&h.daemon, "add", &[("key", "t"), ("value", "abc")])
                .await
                .ok
        );

        let change = send(
            &h.daemon,
            "change_password",
            &[("old", PASSWORD), ("new", "s3cr3t")],
        )
        .await;
        assert!(change.ok, "change failed: {:?}", change.message);

        // The live session keeps persisting under the new credentials.
        assert!(
            send(&h.daemon, "add", &[("key", "u"), ("value", "def")])
                .await
                .ok
        );

        // A daemon restarted on the same data dir only accepts the new one.
        let fresh = Daemon::new(h.daemon.settings.clone(), h.clipboard.clone());
        let old = send(&fresh, "unlock", &[("password", PASSWORD)]).await;
        assert_eq!(old.error_code(), Some("WrongPassword"));
        let new = send(&fresh, "unlock", &[("password", "s3cr3t")]).await;
        assert!(new.ok);
        let get = send(&fresh, "get", &[("key", "u")]).await;
        assert_eq!(get.data["value"], "def");
    }

    #[tokio::test]
    async fn change_password_works_while_locked_and_rejects_wrong_old() {
        let h = harness();
        init_store(&h.daemon);

        let wrong = send(
            &h.daemon,
            "change_password",
            &[("old", "nope"), ("new", "next")],
        )
        .await;
        assert_eq!(wrong.error_code(), Some("WrongPassword"));

        let change = send(
            &h.daemon,
            "change_password",
            &[("old", PASSWORD), ("new", "next")],
        )
        .await;
        assert!(change.ok);

        let unlock = send(&h.daemon, "unlock", &[("password", "next")]).await;
        assert!(unlock.ok);
    }

    #[tokio::test]
    async fn delete_missing_key_reports_no_such_key_and_keeps_the_record() {
        let h = harness();
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;

        let path = h.daemon.settings.stash_path();
        let before = std::fs::read(&path).expect("read");
        let response = send(&h.daemon, "delete", &[("key", "nope")]).await;
        assert_eq!(response.error_code(), Some("NoSuchKey"));
        let after = std::fs::read(&path).expect("read");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn list_sorts_and_filters() {
        let h = harness();
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;

        for (key, value) in [("zeta", "1"), ("alpha", "2"), ("work/token", "3")] {
            assert!(
                send(&h.daemon, "add", &[("key", key), ("value", value)])
                    .await
                    .ok
            );
        }

        let all = send(&h.daemon, "list", &[]).await;
        assert_eq!(
            all.data["keys"],
            serde_json::json!(["alpha", "work/token", "zeta"])
        );

        let filtered = send(&h.daemon, "list", &[("filter", "work")]).await;
        assert_eq!(filtered.data["keys"], serde_json::json!(["work/token"]));
    }

    #[tokio::test]
    async fn rename_moves_a_secret() {
        let h = harness();
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;
        assert!(
            send(&h.daemon, "add", &[("key", "old"), ("value", "v")])
                .await
                .ok
        );

        let rename = send(
            &h.daemon,
            "rename",
            &[("key", "old"), ("new_key", "new")],
        )
        .await;
        assert!(rename.ok);
        assert_eq!(
            send(&h.daemon, "get", &[("key", "old")]).await.error_code(),
            Some("NoSuchKey")
        );
        assert_eq!(
            send(&h.daemon, "get", &[("key", "new")]).await.data["value"],
            "v"
        );
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let h = harness();
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;

        for bad in ["", " padded", "padded ", "nul\0byte"] {
            let response = send(&h.daemon, "add", &[("key", bad), ("value", "v")]).await;
            assert_eq!(response.error_code(), Some("InvalidKey"), "key {bad:?}");
        }
    }

    #[tokio::test]
    async fn missing_parameters_are_bad_requests() {
        let h = harness();
        init_store(&h.daemon);

        for (command, params) in [
            ("unlock", vec![]),
            ("get", vec![]),
            ("add", vec![("key", "k")]),
            ("delete", vec![]),
            ("rename", vec![("key", "k")]),
            ("change_password", vec![("old", "x")]),
            ("schedule_clipboard_clear", vec![]),
        ] {
            let response = send(&h.daemon, command, &params).await;
            assert_eq!(
                response.error_code(),
                Some("BadRequest"),
                "command {command}"
            );
        }
    }

    #[tokio::test]
    async fn unlock_on_unlocked_session_is_idempotent() {
        let h = harness();
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;
        assert!(
            send(&h.daemon, "add", &[("key", "k"), ("value", "v")])
                .await
                .ok
        );

        unlock_ok(&h.daemon).await;
        let get = send(&h.daemon, "get", &[("key", "k")]).await;
        assert_eq!(get.data["value"], "v");

        // A bad re-unlock errors without relocking.
        let bad = send(&h.daemon, "unlock", &[("password", "wrong")]).await;
        assert_eq!(bad.error_code(), Some("WrongPassword"));
        assert!(send(&h.daemon, "list", &[]).await.ok);
    }

    #[tokio::test]
    async fn health_reports_state_and_pid() {
        let h = harness();
        init_store(&h.daemon);

        let locked = send(&h.daemon, "health", &[]).await;
        assert!(locked.ok);
        assert_eq!(locked.data["unlocked"], false);
        assert_eq!(locked.data["pid"], u64::from(std::process::id()));

        unlock_ok(&h.daemon).await;
        let unlocked = send(&h.daemon, "health", &[]).await;
        assert_eq!(unlocked.data["unlocked"], true);
    }

    #[tokio::test]
    async fn inactivity_locks_after_the_deadline() {
        let h = harness_with(|dir| Settings {
            inactivity_lock_seconds: 1,
            ..test_settings(dir)
        });
        init_store(&h.daemon);
        let watcher = tokio::spawn(timers::inactivity_watcher(h.daemon.clone()));

        unlock_ok(&h.daemon).await;
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let list = send(&h.daemon, "list", &[]).await;
        assert_eq!(list.error_code(), Some("Locked"));
        watcher.abort();
    }

    #[tokio::test]
    async fn activity_rearms_the_inactivity_deadline() {
        let h = harness_with(|dir| Settings {
            inactivity_lock_seconds: 1,
            ..test_settings(dir)
        });
        init_store(&h.daemon);
        let watcher = tokio::spawn(timers::inactivity_watcher(h.daemon.clone()));

        unlock_ok(&h.daemon).await;
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(send(&h.daemon, "list", &[]).await.ok);

        // 1.4 s after unlock but only 0.7 s after the last request.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(send(&h.daemon, "list", &[]).await.ok);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        let list = send(&h.daemon, "list", &[]).await;
        assert_eq!(list.error_code(), Some("Locked"));
        watcher.abort();
    }

    #[tokio::test]
    async fn clipboard_clears_only_when_contents_still_match() {
        let h = harness_with(|dir| Settings {
            clipboard_clear_seconds: 1,
            ..test_settings(dir)
        });
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;

        // Still holding the copied value at the deadline: cleared.
        h.clipboard.set("X");
        assert!(
            send(&h.daemon, "schedule_clipboard_clear", &[("value", "X")])
                .await
                .ok
        );
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(h.clipboard.snapshot(), None);

        // Replaced by the user before the deadline: left untouched.
        h.clipboard.set("X");
        assert!(
            send(&h.daemon, "schedule_clipboard_clear", &[("value", "X")])
                .await
                .ok
        );
        h.clipboard.set("Y");
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(h.clipboard.snapshot(), Some("Y".to_string()));
    }

    #[tokio::test]
    async fn newer_clipboard_schedule_supersedes_the_old_one() {
        let h = harness_with(|dir| Settings {
            clipboard_clear_seconds: 1,
            ..test_settings(dir)
        });
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;

        h.clipboard.set("first");
        assert!(
            send(&h.daemon, "schedule_clipboard_clear", &[("value", "first")])
                .await
                .ok
        );
        tokio::time::sleep(Duration::from_millis(500)).await;
        h.clipboard.set("second");
        assert!(
            send(&h.daemon, "schedule_clipboard_clear", &[("value", "second")])
                .await
                .ok
        );

        // First deadline passes: superseded timer must not fire.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(h.clipboard.snapshot(), Some("second".to_string()));

        // Second deadline passes: cleared.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.clipboard.snapshot(), None);
    }

    #[tokio::test]
    async fn lock_cancels_a_pending_clipboard_clear() {
        let h = harness_with(|dir| Settings {
            clipboard_clear_seconds: 1,
            ..test_settings(dir)
        });
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;

        h.clipboard.set("X");
        assert!(
            send(&h.daemon, "schedule_clipboard_clear", &[("value", "X")])
                .await
                .ok
        );
        assert!(send(&h.daemon, "lock", &[]).await.ok);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(h.clipboard.snapshot(), Some("X".to_string()));
    }

    #[tokio::test]
    async fn clipboard_schedule_requires_an_unlocked_session() {
        let h = harness();
        init_store(&h.daemon);
        let response = send(&h.daemon, "schedule_clipboard_clear", &[("value", "X")]).await;
        assert_eq!(response.error_code(), Some("Locked"));
    }

    #[tokio::test]
    async fn round_trip_after_mutations_matches_last_persisted_state() {
        let h = harness();
        init_store(&h.daemon);
        unlock_ok(&h.daemon).await;

        for (key, value) in [("a", "1"), ("b", "2"), ("c", "3")] {
            assert!(
                send(&h.daemon, "add", &[("key", key), ("value", value)])
                    .await
                    .ok
            );
        }
        assert!(send(&h.daemon, "delete", &[("key", "b")]).await.ok);
        assert!(
            send(&h.daemon, "add", &[("key", "a"), ("value", "one")])
                .await
                .ok
        );

        assert!(send(&h.daemon, "lock", &[]).await.ok);
        unlock_ok(&h.daemon).await;

        let list = send(&h.daemon, "list", &[]).await;
        assert_eq!(list.data["keys"], serde_json::json!(["a", "c"]));
        assert_eq!(
            send(&h.daemon, "get", &[("key", "a")]).await.data["value"],
            "one"
        );
        assert_eq!(
            send(&h.daemon, "get", &[("key", "c")]).await.data["value"],
            "3"
        );
    }
}
