#![forbid(unsafe_code)]

mod client;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use stashd_core::crypto::KdfParams;
use stashd_core::protocol::{Request, Response};
use stashd_core::{Settings, Stash};
use zeroize::Zeroizing;

use crate::client::DaemonClient;

#[derive(Debug, Clone)]
enum Command {
    Init,
    Unlock,
    Lock,
    Stop,
    Health,
    Get { key: String, stdout: bool },
    List { filter: Option<String> },
    Add { key: String },
    Delete { key: String },
    Rename { key: String, new_key: String },
    ChangePassword,
    Help,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let (command, data_dir) = parse_args(std::env::args().skip(1).collect())?;
    let settings = Settings::load(data_dir)?;

    match command {
        Command::Init => run_init(&settings),
        Command::Unlock => run_unlock(&settings),
        Command::Lock => run_lock(&settings),
        Command::Stop => run_stop(&settings),
        Command::Health => run_health(&settings),
        Command::Get { key, stdout } => run_get(&settings, &key, stdout),
        Command::List { filter } => run_list(&settings, filter.as_deref()),
        Command::Add { key } => run_add(&settings, &key),
        Command::Delete { key } => run_delete(&settings, &key),
        Command::Rename { key, new_key } => run_rename(&settings, &key, &new_key),
        Command::ChangePassword => run_change_password(&settings),
        Command::Help => {
            print!("{}", usage());
            Ok(())
        }
    }
}

fn parse_args(args: Vec<String>) -> Result<(Command, Option<PathBuf>)> {
    let mut data_dir: Option<PathBuf> = None;
    let mut stdout_flag = false;
    let mut positionals: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--data-dir" => {
                i += 1;
                if i >= args.len() {
                    bail!("missing value for --data-dir");
                }
                data_dir = Some(PathBuf::from(&args[i]));
            }
            "--stdout" => stdout_flag = true,
            "--help" | "-h" => return Ok((Command::Help, data_dir)),
            other => positionals.push(other.to_string()),
        }
        i += 1;
    }

    let Some(verb) = positionals.first() else {
        return Ok((Command::Help, data_dir));
    };

    let command = match verb.as_str() {
        "init" => Command::Init,
        "unlock" => Command::Unlock,
        "lock" => Command::Lock,
        "stop" => Command::Stop,
        "health" => Command::Health,
        "get" => Command::Get {
            key: positional(&positionals, 1, "key")?,
            stdout: stdout_flag,
        },
        "list" => Command::List {
            filter: positionals.get(1).cloned(),
        },
        "add" => Command::Add {
            key: positional(&positionals, 1, "key")?,
        },
        "delete" => Command::Delete {
            key: positional(&positionals, 1, "key")?,
        },
        "rename" => Command::Rename {
            key: positional(&positionals, 1, "key")?,
            new_key: positional(&positionals, 2, "new key")?,
        },
        "change-password" => Command::ChangePassword,
        other => bail!("unknown command '{other}' (try 'stash --help')"),
    };

    Ok((command, data_dir))
}

fn positional(positionals: &[String], index: usize, what: &str) -> Result<String> {
    positionals
        .get(index)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing {what} argument"))
}

fn run_init(settings: &Settings) -> Result<()> {
    let stash = Stash::new(settings.stash_path());
    if stash.exists() {
        bail!("stash already exists at {}", settings.stash_path().display());
    }
    let password = prompt_hidden("New master password: ")?;
    let confirm = prompt_hidden("Confirm master password: ")?;
    if *password != *confirm {
        bail!("passwords do not match");
    }
    stash.init(&password, &KdfParams::default())?;
    println!("Stash initialized at {}.", settings.stash_path().display());
    Ok(())
}

fn run_unlock(settings: &Settings) -> Result<()> {
    client::ensure_daemon(settings)?;
    let password = prompt_hidden("Master password: ")?;
    let client = DaemonClient::new(settings);
    expect_ok(client.send(&Request::new("unlock").with_param("password", password.as_str()))?)?;
    println!("Unlocked.");
    Ok(())
}

fn run_lock(settings: &Settings) -> Result<()> {
    if !client::is_connectable(&settings.socket_path()) {
        println!("Daemon is not running.");
        return Ok(());
    }
    let client = DaemonClient::new(settings);
    expect_ok(client.send(&Request::new("lock"))?)?;
    println!("Locked.");
    Ok(())
}

fn run_stop(settings: &Settings) -> Result<()> {
    if !client::is_connectable(&settings.socket_path()) {
        println!("Daemon is not running.");
        return Ok(());
    }
    let client = DaemonClient::new(settings);
    expect_ok(client.send(&Request::new("stop"))?)?;
    println!("Daemon stopped.");
    Ok(())
}

fn run_health(settings: &Settings) -> Result<()> {
    let client = DaemonClient::new(settings);
    let response = client
        .send(&Request::new("health"))
        .context("daemon is not running")?;
    let response = expect_ok(response)?;
    let state = if response.data["unlocked"].as_bool().unwrap_or(false) {
        "unlocked"
    } else {
        "locked"
    };
    println!("Daemon running (pid {}), stash {state}.", response.data["pid"]);
    Ok(())
}

fn run_get(settings: &Settings, key: &str, stdout: bool) -> Result<()> {
    client::ensure_daemon(settings)?;
    let client = DaemonClient::new(settings);
    let response = expect_ok(client.send_auto_unlock(
        &Request::new("get").with_param("key", key),
        prompt_master_password,
    )?)?;
    let value = Zeroizing::new(
        response.data["value"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    );

    if stdout {
        println!("{}", *value);
        return Ok(());
    }

    copy_to_clipboard(&value)?;
    // Best effort: the daemon clears the clipboard later unless it changed.
    let _ = client.send(&Request::new("schedule_clipboard_clear").with_param("value", value.as_str()));
    println!(
        "Copied '{key}' to clipboard (clears in {} s).",
        settings.clipboard_clear_seconds
    );
    Ok(())
}

fn run_list(settings: &Settings, filter: Option<&str>) -> Result<()> {
    client::ensure_daemon(settings)?;
    let client = DaemonClient::new(settings);
    let mut request = Request::new("list");
    if let Some(filter) = filter {
        request = request.with_param("filter", filter);
    }
    let response = expect_ok(client.send_auto_unlock(&request, prompt_master_password)?)?;
    if let Some(keys) = response.data["keys"].as_array() {
        for key in keys {
            if let Some(key) = key.as_str() {
                println!("{key}");
            }
        }
    }
    Ok(())
}

fn run_add(settings: &Settings, key: &str) -> Result<()> {
    client::ensure_daemon(settings)?;
    let value = prompt_hidden("Secret value: ")?;
    let client = DaemonClient::new(settings);
    expect_ok(client.send_auto_unlock(
        &Request::new("add")
            .with_param("key", key)
            .with_param("value", value.as_str()),
        prompt_master_password,
    )?)?;
    println!("Stored '{key}'.");
    Ok(())
}

fn run_delete(settings: &Settings, key: &str) -> Result<()> {
    client::ensure_daemon(settings)?;
    let client = DaemonClient::new(settings);
    expect_ok(client.send_auto_unlock(
        &Request::new("delete").with_param("key", key),
        prompt_master_password,
    )?)?;
    println!("Deleted '{key}'.");
    Ok(())
}

fn run_rename(settings: &Settings, key: &str, new_key: &str) -> Result<()> {
    client::ensure_daemon(settings)?;
    let client = DaemonClient::new(settings);
    expect_ok(client.send_auto_unlock(
        &Request::new("rename")
            .with_param("key", key)
            .with_param("new_key", new_key),
        prompt_master_password,
    )?)?;
    println!("Renamed '{key}' to '{new_key}'.");
    Ok(())
}

fn run_change_password(settings: &Settings) -> Result<()> {
    client::ensure_daemon(settings)?;
    let old = prompt_hidden("Current master password: ")?;
    let new = prompt_hidden("New master password: ")?;
    let confirm = prompt_hidden("Confirm new master password: ")?;
    if *new != *confirm {
        bail!("passwords do not match");
    }
    let client = DaemonClient::new(settings);
    expect_ok(client.send(
        &Request::new("change_password")
            .with_param("old", old.as_str())
            .with_param("new", new.as_str()),
    )?)?;
    println!("Master password changed.");
    Ok(())
}

fn expect_ok(response: Response) -> Result<Response> {
    if response.ok {
        return Ok(response);
    }
    let code = response.error_code().unwrap_or("Internal").to_string();
    let message = response
        .message
        .as_deref()
        .unwrap_or("unknown error")
        .to_string();
    bail!("{code}: {message}")
}

fn prompt_hidden(prompt: &str) -> Result<Zeroizing<String>> {
    let password = rpassword::prompt_password(prompt).context("failed reading password")?;
    Ok(Zeroizing::new(password))
}

fn prompt_master_password() -> Result<String> {
    Ok(rpassword::prompt_password("Master password: ")
        .context("failed reading password")?)
}

fn copy_to_clipboard(text: &str) -> Result<()> {
    let mut clipboard = arboard::Clipboard::new().context("clipboard unavailable")?;
    clipboard
        .set_text(text.to_string())
        .context("failed copying to clipboard")?;
    Ok(())
}

fn usage() -> &'static str {
    "stash - personal secret stash

USAGE:
    stash [--data-dir <dir>] <command> [args]

COMMANDS:
    init                      Create a new encrypted stash
    unlock                    Unlock with the master password
    lock                      Lock and wipe the in-memory session
    stop                      Stop the background daemon
    health                    Show daemon status
    get <key> [--stdout]      Copy a secret to the clipboard (or print it)
    list [filter]             List keys, optionally filtered by substring
    add <key>                 Store a secret (prompts for the value)
    delete <key>              Delete a secret
    rename <key> <new-key>    Move a secret to a new key
    change-password           Re-encrypt the stash under a new password
"
}
