//! Output helpers for the CLI. Results go to stdout as JSON lines; operator notices go to stderr.

use eyre::Context as _;
use serde::Serialize;
use serde_json::json;
use std::io::{IsTerminal as _, Write as _};

use crate::errors::{CoreError, ErrorView};

fn stderr_writeln(s: &str) {
    let mut stderr = std::io::stderr().lock();
    if stderr.write_all(s.as_bytes()).is_err() {
        return;
    }
    if stderr.write_all(b"\n").is_err() {
        return;
    }
    drop(stderr.flush());
}

/// One compact JSON document per line.
pub fn print_json(value: &impl Serialize) -> eyre::Result<()> {
    let s = serde_json::to_string(value).context("serialize output")?;
    writeln!(std::io::stdout().lock(), "{s}").context("write output")?;
    Ok(())
}

/// `{"ok": false, "error": {"code", "message"}}`.
pub fn print_error(e: &CoreError) -> eyre::Result<()> {
    print_json(&json!({ "ok": false, "error": ErrorView::from(e) }))
}

/// Only shown when a human is watching stderr.
pub fn print_watch_notice(kind: &str, address: &str) {
    if !std::io::stderr().is_terminal() {
        return;
    }
    stderr_writeln(&format!(
        "crossquote: watching {kind} balance of {address} (ctrl-c to stop)"
    ));
}
