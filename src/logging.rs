use std::sync::OnceLock;

use owo_colors::OwoColorize;
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let ansi = detect_ansi();
    let _ = ANSI_ENABLED.set(ansi);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

pub fn label_trace() -> String {
    if ansi_enabled() {
        format!("{}", "TRACE".bright_cyan().bold())
    } else {
        "TRACE".to_string()
    }
}

pub fn label_brk() -> String {
    if ansi_enabled() {
        format!("{}", "BRK".bright_red().bold())
    } else {
        "BRK".to_string()
    }
}

pub fn label_break() -> String {
    if ansi_enabled() {
        format!("{}", "BREAK".bright_magenta().bold())
    } else {
        "BREAK".to_string()
    }
}

pub fn label_watch() -> String {
    if ansi_enabled() {
        format!("{}", "WATCH".bright_yellow().bold())
    } else {
        "WATCH".to_string()
    }
}

fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get_or_init(detect_ansi)
}

fn detect_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if std::env::var_os("FORCE_COLOR").is_some() {
        return true;
    }
    supports_color::on_cached(Stream::Stdout).is_some()
}
