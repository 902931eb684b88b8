use anyhow::Result;
use env_logger::{Builder, Env, WriteStyle};
use std::io::Write;

use crate::config::LogConfig;

/// Installs the global logger.
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init(config: &LogConfig, debug: bool) -> Result<()> {
    let level = if debug { "debug" } else { filter_for(&config.level)? };
    let mut builder = Builder::from_env(Env::default().default_filter_or(level));
    if config.no_color {
        builder.write_style(WriteStyle::Never);
    }
    if config.in_json {
        builder.format(|buf, record| {
            let line = serde_json::json!({
                "time": chrono::Utc::now().to_rfc3339(),
                "level": record.level().to_string().to_lowercase(),
                "target": record.target(),
                "msg": record.args().to_string(),
            });
            writeln!(buf, "{}", line)
        });
    }
    builder.try_init()?;
    Ok(())
}

/// Maps a configured level name onto a `log` filter
pub fn filter_for(level: &str) -> Result<&'static str> {
    Ok(match level.trim().to_lowercase().as_str() {
        "" | "info" => "info",
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "fatal" | "panic" => "error",
        "off" => "off",
        other => return Err(anyhow::format_err!("invalid log level: {:?}", other)),
    })
}
