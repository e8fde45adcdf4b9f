//! Tracing initialization driven by the configuration's `logging` section.

use opwire_core::config::LoggingConf;
use tracing_subscriber::EnvFilter;

pub fn init(conf: Option<&LoggingConf>) {
    let enabled = conf.and_then(|c| c.enabled).unwrap_or(true);
    if !enabled {
        return;
    }
    let level = conf
        .and_then(|c| c.level.clone())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let as_json = conf.and_then(|c| c.format.as_deref()) == Some("json");
    let initialized = if as_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if initialized.is_err() {
        eprintln!("opwire-agent: logging init skipped (global subscriber already set)");
    }
}
