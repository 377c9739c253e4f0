//! `ravel config`: Configuration management commands.

use std::path::{Path, PathBuf};

use ravel_config::RuntimeConfig;

pub fn defaults() {
    println!("{}", RuntimeConfig::default_toml());
}

pub fn show(config: &RuntimeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let toml_str = toml::to_string_pretty(config)?;
    println!("{toml_str}");
    Ok(())
}

pub fn path(explicit: Option<&Path>) {
    println!("{}", config_path(explicit).display());
}

fn config_path(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(|| RuntimeConfig::config_dir().join("config.toml"))
}

/// Loading already validated the hard errors; report the soft ones.
pub fn validate(config: &RuntimeConfig) {
    println!("🔍 Validating configuration...");
    println!("   ✅ Config parsed successfully");

    let warnings = warnings(config);
    if warnings.is_empty() {
        println!("   ✅ All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   ⚠️  {w}");
        }
    }

    println!();
    println!("   Max steps: {}", config.engine.max_steps);
    println!(
        "   Timeout:   {}",
        config
            .engine
            .call_timeout_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "none".into())
    );
    println!("   Store:     {}", config.store.backend);
    println!("   Log level: {}", config.logging.level);
}

fn warnings(config: &RuntimeConfig) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.store.backend == "file" && config.store.path.is_none() {
        warnings.push("store.path not set; the file store will use ~/.ravel/store");
    }
    if config.store.backend == "none" {
        warnings.push("store.backend = \"none\": runs will not be persisted");
    }
    if config.engine.retry_backoff_ms == 0 {
        warnings.push("engine.retry_backoff_ms = 0: retries fire back to back");
    }
    warnings
}
