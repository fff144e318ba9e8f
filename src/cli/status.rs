//! `devstrap status`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use devstrap::{Bootstrap, BootstrapSummary};

#[derive(Serialize)]
struct StatusReport<'a> {
    version: &'static str,
    base_dir: String,
    plugin_dir: String,
    registry_url: String,
    platform_key: String,
    platform_cached_at: Option<DateTime<Utc>>,
    plugins_cached_at: Option<DateTime<Utc>>,
    cache_ttl_hours: i64,
    #[serde(flatten)]
    summary: &'a BootstrapSummary,
}

pub(crate) async fn cmd_status(
    bootstrap: &Bootstrap,
    summary: &BootstrapSummary,
    json: bool,
) -> Result<()> {
    let (platform_cached_at, plugins_cached_at) = bootstrap.cache().observed_at();
    let report = StatusReport {
        version: env!("CARGO_PKG_VERSION"),
        base_dir: bootstrap.base_dir().display().to_string(),
        plugin_dir: bootstrap.plugin_dir().display().to_string(),
        registry_url: bootstrap.config().resolve_registry_url(),
        platform_key: summary.platform.key(),
        platform_cached_at,
        plugins_cached_at,
        cache_ttl_hours: bootstrap.cache().ttl().num_hours(),
        summary,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("devstrap {}", report.version);
    println!();
    println!("Platform:    {}", summary.platform);
    println!("Key:         {}", report.platform_key);
    if !summary.platform.package_managers.is_empty() {
        println!("Packages:    {}", summary.platform.package_managers.join(", "));
    }
    println!("Desktop:     {}", summary.platform.desktop_env);
    println!();
    println!("Home:        {}", report.base_dir);
    println!("Plugins:     {}", report.plugin_dir);
    println!("Registry:    {}", report.registry_url);
    println!(
        "Cache:       {} (ttl {}h)",
        describe_cache_time(platform_cached_at),
        report.cache_ttl_hours
    );
    println!();

    let manager = bootstrap.manager();
    let loaded = manager.list_plugins().await;
    let mark = |name: &str| {
        if loaded.iter().any(|p| p.name() == name) {
            "✓"
        } else {
            "✗"
        }
    };
    println!("Required plugins:");
    for name in &summary.required_plugins {
        println!("  {} {}", mark(name), name);
    }
    println!("Loaded plugins: {}", summary.plugins_loaded);

    if summary.is_degraded() {
        println!();
        println!("Warnings:");
        for warning in &summary.warnings {
            println!("  - {}", warning);
        }
    }
    Ok(())
}

fn describe_cache_time(at: Option<DateTime<Utc>>) -> String {
    match at {
        Some(at) => format!("platform detected {}", at.format("%Y-%m-%d %H:%M UTC")),
        None => "empty".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_describe_cache_time() {
        assert_eq!(describe_cache_time(None), "empty");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        assert_eq!(
            describe_cache_time(Some(at)),
            "platform detected 2024-03-01 09:30 UTC"
        );
    }
}
