//! `devstrap plugin ...` subcommands.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use devstrap::batch::{format_report, BatchProgress, BatchRunner};
use devstrap::platform::Platform;
use devstrap::plugins::InstalledPlugin;
use devstrap::{Bootstrap, BootstrapSummary, DevstrapError};

pub(crate) async fn cmd_list(
    bootstrap: &Bootstrap,
    summary: &BootstrapSummary,
    json: bool,
) -> Result<()> {
    let plugins = bootstrap.manager().list_plugins().await;

    if json {
        let listing = list_json(&summary.platform, &plugins);
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    print!(
        "{}",
        render_list(&summary.platform, bootstrap.plugin_dir(), &plugins)
    );
    Ok(())
}

fn list_json(platform: &Platform, plugins: &[InstalledPlugin]) -> serde_json::Value {
    serde_json::json!({
        "platform": platform.to_string(),
        "platform_key": platform.key(),
        "count": plugins.len(),
        "plugins": plugins,
    })
}

fn render_list(platform: &Platform, plugin_dir: &Path, plugins: &[InstalledPlugin]) -> String {
    let mut out = format!("Platform: {}\nPlugins:  {}\n", platform, plugins.len());
    if plugins.is_empty() {
        out.push_str(&format!("No plugins installed in {}\n", plugin_dir.display()));
        return out;
    }

    out.push_str(&format!("\n{:<24} {:<16} DESCRIPTION\n", "PLUGIN", "KIND"));
    for plugin in plugins {
        out.push_str(&format!(
            "{:<24} {:<16} {}\n",
            plugin.label(),
            plugin.kind(),
            plugin.description()
        ));
    }
    out
}

pub(crate) async fn cmd_search(bootstrap: &Bootstrap, query: &str) -> Result<()> {
    let registry = bootstrap.registry().await?;
    let results = registry
        .search_plugins(query)
        .await
        .context("Registry search failed")?;

    if results.is_empty() {
        println!("No plugins match '{}'", query);
        return Ok(());
    }

    let key = registry.platform_key();
    for meta in &results {
        let marker = if meta.artifact_for(key).is_some() {
            ""
        } else {
            "  (unavailable for this platform)"
        };
        println!("{}@{}  {}{}", meta.name, meta.version, meta.description, marker);
    }
    Ok(())
}

pub(crate) async fn cmd_install(
    bootstrap: &Bootstrap,
    name: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let registry = bootstrap.registry().await?;
    let path = registry.download_plugin(name, cancel).await?;

    let manager = bootstrap.manager();
    manager.discover(cancel).await?;
    match manager.get_plugin(name).await {
        Some(plugin) => println!("Installed {} at {}", plugin.label(), path.display()),
        None => anyhow::bail!(
            "'{}' was installed at {} but did not describe itself; see --verbose output",
            name,
            path.display()
        ),
    }
    Ok(())
}

pub(crate) async fn cmd_remove(bootstrap: &Bootstrap, name: &str) -> Result<()> {
    bootstrap.manager().uninstall(name).await?;
    println!("Removed {}", name);
    Ok(())
}

pub(crate) async fn cmd_update(
    bootstrap: &Bootstrap,
    name: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let registry = bootstrap.registry().await?;
    let advertised = registry
        .update_registry()
        .await
        .context("Failed to refresh the plugin registry")?;
    println!("Registry refreshed: {} plugins available", advertised);

    let manager = bootstrap.manager();
    let targets: Vec<String> = match name {
        Some(name) => vec![name.to_string()],
        None => registry.outdated(&manager.list_plugins().await).await?,
    };

    if targets.is_empty() {
        println!("All plugins are up to date");
        return Ok(());
    }

    let config = bootstrap.config();
    let runner = BatchRunner::new(config.download_concurrency, config.download_timeout())
        .with_progress(
            Duration::from_secs(2),
            Arc::new(|p: BatchProgress| {
                eprintln!("  {}/{} done ({} failed)", p.completed, p.total, p.failed)
            }),
        );
    let client = registry.clone();
    let report = runner
        .run(cancel, targets, move |name: String, token| {
            let client = client.clone();
            async move { client.download_plugin(&name, &token).await.map(|_| ()) }
        })
        .await;

    print!("{}", format_report(&report));
    manager.discover(cancel).await?;

    match report.aggregate_error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

pub(crate) async fn cmd_info(bootstrap: &Bootstrap, name: &str) -> Result<()> {
    let installed = bootstrap.manager().get_plugin(name).await;
    let registry = match bootstrap.registry().await {
        Ok(client) => client.plugin_metadata(name).await,
        Err(e) => Err(e),
    };

    match (&installed, &registry) {
        (None, Err(DevstrapError::PluginNotFound(_))) => {
            return Err(DevstrapError::PluginNotFound(name.to_string()).into())
        }
        (None, Err(e @ DevstrapError::Validation(_))) => {
            anyhow::bail!("{}", e)
        }
        _ => {}
    }

    if let Some(plugin) = &installed {
        print_installed(plugin);
    } else {
        println!("{} (not installed)", name);
    }

    match registry {
        Ok(meta) => {
            println!();
            println!("Registry:");
            println!("  Version:   {}", meta.version);
            if !meta.tags.is_empty() {
                println!("  Tags:      {}", meta.tags.join(", "));
            }
            let platforms: Vec<&str> = meta.platforms.keys().map(String::as_str).collect();
            println!("  Platforms: {}", platforms.join(", "));
        }
        Err(DevstrapError::PluginNotFound(_)) => {
            println!();
            println!("Registry: not listed");
        }
        Err(e) => {
            println!();
            println!("Registry: unavailable ({})", e);
        }
    }
    Ok(())
}

fn print_installed(plugin: &InstalledPlugin) {
    println!("{}", plugin.label());
    if !plugin.description().is_empty() {
        println!("  {}", plugin.description());
    }
    println!("  Kind:       {}", plugin.kind());
    println!("  Path:       {}", plugin.path().display());
    if let Some(author) = plugin.info.author.as_deref() {
        println!("  Author:     {}", author);
    }
    if let Some(repository) = plugin.info.repository.as_deref() {
        println!("  Repository: {}", repository);
    }
    if !plugin.tags().is_empty() {
        println!("  Tags:       {}", plugin.tags().join(", "));
    }
    if plugin.commands().is_empty() {
        return;
    }
    println!("  Commands:");
    for command in plugin.commands() {
        println!("    {:<16} {}", command.name, command.description);
        for flag in &command.flags {
            println!("      {}", flag.help_line());
        }
    }
}

pub(crate) async fn cmd_registry(bootstrap: &Bootstrap) -> Result<()> {
    let registry = bootstrap.registry().await?;
    println!("URL:          {}", registry.registry_url());
    println!("Platform key: {}", registry.platform_key());
    match registry.update_registry().await {
        Ok(count) => println!("Plugins:      {}", count),
        Err(e) => println!("Plugins:      unavailable ({})", e),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devstrap::plugins::{PluginInfo, PluginKind};

    fn ubuntu() -> Platform {
        Platform {
            os: "linux".to_string(),
            distribution: "ubuntu".to_string(),
            version: "22.04".to_string(),
            desktop_env: "gnome".to_string(),
            architecture: "amd64".to_string(),
            package_managers: vec!["apt".to_string()],
        }
    }

    fn installed(name: &str) -> InstalledPlugin {
        let info = PluginInfo {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            description: "Foo tools".to_string(),
            author: None,
            repository: None,
            tags: vec![],
            commands: vec![],
        };
        InstalledPlugin::new(info, Path::new("/plugins").join(name))
    }

    #[test]
    fn test_empty_list_reports_platform_and_zero_plugins() {
        let out = render_list(&ubuntu(), Path::new("/plugins"), &[]);
        assert!(out.contains("Platform: ubuntu 22.04 (linux amd64)"));
        assert!(out.contains("Plugins:  0"));
        assert!(out.contains("No plugins installed in /plugins"));
    }

    #[test]
    fn test_list_renders_each_plugin() {
        let out = render_list(&ubuntu(), Path::new("/plugins"), &[installed("foo")]);
        assert!(out.contains("Plugins:  1"));
        assert!(out.contains("foo@1.0.0"));
        assert!(out.contains(PluginKind::Base.as_str()));
    }

    #[test]
    fn test_list_json_includes_platform() {
        let value = list_json(&ubuntu(), &[installed("foo")]);
        assert_eq!(value["platform"], "ubuntu 22.04 (linux amd64)");
        assert_eq!(value["platform_key"], "linux-amd64");
        assert_eq!(value["count"], 1);
        assert_eq!(value["plugins"][0]["name"], "foo");
    }
}
