//! Validate a config file without touching the kernel

use anyhow::Result;
use cli_lib::MonitorConfig;
use owo_colors::OwoColorize;
use std::path::Path;

pub async fn run(config_path: &Path) -> Result<()> {
    let config = MonitorConfig::load(config_path)?;

    println!("{} {} is valid", "✓".green(), config_path.display().bold());
    println!();

    println!("{}", "Watches:".bold());
    for (path, mask, recursive) in config.watch_specs()? {
        let scope = if recursive { " (recursive)" } else { "" };
        println!("  {}{} {}", path.display().cyan(), scope.dimmed(), mask.to_string().dimmed());
    }
    println!();

    let engine = config.build_engine()?;
    println!("{} {}", "Rules".bold(), "(evaluation order):".dimmed());
    for name in engine.rule_names() {
        println!("  {}", name);
    }
    println!();

    println!(
        "Sink: capacity {}, overflow {:?}",
        config.sink.capacity, config.sink.overflow
    );
    match (config.journal.enabled, &config.journal.path) {
        (true, Some(path)) => println!(
            "Journal: {} (keep {})",
            path.display(),
            config.journal.retain_count
        ),
        _ => println!("Journal: {}", "disabled".dimmed()),
    }

    Ok(())
}
