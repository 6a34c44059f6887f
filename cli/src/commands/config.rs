// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use crate::config::{ConvoyConfig, CONFIG_PATH_ENV};

const TEMPLATE: &str = include_str!("../../templates/convoy-config.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the resolved manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./convoy-config.yaml)
        #[arg(short, long, default_value = "./convoy-config.yaml")]
        output: PathBuf,

        /// Write the commented template instead of bare defaults
        #[arg(long)]
        examples: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml),
        ConfigCommand::Validate { file } => validate(file.or(config_override)),
        ConfigCommand::Generate { output, examples } => generate(output, examples),
    }
}

fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = ConvoyConfig::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. {}: {}",
            CONFIG_PATH_ENV,
            std::env::var(CONFIG_PATH_ENV)
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./convoy-config.yaml");
        println!("  4. ~/.convoy/config.yaml");
        println!("  5. /etc/convoy/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", config.to_yaml()?);
        return Ok(());
    }

    let spec = &config.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Host:".bold());
    println!("  Name: {}", config.metadata.name);
    println!(
        "  Listen: {}:{}",
        spec.network.bind_address, spec.network.port
    );
    println!("  Storage: {:?}", spec.storage.resolve());
    println!();

    println!("{}", "Supervisor:".bold());
    println!("  Strategy: {:?}", spec.orchestrator.strategy);
    println!(
        "  Max concurrent agents: {}",
        spec.orchestrator.max_concurrent_agents
    );
    println!(
        "  Default timeout: {}",
        humantime_serde::re::humantime::format_duration(spec.orchestrator.default_timeout)
    );
    println!();

    let coordinator = &spec.coordinator;
    println!("{}", "Coordinator:".bold());
    println!("  Load balancing: {}", coordinator.strategy);
    println!("  Max retries: {}", coordinator.max_retries);
    println!(
        "  Local node: {}:{} (capacity {})",
        coordinator.local_node.address,
        coordinator.local_node.port,
        coordinator.local_node.max_capacity
    );
    let capabilities: Vec<&str> = coordinator
        .local_node
        .capabilities
        .iter()
        .map(|c| c.as_str())
        .collect();
    println!("  Capabilities: {}", capabilities.join(", "));
    println!();

    Ok(())
}

fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config =
        ConvoyConfig::load_or_default(config_path).context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        TEMPLATE.to_string()
    } else {
        ConvoyConfig::default().to_yaml()?
    };

    std::fs::write(&output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_generate_then_validate() {
        let dir = tempfile::tempdir().unwrap();
        for examples in [false, true] {
            let output = dir.path().join(format!("convoy-{examples}.yaml"));
            handle_command(
                ConfigCommand::Generate {
                    output: output.clone(),
                    examples,
                },
                None,
            )
            .await
            .unwrap();

            handle_command(ConfigCommand::Validate { file: Some(output) }, None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        std::fs::write(
            &path,
            "apiVersion: convoy/v1\nkind: ConvoyConfig\nmetadata:\n  name: x\nspec:\n  orchestrator:\n    max_concurrent_agents: 0\n",
        )
        .unwrap();

        let result = handle_command(ConfigCommand::Validate { file: Some(path) }, None).await;
        assert!(result.is_err());
    }
}
