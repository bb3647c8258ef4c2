//! toolbridge command line.
//!
//! Connects the providers from `mcp.json`, lists their tools, runs single
//! calls through the approval gate (prompting on the terminal), and manages
//! approval rules.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use dotenvy::dotenv;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use toolbridge::approval::{ApprovalEngine, JsonFilePreferences, PendingBatch};
use toolbridge::config::{AppConfig, Cli, Command, RulesCommand};
use toolbridge::connector::{ConnectorRegistry, Dispatch, ToolCall, ToolOutcome};
use toolbridge::mcp::config::load_mcp_config;
use toolbridge::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present)
    let _ = dotenv();

    let cli = Cli::parse();
    if cli.json_logs {
        telemetry::init_json();
    } else {
        telemetry::init();
    }

    let config = AppConfig::from_cli(&cli).context("failed to load configuration")?;
    let approval = Arc::new(
        ApprovalEngine::new(Arc::new(JsonFilePreferences::new(config.preferences_path())))
            .context("failed to load approval preferences")?,
    );

    match cli.command.unwrap_or(Command::Tools { json: false }) {
        Command::Rules { action } => rules(&approval, action),
        Command::Tools { json } => {
            let registry = start(&config, approval).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&registry.function_definitions())?
                );
            } else {
                for tool in registry.tools() {
                    println!("{:<40} {}", tool.display_name, tool.description);
                }
            }
            registry.disconnect_all().await;
            Ok(())
        }
        Command::Status => {
            let registry = start(&config, approval).await?;
            for status in registry.statuses() {
                let enabled = if status.enabled { "" } else { " (disabled)" };
                println!(
                    "{:<20} {:<30} {} tools{enabled}",
                    status.id, status.state, status.tool_count
                );
            }
            registry.disconnect_all().await;
            Ok(())
        }
        Command::Call { tool, args, yes } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }

            let registry = start(&config, Arc::clone(&approval)).await?;
            let prompt = tokio::spawn(answer_approvals(Arc::clone(&approval), yes));

            let cancel = CancellationToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupted, cancelling call");
                        cancel.cancel();
                    }
                });
            }

            let dispatch = registry
                .execute(ToolCall::from_json(tool, arguments), &cancel)
                .await;
            prompt.abort();
            registry.disconnect_all().await;
            report(&dispatch)
        }
    }
}

/// Build the registry from `mcp.json` and connect every enabled provider.
async fn start(
    config: &AppConfig,
    approval: Arc<ApprovalEngine>,
) -> anyhow::Result<ConnectorRegistry> {
    let path = &config.connectors.config_path;
    let mcp = load_mcp_config(path)?;
    let registry = ConnectorRegistry::from_config(
        &mcp,
        config.transport_settings(),
        config.timeouts(),
        approval,
    )
    .with_context(|| format!("invalid provider config {path}"))?;

    for (id, outcome) in registry.connect_all().await {
        if let Err(e) = outcome {
            eprintln!("connector '{id}' failed: {e}");
        }
    }
    info!(tools = registry.tools().len(), "Tool catalog ready");
    Ok(registry)
}

fn report(dispatch: &Dispatch) -> anyhow::Result<()> {
    match dispatch {
        Dispatch::Executed(result) => match &result.outcome {
            ToolOutcome::Success { content } => {
                println!("{content}");
                Ok(())
            }
            ToolOutcome::Failure(failure) => {
                bail!("{} failed ({:?}): {}", result.tool_name, failure.kind, failure.message)
            }
        },
        Dispatch::Denied(decision) => {
            bail!("{} was denied ({:?})", decision.tool_name, decision.source)
        }
    }
}

/// Terminal approval UI: one y/n/a prompt per pending request.
async fn answer_approvals(approval: Arc<ApprovalEngine>, auto_approve: bool) {
    let mut batches = approval.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stderr = tokio::io::stderr();
    let mut asked = HashSet::new();

    loop {
        let snapshot: Vec<PendingBatch> = batches.borrow_and_update().clone();
        for request in snapshot.iter().flat_map(|b| &b.requests) {
            if !asked.insert(request.call_id.clone()) {
                continue;
            }
            if auto_approve {
                approval.approve(&request.call_id, false);
                continue;
            }

            let prompt = format!(
                "Allow {} with {}? [y]es / [n]o / [a]lways this session: ",
                request.tool_name, request.arguments
            );
            let _ = stderr.write_all(prompt.as_bytes()).await;
            let _ = stderr.flush().await;

            let answer = lines.next_line().await.ok().flatten().unwrap_or_default();
            match answer.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => approval.approve(&request.call_id, false),
                "a" | "always" => approval.approve(&request.call_id, true),
                _ => approval.deny(&request.call_id),
            };
        }
        if batches.changed().await.is_err() {
            return;
        }
    }
}

fn rules(approval: &ApprovalEngine, action: RulesCommand) -> anyhow::Result<()> {
    match action {
        RulesCommand::List => {
            let settings = approval.settings();
            println!(
                "approval: {}",
                if settings.enabled { "on" } else { "off (all calls approved)" }
            );
            for rule in settings.rules {
                println!(
                    "{}  {:<5} {:<9} {:<8} {}",
                    rule.id,
                    format!("{:?}", rule.rule_type).to_lowercase(),
                    format!("{:?}", rule.scope).to_lowercase(),
                    if rule.enabled { "enabled" } else { "disabled" },
                    rule.pattern
                );
            }
        }
        RulesCommand::Add {
            pattern,
            rule_type,
            scope,
        } => {
            let rule = approval.add_rule(pattern, rule_type, scope)?;
            println!("{}", rule.id);
        }
        RulesCommand::Remove { id } => {
            if !approval.remove_rule(&id)? {
                bail!("no rule with id {id}");
            }
        }
        RulesCommand::Enable { id } => {
            if !approval.set_rule_enabled(&id, true)? {
                bail!("no rule with id {id}");
            }
        }
        RulesCommand::Disable { id } => {
            if !approval.set_rule_enabled(&id, false)? {
                bail!("no rule with id {id}");
            }
        }
        RulesCommand::On => approval.set_enabled(true)?,
        RulesCommand::Off => approval.set_enabled(false)?,
    }
    Ok(())
}
