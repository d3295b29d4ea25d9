//! stagehand CLI entry point.

use anyhow::Result;
use clap::Parser;
use stagehand::callback::{DefaultCallback, JsonCallback};
use stagehand::cli::{Cli, OutputFormat};
use stagehand::config::Config;
use stagehand::connection::ConnectionDefaults;
use stagehand::error::Error;
use stagehand::executor::{PlaybookRunner, RunnerOptions};
use stagehand::inventory::Inventory;
use stagehand::playbook::{Playbook, TaskNode};
use stagehand::vars::parse_extra_vars;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| {
        eprintln!("warning: {}", e);
        Config::default()
    });

    let exit_code = match run(cli, config).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("ERROR! {}", err);
            err.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn init_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(verbosity >= 3))
        .with(env_filter)
        .init();
}

async fn run(cli: Cli, config: Config) -> Result<i32, Error> {
    // Inventory: flag, then environment (via the flag's env hook), then
    // the config file; an absent inventory is valid and empty.
    let inventory = match cli
        .inventory
        .clone()
        .or_else(|| config.defaults.inventory.clone().map(PathBuf::from))
    {
        Some(path) => Inventory::load(path)?,
        None => Inventory::new(),
    };

    // Parse every playbook up front; parse errors and unsupported
    // constructs abort before any host is contacted.
    let mut playbooks = Vec::with_capacity(cli.playbooks.len());
    for path in &cli.playbooks {
        playbooks.push(Playbook::load(path)?);
    }

    if cli.is_diagnostic() {
        return Ok(run_diagnostics(&cli, &inventory, &playbooks));
    }

    let vault_password = resolve_vault_password(&cli)?;
    let become_password = if cli.ask_become_pass {
        Some(
            dialoguer::Password::new()
                .with_prompt("BECOME password")
                .allow_empty_password(true)
                .interact()
                .map_err(|e| Error::Config(format!("password prompt failed: {}", e)))?,
        )
    } else {
        None
    };

    let mut extra_vars = indexmap::IndexMap::new();
    for spec in &cli.extra_vars {
        let parsed = parse_extra_vars(spec)?;
        extra_vars.extend(parsed);
    }

    let transport = match cli.connection.as_deref() {
        Some(name) => Some(
            name.parse()
                .map_err(|e| Error::Config(format!("--connection: {}", e)))?,
        ),
        None => None,
    };
    let host_key_policy = cli
        .host_key_policy
        .as_deref()
        .or(config.ssh.host_key_policy.as_deref())
        .map(|p| p.parse().map_err(Error::Config))
        .transpose()?
        .unwrap_or_default();

    let options = RunnerOptions {
        forks: if cli.forks != 5 {
            cli.forks
        } else {
            config.defaults.forks.unwrap_or(cli.forks)
        },
        check_mode: cli.check,
        diff_mode: cli.diff,
        extra_vars,
        limit: cli.limit.clone(),
        tags: cli.tags.clone(),
        skip_tags: cli.skip_tags.clone(),
        force_handlers: cli.force_handlers,
        r#become: cli.r#become || config.privilege_escalation.r#become,
        become_user: cli
            .become_user
            .clone()
            .or(config.privilege_escalation.become_user.clone()),
        become_method: cli
            .become_method
            .clone()
            .or(config.privilege_escalation.become_method.clone()),
        become_password,
        timeout: cli.timeout.or(config.defaults.timeout),
        vault_password,
        connection: ConnectionDefaults {
            remote_user: cli
                .remote_user
                .clone()
                .or(config.defaults.remote_user.clone()),
            private_key: cli
                .private_key
                .as_ref()
                .map(|p| p.display().to_string())
                .or(config.ssh.private_key_file.clone()),
            timeout: cli.timeout.or(config.defaults.timeout),
            transport,
            host_key_policy,
        },
    };

    let mut runner = PlaybookRunner::new(inventory, options);
    match cli.output {
        OutputFormat::Human => {
            runner.add_callback(Box::new(DefaultCallback::new(cli.verbose, cli.diff)))
        }
        OutputFormat::Json => runner.add_callback(Box::new(JsonCallback::new())),
    }

    // Graceful shutdown on interrupt: no new tasks are scheduled, and
    // in-flight transports get a short grace period.
    let interrupt = runner.interrupt_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\ninterrupt received, shutting down");
            interrupt.store(true, Ordering::SeqCst);
        }
    });

    let mut worst = 0;
    for playbook in &playbooks {
        let report = runner.run(playbook).await?;
        worst = worst.max(report.exit_code());
    }
    Ok(worst)
}

fn resolve_vault_password(cli: &Cli) -> Result<Option<String>, Error> {
    if let Some(path) = &cli.vault_password_file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("vault password file: {}", e)))?;
        return Ok(Some(
            content.lines().next().unwrap_or_default().to_string(),
        ));
    }
    if cli.ask_vault_pass {
        let password = dialoguer::Password::new()
            .with_prompt("Vault password")
            .interact()
            .map_err(|e| Error::Config(format!("password prompt failed: {}", e)))?;
        return Ok(Some(password));
    }
    Ok(None)
}

/// The diagnostic dry runs: parse everything, print structure, contact no
/// host.
fn run_diagnostics(cli: &Cli, inventory: &Inventory, playbooks: &[Playbook]) -> i32 {
    for playbook in playbooks {
        for play in &playbook.plays {
            let name = if play.name.is_empty() {
                &play.hosts
            } else {
                &play.name
            };
            println!("play: {}", name);

            if cli.list_hosts {
                match inventory.select(&play.hosts) {
                    Ok(hosts) => {
                        println!("  hosts ({}):", hosts.len());
                        for host in hosts {
                            println!("    {}", host.name);
                        }
                    }
                    Err(e) => println!("  hosts: error: {}", e),
                }
            }

            if cli.list_tasks || cli.list_tags {
                let mut tasks = Vec::new();
                let mut tags = Vec::new();
                for node in play
                    .pre_tasks
                    .iter()
                    .chain(play.roles.iter().flat_map(|r| r.tasks.iter()))
                    .chain(play.tasks.iter())
                    .chain(play.post_tasks.iter())
                {
                    collect_nodes(node, &mut tasks, &mut tags);
                }

                if cli.list_tasks {
                    println!("  tasks:");
                    for task in &tasks {
                        println!("    {}", task);
                    }
                }
                if cli.list_tags {
                    tags.sort();
                    tags.dedup();
                    println!("  tags: [{}]", tags.join(", "));
                }
            }
        }
    }

    if cli.syntax_check {
        println!("syntax check passed");
    }
    0
}

fn collect_nodes(node: &TaskNode, tasks: &mut Vec<String>, tags: &mut Vec<String>) {
    match node {
        TaskNode::Task(task) => {
            tasks.push(task.display_name());
            tags.extend(task.tags.iter().cloned());
        }
        TaskNode::Block(block) => {
            tags.extend(block.tags.iter().cloned());
            for child in block
                .body
                .iter()
                .chain(block.rescue.iter())
                .chain(block.always.iter())
            {
                collect_nodes(child, tasks, tags);
            }
        }
    }
}
