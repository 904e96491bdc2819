use anyhow::{bail, Context, Result};
use chrono::{DateTime, SecondsFormat};

use crate::config;
use crate::model::outcome::Direction;
use crate::providers;
use crate::scheduler;
use crate::store::IdentityStore;
use crate::sync::Reconciler;

const DEFAULT_STATUS_LIMIT: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Scheduler loop until ctrl-c.
    Run,
    Discover,
    Post,
    Status { limit: u32 },
    Health,
    Help,
}

/// Parse the arguments after the program name.
///
///   jiratime
///   jiratime discover
///   jiratime status -n 50
pub fn parse_command(args: &[String]) -> Result<Command> {
    let Some((first, rest)) = args.split_first() else {
        return Ok(Command::Run);
    };
    let command = match first.as_str() {
        "run" => Command::Run,
        "discover" => Command::Discover,
        "post" => Command::Post,
        "status" => return parse_status_args(rest),
        "health" => Command::Health,
        "help" | "-h" | "--help" => Command::Help,
        other => bail!("Unknown command: {other}\n\nRun `jiratime help` for usage."),
    };
    if let Some(extra) = rest.first() {
        bail!("Unexpected argument for `{first}`: {extra}");
    }
    Ok(command)
}

fn parse_status_args(args: &[String]) -> Result<Command> {
    let mut limit = DEFAULT_STATUS_LIMIT;
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "-n" | "--limit" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    bail!("Missing value for -n/--limit flag");
                };
                limit = value
                    .parse()
                    .with_context(|| format!("Invalid limit: {value}"))?;
            }
            other => bail!("Usage: jiratime status [-n <limit>]\n\nUnexpected argument: {other}"),
        }
        i += 1;
    }
    Ok(Command::Status { limit })
}

pub async fn execute(command: Command) -> Result<()> {
    match command {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Status { limit } => handle_status(limit),
        Command::Run => handle_run().await,
        Command::Discover => handle_discover().await,
        Command::Post => handle_post().await,
        Command::Health => handle_health().await,
    }
}

fn open_store(config: &config::AppConfig) -> Result<IdentityStore> {
    let path = config.store_path();
    IdentityStore::open(&path)
        .with_context(|| format!("Failed to open state database at {}", path.display()))
}

fn build_reconciler() -> Result<(Reconciler, tokio::sync::watch::Receiver<bool>)> {
    let config = config::load_config()?;
    let store = open_store(&config)?;
    let (tracker, platform) = providers::create_providers(&config)?;
    let shutdown = scheduler::shutdown_on_ctrl_c();
    let reconciler = Reconciler::new(tracker, platform, store, config, shutdown.clone());
    Ok((reconciler, shutdown))
}

async fn handle_run() -> Result<()> {
    let (reconciler, shutdown) = build_reconciler()?;
    reconciler
        .verify_access()
        .await
        .context("Startup verification failed")?;
    let config = reconciler.config().clone();
    scheduler::run(&reconciler, &config, shutdown).await;
    Ok(())
}

async fn handle_discover() -> Result<()> {
    let (reconciler, _shutdown) = build_reconciler()?;
    let summary = reconciler.run_discovery_cycle().await?;
    println!("{summary}");
    if !summary.aborted {
        let report = reconciler.run_tag_refresh().await?;
        println!(
            "refresh: {} refreshed, {} failed",
            report.refreshed, report.failed
        );
    }
    Ok(())
}

async fn handle_post() -> Result<()> {
    let (reconciler, _shutdown) = build_reconciler()?;
    let summary = reconciler.run_posting_cycle(None).await?;
    println!("{summary}");
    Ok(())
}

async fn handle_health() -> Result<()> {
    let (reconciler, _shutdown) = build_reconciler()?;
    reconciler.verify_access().await?;
    println!("ok: state database, Jira and platform reachable");
    Ok(())
}

/// Cursors and permanently failed records, read from the store only.
fn handle_status(limit: u32) -> Result<()> {
    let config = config::load_config()?;
    let store = open_store(&config)?;

    println!("State:       {}", config.store_path().display());
    println!("Mapped tags: {}", store.mapping_count()?);
    for direction in Direction::ALL {
        println!(
            "{:<12} {}",
            format!("{direction}:"),
            format_cursor(store.get_cursor(direction)?)
        );
    }

    for direction in Direction::ALL {
        let failures = store.failures(direction, limit)?;
        if failures.is_empty() {
            continue;
        }
        println!();
        println!("FAILED ({direction}):");
        for failure in failures {
            println!(
                "  {}  attempts {}  {}  ({})",
                failure.record_id,
                failure.attempt_count,
                failure.reason.as_deref().unwrap_or("no reason recorded"),
                failure.updated_at
            );
        }
    }
    Ok(())
}

fn format_cursor(cursor: Option<i64>) -> String {
    match cursor.and_then(DateTime::from_timestamp_millis) {
        Some(at) => at.to_rfc3339_opts(SecondsFormat::Millis, true),
        None if cursor.is_some() => "invalid".to_string(),
        None => "never".to_string(),
    }
}

pub fn print_help() {
    println!("jiratime - sync Jira issues and posted time with the time-tracking platform\n");
    println!("USAGE:");
    println!("  jiratime                 Run discovery and posting on their schedules");
    println!("  jiratime run             Same as above");
    println!("  jiratime discover        Run one discovery cycle and one tag refresh batch");
    println!("  jiratime post            Run one posting cycle");
    println!("  jiratime status          Show cursors and permanently failed records");
    println!("  jiratime health          Check the state database and both APIs");
    println!();
    println!("STATUS OPTIONS:");
    println!("  -n, --limit <count>  Failed records to list per direction (default 20)");
    println!();
    println!("CONFIG:");
    println!("  ~/.jiratime/config.toml, or the path in JIRATIME_CONFIG");
    println!("  Set RUST_LOG=debug for cycle phase logging");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_args_runs_the_scheduler() {
        assert_eq!(parse_command(&args(&[])).unwrap(), Command::Run);
    }

    #[test]
    fn parse_simple_commands() {
        assert_eq!(parse_command(&args(&["run"])).unwrap(), Command::Run);
        assert_eq!(parse_command(&args(&["discover"])).unwrap(), Command::Discover);
        assert_eq!(parse_command(&args(&["post"])).unwrap(), Command::Post);
        assert_eq!(parse_command(&args(&["health"])).unwrap(), Command::Health);
    }

    #[test]
    fn parse_help_flags() {
        for flag in ["help", "-h", "--help"] {
            assert_eq!(parse_command(&args(&[flag])).unwrap(), Command::Help);
        }
    }

    #[test]
    fn status_defaults_limit() {
        assert_eq!(
            parse_command(&args(&["status"])).unwrap(),
            Command::Status { limit: 20 }
        );
    }

    #[test]
    fn status_with_limit() {
        assert_eq!(
            parse_command(&args(&["status", "-n", "5"])).unwrap(),
            Command::Status { limit: 5 }
        );
        assert_eq!(
            parse_command(&args(&["status", "--limit", "100"])).unwrap(),
            Command::Status { limit: 100 }
        );
    }

    #[test]
    fn status_missing_limit_value_fails() {
        let err = parse_command(&args(&["status", "-n"])).unwrap_err();
        assert!(err.to_string().contains("Missing value"));
    }

    #[test]
    fn status_bad_limit_fails() {
        let err = parse_command(&args(&["status", "-n", "lots"])).unwrap_err();
        assert!(err.to_string().contains("Invalid limit"));
    }

    #[test]
    fn unknown_command_fails() {
        let err = parse_command(&args(&["sync"])).unwrap_err();
        assert!(err.to_string().contains("Unknown command: sync"));
    }

    #[test]
    fn extra_argument_fails() {
        let err = parse_command(&args(&["post", "now"])).unwrap_err();
        assert!(err.to_string().contains("Unexpected argument"));
    }

    #[test]
    fn cursor_formatting() {
        assert_eq!(format_cursor(None), "never");
        assert_eq!(format_cursor(Some(1_546_387_200_000)), "2019-01-02T00:00:00.000Z");
    }
}
