//! `kickbot-sync` - operator CLI over the offline sync queue

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use kickbot_sync_core::{
    Credential, Dashboard, Dispatched, DrainReport, Entity, LiveEvent, MutationRequest, Notice,
    Stats, SyncClient, SyncConfig,
};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Prints what the sync core hands to the view
struct ConsoleDashboard;

impl Dashboard for ConsoleDashboard {
    fn render_collection(&self, entity: Entity, items: &[Value]) {
        println!("{entity}: {} item(s)", items.len());
    }

    fn render_stats(&self, stats: &Stats) {
        println!("stats: {} run(s), {} error(s)", stats.runs, stats.errors);
    }

    fn set_dependency_health(&self, redis_online: bool) {
        if !redis_online {
            println!("! dependency offline, bots are paused");
        }
    }

    fn notify(&self, notice: &Notice) {
        match notice {
            Notice::Success(_) => println!("ok: {}", notice.message()),
            Notice::Failure(_) => eprintln!("error: {}", notice.message()),
        }
    }
}

fn cli() -> Command {
    Command::new("kickbot-sync")
        .version(kickbot_sync_core::VERSION)
        .about("Offline sync queue for the kickbot dashboard")
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("base-url")
                .long("base-url")
                .global(true)
                .help("Server root, overrides the configuration file"),
        )
        .arg(
            Arg::new("state-dir")
                .long("state-dir")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Directory holding the session document and versioned store"),
        )
        .arg(
            Arg::new("intercept")
                .long("intercept")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Store unreachable dashboard POSTs in the versioned store"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON"),
        )
        .subcommand(Command::new("drain").about("Push every queued mutation now"))
        .subcommand(Command::new("pull").about("Fetch pending changes and refresh collections"))
        .subcommand(Command::new("status").about("Show auth, network, queue and dependency state"))
        .subcommand(
            Command::new("queue")
                .about("Inspect the durable queues")
                .subcommand_required(true)
                .subcommand(Command::new("list").about("Print pending mutations as JSON"))
                .subcommand(Command::new("clear").about("Discard pending mutations")),
        )
        .subcommand(
            Command::new("group")
                .about("Group mutations")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create")
                        .arg(Arg::new("name").long("name").required(true))
                        .arg(Arg::new("target").long("target").required(true))
                        .arg(
                            Arg::new("interval")
                                .long("interval")
                                .default_value("60")
                                .value_parser(value_parser!(u32))
                                .help("Seconds between messages"),
                        ),
                ),
        )
        .subcommand(
            Command::new("account")
                .about("Account mutations")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create")
                        .arg(Arg::new("username").long("username").required(true))
                        .arg(Arg::new("password").long("password").required(true))
                        .arg(Arg::new("proxy").long("proxy").default_value(""))
                        .arg(
                            Arg::new("messages-file")
                                .long("messages-file")
                                .default_value("messages.txt"),
                        )
                        .arg(
                            Arg::new("group-id")
                                .long("group-id")
                                .required(true)
                                .value_parser(value_parser!(i64)),
                        ),
                ),
        )
        .subcommand(
            Command::new("bot")
                .about("Bot mutations")
                .subcommand_required(true)
                .subcommand(
                    Command::new("command")
                        .arg(
                            Arg::new("id")
                                .long("id")
                                .required(true)
                                .value_parser(value_parser!(i64)),
                        )
                        .arg(Arg::new("cmd").long("cmd").required(true))
                        .arg(Arg::new("message").long("message").default_value("")),
                ),
        )
        .subcommand(
            Command::new("login")
                .about("Store a credential pair")
                .arg(Arg::new("access-token").long("access-token").required(true))
                .arg(Arg::new("refresh-token").long("refresh-token").required(true)),
        )
        .subcommand(
            Command::new("watch")
                .about("Load everything, run periodic triggers and route event names read from stdin"),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.compact().try_init();
    }
}

fn load_config(matches: &ArgMatches) -> Result<SyncConfig> {
    let mut config = match matches.get_one::<PathBuf>("config") {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::new(),
    };
    if let Some(url) = matches.get_one::<String>("base-url") {
        config = config.with_base_url(url.as_str());
    }
    if let Some(dir) = matches.get_one::<PathBuf>("state-dir") {
        config = config.with_state_dir(dir.clone());
    }
    if matches.get_flag("intercept") {
        config = config.with_interception(true);
    }
    Ok(config)
}

fn text<'a>(args: &'a ArgMatches, name: &str) -> Result<&'a str> {
    args.get_one::<String>(name)
        .map(String::as_str)
        .with_context(|| format!("missing --{name}"))
}

fn number<T: Clone + Send + Sync + 'static>(args: &ArgMatches, name: &str) -> Result<T> {
    args.get_one::<T>(name)
        .cloned()
        .with_context(|| format!("missing --{name}"))
}

fn describe(report: DrainReport) -> String {
    match report {
        DrainReport::AlreadyRunning => "drain already running".to_string(),
        DrainReport::Offline => "offline, nothing sent".to_string(),
        DrainReport::Empty => "nothing queued".to_string(),
        DrainReport::Pushed { count } => format!("pushed {count} mutation(s)"),
        DrainReport::Failed { pushed, pending } => {
            format!("drain stopped: {pushed} pushed, {pending} still queued")
        }
    }
}

async fn submit(client: &SyncClient, request: MutationRequest) -> Result<()> {
    match client.submit(request).await? {
        Dispatched::Delivered(body) => println!("{body}"),
        Dispatched::Queued(mutation) => {
            println!("queued {} {}", mutation.entity, mutation.action);
        }
        Dispatched::Deferred => println!("stored for background replay"),
    }
    Ok(())
}

async fn watch(client: &SyncClient) -> Result<()> {
    client.start().await;
    let _background = client.spawn_background();

    let (tx, rx) = tokio::sync::mpsc::channel(64);
    let events = client.spawn_event_loop(rx);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let name = line.trim();
                if name.is_empty() {
                    continue;
                }
                match LiveEvent::from_name(name) {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    None => tracing::warn!(event = name, "unknown event name ignored"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
    }

    drop(tx);
    events.await.context("event loop panicked")?;
    Ok(())
}

async fn run(matches: ArgMatches) -> Result<()> {
    let config = load_config(&matches)?;
    let client = SyncClient::open(config, Arc::new(ConsoleDashboard))
        .context("failed to open sync client")?;

    match matches.subcommand() {
        Some(("drain", _)) => println!("{}", describe(client.drain().await)),
        Some(("pull", _)) => {
            let deltas = client.pull().await?;
            println!("{} change(s) received", deltas.len());
        }
        Some(("status", _)) => {
            let pending = client.dispatcher().pending().await;
            println!("server:  {}", client.config().base_url);
            println!("auth:    {:?}", client.auth_state());
            println!("queued:  {}", pending.len());
            match client.check_health().await {
                Some(true) => println!("health:  dependency online"),
                Some(false) => println!("health:  dependency offline"),
                None => println!("health:  server unreachable"),
            }
        }
        Some(("queue", args)) => match args.subcommand() {
            Some(("list", _)) => {
                let pending = client.dispatcher().pending().await;
                println!("{}", serde_json::to_string_pretty(&pending)?);
            }
            Some(("clear", _)) => {
                let discarded = client.dispatcher().discard_pending().await?;
                println!("discarded {discarded} mutation(s)");
            }
            _ => bail!("unknown queue command"),
        },
        Some(("group", args)) => match args.subcommand() {
            Some(("create", args)) => {
                let request = MutationRequest::create_group(
                    text(args, "name")?,
                    text(args, "target")?,
                    number::<u32>(args, "interval")?,
                );
                submit(&client, request).await?;
            }
            _ => bail!("unknown group command"),
        },
        Some(("account", args)) => match args.subcommand() {
            Some(("create", args)) => {
                let request = MutationRequest::create_account(
                    text(args, "username")?,
                    text(args, "password")?,
                    text(args, "proxy")?,
                    text(args, "messages-file")?,
                    number::<i64>(args, "group-id")?,
                );
                submit(&client, request).await?;
            }
            _ => bail!("unknown account command"),
        },
        Some(("bot", args)) => match args.subcommand() {
            Some(("command", args)) => {
                let request = MutationRequest::bot_command(
                    number::<i64>(args, "id")?,
                    text(args, "cmd")?,
                    text(args, "message")?,
                );
                submit(&client, request).await?;
            }
            _ => bail!("unknown bot command"),
        },
        Some(("login", args)) => {
            let credential =
                Credential::new(text(args, "access-token")?, text(args, "refresh-token")?);
            client.login(&credential).await?;
            println!("credentials stored");
        }
        Some(("watch", _)) => watch(&client).await?,
        _ => bail!("no command given"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json"));
    run(matches).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn global_flags_override_defaults() {
        let matches = cli()
            .try_get_matches_from([
                "kickbot-sync",
                "--base-url",
                "http://example.test:5000",
                "--intercept",
                "drain",
            ])
            .unwrap();
        let config = load_config(&matches).unwrap();
        assert_eq!(config.base_url, "http://example.test:5000");
        assert!(config.intercept_requests);
    }

    #[test]
    fn group_create_parses_interval() {
        let matches = cli()
            .try_get_matches_from([
                "kickbot-sync", "group", "create", "--name", "G1", "--target", "chan",
                "--interval", "90",
            ])
            .unwrap();
        let Some(("group", group)) = matches.subcommand() else {
            panic!("group subcommand expected");
        };
        let Some(("create", args)) = group.subcommand() else {
            panic!("create subcommand expected");
        };
        assert_eq!(text(args, "name").unwrap(), "G1");
        assert_eq!(number::<u32>(args, "interval").unwrap(), 90);
    }

    #[test]
    fn drain_reports_read_naturally() {
        assert_eq!(describe(DrainReport::Pushed { count: 2 }), "pushed 2 mutation(s)");
        assert_eq!(
            describe(DrainReport::Failed { pushed: 1, pending: 3 }),
            "drain stopped: 1 pushed, 3 still queued"
        );
    }
}
