//! `wold`: register, inspect and process the assets under one root.
//!
//! Every command prints its result as JSON on stdout; diagnostics go to
//! stderr and to the `app_wold.log` logger under the asset root.

mod cli;

use crate::cli::{
    CacheCommand, ChannelArgs, Cli, Command, DepsCommand, ErrorsCommand, LogsCommand, SettingsCommand, TriggerArgs,
    VersionsCommand,
};
use clap::Parser;
use miette::{IntoDiagnostic, Result, miette};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::fmt::Debug;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};
use wold_config::Config;
use wold_observe::{ErrorQuery, Level, LoggerOptions, Severity};
use wold_registry::{Assets, Channels, EventPayload, Job, NewVersion, RegisterOptions, Resource};

const APP_LOGGER: &str = "wold";
const APP_LOG_TYPE: &str = "app";

/// `Exn` trees print their whole chain with `{:?}`.
fn report(err: impl Debug) -> miette::Report {
    miette!("{err:?}")
}

fn json_of<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).into_diagnostic()
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn init_tracing(assets: &Assets, config: &Config, verbose: u8) -> Result<()> {
    let directive = match verbose {
        0 => config.logging.level.clone(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&directive).into_diagnostic()?,
    };
    let options = LoggerOptions {
        log_type: APP_LOG_TYPE.to_string(),
        level: config.logging.level.parse().unwrap_or(Level::Info),
        max_size: config.logging.max_size,
        backup_count: config.logging.backup_count,
        compress_backups: config.logging.compress_backups,
    };
    let file = assets.logs.create_logger(APP_LOGGER, options).await.map_err(report)?;
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file))
        .try_init()
        .into_diagnostic()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).map_err(report)?;
    if let Some(root) = cli.assets {
        config.assets_root = root;
    }
    let assets = Assets::open(&config).await.map_err(report)?;
    init_tracing(&assets, &config, cli.verbose).await?;
    tracing::debug!(root = %config.assets_root.display(), command = ?cli.command, "Running");

    let output = match run(&assets, cli.command).await {
        Ok(output) => output,
        Err(err) => {
            tracing::error!(error = %err, "Command failed");
            return Err(err);
        },
    };
    println!("{}", serde_json::to_string_pretty(&output).into_diagnostic()?);
    Ok(())
}

async fn run(assets: &Assets, command: Command) -> Result<Value> {
    let registries = &assets.registries;
    match command {
        Command::Register { kind, path, name, depends_on } => {
            let options = RegisterOptions { name, ..RegisterOptions::default() }.depends_on(depends_on);
            registries.get(kind).register(&path, options).await.map_err(report)
        },
        Command::Get { kind, name } => match registries.get(kind).get(&name).await.map_err(report)? {
            Some(record) => Ok(record),
            None => Err(miette!("no {kind} named `{name}`")),
        },
        Command::List { kind } => Ok(Value::Array(registries.get(kind).list().await.map_err(report)?)),
        Command::Delete { kind, name } => {
            let deleted = registries.get(kind).delete(&name).await.map_err(report)?;
            Ok(json!({ "deleted": deleted }))
        },
        Command::Validate { kind, name } => json_of(&registries.get(kind).validate(&name).await.map_err(report)?),
        Command::Stats { kind: Some(kind) } => json_of(&registries.get(kind).stats().await),
        Command::Stats { kind: None } => {
            let mut all = Map::new();
            for registry in registries.all() {
                all.insert(registry.kind().to_string(), json_of(&registry.stats().await)?);
            }
            Ok(Value::Object(all))
        },
        Command::SetParam { kind, name, key, value } => {
            registries.get(kind).set_parameter(&name, &key, parse_value(&value)).await.map_err(report)
        },
        Command::Scan { kind } => {
            let mut all = Map::new();
            let selected: Vec<_> = match kind {
                Some(kind) => vec![registries.get(kind)],
                None => registries.all().collect(),
            };
            for registry in selected {
                let events = registry.scan().await.map_err(report)?;
                all.insert(registry.kind().to_string(), json_of(&events)?);
            }
            Ok(Value::Object(all))
        },
        Command::Run { job } => {
            let job: Job = serde_json::from_str(&job).into_diagnostic()?;
            json_of(&assets.pipeline.run(job).await.map_err(report)?)
        },
        Command::Load { name, force } => match assets.loader.load(&name, force).await.map_err(report)? {
            Some(resource) => Ok(describe(&name, &resource)),
            None => Err(miette!("no resource named `{name}`")),
        },
        Command::Cache(command) => cache(assets, command).await,
        Command::Deps(command) => deps(assets, command).await,
        Command::Errors(command) => errors(assets, command).await,
        Command::Logs(command) => logs(assets, command).await,
        Command::Settings(command) => settings(assets, command).await,
        Command::Versions(command) => versions(assets, command).await,
        Command::Trigger(TriggerArgs { event, fields }) => {
            let mut payload = Vec::with_capacity(fields.len());
            for field in &fields {
                let Some((key, value)) = field.split_once('=') else {
                    return Err(miette!("expected KEY=VALUE, got `{field}`"));
                };
                payload.push((key.to_string(), parse_value(value)));
            }
            json_of(&assets.events.trigger(&event, EventPayload::custom(payload)).await.map_err(report)?)
        },
    }
}

/// A loaded resource is summarised rather than dumped.
fn describe(name: &str, resource: &Resource) -> Value {
    match resource {
        Resource::Json(value) => json!({ "name": name, "type": "json", "value": value }),
        Resource::Text(text) => json!({ "name": name, "type": "text", "length": text.len() }),
        Resource::Image(image) => json!({ "name": name, "type": "image", "width": image.width(), "height": image.height() }),
        Resource::Audio(buffer) => json!({
            "name": name,
            "type": "audio",
            "frames": buffer.frames(),
            "duration_s": buffer.duration_s(),
        }),
    }
}

async fn cache(assets: &Assets, command: CacheCommand) -> Result<Value> {
    let cache = &assets.context.cache;
    match command {
        CacheCommand::Stats => json_of(&cache.stats().await),
        CacheCommand::Validate => json_of(&cache.validate().await.map_err(report)?),
        CacheCommand::Clear { kind } => {
            let removed = cache.clear(kind.map(|k| k.as_str())).await.map_err(report)?;
            Ok(json!({ "removed": removed }))
        },
        CacheCommand::Rediscover { kind } => {
            let found = cache.rediscover(kind.as_str()).await.map_err(report)?;
            Ok(json!({ "rediscovered": found }))
        },
    }
}

async fn deps(assets: &Assets, command: DepsCommand) -> Result<Value> {
    let graph = &assets.context.graph;
    match command {
        DepsCommand::Show { name } => match graph.get(&name).await {
            Some(record) => json_of(&record),
            None => Err(miette!("`{name}` is not in the dependency graph")),
        },
        DepsCommand::Dependents { name, recursive } => json_of(&graph.dependents(&name, recursive).await),
        DepsCommand::Validate { name } => json_of(&graph.validate(&name).await.map_err(report)?),
        DepsCommand::Stats => json_of(&graph.stats().await),
    }
}

async fn errors(assets: &Assets, command: ErrorsCommand) -> Result<Value> {
    let ledger = &assets.context.errors;
    match command {
        ErrorsCommand::List { error_type, severity, all } => {
            let severity = match severity {
                Some(raw) => Some(raw.parse::<Severity>().map_err(report)?),
                None => None,
            };
            let query = ErrorQuery { error_type, severity, include_resolved: all };
            json_of(&ledger.query(&query).await)
        },
        ErrorsCommand::Resolve { code, resolution } => json_of(&ledger.resolve(&code, &resolution).await.map_err(report)?),
        ErrorsCommand::Stats => json_of(&ledger.stats().await),
    }
}

async fn logs(assets: &Assets, command: LogsCommand) -> Result<Value> {
    let logs = &assets.logs;
    match command {
        LogsCommand::Tail { name, lines, level } => {
            let level = match level {
                Some(raw) => Some(raw.parse::<Level>().map_err(report)?),
                None => None,
            };
            json_of(&logs.tail(&name, lines, level).await.map_err(report)?)
        },
        LogsCommand::Rotate { name } => json_of(&logs.rotate(&name).await.map_err(report)?),
        LogsCommand::Clear { name } => json_of(&logs.clear(&name).await.map_err(report)?),
        LogsCommand::Stats => json_of(&logs.stats().await.map_err(report)?),
    }
}

async fn settings(assets: &Assets, command: SettingsCommand) -> Result<Value> {
    let settings = &assets.settings;
    match command {
        SettingsCommand::Get { name } => match settings.get(&name).await {
            Some(setting) => json_of(&setting),
            None => Err(miette!("no setting named `{name}`")),
        },
        SettingsCommand::Set { name, value } => json_of(&settings.set(&name, parse_value(&value)).await.map_err(report)?),
        SettingsCommand::Reset { name } => json_of(&settings.reset(&name).await.map_err(report)?),
        SettingsCommand::List { category: Some(category) } => json_of(&settings.by_category(&category).await),
        SettingsCommand::List { category: None } => json_of(&settings.list().await),
        SettingsCommand::Stats => json_of(&settings.stats().await),
    }
}

async fn versions(assets: &Assets, command: VersionsCommand) -> Result<Value> {
    let versions = &assets.versions;
    let channels = |args: ChannelArgs| Channels { beta: args.beta, alpha: args.alpha };
    match command {
        VersionsCommand::Create { name, version, author, description, changes, depends_on, stable, beta, alpha } => {
            let new = NewVersion {
                author,
                description,
                changes,
                dependencies: depends_on.into_iter().collect(),
                is_stable: stable,
                is_beta: beta,
                is_alpha: alpha,
            };
            json_of(&versions.create(&name, &version, new).await.map_err(report)?)
        },
        VersionsCommand::Update { name, version, changes, depends_on } => {
            let updated = versions.update(&name, &version, changes, depends_on.into_iter().collect()).await;
            json_of(&updated.map_err(report)?)
        },
        VersionsCommand::Get { name, version } => match versions.get(&name, &version).await {
            Some(record) => json_of(&record),
            None => Err(miette!("no version {version} of `{name}`")),
        },
        VersionsCommand::Latest { name, channels: args } => match versions.latest(&name, channels(args)).await {
            Some(record) => json_of(&record),
            None => Err(miette!("`{name}` has no matching version")),
        },
        VersionsCommand::History { name, channels: args } => json_of(&versions.history(&name, channels(args)).await),
        VersionsCommand::Compare { name, first, second } => {
            let ordering = versions.compare(&name, &first, &second).await.map_err(report)?;
            Ok(json!(ordering as i8))
        },
        VersionsCommand::Validate { name, version } => json_of(&versions.validate(&name, &version).await.map_err(report)?),
        VersionsCommand::Stats => json_of(&versions.stats().await),
    }
}
