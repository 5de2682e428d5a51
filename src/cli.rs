//! Command-line surface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use wold_registry::ArtifactKind;

fn parse_kind(value: &str) -> Result<ArtifactKind, String> {
    value.parse().map_err(|_| {
        let known: Vec<&str> = ArtifactKind::ALL.iter().map(|k| k.as_str()).collect();
        format!("unknown artifact kind `{value}`, expected one of: {}", known.join(", "))
    })
}

/// `NAME@VERSION`, as in `stone@2.0.0`.
fn parse_pinned(value: &str) -> Result<(String, String), String> {
    match value.split_once('@') {
        Some((name, version)) if !name.is_empty() && !version.is_empty() => {
            Ok((name.to_string(), version.to_string()))
        },
        _ => Err(format!("expected NAME@VERSION, got `{value}`")),
    }
}

#[derive(Debug, Parser)]
#[command(name = "wold", version, about = "Asset metadata and processing registry")]
pub struct Cli {
    /// Configuration file, layered over the user's `wold.toml`.
    #[arg(long, global = true, env = "WOLD_CONFIG")]
    pub config: Option<PathBuf>,
    /// Asset root, overriding the configured one.
    #[arg(long, global = true)]
    pub assets: Option<PathBuf>,
    /// More output on stderr; repeat for trace.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Register one file as an artifact.
    Register {
        #[arg(value_parser = parse_kind)]
        kind: ArtifactKind,
        path: PathBuf,
        /// Defaults to the file stem.
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "depends-on", value_name = "NAME")]
        depends_on: Vec<String>,
    },
    Get {
        #[arg(value_parser = parse_kind)]
        kind: ArtifactKind,
        name: String,
    },
    List {
        #[arg(value_parser = parse_kind)]
        kind: ArtifactKind,
    },
    Delete {
        #[arg(value_parser = parse_kind)]
        kind: ArtifactKind,
        name: String,
    },
    /// Check an artifact against its source file and the dependency graph.
    Validate {
        #[arg(value_parser = parse_kind)]
        kind: ArtifactKind,
        name: String,
    },
    /// Registry statistics, for one kind or all of them.
    Stats {
        #[arg(value_parser = parse_kind)]
        kind: Option<ArtifactKind>,
    },
    /// Set a parameter; `value` is parsed as JSON, falling back to a string.
    SetParam {
        #[arg(value_parser = parse_kind)]
        kind: ArtifactKind,
        name: String,
        key: String,
        value: String,
    },
    /// Register every file under the kind's directory.
    Scan {
        #[arg(value_parser = parse_kind)]
        kind: Option<ArtifactKind>,
    },
    /// Run a pipeline job given as JSON, e.g.
    /// `{"job": "generate_lod", "name": "cube", "ratios": [0.5]}`.
    Run {
        job: String,
    },
    /// Decoded resources.
    Load {
        name: String,
        #[arg(long)]
        force: bool,
    },
    #[command(subcommand)]
    Cache(CacheCommand),
    #[command(subcommand)]
    Deps(DepsCommand),
    #[command(subcommand)]
    Errors(ErrorsCommand),
    #[command(subcommand)]
    Logs(LogsCommand),
    #[command(subcommand)]
    Settings(SettingsCommand),
    #[command(subcommand)]
    Versions(VersionsCommand),
    /// Trigger a registered event.
    Trigger(TriggerArgs),
}

#[derive(Debug, Subcommand)]
pub enum CacheCommand {
    Stats,
    /// Drop index entries whose files are gone or changed.
    Validate,
    Clear {
        #[arg(long, value_parser = parse_kind)]
        kind: Option<ArtifactKind>,
    },
    /// Index cache files that exist on disk but not in the index.
    Rediscover {
        #[arg(value_parser = parse_kind)]
        kind: ArtifactKind,
    },
}

#[derive(Debug, Subcommand)]
pub enum DepsCommand {
    Show {
        name: String,
    },
    Dependents {
        name: String,
        #[arg(long)]
        recursive: bool,
    },
    Validate {
        name: String,
    },
    Stats,
}

#[derive(Debug, Subcommand)]
pub enum ErrorsCommand {
    List {
        #[arg(long = "type", value_name = "TYPE")]
        error_type: Option<String>,
        #[arg(long)]
        severity: Option<String>,
        /// Include resolved records.
        #[arg(long)]
        all: bool,
    },
    Resolve {
        code: String,
        resolution: String,
    },
    Stats,
}

#[derive(Debug, Subcommand)]
pub enum LogsCommand {
    Tail {
        name: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        lines: usize,
        #[arg(long)]
        level: Option<String>,
    },
    Rotate {
        name: String,
    },
    Clear {
        name: String,
    },
    Stats,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Get {
        name: String,
    },
    Set {
        name: String,
        value: String,
    },
    Reset {
        name: String,
    },
    List {
        #[arg(long)]
        category: Option<String>,
    },
    Stats,
}

/// Which pre-releases a version lookup may return.
#[derive(Debug, Args)]
pub struct ChannelArgs {
    #[arg(long)]
    pub beta: bool,
    #[arg(long)]
    pub alpha: bool,
}

#[derive(Debug, Subcommand)]
pub enum VersionsCommand {
    Create {
        name: String,
        version: String,
        #[arg(long, default_value = "")]
        author: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long = "change", value_name = "TEXT")]
        changes: Vec<String>,
        #[arg(long = "depends-on", value_name = "NAME@VERSION", value_parser = parse_pinned)]
        depends_on: Vec<(String, String)>,
        #[arg(long, conflicts_with_all = ["beta", "alpha"])]
        stable: bool,
        #[arg(long)]
        beta: bool,
        #[arg(long)]
        alpha: bool,
    },
    /// Append changes and dependencies to an existing version.
    Update {
        name: String,
        version: String,
        #[arg(long = "change", value_name = "TEXT")]
        changes: Vec<String>,
        #[arg(long = "depends-on", value_name = "NAME@VERSION", value_parser = parse_pinned)]
        depends_on: Vec<(String, String)>,
    },
    Get {
        name: String,
        version: String,
    },
    Latest {
        name: String,
        #[command(flatten)]
        channels: ChannelArgs,
    },
    History {
        name: String,
        #[command(flatten)]
        channels: ChannelArgs,
    },
    Compare {
        name: String,
        first: String,
        second: String,
    },
    Validate {
        name: String,
        version: String,
    },
    Stats,
}

#[derive(Debug, Args)]
pub struct TriggerArgs {
    /// Event to trigger; its payload fields are `key=value` pairs.
    pub event: String,
    #[arg(value_name = "KEY=VALUE")]
    pub fields: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["wold", "get", "models", "cube"], ArtifactKind::Model)]
    #[case(&["wold", "get", "texture", "sky"], ArtifactKind::Texture)]
    #[case(&["wold", "get", "Audio", "step"], ArtifactKind::Audio)]
    fn test_kind_argument(#[case] argv: &[&str], #[case] expected: ArtifactKind) {
        let cli = Cli::try_parse_from(argv).unwrap();
        let Command::Get { kind, .. } = cli.command else {
            panic!("parsed as {:?}", cli.command);
        };
        assert_eq!(kind, expected);
    }

    #[test]
    fn test_register_dependencies() {
        let cli = Cli::try_parse_from([
            "wold", "-vv", "register", "model", "models/cube_lod0.glb", "--depends-on", "cube", "--depends-on", "steel",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Register { depends_on, name, .. } = cli.command else {
            panic!("parsed as {:?}", cli.command);
        };
        assert_eq!(depends_on, vec!["cube", "steel"]);
        assert_eq!(name, None);
    }

    #[test]
    fn test_version_dependencies() {
        let cli = Cli::try_parse_from([
            "wold", "versions", "create", "castle", "1.0.0", "--change", "walls", "--depends-on", "stone@2.0.0", "--beta",
        ])
        .unwrap();
        let Command::Versions(VersionsCommand::Create { depends_on, changes, beta, stable, .. }) = cli.command else {
            panic!("parsed as {:?}", cli.command);
        };
        assert_eq!(depends_on, vec![("stone".to_string(), "2.0.0".to_string())]);
        assert_eq!(changes, vec!["walls"]);
        assert!(beta && !stable);
    }

    #[rstest]
    #[case("stone")]
    #[case("@2.0.0")]
    #[case("stone@")]
    fn test_bad_pinned_dependency(#[case] pinned: &str) {
        assert!(parse_pinned(pinned).is_err());
        let argv = ["wold", "versions", "update", "castle", "1.0.0", "--depends-on", pinned];
        assert!(Cli::try_parse_from(argv).is_err());
    }

    #[test]
    fn test_unknown_kind() {
        assert!(Cli::try_parse_from(["wold", "list", "spaceships"]).is_err());
    }
}
