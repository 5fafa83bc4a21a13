//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use loopwatch_core::{Config, ConfigError, ProjectEntry};

#[derive(Parser)]
#[command(name = "loopwatch", about = "live change notifications for project artifacts")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Watch projects and serve change events over WebSocket (default)
    Daemon(DaemonOpts),
    /// Print the file type a path classifies as
    Classify(ClassifyOpts),
}

#[derive(clap::Args, Default)]
pub struct DaemonOpts {
    /// TOML config file
    #[arg(long, short = 'c', env = "LOOPWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address, overrides `server.bind`
    #[arg(long)]
    pub bind: Option<String>,

    /// Project to watch as ID=PATH; repeatable, replaces a config entry with the same id
    #[arg(long = "project", short = 'p', value_parser = ProjectEntry::parse_assignment)]
    pub projects: Vec<ProjectEntry>,
}

#[derive(clap::Args)]
pub struct ClassifyOpts {
    /// Project root
    pub root: PathBuf,

    /// Path to classify, absolute or relative to the root
    pub path: PathBuf,
}

impl DaemonOpts {
    /// Load the config file (or defaults) and apply command-line overrides.
    pub fn resolve_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(bind) = &self.bind {
            config.server.bind = bind.clone();
        }
        for entry in &self.projects {
            config.projects.retain(|p| p.id != entry.id);
            config.projects.push(entry.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn no_subcommand_means_daemon_default() {
        let cli = Cli::try_parse_from(["loopwatch"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn project_flags_parse_and_override_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nbind = \"127.0.0.1:1234\"\n[[projects]]\nid = \"p1\"\nroot = \"/old\"\n"
        )
        .unwrap();
        let config_path = file.path().to_str().unwrap().to_string();

        let cli = Cli::try_parse_from([
            "loopwatch",
            "daemon",
            "--config",
            &config_path,
            "--bind",
            "127.0.0.1:0",
            "--project",
            "p1=/new",
            "-p",
            "p2=/other",
        ])
        .unwrap();
        let Some(Command::Daemon(opts)) = cli.command else {
            panic!("expected daemon command");
        };

        let config = opts.resolve_config().unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:0");
        assert_eq!(config.projects.len(), 2);
        assert_eq!(config.projects[0].id, "p1");
        assert_eq!(config.projects[0].root, PathBuf::from("/new"));
        assert_eq!(config.projects[1].id, "p2");
    }

    #[test]
    fn malformed_project_flag_is_rejected() {
        let result = Cli::try_parse_from(["loopwatch", "daemon", "--project", "no-equals"]);
        assert!(result.is_err());
    }

    #[test]
    fn classify_takes_root_and_path() {
        let cli = Cli::try_parse_from(["loopwatch", "classify", "/repo", ".loop/prd.json"]).unwrap();
        let Some(Command::Classify(opts)) = cli.command else {
            panic!("expected classify command");
        };
        assert_eq!(opts.root, PathBuf::from("/repo"));
        assert_eq!(opts.path, PathBuf::from(".loop/prd.json"));
    }
}
