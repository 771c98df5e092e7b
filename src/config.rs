//! Configuration for rffmpeg.
//!
//! Holds the YAML configuration model and the clap struct for the direct entry point.
//! The configuration is validated completely when loaded; nothing downstream re-checks it.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::error::DispatchError;
use crate::host::{HostEntry, HostSpec, Tool};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rffmpeg/rffmpeg.yml";
pub const CONFIG_ENV: &str = "RFFMPEG_CONFIG";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    rffmpeg: Config,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub state: StateConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub log_to_file: bool,
    pub logfile: PathBuf,
    /// `EnvFilter` directive, e.g. `info` or `rffmpeg=debug`.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_file: true,
            logfile: PathBuf::from("/var/log/jellyfin/rffmpeg.log"),
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    File,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StateConfig {
    pub backend: StateBackend,
    /// State directory for `file`, database file for `sqlite`.
    pub path: PathBuf,
    #[serde(with = "humantime_serde")]
    pub lock_timeout: Duration,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: StateBackend::File,
            path: PathBuf::from("/run/shm/rffmpeg"),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub user: Option<String>,
    pub port: Option<u16>,
    /// Private key handed to the transport.
    pub identity_file: Option<PathBuf>,
    /// Pre-populated trust store. Unknown host keys are always refused.
    pub known_hosts_file: Option<PathBuf>,
    hosts: Vec<HostSpec>,
}

impl RemoteConfig {
    /// Configured hosts, in declaration order.
    pub fn hosts(&self) -> impl Iterator<Item = &HostEntry> {
        self.hosts.iter().map(|spec| &spec.0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CommandsConfig {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub fallback_ffmpeg: Option<String>,
    pub fallback_ffprobe: Option<String>,
    /// Argv prefix for remote runs, e.g. `[nice, -n, "10"]`.
    pub pre: Vec<String>,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: "/usr/lib/jellyfin-ffmpeg/ffmpeg".to_string(),
            ffprobe: "/usr/lib/jellyfin-ffmpeg/ffprobe".to_string(),
            fallback_ffmpeg: None,
            fallback_ffprobe: None,
            pre: vec![],
        }
    }
}

impl CommandsConfig {
    /// Binary run on remote hosts.
    pub fn remote_binary(&self, tool: Tool) -> &str {
        match tool {
            Tool::Ffmpeg => &self.ffmpeg,
            Tool::Ffprobe => &self.ffprobe,
        }
    }

    /// Binary run locally. Defaults to the remote path.
    pub fn local_binary(&self, tool: Tool) -> &str {
        match tool {
            Tool::Ffmpeg => self.fallback_ffmpeg.as_deref().unwrap_or(&self.ffmpeg),
            Tool::Ffprobe => self.fallback_ffprobe.as_deref().unwrap_or(&self.ffprobe),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Line that asks the wrapped command to quit.
    pub quit_token: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(1),
            quit_token: "q".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, DispatchError> {
        let content = std::fs::read_to_string(path).map_err(|source| DispatchError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, DispatchError> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        file.rffmpeg.validate()?;
        Ok(file.rffmpeg)
    }

    fn validate(&self) -> Result<(), DispatchError> {
        for host in self.remote.hosts() {
            if host.name.is_empty() || host.name.chars().any(char::is_whitespace) {
                return Err(DispatchError::Config(format!(
                    "invalid host name {:?}",
                    host.name
                )));
            }
        }
        if let Err(err) = EnvFilter::try_new(&self.logging.level) {
            return Err(DispatchError::Config(format!(
                "invalid logging.level {:?}: {}",
                self.logging.level, err
            )));
        }
        if self.commands.ffmpeg.is_empty() || self.commands.ffprobe.is_empty() {
            return Err(DispatchError::Config(
                "commands.ffmpeg and commands.ffprobe must not be empty".into(),
            ));
        }
        if self.state.path.as_os_str().is_empty() {
            return Err(DispatchError::Config("state.path must not be empty".into()));
        }
        if self.state.lock_timeout.is_zero() {
            return Err(DispatchError::Config("state.lock_timeout must be positive".into()));
        }
        if self.dispatch.probe_timeout.is_zero() {
            return Err(DispatchError::Config(
                "dispatch.probe_timeout must be positive".into(),
            ));
        }
        let token = &self.dispatch.quit_token;
        if token.is_empty() || token.contains(['\n', '\r']) {
            return Err(DispatchError::Config(
                "dispatch.quit_token must be a non-empty single line".into(),
            ));
        }
        Ok(())
    }
}

/// Direct entry point: `rffmpeg [--config PATH] <ffmpeg|ffprobe> [ARGS]...`
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Configuration file [default: $RFFMPEG_CONFIG, then /etc/rffmpeg/rffmpeg.yml]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Tool to run
    #[arg(value_enum)]
    pub tool: Tool,

    /// Arguments passed to the tool unchanged
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<OsString>,
}

/// What one process was asked to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: Tool,
    pub args: Vec<OsString>,
    pub config_path: PathBuf,
}

impl Invocation {
    /// Resolves the invocation from the raw argument vector.
    ///
    /// Under any name other than `rffmpeg` this binary stands in for the tool itself
    /// (`ffprobe` if the name contains it, `ffmpeg` otherwise) and every argument after the
    /// program name is passed through untouched. Under its own name the direct entry point
    /// syntax applies.
    pub fn parse<I>(args: I, config_env: Option<OsString>) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = OsString>,
    {
        let args: Vec<OsString> = args.into_iter().collect();
        let program = args.first().map(OsString::as_os_str).unwrap_or(OsStr::new(""));
        let config_env = config_env.map(PathBuf::from);

        if let Some(tool) = Tool::from_program_name(program) {
            return Ok(Self {
                tool,
                args: args.into_iter().skip(1).collect(),
                config_path: config_env.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
            });
        }

        let cli = Cli::try_parse_from(args)?;
        Ok(Self {
            tool: cli.tool,
            args: cli.args,
            config_path: cli
                .config
                .or(config_env)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
rffmpeg:
  logging:
    log_to_file: false
    logfile: /tmp/rffmpeg.log
    level: debug
  state:
    backend: sqlite
    path: /tmp/rffmpeg/state.db
    lock_timeout: 3s
  remote:
    user: jellyfin
    port: 2222
    identity_file: /var/lib/jellyfin/.ssh/id_ed25519
    known_hosts_file: /var/lib/jellyfin/.ssh/known_hosts
    hosts:
      - gpu1
      - name: gpu2
        weight: 2
      - gpu1
  commands:
    ffmpeg: /opt/ffmpeg/ffmpeg
    ffprobe: /opt/ffmpeg/ffprobe
    fallback_ffmpeg: /usr/bin/ffmpeg
    pre: [nice, "-n", "10"]
  dispatch:
    probe_timeout: 500ms
    quit_token: quit
"#;

    fn os(args: &[&str]) -> Vec<OsString> {
        args.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_yaml(FULL).unwrap();
        assert!(!config.logging.log_to_file);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.state.backend, StateBackend::Sqlite);
        assert_eq!(config.state.lock_timeout, Duration::from_secs(3));
        assert_eq!(config.remote.user.as_deref(), Some("jellyfin"));
        assert_eq!(config.remote.port, Some(2222));
        let hosts: Vec<_> = config.remote.hosts().cloned().collect();
        assert_eq!(
            hosts,
            vec![
                HostEntry::new("gpu1", 1),
                HostEntry::new("gpu2", 2),
                HostEntry::new("gpu1", 1),
            ]
        );
        assert_eq!(config.commands.pre, vec!["nice", "-n", "10"]);
        assert_eq!(config.commands.local_binary(Tool::Ffmpeg), "/usr/bin/ffmpeg");
        assert_eq!(
            config.commands.local_binary(Tool::Ffprobe),
            "/opt/ffmpeg/ffprobe"
        );
        assert_eq!(
            config.commands.remote_binary(Tool::Ffprobe),
            "/opt/ffmpeg/ffprobe"
        );
        assert_eq!(config.dispatch.probe_timeout, Duration::from_millis(500));
        assert_eq!(config.dispatch.quit_token, "quit");
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("rffmpeg:\n  remote:\n    hosts: []\n").unwrap();
        assert!(config.logging.log_to_file);
        assert_eq!(config.state.backend, StateBackend::File);
        assert_eq!(config.state.path, PathBuf::from("/run/shm/rffmpeg"));
        assert_eq!(config.dispatch.probe_timeout, Duration::from_secs(1));
        assert_eq!(config.dispatch.quit_token, "q");
        assert_eq!(config.remote.hosts().count(), 0);
        assert!(config.commands.pre.is_empty());
    }

    #[test]
    fn test_missing_host_list_is_rejected() {
        assert!(matches!(
            Config::from_yaml("rffmpeg:\n  remote:\n    user: jellyfin\n"),
            Err(DispatchError::ConfigParse(_))
        ));
        assert!(Config::from_yaml("rffmpeg: {}\n").is_err());
    }

    #[test]
    fn test_malformed_entries_are_rejected() {
        let zero_weight = "rffmpeg:\n  remote:\n    hosts:\n      - name: gpu1\n        weight: 0\n";
        assert!(Config::from_yaml(zero_weight).is_err());

        let unknown_key = "rffmpeg:\n  remote:\n    hosts: []\n  colour: blue\n";
        assert!(Config::from_yaml(unknown_key).is_err());

        let blank_host = "rffmpeg:\n  remote:\n    hosts:\n      - \"gpu 1\"\n";
        assert!(matches!(
            Config::from_yaml(blank_host),
            Err(DispatchError::Config(_))
        ));

        let bad_level = "rffmpeg:\n  logging:\n    level: rffmpeg=verbose\n  remote:\n    hosts: []\n";
        assert!(matches!(
            Config::from_yaml(bad_level),
            Err(DispatchError::Config(_))
        ));

        let multiline_token =
            "rffmpeg:\n  remote:\n    hosts: []\n  dispatch:\n    quit_token: \"q\\n\"\n";
        assert!(matches!(
            Config::from_yaml(multiline_token),
            Err(DispatchError::Config(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        assert!(matches!(
            Config::load(Path::new("/nonexistent/rffmpeg.yml")),
            Err(DispatchError::ConfigRead { .. })
        ));
    }

    #[test]
    fn test_invocation_under_tool_name() {
        let invocation = Invocation::parse(
            os(&["/usr/lib/jellyfin-ffmpeg/ffprobe", "-i", "movie.mkv", "-show_streams"]),
            Some(OsString::from("/srv/rffmpeg.yml")),
        )
        .unwrap();
        assert_eq!(invocation.tool, Tool::Ffprobe);
        assert_eq!(invocation.args, os(&["-i", "movie.mkv", "-show_streams"]));
        assert_eq!(invocation.config_path, PathBuf::from("/srv/rffmpeg.yml"));

        let invocation = Invocation::parse(os(&["ffmpeg", "--help"]), None).unwrap();
        assert_eq!(invocation.tool, Tool::Ffmpeg);
        assert_eq!(invocation.args, os(&["--help"]));
        assert_eq!(invocation.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_invocation_direct_entry_point() {
        let invocation = Invocation::parse(
            os(&[
                "rffmpeg",
                "--config",
                "/srv/rffmpeg.yml",
                "ffmpeg",
                "-i",
                "pipe:0",
                "-f",
                "null",
                "-",
            ]),
            None,
        )
        .unwrap();
        assert_eq!(invocation.tool, Tool::Ffmpeg);
        assert_eq!(invocation.args, os(&["-i", "pipe:0", "-f", "null", "-"]));
        assert_eq!(invocation.config_path, PathBuf::from("/srv/rffmpeg.yml"));
    }

    #[test]
    fn test_invocation_direct_entry_point_requires_tool() {
        assert!(Invocation::parse(os(&["rffmpeg"]), None).is_err());
    }

    #[test]
    fn test_direct_entry_point_reads_config_from_environment() {
        let invocation = Invocation::parse(
            os(&["/usr/bin/rffmpeg", "ffprobe", "-i", "movie.mkv"]),
            Some(OsString::from("/srv/env.yml")),
        )
        .unwrap();
        assert_eq!(invocation.tool, Tool::Ffprobe);
        assert_eq!(invocation.config_path, PathBuf::from("/srv/env.yml"));

        let invocation = Invocation::parse(
            os(&["rffmpeg", "--config", "/srv/flag.yml", "ffmpeg"]),
            Some(OsString::from("/srv/env.yml")),
        )
        .unwrap();
        assert_eq!(invocation.config_path, PathBuf::from("/srv/flag.yml"));

        let invocation = Invocation::parse(os(&["rffmpeg", "ffmpeg"]), None).unwrap();
        assert_eq!(invocation.config_path, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn test_invocation_under_renamed_wrapper() {
        let invocation =
            Invocation::parse(os(&["/usr/lib/jellyfin-ffmpeg/ffmpeg.real", "-version"]), None)
                .unwrap();
        assert_eq!(invocation.tool, Tool::Ffmpeg);
        assert_eq!(invocation.args, os(&["-version"]));

        let invocation = Invocation::parse(os(&["jellyfin-ffprobe-wrapper", "-i", "x"]), None)
            .unwrap();
        assert_eq!(invocation.tool, Tool::Ffprobe);
        assert_eq!(invocation.args, os(&["-i", "x"]));
    }
}
