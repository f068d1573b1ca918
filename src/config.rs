use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

use crate::simulate::LatencyValue;

pub const PROJECT_CONFIG_FILE_NAME: &str = "talkback.toml";
pub const HOME_CONFIG_DIR_NAME: &str = ".talkback";
pub const HOME_CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tapes: TapesConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(skip)]
    source_path: Option<PathBuf>,
}

impl Config {
    /// Loads `explicit_path` if given, otherwise the first discovered config file, otherwise
    /// built-in defaults.
    pub fn load(explicit_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = explicit_path {
            return Self::from_path(path);
        }
        let cwd = env::current_dir().context("resolve current directory")?;
        let home = env::var_os("HOME").map(PathBuf::from);
        match discover_config_path(&cwd, home.as_deref()) {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        let mut config = Self::from_toml_str(&toml)
            .with_context(|| format!("load config {}", path.display()))?;
        config.source_path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    pub fn source_path(&self) -> Option<&Path> {
        self.source_path.as_deref()
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

/// `./talkback.toml` first, then `$HOME/.talkback/config.toml`.
pub fn discover_config_path(cwd: &Path, home: Option<&Path>) -> Option<PathBuf> {
    let project = cwd.join(PROJECT_CONFIG_FILE_NAME);
    if project.is_file() {
        return Some(project);
    }
    let home_config = home?.join(HOME_CONFIG_DIR_NAME).join(HOME_CONFIG_FILE_NAME);
    home_config.is_file().then_some(home_config)
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub listen: Option<SocketAddr>,
    pub host: Option<String>,
    pub summary: Option<bool>,
    pub https: Option<HttpsConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub key_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TapesConfig {
    pub path: Option<PathBuf>,
    pub record: Option<String>,
    pub fallback_mode: Option<String>,
    pub ignore_headers: Option<Vec<String>>,
    #[serde(default)]
    pub ignore_query_params: Vec<String>,
    #[serde(default)]
    pub match_headers: Vec<String>,
    #[serde(default)]
    pub ignore_body: bool,
    pub latency: Option<LatencyValue>,
    pub error_rate: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::{Config, LogFormat, discover_config_path};
    use crate::simulate::LatencyValue;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert!(config.proxy.listen.is_none());
        assert!(config.tapes.record.is_none());
        assert!(config.logging.is_none());
        assert!(config.source_path().is_none());
    }

    #[test]
    fn parses_full_config() {
        let config = Config::from_toml_str(
            r#"
[proxy]
listen = "0.0.0.0:8443"
host = "https://api.example.com"

[proxy.https]
enabled = true
key_path = "key.pem"
cert_path = "cert.pem"

[tapes]
latency = 250

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .unwrap();

        let https = config.proxy.https.as_ref().unwrap();
        assert!(https.enabled);
        assert_eq!(https.cert_path.as_deref().unwrap().to_str(), Some("cert.pem"));
        assert_eq!(config.tapes.latency, Some(LatencyValue::Fixed(250.0)));
        let logging = config.logging.as_ref().unwrap();
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = Config::from_toml_str("[tapes]\nrecrod = \"NEW\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("recrod"), "{err:#}");
    }

    #[test]
    fn discovery_prefers_project_then_home() {
        let sandbox = tempfile::tempdir().unwrap();
        let project = sandbox.path().join("project");
        let home = sandbox.path().join("home");
        fs::create_dir_all(&project).unwrap();
        fs::create_dir_all(home.join(".talkback")).unwrap();

        assert_eq!(discover_config_path(&project, Some(&home)), None);

        let home_config = home.join(".talkback").join("config.toml");
        fs::write(&home_config, "").unwrap();
        assert_eq!(
            discover_config_path(&project, Some(&home)),
            Some(home_config)
        );

        let project_config = project.join("talkback.toml");
        fs::write(&project_config, "").unwrap();
        assert_eq!(
            discover_config_path(&project, Some(&home)),
            Some(project_config)
        );
    }

    #[test]
    fn from_path_records_source() {
        let sandbox = tempfile::tempdir().unwrap();
        let path = sandbox.path().join("talkback.toml");
        fs::write(&path, "[proxy]\nhost = \"http://localhost:1\"\n").unwrap();

        let config = Config::from_path(&path).unwrap();
        assert_eq!(config.source_path(), Some(path.as_path()));
        assert_eq!(config.proxy.host.as_deref(), Some("http://localhost:1"));
    }
}
