use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use talkback::{config::Config, logging, options::Options};

#[derive(Debug, Parser)]
#[command(name = "talkback")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the record/replay proxy.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
        /// Address to listen on, e.g. `127.0.0.1:8080`.
        #[arg(long)]
        listen: Option<SocketAddr>,
        /// Upstream base URL requests are forwarded to.
        #[arg(long)]
        host: Option<String>,
        /// Tape directory.
        #[arg(long)]
        path: Option<PathBuf>,
        /// Record mode (NEW, OVERWRITE, DISABLED).
        #[arg(long)]
        record: Option<String>,
    },
}

#[derive(Debug, Default)]
struct ServeOverrides {
    listen: Option<SocketAddr>,
    host: Option<String>,
    path: Option<PathBuf>,
    record: Option<String>,
}

impl ServeOverrides {
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.proxy.listen = Some(listen);
        }
        if let Some(host) = self.host {
            config.proxy.host = Some(host);
        }
        if let Some(path) = self.path {
            config.tapes.path = Some(path);
        }
        if let Some(record) = self.record {
            config.tapes.record = Some(record);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            log_level,
            listen,
            host,
            path,
            record,
        } => {
            let mut config = Config::load(config.as_deref())?;
            ServeOverrides {
                listen,
                host,
                path,
                record,
            }
            .apply(&mut config);
            logging::init(&config, log_level.as_deref())?;

            let options = Options::from_config(&config).context("invalid talkback options")?;
            let startup = startup_summary(&config, &options);
            let proxy = talkback::proxy::serve(options).await?;
            eprintln!("{startup} listen={}", proxy.listen_addr);

            tokio::signal::ctrl_c().await?;
            if let Some(summary) = proxy.shutdown().await {
                print!("{summary}");
            }
        }
    }

    Ok(())
}

fn startup_summary(config: &Config, options: &Options) -> String {
    let config_source = config
        .source_path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| "defaults".to_owned());
    let upstream = if options.host.is_empty() {
        "unset"
    } else {
        options.host.as_str()
    };
    format!(
        "talkback starting: config={config_source} upstream={upstream} tapes={} record={} fallback={} https={}",
        options.path.display(),
        config.tapes.record.as_deref().unwrap_or("NEW"),
        config.tapes.fallback_mode.as_deref().unwrap_or("NOT_FOUND"),
        options.https.enabled,
    )
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use talkback::{
        config::Config,
        options::{Options, RecordMode},
        tape::HttpRequest,
    };

    use super::{Cli, Command, ServeOverrides, startup_summary};

    #[test]
    fn serve_parses_overrides() {
        let cli = Cli::try_parse_from([
            "talkback",
            "serve",
            "--listen",
            "127.0.0.1:9000",
            "--host",
            "https://api.example.com",
            "--record",
            "disabled",
        ])
        .expect("cli should parse");

        let Command::Serve {
            listen,
            host,
            record,
            config,
            ..
        } = cli.command;
        assert_eq!(listen, Some("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(host.as_deref(), Some("https://api.example.com"));
        assert_eq!(record.as_deref(), Some("disabled"));
        assert!(config.is_none());
    }

    #[test]
    fn cli_overrides_win_over_file_values() {
        let mut config = Config::from_toml_str(
            "[proxy]\nhost = \"http://from-file\"\n[tapes]\nrecord = \"NEW\"\npath = \"file-tapes\"\n",
        )
        .unwrap();
        ServeOverrides {
            host: Some("http://from-cli".to_owned()),
            record: Some("OVERWRITE".to_owned()),
            ..ServeOverrides::default()
        }
        .apply(&mut config);

        let options = Options::from_config(&config).unwrap();
        assert_eq!(options.host, "http://from-cli");
        assert_eq!(options.path, PathBuf::from("file-tapes"));
        let req = HttpRequest::new("GET", "/", Default::default(), Vec::new()).unwrap();
        assert_eq!(options.record.resolve(&req).unwrap(), RecordMode::Overwrite);
    }

    #[test]
    fn invalid_record_override_is_rejected() {
        let mut config = Config::default();
        ServeOverrides {
            record: Some("SOMETIMES".to_owned()),
            ..ServeOverrides::default()
        }
        .apply(&mut config);
        assert!(Options::from_config(&config).is_err());
    }

    #[test]
    fn startup_summary_reports_effective_settings() {
        let config = Config::from_toml_str("[proxy]\nhost = \"http://api\"\n").unwrap();
        let options = Options::from_config(&config).unwrap();
        let summary = startup_summary(&config, &options);
        assert!(summary.contains("config=defaults"), "{summary}");
        assert!(summary.contains("upstream=http://api"), "{summary}");
        assert!(summary.contains("record=NEW"), "{summary}");
        assert!(summary.contains("https=false"), "{summary}");
    }
}
