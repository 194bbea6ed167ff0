use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use playback_gateway as lib;
use lib::api::spotify::{SpotifyApi, PLAYER_PATH};
use lib::config::Config;
use lib::models::PlaybackState;
use lib::poller::PollScheduler;
use lib::store::{MetadataRecorder, SqliteTokenStore, TokenStore};
use std::path::{Path, PathBuf};
use tracing::subscriber as tracing_subscriber_global;
use tracing_appender::rolling::RollingFileAppender;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "playback-gateway", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize with the accounts service and store tokens (interactive)
    Auth,
    /// Forget stored tokens
    Logout,
    /// Show the stored token and when it was last refreshed
    TokenStatus,
    /// Force a token refresh now
    Refresh,
    /// GET a Web API path through the gateway and print the JSON
    Get {
        /// Path relative to api_base, e.g. /me/player
        path: String,
        /// Ignore cached results
        #[arg(long)]
        fresh: bool,
    },
    /// Poll playback state and print changes until Ctrl-C
    WatchPlayer,
    /// Validate config file and exit
    ConfigValidate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // Resolve config path: explicit --config overrides; otherwise prefer the
    // system-wide file and fall back to the repository example config.
    let resolved_config_path: PathBuf = match &cli.config {
        Some(p) => p.clone(),
        None => {
            let etc_path = Path::new("/etc/playback-gateway/config.toml");
            if etc_path.exists() {
                etc_path.to_path_buf()
            } else {
                PathBuf::from("config/example-config.toml")
            }
        }
    };

    if let Commands::ConfigValidate = cli.command {
        match Config::from_path(&resolved_config_path).and_then(|cfg| cfg.validate()) {
            Ok(()) => println!("OK"),
            Err(e) => {
                eprintln!("Config validation failed: {}", e);
                std::process::exit(2);
            }
        }
        return Ok(());
    }

    let cfg = Config::from_path(&resolved_config_path)
        .with_context(|| format!("loading config from {}", resolved_config_path.display()))?;
    cfg.validate().context("validating config")?;

    // Logs go to both stdout and a daily-rotated file in cfg.log_dir.
    let _ = LogTracer::init();
    let file_appender: RollingFileAppender = tracing_appender::rolling::daily(&cfg.log_dir, "playback-gateway.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Honor RUST_LOG if set, otherwise default to info.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking))
        .with(fmt::layer().with_writer(std::io::stdout));
    tracing_subscriber_global::set_global_default(subscriber).context("installing tracing subscriber")?;

    match cli.command {
        Commands::Auth => {
            let api = SpotifyApi::from_config(&cfg);
            let token = lib::api::spotify_auth::run_interactive_auth(&cfg, api.gateway().tokens()).await?;
            println!("Authorized; token valid until {}", format_epoch(token.expires_at));
        }
        Commands::Logout => {
            let api = SpotifyApi::from_config(&cfg);
            api.gateway().tokens().logout().await?;
            println!("Stored tokens removed.");
        }
        Commands::TokenStatus => {
            let store = SqliteTokenStore::new(cfg.db_path.clone(), lib::gateway::PROVIDER);
            match store.get().await? {
                None => println!("Not authenticated. Run `auth` first."),
                Some(token) => {
                    let left = token.expires_in_from(chrono::Utc::now().timestamp());
                    println!("expires_at: {} ({}s left)", format_epoch(token.expires_at), left);
                    println!("refresh token: {}", if token.refresh_token.is_some() { "present" } else { "missing" });
                    if let Some(scope) = &token.scope {
                        println!("scope: {}", scope);
                    }
                }
            }
            let last = tokio::task::spawn_blocking({
                let db_path = cfg.db_path.clone();
                move || -> Result<Option<String>> {
                    let conn = lib::db::open_or_create(&db_path)?;
                    lib::db::get_metadata(&conn, MetadataRecorder::LAST_REFRESH_KEY)
                }
            })
            .await??;
            if let Some(last) = last {
                println!("last refresh: {}", last);
            }
        }
        Commands::Refresh => {
            let api = SpotifyApi::from_config(&cfg);
            let token = api.gateway().tokens().refresh().await?;
            println!("Refreshed; token valid until {}", format_epoch(token.expires_at));
        }
        Commands::Get { path, fresh } => {
            let api = SpotifyApi::from_config(&cfg);
            let path = if path.starts_with('/') { path } else { format!("/{}", path) };
            let value = if fresh {
                api.gateway().get_fresh(&path).await?
            } else {
                api.gateway().get(&path).await?
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::WatchPlayer => {
            let api = SpotifyApi::from_config(&cfg);
            api.gateway()
                .tokens()
                .get_valid_token()
                .await
                .map_err(|e| anyhow!("{} (run `auth` first)", e))?;
            let scheduler: PollScheduler<Option<PlaybackState>> = PollScheduler::new(api.gateway().clone());
            scheduler.subscribe(PLAYER_PATH, |state| println!("{}", describe(state)));
            scheduler.start_polling(PLAYER_PATH, api.playback_fetcher(), SpotifyApi::playback_policy(&cfg));
            tokio::signal::ctrl_c().await?;
            scheduler.stop_polling(PLAYER_PATH);
        }
        // validated before logging was set up
        Commands::ConfigValidate => {}
    }

    Ok(())
}

fn format_epoch(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

fn describe(state: &Option<PlaybackState>) -> String {
    let Some(state) = state else {
        return "nothing playing".to_string();
    };
    let track = state
        .item
        .as_ref()
        .map(|i| {
            let artists: Vec<&str> = i.artists.iter().map(|a| a.name.as_str()).collect();
            format!("{} - {}", artists.join(", "), i.name)
        })
        .unwrap_or_else(|| "(unknown track)".to_string());
    let device = state.device.as_ref().map(|d| d.name.as_str()).unwrap_or("no device");
    format!("[{}] {} on {}", if state.is_playing { "playing" } else { "paused" }, track, device)
}
