use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{Duration, Local, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

mod config;
mod lock;
mod pipeline;
mod reconcile;
mod scrobble;
mod service;
mod store;
mod timestamp;
mod today;
mod window;
mod ytmusic;

use crate::config::{
    Account, Config, add_account, default_config_path, default_db_path, find_account_mut,
    get_service_keys, iter_accounts, load_config, remove_account, save_config, set_service_keys,
};
use crate::lock::RunLock;
use crate::pipeline::{RunOptions, local_day_window};
use crate::reconcile::{DEFAULT_FIRST_RUN_LIMIT, ReconcileOptions, ReplayRule};
use crate::scrobble::{FailureKind, ScrobbleSink, ScrobbleTrack};
use crate::service::{ScrobbleClient, Service, Session};
use crate::store::Database;
use crate::window::ClassificationWindow;
use crate::ytmusic::YtMusicClient;

#[derive(Parser)]
#[command(
    name = "ytm-scrobbler",
    version,
    about = "Scrobble YouTube Music listening history"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    Scrobble(ScrobbleArgs),
}

#[derive(Subcommand)]
enum ServiceCommand {
    SetKeys {
        service: String,
        #[arg(long, env = "LAST_FM_API", help = "API key")]
        api_key: String,
        #[arg(long, env = "LAST_FM_API_SECRET", help = "API secret")]
        api_secret: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum AccountCommand {
    Add {
        service: String,
        #[arg(long, help = "Account username")]
        username: String,
        #[arg(long, help = "Account password")]
        password: Option<String>,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    Remove {
        service: String,
        #[arg(long, help = "Account username")]
        username: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    List {
        #[arg(long, help = "Filter by service")]
        service: Option<String>,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    SetCookie {
        service: String,
        #[arg(long, help = "Account username")]
        username: String,
        #[arg(long, env = "YTMUSIC_COOKIE", help = "Cookie header copied from music.youtube.com")]
        cookie: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ReplayRuleArg {
    MovedForward,
    Overtook,
}

impl From<ReplayRuleArg> for ReplayRule {
    fn from(value: ReplayRuleArg) -> Self {
        match value {
            ReplayRuleArg::MovedForward => ReplayRule::MovedForward,
            ReplayRuleArg::Overtook => ReplayRule::Overtook,
        }
    }
}

#[derive(Parser)]
struct ScrobbleArgs {
    #[arg(long, help = "Limit to one service")]
    service: Option<String>,
    #[arg(long, help = "Limit to one username")]
    username: Option<String>,
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,
    #[arg(
        long,
        env = "YTMUSIC_COOKIE",
        hide_env_values = true,
        help = "YouTube Music cookie; overrides the stored one"
    )]
    cookie: Option<String>,
    #[arg(long, value_name = "PATH", help = "Scrobble database for this account")]
    db_path: Option<PathBuf>,
    #[arg(
        long,
        value_name = "HOURS",
        help = "Rolling duplicate window instead of since local midnight"
    )]
    window_hours: Option<u32>,
    #[arg(long, value_enum, default_value = "moved-forward")]
    replay_rule: ReplayRuleArg,
    #[arg(
        long,
        default_value_t = DEFAULT_FIRST_RUN_LIMIT,
        help = "Plays sent on a first run; older ones are only recorded (0 sends all)"
    )]
    first_run_limit: usize,
    #[arg(
        long,
        default_value_t = false,
        help = "Plan and report without scrobbling"
    )]
    dry_run: bool,
    #[arg(
        long,
        default_value_t = false,
        help = "Print raw scrobble API responses"
    )]
    debug_response: bool,
}

fn main() {
    let cli = Cli::parse();
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    if let Err(err) = run(cli.command) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> Result<()> {
    match command {
        Commands::Service { command } => match command {
            ServiceCommand::SetKeys {
                service,
                api_key,
                api_secret,
                config_path,
            } => {
                if Service::parse(&service)? != Service::LastFm {
                    bail!("Only lastfm supports setting API keys.");
                }
                let config_path = config_path.unwrap_or_else(default_config_path);
                let mut config = load_config(&config_path)?;
                set_service_keys(&mut config, &service, &api_key, &api_secret);
                save_config(&config, &config_path)?;
                println!("Saved API keys for {service} in {}", config_path.display());
            }
        },
        Commands::Account { command } => handle_account(command)?,
        Commands::Scrobble(args) => handle_scrobble(args)?,
    }
    Ok(())
}

fn handle_account(command: AccountCommand) -> Result<()> {
    match command {
        AccountCommand::Add {
            service,
            username,
            password,
            config_path,
        } => {
            Service::parse(&service)?;
            let config_path = config_path.unwrap_or_else(default_config_path);
            let mut config = load_config(&config_path)?;
            let password = match password {
                Some(value) => value,
                None => prompt_password_confirm()?,
            };
            add_account(&mut config, &service, &username, &password);
            save_config(&config, &config_path)?;
            println!(
                "Saved {service} account for {username} in {}",
                config_path.display()
            );
        }
        AccountCommand::Remove {
            service,
            username,
            config_path,
        } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let mut config = load_config(&config_path)?;
            if !remove_account(&mut config, &service, &username) {
                bail!("No account found for {service} {username}");
            }
            save_config(&config, &config_path)?;
            println!("Removed {service} account for {username}");
        }
        AccountCommand::List {
            service,
            config_path,
        } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let config = load_config(&config_path)?;
            let accounts: Vec<_> = iter_accounts(&config, service.as_deref()).collect();
            if accounts.is_empty() {
                bail!("No accounts configured.");
            }
            for account in accounts {
                let cookie = if account.cookie.is_some() { "cookie" } else { "no cookie" };
                println!("{}\t{}\t{cookie}", account.service, account.username);
            }
        }
        AccountCommand::SetCookie {
            service,
            username,
            cookie,
            config_path,
        } => {
            ytmusic::request_cookie(&cookie)?;
            let config_path = config_path.unwrap_or_else(default_config_path);
            let mut config = load_config(&config_path)?;
            let Some(account) = find_account_mut(&mut config, &service, &username) else {
                bail!("No account found for {service} {username}");
            };
            account.cookie = Some(cookie);
            save_config(&config, &config_path)?;
            println!("Saved YouTube Music cookie for {service} {username}");
        }
    }
    Ok(())
}

fn handle_scrobble(args: ScrobbleArgs) -> Result<()> {
    let config_path = args.config_path.unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;
    let accounts: Vec<_> = iter_accounts(&config, args.service.as_deref())
        .filter(|account| {
            args.username
                .as_deref()
                .is_none_or(|user| account.username == user)
        })
        .cloned()
        .collect();
    let account = match accounts.as_slice() {
        [] => bail!("No matching accounts configured."),
        [account] => account.clone(),
        _ => {
            let names: Vec<_> = accounts
                .iter()
                .map(|account| format!("{} {}", account.service, account.username))
                .collect();
            bail!(
                "Several accounts match ({}); choose one with --service and --username",
                names.join(", ")
            );
        }
    };
    let service = Service::parse(&account.service)?;

    let Some(cookie) = args.cookie.clone().or_else(|| account.cookie.clone()) else {
        bail!(
            "No YouTube Music cookie for {} {}; pass --cookie or run `account set-cookie`",
            account.service,
            account.username
        );
    };
    let db_path = args
        .db_path
        .clone()
        .or_else(|| account.db_path.clone())
        .unwrap_or_else(|| default_db_path(&account.service, &account.username));

    let lock = RunLock::for_database(&db_path)?;
    log::debug!("Holding run lock {}", lock.path().display());
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed opening database at {}", db_path.display()))?;
    let source = YtMusicClient::new(&cookie)?;

    let now = Utc::now();
    let window = match args.window_hours {
        Some(hours) => ClassificationWindow::rolling(now, Duration::hours(i64::from(hours))),
        None => local_day_window(now),
    };
    let options = RunOptions {
        reconcile: ReconcileOptions {
            replay_rule: args.replay_rule.into(),
            first_run_limit: Some(args.first_run_limit).filter(|limit| *limit > 0),
            ..ReconcileOptions::default()
        },
        dry_run: args.dry_run,
    };

    let sink: Box<dyn ScrobbleSink> = if args.dry_run {
        Box::new(Unconnected)
    } else {
        let session = resolve_session(&mut config, &config_path, service, &account)?;
        Box::new(ScrobbleClient::new(service, session, args.debug_response)?)
    };

    let report = pipeline::run(&source, sink.as_ref(), &db, window, &options, now)?;
    report.print(&Local);
    log::debug!("{} rows stored in {}", db.count()?, db_path.display());

    if report.halted == Some(FailureKind::Auth) {
        if let Some(stored) = find_account_mut(&mut config, &account.service, &account.username) {
            stored.session_key = None;
            save_config(&config, &config_path)?;
        }
        bail!(
            "{} rejected the session for {}; a new one will be requested next run",
            account.service,
            account.username
        );
    }
    if report.failed() > 0 {
        println!("Finished with {} scrobble failures.", report.failed());
    }
    Ok(())
}

/// Returns the cached session, or requests a new one and caches it.
fn resolve_session(
    config: &mut Config,
    config_path: &std::path::Path,
    service: Service,
    account: &Account,
) -> Result<Session> {
    let keys = match service.builtin_keys() {
        Some(keys) => keys,
        None => match get_service_keys(config, service.name()) {
            Some(keys) => keys.clone(),
            None => bail!(
                "Missing API keys for {}; run `service set-keys {}`",
                service.name(),
                service.name()
            ),
        },
    };
    if let Some(session_key) = &account.session_key {
        return Ok(Session {
            api_key: keys.api_key,
            api_secret: keys.api_secret,
            session_key: session_key.clone(),
        });
    }
    let session = Session::establish(service, &keys, account)
        .with_context(|| format!("Failed signing in to {} as {}", service.name(), account.username))?;
    if let Some(stored) = find_account_mut(config, &account.service, &account.username) {
        stored.session_key = Some(session.session_key.clone());
        save_config(config, config_path)?;
    }
    Ok(session)
}

/// Sink for dry runs; the pipeline never submits in that mode.
struct Unconnected;

impl ScrobbleSink for Unconnected {
    fn submit(&self, track: &ScrobbleTrack) -> Result<()> {
        bail!("Dry run: not submitting {} - {}", track.artist, track.title)
    }
}

fn prompt_password_confirm() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    let confirm = rpassword::prompt_password("Confirm password: ")?;
    if password != confirm {
        bail!("Passwords do not match.");
    }
    Ok(password)
}
