use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Arg, Command};
use ldap_passthrough::auth::{AuthenticationPolicy, AuthenticationPolicyState};
use ldap_passthrough::{Config, Entry, EntryStore, LdapProvider, PassThroughPolicyFactory, PtaError, StaticSchema};
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::FmtSubscriber;

/// There is no local directory behind the command line tool, so cache
/// updates are only reported.
struct LoggingEntryStore;

#[async_trait]
impl EntryStore for LoggingEntryStore {
    async fn replace_attributes(
        &self,
        dn: &str,
        attributes: Vec<(String, Vec<String>)>,
    ) -> Result<(), PtaError> {
        let names: Vec<_> = attributes.iter().map(|(name, _)| name.as_str()).collect();
        info!("Would update {} on {}", names.join(", "), dn);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("ldap-pta")
        .version("0.1.0")
        .about("Check a password against remote LDAP servers using a pass-through authentication policy")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("config.yml"),
        )
        .arg(
            Arg::new("generate-config")
                .short('g')
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .conflicts_with("config"),
        )
        .arg(
            Arg::new("dn")
                .short('D')
                .long("dn")
                .value_name("DN")
                .help("DN of the local entry to authenticate")
                .required_unless_present("generate-config"),
        )
        .arg(
            Arg::new("attr")
                .short('a')
                .long("attr")
                .value_name("NAME=VALUE")
                .help("Attribute value of the local entry (repeatable)")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("password")
                .short('w')
                .long("password")
                .value_name("PASSWORD")
                .help("Password to check; read from standard input when omitted"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .num_args(0)
                .help("Enable verbose logging")
                .action(clap::ArgAction::Count),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .num_args(0)
                .help("Suppress all output except errors")
                .action(clap::ArgAction::SetTrue)
                .conflicts_with("verbose"),
        )
        .get_matches();

    if let Some(config_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(config_path)?;
        return Ok(());
    }

    let config_path = matches
        .get_one::<String>("config")
        .ok_or_else(|| anyhow!("no configuration file given"))?;
    let config = Config::load_from_file(config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    let guard = setup_logging(&config, &matches)?;
    info!("Loaded configuration from {}", config_path);

    let entry = build_entry(&matches)?;
    let password = match matches.get_one::<String>("password") {
        Some(password) => password.clone(),
        None => read_password()?,
    };

    let provider = Arc::new(LdapProvider::new(config.properties.clone()));
    let factory = PassThroughPolicyFactory::new(
        provider,
        Arc::new(StaticSchema::permissive()),
        Arc::new(LoggingEntryStore),
    );
    let policy = factory.create_authentication_policy(config.policy.clone())?;

    let mut state = policy.create_authentication_policy_state(entry);
    let result = state.password_matches(&password).await;
    let code = match result {
        Ok(true) => {
            state.finalize_state_after_bind().await;
            println!("Authentication succeeded for {}", state.entry().dn());
            0
        }
        Ok(false) => {
            println!("Invalid credentials for {}", state.entry().dn());
            1
        }
        Err(e) => {
            error!("{}", e);
            2
        }
    };

    policy.finalize_authentication_policy().await;
    drop(guard);
    std::process::exit(code);
}

fn build_entry(matches: &clap::ArgMatches) -> Result<Entry> {
    let dn = matches
        .get_one::<String>("dn")
        .ok_or_else(|| anyhow!("--dn is required"))?;
    let mut entry = Entry::new(dn);
    for attr in matches.get_many::<String>("attr").into_iter().flatten() {
        let (name, value) = attr
            .split_once('=')
            .ok_or_else(|| anyhow!("invalid attribute {}: expected NAME=VALUE", attr))?;
        entry.add_values(name.trim(), vec![value.to_string()]);
    }
    Ok(entry)
}

fn read_password() -> Result<String> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from standard input")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn generate_default_config(path: &str) -> Result<()> {
    let config = Config::default();
    config.save_to_file(path)?;

    println!("Generated default configuration file: {}", path);
    println!("Edit this file to point the policy at your remote LDAP servers.");

    Ok(())
}

fn setup_logging(config: &Config, matches: &clap::ArgMatches) -> Result<Option<WorkerGuard>> {
    let log_level = if matches.get_flag("quiet") {
        Level::ERROR
    } else {
        match matches.get_count("verbose") {
            0 => match config.logging.level.as_str() {
                "trace" => Level::TRACE,
                "debug" => Level::DEBUG,
                "info" => Level::INFO,
                "warn" => Level::WARN,
                "error" => Level::ERROR,
                _ => Level::INFO,
            },
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    match &config.logging.file {
        Some(file) => {
            let path = Path::new(file);
            let directory = path.parent().unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .ok_or_else(|| anyhow!("invalid log file path {}", file))?;
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(directory, name));
            let subscriber = builder.with_ansi(false).with_writer(writer).finish();
            tracing::subscriber::set_global_default(subscriber)?;
            Ok(Some(guard))
        }
        None if config.logging.console => {
            tracing::subscriber::set_global_default(builder.finish())?;
            Ok(None)
        }
        None => Ok(None),
    }
}
