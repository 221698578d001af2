use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::process::ExitCode;
use std::sync::Arc;

use bunkerd::center::Center;
use bunkerd::comms::ApplicationCommand;
use bunkerd::config::{Config, StoredKey};
use bunkerd::log::{LogTarget, Logger};
use bunkerd::store::Store;
use bunkerd::{manager, util, vault};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{crate_authors, Arg, ArgAction, Command};
use nostr::nips::nip19::ToBech32;
use nostr::Keys;
use tokio::sync::mpsc;

fn main() -> ExitCode {
    // Set up the command-line interface.
    let cmd = Command::new("bunkerd")
        .version(env!("BUNKERD_BUILD_VERSION"))
        .author(crate_authors!())
        .next_line_help(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("bunker.json")
                .help("The configuration file"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("setup")
                .about("Initialise the configuration and the admin identity")
                .arg(
                    Arg::new("admin")
                        .long("admin")
                        .value_name("NPUB")
                        .action(ArgAction::Append)
                        .help("Add an administrator to the allow-list"),
                ),
        )
        .subcommand(
            Command::new("add")
                .about("Encrypt and store a secret key in the vault")
                .arg(
                    Arg::new("name")
                        .long("name")
                        .required(true)
                        .help("The vault name of the key"),
                ),
        )
        .subcommand(
            Command::new("start")
                .about("Unlock keys and run the bunker")
                .arg(
                    Arg::new("key")
                        .long("key")
                        .value_name("NAME")
                        .action(ArgAction::Append)
                        .help("Unlock this encrypted key (prompts for its passphrase)"),
                )
                .arg(
                    Arg::new("admin")
                        .long("admin")
                        .value_name("NPUB")
                        .action(ArgAction::Append)
                        .help("Add an administrator to the allow-list"),
                )
                .arg(
                    Arg::new("verbose")
                        .long("verbose")
                        .action(ArgAction::SetTrue)
                        .help("Log at the debug level"),
                ),
        );

    let matches = cmd.get_matches();
    let config_path = Utf8PathBuf::from(matches.get_one::<String>("config").unwrap());

    match matches.subcommand() {
        Some(("setup", sub)) => setup(&config_path, sub),
        Some(("add", sub)) => add(&config_path, sub),
        Some(("start", sub)) => start(&config_path, sub),
        _ => unreachable!("a subcommand is required"),
    }
}

/// Create (or update) the configuration and the admin identity.
fn setup(config_path: &Utf8Path, matches: &clap::ArgMatches) -> ExitCode {
    let mut config = if config_path.exists() {
        match Config::load(config_path) {
            Ok(config) => config,
            Err(error) => {
                eprintln!("The bunker couldn't be configured: {error}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config {
            path: config_path.to_owned(),
            ..Default::default()
        }
    };

    if config.admin.key.is_none() {
        let keys = Keys::generate();
        config.admin.key = Some(keys.secret_key().to_secret_hex());
        println!(
            "Generated the admin identity: {}",
            keys.public_key()
                .to_bech32()
                .unwrap_or_else(|_| keys.public_key().to_hex())
        );
    }
    if config.admin.secret.is_none() {
        config.admin.secret = Some(util::random_hex(16));
    }

    if let Some(npubs) = matches.get_many::<String>("admin") {
        config.merge_admins(npubs.map(String::as_str));
    }

    if let Err(error) = config.save() {
        eprintln!("Cannot write '{config_path}': {error}");
        return ExitCode::FAILURE;
    }
    println!("Configuration written to '{config_path}'");

    if config.admin.npubs.is_empty() {
        println!("No admins yet; add one with 'setup --admin <npub>'");
    }

    ExitCode::SUCCESS
}

/// Encrypt a secret key and store it in the vault.
fn add(config_path: &Utf8Path, matches: &clap::ArgMatches) -> ExitCode {
    let mut config = match Config::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("The bunker couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };

    let name = matches.get_one::<String>("name").unwrap();
    if config.keys.contains_key(name) {
        eprintln!("A key named '{name}' already exists");
        return ExitCode::FAILURE;
    }

    print!("Secret key (nsec or hex): ");
    let _ = std::io::stdout().flush();
    let mut secret = String::new();
    if std::io::stdin().lock().read_line(&mut secret).is_err() {
        eprintln!("Cannot read the secret key");
        return ExitCode::FAILURE;
    }
    let keys = match Keys::parse(secret.trim()) {
        Ok(keys) => keys,
        Err(_) => {
            eprintln!("The secret is not a valid key");
            return ExitCode::FAILURE;
        }
    };

    let passphrase = match rpassword::prompt_password("Passphrase: ") {
        Ok(passphrase) if !passphrase.is_empty() => passphrase,
        Ok(_) => {
            eprintln!("An empty passphrase is not allowed here; keys without one are stored plain");
            return ExitCode::FAILURE;
        }
        Err(error) => {
            eprintln!("Cannot read the passphrase: {error}");
            return ExitCode::FAILURE;
        }
    };

    let stored = vault::store_secret(&keys.secret_key().to_secret_hex(), Some(passphrase.as_str()));
    config.keys.insert(name.clone(), stored);
    if let Err(error) = config.save() {
        eprintln!("Cannot write '{config_path}': {error}");
        return ExitCode::FAILURE;
    }

    println!(
        "Stored key '{name}' ({})",
        keys.public_key()
            .to_bech32()
            .unwrap_or_else(|_| keys.public_key().to_hex())
    );
    ExitCode::SUCCESS
}

/// Unlock keys and run the daemon.
fn start(config_path: &Utf8Path, matches: &clap::ArgMatches) -> ExitCode {
    // An unreadable vault file is fatal at boot.
    let mut config = match Config::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("The bunker couldn't be configured: {error}");
            return ExitCode::FAILURE;
        }
    };
    config.apply_env();
    if let Some(npubs) = matches.get_many::<String>("admin") {
        config.merge_admins(npubs.map(String::as_str));
    }
    if matches.get_flag("verbose") {
        config.verbose = true;
    }

    if config.admin.key.is_none() {
        eprintln!("No admin identity configured; run 'setup' first");
        return ExitCode::FAILURE;
    }

    // Activate the configured logging setup.
    let target = match &config.logs {
        Some(path) => LogTarget::File(path.clone().into_boxed_path()),
        None => LogTarget::Stderr,
    };
    if let Err(error) = Logger::launch(&target, config.verbose) {
        eprintln!("The logger couldn't be started: {error}");
        return ExitCode::FAILURE;
    }

    let store = match Store::open(&config.database_path()) {
        Ok(store) => store,
        Err(error) => {
            tracing::error!("Cannot open the state store: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Unlock keys: every plain key, plus the named encrypted ones.
    let requested: Vec<&String> = matches
        .get_many::<String>("key")
        .map(|keys| keys.collect())
        .unwrap_or_default();
    let mut unlocked: Vec<(String, Keys)> = Vec::new();
    for (name, stored) in &config.keys {
        match stored {
            StoredKey::Plain { .. } => match vault::unlock_stored(stored, None) {
                Ok(keys) => unlocked.push((name.clone(), keys)),
                Err(error) => {
                    tracing::error!("Cannot load key '{name}': {error}");
                    return ExitCode::FAILURE;
                }
            },
            StoredKey::Encrypted { .. } if requested.contains(&name) => {
                let prompt = format!("Passphrase for '{name}': ");
                let passphrase = match rpassword::prompt_password(prompt) {
                    Ok(passphrase) => passphrase,
                    Err(error) => {
                        tracing::error!("Cannot read the passphrase: {error}");
                        return ExitCode::FAILURE;
                    }
                };
                match vault::unlock_stored(stored, Some(passphrase.as_str())) {
                    Ok(keys) => unlocked.push((name.clone(), keys)),
                    Err(error) => {
                        tracing::error!("Cannot unlock key '{name}': {error}");
                        return ExitCode::FAILURE;
                    }
                }
            }
            StoredKey::Encrypted { .. } => {
                tracing::info!("Key '{name}' stays locked; unlock it via the admin channel");
            }
        }
    }

    // Set up an async runtime.
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("Couldn't start Tokio: {error}");
            return ExitCode::FAILURE;
        }
    };

    // Enter the runtime.
    runtime.block_on(async {
        let (app_cmd_tx, mut app_cmd_rx) = mpsc::unbounded_channel();
        let center = Arc::new(Center::new(config, store, app_cmd_tx));

        for (name, keys) in unlocked {
            let pubkey = keys.public_key().to_hex();
            center.insert_active_key(&name, keys);
            if let Err(error) = center.store.add_key_row(&name, &pubkey) {
                tracing::error!("Cannot register key '{name}': {error}");
                return ExitCode::FAILURE;
            }
        }

        // Spawn the units.
        let mut unit_txs = HashMap::new();
        if let Err(err) = manager::spawn(&center, &mut unit_txs).await {
            tracing::error!("Failed to spawn units: {err}");
            return ExitCode::FAILURE;
        }

        let result = loop {
            tokio::select! {
                // Watch for CTRL-C (SIGINT).
                res = tokio::signal::ctrl_c() => {
                    if let Err(error) = res {
                        tracing::error!("Listening for CTRL-C (SIGINT) failed: {error}");
                        break ExitCode::FAILURE;
                    }
                    break ExitCode::SUCCESS;
                }

                () = manager::forward_app_cmds(&mut app_cmd_rx, &unit_txs) => {}
            }
        };

        // Shut down the bunker.
        for (_name, tx) in unit_txs {
            let _ = tx.send(ApplicationCommand::Terminate);
            tx.closed().await;
        }

        // Drop the unlocked secrets.
        center
            .active_keys
            .store(Arc::new(HashMap::new()));

        result
    })
}
