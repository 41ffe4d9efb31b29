mod app;
mod config;
mod core;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use crate::app::{Settings, Watcher};
use crate::config::{default_config_path, Config, FileConfig};
use crate::core::imap::ImapConnector;
use crate::core::network;
use crate::core::notify::DesktopPresenter;
use crate::core::viewer::ProcessLauncher;

const APP_NAME: &str = "mail";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Desktop new-mail notifier.
#[derive(Parser)]
#[command(name = "mailwatch", version, about)]
struct Args {
    /// Config file (defaults to $XDG_CONFIG_HOME/mailwatch/config.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read a password from stdin and store it in the keyring, then exit.
    #[arg(long)]
    store_password: bool,
}

/// Read one line from stdin and put it in the keyring for the configured account.
fn store_password(path: Option<PathBuf>) -> Result<(), String> {
    let path = path.unwrap_or_else(default_config_path);
    let fc = FileConfig::load(&path)?.ok_or_else(|| format!("no config at {}", path.display()))?;

    eprintln!("Password for {}@{}:", fc.username, fc.server);
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .map_err(|e| format!("read password: {e}"))?;
    let password = line.trim_end_matches(['\r', '\n']);
    if password.is_empty() {
        return Err("empty password".into());
    }
    crate::core::keyring::set_password(&fc.username, &fc.server, password)?;
    log::info!("Password stored in keyring for {}@{}", fc.username, fc.server);
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.store_password {
        store_password(args.config)?;
        return Ok(());
    }

    let config = Config::resolve(args.config.as_deref())?;
    log::info!(
        "Watching {} on {}@{}",
        config.mailbox,
        config.username,
        config.imap_server
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let watcher = Watcher::new(
            Settings::from_config(&config),
            Arc::new(ImapConnector::new(&config)),
            Arc::new(DesktopPresenter::new(APP_NAME)),
            Arc::new(ProcessLauncher),
        );
        let online = network::observe(network::source_for(&config.network));
        watcher.run(online).await;
    });
    // Notification waits run on blocking threads that only return once the
    // server reports the notification gone.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_config_and_store_password() {
        let args = Args::parse_from(["mailwatch", "--config", "/tmp/mw.json", "--store-password"]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/mw.json")));
        assert!(args.store_password);

        let args = Args::parse_from(["mailwatch"]);
        assert_eq!(args.config, None);
        assert!(!args.store_password);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(Args::try_parse_from(["mailwatch", "--frobnicate"]).is_err());
    }
}
