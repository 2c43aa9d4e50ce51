//! memcache-session binary entry point.

use std::process::ExitCode;

use memcache_session::cli::{self, Command};
use memcache_session::config::Config;
use memcache_session::{logging, SaveOptions, SaveOutcome, SessionData};
use tracing::{error, info};

fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }

    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let Some(command) = args.command.clone() else {
        cli::print_help();
        return ExitCode::from(2);
    };

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };

    let _ = logging::init_with_filter(config.log_filter());
    info!("memcache-session v{}", env!("CARGO_PKG_VERSION"));

    match run(&config, command) {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config, command: Command) -> memcache_session::Result<ExitCode> {
    let sessions = config.session_manager()?;
    info!(namespace = %config.store.namespace, "Session store ready");

    match command {
        Command::Check => {
            for (node, stats) in sessions.health()? {
                match stats {
                    Some(stats) => {
                        let items = stats.get("curr_items").map(String::as_str).unwrap_or("?");
                        let version = stats.get("version").map(String::as_str).unwrap_or("?");
                        println!("{}: up (version {}, {} items)", node, version, items);
                    }
                    None => println!("{}: down", node),
                }
            }
        }
        Command::New => {
            let loaded = sessions.load(None, false)?;
            match loaded.id {
                Some(id) => println!("{}", id),
                None => {
                    eprintln!("session not created: store unreachable");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Command::Show(id) => match sessions.fetch(&id)? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => {
                eprintln!("no session {}", id);
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::Drop(id) => {
            let outcome = sessions.save(
                &id,
                &SessionData::new(),
                &SaveOptions::new().drop_session(),
                false,
            )?;
            if outcome != SaveOutcome::Dropped {
                eprintln!("session {} not dropped: store unreachable", id);
                return Ok(ExitCode::FAILURE);
            }
            println!("dropped {}", id);
        }
    }

    Ok(ExitCode::SUCCESS)
}
