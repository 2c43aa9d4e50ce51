//! Command-line interface for memcache-session.
//!
//! Uses lexopt for minimal binary size overhead (~34KB).

use std::ffi::OsString;
use std::path::PathBuf;

use crate::session::SessionId;

/// Operation to run against the session store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Probe every configured server.
    Check,
    /// Create an empty session and print its identifier.
    New,
    /// Print a stored session.
    Show(SessionId),
    /// Destroy a stored session.
    Drop(SessionId),
}

/// Command-line arguments.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// Memcached servers (overrides config file).
    pub servers: Vec<String>,
    /// Key namespace (overrides config file).
    pub namespace: Option<String>,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Log deleted and updated keys on save.
    pub verbose: bool,
    /// Operation to run.
    pub command: Option<Command>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => {
                result.help = true;
            }
            Short('V') | Long("version") => {
                result.version = true;
            }
            Short('s') | Long("server") => {
                let value: String = parser.value()?.parse()?;
                result.servers.push(value);
            }
            Short('n') | Long("namespace") => {
                result.namespace = Some(parser.value()?.parse()?);
            }
            Short('c') | Long("config") => {
                result.config = Some(parser.value()?.parse()?);
            }
            Short('l') | Long("log-level") => {
                result.log_level = Some(parser.value()?.parse()?);
            }
            Short('v') | Long("verbose") => {
                result.verbose = true;
            }
            Value(val) if result.command.is_none() => {
                let name = val.to_string_lossy().into_owned();
                result.command = Some(match name.as_str() {
                    "check" => Command::Check,
                    "new" => Command::New,
                    "show" => Command::Show(session_id(&mut parser)?),
                    "drop" => Command::Drop(session_id(&mut parser)?),
                    _ => return Err(ArgsError::UnknownCommand(name)),
                });
            }
            Value(val) => {
                return Err(ArgsError::UnexpectedArgument(val.to_string_lossy().into()));
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

fn session_id(parser: &mut lexopt::Parser) -> Result<SessionId, ArgsError> {
    use lexopt::prelude::*;

    let value: String = parser
        .value()
        .map_err(|_| ArgsError::MissingValue("session id"))?
        .parse()?;
    value
        .parse()
        .map_err(|_| ArgsError::InvalidValue("session id", value))
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"memcache-session {version}
Inspect and manage web sessions stored in memcached

USAGE:
    memcache-session [OPTIONS] <COMMAND>

COMMANDS:
    check                   Probe the configured servers
    new                     Create an empty session and print its id
    show <ID>               Print a stored session as JSON
    drop <ID>               Destroy a stored session

OPTIONS:
    -s, --server <ADDR>     Memcached server, repeatable [default: 127.0.0.1:11211]
    -n, --namespace <NS>    Session key namespace [default: rack:session]
    -c, --config <FILE>     Path to configuration file (JSON)
    -l, --log-level <LVL>   Log level (error, warn, info, debug, trace)
    -v, --verbose           Log deleted and updated keys on save
    -h, --help              Print help
    -V, --version           Print version

ENVIRONMENT VARIABLES:
    MEMCACHE_SESSION_SERVERS    Comma separated servers (overrides config)
    MEMCACHE_SESSION_NAMESPACE  Namespace (overrides config)
    MEMCACHE_SESSION_VERBOSE    Log key diffs on save (1/true/yes)
    MEMCACHE_SESSION_LOG_LEVEL  Log level (overrides config)
    RUST_LOG                    Alternative log level setting

EXAMPLES:
    # Check the local memcached
    memcache-session check

    # Inspect a session in a shared pool
    memcache-session -s cache-a:11211 -s cache-b:11211 -n shop:session show 4f2a9c...

    # Log out a user
    memcache-session drop 4f2a9c...
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("memcache-session {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug)]
pub enum ArgsError {
    /// Lexopt parsing error.
    Lexopt(lexopt::Error),
    /// Invalid argument value.
    InvalidValue(&'static str, String),
    /// A command is missing its argument.
    MissingValue(&'static str),
    /// Unrecognized command.
    UnknownCommand(String),
    /// Unexpected positional argument.
    UnexpectedArgument(String),
}

impl std::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lexopt(e) => write!(f, "{}", e),
            Self::InvalidValue(name, value) => {
                write!(f, "invalid {}: '{}'", name, value)
            }
            Self::MissingValue(name) => write!(f, "missing {}", name),
            Self::UnknownCommand(cmd) => write!(f, "unknown command: '{}'", cmd),
            Self::UnexpectedArgument(arg) => {
                write!(f, "unexpected argument: '{}'", arg)
            }
        }
    }
}

impl std::error::Error for ArgsError {}

impl From<lexopt::Error> for ArgsError {
    fn from(e: lexopt::Error) -> Self {
        Self::Lexopt(e)
    }
}
