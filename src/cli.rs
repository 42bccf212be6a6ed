//! Command-line interface for edgevisor.
use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    str::FromStr,
};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::level_filters::LevelFilter;

use crate::{
    constants::{DEFAULT_LISTEN_PORT, DEFAULT_LOG_LINES, ServiceName},
    plan::{InstallPlan, TunnelPlan},
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// How `install` collects its settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum InstallMode {
    /// Use flags and defaults without asking anything.
    #[default]
    Fast,
    /// Prompt for each setting.
    Guided,
}

/// Command-line interface for edgevisor.
#[derive(Parser)]
#[command(name = "edgevisor", version, author)]
#[command(
    about = "Supervises a local proxy daemon and the tunnel that publishes it",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// State directory (defaults to $EDGEVISOR_HOME or ~/.local/share/edgevisor).
    #[arg(long, value_name = "DIR", global = true)]
    pub home: Option<PathBuf>,

    /// The command to execute; without one an interactive menu is shown.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available commands for edgevisor.
#[derive(Subcommand)]
pub enum Commands {
    /// Generate configuration and launch the proxy and tunnel.
    Install {
        /// `fast` uses flags and defaults; `guided` prompts for each setting.
        #[arg(value_enum)]
        mode: Option<InstallMode>,

        /// Client identity (UUID); generated when omitted.
        #[arg(long)]
        uuid: Option<String>,

        /// Local port the proxy listens on.
        #[arg(short, long)]
        port: Option<u16>,

        /// Tunnel token; selects a fixed tunnel.
        #[arg(long)]
        token: Option<String>,

        /// Public hostname bound to the tunnel token.
        #[arg(long)]
        domain: Option<String>,

        /// YAML install plan; flags take precedence over its values.
        #[arg(long, value_name = "FILE")]
        plan: Option<PathBuf>,

        /// Try the system package manager when an executable is missing.
        #[arg(long)]
        install_deps: bool,
    },

    /// Show service state and the public endpoint.
    Status {
        /// Emit machine-readable JSON output instead of a report.
        #[arg(long)]
        json: bool,
    },

    /// Show logs for one or both services.
    Logs {
        /// Service whose log should be displayed (`proxy` or `tunnel`).
        service: Option<ServiceName>,

        /// Number of lines to show.
        #[arg(short = 'n', long, default_value_t = DEFAULT_LOG_LINES)]
        lines: usize,
    },

    /// Stop both services and start them again with the installed settings.
    Restart,

    /// Stop both services.
    Stop,

    /// Stop both services and remove all persisted state.
    Uninstall {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

impl Commands {
    /// Install plan built from `install` flags; `None` for other commands.
    pub fn flag_plan(&self) -> Option<InstallPlan> {
        match self {
            Commands::Install {
                uuid,
                port,
                token,
                domain,
                ..
            } => Some(InstallPlan {
                identity: uuid.clone(),
                listen_port: *port,
                tunnel: TunnelPlan {
                    mode: None,
                    token: token.clone(),
                    hostname: domain.clone(),
                },
            }),
            _ => None,
        }
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Entry selected from the interactive menu.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MenuChoice {
    Install(InstallMode),
    Status,
    Logs,
    Restart,
    Stop,
    Uninstall,
    Quit,
}

const MENU: &str = "\
edgevisor
  1) Install (fast)
  2) Install (guided)
  3) Status
  4) Logs
  5) Restart
  6) Stop
  7) Uninstall
  0) Quit
";

/// Shows the menu and reads a choice, asking again on invalid input.
///
/// End of input counts as quitting.
pub fn prompt_menu<R: BufRead, W: Write>(input: &mut R, output: &mut W) -> io::Result<MenuChoice> {
    write!(output, "{MENU}")?;
    loop {
        let Some(answer) = ask(input, output, "Select an option: ")? else {
            return Ok(MenuChoice::Quit);
        };
        let choice = match answer.as_str() {
            "1" => MenuChoice::Install(InstallMode::Fast),
            "2" => MenuChoice::Install(InstallMode::Guided),
            "3" => MenuChoice::Status,
            "4" => MenuChoice::Logs,
            "5" => MenuChoice::Restart,
            "6" => MenuChoice::Stop,
            "7" => MenuChoice::Uninstall,
            "0" | "q" | "quit" => MenuChoice::Quit,
            other => {
                writeln!(output, "Unknown option '{other}'")?;
                continue;
            }
        };
        return Ok(choice);
    }
}

/// Prompts for install settings; blank answers keep the values in `defaults`.
///
/// A hostname is only asked for when a token was given.
pub fn prompt_plan<R: BufRead, W: Write>(
    input: &mut R,
    output: &mut W,
    defaults: InstallPlan,
) -> io::Result<InstallPlan> {
    let port_default = defaults.listen_port.unwrap_or(DEFAULT_LISTEN_PORT);
    let listen_port = loop {
        let question = format!("Listen port [{port_default}]: ");
        match ask(input, output, &question)? {
            None => break port_default,
            Some(answer) if answer.is_empty() => break port_default,
            Some(answer) => match answer.parse::<u16>() {
                Ok(port) if port > 0 => break port,
                _ => writeln!(output, "'{answer}' is not a valid port")?,
            },
        }
    };

    let identity = ask(input, output, "Client UUID (blank to generate): ")?
        .filter(|answer| !answer.is_empty())
        .or(defaults.identity);

    let token = ask(input, output, "Tunnel token (blank for a temporary hostname): ")?
        .filter(|answer| !answer.is_empty())
        .or(defaults.tunnel.token);

    let hostname = if token.is_some() {
        ask(input, output, "Public hostname for the token: ")?
            .filter(|answer| !answer.is_empty())
            .or(defaults.tunnel.hostname)
    } else {
        None
    };

    Ok(InstallPlan {
        identity,
        listen_port: Some(listen_port),
        tunnel: TunnelPlan {
            mode: defaults.tunnel.mode,
            token,
            hostname,
        },
    })
}

/// Asks a yes/no question; anything but `y`/`yes` is a no.
pub fn confirm<R: BufRead, W: Write>(input: &mut R, output: &mut W, question: &str) -> io::Result<bool> {
    let answer = ask(input, output, &format!("{question} [y/N]: "))?;
    Ok(matches!(
        answer.as_deref().map(str::to_ascii_lowercase).as_deref(),
        Some("y" | "yes")
    ))
}

fn ask<R: BufRead, W: Write>(input: &mut R, output: &mut W, question: &str) -> io::Result<Option<String>> {
    write!(output, "{question}")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim().to_string()))
}
