use std::{
    error::Error,
    io::{self, BufRead, Write},
    process::ExitCode,
};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use edgevisor::{
    clock::CancelToken,
    cli::{Cli, Commands, InstallMode, MenuChoice, confirm, parse_args, prompt_menu, prompt_plan},
    constants::{DEFAULT_LOG_LINES, ServiceName},
    logs::show_logs,
    plan::InstallPlan,
    runtime::RuntimeLayout,
    supervisor::Supervisor,
};

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            debug!("edgevisor failed: {err:?}");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);

    let cancel = CancelToken::new();
    register_signal_handler(cancel.clone())?;

    let layout = args
        .home
        .clone()
        .map(RuntimeLayout::new)
        .unwrap_or_else(RuntimeLayout::from_env);
    let install_deps = matches!(
        args.command,
        Some(Commands::Install {
            install_deps: true,
            ..
        })
    );
    let supervisor = Supervisor::new(layout)
        .with_cancel_token(cancel.clone())
        .with_tool_installation(install_deps);

    match args.command {
        Some(command) => run_command(&supervisor, command),
        None => run_menu(&supervisor, &cancel),
    }
}

fn run_command(supervisor: &Supervisor, command: Commands) -> Result<(), Box<dyn Error>> {
    let flags = command.flag_plan();
    match command {
        Commands::Install { mode, plan, .. } => {
            let mut install_plan = flags.unwrap_or_default();
            if let Some(path) = plan {
                install_plan = install_plan.or(InstallPlan::from_yaml_file(&path)?);
            }
            let stdin = io::stdin();
            install(
                supervisor,
                mode.unwrap_or_default(),
                install_plan,
                &mut stdin.lock(),
            )
        }
        Commands::Status { json } => status(supervisor, json),
        Commands::Logs { service, lines } => logs(supervisor, service, lines),
        Commands::Restart => {
            let report = supervisor.restart()?;
            print!("{report}");
            Ok(())
        }
        Commands::Stop => stop(supervisor),
        Commands::Uninstall { yes } => {
            let stdin = io::stdin();
            uninstall(supervisor, yes, &mut stdin.lock())
        }
    }
}

/// Serves menu choices until the operator quits or input ends.
///
/// A failed operation is reported and the menu is shown again.
fn run_menu(supervisor: &Supervisor, cancel: &CancelToken) -> Result<(), Box<dyn Error>> {
    let stdin = io::stdin();
    let mut input = stdin.lock();
    loop {
        cancel.reset();
        let result = match prompt_menu(&mut input, &mut io::stdout())? {
            MenuChoice::Install(mode) => {
                install(supervisor, mode, InstallPlan::default(), &mut input)
            }
            MenuChoice::Status => status(supervisor, false),
            MenuChoice::Logs => logs(supervisor, None, DEFAULT_LOG_LINES),
            MenuChoice::Restart => supervisor
                .restart()
                .map(|report| print!("{report}"))
                .map_err(Into::into),
            MenuChoice::Stop => stop(supervisor),
            MenuChoice::Uninstall => uninstall(supervisor, false, &mut input),
            MenuChoice::Quit => return Ok(()),
        };
        if let Err(err) = result {
            debug!("Menu operation failed: {err:?}");
            eprintln!("Error: {err}");
        }
        println!();
    }
}

fn install<R: BufRead>(
    supervisor: &Supervisor,
    mode: InstallMode,
    plan: InstallPlan,
    input: &mut R,
) -> Result<(), Box<dyn Error>> {
    let plan = match mode {
        InstallMode::Fast => plan,
        InstallMode::Guided => prompt_plan(input, &mut io::stdout(), plan)?,
    };
    let report = supervisor.install(plan.validate()?)?;
    print!("{report}");
    Ok(())
}

fn status(supervisor: &Supervisor, json: bool) -> Result<(), Box<dyn Error>> {
    let report = supervisor.status()?;
    if json {
        println!("{}", report.to_json()?);
    } else {
        print!("{report}");
    }
    Ok(())
}

fn logs(
    supervisor: &Supervisor,
    service: Option<ServiceName>,
    lines: usize,
) -> Result<(), Box<dyn Error>> {
    let services = match service {
        Some(service) => vec![service],
        None => ServiceName::LAUNCH_ORDER.to_vec(),
    };
    for service in services {
        info!("Fetching logs for service: {service}");
        show_logs(service, &supervisor.log_path(service), lines)?;
    }
    Ok(())
}

fn stop(supervisor: &Supervisor) -> Result<(), Box<dyn Error>> {
    let report = supervisor.stop()?;
    for (service, pid) in report.survivors() {
        warn!("Service '{service}' (PID {pid}) survived SIGKILL; investigate it manually");
    }
    println!("Services stopped");
    Ok(())
}

fn uninstall<R: BufRead>(
    supervisor: &Supervisor,
    assume_yes: bool,
    input: &mut R,
) -> Result<(), Box<dyn Error>> {
    let root = supervisor.layout().root().display().to_string();
    let mut stdout = io::stdout();
    if !assume_yes
        && !confirm(
            input,
            &mut stdout,
            &format!("Stop all services and delete edgevisor state under {root}?"),
        )?
    {
        writeln!(stdout, "Uninstall cancelled")?;
        return Ok(());
    }

    let report = supervisor.uninstall()?;
    for (service, pid) in report.survivors() {
        warn!("Service '{service}' (PID {pid}) survived SIGKILL; investigate it manually");
    }
    println!("Removed edgevisor state under {root}");
    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// First Ctrl-C interrupts hostname discovery; a second one exits immediately.
fn register_signal_handler(cancel: CancelToken) -> Result<(), Box<dyn Error>> {
    ctrlc::set_handler(move || {
        if cancel.is_cancelled() {
            std::process::exit(130);
        }
        eprintln!("Interrupted; finishing the current step (press Ctrl-C again to abort)");
        cancel.cancel();
    })?;

    Ok(())
}
