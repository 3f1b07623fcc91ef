//! venomq - inspect and drive VenomQueue shared memory queues
//!
//!   - main.rs: argument parsing and command output
//!   - logging.rs: tracing subscriber setup

mod logging;

use clap::{Parser, Subcommand};
use console::style;
use std::io::{self, Read};
use std::process::ExitCode;
use venom_queue::{diagnose, Diagnostic, OpenFlags, Queue, QueueConfig, QueueError, QueueState, QueueStats};

#[derive(Parser)]
#[command(name = "venomq")]
#[command(about = "🐍 VenomQueue shared memory message queues", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a queue, or report the shape of an existing one
    Create {
        /// Queue name (a leading '/' is added if missing)
        name: String,

        /// Number of slots [default: VENOM_QUEUE_CAPACITY or 1024]
        #[arg(short, long)]
        capacity: Option<usize>,

        /// Largest message in bytes [default: VENOM_QUEUE_SLOT_SIZE or 4096]
        #[arg(short, long)]
        slot_size: Option<usize>,
    },

    /// Push a message (read from stdin when omitted)
    Push {
        name: String,
        message: Option<String>,
    },

    /// Pop and print messages
    Pop {
        name: String,

        /// Number of messages to pop
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
    },

    /// Print the oldest message without removing it
    Peek { name: String },

    /// Show queue occupancy and counters
    Stats {
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// Inspect a queue without locking it
    Diagnose {
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// Remove a queue name
    Unlink { name: String },
}

fn main() -> ExitCode {
    logging::setup_logging(logging::Environment::from_env());
    let cli = Cli::parse();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{} {} ({})",
                style("❌").red(),
                style(&e).red(),
                style(e.status()).dim()
            );
            ExitCode::FAILURE
        }
    }
}

fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Create {
            name,
            capacity,
            slot_size,
        } => create(&name, capacity, slot_size),
        Commands::Push { name, message } => push(&name, message),
        Commands::Pop { name, count } => pop(&name, count),
        Commands::Peek { name } => peek(&name),
        Commands::Stats { name, json } => stats(&name, json),
        Commands::Diagnose { name, json } => diagnose_cmd(&name, json),
        Commands::Unlink { name } => {
            Queue::unlink(&name)?;
            println!("{} unlinked {}", style("✓").green(), style(&name).cyan());
            Ok(())
        }
    }
}

/// Queue errors plus the few failures that belong to the tool itself
#[derive(Debug)]
enum CliError {
    Queue(QueueError),
    Stdin(io::Error),
    Json(serde_json::Error),
}

impl CliError {
    fn status(&self) -> venom_queue::Status {
        match self {
            CliError::Queue(e) => e.status(),
            CliError::Stdin(_) | CliError::Json(_) => venom_queue::Status::SysErr,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Queue(e) => write!(f, "{}", e),
            CliError::Stdin(e) => write!(f, "failed to read message from stdin: {}", e),
            CliError::Json(e) => write!(f, "failed to encode JSON: {}", e),
        }
    }
}

impl From<QueueError> for CliError {
    fn from(e: QueueError) -> Self {
        CliError::Queue(e)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        CliError::Json(e)
    }
}

fn create(name: &str, capacity: Option<usize>, slot_size: Option<usize>) -> Result<(), CliError> {
    let defaults = QueueConfig::from_env();
    let config = defaults.clone().with_shape(
        capacity.unwrap_or(defaults.capacity),
        slot_size.unwrap_or(defaults.slot_size),
    );
    let queue = Queue::open_with(name, OpenFlags::CREATE | OpenFlags::PRODUCER, &config)?;

    if queue.is_creator() {
        println!("{} created {}", style("✓").green(), style(queue.name()).cyan());
    } else {
        println!(
            "{} {} already exists, keeping its shape",
            style("!").yellow(),
            style(queue.name()).cyan()
        );
    }
    println!("   Capacity:  {}", style(queue.capacity()).green());
    println!("   Slot size: {}", style(format_size(queue.slot_size())).green());
    Ok(())
}

fn push(name: &str, message: Option<String>) -> Result<(), CliError> {
    let data = match message {
        Some(m) => m.into_bytes(),
        None => {
            let mut buf = Vec::new();
            io::stdin().read_to_end(&mut buf).map_err(CliError::Stdin)?;
            buf
        }
    };
    let queue = Queue::open(name, 0, 0, OpenFlags::PRODUCER)?;
    queue.push(&data)?;
    println!(
        "{} pushed {} ({} queued)",
        style("✓").green(),
        format_size(data.len()),
        queue.len()?
    );
    Ok(())
}

fn pop(name: &str, count: usize) -> Result<(), CliError> {
    let queue = Queue::open(name, 0, 0, OpenFlags::CONSUMER)?;
    let mut buf = vec![0u8; queue.slot_size()];
    for popped in 0..count {
        match queue.pop(&mut buf) {
            Ok(len) => println!("{}", String::from_utf8_lossy(&buf[..len])),
            // draining fewer than requested is not an error once something came out
            Err(QueueError::Empty) if popped > 0 => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn peek(name: &str) -> Result<(), CliError> {
    let queue = Queue::open(name, 0, 0, OpenFlags::CONSUMER)?;
    let mut buf = vec![0u8; queue.slot_size()];
    let len = queue.peek(&mut buf)?;
    println!("{}", String::from_utf8_lossy(&buf[..len]));
    Ok(())
}

fn stats(name: &str, json: bool) -> Result<(), CliError> {
    let queue = Queue::open(name, 0, 0, OpenFlags::CONSUMER)?;
    let stats = queue.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_stats(queue.name(), &stats);
    }
    Ok(())
}

fn diagnose_cmd(name: &str, json: bool) -> Result<(), CliError> {
    let diag = diagnose(name)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&diag)?);
    } else {
        print_diagnostic(&diag);
    }
    Ok(())
}

fn print_stats(name: &str, stats: &QueueStats) {
    println!("{}", style("═══════════════════════════════════════════").cyan());
    println!("{}", style(format!("📊 {}", name)).cyan().bold());
    println!("{}", style("═══════════════════════════════════════════").cyan());
    println!(
        "   Messages:    {}/{} ({}%)",
        style(stats.count).green(),
        stats.capacity,
        stats.fill_level()
    );
    println!("   Slot size:   {}", format_size(stats.slot_size as usize));
    println!("   Head/Tail:   {}/{}", stats.head, stats.tail);
    println!("   Pushed:      {}", stats.total_pushed);
    println!("   Popped:      {}", stats.total_popped);
    println!("   Full hits:   {}", stats.full_events);
    println!("   Empty hits:  {}", stats.empty_events);
    if stats.lock_recoveries > 0 {
        println!("   Recoveries:  {}", style(stats.lock_recoveries).yellow());
    } else {
        println!("   Recoveries:  0");
    }
}

fn print_diagnostic(diag: &Diagnostic) {
    let state = format!("{:?}", diag.state);
    let state = match diag.state {
        QueueState::Healthy | QueueState::Empty => style(state).green(),
        QueueState::Incomplete | QueueState::StaleLock => style(state).yellow(),
        QueueState::VersionMismatch | QueueState::Corrupted => style(state).red(),
    };

    println!("{}", style(format!("🔍 {}", diag.name)).cyan().bold());
    println!("   State:       {}", state.bold());
    println!("   Magic:       {}", check_mark(diag.magic_ok));
    println!("   Version:     {}", check_mark(diag.version_ok));
    if diag.magic_ok && diag.version_ok {
        println!("   Shape:       {} x {}", diag.capacity, format_size(diag.slot_size as usize));
        println!("   Head/Tail:   {}/{}", diag.head, diag.tail);
        println!("   Count:       {}", diag.count);
        match (diag.lock_owner, diag.lock_owner_alive) {
            (Some(pid), Some(true)) => println!("   Lock:        held by pid {}", pid),
            (Some(pid), _) => println!("   Lock:        {}", style(format!("held by dead pid {}", pid)).yellow()),
            (None, _) => println!("   Lock:        free"),
        }
        if diag.repair_pending {
            println!("   Repair:      {}", style("interrupted operation pending").yellow());
        }
        println!("   Recoveries:  {}", diag.lock_recoveries);
    }
}

fn check_mark(ok: bool) -> console::StyledObject<&'static str> {
    if ok {
        style("ok").green()
    } else {
        style("bad").red()
    }
}

fn format_size(bytes: usize) -> String {
    if bytes >= 1024 * 1024 { format!("{} MB", bytes / (1024 * 1024)) }
    else if bytes >= 1024 { format!("{} KB", bytes / 1024) }
    else { format!("{} bytes", bytes) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_create_shape() {
        let cli = Cli::try_parse_from(["venomq", "create", "/jobs", "-c", "8", "--slot-size", "64"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Create { capacity: Some(8), slot_size: Some(64), .. }
        ));
    }

    #[test]
    fn test_parse_pop_count() {
        let cli = Cli::try_parse_from(["venomq", "pop", "jobs", "-n", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Pop { count: 3, .. }));
    }

    #[test]
    fn test_missing_queue_maps_to_not_found() {
        let name = format!("/venomq_cli_missing_{}", std::process::id());
        let err = run(Commands::Peek { name }).unwrap_err();
        assert_eq!(err.status(), venom_queue::Status::NotFound);
    }
}
