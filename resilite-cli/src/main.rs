use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

use commands::{Access, CliError, Output};

#[derive(Parser, Debug)]
#[command(name = "resilite", version = "0.3.0")]
#[command(about = "Resilite CLI - inspect, check, back up and restore managed databases")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database directory (overrides the config file)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Database file name inside the directory
    #[arg(long, global = true)]
    file: Option<String>,

    /// Emit JSON instead of text, for both results and logs
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Schema version, pending migrations and pool occupancy
    Status,
    /// Run a health check now
    Health,
    /// Integrity, corruption and consistency checks
    Check {
        /// Correct consistency violations and attempt repair
        #[arg(long)]
        repair: bool,
    },
    /// Take a backup of the database
    Backup,
    /// List backups, newest first
    Backups,
    /// Replace the database with a backup
    Restore {
        /// Backup database file or backup directory
        path: PathBuf,
    },
    /// Health trends over repeated checks
    Trends {
        /// Number of checks to run
        #[arg(long, default_value_t = 5)]
        samples: usize,
    },
}

fn init_logging(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn run(cli: Cli) -> Result<(), CliError> {
    let output = Output::new(cli.json);
    let config = commands::load_config(cli.config.as_deref(), cli.dir, cli.file)?;

    let access = match &cli.command {
        Commands::Backups => return commands::backups(&config, &output),
        Commands::Check { repair: true } => Access::Repair,
        Commands::Restore { .. } => Access::Restore,
        _ => Access::Inspect,
    };
    let db = commands::open(config, access)?;

    let result = match cli.command {
        Commands::Status => commands::status(&db, &output),
        Commands::Health => commands::health(&db, &output),
        Commands::Check { repair } => commands::check(&db, &output, repair),
        Commands::Backup => commands::backup(&db, &output),
        Commands::Backups => Ok(()),
        Commands::Restore { path } => commands::restore(&db, &output, &path),
        Commands::Trends { samples } => commands::trends(&db, &output, samples),
    };

    if let Err(e) = db.shutdown() {
        tracing::warn!(error = %e, "shutdown did not complete cleanly");
    }
    result
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.json);

    if let Err(e) = run(cli) {
        tracing::error!(error = %e, "command failed");
        eprintln!("error: {}", e.user_message());
        std::process::exit(e.exit_code());
    }
}
