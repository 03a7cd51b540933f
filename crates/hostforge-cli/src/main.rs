mod cmd;
mod output;
mod prompt;

use clap::{Parser, Subcommand};
use cmd::{
    cert::CertSubcommand, config::ConfigSubcommand, provision::ProvisionArgs, reset::ResetArgs,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "hostforge",
    about = "Provision, validate and tear down a web app stack on a single host",
    version,
    propagate_version = true
)]
struct Cli {
    /// Filesystem root of the target host
    #[arg(long, global = true, env = "HOSTFORGE_ROOT", default_value = "/")]
    root: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the host to a fully provisioned state
    Provision(ProvisionArgs),

    /// Tear everything down so the host inspects as absent
    Reset(ResetArgs),

    /// Run the post-install checks and write the report
    Validate,

    /// Show the deployment state and certificate status
    Status,

    /// Manage the TLS certificate
    Cert {
        #[command(subcommand)]
        subcommand: CertSubcommand,
    },

    /// Inspect the persisted configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Provision(_) | Commands::Reset(_) => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = cli.root.as_path();
    let result = match cli.command {
        Commands::Provision(args) => cmd::provision::run(root, args, cli.json),
        Commands::Reset(args) => cmd::reset::run(root, args, cli.json),
        Commands::Validate => cmd::validate::run(root, cli.json),
        Commands::Status => cmd::status::run(root, cli.json),
        Commands::Cert { subcommand } => cmd::cert::run(root, subcommand, cli.json),
        Commands::Config { subcommand } => cmd::config::run(root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        let log = hostforge_core::paths::log_path(root);
        if log.exists() {
            eprintln!("full log: {}", log.display());
        }
        std::process::exit(1);
    }
}
