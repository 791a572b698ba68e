use clap::Parser;
use tracing::error;

use clipforge::cli::{Cli, Commands, commands};
use clipforge::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match logging::init_logging(&cli.log_dir) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("failed to initialize logging: {}", e);
            None
        }
    };

    let result = match &cli.command {
        Commands::Process(args) => commands::process(&cli.db, args).await,
        Commands::Queue { command } => commands::queue(&cli.db, command).await,
        Commands::Check => commands::check(&cli.db).await,
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {}", e);
            2
        }
    };

    std::process::exit(code);
}
