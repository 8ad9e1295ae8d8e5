//! bleperiph CLI - peripheral demos on the simulated or BlueZ stack

use clap::Parser;
use tracing::{error, info};

use bleperiph_cli::{
    app::PeripheralApp,
    cli::{Cli, Commands},
    commands::CommandDispatcher,
    config::CliConfig,
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Printing the example config needs no peripheral
    if let Commands::ExampleConfig = cli.command {
        println!("{}", CliConfig::example_config());
        return Ok(());
    }

    // Load configuration
    let mut config = load_configuration(&cli)?;
    if let Some(name) = &cli.name {
        config.local_name = name.clone();
    }
    config.validate()?;

    // Bring up the native stack and the manager
    info!("Starting peripheral on the {} backend", cli.backend);
    let app = match PeripheralApp::new(config, cli.backend).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to start peripheral: {}", e);
            std::process::exit(1);
        }
    };

    // Execute the command
    if let Err(e) = CommandDispatcher::execute(cli.command, &app).await {
        error!("Command execution failed: {}", e);
        app.stop().await?;
        std::process::exit(1);
    }

    app.stop().await?;
    info!("Peripheral stopped");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> Result<CliConfig> {
    if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path);
        CliConfig::load_from_file(config_path)
    } else {
        info!("Using default configuration");
        Ok(CliConfig::default())
    }
}
