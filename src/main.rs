use clap::Parser;

use cronlease::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let settings = match cli::load_and_merge_config(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{:#}", e);
            eprintln!("{}", Cli::get_validation_help());
            std::process::exit(1);
        }
    };

    cli::init_logger_from_settings(&settings)?;
    tracing::debug!(
        version = cronlease::pkg_version(),
        app = %settings.application.name,
        "Configuration loaded"
    );

    if let Err(e) = cli::execute_command(&cli, settings, None).await {
        tracing::error!(error = ?e, "Command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
