// ABOUTME: Main application orchestration for the taskweave CLI
// ABOUTME: Initializes logging from configuration and dispatches parsed subcommands

use anyhow::Result;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use super::commands;
use super::{Args, Commands, Config};

pub struct App {
    config: Config,
}

impl App {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Initialize logging based on configuration; RUST_LOG takes precedence
    pub fn init_logging(&self, verbose: bool, no_color: bool) -> Result<()> {
        let log_level = if verbose {
            "debug"
        } else {
            &self.config.logging.level
        };

        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_ansi(!no_color)
            .with_target(false)
            .with_writer(std::io::stderr);

        match self.config.logging.format.as_str() {
            "json" => builder.json().try_init(),
            "compact" => builder.compact().try_init(),
            _ => builder.try_init(),
        }
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

        debug!("Logging initialized with level: {}", log_level);
        Ok(())
    }

    pub async fn run(&self, args: Args) -> Result<()> {
        self.init_logging(args.verbose, args.no_color)?;

        info!("Starting taskweave v{}", crate::VERSION);
        debug!("Configuration loaded from: {:?}", args.config);

        match args.command {
            Commands::Validate { file, workflow } => {
                if workflow {
                    commands::validate_workflow(&file).await
                } else {
                    commands::validate_tasks(&file).await
                }
            }
            Commands::Plan { file, dot } => commands::plan_tasks(&file, dot).await,
            Commands::Config => commands::show_config(&self.config),
        }
    }

    /// Parse arguments and load the configuration they point at
    pub fn from_args() -> Result<(Self, Args)> {
        let args = Args::parse_args();
        let config = Config::load(args.config.clone())?;
        Ok((Self::new(config), args))
    }
}
