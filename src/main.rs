// ABOUTME: Binary entry point for the taskweave CLI
// ABOUTME: Loads configuration from arguments and runs the selected subcommand

use anyhow::Result;
use taskweave::cli::App;

#[tokio::main]
async fn main() -> Result<()> {
    let (app, args) = App::from_args()?;
    app.run(args).await
}
