// ABOUTME: Command line argument definitions and parsing using Clap
// ABOUTME: Defines the taskweave CLI structure and its validate, plan and config subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "taskweave")]
#[command(about = "Dependency-aware task scheduling and workflow orchestration")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(short, long, global = true, help = "Path to configuration file")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Disable colored output")]
    pub no_color: bool,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Commands {
    /// Validate a task file or workflow definition
    Validate {
        #[arg(help = "Path to task or workflow YAML file")]
        file: PathBuf,

        #[arg(short, long, help = "Treat the file as a workflow definition")]
        workflow: bool,
    },

    /// Show the phased execution plan for a task file
    Plan {
        #[arg(help = "Path to task YAML file")]
        file: PathBuf,

        #[arg(long, help = "Print the dependency graph in Graphviz DOT format")]
        dot: bool,
    },

    /// Print the effective configuration
    Config,
}

impl Args {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
