mod cmd;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ivee")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run(cmd::run::Cmd),
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(cmd) => cmd.execute(),
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
