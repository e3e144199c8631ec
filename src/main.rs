use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the flush endpoint
    Serve,

    /// Run one flush cycle and print the report
    Flush,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => server::start_server().await,
        Command::Flush => {
            let report = server::flush_once().await?;
            println!("{}", serde_json::to_string(&report)?);

            Ok(())
        }
    }
}
