use clap::Parser;
use lokallm_cli::commands::train::{self, TrainArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = TrainArgs::parse();
    let config = args.common.bootstrap()?;
    train::execute(args, &config).await
}
