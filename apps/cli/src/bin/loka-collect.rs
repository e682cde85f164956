use clap::Parser;
use lokallm_cli::commands::collect::{self, CollectArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CollectArgs::parse();
    let config = args.common.bootstrap()?;
    collect::execute(args, &config).await
}
