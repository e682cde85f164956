use clap::Parser;
use lokallm_cli::commands::export::{self, ExportArgs};

fn main() -> anyhow::Result<()> {
    let args = ExportArgs::parse();
    let config = args.common.bootstrap()?;
    export::execute(&args, &config)
}
