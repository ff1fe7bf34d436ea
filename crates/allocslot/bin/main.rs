mod cmd;
use clap::{Parser, Subcommand};
use cmd::resolve::ResolveArgs;
use cmd::run::RunArgs;
use cmd::slots::SlotsArgs;
use eyre::Result;
use tracing_subscriber::EnvFilter;

#[derive(Subcommand, Debug)]
pub enum ASSubcommand {
    #[command(about = "List every replaceable entry point")]
    Slots(SlotsArgs),
    #[command(about = "Show which entry point a single request resolves to")]
    Resolve(ResolveArgs),
    #[command(about = "Run built-in or JSON scenarios and check the slot counters")]
    Run(RunArgs),
}

#[derive(Parser, Debug)]
#[command(
    version,
    about,
    long_about = "allocslot CLI: inspect how allocation requests resolve to replaceable entry points

Set RUST_LOG=debug or RUST_LOG=trace to see installation and resolution events."
)]
pub struct ASArgs {
    #[command(subcommand)]
    pub cmd: ASSubcommand,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let root_args = ASArgs::parse();

    match root_args.cmd {
        ASSubcommand::Slots(args) => {
            args.run()?;
        }
        ASSubcommand::Resolve(args) => {
            args.run()?;
        }
        ASSubcommand::Run(args) => {
            args.run()?;
        }
    }

    Ok(())
}
