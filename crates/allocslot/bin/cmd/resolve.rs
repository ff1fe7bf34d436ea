use allocslot::output::resolution_table;
use allocslot::{
    AllocationRequest, CounterRegistry, EntryPointSlot, FailureMode, Format, Handler, ObjectKind,
    OverrideTable, ResolutionEngine, SystemProvider,
};
use clap::{Parser, ValueEnum};
use eyre::{bail, Result};

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RequestOp {
    Allocate,
    Release,
    /// Release after a failed construction
    Unwind,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KindArg {
    Scalar,
    Array,
}

impl From<KindArg> for ObjectKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Scalar => ObjectKind::Scalar,
            KindArg::Array => ObjectKind::Array,
        }
    }
}

#[derive(Debug, Parser)]
pub struct ResolveArgs {
    #[arg(long, value_enum, help = "Request operation")]
    op: RequestOp,

    #[arg(long, value_enum, help = "Object kind")]
    kind: KindArg,

    #[arg(long, help = "Size in bytes")]
    size: usize,

    #[arg(long, help = "Required alignment in bytes")]
    align: usize,

    #[arg(long, help = "Report allocation failure with a null result instead of an error")]
    nothrow: bool,

    #[arg(long = "unsized", help = "Release without the original size")]
    without_size: bool,

    #[arg(long = "replace", value_name = "SLOT", help = "Install a pass-through override for SLOT")]
    replace: Vec<String>,

    #[arg(long, value_enum, default_value_t = Format::Table, help = "Output format")]
    format: Format,
}

impl ResolveArgs {
    pub fn run(&self) -> Result<()> {
        match self.op {
            RequestOp::Release if self.nothrow => {
                bail!("--nothrow does not apply to --op release; use --op unwind for the nothrow release slots")
            }
            RequestOp::Allocate | RequestOp::Unwind if self.without_size => {
                bail!("--unsized only applies to --op release")
            }
            _ => {}
        }

        let mut table = OverrideTable::new();
        for name in &self.replace {
            let slot: EntryPointSlot = name.parse()?;
            table.install(slot, Handler::passthrough(slot.operation()))?;
        }

        let failure_mode = if self.nothrow {
            FailureMode::Reporting
        } else {
            FailureMode::Throwing
        };
        let request = AllocationRequest::new(self.kind.into(), self.size, self.align)
            .with_failure_mode(failure_mode);

        let counters = CounterRegistry::new();
        let engine = ResolutionEngine::new(&table, &counters, SystemProvider);
        let resolution = match self.op {
            RequestOp::Allocate => engine.resolve_allocate(&request)?,
            RequestOp::Release => {
                let release = request.release();
                let release = if self.without_size {
                    release.without_size()
                } else {
                    release
                };
                engine.resolve_release(&release)?
            }
            RequestOp::Unwind => engine.resolve_unwind(&request)?,
        };

        match self.format {
            Format::Table => {
                resolution_table(&resolution).printstd();
            }
            Format::Json => println!("{}", serde_json::to_string(&resolution)?),
            Format::JsonPretty => println!("{}", serde_json::to_string_pretty(&resolution)?),
        }
        Ok(())
    }
}
