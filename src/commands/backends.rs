use std::io::{self, Write};

use anyhow::Result;

use super::write_json;
use crate::cli::BackendsArgs;
use crate::registry::ToolRegistry;

pub fn run(args: BackendsArgs) -> Result<()> {
    let registry = ToolRegistry::with_builtin_backends();
    let backends = registry.backends();

    if args.json {
        return write_json(&backends, "backends");
    }

    let mut output = io::BufWriter::new(io::stdout().lock());
    for backend in backends {
        writeln!(output, "{backend}")?;
    }
    output.flush()?;
    Ok(())
}
