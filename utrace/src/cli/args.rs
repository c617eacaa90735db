//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::domain::TracerError;
use crate::tracer::config::{
    InstrumentedFunction, DEFAULT_PROCESSING_DELAY_MS, DEFAULT_ROUND_ROBIN_BATCH_SIZE,
    DEFAULT_SAMPLING_PERIOD_NS,
};

#[derive(Parser)]
#[command(
    name = "utrace",
    about = "Trace function calls, callstacks and context switches of a running process",
    after_help = "\
EXAMPLES:
    sudo utrace --pid 1234 --switches --callstacks
    sudo utrace --pid 1234 --function /usr/bin/app:0x1b40:0x401b40 --export trace.json
    sudo utrace --pid 1234 --callstacks --duration 10 --export trace.json"
)]
pub struct Args {
    /// Process ID to trace
    #[arg(short, long)]
    pub pid: i32,

    /// Record context switches
    #[arg(long)]
    pub switches: bool,

    /// Sample callstacks of every thread
    #[arg(long)]
    pub callstacks: bool,

    /// Callstack sampling period in nanoseconds
    #[arg(long, default_value_t = DEFAULT_SAMPLING_PERIOD_NS)]
    pub sampling_period_ns: u64,

    /// Instrument a function, given as BINARY:FILE_OFFSET:VIRTUAL_ADDRESS
    /// (offsets accept 0x-prefixed hex). Repeatable.
    #[arg(long = "function", value_name = "SPEC")]
    pub functions: Vec<String>,

    /// Also emit a callstack when an instrumented function returns
    #[arg(long)]
    pub exit_callstacks: bool,

    /// Export the capture as Chrome trace JSON
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Stop after N seconds (0 = until Ctrl-C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Reorder window of the event processor, in milliseconds
    #[arg(long, default_value_t = DEFAULT_PROCESSING_DELAY_MS)]
    pub processing_delay_ms: u64,

    /// Records consumed per ring buffer before moving to the next
    #[arg(long, default_value_t = DEFAULT_ROUND_ROBIN_BATCH_SIZE)]
    pub batch_size: u32,
}

/// Parse one `--function` spec of the form `path:offset:vaddr`.
///
/// # Errors
/// Fails when the spec does not split into three fields or the numbers do
/// not parse.
pub fn parse_function_spec(spec: &str) -> Result<InstrumentedFunction, TracerError> {
    let bad = || TracerError::InvalidConfig(format!("bad function spec {spec:?}"));

    // The path may itself contain ':'; the two numeric fields are last.
    let (rest, vaddr) = spec.rsplit_once(':').ok_or_else(bad)?;
    let (path, offset) = rest.rsplit_once(':').ok_or_else(bad)?;
    if path.is_empty() {
        return Err(bad());
    }

    Ok(InstrumentedFunction {
        binary_path: path.to_string(),
        file_offset: parse_number(offset).ok_or_else(bad)?,
        virtual_address: parse_number(vaddr).ok_or_else(bad)?,
    })
}

fn parse_number(field: &str) -> Option<u64> {
    field.strip_prefix("0x").map_or_else(
        || field.parse().ok(),
        |hex| u64::from_str_radix(hex, 16).ok(),
    )
}
