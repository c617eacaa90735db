//! Tracer configuration
//!
//! All capture options are explicit engine inputs; nothing is read from
//! globals. Validation happens before any counter is opened, so a bad
//! configuration refuses to start instead of degrading.

use crate::domain::{Pid, TracerError};

/// A function selected for dynamic instrumentation.
///
/// `file_offset` locates the probe in the binary on disk; `virtual_address`
/// is what gets reported in function-call records (consumers key symbol
/// lookup off it).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstrumentedFunction {
    pub binary_path: String,
    pub file_offset: u64,
    pub virtual_address: u64,
}

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub target_pid: Pid,
    pub trace_context_switches: bool,
    pub trace_callstacks: bool,
    pub trace_instrumented_functions: bool,
    pub sampling_period_ns: u64,
    pub instrumented_functions: Vec<InstrumentedFunction>,
    /// Reorder window for the event processor.
    pub processing_delay_ms: u64,
    /// Records consumed from one ring buffer before moving to the next.
    pub round_robin_batch_size: u32,
    /// Also emit a callstack at uretprobe return sites.
    pub callstacks_on_function_exit: bool,
}

pub const DEFAULT_SAMPLING_PERIOD_NS: u64 = 1_000_000;
pub const DEFAULT_PROCESSING_DELAY_MS: u64 = 200;
pub const DEFAULT_ROUND_ROBIN_BATCH_SIZE: u32 = 5;

impl TracerConfig {
    pub fn new(target_pid: Pid) -> Self {
        Self {
            target_pid,
            trace_context_switches: false,
            trace_callstacks: false,
            trace_instrumented_functions: false,
            sampling_period_ns: DEFAULT_SAMPLING_PERIOD_NS,
            instrumented_functions: Vec::new(),
            processing_delay_ms: DEFAULT_PROCESSING_DELAY_MS,
            round_robin_batch_size: DEFAULT_ROUND_ROBIN_BATCH_SIZE,
            callstacks_on_function_exit: false,
        }
    }

    /// # Errors
    /// Returns `TracerError::InvalidConfig` describing the first violation.
    pub fn validate(&self) -> Result<(), TracerError> {
        if self.trace_callstacks && self.sampling_period_ns == 0 {
            return Err(TracerError::InvalidConfig(
                "sampling period must be positive when callstack tracing is on".into(),
            ));
        }
        if self.round_robin_batch_size == 0 {
            return Err(TracerError::InvalidConfig(
                "round-robin batch size must be positive".into(),
            ));
        }
        if self.trace_instrumented_functions {
            if self.instrumented_functions.is_empty() {
                return Err(TracerError::InvalidConfig(
                    "function tracing is on but no functions were given".into(),
                ));
            }
            for function in &self.instrumented_functions {
                if function.binary_path.is_empty() {
                    return Err(TracerError::InvalidConfig(
                        "instrumented function with empty binary path".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn processing_delay_ns(&self) -> u64 {
        self.processing_delay_ms * 1_000_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(TracerConfig::new(Pid(1)).validate().is_ok());
    }

    #[test]
    fn test_zero_sampling_period_rejected() {
        let mut config = TracerConfig::new(Pid(1));
        config.trace_callstacks = true;
        config.sampling_period_ns = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_function_tracing_needs_functions() {
        let mut config = TracerConfig::new(Pid(1));
        config.trace_instrumented_functions = true;
        assert!(config.validate().is_err());

        config.instrumented_functions.push(InstrumentedFunction {
            binary_path: "/usr/bin/target".into(),
            file_offset: 0x1000,
            virtual_address: 0x5000,
        });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_binary_path_rejected() {
        let mut config = TracerConfig::new(Pid(1));
        config.trace_instrumented_functions = true;
        config.instrumented_functions.push(InstrumentedFunction {
            binary_path: String::new(),
            file_offset: 0,
            virtual_address: 0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = TracerConfig::new(Pid(1));
        config.round_robin_batch_size = 0;
        assert!(config.validate().is_err());
    }
}
