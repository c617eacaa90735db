//! Online CPU enumeration from /sys
//!
//! perf counters are opened per CPU; the set of online CPUs comes from
//! `/sys/devices/system/cpu/online`, formatted like `0-3` or `0-3,8-11`.

use std::fs;

use crate::domain::{CpuId, TracerError};

const ONLINE_PATH: &str = "/sys/devices/system/cpu/online";

/// # Errors
/// Fails when the sysfs file cannot be read or parsed.
pub fn online_cpus() -> Result<Vec<CpuId>, TracerError> {
    let content = fs::read_to_string(ONLINE_PATH).map_err(|source| TracerError::ProcRead {
        path: ONLINE_PATH.to_string(),
        source,
    })?;
    parse_cpu_list(content.trim())
}

fn parse_cpu_list(list: &str) -> Result<Vec<CpuId>, TracerError> {
    let mut cpus = Vec::new();
    for range in list.split(',') {
        match range.split_once('-') {
            Some((start, end)) => {
                let start: u32 = start
                    .parse()
                    .map_err(|_| bad_list(list))?;
                let end: u32 = end.parse().map_err(|_| bad_list(list))?;
                cpus.extend((start..=end).map(CpuId));
            }
            None => {
                let cpu: u32 = range.parse().map_err(|_| bad_list(list))?;
                cpus.push(CpuId(cpu));
            }
        }
    }
    Ok(cpus)
}

fn bad_list(list: &str) -> TracerError {
    TracerError::InvalidConfig(format!("unparseable cpu list {list:?}"))
}
