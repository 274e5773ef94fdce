// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::{
    Fail,
    FailKind,
};
use ::std::{
    fs::File,
    io::Read,
    thread,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Default number of mbufs in the mempool of each port.
pub const DEFAULT_MBUF_NUMBER: usize = 8191;
/// Default number of mbufs in the per-core mempool cache.
pub const DEFAULT_MBUF_CACHE_SIZE: usize = 250;
/// Default number of burst groups in every ring. Must be a power of two.
pub const DEFAULT_RING_SIZE: usize = 64;
/// Default time between scheduler actions, in milliseconds.
pub const DEFAULT_SCHED_TIME_MS: u64 = 500;
/// Default time between scheduler re-evaluations of worker behaviour, in milliseconds.
pub const DEFAULT_CHECK_TIME_MS: u64 = 10_000;
/// Default time between statistics lines, in milliseconds.
pub const DEFAULT_DEBUG_TIME_MS: u64 = 1_000;
/// Default cap on simultaneous receive workers.
pub const DEFAULT_MAX_RECV: i32 = 2;
/// Default cap on parallel receive-side-scaling lanes.
pub const DEFAULT_MAX_IN_INDEX: i32 = 16;

//======================================================================================================================
// Structures
//======================================================================================================================

/// All parameters that a user program can pass to the library. Every field is optional: a zero or empty value selects
/// the documented default.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Cores available to the scheduler for placing workers and their clones, as "a,b,c-d". Empty selects all cores.
    pub cpu_list: String,
    /// Disables the scheduler entirely.
    pub disable_scheduler: bool,
    /// Keeps previously cloned workers running even when load subsides.
    pub persistent_clones: bool,
    /// Gives the stop worker a dedicated core instead of sharing the scheduler core.
    pub stop_on_dedicated_core: bool,
    /// Calculates IPv4, UDP and TCP checksums in hardware on transmit.
    pub hw_tx_checksum: bool,
    /// Number of mbufs in the mempool of each port.
    pub mbuf_number: usize,
    /// Number of mbufs in the per-core mempool cache.
    pub mbuf_cache_size: usize,
    /// Number of burst groups in every ring. Must be a power of two.
    pub ring_size: usize,
    /// Time between scheduler actions, in milliseconds.
    pub sched_time_ms: u64,
    /// Time between scheduler re-evaluations of worker behaviour, in milliseconds.
    pub check_time_ms: u64,
    /// Time between statistics lines, in milliseconds. Must not be smaller than `sched_time_ms`.
    pub debug_time_ms: u64,
    /// Logging specification handed to the logger when not empty.
    pub log_spec: String,
    /// Arguments passed through to driver initialization.
    pub driver_args: Vec<String>,
    /// Whether kernel-bridge devices will be created.
    pub need_kni: bool,
    /// Maximum simultaneous receive workers that should handle all input of a network card.
    pub max_recv: i32,
    /// Cap on parallel receive-side-scaling lanes. One lane per worker when the scheduler is disabled.
    pub max_in_index: i32,
    /// Forbids cloning workers whose duplication could reorder packets.
    pub restricted_cloning: bool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Config {
    /// Loads a configuration from a YAML file. Missing keys keep their defaults.
    pub fn load(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        let config: Vec<Yaml> = match YamlLoader::load_from_str(&config_s) {
            Ok(config) => config,
            Err(_) => return Err(Fail::new(FailKind::BadArgument, "malformed YAML config")),
        };
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(Fail::new(FailKind::BadArgument, "wrong number of config objects")),
        };
        let section: &Yaml = &config_obj["catflow"];

        let mut options: Config = Config::default();
        if let Some(cpu_list) = section["cpu_list"].as_str() {
            options.cpu_list = cpu_list.to_string();
        }
        if let Some(v) = section["disable_scheduler"].as_bool() {
            options.disable_scheduler = v;
        }
        if let Some(v) = section["persistent_clones"].as_bool() {
            options.persistent_clones = v;
        }
        if let Some(v) = section["stop_on_dedicated_core"].as_bool() {
            options.stop_on_dedicated_core = v;
        }
        if let Some(v) = section["hw_tx_checksum"].as_bool() {
            options.hw_tx_checksum = v;
        }
        if let Some(v) = section["mbuf_number"].as_i64() {
            options.mbuf_number = v as usize;
        }
        if let Some(v) = section["mbuf_cache_size"].as_i64() {
            options.mbuf_cache_size = v as usize;
        }
        if let Some(v) = section["ring_size"].as_i64() {
            options.ring_size = v as usize;
        }
        if let Some(v) = section["sched_time_ms"].as_i64() {
            options.sched_time_ms = v as u64;
        }
        if let Some(v) = section["check_time_ms"].as_i64() {
            options.check_time_ms = v as u64;
        }
        if let Some(v) = section["debug_time_ms"].as_i64() {
            options.debug_time_ms = v as u64;
        }
        if let Some(v) = section["log_spec"].as_str() {
            options.log_spec = v.to_string();
        }
        if let Some(args) = section["driver_args"].as_vec() {
            for arg in args {
                match arg.as_str() {
                    Some(arg) => options.driver_args.push(arg.to_string()),
                    None => return Err(Fail::new(FailKind::BadArgument, "non string driver argument")),
                }
            }
        }
        if let Some(v) = section["need_kni"].as_bool() {
            options.need_kni = v;
        }
        if let Some(v) = section["max_recv"].as_i64() {
            options.max_recv = v as i32;
        }
        if let Some(v) = section["max_in_index"].as_i64() {
            options.max_in_index = v as i32;
        }
        if let Some(v) = section["restricted_cloning"].as_bool() {
            options.restricted_cloning = v;
        }
        Ok(options)
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Parses a CPU list such as "0,2,4-7" into core numbers, rejecting entries beyond `cores_number`.
pub fn parse_cpu_list(list: &str, cores_number: usize) -> Result<Vec<usize>, Fail> {
    let mut cpus: Vec<usize> = Vec::new();
    for piece in list.split(',') {
        let piece: &str = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (first, last): (usize, usize) = match piece.split_once('-') {
            Some((first, last)) => {
                let first: usize = parse_core_number(first)?;
                let last: usize = parse_core_number(last)?;
                (first, last)
            },
            None => {
                let single: usize = parse_core_number(piece)?;
                (single, single)
            },
        };
        if first > last {
            let cause: String = format!("invalid CPU range (range={})", piece);
            error!("parse_cpu_list(): {}", cause);
            return Err(Fail::new(FailKind::BadArgument, &cause));
        }
        for cpu in first..=last {
            if cpu >= cores_number {
                let cause: String = format!("CPU number exceeds available cores (cpu={})", cpu);
                error!("parse_cpu_list(): {}", cause);
                return Err(Fail::new(FailKind::BadArgument, &cause));
            }
            if !cpus.contains(&cpu) {
                cpus.push(cpu);
            }
        }
    }
    if cpus.is_empty() {
        return Err(Fail::new(FailKind::BadArgument, "empty CPU list"));
    }
    Ok(cpus)
}

/// Returns the default CPU set: every core the process may run on.
pub fn default_cpus(cores_number: usize) -> Vec<usize> {
    (0..cores_number).collect()
}

/// Returns the number of cores available to the process.
pub fn cores_number() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn parse_core_number(piece: &str) -> Result<usize, Fail> {
    match piece.trim().parse::<usize>() {
        Ok(n) => Ok(n),
        Err(_) => {
            let cause: String = format!("invalid CPU number (value={})", piece);
            error!("parse_core_number(): {}", cause);
            Err(Fail::new(FailKind::BadArgument, &cause))
        },
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        default_cpus,
        parse_cpu_list,
    };
    use ::anyhow::Result;

    #[test]
    fn cpu_list_singles_and_ranges() -> Result<()> {
        let cpus: Vec<usize> = parse_cpu_list("0,2,4-6", 8)?;
        crate::ensure_eq!(cpus, vec![0, 2, 4, 5, 6]);
        Ok(())
    }

    #[test]
    fn cpu_list_deduplicates() -> Result<()> {
        let cpus: Vec<usize> = parse_cpu_list("1,1-2,2", 8)?;
        crate::ensure_eq!(cpus, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn cpu_list_rejects_bad_input() -> Result<()> {
        crate::ensure_eq!(parse_cpu_list("7-3", 8).is_err(), true);
        crate::ensure_eq!(parse_cpu_list("abc", 8).is_err(), true);
        crate::ensure_eq!(parse_cpu_list("9", 8).is_err(), true);
        crate::ensure_eq!(parse_cpu_list("", 8).is_err(), true);
        Ok(())
    }

    #[test]
    fn default_cpu_set() -> Result<()> {
        crate::ensure_eq!(default_cpus(4), vec![0, 1, 2, 3]);
        Ok(())
    }
}
