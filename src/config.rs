// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Daemon configuration: defaults, the `key = value` config file and its
//! validation.
//!
//! Every load starts from the defaults, so removing a key from the file and
//! sending SIGHUP reverts that knob. Unknown keys are warned about and
//! ignored. Bad values fail the whole load; on reload the caller keeps the
//! previous snapshot.

use std::path::Path;

use anyhow::{bail, Context, Result};
use log::warn;

use crate::cpumask::Cpumask;

pub const DEFAULT_CFGFILE: &str = "/etc/irqshift.conf";
pub const DEFAULT_PIDFILE: &str = "/var/run/irqshift.pid";
pub const DEFAULT_THRESHOLD: f32 = 99.0;
pub const DEFAULT_LOAD_LIMIT: f32 = 99.0;
pub const DEFAULT_SHORT_INTERVAL: u64 = 2;
pub const DEFAULT_LONG_INTERVAL: u64 = 5;

/// How to pick the IRQ to evict from an overloaded CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// The IRQ with the least smoothed weight: small IRQs are cheapest to
    /// move and perturb cache least.
    Min,
    /// The IRQ with the greatest smoothed weight.
    Max,
    /// A uniformly random IRQ.
    Rnd,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub strategy: Strategy,
    /// A CPU at or above this load (percent) is overloaded.
    pub threshold: f32,
    /// Never place an IRQ onto a CPU at or above this load (percent).
    pub load_limit: f32,
    pub short_interval: u64,
    pub long_interval: u64,
    /// Effective exclusion: `exclude-cpus | ~use-cpus`.
    pub exclude_cpus: Cpumask,
    pub ht: bool,
    pub non_local_cpus: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            strategy: Strategy::Rnd,
            threshold: DEFAULT_THRESHOLD,
            load_limit: DEFAULT_LOAD_LIMIT,
            short_interval: DEFAULT_SHORT_INTERVAL,
            long_interval: DEFAULT_LONG_INTERVAL,
            exclude_cpus: Cpumask::new(),
            ht: true,
            non_local_cpus: false,
        }
    }
}

pub fn parse_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("can't read config file {:?}", path))?;
    parse_config_content(&content)
}

pub fn parse_config_content(content: &str) -> Result<Config> {
    let mut config = Config::default();
    let mut exclude = Cpumask::new();
    let mut use_cpus = Cpumask::full();

    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            warn!("config line {}: no '=' separator, skipped", lineno + 1);
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "strategy" => config.strategy = parse_strategy(value)?,
            "threshold" => config.threshold = parse_percent(key, value)?,
            "load-limit" => config.load_limit = parse_percent(key, value)?,
            "short-interval" => config.short_interval = parse_interval(key, value)?,
            "long-interval" => config.long_interval = parse_interval(key, value)?,
            "exclude-cpus" => {
                exclude = Cpumask::from_kernel_str(value)
                    .with_context(|| format!("can't parse exclude-cpus {:?}", value))?
            }
            "use-cpus" => {
                use_cpus = Cpumask::from_kernel_str(value)
                    .with_context(|| format!("can't parse use-cpus {:?}", value))?
            }
            "ht" => config.ht = parse_yes_no(key, value)?,
            "non-local-cpus" => config.non_local_cpus = parse_yes_no(key, value)?,
            _ => warn!("config line {}: unknown key {:?}, ignored", lineno + 1, key),
        }
    }

    // use-cpus says which CPUs stay eligible, so its complement is one more
    // exclusion source.
    config.exclude_cpus = exclude.or(&use_cpus.not());
    Ok(config)
}

pub fn parse_strategy(value: &str) -> Result<Strategy> {
    match value {
        "min" => Ok(Strategy::Min),
        "max" => Ok(Strategy::Max),
        "rnd" => Ok(Strategy::Rnd),
        _ => bail!("illegal strategy value {:?}", value),
    }
}

fn parse_percent(key: &str, value: &str) -> Result<f32> {
    let parsed: f32 = value
        .parse()
        .with_context(|| format!("illegal {} value {:?}", key, value))?;
    if !(0.0..=100.0).contains(&parsed) {
        bail!("{} value {} is outside 0-100", key, parsed);
    }
    Ok(parsed)
}

fn parse_interval(key: &str, value: &str) -> Result<u64> {
    let parsed: u64 = value
        .parse()
        .with_context(|| format!("illegal {} value {:?}", key, value))?;
    if parsed == 0 {
        bail!("{} must be a positive number of seconds", key);
    }
    Ok(parsed)
}

fn parse_yes_no(key: &str, value: &str) -> Result<bool> {
    match value {
        "y" | "yes" => Ok(true),
        "n" | "no" => Ok(false),
        _ => bail!("illegal {} flag value {:?}", key, value),
    }
}
