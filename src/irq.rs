// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The IRQ registry: every interrupt line the kernel exposes under
//! `/proc/irq/`, its current affinity, description and NUMA locality.
//!
//! IRQs appear on first observation and are queued for balancing right
//! away, survive across ticks carrying their counters, and are dropped
//! when the kernel stops listing them. Kernel-internal interrupts (timers,
//! IPIs and friends) are tracked for accounting but never balanced.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::cpumask::Cpumask;
use crate::misc::{read_i32, read_trimmed};
use crate::proximity::{find_numa_for, ProximityRule};
use crate::topology::Topology;

/// Interrupts whose description contains one of these tokens are serviced
/// by the kernel itself and must never be moved. "timer" also covers the
/// per-CPU localtimer.
const KERNEL_IRQ_TOKENS: &[&str] = &[
    "timer",
    "ipi",
    "resched",
    "tlb",
    "threshold",
    "spurious",
    "cascade",
];

#[derive(Debug, Clone)]
pub struct Irq {
    pub num: u32,
    /// Free-form text from the kernel, e.g. `PCI-MSI 524288-edge eth0`.
    pub desc: String,
    /// The device token extracted from `desc`.
    pub refined_desc: String,
    /// Last-known kernel affinity mask.
    pub affinity: Cpumask,
    /// CPUs NUMA-local to the device, or all-ones when unknown.
    pub local_cpus: Cpumask,
    /// Smoothed interrupts-per-tick. None until the first delta.
    pub weight: Option<f64>,
    pub prev_count: Option<u64>,
    pub cur_count: Option<u64>,
    /// Interrupt delta over the last tick.
    pub intr: u64,
    /// Operator proximity override, when one matched.
    pub pxm_numa: Option<i32>,
    pub balanceable: bool,
}

impl Irq {
    pub fn weight(&self) -> f64 {
        self.weight.unwrap_or(0.0)
    }
}

#[derive(Debug, Default)]
pub struct IrqRegistry {
    pub irqs: BTreeMap<u32, Irq>,
}

impl IrqRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One parse of `/proc/interrupts`: per-IRQ count sums and description
/// tails. Rows with non-numeric labels (NMI:, ERR:, ...) are ignored.
#[derive(Debug, Default)]
pub struct InterruptsSnapshot {
    pub counts: BTreeMap<u32, u64>,
    pub descs: BTreeMap<u32, String>,
}

pub fn read_interrupts(root: &Path) -> Result<InterruptsSnapshot> {
    let path = root.join("proc/interrupts");
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("can't read {:?}", path))?;
    Ok(parse_interrupts(&content))
}

pub fn parse_interrupts(content: &str) -> InterruptsSnapshot {
    let mut snapshot = InterruptsSnapshot::default();
    let mut lines = content.lines();

    // Header row names one column per CPU.
    let ncols = match lines.next() {
        Some(header) => header.split_whitespace().count(),
        None => return snapshot,
    };

    for line in lines {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else {
            continue;
        };
        let Ok(num) = label.trim_end_matches(':').parse::<u32>() else {
            continue;
        };

        let mut sum: u64 = 0;
        let mut taken = 0;
        let mut tail: Vec<&str> = Vec::new();
        for field in fields {
            if taken < ncols {
                if let Ok(count) = field.parse::<u64>() {
                    sum += count;
                    taken += 1;
                    continue;
                }
            }
            tail.push(field);
        }

        snapshot.counts.insert(num, sum);
        snapshot.descs.insert(num, tail.join(" "));
    }
    snapshot
}

/// The device token of a description: its last whitespace-separated word.
pub fn refine_desc(desc: &str) -> String {
    desc.split_whitespace().last().unwrap_or("").to_string()
}

fn is_kernel_internal(desc: &str) -> bool {
    let lower = desc.to_lowercase();
    KERNEL_IRQ_TOKENS.iter().any(|t| lower.contains(t))
}

/// Description fallback when `/proc/interrupts` has no tail for an IRQ:
/// the device action entries show up as subdirectories of `/proc/irq/<N>/`.
fn desc_from_actions(dir: &Path) -> String {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return String::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    names.join(", ")
}

/// Enumerate `/proc/irq/` and bring the registry up to date. New IRQs are
/// queued on `balance_irqs`; vanished ones are dropped. A per-IRQ read
/// failure skips just that IRQ for this tick.
pub fn scan_irqs(
    root: &Path,
    registry: &mut IrqRegistry,
    balance_irqs: &mut Vec<u32>,
    rules: &[ProximityRule],
    topo: &Topology,
) -> Result<()> {
    let irq_dir = root.join("proc/irq");
    let entries = std::fs::read_dir(&irq_dir).with_context(|| format!("can't list {:?}", irq_dir))?;
    let mut nums: Vec<u32> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().to_str().and_then(|s| s.parse().ok()))
        .collect();
    nums.sort_unstable();

    let descs = match read_interrupts(root) {
        Ok(snapshot) => snapshot.descs,
        Err(e) => {
            warn!("can't derive IRQ descriptions: {:#}", e);
            BTreeMap::new()
        }
    };

    let mut seen = BTreeSet::new();
    for num in nums {
        seen.insert(num);
        let dir = irq_dir.join(num.to_string());

        let affinity = match read_trimmed(&dir.join("smp_affinity"))
            .and_then(|raw| Cpumask::from_kernel_str(&raw))
        {
            Ok(mask) => mask,
            Err(e) => {
                warn!("IRQ {}: can't read smp_affinity: {:#}", num, e);
                continue;
            }
        };

        let desc = match descs.get(&num) {
            Some(tail) if !tail.is_empty() => tail.clone(),
            _ => desc_from_actions(&dir),
        };
        let refined_desc = refine_desc(&desc);
        let pxm_numa = find_numa_for(rules, &refined_desc);
        let local_cpus = local_cpus_for(&dir, pxm_numa, topo);
        let balanceable = !is_kernel_internal(&desc);

        match registry.irqs.get_mut(&num) {
            Some(irq) => {
                irq.desc = desc;
                irq.refined_desc = refined_desc;
                irq.affinity = affinity;
                irq.local_cpus = local_cpus;
                irq.pxm_numa = pxm_numa;
                irq.balanceable = balanceable;
            }
            None => {
                info!("Found new IRQ {} ({})", num, desc);
                registry.irqs.insert(
                    num,
                    Irq {
                        num,
                        desc,
                        refined_desc,
                        affinity,
                        local_cpus,
                        weight: None,
                        prev_count: None,
                        cur_count: None,
                        intr: 0,
                        pxm_numa,
                        balanceable,
                    },
                );
                if balanceable && !balance_irqs.contains(&num) {
                    balance_irqs.push(num);
                }
            }
        }
    }

    registry.irqs.retain(|num, _| {
        let keep = seen.contains(num);
        if !keep {
            debug!("IRQ {} disappeared, dropping from registry", num);
        }
        keep
    });
    balance_irqs.retain(|num| registry.irqs.contains_key(num));

    Ok(())
}

/// Locality, most specific source first: operator override, the kernel's
/// per-IRQ node hint, then "anywhere".
fn local_cpus_for(dir: &Path, pxm_numa: Option<i32>, topo: &Topology) -> Cpumask {
    if let Some(mask) = pxm_numa.and_then(|id| topo.numa_mask(id)) {
        return mask.clone();
    }
    if let Ok(node_id) = read_i32(&dir.join("node")) {
        if node_id >= 0 {
            if let Some(mask) = topo.numa_mask(node_id) {
                return mask.clone();
            }
        }
    }
    Cpumask::full()
}

/// Rebuild per-CPU IRQ ownership from current affinity masks. Every IRQ is
/// accounted to exactly one CPU: the lowest set bit of its mask, translated
/// through HT sibling folding.
pub fn link_irqs_to_cpus(topo: &mut Topology, registry: &IrqRegistry) {
    for cpu in topo.cpus.values_mut() {
        cpu.irqs.clear();
    }
    for irq in registry.irqs.values() {
        match topo.owner_of(&irq.affinity) {
            Some(owner) => {
                if let Some(cpu) = topo.cpus.get_mut(&owner) {
                    cpu.irqs.insert(irq.num);
                }
            }
            None => debug!(
                "IRQ {} has no owning CPU (affinity {})",
                irq.num, irq.affinity
            ),
        }
    }
}

pub fn log_registry(registry: &IrqRegistry) {
    for irq in registry.irqs.values() {
        debug!(
            "IRQ {:>4} affinity={} local={} weight={:.1} {}",
            irq.num,
            irq.affinity,
            if irq.local_cpus.is_full() {
                "all".to_string()
            } else {
                irq.local_cpus.to_string()
            },
            irq.weight(),
            irq.desc
        );
    }
}
