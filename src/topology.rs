// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Host topology model: NUMA nodes, CPUs and their hyper-thread siblings,
//! built from the kernel's sysfs hierarchy.
//!
//! The model deliberately carries only what the balancing engine needs. A
//! `Cpu` owns the set of IRQs currently accounted to it, its measured load
//! and the raw tick counters behind that load. NUMA nodes are masks. A
//! synthetic node with id -1 absorbs CPUs that belong to no NUMA node, so
//! membership lookups always succeed.
//!
//! Scanning is rooted at an arbitrary prefix so tests can run against a
//! fixture tree instead of the live `/sys`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use glob::glob;
use log::{debug, info, warn};
use sscanf::sscanf;

use crate::cpumask::Cpumask;
use crate::misc::{read_trimmed, read_usize};

/// Id of the synthetic node holding CPUs outside every NUMA node.
pub const NUMA_NONE: i32 = -1;

#[derive(Debug, Clone)]
pub struct NumaNode {
    pub id: i32,
    pub cpumask: Cpumask,
}

/// Raw busy/total jiffy counters from one `/proc/stat` sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTicks {
    pub busy: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct Cpu {
    pub id: usize,
    pub package_id: usize,
    pub core_id: usize,
    pub numa_id: i32,
    /// Hyper-thread peers sharing this CPU's physical core, self included.
    /// Covers logical CPUs folded away by HT dedup.
    pub sibling_mask: Cpumask,
    /// IRQs accounted to this CPU: those whose affinity's lowest set bit
    /// resolves here.
    pub irqs: BTreeSet<u32>,
    /// Percentage of non-idle jiffies over the last sampling interval.
    pub load: f32,
    pub prev_ticks: Option<CpuTicks>,
    pub cur_ticks: Option<CpuTicks>,
    /// Interrupts credited to this CPU over the last tick.
    pub intr: u64,
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub numas: Vec<NumaNode>,
    pub cpus: BTreeMap<usize, Cpu>,
}

impl Topology {
    /// Scan NUMA nodes and CPUs under `<root>/sys`. With `ht` disabled,
    /// hyper-thread sibling groups are collapsed onto their lowest-id
    /// member.
    pub fn scan(root: &Path, ht: bool) -> Result<Topology> {
        let numas = scan_numas(root)?;
        let cpus = scan_cpus(root, ht, &numas)?;
        if cpus.is_empty() {
            bail!("no CPUs found under {:?}", root);
        }
        Ok(Topology { numas, cpus })
    }

    /// Re-scan, keeping the previous model if the scan fails. Load and tick
    /// counters carry over by CPU id; IRQ ownership is rebuilt by the link
    /// step that follows every scan.
    pub fn refresh(&mut self, root: &Path, ht: bool) {
        match Topology::scan(root, ht) {
            Ok(mut new) => {
                for (id, cpu) in new.cpus.iter_mut() {
                    if let Some(old) = self.cpus.get(id) {
                        cpu.load = old.load;
                        cpu.prev_ticks = old.prev_ticks;
                        cpu.cur_ticks = old.cur_ticks;
                    }
                }
                *self = new;
            }
            Err(e) => warn!("topology rescan failed, keeping previous model: {:#}", e),
        }
    }

    pub fn numa_mask(&self, id: i32) -> Option<&Cpumask> {
        self.numas.iter().find(|n| n.id == id).map(|n| &n.cpumask)
    }

    /// Mask of all CPUs present in the model.
    pub fn span(&self) -> Cpumask {
        let mut span = Cpumask::new();
        for id in self.cpus.keys() {
            let _ = span.set_cpu(*id);
        }
        span
    }

    /// The CPU accounted for an affinity mask: the lowest set bit, mapped
    /// through sibling masks when that bit was folded away by HT dedup.
    pub fn owner_of(&self, affinity: &Cpumask) -> Option<usize> {
        let first = affinity.first_cpu()?;
        if self.cpus.contains_key(&first) {
            return Some(first);
        }
        self.cpus
            .values()
            .find(|c| c.sibling_mask.test_cpu(first))
            .map(|c| c.id)
    }

    pub fn log_summary(&self) {
        for numa in &self.numas {
            info!("NODE[{:>2}] mask={}", numa.id, numa.cpumask);
        }
        for cpu in self.cpus.values() {
            debug!(
                "CPU{} package={} core={} node={} siblings={}",
                cpu.id, cpu.package_id, cpu.core_id, cpu.numa_id, cpu.sibling_mask
            );
        }
    }
}

fn scan_numas(root: &Path) -> Result<Vec<NumaNode>> {
    let mut numas = Vec::new();
    let pattern = format!("{}/sys/devices/system/node/node[0-9]*", root.display());
    for path in glob(&pattern)?.filter_map(Result::ok) {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let id = match sscanf!(name, "node{usize}") {
            Ok(val) => val as i32,
            Err(_) => continue,
        };
        let raw = read_trimmed(&path.join("cpumap"))?;
        let cpumask = Cpumask::from_kernel_str(&raw)
            .with_context(|| format!("bad cpumap for node {}", id))?;
        numas.push(NumaNode { id, cpumask });
    }
    numas.sort_by_key(|n| n.id);

    // The synthetic node absorbs everything outside the real nodes.
    let union = numas
        .iter()
        .fold(Cpumask::new(), |acc, n| acc.or(&n.cpumask));
    numas.push(NumaNode {
        id: NUMA_NONE,
        cpumask: union.not(),
    });
    Ok(numas)
}

fn scan_cpus(root: &Path, ht: bool, numas: &[NumaNode]) -> Result<BTreeMap<usize, Cpu>> {
    let pattern = format!("{}/sys/devices/system/cpu/cpu[0-9]*", root.display());
    let mut raw = Vec::new();
    for path in glob(&pattern)?.filter_map(Result::ok) {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let id = match sscanf!(name, "cpu{usize}") {
            Ok(val) => val,
            Err(_) => continue,
        };
        let top = path.join("topology");
        let package_id = read_usize(&top.join("physical_package_id"))
            .with_context(|| format!("no package id for cpu{}", id))?;
        let core_id = read_usize(&top.join("core_id"))
            .with_context(|| format!("no core id for cpu{}", id))?;
        raw.push((id, package_id, core_id));
    }
    raw.sort_unstable();

    // Sibling groups span all logical CPUs sharing a physical core.
    let mut groups: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for &(id, package_id, core_id) in &raw {
        groups.entry((package_id, core_id)).or_default().push(id);
    }

    let mut cpus = BTreeMap::new();
    for &(id, package_id, core_id) in &raw {
        let members = &groups[&(package_id, core_id)];
        if !ht && id != members[0] {
            continue;
        }
        let mut sibling_mask = Cpumask::new();
        for &member in members {
            sibling_mask.set_cpu(member)?;
        }
        let numa_id = numas
            .iter()
            .find(|n| n.cpumask.test_cpu(id))
            .map(|n| n.id)
            .unwrap_or(NUMA_NONE);
        cpus.insert(
            id,
            Cpu {
                id,
                package_id,
                core_id,
                numa_id,
                sibling_mask,
                irqs: BTreeSet::new(),
                load: 0.0,
                prev_ticks: None,
                cur_ticks: None,
                intr: 0,
            },
        );
    }
    Ok(cpus)
}
