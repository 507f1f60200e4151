// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-tick statistics: CPU utilisation from `/proc/stat` and per-IRQ
//! interrupt deltas from `/proc/interrupts`.
//!
//! Loads are percentages of non-idle jiffies between two consecutive
//! samples; the first sample after a (re)scan has no baseline and reads as
//! zero. IRQ deltas feed an exponentially smoothed per-IRQ weight that the
//! selection policy ranks by.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;

use crate::irq::{read_interrupts, IrqRegistry};
use crate::topology::{CpuTicks, Topology};

/// One tick of sampling: CPU loads, IRQ deltas, then attribution of each
/// delta to the IRQ's owning CPU.
pub fn gather_statistics(root: &Path, topo: &mut Topology, registry: &mut IrqRegistry) -> Result<()> {
    sample_cpu_loads(root, topo)?;
    sample_irq_deltas(root, registry)?;
    attribute_irqs(topo, registry);
    Ok(())
}

/// Parse the `cpuN` lines of `/proc/stat` into busy/total jiffy counters.
/// Columns are user nice system idle iowait irq softirq steal; missing
/// trailing columns (older kernels) read as zero.
pub fn parse_stat(content: &str) -> BTreeMap<usize, CpuTicks> {
    let mut ticks = BTreeMap::new();
    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let Some(label) = fields.next() else {
            continue;
        };
        let Some(id) = label
            .strip_prefix("cpu")
            .and_then(|s| s.parse::<usize>().ok())
        else {
            continue;
        };
        let mut cols = [0u64; 8];
        for slot in cols.iter_mut() {
            *slot = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
        }
        let [user, nice, system, idle, iowait, irq, softirq, steal] = cols;
        let busy = user + nice + system + irq + softirq + steal;
        ticks.insert(
            id,
            CpuTicks {
                busy,
                total: busy + idle + iowait,
            },
        );
    }
    ticks
}

fn sample_cpu_loads(root: &Path, topo: &mut Topology) -> Result<()> {
    let path = root.join("proc/stat");
    let content =
        std::fs::read_to_string(&path).with_context(|| format!("can't read {:?}", path))?;
    let ticks = parse_stat(&content);

    for cpu in topo.cpus.values_mut() {
        cpu.prev_ticks = cpu.cur_ticks;
        cpu.cur_ticks = ticks.get(&cpu.id).copied();
        cpu.load = match (cpu.prev_ticks, cpu.cur_ticks) {
            (Some(prev), Some(cur)) => {
                let busy = cur.busy.saturating_sub(prev.busy);
                let total = cur.total.saturating_sub(prev.total);
                100.0 * busy as f32 / total.max(1) as f32
            }
            // No baseline yet, or the CPU went missing from /proc/stat.
            _ => 0.0,
        };
    }
    Ok(())
}

fn sample_irq_deltas(root: &Path, registry: &mut IrqRegistry) -> Result<()> {
    let snapshot = read_interrupts(root)?;
    for irq in registry.irqs.values_mut() {
        let Some(&count) = snapshot.counts.get(&irq.num) else {
            irq.intr = 0;
            continue;
        };
        irq.prev_count = irq.cur_count;
        irq.cur_count = Some(count);
        irq.intr = match irq.prev_count {
            Some(prev) => count.saturating_sub(prev),
            None => 0,
        };
        if irq.prev_count.is_some() {
            irq.weight = Some(match irq.weight {
                Some(weight) => 0.5 * weight + 0.5 * irq.intr as f64,
                None => irq.intr as f64,
            });
        }
    }
    Ok(())
}

/// Credit each IRQ's delta to the single CPU owning it.
fn attribute_irqs(topo: &mut Topology, registry: &IrqRegistry) {
    for cpu in topo.cpus.values_mut() {
        cpu.intr = 0;
    }
    for irq in registry.irqs.values() {
        if let Some(owner) = topo.owner_of(&irq.affinity) {
            if let Some(cpu) = topo.cpus.get_mut(&owner) {
                cpu.intr += irq.intr;
            }
        }
    }
}

pub fn log_statistics(topo: &Topology) {
    for cpu in topo.cpus.values() {
        info!(
            "CPU{:<3} load={:>5.1}% intr={:>8} irqs={}",
            cpu.id,
            cpu.load,
            cpu.intr,
            cpu.irqs.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::{link_irqs_to_cpus, scan_irqs};
    use tempfile::TempDir;

    fn write_file(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn fixture(root: &Path) {
        for cpu in 0..2 {
            write_file(
                root,
                &format!("sys/devices/system/cpu/cpu{}/topology/physical_package_id", cpu),
                "0\n",
            );
            write_file(
                root,
                &format!("sys/devices/system/cpu/cpu{}/topology/core_id", cpu),
                &format!("{}\n", cpu),
            );
        }
        write_file(root, "proc/irq/24/smp_affinity", "1\n");
        write_file(root, "proc/irq/25/smp_affinity", "2\n");
    }

    fn write_stat(root: &Path, cpu0: (u64, u64), cpu1: (u64, u64)) {
        // (busy, idle) split across user and idle columns only.
        let content = format!(
            "cpu  {} 0 0 {} 0 0 0 0 0 0\ncpu0 {} 0 0 {} 0 0 0 0 0 0\ncpu1 {} 0 0 {} 0 0 0 0 0 0\n",
            cpu0.0 + cpu1.0,
            cpu0.1 + cpu1.1,
            cpu0.0,
            cpu0.1,
            cpu1.0,
            cpu1.1,
        );
        write_file(root, "proc/stat", &content);
    }

    fn write_interrupts(root: &Path, irq24: (u64, u64), irq25: (u64, u64)) {
        let content = format!(
            "           CPU0       CPU1\n 24: {} {}   PCI-MSI 524288-edge eth0\n 25: {} {}   PCI-MSI 524289-edge eth1\n",
            irq24.0, irq24.1, irq25.0, irq25.1,
        );
        write_file(root, "proc/interrupts", &content);
    }

    #[test]
    fn parse_stat_busy_total() {
        let ticks = parse_stat(
            "cpu  10 2 3 100 5 1 1 2 0 0\ncpu0 10 2 3 100 5 1 1 2 0 0\nintr 12345 1 2\n",
        );
        assert_eq!(ticks.len(), 1);
        // busy = 10+2+3+1+1+2, total = busy+100+5
        assert_eq!(ticks[&0], CpuTicks { busy: 19, total: 124 });
    }

    #[test]
    fn parse_stat_tolerates_short_rows() {
        let ticks = parse_stat("cpu0 4 0 0 6\n");
        assert_eq!(ticks[&0], CpuTicks { busy: 4, total: 10 });
    }

    #[test]
    fn first_sample_has_zero_load() {
        let tmp = TempDir::new().unwrap();
        fixture(tmp.path());
        write_stat(tmp.path(), (50, 50), (10, 90));
        write_interrupts(tmp.path(), (100, 0), (0, 10));

        let mut topo = Topology::scan(tmp.path(), true).unwrap();
        let mut registry = IrqRegistry::new();
        let mut queue = Vec::new();
        scan_irqs(tmp.path(), &mut registry, &mut queue, &[], &topo).unwrap();

        gather_statistics(tmp.path(), &mut topo, &mut registry).unwrap();
        assert_eq!(topo.cpus[&0].load, 0.0);
        assert_eq!(registry.irqs[&24].intr, 0);
        assert_eq!(registry.irqs[&24].weight, None);
    }

    #[test]
    fn loads_and_weights_from_deltas() {
        let tmp = TempDir::new().unwrap();
        fixture(tmp.path());
        write_stat(tmp.path(), (100, 100), (100, 100));
        write_interrupts(tmp.path(), (1000, 0), (500, 0));

        let mut topo = Topology::scan(tmp.path(), true).unwrap();
        let mut registry = IrqRegistry::new();
        let mut queue = Vec::new();
        scan_irqs(tmp.path(), &mut registry, &mut queue, &[], &topo).unwrap();
        gather_statistics(tmp.path(), &mut topo, &mut registry).unwrap();

        // Second sample: cpu0 ran 95 busy of 100 jiffies, cpu1 10 of 100.
        write_stat(tmp.path(), (195, 105), (110, 190));
        write_interrupts(tmp.path(), (1100, 0), (500, 0));
        gather_statistics(tmp.path(), &mut topo, &mut registry).unwrap();

        assert!((topo.cpus[&0].load - 95.0).abs() < 0.01);
        assert!((topo.cpus[&1].load - 10.0).abs() < 0.01);
        // First delta seeds the weight directly.
        assert_eq!(registry.irqs[&24].intr, 100);
        assert_eq!(registry.irqs[&24].weight, Some(100.0));
        assert_eq!(registry.irqs[&25].weight, Some(0.0));

        // Third sample smooths: 0.5*100 + 0.5*50.
        write_stat(tmp.path(), (290, 110), (120, 280));
        write_interrupts(tmp.path(), (1150, 0), (520, 0));
        gather_statistics(tmp.path(), &mut topo, &mut registry).unwrap();
        assert_eq!(registry.irqs[&24].weight, Some(75.0));
        assert_eq!(registry.irqs[&25].weight, Some(10.0));
    }

    #[test]
    fn deltas_are_credited_to_owning_cpus() {
        let tmp = TempDir::new().unwrap();
        fixture(tmp.path());
        write_stat(tmp.path(), (10, 90), (10, 90));
        write_interrupts(tmp.path(), (1000, 0), (500, 0));

        let mut topo = Topology::scan(tmp.path(), true).unwrap();
        let mut registry = IrqRegistry::new();
        let mut queue = Vec::new();
        scan_irqs(tmp.path(), &mut registry, &mut queue, &[], &topo).unwrap();
        link_irqs_to_cpus(&mut topo, &registry);
        gather_statistics(tmp.path(), &mut topo, &mut registry).unwrap();

        write_interrupts(tmp.path(), (1300, 0), (600, 0));
        gather_statistics(tmp.path(), &mut topo, &mut registry).unwrap();

        // Counts are per-column in the file, but credit goes to the
        // affinity owner: IRQ 24 to cpu0, IRQ 25 to cpu1.
        assert_eq!(topo.cpus[&0].intr, 300);
        assert_eq!(topo.cpus[&1].intr, 100);
    }

    #[test]
    fn missing_interrupt_row_zeroes_the_delta() {
        let tmp = TempDir::new().unwrap();
        fixture(tmp.path());
        write_stat(tmp.path(), (10, 90), (10, 90));
        write_interrupts(tmp.path(), (1000, 0), (500, 0));

        let mut topo = Topology::scan(tmp.path(), true).unwrap();
        let mut registry = IrqRegistry::new();
        let mut queue = Vec::new();
        scan_irqs(tmp.path(), &mut registry, &mut queue, &[], &topo).unwrap();
        gather_statistics(tmp.path(), &mut topo, &mut registry).unwrap();

        write_file(
            tmp.path(),
            "proc/interrupts",
            "           CPU0       CPU1\n 24: 1200 0   PCI-MSI 524288-edge eth0\n",
        );
        gather_statistics(tmp.path(), &mut topo, &mut registry).unwrap();
        assert_eq!(registry.irqs[&24].intr, 200);
        assert_eq!(registry.irqs[&25].intr, 0);
    }
}
