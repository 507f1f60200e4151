// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The balancing policies: which IRQ leaves an overloaded CPU, which CPU
//! receives it, and the commit of the chosen masks to the kernel.
//!
//! Selection and placement are greedy and eventually stabilising. A
//! destination's load is not inflated within a tick; transient
//! over-placement corrects itself at the next sample.

use std::path::Path;

use log::{debug, info, warn};
use rand::Rng;

use crate::config::Strategy;
use crate::cpumask::Cpumask;
use crate::irq::IrqRegistry;
use crate::topology::Topology;

/// A committed-to-model move, remembering the mask to fall back to if the
/// kernel refuses the write.
#[derive(Debug)]
pub struct Placement {
    pub num: u32,
    pub prev_affinity: Cpumask,
}

/// Pick one IRQ to evict from every overloaded CPU and queue it.
pub fn choose_irqs_to_move(
    topo: &Topology,
    registry: &IrqRegistry,
    balance_irqs: &mut Vec<u32>,
    threshold: f32,
    strategy: Strategy,
    exclude_cpus: &Cpumask,
    rng: &mut impl Rng,
) {
    for cpu in topo.cpus.values() {
        if exclude_cpus.test_cpu(cpu.id) || cpu.load < threshold {
            continue;
        }
        let candidates: Vec<u32> = cpu
            .irqs
            .iter()
            .copied()
            .filter(|num| {
                registry.irqs.get(num).is_some_and(|irq| irq.balanceable)
                    && !balance_irqs.contains(num)
            })
            .collect();
        if candidates.is_empty() {
            continue;
        }

        let weight_of = |num: u32| registry.irqs[&num].weight();
        // Candidates ascend by IRQ number, so strict comparisons break
        // ties to the lowest number.
        let chosen = match strategy {
            Strategy::Max => candidates
                .iter()
                .copied()
                .fold(candidates[0], |best, num| {
                    if weight_of(num) > weight_of(best) {
                        num
                    } else {
                        best
                    }
                }),
            Strategy::Min => candidates
                .iter()
                .copied()
                .fold(candidates[0], |best, num| {
                    if weight_of(num) < weight_of(best) {
                        num
                    } else {
                        best
                    }
                }),
            Strategy::Rnd => candidates[rng.gen_range(0..candidates.len())],
        };

        info!(
            "CPU{} is overloaded ({:.1}%), will move IRQ {} (weight {:.1})",
            cpu.id,
            cpu.load,
            chosen,
            weight_of(chosen)
        );
        balance_irqs.push(chosen);
    }
}

/// Choose a destination for every queued IRQ and commit the move to the
/// model. Returns the placements that need writing to the kernel; an IRQ
/// with no eligible destination keeps its prior affinity.
pub fn balance(
    topo: &mut Topology,
    registry: &mut IrqRegistry,
    balance_irqs: &[u32],
    load_limit: f32,
    exclude_cpus: &Cpumask,
    non_local_cpus: bool,
) -> Vec<Placement> {
    let mut placements = Vec::new();

    for &num in balance_irqs {
        let Some(irq) = registry.irqs.get(&num) else {
            continue;
        };

        let eligible: Vec<usize> = topo
            .cpus
            .values()
            .filter(|c| !exclude_cpus.test_cpu(c.id) && c.load < load_limit)
            .map(|c| c.id)
            .collect();

        let candidates = if !irq.local_cpus.is_full() {
            let local: Vec<usize> = eligible
                .iter()
                .copied()
                .filter(|&id| irq.local_cpus.test_cpu(id))
                .collect();
            if !local.is_empty() {
                local
            } else if non_local_cpus {
                eligible
            } else {
                warn!(
                    "IRQ {}: no NUMA-local CPU below the load limit, keeping affinity {}",
                    num, irq.affinity
                );
                continue;
            }
        } else {
            eligible
        };

        // Lowest load wins, ties to the lowest CPU id.
        let dest = candidates.iter().copied().fold(None, |best, id| match best {
            None => Some(id),
            Some(b) => {
                if topo.cpus[&id].load < topo.cpus[&b].load {
                    Some(id)
                } else {
                    Some(b)
                }
            }
        });
        let Some(dest) = dest else {
            warn!(
                "IRQ {}: no eligible CPU below the load limit, keeping affinity {}",
                num, irq.affinity
            );
            continue;
        };

        let mut new_affinity = Cpumask::new();
        if new_affinity.set_cpu(dest).is_err() {
            continue;
        }

        let prev_affinity = irq.affinity.clone();
        let old_owner = topo.owner_of(&prev_affinity);

        if let Some(irq) = registry.irqs.get_mut(&num) {
            irq.affinity = new_affinity;
        }
        if let Some(owner) = old_owner {
            if let Some(cpu) = topo.cpus.get_mut(&owner) {
                cpu.irqs.remove(&num);
            }
        }
        if let Some(cpu) = topo.cpus.get_mut(&dest) {
            cpu.irqs.insert(num);
        }

        info!("IRQ {} moves to CPU{} ({:.1}%)", num, dest, topo.cpus[&dest].load);
        placements.push(Placement { num, prev_affinity });
    }

    placements
}

/// Write the committed masks to `/proc/irq/<N>/smp_affinity`. A refused
/// write rolls that IRQ's model state back and the tick carries on.
pub fn apply_affinity(
    root: &Path,
    topo: &mut Topology,
    registry: &mut IrqRegistry,
    placements: &[Placement],
) {
    for placement in placements {
        let Some(irq) = registry.irqs.get(&placement.num) else {
            continue;
        };
        let path = root.join(format!("proc/irq/{}/smp_affinity", placement.num));
        let rendered = irq.affinity.to_string();
        match std::fs::write(&path, &rendered) {
            Ok(()) => debug!("IRQ {}: smp_affinity <- {}", placement.num, rendered),
            Err(e) => {
                warn!(
                    "IRQ {}: can't write smp_affinity ({}), reverting to {}",
                    placement.num, e, placement.prev_affinity
                );
                let new_owner = topo.owner_of(&irq.affinity);
                if let Some(owner) = new_owner {
                    if let Some(cpu) = topo.cpus.get_mut(&owner) {
                        cpu.irqs.remove(&placement.num);
                    }
                }
                if let Some(irq) = registry.irqs.get_mut(&placement.num) {
                    irq.affinity = placement.prev_affinity.clone();
                }
                if let Some(owner) = topo.owner_of(&placement.prev_affinity) {
                    if let Some(cpu) = topo.cpus.get_mut(&owner) {
                        cpu.irqs.insert(placement.num);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irq::Irq;
    use crate::topology::{Cpu, NumaNode, NUMA_NONE};
    use rand::rngs::SmallRng;
    use rand::SeedableRng;
    use std::collections::{BTreeMap, BTreeSet};

    fn test_topo(loads: &[f32]) -> Topology {
        let mut cpus = BTreeMap::new();
        for (id, &load) in loads.iter().enumerate() {
            let mut sibling_mask = Cpumask::new();
            sibling_mask.set_cpu(id).unwrap();
            cpus.insert(
                id,
                Cpu {
                    id,
                    package_id: 0,
                    core_id: id,
                    numa_id: NUMA_NONE,
                    sibling_mask,
                    irqs: BTreeSet::new(),
                    load,
                    prev_ticks: None,
                    cur_ticks: None,
                    intr: 0,
                },
            );
        }
        Topology {
            numas: vec![NumaNode {
                id: NUMA_NONE,
                cpumask: Cpumask::full(),
            }],
            cpus,
        }
    }

    fn test_irq(num: u32, cpu: usize, weight: f64) -> Irq {
        let mut affinity = Cpumask::new();
        affinity.set_cpu(cpu).unwrap();
        Irq {
            num,
            desc: format!("dev{}", num),
            refined_desc: format!("dev{}", num),
            affinity,
            local_cpus: Cpumask::full(),
            weight: Some(weight),
            prev_count: None,
            cur_count: None,
            intr: 0,
            pxm_numa: None,
            balanceable: true,
        }
    }

    fn install(topo: &mut Topology, registry: &mut IrqRegistry, irq: Irq) {
        let cpu = irq.affinity.first_cpu().unwrap();
        topo.cpus.get_mut(&cpu).unwrap().irqs.insert(irq.num);
        registry.irqs.insert(irq.num, irq);
    }

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(7)
    }

    #[test]
    fn max_strategy_takes_heaviest() {
        let mut topo = test_topo(&[95.0, 10.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 5000.0));
        install(&mut topo, &mut registry, test_irq(25, 0, 100.0));
        install(&mut topo, &mut registry, test_irq(26, 0, 50.0));

        let mut queue = Vec::new();
        choose_irqs_to_move(
            &topo,
            &registry,
            &mut queue,
            90.0,
            Strategy::Max,
            &Cpumask::new(),
            &mut rng(),
        );
        assert_eq!(queue, vec![24]);
    }

    #[test]
    fn min_strategy_with_ties() {
        let mut topo = test_topo(&[95.0, 10.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 100.0));
        install(&mut topo, &mut registry, test_irq(25, 0, 100.0));
        install(&mut topo, &mut registry, test_irq(26, 0, 50.0));

        let mut queue = Vec::new();
        choose_irqs_to_move(
            &topo,
            &registry,
            &mut queue,
            90.0,
            Strategy::Min,
            &Cpumask::new(),
            &mut rng(),
        );
        assert_eq!(queue, vec![26]);

        // A genuine tie breaks to the lowest IRQ number.
        registry.irqs.get_mut(&26).unwrap().weight = Some(100.0);
        let mut queue = Vec::new();
        choose_irqs_to_move(
            &topo,
            &registry,
            &mut queue,
            90.0,
            Strategy::Min,
            &Cpumask::new(),
            &mut rng(),
        );
        assert_eq!(queue, vec![24]);
    }

    #[test]
    fn rnd_strategy_covers_all_candidates() {
        let mut topo = test_topo(&[95.0, 10.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 1.0));
        install(&mut topo, &mut registry, test_irq(25, 0, 2.0));
        install(&mut topo, &mut registry, test_irq(26, 0, 3.0));

        let mut rng = rng();
        let mut picks: BTreeMap<u32, usize> = BTreeMap::new();
        for _ in 0..300 {
            let mut queue = Vec::new();
            choose_irqs_to_move(
                &topo,
                &registry,
                &mut queue,
                90.0,
                Strategy::Rnd,
                &Cpumask::new(),
                &mut rng,
            );
            *picks.entry(queue[0]).or_default() += 1;
        }
        assert_eq!(picks.len(), 3);
        for (_, count) in picks {
            assert!(count > 50);
        }
    }

    #[test]
    fn cool_and_excluded_cpus_are_left_alone() {
        let mut topo = test_topo(&[95.0, 96.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 1.0));
        install(&mut topo, &mut registry, test_irq(25, 1, 1.0));

        let exclude = Cpumask::from_kernel_str("2").unwrap();
        let mut queue = Vec::new();
        choose_irqs_to_move(
            &topo,
            &registry,
            &mut queue,
            96.0,
            Strategy::Max,
            &exclude,
            &mut rng(),
        );
        // cpu0 is below the threshold, cpu1 is excluded.
        assert!(queue.is_empty());
    }

    #[test]
    fn queued_irqs_are_not_selected_twice() {
        let mut topo = test_topo(&[95.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 9.0));
        install(&mut topo, &mut registry, test_irq(25, 0, 1.0));

        let mut queue = vec![24];
        choose_irqs_to_move(
            &topo,
            &registry,
            &mut queue,
            90.0,
            Strategy::Max,
            &Cpumask::new(),
            &mut rng(),
        );
        assert_eq!(queue, vec![24, 25]);
    }

    #[test]
    fn placement_prefers_least_loaded_then_lowest_id() {
        let mut topo = test_topo(&[95.0, 40.0, 10.0, 10.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 100.0));

        let placements = balance(&mut topo, &mut registry, &[24], 80.0, &Cpumask::new(), false);
        assert_eq!(placements.len(), 1);
        assert_eq!(registry.irqs[&24].affinity.to_string(), "4");
        assert!(topo.cpus[&2].irqs.contains(&24));
        assert!(!topo.cpus[&0].irqs.contains(&24));
        assert_eq!(placements[0].prev_affinity.to_string(), "1");
    }

    #[test]
    fn load_limit_blocks_placement() {
        let mut topo = test_topo(&[95.0, 85.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 100.0));

        let placements = balance(&mut topo, &mut registry, &[24], 80.0, &Cpumask::new(), false);
        assert!(placements.is_empty());
        // Prior affinity and ownership are retained.
        assert_eq!(registry.irqs[&24].affinity.to_string(), "1");
        assert!(topo.cpus[&0].irqs.contains(&24));
    }

    #[test]
    fn local_cpus_restrict_placement() {
        let mut topo = test_topo(&[95.0, 90.0, 10.0, 10.0]);
        let mut registry = IrqRegistry::new();
        let mut irq = test_irq(42, 0, 100.0);
        irq.local_cpus = Cpumask::from_kernel_str("3").unwrap();
        install(&mut topo, &mut registry, irq);

        // Local candidates are exhausted and crossing nodes is forbidden.
        let placements = balance(&mut topo, &mut registry, &[42], 80.0, &Cpumask::new(), false);
        assert!(placements.is_empty());
        assert_eq!(registry.irqs[&42].affinity.to_string(), "1");

        // With non-local fallback the IRQ crosses to the idle node.
        let placements = balance(&mut topo, &mut registry, &[42], 80.0, &Cpumask::new(), true);
        assert_eq!(placements.len(), 1);
        assert_eq!(registry.irqs[&42].affinity.to_string(), "4");
    }

    #[test]
    fn local_candidates_win_over_cooler_remote_ones() {
        let mut topo = test_topo(&[95.0, 30.0, 5.0, 5.0]);
        let mut registry = IrqRegistry::new();
        let mut irq = test_irq(42, 0, 100.0);
        irq.local_cpus = Cpumask::from_kernel_str("3").unwrap();
        install(&mut topo, &mut registry, irq);

        let placements = balance(&mut topo, &mut registry, &[42], 80.0, &Cpumask::new(), true);
        assert_eq!(placements.len(), 1);
        // cpu1 is hotter than cpu2/cpu3 but NUMA-local.
        assert_eq!(registry.irqs[&42].affinity.to_string(), "2");
    }

    #[test]
    fn excluded_cpus_never_receive_irqs() {
        let mut topo = test_topo(&[95.0, 1.0, 50.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 100.0));

        let exclude = Cpumask::from_kernel_str("2").unwrap();
        let placements = balance(&mut topo, &mut registry, &[24], 80.0, &exclude, false);
        assert_eq!(placements.len(), 1);
        assert_eq!(registry.irqs[&24].affinity.to_string(), "4");
        assert!(registry.irqs[&24].affinity.and(&exclude).is_empty());
    }

    #[test]
    fn apply_writes_the_kernel_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("proc/irq/24")).unwrap();

        let mut topo = test_topo(&[95.0, 10.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 100.0));

        let placements = balance(&mut topo, &mut registry, &[24], 80.0, &Cpumask::new(), false);
        apply_affinity(tmp.path(), &mut topo, &mut registry, &placements);

        let written = std::fs::read_to_string(tmp.path().join("proc/irq/24/smp_affinity")).unwrap();
        assert_eq!(written, "2");
    }

    #[test]
    fn failed_write_reverts_the_model() {
        let tmp = tempfile::TempDir::new().unwrap();
        // No proc/irq/24 directory: the write must fail.

        let mut topo = test_topo(&[95.0, 10.0]);
        let mut registry = IrqRegistry::new();
        install(&mut topo, &mut registry, test_irq(24, 0, 100.0));

        let placements = balance(&mut topo, &mut registry, &[24], 80.0, &Cpumask::new(), false);
        assert_eq!(registry.irqs[&24].affinity.to_string(), "2");

        apply_affinity(tmp.path(), &mut topo, &mut registry, &placements);
        assert_eq!(registry.irqs[&24].affinity.to_string(), "1");
        assert!(topo.cpus[&0].irqs.contains(&24));
        assert!(!topo.cpus[&1].irqs.contains(&24));
    }
}
