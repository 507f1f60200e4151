// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Fixed-width CPU bitsets in the kernel's comma-separated hex format.
//!
//! A `Cpumask` is a bitset over CPU ids backed by a `BitVec` of u64's. It
//! parses and renders the format the kernel uses for `smp_affinity` and the
//! sysfs `cpumap` files: comma-separated 32-bit hex groups, rightmost group
//! holding bits 0-31.

use std::fmt;

use anyhow::{bail, Context, Result};
use bitvec::prelude::*;

/// Capacity of every `Cpumask`, in CPU ids. This is a build-time upper
/// bound on the kernel's CPU-id space; masks referencing ids at or beyond
/// it fail to parse. Callers that know the runtime CPU count intersect
/// operator-supplied masks with the topology span.
pub const NR_CPUS: usize = 1024;

#[derive(Debug, Eq, Clone, Hash, Ord, PartialEq, PartialOrd)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    /// Build a new empty Cpumask.
    pub fn new() -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; NR_CPUS],
        }
    }

    /// Build a Cpumask with every bit set.
    pub fn full() -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 1; NR_CPUS],
        }
    }

    /// Parse the kernel's comma-separated hex group syntax, e.g.
    /// `00000000,00010004`. The rightmost group is bits 0-31. Case is
    /// ignored. A single group may appear without any comma.
    pub fn from_kernel_str(s: &str) -> Result<Cpumask> {
        let s = s.trim();
        if s.is_empty() {
            bail!("empty cpumask string");
        }

        let mut mask = bitvec![u64, Lsb0; 0; NR_CPUS];
        for (index, group) in s.split(',').rev().enumerate() {
            let group = group.trim();
            if group.is_empty() || group.len() > 8 {
                bail!("invalid cpumask group {:?} in {:?}", group, s);
            }
            let mut val = u32::from_str_radix(group, 16)
                .with_context(|| format!("invalid cpumask {:?}", s))?;
            while val != 0 {
                let lsb = val.trailing_zeros() as usize;
                val &= val - 1;
                let cpu = index * 32 + lsb;
                if cpu >= NR_CPUS {
                    bail!(
                        "cpu {} in cpumask {:?} exceeds the supported maximum of {}",
                        cpu,
                        s,
                        NR_CPUS
                    );
                }
                mask.set(cpu, true);
            }
        }

        Ok(Self { mask })
    }

    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= NR_CPUS {
            bail!("invalid CPU {} passed, max {}", cpu, NR_CPUS);
        }
        Ok(())
    }

    /// Set all bits in the Cpumask to 1.
    pub fn set_all(&mut self) {
        self.mask.fill(true);
    }

    /// Set all bits in the Cpumask to 0.
    pub fn clear_all(&mut self) {
        self.mask.fill(false);
    }

    /// Set a bit in the Cpumask. Fails if the id exceeds the capacity.
    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    /// Clear a bit in the Cpumask. Fails if the id exceeds the capacity.
    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the given CPU bit is set. Ids beyond the capacity
    /// report false.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    pub fn is_full(&self) -> bool {
        self.mask.count_ones() == NR_CPUS
    }

    /// The lowest set bit, if any.
    pub fn first_cpu(&self) -> Option<usize> {
        self.mask.first_one()
    }

    /// Create a Cpumask that is the negation of this one.
    pub fn not(&self) -> Cpumask {
        let mut new = self.clone();
        new.mask = !new.mask;
        new
    }

    /// Create a Cpumask that is the AND of this one and another.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    /// Create a Cpumask that is the OR of this one and another.
    pub fn or(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask |= other.mask.clone();
        new
    }

    /// Iterate over the indices of the set bits.
    pub fn iter(&self) -> CpumaskIterator<'_> {
        CpumaskIterator {
            mask: self,
            index: 0,
        }
    }

    fn fmt_with(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut groups: Vec<u32> = self
            .mask
            .as_raw_slice()
            .iter()
            .flat_map(|x| [*x as u32, (x >> 32) as u32])
            .collect();

        // Canonical form: minimum necessary groups, at least one.
        while groups.len() > 1 && *groups.last().unwrap() == 0 {
            groups.pop();
        }

        // The leading group is unpadded, the rest are full 8-digit groups.
        write!(f, "{:x}", groups.pop().unwrap())?;
        for group in groups.iter().rev() {
            write!(f, ",{group:08x}")?;
        }
        Ok(())
    }
}

impl Default for Cpumask {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CpumaskIterator<'a> {
    mask: &'a Cpumask,
    index: usize,
}

impl Iterator for CpumaskIterator<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        while self.index < NR_CPUS {
            let index = self.index;
            self.index += 1;
            if self.mask.test_cpu(index) {
                return Some(index);
            }
        }
        None
    }
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f)
    }
}

impl fmt::LowerHex for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_with(f)
    }
}
