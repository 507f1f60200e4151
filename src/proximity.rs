// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Operator-supplied IRQ-to-NUMA proximity overrides.
//!
//! The file is line oriented: `<token> <numa-id>`, `#` comments, blank
//! lines ignored. Tokens are substring-matched against an IRQ's device
//! token at scan time; the first matching line wins, so file order is
//! priority. Malformed lines are skipped with a warning, but a NUMA id the
//! topology doesn't know aborts the load.

use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::topology::Topology;

#[derive(Debug, Clone)]
pub struct ProximityRule {
    pub token: String,
    pub numa_id: i32,
}

pub fn parse_proximity_file(path: &Path, topo: &Topology) -> Result<Vec<ProximityRule>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("can't read proximity file {:?}", path))?;
    parse_proximity_content(&content, topo)
}

pub fn parse_proximity_content(content: &str, topo: &Topology) -> Result<Vec<ProximityRule>> {
    let mut rules = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(token), Some(numa_str)) = (fields.next(), fields.next()) else {
            warn!("proximity line {}: expected <token> <numa-id>, skipped", lineno + 1);
            continue;
        };
        let Ok(numa_id) = numa_str.parse::<i32>() else {
            warn!(
                "proximity line {}: bad numa id {:?}, skipped",
                lineno + 1,
                numa_str
            );
            continue;
        };
        if topo.numa_mask(numa_id).is_none() {
            bail!("proximity line {}: unknown NUMA node {}", lineno + 1, numa_id);
        }
        rules.push(ProximityRule {
            token: token.to_string(),
            numa_id,
        });
    }
    Ok(rules)
}

/// First rule whose token occurs within the IRQ's device token.
pub fn find_numa_for(rules: &[ProximityRule], refined_desc: &str) -> Option<i32> {
    if refined_desc.is_empty() {
        return None;
    }
    rules
        .iter()
        .find(|r| refined_desc.contains(&r.token))
        .map(|r| r.numa_id)
}

pub fn log_rules(rules: &[ProximityRule]) {
    for rule in rules {
        info!("PXM: {} -> node {}", rule.token, rule.numa_id);
    }
}
