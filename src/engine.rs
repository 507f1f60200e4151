// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The balancing engine: one value owning the topology, the IRQ registry,
//! the config snapshot and the balance queue, driven tick by tick.
//!
//! A tick is strict: reconfig check, rescan, relink, sample, select,
//! place, write. Later stages only ever observe committed results of the
//! earlier ones. Between ticks the engine sleeps the short interval after
//! an active balance and the long interval otherwise; the sleep polls the
//! shutdown flag so signals take effect promptly without interrupting a
//! tick mid-commit.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use rand::Rng;

use crate::balance::{apply_affinity, balance, choose_irqs_to_move};
use crate::config::{parse_config_file, Config};
use crate::irq::{link_irqs_to_cpus, log_registry, scan_irqs, IrqRegistry};
use crate::proximity::{self, parse_proximity_file, ProximityRule};
use crate::stats::{gather_statistics, log_statistics};
use crate::topology::Topology;

pub struct Engine {
    root: PathBuf,
    cfgfile: PathBuf,
    cfgfile_userdefined: bool,
    pub config: Config,
    topo: Topology,
    registry: IrqRegistry,
    rules: Vec<ProximityRule>,
    balance_irqs: Vec<u32>,
    verbose: bool,
    ticks: u64,
}

impl Engine {
    pub fn new(
        root: PathBuf,
        config: Config,
        cfgfile: PathBuf,
        cfgfile_userdefined: bool,
        pxm: Option<&Path>,
        verbose: bool,
    ) -> Result<Engine> {
        let topo = Topology::scan(&root, config.ht).context("can't scan host topology")?;
        let rules = match pxm {
            Some(path) => parse_proximity_file(path, &topo)?,
            None => Vec::new(),
        };
        if verbose {
            topo.log_summary();
            proximity::log_rules(&rules);
        }
        let engine = Engine {
            root,
            cfgfile,
            cfgfile_userdefined,
            config,
            topo,
            registry: IrqRegistry::new(),
            rules,
            balance_irqs: Vec::new(),
            verbose,
            ticks: 0,
        };
        engine.warn_if_fully_excluded();
        Ok(engine)
    }

    /// An exclusion mask covering the whole model pins every IRQ forever.
    fn warn_if_fully_excluded(&self) {
        if self
            .topo
            .span()
            .and(&self.config.exclude_cpus.not())
            .is_empty()
        {
            warn!("every CPU is excluded; no IRQ will ever be moved");
        }
    }

    /// Re-read the config file, keeping the current snapshot when the file
    /// is unreadable or invalid.
    pub fn reload_config(&mut self) {
        if !self.cfgfile.exists() {
            if self.cfgfile_userdefined {
                error!("can't find config file {:?}", self.cfgfile);
            }
            return;
        }
        info!("Re-reading config file {:?}", self.cfgfile);
        match parse_config_file(&self.cfgfile) {
            Ok(config) => {
                self.config = config;
                self.warn_if_fully_excluded();
            }
            Err(e) => error!("config reload failed, keeping previous: {:#}", e),
        }
    }

    /// One full cycle. Returns the number of seconds to sleep before the
    /// next one: short after an active balance, long otherwise.
    pub fn tick(&mut self, rng: &mut impl Rng) -> Result<u64> {
        self.ticks += 1;
        debug!("---- tick {} ----", self.ticks);

        self.topo.refresh(&self.root, self.config.ht);
        scan_irqs(
            &self.root,
            &mut self.registry,
            &mut self.balance_irqs,
            &self.rules,
            &self.topo,
        )?;
        link_irqs_to_cpus(&mut self.topo, &self.registry);
        gather_statistics(&self.root, &mut self.topo, &mut self.registry)?;
        if self.verbose {
            log_statistics(&self.topo);
            log_registry(&self.registry);
        }

        choose_irqs_to_move(
            &self.topo,
            &self.registry,
            &mut self.balance_irqs,
            self.config.threshold,
            self.config.strategy,
            &self.config.exclude_cpus,
            rng,
        );

        if self.balance_irqs.is_empty() {
            return Ok(self.config.long_interval);
        }

        let placements = balance(
            &mut self.topo,
            &mut self.registry,
            &self.balance_irqs,
            self.config.load_limit,
            &self.config.exclude_cpus,
            self.config.non_local_cpus,
        );
        apply_affinity(&self.root, &mut self.topo, &mut self.registry, &placements);
        self.balance_irqs.clear();
        Ok(self.config.short_interval)
    }

    /// The main loop: poll the control flags, tick, sleep. A failed tick
    /// (e.g. /proc momentarily unreadable) is logged and retried after the
    /// long interval; only termination ends the loop.
    pub fn run(&mut self, shutdown: &AtomicBool, reload: &AtomicBool) -> Result<()> {
        let mut rng = rand::thread_rng();
        while !shutdown.load(Ordering::Relaxed) {
            if reload.swap(false, Ordering::Relaxed) {
                self.reload_config();
            }
            let interval = match self.tick(&mut rng) {
                Ok(secs) => secs,
                Err(e) => {
                    error!("tick failed: {:#}", e);
                    self.config.long_interval
                }
            };
            sleep_interruptible(Duration::from_secs(interval), shutdown);
        }
        Ok(())
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn registry(&self) -> &IrqRegistry {
        &self.registry
    }
}

/// Sleep in slices so a termination signal wakes the loop early.
fn sleep_interruptible(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
}
