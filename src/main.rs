// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use syslog::{BasicLogger, Facility, Formatter3164};

use irqshift::config::{parse_config_file, Config, DEFAULT_CFGFILE, DEFAULT_PIDFILE};
use irqshift::Engine;

/// irqshift: a daemon balancing hardware IRQ affinity across CPU cores.
///
/// Each tick the daemon samples per-CPU load and per-IRQ interrupt rates,
/// evicts one IRQ from every CPU loaded above the configured threshold and
/// reassigns it to the least-loaded eligible CPU, preferring CPUs local to
/// the device's NUMA node. Chosen masks are written back through
/// /proc/irq/<N>/smp_affinity.
///
/// SIGHUP re-reads the config file without restarting; SIGTERM, SIGINT and
/// SIGQUIT terminate cleanly at the next tick boundary.
#[derive(Debug, Parser)]
#[command(version)]
struct Opts {
    /// Debug mode. Don't daemonise and log to the terminal.
    #[clap(short = 'd', long)]
    debug: bool,

    /// Be verbose. Specify multiple times to increase verbosity.
    #[clap(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// File to save the daemon's PID to.
    #[clap(short = 'p', long = "pid", default_value = DEFAULT_PIDFILE)]
    pidfile: PathBuf,

    /// Config file.
    #[clap(short = 'c', long = "conf")]
    cfgfile: Option<PathBuf>,

    /// Proximity config file mapping device tokens to NUMA nodes.
    #[clap(short = 'x', long = "pxm")]
    pxm: Option<PathBuf>,

    /// Syslog facility.
    #[clap(short = 'O', long, default_value = "daemon")]
    facility: String,

    /// Obsolete. Hyper-threading handling is controlled by the config
    /// file's `ht` key.
    #[clap(short = 'r', long = "ht")]
    ht: bool,
}

fn log_level(verbose: u8) -> log::LevelFilter {
    match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

fn init_term_logging(verbose: u8) -> Result<()> {
    let llv = match verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        llv,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;
    Ok(())
}

fn init_syslog_logging(facility: Facility, verbose: u8) -> Result<()> {
    let formatter = Formatter3164 {
        facility,
        hostname: None,
        process: "irqshift".into(),
        pid: std::process::id() as _,
    };
    let logger = match syslog::unix(formatter) {
        Ok(logger) => logger,
        Err(e) => bail!("can't connect to syslog: {}", e),
    };
    log::set_boxed_logger(Box::new(BasicLogger::new(logger)))?;
    log::set_max_level(log_level(verbose));
    Ok(())
}

fn parse_facility(name: &str) -> Result<Facility> {
    Ok(match name.to_lowercase().as_str() {
        "kern" => Facility::LOG_KERN,
        "user" => Facility::LOG_USER,
        "mail" => Facility::LOG_MAIL,
        "daemon" => Facility::LOG_DAEMON,
        "auth" => Facility::LOG_AUTH,
        "syslog" => Facility::LOG_SYSLOG,
        "lpr" => Facility::LOG_LPR,
        "news" => Facility::LOG_NEWS,
        "uucp" => Facility::LOG_UUCP,
        "cron" => Facility::LOG_CRON,
        "authpriv" => Facility::LOG_AUTHPRIV,
        "ftp" => Facility::LOG_FTP,
        "local0" => Facility::LOG_LOCAL0,
        "local1" => Facility::LOG_LOCAL1,
        "local2" => Facility::LOG_LOCAL2,
        "local3" => Facility::LOG_LOCAL3,
        "local4" => Facility::LOG_LOCAL4,
        "local5" => Facility::LOG_LOCAL5,
        "local6" => Facility::LOG_LOCAL6,
        "local7" => Facility::LOG_LOCAL7,
        _ => bail!("illegal syslog facility {:?}", name),
    })
}

fn daemonize() -> Result<()> {
    if unsafe { libc::daemon(0, 0) } < 0 {
        bail!("can't daemonise: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

fn write_pidfile(path: &Path) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("can't create pidfile {:?}", path))?;
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("can't write pidfile {:?}", path))?;
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let facility = parse_facility(&opts.facility)?;

    let (cfgfile, cfgfile_userdefined) = match &opts.cfgfile {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(DEFAULT_CFGFILE), false),
    };
    let config = if cfgfile.exists() {
        parse_config_file(&cfgfile)?
    } else if cfgfile_userdefined {
        bail!("can't find config file {:?}", cfgfile);
    } else {
        Config::default()
    };

    let mut pidfile = None;
    if opts.debug {
        init_term_logging(opts.verbose)?;
    } else {
        daemonize()?;
        init_syslog_logging(facility, opts.verbose)?;
        write_pidfile(&opts.pidfile)?;
        pidfile = Some(opts.pidfile.clone());
    }

    info!("Start daemon");
    if opts.ht {
        warn!("the --ht command line flag is obsolete and ignored; use the config file `ht` key");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    for signal in [SIGTERM, SIGINT, SIGQUIT] {
        signal_hook::flag::register(signal, shutdown.clone())
            .context("can't register termination handler")?;
    }
    signal_hook::flag::register(SIGHUP, reload.clone())
        .context("can't register reload handler")?;

    let result = Engine::new(
        PathBuf::from("/"),
        config,
        cfgfile,
        cfgfile_userdefined,
        opts.pxm.as_deref(),
        opts.verbose > 0,
    )
    .and_then(|mut engine| engine.run(&shutdown, &reload));

    if let Some(path) = pidfile {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!("can't remove pidfile {:?}: {}", path, e);
        }
    }
    info!("Stop daemon");
    result
}
