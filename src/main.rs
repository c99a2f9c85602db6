use hwtelemetry::config::{Config, PerfEvents};
use hwtelemetry::perf::{self, GlobalResolver, KernelOpener, PerfManager};
use hwtelemetry::resctrl::{CgroupVersion, ResctrlManager, ROOT_CONTAINER};
use hwtelemetry::{Collector, ContainerStats};

use anyhow::Context;
use clap::{value_parser, Arg, ArgMatches, Command};
use metriken::Value;
use tracing::{debug, error, info};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn command() -> Command {
    Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about("Per-container perf counter and resctrl monitoring")
        .arg(
            Arg::new("CONFIG")
                .help("Configuration file")
                .value_parser(value_parser!(PathBuf))
                .action(clap::ArgAction::Set)
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("CONTAINER")
                .long("container")
                .help("Container (cgroup path relative to the hierarchy root) to monitor")
                .action(clap::ArgAction::Set)
                .default_value(ROOT_CONTAINER),
        )
        .arg(
            Arg::new("PERF_EVENTS")
                .long("perf-events")
                .help("JSON file with the perf events to count, replacing the configured ones")
                .value_parser(value_parser!(PathBuf))
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("COUNT")
                .long("count")
                .help("Stop after this many polls")
                .value_parser(value_parser!(u64))
                .action(clap::ArgAction::Set),
        )
}

fn main() {
    let matches = command().get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    // load config from file
    let mut config = {
        let file = matches
            .get_one::<PathBuf>("CONFIG")
            .context("no config file given")?;

        Config::load(file).with_context(|| format!("error loading config file: {file:?}"))?
    };

    if let Some(file) = matches.get_one::<PathBuf>("PERF_EVENTS") {
        config.set_perf_events(PerfEvents::load_json(file)?)?;
    }

    // configure debug log
    tracing_subscriber::fmt()
        .with_max_level(config.log().level())
        .with_writer(std::io::stderr)
        .init();

    let container = matches
        .get_one::<String>("CONTAINER")
        .map(String::as_str)
        .unwrap_or(ROOT_CONTAINER);
    let count = matches.get_one::<u64>("COUNT").copied();

    let running = Arc::new(AtomicBool::new(true));

    ctrlc::set_handler({
        let running = running.clone();
        move || running.store(false, Ordering::Relaxed)
    })
    .context("failed to set ctrl-c handler")?;

    let resolver = perf::initialize().context("failed to initialize the event resolver")?;

    let collectors = collectors(&config, container)?;

    info!(
        "monitoring container {container} with: {}",
        collectors
            .iter()
            .map(|c| c.name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let interval = config.general().interval();
    let mut polls = 0;

    while running.load(Ordering::Relaxed) {
        let mut stats = ContainerStats::default();

        for collector in &collectors {
            if let Err(e) = collector.update_stats(&mut stats) {
                error!("{} collector failed: {e}", collector.name());
            }
        }

        println!("{}", serde_json::to_string(&stats)?);

        polls += 1;

        if count.is_some_and(|count| polls >= count) {
            break;
        }

        std::thread::sleep(interval);
    }

    debug!("shutting down after {polls} polls");

    for collector in &collectors {
        collector.destroy();
    }

    drop(resolver);

    log_metrics();

    Ok(())
}

/// Report the internal counters and gauges once the collectors are gone.
fn log_metrics() {
    for metric in &metriken::metrics() {
        let name = metric.name();

        match metric.value() {
            Some(Value::Counter(value)) => info!("{name}: {value}"),
            Some(Value::Gauge(value)) => info!("{name}: {value}"),
            Some(_) | None => {}
        }
    }
}

fn collectors(config: &Config, container: &str) -> anyhow::Result<Vec<Box<dyn Collector>>> {
    let cgroup_root = config.general().cgroup_root();

    let mut collectors: Vec<Box<dyn Collector>> = Vec::new();

    if config.perf().enabled() {
        let topology = systeminfo::topology().context("unable to read the CPU topology")?;

        debug!(
            "{} online CPUs in {} packages, memory nodes {:?}",
            topology.cpus.len(),
            topology.packages(),
            topology.nodes()
        );

        let version = CgroupVersion::detect(cgroup_root)
            .with_context(|| format!("unable to detect cgroup hierarchy at {cgroup_root:?}"))?;
        let cgroup_path = version.controller_path(cgroup_root, "perf_event", container);

        let manager = PerfManager::new(
            config.perf().events().core.clone(),
            topology.online_cpus(),
            Arc::new(GlobalResolver),
            Arc::new(KernelOpener),
        )?;

        collectors.push(manager.get_collector(&cgroup_path)?);
    }

    let manager = ResctrlManager::new(config.resctrl(), cgroup_root);

    match manager.get_collector(container) {
        Ok(collector) => collectors.push(collector),
        Err(e) => {
            for collector in &collectors {
                collector.destroy();
            }
            return Err(e.into());
        }
    }

    Ok(collectors)
}
