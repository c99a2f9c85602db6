//! Translation of symbolic event names into [`EventConfig`]s.
//!
//! The engine only depends on the [`EventResolver`] trait. [`SysfsResolver`]
//! understands:
//!
//! * the generic hardware and software event names used by `perf(1)`, eg
//!   `cycles`, `instructions`, `cache-misses`, `context-switches`
//! * raw PMU codes written as `r` followed by hex digits, eg `r5300c0`
//! * PMU events in `pmu/event/` or `pmu/term=value,.../` form, resolved
//!   against `/sys/bus/event_source/devices/<pmu>/{type,events,format}`
//!
//! The process-wide resolver is bracketed by [`initialize`] and [`finalize`].

use super::EventConfig;

use parking_lot::Mutex;
use perf_event_open_sys::bindings;
use tracing::{debug, info};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SYSFS_EVENT_SOURCES: &str = "/sys/bus/event_source/devices";

/// Error types for event name resolution
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("event resolver is not initialized")]
    NotInitialized,
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    #[error("unknown pmu {0:?}")]
    UnknownPmu(String),
    #[error("pmu {pmu:?} has no format term {term:?}")]
    UnknownTerm { pmu: String, term: String },
    #[error("invalid term {0:?}")]
    InvalidTerm(String),
    #[error("unable to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Translates an event name into its low-level encoding.
pub trait EventResolver: Send + Sync {
    fn translate(&self, name: &str) -> Result<EventConfig, ResolveError>;
}

#[rustfmt::skip]
static GENERIC_EVENTS: &[(&str, u32, u32)] = &[
    ("cycles", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_CPU_CYCLES),
    ("cpu-cycles", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_CPU_CYCLES),
    ("instructions", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_INSTRUCTIONS),
    ("cache-references", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_CACHE_REFERENCES),
    ("cache-misses", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_CACHE_MISSES),
    ("branches", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branch-instructions", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_BRANCH_INSTRUCTIONS),
    ("branch-misses", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_BRANCH_MISSES),
    ("bus-cycles", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_BUS_CYCLES),
    ("stalled-cycles-frontend", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_STALLED_CYCLES_FRONTEND),
    ("stalled-cycles-backend", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_STALLED_CYCLES_BACKEND),
    ("ref-cycles", bindings::PERF_TYPE_HARDWARE, bindings::PERF_COUNT_HW_REF_CPU_CYCLES),
    ("cpu-clock", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_CPU_CLOCK),
    ("task-clock", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_TASK_CLOCK),
    ("page-faults", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_PAGE_FAULTS),
    ("faults", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_PAGE_FAULTS),
    ("context-switches", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("cs", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_CONTEXT_SWITCHES),
    ("cpu-migrations", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_CPU_MIGRATIONS),
    ("minor-faults", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_PAGE_FAULTS_MIN),
    ("major-faults", bindings::PERF_TYPE_SOFTWARE, bindings::PERF_COUNT_SW_PAGE_FAULTS_MAJ),
];

struct Pmu {
    type_: u32,
    path: PathBuf,
}

/// Resolves event names using the generic event table and the PMU
/// descriptions the kernel exposes in sysfs.
pub struct SysfsResolver {
    pmus: HashMap<String, Pmu>,
}

impl SysfsResolver {
    pub fn new() -> Result<Self, ResolveError> {
        Self::from_sysfs(SYSFS_EVENT_SOURCES)
    }

    /// Discover the PMUs below `root`, which mirrors
    /// `/sys/bus/event_source/devices`. A missing root leaves only the generic
    /// and raw events available.
    pub fn from_sysfs(root: impl AsRef<Path>) -> Result<Self, ResolveError> {
        let root = root.as_ref();
        let mut pmus = HashMap::new();

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no pmus exposed at {}", root.display());
                return Ok(Self { pmus });
            }
            Err(source) => {
                return Err(ResolveError::Io {
                    path: root.to_path_buf(),
                    source,
                })
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };

            match read_trimmed(&path.join("type")).map(|t| t.parse::<u32>()) {
                Ok(Ok(type_)) => {
                    pmus.insert(name, Pmu { type_, path });
                }
                _ => debug!("skipping pmu {name}: no usable type"),
            }
        }

        Ok(Self { pmus })
    }

    pub fn pmus(&self) -> usize {
        self.pmus.len()
    }

    fn pmu_event(&self, pmu_name: &str, desc: &str) -> Result<EventConfig, ResolveError> {
        let pmu = self
            .pmus
            .get(pmu_name)
            .ok_or_else(|| ResolveError::UnknownPmu(pmu_name.to_owned()))?;

        // an alias names a file in events/ holding the terms
        let terms = if !desc.contains('=') && !desc.contains(',') {
            let alias = pmu.path.join("events").join(desc);

            if alias.exists() {
                read_trimmed(&alias)?
            } else {
                desc.to_owned()
            }
        } else {
            desc.to_owned()
        };

        let mut config = EventConfig::new(pmu.type_, 0);

        for term in terms.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = match term.split_once('=') {
                Some((key, value)) => (
                    key.trim(),
                    parse_value(value.trim())
                        .ok_or_else(|| ResolveError::InvalidTerm(term.to_owned()))?,
                ),
                None => (term, 1),
            };

            match key {
                "config" => config.config = value,
                "config1" => config.config1 = value,
                "config2" => config.config2 = value,
                _ => {
                    let format = pmu.path.join("format").join(key);

                    if !format.exists() {
                        return Err(ResolveError::UnknownTerm {
                            pmu: pmu_name.to_owned(),
                            term: key.to_owned(),
                        });
                    }

                    let format = read_trimmed(&format)?;
                    let (field, ranges) = parse_format(&format)
                        .ok_or_else(|| ResolveError::InvalidTerm(format.clone()))?;
                    let bits = deposit(value, &ranges);

                    match field {
                        Field::Config => config.config |= bits,
                        Field::Config1 => config.config1 |= bits,
                        Field::Config2 => config.config2 |= bits,
                    }
                }
            }
        }

        Ok(config)
    }
}

impl EventResolver for SysfsResolver {
    fn translate(&self, name: &str) -> Result<EventConfig, ResolveError> {
        if let Some((_, type_, config)) = GENERIC_EVENTS.iter().find(|(n, _, _)| *n == name) {
            return Ok(EventConfig::new(*type_, *config as u64));
        }

        if let Some(code) = name.strip_prefix('r') {
            if !code.is_empty() && code.len() <= 16 && code.chars().all(|c| c.is_ascii_hexdigit())
            {
                if let Ok(config) = u64::from_str_radix(code, 16) {
                    return Ok(EventConfig::new(bindings::PERF_TYPE_RAW, config));
                }
            }
        }

        if let Some((pmu, desc)) = name.trim_end_matches('/').split_once('/') {
            return self.pmu_event(pmu, desc);
        }

        Err(ResolveError::UnknownEvent(name.to_owned()))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Field {
    Config,
    Config1,
    Config2,
}

/// Parse a PMU format description such as `config:0-7,21` or `config1:0-15`.
fn parse_format(format: &str) -> Option<(Field, Vec<(u32, u32)>)> {
    let (field, bits) = format.split_once(':')?;

    let field = match field.trim() {
        "config" => Field::Config,
        "config1" => Field::Config1,
        "config2" => Field::Config2,
        _ => return None,
    };

    let mut ranges = Vec::new();

    for range in bits.split(',') {
        let range = range.trim();
        let (low, high) = match range.split_once('-') {
            Some((low, high)) => (low.parse().ok()?, high.parse().ok()?),
            None => {
                let bit = range.parse().ok()?;
                (bit, bit)
            }
        };

        if low > high || high > 63 {
            return None;
        }

        ranges.push((low, high));
    }

    Some((field, ranges))
}

/// Scatter the low bits of `value` across `ranges`, least significant first.
fn deposit(value: u64, ranges: &[(u32, u32)]) -> u64 {
    let mut bits = 0;
    let mut shift = 0u32;

    for (low, high) in ranges {
        let width = high - low + 1;
        let mask = if width >= 64 {
            u64::MAX
        } else {
            (1 << width) - 1
        };

        bits |= (value.checked_shr(shift).unwrap_or(0) & mask) << low;
        shift += width;
    }

    bits
}

fn parse_value(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn read_trimmed(path: &Path) -> Result<String, ResolveError> {
    std::fs::read_to_string(path)
        .map(|v| v.trim().to_owned())
        .map_err(|source| ResolveError::Io {
            path: path.to_path_buf(),
            source,
        })
}

struct Global {
    resolver: Option<Arc<SysfsResolver>>,
    // outstanding guards of the current generation
    guards: usize,
    // bumped by every explicit finalize, orphaning older guards
    generation: u64,
}

static RESOLVER: Mutex<Global> = parking_lot::const_mutex(Global {
    resolver: None,
    guards: 0,
    generation: 0,
});

/// Initialize the process-wide resolver. Calling this while already
/// initialized reuses the existing resolver.
///
/// Every call returns a guard, and the resolver is finalized once the last
/// outstanding guard is dropped.
pub fn initialize() -> Result<ResolverGuard, ResolveError> {
    let mut global = RESOLVER.lock();

    if global.resolver.is_none() {
        let sysfs = SysfsResolver::new()?;
        info!("event resolver initialized with {} pmus", sysfs.pmus());
        global.resolver = Some(Arc::new(sysfs));
    }

    global.guards += 1;

    Ok(ResolverGuard {
        generation: global.generation,
    })
}

/// Terminate the process-wide resolver regardless of outstanding guards,
/// which become inert. Idempotent, and a no-op if the resolver was never
/// initialized.
pub fn finalize() {
    let mut global = RESOLVER.lock();

    debug!("attempting to terminate the event resolver");

    global.generation += 1;
    global.guards = 0;

    if global.resolver.take().is_none() {
        debug!("event resolver has not been initialized; not terminating");
    }
}

/// Keeps the process-wide resolver alive. The last guard to be dropped
/// finalizes it.
#[must_use]
pub struct ResolverGuard {
    generation: u64,
}

impl Drop for ResolverGuard {
    fn drop(&mut self) {
        let mut global = RESOLVER.lock();

        if global.generation != self.generation {
            return;
        }

        global.guards -= 1;

        if global.guards == 0 {
            debug!("last resolver guard dropped, terminating the event resolver");
            global.resolver = None;
        }
    }
}

/// Resolves through the process-wide resolver set up by [`initialize`].
#[derive(Copy, Clone, Debug, Default)]
pub struct GlobalResolver;

impl EventResolver for GlobalResolver {
    fn translate(&self, name: &str) -> Result<EventConfig, ResolveError> {
        let resolver = RESOLVER.lock().resolver.clone();

        resolver
            .ok_or(ResolveError::NotInitialized)?
            .translate(name)
    }
}
