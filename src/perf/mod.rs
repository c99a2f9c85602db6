//! Collects perf counters for a single container.
//!
//! Every configured event group is opened once per online CPU, scoped to the
//! container's cgroup. The first event of a group is the leader: it is opened
//! disabled, the remaining events join it, and only once every member is open
//! on every CPU is the group reset and enabled. Each poll reads the whole
//! group from the leader in one go and corrects the values for time
//! multiplexing.

mod attr;
mod format;
mod resolver;
mod stats;
mod sys;

pub use attr::EventConfig;
pub use format::{DecodeError, GroupReadFormat, Value};
pub use resolver::{
    finalize, initialize, EventResolver, GlobalResolver, ResolveError, ResolverGuard,
    SysfsResolver,
};
pub use sys::{EventFile, EventOpener, KernelOpener, PerfFile};

use crate::collector::{Collector, NoopCollector};
use crate::config::{ConfigError, CustomEvent, EventSet};
use crate::stats::{ContainerStats, PerfStat, PerfValue};

use parking_lot::Mutex;
use stats::*;
use tracing::{debug, error, trace, warn};

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const NAME: &str = "perf";

/// Error types for perf counter setup
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid perf events: {0}")]
    Events(#[from] ConfigError),
    #[error("unable to open cgroup directory {path}: {source}")]
    Cgroup {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("unable to transform event {event:?} (group {group}) to perf_event_attr: {source}")]
    Resolve {
        event: String,
        group: usize,
        source: ResolveError,
    },
    #[error("setting up perf event {event:?} (group {group}, {config}) on CPU{cpu} failed: {source}")]
    Open {
        event: String,
        group: usize,
        config: EventConfig,
        cpu: usize,
        source: std::io::Error,
    },
    #[error("no leader descriptor for group {group} on CPU{cpu}")]
    MissingLeader { group: usize, cpu: usize },
    #[error("unable to {op} perf group {group} (leader {event:?}, {config}) on CPU{cpu}: {source}")]
    Control {
        op: &'static str,
        event: String,
        group: usize,
        config: EventConfig,
        cpu: usize,
        source: std::io::Error,
    },
}

#[derive(Debug, thiserror::Error)]
enum ReadError {
    #[error("unable to read perf event group: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to decode perf event group: {0}")]
    Decode(#[from] DecodeError),
}

/// The ordered events of one group. The first event is the leader.
#[derive(Clone, Debug)]
struct EventGroup {
    names: Vec<String>,
}

impl EventGroup {
    fn leader(&self) -> &str {
        &self.names[0]
    }
}

/// Identifies one open descriptor.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct DescriptorKey {
    group: usize,
    event: String,
    cpu: usize,
}

impl DescriptorKey {
    fn new(group: usize, event: &str, cpu: usize) -> Self {
        Self {
            group,
            event: event.to_owned(),
            cpu,
        }
    }
}

type DescriptorTable = BTreeMap<DescriptorKey, Box<dyn EventFile>>;

pub struct PerfCollector {
    cgroup_path: PathBuf,
    groups: Vec<EventGroup>,
    custom_events: HashMap<String, CustomEvent>,
    online_cpus: Vec<usize>,
    files: Mutex<DescriptorTable>,
    uncore: Box<dyn Collector>,
}

impl PerfCollector {
    /// Create a collector for the cgroup at `cgroup_path`. Nothing is opened
    /// until [`PerfCollector::setup`] is called. Groups must be non-empty and
    /// must not name an event twice.
    pub fn new(
        cgroup_path: impl Into<PathBuf>,
        events: &EventSet,
        online_cpus: Vec<usize>,
    ) -> Result<Self, Error> {
        events.check()?;

        let groups = events
            .events
            .iter()
            .map(|group| EventGroup {
                names: group.events.clone(),
            })
            .collect();

        let custom_events = events
            .custom_events
            .iter()
            .map(|event| (event.name.clone(), event.clone()))
            .collect();

        Ok(Self {
            cgroup_path: cgroup_path.into(),
            groups,
            custom_events,
            online_cpus,
            files: Mutex::new(BTreeMap::new()),
            uncore: Box::new(NoopCollector::new()),
        })
    }

    /// Merge the counters of `uncore` into this collector's output.
    pub fn with_uncore(mut self, uncore: Box<dyn Collector>) -> Self {
        self.uncore = uncore;
        self
    }

    /// Open and enable every event group.
    ///
    /// On error the descriptors opened so far are kept, and must be released
    /// with [`Collector::destroy`].
    pub fn setup(&self, resolver: &dyn EventResolver, opener: &dyn EventOpener) -> Result<(), Error> {
        let cgroup = File::open(&self.cgroup_path).map_err(|source| Error::Cgroup {
            path: self.cgroup_path.clone(),
            source,
        })?;

        let mut files = self.files.lock();

        for (index, group) in self.groups.iter().enumerate() {
            let mut leader_config = EventConfig::default();

            for (position, name) in group.names.iter().enumerate() {
                let is_leader = position == 0;
                let config = self.event_config(index, name, resolver)?;

                if is_leader {
                    leader_config = config;
                }

                self.register(
                    &mut files,
                    opener,
                    cgroup.as_raw_fd(),
                    index,
                    group,
                    name,
                    is_leader,
                    &config,
                )?;
            }

            // group is prepared so we should reset and enable counting
            for &cpu in &self.online_cpus {
                let leader = files
                    .get(&DescriptorKey::new(index, group.leader(), cpu))
                    .ok_or(Error::MissingLeader { group: index, cpu })?;

                let control = |op: &'static str, source| Error::Control {
                    op,
                    event: group.leader().to_owned(),
                    group: index,
                    config: leader_config,
                    cpu,
                    source,
                };

                leader.reset().map_err(|e| control("reset", e))?;
                leader.enable().map_err(|e| control("enable", e))?;
            }
        }

        Ok(())
    }

    fn event_config(
        &self,
        group: usize,
        name: &str,
        resolver: &dyn EventResolver,
    ) -> Result<EventConfig, Error> {
        if let Some(event) = self.custom_events.get(name) {
            debug!("setting up raw perf event {name}: {event:?}");
            return Ok(EventConfig::from_custom(event));
        }

        debug!("setting up perf event {name}");

        resolver.translate(name).map_err(|source| Error::Resolve {
            event: name.to_owned(),
            group,
            source,
        })
    }

    /// Open `name` on every online CPU. Descriptors that were opened are
    /// tracked even if a later CPU fails.
    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        files: &mut DescriptorTable,
        opener: &dyn EventOpener,
        cgroup: RawFd,
        index: usize,
        group: &EventGroup,
        name: &str,
        is_leader: bool,
        config: &EventConfig,
    ) -> Result<(), Error> {
        let mut opened = Vec::with_capacity(self.online_cpus.len());
        let mut result = Ok(());

        for &cpu in &self.online_cpus {
            let leader = if is_leader {
                None
            } else {
                match files.get(&DescriptorKey::new(index, group.leader(), cpu)) {
                    Some(leader) => Some(leader.as_ref()),
                    None => {
                        result = Err(Error::MissingLeader { group: index, cpu });
                        break;
                    }
                }
            };

            let mut attr = config.attributes(is_leader);

            match opener.open(&mut attr, cgroup, cpu, leader) {
                Ok(file) => {
                    debug!(
                        "opened perf_event file descriptor for cgroup {:?}, event {name} and CPU{cpu}",
                        self.cgroup_path
                    );
                    opened.push((cpu, file));
                }
                Err(source) => {
                    result = Err(Error::Open {
                        event: name.to_owned(),
                        group: index,
                        config: *config,
                        cpu,
                        source,
                    });
                    break;
                }
            }
        }

        for (cpu, file) in opened {
            PERF_DESCRIPTORS_OPEN.increment();
            files.insert(DescriptorKey::new(index, name, cpu), file);
        }

        result
    }

    #[cfg(test)]
    fn descriptors(&self) -> usize {
        self.files.lock().len()
    }
}

fn read_group(file: &mut dyn EventFile, group: &EventGroup) -> Result<Vec<PerfValue>, ReadError> {
    let mut buf = vec![0; format::record_size(group.names.len())];
    let len = file.read(&mut buf)?;

    let record = GroupReadFormat::decode(&buf[..len], group.names.len())?;
    let ratio = record.scaling_ratio();

    Ok(group
        .names
        .iter()
        .zip(record.values.iter())
        .map(|(name, value)| PerfValue {
            name: name.clone(),
            value: format::scale(value.value, ratio),
            scaling_ratio: ratio,
        })
        .collect())
}

impl Collector for PerfCollector {
    fn name(&self) -> &'static str {
        NAME
    }

    fn update_stats(&self, stats: &mut ContainerStats) -> crate::Result<()> {
        let mut files = self.files.lock();

        stats.perf_stats.clear();

        trace!(
            "attempting to update perf_event stats from cgroup {:?}",
            self.cgroup_path
        );

        for (index, group) in self.groups.iter().enumerate() {
            for &cpu in &self.online_cpus {
                let Some(file) = files.get_mut(&DescriptorKey::new(index, group.leader(), cpu))
                else {
                    continue;
                };

                let values = match read_group(file.as_mut(), group) {
                    Ok(values) => values,
                    Err(e) => {
                        PERF_GROUP_READ_ERRORS.increment();
                        warn!(
                            "unable to read from perf_event file (event: {}, CPU{cpu}) for {:?}: {e}",
                            group.leader(),
                            self.cgroup_path
                        );
                        continue;
                    }
                };

                PERF_GROUP_READS.increment();

                for value in values {
                    trace!(
                        "read metric for event {} for CPU{cpu} from cgroup {:?}: {}",
                        value.name,
                        self.cgroup_path,
                        value.value
                    );
                    stats.perf_stats.push(PerfStat { cpu, value });
                }
            }
        }

        drop(files);

        if let Err(e) = self.uncore.update_stats(stats) {
            error!("failed to get uncore perf event stats: {e}");
        }

        Ok(())
    }

    fn destroy(&self) {
        self.uncore.destroy();

        let mut files = self.files.lock();

        for (key, file) in std::mem::take(&mut *files) {
            debug!(
                "closing perf_event file descriptor for cgroup {:?}, event {} and CPU{}",
                self.cgroup_path, key.event, key.cpu
            );

            PERF_DESCRIPTORS_OPEN.decrement();

            if let Err(e) = file.close() {
                PERF_CLOSE_ERRORS.increment();
                warn!(
                    "unable to close perf_event file descriptor for cgroup {:?}, event {} and CPU{}: {e}",
                    self.cgroup_path, key.event, key.cpu
                );
            }
        }
    }
}

/// Builds an uncore collector for a cgroup path.
pub type UncoreFactory = Box<dyn Fn(&Path) -> Box<dyn Collector> + Send + Sync>;

/// Hands out a perf collector per container.
pub struct PerfManager {
    events: EventSet,
    online_cpus: Vec<usize>,
    resolver: Arc<dyn EventResolver>,
    opener: Arc<dyn EventOpener>,
    uncore: Option<UncoreFactory>,
}

impl PerfManager {
    pub fn new(
        events: EventSet,
        online_cpus: Vec<usize>,
        resolver: Arc<dyn EventResolver>,
        opener: Arc<dyn EventOpener>,
    ) -> Result<Self, Error> {
        events.check()?;

        Ok(Self {
            events,
            online_cpus,
            resolver,
            opener,
            uncore: None,
        })
    }

    pub fn with_uncore(mut self, factory: UncoreFactory) -> Self {
        self.uncore = Some(factory);
        self
    }

    /// Create and set up the collector for the cgroup at `cgroup_path`. When
    /// no events are configured a no-op collector is returned. If setup fails
    /// everything opened so far is released before the error is returned.
    pub fn get_collector(&self, cgroup_path: &Path) -> Result<Box<dyn Collector>, Error> {
        if self.events.is_empty() {
            return Ok(Box::new(NoopCollector::new()));
        }

        let mut collector =
            PerfCollector::new(cgroup_path, &self.events, self.online_cpus.clone())?;

        if let Some(factory) = &self.uncore {
            collector = collector.with_uncore(factory(cgroup_path));
        }

        if let Err(e) = collector.setup(self.resolver.as_ref(), self.opener.as_ref()) {
            collector.destroy();
            return Err(e);
        }

        Ok(Box::new(collector))
    }
}

#[cfg(test)]
mod tests {
    use super::format::encode;
    use super::*;
    use crate::config::Group;

    use perf_event_open_sys::bindings::{self, perf_event_attr};

    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Debug, PartialEq)]
    enum Op {
        Open {
            id: RawFd,
            cpu: usize,
            leader: Option<RawFd>,
            type_: u32,
            config: u64,
            disabled: bool,
            cgroup: RawFd,
        },
        Reset(RawFd),
        Enable(RawFd),
        Close(RawFd),
    }

    #[derive(Default)]
    struct Journal {
        ops: Vec<Op>,
        // what a group read returns, by CPU and leader config
        reads: HashMap<(usize, u64), Vec<u8>>,
        // fail the nth open
        fail_open: Option<usize>,
        fail_close: Option<RawFd>,
        fail_enable: bool,
    }

    impl Journal {
        fn opens(&self) -> Vec<Op> {
            self.ops
                .iter()
                .filter(|op| matches!(op, Op::Open { .. }))
                .cloned()
                .collect()
        }

        fn count(&self, f: impl Fn(&Op) -> bool) -> usize {
            self.ops.iter().filter(|op| f(op)).count()
        }
    }

    #[derive(Clone, Default)]
    struct FakeOpener {
        journal: Arc<Mutex<Journal>>,
        next: Arc<AtomicUsize>,
    }

    struct FakeFile {
        id: RawFd,
        cpu: usize,
        config: u64,
        journal: Arc<Mutex<Journal>>,
    }

    impl EventOpener for FakeOpener {
        fn open(
            &self,
            attr: &mut perf_event_attr,
            cgroup: RawFd,
            cpu: usize,
            leader: Option<&dyn EventFile>,
        ) -> io::Result<Box<dyn EventFile>> {
            let mut journal = self.journal.lock();
            let n = self.next.fetch_add(1, Ordering::Relaxed);

            if journal.fail_open == Some(n) {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }

            let id = 100 + n as RawFd;

            journal.ops.push(Op::Open {
                id,
                cpu,
                leader: leader.map(|l| l.as_raw_fd()),
                type_: attr.type_,
                config: attr.config,
                disabled: attr.disabled() == 1,
                cgroup,
            });

            Ok(Box::new(FakeFile {
                id,
                cpu,
                config: attr.config,
                journal: self.journal.clone(),
            }))
        }
    }

    impl EventFile for FakeFile {
        fn as_raw_fd(&self) -> RawFd {
            self.id
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let journal = self.journal.lock();
            let data = journal
                .reads
                .get(&(self.cpu, self.config))
                .ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))?;
            let len = data.len().min(buf.len());
            buf[..len].copy_from_slice(&data[..len]);
            Ok(len)
        }

        fn reset(&self) -> io::Result<()> {
            self.journal.lock().ops.push(Op::Reset(self.id));
            Ok(())
        }

        fn enable(&self) -> io::Result<()> {
            let mut journal = self.journal.lock();
            if journal.fail_enable {
                return Err(io::Error::from_raw_os_error(libc::EBUSY));
            }
            journal.ops.push(Op::Enable(self.id));
            Ok(())
        }

        fn close(self: Box<Self>) -> io::Result<()> {
            let mut journal = self.journal.lock();
            journal.ops.push(Op::Close(self.id));
            if journal.fail_close == Some(self.id) {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            Ok(())
        }
    }

    /// Resolves `eventN` to config N, anything else fails.
    struct FakeResolver;

    impl EventResolver for FakeResolver {
        fn translate(&self, name: &str) -> Result<EventConfig, ResolveError> {
            name.strip_prefix("event")
                .and_then(|n| n.parse().ok())
                .map(|n| EventConfig::new(bindings::PERF_TYPE_RAW, n))
                .ok_or_else(|| ResolveError::UnknownEvent(name.to_owned()))
        }
    }

    fn events(groups: &[&[&str]]) -> EventSet {
        EventSet {
            events: groups
                .iter()
                .map(|g| Group {
                    events: g.iter().map(|e| e.to_string()).collect(),
                })
                .collect(),
            custom_events: vec![],
        }
    }

    fn values(stats: &ContainerStats) -> Vec<(usize, &str, u64, f64)> {
        stats
            .perf_stats
            .iter()
            .map(|s| (s.cpu, s.value.name.as_str(), s.value.value, s.value.scaling_ratio))
            .collect()
    }

    #[test]
    fn setup_orders_leaders_and_siblings() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector = PerfCollector::new(
            cgroup.path(),
            &events(&[&["event1", "event2", "event3"]]),
            vec![0, 1],
        )
        .unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();

        assert_eq!(collector.descriptors(), 6);

        let journal = opener.journal.lock();
        let opens = journal.opens();
        assert_eq!(opens.len(), 6);

        let leaders: HashMap<usize, RawFd> = opens
            .iter()
            .filter_map(|op| match op {
                Op::Open {
                    id,
                    cpu,
                    leader: None,
                    disabled,
                    config,
                    ..
                } => {
                    assert!(*disabled);
                    assert_eq!(*config, 1);
                    Some((*cpu, *id))
                }
                _ => None,
            })
            .collect();
        assert_eq!(leaders.len(), 2);

        for op in &opens {
            if let Op::Open {
                cpu,
                leader: Some(leader),
                disabled,
                type_,
                ..
            } = op
            {
                assert_eq!(leaders[cpu], *leader);
                assert!(!disabled);
                assert_eq!(*type_, bindings::PERF_TYPE_RAW);
            }
        }

        // counting only starts once every member is open
        let last_open = journal
            .ops
            .iter()
            .rposition(|op| matches!(op, Op::Open { .. }))
            .unwrap();
        let first_control = journal
            .ops
            .iter()
            .position(|op| matches!(op, Op::Reset(_) | Op::Enable(_)))
            .unwrap();
        assert!(first_control > last_open);

        let mut enabled: Vec<RawFd> = journal
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Enable(id) => Some(*id),
                _ => None,
            })
            .collect();
        enabled.sort_unstable();
        let mut expected: Vec<RawFd> = leaders.values().copied().collect();
        expected.sort_unstable();
        assert_eq!(enabled, expected);
        assert_eq!(journal.count(|op| matches!(op, Op::Reset(_))), 2);
    }

    #[test]
    fn descriptors_are_scoped_to_the_cgroup() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector =
            PerfCollector::new(cgroup.path(), &events(&[&["event1"]]), vec![0]).unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();

        let journal = opener.journal.lock();
        match &journal.opens()[0] {
            Op::Open { cgroup, .. } => assert!(*cgroup >= 0),
            op => panic!("unexpected {op:?}"),
        }
    }

    #[test]
    fn scaled_read() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector = PerfCollector::new(
            cgroup.path(),
            &events(&[&["event1", "event2", "event3"]]),
            vec![0, 1],
        )
        .unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();

        {
            let mut journal = opener.journal.lock();
            let data = encode(1000, 500, &[(100, 1), (200, 2), (300, 3)]);
            journal.reads.insert((0, 1), data.clone());
            journal.reads.insert((1, 1), data);
        }

        let mut stats = ContainerStats::default();
        collector.update_stats(&mut stats).unwrap();

        assert_eq!(
            values(&stats),
            vec![
                (0, "event1", 200, 0.5),
                (0, "event2", 400, 0.5),
                (0, "event3", 600, 0.5),
                (1, "event1", 200, 0.5),
                (1, "event2", 400, 0.5),
                (1, "event3", 600, 0.5),
            ]
        );
    }

    #[test]
    fn never_enabled_reports_raw_values() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector =
            PerfCollector::new(cgroup.path(), &events(&[&["event1", "event2"]]), vec![0]).unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();

        opener
            .journal
            .lock()
            .reads
            .insert((0, 1), encode(0, 0, &[(7, 1), (9, 2)]));

        let mut stats = ContainerStats::default();
        collector.update_stats(&mut stats).unwrap();

        assert_eq!(
            values(&stats),
            vec![(0, "event1", 7, 1.0), (0, "event2", 9, 1.0)]
        );
    }

    #[test]
    fn never_running_reports_raw_values() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector =
            PerfCollector::new(cgroup.path(), &events(&[&["event1"]]), vec![0]).unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();

        opener
            .journal
            .lock()
            .reads
            .insert((0, 1), encode(1000, 0, &[(42, 1)]));

        let mut stats = ContainerStats::default();
        collector.update_stats(&mut stats).unwrap();

        assert_eq!(values(&stats), vec![(0, "event1", 42, 0.0)]);
    }

    #[test]
    fn bad_reads_are_skipped() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector = PerfCollector::new(
            cgroup.path(),
            &events(&[&["event1", "event2"], &["event3"]]),
            vec![0, 1, 2],
        )
        .unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();

        {
            let mut journal = opener.journal.lock();
            // cpu 0 is fine
            journal
                .reads
                .insert((0, 1), encode(100, 100, &[(1, 1), (2, 2)]));
            // cpu 1 returns a short read
            journal
                .reads
                .insert((1, 1), encode(100, 100, &[(1, 1), (2, 2)])[..30].to_vec());
            // cpu 2 reports the wrong number of values
            journal.reads.insert((2, 1), encode(100, 100, &[(1, 1)]));
            // the second group only reads on cpu 2
            journal.reads.insert((2, 3), encode(100, 100, &[(5, 3)]));
        }

        let reads = PERF_GROUP_READS.value();
        let read_errors = PERF_GROUP_READ_ERRORS.value();

        let mut stats = ContainerStats::default();
        collector.update_stats(&mut stats).unwrap();

        // counters are shared with concurrently running tests
        assert!(PERF_GROUP_READS.value() >= reads + 2);
        assert!(PERF_GROUP_READ_ERRORS.value() >= read_errors + 2);

        assert_eq!(
            values(&stats),
            vec![
                (0, "event1", 1, 1.0),
                (0, "event2", 2, 1.0),
                (2, "event3", 5, 1.0),
            ]
        );
    }

    #[test]
    fn update_replaces_previous_values() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector =
            PerfCollector::new(cgroup.path(), &events(&[&["event1"]]), vec![0]).unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();

        opener
            .journal
            .lock()
            .reads
            .insert((0, 1), encode(10, 10, &[(3, 1)]));

        let mut stats = ContainerStats::default();
        collector.update_stats(&mut stats).unwrap();
        collector.update_stats(&mut stats).unwrap();

        assert_eq!(values(&stats), vec![(0, "event1", 3, 1.0)]);
    }

    #[test]
    fn custom_events_bypass_the_resolver() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let mut events = events(&[&["uops", "event2"]]);
        events.custom_events.push(CustomEvent {
            type_: 4,
            config: vec![0x5300c2],
            name: "uops".into(),
        });

        let collector = PerfCollector::new(cgroup.path(), &events, vec![0]).unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();

        let journal = opener.journal.lock();
        match &journal.opens()[0] {
            Op::Open {
                type_,
                config,
                leader,
                ..
            } => {
                assert_eq!(*type_, 4);
                assert_eq!(*config, 0x5300c2);
                assert_eq!(*leader, None);
            }
            op => panic!("unexpected {op:?}"),
        }
    }

    #[test]
    fn destroy_closes_everything_once() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector = PerfCollector::new(
            cgroup.path(),
            &events(&[&["event1", "event2", "event3"], &["event4"]]),
            vec![0, 1],
        )
        .unwrap();
        collector.setup(&FakeResolver, &opener).unwrap();
        opener.journal.lock().fail_close = Some(101);

        let close_errors = PERF_CLOSE_ERRORS.value();

        collector.destroy();

        assert!(PERF_CLOSE_ERRORS.value() > close_errors);

        assert_eq!(collector.descriptors(), 0);

        let journal = opener.journal.lock();
        let mut opened: Vec<RawFd> = journal
            .opens()
            .iter()
            .map(|op| match op {
                Op::Open { id, .. } => *id,
                _ => unreachable!(),
            })
            .collect();
        let mut closed: Vec<RawFd> = journal
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Close(id) => Some(*id),
                _ => None,
            })
            .collect();
        opened.sort_unstable();
        closed.sort_unstable();

        assert_eq!(opened.len(), 8);
        assert_eq!(opened, closed);
    }

    #[test]
    fn resolve_failure_keeps_opened_descriptors() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector = PerfCollector::new(
            cgroup.path(),
            &events(&[&["event1", "event2"], &["event3", "unknown"]]),
            vec![0, 1],
        )
        .unwrap();

        match collector.setup(&FakeResolver, &opener) {
            Err(Error::Resolve { event, group, .. }) => {
                assert_eq!(event, "unknown");
                assert_eq!(group, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        // the first group and the leader of the second are still held
        assert_eq!(collector.descriptors(), 6);

        collector.destroy();
        assert_eq!(collector.descriptors(), 0);
    }

    #[test]
    fn open_failure_is_reported() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();
        opener.journal.lock().fail_open = Some(3);

        let collector = PerfCollector::new(
            cgroup.path(),
            &events(&[&["event1", "event2"]]),
            vec![0, 1],
        )
        .unwrap();

        match collector.setup(&FakeResolver, &opener) {
            Err(Error::Open {
                event, group, cpu, ..
            }) => {
                assert_eq!(event, "event2");
                assert_eq!(group, 0);
                assert_eq!(cpu, 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(collector.descriptors(), 3);
        assert_eq!(
            opener.journal.lock().count(|op| matches!(op, Op::Enable(_))),
            0
        );
    }

    #[test]
    fn control_failure_is_reported() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();
        opener.journal.lock().fail_enable = true;

        let collector =
            PerfCollector::new(cgroup.path(), &events(&[&["event7"]]), vec![0]).unwrap();

        match collector.setup(&FakeResolver, &opener) {
            Err(Error::Control { op, config, .. }) => {
                assert_eq!(op, "enable");
                assert_eq!(config.config, 7);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_cgroup() {
        let cgroup = tempfile::tempdir().unwrap();
        let collector = PerfCollector::new(
            cgroup.path().join("gone"),
            &events(&[&["event1"]]),
            vec![0],
        )
        .unwrap();

        assert!(matches!(
            collector.setup(&FakeResolver, &FakeOpener::default()),
            Err(Error::Cgroup { .. })
        ));
    }

    struct FakeUncore {
        fail: bool,
        destroyed: Arc<AtomicUsize>,
    }

    impl Collector for FakeUncore {
        fn name(&self) -> &'static str {
            "uncore"
        }

        fn update_stats(&self, stats: &mut ContainerStats) -> crate::Result<()> {
            if self.fail {
                return Err(Error::MissingLeader { group: 0, cpu: 0 }.into());
            }

            stats.perf_stats.push(PerfStat {
                cpu: 0,
                value: PerfValue {
                    name: "uncore_imc/cas_count_read/".into(),
                    value: 11,
                    scaling_ratio: 1.0,
                },
            });

            Ok(())
        }

        fn destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn uncore_values_are_merged() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();
        let destroyed = Arc::new(AtomicUsize::new(0));

        let collector = PerfCollector::new(cgroup.path(), &events(&[&["event1"]]), vec![0])
            .unwrap()
            .with_uncore(Box::new(FakeUncore {
                fail: false,
                destroyed: destroyed.clone(),
            }));
        collector.setup(&FakeResolver, &opener).unwrap();

        opener
            .journal
            .lock()
            .reads
            .insert((0, 1), encode(10, 10, &[(3, 1)]));

        let mut stats = ContainerStats::default();
        collector.update_stats(&mut stats).unwrap();

        assert_eq!(
            values(&stats),
            vec![
                (0, "event1", 3, 1.0),
                (0, "uncore_imc/cas_count_read/", 11, 1.0)
            ]
        );

        collector.destroy();
        assert_eq!(destroyed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn uncore_failure_is_not_fatal() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let collector = PerfCollector::new(cgroup.path(), &events(&[&["event1"]]), vec![0])
            .unwrap()
            .with_uncore(Box::new(FakeUncore {
                fail: true,
                destroyed: Arc::new(AtomicUsize::new(0)),
            }));
        collector.setup(&FakeResolver, &opener).unwrap();

        opener
            .journal
            .lock()
            .reads
            .insert((0, 1), encode(10, 10, &[(3, 1)]));

        let mut stats = ContainerStats::default();
        collector.update_stats(&mut stats).unwrap();

        assert_eq!(values(&stats), vec![(0, "event1", 3, 1.0)]);
    }

    #[test]
    fn repeated_event_is_rejected() {
        let cgroup = tempfile::tempdir().unwrap();
        let set = events(&[&["event1", "event2", "event1"]]);

        assert!(matches!(
            PerfCollector::new(cgroup.path(), &set, vec![0]),
            Err(Error::Events(ConfigError::DuplicateEvent { group: 0, .. }))
        ));

        let opener = FakeOpener::default();
        let manager = PerfManager::new(
            set,
            vec![0],
            Arc::new(FakeResolver),
            Arc::new(opener.clone()),
        );

        match manager {
            Err(Error::Events(ConfigError::DuplicateEvent { event, group })) => {
                assert_eq!(event, "event1");
                assert_eq!(group, 0);
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("duplicate event accepted"),
        }

        assert!(opener.journal.lock().ops.is_empty());
    }

    #[test]
    fn empty_group_is_rejected() {
        let cgroup = tempfile::tempdir().unwrap();
        let set = events(&[&["event1"], &[], &["event2"]]);

        assert!(matches!(
            PerfCollector::new(cgroup.path(), &set, vec![0]),
            Err(Error::Events(ConfigError::EmptyGroup { group: 1 }))
        ));
        assert!(matches!(
            PerfManager::new(
                set,
                vec![0],
                Arc::new(FakeResolver),
                Arc::new(FakeOpener::default()),
            ),
            Err(Error::Events(ConfigError::EmptyGroup { group: 1 }))
        ));
    }

    #[test]
    fn manager_without_events_is_noop() {
        let manager = PerfManager::new(
            EventSet::default(),
            vec![0],
            Arc::new(FakeResolver),
            Arc::new(FakeOpener::default()),
        )
        .unwrap();

        let collector = manager.get_collector(Path::new("/nonexistent")).unwrap();
        assert_eq!(collector.name(), "noop");
    }

    #[test]
    fn manager_cleans_up_failed_setup() {
        let cgroup = tempfile::tempdir().unwrap();
        let opener = FakeOpener::default();

        let manager = PerfManager::new(
            events(&[&["event1", "event2"], &["bogus"]]),
            vec![0, 1],
            Arc::new(FakeResolver),
            Arc::new(opener.clone()),
        )
        .unwrap();

        assert!(matches!(
            manager.get_collector(cgroup.path()),
            Err(Error::Resolve { .. })
        ));

        let journal = opener.journal.lock();
        assert_eq!(journal.count(|op| matches!(op, Op::Open { .. })), 4);
        assert_eq!(journal.count(|op| matches!(op, Op::Close(_))), 4);
    }

    #[test]
    fn manager_builds_collectors() {
        let cgroup = tempfile::tempdir().unwrap();
        let destroyed = Arc::new(AtomicUsize::new(0));
        let uncore_destroyed = destroyed.clone();

        let manager = PerfManager::new(
            events(&[&["event1"]]),
            vec![0, 1],
            Arc::new(FakeResolver),
            Arc::new(FakeOpener::default()),
        )
        .unwrap()
        .with_uncore(Box::new(move |_| {
            Box::new(FakeUncore {
                fail: false,
                destroyed: uncore_destroyed.clone(),
            })
        }));

        let collector = manager.get_collector(cgroup.path()).unwrap();
        assert_eq!(collector.name(), "perf");

        collector.destroy();
        assert_eq!(destroyed.load(Ordering::Relaxed), 1);
    }
}
