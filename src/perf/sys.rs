//! The kernel side of the perf engine: opening counter descriptors and the
//! control operations applied to them.

use perf_event_open_sys::bindings::{self, perf_event_attr};

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

/// An open perf counter descriptor.
pub trait EventFile: Send {
    fn as_raw_fd(&self) -> RawFd;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Reset the counters of the group this descriptor leads.
    fn reset(&self) -> io::Result<()>;

    /// Enable the group this descriptor leads.
    fn enable(&self) -> io::Result<()>;

    /// Close the descriptor, reporting any error from `close(2)`.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Opens perf counter descriptors.
pub trait EventOpener: Send + Sync {
    /// Open `attr` on `cpu`, counting only tasks in the cgroup referred to by
    /// the `cgroup` directory descriptor. With no `leader` the event starts a
    /// new group, otherwise it joins the group led by `leader`.
    fn open(
        &self,
        attr: &mut perf_event_attr,
        cgroup: RawFd,
        cpu: usize,
        leader: Option<&dyn EventFile>,
    ) -> io::Result<Box<dyn EventFile>>;
}

/// Opens descriptors with `perf_event_open(2)`.
#[derive(Copy, Clone, Debug, Default)]
pub struct KernelOpener;

/// `group_fd` that starts a new group.
const NEW_GROUP: RawFd = -1;

impl EventOpener for KernelOpener {
    fn open(
        &self,
        attr: &mut perf_event_attr,
        cgroup: RawFd,
        cpu: usize,
        leader: Option<&dyn EventFile>,
    ) -> io::Result<Box<dyn EventFile>> {
        let group_fd = leader.map(|l| l.as_raw_fd()).unwrap_or(NEW_GROUP);
        let flags = bindings::PERF_FLAG_FD_CLOEXEC | bindings::PERF_FLAG_PID_CGROUP;

        let fd = unsafe {
            perf_event_open_sys::perf_event_open(attr, cgroup, cpu as _, group_fd, flags as _)
        };

        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: the kernel just handed us this descriptor and nothing else
        // refers to it.
        let file = unsafe { File::from_raw_fd(fd) };

        Ok(Box::new(PerfFile { file }))
    }
}

pub struct PerfFile {
    file: File,
}

impl EventFile for PerfFile {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn reset(&self) -> io::Result<()> {
        check(unsafe {
            perf_event_open_sys::ioctls::RESET(
                self.file.as_raw_fd(),
                bindings::PERF_IOC_FLAG_GROUP as _,
            )
        })
    }

    fn enable(&self) -> io::Result<()> {
        check(unsafe {
            perf_event_open_sys::ioctls::ENABLE(
                self.file.as_raw_fd(),
                bindings::PERF_IOC_FLAG_GROUP as _,
            )
        })
    }

    fn close(self: Box<Self>) -> io::Result<()> {
        let fd = self.file.into_raw_fd();

        check(unsafe { libc::close(fd) })
    }
}

fn check(result: libc::c_int) -> io::Result<()> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
