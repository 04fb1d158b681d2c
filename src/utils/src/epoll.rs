// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLLRDHUP, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

/// Wrapper over the `EPOLL_CTL_*` operations that can be performed on a
/// file descriptor.
#[repr(i32)]
pub enum ControlOperation {
    /// Add a file descriptor to the interest list.
    Add = EPOLL_CTL_ADD,
    /// Change the settings associated with a file descriptor that is
    /// already in the interest list.
    Modify = EPOLL_CTL_MOD,
    /// Remove a file descriptor from the interest list.
    Delete = EPOLL_CTL_DEL,
}

bitflags::bitflags! {
    /// The type of events we can monitor a file descriptor for.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct EventSet: u32 {
        /// The associated file descriptor is available for read operations.
        const IN = EPOLLIN as u32;
        /// The associated file descriptor is available for write operations.
        const OUT = EPOLLOUT as u32;
        /// Error condition happened on the associated file descriptor.
        const ERROR = EPOLLERR as u32;
        /// Hang up happened on the associated file descriptor.
        const HANG_UP = EPOLLHUP as u32;
        /// The peer closed its end of the connection, or shut down writing.
        const READ_HANG_UP = EPOLLRDHUP as u32;
    }
}

/// Wrapper over `libc::epoll_event`.
///
// `transparent` keeps this struct layout-identical to the C `epoll_event`,
// so a slice of `EpollEvent` can be handed to `epoll_wait` directly.
#[repr(transparent)]
#[derive(Clone)]
pub struct EpollEvent(epoll_event);

impl Default for EpollEvent {
    fn default() -> Self {
        EpollEvent(epoll_event {
            events: 0u32,
            u64: 0u64,
        })
    }
}

impl EpollEvent {
    /// Creates a new `epoll_event` carrying an event mask and a user data
    /// variable. `data` is conventionally the fd being monitored.
    pub fn new(events: EventSet, data: u64) -> Self {
        EpollEvent(epoll_event {
            events: events.bits(),
            u64: data,
        })
    }

    /// Returns the `EventSet` corresponding to `epoll_event.events`.
    /// Bits the wrapper does not model are dropped.
    pub fn event_set(&self) -> EventSet {
        EventSet::from_bits_truncate(self.0.events)
    }

    /// Returns the user data of the `libc::epoll_event`.
    pub fn data(&self) -> u64 {
        self.0.u64
    }

    /// Converts the `libc::epoll_event` data to a `RawFd`.
    pub fn fd(&self) -> RawFd {
        self.0.u64 as i32
    }
}

/// Wrapper over an epoll instance.
#[derive(Debug)]
pub struct Epoll {
    epoll_fd: RawFd,
}

impl Epoll {
    /// Creates a new epoll file descriptor.
    pub fn new() -> io::Result<Self> {
        // SAFETY: epoll_create1 has no memory arguments; the return value is checked.
        let epoll_fd = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Epoll { epoll_fd })
    }

    /// Adds, modifies or removes `fd` in the interest list of this epoll
    /// instance.
    pub fn ctl(&self, operation: ControlOperation, fd: RawFd, event: EpollEvent) -> io::Result<()> {
        // SAFETY: the epoll fd and the watched fd are valid for the lifetime of
        // `self`, and `event` lives across the call. The return value is checked.
        let ret = unsafe {
            epoll_ctl(
                self.epoll_fd,
                operation as i32,
                fd,
                &event as *const EpollEvent as *mut epoll_event,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits until at least one of the monitored file descriptors becomes
    /// ready, or `timeout` milliseconds elapse (`-1` blocks indefinitely).
    /// Fills `events` and returns the number of ready descriptors.
    pub fn wait(&self, timeout: i32, events: &mut [EpollEvent]) -> io::Result<usize> {
        // SAFETY: `events` is a valid, writable slice of `epoll_event`-layout
        // structures and its length bounds the kernel writes.
        let event_count = unsafe {
            epoll_wait(
                self.epoll_fd,
                events.as_mut_ptr() as *mut epoll_event,
                events.len() as i32,
                timeout,
            )
        };
        if event_count < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(event_count as usize)
    }
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epoll_fd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        // SAFETY: the fd was opened by `epoll_create1` and is owned by `self`.
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}
