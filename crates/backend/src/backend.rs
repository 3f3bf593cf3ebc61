//! Capability boundary between the session layer and a device runtime.
//!
//! A backend exposes the primitive operations of a manycore device runtime:
//! device init/finish, program init, malloc, memset/memcpy, kernel enqueue and
//! tile-group execution. Backends report failures as plain `anyhow` errors;
//! the session layer decides which stage each failure belongs to.

use crate::launch::LaunchDescriptor;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Which physical device a session should attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub name: String,
    pub id: u32,
}

impl DeviceIdentity {
    pub fn new(name: impl Into<String>, id: u32) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self::new("manycore", 0)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.id)
    }
}

pub trait DeviceBackend {
    /// Attaches to the device. Called once per session, before anything else.
    fn init(&mut self, identity: &DeviceIdentity) -> Result<()>;

    /// Binds the executable image whose entry points later launches may name.
    fn load_program(&mut self, binary: &Path, allocator: &str) -> Result<()>;

    /// Reserves `len` bytes of device memory and returns the base address.
    fn malloc(&mut self, len: usize) -> Result<u32>;

    /// Fills `len` bytes starting at `address` with `value`.
    fn memset(&mut self, address: u32, value: u8, len: usize) -> Result<()>;

    fn copy_to_device(&mut self, address: u32, src: &[u8]) -> Result<()>;

    /// Fills all of `dst` from device memory starting at `address`.
    fn copy_to_host(&mut self, dst: &mut [u8], address: u32) -> Result<()>;

    /// Queues a launch. Nothing runs until [`DeviceBackend::execute_pending`].
    fn enqueue(&mut self, launch: &LaunchDescriptor) -> Result<()>;

    /// Runs every queued launch to completion, draining the queue.
    fn execute_pending(&mut self) -> Result<()>;

    /// Releases everything the backend holds for the session.
    fn finish(&mut self) -> Result<()>;
}

impl<B: DeviceBackend + ?Sized> DeviceBackend for Box<B> {
    fn init(&mut self, identity: &DeviceIdentity) -> Result<()> {
        (**self).init(identity)
    }

    fn load_program(&mut self, binary: &Path, allocator: &str) -> Result<()> {
        (**self).load_program(binary, allocator)
    }

    fn malloc(&mut self, len: usize) -> Result<u32> {
        (**self).malloc(len)
    }

    fn memset(&mut self, address: u32, value: u8, len: usize) -> Result<()> {
        (**self).memset(address, value, len)
    }

    fn copy_to_device(&mut self, address: u32, src: &[u8]) -> Result<()> {
        (**self).copy_to_device(address, src)
    }

    fn copy_to_host(&mut self, dst: &mut [u8], address: u32) -> Result<()> {
        (**self).copy_to_host(dst, address)
    }

    fn enqueue(&mut self, launch: &LaunchDescriptor) -> Result<()> {
        (**self).enqueue(launch)
    }

    fn execute_pending(&mut self) -> Result<()> {
        (**self).execute_pending()
    }

    fn finish(&mut self) -> Result<()> {
        (**self).finish()
    }
}
