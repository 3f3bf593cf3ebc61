//! Failure injection for exercising every stage of a device session.

use crate::backend::{DeviceBackend, DeviceIdentity};
use crate::launch::LaunchDescriptor;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// One primitive of the [`DeviceBackend`] interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendCall {
    Init,
    LoadProgram,
    Malloc,
    Memset,
    CopyToDevice,
    CopyToHost,
    Enqueue,
    ExecutePending,
    Finish,
}

impl BackendCall {
    pub const ALL: [BackendCall; 9] = [
        BackendCall::Init,
        BackendCall::LoadProgram,
        BackendCall::Malloc,
        BackendCall::Memset,
        BackendCall::CopyToDevice,
        BackendCall::CopyToHost,
        BackendCall::Enqueue,
        BackendCall::ExecutePending,
        BackendCall::Finish,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            BackendCall::Init => "init",
            BackendCall::LoadProgram => "load-program",
            BackendCall::Malloc => "malloc",
            BackendCall::Memset => "memset",
            BackendCall::CopyToDevice => "copy-to-device",
            BackendCall::CopyToHost => "copy-to-host",
            BackendCall::Enqueue => "enqueue",
            BackendCall::ExecutePending => "execute-pending",
            BackendCall::Finish => "finish",
        }
    }
}

impl fmt::Display for BackendCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `occurrence`-th call (1-based) to `call` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultPoint {
    pub call: BackendCall,
    pub occurrence: usize,
}

impl FaultPoint {
    pub fn first(call: BackendCall) -> Self {
        Self::nth(call, 1)
    }

    pub fn nth(call: BackendCall, occurrence: usize) -> Self {
        Self { call, occurrence }
    }
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.call, self.occurrence)
    }
}

/// Shared record of the calls a backend received, in order.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<BackendCall>>>);

impl CallLog {
    pub fn calls(&self) -> Vec<BackendCall> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, call: BackendCall) -> usize {
        self.calls().into_iter().filter(|recorded| *recorded == call).count()
    }

    /// Records `call` and returns how many times it has now been seen.
    fn record(&self, call: BackendCall) -> usize {
        let mut calls = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        calls.push(call);
        calls.iter().filter(|recorded| **recorded == call).count()
    }
}

/// Wraps a backend, logging every call and failing the configured ones.
///
/// A failing call never reaches the inner backend, except `finish`: the inner
/// backend is still released and the fault is reported afterwards.
#[derive(Debug)]
pub struct FaultInjector<B> {
    inner: B,
    faults: Vec<FaultPoint>,
    log: CallLog,
}

impl<B: DeviceBackend> FaultInjector<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            faults: Vec::new(),
            log: CallLog::default(),
        }
    }

    pub fn fail_at(mut self, point: FaultPoint) -> Self {
        self.faults.push(point);
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn check(&self, call: BackendCall) -> Result<()> {
        let occurrence = self.log.record(call);
        let point = FaultPoint::nth(call, occurrence);
        if self.faults.contains(&point) {
            debug!(fault = %point, "injecting backend failure");
            bail!("injected failure at {point}");
        }
        Ok(())
    }
}

impl<B: DeviceBackend> DeviceBackend for FaultInjector<B> {
    fn init(&mut self, identity: &DeviceIdentity) -> Result<()> {
        self.check(BackendCall::Init)?;
        self.inner.init(identity)
    }

    fn load_program(&mut self, binary: &Path, allocator: &str) -> Result<()> {
        self.check(BackendCall::LoadProgram)?;
        self.inner.load_program(binary, allocator)
    }

    fn malloc(&mut self, len: usize) -> Result<u32> {
        self.check(BackendCall::Malloc)?;
        self.inner.malloc(len)
    }

    fn memset(&mut self, address: u32, value: u8, len: usize) -> Result<()> {
        self.check(BackendCall::Memset)?;
        self.inner.memset(address, value, len)
    }

    fn copy_to_device(&mut self, address: u32, src: &[u8]) -> Result<()> {
        self.check(BackendCall::CopyToDevice)?;
        self.inner.copy_to_device(address, src)
    }

    fn copy_to_host(&mut self, dst: &mut [u8], address: u32) -> Result<()> {
        self.check(BackendCall::CopyToHost)?;
        self.inner.copy_to_host(dst, address)
    }

    fn enqueue(&mut self, launch: &LaunchDescriptor) -> Result<()> {
        self.check(BackendCall::Enqueue)?;
        self.inner.enqueue(launch)
    }

    fn execute_pending(&mut self) -> Result<()> {
        self.check(BackendCall::ExecutePending)?;
        self.inner.execute_pending()
    }

    fn finish(&mut self) -> Result<()> {
        let fault = self.check(BackendCall::Finish);
        self.inner.finish()?;
        fault
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedManycore;

    #[test]
    fn only_the_chosen_occurrence_fails() {
        let mut backend = FaultInjector::new(SimulatedManycore::default())
            .fail_at(FaultPoint::nth(BackendCall::Malloc, 2));
        backend.init(&DeviceIdentity::default()).unwrap();
        assert!(backend.malloc(4).is_ok());
        assert!(backend.malloc(4).is_err());
        assert!(backend.malloc(4).is_ok());
        assert_eq!(backend.log().count(BackendCall::Malloc), 3);
        assert_eq!(
            backend.log().calls(),
            vec![
                BackendCall::Init,
                BackendCall::Malloc,
                BackendCall::Malloc,
                BackendCall::Malloc
            ]
        );
    }

    #[test]
    fn failed_finish_still_releases_the_inner_backend() {
        let mut backend = FaultInjector::new(SimulatedManycore::default())
            .fail_at(FaultPoint::first(BackendCall::Finish));
        backend.init(&DeviceIdentity::default()).unwrap();
        assert!(backend.finish().is_err());
        assert!(backend.inner().attached().is_none());
    }
}
