//! Device session lifecycle.
//!
//! A [`DeviceSession`] is a guard: once open it is closed exactly once, either
//! explicitly through [`DeviceSession::close`] (which reports close failures)
//! or implicitly when the guard is dropped. Every early return after open is
//! therefore safe without any cleanup code at the call site.

use crate::backend::{DeviceBackend, DeviceIdentity};
use crate::error::{describe, DeviceError, DeviceResult, SessionState};
use crate::handle::{BufferHandle, SessionId};
use crate::launch::LaunchDescriptor;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct DeviceSession<B: DeviceBackend> {
    id: SessionId,
    identity: DeviceIdentity,
    state: SessionState,
    pending_launches: usize,
    backend: B,
}

impl<B: DeviceBackend> DeviceSession<B> {
    /// Attaches `backend` to the device named by `identity`.
    ///
    /// If attaching fails the backend is still finished once, so whatever it
    /// acquired before failing is released.
    pub fn open(backend: B, identity: &DeviceIdentity) -> DeviceResult<Self> {
        let mut session = Self {
            id: SessionId::next(),
            identity: identity.clone(),
            state: SessionState::Opened,
            pending_launches: 0,
            backend,
        };

        if let Err(err) = session.backend.init(identity) {
            let err = DeviceError::DeviceUnavailable(describe(&err));
            warn!(session = %session.id, device = %identity, error = %err, "device open failed");
            if let Err(close_err) = session.close() {
                warn!(session = %session.id, error = %close_err, "release after failed open also failed");
            }
            return Err(err);
        }

        info!(session = %session.id, device = %identity, "device session opened");
        Ok(session)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Launches enqueued since the last drain.
    pub fn pending_launches(&self) -> usize {
        self.pending_launches
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Binds the executable image that defines the entry points later
    /// launches may name.
    pub fn load_program(&mut self, binary: &Path, allocator: &str) -> DeviceResult<()> {
        self.require("load_program", &[SessionState::Opened])?;
        self.stage(
            |backend| backend.load_program(binary, allocator),
            DeviceError::ProgramLoadFailed,
        )?;
        self.state = SessionState::ProgramLoaded;
        info!(
            session = %self.id,
            binary = %binary.display(),
            allocator,
            "program loaded"
        );
        Ok(())
    }

    /// Validates and queues a launch. Nothing runs until
    /// [`DeviceSession::execute_pending`].
    pub fn enqueue(&mut self, launch: &LaunchDescriptor) -> DeviceResult<()> {
        self.require("enqueue", &[SessionState::ProgramLoaded])?;
        if let Err(reason) = launch.validate() {
            return self.fail(DeviceError::EnqueueFailed(reason));
        }
        for handle in launch.buffers() {
            self.check_owner(handle)?;
        }
        self.stage(|backend| backend.enqueue(launch), DeviceError::EnqueueFailed)?;
        self.pending_launches += 1;
        debug!(session = %self.id, %launch, pending = self.pending_launches, "launch enqueued");
        Ok(())
    }

    /// Blocks until every enqueued launch has completed on the device.
    pub fn execute_pending(&mut self) -> DeviceResult<()> {
        self.require("execute_pending", &[SessionState::ProgramLoaded])?;
        let launches = std::mem::take(&mut self.pending_launches);
        let start = Instant::now();
        self.stage(|backend| backend.execute_pending(), DeviceError::ExecutionFailed)?;
        info!(
            session = %self.id,
            launches,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "pending tile groups executed"
        );
        Ok(())
    }

    /// Releases every device resource held by the session. Outstanding buffer
    /// handles become dangling. Calling it again is a no-op.
    pub fn close(&mut self) -> DeviceResult<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let previous = std::mem::replace(&mut self.state, SessionState::Closed);
        self.pending_launches = 0;

        match self.backend.finish() {
            Ok(()) => {
                info!(session = %self.id, from = %previous, "device session closed");
                Ok(())
            }
            Err(err) => {
                let err = DeviceError::SessionCloseFailed(describe(&err));
                warn!(session = %self.id, from = %previous, error = %err, "device session close failed");
                Err(err)
            }
        }
    }

    pub(crate) fn require(&self, operation: &'static str, allowed: &[SessionState]) -> DeviceResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(DeviceError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    pub(crate) fn check_owner(&self, handle: &BufferHandle) -> DeviceResult<()> {
        if handle.session() == self.id {
            Ok(())
        } else {
            Err(DeviceError::ForeignBuffer {
                owner: handle.session(),
                session: self.id,
            })
        }
    }

    /// Runs one backend primitive, classifying its failure as `classify` and
    /// moving the session to `Failed`.
    pub(crate) fn stage<T>(
        &mut self,
        run: impl FnOnce(&mut B) -> anyhow::Result<T>,
        classify: impl FnOnce(String) -> DeviceError,
    ) -> DeviceResult<T> {
        match run(&mut self.backend) {
            Ok(value) => Ok(value),
            Err(err) => self.fail(classify(describe(&err))),
        }
    }

    pub(crate) fn fail<T>(&mut self, err: DeviceError) -> DeviceResult<T> {
        warn!(session = %self.id, from = %self.state, kind = err.kind(), error = %err, "device stage failed");
        self.state = SessionState::Failed;
        Err(err)
    }
}

impl<B: DeviceBackend> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(session = %self.id, error = %err, "closing device session on drop failed");
        }
    }
}

impl<B: DeviceBackend> std::fmt::Debug for DeviceSession<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("pending_launches", &self.pending_launches)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{BackendCall, FaultInjector, FaultPoint};
    use crate::simulator::SimulatedManycore;
    use manycore_kernels::registry::MATMUL_PROGRAM;

    fn open() -> (DeviceSession<FaultInjector<SimulatedManycore>>, crate::fault::CallLog) {
        let backend = FaultInjector::new(SimulatedManycore::default());
        let log = backend.log();
        let session = DeviceSession::open(backend, &DeviceIdentity::default()).expect("open");
        (session, log)
    }

    #[test]
    fn close_is_idempotent() {
        let (mut session, log) = open();
        session.close().expect("first close");
        session.close().expect("second close");
        drop(session);
        assert_eq!(log.count(BackendCall::Finish), 1);
    }

    #[test]
    fn drop_closes_exactly_once() {
        let (session, log) = open();
        drop(session);
        assert_eq!(log.count(BackendCall::Finish), 1);
    }

    #[test]
    fn failed_open_still_releases_once() {
        let backend = FaultInjector::new(SimulatedManycore::default())
            .fail_at(FaultPoint::first(BackendCall::Init));
        let log = backend.log();
        let err = DeviceSession::open(backend, &DeviceIdentity::default()).unwrap_err();
        assert!(matches!(err, DeviceError::DeviceUnavailable(_)));
        assert_eq!(log.count(BackendCall::Finish), 1);
    }

    #[test]
    fn closed_session_rejects_operations() {
        let (mut session, _log) = open();
        session.close().unwrap();
        let err = session.allocate(16).unwrap_err();
        assert!(matches!(
            err,
            DeviceError::InvalidState {
                operation: "allocate",
                state: SessionState::Closed
            }
        ));
        assert!(session
            .load_program(Path::new(MATMUL_PROGRAM), "default_allocator")
            .is_err());
    }

    #[test]
    fn failed_stage_poisons_session_until_close() {
        let (mut session, log) = open();
        let err = session
            .load_program(Path::new("/nowhere/kernel.riscv"), "default_allocator")
            .unwrap_err();
        assert!(matches!(err, DeviceError::ProgramLoadFailed(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            session.allocate(4),
            Err(DeviceError::InvalidState { .. })
        ));
        session.close().expect("close after failure");
        assert_eq!(log.count(BackendCall::Finish), 1);
    }

    #[test]
    fn close_failure_is_reported_once() {
        let backend = FaultInjector::new(SimulatedManycore::default())
            .fail_at(FaultPoint::first(BackendCall::Finish));
        let log = backend.log();
        let mut session = DeviceSession::open(backend, &DeviceIdentity::default()).unwrap();
        assert!(matches!(session.close(), Err(DeviceError::SessionCloseFailed(_))));
        assert!(session.is_closed());
        session.close().expect("already closed");
        drop(session);
        assert_eq!(log.count(BackendCall::Finish), 1);
    }

    #[test]
    fn execute_without_launches_is_a_no_op() {
        let (mut session, _log) = open();
        session
            .load_program(Path::new(MATMUL_PROGRAM), "default_allocator")
            .unwrap();
        session.execute_pending().expect("empty drain");
        assert_eq!(session.pending_launches(), 0);
    }
}
