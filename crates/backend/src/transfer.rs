//! Device memory allocation and host↔device transfers on an open session.

use crate::backend::DeviceBackend;
use crate::error::{DeviceError, DeviceResult, SessionState};
use crate::handle::BufferHandle;
use crate::session::DeviceSession;
use tracing::debug;

const MEMORY_STATES: &[SessionState] = &[SessionState::Opened, SessionState::ProgramLoaded];

impl<B: DeviceBackend> DeviceSession<B> {
    /// Reserves `len` bytes of device memory owned by this session.
    pub fn allocate(&mut self, len: usize) -> DeviceResult<BufferHandle> {
        self.require("allocate", MEMORY_STATES)?;
        let address = self.stage(
            |backend| backend.malloc(len),
            |reason| DeviceError::OutOfDeviceMemory {
                requested: len,
                reason,
            },
        )?;
        let handle = BufferHandle::new(address, len, self.id());
        debug!(session = %self.id(), buffer = %handle, "device buffer allocated");
        Ok(handle)
    }

    /// Sets the first `len` bytes of `handle` to zero on the device, without a
    /// host round trip.
    pub fn zero(&mut self, handle: &BufferHandle, len: usize) -> DeviceResult<()> {
        self.require("zero", MEMORY_STATES)?;
        self.check_owner(handle)?;
        if len > handle.len() {
            return Err(DeviceError::SizeMismatch {
                destination: handle.len(),
                source_len: len,
            });
        }
        self.stage(
            |backend| backend.memset(handle.address(), 0, len),
            DeviceError::TransferFailed,
        )
    }

    pub fn copy_to_device(&mut self, dst: &BufferHandle, src: &[u8]) -> DeviceResult<()> {
        self.require("copy_to_device", MEMORY_STATES)?;
        self.check_owner(dst)?;
        if dst.len() != src.len() {
            return Err(DeviceError::SizeMismatch {
                destination: dst.len(),
                source_len: src.len(),
            });
        }
        self.stage(
            |backend| backend.copy_to_device(dst.address(), src),
            DeviceError::TransferFailed,
        )
    }

    /// Fills `dst` in place from `src`. Never writes past `dst.len()`.
    pub fn copy_to_host(&mut self, dst: &mut [u8], src: &BufferHandle) -> DeviceResult<()> {
        self.require("copy_to_host", MEMORY_STATES)?;
        self.check_owner(src)?;
        if dst.len() != src.len() {
            return Err(DeviceError::SizeMismatch {
                destination: dst.len(),
                source_len: src.len(),
            });
        }
        self.stage(
            |backend| backend.copy_to_host(dst, src.address()),
            DeviceError::TransferFailed,
        )
    }

    pub fn write_f32s(&mut self, dst: &BufferHandle, values: &[f32]) -> DeviceResult<()> {
        self.copy_to_device(dst, bytemuck::cast_slice(values))
    }

    pub fn read_f32s(&mut self, src: &BufferHandle) -> DeviceResult<Vec<f32>> {
        let elements = src.len() / std::mem::size_of::<f32>();
        if elements * std::mem::size_of::<f32>() != src.len() {
            return Err(DeviceError::SizeMismatch {
                destination: elements * std::mem::size_of::<f32>(),
                source_len: src.len(),
            });
        }
        let mut values = vec![0.0f32; elements];
        self.copy_to_host(bytemuck::cast_slice_mut(&mut values), src)?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::DeviceIdentity;
    use crate::error::DeviceError;
    use crate::session::DeviceSession;
    use crate::simulator::{ManycoreConfig, SimulatedManycore};
    use proptest::prelude::*;

    fn open() -> DeviceSession<SimulatedManycore> {
        DeviceSession::open(SimulatedManycore::default(), &DeviceIdentity::default()).expect("open")
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let mut session = open();
        for len in [0usize, 16, 4096] {
            let src: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
            let handle = session.allocate(len).unwrap();
            session.copy_to_device(&handle, &src).unwrap();
            let mut dst = vec![0u8; len];
            session.copy_to_host(&mut dst, &handle).unwrap();
            assert_eq!(dst, src, "round trip of {len} bytes");
        }
    }

    #[test]
    fn zeroed_buffer_reads_back_as_zeros() {
        let mut session = open();
        for len in [0usize, 1, 3, 16, 4096, 4097] {
            let handle = session.allocate(len).unwrap();
            session.zero(&handle, len).unwrap();
            let mut dst = vec![0xffu8; len];
            session.copy_to_host(&mut dst, &handle).unwrap();
            assert!(dst.iter().all(|byte| *byte == 0), "zeroed {len} bytes");
        }
    }

    #[test]
    fn fresh_allocations_are_not_implicitly_zeroed() {
        let mut session = open();
        let handle = session.allocate(16).unwrap();
        let mut dst = [0u8; 16];
        session.copy_to_host(&mut dst, &handle).unwrap();
        assert!(dst.iter().any(|byte| *byte != 0));
    }

    #[test]
    fn mismatched_lengths_are_rejected_without_failing_the_session() {
        let mut session = open();
        let handle = session.allocate(16).unwrap();
        let err = session.copy_to_device(&handle, &[0u8; 8]).unwrap_err();
        assert_eq!(
            err,
            DeviceError::SizeMismatch {
                destination: 16,
                source_len: 8
            }
        );
        let mut short = [0u8; 4];
        assert!(matches!(
            session.copy_to_host(&mut short, &handle),
            Err(DeviceError::SizeMismatch { .. })
        ));
        assert!(session.zero(&handle, 32).is_err());
        session.copy_to_device(&handle, &[1u8; 16]).expect("session still usable");
    }

    #[test]
    fn handles_from_other_sessions_are_rejected() {
        let mut first = open();
        let mut second = open();
        let foreign = first.allocate(16).unwrap();
        let err = second.copy_to_device(&foreign, &[0u8; 16]).unwrap_err();
        assert!(matches!(err, DeviceError::ForeignBuffer { .. }));
    }

    #[test]
    fn exhausting_device_memory_reports_out_of_memory() {
        let config = ManycoreConfig {
            dram_bytes: 64,
            ..ManycoreConfig::default()
        };
        let mut session =
            DeviceSession::open(SimulatedManycore::new(config), &DeviceIdentity::default()).unwrap();
        session.allocate(48).unwrap();
        let err = session.allocate(32).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfDeviceMemory { requested: 32, .. }));
    }

    #[test]
    fn f32_helpers_round_trip() {
        let mut session = open();
        let values = [1.5f32, -2.25, 0.0, f32::MAX];
        let handle = session.allocate(16).unwrap();
        session.write_f32s(&handle, &values).unwrap();
        assert_eq!(session.read_f32s(&handle).unwrap(), values);
    }

    proptest! {
        #[test]
        fn arbitrary_bytes_round_trip(src in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut session = open();
            let handle = session.allocate(src.len()).unwrap();
            session.copy_to_device(&handle, &src).unwrap();
            let mut dst = vec![0u8; src.len()];
            session.copy_to_host(&mut dst, &handle).unwrap();
            prop_assert_eq!(dst, src);
        }
    }
}
