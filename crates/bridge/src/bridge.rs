//! Host-application boundary for matmul offload.
//!
//! One offload opens a device session, loads the matmul program, moves the
//! operands, launches, reads the product back and closes the session. Every
//! failure is reported with the stage it happened in and a stable negative
//! code, and the session is closed exactly once whatever the outcome.

use crate::config::BridgeConfig;
use manycore_backend::{
    BackendCall, BufferHandle, DeviceBackend, DeviceError, DeviceSession, FaultPoint,
    LaunchDescriptor, MatmulLaunchPlan, SimulatedManycore,
};
use manycore_kernels::config::{MatmulProblem, MatmulVariant};
use manycore_kernels::matmul::naive_matmul;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::{info, warn};

/// Code reported for malformed operands, before any device work.
pub const INVALID_INPUT_CODE: i32 = -1;

/// Offload step that failed, each with its own code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BridgeStage {
    OpenDevice,
    LoadProgram,
    AllocateLhs,
    AllocateRhs,
    AllocateOut,
    CopyLhs,
    CopyRhs,
    ZeroOut,
    Enqueue,
    Execute,
    CopyResult,
    CloseSession,
}

impl BridgeStage {
    pub const ALL: [BridgeStage; 12] = [
        BridgeStage::OpenDevice,
        BridgeStage::LoadProgram,
        BridgeStage::AllocateLhs,
        BridgeStage::AllocateRhs,
        BridgeStage::AllocateOut,
        BridgeStage::CopyLhs,
        BridgeStage::CopyRhs,
        BridgeStage::ZeroOut,
        BridgeStage::Enqueue,
        BridgeStage::Execute,
        BridgeStage::CopyResult,
        BridgeStage::CloseSession,
    ];

    pub fn code(&self) -> i32 {
        match self {
            BridgeStage::OpenDevice => -2,
            BridgeStage::LoadProgram => -3,
            BridgeStage::AllocateLhs => -4,
            BridgeStage::AllocateRhs => -5,
            BridgeStage::AllocateOut => -6,
            BridgeStage::CopyLhs => -7,
            BridgeStage::CopyRhs => -8,
            BridgeStage::ZeroOut => -9,
            BridgeStage::Enqueue => -10,
            BridgeStage::Execute => -11,
            BridgeStage::CopyResult => -12,
            BridgeStage::CloseSession => -13,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BridgeStage::OpenDevice => "open-device",
            BridgeStage::LoadProgram => "load-program",
            BridgeStage::AllocateLhs => "allocate-lhs",
            BridgeStage::AllocateRhs => "allocate-rhs",
            BridgeStage::AllocateOut => "allocate-out",
            BridgeStage::CopyLhs => "copy-lhs",
            BridgeStage::CopyRhs => "copy-rhs",
            BridgeStage::ZeroOut => "zero-out",
            BridgeStage::Enqueue => "enqueue",
            BridgeStage::Execute => "execute",
            BridgeStage::CopyResult => "copy-result",
            BridgeStage::CloseSession => "close-session",
        }
    }

    /// The backend call whose failure surfaces at this stage of an offload.
    pub fn fault_point(&self) -> FaultPoint {
        match self {
            BridgeStage::OpenDevice => FaultPoint::first(BackendCall::Init),
            BridgeStage::LoadProgram => FaultPoint::first(BackendCall::LoadProgram),
            BridgeStage::AllocateLhs => FaultPoint::nth(BackendCall::Malloc, 1),
            BridgeStage::AllocateRhs => FaultPoint::nth(BackendCall::Malloc, 2),
            BridgeStage::AllocateOut => FaultPoint::nth(BackendCall::Malloc, 3),
            BridgeStage::CopyLhs => FaultPoint::nth(BackendCall::CopyToDevice, 1),
            BridgeStage::CopyRhs => FaultPoint::nth(BackendCall::CopyToDevice, 2),
            BridgeStage::ZeroOut => FaultPoint::first(BackendCall::Memset),
            BridgeStage::Enqueue => FaultPoint::first(BackendCall::Enqueue),
            BridgeStage::Execute => FaultPoint::first(BackendCall::ExecutePending),
            BridgeStage::CopyResult => FaultPoint::first(BackendCall::CopyToHost),
            BridgeStage::CloseSession => FaultPoint::first(BackendCall::Finish),
        }
    }
}

impl fmt::Display for BridgeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BridgeStage {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        BridgeStage::ALL
            .into_iter()
            .find(|stage| stage.name() == value)
            .ok_or_else(|| {
                let known: Vec<_> = BridgeStage::ALL.iter().map(BridgeStage::name).collect();
                format!("unknown stage `{value}` (expected one of: {})", known.join(", "))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{stage} failed: {source}")]
    Device {
        stage: BridgeStage,
        source: DeviceError,
        /// Close failure that followed the original failure, if any.
        close_error: Option<DeviceError>,
    },
}

impl BridgeError {
    fn at(stage: BridgeStage) -> impl FnOnce(DeviceError) -> BridgeError {
        move |source| BridgeError::Device {
            stage,
            source,
            close_error: None,
        }
    }

    /// Negative, stage-identified status code.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::InvalidInput(_) => INVALID_INPUT_CODE,
            BridgeError::Device { stage, .. } => stage.code(),
        }
    }

    pub fn stage(&self) -> Option<BridgeStage> {
        match self {
            BridgeError::InvalidInput(_) => None,
            BridgeError::Device { stage, .. } => Some(*stage),
        }
    }

    pub fn close_error(&self) -> Option<&DeviceError> {
        match self {
            BridgeError::InvalidInput(_) => None,
            BridgeError::Device { close_error, .. } => close_error.as_ref(),
        }
    }
}

/// `0` on success, the stage code otherwise.
pub fn status_code<T>(result: &Result<T, BridgeError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.code(),
    }
}

/// Which path produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "kebab-case")]
pub enum ExecutionPath {
    Device,
    /// The offload failed with `code` and the host computed the product.
    CpuFallback { code: i32 },
}

impl fmt::Display for ExecutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionPath::Device => write!(f, "device"),
            ExecutionPath::CpuFallback { code } => write!(f, "cpu-fallback (code {code})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffloadOutcome {
    pub output: Vec<f32>,
    pub path: ExecutionPath,
    pub elapsed_ms: f64,
}

pub type SimulatorFactory = fn(&BridgeConfig) -> SimulatedManycore;

/// Backend for the simulated device described by the bridge config.
pub fn simulated_backend(config: &BridgeConfig) -> SimulatedManycore {
    SimulatedManycore::new(config.simulator.clone())
}

/// Runs matmuls on a device backend built fresh for every offload.
pub struct MatrixBridge<F> {
    config: BridgeConfig,
    factory: F,
}

impl MatrixBridge<SimulatorFactory> {
    pub fn simulated(config: BridgeConfig) -> Self {
        Self::new(config, simulated_backend)
    }
}

impl<F, B> MatrixBridge<F>
where
    F: Fn(&BridgeConfig) -> B,
    B: DeviceBackend,
{
    pub fn new(config: BridgeConfig, factory: F) -> Self {
        Self { config, factory }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// `lhs (m x k) * rhs (k x n)` on the device, with the configured variant.
    pub fn multiply(&self, problem: MatmulProblem, lhs: &[f32], rhs: &[f32]) -> Result<Vec<f32>, BridgeError> {
        self.multiply_as(self.config.variant, problem, lhs, rhs)
    }

    pub fn multiply_as(
        &self,
        variant: MatmulVariant,
        problem: MatmulProblem,
        lhs: &[f32],
        rhs: &[f32],
    ) -> Result<Vec<f32>, BridgeError> {
        check_operands(&problem, lhs, rhs)?;
        let plan = self
            .config
            .planner
            .plan_matmul(variant, problem)
            .map_err(|err| BridgeError::InvalidInput(format!("{err:#}")))?;

        let mut session = DeviceSession::open((self.factory)(&self.config), &self.config.device)
            .map_err(BridgeError::at(BridgeStage::OpenDevice))?;
        let outcome = self.offload(&mut session, &plan, lhs, rhs);
        let closed = session.close();

        match (outcome, closed) {
            (Ok(output), Ok(())) => Ok(output),
            (Ok(_), Err(close)) => Err(BridgeError::at(BridgeStage::CloseSession)(close)),
            (Err(BridgeError::Device { stage, source, .. }), closed) => Err(BridgeError::Device {
                stage,
                source,
                close_error: closed.err(),
            }),
            (Err(err), Err(close)) => {
                warn!(error = %err, close_error = %close, "session close failed after offload error");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
        }
    }

    /// 4x4 row-major product.
    pub fn multiply_4x4(&self, lhs: &[f32; 16], rhs: &[f32; 16]) -> Result<[f32; 16], BridgeError> {
        let output = self.multiply(MatmulProblem::square(4), lhs, rhs)?;
        let mut product = [0.0f32; 16];
        product.copy_from_slice(&output);
        Ok(product)
    }

    /// Tries the device and falls back to the host on any device failure.
    /// Malformed operands are still an error.
    pub fn multiply_or_fallback(
        &self,
        problem: MatmulProblem,
        lhs: &[f32],
        rhs: &[f32],
    ) -> Result<OffloadOutcome, BridgeError> {
        let start = Instant::now();
        match self.multiply(problem, lhs, rhs) {
            Ok(output) => Ok(OffloadOutcome {
                output,
                path: ExecutionPath::Device,
                elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
            }),
            Err(err @ BridgeError::InvalidInput(_)) => Err(err),
            Err(err) => {
                let code = err.code();
                warn!(code, error = %err, "device offload failed, computing on the host");
                let output = naive_matmul(&problem, lhs, rhs)
                    .map_err(|err| BridgeError::InvalidInput(format!("{err:#}")))?;
                Ok(OffloadOutcome {
                    output,
                    path: ExecutionPath::CpuFallback { code },
                    elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
                })
            }
        }
    }

    fn offload(
        &self,
        session: &mut DeviceSession<B>,
        plan: &MatmulLaunchPlan,
        lhs: &[f32],
        rhs: &[f32],
    ) -> Result<Vec<f32>, BridgeError> {
        let binary = self.config.resolved_binary();
        session
            .load_program(&binary, &self.config.allocator)
            .map_err(BridgeError::at(BridgeStage::LoadProgram))?;

        let bytes = |elements: usize| elements * std::mem::size_of::<f32>();
        let a = session
            .allocate(bytes(lhs.len()))
            .map_err(BridgeError::at(BridgeStage::AllocateLhs))?;
        let b = session
            .allocate(bytes(rhs.len()))
            .map_err(BridgeError::at(BridgeStage::AllocateRhs))?;
        let c = session
            .allocate(bytes(plan.problem.out_len()))
            .map_err(BridgeError::at(BridgeStage::AllocateOut))?;

        session
            .write_f32s(&a, lhs)
            .map_err(BridgeError::at(BridgeStage::CopyLhs))?;
        session
            .write_f32s(&b, rhs)
            .map_err(BridgeError::at(BridgeStage::CopyRhs))?;
        session
            .zero(&c, c.len())
            .map_err(BridgeError::at(BridgeStage::ZeroOut))?;

        let launch = launch_descriptor(plan, &a, &b, &c)?;
        session
            .enqueue(&launch)
            .map_err(BridgeError::at(BridgeStage::Enqueue))?;
        session
            .execute_pending()
            .map_err(BridgeError::at(BridgeStage::Execute))?;

        let output = session
            .read_f32s(&c)
            .map_err(BridgeError::at(BridgeStage::CopyResult))?;
        info!(
            session = %session.id(),
            variant = %plan.variant,
            m = plan.problem.m,
            n = plan.problem.n,
            k = plan.problem.k,
            grid = %plan.grid,
            tile_group = %plan.tile_group,
            footprint_bytes = plan.problem.data_footprint_bytes(),
            "matmul offload completed"
        );
        Ok(output)
    }
}

/// 4x4 row-major product on the simulated device, configured from the
/// environment.
pub fn matrix_multiply_4x4(lhs: &[f32; 16], rhs: &[f32; 16]) -> Result<[f32; 16], BridgeError> {
    MatrixBridge::simulated(BridgeConfig::from_env()).multiply_4x4(lhs, rhs)
}

/// Argument words that cannot be marshaled fail the launch at the enqueue stage.
fn launch_descriptor(
    plan: &MatmulLaunchPlan,
    lhs: &BufferHandle,
    rhs: &BufferHandle,
    out: &BufferHandle,
) -> Result<LaunchDescriptor, BridgeError> {
    plan.descriptor(lhs, rhs, out)
        .map_err(|err| DeviceError::EnqueueFailed(format!("{err:#}")))
        .map_err(BridgeError::at(BridgeStage::Enqueue))
}

fn check_operands(problem: &MatmulProblem, lhs: &[f32], rhs: &[f32]) -> Result<(), BridgeError> {
    if lhs.len() != problem.lhs_len() {
        return Err(BridgeError::InvalidInput(format!(
            "lhs holds {} elements, a {}x{} matrix needs {}",
            lhs.len(),
            problem.m,
            problem.k,
            problem.lhs_len()
        )));
    }
    if rhs.len() != problem.rhs_len() {
        return Err(BridgeError::InvalidInput(format!(
            "rhs holds {} elements, a {}x{} matrix needs {}",
            rhs.len(),
            problem.k,
            problem.n,
            problem.rhs_len()
        )));
    }
    Ok(())
}
