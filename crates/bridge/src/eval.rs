//! Offload evaluation: host vs device comparison reports and a small suite of
//! deterministic cases, emitted as reproducible JSON.

use crate::bridge::{BridgeError, ExecutionPath, MatrixBridge};
use crate::config::BridgeConfig;
use anyhow::{ensure, Context, Result};
use manycore_backend::DeviceBackend;
use manycore_kernels::config::{MatmulProblem, MatmulVariant};
use manycore_kernels::matmul::naive_matmul;
use manycore_kernels::utils::max_abs_error;
use ndarray::ArrayView2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Largest absolute difference from the host result that still passes.
pub const PASS_TOLERANCE: f64 = 1e-4;

/// Host vs device run of one matmul.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub problem: MatmulProblem,
    pub variant: MatmulVariant,
    pub path: ExecutionPath,
    pub lhs: Vec<f32>,
    pub rhs: Vec<f32>,
    pub cpu_result: Vec<f32>,
    pub device_result: Vec<f32>,
    pub cpu_ms: f64,
    pub device_ms: f64,
    pub cpu_gflops: f64,
    pub device_gflops: f64,
    pub max_abs_error: f64,
    pub passed: bool,
}

impl ComparisonReport {
    /// Human-readable rendering: operands, both results, error and timings.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let MatmulProblem { m, n, k } = self.problem;
        let _ = writeln!(out, "Matrix A ({m}x{k}):");
        write_matrix(&mut out, &self.lhs, m, k);
        let _ = writeln!(out, "Matrix B ({k}x{n}):");
        write_matrix(&mut out, &self.rhs, k, n);
        let _ = writeln!(out, "CPU result:");
        write_matrix(&mut out, &self.cpu_result, m, n);
        let _ = writeln!(out, "Device result ({}, {}):", self.variant, self.path);
        write_matrix(&mut out, &self.device_result, m, n);
        let _ = writeln!(
            out,
            "CPU time: {:.3} ms ({:.6} GFLOP/s)",
            self.cpu_ms, self.cpu_gflops
        );
        let _ = writeln!(
            out,
            "Device time: {:.3} ms ({:.6} GFLOP/s)",
            self.device_ms, self.device_gflops
        );
        let _ = writeln!(out, "Max abs error: {:.3e}", self.max_abs_error);
        let _ = writeln!(out, "{}", if self.passed { "PASS" } else { "FAIL" });
        out
    }
}

/// Runs `lhs * rhs` on the host and through `bridge`, falling back to the
/// host when the device fails.
pub fn compare<F, B>(
    bridge: &MatrixBridge<F>,
    problem: MatmulProblem,
    lhs: &[f32],
    rhs: &[f32],
) -> Result<ComparisonReport, BridgeError>
where
    F: Fn(&BridgeConfig) -> B,
    B: DeviceBackend,
{
    let (cpu_time, cpu_result) = timed(|| {
        naive_matmul(&problem, lhs, rhs).map_err(|err| BridgeError::InvalidInput(format!("{err:#}")))
    })?;
    let outcome = bridge.multiply_or_fallback(problem, lhs, rhs)?;
    let cpu_ms = cpu_time.as_secs_f64() * 1000.0;
    let max_abs_error = max_abs_error(&cpu_result, &outcome.output);

    Ok(ComparisonReport {
        problem,
        variant: bridge.config().variant,
        path: outcome.path,
        lhs: lhs.to_vec(),
        rhs: rhs.to_vec(),
        cpu_ms,
        device_ms: outcome.elapsed_ms,
        cpu_gflops: gflops(&problem, cpu_ms),
        device_gflops: gflops(&problem, outcome.elapsed_ms),
        passed: max_abs_error < PASS_TOLERANCE,
        max_abs_error,
        cpu_result,
        device_result: outcome.output,
    })
}

/// Parses two 4x4 row-major operands, A then B, from whitespace or comma
/// separated text.
pub fn parse_operands(text: &str) -> Result<([f32; 16], [f32; 16])> {
    let values = text
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|token| !token.is_empty())
        .map(|token| {
            token
                .parse::<f32>()
                .with_context(|| format!("`{token}` is not a number"))
        })
        .collect::<Result<Vec<_>>>()?;
    ensure!(
        values.len() == 32,
        "expected 32 values (two 4x4 matrices), got {}",
        values.len()
    );
    let mut lhs = [0.0f32; 16];
    let mut rhs = [0.0f32; 16];
    lhs.copy_from_slice(&values[..16]);
    rhs.copy_from_slice(&values[16..]);
    Ok((lhs, rhs))
}

/// How a suite case fills its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InputPattern {
    /// Identity on the left (square problems only).
    Identity,
    Ramp,
    Negative,
    Deterministic,
}

impl InputPattern {
    fn fill(&self, rows: usize, cols: usize, seed: usize) -> Vec<f32> {
        (0..rows * cols)
            .map(|index| {
                let (row, col) = (index / cols, index % cols);
                match self {
                    InputPattern::Identity => {
                        if row == col {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    InputPattern::Ramp => (index + seed) as f32,
                    InputPattern::Negative => -((index + seed) as f32) * 0.5,
                    InputPattern::Deterministic => {
                        let mixed = ((row * 1313) ^ (col * 7331) ^ (seed * 97)) as f32;
                        1.0 + (mixed % 17.0) / 16.0
                    }
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub name: String,
    pub variant: MatmulVariant,
    pub problem: MatmulProblem,
    pub pattern: InputPattern,
}

impl EvalCase {
    pub fn new(
        name: impl Into<String>,
        variant: MatmulVariant,
        problem: MatmulProblem,
        pattern: InputPattern,
    ) -> Self {
        Self {
            name: name.into(),
            variant,
            problem,
            pattern,
        }
    }

    fn operands(&self) -> (Vec<f32>, Vec<f32>) {
        let MatmulProblem { m, n, k } = self.problem;
        let lhs = self.pattern.fill(m, k, 0);
        let rhs = match self.pattern {
            InputPattern::Identity => InputPattern::Ramp.fill(k, n, 1),
            pattern => pattern.fill(k, n, 7),
        };
        (lhs, rhs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub case: String,
    pub variant: MatmulVariant,
    pub problem: MatmulProblem,
    /// `0` on success, the bridge error code otherwise.
    pub status: i32,
    pub latency_ms: f64,
    pub gflops: f64,
    /// Absent when the case produced no device result.
    pub max_abs_error: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteReport {
    pub generated_at_unix_ms: u128,
    pub cases: Vec<EvalResult>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.cases.iter().all(|case| case.passed)
    }

    pub fn as_map(&self) -> BTreeMap<&str, &EvalResult> {
        self.cases
            .iter()
            .map(|case| (case.case.as_str(), case))
            .collect()
    }

    /// Latency and throughput change per case against an earlier report.
    pub fn diff<'a>(&'a self, baseline: &'a SuiteReport) -> BTreeMap<&'a str, EvalDelta<'a>> {
        let previous = baseline.as_map();
        self.as_map()
            .into_iter()
            .filter_map(|(case, current)| {
                previous.get(case).map(|&baseline| {
                    (
                        case,
                        EvalDelta {
                            current,
                            baseline,
                            latency_ms_delta: current.latency_ms - baseline.latency_ms,
                            gflops_delta: current.gflops - baseline.gflops,
                        },
                    )
                })
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct EvalDelta<'a> {
    pub current: &'a EvalResult,
    pub baseline: &'a EvalResult,
    pub latency_ms_delta: f64,
    pub gflops_delta: f64,
}

pub struct EvaluationSuite {
    cases: Vec<EvalCase>,
}

impl EvaluationSuite {
    pub fn new(cases: Vec<EvalCase>) -> Self {
        Self { cases }
    }

    pub fn cases(&self) -> &[EvalCase] {
        &self.cases
    }

    pub fn offload_smoke() -> Self {
        use InputPattern::*;
        use MatmulVariant::*;
        Self::new(vec![
            EvalCase::new("identity_4x4", LinearIndex, MatmulProblem::square(4), Identity),
            EvalCase::new("ramp_4x4", LinearIndex, MatmulProblem::square(4), Ramp),
            EvalCase::new("negative_4x4", BlockTiled, MatmulProblem::square(4), Negative),
            EvalCase::new("square_16_linear", LinearIndex, MatmulProblem::square(16), Deterministic),
            EvalCase::new("square_16_block", BlockTiled, MatmulProblem::square(16), Deterministic),
            EvalCase::new("rect_24x20x12_block", BlockTiled, MatmulProblem::new(24, 20, 12), Deterministic),
        ])
    }

    /// Runs every case on the device. A failing case is recorded with its
    /// status code instead of aborting the suite.
    pub fn run<F, B>(&self, bridge: &MatrixBridge<F>) -> SuiteReport
    where
        F: Fn(&BridgeConfig) -> B,
        B: DeviceBackend,
    {
        let cases = self.cases.iter().map(|case| run_case(bridge, case)).collect();
        let generated_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0))
            .as_millis();
        SuiteReport {
            generated_at_unix_ms,
            cases,
        }
    }
}

fn run_case<F, B>(bridge: &MatrixBridge<F>, case: &EvalCase) -> EvalResult
where
    F: Fn(&BridgeConfig) -> B,
    B: DeviceBackend,
{
    let (lhs, rhs) = case.operands();
    let start = Instant::now();
    let outcome = bridge.multiply_as(case.variant, case.problem, &lhs, &rhs);
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    let (status, max_abs_error) = match (&outcome, naive_matmul(&case.problem, &lhs, &rhs)) {
        (Ok(output), Ok(expected)) => (0, Some(max_abs_error(&expected, output))),
        (Ok(_), Err(_)) => (0, None),
        (Err(err), _) => (err.code(), None),
    };

    EvalResult {
        case: case.name.clone(),
        variant: case.variant,
        problem: case.problem,
        status,
        latency_ms,
        gflops: gflops(&case.problem, latency_ms),
        max_abs_error,
        passed: status == 0 && max_abs_error.is_some_and(|error| error < PASS_TOLERANCE),
    }
}

fn gflops(problem: &MatmulProblem, latency_ms: f64) -> f64 {
    if latency_ms > 0.0 {
        problem.flops() / (latency_ms * 1.0e6)
    } else {
        0.0
    }
}

fn write_matrix(out: &mut String, values: &[f32], rows: usize, cols: usize) {
    match ArrayView2::from_shape((rows, cols), values) {
        Ok(matrix) => {
            for row in matrix.rows() {
                let line: Vec<String> = row.iter().map(|value| format!("{value:10.4}")).collect();
                let _ = writeln!(out, "  {}", line.join(" "));
            }
        }
        Err(_) => {
            let _ = writeln!(out, "  {values:?}");
        }
    }
}

fn timed<F, T, E>(f: F) -> Result<(Duration, T), E>
where
    F: FnOnce() -> Result<T, E>,
{
    let start = Instant::now();
    let value = f()?;
    Ok((start.elapsed(), value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operands_parse_from_mixed_separators() {
        let text: String = (0..32).map(|i| format!("{i}.5{}", if i % 3 == 0 { "," } else { " " })).collect();
        let (lhs, rhs) = parse_operands(&text).unwrap();
        assert_eq!(lhs[0], 0.5);
        assert_eq!(rhs[15], 31.5);
    }

    #[test]
    fn wrong_operand_count_is_rejected() {
        assert!(parse_operands("1 2 3").is_err());
        assert!(parse_operands(&"1 ".repeat(33)).is_err());
        assert!(parse_operands(&format!("{} x", "1 ".repeat(31))).is_err());
    }

    #[test]
    fn comparison_passes_on_the_simulated_device() {
        let bridge = MatrixBridge::simulated(BridgeConfig::default());
        let lhs: Vec<f32> = (0..16).map(|i| i as f32 * 0.25).collect();
        let rhs: Vec<f32> = (0..16).map(|i| 4.0 - i as f32).collect();
        let report = compare(&bridge, MatmulProblem::square(4), &lhs, &rhs).unwrap();
        assert_eq!(report.path, ExecutionPath::Device);
        assert!(report.passed);
        assert!(report.render().contains("PASS"));
    }

    #[test]
    fn smoke_suite_passes_on_both_variants() {
        let bridge = MatrixBridge::simulated(BridgeConfig::default());
        let report = EvaluationSuite::offload_smoke().run(&bridge);
        assert_eq!(report.cases.len(), 6);
        for case in &report.cases {
            assert_eq!(case.status, 0, "{}", case.case);
            assert!(case.passed, "{} error {:?}", case.case, case.max_abs_error);
        }
        let diff = report.diff(&report);
        assert!(diff.values().all(|delta| delta.latency_ms_delta == 0.0));
    }
}
