//! Throughput benchmark
//!
//! Synthetic prompt-processing (pp) and text-generation (tg) passes over the
//! loaded context, repeated `nr` times. Reports mean ± sample standard
//! deviation in tokens per second as a markdown table.

use std::fmt;
use std::time::Instant;

use crate::inference::backend::{InferenceBackend, ModelSummary, Token};
use crate::inference::batch::TokenBatch;
use crate::inference::InferenceError;

/// Benchmark shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchParams {
    /// Prompt tokens per prefill pass
    pub pp: usize,
    /// Generation steps per pass
    pub tg: usize,
    /// Parallel sequences per generation step
    pub pl: usize,
    /// Repetitions
    pub nr: usize,
}

impl Default for BenchParams {
    fn default() -> Self {
        Self {
            pp: 512,
            tg: 128,
            pl: 1,
            nr: 3,
        }
    }
}

/// Mean and spread of the measured speeds
#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub params: BenchParams,
    pub model: ModelSummary,
    pub backend: String,
    pub pp_avg: f64,
    pub pp_std: f64,
    pub tg_avg: f64,
    pub tg_std: f64,
    /// Runs left out of the averages because a decode failed
    pub failed_runs: usize,
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size_gib = self.model.size_bytes as f64 / 1024.0 / 1024.0 / 1024.0;
        let params_b = self.model.param_count as f64 / 1e9;
        let prefix = format!(
            "| {} | {:.2}GiB | {:.2}B | {} |",
            self.model.description, size_gib, params_b, self.backend
        );

        writeln!(f, "| model | size | params | backend | test | t/s |")?;
        writeln!(f, "| --- | --- | --- | --- | --- | --- |")?;
        writeln!(
            f,
            "{} pp {} | {:.2} ± {:.2} |",
            prefix, self.params.pp, self.pp_avg, self.pp_std
        )?;
        writeln!(
            f,
            "{} tg {} | {:.2} ± {:.2} |",
            prefix, self.params.tg, self.tg_avg, self.tg_std
        )?;
        if self.failed_runs > 0 {
            writeln!(
                f,
                "\n{} of {} runs failed and are not included",
                self.failed_runs, self.params.nr
            )?;
        }
        Ok(())
    }
}

/// Speeds of the runs that completed
#[derive(Debug, Default)]
struct SpeedStats {
    samples: Vec<f64>,
}

impl SpeedStats {
    fn push(&mut self, speed: f64) {
        self.samples.push(speed);
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().sum::<f64>() / self.samples.len() as f64
        }
    }

    /// Sample standard deviation, from deviations about the mean
    fn std_dev(&self) -> f64 {
        let n = self.samples.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq: f64 = self.samples.iter().map(|s| (s - mean) * (s - mean)).sum();
        (sum_sq / (n - 1) as f64).sqrt()
    }
}

fn seconds_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64().max(f64::EPSILON)
}

/// Runs the benchmark on an already loaded context.
///
/// A run whose decode fails is logged and left out of the averages, and
/// counted in [`BenchReport::failed_runs`]. If every run fails the last
/// decode error is returned. Shape errors (zero sizes, more tokens than the
/// batch holds, more sequences than the context tracks) are returned before
/// anything runs.
pub(crate) fn run<B: InferenceBackend>(
    backend: &B,
    context: &mut B::Context,
    batch: &mut TokenBatch,
    model: &ModelSummary,
    params: &BenchParams,
) -> Result<BenchReport, InferenceError> {
    if params.pp == 0 || params.pl == 0 || params.nr == 0 {
        return Err(InferenceError::invalid_state(
            "benchmark",
            format!("given an empty shape {params:?}"),
        ));
    }
    if params.pp > batch.capacity() || params.pl > batch.capacity() {
        return Err(InferenceError::CapacityExceeded {
            capacity: batch.capacity(),
        });
    }
    if params.pl > batch.n_seq_max() {
        return Err(InferenceError::TooManySequences {
            max: batch.n_seq_max(),
            got: params.pl,
        });
    }

    tracing::info!("n_ctx = {}", backend.context_size(context));

    let mut pp_stats = SpeedStats::default();
    let mut tg_stats = SpeedStats::default();
    let mut failed_runs = 0;
    let mut last_error = None;

    for rep in 0..params.nr {
        let result = run_once(backend, context, batch, params, rep);
        backend.clear_memory(context, false);

        match result {
            Ok((speed_pp, speed_tg)) => {
                pp_stats.push(speed_pp);
                tg_stats.push(speed_tg);
                tracing::info!("pp {:.2} t/s, tg {:.2} t/s", speed_pp, speed_tg);
            }
            Err(e) => {
                tracing::warn!("Benchmark run {} failed, not counted: {}", rep + 1, e);
                failed_runs += 1;
                last_error = Some(e);
            }
        }
    }

    if failed_runs == params.nr {
        if let Some(e) = last_error {
            return Err(e);
        }
    }

    Ok(BenchReport {
        params: *params,
        model: model.clone(),
        backend: backend.backend_name().to_string(),
        pp_avg: pp_stats.mean(),
        pp_std: pp_stats.std_dev(),
        tg_avg: tg_stats.mean(),
        tg_std: tg_stats.std_dev(),
        failed_runs,
    })
}

/// One pp pass and one tg pass; returns both speeds in tokens per second.
fn run_once<B: InferenceBackend>(
    backend: &B,
    context: &mut B::Context,
    batch: &mut TokenBatch,
    params: &BenchParams,
    rep: usize,
) -> Result<(f64, f64), InferenceError> {
    tracing::info!("Benchmark prompt processing (pp), run {}", rep + 1);

    batch.clear();
    for i in 0..params.pp {
        batch.add(Token(0), i as i32, &[0], false)?;
    }
    batch.set_logits(params.pp - 1, true)?;
    backend.clear_memory(context, false);

    let t_pp = Instant::now();
    batch.submit(backend, context)?;
    let pp_secs = seconds_since(t_pp);

    tracing::info!("Benchmark text generation (tg), run {}", rep + 1);

    backend.clear_memory(context, false);
    let t_tg = Instant::now();
    for i in 0..params.tg {
        batch.clear();
        for j in 0..params.pl {
            batch.add(Token(0), i as i32, &[j as i32], true)?;
        }
        tracing::debug!("decode text generation: {}", i);
        batch.submit(backend, context)?;
    }
    let tg_secs = seconds_since(t_tg);

    Ok((
        params.pp as f64 / pp_secs,
        (params.pl * params.tg) as f64 / tg_secs,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::ScriptedBackend;
    use crate::inference::session::{Session, SessionOptions};

    #[test]
    fn test_speed_stats() {
        let mut stats = SpeedStats::default();
        assert_eq!(stats.mean(), 0.0);
        stats.push(10.0);
        assert_eq!(stats.std_dev(), 0.0);
        stats.push(20.0);
        stats.push(30.0);
        assert!((stats.mean() - 20.0).abs() < 1e-9);
        assert!((stats.std_dev() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_constant_speed_has_zero_spread() {
        let mut stats = SpeedStats::default();
        for _ in 0..5 {
            stats.push(123.456);
        }
        assert!(stats.std_dev() < 1e-6);
    }

    #[test]
    fn test_benchmark_on_session() {
        let mut session = Session::new(ScriptedBackend::new(vec![]), SessionOptions::default());
        session.load("qwen.gguf").unwrap();

        let params = BenchParams {
            pp: 32,
            tg: 4,
            pl: 1,
            nr: 2,
        };
        let report = session.benchmark(&params).unwrap();
        assert!(report.pp_avg > 0.0);
        assert!(report.tg_avg > 0.0);
        assert_eq!(report.backend, "mock");

        let table = report.to_string();
        assert!(table.starts_with("| model | size | params | backend | test | t/s |"));
        assert!(table.contains("| pp 32 |"));
        assert!(table.contains("| tg 4 |"));
        assert!(table.contains("mock 1M"));
    }

    #[test]
    fn test_benchmark_rejects_oversized_prompt() {
        let mut session = Session::new(ScriptedBackend::new(vec![]), SessionOptions::default());
        session.load("qwen.gguf").unwrap();
        let params = BenchParams {
            pp: 4096,
            ..BenchParams::default()
        };
        assert_eq!(
            session.benchmark(&params),
            Err(InferenceError::CapacityExceeded { capacity: 512 })
        );
    }

    #[test]
    fn test_benchmark_requires_loaded_session() {
        let mut session = Session::new(ScriptedBackend::new(vec![]), SessionOptions::default());
        assert!(matches!(
            session.benchmark(&BenchParams::default()),
            Err(InferenceError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_failed_run_left_out() {
        let mut backend = ScriptedBackend::new(vec![]);
        // Decode call 1 is the first run's pp pass
        backend.fail_decode_at = Some(1);
        let mut session = Session::new(backend, SessionOptions::default());
        session.load("qwen.gguf").unwrap();

        let params = BenchParams {
            pp: 8,
            tg: 2,
            pl: 1,
            nr: 2,
        };
        let report = session.benchmark(&params).unwrap();
        assert_eq!(report.failed_runs, 1);
        assert!(report.pp_avg > 0.0);
        assert_eq!(report.pp_std, 0.0);
        assert!(report.to_string().contains("1 of 2 runs failed"));
    }

    #[test]
    fn test_every_run_failing_is_an_error() {
        let mut backend = ScriptedBackend::new(vec![]);
        backend.fail_decode_at = Some(1);
        let mut session = Session::new(backend, SessionOptions::default());
        session.load("qwen.gguf").unwrap();

        let params = BenchParams {
            pp: 8,
            tg: 2,
            pl: 1,
            nr: 1,
        };
        assert!(matches!(
            session.benchmark(&params),
            Err(InferenceError::DecodeFailed(_))
        ));
    }

    #[test]
    fn test_parallel_sequences_need_room() {
        let mut session = Session::new(ScriptedBackend::new(vec![]), SessionOptions::default());
        session.load("qwen.gguf").unwrap();
        let params = BenchParams {
            pp: 8,
            tg: 2,
            pl: 2,
            nr: 1,
        };
        assert_eq!(
            session.benchmark(&params),
            Err(InferenceError::TooManySequences { max: 1, got: 2 })
        );

        let mut options = SessionOptions::default();
        options.context.max_sequences = 2;
        let mut wide = Session::new(ScriptedBackend::new(vec![]), options);
        wide.load("qwen.gguf").unwrap();
        let report = wide.benchmark(&params).unwrap();
        assert_eq!(report.failed_runs, 0);
    }
}
