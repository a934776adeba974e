//! MCMC sampling: adaptive random-walk Metropolis over a built model.
//!
//! Chains run in parallel (one rayon worker per chain). During the tuning
//! phase each chain adapts a diagonal proposal scale from the running
//! parameter variance (the `adapt_diag` initialization strategy) and a global
//! step size toward the target acceptance rate; tuning draws are discarded.
//! A proposal whose log-posterior evaluates to NaN is flagged as a divergent
//! transition for that draw.
//!
//! Linear-algebra thread pools are pinned to one thread at process startup
//! ([`limit_blas_threads`]) so that parallel chains do not oversubscribe the
//! machine; sampling itself never touches the environment.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rayon::prelude::*;

use crate::domain::RunConfig;
use crate::error::AppError;
use crate::logging::RunLog;
use crate::model::BuiltModel;

pub mod trace;

pub use trace::{SampleArray, Trace};

/// Tuning parameters for one sampling call.
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub draws: usize,
    pub tune: usize,
    pub chains: usize,
    pub cores: usize,
    /// Recorded for the run record; the random-walk engine has no tree to
    /// expand, so this caps nothing here.
    pub max_treedepth: usize,
    pub target_accept: f64,
    pub init: &'static str,
    pub seed: u64,
    pub progress: bool,
}

impl SamplerSettings {
    /// Fixed/overridable tuning parameters for a configured run:
    /// tune = min(500, draws), cores = chains, tree depth 14, adapt_diag init.
    pub fn for_run(cfg: &RunConfig) -> SamplerSettings {
        SamplerSettings {
            draws: cfg.n_samples,
            tune: cfg.n_samples.min(500),
            chains: cfg.n_chains,
            cores: cfg.n_chains,
            max_treedepth: 14,
            target_accept: cfg.target_accept,
            init: "adapt_diag",
            seed: cfg.seed,
            progress: cfg.force_progress || std::io::IsTerminal::is_terminal(&std::io::stdout()),
        }
    }
}

/// Pin the BLAS/OpenMP thread pools to a single thread.
///
/// Parallelism comes from running one chain per process worker; without this
/// cap each chain would additionally fan out its linear algebra. Must run on
/// the startup path before any other thread exists; the environment is never
/// touched again afterwards.
pub fn limit_blas_threads() {
    static PIN: std::sync::Once = std::sync::Once::new();
    PIN.call_once(|| {
        for var in ["OMP_NUM_THREADS", "MKL_NUM_THREADS", "OPENBLAS_NUM_THREADS"] {
            // SAFETY: runs once, on the single-threaded startup path, before
            // any sampling workers exist.
            unsafe { std::env::set_var(var, "1") };
        }
    });
}

struct ChainOutput {
    draws: Vec<f64>,
    diverging: Vec<bool>,
    accepted: usize,
}

/// Run the sampler and assemble the posterior trace.
///
/// Any chain failure (e.g. no finite starting point) is fatal and propagates;
/// there are no retries.
pub fn sample(
    model: &BuiltModel,
    settings: &SamplerSettings,
    log: &RunLog,
) -> Result<Trace, AppError> {
    if settings.draws == 0 || settings.chains == 0 {
        return Err(AppError::config(
            "Sampling requires at least one draw and one chain",
        ));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.cores.max(1))
        .build()
        .map_err(|e| AppError::model(format!("Failed to build sampling thread pool: {e}")))?;

    let outputs: Vec<ChainOutput> = pool.install(|| {
        (0..settings.chains)
            .into_par_iter()
            .map(|chain| run_chain(model, settings, chain, log))
            .collect::<Result<Vec<_>, AppError>>()
    })?;

    for (chain, out) in outputs.iter().enumerate() {
        let total = settings.tune + settings.draws;
        log.line(format!(
            "chain {chain}: {} draws, acceptance {:.2}, {} divergent",
            settings.draws,
            out.accepted as f64 / total as f64,
            out.diverging.iter().filter(|d| **d).count(),
        ));
    }

    Ok(assemble_trace(model, settings, outputs))
}

fn run_chain(
    model: &BuiltModel,
    settings: &SamplerSettings,
    chain: usize,
    log: &RunLog,
) -> Result<ChainOutput, AppError> {
    let mut rng = StdRng::seed_from_u64(settings.seed.wrapping_add(chain as u64));

    // Find a finite starting point; a model whose posterior is nowhere finite
    // near the prior means cannot be sampled.
    let mut theta = model.initial_point(&mut rng);
    let mut lp = model.log_posterior(&theta);
    let mut attempts = 0;
    while !lp.is_finite() {
        attempts += 1;
        if attempts > 100 {
            return Err(AppError::model(format!(
                "Bad initial energy in chain {chain}: log-posterior not finite at any starting point"
            )));
        }
        theta = model.initial_point(&mut rng);
        lp = model.log_posterior(&theta);
    }

    let dim = model.dim;
    let mut log_step = (2.38 / (dim as f64).sqrt()).ln();
    let mut scale = vec![0.1; dim];
    // Welford accumulators for the diagonal proposal-variance adaptation.
    let mut mean = theta.clone();
    let mut m2 = vec![0.0; dim];

    let total = settings.tune + settings.draws;
    let report_every = (total / 4).max(1);
    let mut draws = Vec::with_capacity(settings.draws * dim);
    let mut diverging = Vec::with_capacity(settings.draws);
    let mut accepted = 0usize;
    let mut proposal = vec![0.0; dim];

    for step in 0..total {
        let tuning = step < settings.tune;
        let step_size = log_step.exp();
        for i in 0..dim {
            let z: f64 = StandardNormal.sample(&mut rng);
            proposal[i] = theta[i] + step_size * scale[i] * z;
        }
        let lp_new = model.log_posterior(&proposal);
        let divergent = lp_new.is_nan();

        let accept_prob = if divergent {
            0.0
        } else {
            (lp_new - lp).exp().min(1.0)
        };
        if !divergent && rng.gen_range(0.0..1.0) < accept_prob {
            theta.copy_from_slice(&proposal);
            lp = lp_new;
            accepted += 1;
        }

        if tuning {
            // Robbins-Monro step-size adaptation toward the target acceptance.
            let gamma = 0.1 / (1.0 + step as f64 / 50.0);
            log_step += gamma * (accept_prob - settings.target_accept);

            let n = (step + 1) as f64;
            for i in 0..dim {
                let delta = theta[i] - mean[i];
                mean[i] += delta / n;
                m2[i] += delta * (theta[i] - mean[i]);
            }
            // Switch to the estimated diagonal scale once the variance
            // estimate has seen enough of the chain.
            if step + 1 == settings.tune.max(2) / 2 || step + 1 == settings.tune {
                for i in 0..dim {
                    let var = m2[i] / n;
                    scale[i] = var.sqrt().max(1e-6);
                }
            }
        } else {
            draws.extend_from_slice(&theta);
            diverging.push(divergent);
        }

        if settings.progress && (step + 1) % report_every == 0 {
            log.line(format!(
                "chain {chain}: {}/{} [{}]",
                step + 1,
                total,
                if tuning { "tune" } else { "sample" },
            ));
        }
    }

    Ok(ChainOutput {
        draws,
        diverging,
        accepted,
    })
}

/// Collect per-chain draws into named arrays and attach derived variables
/// (`CMReduction`, `MeanRegionR`).
fn assemble_trace(model: &BuiltModel, settings: &SamplerSettings, outputs: Vec<ChainOutput>) -> Trace {
    let chains = outputs.len();
    let draws = settings.draws;
    let mut trace = Trace {
        chains,
        draws,
        vars: indexmap::IndexMap::new(),
        diverging: outputs.iter().flat_map(|o| o.diverging.clone()).collect(),
    };

    for block in &model.blocks {
        let mut dims = vec!["chain".to_string(), "draw".to_string()];
        let mut shape = vec![chains, draws];
        for (name, len) in &block.dims {
            dims.push(name.clone());
            shape.push(*len);
        }
        let mut values = Vec::with_capacity(chains * draws * block.size);
        for out in &outputs {
            for draw in 0..draws {
                let start = draw * model.dim + block.offset;
                values.extend_from_slice(&out.draws[start..start + block.size]);
            }
        }
        trace
            .vars
            .insert(block.name.clone(), SampleArray::new(dims, shape, values));
    }

    if let Some(alpha) = trace.var("CM_Alpha") {
        let reduction = SampleArray::new(
            alpha.dims.clone(),
            alpha.shape.clone(),
            alpha.values.iter().map(|a| (-a).exp()).collect(),
        );
        trace.vars.insert("CMReduction".to_string(), reduction);
    }
    if let Some(region_r) = trace.var("RegionR") {
        let n = region_r.entity_len();
        let mut values = Vec::with_capacity(chains * draws);
        for c in 0..chains {
            for d in 0..draws {
                let mean: f64 = (0..n).map(|k| region_r.at(c, d, k)).sum::<f64>() / n as f64;
                values.push(mean);
            }
        }
        trace.vars.insert(
            "MeanRegionR".to_string(),
            SampleArray::new(
                vec!["chain".to_string(), "draw".to_string()],
                vec![chains, draws],
                values,
            ),
        );
    }

    trace
}
