//! Two-site finite-system DMRG.
//!
//! A run proceeds through a fixed sequence of phases (see [`Phase`]):
//! 1. **Infinite-system growth**: starting from the fixed boundary tensors, the
//!    chain is filled in from both ends towards the middle at a small bond
//!    dimension, one pair of sites at a time, with the environment blocks
//!    extended incrementally after each step.
//! 2. **First half sweep**: the orthogonality center is moved from the middle
//!    of the chain to the right end and back to the left end, optimizing every
//!    two-site window on the way.
//! 3. **Sweeping**: full left-right sweeps until the first and last energies
//!    of a sweep agree to within a tolerance, or a maximum number of sweeps is
//!    reached.
//! 4. **Final measurement sweep**: one rightward pass that re-splits each
//!    two-site wavefunction as it currently stands (no eigensolver), exposing
//!    the bond spectrum and canonical site tensors at every window for
//!    measurements.
//!
//! Each two-site step builds the effective Hamiltonian from the stored
//! environment blocks, finds its ground state with [`lanczos`], truncates the
//! result with [`truncate`], writes the new site tensors and bond spectrum,
//! and then extends exactly one environment block (two at a turning point).
//!
//! ```ignore
//! use dmrg_chain::{ dmrg::{ DMRG, DMRGConfig }, mpo::TFIM };
//!
//! let config = DMRGConfig { length: 20, chi: 32, ..DMRGConfig::default() };
//! let mut dmrg = DMRG::new(config, TFIM::new(1.0, 1.0))?;
//! let summary = dmrg.run()?;
//! println!("E0 = {}", summary.energy);
//! ```

use ndarray as nd;
use num_complex::Complex64 as C64;
use rand::{ rngs::StdRng, SeedableRng };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tracing::{ debug, info, warn };
use crate::{
    effh::{ EffH, EffHError },
    env::{ EnvError, Environment, Side },
    lanczos::{ lanczos, rayleigh, LanczosConfig, LanczosStatus },
    mpo::{ MPOError, OperatorProvider },
    mps::{ entropy, MPSError, MPS },
    obs::ObsError,
    schedule::{ self, Direction, ScheduleError, Step },
    store::{ StoreConfig, StoreError, StoreUsage, TensorStore },
    tensor::{ flatten, normalize, to_matrix, TensorError },
    truncate::{ truncate, TruncError },
};

#[derive(Debug, Error)]
pub enum DMRGError {
    /// Returned when an operation is attempted out of order.
    #[error("cannot {action} during phase {phase:?}")]
    WrongPhase { action: &'static str, phase: Phase },

    /// Returned when a step is requested on a window that does not touch the
    /// current orthogonality center from the requested side.
    #[error("cannot step at site {site} ({dir}) with the center on bond {center:?}")]
    OffCenter { site: usize, dir: Direction, center: Option<usize> },

    /// Returned when a step is requested on a window outside `1..=L-3`.
    #[error("window at site {site} is outside the sweepable range of a chain of length {length}")]
    BadWindow { site: usize, length: usize },

    /// Wraps any failure inside a two-site step with the step's location.
    #[error("step at site {site} ({dir}) failed: {source}")]
    StepFailed { site: usize, dir: Direction, source: Box<DMRGError> },

    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("MPS error: {0}")]
    MPSError(#[from] MPSError),

    #[error("MPO error: {0}")]
    MPOError(#[from] MPOError),

    #[error("environment error: {0}")]
    EnvError(#[from] EnvError),

    #[error("effective Hamiltonian error: {0}")]
    EffHError(#[from] EffHError),

    #[error("truncation error: {0}")]
    TruncError(#[from] TruncError),

    #[error("schedule error: {0}")]
    ScheduleError(#[from] ScheduleError),

    #[error("tensor error: {0}")]
    TensorError(#[from] TensorError),

    #[error("observable error: {0}")]
    ObsError(#[from] ObsError),
}
use DMRGError::*;
pub type DMRGResult<T> = Result<T, DMRGError>;

/// Start vector used for the eigensolver in each sweep step.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    /// A fresh random vector.
    Random,
    /// The current two-site wavefunction.
    #[default]
    Current,
}

/// Settings for a DMRG run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DMRGConfig {
    /// Number of sites.
    pub length: usize,
    /// Maximum bond dimension during sweeps.
    pub chi: usize,
    /// Maximum bond dimension during infinite-system growth.
    pub growth_chi: usize,
    /// Singular values at or below this are discarded.
    pub cutoff: f64,
    /// Sweeping stops when the first and last energies of a sweep differ by
    /// less than this.
    pub energy_tol: f64,
    /// Maximum number of full sweeps.
    pub max_sweeps: usize,
    /// Start vector for the eigensolver during sweeps.
    pub seed_policy: SeedPolicy,
    /// Seed for the random number generator; drawn from the OS if `None`.
    pub rng_seed: Option<u64>,
    /// Eigensolver settings.
    pub lanczos: LanczosConfig,
    /// Settings for each of the two tensor stores.
    pub store: StoreConfig,
}

impl Default for DMRGConfig {
    fn default() -> Self {
        Self {
            length: 50,
            chi: 100,
            growth_chi: 10,
            cutoff: 1e-12,
            energy_tol: 1e-10,
            max_sweeps: 7,
            seed_policy: SeedPolicy::default(),
            rng_seed: None,
            lanczos: LanczosConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

/// Stage of a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    InfiniteGrowth,
    FirstHalfSweep,
    Sweeping,
    FinalMeasurementSweep,
    Converged,
    Stopped,
}

/// How a two-site step computes its local state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// Solve for the local ground state.
    Optimize,
    /// Normalize the current local state and evaluate its energy.
    Measure,
}

/// Outcome of a single two-site step.
#[derive(Clone, Debug, PartialEq)]
pub struct StepRecord {
    /// Phase the step belongs to.
    pub phase: Phase,
    /// Left site of the window (for growth steps, the left site of the pair).
    pub site: usize,
    /// Direction of travel of the center.
    pub dir: Direction,
    /// Energy of the local state.
    pub energy: f64,
    /// Entanglement entropy across the new active bond.
    pub entropy: f64,
    /// Bond dimension after truncation.
    pub bond_dim: usize,
    /// Discarded weight.
    pub discarded: f64,
    /// Number of Krylov vectors built (zero when measuring).
    pub iterations: usize,
    /// Eigensolver outcome (`None` when measuring).
    pub status: Option<LanczosStatus>,
}

/// Result of [`DMRG::run`].
#[derive(Clone, Debug, PartialEq)]
pub struct Summary {
    /// Last energy produced by an optimizing step.
    pub energy: f64,
    /// `true` if the energy tolerance was met.
    pub converged: bool,
    /// Number of full sweeps performed.
    pub sweeps: usize,
    /// Energies recorded during growth.
    pub growth_energies: Vec<f64>,
}

/// Two-site DMRG engine for a chain described by an [`OperatorProvider`].
///
/// The engine exclusively owns its MPS and environment stores.
pub struct DMRG<H> {
    config: DMRGConfig,
    mpo: H,
    mps: MPS,
    env: Environment,
    rng: StdRng,
    phase: Phase,
    chi: usize,
    center: Option<usize>,
    trace: Vec<StepRecord>,
    sweeps: usize,
    converged: bool,
}

impl<H> DMRG<H>
where H: OperatorProvider
{
    /// Create a new engine, opening one store for the MPS and one for the
    /// environment blocks according to `config.store`.
    pub fn new(config: DMRGConfig, mpo: H) -> DMRGResult<Self> {
        let mps_store = TensorStore::new(&config.store, "mps")?;
        let env_store = TensorStore::new(&config.store, "env")?;
        Self::with_stores(config, mpo, mps_store, env_store)
    }

    /// Create a new engine on existing, empty stores.
    pub fn with_stores(
        config: DMRGConfig,
        mpo: H,
        mps_store: TensorStore,
        env_store: TensorStore,
    ) -> DMRGResult<Self>
    {
        let length = config.length;
        mpo.check_shapes(length)?;
        let mps = MPS::new(length, mpo.phys_dim(), mps_store)?;
        let env = Environment::new(length, env_store);
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let chi = config.chi;
        Ok(Self {
            config,
            mpo,
            mps,
            env,
            rng,
            phase: Phase::InfiniteGrowth,
            chi,
            center: None,
            trace: Vec::new(),
            sweeps: 0,
            converged: false,
        })
    }

    /// Current phase.
    pub fn phase(&self) -> Phase { self.phase }

    /// Bond currently holding the orthogonality center, if any.
    pub fn center(&self) -> Option<usize> { self.center }

    /// Every step performed so far, in order.
    pub fn trace(&self) -> &[StepRecord] { &self.trace }

    /// Energies recorded during infinite-system growth.
    pub fn growth_energies(&self) -> Vec<f64> {
        self.trace.iter()
            .filter(|rec| rec.phase == Phase::InfiniteGrowth)
            .map(|rec| rec.energy)
            .collect()
    }

    /// Number of full sweeps performed.
    pub fn sweeps(&self) -> usize { self.sweeps }

    /// The MPS being optimized.
    pub fn mps(&self) -> &MPS { &self.mps }

    /// The environment blocks.
    pub fn env(&self) -> &Environment { &self.env }

    /// The operator provider.
    pub fn mpo(&self) -> &H { &self.mpo }

    /// Run configuration.
    pub fn config(&self) -> &DMRGConfig { &self.config }

    /// Maximum bond dimension used by sweep steps.
    pub fn chi(&self) -> usize { self.chi }

    /// Change the maximum bond dimension used by subsequent sweep steps.
    pub fn set_chi(&mut self, chi: usize) -> &mut Self {
        self.chi = chi;
        self
    }

    /// Occupancy of the MPS and environment stores.
    pub fn memory_usage(&self) -> (StoreUsage, StoreUsage) {
        (self.mps.memory_usage(), self.env.store().usage())
    }

    fn require(&self, phase: Phase, action: &'static str) -> DMRGResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(WrongPhase { action, phase: self.phase })
        }
    }

    /// Grow the chain from its boundary tensors, returning the energy found
    /// at each growth step.
    pub fn infinite(&mut self) -> DMRGResult<Vec<f64>> {
        self.require(Phase::InfiniteGrowth, "grow the chain")?;
        let length = self.config.length;
        info!(length, chi = self.config.growth_chi, "starting infinite-system growth");
        self.env.init_boundary(&self.mps, &self.mpo)?;
        let mut energies: Vec<f64> = Vec::new();
        for (l, r) in schedule::growth(length)? {
            let left = self.env.read(Side::Left, l - 1)?;
            let right = self.env.read(Side::Right, r + 1)?;
            let h = EffH::new(
                left,
                self.mpo.site_operator(l, length)?,
                self.mpo.site_operator(r, length)?,
                right,
            )?;
            let out = lanczos(&h, None, &self.config.lanczos, &mut self.rng);
            let (c1, d, c2) = h.dims();
            let q = to_matrix(&out.vector, c1 * d, d * c2)?;
            let trunc = truncate(q, self.config.growth_chi, self.config.cutoff)?;
            self.mps.write_left(l, &trunc.u)?;
            self.mps.write_right(r, &trunc.vt)?;
            self.env.add(&self.mps, &self.mpo, l, Side::Left)?;
            self.env.add(&self.mps, &self.mpo, r, Side::Right)?;
            self.mps.write_spectrum(l, &trunc.s)?;
            self.mps.delete_spectrum(l - 1)?;
            let rec = StepRecord {
                phase: Phase::InfiniteGrowth,
                site: l,
                dir: Direction::Right,
                energy: out.energy,
                entropy: entropy(&trunc.s),
                bond_dim: trunc.rank,
                discarded: trunc.discarded,
                iterations: out.iterations,
                status: Some(out.status),
            };
            debug!(
                left = l, right = r, energy = rec.energy, bond_dim = rec.bond_dim,
                "growth step",
            );
            energies.push(rec.energy);
            self.trace.push(rec);
        }
        self.center = Some(schedule::center_after_growth(length)?);
        self.phase = Phase::FirstHalfSweep;
        if let Some(e) = energies.last() {
            info!(energy = e, "finished growth");
        }
        Ok(energies)
    }

    /// Optimize (or measure) the window `(site, site + 1)`, moving the center
    /// in direction `dir`.
    ///
    /// The center must currently sit on bond `site - 1` for a rightward step
    /// or on bond `site + 1` for a leftward step.
    pub fn step(&mut self, site: usize, dir: Direction, stage: Stage)
        -> DMRGResult<StepRecord>
    {
        let length = self.config.length;
        if site == 0 || site + 3 > length {
            return Err(BadWindow { site, length });
        }
        let expected = match dir {
            Direction::Right => site - 1,
            Direction::Left => site + 1,
        };
        if self.center != Some(expected) {
            return Err(OffCenter { site, dir, center: self.center });
        }
        let rec = self.do_step(site, dir, stage)
            .map_err(|err| StepFailed { site, dir, source: Box::new(err) })?;
        debug!(
            site, %dir, energy = rec.energy, entropy = rec.entropy,
            bond_dim = rec.bond_dim, discarded = rec.discarded,
            "two-site step",
        );
        self.trace.push(rec.clone());
        Ok(rec)
    }

    fn do_step(&mut self, site: usize, dir: Direction, stage: Stage)
        -> DMRGResult<StepRecord>
    {
        let length = self.config.length;
        let (left, right) = self.env.env_prep(site)?;
        let h = EffH::new(
            left,
            self.mpo.site_operator(site, length)?,
            self.mpo.site_operator(site + 1, length)?,
            right,
        )?;
        let theta0: nd::Array1<C64> = flatten(&self.mps.two_site(site, dir)?);
        let (energy, vector, iterations, status)
            = match stage {
                Stage::Optimize => {
                    let seed = match self.config.seed_policy {
                        SeedPolicy::Current => Some(&theta0),
                        SeedPolicy::Random => None,
                    };
                    let out = lanczos(&h, seed, &self.config.lanczos, &mut self.rng);
                    if out.status == LanczosStatus::Degraded {
                        warn!(site, %dir, "eigensolver degraded; keeping the current state");
                    }
                    (out.energy, out.vector, out.iterations, Some(out.status))
                },
                Stage::Measure => {
                    let mut v = theta0;
                    normalize(&mut v);
                    (rayleigh(&h, &v), v, 0, None)
                },
            };
        let (c1, d, c2) = h.dims();
        let q = to_matrix(&vector, c1 * d, d * c2)?;
        let trunc = truncate(q, self.chi, self.config.cutoff)?;

        self.mps.write_left(site, &trunc.u)?;
        self.mps.write_right(site + 1, &trunc.vt)?;
        self.mps.write_spectrum(site, &trunc.s)?;
        match dir {
            Direction::Right => {
                self.mps.delete_spectrum(site - 1)?;
                self.env.add(&self.mps, &self.mpo, site, Side::Left)?;
                if site + 3 == length {
                    self.env.add(&self.mps, &self.mpo, site + 1, Side::Right)?;
                }
            },
            Direction::Left => {
                self.mps.delete_spectrum(site + 1)?;
                self.env.add(&self.mps, &self.mpo, site + 1, Side::Right)?;
                if site == 1 {
                    self.env.add(&self.mps, &self.mpo, site, Side::Left)?;
                }
            },
        }
        self.center = Some(site);

        Ok(StepRecord {
            phase: self.phase,
            site,
            dir,
            energy,
            entropy: entropy(&trunc.s),
            bond_dim: trunc.rank,
            discarded: trunc.discarded,
            iterations,
            status,
        })
    }

    fn run_schedule(&mut self, steps: Vec<Step>, stage: Stage) -> DMRGResult<Vec<f64>> {
        steps.into_iter()
            .map(|(site, dir)| self.step(site, dir, stage).map(|rec| rec.energy))
            .collect()
    }

    /// Move the center from the middle of the chain to the right end and then
    /// to the left end, returning the energy of each step.
    pub fn first_half_sweep(&mut self) -> DMRGResult<Vec<f64>> {
        self.require(Phase::FirstHalfSweep, "run the first half sweep")?;
        info!(chi = self.chi, "starting first half sweep");
        let energies
            = self.run_schedule(schedule::first_half(self.config.length)?, Stage::Optimize)?;
        self.phase = Phase::Sweeping;
        Ok(energies)
    }

    /// Perform one full sweep, returning the energy of each step.
    pub fn sweep(&mut self) -> DMRGResult<Vec<f64>> {
        self.require(Phase::Sweeping, "sweep")?;
        let energies
            = self.run_schedule(schedule::full(self.config.length)?, Stage::Optimize)?;
        self.sweeps += 1;
        Ok(energies)
    }

    /// Sweep until the first and last energies of a sweep agree to within the
    /// configured tolerance or the maximum number of sweeps is reached,
    /// returning `true` in the former case.
    pub fn run_sweeps(&mut self) -> DMRGResult<bool> {
        self.require(Phase::Sweeping, "sweep")?;
        let converged
            = loop {
                let energies = self.sweep()?;
                let (first, last)
                    = match (energies.first(), energies.last()) {
                        (Some(a), Some(b)) => (*a, *b),
                        _ => { break true; },
                    };
                let delta = (first - last).abs();
                info!(sweep = self.sweeps, energy = last, delta, "finished sweep");
                if delta < self.config.energy_tol { break true; }
                if self.sweeps >= self.config.max_sweeps {
                    warn!(
                        sweeps = self.sweeps, delta,
                        "reached the maximum number of sweeps without converging",
                    );
                    break false;
                }
            };
        self.converged = converged;
        self.phase = Phase::FinalMeasurementSweep;
        Ok(converged)
    }

    /// Perform the final measurement pass, calling `f` with the MPS and the
    /// step record after every step.
    ///
    /// After each step at site `s`, site `s` is left-isometric, the spectrum
    /// on bond `s` is stored, and all sites right of `s` are right-isometric,
    /// so single-site observables at `s` and correlators starting at `s` can
    /// be evaluated directly.
    pub fn final_sweep_with<F>(&mut self, mut f: F) -> DMRGResult<Vec<StepRecord>>
    where F: FnMut(&MPS, &StepRecord) -> DMRGResult<()>
    {
        self.require(Phase::FinalMeasurementSweep, "run the final measurement sweep")?;
        info!("starting final measurement sweep");
        let mut records: Vec<StepRecord> = Vec::new();
        for (site, dir) in schedule::final_pass(self.config.length)? {
            let rec = self.step(site, dir, Stage::Measure)?;
            f(&self.mps, &rec)?;
            records.push(rec);
        }
        self.phase = if self.converged { Phase::Converged } else { Phase::Stopped };
        Ok(records)
    }

    /// Like [`Self::final_sweep_with`], with no per-step callback.
    pub fn final_sweep(&mut self) -> DMRGResult<Vec<StepRecord>> {
        self.final_sweep_with(|_, _| Ok(()))
    }

    /// Run every phase in order.
    pub fn run(&mut self) -> DMRGResult<Summary> {
        let growth_energies = self.infinite()?;
        self.first_half_sweep()?;
        let converged = self.run_sweeps()?;
        self.final_sweep()?;
        let energy
            = self.trace.iter().rev()
            .find(|rec| rec.status.is_some())
            .map(|rec| rec.energy)
            .unwrap_or(f64::NAN);
        Ok(Summary { energy, converged, sweeps: self.sweeps, growth_energies })
    }
}
