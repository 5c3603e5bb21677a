use std::{
    fs,
    io::{ self, BufWriter, Write },
    path::{ Path, PathBuf },
};
use clap::Parser;
use num_complex::Complex64 as C64;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;
use dmrg_chain::{
    dmrg::{ DMRG, DMRGConfig, DMRGError, Phase, StepRecord },
    mpo::{ TFIM, ZMAT },
    mps::MPSError,
    obs,
};

/// Ground state of the transverse-field Ising chain by two-site DMRG.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON file with a full or partial run configuration; flags below
    /// override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of sites.
    #[arg(short = 'L', long)]
    length: Option<usize>,

    /// Maximum bond dimension during sweeps.
    #[arg(long)]
    chi: Option<usize>,

    /// Maximum bond dimension during growth.
    #[arg(long)]
    growth_chi: Option<usize>,

    /// Maximum number of full sweeps.
    #[arg(long)]
    max_sweeps: Option<usize>,

    /// Nearest-neighbor ZZ coupling.
    #[arg(short = 'J', long, default_value_t = 1.0)]
    j: f64,

    /// Transverse field.
    #[arg(short = 'x', long, default_value_t = 1.0)]
    h_x: f64,

    /// Apply a longitudinal field of this strength to both chain ends.
    #[arg(long, num_args = 0..=1, default_missing_value = "10.0")]
    polarize: Option<f64>,

    /// In-memory budget of each tensor store, in bytes.
    #[arg(long)]
    budget_bytes: Option<usize>,

    /// Directory under which per-run overflow files are created.
    #[arg(long)]
    scratch: Option<PathBuf>,

    /// Write overflow tensors from a background thread.
    #[arg(long)]
    background_flush: bool,

    /// Random number generator seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Output directory.
    #[arg(short, long, default_value = "output")]
    out: PathBuf,

    /// Also write the final MPS to `<out>/mps.json`.
    #[arg(long)]
    save_mps: bool,
}

#[derive(Debug, Error)]
enum DriverError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("config error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    DMRGError(#[from] DMRGError),

    #[error("{0}")]
    MPSError(#[from] MPSError),
}

impl Args {
    fn into_config(self) -> Result<(DMRGConfig, TFIM, PathBuf), DriverError> {
        let mut config: DMRGConfig
            = match &self.config {
                Some(path) => serde_json::from_str(&fs::read_to_string(path)?)?,
                None => DMRGConfig::default(),
            };
        if let Some(length) = self.length { config.length = length; }
        if let Some(chi) = self.chi { config.chi = chi; }
        if let Some(growth_chi) = self.growth_chi { config.growth_chi = growth_chi; }
        if let Some(max_sweeps) = self.max_sweeps { config.max_sweeps = max_sweeps; }
        if let Some(budget) = self.budget_bytes { config.store.budget_bytes = budget; }
        if let Some(root) = self.scratch { config.store.root = root; }
        if self.background_flush { config.store.background_flush = true; }
        if self.seed.is_some() { config.rng_seed = self.seed; }
        let mut tfim = TFIM::new(self.j, self.h_x);
        if let Some(b) = self.polarize { tfim = tfim.polarized(b); }
        Ok((config, tfim, self.out))
    }
}

fn write_lines<I>(path: &Path, lines: I) -> io::Result<()>
where I: IntoIterator<Item = String>
{
    let mut out = BufWriter::new(fs::File::create(path)?);
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()
}

fn main() -> Result<(), DriverError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args = Args::parse();
    let save_mps = args.save_mps;
    let (config, tfim, outdir) = args.into_config()?;
    fs::create_dir_all(&outdir)?;
    info!(?config, ?tfim, "configured");

    let mut dmrg = DMRG::new(config, tfim)?;
    dmrg.infinite()?;
    dmrg.first_half_sweep()?;
    let converged = dmrg.run_sweeps()?;

    let mut z: Vec<(usize, C64)> = Vec::new();
    let mut zz: Vec<(usize, Vec<C64>)> = Vec::new();
    let finals: Vec<StepRecord>
        = dmrg.final_sweep_with(|mps, rec| {
            z.push((rec.site, obs::single_site(mps, rec.site, &ZMAT)?));
            zz.push((rec.site, obs::correlations(mps, rec.site, &ZMAT, &ZMAT)?));
            Ok(())
        })?;
    info!(
        converged,
        sweeps = dmrg.sweeps(),
        phase = ?dmrg.phase(),
        "finished",
    );

    let sweep_energies
        = dmrg.trace().iter()
        .filter(|rec| matches!(rec.phase, Phase::FirstHalfSweep | Phase::Sweeping))
        .map(|rec| format!("{}\t{}\t{:.15e}", rec.site, rec.dir.tag(), rec.energy));
    write_lines(&outdir.join("E_sweep.txt"), sweep_energies)?;
    write_lines(
        &outdir.join("S.txt"),
        finals.iter().map(|rec| format!("{}\t{:.15e}", rec.site, rec.entropy)),
    )?;
    write_lines(
        &outdir.join("Z.txt"),
        z.iter().map(|(site, zk)| format!("{}\t{:.15e}", site, zk.re)),
    )?;
    write_lines(
        &outdir.join("ZZ.txt"),
        zz.iter().map(|(site, row)| {
            let vals: Vec<String> = row.iter().map(|c| format!("{:.15e}", c.re)).collect();
            format!("{}\t{}", site, vals.join("\t"))
        }),
    )?;

    if save_mps {
        dmrg.mps().save(&outdir.join("mps.json"))?;
    }

    let (mps_usage, env_usage) = dmrg.memory_usage();
    info!(?mps_usage, ?env_usage, out = %outdir.display(), "wrote results");
    Ok(())
}
