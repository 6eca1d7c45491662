//! Job runner: simulates a scan, reconstructs it, and writes the results.

use std::path::Path;

use anyhow::{Context, Result};
use num_complex::Complex64;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use cohere_core::model::simple_ptycho::{far_field_probe_basis, object_setup};
use cohere_core::{ForwardModel, SimplePtycho};
use cohere_data::{Dataset, DetectorGeometry, Ptycho2DDataset, PtychoInput};
use cohere_optim::{ReconstructionResults, Reconstructor};

use crate::config::{JobConfig, SimulationConfig};

/// A simulated dataset and the model that produced it.
pub struct Simulation {
    pub dataset: Ptycho2DDataset,
    pub truth: SimplePtycho,
}

/// Simulate the diffraction patterns of a synthetic scan.
pub fn simulate(sim: &SimulationConfig) -> Result<Simulation> {
    let [m, n] = sim.pattern_size;
    if m == 0 || n == 0 {
        anyhow::bail!("pattern_size must be non-zero, got {:?}", sim.pattern_size);
    }
    let det_basis = [[sim.pixel_pitch, 0.0], [0.0, sim.pixel_pitch], [0.0, 0.0]];
    let geometry = DetectorGeometry::new(sim.distance, det_basis);
    let basis = far_field_probe_basis(&det_basis, (m, n), sim.wavelength, sim.distance)?;

    let pixels = sim.scan.positions();
    if pixels.is_empty() {
        anyhow::bail!("Scan has no positions");
    }
    let (obj_shape, min_translation) = object_setup((m, n), &pixels);
    println!(
        "  Scan: {} positions, probe {}x{}, object {}x{}",
        pixels.len(),
        m,
        n,
        obj_shape.0,
        obj_shape.1
    );

    let inputs: Vec<PtychoInput> = pixels
        .iter()
        .enumerate()
        .map(|(index, p)| PtychoInput {
            index,
            translation: [
                basis[0][0] * p[0] + basis[0][1] * p[1],
                basis[1][0] * p[0] + basis[1][1] * p[1],
                basis[2][0] * p[0] + basis[2][1] * p[1],
            ],
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(sim.seed);
    let half = sim.phase_range / 2.0;
    let obj = Array2::from_shape_fn(obj_shape, |_| {
        Complex64::from_polar(rng.gen_range(0.8..=1.0), rng.gen_range(-half..=half))
    });
    let probe = gaussian_probe((m, n), sim.probe_width);

    let truth = SimplePtycho::new(sim.wavelength, geometry, basis, probe, obj).with_min_translation(min_translation);
    let dataset = truth.simulate_to_dataset(&inputs)?;
    Ok(Simulation { dataset, truth })
}

/// Gaussian amplitude with a gentle quadratic phase, centred in the window.
fn gaussian_probe(shape: (usize, usize), width: f64) -> Array2<Complex64> {
    let (m, n) = shape;
    let sigma = (width * m.min(n) as f64).max(0.5);
    Array2::from_shape_fn(shape, |(i, j)| {
        let y = i as f64 - (m as f64 - 1.0) / 2.0;
        let x = j as f64 - (n as f64 - 1.0) / 2.0;
        let r2 = x * x + y * y;
        Complex64::from_polar((-r2 / (2.0 * sigma * sigma)).exp(), 0.5 * r2 / (sigma * sigma))
    })
}

/// Fit a fresh model to the simulated data.
pub fn reconstruct(job: &JobConfig, simulation: &Simulation) -> Result<Reconstructor<SimplePtycho>> {
    let dataset = &simulation.dataset;
    let model = if job.model.known_probe {
        let truth = &simulation.truth;
        let obj = truth.object()?;
        let mut model = SimplePtycho::new(
            truth.wavelength,
            truth.detector_geometry(),
            truth.probe_basis,
            truth.probe()?,
            Array2::from_elem(obj.dim(), Complex64::new(1.0, 0.0)),
        )
        .with_min_translation(truth.min_translation);
        model.parameters_mut().set_trainable("probe", false)?;
        model
    } else {
        SimplePtycho::from_dataset(dataset)?
    };

    let mut rec = Reconstructor::new(model.with_loss(job.model.loss));
    println!("  Patterns: {}", dataset.len());
    {
        let mut epochs = rec
            .optimize_with(dataset, &job.optimizer, &job.reconstruction)
            .context("could not start the reconstruction")?;
        let mut epoch = 0;
        for loss in &mut epochs {
            epoch += 1;
            println!("  Epoch {:>4}: loss {:.6e}", epoch, loss?);
        }
    }
    println!("{}", rec.report());
    Ok(rec)
}

/// Write the loss history to a CSV file.
pub fn write_loss_csv(history: &[f64], path: &Path) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "# cohere reconstruction loss history")?;
    writeln!(file, "# Version: {}", env!("CARGO_PKG_VERSION"))?;
    writeln!(file, "epoch,loss")?;
    for (i, loss) in history.iter().enumerate() {
        writeln!(file, "{},{:.10e}", i + 1, loss)?;
    }

    println!("Loss history written to: {}", path.display());
    Ok(())
}

/// Write the fitted parameters and loss history to a JSON file.
pub fn write_results_json(results: &ReconstructionResults, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(results)
        .map_err(|e| anyhow::anyhow!("JSON serialisation error: {}", e))?;
    std::fs::write(path, json)?;

    println!("Results (JSON) written to: {}", path.display());
    Ok(())
}
