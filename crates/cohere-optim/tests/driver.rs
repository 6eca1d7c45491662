//! Integration tests: epoch iteration, threading, cancellation and failure
//! reporting through the public driver API.

use std::thread;
use std::time::Duration;

use cohere_core::losses::LossKind;
use cohere_core::measurement::{intensity, intensity_backward, MeasurementOptions};
use cohere_core::{ForwardModel, Gradients, ModelError, Parameter, Parameters, Pattern, SimplePtycho, Wavefield};
use cohere_data::{Dataset, DatasetError, DetectorGeometry, PtychoInput};
use cohere_optim::{
    AdamConfig, JobState, LbfgsConfig, OptimizeError, ReconstructionSettings, Reconstructor, SgdConfig,
};
use ndarray::{s, stack, Array2, Array3, ArrayD, Axis, IxDyn};
use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Patterns indexed by position, each a 2x2 intensity.
struct Patterns(Array3<f64>);

impl Dataset for Patterns {
    type Input = usize;

    fn len(&self) -> usize {
        self.0.shape()[0]
    }

    fn get(&self, index: usize) -> Result<(usize, Array2<f64>), DatasetError> {
        if index >= self.len() {
            return Err(DatasetError::IndexOutOfRange { index, len: self.len() });
        }
        Ok((index, self.0.slice(s![index, .., ..]).to_owned()))
    }
}

fn patterns(n: usize) -> Patterns {
    Patterns(Array3::from_shape_fn((n, 2, 2), |(i, j, k)| 1.0 + 0.3 * i as f64 + 0.2 * (j * 2 + k) as f64))
}

#[derive(Clone, Copy, PartialEq)]
enum Behaviour {
    Normal,
    Fail,
    Panic,
    Slow,
}

/// One independent complex 2x2 field per pattern, measured as intensity.
struct Separable {
    params: Parameters,
    behaviour: Behaviour,
}

impl Separable {
    fn new(n: usize, behaviour: Behaviour) -> Self {
        let field = ArrayD::from_shape_fn(IxDyn(&[n, 2, 2]), |idx| {
            Complex64::new(0.4 + 0.1 * idx[0] as f64, 0.1 + 0.05 * idx[1] as f64)
        });
        let mut params = Parameters::new();
        params.insert("field", Parameter::complex(field));
        Self { params, behaviour }
    }
}

impl ForwardModel for Separable {
    type Input = usize;

    fn parameters(&self) -> &Parameters {
        &self.params
    }

    fn parameters_mut(&mut self) -> &mut Parameters {
        &mut self.params
    }

    fn interaction(&self, inputs: &[usize]) -> Result<Wavefield, ModelError> {
        match self.behaviour {
            Behaviour::Fail => return Err(ModelError::Shape("refusing to simulate".into())),
            Behaviour::Panic => panic!("simulated worker failure"),
            Behaviour::Slow => thread::sleep(Duration::from_millis(40)),
            Behaviour::Normal => {}
        }
        let field = self.params.complex("field")?;
        let views: Vec<_> = inputs.iter().map(|&i| field.index_axis(Axis(0), i)).collect();
        stack(Axis(0), &views).map_err(|e| ModelError::Shape(e.to_string()))
    }

    fn interaction_backward(&self, inputs: &[usize], grad_exit: &Wavefield, grads: &mut Gradients) -> Result<(), ModelError> {
        if let Some(acc) = grads.complex_mut("field") {
            for (b, &i) in inputs.iter().enumerate() {
                let mut slot = acc.index_axis_mut(Axis(0), i);
                slot += &grad_exit.index_axis(Axis(0), b);
            }
        }
        Ok(())
    }

    fn forward_propagator(&self, wavefield: &Wavefield) -> Result<Wavefield, ModelError> {
        Ok(wavefield.clone())
    }

    fn forward_propagator_backward(&self, _wavefield: &Wavefield, grad: &Wavefield) -> Result<Wavefield, ModelError> {
        Ok(grad.clone())
    }

    fn measurement(&self, wavefield: &Wavefield) -> Result<Pattern, ModelError> {
        Ok(intensity(wavefield, &MeasurementOptions::default())?)
    }

    fn measurement_backward(&self, wavefield: &Wavefield, grad: &Pattern, _grads: &mut Gradients) -> Result<Wavefield, ModelError> {
        Ok(intensity_backward(wavefield, grad, &MeasurementOptions::default())?)
    }

    fn loss_gradient(
        &self,
        observed: &Pattern,
        simulated: &Pattern,
        mask: Option<&Array2<bool>>,
    ) -> Result<(f64, Pattern), ModelError> {
        Ok(LossKind::AmplitudeMse.gradient(observed, simulated, mask)?)
    }
}

fn sgd_minibatches() -> SgdConfig {
    SgdConfig {
        lr: 0.1,
        batch_size: Some(2),
        ..SgdConfig::default()
    }
}

#[test]
fn test_minibatch_epochs_record_one_loss_each() {
    let dataset = patterns(5);
    let mut rec = Reconstructor::new(Separable::new(5, Behaviour::Normal));
    let settings = ReconstructionSettings::default()
        .iterations(6)
        .calculation_width(1)
        .seed(7);

    let losses: Vec<f64> = rec
        .sgd_optimize(&dataset, sgd_minibatches(), &settings)
        .expect("job starts")
        .collect::<Result<_, _>>()
        .expect("every epoch succeeds");

    assert_eq!(losses.len(), 6);
    assert_eq!(rec.loss_history(), losses.as_slice());
    for pair in losses.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-12, "loss went up: {:?}", pair);
    }
    assert!(losses[5] < 0.5 * losses[0]);
}

#[test]
fn test_jobs_append_to_the_same_record() {
    let dataset = patterns(3);
    let mut rec = Reconstructor::new(Separable::new(3, Behaviour::Normal));
    let settings = ReconstructionSettings::default().iterations(2).threaded(false);
    rec.sgd_optimize(&dataset, SgdConfig::default(), &settings).unwrap().run().unwrap();
    rec.lbfgs_optimize(&dataset, LbfgsConfig::default(), &settings).unwrap().run().unwrap();
    assert_eq!(rec.loss_history().len(), 4);
}

#[test]
fn test_lbfgs_reduces_the_loss() {
    let dataset = patterns(4);
    let mut rec = Reconstructor::new(Separable::new(4, Behaviour::Normal));
    let settings = ReconstructionSettings::default().iterations(5);
    let config = LbfgsConfig {
        lr: 0.5,
        history_size: 5,
        ..LbfgsConfig::default()
    };
    let losses: Vec<f64> = rec
        .lbfgs_optimize(&dataset, config, &settings)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(losses[4] < 0.1 * losses[0]);
}

#[test]
fn test_cancelling_between_epochs_ends_the_job() {
    let dataset = patterns(5);
    let mut rec = Reconstructor::new(Separable::new(5, Behaviour::Normal));
    let settings = ReconstructionSettings::default().iterations(10);
    let mut epochs = rec.sgd_optimize(&dataset, sgd_minibatches(), &settings).unwrap();
    let token = epochs.cancel_token();

    assert!(epochs.next().unwrap().is_ok());
    token.cancel();
    assert!(epochs.next().is_none());
    assert!(epochs.next().is_none());
    assert_eq!(epochs.state(), JobState::Cancelled);
    assert_eq!(epochs.completed(), 1);
    drop(epochs);
    assert_eq!(rec.loss_history().len(), 1);
}

#[test]
fn test_poll_hook_can_cancel_a_running_epoch() {
    let dataset = patterns(5);
    let mut rec = Reconstructor::new(Separable::new(5, Behaviour::Slow));
    let settings = ReconstructionSettings::default().iterations(3).calculation_width(1);
    let epochs = rec.sgd_optimize(&dataset, SgdConfig::default(), &settings).unwrap();
    let token = epochs.cancel_token();
    let mut epochs = epochs.on_poll(move || token.cancel());

    assert!(epochs.next().is_none());
    assert_eq!(epochs.state(), JobState::Cancelled);
    drop(epochs);
    assert!(rec.loss_history().is_empty());
    assert_eq!(rec.report(), "No reconstruction iterations performed yet!");
}

#[test]
fn test_model_errors_surface_from_the_worker() {
    let dataset = patterns(3);
    let mut rec = Reconstructor::new(Separable::new(3, Behaviour::Fail));
    let settings = ReconstructionSettings::default().iterations(3);
    let mut epochs = rec.adam_optimize(&dataset, AdamConfig::default(), &settings).unwrap();
    match epochs.next() {
        Some(Err(OptimizeError::Model(ModelError::Shape(msg)))) => assert!(msg.contains("refusing")),
        other => panic!("expected a model error, got {:?}", other),
    }
    assert!(epochs.next().is_none());
    assert_eq!(epochs.state(), JobState::Failed);
}

#[test]
fn test_worker_panic_is_reported() {
    let dataset = patterns(3);
    let mut rec = Reconstructor::new(Separable::new(3, Behaviour::Panic));
    let settings = ReconstructionSettings::default().iterations(3);
    let mut epochs = rec.adam_optimize(&dataset, AdamConfig::default(), &settings).unwrap();
    match epochs.next() {
        Some(Err(OptimizeError::WorkerPanicked(msg))) => assert!(msg.contains("simulated worker failure")),
        other => panic!("expected a worker panic, got {:?}", other),
    }
    assert!(epochs.next().is_none());
    drop(epochs);
    assert!(rec.loss_history().is_empty());
}

#[test]
fn test_unsupported_regularizer_is_ignored() {
    let dataset = patterns(3);
    let mut plain = Reconstructor::new(Separable::new(3, Behaviour::Normal));
    let mut regularized = Reconstructor::new(Separable::new(3, Behaviour::Normal));
    let settings = ReconstructionSettings::default().iterations(2).threaded(false);
    plain.sgd_optimize(&dataset, SgdConfig::default(), &settings).unwrap().run().unwrap();
    regularized
        .sgd_optimize(&dataset, SgdConfig::default(), &settings.clone().regularization(vec![10.0]))
        .unwrap()
        .run()
        .unwrap();
    assert_eq!(plain.loss_history(), regularized.loss_history());
}

#[test]
fn test_adam_fits_a_ptychography_object() {
    let mut rng = StdRng::seed_from_u64(11);
    let mut random = |shape: (usize, usize)| {
        Array2::from_shape_fn(shape, |_| Complex64::new(rng.gen_range(0.5..1.5), rng.gen_range(-0.5..0.5)))
    };
    let basis = [[1e-8, 0.0], [0.0, 1e-8], [0.0, 0.0]];
    let probe = random((4, 4));
    let truth = SimplePtycho::new(1e-9, DetectorGeometry::default(), basis, probe.clone(), random((8, 8)));
    let inputs: Vec<PtychoInput> = [[0.0, 0.0], [0.0, 2.0], [2.0, 0.0], [3.0, 3.0], [1.0, 2.0]]
        .iter()
        .enumerate()
        .map(|(index, t)| PtychoInput {
            index,
            translation: [t[0] * 1e-8, t[1] * 1e-8, 0.0],
        })
        .collect();
    let dataset = truth.simulate_to_dataset(&inputs).expect("simulation succeeds");

    let mut model = SimplePtycho::new(
        1e-9,
        DetectorGeometry::default(),
        basis,
        probe,
        Array2::from_elem((8, 8), Complex64::new(1.0, 0.0)),
    );
    model.parameters_mut().set_trainable("probe", false).unwrap();
    let mut rec = Reconstructor::new(model);

    let config = AdamConfig {
        lr: 0.02,
        ..AdamConfig::default()
    };
    let settings = ReconstructionSettings::default().iterations(20).calculation_width(2).seed(3);
    let losses: Vec<f64> = rec
        .adam_optimize(&dataset, config, &settings)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert!(losses[19] < losses[0]);

    let results = rec.save_results();
    assert_eq!(results.loss_history.len(), 20);
    assert!(results.parameters.contains_key("obj"));
}
