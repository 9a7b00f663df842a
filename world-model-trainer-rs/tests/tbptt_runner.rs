//! Integration tests for the truncated-BPTT runner.
//!
//! These tests drive real train and validation passes of the LSTM dynamics
//! model on the `Autodiff<NdArray>` backend and check the hidden-state
//! lifecycle, truncation boundaries and log cadence.

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use world_model_trainer_rs::data::SequenceIter;
use world_model_trainer_rs::encoder::MeanEncoder;
use world_model_trainer_rs::runner::optimizer_steps_for;
use world_model_trainer_rs::{
    FrozenEncoder, GaussianReparameterizer, HostTensor, InMemorySequences, LstmDynamics,
    LstmDynamicsConfig, MemorySink, NullSink, Result, SequenceSource, TbpttRunner,
    TransitionBatch, WorldModelError,
};

type TestBackend = Autodiff<NdArray>;

const LATENT: usize = 3;
const ACTION: usize = 2;
const CHUNK: usize = 2;

fn model(device: &Device<TestBackend>) -> LstmDynamics<TestBackend> {
    LstmDynamicsConfig::new(LATENT, ACTION, 6).init(device)
}

/// Deterministic batch of `batch` chunks; `salt` varies the values.
fn batch(batch: usize, salt: usize) -> TransitionBatch {
    let wave = |len: usize, offset: usize| -> Vec<f32> {
        (0..len)
            .map(|k| (((salt * 31 + k + offset) as f32) * 0.37).sin())
            .collect()
    };
    let latent_len = batch * CHUNK * LATENT;
    let latent_shape = vec![batch, CHUNK, LATENT];

    TransitionBatch::new(
        HostTensor::new(latent_shape.clone(), wave(latent_len, 0)).unwrap(),
        HostTensor::new(latent_shape.clone(), vec![-2.0; latent_len]).unwrap(),
        HostTensor::new(latent_shape.clone(), wave(latent_len, 1)).unwrap(),
        HostTensor::new(latent_shape, vec![-2.0; latent_len]).unwrap(),
        HostTensor::new(
            vec![batch, CHUNK],
            (0..batch * CHUNK).map(|k| (k % 3 == 0) as u8 as f32).collect(),
        )
        .unwrap(),
        HostTensor::new(vec![batch, CHUNK, ACTION], wave(batch * CHUNK * ACTION, 7)).unwrap(),
    )
    .unwrap()
}

/// One sequence per entry of `lengths`, batch size 1.
fn sequences(lengths: &[usize]) -> InMemorySequences {
    InMemorySequences::new(
        lengths
            .iter()
            .enumerate()
            .map(|(s, &len)| (0..len).map(|i| batch(1, s * 100 + i)).collect())
            .collect(),
    )
    .unwrap()
}

#[test]
fn test_optimizer_steps_and_hidden_resets() {
    let device = Default::default();
    let source = sequences(&[5, 3, 7]);
    let runner = TbpttRunner::new(2, 10, 1e-3).unwrap();
    let mut optimizer = AdamConfig::new().init();
    let mut rng = StdRng::seed_from_u64(3);

    let (_, report) = runner
        .train_pass::<TestBackend, _, _, _, _, _>(
            model(&device),
            &mut optimizer,
            &GaussianReparameterizer,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut rng,
        )
        .unwrap();

    assert_eq!(report.hidden_resets, 3);
    assert_eq!(report.steps, 15);
    assert_eq!(report.next_global_step, 15);

    let mut by_sequence = vec![0; 3];
    for (&index, &steps) in report.sequence_order.iter().zip(&report.optimizer_steps) {
        by_sequence[index] = steps;
    }
    assert_eq!(by_sequence, vec![3, 2, 4]);

    let mut order = report.sequence_order.clone();
    order.sort_unstable();
    assert_eq!(order, vec![0, 1, 2]);
}

#[test]
fn test_optimizer_steps_match_ceil_for_other_strides() {
    let device = Default::default();
    let lengths = [4, 6, 1];
    let source = sequences(&lengths);

    for stride in [1, 3, 8] {
        let runner = TbpttRunner::new(stride, 10, 1e-3).unwrap();
        let mut optimizer = AdamConfig::new().init();
        let (_, report) = runner
            .train_pass::<TestBackend, _, _, _, _, _>(
                model(&device),
                &mut optimizer,
                &MeanEncoder,
                &source,
                &device,
                0,
                0,
                &mut NullSink,
                &mut StdRng::seed_from_u64(0),
            )
            .unwrap();

        for (&index, &steps) in report.sequence_order.iter().zip(&report.optimizer_steps) {
            assert_eq!(steps, optimizer_steps_for(lengths[index], stride));
        }
    }
}

#[test]
fn test_log_events_at_frequency_and_final_step() {
    let device = Default::default();
    let source = sequences(&[6]);
    let runner = TbpttRunner::new(2, 2, 1e-3).unwrap();
    let mut optimizer = AdamConfig::new().init();
    let mut sink = MemorySink::new();

    let (trained, report) = runner
        .train_pass::<TestBackend, _, _, _, _, _>(
            model(&device),
            &mut optimizer,
            &GaussianReparameterizer,
            &source,
            &device,
            4,
            0,
            &mut sink,
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();

    let steps: Vec<u64> = sink.scalars("loss").iter().map(|(s, _)| *s).collect();
    assert_eq!(steps, vec![0, 2, 4, 5]);
    assert_eq!(sink.scalars("latent_loss").len(), 4);
    assert_eq!(sink.scalars("reward_loss").len(), 4);

    let epoch = sink.scalars("epoch_loss");
    assert_eq!(epoch.len(), 1);
    assert_eq!(epoch[0].0, 4);
    assert!((epoch[0].1 - report.average_loss).abs() < 1e-12);
    assert!(sink.scalars("epoch_latent_loss").is_empty());
    assert!(sink.scalars("epoch_reward_loss").is_empty());

    // The last running average logged equals the pass average.
    let last = sink.scalars("loss").last().copied().unwrap();
    assert!((last.1 - report.average_loss).abs() < 1e-12);

    let mut val_sink = MemorySink::new();
    let val_report = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &trained,
            &GaussianReparameterizer,
            &source,
            &device,
            4,
            10,
            &mut val_sink,
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap();
    let val_steps: Vec<u64> = val_sink.scalars("val_loss").iter().map(|(s, _)| *s).collect();
    assert_eq!(val_steps, vec![10, 12, 14, 15]);
    assert!(val_sink.scalars("loss").is_empty());
    assert_eq!(val_report.next_global_step, 16);
    assert_eq!(val_sink.scalars("epoch_val_loss").len(), 1);
}

#[test]
fn test_global_step_continues_across_passes() {
    let device = Default::default();
    let source = sequences(&[3, 2]);
    let runner = TbpttRunner::new(1, 4, 1e-3).unwrap();
    let mut optimizer = AdamConfig::new().init();
    let mut sink = MemorySink::new();
    let mut rng = StdRng::seed_from_u64(9);

    let (model, first) = runner
        .train_pass::<TestBackend, _, _, _, _, _>(
            model(&device),
            &mut optimizer,
            &MeanEncoder,
            &source,
            &device,
            0,
            0,
            &mut sink,
            &mut rng,
        )
        .unwrap();
    let (_, second) = runner
        .train_pass::<TestBackend, _, _, _, _, _>(
            model,
            &mut optimizer,
            &MeanEncoder,
            &source,
            &device,
            1,
            first.next_global_step,
            &mut sink,
            &mut rng,
        )
        .unwrap();

    assert_eq!(first.next_global_step, 5);
    assert_eq!(second.next_global_step, 10);
    let steps: Vec<u64> = sink.scalars("loss").iter().map(|(s, _)| *s).collect();
    // pass one ends on step 4, pass two on the forced final step 9
    assert_eq!(steps, vec![0, 4, 8, 9]);
}

#[test]
fn test_eval_pass_is_deterministic() {
    let device = Default::default();
    let source = sequences(&[4, 2, 3]);
    let runner = TbpttRunner::new(2, 1, 1e-3).unwrap();
    let model = model(&device);

    let run = || {
        runner
            .eval_pass::<TestBackend, _, _, _, _>(
                &model,
                &GaussianReparameterizer,
                &source,
                &device,
                0,
                0,
                &mut NullSink,
                &mut StdRng::seed_from_u64(42),
            )
            .unwrap()
    };

    let first = run();
    let second = run();
    assert_eq!(first, second);
    assert_eq!(first.sequence_order, vec![0, 1, 2]);
    assert_eq!(first.optimizer_steps, vec![0, 0, 0]);
}

#[test]
fn test_train_pass_shuffles_sequence_order_per_seed() {
    let device = Default::default();
    let source = sequences(&[1; 8]);
    let runner = TbpttRunner::new(1, 100, 1e-3).unwrap();
    let identity: Vec<usize> = (0..8).collect();

    let order_for = |seed: u64| {
        let mut optimizer = AdamConfig::new().init();
        let (_, report) = runner
            .train_pass::<TestBackend, _, _, _, _, _>(
                model(&device),
                &mut optimizer,
                &MeanEncoder,
                &source,
                &device,
                0,
                0,
                &mut NullSink,
                &mut StdRng::seed_from_u64(seed),
            )
            .unwrap();
        report.sequence_order
    };

    let orders: Vec<Vec<usize>> = (0..4).map(order_for).collect();

    // Same seed, same order.
    assert_eq!(order_for(2), orders[2]);
    // Four identity permutations of 8 items in a row would be a 1 in 40320^4 draw.
    assert!(orders.iter().any(|order| *order != identity));
    assert!(orders.windows(2).any(|pair| pair[0] != pair[1]));
}

#[test]
fn test_eval_pass_leaves_model_unchanged() {
    let device = Default::default();
    let source = sequences(&[3]);
    let runner = TbpttRunner::new(1, 1, 1e-3).unwrap();
    let model = model(&device);

    let before = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &model,
            &MeanEncoder,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
    let _ = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &model,
            &GaussianReparameterizer,
            &source,
            &device,
            1,
            3,
            &mut NullSink,
            &mut StdRng::seed_from_u64(5),
        )
        .unwrap();
    let after = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &model,
            &MeanEncoder,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

    assert_eq!(before.average_loss, after.average_loss);
}

/// Encoder that counts its calls; two calls happen per step.
struct CountingEncoder {
    calls: Arc<AtomicUsize>,
}

impl FrozenEncoder for CountingEncoder {
    fn reparameterize<B: Backend, R: Rng + ?Sized>(
        &self,
        mu: Tensor<B, 3>,
        _log_var: Tensor<B, 3>,
        _rng: &mut R,
    ) -> Tensor<B, 3> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        mu
    }
}

/// Optimizer wrapper recording the step index of every update.
struct RecordingOptimizer<O> {
    inner: O,
    encoder_calls: Arc<AtomicUsize>,
    updated_at: Vec<usize>,
}

impl<M, B, O> Optimizer<M, B> for RecordingOptimizer<O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    type Record = O::Record;

    fn step(&mut self, lr: f64, module: M, grads: GradientsParams) -> M {
        let steps_seen = self.encoder_calls.load(Ordering::SeqCst) / 2;
        self.updated_at.push(steps_seen - 1);
        self.inner.step(lr, module, grads)
    }

    fn to_record(&self) -> Self::Record {
        self.inner.to_record()
    }

    fn load_record(mut self, record: Self::Record) -> Self {
        self.inner = self.inner.load_record(record);
        self
    }
}

#[test]
fn test_parameters_change_only_at_boundaries() {
    let device = Default::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let encoder = CountingEncoder {
        calls: Arc::clone(&calls),
    };
    let mut optimizer = RecordingOptimizer {
        inner: AdamConfig::new().init::<TestBackend, LstmDynamics<TestBackend>>(),
        encoder_calls: Arc::clone(&calls),
        updated_at: Vec::new(),
    };

    let runner = TbpttRunner::new(2, 10, 1e-3).unwrap();
    let (_, report) = runner
        .train_pass::<TestBackend, _, _, _, _, _>(
            model(&device),
            &mut optimizer,
            &encoder,
            &sequences(&[5]),
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

    assert_eq!(optimizer.updated_at, vec![1, 3, 4]);
    assert_eq!(report.optimizer_steps, vec![3]);
}

#[test]
fn test_training_reduces_loss() {
    let device = Default::default();
    let source = sequences(&[4, 4]);
    let runner = TbpttRunner::new(2, 100, 1e-2).unwrap();
    let mut optimizer = AdamConfig::new().init();
    let mut rng = StdRng::seed_from_u64(11);
    let mut model = model(&device);

    let initial = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &model,
            &MeanEncoder,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut rng,
        )
        .unwrap();

    for epoch in 0..40 {
        let (trained, _) = runner
            .train_pass::<TestBackend, _, _, _, _, _>(
                model,
                &mut optimizer,
                &MeanEncoder,
                &source,
                &device,
                epoch,
                0,
                &mut NullSink,
                &mut rng,
            )
            .unwrap();
        model = trained;
    }

    let trained = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &model,
            &MeanEncoder,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut rng,
        )
        .unwrap();

    assert!(trained.average_loss < initial.average_loss);
}

#[test]
fn test_partial_final_batch_narrows_state() {
    let device = Default::default();
    let source = InMemorySequences::new(vec![vec![batch(2, 0), batch(2, 1), batch(1, 2)]]).unwrap();
    let runner = TbpttRunner::new(2, 10, 1e-3).unwrap();
    let mut optimizer = AdamConfig::new().init();

    let (_, report) = runner
        .train_pass::<TestBackend, _, _, _, _, _>(
            model(&device),
            &mut optimizer,
            &GaussianReparameterizer,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();

    assert_eq!(report.steps, 3);
    assert_eq!(report.optimizer_steps, vec![2]);
}

#[test]
fn test_growing_batch_is_contract_violation() {
    let device = Default::default();
    let source = InMemorySequences::new(vec![vec![batch(1, 0), batch(2, 1)]]).unwrap();
    let runner = TbpttRunner::new(1, 10, 1e-3).unwrap();

    let err = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &model(&device),
            &MeanEncoder,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
    assert!(matches!(err, WorldModelError::DataContract(_)));
}

#[test]
fn test_empty_source_is_contract_violation() {
    let device = Default::default();
    let source = InMemorySequences::new(Vec::new()).unwrap();
    let runner = TbpttRunner::new(1, 10, 1e-3).unwrap();
    let mut optimizer = AdamConfig::new().init();

    let err = runner
        .train_pass::<TestBackend, _, _, _, _, _>(
            model(&device),
            &mut optimizer,
            &MeanEncoder,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
    assert!(matches!(err, WorldModelError::DataContract(_)));
}

/// Source that streams batches but cannot report sequence lengths.
struct StreamingSource {
    batches: Vec<TransitionBatch>,
}

impl SequenceSource for StreamingSource {
    fn num_sequences(&self) -> usize {
        1
    }

    fn sequence(&self, _index: usize) -> Result<SequenceIter<'_>> {
        Ok(Box::new(self.batches.iter().cloned().map(Ok)))
    }
}

#[test]
fn test_source_without_lengths_is_unsupported() {
    let device = Default::default();
    let source = StreamingSource {
        batches: vec![batch(1, 0), batch(1, 1)],
    };
    let runner = TbpttRunner::new(1, 10, 1e-3).unwrap();

    let err = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &model(&device),
            &MeanEncoder,
            &source,
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
    assert!(matches!(err, WorldModelError::Unsupported(_)));
    assert!(source.total_steps().is_err());
}

fn nan_sequences() -> InMemorySequences {
    let mut poisoned = batch(1, 0);
    poisoned.next_mu.data[0] = f32::NAN;
    InMemorySequences::new(vec![vec![batch(1, 1), poisoned]]).unwrap()
}

#[test]
fn test_nan_loss_propagates_without_detection() {
    let device = Default::default();
    let runner = TbpttRunner::new(1, 10, 1e-3).unwrap();

    let report = runner
        .eval_pass::<TestBackend, _, _, _, _>(
            &model(&device),
            &MeanEncoder,
            &nan_sequences(),
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
    assert!(report.average_loss.is_nan());
}

#[test]
fn test_nan_loss_aborts_with_detection() {
    let device = Default::default();
    let runner = TbpttRunner::new(1, 10, 1e-3)
        .unwrap()
        .with_anomaly_detection(true);
    let mut optimizer = AdamConfig::new().init();

    let err = runner
        .train_pass::<TestBackend, _, _, _, _, _>(
            model(&device),
            &mut optimizer,
            &MeanEncoder,
            &nan_sequences(),
            &device,
            0,
            0,
            &mut NullSink,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        WorldModelError::NumericalDivergence { sequence: 0, step: 1, .. }
    ));
}
