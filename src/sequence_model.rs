use crate::context::ExecutionContext;
use crate::error::ForecastError;
use anyhow::{anyhow, Result};
use ndarray::{s, Array, Array1, Array2, ArrayView1, ArrayView2, Axis, Dimension, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::iter::FusedIterator;

const ADAM_BETA1: f64 = 0.9;
const ADAM_BETA2: f64 = 0.999;
const ADAM_EPSILON: f64 = 1e-8;
const FORGET_GATE_BIAS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SequenceModelConfig {
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f64,
    pub seed: Option<u64>,
}

impl Default for SequenceModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: 64,
            num_layers: 2,
            dropout: 0.2,
            seed: None,
        }
    }
}

impl SequenceModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.hidden_size == 0 {
            return Err(anyhow!("Hidden size must be positive"));
        }
        if self.num_layers == 0 {
            return Err(anyhow!("Sequence model needs at least one layer"));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(anyhow!(
                "Dropout must be in [0, 1) (value: {})",
                self.dropout
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LstmLayer {
    /// `[4H, input]`, gate blocks ordered input, forget, cell, output.
    w_x: Array2<f64>,
    w_h: Array2<f64>,
    bias: Array1<f64>,
}

impl LstmLayer {
    fn new(input_size: usize, hidden_size: usize, rng: &mut StdRng) -> Self {
        let limit = 1.0 / (hidden_size as f64).sqrt();
        let gates = 4 * hidden_size;
        let w_x = Array2::from_shape_fn((gates, input_size), |_| rng.gen_range(-limit..limit));
        let w_h = Array2::from_shape_fn((gates, hidden_size), |_| rng.gen_range(-limit..limit));
        let mut bias = Array1::zeros(gates);
        bias.slice_mut(s![hidden_size..2 * hidden_size])
            .fill(FORGET_GATE_BIAS);
        Self { w_x, w_h, bias }
    }

    fn hidden_size(&self) -> usize {
        self.w_h.ncols()
    }

    fn input_size(&self) -> usize {
        self.w_x.ncols()
    }

    fn step(&self, input: &Array2<f64>, h_prev: &Array2<f64>, c_prev: &Array2<f64>) -> StepCache {
        let hidden = self.hidden_size();
        let z = input.dot(&self.w_x.t()) + h_prev.dot(&self.w_h.t()) + &self.bias;
        let i = z.slice(s![.., 0..hidden]).mapv(sigmoid);
        let f = z.slice(s![.., hidden..2 * hidden]).mapv(sigmoid);
        let g = z.slice(s![.., 2 * hidden..3 * hidden]).mapv(f64::tanh);
        let o = z.slice(s![.., 3 * hidden..]).mapv(sigmoid);
        let c = &f * c_prev + &i * &g;
        let tanh_c = c.mapv(f64::tanh);
        let h = &o * &tanh_c;
        StepCache {
            input: input.clone(),
            h_prev: h_prev.clone(),
            c_prev: c_prev.clone(),
            i,
            f,
            g,
            o,
            tanh_c,
            h,
            c,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LinearHead {
    weights: Array1<f64>,
    bias: Array1<f64>,
}

struct StepCache {
    input: Array2<f64>,
    h_prev: Array2<f64>,
    c_prev: Array2<f64>,
    i: Array2<f64>,
    f: Array2<f64>,
    g: Array2<f64>,
    o: Array2<f64>,
    tanh_c: Array2<f64>,
    h: Array2<f64>,
    c: Array2<f64>,
}

struct LayerTrace {
    steps: Vec<StepCache>,
    dropout_masks: Option<Vec<Array2<f64>>>,
}

struct ForwardTrace {
    layers: Vec<LayerTrace>,
    top_hidden: Array2<f64>,
}

#[derive(Clone)]
struct LayerGradients {
    w_x: Array2<f64>,
    w_h: Array2<f64>,
    bias: Array1<f64>,
}

#[derive(Clone)]
struct Gradients {
    layers: Vec<LayerGradients>,
    head_weights: Array1<f64>,
    head_bias: Array1<f64>,
}

impl Gradients {
    fn zeros_like(model: &SequenceModel) -> Self {
        Self {
            layers: model
                .layers
                .iter()
                .map(|layer| LayerGradients {
                    w_x: Array2::zeros(layer.w_x.raw_dim()),
                    w_h: Array2::zeros(layer.w_h.raw_dim()),
                    bias: Array1::zeros(layer.bias.raw_dim()),
                })
                .collect(),
            head_weights: Array1::zeros(model.head.weights.raw_dim()),
            head_bias: Array1::zeros(model.head.bias.raw_dim()),
        }
    }

    fn accumulate(&mut self, other: &Gradients) {
        for (mine, theirs) in self.layers.iter_mut().zip(&other.layers) {
            mine.w_x += &theirs.w_x;
            mine.w_h += &theirs.w_h;
            mine.bias += &theirs.bias;
        }
        self.head_weights += &other.head_weights;
        self.head_bias += &other.head_bias;
    }

    fn scale(&mut self, factor: f64) {
        for layer in &mut self.layers {
            layer.w_x *= factor;
            layer.w_h *= factor;
            layer.bias *= factor;
        }
        self.head_weights *= factor;
        self.head_bias *= factor;
    }
}

struct AdamState {
    first_moment: Gradients,
    second_moment: Gradients,
    step: i32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    pub windows: usize,
    pub epochs: usize,
    pub initial_loss: Option<f64>,
    pub final_loss: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceModel {
    config: SequenceModelConfig,
    layers: Vec<LstmLayer>,
    head: LinearHead,
}

impl SequenceModel {
    pub fn new(config: SequenceModelConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut layers = Vec::with_capacity(config.num_layers);
        layers.push(LstmLayer::new(1, config.hidden_size, &mut rng));
        for _ in 1..config.num_layers {
            layers.push(LstmLayer::new(
                config.hidden_size,
                config.hidden_size,
                &mut rng,
            ));
        }
        let limit = 1.0 / (config.hidden_size as f64).sqrt();
        let head = LinearHead {
            weights: Array1::from_shape_fn(config.hidden_size, |_| rng.gen_range(-limit..limit)),
            bias: Array1::from_elem(1, rng.gen_range(-limit..limit)),
        };
        Ok(Self {
            config,
            layers,
            head,
        })
    }

    pub fn config(&self) -> SequenceModelConfig {
        self.config
    }

    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.w_x.len() + layer.w_h.len() + layer.bias.len())
            .sum::<usize>()
            + self.head.weights.len()
            + self.head.bias.len()
    }

    pub fn validate(&self) -> Result<()> {
        self.config.validate()?;
        if self.layers.len() != self.config.num_layers {
            return Err(anyhow!(
                "Weight file declares {} layers but holds {}",
                self.config.num_layers,
                self.layers.len()
            ));
        }
        let hidden = self.config.hidden_size;
        for (idx, layer) in self.layers.iter().enumerate() {
            let expected_input = if idx == 0 { 1 } else { hidden };
            if layer.w_x.dim() != (4 * hidden, expected_input)
                || layer.w_h.dim() != (4 * hidden, hidden)
                || layer.bias.len() != 4 * hidden
            {
                return Err(anyhow!("Layer {} weights have unexpected shapes", idx));
            }
            if layer.input_size() != expected_input {
                return Err(anyhow!("Layer {} input size mismatch", idx));
            }
        }
        if self.head.weights.len() != hidden || self.head.bias.len() != 1 {
            return Err(anyhow!("Output head weights have unexpected shapes"));
        }
        let all_finite = self
            .layers
            .iter()
            .flat_map(|layer| layer.w_x.iter().chain(layer.w_h.iter()).chain(layer.bias.iter()))
            .chain(self.head.weights.iter())
            .chain(self.head.bias.iter())
            .all(|value| value.is_finite());
        if !all_finite {
            return Err(anyhow!("Weights contain non-finite values"));
        }
        Ok(())
    }

    pub fn forward(&self, window: &[f64]) -> f64 {
        let batch = Array1::from(window.to_vec()).insert_axis(Axis(0));
        let (predictions, _) = self.run_forward(batch.view(), None);
        predictions[0]
    }

    pub fn forward_batch(&self, windows: ArrayView2<f64>) -> Array1<f64> {
        self.run_forward(windows, None).0
    }

    pub fn mean_squared_error(&self, windows: ArrayView2<f64>, targets: ArrayView1<f64>) -> f64 {
        if targets.is_empty() {
            return 0.0;
        }
        let predictions = self.forward_batch(windows);
        let sse: f64 = predictions
            .iter()
            .zip(targets.iter())
            .map(|(prediction, target)| (prediction - target).powi(2))
            .sum();
        sse / targets.len() as f64
    }

    /// Lazily rolls the model forward from `seed_window`, feeding each
    /// prediction back in as the newest input.
    pub fn rollout(&self, seed_window: Vec<f64>, steps: usize) -> Rollout<'_> {
        Rollout {
            model: self,
            window: VecDeque::from(seed_window),
            remaining: steps,
        }
    }

    /// Full-batch training: `epochs` Adam steps on the mean squared error.
    pub fn fit(
        &mut self,
        windows: ArrayView2<f64>,
        targets: ArrayView1<f64>,
        learning_rate: f64,
        epochs: usize,
        context: &ExecutionContext,
        mut on_epoch: impl FnMut(usize, f64),
    ) -> Result<FitReport> {
        if windows.nrows() != targets.len() {
            return Err(anyhow!(
                "Window count {} does not match target count {}",
                windows.nrows(),
                targets.len()
            ));
        }
        if !learning_rate.is_finite() || learning_rate <= 0.0 {
            return Err(anyhow!("Learning rate must be positive (value: {learning_rate})"));
        }
        let sample_count = targets.len();
        if sample_count == 0 || epochs == 0 {
            return Ok(FitReport {
                windows: sample_count,
                epochs: 0,
                initial_loss: None,
                final_loss: None,
            });
        }

        let base_seed = self.config.seed.unwrap_or_else(rand::random::<u64>);
        let chunk_size = context.chunk_size();
        let chunk_starts: Vec<usize> = (0..sample_count).step_by(chunk_size).collect();
        let mut adam = AdamState {
            first_moment: Gradients::zeros_like(self),
            second_moment: Gradients::zeros_like(self),
            step: 0,
        };
        let mut initial_loss = None;
        let mut final_loss = None;

        for epoch in 0..epochs {
            let model: &SequenceModel = self;
            let reduced = context.install(|| {
                chunk_starts
                    .par_iter()
                    .map(|&start| {
                        let end = (start + chunk_size).min(sample_count);
                        let mut rng = StdRng::seed_from_u64(
                            base_seed ^ ((epoch as u64) << 32) ^ start as u64,
                        );
                        model.chunk_gradients(
                            windows.slice(s![start..end, ..]),
                            targets.slice(s![start..end]),
                            &mut rng,
                        )
                    })
                    .reduce_with(|(mut grads, sse), (other, other_sse)| {
                        grads.accumulate(&other);
                        (grads, sse + other_sse)
                    })
            });
            let Some((mut gradients, sse)) = reduced else {
                break;
            };

            let loss = sse / sample_count as f64;
            if !loss.is_finite() {
                return Err(ForecastError::TrainingFailure(format!(
                    "loss diverged to {loss} at epoch {}",
                    epoch + 1
                ))
                .into());
            }
            initial_loss.get_or_insert(loss);
            final_loss = Some(loss);

            gradients.scale(1.0 / sample_count as f64);
            self.apply_adam(&gradients, &mut adam, learning_rate);
            on_epoch(epoch + 1, loss);
        }

        Ok(FitReport {
            windows: sample_count,
            epochs,
            initial_loss,
            final_loss,
        })
    }

    /// Summed (not averaged) gradients and squared error for one chunk.
    fn chunk_gradients(
        &self,
        windows: ArrayView2<f64>,
        targets: ArrayView1<f64>,
        rng: &mut StdRng,
    ) -> (Gradients, f64) {
        let (predictions, trace) = self.run_forward(windows, Some(rng));
        let errors = &predictions - &targets;
        let sse = errors.iter().map(|error| error * error).sum::<f64>();
        let d_predictions = errors.mapv(|error| 2.0 * error);
        let gradients = match trace {
            Some(trace) => self.backward(&trace, &d_predictions),
            None => Gradients::zeros_like(self),
        };
        (gradients, sse)
    }

    fn run_forward(
        &self,
        windows: ArrayView2<f64>,
        mut dropout_rng: Option<&mut StdRng>,
    ) -> (Array1<f64>, Option<ForwardTrace>) {
        let training = dropout_rng.is_some();
        let batch = windows.nrows();
        let sequence_length = windows.ncols();
        let hidden = self.config.hidden_size;
        let layer_count = self.layers.len();

        let mut layer_inputs: Vec<Array2<f64>> = (0..sequence_length)
            .map(|t| windows.slice(s![.., t..t + 1]).to_owned())
            .collect();
        let mut traces = Vec::with_capacity(if training { layer_count } else { 0 });

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let mut h = Array2::zeros((batch, hidden));
            let mut c = Array2::zeros((batch, hidden));
            let mut outputs = Vec::with_capacity(sequence_length);
            let mut steps = Vec::with_capacity(if training { sequence_length } else { 0 });

            for input in &layer_inputs {
                let step = layer.step(input, &h, &c);
                h = step.h.clone();
                c = step.c.clone();
                outputs.push(step.h.clone());
                if training {
                    steps.push(step);
                }
            }

            let apply_dropout = layer_idx + 1 < layer_count && self.config.dropout > 0.0;
            let mut masks = None;
            if let (true, Some(rng)) = (apply_dropout, dropout_rng.as_deref_mut()) {
                let keep_scale = 1.0 / (1.0 - self.config.dropout);
                let dropout = self.config.dropout;
                let step_masks: Vec<Array2<f64>> = outputs
                    .iter()
                    .map(|_| {
                        Array2::from_shape_fn((batch, hidden), |_| {
                            if rng.gen::<f64>() < dropout {
                                0.0
                            } else {
                                keep_scale
                            }
                        })
                    })
                    .collect();
                for (output, mask) in outputs.iter_mut().zip(&step_masks) {
                    *output *= mask;
                }
                masks = Some(step_masks);
            }

            if training {
                traces.push(LayerTrace {
                    steps,
                    dropout_masks: masks,
                });
            }
            layer_inputs = outputs;
        }

        let top_hidden = layer_inputs
            .pop()
            .unwrap_or_else(|| Array2::zeros((batch, hidden)));
        let predictions = top_hidden.dot(&self.head.weights) + self.head.bias[0];
        let trace = training.then(|| ForwardTrace {
            layers: traces,
            top_hidden,
        });
        (predictions, trace)
    }

    fn backward(&self, trace: &ForwardTrace, d_predictions: &Array1<f64>) -> Gradients {
        let mut gradients = Gradients::zeros_like(self);
        let batch = d_predictions.len();
        let hidden = self.config.hidden_size;

        gradients.head_weights = trace.top_hidden.t().dot(d_predictions);
        gradients.head_bias[0] = d_predictions.sum();

        let sequence_length = trace
            .layers
            .first()
            .map(|layer| layer.steps.len())
            .unwrap_or(0);
        if sequence_length == 0 {
            return gradients;
        }

        let mut d_outputs: Vec<Array2<f64>> =
            vec![Array2::zeros((batch, hidden)); sequence_length];
        d_outputs[sequence_length - 1] = Array2::from_shape_fn((batch, hidden), |(row, col)| {
            d_predictions[row] * self.head.weights[col]
        });

        for layer_idx in (0..self.layers.len()).rev() {
            let layer = &self.layers[layer_idx];
            let layer_trace = &trace.layers[layer_idx];
            let layer_grads = &mut gradients.layers[layer_idx];
            let mut dh_next = Array2::<f64>::zeros((batch, hidden));
            let mut dc_next = Array2::<f64>::zeros((batch, hidden));
            let mut d_inputs = Vec::with_capacity(if layer_idx > 0 { sequence_length } else { 0 });
            let mut dz = Array2::<f64>::zeros((batch, 4 * hidden));

            for t in (0..sequence_length).rev() {
                let step = &layer_trace.steps[t];
                let dh = &d_outputs[t] + &dh_next;
                let d_o = &dh * &step.tanh_c;
                let dc = &dc_next + &(&dh * &step.o * &step.tanh_c.mapv(|v| 1.0 - v * v));
                let d_i = &dc * &step.g;
                let d_g = &dc * &step.i;
                let d_f = &dc * &step.c_prev;

                dz.slice_mut(s![.., 0..hidden])
                    .assign(&(d_i * &step.i.mapv(sigmoid_derivative)));
                dz.slice_mut(s![.., hidden..2 * hidden])
                    .assign(&(d_f * &step.f.mapv(sigmoid_derivative)));
                dz.slice_mut(s![.., 2 * hidden..3 * hidden])
                    .assign(&(d_g * &step.g.mapv(|v| 1.0 - v * v)));
                dz.slice_mut(s![.., 3 * hidden..])
                    .assign(&(d_o * &step.o.mapv(sigmoid_derivative)));

                layer_grads.w_x += &dz.t().dot(&step.input);
                layer_grads.w_h += &dz.t().dot(&step.h_prev);
                layer_grads.bias += &dz.sum_axis(Axis(0));

                if layer_idx > 0 {
                    d_inputs.push(dz.dot(&layer.w_x));
                }
                dh_next = dz.dot(&layer.w_h);
                dc_next = &dc * &step.f;
            }

            if layer_idx > 0 {
                d_inputs.reverse();
                if let Some(masks) = &trace.layers[layer_idx - 1].dropout_masks {
                    for (d_input, mask) in d_inputs.iter_mut().zip(masks) {
                        *d_input *= mask;
                    }
                }
                d_outputs = d_inputs;
            }
        }

        gradients
    }

    fn apply_adam(&mut self, gradients: &Gradients, state: &mut AdamState, learning_rate: f64) {
        state.step += 1;
        let bias_correction1 = 1.0 - ADAM_BETA1.powi(state.step);
        let bias_correction2 = 1.0 - ADAM_BETA2.powi(state.step);
        let update = AdamUpdate {
            learning_rate,
            bias_correction1,
            bias_correction2,
        };

        let moments = state
            .first_moment
            .layers
            .iter_mut()
            .zip(state.second_moment.layers.iter_mut());
        for ((layer, grads), (m, v)) in self.layers.iter_mut().zip(&gradients.layers).zip(moments) {
            update.apply(&mut layer.w_x, &grads.w_x, &mut m.w_x, &mut v.w_x);
            update.apply(&mut layer.w_h, &grads.w_h, &mut m.w_h, &mut v.w_h);
            update.apply(&mut layer.bias, &grads.bias, &mut m.bias, &mut v.bias);
        }
        update.apply(
            &mut self.head.weights,
            &gradients.head_weights,
            &mut state.first_moment.head_weights,
            &mut state.second_moment.head_weights,
        );
        update.apply(
            &mut self.head.bias,
            &gradients.head_bias,
            &mut state.first_moment.head_bias,
            &mut state.second_moment.head_bias,
        );
    }
}

struct AdamUpdate {
    learning_rate: f64,
    bias_correction1: f64,
    bias_correction2: f64,
}

impl AdamUpdate {
    fn apply<D: Dimension>(
        &self,
        param: &mut Array<f64, D>,
        grad: &Array<f64, D>,
        first: &mut Array<f64, D>,
        second: &mut Array<f64, D>,
    ) {
        Zip::from(param)
            .and(grad)
            .and(first)
            .and(second)
            .for_each(|p, &g, m, v| {
                *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                let m_hat = *m / self.bias_correction1;
                let v_hat = *v / self.bias_correction2;
                *p -= self.learning_rate * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
            });
    }
}

pub struct Rollout<'a> {
    model: &'a SequenceModel,
    window: VecDeque<f64>,
    remaining: usize,
}

impl Iterator for Rollout<'_> {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let prediction = self.model.forward(self.window.make_contiguous());
        self.window.pop_front();
        self.window.push_back(prediction);
        Some(prediction)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Rollout<'_> {}

impl FusedIterator for Rollout<'_> {}

fn sigmoid(value: f64) -> f64 {
    1.0 / (1.0 + (-value).exp())
}

fn sigmoid_derivative(activated: f64) -> f64 {
    activated * (1.0 - activated)
}
