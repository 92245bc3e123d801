//! Module implementing the CPU backend for executing an ASG.
//!
//! The backend walks the computation graph in topological order and executes
//! each node with `ndarray`. Convolution and resizing are parallel over the
//! batch dimension via rayon.

use super::backend::{Backend, ExecutionMode, Memo, RunOutput, RuntimeError};
use crate::analysis::shape_inference::ShapeInference;
use crate::asg::{Asg, NodeId, NodeType, ResizeTarget, Value};
use log::trace;
use ndarray::{Array1, Array4, ArrayD, Axis, Ix1, Ix4, Zip};
use rand::rngs::StdRng;
use rayon::prelude::*;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::HashMap;

/// Execution context for one graph run on the CPU.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    /// Cache of already computed node values.
    memo: Memo<Value>,
    mode: ExecutionMode,
    rng: &'a RefCell<StdRng>,
    buffer_updates: HashMap<String, Value>,
}

impl<'a> ExecutionContext<'a> {
    fn new(
        asg: &'a Asg,
        initial_memo: Memo<Value>,
        mode: ExecutionMode,
        rng: &'a RefCell<StdRng>,
    ) -> Self {
        Self { asg, memo: initial_memo, mode, rng, buffer_updates: HashMap::new() }
    }

    /// Recursively computes the value of a node.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<Value, RuntimeError> {
        let asg = self.asg;
        let asg_id = asg.id;
        if let Some(value) = self.memo.get(&(asg_id, node_id)) {
            return Ok(value.clone());
        }

        let node = asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => {
                return Err(RuntimeError::MissingInput(name.clone(), node.id));
            }
            NodeType::Parameter { name } | NodeType::Buffer { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id));
            }

            NodeType::Add(l, r) => {
                let lhs = self.evaluate_node(*l)?;
                let rhs = self.evaluate_node(*r)?;
                op_add(lhs, rhs)
            }
            NodeType::ReLU(op) => op_relu(self.evaluate_node(*op)?),
            NodeType::Sigmoid(op) => op_sigmoid(self.evaluate_node(*op)?),

            NodeType::Conv2d { input, weight, bias, stride, padding, dilation, groups } => {
                let input_val = self.evaluate_node(*input)?;
                let weight_val = self.evaluate_node(*weight)?;
                let bias_val = match bias {
                    Some(b) => Some(self.evaluate_node(*b)?),
                    None => None,
                };
                op_conv2d(input_val, weight_val, bias_val, *stride, *padding, *dilation, *groups)
            }

            NodeType::BatchNorm2d { input, gamma, beta, running_mean, running_var, eps, momentum } => {
                let input_val = self.evaluate_node(*input)?;
                let gamma_val = self.evaluate_node(*gamma)?;
                let beta_val = self.evaluate_node(*beta)?;
                let mean_val = self.evaluate_node(*running_mean)?;
                let var_val = self.evaluate_node(*running_var)?;
                let stats = BatchNormStats { running_mean: mean_val, running_var: var_val };

                match self.mode {
                    ExecutionMode::Eval => op_batch_norm2d_eval(input_val, gamma_val, beta_val, stats, *eps),
                    ExecutionMode::Train => {
                        let (output, new_mean, new_var) =
                            op_batch_norm2d_train(input_val, gamma_val, beta_val, stats, *eps, *momentum)?;
                        let mean_name = self.state_name(*running_mean)?;
                        let var_name = self.state_name(*running_var)?;
                        self.buffer_updates.insert(mean_name, new_mean);
                        self.buffer_updates.insert(var_name, new_var);
                        Ok(output)
                    }
                }
            }

            NodeType::ResizeBilinear { input, target, align_corners } => {
                let input_val = self.evaluate_node(*input)?;
                let (in_h, in_w) = spatial_dims(&input_val, "ResizeBilinear input")?;
                let size = match target {
                    ResizeTarget::Fixed(h, w) => (*h, *w),
                    ResizeTarget::Downscale(0) => {
                        return Err(RuntimeError::ShapeError(
                            "ResizeBilinear: downscale factor is zero".to_string(),
                        ))
                    }
                    ResizeTarget::Downscale(factor) => (in_h / factor, in_w / factor),
                    ResizeTarget::MatchNode(reference) => {
                        let reference_val = self.evaluate_node(*reference)?;
                        spatial_dims(&reference_val, "ResizeBilinear reference")?
                    }
                };
                op_resize_bilinear(input_val, size, *align_corners)
            }

            NodeType::Dropout2d { input, p } => {
                let input_val = self.evaluate_node(*input)?;
                match self.mode {
                    ExecutionMode::Eval => Ok(input_val),
                    ExecutionMode::Train => op_dropout2d(input_val, *p, &mut self.rng.borrow_mut()),
                }
            }

            NodeType::AvgPool2d { input, kernel_size, stride, padding } => {
                let operand = self.evaluate_node(*input)?;
                op_avg_pool2d(operand, *kernel_size, *stride, *padding)
            }
        }?;

        trace!("{} #{} -> {:?}", node.node_type.op_name(), node_id, result.shape());
        self.memo.insert((asg_id, node_id), result.clone());
        Ok(result)
    }

    /// Name of the Buffer/Parameter node that holds a running statistic.
    fn state_name(&self, node_id: NodeId) -> Result<String, RuntimeError> {
        let node = self
            .asg
            .get_node(node_id)
            .map_err(|_| RuntimeError::NodeNotFound(node_id, self.asg.id))?;
        match &node.node_type {
            NodeType::Buffer { name } | NodeType::Parameter { name } => Ok(name.clone()),
            other => Err(RuntimeError::InvalidGraph(format!(
                "running statistics must be stored in a buffer, found {}",
                other.op_name()
            ))),
        }
    }
}

/// Executes graphs on the CPU with `ndarray`.
///
/// The backend owns the execution mode and the random generator used by
/// spatial dropout. Two backends built with the same seed produce the same
/// dropout masks for the same sequence of runs.
#[derive(Debug)]
pub struct CpuBackend {
    mode: ExecutionMode,
    rng: RefCell<StdRng>,
}

impl CpuBackend {
    /// Eval mode, RNG seeded with 0.
    pub fn new() -> Self {
        Self { mode: ExecutionMode::Eval, rng: RefCell::new(StdRng::seed_from_u64(0)) }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self { rng: RefCell::new(StdRng::seed_from_u64(seed)), ..self }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<RunOutput<Self::DeviceData>, RuntimeError> {
        let sorted_nodes = ShapeInference::topological_sort(main_asg)
            .map_err(|e| RuntimeError::InvalidGraph(format!("topological sort failed: {}", e)))?;

        let mut context = ExecutionContext::new(main_asg, initial_memo, self.mode, &self.rng);

        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let mut outputs = Vec::with_capacity(main_asg.outputs.len());
        for output_node_id in &main_asg.outputs {
            let result = context
                .memo
                .get(&(main_asg.id, *output_node_id))
                .ok_or(RuntimeError::NodeNotFound(*output_node_id, main_asg.id))?
                .clone();
            outputs.push(result);
        }

        Ok(RunOutput { outputs, memo: context.memo, buffer_updates: context.buffer_updates })
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

// --- Helpers ---

fn into_array4(value: Value, what: &str) -> Result<Array4<f32>, RuntimeError> {
    value
        .into_tensor()
        .into_dimensionality::<Ix4>()
        .map_err(|e| RuntimeError::ShapeError(format!("{}: expected a 4D tensor ({})", what, e)))
}

/// Converts a per-channel tensor to `[len]`.
fn into_vector(value: Value, len: usize, what: &str) -> Result<Array1<f32>, RuntimeError> {
    let arr = value
        .into_tensor()
        .into_dimensionality::<Ix1>()
        .map_err(|e| RuntimeError::ShapeError(format!("{}: expected a 1D tensor ({})", what, e)))?;
    if arr.len() != len {
        return Err(RuntimeError::ShapeError(format!(
            "{}: expected {} values, got {}",
            what,
            len,
            arr.len()
        )));
    }
    Ok(arr)
}

fn spatial_dims(value: &Value, what: &str) -> Result<(usize, usize), RuntimeError> {
    match value.shape() {
        [_, _, h, w] => Ok((*h, *w)),
        other => Err(RuntimeError::ShapeError(format!(
            "{}: expected a 4D tensor, got shape {:?}",
            what, other
        ))),
    }
}

// --- Elementwise ---

fn op_add(lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    let (a, b) = (lhs.into_tensor(), rhs.into_tensor());
    if a.shape() != b.shape() {
        return Err(RuntimeError::ShapeError(format!(
            "Add: operand shapes differ, {:?} vs {:?}",
            a.shape(),
            b.shape()
        )));
    }
    Ok(Value::Tensor(a + &b))
}

fn op_relu(operand: Value) -> Result<Value, RuntimeError> {
    let mut a = operand.into_tensor();
    a.mapv_inplace(|v| v.max(0.0));
    Ok(Value::Tensor(a))
}

fn op_sigmoid(operand: Value) -> Result<Value, RuntimeError> {
    let mut a = operand.into_tensor();
    a.mapv_inplace(|x| {
        if x >= 0.0 {
            1.0 / (1.0 + (-x).exp())
        } else {
            let e = x.exp();
            e / (1.0 + e)
        }
    });
    Ok(Value::Tensor(a))
}

// --- Convolution ---

/// Direct 2D convolution.
/// Input: [N, C_in, H, W], Weight: [C_out, C_in/groups, kH, kW], Bias: [C_out]
fn op_conv2d(
    input: Value,
    weight: Value,
    bias: Option<Value>,
    stride: (usize, usize),
    padding: (usize, usize),
    dilation: (usize, usize),
    groups: usize,
) -> Result<Value, RuntimeError> {
    let input_arr = into_array4(input, "Conv2d input")?;
    let weight_arr = into_array4(weight, "Conv2d weight")?;

    let (batch_size, in_channels, in_h, in_w) = input_arr.dim();
    let (out_channels, weight_in_channels, kernel_h, kernel_w) = weight_arr.dim();

    if groups == 0 || in_channels != weight_in_channels * groups || out_channels % groups != 0 {
        return Err(RuntimeError::ShapeError(format!(
            "Conv2d: input channels {} and output channels {} do not match weight_in_channels {} * groups {}",
            in_channels, out_channels, weight_in_channels, groups
        )));
    }
    if kernel_h == 0 || kernel_w == 0 || stride.0 == 0 || stride.1 == 0 || dilation.0 == 0 || dilation.1 == 0 {
        return Err(RuntimeError::ShapeError(
            "Conv2d: kernel, stride and dilation must be non-zero".to_string(),
        ));
    }

    let bias_arr = match bias {
        Some(b) => Some(into_vector(b, out_channels, "Conv2d bias")?),
        None => None,
    };

    let (stride_h, stride_w) = stride;
    let (pad_h, pad_w) = padding;
    let (dil_h, dil_w) = dilation;

    // Effective kernel size with dilation
    let effective_kernel_h = (kernel_h - 1) * dil_h + 1;
    let effective_kernel_w = (kernel_w - 1) * dil_w + 1;
    let out_h = (in_h + 2 * pad_h)
        .checked_sub(effective_kernel_h)
        .map(|v| v / stride_h + 1);
    let out_w = (in_w + 2 * pad_w)
        .checked_sub(effective_kernel_w)
        .map(|v| v / stride_w + 1);
    let (out_h, out_w) = match (out_h, out_w) {
        (Some(h), Some(w)) => (h, w),
        _ => {
            return Err(RuntimeError::ShapeError(format!(
                "Conv2d: padded input {}x{} is smaller than the dilated kernel {}x{}",
                in_h + 2 * pad_h,
                in_w + 2 * pad_w,
                effective_kernel_h,
                effective_kernel_w
            )))
        }
    };

    let mut output = Array4::<f32>::zeros((batch_size, out_channels, out_h, out_w));

    let out_channels_per_group = out_channels / groups;

    Zip::from(output.outer_iter_mut())
        .and(input_arr.outer_iter())
        .par_for_each(|mut out_sample, x_sample| {
            for out_ch in 0..out_channels {
                let in_ch_start = (out_ch / out_channels_per_group) * weight_in_channels;
                let b = bias_arr.as_ref().map_or(0.0, |b| b[out_ch]);

                for oh in 0..out_h {
                    for ow in 0..out_w {
                        let mut sum = b;

                        for ic in 0..weight_in_channels {
                            let in_ch = in_ch_start + ic;
                            for kh in 0..kernel_h {
                                let ih = (oh * stride_h + kh * dil_h) as isize - pad_h as isize;
                                if ih < 0 || ih >= in_h as isize {
                                    continue;
                                }
                                for kw in 0..kernel_w {
                                    let iw = (ow * stride_w + kw * dil_w) as isize - pad_w as isize;
                                    if iw >= 0 && iw < in_w as isize {
                                        sum += x_sample[[in_ch, ih as usize, iw as usize]]
                                            * weight_arr[[out_ch, ic, kh, kw]];
                                    }
                                }
                            }
                        }

                        out_sample[[out_ch, oh, ow]] = sum;
                    }
                }
            }
        });

    Ok(Value::Tensor(output.into_dyn()))
}

// --- Batch normalization ---

struct BatchNormStats {
    running_mean: Value,
    running_var: Value,
}

/// Applies `y = x * scale[c] + shift[c]` channel by channel.
fn normalize_channels(
    input: Array4<f32>,
    scale: &Array1<f32>,
    shift: &Array1<f32>,
) -> ArrayD<f32> {
    let mut output = input;
    for (c, mut plane) in output.axis_iter_mut(Axis(1)).enumerate() {
        let (k, b) = (scale[c], shift[c]);
        plane.mapv_inplace(|v| v * k + b);
    }
    output.into_dyn()
}

fn op_batch_norm2d_eval(
    input: Value,
    gamma: Value,
    beta: Value,
    stats: BatchNormStats,
    eps: f32,
) -> Result<Value, RuntimeError> {
    let input_arr = into_array4(input, "BatchNorm2d input")?;
    let channels = input_arr.dim().1;
    let gamma = into_vector(gamma, channels, "BatchNorm2d weight")?;
    let beta = into_vector(beta, channels, "BatchNorm2d bias")?;
    let mean = into_vector(stats.running_mean, channels, "BatchNorm2d running_mean")?;
    let var = into_vector(stats.running_var, channels, "BatchNorm2d running_var")?;

    let scale = Zip::from(&gamma).and(&var).map_collect(|&g, &v| g / (v + eps).sqrt());
    let shift = Zip::from(&beta).and(&mean).and(&scale).map_collect(|&b, &m, &k| b - m * k);

    Ok(Value::Tensor(normalize_channels(input_arr, &scale, &shift)))
}

/// Normalizes with batch statistics and returns the updated running mean and
/// variance alongside the output.
fn op_batch_norm2d_train(
    input: Value,
    gamma: Value,
    beta: Value,
    stats: BatchNormStats,
    eps: f32,
    momentum: f32,
) -> Result<(Value, Value, Value), RuntimeError> {
    let input_arr = into_array4(input, "BatchNorm2d input")?;
    let (n, channels, h, w) = input_arr.dim();
    let gamma = into_vector(gamma, channels, "BatchNorm2d weight")?;
    let beta = into_vector(beta, channels, "BatchNorm2d bias")?;
    let running_mean = into_vector(stats.running_mean, channels, "BatchNorm2d running_mean")?;
    let running_var = into_vector(stats.running_var, channels, "BatchNorm2d running_var")?;

    let count = n * h * w;
    if count <= 1 {
        return Err(RuntimeError::ComputationError(format!(
            "BatchNorm2d: expected more than 1 value per channel when training, got input shape {:?}",
            input_arr.shape()
        )));
    }

    let mut mean = Array1::<f32>::zeros(channels);
    let mut var = Array1::<f32>::zeros(channels);
    for (c, plane) in input_arr.axis_iter(Axis(1)).enumerate() {
        let m = plane.sum() / count as f32;
        mean[c] = m;
        var[c] = plane.fold(0.0, |acc, &v| acc + (v - m) * (v - m)) / count as f32;
    }

    let scale = Zip::from(&gamma).and(&var).map_collect(|&g, &v| g / (v + eps).sqrt());
    let shift = Zip::from(&beta).and(&mean).and(&scale).map_collect(|&b, &m, &k| b - m * k);
    let output = normalize_channels(input_arr, &scale, &shift);

    let unbiased = count as f32 / (count - 1) as f32;
    let new_mean = Zip::from(&running_mean)
        .and(&mean)
        .map_collect(|&r, &m| (1.0 - momentum) * r + momentum * m);
    let new_var = Zip::from(&running_var)
        .and(&var)
        .map_collect(|&r, &v| (1.0 - momentum) * r + momentum * v * unbiased);

    Ok((
        Value::Tensor(output),
        Value::Tensor(new_mean.into_dyn()),
        Value::Tensor(new_var.into_dyn()),
    ))
}

// --- Resizing ---

/// Source index pair and weight of the second index for every output position.
fn interpolation_table(in_len: usize, out_len: usize, align_corners: bool) -> Vec<(usize, usize, f32)> {
    let scale = if align_corners {
        if out_len > 1 {
            (in_len as f32 - 1.0) / (out_len as f32 - 1.0)
        } else {
            0.0
        }
    } else {
        in_len as f32 / out_len as f32
    };

    (0..out_len)
        .map(|dst| {
            let src = if align_corners {
                dst as f32 * scale
            } else {
                ((dst as f32 + 0.5) * scale - 0.5).max(0.0)
            };
            let i0 = (src.floor() as usize).min(in_len - 1);
            let i1 = (i0 + 1).min(in_len - 1);
            let lambda = if i1 == i0 { 0.0 } else { src - i0 as f32 };
            (i0, i1, lambda)
        })
        .collect()
}

/// Bilinear resize of the two trailing axes of a `[N, C, H, W]` tensor.
fn op_resize_bilinear(
    input: Value,
    size: (usize, usize),
    align_corners: bool,
) -> Result<Value, RuntimeError> {
    let input_arr = into_array4(input, "ResizeBilinear input")?;
    let (n, c, in_h, in_w) = input_arr.dim();
    let (out_h, out_w) = size;

    if in_h == 0 || in_w == 0 || out_h == 0 || out_w == 0 {
        return Err(RuntimeError::ShapeError(format!(
            "ResizeBilinear: cannot resize {}x{} to {}x{}",
            in_h, in_w, out_h, out_w
        )));
    }
    if (in_h, in_w) == (out_h, out_w) {
        return Ok(Value::Tensor(input_arr.into_dyn()));
    }

    let rows = interpolation_table(in_h, out_h, align_corners);
    let cols = interpolation_table(in_w, out_w, align_corners);

    let mut output = Array4::<f32>::zeros((n, c, out_h, out_w));
    Zip::from(output.outer_iter_mut())
        .and(input_arr.outer_iter())
        .par_for_each(|mut out_sample, x_sample| {
            for ch in 0..c {
                for (oh, &(h0, h1, lh)) in rows.iter().enumerate() {
                    for (ow, &(w0, w1, lw)) in cols.iter().enumerate() {
                        let top = (1.0 - lw) * x_sample[[ch, h0, w0]] + lw * x_sample[[ch, h0, w1]];
                        let bottom = (1.0 - lw) * x_sample[[ch, h1, w0]] + lw * x_sample[[ch, h1, w1]];
                        out_sample[[ch, oh, ow]] = (1.0 - lh) * top + lh * bottom;
                    }
                }
            }
        });

    Ok(Value::Tensor(output.into_dyn()))
}

// --- Dropout ---

/// Zeroes whole `(n, c)` feature maps with probability `p` and rescales the
/// survivors by `1 / (1 - p)`.
fn op_dropout2d(input: Value, p: f32, rng: &mut StdRng) -> Result<Value, RuntimeError> {
    if !(0.0..1.0).contains(&p) {
        return Err(RuntimeError::ComputationError(format!(
            "Dropout2d: probability must be in [0, 1), got {}",
            p
        )));
    }
    let mut input_arr = into_array4(input, "Dropout2d input")?;
    if p == 0.0 {
        return Ok(Value::Tensor(input_arr.into_dyn()));
    }

    let keep_scale = 1.0 / (1.0 - p);
    for mut sample in input_arr.outer_iter_mut() {
        for mut plane in sample.outer_iter_mut() {
            if rng.gen::<f32>() < p {
                plane.fill(0.0);
            } else {
                plane.mapv_inplace(|v| v * keep_scale);
            }
        }
    }
    Ok(Value::Tensor(input_arr.into_dyn()))
}

// --- Pooling ---

/// Average pooling. Zero padding is counted in the divisor.
fn op_avg_pool2d(
    operand: Value,
    kernel_size: (usize, usize),
    stride: (usize, usize),
    padding: (usize, usize),
) -> Result<Value, RuntimeError> {
    let input_arr = into_array4(operand, "AvgPool2d input")?;

    let (n, c, h, w) = input_arr.dim();
    let (kh, kw) = kernel_size;
    let (sh, sw) = stride;
    let (pad_h, pad_w) = padding;

    if kh == 0 || kw == 0 || sh == 0 || sw == 0 || h + 2 * pad_h < kh || w + 2 * pad_w < kw {
        return Err(RuntimeError::ShapeError(format!(
            "AvgPool2d: kernel {:?} with stride {:?} does not fit padded input {}x{}",
            kernel_size,
            stride,
            h + 2 * pad_h,
            w + 2 * pad_w
        )));
    }

    let out_h = (h + 2 * pad_h - kh) / sh + 1;
    let out_w = (w + 2 * pad_w - kw) / sw + 1;

    let kernel_area = (kh * kw) as f32;
    let plane_len = out_h * out_w;

    // One output plane per (n, c), computed in parallel.
    let mut data = vec![0.0f32; n * c * plane_len];
    data.par_chunks_mut(plane_len.max(1)).enumerate().for_each(|(plane, out)| {
        let (n_idx, c_idx) = (plane / c, plane % c);
        for (i, out_val) in out.iter_mut().enumerate() {
            let (oh, ow) = (i / out_w, i % out_w);
            let mut sum = 0.0f32;
            for khh in 0..kh {
                let ih = (oh * sh + khh) as isize - pad_h as isize;
                if ih < 0 || ih >= h as isize {
                    continue;
                }
                for kww in 0..kw {
                    let iw = (ow * sw + kww) as isize - pad_w as isize;
                    if iw >= 0 && iw < w as isize {
                        sum += input_arr[[n_idx, c_idx, ih as usize, iw as usize]];
                    }
                }
            }
            *out_val = sum / kernel_area;
        }
    });

    let output = Array4::from_shape_vec((n, c, out_h, out_w), data)
        .map_err(|e| RuntimeError::ComputationError(format!("AvgPool2d: {}", e)))?;
    Ok(Value::Tensor(output.into_dyn()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    fn tensor(arr: Array4<f32>) -> Value {
        Value::Tensor(arr.into_dyn())
    }

    #[test]
    fn test_interpolation_table_align_corners() {
        let table = interpolation_table(3, 5, true);
        assert_eq!(table[0], (0, 1, 0.0));
        assert_eq!(table[1], (0, 1, 0.5));
        assert_eq!(table[2], (1, 2, 0.0));
        assert_eq!(table[4], (2, 2, 0.0));

        // A single output samples the first row.
        assert_eq!(interpolation_table(4, 1, true), vec![(0, 1, 0.0)]);
    }

    #[test]
    fn test_interpolation_table_half_pixel() {
        let table = interpolation_table(2, 4, false);
        // src = (dst + 0.5) * 0.5 - 0.5 -> [-0.25 (clamped), 0.25, 0.75, 1.25]
        assert_eq!(table[0], (0, 1, 0.0));
        assert_eq!(table[1], (0, 1, 0.25));
        assert_eq!(table[2], (0, 1, 0.75));
        assert_eq!(table[3], (1, 1, 0.0));
    }

    #[test]
    fn test_conv_grouped_matches_per_channel_scaling() {
        // Depthwise 1x1 conv with weights [2, 3] scales each channel.
        let x = Array::from_shape_vec((1, 2, 1, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let w = Array::from_shape_vec((2, 1, 1, 1), vec![2.0, 3.0]).unwrap();
        let out = op_conv2d(tensor(x), tensor(w), None, (1, 1), (0, 0), (1, 1), 2)
            .unwrap()
            .into_tensor();
        assert_eq!(out.into_raw_vec(), vec![2.0, 4.0, 9.0, 12.0]);
    }

    #[test]
    fn test_conv_kernel_larger_than_input_is_error() {
        let x = Array4::<f32>::zeros((1, 1, 2, 2));
        let w = Array4::<f32>::zeros((1, 1, 3, 3));
        let err = op_conv2d(tensor(x), tensor(w), None, (1, 1), (0, 0), (1, 1), 1).unwrap_err();
        assert!(matches!(err, RuntimeError::ShapeError(_)));
    }

    #[test]
    fn test_batch_norm_train_single_value_per_channel() {
        let x = Array4::<f32>::ones((1, 2, 1, 1));
        let stats = BatchNormStats {
            running_mean: Value::Tensor(array![0.0f32, 0.0].into_dyn()),
            running_var: Value::Tensor(array![1.0f32, 1.0].into_dyn()),
        };
        let err = op_batch_norm2d_train(
            tensor(x),
            Value::Tensor(array![1.0f32, 1.0].into_dyn()),
            Value::Tensor(array![0.0f32, 0.0].into_dyn()),
            stats,
            1e-5,
            0.1,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::ComputationError(_)));
    }

    #[test]
    fn test_dropout_drops_whole_planes() {
        let x = Array4::<f32>::ones((4, 8, 3, 3));
        let mut rng = StdRng::seed_from_u64(7);
        let out = op_dropout2d(tensor(x), 0.5, &mut rng).unwrap().into_tensor();
        let out = out.into_dimensionality::<Ix4>().unwrap();
        for sample in out.outer_iter() {
            for plane in sample.outer_iter() {
                let first = plane[[0, 0]];
                assert!(first == 0.0 || first == 2.0);
                assert!(plane.iter().all(|&v| v == first));
            }
        }
    }

    #[test]
    fn test_avg_pool_keeps_planes_apart() {
        // Plane (n, c) is filled with 10 * n + c.
        let x = Array4::from_shape_fn((2, 3, 4, 4), |(n, c, _, _)| (10 * n + c) as f32);
        let out = op_avg_pool2d(tensor(x), (2, 2), (2, 2), (0, 0)).unwrap().into_tensor();
        let out = out.into_dimensionality::<Ix4>().unwrap();
        assert_eq!(out.dim(), (2, 3, 2, 2));
        for ((n, c, _, _), v) in out.indexed_iter() {
            assert_eq!(*v, (10 * n + c) as f32);
        }
    }

    #[test]
    fn test_zero_stride_and_empty_kernel_are_errors() {
        let x = Array4::<f32>::ones((1, 1, 4, 4));
        assert!(op_avg_pool2d(tensor(x.clone()), (2, 2), (0, 1), (0, 0)).is_err());

        let w = Array4::<f32>::ones((1, 1, 0, 1));
        let err = op_conv2d(tensor(x), tensor(w), None, (1, 1), (0, 0), (1, 1), 1).unwrap_err();
        assert!(matches!(err, RuntimeError::ShapeError(_)));
    }

    #[test]
    fn test_add_rejects_shape_mismatch() {
        let a = Array4::<f32>::zeros((1, 2, 3, 3));
        let b = Array4::<f32>::zeros((1, 2, 4, 4));
        assert!(op_add(tensor(a), tensor(b)).is_err());
    }
}
