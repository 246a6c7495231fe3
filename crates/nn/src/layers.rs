//! Layers with explicit forward and backward passes over a single example.
//!
//! Parameters live outside the layers in a flat `Vec<Tensor>`; each layer
//! remembers the indices of its own tensors. A forward pass returns a cache
//! that the matching backward pass consumes, and backward passes add their
//! parameter gradients into a tree laid out like the parameters. Because
//! only one example flows through at a time, every gradient produced here
//! is a per-example gradient.

use dpresnet_core::{DpError, Result, Scalar, Tensor};
use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis, Ix1, Ix2, Slice, Zip};
use rand::Rng;
use rand_distr::{Distribution, Normal};

/// Activations of one example, laid out as channels × height × width.
pub type Feature = Array3<Scalar>;

/// Default epsilon added to the group variance.
pub const GROUP_NORM_EPS: f64 = 1e-5;

fn push_param(params: &mut Vec<Tensor>, tensor: Tensor) -> usize {
    params.push(tensor);
    params.len() - 1
}

fn param<'a>(params: &'a [Tensor], idx: usize, shape: &[usize]) -> Result<&'a Tensor> {
    let tensor = params
        .get(idx)
        .ok_or_else(|| DpError::invalid(format!("missing parameter tensor {idx}")))?;
    if tensor.shape() != shape {
        return Err(DpError::shape(shape, tensor.shape()));
    }
    Ok(tensor)
}

fn view1<'a>(params: &'a [Tensor], idx: usize, len: usize) -> Result<ArrayView1<'a, Scalar>> {
    param(params, idx, &[len])?
        .view()
        .into_dimensionality::<Ix1>()
        .map_err(|e| DpError::numerical(e.to_string()))
}

fn view2<'a>(
    params: &'a [Tensor],
    idx: usize,
    rows: usize,
    cols: usize,
) -> Result<ArrayView2<'a, Scalar>> {
    param(params, idx, &[rows, cols])?
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| DpError::numerical(e.to_string()))
}

fn accumulate(grads: &mut [Tensor], idx: usize, grad: &Tensor) -> Result<()> {
    let slot = grads
        .get_mut(idx)
        .ok_or_else(|| DpError::invalid(format!("missing gradient tensor {idx}")))?;
    if slot.shape() != grad.shape() {
        return Err(DpError::shape(slot.shape(), grad.shape()));
    }
    *slot += grad;
    Ok(())
}

fn uniform_tensor<R: Rng + ?Sized>(shape: &[usize], bound: f64, rng: &mut R) -> Tensor {
    Tensor::from_shape_fn(shape, |_| rng.gen_range(-bound..bound) as Scalar)
}

fn window_output(size: usize, kernel: usize, stride: usize, padding: usize) -> Result<usize> {
    if stride == 0 {
        return Err(DpError::invalid("stride must be positive"));
    }
    let padded = size + 2 * padding;
    if kernel == 0 || kernel > padded {
        return Err(DpError::invalid(format!(
            "kernel {kernel} does not fit input of size {size} with padding {padding}"
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// Shape parameters of a 2-D convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Conv2dSpec {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Side of the square kernel.
    pub kernel_size: usize,
    /// Stride in both directions.
    pub stride: usize,
    /// Zero padding on every side.
    pub padding: usize,
    /// Whether the layer has a bias.
    pub bias: bool,
}

impl Conv2dSpec {
    /// A bias-free convolution with stride 1 and no padding.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            padding: 0,
            bias: false,
        }
    }

    /// Set the stride.
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    /// Set the padding.
    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Enable or disable the bias.
    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    fn patch_len(&self) -> usize {
        self.in_channels * self.kernel_size * self.kernel_size
    }
}

/// 2-D convolution computed with im2col and a matrix product.
#[derive(Clone, Debug)]
pub struct Conv2d {
    spec: Conv2dSpec,
    weight: usize,
    bias: Option<usize>,
}

/// Values saved by [`Conv2d::forward`].
#[derive(Clone, Debug)]
pub struct ConvCache {
    cols: Array2<Scalar>,
    input_dim: (usize, usize, usize),
    output_hw: (usize, usize),
}

impl Conv2d {
    /// Register the layer's parameters and initialize them.
    ///
    /// Weights use Kaiming-normal initialization in fan-out mode for ReLU,
    /// the bias (if any) is uniform in `±1/sqrt(fan_in)`.
    pub fn new<R: Rng + ?Sized>(
        spec: Conv2dSpec,
        params: &mut Vec<Tensor>,
        rng: &mut R,
    ) -> Result<Self> {
        if spec.in_channels == 0 || spec.out_channels == 0 || spec.kernel_size == 0 {
            return Err(DpError::invalid("convolution dimensions must be positive"));
        }
        if spec.stride == 0 {
            return Err(DpError::invalid("stride must be positive"));
        }
        let k = spec.kernel_size;
        let fan_out = (spec.out_channels * k * k) as f64;
        let std = (2.0 / fan_out).sqrt();
        let normal = Normal::new(0.0, std).map_err(|e| DpError::numerical(e.to_string()))?;
        let weight = Tensor::from_shape_fn(&[spec.out_channels, spec.in_channels, k, k][..], |_| {
            normal.sample(rng) as Scalar
        });
        let weight = push_param(params, weight);

        let bias = if spec.bias {
            let bound = 1.0 / (spec.patch_len() as f64).sqrt();
            Some(push_param(
                params,
                uniform_tensor(&[spec.out_channels], bound, rng),
            ))
        } else {
            None
        };

        Ok(Self { spec, weight, bias })
    }

    /// Layer shape parameters.
    pub fn spec(&self) -> &Conv2dSpec {
        &self.spec
    }

    /// Spatial output size for an `h × w` input.
    pub fn output_size(&self, h: usize, w: usize) -> Result<(usize, usize)> {
        let k = self.spec.kernel_size;
        Ok((
            window_output(h, k, self.spec.stride, self.spec.padding)?,
            window_output(w, k, self.spec.stride, self.spec.padding)?,
        ))
    }

    fn im2col(&self, x: &Feature, ho: usize, wo: usize) -> Array2<Scalar> {
        let (c, h, w) = x.dim();
        let k = self.spec.kernel_size;
        let stride = self.spec.stride;
        let pad = self.spec.padding;
        let mut cols = Array2::zeros((c * k * k, ho * wo));
        for ci in 0..c {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (ci * k + ki) * k + kj;
                    for oh in 0..ho {
                        let ih = oh * stride + ki;
                        if ih < pad || ih - pad >= h {
                            continue;
                        }
                        for ow in 0..wo {
                            let iw = ow * stride + kj;
                            if iw < pad || iw - pad >= w {
                                continue;
                            }
                            cols[[row, oh * wo + ow]] = x[[ci, ih - pad, iw - pad]];
                        }
                    }
                }
            }
        }
        cols
    }

    fn col2im(&self, cols: &Array2<Scalar>, cache: &ConvCache) -> Feature {
        let (c, h, w) = cache.input_dim;
        let (ho, wo) = cache.output_hw;
        let k = self.spec.kernel_size;
        let stride = self.spec.stride;
        let pad = self.spec.padding;
        let mut dx = Feature::zeros((c, h, w));
        for ci in 0..c {
            for ki in 0..k {
                for kj in 0..k {
                    let row = (ci * k + ki) * k + kj;
                    for oh in 0..ho {
                        let ih = oh * stride + ki;
                        if ih < pad || ih - pad >= h {
                            continue;
                        }
                        for ow in 0..wo {
                            let iw = ow * stride + kj;
                            if iw < pad || iw - pad >= w {
                                continue;
                            }
                            dx[[ci, ih - pad, iw - pad]] += cols[[row, oh * wo + ow]];
                        }
                    }
                }
            }
        }
        dx
    }

    /// Convolve one example.
    pub fn forward(&self, params: &[Tensor], x: &Feature) -> Result<(Feature, ConvCache)> {
        let (c, h, w) = x.dim();
        if c != self.spec.in_channels {
            return Err(DpError::shape(&[self.spec.in_channels, h, w], x.shape()));
        }
        let (ho, wo) = self.output_size(h, w)?;
        let out = self.spec.out_channels;
        let k = self.spec.kernel_size;

        let weight = param(params, self.weight, &[out, c, k, k])?;
        let w2 = weight
            .to_shape((out, self.spec.patch_len()))
            .map_err(|e| DpError::numerical(e.to_string()))?;
        let cols = self.im2col(x, ho, wo);
        let mut y = w2.dot(&cols);
        if let Some(bias) = self.bias {
            let b = view1(params, bias, out)?;
            for (mut row, &bv) in y.axis_iter_mut(Axis(0)).zip(b.iter()) {
                row += bv;
            }
        }
        let y = y
            .into_shape_with_order((out, ho, wo))
            .map_err(|e| DpError::numerical(e.to_string()))?;

        Ok((
            y,
            ConvCache {
                cols,
                input_dim: (c, h, w),
                output_hw: (ho, wo),
            },
        ))
    }

    /// Propagate `dy` back through the layer, returning the input gradient.
    pub fn backward(
        &self,
        params: &[Tensor],
        cache: &ConvCache,
        dy: &Feature,
        grads: &mut [Tensor],
    ) -> Result<Feature> {
        let out = self.spec.out_channels;
        let (ho, wo) = cache.output_hw;
        if dy.dim() != (out, ho, wo) {
            return Err(DpError::shape(&[out, ho, wo], dy.shape()));
        }
        let k = self.spec.kernel_size;
        let weight = param(params, self.weight, &[out, self.spec.in_channels, k, k])?;
        let w2 = weight
            .to_shape((out, self.spec.patch_len()))
            .map_err(|e| DpError::numerical(e.to_string()))?;
        let dy2 = dy
            .to_shape((out, ho * wo))
            .map_err(|e| DpError::numerical(e.to_string()))?;

        let dw = dy2
            .dot(&cache.cols.t())
            .into_shape_with_order(weight.raw_dim())
            .map_err(|e| DpError::numerical(e.to_string()))?;
        accumulate(grads, self.weight, &dw)?;
        if let Some(bias) = self.bias {
            accumulate(grads, bias, &dy2.sum_axis(Axis(1)).into_dyn())?;
        }

        let dcols = w2.t().dot(&dy2);
        Ok(self.col2im(&dcols, cache))
    }
}

/// Group normalization over (channels-in-group × H × W) with a per-channel affine.
#[derive(Clone, Debug)]
pub struct GroupNorm {
    num_groups: usize,
    num_channels: usize,
    eps: f64,
    weight: usize,
    bias: usize,
}

/// Values saved by [`GroupNorm::forward`].
#[derive(Clone, Debug)]
pub struct GroupNormCache {
    x_hat: Feature,
    inv_std: Vec<Scalar>,
}

impl GroupNorm {
    /// Register a group norm with unit scale and zero shift.
    pub fn new(num_groups: usize, num_channels: usize, params: &mut Vec<Tensor>) -> Result<Self> {
        if num_groups == 0 || num_channels == 0 || num_channels % num_groups != 0 {
            return Err(DpError::invalid(format!(
                "{num_channels} channels cannot be split into {num_groups} groups"
            )));
        }
        let weight = push_param(params, Tensor::ones(&[num_channels][..]));
        let bias = push_param(params, Tensor::zeros(&[num_channels][..]));
        Ok(Self {
            num_groups,
            num_channels,
            eps: GROUP_NORM_EPS,
            weight,
            bias,
        })
    }

    /// Number of groups.
    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    /// Number of channels.
    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    fn channels_per_group(&self) -> usize {
        self.num_channels / self.num_groups
    }

    /// Normalize one example.
    pub fn forward(&self, params: &[Tensor], x: &Feature) -> Result<(Feature, GroupNormCache)> {
        let (c, h, w) = x.dim();
        if c != self.num_channels {
            return Err(DpError::shape(&[self.num_channels, h, w], x.shape()));
        }
        let gamma = view1(params, self.weight, c)?;
        let beta = view1(params, self.bias, c)?;
        let cpg = self.channels_per_group();
        let n = (cpg * h * w) as Scalar;
        let eps = self.eps as Scalar;

        let mut x_hat = Feature::zeros((c, h, w));
        let mut inv_std = Vec::with_capacity(self.num_groups);
        for g in 0..self.num_groups {
            let range = g * cpg..(g + 1) * cpg;
            let group = x.slice_axis(Axis(0), Slice::from(range.clone()));
            let mean = group.sum() / n;
            let var = group.mapv(|v| (v - mean) * (v - mean)).sum() / n;
            let inv = 1.0 / (var + eps).sqrt();
            x_hat
                .slice_axis_mut(Axis(0), Slice::from(range))
                .assign(&group.mapv(|v| (v - mean) * inv));
            inv_std.push(inv);
        }

        let mut y = x_hat.clone();
        for (ci, mut plane) in y.axis_iter_mut(Axis(0)).enumerate() {
            let (scale, shift) = (gamma[ci], beta[ci]);
            plane.mapv_inplace(|v| v * scale + shift);
        }
        Ok((y, GroupNormCache { x_hat, inv_std }))
    }

    /// Propagate `dy` back through the layer, returning the input gradient.
    pub fn backward(
        &self,
        params: &[Tensor],
        cache: &GroupNormCache,
        dy: &Feature,
        grads: &mut [Tensor],
    ) -> Result<Feature> {
        if dy.dim() != cache.x_hat.dim() {
            return Err(DpError::shape(cache.x_hat.shape(), dy.shape()));
        }
        let (c, h, w) = dy.dim();
        let gamma = view1(params, self.weight, c)?;

        let mut dgamma = Array1::<Scalar>::zeros(c);
        let mut dbeta = Array1::<Scalar>::zeros(c);
        let mut dx_hat = dy.clone();
        for ci in 0..c {
            let dy_c = dy.index_axis(Axis(0), ci);
            let xh_c = cache.x_hat.index_axis(Axis(0), ci);
            dgamma[ci] = (&dy_c * &xh_c).sum();
            dbeta[ci] = dy_c.sum();
            let scale = gamma[ci];
            dx_hat
                .index_axis_mut(Axis(0), ci)
                .mapv_inplace(|v| v * scale);
        }
        accumulate(grads, self.weight, &dgamma.into_dyn())?;
        accumulate(grads, self.bias, &dbeta.into_dyn())?;

        let cpg = self.channels_per_group();
        let n = (cpg * h * w) as Scalar;
        let mut dx = Feature::zeros((c, h, w));
        for (g, &inv) in cache.inv_std.iter().enumerate() {
            let range = g * cpg..(g + 1) * cpg;
            let dxh = dx_hat.slice_axis(Axis(0), Slice::from(range.clone()));
            let xh = cache.x_hat.slice_axis(Axis(0), Slice::from(range.clone()));
            let mean_dxh = dxh.sum() / n;
            let mean_dxh_xh = (&dxh * &xh).sum() / n;
            let grad = (&dxh - mean_dxh - &xh * mean_dxh_xh) * inv;
            dx.slice_axis_mut(Axis(0), Slice::from(range)).assign(&grad);
        }
        Ok(dx)
    }
}

/// Fully connected layer `y = W x + b`.
#[derive(Clone, Debug)]
pub struct Linear {
    in_features: usize,
    out_features: usize,
    weight: usize,
    bias: usize,
}

/// Values saved by [`Linear::forward`].
#[derive(Clone, Debug)]
pub struct LinearCache {
    input: Array1<Scalar>,
}

impl Linear {
    /// Register a linear layer; weight and bias are uniform in `±1/sqrt(in_features)`.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        params: &mut Vec<Tensor>,
        rng: &mut R,
    ) -> Result<Self> {
        if in_features == 0 || out_features == 0 {
            return Err(DpError::invalid("linear dimensions must be positive"));
        }
        let bound = 1.0 / (in_features as f64).sqrt();
        let weight = push_param(params, uniform_tensor(&[out_features, in_features], bound, rng));
        let bias = push_param(params, uniform_tensor(&[out_features], bound, rng));
        Ok(Self {
            in_features,
            out_features,
            weight,
            bias,
        })
    }

    /// Input width.
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width.
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Apply the layer to one example.
    pub fn forward(
        &self,
        params: &[Tensor],
        x: &Array1<Scalar>,
    ) -> Result<(Array1<Scalar>, LinearCache)> {
        if x.len() != self.in_features {
            return Err(DpError::shape(&[self.in_features], x.shape()));
        }
        let w = view2(params, self.weight, self.out_features, self.in_features)?;
        let b = view1(params, self.bias, self.out_features)?;
        let y = w.dot(x) + &b;
        Ok((y, LinearCache { input: x.clone() }))
    }

    /// Propagate `dy` back through the layer, returning the input gradient.
    pub fn backward(
        &self,
        params: &[Tensor],
        cache: &LinearCache,
        dy: &Array1<Scalar>,
        grads: &mut [Tensor],
    ) -> Result<Array1<Scalar>> {
        if dy.len() != self.out_features {
            return Err(DpError::shape(&[self.out_features], dy.shape()));
        }
        let w = view2(params, self.weight, self.out_features, self.in_features)?;
        let dw = dy
            .view()
            .insert_axis(Axis(1))
            .dot(&cache.input.view().insert_axis(Axis(0)));
        accumulate(grads, self.weight, &dw.into_dyn())?;
        accumulate(grads, self.bias, &dy.clone().into_dyn())?;
        Ok(w.t().dot(dy))
    }
}

/// Max pooling over square windows; padded positions never win.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxPool2d {
    /// Window side.
    pub kernel_size: usize,
    /// Stride in both directions.
    pub stride: usize,
    /// Implicit negative-infinity padding.
    pub padding: usize,
}

/// Values saved by [`MaxPool2d::forward`].
#[derive(Clone, Debug)]
pub struct MaxPoolCache {
    argmax: Array3<usize>,
    input_dim: (usize, usize, usize),
}

impl MaxPool2d {
    /// Create a pooling layer.
    pub fn new(kernel_size: usize, stride: usize, padding: usize) -> Self {
        Self {
            kernel_size,
            stride,
            padding,
        }
    }

    /// Pool one example.
    pub fn forward(&self, x: &Feature) -> Result<(Feature, MaxPoolCache)> {
        if 2 * self.padding > self.kernel_size {
            return Err(DpError::invalid("padding must be at most half the kernel size"));
        }
        let (c, h, w) = x.dim();
        let ho = window_output(h, self.kernel_size, self.stride, self.padding)?;
        let wo = window_output(w, self.kernel_size, self.stride, self.padding)?;
        let pad = self.padding;

        let mut y = Feature::from_elem((c, ho, wo), Scalar::NEG_INFINITY);
        let mut argmax = Array3::<usize>::zeros((c, ho, wo));
        for ci in 0..c {
            for oh in 0..ho {
                for ow in 0..wo {
                    let mut best = Scalar::NEG_INFINITY;
                    let mut best_idx = 0;
                    for ki in 0..self.kernel_size {
                        let ih = oh * self.stride + ki;
                        if ih < pad || ih - pad >= h {
                            continue;
                        }
                        for kj in 0..self.kernel_size {
                            let iw = ow * self.stride + kj;
                            if iw < pad || iw - pad >= w {
                                continue;
                            }
                            let v = x[[ci, ih - pad, iw - pad]];
                            if v > best {
                                best = v;
                                best_idx = (ih - pad) * w + (iw - pad);
                            }
                        }
                    }
                    y[[ci, oh, ow]] = best;
                    argmax[[ci, oh, ow]] = best_idx;
                }
            }
        }
        Ok((
            y,
            MaxPoolCache {
                argmax,
                input_dim: (c, h, w),
            },
        ))
    }

    /// Route `dy` back to the winning input positions.
    pub fn backward(&self, cache: &MaxPoolCache, dy: &Feature) -> Result<Feature> {
        if dy.dim() != cache.argmax.dim() {
            return Err(DpError::shape(cache.argmax.shape(), dy.shape()));
        }
        let (c, h, w) = cache.input_dim;
        let mut dx = Feature::zeros((c, h, w));
        for ((ci, oh, ow), &g) in dy.indexed_iter() {
            let idx = cache.argmax[[ci, oh, ow]];
            dx[[ci, idx / w, idx % w]] += g;
        }
        Ok(dx)
    }
}

/// Elementwise `max(x, 0)`.
pub fn relu(x: &Feature) -> Feature {
    x.mapv(|v| v.max(0.0))
}

/// Gradient of [`relu`] given its output.
pub fn relu_backward(output: &Feature, dy: &Feature) -> Feature {
    let mut dx = dy.clone();
    Zip::from(&mut dx).and(output).for_each(|d, &o| {
        if o <= 0.0 {
            *d = 0.0;
        }
    });
    dx
}

/// Mean over the spatial dimensions, one value per channel.
pub fn global_avg_pool(x: &Feature) -> Array1<Scalar> {
    let (_, h, w) = x.dim();
    let area = (h * w).max(1) as Scalar;
    x.sum_axis(Axis(2)).sum_axis(Axis(1)) / area
}

/// Gradient of [`global_avg_pool`] for an input of shape `dim`.
pub fn global_avg_pool_backward(dy: &Array1<Scalar>, dim: (usize, usize, usize)) -> Feature {
    let (c, h, w) = dim;
    let area = (h * w).max(1) as Scalar;
    Feature::from_shape_fn((c, h, w), |(ci, _, _)| dy[ci] / area)
}
