//! ResNet with basic blocks, following the torchvision layout.
//!
//! The network is built from a [`ResNetConfig`]. Only group normalization is
//! executable: batch normalization couples the examples of a batch, which
//! breaks the per-example sensitivity bound that DP-SGD relies on.

use dpresnet_core::{num_elements, zeros_like, DpError, Result, Scalar, Tensor};
use ndarray::Array1;
use rand::Rng;

use crate::layers::{
    global_avg_pool, global_avg_pool_backward, relu, relu_backward, Conv2d, Conv2dSpec,
    ConvCache, Feature, GroupNorm, GroupNormCache, Linear, LinearCache, MaxPool2d, MaxPoolCache,
};
use crate::loss::{argmax, cross_entropy};

/// Input stem of the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stem {
    /// 7×7 stride-2 convolution followed by 3×3 stride-2 max pooling.
    ImageNet,
    /// 3×3 stride-1 convolution without pooling.
    Cifar,
}

/// Normalization used after every convolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NormKind {
    /// Batch normalization; rejected by [`ResNet::new`].
    BatchNorm,
    /// Group normalization with at most `groups` groups per layer.
    GroupNorm {
        /// Requested number of groups.
        groups: usize,
    },
}

/// Architecture description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResNetConfig {
    /// Basic blocks in each stage.
    pub blocks_per_stage: Vec<usize>,
    /// Channel width of each stage.
    pub widths: Vec<usize>,
    /// Image channels.
    pub in_channels: usize,
    /// Output classes.
    pub num_classes: usize,
    /// Input stem.
    pub stem: Stem,
    /// Normalization layers.
    pub norm: NormKind,
}

impl Default for ResNetConfig {
    fn default() -> Self {
        Self::resnet18()
    }
}

/// Position of a normalization layer in the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormSite {
    /// Module path, e.g. `layer2.0.downsample.1`.
    pub name: String,
    /// Channels normalized by the layer.
    pub channels: usize,
}

#[derive(Clone, Copy, Debug)]
struct BlockLayout {
    stage: usize,
    index: usize,
    in_planes: usize,
    planes: usize,
    stride: usize,
    downsample: bool,
}

impl ResNetConfig {
    /// ResNet-18 for 10 classes with the ImageNet stem and batch normalization.
    pub fn resnet18() -> Self {
        Self {
            blocks_per_stage: vec![2, 2, 2, 2],
            widths: vec![64, 128, 256, 512],
            in_channels: 3,
            num_classes: 10,
            stem: Stem::ImageNet,
            norm: NormKind::BatchNorm,
        }
    }

    /// Scale the stage widths to `base, 2·base, 4·base, ...`.
    pub fn with_base_width(mut self, base: usize) -> Self {
        self.widths = (0..self.widths.len()).map(|i| base << i).collect();
        self
    }

    /// Replace the normalization kind.
    pub fn with_norm(mut self, norm: NormKind) -> Self {
        self.norm = norm;
        self
    }

    /// Replace the stem.
    pub fn with_stem(mut self, stem: Stem) -> Self {
        self.stem = stem;
        self
    }

    /// Check that the dimensions describe a buildable network.
    pub fn check(&self) -> Result<()> {
        if self.widths.is_empty() || self.widths.len() != self.blocks_per_stage.len() {
            return Err(DpError::config(
                "widths and blocks_per_stage must be non-empty and of equal length",
            ));
        }
        if self.widths.iter().any(|&w| w == 0) || self.blocks_per_stage.iter().any(|&b| b == 0) {
            return Err(DpError::config("widths and block counts must be positive"));
        }
        if self.in_channels == 0 || self.num_classes == 0 {
            return Err(DpError::config("in_channels and num_classes must be positive"));
        }
        if let NormKind::GroupNorm { groups: 0 } = self.norm {
            return Err(DpError::config("group norm needs at least one group"));
        }
        Ok(())
    }

    fn stem_kernel(&self) -> (usize, usize, usize) {
        match self.stem {
            Stem::ImageNet => (7, 2, 3),
            Stem::Cifar => (3, 1, 1),
        }
    }

    fn blocks(&self) -> Vec<BlockLayout> {
        let mut layout = Vec::new();
        let mut in_planes = self.widths[0];
        for (stage, (&planes, &count)) in self.widths.iter().zip(&self.blocks_per_stage).enumerate()
        {
            for index in 0..count {
                let stride = if stage > 0 && index == 0 { 2 } else { 1 };
                layout.push(BlockLayout {
                    stage,
                    index,
                    in_planes,
                    planes,
                    stride,
                    downsample: stride != 1 || in_planes != planes,
                });
                in_planes = planes;
            }
        }
        layout
    }

    /// Every normalization layer with its torchvision module path.
    pub fn norm_sites(&self) -> Vec<NormSite> {
        let mut sites = vec![NormSite {
            name: "bn1".to_string(),
            channels: self.widths.first().copied().unwrap_or(0),
        }];
        if self.check().is_err() {
            return sites;
        }
        for block in self.blocks() {
            let prefix = format!("layer{}.{}", block.stage + 1, block.index);
            sites.push(NormSite {
                name: format!("{prefix}.bn1"),
                channels: block.planes,
            });
            sites.push(NormSite {
                name: format!("{prefix}.bn2"),
                channels: block.planes,
            });
            if block.downsample {
                sites.push(NormSite {
                    name: format!("{prefix}.downsample.1"),
                    channels: block.planes,
                });
            }
        }
        sites
    }

    /// Number of trainable scalars; normalization running statistics are not counted.
    pub fn num_parameters(&self) -> usize {
        if self.check().is_err() {
            return 0;
        }
        let (k, _, _) = self.stem_kernel();
        let w0 = self.widths[0];
        let mut total = self.in_channels * w0 * k * k + 2 * w0;
        for b in self.blocks() {
            total += b.in_planes * b.planes * 9 + 2 * b.planes;
            total += b.planes * b.planes * 9 + 2 * b.planes;
            if b.downsample {
                total += b.in_planes * b.planes + 2 * b.planes;
            }
        }
        let last = self.widths[self.widths.len() - 1];
        total + last * self.num_classes + self.num_classes
    }
}

/// Number of groups used for a layer with `channels` channels.
///
/// This is the largest divisor of `channels` not above `min(requested, channels)`,
/// so `GroupNorm(min(32, C))` is reproduced whenever it divides `C`.
pub fn group_count(requested: usize, channels: usize) -> usize {
    let upper = requested.min(channels).max(1);
    (1..=upper)
        .rev()
        .find(|g| channels % g == 0)
        .unwrap_or(1)
}

#[derive(Clone, Debug)]
struct BasicBlock {
    conv1: Conv2d,
    norm1: GroupNorm,
    conv2: Conv2d,
    norm2: GroupNorm,
    downsample: Option<(Conv2d, GroupNorm)>,
}

struct BlockCache {
    conv1: ConvCache,
    norm1: GroupNormCache,
    act1: Feature,
    conv2: ConvCache,
    norm2: GroupNormCache,
    downsample: Option<(ConvCache, GroupNormCache)>,
    out: Feature,
}

impl BasicBlock {
    fn forward(&self, params: &[Tensor], x: &Feature) -> Result<(Feature, BlockCache)> {
        let (h, conv1) = self.conv1.forward(params, x)?;
        let (h, norm1) = self.norm1.forward(params, &h)?;
        let act1 = relu(&h);
        let (h, conv2) = self.conv2.forward(params, &act1)?;
        let (h, norm2) = self.norm2.forward(params, &h)?;

        let (identity, downsample) = match &self.downsample {
            Some((conv, norm)) => {
                let (d, conv_cache) = conv.forward(params, x)?;
                let (d, norm_cache) = norm.forward(params, &d)?;
                (d, Some((conv_cache, norm_cache)))
            }
            None => (x.clone(), None),
        };
        if identity.dim() != h.dim() {
            return Err(DpError::shape(h.shape(), identity.shape()));
        }
        let out = relu(&(h + &identity));

        Ok((
            out.clone(),
            BlockCache {
                conv1,
                norm1,
                act1,
                conv2,
                norm2,
                downsample,
                out,
            },
        ))
    }

    fn backward(
        &self,
        params: &[Tensor],
        cache: &BlockCache,
        dy: &Feature,
        grads: &mut [Tensor],
    ) -> Result<Feature> {
        let dsum = relu_backward(&cache.out, dy);

        let d = self.norm2.backward(params, &cache.norm2, &dsum, grads)?;
        let d = self.conv2.backward(params, &cache.conv2, &d, grads)?;
        let d = relu_backward(&cache.act1, &d);
        let d = self.norm1.backward(params, &cache.norm1, &d, grads)?;
        let mut dx = self.conv1.backward(params, &cache.conv1, &d, grads)?;

        match (&self.downsample, &cache.downsample) {
            (Some((conv, norm)), Some((conv_cache, norm_cache))) => {
                let d = norm.backward(params, norm_cache, &dsum, grads)?;
                dx += &conv.backward(params, conv_cache, &d, grads)?;
            }
            (None, None) => dx += &dsum,
            _ => return Err(DpError::invalid("block cache does not match block")),
        }
        Ok(dx)
    }
}

struct NetCache {
    stem_conv: ConvCache,
    stem_norm: GroupNormCache,
    stem_act: Feature,
    stem_pool: Option<MaxPoolCache>,
    blocks: Vec<BlockCache>,
    pooled_dim: (usize, usize, usize),
    fc: LinearCache,
}

/// A ResNet whose parameters are stored as a flat tree of tensors.
#[derive(Clone, Debug)]
pub struct ResNet {
    config: ResNetConfig,
    stem_conv: Conv2d,
    stem_norm: GroupNorm,
    stem_pool: Option<MaxPool2d>,
    blocks: Vec<BasicBlock>,
    fc: Linear,
    params: Vec<Tensor>,
}

impl ResNet {
    /// Build and initialize a network.
    ///
    /// Returns [`DpError::UnsupportedFeature`] for batch normalization; run
    /// the config through [`crate::ModuleValidator::fix`] first.
    pub fn new<R: Rng + ?Sized>(config: ResNetConfig, rng: &mut R) -> Result<Self> {
        config.check()?;
        let groups = match config.norm {
            NormKind::GroupNorm { groups } => groups,
            NormKind::BatchNorm => {
                return Err(DpError::unsupported(
                    "BatchNorm mixes examples within a batch and cannot be trained privately; \
                     replace it with GroupNorm",
                ))
            }
        };
        let norm = |channels: usize, params: &mut Vec<Tensor>| {
            GroupNorm::new(group_count(groups, channels), channels, params)
        };

        let mut params = Vec::new();
        let w0 = config.widths[0];
        let (k, stride, padding) = config.stem_kernel();
        let stem_conv = Conv2d::new(
            Conv2dSpec::new(config.in_channels, w0, k)
                .stride(stride)
                .padding(padding),
            &mut params,
            rng,
        )?;
        let stem_norm = norm(w0, &mut params)?;
        let stem_pool = match config.stem {
            Stem::ImageNet => Some(MaxPool2d::new(3, 2, 1)),
            Stem::Cifar => None,
        };

        let mut blocks = Vec::new();
        for b in config.blocks() {
            let conv1 = Conv2d::new(
                Conv2dSpec::new(b.in_planes, b.planes, 3)
                    .stride(b.stride)
                    .padding(1),
                &mut params,
                rng,
            )?;
            let norm1 = norm(b.planes, &mut params)?;
            let conv2 = Conv2d::new(
                Conv2dSpec::new(b.planes, b.planes, 3).padding(1),
                &mut params,
                rng,
            )?;
            let norm2 = norm(b.planes, &mut params)?;
            let downsample = if b.downsample {
                let conv = Conv2d::new(
                    Conv2dSpec::new(b.in_planes, b.planes, 1).stride(b.stride),
                    &mut params,
                    rng,
                )?;
                Some((conv, norm(b.planes, &mut params)?))
            } else {
                None
            };
            blocks.push(BasicBlock {
                conv1,
                norm1,
                conv2,
                norm2,
                downsample,
            });
        }

        let last = config.widths[config.widths.len() - 1];
        let fc = Linear::new(last, config.num_classes, &mut params, rng)?;

        Ok(Self {
            config,
            stem_conv,
            stem_norm,
            stem_pool,
            blocks,
            fc,
            params,
        })
    }

    /// Architecture of this network.
    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    /// Parameter tree.
    pub fn params(&self) -> &Vec<Tensor> {
        &self.params
    }

    /// Replace the parameters; the new tree must have the same shapes.
    pub fn set_params(&mut self, params: Vec<Tensor>) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(DpError::invalid(format!(
                "expected {} parameter tensors, got {}",
                self.params.len(),
                params.len()
            )));
        }
        for (old, new) in self.params.iter().zip(&params) {
            if old.shape() != new.shape() {
                return Err(DpError::shape(old.shape(), new.shape()));
            }
        }
        self.params = params;
        Ok(())
    }

    /// Number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        num_elements(&self.params)
    }

    /// A zero tree shaped like the parameters.
    pub fn zero_grads(&self) -> Vec<Tensor> {
        zeros_like(&self.params)
    }

    fn forward_cached(&self, x: &Feature) -> Result<(Array1<Scalar>, NetCache)> {
        let params = &self.params;
        let (h, stem_conv) = self.stem_conv.forward(params, x)?;
        let (h, stem_norm) = self.stem_norm.forward(params, &h)?;
        let stem_act = relu(&h);
        let (mut h, stem_pool) = match &self.stem_pool {
            Some(pool) => {
                let (p, cache) = pool.forward(&stem_act)?;
                (p, Some(cache))
            }
            None => (stem_act.clone(), None),
        };

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (out, cache) = block.forward(params, &h)?;
            blocks.push(cache);
            h = out;
        }

        let pooled_dim = h.dim();
        let features = global_avg_pool(&h);
        let (logits, fc) = self.fc.forward(params, &features)?;
        Ok((
            logits,
            NetCache {
                stem_conv,
                stem_norm,
                stem_act,
                stem_pool,
                blocks,
                pooled_dim,
                fc,
            },
        ))
    }

    /// Logits for one image of shape channels × height × width.
    pub fn forward(&self, x: &Feature) -> Result<Array1<Scalar>> {
        self.forward_cached(x).map(|(logits, _)| logits)
    }

    /// Predicted class for every image of a batch.
    pub fn predict(&self, batch: &[Feature]) -> Result<Vec<usize>> {
        batch
            .iter()
            .map(|x| self.forward(x).map(|logits| argmax(&logits)))
            .collect()
    }

    /// Cross-entropy loss, logits and parameter gradient for one example.
    pub fn per_example_gradient(
        &self,
        x: &Feature,
        label: usize,
    ) -> Result<(f64, Array1<Scalar>, Vec<Tensor>)> {
        let (logits, cache) = self.forward_cached(x)?;
        let (loss, dlogits) = cross_entropy(&logits, label)?;

        let params = &self.params;
        let mut grads = self.zero_grads();
        let dfeatures = self.fc.backward(params, &cache.fc, &dlogits, &mut grads)?;
        let mut d = global_avg_pool_backward(&dfeatures, cache.pooled_dim);
        for (block, block_cache) in self.blocks.iter().zip(&cache.blocks).rev() {
            d = block.backward(params, block_cache, &d, &mut grads)?;
        }
        if let (Some(pool), Some(pool_cache)) = (&self.stem_pool, &cache.stem_pool) {
            d = pool.backward(pool_cache, &d)?;
        }
        let d = relu_backward(&cache.stem_act, &d);
        let d = self
            .stem_norm
            .backward(params, &cache.stem_norm, &d, &mut grads)?;
        self.stem_conv
            .backward(params, &cache.stem_conv, &d, &mut grads)?;

        Ok((loss, logits, grads))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn tiny_config() -> ResNetConfig {
        ResNetConfig {
            blocks_per_stage: vec![1, 1],
            widths: vec![2, 4],
            in_channels: 3,
            num_classes: 3,
            stem: Stem::Cifar,
            norm: NormKind::GroupNorm { groups: 2 },
        }
    }

    fn image(c: usize, side: usize, seed: u64) -> Feature {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Feature::from_shape_fn((c, side, side), |_| rng.gen_range(-1.0..1.0) as Scalar)
    }

    #[test]
    fn batch_norm_is_refused() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = ResNet::new(ResNetConfig::resnet18(), &mut rng).expect_err("batch norm");
        assert!(matches!(err, DpError::UnsupportedFeature { .. }));
    }

    #[test]
    fn resnet18_parameter_count_matches_torchvision() {
        let config = ResNetConfig::resnet18().with_norm(NormKind::GroupNorm { groups: 32 });
        assert_eq!(config.num_parameters(), 11_181_642);
    }

    #[test]
    fn built_network_matches_parameter_count() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let config = ResNetConfig::resnet18()
            .with_base_width(4)
            .with_norm(NormKind::GroupNorm { groups: 32 });
        let net = ResNet::new(config.clone(), &mut rng).expect("valid config");
        assert_eq!(net.num_parameters(), config.num_parameters());
        let logits = net.forward(&image(3, 32, 2)).expect("forward");
        assert_eq!(logits.len(), 10);
        assert!(logits.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn norm_sites_use_torchvision_names() {
        let names: Vec<String> = ResNetConfig::resnet18()
            .norm_sites()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names.len(), 20);
        assert_eq!(names[0], "bn1");
        assert!(names.contains(&"layer1.0.bn2".to_string()));
        assert!(names.contains(&"layer2.0.downsample.1".to_string()));
        assert!(!names.contains(&"layer1.0.downsample.1".to_string()));
    }

    #[test]
    fn group_count_divides_channels() {
        assert_eq!(group_count(32, 64), 32);
        assert_eq!(group_count(32, 8), 8);
        assert_eq!(group_count(32, 48), 24);
        assert_eq!(group_count(4, 6), 3);
    }

    #[test]
    fn set_params_checks_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut net = ResNet::new(tiny_config(), &mut rng).expect("valid config");
        let mut params = net.params().clone();
        params.pop();
        assert!(net.set_params(params).is_err());
        let zeros = net.zero_grads();
        net.set_params(zeros).expect("same shapes");
        assert!(net.params().iter().all(|p| p.iter().all(|&v| v == 0.0)));
    }

    #[test]
    #[cfg(not(feature = "f32"))]
    fn per_example_gradient_matches_finite_differences() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let net = ResNet::new(tiny_config(), &mut rng).expect("valid config");
        let x = image(3, 6, 5);
        let label = 1;
        let (loss, logits, grads) = net.per_example_gradient(&x, label).expect("gradient");
        assert_eq!(logits.len(), 3);
        assert!(loss > 0.0);

        let h = 1e-5;
        for (leaf, grad) in grads.iter().enumerate() {
            let idx = leaf % grad.len();
            let mut plus = net.clone();
            let mut minus = net.clone();
            let mut p = net.params().clone();
            p[leaf].as_slice_mut().expect("contiguous")[idx] += h;
            plus.set_params(p).expect("same shapes");
            let mut p = net.params().clone();
            p[leaf].as_slice_mut().expect("contiguous")[idx] -= h;
            minus.set_params(p).expect("same shapes");

            let (lp, _) = cross_entropy(&plus.forward(&x).expect("forward"), label).expect("loss");
            let (lm, _) = cross_entropy(&minus.forward(&x).expect("forward"), label).expect("loss");
            let numeric = (lp - lm) / (2.0 * h);
            let analytic = grad.as_slice().expect("contiguous")[idx];
            assert!(
                (numeric - analytic).abs() < 1e-5 + 1e-3 * analytic.abs(),
                "leaf {leaf}: numeric {numeric} analytic {analytic}"
            );
        }
    }

    #[test]
    fn predict_returns_one_class_per_image() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let net = ResNet::new(tiny_config(), &mut rng).expect("valid config");
        let batch = vec![image(3, 6, 7), image(3, 6, 8)];
        let preds = net.predict(&batch).expect("predict");
        assert_eq!(preds.len(), 2);
        assert!(preds.iter().all(|&p| p < 3));
    }

    proptest! {
        #[test]
        fn group_count_is_largest_divisor(requested in 1usize..128, channels in 1usize..1024) {
            let g = group_count(requested, channels);
            prop_assert_eq!(channels % g, 0);
            prop_assert!(g <= requested.min(channels));
            prop_assert!(((g + 1)..=requested.min(channels)).all(|h| channels % h != 0));
        }
    }
}
