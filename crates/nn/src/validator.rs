//! Checks that a model can be trained with per-example privacy guarantees.

use std::fmt;

use dpresnet_core::{DpError, Result};

use crate::resnet::{group_count, NormKind, ResNetConfig};

/// Group count used when replacing batch normalization.
pub const DEFAULT_GROUPS: usize = 32;

/// Why a module is incompatible with DP-SGD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IssueKind {
    /// Batch statistics couple the examples of a batch.
    BatchNorm,
    /// The architecture cannot be built at all.
    InvalidArchitecture,
}

/// A single incompatibility, named by module path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Module path such as `layer3.1.bn2`.
    pub module: String,
    /// Category.
    pub kind: IssueKind,
    /// Human-readable explanation.
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.module, self.message)
    }
}

/// Validates and repairs [`ResNetConfig`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct ModuleValidator;

impl ModuleValidator {
    /// All issues found in `config`; empty when the model is trainable.
    pub fn validate(config: &ResNetConfig) -> Vec<ValidationIssue> {
        if let Err(err) = config.check() {
            return vec![ValidationIssue {
                module: "model".to_string(),
                kind: IssueKind::InvalidArchitecture,
                message: err.to_string(),
            }];
        }
        match config.norm {
            NormKind::BatchNorm => config
                .norm_sites()
                .into_iter()
                .map(|site| ValidationIssue {
                    message: format!(
                        "BatchNorm2d({}) computes statistics across the batch, so one \
                         example's gradient depends on the others",
                        site.channels
                    ),
                    module: site.name,
                    kind: IssueKind::BatchNorm,
                })
                .collect(),
            NormKind::GroupNorm { .. } => Vec::new(),
        }
    }

    /// Whether `config` has no issues.
    pub fn is_valid(config: &ResNetConfig) -> bool {
        Self::validate(config).is_empty()
    }

    /// Like [`ModuleValidator::validate`], but fails on the first issue.
    pub fn validate_strict(config: &ResNetConfig) -> Result<()> {
        match Self::validate(config).into_iter().next() {
            None => Ok(()),
            Some(issue) if issue.kind == IssueKind::BatchNorm => {
                Err(DpError::unsupported(issue.to_string()))
            }
            Some(issue) => Err(DpError::config(issue.to_string())),
        }
    }

    /// Replace every BatchNorm with `GroupNorm(min(32, C))`.
    ///
    /// Configs without BatchNorm are returned unchanged.
    pub fn fix(config: &ResNetConfig) -> ResNetConfig {
        let mut fixed = config.clone();
        if fixed.norm == NormKind::BatchNorm {
            fixed.norm = NormKind::GroupNorm {
                groups: DEFAULT_GROUPS,
            };
        }
        fixed
    }

    /// The `(module, groups)` pairs that [`ModuleValidator::fix`] produces.
    pub fn group_plan(config: &ResNetConfig) -> Vec<(String, usize)> {
        let groups = match config.norm {
            NormKind::GroupNorm { groups } => groups,
            NormKind::BatchNorm => DEFAULT_GROUPS,
        };
        config
            .norm_sites()
            .into_iter()
            .map(|site| (site.name, group_count(groups, site.channels)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resnet18_reports_every_batch_norm() {
        let issues = ModuleValidator::validate(&ResNetConfig::resnet18());
        assert_eq!(issues.len(), 20);
        assert!(issues.iter().all(|i| i.kind == IssueKind::BatchNorm));
        assert_eq!(issues[0].module, "bn1");
        assert!(issues
            .iter()
            .any(|i| i.module == "layer4.0.downsample.1" && i.message.contains("512")));
    }

    #[test]
    fn fixed_config_is_valid() {
        let fixed = ModuleValidator::fix(&ResNetConfig::resnet18());
        assert!(ModuleValidator::is_valid(&fixed));
        assert!(ModuleValidator::validate_strict(&fixed).is_ok());
        assert_eq!(fixed.norm, NormKind::GroupNorm { groups: 32 });
        assert_eq!(fixed.widths, ResNetConfig::resnet18().widths);
    }

    #[test]
    fn group_plan_uses_min_of_32_and_channels() {
        let narrow = ModuleValidator::fix(&ResNetConfig::resnet18().with_base_width(8));
        let plan = ModuleValidator::group_plan(&narrow);
        assert_eq!(plan[0], ("bn1".to_string(), 8));
        assert!(plan.contains(&("layer4.1.bn2".to_string(), 32)));
    }

    #[test]
    fn strict_validation_errors() {
        let err = ModuleValidator::validate_strict(&ResNetConfig::resnet18())
            .expect_err("batch norm present");
        assert!(matches!(err, DpError::UnsupportedFeature { .. }));

        let mut broken = ResNetConfig::resnet18();
        broken.widths.pop();
        let issues = ModuleValidator::validate(&broken);
        assert_eq!(issues[0].kind, IssueKind::InvalidArchitecture);
        assert!(matches!(
            ModuleValidator::validate_strict(&broken),
            Err(DpError::ConfigError { .. })
        ));
    }
}
