use crate::domain::errors::EnsembleError;
use serde::{Deserialize, Serialize};

/// Adam hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
}

impl OptimizerConfig {
    pub fn wgan_gp() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.5,
            beta2: 0.9,
        }
    }

    pub fn meta() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Channels of both ConvLSTM cells
    pub hidden_channels: usize,
    pub kernel_size: usize,
    pub dense_units: Vec<usize>,
    pub latent_dim: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            hidden_channels: 8,
            kernel_size: 3,
            dense_units: vec![128, 64, 32, 16],
            latent_dim: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    /// Length L of the critic sequence: `L - 1` history prices plus one target
    pub sequence_len: usize,
    pub channels: usize,
    pub kernel_size: usize,
    pub hidden_units: usize,
    pub leaky_slope: f64,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            sequence_len: 11,
            channels: 16,
            kernel_size: 3,
            hidden_units: 50,
            leaky_slope: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WganConfig {
    /// Generator steps once every `critic_iterations` discriminator steps
    pub critic_iterations: u64,
    pub gradient_penalty_weight: f64,
    pub optimizer: OptimizerConfig,
}

impl Default for WganConfig {
    fn default() -> Self {
        Self {
            critic_iterations: 5,
            gradient_penalty_weight: 10.0,
            optimizer: OptimizerConfig::wgan_gp(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaLearnerConfig {
    pub hidden_units: usize,
    pub dropout: f64,
    pub optimizer: OptimizerConfig,
}

impl Default for MetaLearnerConfig {
    fn default() -> Self {
        Self {
            hidden_units: 100,
            dropout: 0.2,
            optimizer: OptimizerConfig::meta(),
        }
    }
}

/// Full description of an ensemble; persisted in checkpoint manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleConfig {
    pub n_models: usize,
    pub window_size: usize,
    pub sequence_length: usize,
    pub generator: GeneratorConfig,
    pub discriminator: DiscriminatorConfig,
    pub wgan: WganConfig,
    pub meta: MetaLearnerConfig,
    pub seed: u64,
    /// Train base models on the rayon pool
    pub parallel: bool,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            n_models: 10,
            window_size: 60,
            sequence_length: 5,
            generator: GeneratorConfig::default(),
            discriminator: DiscriminatorConfig::default(),
            wgan: WganConfig::default(),
            meta: MetaLearnerConfig::default(),
            seed: 42,
            parallel: true,
        }
    }
}

impl EnsembleConfig {
    pub fn history_len(&self) -> usize {
        self.discriminator.sequence_len.saturating_sub(1)
    }

    pub fn validate(&self) -> Result<(), EnsembleError> {
        let fail = |reason: String| Err(EnsembleError::InvalidConfig { reason });

        if self.n_models == 0 {
            return fail("n_models must be positive".to_string());
        }
        if self.window_size < 2 {
            return fail(format!("window_size must be at least 2, got {}", self.window_size));
        }
        if self.sequence_length == 0 {
            return fail("sequence_length must be positive".to_string());
        }
        if self.discriminator.sequence_len < 2 {
            return fail("critic sequence must hold at least one history price".to_string());
        }
        if self.history_len() > self.window_size {
            return fail(format!(
                "critic history ({}) cannot exceed window_size ({})",
                self.history_len(),
                self.window_size
            ));
        }
        for (name, k) in [
            ("generator", self.generator.kernel_size),
            ("discriminator", self.discriminator.kernel_size),
        ] {
            if k % 2 == 0 {
                return fail(format!("{name} kernel size must be odd, got {k}"));
            }
        }
        if self.generator.hidden_channels == 0 || self.generator.dense_units.is_empty() {
            return fail("generator needs hidden channels and at least one dense layer".to_string());
        }
        if self.wgan.critic_iterations == 0 {
            return fail("critic_iterations must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.meta.dropout) {
            return fail(format!("meta dropout must be in [0, 1), got {}", self.meta.dropout));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EnsembleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.history_len(), 10);
        assert_eq!(config.wgan.optimizer, OptimizerConfig::wgan_gp());
    }

    #[test]
    fn test_even_kernel_rejected() {
        let mut config = EnsembleConfig::default();
        config.generator.kernel_size = 4;
        assert!(matches!(
            config.validate(),
            Err(EnsembleError::InvalidConfig { reason }) if reason.contains("generator")
        ));
    }

    #[test]
    fn test_history_must_fit_window() {
        let config = EnsembleConfig {
            window_size: 8,
            ..EnsembleConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
