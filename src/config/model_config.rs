//! Model architecture configuration parsing from environment variables.
//!
//! This module handles the ensemble size, GAF window, generator and critic
//! shapes, and optimizer settings.

use super::{Lookup, env_lookup, parse_var};
use crate::domain::ml::model_config::{
    DiscriminatorConfig, EnsembleConfig, GeneratorConfig, MetaLearnerConfig, OptimizerConfig,
    WganConfig,
};
use anyhow::{Context, Result};

/// Model environment configuration
#[derive(Debug, Clone)]
pub struct ModelEnvConfig {
    // Ensemble
    pub n_models: usize,
    pub window_size: usize,
    pub sequence_length: usize,
    pub seed: u64,
    pub parallel: bool,

    // Generator
    pub generator_hidden_channels: usize,
    pub generator_kernel_size: usize,
    pub generator_dense_units: Vec<usize>,
    pub latent_dim: usize,

    // Discriminator
    pub critic_sequence_len: usize,
    pub critic_channels: usize,
    pub critic_hidden_units: usize,

    // WGAN-GP
    pub critic_iterations: u64,
    pub gradient_penalty_weight: f64,
    pub gan_learning_rate: f64,

    // Meta-learner
    pub meta_hidden_units: usize,
    pub meta_dropout: f64,
    pub meta_learning_rate: f64,
}

impl ModelEnvConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&env_lookup)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self> {
        let defaults = EnsembleConfig::default();

        let generator_dense_units = match lookup("GENERATOR_DENSE_UNITS") {
            Some(raw) => raw
                .split(',')
                .map(|s| s.trim().parse::<usize>())
                .collect::<Result<Vec<_>, _>>()
                .context("Failed to parse GENERATOR_DENSE_UNITS")?,
            None => defaults.generator.dense_units.clone(),
        };

        Ok(Self {
            n_models: parse_var(lookup, "N_MODELS", defaults.n_models)?,
            window_size: parse_var(lookup, "WINDOW_SIZE", defaults.window_size)?,
            sequence_length: parse_var(lookup, "SEQUENCE_LENGTH", defaults.sequence_length)?,
            seed: parse_var(lookup, "SEED", defaults.seed)?,
            parallel: parse_var(lookup, "PARALLEL_TRAINING", defaults.parallel)?,

            generator_hidden_channels: parse_var(
                lookup,
                "GENERATOR_HIDDEN_CHANNELS",
                defaults.generator.hidden_channels,
            )?,
            generator_kernel_size: parse_var(
                lookup,
                "GENERATOR_KERNEL_SIZE",
                defaults.generator.kernel_size,
            )?,
            generator_dense_units,
            latent_dim: parse_var(lookup, "LATENT_DIM", defaults.generator.latent_dim)?,

            critic_sequence_len: parse_var(
                lookup,
                "CRITIC_SEQUENCE_LEN",
                defaults.discriminator.sequence_len,
            )?,
            critic_channels: parse_var(lookup, "CRITIC_CHANNELS", defaults.discriminator.channels)?,
            critic_hidden_units: parse_var(
                lookup,
                "CRITIC_HIDDEN_UNITS",
                defaults.discriminator.hidden_units,
            )?,

            critic_iterations: parse_var(lookup, "CRITIC_ITERATIONS", defaults.wgan.critic_iterations)?,
            gradient_penalty_weight: parse_var(
                lookup,
                "GRADIENT_PENALTY_WEIGHT",
                defaults.wgan.gradient_penalty_weight,
            )?,
            gan_learning_rate: parse_var(
                lookup,
                "GAN_LEARNING_RATE",
                defaults.wgan.optimizer.learning_rate,
            )?,

            meta_hidden_units: parse_var(lookup, "META_HIDDEN_UNITS", defaults.meta.hidden_units)?,
            meta_dropout: parse_var(lookup, "META_DROPOUT", defaults.meta.dropout)?,
            meta_learning_rate: parse_var(
                lookup,
                "META_LEARNING_RATE",
                defaults.meta.optimizer.learning_rate,
            )?,
        })
    }

    /// Domain value object; validated by the ensemble on construction.
    pub fn ensemble_config(&self) -> EnsembleConfig {
        EnsembleConfig {
            n_models: self.n_models,
            window_size: self.window_size,
            sequence_length: self.sequence_length,
            generator: GeneratorConfig {
                hidden_channels: self.generator_hidden_channels,
                kernel_size: self.generator_kernel_size,
                dense_units: self.generator_dense_units.clone(),
                latent_dim: self.latent_dim,
            },
            discriminator: DiscriminatorConfig {
                sequence_len: self.critic_sequence_len,
                channels: self.critic_channels,
                hidden_units: self.critic_hidden_units,
                ..DiscriminatorConfig::default()
            },
            wgan: WganConfig {
                critic_iterations: self.critic_iterations,
                gradient_penalty_weight: self.gradient_penalty_weight,
                optimizer: OptimizerConfig {
                    learning_rate: self.gan_learning_rate,
                    ..OptimizerConfig::wgan_gp()
                },
            },
            meta: MetaLearnerConfig {
                hidden_units: self.meta_hidden_units,
                dropout: self.meta_dropout,
                optimizer: OptimizerConfig {
                    learning_rate: self.meta_learning_rate,
                    ..OptimizerConfig::meta()
                },
            },
            seed: self.seed,
            parallel: self.parallel,
        }
    }
}
