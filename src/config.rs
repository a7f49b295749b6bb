use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conversation::Role;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
    #[error("required pass rate must be within 0..=100 percent, got {0}")]
    PassRateOutOfRange(f64),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// When the loop stops iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopPolicy {
    /// Always run `max_iterations` iterations.
    FixedIterations,
    /// Stop after the first iteration whose pass rate reaches
    /// `required_pass_rate`; `max_iterations` is still the upper bound.
    PassRateThreshold,
}

/// What happens to simulations that never reached a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Recorded as failed; counted in the pass-rate denominator.
    Record,
    /// Dropped from the denominator and from the optimizer input.
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub max_iterations: usize,
    pub simulations_per_iteration: usize,
    pub prefix_length: usize,
    pub stop_policy: StopPolicy,
    /// Fraction in `[0, 1]`.
    pub required_pass_rate: f64,
    pub concurrency: usize,
    pub failure_policy: FailurePolicy,
    pub optimized_role: Role,
    /// Consecutive iterations in which every simulation failed on a model
    /// call before the run is abandoned. A rejected or missing API key ends
    /// the run on the first such iteration.
    pub unavailable_iterations: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            simulations_per_iteration: 5,
            prefix_length: 4,
            stop_policy: StopPolicy::FixedIterations,
            required_pass_rate: 0.8,
            concurrency: 1,
            failure_policy: FailurePolicy::Record,
            optimized_role: Role::Agent,
            unavailable_iterations: 2,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations == 0 {
            return Err(ConfigError::Zero { field: "max_iterations" });
        }
        if self.simulations_per_iteration == 0 {
            return Err(ConfigError::Zero {
                field: "simulations_per_iteration",
            });
        }
        if self.prefix_length == 0 {
            return Err(ConfigError::Zero { field: "prefix_length" });
        }
        if self.unavailable_iterations == 0 {
            return Err(ConfigError::Zero {
                field: "unavailable_iterations",
            });
        }
        if !(0.0..=1.0).contains(&self.required_pass_rate) {
            return Err(ConfigError::PassRateOutOfRange(self.required_pass_rate * 100.0));
        }
        Ok(())
    }

    /// Concurrency clamped into `[1, simulations_per_iteration]`.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency
            .clamp(1, self.simulations_per_iteration.max(1))
    }

    pub fn with_pass_rate_percent(mut self, percent: f64) -> Result<Self, ConfigError> {
        self.required_pass_rate = rate_from_percent(percent)?;
        Ok(self)
    }
}

pub fn rate_from_percent(percent: f64) -> Result<f64, ConfigError> {
    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
        return Err(ConfigError::PassRateOutOfRange(percent));
    }
    Ok(percent / 100.0)
}

/// Model ids and call ceilings for one run. The judge model also serves the
/// optimizer.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub conversation_model: String,
    pub judge_model: String,
    pub temperature: Option<f32>,
    pub turn_timeout: Duration,
    pub judge_timeout: Duration,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            conversation_model: "gpt-4o".to_string(),
            judge_model: "gpt-4-turbo".to_string(),
            temperature: None,
            turn_timeout: Duration::from_secs(180),
            judge_timeout: Duration::from_secs(180),
        }
    }
}

impl ModelSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.conversation_model.trim().is_empty() || self.judge_model.trim().is_empty() {
            return Err(ConfigError::Invalid("model ids must not be empty".to_string()));
        }
        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::Invalid(format!(
                    "temperature {temperature} is outside 0..=2"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(LoopConfig::default().validate().is_ok());
        assert!(ModelSettings::default().validate().is_ok());
    }

    #[test]
    fn concurrency_is_clamped_to_simulation_count() {
        let config = LoopConfig {
            simulations_per_iteration: 3,
            concurrency: 10,
            ..LoopConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 3);

        let config = LoopConfig {
            concurrency: 0,
            ..LoopConfig::default()
        };
        assert_eq!(config.effective_concurrency(), 1);
    }

    #[test]
    fn rejects_zero_counts() {
        let config = LoopConfig {
            simulations_per_iteration: 0,
            ..LoopConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "simulations_per_iteration"
            })
        );

        let config = LoopConfig {
            unavailable_iterations: 0,
            ..LoopConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "unavailable_iterations"
            })
        );
    }

    #[test]
    fn percent_conversion() {
        let config = LoopConfig::default().with_pass_rate_percent(75.0).unwrap();
        assert!((config.required_pass_rate - 0.75).abs() < 1e-12);
        assert!(rate_from_percent(120.0).is_err());
        assert!(rate_from_percent(f64::NAN).is_err());
    }
}
