use crate::runtime::interpreter::DEFAULT_MAX_STEPS;
use std::{env, fmt, str::FromStr};
use thiserror::Error;

pub const MAX_STEPS_ENV: &str = "EXLOWER_MAX_STEPS";
pub const EMIT_ENV: &str = "EXLOWER_EMIT";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid step limit `{0}`, expected a positive integer")]
    InvalidMaxSteps(String),
    #[error("unknown emit target `{0}`, expected `ir` or `llvm`")]
    UnknownEmit(String),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EmitTarget {
    #[default]
    Ir,
    Llvm,
}

impl FromStr for EmitTarget {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ir" => Ok(EmitTarget::Ir),
            "llvm" | "ll" => Ok(EmitTarget::Llvm),
            _ => Err(ConfigError::UnknownEmit(value.to_string())),
        }
    }
}

impl fmt::Display for EmitTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EmitTarget::Ir => "ir",
            EmitTarget::Llvm => "llvm",
        })
    }
}

impl EmitTarget {
    pub fn from_flag_or_env(flag: Option<String>) -> Result<Self, ConfigError> {
        resolve_emit(flag, |key| env::var(key).ok())
    }
}

/// Interpreter settings for the `run` command. The command-line flag wins
/// over the environment, which wins over the default.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunConfig {
    pub max_steps: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl RunConfig {
    pub fn from_flag_or_env(max_steps: Option<u64>) -> Result<Self, ConfigError> {
        Self::resolve(max_steps, |key| env::var(key).ok())
    }

    fn resolve(
        max_steps: Option<u64>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let raw = match max_steps {
            Some(steps) => steps.to_string(),
            None => match lookup(MAX_STEPS_ENV).filter(|v| !v.trim().is_empty()) {
                Some(raw) => raw,
                None => return Ok(Self::default()),
            },
        };
        let max_steps = raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|steps| *steps > 0)
            .ok_or(ConfigError::InvalidMaxSteps(raw))?;
        Ok(Self { max_steps })
    }
}

fn resolve_emit(
    flag: Option<String>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<EmitTarget, ConfigError> {
    flag.or_else(|| lookup(EMIT_ENV))
        .filter(|value| !value.trim().is_empty())
        .map(|value| value.parse())
        .unwrap_or(Ok(EmitTarget::default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key| {
            pairs
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| value.to_string())
        }
    }

    #[test]
    fn flag_overrides_environment() {
        let config = RunConfig::resolve(Some(10), env_of(&[(MAX_STEPS_ENV, "99")])).unwrap();
        assert_eq!(config.max_steps, 10);
        assert_eq!(
            resolve_emit(Some("ir".into()), env_of(&[(EMIT_ENV, "llvm")])),
            Ok(EmitTarget::Ir)
        );
    }

    #[test]
    fn environment_fills_missing_flags() {
        let config = RunConfig::resolve(None, env_of(&[(MAX_STEPS_ENV, " 250 ")])).unwrap();
        assert_eq!(config.max_steps, 250);
        assert_eq!(resolve_emit(None, env_of(&[(EMIT_ENV, "LLVM")])), Ok(EmitTarget::Llvm));

        assert_eq!(resolve_emit(None, env_of(&[(EMIT_ENV, "  ")])), Ok(EmitTarget::Ir));
        assert_eq!(RunConfig::resolve(None, env_of(&[])), Ok(RunConfig::default()));
    }

    #[test]
    fn step_limit_ignores_the_emit_setting() {
        let config = RunConfig::resolve(None, env_of(&[(EMIT_ENV, "wasm")])).unwrap();
        assert_eq!(config, RunConfig::default());
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(
            RunConfig::resolve(None, env_of(&[(MAX_STEPS_ENV, "0")])),
            Err(ConfigError::InvalidMaxSteps("0".into()))
        );
        assert_eq!(
            RunConfig::resolve(Some(0), env_of(&[])),
            Err(ConfigError::InvalidMaxSteps("0".into()))
        );
        assert_eq!(
            "wasm".parse::<EmitTarget>(),
            Err(ConfigError::UnknownEmit("wasm".into()))
        );
    }
}
