//! Generation parameters
//!
//! Sampling bounds a session applies to every query until replaced.

use serde::{Deserialize, Serialize};

use crate::session::SessionError;

/// Generation parameters for inference
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Maximum number of tokens to generate
    pub max_length: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            max_length: 4096,
            temperature: 1.2,
            top_k: 25,
            top_p: 0.8,
        }
    }
}

impl Parameters {
    /// Builds parameters, rejecting any value out of range.
    pub fn new(max_length: u32, temperature: f32, top_k: u32, top_p: f32) -> Result<Self, SessionError> {
        let params = Self {
            max_length,
            temperature,
            top_k,
            top_p,
        };
        params.validate()?;
        Ok(params)
    }

    /// Parses the four values from their string forms, then validates them.
    pub fn parse(max_length: &str, temperature: &str, top_k: &str, top_p: &str) -> Result<Self, SessionError> {
        fn field<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, SessionError>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| SessionError::InvalidParameter(format!("{name} = {raw:?}: {e}")))
        }

        Self::new(
            field("max_length", max_length)?,
            field("temperature", temperature)?,
            field("top_k", top_k)?,
            field("top_p", top_p)?,
        )
    }

    /// Checks every bound; reports the first violation.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.max_length == 0 {
            return Err(SessionError::InvalidParameter("max_length must be greater than 0".to_string()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SessionError::InvalidParameter(format!(
                "temperature must be a finite value >= 0, got {}",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(SessionError::InvalidParameter(format!(
                "top_p must be within [0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}
