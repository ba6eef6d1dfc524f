//! Textual resource-spec parsing.
//!
//! Operators write requests like `cpu: "1.5", memory: "512Mi"`. CPU parses
//! as a float; memory accepts the suffixes Gi, G, Mi, M or a bare byte
//! count. G is treated as binary (same as Gi) to match observed worker
//! behavior.

use strata_store::ResourceSpec;

pub const DEFAULT_CPU: f64 = 0.5;
pub const DEFAULT_MEMORY_BYTES: i64 = 512 << 20;

/// A deployment's parsed compute request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceRequest {
    pub cpu: f64,
    pub memory_bytes: i64,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            cpu: DEFAULT_CPU,
            memory_bytes: DEFAULT_MEMORY_BYTES,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResourceSpecError {
    #[error("invalid cpu spec {0:?}")]
    InvalidCpu(String),
    #[error("invalid memory spec {0:?}")]
    InvalidMemory(String),
}

pub fn parse_cpu(s: &str) -> Result<f64, ResourceSpecError> {
    let trimmed = s.trim();
    let value: f64 = trimmed
        .parse()
        .map_err(|_| ResourceSpecError::InvalidCpu(s.to_string()))?;
    if !value.is_finite() || value <= 0.0 {
        return Err(ResourceSpecError::InvalidCpu(s.to_string()));
    }
    Ok(value)
}

pub fn parse_memory(s: &str) -> Result<i64, ResourceSpecError> {
    let trimmed = s.trim();
    let err = || ResourceSpecError::InvalidMemory(s.to_string());

    let (digits, multiplier): (&str, i64) = if let Some(d) = trimmed.strip_suffix("Gi") {
        (d, 1 << 30)
    } else if let Some(d) = trimmed.strip_suffix("Mi") {
        (d, 1 << 20)
    } else if let Some(d) = trimmed.strip_suffix('G') {
        (d, 1 << 30)
    } else if let Some(d) = trimmed.strip_suffix('M') {
        (d, 1_000_000)
    } else {
        (trimmed, 1)
    };

    let value: i64 = digits.trim().parse().map_err(|_| err())?;
    if value <= 0 {
        return Err(err());
    }
    value.checked_mul(multiplier).ok_or_else(err)
}

/// Resolve a deployment's request. A missing spec (or a missing field)
/// falls back to 0.5 CPU / 512 MiB.
pub fn request_from_spec(spec: Option<&ResourceSpec>) -> Result<ResourceRequest, ResourceSpecError> {
    let Some(spec) = spec else {
        return Ok(ResourceRequest::default());
    };
    let cpu = if spec.cpu.trim().is_empty() {
        DEFAULT_CPU
    } else {
        parse_cpu(&spec.cpu)?
    };
    let memory_bytes = if spec.memory.trim().is_empty() {
        DEFAULT_MEMORY_BYTES
    } else {
        parse_memory(&spec.memory)?
    };
    Ok(ResourceRequest { cpu, memory_bytes })
}
