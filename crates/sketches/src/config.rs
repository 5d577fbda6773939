//! Engine settings, from a JSON file or from `SKETCH_*` environment
//! variables. Unset or unparsable variables fall back to defaults.

use std::env;
use std::path::Path;
use std::sync::Arc;

use overlay::{ClipExecutor, ClipMode, FragmentOptions, executor_for};
use serde::{Deserialize, Deserializer, Serialize};
use streaming::{PageOptions, SourceCache, SourceCacheOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Prefix for clipping-layer object keys that are not absolute URLs.
    pub source_base_url: Option<String>,
    #[serde(deserialize_with = "byte_size")]
    pub cache_max_bytes: usize,
    #[serde(deserialize_with = "byte_size")]
    pub cache_page_bytes: u64,
    pub max_open_sources: usize,
    #[serde(deserialize_with = "byte_size")]
    pub page_bytes: u64,
    #[serde(deserialize_with = "byte_size")]
    pub overfetch_bytes: u64,
    pub clip_mode: ClipMode,
    pub clip_workers: usize,
    pub min_fragment_area_m2: f64,
    pub max_decompose_iterations: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let pages = PageOptions::default();
        let fragments = FragmentOptions::default();
        let sources = SourceCacheOptions::default();
        Self {
            source_base_url: None,
            cache_max_bytes: sources.max_bytes,
            cache_page_bytes: sources.cache_page_bytes,
            max_open_sources: sources.max_sources,
            page_bytes: pages.max_page_bytes,
            overfetch_bytes: pages.overfetch_bytes,
            clip_mode: ClipMode::Inline,
            clip_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            min_fragment_area_m2: fragments.min_area_m2,
            max_decompose_iterations: fragments.max_decompose_iterations,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {message}")]
    Read { path: String, message: String },
    #[error("invalid engine config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            source_base_url: env::var("SKETCH_SOURCE_BASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            cache_max_bytes: env_var_bytes("SKETCH_CACHE_MAX_BYTES", defaults.cache_max_bytes as u64) as usize,
            cache_page_bytes: env_var_bytes("SKETCH_CACHE_PAGE_BYTES", defaults.cache_page_bytes),
            max_open_sources: env_var_usize("SKETCH_MAX_OPEN_SOURCES", defaults.max_open_sources),
            page_bytes: env_var_bytes("SKETCH_PAGE_BYTES", defaults.page_bytes),
            overfetch_bytes: env_var_bytes("SKETCH_OVERFETCH_BYTES", defaults.overfetch_bytes),
            clip_mode: env::var("SKETCH_CLIP_MODE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.clip_mode),
            clip_workers: env_var_usize("SKETCH_CLIP_WORKERS", defaults.clip_workers),
            min_fragment_area_m2: env_var_f64("SKETCH_MIN_FRAGMENT_AREA_M2", defaults.min_fragment_area_m2),
            max_decompose_iterations: env_var_usize(
                "SKETCH_MAX_DECOMPOSE_ITERATIONS",
                defaults.max_decompose_iterations,
            ),
        }
    }

    pub fn from_json_str(payload: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let payload = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&payload)
    }

    pub fn source_cache_options(&self) -> SourceCacheOptions {
        SourceCacheOptions {
            base_url: self.source_base_url.clone(),
            max_bytes: self.cache_max_bytes,
            cache_page_bytes: self.cache_page_bytes,
            max_sources: self.max_open_sources,
            pages: PageOptions {
                max_page_bytes: self.page_bytes,
                overfetch_bytes: self.overfetch_bytes,
            },
        }
    }

    pub fn fragment_options(&self) -> FragmentOptions {
        FragmentOptions {
            min_area_m2: self.min_fragment_area_m2,
            max_decompose_iterations: self.max_decompose_iterations,
        }
    }

    pub fn clip_executor(&self, sources: Arc<SourceCache>) -> Arc<dyn ClipExecutor> {
        executor_for(self.clip_mode, sources, self.clip_workers)
    }
}

/// Parses sizes such as `1048576`, `512kb`, `64mb` or `1.5 GB` (binary
/// multiples).
pub fn parse_byte_size(text: &str) -> Option<u64> {
    let lower = text.trim().to_ascii_lowercase();
    let split = lower
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(lower.len());
    let (number, unit) = lower.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: u64 = match unit.trim() {
        "" | "b" => 1,
        "kb" | "k" => 1 << 10,
        "mb" | "m" => 1 << 20,
        "gb" | "g" => 1 << 30,
        _ => return None,
    };
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64).round() as u64)
}

fn byte_size<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    let bytes = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => parse_byte_size(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid byte size: {s}")))?,
    };
    T::try_from(bytes).map_err(|_| serde::de::Error::custom(format!("byte size out of range: {bytes}")))
}

fn env_var_bytes(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| parse_byte_size(&v))
        .unwrap_or(default)
}

fn env_var_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_var_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
