//! CUDA wheel tag selection from `nvidia-smi` output.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;

/// Supported nightly wheel indexes, oldest first: `(major, minor, tag)`.
pub const CUDA_TAGS: [(u32, u32, &str); 4] = [
    (12, 4, "cu124"),
    (12, 6, "cu126"),
    (12, 8, "cu128"),
    (13, 0, "cu130"),
];

/// Tag used for CPU-only installs (`setup --cpu`).
pub const CPU_TAG: &str = "cpu";

static CUDA_VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"CUDA Version:\s+(\d+)\.(\d+)").expect("valid regex"));

/// Pick the newest wheel tag whose toolkit the reported driver supports.
pub fn resolve_cuda_tag(nvidia_smi_output: &str) -> Result<&'static str> {
    let caps = CUDA_VERSION_RE.captures(nvidia_smi_output).ok_or_else(|| {
        anyhow!("Could not parse CUDA version from nvidia-smi. Use --cuda to specify.")
    })?;
    let major: u32 = caps[1].parse()?;
    let minor: u32 = caps[2].parse()?;
    CUDA_TAGS
        .iter()
        .filter(|(tk_major, tk_minor, _)| (*tk_major, *tk_minor) <= (major, minor))
        .max_by_key(|(tk_major, tk_minor, _)| (*tk_major, *tk_minor))
        .map(|(_, _, tag)| *tag)
        .ok_or_else(|| {
            let (min_major, min_minor, _) = CUDA_TAGS[0];
            anyhow!(
                "CUDA driver {major}.{minor} is too old. Minimum supported: {min_major}.{min_minor}."
            )
        })
}
