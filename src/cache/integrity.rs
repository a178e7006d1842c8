//! Subresource-integrity digests and the persisted integrity manifest.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::error::CacheError;

/// Supported digest algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    Sha256,
    Sha384,
}

impl Algorithm {
    pub const ALL: [Algorithm; 2] = [Algorithm::Sha256, Algorithm::Sha384];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|alg| alg.as_str().eq_ignore_ascii_case(name))
    }

    fn raw_digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
            Self::Sha384 => Sha384::digest(bytes).to_vec(),
        }
    }

    /// Base64 digest of `bytes`.
    pub fn digest(self, bytes: &[u8]) -> String {
        BASE64.encode(self.raw_digest(bytes))
    }

    /// Lowercase hex digest of `bytes`.
    pub fn hex_digest(self, bytes: &[u8]) -> String {
        hex::encode(self.raw_digest(bytes))
    }

    /// `algorithm-base64digest` string for `bytes`.
    pub fn sri(self, bytes: &[u8]) -> String {
        format!("{}-{}", self.as_str(), self.digest(bytes))
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Space-separated SRI list over `bytes`, one item per algorithm.
pub fn sri_list(algorithms: &[Algorithm], bytes: &[u8]) -> String {
    algorithms
        .iter()
        .map(|alg| alg.sri(bytes))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Outcome of checking bytes against an SRI string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch { expected: String, actual: String },
    /// The SRI string names no supported algorithm.
    Unsupported,
}

/// Check `bytes` against every supported item of an SRI string. All
/// supported items must match.
pub fn verify(integrity: &str, bytes: &[u8]) -> Verification {
    let mut checked = false;
    for item in integrity.split_whitespace() {
        let Some((name, expected)) = item.split_once('-') else {
            continue;
        };
        let Some(alg) = Algorithm::parse(name) else {
            continue;
        };
        checked = true;
        let actual = alg.digest(bytes);
        if !digests_equal(expected, &actual) {
            return Verification::Mismatch {
                expected: item.to_string(),
                actual: format!("{}-{actual}", alg.as_str()),
            };
        }
    }
    if checked {
        Verification::Match
    } else {
        Verification::Unsupported
    }
}

fn digests_equal(left: &str, right: &str) -> bool {
    left.len() == right.len() && bool::from(left.as_bytes().ct_eq(right.as_bytes()))
}

/// Digests recorded for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub asset_path: String,
    pub hashes: BTreeMap<Algorithm, String>,
}

impl IntegrityRecord {
    pub fn compute(asset_path: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            asset_path: asset_path.into(),
            hashes: Algorithm::ALL
                .into_iter()
                .map(|alg| (alg, alg.digest(bytes)))
                .collect(),
        }
    }

    /// SRI list covering every recorded algorithm.
    pub fn sri(&self) -> String {
        self.hashes
            .iter()
            .map(|(alg, digest)| format!("{}-{digest}", alg.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One difference found by [`IntegrityManifest::verify_tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestDrift {
    Missing(String),
    Changed(String),
    Unlisted(String),
}

/// Persisted `{ assetPath -> { algorithm -> digest } }` map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntegrityManifest {
    assets: BTreeMap<String, BTreeMap<Algorithm, String>>,
}

impl IntegrityManifest {
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn insert(&mut self, record: IntegrityRecord) {
        self.assets.insert(record.asset_path, record.hashes);
    }

    /// Record for a request path or relative file path.
    pub fn get(&self, asset_path: &str) -> Option<IntegrityRecord> {
        let normalized = asset_path.trim_start_matches('/');
        self.assets
            .get(normalized)
            .map(|hashes| IntegrityRecord {
                asset_path: normalized.to_string(),
                hashes: hashes.clone(),
            })
    }

    pub fn load(path: &Path) -> Result<Self, CacheError> {
        let raw = fs::read(path).map_err(|err| {
            CacheError::IntegrityInitFailed(format!("reading {}: {err}", path.display()))
        })?;
        let manifest: Self = serde_json::from_slice(&raw).map_err(|err| {
            CacheError::IntegrityInitFailed(format!("parsing {}: {err}", path.display()))
        })?;
        info!(path = %path.display(), assets = manifest.len(), "integrity manifest loaded");
        Ok(manifest)
    }

    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)
    }

    /// Hash every file under `root`. Keys are `/`-separated relative paths.
    pub fn generate(root: &Path) -> Result<Self, std::io::Error> {
        let mut manifest = Self::default();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(relative) = relative_key(root, entry.path()) else {
                continue;
            };
            let bytes = fs::read(entry.path())?;
            manifest.insert(IntegrityRecord::compute(relative, &bytes));
        }
        Ok(manifest)
    }

    /// Compare the manifest against the files currently under `root`.
    pub fn verify_tree(&self, root: &Path) -> Result<Vec<ManifestDrift>, std::io::Error> {
        let current = Self::generate(root)?;
        let mut drift = Vec::new();
        for (path, hashes) in &self.assets {
            match current.assets.get(path) {
                None => drift.push(ManifestDrift::Missing(path.clone())),
                Some(actual) => {
                    let changed = hashes.iter().any(|(alg, expected)| {
                        actual
                            .get(alg)
                            .is_none_or(|digest| !digests_equal(expected, digest))
                    });
                    if changed {
                        drift.push(ManifestDrift::Changed(path.clone()));
                    }
                }
            }
        }
        for path in current.assets.keys() {
            if !self.assets.contains_key(path) {
                drift.push(ManifestDrift::Unlisted(path.clone()));
            }
        }
        if !drift.is_empty() {
            warn!(root = %root.display(), drift = drift.len(), "integrity manifest drift");
        }
        Ok(drift)
    }
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative: PathBuf = path.strip_prefix(root).ok()?.to_path_buf();
    let parts: Vec<String> = relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
