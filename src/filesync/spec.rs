//! What belongs to a sync group and how its payload is built and applied.
//!
//! Paths travel as forward-slash relative strings. Every inbound path is
//! normalized and checked against the group's globs before it touches the
//! filesystem; anything absolute or escaping the root is rejected.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use super::{sha256_hex, FileSyncError};

// `*` stays within one path segment, `**` crosses them.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Payload container: relative wire path to base64 file contents.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Bundle {
    files: BTreeMap<String, String>,
}

/// Defines which files under a root directory form a sync group.
///
/// Diffing is file-level: only changed or new files are transferred.
#[derive(Debug, Clone)]
pub struct FileSyncSpec {
    root: PathBuf,
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
    delete_extraneous: bool,
}

impl FileSyncSpec {
    pub fn builder(root: impl Into<PathBuf>) -> FileSyncSpecBuilder {
        FileSyncSpecBuilder {
            root: root.into(),
            includes: Vec::new(),
            excludes: Vec::new(),
            delete_extraneous: false,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn delete_extraneous(&self) -> bool {
        self.delete_extraneous
    }

    /// Whether a relative wire path belongs to the group. Unsafe paths never
    /// match. An empty include list means everything is included.
    pub fn matches(&self, wire_path: &str) -> bool {
        let Some(normalized) = normalize_wire_path(wire_path) else {
            return false;
        };
        let included = self.includes.is_empty()
            || self
                .includes
                .iter()
                .any(|p| p.matches_with(&normalized, MATCH_OPTIONS));
        included
            && !self
                .excludes
                .iter()
                .any(|p| p.matches_with(&normalized, MATCH_OPTIONS))
    }

    /// Wire path to content hash for every matching file under the root.
    /// A missing root directory yields an empty manifest.
    pub fn compute_manifest(&self) -> Result<BTreeMap<String, String>, FileSyncError> {
        let mut out = BTreeMap::new();
        if !self.root.exists() {
            return Ok(out);
        }

        let mut files = Vec::new();
        collect_files(&self.root, &mut files)?;
        for file in files {
            let rel = match file.strip_prefix(&self.root) {
                Ok(rel) => rel,
                Err(_) => continue,
            };
            let Some(wire) = to_wire_path(rel) else {
                continue;
            };
            if !self.matches(&wire) {
                continue;
            }
            out.insert(wire, sha256_hex(&fs::read(&file)?));
        }
        Ok(out)
    }

    /// Packs the named files into a transferable bundle. Paths that do not
    /// match the group or no longer exist are skipped.
    pub fn build_bundle(&self, wire_paths: &BTreeSet<String>) -> Result<Vec<u8>, FileSyncError> {
        let mut bundle = Bundle::default();
        for wire in wire_paths {
            if !self.matches(wire) {
                continue;
            }
            let target = self.resolve_safe(wire)?;
            if !target.is_file() {
                continue;
            }
            let Some(normalized) = normalize_wire_path(wire) else {
                continue;
            };
            bundle.files.insert(normalized, BASE64.encode(fs::read(&target)?));
        }
        serde_json::to_vec(&bundle).map_err(|e| FileSyncError::Bundle(e.to_string()))
    }

    /// Writes a bundle's files under the root (temp file, then rename) and
    /// removes the listed delete paths. An empty byte slice is an empty
    /// bundle, which still processes deletions.
    pub fn apply_bundle(
        &self,
        bundle: &[u8],
        delete_paths: &[String],
    ) -> Result<ApplyOutcome, FileSyncError> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root)?;
        }

        let mut written = Vec::new();
        if !bundle.is_empty() {
            let bundle: Bundle =
                serde_json::from_slice(bundle).map_err(|e| FileSyncError::Bundle(e.to_string()))?;
            for (wire, encoded) in bundle.files {
                if !self.matches(&wire) {
                    continue;
                }
                let target = self.resolve_safe(&wire)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let contents = BASE64
                    .decode(encoded.as_bytes())
                    .map_err(|e| FileSyncError::Bundle(e.to_string()))?;
                write_replacing(&target, &contents)?;
                written.push(wire);
            }
        }

        let mut deleted = Vec::new();
        for wire in delete_paths {
            if !self.matches(wire) {
                continue;
            }
            let target = self.resolve_safe(wire)?;
            if !target.is_file() {
                continue;
            }
            fs::remove_file(&target)?;
            if let Some(normalized) = normalize_wire_path(wire) {
                deleted.push(normalized);
            }
        }

        Ok(ApplyOutcome { written_paths: written, deleted_paths: deleted })
    }

    fn resolve_safe(&self, wire_path: &str) -> Result<PathBuf, FileSyncError> {
        let normalized = normalize_wire_path(wire_path).ok_or_else(|| FileSyncError::UnsafePath {
            path: wire_path.to_string(),
        })?;
        let mut out = self.root.clone();
        for part in normalized.split('/') {
            out.push(part);
        }
        Ok(out)
    }
}

/// Paths applied and removed by [`FileSyncSpec::apply_bundle`].
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub written_paths: Vec<String>,
    pub deleted_paths: Vec<String>,
}

pub struct FileSyncSpecBuilder {
    root: PathBuf,
    includes: Vec<String>,
    excludes: Vec<String>,
    delete_extraneous: bool,
}

impl FileSyncSpecBuilder {
    pub fn include_glob(mut self, glob: &str) -> Self {
        if !glob.trim().is_empty() {
            self.includes.push(glob.to_string());
        }
        self
    }

    pub fn exclude_glob(mut self, glob: &str) -> Self {
        if !glob.trim().is_empty() {
            self.excludes.push(glob.to_string());
        }
        self
    }

    pub fn delete_extraneous(mut self, delete_extraneous: bool) -> Self {
        self.delete_extraneous = delete_extraneous;
        self
    }

    pub fn build(self) -> Result<FileSyncSpec, FileSyncError> {
        let includes = self
            .includes
            .iter()
            .map(|g| Pattern::new(g))
            .collect::<Result<Vec<_>, _>>()?;
        let excludes = self
            .excludes
            .iter()
            .map(|g| Pattern::new(g))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(FileSyncSpec {
            root: self.root,
            includes,
            excludes,
            delete_extraneous: self.delete_extraneous,
        })
    }
}

/// Collapses `.` segments and rejects empty, absolute, backslashed, or
/// root-escaping paths.
fn normalize_wire_path(wire: &str) -> Option<String> {
    if wire.is_empty() || wire.starts_with('/') || wire.contains('\\') {
        return None;
    }
    let mut parts = Vec::new();
    for part in wire.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn to_wire_path(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        parts.push(component.as_os_str().to_str()?);
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if file_type.is_file() {
            out.push(entry.path());
        }
    }
    Ok(())
}

/// Write-to-temp then rename, so readers never observe a partial file.
fn write_replacing(target: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("file");
    let tmp_name = format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4());
    let tmp = match target.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    };
    fs::write(&tmp, contents)?;
    if let Err(error) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(error);
    }
    Ok(())
}
