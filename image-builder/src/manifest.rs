//! Dependency manifest parsing.
//!
//! Manifests use the requirements-file format understood by the package
//! installer: one requirement per line, optional version constraints or a
//! direct `name @ url` reference, environment markers after `;`, and
//! installer options on lines starting with `-` or trailing a requirement.
//! Lines ending in `\` continue on the next line. Local paths and archive
//! URLs are kept as opaque entries. Order is preserved so the installer sees
//! entries as written.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use crate::error::{ProvisionError, ProvisionResult};

/// Comparison operator of a version constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintOp {
    Exact,
    Arbitrary,
    NotEqual,
    AtLeast,
    AtMost,
    Greater,
    Less,
    Compatible,
}

impl ConstraintOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintOp::Exact => "==",
            ConstraintOp::Arbitrary => "===",
            ConstraintOp::NotEqual => "!=",
            ConstraintOp::AtLeast => ">=",
            ConstraintOp::AtMost => "<=",
            ConstraintOp::Greater => ">",
            ConstraintOp::Less => "<",
            ConstraintOp::Compatible => "~=",
        }
    }

    fn parse(op: &str) -> Option<Self> {
        Some(match op {
            "==" => ConstraintOp::Exact,
            "===" => ConstraintOp::Arbitrary,
            "!=" => ConstraintOp::NotEqual,
            ">=" => ConstraintOp::AtLeast,
            "<=" => ConstraintOp::AtMost,
            ">" => ConstraintOp::Greater,
            "<" => ConstraintOp::Less,
            "~=" => ConstraintOp::Compatible,
            _ => return None,
        })
    }
}

/// A single `(op, version)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionConstraint {
    pub op: ConstraintOp,
    pub version: String,
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// A package requirement from the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub extras: Vec<String>,
    pub constraints: Vec<VersionConstraint>,
    /// Direct reference (`name @ url`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub marker: Option<String>,
    /// Per-requirement installer options such as `--hash=sha256:...`.
    /// Not part of the display form.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

const NAME_PATTERN: &str = r"[A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?";

impl Requirement {
    /// Parse a single requirement such as `uvicorn[standard]>=0.23,<1; python_version>"3.8"`
    /// or `mypkg @ https://host/mypkg-1.0-py3-none-any.whl`
    pub fn parse(text: &str) -> Result<Self, String> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(&format!(r"^({})\s*(?:\[([^\]]*)\])?\s*(.*)$", NAME_PATTERN))
                .expect("requirement pattern is valid")
        });

        let text = text.trim();
        let captures = pattern
            .captures(text)
            .ok_or_else(|| format!("'{}' is not a valid requirement", text))?;

        let name = captures[1].to_string();
        let extras = captures
            .get(2)
            .map(|m| {
                m.as_str()
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let rest = captures.get(3).map_or("", |m| m.as_str());
        let (url, constraints, marker) = match rest.strip_prefix('@') {
            Some(reference) => {
                let (url, marker) = split_url_marker(reference);
                if url.is_empty() {
                    return Err(format!("'{}' has an empty direct reference", text));
                }
                (Some(url.to_string()), Vec::new(), marker)
            }
            None => {
                let (spec, marker) = match rest.split_once(';') {
                    Some((spec, marker)) => (spec, Some(marker)),
                    None => (rest, None),
                };
                // `name (>=1.0)` is an older spelling of `name>=1.0`.
                let spec = spec.trim();
                let spec = spec
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .unwrap_or(spec)
                    .trim();
                let constraints = if spec.is_empty() {
                    Vec::new()
                } else {
                    parse_constraints(spec)?
                };
                (None, constraints, marker)
            }
        };

        let marker = marker
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string);

        Ok(Self {
            name,
            extras,
            constraints,
            url,
            marker,
            options: Vec::new(),
        })
    }

    /// Name normalized for comparison (`Foo_Bar.baz` -> `foo-bar-baz`)
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// The exact version this requirement pins, if it pins one
    pub fn pinned_version(&self) -> Option<&str> {
        match self.constraints.as_slice() {
            [VersionConstraint {
                op: ConstraintOp::Exact | ConstraintOp::Arbitrary,
                version,
            }] if !version.contains('*') => Some(version),
            _ => None,
        }
    }

    /// Whether the requirement carries no version constraint or direct reference
    pub fn is_unconstrained(&self) -> bool {
        self.constraints.is_empty() && self.url.is_none()
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(url) = &self.url {
            // The marker separator after a URL needs leading whitespace.
            write!(f, " @ {}", url)?;
            if let Some(marker) = &self.marker {
                write!(f, " ; {}", marker)?;
            }
            return Ok(());
        }
        let constraints: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", constraints.join(","))?;
        if let Some(marker) = &self.marker {
            write!(f, "; {}", marker)?;
        }
        Ok(())
    }
}

/// Split `url ; marker`. A `;` only starts the marker after whitespace.
fn split_url_marker(reference: &str) -> (&str, Option<&str>) {
    let bytes = reference.as_bytes();
    match (1..bytes.len()).find(|&i| bytes[i] == b';' && bytes[i - 1].is_ascii_whitespace()) {
        Some(i) => (reference[..i].trim(), Some(&reference[i + 1..])),
        None => (reference.trim(), None),
    }
}

fn parse_constraints(spec: &str) -> Result<Vec<VersionConstraint>, String> {
    static CONSTRAINT: OnceLock<Regex> = OnceLock::new();
    let pattern = CONSTRAINT.get_or_init(|| {
        Regex::new(r"^(===|==|!=|>=|<=|~=|>|<)\s*([A-Za-z0-9][A-Za-z0-9.*+!_-]*)$")
            .expect("constraint pattern is valid")
    });

    spec.split(',')
        .map(str::trim)
        .map(|part| {
            let captures = pattern
                .captures(part)
                .ok_or_else(|| format!("invalid version constraint '{}'", part))?;
            let op = ConstraintOp::parse(&captures[1])
                .ok_or_else(|| format!("unknown operator '{}'", &captures[1]))?;
            Ok(VersionConstraint {
                op,
                version: captures[2].to_string(),
            })
        })
        .collect()
}

/// Normalize a package name for comparison
pub fn normalize_name(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                normalized.push('-');
            }
            in_separator = true;
        } else {
            normalized.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    normalized
}

/// One meaningful line of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ManifestEntry {
    Requirement(Requirement),
    /// Installer option line such as `--extra-index-url ...` or `-r base.txt`
    InstallerOption(String),
    /// Local path or archive URL, passed to the installer as written
    Reference(String),
}

/// Ordered package-name/version constraints read by the installer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyManifest {
    entries: Vec<ManifestEntry>,
}

impl DependencyManifest {
    pub fn parse(content: &str) -> ProvisionResult<Self> {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for (line_number, logical) in logical_lines(content) {
            let line = strip_comment(&logical).trim();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('-') {
                entries.push(ManifestEntry::InstallerOption(line.to_string()));
                continue;
            }

            let (spec, options) = split_options(line);
            if is_reference(spec) {
                entries.push(ManifestEntry::Reference(line.to_string()));
                continue;
            }

            let mut requirement =
                Requirement::parse(spec).map_err(|reason| ProvisionError::InvalidManifest {
                    line: line_number,
                    reason,
                })?;
            requirement.options = options;

            // Marker-qualified duplicates target different platforms.
            if requirement.marker.is_none() && !seen.insert(requirement.normalized_name()) {
                return Err(ProvisionError::InvalidManifest {
                    line: line_number,
                    reason: format!("duplicate requirement '{}'", requirement.name),
                });
            }

            entries.push(ManifestEntry::Requirement(requirement));
        }

        Ok(Self { entries })
    }

    /// Read and parse a manifest file
    pub fn from_file(path: &Path) -> ProvisionResult<Self> {
        if !path.is_file() {
            return Err(ProvisionError::MissingSource {
                what: "dependency manifest",
                path: path.to_path_buf(),
            });
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.entries.iter().filter_map(|entry| match entry {
            ManifestEntry::Requirement(requirement) => Some(requirement),
            ManifestEntry::InstallerOption(_) | ManifestEntry::Reference(_) => None,
        })
    }

    /// Everything the installer will fetch: requirements and opaque references
    pub fn packages(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                ManifestEntry::Requirement(requirement) => Some(requirement.to_string()),
                ManifestEntry::Reference(reference) => Some(reference.clone()),
                ManifestEntry::InstallerOption(_) => None,
            })
            .collect()
    }

    /// Look up a requirement by (normalized) name
    pub fn get(&self, name: &str) -> Option<&Requirement> {
        let wanted = normalize_name(name);
        self.requirements()
            .find(|requirement| requirement.normalized_name() == wanted)
    }

    /// Requirements pinned to an exact version on every platform, as `(name, version)`.
    /// Marker-qualified pins are left out.
    pub fn pins(&self) -> Vec<(&str, &str)> {
        self.requirements()
            .filter(|r| r.marker.is_none())
            .filter_map(|r| r.pinned_version().map(|v| (r.name.as_str(), v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Join `\`-continued lines, keeping the number of the first physical line
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut logical = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, line) in content.lines().enumerate() {
        let comment = line.trim_start().starts_with('#');
        match line.strip_suffix('\\') {
            Some(head) if !comment => {
                pending
                    .get_or_insert_with(|| (index + 1, String::new()))
                    .1
                    .push_str(head);
            }
            _ => {
                let (number, mut joined) = pending
                    .take()
                    .unwrap_or_else(|| (index + 1, String::new()));
                // A comment ends the continuation and is stripped with it.
                if comment && !joined.is_empty() {
                    joined.push(' ');
                }
                joined.push_str(line);
                logical.push((number, joined));
            }
        }
    }
    if let Some(last) = pending {
        logical.push(last);
    }
    logical
}

/// Split trailing ` --option` tokens off a requirement line
fn split_options(line: &str) -> (&str, Vec<String>) {
    let bytes = line.as_bytes();
    match (1..bytes.len()).find(|&i| bytes[i] == b'-' && bytes[i - 1].is_ascii_whitespace()) {
        Some(i) => (
            line[..i].trim_end(),
            line[i..].split_whitespace().map(str::to_string).collect(),
        ),
        None => (line, Vec::new()),
    }
}

const ARCHIVE_SUFFIXES: &[&str] = &[".whl", ".tar.gz", ".tgz", ".tar.bz2", ".tar.xz", ".zip"];

/// Whether a line names a local path or URL rather than a package
fn is_reference(spec: &str) -> bool {
    static DIRECT: OnceLock<Regex> = OnceLock::new();
    let direct = DIRECT.get_or_init(|| {
        Regex::new(&format!(r"^{}\s*(?:\[[^\]]*\])?\s*@", NAME_PATTERN))
            .expect("direct reference pattern is valid")
    });
    if direct.is_match(spec) {
        return false;
    }

    let first = spec.split_whitespace().next().unwrap_or_default();
    first.contains("://")
        || first.starts_with("file:")
        || first.starts_with(['.', '/', '~'])
        || first.contains(['/', '\\'])
        || ARCHIVE_SUFFIXES.iter().any(|suffix| first.ends_with(suffix))
}

fn strip_comment(line: &str) -> &str {
    if line.trim_start().starts_with('#') {
        return "";
    }
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && i > 0 && bytes[i - 1].is_ascii_whitespace() {
            return &line[..i];
        }
    }
    line
}
