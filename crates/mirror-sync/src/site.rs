use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Unique identifier for a mirrored site.
/// Doubles as the destination directory name and the state key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Protocol used to reach an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMethod {
    Rsync,
    Http,
    Https,
    Ftp,
}

impl FetchMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "rsync" => Some(Self::Rsync),
            "http" => Some(Self::Http),
            "https" => Some(Self::Https),
            "ftp" => Some(Self::Ftp),
            _ => None,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::Http => "http",
            Self::Https => "https",
            Self::Ftp => "ftp",
        }
    }
}

impl fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Which transfer tool keeps a site in sync, with its tool-specific settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SiteKind {
    Rsync,
    Debmirror {
        distributions: Vec<String>,
        architectures: Vec<String>,
        sections: Vec<String>,
        method: FetchMethod,
    },
    Reposync {
        method: FetchMethod,
    },
}

impl SiteKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::Debmirror { .. } => "debmirror",
            Self::Reposync { .. } => "reposync",
        }
    }

    pub fn method(&self) -> FetchMethod {
        match self {
            Self::Rsync => FetchMethod::Rsync,
            Self::Debmirror { method, .. } | Self::Reposync { method } => *method,
        }
    }

    /// Whether the tool can split a sync into content and metadata passes.
    pub fn supports_staging(&self) -> bool {
        !matches!(self, Self::Reposync { .. })
    }
}

/// A validated, immutable mirror definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteConfig {
    pub id: SiteId,
    pub name: String,
    pub kind: SiteKind,
    pub host: String,
    pub remote_dir: String,
    pub dest: PathBuf,
    pub exclude_patterns: Vec<String>,
    pub precheck_file: Option<String>,
    pub first_stage_exclude_patterns: Vec<String>,
    pub bandwidth_limit_mbps: Option<u32>,
}

impl SiteConfig {
    /// Two-stage mode is implied by any first-stage exclude pattern.
    pub fn is_two_stage(&self) -> bool {
        !self.first_stage_exclude_patterns.is_empty()
    }

    /// Upstream root, without a trailing slash.
    pub fn upstream_url(&self) -> String {
        let scheme = self.kind.method().scheme();
        if self.remote_dir.is_empty() {
            format!("{scheme}://{}", self.host)
        } else {
            format!("{scheme}://{}/{}", self.host, self.remote_dir)
        }
    }

    /// Full upstream location of the precheck file, when one is configured.
    pub fn precheck_url(&self) -> Option<String> {
        self.precheck_file
            .as_deref()
            .map(|file| format!("{}/{}", self.upstream_url(), file.trim_start_matches('/')))
    }
}

/// The on-disk (TOML) shape of a site before validation.
///
/// Every field is optional so that a single malformed site is rejected on
/// its own instead of failing the whole configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SiteEntry {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub host: Option<String>,
    pub remote_dir: Option<String>,
    pub dest: Option<PathBuf>,
    #[serde(default)]
    pub exclude: Vec<String>,
    pub precheck_file: Option<String>,
    #[serde(default)]
    pub first_stage_exclude: Vec<String>,
    pub bandwidth_limit_mbps: Option<u32>,
    #[serde(default)]
    pub distributions: Vec<String>,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub sections: Vec<String>,
    pub method: Option<String>,
}

/// Why a site entry was refused at load time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid site id `{0}`: must be a single non-empty path component")]
    InvalidId(String),

    #[error("duplicate site id `{0}`")]
    DuplicateId(SiteId),

    #[error("unknown site type `{0}`")]
    UnknownKind(String),

    #[error("fetch method `{method}` is not supported for {kind} sites")]
    UnsupportedMethod { kind: &'static str, method: String },

    #[error("{0} sites cannot run a two-stage sync")]
    StagingUnsupported(&'static str),
}

/// A site entry that will never be scheduled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedSite {
    /// The entry's id, or its position when it has none.
    pub label: String,
    pub id: Option<SiteId>,
    pub reason: ConfigError,
}

/// The outcome of validating every configured site.
#[derive(Debug, Clone, Default)]
pub struct SiteSet {
    pub accepted: Vec<SiteConfig>,
    pub rejected: Vec<RejectedSite>,
}

/// Validate site entries, resolving destinations under `dest_root`.
///
/// The first entry claiming an id wins; later entries with the same id are
/// rejected. Rejections never affect the other entries.
pub fn load_sites(entries: &[SiteEntry], dest_root: &Path) -> SiteSet {
    let mut set = SiteSet::default();
    let mut seen = HashSet::new();

    for (index, entry) in entries.iter().enumerate() {
        let label = entry
            .id
            .clone()
            .unwrap_or_else(|| format!("#{}", index + 1));

        if let Some(id) = &entry.id
            && !seen.insert(id.clone())
        {
            set.rejected.push(RejectedSite {
                label,
                id: Some(SiteId::new(id)),
                reason: ConfigError::DuplicateId(SiteId::new(id)),
            });
            continue;
        }

        match validate_entry(entry, dest_root) {
            Ok(site) => set.accepted.push(site),
            Err(reason) => set.rejected.push(RejectedSite {
                label,
                id: entry.id.as_deref().map(SiteId::new),
                reason,
            }),
        }
    }

    set
}

fn validate_entry(entry: &SiteEntry, dest_root: &Path) -> Result<SiteConfig, ConfigError> {
    let id = entry.id.as_deref().ok_or(ConfigError::MissingField("id"))?;
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\\') {
        return Err(ConfigError::InvalidId(id.to_owned()));
    }

    let kind = parse_kind(entry)?;
    let host = required(&entry.host, "host")?;
    let remote_dir = required(&entry.remote_dir, "remote_dir")?
        .trim_matches('/')
        .to_owned();

    let first_stage_exclude_patterns = non_empty(&entry.first_stage_exclude);
    if !first_stage_exclude_patterns.is_empty() && !kind.supports_staging() {
        return Err(ConfigError::StagingUnsupported(kind.label()));
    }

    Ok(SiteConfig {
        id: SiteId::new(id),
        name: entry.name.clone().unwrap_or_else(|| id.to_owned()),
        kind,
        host,
        remote_dir,
        dest: entry.dest.clone().unwrap_or_else(|| dest_root.join(id)),
        exclude_patterns: non_empty(&entry.exclude),
        precheck_file: entry.precheck_file.clone().filter(|f| !f.trim().is_empty()),
        first_stage_exclude_patterns,
        bandwidth_limit_mbps: entry.bandwidth_limit_mbps,
    })
}

fn parse_kind(entry: &SiteEntry) -> Result<SiteKind, ConfigError> {
    let kind = entry.kind.as_deref().ok_or(ConfigError::MissingField("type"))?;

    match kind.to_lowercase().as_str() {
        "rsync" => match entry.method.as_deref() {
            None => Ok(SiteKind::Rsync),
            Some(m) if FetchMethod::parse(m) == Some(FetchMethod::Rsync) => Ok(SiteKind::Rsync),
            Some(m) => Err(ConfigError::UnsupportedMethod {
                kind: "rsync",
                method: m.to_owned(),
            }),
        },
        "debmirror" => {
            let method = parse_method(entry, "debmirror", FetchMethod::Rsync, |_| true)?;
            let distributions = required_list(&entry.distributions, "distributions")?;
            let architectures = required_list(&entry.architectures, "architectures")?;
            let sections = required_list(&entry.sections, "sections")?;
            Ok(SiteKind::Debmirror {
                distributions,
                architectures,
                sections,
                method,
            })
        }
        "reposync" => {
            let method = parse_method(entry, "reposync", FetchMethod::Https, |m| {
                m != FetchMethod::Rsync
            })?;
            Ok(SiteKind::Reposync { method })
        }
        other => Err(ConfigError::UnknownKind(other.to_owned())),
    }
}

fn parse_method(
    entry: &SiteEntry,
    kind: &'static str,
    default: FetchMethod,
    allowed: impl Fn(FetchMethod) -> bool,
) -> Result<FetchMethod, ConfigError> {
    let Some(raw) = entry.method.as_deref() else {
        return Ok(default);
    };

    FetchMethod::parse(raw)
        .filter(|m| allowed(*m))
        .ok_or_else(|| ConfigError::UnsupportedMethod {
            kind,
            method: raw.to_owned(),
        })
}

fn required(value: &Option<String>, field: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .ok_or(ConfigError::MissingField(field))
}

fn required_list(values: &[String], field: &'static str) -> Result<Vec<String>, ConfigError> {
    let list = non_empty(values);
    if list.is_empty() {
        return Err(ConfigError::MissingField(field));
    }
    Ok(list)
}

fn non_empty(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect()
}
