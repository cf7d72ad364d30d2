//! Delegated environment resources and path selection rules.

use std::fmt::{Display, Formatter};
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::{AwcpError, Result};

/// Access mode granted on a resource or lease.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Read-only: the resource never appears in an applied snapshot delta.
    Ro,
    /// Read-write: executor changes flow back through snapshots.
    Rw,
}

impl Display for AccessMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ro => f.write_str("ro"),
            Self::Rw => f.write_str("rw"),
        }
    }
}

/// A named piece of the delegated environment.
///
/// `source` interpretation belongs to the transport adapter; for `fs`
/// resources it is a directory path on the delegator host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resource {
    /// Name, unique within the environment; becomes the top-level directory
    /// of the materialized export tree.
    pub name: String,
    /// Resource type tag, e.g. `"fs"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Adapter-interpreted source locator.
    pub source: String,
    /// Declared access mode.
    pub mode: AccessMode,
    /// Glob patterns selecting paths for transfer; empty means everything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<Vec<String>>,
    /// Glob patterns excluding paths; exclusion wins over inclusion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<Vec<String>>,
}

impl Resource {
    /// Build a plain `fs` resource with no selection rules.
    #[must_use]
    pub fn fs(name: impl Into<String>, source: impl Into<String>, mode: AccessMode) -> Self {
        Self {
            name: name.into(),
            kind: "fs".into(),
            source: source.into(),
            mode,
            include: None,
            exclude: None,
        }
    }

    /// Compile this resource's include/exclude globs into matchable rules.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Config` if any pattern is not a valid glob.
    pub fn selection(&self) -> Result<SelectionRules> {
        SelectionRules::compile(self.include.as_deref(), self.exclude.as_deref())
    }
}

/// Compiled include/exclude matcher for paths relative to a resource root.
///
/// Both the admission scan and transport adapters consult the same rules so
/// a path is either transferable everywhere or nowhere.
#[derive(Debug, Clone)]
pub struct SelectionRules {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl SelectionRules {
    /// Compile rule sets from raw glob patterns.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Config` if any pattern is not a valid glob.
    pub fn compile(include: Option<&[String]>, exclude: Option<&[String]>) -> Result<Self> {
        Ok(Self {
            include: build_glob_set(include)?,
            exclude: build_glob_set(exclude)?,
        })
    }

    /// Rules that admit every path.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            include: None,
            exclude: None,
        }
    }

    /// Whether a resource-relative path is a candidate for transfer.
    #[must_use]
    pub fn matches(&self, relative: &Path) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(relative) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(relative),
            None => true,
        }
    }
}

fn build_glob_set(patterns: Option<&[String]>) -> Result<Option<GlobSet>> {
    let Some(patterns) = patterns else {
        return Ok(None);
    };
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|err| AwcpError::Config(format!("invalid glob '{pattern}': {err}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|err| AwcpError::Config(format!("failed to build glob set: {err}")))
}
