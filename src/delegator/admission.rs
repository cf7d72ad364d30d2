//! Pre-flight admission: bounds and sensitive-path checks.
//!
//! Runs against the resource sources before anything is materialized or
//! sent, applying the same selection rules the transport will use. A
//! refusal therefore never leaves a half-constructed export behind.

use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{info, info_span};
use walkdir::WalkDir;

use crate::config::AdmissionConfig;
use crate::errors::{ErrorCode, ProtocolError};
use crate::models::delegation::AdmissionReport;
use crate::models::resource::Resource;
use crate::{AwcpError, Result};

/// Directory names never shipped to an executor.
///
/// The admission scan and the materializer both honor this list so the
/// measured workspace is exactly the workspace that gets transferred.
pub const SKIPPED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
];

/// Evaluates workspace bounds before an INVITE is sent.
pub struct AdmissionController {
    config: AdmissionConfig,
    sensitive: Option<GlobSet>,
}

impl AdmissionController {
    /// Build a controller, compiling the sensitive-path patterns.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Config` if a sensitive pattern is not a valid
    /// glob.
    pub fn new(config: AdmissionConfig) -> Result<Self> {
        let sensitive = if config.skip_sensitive_check {
            None
        } else {
            Some(compile_patterns(&config.sensitive_patterns)?)
        };
        Ok(Self { config, sensitive })
    }

    /// Scan the declared resources and admit or refuse the delegation.
    ///
    /// # Errors
    ///
    /// Returns `AwcpError::Protocol` with `WORKSPACE_TOO_LARGE` naming the
    /// exceeded bound, or with `DECLINED` when a sensitive path matches.
    /// Filesystem failures surface as `AwcpError::Admission`.
    pub fn admit(&self, delegation_id: &str, resources: &[Resource]) -> Result<AdmissionReport> {
        let span = info_span!("admission_scan", delegation_id);
        let _guard = span.enter();

        let mut report = AdmissionReport::default();
        let mut sensitive_matches: Vec<String> = Vec::new();

        for resource in resources {
            let source = Path::new(&resource.source);
            if !source.is_dir() {
                return Err(AwcpError::Admission(format!(
                    "resource '{}' source {} is not a directory",
                    resource.name,
                    source.display()
                )));
            }
            let rules = resource.selection()?;

            let walker = WalkDir::new(source).into_iter().filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
            });

            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(source)
                    .map_err(|err| AwcpError::Admission(format!("admission prefix: {err}")))?;
                if !rules.matches(rel) {
                    continue;
                }

                if let Some(sensitive) = &self.sensitive {
                    if sensitive.is_match(rel) || sensitive.is_match(entry.path()) {
                        sensitive_matches.push(format!("{}/{}", resource.name, rel.display()));
                        continue;
                    }
                }

                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                report.total_bytes += size;
                report.file_count += 1;
                report.largest_file_bytes = report.largest_file_bytes.max(size);
            }
        }

        if !sensitive_matches.is_empty() {
            sensitive_matches.truncate(10);
            return Err(ProtocolError::new(
                ErrorCode::Declined,
                format!(
                    "{} sensitive path(s) matched the exclusion patterns",
                    sensitive_matches.len()
                ),
            )
            .with_hint(format!(
                "matched: {}; exclude them or set skip_sensitive_check",
                sensitive_matches.join(", ")
            ))
            .into());
        }

        self.check_bounds(&report)?;

        info!(
            delegation_id,
            total_bytes = report.total_bytes,
            file_count = report.file_count,
            largest_file_bytes = report.largest_file_bytes,
            "admission passed"
        );
        Ok(report)
    }

    fn check_bounds(&self, report: &AdmissionReport) -> Result<()> {
        if report.total_bytes > self.config.max_total_bytes {
            return Err(too_large(format!(
                "total size {} exceeds max_total_bytes {}",
                report.total_bytes, self.config.max_total_bytes
            )));
        }
        if report.file_count > self.config.max_file_count {
            return Err(too_large(format!(
                "file count {} exceeds max_file_count {}",
                report.file_count, self.config.max_file_count
            )));
        }
        if report.largest_file_bytes > self.config.max_single_file_bytes {
            return Err(too_large(format!(
                "largest file {} exceeds max_single_file_bytes {}",
                report.largest_file_bytes, self.config.max_single_file_bytes
            )));
        }
        Ok(())
    }
}

fn too_large(message: String) -> AwcpError {
    ProtocolError::new(ErrorCode::WorkspaceTooLarge, message)
        .with_hint("narrow the resource selection or raise the admission bounds")
        .into()
}

fn compile_patterns(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|err| {
            AwcpError::Config(format!("invalid sensitive pattern '{pattern}': {err}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|err| AwcpError::Config(format!("sensitive pattern set: {err}")))
}
