//! Knowledge base loading and validation.
//!
//! The loader reads a directory of YAML runbook files, validates every
//! entry, and excludes anything malformed:
//! - duplicate entry, cause, probe, or action ids
//! - probes not marked read-only (the executor only auto-schedules
//!   read-only commands)
//! - expected-signal regexes or command templates that do not compile
//! - dangling `related`, `rollback_ref`, or `verify_probe_ref` references
//!
//! Exclusions are logged and reported in the [`LoadReport`]; the rest of
//! the corpus stays usable.

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use super::types::{ExpectedSignal, RunbookEntry};
use super::KnowledgeBase;
use crate::error::KnowledgeBaseError;
use crate::template::TemplateEngine;

/// Outcome of a knowledge base load.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadReport {
    /// Ids of entries accepted into the knowledge base
    pub loaded: Vec<String>,
    /// Entries or files that were rejected, with reasons
    pub excluded: Vec<ExcludedEntry>,
}

/// A rejected entry or file.
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedEntry {
    /// Entry id, or the file name when the document failed to parse
    pub source: String,
    /// Why it was rejected
    pub reason: String,
}

impl LoadReport {
    fn exclude(&mut self, source: impl Into<String>, reason: impl Into<String>) {
        let source = source.into();
        let reason = reason.into();
        warn!(source = %source, reason = %reason, "excluding runbook entry");
        self.excluded.push(ExcludedEntry { source, reason });
    }
}

/// Load every `*.yaml`/`*.yml` file under `dir`.
///
/// # Errors
///
/// Returns [`KnowledgeBaseError::Io`] if the directory itself cannot be
/// read. Per-entry problems are reported, not raised.
pub fn load_dir(dir: &Path) -> Result<(KnowledgeBase, LoadReport), KnowledgeBaseError> {
    let mut report = LoadReport::default();
    let mut parsed = Vec::new();

    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(|source| KnowledgeBaseError::Io {
            path: dir.display().to_string(),
            source,
        })?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        })
        .collect();
    // Deterministic load order so duplicate-id resolution is stable.
    paths.sort();

    for path in paths {
        let file = path.display().to_string();
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) => {
                report.exclude(file, format!("unreadable file: {e}"));
                continue;
            }
        };
        match parse_file(&text) {
            Ok(entries) => parsed.extend(entries),
            Err(e) => report.exclude(file, format!("malformed YAML: {e}")),
        }
    }

    let kb = load_entries(parsed, &mut report);
    info!(
        loaded = kb.len(),
        excluded = report.excluded.len(),
        "knowledge base loaded"
    );
    Ok((kb, report))
}

/// Validate parsed entries and build the knowledge base.
///
/// Exposed separately so callers holding in-memory entries (tests, an
/// embedded corpus) share the exact validation path of [`load_dir`].
pub fn load_entries(entries: Vec<RunbookEntry>, report: &mut LoadReport) -> KnowledgeBase {
    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut valid: Vec<RunbookEntry> = Vec::new();

    for entry in entries {
        if !seen_ids.insert(entry.id.clone()) {
            report.exclude(entry.id.clone(), "duplicate entry id");
            continue;
        }
        match validate_entry(&entry) {
            Ok(()) => valid.push(entry),
            Err(reason) => report.exclude(entry.id.clone(), reason),
        }
    }

    // Dangling related references exclude the referring entry. Removing
    // an entry can strand its referrers in turn, so run to a fixpoint;
    // each pass removes at least one entry, bounding the loop.
    loop {
        let ids: HashSet<&str> = valid.iter().map(|e| e.id.as_str()).collect();
        let Some(pos) = valid.iter().position(|e| {
            e.related.iter().any(|r| !ids.contains(r.as_str()))
        }) else {
            break;
        };
        let entry = valid.remove(pos);
        let dangling: Vec<&str> = {
            let ids: HashSet<&str> = valid.iter().map(|e| e.id.as_str()).collect();
            entry
                .related
                .iter()
                .map(String::as_str)
                .filter(|r| !ids.contains(r) && *r != entry.id)
                .collect()
        };
        report.exclude(
            entry.id.clone(),
            format!("dangling related reference: {}", dangling.join(", ")),
        );
    }

    report.loaded = valid.iter().map(|e| e.id.clone()).collect();
    KnowledgeBase::from_entries(valid)
}

fn parse_file(text: &str) -> Result<Vec<RunbookEntry>, serde_yaml::Error> {
    // A file holds either a list of entries or a single entry.
    match serde_yaml::from_str::<Vec<RunbookEntry>>(text) {
        Ok(entries) => Ok(entries),
        Err(list_err) => serde_yaml::from_str::<RunbookEntry>(text)
            .map(|e| vec![e])
            .map_err(|_| list_err),
    }
}

fn validate_entry(entry: &RunbookEntry) -> Result<(), String> {
    if entry.id.trim().is_empty() {
        return Err("empty entry id".to_string());
    }
    if entry.causes.is_empty() {
        return Err("entry declares no causes".to_string());
    }

    let mut cause_ids = HashSet::new();
    let mut probe_ids = HashSet::new();
    let mut action_ids = HashSet::new();

    for cause in &entry.causes {
        if !cause_ids.insert(cause.id.as_str()) {
            return Err(format!("duplicate cause id: {}", cause.id));
        }
        if let Some(prior) = cause.prior {
            if !prior.is_finite() || prior <= 0.0 {
                return Err(format!("cause {}: prior must be finite and > 0", cause.id));
            }
        }
        for probe in &cause.probes {
            if !probe_ids.insert(probe.id.as_str()) {
                return Err(format!("duplicate probe id: {}", probe.id));
            }
            if !probe.read_only {
                return Err(format!("probe {} is not marked read-only", probe.id));
            }
            if probe.timeout_secs == 0 {
                return Err(format!("probe {}: zero timeout", probe.id));
            }
            TemplateEngine::validate(&probe.command_template)
                .map_err(|e| format!("probe {}: bad command template: {e}", probe.id))?;
            if let Some(target) = &probe.target_resource {
                TemplateEngine::validate(target)
                    .map_err(|e| format!("probe {}: bad target template: {e}", probe.id))?;
            }
            if let ExpectedSignal::OutputMatches { pattern } = &probe.expected_signal {
                regex::Regex::new(pattern)
                    .map_err(|e| format!("probe {}: bad signal pattern: {e}", probe.id))?;
            }
        }
        for action in &cause.actions {
            if !action_ids.insert(action.id.as_str()) {
                return Err(format!("duplicate action id: {}", action.id));
            }
            TemplateEngine::validate(&action.command_template)
                .map_err(|e| format!("action {}: bad command template: {e}", action.id))?;
            if let Some(target) = &action.target_resource {
                TemplateEngine::validate(target)
                    .map_err(|e| format!("action {}: bad target template: {e}", action.id))?;
            }
        }
    }

    // Reference checks need the full id sets, so run after collection.
    for cause in &entry.causes {
        for action in &cause.actions {
            if let Some(rollback) = &action.rollback_ref {
                if !action_ids.contains(rollback.as_str()) {
                    return Err(format!(
                        "action {}: dangling rollback_ref {rollback}",
                        action.id
                    ));
                }
            }
            if let Some(verify) = &action.verify_probe_ref {
                if !probe_ids.contains(verify.as_str()) {
                    return Err(format!(
                        "action {}: dangling verify_probe_ref {verify}",
                        action.id
                    ));
                }
            }
        }
    }

    Ok(())
}
