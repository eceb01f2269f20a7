use anyhow::{bail, Context, Result};
use regex::Regex;
use rusqlite::{Connection, TransactionBehavior};
use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
#[cfg(test)]
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::directive::Directive;

/// One bulk change to the installed directive set: removals apply first
#[derive(Debug, Clone, Default)]
pub struct RuleUpdate {
    pub remove_rule_ids: Vec<u32>,
    pub add_rules: Vec<Directive>,
}

impl RuleUpdate {
    pub fn remove(ids: Vec<u32>) -> Self {
        Self {
            remove_rule_ids: ids,
            add_rules: Vec::new(),
        }
    }

    pub fn add(rules: Vec<Directive>) -> Self {
        Self {
            remove_rule_ids: Vec::new(),
            add_rules: rules,
        }
    }
}

/// The request-interception engine that actually performs redirects
pub trait RuleEngine: Send + Sync {
    fn name(&self) -> &'static str;
    /// Directives currently installed by this system
    fn get_dynamic_rules(&self) -> Result<Vec<Directive>>;
    /// Apply `update` as a unit: either all of it lands or none of it
    fn update_dynamic_rules(&self, update: RuleUpdate) -> Result<()>;
    /// Run one list/remove/add pass with no other writer of the same
    /// installed set in between
    fn exclusive(&self, pass: &mut dyn FnMut()) -> Result<()> {
        pass();
        Ok(())
    }
}

/// Compute the installed set after `update`, validating the way a host engine
/// does: ids must be non-zero and unique, filters must compile.
pub fn apply_update(current: &[Directive], update: &RuleUpdate) -> Result<Vec<Directive>> {
    let removed: HashSet<u32> = update.remove_rule_ids.iter().copied().collect();
    let mut next: Vec<Directive> = current
        .iter()
        .filter(|d| !removed.contains(&d.id))
        .cloned()
        .collect();

    let mut ids: HashSet<u32> = next.iter().map(|d| d.id).collect();
    for directive in &update.add_rules {
        if directive.id == 0 {
            bail!("Rule id must be at least 1");
        }
        if !ids.insert(directive.id) {
            bail!("Rule with id {} does not have a unique ID", directive.id);
        }
        Regex::new(&directive.condition.regex_filter).with_context(|| {
            format!("Rule with id {} has an invalid regexFilter", directive.id)
        })?;
        next.push(directive.clone());
    }
    Ok(next)
}

/// How long a pass waits for another process to finish its own
const PASS_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Directives kept in a JSON file, standing in for the browser's dynamic rule set.
///
/// Several processes may sync into the same file, so each pass holds a write
/// transaction on a sibling SQLite lock database for its whole duration.
pub struct FileRuleEngine {
    path: PathBuf,
}

impl FileRuleEngine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<Directive>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        let directives = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {:?}", self.path))?;
        Ok(directives)
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    fn save(&self, directives: &[Directive]) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let content = serde_json::to_string_pretty(directives)?;
        // Write-then-rename so a crash never leaves a half-written rule file
        let mut tmp = NamedTempFile::new_in(&dir)
            .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
        tmp.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write {:?}", tmp.path()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {:?}", self.path))?;
        Ok(())
    }
}

impl RuleEngine for FileRuleEngine {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get_dynamic_rules(&self) -> Result<Vec<Directive>> {
        self.load()
    }

    fn update_dynamic_rules(&self, update: RuleUpdate) -> Result<()> {
        let current = self.load()?;
        let next = apply_update(&current, &update)?;
        self.save(&next)?;
        debug!(
            "Engine file updated: -{} +{} => {} installed",
            update.remove_rule_ids.len(),
            update.add_rules.len(),
            next.len()
        );
        Ok(())
    }

    fn exclusive(&self, pass: &mut dyn FnMut()) -> Result<()> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(&lock_path)
            .with_context(|| format!("Failed to open lock {:?}", lock_path))?;
        conn.busy_timeout(PASS_LOCK_TIMEOUT)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .with_context(|| format!("Timed out waiting for lock {:?}", lock_path))?;
        debug!("Holding sync lock {:?}", lock_path);
        pass();
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
pub use memory::MemoryRuleEngine;
