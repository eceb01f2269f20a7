use chrono::Utc;
use serde::{Deserialize, Serialize};

pub type GroupId = i64;
pub type RuleId = i64;

fn default_enabled() -> bool {
    true
}

/// A single "URL contains pattern → redirect" rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: RuleId,
    pub pattern: String,
    pub redirect: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A named, independently switchable collection of rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            rules: Vec::new(),
        }
    }

    pub fn rule(&self, rule_id: RuleId) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }

    pub fn rule_mut(&mut self, rule_id: RuleId) -> Option<&mut Rule> {
        self.rules.iter_mut().find(|r| r.id == rule_id)
    }

    /// Rules that would become active directives
    pub fn active_rules(&self) -> impl Iterator<Item = &Rule> {
        let group_enabled = self.enabled;
        self.rules.iter().filter(move |r| group_enabled && r.enabled)
    }
}

/// In-progress rule form, persisted under the `formData` key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormData {
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub redirect: String,
    /// Selected group as the form keeps it: empty string means "none"
    #[serde(default)]
    pub group_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl FormData {
    pub fn new(group_id: GroupId, pattern: &str, redirect: &str, enabled: bool) -> Self {
        Self {
            pattern: pattern.to_string(),
            redirect: redirect.to_string(),
            group_id: group_id.to_string(),
            enabled,
        }
    }

    pub fn empty() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }

    pub fn selected_group(&self) -> Option<GroupId> {
        self.group_id.trim().parse().ok()
    }
}

pub fn find_group(groups: &[Group], group_id: GroupId) -> Option<&Group> {
    groups.iter().find(|g| g.id == group_id)
}

pub fn find_group_mut(groups: &mut [Group], group_id: GroupId) -> Option<&mut Group> {
    groups.iter_mut().find(|g| g.id == group_id)
}

/// Timestamp-derived id, bumped past `taken` so it stays unique in its scope
pub fn next_timestamp_id<I>(taken: I) -> i64
where
    I: IntoIterator<Item = i64>,
{
    let now = Utc::now().timestamp_millis();
    match taken.into_iter().max() {
        Some(max) if max >= now => max + 1,
        _ => now,
    }
}
