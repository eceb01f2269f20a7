//! Active redirect directives
//!
//! A directive is what the request-interception engine actually consumes: one
//! per enabled rule of an enabled group, matching the rule's pattern as a
//! literal substring anywhere in the request URL.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::Group;

/// Priority shared by every directive; ties fall back to install order
pub const DEFAULT_PRIORITY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MainFrame,
    SubFrame,
    #[serde(rename = "xmlhttprequest")]
    XmlHttpRequest,
    Script,
    Stylesheet,
    Image,
    Font,
    Media,
    Websocket,
    Other,
}

impl ResourceType {
    /// Every category a redirect applies to
    pub const ALL: [ResourceType; 10] = [
        ResourceType::MainFrame,
        ResourceType::SubFrame,
        ResourceType::XmlHttpRequest,
        ResourceType::Script,
        ResourceType::Stylesheet,
        ResourceType::Image,
        ResourceType::Font,
        ResourceType::Media,
        ResourceType::Websocket,
        ResourceType::Other,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ResourceType::MainFrame => "main_frame",
            ResourceType::SubFrame => "sub_frame",
            ResourceType::XmlHttpRequest => "xmlhttprequest",
            ResourceType::Script => "script",
            ResourceType::Stylesheet => "stylesheet",
            ResourceType::Image => "image",
            ResourceType::Font => "font",
            ResourceType::Media => "media",
            ResourceType::Websocket => "websocket",
            ResourceType::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == value.trim().to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTarget {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DirectiveAction {
    Redirect { redirect: RedirectTarget },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectiveCondition {
    pub regex_filter: String,
    pub resource_types: Vec<ResourceType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub id: u32,
    pub priority: u32,
    pub action: DirectiveAction,
    pub condition: DirectiveCondition,
}

impl Directive {
    pub fn redirect(id: u32, pattern: &str, url: &str) -> Self {
        Self {
            id,
            priority: DEFAULT_PRIORITY,
            action: DirectiveAction::Redirect {
                redirect: RedirectTarget {
                    url: url.to_string(),
                },
            },
            condition: DirectiveCondition {
                regex_filter: match_expression(pattern),
                resource_types: ResourceType::ALL.to_vec(),
            },
        }
    }

    pub fn target_url(&self) -> &str {
        match &self.action {
            DirectiveAction::Redirect { redirect } => &redirect.url,
        }
    }

    /// Whether this directive fires for `url` with the given resource type.
    /// An uncompilable filter never matches.
    #[cfg(test)]
    pub fn matches(&self, url: &str, resource_type: ResourceType) -> bool {
        RedirectTable::compile(std::slice::from_ref(self))
            .resolve(url, resource_type)
            .is_some()
    }

    /// Same directive content regardless of the synthesized id
    #[cfg(test)]
    pub fn same_content(&self, other: &Directive) -> bool {
        self.priority == other.priority
            && self.action == other.action
            && self.condition == other.condition
    }
}

/// Escape every regex metacharacter (`. * + ? ^ $ { } ( ) | [ ] \`)
pub fn escape_pattern(pattern: &str) -> String {
    let mut escaped = String::with_capacity(pattern.len() * 2);
    for c in pattern.chars() {
        if matches!(
            c,
            '.' | '*' | '+' | '?' | '^' | '$' | '{' | '}' | '(' | ')' | '|' | '[' | ']' | '\\'
        ) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// "Contains `pattern` anywhere" as a regex filter
pub fn match_expression(pattern: &str) -> String {
    format!(".*{}.*", escape_pattern(pattern))
}

/// Build one directive per eligible rule, walking groups then rules in stored
/// order. Ids are drawn from `next_id`, which only ever moves forward.
pub fn build_directives(groups: &[Group], next_id: &mut u32) -> Vec<Directive> {
    let mut directives = Vec::new();
    for group in groups {
        for rule in group.active_rules() {
            debug!(
                "Rule {} in '{}': {} -> {}",
                rule.id, group.name, rule.pattern, rule.redirect
            );
            directives.push(Directive::redirect(*next_id, &rule.pattern, &rule.redirect));
            *next_id += 1;
        }
    }
    directives
}

/// Installed directives with their filters compiled once, for any number of
/// lookups
pub struct RedirectTable<'a> {
    entries: Vec<(&'a Directive, Regex)>,
}

impl<'a> RedirectTable<'a> {
    /// Directives whose filter does not compile are left out
    pub fn compile(directives: &'a [Directive]) -> Self {
        let entries = directives
            .iter()
            .filter_map(|d| match Regex::new(&d.condition.regex_filter) {
                Ok(re) => Some((d, re)),
                Err(e) => {
                    debug!("Directive {} has invalid filter: {}", d.id, e);
                    None
                }
            })
            .collect();
        Self { entries }
    }

    /// First directive (highest priority, then install order) redirecting `url`
    pub fn resolve(&self, url: &str, resource_type: ResourceType) -> Option<&'a Directive> {
        let mut best: Option<&'a Directive> = None;
        for (directive, filter) in &self.entries {
            if !directive.condition.resource_types.contains(&resource_type)
                || !filter.is_match(url)
            {
                continue;
            }
            match best {
                Some(current) if current.priority >= directive.priority => {}
                _ => best = Some(*directive),
            }
        }
        best
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_escaped_pattern_is_literal(
            pattern in r"[a-z.*+?^$(){}|\[\]\\]{1,12}",
            prefix in "[a-z]{0,5}",
            suffix in "[a-z]{0,5}",
        ) {
            let re = Regex::new(&match_expression(&pattern)).unwrap();
            let url = format!("https://{}{}{}", prefix, pattern, suffix);
            prop_assert!(re.is_match(&url));
        }

        #[test]
        fn prop_no_match_without_literal(
            pattern in r"[a-z]{1,3}[.+*][a-z]{1,3}",
            haystack in "[a-z/]{0,20}",
        ) {
            let re = Regex::new(&match_expression(&pattern)).unwrap();
            prop_assert_eq!(re.is_match(&haystack), haystack.contains(&pattern));
        }
    }
}
