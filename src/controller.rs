use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ValidationError;
use crate::messaging::Notifier;
use crate::model::{
    find_group, find_group_mut, next_timestamp_id, FormData, Group, GroupId, Rule, RuleId,
};
use crate::storage::KeyValueStore;

/// What `save_rule` ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Created(Rule),
    Updated(Rule),
    /// The rule being edited disappeared in the meantime; nothing was written
    Missing,
}

/// Management side: every change reads the full group list, edits it,
/// writes it back and hands the new list to the synchronizer.
pub struct RuleController {
    store: Arc<dyn KeyValueStore>,
    notifier: Box<dyn Notifier>,
    editing: Option<(GroupId, RuleId)>,
}

impl RuleController {
    pub fn new(store: Arc<dyn KeyValueStore>, notifier: Box<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            editing: None,
        }
    }

    pub fn groups(&self) -> Result<Vec<Group>> {
        self.store.load_groups()
    }

    /// Rule currently loaded into the form for editing
    #[cfg(test)]
    pub fn editing(&self) -> Option<(GroupId, RuleId)> {
        self.editing
    }

    /// Run `f` as one store transaction and notify on write.
    /// Returns `None` when `f` reported nothing to change.
    fn mutate(
        &self,
        f: &mut dyn FnMut(&mut Vec<Group>) -> Result<bool>,
    ) -> Result<Option<Vec<Group>>> {
        let written = self.store.update_groups(f)?;
        if let Some(groups) = &written {
            if !self.notifier.notify_groups(groups) {
                warn!("⚠️  Change saved but the synchronizer was not notified");
            }
        }
        Ok(written)
    }

    pub fn create_group(&mut self, name: &str) -> Result<Group> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::GroupNameRequired.into());
        }

        let mut created = None;
        self.mutate(&mut |groups| {
            if groups.iter().any(|g| g.name == name) {
                return Err(ValidationError::DuplicateGroupName(name.to_string()).into());
            }
            let group = Group::new(next_timestamp_id(groups.iter().map(|g| g.id)), name);
            created = Some(group.clone());
            groups.push(group);
            Ok(true)
        })?;

        let group = created.ok_or_else(|| anyhow::anyhow!("Group was not created"))?;
        info!("✅ Group created: {} ({})", group.name, group.id);
        Ok(group)
    }

    /// Rename a group. Returns `false` when the group is gone or the name is
    /// unchanged.
    pub fn rename_group(&mut self, group_id: GroupId, new_name: &str) -> Result<bool> {
        let new_name = new_name.trim();
        if new_name.is_empty() {
            return Err(ValidationError::GroupNameRequired.into());
        }

        let written = self.mutate(&mut |groups| {
            if groups.iter().any(|g| g.name == new_name && g.id != group_id) {
                return Err(ValidationError::DuplicateGroupName(new_name.to_string()).into());
            }
            match find_group_mut(groups, group_id) {
                Some(group) if group.name != new_name => {
                    group.name = new_name.to_string();
                    Ok(true)
                }
                _ => Ok(false),
            }
        })?;
        Ok(written.is_some())
    }

    /// Flip a group's enabled flag; `None` if the group no longer exists
    pub fn toggle_group(&mut self, group_id: GroupId) -> Result<Option<bool>> {
        let mut state = None;
        self.mutate(&mut |groups| match find_group_mut(groups, group_id) {
            Some(group) => {
                group.enabled = !group.enabled;
                state = Some(group.enabled);
                Ok(true)
            }
            None => Ok(false),
        })?;
        Ok(state)
    }

    /// Delete a group together with all of its rules
    pub fn delete_group(&mut self, group_id: GroupId) -> Result<bool> {
        let written = self.mutate(&mut |groups| {
            let before = groups.len();
            groups.retain(|g| g.id != group_id);
            Ok(groups.len() != before)
        })?;
        if matches!(self.editing, Some((gid, _)) if gid == group_id) {
            self.editing = None;
        }
        Ok(written.is_some())
    }

    /// Remove every group and rule
    pub fn clear_all(&mut self) -> Result<()> {
        self.mutate(&mut |groups| {
            groups.clear();
            Ok(true)
        })?;
        self.editing = None;
        info!("🗑️  All groups and rules cleared");
        Ok(())
    }

    /// Save the form: append a new rule, or replace the rule being edited in
    /// place (same id, same group).
    pub fn save_rule(&mut self, form: &FormData) -> Result<SaveOutcome> {
        let group_id = form
            .selected_group()
            .ok_or(ValidationError::GroupNotSelected)?;
        let pattern = form.pattern.trim();
        if pattern.is_empty() {
            return Err(ValidationError::PatternRequired.into());
        }
        let redirect = form.redirect.trim();
        if redirect.is_empty() {
            return Err(ValidationError::RedirectRequired.into());
        }

        let editing = self.editing;
        let mut outcome = SaveOutcome::Missing;
        self.mutate(&mut |groups| {
            let group = find_group_mut(groups, group_id).ok_or(ValidationError::GroupNotFound)?;
            // The edited rule is looked up in the group the form has selected
            let Some((_, rule_id)) = editing else {
                let rule = Rule {
                    id: next_timestamp_id(group.rules.iter().map(|r| r.id)),
                    pattern: pattern.to_string(),
                    redirect: redirect.to_string(),
                    enabled: form.enabled,
                };
                group.rules.push(rule.clone());
                outcome = SaveOutcome::Created(rule);
                return Ok(true);
            };
            match group.rule_mut(rule_id) {
                Some(rule) => {
                    rule.pattern = pattern.to_string();
                    rule.redirect = redirect.to_string();
                    rule.enabled = form.enabled;
                    outcome = SaveOutcome::Updated(rule.clone());
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;

        match &outcome {
            SaveOutcome::Created(rule) => {
                info!("✅ Rule saved: {} -> {}", rule.pattern, rule.redirect);
                self.clear_form()?;
            }
            SaveOutcome::Updated(rule) => {
                info!("✅ Rule updated: {} -> {}", rule.pattern, rule.redirect);
                self.editing = None;
            }
            SaveOutcome::Missing => {
                debug!("Edited rule no longer exists, nothing saved");
                self.editing = None;
            }
        }
        Ok(outcome)
    }

    /// Load an existing rule into the form and enter edit mode
    pub fn begin_edit(&mut self, group_id: GroupId, rule_id: RuleId) -> Result<Option<FormData>> {
        let groups = self.store.load_groups()?;
        let rule = find_group(&groups, group_id).and_then(|g| g.rule(rule_id));
        Ok(rule.map(|rule| {
            self.editing = Some((group_id, rule_id));
            FormData::new(group_id, &rule.pattern, &rule.redirect, rule.enabled)
        }))
    }

    /// Leave edit mode and drop the draft; stored groups are untouched
    pub fn cancel_edit(&mut self) -> Result<FormData> {
        self.clear_form()
    }

    pub fn clear_form(&mut self) -> Result<FormData> {
        self.editing = None;
        self.store.clear_form_data()?;
        Ok(FormData::empty())
    }

    pub fn delete_rule(&mut self, group_id: GroupId, rule_id: RuleId) -> Result<bool> {
        let written = self.mutate(&mut |groups| match find_group_mut(groups, group_id) {
            Some(group) => {
                let before = group.rules.len();
                group.rules.retain(|r| r.id != rule_id);
                Ok(group.rules.len() != before)
            }
            None => Ok(false),
        })?;
        if self.editing == Some((group_id, rule_id)) {
            self.editing = None;
        }
        Ok(written.is_some())
    }

    /// Flip a rule's enabled flag; `None` if the pair no longer exists
    pub fn toggle_rule(&mut self, group_id: GroupId, rule_id: RuleId) -> Result<Option<bool>> {
        let mut state = None;
        self.mutate(&mut |groups| {
            match find_group_mut(groups, group_id).and_then(|g| g.rule_mut(rule_id)) {
                Some(rule) => {
                    rule.enabled = !rule.enabled;
                    state = Some(rule.enabled);
                    Ok(true)
                }
                None => Ok(false),
            }
        })?;
        Ok(state)
    }

    /// Persist the in-progress form so it survives closing the manager
    pub fn update_draft(&self, form: &FormData) -> Result<()> {
        self.store.save_form_data(form)
    }

    pub fn load_draft(&self) -> Result<FormData> {
        Ok(self.store.load_form_data()?.unwrap_or_else(FormData::empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryRuleEngine, RuleEngine};
    use crate::storage::MemoryStore;
    use crate::synchronizer::Synchronizer;
    use std::sync::Mutex;

    /// Delivers straight into a synchronizer, like a service that is awake
    struct DirectNotifier {
        sync: Arc<Mutex<Synchronizer>>,
    }

    impl Notifier for DirectNotifier {
        fn notify_groups(&self, groups: &[Group]) -> bool {
            self.sync.lock().unwrap().apply_groups(groups.to_vec()).is_success()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Arc<Mutex<Vec<Vec<Group>>>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify_groups(&self, groups: &[Group]) -> bool {
            self.sent.lock().unwrap().push(groups.to_vec());
            true
        }
    }

    fn recording() -> (RuleController, Arc<MemoryStore>, Arc<Mutex<Vec<Vec<Group>>>>) {
        let store = Arc::new(MemoryStore::new());
        let notifier = RecordingNotifier::default();
        let sent = notifier.sent.clone();
        (RuleController::new(store.clone(), Box::new(notifier)), store, sent)
    }

    fn wired() -> (RuleController, Arc<MemoryRuleEngine>) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(MemoryRuleEngine::new());
        let sync = Arc::new(Mutex::new(Synchronizer::new(store.clone(), engine.clone())));
        sync.lock().unwrap().initialize();
        (RuleController::new(store, Box::new(DirectNotifier { sync })), engine)
    }

    fn validation(err: anyhow::Error) -> ValidationError {
        err.downcast::<ValidationError>().unwrap()
    }

    #[test]
    fn test_duplicate_group_name_rejected() {
        let (mut controller, _store, _sent) = recording();
        controller.create_group("A").unwrap();
        let err = controller.create_group(" A ").unwrap_err();
        assert_eq!(validation(err), ValidationError::DuplicateGroupName("A".to_string()));

        let groups = controller.groups().unwrap();
        assert_eq!(groups.iter().filter(|g| g.name == "A").count(), 1);
    }

    #[test]
    fn test_blank_group_name_rejected() {
        let (mut controller, store, sent) = recording();
        let err = controller.create_group("   ").unwrap_err();
        assert_eq!(validation(err), ValidationError::GroupNameRequired);
        assert!(store.load_groups().unwrap().is_empty());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_every_write_notifies_full_list() {
        let (mut controller, _store, sent) = recording();
        let a = controller.create_group("A").unwrap();
        controller.create_group("B").unwrap();
        controller.toggle_group(a.id).unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[2].len(), 2);
        assert!(!sent[2][0].enabled);
    }

    #[test]
    fn test_rename_group_rules() {
        let (mut controller, _store, sent) = recording();
        let a = controller.create_group("A").unwrap();
        controller.create_group("B").unwrap();

        assert!(controller.rename_group(a.id, "  C ").unwrap());
        assert!(!controller.rename_group(a.id, "C").unwrap());
        assert!(!controller.rename_group(424242, "D").unwrap());
        let err = controller.rename_group(a.id, "B").unwrap_err();
        assert_eq!(validation(err), ValidationError::DuplicateGroupName("B".to_string()));
        assert_eq!(validation(controller.rename_group(a.id, "").unwrap_err()), ValidationError::GroupNameRequired);

        assert_eq!(controller.groups().unwrap()[0].name, "C");
        assert_eq!(sent.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_save_rule_validation_order() {
        let (mut controller, store, _sent) = recording();
        let group = controller.create_group("G").unwrap();

        let mut form = FormData::empty();
        assert_eq!(validation(controller.save_rule(&form).unwrap_err()), ValidationError::GroupNotSelected);

        form.group_id = group.id.to_string();
        form.redirect = "https://example.com".to_string();
        form.pattern = "  ".to_string();
        assert_eq!(validation(controller.save_rule(&form).unwrap_err()), ValidationError::PatternRequired);

        form.pattern = "foo".to_string();
        form.redirect = " ".to_string();
        assert_eq!(validation(controller.save_rule(&form).unwrap_err()), ValidationError::RedirectRequired);

        form.group_id = "999".to_string();
        form.redirect = "https://example.com".to_string();
        assert_eq!(validation(controller.save_rule(&form).unwrap_err()), ValidationError::GroupNotFound);

        assert!(store.load_groups().unwrap()[0].rules.is_empty());
    }

    #[test]
    fn test_save_new_rule_trims_and_clears_draft() {
        let (mut controller, store, _sent) = recording();
        let group = controller.create_group("G").unwrap();
        let form = FormData::new(group.id, " foo ", " https://example.com ", true);
        controller.update_draft(&form).unwrap();

        let outcome = controller.save_rule(&form).unwrap();
        let rule = match outcome {
            SaveOutcome::Created(rule) => rule,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(rule.pattern, "foo");
        assert_eq!(rule.redirect, "https://example.com");
        assert!(store.load_form_data().unwrap().is_none());
        assert_eq!(controller.groups().unwrap()[0].rules, vec![rule]);
    }

    #[test]
    fn test_rule_ids_unique_within_group() {
        let (mut controller, _store, _sent) = recording();
        let group = controller.create_group("G").unwrap();
        for i in 0..5 {
            let form = FormData::new(group.id, &format!("p{}", i), "https://x", true);
            controller.save_rule(&form).unwrap();
        }
        let rules = &controller.groups().unwrap()[0].rules;
        let mut ids: Vec<_> = rules.iter().map(|r| r.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn test_edit_replaces_rule_in_place() {
        let (mut controller, engine) = wired();
        let group = controller.create_group("G").unwrap();
        let form = FormData::new(group.id, "foo", "https://example.com", true);
        let rule = match controller.save_rule(&form).unwrap() {
            SaveOutcome::Created(rule) => rule,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(engine.installed()[0].condition.regex_filter, ".*foo.*");

        let mut form = controller.begin_edit(group.id, rule.id).unwrap().unwrap();
        assert_eq!(controller.editing(), Some((group.id, rule.id)));
        form.pattern = "bar".to_string();
        let outcome = controller.save_rule(&form).unwrap();
        assert!(matches!(outcome, SaveOutcome::Updated(ref r) if r.id == rule.id));
        assert_eq!(controller.editing(), None);

        let groups = controller.groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].rules.len(), 1);
        assert_eq!(groups[0].rules[0].id, rule.id);
        assert_eq!(groups[0].rules[0].pattern, "bar");

        let installed = engine.installed();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].condition.regex_filter, ".*bar.*");
    }

    #[test]
    fn test_edit_of_vanished_rule_is_silent() {
        let (mut controller, _store, sent) = recording();
        let group = controller.create_group("G").unwrap();
        let form = FormData::new(group.id, "foo", "https://x", true);
        let rule = match controller.save_rule(&form).unwrap() {
            SaveOutcome::Created(rule) => rule,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let form = controller.begin_edit(group.id, rule.id).unwrap().unwrap();
        // A second window deletes the rule meanwhile
        let (mut other, _, _) = recording();
        other.store = controller.store.clone();
        other.delete_rule(group.id, rule.id).unwrap();

        let notified = sent.lock().unwrap().len();
        assert_eq!(controller.save_rule(&form).unwrap(), SaveOutcome::Missing);
        assert_eq!(sent.lock().unwrap().len(), notified);
        assert!(controller.editing().is_none());
    }

    #[test]
    fn test_edit_looks_up_rule_in_selected_group() {
        let (mut controller, store, _sent) = recording();
        let first = controller.create_group("First").unwrap();
        let second = controller.create_group("Second").unwrap();
        controller
            .save_rule(&FormData::new(first.id, "foo", "https://x", true))
            .unwrap();
        let rule_id = store.load_groups().unwrap()[0].rules[0].id;
        let before = store.load_groups().unwrap();

        let mut form = controller.begin_edit(first.id, rule_id).unwrap().unwrap();
        form.group_id = second.id.to_string();
        form.pattern = "moved".to_string();
        assert_eq!(controller.save_rule(&form).unwrap(), SaveOutcome::Missing);
        assert_eq!(store.load_groups().unwrap(), before);

        let mut form = controller.begin_edit(first.id, rule_id).unwrap().unwrap();
        form.group_id = "424242".to_string();
        let err = controller.save_rule(&form).unwrap_err();
        assert_eq!(validation(err), ValidationError::GroupNotFound);
        assert_eq!(store.load_groups().unwrap(), before);
    }

    #[test]
    fn test_cancel_edit_leaves_store_untouched() {
        let (mut controller, store, _sent) = recording();
        let group = controller.create_group("G").unwrap();
        controller
            .save_rule(&FormData::new(group.id, "foo", "https://x", true))
            .unwrap();
        let rule_id = store.load_groups().unwrap()[0].rules[0].id;
        let before = store.load_groups().unwrap();

        controller.begin_edit(group.id, rule_id).unwrap().unwrap();
        controller
            .update_draft(&FormData::new(group.id, "changed", "https://y", false))
            .unwrap();
        let form = controller.cancel_edit().unwrap();

        assert_eq!(form, FormData::empty());
        assert!(controller.editing().is_none());
        assert!(store.load_form_data().unwrap().is_none());
        assert_eq!(store.load_groups().unwrap(), before);
    }

    #[test]
    fn test_begin_edit_missing_rule() {
        let (mut controller, _store, _sent) = recording();
        let group = controller.create_group("G").unwrap();
        assert!(controller.begin_edit(group.id, 1).unwrap().is_none());
        assert!(controller.begin_edit(77, 1).unwrap().is_none());
        assert!(controller.editing().is_none());
    }

    #[test]
    fn test_missing_entities_are_noops() {
        let (mut controller, _store, sent) = recording();
        let group = controller.create_group("G").unwrap();
        assert_eq!(controller.toggle_group(1).unwrap(), None);
        assert_eq!(controller.toggle_rule(group.id, 1).unwrap(), None);
        assert!(!controller.delete_rule(group.id, 1).unwrap());
        assert!(!controller.delete_rule(2, 1).unwrap());
        assert!(!controller.delete_group(3).unwrap());
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_toggle_and_delete_rule() {
        let (mut controller, engine) = wired();
        let group = controller.create_group("G").unwrap();
        controller
            .save_rule(&FormData::new(group.id, "foo", "https://x", true))
            .unwrap();
        let rule_id = controller.groups().unwrap()[0].rules[0].id;

        assert_eq!(controller.toggle_rule(group.id, rule_id).unwrap(), Some(false));
        assert!(engine.installed().is_empty());
        assert_eq!(controller.toggle_rule(group.id, rule_id).unwrap(), Some(true));
        assert_eq!(engine.installed().len(), 1);

        assert!(controller.delete_rule(group.id, rule_id).unwrap());
        assert!(engine.installed().is_empty());
        assert!(controller.groups().unwrap()[0].rules.is_empty());
    }

    #[test]
    fn test_disable_group_removes_all_directives() {
        let (mut controller, engine) = wired();
        let group = controller.create_group("G").unwrap();
        for pattern in ["a", "b", "c"] {
            controller
                .save_rule(&FormData::new(group.id, pattern, "https://x", true))
                .unwrap();
        }
        assert_eq!(engine.installed().len(), 3);

        assert_eq!(controller.toggle_group(group.id).unwrap(), Some(false));
        assert!(engine.installed().is_empty());
    }

    #[test]
    fn test_delete_group_removes_rules_and_directives() {
        let (mut controller, engine) = wired();
        let keep = controller.create_group("Keep").unwrap();
        let doomed = controller.create_group("Doomed").unwrap();
        controller
            .save_rule(&FormData::new(keep.id, "keep", "https://keep", true))
            .unwrap();
        controller
            .save_rule(&FormData::new(doomed.id, "gone", "https://gone", true))
            .unwrap();
        assert_eq!(engine.installed().len(), 2);

        assert!(controller.delete_group(doomed.id).unwrap());
        let groups = controller.groups().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].id, keep.id);

        let installed = engine.get_dynamic_rules().unwrap();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].target_url(), "https://keep");
    }

    #[test]
    fn test_clear_all() {
        let (mut controller, engine) = wired();
        let group = controller.create_group("G").unwrap();
        controller
            .save_rule(&FormData::new(group.id, "foo", "https://x", true))
            .unwrap();
        controller.clear_all().unwrap();
        assert!(controller.groups().unwrap().is_empty());
        assert!(engine.installed().is_empty());
    }

    #[test]
    fn test_draft_persistence() {
        let (controller, _store, _sent) = recording();
        assert_eq!(controller.load_draft().unwrap(), FormData::empty());

        let draft = FormData::new(12, "half", "", false);
        controller.update_draft(&draft).unwrap();
        assert_eq!(controller.load_draft().unwrap(), draft);
    }
}
