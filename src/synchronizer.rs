use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::directive::build_directives;
use crate::engine::{RuleEngine, RuleUpdate};
use crate::messaging::{Ack, Envelope, LifecycleEvent, Message};
use crate::model::Group;
use crate::storage::KeyValueStore;

/// Outcome of one resynchronization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub removed: usize,
    pub added: usize,
    /// Engine failure, already logged; the service keeps running
    pub error: Option<String>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Background service owning the in-memory group cache and the directive id
/// counter. One instance per process; ids are never handed out twice.
pub struct Synchronizer {
    store: Arc<dyn KeyValueStore>,
    engine: Arc<dyn RuleEngine>,
    current_groups: Vec<Group>,
    next_directive_id: u32,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn KeyValueStore>, engine: Arc<dyn RuleEngine>) -> Self {
        Self {
            store,
            engine,
            current_groups: Vec::new(),
            next_directive_id: 1,
        }
    }

    pub fn current_groups(&self) -> &[Group] {
        &self.current_groups
    }

    /// Load persisted groups and rebuild the engine's directives.
    ///
    /// An absent `groups` key reads as an empty list. A store that cannot be
    /// read skips the pass and leaves the installed directives alone.
    pub fn initialize(&mut self) -> SyncReport {
        match self.store.load_groups() {
            Ok(groups) => {
                info!("📖 Loaded {} groups from store", groups.len());
                self.current_groups = groups;
                self.resynchronize()
            }
            Err(e) => {
                error!("❌ Failed to load groups from store: {:#}", e);
                warn!("⚠️  Installed redirects left unchanged");
                SyncReport {
                    error: Some(format!("{:#}", e)),
                    ..SyncReport::default()
                }
            }
        }
    }

    /// Replace the cache wholesale (last writer wins) and rebuild
    pub fn apply_groups(&mut self, groups: Vec<Group>) -> SyncReport {
        info!("🔄 Received {} groups from controller", groups.len());
        self.current_groups = groups;
        self.resynchronize()
    }

    /// Retire every installed directive, then install one per eligible rule.
    ///
    /// Removal and addition are separate engine calls: if the add fails after a
    /// successful removal, nothing stays active until the next pass. The whole
    /// pass runs under the engine's exclusive section so another process
    /// syncing into the same engine cannot interleave with it.
    pub fn resynchronize(&mut self) -> SyncReport {
        let engine = Arc::clone(&self.engine);
        let mut report = SyncReport::default();
        let locked = engine.exclusive(&mut || report = self.pass());
        if let Err(e) = locked {
            error!("❌ Could not get exclusive access to {} engine: {:#}", engine.name(), e);
            report.error = Some(format!("{:#}", e));
        }
        report
    }

    fn pass(&mut self) -> SyncReport {
        let mut report = SyncReport::default();

        debug!("Phase 1: listing installed directives ({})", self.engine.name());
        let existing = match self.engine.get_dynamic_rules() {
            Ok(existing) => existing,
            Err(e) => {
                error!("❌ Failed to list installed directives: {:#}", e);
                report.error = Some(format!("{:#}", e));
                return report;
            }
        };

        if !existing.is_empty() {
            let ids: Vec<u32> = existing.iter().map(|d| d.id).collect();
            debug!("Phase 2: removing directives {:?}", ids);
            if let Err(e) = self.engine.update_dynamic_rules(RuleUpdate::remove(ids)) {
                error!("❌ Failed to remove installed directives: {:#}", e);
                report.error = Some(format!("{:#}", e));
                return report;
            }
            report.removed = existing.len();
        }

        let directives = build_directives(&self.current_groups, &mut self.next_directive_id);
        if directives.is_empty() {
            info!("✅ No enabled rules to install (removed {})", report.removed);
            return report;
        }

        let count = directives.len();
        debug!("Phase 3: adding {} directives", count);
        match self.engine.update_dynamic_rules(RuleUpdate::add(directives)) {
            Ok(()) => {
                report.added = count;
                info!(
                    "✅ Installed {} redirect directives (removed {})",
                    count, report.removed
                );
            }
            Err(e) => {
                error!("❌ Failed to install directives: {:#}", e);
                warn!("⚠️  No redirects are active until the next successful sync");
                report.error = Some(format!("{:#}", e));
            }
        }
        report
    }

    pub fn handle(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Lifecycle(event) => {
                match event {
                    LifecycleEvent::Installed => info!("📦 URL redirector installed"),
                    LifecycleEvent::Startup => info!("🚀 URL redirector started"),
                }
                self.initialize();
            }
            Envelope::Notify { message, reply } => {
                let report = match message {
                    Message::UpdateGroups { groups } => self.apply_groups(groups),
                };
                if let Some(reply) = reply {
                    // The sender may have stopped waiting; that is fine
                    let _ = reply.send(Ack {
                        success: report.is_success(),
                    });
                }
            }
        }
    }

    /// Service loop: handle envelopes until every sender is gone
    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Envelope>) -> Self {
        while let Some(envelope) = inbox.recv().await {
            self.handle(envelope);
        }
        debug!("Synchronizer inbox closed");
        self
    }
}
