use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod controller;
mod directive;
mod engine;
mod error;
mod messaging;
mod model;
mod report;
mod settings;
mod storage;
mod synchronizer;

use controller::{RuleController, SaveOutcome};
use directive::{RedirectTable, ResourceType};
use engine::{FileRuleEngine, RuleEngine};
use error::ValidationError;
use messaging::{ChannelNotifier, Envelope, LifecycleEvent, NullNotifier};
use model::{FormData, GroupId, RuleId};
use settings::Settings;
use storage::{KeyValueStore, SqliteStore};
use synchronizer::Synchronizer;

#[derive(Parser)]
#[command(name = "url-redirector")]
#[command(about = "Manage groups of URL redirect rules and keep the active redirect set in sync", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding the rule store and installed directives
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// First-run hook: load stored groups and install their redirects
    Install,

    /// Startup hook: rebuild installed redirects from stored groups
    Start,

    /// List groups and their rules
    List {
        /// Show group and rule ids
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show the redirect directives currently installed
    Rules,

    /// Show which redirect, if any, applies to each URL
    Check {
        #[arg(required = true)]
        urls: Vec<String>,

        /// Resource type of the request (main_frame, script, image, ...)
        #[arg(short = 't', long = "type", default_value = "main_frame")]
        resource_type: String,
    },

    /// Create a new group
    CreateGroup { name: String },

    /// Rename a group
    RenameGroup { id: GroupId, name: String },

    /// Enable or disable a group
    ToggleGroup { id: GroupId },

    /// Delete a group and all of its rules
    DeleteGroup {
        id: GroupId,

        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Save a new rule; missing fields are taken from the draft
    AddRule {
        /// Target group id
        #[arg(short, long)]
        group: Option<GroupId>,

        /// Text to match anywhere in the URL
        #[arg(short, long)]
        pattern: Option<String>,

        /// URL to redirect to
        #[arg(short, long)]
        redirect: Option<String>,

        /// Save the rule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// Edit an existing rule in place
    EditRule {
        #[arg(short, long)]
        group: GroupId,

        #[arg(long)]
        rule: RuleId,

        #[arg(short, long)]
        pattern: Option<String>,

        #[arg(short, long)]
        redirect: Option<String>,

        /// Set the rule's enabled state
        #[arg(long)]
        enabled: Option<bool>,
    },

    /// Delete a rule
    DeleteRule {
        #[arg(short, long)]
        group: GroupId,

        #[arg(long)]
        rule: RuleId,

        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Enable or disable a rule
    ToggleRule {
        #[arg(short, long)]
        group: GroupId,

        #[arg(long)]
        rule: RuleId,
    },

    /// Delete all groups and rules
    Clear {
        /// Skip confirmation
        #[arg(short = 'y', long)]
        yes: bool,
    },

    /// Manage the unsaved rule draft
    Draft {
        #[command(subcommand)]
        action: DraftAction,
    },
}

#[derive(Subcommand)]
enum DraftAction {
    /// Update draft fields
    Set {
        #[arg(short, long)]
        group: Option<GroupId>,

        #[arg(short, long)]
        pattern: Option<String>,

        #[arg(short, long)]
        redirect: Option<String>,

        #[arg(long)]
        enabled: Option<bool>,
    },

    /// Print the draft
    Show,

    /// Discard the draft
    Clear,
}

struct Runtime {
    store: Arc<dyn KeyValueStore>,
    engine: Arc<dyn RuleEngine>,
}

impl Runtime {
    fn open(settings: &Settings) -> Result<Self> {
        settings.ensure_data_dir()?;
        let store: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&settings.store_path())?);
        let engine: Arc<dyn RuleEngine> = Arc::new(FileRuleEngine::new(settings.rules_path()));
        Ok(Self { store, engine })
    }

    /// Controller without a synchronizer, for read-only and draft commands
    fn offline_controller(&self) -> RuleController {
        RuleController::new(self.store.clone(), Box::new(NullNotifier))
    }

    /// Deliver a lifecycle event to a fresh synchronizer
    async fn lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = tokio::spawn(
            Synchronizer::new(self.store.clone(), self.engine.clone()).run(rx),
        );
        // A closed inbox only means the service already stopped
        let _ = tx.send(Envelope::Lifecycle(event));
        drop(tx);
        let sync = service.await?;
        info!("📊 {} groups loaded", sync.current_groups().len());
        Ok(())
    }

    /// Run one controller operation while a synchronizer listens for its
    /// change notifications, then wait until every notification is handled.
    async fn with_service<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut RuleController) -> Result<T>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notifier, mut acks) = ChannelNotifier::with_acks(tx);
        let service = tokio::spawn(
            Synchronizer::new(self.store.clone(), self.engine.clone()).run(rx),
        );

        let mut controller = RuleController::new(self.store.clone(), Box::new(notifier));
        let result = op(&mut controller);
        drop(controller);

        while let Some(reply) = acks.recv().await {
            match reply.await {
                Ok(ack) if ack.success => {}
                Ok(_) => warn!("⚠️  Synchronizer could not apply the change to the rule engine"),
                Err(_) => warn!("⚠️  Synchronizer stopped before acknowledging a change"),
            }
        }
        service.await?;
        result
    }
}

/// Report validation problems the way a form would, and stop
fn check_validation<T>(result: Result<T>) -> Result<T> {
    match result {
        Err(e) => match e.downcast_ref::<ValidationError>() {
            Some(validation) => {
                eprintln!("❌ {}", validation);
                std::process::exit(1);
            }
            None => Err(e),
        },
        ok => ok,
    }
}

fn require_confirmation(yes: bool, what: &str) -> bool {
    if !yes {
        info!("⚠️  This will delete {}.", what);
        info!("Use -y to confirm");
    }
    yes
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()),
        )
        .init();

    let settings = Settings::resolve(cli.data_dir)?;
    let runtime = Runtime::open(&settings)?;

    match cli.command {
        Commands::Install => {
            runtime.lifecycle(LifecycleEvent::Installed).await?;
        }

        Commands::Start => {
            runtime.lifecycle(LifecycleEvent::Startup).await?;
        }

        Commands::List { detailed } => {
            let groups = runtime.offline_controller().groups()?;
            println!("{}", report::format_groups(&groups, detailed));
        }

        Commands::Rules => {
            let directives = runtime.engine.get_dynamic_rules()?;
            println!("{}", report::format_directives(&directives));
        }

        Commands::Check { urls, resource_type } => {
            let Some(resource_type) = ResourceType::parse(&resource_type) else {
                eprintln!("❌ Invalid resource type: {}", resource_type);
                std::process::exit(1);
            };
            let directives = runtime.engine.get_dynamic_rules()?;
            let table = RedirectTable::compile(&directives);
            for url in &urls {
                match table.resolve(url, resource_type) {
                    Some(directive) => println!(
                        "↪️  {} → {} (directive #{})",
                        url,
                        directive.target_url(),
                        directive.id
                    ),
                    None => println!("⏩ {} is not redirected", url),
                }
            }
        }

        Commands::CreateGroup { name } => {
            let group = check_validation(
                runtime.with_service(|c| c.create_group(&name)).await,
            )?;
            println!("✅ Group created successfully! (id {})", group.id);
        }

        Commands::RenameGroup { id, name } => {
            let renamed = check_validation(
                runtime.with_service(|c| c.rename_group(id, &name)).await,
            )?;
            if renamed {
                println!("✅ Group renamed");
            } else {
                println!("⏩ Nothing to rename");
            }
        }

        Commands::ToggleGroup { id } => {
            match runtime.with_service(|c| c.toggle_group(id)).await? {
                Some(true) => println!("✅ Group enabled"),
                Some(false) => println!("⏸️  Group disabled"),
                None => println!("⏩ Group not found"),
            }
        }

        Commands::DeleteGroup { id, yes } => {
            if require_confirmation(yes, "this group and all its rules") {
                runtime.with_service(|c| c.delete_group(id)).await?;
                println!("🗑️  Group deleted");
            }
        }

        Commands::AddRule { group, pattern, redirect, disabled } => {
            let outcome = check_validation(
                runtime
                    .with_service(|c| {
                        let mut form = c.load_draft()?;
                        if let Some(group) = group {
                            form.group_id = group.to_string();
                        }
                        if let Some(pattern) = pattern {
                            form.pattern = pattern;
                        }
                        if let Some(redirect) = redirect {
                            form.redirect = redirect;
                        }
                        if disabled {
                            form.enabled = false;
                        }
                        c.save_rule(&form)
                    })
                    .await,
            )?;
            if let SaveOutcome::Created(rule) = outcome {
                println!("✅ Rule saved successfully! (id {})", rule.id);
            }
        }

        Commands::EditRule { group, rule, pattern, redirect, enabled } => {
            let nothing_to_change = pattern.is_none() && redirect.is_none() && enabled.is_none();
            let outcome = check_validation(
                runtime
                    .with_service(|c| {
                        let Some(mut form) = c.begin_edit(group, rule)? else {
                            return Ok(Some(SaveOutcome::Missing));
                        };
                        if nothing_to_change {
                            print!("{}", report::format_draft(&form));
                            c.cancel_edit()?;
                            return Ok(None);
                        }
                        if let Some(pattern) = pattern {
                            form.pattern = pattern;
                        }
                        if let Some(redirect) = redirect {
                            form.redirect = redirect;
                        }
                        if let Some(enabled) = enabled {
                            form.enabled = enabled;
                        }
                        c.save_rule(&form).map(Some)
                    })
                    .await,
            )?;
            match outcome {
                Some(SaveOutcome::Updated(_)) => println!("✅ Rule updated successfully!"),
                Some(_) => println!("⏩ Rule not found"),
                None => println!("⏩ No changes given, edit cancelled"),
            }
        }

        Commands::DeleteRule { group, rule, yes } => {
            if require_confirmation(yes, "this rule") {
                runtime.with_service(|c| c.delete_rule(group, rule)).await?;
                println!("🗑️  Rule deleted");
            }
        }

        Commands::ToggleRule { group, rule } => {
            match runtime.with_service(|c| c.toggle_rule(group, rule)).await? {
                Some(true) => println!("✅ Rule enabled"),
                Some(false) => println!("⏸️  Rule disabled"),
                None => println!("⏩ Rule not found"),
            }
        }

        Commands::Clear { yes } => {
            if require_confirmation(yes, "all groups and rules") {
                runtime.with_service(|c| c.clear_all()).await?;
                println!("🗑️  All groups and rules cleared");
            }
        }

        Commands::Draft { action } => {
            let mut controller = runtime.offline_controller();
            match action {
                DraftAction::Set { group, pattern, redirect, enabled } => {
                    let mut form = controller.load_draft()?;
                    if let Some(group) = group {
                        form.group_id = group.to_string();
                    }
                    if let Some(pattern) = pattern {
                        form.pattern = pattern;
                    }
                    if let Some(redirect) = redirect {
                        form.redirect = redirect;
                    }
                    if let Some(enabled) = enabled {
                        form.enabled = enabled;
                    }
                    controller.update_draft(&form)?;
                    println!("💾 Draft saved");
                    print!("{}", report::format_draft(&form));
                }
                DraftAction::Show => {
                    print!("{}", report::format_draft(&controller.load_draft()?));
                }
                DraftAction::Clear => {
                    let form: FormData = controller.clear_form()?;
                    print!("{}", report::format_draft(&form));
                }
            }
        }
    }

    Ok(())
}
