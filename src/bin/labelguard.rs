//! labelguard - model management CLI
//!
//! Manage the on-device model store and preview analysis prompts.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use labelguard::{
    Config, DeleteOutcome, GenerationEngine, JsonPreferenceStore, LabelGuardError,
    ModelDescriptor, ModelLifecycleManager, ModelLoader, ModelStatus, OcrOutcome,
    PreferenceCategory, PreferenceStore, build_analysis_prompt,
};

/// labelguard CLI
#[derive(Parser)]
#[command(name = "labelguard")]
#[command(version)]
#[command(about = "On-device food label model manager")]
struct Args {
    /// Config file (default: <config_dir>/labelguard/config.toml)
    #[arg(short, long, env = "LABELGUARD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List catalog models and whether this device can run them
    Models,

    /// Show the selected model and its status
    Status,

    /// Select a model by id
    Select {
        /// Model id (see `labelguard models`)
        id: String,
    },

    /// Download the selected model (Ctrl-C cancels)
    Download,

    /// Delete every stored copy of the selected model
    Delete,

    /// Show or edit the dietary profile
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Print the analysis prompt for OCR text files (one file per image)
    Prompt {
        /// Files holding recognized label text
        files: Vec<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Print the profile summary and stored selections
    Show,

    /// Replace the selections of one category
    Set {
        /// allergies | dietary_types | health_conditions | food_preferences
        category: String,
        /// Option indices (omit to clear)
        indices: Vec<usize>,
    },
}

/// The CLI manages storage only; it never materializes a model.
struct StorageOnlyLoader;

#[async_trait]
impl ModelLoader for StorageOnlyLoader {
    fn name(&self) -> &str {
        "storage-only"
    }

    async fn load(
        &self,
        descriptor: &ModelDescriptor,
        _artifact_dir: &Path,
    ) -> labelguard::Result<Arc<dyn GenerationEngine>> {
        Err(LabelGuardError::Load(format!(
            "{} cannot be loaded from the CLI",
            descriptor.id
        )))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    let preferences = Arc::new(JsonPreferenceStore::open(config.preferences_path()));

    // Commands that don't need the model store
    match &args.command {
        Command::Profile { action } => return profile(preferences.as_ref(), action),
        Command::Prompt { files } => return prompt(preferences.as_ref(), files),
        _ => {}
    }

    let manager = build_manager(&config, preferences)?;

    match args.command {
        Command::Models => {
            let device = config.device_profile();
            let catalog = manager.catalog();
            let selected = manager.selected();
            let recommended = catalog.recommended(&device);
            println!("device memory: {:.1} GB", device.memory_gb);
            for model in catalog.list_models() {
                let marker = if model.id == selected.id { "*" } else { " " };
                let note = match model.unavailability_reason(&device) {
                    Some(reason) => format!(" (unavailable: {reason})"),
                    None if model.id == recommended.id => " (recommended)".to_string(),
                    None => String::new(),
                };
                println!(
                    "{marker} {:<22} {:>8}  {}{note}",
                    model.id,
                    model.size_label(),
                    model.display_name
                );
            }
        }

        Command::Status => {
            let selected = manager.selected();
            println!("model: {} ({})", selected.id, selected.display_name);
            println!("status: {}", manager.status());
            match manager.artifact_path() {
                Some(path) => println!("artifact: {}", path.display()),
                None => println!("artifact: not on disk"),
            }
        }

        Command::Select { id } => {
            let device = config.device_profile();
            if let Some(reason) = manager
                .catalog()
                .get(&id)
                .and_then(|m| m.unavailability_reason(&device))
            {
                eprintln!("warning: {reason}");
            }
            if manager.select_model(&id).await? {
                println!("selected {id} ({})", manager.status());
            } else {
                println!("{id} is already selected");
            }
        }

        Command::Download => {
            let status = download(Arc::new(manager)).await;
            match status {
                ModelStatus::Downloaded => println!("\ndownloaded"),
                ModelStatus::NotDownloaded => println!("\ncancelled"),
                other => {
                    println!();
                    return Err(format!("download did not complete: {other}").into());
                }
            }
        }

        Command::Delete => match manager.delete().await {
            DeleteOutcome::Deleted { removed } => {
                for path in removed {
                    println!("removed {}", path.display());
                }
            }
            DeleteOutcome::NothingToDelete => println!("nothing to delete"),
        },

        Command::Profile { .. } | Command::Prompt { .. } => {}
    }

    Ok(())
}

fn build_manager(
    config: &Config,
    preferences: Arc<JsonPreferenceStore>,
) -> labelguard::Result<ModelLifecycleManager> {
    ModelLifecycleManager::builder()
        .catalog(config.catalog()?)
        .locator(Arc::new(config.locator()))
        .fetcher(Arc::new(config.fetcher()?))
        .loader(Arc::new(StorageOnlyLoader))
        .preferences(preferences)
        .config(config.lifecycle())
        .build()
}

/// Run a download, printing progress until it settles.
async fn download(manager: Arc<ModelLifecycleManager>) -> ModelStatus {
    let mut status_rx = manager.subscribe_status();
    let mut task = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.download().await }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelled = false;
    let mut watching = true;

    let joined = loop {
        tokio::select! {
            joined = &mut task => break joined,
            changed = status_rx.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let progress = status_rx.borrow_and_update().progress();
                if let Some(progress) = progress {
                    eprint!("\rdownloading {:>3.0}%", progress * 100.0);
                }
            }
            _ = &mut ctrl_c, if !cancelled => {
                cancelled = true;
                manager.cancel_download();
            }
        }
    };

    joined.unwrap_or_else(|e| ModelStatus::Error {
        message: e.to_string(),
    })
}

fn profile(
    preferences: &dyn PreferenceStore,
    action: &ProfileAction,
) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        ProfileAction::Show => {
            println!("{}", preferences.profile().summary());
            println!();
            for category in PreferenceCategory::ALL {
                let selected = preferences.indices(category);
                println!("{} ({}):", category.title(), category.key());
                for (i, option) in category.options().iter().enumerate() {
                    let mark = if selected.contains(&i) { "x" } else { " " };
                    println!("  [{mark}] {i:>2} {option}");
                }
            }
        }
        ProfileAction::Set { category, indices } => {
            let category = PreferenceCategory::from_key(category)
                .ok_or_else(|| format!("unknown category: {category}"))?;
            let max = category.options().len();
            if let Some(bad) = indices.iter().find(|&&i| i >= max) {
                return Err(format!("index {bad} out of range for {} (0..{max})", category.key()).into());
            }
            let indices: BTreeSet<usize> = indices.iter().copied().collect();
            preferences.set_indices(category, indices)?;
            println!("{}", preferences.profile().summary());
        }
    }
    Ok(())
}

fn prompt(
    preferences: &dyn PreferenceStore,
    files: &[PathBuf],
) -> Result<(), Box<dyn std::error::Error>> {
    let outcomes = files
        .iter()
        .map(|path| match std::fs::read_to_string(path) {
            Ok(text) => OcrOutcome::from_raw(&text),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read OCR text");
                OcrOutcome::Failed(e.to_string())
            }
        })
        .collect::<Vec<_>>();
    println!(
        "{}",
        build_analysis_prompt(&preferences.profile().summary(), &outcomes)
    );
    Ok(())
}
