use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

/// Overrides the data directory when `--data-dir` is not given
pub const HOME_ENV: &str = "URL_REDIRECTOR_HOME";

const STORE_FILE: &str = "store.sqlite3";
const RULES_FILE: &str = "dynamic_rules.json";

/// Where the store database and the installed rule file live
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
}

impl Settings {
    /// `--data-dir`, then `$URL_REDIRECTOR_HOME`, then `$HOME/.url-redirector`
    pub fn resolve(cli_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = match cli_dir {
            Some(dir) => dir,
            None => match std::env::var(HOME_ENV) {
                Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
                _ => {
                    let home = std::env::var("HOME")
                        .context("HOME is not set; pass --data-dir or set URL_REDIRECTOR_HOME")?;
                    PathBuf::from(home).join(".url-redirector")
                }
            },
        };
        debug!("Using data directory: {:?}", data_dir);
        Ok(Self { data_dir })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(STORE_FILE)
    }

    pub fn rules_path(&self) -> PathBuf {
        self.data_dir.join(RULES_FILE)
    }

    /// Create the data directory if needed
    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", self.data_dir))
    }
}
