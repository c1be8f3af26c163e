//! Configuration files: the read-only default config and the rewritten
//! state config.
//!
//! At startup the state file wins over the default file; either being
//! missing or unparsable logs a warning and falls through, so the daemon
//! still starts. Saves are serialised by a mutex, skipped when the
//! serialised config matches the previous file contents, and written
//! atomically (temp file + rename).

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use capstan_client::Config;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// The daemon's on-disk configuration files.
pub struct StateFiles {
    default_path: Option<PathBuf>,
    state_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl StateFiles {
    pub fn new(default_path: Option<PathBuf>, state_path: Option<PathBuf>) -> Self {
        Self {
            default_path,
            state_path,
            write_lock: Mutex::new(()),
        }
    }

    /// Read the startup configuration: the state file if present, falling
    /// back to the default file. Unreadable or invalid files are skipped
    /// with a warning.
    pub fn load(&self) -> Option<Config> {
        for path in [&self.state_path, &self.default_path].into_iter().flatten() {
            let raw = match fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "No config file");
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Error reading config");
                    continue;
                }
            };

            match serde_json::from_str::<Config>(&raw) {
                Ok(cfg) => {
                    info!(path = %path.display(), "Loaded config");
                    return Some(cfg);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Config parse error");
                }
            }
        }
        None
    }

    /// Persist the running configuration to the state file. A no-op when
    /// no state path is configured or the serialised form is unchanged.
    pub async fn save(&self, cfg: &Config) -> Result<()> {
        let Some(path) = &self.state_path else {
            debug!("No state file configured, not saving changes");
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;

        let data = serde_json::to_vec_pretty(cfg).context("failed to serialize state config")?;
        if let Ok(previous) = fs::read(path) {
            if previous == data {
                debug!(path = %path.display(), "No change in config");
                return Ok(());
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;

        debug!(path = %path.display(), "Saved state config");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capstan_client::ServiceConfig;
    use std::env::temp_dir;

    fn sample_config(name: &str) -> Config {
        Config {
            services: vec![ServiceConfig {
                name: name.to_string(),
                address: "127.0.0.1:9000".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn scratch(name: &str) -> PathBuf {
        temp_dir().join(format!("capstan-{}-{}.json", name, std::process::id()))
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let path = scratch("roundtrip");
        let files = StateFiles::new(None, Some(path.clone()));

        assert!(files.load().is_none());

        let cfg = sample_config("s1");
        files.save(&cfg).await.unwrap();

        let loaded = files.load().unwrap();
        assert_eq!(loaded, cfg);

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn unchanged_config_is_not_rewritten() {
        let path = scratch("unchanged");
        let files = StateFiles::new(None, Some(path.clone()));

        let cfg = sample_config("s1");
        files.save(&cfg).await.unwrap();
        let first = fs::metadata(&path).unwrap().modified().unwrap();

        files.save(&cfg).await.unwrap();
        let second = fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(first, second, "identical config must not rewrite the file");

        let _ = fs::remove_file(&path);
    }

    #[tokio::test]
    async fn state_file_takes_precedence_over_default() {
        let default_path = scratch("default");
        let state_path = scratch("state");

        let default_files = StateFiles::new(None, Some(default_path.clone()));
        default_files.save(&sample_config("from-default")).await.unwrap();
        let state_files = StateFiles::new(None, Some(state_path.clone()));
        state_files.save(&sample_config("from-state")).await.unwrap();

        let files = StateFiles::new(Some(default_path.clone()), Some(state_path.clone()));
        let loaded = files.load().unwrap();
        assert_eq!(loaded.services[0].name, "from-state");

        let _ = fs::remove_file(&default_path);
        let _ = fs::remove_file(&state_path);
    }

    #[tokio::test]
    async fn invalid_state_falls_back_to_default() {
        let default_path = scratch("fallback-default");
        let state_path = scratch("fallback-state");

        let default_files = StateFiles::new(None, Some(default_path.clone()));
        default_files.save(&sample_config("from-default")).await.unwrap();
        fs::write(&state_path, b"{not json").unwrap();

        let files = StateFiles::new(Some(default_path.clone()), Some(state_path.clone()));
        let loaded = files.load().unwrap();
        assert_eq!(loaded.services[0].name, "from-default");

        let _ = fs::remove_file(&default_path);
        let _ = fs::remove_file(&state_path);
    }
}
