use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_CONFIG_FILE: &str = "manager.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub media_dir: PathBuf,
    pub log: String,
    /// JSON array of history records replayed by the loopback backend.
    pub history_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            media_dir: PathBuf::from("./data/media"),
            log: "info".into(),
            history_file: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    data_dir: Option<PathBuf>,
    media_dir: Option<PathBuf>,
    log: Option<String>,
    history_file: Option<PathBuf>,
}

/// Defaults, then the TOML file, then environment variables.
///
/// An explicit `config_path` must exist; the default `manager.toml` is optional.
pub fn load_settings(config_path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let file_cfg = match config_path {
        Some(path) => Some(read_file_settings(path)?),
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
            Some(read_file_settings(Path::new(DEFAULT_CONFIG_FILE))?)
        }
        None => None,
    };
    if let Some(file_cfg) = file_cfg {
        apply_file_settings(&mut settings, file_cfg);
    }

    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn read_file_settings(path: &Path) -> anyhow::Result<FileSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(data_dir) = file_cfg.data_dir {
        if file_cfg.media_dir.is_none() {
            settings.media_dir = data_dir.join("media");
        }
        settings.data_dir = data_dir;
    }
    if let Some(v) = file_cfg.media_dir {
        settings.media_dir = v;
    }
    if let Some(v) = file_cfg.log {
        settings.log = v;
    }
    if let Some(v) = file_cfg.history_file {
        settings.history_file = Some(v);
    }
}

fn apply_env_overrides(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    let lookup = |primary: &str, alias: &str| env(alias).or_else(|| env(primary));

    if let Some(v) = lookup("MANAGER_DATA_DIR", "APP__DATA_DIR") {
        settings.data_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("MANAGER_MEDIA_DIR", "APP__MEDIA_DIR") {
        settings.media_dir = PathBuf::from(v);
    }
    if let Some(v) = lookup("MANAGER_LOG", "APP__LOG") {
        settings.log = v;
    }
    if let Some(v) = lookup("MANAGER_HISTORY_FILE", "APP__HISTORY_FILE") {
        settings.history_file = Some(PathBuf::from(v));
    }
}
