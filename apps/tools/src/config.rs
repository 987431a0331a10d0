use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use client_core::DEFAULT_MOVIE_API_URL;
use serde::Deserialize;

pub const SETTINGS_FILE: &str = "watchlog.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub database_url: String,
    pub collaborator_id: Option<String>,
    pub movie_api_url: String,
    pub movie_api_key: Option<String>,
    pub write_retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/watchlog.db".into(),
            collaborator_id: None,
            movie_api_url: DEFAULT_MOVIE_API_URL.into(),
            movie_api_key: None,
            write_retry_delay_ms: 250,
        }
    }
}

impl Settings {
    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }
}

/// Defaults, then `watchlog.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<toml::Table>(raw) else {
        return;
    };

    let text = |key: &str| {
        file_cfg
            .get(key)
            .and_then(toml::Value::as_str)
            .map(str::to_string)
    };
    if let Some(v) = text("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = text("collaborator_id") {
        settings.collaborator_id = Some(v);
    }
    if let Some(v) = text("movie_api_url") {
        settings.movie_api_url = v;
    }
    if let Some(v) = text("movie_api_key") {
        settings.movie_api_key = Some(v);
    }
    if let Some(v) = file_cfg
        .get("write_retry_delay_ms")
        .and_then(toml::Value::as_integer)
        .and_then(|v| u64::try_from(v).ok())
    {
        settings.write_retry_delay_ms = v;
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("APP__COLLABORATOR_ID") {
        settings.collaborator_id = Some(v);
    }

    if let Some(v) = var("APP__MOVIE_API_URL") {
        settings.movie_api_url = v;
    }
    if let Some(v) = var("APP__MOVIE_API_KEY") {
        settings.movie_api_key = Some(v);
    }

    if let Some(v) = var("APP__WRITE_RETRY_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.write_retry_delay_ms = parsed;
        }
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = database_url
        .strip_prefix("sqlite://")
        .and_then(|rest| rest.split('?').next())
        .filter(|path| !path.is_empty())
    else {
        return Ok(());
    };

    let Some(parent) = Path::new(path).parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
