use crate::errors::{AppError, AppResult};
use crate::models::RunnerSettings;
use anyhow::Context;
use std::path::Path;

pub fn load_settings(path: &Path) -> AppResult<RunnerSettings> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "settings file missing, using defaults");
        return Ok(RunnerSettings::default());
    }

    let settings = read_settings_file(path).map_err(|error| AppError::Config(format!("{:#}", error)))?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(raw: &str) -> AppResult<RunnerSettings> {
    if raw.trim().is_empty() {
        return Ok(RunnerSettings::default());
    }
    let settings: RunnerSettings = serde_yaml::from_str(raw)?;
    validate_settings(&settings)?;
    Ok(settings)
}

fn read_settings_file(path: &Path) -> anyhow::Result<RunnerSettings> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings from {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(RunnerSettings::default());
    }
    serde_yaml::from_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
}

fn validate_settings(settings: &RunnerSettings) -> AppResult<()> {
    for (name, argv) in [
        ("legendaryCommand", &settings.legendary_command),
        ("wineCommand", &settings.wine_command),
        ("wineserverCommand", &settings.wineserver_command),
    ] {
        if argv.first().map(|program| program.trim().is_empty()).unwrap_or(true) {
            return Err(AppError::Config(format!("{} must name a program", name)));
        }
    }
    if settings.chunk_channel_capacity == 0 {
        return Err(AppError::Config("chunkChannelCapacity must be at least 1".to_string()));
    }
    if settings.max_captured_bytes == 0 {
        return Err(AppError::Config("maxCapturedBytes must be at least 1".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{load_settings, parse_settings};
    use crate::errors::AppError;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let settings = parse_settings(
            "legendaryCommand: [python3, -m, legendary]\nterminateGraceMs: 250\n",
        )
        .expect("valid settings");
        assert_eq!(settings.legendary_command, vec!["python3", "-m", "legendary"]);
        assert_eq!(settings.terminate_grace_ms, 250);
        assert_eq!(settings.wine_command, vec!["wine"]);
        assert_eq!(settings.chunk_channel_capacity, 256);
    }

    #[test]
    fn empty_command_is_rejected() {
        let error = parse_settings("wineCommand: []\n").expect_err("empty argv");
        assert!(matches!(error, AppError::Config(_)));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&dir.path().join("absent.yaml")).expect("defaults");
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "terminateGraceMs: [not, a, number]\n").expect("write settings");
        let error = load_settings(&path).expect_err("malformed");
        assert!(error.to_string().starts_with("CONFIG_INVALID"));
    }
}
