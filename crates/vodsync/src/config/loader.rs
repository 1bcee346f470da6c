use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

/// Serialization format of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.yml`/`.yaml` are YAML, everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yml") || ext.eq_ignore_ascii_case("yaml") => {
                ConfigFormat::Yaml
            }
            _ => ConfigFormat::Json,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config = load_config_from_str(&content, ConfigFormat::from_path(path))?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

pub fn load_config_from_str(content: &str, format: ConfigFormat) -> Result<Config, ConfigError> {
    let config: Config = match format {
        ConfigFormat::Json => serde_json::from_str(content)?,
        // An empty YAML document deserializes to unit, not to an empty map.
        ConfigFormat::Yaml if content.trim().is_empty() => Config::default(),
        ConfigFormat::Yaml => serde_yaml::from_str(content)?,
    };

    validate_config(&config)?;

    Ok(config)
}

/// Checks cross-field constraints serde cannot express.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let backoff = &config.backoff;
    if !(0.0..=1.0).contains(&backoff.jitter) {
        return Err(invalid(format!(
            "backoff.jitter must be between 0 and 1, got {}",
            backoff.jitter
        )));
    }
    if backoff.base_secs == 0 {
        return Err(invalid("backoff.base_secs must be positive"));
    }
    if backoff.base_secs > backoff.cap_secs {
        return Err(invalid(format!(
            "backoff.base_secs ({}) exceeds backoff.cap_secs ({})",
            backoff.base_secs, backoff.cap_secs
        )));
    }

    let template = &config.download.media_url_template;
    if !template.is_empty() && !template.contains("{source_vod_id}") && !template.contains("{vod_id}")
    {
        return Err(invalid(
            "download.media_url_template must contain {source_vod_id} or {vod_id}",
        ));
    }

    if !config.upload.published_url_template.contains("{id}") {
        return Err(invalid("upload.published_url_template must contain {id}"));
    }
    const UPLOAD_CHUNK_UNIT: u64 = 256 * 1024;
    let chunk = config.upload.chunk_size_bytes;
    if chunk == 0 || chunk % UPLOAD_CHUNK_UNIT != 0 {
        return Err(invalid(format!(
            "upload.chunk_size_bytes must be a positive multiple of {}, got {}",
            UPLOAD_CHUNK_UNIT, chunk
        )));
    }

    if config.workers.lease_secs == 0 {
        return Err(invalid("workers.lease_secs must be positive"));
    }
    if config.download.progress_interval_secs >= config.workers.lease_secs {
        return Err(invalid(
            "download.progress_interval_secs must be shorter than workers.lease_secs",
        ));
    }
    if config.download.chunk_timeout_secs == 0
        || config.download.chunk_timeout_secs >= config.workers.lease_secs
    {
        return Err(invalid(format!(
            "download.chunk_timeout_secs must be positive and shorter than workers.lease_secs ({})",
            config.workers.lease_secs
        )));
    }

    if config.replay.buffer_size == 0 {
        return Err(invalid("replay.buffer_size must be positive"));
    }
    if config.replay.page_size == 0 {
        return Err(invalid("replay.page_size must be positive"));
    }
    if config.replay.poll_interval_ms == 0 {
        return Err(invalid("replay.poll_interval_ms must be positive"));
    }
    if config.replay.slow_client_timeout_ms == 0 {
        return Err(invalid("replay.slow_client_timeout_ms must be positive"));
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = load_config_from_str("{}", ConfigFormat::Json).unwrap();
        assert_eq!(config.backoff.base_secs, 5);
        assert_eq!(config.backoff.cap_secs, 300);
        assert_eq!(config.backoff.jitter, 0.2);
        assert_eq!(config.download.max_retries, 5);
        assert_eq!(config.upload.max_retries, 5);
        assert_eq!(config.upload.refresh_margin_secs, 120);
        assert_eq!(config.workers.lease_secs, 120);
        assert_eq!(config.replay.buffer_size, 256);
        assert_eq!(config.replay.keep_alive_secs, 15);
        assert_eq!(config.replay.page_size, 500);
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = load_config_from_str("", ConfigFormat::Yaml).unwrap();
        assert_eq!(config.upload.provider, "youtube");
    }

    #[test]
    fn test_load_yaml_sections() {
        let yaml = r#"
source:
  channel: somechannel
  user_id: "12345"
  client_id: abc
  client_secret_env: TWITCH_SECRET
download:
  directory: /var/lib/vodsync/media
  media_url_template: "https://media.example.com/{source_vod_id}.mp4"
  max_retries: 3
backoff:
  base_secs: 1
  cap_secs: 30
  jitter: 0
replay:
  bind: "0.0.0.0:9000"
logging:
  filter: "debug"
  json: true
"#;
        let config = load_config_from_str(yaml, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.source.channel, "somechannel");
        assert_eq!(config.source.user_id, "12345");
        assert_eq!(config.source.client_secret_env.as_deref(), Some("TWITCH_SECRET"));
        assert_eq!(config.download.max_retries, 3);
        assert_eq!(config.backoff.cap_secs, 30);
        assert_eq!(config.replay.bind, "0.0.0.0:9000");
        assert!(config.logging.json);
        // Untouched sections keep their defaults.
        assert_eq!(config.upload.privacy_status, "private");
    }

    #[test]
    fn test_load_json_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vodsync.json");
        std::fs::write(&path, r#"{"workers": {"poll_interval_secs": 3}}"#).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.workers.poll_interval_secs, 3);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.yaml")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.YML")), ConfigFormat::Yaml);
        assert_eq!(ConfigFormat::from_path(Path::new("a.json")), ConfigFormat::Json);
        assert_eq!(ConfigFormat::from_path(Path::new("config")), ConfigFormat::Json);
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/vodsync.yaml");
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn test_invalid_jitter_rejected() {
        let result = load_config_from_str(r#"{"backoff": {"jitter": 1.5}}"#, ConfigFormat::Json);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_base_above_cap_rejected() {
        let result = load_config_from_str(
            r#"{"backoff": {"base_secs": 600, "cap_secs": 300}}"#,
            ConfigFormat::Json,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_media_template_requires_placeholder() {
        let result = load_config_from_str(
            r#"{"download": {"media_url_template": "https://example.com/video.mp4"}}"#,
            ConfigFormat::Json,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_upload_chunk_size_must_be_aligned() {
        let result = load_config_from_str(
            r#"{"upload": {"chunk_size_bytes": 1000}}"#,
            ConfigFormat::Json,
        );
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_malformed_json() {
        let result = load_config_from_str("{not json", ConfigFormat::Json);
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }
}
