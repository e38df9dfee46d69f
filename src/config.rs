//! Configuration management for CrabShard

use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

/// CrabShard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Migration protocol settings
    pub migration: MigrationConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Migration protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Default maximum chunk size in bytes when the request omits one
    pub max_chunk_size_bytes: u64,
    /// Advisory cap on donor capture buffers (reload + deleted)
    pub max_capture_bytes: u64,
    /// Maximum serialized size of one clone batch (max user object size)
    pub clone_batch_max_bytes: usize,
    /// Soft cap on one transfer-mods batch
    pub transfer_mods_max_bytes: usize,
    /// Maximum status poll rounds while waiting for the recipient
    pub max_status_polls: u32,
    /// Distributed lock acquisition timeout in seconds
    pub dist_lock_timeout_secs: u64,
    /// How long a commit waits for the recipient to reach done
    pub commit_wait_secs: u64,
    /// Seconds to wait before re-reading an ambiguous commit outcome
    pub commit_confirm_delay_secs: u64,
    /// Replication wait iterations per catchup batch
    pub catchup_wait_iterations: u32,
    /// Sleep between catchup replication checks in milliseconds
    pub catchup_wait_interval_ms: u64,
    /// Upper bound on the pre-commit replication drain in minutes
    pub repl_drain_max_mins: u64,
    /// Idle back-off in the steady loop in milliseconds
    pub steady_idle_ms: u64,
    /// Secondary-throttle replication wait per batch in seconds
    pub secondary_throttle_timeout_secs: u64,
    /// Snapshot removed documents before deleting them
    pub move_paranoia: bool,
    /// Directory for paranoia snapshots
    pub paranoia_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            max_chunk_size_bytes: 64 * 1024 * 1024,   // 64MB
            max_capture_bytes: 500 * 1024 * 1024,     // 500MB
            clone_batch_max_bytes: 16 * 1024 * 1024,  // max user object size
            transfer_mods_max_bytes: 1024 * 1024,     // 1MB
            max_status_polls: 86_400,
            dist_lock_timeout_secs: 30,
            commit_wait_secs: 30,
            commit_confirm_delay_secs: 10,
            catchup_wait_iterations: 3600 * 50,
            catchup_wait_interval_ms: 20,
            repl_drain_max_mins: 600,
            steady_idle_ms: 10,
            secondary_throttle_timeout_secs: 60,
            move_paranoia: false,
            paranoia_dir: "./data/moveChunk".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            migration: MigrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or use defaults
    pub async fn load() -> crate::Result<Self> {
        let mut config = if Path::new("config/default.toml").exists() {
            let content = fs::read_to_string("config/default.toml").await?;
            toml::from_str(&content)
                .map_err(|e| crate::MigrateError::invalid(format!("bad config file: {}", e)))?
        } else {
            Config::default()
        };

        config.apply_env_overrides();

        if let Err(e) = config.validate_migration_config() {
            eprintln!("Invalid migration configuration: {}", e);
            config.migration = MigrationConfig::default();
        }

        if let Err(e) = config.validate_logging_config() {
            eprintln!("Invalid logging configuration: {}", e);
            config.logging = LoggingConfig::default();
        }

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(max_chunk) = std::env::var("CRABSHARD_MAX_CHUNK_SIZE_BYTES") {
            if let Ok(bytes) = max_chunk.parse::<u64>() {
                self.migration.max_chunk_size_bytes = bytes;
                println!("Max chunk size from environment: {}", bytes);
            }
        }

        if let Ok(max_capture) = std::env::var("CRABSHARD_MAX_CAPTURE_BYTES") {
            if let Ok(bytes) = max_capture.parse::<u64>() {
                self.migration.max_capture_bytes = bytes;
                println!("Max capture memory from environment: {}", bytes);
            }
        }

        if let Ok(timeout) = std::env::var("CRABSHARD_DIST_LOCK_TIMEOUT") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.migration.dist_lock_timeout_secs = secs;
                println!("Distributed lock timeout from environment: {}s", secs);
            }
        }

        if let Ok(paranoia) = std::env::var("CRABSHARD_MOVE_PARANOIA") {
            if let Ok(enabled) = paranoia.parse::<bool>() {
                self.migration.move_paranoia = enabled;
                println!("Move paranoia from environment: {}", enabled);
            }
        }

        if let Ok(paranoia_dir) = std::env::var("CRABSHARD_PARANOIA_DIR") {
            self.migration.paranoia_dir = paranoia_dir;
            println!(
                "Paranoia directory from environment: {}",
                self.migration.paranoia_dir
            );
        }

        if let Ok(log_level) = std::env::var("CRABSHARD_LOG_LEVEL") {
            self.logging.level = log_level;
            println!("Log level from environment: {}", self.logging.level);
        }

        if let Ok(log_format) = std::env::var("CRABSHARD_LOG_FORMAT") {
            self.logging.format = log_format;
            println!("Log format from environment: {}", self.logging.format);
        }
    }

    /// Validate migration configuration
    fn validate_migration_config(&self) -> Result<(), String> {
        if self.migration.max_chunk_size_bytes < 1024 {
            return Err("Max chunk size must be at least 1KB".to_string());
        }

        if self.migration.max_capture_bytes < self.migration.transfer_mods_max_bytes as u64 {
            return Err("Capture memory cap must exceed one transfer batch".to_string());
        }

        if self.migration.clone_batch_max_bytes < 1024 {
            return Err("Clone batch size must be at least 1KB".to_string());
        }

        if self.migration.max_status_polls == 0 {
            return Err("Status poll limit must be greater than 0".to_string());
        }

        if self.migration.dist_lock_timeout_secs == 0 {
            return Err("Distributed lock timeout must be greater than 0".to_string());
        }

        if self.migration.commit_wait_secs == 0 {
            return Err("Commit wait must be greater than 0".to_string());
        }

        if self.migration.move_paranoia && self.migration.paranoia_dir.is_empty() {
            return Err("Paranoia enabled but no directory provided".to_string());
        }

        Ok(())
    }

    /// Validate logging configuration
    fn validate_logging_config(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Valid levels: {:?}",
                self.logging.level, valid_levels
            ));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format: {}. Valid formats: {:?}",
                self.logging.format, valid_formats
            ));
        }

        Ok(())
    }

    /// Save configuration to file
    pub async fn save(&self, path: &str) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::MigrateError::internal(format!("serialize config: {}", e)))?;
        fs::write(path, content).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.migration.max_capture_bytes, 500 * 1024 * 1024);
        assert_eq!(config.migration.max_status_polls, 86_400);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_rejects_tiny_chunk() {
        let mut config = Config::default();
        config.migration.max_chunk_size_bytes = 1;
        assert!(config.validate_migration_config().is_err());
    }

    #[test]
    fn test_validate_logging() {
        let mut config = Config::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate_logging_config().is_err());
        config.logging.level = "debug".to_string();
        assert!(config.validate_logging_config().is_ok());
    }

    #[tokio::test]
    async fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let config = Config::default();
        config.save(path.to_str().unwrap()).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let parsed: Config = toml::from_str(&content).unwrap();
        assert_eq!(
            parsed.migration.max_chunk_size_bytes,
            config.migration.max_chunk_size_bytes
        );
    }
}
