//! Layered configuration loader
//!
//! Sources are merged in this order, later ones winning:
//! 1. `default.toml` (required)
//! 2. `{environment}.toml` (optional)
//! 3. `local.toml` (optional)
//! 4. `CRONLEASE_*` environment variables
//!
//! A single file can replace steps 1-3 via `CRONLEASE_CONFIG_FILE` or
//! [`ConfigLoader::from_file`].

use std::path::{Path, PathBuf};

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat};

use crate::config::environment::Environment as AppEnvironment;
use crate::config::error::ConfigError;
use crate::config::settings::Settings;

const CONFIG_DIR_ENV: &str = "CRONLEASE_CONFIG_DIR";
const CONFIG_FILE_ENV: &str = "CRONLEASE_CONFIG_FILE";
const DEFAULT_CONFIG_DIR: &str = "config";
const ENV_PREFIX: &str = "CRONLEASE";
const ENV_SEPARATOR: &str = "__";

#[derive(Debug)]
pub struct ConfigLoader {
    config_dir: PathBuf,
    config_file: Option<PathBuf>,
    environment: AppEnvironment,
}

impl ConfigLoader {
    /// Create a loader from `CRONLEASE_CONFIG_DIR`, `CRONLEASE_CONFIG_FILE`
    /// and `CRONLEASE_APP_ENV`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MutualExclusivityError`] when both the directory
    /// and the file variable are set.
    pub fn new() -> Result<Self, ConfigError> {
        let dir_override = std::env::var(CONFIG_DIR_ENV).ok();
        let config_file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);

        if config_file.is_some() && dir_override.is_some() {
            return Err(ConfigError::mutual_exclusivity(format!(
                "{} and {} cannot both be set",
                CONFIG_DIR_ENV, CONFIG_FILE_ENV
            )));
        }

        Ok(Self {
            config_dir: dir_override
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_DIR)),
            config_file,
            environment: AppEnvironment::from_env(),
        })
    }

    /// Load exactly one file, still honouring environment variable overrides.
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            config_file: Some(path.into()),
            environment: AppEnvironment::from_env(),
        }
    }

    /// Override the environment overlay picked up from `CRONLEASE_APP_ENV`.
    pub fn with_environment(mut self, environment: AppEnvironment) -> Self {
        self.environment = environment;
        self
    }

    pub fn environment(&self) -> AppEnvironment {
        self.environment
    }

    /// Build, deserialize and validate the settings.
    pub fn load(&self) -> Result<Settings, ConfigError> {
        let settings = self.load_unvalidated()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Build and deserialize without validation, for callers that apply
    /// command-line overrides before validating.
    pub fn load_unvalidated(&self) -> Result<Settings, ConfigError> {
        let config = self.build_config()?;
        config.try_deserialize().map_err(|e| {
            ConfigError::ParseError(format!("Failed to deserialize configuration: {}", e))
        })
    }

    fn build_config(&self) -> Result<Config, ConfigError> {
        let builder = Config::builder();

        let builder = match &self.config_file {
            Some(file) => Self::add_file_source(builder, file, true)?,
            None => {
                let builder =
                    Self::add_file_source(builder, &self.config_dir.join("default.toml"), true)?;
                let builder = Self::add_file_source(
                    builder,
                    &self.config_dir.join(self.environment.overlay_file()),
                    false,
                )?;
                Self::add_file_source(builder, &self.config_dir.join("local.toml"), false)?
            }
        };

        // CRONLEASE_WORKER__EXECUTOR_THREAD -> worker.executor_thread
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_SEPARATOR)
                    .ignore_empty(true)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("worker.model_names"),
            )
            .build()
            .map_err(ConfigError::from)
    }

    fn add_file_source(
        builder: ConfigBuilder<DefaultState>,
        path: &Path,
        required: bool,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        if required && !path.exists() {
            return Err(ConfigError::file_not_found(format!(
                "Required configuration file not found: {}",
                path.display()
            )));
        }

        let name = path.to_str().ok_or_else(|| {
            ConfigError::validation("config_file", format!("{} is not valid UTF-8", path.display()))
        })?;

        Ok(builder.add_source(File::new(name, FileFormat::Toml).required(required)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::TempDir;

    // Tests mutate process environment; run them one at a time
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn setup_config_dir(files: &[(&str, &str)]) -> TempDir {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        for (name, content) in files {
            fs::write(temp_dir.path().join(name), content).expect("Failed to write config file");
        }
        temp_dir
    }

    struct EnvGuard {
        vars_to_restore: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self {
                vars_to_restore: Vec::new(),
            }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars_to_restore
                .push((key.to_string(), std::env::var(key).ok()));
            unsafe {
                std::env::set_var(key, value);
            }
        }

        fn remove(&mut self, key: &str) {
            self.vars_to_restore
                .push((key.to_string(), std::env::var(key).ok()));
            unsafe {
                std::env::remove_var(key);
            }
        }

        fn clear_loader_vars(&mut self) {
            for key in [
                CONFIG_DIR_ENV,
                CONFIG_FILE_ENV,
                AppEnvironment::ENV_VAR,
                "CRONLEASE_WORKER__EXECUTOR_THREAD",
                "CRONLEASE_WORKER__MODEL_NAMES",
            ] {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, original_value) in self.vars_to_restore.iter().rev() {
                unsafe {
                    match original_value {
                        Some(value) => std::env::set_var(key, value),
                        None => std::env::remove_var(key),
                    }
                }
            }
        }
    }

    const DEFAULT_TOML: &str = r#"
[database]
url = "postgres://localhost/cron"

[worker]
worker_id = "node-a"
executor_thread = 4
"#;

    #[test]
    fn test_mutual_exclusivity() {
        let _guard = TEST_MUTEX.lock().unwrap();
        let mut env = EnvGuard::new();
        env.clear_loader_vars();
        env.set(CONFIG_DIR_ENV, "/etc/cronlease");
        env.set(CONFIG_FILE_ENV, "/etc/cronlease/worker.toml");

        match ConfigLoader::new() {
            Err(ConfigError::MutualExclusivityError(msg)) => {
                assert!(msg.contains(CONFIG_DIR_ENV));
            }
            other => panic!("Expected MutualExclusivityError, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_default_toml() {
        let _guard = TEST_MUTEX.lock().unwrap();
        let mut env = EnvGuard::new();
        env.clear_loader_vars();
        let dir = setup_config_dir(&[]);
        env.set(CONFIG_DIR_ENV, dir.path().to_str().unwrap());

        let err = ConfigLoader::new().unwrap().load().unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(msg) if msg.contains("default.toml")));
    }

    #[test]
    fn test_layered_overrides() {
        let _guard = TEST_MUTEX.lock().unwrap();
        let mut env = EnvGuard::new();
        env.clear_loader_vars();
        let dir = setup_config_dir(&[
            ("default.toml", DEFAULT_TOML),
            ("production.toml", "[worker]\nexecutor_thread = 16\n"),
            ("local.toml", "[worker]\npolling_interval = 2\n"),
        ]);
        env.set(CONFIG_DIR_ENV, dir.path().to_str().unwrap());
        env.set(AppEnvironment::ENV_VAR, "production");

        let settings = ConfigLoader::new().unwrap().load().expect("load");
        assert_eq!(settings.worker.executor_thread, 16);
        assert_eq!(settings.worker.polling_interval, 2);
        assert_eq!(settings.worker.worker_id.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_env_vars_win() {
        let _guard = TEST_MUTEX.lock().unwrap();
        let mut env = EnvGuard::new();
        env.clear_loader_vars();
        let dir = setup_config_dir(&[("default.toml", DEFAULT_TOML)]);
        env.set(CONFIG_DIR_ENV, dir.path().to_str().unwrap());
        env.set("CRONLEASE_WORKER__EXECUTOR_THREAD", "9");
        env.set("CRONLEASE_WORKER__MODEL_NAMES", "Notification,Report");

        let settings = ConfigLoader::new().unwrap().load().expect("load");
        assert_eq!(settings.worker.executor_thread, 9);
        assert_eq!(
            settings.worker.model_names,
            vec!["Notification".to_string(), "Report".to_string()]
        );
    }

    #[test]
    fn test_from_file_skips_layering() {
        let _guard = TEST_MUTEX.lock().unwrap();
        let mut env = EnvGuard::new();
        env.clear_loader_vars();
        let dir = setup_config_dir(&[("worker.toml", DEFAULT_TOML)]);

        let settings = ConfigLoader::from_file(dir.path().join("worker.toml"))
            .with_environment(AppEnvironment::Test)
            .load()
            .expect("load");
        assert_eq!(settings.database.url, "postgres://localhost/cron");
        assert_eq!(settings.worker.executor_thread, 4);
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let _guard = TEST_MUTEX.lock().unwrap();
        let mut env = EnvGuard::new();
        env.clear_loader_vars();
        let dir = setup_config_dir(&[(
            "default.toml",
            "[database]\nurl = \"postgres://x/y\"\n[worker]\nexecutor_thread = 0\n",
        )]);
        env.set(CONFIG_DIR_ENV, dir.path().to_str().unwrap());

        let err = ConfigLoader::new().unwrap().load().unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { field, .. } if field == "worker.executor_thread")
        );
    }
}
