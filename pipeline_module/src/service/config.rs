use std::env;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::completion::{DEFAULT_COMPLETION_MODEL, DEFAULT_OPENAI_URL};
use crate::dispatch::DispatchPolicy;

use super::BoxError;

pub const DEFAULT_INBOUND_BODY_MAX_BYTES: usize = 25 * 1024 * 1024;
pub const DEFAULT_PIPELINE_MAX_IN_FLIGHT: usize = 32;
pub const DEFAULT_PIPELINE_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

pub const POSTAL_API_KEY_SECRET: &str = "postal-api-key";
pub const OPENAI_API_KEY_SECRET: &str = "openai-api-key";

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub store_root: PathBuf,
    pub config_dir: PathBuf,
    pub policy: DispatchPolicy,
    /// Recipients of pipeline error notifications.
    pub operator_emails: Vec<String>,
    /// Reviewers of FAQ answers. Empty sends answers directly.
    pub faq_reviewers: Vec<String>,
    pub postal_api_url: String,
    pub postal_api_key: Option<String>,
    pub openai_api_url: String,
    pub openai_api_key: Option<String>,
    pub completion_model: String,
    pub http_timeout: Duration,
    pub pipeline_max_in_flight: usize,
    pub pipeline_queue_capacity: usize,
    pub inbound_body_max_bytes: usize,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, BoxError> {
        dotenvy::dotenv().ok();

        let host = env_var_non_empty("ASSISTANCE_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = env_parse("ASSISTANCE_PORT").unwrap_or(8000);

        let store_root = match env_var_non_empty("ASSISTANCE_STORE") {
            Some(raw) => resolve_path(raw)?,
            None => default_store_root()?,
        };
        let config_dir = match env_var_non_empty("ASSISTANCE_CONFIG_DIR") {
            Some(raw) => resolve_path(raw)?,
            None => store_root.join("config"),
        };

        let defaults = DispatchPolicy::default();
        let policy = DispatchPolicy {
            root_domain: env_var_non_empty("ROOT_DOMAIN")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or(defaults.root_domain),
            forwarding_sender: env_var_non_empty("FORWARDING_SENDER")
                .unwrap_or(defaults.forwarding_sender),
            faq_agent: env_var_non_empty("FAQ_AGENT")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or(defaults.faq_agent),
            reply_formatter_prefix: env_var_non_empty("REPLY_FORMATTER_PREFIX")
                .map(|value| value.to_ascii_lowercase())
                .unwrap_or(defaults.reply_formatter_prefix),
        };

        let operator_emails = env_var_non_empty("OPERATOR_EMAILS")
            .or_else(|| env_var_non_empty("ADMIN_EMAIL"))
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        let faq_reviewers = env_var_non_empty("FAQ_REVIEWERS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();

        let postal_api_url = env_var_non_empty("POSTAL_API_URL")
            .unwrap_or_else(|| format!("https://postal.{}", policy.root_domain));
        let postal_api_key = resolve_secret(&config_dir, "POSTAL_API_KEY", POSTAL_API_KEY_SECRET)?;
        let openai_api_url =
            env_var_non_empty("OPENAI_API_URL").unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string());
        let openai_api_key = resolve_secret(&config_dir, "OPENAI_API_KEY", OPENAI_API_KEY_SECRET)?;
        let completion_model = env_var_non_empty("COMPLETION_MODEL")
            .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string());

        let http_timeout = Duration::from_secs(
            env_parse("HTTP_TIMEOUT_SECS")
                .filter(|value: &u64| *value > 0)
                .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS),
        );
        let pipeline_max_in_flight = env_parse("PIPELINE_MAX_IN_FLIGHT")
            .filter(|value: &usize| *value > 0)
            .unwrap_or(DEFAULT_PIPELINE_MAX_IN_FLIGHT);
        let pipeline_queue_capacity = env_parse("PIPELINE_QUEUE_CAPACITY")
            .filter(|value: &usize| *value > 0)
            .unwrap_or(DEFAULT_PIPELINE_QUEUE_CAPACITY);
        let inbound_body_max_bytes =
            env_parse("INBOUND_MAX_BYTES").unwrap_or(DEFAULT_INBOUND_BODY_MAX_BYTES);

        Ok(Self {
            host,
            port,
            store_root,
            config_dir,
            policy,
            operator_emails,
            faq_reviewers,
            postal_api_url,
            postal_api_key,
            openai_api_url,
            openai_api_key,
            completion_model,
            http_timeout,
            pipeline_max_in_flight,
            pipeline_queue_capacity,
            inbound_body_max_bytes,
        })
    }

    pub fn records_dir(&self) -> PathBuf {
        self.store_root.join("records").join("emails")
    }

    pub fn new_emails_dir(&self) -> PathBuf {
        self.store_root.join("pipelines").join("emails").join("new")
    }

    pub fn faq_dir(&self) -> PathBuf {
        self.config_dir.join("faq")
    }

    pub fn secrets_dir(&self) -> PathBuf {
        self.config_dir.join("secrets")
    }
}

/// Looks a secret up in the environment first, then in `<config>/secrets/<name>`.
pub fn resolve_secret(
    config_dir: &Path,
    env_key: &str,
    secret_name: &str,
) -> Result<Option<String>, io::Error> {
    if let Some(value) = env_var_non_empty(env_key) {
        return Ok(Some(value));
    }
    let path = config_dir.join("secrets").join(secret_name);
    match std::fs::read_to_string(&path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(trimmed.to_string()))
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

fn env_var_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var_non_empty(key).and_then(|value| value.parse::<T>().ok())
}

fn default_store_root() -> Result<PathBuf, io::Error> {
    let home = dirs::home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "home directory not found"))?;
    Ok(home.join(".assistance"))
}

fn resolve_path(raw: String) -> Result<PathBuf, io::Error> {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = env::current_dir()?;
        Ok(cwd.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    const TOUCHED_KEYS: [&str; 13] = [
        "ASSISTANCE_HOST",
        "ASSISTANCE_PORT",
        "ASSISTANCE_STORE",
        "ASSISTANCE_CONFIG_DIR",
        "ROOT_DOMAIN",
        "OPERATOR_EMAILS",
        "ADMIN_EMAIL",
        "FAQ_REVIEWERS",
        "POSTAL_API_URL",
        "POSTAL_API_KEY",
        "OPENAI_API_KEY",
        "PIPELINE_MAX_IN_FLIGHT",
        "HTTP_TIMEOUT_SECS",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clear() -> Self {
            let saved = TOUCHED_KEYS
                .iter()
                .map(|key| (key.to_string(), env::var(key).ok()))
                .collect();
            for key in TOUCHED_KEYS {
                env::remove_var(key);
            }
            Self { saved }
        }

        fn set(&self, key: &str, value: &str) {
            env::set_var(key, value);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, previous) in &self.saved {
                match previous {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    #[serial]
    fn defaults_derive_from_store_root() {
        let temp = TempDir::new().expect("tempdir");
        let guard = EnvGuard::clear();
        guard.set("ASSISTANCE_STORE", temp.path().to_str().unwrap());

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8000);
        assert_eq!(config.policy, DispatchPolicy::default());
        assert_eq!(config.postal_api_url, "https://postal.assistance.chat");
        assert_eq!(config.config_dir, temp.path().join("config"));
        assert_eq!(
            config.records_dir(),
            temp.path().join("records").join("emails")
        );
        assert_eq!(
            config.new_emails_dir(),
            temp.path().join("pipelines").join("emails").join("new")
        );
        assert_eq!(config.pipeline_max_in_flight, DEFAULT_PIPELINE_MAX_IN_FLIGHT);
        assert_eq!(config.http_timeout, Duration::from_secs(60));
        assert!(config.operator_emails.is_empty());
        assert!(config.faq_reviewers.is_empty());
    }

    #[test]
    #[serial]
    fn operator_list_falls_back_to_admin_email() {
        let temp = TempDir::new().expect("tempdir");
        let guard = EnvGuard::clear();
        guard.set("ASSISTANCE_STORE", temp.path().to_str().unwrap());
        guard.set("ADMIN_EMAIL", "admin@example.com");

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.operator_emails, vec!["admin@example.com"]);

        guard.set("OPERATOR_EMAILS", "a@example.com, b@example.com,");
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(
            config.operator_emails,
            vec!["a@example.com", "b@example.com"]
        );

        guard.set("FAQ_REVIEWERS", "desk@example.org");
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.faq_reviewers, vec!["desk@example.org"]);
    }

    #[test]
    #[serial]
    fn secrets_prefer_env_over_files() {
        let temp = TempDir::new().expect("tempdir");
        let guard = EnvGuard::clear();
        guard.set("ASSISTANCE_STORE", temp.path().to_str().unwrap());
        let secrets = temp.path().join("config").join("secrets");
        std::fs::create_dir_all(&secrets).unwrap();
        std::fs::write(secrets.join(POSTAL_API_KEY_SECRET), "file-key\n").unwrap();

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.postal_api_key.as_deref(), Some("file-key"));
        assert_eq!(config.openai_api_key, None);

        guard.set("POSTAL_API_KEY", "env-key");
        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.postal_api_key.as_deref(), Some("env-key"));
    }

    #[test]
    #[serial]
    fn invalid_numbers_fall_back_to_defaults() {
        let temp = TempDir::new().expect("tempdir");
        let guard = EnvGuard::clear();
        guard.set("ASSISTANCE_STORE", temp.path().to_str().unwrap());
        guard.set("ASSISTANCE_PORT", "not-a-port");
        guard.set("PIPELINE_MAX_IN_FLIGHT", "0");
        guard.set("ROOT_DOMAIN", "Example.ORG");

        let config = ServiceConfig::from_env().unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.pipeline_max_in_flight, DEFAULT_PIPELINE_MAX_IN_FLIGHT);
        assert_eq!(config.policy.root_domain, "example.org");
        assert_eq!(config.postal_api_url, "https://postal.example.org");
    }
}
