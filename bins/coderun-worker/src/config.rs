// Worker configuration and the language runtime table
use anyhow::{bail, Context, Result};
use coderun_common::config::{env_or, QueueConfig};
use coderun_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::admission::AdmissionConfig;

/// Placeholder replaced by the submitted source text
pub const SOURCE_PLACEHOLDER: &str = "{source}";
/// Placeholder replaced by the path of the source file in the temp workspace
pub const FILE_PLACEHOLDER: &str = "{file}";

/// How to launch one language's runtime.
///
/// When `source_file` is set the source is written to that file name inside a
/// fresh temporary directory before launch; otherwise it is passed inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageRuntime {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    #[serde(default)]
    pub source_file: Option<String>,
}

impl LanguageRuntime {
    /// Expand placeholders in the argument template.
    pub fn render_args(&self, source_code: &str, file: Option<&Path>) -> Vec<String> {
        let file = file.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                if arg == SOURCE_PLACEHOLDER {
                    source_code.to_string()
                } else {
                    arg.replace(FILE_PLACEHOLDER, &file)
                }
            })
            .collect()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageRuntime>,
}

/// Language runtime table
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageRuntime>,
}

impl LanguageConfigManager {
    /// Host toolchains: `python3 -c <source>` and `go run <file>`.
    pub fn builtin() -> Self {
        let mut configs = HashMap::new();
        configs.insert(
            Language::Python,
            LanguageRuntime {
                name: "python".to_string(),
                command: "python3".to_string(),
                args: vec!["-c".to_string(), SOURCE_PLACEHOLDER.to_string()],
                source_file: None,
            },
        );
        configs.insert(
            Language::Go,
            LanguageRuntime {
                name: "go".to_string(),
                command: "go".to_string(),
                args: vec!["run".to_string(), FILE_PLACEHOLDER.to_string()],
                source_file: Some("main.go".to_string()),
            },
        );
        Self { configs }
    }

    pub fn from_runtimes(runtimes: Vec<LanguageRuntime>) -> Result<Self> {
        let mut configs = HashMap::new();
        for runtime in runtimes {
            let language: Language = runtime
                .name
                .parse()
                .with_context(|| format!("Unknown language '{}' in runtime table", runtime.name))?;
            if runtime.command.trim().is_empty() {
                bail!("Runtime for '{}' has an empty command", runtime.name);
            }
            configs.insert(language, runtime);
        }
        Ok(Self { configs })
    }

    /// Load overrides from a languages.json file on top of the builtin table
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .context("Failed to read languages.json")?;

        let languages_json: LanguagesJson = serde_json::from_str(&content)
            .context("Failed to parse languages.json")?;

        let overrides = Self::from_runtimes(languages_json.languages)?;
        let mut manager = Self::builtin();
        manager.configs.extend(overrides.configs);
        Ok(manager)
    }

    /// Get runtime for a specific language
    pub fn get_config(&self, language: &Language) -> Result<&LanguageRuntime> {
        self.configs
            .get(language)
            .ok_or_else(|| anyhow::anyhow!("No runtime configured for language: {}", language))
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().map(|l| l.to_string()).collect();
        names.sort();
        names
    }
}

/// Everything the worker binary reads at startup.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: QueueConfig,
    pub worker_name: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub admission: AdmissionConfig,
    pub languages_path: Option<PathBuf>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let queue = QueueConfig::from_env()?;

        let concurrency: usize = env_or("WORKER_CONCURRENCY", 10)?;
        if concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }

        let admission = AdmissionConfig {
            burst: env_or("ADMISSION_BURST", 30)?,
            refill_per_sec: env_or("ADMISSION_RATE_PER_SEC", 10.0)?,
            max_jitter: Duration::from_secs(env_or("ADMISSION_MAX_JITTER_SECS", 10)?),
        };
        if admission.refill_per_sec < 0.0 || !admission.refill_per_sec.is_finite() {
            bail!("ADMISSION_RATE_PER_SEC must be a non-negative number");
        }

        let languages_path = std::env::var("LANGUAGES_CONFIG").ok().map(PathBuf::from);

        Ok(Self {
            queue,
            worker_name: resolve_worker_name(std::env::var("WORKER_NAME").ok())?,
            concurrency,
            poll_interval: Duration::from_millis(env_or("QUEUE_POLL_INTERVAL_MS", 500)?),
            admission,
            languages_path,
        })
    }

    pub fn runtimes(&self) -> Result<LanguageConfigManager> {
        match &self.languages_path {
            Some(path) => LanguageConfigManager::load(path),
            None => Ok(LanguageConfigManager::builtin()),
        }
    }
}

/// Worker identity, which names the worker's active list in Redis. Two live
/// processes must never share one: a restarting worker requeues everything
/// in its list. Defaults to the host name.
pub fn resolve_worker_name(explicit: Option<String>) -> Result<String> {
    match explicit.map(|name| name.trim().to_string()) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => hostname().context("WORKER_NAME is unset and the host name is unavailable"),
    }
}

#[cfg(unix)]
fn hostname() -> Result<String> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is writable for buf.len() bytes.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).trim().to_string();
    if name.is_empty() {
        bail!("host name is empty");
    }
    Ok(name)
}

#[cfg(not(unix))]
fn hostname() -> Result<String> {
    bail!("host name lookup is only supported on unix")
}
