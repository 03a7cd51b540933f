//! Orchestrator settings loaded from `etc/hostforge/hostforge.yaml`.
//!
//! Every field has a default, so a missing file yields a working settings
//! value. The ConfigArtifact (operator-facing KEY=VALUE file) is separate and
//! lives in [`crate::config`]; this file only describes *how* to provision.

use crate::cert::MismatchDecision;
use crate::error::Result;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::Path;

// ---------------------------------------------------------------------------
// SettingsWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// AppSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Runtime user; defaults to the app name.
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Run once inside the app directory as the runtime user after fetch.
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default = "default_start_command")]
    pub start_command: String,
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

fn default_app_name() -> String {
    "assistant".to_string()
}

fn default_repo() -> String {
    "https://github.com/example/assistant.git".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_start_command() -> String {
    "/usr/bin/env python3 -m app".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            user: None,
            repo: default_repo(),
            branch: default_branch(),
            install_command: None,
            start_command: default_start_command(),
            health_path: default_health_path(),
        }
    }
}

impl AppSettings {
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(&self.name)
    }
}

// ---------------------------------------------------------------------------
// ArtifactSpec
// ---------------------------------------------------------------------------

/// A command whose stdout must contain `expect` for the artifact to count as
/// installed (e.g. `["piper", "--version"]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionProbe {
    pub command: Vec<String>,
    pub expect: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub name: String,
    pub url: String,
    /// Relative paths are resolved against the application directory.
    pub destination: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub version_probe: Option<VersionProbe>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub mode: Option<u32>,
}

fn default_true() -> bool {
    true
}

fn default_artifacts() -> Vec<ArtifactSpec> {
    vec![
        ArtifactSpec {
            name: "stt-model".to_string(),
            url: "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/ggml-base.en.bin"
                .to_string(),
            destination: "models/ggml-base.en.bin".to_string(),
            sha256: None,
            version_probe: None,
            version: Some("base.en".to_string()),
            required: true,
            mode: Some(0o644),
        },
        ArtifactSpec {
            name: "tts-voice".to_string(),
            url: "https://huggingface.co/rhasspy/piper-voices/resolve/main/en/en_US/lessac/medium/en_US-lessac-medium.onnx"
                .to_string(),
            destination: "models/en_US-lessac-medium.onnx".to_string(),
            sha256: None,
            version_probe: None,
            version: Some("lessac-medium".to_string()),
            required: false,
            mode: Some(0o644),
        },
    ]
}

// ---------------------------------------------------------------------------
// KeySpec (ConfigArtifact schema)
// ---------------------------------------------------------------------------

/// Describes one key of the ConfigArtifact.
///
/// `default` may reference `{{app_dir}}`, `{{public_address}}` and
/// `{{instance_id}}`; they are expanded when defaults are built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeySpec {
    pub name: String,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub secret: bool,
    #[serde(default)]
    pub required: bool,
    /// Generate a random value when nothing else supplies one.
    #[serde(default)]
    pub generate: bool,
    #[serde(default)]
    pub prompt: Option<String>,
}

impl KeySpec {
    fn plain(name: &str, default: Option<&str>, prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            default: default.map(str::to_string),
            secret: false,
            required: false,
            generate: false,
            prompt: Some(prompt.to_string()),
        }
    }

    fn secret(name: &str, required: bool, prompt: &str) -> Self {
        Self {
            name: name.to_string(),
            default: None,
            secret: true,
            required,
            generate: false,
            prompt: Some(prompt.to_string()),
        }
    }

    pub fn prompt_text(&self) -> &str {
        self.prompt.as_deref().unwrap_or(&self.name)
    }
}

pub fn default_config_keys() -> Vec<KeySpec> {
    vec![
        KeySpec::plain("HOST", Some("127.0.0.1"), "Address the app listens on"),
        KeySpec::plain("PORT", Some("8000"), "Port the app listens on"),
        KeySpec::plain(
            "STATIC_DIR",
            Some("{{app_dir}}/static"),
            "Directory of static assets served by the proxy",
        ),
        KeySpec::plain(
            "PUBLIC_HOST",
            Some("{{public_address}}"),
            "Public address or hostname of this machine",
        ),
        KeySpec::plain("DOMAIN", None, "Public domain name (empty for self-signed TLS)"),
        KeySpec::plain("CERT_EMAIL", None, "Contact email for certificate issuance"),
        KeySpec::secret("AI_API_KEY", true, "Cloud AI API key"),
        KeySpec::plain("SMTP_HOST", None, "SMTP host for outgoing mail"),
        KeySpec::plain("SMTP_USER", None, "SMTP username"),
        KeySpec::secret("SMTP_PASSWORD", false, "SMTP password"),
        KeySpec {
            name: "SESSION_SECRET".to_string(),
            default: None,
            secret: true,
            required: true,
            generate: true,
            prompt: None,
        },
    ]
}

// ---------------------------------------------------------------------------
// Remaining sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Site file name; defaults to the app name.
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default = "default_http_port")]
    pub listen_port: u16,
    #[serde(default = "default_https_port")]
    pub tls_port: u16,
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            site_name: None,
            listen_port: default_http_port(),
            tls_port: default_https_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    #[serde(default = "default_renewal_threshold_days")]
    pub renewal_threshold_days: i64,
    #[serde(default = "default_self_signed_days")]
    pub self_signed_days: i64,
    #[serde(default)]
    pub mismatch_policy: MismatchDecision,
    /// Use the ACME staging directory (untrusted certificates, generous limits).
    #[serde(default)]
    pub staging: bool,
    /// Cron schedule for the renewal job.
    #[serde(default = "default_renew_schedule")]
    pub renew_schedule: String,
    /// Suffixes of provider-assigned hostnames a public CA will not issue for.
    #[serde(default = "default_unissuable_suffixes")]
    pub unissuable_suffixes: Vec<String>,
}

fn default_renewal_threshold_days() -> i64 {
    30
}

fn default_self_signed_days() -> i64 {
    365
}

fn default_renew_schedule() -> String {
    "17 3 * * *".to_string()
}

fn default_unissuable_suffixes() -> Vec<String> {
    vec![
        ".amazonaws.com".to_string(),
        ".compute.internal".to_string(),
        ".internal".to_string(),
        ".local".to_string(),
    ]
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            renewal_threshold_days: default_renewal_threshold_days(),
            self_signed_days: default_self_signed_days(),
            mismatch_policy: MismatchDecision::default(),
            staging: false,
            renew_schedule: default_renew_schedule(),
            unissuable_suffixes: default_unissuable_suffixes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    /// Upper bound for any single download or external command.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2000
}

fn default_multiplier() -> u32 {
    2
}

fn default_timeout_secs() -> u64 {
    600
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSettings {
    #[serde(default = "default_health_attempts")]
    pub attempts: u32,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_lines: usize,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

fn default_health_attempts() -> u32 {
    30
}

fn default_health_interval_ms() -> u64 {
    1000
}

fn default_diagnostic_lines() -> usize {
    20
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            attempts: default_health_attempts(),
            interval_ms: default_health_interval_ms(),
            diagnostic_lines: default_diagnostic_lines(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectSettings {
    #[serde(default = "default_active_attempts")]
    pub active_attempts: u32,
    #[serde(default = "default_active_interval_ms")]
    pub active_interval_ms: u64,
}

fn default_active_attempts() -> u32 {
    3
}

fn default_active_interval_ms() -> u64 {
    1000
}

impl Default for InspectSettings {
    fn default() -> Self {
        Self {
            active_attempts: default_active_attempts(),
            active_interval_ms: default_active_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    #[serde(default = "default_artifact_workers")]
    pub artifact_workers: usize,
}

fn default_artifact_workers() -> usize {
    3
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            artifact_workers: default_artifact_workers(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metadata_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_metadata_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_metadata_endpoint() -> String {
    "http://169.254.169.254".to_string()
}

fn default_metadata_timeout_ms() -> u64 {
    1500
}

impl Default for MetadataSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_metadata_endpoint(),
            timeout_ms: default_metadata_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirewallSettings {
    #[serde(default = "default_true")]
    pub manage: bool,
    #[serde(default = "default_firewall_allow")]
    pub allow: Vec<String>,
}

fn default_firewall_allow() -> Vec<String> {
    vec![
        "OpenSSH".to_string(),
        "80/tcp".to_string(),
        "443/tcp".to_string(),
    ]
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            manage: true,
            allow: default_firewall_allow(),
        }
    }
}

fn default_packages() -> Vec<String> {
    [
        "nginx",
        "git",
        "python3",
        "python3-venv",
        "ffmpeg",
        "openssl",
        "certbot",
        "ufw",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

// ---------------------------------------------------------------------------
// Settings (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub app: AppSettings,
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
    #[serde(default = "default_artifacts")]
    pub artifacts: Vec<ArtifactSpec>,
    #[serde(default = "default_config_keys")]
    pub config_keys: Vec<KeySpec>,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub health: HealthSettings,
    #[serde(default)]
    pub inspect: InspectSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub metadata: MetadataSettings,
    #[serde(default)]
    pub firewall: FirewallSettings,
}

fn default_version() -> u32 {
    1
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: default_version(),
            app: AppSettings::default(),
            packages: default_packages(),
            artifacts: default_artifacts(),
            config_keys: default_config_keys(),
            proxy: ProxySettings::default(),
            tls: TlsSettings::default(),
            retry: RetrySettings::default(),
            health: HealthSettings::default(),
            inspect: InspectSettings::default(),
            concurrency: ConcurrencySettings::default(),
            metadata: MetadataSettings::default(),
            firewall: FirewallSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings for `root`, falling back to defaults when no file exists.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::settings_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let settings: Settings = serde_yaml::from_str(&data)?;
        Ok(settings)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::settings_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn site_name(&self) -> &str {
        self.proxy.site_name.as_deref().unwrap_or(&self.app.name)
    }

    pub fn key_spec(&self, name: &str) -> Option<&KeySpec> {
        self.config_keys.iter().find(|k| k.name == name)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<SettingsWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(SettingsWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        for (what, name) in [
            ("app.name", self.app.name.as_str()),
            ("app.user", self.app.user()),
            ("proxy.site_name", self.site_name()),
        ] {
            if let Err(e) = paths::validate_name(name) {
                error(format!("{what}: {e}"));
            }
        }

        if self.retry.attempts == 0 {
            error("retry.attempts must be at least 1".to_string());
        }
        if self.retry.multiplier < 2 {
            error(format!(
                "retry.multiplier={} must be at least 2 so backoff grows between attempts",
                self.retry.multiplier
            ));
        }
        if self.health.attempts == 0 {
            error("health.attempts must be at least 1".to_string());
        }
        if self.concurrency.artifact_workers == 0 {
            error("concurrency.artifact_workers must be at least 1".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for artifact in &self.artifacts {
            if !seen.insert(artifact.name.as_str()) {
                error(format!("duplicate artifact name '{}'", artifact.name));
            }
        }

        let mut warn = |message: String| {
            warnings.push(SettingsWarning {
                level: WarnLevel::Warning,
                message,
            })
        };

        for artifact in &self.artifacts {
            if artifact.sha256.is_none() && artifact.version_probe.is_none() {
                warn(format!(
                    "artifact '{}' has no checksum or version probe; only existence is verified",
                    artifact.name
                ));
            }
        }
        if self.retry.attempts > 10 {
            warn(format!(
                "retry.attempts={} (>10 is unusual)",
                self.retry.attempts
            ));
        }
        if self.tls.renewal_threshold_days <= 0 {
            warn("tls.renewal_threshold_days <= 0 disables renewal".to_string());
        }
        for required in ["HOST", "PORT", "STATIC_DIR"] {
            if self.key_spec(required).is_none() {
                warn(format!(
                    "config_keys has no '{required}'; proxy and unit templates will fail to render"
                ));
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.app.name, "assistant");
        assert_eq!(settings.app.user(), "assistant");
        assert_eq!(settings.retry.attempts, 3);
        assert_eq!(settings.tls.renewal_threshold_days, 30);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let yaml = "app:\n  name: voicebot\n  user: vb\nretry:\n  attempts: 5\n";
        let settings: Settings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.app.name, "voicebot");
        assert_eq!(settings.app.user(), "vb");
        assert_eq!(settings.site_name(), "voicebot");
        assert_eq!(settings.retry.attempts, 5);
        assert_eq!(settings.retry.multiplier, 2);
        assert!(settings.key_spec("AI_API_KEY").unwrap().secret);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.app.name = "svc".to_string();
        settings.save(dir.path()).unwrap();
        let loaded = Settings::load(dir.path()).unwrap();
        assert_eq!(loaded.app.name, "svc");
    }

    #[test]
    fn default_settings_have_no_errors() {
        let warnings = Settings::default().validate();
        assert!(warnings.iter().all(|w| w.level != WarnLevel::Error));
    }

    #[test]
    fn validate_flags_bad_names_and_zero_attempts() {
        let mut settings = Settings::default();
        settings.app.name = "Bad Name".to_string();
        settings.retry.attempts = 0;
        let errors: Vec<_> = settings
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .collect();
        assert!(errors.iter().any(|w| w.message.contains("app.name")));
        assert!(errors.iter().any(|w| w.message.contains("retry.attempts")));
    }

    #[test]
    fn validate_rejects_flat_backoff() {
        let mut settings = Settings::default();
        for multiplier in [0, 1] {
            settings.retry.multiplier = multiplier;
            assert!(settings
                .validate()
                .iter()
                .any(|w| w.level == WarnLevel::Error && w.message.contains("retry.multiplier")));
        }
        settings.retry.multiplier = 2;
        assert!(!settings
            .validate()
            .iter()
            .any(|w| w.message.contains("retry.multiplier")));
    }

    #[test]
    fn validate_warns_on_unverified_artifacts() {
        let settings = Settings::default();
        let warnings = settings.validate();
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("stt-model") && w.level == WarnLevel::Warning));
    }
}
