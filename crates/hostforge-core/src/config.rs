//! ConfigArtifact synthesis and persistence.
//!
//! The artifact is the operator-facing `KEY=VALUE` env file read by the
//! application unit. Synthesis merges three layers per key: schema defaults,
//! the existing file, and provider input. Existing values win over defaults
//! unless `force_defaults` is set; provider input wins over both, but only for
//! keys it actually supplies.
//!
//! Secret values are never logged. `Debug` and `Display` on [`ConfigEntry`]
//! mask them.

use crate::cert::MismatchDecision;
use crate::error::{HostforgeError, Result};
use crate::inspect::DeploymentState;
use crate::io;
use crate::paths;
use crate::runlog::RunLog;
use crate::settings::KeySpec;
use crate::template::{self, Vars};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const MASK: &str = "********";
const GENERATED_SECRET_LEN: usize = 48;
const FILE_HEADER: &str = "\
# Managed by hostforge. Values may be edited; keys and comments are kept.
";

// ---------------------------------------------------------------------------
// ConfigEntry / ConfigArtifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Default,
    UserInput,
    ExistingFile,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub source: ValueSource,
    pub secret: bool,
}

impl ConfigEntry {
    /// The value for display: masked when secret and non-empty.
    pub fn display_value(&self) -> &str {
        if self.secret && !self.value.is_empty() {
            MASK
        } else {
            &self.value
        }
    }
}

impl std::fmt::Debug for ConfigEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEntry")
            .field("key", &self.key)
            .field("value", &self.display_value())
            .field("source", &self.source)
            .field("secret", &self.secret)
            .finish()
    }
}

impl std::fmt::Display for ConfigEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.display_value())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub entries: Vec<ConfigEntry>,
}

impl ConfigArtifact {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entry(key).map(|e| e.value.as_str())
    }

    /// Like [`ConfigArtifact::get`], treating an empty value as absent.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }

    pub fn entry(&self, key: &str) -> Option<&ConfigEntry> {
        self.entries.iter().find(|e| e.key == key)
    }

    /// All values as template variables.
    pub fn vars(&self) -> Vars {
        self.entries
            .iter()
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    /// Persisted artifact for `app`, with sources and secret flags from the
    /// sidecar (falling back to `schema` for the secret flag).
    pub fn load(root: &Path, app: &str, schema: &[KeySpec]) -> Result<Option<Self>> {
        let path = paths::config_artifact_path(root, app);
        if !path.exists() {
            return Ok(None);
        }
        let pairs = parse_env(&std::fs::read_to_string(&path)?);
        let meta = ConfigMeta::load(root, app)?;
        let entries = pairs
            .into_iter()
            .map(|(key, value)| {
                let recorded = meta.keys.get(&key);
                let secret = recorded.map(|m| m.secret).unwrap_or_else(|| {
                    schema.iter().any(|s| s.name == key && s.secret)
                });
                ConfigEntry {
                    source: recorded
                        .map(|m| m.source)
                        .unwrap_or(ValueSource::ExistingFile),
                    key,
                    value,
                    secret,
                }
            })
            .collect();
        Ok(Some(Self { entries }))
    }
}

// ---------------------------------------------------------------------------
// Sidecar
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMeta {
    pub source: ValueSource,
    pub secret: bool,
}

/// `<app>.meta.yaml`: per-key source and secret flag. Never holds values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMeta {
    #[serde(default)]
    pub keys: BTreeMap<String, KeyMeta>,
}

impl ConfigMeta {
    pub fn load(root: &Path, app: &str) -> Result<Self> {
        let path = paths::config_meta_path(root, app);
        if !path.exists() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(&std::fs::read_to_string(&path)?)?)
    }

    fn from_artifact(artifact: &ConfigArtifact, previous: &ConfigMeta) -> Self {
        let keys = artifact
            .entries
            .iter()
            .map(|e| {
                // A value carried over from the file keeps the source it was
                // first recorded with.
                let source = match (e.source, previous.keys.get(&e.key)) {
                    (ValueSource::ExistingFile, Some(prev)) => prev.source,
                    (source, _) => source,
                };
                (
                    e.key.clone(),
                    KeyMeta {
                        source,
                        secret: e.secret,
                    },
                )
            })
            .collect();
        Self { keys }
    }
}

// ---------------------------------------------------------------------------
// Env file helpers
// ---------------------------------------------------------------------------

/// Parse `KEY=VALUE` lines in order, skipping comments and blanks. Matching
/// surrounding double quotes are stripped.
pub fn parse_env(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim_start)
        .filter(|l| !l.starts_with('#') && !l.trim().is_empty())
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| {
            let v = v.trim_end();
            let v = v
                .strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(v);
            (k.trim().to_string(), v.to_string())
        })
        .collect()
}

/// Merge `KEY=VALUE` pairs into existing env content: known keys are updated
/// in place, new keys appended. Comments, blank lines and order are kept.
pub fn merge_env_pairs(existing: &str, pairs: &[(String, String)]) -> String {
    let mut lines: Vec<String> = existing.lines().map(str::to_string).collect();
    for (key, value) in pairs {
        let prefix = format!("{key}=");
        let found = lines.iter_mut().any(|line| {
            if line.trim_start().starts_with(&prefix) {
                *line = format!("{key}={value}");
                true
            } else {
                false
            }
        });
        if !found {
            lines.push(format!("{key}={value}"));
        }
    }
    let mut result = lines.join("\n");
    if !result.is_empty() && !result.ends_with('\n') {
        result.push('\n');
    }
    result
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Interactive input, implemented by the CLI on top of a terminal library.
pub trait Prompter {
    /// Ask for a plain value. `current` is offered as the default; `None`
    /// keeps it.
    fn input(&self, spec: &KeySpec, current: Option<&str>) -> Result<Option<String>>;
    /// Ask for a secret with masked input. `None` or empty keeps what exists.
    fn secret(&self, spec: &KeySpec, has_current: bool) -> Result<Option<String>>;
    fn confirm(&self, question: &str, default: bool) -> Result<bool>;
    /// Pick one of `options`; returns its index.
    fn choose(&self, question: &str, options: &[&str], default: usize) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnExisting {
    Reset,
    Continue,
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct SuppliedArgs {
    pub values: BTreeMap<String, String>,
    pub on_existing: Option<OnExisting>,
    pub on_mismatch: Option<MismatchDecision>,
}

impl SuppliedArgs {
    /// Parse `KEY=VALUE` strings as given to `--set`.
    pub fn parse_values<S: AsRef<str>>(items: &[S]) -> Result<BTreeMap<String, String>> {
        let mut values = BTreeMap::new();
        for item in items {
            let item = item.as_ref();
            let (k, v) = item.split_once('=').ok_or_else(|| {
                HostforgeError::Configuration(format!("expected KEY=VALUE, got '{item}'"))
            })?;
            let k = k.trim();
            if k.is_empty() || k.contains(char::is_whitespace) {
                return Err(HostforgeError::Configuration(format!("invalid key in '{item}'")));
            }
            values.insert(k.to_string(), v.to_string());
        }
        Ok(values)
    }
}

pub enum ConfigurationProvider {
    Interactive(Box<dyn Prompter>),
    NonInteractive(SuppliedArgs),
}

impl ConfigurationProvider {
    pub fn is_interactive(&self) -> bool {
        matches!(self, ConfigurationProvider::Interactive(_))
    }

    /// Branch on an existing install. Non-interactive runs default to
    /// continuing.
    pub fn decide_existing(&self, state: DeploymentState) -> Result<OnExisting> {
        match self {
            ConfigurationProvider::NonInteractive(args) => {
                Ok(args.on_existing.unwrap_or(OnExisting::Continue))
            }
            ConfigurationProvider::Interactive(p) => {
                let choice = p.choose(
                    &format!("An existing installation was found ({state}). How should provisioning proceed?"),
                    &["Reset and reinstall", "Continue anyway (risky)", "Abort"],
                    1,
                )?;
                Ok(match choice {
                    0 => OnExisting::Reset,
                    1 => OnExisting::Continue,
                    _ => OnExisting::Abort,
                })
            }
        }
    }

    /// Decide what to do when the domain does not resolve to this host.
    pub fn decide_mismatch(
        &self,
        domain: &str,
        detail: &str,
        policy: MismatchDecision,
    ) -> Result<MismatchDecision> {
        match self {
            ConfigurationProvider::NonInteractive(args) => Ok(args.on_mismatch.unwrap_or(policy)),
            ConfigurationProvider::Interactive(p) => {
                let options = [
                    MismatchDecision::SelfSigned,
                    MismatchDecision::ProceedAnyway,
                    MismatchDecision::Abort,
                ];
                let default = options.iter().position(|o| *o == policy).unwrap_or(0);
                let choice = p.choose(
                    &format!("{domain} does not point at this host ({detail}). What now?"),
                    &[
                        "Use a self-signed certificate",
                        "Request a certificate anyway",
                        "Abort",
                    ],
                    default,
                )?;
                Ok(options.get(choice).copied().unwrap_or(policy))
            }
        }
    }

    pub fn confirm(&self, question: &str, default: bool) -> Result<bool> {
        match self {
            ConfigurationProvider::NonInteractive(_) => Ok(default),
            ConfigurationProvider::Interactive(p) => p.confirm(question, default),
        }
    }
}

// ---------------------------------------------------------------------------
// Synthesis
// ---------------------------------------------------------------------------

/// Schema defaults with `{{app_dir}}`, `{{public_address}}` and
/// `{{instance_id}}` expanded from `identity_vars`.
pub fn build_defaults(schema: &[KeySpec], identity_vars: &Vars) -> BTreeMap<String, String> {
    schema
        .iter()
        .filter_map(|spec| {
            spec.default
                .as_ref()
                .map(|d| (spec.name.clone(), template::expand_known(d, identity_vars)))
        })
        .collect()
}

pub fn read_existing(root: &Path, app: &str) -> Result<Vec<(String, String)>> {
    let path = paths::config_artifact_path(root, app);
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(parse_env(&std::fs::read_to_string(&path)?))
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LEN)
        .map(char::from)
        .collect()
}

fn check_value(key: &str, value: &str) -> Result<()> {
    if value.contains('\n') || value.contains('\r') {
        return Err(HostforgeError::Configuration(format!(
            "value for {key} must be a single line"
        )));
    }
    Ok(())
}

pub fn synthesize(
    schema: &[KeySpec],
    defaults: &BTreeMap<String, String>,
    existing: &[(String, String)],
    provider: &ConfigurationProvider,
    force_defaults: bool,
) -> Result<ConfigArtifact> {
    let existing_map: BTreeMap<&str, &str> = existing
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let mut entries = Vec::new();
    let mut missing_required = Vec::new();

    for spec in schema {
        let key = spec.name.as_str();
        let mut current: Option<(String, ValueSource)> =
            match (existing_map.get(key), defaults.get(key)) {
                (Some(_), Some(d)) if force_defaults => Some((d.clone(), ValueSource::Default)),
                (Some(v), _) => Some((v.to_string(), ValueSource::ExistingFile)),
                (None, Some(d)) => Some((d.clone(), ValueSource::Default)),
                (None, None) => None,
            };

        match provider {
            ConfigurationProvider::NonInteractive(args) => {
                if let Some(v) = args.values.get(key) {
                    current = Some((v.clone(), ValueSource::UserInput));
                }
            }
            ConfigurationProvider::Interactive(prompter) => {
                let from_file = matches!(current, Some((_, ValueSource::ExistingFile)));
                if !from_file && !spec.generate {
                    let answer = if spec.secret {
                        prompter.secret(spec, current.is_some())?
                    } else {
                        prompter.input(spec, current.as_ref().map(|(v, _)| v.as_str()))?
                    };
                    if let Some(v) = answer.filter(|v| !v.is_empty()) {
                        let unchanged = current.as_ref().is_some_and(|(c, _)| *c == v);
                        if !unchanged {
                            current = Some((v, ValueSource::UserInput));
                        }
                    }
                }
            }
        }

        if current.is_none() && spec.generate {
            current = Some((generate_secret(), ValueSource::Default));
        }

        let (value, source) = match current {
            Some((v, s)) if !(spec.required && v.trim().is_empty()) => (v, s),
            _ if spec.required => {
                missing_required.push(key.to_string());
                continue;
            }
            _ => (String::new(), ValueSource::Default),
        };
        check_value(key, &value)?;
        entries.push(ConfigEntry {
            key: key.to_string(),
            value,
            source,
            secret: spec.secret,
        });
    }

    if !missing_required.is_empty() {
        let hint = if provider.is_interactive() {
            ""
        } else {
            " (supply with --set KEY=VALUE or run interactively)"
        };
        return Err(HostforgeError::Configuration(format!(
            "required key(s) without a value: {}{hint}",
            missing_required.join(", ")
        )));
    }

    // Keys the operator added by hand are carried through untouched.
    for (k, v) in existing {
        if !schema.iter().any(|s| s.name == *k) {
            entries.push(ConfigEntry {
                key: k.clone(),
                value: v.clone(),
                source: ValueSource::ExistingFile,
                secret: false,
            });
        }
    }
    if let ConfigurationProvider::NonInteractive(args) = provider {
        for (k, v) in &args.values {
            if entries.iter().all(|e| e.key != *k) {
                check_value(k, v)?;
                entries.push(ConfigEntry {
                    key: k.clone(),
                    value: v.clone(),
                    source: ValueSource::UserInput,
                    secret: false,
                });
            }
        }
    }

    Ok(ConfigArtifact { entries })
}

/// Log the source of every key. Values of secret keys never reach the log.
pub fn log_summary(log: &RunLog, artifact: &ConfigArtifact) {
    for e in &artifact.entries {
        log.info("config", format!("{e} ({:?})", e.source));
    }
}

/// Keys whose value differs from what is on disk.
pub fn changed_keys(root: &Path, app: &str, artifact: &ConfigArtifact) -> Result<Vec<String>> {
    let on_disk: BTreeMap<String, String> = read_existing(root, app)?.into_iter().collect();
    Ok(artifact
        .entries
        .iter()
        .filter(|e| on_disk.get(&e.key) != Some(&e.value))
        .map(|e| e.key.clone())
        .collect())
}

/// Write the artifact (mode 0600) and its sidecar. Only changed keys are
/// rewritten; nothing is written when nothing changed. Returns whether the
/// env file changed.
pub fn persist(root: &Path, app: &str, artifact: &ConfigArtifact) -> Result<bool> {
    let path = paths::config_artifact_path(root, app);
    let changed = changed_keys(root, app, artifact)?;
    let file_exists = path.exists();

    let wrote = if changed.is_empty() && file_exists {
        if io::mode_of(&path) != Some(0o600) {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }
        false
    } else {
        let base = if file_exists {
            std::fs::read_to_string(&path)?
        } else {
            FILE_HEADER.to_string()
        };
        let pairs: Vec<(String, String)> = artifact
            .entries
            .iter()
            .filter(|e| changed.contains(&e.key))
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect();
        let content = merge_env_pairs(&base, &pairs);
        io::atomic_write_with_mode(&path, content.as_bytes(), Some(0o600))?;
        true
    };

    let previous = ConfigMeta::load(root, app)?;
    let meta = ConfigMeta::from_artifact(artifact, &previous);
    if meta != previous || !paths::config_meta_path(root, app).exists() {
        let data = serde_yaml::to_string(&meta)?;
        io::atomic_write_with_mode(&paths::config_meta_path(root, app), data.as_bytes(), Some(0o600))?;
    }
    Ok(wrote)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::settings::default_config_keys;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;
    use tempfile::TempDir;

    /// Answers prompts from a script; an exhausted script keeps defaults.
    /// Clones share the script, so a test can keep a handle after boxing one.
    #[derive(Clone, Default)]
    pub(crate) struct ScriptedPrompter {
        pub answers: Rc<RefCell<VecDeque<Option<String>>>>,
        pub choices: Rc<RefCell<VecDeque<usize>>>,
        pub asked: Rc<RefCell<Vec<String>>>,
    }

    impl ScriptedPrompter {
        pub(crate) fn answering(answers: &[Option<&str>]) -> Self {
            let p = Self::default();
            p.answers
                .borrow_mut()
                .extend(answers.iter().map(|a| a.map(str::to_string)));
            p
        }

        pub(crate) fn asked(&self) -> Vec<String> {
            self.asked.borrow().clone()
        }
    }

    impl Prompter for ScriptedPrompter {
        fn input(&self, spec: &KeySpec, _current: Option<&str>) -> Result<Option<String>> {
            self.asked.borrow_mut().push(spec.name.clone());
            Ok(self.answers.borrow_mut().pop_front().flatten())
        }

        fn secret(&self, spec: &KeySpec, _has_current: bool) -> Result<Option<String>> {
            self.asked.borrow_mut().push(spec.name.clone());
            Ok(self.answers.borrow_mut().pop_front().flatten())
        }

        fn confirm(&self, _question: &str, default: bool) -> Result<bool> {
            Ok(default)
        }

        fn choose(&self, _question: &str, _options: &[&str], default: usize) -> Result<usize> {
            Ok(self.choices.borrow_mut().pop_front().unwrap_or(default))
        }
    }

    fn schema() -> Vec<KeySpec> {
        default_config_keys()
    }

    fn identity() -> Vars {
        [
            ("app_dir", "/opt/assistant"),
            ("public_address", "203.0.113.7"),
            ("instance_id", "i-0abc"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn non_interactive(pairs: &[(&str, &str)]) -> ConfigurationProvider {
        ConfigurationProvider::NonInteractive(SuppliedArgs {
            values: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..SuppliedArgs::default()
        })
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_expand_identity_placeholders() {
        let defaults = build_defaults(&schema(), &identity());
        assert_eq!(defaults["STATIC_DIR"], "/opt/assistant/static");
        assert_eq!(defaults["PUBLIC_HOST"], "203.0.113.7");
        assert!(!defaults.contains_key("AI_API_KEY"));
    }

    #[test]
    fn missing_required_secret_fails_non_interactive() {
        let defaults = build_defaults(&schema(), &identity());
        let err = synthesize(&schema(), &defaults, &[], &non_interactive(&[]), false).unwrap_err();
        assert!(matches!(err, HostforgeError::Configuration(_)));
        assert!(err.to_string().contains("AI_API_KEY"));
    }

    #[test]
    fn existing_beats_default_and_input_beats_existing() {
        let defaults = build_defaults(&schema(), &identity());
        let existing = pairs(&[("PORT", "9000"), ("AI_API_KEY", "sk-old"), ("HOST", "0.0.0.0")]);
        let artifact = synthesize(
            &schema(),
            &defaults,
            &existing,
            &non_interactive(&[("HOST", "127.0.0.2")]),
            false,
        )
        .unwrap();
        let port = artifact.entry("PORT").unwrap();
        assert_eq!(port.value, "9000");
        assert_eq!(port.source, ValueSource::ExistingFile);
        let host = artifact.entry("HOST").unwrap();
        assert_eq!(host.value, "127.0.0.2");
        assert_eq!(host.source, ValueSource::UserInput);
        assert_eq!(artifact.get("AI_API_KEY"), Some("sk-old"));
    }

    #[test]
    fn force_defaults_overrides_existing_but_not_secrets_without_default() {
        let defaults = build_defaults(&schema(), &identity());
        let existing = pairs(&[("PORT", "9000"), ("AI_API_KEY", "sk-old")]);
        let artifact =
            synthesize(&schema(), &defaults, &existing, &non_interactive(&[]), true).unwrap();
        assert_eq!(artifact.get("PORT"), Some("8000"));
        assert_eq!(artifact.entry("PORT").unwrap().source, ValueSource::Default);
        assert_eq!(artifact.get("AI_API_KEY"), Some("sk-old"));
    }

    #[test]
    fn generated_secret_is_preserved_once_written() {
        let dir = TempDir::new().unwrap();
        let defaults = build_defaults(&schema(), &identity());
        let provider = non_interactive(&[("AI_API_KEY", "sk-1")]);
        let first = synthesize(&schema(), &defaults, &[], &provider, false).unwrap();
        let secret = first.get("SESSION_SECRET").unwrap().to_string();
        assert_eq!(secret.len(), GENERATED_SECRET_LEN);
        persist(dir.path(), "assistant", &first).unwrap();

        let existing = read_existing(dir.path(), "assistant").unwrap();
        let second = synthesize(&schema(), &defaults, &existing, &provider, false).unwrap();
        assert_eq!(second.get("SESSION_SECRET"), Some(secret.as_str()));
    }

    #[test]
    fn interactive_prompts_only_for_keys_without_file_values() {
        let defaults = build_defaults(&schema(), &identity());
        let existing = pairs(&[("AI_API_KEY", "sk-old"), ("HOST", "127.0.0.1")]);
        let prompter = ScriptedPrompter::default();
        let provider = ConfigurationProvider::Interactive(Box::new(prompter.clone()));
        let artifact = synthesize(&schema(), &defaults, &existing, &provider, false).unwrap();
        assert_eq!(artifact.get("AI_API_KEY"), Some("sk-old"));

        let asked = prompter.asked();
        assert!(!asked.contains(&"AI_API_KEY".to_string()));
        assert!(!asked.contains(&"HOST".to_string()));
        assert!(!asked.contains(&"SESSION_SECRET".to_string()));
        assert!(asked.contains(&"PORT".to_string()));
    }

    #[test]
    fn interactive_input_marks_user_source() {
        let defaults = build_defaults(&schema(), &identity());
        // Prompt order follows the schema: HOST, PORT, STATIC_DIR, PUBLIC_HOST,
        // DOMAIN, CERT_EMAIL, AI_API_KEY, ...
        let prompter = ScriptedPrompter::answering(&[
            None,
            Some("8001"),
            None,
            None,
            None,
            None,
            Some("sk-typed"),
        ]);
        let provider = ConfigurationProvider::Interactive(Box::new(prompter));
        let artifact = synthesize(&schema(), &defaults, &[], &provider, false).unwrap();
        assert_eq!(artifact.entry("PORT").unwrap().source, ValueSource::UserInput);
        assert_eq!(artifact.entry("HOST").unwrap().source, ValueSource::Default);
        let key = artifact.entry("AI_API_KEY").unwrap();
        assert_eq!(key.value, "sk-typed");
        assert_eq!(key.source, ValueSource::UserInput);
    }

    #[test]
    fn secrets_are_masked_in_debug_and_display() {
        let entry = ConfigEntry {
            key: "AI_API_KEY".to_string(),
            value: "sk-live-123".to_string(),
            source: ValueSource::UserInput,
            secret: true,
        };
        assert_eq!(entry.to_string(), "AI_API_KEY=********");
        assert!(!format!("{entry:?}").contains("sk-live-123"));
    }

    #[test]
    fn persist_writes_0600_and_skips_when_unchanged() {
        let dir = TempDir::new().unwrap();
        let defaults = build_defaults(&schema(), &identity());
        let provider = non_interactive(&[("AI_API_KEY", "sk-1")]);
        let artifact = synthesize(&schema(), &defaults, &[], &provider, false).unwrap();

        assert!(persist(dir.path(), "assistant", &artifact).unwrap());
        let path = paths::config_artifact_path(dir.path(), "assistant");
        assert_eq!(io::mode_of(&path), Some(0o600));
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();

        assert!(!persist(dir.path(), "assistant", &artifact).unwrap());
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);

        let meta = std::fs::read_to_string(paths::config_meta_path(dir.path(), "assistant")).unwrap();
        assert!(meta.contains("AI_API_KEY"));
        assert!(!meta.contains("sk-1"));
    }

    #[test]
    fn persist_rewrites_only_changed_keys_and_keeps_comments() {
        let dir = TempDir::new().unwrap();
        let path = paths::config_artifact_path(dir.path(), "assistant");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "# operator notes\nPORT=8000\nEXTRA=keep\nAI_API_KEY=sk-1\n").unwrap();

        let existing = read_existing(dir.path(), "assistant").unwrap();
        let defaults = build_defaults(&schema(), &identity());
        let artifact = synthesize(
            &schema(),
            &defaults,
            &existing,
            &non_interactive(&[("PORT", "8100")]),
            false,
        )
        .unwrap();
        persist(dir.path(), "assistant", &artifact).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], "# operator notes");
        assert_eq!(lines[1], "PORT=8100");
        assert_eq!(lines[2], "EXTRA=keep");
        assert_eq!(lines[3], "AI_API_KEY=sk-1");
    }

    #[test]
    fn load_reports_recorded_sources() {
        let dir = TempDir::new().unwrap();
        let defaults = build_defaults(&schema(), &identity());
        let artifact = synthesize(
            &schema(),
            &defaults,
            &[],
            &non_interactive(&[("AI_API_KEY", "sk-1")]),
            false,
        )
        .unwrap();
        persist(dir.path(), "assistant", &artifact).unwrap();

        let loaded = ConfigArtifact::load(dir.path(), "assistant", &schema())
            .unwrap()
            .unwrap();
        let key = loaded.entry("AI_API_KEY").unwrap();
        assert!(key.secret);
        assert_eq!(key.source, ValueSource::UserInput);
        assert_eq!(loaded.entry("PORT").unwrap().source, ValueSource::Default);
    }

    #[test]
    fn parse_values_rejects_missing_equals() {
        assert!(SuppliedArgs::parse_values(&["NOEQUALS"]).is_err());
        let values = SuppliedArgs::parse_values(&["A=1", "B=x=y"]).unwrap();
        assert_eq!(values["B"], "x=y");
    }

    #[test]
    fn non_interactive_existing_defaults_to_continue() {
        let provider = non_interactive(&[]);
        assert_eq!(
            provider.decide_existing(DeploymentState::Partial).unwrap(),
            OnExisting::Continue
        );
    }
}
