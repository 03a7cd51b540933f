use crate::error::{HostforgeError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants (relative to the target root)
// ---------------------------------------------------------------------------

pub const ETC_DIR: &str = "etc/hostforge";
pub const TMP_DIR: &str = "var/lib/hostforge/tmp";
pub const APPS_DIR: &str = "opt";
pub const UNITS_DIR: &str = "etc/systemd/system";
pub const SITES_AVAILABLE_DIR: &str = "etc/nginx/sites-available";
pub const SITES_ENABLED_DIR: &str = "etc/nginx/sites-enabled";
pub const CRON_DIR: &str = "etc/cron.d";
pub const TLS_DIR: &str = "etc/hostforge/tls";
pub const WEBROOT_DIR: &str = "var/www";

pub const SETTINGS_FILE: &str = "etc/hostforge/hostforge.yaml";
pub const LOCK_FILE: &str = "var/lib/hostforge/run.lock";
pub const LOG_FILE: &str = "var/lib/hostforge/run.log";
pub const REPORT_MD: &str = "var/lib/hostforge/report.md";
pub const REPORT_JSON: &str = "var/lib/hostforge/report.json";
pub const VERSIONS_FILE: &str = "var/lib/hostforge/versions.yaml";
pub const CERT_RECORD_FILE: &str = "var/lib/hostforge/cert.yaml";
pub const DEFAULT_SITE_BACKUP: &str = "var/lib/hostforge/nginx-default.bak";
pub const DEFAULT_SITE_LINK_BACKUP: &str = "var/lib/hostforge/nginx-default.link";
pub const DEFAULT_SITE: &str = "etc/nginx/sites-enabled/default";

pub const FULLCHAIN_PEM: &str = "fullchain.pem";
pub const PRIVKEY_PEM: &str = "privkey.pem";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn settings_path(root: &Path) -> PathBuf {
    root.join(SETTINGS_FILE)
}

pub fn tmp_dir(root: &Path) -> PathBuf {
    root.join(TMP_DIR)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub fn log_path(root: &Path) -> PathBuf {
    root.join(LOG_FILE)
}

pub fn report_md_path(root: &Path) -> PathBuf {
    root.join(REPORT_MD)
}

pub fn report_json_path(root: &Path) -> PathBuf {
    root.join(REPORT_JSON)
}

pub fn versions_path(root: &Path) -> PathBuf {
    root.join(VERSIONS_FILE)
}

pub fn cert_record_path(root: &Path) -> PathBuf {
    root.join(CERT_RECORD_FILE)
}

pub fn config_artifact_path(root: &Path, app: &str) -> PathBuf {
    root.join(ETC_DIR).join(format!("{app}.env"))
}

pub fn config_meta_path(root: &Path, app: &str) -> PathBuf {
    root.join(ETC_DIR).join(format!("{app}.meta.yaml"))
}

pub fn app_dir(root: &Path, app: &str) -> PathBuf {
    root.join(APPS_DIR).join(app)
}

pub fn unit_path(root: &Path, service: &str) -> PathBuf {
    root.join(UNITS_DIR).join(format!("{service}.service"))
}

pub fn site_available_path(root: &Path, site: &str) -> PathBuf {
    root.join(SITES_AVAILABLE_DIR).join(site)
}

pub fn site_enabled_path(root: &Path, site: &str) -> PathBuf {
    root.join(SITES_ENABLED_DIR).join(site)
}

pub fn default_site_path(root: &Path) -> PathBuf {
    root.join(DEFAULT_SITE)
}

pub fn default_site_backup_path(root: &Path) -> PathBuf {
    root.join(DEFAULT_SITE_BACKUP)
}

/// Target of the stock default site when it was a symlink.
pub fn default_site_link_backup_path(root: &Path) -> PathBuf {
    root.join(DEFAULT_SITE_LINK_BACKUP)
}

pub fn tls_dir(root: &Path) -> PathBuf {
    root.join(TLS_DIR)
}

pub fn cron_path(root: &Path, app: &str) -> PathBuf {
    root.join(CRON_DIR).join(format!("{app}-cert-renew"))
}

pub fn acme_webroot(root: &Path, app: &str) -> PathBuf {
    root.join(WEBROOT_DIR).join(format!("{app}-acme"))
}

/// Directory certbot writes the live chain for `domain` into.
pub fn acme_live_dir(root: &Path, domain: &str) -> PathBuf {
    root.join("etc/letsencrypt/live").join(domain)
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^[a-z_][a-z0-9_\-]*$").unwrap())
}

/// App, user and site names end up in paths, unit names and `useradd`
/// arguments, so they are restricted to a POSIX-portable subset.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 32 || !name_re().is_match(name) {
        return Err(HostforgeError::Configuration(format!(
            "invalid name '{name}': must be lowercase alphanumeric, '-' or '_', at most 32 chars"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["assistant", "a", "my-app_2", "_svc"] {
            validate_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_names() {
        for name in ["", "-dash", "UPPER", "has space", "a/b", "x".repeat(33).as_str()] {
            assert!(validate_name(name).is_err(), "expected invalid: {name}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/host");
        assert_eq!(
            config_artifact_path(root, "assistant"),
            PathBuf::from("/tmp/host/etc/hostforge/assistant.env")
        );
        assert_eq!(
            unit_path(root, "assistant"),
            PathBuf::from("/tmp/host/etc/systemd/system/assistant.service")
        );
        assert_eq!(
            site_enabled_path(root, "assistant"),
            PathBuf::from("/tmp/host/etc/nginx/sites-enabled/assistant")
        );
        assert_eq!(
            cron_path(root, "assistant"),
            PathBuf::from("/tmp/host/etc/cron.d/assistant-cert-renew")
        );
    }
}
