//! Pure rendering of the files the host reads: supervisor unit and proxy
//! site. Nothing here touches the filesystem.
//!
//! Placeholders are `{{name}}`. Rendering fails on any placeholder without a
//! value, so a half-filled file never reaches the host.

use crate::error::{HostforgeError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

pub type Vars = BTreeMap<String, String>;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").unwrap())
}

pub fn render(template: &str, vars: &Vars) -> Result<String> {
    let mut missing = Vec::new();
    let out = placeholder_re().replace_all(template, |caps: &regex::Captures<'_>| {
        let key = &caps[1];
        match vars.get(key) {
            Some(v) => v.clone(),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        missing.sort();
        missing.dedup();
        return Err(HostforgeError::Template(format!(
            "no value for {}",
            missing.join(", ")
        )));
    }
    Ok(out.into_owned())
}

/// Expand placeholders that have a value and leave the rest untouched.
/// Used for schema defaults, which may reference host identity.
pub fn expand_known(template: &str, vars: &Vars) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            vars.get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

pub const UNIT_TEMPLATE: &str = "\
[Unit]
Description={{app}} application
After=network-online.target
Wants=network-online.target

[Service]
Type=simple
User={{user}}
Group={{user}}
WorkingDirectory={{app_dir}}
EnvironmentFile={{env_file}}
ExecStart={{start_command}}
Restart=on-failure
RestartSec=3

[Install]
WantedBy=multi-user.target
";

/// HTTP-only site: serves the app and the ACME challenge webroot. Used until
/// a certificate exists.
pub const SITE_HTTP_TEMPLATE: &str = "\
server {
    listen {{listen_port}} default_server;
    listen [::]:{{listen_port}} default_server;
    server_name {{server_name}};

    location /.well-known/acme-challenge/ {
        root {{acme_webroot}};
    }

    location /static/ {
        alias {{STATIC_DIR}}/;
    }

    location / {
        proxy_pass http://{{HOST}}:{{PORT}};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection \"upgrade\";
        proxy_set_header Host $host;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }
}
";

/// HTTPS site with a plain-HTTP redirect that keeps the ACME webroot
/// reachable for renewals.
pub const SITE_TLS_TEMPLATE: &str = "\
server {
    listen {{listen_port}} default_server;
    listen [::]:{{listen_port}} default_server;
    server_name {{server_name}};

    location /.well-known/acme-challenge/ {
        root {{acme_webroot}};
    }

    location / {
        return 301 https://$host$request_uri;
    }
}

server {
    listen {{tls_port}} ssl default_server;
    listen [::]:{{tls_port}} ssl default_server;
    server_name {{server_name}};

    ssl_certificate {{cert_path}};
    ssl_certificate_key {{key_path}};
    ssl_protocols TLSv1.2 TLSv1.3;

    location /static/ {
        alias {{STATIC_DIR}}/;
    }

    location / {
        proxy_pass http://{{HOST}}:{{PORT}};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection \"upgrade\";
        proxy_set_header Host $host;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto https;
    }
}
";

pub fn render_unit(vars: &Vars) -> Result<String> {
    render(UNIT_TEMPLATE, vars)
}

/// Render the proxy site; the TLS variant is chosen when `cert_path` is set.
pub fn render_site(vars: &Vars) -> Result<String> {
    if vars.contains_key("cert_path") {
        render(SITE_TLS_TEMPLATE, vars)
    } else {
        render(SITE_HTTP_TEMPLATE, vars)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
