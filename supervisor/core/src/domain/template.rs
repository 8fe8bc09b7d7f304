// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Environment Template DSL
//!
//! Service `env_template` values, `args` and `command` health argv may embed
//! references in double braces. Templates are handled in two passes: [`Template::parse`]
//! tokenises the string and rejects anything it does not understand, and
//! [`Template::render`] substitutes concrete values. A reference that has no
//! value at render time is an error, never an empty substitution.
//!
//! # Supported References
//!
//! - `{{port.self}}` / `{{port.self.<name>}}` - own allocated port (first declared when unnamed)
//! - `{{port.<id>}}` / `{{port.<id>.<name>}}` - port of a dependency service
//! - `{{secret.<name>}}` - materialised secret declared on the owning service
//! - `{{data_dir}}` - `<app_data>/data/<service-id>`
//! - `{{bundle_root}}`, `{{app_data}}` - session roots

use crate::domain::ports::AllocatedPorts;
use crate::domain::secrets::SecretValues;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;
use regex::Regex;
use thiserror::Error;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("token pattern is valid")
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("malformed template '{template}': {reason}")]
    Malformed { template: String, reason: String },

    #[error("unknown reference '{token}'")]
    UnknownReference { token: String },

    #[error("reference '{token}' does not name a declared {what}")]
    Undeclared { token: String, what: &'static str },

    #[error("reference '{token}' points at service '{service}', which is not a dependency")]
    NotADependency { token: String, service: String },

    #[error("reference '{token}' has no value at launch time")]
    Unresolved { token: String },
}

/// Which service a port reference belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortOwner {
    SelfService,
    Service(String),
}

/// A single `{{...}}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TemplateRef {
    Port { owner: PortOwner, name: Option<String> },
    Secret(String),
    DataDir,
    BundleRoot,
    AppData,
}

impl TemplateRef {
    fn parse(token: &str) -> Result<Self, TemplateError> {
        let unknown = || TemplateError::UnknownReference { token: token.to_string() };
        match token {
            "data_dir" => return Ok(Self::DataDir),
            "bundle_root" => return Ok(Self::BundleRoot),
            "app_data" => return Ok(Self::AppData),
            _ => {}
        }

        if let Some(rest) = token.strip_prefix("secret.") {
            if rest.is_empty() {
                return Err(unknown());
            }
            return Ok(Self::Secret(rest.to_string()));
        }

        if let Some(rest) = token.strip_prefix("port.") {
            let mut parts = rest.split('.');
            let owner = match parts.next() {
                Some("self") => PortOwner::SelfService,
                Some(id) if !id.is_empty() => PortOwner::Service(id.to_string()),
                _ => return Err(unknown()),
            };
            let name = match parts.next() {
                Some(name) if !name.is_empty() => Some(name.to_string()),
                Some(_) => return Err(unknown()),
                None => None,
            };
            if parts.next().is_some() {
                return Err(unknown());
            }
            return Ok(Self::Port { owner, name });
        }

        Err(unknown())
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port { owner, name } => {
                let owner = match owner {
                    PortOwner::SelfService => "self",
                    PortOwner::Service(id) => id.as_str(),
                };
                match name {
                    Some(name) => write!(f, "port.{owner}.{name}"),
                    None => write!(f, "port.{owner}"),
                }
            }
            Self::Secret(name) => write!(f, "secret.{name}"),
            Self::DataDir => f.write_str("data_dir"),
            Self::BundleRoot => f.write_str("bundle_root"),
            Self::AppData => f.write_str("app_data"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Ref(TemplateRef),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

/// Values available while rendering one service's templates.
pub struct TemplateContext<'a> {
    pub service_id: &'a str,
    /// Allocated ports of every service launched so far, keyed by service id.
    pub ports: &'a BTreeMap<String, AllocatedPorts>,
    pub secrets: &'a SecretValues,
    pub data_dir: &'a Path,
    pub bundle_root: &'a Path,
    pub app_data: &'a Path,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut cursor = 0;

        for captures in TOKEN.captures_iter(source) {
            let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            push_literal(&mut segments, source, &source[cursor..whole.start()])?;
            segments.push(Segment::Ref(TemplateRef::parse(inner.as_str())?));
            cursor = whole.end();
        }
        push_literal(&mut segments, source, &source[cursor..])?;

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn references(&self) -> impl Iterator<Item = &TemplateRef> {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Ref(reference) => Some(reference),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ref(reference) => out.push_str(&resolve(reference, ctx)?),
            }
        }
        Ok(out)
    }
}

fn push_literal(segments: &mut Vec<Segment>, source: &str, text: &str) -> Result<(), TemplateError> {
    if text.contains("{{") || text.contains("}}") {
        return Err(TemplateError::Malformed {
            template: source.to_string(),
            reason: "unbalanced '{{' or '}}'".to_string(),
        });
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_string()));
    }
    Ok(())
}

fn resolve(reference: &TemplateRef, ctx: &TemplateContext<'_>) -> Result<String, TemplateError> {
    let unresolved = || TemplateError::Unresolved { token: reference.to_string() };
    match reference {
        TemplateRef::Port { owner, name } => {
            let owner_id = match owner {
                PortOwner::SelfService => ctx.service_id,
                PortOwner::Service(id) => id.as_str(),
            };
            let ports = ctx.ports.get(owner_id).ok_or_else(unresolved)?;
            let port = match name {
                Some(name) => ports.get(name),
                None => ports.primary(),
            };
            port.map(|p| p.to_string()).ok_or_else(unresolved)
        }
        TemplateRef::Secret(name) => ctx
            .secrets
            .get(name)
            .map(|value| value.expose().to_string())
            .ok_or_else(unresolved),
        TemplateRef::DataDir => Ok(ctx.data_dir.display().to_string()),
        TemplateRef::BundleRoot => Ok(ctx.bundle_root.display().to_string()),
        TemplateRef::AppData => Ok(ctx.app_data.display().to_string()),
    }
}

/// Render every value of a name → template map.
pub fn render_map(
    templates: &BTreeMap<String, String>,
    ctx: &TemplateContext<'_>,
) -> Result<BTreeMap<String, String>, TemplateError> {
    templates
        .iter()
        .map(|(key, value)| Ok((key.clone(), Template::parse(value)?.render(ctx)?)))
        .collect()
}

/// Render a list of templates (args, probe argv).
pub fn render_list(templates: &[String], ctx: &TemplateContext<'_>) -> Result<Vec<String>, TemplateError> {
    templates
        .iter()
        .map(|value| Template::parse(value)?.render(ctx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::secrets::SecretValue;
    use std::path::PathBuf;

    fn ports() -> BTreeMap<String, AllocatedPorts> {
        let mut map = BTreeMap::new();
        map.insert(
            "db".to_string(),
            AllocatedPorts::from_pairs([("main", 40001), ("admin", 40002)]),
        );
        map.insert("api".to_string(), AllocatedPorts::from_pairs([("http", 18000)]));
        map
    }

    #[test]
    fn test_parse_collects_references() {
        let template = Template::parse("postgres://localhost:{{port.db.main}}/{{ secret.DB_NAME }}").unwrap();
        let refs: Vec<String> = template.references().map(|r| r.to_string()).collect();
        assert_eq!(refs, vec!["port.db.main", "secret.DB_NAME"]);
    }

    #[test]
    fn test_parse_rejects_unknown_namespace() {
        let err = Template::parse("{{env.HOME}}").unwrap_err();
        assert_eq!(err, TemplateError::UnknownReference { token: "env.HOME".to_string() });
        assert!(Template::parse("{{port.}}").is_err());
        assert!(Template::parse("{{port.db.main.extra}}").is_err());
    }

    #[test]
    fn test_parse_rejects_unbalanced_braces() {
        assert!(matches!(Template::parse("{{port.self"), Err(TemplateError::Malformed { .. })));
        assert!(matches!(Template::parse("value}}"), Err(TemplateError::Malformed { .. })));
    }

    #[test]
    fn test_render_substitutes_all_namespaces() {
        let ports = ports();
        let mut secrets = SecretValues::default();
        secrets.insert("DB_NAME", SecretValue::new("app"));
        let data_dir = PathBuf::from("/data/api");
        let ctx = TemplateContext {
            service_id: "api",
            ports: &ports,
            secrets: &secrets,
            data_dir: &data_dir,
            bundle_root: Path::new("/bundle"),
            app_data: Path::new("/appdata"),
        };

        let rendered = Template::parse("{{port.db}}:{{port.db.admin}}:{{port.self}}:{{port.self.http}}")
            .unwrap()
            .render(&ctx)
            .unwrap();
        assert_eq!(rendered, "40001:40002:18000:18000");

        let rendered = Template::parse("{{secret.DB_NAME}}@{{data_dir}} {{bundle_root}} {{app_data}}")
            .unwrap()
            .render(&ctx)
            .unwrap();
        assert_eq!(rendered, "app@/data/api /bundle /appdata");
    }

    #[test]
    fn test_render_fails_on_unresolved_reference() {
        let ports = ports();
        let secrets = SecretValues::default();
        let ctx = TemplateContext {
            service_id: "ui",
            ports: &ports,
            secrets: &secrets,
            data_dir: Path::new("/data/ui"),
            bundle_root: Path::new("/bundle"),
            app_data: Path::new("/appdata"),
        };

        let err = Template::parse("{{port.self}}").unwrap().render(&ctx).unwrap_err();
        assert_eq!(err, TemplateError::Unresolved { token: "port.self".to_string() });

        let err = Template::parse("{{secret.TOKEN}}").unwrap().render(&ctx).unwrap_err();
        assert_eq!(err, TemplateError::Unresolved { token: "secret.TOKEN".to_string() });
    }
}
