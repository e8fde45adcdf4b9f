//! Request routing table.
//!
//! Resolution order: control endpoints, generic exec URLs (configured base
//! plus the deprecated `/run` alias), resource URL patterns, static mounts
//! (longest prefix first). Built once at startup and read-only afterwards.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;

use regex::Regex;

use crate::command::CommandEntrypoint;
use crate::command::MAIN_RESOURCE;
use crate::config::Configuration;
use crate::config::RESOURCE_NAME_PATTERN;
use crate::error::AgentErr;

pub const HEALTH_URL: &str = "/_/health";
pub const LOCK_URL: &str = "/_/lock";
pub const UNLOCK_URL: &str = "/_/unlock";
pub const EXEC_BASEURL: &str = "/$";
pub const EXEC_BASEURL_DEPRECATED: &str = "/run";

#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Health,
    Lock,
    Unlock,
    /// Generic exec URL; `None` selects the main resource.
    Exec { resource: Option<String> },
    /// Resource URL pattern with its captured path variables.
    Pattern {
        resource: String,
        params: BTreeMap<String, String>,
    },
    Static { root: PathBuf, rest: String },
}

#[derive(Debug)]
pub struct Router {
    exec_bases: Vec<String>,
    patterns: Vec<PatternRoute>,
    statics: Vec<(String, PathBuf)>,
    resource_re: Regex,
}

#[derive(Debug)]
struct PatternRoute {
    resource: String,
    segments: Vec<Segment>,
}

#[derive(Debug, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

impl Router {
    pub fn new(
        conf: &Configuration,
        static_mounts: &HashMap<String, PathBuf>,
    ) -> Result<Self, AgentErr> {
        let mut exec_bases = vec![exec_base(conf)];
        if !exec_bases.contains(&EXEC_BASEURL_DEPRECATED.to_string()) {
            exec_bases.push(EXEC_BASEURL_DEPRECATED.to_string());
        }

        validate_patterns(conf)?;
        let mut patterns = Vec::new();
        if let Some(main) = conf.main.as_ref() {
            push_pattern(&mut patterns, MAIN_RESOURCE, main);
        }
        if let Some(resources) = conf.resources.as_ref() {
            for (name, entrypoint) in resources {
                push_pattern(&mut patterns, name, entrypoint);
            }
        }

        let mut statics: Vec<(String, PathBuf)> = static_mounts
            .iter()
            .map(|(prefix, dir)| (prefix.clone(), dir.clone()))
            .collect();
        // Longest prefix first so the most specific mount wins.
        statics.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then(a.0.cmp(&b.0)));

        Ok(Self {
            exec_bases,
            patterns,
            statics,
            resource_re: Regex::new(&format!("^{RESOURCE_NAME_PATTERN}$"))
                .expect("resource name pattern"),
        })
    }

    pub fn resolve(&self, path: &str) -> Option<Route> {
        match path {
            HEALTH_URL => return Some(Route::Health),
            LOCK_URL => return Some(Route::Lock),
            UNLOCK_URL => return Some(Route::Unlock),
            _ => {}
        }

        for base in &self.exec_bases {
            if (!base.is_empty() && path == base.as_str()) || path == format!("{base}/") {
                return Some(Route::Exec { resource: None });
            }
            if let Some(rest) = path.strip_prefix(&format!("{base}/")) {
                if self.resource_re.is_match(rest) {
                    return Some(Route::Exec {
                        resource: Some(rest.to_string()),
                    });
                }
            }
        }

        for pattern in &self.patterns {
            if let Some(params) = pattern.matches(path) {
                return Some(Route::Pattern {
                    resource: pattern.resource.clone(),
                    params,
                });
            }
        }

        for (prefix, root) in &self.statics {
            if let Some(rest) = path.strip_prefix(prefix.as_str()) {
                return Some(Route::Static {
                    root: root.clone(),
                    rest: rest.to_string(),
                });
            }
        }
        None
    }
}

impl PatternRoute {
    fn compile(resource: &str, pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .skip(1)
            .map(|segment| {
                if segment.len() >= 2 && segment.starts_with('{') && segment.ends_with('}') {
                    Segment::Param(segment[1..segment.len() - 1].to_string())
                } else {
                    Segment::Literal(segment.to_string())
                }
            })
            .collect();
        Self {
            resource: resource.to_string(),
            segments,
        }
    }

    fn matches(&self, path: &str) -> Option<BTreeMap<String, String>> {
        if !path.starts_with('/') {
            return None;
        }
        let given: Vec<&str> = path.split('/').skip(1).collect();
        if given.len() != self.segments.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        for (segment, value) in self.segments.iter().zip(given) {
            match segment {
                Segment::Literal(expected) if expected == value => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(params)
    }
}

fn push_pattern(patterns: &mut Vec<PatternRoute>, resource: &str, entrypoint: &CommandEntrypoint) {
    if let Some(pattern) = entrypoint.pattern.as_deref() {
        if !pattern.is_empty() {
            patterns.push(PatternRoute::compile(resource, pattern));
        }
    }
}

fn exec_base(conf: &Configuration) -> String {
    let base = conf
        .http_server
        .as_ref()
        .and_then(|http| http.baseurl.as_deref())
        .unwrap_or(EXEC_BASEURL);
    if base == "/" {
        String::new()
    } else {
        base.to_string()
    }
}

/// URL patterns must be globally unique once `{…}` segments are wildcarded;
/// duplicates abort startup.
fn validate_patterns(conf: &Configuration) -> Result<(), AgentErr> {
    let wildcard = Regex::new(r"\{[^{}]*\}").expect("wildcard pattern");
    let mut normalized: HashMap<String, Vec<String>> = HashMap::new();

    let mut record = |entrypoint: &CommandEntrypoint| {
        if let Some(pattern) = entrypoint.pattern.as_deref() {
            let key = wildcard.replace_all(pattern, "*").into_owned();
            normalized.entry(key).or_default().push(pattern.to_string());
        }
    };
    if let Some(main) = conf.main.as_ref() {
        record(main);
    }
    if let Some(resources) = conf.resources.as_ref() {
        for entrypoint in resources.values() {
            record(entrypoint);
        }
    }

    let mut duplicated: Vec<String> = normalized
        .into_values()
        .filter(|originals| originals.len() > 1)
        .map(|originals| originals.join(", "))
        .collect();
    if duplicated.is_empty() {
        return Ok(());
    }
    duplicated.sort();
    Err(AgentErr::Config(format!(
        "command url patterns are duplicated: {}",
        duplicated.join("; ")
    )))
}
