//! Explicit validation of a parsed configuration.
//!
//! Every problem is collected into a human-readable list so an operator sees
//! all of them at once; any problem aborts startup.

use std::collections::HashSet;

use regex::Regex;

use crate::command::CommandDescriptor;
use crate::command::CommandEntrypoint;
use crate::command::normalize_method;

use super::Configuration;

/// Names a resource may use, anchored on both sides by the validator.
pub const RESOURCE_NAME_PATTERN: &str = "[a-zA-Z][a-zA-Z0-9_-]*";

const VERSION_PATTERN: &str = r"^[v]?(\d+\.)?(\d+\.)?(\*|\d+)$";

pub struct Validator {
    version_re: Regex,
    resource_re: Regex,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    pub fn new() -> Self {
        Self {
            version_re: Regex::new(VERSION_PATTERN).expect("version pattern"),
            resource_re: Regex::new(&format!("^{RESOURCE_NAME_PATTERN}$"))
                .expect("resource name pattern"),
        }
    }

    /// Check the configuration, returning one description per problem.
    pub fn validate(&self, configuration: &Configuration) -> Vec<String> {
        let mut problems = Vec::new();

        if let Some(version) = configuration.version.as_deref() {
            if !self.version_re.is_match(version) {
                problems.push(format!("version `{version}` does not match {VERSION_PATTERN}"));
            }
        }

        if let Some(format) = configuration.settings_format.as_deref() {
            check_settings_format(format, "settings-format", &mut problems);
        }

        if let Some(main) = configuration.main.as_ref() {
            self.check_entrypoint("main-resource", main, &mut problems);
        }
        if let Some(resources) = configuration.resources.as_ref() {
            for (name, entrypoint) in resources {
                if !self.resource_re.is_match(name) {
                    problems.push(format!(
                        "resource name `{name}` does not match {RESOURCE_NAME_PATTERN}"
                    ));
                }
                self.check_entrypoint(name, entrypoint, &mut problems);
            }
        }

        problems
    }

    fn check_entrypoint(
        &self,
        name: &str,
        entrypoint: &CommandEntrypoint,
        problems: &mut Vec<String>,
    ) {
        if let Some(default) = entrypoint.default.as_ref() {
            check_descriptor(name, "default", default, problems);
        }
        if let Some(methods) = entrypoint.methods.as_ref() {
            let mut seen = HashSet::new();
            for (method, descriptor) in methods {
                match normalize_method(method) {
                    None => problems.push(format!(
                        "resource `{name}` declares unsupported method `{method}`"
                    )),
                    Some(canonical) => {
                        if !seen.insert(canonical.clone()) {
                            problems.push(format!(
                                "resource `{name}` declares method `{canonical}` more than once"
                            ));
                        }
                    }
                }
                check_descriptor(name, method, descriptor, problems);
            }
        }
        if let Some(format) = entrypoint.settings_format.as_deref() {
            check_settings_format(format, &format!("resource `{name}` settings-format"), problems);
        }
        if let Some(pattern) = entrypoint.pattern.as_deref() {
            if !pattern.starts_with('/') {
                problems.push(format!(
                    "resource `{name}` pattern `{pattern}` must start with `/`"
                ));
            }
        }
    }
}

fn check_descriptor(
    resource: &str,
    slot: &str,
    descriptor: &CommandDescriptor,
    problems: &mut Vec<String>,
) {
    if descriptor.command.trim().is_empty() {
        problems.push(format!("resource `{resource}` ({slot}) has an empty command"));
    }
    if descriptor.timeout < 0.0 {
        problems.push(format!(
            "resource `{resource}` ({slot}) has a negative timeout {}",
            descriptor.timeout
        ));
    }
}

fn check_settings_format(format: &str, location: &str, problems: &mut Vec<String>) {
    if format != "json" && format != "flat" {
        problems.push(format!(
            "{location} must be `json` or `flat`, got `{format}`"
        ));
    }
}
