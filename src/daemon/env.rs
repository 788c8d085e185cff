//! Environment resolution for spawned agents.
//!
//! Three layers, later overrides earlier on key collision:
//! 1. profile: the caller's explicit variables, or else the local active
//!    profile. An explicit set (even empty) disables the fallback.
//! 2. auth: provider credential variables derived from the request token.
//! 3. expansion: `${VAR}` / `${VAR:-default}` references are substituted
//!    once from the daemon's own environment. Substituted text is never
//!    re-scanned.

use crate::agent::AgentKind;
use crate::daemon::profiles::ProfileSource;
use std::collections::BTreeMap;
use std::fmt;

pub type EnvMap = BTreeMap<String, String>;

/// An auth-relevant variable still holding a `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedAuthVariable {
    pub variable: String,
    pub reference: String,
}

impl fmt::Display for UnresolvedAuthVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Environment variable {} references {}, which is not set in the daemon environment. \
             Set it before starting the daemon or remove the reference from the profile.",
            self.variable, self.reference
        )
    }
}

impl std::error::Error for UnresolvedAuthVariable {}

/// Builds the profile layer for `agent`.
pub fn profile_layer(
    agent: AgentKind,
    explicit: Option<&EnvMap>,
    profiles: &dyn ProfileSource,
) -> EnvMap {
    if let Some(explicit) = explicit {
        return explicit.clone();
    }
    match profiles.active_profile() {
        Some(profile) if profile.compatibility.allows(agent) => {
            tracing::debug!("using active profile {} for {}", profile.id, agent);
            profile.env_map()
        }
        Some(profile) => {
            tracing::debug!("active profile {} is not compatible with {}", profile.id, agent);
            EnvMap::new()
        }
        None => EnvMap::new(),
    }
}

/// Merges the layers and expands references against `lookup`.
pub fn resolve_environment<F>(profile: EnvMap, auth: EnvMap, lookup: F) -> EnvMap
where
    F: Fn(&str) -> Option<String>,
{
    let mut merged = profile;
    merged.extend(auth);
    merged
        .into_iter()
        .map(|(key, value)| {
            let expanded = expand_value(&value, &lookup);
            (key, expanded)
        })
        .collect()
}

/// Substitutes every `${NAME}` and `${NAME:-default}` in `value` once.
///
/// Unset names without a default stay verbatim so the pre-flight check can
/// report them. Malformed references are copied through unchanged.
pub fn expand_value<F>(value: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return out;
        };
        let inner = &after[..end];
        let reference = &rest[start..start + 2 + end + 1];
        rest = &after[end + 1..];

        let (name, default) = match inner.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (inner, None),
        };
        if !is_valid_name(name) {
            out.push_str(reference);
            continue;
        }

        match (lookup(name), default) {
            (Some(v), Some(default)) if v.is_empty() => out.push_str(default),
            (Some(v), _) => out.push_str(&v),
            (None, Some(default)) => out.push_str(default),
            (None, None) => out.push_str(reference),
        }
    }
    out.push_str(rest);
    out
}

fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Fails on the first auth-relevant variable of `agent` whose resolved
/// value still contains `${`.
pub fn preflight_check(agent: AgentKind, env: &EnvMap) -> Result<(), UnresolvedAuthVariable> {
    for var in agent.auth_relevant_vars() {
        let Some(value) = env.get(*var) else {
            continue;
        };
        if let Some(start) = value.find("${") {
            let tail = &value[start..];
            let reference = match tail.find('}') {
                Some(end) => &tail[..=end],
                None => tail,
            };
            return Err(UnresolvedAuthVariable {
                variable: (*var).to_string(),
                reference: reference.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "tests/env_tests.rs"]
mod tests;
