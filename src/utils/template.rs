//! String template rendering utilities.
//!
//! Templates use `{{key}}` placeholders. Keys are word characters only.

use regex::Regex;
use std::sync::OnceLock;

use crate::env::Env;
use crate::utils::shell;

/// Runtime variables filled in by the release manager once a release exists.
pub struct TemplateVars;

impl TemplateVars {
    pub const DEPLOY_PATH: &'static str = "deploy_path";
    pub const RELEASES_PATH: &'static str = "releases_path";
    pub const RELEASE_PATH: &'static str = "release_path";
    pub const RELEASE_ID: &'static str = "release_id";
    pub const CURRENT_PATH: &'static str = "current_path";
    pub const SHARED_PATH: &'static str = "shared_path";
    pub const HOST: &'static str = "host";
    pub const USER: &'static str = "user";

    /// Keys that are only known once a release directory has been prepared.
    pub fn runtime() -> &'static [&'static str] {
        &[
            Self::RELEASES_PATH,
            Self::RELEASE_PATH,
            Self::RELEASE_ID,
            Self::CURRENT_PATH,
            Self::SHARED_PATH,
        ]
    }
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").expect("placeholder regex is valid"))
}

/// Render a shell template against an env mapping.
///
/// Each substituted value becomes exactly one shell word: values holding
/// shell metacharacters are single-quoted. Unknown placeholders are left
/// untouched so validation can still see them.
pub fn render_shell(template: &str, env: &Env) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures| {
            env.get(&caps[1])
                .map(shell::quote_arg)
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Placeholder keys referenced by a template, in order of first appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for caps in placeholder_regex().captures_iter(template) {
        let key = caps[1].to_string();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}
