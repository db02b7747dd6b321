// Copyright (c) 2025-2026 QX Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Shell-command permission checks.
//!
//! Every command the model wants to run is classified three ways before the
//! approval gate is ever consulted: commands matching a prohibited pattern
//! are denied outright (this wins even while "approve all" is active),
//! commands matching a known-safe pattern run immediately, and everything
//! else requires explicit user approval.
//!
//! Patterns are fnmatch-style globs matched against the whole trimmed
//! command: `*` matches any run of characters, `?` a single character, and
//! `[seq]` / `[!seq]` are character classes.

use regex::Regex;
use tracing::{debug, warn};

use qx_config::ToolsConfig;

/// Outcome of classifying one shell command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandPermission {
    /// Never run; not even session approval overrides this.
    Prohibited,
    /// Run immediately, no prompt.
    AutoApproved,
    /// Ask the user.
    RequiresApproval,
}

/// Compiled prohibited / auto-approved pattern lists.  The source pattern
/// text is kept alongside each compiled matcher so the decision log names
/// the pattern that fired.
#[derive(Debug)]
pub struct CommandPermissions {
    prohibited: Vec<(String, Regex)>,
    auto_approved: Vec<(String, Regex)>,
}

impl CommandPermissions {
    pub fn from_config(cfg: &ToolsConfig) -> Self {
        Self::new(&cfg.prohibited_commands, &cfg.auto_approved_commands)
    }

    pub fn new(prohibited: &[String], auto_approved: &[String]) -> Self {
        Self {
            prohibited: compile_patterns(prohibited),
            auto_approved: compile_patterns(auto_approved),
        }
    }

    /// Classify `command`.  Prohibited patterns are checked first so a
    /// pattern appearing in both lists still denies.
    pub fn status_for(&self, command: &str) -> CommandPermission {
        let command = command.trim();
        if let Some(pattern) = first_match(&self.prohibited, command) {
            warn!(command, pattern, "command matches prohibited pattern, denying");
            return CommandPermission::Prohibited;
        }
        if let Some(pattern) = first_match(&self.auto_approved, command) {
            debug!(command, pattern, "command matches approved pattern, auto-approving");
            return CommandPermission::AutoApproved;
        }
        debug!(command, "command requires user approval");
        CommandPermission::RequiresApproval
    }
}

fn first_match<'p>(patterns: &'p [(String, Regex)], command: &str) -> Option<&'p str> {
    patterns
        .iter()
        .find(|(_, re)| re.is_match(command))
        .map(|(pattern, _)| pattern.as_str())
}

fn compile_patterns(patterns: &[String]) -> Vec<(String, Regex)> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(&translate(p)) {
            Ok(re) => Some((p.clone(), re)),
            Err(e) => {
                warn!(pattern = %p, error = %e, "skipping unusable command pattern");
                None
            }
        })
        .collect()
}

/// Translate an fnmatch-style glob into an anchored regex.
///
/// Mirrors the semantics of Python's `fnmatch.translate`: `*` → `.*`,
/// `?` → `.`, `[seq]` and `[!seq]` become character classes (a leading `]`
/// is a literal member), and an unterminated `[` is a literal bracket.
fn translate(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut re = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            '[' => {
                let mut j = i;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    re.push_str("\\[");
                } else {
                    let inner: String = chars[i..j]
                        .iter()
                        .collect::<String>()
                        .replace('\\', "\\\\")
                        .replace(']', "\\]");
                    re.push('[');
                    if let Some(rest) = inner.strip_prefix('!') {
                        re.push('^');
                        re.push_str(rest);
                    } else if let Some(rest) = inner.strip_prefix('^') {
                        re.push_str("\\^");
                        re.push_str(rest);
                    } else {
                        re.push_str(&inner);
                    }
                    re.push(']');
                    i = j + 1;
                }
            }
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    re
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
