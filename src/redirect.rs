//! User-defined redirect rules.
//!
//! A rule string is a comma-separated list of `pattern~replacement` entries,
//! e.g. `^https?://(www\.)?reddit\.com~https://old.reddit.com`. Every rule
//! is applied in order to the running URL, so later rules see the output of
//! earlier ones. Replacements use `$1` / `${name}` capture references.

use regex::Regex;
use tracing::debug;

const RULE_SEPARATOR: char = ',';
const PATTERN_SEPARATOR: char = '~';

#[derive(Debug, Clone)]
pub struct RedirectRule {
    pattern: Regex,
    replacement: String,
}

/// Ordered redirect rules for one session.
#[derive(Debug, Clone, Default)]
pub struct RedirectRules {
    rules: Vec<RedirectRule>,
}

impl RedirectRules {
    /// Parses a rule string. Entries without a `~`, with an empty pattern,
    /// or with an invalid regex are skipped.
    pub fn parse(source: &str) -> Self {
        let rules = source
            .split(RULE_SEPARATOR)
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                let (pattern, replacement) = entry.split_once(PATTERN_SEPARATOR)?;
                if pattern.is_empty() {
                    return None;
                }
                match Regex::new(pattern) {
                    Ok(pattern) => Some(RedirectRule {
                        pattern,
                        replacement: replacement.to_owned(),
                    }),
                    Err(e) => {
                        debug!(pattern, error = %e, "Skipping invalid redirect rule");
                        None
                    }
                }
            })
            .collect();
        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies every rule in sequence and returns the resulting URL.
    pub fn rewrite(&self, url: &str) -> String {
        self.rules.iter().fold(url.to_owned(), |current, rule| {
            rule.pattern
                .replace_all(&current, rule.replacement.as_str())
                .into_owned()
        })
    }

    /// `Some(target)` when the rules change the URL.
    pub fn redirect_target(&self, url: &str) -> Option<String> {
        let rewritten = self.rewrite(url);
        (rewritten != url).then_some(rewritten)
    }
}
