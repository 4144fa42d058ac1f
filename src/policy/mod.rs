//! Tool-approval rule engine.
//!
//! Decides `allow | deny | ask` for an incoming `can_use_tool` request
//! before a human is prompted, and derives a suggested rule from a
//! concrete decision so the client can offer "always allow this" style
//! shortcuts.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
    Ask,
}

/// `{tool, pattern?, action}` — ordered list, first-match-wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub action: Action,
}

/// Ordered, first-match-wins rule list.
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn set_rules(&mut self, rules: Vec<Rule>) {
        self.rules = rules;
    }

    /// Evaluate a `can_use_tool` request. Deterministic and pure: iterate
    /// rules in order, first match returns its action; no match ⇒ ask.
    pub fn evaluate(&self, tool_name: &str, tool_input: &Value) -> (Action, Option<&Rule>) {
        let primary_input = extract_primary_input(tool_name, tool_input);

        for rule in &self.rules {
            if rule.tool != "*" && rule.tool != tool_name {
                continue;
            }
            match &rule.pattern {
                None => return (rule.action, Some(rule)),
                Some(pattern) => {
                    let Some(input) = &primary_input else { continue };
                    if glob_matches(pattern, input) {
                        return (rule.action, Some(rule));
                    }
                }
            }
        }
        (Action::Ask, None)
    }

    /// Derive a suggested rule from a concrete allow/deny decision.
    ///
    /// For `Bash`, the pattern narrows to the first shell word followed by
    /// a wildcard (`"ls *"` for `ls -la`); for any other tool, no pattern
    /// is attached (the rule matches the tool unconditionally).
    pub fn derive_rule(tool_name: &str, tool_input: &Value, action: Action) -> Rule {
        if tool_name == "Bash" {
            if let Some(command) = tool_input.get("command").and_then(Value::as_str) {
                let first_word = command.split_whitespace().next().unwrap_or(command);
                return Rule {
                    tool: "Bash".to_string(),
                    pattern: Some(format!("{first_word} *")),
                    action,
                };
            }
        }
        Rule {
            tool: tool_name.to_string(),
            pattern: None,
            action,
        }
    }
}

/// Per-tool primary-input extraction for pattern matching.
///
/// Bash→`command`, Read/Write/Edit→`file_path`, Grep/Glob→`pattern`,
/// WebFetch→`url`. Unknown tools fall back to the first-present of
/// `command`, `file_path`, `path`, `pattern`.
fn extract_primary_input(tool_name: &str, input: &Value) -> Option<String> {
    let key = match tool_name {
        "Bash" => "command",
        "Read" | "Write" | "Edit" => "file_path",
        "Grep" | "Glob" => "pattern",
        "WebFetch" => "url",
        _ => {
            for fallback in ["command", "file_path", "path", "pattern"] {
                if let Some(v) = input.get(fallback).and_then(Value::as_str) {
                    return Some(v.to_string());
                }
            }
            return None;
        }
    };
    input.get(key).and_then(Value::as_str).map(String::from)
}

/// Patterns are user-configured and re-evaluated on every tool call, so
/// compiled regexes are cached process-wide keyed by the source pattern
/// string rather than recompiled each time.
static GLOB_CACHE: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Compile a shell-style glob (`*` as the only wildcard) to an anchored,
/// dotall regex and test `input` against it. An absent pattern matches
/// anything; this helper is only called once a pattern is known to exist.
pub fn glob_matches(pattern: &str, input: &str) -> bool {
    if let Ok(cache) = GLOB_CACHE.lock() {
        if let Some(re) = cache.get(pattern) {
            return re.is_match(input);
        }
    }
    let Ok(re) = compile_glob(pattern) else { return false };
    let matched = re.is_match(input);
    if let Ok(mut cache) = GLOB_CACHE.lock() {
        cache.insert(pattern.to_string(), re);
    }
    matched
}

/// `"foo*bar"` compiles to `^foo.*bar$` (anchored, dotall — `*` matches any
/// run of characters including `/`). No brace or character-class support.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut regex_str = String::with_capacity(pattern.len() + 8);
    regex_str.push('^');
    for part in pattern.split('*') {
        if !regex_str.ends_with('^') {
            regex_str.push_str(".*");
        }
        regex_str.push_str(&regex::escape(part));
    }
    regex_str.push('$');
    Regex::new(&regex_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rule(tool: &str, pattern: Option<&str>, action: Action) -> Rule {
        Rule {
            tool: tool.to_string(),
            pattern: pattern.map(String::from),
            action,
        }
    }

    #[test]
    fn matching_rule_auto_allows() {
        let engine = RuleEngine::new(vec![rule("Bash", Some("ls *"), Action::Allow)]);
        let input = serde_json::json!({ "command": "ls -la" });
        let (action, matched) = engine.evaluate("Bash", &input);
        assert_eq!(action, Action::Allow);
        assert!(matched.is_some());
    }

    #[test]
    fn no_rules_means_ask() {
        let engine = RuleEngine::new(vec![]);
        let input = serde_json::json!({ "command": "rm -rf /" });
        assert_eq!(engine.evaluate("Bash", &input).0, Action::Ask);
    }

    #[test]
    fn first_match_wins() {
        let engine = RuleEngine::new(vec![
            rule("Bash", Some("ls *"), Action::Deny),
            rule("Bash", Some("ls *"), Action::Allow),
        ]);
        let input = serde_json::json!({ "command": "ls -la" });
        assert_eq!(engine.evaluate("Bash", &input).0, Action::Deny);
    }

    #[test]
    fn wildcard_tool_matches_any() {
        let engine = RuleEngine::new(vec![rule("*", None, Action::Allow)]);
        let input = serde_json::json!({ "file_path": "/tmp/x" });
        assert_eq!(engine.evaluate("Read", &input).0, Action::Allow);
    }

    #[test]
    fn absent_pattern_matches_any_primary_input() {
        let engine = RuleEngine::new(vec![rule("Read", None, Action::Allow)]);
        let input = serde_json::json!({ "file_path": "/etc/shadow" });
        assert_eq!(engine.evaluate("Read", &input).0, Action::Allow);
    }

    #[test]
    fn missing_primary_input_does_not_match_pattern_rule() {
        let engine = RuleEngine::new(vec![rule("Bash", Some("ls *"), Action::Allow)]);
        let input = serde_json::json!({});
        assert_eq!(engine.evaluate("Bash", &input).0, Action::Ask);
    }

    #[test]
    fn derive_rule_for_bash_uses_first_word() {
        let input = serde_json::json!({ "command": "ls -la /tmp" });
        let rule = RuleEngine::derive_rule("Bash", &input, Action::Allow);
        assert_eq!(rule.pattern.as_deref(), Some("ls *"));
    }

    #[test]
    fn derive_rule_for_other_tool_has_no_pattern() {
        let input = serde_json::json!({ "file_path": "/tmp/x" });
        let rule = RuleEngine::derive_rule("Read", &input, Action::Deny);
        assert_eq!(rule.tool, "Read");
        assert!(rule.pattern.is_none());
    }

    #[test]
    fn glob_to_regex_semantics() {
        assert!(glob_matches("a*b", "ab"));
        assert!(glob_matches("a*b", "axxxb"));
        assert!(!glob_matches("a*b", "a"));
        assert!(!glob_matches("a*b", "xab"));
    }

    proptest! {
        #[test]
        fn prop_a_star_b_matches_prefix_suffix(s in "[a-zA-Z0-9]{0,20}") {
            let matched = glob_matches("a*b", &s);
            let expected = s.starts_with('a') && s.ends_with('b') && s.len() >= 2;
            prop_assert_eq!(matched, expected);
        }

        #[test]
        fn evaluate_is_deterministic(cmd in "[a-z]{1,10}") {
            let engine = RuleEngine::new(vec![rule("Bash", Some("ls *"), Action::Allow)]);
            let input = serde_json::json!({ "command": format!("ls {cmd}") });
            let a = engine.evaluate("Bash", &input).0;
            let b = engine.evaluate("Bash", &input).0;
            prop_assert_eq!(a, b);
        }
    }
}
