//! Auto-check expressions
//!
//! A deliberately small predicate language over submission artifacts:
//!
//! - `artifact:<key>` — the artifact exists and is non-empty
//! - `artifact:<key>=<value>` — the artifact equals the value exactly
//! - `min_artifacts:<n>` — at least `n` artifacts were attached
//!
//! Anything unparseable evaluates to not-passed; a gate author typo
//! should block approval, not grant it.

use std::collections::BTreeMap;

/// Evaluate one auto-check expression against the artifacts.
pub fn evaluate(expression: &str, artifacts: &BTreeMap<String, String>) -> bool {
    if let Some(rest) = expression.strip_prefix("artifact:") {
        return match rest.split_once('=') {
            Some((key, expected)) => artifacts.get(key).map(String::as_str) == Some(expected),
            None => artifacts.get(rest).map(|v| !v.is_empty()).unwrap_or(false),
        };
    }
    if let Some(rest) = expression.strip_prefix("min_artifacts:") {
        return rest
            .parse::<usize>()
            .map(|n| artifacts.len() >= n)
            .unwrap_or(false);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifacts(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn presence_check() {
        let arts = artifacts(&[("test_log", "42 passed")]);
        assert!(evaluate("artifact:test_log", &arts));
        assert!(!evaluate("artifact:coverage", &arts));
    }

    #[test]
    fn empty_artifact_does_not_pass_presence() {
        let arts = artifacts(&[("test_log", "")]);
        assert!(!evaluate("artifact:test_log", &arts));
    }

    #[test]
    fn equality_check() {
        let arts = artifacts(&[("tests", "pass")]);
        assert!(evaluate("artifact:tests=pass", &arts));
        assert!(!evaluate("artifact:tests=fail", &arts));
    }

    #[test]
    fn min_artifacts_check() {
        let arts = artifacts(&[("a", "1"), ("b", "2")]);
        assert!(evaluate("min_artifacts:2", &arts));
        assert!(!evaluate("min_artifacts:3", &arts));
    }

    #[test]
    fn garbage_never_passes() {
        let arts = artifacts(&[("a", "1")]);
        assert!(!evaluate("artifcat:a", &arts));
        assert!(!evaluate("min_artifacts:lots", &arts));
        assert!(!evaluate("", &arts));
    }
}
