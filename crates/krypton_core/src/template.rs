//! Startup-command and config-file templating.
//!
//! Two substitutions are applied, in order: `%variable_name%` tokens and
//! `%cargo:['target/path']%` references. Variable values are checked against
//! their pipe-separated rule string as they are substituted.

use std::sync::LazyLock;

use krypton_datamodel::server::{CargoFile, Variable};
use regex::Regex;

use crate::error::{Error, Result};

#[allow(clippy::expect_used)]
static CARGO_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"%cargo:\['([^']*)'\]%").expect("constant regex pattern is valid")
});

/// Placeholder name for a variable: lowercased, spaces become underscores.
pub fn normalize_name(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

/// Shell-safe environment name: any character outside `[A-Za-z0-9_]`
/// becomes `_`.
pub fn env_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Evaluate a pipe-separated rule string against a value.
///
/// `nullable` short-circuits empty values to valid, `string` imposes no
/// constraint, `max:N` caps the length. Unknown tokens are ignored, so rule
/// evaluation is a conjunction of known rejections.
pub fn validate(value: &str, rules: &str) -> bool {
    let tokens: Vec<&str> = rules
        .split('|')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect();

    if value.is_empty() && tokens.iter().any(|t| *t == "nullable") {
        return true;
    }

    for token in tokens {
        if let Some(n) = token.strip_prefix("max:") {
            if let Ok(max) = n.parse::<usize>() {
                if value.chars().count() > max {
                    return false;
                }
            }
        }
    }

    true
}

/// Check every variable's effective value against its rules.
pub fn validate_all(variables: &[Variable]) -> Result<()> {
    for var in variables {
        if !validate(var.value(), &var.rules) {
            return Err(Error::VariableRuleViolation {
                name: var.name.clone(),
                rules: var.rules.clone(),
            });
        }
    }
    Ok(())
}

/// Substitute variables and cargo references into `input`.
///
/// Unmatched placeholders are left intact. A substituted value that fails its
/// rules aborts with [`Error::VariableRuleViolation`]; a cargo reference with
/// no matching entry aborts with [`Error::UnknownCargo`].
pub fn render(input: &str, variables: &[Variable], cargo: &[CargoFile]) -> Result<String> {
    let mut out = input.to_owned();

    for var in variables {
        let token = format!("%{}%", normalize_name(&var.name));
        if !out.contains(&token) {
            continue;
        }

        let value = var.value();
        if !validate(value, &var.rules) {
            return Err(Error::VariableRuleViolation {
                name: var.name.clone(),
                rules: var.rules.clone(),
            });
        }

        out = out.replace(&token, value);
    }

    for caps in CARGO_PATTERN.captures_iter(&out) {
        let path = &caps[1];
        if !cargo.iter().any(|c| c.target_path == path) {
            return Err(Error::UnknownCargo(path.to_owned()));
        }
    }

    // known references collapse to their own target path
    Ok(CARGO_PATTERN.replace_all(&out, "$1").into_owned())
}

#[cfg(test)]
mod tests {
    use krypton_datamodel::server::CargoProperties;
    use proptest::prelude::*;

    use super::*;

    fn var(name: &str, default: &str, current: Option<&str>, rules: &str) -> Variable {
        Variable {
            name: name.to_owned(),
            default_value: default.to_owned(),
            current_value: current.map(str::to_owned),
            rules: rules.to_owned(),
        }
    }

    fn cargo_entry(target: &str) -> CargoFile {
        CargoFile {
            url: format!("http://files.local/{target}"),
            target_path: target.to_owned(),
            properties: CargoProperties::default(),
        }
    }

    #[test]
    fn substitutes_current_value_over_default() {
        let vars = [var("Server Memory", "512", Some("1024"), "string")];
        let out = render("-Xmx%server_memory%M", &vars, &[]).unwrap();
        assert_eq!(out, "-Xmx1024M");
    }

    #[test]
    fn falls_back_to_default_value() {
        let vars = [var("PORT", "25565", None, "string")];
        let out = render("--port %port%", &vars, &[]).unwrap();
        assert_eq!(out, "--port 25565");
    }

    #[test]
    fn leaves_unmatched_placeholders_intact() {
        let out = render("%unknown% stays", &[], &[]).unwrap();
        assert_eq!(out, "%unknown% stays");
    }

    #[test]
    fn rejects_rule_violations() {
        let vars = [var("PORT", "999999", None, "string|max:4")];
        let err = render("--port %port%", &vars, &[]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::VariableRuleViolation { ref name, .. } if name == "PORT"
        ));
    }

    #[test]
    fn skips_validation_for_unreferenced_variables() {
        let vars = [var("PORT", "999999", None, "string|max:4")];
        assert_eq!(render("no tokens", &vars, &[]).unwrap(), "no tokens");
    }

    #[test]
    fn cargo_reference_expands_to_its_target_path() {
        let cargo = [cargo_entry("plugins/map.jar")];
        let out = render("load %cargo:['plugins/map.jar']%", &[], &cargo).unwrap();
        assert_eq!(out, "load plugins/map.jar");
    }

    #[test]
    fn unknown_cargo_reference_fails() {
        let err = render("%cargo:['missing.jar']%", &[], &[]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::UnknownCargo(ref path) if path == "missing.jar"
        ));
    }

    #[test]
    fn env_names_are_shell_safe() {
        assert_eq!(env_name("Server Memory"), "Server_Memory");
        assert_eq!(env_name("JAVA_VERSION"), "JAVA_VERSION");
        assert_eq!(env_name("weird-name!"), "weird_name_");
    }

    #[test]
    fn nullable_short_circuits_empty_values() {
        assert!(validate("", "nullable|max:0"));
        assert!(validate("", "nullable"));
    }

    #[test]
    fn empty_without_nullable_is_not_implicitly_rejected() {
        assert!(validate("", "string"));
        assert!(validate("", ""));
    }

    #[test]
    fn max_rule_counts_characters() {
        assert!(validate("abcd", "max:4"));
        assert!(!validate("abcde", "max:4"));
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        assert!(validate("value", "string|required|regex:/x/"));
    }

    proptest! {
        #[test]
        fn substitution_is_exact_per_occurrence(
            occurrences in 1usize..5,
            value in "[a-z0-9]{1,8}",
        ) {
            let vars = [var("NAME", &value, None, "string")];
            let input = vec!["%name%"; occurrences].join(" | ");
            let out = render(&input, &vars, &[]).unwrap();
            prop_assert_eq!(out, vec![value.as_str(); occurrences].join(" | "));
        }

        #[test]
        fn unknown_tokens_never_flip_a_verdict(
            value in "[a-z]{0,10}",
            max in 0usize..12,
            junk in "[a-z_]{1,8}",
        ) {
            let base = format!("max:{max}");
            let with_junk = format!("{base}|{junk}");
            // appending a token that is not a known rejection cannot flip `true` to `false`
            if validate(&value, &base) {
                prop_assert!(validate(&value, &with_junk));
            }
        }
    }
}
