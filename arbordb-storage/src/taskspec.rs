//! Declarative task-argument parsing.
//!
//! Maintenance tasks take argument strings like `trees=acc* p v c`: named
//! `name=value` options plus clusters of single-letter flags. Each task
//! declares its options as a table of [`ArgSpec`] rows and its legal flag
//! letters; the parser validates tokens against the table, applies defaults
//! and bounds, and hands back typed lookups. Keeping this in the library
//! keeps the CLI contract testable without a terminal.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Text,
    Int,
}

#[derive(Clone, Copy, Debug)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub default: Option<&'static str>,
    pub min: i64,
    pub max: i64,
    pub help: &'static str,
}

impl ArgSpec {
    pub const fn text(name: &'static str, default: Option<&'static str>, help: &'static str) -> ArgSpec {
        ArgSpec {
            name,
            kind: ArgKind::Text,
            default,
            min: 0,
            max: 0,
            help,
        }
    }

    pub const fn int(
        name: &'static str,
        default: Option<&'static str>,
        min: i64,
        max: i64,
        help: &'static str,
    ) -> ArgSpec {
        ArgSpec {
            name,
            kind: ArgKind::Int,
            default,
            min,
            max,
            help,
        }
    }
}

#[derive(Debug, Default)]
pub struct ParsedArgs {
    values: HashMap<&'static str, String>,
    flags: HashSet<char>,
}

impl ParsedArgs {
    pub fn text(&self, name: &str) -> &str {
        self.values
            .get_key_value(name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    }

    pub fn int(&self, name: &str) -> i64 {
        self.text(name).parse().unwrap_or(0)
    }

    pub fn flag(&self, letter: char) -> bool {
        self.flags.contains(&letter)
    }

    pub fn has(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }
}

pub fn parse(specs: &[ArgSpec], flag_letters: &str, tokens: &[String]) -> Result<ParsedArgs> {
    let mut parsed = ParsedArgs::default();
    for token in tokens {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('=') {
            Some((name, value)) => {
                let spec = specs.iter().find(|s| s.name == name).ok_or_else(|| {
                    Error::InvalidArgument(format!("unknown option {name:?}"))
                })?;
                if spec.kind == ArgKind::Int {
                    let n: i64 = value.parse().map_err(|_| {
                        Error::InvalidArgument(format!("option {name} wants an integer, got {value:?}"))
                    })?;
                    if n < spec.min || n > spec.max {
                        return Err(Error::InvalidArgument(format!(
                            "option {name}={n} outside [{}, {}]",
                            spec.min, spec.max
                        )));
                    }
                }
                parsed.values.insert(spec.name, value.to_string());
            }
            None => {
                for letter in token.chars() {
                    if !flag_letters.contains(letter) {
                        return Err(Error::InvalidArgument(format!(
                            "unknown flag {letter:?} (expected one of {flag_letters:?})"
                        )));
                    }
                    parsed.flags.insert(letter);
                }
            }
        }
    }
    for spec in specs {
        if !parsed.values.contains_key(spec.name)
            && let Some(default) = spec.default
        {
            parsed.values.insert(spec.name, default.to_string());
        }
    }
    Ok(parsed)
}

/// One help line per option plus the flag letters, for usage output.
pub fn usage(specs: &[ArgSpec], flag_letters: &str) -> String {
    let mut out = String::new();
    for spec in specs {
        let default = spec.default.unwrap_or("");
        match spec.kind {
            ArgKind::Text => {
                out.push_str(&format!("  {}=<text>  {} (default {default:?})\n", spec.name, spec.help))
            }
            ArgKind::Int => out.push_str(&format!(
                "  {}=<int>  {} (default {default}, range [{}, {}])\n",
                spec.name, spec.help, spec.min, spec.max
            )),
        }
    }
    if !flag_letters.is_empty() {
        out.push_str(&format!("  flags: {flag_letters}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPECS: &[ArgSpec] = &[
        ArgSpec::text("trees", Some("*"), "tree name selector"),
        ArgSpec::int("limit", Some("100"), 1, 1000, "result cap"),
    ];

    fn tokens(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn named_options_and_flag_clusters() {
        let args = parse(SPECS, "rupv", &tokens(&["trees=acc*", "rv", "u"])).unwrap();
        assert_eq!(args.text("trees"), "acc*");
        assert_eq!(args.int("limit"), 100);
        assert!(args.flag('r'));
        assert!(args.flag('v'));
        assert!(args.flag('u'));
        assert!(!args.flag('p'));
    }

    #[test]
    fn defaults_apply_when_absent() {
        let args = parse(SPECS, "", &[]).unwrap();
        assert_eq!(args.text("trees"), "*");
        assert_eq!(args.int("limit"), 100);
    }

    #[test]
    fn unknown_option_rejected() {
        assert!(matches!(
            parse(SPECS, "", &tokens(&["bogus=1"])),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn unknown_flag_rejected() {
        assert!(matches!(
            parse(SPECS, "rv", &tokens(&["x"])),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn int_bounds_enforced() {
        assert!(parse(SPECS, "", &tokens(&["limit=1000"])).is_ok());
        assert!(matches!(
            parse(SPECS, "", &tokens(&["limit=1001"])),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            parse(SPECS, "", &tokens(&["limit=zero"])),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn usage_mentions_every_option() {
        let text = usage(SPECS, "rv");
        assert!(text.contains("trees"));
        assert!(text.contains("limit"));
        assert!(text.contains("flags: rv"));
    }
}
