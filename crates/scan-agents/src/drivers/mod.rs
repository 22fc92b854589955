//! Agent driver implementations
//!
//! Every wrapped scanner speaks the same canonical findings JSON on
//! stdout; `CommandDriver` is the generic wrapper that invokes a
//! configured (usually containerized) command and parses that output.

mod command;

pub use command::CommandDriver;

use orchestration::{Category, Severity};

/// Map a tool-reported severity onto the canonical scale.
///
/// Unknown values land on Medium rather than being dropped.
pub fn parse_severity(raw: &str) -> Severity {
    match raw.to_ascii_lowercase().as_str() {
        "high" | "critical" | "error" => Severity::High,
        "medium" | "moderate" | "warning" => Severity::Medium,
        "low" | "info" | "note" => Severity::Low,
        _ => Severity::Medium,
    }
}

/// Map a tool-reported category onto the canonical enumeration.
pub fn parse_category(raw: &str) -> Category {
    match raw.to_ascii_lowercase().as_str() {
        "command-injection" | "command_injection" => Category::CommandInjection,
        "sql-injection" | "sql_injection" | "sqli" => Category::SqlInjection,
        "xss" | "cross-site-scripting" => Category::Xss,
        "insecure-crypto" | "weak-crypto" | "crypto" => Category::InsecureCrypto,
        "hardcoded-secret" | "secret" | "hardcoded-password" => Category::HardcodedSecret,
        "path-traversal" | "directory-traversal" => Category::PathTraversal,
        "insecure-deserialization" | "deserialization" => Category::InsecureDeserialization,
        "misconfiguration" | "misconfig" => Category::Misconfiguration,
        _ => Category::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_severity_aliases() {
        assert_eq!(parse_severity("HIGH"), Severity::High);
        assert_eq!(parse_severity("critical"), Severity::High);
        assert_eq!(parse_severity("warning"), Severity::Medium);
        assert_eq!(parse_severity("info"), Severity::Low);
        assert_eq!(parse_severity("weird"), Severity::Medium);
    }

    #[test]
    fn test_parse_category_aliases() {
        assert_eq!(parse_category("command-injection"), Category::CommandInjection);
        assert_eq!(parse_category("sqli"), Category::SqlInjection);
        assert_eq!(parse_category("secret"), Category::HardcodedSecret);
        assert_eq!(parse_category("novel-badness"), Category::Other);
    }
}
