//! Masking of secrets embedded in command strings.
//!
//! Commands often carry credentials as inline environment assignments
//! (`API_TOKEN=abc123 ./deploy.sh`). Any command that ends up in an error
//! result or a log line goes through [`sanitize_command`] first.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

/// Placeholder written in place of a masked value.
pub const MASKED_VALUE: &str = "********";

/// `NAME=value` where NAME mentions a credential. The value is a quoted
/// string or a run of non-blank characters.
static SECRET_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b([A-Z0-9_]*(?:TOKEN|PASSWORD|PASSWD|SECRET|API_?KEY|PRIVATE_KEY)[A-Z0-9_]*)=("[^"]*"|'[^']*'|[^\s;&|]+)"#,
    )
    .expect("SECRET_ASSIGNMENT is a valid regex")
});

/// Mask the values of sensitive `NAME=value` assignments in `command`.
#[must_use]
pub fn sanitize_command(command: &str) -> Cow<'_, str> {
    SECRET_ASSIGNMENT.replace_all(command, format!("${{1}}={MASKED_VALUE}").as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn masks_auth_token() {
        let out = sanitize_command("ST2_ACTION_AUTH_TOKEN=secret123 ls -la");
        assert_eq!(out, "ST2_ACTION_AUTH_TOKEN=******** ls -la");
        assert!(!out.contains("secret123"));
    }

    #[test]
    fn masks_quoted_values() {
        let out = sanitize_command(r#"DB_PASSWORD="p a s s" API_KEY='k3y' run"#);
        assert_eq!(out, "DB_PASSWORD=******** API_KEY=******** run");
    }

    #[test]
    fn masks_every_assignment() {
        let out = sanitize_command("TOKEN=a && aws_secret_access_key=b cmd; x");
        assert_eq!(out, "TOKEN=******** && aws_secret_access_key=******** cmd; x");
    }

    #[test]
    fn leaves_ordinary_commands_alone() {
        let cmd = "PATH=/usr/bin FOO=bar echo hi";
        assert!(matches!(sanitize_command(cmd), Cow::Borrowed(_)));
    }

    proptest! {
        #[test]
        fn masked_values_never_leak(
            prefix in "[A-Z_]{0,6}",
            value in "[A-Z][a-z0-9]{5,19}",
            tail in "[a-z ./-]{0,20}",
        ) {
            let command = format!("{prefix}TOKEN={value} {tail}");
            let out = sanitize_command(&command);
            prop_assert!(!out.contains(&value));
            prop_assert!(out.contains(MASKED_VALUE));
        }
    }
}
