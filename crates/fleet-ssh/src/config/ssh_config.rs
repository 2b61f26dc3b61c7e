//! Minimal OpenSSH client config (`~/.ssh/config`) lookup.
//!
//! Only the options a fleet session can use are extracted: `User`, `Port`,
//! `HostName`, `IdentityFile` and `ProxyCommand`. As in OpenSSH, the first
//! value found for an option wins, except `IdentityFile` which accumulates.

use std::path::{Path, PathBuf};

use glob::Pattern;

use crate::auth::expand_tilde;

/// Options that apply to one host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOptions {
    /// `User`.
    pub user: Option<String>,
    /// `Port`.
    pub port: Option<u16>,
    /// `HostName`.
    pub hostname: Option<String>,
    /// Every `IdentityFile`, in file order.
    pub identity_files: Vec<PathBuf>,
    /// `ProxyCommand`, with its `%` tokens unexpanded. `none` leaves it unset.
    pub proxy_command: Option<String>,
}

#[derive(Debug)]
struct HostBlock {
    /// `None` for options that precede the first `Host` line.
    patterns: Option<Vec<(Pattern, bool)>>,
    options: Vec<(String, String)>,
}

impl HostBlock {
    fn matches(&self, host: &str) -> bool {
        let Some(patterns) = &self.patterns else {
            return true;
        };
        let mut matched = false;
        for (pattern, negated) in patterns {
            if pattern.matches(host) {
                if *negated {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

/// A parsed client config.
#[derive(Debug)]
pub struct SshClientConfig {
    blocks: Vec<HostBlock>,
}

impl SshClientConfig {
    /// Parse config text. Unknown options and `Match` blocks are ignored.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut blocks = vec![HostBlock {
            patterns: None,
            options: Vec::new(),
        }];
        let mut skipping = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = split_option(line);
            match key.to_lowercase().as_str() {
                "host" => {
                    skipping = false;
                    let patterns = value
                        .split_whitespace()
                        .filter_map(|p| {
                            let (raw, negated) = match p.strip_prefix('!') {
                                Some(rest) => (rest, true),
                                None => (p, false),
                            };
                            Pattern::new(raw).ok().map(|pat| (pat, negated))
                        })
                        .collect();
                    blocks.push(HostBlock {
                        patterns: Some(patterns),
                        options: Vec::new(),
                    });
                }
                "match" => skipping = true,
                _ if skipping => {}
                option => {
                    if let Some(block) = blocks.last_mut() {
                        block
                            .options
                            .push((option.to_string(), unquote(value).to_string()));
                    }
                }
            }
        }

        Self { blocks }
    }

    /// Read and parse a config file. A missing file is an empty config.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::parse("")),
            Err(e) => Err(e),
        }
    }

    /// Options for `host`.
    #[must_use]
    pub fn lookup(&self, host: &str) -> HostOptions {
        let mut opts = HostOptions::default();
        let mut proxy_seen = false;
        for block in self.blocks.iter().filter(|b| b.matches(host)) {
            for (key, value) in &block.options {
                match key.as_str() {
                    "user" if opts.user.is_none() => opts.user = Some(value.clone()),
                    "port" if opts.port.is_none() => opts.port = value.parse().ok(),
                    "hostname" if opts.hostname.is_none() => {
                        opts.hostname = Some(value.replace("%h", host));
                    }
                    "identityfile" => opts.identity_files.push(expand_tilde(Path::new(value))),
                    "proxycommand" if !proxy_seen => {
                        proxy_seen = true;
                        if !value.eq_ignore_ascii_case("none") {
                            opts.proxy_command = Some(value.clone());
                        }
                    }
                    _ => {}
                }
            }
        }
        opts
    }
}

/// Split `Key value` or `Key=value`.
fn split_option(line: &str) -> (&str, &str) {
    let idx = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (key, rest) = line.split_at(idx);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    (key, rest)
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
# global
User fallback

Host web-* !web-legacy
    User deploy
    Port 2222
    IdentityFile "/keys/web"

Host db1
    HostName db1.internal
    IdentityFile=/keys/db

Match host foo
    User ignored

Host *
    IdentityFile /keys/any
"#;

    #[test]
    fn wildcard_block_applies() {
        let cfg = SshClientConfig::parse(CONFIG);
        let opts = cfg.lookup("web-01");
        assert_eq!(opts.user.as_deref(), Some("fallback"));
        assert_eq!(opts.port, Some(2222));
        assert_eq!(
            opts.identity_files,
            vec![PathBuf::from("/keys/web"), PathBuf::from("/keys/any")]
        );
    }

    #[test]
    fn negated_pattern_excludes() {
        let cfg = SshClientConfig::parse(CONFIG);
        let opts = cfg.lookup("web-legacy");
        assert_eq!(opts.port, None);
        assert_eq!(opts.identity_files, vec![PathBuf::from("/keys/any")]);
    }

    #[test]
    fn equals_syntax_and_hostname() {
        let cfg = SshClientConfig::parse(CONFIG);
        let opts = cfg.lookup("db1");
        assert_eq!(opts.hostname.as_deref(), Some("db1.internal"));
        assert_eq!(opts.identity_files[0], PathBuf::from("/keys/db"));
    }

    #[test]
    fn match_blocks_are_skipped() {
        let cfg = SshClientConfig::parse("Match all\n  User nobody\n");
        assert_eq!(cfg.lookup("x").user, None);
    }

    #[test]
    fn missing_file_is_empty() {
        let cfg = SshClientConfig::load(Path::new("/nonexistent/ssh_config")).unwrap();
        assert_eq!(cfg.lookup("any"), HostOptions::default());
    }

    #[test]
    fn proxy_command_first_value_wins() {
        let cfg = SshClientConfig::parse(
            "Host db*\n  ProxyCommand ssh -W %h:%p jump\nHost *\n  ProxyCommand nc %h %p\n",
        );
        assert_eq!(cfg.lookup("db1").proxy_command.as_deref(), Some("ssh -W %h:%p jump"));
        assert_eq!(cfg.lookup("web1").proxy_command.as_deref(), Some("nc %h %p"));
    }

    #[test]
    fn proxy_command_none_disables_later_values() {
        let cfg = SshClientConfig::parse("Host local\n  ProxyCommand none\nHost *\n  ProxyCommand nc %h %p\n");
        assert_eq!(cfg.lookup("local").proxy_command, None);
    }
}
