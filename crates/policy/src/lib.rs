//! Approval policy engine: resolves the effective `(host, security, ask)`
//! triple, applies the immediate-deny and obfuscation-deny pattern sets,
//! splits a command into shell segments and checks each against the
//! agent's allowlist or the safe-bin registry, and produces the final
//! allow/deny/prompt/dry-run decision.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Host {
    Sandbox,
    Gateway,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Security {
    Deny = 0,
    Allowlist = 1,
    Full = 2,
}

impl Security {
    /// Narrower-wins: the more restrictive of two values survives a merge.
    pub fn narrower(self, other: Security) -> Security {
        self.min(other)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ask {
    Off = 0,
    OnMiss = 1,
    Always = 2,
}

impl Ask {
    /// Broader-wins: the more inclusive-of-asking value survives a merge.
    pub fn broader(self, other: Ask) -> Ask {
        self.max(other)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SecurityTriple {
    pub host: Host,
    pub security: Security,
    pub ask: Ask,
}

/// Layered overrides resolved narrower/broader-wins, in the order
/// config default -> per-agent -> per-call.
pub fn resolve_triple(
    default: SecurityTriple,
    agent_security: Option<Security>,
    agent_ask: Option<Ask>,
    call_security: Option<Security>,
    call_ask: Option<Ask>,
) -> SecurityTriple {
    let mut security = default.security;
    let mut ask = default.ask;
    if let Some(s) = agent_security {
        security = security.narrower(s);
    }
    if let Some(a) = agent_ask {
        ask = ask.broader(a);
    }
    if let Some(s) = call_security {
        security = security.narrower(s);
    }
    if let Some(a) = call_ask {
        ask = ask.broader(a);
    }
    SecurityTriple {
        host: default.host,
        security,
        ask,
    }
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub agent_id: Option<String>,
    pub requested_host: Option<Host>,
    pub env: Vec<(String, String)>,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub path_dirs: Vec<PathBuf>,
    pub denied_hosts: Vec<String>,
    pub allowed_hosts: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    WouldAllow,
    WouldDeny,
    WouldPrompt,
}

#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub verdict: Verdict,
    pub risk_indicators: Vec<String>,
    pub suggestions: Vec<String>,
    pub segments: Vec<SegmentAnalysis>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Allow {
        auto_approved: bool,
        allowlist_matches: Vec<String>,
    },
    Deny {
        reason: String,
    },
    Prompt,
    DryRun(DryRunReport),
}

#[derive(Debug, Clone)]
pub struct SegmentAnalysis {
    pub segment: String,
    pub resolved_executable: Option<PathBuf>,
    pub allowlist_match: Option<String>,
    pub is_safe_bin: bool,
    pub satisfied: bool,
}

/// Splits on unquoted `&&`, `||`, `;`, `|`.
pub fn split_segments(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let chars: Vec<char> = command.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' && !in_double {
            in_single = !in_single;
            current.push(c);
            i += 1;
            continue;
        }
        if c == '"' && !in_single {
            in_double = !in_double;
            current.push(c);
            i += 1;
            continue;
        }
        if !in_single && !in_double {
            if c == '&' && chars.get(i + 1) == Some(&'&') {
                segments.push(current.trim().to_string());
                current.clear();
                i += 2;
                continue;
            }
            if c == '|' && chars.get(i + 1) == Some(&'|') {
                segments.push(current.trim().to_string());
                current.clear();
                i += 2;
                continue;
            }
            if c == ';' || c == '|' {
                segments.push(current.trim().to_string());
                current.clear();
                i += 1;
                continue;
            }
        }
        current.push(c);
        i += 1;
    }
    if !current.trim().is_empty() {
        segments.push(current.trim().to_string());
    }
    segments.into_iter().filter(|s| !s.is_empty()).collect()
}

fn first_token(segment: &str) -> &str {
    segment.split_whitespace().next().unwrap_or("")
}

pub fn resolve_executable(name: &str, path_dirs: &[PathBuf]) -> Option<PathBuf> {
    if name.contains('/') {
        return Some(PathBuf::from(name));
    }
    for dir in path_dirs {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Canonical-relative-to-cwd argument forms: no shell escapes, no
/// absolute paths outside the command's own cwd-relative tree.
fn is_safe_bin_usage(bin_name: &str, segment: &str) -> bool {
    if !safe_bin_registry().contains(bin_name) {
        return false;
    }
    let suspicious = ['$', '`', ';', '|', '&', '>', '<', '\n'];
    if segment.chars().any(|c| suspicious.contains(&c)) {
        return false;
    }
    if segment.contains("..") {
        return false;
    }
    true
}

fn safe_bin_registry() -> &'static HashSet<&'static str> {
    static REGISTRY: OnceLock<HashSet<&'static str>> = OnceLock::new();
    REGISTRY.get_or_init(|| ["git", "npm", "cargo", "ls", "cat", "grep", "find"].into_iter().collect())
}

pub fn analyze_segments(
    command: &str,
    path_dirs: &[PathBuf],
    allowlist_patterns: &[String],
) -> Vec<SegmentAnalysis> {
    split_segments(command)
        .into_iter()
        .map(|segment| {
            let bin = first_token(&segment);
            let resolved = resolve_executable(bin, path_dirs);
            let allowlist_match = resolved.as_ref().and_then(|path| {
                let path_str = path.to_string_lossy();
                allowlist_patterns
                    .iter()
                    .find(|pattern| path_str == pattern.as_str() || bin == pattern.as_str())
                    .cloned()
            });
            let is_safe_bin = is_safe_bin_usage(bin, &segment);
            let satisfied = allowlist_match.is_some() || is_safe_bin;
            SegmentAnalysis {
                segment,
                resolved_executable: resolved,
                allowlist_match,
                is_safe_bin,
                satisfied,
            }
        })
        .collect()
}

struct NamedPattern {
    name: &'static str,
    regex: Regex,
}

fn compile(name: &'static str, pattern: &str) -> NamedPattern {
    NamedPattern {
        name,
        regex: Regex::new(pattern).expect("static policy pattern must compile"),
    }
}

fn immediate_deny_patterns() -> &'static Vec<NamedPattern> {
    static PATTERNS: OnceLock<Vec<NamedPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            compile("ROOT_RECURSIVE_DELETE", r"rm\s+-[a-zA-Z]*r[a-zA-Z]*f[a-zA-Z]*\s+/(\s|$)"),
            compile("ROOT_RECURSIVE_DELETE", r"rm\s+-[a-zA-Z]*f[a-zA-Z]*r[a-zA-Z]*\s+/(\s|$)"),
            compile("RM_RF_WILDCARD", r"rm\s+-[a-zA-Z]*rf[a-zA-Z]*\s+\*"),
            compile("DD_TO_DEVICE", r"\bdd\b[^|;&]*\bof=/dev/"),
            compile("MKFS", r"\bmkfs\b"),
            compile("FORK_BOMB", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
            compile("PIPE_TO_SHELL", r"\|\s*(sh|bash|zsh|dash)\b"),
            compile("EVAL_CURL", r"eval\s+\$\(\s*curl\b"),
            compile("OVERWRITE_PASSWD", r">\s*/etc/(passwd|shadow)\b"),
            compile("SYSTEM_SHUTDOWN", r"\b(shutdown|poweroff|halt|reboot)\b"),
            compile("KILL_INIT", r"kill\s+-9\s+1\b"),
            compile("WRITE_RAW_DISK", r">\s*/dev/sd[a-z]\b"),
        ]
    })
}

fn obfuscation_patterns() -> &'static Vec<NamedPattern> {
    static PATTERNS: OnceLock<Vec<NamedPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            compile("ANSI_C_QUOTING", r#"\$'(?:[^'\\]|\\.)*'"#),
            compile("LOCALE_QUOTING", r#"\$"(?:[^"\\]|\\.)*""#),
            compile("EMPTY_QUOTE_CONCAT", r"''\s*[\w./-]*\s*''"),
            compile("VARIABLE_REUSE", r"\b(\w+)=['\x22][^'\x22]*['\x22]\s*;\s*\$\1\b"),
        ]
    })
}

const DANGEROUS_ENV_KEYS: &[&str] = &[
    "NODE_OPTIONS",
    "PYTHONPATH",
    "BASH_ENV",
    "ENV",
    "IFS",
    "SSLKEYLOGFILE",
    "PATH",
];

fn is_dangerous_env_key(key: &str) -> bool {
    key.starts_with("LD_") || key.starts_with("DYLD_") || DANGEROUS_ENV_KEYS.contains(&key)
}

pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    /// Immediate deny set, checked before anything else.
    pub fn immediate_deny(&self, command: &str) -> Option<&'static str> {
        immediate_deny_patterns()
            .iter()
            .find(|p| p.regex.is_match(command))
            .map(|p| p.name)
    }

    pub fn obfuscation_deny(&self, command: &str) -> Option<&'static str> {
        obfuscation_patterns()
            .iter()
            .find(|p| p.regex.is_match(command))
            .map(|p| p.name)
    }

    fn referenced_hosts(&self, command: &str) -> Vec<String> {
        static HOST_REGEX: OnceLock<Regex> = OnceLock::new();
        let re = HOST_REGEX.get_or_init(|| {
            Regex::new(r"https?://([a-zA-Z0-9.-]+)|(?:^|\s)([a-zA-Z0-9.-]+\.[a-zA-Z]{2,})(?:[:/\s]|$)")
                .unwrap()
        });
        re.captures_iter(command)
            .filter_map(|c| c.get(1).or_else(|| c.get(2)))
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn network_restriction_violation(&self, host: Host, command: &str) -> Option<String> {
        if host != Host::Sandbox {
            return None;
        }
        let referenced = self.referenced_hosts(command);
        for h in &referenced {
            if self.config.denied_hosts.iter().any(|d| d == h) {
                return Some(format!("denied host referenced: {h}"));
            }
        }
        if let Some(allowed) = &self.config.allowed_hosts {
            for h in &referenced {
                if !allowed.iter().any(|a| a == h) {
                    return Some(format!("host not in allowlist: {h}"));
                }
            }
        }
        None
    }

    fn host_env_violation(&self, host: Host, env: &[(String, String)]) -> Option<String> {
        if host == Host::Sandbox {
            return None;
        }
        env.iter()
            .find(|(k, _)| is_dangerous_env_key(k))
            .map(|(k, _)| format!("forbidden environment override: {k}"))
    }

    fn risk_indicators(&self, command: &str, segments: &[SegmentAnalysis]) -> Vec<String> {
        let mut risks = Vec::new();
        for pattern in immediate_deny_patterns() {
            if pattern.regex.is_match(command) {
                risks.push(pattern.name.to_string());
            }
        }
        for pattern in obfuscation_patterns() {
            if pattern.regex.is_match(command) {
                risks.push(pattern.name.to_string());
            }
        }
        if segments.iter().any(|s| !s.satisfied) {
            risks.push("UNSATISFIED_SEGMENT".to_string());
        }
        risks.sort();
        risks.dedup();
        risks
    }

    fn suggestions(&self, risks: &[String]) -> Vec<String> {
        risks
            .iter()
            .map(|r| match r.as_str() {
                "PIPE_TO_SHELL" => {
                    "Avoid piping remote content directly to a shell; download and inspect it first.".to_string()
                }
                "ROOT_RECURSIVE_DELETE" | "RM_RF_WILDCARD" => {
                    "Scope deletions to a specific path instead of root or a wildcard.".to_string()
                }
                "UNSATISFIED_SEGMENT" => {
                    "Add the executable to the agent's allowlist or use a registered safe-bin form.".to_string()
                }
                other => format!("Review the flagged pattern: {other}"),
            })
            .collect()
    }

    /// Evaluates a request against a resolved security triple and an
    /// agent's allowlist patterns. The caller is responsible for
    /// persisting `recordAllowlistUse`/new allowlist entries based on
    /// the returned matches.
    pub fn evaluate(
        &self,
        request: &ExecRequest,
        triple: SecurityTriple,
        allowlist_patterns: &[String],
    ) -> Decision {
        // Every check below is computed up front rather than returned
        // early, so a dry run always reaches the DryRun report instead
        // of short-circuiting to a real Deny.
        let immediate_deny = self.immediate_deny(&request.command);
        let obfuscation_deny = self.obfuscation_deny(&request.command);
        let host_mismatch = request
            .requested_host
            .is_some_and(|requested| requested != triple.host);

        let mut segments = analyze_segments(&request.command, &self.config.path_dirs, allowlist_patterns);
        let mut effective_ask = triple.ask;

        // Sandbox auto-allow: every segment is a safe-bin in a safe
        // context downgrades ask to off for this call only.
        if triple.host == Host::Sandbox
            && triple.security == Security::Allowlist
            && !segments.is_empty()
            && segments.iter().all(|s| s.is_safe_bin)
        {
            effective_ask = Ask::Off;
        }

        let network_violation = self.network_restriction_violation(triple.host, &request.command);
        let host_env_violation = self.host_env_violation(triple.host, &request.env);
        let allowlist_satisfied = !segments.is_empty() && segments.iter().all(|s| s.satisfied);

        if request.dry_run {
            let risks = self.risk_indicators(&request.command, &segments);
            let verdict = if immediate_deny.is_some()
                || obfuscation_deny.is_some()
                || host_mismatch
                || network_violation.is_some()
                || host_env_violation.is_some()
            {
                Verdict::WouldDeny
            } else if matches!(triple.security, Security::Full) || allowlist_satisfied {
                Verdict::WouldAllow
            } else if effective_ask == Ask::Off {
                Verdict::WouldDeny
            } else {
                Verdict::WouldPrompt
            };
            let suggestions = self.suggestions(&risks);
            return self.finish(
                request,
                Decision::DryRun(DryRunReport {
                    verdict,
                    risk_indicators: risks,
                    suggestions,
                    segments,
                }),
            );
        }

        if let Some(name) = immediate_deny {
            return self.finish(request, Decision::Deny {
                reason: format!("immediate-deny: {name}"),
            });
        }
        if let Some(name) = obfuscation_deny {
            return self.finish(request, Decision::Deny {
                reason: format!("obfuscation-deny: {name}"),
            });
        }
        if host_mismatch {
            return self.finish(request, Decision::Deny {
                reason: "host mismatch without elevation".to_string(),
            });
        }
        if let Some(violation) = network_violation {
            return self.finish(request, Decision::Deny { reason: violation });
        }
        if let Some(violation) = host_env_violation {
            return self.finish(request, Decision::Deny { reason: violation });
        }

        match triple.security {
            Security::Deny => self.finish(request, Decision::Deny {
                reason: "security=deny".to_string(),
            }),
            Security::Full => self.finish(request, Decision::Allow {
                auto_approved: true,
                allowlist_matches: Vec::new(),
            }),
            Security::Allowlist => {
                if allowlist_satisfied {
                    let matches = segments
                        .iter()
                        .filter_map(|s| s.allowlist_match.clone())
                        .collect();
                    self.finish(request, Decision::Allow {
                        auto_approved: false,
                        allowlist_matches: matches,
                    })
                } else if effective_ask == Ask::Off {
                    self.finish(request, Decision::Deny {
                        reason: "allowlist miss".to_string(),
                    })
                } else {
                    self.finish(request, Decision::Prompt)
                }
            }
        }
    }

    fn finish(&self, request: &ExecRequest, decision: Decision) -> Decision {
        tracing::debug!(command = %request.command, "policy decision computed");
        decision
    }
}
