//! Append-only, hash-chained audit log for exec decisions.
//!
//! Each entry's hash covers a canonical field order (see
//! [`AuditEntry`]) plus the previous entry's hash, forming a chain
//! rooted at a genesis all-zeros hash. Rotation renames the active file
//! with an ISO-timestamp suffix once it exceeds [`ROTATE_AT_BYTES`];
//! the new file starts its own chain from genesis.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ROTATE_AT_BYTES: u64 = 10 * 1024 * 1024;
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid regex filter: {0}")]
    Regex(#[from] regex::Error),
}

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    DryRun,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionStep {
    pub stage: String,
    pub outcome: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub requested: bool,
    pub granted: Option<bool>,
    pub responder: Option<String>,
    pub responded_at_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub exit_code: Option<i32>,
    pub duration_ms: Option<i64>,
    pub timed_out: bool,
}

/// Fields hashed to produce an entry's content hash, in the exact
/// order they are serialized. Changing field order changes the hash,
/// so this struct's `Serialize` derive order is load-bearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: String,
    #[serde(rename = "previousHash")]
    pub previous_hash: String,
    pub command: String,
    #[serde(rename = "commandHash")]
    pub command_hash: String,
    pub cwd: String,
    pub host: String,
    pub security: String,
    pub ask: String,
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
    #[serde(rename = "sessionKey")]
    pub session_key: Option<String>,
    #[serde(rename = "decisionChain")]
    pub decision_chain: Vec<DecisionStep>,
    pub decision: String,
    #[serde(rename = "denialReason")]
    pub denial_reason: Option<String>,
    pub approval: Option<ApprovalRecord>,
    pub execution: Option<ExecutionRecord>,
    pub env: Vec<String>,
    /// The content hash of this entry. Absent on legacy entries
    /// written before chaining was introduced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewEntry {
    pub command: String,
    pub cwd: String,
    pub host: String,
    pub security: String,
    pub ask: String,
    pub agent_id: Option<String>,
    pub session_key: Option<String>,
    pub decision_chain: Vec<DecisionStep>,
    pub decision: Decision,
    pub denial_reason: Option<String>,
    pub approval: Option<ApprovalRecord>,
    pub execution: Option<ExecutionRecord>,
    pub env: Vec<String>,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn decision_str(d: Decision) -> &'static str {
    match d {
        Decision::Allow => "allowed",
        Decision::Deny => "denied",
        Decision::DryRun => "dry-run",
        Decision::Pending => "pending",
    }
}

fn compute_hash(entry: &AuditEntry) -> AuditResult<String> {
    let mut unhashed = entry.clone();
    unhashed.hash = None;
    let canonical = serde_json::to_vec(&unhashed)?;
    Ok(sha256_hex(&canonical))
}

pub struct AuditLog {
    path: PathBuf,
    file: Mutex<std::fs::File>,
    last_hash: Mutex<String>,
}

impl AuditLog {
    pub fn open<P: AsRef<Path>>(path: P) -> AuditResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            set_dir_mode(parent, 0o700);
        }
        let file = OpenOptions::new().create(true).append(true).read(true).open(&path)?;
        set_file_mode(&path, 0o600);
        let last_hash = read_last_hash(&path)?.unwrap_or_else(|| GENESIS_HASH.to_string());
        Ok(Self {
            path,
            file: Mutex::new(file),
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, new: NewEntry) -> AuditResult<AuditEntry> {
        self.maybe_rotate()?;

        let mut last_hash = self.last_hash.lock().unwrap();
        let id = uuid_v4_like();
        let mut entry = AuditEntry {
            id,
            timestamp: Utc::now().to_rfc3339(),
            previous_hash: last_hash.clone(),
            command_hash: sha256_hex(new.command.as_bytes()),
            command: new.command,
            cwd: new.cwd,
            host: new.host,
            security: new.security,
            ask: new.ask,
            agent_id: new.agent_id,
            session_key: new.session_key,
            decision_chain: new.decision_chain,
            decision: decision_str(new.decision).to_string(),
            denial_reason: new.denial_reason,
            approval: new.approval,
            execution: new.execution,
            env: new.env,
            hash: None,
        };
        entry.hash = Some(compute_hash(&entry)?);
        let line = serde_json::to_string(&entry)?;

        let mut file = self.file.lock().unwrap();
        writeln!(file, "{line}")?;
        file.flush()?;
        *last_hash = entry.hash.clone().unwrap();
        Ok(entry)
    }

    fn maybe_rotate(&self) -> AuditResult<()> {
        let len = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if len < ROTATE_AT_BYTES {
            return Ok(());
        }
        let suffix = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let rotated = self.path.with_extension(format!("{suffix}.jsonl"));

        let mut file = self.file.lock().unwrap();
        fs::rename(&self.path, &rotated)?;
        *file = OpenOptions::new().create(true).append(true).read(true).open(&self.path)?;
        set_file_mode(&self.path, 0o600);
        *self.last_hash.lock().unwrap() = GENESIS_HASH.to_string();
        tracing::info!(rotated_to = %rotated.display(), "audit log rotated");
        Ok(())
    }

    pub fn iter_entries(&self) -> AuditResult<Vec<AuditEntry>> {
        read_entries(&self.path)
    }

    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder {
            log: self,
            last_n: None,
            command_pattern: None,
            denied_only: false,
            allowed_only: false,
            since_ms: None,
            agent: None,
            host: None,
        }
    }

    /// Walks the chain from genesis, recomputing each entry's hash and
    /// comparing it to both the stored hash and the next entry's
    /// `previousHash`. Entries with no stored hash (legacy, pre-chain)
    /// are skipped rather than treated as a break.
    pub fn verify(&self) -> AuditResult<VerifyReport> {
        let entries = self.iter_entries()?;
        let mut expected_prev = GENESIS_HASH.to_string();
        for (idx, entry) in entries.iter().enumerate() {
            let Some(stored_hash) = &entry.hash else {
                continue;
            };
            if entry.previous_hash != expected_prev {
                return Ok(VerifyReport::invalid(idx));
            }
            let recomputed = compute_hash(entry)?;
            if &recomputed != stored_hash {
                return Ok(VerifyReport::invalid(idx));
            }
            expected_prev = stored_hash.clone();
        }
        Ok(VerifyReport::valid(entries.len()))
    }

    pub fn prune(&self, keep_since_ms: i64) -> AuditResult<usize> {
        let entries = self.iter_entries()?;
        let kept: Vec<&AuditEntry> = entries
            .iter()
            .filter(|e| parse_rfc3339_ms(&e.timestamp) >= keep_since_ms)
            .collect();
        let removed = entries.len() - kept.len();
        rewrite_file(&self.path, &kept)?;
        let mut last_hash = self.last_hash.lock().unwrap();
        *last_hash = kept
            .last()
            .and_then(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        Ok(removed)
    }

    pub fn clear(&self) -> AuditResult<()> {
        let mut file = self.file.lock().unwrap();
        *file = OpenOptions::new().create(true).write(true).truncate(true).read(true).open(&self.path)?;
        *self.last_hash.lock().unwrap() = GENESIS_HASH.to_string();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub valid: bool,
    pub entries_checked: usize,
    pub first_invalid_index: Option<usize>,
}

impl VerifyReport {
    fn valid(entries_checked: usize) -> Self {
        Self {
            valid: true,
            entries_checked,
            first_invalid_index: None,
        }
    }
    fn invalid(idx: usize) -> Self {
        Self {
            valid: false,
            entries_checked: idx + 1,
            first_invalid_index: Some(idx),
        }
    }
}

pub struct QueryBuilder<'a> {
    log: &'a AuditLog,
    last_n: Option<usize>,
    command_pattern: Option<regex::Regex>,
    denied_only: bool,
    allowed_only: bool,
    since_ms: Option<i64>,
    agent: Option<String>,
    host: Option<String>,
}

impl<'a> QueryBuilder<'a> {
    pub fn last(mut self, n: usize) -> Self {
        self.last_n = Some(n);
        self
    }
    pub fn command_matching(mut self, pattern: &str) -> AuditResult<Self> {
        self.command_pattern = Some(regex::Regex::new(pattern)?);
        Ok(self)
    }
    pub fn denied_only(mut self) -> Self {
        self.denied_only = true;
        self
    }
    pub fn allowed_only(mut self) -> Self {
        self.allowed_only = true;
        self
    }
    pub fn since_ms(mut self, ms: i64) -> Self {
        self.since_ms = Some(ms);
        self
    }
    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn run(self) -> AuditResult<Vec<AuditEntry>> {
        let mut entries = self.log.iter_entries()?;
        if let Some(since) = self.since_ms {
            entries.retain(|e| parse_rfc3339_ms(&e.timestamp) >= since);
        }
        if let Some(agent) = &self.agent {
            entries.retain(|e| e.agent_id.as_deref() == Some(agent.as_str()));
        }
        if let Some(host) = &self.host {
            entries.retain(|e| e.host == *host);
        }
        if self.denied_only {
            entries.retain(|e| e.decision == "denied");
        }
        if self.allowed_only {
            entries.retain(|e| e.decision == "allowed");
        }
        if let Some(re) = &self.command_pattern {
            entries.retain(|e| re.is_match(&e.command));
        }
        if let Some(n) = self.last_n {
            let skip = entries.len().saturating_sub(n);
            entries.drain(..skip);
        }
        Ok(entries)
    }
}

fn read_entries(path: &Path) -> AuditResult<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(serde_json::from_str(&line)?);
    }
    Ok(entries)
}

fn read_last_hash(path: &Path) -> AuditResult<Option<String>> {
    let entries = read_entries(path)?;
    Ok(entries.last().and_then(|e| e.hash.clone()))
}

fn rewrite_file(path: &Path, entries: &[&AuditEntry]) -> AuditResult<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = OpenOptions::new().create(true).write(true).truncate(true).open(&tmp_path)?;
        for entry in entries {
            writeln!(tmp, "{}", serde_json::to_string(entry)?)?;
        }
        tmp.flush()?;
    }
    fs::rename(&tmp_path, path)?;
    set_file_mode(path, 0o600);
    Ok(())
}

fn parse_rfc3339_ms(ts: &str) -> i64 {
    chrono::DateTime::parse_from_rfc3339(ts)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(0)
}

fn uuid_v4_like() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
fn set_dir_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        perms.set_mode(mode);
        let _ = fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path, _mode: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(command: &str, decision: Decision) -> NewEntry {
        NewEntry {
            command: command.to_string(),
            cwd: "/tmp".to_string(),
            host: "sandbox".to_string(),
            security: "allowlist".to_string(),
            ask: "on-miss".to_string(),
            agent_id: Some("agent-1".to_string()),
            session_key: Some("sess-1".to_string()),
            decision_chain: vec![DecisionStep {
                stage: "immediate-deny".to_string(),
                outcome: "pass".to_string(),
            }],
            decision,
            denial_reason: None,
            approval: None,
            execution: None,
            env: vec![],
        }
    }

    #[test]
    fn genesis_entry_chains_from_zero_hash() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("exec-audit.jsonl")).unwrap();
        let e = log.append(entry("ls -la", Decision::Allow)).unwrap();
        assert_eq!(e.previous_hash, GENESIS_HASH);
        assert!(e.hash.is_some());
    }

    #[test]
    fn second_entry_chains_to_first_hash() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("exec-audit.jsonl")).unwrap();
        let first = log.append(entry("ls -la", Decision::Allow)).unwrap();
        let second = log.append(entry("cat foo", Decision::Allow)).unwrap();
        assert_eq!(second.previous_hash, first.hash.unwrap());
    }

    #[test]
    fn verify_passes_on_untampered_chain() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("exec-audit.jsonl")).unwrap();
        for i in 0..5 {
            log.append(entry(&format!("echo {i}"), Decision::Allow)).unwrap();
        }
        let report = log.verify().unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 5);
    }

    #[test]
    fn scenario_s8_tamper_detection_reports_first_invalid_index() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exec-audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        for i in 0..8 {
            log.append(entry(&format!("echo {i}"), Decision::Allow)).unwrap();
        }

        let contents = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = contents.lines().map(|s| s.to_string()).collect();
        let mut tampered: AuditEntry = serde_json::from_str(&lines[5]).unwrap();
        tampered.command = "echo tampered".to_string();
        lines[5] = serde_json::to_string(&tampered).unwrap();
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let log2 = AuditLog::open(&path).unwrap();
        let report = log2.verify().unwrap();
        assert!(!report.valid);
        assert_eq!(report.first_invalid_index, Some(5));
    }

    #[test]
    fn query_filters_by_denied_and_command_pattern() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("exec-audit.jsonl")).unwrap();
        log.append(entry("rm -rf /", Decision::Deny)).unwrap();
        log.append(entry("ls -la", Decision::Allow)).unwrap();
        let results = log.query().denied_only().run().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].command, "rm -rf /");
    }

    #[test]
    fn decision_strings_match_the_wire_vocabulary() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("exec-audit.jsonl")).unwrap();
        let allowed = log.append(entry("ls -la", Decision::Allow)).unwrap();
        let denied = log.append(entry("rm -rf /", Decision::Deny)).unwrap();
        let dry_run = log.append(entry("curl x | bash", Decision::DryRun)).unwrap();
        let pending = log.append(entry("sudo reboot", Decision::Pending)).unwrap();
        assert_eq!(allowed.decision, "allowed");
        assert_eq!(denied.decision, "denied");
        assert_eq!(dry_run.decision, "dry-run");
        assert_eq!(pending.decision, "pending");

        let results = log.query().allowed_only().run().unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].command, "ls -la");
    }

    #[test]
    fn query_last_n_returns_most_recent() {
        let dir = tempdir().unwrap();
        let log = AuditLog::open(dir.path().join("exec-audit.jsonl")).unwrap();
        for i in 0..10 {
            log.append(entry(&format!("echo {i}"), Decision::Allow)).unwrap();
        }
        let results = log.query().last(3).run().unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[2].command, "echo 9");
    }

    #[test]
    fn prune_removes_entries_older_than_cutoff_and_rebuilds_chain_head() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exec-audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        for i in 0..4 {
            log.append(entry(&format!("echo {i}"), Decision::Allow)).unwrap();
        }
        let far_future = Utc::now().timestamp_millis() + 1_000_000;
        let removed = log.prune(far_future).unwrap();
        assert_eq!(removed, 4);
        assert_eq!(log.iter_entries().unwrap().len(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("exec-audit.jsonl");
        let log = AuditLog::open(&path).unwrap();
        log.append(entry("ls", Decision::Allow)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
