//! `openclaw` CLI: the audit-log surface described in the control
//! plane's external interfaces. Everything else (heartbeat scheduling,
//! exec orchestration) is driven programmatically through
//! `openclaw-world`; this binary exposes only the operator-facing audit
//! commands.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use openclaw_audit::{AuditEntry, AuditLog, VerifyReport};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "openclaw", about = "Agentic-assistant control plane CLI")]
struct Cli {
    /// Overrides the audit log path (default: ~/.openclaw/audit/exec-audit.jsonl).
    #[arg(long, global = true, env = "OPENCLAW_AUDIT_PATH")]
    audit_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect, prune, clear, or verify the tamper-evident audit log.
    Audit(AuditCommand),
}

#[derive(Args)]
struct AuditCommand {
    #[command(subcommand)]
    action: Option<AuditAction>,

    /// Show only the last N entries.
    #[arg(long)]
    last: Option<usize>,
    /// Filter commands matching this regex.
    #[arg(long)]
    command: Option<String>,
    /// Show only denied entries.
    #[arg(long, conflicts_with = "allowed")]
    denied: bool,
    /// Show only allowed entries.
    #[arg(long, conflicts_with = "denied")]
    allowed: bool,
    /// Only entries at or after this relative offset, e.g. "1h", "30m", "7d".
    #[arg(long)]
    since: Option<String>,
    /// Filter by agent id.
    #[arg(long)]
    agent: Option<String>,
    /// Filter by host: sandbox, gateway, or node.
    #[arg(long)]
    host: Option<String>,
    /// Emit JSON instead of a human-readable table.
    #[arg(long)]
    json: bool,
    /// Print summary counts instead of individual entries.
    #[arg(long)]
    stats: bool,
}

#[derive(Subcommand)]
enum AuditAction {
    /// Drop entries older than the given number of days and rebuild the chain head.
    Prune {
        #[arg(long)]
        days: i64,
    },
    /// Truncate the audit log entirely.
    Clear,
    /// Verify the hash chain is untampered.
    Verify {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        verbose: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let audit_path = cli.audit_path.unwrap_or_else(default_audit_path);
    match cli.command {
        Command::Audit(audit_cmd) => run_audit(&audit_path, audit_cmd),
    }
}

fn default_audit_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".openclaw").join("audit").join("exec-audit.jsonl")
}

fn run_audit(audit_path: &PathBuf, cmd: AuditCommand) -> Result<()> {
    let log = AuditLog::open(audit_path)
        .with_context(|| format!("opening audit log at {}", audit_path.display()))?;

    match cmd.action {
        Some(AuditAction::Prune { days }) => {
            if days < 0 {
                bail!("--days must be non-negative");
            }
            let cutoff_ms = now_minus_days_ms(days);
            let removed = log.prune(cutoff_ms)?;
            println!("pruned {removed} entries older than {days} day(s)");
            Ok(())
        }
        Some(AuditAction::Clear) => {
            log.clear()?;
            println!("audit log cleared");
            Ok(())
        }
        Some(AuditAction::Verify { json, verbose }) => verify(&log, json, verbose),
        None => query(&log, cmd),
    }
}

fn verify(log: &AuditLog, json: bool, verbose: bool) -> Result<()> {
    let report = log.verify()?;
    if json {
        println!("{}", serde_json::to_string(&VerifyReportJson::from(&report))?);
    } else {
        println!(
            "chain {} ({} entries checked)",
            if report.valid { "valid" } else { "INVALID" },
            report.entries_checked
        );
        if let Some(idx) = report.first_invalid_index {
            if verbose {
                println!("first invalid entry at index {idx}");
            }
        }
    }
    if !report.valid {
        bail!("audit chain verification failed");
    }
    Ok(())
}

#[derive(serde::Serialize)]
struct VerifyReportJson {
    valid: bool,
    entries_checked: usize,
    first_invalid_index: Option<usize>,
}

impl From<&VerifyReport> for VerifyReportJson {
    fn from(r: &VerifyReport) -> Self {
        Self {
            valid: r.valid,
            entries_checked: r.entries_checked,
            first_invalid_index: r.first_invalid_index,
        }
    }
}

fn query(log: &AuditLog, cmd: AuditCommand) -> Result<()> {
    let mut builder = log.query();
    if let Some(n) = cmd.last {
        builder = builder.last(n);
    }
    if let Some(pattern) = &cmd.command {
        builder = builder.command_matching(pattern)?;
    }
    if cmd.denied {
        builder = builder.denied_only();
    }
    if cmd.allowed {
        builder = builder.allowed_only();
    }
    if let Some(since) = &cmd.since {
        builder = builder.since_ms(now_minus_offset_ms(since)?);
    }
    if let Some(agent) = &cmd.agent {
        builder = builder.agent(agent.clone());
    }
    if let Some(host) = &cmd.host {
        builder = builder.host(host.clone());
    }

    let entries = builder.run()?;

    if cmd.stats {
        print_stats(&entries, cmd.json);
        return Ok(());
    }

    if cmd.json {
        println!("{}", serde_json::to_string(&entries)?);
    } else {
        for entry in &entries {
            print_entry_line(entry);
        }
    }
    Ok(())
}

fn print_entry_line(entry: &AuditEntry) {
    println!(
        "{}  {}  {:<7}  {}",
        entry.timestamp,
        &entry.id[..entry.id.len().min(8)],
        decision_label(entry),
        entry.command,
    );
}

fn decision_label(entry: &AuditEntry) -> &str {
    entry.decision.as_str()
}

fn print_stats(entries: &[AuditEntry], json: bool) {
    let total = entries.len();
    let denied = entries.iter().filter(|e| e.decision == "denied").count();
    let allowed = entries.iter().filter(|e| e.decision == "allowed").count();
    let dry_run = total - denied - allowed;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "total": total,
                "allowed": allowed,
                "denied": denied,
                "dry_run": dry_run,
            })
        );
    } else {
        println!("total: {total}");
        println!("allowed: {allowed}");
        println!("denied: {denied}");
        println!("dry-run: {dry_run}");
    }
}

fn now_minus_days_ms(days: i64) -> i64 {
    chrono::Utc::now().timestamp_millis() - days * 86_400_000
}

/// Parses an offset like "1h", "30m", "7d" into an absolute millisecond
/// timestamp relative to now.
fn now_minus_offset_ms(offset: &str) -> Result<i64> {
    let offset = offset.trim();
    if offset.is_empty() {
        bail!("--since requires a value like \"1h\", \"30m\", or \"7d\"");
    }
    let (digits, unit) = offset.split_at(offset.len() - 1);
    let amount: i64 = digits
        .parse()
        .with_context(|| format!("invalid --since value: {offset}"))?;
    let unit_ms = match unit {
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        other => bail!("unknown --since unit '{other}', expected one of s, m, h, d"),
    };
    Ok(chrono::Utc::now().timestamp_millis() - amount * unit_ms)
}
