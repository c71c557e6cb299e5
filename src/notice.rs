use chrono::Duration;

/// How a lifecycle notice should be presented downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Informational (job started).
    Info,
    /// Successful completion.
    Good,
    /// Failed completion.
    Danger,
}

/// One job-state transition, destined for external delivery. The core emits
/// at most one per transition and preserves emission order; delivery is the
/// transport's problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleNotice {
    pub severity: Severity,
    pub title: String,
    pub body: Option<String>,
}

/// Outcome of a finished job, computed by the correlator at dequeue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalStatus {
    pub success: bool,
    pub fail_count: usize,
    /// Known array members (0 for plain jobs).
    pub member_count: usize,
    /// Reported exit code; `None` when failing array members disagree.
    pub exit_code: Option<i64>,
    pub elapsed: Duration,
}

/// Render the "job started" notice.
pub fn started_notice(user: &str, display_id: &str, job_name: &str) -> LifecycleNotice {
    LifecycleNotice {
        severity: Severity::Info,
        title: format!("{}: Job {} ({}) is now running", user, display_id, job_name),
        body: None,
    }
}

/// Render the "job finished" notice.
pub fn finished_notice(
    user: &str,
    display_id: &str,
    job_name: &str,
    status: &FinalStatus,
) -> LifecycleNotice {
    let elapsed = format_elapsed(status.elapsed);

    let exit_text = match status.exit_code {
        Some(code) => format!("exit {}", code),
        None => "unknown exit code".to_string(),
    };

    let title = format!(
        "{}: Job {} ({}) has finished in {}, {}",
        user, display_id, job_name, elapsed, exit_text
    );

    let mut lines = Vec::new();
    if !status.success && status.member_count > 0 {
        lines.push(format!(
            "{} of {} tasks failed",
            status.fail_count, status.member_count
        ));
    }
    if let Some(reason) = status.exit_code.and_then(exit_reason) {
        lines.push(reason);
    }

    LifecycleNotice {
        severity: if status.success {
            Severity::Good
        } else {
            Severity::Danger
        },
        title,
        body: if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        },
    }
}

/// Human-readable reason for a scheduler exit code, when one exists.
///
/// Negative codes are TORQUE's internal `JOB_EXEC_*` failures; codes above
/// 256 mean the job was killed by signal `code - 256`. Everything else is a
/// plain program exit status with no extra text.
pub fn exit_reason(code: i64) -> Option<String> {
    let reason = match code {
        -1 => "Job execution failed before files were staged in",
        -2 => "Job execution failed after files were staged in",
        -3 => "Job execution failed; job will be retried",
        -4 => "Job aborted on MOM initialization",
        -5 => "Job aborted on MOM initialization, checkpoint, no migrate",
        -6 => "Job aborted on MOM initialization, checkpoint, ok migrate",
        -7 => "Job restart failed",
        -8 => "Exec() of user command failed",
        -9 => "Could not create/open stdout/stderr files",
        -10 => "Job exceeded a memory limit",
        -11 => "Job exceeded a walltime limit",
        -12 => "Job exceeded a CPU time limit",
        _ if code > 256 => {
            return Some(format!("Job was killed by {}", signal_name(code - 256)));
        }
        _ => return None,
    };
    Some(reason.to_string())
}

/// Standard Linux signal names for the 1..=31 range.
fn signal_name(signal: i64) -> String {
    let name = match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        5 => "SIGTRAP",
        6 => "SIGABRT",
        7 => "SIGBUS",
        8 => "SIGFPE",
        9 => "SIGKILL",
        10 => "SIGUSR1",
        11 => "SIGSEGV",
        12 => "SIGUSR2",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        16 => "SIGSTKFLT",
        17 => "SIGCHLD",
        18 => "SIGCONT",
        19 => "SIGSTOP",
        20 => "SIGTSTP",
        21 => "SIGTTIN",
        22 => "SIGTTOU",
        23 => "SIGURG",
        24 => "SIGXCPU",
        25 => "SIGXFSZ",
        26 => "SIGVTALRM",
        27 => "SIGPROF",
        28 => "SIGWINCH",
        29 => "SIGIO",
        30 => "SIGPWR",
        31 => "SIGSYS",
        _ => return format!("signal {}", signal),
    };
    name.to_string()
}

/// Render an elapsed duration as `1d 2h 03m 04s`, omitting leading zero
/// units. Negative durations (clock skew between log files) clamp to `0s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{}d {}h {:02}m {:02}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
