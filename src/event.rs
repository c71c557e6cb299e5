use chrono::NaiveDateTime;

/// Which scheduler log a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Accounting,
    Server,
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogSource::Accounting => write!(f, "accounting"),
            LogSource::Server => write!(f, "server"),
        }
    }
}

/// Parsed scheduler job identity.
///
/// Raw ids look like `100.hostname`, `123[4].hostname` (array member) or
/// `123[]` (the server log's aggregate array marker). Two raw ids with the
/// same numeric part refer to the same logical job regardless of array
/// qualification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobId {
    pub numeric_id: String,
    pub is_array: bool,
    /// Specific array member index; `None` for non-array jobs and for the
    /// aggregate `N[]` marker.
    pub array_index: Option<String>,
}

impl JobId {
    /// Normalize a raw scheduler id. The host suffix (everything from the
    /// first `.`) is dropped; an array qualifier `[idx]` or `[]` on the
    /// remaining part marks the job as an array job.
    pub fn parse(raw: &str) -> JobId {
        let local = raw.split('.').next().unwrap_or(raw);

        if let Some(open) = local.find('[') {
            if local.ends_with(']') {
                let numeric = &local[..open];
                let index = &local[open + 1..local.len() - 1];
                if !numeric.is_empty() && numeric.bytes().all(|b| b.is_ascii_digit()) {
                    return JobId {
                        numeric_id: numeric.to_string(),
                        is_array: true,
                        array_index: if index.is_empty() {
                            None
                        } else {
                            Some(index.to_string())
                        },
                    };
                }
            }
        }

        JobId {
            numeric_id: local.to_string(),
            is_array: false,
            array_index: None,
        }
    }

    /// Display form: the numeric id, with `[]` appended for array jobs.
    pub fn display_id(&self) -> String {
        if self.is_array {
            format!("{}[]", self.numeric_id)
        } else {
            self.numeric_id.clone()
        }
    }
}

/// Payload of a decoded log line, discriminated by lifecycle kind.
///
/// Lines that map to no lifecycle transition never construct an Event;
/// they are discarded at decode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Start {
        user: String,
        group: String,
        job_name: String,
    },
    End {
        exit_status: i64,
    },
    Dequeue,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::Start { .. } => "start",
            EventKind::End { .. } => "end",
            EventKind::Dequeue => "dequeue",
        }
    }
}

/// One decoded log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub source: LogSource,
    pub timestamp: NaiveDateTime,
    pub job_id: JobId,
    pub kind: EventKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_id_with_host() {
        let id = JobId::parse("100.clusterhn.cluster.com");
        assert_eq!(id.numeric_id, "100");
        assert!(!id.is_array);
        assert!(id.array_index.is_none());
        assert_eq!(id.display_id(), "100");
    }

    #[test]
    fn array_member_id() {
        let id = JobId::parse("22495[4].clusterhn.cluster.com");
        assert_eq!(id.numeric_id, "22495");
        assert!(id.is_array);
        assert_eq!(id.array_index.as_deref(), Some("4"));
        assert_eq!(id.display_id(), "22495[]");
    }

    #[test]
    fn aggregate_array_marker() {
        let id = JobId::parse("22495[].clusterhn.cluster.com");
        assert_eq!(id.numeric_id, "22495");
        assert!(id.is_array);
        assert!(id.array_index.is_none());
    }

    #[test]
    fn same_logical_job_across_qualifiers() {
        let member = JobId::parse("7[12].host");
        let aggregate = JobId::parse("7[].host");
        let plain = JobId::parse("7.host");
        assert_eq!(member.numeric_id, aggregate.numeric_id);
        assert_eq!(member.numeric_id, plain.numeric_id);
    }

    #[test]
    fn non_numeric_prefix_is_not_an_array() {
        let id = JobId::parse("interactive[3].host");
        assert!(!id.is_array);
        assert_eq!(id.numeric_id, "interactive[3]");
    }
}
