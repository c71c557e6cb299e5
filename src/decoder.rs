use std::collections::HashMap;

use chrono::NaiveDateTime;
use thiserror::Error;

use crate::event::{Event, EventKind, JobId, LogSource};

/// Why a line could not be decoded. Malformed lines are skipped, never
/// fatal, but the classification is explicit so anomalies are testable
/// and can be logged at debug level.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no `MM/DD/YYYY HH:MM:SS;` timestamp prefix")]
    BadTimestamp,

    #[error("accounting record has fewer than 3 `;`-separated fields")]
    ShortAccountingRecord,

    #[error("server record has fewer than 5 `;`-separated fields")]
    ShortServerRecord,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` is not an integer")]
    NonNumericField(&'static str),
}

/// Decode one raw log line.
///
/// `Ok(Some(event))` is a lifecycle-relevant line; `Ok(None)` is a
/// well-formed line that carries no lifecycle transition (queued records,
/// non-Job server sections, ...); `Err` is a malformed line.
pub fn decode(source: LogSource, line: &str) -> Result<Option<Event>, DecodeError> {
    let (timestamp, rest) = split_timestamp(line)?;
    match source {
        LogSource::Accounting => decode_accounting(timestamp, rest),
        LogSource::Server => decode_server(timestamp, rest),
    }
}

/// Both log formats open with `MM/DD/YYYY HH:MM:SS;`.
fn split_timestamp(line: &str) -> Result<(NaiveDateTime, &str), DecodeError> {
    let (stamp, rest) = line.split_once(';').ok_or(DecodeError::BadTimestamp)?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, "%m/%d/%Y %H:%M:%S")
        .map_err(|_| DecodeError::BadTimestamp)?;
    Ok((timestamp, rest))
}

/// Accounting record: `<state>;<job_id>;<key=value ...>`.
///
/// Only `S` (job start) and `E` (job end) map to events; the other state
/// chars (Q, D, A, ...) are valid but irrelevant.
fn decode_accounting(
    timestamp: NaiveDateTime,
    rest: &str,
) -> Result<Option<Event>, DecodeError> {
    let mut parts = rest.splitn(3, ';');
    let state = parts.next().ok_or(DecodeError::ShortAccountingRecord)?;
    let raw_id = parts.next().ok_or(DecodeError::ShortAccountingRecord)?;
    let properties = parts.next().ok_or(DecodeError::ShortAccountingRecord)?;

    let kind = match state {
        "S" => {
            let props = parse_properties(properties);
            EventKind::Start {
                user: required(&props, "user")?.to_string(),
                group: required(&props, "group")?.to_string(),
                job_name: required(&props, "jobname")?.to_string(),
            }
        }
        "E" => {
            let props = parse_properties(properties);
            let raw = required(&props, "Exit_status")?;
            let exit_status = raw
                .parse::<i64>()
                .map_err(|_| DecodeError::NonNumericField("Exit_status"))?;
            EventKind::End { exit_status }
        }
        _ => return Ok(None),
    };

    Ok(Some(Event {
        source: LogSource::Accounting,
        timestamp,
        job_id: JobId::parse(raw_id),
        kind,
    }))
}

/// Server record: `<type>;<server>;<section>;<about>;<message>`.
///
/// Only `Job` sections whose message begins with `dequeuing` matter; the
/// message's reported state number is informational, not authoritative.
fn decode_server(timestamp: NaiveDateTime, rest: &str) -> Result<Option<Event>, DecodeError> {
    let mut parts = rest.splitn(5, ';');
    let _log_type = parts.next().ok_or(DecodeError::ShortServerRecord)?;
    let _server = parts.next().ok_or(DecodeError::ShortServerRecord)?;
    let section = parts.next().ok_or(DecodeError::ShortServerRecord)?;
    let about = parts.next().ok_or(DecodeError::ShortServerRecord)?;
    let message = parts.next().ok_or(DecodeError::ShortServerRecord)?;

    if section != "Job" || !message.starts_with("dequeuing") {
        return Ok(None);
    }

    Ok(Some(Event {
        source: LogSource::Server,
        timestamp,
        job_id: JobId::parse(about),
        kind: EventKind::Dequeue,
    }))
}

/// Accounting properties are `key=value` pairs separated by spaces, with
/// some TORQUE builds emitting semicolons between them as well. Tokens
/// without `=` are skipped.
fn parse_properties(s: &str) -> HashMap<&str, &str> {
    s.split(|c| c == ' ' || c == ';')
        .filter_map(|token| token.split_once('='))
        .collect()
}

fn required<'a>(
    props: &HashMap<&str, &'a str>,
    key: &'static str,
) -> Result<&'a str, DecodeError> {
    props.get(key).copied().ok_or(DecodeError::MissingField(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, s)
            .unwrap()
    }

    #[test]
    fn accounting_start_line() {
        let line = "02/26/2015 00:04:50;S;22320.clusterhn.cluster.com;user=alice group=lab jobname=run1 queue=default";
        let event = decode(LogSource::Accounting, line).unwrap().unwrap();
        assert_eq!(event.timestamp, ts(2015, 2, 26, 0, 4, 50));
        assert_eq!(event.job_id.numeric_id, "22320");
        assert_eq!(
            event.kind,
            EventKind::Start {
                user: "alice".to_string(),
                group: "lab".to_string(),
                job_name: "run1".to_string(),
            }
        );
    }

    #[test]
    fn accounting_semicolon_separated_properties() {
        let line = "02/26/2015 00:04:50;S;100.host;user=alice;group=g;jobname=run1";
        let event = decode(LogSource::Accounting, line).unwrap().unwrap();
        assert_eq!(
            event.kind,
            EventKind::Start {
                user: "alice".to_string(),
                group: "g".to_string(),
                job_name: "run1".to_string(),
            }
        );
    }

    #[test]
    fn accounting_end_line() {
        let line = "02/26/2015 03:11:02;E;22320.clusterhn.cluster.com;user=alice group=lab jobname=run1 Exit_status=0 resources_used.walltime=03:06:12";
        let event = decode(LogSource::Accounting, line).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::End { exit_status: 0 });
    }

    #[test]
    fn accounting_negative_exit_status() {
        let line = "02/26/2015 03:11:02;E;5.host;Exit_status=-11";
        let event = decode(LogSource::Accounting, line).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::End { exit_status: -11 });
    }

    #[test]
    fn accounting_queued_line_is_discarded() {
        let line = "02/26/2015 00:04:48;Q;22320.clusterhn.cluster.com;queue=default";
        assert_eq!(decode(LogSource::Accounting, line), Ok(None));
    }

    #[test]
    fn accounting_start_missing_user_is_malformed() {
        let line = "02/26/2015 00:04:50;S;22320.host;group=lab jobname=run1";
        assert_eq!(
            decode(LogSource::Accounting, line),
            Err(DecodeError::MissingField("user"))
        );
    }

    #[test]
    fn accounting_end_with_bad_exit_status_is_malformed() {
        let line = "02/26/2015 03:11:02;E;5.host;Exit_status=oops";
        assert_eq!(
            decode(LogSource::Accounting, line),
            Err(DecodeError::NonNumericField("Exit_status"))
        );
    }

    #[test]
    fn server_dequeue_line() {
        let line = "02/27/2015 00:59:44;0100;PBS_Server.23657;Job;22495[].clusterhn.cluster.com;dequeuing from default, state COMPLETE";
        let event = decode(LogSource::Server, line).unwrap().unwrap();
        assert_eq!(event.timestamp, ts(2015, 2, 27, 0, 59, 44));
        assert_eq!(event.kind, EventKind::Dequeue);
        assert_eq!(event.job_id.numeric_id, "22495");
        assert!(event.job_id.is_array);
        assert!(event.job_id.array_index.is_none());
    }

    #[test]
    fn server_enqueue_line_is_discarded() {
        let line = "02/27/2015 00:59:44;0100;PBS_Server.23657;Job;22495[].clusterhn.cluster.com;enqueuing into default, state 1 hop 1";
        assert_eq!(decode(LogSource::Server, line), Ok(None));
    }

    #[test]
    fn server_non_job_section_is_discarded() {
        let line = "02/27/2015 00:59:44;0002;PBS_Server.23657;Svr;PBS_Server;Torque Server Version = 4.2.10";
        assert_eq!(decode(LogSource::Server, line), Ok(None));
    }

    #[test]
    fn server_message_with_semicolons_survives_split() {
        let line = "02/27/2015 00:59:44;0100;PBS_Server.23657;Job;12.host;dequeuing from default, state COMPLETE; extra";
        let event = decode(LogSource::Server, line).unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Dequeue);
    }

    #[test]
    fn missing_timestamp_is_malformed() {
        assert_eq!(
            decode(LogSource::Accounting, "not a log line"),
            Err(DecodeError::BadTimestamp)
        );
        assert_eq!(
            decode(LogSource::Server, "garbage;S;1.host;user=a"),
            Err(DecodeError::BadTimestamp)
        );
    }

    #[test]
    fn short_server_record_is_malformed() {
        assert_eq!(
            decode(LogSource::Server, "02/27/2015 00:59:44;0100;PBS_Server.23657;Job"),
            Err(DecodeError::ShortServerRecord)
        );
    }
}
