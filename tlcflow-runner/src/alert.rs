//! Retry and failure alerts.
//!
//! Alerts are delivered to the log or to a JSONL outbox that a separate mail
//! relay drains; nothing here speaks SMTP.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tlcflow_core::config::AlertSection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Retry,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub dag_id: String,
    pub run_id: String,
    pub task_id: String,
    pub logical_date: DateTime<Utc>,
    pub attempt: u32,
    pub error: String,
    pub recipients: Vec<String>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn subject(&self) -> String {
        let what = match self.kind {
            AlertKind::Retry => "retrying",
            AlertKind::Failure => "failed",
        };
        format!("[{}] {} {} ({})", self.dag_id, self.task_id, what, self.run_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertPolicy {
    pub emails: Vec<String>,
    pub on_failure: bool,
    pub on_retry: bool,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            emails: Vec::new(),
            on_failure: true,
            on_retry: false,
        }
    }
}

impl From<&AlertSection> for AlertPolicy {
    fn from(section: &AlertSection) -> Self {
        Self {
            emails: section.email.clone(),
            on_failure: section.email_on_failure,
            on_retry: section.email_on_retry,
        }
    }
}

impl AlertPolicy {
    pub fn wants(&self, kind: AlertKind) -> bool {
        match kind {
            AlertKind::Retry => self.on_retry,
            AlertKind::Failure => self.on_failure,
        }
    }
}

pub trait AlertNotifier: Send + Sync {
    fn notify(&self, alert: &Alert) -> io::Result<()>;
}

/// Writes alerts to the tracing log.
pub struct LogNotifier;

impl AlertNotifier for LogNotifier {
    fn notify(&self, alert: &Alert) -> io::Result<()> {
        let recipients = alert.recipients.join(",");
        match alert.kind {
            AlertKind::Failure => tracing::error!(
                recipients = %recipients,
                error = %alert.error,
                attempt = alert.attempt,
                "{}",
                alert.subject()
            ),
            AlertKind::Retry => tracing::warn!(
                recipients = %recipients,
                error = %alert.error,
                attempt = alert.attempt,
                "{}",
                alert.subject()
            ),
        }
        Ok(())
    }
}

/// Appends alerts to a JSONL outbox file.
pub struct OutboxNotifier {
    path: PathBuf,
}

impl OutboxNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AlertNotifier for OutboxNotifier {
    fn notify(&self, alert: &Alert) -> io::Result<()> {
        let json = serde_json::to_string(alert)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{json}")?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn alert(kind: AlertKind) -> Alert {
        let at = Utc.with_ymd_and_hms(2021, 2, 2, 6, 0, 0).unwrap();
        Alert {
            kind,
            dag_id: "dag".into(),
            run_id: "scheduled__x".into(),
            task_id: "download_to_gcs".into(),
            logical_date: at,
            attempt: 3,
            error: "fetch failed".into(),
            recipients: vec!["ops@example.com".into()],
            raised_at: at,
        }
    }

    #[test]
    fn policy_defaults_alert_on_failure_only() {
        let policy = AlertPolicy::from(&AlertSection::default());
        assert!(policy.wants(AlertKind::Failure));
        assert!(!policy.wants(AlertKind::Retry));
    }

    #[test]
    fn outbox_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts/outbox.jsonl");
        let outbox = OutboxNotifier::new(&path);
        outbox.notify(&alert(AlertKind::Retry)).unwrap();
        outbox.notify(&alert(AlertKind::Failure)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let alerts: Vec<Alert> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(alerts, vec![alert(AlertKind::Retry), alert(AlertKind::Failure)]);
    }

    #[test]
    fn subject_names_task_and_run() {
        assert_eq!(
            alert(AlertKind::Failure).subject(),
            "[dag] download_to_gcs failed (scheduled__x)"
        );
    }
}
