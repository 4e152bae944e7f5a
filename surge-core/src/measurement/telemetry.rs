//! Telemetry report built from a finished (or aborted) session.

use serde_json::{Value, json};
use uuid::Uuid;

use crate::network::Transport;
use crate::session::{SessionState, SharedSession, TestSettings};

/// Form payload posted to the telemetry collector.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReport {
    /// JSON of the client identifier and raw ISP info
    pub ispinfo: String,
    pub dl: String,
    pub ul: String,
    pub ping: String,
    pub jitter: String,
    /// Diagnostic log, empty unless the level includes it
    pub log: String,
    pub extra: String,
    pub report_id: Uuid,
}

impl TelemetryReport {
    /// Builds a report from the current session state.
    pub fn from_session(state: &SessionState, settings: &TestSettings) -> Self {
        let ispinfo = json!({
            "processedString": state.client_ip,
            "rawIspInfo": state.isp_info.clone().unwrap_or(Value::String(String::new())),
        });
        Self {
            ispinfo: ispinfo.to_string(),
            dl: state.download.to_string(),
            ul: state.upload.to_string(),
            ping: state.ping.to_string(),
            jitter: state.jitter.to_string(),
            log: if settings.telemetry_level.includes_log() {
                state.log.as_str().to_string()
            } else {
                String::new()
            },
            extra: settings.telemetry_extra.clone(),
            report_id: Uuid::new_v4(),
        }
    }

    /// Form fields in submission order.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ispinfo", self.ispinfo.clone()),
            ("dl", self.dl.clone()),
            ("ul", self.ul.clone()),
            ("ping", self.ping.clone()),
            ("jitter", self.jitter.clone()),
            ("log", self.log.clone()),
            ("extra", self.extra.clone()),
            ("report_id", self.report_id.to_string()),
        ]
    }
}

/// Extracts the test id from a collector response of the form `id <n>`.
pub fn parse_test_id(body: &str) -> Option<String> {
    let mut parts = body.trim().split(' ');
    if parts.next()? != "id" {
        return None;
    }
    parts
        .next()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|id| id.to_string())
}

/// Submits the session's report and returns the assigned test id.
///
/// Failures are logged and yield `None`.
pub async fn submit(
    transport: &dyn Transport,
    settings: &TestSettings,
    session: &SharedSession,
) -> Option<String> {
    let report = session.read(|state| TelemetryReport::from_session(state, settings));
    submit_report(transport, settings, session, &report).await
}

/// Submits an already built report, e.g. one captured before an abort
/// cleared the session's results.
pub async fn submit_report(
    transport: &dyn Transport,
    settings: &TestSettings,
    session: &SharedSession,
    report: &TelemetryReport,
) -> Option<String> {
    tracing::debug!("Submitting telemetry report {}", report.report_id);

    match transport
        .submit_telemetry(&settings.endpoints.telemetry, report)
        .await
    {
        Ok(body) => {
            let id = parse_test_id(&body);
            if id.is_none() {
                tracing::debug!("Telemetry response carried no test id: {:?}", body);
            }
            id
        }
        Err(error) => {
            session.warn(&format!("telemetry submission failed: {error}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::Measurement;
    use crate::session::TelemetryLevel;

    #[test]
    fn test_parse_test_id() {
        assert_eq!(parse_test_id("id 42"), Some("42".to_string()));
        assert_eq!(parse_test_id("id 42\n"), Some("42".to_string()));
        assert_eq!(parse_test_id("id abc"), None);
        assert_eq!(parse_test_id("error"), None);
        assert_eq!(parse_test_id(""), None);
    }

    #[test]
    fn test_report_from_session() {
        let mut state = SessionState::default();
        state.download = Measurement::Value(93.5);
        state.upload = Measurement::Fail;
        state.client_ip = "192.0.2.1".to_string();
        state.log.record("dlTest");

        let mut settings = TestSettings {
            telemetry_level: TelemetryLevel::Basic,
            telemetry_extra: "lab".to_string(),
            ..TestSettings::default()
        };
        let basic = TelemetryReport::from_session(&state, &settings);
        assert_eq!(basic.dl, "93.50");
        assert_eq!(basic.ul, "Fail");
        assert_eq!(basic.ping, "");
        assert_eq!(basic.log, "");
        assert_eq!(basic.extra, "lab");
        let ispinfo: Value = serde_json::from_str(&basic.ispinfo).unwrap();
        assert_eq!(ispinfo["processedString"], "192.0.2.1");
        assert_eq!(ispinfo["rawIspInfo"], "");

        settings.telemetry_level = TelemetryLevel::Full;
        let full = TelemetryReport::from_session(&state, &settings);
        assert!(full.log.contains("dlTest"));
        assert_ne!(full.report_id, basic.report_id);
        assert_eq!(full.form_fields().len(), 8);
    }
}
