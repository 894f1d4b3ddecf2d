//! Subprocess-backed worker invoker
//!
//! Runs one external command per dispatch. The work order is written to the
//! child's stdin as JSON and the role/tier/group are exported as environment
//! variables. The last non-empty stdout line is the status report: either a
//! JSON object with a `status` field plus optional payload fields, or a bare
//! status code such as `PASS`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{InvokeError, ReportPayload, Role, StatusCode, StatusReport, WorkOrder, WorkerInvoker};

/// Invoker that shells out to a worker command
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    program: PathBuf,
    args: Vec<String>,
    envs: HashMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl CommandInvoker {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[async_trait]
impl WorkerInvoker for CommandInvoker {
    async fn dispatch(&self, order: WorkOrder) -> Result<StatusReport, InvokeError> {
        let payload = serde_json::to_vec(&order)?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.envs)
            .env("GROUPFLOW_SESSION", &order.session_id)
            .env("GROUPFLOW_GROUP", &order.group_id)
            .env("GROUPFLOW_ROLE", order.role.to_string())
            .env("GROUPFLOW_TIER", order.tier.to_string())
            .env("GROUPFLOW_ITERATION", order.iteration.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(InvokeError::Spawn)?;

        if let Some(mut stdin) = child.stdin.take() {
            // A worker that ignores stdin may close it early; that is not an error.
            if let Err(e) = stdin.write_all(&payload).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(InvokeError::Io(e));
                }
            }
        }

        let output = child.wait_with_output().await?;
        debug!(
            group = %order.group_id,
            role = %order.role,
            iteration = order.iteration,
            exit = ?output.status.code(),
            "Worker process finished"
        );

        if !output.status.success() {
            return Err(InvokeError::WorkerFailed {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_report(order.role, &String::from_utf8_lossy(&output.stdout))
    }
}

#[derive(Deserialize)]
struct WireReport {
    status: String,
    #[serde(flatten)]
    payload: ReportPayload,
}

/// Parse a worker's stdout into a status report for `role`.
pub fn parse_report(role: Role, stdout: &str) -> Result<StatusReport, InvokeError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .rfind(|l| !l.is_empty())
        .ok_or_else(|| InvokeError::MalformedReport("worker produced no output".to_string()))?;

    if line.starts_with('{') {
        let wire: WireReport = serde_json::from_str(line)
            .map_err(|e| InvokeError::MalformedReport(format!("{}: {}", e, line)))?;
        return Ok(StatusReport {
            role,
            code: StatusCode::parse(role, &wire.status),
            payload: wire.payload,
        });
    }

    Ok(StatusReport::parse(role, line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::Tier;
    use crate::invoker::{
        DefectKind, DispatchContext, DispatchIntent, ReviewerStatus, VerifierStatus,
    };
    use crate::state::WorkCategory;

    fn order(role: Role) -> WorkOrder {
        WorkOrder {
            session_id: "s1".into(),
            group_id: "g1".into(),
            title: "Add parser".into(),
            category: WorkCategory::Implementation,
            role,
            tier: Tier::Base,
            iteration: 3,
            intent: DispatchIntent::Verify,
            context: DispatchContext::default(),
        }
    }

    #[test]
    fn test_parse_bare_code_uses_last_line() {
        let report = parse_report(Role::Verifier, "running tests...\nall good\n\nPASS\n").unwrap();
        assert_eq!(report.code, StatusCode::Verifier(VerifierStatus::Pass));
    }

    #[test]
    fn test_parse_json_report_with_payload() {
        let stdout = serde_json::json!({
            "status": "CHANGES_REQUESTED",
            "defect_kind": "verification",
            "findings": ["no test for empty input"],
        })
        .to_string();
        let report = parse_report(Role::Reviewer, &stdout).unwrap();
        assert_eq!(
            report.code,
            StatusCode::Reviewer(ReviewerStatus::ChangesRequested)
        );
        assert_eq!(report.payload.defect_kind, Some(DefectKind::Verification));
        assert_eq!(report.payload.findings.len(), 1);
    }

    #[test]
    fn test_parse_empty_output_is_malformed() {
        assert!(matches!(
            parse_report(Role::Implementer, "\n  \n"),
            Err(InvokeError::MalformedReport(_))
        ));
    }

    #[test]
    fn test_parse_unexpected_code_is_unknown() {
        let report = parse_report(Role::Verifier, "LGTM").unwrap();
        assert_eq!(report.code, StatusCode::Unknown("LGTM".into()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_invoker_reads_role_from_env() {
        let script = r#"cat > /dev/null
if [ "$GROUPFLOW_ROLE" = verifier ]; then echo PASS; else echo FAIL; fi"#;
        let invoker = CommandInvoker::new("sh").arg("-c").arg(script);
        let report = invoker.dispatch(order(Role::Verifier)).await.unwrap();
        assert_eq!(report.code, StatusCode::Verifier(VerifierStatus::Pass));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_invoker_nonzero_exit_is_error() {
        let invoker = CommandInvoker::new("sh").args(["-c", "echo boom >&2; exit 3"]);
        let err = invoker.dispatch(order(Role::Verifier)).await.unwrap_err();
        match err {
            InvokeError::WorkerFailed { code, stderr } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
