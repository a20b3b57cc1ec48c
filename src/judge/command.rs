use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use super::prompt::{build_judge_prompt, classify_failure, parse_judgment};
use super::{JudgeRequest, JudgmentClient, Judgment};
use crate::config::JudgeConfig;
use crate::errors::JudgeError;

/// Runs one external command per judgment, prompt on stdin, answer on stdout.
///
/// The role and sampling temperature are exported to the child as
/// `SYSREV_JUDGE_ROLE` and `SYSREV_JUDGE_TEMPERATURE` so wrapper scripts can
/// route the reviewers to differently configured models.
#[derive(Debug, Clone)]
pub struct CommandJudge {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandJudge {
    pub fn new(command: &str, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.to_string(),
            args,
            timeout,
        }
    }

    pub fn from_config(config: &JudgeConfig) -> Self {
        Self::new(&config.command, config.args.clone(), config.timeout())
    }

    async fn run(&self, request: &JudgeRequest, prompt: &str) -> Result<String, JudgeError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("SYSREV_JUDGE_ROLE", request.role.to_string())
            .env("SYSREV_JUDGE_TEMPERATURE", request.temperature.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| JudgeError::Fatal(format!("failed to spawn '{}': {}", self.command, e)))?;

        let mut stdin = child.stdin.take();
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| JudgeError::Fatal("child stdout unavailable".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| JudgeError::Fatal("child stderr unavailable".into()))?;

        let exchange = async {
            if let Some(mut stdin) = stdin.take() {
                stdin
                    .write_all(prompt.as_bytes())
                    .await
                    .map_err(|e| JudgeError::InvalidResponse(format!("failed to write prompt: {}", e)))?;
                stdin
                    .shutdown()
                    .await
                    .map_err(|e| JudgeError::InvalidResponse(format!("failed to close stdin: {}", e)))?;
            }
            let mut out = String::new();
            let mut err = String::new();
            let (read_out, read_err) =
                tokio::join!(stdout.read_to_string(&mut out), stderr.read_to_string(&mut err));
            read_out.map_err(|e| JudgeError::InvalidResponse(format!("failed to read stdout: {}", e)))?;
            read_err.map_err(|e| JudgeError::InvalidResponse(format!("failed to read stderr: {}", e)))?;
            let status = child
                .wait()
                .await
                .map_err(|e| JudgeError::InvalidResponse(format!("failed to wait for process: {}", e)))?;
            Ok::<_, JudgeError>((status, out, err))
        };

        // On timeout the child is killed when it drops at return.
        let (status, out, err) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| JudgeError::Timeout(self.timeout))??;

        if !status.success() {
            let message = if err.trim().is_empty() { out } else { err };
            let message = format!(
                "exited with code {}: {}",
                status.code().unwrap_or(-1),
                message.trim()
            );
            return Err(classify_failure(&message));
        }
        Ok(out)
    }
}

#[async_trait]
impl JudgmentClient for CommandJudge {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment, JudgeError> {
        let prompt = build_judge_prompt(request);
        debug!(
            item = %request.item.id,
            role = %request.role,
            chars = prompt.len(),
            "Invoking judge"
        );
        let output = self.run(request, &prompt).await?;
        parse_judgment(&output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::judge::JudgeRole;
    use sysrev_common::{Decision, Document, Item, Phase};

    fn request() -> JudgeRequest {
        JudgeRequest {
            topic: "t".into(),
            stage: Phase::Screening,
            item: Item::new("p1", Phase::Screening, Document::titled("A trial")),
            role: JudgeRole::JudgeB,
            criteria: "any".into(),
            temperature: 0.7,
            prior: Vec::new(),
        }
    }

    fn sh(script: &str, timeout: Duration) -> CommandJudge {
        CommandJudge::new("sh", vec!["-c".into(), script.into()], timeout)
    }

    #[tokio::test]
    async fn test_reads_judgment_from_stdout() {
        let judge = sh(
            r#"cat >/dev/null; echo '{"decision":"include","confidence":0.9,"rationale":"ok"}'"#,
            Duration::from_secs(10),
        );
        let judgment = judge.judge(&request()).await.unwrap();
        assert_eq!(judgment.decision, Decision::Include);
    }

    #[tokio::test]
    async fn test_role_and_temperature_are_exported() {
        let judge = sh(
            r#"cat >/dev/null; printf '{"decision":"exclude","confidence":0.5,"rationale":"%s %s"}' "$SYSREV_JUDGE_ROLE" "$SYSREV_JUDGE_TEMPERATURE""#,
            Duration::from_secs(10),
        );
        let judgment = judge.judge(&request()).await.unwrap();
        assert_eq!(judgment.rationale, "judge_b 0.7");
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let judge = CommandJudge::new("/nonexistent/judge-bin", Vec::new(), Duration::from_secs(1));
        assert!(matches!(judge.judge(&request()).await, Err(JudgeError::Fatal(_))));
    }

    #[tokio::test]
    async fn test_slow_judge_times_out() {
        let judge = sh("cat >/dev/null; sleep 5", Duration::from_millis(200));
        assert!(matches!(judge.judge(&request()).await, Err(JudgeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_throttle_exit_is_retryable() {
        let judge = sh("cat >/dev/null; echo 'HTTP 429: rate limit' >&2; exit 1", Duration::from_secs(10));
        let err = judge.judge(&request()).await.unwrap_err();
        assert!(matches!(err, JudgeError::Throttled(_)));
        assert!(err.is_retryable());
    }
}
