//! ngrok agent process supervision
//!
//! The ngrok agent is started as a child process with the auth token in a
//! private config file. Starting a session is also how a token is checked:
//! the agent either logs an established session or an authentication error.
//!
//! Two kinds of sessions exist:
//! - short-lived check sessions without a web API, used by `check_token`
//! - one serving agent per process, exposing the local API tunnels are
//!   managed through, started on first use with the last accepted token

use crate::AuthError;
use serde::Deserialize;
use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Log message of a session the service accepted
const SESSION_ESTABLISHED: &str = "client session established";

/// ngrok error codes meaning the token itself was refused
const AUTH_ERROR_CODES: &[&str] = &["err_ngrok_105", "err_ngrok_107", "err_ngrok_4018"];

/// Sent only to authenticated accounts that hit their session limit
const SESSION_LIMIT_CODE: &str = "err_ngrok_108";

/// What a single agent log line says about its session
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionEvent {
    /// The service accepted the token
    Accepted,
    /// The service refused the token
    AuthFailed(String),
    /// The agent gave up for another reason
    Failed(String),
}

#[derive(Debug, Deserialize)]
struct LogLine {
    #[serde(default)]
    lvl: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    err: Option<String>,
}

/// Classify one line of agent output; `None` for lines that say nothing
/// about the session
pub(crate) fn classify_log_line(line: &str) -> Option<SessionEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (level, text) = match serde_json::from_str::<LogLine>(line) {
        Ok(log) => {
            if log.msg == SESSION_ESTABLISHED {
                return Some(SessionEvent::Accepted);
            }
            let text = match log.err.as_deref().map(str::trim) {
                Some(err) if !err.is_empty() && err != "<nil>" => format!("{}: {}", log.msg, err),
                _ => log.msg,
            };
            (log.lvl, text)
        }
        // Startup failures are printed before logging is configured
        Err(_) => ("eror".to_string(), line.to_string()),
    };
    if !matches!(level.as_str(), "warn" | "eror" | "crit") {
        return None;
    }

    let lowered = text.to_lowercase();
    if lowered.contains(SESSION_LIMIT_CODE) {
        Some(SessionEvent::Accepted)
    } else if AUTH_ERROR_CODES.iter().any(|code| lowered.contains(code))
        || lowered.contains("authentication failed")
    {
        Some(SessionEvent::AuthFailed(text))
    } else if level == "crit" || lowered.starts_with("error:") {
        Some(SessionEvent::Failed(text))
    } else {
        None
    }
}

/// Agent config file contents; strings are written as JSON, which YAML accepts
fn agent_config(token: &str, web_addr: Option<&str>) -> String {
    let token = serde_json::Value::String(token.to_string());
    let web_addr = match web_addr {
        Some(addr) => serde_json::Value::String(addr.to_string()).to_string(),
        None => "false".to_string(),
    };
    format!(
        "version: \"2\"\nauthtoken: {}\nweb_addr: {}\nlog: stdout\nlog_format: json\nlog_level: info\n",
        token, web_addr
    )
}

/// Why an agent session could not be started
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StartError {
    Rejected(String),
    Failed(String),
}

impl From<StartError> for AuthError {
    fn from(e: StartError) -> Self {
        match e {
            StartError::Rejected(msg) => AuthError::Invalid(msg),
            StartError::Failed(msg) => AuthError::Transport(msg),
        }
    }
}

/// A started agent whose session was accepted
struct Session {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
    _config: tempfile::NamedTempFile,
}

/// The agent serving the local API for this process
struct ServingAgent {
    token: String,
    child: Child,
    /// Set when the agent later reports its token refused
    auth_failure: Arc<Mutex<Option<String>>>,
    drain: JoinHandle<()>,
    _config: tempfile::NamedTempFile,
}

impl ServingAgent {
    fn is_healthy(&mut self) -> bool {
        let running = matches!(self.child.try_wait(), Ok(None));
        let refused = self
            .auth_failure
            .lock()
            .map(|f| f.is_some())
            .unwrap_or(true);
        running && !refused
    }
}

impl Drop for ServingAgent {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

pub struct AgentProcess {
    binary: String,
    web_addr: String,
    startup_timeout: Duration,
    /// Last token the service accepted
    token: Mutex<Option<String>>,
    serving: tokio::sync::Mutex<Option<ServingAgent>>,
}

impl AgentProcess {
    /// `web_addr` is the `host:port` the serving agent's API listens on
    pub fn new(binary: impl Into<String>, web_addr: impl Into<String>, startup_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            web_addr: web_addr.into(),
            startup_timeout,
            token: Mutex::new(None),
            serving: tokio::sync::Mutex::new(None),
        }
    }

    /// Check `token` by opening a session with it.
    ///
    /// A healthy serving agent already running with the same token counts as
    /// accepted without starting another session.
    pub async fn check_token(&self, token: &str) -> Result<(), AuthError> {
        {
            let mut serving = self.serving.lock().await;
            if let Some(agent) = serving.as_mut() {
                if agent.token == token && agent.is_healthy() {
                    return Ok(());
                }
            }
        }

        match self.start_session(token, None).await {
            Ok(session) => drop(session),
            Err(e) => {
                if matches!(e, StartError::Rejected(_)) {
                    self.forget_token(token).await;
                }
                return Err(e.into());
            }
        }

        tracing::debug!("ngrok accepted the auth token");
        if let Ok(mut current) = self.token.lock() {
            *current = Some(token.to_string());
        }
        Ok(())
    }

    /// Make sure the serving agent runs with the last accepted token
    pub async fn ensure_serving(&self) -> Result<(), StartError> {
        let token = self
            .token
            .lock()
            .ok()
            .and_then(|t| t.clone())
            .ok_or_else(|| StartError::Rejected("no ngrok auth token has been accepted".to_string()))?;

        let mut serving = self.serving.lock().await;
        if let Some(agent) = serving.as_mut() {
            if agent.token == token && agent.is_healthy() {
                return Ok(());
            }
            tracing::info!("Restarting the ngrok agent");
        }
        // Stop the old agent before its API address is taken again
        *serving = None;

        let session = match self.start_session(&token, Some(&self.web_addr)).await {
            Ok(session) => session,
            Err(e) => {
                if matches!(e, StartError::Rejected(_)) {
                    if let Ok(mut current) = self.token.lock() {
                        current.take();
                    }
                }
                return Err(e);
            }
        };
        tracing::info!("ngrok agent running, API at {}", self.web_addr);
        *serving = Some(serve(token, session));
        Ok(())
    }

    /// Whether a serving agent has been started and is still running
    pub async fn is_serving(&self) -> bool {
        let mut serving = self.serving.lock().await;
        serving.as_mut().is_some_and(|a| matches!(a.child.try_wait(), Ok(None)))
    }

    async fn forget_token(&self, token: &str) {
        if let Ok(mut current) = self.token.lock() {
            if current.as_deref() == Some(token) {
                current.take();
            }
        }
        let mut serving = self.serving.lock().await;
        if serving.as_ref().is_some_and(|a| a.token == token) {
            tracing::info!("Stopping the ngrok agent: its token was refused");
            *serving = None;
        }
    }

    /// Start an agent and wait for the service to accept or refuse the token
    async fn start_session(&self, token: &str, web_addr: Option<&str>) -> Result<Session, StartError> {
        let mut config = tempfile::Builder::new()
            .prefix("ngext-agent-")
            .suffix(".yml")
            .tempfile()
            .map_err(|e| StartError::Failed(format!("cannot write agent config: {}", e)))?;
        config
            .write_all(agent_config(token, web_addr).as_bytes())
            .map_err(|e| StartError::Failed(format!("cannot write agent config: {}", e)))?;

        let mut child = Command::new(&self.binary)
            .arg("start")
            .arg("--none")
            .arg("--config")
            .arg(config.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StartError::Failed(format!("cannot start '{}': {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StartError::Failed("agent output is not available".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let outcome = tokio::time::timeout(self.startup_timeout, async {
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::trace!("ngrok: {}", line);
                if let Some(event) = classify_log_line(&line) {
                    return Some(event);
                }
            }
            None
        })
        .await;

        match outcome {
            Ok(Some(SessionEvent::Accepted)) => Ok(Session {
                child,
                lines,
                _config: config,
            }),
            Ok(Some(SessionEvent::AuthFailed(msg))) => Err(StartError::Rejected(msg)),
            Ok(Some(SessionEvent::Failed(msg))) => Err(StartError::Failed(msg)),
            Ok(None) => {
                let status = match child.wait().await {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                Err(StartError::Failed(format!("ngrok agent exited ({})", status)))
            }
            Err(_) => Err(StartError::Failed(format!(
                "ngrok agent did not connect within {:?}",
                self.startup_timeout
            ))),
        }
    }
}

/// Keep reading the agent's output so it never blocks on a full pipe, and
/// note a later token refusal
fn serve(token: String, session: Session) -> ServingAgent {
    let Session {
        child,
        mut lines,
        _config,
    } = session;
    let auth_failure = Arc::new(Mutex::new(None));
    let flag = auth_failure.clone();
    let drain = tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            match classify_log_line(&line) {
                Some(SessionEvent::AuthFailed(msg)) => {
                    tracing::warn!("ngrok agent lost its session: {}", msg);
                    if let Ok(mut failure) = flag.lock() {
                        *failure = Some(msg);
                    }
                }
                _ => tracing::trace!("ngrok: {}", line),
            }
        }
    });
    ServingAgent {
        token,
        child,
        auth_failure,
        drain,
        _config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_established_is_accepted() {
        let line = r#"{"addr":"connect.ngrok-agent.com:443","lvl":"info","msg":"client session established","obj":"tunnels.session","t":"2024-05-01T10:00:00Z"}"#;
        assert_eq!(classify_log_line(line), Some(SessionEvent::Accepted));
    }

    #[test]
    fn test_refused_token_is_auth_failure() {
        let line = r#"{"lvl":"eror","msg":"session closing","obj":"tunnels.session","err":"authentication failed: The authtoken you specified does not look like a proper ngrok tunnel authtoken.\n\nERR_NGROK_105\n"}"#;
        match classify_log_line(line) {
            Some(SessionEvent::AuthFailed(msg)) => {
                assert!(msg.starts_with("session closing: authentication failed"));
                assert!(msg.contains("ERR_NGROK_105"));
            }
            other => panic!("expected auth failure, got {:?}", other),
        }

        // Printed on stderr-style plain output before logging starts
        assert!(matches!(
            classify_log_line("ERROR:  authentication failed: Your authtoken was revoked. ERR_NGROK_107"),
            Some(SessionEvent::AuthFailed(_))
        ));
    }

    #[test]
    fn test_session_limit_means_token_accepted() {
        let line = r#"{"lvl":"eror","msg":"failed to reconnect session","err":"Your account is limited to 1 simultaneous ngrok agent sessions.\nERR_NGROK_108"}"#;
        assert_eq!(classify_log_line(line), Some(SessionEvent::Accepted));
    }

    #[test]
    fn test_transient_and_unrelated_lines_are_ignored() {
        let reconnect = r#"{"lvl":"warn","msg":"failed to reconnect session","err":"dial tcp: lookup connect.ngrok-agent.com: no such host"}"#;
        assert_eq!(classify_log_line(reconnect), None);
        let info = r#"{"lvl":"info","msg":"open config file","path":"/tmp/ngext-agent.yml","err":null}"#;
        assert_eq!(classify_log_line(info), None);
        assert_eq!(classify_log_line(""), None);

        let crit = r#"{"lvl":"crit","msg":"command failed","err":"listen tcp 127.0.0.1:4040: bind: address already in use"}"#;
        assert!(matches!(classify_log_line(crit), Some(SessionEvent::Failed(_))));
    }

    #[test]
    fn test_agent_config_quotes_values() {
        let config = agent_config("2abc_DEF", Some("127.0.0.1:4040"));
        assert!(config.contains("authtoken: \"2abc_DEF\"\n"));
        assert!(config.contains("web_addr: \"127.0.0.1:4040\"\n"));
        assert!(config.contains("log: stdout\n"));

        let check = agent_config("tok", None);
        assert!(check.contains("web_addr: false\n"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_transport_error() {
        let agent = AgentProcess::new(
            "/nonexistent/ngext-test-ngrok",
            "127.0.0.1:4040",
            Duration::from_secs(2),
        );
        let err = agent.check_token("tok").await.unwrap_err();
        assert!(matches!(err, AuthError::Transport(_)), "{:?}", err);
        assert!(matches!(
            agent.ensure_serving().await,
            Err(StartError::Rejected(_))
        ));
        assert!(!agent.is_serving().await);
    }
}
