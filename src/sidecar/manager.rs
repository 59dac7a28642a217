//! Sidecar process lifecycle.
//!
//! One supervisor task owns the spawned child and clears the tracked handle
//! when it exits. The health loop is a separate task holding only a weak
//! reference; it is aborted before any stop so it can never restart a
//! service mid-shutdown.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use super::rpc::{RawResponse, RpcRequest};
use super::transform::{payload_text, unwrap_payload};
use super::{
    ConnectionReport, LoginStatus, ReqwestSidecarTransport, ServiceControl, ServiceError, ServiceStatus,
    SidecarTransport, TransportError,
};
use crate::config::SidecarConfig;

const LOG_TARGET: &str = "xhs_bridge::sidecar";

struct TrackedProcess {
    pid: Option<u32>,
    kill: Option<oneshot::Sender<()>>,
    supervisor: JoinHandle<()>,
}

struct Inner {
    config: SidecarConfig,
    transport: Arc<dyn SidecarTransport>,
    process: Mutex<Option<TrackedProcess>>,
    health_loop: Mutex<Option<JoinHandle<()>>>,
    lifecycle: AsyncMutex<()>,
}

impl Inner {
    fn process(&self) -> MutexGuard<'_, Option<TrackedProcess>> {
        self.process.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn health_loop(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.health_loop.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn forget_process(&self, pid: Option<u32>) {
        let mut slot = self.process();
        if slot.as_ref().is_some_and(|tracked| tracked.pid == pid) {
            slot.take();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.health_loop().take() {
            handle.abort();
        }
    }
}

/// Owns the sidecar child process and its health loop.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

impl ServiceManager {
    pub fn new(config: SidecarConfig, transport: Arc<dyn SidecarTransport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                process: Mutex::new(None),
                health_loop: Mutex::new(None),
                lifecycle: AsyncMutex::new(()),
            }),
        }
    }

    /// Manager talking to the sidecar over reqwest.
    pub fn from_config(config: SidecarConfig, request_timeout: Duration) -> Result<Self, TransportError> {
        let transport = ReqwestSidecarTransport::new(&config, request_timeout)?;
        Ok(Self::new(config, Arc::new(transport)))
    }

    pub fn config(&self) -> &SidecarConfig {
        &self.inner.config
    }

    /// Pid of the tracked child, if this manager spawned one that is alive.
    pub fn pid(&self) -> Option<u32> {
        self.inner.process().as_ref().and_then(|tracked| tracked.pid)
    }

    fn has_process(&self) -> bool {
        self.inner.process().is_some()
    }

    pub fn is_health_loop_active(&self) -> bool {
        self.inner
            .health_loop()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Polls the health endpoint once. Never fails.
    pub async fn get_service_status(&self) -> ServiceStatus {
        let pid = self.pid();
        let limit = self.inner.config.status_timeout();
        match timeout(limit, self.inner.transport.health()).await {
            Ok(Ok(response)) if response.is_success() => parse_health(&response, pid),
            Ok(Ok(response)) => ServiceStatus::rejected(&response, pid),
            Ok(Err(err)) => ServiceStatus::unavailable(err.to_string(), pid),
            Err(_) => ServiceStatus::unavailable(
                format!("health check timed out after {}ms", limit.as_millis()),
                pid,
            ),
        }
    }

    /// Starts the sidecar unless it already answers its health check, with
    /// any status.
    pub async fn start_service(&self) -> Result<(), ServiceError> {
        let _guard = self.inner.lifecycle.lock().await;
        if self.get_service_status().await.running {
            log::info!("sidecar already running at {}", self.inner.config.base_url());
            return Ok(());
        }
        self.launch_and_wait().await?;
        self.spawn_health_loop();
        Ok(())
    }

    /// Stops the health loop, then the process: SIGTERM, grace period, kill.
    pub async fn stop_service(&self) -> Result<(), ServiceError> {
        self.abort_health_loop();
        let _guard = self.inner.lifecycle.lock().await;
        self.terminate_process().await
    }

    pub async fn restart_service(&self) -> Result<(), ServiceError> {
        log::info!("restarting sidecar");
        self.stop_service().await?;
        sleep(self.inner.config.restart_delay()).await;
        self.start_service().await
    }

    /// Alias of [`Self::stop_service`] for application teardown.
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.stop_service().await
    }

    async fn launch_and_wait(&self) -> Result<(), ServiceError> {
        self.launch().await?;
        if let Err(err) = self.wait_until_healthy().await {
            log::error!("sidecar failed to start: {err}");
            if let Err(stop_err) = self.terminate_process().await {
                log::warn!("failed to clean up sidecar after startup failure: {stop_err}");
            }
            return Err(err);
        }
        log::info!("sidecar healthy at {}", self.inner.config.base_url());
        Ok(())
    }

    async fn launch(&self) -> Result<(), ServiceError> {
        let config = &self.inner.config;
        let executable = tokio::fs::canonicalize(&config.executable)
            .await
            .map_err(|_| ServiceError::ExecutableMissing(config.executable.clone()))?;

        let mut child = Command::new(&executable)
            .args(config.spawn_args())
            .current_dir(config.resolved_working_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ServiceError::Spawn)?;

        let pid = child.id();
        log::info!(
            "spawned sidecar {} (pid {:?}) on port {}",
            executable.display(),
            pid,
            config.port
        );
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, log::Level::Info);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, log::Level::Warn);
        }

        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let supervisor = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => log::info!(target: LOG_TARGET, "sidecar exited: {status}"),
                    Err(err) => log::warn!(target: LOG_TARGET, "failed to wait on sidecar: {err}"),
                },
                // A dropped sender also lands here, so the child never outlives its manager.
                _ = kill_rx => match child.kill().await {
                    Ok(()) => log::warn!(target: LOG_TARGET, "sidecar killed"),
                    Err(err) => log::error!(target: LOG_TARGET, "failed to kill sidecar: {err}"),
                },
            }
            if let Some(inner) = weak.upgrade() {
                inner.forget_process(pid);
            }
        });

        *self.inner.process() = Some(TrackedProcess {
            pid,
            kill: Some(kill_tx),
            supervisor,
        });
        Ok(())
    }

    async fn wait_until_healthy(&self) -> Result<(), ServiceError> {
        let config = &self.inner.config;
        let deadline = Instant::now() + config.startup_timeout();
        loop {
            if self.get_service_status().await.healthy {
                return Ok(());
            }
            if !self.has_process() {
                return Err(ServiceError::ExitedDuringStartup);
            }
            if Instant::now() >= deadline {
                return Err(ServiceError::StartupTimeout(config.startup_timeout()));
            }
            sleep(config.startup_poll_interval()).await;
        }
    }

    async fn terminate_process(&self) -> Result<(), ServiceError> {
        let taken = self.inner.process().take();
        let Some(mut tracked) = taken else {
            log::debug!("no tracked sidecar process to stop");
            return Ok(());
        };

        let grace = self.inner.config.stop_grace();
        if request_termination(tracked.pid) {
            if timeout(grace, &mut tracked.supervisor).await.is_ok() {
                log::info!("sidecar stopped gracefully");
                return Ok(());
            }
            log::warn!("sidecar ignored SIGTERM for {}ms, killing", grace.as_millis());
        }

        if let Some(kill) = tracked.kill.take() {
            let _ = kill.send(());
        }
        match timeout(grace, &mut tracked.supervisor).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracked.supervisor.abort();
                Err(ServiceError::Stop(format!(
                    "process {:?} did not exit after kill",
                    tracked.pid
                )))
            }
        }
    }

    fn abort_health_loop(&self) {
        if let Some(handle) = self.inner.health_loop().take() {
            handle.abort();
            log::debug!("sidecar health loop stopped");
        }
    }

    fn spawn_health_loop(&self) {
        let mut slot = self.inner.health_loop();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.config.health_check_interval();
        *slot = Some(tokio::spawn(async move {
            loop {
                sleep(interval).await;
                let Some(inner) = weak.upgrade() else { break };
                let manager = ServiceManager { inner };
                let status = manager.get_service_status().await;
                if status.healthy {
                    continue;
                }
                // A process that still answers is throttled or degraded, not gone.
                if status.running {
                    log::warn!(
                        "sidecar answered health check with HTTP {:?}",
                        status.http_status
                    );
                    continue;
                }
                log::warn!(
                    "sidecar health check failed ({}), restarting",
                    status.last_error.as_deref().unwrap_or("unhealthy")
                );
                if let Err(err) = manager.relaunch().await {
                    log::error!("automatic sidecar restart failed: {err}");
                }
            }
        }));
    }

    /// Restart path used from inside the health loop, which must not abort
    /// itself.
    async fn relaunch(&self) -> Result<(), ServiceError> {
        let _guard = self.inner.lifecycle.lock().await;
        self.terminate_process().await?;
        sleep(self.inner.config.restart_delay()).await;
        self.launch_and_wait().await
    }

    /// Login state as reported by the sidecar's `check_login_status` tool.
    pub async fn check_login_status(&self) -> Result<LoginStatus, ServiceError> {
        let value = self.rpc(&RpcRequest::check_login_status()).await?;
        Ok(login_from_payload(&value))
    }

    /// Issues `initialize` and reports how many capabilities the sidecar
    /// advertises. Never fails.
    pub async fn test_connection(&self) -> ConnectionReport {
        match self.rpc(&RpcRequest::initialize()).await {
            Ok(result) => {
                let capabilities = result
                    .get("capabilities")
                    .and_then(Value::as_object)
                    .map(|caps| caps.len())
                    .unwrap_or(0);
                ConnectionReport {
                    success: true,
                    capabilities,
                    message: format!("protocol handshake succeeded, {capabilities} capabilities"),
                }
            }
            Err(err) => ConnectionReport {
                success: false,
                capabilities: 0,
                message: format!("protocol handshake failed: {err}"),
            },
        }
    }

    async fn rpc(&self, request: &RpcRequest) -> Result<Value, ServiceError> {
        let response = self.inner.transport.call(request).await?;
        if !response.is_success() {
            return Err(ServiceError::Http(response.status));
        }
        let envelope = response
            .rpc()
            .map_err(|err| ServiceError::InvalidResponse(err.to_string()))?;
        Ok(envelope.into_result()?)
    }

    pub fn log_path(&self) -> PathBuf {
        self.inner
            .config
            .resolved_working_dir()
            .join("logs")
            .join("service.log")
    }

    /// Last `lines` non-empty lines of the sidecar's log file.
    pub async fn service_logs(&self, lines: usize) -> Result<Vec<String>, ServiceError> {
        let path = self.log_path();
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ServiceError::Logs { path, source })?;
        let kept: Vec<&str> = content.lines().filter(|line| !line.trim().is_empty()).collect();
        let start = kept.len().saturating_sub(lines);
        Ok(kept[start..].iter().map(|line| line.to_string()).collect())
    }
}

#[async_trait]
impl ServiceControl for ServiceManager {
    async fn service_status(&self) -> ServiceStatus {
        self.get_service_status().await
    }

    async fn ensure_running(&self) -> Result<(), ServiceError> {
        self.start_service().await
    }
}

fn forward_output<R>(stream: R, level: log::Level)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log::log!(target: LOG_TARGET, level, "{line}");
        }
    });
}

#[cfg(unix)]
fn request_termination(pid: Option<u32>) -> bool {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return false;
    };
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("failed to send SIGTERM to sidecar {pid}: {err}");
            false
        }
    }
}

#[cfg(not(unix))]
fn request_termination(_pid: Option<u32>) -> bool {
    false
}

fn parse_health(response: &RawResponse, pid: Option<u32>) -> ServiceStatus {
    let body = response.json().unwrap_or(Value::Null);
    let logged_in = ["loginStatus", "loggedIn", "logged_in"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_bool))
        .unwrap_or(false);
    let version = body
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string);
    let uptime = body.get("uptime").and_then(|value| match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    ServiceStatus {
        running: true,
        healthy: true,
        logged_in,
        version,
        uptime,
        pid,
        last_error: None,
        http_status: Some(response.status),
        health_body: None,
    }
}

fn login_from_payload(value: &Value) -> LoginStatus {
    let payload = unwrap_payload(value);
    let flag = ["is_logged_in", "isLoggedIn", "logged_in", "loggedIn", "loginStatus"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_bool));
    if let Some(logged_in) = flag {
        let username = payload
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let message = if logged_in {
            format!("logged in as {username}")
        } else {
            "not logged in, run the sidecar login tool first".to_string()
        };
        return LoginStatus { logged_in, message };
    }

    match payload_text(&payload) {
        Some(text) => {
            let lower = text.to_lowercase();
            let logged_out = text.contains("未登录") || lower.contains("not logged in");
            let logged_in = !logged_out && (text.contains("已登录") || lower.contains("logged in"));
            LoginStatus {
                logged_in,
                message: text,
            }
        }
        None => LoginStatus {
            logged_in: false,
            message: "unrecognized login status payload".into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Health answers are popped from `script`; `default` applies once drained.
    struct ScriptedTransport {
        script: Mutex<VecDeque<bool>>,
        default: bool,
        hang: bool,
        rpc_body: String,
    }

    impl ScriptedTransport {
        fn healthy(default: bool) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                default,
                hang: false,
                rpc_body: String::new(),
            }
        }

        fn push(&self, healthy: bool) {
            self.script.lock().unwrap().push_back(healthy);
        }
    }

    #[async_trait]
    impl SidecarTransport for ScriptedTransport {
        async fn call(&self, _request: &RpcRequest) -> Result<RawResponse, TransportError> {
            Ok(RawResponse::new(200, self.rpc_body.clone()))
        }

        async fn health(&self) -> Result<RawResponse, TransportError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            let healthy = self.script.lock().unwrap().pop_front().unwrap_or(self.default);
            if healthy {
                Ok(RawResponse::new(
                    200,
                    r#"{"loginStatus":true,"version":"1.2.0","uptime":42}"#,
                ))
            } else {
                Err(TransportError::Connect {
                    url: "http://localhost:18060/health".into(),
                    message: "connection refused".into(),
                })
            }
        }
    }

    fn fast_config() -> SidecarConfig {
        SidecarConfig {
            startup_timeout_ms: 2_000,
            startup_poll_interval_ms: 20,
            health_check_interval_ms: 50,
            status_timeout_ms: 100,
            stop_grace_ms: 300,
            restart_delay_ms: 10,
            ..SidecarConfig::default()
        }
    }

    #[tokio::test]
    async fn status_parses_health_payload() {
        let manager = ServiceManager::new(fast_config(), Arc::new(ScriptedTransport::healthy(true)));
        let status = manager.get_service_status().await;
        assert!(status.running && status.healthy && status.logged_in);
        assert_eq!(status.version.as_deref(), Some("1.2.0"));
        assert_eq!(status.uptime.as_deref(), Some("42"));
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn status_never_fails() {
        let down = ServiceManager::new(fast_config(), Arc::new(ScriptedTransport::healthy(false)));
        let status = down.get_service_status().await;
        assert!(!status.running);
        assert!(status.last_error.unwrap().contains("connection refused"));

        let hanging = ScriptedTransport {
            hang: true,
            ..ScriptedTransport::healthy(true)
        };
        let manager = ServiceManager::new(fast_config(), Arc::new(hanging));
        let started = std::time::Instant::now();
        let status = manager.get_service_status().await;
        assert!(!status.running);
        assert!(status.last_error.unwrap().contains("timed out"));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn start_is_a_noop_when_already_running() {
        let manager = ServiceManager::new(fast_config(), Arc::new(ScriptedTransport::healthy(true)));
        manager.start_service().await.unwrap();
        assert!(manager.pid().is_none());
        assert!(!manager.is_health_loop_active());
    }

    struct ThrottledTransport;

    #[async_trait]
    impl SidecarTransport for ThrottledTransport {
        async fn call(&self, _request: &RpcRequest) -> Result<RawResponse, TransportError> {
            Ok(RawResponse::new(429, ""))
        }

        async fn health(&self) -> Result<RawResponse, TransportError> {
            Ok(RawResponse::new(429, "too many requests"))
        }
    }

    #[tokio::test]
    async fn throttled_health_counts_as_running_but_unhealthy() {
        let manager = ServiceManager::new(fast_config(), Arc::new(ThrottledTransport));
        let status = manager.get_service_status().await;
        assert!(status.running);
        assert!(!status.healthy);
        assert_eq!(status.http_status, Some(429));
        assert_eq!(status.health_body.as_deref(), Some("too many requests"));
        assert!(status.last_error.unwrap().contains("HTTP 429"));

        // Nothing is spawned next to a sidecar that still answers.
        manager.start_service().await.unwrap();
        assert!(manager.pid().is_none());
        assert!(!manager.is_health_loop_active());
    }

    #[tokio::test]
    async fn start_fails_without_executable() {
        let config = SidecarConfig {
            executable: PathBuf::from("/nonexistent/xhs-sidecar"),
            ..fast_config()
        };
        let manager = ServiceManager::new(config, Arc::new(ScriptedTransport::healthy(false)));
        let err = manager.start_service().await.unwrap_err();
        assert!(matches!(err, ServiceError::ExecutableMissing(_)));
        assert!(manager.stop_service().await.is_ok());
    }

    #[tokio::test]
    async fn login_status_reads_flags_and_text() {
        let flagged = ScriptedTransport {
            rpc_body: json!({"jsonrpc": "2.0", "id": 1, "result": {"is_logged_in": true, "username": "cat"}})
                .to_string(),
            ..ScriptedTransport::healthy(true)
        };
        let manager = ServiceManager::new(fast_config(), Arc::new(flagged));
        let status = manager.check_login_status().await.unwrap();
        assert!(status.logged_in);
        assert!(status.message.contains("cat"));

        let text = login_from_payload(&json!({"content": [{"type": "text", "text": "❌ 未登录"}]}));
        assert!(!text.logged_in);
    }

    #[tokio::test]
    async fn test_connection_counts_capabilities() {
        let transport = ScriptedTransport {
            rpc_body: json!({"jsonrpc": "2.0", "id": 1, "result": {"capabilities": {"tools": {}, "logging": {}}}})
                .to_string(),
            ..ScriptedTransport::healthy(true)
        };
        let manager = ServiceManager::new(fast_config(), Arc::new(transport));
        let report = manager.test_connection().await;
        assert!(report.success);
        assert_eq!(report.capabilities, 2);
    }

    #[tokio::test]
    async fn service_logs_tail_the_log_file() {
        let dir = std::env::temp_dir().join(format!("xhs-bridge-logs-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("logs")).unwrap();
        std::fs::write(dir.join("logs/service.log"), "one\ntwo\n\nthree\nfour\n").unwrap();
        let config = SidecarConfig {
            working_dir: Some(dir.clone()),
            ..fast_config()
        };
        let manager = ServiceManager::new(config, Arc::new(ScriptedTransport::healthy(true)));
        assert_eq!(manager.service_logs(3).await.unwrap(), vec!["two", "three", "four"]);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;

        fn script(name: &str, body: &str) -> PathBuf {
            let dir = std::env::temp_dir().join(format!("xhs-bridge-{}-{name}", std::process::id()));
            std::fs::create_dir_all(&dir).unwrap();
            let path = dir.join("sidecar.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
            for _ in 0..100 {
                if check() {
                    return true;
                }
                sleep(Duration::from_millis(20)).await;
            }
            false
        }

        #[tokio::test]
        async fn start_then_stop_with_sigterm() {
            let transport = Arc::new(ScriptedTransport::healthy(true));
            transport.push(false);
            let config = SidecarConfig {
                executable: script("graceful", "exec sleep 30"),
                ..fast_config()
            };
            let manager = ServiceManager::new(config, transport);

            manager.start_service().await.unwrap();
            assert!(manager.pid().is_some());
            assert!(manager.is_health_loop_active());

            manager.stop_service().await.unwrap();
            assert!(manager.pid().is_none());
            assert!(!manager.is_health_loop_active());
        }

        #[tokio::test]
        async fn termination_request_delivers_sigterm() {
            use std::os::unix::process::ExitStatusExt;

            let mut child = Command::new("sleep").arg("30").spawn().unwrap();
            assert!(request_termination(child.id()));
            let status = timeout(Duration::from_secs(5), child.wait()).await.unwrap().unwrap();
            assert_eq!(status.signal(), Some(15));
            assert!(!request_termination(None));
        }

        #[tokio::test]
        async fn stop_force_kills_after_grace() {
            let transport = Arc::new(ScriptedTransport::healthy(true));
            transport.push(false);
            let config = SidecarConfig {
                executable: script("stubborn", "trap '' TERM\nwhile true; do sleep 1; done"),
                ..fast_config()
            };
            let manager = ServiceManager::new(config, transport);
            manager.start_service().await.unwrap();

            let started = std::time::Instant::now();
            manager.stop_service().await.unwrap();
            assert!(started.elapsed() >= Duration::from_millis(300));
            assert!(manager.pid().is_none());
        }

        #[tokio::test]
        async fn exit_during_startup_is_reported() {
            let config = SidecarConfig {
                executable: script("crashing", "exit 3"),
                ..fast_config()
            };
            let manager = ServiceManager::new(config, Arc::new(ScriptedTransport::healthy(false)));
            let err = manager.start_service().await.unwrap_err();
            assert!(matches!(
                err,
                ServiceError::ExitedDuringStartup | ServiceError::StartupTimeout(_)
            ));
            assert!(manager.pid().is_none());
            assert!(!manager.is_health_loop_active());
        }

        #[tokio::test]
        async fn health_loop_relaunches_unhealthy_sidecar() {
            let transport = Arc::new(ScriptedTransport::healthy(true));
            transport.push(false);
            let config = SidecarConfig {
                executable: script("flaky", "exec sleep 30"),
                ..fast_config()
            };
            let manager = ServiceManager::new(config, transport.clone());
            manager.start_service().await.unwrap();
            let first = manager.pid();

            transport.push(false);
            let replaced = wait_for(|| manager.pid().is_some() && manager.pid() != first).await;
            assert!(replaced);
            assert!(manager.is_health_loop_active());

            manager.stop_service().await.unwrap();
        }
    }
}
