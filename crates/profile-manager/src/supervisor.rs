use crate::error::{ManagerError, Result};
use crate::importer::GENERATED_SUFFIX;
use crate::proxy_log::{log_path, spawn_pump, ProxyLog, SharedLog};
use crate::store::write_atomic;
use crate::wireguard::render_wireproxy_config;
use proxy_protocol::ProxyType;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use system_utils::net::port_accepts;
use system_utils::path::encoded_file_stem;
use system_utils::process::{apply_process_group, pid_alive, terminate_child, terminate_pid};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const ORPHAN_PROBE_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Clone, Debug)]
pub struct SupervisorConfig {
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    pub bind_host: String,
    pub spawn_grace: Duration,
    pub stop_timeout: Duration,
}

/// Everything needed to launch one wireproxy instance.
pub struct LaunchSpec<'a> {
    pub profile: &'a str,
    pub wg_config: &'a Path,
    pub binary: &'a Path,
    pub proxy_type: ProxyType,
    pub port: u16,
    pub logging: bool,
}

pub struct ProcessHandle {
    profile: String,
    child: Child,
    pid: u32,
    port: u16,
    config_path: PathBuf,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Non-blocking liveness probe.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// One file per profile name, including names carried over from older state files
    /// that are not safe file stems.
    pub fn generated_config_path(&self, profile: &str) -> PathBuf {
        self.config
            .run_dir
            .join(format!("{}{GENERATED_SUFFIX}", encoded_file_stem(profile)))
    }

    /// Writes the generated config, spawns wireproxy and waits for it to come up.
    /// Nothing is left behind when this fails.
    pub async fn start(&self, spec: LaunchSpec<'_>) -> Result<ProcessHandle> {
        let config_path = self.generated_config_path(spec.profile);
        let rendered = render_wireproxy_config(
            spec.wg_config,
            spec.proxy_type,
            &self.config.bind_host,
            spec.port,
        );
        write_atomic(&config_path, rendered.as_bytes())?;

        let log = if spec.logging {
            self.open_log(&spec, &config_path)
        } else {
            None
        };

        let mut cmd = Command::new(spec.binary);
        cmd.arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if log.is_some() {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        apply_process_group(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => {
                remove_generated(&config_path);
                return Err(ManagerError::SpawnFailed {
                    profile: spec.profile.to_string(),
                    reason: err.to_string(),
                });
            }
        };
        let Some(pid) = child.id() else {
            remove_generated(&config_path);
            return Err(ManagerError::SpawnFailed {
                profile: spec.profile.to_string(),
                reason: "process exited before its pid was read".to_string(),
            });
        };

        let mut pumps = Vec::new();
        if let Some(log) = log {
            if let Some(stdout) = child.stdout.take() {
                pumps.push(spawn_pump(stdout, "stdout", log.clone()));
            }
            if let Some(stderr) = child.stderr.take() {
                pumps.push(spawn_pump(stderr, "stderr", log));
            }
        }
        let mut handle = ProcessHandle {
            profile: spec.profile.to_string(),
            child,
            pid,
            port: spec.port,
            config_path,
            pumps,
        };

        match self.wait_ready(&mut handle).await {
            Ok(()) => {
                tracing::info!(profile = %spec.profile, port = spec.port, pid, "wireproxy started");
                Ok(handle)
            }
            Err(reason) => {
                self.stop(handle).await;
                Err(ManagerError::SpawnFailed {
                    profile: spec.profile.to_string(),
                    reason,
                })
            }
        }
    }

    /// Terminates the process, drains its log pumps and removes the generated config.
    pub async fn stop(&self, mut handle: ProcessHandle) -> Option<ExitStatus> {
        let status = terminate_child(&mut handle.child, self.config.stop_timeout).await;
        if status.is_none() {
            tracing::warn!(profile = %handle.profile, pid = handle.pid, "wireproxy did not exit");
        }
        for pump in handle.pumps.drain(..) {
            let _ = timeout(PUMP_DRAIN_TIMEOUT, pump).await;
        }
        remove_generated(&handle.config_path);
        tracing::info!(profile = %handle.profile, port = handle.port, pid = handle.pid, "wireproxy stopped");
        status
    }

    /// Kills a wireproxy left over from a previous daemon run. Only a pid that is alive
    /// and still serving `port` is touched; anything else may be an unrelated process.
    pub async fn terminate_orphan(&self, profile: &str, pid: u32, port: Option<u16>) -> bool {
        if !pid_alive(pid) {
            return false;
        }
        let serving = match port {
            Some(port) => port_accepts(&self.config.bind_host, port, ORPHAN_PROBE_TIMEOUT).await,
            None => false,
        };
        if !serving {
            tracing::warn!(profile, pid, ?port, "pid alive but port not serving, leaving it alone");
            return false;
        }
        let gone = terminate_pid(pid, self.config.stop_timeout).await;
        if gone {
            tracing::info!(profile, pid, "terminated orphaned wireproxy");
        } else {
            tracing::warn!(profile, pid, "orphaned wireproxy survived termination");
        }
        remove_generated(&self.generated_config_path(profile));
        gone
    }

    pub fn remove_generated_config(&self, profile: &str) {
        remove_generated(&self.generated_config_path(profile));
    }

    async fn wait_ready(&self, handle: &mut ProcessHandle) -> std::result::Result<(), String> {
        let deadline = Instant::now() + self.config.spawn_grace;
        loop {
            match handle.child.try_wait() {
                Ok(Some(status)) => return Err(format!("exited during startup ({status})")),
                Ok(None) => {}
                Err(err) => return Err(format!("status check failed: {err}")),
            }
            if port_accepts(&self.config.bind_host, handle.port, READY_POLL_INTERVAL).await {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Ok(());
            }
            sleep(READY_POLL_INTERVAL).await;
        }
    }

    fn open_log(&self, spec: &LaunchSpec<'_>, config_path: &Path) -> Option<SharedLog> {
        let path = log_path(&self.config.log_dir, spec.profile);
        let opened = ProxyLog::open(&path).and_then(|mut log| {
            log.banner(spec.profile, spec.binary, config_path, spec.port)?;
            Ok(log)
        });
        match opened {
            Ok(log) => Some(Arc::new(Mutex::new(log))),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "proxy log unavailable, output discarded");
                None
            }
        }
    }
}

fn remove_generated(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "failed to remove generated config"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_utils::{fake_wireproxy, temp_dir};
    use std::net::TcpListener;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
    }

    fn supervisor(dir: &Path, grace_ms: u64) -> Supervisor {
        Supervisor::new(SupervisorConfig {
            run_dir: dir.join("run"),
            log_dir: dir.join("logs"),
            bind_host: "127.0.0.1".to_string(),
            spawn_grace: Duration::from_millis(grace_ms),
            stop_timeout: Duration::from_secs(2),
        })
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[test]
    fn starts_writes_config_and_stops() {
        let dir = temp_dir("wpm-sup-start");
        let binary = fake_wireproxy(&dir, "echo booting\necho warn >&2\nexec sleep 30");
        let wg = dir.join("nl.conf");
        let supervisor = supervisor(&dir, 200);
        let port = free_port();
        runtime().block_on(async {
            let mut handle = supervisor
                .start(LaunchSpec {
                    profile: "nl",
                    wg_config: &wg,
                    binary: &binary,
                    proxy_type: ProxyType::Http,
                    port,
                    logging: true,
                })
                .await
                .expect("start");
            assert!(handle.is_alive());
            assert_eq!(handle.port(), port);
            let generated = fs::read_to_string(handle.config_path()).unwrap();
            assert!(generated.contains(&format!("WGConfig = \"{}\"", wg.display())));
            assert!(generated.contains(&format!("[http]\nBindAddress = 127.0.0.1:{port}")));

            let pid = handle.pid();
            let config_path = handle.config_path().to_path_buf();
            supervisor.stop(handle).await;
            assert!(!pid_alive(pid));
            assert!(!config_path.exists());
        });
        let log = fs::read_to_string(dir.join("logs/wireproxy_nl.log")).unwrap();
        assert!(log.contains("starting wireproxy for nl"));
        assert!(log.contains("[stdout] booting"));
        assert!(log.contains("[stderr] warn"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn exit_during_grace_window_is_spawn_failure() {
        let dir = temp_dir("wpm-sup-exit");
        let binary = fake_wireproxy(&dir, "echo bad config >&2\nexit 3");
        let wg = dir.join("nl.conf");
        let supervisor = supervisor(&dir, 500);
        runtime().block_on(async {
            let err = supervisor
                .start(LaunchSpec {
                    profile: "nl",
                    wg_config: &wg,
                    binary: &binary,
                    proxy_type: ProxyType::Socks,
                    port: free_port(),
                    logging: false,
                })
                .await
                .err()
                .expect("spawn failure");
            assert!(matches!(err, ManagerError::SpawnFailed { .. }));
        });
        assert!(!supervisor.generated_config_path("nl").exists());
        assert!(!dir.join("logs/wireproxy_nl.log").exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_executable_is_spawn_failure() {
        let dir = temp_dir("wpm-sup-missing");
        let supervisor = supervisor(&dir, 100);
        let wg = dir.join("nl.conf");
        let binary = dir.join("no-such-wireproxy");
        runtime().block_on(async {
            let result = supervisor
                .start(LaunchSpec {
                    profile: "nl",
                    wg_config: &wg,
                    binary: &binary,
                    proxy_type: ProxyType::Socks,
                    port: free_port(),
                    logging: false,
                })
                .await;
            assert!(matches!(result, Err(ManagerError::SpawnFailed { .. })));
        });
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn listening_port_makes_start_ready_early() {
        let dir = temp_dir("wpm-sup-ready");
        let binary = fake_wireproxy(&dir, "exec sleep 30");
        let wg = dir.join("nl.conf");
        let supervisor = supervisor(&dir, 5_000);
        let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().unwrap().port();
        runtime().block_on(async {
            let started = Instant::now();
            let handle = supervisor
                .start(LaunchSpec {
                    profile: "nl",
                    wg_config: &wg,
                    binary: &binary,
                    proxy_type: ProxyType::Socks,
                    port,
                    logging: false,
                })
                .await
                .expect("start");
            assert!(started.elapsed() < Duration::from_secs(4));
            supervisor.stop(handle).await;
        });
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn orphan_is_left_alone_when_port_is_silent() {
        let dir = temp_dir("wpm-sup-orphan");
        let supervisor = supervisor(&dir, 100);
        runtime().block_on(async {
            let mut cmd = Command::new("sleep");
            cmd.arg("30");
            apply_process_group(&mut cmd);
            let mut child = cmd.spawn().expect("spawn");
            let pid = child.id().expect("pid");

            assert!(!supervisor.terminate_orphan("nl", pid, Some(free_port())).await);
            assert!(pid_alive(pid));

            let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind");
            let port = listener.local_addr().unwrap().port();
            let reaper = tokio::spawn(async move { child.wait().await });
            assert!(supervisor.terminate_orphan("nl", pid, Some(port)).await);
            let _ = reaper.await;
            assert!(!pid_alive(pid));
        });
        fs::remove_dir_all(&dir).ok();
    }
}
