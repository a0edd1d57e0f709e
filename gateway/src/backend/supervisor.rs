use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::DataDirPolicy;
use crate::error::SupervisorError;

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_POLL_INTERVAL: Duration = Duration::from_millis(200);
const POST_READY_GRACE: Duration = Duration::from_secs(2);
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const BOOT_LOG_CAPACITY: usize = 200;

const VERSION_MARKER: &str = "PG_VERSION";

/// Owns the lifecycle of the embedded `postgres` server: its data
/// directory, the child process, and startup/shutdown detection. Mirrors
/// the process-supervision shape of neon's `compute_ctl` binary, adapted
/// to an async `tokio::process::Command` child instead of a blocking one.
pub struct BackendSupervisor {
    data_dir: PathBuf,
    ephemeral: bool,
    socket_dir: PathBuf,
    tcp_port: u16,
    pg_bin_dir: Option<PathBuf>,
    child: Mutex<Option<Child>>,
    pid: AtomicU32,
    ready: AtomicBool,
    boot_log: SyncMutex<VecDeque<String>>,
}

impl BackendSupervisor {
    pub fn new(
        data_dir_policy: &DataDirPolicy,
        tcp_port: u16,
        pg_bin_dir: Option<PathBuf>,
    ) -> Result<Self, SupervisorError> {
        let (data_dir, ephemeral) = match data_dir_policy {
            DataDirPolicy::Persistent(path) => {
                std::fs::create_dir_all(path).map_err(|source| SupervisorError::DataDir {
                    path: path.display().to_string(),
                    source,
                })?;
                (path.clone(), false)
            }
            DataDirPolicy::Ephemeral => {
                let unique = format!("pg-gateway-{}-{}", std::process::id(), now_millis());
                let path = std::env::temp_dir().join(unique);
                std::fs::create_dir_all(&path).map_err(|source| SupervisorError::DataDir {
                    path: path.display().to_string(),
                    source,
                })?;
                (path, true)
            }
        };

        let socket_dir = data_dir.join(".s.PGSQL-sockets");
        std::fs::create_dir_all(&socket_dir).map_err(|source| SupervisorError::DataDir {
            path: socket_dir.display().to_string(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_dir, std::fs::Permissions::from_mode(0o700)).map_err(
                |source| SupervisorError::DataDir {
                    path: socket_dir.display().to_string(),
                    source,
                },
            )?;
        }

        Ok(Self {
            data_dir,
            ephemeral,
            socket_dir,
            tcp_port,
            pg_bin_dir,
            child: Mutex::new(None),
            pid: AtomicU32::new(0),
            ready: AtomicBool::new(false),
            boot_log: SyncMutex::new(VecDeque::with_capacity(BOOT_LOG_CAPACITY)),
        })
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    /// Directory `unix_socket_directories` was pointed at. Callers that
    /// go through `tokio_postgres` pass this directly as the connect
    /// host; it appends the `.s.PGSQL.<port>` file name itself.
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Full path to the socket file itself, for callers that connect
    /// with a raw `UnixStream` instead of `tokio_postgres`.
    pub fn socket_file_path(&self) -> PathBuf {
        self.socket_dir.join(format!(".s.PGSQL.{}", self.tcp_port))
    }

    pub fn is_alive(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn bin_path(&self, name: &str) -> PathBuf {
        match &self.pg_bin_dir {
            Some(dir) => dir.join(name),
            None => PathBuf::from(name),
        }
    }

    /// Brings the backend up: runs `initdb` if needed, spawns `postgres`,
    /// and waits for it to start accepting connections.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        if !self.data_dir.join(VERSION_MARKER).exists() {
            self.run_initdb().await?;
        }

        let mut cmd = Command::new(self.bin_path("postgres"));
        cmd.arg("-D")
            .arg(&self.data_dir)
            .arg("-p")
            .arg(self.tcp_port.to_string())
            .arg("-c")
            .arg(format!("unix_socket_directories={}", self.socket_dir.display()))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        self.pid.store(child.id().unwrap_or(0), Ordering::Release);

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        *self.child.lock().await = Some(child);

        self.wait_until_ready(stdout, stderr)
            .instrument(info_span!("backend_startup", port = self.tcp_port))
            .await?;

        self.ready.store(true, Ordering::Release);
        info!(port = self.tcp_port, data_dir = %self.data_dir.display(), "backend ready");
        Ok(())
    }

    async fn run_initdb(&self) -> Result<(), SupervisorError> {
        let password_file = self.data_dir.join(".initdb-password");
        std::fs::write(&password_file, generate_password()).map_err(|source| SupervisorError::DataDir {
            path: password_file.display().to_string(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&password_file, std::fs::Permissions::from_mode(0o600)).ok();
        }
        // Removed on every exit path, including initdb failing to spawn at all.
        let _cleanup = scopeguard::guard(password_file.clone(), |path| {
            let _ = std::fs::remove_file(path);
        });

        let result = Command::new(self.bin_path("initdb"))
            .arg("-D")
            .arg(&self.data_dir)
            .arg("--locale=C")
            .arg("--pwfile")
            .arg(&password_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(SupervisorError::Spawn)?;

        if !result.status.success() {
            return Err(SupervisorError::InitDbFailed(
                String::from_utf8_lossy(&result.stderr).into_owned(),
            ));
        }
        debug!("initdb completed");
        Ok(())
    }

    /// Races a TCP-connect poll against a log-tail scan for the listen
    /// port; whichever observes readiness first wins. Some platforms
    /// accept TCP connections slightly before the protocol is actually
    /// ready, hence the extra grace sleep.
    async fn wait_until_ready(
        &self,
        stdout: tokio::process::ChildStdout,
        stderr: tokio::process::ChildStderr,
    ) -> Result<(), SupervisorError> {
        let port = self.tcp_port;
        let poll_task = async move {
            loop {
                if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                    return;
                }
                sleep(TCP_POLL_INTERVAL).await;
            }
        };

        let boot_log = &self.boot_log;
        let scan_task = async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut err_lines = BufReader::new(stderr).lines();
            loop {
                tokio::select! {
                    Ok(Some(line)) = lines.next_line() => {
                        push_log_line(boot_log, line.clone());
                        if line.contains("database system is ready to accept connections") {
                            return;
                        }
                    }
                    Ok(Some(line)) = err_lines.next_line() => {
                        push_log_line(boot_log, line.clone());
                        if line.contains("database system is ready to accept connections") {
                            return;
                        }
                    }
                    else => {
                        sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        };

        let raced = async {
            tokio::select! {
                _ = poll_task => {}
                _ = scan_task => {}
            }
        };

        if timeout(STARTUP_TIMEOUT, raced).await.is_err() {
            let log_tail = self.boot_log.lock().iter().cloned().collect::<Vec<_>>().join("\n");
            warn!(timeout = %humantime::format_duration(STARTUP_TIMEOUT), "backend startup timed out");
            return Err(SupervisorError::StartupTimedOut {
                timeout_secs: STARTUP_TIMEOUT.as_secs(),
                log_tail,
            });
        }

        sleep(POST_READY_GRACE).await;
        Ok(())
    }

    /// Sends SIGTERM, waits up to 5s, escalates to SIGKILL, then removes
    /// ephemeral storage. Safe to call more than once.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };
        self.ready.store(false, Ordering::Release);

        let pid = self.pid.load(Ordering::Acquire);
        if pid != 0 {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if timeout(GRACEFUL_SHUTDOWN_TIMEOUT, child.wait()).await.is_err() {
            warn!(pid, "backend did not exit gracefully, sending SIGKILL");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        drop(guard);

        if self.ephemeral {
            let _ = std::fs::remove_dir_all(&self.data_dir);
        }
        let _ = std::fs::remove_dir_all(&self.socket_dir);
        Ok(())
    }
}

fn push_log_line(log: &SyncMutex<VecDeque<String>>, line: String) {
    let mut guard = log.lock();
    if guard.len() == BOOT_LOG_CAPACITY {
        guard.pop_front();
    }
    guard.push_back(line);
}

fn now_millis() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn generate_password() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
        .collect()
}
