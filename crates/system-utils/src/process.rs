use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tokio::time::{timeout, Duration};

const PID_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `taskkill /T /F` for a pid we hold no handle for; the tool itself gets `limit` to finish.
#[cfg(not(unix))]
async fn taskkill_tree(pid: u32, limit: Duration) -> anyhow::Result<()> {
    use anyhow::Context;
    use std::process::Stdio;

    let mut cmd = Command::new("taskkill");
    cmd.arg("/PID")
        .arg(pid.to_string())
        .arg("/T")
        .arg("/F")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let output = timeout(limit, cmd.output())
        .await
        .with_context(|| format!("taskkill {pid} timed out after {}ms", limit.as_millis()))?
        .context("failed to run taskkill")?;
    if !output.status.success() {
        anyhow::bail!(
            "taskkill {pid} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Puts the spawned child in its own process group so signals reach anything it forks.
#[cfg(unix)]
pub fn apply_process_group(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) == 0 {
                Ok(())
            } else {
                Err(std::io::Error::last_os_error())
            }
        });
    }
}

#[cfg(not(unix))]
pub fn apply_process_group(_cmd: &mut Command) {}

/// Only positive pids that fit `pid_t` name a single process; 0 and negatives address groups.
#[cfg(unix)]
fn signalable_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|pid| *pid > 0)
}

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    let Some(pid) = signalable_pid(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn pid_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        GetExitCodeProcess, OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION,
    };
    const STILL_ACTIVE: u32 = 259;

    if pid == 0 {
        return false;
    }
    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle == 0 {
            return false;
        }
        let mut code: u32 = 0;
        let ok = GetExitCodeProcess(handle, &mut code);
        CloseHandle(handle);
        ok != 0 && code == STILL_ACTIVE
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) -> std::io::Result<()> {
    let Some(pid) = signalable_pid(pid) else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("pid {pid} is out of range"),
        ));
    };
    let rc = unsafe { libc::killpg(pid, signal) };
    if rc == 0 {
        return Ok(());
    }
    // Not a group leader (spawned by an older build): fall back to the pid itself.
    let rc = unsafe { libc::kill(pid, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns `None` if the child could not be reaped.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        if let Err(err) = signal_group(pid, libc::SIGTERM) {
            tracing::warn!(pid, error = %err, "failed to send SIGTERM");
        }
    }
    #[cfg(unix)]
    if let Ok(status) = timeout(grace, child.wait()).await {
        return status.ok();
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = signal_group(pid, libc::SIGKILL);
    }
    let _ = child.kill().await;
    match timeout(grace, child.wait()).await {
        Ok(status) => status.ok(),
        Err(_) => None,
    }
}

/// Same escalation for a process we hold no handle for. Returns true once the pid is gone.
pub async fn terminate_pid(pid: u32, grace: Duration) -> bool {
    #[cfg(unix)]
    if signalable_pid(pid).is_none() {
        tracing::warn!(pid, "refusing to signal out-of-range pid");
        return false;
    }
    if !pid_alive(pid) {
        return true;
    }
    #[cfg(unix)]
    {
        let _ = signal_group(pid, libc::SIGTERM);
        if wait_for_exit(pid, grace).await {
            return true;
        }
        let _ = signal_group(pid, libc::SIGKILL);
        wait_for_exit(pid, grace).await
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = taskkill_tree(pid, grace).await {
            tracing::warn!(pid, error = %err, "taskkill failed");
        }
        wait_for_exit(pid, grace).await
    }
}

async fn wait_for_exit(pid: u32, grace: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(PID_POLL_INTERVAL).await;
    }
}
