//! Small process-related helpers shared across the workspace.

use std::ffi::OsStr;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `std::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
pub fn std_command(program: impl AsRef<OsStr>) -> std::process::Command {
    let mut cmd = std::process::Command::new(program);
    cmd.no_window();
    cmd
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd
}

/// Create a `tokio::process::Command` that can be torn down as a whole tree.
///
/// On Unix the child is placed in its own process group so
/// [`terminate_tree`] can signal every descendant at once. On Windows the
/// `CREATE_NO_WINDOW` flag is applied and `taskkill /T` handles the tree.
#[cfg(feature = "tokio")]
pub fn supervised_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio_command(program);
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    cmd
}

/// Terminate a process and all of its descendants.
///
/// Sends a graceful stop first, waits up to `grace`, then force-kills
/// whatever is still alive. `pid` must be the root of a tree spawned with
/// [`supervised_command`].
#[cfg(all(feature = "tokio", unix))]
pub async fn terminate_tree(pid: u32, grace: std::time::Duration) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        // killpg with no signal only probes for existence.
        if killpg(pgid, None).is_err() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }

    let _ = killpg(pgid, Signal::SIGKILL);
}

/// Terminate a process and all of its descendants (Windows).
#[cfg(all(feature = "tokio", windows))]
pub async fn terminate_tree(pid: u32, grace: std::time::Duration) {
    let pid_arg = pid.to_string();
    let _ = tokio_command("taskkill")
        .args(["/PID", &pid_arg, "/T"])
        .output()
        .await;

    tokio::time::sleep(grace).await;

    let _ = tokio_command("taskkill")
        .args(["/PID", &pid_arg, "/T", "/F"])
        .output()
        .await;
}
