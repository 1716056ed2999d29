use std::{net::SocketAddr, path::Path, process::Stdio};

use anyhow::Result;
use sysinfo::{get_current_pid, Signal, System};


pub fn kill_running_daemons(name: &Path) {
    let system = System::new_all();
    let current_id = get_current_pid().unwrap();
    for (pid, process) in system.processes().iter() {
        if *pid == current_id {
            continue;
        }
        if matches!(process.parent(), Some(p) if p == current_id) {
            continue;
        }

        if process
            .exe()
            .filter(|v| v.exists())
            .filter(|v| name == *v)
            .is_some()
        {
            // This will forcefully terminate the process on Windows. Anything better will require a
            // lot more work.
            if process.kill_with(Signal::Term).is_none() {
                process.kill();
            }
            process.wait();
        }
    }
}

/// Shuts down any previous daemon and spawns a fresh one. The daemon binary detaches
/// itself, so a plain spawn is enough here.
pub fn restart_daemon(
    daemon_path: &Path,
    dir: Option<&Path>,
    listen: Option<SocketAddr>,
) -> Result<()> {
    kill_running_daemons(daemon_path);

    let mut command = std::process::Command::new(daemon_path);
    if let Some(dir) = dir {
        command.arg("--dir").arg(dir);
    }
    if let Some(listen) = listen {
        command.args(["--listen", &listen.to_string()]);
    }
    command.stdin(Stdio::null());

    println!("Spawning");
    #[allow(clippy::zombie_processes)]
    let _ = command.spawn()?;
    println!("Success");
    Ok(())
}
