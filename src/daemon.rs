/// Pid file written by the detached server.
pub const PID_FILE: &str = "/tmp/smtpd.pid";

/// Detaches from the terminal. Must run before the tokio runtime is built:
/// forking a process that already has runtime threads leaves them behind.
#[cfg(unix)]
pub fn daemonize() -> anyhow::Result<()> {
    use daemonize::Daemonize;

    eprintln!("[INFO] Starting daemon mode...");

    // Garde le répertoire courant pour les chemins relatifs (mails, logs)
    let daemonize = Daemonize::new()
        .pid_file(PID_FILE)
        .chown_pid_file(true)
        .working_directory(".")
        .umask(0o027);

    match daemonize.start() {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("[ERROR] Daemon startup: {}", e);
            Err(anyhow::anyhow!("Failed to start daemon mode"))
        }
    }
}

#[cfg(not(unix))]
pub fn daemonize() -> anyhow::Result<()> {
    eprintln!("[INFO] Daemon mode not supported on this platform, staying in foreground");
    Ok(())
}
