use smtpd::{daemon, Opt, SmtpServer};

use anyhow::{Context, Result};
use std::sync::Arc;
use structopt::StructOpt;

fn main() -> Result<()> {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("smtpd v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");

    // Vérifier/Créer les répertoires nécessaires AVANT daemonisation
    if let Some(log_path) = &opt.log_file {
        if let Some(parent) = log_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                eprintln!("[INFO] Created log directory: {:?}", parent);
            }
        }
    }

    if opt.daemon {
        daemon::daemonize()?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async {
        let server = Arc::new(SmtpServer::new(opt)?);

        println!("[INFO] PID: {}", std::process::id());
        println!("[INFO] Listening on {}:{}", server.opt.address, server.opt.port);
        println!("[INFO] Domain: {}", server.opt.domain);
        println!("[INFO] Mail directory: {:?}", server.opt.mail_dir);
        println!(
            "[INFO] Transformation: {} ({})",
            server.opt.transform,
            if server.context.transformations_enabled() { "enabled" } else { "disabled" }
        );
        println!("[INFO] Max sessions: {}", server.context.max_sessions());
        println!("[INFO] Press Ctrl+C to stop");

        server.run().await
    })
}
