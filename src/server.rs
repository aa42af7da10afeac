use crate::context::ServerContext;
use crate::opt::Opt;
use crate::session::{SmtpSession, SmtpState};
use crate::utils::Logger;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};

pub struct SmtpServer {
    pub opt: Arc<Opt>,
    pub context: Arc<ServerContext>,
    logger: Arc<Logger>,
}

impl SmtpServer {
    pub fn new(opt: Opt) -> Result<Self> {
        let logger = Logger::new(opt.log_file.clone(), opt.verbose)
            .with_context(|| format!("Failed to open log file: {:?}", opt.log_file))?;

        // Les boîtes sont créées à la demande, mais la racine doit exister
        if !opt.mail_dir.exists() {
            std::fs::create_dir_all(&opt.mail_dir)
                .with_context(|| format!("Failed to create mail directory: {:?}", opt.mail_dir))?;
            eprintln!("[INFO] Mail directory created: {:?}", opt.mail_dir);
        }

        let context = ServerContext::new(opt.max_sessions, opt.enable_transform);

        Ok(Self {
            opt: Arc::new(opt),
            context: Arc::new(context),
            logger: Arc::new(logger),
        })
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.opt.address, self.opt.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))
    }

    /// Listens on the configured address until Ctrl-C.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
    }

    /// Accepts connections on `listener` until `shutdown` completes. Every
    /// connection gets its own task; sessions still running at shutdown are
    /// dropped with the runtime.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = listener.local_addr()?;
        self.logger
            .log(&local_addr, &format!("Listening on {}", local_addr))
            .await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move {
                            this.handle_client(stream, client_addr).await;
                        });
                    }
                    Err(e) => {
                        self.logger
                            .log(&local_addr, &format!("Accept error: {}", e))
                            .await;
                    }
                },
                _ = &mut shutdown => break,
            }
        }

        self.logger
            .log(
                &local_addr,
                &format!(
                    "Shutting down: {} connections, {} mails sent, {} bytes transferred",
                    self.context.historic_connections(),
                    self.context.mails_sent(),
                    self.context.bytes_transferred()
                ),
            )
            .await;
        Ok(())
    }

    pub async fn handle_client(&self, mut stream: TcpStream, client_addr: SocketAddr) -> SmtpState {
        let guard = self.context.open_connection();
        self.logger
            .log(
                &client_addr,
                &format!(
                    "New connection (current: {}, total: {})",
                    self.context.current_connections(),
                    self.context.historic_connections()
                ),
            )
            .await;
        if !guard.admitted() {
            self.logger
                .log(
                    &client_addr,
                    &format!("Session limit reached ({})", self.context.max_sessions()),
                )
                .await;
        }

        let mut session = SmtpSession::new(
            client_addr,
            guard.admitted(),
            Arc::clone(&self.opt),
            Arc::clone(&self.context),
            Arc::clone(&self.logger),
        );
        let state = session.run(&mut stream).await;
        drop(stream);
        drop(guard);

        self.logger
            .log(
                &client_addr,
                &format!(
                    "Connection closed ({}, current: {})",
                    if state == SmtpState::Done { "quit" } else { "error" },
                    self.context.current_connections()
                ),
            )
            .await;
        state
    }
}
