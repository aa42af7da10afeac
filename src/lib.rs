//! A concurrent SMTP daemon that accepts mail for one local domain and
//! stores every message in a per-recipient maildir, optionally piping the
//! content through an external transformation program.

pub mod buffer;
pub mod context;
pub mod daemon;
pub mod data;
pub mod opt;
pub mod rcpt;
pub mod request;
pub mod server;
pub mod session;
pub mod utils;

pub use context::ServerContext;
pub use opt::Opt;
pub use server::SmtpServer;
pub use session::{SmtpSession, SmtpState};
