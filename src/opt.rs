use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtpd",
    about = "A concurrent SMTP daemon delivering local mail to maildir mailboxes",
    author = "2026, Philippe TEMESI <https://www.tems.be>",
    version = "0.1.0"
)]
pub struct Opt {
    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// Listening port
    #[structopt(short = "p", long = "port", default_value = "2525")]
    pub port: u16,

    /// Listening address
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Domain to accept mail for
    #[structopt(long = "domain", default_value = "smtpd.com")]
    pub domain: String,

    /// Host name announced in the greeting and EHLO replies
    #[structopt(long = "hostname", default_value = "localhost")]
    pub hostname: String,

    /// Root of the per-recipient maildir mailboxes
    #[structopt(long = "mail-dir", default_value = "mails", parse(from_os_str))]
    pub mail_dir: PathBuf,

    /// Transformation program run on message content (through `sh -c`)
    #[structopt(short = "T", long = "transform", default_value = "tac")]
    pub transform: String,

    /// Seconds a transformation may stall before it is killed
    #[structopt(long = "transform-timeout", default_value = "30")]
    pub transform_timeout: u64,

    /// Start with transformations enabled
    #[structopt(short = "t", long = "enable-transform")]
    pub enable_transform: bool,

    /// Maximum concurrent sessions; extra connections only get 554 replies
    #[structopt(long = "max-sessions", default_value = "500")]
    pub max_sessions: usize,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - display SMTP commands and replies
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,
}
