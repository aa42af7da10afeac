//! Per-connection SMTP state machine.
//!
//! Every dialogue phase has a `*Read` state, which parses commands out of
//! the read buffer, and a `*Write` state, which drains the reply from the
//! write buffer. [`SmtpSession::step`] runs exactly one read or write
//! callback for the current state and then jumps to the state it returns,
//! firing departure/arrival hooks when the state changes:
//!
//! - arriving in a command-reading state re-initialises the command parser
//! - leaving `DataWrite` re-initialises the DATA parser
//! - leaving `MailInfoWrite` forgets the finished transaction
//!
//! `Done` and `Error` are terminal. Whatever is still open for delivery when
//! the session ends stays in `tmp/` and is never published.

use crate::buffer::ByteBuffer;
use crate::context::ServerContext;
use crate::data::DataParser;
use crate::opt::Opt;
use crate::rcpt::{self, DeliveryError, RcptList};
use crate::request::{Command, RequestParser};
use crate::utils::Logger;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the socket read and write buffers.
pub const IO_BUFFER_SIZE: usize = 2048;

/// Largest message accepted, as advertised in the EHLO reply.
pub const MAX_MESSAGE_SIZE: usize = 10_240_000;

const REPLY_OK: &str = "250 Ok\r\n";
const REPLY_BYE: &str = "221 Bye\r\n";
const REPLY_START_DATA: &str = "354 End data with <CR><LF>.<CR><LF>\r\n";
const REPLY_QUEUED: &str = "250 Ok: queued\r\n";
const REPLY_TRANSACTION_FAILED: &str = "554 Transaction failed\r\n";
const REPLY_TOO_BIG: &str = "552 Message size exceeds fixed maximum message size\r\n";
const REPLY_TOO_MANY_RCPT: &str = "452 Too many recipients\r\n";
const REPLY_INVALID_DOMAIN: &str = "550 Invalid domain. The domain specified does not exist\r\n";
const REPLY_EHLO_SYNTAX: &str = "500 Syntax error. Expected: HELO domain or EHLO domain\r\n";
const REPLY_MAIL_SYNTAX: &str = "500 Syntax error. Expected: MAIL FROM:<email@domain>\r\n";
const REPLY_RCPT_SYNTAX: &str = "500 Syntax error. Expected: RCPT TO:<email@domain>\r\n";
const REPLY_DATA_SYNTAX: &str = "500 Syntax error. Expected: DATA or RCPT TO:<email@domain>\r\n";
const REPLY_MAIL_FIRST: &str =
    "503 Bad sequence of commands. MAIL FROM command must precede RCPT TO command\r\n";
const REPLY_RCPT_FIRST: &str =
    "503 Bad sequence of commands. RCPT TO command must precede DATA command\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtpState {
    GreetingWrite,
    FailedConnectionRead,
    FailedConnectionWrite,
    EhloRead,
    EhloWrite,
    MailFromRead,
    MailFromWrite,
    RcptToRead,
    RcptToWrite,
    DataRead,
    DataWrite,
    MailInfoRead,
    MailInfoWrite,
    Done,
    Error,
}

/// What a state waits for on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    None,
}

impl SmtpState {
    pub fn interest(self) -> Interest {
        use SmtpState::*;

        match self {
            GreetingWrite | FailedConnectionWrite | EhloWrite | MailFromWrite | RcptToWrite
            | DataWrite | MailInfoWrite => Interest::Write,
            FailedConnectionRead | EhloRead | MailFromRead | RcptToRead | DataRead
            | MailInfoRead => Interest::Read,
            Done | Error => Interest::None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.interest() == Interest::None
    }

    /// States that read command lines, as opposed to message content.
    fn reads_commands(self) -> bool {
        self.interest() == Interest::Read && self != SmtpState::MailInfoRead
    }
}

pub struct SmtpSession {
    client_addr: SocketAddr,
    state: SmtpState,
    /// Where a write state goes once its reply is fully sent
    after_write: SmtpState,

    parser: RequestParser,
    data_parser: DataParser,
    read_buffer: ByteBuffer,
    write_buffer: ByteBuffer,

    helo: Option<String>,
    pub mail_from: Option<String>,
    recipients: RcptList,
    message_size: usize,
    oversized: bool,

    opt: Arc<Opt>,
    context: Arc<ServerContext>,
    logger: Arc<Logger>,
}

impl SmtpSession {
    /// A session that was not admitted only ever answers 554 until QUIT.
    pub fn new(
        client_addr: SocketAddr,
        admitted: bool,
        opt: Arc<Opt>,
        context: Arc<ServerContext>,
        logger: Arc<Logger>,
    ) -> Self {
        let (state, after_write, banner) = if admitted {
            (
                SmtpState::GreetingWrite,
                SmtpState::EhloRead,
                format!("220 {} SMTP\r\n", opt.hostname),
            )
        } else {
            (
                SmtpState::FailedConnectionWrite,
                SmtpState::FailedConnectionRead,
                Self::failed_connection_reply(&opt),
            )
        };

        let mut write_buffer = ByteBuffer::new(IO_BUFFER_SIZE);
        write_buffer.write_bytes(banner.as_bytes());

        let mut recipients = RcptList::new();
        recipients.set_filter_timeout(Duration::from_secs(opt.transform_timeout));

        Self {
            client_addr,
            state,
            after_write,
            parser: RequestParser::new(),
            data_parser: DataParser::new(),
            read_buffer: ByteBuffer::new(IO_BUFFER_SIZE),
            write_buffer,
            helo: None,
            mail_from: None,
            recipients,
            message_size: 0,
            oversized: false,
            opt,
            context,
            logger,
        }
    }

    fn failed_connection_reply(opt: &Opt) -> String {
        format!(
            "554 failed connection to {} SMTP - Use QUIT to close\r\n",
            opt.hostname
        )
    }

    pub fn state(&self) -> SmtpState {
        self.state
    }

    pub fn recipients(&self) -> &RcptList {
        &self.recipients
    }

    /// Drives the session until it reaches `Done` or `Error`, then releases
    /// everything still open.
    pub async fn run<S>(&mut self, stream: &mut S) -> SmtpState
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.on_arrival(self.state).await;
        while !self.state.is_terminal() {
            self.step(stream).await;
        }
        self.close().await;
        self.state
    }

    /// One read or write callback for the current state.
    pub async fn step<S>(&mut self, stream: &mut S) -> SmtpState
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let next = match self.state.interest() {
            Interest::Write => self.on_write_ready(stream).await,
            Interest::Read => self.on_read_ready(stream).await,
            Interest::None => self.state,
        };
        self.jump(next).await;
        self.state
    }

    /// Abandons any delivery in progress.
    pub async fn close(&mut self) {
        self.recipients.abort_delivery().await;
        self.recipients.clear();
    }

    async fn jump(&mut self, next: SmtpState) {
        if next == self.state {
            return;
        }
        self.on_departure(self.state);
        self.state = next;
        self.on_arrival(next).await;
    }

    fn on_departure(&mut self, state: SmtpState) {
        match state {
            SmtpState::DataWrite => self.data_parser.reset(),
            SmtpState::MailInfoWrite => self.reset_transaction(),
            _ => {}
        }
    }

    async fn on_arrival(&mut self, state: SmtpState) {
        if state.reads_commands() {
            self.parser.reset();
        } else if state.interest() == Interest::Write {
            self.logger
                .log_verbose(&self.client_addr, "<<", self.write_buffer.read_slice())
                .await;
        }
    }

    fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.recipients.clear();
        self.message_size = 0;
        self.oversized = false;
    }

    async fn on_write_ready<S>(&mut self, stream: &mut S) -> SmtpState
    where
        S: AsyncWrite + Unpin,
    {
        if self.write_buffer.can_read() {
            match stream.write(self.write_buffer.read_slice()).await {
                Ok(n) if n > 0 => {
                    self.write_buffer.read_adv(n);
                    self.context.add_bytes(n);
                }
                Ok(_) => return SmtpState::Error,
                Err(e) => {
                    self.logger
                        .log(&self.client_addr, &format!("Write error: {}", e))
                        .await;
                    return SmtpState::Error;
                }
            }
        }

        if self.write_buffer.can_read() {
            return self.state;
        }
        self.write_buffer.reset();

        match stream.flush().await {
            Ok(()) => self.after_write,
            Err(_) => SmtpState::Error,
        }
    }

    async fn on_read_ready<S>(&mut self, stream: &mut S) -> SmtpState
    where
        S: AsyncRead + Unpin,
    {
        if !self.read_buffer.can_read() {
            self.read_buffer.reset();
            match stream.read(self.read_buffer.write_slice()).await {
                Ok(n) if n > 0 => {
                    self.read_buffer.write_adv(n);
                    self.context.add_bytes(n);
                }
                Ok(_) => {
                    self.logger
                        .log(&self.client_addr, "Connection closed by client")
                        .await;
                    return SmtpState::Error;
                }
                Err(e) => {
                    self.logger
                        .log(&self.client_addr, &format!("Read error: {}", e))
                        .await;
                    return SmtpState::Error;
                }
            }
        }

        match self.state {
            SmtpState::FailedConnectionRead => self.failed_connection_read().await,
            SmtpState::EhloRead => self.ehlo_read().await,
            SmtpState::MailFromRead => self.mail_from_read().await,
            SmtpState::RcptToRead => self.rcpt_to_read().await,
            SmtpState::DataRead => self.data_read().await,
            SmtpState::MailInfoRead => self.mail_info_read().await,
            other => other,
        }
    }

    /// Queues `text` and switches to `write`, which then goes to `next`.
    fn reply(&mut self, text: &str, write: SmtpState, next: SmtpState) -> SmtpState {
        self.write_buffer.write_bytes(text.as_bytes());
        self.after_write = next;
        write
    }

    /// True once a full command line (or a bad one) has been parsed.
    async fn request_ready(&mut self) -> bool {
        if !self.parser.consume(&mut self.read_buffer).is_done() {
            return false;
        }
        if self.logger.is_verbose() {
            let request = self.parser.request();
            let line = match self.parser.command() {
                Command::Ehlo | Command::Helo => format!("{} {}", request.verb, request.domain),
                Command::Mail | Command::Rcpt => format!("{} <{}>", request.verb, request.arg),
                Command::Unknown => match self.parser.error() {
                    Some(e) => format!("invalid line: {}", e),
                    None => "invalid line".to_string(),
                },
                _ => request.verb.clone(),
            };
            self.logger
                .log_verbose(&self.client_addr, ">>", line.as_bytes())
                .await;
        }
        true
    }

    /// QUIT, NOOP and RSET mean the same thing in every admitted phase.
    fn common_command(&mut self, write: SmtpState) -> Option<SmtpState> {
        match self.parser.command() {
            Command::Quit => Some(self.reply(REPLY_BYE, write, SmtpState::Done)),
            Command::Noop => Some(self.reply(REPLY_OK, write, self.state)),
            Command::Rset => {
                let next = if self.state == SmtpState::EhloRead {
                    SmtpState::EhloRead
                } else {
                    self.reset_transaction();
                    SmtpState::MailFromRead
                };
                Some(self.reply(REPLY_OK, write, next))
            }
            _ => None,
        }
    }

    async fn failed_connection_read(&mut self) -> SmtpState {
        if !self.request_ready().await {
            return SmtpState::FailedConnectionRead;
        }

        let write = SmtpState::FailedConnectionWrite;
        if self.parser.command() == Command::Quit {
            self.reply(REPLY_BYE, write, SmtpState::Done)
        } else {
            let text = Self::failed_connection_reply(&self.opt);
            self.reply(&text, write, SmtpState::FailedConnectionRead)
        }
    }

    async fn ehlo_read(&mut self) -> SmtpState {
        if !self.request_ready().await {
            return SmtpState::EhloRead;
        }

        let write = SmtpState::EhloWrite;
        if let Some(next) = self.common_command(write) {
            return next;
        }

        match self.parser.command() {
            Command::Ehlo => {
                self.helo = Some(self.parser.request().domain.clone());
                let text = format!(
                    "250-{}\r\n250-PIPELINING\r\n250 SIZE {}\r\n",
                    self.opt.hostname, MAX_MESSAGE_SIZE
                );
                self.reply(&text, write, SmtpState::MailFromRead)
            }
            Command::Helo => {
                self.helo = Some(self.parser.request().domain.clone());
                let text = format!("250 {}\r\n", self.opt.hostname);
                self.reply(&text, write, SmtpState::MailFromRead)
            }
            _ => self.reply(REPLY_EHLO_SYNTAX, write, SmtpState::EhloRead),
        }
    }

    async fn mail_from_read(&mut self) -> SmtpState {
        if !self.request_ready().await {
            return SmtpState::MailFromRead;
        }

        let write = SmtpState::MailFromWrite;
        if let Some(next) = self.common_command(write) {
            return next;
        }

        match self.parser.command() {
            Command::Mail => {
                let sender = self.parser.request().arg.clone();
                let text = format!("250 Mail from received - {}\r\n", sender);
                self.mail_from = Some(sender);
                self.reply(&text, write, SmtpState::RcptToRead)
            }
            Command::Rcpt => self.reply(REPLY_MAIL_FIRST, write, SmtpState::MailFromRead),
            _ => self.reply(REPLY_MAIL_SYNTAX, write, SmtpState::MailFromRead),
        }
    }

    async fn rcpt_to_read(&mut self) -> SmtpState {
        if !self.request_ready().await {
            return SmtpState::RcptToRead;
        }

        let write = SmtpState::RcptToWrite;
        if let Some(next) = self.common_command(write) {
            return next;
        }

        match self.parser.command() {
            Command::Rcpt => self.accept_recipient(SmtpState::RcptToRead).await,
            Command::Data => self.reply(REPLY_RCPT_FIRST, write, SmtpState::RcptToRead),
            _ => self.reply(REPLY_RCPT_SYNTAX, write, SmtpState::RcptToRead),
        }
    }

    /// Adds the parsed RCPT address; on refusal the session goes back to
    /// `refused`.
    async fn accept_recipient(&mut self, refused: SmtpState) -> SmtpState {
        let write = SmtpState::RcptToWrite;
        let address = self.parser.request().arg.clone();

        let Some(mailbox) = rcpt::local_recipient(&address, &self.opt.domain) else {
            self.logger
                .log(
                    &self.client_addr,
                    &format!("RCPT TO rejected: {}", crate::utils::safe_log_string(&address)),
                )
                .await;
            return self.reply(REPLY_INVALID_DOMAIN, write, refused);
        };
        if self.recipients.is_full() && !self.recipients.contains(&mailbox) {
            return self.reply(REPLY_TOO_MANY_RCPT, write, refused);
        }

        self.recipients.add_recipient(&mailbox);
        let text = format!("250 Rcpt to received - {}\r\n", address);
        self.reply(&text, write, SmtpState::DataRead)
    }

    async fn data_read(&mut self) -> SmtpState {
        if !self.request_ready().await {
            return SmtpState::DataRead;
        }

        let write = SmtpState::DataWrite;
        if let Some(next) = self.common_command(write) {
            return next;
        }

        match self.parser.command() {
            Command::Data => self.start_delivery().await,
            Command::Rcpt => self.accept_recipient(SmtpState::DataRead).await,
            _ => self.reply(REPLY_DATA_SYNTAX, write, SmtpState::DataRead),
        }
    }

    async fn start_delivery(&mut self) -> SmtpState {
        let sender = self.mail_from.clone().unwrap_or_default();
        let transformation = if self.context.transformations_enabled() {
            Some(self.opt.transform.as_str())
        } else {
            None
        };

        let prepared = self
            .recipients
            .prepare_delivery(&self.opt.mail_dir, &sender, transformation)
            .await;

        match prepared {
            Ok(failures) => {
                log_failures(&self.logger, &self.client_addr, &failures).await;
                self.message_size = 0;
                self.oversized = false;
                self.reply(REPLY_START_DATA, SmtpState::DataWrite, SmtpState::MailInfoRead)
            }
            Err(e) => {
                self.logger
                    .log(&self.client_addr, &format!("Delivery setup failed: {}", e))
                    .await;
                self.recipients.abort_delivery().await;
                SmtpState::Error
            }
        }
    }

    async fn mail_info_read(&mut self) -> SmtpState {
        loop {
            let state = self.data_parser.consume(&mut self.read_buffer);

            if !self.oversized {
                self.message_size += self.data_parser.chunk().len();
                if self.message_size > MAX_MESSAGE_SIZE {
                    self.oversized = true;
                    self.logger
                        .log(&self.client_addr, "Message too big, discarding content")
                        .await;
                    self.recipients.abort_delivery().await;
                } else {
                    let failures = self
                        .recipients
                        .broadcast_chunk(self.data_parser.chunk())
                        .await;
                    log_failures(&self.logger, &self.client_addr, &failures).await;
                }
            }
            self.data_parser.recycle();

            if state.is_done() {
                return self.end_of_data().await;
            }
            if !self.read_buffer.can_read() {
                return SmtpState::MailInfoRead;
            }
        }
    }

    async fn end_of_data(&mut self) -> SmtpState {
        let write = SmtpState::MailInfoWrite;
        if self.oversized {
            return self.reply(REPLY_TOO_BIG, write, SmtpState::MailFromRead);
        }

        // Le CRLF avant le point termine la dernière ligne
        let failures = self
            .recipients
            .broadcast_chunk(self.data_parser.closing_line_break())
            .await;
        log_failures(&self.logger, &self.client_addr, &failures).await;

        let delivered = self.recipients.finalize_delivery().await;
        log_failures(&self.logger, &self.client_addr, &delivered.failures).await;

        if delivered.published == 0 {
            return self.reply(REPLY_TRANSACTION_FAILED, write, SmtpState::MailFromRead);
        }

        self.context.mail_sent();
        let message = format!(
            "Mail from <{}> (helo {}) delivered to {} mailbox(es)",
            crate::utils::safe_log_string(self.mail_from.as_deref().unwrap_or_default()),
            crate::utils::safe_log_string(self.helo.as_deref().unwrap_or("unknown")),
            delivered.published
        );
        self.logger.log(&self.client_addr, &message).await;
        self.reply(REPLY_QUEUED, write, SmtpState::MailFromRead)
    }
}

async fn log_failures(logger: &Logger, origin: &SocketAddr, failures: &[DeliveryError]) {
    for failure in failures {
        logger.log(origin, &format!("Delivery error: {}", failure)).await;
    }
}
