//! Byte-at-a-time parser for SMTP command lines.
//!
//! Recognised grammar (case-insensitive, CRLF terminated):
//!
//! ```text
//! EHLO <domain>          HELO <domain>
//! MAIL FROM:<address> [params]
//! RCPT TO:<address> [params]
//! DATA   QUIT   NOOP   RSET
//! ```
//!
//! A malformed line is not fatal: the parser discards bytes up to the next
//! CRLF and only then reports [`RequestState::Error`] with
//! [`Command::Unknown`], so the caller can answer and carry on with the next
//! line.

use crate::buffer::ByteBuffer;

use thiserror::Error;

/// Longest accepted reverse/forward path, brackets excluded.
pub const ARG_MAX_LENGTH: usize = 256;
/// Longest accepted EHLO/HELO domain.
pub const DOMAIN_MAX_LENGTH: usize = 255;

const VERB_LENGTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Ehlo,
    Helo,
    Mail,
    Rcpt,
    Data,
    Quit,
    Noop,
    Rset,
    Unknown,
}

impl Command {
    fn from_verb(verb: &[u8]) -> Self {
        match verb {
            b"EHLO" => Command::Ehlo,
            b"HELO" => Command::Helo,
            b"MAIL" => Command::Mail,
            b"RCPT" => Command::Rcpt,
            b"DATA" => Command::Data,
            b"QUIT" => Command::Quit,
            b"NOOP" => Command::Noop,
            b"RSET" => Command::Rset,
            _ => Command::Unknown,
        }
    }

    /// Word expected between the verb and the colon.
    fn keyword(self) -> &'static [u8] {
        match self {
            Command::Mail => b"FROM",
            Command::Rcpt => b"TO",
            _ => b"",
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("unrecognized command")]
    UnknownVerb,

    #[error("syntax error in command arguments")]
    Syntax,

    #[error("argument too long (max {max} bytes)")]
    TooLong { max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Accumulating the four verb letters
    Verb,
    /// Matching `FROM` / `TO` after MAIL / RCPT
    Keyword,
    Colon,
    PathOpen,
    Path,
    /// Right after the closing `>`: end of line or a blank
    PathEnd,
    /// ESMTP parameters, ignored
    Params,
    DomainSep,
    Domain,
    /// Optional blanks before CR
    Trailer,
    Cr,
    /// Discarding a malformed line up to CRLF
    Skip,
    SkipCr,
    Done,
    Error,
}

impl RequestState {
    /// Terminal states; `consume` stops here.
    pub fn is_done(self) -> bool {
        matches!(self, RequestState::Done | RequestState::Error)
    }

    pub fn is_error(self) -> bool {
        self == RequestState::Error
    }
}

/// Fields captured from the last command line.
///
/// MAIL and RCPT share `arg`: it only ever holds the argument of the line
/// currently being parsed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: String,
    pub domain: String,
    pub arg: String,
}

enum Step {
    /// The byte was consumed.
    Consumed(RequestState),
    /// Same byte must be fed again in the new state.
    Redispatch(RequestState),
}

#[derive(Debug)]
pub struct RequestParser {
    request: Request,
    state: RequestState,
    command: Command,
    verb: [u8; VERB_LENGTH],
    /// Letters matched so far, of the verb or of the keyword.
    i: usize,
    error: Option<ParseError>,
}

fn is_blank(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            request: Request::default(),
            state: RequestState::Verb,
            command: Command::Unknown,
            verb: [0; VERB_LENGTH],
            i: 0,
            error: None,
        }
    }

    /// Back to verb recognition, forgetting everything captured.
    pub fn reset(&mut self) {
        self.request.verb.clear();
        self.request.domain.clear();
        self.request.arg.clear();
        self.state = RequestState::Verb;
        self.command = Command::Unknown;
        self.i = 0;
        self.error = None;
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Why the last line ended in [`RequestState::Error`].
    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    pub fn feed(&mut self, c: u8) -> RequestState {
        loop {
            match self.step(c) {
                Step::Consumed(next) => {
                    self.state = next;
                    return next;
                }
                Step::Redispatch(next) => self.state = next,
            }
        }
    }

    /// Feeds every available byte, stopping right after a terminal state so
    /// that pipelined commands stay in the buffer.
    pub fn consume(&mut self, buffer: &mut ByteBuffer) -> RequestState {
        while !self.state.is_done() {
            match buffer.read_byte() {
                Some(c) => {
                    self.feed(c);
                }
                None => break,
            }
        }
        self.state
    }

    fn fail(&mut self, error: ParseError, c: u8) -> Step {
        if self.error.is_none() {
            self.error = Some(error);
        }
        if c == b'\r' {
            Step::Consumed(RequestState::SkipCr)
        } else {
            Step::Consumed(RequestState::Skip)
        }
    }

    fn push(field: &mut String, c: u8, max: usize) -> Result<(), ParseError> {
        if field.len() >= max {
            return Err(ParseError::TooLong { max });
        }
        field.push(char::from(c));
        Ok(())
    }

    fn step(&mut self, c: u8) -> Step {
        use RequestState::*;

        match self.state {
            Verb => {
                if c.is_ascii_alphabetic() {
                    if self.i == VERB_LENGTH {
                        return self.fail(ParseError::UnknownVerb, c);
                    }
                    self.verb[self.i] = c.to_ascii_uppercase();
                    self.i += 1;
                    return Step::Consumed(Verb);
                }
                if self.i < VERB_LENGTH {
                    return self.fail(ParseError::UnknownVerb, c);
                }

                self.command = Command::from_verb(&self.verb);
                self.request.verb = String::from_utf8_lossy(&self.verb).into_owned();
                self.i = 0;
                match self.command {
                    Command::Ehlo | Command::Helo => Step::Redispatch(DomainSep),
                    Command::Mail | Command::Rcpt => Step::Redispatch(Keyword),
                    Command::Data | Command::Quit | Command::Noop | Command::Rset => {
                        Step::Redispatch(Trailer)
                    }
                    Command::Unknown => self.fail(ParseError::UnknownVerb, c),
                }
            }

            Keyword => {
                let keyword = self.command.keyword();
                if self.i == 0 && is_blank(c) {
                    Step::Consumed(Keyword)
                } else if self.i < keyword.len() && c.to_ascii_uppercase() == keyword[self.i] {
                    self.i += 1;
                    if self.i == keyword.len() {
                        Step::Consumed(Colon)
                    } else {
                        Step::Consumed(Keyword)
                    }
                } else {
                    self.fail(ParseError::Syntax, c)
                }
            }

            Colon => match c {
                b':' => Step::Consumed(PathOpen),
                c if is_blank(c) => Step::Consumed(Colon),
                _ => self.fail(ParseError::Syntax, c),
            },

            PathOpen => match c {
                b'<' => Step::Consumed(Path),
                c if is_blank(c) => Step::Consumed(PathOpen),
                _ => self.fail(ParseError::Syntax, c),
            },

            Path => match c {
                b'>' => {
                    // <> n'est valable que comme expéditeur
                    if self.request.arg.is_empty() && self.command == Command::Rcpt {
                        self.fail(ParseError::Syntax, c)
                    } else {
                        Step::Consumed(PathEnd)
                    }
                }
                b'<' => self.fail(ParseError::Syntax, c),
                c if c.is_ascii_graphic() => {
                    match Self::push(&mut self.request.arg, c, ARG_MAX_LENGTH) {
                        Ok(()) => Step::Consumed(Path),
                        Err(e) => self.fail(e, c),
                    }
                }
                _ => self.fail(ParseError::Syntax, c),
            },

            PathEnd => match c {
                b'\r' => Step::Consumed(Cr),
                c if is_blank(c) => Step::Consumed(Params),
                _ => self.fail(ParseError::Syntax, c),
            },

            Params => match c {
                b'\r' => Step::Consumed(Cr),
                b'\n' => self.fail(ParseError::Syntax, c),
                _ => Step::Consumed(Params),
            },

            DomainSep => match c {
                c if is_blank(c) => Step::Consumed(DomainSep),
                c if c.is_ascii_graphic() => Step::Redispatch(Domain),
                _ => self.fail(ParseError::Syntax, c),
            },

            Domain => match c {
                b'\r' => Step::Consumed(Cr),
                c if is_blank(c) => Step::Consumed(Trailer),
                c if c.is_ascii_graphic() => {
                    match Self::push(&mut self.request.domain, c, DOMAIN_MAX_LENGTH) {
                        Ok(()) => Step::Consumed(Domain),
                        Err(e) => self.fail(e, c),
                    }
                }
                _ => self.fail(ParseError::Syntax, c),
            },

            Trailer => match c {
                b'\r' => Step::Consumed(Cr),
                c if is_blank(c) => Step::Consumed(Trailer),
                _ => self.fail(ParseError::Syntax, c),
            },

            Cr => match c {
                b'\n' => Step::Consumed(Done),
                _ => self.fail(ParseError::Syntax, c),
            },

            Skip => match c {
                b'\r' => Step::Consumed(SkipCr),
                _ => Step::Consumed(Skip),
            },

            SkipCr => match c {
                b'\n' => {
                    self.command = Command::Unknown;
                    Step::Consumed(Error)
                }
                b'\r' => Step::Consumed(SkipCr),
                _ => Step::Consumed(Skip),
            },

            Done | Error => Step::Consumed(self.state),
        }
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}
