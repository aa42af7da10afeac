//! Accepted recipients and maildir delivery.
//!
//! Delivery for a message goes through three steps:
//!
//! 1. [`RcptList::prepare_delivery`] creates `<root>/<address>/{tmp,new,cur}`,
//!    opens `tmp/<uuid>.txt` and writes the envelope line. With a
//!    transformation program, the file becomes the stdout of a child process
//!    and the recipient's destination is the child's stdin.
//! 2. [`RcptList::broadcast_chunk`] writes each decoded chunk to every
//!    recipient still in good shape.
//! 3. [`RcptList::finalize_delivery`] closes everything, reaps children and
//!    renames `tmp/<file>` to `new/<file>`; or [`RcptList::abort_delivery`]
//!    closes everything and leaves the files in `tmp/`.
//!
//! A failure while writing to one recipient only disables that recipient.

use chrono::Local;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::time::timeout;
use uuid::Uuid;

/// Recipients accepted for a single message.
pub const MAX_RECIPIENTS: usize = 100;

/// How long a transformation may take to accept a chunk or to exit once its
/// input is closed.
pub const FILTER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("cannot create mailbox directory {path:?}: {source}")]
    Mailbox {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create {path:?}: {source}")]
    TempFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot write envelope for {recipient}: {source}")]
    Header {
        recipient: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot spawn transformation `{program}` for {recipient}: {source}")]
    Spawn {
        program: String,
        recipient: String,
        #[source]
        source: io::Error,
    },

    #[error("write for {recipient} failed: {source}")]
    Write {
        recipient: String,
        #[source]
        source: io::Error,
    },

    #[error("transformation for {recipient} exited with {status}")]
    Filter { recipient: String, status: ExitStatus },

    #[error("transformation for {recipient} still running after {timeout:?}, killed")]
    FilterTimeout { recipient: String, timeout: Duration },

    #[error("cannot publish {path:?}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Mailbox name for `address` when it belongs to `domain` and its local part
/// is safe to use as a directory name under the maildir root.
///
/// The domain is matched case-insensitively and rewritten as configured, so
/// every spelling of one recipient maps to the same mailbox.
pub fn local_recipient(address: &str, domain: &str) -> Option<String> {
    let (local, rest) = address.split_once('@')?;

    // Pas de traversée de répertoire via la partie locale
    let safe = !local.is_empty() && !local.starts_with('.') && !local.contains(['/', '\\']);
    if safe && rest.eq_ignore_ascii_case(domain) {
        Some(format!("{}@{}", local, domain))
    } else {
        None
    }
}

/// Where the DATA phase currently writes for one recipient.
enum Destination {
    /// Delivery not prepared yet
    Idle,
    File(File),
    Filter {
        stdin: Option<ChildStdin>,
        child: Child,
    },
    /// Gave up on this recipient for the current message
    Failed,
}

impl Destination {
    /// Closes whatever is open; a running filter is killed and reaped.
    async fn release(self) {
        match self {
            Destination::Filter { stdin, mut child } => {
                drop(stdin);
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            Destination::File(file) => drop(file),
            Destination::Idle | Destination::Failed => {}
        }
    }
}

pub struct RcptNode {
    address: String,
    mailbox: PathBuf,
    filename: String,
    destination: Destination,
}

impl RcptNode {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            mailbox: PathBuf::new(),
            filename: String::new(),
            destination: Destination::Idle,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// `tmp/<file>` inside the recipient's mailbox, once prepared.
    pub fn tmp_path(&self) -> PathBuf {
        self.mailbox.join("tmp").join(&self.filename)
    }

    pub fn new_path(&self) -> PathBuf {
        self.mailbox.join("new").join(&self.filename)
    }

    async fn fail(&mut self) {
        std::mem::replace(&mut self.destination, Destination::Failed)
            .release()
            .await;
    }
}

impl std::fmt::Debug for RcptNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let destination = match self.destination {
            Destination::Idle => "idle",
            Destination::File(_) => "file",
            Destination::Filter { .. } => "filter",
            Destination::Failed => "failed",
        };
        f.debug_struct("RcptNode")
            .field("address", &self.address)
            .field("filename", &self.filename)
            .field("destination", &destination)
            .finish()
    }
}

/// Outcome of [`RcptList::finalize_delivery`].
#[derive(Debug, Default)]
pub struct Delivered {
    /// Messages now visible under `new/`
    pub published: usize,
    pub failures: Vec<DeliveryError>,
}

/// Recipients of the current message, in arrival order.
#[derive(Debug)]
pub struct RcptList {
    nodes: Vec<RcptNode>,
    filter_timeout: Duration,
}

impl Default for RcptList {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            filter_timeout: FILTER_TIMEOUT,
        }
    }
}

impl RcptList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_filter_timeout(&mut self, filter_timeout: Duration) {
        self.filter_timeout = filter_timeout;
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= MAX_RECIPIENTS
    }

    pub fn iter(&self) -> impl Iterator<Item = &RcptNode> {
        self.nodes.iter()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.nodes.iter().any(|n| n.address == address)
    }

    /// Appends `address` unless it is already listed.
    pub fn add_recipient(&mut self, address: &str) {
        if !self.contains(address) {
            self.nodes.push(RcptNode::new(address));
        }
    }

    /// Opens a temp file per recipient and writes the envelope line.
    ///
    /// Mailbox or file creation failures are returned as `Err` and leave
    /// the list to be aborted by the caller. A transformation that cannot be
    /// spawned only fails its recipient and is reported in the `Ok` list.
    pub async fn prepare_delivery(
        &mut self,
        root: &Path,
        sender: &str,
        transformation: Option<&str>,
    ) -> Result<Vec<DeliveryError>, DeliveryError> {
        let date = Local::now().format("%a %b %d %H:%M:%S %Y");
        let sender = if sender.is_empty() {
            "MAILER-DAEMON"
        } else {
            sender
        };
        let header = format!("From {}  {}\n", sender, date);

        let mut failures = Vec::new();
        for node in &mut self.nodes {
            node.mailbox = root.join(&node.address);
            for sub in ["tmp", "new", "cur"] {
                let path = node.mailbox.join(sub);
                fs::create_dir_all(&path)
                    .await
                    .map_err(|source| DeliveryError::Mailbox { path, source })?;
            }

            node.filename = format!("{}.txt", Uuid::new_v4());
            let path = node.tmp_path();
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
                .map_err(|source| DeliveryError::TempFile { path, source })?;

            let written = async {
                file.write_all(header.as_bytes()).await?;
                file.flush().await
            };
            written.await.map_err(|source| DeliveryError::Header {
                recipient: node.address.clone(),
                source,
            })?;

            node.destination = match transformation {
                None => Destination::File(file),
                Some(program) => {
                    let stdout = file.into_std().await;
                    let spawned = Command::new("sh")
                        .arg("-c")
                        .arg(program)
                        .stdin(Stdio::piped())
                        .stdout(Stdio::from(stdout))
                        .stderr(Stdio::null())
                        .kill_on_drop(true)
                        .spawn();

                    match spawned {
                        Ok(mut child) => Destination::Filter {
                            stdin: child.stdin.take(),
                            child,
                        },
                        Err(source) => {
                            failures.push(DeliveryError::Spawn {
                                program: program.to_string(),
                                recipient: node.address.clone(),
                                source,
                            });
                            Destination::Failed
                        }
                    }
                }
            };
        }

        Ok(failures)
    }

    /// Writes the same chunk to every live destination.
    pub async fn broadcast_chunk(&mut self, chunk: &[u8]) -> Vec<DeliveryError> {
        let mut failures = Vec::new();
        if chunk.is_empty() {
            return failures;
        }

        let filter_timeout = self.filter_timeout;
        for node in &mut self.nodes {
            let result = match &mut node.destination {
                Destination::File(file) => file.write_all(chunk).await,
                // Un filtre qui ne lit plus son entrée ne doit pas bloquer la session
                Destination::Filter {
                    stdin: Some(stdin), ..
                } => match timeout(filter_timeout, stdin.write_all(chunk)).await {
                    Ok(written) => written,
                    Err(_) => Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "transformation stopped reading its input",
                    )),
                },
                _ => continue,
            };

            if let Err(source) = result {
                failures.push(DeliveryError::Write {
                    recipient: node.address.clone(),
                    source,
                });
                node.fail().await;
            }
        }

        failures
    }

    /// Closes every destination and publishes each completed file from
    /// `tmp/` to `new/`.
    pub async fn finalize_delivery(&mut self) -> Delivered {
        let mut delivered = Delivered::default();

        let filter_timeout = self.filter_timeout;
        for node in &mut self.nodes {
            let closed = match std::mem::replace(&mut node.destination, Destination::Idle) {
                Destination::File(mut file) => async {
                    file.flush().await?;
                    file.sync_all().await
                }
                .await
                .map_err(|source| DeliveryError::Write {
                    recipient: node.address.clone(),
                    source,
                }),
                Destination::Filter { stdin, mut child } => {
                    // EOF pour le filtre, puis on récupère le processus
                    drop(stdin);
                    match timeout(filter_timeout, child.wait()).await {
                        Ok(Ok(status)) if status.success() => Ok(()),
                        Ok(Ok(status)) => Err(DeliveryError::Filter {
                            recipient: node.address.clone(),
                            status,
                        }),
                        Ok(Err(source)) => Err(DeliveryError::Write {
                            recipient: node.address.clone(),
                            source,
                        }),
                        Err(_) => {
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                            Err(DeliveryError::FilterTimeout {
                                recipient: node.address.clone(),
                                timeout: filter_timeout,
                            })
                        }
                    }
                }
                Destination::Idle | Destination::Failed => continue,
            };

            if let Err(e) = closed {
                delivered.failures.push(e);
                continue;
            }

            let path = node.new_path();
            match fs::rename(node.tmp_path(), &path).await {
                Ok(()) => delivered.published += 1,
                Err(source) => delivered
                    .failures
                    .push(DeliveryError::Publish { path, source }),
            }
        }

        delivered
    }

    /// Closes every destination without publishing anything.
    pub async fn abort_delivery(&mut self) {
        for node in &mut self.nodes {
            std::mem::replace(&mut node.destination, Destination::Idle)
                .release()
                .await;
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}
