//! End-to-end SMTP dialogues over real TCP connections

use smtpd::{Opt, SmtpServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

struct TestServer {
    addr: String,
    server: Arc<SmtpServer>,
    root: TempDir,
}

impl TestServer {
    fn mailbox(&self, address: &str, sub: &str) -> Vec<PathBuf> {
        list_dir(&self.root.path().join("mails").join(address).join(sub))
    }
}

async fn start_test_server(extra: &[&str]) -> TestServer {
    let root = TempDir::new().unwrap();
    let mail_dir = root.path().join("mails");

    let mut args = vec![
        "smtpd",
        "--domain",
        "test.local",
        "--hostname",
        "mx.test.local",
        "--mail-dir",
        mail_dir.to_str().unwrap(),
    ];
    args.extend_from_slice(extra);
    let opt = Opt::from_iter(&args);

    let server = Arc::new(SmtpServer::new(opt).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // Start server in background task
    let this = Arc::clone(&server);
    tokio::spawn(async move {
        if let Err(e) = this.serve(listener, std::future::pending()).await {
            eprintln!("Error running server: {e}");
        }
    });

    TestServer { addr, server, root }
}

fn list_dir(path: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(path) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: &str) -> (Self, String) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(reader),
            writer,
        };
        let greeting = client.read_reply().await;
        (client, greeting)
    }

    /// Reads one reply, following `250-` continuation lines.
    async fn read_reply(&mut self) -> String {
        let mut reply = String::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a reply");
            let last = line.as_bytes().get(3) != Some(&b'-');
            reply.push_str(&line);
            if last {
                return reply;
            }
        }
    }

    async fn send(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn command(&mut self, command: &str) -> String {
        self.send(&format!("{command}\r\n")).await;
        self.read_reply().await
    }

    async fn expect_closed(&mut self) {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await.unwrap();
        assert_eq!(n, 0, "unexpected data: {line:?}");
    }
}

#[tokio::test]
async fn test_full_transaction() {
    let server = start_test_server(&[]).await;
    let (mut client, greeting) = TestClient::connect(&server.addr).await;
    assert_eq!(greeting, "220 mx.test.local SMTP\r\n");

    assert_eq!(
        client.command("EHLO client.example").await,
        "250-mx.test.local\r\n250-PIPELINING\r\n250 SIZE 10240000\r\n"
    );
    assert_eq!(
        client.command("MAIL FROM:<alice@example.org>").await,
        "250 Mail from received - alice@example.org\r\n"
    );
    assert_eq!(
        client.command("RCPT TO:<bob@test.local>").await,
        "250 Rcpt to received - bob@test.local\r\n"
    );
    assert_eq!(
        client.command("DATA").await,
        "354 End data with <CR><LF>.<CR><LF>\r\n"
    );

    client
        .send("Subject: hello\r\n\r\nfirst line\r\nsecond line\r\n.\r\n")
        .await;
    assert_eq!(client.read_reply().await, "250 Ok: queued\r\n");
    assert_eq!(client.command("QUIT").await, "221 Bye\r\n");
    client.expect_closed().await;

    assert!(server.mailbox("bob@test.local", "tmp").is_empty());
    assert!(server.root.path().join("mails/bob@test.local/cur").is_dir());
    let files = server.mailbox("bob@test.local", "new");
    assert_eq!(files.len(), 1);
    assert!(files[0].extension().is_some_and(|ext| ext == "txt"));

    let content = std::fs::read_to_string(&files[0]).unwrap();
    let (header, body) = content.split_once('\n').unwrap();
    assert!(header.starts_with("From alice@example.org  "));
    assert_eq!(body, "Subject: hello\r\n\r\nfirst line\r\nsecond line\r\n");

    assert_eq!(server.server.context.mails_sent(), 1);
}

#[tokio::test]
async fn test_pipelined_commands() {
    let server = start_test_server(&[]).await;
    let (mut client, _) = TestClient::connect(&server.addr).await;

    client
        .send(
            "HELO c\r\nMAIL FROM:<a@b.c>\r\nRCPT TO:<x@test.local>\r\nRCPT TO:<y@test.local>\r\n\
             DATA\r\nbody\r\n.\r\nQUIT\r\n",
        )
        .await;

    let mut codes = Vec::new();
    for _ in 0..7 {
        codes.push(client.read_reply().await[..3].to_string());
    }
    assert_eq!(codes, ["250", "250", "250", "250", "354", "250", "221"]);
    client.expect_closed().await;

    assert_eq!(server.mailbox("x@test.local", "new").len(), 1);
    assert_eq!(server.mailbox("y@test.local", "new").len(), 1);
}

#[tokio::test]
async fn test_foreign_domain_is_refused() {
    let server = start_test_server(&[]).await;
    let (mut client, _) = TestClient::connect(&server.addr).await;

    client.command("EHLO c").await;
    client.command("MAIL FROM:<a@b.c>").await;
    assert_eq!(
        client.command("RCPT TO:<x@other.com>").await,
        "550 Invalid domain. The domain specified does not exist\r\n"
    );
    assert!(client
        .command("DATA")
        .await
        .starts_with("503 Bad sequence of commands. RCPT TO command must precede DATA"));
    assert!(client
        .command("RCPT TO:<x@test.local>")
        .await
        .starts_with("250 "));
    client.command("QUIT").await;

    assert!(!server.root.path().join("mails/x@other.com").exists());
}

#[tokio::test]
async fn test_admission_control() {
    let server = start_test_server(&["--max-sessions", "1"]).await;
    let failed = "554 failed connection to mx.test.local SMTP - Use QUIT to close\r\n";

    let (mut first, greeting) = TestClient::connect(&server.addr).await;
    assert!(greeting.starts_with("220 "));

    let (mut second, greeting) = TestClient::connect(&server.addr).await;
    assert_eq!(greeting, failed);
    assert_eq!(second.command("EHLO c").await, failed);
    assert_eq!(second.command("MAIL FROM:<a@b.c>").await, failed);
    assert_eq!(second.command("QUIT").await, "221 Bye\r\n");
    second.expect_closed().await;

    assert!(first.command("EHLO c").await.starts_with("250-"));
    assert_eq!(first.command("QUIT").await, "221 Bye\r\n");
    first.expect_closed().await;

    // Les compteurs sont mis à jour après la fermeture côté serveur
    let context = &server.server.context;
    for _ in 0..100 {
        if context.current_connections() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(context.current_connections(), 0);
    assert_eq!(context.historic_connections(), 2);
    assert!(context.bytes_transferred() > 0);

    let (mut third, greeting) = TestClient::connect(&server.addr).await;
    assert!(greeting.starts_with("220 "));
    third.command("QUIT").await;
}

#[tokio::test]
async fn test_oversized_message_is_refused() {
    let server = start_test_server(&[]).await;
    let (mut client, _) = TestClient::connect(&server.addr).await;

    client.command("EHLO c").await;
    client.command("MAIL FROM:<a@b.c>").await;
    client.command("RCPT TO:<big@test.local>").await;
    client.command("DATA").await;

    let line = format!("{}\r\n", "z".repeat(998));
    let chunk = line.repeat(1000);
    for _ in 0..11 {
        client.send(&chunk).await;
    }
    client.send(".\r\n").await;
    assert_eq!(
        client.read_reply().await,
        "552 Message size exceeds fixed maximum message size\r\n"
    );

    // The session is usable again
    assert!(client
        .command("MAIL FROM:<a@b.c>")
        .await
        .starts_with("250 "));
    client.command("QUIT").await;

    assert!(server.mailbox("big@test.local", "new").is_empty());
    assert_eq!(server.server.context.mails_sent(), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_transformation_enabled_from_command_line() {
    let server = start_test_server(&["-t", "-T", "tac"]).await;
    let (mut client, _) = TestClient::connect(&server.addr).await;

    client.command("EHLO c").await;
    client.command("MAIL FROM:<a@b.c>").await;
    client.command("RCPT TO:<rev@test.local>").await;
    client.command("DATA").await;
    client.send("one\ntwo\nthree\r\n.\r\n").await;
    assert_eq!(client.read_reply().await, "250 Ok: queued\r\n");
    client.command("QUIT").await;

    let files = server.mailbox("rev@test.local", "new");
    let content = std::fs::read_to_string(&files[0]).unwrap();
    let (header, body) = content.split_once('\n').unwrap();
    assert!(header.starts_with("From a@b.c  "));
    assert_eq!(body, "three\r\ntwo\none\n");
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_transformation_fails_transaction() {
    let server = start_test_server(&["-t", "-T", "exit 1"]).await;
    let (mut client, _) = TestClient::connect(&server.addr).await;

    client.command("EHLO c").await;
    client.command("MAIL FROM:<a@b.c>").await;
    client.command("RCPT TO:<r@test.local>").await;
    client.command("DATA").await;
    client.send("short\r\n.\r\n").await;
    assert_eq!(client.read_reply().await, "554 Transaction failed\r\n");
    assert_eq!(client.command("QUIT").await, "221 Bye\r\n");

    assert!(server.mailbox("r@test.local", "new").is_empty());
}
