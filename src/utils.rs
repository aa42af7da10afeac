use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Convertit les caractères non imprimables en séquences d'échappement
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c == ' ' || c == '\t' => result.push(c),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

/// Escapes raw protocol bytes for a single log line.
pub fn safe_log_bytes(input: &[u8]) -> String {
    safe_log_string(&String::from_utf8_lossy(input))
}

/// Timestamped log lines on stdout, mirrored to a file when configured.
pub struct Logger {
    writer: Option<Mutex<BufWriter<File>>>,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, verbose: bool) -> anyhow::Result<Self> {
        let writer = if let Some(path) = log_file {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }

            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(Mutex::new(BufWriter::new(file)))
        } else {
            None
        };

        Ok(Self { writer, verbose })
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub async fn log(&self, origin: &SocketAddr, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let log_line = format!("{} {} {}\n", timestamp, origin, message);

        print!("{}", log_line);

        if let Some(writer) = &self.writer {
            let mut writer = writer.lock().await;
            let _ = writer.write_all(log_line.as_bytes());
            let _ = writer.flush();
        }
    }

    /// Protocol trace, only emitted in verbose mode. `details` comes from
    /// the client and is escaped.
    pub async fn log_verbose(&self, origin: &SocketAddr, title: &str, details: &[u8]) {
        if !self.verbose {
            return;
        }
        let message = format!("{} {}", title, safe_log_bytes(details));
        self.log(origin, &message).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_log_string_escapes_controls() {
        assert_eq!(safe_log_string("MAIL FROM:<a@b>\r\n"), "MAIL FROM:<a@b>\\r\\n");
        assert_eq!(safe_log_string("a\x1bb"), "a\\x1bb");
        assert_eq!(safe_log_string("é"), "\\u{e9}");
    }

    #[tokio::test]
    async fn test_log_file_is_appended() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("logs").join("smtpd.log");
        let origin: SocketAddr = "127.0.0.1:2525".parse().unwrap();

        let logger = Logger::new(Some(path.clone()), false).unwrap();
        logger.log(&origin, "first").await;
        logger.log_verbose(&origin, ">>", b"hidden").await;
        logger.log(&origin, "second").await;

        let content = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("127.0.0.1:2525 first"));
        assert!(lines[1].ends_with("127.0.0.1:2525 second"));
    }
}
