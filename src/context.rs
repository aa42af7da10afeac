use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide counters and toggles shared by every connection.
///
/// Connections run as tokio tasks on a multi-threaded runtime, so every
/// field is atomic. Values are statistics: relaxed ordering is enough.
#[derive(Debug)]
pub struct ServerContext {
    historic_connections: AtomicU64,
    current_connections: AtomicUsize,
    bytes_transferred: AtomicU64,
    mails_sent: AtomicU64,
    transformations: AtomicBool,
    max_sessions: AtomicUsize,
}

impl ServerContext {
    pub fn new(max_sessions: usize, transformations: bool) -> Self {
        Self {
            historic_connections: AtomicU64::new(0),
            current_connections: AtomicUsize::new(0),
            bytes_transferred: AtomicU64::new(0),
            mails_sent: AtomicU64::new(0),
            transformations: AtomicBool::new(transformations),
            max_sessions: AtomicUsize::new(max_sessions),
        }
    }

    /// Registers a new connection. Every connection is counted, admitted or
    /// not; it is admitted only if fewer than `max_sessions` were open.
    pub fn open_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.historic_connections.fetch_add(1, Ordering::Relaxed);
        let open = self.current_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            context: Arc::clone(self),
            admitted: open < self.max_sessions(),
        }
    }

    pub fn historic_connections(&self) -> u64 {
        self.historic_connections.load(Ordering::Relaxed)
    }

    pub fn current_connections(&self) -> usize {
        self.current_connections.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_transferred.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn mails_sent(&self) -> u64 {
        self.mails_sent.load(Ordering::Relaxed)
    }

    pub fn mail_sent(&self) {
        self.mails_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transformations_enabled(&self) -> bool {
        self.transformations.load(Ordering::Relaxed)
    }

    pub fn set_transformations(&self, enabled: bool) {
        self.transformations.store(enabled, Ordering::Relaxed);
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions.load(Ordering::Relaxed)
    }

    pub fn set_max_sessions(&self, max: usize) {
        self.max_sessions.store(max, Ordering::Relaxed);
    }
}

/// Keeps a connection counted as current until dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    context: Arc<ServerContext>,
    admitted: bool,
}

impl ConnectionGuard {
    /// False when the session cap was already reached at accept time.
    pub fn admitted(&self) -> bool {
        self.admitted
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.context
            .current_connections
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_cap() {
        let context = Arc::new(ServerContext::new(2, false));

        let first = context.open_connection();
        let second = context.open_connection();
        let third = context.open_connection();
        assert!(first.admitted());
        assert!(second.admitted());
        assert!(!third.admitted());
        assert_eq!(context.current_connections(), 3);

        drop(first);
        drop(third);
        assert_eq!(context.current_connections(), 1);
        assert!(context.open_connection().admitted());
        assert_eq!(context.historic_connections(), 4);
    }

    #[test]
    fn test_zero_cap_rejects_everyone() {
        let context = Arc::new(ServerContext::new(0, false));
        assert!(!context.open_connection().admitted());
        assert_eq!(context.current_connections(), 0);
    }

    #[test]
    fn test_counters_and_toggles() {
        let context = ServerContext::new(500, false);
        context.add_bytes(10);
        context.add_bytes(5);
        context.mail_sent();
        assert_eq!(context.bytes_transferred(), 15);
        assert_eq!(context.mails_sent(), 1);

        assert!(!context.transformations_enabled());
        context.set_transformations(true);
        assert!(context.transformations_enabled());

        context.set_max_sessions(3);
        assert_eq!(context.max_sessions(), 3);
    }
}
