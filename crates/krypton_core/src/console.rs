//! Per-server console rings and session fan-out.
//!
//! Both maps are process-wide and guarded by their own mutex; locks are
//! never held across I/O.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use krypton_datamodel::websocket::OutboundFrame;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Bounded history kept per server.
pub const RING_CAPACITY: usize = 100;

/// Emission cap per broadcast invocation, bounding tail amplification.
pub const BROADCAST_FANOUT_LIMIT: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogType {
    Info,
    Success,
    Error,
    Warning,
    Daemon,
}

impl LogType {
    fn color(&self) -> &'static str {
        match self {
            LogType::Info => "\x1b[37m",
            LogType::Success => "\x1b[32m",
            LogType::Error => "\x1b[31m",
            LogType::Warning => "\x1b[33m",
            LogType::Daemon => "\x1b[35m",
        }
    }
}

/// Cosmetic formatting; the escape codes carry no meaning and may be
/// stripped before persistence.
pub fn format_line(ty: LogType, message: &str) -> String {
    match ty {
        LogType::Daemon => format!("{}[Krypton Daemon]\x1b[0m {message}", ty.color()),
        _ => format!("{}{message}\x1b[0m", ty.color()),
    }
}

struct SessionHandle {
    id: u64,
    tx: mpsc::UnboundedSender<OutboundFrame>,
}

/// Owner of the per-server log rings and the authenticated-session registry.
pub struct Console {
    rings: Mutex<HashMap<String, VecDeque<String>>>,
    sessions: Mutex<HashMap<String, Vec<SessionHandle>>>,
    next_session_id: AtomicU64,
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

impl Console {
    pub fn new() -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(0),
        }
    }

    /// Append a line, deduplicating exact adjacent repeats and evicting the
    /// oldest entry past capacity.
    pub fn push(&self, server_id: &str, line: &str) {
        let mut rings = self.rings.lock();
        let ring = rings.entry(server_id.to_owned()).or_default();

        if ring.back().map(String::as_str) == Some(line) {
            return;
        }

        if ring.len() == RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(line.to_owned());
    }

    /// The most recent `n` entries, oldest first.
    pub fn tail(&self, server_id: &str, n: usize) -> Vec<String> {
        let rings = self.rings.lock();
        match rings.get(server_id) {
            Some(ring) => {
                let skip = ring.len().saturating_sub(n);
                ring.iter().skip(skip).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn clear(&self, server_id: &str) {
        if let Some(ring) = self.rings.lock().get_mut(server_id) {
            ring.clear();
        }
    }

    /// Drop all state for a deleted server. Session channels close as their
    /// senders are dropped here.
    pub fn forget(&self, server_id: &str) {
        self.rings.lock().remove(server_id);
        self.sessions.lock().remove(server_id);
    }

    /// Register an authenticated session and return its handle id.
    pub fn register(&self, server_id: &str, tx: mpsc::UnboundedSender<OutboundFrame>) -> u64 {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.sessions
            .lock()
            .entry(server_id.to_owned())
            .or_default()
            .push(SessionHandle { id, tx });
        id
    }

    pub fn unregister(&self, server_id: &str, session_id: u64) {
        let mut sessions = self.sessions.lock();
        if let Some(list) = sessions.get_mut(server_id) {
            list.retain(|s| s.id != session_id);
            if list.is_empty() {
                sessions.remove(server_id);
            }
        }
    }

    /// Send a frame to every authenticated session of one server, capped at
    /// [`BROADCAST_FANOUT_LIMIT`] emissions per invocation.
    pub fn broadcast(&self, server_id: &str, frame: &OutboundFrame) {
        let sessions = self.sessions.lock();
        let Some(list) = sessions.get(server_id) else {
            return;
        };

        let skipped = list.len().saturating_sub(BROADCAST_FANOUT_LIMIT);
        if skipped > 0 {
            tracing::warn!(
                "broadcast to {server_id} over fan-out cap, skipping {skipped} session(s)"
            );
        }

        for session in list.iter().take(BROADCAST_FANOUT_LIMIT) {
            // a closed receiver just means the session is tearing down
            let _ = session.tx.send(frame.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn dedups_adjacent_repeats_only() {
        let console = Console::new();
        console.push("s1", "a");
        console.push("s1", "a");
        console.push("s1", "b");
        console.push("s1", "a");

        assert_eq!(console.tail("s1", 10), vec!["a", "b", "a"]);
    }

    #[test]
    fn tail_returns_most_recent_entries() {
        let console = Console::new();
        for i in 0..5 {
            console.push("s1", &format!("line {i}"));
        }

        assert_eq!(console.tail("s1", 2), vec!["line 3", "line 4"]);
        assert!(console.tail("other", 2).is_empty());
    }

    #[test]
    fn clear_empties_the_ring() {
        let console = Console::new();
        console.push("s1", "a");
        console.clear("s1");
        assert!(console.tail("s1", 10).is_empty());
    }

    #[test]
    fn broadcast_caps_emissions() {
        let console = Console::new();
        let mut receivers = Vec::new();

        for _ in 0..BROADCAST_FANOUT_LIMIT + 3 {
            let (tx, rx) = mpsc::unbounded_channel();
            console.register("s1", tx);
            receivers.push(rx);
        }

        console.broadcast("s1", &OutboundFrame::console("hi"));

        let mut delivered = 0;
        for rx in receivers.iter_mut() {
            if rx.try_recv().is_ok() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, BROADCAST_FANOUT_LIMIT);
    }

    #[test]
    fn unregister_removes_the_session() {
        let console = Console::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = console.register("s1", tx);
        console.unregister("s1", id);

        console.broadcast("s1", &OutboundFrame::console("hi"));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn daemon_lines_carry_the_prefix() {
        let line = format_line(LogType::Daemon, "server started");
        assert!(line.contains("[Krypton Daemon]"));
        assert!(line.contains("server started"));
    }

    proptest! {
        #[test]
        fn ring_stays_bounded_and_dedupped(lines in proptest::collection::vec("[ab]{1,3}", 0..400)) {
            let console = Console::new();
            for line in &lines {
                console.push("s1", line);
            }

            let tail = console.tail("s1", RING_CAPACITY + 10);
            prop_assert!(tail.len() <= RING_CAPACITY);
            for pair in tail.windows(2) {
                prop_assert_ne!(&pair[0], &pair[1]);
            }

            // the tail reflects the most recent non-duplicate inserts
            let mut expect: Vec<String> = Vec::new();
            for line in &lines {
                if expect.last() != Some(line) {
                    expect.push(line.clone());
                }
            }
            let keep = expect.len().saturating_sub(RING_CAPACITY);
            prop_assert_eq!(tail, expect.split_off(keep));
        }
    }
}
