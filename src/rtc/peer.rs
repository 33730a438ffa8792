//! Per-connection peer session
//!
//! A `PeerSession` binds one signaling WebSocket to one WebRTC peer
//! connection for the lifetime of a session. Outbound signaling frames go
//! through an unbounded channel drained by the socket's writer task, so
//! callbacks and the close path never block on the network.
//!
//! `close` is a one-shot latch. It is safe to call from the read loop,
//! from a peer-connection callback, and from the session manager's kick
//! path (which holds the manager lock while calling it): the latch is an
//! atomic swap and the teardown that needs the manager — `release` — runs
//! on a spawned task after `close` returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::RTCDataChannel;
use webrtc::peer_connection::RTCPeerConnection;

use crate::session::{Releaser, SessionHandle};
use crate::signal::{CommandEnvelope, SignalMessage};

/// Items consumed by the signaling socket's writer task.
pub enum Outbound {
    Signal(SignalMessage),
    /// Flush-and-stop marker; the writer closes the socket after this.
    Shutdown,
}

pub struct PeerSession {
    id: String,
    signal_tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
    closed: AtomicBool,
    pc: Mutex<Option<Arc<RTCPeerConnection>>>,
    cmd_channel: Mutex<Option<Arc<RTCDataChannel>>>,
    sessions: Arc<dyn Releaser>,
}

impl PeerSession {
    pub fn new(
        id: String,
        signal_tx: mpsc::UnboundedSender<Outbound>,
        sessions: Arc<dyn Releaser>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            signal_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            pc: Mutex::new(None),
            cmd_channel: Mutex::new(None),
            sessions,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Cancelled when the session is closed; the read loop selects on this.
    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn set_peer_connection(&self, pc: Arc<RTCPeerConnection>) {
        *self.pc.lock().expect("peer lock") = Some(pc);
    }

    pub fn peer_connection(&self) -> Option<Arc<RTCPeerConnection>> {
        self.pc.lock().expect("peer lock").clone()
    }

    pub fn set_cmd_channel(&self, dc: Arc<RTCDataChannel>) {
        *self.cmd_channel.lock().expect("peer lock") = Some(dc);
    }

    /// Queue a signaling frame for the writer task. Best effort: a closed
    /// channel means the socket is already gone.
    pub fn send_signal(&self, msg: SignalMessage) {
        let _ = self.signal_tx.send(Outbound::Signal(msg));
    }

    /// Send a command envelope on the `cmd` data channel, if one is open.
    pub async fn send_cmd(&self, env: CommandEnvelope) {
        let dc = self.cmd_channel.lock().expect("peer lock").clone();
        let Some(dc) = dc else { return };
        let Ok(text) = serde_json::to_string(&env) else {
            return;
        };
        let _ = dc.send_text(text).await;
    }

    /// Tear the session down exactly once.
    ///
    /// Best-effort farewell (`error{reason}` then `bye`), then the writer
    /// is told to flush and close, the read loop is cancelled, and the
    /// peer connection close + manager release run on a spawned task.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .signal_tx
            .send(Outbound::Signal(SignalMessage::error(reason)));
        let _ = self.signal_tx.send(Outbound::Signal(SignalMessage::bye()));
        let _ = self.signal_tx.send(Outbound::Shutdown);
        self.cancel.cancel();

        let pc = self.pc.lock().expect("peer lock").take();
        let sessions = Arc::clone(&self.sessions);
        let id = self.id.clone();
        tokio::spawn(async move {
            if let Some(pc) = pc {
                let _ = pc.close().await;
            }
            sessions.release(&id);
        });
    }
}

impl SessionHandle for PeerSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn close(&self, reason: &str) {
        PeerSession::close(self, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FakeReleaser {
        released: Mutex<Vec<String>>,
        count: AtomicUsize,
    }

    impl FakeReleaser {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                released: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
            })
        }
    }

    impl Releaser for FakeReleaser {
        fn release(&self, session_id: &str) {
            self.released.lock().unwrap().push(session_id.to_string());
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<String> {
        let mut kinds = Vec::new();
        while let Ok(item) = rx.try_recv() {
            match item {
                Outbound::Signal(msg) => kinds.push(msg.kind),
                Outbound::Shutdown => kinds.push("<shutdown>".into()),
            }
        }
        kinds
    }

    #[tokio::test]
    async fn close_sends_farewell_then_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = PeerSession::new("sess-1".into(), tx, FakeReleaser::new());

        peer.close("remote_bye");
        assert_eq!(drain(&mut rx), vec!["error", "bye", "<shutdown>"]);
        assert!(peer.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let releaser = FakeReleaser::new();
        let peer = PeerSession::new("sess-1".into(), tx, releaser.clone());

        peer.close("first");
        peer.close("second");
        peer.close("third");

        // Only the first close emits anything.
        assert_eq!(drain(&mut rx), vec!["error", "bye", "<shutdown>"]);

        // Release runs once, with the session's id.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(releaser.count.load(Ordering::SeqCst), 1);
        assert_eq!(*releaser.released.lock().unwrap(), vec!["sess-1"]);
    }

    #[tokio::test]
    async fn close_races_from_many_tasks_latch_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = PeerSession::new("sess-1".into(), tx, FakeReleaser::new());

        let mut handles = Vec::new();
        for _ in 0..16 {
            let peer = peer.clone();
            handles.push(tokio::spawn(async move {
                peer.close("race");
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn send_cmd_without_channel_is_a_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = PeerSession::new("sess-1".into(), tx, FakeReleaser::new());
        // No cmd channel adopted yet; must not panic or block.
        peer.send_cmd(CommandEnvelope::text("pong", "ok")).await;
    }
}
