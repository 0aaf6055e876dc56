//! TCP link to the peer.
//!
//! Each dictionary travels in a PUSH frame and is answered by an ACK or a
//! NACK carrying the same transaction id. A background task reads frames:
//! it answers inbound PUSHes itself and hands their messages to the owner
//! through an mpsc receiver, and it routes ACK/NACK to the waiting sender.
//!
//! Frame: kind (u8) | txn (u8) | length (u16 LE) | dictionary bytes.
//!
//! Transaction ids wrap at 256. An id whose send timed out stays reserved
//! until its late reply arrives, so that reply can never complete a newer
//! send that happens to reuse the id.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, Mutex};
use zerocopy::{AsBytes, FromBytes};

use imgdl_core::config::LinkConfig;
use imgdl_core::wire::{FrameHeader, FrameKind, FRAME_HEADER_LEN, MAX_DICT_LEN};
use imgdl_core::AppMessage;

use crate::channel::{budget_for_inbox, Channel, ChannelError};

#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Largest dictionary either side accepts.
    pub inbox_size: usize,
    pub ack_timeout: Duration,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from(&LinkConfig::default())
    }
}

impl From<&LinkConfig> for LinkSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            inbox_size: config.inbox_size.min(MAX_DICT_LEN),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
        }
    }
}

enum Pending {
    Waiting(oneshot::Sender<FrameKind>),
    /// The sender gave up; a reply is still owed.
    Expired,
}

struct LinkInner {
    writer: Mutex<OwnedWriteHalf>,
    pending: DashMap<u8, Pending>,
    next_txn: AtomicU8,
    closed: AtomicBool,
    settings: LinkSettings,
    peer: SocketAddr,
}

/// Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Link {
    inner: Arc<LinkInner>,
}

impl Link {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        settings: LinkSettings,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<AppMessage>)> {
        let stream = TcpStream::connect(addr).await?;
        Self::new(stream, settings)
    }

    /// Wrap an established stream and start its reader task.
    pub fn new(
        stream: TcpStream,
        settings: LinkSettings,
    ) -> io::Result<(Self, mpsc::UnboundedReceiver<AppMessage>)> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(LinkInner {
            writer: Mutex::new(writer),
            pending: DashMap::new(),
            next_txn: AtomicU8::new(0),
            closed: AtomicBool::new(false),
            settings,
            peer,
        });
        tokio::spawn(read_loop(inner.clone(), reader, inbound_tx));

        tracing::info!(%peer, "link established");
        Ok((Self { inner }, inbound_rx))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close our write side. The peer sees EOF and the reader task winds down
    /// once the peer hangs up in turn.
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.writer.lock().await.shutdown().await
    }
}

impl Channel for Link {
    async fn send(&self, msg: AppMessage) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let body = msg.encode()?;
        if body.len() > inner.settings.inbox_size {
            return Err(ChannelError::TooLarge {
                size: body.len(),
                limit: inner.settings.inbox_size,
            });
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let txn = inner
            .reserve_txn(reply_tx)
            .ok_or_else(|| ChannelError::Io("no free transaction id".into()))?;
        if self.is_closed() {
            inner.pending.remove(&txn);
            return Err(ChannelError::Closed);
        }

        if let Err(e) = inner.write_frame(FrameKind::Push, txn, &body).await {
            inner.pending.remove(&txn);
            return Err(e.into());
        }
        tracing::trace!(txn, len = body.len(), "push sent");

        match tokio::time::timeout(inner.settings.ack_timeout, reply_rx).await {
            Ok(Ok(FrameKind::Ack)) => Ok(()),
            Ok(Ok(_)) => Err(ChannelError::Rejected),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                // Only if the reply has not raced in meanwhile.
                if let Some(mut entry) = inner.pending.get_mut(&txn) {
                    *entry = Pending::Expired;
                }
                tracing::debug!(txn, "push timed out, id reserved until its reply");
                Err(ChannelError::Timeout(inner.settings.ack_timeout))
            }
        }
    }

    fn payload_budget(&self) -> usize {
        budget_for_inbox(self.inner.settings.inbox_size)
    }
}

async fn read_loop(
    inner: Arc<LinkInner>,
    mut reader: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<AppMessage>,
) {
    match inner.read_frames(&mut reader, &inbound).await {
        Ok(()) => tracing::info!(peer = %inner.peer, "peer closed link"),
        Err(e) => tracing::warn!(peer = %inner.peer, error = %e, "link read failed"),
    }
    inner.closed.store(true, Ordering::Release);
    // Dropping the senders wakes every waiter with `Closed`.
    inner.pending.clear();
}

impl LinkInner {
    /// Take the next id with nothing outstanding on it.
    fn reserve_txn(&self, reply: oneshot::Sender<FrameKind>) -> Option<u8> {
        let mut reply = Some(reply);
        for _ in 0..=u8::MAX {
            let txn = self.next_txn.fetch_add(1, Ordering::Relaxed);
            if let Entry::Vacant(slot) = self.pending.entry(txn) {
                slot.insert(Pending::Waiting(reply.take()?));
                return Some(txn);
            }
        }
        None
    }

    async fn read_frames(
        &self,
        reader: &mut OwnedReadHalf,
        inbound: &mpsc::UnboundedSender<AppMessage>,
    ) -> io::Result<()> {
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        loop {
            match reader.read_exact(&mut header_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
            let header = FrameHeader::read_from(&header_buf[..])
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "short frame header"))?;

            let mut body = vec![0u8; header.length.get() as usize];
            reader.read_exact(&mut body).await?;

            match FrameKind::try_from(header.kind) {
                Ok(FrameKind::Push) => self.on_push(header.txn, &body, inbound).await?,
                Ok(kind) => self.on_reply(header.txn, kind),
                Err(e) => tracing::warn!(error = %e, "dropping frame"),
            }
        }
    }

    async fn on_push(
        &self,
        txn: u8,
        body: &[u8],
        inbound: &mpsc::UnboundedSender<AppMessage>,
    ) -> io::Result<()> {
        let reply = if body.len() > self.settings.inbox_size {
            tracing::warn!(
                txn,
                len = body.len(),
                inbox = self.settings.inbox_size,
                "push exceeds inbox, rejecting"
            );
            FrameKind::Nack
        } else {
            match AppMessage::decode(body) {
                Ok(msg) => {
                    tracing::trace!(
                        txn,
                        tuples = msg.len(),
                        head = %hex::encode(&body[..body.len().min(16)]),
                        "push received"
                    );
                    if inbound.send(msg).is_ok() {
                        FrameKind::Ack
                    } else {
                        tracing::debug!(txn, "no consumer for inbound message");
                        FrameKind::Nack
                    }
                }
                Err(e) => {
                    tracing::warn!(txn, error = %e, "malformed dictionary, rejecting");
                    FrameKind::Nack
                }
            }
        };
        self.write_frame(reply, txn, &[]).await
    }

    fn on_reply(&self, txn: u8, kind: FrameKind) {
        match self.pending.remove(&txn) {
            Some((_, Pending::Waiting(waiter))) => {
                let _ = waiter.send(kind);
            }
            Some((_, Pending::Expired)) => {
                tracing::debug!(txn, ?kind, "late reply for timed-out push, dropped")
            }
            None => tracing::debug!(txn, ?kind, "reply for unknown transaction"),
        }
    }

    async fn write_frame(&self, kind: FrameKind, txn: u8, body: &[u8]) -> io::Result<()> {
        let length = u16::try_from(body.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame body too long"))?;
        let header = FrameHeader::new(kind, txn, length);

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(header.as_bytes());
        frame.extend_from_slice(body);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use imgdl_core::MessageKey;
    use tokio::net::TcpListener;

    type Side = (Link, mpsc::UnboundedReceiver<AppMessage>);

    async fn pair(client: LinkSettings, server: LinkSettings) -> (Side, Side) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(Link::connect(addr, client), listener.accept());
        let (stream, _) = accepted.unwrap();
        (connected.unwrap(), Link::new(stream, server).unwrap())
    }

    fn settings(inbox_size: usize, ack_timeout_ms: u64) -> LinkSettings {
        LinkSettings {
            inbox_size,
            ack_timeout: Duration::from_millis(ack_timeout_ms),
        }
    }

    #[tokio::test]
    async fn push_is_acked_and_delivered() {
        let ((a, _a_rx), (b, mut b_rx)) = pair(settings(8200, 2000), settings(8200, 2000)).await;

        a.send(AppMessage::begin(300)).await.unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), AppMessage::begin(300));

        a.send(AppMessage::data(Bytes::from_static(&[1, 2, 3]))).await.unwrap();
        let data = b_rx.recv().await.unwrap();
        assert_eq!(
            data.get(MessageKey::Data).and_then(|v| v.as_bytes()).unwrap().as_ref(),
            &[1, 2, 3]
        );

        drop(b);
    }

    #[tokio::test]
    async fn both_directions_share_one_connection() {
        let ((a, mut a_rx), (b, mut b_rx)) = pair(settings(8200, 2000), settings(8200, 2000)).await;

        let (ab, ba) = tokio::join!(a.send(AppMessage::ready()), b.send(AppMessage::end()));
        ab.unwrap();
        ba.unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), AppMessage::ready());
        assert_eq!(a_rx.recv().await.unwrap(), AppMessage::end());
    }

    #[tokio::test]
    async fn oversize_push_is_nacked() {
        // Receiver inbox is 16 bytes; a 12-byte DATA encodes to 20.
        let ((a, _a_rx), (_b, mut b_rx)) = pair(settings(8200, 2000), settings(16, 2000)).await;

        let err = a
            .send(AppMessage::data(Bytes::from(vec![0u8; 12])))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::Rejected);
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sender_refuses_message_over_inbox() {
        let ((a, _a_rx), _b) = pair(settings(16, 2000), settings(8200, 2000)).await;
        assert_eq!(a.payload_budget(), 8);

        let err = a
            .send(AppMessage::data(Bytes::from(vec![0u8; 9])))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::TooLarge { size: 17, limit: 16 });
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) =
            tokio::join!(Link::connect(addr, settings(8200, 50)), listener.accept());
        let (link, _rx) = connected.unwrap();
        let (_silent, _) = accepted.unwrap();

        let err = link.send(AppMessage::ready()).await.unwrap_err();
        assert_eq!(err, ChannelError::Timeout(Duration::from_millis(50)));
    }

    async fn read_push(raw: &mut TcpStream) -> FrameHeader {
        let mut header = [0u8; FRAME_HEADER_LEN];
        raw.read_exact(&mut header).await.unwrap();
        let header = FrameHeader::read_from(&header[..]).unwrap();
        let mut body = vec![0u8; header.length.get() as usize];
        raw.read_exact(&mut body).await.unwrap();
        header
    }

    #[tokio::test]
    async fn late_reply_does_not_complete_reused_txn() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) =
            tokio::join!(Link::connect(addr, settings(8200, 50)), listener.accept());
        let (link, _rx) = connected.unwrap();
        let (mut raw, _) = accepted.unwrap();

        let err = link.send(AppMessage::ready()).await.unwrap_err();
        assert_eq!(err, ChannelError::Timeout(Duration::from_millis(50)));
        assert_eq!(read_push(&mut raw).await.txn, 0);

        // As if 255 more sends had gone by and the counter wrapped.
        link.inner.next_txn.store(0, Ordering::Relaxed);

        let peer = async {
            let header = read_push(&mut raw).await;
            assert_eq!(header.txn, 1);
            // The stale ACK arrives first and must not be taken for this send.
            raw.write_all(FrameHeader::new(FrameKind::Ack, 0, 0).as_bytes())
                .await
                .unwrap();
            raw.write_all(FrameHeader::new(FrameKind::Nack, 1, 0).as_bytes())
                .await
                .unwrap();
        };
        let (result, ()) = tokio::join!(link.send(AppMessage::end()), peer);
        assert_eq!(result.unwrap_err(), ChannelError::Rejected);
        assert!(link.inner.pending.is_empty());
    }

    #[tokio::test]
    async fn hangup_closes_link() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) =
            tokio::join!(Link::connect(addr, settings(8200, 2000)), listener.accept());
        let (link, _rx) = connected.unwrap();
        drop(accepted.unwrap());

        tokio::time::timeout(Duration::from_secs(2), async {
            while !link.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(link.send(AppMessage::ready()).await.unwrap_err(), ChannelError::Closed);
    }
}
