use bytes::Bytes;
use imgdl_core::{MessageKey, Value};
use imgdl_services::transfer::{self, Phase, TransferEngine, TransferError};
use imgdl_services::ChannelError;

use crate::*;

fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i * 7 % 256) as u8).collect::<Vec<_>>())
}

/// BEGIN(300), DATA 124/124/52, END(1) as seen by the peer.
#[tokio::test]
async fn three_chunk_transfer_over_link() -> Result<()> {
    let ((sender, _), (_peer, mut inbox)) = link_pair(settings(8200), settings(8200)).await?;
    let source = payload(300);

    let mut engine = TransferEngine::new();
    let report = transfer::run(&mut engine, &sender, source.clone(), 124).await?;
    assert_eq!(report.total_bytes, 300);
    assert_eq!(report.chunks, 3);
    assert_eq!(engine.phase(), Phase::Idle);

    let begin = recv(&mut inbox).await?;
    assert_eq!(begin.get(MessageKey::Begin).and_then(Value::as_u32), Some(300));

    let mut joined = Vec::new();
    let mut lengths = Vec::new();
    for _ in 0..3 {
        let msg = recv(&mut inbox).await?;
        let data = msg.get(MessageKey::Data).and_then(Value::as_bytes).context("expected DATA")?;
        lengths.push(data.len());
        joined.extend_from_slice(data);
    }
    assert_eq!(lengths, vec![124, 124, 52]);
    assert_eq!(joined, source.to_vec());

    let end = recv(&mut inbox).await?;
    assert_eq!(end.get(MessageKey::End).and_then(Value::as_u32), Some(1));
    Ok(())
}

/// The peer NACKs a DATA bigger than its inbox; the transfer stops there.
#[tokio::test]
async fn nack_aborts_before_end() -> Result<()> {
    let ((sender, _), (_peer, mut inbox)) = link_pair(settings(8200), settings(100)).await?;

    let mut engine = TransferEngine::new();
    let err = transfer::run(&mut engine, &sender, payload(300), 124)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::Channel {
            phase: Phase::Sending,
            offset: 0,
            source: ChannelError::Rejected,
        }
    ));
    assert_eq!(engine.phase(), Phase::Idle);

    let begin = recv(&mut inbox).await?;
    assert!(begin.contains(MessageKey::Begin));
    assert!(inbox.try_recv().is_err());
    Ok(())
}

/// A peer that never answers fails the transfer while announcing.
#[tokio::test]
async fn silent_peer_times_out_at_begin() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let near = LinkSettings {
        inbox_size: 8200,
        ack_timeout: Duration::from_millis(100),
    };
    let (connected, accepted) = tokio::join!(Link::connect(addr, near), listener.accept());
    let (sender, _rx) = connected?;
    let (_silent, _) = accepted?;

    let mut engine = TransferEngine::new();
    let err = transfer::run(&mut engine, &sender, payload(10), 124)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TransferError::Channel {
            phase: Phase::Announcing,
            source: ChannelError::Timeout(_),
            ..
        }
    ));
    Ok(())
}
