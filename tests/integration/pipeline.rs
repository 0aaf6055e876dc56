use std::io::Cursor;
use std::sync::Arc;

use imgdl_core::config::TransferParameters;
use imgdl_core::{Bitmap, MessageKey, ReducedBitmap, Value};
use imgdl_services::decoder::decode_bytes;
use imgdl_services::session::prepare_payload;
use imgdl_services::{
    DecodeError, Decoder, ImageReceiver, InboundAction, ReceiverEvent, SessionController,
};
use imgdl_services::Channel;

use crate::*;

/// Decodes the same in-memory file whatever the source says.
struct MemoryDecoder(Vec<u8>);

impl Decoder for MemoryDecoder {
    async fn decode(&self, _source: &str) -> Result<Bitmap, DecodeError> {
        decode_bytes(&self.0)
    }
}

type Daemon = Arc<SessionController<Link, MemoryDecoder>>;

fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 128])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png");
    out.into_inner()
}

/// Serve `side` the way imgdld does: READY, then inbound → controller.
fn spawn_daemon(side: Side, encoded: Vec<u8>) -> Daemon {
    let (link, mut inbound) = side;
    let controller = Arc::new(SessionController::new(
        link,
        MemoryDecoder(encoded),
        TransferParameters::default(),
    ));
    let serving = controller.clone();
    tokio::spawn(async move {
        if serving.on_ready().await.is_err() {
            return;
        }
        while let Some(msg) = inbound.recv().await {
            if let InboundAction::Deliver(url) = serving.handle_inbound(&msg) {
                let serving = serving.clone();
                tokio::spawn(async move {
                    let _ = serving.deliver(&url).await;
                });
            }
        }
    });
    controller
}

struct Outcome {
    event: ReceiverEvent,
    data_lengths: Vec<usize>,
}

async fn wait_ready(inbox: &mut UnboundedReceiver<AppMessage>) -> Result<()> {
    loop {
        if recv(inbox).await?.contains(MessageKey::Ready) {
            return Ok(());
        }
    }
}

/// Send one request and run the receiver until the transfer ends.
async fn request(
    link: &Link,
    inbox: &mut UnboundedReceiver<AppMessage>,
    params: TransferParameters,
) -> Result<Outcome> {
    let msg = AppMessage::new()
        .with(MessageKey::ChunkSize, Value::Uint(params.chunk_size as u32))
        .with(MessageKey::Width, Value::Uint(params.width))
        .with(MessageKey::Height, Value::Uint(params.height))
        .with(MessageKey::Url, Value::CString("mem://a".into()));
    link.send(msg).await?;

    let mut receiver = ImageReceiver::new(params.width, params.height);
    let mut data_lengths = Vec::new();
    loop {
        let msg = recv(inbox).await?;
        if let Some(data) = msg.get(MessageKey::Data).and_then(Value::as_bytes) {
            data_lengths.push(data.len());
        }
        for event in receiver.handle(&msg) {
            if matches!(event, ReceiverEvent::Complete(_) | ReceiverEvent::Error(_)) {
                return Ok(Outcome {
                    event,
                    data_lengths,
                });
            }
        }
    }
}

fn expected(encoded: &[u8], params: &TransferParameters) -> Result<ReducedBitmap> {
    let bitmap = decode_bytes(encoded)?;
    Ok(prepare_payload(bitmap, params)?.into_reduced()?)
}

async fn wait_idle(daemon: &Daemon) -> Result<()> {
    tokio::time::timeout(WAIT, async {
        while daemon.status().session.is_some() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("daemon never went idle")
}

/// Peer receives exactly the bitmap the daemon quantized and packed.
#[tokio::test]
async fn image_arrives_intact() -> Result<()> {
    let png = gradient_png(64, 48);
    let ((link, mut inbox), daemon_side) = link_pair(settings(8200), settings(8200)).await?;
    let _daemon = spawn_daemon(daemon_side, png.clone());

    wait_ready(&mut inbox).await?;
    let params = TransferParameters {
        chunk_size: 50,
        width: 16,
        height: 12,
    };
    let outcome = request(&link, &mut inbox, params).await?;

    // 16x12 pixels → 144 bytes → 50 + 50 + 44
    assert_eq!(outcome.data_lengths, vec![50, 50, 44]);
    match outcome.event {
        ReceiverEvent::Complete(bitmap) => assert_eq!(bitmap, expected(&png, &params)?),
        other => panic!("unexpected outcome {:?}", other),
    }
    Ok(())
}

/// A source that fails to decode reaches the peer as an ERROR message.
#[tokio::test]
async fn decode_failure_reaches_peer() -> Result<()> {
    let ((link, mut inbox), daemon_side) = link_pair(settings(8200), settings(8200)).await?;
    let daemon = spawn_daemon(daemon_side, b"not an image".to_vec());

    wait_ready(&mut inbox).await?;
    let outcome = request(&link, &mut inbox, TransferParameters::default()).await?;

    match outcome.event {
        ReceiverEvent::Error(text) => assert!(text.starts_with("decode failed"), "{}", text),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(outcome.data_lengths.is_empty());

    wait_idle(&daemon).await?;
    Ok(())
}

/// Requested chunk size above the link budget is clamped by the daemon.
#[tokio::test]
async fn oversize_chunk_request_is_clamped() -> Result<()> {
    let png = gradient_png(20, 20);
    // Inbox of 60 bytes leaves 52 bytes of DATA.
    let ((link, mut inbox), daemon_side) = link_pair(settings(60), settings(60)).await?;
    let daemon = spawn_daemon(daemon_side, png.clone());

    wait_ready(&mut inbox).await?;
    let params = TransferParameters {
        chunk_size: 8192,
        width: 8,
        height: 8,
    };
    let outcome = request(&link, &mut inbox, params).await?;

    // 8x8 pixels → 48 bytes, one chunk
    assert_eq!(outcome.data_lengths, vec![48]);
    assert!(matches!(outcome.event, ReceiverEvent::Complete(_)));
    assert_eq!(daemon.status().params.chunk_size, 52);
    Ok(())
}

/// One connection, two deliveries with different parameters.
#[tokio::test]
async fn consecutive_requests_use_latest_parameters() -> Result<()> {
    let png = gradient_png(40, 40);
    let ((link, mut inbox), daemon_side) = link_pair(settings(8200), settings(8200)).await?;
    let daemon = spawn_daemon(daemon_side, png.clone());

    wait_ready(&mut inbox).await?;

    let first = TransferParameters {
        chunk_size: 124,
        width: 12,
        height: 8,
    };
    let outcome = request(&link, &mut inbox, first).await?;
    assert_eq!(outcome.event, ReceiverEvent::Complete(expected(&png, &first)?));

    wait_idle(&daemon).await?;

    let second = TransferParameters {
        chunk_size: 30,
        width: 4,
        height: 20,
    };
    let outcome = request(&link, &mut inbox, second).await?;
    assert_eq!(outcome.event, ReceiverEvent::Complete(expected(&png, &second)?));
    assert_eq!(outcome.data_lengths, vec![30, 30]);
    Ok(())
}
