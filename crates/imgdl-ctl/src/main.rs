//! imgdl-ctl: stands in for the peer device.
//!
//! Connects to imgdld, waits for READY, sends its display parameters with a
//! URL, reassembles the transfer and writes the result as a PNG.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use imgdl_core::config::TransferParameters;
use imgdl_core::{AppMessage, MessageKey, ReducedBitmap, Value};
use imgdl_services::{Channel, ImageReceiver, Link, LinkSettings, ReceiverEvent};

const DEFAULT_ADDR: &str = "127.0.0.1:9876";
const DEFAULT_OUT: &str = "imgdl-out.png";

/// Longest gap between two messages before giving up.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

struct Options {
    addr: String,
    params: TransferParameters,
    out: PathBuf,
    url: String,
}

// ── Image output ──────────────────────────────────────────────────────────────

/// Expand each 2-bit channel of `11RRGGBB` back to 8 bits.
fn to_rgb(bitmap: &ReducedBitmap) -> image::RgbImage {
    let width = bitmap.width();
    let pixels = bitmap.pixels();
    image::RgbImage::from_fn(width, bitmap.height(), |x, y| {
        let p = pixels[(y * width + x) as usize];
        let level = |shift: u8| ((p >> shift) & 0x03) * 85;
        image::Rgb([level(4), level(2), level(0)])
    })
}

// ── Session ───────────────────────────────────────────────────────────────────

async fn next_message(
    inbound: &mut tokio::sync::mpsc::UnboundedReceiver<AppMessage>,
) -> Result<AppMessage> {
    tokio::time::timeout(IDLE_TIMEOUT, inbound.recv())
        .await
        .context("timed out waiting for imgdld")?
        .context("imgdld closed the connection")
}

async fn cmd_fetch(opts: Options) -> Result<()> {
    let (link, mut inbound) = Link::connect(&opts.addr, LinkSettings::default())
        .await
        .with_context(|| format!("failed to connect to imgdld at {}, is it running?", opts.addr))?;

    let mut receiver = ImageReceiver::new(opts.params.width, opts.params.height);

    // READY first; anything before it is ignored.
    loop {
        let msg = next_message(&mut inbound).await?;
        if receiver.handle(&msg).contains(&ReceiverEvent::Ready) {
            break;
        }
    }
    println!("connected to {}", link.peer_addr());

    let request = AppMessage::new()
        .with(MessageKey::ChunkSize, Value::Uint(opts.params.chunk_size as u32))
        .with(MessageKey::Width, Value::Uint(opts.params.width))
        .with(MessageKey::Height, Value::Uint(opts.params.height))
        .with(MessageKey::Url, Value::CString(opts.url.clone()));
    link.send(request)
        .await
        .context("failed to send request")?;
    println!("requested {}", opts.url);

    loop {
        let msg = next_message(&mut inbound).await?;
        for event in receiver.handle(&msg) {
            match event {
                ReceiverEvent::Started { length } => println!("receiving {} bytes", length),
                ReceiverEvent::Complete(bitmap) => {
                    to_rgb(&bitmap)
                        .save(&opts.out)
                        .with_context(|| format!("failed to write {}", opts.out.display()))?;
                    println!(
                        "wrote {}x{} image to {}",
                        bitmap.width(),
                        bitmap.height(),
                        opts.out.display()
                    );
                    let _ = link.shutdown().await;
                    return Ok(());
                }
                ReceiverEvent::Error(text) => bail!("imgdld reported an error: {}", text),
                ReceiverEvent::Ready => {}
            }
        }
    }
}

// ── Usage ─────────────────────────────────────────────────────────────────────

fn print_usage() {
    println!("Usage: imgdl-ctl [options] <url>");
    println!();
    println!("Options:");
    println!("  --addr <addr>        imgdld address (default: {})", DEFAULT_ADDR);
    println!("  --width <px>         Target width (default: 144)");
    println!("  --height <px>        Target height (default: 168)");
    println!("  --chunk-size <n>     DATA bytes per message (default: 124)");
    println!("  --out <file.png>     Output file (default: {})", DEFAULT_OUT);
}

fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut addr = DEFAULT_ADDR.to_string();
    let mut params = TransferParameters::default();
    let mut out = PathBuf::from(DEFAULT_OUT);
    let mut remaining: Vec<&str> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" => {
                i += 1;
                addr = args.get(i).context("--addr requires a value")?.clone();
            }
            "--width" => {
                i += 1;
                params.width = args
                    .get(i)
                    .context("--width requires a value")?
                    .parse()
                    .context("--width must be a number")?;
            }
            "--height" => {
                i += 1;
                params.height = args
                    .get(i)
                    .context("--height requires a value")?
                    .parse()
                    .context("--height must be a number")?;
            }
            "--chunk-size" => {
                i += 1;
                params.chunk_size = args
                    .get(i)
                    .context("--chunk-size requires a value")?
                    .parse()
                    .context("--chunk-size must be a number")?;
            }
            "--out" => {
                i += 1;
                out = PathBuf::from(args.get(i).context("--out requires a value")?);
            }
            other => remaining.push(other),
        }
        i += 1;
    }

    match remaining.as_slice() {
        [] | ["help"] | ["--help"] | ["-h"] => Ok(None),
        [url] => Ok(Some(Options {
            addr,
            params,
            out,
            url: url.to_string(),
        })),
        other => bail!("unexpected arguments: {}", other.join(" ")),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        Some(opts) => cmd_fetch(opts).await,
        None => {
            print_usage();
            Ok(())
        }
    }
}
