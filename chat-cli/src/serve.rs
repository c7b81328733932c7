//! Server role: accept one peer, negotiate, stream rendered video.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use failure::Error;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use structopt::StructOpt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use base::{pool, sync};
use media::caps::{Capability, TermCodec, TermFormat};
use media::frame::FrameRenderer;
use session::negotiate::{AudioConfig, FormatOverride, SdpSession};
use session::packet::{Packet, PacketCodec, PacketType};

use crate::capture::TestPattern;
use crate::net::expect_packet;

#[derive(StructOpt)]
pub struct Opts {
    /// Address to listen on.
    #[structopt(long, default_value = "0.0.0.0:9563")]
    listen: String,

    /// Frames per second to stream.
    #[structopt(long, default_value = "10")]
    fps: u32,

    /// Paint cell backgrounds instead of glyph foregrounds.
    #[structopt(long)]
    background: bool,
}

/// The server renders for the peer, so it can serve every codec; preference
/// order is simply best to worst.
fn server_prefs() -> Vec<Capability> {
    [
        TermCodec::Truecolor,
        TermCodec::C256,
        TermCodec::C16,
        TermCodec::Mono,
    ]
    .iter()
    .map(|&codec| Capability {
        codec,
        format: TermFormat::default(),
    })
    .collect()
}

/// Dumps the lock registry to stderr whenever `?` arrives on stdin.
fn spawn_debug_listener() {
    std::thread::spawn(|| {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut byte = [0u8; 1];
        while let Ok(1) = stdin.read(&mut byte) {
            if byte[0] == b'?' {
                eprintln!("{}", sync::registry().dump());
                eprintln!("{}", sync::registry().usage_report());
            }
        }
    });
}

pub async fn run(opts: Opts) -> Result<(), Error> {
    let identity = crate::identity::load_or_create()?;
    let listener = TcpListener::bind(&opts.listen).await?;
    info!("listening on {}; press ? for lock diagnostics", opts.listen);
    spawn_debug_listener();
    let (socket, peer) = listener.accept().await?;
    info!("peer {} connected", peer);
    serve_peer(socket, identity, &opts).await?;
    let held = sync::registry().currently_held();
    if held > 0 {
        warn!("{} lock(s) still held at shutdown", held);
    }
    pool::shutdown_global();
    Ok(())
}

async fn serve_peer(socket: TcpStream, identity: [u8; 32], opts: &Opts) -> Result<(), Error> {
    let mut stream = Framed::new(socket, PacketCodec::default());

    // Hello exchange: the connecting side speaks first.
    let hello = expect_packet(&mut stream, PacketType::Hello).await?;
    debug!("peer key {}", hex::encode(&hello.payload));
    stream
        .send(Packet::new(PacketType::Hello, Bytes::copy_from_slice(&identity)))
        .await?;

    let offer_packet = expect_packet(&mut stream, PacketType::SdpOffer).await?;
    let offer = SdpSession::parse(std::str::from_utf8(&offer_packet.payload)?)?;
    debug!("peer offered {} video codec(s)", offer.video_codecs().len());
    let answer = SdpSession::generate_answer(
        &offer,
        &server_prefs(),
        &AudioConfig::default(),
        &FormatOverride::default(),
    )?;
    stream
        .send(Packet::new(
            PacketType::SdpAnswer,
            Bytes::copy_from_slice(answer.text().as_bytes()),
        ))
        .await?;
    let selected = answer.selected_video_codec()?;
    info!("negotiated {}", selected);

    let mut renderer = FrameRenderer::new(&selected, pool::global())?;
    renderer.set_background(opts.background);
    let (cols, rows) = renderer.cell_size();

    // Rendering runs on a blocking thread; a small queue decouples it from
    // the socket and frames are dropped when the peer can't keep up.
    let (tx, mut rx) = mpsc::channel::<BytesMut>(4);
    let fps = opts.fps.max(1);
    let render_worker = tokio::task::spawn_blocking(move || {
        let mut source = TestPattern::new(cols * 2, rows * 4);
        let frame_interval = Duration::from_millis(u64::from(1000 / fps));
        let mut dropped = 0u64;
        loop {
            let frame = match renderer.render(&source.next_frame()) {
                Ok(f) => f,
                Err(e) => {
                    warn!("render failed: {}", e);
                    break;
                }
            };
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped == 1 || dropped % 100 == 0 {
                        debug!("dropped {} frame(s) to a slow peer", dropped);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
            std::thread::sleep(frame_interval);
        }
    });

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    stream
                        .send(Packet::new(PacketType::VideoFrame, frame.freeze()))
                        .await?;
                }
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(p)) if p.ptype == PacketType::Bye => {
                    info!("peer said goodbye");
                    break;
                }
                Some(Ok(p)) => debug!("ignoring {:?} from peer", p.ptype),
                Some(Err(e)) => {
                    warn!("peer connection error: {}", e);
                    break;
                }
                None => {
                    info!("peer disconnected");
                    break;
                }
            },
        }
    }
    drop(rx);
    render_worker.await?;
    Ok(())
}
