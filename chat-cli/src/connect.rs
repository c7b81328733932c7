//! Client role: TOFU-gate the peer, offer the local terminal's
//! capabilities, display received frames.

use bytes::Bytes;
use failure::{bail, Error};
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use structopt::StructOpt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use media::term;
use session::known_hosts::{HostCheck, KnownHosts, KEY_LEN};
use session::negotiate::{AudioConfig, SdpSession};
use session::packet::{Packet, PacketCodec, PacketType};

use crate::net::expect_packet;

#[derive(StructOpt)]
pub struct Opts {
    /// Peer address, `host:port`.
    addr: String,
}

pub async fn run(opts: Opts) -> Result<(), Error> {
    let (host, port) = match opts.addr.rsplit_once(':') {
        Some((h, p)) => (h.to_owned(), p.parse::<u16>()?),
        None => bail!("address {:?} is not host:port", opts.addr),
    };
    let identity = crate::identity::load_or_create()?;
    let socket = TcpStream::connect((host.as_str(), port)).await?;
    let mut stream = Framed::new(socket, PacketCodec::default());

    stream
        .send(Packet::new(PacketType::Hello, Bytes::copy_from_slice(&identity)))
        .await?;
    let hello = expect_packet(&mut stream, PacketType::Hello).await?;
    if hello.payload.len() != KEY_LEN {
        bail!("peer sent a {}-byte key, want {}", hello.payload.len(), KEY_LEN);
    }
    let mut peer_key = [0u8; KEY_LEN];
    peer_key.copy_from_slice(&hello.payload);

    let store = KnownHosts::open_default()?;
    match store.check(&host, port, &peer_key)? {
        HostCheck::Match => debug!("host key for {}:{} verified", host, port),
        HostCheck::Unknown => {
            // Trust on first use.
            store.add(&host, port, &peer_key, Some("pinned on first connection"))?;
            info!("first connection to {}:{}; key pinned", host, port);
        }
        HostCheck::Mismatch { expected } => {
            eprintln!("{}", store.mitm_warning(&host, port, &expected, &peer_key));
            return Err(base::Error::MitmDetected(format!("{}:{}", host, port)).into());
        }
    }

    let offer = SdpSession::generate_offer(&term::detect(), &AudioConfig::default())?;
    stream
        .send(Packet::new(
            PacketType::SdpOffer,
            Bytes::copy_from_slice(offer.text().as_bytes()),
        ))
        .await?;
    let answer_packet = expect_packet(&mut stream, PacketType::SdpAnswer).await?;
    let answer = SdpSession::parse(std::str::from_utf8(&answer_packet.payload)?)?;
    info!("negotiated {}", answer.selected_video_codec()?);

    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"\x1b[2J").await?;
    while let Some(message) = stream.next().await {
        let packet = message?;
        match packet.ptype {
            PacketType::VideoFrame => {
                stdout.write_all(&packet.payload).await?;
                stdout.flush().await?;
            }
            // Audio playout belongs to the Opus/transport collaborators.
            PacketType::AudioFrame => {}
            PacketType::Bye => {
                info!("peer said goodbye");
                break;
            }
            other => debug!("ignoring {:?} from peer", other),
        }
    }
    stdout.write_all(b"\x1b[0m\n").await?;
    Ok(())
}
