//! Shared transport plumbing for the serve/connect front ends.

use failure::{bail, format_err, Error};
use futures::StreamExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use session::packet::{Packet, PacketCodec, PacketType};

pub type PacketStream = Framed<TcpStream, PacketCodec>;

/// Reads the next packet and insists on its type; anything else is a
/// protocol violation.
pub async fn expect_packet(stream: &mut PacketStream, want: PacketType) -> Result<Packet, Error> {
    let packet = stream
        .next()
        .await
        .ok_or_else(|| format_err!("peer closed the connection while waiting for {:?}", want))??;
    if packet.ptype != want {
        bail!("expected {:?} from peer, got {:?}", want, packet.ptype);
    }
    Ok(packet)
}
