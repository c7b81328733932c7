//! Session establishment for ascii-chat: SDP capability negotiation, the
//! packet framing codec, and the trust-on-first-use known-hosts store.

pub mod known_hosts;
pub mod negotiate;
pub mod packet;
