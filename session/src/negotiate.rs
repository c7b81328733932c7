//! SDP capability negotiation.
//!
//! An offer advertises the local terminal's capability vector as custom
//! video codecs (`ACIP-TC`, `ACIP-256`, `ACIP-16`, `ACIP-MONO` at payload
//! types 96 and up) plus one Opus audio section at payload type 111. The
//! answer walks the answering side's preference order, picks the first
//! codec the offer also carries (monochrome when there is no intersection),
//! and pins it at payload type 96.
//!
//! Generation renders the SDP text by hand so the wire format stays
//! byte-exact; parsing goes through the `sdp` crate and then walks the
//! media descriptions' `rtpmap`/`fmtp` attributes.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use base::Error;
use media::caps::{Capability, Charset, Compression, RendererKind, TermCodec, TermFormat};

/// The parser considers at most this many codecs per video section; payload
/// types map positionally to 96..=99.
pub const MAX_VIDEO_CODECS: usize = 4;

const VIDEO_PT_BASE: u8 = 96;
const AUDIO_PT: u8 = 111;

/// Opus configuration carried in the audio media section. Bitrate and frame
/// duration are local encoder knobs and don't go on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u8,
    pub bitrate: u32,
    pub fec: bool,
    pub dtx: bool,
    pub frame_duration_ms: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 64_000,
            fec: true,
            dtx: true,
            frame_duration_ms: 20,
        }
    }
}

/// Answer-side format overrides. `None` never overrides: only fields the
/// caller explicitly supplies replace the selected capability's format.
#[derive(Clone, Copy, Debug, Default)]
pub struct FormatOverride {
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub renderer: Option<RendererKind>,
    pub compression: Option<Compression>,
}

impl FormatOverride {
    fn apply(&self, format: &mut TermFormat) {
        if let Some(w) = self.width {
            format.width = w;
        }
        if let Some(h) = self.height {
            format.height = h;
        }
        if let Some(r) = self.renderer {
            format.renderer = r;
        }
        if let Some(c) = self.compression {
            format.compression = c;
        }
    }
}

/// One SDP session: generated (offer/answer) or parsed. Owns its capability
/// vector; in an answer the vector holds exactly one entry.
#[derive(Debug)]
pub struct SdpSession {
    session_id: u64,
    session_version: u64,
    audio: Option<AudioConfig>,
    video_codecs: Vec<Capability>,
    text: String,
}

impl SdpSession {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn session_version(&self) -> u64 {
        self.session_version
    }

    pub fn audio(&self) -> Option<&AudioConfig> {
        self.audio.as_ref()
    }

    pub fn video_codecs(&self) -> &[Capability] {
        &self.video_codecs
    }

    /// The rendered SDP text, CRLF line endings.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The negotiated codec: index 0 of an answer's capability vector.
    pub fn selected_video_codec(&self) -> Result<Capability, Error> {
        self.video_codecs
            .first()
            .copied()
            .ok_or_else(|| Error::NotFound("session has no video codec".to_owned()))
    }

    /// Generates an offer advertising `caps` in preference order. The
    /// session id is the current unix time.
    pub fn generate_offer(caps: &[Capability], audio: &AudioConfig) -> Result<SdpSession, Error> {
        let session_id = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self::build(session_id, 1, caps, audio)
    }

    /// Generates an answer to `offer`: same session id, bumped version,
    /// exactly one video codec chosen by walking `prefs` and taking the
    /// first codec the offer also advertises. No intersection downgrades to
    /// monochrome at the offer's dimensions. Fields of `overrides` the
    /// caller supplied replace the selected format's.
    pub fn generate_answer(
        offer: &SdpSession,
        prefs: &[Capability],
        audio: &AudioConfig,
        overrides: &FormatOverride,
    ) -> Result<SdpSession, Error> {
        let mut chosen = None;
        for pref in prefs {
            if let Some(offered) = offer.video_codecs.iter().find(|c| c.codec == pref.codec) {
                chosen = Some(*offered);
                break;
            }
        }
        let mut cap = match chosen {
            Some(c) => c,
            None => {
                debug!("no codec intersection with peer; falling back to monochrome");
                let mut format = TermFormat::default();
                if let Some(first) = offer.video_codecs.first() {
                    format.width = first.format.width;
                    format.height = first.format.height;
                }
                Capability {
                    codec: TermCodec::Mono,
                    format,
                }
            }
        };
        overrides.apply(&mut cap.format);
        Self::build(offer.session_id, offer.session_version + 1, &[cap], audio)
    }

    fn build(
        session_id: u64,
        session_version: u64,
        caps: &[Capability],
        audio: &AudioConfig,
    ) -> Result<SdpSession, Error> {
        if caps.is_empty() {
            return Err(Error::InvalidParam("no video capabilities to offer".to_owned()));
        }
        if caps.len() > MAX_VIDEO_CODECS {
            return Err(Error::InvalidParam(format!(
                "{} video capabilities exceed the {} payload types",
                caps.len(),
                MAX_VIDEO_CODECS
            )));
        }
        let mut text = String::new();
        write!(&mut text, "v=0\r\n").unwrap();
        write!(
            &mut text,
            "o=- {} {} IN IP4 0.0.0.0\r\n",
            session_id, session_version
        )
        .unwrap();
        write!(&mut text, "s=-\r\n").unwrap();
        write!(&mut text, "c=IN IP4 0.0.0.0\r\n").unwrap();
        write!(&mut text, "t=0 0\r\n").unwrap();

        write!(&mut text, "m=audio 9 UDP/TLS/RTP/SAVPF {}\r\n", AUDIO_PT).unwrap();
        write!(
            &mut text,
            "a=rtpmap:{} opus/{}/{}\r\n",
            AUDIO_PT, audio.sample_rate, audio.channels
        )
        .unwrap();
        write!(
            &mut text,
            "a=fmtp:{} minptime=10;useinbandfec={};usedtx={}\r\n",
            AUDIO_PT, audio.fec as u8, audio.dtx as u8
        )
        .unwrap();

        let pts: Vec<String> = (0..caps.len())
            .map(|i| (VIDEO_PT_BASE + i as u8).to_string())
            .collect();
        write!(&mut text, "m=video 9 UDP/TLS/RTP/SAVPF {}\r\n", pts.join(" ")).unwrap();
        for (i, cap) in caps.iter().enumerate() {
            let pt = VIDEO_PT_BASE + i as u8;
            write!(&mut text, "a=rtpmap:{} {}/90000\r\n", pt, cap.codec.sdp_token()).unwrap();
            let f = &cap.format;
            write!(
                &mut text,
                "a=fmtp:{} width={};height={};renderer={};charset={};compression={};csi_rep={}\r\n",
                pt,
                f.width,
                f.height,
                f.renderer.wire_name(),
                f.charset.wire_name(),
                f.compression.wire_name(),
                f.csi_rep as u8
            )
            .unwrap();
        }

        Ok(SdpSession {
            session_id,
            session_version,
            audio: Some(*audio),
            video_codecs: caps.to_vec(),
            text,
        })
    }

    /// Parses SDP text into a session. Optional fmtp fields fall back to
    /// defaults; a video payload type without its required fmtp fields is
    /// corrupt.
    pub fn parse(text: &str) -> Result<SdpSession, Error> {
        let mut cursor = std::io::Cursor::new(text.as_bytes());
        let sd = sdp::session_description::SessionDescription::unmarshal(&mut cursor)
            .map_err(|e| Error::Corrupt(format!("unparseable SDP: {}", e)))?;

        let mut audio = None;
        let mut video_codecs = Vec::new();
        for m in &sd.media_descriptions {
            match m.media_name.media.as_str() {
                "audio" => audio = parse_audio_media(m),
                "video" => video_codecs = parse_video_media(m)?,
                other => debug!("ignoring media section {:?}", other),
            }
        }

        Ok(SdpSession {
            session_id: sd.origin.session_id,
            session_version: sd.origin.session_version,
            audio,
            video_codecs,
            text: text.to_owned(),
        })
    }
}

/// Splits an `a=rtpmap`/`a=fmtp` value into (payload type, rest).
fn split_pt(value: &str) -> Option<(&str, &str)> {
    value.split_once(' ')
}

fn parse_audio_media(m: &sdp::media_description::MediaDescription) -> Option<AudioConfig> {
    let mut config = AudioConfig::default();
    let mut is_opus = false;
    for a in &m.attributes {
        let value = match a.value.as_deref() {
            Some(v) => v,
            None => continue,
        };
        match a.key.as_str() {
            "rtpmap" => {
                // rtpmap-value = payload-type SP encoding-name "/" clock-rate
                //   [ "/" encoding-params ]
                let (_, v) = match split_pt(value) {
                    Some(s) => s,
                    None => continue,
                };
                let mut parts = v.split('/');
                if parts.next() != Some("opus") {
                    continue;
                }
                is_opus = true;
                if let Some(rate) = parts.next().and_then(|r| r.parse().ok()) {
                    config.sample_rate = rate;
                }
                if let Some(ch) = parts.next().and_then(|c| c.parse().ok()) {
                    config.channels = ch;
                }
            }
            "fmtp" => {
                let (_, v) = match split_pt(value) {
                    Some(s) => s,
                    None => continue,
                };
                for param in v.split(';') {
                    match param.split_once('=') {
                        Some(("useinbandfec", v)) => config.fec = v == "1",
                        Some(("usedtx", v)) => config.dtx = v == "1",
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    if is_opus {
        Some(config)
    } else {
        None
    }
}

fn parse_video_media(
    m: &sdp::media_description::MediaDescription,
) -> Result<Vec<Capability>, Error> {
    let mut caps = Vec::new();
    for fmt in m.media_name.formats.iter().take(MAX_VIDEO_CODECS) {
        let pt: u8 = match fmt.parse() {
            Ok(pt) => pt,
            Err(_) => {
                debug!("ignoring unparseable video payload type {:?}", fmt);
                continue;
            }
        };
        // rtpmap token wins over the positional 96..=99 mapping; a foreign
        // token (not ACIP-*) disqualifies the payload type entirely.
        let mut token_codec = None;
        let mut fmtp_value = None;
        for a in &m.attributes {
            let value = match a.value.as_deref() {
                Some(v) => v,
                None => continue,
            };
            let (apt, rest) = match split_pt(value) {
                Some(s) => s,
                None => continue,
            };
            if apt != fmt.as_str() {
                continue;
            }
            match a.key.as_str() {
                "rtpmap" => {
                    let token = rest.split('/').next().unwrap_or("");
                    token_codec = Some(TermCodec::from_sdp_token(token));
                }
                "fmtp" => fmtp_value = Some(rest),
                _ => {}
            }
        }
        let codec = match token_codec {
            Some(Some(c)) => c,
            Some(None) => {
                debug!("ignoring non-ACIP codec at payload type {}", pt);
                continue;
            }
            None => match TermCodec::from_payload_type(pt) {
                Some(c) => c,
                None => {
                    debug!("ignoring unmapped video payload type {}", pt);
                    continue;
                }
            },
        };
        let fmtp = fmtp_value.ok_or_else(|| {
            Error::Corrupt(format!("video payload type {} has no fmtp", pt))
        })?;
        caps.push(Capability {
            codec,
            format: parse_video_fmtp(fmtp)?,
        });
    }
    Ok(caps)
}

lazy_static! {
    // Groups 1..=3 (width, height, renderer) are required; 4..=6 (charset,
    // compression, csi_rep) are optional. Unknown keys are ignored by
    // construction.
    static ref VIDEO_FMTP: Regex = Regex::new(
        r"width=(\d+);height=(\d+);renderer=(\w+)(?:;charset=(\w+))?(?:;compression=(\w+))?(?:;csi_rep=(\d))?"
    )
    .unwrap();
}

fn parse_video_fmtp(value: &str) -> Result<TermFormat, Error> {
    let caps = VIDEO_FMTP
        .captures(value)
        .ok_or_else(|| Error::Corrupt(format!("video fmtp missing required fields: {:?}", value)))?;
    let width = caps[1]
        .parse()
        .map_err(|_| Error::Corrupt(format!("video width overflows: {:?}", &caps[1])))?;
    let height = caps[2]
        .parse()
        .map_err(|_| Error::Corrupt(format!("video height overflows: {:?}", &caps[2])))?;
    // Malformed optional values fall back to defaults.
    let renderer = caps[3].parse().unwrap_or(RendererKind::Block);
    let charset = caps
        .get(4)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(Charset::Ascii);
    let compression = caps
        .get(5)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(Compression::None);
    let csi_rep = caps.get(6).map_or(false, |m| m.as_str() == "1");
    Ok(TermFormat {
        width,
        height,
        renderer,
        charset,
        compression,
        csi_rep,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cap(codec: TermCodec, format: TermFormat) -> Capability {
        Capability { codec, format }
    }

    fn fmt(renderer: RendererKind, charset: Charset, compression: Compression, csi_rep: bool) -> TermFormat {
        TermFormat {
            width: 80,
            height: 24,
            renderer,
            charset,
            compression,
            csi_rep,
        }
    }

    fn client_caps() -> Vec<Capability> {
        vec![
            cap(
                TermCodec::Truecolor,
                fmt(RendererKind::Block, Charset::Utf8, Compression::Rle, true),
            ),
            cap(
                TermCodec::C256,
                fmt(RendererKind::Block, Charset::Utf8, Compression::Rle, false),
            ),
            cap(
                TermCodec::Mono,
                fmt(RendererKind::Block, Charset::Ascii, Compression::None, false),
            ),
        ]
    }

    #[test]
    fn offer_text_shape() {
        let offer = SdpSession::generate_offer(&client_caps(), &AudioConfig::default()).unwrap();
        let text = offer.text();
        assert!(text.starts_with("v=0\r\n"));
        assert!(text.contains("s=-\r\n"));
        assert!(text.contains("t=0 0\r\n"));
        assert!(text.contains("m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n"));
        assert!(text.contains("a=rtpmap:111 opus/48000/2\r\n"));
        assert!(text.contains("a=fmtp:111 minptime=10;useinbandfec=1;usedtx=1\r\n"));
        assert!(text.contains("m=video 9 UDP/TLS/RTP/SAVPF 96 97 98\r\n"));
        assert!(text.contains("a=rtpmap:96 ACIP-TC/90000\r\n"));
        assert!(text.contains(
            "a=fmtp:96 width=80;height=24;renderer=block;charset=utf8;compression=rle;csi_rep=1\r\n"
        ));
        assert!(text.contains("a=rtpmap:97 ACIP-256/90000\r\n"));
        assert!(text.contains("a=rtpmap:98 ACIP-MONO/90000\r\n"));
        assert!(text.ends_with("\r\n"));
    }

    #[test]
    fn offer_parse_roundtrip() {
        let caps = client_caps();
        let offer = SdpSession::generate_offer(&caps, &AudioConfig::default()).unwrap();
        let parsed = SdpSession::parse(offer.text()).unwrap();
        assert_eq!(parsed.session_id(), offer.session_id());
        assert_eq!(parsed.session_version(), offer.session_version());
        // Capability order and every format field survive.
        assert_eq!(parsed.video_codecs(), &caps[..]);
        assert_eq!(parsed.audio(), Some(&AudioConfig::default()));
    }

    #[test]
    fn audio_flags_roundtrip() {
        let mut audio = AudioConfig::default();
        audio.fec = false;
        audio.dtx = false;
        let offer = SdpSession::generate_offer(&client_caps(), &audio).unwrap();
        assert!(offer.text().contains("useinbandfec=0;usedtx=0"));
        let parsed = SdpSession::parse(offer.text()).unwrap();
        let parsed_audio = parsed.audio().unwrap();
        assert!(!parsed_audio.fec);
        assert!(!parsed_audio.dtx);
        assert_eq!(parsed_audio.sample_rate, 48_000);
        assert_eq!(parsed_audio.channels, 2);
    }

    #[test]
    fn answer_picks_server_preference() {
        let offer = SdpSession::generate_offer(&client_caps(), &AudioConfig::default()).unwrap();
        let server_prefs = vec![
            cap(TermCodec::C256, TermFormat::default()),
            cap(TermCodec::Truecolor, TermFormat::default()),
            cap(TermCodec::Mono, TermFormat::default()),
        ];
        let answer = SdpSession::generate_answer(
            &offer,
            &server_prefs,
            &AudioConfig::default(),
            &FormatOverride::default(),
        )
        .unwrap();
        assert!(answer.text().contains("m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"));
        assert!(answer.text().contains("a=rtpmap:96 ACIP-256/90000\r\n"));
        assert_eq!(answer.session_id(), offer.session_id());
        assert_eq!(answer.session_version(), offer.session_version() + 1);

        let parsed = SdpSession::parse(answer.text()).unwrap();
        assert_eq!(parsed.video_codecs().len(), 1);
        let selected = parsed.selected_video_codec().unwrap();
        assert_eq!(selected.codec, TermCodec::C256);
        // The offer's format for that codec is preserved.
        assert_eq!(selected.format.width, 80);
        assert_eq!(selected.format.height, 24);
        assert_eq!(selected.format.charset, Charset::Utf8);
        assert_eq!(selected.format.compression, Compression::Rle);
    }

    #[test]
    fn answer_without_intersection_downgrades_to_mono() {
        let offer = SdpSession::generate_offer(
            &[cap(
                TermCodec::Truecolor,
                fmt(RendererKind::Block, Charset::Utf8, Compression::Rle, true),
            )],
            &AudioConfig::default(),
        )
        .unwrap();
        let server_prefs = vec![cap(TermCodec::Mono, TermFormat::default())];
        let answer = SdpSession::generate_answer(
            &offer,
            &server_prefs,
            &AudioConfig::default(),
            &FormatOverride::default(),
        )
        .unwrap();
        let parsed = SdpSession::parse(answer.text()).unwrap();
        let selected = parsed.selected_video_codec().unwrap();
        assert_eq!(selected.codec, TermCodec::Mono);
        // The peer's dimensions are kept.
        assert_eq!(selected.format.width, 80);
        assert_eq!(selected.format.height, 24);
    }

    #[test]
    fn answer_applies_supplied_overrides_only() {
        let offer = SdpSession::generate_offer(&client_caps(), &AudioConfig::default()).unwrap();
        let server_prefs = vec![cap(TermCodec::Truecolor, TermFormat::default())];
        let overrides = FormatOverride {
            width: Some(132),
            height: None,
            renderer: Some(RendererKind::HalfBlock),
            compression: None,
        };
        let answer = SdpSession::generate_answer(
            &offer,
            &server_prefs,
            &AudioConfig::default(),
            &overrides,
        )
        .unwrap();
        let selected = SdpSession::parse(answer.text())
            .unwrap()
            .selected_video_codec()
            .unwrap();
        assert_eq!(selected.format.width, 132);
        assert_eq!(selected.format.height, 24);
        assert_eq!(selected.format.renderer, RendererKind::HalfBlock);
        assert_eq!(selected.format.compression, Compression::Rle);
    }

    #[test]
    fn parse_static_offer() {
        let parsed = SdpSession::parse(include_str!("testdata/offer.sdp")).unwrap();
        assert_eq!(parsed.session_id(), 1714764000);
        assert_eq!(parsed.session_version(), 1);
        let audio = parsed.audio().unwrap();
        assert_eq!(audio.sample_rate, 48_000);
        assert_eq!(audio.channels, 2);
        assert!(audio.fec);
        assert!(audio.dtx);
        assert_eq!(parsed.video_codecs().len(), 3);
        assert_eq!(parsed.video_codecs()[0].codec, TermCodec::Truecolor);
        assert_eq!(parsed.video_codecs()[0].format.renderer, RendererKind::HalfBlock);
        assert!(parsed.video_codecs()[0].format.csi_rep);
        assert_eq!(parsed.video_codecs()[1].codec, TermCodec::C256);
        assert_eq!(parsed.video_codecs()[2].codec, TermCodec::Mono);
        assert_eq!(parsed.video_codecs()[2].format.charset, Charset::Ascii);
    }

    #[test]
    fn fmtp_optional_fields_default() {
        let f = parse_video_fmtp("width=100;height=30;renderer=block").unwrap();
        assert_eq!(f.width, 100);
        assert_eq!(f.height, 30);
        assert_eq!(f.charset, Charset::Ascii);
        assert_eq!(f.compression, Compression::None);
        assert!(!f.csi_rep);

        // Malformed optional values fall back, not fail.
        let f = parse_video_fmtp("width=100;height=30;renderer=bogus;charset=klingon").unwrap();
        assert_eq!(f.renderer, RendererKind::Block);
        assert_eq!(f.charset, Charset::Ascii);
    }

    #[test]
    fn fmtp_missing_required_fields_is_corrupt() {
        match parse_video_fmtp("width=100;renderer=block") {
            Err(Error::Corrupt(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn too_many_capabilities_rejected() {
        let caps = vec![cap(TermCodec::Mono, fmt(RendererKind::Block, Charset::Ascii, Compression::None, false)); 5];
        match SdpSession::generate_offer(&caps, &AudioConfig::default()) {
            Err(Error::InvalidParam(_)) => {}
            other => panic!("unexpected {:?}", other.map(|s| s.text().to_owned())),
        }
    }

    #[test]
    fn empty_offer_rejected() {
        match SdpSession::generate_offer(&[], &AudioConfig::default()) {
            Err(Error::InvalidParam(_)) => {}
            _ => panic!("expected InvalidParam"),
        }
    }

    #[test]
    fn garbage_is_corrupt() {
        match SdpSession::parse("not sdp at all") {
            Err(Error::Corrupt(_)) => {}
            _ => panic!("expected Corrupt"),
        }
    }
}
