#![allow(dead_code)]

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared across the relay's codec, transport and security crates.
///
/// Per-packet errors of this kind never propagate past the component that
/// raised them: malformed RTP/RTCP/STUN datagrams are logged and dropped,
/// negotiation errors are returned to the caller of `appendClient`, and
/// security errors close the affected peer only.
#[derive(Error, Debug, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer too short: need {need}, have {have}")]
    ErrBufferShort { need: usize, have: usize },
    #[error("buffer pool exhausted")]
    ErrPoolExhausted,
    #[error("packet too big")]
    ErrPacketTooBig,

    #[error("rtp: header too short")]
    ErrRtpHeaderTooShort,
    #[error("rtp: unsupported version {0}")]
    ErrRtpBadVersion(u8),

    #[error("rtcp: header too short")]
    ErrRtcpHeaderTooShort,
    #[error("rtcp: bad packet length")]
    ErrRtcpBadLength,
    #[error("rtcp: unknown packet type {0}")]
    ErrRtcpUnknownType(u8),

    #[error("stun: bad magic cookie")]
    ErrStunBadMagicCookie,
    #[error("stun: message too short")]
    ErrStunTooShort,
    #[error("stun: message-integrity mismatch")]
    ErrStunIntegrityMismatch,
    #[error("stun: fingerprint mismatch")]
    ErrStunFingerprintMismatch,

    #[error("sdp: {0}")]
    ErrSdp(String),

    #[error("srtp: authentication tag mismatch")]
    ErrSrtpAuthFailed,
    #[error("srtp: replayed or too-old packet")]
    ErrSrtpReplay,
    #[error("srtp: no such ssrc context")]
    ErrSrtpNoContext,

    #[error("dtls: handshake failed: {0}")]
    ErrDtlsHandshakeFailed(String),
    #[error("dtls: fingerprint mismatch")]
    ErrDtlsFingerprintMismatch,
    #[error("dtls: unsupported digest algorithm {0}")]
    ErrDtlsDigestUnsupported(String),
    #[error("dtls: close notify")]
    ErrDtlsClosed,

    #[error("ice: no candidate pairs available")]
    ErrIceNoPairs,
    #[error("ice: agent failed to connect within the configured budget")]
    ErrIceFailed,
    #[error("ice: candidate component must be 1 (rtcp-mux is mandatory)")]
    ErrIceBadComponent,

    #[error("peer already closed")]
    ErrAlreadyClosed,
    #[error("io error: {0}")]
    ErrIo(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::ErrIo(e.to_string())
    }
}
