use thiserror::Error;

pub type Result<T> = std::result::Result<T, SdpError>;

/// Negotiation-level SDP errors, returned to the caller of
/// `setRemoteDescription` / `appendClient` rather than logged-and-dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("remote offer has no media sections")]
    NoRemoteMedia,
    #[error("remote offer has no media section this relay can serve")]
    NoMatchingMediaType,
    #[error("second offer received while already negotiating an offer")]
    WrongSdpTypeOfferAfterOffer,
    #[error("remote media section is missing a DTLS fingerprint")]
    DtlsFingerprintMissing,
    #[error("remote DTLS fingerprint uses an unsupported digest algorithm: {0}")]
    DtlsFingerprintDigestNotSupported(String),
    #[error("remote offer requires a data channel transport, which this relay does not support")]
    DataChannelTransportNotSupported,
    #[error("remote video media section is not compatible with the local track")]
    VideoIncompatible,
    #[error("sdp parse error: {0}")]
    Error(String),
}
