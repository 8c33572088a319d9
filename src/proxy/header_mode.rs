//! Header negotiation strategy, chosen per leg

use derive_more::Display;

use crate::proxy::types::TransportRequestId;

/// How request/response headers of one leg are negotiated with listeners.
///
/// Re-selected every time a leg starts: a redirect can move a request from
/// one mode to the other.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum HeaderMode {
    /// The transport reports raw headers over the trusted header channel,
    /// keyed by its own per-leg identifier. Before-send-headers and
    /// headers-received are driven by that channel.
    #[display("trusted-header-channel")]
    TrustedChannel,
    /// Headers are observed on the main loader events. The proxy runs
    /// before-send-headers itself before the transport is contacted.
    #[display("sniffed")]
    Sniffed,
}

impl HeaderMode {
    /// Trusted channel only when the factory has one, the transport identified
    /// the leg, and some listener needs raw headers.
    pub fn select(
        channel_available: bool,
        transport_request_id: TransportRequestId,
        needs_raw_headers: bool,
    ) -> Self {
        if channel_available && transport_request_id.is_assigned() && needs_raw_headers {
            Self::TrustedChannel
        } else {
            Self::Sniffed
        }
    }

    pub fn uses_header_channel(self) -> bool {
        matches!(self, Self::TrustedChannel)
    }

    /// The proxy runs before-send-headers itself instead of waiting for the channel
    pub fn runs_before_send_headers_locally(self) -> bool {
        matches!(self, Self::Sniffed)
    }

    /// Set-Cookie bearing headers must be taken from the header channel,
    /// because the main response event arrives without them
    pub fn reuses_channel_response_headers(self) -> bool {
        matches!(self, Self::TrustedChannel)
    }
}
