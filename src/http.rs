//! HTTP-specific constants for the relay server.

/// The HTTP path prefix under which the relay accepts WebSocket connections.
///
/// The slot code is the rest of the path: an empty remainder books a new
/// slot, anything else joins the slot with that code.
pub const RELAY_PATH_PREFIX: &str = "/s/";

/// Identifier for the current signalling scheme.
///
/// Advertised in the [`VERSION_HEADER`] response header so clients can
/// detect an incompatible server and print a friendlier message urging an
/// upgrade. The relay itself never negotiates it in-band.
pub const PROTOCOL_VERSION: &str = "3";

/// The HTTP response header carrying [`PROTOCOL_VERSION`].
pub const VERSION_HEADER: &str = "x-version";

pub(crate) const WEBSOCKET_UPGRADE_PROTOCOL: &str = "websocket";
pub(crate) const SUPPORTED_WEBSOCKET_VERSION: &str = "13";
