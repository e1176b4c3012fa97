//! Default values used by the relay.

/// The default HTTP port used by the relay server.
pub const DEFAULT_HTTP_PORT: u16 = 80;

/// The default HTTPS port used by the relay server.
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Contains all timeouts that we use in the relay.
pub(crate) mod timeouts {
    use std::time::Duration;

    /// Maximum amount of time a client is allowed to hold a slot, measured
    /// from the WebSocket upgrade.
    ///
    /// This is a hard upper bound: it covers the wait for a joiner as well
    /// as the relaying that follows, so a session cannot occupy relay
    /// resources forever no matter what its peers do.
    pub(crate) const SLOT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

    /// Maximum time the server will spend writing a close control frame.
    ///
    /// A connection that cannot take the close frame within this deadline
    /// is dropped without one.
    pub(crate) const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

    /// Maximum time allowed for a manually-configured TLS handshake to
    /// complete before the connection is dropped.
    pub(crate) const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
}
