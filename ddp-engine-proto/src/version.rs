//! Protocol version negotiation.

/// Versions this server speaks, in preference order.
pub const SUPPORTED_VERSIONS: [&str; 4] = ["1a", "1", "pre2", "pre1"];

/// Outcome of negotiating against a client's `connect` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// The client's proposed version is the best common version.
    Accepted(String),
    /// A common version exists (or the server's favorite stands in when
    /// none does) but differs from the proposal: reply `failed` with this
    /// version and close.
    Failed(String),
}

/// Pick the first version in [`SUPPORTED_VERSIONS`] that the client also
/// supports. When nothing overlaps, the server's favorite is offered in
/// the `failed` reply so the client knows what to reconnect with.
pub fn negotiate_version(
    proposed: &str,
    client_support: &[String],
) -> Negotiation {
    let chosen = SUPPORTED_VERSIONS
        .iter()
        .find(|v| client_support.iter().any(|s| s == **v))
        .copied()
        .unwrap_or(SUPPORTED_VERSIONS[0]);

    if chosen == proposed {
        Negotiation::Accepted(chosen.to_string())
    } else {
        Negotiation::Failed(chosen.to_string())
    }
}

/// Heartbeats and `ping`/`pong` exist on every protocol except `pre1`.
pub fn version_supports_ping(version: &str) -> bool {
    version != "pre1"
}
