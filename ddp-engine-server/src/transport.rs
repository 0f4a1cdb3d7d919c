//! The transport seam: what a WebSocket (or long-poll) layer hands the
//! server per accepted connection, and client-address derivation behind
//! trusted proxies.
//!
//! The server never frames bytes itself; it consumes a stream of text
//! frames and pushes text frames into a sink.

use std::collections::HashMap;

use tokio::sync::mpsc;

/// Outbound half of a connection. `send_frame` must not block: queue and
/// return (a slow client is the transport's problem).
pub trait ConnectionSink: Send + Sync {
    fn send_frame(
        &self,
        frame: String,
    );
    fn close(&self);
}

/// What the transport delivers for one accepted socket.
pub struct RawConnection {
    /// Inbound frames; the channel closes when the socket does.
    pub frames: mpsc::UnboundedReceiver<String>,
    pub sink: std::sync::Arc<dyn ConnectionSink>,
    /// Socket peer address, as the transport saw it.
    pub remote_address: Option<String>,
    /// Request headers from the HTTP upgrade, lowercased keys.
    pub headers: HashMap<String, String>,
}

/// Derive the client address, trusting `forwarded_count` proxies.
///
/// With zero trusted proxies the socket peer address stands. Otherwise
/// the n-th-from-last entry of `x-forwarded-for` is the client; fewer
/// entries than trusted proxies means the header cannot be trusted at
/// all and the address is unknown.
pub fn client_address(
    headers: &HashMap<String, String>,
    remote_address: Option<&str>,
    forwarded_count: u32,
) -> Option<String> {
    if forwarded_count == 0 {
        return remote_address.map(str::to_string);
    }
    let forwarded = headers.get("x-forwarded-for")?;
    let entries: Vec<&str> =
        forwarded.split(',').map(str::trim).filter(|e| !e.is_empty()).collect();
    let count = forwarded_count as usize;
    if entries.len() < count {
        return None;
    }
    Some(entries[entries.len() - count].to_string())
}

#[cfg(test)]
mod transport_test {
    use super::*;

    fn headers(forwarded: &str) -> HashMap<String, String> {
        [("x-forwarded-for".to_string(), forwarded.to_string())].into()
    }

    /// Test: zero trusted proxies uses the socket peer address
    #[test]
    fn test_no_proxies() {
        assert_eq!(
            client_address(&HashMap::new(), Some("10.0.0.9"), 0),
            Some("10.0.0.9".to_string())
        );
    }

    /// Test: the n-th-from-last forwarded entry is the client
    #[test]
    fn test_forwarded_entries() {
        let h = headers("203.0.113.7, 198.51.100.2, 10.0.0.1");
        assert_eq!(client_address(&h, Some("10.0.0.1"), 1), Some("10.0.0.1".to_string()));
        assert_eq!(client_address(&h, Some("10.0.0.1"), 2), Some("198.51.100.2".to_string()));
        assert_eq!(client_address(&h, Some("10.0.0.1"), 3), Some("203.0.113.7".to_string()));
    }

    /// Test: fewer entries than trusted proxies yields no address
    ///
    /// Scenario: a client could have forged the header,
    /// so an underpopulated chain is not trusted.
    #[test]
    fn test_short_chain_untrusted() {
        let h = headers("203.0.113.7");
        assert_eq!(client_address(&h, Some("10.0.0.1"), 2), None);
        assert_eq!(client_address(&HashMap::new(), Some("10.0.0.1"), 1), None);
    }
}
