//! Hop-by-hop header policy applied on every proxy boundary.

/// Headers that must not cross a proxy boundary in either direction.
pub const HOP_BY_HOP: [&str; 8] = [
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// Case-insensitive membership test against [`HOP_BY_HOP`].
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Detect a WebSocket upgrade: `Upgrade: websocket` together with a
/// `Connection` header listing `upgrade`.
pub fn wants_websocket_upgrade<'a, I>(headers: I) -> bool
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut has_upgrade = false;
    let mut has_connection_upgrade = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("upgrade") && value.eq_ignore_ascii_case("websocket") {
            has_upgrade = true;
        }
        if name.eq_ignore_ascii_case("connection")
            && value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case("upgrade"))
        {
            has_connection_upgrade = true;
        }
    }
    has_upgrade && has_connection_upgrade
}
