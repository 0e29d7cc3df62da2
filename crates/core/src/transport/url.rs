//! Socket endpoint derivation

use crate::error::ConnectError;

/// Socket transport path appended to the server base URL
pub const SOCKET_PATH: &str = "/socket/websocket";

/// Derive the WebSocket endpoint from the server's base HTTP(S) URL
///
/// `http` maps to `ws`, `https` to `wss`; `ws`/`wss` pass through. A trailing
/// slash on the base URL is dropped before `socket_path` is appended.
///
/// # Errors
/// `ConnectError::InvalidUrl` for any other scheme or an empty host part.
pub fn socket_url(server_url: &str, socket_path: &str) -> Result<String, ConnectError> {
    let trimmed = server_url.trim().trim_end_matches('/');

    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| ConnectError::InvalidUrl(format!("missing scheme: {}", server_url)))?;

    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(ConnectError::InvalidUrl(format!(
                "unsupported scheme '{}': {}",
                other, server_url
            )))
        }
    };

    if rest.is_empty() {
        return Err(ConnectError::InvalidUrl(format!("missing host: {}", server_url)));
    }

    Ok(format!("{}://{}{}", ws_scheme, rest, socket_path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_becomes_ws() {
        assert_eq!(
            socket_url("http://localhost:4001", SOCKET_PATH).unwrap(),
            "ws://localhost:4001/socket/websocket"
        );
    }

    #[test]
    fn test_https_becomes_wss() {
        assert_eq!(
            socket_url("https://pos.example.com", SOCKET_PATH).unwrap(),
            "wss://pos.example.com/socket/websocket"
        );
    }

    #[test]
    fn test_trailing_slash_and_base_path() {
        assert_eq!(
            socket_url("https://example.com/pos/", SOCKET_PATH).unwrap(),
            "wss://example.com/pos/socket/websocket"
        );
    }

    #[test]
    fn test_ws_passthrough_and_case() {
        assert_eq!(
            socket_url("WS://10.0.0.2:4000", SOCKET_PATH).unwrap(),
            "ws://10.0.0.2:4000/socket/websocket"
        );
    }

    #[test]
    fn test_invalid_urls() {
        assert!(matches!(socket_url("localhost:4001", SOCKET_PATH), Err(ConnectError::InvalidUrl(_))));
        assert!(matches!(socket_url("ftp://host", SOCKET_PATH), Err(ConnectError::InvalidUrl(_))));
        assert!(matches!(socket_url("http://", SOCKET_PATH), Err(ConnectError::InvalidUrl(_))));
    }
}
