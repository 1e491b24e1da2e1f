//! Application protocol detection for published ports

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Time a server-first protocol gets to greet before we send a request
const GREETING_WAIT: Duration = Duration::from_millis(200);

const HTTP_REQUEST: &[u8] = b"HEAD / HTTP/1.0\r\nHost: localhost\r\n\r\n";

/// TLS record types a server answers a plaintext request with
const TLS_ALERT: u8 = 0x15;
const TLS_HANDSHAKE: u8 = 0x16;

/// Guess whether `addr` speaks "http", "https" or plain "tcp".
///
/// Returns `None` when nothing answers within `limit`, so the caller can fall
/// back to its default.
pub async fn detect_scheme_at(addr: &str, limit: Duration) -> Option<&'static str> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        let mut buf = [0u8; 16];

        // ssh, smtp and most databases speak first
        if let Ok(Ok(n)) = tokio::time::timeout(GREETING_WAIT, stream.read(&mut buf)).await {
            return classify_reply(&buf[..n], true);
        }

        stream.write_all(HTTP_REQUEST).await.ok()?;
        let n = stream.read(&mut buf).await.ok()?;
        classify_reply(&buf[..n], false)
    };
    let scheme = tokio::time::timeout(limit, exchange).await.ok().flatten();
    tracing::debug!("Detected scheme of {}: {:?}", addr, scheme);
    scheme
}

/// Classify the first bytes a server sent, either unprompted or in reply to
/// a plaintext HTTP request
pub(crate) fn classify_reply(reply: &[u8], unprompted: bool) -> Option<&'static str> {
    if reply.is_empty() {
        return None;
    }
    if unprompted {
        return Some("tcp");
    }
    if reply.starts_with(b"HTTP/") {
        Some("http")
    } else if matches!(reply[0], TLS_ALERT | TLS_HANDSHAKE) {
        Some("https")
    } else {
        Some("tcp")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_classify_reply() {
        assert_eq!(classify_reply(b"HTTP/1.1 200 OK\r\n", false), Some("http"));
        assert_eq!(classify_reply(&[0x15, 0x03, 0x01, 0x00, 0x02], false), Some("https"));
        assert_eq!(classify_reply(b"-ERR unknown command", false), Some("tcp"));
        assert_eq!(classify_reply(b"SSH-2.0-OpenSSH_9.6", true), Some("tcp"));
        assert_eq!(classify_reply(b"", false), None);
    }

    #[tokio::test]
    async fn test_detect_http_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await;
        });

        assert_eq!(detect_scheme_at(&addr, Duration::from_secs(2)).await, Some("http"));
    }

    #[tokio::test]
    async fn test_detect_server_first_protocol() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = socket.write_all(b"SSH-2.0-test\r\n").await;
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        });

        assert_eq!(detect_scheme_at(&addr, Duration::from_secs(2)).await, Some("tcp"));
    }

    #[tokio::test]
    async fn test_detect_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert_eq!(detect_scheme_at(&addr, Duration::from_secs(2)).await, None);
    }
}
