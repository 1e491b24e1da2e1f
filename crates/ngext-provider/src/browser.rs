//! Opening public URLs in the desktop browser

use crate::{ProviderError, Result};
use std::process::Stdio;

/// Open an http(s) URL with the platform's default handler
pub fn open_in_browser(url: &str) -> Result<()> {
    if !(url.starts_with("https://") || url.starts_with("http://")) {
        return Err(ProviderError::OpenUrl(format!(
            "refusing to open non-http URL '{}'",
            url
        )));
    }

    #[cfg(target_os = "linux")]
    let result = std::process::Command::new("xdg-open")
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    #[cfg(target_os = "macos")]
    let result = std::process::Command::new("open")
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    #[cfg(target_os = "windows")]
    let result = std::process::Command::new("cmd")
        .args(["/C", "start", "", url])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    result.map_err(|e| ProviderError::OpenUrl(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_urls() {
        assert!(matches!(
            open_in_browser("file:///etc/passwd"),
            Err(ProviderError::OpenUrl(_))
        ));
        assert!(matches!(
            open_in_browser("tcp://0.tcp.ngrok.io:12345"),
            Err(ProviderError::OpenUrl(_))
        ));
    }
}
