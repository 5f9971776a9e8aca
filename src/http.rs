//! Thin wrapper over `reqwest` for the backend wire contract (§6): plain
//! GET requests whose body is JSON even when served as `text/plain`.
//!
//! Grounded on `Solr::get`/`parse_fetch_result` in the upstream driver.

use serde_json::Value;
use tracing::debug;

use crate::error::ProxyError;

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl Default for HttpClient {
    fn default() -> Self {
        HttpClient {
            client: reqwest::Client::new(),
        }
    }
}

impl HttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// GET `url` and parse the body as JSON regardless of the
    /// `Content-Type` the backend actually sent (it serves `text/plain`).
    pub async fn get_json(&self, url: &str) -> Result<Value, ProxyError> {
        debug!(url, "GET");
        let res = self.client.get(url).send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            let detail = serde_json::from_str(&text).ok();
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                detail,
            });
        }
        let json: Value = serde_json::from_str(&text)?;
        Ok(json)
    }

    /// GET plain text (used for collection discovery, whose body is HTML).
    pub async fn get_text(&self, url: &str) -> Result<String, ProxyError> {
        debug!(url, "GET");
        let res = self.client.get(url).send().await?;
        let status = res.status();
        let text = res.text().await?;
        if !status.is_success() {
            return Err(ProxyError::Upstream { status: status.as_u16(), detail: None });
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    /// Serves one request on a background thread and returns the bound port.
    fn serve_once(response: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(response.as_bytes());
            }
        });
        port
    }

    #[tokio::test]
    async fn get_json_parses_text_plain_body_as_json() {
        let port = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 13\r\n\r\n{\"ok\": true}",
        );
        let client = HttpClient::new();
        let value = client.get_json(&format!("http://127.0.0.1:{port}/settings.json")).await.unwrap();
        assert_eq!(value["ok"], serde_json::Value::Bool(true));
    }

    #[tokio::test]
    async fn get_json_surfaces_non_2xx_as_upstream_error() {
        let port = serve_once("HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n");
        let client = HttpClient::new();
        let err = client.get_json(&format!("http://127.0.0.1:{port}/settings.json")).await.unwrap_err();
        match err {
            ProxyError::Upstream { status, .. } => assert_eq!(status, 500),
            other => panic!("expected Upstream, got {other:?}"),
        }
    }
}
