//! The session-hijack endpoint and the outbound session-join call.
//!
//! A patched launcher points the client's session-service URL at this local
//! endpoint, so the join request that would normally go to the real session
//! service lands here. The endpoint banks the client's `accessToken`,
//! `selectedProfile` and `serverId`, and the pump later re-signs the join
//! with the gateway's own key material and forwards it to the real service.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

/// Headers plus body of a join request cannot legitimately get near this.
const MAX_BODY_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedJoin {
    pub access_token: String,
    pub selected_profile: String,
    pub server_id: String,
}

/// Written by the endpoint task, read by the pump strictly after the
/// client's EncryptionResponse (the client cannot send that before its
/// launcher has completed the join POST).
pub type SharedCapture = Arc<Mutex<Option<CapturedJoin>>>;

pub async fn serve(listener: TcpListener, capture: SharedCapture) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                println!("gateway.hijack.accepted client={addr}");
                if let Err(err) = handle_request(stream, &capture).await {
                    eprintln!("gateway.hijack.error {err:#}");
                }
            }
            Err(err) => eprintln!("gateway.hijack.accept_error {err}"),
        }
    }
}

/// Serves one join POST: headers line-by-line until the blank line,
/// `Content-Length` body read, lenient field scan, fixed 204 reply.
pub async fn handle_request<S>(stream: S, capture: &SharedCapture) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.context("read header line")?;
        if n == 0 {
            anyhow::bail!("connection closed before end of headers");
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Content-Length:") {
            content_length = value
                .trim()
                .parse()
                .with_context(|| format!("parse Content-Length {value:?}"))?;
        }
    }
    if content_length > MAX_BODY_LEN {
        anyhow::bail!("request body of {content_length} bytes over cap");
    }

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await.context("read request body")?;
    let body = String::from_utf8_lossy(&body);

    match (
        scan_json_field(&body, "accessToken"),
        scan_json_field(&body, "selectedProfile"),
        scan_json_field(&body, "serverId"),
    ) {
        (Some(access_token), Some(selected_profile), Some(server_id)) => {
            println!(
                "gateway.hijack.captured access_token_len={} profile={} server_id={}",
                access_token.len(),
                selected_profile,
                server_id
            );
            *capture.lock().await = Some(CapturedJoin {
                access_token,
                selected_profile,
                server_id,
            });
        }
        _ => eprintln!("gateway.hijack.parse_failed body_len={}", body.len()),
    }

    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");
    let response = format!(
        "HTTP/1.1 204 No Content\r\n\
         Accept-Ranges: bytes\r\n\
         Content-length: 0\r\n\
         Date: {date}\r\n\
         Server: Restlet-Framework/2.2.0\r\n\
         Connection: keep-alive\r\n\
         \r\n"
    );
    write.write_all(response.as_bytes()).await.context("write response")?;
    write.shutdown().await.ok();
    Ok(())
}

/// Permissive JSON field scan: find the key, skip to the first `"` after
/// the `:`, capture until the next `"`. Good enough for the fixed body the
/// launcher sends, and deliberately tolerant of whitespace and field order.
pub fn scan_json_field(body: &str, key: &str) -> Option<String> {
    let at = body.find(key)?;
    let rest = &body[at + key.len()..];
    let rest = &rest[rest.find(':')? + 1..];
    let rest = &rest[rest.find('"')? + 1..];
    Some(rest[..rest.find('"')?].to_string())
}

/// The re-signed join POST toward the real session service. Any failure is
/// logged and swallowed: the upstream server closes the connection itself
/// if the join did not go through.
pub async fn post_join(
    http: &reqwest::Client,
    join_url: &str,
    user_agent: &str,
    captured: &CapturedJoin,
    digest: &str,
) {
    let body = serde_json::json!({
        "accessToken": captured.access_token,
        "selectedProfile": captured.selected_profile,
        "serverId": digest,
    })
    .to_string();

    let result = http
        .post(join_url)
        .header("Content-Type", "application/json; charset=utf-8")
        .header("User-Agent", user_agent)
        .body(body)
        .send()
        .await;
    match result {
        Ok(response) if response.status().is_success() => {
            println!("gateway.hijack.join_ok status={}", response.status());
        }
        Ok(response) => {
            eprintln!("gateway.hijack.join_rejected status={}", response.status());
        }
        Err(err) => eprintln!("gateway.hijack.join_failed error={err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_is_lenient_about_layout() {
        let body = r#"{ "selectedProfile" : "B" ,"accessToken":"A","serverId":"C"}  "#;
        assert_eq!(scan_json_field(body, "accessToken").as_deref(), Some("A"));
        assert_eq!(
            scan_json_field(body, "selectedProfile").as_deref(),
            Some("B")
        );
        assert_eq!(scan_json_field(body, "serverId").as_deref(), Some("C"));
        assert_eq!(scan_json_field(body, "missing"), None);
    }

    #[tokio::test]
    async fn captures_fields_and_replies_204() {
        let (mut client, server) = tokio::io::duplex(4096);
        let capture: SharedCapture = Arc::new(Mutex::new(None));

        let task = {
            let capture = capture.clone();
            tokio::spawn(async move { handle_request(server, &capture).await })
        };

        let body = r#"{"accessToken":"A","selectedProfile":"B","serverId":"C"}   "#;
        let request = format!(
            "POST /session/minecraft/join HTTP/1.1\r\n\
             Content-Type: application/json; charset=utf-8\r\n\
             Content-Length: {}\r\n\
             \r\n{}",
            body.len(),
            body
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(response.contains("Content-length: 0\r\n"));
        assert!(response.contains("Connection: keep-alive\r\n"));
        assert!(response.ends_with("\r\n\r\n"));

        task.await.unwrap().unwrap();
        let captured = capture.lock().await.clone().unwrap();
        assert_eq!(captured.access_token, "A");
        assert_eq!(captured.selected_profile, "B");
        assert_eq!(captured.server_id, "C");
    }

    #[tokio::test]
    async fn missing_fields_still_get_a_204() {
        let (mut client, server) = tokio::io::duplex(4096);
        let capture: SharedCapture = Arc::new(Mutex::new(None));

        let task = {
            let capture = capture.clone();
            tokio::spawn(async move { handle_request(server, &capture).await })
        };

        let body = r#"{"unrelated":"x"}"#;
        let request = format!(
            "POST /session/minecraft/join HTTP/1.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert!(String::from_utf8(response)
            .unwrap()
            .starts_with("HTTP/1.1 204 No Content"));

        task.await.unwrap().unwrap();
        assert!(capture.lock().await.is_none());
    }
}
