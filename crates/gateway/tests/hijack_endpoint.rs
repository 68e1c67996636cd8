//! End-to-end test for the session-hijack endpoint over a real socket.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use mcgate_gateway::hijack::{self, SharedCapture};

#[tokio::test]
async fn endpoint_captures_a_join_post_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let capture: SharedCapture = Arc::new(Mutex::new(None));
    tokio::spawn(hijack::serve(listener, capture.clone()));

    let body = r#"{"accessToken":"bbc3cae3264e4ad0b446fd9bb852519a","selectedProfile":"962c6718688448d4a35c249f8d30428b","serverId":"bd651042ec97910e449e11a3991e1274e3e67e5"}"#;
    let request = format!(
        "POST /session/minecraft/join HTTP/1.1\r\n\
         Content-Type: application/json; charset=utf-8\r\n\
         User-Agent: Java/1.6.0_27\r\n\
         Host: sessionserver.mojang.com\r\n\
         Connection: keep-alive\r\n\
         Content-Length: {}\r\n\
         \r\n{}",
        body.len(),
        body
    );

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8(response).unwrap();
    assert!(response.starts_with("HTTP/1.1 204 No Content\r\n"));
    assert!(response.contains("Server: Restlet-Framework/2.2.0\r\n"));

    let captured = capture.lock().await.clone().expect("captured join");
    assert_eq!(captured.access_token, "bbc3cae3264e4ad0b446fd9bb852519a");
    assert_eq!(captured.selected_profile, "962c6718688448d4a35c249f8d30428b");
    assert_eq!(captured.server_id, "bd651042ec97910e449e11a3991e1274e3e67e5");
}
