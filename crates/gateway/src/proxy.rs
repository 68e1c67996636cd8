//! The listener loop and the per-session socket pump.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mcgate_proto::error::ProtoError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::Mutex;

use crate::config_loader::GatewayConfig;
use crate::hijack::{self, SharedCapture};
use crate::session::Session;
use crate::trace::TraceWriter;

const READ_BUF_LEN: usize = 16 * 1024;
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

enum SessionEnd {
    Closed,
    Shutdown,
}

/// Binds the proxy and hijack listeners and serves sessions until SIGINT.
///
/// One session at a time: the accept loop runs a session to completion
/// before taking the next connection. A session error tears that session
/// down and the proxy keeps accepting; only bind/DNS failures at startup
/// and SIGINT end the process.
pub async fn run_proxy(config: GatewayConfig) -> anyhow::Result<()> {
    let upstream_addr = resolve_upstream(&config).await?;

    let listener = TcpListener::bind(&config.listen.proxy)
        .await
        .with_context(|| format!("bind proxy listener {}", config.listen.proxy))?;
    let hijack_listener = TcpListener::bind(&config.listen.session)
        .await
        .with_context(|| format!("bind session hijack listener {}", config.listen.session))?;

    let capture: SharedCapture = Arc::new(Mutex::new(None));
    tokio::spawn(hijack::serve(hijack_listener, capture.clone()));

    let http = reqwest::Client::builder()
        .timeout(JOIN_TIMEOUT)
        .build()
        .context("build session-service client")?;

    println!(
        "gateway.started listen={} session={} upstream={}:{} resolved={}",
        config.listen.proxy,
        config.listen.session,
        config.upstream.host,
        config.upstream.port,
        upstream_addr
    );

    loop {
        let (client, addr) = tokio::select! {
            _ = signal::ctrl_c() => {
                println!("gateway.shutdown signal=interrupt");
                return Ok(());
            }
            accepted = listener.accept() => accepted.context("accept client connection")?,
        };
        println!("gateway.accepted client={addr}");

        match handle_session(client, upstream_addr, &config, &capture, &http).await {
            Ok(SessionEnd::Closed) => println!("gateway.session.closed"),
            Ok(SessionEnd::Shutdown) => {
                println!("gateway.shutdown signal=interrupt");
                return Ok(());
            }
            Err(err) => eprintln!("gateway.session.error {err:#}"),
        }
        // Captured credentials belong to one login attempt only.
        *capture.lock().await = None;
    }
}

async fn resolve_upstream(config: &GatewayConfig) -> anyhow::Result<SocketAddr> {
    let mut addrs =
        tokio::net::lookup_host((config.upstream.host.as_str(), config.upstream.port))
            .await
            .with_context(|| format!("resolve upstream host {}", config.upstream.host))?;
    addrs
        .next()
        .ok_or_else(|| anyhow::anyhow!("no addresses for upstream host {}", config.upstream.host))
}

async fn handle_session(
    mut client: TcpStream,
    upstream_addr: SocketAddr,
    config: &GatewayConfig,
    capture: &SharedCapture,
    http: &reqwest::Client,
) -> anyhow::Result<SessionEnd> {
    let mut upstream = TcpStream::connect(upstream_addr)
        .await
        .map_err(ProtoError::Transport)
        .with_context(|| format!("connect upstream {upstream_addr}"))?;
    println!("gateway.session.connected upstream={upstream_addr}");

    let mut session = Session::new();
    session.set_trace(TraceWriter::create(&config.capture.dir)?);

    let mut client_buf = vec![0u8; READ_BUF_LEN];
    let mut upstream_buf = vec![0u8; READ_BUF_LEN];

    loop {
        let (from_client, n) = tokio::select! {
            _ = signal::ctrl_c() => return Ok(SessionEnd::Shutdown),
            read = client.read(&mut client_buf) => {
                (true, read.map_err(ProtoError::Transport).context("client read")?)
            }
            read = upstream.read(&mut upstream_buf) => {
                (false, read.map_err(ProtoError::Transport).context("upstream read")?)
            }
        };
        if n == 0 {
            println!(
                "gateway.session.eof side={}",
                if from_client { "client" } else { "server" }
            );
            return Ok(SessionEnd::Closed);
        }

        let data = if from_client {
            &client_buf[..n]
        } else {
            &upstream_buf[..n]
        };
        session.ingest(from_client, data);

        // The response to an EncryptionRequest may not reach the upstream
        // before the join call finished, so the drain pauses there.
        while let Some(pending) = session.drain(from_client)? {
            let captured = capture.lock().await.clone();
            match captured {
                Some(captured) => {
                    hijack::post_join(
                        http,
                        &config.session.join_url,
                        &config.session.user_agent,
                        &captured,
                        &pending.digest,
                    )
                    .await;
                }
                None => eprintln!("gateway.session.join_skipped reason=token_not_captured"),
            }
            session.complete_encryption_response(pending.frame_body);
        }

        let to_server = session.take_outgoing(false);
        if !to_server.is_empty() {
            upstream
                .write_all(&to_server)
                .await
                .map_err(ProtoError::Transport)
                .context("upstream write")?;
        }
        let to_client = session.take_outgoing(true);
        if !to_client.is_empty() {
            client
                .write_all(&to_client)
                .await
                .map_err(ProtoError::Transport)
                .context("client write")?;
        }

        session.tick_encryption();
    }
}
