//! Localhost HTTP/CONNECT forward proxy for subprocess traffic. Implemented
//! directly over `tokio::net::TcpListener` with hand-rolled HTTP/1.1
//! request-line parsing rather than a web framework (no axum/hyper), matching
//! the listener/shutdown idiom used elsewhere in this workspace.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::domain::{DomainMatcher, is_localhost};
use crate::enforcer::OnAttempt;

const HOP_BY_HOP_HEADERS: &[&str] = &["proxy-connection", "proxy-authorization"];
const CONNECT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct EgressProxy {
    matcher: Arc<DomainMatcher>,
    on_attempt: Option<OnAttempt>,
    http: reqwest::Client,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

pub struct RunningProxy {
    pub url: String,
    shutdown_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl RunningProxy {
    /// Idempotent: a second call observes the already-true shutdown flag
    /// and returns immediately.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, self.join).await;
    }
}

impl EgressProxy {
    pub fn new(matcher: DomainMatcher) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            matcher: Arc::new(matcher),
            on_attempt: None,
            http: reqwest::Client::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn with_on_attempt(mut self, cb: OnAttempt) -> Self {
        self.on_attempt = Some(cb);
        self
    }

    /// Binds to `127.0.0.1:0` and spawns the accept loop. Returns the proxy
    /// URL and a handle whose `stop()` shuts the server down gracefully.
    pub async fn start(self) -> anyhow::Result<RunningProxy> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let url = format!("http://{addr}");

        let matcher = self.matcher.clone();
        let on_attempt = self.on_attempt.clone();
        let http = self.http.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();
        let shutdown_tx = self.shutdown_tx.clone();

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accepted = listener.accept() => {
                        let Ok((stream, peer)) = accepted else { continue };
                        let matcher = matcher.clone();
                        let on_attempt = on_attempt.clone();
                        let http = http.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer, matcher, on_attempt, http).await {
                                tracing::warn!(error = %e, "egress proxy connection error");
                            }
                        });
                    }
                }
            }
        });

        Ok(RunningProxy { url, shutdown_tx, join })
    }
}

async fn handle_connection(
    stream: TcpStream,
    _peer: SocketAddr,
    matcher: Arc<DomainMatcher>,
    on_attempt: Option<OnAttempt>,
    http: reqwest::Client,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stream);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(());
    }
    let request_line = request_line.trim_end();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let check = |host: &str| is_localhost(host) || matcher.is_allowed(host);
    let fire = |host: &str, allowed: bool| {
        if let Some(cb) = &on_attempt {
            cb(host, allowed);
        }
    };

    if method.eq_ignore_ascii_case("CONNECT") {
        let host = target.split(':').next().unwrap_or(&target).to_string();
        let allowed = check(&host);
        fire(&host, allowed);

        let mut stream = reader.into_inner();
        if !allowed {
            stream.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await?;
            return Ok(());
        }

        let upstream = match tokio::time::timeout(CONNECT_DIAL_TIMEOUT, TcpStream::connect(&target)).await {
            Ok(Ok(s)) => s,
            _ => {
                stream.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
                return Ok(());
            }
        };

        stream.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
        relay(stream, upstream).await;
        return Ok(());
    }

    // Plain absolute-URI HTTP request.
    let parsed = url::Url::parse(&target).ok();
    let host = parsed.as_ref().and_then(|u| u.host_str()).unwrap_or_default().to_string();
    let allowed = check(&host);
    fire(&host, allowed);

    let mut client_stream = reader.into_inner();
    if !allowed {
        client_stream.write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n").await?;
        return Ok(());
    }

    let body = {
        let content_length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);
        let mut buf = vec![0u8; content_length];
        if content_length > 0 {
            client_stream.read_exact(&mut buf).await?;
        }
        buf
    };

    let mut builder = http.request(
        reqwest::Method::from_bytes(method.as_bytes()).unwrap_or(reqwest::Method::GET),
        &target,
    );
    for (name, value) in &headers {
        if HOP_BY_HOP_HEADERS.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    if !body.is_empty() {
        builder = builder.body(body);
    }

    let upstream_response = builder.send().await;
    match upstream_response {
        Ok(resp) => {
            let status = resp.status();
            let mut out = format!("HTTP/1.1 {} {}\r\n", status.as_u16(), status.canonical_reason().unwrap_or(""));
            for (name, value) in resp.headers() {
                out.push_str(&format!("{}: {}\r\n", name, value.to_str().unwrap_or_default()));
            }
            let body = resp.bytes().await.unwrap_or_default();
            out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
            client_stream.write_all(out.as_bytes()).await?;
            client_stream.write_all(&body).await?;
        }
        Err(e) => {
            let msg = format!("HTTP/1.1 502 Bad Gateway\r\n\r\n{e}");
            client_stream.write_all(msg.as_bytes()).await?;
        }
    }

    Ok(())
}

/// Blind-relays bytes in both directions until either side closes. TLS
/// inside a CONNECT tunnel is never terminated.
async fn relay(client: TcpStream, upstream: TcpStream) {
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let client_to_upstream = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut client_r, &mut upstream_w).await;
    });
    let upstream_to_client = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut upstream_r, &mut client_w).await;
    });

    let _ = tokio::join!(client_to_upstream, upstream_to_client);
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigent_config::EgressMode;

    #[tokio::test]
    async fn start_binds_ephemeral_port_and_reports_url() {
        let proxy = EgressProxy::new(DomainMatcher::new(EgressMode::DevOpen, &[]));
        let running = proxy.start().await.unwrap();
        assert!(running.url.starts_with("http://127.0.0.1:"));
        running.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let proxy = EgressProxy::new(DomainMatcher::new(EgressMode::DevOpen, &[]));
        let running = proxy.start().await.unwrap();
        let tx = running.shutdown_tx.clone();
        running.stop().await;
        // A second "stop" signal on the same channel should be harmless —
        // the receiver side already observed `true` and the task exited.
        let _ = tx.send(true);
    }

    #[tokio::test]
    async fn connect_to_blocked_host_is_rejected() {
        let matcher = DomainMatcher::new(EgressMode::Allowlist, &["allowed.com".to_string()]);
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        let proxy = EgressProxy::new(matcher)
            .with_on_attempt(Arc::new(move |host, allowed| *seen2.lock().unwrap() = Some((host.to_string(), allowed))));
        let running = proxy.start().await.unwrap();

        let addr = running.url.trim_start_matches("http://");
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"CONNECT blocked.com:443 HTTP/1.1\r\nHost: blocked.com:443\r\n\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]);
        assert!(response.starts_with("HTTP/1.1 403"));
        assert_eq!(*seen.lock().unwrap(), Some(("blocked.com".to_string(), false)));

        running.stop().await;
    }
}
