//! Local WebSocket server for connection manager tests.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message};

#[derive(Debug, Clone, Default)]
pub struct MockOptions {
    /// Connections with an index below this are closed right after the
    /// first frame from the client.
    pub drop_first: u32,
    /// Send `{"type":"ping"}` as soon as the handshake completes.
    pub ping_on_connect: bool,
    /// Answer each subscribe with a data frame on the same channel.
    pub echo_data: bool,
}

#[derive(Default)]
struct Recorded {
    connections: u32,
    auth_headers: Vec<Option<String>>,
    messages: Vec<(u32, String)>,
}

pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    recorded: Arc<Mutex<Recorded>>,
}

impl MockWsServer {
    pub async fn start(options: MockOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let shared = recorded.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(stream, shared.clone(), options.clone()));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            recorded,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub async fn connection_count(&self) -> u32 {
        self.recorded.lock().await.connections
    }

    pub async fn auth_headers(&self) -> Vec<Option<String>> {
        self.recorded.lock().await.auth_headers.clone()
    }

    /// Text frames received on connection `index`.
    pub async fn messages_on(&self, index: u32) -> Vec<String> {
        self.recorded
            .lock()
            .await
            .messages
            .iter()
            .filter(|(i, _)| *i == index)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub async fn all_messages(&self) -> Vec<String> {
        self.recorded
            .lock()
            .await
            .messages
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

async fn handle_connection(stream: TcpStream, recorded: Arc<Mutex<Recorded>>, options: MockOptions) {
    let (header_tx, header_rx) = std::sync::mpsc::channel();
    let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let auth = req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let _ = header_tx.send(auth);
        Ok(resp)
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {e}");
            return;
        }
    };

    let index = {
        let mut rec = recorded.lock().await;
        let index = rec.connections;
        rec.connections += 1;
        rec.auth_headers.push(header_rx.try_recv().ok().flatten());
        index
    };

    let (mut write, mut read) = ws_stream.split();
    if options.ping_on_connect {
        let _ = write.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await;
    }

    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                recorded.lock().await.messages.push((index, text.clone()));

                if index < options.drop_first {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }

                if options.echo_data {
                    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&text) {
                        if parsed["method"] == "subscribe" {
                            let channel = parsed["channel"].as_str().unwrap_or_default();
                            let frame = serde_json::json!({
                                "channel": format!("{channel}:{}", parsed["market_id"]),
                                "data": {"connection": index}
                            });
                            let _ = write.send(Message::Text(frame.to_string())).await;
                        }
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }
}
