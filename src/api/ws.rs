use std::collections::BTreeSet;
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::StatusUpdate;
use crate::error::{Error, Result};
use crate::retry::Backoff;

const RECONNECT_BACKOFF: Backoff = Backoff::Exponential {
    initial: Duration::from_secs(1),
    max: Duration::from_secs(30),
};

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    op: &'static str,
    channel: &'static str,
    args: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ServerMessage {
    event: String,
    #[serde(default)]
    args: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct UpdateArg {
    id: String,
    status: String,
}

pub fn subscribe_message<'a>(ids: impl IntoIterator<Item = &'a str>) -> Result<String> {
    Ok(serde_json::to_string(&SubscribeMessage {
        op: "subscribe",
        channel: "swap.update",
        args: ids.into_iter().collect(),
    })?)
}

/// Extracts status updates from one server frame. Frames other than
/// `update` (subscription acks, pongs) yield nothing, and entries with
/// statuses this client does not know are dropped.
pub fn parse_updates(text: &str) -> Result<Vec<StatusUpdate>> {
    let msg: ServerMessage = serde_json::from_str(text)?;
    match msg.event.as_str() {
        "update" => {}
        "error" => {
            return Err(Error::Remote {
                endpoint: "ws".into(),
                message: text.to_string(),
            });
        }
        _ => return Ok(Vec::new()),
    }

    let mut out = Vec::with_capacity(msg.args.len());
    for arg in msg.args {
        let arg: UpdateArg = match serde_json::from_value(arg) {
            Ok(arg) => arg,
            Err(err) => {
                tracing::debug!(error = %err, "skipping malformed swap update");
                continue;
            }
        };
        match arg.status.parse() {
            Ok(status) => out.push(StatusUpdate { id: arg.id, status }),
            Err(err) => tracing::warn!(swap_id = %arg.id, error = %err, "ignoring swap update"),
        }
    }
    Ok(out)
}

/// Handle to a background task holding the coordinator's websocket open.
/// The task reconnects with backoff, resubscribes every known id after a
/// reconnect and exits once all handles are dropped.
#[derive(Debug, Clone)]
pub struct SwapUpdateSocket {
    commands: mpsc::UnboundedSender<Vec<String>>,
}

impl SwapUpdateSocket {
    pub fn spawn(url: Url, updates: mpsc::UnboundedSender<Vec<StatusUpdate>>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(url, rx, updates));
        Self { commands }
    }

    /// Returns false when the socket task has already stopped.
    pub fn subscribe(&self, ids: Vec<String>) -> bool {
        self.commands.send(ids).is_ok()
    }
}

async fn run(
    url: Url,
    mut commands: mpsc::UnboundedReceiver<Vec<String>>,
    updates: mpsc::UnboundedSender<Vec<StatusUpdate>>,
) {
    let mut subscribed: BTreeSet<String> = BTreeSet::new();
    let mut attempt = 0usize;

    loop {
        match connect_async(url.as_str()).await {
            Ok((mut stream, _)) => {
                tracing::info!(%url, "swap update socket connected");
                attempt = 0;

                if !subscribed.is_empty() {
                    match subscribe_message(subscribed.iter().map(String::as_str)) {
                        Ok(text) => {
                            if let Err(err) = stream.send(Message::text(text)).await {
                                tracing::warn!(error = %err, "resubscribe failed");
                            }
                        }
                        Err(err) => tracing::warn!(error = %err, "encode resubscribe"),
                    }
                }

                loop {
                    tokio::select! {
                        cmd = commands.recv() => {
                            let Some(ids) = cmd else {
                                let _ = stream.close(None).await;
                                return;
                            };
                            let fresh: Vec<String> = ids
                                .into_iter()
                                .filter(|id| subscribed.insert(id.clone()))
                                .collect();
                            if fresh.is_empty() {
                                continue;
                            }
                            let sent = match subscribe_message(fresh.iter().map(String::as_str)) {
                                Ok(text) => stream.send(Message::text(text)).await.map_err(Error::from),
                                Err(err) => Err(err),
                            };
                            if let Err(err) = sent {
                                tracing::warn!(error = %err, "subscribe failed; reconnecting");
                                break;
                            }
                        }
                        msg = stream.next() => match msg {
                            Some(Ok(Message::Text(text))) => match parse_updates(text.as_str()) {
                                Ok(batch) if batch.is_empty() => {}
                                Ok(batch) => {
                                    if updates.send(batch).is_err() {
                                        return;
                                    }
                                }
                                Err(err) => tracing::warn!(error = %err, "swap update socket message"),
                            },
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("swap update socket closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                tracing::warn!(error = %err, "swap update socket error");
                                break;
                            }
                        },
                    }
                }
            }
            Err(err) => tracing::warn!(%url, error = %err, "swap update socket connect failed"),
        }

        let sleep = tokio::time::sleep(RECONNECT_BACKOFF.delay(attempt));
        tokio::pin!(sleep);
        attempt = attempt.saturating_add(1);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(ids) => subscribed.extend(ids),
                    None => return,
                },
            }
        }
    }
}
