use futures_util::StreamExt;
use log::{debug, info, warn};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as Frame;
use url::Url;

use crate::error::ApiError;
use crate::session::SessionHandle;

/// Adds the auth token to the socket url when one is known.
pub fn socket_url(base: &Url, token: Option<&str>) -> Url {
    let mut url = base.clone();
    if let Some(t) = token {
        url.query_pairs_mut().append_pair("token", t);
    }
    url
}

/// Reads one connection until it closes. Returns false when the session is gone.
async fn pump(url: &Url, session: &SessionHandle) -> Result<bool, ApiError> {
    let (mut ws_stream, _) = connect_async(url.as_str()).await?;
    info!("WebSocket connected to {}", url.host_str().unwrap_or("server"));
    while let Some(frame) = ws_stream.next().await {
        match frame? {
            Frame::Text(text) => {
                if !session.push_frame(text) {
                    return Ok(false);
                }
            }
            Frame::Close(reason) => {
                info!("WebSocket closed by server: {:?}", reason);
                break;
            }
            other => debug!("ignoring {} byte non-text frame", other.len()),
        }
    }
    Ok(true)
}

/// Keeps the single session socket open, reconnecting after `retry_delay`.
/// Every text frame goes to the session queue untouched; the engine decodes it.
pub async fn run_socket(url: Url, session: SessionHandle, retry_delay: Duration) {
    loop {
        match pump(&url, &session).await {
            Ok(false) => {
                debug!("session closed, stopping socket reader");
                return;
            }
            Ok(true) => {}
            Err(e) => warn!("WebSocket error: {}", e),
        }
        if session.is_closed() {
            return;
        }
        tokio::time::sleep(retry_delay).await;
        info!("reconnecting WebSocket");
    }
}
