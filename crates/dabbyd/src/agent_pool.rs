//! Balancer-routed agent pool.
//!
//! Executes a job payload by selecting a backend instance through the load
//! balancer and POSTing the payload to its execute endpoint. The connection
//! guard keeps the instance's load signal accurate for the duration of the
//! call; the dispatcher records the outcome into the registry.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use dabby_balance::Balancer;
use dabby_jobs::{AgentError, AgentFuture, AgentPool, AgentResponse};

/// Work endpoint exposed by every agent instance.
const EXECUTE_PATH: &str = "/execute";

/// Routes payload execution through the load balancer.
pub struct ForwardingAgentPool {
    balancer: Arc<Balancer>,
    request_timeout: Duration,
}

impl ForwardingAgentPool {
    pub fn new(balancer: Arc<Balancer>, request_timeout: Duration) -> Self {
        Self {
            balancer,
            request_timeout,
        }
    }
}

impl AgentPool for ForwardingAgentPool {
    fn execute(&self, payload: serde_json::Value) -> AgentFuture {
        let balancer = Arc::clone(&self.balancer);
        let timeout = self.request_timeout;
        Box::pin(async move {
            // Selection is in-memory only; the network call happens outside
            // the balancer's critical section, under the guard.
            let guard = balancer
                .select()
                .map_err(|e| AgentError::new(e.to_string()))?;
            let instance = guard.instance_id().to_string();
            let address = guard.descriptor().address.clone();

            debug!(instance_id = %instance, %address, "forwarding job payload");
            let result =
                tokio::time::timeout(timeout, post_json(&address, EXECUTE_PATH, &payload)).await;
            drop(guard);

            match result {
                Ok(Ok(body)) => Ok(AgentResponse {
                    instance: Some(instance),
                    body,
                }),
                Ok(Err(message)) => Err(AgentError::new(message).on_instance(instance)),
                Err(_) => Err(AgentError::new("request timed out").on_instance(instance)),
            }
        })
    }
}

/// POST a JSON payload to `http://{address}{path}` and parse the JSON
/// response body.
async fn post_json(
    address: &str,
    path: &str,
    payload: &serde_json::Value,
) -> Result<serde_json::Value, String> {
    let uri = format!("http://{address}{path}");
    let body = serde_json::to_vec(payload).map_err(|e| e.to_string())?;

    let stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect {address}: {e}"))?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| format!("handshake {address}: {e}"))?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::builder()
        .method("POST")
        .uri(&uri)
        .header("host", address)
        .header("content-type", "application/json")
        .header("user-agent", "dabbyd/0.1")
        .body(http_body_util::Full::new(bytes::Bytes::from(body)))
        .map_err(|e| e.to_string())?;

    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| format!("request {uri}: {e}"))?;
    let status = resp.status();

    use http_body_util::BodyExt;
    let collected = resp
        .into_body()
        .collect()
        .await
        .map_err(|e| format!("read body {uri}: {e}"))?;
    let bytes = collected.to_bytes();

    if !status.is_success() {
        return Err(format!("{uri} returned {status}"));
    }
    if bytes.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| format!("decode body {uri}: {e}"))
}
