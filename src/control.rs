//! Per-service control surface under the reserved URL prefix
//!
//! Every virtual host exposes `{srv_prefix}docker/*` endpoints for its own
//! service, authenticated with HTTP Basic credentials: the username is the
//! service name, the password the container's reserved token label. The
//! target container defaults to the service's own and can be overridden
//! with an `id` parameter (container id or name), verified against the
//! engine's name-filtered listing.

use crate::discovery::Container;
use crate::engine::EngineCache;
use crate::error::{text_response, GatewayBody, GatewayError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bollard::container::{
    ListContainersOptions, LogOutput, LogsOptions, RestartContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use futures::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{
    AUTHORIZATION, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

/// Stop/restart grace period handed to the engine
const LIFECYCLE_TIMEOUT_SECS: i64 = 10;

pub struct ControlSurface {
    engine: Arc<EngineCache>,
    srv_prefix: String,
}

impl ControlSurface {
    pub fn new(engine: Arc<EngineCache>, srv_prefix: String) -> Self {
        Self { engine, srv_prefix }
    }

    pub async fn handle(
        &self,
        req: Request<Incoming>,
        service: Arc<Container>,
    ) -> Response<GatewayBody> {
        let auth_header = req
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        if let Err(body) = check_credentials(auth_header.as_deref(), &service.name, &service.token)
        {
            return text_response(StatusCode::UNAUTHORIZED, body);
        }

        let params = query_params(req.uri().query());
        let path = req
            .uri()
            .path()
            .strip_prefix(&self.srv_prefix)
            .unwrap_or("")
            .trim_matches('/')
            .to_string();

        match path.as_str() {
            "docker/logs" => {
                let target = target_id(&params, &service);
                self.stream_logs(req, service, target, params).await
            }
            "docker/start" | "docker/stop" | "docker/restart" | "docker/ps" => {
                // The id may also arrive as a POSTed form field; body values
                // win over the query string.
                let mut params = params;
                if is_form_post(&req) {
                    match req.into_body().collect().await {
                        Ok(collected) => {
                            let body = String::from_utf8_lossy(&collected.to_bytes()).into_owned();
                            params.extend(parse_pairs(&body));
                        }
                        Err(e) => {
                            warn!(service = %service.name, error = %e, "Form body read failed");
                        }
                    }
                }
                let target = target_id(&params, &service);
                self.lifecycle(&path, service, target).await
            }
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn lifecycle(
        &self,
        action: &str,
        service: Arc<Container>,
        target: String,
    ) -> Response<GatewayBody> {
        let (docker, _) = match self.engine.get().await {
            Ok(client) => client,
            Err(e) => {
                warn!(service = %service.name, action, error = %e, "Engine client unavailable for control request");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("engine client failed: {}", e),
                );
            }
        };
        let siblings = match list_by_name(&docker, &service.name).await {
            Ok(list) => list,
            Err(e) => {
                warn!(service = %service.name, action, error = %e, "Container listing failed for control request");
                return text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("container listing failed: {}", e),
                );
            }
        };

        if action != "docker/ps" && !siblings.iter().any(|(id, name)| *id == target || *name == target) {
            warn!(service = %service.name, action, target, "Control target outside service scope");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "target not accessible");
        }

        let result = match action {
            "docker/start" => docker
                .start_container(&target, None::<StartContainerOptions<String>>)
                .await
                .map(|_| "ok".to_string()),
            "docker/stop" => docker
                .stop_container(
                    &target,
                    Some(StopContainerOptions {
                        t: LIFECYCLE_TIMEOUT_SECS,
                    }),
                )
                .await
                .map(|_| "ok".to_string()),
            "docker/restart" => docker
                .restart_container(
                    &target,
                    Some(RestartContainerOptions {
                        t: LIFECYCLE_TIMEOUT_SECS as isize,
                    }),
                )
                .await
                .map(|_| "ok".to_string()),
            "docker/ps" => ps_rows(&docker, &siblings).await,
            _ => unreachable!("dispatched actions only"),
        };

        match result {
            Ok(body) => text_response(StatusCode::OK, body),
            Err(e) => {
                let err = GatewayError::ControlEngineError(format!("{}: {}", action, e));
                warn!(service = %service.name, error = %err, "Control action failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        }
    }

    /// Upgrade to a WebSocket and stream the engine's demultiplexed
    /// container logs until either side closes.
    async fn stream_logs(
        &self,
        req: Request<Incoming>,
        service: Arc<Container>,
        target: String,
        params: HashMap<String, String>,
    ) -> Response<GatewayBody> {
        let is_upgrade = req
            .headers()
            .get(UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false);
        let ws_key = req
            .headers()
            .get(SEC_WEBSOCKET_KEY)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let ws_key = match (is_upgrade, ws_key) {
            (true, Some(key)) => key,
            _ => return text_response(StatusCode::BAD_REQUEST, "websocket upgrade required"),
        };

        let options = LogsOptions::<String> {
            follow: flag_on(&params, "follow"),
            stdout: flag_not_off(&params, "stdout"),
            stderr: flag_not_off(&params, "stderr"),
            since: int_param(&params, "since"),
            until: int_param(&params, "until"),
            timestamps: flag_on(&params, "timestamps"),
            tail: params
                .get("tail")
                .filter(|tail| !tail.is_empty())
                .cloned()
                .unwrap_or_else(|| "all".to_string()),
        };

        let engine = Arc::clone(&self.engine);
        let accept = derive_accept_key(ws_key.as_bytes());
        tokio::spawn(async move {
            let upgraded = match hyper::upgrade::on(req).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Log stream upgrade failed");
                    return;
                }
            };
            let mut ws =
                WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;

            let docker = match engine.get().await {
                Ok((docker, _)) => docker,
                Err(e) => {
                    warn!(service = %service.name, error = %e, "Engine client unavailable for log stream");
                    let _ = ws.send(Message::Text(format!("engine client failed: {}", e))).await;
                    let _ = ws.close(None).await;
                    return;
                }
            };
            let (mut sink, mut incoming) = ws.split();
            let mut logs = docker.logs(&target, Some(options));
            loop {
                tokio::select! {
                    received = incoming.next() => match received {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        _ => {}
                    },
                    entry = logs.next() => match entry {
                        Some(Ok(output)) => {
                            let message = match output {
                                LogOutput::StdOut { message }
                                | LogOutput::StdErr { message }
                                | LogOutput::Console { message } => message,
                                LogOutput::StdIn { .. } => continue,
                            };
                            if sink.send(Message::Binary(message.to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = sink.send(Message::Text(format!("log stream failed: {}", e))).await;
                            break;
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.close().await;
            debug!(service = %service.name, container = %target, "Log stream closed");
        });

        Response::builder()
            .status(StatusCode::SWITCHING_PROTOCOLS)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_ACCEPT, accept)
            .body(crate::error::empty_body())
            .expect("valid upgrade response")
    }
}

/// List containers sharing the service name; returns (id, name) pairs.
async fn list_by_name(
    docker: &Docker,
    name: &str,
) -> Result<Vec<(String, String)>, bollard::errors::Error> {
    let mut filters = HashMap::new();
    filters.insert("name".to_string(), vec![name.to_string()]);
    let listed = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        }))
        .await?;
    Ok(listed
        .into_iter()
        .filter_map(|c| {
            let id = c.id?;
            let name = c
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            Some((id, name))
        })
        .collect())
}

/// Tab-separated `id name image created status` rows, one per sibling.
async fn ps_rows(
    docker: &Docker,
    siblings: &[(String, String)],
) -> Result<String, bollard::errors::Error> {
    let mut rows = String::new();
    for (id, _) in siblings {
        let inspect = docker.inspect_container(id, None).await?;
        rows.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\n",
            id,
            inspect
                .name
                .as_deref()
                .map(|n| n.trim_start_matches('/'))
                .unwrap_or_default(),
            inspect
                .config
                .as_ref()
                .and_then(|c| c.image.as_deref())
                .unwrap_or_default(),
            inspect.created.as_deref().unwrap_or_default(),
            inspect
                .state
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .map(|s| s.to_string())
                .unwrap_or_default(),
        ));
    }
    Ok(rows)
}

/// Validate Basic credentials against the service identity.
fn check_credentials(
    header: Option<&str>,
    name: &str,
    token: &str,
) -> Result<(), &'static str> {
    let encoded = header
        .and_then(|h| h.strip_prefix("Basic "))
        .ok_or("unauthorized")?;
    let decoded = BASE64.decode(encoded.trim()).map_err(|_| "unauthorized")?;
    let decoded = String::from_utf8(decoded).map_err(|_| "unauthorized")?;
    let (user, pass) = decoded.split_once(':').ok_or("unauthorized")?;
    if user != name || pass != token {
        return Err("invalid password");
    }
    Ok(())
}

/// Target container for a control request: the `id` parameter, or the
/// service's own container.
fn target_id(params: &HashMap<String, String>, service: &Container) -> String {
    params
        .get("id")
        .filter(|id| !id.is_empty())
        .cloned()
        .unwrap_or_else(|| service.id.clone())
}

fn is_form_post(req: &Request<Incoming>) -> bool {
    req.method() == Method::POST
        && req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false)
}

fn query_params(query: Option<&str>) -> HashMap<String, String> {
    parse_pairs(query.unwrap_or(""))
}

/// Parse `k=v&k=v` pairs with form-style percent decoding.
fn parse_pairs(input: &str) -> HashMap<String, String> {
    input
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (form_decode(k), form_decode(v)))
        .collect()
}

fn form_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or("");
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    Err(_) => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Boolean flag that is on only when set to `"1"`.
fn flag_on(params: &HashMap<String, String>, key: &str) -> bool {
    params.get(key).map(|v| v == "1").unwrap_or(false)
}

/// Boolean flag that defaults on and turns off only when set to `"0"`.
fn flag_not_off(params: &HashMap<String, String>, key: &str) -> bool {
    params.get(key).map(|v| v != "0").unwrap_or(true)
}

fn int_param(params: &HashMap<String, String>, key: &str) -> i64 {
    params
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}
