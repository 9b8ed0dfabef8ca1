//! Per-bit request dispatch.
//!
//! Every path that is not a host endpoint lands here. The owning bit is the
//! one with the longest matching route; the remainder of the path picks the
//! host-provided sub-endpoint or falls through to [`Bit::handle`].
//!
//! | Remainder | Methods | Served by |
//! |-----------|---------|-----------|
//! | (none), anything else | any | `Bit::handle` |
//! | `/config` | GET, POST | `Configurable::get_config` / `set_config` |
//! | `/config/schema` | GET | `Configurable::schema` |
//! | `/config/value` | GET, POST | `Configurable::get_value` / `set_value` |
//! | `/state` | GET | latest snapshot |
//! | `/state/stream` | GET | snapshots as server-sent events |
//! | `/ui`, `/ui/*` | GET, HEAD | the module's `ui/` directory |

use super::ui;
use crate::container::HostContainer;
use crate::registry::RegisteredBit;
use axum::body::to_bytes;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bit_contracts::{Bit, BitError, BitRequest, Configurable};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, warn};

/// Response header carrying the snapshot version of `R/state`.
pub const STATE_VERSION_HEADER: &str = "x-state-version";

/// Body of `POST R/config/value`.
#[derive(Debug, Deserialize)]
struct ValueUpdate {
    key: String,
    value: Value,
}

enum Target<'a> {
    Handler(&'a str),
    Config,
    ConfigSchema,
    ConfigValue,
    State,
    StateStream,
    Ui(&'a str),
}

fn classify(rest: &str) -> Target<'_> {
    let lower = rest.trim_end_matches('/').to_ascii_lowercase();
    match lower.as_str() {
        "/config" => Target::Config,
        "/config/schema" => Target::ConfigSchema,
        "/config/value" => Target::ConfigValue,
        "/state" => Target::State,
        "/state/stream" => Target::StateStream,
        "/ui" => Target::Ui(""),
        _ if lower.starts_with("/ui/") => Target::Ui(&rest[3..]),
        _ => Target::Handler(rest),
    }
}

/// Fallback handler for every bit route.
pub async fn dispatch(State(host): State<Arc<HostContainer>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let Some((entry, rest)) = host.registry.resolve_path(&path) else {
        return BitError::NotFound(format!("no bit is registered for {path}")).into_response();
    };
    let entry = entry.clone();
    let rest = rest.to_string();

    debug!(route = %entry.route, rest = %rest, method = %request.method(), "Dispatching bit request");

    match classify(&rest) {
        Target::Handler(sub_path) => {
            let sub_path = if sub_path.is_empty() { "/" } else { sub_path }.to_string();
            call_handler(&host, &entry, sub_path, request).await
        }
        Target::Config => {
            let body = match read_body(&host, request, &[Method::GET, Method::POST]).await {
                Ok(body) => body,
                Err(response) => return response,
            };
            with_configuration(entry.bit.as_ref(), |config| match body {
                None => Ok(Json(config.get_config()).into_response()),
                Some(body) => {
                    let value: Value = parse_json(&body)?;
                    config.set_config(value)?;
                    Ok(Json(config.get_config()).into_response())
                }
            })
        }
        Target::ConfigSchema => {
            if let Err(response) = allow(request.method(), &[Method::GET]) {
                return response;
            }
            with_configuration(entry.bit.as_ref(), |config| Ok(Json(config.schema()).into_response()))
        }
        Target::ConfigValue => {
            let uri = request.uri().clone();
            let body = match read_body(&host, request, &[Method::GET, Method::POST]).await {
                Ok(body) => body,
                Err(response) => return response,
            };
            with_configuration(entry.bit.as_ref(), |config| match body {
                None => {
                    let query = parse_query(&uri)?;
                    let key = query
                        .get("key")
                        .ok_or_else(|| BitError::bad_request("missing query parameter 'key'"))?;
                    let value = config
                        .get_value(key)
                        .ok_or_else(|| BitError::NotFound(format!("config key '{key}'")))?;
                    Ok(Json(json!({ "key": key, "value": value })).into_response())
                }
                Some(body) => {
                    let update: ValueUpdate = parse_json(&body)?;
                    config.set_value(&update.key, update.value)?;
                    let value = config.get_value(&update.key).unwrap_or(Value::Null);
                    Ok(Json(json!({ "key": update.key, "value": value })).into_response())
                }
            })
        }
        Target::State => {
            if let Err(response) = allow(request.method(), &[Method::GET]) {
                return response;
            }
            state_snapshot(&entry)
        }
        Target::StateStream => {
            if let Err(response) = allow(request.method(), &[Method::GET]) {
                return response;
            }
            state_stream(&host, &entry)
        }
        Target::Ui(sub_path) => {
            if let Err(response) = allow(request.method(), &[Method::GET, Method::HEAD]) {
                return response;
            }
            let sub_path = sub_path.to_string();
            ui::serve(&entry, &sub_path, request).await
        }
    }
}

async fn call_handler(
    host: &HostContainer,
    entry: &RegisteredBit,
    sub_path: String,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let query = match parse_query(request.uri()) {
        Ok(query) => query,
        Err(e) => return e.into_response(),
    };
    let body = match to_bytes(request.into_body(), host.config.server.max_body_bytes).await {
        Ok(body) => body,
        Err(_) => return payload_too_large(host),
    };

    let bit_request = BitRequest {
        method,
        path: sub_path,
        query,
        body,
    };

    match entry.bit.handle(bit_request).await {
        Ok(response) => response.into_response(),
        Err(e) => {
            if e.status().is_server_error() {
                warn!(route = %entry.route, error = %e, "Bit handler failed");
            }
            e.into_response()
        }
    }
}

/// Check the method and, for writes, read the body. `Ok(None)` is a read.
async fn read_body(
    host: &HostContainer,
    request: Request,
    allowed: &[Method],
) -> Result<Option<Bytes>, Response> {
    allow(request.method(), allowed)?;
    if request.method() == Method::GET {
        return Ok(None);
    }
    let body = to_bytes(request.into_body(), host.config.server.max_body_bytes)
        .await
        .map_err(|_| payload_too_large(host))?;
    Ok(Some(body))
}

fn allow(method: &Method, allowed: &[Method]) -> Result<(), Response> {
    if allowed.contains(method) {
        Ok(())
    } else {
        Err(BitError::Unsupported(format!("method {method} is not allowed here")).into_response())
    }
}

fn with_configuration(
    bit: &dyn Bit,
    f: impl FnOnce(&dyn Configurable) -> Result<Response, BitError>,
) -> Response {
    let result = match bit.configuration() {
        Some(config) => f(config),
        None => Err(BitError::NotFound(format!(
            "bit {} has no configuration",
            bit.name()
        ))),
    };
    result.unwrap_or_else(IntoResponse::into_response)
}

fn state_snapshot(entry: &RegisteredBit) -> Response {
    let Some(source) = entry.bit.state() else {
        return no_state(entry);
    };
    match source.snapshot_json() {
        Ok((version, value)) => {
            let mut response = Json(value).into_response();
            response.headers_mut().insert(
                HeaderName::from_static(STATE_VERSION_HEADER),
                HeaderValue::from(version),
            );
            response
        }
        Err(e) => {
            warn!(route = %entry.route, error = %e, "State snapshot could not be serialized");
            BitError::internal(e).into_response()
        }
    }
}

/// One `data:` event per snapshot the client is able to observe. The stream
/// ends when the client disconnects, the host shuts down or the store closes.
fn state_stream(host: &HostContainer, entry: &RegisteredBit) -> Response {
    let Some(source) = entry.bit.state() else {
        return no_state(entry);
    };

    let cancel = host.shutdown.child_token();
    let events = source.watch_json(cancel).map(|(version, value)| {
        Ok::<Event, Infallible>(Event::default().id(version.to_string()).data(value.to_string()))
    });

    debug!(route = %entry.route, watchers = source.watcher_count(), "State stream opened");
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn no_state(entry: &RegisteredBit) -> Response {
    BitError::NotFound(format!("bit {} has no state", entry.bit.name())).into_response()
}

fn parse_query(uri: &Uri) -> Result<HashMap<String, String>, BitError> {
    Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(query)| query)
        .map_err(BitError::bad_request)
}

fn parse_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, BitError> {
    if body.is_empty() {
        return Err(BitError::bad_request("empty request body"));
    }
    Ok(serde_json::from_slice(body)?)
}

fn payload_too_large(host: &HostContainer) -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(json!({
            "error": format!(
                "request body exceeds {} bytes",
                host.config.server.max_body_bytes
            )
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert!(matches!(classify(""), Target::Handler("")));
        assert!(matches!(classify("/orders/7"), Target::Handler("/orders/7")));
        assert!(matches!(classify("/Config"), Target::Config));
        assert!(matches!(classify("/config/"), Target::Config));
        assert!(matches!(classify("/config/schema"), Target::ConfigSchema));
        assert!(matches!(classify("/config/value"), Target::ConfigValue));
        assert!(matches!(classify("/state"), Target::State));
        assert!(matches!(classify("/STATE/stream"), Target::StateStream));
        assert!(matches!(classify("/ui"), Target::Ui("")));
        assert!(matches!(classify("/ui/app.js"), Target::Ui("/app.js")));
        assert!(matches!(classify("/uix"), Target::Handler("/uix")));
        assert!(matches!(classify("/configs"), Target::Handler("/configs")));
    }
}
