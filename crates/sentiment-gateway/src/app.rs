use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderValue, Response, StatusCode};
use pingora::apps::http_app::ServeHttp;
use pingora::protocols::http::ServerSession;
use serde_json::{Value, json};

use crate::handler::Gateway;

/// Largest request body accepted. API bodies are small JSON documents.
pub const MAX_BODY_BYTES: usize = 64 * 1024;

/// Pingora application serving the gateway API.
pub struct GatewayApp {
    gateway: Arc<Gateway>,
}

impl GatewayApp {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }
}

enum BodyError {
    TooLarge,
    Read(String),
}

async fn read_body(session: &mut ServerSession) -> Result<BytesMut, BodyError> {
    let mut body = BytesMut::new();
    loop {
        match session.read_request_body().await {
            Ok(Some(chunk)) => {
                if body.len() + chunk.len() > MAX_BODY_BYTES {
                    return Err(BodyError::TooLarge);
                }
                body.extend_from_slice(&chunk);
            }
            Ok(None) => return Ok(body),
            Err(e) => return Err(BodyError::Read(e.to_string())),
        }
    }
}

fn json_response(status: StatusCode, body: &Value) -> Response<Vec<u8>> {
    let bytes = body.to_string().into_bytes();
    let mut response = Response::new(Vec::new());
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
    *response.body_mut() = bytes;
    response
}

#[async_trait]
impl ServeHttp for GatewayApp {
    async fn response(&self, session: &mut ServerSession) -> Response<Vec<u8>> {
        let header = session.req_header();
        let method = header.method.clone();
        let path = header.uri.path().to_string();
        let authorization = header
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = match read_body(session).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                log::warn!("{method} {path}: request body over {MAX_BODY_BYTES} bytes");
                return json_response(
                    StatusCode::PAYLOAD_TOO_LARGE,
                    &json!({ "error": "Request body too large" }),
                );
            }
            Err(BodyError::Read(e)) => {
                log::warn!("{method} {path}: failed to read request body: {e}");
                return json_response(
                    StatusCode::BAD_REQUEST,
                    &json!({ "error": "Unreadable request body" }),
                );
            }
        };

        let (status, body) = self
            .gateway
            .handle(&method, &path, authorization.as_deref(), &body)
            .await;
        log::debug!("{method} {path} -> {}", status.as_u16());
        json_response(status, &body)
    }
}
