//! Application HTTP service.
//!
//! The pingora-facing edge of the dispatch pipeline: each accepted request
//! is materialized into the internal request model (head, body, peer
//! address), handed to the Dispatcher, and the resulting response is
//! written back. Traffic is refused with a 503 until the runtime reports
//! ready.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use http::{header, Response as HttpResponse, StatusCode};
use pingora::{
    apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service,
};

use crate::config::registry::ConfigRegistry;
use crate::core::{Body, Request, XyPrissError, XyResult};
use crate::dispatch::Dispatcher;

pub struct AppHttpService {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ConfigRegistry>,
    keepalive_secs: u64,
}

impl AppHttpService {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<ConfigRegistry>,
        keepalive_secs: u64,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            keepalive_secs,
        }
    }

    /// Wraps the app into a listening service bound to `addr`.
    pub fn listening_service(self, addr: &str) -> Service<Self> {
        let mut service = Service::new("XyPriss HTTP".to_string(), self);
        service.add_tcp(addr);
        service
    }

    async fn build_request(http_session: &mut ServerSession) -> XyResult<Request> {
        let head = http_session.req_header();
        let mut request = Request::new(
            head.method.clone(),
            head.uri.clone(),
            head.headers.clone(),
        );
        request.remote_addr = http_session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .copied();

        let mut body = BytesMut::new();
        while let Some(chunk) = http_session
            .read_request_body()
            .await
            .map_err(|e| XyPrissError::Validation(format!("body read failed: {e}")))?
        {
            body.extend_from_slice(&chunk);
        }
        if !body.is_empty() {
            request.body = Body::Raw(body.freeze());
        }
        Ok(request)
    }

    fn unavailable() -> HttpResponse<Vec<u8>> {
        HttpResponse::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .header(header::CONTENT_TYPE, "application/json")
            .body(br#"{"error":"starting up","code":"not_ready"}"#.to_vec())
            .unwrap_or_else(|_| HttpResponse::new(Vec::new()))
    }
}

#[async_trait]
impl ServeHttp for AppHttpService {
    async fn response(&self, http_session: &mut ServerSession) -> HttpResponse<Vec<u8>> {
        if !self.registry.is_ready() {
            http_session.set_keepalive(None);
            return Self::unavailable();
        }
        http_session.set_keepalive(Some(self.keepalive_secs));

        let request = match Self::build_request(http_session).await {
            Ok(request) => request,
            Err(e) => {
                log::debug!("rejecting unreadable request: {e}");
                return HttpResponse::builder()
                    .status(StatusCode::BAD_REQUEST)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(br#"{"error":"unreadable request","code":"validation_error"}"#.to_vec())
                    .unwrap_or_else(|_| HttpResponse::new(Vec::new()));
            }
        };

        let mut response = self.dispatcher.dispatch(request).await.into_http_response();
        let length = response.body().len().to_string();
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, length.parse().unwrap());
        response
    }
}
