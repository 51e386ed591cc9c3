// src/http.rs
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE};
use hyper::http::HeaderValue;
use hyper::{Body, Method, Request, Response, StatusCode, Uri};
use jsonrpsee::types::error::{ErrorObjectOwned, INVALID_PARAMS_CODE};
use serde::Deserialize;
use serde_json::{json, Value};
use tower::{Layer, Service};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};

use crate::error::BoxError;

/// Plain JSON routes and the `bundler` methods they are served by.
pub const REST_ROUTES: &[(&str, &str)] = &[
    ("/estimate-gas", "bundler_estimateGas"),
    ("/send-transaction", "bundler_sendTransaction"),
];

/// CORS for browser clients. `*` allows any origin.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::from(Any)
    } else {
        let mut origins: Vec<HeaderValue> = vec![];
        for origin in allowed_origins {
            match origin.parse::<HeaderValue>() {
                Ok(origin) => origins.push(origin),
                Err(_) => warn!("Ignoring invalid CORS origin {:?}", origin),
            }
        }
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_headers(Any)
        .allow_methods([Method::POST])
        .allow_origin(allow_origin)
}

/// Serves `POST <path>` with a plain JSON body by calling the mapped JSON-RPC method.
#[derive(Clone, Debug)]
pub struct RestRouteLayer {
    routes: &'static [(&'static str, &'static str)],
}

impl RestRouteLayer {
    pub fn new(routes: &'static [(&'static str, &'static str)]) -> Self {
        Self { routes }
    }
}

impl<S> Layer<S> for RestRouteLayer {
    type Service = RestRoute<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RestRoute {
            inner,
            routes: self.routes,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RestRoute<S> {
    inner: S,
    routes: &'static [(&'static str, &'static str)],
}

impl<S> RestRoute<S> {
    fn method_for(&self, req: &Request<Body>) -> Option<&'static str> {
        if req.method() != Method::POST {
            return None;
        }
        self.routes
            .iter()
            .find(|(path, _)| *path == req.uri().path())
            .map(|(_, method)| *method)
    }
}

impl<S> Service<Request<Body>> for RestRoute<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Error: Into<BoxError> + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let Some(method) = self.method_for(&req) else {
            let fut = self.inner.call(req);
            return Box::pin(async move { fut.await.map_err(Into::into) });
        };
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            let body = hyper::body::to_bytes(body).await?;
            let params: Value = match serde_json::from_slice(&body) {
                Ok(params) => params,
                Err(err) => return reply(StatusCode::BAD_REQUEST, json!({ "error": err.to_string() })),
            };
            debug!("Serving {} as {}", parts.uri.path(), method);

            let call = serde_json::to_vec(&json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": method,
                "params": [params],
            }))?;
            parts.uri = Uri::from_static("/");
            parts
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(call.len()));

            let response = inner
                .call(Request::from_parts(parts, Body::from(call)))
                .await
                .map_err(Into::into)?;
            let body = hyper::body::to_bytes(response.into_body()).await?;
            unwrap_rpc_response(&body)
        })
    }
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObjectOwned>,
}

/// `200` with the result, `400` for invalid params, `500` for anything else.
fn unwrap_rpc_response(body: &[u8]) -> Result<Response<Body>, BoxError> {
    let response = match serde_json::from_slice::<RpcResponse>(body) {
        Ok(response) => response,
        Err(_) => {
            let message = String::from_utf8_lossy(body).into_owned();
            return reply(StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": message }));
        }
    };

    match (response.result, response.error) {
        (_, Some(error)) => {
            let status = if error.code() == INVALID_PARAMS_CODE {
                StatusCode::BAD_REQUEST
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            reply(status, json!({ "error": error.message() }))
        }
        (Some(result), None) => reply(StatusCode::OK, result),
        (None, None) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({ "error": "empty JSON-RPC response" }),
        ),
    }
}

fn reply(status: StatusCode, body: Value) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(&body)?))?)
}
