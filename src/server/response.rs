//! Response helpers shared by the front door, the proxy and the forwarder

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// JSON error body `{"error": <reason>, "message": <message>}`
pub fn error_response(status: StatusCode, message: &str) -> Response<BoxBody> {
    let body = serde_json::json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message
    });

    to_boxed(
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap(),
    )
}

pub fn not_found_response(message: &str) -> Response<BoxBody> {
    error_response(StatusCode::NOT_FOUND, message)
}

pub fn bad_request_response(message: &str) -> Response<BoxBody> {
    error_response(StatusCode::BAD_REQUEST, message)
}

pub fn redirect_response(status: StatusCode, location: &str) -> Response<BoxBody> {
    let Ok(location) = HeaderValue::from_str(location) else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid redirect location");
    };
    to_boxed(
        Response::builder()
            .status(status)
            .header(LOCATION, location)
            .body(Full::new(Bytes::new()))
            .unwrap(),
    )
}

pub fn text_response(status: StatusCode, text: impl Into<Bytes>) -> Response<BoxBody> {
    to_boxed(
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(text.into()))
            .unwrap(),
    )
}
