//! Error responses written by the reverse proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};

/// Build the 502 response returned for any upstream failure
///
/// The body is the literal `Bad Gateway`; errors while writing it to the
/// client are swallowed by the connection task.
pub fn bad_gateway() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(
            Full::new(Bytes::from_static(b"Bad Gateway"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with static status and headers")
}
