//! HTTP helpers shared by provider crates.

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::ports::PortError;

/// Send a request and decode its JSON body.
///
/// # Errors
///
/// Returns [`PortError::Unauthorized`] on HTTP 401, [`PortError::Network`] for
/// other failing statuses and transport errors.
pub async fn fetch_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T, PortError> {
    checked(req).await?.json().await.map_err(PortError::from)
}

/// Send a request whose response body is not needed.
///
/// # Errors
///
/// Same as [`fetch_json`].
pub async fn send(req: RequestBuilder) -> Result<(), PortError> {
    checked(req).await.map(|_response| ())
}

async fn checked(req: RequestBuilder) -> Result<Response, PortError> {
    let response = req.send().await?;
    let status = response.status();
    debug!(url = %response.url(), %status, "provider response");
    if status == StatusCode::UNAUTHORIZED {
        return Err(PortError::Unauthorized(format!(
            "HTTP 401 from {}",
            response.url().path()
        )));
    }
    response.error_for_status().map_err(PortError::from)
}
