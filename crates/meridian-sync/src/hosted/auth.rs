//! Room credentials for the hosted service.
//!
//! A public API key is passed through as is. With an access code instead, the
//! auth endpoint is asked for a token for the hashed room:
//!
//! ```text
//! POST <endpoint>            x-access-code: <code>
//! { "room": "<hashed room>" }  ->  { "token": "..." }
//! ```

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::client::RoomCredentials;
use crate::backend::HostedParams;
use crate::error::{Result, SyncError};

pub const ACCESS_CODE_HEADER: &str = "x-access-code";

#[derive(Serialize)]
struct TokenRequest<'a> {
    room: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

pub async fn request_room_token(
    client: &reqwest::Client,
    endpoint: &str,
    access_code: &str,
    room_id: &str,
) -> Result<String> {
    let response = client
        .post(endpoint)
        .header(ACCESS_CODE_HEADER, access_code)
        .json(&TokenRequest { room: room_id })
        .send()
        .await
        .map_err(|e| SyncError::Auth(format!("auth endpoint unreachable: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        warn!(status = %status, "Auth endpoint refused room token");
        return Err(SyncError::Auth(format!("auth endpoint returned {status}")));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| SyncError::Auth(format!("malformed auth response: {e}")))?;
    debug!("Obtained hosted room token");
    Ok(body.token)
}

/// Access code plus endpoint wins over a public key.
pub async fn resolve_credentials(
    client: &reqwest::Client,
    params: &HostedParams,
    room_id: &str,
) -> Result<RoomCredentials> {
    if let (Some(code), Some(endpoint)) = (&params.access_code_for_auth_endpoint, &params.auth_endpoint) {
        let token = request_room_token(client, endpoint, code, room_id).await?;
        return Ok(RoomCredentials::Token(token));
    }
    if let Some(key) = &params.public_api_key {
        return Ok(RoomCredentials::PublicKey(key.clone()));
    }
    Err(SyncError::Auth(
        "neither a public API key nor an access code with auth endpoint was given".into(),
    ))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn params(endpoint: Option<String>) -> HostedParams {
        HostedParams {
            room_name: "team".into(),
            password: None,
            public_api_key: Some("pk_live".into()),
            access_code_for_auth_endpoint: endpoint.as_ref().map(|_| "letmein".to_string()),
            auth_endpoint: endpoint,
        }
    }

    #[tokio::test]
    async fn access_code_is_traded_for_a_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth"))
            .and(header(ACCESS_CODE_HEADER, "letmein"))
            .and(body_json(json!({ "room": "abc" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "tok-1" })))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let creds = resolve_credentials(&client, &params(Some(format!("{}/auth", server.uri()))), "abc")
            .await
            .unwrap();
        assert_eq!(creds, RoomCredentials::Token("tok-1".into()));
    }

    #[tokio::test]
    async fn rejected_access_code_is_an_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = resolve_credentials(&client, &params(Some(server.uri())), "abc").await;
        assert!(matches!(result, Err(SyncError::Auth(_))));
    }

    #[tokio::test]
    async fn public_key_is_used_without_endpoint() {
        let client = reqwest::Client::new();
        let creds = resolve_credentials(&client, &params(None), "abc").await.unwrap();
        assert_eq!(creds, RoomCredentials::PublicKey("pk_live".into()));

        let mut bare = params(None);
        bare.public_api_key = None;
        assert!(resolve_credentials(&client, &bare, "abc").await.is_err());
    }
}
