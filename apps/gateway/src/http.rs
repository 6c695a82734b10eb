//! HTTP surface: integration routes, OAuth callback, and the WhatsApp
//! webhook. Handlers stay thin; everything stateful goes through the
//! orchestrator.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tower_http::cors::CorsLayer;

use intake_core::{IntegrationError, Service};
use intake_store::StoredMessage;

use crate::auth::{AuthUser, BearerVerifier};
use crate::orchestrator::{ConnectOutcome, Orchestrator};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub auth: BearerVerifier,
    pub frontend_url: String,
    pub whatsapp_verify_token: Option<String>,
    pub whatsapp_app_secret: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/integrations/", get(list_integrations))
        .route(
            "/integrations/whatsapp/webhook",
            get(whatsapp_verify).post(whatsapp_ingest),
        )
        .route("/integrations/{service}/connect", post(connect))
        .route("/integrations/{service}/callback", get(oauth_callback))
        .route("/integrations/{service}/disconnect", delete(disconnect))
        .route("/integrations/{service}/status", get(connection_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Taxonomy error rendered as `{error, message}` with a kind-derived
/// status.
pub struct ApiError(IntegrationError);

impl From<IntegrationError> for ApiError {
    fn from(err: IntegrationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            IntegrationError::InvalidCredentials(_)
            | IntegrationError::StateMismatch(_)
            | IntegrationError::Unsupported { .. } => StatusCode::BAD_REQUEST,
            IntegrationError::NotConnected(_) | IntegrationError::UnknownService(_) => {
                StatusCode::NOT_FOUND
            }
            IntegrationError::ProviderTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
            IntegrationError::ExchangeFailed(_) => StatusCode::BAD_GATEWAY,
            IntegrationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(json!({ "error": self.0.code(), "message": self.0.to_string() })),
        )
            .into_response()
    }
}

fn parse_service(raw: &str) -> Result<Service, ApiError> {
    raw.parse::<Service>().map_err(ApiError::from)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

async fn connect(
    State(app): State<AppState>,
    AuthUser(user): AuthUser,
    Path(service): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let service = parse_service(&service)?;
    let body = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice::<Value>(&body).map_err(|err| {
            IntegrationError::InvalidCredentials(format!("request body is not valid JSON: {err}"))
        })?)
    };

    match app.orchestrator.initiate_connect(&user, service, body).await? {
        ConnectOutcome::Redirect { authorization_url } => {
            Ok(Json(json!({ "authorization_url": authorization_url })))
        }
        ConnectOutcome::Connected { service, metadata } => Ok(Json(json!({
            "success": true,
            "service": service,
            "metadata": metadata,
        }))),
    }
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Browser redirect target. Whatever happens, the user lands back on
/// the frontend; failures are reported only as an `error=` indicator.
async fn oauth_callback(
    State(app): State<AppState>,
    Path(service): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> Redirect {
    match redeem_callback(&app, &service, query).await {
        Ok(service) => Redirect::to(&format!("{}?success={}", app.frontend_url, service)),
        Err(code) => Redirect::to(&format!("{}?error={}", app.frontend_url, code)),
    }
}

async fn redeem_callback(
    app: &AppState,
    raw_service: &str,
    query: CallbackQuery,
) -> Result<Service, &'static str> {
    let service = raw_service
        .parse::<Service>()
        .map_err(|err| err.code())?;
    if let Some(denial) = query.error {
        tracing::warn!(service = %service, denial = %denial, "provider denied authorization");
        return Err("exchange_failed");
    }
    let (Some(code), Some(state)) = (query.code, query.state) else {
        return Err("state_mismatch");
    };
    app.orchestrator
        .complete_oauth_callback(service, &code, &state)
        .await
        .map(|(_, service)| service)
        .map_err(|err| err.code())
}

async fn disconnect(
    State(app): State<AppState>,
    AuthUser(user): AuthUser,
    Path(service): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let service = parse_service(&service)?;
    app.orchestrator.disconnect(&user, service).await?;
    Ok(Json(json!({ "success": true, "service": service })))
}

async fn list_integrations(
    State(app): State<AppState>,
    AuthUser(user): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let summaries = app.orchestrator.list_connections(&user).await?;
    let mut integrations = serde_json::Map::new();
    for summary in summaries {
        let value = serde_json::to_value(&summary)
            .map_err(|err| IntegrationError::Internal(err.into()))?;
        integrations.insert(
            summary.service.as_str().to_string(),
            json!({
                "connected_at": value["connected_at"],
                "metadata": value["metadata"],
            }),
        );
    }
    Ok(Json(json!({ "integrations": integrations })))
}

async fn connection_status(
    State(app): State<AppState>,
    AuthUser(user): AuthUser,
    Path(service): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let service = parse_service(&service)?;
    match app.orchestrator.connection_status(&user, service).await? {
        Some(metadata) => Ok(Json(json!({
            "connected": true,
            "service": service,
            "metadata": metadata,
        }))),
        None => Ok(Json(json!({ "connected": false, "service": service }))),
    }
}

/// Meta's subscription handshake: echo the challenge when the verify
/// token matches.
async fn whatsapp_verify(
    State(app): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token");
    let challenge = params.get("hub.challenge");
    match (&app.whatsapp_verify_token, mode, token, challenge) {
        (Some(expected), Some("subscribe"), Some(token), Some(challenge))
            if token == expected =>
        {
            (StatusCode::OK, challenge.clone()).into_response()
        }
        _ => {
            tracing::warn!("rejected whatsapp webhook verification attempt");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

/// Inbound message delivery. The signature is checked over the raw
/// body before any parsing; unparseable or unroutable payloads are
/// acknowledged with 200 so Meta does not retry them forever.
async fn whatsapp_ingest(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = &app.whatsapp_app_secret {
        let header = headers
            .get("x-hub-signature-256")
            .and_then(|value| value.to_str().ok());
        if !signature_matches(secret, &body, header) {
            tracing::warn!("rejected whatsapp webhook with bad signature");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::warn!(error = %err, "unparseable whatsapp webhook payload");
            return (StatusCode::OK, Json(json!({ "success": true }))).into_response();
        }
    };

    for entry in payload["entry"].as_array().into_iter().flatten() {
        for change in entry["changes"].as_array().into_iter().flatten() {
            let value = &change["value"];
            let Some(phone_number_id) = value["metadata"]["phone_number_id"].as_str() else {
                continue;
            };
            for message in value["messages"].as_array().into_iter().flatten() {
                let Some(stored) = stored_from_webhook(message) else {
                    continue;
                };
                if let Err(err) = app
                    .orchestrator
                    .route_whatsapp_inbound(phone_number_id, stored)
                    .await
                {
                    tracing::error!(error = %err, "failed to store inbound whatsapp message");
                }
            }
        }
    }

    (StatusCode::OK, Json(json!({ "success": true }))).into_response()
}

const MEDIA_KINDS: [&str; 5] = ["image", "document", "audio", "video", "sticker"];

fn stored_from_webhook(message: &Value) -> Option<StoredMessage> {
    let kind = message["type"].as_str().unwrap_or("unknown").to_string();
    let media = MEDIA_KINDS
        .iter()
        .find(|k| **k == kind)
        .map(|k| message[*k].clone())
        .filter(|m| !m.is_null());
    Some(StoredMessage {
        message_id: message["id"].as_str()?.to_string(),
        from: message["from"].as_str().unwrap_or_default().to_string(),
        timestamp: message["timestamp"].as_str().unwrap_or_default().to_string(),
        received_at: time::OffsetDateTime::now_utc(),
        kind,
        text: message["text"]["body"].as_str().map(str::to_string),
        media,
        raw: message.clone(),
    })
}

fn signature_matches(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(signature) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use intake_core::{CredentialMap, UserId};
    use intake_providers::{
        MessageContent, MessagePage, ProviderAdapter, ProviderRegistry, TokenGrant,
    };
    use intake_security::{shared_memory_pending_store, StateSigner};
    use intake_store::{shared_memory_credential_store, shared_memory_message_store};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};
    use tower::ServiceExt;

    use crate::orchestrator::OrchestratorConfig;

    const AUTH_SECRET: &str = "auth-secret";
    const APP_SECRET: &str = "meta-app-secret";

    struct MockOAuth;

    #[async_trait]
    impl ProviderAdapter for MockOAuth {
        fn service(&self) -> Service {
            Service::Gmail
        }

        fn build_authorization_url(&self, state: &str) -> Result<String, IntegrationError> {
            Ok(format!("https://auth.example/authorize?state={state}"))
        }

        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, IntegrationError> {
            if code != "good-code" {
                return Err(IntegrationError::ExchangeFailed("bad code".into()));
            }
            let credentials: CredentialMap =
                [("access_token", "issued")].into_iter().collect();
            Ok(TokenGrant {
                credentials,
                metadata: json!({ "email": "user@example.com" }),
            })
        }

        async fn list_messages(
            &self,
            _credentials: &CredentialMap,
            _cursor: Option<&str>,
        ) -> Result<MessagePage, IntegrationError> {
            Ok(MessagePage::default())
        }

        async fn get_message_content(
            &self,
            _credentials: &CredentialMap,
            message_id: &str,
        ) -> Result<MessageContent, IntegrationError> {
            Ok(MessageContent {
                id: message_id.to_string(),
                text: None,
                attachments: Vec::new(),
            })
        }
    }

    struct MockDirect {
        service: Service,
    }

    #[async_trait]
    impl ProviderAdapter for MockDirect {
        fn service(&self) -> Service {
            self.service
        }

        async fn validate(&self, credentials: &CredentialMap) -> Result<Value, IntegrationError> {
            if credentials.get_str("access_token") == Some("valid")
                || credentials.get_str("bot_token") == Some("valid")
            {
                Ok(json!({ "account": "acme" }))
            } else {
                Err(IntegrationError::InvalidCredentials("rejected".into()))
            }
        }

        async fn list_messages(
            &self,
            _credentials: &CredentialMap,
            _cursor: Option<&str>,
        ) -> Result<MessagePage, IntegrationError> {
            Err(IntegrationError::unsupported(self.service, "list_messages"))
        }

        async fn get_message_content(
            &self,
            _credentials: &CredentialMap,
            message_id: &str,
        ) -> Result<MessageContent, IntegrationError> {
            Ok(MessageContent {
                id: message_id.to_string(),
                text: None,
                attachments: Vec::new(),
            })
        }
    }

    fn app_state() -> AppState {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockOAuth));
        registry.register(Arc::new(MockDirect {
            service: Service::Telegram,
        }));
        registry.register(Arc::new(MockDirect {
            service: Service::WhatsApp,
        }));
        let orchestrator = Orchestrator::new(
            registry,
            shared_memory_credential_store(),
            shared_memory_message_store(),
            shared_memory_pending_store(),
            StateSigner::new("state-secret"),
            OrchestratorConfig::default(),
        );
        AppState {
            orchestrator: Arc::new(orchestrator),
            auth: BearerVerifier::new(AUTH_SECRET),
            frontend_url: "http://frontend.example".into(),
            whatsapp_verify_token: Some("verify-me".into()),
            whatsapp_app_secret: Some(APP_SECRET.into()),
        }
    }

    fn bearer(sub: &str) -> String {
        let claims = crate::auth::BearerClaims {
            sub: sub.to_string(),
            exp: (OffsetDateTime::now_utc() + Duration::minutes(5)).unix_timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(AUTH_SECRET.as_bytes()),
        )
        .unwrap();
        format!("Bearer {token}")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn request(method: &str, uri: &str, auth: bool, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if auth {
            builder = builder.header(header::AUTHORIZATION, bearer("user-1"));
        }
        let body = match body {
            Some(value) => Body::from(serde_json::to_vec(&value).unwrap()),
            None => Body::empty(),
        };
        builder.body(body).unwrap()
    }

    #[tokio::test]
    async fn health_is_open() {
        let app = build_router(app_state());
        let response = app
            .oneshot(request("GET", "/health", false, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ok"], true);
    }

    #[tokio::test]
    async fn integration_routes_require_bearer() {
        let app = build_router(app_state());
        let response = app
            .oneshot(request("GET", "/integrations/", false, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_service_is_404_with_code() {
        let app = build_router(app_state());
        let response = app
            .oneshot(request(
                "POST",
                "/integrations/slack/connect",
                true,
                Some(json!({})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "unknown_service");
    }

    #[tokio::test]
    async fn direct_connect_then_status_and_disconnect() {
        let state = app_state();
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(request(
                "POST",
                "/integrations/telegram/connect",
                true,
                Some(json!({ "bot_token": "valid" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["metadata"]["account"], "acme");

        let response = app
            .clone()
            .oneshot(request("GET", "/integrations/telegram/status", true, None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["connected"], true);

        let response = app
            .clone()
            .oneshot(request("GET", "/integrations/", true, None))
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["integrations"]["telegram"]["metadata"].is_object());
        assert!(!body.to_string().contains("bot_token"));

        let response = app
            .clone()
            .oneshot(request(
                "DELETE",
                "/integrations/telegram/disconnect",
                true,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(request("GET", "/integrations/telegram/status", true, None))
            .await
            .unwrap();
        assert_eq!(body_json(response).await["connected"], false);
    }

    #[tokio::test]
    async fn direct_connect_rejection_is_400() {
        let app = build_router(app_state());
        let response = app
            .oneshot(request(
                "POST",
                "/integrations/telegram/connect",
                true,
                Some(json!({ "bot_token": "wrong" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn oauth_connect_and_callback_redirect() {
        let app = build_router(app_state());

        let response = app
            .clone()
            .oneshot(request("POST", "/integrations/gmail/connect", true, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let url = body["authorization_url"].as_str().unwrap().to_string();
        let state = url.split("state=").nth(1).unwrap();

        let response = app
            .clone()
            .oneshot(request(
                "GET",
                &format!("/integrations/gmail/callback?code=good-code&state={state}"),
                false,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert_eq!(location, "http://frontend.example?success=gmail");
    }

    #[tokio::test]
    async fn failed_callback_redirects_with_error_code() {
        let app = build_router(app_state());
        let response = app
            .oneshot(request(
                "GET",
                "/integrations/gmail/callback?code=x&state=garbage",
                false,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert_eq!(location, "http://frontend.example?error=state_mismatch");
    }

    #[tokio::test]
    async fn denied_consent_redirects_with_error() {
        let app = build_router(app_state());
        let response = app
            .oneshot(request(
                "GET",
                "/integrations/gmail/callback?error=access_denied",
                false,
                None,
            ))
            .await
            .unwrap();
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert_eq!(location, "http://frontend.example?error=exchange_failed");
    }

    #[tokio::test]
    async fn webhook_verification_echoes_challenge() {
        let app = build_router(app_state());
        let response = app
            .clone()
            .oneshot(request(
                "GET",
                "/integrations/whatsapp/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1234",
                false,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"1234");

        let response = app
            .oneshot(request(
                "GET",
                "/integrations/whatsapp/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1234",
                false,
                None,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    fn webhook_payload() -> Value {
        json!({
            "entry": [{
                "changes": [{
                    "value": {
                        "metadata": { "phone_number_id": "pn-1" },
                        "messages": [{
                            "id": "wamid.1",
                            "from": "15550002222",
                            "timestamp": "1767600000",
                            "type": "text",
                            "text": { "body": "invoice attached" }
                        }]
                    }
                }]
            }]
        })
    }

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(APP_SECRET.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[tokio::test]
    async fn webhook_rejects_bad_signature() {
        let app = build_router(app_state());
        let body = serde_json::to_vec(&webhook_payload()).unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/integrations/whatsapp/webhook")
            .header("x-hub-signature-256", "sha256=deadbeef")
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn webhook_routes_signed_message_to_owner() {
        let state = app_state();
        let app = build_router(state.clone());

        // Connect the owning tenant first.
        app.clone()
            .oneshot(request(
                "POST",
                "/integrations/whatsapp/connect",
                true,
                Some(json!({ "access_token": "valid", "phone_number_id": "pn-1" })),
            ))
            .await
            .unwrap();

        let body = serde_json::to_vec(&webhook_payload()).unwrap();
        let signature = sign(&body);
        let req = Request::builder()
            .method("POST")
            .uri("/integrations/whatsapp/webhook")
            .header("x-hub-signature-256", signature)
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let user = UserId::new("user-1").unwrap();
        let page = state
            .orchestrator
            .fetch_messages(&user, Service::WhatsApp, None)
            .await
            .unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, "wamid.1");
    }
}
