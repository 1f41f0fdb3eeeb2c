//! HTTP router.
//!
//! Clinic routes are nested under `/api/`; the provider webhook lives at
//! `/webhook`. Every request passes the access log; `POST /webhook` also
//! passes the signature check.

use std::sync::Arc;

use axum::handler::Handler;
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::endpoints::{
    appointments, automation, confirmations, conversations, health, legal, patients, webhook,
};
use crate::api::middleware;
use crate::api::types::ApiContext;
use crate::core_state::CoreState;

/// Build the full application router.
///
/// Middleware reads `Extension<ApiContext>`; handlers use `State<ApiContext>`.
pub fn api_router(core: Arc<CoreState>) -> Router {
    let ctx = ApiContext::new(core);

    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let api = Router::new()
        .route("/health", get(health::check))
        .route("/patients", post(patients::create))
        .route("/appointments", post(appointments::create))
        .route("/appointments/:id", get(appointments::detail))
        .route("/appointments/:id/status", put(appointments::update_status))
        .route(
            "/appointments/:id/confirmation",
            post(appointments::send_confirmation_now),
        )
        .route("/confirmations/run", post(confirmations::run))
        .route("/automation/flows", post(automation::create))
        .route(
            "/automation/flows/:id",
            get(automation::detail).delete(automation::cancel),
        )
        .route(
            "/automation/flows/:id/steps/:step_id/response",
            post(automation::submit_step),
        )
        .route("/automation/flows/:id/pause", put(automation::pause))
        .route("/automation/flows/:id/resume", put(automation::resume))
        .route("/automation/stats", get(automation::stats))
        .route("/automation/active-flows", get(automation::active_flows))
        .route("/conversations", get(conversations::list))
        .route("/conversations/:id/messages", get(conversations::messages))
        .route("/messages/:id/read", put(conversations::mark_read))
        .route("/legal/documents/:id/accept", post(legal::accept))
        .with_state(ctx.clone());

    let provider = Router::new()
        .route(
            "/webhook",
            get(webhook::verify).post(webhook::receive.layer(axum::middleware::from_fn(
                middleware::signature::verify_webhook,
            ))),
        )
        .with_state(ctx.clone());

    Router::new()
        .nest("/api", api)
        .merge(provider)
        .layer(axum::middleware::from_fn(middleware::access::log_access))
        // Extension must wrap everything that reads ApiContext from extensions
        .layer(axum::Extension(ctx))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::config::ClinicConfig;
    use crate::core_state::testing::{test_state, TestState};
    use crate::messaging::transport::RecordingTransport;
    use crate::messaging::webhook::sign;
    use crate::models::enums::AutomationAction;
    use crate::triage::generation::MockGenerationClient;

    fn setup(config: ClinicConfig) -> (TestState, Router) {
        let test = test_state(config, MockGenerationClient::Fail, RecordingTransport::default());
        let app = api_router(test.state.clone());
        (test, app)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()))
        };
        (status, json)
    }

    /// Patient plus a planned appointment; returns the appointment id.
    async fn seed_appointment(app: &Router) -> String {
        let (status, patient) = call(
            app,
            "POST",
            "/api/patients",
            Some(json!({ "firstName": "Ana", "lastName": "Ruiz", "phone": "600 111 222" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(patient["data"]["phone"], "34600111222");

        let (status, appointment) = call(
            app,
            "POST",
            "/api/appointments",
            Some(json!({
                "patientId": patient["data"]["id"],
                "scheduledAt": "2030-05-06T10:30",
                "treatment": "Limpieza"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(appointment["data"]["status"], "planned");
        appointment["data"]["id"].as_str().unwrap().to_string()
    }

    fn flow_config() -> Value {
        json!({
            "steps": [
                { "type": "message", "message": "Bienvenido a la clínica" },
                {
                    "type": "single_choice",
                    "message": "¿Confirma su cita?",
                    "buttons": [
                        { "value": "confirm", "label": "Confirmar" },
                        { "value": "cancel", "label": "Cancelar" }
                    ],
                    "stateChange": "confirmed"
                }
            ]
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (_test, app) = setup(ClinicConfig::default());
        let (status, body) = call(&app, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["status"], "ok");
        assert_eq!(body["data"]["database"], true);
    }

    #[tokio::test]
    async fn flow_lifecycle_over_http() {
        let (test, app) = setup(ClinicConfig::default());
        let appointment_id = seed_appointment(&app).await;

        let (status, created) = call(
            &app,
            "POST",
            "/api/automation/flows",
            Some(json!({
                "appointmentId": appointment_id,
                "flowType": "pre_visit",
                "flowConfig": flow_config(),
                "currentStep": 4,
                "status": "completed"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["data"]["currentStepIndex"], 0);
        assert_eq!(created["data"]["status"], "active");
        let flow_id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, duplicate) = call(
            &app,
            "POST",
            "/api/automation/flows",
            Some(json!({ "appointmentId": appointment_id, "flowConfig": flow_config() })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(duplicate["code"], "FLOW_ALREADY_EXISTS");

        let (status, out_of_order) = call(
            &app,
            "POST",
            &format!("/api/automation/flows/{flow_id}/steps/1/response"),
            Some(json!({ "response": "confirm" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(out_of_order["code"], "INVALID_STEP");

        let (status, first) = call(
            &app,
            "POST",
            &format!("/api/automation/flows/{flow_id}/steps/0/response"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["data"]["processed"], true);
        assert_eq!(first["data"]["currentStepIndex"], 1);

        let (status, second) = call(
            &app,
            "POST",
            &format!("/api/automation/flows/{flow_id}/steps/1/response"),
            Some(json!({ "response": "confirm", "selectedOptions": ["confirm"] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second["data"]["flowStatus"], "completed");
        assert_eq!(second["data"]["nextStates"], json!(["confirmed"]));

        let (status, detail) = call(&app, "GET", &format!("/api/automation/flows/{flow_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["data"]["flow"]["status"], "completed");
        assert_eq!(detail["data"]["patient"]["firstName"], "Ana");
        let actions: Vec<_> = test.audit.entries().iter().map(|e| e.action_type).collect();
        assert!(actions.contains(&AutomationAction::FlowCompleted));

        let (status, stats) = call(&app, "GET", "/api/automation/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["data"]["total"], 1);
        assert_eq!(stats["data"]["byStatus"]["completed"], 1);

        let (status, cancel) = call(&app, "DELETE", &format!("/api/automation/flows/{flow_id}"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(cancel["code"], "INVALID_FLOW_TRANSITION");
    }

    #[tokio::test]
    async fn pause_resume_and_cancel() {
        let (_test, app) = setup(ClinicConfig::default());
        let appointment_id = seed_appointment(&app).await;
        let (_, created) = call(
            &app,
            "POST",
            "/api/automation/flows",
            Some(json!({ "appointmentId": appointment_id, "flowConfig": flow_config() })),
        )
        .await;
        let flow_id = created["data"]["id"].as_str().unwrap().to_string();

        let (status, resumed) = call(&app, "PUT", &format!("/api/automation/flows/{flow_id}/resume"), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(resumed["code"], "FLOW_NOT_PAUSED");

        let (status, paused) = call(&app, "PUT", &format!("/api/automation/flows/{flow_id}/pause"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(paused["data"]["status"], "paused");

        let (status, inactive) = call(
            &app,
            "POST",
            &format!("/api/automation/flows/{flow_id}/steps/0/response"),
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(inactive["code"], "FLOW_NOT_FOUND_OR_INACTIVE");

        let (status, active) = call(&app, "GET", "/api/automation/active-flows", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(active["data"].as_array().unwrap().is_empty());

        let (status, cancelled) = call(&app, "DELETE", &format!("/api/automation/flows/{flow_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cancelled["data"]["status"], "cancelled");
    }

    #[tokio::test]
    async fn flow_creation_errors() {
        let (_test, app) = setup(ClinicConfig::default());

        let (status, missing) = call(
            &app,
            "POST",
            "/api/automation/flows",
            Some(json!({ "appointmentId": uuid::Uuid::new_v4(), "flowConfig": flow_config() })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(missing["code"], "APPOINTMENT_NOT_FOUND");

        let appointment_id = seed_appointment(&app).await;
        let (status, invalid) = call(
            &app,
            "POST",
            "/api/automation/flows",
            Some(json!({
                "appointmentId": appointment_id,
                "flowConfig": [{ "type": "single_choice", "message": "Elija" }]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(invalid["code"], "INVALID_FLOW_CONFIG");

        let (status, bad_id) = call(&app, "GET", "/api/automation/flows/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(bad_id["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn appointment_status_and_confirmation() {
        let (test, app) = setup(ClinicConfig::default());
        let appointment_id = seed_appointment(&app).await;

        let (status, sent) = call(
            &app,
            "POST",
            &format!("/api/appointments/{appointment_id}/confirmation"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(sent["data"]["appointmentId"], appointment_id.as_str());
        assert_eq!(test.transport.sent().len(), 1);

        let (status, again) = call(
            &app,
            "POST",
            &format!("/api/appointments/{appointment_id}/confirmation"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(again["code"], "CONFIRMATION_ALREADY_SENT");

        let (status, updated) = call(
            &app,
            "PUT",
            &format!("/api/appointments/{appointment_id}/status"),
            Some(json!({ "status": "Confirmed" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(updated["data"]["status"], "confirmed");

        let (status, detail) = call(&app, "GET", &format!("/api/appointments/{appointment_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["data"]["confirmations"].as_array().unwrap().len(), 1);

        let (status, bad) = call(
            &app,
            "PUT",
            &format!("/api/appointments/{appointment_id}/status"),
            Some(json!({ "status": "maybe" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(bad["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn legal_accept_unknown_document_is_404() {
        let (_test, app) = setup(ClinicConfig::default());
        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/legal/documents/{}/accept", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "DOCUMENT_NOT_FOUND");
    }

    fn webhook_config() -> ClinicConfig {
        let mut config = ClinicConfig::default();
        config.whatsapp.verify_token = Some("verify-me".into());
        config.whatsapp.app_secret = Some("app-secret".into());
        config
    }

    #[tokio::test]
    async fn webhook_verification_handshake() {
        let (_test, app) = setup(webhook_config());

        let (status, body) = call(
            &app,
            "GET",
            "/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1158201444",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(1158201444));

        let (status, body) = call(
            &app,
            "GET",
            "/webhook?hub.mode=subscribe&hub.verify_token=wrong&hub.challenge=1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "WEBHOOK_VERIFICATION_FAILED");
    }

    fn signed_request(body: &str, signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("x-hub-signature-256", signature);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn webhook_requires_valid_signature_and_ignores_retries() {
        let (_test, app) = setup(webhook_config());
        let delivery = json!({
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{ "field": "messages", "value": { "messages": [
                { "from": "34600999888", "id": "wamid.abc", "type": "text", "text": { "body": "¿Cuál es el horario?" } }
            ] } }] }]
        })
        .to_string();

        let response = app
            .clone()
            .oneshot(signed_request(&delivery, Some("sha256=00".into())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let signature = sign("app-secret", delivery.as_bytes());
        let response = app
            .clone()
            .oneshot(signed_request(&delivery, Some(signature.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value =
            serde_json::from_slice(&to_bytes(response.into_body(), 4096).await.unwrap()).unwrap();
        assert_eq!(body["data"]["received"], 1);
        assert_eq!(body["data"]["processed"], 1);

        let response = app
            .clone()
            .oneshot(signed_request(&delivery, Some(signature)))
            .await
            .unwrap();
        let body: Value =
            serde_json::from_slice(&to_bytes(response.into_body(), 4096).await.unwrap()).unwrap();
        assert_eq!(body["data"]["duplicates"], 1);

        let (status, conversations) = call(&app, "GET", "/api/conversations?phone=600999888", None).await;
        assert_eq!(status, StatusCode::OK);
        let list = conversations["data"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        let conversation_id = list[0]["id"].as_str().unwrap().to_string();

        let (status, messages) = call(
            &app,
            "GET",
            &format!("/api/conversations/{conversation_id}/messages"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let inbound = &messages["data"][0];
        assert_eq!(inbound["text"], "¿Cuál es el horario?");
        assert_eq!(inbound["isRead"], false);

        let message_id = inbound["id"].as_str().unwrap().to_string();
        let (status, read) = call(&app, "PUT", &format!("/api/messages/{message_id}/read"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(read["data"]["isRead"], true);
    }

    #[tokio::test]
    async fn unsigned_webhook_accepted_without_secret() {
        let (_test, app) = setup(ClinicConfig::default());
        let response = app
            .clone()
            .oneshot(signed_request(r#"{"object":"whatsapp_business_account","entry":[]}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(signed_request("not json", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_conversation_is_404() {
        let (_test, app) = setup(ClinicConfig::default());
        let (status, body) = call(
            &app,
            "GET",
            &format!("/api/conversations/{}/messages", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "CONVERSATION_NOT_FOUND");
    }
}
