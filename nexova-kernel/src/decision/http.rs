/**
 * HTTP COLLABORATOR - Service de décision distant
 *
 * POST JSON du ContextBundle vers l'endpoint configuré, bearer token optionnel.
 * La réponse est renvoyée telle quelle (non typée) au DecisionInvoker qui la valide.
 */

use super::{ContextBundle, DecisionCollaborator, DecisionError};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

pub struct HttpCollaborator {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpCollaborator {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self, DecisionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nexova-kernel/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DecisionError::Transport(e.to_string()))?;
        Ok(Self { client, endpoint: endpoint.into(), token, timeout })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl DecisionCollaborator for HttpCollaborator {
    async fn decide(&self, context: &ContextBundle) -> Result<Value, DecisionError> {
        let mut request = self.client.post(&self.endpoint).json(context);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DecisionError::Timeout(self.timeout)
            } else {
                DecisionError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DecisionError::Transport(format!("decision service answered {status}")));
        }

        let body = response.text().await.map_err(|e| DecisionError::Transport(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| DecisionError::Malformed(format!("response is not JSON: {e}")))
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnomalyKind, Machine, MachineStatus, TelemetryReading};
    use crate::profiles::MachineProfile;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use time::OffsetDateTime;

    fn context() -> ContextBundle {
        ContextBundle {
            machine: Machine { id: "cnc-01".into(), name: "CNC 01".into(), machine_type: "CNC".into(), status: MachineStatus::Online },
            anomaly_kind: AnomalyKind::Overheat,
            reading: TelemetryReading {
                machine_id: "cnc-01".into(),
                timestamp: OffsetDateTime::now_utc(),
                voltage: 400.0,
                current: 20.0,
                power: 9.0,
                temperature: 80.0,
                vibration: 2.0,
                production: 30.0,
                runtime_hours: 2.0,
            },
            profile: MachineProfile::default(),
            history: Vec::new(),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/decide")
    }

    #[tokio::test]
    async fn test_posts_context_with_bearer_token() {
        let router = Router::new().route(
            "/decide",
            post(|headers: HeaderMap, Json(body): Json<Value>| async move {
                let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
                Json(serde_json::json!({ "auth": auth, "kind": body["anomalyKind"], "machine": body["machine"]["id"] }))
            }),
        );
        let url = serve(router).await;

        let collaborator = HttpCollaborator::new(url, Some("secret".into()), Duration::from_secs(5)).unwrap();
        let echoed = collaborator.decide(&context()).await.unwrap();
        assert_eq!(echoed["auth"], "Bearer secret");
        assert_eq!(echoed["kind"], "OVERHEAT");
        assert_eq!(echoed["machine"], "cnc-01");
    }

    #[tokio::test]
    async fn test_error_status_is_transport_failure() {
        let router = Router::new().route("/decide", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let url = serve(router).await;

        let err = HttpCollaborator::new(url, None, Duration::from_secs(5)).unwrap().decide(&context()).await.unwrap_err();
        assert!(matches!(err, DecisionError::Transport(_)));
    }

    #[tokio::test]
    async fn test_non_json_body_is_malformed() {
        let router = Router::new().route("/decide", post(|| async { "take it offline" }));
        let url = serve(router).await;

        let err = HttpCollaborator::new(url, None, Duration::from_secs(5)).unwrap().decide(&context()).await.unwrap_err();
        assert!(matches!(err, DecisionError::Malformed(_)));
    }
}
