use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use axum::{
    extract::Extension,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::billing::{BillingError, BillingResult, UsageLedger};
use crate::error::AppResult;
use crate::extractor::AuthUser;
use crate::text_budget::{count_billable, normalize, to_ssml, truncate};

/// key: speech-synthesizer -> opaque audio engine seam
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, ssml: &str, voice: &str) -> BillingResult<Bytes>;
}

/// Posts `{ssml, voice}` to an HTTP synthesis provider and returns the body as audio.
pub struct HttpSpeechSynthesizer {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpSpeechSynthesizer {
    pub fn new(http: reqwest::Client, endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, ssml: &str, voice: &str) -> BillingResult<Bytes> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .json(&json!({ "ssml": ssml, "voice": voice }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| BillingError::SynthesisProvider(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(BillingError::SynthesisProvider(format!(
                "provider answered {status}"
            )));
        }
        response
            .bytes()
            .await
            .map_err(|err| BillingError::SynthesisProvider(err.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub audio: Bytes,
    pub billed_characters: i64,
    pub truncated: bool,
    pub reservation_id: Uuid,
}

/// key: synthesis-pipeline -> budget, reserve, synthesize, settle
#[derive(Clone)]
pub struct SynthesisService {
    ledger: UsageLedger,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    max_request_characters: usize,
    timeout: Duration,
}

impl SynthesisService {
    pub fn new(
        ledger: UsageLedger,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        max_request_characters: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            synthesizer,
            max_request_characters,
            timeout,
        }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// The provider call and the commit or release run in their own task, so
    /// the reservation is settled even if the caller goes away.
    pub async fn synthesize(&self, user_id: i32, text: &str, voice: &str) -> BillingResult<SynthesisOutput> {
        let normalized = normalize(text);
        let budgeted = truncate(&normalized, self.max_request_characters);
        let truncated = budgeted != normalized;
        let billable = count_billable(&budgeted) as i64;
        if billable == 0 {
            return Err(BillingError::MalformedPayload(
                "text has no billable characters".into(),
            ));
        }

        let reservation = self.ledger.check_and_reserve(user_id, billable).await?;
        let reservation_id = reservation.id;
        let ssml = to_ssml(&budgeted);
        let voice = voice.to_string();
        let ledger = self.ledger.clone();
        let synthesizer = self.synthesizer.clone();
        let timeout = self.timeout;

        let settled = tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, synthesizer.synthesize(&ssml, &voice)).await;
            match outcome {
                Ok(Ok(audio)) => {
                    if let Err(err) = ledger.commit(reservation_id, billable).await {
                        error!(?err, user_id, reservation = %reservation_id, "failed to commit usage");
                    }
                    Ok(audio)
                }
                Ok(Err(err)) => {
                    warn!(?err, user_id, reservation = %reservation_id, "synthesis failed; releasing usage");
                    release(&ledger, reservation_id).await;
                    Err(err)
                }
                Err(_) => {
                    warn!(
                        user_id,
                        reservation = %reservation_id,
                        timeout_secs = timeout.as_secs(),
                        "synthesis timed out; releasing usage"
                    );
                    release(&ledger, reservation_id).await;
                    Err(BillingError::SynthesisTimeout)
                }
            }
        });

        let audio = settled
            .await
            .map_err(|err| anyhow!("synthesis task aborted: {err}"))??;
        info!(
            user_id,
            characters = billable,
            truncated,
            audio_bytes = audio.len(),
            "speech synthesized"
        );
        Ok(SynthesisOutput {
            audio,
            billed_characters: billable,
            truncated,
            reservation_id,
        })
    }
}

async fn release(ledger: &UsageLedger, reservation_id: Uuid) {
    if let Err(err) = ledger.release(reservation_id).await {
        error!(?err, reservation = %reservation_id, "failed to release usage");
    }
}

#[derive(Debug, Deserialize)]
pub struct SynthesizeRequest {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
}

/// key: synthesis-api -> metered text to speech
pub async fn synthesize(
    Extension(service): Extension<SynthesisService>,
    AuthUser { user_id }: AuthUser,
    Json(payload): Json<SynthesizeRequest>,
) -> AppResult<Response> {
    let voice = payload.voice.as_deref().unwrap_or("default");
    let output = service.synthesize(user_id, &payload.text, voice).await?;
    let headers = [
        (header::CONTENT_TYPE, "audio/mpeg".to_string()),
        (
            header::HeaderName::from_static("x-billed-characters"),
            output.billed_characters.to_string(),
        ),
        (
            header::HeaderName::from_static("x-text-truncated"),
            output.truncated.to_string(),
        ),
    ];
    Ok((headers, output.audio).into_response())
}
