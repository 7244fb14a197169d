use super::{PointForecaster, PointModelLoader, PointOutput, SampleForecaster, SamplingModelLoader};
use crate::context::ExecutionContext;
use crate::retry::retry_with_backoff;
use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const LOAD_TIMEOUT: Duration = Duration::from_secs(600);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ERROR_BODY_CHARS: usize = 500;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadRequest<'a> {
    model: &'a str,
    device: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadResponse {
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ForecastRequest<'a> {
    context: &'a [f64],
    horizon: usize,
}

#[derive(Deserialize)]
struct ForecastResponse {
    forecast: PointOutput,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SampleRequest<'a> {
    context: &'a [f64],
    prediction_length: usize,
    num_samples: usize,
}

#[derive(Deserialize)]
struct SampleResponse {
    samples: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct ModelHostClient {
    base_url: String,
    client: Client,
}

impl ModelHostClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(anyhow!("Model host URL is empty"));
        }
        let client = Client::builder()
            .timeout(LOAD_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn open_session(&self, model: &str, context: &ExecutionContext) -> Result<ModelHostSession> {
        let url = format!("{}/models/load", self.base_url);
        let body = LoadRequest {
            model,
            device: context.device_label(),
        };
        let response: LoadResponse = retry_with_backoff(&format!("load {}", model), || {
            let response = self.client.post(url.as_str()).json(&body).send()?;
            decode_response(response, &url)
        })
        .with_context(|| format!("Model host could not load {}", model))?;
        log::info!(
            "Model host session {} opened for {} on {}",
            response.session_id,
            model,
            context.device_label()
        );
        Ok(ModelHostSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            session_id: response.session_id,
            model: model.to_string(),
        })
    }
}

fn decode_response<T: for<'de> Deserialize<'de>>(
    response: reqwest::blocking::Response,
    url: &str,
) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .with_context(|| format!("Malformed response from {}", url));
    }
    let body = response.text().unwrap_or_default();
    Err(anyhow!(
        "Model host request failed: status={} url={} body={}",
        status,
        url,
        truncate_for_log(&body, MAX_ERROR_BODY_CHARS)
    ))
}

fn truncate_for_log(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let truncated: String = body.chars().take(max_chars).collect();
    format!("{}...", truncated)
}

/// One loaded model on the host. Dropping it unloads the model.
pub struct ModelHostSession {
    client: Client,
    base_url: String,
    session_id: String,
    model: String,
}

impl ModelHostSession {
    fn session_url(&self, action: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, self.session_id, action)
    }

    fn post<B: Serialize, T: for<'de> Deserialize<'de>>(&self, action: &str, body: &B) -> Result<T> {
        let url = self.session_url(action);
        retry_with_backoff(&format!("{} {}", self.model, action), || {
            let response = self
                .client
                .post(url.as_str())
                .timeout(REQUEST_TIMEOUT)
                .json(body)
                .send()?;
            decode_response(response, &url)
        })
    }
}

impl PointForecaster for ModelHostSession {
    fn forecast(&mut self, context: &[f64], horizon: usize) -> Result<PointOutput> {
        let response: ForecastResponse = self.post("forecast", &ForecastRequest { context, horizon })?;
        Ok(response.forecast)
    }
}

impl SampleForecaster for ModelHostSession {
    fn sample(
        &mut self,
        context: &[f64],
        prediction_length: usize,
        num_samples: usize,
    ) -> Result<Vec<Vec<f64>>> {
        let response: SampleResponse = self.post(
            "sample",
            &SampleRequest {
                context,
                prediction_length,
                num_samples,
            },
        )?;
        Ok(response.samples)
    }
}

impl Drop for ModelHostSession {
    fn drop(&mut self) {
        let url = format!("{}/sessions/{}", self.base_url, self.session_id);
        match self.client.delete(url.as_str()).timeout(REQUEST_TIMEOUT).send() {
            Ok(response) if response.status().is_success() => {
                log::debug!("Closed model host session {}", self.session_id);
            }
            Ok(response) => {
                log::warn!(
                    "Closing session {} for {} returned {}",
                    self.session_id,
                    self.model,
                    response.status()
                );
            }
            Err(err) => {
                log::warn!(
                    "Failed to close session {} for {}: {}",
                    self.session_id,
                    self.model,
                    err
                );
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModelHostLoader {
    client: ModelHostClient,
}

impl ModelHostLoader {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: ModelHostClient::new(base_url)?,
        })
    }
}

impl PointModelLoader for ModelHostLoader {
    fn load(&self, model: &str, context: &ExecutionContext) -> Result<Box<dyn PointForecaster>> {
        Ok(Box::new(self.client.open_session(model, context)?))
    }
}

impl SamplingModelLoader for ModelHostLoader {
    fn load(&self, model: &str, context: &ExecutionContext) -> Result<Box<dyn SampleForecaster>> {
        Ok(Box::new(self.client.open_session(model, context)?))
    }
}
