//! # Módulo de Clientes de Provider
//!
//! Contrato que o orquestrador usa para falar com cada provider LLM,
//! e a implementação HTTP sobre `reqwest`.
//!
//! ## Para todos entenderem:
//!
//! O orquestrador não sabe nada de HTTP: ele enxerga só o trait
//! `ModelClient` ("me dê o texto de resposta para este prompt").
//! A fábrica (`ClientFactory`) decide qual implementação entregar,
//! o que permite trocar tudo por clientes roteirizados nos testes.
//!
//! ## Formatos de wire suportados:
//!
//! | Provider   | Endpoint                         | Autenticação        |
//! |------------|----------------------------------|---------------------|
//! | openai     | /v1/chat/completions             | Bearer              |
//! | openrouter | /api/v1/chat/completions         | Bearer              |
//! | anthropic  | /v1/messages                     | x-api-key           |
//! | gemini     | /v1beta/models/{m}:generateContent | query param `key` |
//!
//! Todos os erros saem daqui já mapeados para a taxonomia estável
//! (`ErrorKind`); o orquestrador nunca vê um erro cru de reqwest.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::{ErrorKind, ProviderError};
use crate::registry::{self, ModelDescriptor};

// ============================================================================
// TIPOS DO CONTRATO
// ============================================================================

/// Uso de tokens reportado pelo provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Resposta de uma geração bem-sucedida.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Texto gerado pelo modelo.
    pub content: String,
    /// Motivo de parada reportado ("stop", "length", ...).
    pub finish_reason: String,
    /// Uso de tokens, quando o provider informa.
    pub usage: Option<TokenUsage>,
}

/// Cliente de um modelo específico.
///
/// O contrato é deliberadamente mínimo: inicialização na fábrica,
/// `generate` aqui, encerramento via `Drop` (reqwest devolve as
/// conexões do pool sozinho).
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Envia o prompt e aguarda a resposta completa.
    ///
    /// Cancelável: abandona a requisição quando o token dispara e
    /// retorna `ErrorKind::Cancelled`.
    async fn generate(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<Completion, ProviderError>;
}

/// Fábrica de clientes, o ponto de substituição dos testes.
pub trait ClientFactory: Send + Sync {
    /// Cria um cliente para o modelo.
    ///
    /// Falha com `ErrorKind::Auth` quando a credencial do provider não
    /// está no ambiente.
    fn create(&self, model: &ModelDescriptor) -> Result<Box<dyn ModelClient>, ProviderError>;
}

// ============================================================================
// MAPEAMENTO DE ERROS HTTP
// ============================================================================

/// Mapeia um status HTTP para a categoria estável.
fn map_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::Auth,
        402 => ErrorKind::InsufficientCredits,
        408 => ErrorKind::Network,
        413 => ErrorKind::InputLimit,
        429 => ErrorKind::RateLimit,
        400 | 422 => ErrorKind::InvalidRequest,
        500..=599 => ErrorKind::Server,
        _ => ErrorKind::Unknown,
    }
}

/// Refina a categoria usando a mensagem de erro do corpo.
///
/// Providers costumam sinalizar estouro de contexto com 400 genérico;
/// a mensagem é a única pista.
fn refine_kind(kind: ErrorKind, body: &str) -> ErrorKind {
    let lowered = body.to_lowercase();
    if kind == ErrorKind::InvalidRequest
        && (lowered.contains("context length")
            || lowered.contains("context window")
            || lowered.contains("maximum context")
            || lowered.contains("token limit")
            || lowered.contains("too many tokens"))
    {
        return ErrorKind::InputLimit;
    }
    kind
}

/// O finish reason indica recusa por filtro de conteúdo?
fn is_content_filtered(finish_reason: &str) -> bool {
    matches!(
        finish_reason.to_lowercase().as_str(),
        "content_filter" | "safety" | "prohibited_content" | "refusal"
    )
}

/// Extrai o header Retry-After de um 429, em segundos.
///
/// Só a forma delta-seconds é suportada; a forma HTTP-date é rara em
/// APIs de LLM e cai no backoff exponencial normal.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ============================================================================
// CLIENTE HTTP
// ============================================================================

/// Fábrica padrão: um cliente HTTP por modelo, pool de conexões
/// compartilhado entre todos.
pub struct HttpClientFactory {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpClientFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }
}

impl ClientFactory for HttpClientFactory {
    fn create(&self, model: &ModelDescriptor) -> Result<Box<dyn ModelClient>, ProviderError> {
        let env_var = registry::credential_env_var(model.provider).ok_or_else(|| {
            ProviderError::new(
                ErrorKind::Auth,
                model.provider,
                format!("no credential variable known for provider '{}'", model.provider),
            )
        })?;

        let api_key = std::env::var(env_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::new(
                    ErrorKind::Auth,
                    model.provider,
                    format!("credential {env_var} not set"),
                )
            })?;

        Ok(Box::new(HttpModelClient {
            client: self.client.clone(),
            provider: model.provider.to_string(),
            model: model.name.to_string(),
            api_key,
            max_output_tokens: model.max_output_tokens,
            request_timeout: self.request_timeout,
        }))
    }
}

/// Cliente HTTP de um modelo. Um por worker; o pool de conexões do
/// reqwest é compartilhado via clone barato do `Client`.
struct HttpModelClient {
    client: reqwest::Client,
    provider: String,
    model: String,
    api_key: String,
    max_output_tokens: u32,
    request_timeout: Duration,
}

impl HttpModelClient {
    /// Monta (url, body, headers extras) no formato do provider.
    fn build_request(&self, prompt: &str) -> (String, Value, Vec<(&'static str, String)>) {
        match self.provider.as_str() {
            "anthropic" => (
                "https://api.anthropic.com/v1/messages".to_string(),
                json!({
                    "model": self.model,
                    "max_tokens": self.max_output_tokens,
                    "messages": [{ "role": "user", "content": prompt }],
                }),
                vec![
                    ("x-api-key", self.api_key.clone()),
                    ("anthropic-version", "2023-06-01".to_string()),
                ],
            ),
            "gemini" => (
                format!(
                    "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
                    self.model, self.api_key
                ),
                json!({
                    "contents": [{ "parts": [{ "text": prompt }] }],
                    "generationConfig": { "maxOutputTokens": self.max_output_tokens },
                }),
                vec![],
            ),
            "openrouter" => (
                "https://openrouter.ai/api/v1/chat/completions".to_string(),
                json!({
                    "model": self.model,
                    "max_tokens": self.max_output_tokens,
                    "messages": [{ "role": "user", "content": prompt }],
                }),
                vec![("Authorization", format!("Bearer {}", self.api_key))],
            ),
            // openai e qualquer compatível com chat-completions
            _ => (
                "https://api.openai.com/v1/chat/completions".to_string(),
                json!({
                    "model": self.model,
                    "max_tokens": self.max_output_tokens,
                    "messages": [{ "role": "user", "content": prompt }],
                }),
                vec![("Authorization", format!("Bearer {}", self.api_key))],
            ),
        }
    }

    /// Extrai (content, finish_reason, usage) do corpo de sucesso.
    fn parse_response(&self, body: &Value) -> Result<Completion, ProviderError> {
        let (content, finish_reason, usage) = match self.provider.as_str() {
            "anthropic" => (
                body.pointer("/content/0/text").and_then(Value::as_str),
                body.pointer("/stop_reason")
                    .and_then(Value::as_str)
                    .unwrap_or("stop"),
                body.pointer("/usage").map(|u| TokenUsage {
                    prompt_tokens: u.pointer("/input_tokens").and_then(Value::as_u64).unwrap_or(0),
                    completion_tokens: u
                        .pointer("/output_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                }),
            ),
            "gemini" => (
                body.pointer("/candidates/0/content/parts/0/text")
                    .and_then(Value::as_str),
                body.pointer("/candidates/0/finishReason")
                    .and_then(Value::as_str)
                    .unwrap_or("STOP"),
                body.pointer("/usageMetadata").map(|u| TokenUsage {
                    prompt_tokens: u
                        .pointer("/promptTokenCount")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    completion_tokens: u
                        .pointer("/candidatesTokenCount")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                }),
            ),
            _ => (
                body.pointer("/choices/0/message/content")
                    .and_then(Value::as_str),
                body.pointer("/choices/0/finish_reason")
                    .and_then(Value::as_str)
                    .unwrap_or("stop"),
                body.pointer("/usage").map(|u| TokenUsage {
                    prompt_tokens: u
                        .pointer("/prompt_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                    completion_tokens: u
                        .pointer("/completion_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0),
                }),
            ),
        };

        if is_content_filtered(finish_reason) {
            return Err(ProviderError::new(
                ErrorKind::ContentFiltered,
                &self.provider,
                format!("model refused with finish reason '{finish_reason}'"),
            ));
        }

        let content = content.ok_or_else(|| {
            ProviderError::new(
                ErrorKind::Unknown,
                &self.provider,
                "response body carries no text content",
            )
        })?;

        Ok(Completion {
            content: content.to_string(),
            finish_reason: finish_reason.to_string(),
            usage,
        })
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn generate(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
    ) -> Result<Completion, ProviderError> {
        let (url, body, headers) = self.build_request(prompt);

        let mut request = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        debug!(provider = %self.provider, model = %self.model, "sending generation request");

        let response = tokio::select! {
            result = request.send() => result.map_err(|e| {
                let kind = if e.is_timeout() || e.is_connect() || e.is_request() {
                    ErrorKind::Network
                } else {
                    ErrorKind::Unknown
                };
                // A mensagem do reqwest pode embutir a URL (e a chave do
                // gemini vai na query string); não repassamos o erro cru.
                ProviderError::new(kind, &self.provider, "transport failure contacting provider")
            })?,
            _ = cancel.cancelled() => {
                return Err(ProviderError::new(
                    ErrorKind::Cancelled,
                    &self.provider,
                    "generation cancelled",
                ));
            }
        };

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body_text = response.text().await.unwrap_or_default();
            let kind = refine_kind(map_status(status), &body_text);
            let summary: String = body_text.chars().take(200).collect();
            return Err(ProviderError::new(
                kind,
                &self.provider,
                format!("HTTP {}: {}", status.as_u16(), summary.trim()),
            )
            .with_retry_after(retry_after));
        }

        let body: Value = response.json().await.map_err(|_| {
            ProviderError::new(
                ErrorKind::Unknown,
                &self.provider,
                "provider returned a non-JSON body",
            )
        })?;

        self.parse_response(&body)
    }
}

// ============================================================================
// CLIENTES ROTEIRIZADOS (SÓ EM TESTES)
// ============================================================================


// ============================================================================
// TESTES
// ============================================================================
