//! # Módulo de Taxonomia de Erros
//!
//! Define as categorias estáveis de erro do thinktank e o mapeamento
//! para exit codes do processo.
//!
//! ## Para todos entenderem:
//!
//! Quando uma chamada a um provider LLM falha, precisamos saber
//! exatamente *por que* falhou para decidir o que fazer:
//! - Tentar de novo? (rate limit, rede, 5xx)
//! - Desistir na hora? (credencial inválida, prompt malformado)
//! - Abrir o circuit breaker? (provider instável)
//!
//! Os nomes das categorias são contrato: scripts de CI dependem
//! dos exit codes derivados delas.
//!
//! ## Categorias e exit codes
//!
//! | Categoria           | Exit | Retry? | Breaker? |
//! |---------------------|------|--------|----------|
//! | Auth                | 2    | não    | não      |
//! | RateLimit           | 3    | sim    | sim      |
//! | InvalidRequest      | 4    | não    | não      |
//! | Server              | 5    | sim    | sim      |
//! | Network             | 6    | sim    | sim      |
//! | InputLimit          | 7    | não    | não      |
//! | ContentFiltered     | 8    | não    | não      |
//! | InsufficientCredits | 9    | não    | não      |
//! | Cancelled           | 10   | não    | não      |
//! | PartialSuccess      | 1    | —      | —        |
//! | CliError            | 1/2/4| —      | —        |
//! | Unknown             | 1    | não    | não      |

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// CATEGORIA DE ERRO
// ============================================================================

/// Categoria estável de erro.
///
/// A ordem de declaração é a ordem de severidade usada para escolher
/// o erro terminal de um resultado agregado: quando várias execuções
/// falham com categorias diferentes, a que aparece primeiro nesta
/// lista vence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credencial ausente ou inválida.
    Auth,
    /// Provider sinalizou throttling (HTTP 429).
    RateLimit,
    /// Prompt ou parâmetros malformados.
    InvalidRequest,
    /// Erro 5xx do provider.
    Server,
    /// Falha de transporte (DNS, conexão, timeout de rede).
    Network,
    /// Prompt excede a janela de contexto do modelo.
    InputLimit,
    /// Provider recusou por filtro de conteúdo.
    ContentFiltered,
    /// Falha de cobrança/créditos.
    InsufficientCredits,
    /// Cancelamento por sinal ou timeout.
    Cancelled,
    /// Agregado: alguns modelos passaram, outros não.
    PartialSuccess,
    /// Erro de argumento, validação ou filesystem antes da orquestração.
    CliError,
    /// Categoria padrão.
    Unknown,
}

impl ErrorKind {
    /// Exit code do processo para esta categoria.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Auth => 2,
            Self::RateLimit => 3,
            Self::InvalidRequest => 4,
            Self::Server => 5,
            Self::Network => 6,
            Self::InputLimit => 7,
            Self::ContentFiltered => 8,
            Self::InsufficientCredits => 9,
            Self::Cancelled => 10,
            Self::PartialSuccess | Self::CliError | Self::Unknown => 1,
        }
    }

    /// Posição na ordem de severidade (menor = mais severo).
    pub fn severity_rank(&self) -> u8 {
        match self {
            Self::Auth => 0,
            Self::RateLimit => 1,
            Self::InvalidRequest => 2,
            Self::Server => 3,
            Self::Network => 4,
            Self::InputLimit => 5,
            Self::ContentFiltered => 6,
            Self::InsufficientCredits => 7,
            Self::Cancelled => 8,
            Self::PartialSuccess => 9,
            Self::CliError => 10,
            Self::Unknown => 11,
        }
    }

    /// Erros desta categoria podem ser tentados novamente com backoff?
    ///
    /// Apenas throttling e falhas transitórias de rede/servidor.
    /// Auth, filtro de conteúdo e request inválido nunca são retryados.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Server | Self::Network)
    }

    /// Falhas desta categoria contam para o circuit breaker do provider?
    pub fn counts_toward_breaker(&self) -> bool {
        matches!(self, Self::RateLimit | Self::Server | Self::Network)
    }

    /// Nome estável (o mesmo usado na serialização do audit log).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::RateLimit => "rate_limit",
            Self::InvalidRequest => "invalid_request",
            Self::Server => "server",
            Self::Network => "network",
            Self::InputLimit => "input_limit",
            Self::ContentFiltered => "content_filtered",
            Self::InsufficientCredits => "insufficient_credits",
            Self::Cancelled => "cancelled",
            Self::PartialSuccess => "partial_success",
            Self::CliError => "cli_error",
            Self::Unknown => "unknown",
        }
    }

    /// Escolhe a categoria mais severa de um conjunto.
    ///
    /// Usado pelo CLI para derivar o erro terminal de um RunOutcome
    /// com falhas de categorias distintas.
    pub fn most_severe(kinds: impl IntoIterator<Item = ErrorKind>) -> Option<ErrorKind> {
        kinds.into_iter().min_by_key(|k| k.severity_rank())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ERRO DE PROVIDER
// ============================================================================

/// Erro retornado por uma chamada a um provider LLM.
///
/// Carrega a categoria mapeada e o identificador do provider.
/// A mensagem é sempre legível; nunca expomos stack traces do
/// cliente HTTP para o usuário.
#[derive(Debug, Clone, Error)]
#[error("[{kind}] provider '{provider}': {message}")]
pub struct ProviderError {
    /// Categoria mapeada do erro.
    pub kind: ErrorKind,
    /// Identificador do provider (ex: "openrouter").
    pub provider: String,
    /// Mensagem legível.
    pub message: String,
    /// Espera pedida pelo provider num 429 (header Retry-After).
    /// Quando presente, o backoff nunca dorme menos que isso.
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

// ============================================================================
// ERRO DE CLI (PRÉ-ORQUESTRAÇÃO)
// ============================================================================

/// Erros que acontecem antes de qualquer chamada a provider:
/// argumentos, validação de config, filesystem.
#[derive(Debug, Error)]
pub enum CliError {
    /// Configuração inválida (flag fora de faixa, caminho vazio, etc).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Nenhuma credencial de provider encontrada no ambiente.
    #[error("no provider credentials found: {0}")]
    MissingCredentials(String),

    /// Erro de filesystem ao preparar a execução.
    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Subkind → exit code: validação vira 4, credencial vira 2,
    /// filesystem vira 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig(_) => 4,
            Self::MissingCredentials(_) => 2,
            Self::Io(_) => 1,
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================
