//! # Módulo de Contagem de Tokens
//!
//! Conta tokens do input (instruções + arquivos de contexto) e decide
//! quais modelos do catálogo comportam a requisição.
//!
//! ## Para todos entenderem:
//!
//! Cada modelo tem uma "janela de contexto": o máximo de tokens que ele
//! aceita de uma vez. Antes de gastar dinheiro chamando um provider,
//! contamos os tokens localmente e descartamos os modelos pequenos demais.
//!
//! ## Exato vs estimado:
//!
//! Quando um tokenizador exato está registrado para o provider do
//! modelo, usamos ele e marcamos `is_accurate = true`. Caso contrário
//! estimamos ~4 caracteres por token (arredondando para cima) sobre o
//! tamanho em bytes UTF-8, com `is_accurate = false`.
//!
//! A estimativa pode errar para baixo; por isso a checagem de
//! compatibilidade aplica a margem de segurança *por cima* da contagem:
//! a janela ajustada usa divisão inteira com piso, nunca arredonda a
//! favor do input.

use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::gatherer::FileRecord;
use crate::registry::{self, ModelDescriptor, ESTIMATION_TOKENIZER};

// ============================================================================
// TOKENIZADORES
// ============================================================================

/// Contrato de um tokenizador exato.
///
/// Implementações reais são registradas por provider; nos testes um
/// tokenizador determinístico simples cumpre o mesmo contrato. O
/// identificador reportado é o `tokenizer` do catálogo do modelo.
pub trait ExactTokenizer: Send + Sync {
    /// Conta os tokens de um texto.
    fn count(&self, text: &str) -> u64;
}

/// Estima tokens a partir do tamanho em bytes UTF-8.
///
/// Aproximação de ~4 bytes por token, arredondada para cima:
/// 1 byte nunca vira 0 tokens.
pub fn estimate_tokens(byte_len: usize) -> u64 {
    (byte_len as u64 + 3) / 4
}

// ============================================================================
// REQUEST / RESULT
// ============================================================================

/// Input de uma contagem: instruções + arquivos, na ordem de leitura.
#[derive(Debug)]
pub struct TokenCountRequest<'a> {
    /// Texto das instruções do usuário.
    pub instructions: &'a str,

    /// Arquivos de contexto, na ordem em que entrarão no prompt.
    pub files: &'a [FileRecord],

    /// Margem de segurança percentual, [0, 50].
    pub safety_margin_percent: u8,
}

impl TokenCountRequest<'_> {
    /// Total de bytes UTF-8 do input (instruções + conteúdos).
    ///
    /// Os cabeçalhos por arquivo do prompt final não entram na soma;
    /// a margem de segurança cobre essa diferença.
    fn total_bytes(&self) -> usize {
        self.instructions.len() + self.files.iter().map(|f| f.content.len()).sum::<usize>()
    }
}

/// Resultado da contagem contra um modelo específico.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCountResult {
    /// Tokens contados (ou estimados).
    pub token_count: u64,

    /// O input cabe na janela ajustada do modelo?
    pub is_compatible: bool,

    /// `true` somente quando um tokenizador exato foi usado.
    pub is_accurate: bool,

    /// Identificador do tokenizador usado.
    pub tokenizer: String,
}

/// Compatibilidade de um modelo do catálogo com o input.
#[derive(Debug, Clone)]
pub struct ModelCompatibility {
    pub model: &'static str,
    pub provider: &'static str,
    pub context_window: u64,
    pub result: TokenCountResult,
}

/// A checagem em lote foi cancelada antes de terminar.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("token counting cancelled")]
pub struct CountCancelled;

// ============================================================================
// TOKEN COUNTER
// ============================================================================

/// Contador de tokens com registro de tokenizadores exatos por provider.
#[derive(Default)]
pub struct TokenCounter {
    exact: HashMap<&'static str, Box<dyn ExactTokenizer>>,
}

impl TokenCounter {
    /// Cria um contador sem tokenizadores exatos (tudo por estimativa).
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra um tokenizador exato para um provider.
    ///
    /// Nenhum tokenizador exato é embarcado no binário hoje; o registro
    /// existe para extensões e para os testes de compatibilidade.
    #[allow(dead_code)]
    pub fn register(&mut self, provider: &'static str, tokenizer: Box<dyn ExactTokenizer>) {
        self.exact.insert(provider, tokenizer);
    }

    /// Conta os tokens do request contra um modelo.
    ///
    /// O caminho exato só vale quando o catálogo nomeia um tokenizador
    /// real para o modelo E há uma implementação registrada para o
    /// provider; qualquer outra combinação cai na estimativa.
    pub fn count_tokens(
        &self,
        request: &TokenCountRequest<'_>,
        model: &ModelDescriptor,
    ) -> TokenCountResult {
        let exact = if model.tokenizer == ESTIMATION_TOKENIZER {
            None
        } else {
            self.exact.get(model.provider)
        };

        let (token_count, is_accurate, tokenizer) = match exact {
            Some(exact) => {
                let mut count = exact.count(request.instructions);
                for file in request.files {
                    count += exact.count(&file.content);
                }
                (count, true, model.tokenizer.to_string())
            }
            None => (
                estimate_tokens(request.total_bytes()),
                false,
                ESTIMATION_TOKENIZER.to_string(),
            ),
        };

        TokenCountResult {
            token_count,
            is_compatible: model.fits(token_count, request.safety_margin_percent),
            is_accurate,
            tokenizer,
        }
    }

    /// Checa todos os modelos do catálogo dos providers dados.
    ///
    /// Respeita cancelamento entre modelos: útil quando o usuário
    /// aborta durante a preparação de um input grande.
    pub fn compatible_models(
        &self,
        cancel: &CancellationToken,
        request: &TokenCountRequest<'_>,
        providers: &[&str],
    ) -> Result<Vec<ModelCompatibility>, CountCancelled> {
        let mut out = Vec::new();

        for model in registry::CATALOG.iter() {
            if cancel.is_cancelled() {
                return Err(CountCancelled);
            }
            if !providers.contains(&model.provider) {
                continue;
            }
            out.push(ModelCompatibility {
                model: model.name,
                provider: model.provider,
                context_window: model.context_window,
                result: self.count_tokens(request, model),
            });
        }

        Ok(out)
    }
}

// ============================================================================
// TESTES
// ============================================================================
