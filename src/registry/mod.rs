//! # Módulo de Catálogo de Modelos
//!
//! Catálogo estático de modelos LLM conhecidos: provider, janela de
//! contexto, RPM padrão e o tokenizador associado.
//!
//! ## Para todos entenderem:
//!
//! O catálogo é a "tabela de especificações" dos modelos. A seleção
//! automática percorre esta tabela em ordem fixa, então duas execuções
//! sobre o mesmo catálogo escolhem sempre a mesma lista — importante
//! para reprodutibilidade em CI.
//!
//! Um provider está disponível quando a variável de ambiente da sua
//! credencial existe e não está vazia. Só credenciais vêm do ambiente;
//! todo o resto vem de flags.

use once_cell::sync::Lazy;
use thiserror::Error;

// ============================================================================
// PROVIDERS
// ============================================================================

/// Identificador do tokenizador por estimativa.
pub const ESTIMATION_TOKENIZER: &str = "estimation";

/// Providers conhecidos e a variável de ambiente da credencial de cada um.
pub static PROVIDERS: &[(&str, &str)] = &[
    ("openai", "OPENAI_API_KEY"),
    ("anthropic", "ANTHROPIC_API_KEY"),
    ("gemini", "GEMINI_API_KEY"),
    ("openrouter", "OPENROUTER_API_KEY"),
];

/// Retorna a variável de ambiente da credencial de um provider.
pub fn credential_env_var(provider: &str) -> Option<&'static str> {
    PROVIDERS
        .iter()
        .find(|(id, _)| *id == provider)
        .map(|(_, var)| *var)
}

/// Providers cuja credencial está presente no ambiente.
///
/// Uma credencial conta como presente quando a variável existe
/// e não é vazia (espaços não contam).
pub fn available_providers() -> Vec<&'static str> {
    available_providers_with(|var| std::env::var(var).ok())
}

/// Variante com lookup injetável, usada nos testes para não depender
/// do ambiente real do processo.
pub fn available_providers_with<F>(lookup: F) -> Vec<&'static str>
where
    F: Fn(&str) -> Option<String>,
{
    PROVIDERS
        .iter()
        .filter(|(_, var)| {
            lookup(var)
                .map(|value| !value.trim().is_empty())
                .unwrap_or(false)
        })
        .map(|(id, _)| *id)
        .collect()
}

// ============================================================================
// DESCRITOR DE MODELO
// ============================================================================

/// Descritor imutável de um modelo do catálogo.
#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    /// Nome do modelo, como aceito em `--model`.
    pub name: &'static str,

    /// Provider dono do modelo.
    pub provider: &'static str,

    /// Janela de contexto em tokens.
    pub context_window: u64,

    /// Requisições por minuto padrão quando a config não sobrescreve.
    pub default_rpm: u32,

    /// Identificador do tokenizador exato, ou "estimation".
    pub tokenizer: &'static str,

    /// Máximo de tokens de saída pedido nas requisições.
    pub max_output_tokens: u32,
}

impl ModelDescriptor {
    /// Janela de contexto descontada a margem de segurança.
    ///
    /// Divisão inteira com piso: a janela ajustada nunca é arredondada
    /// para cima, o que mantém a checagem pessimista quando a contagem
    /// de tokens é estimada.
    pub fn adjusted_window(&self, safety_margin_percent: u8) -> u64 {
        let margin = safety_margin_percent.min(100) as u64;
        self.context_window * (100 - margin) / 100
    }

    /// O input de `tokens` cabe neste modelo com a margem dada?
    pub fn fits(&self, tokens: u64, safety_margin_percent: u8) -> bool {
        tokens <= self.adjusted_window(safety_margin_percent)
    }
}

/// Erro para nomes fora do catálogo.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown model '{0}'")]
pub struct UnknownModel(pub String);

// ============================================================================
// CATÁLOGO
// ============================================================================

/// Catálogo de modelos, em ordem de preferência.
///
/// A ordem é significativa: `select_models_for_input` devolve os nomes
/// nesta mesma ordem. Adicionar modelos no fim preserva a seleção de
/// execuções existentes.
pub static CATALOG: Lazy<Vec<ModelDescriptor>> = Lazy::new(|| {
    vec![
        ModelDescriptor {
            name: "gpt-4.1",
            provider: "openai",
            context_window: 1_047_576,
            default_rpm: 500,
            tokenizer: "o200k_base",
            max_output_tokens: 32_768,
        },
        ModelDescriptor {
            name: "o4-mini",
            provider: "openai",
            context_window: 200_000,
            default_rpm: 500,
            tokenizer: "o200k_base",
            max_output_tokens: 65_536,
        },
        ModelDescriptor {
            name: "gpt-4o",
            provider: "openai",
            context_window: 128_000,
            default_rpm: 500,
            tokenizer: "o200k_base",
            max_output_tokens: 16_384,
        },
        ModelDescriptor {
            name: "claude-opus-4",
            provider: "anthropic",
            context_window: 200_000,
            default_rpm: 120,
            tokenizer: ESTIMATION_TOKENIZER,
            max_output_tokens: 32_000,
        },
        ModelDescriptor {
            name: "claude-sonnet-4",
            provider: "anthropic",
            context_window: 200_000,
            default_rpm: 300,
            tokenizer: ESTIMATION_TOKENIZER,
            max_output_tokens: 64_000,
        },
        ModelDescriptor {
            name: "gemini-2.5-pro",
            provider: "gemini",
            context_window: 1_048_576,
            default_rpm: 150,
            tokenizer: ESTIMATION_TOKENIZER,
            max_output_tokens: 65_536,
        },
        ModelDescriptor {
            name: "gemini-2.5-flash",
            provider: "gemini",
            context_window: 1_048_576,
            default_rpm: 300,
            tokenizer: ESTIMATION_TOKENIZER,
            max_output_tokens: 65_536,
        },
        ModelDescriptor {
            name: "deepseek-r1",
            provider: "openrouter",
            context_window: 131_072,
            default_rpm: 60,
            tokenizer: ESTIMATION_TOKENIZER,
            max_output_tokens: 32_768,
        },
        ModelDescriptor {
            name: "qwen3-235b",
            provider: "openrouter",
            context_window: 131_072,
            default_rpm: 60,
            tokenizer: ESTIMATION_TOKENIZER,
            max_output_tokens: 32_768,
        },
    ]
});

/// Busca o descritor de um modelo pelo nome.
pub fn get_model_info(name: &str) -> Result<&'static ModelDescriptor, UnknownModel> {
    CATALOG
        .iter()
        .find(|m| m.name == name)
        .ok_or_else(|| UnknownModel(name.to_string()))
}

/// Seleciona todos os modelos dos providers dados cuja janela ajustada
/// comporta `tokens`.
///
/// A ordem do retorno é a ordem do catálogo — determinística entre
/// execuções sobre o mesmo catálogo.
///
/// ## Nota de implementação:
///
/// O fluxo principal usa a checagem por modelo do TokenCounter, que
/// carrega contagens exatas quando há tokenizador registrado; esta
/// função é o atalho para quem só tem uma contagem única.
#[allow(dead_code)]
pub fn select_models_for_input(
    tokens: u64,
    providers: &[&str],
    safety_margin_percent: u8,
) -> Vec<&'static str> {
    CATALOG
        .iter()
        .filter(|m| providers.contains(&m.provider))
        .filter(|m| m.fits(tokens, safety_margin_percent))
        .map(|m| m.name)
        .collect()
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_model_info_known_and_unknown() {
        let info = get_model_info("gpt-4o").unwrap();
        assert_eq!(info.provider, "openai");
        assert_eq!(info.context_window, 128_000);

        let err = get_model_info("nope-9000").unwrap_err();
        assert_eq!(err, UnknownModel("nope-9000".to_string()));
    }

    #[test]
    fn test_available_providers_requires_nonempty_credential() {
        let providers = available_providers_with(|var| match var {
            "OPENAI_API_KEY" => Some("sk-test".to_string()),
            "ANTHROPIC_API_KEY" => Some("".to_string()),
            "GEMINI_API_KEY" => Some("   ".to_string()),
            _ => None,
        });
        assert_eq!(providers, vec!["openai"]);
    }

    #[test]
    fn test_adjusted_window_floor() {
        let model = get_model_info("gpt-4o").unwrap();
        // margem 0: janela crua
        assert_eq!(model.adjusted_window(0), 128_000);
        // margem 50: metade da janela
        assert_eq!(model.adjusted_window(50), 64_000);
        // margem 20
        assert_eq!(model.adjusted_window(20), 102_400);
    }

    #[test]
    fn test_selection_is_catalog_ordered_and_deterministic() {
        let providers = ["openai", "anthropic"];
        let first = select_models_for_input(100_000, &providers, 20);
        let second = select_models_for_input(100_000, &providers, 20);
        assert_eq!(first, second);

        // gpt-4o (janela ajustada 102_400) entra; catálogo dita a ordem.
        assert_eq!(
            first,
            vec!["gpt-4.1", "o4-mini", "gpt-4o", "claude-opus-4", "claude-sonnet-4"]
        );
    }

    #[test]
    fn test_selection_excludes_models_too_small() {
        let providers = ["openai"];
        // 150k tokens com margem 20: gpt-4o (102_400) e o4-mini (160_000) —
        // o4-mini ainda cabe, gpt-4o não.
        let selected = select_models_for_input(150_000, &providers, 20);
        assert!(selected.contains(&"o4-mini"));
        assert!(!selected.contains(&"gpt-4o"));
    }

    #[test]
    fn test_selection_empty_when_nothing_fits() {
        let providers = ["openai", "anthropic", "gemini", "openrouter"];
        let selected = select_models_for_input(5_000_000, &providers, 0);
        assert!(selected.is_empty());
    }

    #[test]
    fn test_credential_env_var_lookup() {
        assert_eq!(credential_env_var("openrouter"), Some("OPENROUTER_API_KEY"));
        assert_eq!(credential_env_var("unknown"), None);
    }
}
