//! # Módulo de Configuração da Execução
//!
//! Define a `RunConfig`, a configuração imutável de uma invocação do
//! thinktank, e a validação dos seus invariantes.
//!
//! ## Para todos entenderem:
//!
//! Tudo que o usuário escolhe na linha de comando vira um campo aqui.
//! Depois de construída e validada, a RunConfig nunca muda: todos os
//! componentes recebem uma referência somente-leitura dela.
//!
//! ## Invariantes validados:
//!
//! | Campo                | Regra                                   |
//! |----------------------|-----------------------------------------|
//! | instructions         | não-vazio (exceto em dry-run)           |
//! | targets              | pelo menos um caminho                   |
//! | timeout              | maior que zero                          |
//! | token_safety_margin  | entre 0 e 50 (inclusive)                |
//! | dir_perm / file_perm | modo octal representável (≤ 0o777)      |

use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

use crate::errors::CliError;

// ============================================================================
// VALORES PADRÃO
// ============================================================================

/// Timeout global padrão da execução.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Máximo de requisições simultâneas por provider.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Margem de segurança padrão sobre a janela de contexto (percentual).
pub const DEFAULT_SAFETY_MARGIN: u8 = 10;

/// Permissão padrão do diretório de saída.
pub const DEFAULT_DIR_PERM: u32 = 0o755;

/// Permissão padrão dos artefatos escritos.
pub const DEFAULT_FILE_PERM: u32 = 0o644;

// ============================================================================
// RUN CONFIG
// ============================================================================

/// Configuração imutável de uma execução.
///
/// Construída uma única vez no main a partir dos argumentos parseados
/// e compartilhada por referência com todos os componentes.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Caminho do arquivo de instruções.
    pub instructions: PathBuf,

    /// Caminhos alvo, na ordem em que o usuário passou.
    pub targets: Vec<PathBuf>,

    /// Modelos escolhidos explicitamente com `--model`.
    /// Vazio significa seleção automática por compatibilidade.
    pub models: Vec<String>,

    /// Modelo de síntese. `None` desliga a síntese explícita
    /// (a política padrão ainda pode ativá-la).
    pub synthesis_model: Option<String>,

    /// Diretório de saída resolvido desta execução.
    pub output_dir: PathBuf,

    /// Modo dry-run: conta tokens e lista modelos sem chamar providers.
    pub dry_run: bool,

    /// Força a síntese mesmo com um único modelo selecionado.
    pub force_synthesis: bool,

    /// Nível mínimo de log.
    pub log_level: Level,

    /// Suprime stdout não-essencial.
    pub quiet: bool,

    /// Desliga indicadores de progresso.
    pub no_progress: bool,

    /// Roteia logs estruturados para stderr ao invés do arquivo.
    pub json_logs: bool,

    /// Timeout global da execução.
    pub timeout: Duration,

    /// Máximo de requisições em voo por provider.
    pub max_concurrent_per_provider: usize,

    /// Teto de requisições por minuto por provider.
    /// Zero usa o RPM padrão de cada modelo no catálogo.
    pub provider_rpm: u32,

    /// Permissão (modo octal) do diretório de saída.
    pub dir_perm: u32,

    /// Permissão (modo octal) dos arquivos de artefato.
    pub file_perm: u32,

    /// Margem de segurança percentual descontada da janela de contexto
    /// antes do teste de compatibilidade. Faixa válida: [0, 50].
    pub token_safety_margin: u8,

    /// Com síntese bem-sucedida, trata PartialSuccess como sucesso.
    pub partial_success_ok: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            instructions: PathBuf::new(),
            targets: Vec::new(),
            models: Vec::new(),
            synthesis_model: None,
            output_dir: PathBuf::new(),
            dry_run: false,
            force_synthesis: false,
            log_level: Level::INFO,
            quiet: false,
            no_progress: false,
            json_logs: false,
            timeout: DEFAULT_TIMEOUT,
            max_concurrent_per_provider: DEFAULT_MAX_CONCURRENT,
            provider_rpm: 0,
            dir_perm: DEFAULT_DIR_PERM,
            file_perm: DEFAULT_FILE_PERM,
            token_safety_margin: DEFAULT_SAFETY_MARGIN,
            partial_success_ok: false,
        }
    }
}

impl RunConfig {
    /// Valida os invariantes da configuração.
    ///
    /// Chamada uma única vez, logo após a construção. Qualquer violação
    /// é um `CliError::InvalidConfig` (exit code 4) antes de tocar
    /// qualquer provider.
    pub fn validate(&self) -> Result<(), CliError> {
        if !self.dry_run && self.instructions.as_os_str().is_empty() {
            return Err(CliError::InvalidConfig(
                "instructions file path must not be empty".to_string(),
            ));
        }

        if self.targets.is_empty() {
            return Err(CliError::InvalidConfig(
                "at least one target path is required".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(CliError::InvalidConfig(
                "timeout must be greater than zero".to_string(),
            ));
        }

        if self.token_safety_margin > 50 {
            return Err(CliError::InvalidConfig(format!(
                "token safety margin must be in [0, 50], got {}",
                self.token_safety_margin
            )));
        }

        if self.dir_perm > 0o777 || self.file_perm > 0o777 {
            return Err(CliError::InvalidConfig(format!(
                "permissions must be octal file modes (dir {:o}, file {:o})",
                self.dir_perm, self.file_perm
            )));
        }

        Ok(())
    }
}

// ============================================================================
// TESTES
// ============================================================================
