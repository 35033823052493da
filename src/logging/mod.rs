//! # Módulo de Logging Estruturado
//!
//! Configura o `tracing-subscriber` da invocação: nível, formato e
//! destino dos logs, mais o correlation id que amarra todas as linhas.
//!
//! ## Roteamento:
//!
//! | Situação                    | Destino                        |
//! |-----------------------------|--------------------------------|
//! | `--json-logs`               | stderr, JSON lines             |
//! | `--verbose` / `--debug`     | stderr, formato compacto       |
//! | padrão                      | `<run_dir>/thinktank.log`, JSON|
//! | arquivo não abre            | stderr, formato compacto       |
//!
//! ## Correlation id:
//!
//! Um UUID por invocação, carregado por um span raiz. Todo log emitido
//! dentro do span (e dos spans filhos dos workers) sai com o campo
//! `correlation_id`. O audit log usa o mesmo id, então dá para cruzar
//! os dois arquivos linha a linha.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Nome do arquivo de log dentro do diretório da execução.
pub const LOG_FILE_NAME: &str = "thinktank.log";

// ============================================================================
// OPÇÕES
// ============================================================================

/// Decisões de roteamento derivadas das flags do CLI.
#[derive(Debug, Clone, Copy)]
pub struct LoggingOptions {
    /// Nível mínimo de log.
    pub level: Level,
    /// Roteia para stderr ao invés do arquivo da execução.
    pub console: bool,
    /// Em stderr, emite JSON lines ao invés do formato compacto.
    pub console_json: bool,
}

// ============================================================================
// WRITER DE ARQUIVO
// ============================================================================

/// Writer clonável sobre o arquivo de log.
///
/// `&File` implementa `Write` com escrita atômica por chamada, então
/// vários layers podem compartilhar o mesmo arquivo sem interleaving
/// dentro de uma linha.
struct SharedFileWriter(Arc<File>);

impl Write for SharedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

// ============================================================================
// GUARD
// ============================================================================

/// Mantém o arquivo de log vivo e permite fechamento idempotente.
pub struct LoggerGuard {
    file: Mutex<Option<Arc<File>>>,
}

impl LoggerGuard {
    fn with_file(file: Option<Arc<File>>) -> Self {
        Self {
            file: Mutex::new(file),
        }
    }

    /// Flusha e solta o arquivo. Chamadas seguintes são no-op.
    pub fn close(&self) {
        let mut guard = self.file.lock().expect("logger guard lock poisoned");
        if let Some(file) = guard.take() {
            let _ = (&*file).flush();
            let _ = file.sync_all();
        }
    }
}

impl Drop for LoggerGuard {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// INICIALIZAÇÃO
// ============================================================================

/// Inicializa o subscriber global da invocação.
///
/// Nunca falha: quando o arquivo de log não pode ser aberto, cai para
/// stderr e segue. Re-inicializações (testes rodando em lote) são
/// ignoradas silenciosamente.
pub fn init_logging(options: LoggingOptions, run_dir: &Path) -> LoggerGuard {
    // RUST_LOG tem precedência; senão o nível vem das flags.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.level.to_string()));

    if options.console {
        if options.console_json {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init();
        } else {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(io::stderr),
                )
                .try_init();
        }
        return LoggerGuard::with_file(None);
    }

    match File::create(run_dir.join(LOG_FILE_NAME)) {
        Ok(file) => {
            let file = Arc::new(file);
            let writer_file = file.clone();
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .with_writer(move || SharedFileWriter(writer_file.clone())),
                )
                .try_init();
            LoggerGuard::with_file(Some(file))
        }
        Err(e) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(io::stderr),
                )
                .try_init();
            tracing::warn!(error = %e, "could not open run log file, logging to stderr");
            LoggerGuard::with_file(None)
        }
    }
}

/// Span raiz da invocação, dono do correlation id.
///
/// O main entra neste span antes de qualquer log e os workers do
/// orquestrador se instrumentam com spans filhos dele.
pub fn run_span(correlation_id: &str) -> tracing::Span {
    tracing::info_span!("run", correlation_id = %correlation_id)
}

// ============================================================================
// TESTES
// ============================================================================
