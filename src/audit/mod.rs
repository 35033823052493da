//! # Módulo de Audit Log
//!
//! Trilha de auditoria append-only em JSON-lines (`audit.jsonl` dentro
//! do diretório da execução).
//!
//! ## Para todos entenderem:
//!
//! O log de aplicação conta a história para humanos; o audit log conta
//! para máquinas: uma linha JSON por operação, com timestamp UTC,
//! status e o correlation id da invocação. Dashboards e pipelines de
//! CI consomem este arquivo direto.
//!
//! Cada linha é escrita e flushada inteira, com o `\n` no final: um
//! crash no meio da execução pode perder a última operação, mas nunca
//! deixa uma linha pela metade.
//!
//! Em dry-run o sink é trocado pela variante no-op e nenhum arquivo é
//! criado.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::warn;

use crate::errors::ErrorKind;

/// Nome do arquivo de auditoria dentro do diretório da execução.
pub const AUDIT_FILE_NAME: &str = "audit.jsonl";

// ============================================================================
// ENTRADA DE AUDITORIA
// ============================================================================

/// Status de uma operação auditada.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// Erro embutido numa entrada de auditoria.
#[derive(Debug, Clone, Serialize)]
pub struct AuditError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
}

/// Uma linha do audit log.
///
/// `BTreeMap` nos mapas livres mantém as chaves ordenadas — diffs de
/// linhas de auditoria ficam estáveis entre execuções.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    /// Timestamp UTC em RFC 3339.
    pub timestamp: DateTime<Utc>,
    /// Nome da operação ("model_selection", "generate", ...).
    pub operation: String,
    pub status: AuditStatus,
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    /// Contagens de tokens por modelo, quando relevantes.
    pub token_counts: Option<BTreeMap<String, u64>>,
    pub error: Option<AuditError>,
    pub correlation_id: String,
}

impl AuditEntry {
    pub fn new(operation: impl Into<String>, status: AuditStatus, correlation_id: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            status,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            token_counts: None,
            error: None,
            correlation_id: correlation_id.to_string(),
        }
    }

    pub fn success(operation: impl Into<String>, correlation_id: &str) -> Self {
        Self::new(operation, AuditStatus::Success, correlation_id)
    }

    pub fn failure(operation: impl Into<String>, correlation_id: &str) -> Self {
        Self::new(operation, AuditStatus::Failure, correlation_id)
    }

    pub fn with_input(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.inputs.insert(key.to_string(), value.into());
        self
    }

    pub fn with_output(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn with_token_counts(mut self, counts: BTreeMap<String, u64>) -> Self {
        self.token_counts = Some(counts);
        self
    }

    pub fn with_error(mut self, kind: ErrorKind, message: impl Into<String>) -> Self {
        self.error = Some(AuditError {
            message: message.into(),
            kind,
        });
        self
    }
}

// ============================================================================
// SINKS
// ============================================================================

/// Destino de entradas de auditoria. Seguro para uso concorrente.
pub trait AuditSink: Send + Sync {
    /// Registra uma entrada. Erros de escrita são logados e engolidos:
    /// auditoria nunca derruba a execução.
    fn record(&self, entry: AuditEntry);

    /// Flusha e fecha o sink. Idempotente.
    fn close(&self);
}

/// Sink real: uma linha JSON por entrada em `audit.jsonl`.
pub struct JsonlAuditSink {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonlAuditSink {
    /// Abre (ou cria) o arquivo em modo append.
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, entry: AuditEntry) {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, operation = %entry.operation, "failed to serialize audit entry");
                return;
            }
        };
        line.push('\n');

        let mut guard = self.writer.lock().expect("audit writer lock poisoned");
        if let Some(writer) = guard.as_mut() {
            // Linha inteira + flush: nunca fica linha parcial no disco.
            if let Err(e) = writer.write_all(line.as_bytes()) {
                warn!(error = %e, "failed to append audit entry");
                return;
            }
            if let Err(e) = writer.flush() {
                warn!(error = %e, "failed to flush audit entry");
            }
        }
    }

    fn close(&self) {
        let mut guard = self.writer.lock().expect("audit writer lock poisoned");
        if let Some(mut writer) = guard.take() {
            let _ = writer.flush();
        }
        // Segundo close: guard já é None, nada a fazer.
    }
}

impl Drop for JsonlAuditSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sink de dry-run: aceita tudo e não escreve nada.
#[derive(Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn record(&self, _entry: AuditEntry) {}
    fn close(&self) {}
}

// ============================================================================
// TESTES
// ============================================================================
