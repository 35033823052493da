//! # Módulo de Orquestração
//!
//! O coração do thinktank: distribui o mesmo prompt para vários modelos
//! em paralelo, coleta um artefato por modelo e, quando faz sentido,
//! roda uma passada final de síntese sobre os artefatos coletados.
//!
//! ## Para todos entenderem:
//!
//! É como pedir a mesma pergunta para vários consultores ao mesmo
//! tempo. Cada consultor responde no seu ritmo (worker), um porteiro
//! controla quantos falam com cada empresa por vez (RateGate), e no
//! final um consultor sênior pode juntar todas as respostas numa só
//! (síntese).
//!
//! ## Garantias de concorrência:
//!
//! - Um worker por modelo; nenhum worker cria sub-workers.
//! - A ordem dos resultados no RunOutcome é a ordem da lista de
//!   modelos de entrada, nunca a ordem de término.
//! - O prompt é montado uma vez e compartilhado por referência
//!   (`Arc<str>`); cada worker é dono apenas do seu buffer de resposta.
//! - Cancelamento do contexto raiz alcança todos os workers no ponto
//!   de espera atual; o agregador espera no máximo um período de graça
//!   e marca o que sobrou como Cancelled.
//!
//! ## Máquina de estados de uma execução:
//!
//! ```text
//! Queued → Scheduled → InFlight ──> Succeeded
//!              ^           │ ├────> Failed
//!              │           │ └────> Cancelled
//!              └─ RateLimited <────┘ (rate limit, com tentativas sobrando)
//! ```

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};

use crate::audit::{AuditEntry, AuditSink};
use crate::config::RunConfig;
use crate::errors::{ErrorKind, ProviderError};
use crate::gatherer::FileRecord;
use crate::providers::ClientFactory;
use crate::rategate::{retry_with_backoff, BackoffConfig, GateError, RateGate, RetryError};
use crate::registry;

// ============================================================================
// CONSTANTES
// ============================================================================

/// Tentativas por modelo (1 chamada + 2 retries).
pub const MAX_ATTEMPTS: u32 = 3;

/// Quanto o agregador espera pelos workers depois de um cancelamento.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Cabeçalho fixo de cada arquivo de contexto dentro do prompt.
/// Formato estável: mudar isso muda o prompt de todas as execuções.
const FILE_HEADER_PREFIX: &str = "\n\n=== FILE: ";
const FILE_HEADER_SUFFIX: &str = " ===\n\n";

/// Delimitador fixo entre artefatos no input da síntese.
const SYNTHESIS_DELIMITER: &str = "\n\n---\n\n";

/// Instrução fixa da passada de síntese.
const SYNTHESIS_INSTRUCTIONS: &str = "Multiple models answered the same instructions. \
Synthesize the answers below into a single, coherent response. \
Prefer points of agreement; call out substantive disagreements explicitly.";

// ============================================================================
// MÁQUINA DE ESTADOS DE UMA EXECUÇÃO
// ============================================================================

/// Estado de uma execução por modelo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Queued,
    Scheduled,
    InFlight,
    Succeeded,
    Failed,
    RateLimited,
    Cancelled,
}

impl ExecutionState {
    /// Estados dos quais a execução não sai mais.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

/// Registro de uma execução por modelo, do enfileiramento ao estado
/// terminal.
#[derive(Debug, Clone)]
pub struct ModelExecution {
    pub model: String,
    pub provider: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub state: ExecutionState,
    /// Caminho do artefato, preenchido só em Succeeded.
    pub artifact: Option<PathBuf>,
    /// Categoria do erro, preenchida só em Failed.
    pub error: Option<ErrorKind>,
    /// Retries consumidos (0 = sucesso ou falha na primeira chamada).
    pub retries: u32,
}

impl ModelExecution {
    pub fn new(model: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            provider: provider.into(),
            started_at: None,
            finished_at: None,
            state: ExecutionState::Queued,
            artifact: None,
            error: None,
            retries: 0,
        }
    }

    /// Transiciona para `next`, validando a legalidade em builds de
    /// debug. As transições legais são as do diagrama do módulo.
    pub fn transition(&mut self, next: ExecutionState) {
        use ExecutionState::*;
        let legal = match (self.state, next) {
            (Queued, Scheduled) => true,
            (Scheduled, InFlight) => true,
            (InFlight, Succeeded) => true,
            (InFlight, RateLimited) => true,
            (RateLimited, Scheduled) => true,
            // Qualquer estado não-terminal pode falhar ou ser cancelado.
            (from, Failed) | (from, Cancelled) => !from.is_terminal(),
            _ => false,
        };
        debug_assert!(legal, "illegal transition {:?} -> {next:?}", self.state);
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
    }

    fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    fn succeed(&mut self, artifact: PathBuf) {
        self.artifact = Some(artifact);
        self.transition(ExecutionState::Succeeded);
    }

    fn fail(&mut self, kind: ErrorKind) {
        self.error = Some(kind);
        self.transition(ExecutionState::Failed);
    }

    fn cancel(&mut self) {
        self.transition(ExecutionState::Cancelled);
    }
}

// ============================================================================
// RESULTADO AGREGADO
// ============================================================================

/// Status agregado de todas as execuções.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateStatus {
    AllSucceeded,
    PartialSuccess,
    AllFailed,
    Cancelled,
}

/// Resultado final de uma orquestração.
#[derive(Debug)]
pub struct RunOutcome {
    /// Execuções na ordem da lista de modelos de entrada.
    pub executions: Vec<ModelExecution>,
    /// Artefatos escritos, na mesma ordem.
    pub artifacts: Vec<PathBuf>,
    /// Artefato de síntese, quando a passada rodou e deu certo.
    pub synthesis_artifact: Option<PathBuf>,
    pub status: AggregateStatus,
}

impl RunOutcome {
    /// Deriva a categoria de erro terminal para o exit code do CLI.
    ///
    /// `None` significa sucesso (exit 0). PartialSuccess domina as
    /// categorias individuais; AllFailed escolhe a mais severa entre
    /// as falhas.
    pub fn terminal_kind(&self, partial_success_ok: bool) -> Option<ErrorKind> {
        match self.status {
            AggregateStatus::AllSucceeded => None,
            AggregateStatus::Cancelled => Some(ErrorKind::Cancelled),
            AggregateStatus::PartialSuccess => {
                if partial_success_ok && self.synthesis_artifact.is_some() {
                    None
                } else {
                    Some(ErrorKind::PartialSuccess)
                }
            }
            AggregateStatus::AllFailed => Some(
                ErrorKind::most_severe(self.executions.iter().filter_map(|e| e.error))
                    .unwrap_or(ErrorKind::Unknown),
            ),
        }
    }
}

// ============================================================================
// MONTAGEM DO PROMPT
// ============================================================================

/// Monta o prompt compartilhado: instruções seguidas dos arquivos de
/// contexto, cada um sob um cabeçalho fixo, na ordem de coleta.
pub fn build_prompt(instructions: &str, files: &[FileRecord]) -> String {
    let mut prompt = String::with_capacity(
        instructions.len() + files.iter().map(|f| f.content.len() + 64).sum::<usize>(),
    );
    prompt.push_str(instructions);
    for file in files {
        prompt.push_str(FILE_HEADER_PREFIX);
        prompt.push_str(&file.path.to_string_lossy());
        prompt.push_str(FILE_HEADER_SUFFIX);
        prompt.push_str(&file.content);
    }
    prompt
}

/// Sanitiza um nome de modelo para virar nome de arquivo: separadores
/// de caminho e dois-pontos viram `-`.
pub fn sanitize_model_name(name: &str) -> String {
    name.replace(['/', '\\', ':'], "-")
}

/// Escreve um artefato com semântica create-or-truncate e o modo
/// configurado.
fn write_artifact(dir: &Path, file_name: &str, content: &str, perm: u32) -> io::Result<PathBuf> {
    let path = dir.join(file_name);
    fs::write(&path, content)?;
    apply_mode(&path, perm)?;
    Ok(path)
}

#[cfg(unix)]
fn apply_mode(path: &Path, perm: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(perm))
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _perm: u32) -> io::Result<()> {
    Ok(())
}

// ============================================================================
// ORQUESTRADOR
// ============================================================================

/// Contexto compartilhado entre os workers de uma execução.
struct WorkerCtx {
    config: Arc<RunConfig>,
    gate: Arc<RateGate>,
    factory: Arc<dyn ClientFactory>,
    audit: Arc<dyn AuditSink>,
    correlation_id: String,
    backoff: BackoffConfig,
    prompt: Arc<str>,
}

/// Orquestrador de uma invocação.
pub struct Orchestrator {
    config: Arc<RunConfig>,
    gate: Arc<RateGate>,
    factory: Arc<dyn ClientFactory>,
    audit: Arc<dyn AuditSink>,
    correlation_id: String,
    backoff: BackoffConfig,
}

impl Orchestrator {
    pub fn new(
        config: Arc<RunConfig>,
        gate: Arc<RateGate>,
        factory: Arc<dyn ClientFactory>,
        audit: Arc<dyn AuditSink>,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            config,
            gate,
            factory,
            audit,
            correlation_id: correlation_id.into(),
            backoff: BackoffConfig::default(),
        }
    }

    /// Substitui os parâmetros de backoff (testes usam delays curtos).
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Executa todos os modelos e, se couber, a síntese.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        models: &[String],
        instructions: &str,
        files: &[FileRecord],
    ) -> RunOutcome {
        let prompt: Arc<str> = Arc::from(build_prompt(instructions, files));
        info!(
            models = models.len(),
            prompt_bytes = prompt.len(),
            "starting fan-out"
        );

        let ctx = Arc::new(WorkerCtx {
            config: self.config.clone(),
            gate: self.gate.clone(),
            factory: self.factory.clone(),
            audit: self.audit.clone(),
            correlation_id: self.correlation_id.clone(),
            backoff: self.backoff,
            prompt,
        });

        // Canal de tamanho fixo = número de workers: nenhum send bloqueia.
        let (tx, mut rx) = mpsc::channel::<(usize, ModelExecution)>(models.len().max(1));

        for (index, model) in models.iter().enumerate() {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            let model = model.clone();
            tokio::spawn(
                async move {
                    let execution = run_model(&ctx, &cancel, &model).await;
                    // Capacidade reservada por worker; nunca bloqueia.
                    let _ = tx.send((index, execution)).await;
                }
                .instrument(tracing::Span::current()),
            );
        }
        drop(tx);

        // ------------------------------------------------------------------
        // Agregação: um único escritor do vetor de resultados, na ordem
        // dos índices de entrada.
        // ------------------------------------------------------------------
        let mut slots: Vec<Option<ModelExecution>> = (0..models.len()).map(|_| None).collect();
        let mut received = 0usize;

        while received < models.len() {
            if cancel.is_cancelled() {
                // Período de graça: workers têm um último prazo para
                // reportar o próprio cancelamento.
                match tokio::time::timeout(CANCEL_GRACE, rx.recv()).await {
                    Ok(Some((index, execution))) => {
                        slots[index] = Some(execution);
                        received += 1;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        warn!("grace period expired, marking stragglers as cancelled");
                        break;
                    }
                }
            } else {
                tokio::select! {
                    message = rx.recv() => match message {
                        Some((index, execution)) => {
                            slots[index] = Some(execution);
                            received += 1;
                        }
                        None => break,
                    },
                    _ = cancel.cancelled() => continue,
                }
            }
        }

        let executions: Vec<ModelExecution> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    // Worker não reportou dentro da graça.
                    let model = &models[index];
                    let provider = registry::get_model_info(model)
                        .map(|d| d.provider)
                        .unwrap_or("unknown");
                    let mut execution = ModelExecution::new(model.clone(), provider);
                    execution.cancel();
                    execution
                })
            })
            .collect();

        let artifacts: Vec<PathBuf> = executions
            .iter()
            .filter_map(|e| e.artifact.clone())
            .collect();

        let status = aggregate_status(&executions);

        let mut outcome = RunOutcome {
            executions,
            artifacts,
            synthesis_artifact: None,
            status,
        };

        // ------------------------------------------------------------------
        // Síntese
        // ------------------------------------------------------------------
        if self.should_synthesize(&outcome) && !cancel.is_cancelled() {
            match self.run_synthesis(cancel, &outcome).await {
                Ok(path) => outcome.synthesis_artifact = Some(path),
                Err(kind) => {
                    error!(kind = %kind, "synthesis failed");
                    // Falha da síntese rebaixa AllSucceeded, mas os
                    // artefatos por modelo permanecem válidos.
                    if outcome.status == AggregateStatus::AllSucceeded {
                        outcome.status = AggregateStatus::PartialSuccess;
                    }
                }
            }
        }

        self.audit.record(
            AuditEntry::new(
                "run_complete",
                match outcome.status {
                    AggregateStatus::AllSucceeded => crate::audit::AuditStatus::Success,
                    _ => crate::audit::AuditStatus::Failure,
                },
                &self.correlation_id,
            )
            .with_output("status", format!("{:?}", outcome.status))
            .with_output("artifacts", outcome.artifacts.len() as u64)
            .with_output("synthesis", outcome.synthesis_artifact.is_some()),
        );

        outcome
    }

    /// A passada de síntese deve rodar?
    ///
    /// Sim quando há modelo de síntese e pelo menos um sucesso, e
    /// (a política padrão pede vários sucessos, ou `--synthesis`
    /// forçou — inclusive com um único artefato).
    fn should_synthesize(&self, outcome: &RunOutcome) -> bool {
        if self.config.synthesis_model.is_none() {
            return false;
        }
        let successes = outcome
            .executions
            .iter()
            .filter(|e| e.state == ExecutionState::Succeeded)
            .count();
        successes >= 2 || (self.config.force_synthesis && successes >= 1)
    }

    /// Roda a síntese: concatena os artefatos bem-sucedidos na ordem de
    /// entrada e chama o modelo de síntese através do mesmo RateGate.
    async fn run_synthesis(
        &self,
        cancel: &CancellationToken,
        outcome: &RunOutcome,
    ) -> Result<PathBuf, ErrorKind> {
        let model_name = self
            .config
            .synthesis_model
            .as_deref()
            .expect("checked by should_synthesize");

        let descriptor = registry::get_model_info(model_name).map_err(|_| ErrorKind::Unknown)?;
        let client = self.factory.create(descriptor).map_err(|e| e.kind)?;

        // Input: artefatos na ordem da lista de modelos de entrada.
        let mut input = String::from(SYNTHESIS_INSTRUCTIONS);
        for execution in &outcome.executions {
            let Some(path) = &execution.artifact else {
                continue;
            };
            let content = fs::read_to_string(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "cannot read artifact for synthesis");
                ErrorKind::Unknown
            })?;
            input.push_str(SYNTHESIS_DELIMITER);
            input.push_str(&format!("## Answer from {}\n\n", execution.model));
            input.push_str(&content);
        }

        info!(model = %model_name, input_bytes = input.len(), "starting synthesis");

        let gate = self.gate.clone();
        let provider = descriptor.provider;
        let result = retry_with_backoff(
            cancel,
            self.backoff,
            MAX_ATTEMPTS,
            |e: &ProviderError| e.kind.is_retryable(),
            |_| {
                let gate = gate.clone();
                let client = &client;
                let input = input.as_str();
                async move {
                    match gate.acquire(cancel, provider).await {
                        Ok(()) => {}
                        Err(GateError::CircuitOpen { provider }) => {
                            return Err(ProviderError::new(
                                ErrorKind::RateLimit,
                                provider,
                                "circuit breaker open",
                            ))
                        }
                        Err(GateError::Cancelled) => {
                            return Err(ProviderError::new(
                                ErrorKind::Cancelled,
                                provider,
                                "cancelled while waiting for slot",
                            ))
                        }
                    }

                    let call = client.generate(cancel, input).await;
                    match &call {
                        Ok(_) => gate.record_success(provider).await,
                        Err(e) if e.kind.counts_toward_breaker() => {
                            gate.record_failure(provider).await
                        }
                        Err(_) => gate.record_neutral(provider).await,
                    }
                    gate.release(provider).await;
                    call
                }
            },
        )
        .await;

        let completion = match result {
            Ok(completion) => completion,
            Err(RetryError::Cancelled) => return Err(ErrorKind::Cancelled),
            Err(RetryError::Op(e)) => {
                self.audit.record(
                    AuditEntry::failure("synthesis", &self.correlation_id)
                        .with_input("model", model_name)
                        .with_error(e.kind, e.to_string()),
                );
                return Err(e.kind);
            }
        };

        let file_name = format!("{}-synthesis.md", sanitize_model_name(model_name));
        let path = write_artifact(
            &self.config.output_dir,
            &file_name,
            &completion.content,
            self.config.file_perm,
        )
        .map_err(|e| {
            error!(error = %e, "cannot write synthesis artifact");
            ErrorKind::Unknown
        })?;

        self.audit.record(
            AuditEntry::success("synthesis", &self.correlation_id)
                .with_input("model", model_name)
                .with_output("artifact", path.display().to_string()),
        );

        Ok(path)
    }
}

/// Deriva o status agregado das execuções.
fn aggregate_status(executions: &[ModelExecution]) -> AggregateStatus {
    let succeeded = executions
        .iter()
        .filter(|e| e.state == ExecutionState::Succeeded)
        .count();
    let cancelled = executions
        .iter()
        .any(|e| e.state == ExecutionState::Cancelled);

    if succeeded == executions.len() && !executions.is_empty() {
        AggregateStatus::AllSucceeded
    } else if succeeded > 0 {
        AggregateStatus::PartialSuccess
    } else if cancelled {
        AggregateStatus::Cancelled
    } else {
        AggregateStatus::AllFailed
    }
}

// ============================================================================
// WORKER POR MODELO
// ============================================================================

/// Executa um modelo até um estado terminal.
///
/// Protocolo com o gate, por tentativa:
/// acquire → generate → record_{success,failure,neutral} → release.
/// Todo caminho de saída devolve o permit exatamente uma vez.
async fn run_model(ctx: &WorkerCtx, cancel: &CancellationToken, model: &str) -> ModelExecution {
    let descriptor = match registry::get_model_info(model) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            // A resolução de modelos acontece antes da orquestração;
            // chegar aqui é bug de quem montou a lista.
            let mut execution = ModelExecution::new(model, "unknown");
            execution.fail(ErrorKind::Unknown);
            audit_execution(ctx, &execution, Some(e.to_string()));
            return execution;
        }
    };

    let mut execution = ModelExecution::new(model, descriptor.provider);

    let client = match ctx.factory.create(descriptor) {
        Ok(client) => client,
        Err(e) => {
            execution.fail(e.kind);
            audit_execution(ctx, &execution, Some(e.message));
            return execution;
        }
    };

    let provider = descriptor.provider;
    let mut attempt = 0u32;
    execution.transition(ExecutionState::Scheduled);

    loop {
        // --------------------------------------------------------------
        // Admissão
        // --------------------------------------------------------------
        match ctx.gate.acquire(cancel, provider).await {
            Ok(()) => {}
            Err(GateError::CircuitOpen { .. }) => {
                warn!(model = %model, provider = %provider, "circuit open, failing fast");
                execution.fail(ErrorKind::RateLimit);
                audit_execution(ctx, &execution, Some("circuit breaker open".to_string()));
                return execution;
            }
            Err(GateError::Cancelled) => {
                execution.cancel();
                audit_execution(ctx, &execution, None);
                return execution;
            }
        }

        if execution.state == ExecutionState::Scheduled {
            execution.transition(ExecutionState::InFlight);
        }
        execution.mark_started();
        attempt += 1;

        // --------------------------------------------------------------
        // Chamada ao provider
        // --------------------------------------------------------------
        match client.generate(cancel, &ctx.prompt).await {
            Ok(completion) => {
                let file_name = format!("{}.md", sanitize_model_name(model));
                match write_artifact(
                    &ctx.config.output_dir,
                    &file_name,
                    &completion.content,
                    ctx.config.file_perm,
                ) {
                    Ok(path) => {
                        ctx.gate.record_success(provider).await;
                        ctx.gate.release(provider).await;
                        info!(model = %model, artifact = %path.display(), "model succeeded");
                        execution.succeed(path);
                        let mut entry = execution_entry(ctx, &execution, None)
                            .with_output("finish_reason", completion.finish_reason.clone());
                        if let Some(usage) = &completion.usage {
                            entry = entry
                                .with_output("prompt_tokens", usage.prompt_tokens)
                                .with_output("completion_tokens", usage.completion_tokens);
                        }
                        ctx.audit.record(entry);
                        return execution;
                    }
                    Err(e) => {
                        // Falha nossa de filesystem, não do provider.
                        ctx.gate.record_neutral(provider).await;
                        ctx.gate.release(provider).await;
                        error!(model = %model, error = %e, "cannot write artifact");
                        execution.fail(ErrorKind::Unknown);
                        audit_execution(ctx, &execution, Some(e.to_string()));
                        return execution;
                    }
                }
            }

            Err(e) if e.kind == ErrorKind::Cancelled => {
                ctx.gate.record_neutral(provider).await;
                ctx.gate.release(provider).await;
                execution.cancel();
                audit_execution(ctx, &execution, None);
                return execution;
            }

            Err(e) if e.kind.is_retryable() && attempt < MAX_ATTEMPTS => {
                // Cada resultado de chamada atualiza o breaker por
                // conta própria; um retry que acerta depois registra
                // uma falha e um sucesso.
                ctx.gate.record_failure(provider).await;
                ctx.gate.release(provider).await;
                execution.retries += 1;

                // Rate limit tem estado próprio; 5xx/rede re-tentam
                // sem sair de InFlight.
                if e.kind == ErrorKind::RateLimit {
                    execution.transition(ExecutionState::RateLimited);
                }

                // O Retry-After do provider é um piso para a espera.
                let mut delay = ctx.backoff.delay_for(attempt - 1);
                if let Some(hint) = e.retry_after {
                    delay = delay.max(hint);
                }
                warn!(
                    model = %model,
                    kind = %e.kind,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backoff"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        execution.cancel();
                        audit_execution(ctx, &execution, None);
                        return execution;
                    }
                }

                if execution.state == ExecutionState::RateLimited {
                    execution.transition(ExecutionState::Scheduled);
                }
                continue;
            }

            Err(e) => {
                if e.kind.counts_toward_breaker() {
                    ctx.gate.record_failure(provider).await;
                } else {
                    ctx.gate.record_neutral(provider).await;
                }
                ctx.gate.release(provider).await;
                error!(model = %model, kind = %e.kind, "model failed");
                execution.fail(e.kind);
                audit_execution(ctx, &execution, Some(e.message));
                return execution;
            }
        }
    }
}

/// Monta a entrada de auditoria de uma execução terminal.
fn execution_entry(
    ctx: &WorkerCtx,
    execution: &ModelExecution,
    detail: Option<String>,
) -> AuditEntry {
    let mut entry = match execution.state {
        ExecutionState::Succeeded => AuditEntry::success("generate", &ctx.correlation_id),
        _ => AuditEntry::failure("generate", &ctx.correlation_id),
    }
    .with_input("model", execution.model.clone())
    .with_input("provider", execution.provider.clone())
    .with_output("retries", execution.retries as u64)
    .with_output("state", format!("{:?}", execution.state));

    if let (Some(started), Some(finished)) = (execution.started_at, execution.finished_at) {
        let duration_ms = (finished - started).num_milliseconds().max(0) as u64;
        entry = entry.with_output("duration_ms", duration_ms);
    }
    if let Some(path) = &execution.artifact {
        entry = entry.with_output("artifact", path.display().to_string());
    }
    if let Some(kind) = execution.error {
        entry = entry.with_error(kind, detail.unwrap_or_else(|| kind.to_string()));
    } else if execution.state == ExecutionState::Cancelled {
        entry = entry.with_error(ErrorKind::Cancelled, "execution cancelled");
    }

    entry
}

/// Registra a entrada de auditoria de uma execução terminal.
fn audit_execution(ctx: &WorkerCtx, execution: &ModelExecution, detail: Option<String>) {
    ctx.audit.record(execution_entry(ctx, execution, detail));
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::NoopAuditSink;
    use crate::providers::testing::{Scripted, ScriptedFactory};
    use crate::rategate::ProviderLimits;

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(5),
            cap: Duration::from_millis(50),
            jitter: 0.0,
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        config: Arc<RunConfig>,
        gate: Arc<RateGate>,
        factory: Arc<ScriptedFactory>,
    }

    fn harness(synthesis_model: Option<&str>, force_synthesis: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(RunConfig {
            instructions: "instructions.md".into(),
            targets: vec!["src".into()],
            output_dir: dir.path().to_path_buf(),
            synthesis_model: synthesis_model.map(String::from),
            force_synthesis,
            ..Default::default()
        });
        Harness {
            _dir: dir,
            config,
            gate: Arc::new(RateGate::new(ProviderLimits::default())),
            factory: Arc::new(ScriptedFactory::new()),
        }
    }

    fn orchestrator(h: &Harness) -> Orchestrator {
        Orchestrator::new(
            h.config.clone(),
            h.gate.clone(),
            h.factory.clone(),
            Arc::new(NoopAuditSink),
            "corr-test",
        )
        .with_backoff(fast_backoff())
    }

    fn models(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_happy_path_two_models_with_synthesis() {
        let h = harness(Some("gpt-4o"), false);
        h.factory
            .script("gpt-4o", vec![Scripted::Reply("answer A".into()), Scripted::Reply("combined".into())]);
        h.factory
            .script("claude-sonnet-4", vec![Scripted::Reply("answer B".into())]);

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(
                &cancel,
                &models(&["gpt-4o", "claude-sonnet-4"]),
                "Summarize.",
                &[],
            )
            .await;

        assert_eq!(outcome.status, AggregateStatus::AllSucceeded);
        assert_eq!(outcome.artifacts.len(), 2);
        assert!(outcome.artifacts[0].ends_with("gpt-4o.md"));
        assert!(outcome.artifacts[1].ends_with("claude-sonnet-4.md"));
        assert_eq!(
            fs::read_to_string(&outcome.artifacts[0]).unwrap(),
            "answer A"
        );

        // Dois sucessos: síntese roda por política padrão.
        let synthesis = outcome.synthesis_artifact.as_ref().unwrap();
        assert!(synthesis.ends_with("gpt-4o-synthesis.md"));
        assert_eq!(fs::read_to_string(synthesis).unwrap(), "combined");

        assert_eq!(outcome.terminal_kind(false), None);
    }

    #[tokio::test]
    async fn test_results_keep_input_order() {
        let h = harness(None, false);
        // Ordem invertida em relação ao catálogo, de propósito.
        let list = models(&["claude-sonnet-4", "gpt-4o"]);

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h).run(&cancel, &list, "go", &[]).await;

        let names: Vec<&str> = outcome.executions.iter().map(|e| e.model.as_str()).collect();
        assert_eq!(names, vec!["claude-sonnet-4", "gpt-4o"]);
    }

    #[tokio::test]
    async fn test_rate_limited_model_recovers_with_retries() {
        let h = harness(None, false);
        h.factory.script(
            "gpt-4o",
            vec![
                Scripted::Fail(ErrorKind::RateLimit),
                Scripted::Fail(ErrorKind::RateLimit),
                Scripted::Reply("late but fine".into()),
            ],
        );
        h.factory
            .script("claude-sonnet-4", vec![Scripted::Reply("first try".into())]);

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o", "claude-sonnet-4"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::AllSucceeded);
        let limited = &outcome.executions[0];
        assert_eq!(limited.state, ExecutionState::Succeeded);
        assert_eq!(limited.retries, 2);

        let clean = &outcome.executions[1];
        assert_eq!(clean.retries, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_is_a_floor_for_backoff() {
        let h = harness(None, false);
        h.factory.script(
            "gpt-4o",
            vec![
                Scripted::RateLimitedFor(Duration::from_secs(60)),
                Scripted::Reply("after the hint".into()),
            ],
        );

        let cancel = CancellationToken::new();
        let start = tokio::time::Instant::now();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::AllSucceeded);
        assert_eq!(outcome.executions[0].retries, 1);
        // O backoff base é de milissegundos; a espera real seguiu o
        // Retry-After de 60s.
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_with_rate_limit() {
        let h = harness(None, false);
        h.factory.script(
            "gpt-4o",
            vec![Scripted::Fail(ErrorKind::RateLimit); MAX_ATTEMPTS as usize],
        );

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::AllFailed);
        assert_eq!(outcome.executions[0].error, Some(ErrorKind::RateLimit));
        assert_eq!(outcome.executions[0].retries, MAX_ATTEMPTS - 1);
        assert_eq!(outcome.terminal_kind(false), Some(ErrorKind::RateLimit));
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let h = harness(None, false);
        h.factory
            .script("gpt-4o", vec![Scripted::Fail(ErrorKind::ContentFiltered)]);

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o"]), "go", &[])
            .await;

        assert_eq!(outcome.executions[0].state, ExecutionState::Failed);
        assert_eq!(outcome.executions[0].retries, 0);
        assert_eq!(h.factory.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_model_but_spares_other_provider() {
        let h = harness(None, false);

        // Breaker do openai já aberto antes da execução.
        for _ in 0..crate::rategate::FAILURE_THRESHOLD {
            h.gate.record_failure("openai").await;
        }
        h.factory
            .script("claude-sonnet-4", vec![Scripted::Reply("unaffected".into())]);

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o", "claude-sonnet-4"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::PartialSuccess);
        assert_eq!(outcome.executions[0].state, ExecutionState::Failed);
        assert_eq!(outcome.executions[1].state, ExecutionState::Succeeded);
        assert_eq!(outcome.terminal_kind(false), Some(ErrorKind::PartialSuccess));
    }

    #[tokio::test]
    async fn test_cancellation_reaches_in_flight_workers() {
        let h = harness(None, false);
        h.factory
            .script("gpt-4o", vec![Scripted::BlockUntilCancelled]);
        h.factory
            .script("claude-sonnet-4", vec![Scripted::BlockUntilCancelled]);

        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel2.cancel();
        });

        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o", "claude-sonnet-4"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::Cancelled);
        assert!(outcome
            .executions
            .iter()
            .all(|e| e.state == ExecutionState::Cancelled));
        assert!(outcome.artifacts.is_empty());
        assert_eq!(outcome.terminal_kind(false), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_forced_synthesis_with_single_artifact() {
        let h = harness(Some("gpt-4o"), true);
        h.factory.script(
            "gpt-4o",
            vec![
                Scripted::Reply("only answer".into()),
                Scripted::Reply("synthesized from one".into()),
            ],
        );

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::AllSucceeded);
        assert!(outcome.synthesis_artifact.is_some());
    }

    #[tokio::test]
    async fn test_synthesis_skipped_with_single_success_by_default() {
        let h = harness(Some("gpt-4o"), false);
        h.factory
            .script("gpt-4o", vec![Scripted::Reply("alone".into())]);

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o"]), "go", &[])
            .await;

        assert!(outcome.synthesis_artifact.is_none());
        assert_eq!(outcome.status, AggregateStatus::AllSucceeded);
    }

    #[tokio::test]
    async fn test_synthesis_failure_downgrades_status() {
        let h = harness(Some("gemini-2.5-flash"), false);
        h.factory
            .script("gpt-4o", vec![Scripted::Reply("A".into())]);
        h.factory
            .script("claude-sonnet-4", vec![Scripted::Reply("B".into())]);
        h.factory.script(
            "gemini-2.5-flash",
            vec![Scripted::Fail(ErrorKind::Server); MAX_ATTEMPTS as usize],
        );

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o", "claude-sonnet-4"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::PartialSuccess);
        assert!(outcome.synthesis_artifact.is_none());
        // Os artefatos por modelo continuam no lugar.
        assert_eq!(outcome.artifacts.len(), 2);
        assert!(outcome.artifacts.iter().all(|p| p.exists()));
    }

    #[tokio::test]
    async fn test_partial_success_ok_with_synthesis_is_success() {
        let h = harness(Some("gemini-2.5-flash"), true);
        h.factory
            .script("gpt-4o", vec![Scripted::Fail(ErrorKind::Auth)]);
        h.factory
            .script("claude-sonnet-4", vec![Scripted::Reply("B".into())]);
        h.factory
            .script("gemini-2.5-flash", vec![Scripted::Reply("synth".into())]);

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o", "claude-sonnet-4"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::PartialSuccess);
        assert!(outcome.synthesis_artifact.is_some());
        assert_eq!(outcome.terminal_kind(true), None);
        assert_eq!(outcome.terminal_kind(false), Some(ErrorKind::PartialSuccess));
    }

    #[tokio::test]
    async fn test_all_failed_picks_most_severe_kind() {
        let h = harness(None, false);
        h.factory
            .script("gpt-4o", vec![Scripted::Fail(ErrorKind::InputLimit)]);
        h.factory
            .script("claude-sonnet-4", vec![Scripted::Fail(ErrorKind::Auth)]);

        let cancel = CancellationToken::new();
        let outcome = orchestrator(&h)
            .run(&cancel, &models(&["gpt-4o", "claude-sonnet-4"]), "go", &[])
            .await;

        assert_eq!(outcome.status, AggregateStatus::AllFailed);
        // Auth vem antes de InputLimit na ordem da taxonomia.
        assert_eq!(outcome.terminal_kind(false), Some(ErrorKind::Auth));
    }

    #[test]
    fn test_prompt_layout_is_deterministic() {
        let files = vec![
            FileRecord {
                path: "a.go".into(),
                content: "package a".into(),
                char_count: 9,
                line_count: 1,
            },
            FileRecord {
                path: "b.go".into(),
                content: "package b".into(),
                char_count: 9,
                line_count: 1,
            },
        ];

        let prompt = build_prompt("Summarize.", &files);
        assert!(prompt.starts_with("Summarize."));
        let pos_a = prompt.find("=== FILE: a.go ===").unwrap();
        let pos_b = prompt.find("=== FILE: b.go ===").unwrap();
        assert!(pos_a < pos_b);
        assert_eq!(prompt, build_prompt("Summarize.", &files));
    }

    #[test]
    fn test_sanitize_model_name() {
        assert_eq!(sanitize_model_name("openai/gpt-4o"), "openai-gpt-4o");
        assert_eq!(sanitize_model_name("org:model"), "org-model");
        assert_eq!(sanitize_model_name("a\\b/c:d"), "a-b-c-d");
    }

    #[test]
    fn test_state_machine_accepts_legal_paths() {
        let mut e = ModelExecution::new("m", "p");
        e.transition(ExecutionState::Scheduled);
        e.transition(ExecutionState::InFlight);
        e.transition(ExecutionState::RateLimited);
        e.transition(ExecutionState::Scheduled);
        e.transition(ExecutionState::InFlight);
        e.transition(ExecutionState::Succeeded);
        assert!(e.state.is_terminal());
        assert!(e.finished_at.is_some());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "illegal transition")]
    fn test_state_machine_rejects_illegal_transition() {
        let mut e = ModelExecution::new("m", "p");
        e.transition(ExecutionState::Succeeded); // Queued -> Succeeded é ilegal
    }

    #[test]
    fn test_aggregate_status_rules() {
        let mk = |state: ExecutionState| {
            let mut e = ModelExecution::new("m", "p");
            e.state = state;
            e
        };

        assert_eq!(
            aggregate_status(&[mk(ExecutionState::Succeeded), mk(ExecutionState::Succeeded)]),
            AggregateStatus::AllSucceeded
        );
        assert_eq!(
            aggregate_status(&[mk(ExecutionState::Succeeded), mk(ExecutionState::Failed)]),
            AggregateStatus::PartialSuccess
        );
        assert_eq!(
            aggregate_status(&[mk(ExecutionState::Failed), mk(ExecutionState::Failed)]),
            AggregateStatus::AllFailed
        );
        assert_eq!(
            aggregate_status(&[mk(ExecutionState::Failed), mk(ExecutionState::Cancelled)]),
            AggregateStatus::Cancelled
        );
        // Sucesso vence cancelamento no agregado.
        assert_eq!(
            aggregate_status(&[mk(ExecutionState::Succeeded), mk(ExecutionState::Cancelled)]),
            AggregateStatus::PartialSuccess
        );
    }
}
