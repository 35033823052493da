//! # thinktank - Orquestrador de Modelos LLM
//!
//! Ponto de entrada do CLI. Distribui um arquivo de instruções mais um
//! conjunto de arquivos de projeto para vários modelos LLM em paralelo
//! e coleta um artefato por modelo num diretório de execução único.
//!
//! ## O que este arquivo faz?
//!
//! 1. **Parseia os argumentos** da linha de comando com `clap`
//! 2. **Monta e valida** a RunConfig imutável da invocação
//! 3. **Resolve o conjunto de modelos** (flags, credenciais, tokens)
//! 4. **Prepara o diretório de saída**, logging e audit log
//! 5. **Instala handlers de sinal** (SIGINT/SIGTERM) e o timeout global
//! 6. **Entrega ao orquestrador** e converte o resultado em exit code
//!
//! ## Exemplo de uso:
//!
//! ```bash
//! # Fan-out automático para todos os modelos compatíveis
//! thinktank instructions.md ./src
//!
//! # Dry-run: só conta tokens e lista a seleção
//! thinktank instructions.md ./src --dry-run
//!
//! # Modelos explícitos, síntese forçada
//! thinktank instructions.md ./src --model gpt-4o --model claude-sonnet-4 --synthesis
//! ```

mod audit;
mod config;
mod errors;
mod gatherer;
mod logging;
mod orchestrator;
mod outdir;
mod providers;
mod rategate;
mod registry;
mod tokens;

use clap::Parser;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use uuid::Uuid;

use audit::{AuditEntry, AuditSink, JsonlAuditSink, NoopAuditSink};
use config::RunConfig;
use errors::{CliError, ErrorKind};
use orchestrator::Orchestrator;
use providers::HttpClientFactory;
use rategate::{ProviderLimits, RateGate};
use tokens::{ModelCompatibility, TokenCountRequest, TokenCounter};

// ============================================================================
// DEFINIÇÃO DA CLI
// ============================================================================

/// Orquestrador CLI: uma instrução, vários modelos, um artefato por modelo.
#[derive(Debug, Parser)]
#[command(name = "thinktank")]
#[command(about = "Fan a single instruction out to several LLMs in parallel", long_about = None)]
struct Cli {
    /// Arquivo com as instruções para os modelos.
    instructions: PathBuf,

    /// Caminhos alvo (arquivos ou diretórios) enviados como contexto.
    #[arg(required = true)]
    targets: Vec<PathBuf>,

    /// Conta tokens e lista a seleção sem chamar nenhum provider.
    #[arg(long)]
    dry_run: bool,

    /// Logs de debug em stderr.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Alias de --verbose.
    #[arg(long)]
    debug: bool,

    /// Suprime stdout não-essencial.
    #[arg(long, short = 'q')]
    quiet: bool,

    /// Força a síntese mesmo com um único modelo selecionado.
    #[arg(long)]
    synthesis: bool,

    /// Logs estruturados em stderr ao invés do arquivo da execução.
    #[arg(long)]
    json_logs: bool,

    /// Desliga indicadores de progresso.
    #[arg(long)]
    no_progress: bool,

    /// Sobrescreve a seleção automática de modelos (repetível).
    #[arg(long = "model")]
    models: Vec<String>,

    /// Usa este diretório ao invés de gerar um nome de execução.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Margem de segurança percentual sobre a janela de contexto [0..50].
    #[arg(long, default_value_t = config::DEFAULT_SAFETY_MARGIN)]
    token_safety_margin: u8,

    /// Timeout global da execução (ex: "90s", "10m").
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10m")]
    timeout: Duration,

    /// Com síntese bem-sucedida, trata sucesso parcial como sucesso.
    #[arg(long)]
    partial_success_ok: bool,

    /// Máximo de requisições simultâneas por provider.
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Teto de requisições por minuto por provider (0 = padrão do modelo).
    #[arg(long, default_value_t = 0)]
    provider_rpm: u32,
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let code = run(cli).await;
    ExitCode::from(code as u8)
}

/// Fluxo completo de uma invocação. Retorna o exit code.
async fn run(cli: Cli) -> i32 {
    let correlation_id = Uuid::new_v4().to_string();

    // ------------------------------------------------------------------
    // Diretório de saída. Em dry-run nada é criado em disco.
    // ------------------------------------------------------------------
    let output_dir = if cli.dry_run {
        PathBuf::new()
    } else {
        match prepare_output_dir(&cli) {
            Ok(dir) => dir,
            Err(e) => return fail_cli(e),
        }
    };

    // ------------------------------------------------------------------
    // Configuração imutável da execução.
    // ------------------------------------------------------------------
    let level = if cli.verbose || cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let config = Arc::new(RunConfig {
        instructions: cli.instructions.clone(),
        targets: cli.targets.clone(),
        models: cli.models.clone(),
        synthesis_model: None, // resolvido após a seleção
        output_dir: output_dir.clone(),
        dry_run: cli.dry_run,
        force_synthesis: cli.synthesis,
        log_level: level,
        quiet: cli.quiet,
        no_progress: cli.no_progress,
        json_logs: cli.json_logs,
        timeout: cli.timeout,
        max_concurrent_per_provider: cli.max_concurrent,
        provider_rpm: cli.provider_rpm,
        token_safety_margin: cli.token_safety_margin,
        partial_success_ok: cli.partial_success_ok,
        ..Default::default()
    });
    if let Err(e) = config.validate() {
        return fail_cli(e);
    }

    // ------------------------------------------------------------------
    // Logging: stderr em dry-run/verbose/json-logs, senão arquivo.
    // ------------------------------------------------------------------
    let logger = logging::init_logging(
        logging::LoggingOptions {
            level: config.log_level,
            console: config.dry_run || config.json_logs || config.log_level == Level::DEBUG,
            console_json: config.json_logs,
        },
        &output_dir,
    );
    let span = logging::run_span(&correlation_id);
    let _span_guard = span.enter();
    info!(correlation_id = %correlation_id, "thinktank starting");

    if let Some(base) = output_dir.parent() {
        if let Ok(dir_stats) = outdir::stats(base) {
            tracing::debug!(
                own_dirs = dir_stats.own_dirs,
                total_entries = dir_stats.total_entries,
                "run directories in base path"
            );
        }
    }

    // ------------------------------------------------------------------
    // Input: instruções + arquivos de contexto.
    // ------------------------------------------------------------------
    let instructions = match std::fs::read_to_string(&config.instructions) {
        Ok(text) => text,
        Err(e) => {
            logger.close();
            return fail_cli(CliError::Io(e));
        }
    };
    let files = match gatherer::gather_context(&config.targets) {
        Ok(files) => files,
        Err(e) => {
            logger.close();
            eprintln!("thinktank: {e:#}");
            return 1;
        }
    };
    let file_stats = gatherer::stats(&files);
    info!(
        files = file_stats.file_count,
        chars = file_stats.total_chars,
        "context gathered"
    );

    // ------------------------------------------------------------------
    // Seleção de modelos: credenciais presentes + janela compatível.
    // ------------------------------------------------------------------
    let providers = registry::available_providers();
    if providers.is_empty() {
        logger.close();
        return fail_cli(CliError::MissingCredentials(
            "set at least one provider credential (e.g. OPENROUTER_API_KEY)".to_string(),
        ));
    }

    let cancel = CancellationToken::new();
    let counter = TokenCounter::new();
    let request = TokenCountRequest {
        instructions: &instructions,
        files: &files,
        safety_margin_percent: config.token_safety_margin,
    };
    let compatibility = match counter.compatible_models(&cancel, &request, &providers) {
        Ok(results) => results,
        Err(_) => return ErrorKind::Cancelled.exit_code(),
    };

    let selected = match resolve_models(&config.models, &compatibility) {
        Ok(selected) => selected,
        Err(e) => {
            logger.close();
            return fail_cli(e);
        }
    };
    if selected.is_empty() {
        logger.close();
        eprintln!(
            "thinktank: input does not fit any available model (providers: {})",
            providers.join(", ")
        );
        return ErrorKind::InputLimit.exit_code();
    }

    let synthesis_model = resolve_synthesis_model(&selected, cli.synthesis);
    let config = Arc::new(RunConfig {
        synthesis_model: synthesis_model.clone(),
        ..(*config).clone()
    });

    // ------------------------------------------------------------------
    // Dry-run: relatório em stdout, audit no-op, nenhuma chamada.
    // ------------------------------------------------------------------
    if config.dry_run {
        print_dry_run(&config, &compatibility, &selected, &file_stats);
        let sink = NoopAuditSink;
        sink.record(model_selection_entry(&correlation_id, &selected, &compatibility));
        sink.close();
        logger.close();
        return 0;
    }

    // ------------------------------------------------------------------
    // Sinks reais + entrada de auditoria da seleção.
    // ------------------------------------------------------------------
    let audit_sink: Arc<dyn AuditSink> =
        match JsonlAuditSink::create(&output_dir.join(audit::AUDIT_FILE_NAME)) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                logger.close();
                return fail_cli(CliError::Io(e));
            }
        };
    audit_sink.record(model_selection_entry(&correlation_id, &selected, &compatibility));

    // ------------------------------------------------------------------
    // Sinais e timeout cancelam o contexto raiz.
    // ------------------------------------------------------------------
    let watcher = spawn_cancellation_watcher(cancel.clone(), config.timeout);

    // ------------------------------------------------------------------
    // Orquestração.
    // ------------------------------------------------------------------
    let gate = Arc::new(build_rate_gate(&config, &selected));
    let factory = Arc::new(HttpClientFactory::new(config.timeout));
    let orchestrator = Orchestrator::new(
        config.clone(),
        gate.clone(),
        factory,
        audit_sink.clone(),
        correlation_id.clone(),
    );

    if !config.quiet && !config.no_progress {
        println!(
            "thinktank: querying {} model(s), output in {}",
            selected.len(),
            output_dir.display()
        );
    }

    let outcome = orchestrator
        .run(&cancel, &selected, &instructions, &files)
        .await;

    // Diagnóstico do gate por provider em post-mortems de runs com
    // throttling.
    for provider in providers_of(&selected) {
        let status = gate.status(provider).await;
        tracing::debug!(
            provider,
            state = ?status.state,
            failures = status.consecutive_failures,
            rpm_cap = status.rpm_cap,
            available = status.available_now,
            "gate status after run"
        );
    }

    // ------------------------------------------------------------------
    // Relatório final e exit code.
    // ------------------------------------------------------------------
    if !config.quiet {
        print_outcome(&outcome, &output_dir);
    }

    let terminal = outcome.terminal_kind(config.partial_success_ok);
    if let Some(kind) = terminal {
        eprintln!("thinktank: run finished with {kind} (exit {})", kind.exit_code());
    }

    watcher.abort();
    audit_sink.close();
    logger.close();

    terminal.map(|k| k.exit_code()).unwrap_or(0)
}

// ============================================================================
// RESOLUÇÃO DE MODELOS E SÍNTESE
// ============================================================================

/// Decide a lista final de modelos.
///
/// `--model` sobrescreve a seleção automática, mas cada nome precisa
/// existir no catálogo. Sem flags, entram todos os modelos compatíveis
/// (ordem do catálogo).
fn resolve_models(
    explicit: &[String],
    compatibility: &[ModelCompatibility],
) -> Result<Vec<String>, CliError> {
    if explicit.is_empty() {
        return Ok(compatibility
            .iter()
            .filter(|c| c.result.is_compatible)
            .map(|c| c.model.to_string())
            .collect());
    }

    for name in explicit {
        registry::get_model_info(name)
            .map_err(|e| CliError::InvalidConfig(e.to_string()))?;
    }
    Ok(explicit.to_vec())
}

/// Política do modelo de síntese: o primeiro modelo selecionado (ordem
/// do catálogo) sintetiza. Só há modelo de síntese quando a passada
/// pode rodar: vários modelos, ou `--synthesis` explícito.
fn resolve_synthesis_model(selected: &[String], force: bool) -> Option<String> {
    if selected.len() >= 2 || (force && !selected.is_empty()) {
        Some(selected[0].clone())
    } else {
        None
    }
}

/// Providers distintos dos modelos selecionados, na ordem de aparição.
fn providers_of(selected: &[String]) -> Vec<&'static str> {
    let mut providers = Vec::new();
    for name in selected {
        if let Ok(descriptor) = registry::get_model_info(name) {
            if !providers.contains(&descriptor.provider) {
                providers.push(descriptor.provider);
            }
        }
    }
    providers
}

/// Limites do gate por provider: concorrência da config e RPM da config
/// ou, quando zero, o menor RPM padrão entre os modelos selecionados do
/// provider (conservador).
fn build_rate_gate(config: &RunConfig, selected: &[String]) -> RateGate {
    let mut per_provider: HashMap<String, ProviderLimits> = HashMap::new();

    for name in selected {
        let Ok(descriptor) = registry::get_model_info(name) else {
            continue;
        };
        let rpm = if config.provider_rpm > 0 {
            config.provider_rpm
        } else {
            descriptor.default_rpm
        };
        per_provider
            .entry(descriptor.provider.to_string())
            .and_modify(|limits| limits.rpm = limits.rpm.min(rpm))
            .or_insert(ProviderLimits {
                max_concurrent: config.max_concurrent_per_provider,
                rpm,
            });
    }

    RateGate::with_limits(
        ProviderLimits {
            max_concurrent: config.max_concurrent_per_provider,
            rpm: config.provider_rpm,
        },
        per_provider,
    )
}

// ============================================================================
// SINAIS E TIMEOUT
// ============================================================================

/// Cancela o token raiz no primeiro SIGINT/SIGTERM ou no timeout global.
fn spawn_cancellation_watcher(
    cancel: CancellationToken,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                error!("interrupt received, cancelling run");
            }
            _ = terminate => {
                error!("termination signal received, cancelling run");
            }
            _ = tokio::time::sleep(timeout) => {
                error!(timeout_secs = timeout.as_secs(), "global timeout reached, cancelling run");
            }
        }
        cancel.cancel();
    })
}

// ============================================================================
// SAÍDA PARA O USUÁRIO
// ============================================================================

/// Falha pré-orquestração: uma linha legível em stderr + exit code.
fn fail_cli(e: CliError) -> i32 {
    eprintln!("thinktank: {e}");
    e.exit_code()
}

/// Entrada de auditoria da seleção de modelos.
fn model_selection_entry(
    correlation_id: &str,
    selected: &[String],
    compatibility: &[ModelCompatibility],
) -> AuditEntry {
    let mut counts = BTreeMap::new();
    for c in compatibility {
        counts.insert(c.model.to_string(), c.result.token_count);
    }
    AuditEntry::success("model_selection", correlation_id)
        .with_input("candidates", compatibility.len() as u64)
        .with_output("models", serde_json::json!(selected))
        .with_token_counts(counts)
}

/// Relatório do dry-run em stdout.
fn print_dry_run(
    config: &RunConfig,
    compatibility: &[ModelCompatibility],
    selected: &[String],
    stats: &gatherer::GatherStats,
) {
    println!("dry-run: no providers will be called");
    println!("instructions: {}", config.instructions.display());
    for target in &config.targets {
        println!("target: {}", target.display());
    }
    println!(
        "context: {} file(s), {} chars, {} lines",
        stats.file_count, stats.total_chars, stats.total_lines
    );
    for c in compatibility {
        let marker = if selected.iter().any(|s| s.as_str() == c.model) {
            "selected"
        } else if c.result.is_compatible {
            "compatible"
        } else {
            "too small"
        };
        println!(
            "model {:<20} provider {:<10} window {:>9} tokens {:>9} via {:<12} [{}]",
            c.model, c.provider, c.context_window, c.result.token_count, c.result.tokenizer, marker
        );
    }
    if let Some(model) = &config.synthesis_model {
        println!("synthesis model: {model}");
    }
}

/// Resumo pós-execução em stdout.
fn print_outcome(outcome: &orchestrator::RunOutcome, output_dir: &std::path::Path) {
    for execution in &outcome.executions {
        match execution.state {
            orchestrator::ExecutionState::Succeeded => {
                println!(
                    "  ok   {} ({} retries)",
                    execution.model, execution.retries
                );
            }
            orchestrator::ExecutionState::Cancelled => {
                println!("  --   {} cancelled", execution.model);
            }
            _ => {
                println!(
                    "  FAIL {} [{}]",
                    execution.model,
                    execution
                        .error
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
        }
    }
    if let Some(path) = &outcome.synthesis_artifact {
        println!("  ok   synthesis -> {}", path.display());
    }
    println!("output directory: {}", output_dir.display());
}

/// Resolve o diretório de saída: o override do usuário (pode já existir
/// e conter arquivos; artefatos usam create-or-truncate) ou um nome de
/// execução gerado no diretório corrente.
fn prepare_output_dir(cli: &Cli) -> Result<PathBuf, CliError> {
    match &cli.output_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            Ok(dir.clone())
        }
        None => {
            let manager = outdir::OutputDirManager::new();
            let base = std::env::current_dir()?;
            Ok(manager.create_output_directory(&base, config::DEFAULT_DIR_PERM)?)
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::TokenCountResult;

    fn compat(model: &'static str, provider: &'static str, compatible: bool) -> ModelCompatibility {
        ModelCompatibility {
            model,
            provider,
            context_window: 100_000,
            result: TokenCountResult {
                token_count: 500,
                is_compatible: compatible,
                is_accurate: false,
                tokenizer: "estimation".to_string(),
            },
        }
    }

    #[test]
    fn test_resolve_models_auto_selects_compatible() {
        let compatibility = vec![
            compat("gpt-4o", "openai", true),
            compat("claude-sonnet-4", "anthropic", false),
            compat("gemini-2.5-pro", "gemini", true),
        ];
        let selected = resolve_models(&[], &compatibility).unwrap();
        assert_eq!(selected, vec!["gpt-4o", "gemini-2.5-pro"]);
    }

    #[test]
    fn test_resolve_models_explicit_overrides() {
        let compatibility = vec![compat("gpt-4o", "openai", true)];
        let explicit = vec!["claude-sonnet-4".to_string()];
        let selected = resolve_models(&explicit, &compatibility).unwrap();
        assert_eq!(selected, vec!["claude-sonnet-4"]);
    }

    #[test]
    fn test_resolve_models_unknown_explicit_is_config_error() {
        let err = resolve_models(&["made-up-model".to_string()], &[]).unwrap_err();
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_synthesis_policy() {
        let two = vec!["a".to_string(), "b".to_string()];
        let one = vec!["a".to_string()];

        // Vários modelos: síntese por política padrão, primeiro da lista.
        assert_eq!(resolve_synthesis_model(&two, false), Some("a".to_string()));
        // Um modelo: só com --synthesis.
        assert_eq!(resolve_synthesis_model(&one, false), None);
        assert_eq!(resolve_synthesis_model(&one, true), Some("a".to_string()));
        // Lista vazia nunca sintetiza.
        assert_eq!(resolve_synthesis_model(&[], true), None);
    }

    #[tokio::test]
    async fn test_build_rate_gate_uses_min_default_rpm() {
        let config = RunConfig {
            instructions: "i".into(),
            targets: vec!["t".into()],
            output_dir: "o".into(),
            provider_rpm: 0,
            ..Default::default()
        };
        // claude-opus-4 tem RPM padrão 120, claude-sonnet-4 tem 300:
        // o provider anthropic fica com o menor dos dois.
        let selected = vec!["claude-opus-4".to_string(), "claude-sonnet-4".to_string()];
        let gate = build_rate_gate(&config, &selected);
        assert_eq!(gate.status("anthropic").await.rpm_cap, 120);

        // Override explícito da config vence o catálogo.
        let config = RunConfig {
            provider_rpm: 42,
            ..config
        };
        let gate = build_rate_gate(&config, &selected);
        assert_eq!(gate.status("anthropic").await.rpm_cap, 42);
    }

    #[test]
    fn test_cli_parses_spec_surface() {
        let cli = Cli::try_parse_from([
            "thinktank",
            "instructions.md",
            "src",
            "docs",
            "--dry-run",
            "--model",
            "gpt-4o",
            "--model",
            "claude-sonnet-4",
            "--token-safety-margin",
            "20",
            "--timeout",
            "90s",
            "--synthesis",
            "--partial-success-ok",
        ])
        .unwrap();

        assert_eq!(cli.instructions, PathBuf::from("instructions.md"));
        assert_eq!(cli.targets.len(), 2);
        assert!(cli.dry_run);
        assert_eq!(cli.models, vec!["gpt-4o", "claude-sonnet-4"]);
        assert_eq!(cli.token_safety_margin, 20);
        assert_eq!(cli.timeout, Duration::from_secs(90));
        assert!(cli.synthesis);
        assert!(cli.partial_success_ok);
    }

    #[test]
    fn test_cli_requires_targets() {
        assert!(Cli::try_parse_from(["thinktank", "instructions.md"]).is_err());
    }
}
