//! # Módulo de Rate Limiting por Provider (RateGate)
//!
//! Controla, por provider, três políticas independentes:
//!
//! 1. **Concorrência**: no máximo N requisições em voo ao mesmo tempo
//! 2. **RPM**: teto de requisições por minuto (janela deslizante de 60s)
//! 3. **Circuit breaker**: corta chamadas para providers instáveis
//!
//! ## Para todos entenderem:
//!
//! Imagine um restaurante com três regras na porta:
//! - Só N clientes dentro ao mesmo tempo (concorrência)
//! - Só M clientes entram por minuto (RPM)
//! - Se a cozinha queimou 5 pratos seguidos, fecha a porta por 30
//!   segundos e depois deixa UM cliente entrar de teste (breaker)
//!
//! ## Protocolo de uso:
//!
//! ```text
//! acquire(provider)          <- bloqueia até ter vaga (ou falha com
//!                               CircuitOpen / Cancelled)
//!   ... chamada ao provider ...
//! record_success(provider)   <- ou record_failure / record_neutral
//! release(provider)          <- devolve a vaga, sempre
//! ```
//!
//! Todo `acquire` bem-sucedido exige exatamente um `release`.
//! Release em dobro é bug do chamador e dispara panic em builds de
//! debug.
//!
//! ## Estados do breaker:
//!
//! ```text
//!            falhas >= 5
//!  Closed ───────────────> Open
//!    ^                      │ now >= next_retry
//!    │  probe ok            v
//!    └──────────────── HalfOpen ──> Open (probe falhou)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// CONSTANTES
// ============================================================================

/// Falhas consecutivas que abrem o breaker.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Tempo de porta fechada antes de permitir um probe.
pub const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// Janela da contagem de RPM.
const RPM_WINDOW: Duration = Duration::from_secs(60);

// ============================================================================
// ERROS DO GATE
// ============================================================================

/// Falhas possíveis de um `acquire`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// O breaker do provider está aberto; tente mais tarde.
    #[error("circuit breaker open for provider '{provider}'")]
    CircuitOpen { provider: String },

    /// O contexto da execução foi cancelado durante a espera.
    #[error("acquire cancelled")]
    Cancelled,
}

// ============================================================================
// CIRCUIT BREAKER
// ============================================================================

/// Estado do circuit breaker de um provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Operação normal.
    Closed,
    /// Cortando chamadas até `next_retry`.
    Open,
    /// Janela de teste: exatamente um probe em voo.
    HalfOpen,
}

/// Estado interno do breaker. Sempre acessado sob o lock do provider.
#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    next_retry: Option<Instant>,
    /// Um probe já foi admitido nesta janela HalfOpen?
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            next_retry: None,
            probe_in_flight: false,
        }
    }
}

// ============================================================================
// LIMITES E ESTADO POR PROVIDER
// ============================================================================

/// Limites aplicados a um provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderLimits {
    /// Requisições simultâneas.
    pub max_concurrent: usize,
    /// Requisições por minuto. Zero desliga o limite.
    pub rpm: u32,
}

impl Default for ProviderLimits {
    fn default() -> Self {
        Self {
            max_concurrent: crate::config::DEFAULT_MAX_CONCURRENT,
            rpm: 0,
        }
    }
}

/// Estado de runtime de um provider.
struct ProviderState {
    limits: ProviderLimits,
    /// Semáforo justo do tokio: admissão em ordem de chegada,
    /// sem starvation.
    semaphore: Arc<Semaphore>,
    /// Instantes das admissões recentes, para a janela de RPM.
    window: Mutex<VecDeque<Instant>>,
    breaker: Mutex<Breaker>,
    /// Permits adquiridos e ainda não devolvidos. Detecta release em dobro.
    outstanding: AtomicIsize,
}

impl ProviderState {
    fn new(limits: ProviderLimits) -> Self {
        Self {
            limits,
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent)),
            window: Mutex::new(VecDeque::new()),
            breaker: Mutex::new(Breaker::new()),
            outstanding: AtomicIsize::new(0),
        }
    }
}

/// Snapshot de diagnóstico de um provider. Sem efeitos colaterais.
#[derive(Debug, Clone, Copy)]
pub struct GateStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub rpm_cap: u32,
    pub available_now: bool,
}

// ============================================================================
// RATE GATE
// ============================================================================

/// Gate compartilhado entre todos os workers de uma execução.
pub struct RateGate {
    default_limits: ProviderLimits,
    providers: Mutex<HashMap<String, Arc<ProviderState>>>,
}

impl RateGate {
    /// Cria um gate com os mesmos limites para todos os providers.
    pub fn new(default_limits: ProviderLimits) -> Self {
        Self::with_limits(default_limits, HashMap::new())
    }

    /// Cria um gate com limites específicos por provider.
    ///
    /// Providers fora do mapa usam `default_limits` na primeira
    /// admissão.
    pub fn with_limits(
        default_limits: ProviderLimits,
        per_provider: HashMap<String, ProviderLimits>,
    ) -> Self {
        let providers = per_provider
            .into_iter()
            .map(|(id, limits)| (id, Arc::new(ProviderState::new(limits))))
            .collect();
        Self {
            default_limits,
            providers: Mutex::new(providers),
        }
    }

    async fn provider_state(&self, provider: &str) -> Arc<ProviderState> {
        let mut providers = self.providers.lock().await;
        providers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(ProviderState::new(self.default_limits)))
            .clone()
    }

    // ========================================================================
    // ACQUIRE / RELEASE
    // ========================================================================

    /// Bloqueia até haver vaga de concorrência E de RPM para o provider.
    ///
    /// Falha com `CircuitOpen` quando o breaker está aberto e ainda não
    /// chegou a hora do probe, e com `Cancelled` quando o token é
    /// cancelado durante qualquer espera.
    ///
    /// No sucesso o chamador é dono de exatamente um permit e DEVE
    /// chamar `release` em todos os caminhos de código.
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
        provider: &str,
    ) -> Result<(), GateError> {
        let state = self.provider_state(provider).await;

        // 1. Breaker: decide na entrada. Quem atravessa um breaker em
        //    HalfOpen vira o probe da janela.
        let is_probe = {
            let mut breaker = state.breaker.lock().await;
            match breaker.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let due = breaker
                        .next_retry
                        .map(|at| Instant::now() >= at)
                        .unwrap_or(true);
                    if !due {
                        return Err(GateError::CircuitOpen {
                            provider: provider.to_string(),
                        });
                    }
                    info!(provider = %provider, "circuit half-open, admitting probe");
                    breaker.state = CircuitState::HalfOpen;
                    breaker.probe_in_flight = true;
                    true
                }
                CircuitState::HalfOpen => {
                    if breaker.probe_in_flight {
                        return Err(GateError::CircuitOpen {
                            provider: provider.to_string(),
                        });
                    }
                    breaker.probe_in_flight = true;
                    true
                }
            }
        };

        // 2. Concorrência: semáforo justo, admissão em ordem de chegada.
        let permit = tokio::select! {
            permit = state.semaphore.acquire() => permit.expect("gate semaphore never closed"),
            _ = cancel.cancelled() => {
                // Probe cancelado na espera devolve a janela HalfOpen
                // antes de retornar; senão o próximo acquire do provider
                // veria CircuitOpen sem nenhum probe em voo.
                if is_probe {
                    state.breaker.lock().await.probe_in_flight = false;
                }
                return Err(GateError::Cancelled);
            }
        };

        // 3. RPM: espera a janela deslizante abrir espaço.
        if state.limits.rpm > 0 {
            loop {
                let wait_until = {
                    let mut window = state.window.lock().await;
                    let now = Instant::now();
                    while window
                        .front()
                        .map(|t| now.duration_since(*t) >= RPM_WINDOW)
                        .unwrap_or(false)
                    {
                        window.pop_front();
                    }
                    if (window.len() as u32) < state.limits.rpm {
                        window.push_back(now);
                        None
                    } else {
                        // A vaga mais antiga expira neste instante.
                        Some(*window.front().expect("window non-empty") + RPM_WINDOW)
                    }
                };

                match wait_until {
                    None => break,
                    Some(at) => {
                        debug!(provider = %provider, "rpm window full, waiting");
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => {}
                            _ = cancel.cancelled() => {
                                drop(permit);
                                if is_probe {
                                    state.breaker.lock().await.probe_in_flight = false;
                                }
                                return Err(GateError::Cancelled);
                            }
                        }
                    }
                }
            }
        }

        // Permit entregue ao chamador; o release é manual.
        permit.forget();
        state.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Devolve um permit de concorrência. Nunca bloqueia.
    ///
    /// Exatamente um release por acquire: devolver em dobro corrompe o
    /// limite de concorrência e dispara panic em builds de debug.
    pub async fn release(&self, provider: &str) {
        let state = self.provider_state(provider).await;
        let prev = state.outstanding.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(
            prev > 0,
            "release without matching acquire for provider '{provider}'"
        );
        state.semaphore.add_permits(1);
    }

    // ========================================================================
    // BREAKER
    // ========================================================================

    /// Registra um sucesso: zera o contador e fecha o breaker.
    pub async fn record_success(&self, provider: &str) {
        let state = self.provider_state(provider).await;
        let mut breaker = state.breaker.lock().await;
        if breaker.state != CircuitState::Closed {
            info!(provider = %provider, "circuit closed, provider recovered");
        }
        breaker.state = CircuitState::Closed;
        breaker.consecutive_failures = 0;
        breaker.next_retry = None;
        breaker.probe_in_flight = false;
    }

    /// Registra uma falha que conta para o breaker.
    ///
    /// Em HalfOpen qualquer falha reabre na hora; em Closed a porta
    /// abre ao cruzar o limiar de falhas consecutivas.
    pub async fn record_failure(&self, provider: &str) {
        let state = self.provider_state(provider).await;
        let mut breaker = state.breaker.lock().await;
        breaker.consecutive_failures += 1;
        breaker.probe_in_flight = false;

        let should_open = breaker.state == CircuitState::HalfOpen
            || breaker.consecutive_failures >= FAILURE_THRESHOLD;

        if should_open {
            if breaker.state != CircuitState::Open {
                warn!(
                    provider = %provider,
                    failures = breaker.consecutive_failures,
                    "circuit opened"
                );
            }
            breaker.state = CircuitState::Open;
            breaker.next_retry = Some(Instant::now() + BREAKER_COOLDOWN);
        }
    }

    /// Resolve um probe sem contar sucesso nem falha.
    ///
    /// Usado quando a chamada termina com um erro que não diz nada
    /// sobre a saúde do provider (ex: credencial inválida). Mantém o
    /// estado e libera a janela de probe para o próximo chamador.
    pub async fn record_neutral(&self, provider: &str) {
        let state = self.provider_state(provider).await;
        state.breaker.lock().await.probe_in_flight = false;
    }

    /// Snapshot de diagnóstico. Não tem efeitos colaterais.
    pub async fn status(&self, provider: &str) -> GateStatus {
        let state = self.provider_state(provider).await;
        let breaker = state.breaker.lock().await;

        let breaker_allows = match breaker.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !breaker.probe_in_flight,
            CircuitState::Open => breaker
                .next_retry
                .map(|at| Instant::now() >= at)
                .unwrap_or(true),
        };

        let rpm_has_room = if state.limits.rpm == 0 {
            true
        } else {
            let window = state.window.lock().await;
            let now = Instant::now();
            let live = window
                .iter()
                .filter(|t| now.duration_since(**t) < RPM_WINDOW)
                .count() as u32;
            live < state.limits.rpm
        };

        GateStatus {
            state: breaker.state,
            consecutive_failures: breaker.consecutive_failures,
            rpm_cap: state.limits.rpm,
            available_now: breaker_allows
                && state.semaphore.available_permits() > 0
                && rpm_has_room,
        }
    }
}

// ============================================================================
// BACKOFF EXPONENCIAL COM JITTER
// ============================================================================

/// Parâmetros do backoff exponencial.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Delay da primeira espera.
    pub base: Duration,
    /// Teto de qualquer espera.
    pub cap: Duration,
    /// Fração de jitter aplicada sobre o delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay da tentativa `attempt` (0-based), com jitter aplicado.
    ///
    /// delay = min(base × 2^attempt, cap) ± jitter, nunca abaixo de base.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .as_secs_f64()
            .mul_add(2f64.powi(attempt as i32), 0.0)
            .min(self.cap.as_secs_f64());

        let spread = exp * self.jitter;
        let jittered = if spread > 0.0 {
            exp + rand::Rng::gen_range(&mut rand::thread_rng(), -spread..=spread)
        } else {
            exp
        };

        Duration::from_secs_f64(jittered.max(self.base.as_secs_f64()))
    }
}

/// Resultado de `retry_with_backoff`.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// A operação falhou e o orçamento de tentativas acabou (ou o erro
    /// não era retryável).
    Op(E),
    /// Cancelado durante uma espera de backoff.
    Cancelled,
}

/// Executa `op` com até `max_attempts` tentativas e backoff exponencial.
///
/// Helper puro: não consulta o breaker. `retryable` decide se um erro
/// merece nova tentativa; erros não-retryáveis saem imediatamente.
/// Sucesso na tentativa k dorme exatamente k−1 vezes.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    cancel: &CancellationToken,
    config: BackoffConfig,
    max_attempts: u32,
    retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    info!(attempt = attempt + 1, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) => {
                if !retryable(&e) || attempt + 1 >= max_attempts {
                    return Err(RetryError::Op(e));
                }

                let delay = config.delay_for(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                }
                attempt += 1;
            }
        }
    }
}

// ============================================================================
// TESTES
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn gate(max_concurrent: usize, rpm: u32) -> RateGate {
        RateGate::new(ProviderLimits {
            max_concurrent,
            rpm,
        })
    }

    #[tokio::test]
    async fn test_acquire_release_roundtrip() {
        let gate = gate(1, 0);
        let cancel = CancellationToken::new();

        gate.acquire(&cancel, "p").await.unwrap();
        gate.release("p").await;
        gate.acquire(&cancel, "p").await.unwrap();
        gate.release("p").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_cap_blocks_extra_acquire() {
        let gate = gate(2, 0);
        let cancel = CancellationToken::new();

        gate.acquire(&cancel, "p").await.unwrap();
        gate.acquire(&cancel, "p").await.unwrap();

        // Terceiro acquire não completa enquanto ninguém devolve.
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), gate.acquire(&cancel, "p")).await;
        assert!(blocked.is_err());

        gate.release("p").await;
        tokio::time::timeout(Duration::from_millis(50), gate.acquire(&cancel, "p"))
            .await
            .expect("slot freed")
            .unwrap();

        gate.release("p").await;
        gate.release("p").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rpm_window_delays_admission() {
        let gate = gate(10, 2);
        let cancel = CancellationToken::new();
        let start = Instant::now();

        gate.acquire(&cancel, "p").await.unwrap();
        gate.acquire(&cancel, "p").await.unwrap();
        // Terceira admissão só depois da janela de 60s da primeira.
        gate.acquire(&cancel, "p").await.unwrap();

        assert!(start.elapsed() >= Duration::from_secs(60));

        gate.release("p").await;
        gate.release("p").await;
        gate.release("p").await;
    }

    #[tokio::test]
    async fn test_rpm_zero_means_unlimited() {
        let gate = gate(64, 0);
        let cancel = CancellationToken::new();

        for _ in 0..50 {
            gate.acquire(&cancel, "p").await.unwrap();
        }
        for _ in 0..50 {
            gate.release("p").await;
        }
    }

    #[tokio::test]
    async fn test_cancel_during_semaphore_wait() {
        let gate = Arc::new(gate(1, 0));
        let cancel = CancellationToken::new();

        gate.acquire(&cancel, "p").await.unwrap();

        let gate2 = gate.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { gate2.acquire(&cancel2, "p").await });

        tokio::task::yield_now().await;
        cancel.cancel();

        assert_eq!(waiter.await.unwrap(), Err(GateError::Cancelled));
        gate.release("p").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_after_threshold() {
        let gate = gate(4, 0);
        let cancel = CancellationToken::new();

        for _ in 0..FAILURE_THRESHOLD {
            gate.record_failure("p").await;
        }

        let err = gate.acquire(&cancel, "p").await.unwrap_err();
        assert!(matches!(err, GateError::CircuitOpen { .. }));

        let status = gate.status("p").await;
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.consecutive_failures, FAILURE_THRESHOLD);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_single_probe() {
        let gate = gate(4, 0);
        let cancel = CancellationToken::new();

        for _ in 0..FAILURE_THRESHOLD {
            gate.record_failure("p").await;
        }
        tokio::time::advance(BREAKER_COOLDOWN).await;

        // Primeiro chamador vira o probe.
        gate.acquire(&cancel, "p").await.unwrap();
        assert_eq!(gate.status("p").await.state, CircuitState::HalfOpen);

        // Os demais veem CircuitOpen enquanto o probe não resolve.
        let err = gate.acquire(&cancel, "p").await.unwrap_err();
        assert!(matches!(err, GateError::CircuitOpen { .. }));

        // Probe bem-sucedido fecha e zera o contador.
        gate.record_success("p").await;
        gate.release("p").await;

        let status = gate.status("p").await;
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
        gate.acquire(&cancel, "p").await.unwrap();
        gate.release("p").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_probe_failure_reopens() {
        let gate = gate(4, 0);
        let cancel = CancellationToken::new();

        for _ in 0..FAILURE_THRESHOLD {
            gate.record_failure("p").await;
        }
        tokio::time::advance(BREAKER_COOLDOWN).await;

        gate.acquire(&cancel, "p").await.unwrap();
        gate.record_failure("p").await;
        gate.release("p").await;

        assert_eq!(gate.status("p").await.state, CircuitState::Open);
        let err = gate.acquire(&cancel, "p").await.unwrap_err();
        assert!(matches!(err, GateError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_in_semaphore_wait_frees_the_window() {
        let gate = Arc::new(gate(1, 0));
        let cancel = CancellationToken::new();

        // Ocupa o único permit antes do breaker abrir.
        gate.acquire(&cancel, "p").await.unwrap();
        for _ in 0..FAILURE_THRESHOLD {
            gate.record_failure("p").await;
        }
        tokio::time::advance(BREAKER_COOLDOWN).await;

        // O probe atravessa o breaker mas trava no semáforo.
        let probe_cancel = CancellationToken::new();
        let gate2 = gate.clone();
        let probe_cancel2 = probe_cancel.clone();
        let probe = tokio::spawn(async move { gate2.acquire(&probe_cancel2, "p").await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        probe_cancel.cancel();
        assert_eq!(probe.await.unwrap(), Err(GateError::Cancelled));

        // A janela de probe tem que estar livre JÁ, sem esperar nenhum
        // outro task rodar: o próximo chamador vira o novo probe.
        gate.release("p").await;
        gate.acquire(&cancel, "p").await.unwrap();
        assert_eq!(gate.status("p").await.state, CircuitState::HalfOpen);

        gate.record_success("p").await;
        gate.release("p").await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_in_rpm_wait_frees_the_window() {
        let gate = Arc::new(gate(4, 1));
        let cancel = CancellationToken::new();

        // Consome a única vaga de RPM da janela de 60s.
        gate.acquire(&cancel, "p").await.unwrap();
        gate.release("p").await;

        for _ in 0..FAILURE_THRESHOLD {
            gate.record_failure("p").await;
        }
        tokio::time::advance(BREAKER_COOLDOWN).await;

        // O probe passa pelo breaker e pelo semáforo, e trava na espera
        // da janela de RPM (ainda faltam 30s para a vaga expirar).
        let probe_cancel = CancellationToken::new();
        let gate2 = gate.clone();
        let probe_cancel2 = probe_cancel.clone();
        let probe = tokio::spawn(async move { gate2.acquire(&probe_cancel2, "p").await });
        tokio::time::sleep(Duration::from_millis(1)).await;

        probe_cancel.cancel();
        assert_eq!(probe.await.unwrap(), Err(GateError::Cancelled));

        // Reacquire imediato vira o novo probe e completa quando a
        // janela de RPM abre.
        gate.acquire(&cancel, "p").await.unwrap();
        assert_eq!(gate.status("p").await.state, CircuitState::HalfOpen);

        gate.record_success("p").await;
        gate.release("p").await;
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let gate = gate(4, 0);

        gate.record_failure("p").await;
        gate.record_failure("p").await;
        gate.record_success("p").await;

        let status = gate.status("p").await;
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_neutral_frees_probe_window() {
        let gate = gate(4, 0);
        let cancel = CancellationToken::new();

        for _ in 0..FAILURE_THRESHOLD {
            gate.record_failure("p").await;
        }
        tokio::time::advance(BREAKER_COOLDOWN).await;

        gate.acquire(&cancel, "p").await.unwrap();
        // Erro que não diz nada sobre a saúde do provider.
        gate.record_neutral("p").await;
        gate.release("p").await;

        // A janela de probe abriu de novo para o próximo chamador.
        gate.acquire(&cancel, "p").await.unwrap();
        gate.release("p").await;
    }

    #[tokio::test]
    async fn test_breakers_are_per_provider() {
        let gate = gate(4, 0);
        let cancel = CancellationToken::new();

        for _ in 0..FAILURE_THRESHOLD {
            gate.record_failure("pa").await;
        }

        assert!(gate.acquire(&cancel, "pa").await.is_err());
        // Outro provider segue normal.
        gate.acquire(&cancel, "pb").await.unwrap();
        gate.release("pb").await;
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "release without matching acquire")]
    async fn test_double_release_panics_in_debug() {
        let gate = gate(2, 0);
        let cancel = CancellationToken::new();

        gate.acquire(&cancel, "p").await.unwrap();
        gate.release("p").await;
        gate.release("p").await;
    }

    // ------------------------------------------------------------------
    // retry_with_backoff
    // ------------------------------------------------------------------

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(2),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_retry_success_first_try_never_sleeps() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result: Result<u32, RetryError<&str>> =
            retry_with_backoff(&cancel, fast_backoff(), 3, |_| true, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_sleeps_k_minus_one_times() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let start = Instant::now();

        let result: Result<u32, RetryError<&str>> =
            retry_with_backoff(&cancel, fast_backoff(), 3, |_| true, move |_| {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Duas esperas: base + base*2 = 300ms com jitter zero.
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_budget() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let config = BackoffConfig {
            base: Duration::from_millis(1),
            ..fast_backoff()
        };
        let result: Result<u32, RetryError<&str>> =
            retry_with_backoff(&cancel, config, 3, |_| true, move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("persistent")
                }
            })
            .await;

        assert_eq!(result, Err(RetryError::Op("persistent")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, RetryError<&str>> =
            retry_with_backoff(&cancel, fast_backoff(), 5, |e| *e != "fatal", move |_| {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            })
            .await;

        assert_eq!(result, Err(RetryError::Op("fatal")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cancelled_during_backoff() {
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let handle = tokio::spawn(async move {
            let result: Result<u32, RetryError<&str>> = retry_with_backoff(
                &cancel2,
                BackoffConfig {
                    base: Duration::from_secs(60),
                    cap: Duration::from_secs(60),
                    jitter: 0.0,
                },
                3,
                |_| true,
                |_| async { Err("transient") },
            )
            .await;
            result
        });

        tokio::task::yield_now().await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), Err(RetryError::Cancelled));
    }

    #[test]
    fn test_backoff_delay_respects_cap_and_floor() {
        let config = BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(config.delay_for(0), Duration::from_secs(1));
        assert_eq!(config.delay_for(1), Duration::from_secs(2));
        assert_eq!(config.delay_for(4), Duration::from_secs(16));
        // 2^6 = 64s estoura o cap de 30s.
        assert_eq!(config.delay_for(6), Duration::from_secs(30));

        // Jitter nunca derruba abaixo de base.
        let jittery = BackoffConfig {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.9,
        };
        for attempt in 0..8 {
            assert!(jittery.delay_for(attempt) >= jittery.base);
        }
    }
}
