//! # Módulo de Diretórios de Saída
//!
//! Gera nomes de diretório de execução únicos e fáceis de reconhecer
//! depois, para limpeza e estatísticas.
//!
//! ## Para todos entenderem:
//!
//! Cada execução ganha um diretório próprio. Dois formatos:
//!
//! 1. **Memorável**: `<adjetivo>-<verbo>-<substantivo>`, tipo
//!    `golden-drifting-harbor`. Bonito de ler em CI e fácil de apagar
//!    depois, porque só combinações das nossas listas têm essa cara.
//! 2. **Timestampado** (fallback): `thinktank_YYYYMMDD_HHMMSS_NNNNNNNNN`,
//!    onde os nove dígitos misturam nanossegundos, um campo aleatório e
//!    um contador atômico do processo.
//!
//! ## Sorteio sem repetição:
//!
//! O sorteio dos nomes memoráveis percorre o espaço |A|×|V|×|N| em
//! ciclo completo: offset aleatório + passo coprimo com o tamanho do
//! espaço. Antes de repetir um nome, todos os outros já saíram.
//!
//! As listas são aditivas: nunca remova palavras, só acrescente no fim,
//! senão nomes antigos deixam de ser reconhecidos pela limpeza.

use chrono::Utc;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::debug;

// ============================================================================
// LISTAS DE PALAVRAS (SÓ ACRESCENTE NO FIM)
// ============================================================================

static ADJECTIVES: &[&str] = &[
    "golden", "silent", "gentle", "serene", "mellow", "radiant", "crimson", "emerald", "patient",
    "curious", "valiant", "sincere", "luminous", "peaceful", "graceful", "spirited",
];

static VERBS: &[&str] = &[
    "dancing", "singing", "drifting", "gliding", "soaring", "wandering", "whistling", "painting",
    "sailing", "weaving", "humming", "sparking", "roaming", "blooming", "spinning", "floating",
];

static NOUNS: &[&str] = &[
    "meadow", "harbor", "forest", "island", "canyon", "garden", "lantern", "thicket", "prairie",
    "estuary", "glacier", "horizon", "monsoon", "lagoon", "summit", "volcano",
];

/// Faixa de comprimento aceita para o nome completo.
const MIN_NAME_LEN: usize = 20;
const MAX_NAME_LEN: usize = 40;

/// Sorteios antes de cair no fallback determinístico.
const MAX_DRAWS: usize = 50;

/// Tentativas de criação antes de trocar de formato.
const MAX_COLLISION_ATTEMPTS: usize = 10;

/// Reconhecedor do formato timestampado.
static TIMESTAMPED_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^thinktank_\d{8}_\d{6}_\d{9}(_retry\d+)?$").expect("valid timestamped regex")
});

/// Contador do processo inteiro: garante sufixos distintos para
/// criações concorrentes dentro de um mesmo processo.
static PROCESS_COUNTER: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// OUTPUT DIR MANAGER
// ============================================================================

/// Gerador de nomes de diretório de execução.
pub struct OutputDirManager {
    /// Posição inicial aleatória no espaço de combinações.
    offset: u64,
    /// Passo coprimo com o tamanho do espaço (ciclo completo).
    stride: u64,
    /// Quantos sorteios esta instância já fez.
    draws: AtomicU64,
}

impl Default for OutputDirManager {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDirManager {
    pub fn new() -> Self {
        let total = Self::combination_count();
        let mut rng = rand::thread_rng();
        let offset = rng.gen_range(0..total);
        // Sorteia até achar um passo coprimo. Para tamanhos em potência
        // de dois qualquer ímpar serve, então o loop termina rápido.
        let stride = loop {
            let candidate = rng.gen_range(1..total);
            if gcd(candidate, total) == 1 {
                break candidate;
            }
        };
        Self {
            offset,
            stride,
            draws: AtomicU64::new(0),
        }
    }

    fn combination_count() -> u64 {
        (ADJECTIVES.len() * VERBS.len() * NOUNS.len()) as u64
    }

    fn name_at(index: u64) -> String {
        let verbs = VERBS.len() as u64;
        let nouns = NOUNS.len() as u64;
        let a = (index / (verbs * nouns)) as usize;
        let v = ((index / nouns) % verbs) as usize;
        let n = (index % nouns) as usize;
        format!("{}-{}-{}", ADJECTIVES[a], VERBS[v], NOUNS[n])
    }

    fn in_range(name: &str) -> bool {
        (MIN_NAME_LEN..=MAX_NAME_LEN).contains(&name.len())
    }

    /// Próximo nome memorável do ciclo.
    ///
    /// Até 50 sorteios; se nenhum cair na faixa de comprimento, usa a
    /// primeira combinação na faixa; se nem isso existir, cai no
    /// formato timestampado.
    pub fn generate_memorable_dir_name(&self) -> String {
        let total = Self::combination_count();

        for _ in 0..MAX_DRAWS {
            let k = self.draws.fetch_add(1, Ordering::SeqCst);
            let index = (self.offset + k.wrapping_mul(self.stride)) % total;
            let name = Self::name_at(index);
            if Self::in_range(&name) {
                return name;
            }
        }

        // Fallback determinístico: primeira combinação dentro da faixa.
        for index in 0..total {
            let name = Self::name_at(index);
            if Self::in_range(&name) {
                return name;
            }
        }

        generate_timestamped_dir_name()
    }

    /// Cria o diretório da execução dentro de `base`.
    ///
    /// Tenta até 10 nomes memoráveis e depois até 10 timestampados
    /// (com sufixo `_retryN`), confiando na semântica de criação
    /// exclusiva do filesystem para detectar colisão entre processos.
    pub fn create_output_directory(&self, base: &Path, perm: u32) -> io::Result<PathBuf> {
        fs::create_dir_all(base)?;

        for _ in 0..MAX_COLLISION_ATTEMPTS {
            let candidate = base.join(self.generate_memorable_dir_name());
            match try_create(&candidate, perm) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(dir = %candidate.display(), "memorable name collided, drawing again");
                }
                Err(e) => return Err(e),
            }
        }

        let stem = generate_timestamped_dir_name();
        for attempt in 0..MAX_COLLISION_ATTEMPTS {
            let name = if attempt == 0 {
                stem.clone()
            } else {
                format!("{stem}_retry{attempt}")
            };
            let candidate = base.join(name);
            match try_create(&candidate, perm) {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "exhausted output directory name candidates",
        ))
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn try_create(path: &Path, perm: u32) -> io::Result<()> {
    fs::create_dir(path)?;
    apply_mode(path, perm)
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
// FORMATO TIMESTAMPADO
// ============================================================================

/// Gera um nome timestampado `thinktank_YYYYMMDD_HHMMSS_NNNNNNNNN`.
///
/// Os nove dígitos finais misturam três fontes de entropia:
/// nanossegundos (3 dígitos), um campo aleatório (3) e o contador
/// atômico do processo (3). Dentro de um processo o contador sozinho
/// já evita colisões.
pub fn generate_timestamped_dir_name() -> String {
    let now = Utc::now();
    let nanos = now.timestamp_subsec_nanos() as u64;
    let random: u64 = rand::thread_rng().gen_range(0..1000);
    let counter = PROCESS_COUNTER.fetch_add(1, Ordering::SeqCst);

    let suffix = (nanos % 1000) * 1_000_000 + random * 1000 + (counter % 1000);
    format!("thinktank_{}_{:09}", now.format("%Y%m%d_%H%M%S"), suffix)
}

// ============================================================================
// RECONHECIMENTO E LIMPEZA
// ============================================================================

/// O nome foi gerado por este módulo (qualquer um dos dois formatos)?
pub fn is_own_dir(name: &str) -> bool {
    if TIMESTAMPED_RE.is_match(name) {
        return true;
    }

    let mut parts = name.split('-');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(v), Some(n), None) => {
            ADJECTIVES.contains(&a) && VERBS.contains(&v) && NOUNS.contains(&n)
        }
        _ => false,
    }
}

/// Remove diretórios nossos mais velhos que `max_age`. Retorna quantos
/// foram removidos. Diretórios de terceiros nunca são tocados.
///
/// Ferramenta de manutenção; o fluxo de execução nunca apaga nada.
#[allow(dead_code)]
pub fn cleanup_older_than(base: &Path, max_age: Duration) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.path().is_dir() || !is_own_dir(&name) {
            continue;
        }

        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| SystemTime::now().duration_since(t).ok());

        if age.map(|a| a >= max_age).unwrap_or(false) {
            fs::remove_dir_all(entry.path())?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Estatísticas dos diretórios nossos dentro de `base`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DirStats {
    /// Diretórios reconhecidos como nossos.
    pub own_dirs: usize,
    /// Total de entradas no diretório base.
    pub total_entries: usize,
}

pub fn stats(base: &Path) -> io::Result<DirStats> {
    let mut stats = DirStats::default();
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        stats.total_entries += 1;
        let name = entry.file_name().to_string_lossy().to_string();
        if entry.path().is_dir() && is_own_dir(&name) {
            stats.own_dirs += 1;
        }
    }
    Ok(stats)
}

// ============================================================================
// TESTES
// ============================================================================
