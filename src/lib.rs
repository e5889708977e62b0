use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

pub mod backend;
mod recetario;

pub use crate::backend::{Backend, BackendError, FeedId, MemoryBackend, SupabaseBackend};
pub use crate::recetario::auth::{AuthService, Role, SignInOutcome, SignUpOutcome, UserProfile};
pub use crate::recetario::chat::{
    AuthorSummary, ChatConfig, ChatSession, ChatState, Message, MessageSync, MessageTimeline,
    TypingStatus, TypingTracker, typing_indicator,
};
pub use crate::recetario::debounce::Debouncer;
pub use crate::recetario::error::{OperationOutcome, RecetarioError, Result};
pub use crate::recetario::recipes::{
    NewRecipe, Recipe, RecipeImage, RecipeOutcome, RecipeUpdate, RecipesService,
};
pub use crate::recetario::subscription::Subscription;
pub use crate::recetario::{Recetario, RecetarioConfig};

static TRACING_GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber: stdout plus a daily log file in `logs_dir`.
///
/// Only the first call has any effect. `RUST_LOG` overrides the default `info` level.
pub fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        let mut guards = vec![stdout_guard];

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = match tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("recetario")
            .filename_suffix("log")
            .build(logs_dir)
        {
            Ok(file_appender) => {
                let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
                guards.push(file_guard);
                Some(
                    Layer::new()
                        .with_writer(non_blocking_file)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Failed to create log file in {:?}: {}", logs_dir, e);
                None
            }
        };

        TRACING_GUARDS.set(Mutex::new(guards)).ok();

        let installed = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
        if let Err(e) = installed {
            eprintln!("Tracing already initialized: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_idempotent() {
        let logs = tempfile::TempDir::new().unwrap();
        init_tracing(logs.path());
        init_tracing(logs.path());
        assert!(TRACING_INIT.get().is_some());
        assert!(
            TRACING_GUARDS
                .get()
                .is_some_and(|guards| !guards.lock().unwrap().is_empty())
        );
    }
}
