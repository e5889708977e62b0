use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use recetario::{
    ChatSession, MemoryBackend, Message, Recetario, RecetarioConfig, RecetarioError,
    init_tracing,
};

/// Terminal client for the recipe community chat
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory for application data
    #[clap(long, value_name = "PATH", default_value = "./data")]
    data_dir: PathBuf,

    /// Directory for application logs
    #[clap(long, value_name = "PATH", default_value = "./logs")]
    logs_dir: PathBuf,

    /// Account email
    #[clap(long, env = "RECETARIO_EMAIL")]
    email: String,

    /// Account password
    #[clap(long, env = "RECETARIO_PASSWORD", hide_env_values = true)]
    password: String,

    /// Use an in-process backend instead of the hosted one
    #[clap(long)]
    offline: bool,
}

fn print_message(message: &Message) {
    let author = message
        .author_email()
        .and_then(|email| email.split('@').next())
        .unwrap_or("?");
    println!(
        "[{}] {}: {}",
        message.created_at.format("%H:%M"),
        author,
        message.content
    );
}

async fn open_app(args: &Args) -> Result<Recetario, RecetarioError> {
    if !args.offline {
        let config = RecetarioConfig::from_env(&args.data_dir, &args.logs_dir)?;
        return Recetario::initialize(config).await;
    }

    let config = RecetarioConfig::new(&args.data_dir, &args.logs_dir, "memory://", "");
    std::fs::create_dir_all(&config.logs_dir)?;
    init_tracing(&config.logs_dir);

    let backend = MemoryBackend::new().with_profile_table("usuarios");
    backend.seed_user(&args.email, &args.password, "usuario");
    Ok(Recetario::with_backend(config, Arc::new(backend)))
}

/// Prints messages as they arrive and the typing indicator when it changes.
fn spawn_printer(session: &ChatSession) -> tokio::task::JoinHandle<()> {
    let mut rx = session.watch();
    tokio::spawn(async move {
        let mut printed: HashSet<String> = HashSet::new();
        let mut indicator: Option<String> = None;
        loop {
            {
                let state = rx.borrow_and_update();
                for message in state.messages.iter() {
                    if printed.insert(message.id.clone()) {
                        print_message(message);
                    }
                }
                let current = state.typing_indicator();
                if current != indicator {
                    if let Some(text) = &current {
                        println!("  ({})", text);
                    }
                    indicator = current;
                }
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let app = match open_app(&args).await {
        Ok(app) => app,
        Err(err) => {
            eprintln!("Failed to initialize Recetario: {}", err);
            std::process::exit(1);
        }
    };

    let signed_in = app.auth().sign_in(&args.email, &args.password).await;
    if !signed_in.success {
        eprintln!(
            "Sign in failed: {}",
            signed_in.error.unwrap_or_default()
        );
        std::process::exit(1);
    }

    let session = app.chat_session().await;
    let printer = spawn_printer(&session);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                session.notify_typing().await;
                let outcome = session.send(&line).await;
                if let Some(error) = outcome.error {
                    eprintln!("! {}", error);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await;
    printer.abort();
    tracing::info!(target: "recetario::cli", "Chat closed");
    Ok(())
}
