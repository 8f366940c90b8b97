use std::sync::Arc;

use clap::{Parser, Subcommand};
use coursedesk::{
    AuthError, CatalogClient, CatalogError, ConfigError, CourseDraft, Decision, FileStore, HttpAuthApi,
    IdentityProvider, RegisterError, RouteTable, SessionConfig, SessionManager, StaticTokenProvider, SubjectDraft,
    Transport, User,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("sign-in failed: {0}")]
    Auth(#[from] AuthError),
    #[error("registration failed: {0}")]
    Register(#[from] RegisterError),
    #[error("catalog request failed: {0}")]
    Catalog(#[from] CatalogError),
    #[error("not signed in; run `coursedesk login` first")]
    NotSignedIn,
    #[error("federated sign-in task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "coursedesk", about = "Course dashboard session and catalog CLI")]
struct Cli {
    /// Overrides `COURSEDESK_API_URL`.
    #[arg(long)]
    api_url: Option<String>,

    /// Overrides `COURSEDESK_STORE_PATH`.
    #[arg(long)]
    store_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in with email and password.
    Login {
        email: String,
        #[arg(long, env = "COURSEDESK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and sign in.
    Register {
        email: String,
        #[arg(long, env = "COURSEDESK_PASSWORD", hide_env_values = true)]
        password: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
    },
    Logout,
    /// Print the signed-in user.
    Whoami,
    /// Exchange a token from the identity provider for a session.
    Federated {
        #[arg(long, env = "COURSEDESK_PROVIDER_TOKEN", hide_env_values = true)]
        provider_token: String,
    },
    /// Show what the dashboard would do when navigating to `path`.
    Route { path: String },
    Subjects,
    CreateSubject {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    UpdateSubject {
        id: i64,
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    Courses,
    Course { id: i64 },
    /// Create a course from a JSON draft (`{"name": ..., "minQuantity": ...}`).
    CreateCourse {
        #[arg(long)]
        data: String,
    },
    /// Replace a course with a JSON draft.
    UpdateCourse {
        id: i64,
        #[arg(long)]
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let dotenv = dotenvy::dotenv();
    init_tracing();
    if let Err(e) = dotenv {
        if !e.not_found() {
            tracing::warn!(error = %e, "ignoring unreadable .env file");
        }
    }

    let cli = Cli::parse();
    let config = load_config(&cli)?;
    tracing::debug!(api_url = %config.api_url, store = %config.store_path.display(), "configured");

    let session = build_session(&config, &cli.command)?;
    session.initialize().await;

    run(&session, cli.command).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Flags win over the environment.
fn load_config(cli: &Cli) -> Result<SessionConfig, ConfigError> {
    let overrides = [
        ("COURSEDESK_API_URL", cli.api_url.as_deref()),
        ("COURSEDESK_STORE_PATH", cli.store_path.as_deref()),
    ];
    SessionConfig::from_vars(|key| {
        overrides
            .iter()
            .find(|(name, _)| *name == key)
            .and_then(|(_, value)| value.map(str::to_owned))
            .or_else(|| std::env::var(key).ok())
    })
}

fn build_session(config: &SessionConfig, command: &Command) -> Result<SessionManager, CliError> {
    let transport = Transport::from_config(config)?;
    let api = Arc::new(HttpAuthApi::new(transport.clone()));
    let store = Arc::new(FileStore::new(&config.store_path));
    let provider: Option<Arc<dyn IdentityProvider>> = match command {
        Command::Federated { provider_token } => Some(Arc::new(StaticTokenProvider::new(provider_token.clone()))),
        _ => None,
    };
    Ok(SessionManager::new(api, store, transport, provider))
}

async fn run(session: &SessionManager, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login { email, password } => {
            let user = session.login(&email, &password).await?;
            print_json(&user)
        }
        Command::Register {
            email,
            password,
            first_name,
            last_name,
        } => match session.register(&email, &password, &first_name, &last_name).await {
            Ok(user) => print_json(&user),
            Err(RegisterError::Validation(v)) => {
                for field in &v.fields {
                    eprintln!("  {}: {}", field.field, field.message);
                }
                Err(RegisterError::Validation(v).into())
            }
            Err(e) => Err(e.into()),
        },
        Command::Logout => {
            let was_signed_in = session.snapshot().is_authenticated();
            session.logout();
            println!("{}", if was_signed_in { "signed out" } else { "not signed in" });
            Ok(())
        }
        Command::Whoami => {
            let user = signed_in_user(session)?;
            print_json(&user)
        }
        Command::Federated { .. } => {
            let user = session.federated_login().await??;
            print_json(&user)
        }
        Command::Route { path } => {
            match RouteTable::default().evaluate(&session.snapshot(), &path) {
                Decision::Loading => println!("loading"),
                Decision::Render => println!("render {path}"),
                Decision::Redirect { to, return_to: Some(from) } => println!("redirect {to} (return to {from})"),
                Decision::Redirect { to, return_to: None } => println!("redirect {to}"),
            }
            Ok(())
        }
        Command::Subjects => {
            let catalog = catalog(session)?;
            let subjects = expire_on_unauthorized(session, catalog.subjects().await)?;
            print_json(&subjects)
        }
        Command::CreateSubject { name, description } => {
            let catalog = catalog(session)?;
            let draft = SubjectDraft { name, description };
            let subject = expire_on_unauthorized(session, catalog.create_subject(&draft).await)?;
            print_json(&subject)
        }
        Command::UpdateSubject { id, name, description } => {
            let catalog = catalog(session)?;
            let draft = SubjectDraft { name, description };
            let subject = expire_on_unauthorized(session, catalog.update_subject(id, &draft).await)?;
            print_json(&subject)
        }
        Command::CreateCourse { data } => {
            let catalog = catalog(session)?;
            let draft = serde_json::from_str::<CourseDraft>(&data)?;
            let course = expire_on_unauthorized(session, catalog.create_course(&draft).await)?;
            print_json(&course)
        }
        Command::UpdateCourse { id, data } => {
            let catalog = catalog(session)?;
            let draft = serde_json::from_str::<CourseDraft>(&data)?;
            let course = expire_on_unauthorized(session, catalog.update_course(id, &draft).await)?;
            print_json(&course)
        }
        Command::Courses => {
            let catalog = catalog(session)?;
            let courses = expire_on_unauthorized(session, catalog.courses().await)?;
            print_json(&courses)
        }
        Command::Course { id } => {
            let catalog = catalog(session)?;
            let course = expire_on_unauthorized(session, catalog.course(id).await)?;
            print_json(&course)
        }
    }
}

fn signed_in_user(session: &SessionManager) -> Result<User, CliError> {
    session.snapshot().user().cloned().ok_or(CliError::NotSignedIn)
}

fn catalog(session: &SessionManager) -> Result<CatalogClient, CliError> {
    signed_in_user(session)?;
    Ok(CatalogClient::new(session.transport().clone()))
}

/// A 401 from the catalog means the server no longer honours the stored
/// credential; drop it so the next run starts signed out.
fn expire_on_unauthorized<T>(session: &SessionManager, result: Result<T, CatalogError>) -> Result<T, CliError> {
    if matches!(result, Err(CatalogError::Unauthorized)) {
        session.logout();
    }
    Ok(result?)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
