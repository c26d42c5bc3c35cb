use std::{io::BufRead, path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use client_core::{
    load_settings, AppContext, AuthProvider, AuthState, BackendClient, Services, SessionStore,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use shared::{
    domain::{BillingCycle, CompanyId, CompanyStatus, GroupId},
    protocol::{NewCompany, NewPlan},
};
use storage::Storage;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_SESSION_DB: &str = "sqlite://admin-session.db";

#[derive(Parser, Debug)]
#[command(about = "Tenant administration console")]
struct Cli {
    /// TOML settings file (defaults to ./admin.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,
    /// SQLite url used to keep the signed-in session between runs.
    #[arg(long)]
    session_db: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        #[arg(long)]
        email: String,
        /// Read from stdin when omitted.
        #[arg(long)]
        password: Option<String>,
    },
    Logout,
    Whoami,
    #[command(subcommand)]
    Companies(CompanyCommand),
    #[command(subcommand)]
    Plans(PlanCommand),
    #[command(subcommand)]
    Templates(ScopedCommand),
    #[command(subcommand)]
    Connections(ScopedCommand),
    #[command(subcommand)]
    Messages(MessageCommand),
}

#[derive(Subcommand, Debug)]
enum CompanyCommand {
    List {
        #[arg(long, value_parser = parse_enum::<CompanyStatus>)]
        status: Option<CompanyStatus>,
    },
    Get {
        id: Uuid,
    },
    Create(CreateCompany),
    Delete {
        id: Uuid,
    },
}

#[derive(Args, Debug)]
struct CreateCompany {
    #[arg(long)]
    name: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    phone: Option<String>,
    #[arg(long)]
    document: Option<String>,
    #[arg(long)]
    plan_id: Option<Uuid>,
    #[arg(long)]
    max_users: Option<u32>,
    #[arg(long, value_parser = parse_enum::<CompanyStatus>, default_value = "active")]
    status: CompanyStatus,
}

#[derive(Subcommand, Debug)]
enum PlanCommand {
    List {
        #[arg(long)]
        active: bool,
    },
    Get {
        id: Uuid,
    },
    Create(CreatePlan),
    Delete {
        id: Uuid,
    },
}

#[derive(Args, Debug)]
struct CreatePlan {
    #[arg(long)]
    name: String,
    #[arg(long)]
    price: f64,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, value_parser = parse_enum::<BillingCycle>, default_value = "monthly")]
    billing_cycle: BillingCycle,
    #[arg(long = "feature")]
    features: Vec<String>,
    #[arg(long)]
    max_companies: Option<u32>,
    #[arg(long)]
    max_messages: Option<u32>,
    #[arg(long)]
    inactive: bool,
}

/// Commands for entities owned by a company.
#[derive(Subcommand, Debug)]
enum ScopedCommand {
    List {
        #[arg(long)]
        company: Option<Uuid>,
    },
    Get {
        id: Uuid,
    },
    Delete {
        id: Uuid,
    },
}

#[derive(Subcommand, Debug)]
enum MessageCommand {
    List {
        #[arg(long)]
        company: Option<Uuid>,
    },
    Get {
        id: Uuid,
    },
    Delete {
        id: Uuid,
    },
    Estimate {
        #[arg(long)]
        company: Uuid,
        #[arg(long = "group", required = true)]
        groups: Vec<Uuid>,
    },
    Dispatch {
        id: Uuid,
    },
}

fn parse_enum<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_value(Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| format!("unsupported value '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let settings = load_settings(cli.config.as_deref()).context("failed to load settings")?;
    let backend_config = settings.backend_config()?;
    let session_db = cli
        .session_db
        .or_else(|| settings.session_db_url.clone())
        .unwrap_or_else(|| DEFAULT_SESSION_DB.to_string());
    let storage = Storage::new(&session_db)
        .await
        .with_context(|| format!("failed to open session store {session_db}"))?;
    let client = Arc::new(
        BackendClient::new(&backend_config)?.with_storage(storage, settings.session_key.clone()),
    );
    info!(backend = %backend_config.base_url, "admin: starting");

    let provider = AuthProvider::start(Arc::clone(&client) as Arc<dyn SessionStore>);
    let context = AppContext::new(provider.handle(), Arc::clone(&client));
    let outcome = run(&context, cli.command).await;
    provider.shutdown().await;

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(context: &AppContext, command: Command) -> Result<Value> {
    let auth = context.use_auth()?;
    let initial = auth.ready().await?;
    if let Some(err) = &initial.error {
        warn!(error = %err, "admin: session check failed");
    }

    match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => read_password()?,
            };
            if let Err(err) = auth.login(&email, &password).await {
                if err.is_credential_rejection() {
                    bail!("login rejected for {email}: check the email and password");
                }
                return Err(err.into());
            }
            let state = auth.wait_until(|s| s.user.is_some() || s.error.is_some()).await?;
            Ok(describe(&state))
        }
        Command::Logout => {
            auth.logout().await?;
            let state = auth.wait_until(|s| s.user.is_none() && !s.is_loading).await?;
            Ok(describe(&state))
        }
        Command::Whoami => Ok(describe(&initial)),
        Command::Companies(command) => companies(&context.services()?, command).await,
        Command::Plans(command) => plans(&context.services()?, command).await,
        Command::Templates(command) => {
            let templates = context.services()?.templates;
            match command {
                ScopedCommand::List { company: Some(id) } => {
                    to_json(templates.list_for_company(id.into()).await?)
                }
                ScopedCommand::List { company: None } => to_json(templates.list().await?),
                ScopedCommand::Get { id } => to_json(templates.get(id.into()).await?),
                ScopedCommand::Delete { id } => {
                    templates.delete(id.into()).await?;
                    Ok(json!({ "deleted": id }))
                }
            }
        }
        Command::Connections(command) => {
            let connections = context.services()?.connections;
            match command {
                ScopedCommand::List { company: Some(id) } => {
                    to_json(connections.list_for_company(id.into()).await?)
                }
                ScopedCommand::List { company: None } => to_json(connections.list().await?),
                ScopedCommand::Get { id } => to_json(connections.get(id.into()).await?),
                ScopedCommand::Delete { id } => {
                    connections.delete(id.into()).await?;
                    Ok(json!({ "deleted": id }))
                }
            }
        }
        Command::Messages(command) => messages(&context.services()?, command).await,
    }
}

async fn companies(services: &Services, command: CompanyCommand) -> Result<Value> {
    let companies = &services.companies;
    match command {
        CompanyCommand::List { status: Some(status) } => {
            to_json(companies.list_by_status(status).await?)
        }
        CompanyCommand::List { status: None } => to_json(companies.list().await?),
        CompanyCommand::Get { id } => to_json(companies.get(id.into()).await?),
        CompanyCommand::Create(args) => {
            let company = NewCompany {
                name: args.name,
                email: args.email,
                phone: args.phone,
                document: args.document,
                plan_id: args.plan_id.map(Into::into),
                status: args.status,
                max_users: args.max_users,
            };
            to_json(companies.create(&company).await?)
        }
        CompanyCommand::Delete { id } => {
            companies.delete(id.into()).await?;
            Ok(json!({ "deleted": id }))
        }
    }
}

async fn plans(services: &Services, command: PlanCommand) -> Result<Value> {
    let plans = &services.plans;
    match command {
        PlanCommand::List { active: true } => to_json(plans.list_active().await?),
        PlanCommand::List { active: false } => to_json(plans.list().await?),
        PlanCommand::Get { id } => to_json(plans.get(id.into()).await?),
        PlanCommand::Create(args) => {
            let plan = NewPlan {
                name: args.name,
                description: args.description,
                price: args.price,
                billing_cycle: args.billing_cycle,
                features: args.features,
                max_companies: args.max_companies,
                max_messages: args.max_messages,
                is_active: !args.inactive,
            };
            to_json(plans.create(&plan).await?)
        }
        PlanCommand::Delete { id } => {
            plans.delete(id.into()).await?;
            Ok(json!({ "deleted": id }))
        }
    }
}

async fn messages(services: &Services, command: MessageCommand) -> Result<Value> {
    let messages = &services.messages;
    match command {
        MessageCommand::List { company: Some(id) } => {
            to_json(messages.list_for_company(id.into()).await?)
        }
        MessageCommand::List { company: None } => to_json(messages.list().await?),
        MessageCommand::Get { id } => to_json(messages.get(id.into()).await?),
        MessageCommand::Delete { id } => {
            messages.delete(id.into()).await?;
            Ok(json!({ "deleted": id }))
        }
        MessageCommand::Estimate { company, groups } => {
            let groups: Vec<GroupId> = groups.into_iter().map(GroupId::from).collect();
            let company = CompanyId::from(company);
            let recipients = messages.estimate_recipients(company, &groups).await?;
            Ok(json!({ "company_id": company, "groups": groups, "recipients": recipients }))
        }
        MessageCommand::Dispatch { id } => to_json(messages.dispatch(id.into()).await?),
    }
}

fn describe(state: &AuthState) -> Value {
    json!({
        "phase": format!("{:?}", state.phase()),
        "user": state.user,
        "profile": state.profile,
        "error": state.error.as_ref().map(ToString::to_string),
    })
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).context("failed to encode output")
}

fn read_password() -> Result<String> {
    eprint!("password: ");
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("password must not be empty");
    }
    Ok(password)
}
