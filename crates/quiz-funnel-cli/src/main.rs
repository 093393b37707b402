use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use quiz_funnel_api::{ApiError, CompleteRequest, QuizApi, SessionRequest};
use quiz_funnel_core::{derive_idempotency_key, AnswerMap, ResultId, SessionId};

#[derive(Debug, Parser)]
#[command(name = "qf")]
#[command(about = "Quiz funnel ops CLI")]
struct Cli {
    #[arg(long, default_value = "./quiz_funnel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create or reuse an anonymous quiz session.
    Session(SessionArgs),
    /// Submit a completed quiz from an answers JSON file.
    Submit(SubmitArgs),
    /// Derive the idempotency key for a submission without touching the store.
    DeriveKey(DeriveKeyArgs),
    /// Fetch a stored result by id.
    Result(ResultArgs),
}

#[derive(Debug, Args)]
struct SessionArgs {
    #[arg(long)]
    fingerprint: String,
    #[arg(long)]
    session: Option<String>,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    session: String,
    #[arg(long)]
    fingerprint: String,
    /// Path to a JSON file mapping question ids to answer entries.
    #[arg(long)]
    answers: PathBuf,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    duration_seconds: Option<i64>,
    #[arg(long)]
    utm_source: Option<String>,
    #[arg(long)]
    utm_medium: Option<String>,
    #[arg(long)]
    utm_campaign: Option<String>,
}

#[derive(Debug, Args)]
struct DeriveKeyArgs {
    #[arg(long)]
    session: String,
    #[arg(long)]
    fingerprint: String,
    #[arg(long)]
    answers: PathBuf,
}

#[derive(Debug, Args)]
struct ResultArgs {
    #[arg(long)]
    result_id: String,
    #[arg(long)]
    session: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = QuizApi::new(cli.db);

    match cli.command {
        Command::Session(args) => run_session(&api, &args),
        Command::Submit(args) => run_submit(&api, &args),
        Command::DeriveKey(args) => run_derive_key(&args),
        Command::Result(args) => run_result(&api, &args),
    }
}

fn run_session(api: &QuizApi, args: &SessionArgs) -> Result<()> {
    let session_id = args.session.as_deref().map(parse_session_id).transpose()?;
    let response = api
        .session(&SessionRequest { session_id, fingerprint_hash: args.fingerprint.clone() })
        .map_err(describe_api_error)?;
    print_json(&response)
}

fn run_submit(api: &QuizApi, args: &SubmitArgs) -> Result<()> {
    let request = CompleteRequest {
        session_id: parse_session_id(&args.session)?,
        fingerprint_hash: args.fingerprint.clone(),
        answers: read_answers(&args.answers)?,
        idempotency_key: None,
        email: args.email.clone(),
        duration_seconds: args.duration_seconds,
        utm_source: args.utm_source.clone(),
        utm_medium: args.utm_medium.clone(),
        utm_campaign: args.utm_campaign.clone(),
    };

    let response = api.complete(&request).map_err(describe_api_error)?;
    print_json(&response)
}

fn run_derive_key(args: &DeriveKeyArgs) -> Result<()> {
    // Hash the canonical form of the id, not the raw argument, so the
    // printed key matches what `submit` stores.
    let session_id = parse_session_id(&args.session)?;
    let answers = read_answers(&args.answers)?;
    let key = derive_idempotency_key(&session_id.to_string(), &args.fingerprint, &answers)?;
    print_json(&serde_json::json!({ "idempotencyKey": key }))
}

fn run_result(api: &QuizApi, args: &ResultArgs) -> Result<()> {
    let result_id = ResultId::parse(&args.result_id)
        .ok_or_else(|| anyhow!("invalid result id: {}", args.result_id))?;
    let session_id = args.session.as_deref().map(parse_session_id).transpose()?;

    let response = api.result(result_id, session_id).map_err(describe_api_error)?;
    print_json(&response)
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    SessionId::parse(raw).ok_or_else(|| anyhow!("invalid session id: {raw}"))
}

fn read_answers(path: &Path) -> Result<AnswerMap> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read answers file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse answers JSON {}", path.display()))
}

fn describe_api_error(err: ApiError) -> anyhow::Error {
    anyhow!("{}: {err}", err.code())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{body}");
    Ok(())
}
