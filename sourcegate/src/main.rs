//! Command-line access to databases, OpenAPI services and document
//! libraries.
//!
//! Every subcommand that touches a datasource opens one session, runs one
//! operation and closes the session before printing the result as pretty
//! JSON on stdout. Logs go to stderr.
//!
//! # Security Guarantees
//! - SQL passes the read-only gate before any backend sees it
//! - URLs are sanitized in logs and error messages
//! - Interactive passwords are zeroized after use

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value as JsonValue, json};
use sourcegate_core::{
    ApiRequest, ApiSource, DatabaseSource, LibrarySource, SearchMode, SearchRequest, Session,
    SessionConfig, adapters::{ENGINES, lookup_engine}, classify, logging::init_logging, safety::Query,
    sanitize_url, security::StaticSecret,
};
use std::sync::Arc;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "sourcegate")]
#[command(about = "Read-only access to databases, APIs and document libraries")]
#[command(version)]
#[command(long_about = "
SourceGate - read-only access to heterogeneous datasources

The datasource kind is decided by the URL:
- http(s):// URLs and file:// URLs ending in .json/.yaml/.yml are OpenAPI specs
- other file:// URLs are document libraries
- every other scheme is a database driver

SECURITY FEATURES:
- Only SELECT, WITH, SHOW, DESCRIBE and EXPLAIN statements are executed
- Credentials are masked in logs and errors
- {password} in a URL is filled from DATABASE_PASSWORD or --ask-password

EXAMPLES:
  sourcegate --url sqlite:///data/app.db tables --pattern order
  sourcegate --url 'postgresql://app:{password}@db:5432/shop?ssh_host=bastion&ssh_user=ops' query 'SELECT 1'
  sourcegate --url file:///srv/specs/petstore.yaml endpoint GET /pets
  sourcegate --url file:///srv/docs/ read guide.md --pagination 0.5
")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    /// Datasource URL
    #[arg(
        long,
        global = true,
        env = "SOURCEGATE_URL",
        help = "Datasource URL (credentials will be sanitized in logs)"
    )]
    url: Option<String>,

    /// Prompt for the database password
    #[arg(
        long,
        global = true,
        help = "Prompt for the password substituted into {password}"
    )]
    ask_password: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all logs except errors")]
    quiet: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true, help = "Emit logs as one JSON object per line")]
    log_json: bool,
}

#[derive(Args, Clone)]
struct SearchArgs {
    /// Search pattern
    #[arg(long, help = "Rank names against this pattern instead of listing all")]
    pattern: Option<String>,

    /// Search algorithm
    #[arg(long, default_value_t = SearchMode::Bm25, help = "regex, bm25 or jaro_winkler")]
    mode: SearchMode,

    /// Maximum number of results
    #[arg(long, default_value = "10", help = "Maximum number of search results")]
    limit: usize,
}

impl SearchArgs {
    fn request(&self) -> Option<SearchRequest> {
        self.pattern
            .as_ref()
            .map(|pattern| SearchRequest::new(pattern.clone(), self.mode, self.limit))
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print the datasource kind of the URL
    Classify,
    /// Print the URL with credentials masked
    Sanitize,
    /// List or search database tables
    Tables(SearchArgs),
    /// Describe the columns of a table
    Inspect {
        /// Table path, e.g. `orders` or `sales.public.orders`
        table: String,
    },
    /// Fetch a few rows of a table
    Sample {
        /// Table path
        table: String,
        /// Number of rows
        #[arg(short, long, help = "Number of rows (default 5, at most 100)")]
        n: Option<usize>,
    },
    /// Run a read-only SQL statement
    Query {
        /// SQL text
        sql: String,
    },
    /// List or search API endpoints
    Endpoints(SearchArgs),
    /// Show the OpenAPI operation of one endpoint
    Endpoint {
        /// HTTP method
        method: String,
        /// Path as written in the OpenAPI document, e.g. `/pets/{id}`
        path: String,
    },
    /// Send a request to the API
    Request(RequestArgs),
    /// List, search or glob library documents
    Documents {
        #[command(flatten)]
        search: SearchArgs,
        /// Glob over relative paths
        #[arg(long, conflicts_with = "pattern", help = "Glob such as docs/**/*.md")]
        glob: Option<String>,
    },
    /// Read one section of a document
    Read {
        /// Path relative to the library root
        path: String,
        /// Section number (1-based) or position in [0, 1)
        #[arg(
            short,
            long,
            allow_negative_numbers = true,
            help = "Section number (1, 2, ...) or position between 0 and 1"
        )]
        pagination: Option<f64>,
    },
    /// Check whether SQL would pass the read-only gate
    CheckSql {
        /// SQL text
        sql: String,
        /// Driver whose dialect decides statement boundaries (all dialects when omitted)
        #[arg(short, long)]
        engine: Option<String>,
    },
    /// Print the database engine table
    Engines,
}

#[derive(Args)]
struct RequestArgs {
    /// HTTP method
    method: String,
    /// Request path
    path: String,
    /// Query parameter
    #[arg(long = "param", value_parser = parse_pair, help = "Query parameter as key=value")]
    params: Vec<(String, String)>,
    /// Request header
    #[arg(long = "header", value_parser = parse_pair, help = "Header as key=value")]
    headers: Vec<(String, String)>,
    /// JSON body
    #[arg(long, value_parser = parse_json, help = "JSON request body")]
    body: Option<JsonValue>,
}

impl RequestArgs {
    fn to_request(&self) -> ApiRequest {
        let mut request = ApiRequest::new(&self.method, &self.path);
        request.body.clone_from(&self.body);
        request.params.extend(self.params.iter().cloned());
        request.headers.extend(self.headers.iter().cloned());
        request
    }
}

/// Parses `key=value`.
fn parse_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn parse_json(raw: &str) -> Result<JsonValue, String> {
    serde_json::from_str(raw).map_err(|e| format!("invalid JSON body: {e}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_logging(cli.global.verbose, cli.global.quiet, cli.global.log_json)?;

    let output = run(&cli).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(cli: &Cli) -> anyhow::Result<JsonValue> {
    match &cli.command {
        Command::CheckSql { sql, engine } => return check_sql(sql, engine.as_deref()),
        Command::Engines => return Ok(serde_json::to_value(ENGINES)?),
        _ => {}
    }

    let Some(url) = cli.url.as_deref() else {
        bail!("a datasource URL is required (--url or SOURCEGATE_URL)");
    };

    match &cli.command {
        Command::Classify => Ok(json!({
            "url": sanitize_url(url),
            "kind": classify(url)?,
        })),
        Command::Sanitize => Ok(json!({ "url": sanitize_url(url) })),
        command => {
            let session = open_session(cli.ask_password)?;
            tracing::debug!(session = %session.id(), url = %sanitize_url(url), "Running command");
            let outcome = execute(&session, url, command).await;
            session.close().await;
            outcome
        }
    }
}

fn open_session(ask_password: bool) -> anyhow::Result<Session> {
    let session = Session::new(SessionConfig::default())?;
    if !ask_password {
        return Ok(session);
    }

    let password = Zeroizing::new(
        rpassword::prompt_password("Database password: ").context("Failed to read password")?,
    );
    if password.is_empty() {
        bail!("Password cannot be empty");
    }
    Ok(session.with_secrets(Arc::new(StaticSecret::new(password.as_str()))))
}

async fn execute(session: &Session, url: &str, command: &Command) -> anyhow::Result<JsonValue> {
    let source = session.get_or_create(url).await?;

    let value = match command {
        Command::Tables(search) => {
            let database = source.as_database()?;
            let tables = match search.request() {
                Some(request) => database.search_tables(&request).await?,
                None => database.list_tables().await?,
            };
            serde_json::to_value(tables)?
        }
        Command::Inspect { table } => {
            serde_json::to_value(source.as_database()?.inspect_table(table).await?)?
        }
        Command::Sample { table, n } => {
            serde_json::to_value(source.as_database()?.sample_table(table, *n).await?)?
        }
        Command::Query { sql } => serde_json::to_value(source.as_database()?.query(sql).await?)?,
        Command::Endpoints(search) => {
            let api = source.as_api()?;
            let endpoints = match search.request() {
                Some(request) => api.search_endpoints(&request)?,
                None => api.endpoints(),
            };
            serde_json::to_value(endpoints)?
        }
        Command::Endpoint { method, path } => source.as_api()?.inspect_endpoint(method, path)?,
        Command::Request(args) => {
            serde_json::to_value(source.as_api()?.request(args.to_request()).await?)?
        }
        Command::Documents { search, glob } => {
            let library = source.as_library()?;
            let documents = match (glob, search.request()) {
                (Some(glob), _) => library.glob_documents(glob).await?,
                (None, Some(request)) => library.search_documents(&request).await?,
                (None, None) => library.documents().await?,
            };
            serde_json::to_value(documents)?
        }
        Command::Read { path, pagination } => {
            serde_json::to_value(source.as_library()?.read_document(path, *pagination).await?)?
        }
        Command::Classify | Command::Sanitize | Command::CheckSql { .. } | Command::Engines => {
            bail!("command does not operate on a datasource")
        }
    };
    Ok(value)
}

fn check_sql(sql: &str, engine: Option<&str>) -> anyhow::Result<JsonValue> {
    let query = match engine {
        Some(driver) => Query::for_backend(lookup_engine(driver)?.backend, sql),
        None => Query::new(sql),
    };
    Ok(match query.ensure_read_only() {
        Ok(()) => json!({ "readOnly": true }),
        Err(e) => json!({ "readOnly": false, "reason": e.to_string() }),
    })
}
