use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "intercept-cli")]
#[command(about = "Management CLI for the interception server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "INTERCEPT_API_KEY", default_value = "CHANGE_ME")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Server status and record counts
    Status,
    /// Recorded requests, or one of them by id
    Requests { id: Option<String> },
    /// Requests no injector answered
    Errors,
    /// Recorded WebSocket messages
    Messages,
    /// Drop every recorded request, error and message
    Clear,
    /// List injectors, or show one with its options
    Injectors { name: Option<String> },
    /// Turn an injector on
    Enable { name: String },
    /// Turn an injector off
    Disable { name: String },
    /// Set injector options from a JSON object, e.g. '{"delay": true}'
    Configure { name: String, options: String },
    /// Live WebSocket sessions
    Sessions,
    /// Close a WebSocket session
    Disconnect { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    let (method, path, body) = match cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string(), None),
        Commands::Requests { id: None } => (Method::GET, "/admin/requests".to_string(), None),
        Commands::Requests { id: Some(id) } => (Method::GET, format!("/admin/requests/{id}"), None),
        Commands::Errors => (Method::GET, "/admin/errors".to_string(), None),
        Commands::Messages => (Method::GET, "/admin/messages".to_string(), None),
        Commands::Clear => (Method::DELETE, "/admin/records".to_string(), None),
        Commands::Injectors { name: None } => (Method::GET, "/admin/injectors".to_string(), None),
        Commands::Injectors { name: Some(name) } => {
            (Method::GET, format!("/admin/injectors/{name}"), None)
        }
        Commands::Enable { name } => (
            Method::PUT,
            format!("/admin/injectors/{name}/active"),
            Some(json!({"active": true})),
        ),
        Commands::Disable { name } => (
            Method::PUT,
            format!("/admin/injectors/{name}/active"),
            Some(json!({"active": false})),
        ),
        Commands::Configure { name, options } => {
            let options: Value = serde_json::from_str(&options)?;
            (Method::PUT, format!("/admin/injectors/{name}"), Some(options))
        }
        Commands::Sessions => (Method::GET, "/admin/sessions".to_string(), None),
        Commands::Disconnect { id } => (Method::DELETE, format!("/admin/sessions/{id}"), None),
    };

    let mut request = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers);
    if let Some(body) = body {
        request = request.json(&body);
    }
    print_response(request.send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: management API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    if status == reqwest::StatusCode::NO_CONTENT {
        println!("OK");
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
