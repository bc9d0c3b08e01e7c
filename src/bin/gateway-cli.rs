use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the service gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "GATEWAY_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check gateway status
    Status,
    /// List services with health, breaker state and load
    Services {
        /// Show a single service
        name: Option<String>,
    },
    /// List route rules
    Routes,
    /// Show WebSocket connection statistics
    Connections,
    /// Send a text message to matching WebSocket connections
    Broadcast {
        message: String,
        #[arg(long, conflicts_with_all = ["session", "service"])]
        user: Option<String>,
        #[arg(long, conflicts_with = "service")]
        session: Option<String>,
        #[arg(long)]
        service: Option<String>,
    },
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

    let request = match cli.command {
        Commands::Status => client.get(format!("{}/admin/status", cli.url)),
        Commands::Services { name: Some(name) } => {
            client.get(format!("{}/admin/services/{}", cli.url, name))
        }
        Commands::Services { name: None } => client.get(format!("{}/admin/services", cli.url)),
        Commands::Routes => client.get(format!("{}/admin/routes", cli.url)),
        Commands::Connections => client.get(format!("{}/admin/connections", cli.url)),
        Commands::Broadcast {
            message,
            user,
            session,
            service,
        } => client
            .post(format!("{}/admin/connections/broadcast", cli.url))
            .json(&json!({
                "message": message,
                "user_id": user,
                "session_id": session,
                "service": service,
            })),
    };

    let res = request.headers(headers).send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
