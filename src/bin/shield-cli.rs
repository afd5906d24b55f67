use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "shield-cli")]
#[command(about = "Management CLI for the shield proxy admin API", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "SHIELD_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check proxy status
    Status,
    /// List active bans
    Bans,
    /// Ban an IP for the configured duration
    Ban { ip: String },
    /// Lift a ban
    Unban { ip: String },
    /// List middleware, or show the effective chain for a phase
    Middleware {
        #[arg(long)]
        phase: Option<String>,
        #[arg(long)]
        route: Option<String>,
    },
    /// Activate a middleware
    Enable { name: String },
    /// Disable a middleware
    Disable { name: String },
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

    let base = cli.url.trim_end_matches('/');
    let (method, path, query) = match cli.command {
        Commands::Status => (Method::GET, "/admin/status".to_string(), Vec::new()),
        Commands::Bans => (Method::GET, "/admin/bans".to_string(), Vec::new()),
        Commands::Ban { ip } => (Method::POST, format!("/admin/bans/{ip}"), Vec::new()),
        Commands::Unban { ip } => (Method::DELETE, format!("/admin/bans/{ip}"), Vec::new()),
        Commands::Middleware { phase, route } => {
            let query: Vec<(&str, String)> = [("phase", phase), ("route", route)]
                .into_iter()
                .filter_map(|(k, v)| v.map(|v| (k, v)))
                .collect();
            (Method::GET, "/admin/middleware".to_string(), query)
        }
        Commands::Enable { name } => (Method::PUT, format!("/admin/middleware/{name}/active"), Vec::new()),
        Commands::Disable { name } => (Method::PUT, format!("/admin/middleware/{name}/disabled"), Vec::new()),
    };

    let res = client
        .request(method, format!("{base}{path}"))
        .query(&query)
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
