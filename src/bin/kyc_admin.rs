use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use phantom_kyc::api::ADMIN_TOKEN_HEADER;
use phantom_kyc::kyc_service::{HealthState, KycHealth, OperatorAlert};
use phantom_kyc::signature::generate_webhook_secret;
use phantom_kyc::status_reconciler::SweepReport;
use reqwest::{Client, RequestBuilder};
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "kyc-admin",
    version = "0.1.0",
    about = "Operate a running Phantom KYC service"
)]
struct Args {
    /// Base URL of the KYC service
    #[arg(short, long, env = "KYC_SERVICE_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Admin token sent as X-Admin-Token
    #[arg(short, long, env = "ADMIN_TOKEN", default_value = "default-admin-token")]
    token: String,

    /// Request timeout in seconds
    #[arg(long, default_value = "120")]
    timeout: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the provider for pending verifications and apply new decisions
    CheckStatus {
        /// Only check this user's record
        #[arg(long)]
        user_id: Option<String>,

        /// Show what would change without saving
        #[arg(long)]
        dry_run: bool,
    },
    /// Show verification statistics
    Stats {
        /// Look-back period for recent records
        #[arg(long, default_value = "30")]
        days: i64,
    },
    /// Check stuck sessions, pending backlog and recent approval rate
    Health,
    /// List operator alerts raised by conflicting decisions
    Alerts,
    /// Print a new random webhook secret
    GenerateSecret,
}

fn setup_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,kyc_admin=debug"));

    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_level(true)
        .init();
}

struct AdminClient {
    client: Client,
    base_url: String,
    token: String,
}

impl AdminClient {
    fn new(base_url: String, token: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .header(ADMIN_TOKEN_HEADER, &self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .header(ADMIN_TOKEN_HEADER, &self.token)
    }
}

async fn send_json<T: serde::de::DeserializeOwned>(request: RequestBuilder) -> Result<T> {
    let response = request.send().await.context("Request failed")?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("Service returned {}: {}", status, body);
    }
    response.json().await.context("Failed to decode response")
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]")?);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(Duration::from_millis(120));
    Ok(spinner)
}

async fn check_status(admin: &AdminClient, user_id: Option<String>, dry_run: bool) -> Result<()> {
    let mut query: Vec<(&str, String)> = vec![("dry_run", dry_run.to_string())];
    if let Some(user_id) = &user_id {
        query.push(("user_id", user_id.clone()));
    }

    let progress = spinner("Checking pending verifications...")?;
    let report: SweepReport = send_json(admin.post("/admin/reconcile").query(&query)).await?;
    progress.finish_and_clear();

    if report.dry_run {
        for change in &report.planned {
            println!(
                "[DRY RUN] Would update {} ({}): {} -> {} (decision {})",
                change.user_id, change.record_id, change.from, change.to, change.decision
            );
        }
    }

    println!(
        "Checked {} records: {} updated, {} unchanged, {} failed, {} violations{}",
        report.examined,
        report.updated,
        report.unchanged,
        report.failed,
        report.violations,
        if report.dry_run { " (dry run)" } else { "" }
    );
    Ok(())
}

async fn show_stats(admin: &AdminClient, days: i64) -> Result<()> {
    let stats: serde_json::Value =
        send_json(admin.get("/admin/stats").query(&[("days", days)])).await?;

    println!("KYC statistics");
    println!("- Total records: {}", stats["total_records"]);
    println!("- Created in last {} days: {}", days, stats["recent_records"]);
    if let Some(by_status) = stats["by_status"].as_object() {
        for (status, count) in by_status {
            println!("  - {status}: {count}");
        }
    }
    let rate = stats["approval_rate"].as_f64().unwrap_or(0.0);
    println!("- Approval rate: {rate:.1}%");
    let minutes = stats["avg_processing_time_minutes"].as_f64().unwrap_or(0.0);
    println!("- Average processing time: {minutes:.2} minutes");
    Ok(())
}

async fn show_health(admin: &AdminClient) -> Result<()> {
    let health: KycHealth = send_json(admin.get("/admin/health")).await?;
    let label = match health.status {
        HealthState::Healthy => "healthy",
        HealthState::Degraded => "DEGRADED",
    };
    println!("KYC health: {label}");
    for issue in &health.issues {
        println!("  issue: {issue}");
    }
    for warning in &health.warnings {
        println!("  warning: {warning}");
    }
    if health.status == HealthState::Degraded {
        bail!("KYC service is degraded");
    }
    Ok(())
}

async fn show_alerts(admin: &AdminClient) -> Result<()> {
    let alerts: Vec<OperatorAlert> = send_json(admin.get("/admin/alerts")).await?;
    if alerts.is_empty() {
        println!("No operator alerts");
        return Ok(());
    }
    for alert in alerts {
        println!(
            "{} record {} (user {}): {} -> {} via {:?}: {}",
            alert.raised_at,
            alert.record_id,
            alert.user_id,
            alert.from,
            alert.attempted,
            alert.source,
            alert.detail
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    setup_tracing();
    let args = Args::parse();

    if let Command::GenerateSecret = args.command {
        println!("{}", generate_webhook_secret());
        return Ok(());
    }

    info!("Using KYC service at {}", args.url);
    let admin = AdminClient::new(args.url, args.token, Duration::from_secs(args.timeout))?;

    match args.command {
        Command::CheckStatus { user_id, dry_run } => check_status(&admin, user_id, dry_run).await,
        Command::Stats { days } => show_stats(&admin, days).await,
        Command::Health => show_health(&admin).await,
        Command::Alerts => show_alerts(&admin).await,
        Command::GenerateSecret => Ok(()),
    }
}
