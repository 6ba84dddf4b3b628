use clap::Parser;

use showcase_worker::config::VerifyConfig;
use showcase_worker::telemetry;
use showcase_worker::verify::{self, RestClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = VerifyConfig::parse();

    telemetry::init(None)?;

    let client = RestClient::new(&config.url, &config.service_key, config.anon_key.as_deref());

    println!("Database verification report");
    println!("Database: {}", client.base_url());
    println!("Date: {}\n", chrono::Utc::now().to_rfc3339());

    let report = verify::run(&client).await;
    println!("{report}");

    if report.failed() == 0 && report.warnings() > 0 {
        println!("\n  Objects marked ⚠ need database admin access to confirm.");
    }

    std::process::exit(report.exit_code());
}
