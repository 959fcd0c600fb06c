//! Basic producer/consumer example.
//!
//! This example demonstrates:
//! - Putting JSON job payloads on a tube
//! - Reserving them from a second connection watching that tube
//! - Deleting jobs once handled, and burying the ones that fail
//!
//! Needs a running beanstalkd. Run with:
//! `BEANSTALKD_ADDR=127.0.0.1:11300 cargo run --example basic`

use serde::{Deserialize, Serialize};
use std::time::Duration;
use wg_beanstalkd::{Client, PutOptions};

const TUBE: &str = "emails";

/// Email notification job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailJob {
    to: String,
    subject: String,
}

/// Process an email job.
async fn process_email(job: &EmailJob) -> Result<(), String> {
    if !job.to.contains('@') {
        return Err(format!("invalid recipient {}", job.to));
    }
    println!("[email] sending to: {}", job.to);
    println!("        subject: {}", job.subject);

    // Simulate some work
    tokio::time::sleep(Duration::from_millis(200)).await;

    println!("[email] sent\n");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let addr = std::env::var("BEANSTALKD_ADDR").unwrap_or_else(|_| "127.0.0.1:11300".to_string());
    println!("wg-beanstalkd example against {addr}\n");

    let mut producer = Client::connect(&addr).await?;
    producer.use_tube(TUBE)?;

    let emails = vec![
        EmailJob {
            to: "alice@example.com".to_string(),
            subject: "Welcome!".to_string(),
        },
        EmailJob {
            to: "bob@example.com".to_string(),
            subject: "Your order shipped".to_string(),
        },
        EmailJob {
            to: "nobody".to_string(),
            subject: "This one fails".to_string(),
        },
    ];

    println!("Putting {} jobs...\n", emails.len());

    let options = PutOptions::with_priority(10).ttr(Duration::from_secs(30));
    for email in &emails {
        let body = serde_json::to_vec(email)?;
        let job_id = producer.put_with_options(&body, &options).await?;
        println!("  put: {}", job_id);
    }

    let stats = producer.stats_tube(TUBE).await?;
    println!(
        "\nReady on {TUBE}: {}",
        stats.get("current-jobs-ready").map(String::as_str).unwrap_or("?")
    );
    producer.close().await?;

    let mut consumer = Client::connect(&addr).await?;
    consumer.watch(TUBE)?;
    consumer.ignore("default")?;

    println!("\nConsuming until the tube stays empty for 2s\n");
    loop {
        let job = match consumer.reserve(Some(Duration::from_secs(2))).await {
            Ok(job) => job,
            Err(e) if e.is_timeout() => break,
            Err(e) => return Err(e.into()),
        };

        let email: EmailJob = match serde_json::from_slice(&job.body) {
            Ok(email) => email,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Burying undecodable job");
                consumer.bury(job.id, 0).await?;
                continue;
            }
        };

        match process_email(&email).await {
            Ok(()) => consumer.delete(job.id).await?,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Job failed, burying");
                consumer.bury(job.id, 0).await?;
            }
        }
    }

    consumer.close().await?;
    Ok(())
}
