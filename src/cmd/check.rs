//! Configuration and connectivity check — `storygen check`.
//!
//! Prints the resolved configuration, then probes outbound HTTPS and the
//! Gemini models endpoint. Probe failures are reported but do not fail the
//! command; the point is to show the operator what the gateway will see.

use std::time::Duration;

use anyhow::Result;
use console::style;

use storygen::config::AppConfig;
use storygen::genai::GeminiClient;

pub async fn cmd_check(config: &AppConfig) -> Result<()> {
    println!("{}", style("Configuration").bold());
    println!("  port:          {}", config.server.port);
    println!("  frontend url:  {}", config.server.frontend_url);
    println!("  story model:   {}", config.models.story_model);
    println!("  image model:   {}", config.models.image_model);
    println!(
        "  project id:    {}",
        config.google.project_id.as_deref().unwrap_or("<unset>")
    );
    println!(
        "  bucket:        {}",
        config.google.bucket.as_deref().unwrap_or("<unset>")
    );
    println!("  location:      {}", config.google.location);
    println!("  vertex mode:   {}", config.google.use_vertex);
    println!(
        "  api key:       {}",
        if config.google.api_key.is_some() {
            "set"
        } else {
            "<unset>"
        }
    );
    println!(
        "  images:        {}",
        if config.images_enabled() {
            "enabled"
        } else {
            "disabled (no project id)"
        }
    );
    println!();

    println!("{}", style("Connectivity").bold());
    let http = reqwest::Client::new();
    match http
        .get("https://www.google.com")
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => println!(
            "  {} outbound HTTPS ({})",
            style("ok").green(),
            resp.status().as_u16()
        ),
        Err(e) => println!("  {} outbound HTTPS: {e}", style("failed").red()),
    }

    if config.google.api_key.is_some() {
        let client = GeminiClient::new(&config.google);
        match client.count_models().await {
            Ok(count) => println!(
                "  {} Gemini API reachable ({count} models visible)",
                style("ok").green()
            ),
            Err(e) => println!("  {} Gemini API: {e}", style("failed").red()),
        }
    } else {
        println!(
            "  {} no API key set; skipping Gemini API probe",
            style("--").dim()
        );
    }

    Ok(())
}
