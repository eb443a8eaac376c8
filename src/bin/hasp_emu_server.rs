use std::sync::Arc;

use anyhow::{Context, Result};
use hasp_emu::config::RunnerConfig;
use hasp_emu::loader::load_key_file;
use hasp_emu::transport;

#[tokio::main]
async fn main() -> Result<()> {
    let mut conf_file = "conf/runner.yaml".to_string();

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "--h" | "--?" | "/?" => {
                println!("Usage: hasp_emu_server [--conf FILE]");
                return Ok(());
            }
            "--conf" => {
                if i + 1 < args.len() {
                    i += 1;
                    conf_file = args[i].clone();
                } else {
                    eprintln!("Error: --conf requires a FILE argument");
                    return Ok(());
                }
            }
            _ => {}
        }
        i += 1;
    }

    let config = RunnerConfig::from_file(&conf_file)
        .with_context(|| format!("Cannot load config: {conf_file}"))?;

    tracing_subscriber::fmt()
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    tracing::info!("[hasp_emu_server] loaded config, tokens={}", config.tokens.len());

    let mut tasks = Vec::new();
    for binding in &config.tokens {
        let key = load_key_file(&binding.key_file)
            .with_context(|| format!("Cannot load key file: {}", binding.key_file))?;
        let key = Arc::new(key);
        let bind_addr = format!("{}:{}", config.bind_address, binding.port);
        tracing::info!(
            "[hasp_emu_server] serving key_file={} on {}",
            binding.key_file,
            bind_addr
        );
        tasks.push(tokio::spawn(async move {
            if let Err(e) = transport::serve(key, &bind_addr).await {
                tracing::error!("[hasp_emu_server] listener on {bind_addr} failed: {e}");
            }
        }));
    }

    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}
