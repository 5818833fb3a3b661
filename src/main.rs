use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

mod cli;

use cli::{ChannelCommands, Cli, Commands};
use spinq::config::Config;
use spinq::daemon::Daemon;
use spinq::domain::{Channel, RequestState};
use spinq::moderation::{ModerationGate, Verdict};
use spinq::store::Store;
use spinq::submission::{self, SubmissionOutcome, SubmitParams};

fn setup_logging(config: &Config) -> Result<()> {
    let log_dir = config.storage.data_dir.join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("spinq.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn open_store(config: &Config) -> Result<Arc<Mutex<Store>>> {
    let store = Store::open_at(&config.storage.data_dir)?;
    Ok(Arc::new(Mutex::new(store)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref())?;

    setup_logging(&config)?;

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Daemon => {
            println!("{}", "Starting spinq daemon...".cyan());
            Daemon::new(config).run().await
        }
        Commands::Submit {
            user,
            channel,
            priority,
            prompt,
        } => handle_submit(&config, user, channel, *priority, prompt),
        Commands::List { state, channel } => handle_list(&config, state.as_deref(), channel.as_deref()),
        Commands::Status { id } => handle_status(&config, id),
        Commands::Moderate { id, verdict, reason } => handle_moderate(&config, id, verdict, reason.as_deref()),
        Commands::Cancel { id } => handle_cancel(&config, id),
        Commands::Channel { command } => handle_channel(&config, command),
    }
}

fn handle_submit(config: &Config, user: &str, channel: &str, priority: i32, prompt: &str) -> Result<()> {
    let store = open_store(config)?;
    let gate = ModerationGate::new(store.clone());

    let params = SubmitParams {
        user_id: user.to_string(),
        channel_id: channel.to_string(),
        prompt: prompt.to_string(),
        base_priority: priority,
    };

    match submission::submit_request(&store, &gate, &config.admission, params)? {
        SubmissionOutcome::Accepted(receipt) => {
            println!(
                "{} {} (position ~{})",
                "Submitted:".green(),
                receipt.request_id,
                receipt.estimated_position
            );
        }
        SubmissionOutcome::Denied {
            reason,
            retry_after_secs,
        } => {
            println!(
                "{} {} (retry in {}s)",
                "Denied:".red(),
                reason,
                retry_after_secs
            );
        }
    }

    Ok(())
}

fn handle_list(config: &Config, state: Option<&str>, channel: Option<&str>) -> Result<()> {
    let state = match state {
        Some(s) => Some(
            RequestState::parse(s).ok_or_else(|| eyre::eyre!("Unknown state: {}", s))?,
        ),
        None => None,
    };

    let store = open_store(config)?;
    let requests = store.lock().unwrap().list_requests(state, channel)?;

    if requests.is_empty() {
        println!("{}", "No requests found".yellow());
        return Ok(());
    }

    for request in requests {
        let state_str = match request.state {
            RequestState::Completed | RequestState::Ready => request.state.as_str().green(),
            RequestState::Failed | RequestState::Rejected => request.state.as_str().red(),
            RequestState::Generating => request.state.as_str().cyan(),
            _ => request.state.as_str().normal(),
        };
        println!(
            "{}  {:<12} {:<10} {:>7.1}  {}",
            request.id,
            state_str,
            request.user_id,
            request.calculated_priority,
            request.prompt.chars().take(48).collect::<String>()
        );
    }

    Ok(())
}

fn handle_status(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config)?;
    let request = store.lock().unwrap().get_request(id)?;

    match request {
        Some(request) => {
            println!("{}", serde_json::to_string_pretty(&request)?);
            Ok(())
        }
        None => {
            println!("{} {}", "Not found:".red(), id);
            Ok(())
        }
    }
}

fn handle_moderate(config: &Config, id: &str, verdict: &str, reason: Option<&str>) -> Result<()> {
    let verdict = Verdict::parse(verdict).ok_or_else(|| eyre::eyre!("Unknown verdict: {}", verdict))?;

    let store = open_store(config)?;
    let gate = ModerationGate::new(store);

    let state = gate.resolve(id, verdict, reason)?;
    println!("{} {} -> {}", "Moderated:".green(), id, state);
    Ok(())
}

fn handle_cancel(config: &Config, id: &str) -> Result<()> {
    let store = open_store(config)?;
    let mut store = store.lock().unwrap();

    let mut request = store
        .get_request(id)?
        .ok_or_else(|| eyre::eyre!("Request not found: {}", id))?;
    request.transition(RequestState::Cancelled)?;
    store.save_request(&request)?;

    println!("{} {}", "Cancelled:".green(), id);
    Ok(())
}

fn handle_channel(config: &Config, command: &ChannelCommands) -> Result<()> {
    let store = open_store(config)?;

    match command {
        ChannelCommands::Add {
            id,
            name,
            max_queue_size,
        } => {
            let channel = Channel::new(id, name.as_deref().unwrap_or(id)).with_max_queue_size(*max_queue_size);
            store.lock().unwrap().save_channel(&channel)?;
            println!("{} {}", "Channel saved:".green(), id);
        }
        ChannelCommands::List => {
            let channels = store.lock().unwrap().list_channels()?;
            if channels.is_empty() {
                println!("{}", "No channels".yellow());
            }
            for channel in channels {
                let queued = store.lock().unwrap().count_queued(&channel.id)?;
                println!(
                    "{:<16} {:<24} queue {}/{}",
                    channel.id, channel.name, queued, channel.max_queue_size
                );
            }
        }
    }

    Ok(())
}
