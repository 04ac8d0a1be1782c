//! CLI command implementations

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};

use dactyl_auth::client::default_socket_path;
use dactyl_auth::{
    run_fingerprint, CancelFlag, DactylClient, Feedback, FingerOutcome, SignalBody, VerifyPolicy,
};
use dactyl_core::Finger;

/// Dactyl CLI - fingerprint enrollment and verification
#[derive(Parser)]
#[command(name = "dactyl")]
#[command(about = "Fingerprint enrollment and verification utilities", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the daemon socket
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check daemon status
    Status,

    /// List available fingerprint devices
    Devices,

    /// List enrolled fingers for a user
    List {
        /// Username (defaults to the current user)
        username: Option<String>,
    },

    /// Enroll a finger
    Enroll {
        /// Username (defaults to the current user)
        username: Option<String>,

        /// Finger to enroll
        #[arg(short, long, default_value = "right-index-finger")]
        finger: String,
    },

    /// Verify a fingerprint
    Verify {
        /// Username (defaults to the current user)
        username: Option<String>,

        /// Verification attempts before giving up
        #[arg(long, default_value_t = 3)]
        max_tries: u32,
    },

    /// Delete all enrolled fingers for a user
    Delete {
        /// Username (defaults to the current user)
        username: Option<String>,
    },
}

struct ConsoleFeedback;

impl Feedback for ConsoleFeedback {
    fn info(&self, message: &str) {
        println!("{message}");
    }

    fn error(&self, message: &str) {
        eprintln!("{message}");
    }
}

fn effective_username(username: Option<String>) -> Result<String> {
    if let Some(username) = username {
        return Ok(username);
    }
    std::env::var("USER").context("no username given and $USER is not set")
}

/// Run the CLI
pub async fn run(cli: Cli) -> Result<()> {
    let socket = cli.socket.unwrap_or_else(default_socket_path);
    let client = DactylClient::connect_to(socket)
        .await
        .map_err(|e| anyhow!("{e}\nIs dactyl-daemon running?"))?;

    match cli.command {
        Commands::Status => {
            let version = client.ping().await?;
            println!("dactyl daemon v{version} is running");
        }

        Commands::Devices => {
            let devices = client.get_devices().await?;
            if devices.is_empty() {
                println!("No fingerprint devices found");
                return Ok(());
            }
            for path in devices {
                let info = client.get_device_info(&path).await?;
                println!(
                    "{path}  {}  scan-type={}  in-use={}",
                    info.name, info.scan_type, info.in_use
                );
            }
        }

        Commands::List { username } => {
            let username = effective_username(username)?;
            let device = client.get_default_device().await?;
            match client.list_enrolled_fingers(&device, &username).await {
                Ok(fingers) => {
                    println!("Fingers enrolled for {username}:");
                    for finger in fingers {
                        println!("  {finger}");
                    }
                }
                Err(e) if e.is_no_enrolled_prints() => {
                    println!("No fingers enrolled for {username}");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Enroll { username, finger } => {
            let username = effective_username(username)?;
            if Finger::parse(&finger).is_none() {
                bail!("'{finger}' is not a valid finger name");
            }
            enroll(&client, &username, &finger).await?;
        }

        Commands::Verify { username, max_tries } => {
            let username = effective_username(username)?;
            let policy = VerifyPolicy {
                max_tries,
                ..VerifyPolicy::default()
            };
            let outcome =
                run_fingerprint(&client, &username, &policy, &ConsoleFeedback, CancelFlag::new())
                    .await;
            match outcome {
                FingerOutcome::Matched => println!("Verification succeeded"),
                FingerOutcome::NoMatch => bail!("Verification failed: no match"),
                FingerOutcome::UserUnknown => bail!("No fingers enrolled for {username}"),
                FingerOutcome::Unavailable => bail!("No usable fingerprint device"),
                FingerOutcome::Cancelled => bail!("Verification cancelled"),
            }
        }

        Commands::Delete { username } => {
            let username = effective_username(username)?;
            let device = client.get_default_device().await?;
            client.claim(&device, &username).await?;
            let result = client.delete_enrolled_fingers2(&device).await;
            let _ = client.release(&device).await;
            result?;
            println!("Deleted enrolled fingers for {username}");
        }
    }

    Ok(())
}

/// Claim the default device and drive one enrollment to completion.
async fn enroll(client: &DactylClient, username: &str, finger: &str) -> Result<()> {
    let device = client.get_default_device().await?;
    let info = client.get_device_info(&device).await?;

    client.claim(&device, username).await?;

    let mut signals = client.signals();
    let result = async {
        client.enroll_start(&device, finger).await?;
        println!(
            "Enrolling {finger} on {} ({} stages)",
            info.name, info.num_enroll_stages
        );

        loop {
            let (signal_device, signal) = signals
                .recv()
                .await
                .map_err(|_| anyhow!("connection to daemon lost"))?;
            if signal_device != device {
                continue;
            }
            if let SignalBody::EnrollStatus { result, done } = signal {
                println!("  {result}");
                if done {
                    if result == "enroll-completed" {
                        return Ok(());
                    }
                    bail!("enrollment ended with '{result}'");
                }
            }
        }
    }
    .await;

    let _ = client.release(&device).await;
    result
}
