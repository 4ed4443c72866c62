use std::path::PathBuf;

use clap::Parser;
use kikwire::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// Log in to a Kik-style chat server and chat from the terminal.
///
/// Commands once logged in:
///   /roster                 fetch and print the roster
///   /msg <jid> <text>       send a chat message
///   /info <jid>...          look up users
///   /quit                   disconnect and exit
#[derive(Parser)]
#[command(name = "kik-cli", version)]
struct Args {
    /// Account username.
    #[arg(short, long)]
    username: String,

    /// Account password.
    #[arg(short, long)]
    password: String,

    /// Directory holding per-account session files.
    #[arg(long, default_value = "sessions")]
    session_dir: PathBuf,

    /// Server address (host:port).
    #[arg(long, default_value = "talk1110an.kik.com:5223")]
    addr: String,

    /// Connect without TLS.
    #[arg(long)]
    plain: bool,

    /// Track group members and friends from the roster.
    #[arg(long)]
    track: bool,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut connector = TcpConnector::new(&args.addr);
    if !args.plain {
        let host = args.addr.split(':').next().unwrap_or(&args.addr).to_string();
        connector = connector.tls(host);
    }

    let client = KikClient::builder(Credentials::new(&args.username, &args.password))
        .track_user_info(args.track)
        .track_friend_info(args.track)
        .build(connector, JsonFileStore::new(&args.session_dir))?;

    let mut events = client.subscribe();
    client.connect().await?;
    tracing::info!(addr = %args.addr, "connected, waiting for login");

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut awaiting_captcha = false;

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::CaptchaChallenge { url } => {
                        println!("captcha required, solve it at:\n  {url}\nthen type the response:");
                        awaiting_captcha = true;
                    }
                    ClientEvent::Disconnected => {
                        println!("disconnected");
                        break;
                    }
                    other => print_event(&other),
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if awaiting_captcha {
                    awaiting_captcha = false;
                    client.resolve_captcha(line).await?;
                    continue;
                }
                if !run_command(&client, line).await? {
                    break;
                }
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

fn print_event(event: &ClientEvent) {
    match event {
        ClientEvent::PhaseChanged { from, to } => println!("[{from} -> {to}]"),
        ClientEvent::Authenticated => println!("logged in"),
        ClientEvent::MessageReceived(msg) => match &msg.group {
            Some(group) => println!("{group} <{}> {}", msg.from, msg.body),
            None => println!("<{}> {}", msg.from, msg.body),
        },
        ClientEvent::RosterReceived { groups, friends } => {
            println!("roster: {} groups, {} friends", groups.len(), friends.len());
        }
        ClientEvent::UserLeftGroup { group, user } => println!("{user} left {group}"),
        ClientEvent::Error(e) => eprintln!("error: {e}"),
        _ => tracing::debug!(?event, "event"),
    }
}

/// Runs one command line. Returns `false` on `/quit`.
async fn run_command(client: &KikClient, line: &str) -> Result<bool, KikError> {
    let mut parts = line.splitn(3, ' ');
    match parts.next().unwrap_or_default() {
        "" => {}
        "/quit" => return Ok(false),
        "/roster" => {
            let (groups, friends) = client.get_roster().await?;
            for group in &groups {
                let name = group.name.as_deref().unwrap_or("(unnamed)");
                println!("group {} {name}: {} members", group.jid, group.users.len());
            }
            for friend in &friends {
                let name = friend.display_name.as_deref().unwrap_or("");
                println!("friend {} {name}", friend.jid);
            }
        }
        "/msg" => match (parts.next(), parts.next()) {
            (Some(to), Some(body)) => {
                client.send_message(&Jid::from(to), body).await?;
            }
            _ => println!("usage: /msg <jid> <text>"),
        },
        "/info" => {
            let jids: Vec<Jid> = line
                .split_whitespace()
                .skip(1)
                .map(Jid::from)
                .collect();
            for user in client.get_jid_info(&jids).await? {
                println!(
                    "{} username={} name={}",
                    user.jid,
                    user.username.as_deref().unwrap_or("-"),
                    user.display_name.as_deref().unwrap_or("-"),
                );
            }
        }
        other => println!("unknown command {other}"),
    }
    Ok(true)
}
