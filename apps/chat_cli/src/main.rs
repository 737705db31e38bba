use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use chrono::Local;
use clap::Parser;
use shared::{
    domain::{short_address, ConversationId},
    protocol::{ConversationSummary, MessageRecord},
};
use sync_engine::{
    load_config,
    memory::{DevWallet, MemoryClient, MemoryNetwork},
    MessagingClient, SyncEngine, SyncEvent, WalletSigner,
};
use tracing::{info, warn};

/// Chats with simulated peers on an in-process network, driven entirely by
/// the polling sync engine.
#[derive(Parser, Debug)]
struct Args {
    /// tracing filter, e.g. `info` or `sync_engine=debug`
    #[arg(long, default_value = "info")]
    log_filter: String,
    /// extra TOML config applied after sync.toml and SYNC__* variables
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = 2)]
    peers: usize,
    /// seconds between messages from each simulated peer
    #[arg(long, default_value_t = 4)]
    peer_interval_secs: u64,
    /// stop after this many seconds; runs until ctrl-c when omitted
    #[arg(long)]
    duration_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(args.log_filter.as_str())
        .init();

    let mut config = load_config();
    if let Some(path) = &args.config {
        config.apply_file_if_present(path)?;
    }

    let network = MemoryNetwork::new();
    let engine = SyncEngine::new(Arc::new(network.clone()), config);
    let wallet = DevWallet::random();
    let own_address = wallet.address();
    engine.connect_wallet(wallet).await;

    if let Err(fault) = engine.initialize().await {
        bail!(fault.user_message());
    }
    println!(
        "Signed in as {} (inbox {})",
        short_address(&own_address),
        engine
            .inbox_id()
            .await
            .map(|id| id.to_string())
            .unwrap_or_default()
    );

    let period = Duration::from_secs(args.peer_interval_secs.max(1));
    for _ in 0..args.peers {
        let peer_address = DevWallet::random().address();
        let peer = network.client_for(&peer_address).await?;
        let conversation = match engine.start_conversation(&peer_address).await {
            Ok(id) => id,
            Err(fault) => bail!(fault.user_message()),
        };
        println!(
            "Started conversation {conversation} with {}",
            short_address(&peer_address)
        );
        tokio::spawn(chatter(peer, conversation, peer_address, period));
    }

    let mut events = engine.subscribe_events();
    let mut messages = engine.stream_messages();
    let mut conversations = engine.stream_conversations();
    engine.start_polling();

    let deadline = args.duration_secs.map(Duration::from_secs);
    let stop = async move {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    warn!(error = %err, "chat: ctrl-c handler unavailable");
                    std::future::pending::<()>().await;
                }
            }
        }
    };
    tokio::pin!(stop);

    loop {
        tokio::select! {
            _ = &mut stop => break,
            Some(record) = messages.recv() => {
                print_message(&record);
                if record.sender_display_identity != own_address {
                    let reply = format!("got it: {}", record.content);
                    if let Err(fault) = engine.send_message(&record.conversation_id, &reply).await {
                        warn!(kind = ?fault.kind, error = %fault.message, "chat: reply failed");
                    }
                }
            }
            Some(list) = conversations.recv() => print_conversations(&list),
            Ok(event) = events.recv() => {
                if let SyncEvent::Error(fault) = event {
                    eprintln!("! {}", fault.user_message());
                }
            }
            else => break,
        }
    }

    engine.cleanup().await;
    info!("chat: session closed");
    Ok(())
}

/// Simulated peer: posts a numbered message every `period`.
async fn chatter(
    peer: Arc<MemoryClient>,
    conversation: ConversationId,
    address: String,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut sent = 0u64;
    loop {
        ticker.tick().await;
        sent += 1;
        let text = format!("ping #{sent} from {}", short_address(&address));
        if let Err(err) = peer.send(&conversation, &text).await {
            warn!(error = %err, peer = %address, "chat: simulated peer failed to send");
            return;
        }
    }
}

fn print_message(record: &MessageRecord) {
    let at = record
        .sent_at()
        .map(|at| at.with_timezone(&Local).format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".into());
    println!(
        "[{at}] {} @ {}: {}",
        short_address(&record.sender_display_identity),
        record.conversation_id,
        record.content
    );
}

fn print_conversations(list: &[ConversationSummary]) {
    println!("-- {} conversation(s) --", list.len());
    for summary in list {
        let preview = summary
            .last_message
            .as_ref()
            .map(|last| last.content.as_str())
            .unwrap_or("(no messages)");
        println!(
            "   {} {}: {preview}",
            summary.id,
            short_address(&summary.peer_display_identity)
        );
    }
}
