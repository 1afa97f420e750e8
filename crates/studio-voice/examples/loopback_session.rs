//! Loopback session demo: a scripted remote model, virtual mic and speaker.
//!
//! Plays one short exchange against the in-memory transport: a transcript, a
//! spoken reply, a calendar tool call and a barge-in. No network or audio
//! hardware is touched.
//!
//! Reads `config/studio_voice.toml` and `STUDIO_VOICE__*` overrides if present.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use studio_voice::protocol::ClientMessage;
use studio_voice::{
    FnToolHandler, LiveConfig, MemoryConnector, ServerMessage, StreamingSessionController, StudioTool,
    ToolCall, TranscriptKind, VirtualBackend,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = LiveConfig::load()?;
    info!("Studio Voice loopback demo (model {}, voice {})", config.model, config.voice_name);

    let backend = VirtualBackend::new(config.block_size);
    let (connector, mut remote) = MemoryConnector::new();

    let handler = FnToolHandler::from_sync(|tool| match tool {
        StudioTool::ManageCalendar(event) => {
            info!("Scheduling '{}'", event.event_title);
            Ok(json!({ "status": "scheduled", "buffer_days": 2 }))
        }
        StudioTool::OrganizePhotos(archive) => Ok(json!({ "moved": archive.count, "to": archive.path })),
        StudioTool::ConnectCloud => Ok(json!({ "connected": true })),
        StudioTool::Unknown { name, .. } => anyhow::bail!("{} is not available in this studio", name),
    });

    let mut controller =
        StreamingSessionController::new(Arc::new(connector), Arc::new(backend.clone()), Arc::new(handler));

    let mut status = controller.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            info!("status: {}", *status.borrow());
        }
    });

    let output = config.output;
    let remote_script = tokio::spawn(async move {
        remote.accept().await;

        remote.send(ServerMessage::input_transcript("Book a site visit for the Harbor project"));
        remote.send(ServerMessage::output_transcript("Sure, adding it now."));
        remote.send(ServerMessage::audio(&vec![0u8; 24000], output));
        remote.send(ServerMessage::tool_call(ToolCall::new(
            "call-1",
            "manage_calendar",
            json!({ "projectName": "Harbor", "eventTitle": "Site Visit" }),
        )));

        while let Some(message) = remote.recv_timeout(Duration::from_secs(2)).await {
            if let ClientMessage::ToolResponse(response) = message {
                for answer in &response.function_responses {
                    info!("remote got result for {}: {}", answer.id, answer.response);
                    remote.send(ServerMessage::tool_ack(answer.id.clone()));
                }
                break;
            }
        }

        remote.send(ServerMessage::audio(&vec![0u8; 48000], output));
        remote.send(ServerMessage::interrupted());
        remote.send(ServerMessage::turn_complete());
        remote
    });

    controller.open(&config).await?;

    let mic = backend.mic();
    for _ in 0..3 {
        mic.push_level(0.05);
    }

    let _remote = remote_script.await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    info!("You said: {}", controller.transcript(TranscriptKind::Input).await.text);
    info!("AI said: {}", controller.transcript(TranscriptKind::Output).await.text);
    info!("Buffers scheduled: {}", backend.speaker().history().len());

    controller.close().await?;
    info!("Final status: {}", controller.status());
    Ok(())
}
