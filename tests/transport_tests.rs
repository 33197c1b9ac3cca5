// Integration tests for the transport channel
//
// Each test runs an in-process websocket server standing in for the voice
// service and checks what the client puts on the wire and reports back.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use voice_duplex::config::TransportConfig;
use voice_duplex::transport::{
    Channel, ChannelEvent, ChannelEventKind, ClientMessage, ConnectionState, ControlCommand,
    InboundAudio, ServerMessage, Transport, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use voice_duplex::{ErrorKind, VoiceError};

const WAIT: Duration = Duration::from_secs(5);

type ServerSocket = WebSocketStream<TcpStream>;

async fn listen() -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("ws://{}/ws/test-session", listener.local_addr()?);
    Ok((listener, url))
}

async fn accept(listener: &TcpListener) -> Result<ServerSocket> {
    let (stream, _) = listener.accept().await?;
    Ok(tokio_tungstenite::accept_async(stream).await?)
}

async fn connect(
    listener: &TcpListener,
    url: &str,
    config: &TransportConfig,
) -> Result<(Channel, ServerSocket, mpsc::UnboundedReceiver<ChannelEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (channel, server) = tokio::join!(Channel::connect(url, 1, config, tx), accept(listener));
    Ok((channel?, server?, rx))
}

/// Next JSON text frame from the client, skipping keepalive pings
async fn next_json(server: &mut ServerSocket) -> Result<Value> {
    loop {
        let frame = timeout(WAIT, server.next())
            .await
            .context("timed out waiting for a frame")?
            .context("client went away")??;
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text)?;
            if value["type"] != "ping" {
                return Ok(value);
            }
        }
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Result<ChannelEvent> {
    timeout(WAIT, events.recv())
        .await
        .context("timed out waiting for an event")?
        .context("event channel closed")
}

/// First close event, skipping errors reported on the way down
async fn next_close(events: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> Result<u16> {
    loop {
        if let ChannelEventKind::Closed { code } = next_event(events).await?.kind {
            return Ok(code);
        }
    }
}

#[tokio::test]
async fn test_audio_frames_sent_as_json_envelopes() -> Result<()> {
    let (listener, url) = listen().await?;
    let (channel, mut server, _events) = connect(&listener, &url, &TransportConfig::default()).await?;
    assert_eq!(channel.state(), ConnectionState::Open);

    assert!(channel.send(ClientMessage::audio(&[0.5; 4])));
    assert!(channel.send(ClientMessage::Command {
        command: ControlCommand::Status,
    }));

    let audio = next_json(&mut server).await?;
    assert_eq!(audio["type"], "audio");
    let expected = ClientMessage::audio(&[0.5; 4]);
    assert_eq!(serde_json::to_value(&expected)?, audio);

    let command = next_json(&mut server).await?;
    assert_eq!(command, json!({"type": "command", "command": "status"}));
    Ok(())
}

#[tokio::test]
async fn test_inbound_messages_become_events() -> Result<()> {
    let (listener, url) = listen().await?;
    let (_channel, mut server, mut events) =
        connect(&listener, &url, &TransportConfig::default()).await?;

    let audio = json!({
        "type": "audio",
        "data": "AAA=",
        "sampleRate": 24000,
        "timestamp": 12,
        "bitDepth": 16
    });
    server.send(Message::Text(audio.to_string())).await?;
    server
        .send(Message::Text("this is not json".to_string()))
        .await?;
    server
        .send(Message::Text(
            json!({"type": "status", "status": "ready", "connectionStatus": "connected"})
                .to_string(),
        ))
        .await?;

    let first = next_event(&mut events).await?;
    assert_eq!(first.generation, 1);
    assert_eq!(
        first.kind,
        ChannelEventKind::Message(ServerMessage::Audio(InboundAudio {
            data: "AAA=".to_string(),
            sample_rate: Some(24000),
            preserve_quality: true,
        }))
    );

    // the malformed frame is dropped without an event
    let second = next_event(&mut events).await?;
    assert_eq!(
        second.kind,
        ChannelEventKind::Message(ServerMessage::Status {
            status: "ready".to_string(),
            connection_status: Some("connected".to_string()),
        })
    );
    Ok(())
}

#[tokio::test]
async fn test_keepalive_ping() -> Result<()> {
    let config = TransportConfig {
        keepalive_interval_ms: 50,
        ..TransportConfig::default()
    };
    let (listener, url) = listen().await?;
    let (_channel, mut server, _events) = connect(&listener, &url, &config).await?;

    let frame = timeout(WAIT, server.next())
        .await?
        .context("client went away")??;
    let text = match frame {
        Message::Text(text) => text,
        other => anyhow::bail!("expected a text frame, got {:?}", other),
    };
    assert_eq!(serde_json::from_str::<Value>(&text)?, json!({"type": "ping"}));
    Ok(())
}

#[tokio::test]
async fn test_dropped_connection_reports_abnormal_close() -> Result<()> {
    let (listener, url) = listen().await?;
    let (channel, server, mut events) = connect(&listener, &url, &TransportConfig::default()).await?;

    // no close handshake
    drop(server);

    assert_eq!(next_close(&mut events).await?, ABNORMAL_CLOSURE);
    assert_eq!(channel.state(), ConnectionState::Failed);
    assert!(!channel.send(ClientMessage::Ping));
    Ok(())
}

#[tokio::test]
async fn test_server_normal_close() -> Result<()> {
    let (listener, url) = listen().await?;
    let (channel, mut server, mut events) =
        connect(&listener, &url, &TransportConfig::default()).await?;

    server
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        }))
        .await?;

    assert_eq!(next_close(&mut events).await?, NORMAL_CLOSURE);
    assert_eq!(channel.state(), ConnectionState::Closed);
    Ok(())
}

#[tokio::test]
async fn test_client_close_sends_normal_close_frame() -> Result<()> {
    let (listener, url) = listen().await?;
    let (channel, mut server, _events) = connect(&listener, &url, &TransportConfig::default()).await?;

    let server_side = tokio::spawn(async move {
        while let Some(Ok(frame)) = server.next().await {
            if let Message::Close(frame) = frame {
                return frame.map(|f| u16::from(f.code));
            }
        }
        None
    });

    channel.close().await;

    let code = timeout(WAIT, server_side).await??;
    assert_eq!(code, Some(NORMAL_CLOSURE));
    Ok(())
}

#[tokio::test]
async fn test_connect_refused_is_network_error() -> Result<()> {
    let (listener, url) = listen().await?;
    drop(listener);

    let (tx, _rx) = mpsc::unbounded_channel();
    let err = match Channel::connect(&url, 1, &TransportConfig::default(), tx).await {
        Ok(_) => anyhow::bail!("connect should fail"),
        Err(e) => e,
    };
    assert!(matches!(
        err,
        VoiceError::Channel {
            kind: ErrorKind::Network,
            ..
        }
    ));
    Ok(())
}

#[tokio::test]
async fn test_transport_reopen_replaces_channel() -> Result<()> {
    let (tx, mut events) = mpsc::unbounded_channel();
    let transport = Transport::new(TransportConfig::default(), tx);
    assert_eq!(transport.state(), ConnectionState::Idle);
    assert!(!transport.send(ClientMessage::Ping));

    let (first_listener, first_url) = listen().await?;
    let (generation, first_server) =
        tokio::join!(transport.open(&first_url), accept(&first_listener));
    assert_eq!(generation?, 1);
    let first_server = first_server?;

    let (second_listener, second_url) = listen().await?;
    let (generation, second_server) =
        tokio::join!(transport.open(&second_url), accept(&second_listener));
    assert_eq!(generation?, 2);
    let mut second_server = second_server?;
    assert_eq!(transport.generation(), 2);

    assert!(transport.send(ClientMessage::audio(&[0.1; 8])));
    assert_eq!(next_json(&mut second_server).await?["type"], "audio");

    // the replaced channel can no longer raise events
    drop(first_server);
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(event) = events.try_recv() {
        assert_ne!(event.generation, 1, "stale event {:?}", event);
    }

    transport.close().await;
    assert_eq!(transport.state(), ConnectionState::Idle);
    Ok(())
}
