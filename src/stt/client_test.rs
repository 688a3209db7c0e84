use super::*;
use rmpv::Value;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::net::TcpListener;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};

#[test]
fn build_url_appends_endpoint() {
    assert_eq!(
        build_url("ws://localhost:8080"),
        "ws://localhost:8080/api/asr-streaming"
    );
}

#[test]
fn build_url_strips_trailing_slash() {
    assert_eq!(
        build_url("ws://localhost:8080/"),
        "ws://localhost:8080/api/asr-streaming"
    );
}

#[test]
fn build_url_keeps_existing_endpoint() {
    assert_eq!(
        build_url("ws://localhost:8080/api/asr-streaming"),
        "ws://localhost:8080/api/asr-streaming"
    );
}

#[test]
fn backoff_doubles_and_caps_at_sixty_seconds() {
    let mut delay = INITIAL_BACKOFF;
    let mut observed = Vec::new();
    for _ in 0..8 {
        observed.push(delay.as_secs());
        delay = next_backoff(delay);
    }
    assert_eq!(observed, vec![1, 2, 4, 8, 16, 32, 60, 60]);
}

fn word_frame(text: &str) -> Vec<u8> {
    let map = Value::Map(vec![
        (Value::from("type"), Value::from("Word")),
        (Value::from("text"), Value::from(text)),
    ]);
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &map).unwrap();
    buf
}

#[tokio::test]
async fn connect_send_receive_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            assert_eq!(req.uri().path(), ASR_ENDPOINT);
            assert_eq!(req.headers().get(API_KEY_HEADER).unwrap(), "secret");
            Ok(resp)
        };
        let mut ws = accept_hdr_async(stream, callback).await.unwrap();

        // First inbound frame must be a typed Audio map with our PCM.
        let msg = ws.next().await.unwrap().unwrap();
        let event = messages::decode(&msg.into_data()).unwrap();
        assert_eq!(event.message_type(), "Audio");

        ws.send(Message::Binary(word_frame("hi"))).await.unwrap();

        // Drain until the client's close arrives.
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
        }
    });

    let client = SttClient::connect(&format!("ws://{addr}"), "secret")
        .await
        .unwrap();

    client.send_audio(&[0.25f32; 16]).await.unwrap();

    let event = client.receive().await.unwrap();
    assert_eq!(
        event,
        InboundEvent::Word {
            text: "hi".to_string()
        }
    );

    client.close().await.unwrap();
    assert!(client.is_closed());

    // A closed client rejects sends immediately.
    assert!(client.send_audio(&[0.0f32; 16]).await.is_err());

    server.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn reconnect_backs_off_until_cancelled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_hdr_async(stream, |_req: &Request, resp: Response| Ok(resp))
            .await
            .unwrap();
        drop(ws);
        // Listener drops here, so reconnect attempts are refused.
    });

    let client = SttClient::connect(&format!("ws://{addr}"), "key")
        .await
        .unwrap();
    server.await.unwrap();

    let cancel = CancellationToken::new();
    let delays: Arc<StdMutex<Vec<u64>>> = Arc::default();

    let callback_token = cancel.clone();
    let seen = delays.clone();
    let result = client
        .reconnect(&cancel, move |attempt, delay| {
            seen.lock().unwrap().push(delay.as_secs());
            if attempt == 4 {
                callback_token.cancel();
            }
        })
        .await;

    assert!(result.is_err());
    assert!(cancel.is_cancelled());
    assert_eq!(*delays.lock().unwrap(), vec![1, 2, 4, 8]);
}
