/// REST client tests against a local mock backend
use bytes::Bytes;
use carechat_core::api::{ChatApi, HttpChatApi, SendRequest, SharedToken};
use carechat_core::chat_types::{DeliveryState, MessageId};
use carechat_core::config::Config;
use carechat_core::error::ChatError;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Debug, Clone)]
struct Recorded {
    method: Method,
    path_and_query: String,
    body: String,
}

type Log = Arc<Mutex<Vec<Recorded>>>;

fn json_resp(status: StatusCode, value: serde_json::Value) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(value.to_string())));
    *resp.status_mut() = status;
    resp
}

async fn handle(req: Request<hyper::body::Incoming>, log: Log) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    let authorized = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer secret");
    let body = req
        .collect()
        .await
        .map(|c| String::from_utf8_lossy(&c.to_bytes()).to_string())
        .unwrap_or_default();

    log.lock().unwrap().push(Recorded {
        method: method.clone(),
        path_and_query: if query.is_empty() {
            path.clone()
        } else {
            format!("{}?{}", path, query)
        },
        body: body.clone(),
    });

    if !authorized {
        return json_resp(StatusCode::UNAUTHORIZED, json!({"detail": "invalid token"}));
    }

    match (method, path.as_str()) {
        (Method::GET, "/api/chat/conversations/") => json_resp(
            StatusCode::OK,
            json!({
                "results": [{
                    "id": 1,
                    "participant_ids": [100, 200],
                    "last_message_preview": "see you tomorrow",
                    "last_message_at": "2024-03-01T09:30:00Z",
                    "unread_count": 2
                }],
                "next": null
            }),
        ),
        (Method::GET, "/api/chat/conversations/1/messages/") if query.contains("page=1") => {
            json_resp(
                StatusCode::OK,
                json!({
                    "results": [
                        {"id": 11, "sender_id": 200, "text": "hello", "created_at": "2024-03-01T09:00:00Z"},
                        {"id": 12, "sender_id": 100, "text": "hi", "created_at": "2024-03-01T09:01:00Z"}
                    ],
                    "next": "/api/chat/conversations/1/messages/?page=2"
                }),
            )
        }
        (Method::GET, "/api/chat/conversations/1/messages/") => json_resp(
            StatusCode::OK,
            json!([
                {"id": 10, "sender_id": 200, "text": "first", "created_at": "2024-02-28T18:00:00Z"}
            ]),
        ),
        (Method::POST, "/api/chat/messages/") => {
            let request: serde_json::Value = serde_json::from_str(&body).unwrap_or_default();
            json_resp(
                StatusCode::CREATED,
                json!({
                    "id": 55,
                    "conversation_id": request["conversation_id"],
                    "sender_id": 100,
                    "text": request["text"],
                    "created_at": "2024-03-01T10:00:00Z"
                }),
            )
        }
        (Method::POST, "/api/chat/conversations/1/mark-read/") => {
            json_resp(StatusCode::OK, json!({"status": "ok"}))
        }
        (Method::GET, "/api/chat/unread-count/") => {
            json_resp(StatusCode::OK, json!({"unread_count": 4}))
        }
        (Method::GET, "/api/chat/conversations/9/messages/") => {
            json_resp(StatusCode::INTERNAL_SERVER_ERROR, json!({"detail": "boom"}))
        }
        _ => json_resp(StatusCode::NOT_FOUND, json!({"detail": "not found"})),
    }
}

async fn spawn_backend() -> (SocketAddr, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let server_log = log.clone();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let io = TokioIo::new(stream);
            let log = server_log.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| {
                    let log = log.clone();
                    async move { Ok::<_, Infallible>(handle(req, log).await) }
                });
                let _ = http1::Builder::new().serve_connection(io, svc).await;
            });
        }
    });

    (addr, log)
}

fn client(addr: SocketAddr, token: Option<&str>) -> HttpChatApi {
    let config = Config {
        api_base_url: format!("http://{}/", addr),
        ..Default::default()
    };
    HttpChatApi::new(&config, Arc::new(SharedToken::new(token.map(String::from)))).unwrap()
}

#[tokio::test]
async fn test_lists_conversations() {
    let (addr, log) = spawn_backend().await;
    let api = client(addr, Some("secret"));

    let conversations = api.list_conversations().await.unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].id, 1);
    assert_eq!(conversations[0].unread_count, 2);
    assert_eq!(conversations[0].counterpart(Some(100)), Some(200));

    let recorded = log.lock().unwrap()[0].clone();
    assert_eq!(recorded.method, Method::GET);
    assert_eq!(recorded.path_and_query, "/api/chat/conversations/");
}

#[tokio::test]
async fn test_history_pages() {
    let (addr, log) = spawn_backend().await;
    let api = client(addr, Some("secret"));

    let newest = api.fetch_messages(1, 1, 2).await.unwrap();
    assert!(newest.has_more);
    assert_eq!(newest.messages.len(), 2);
    assert!(newest.messages.iter().all(|m| m.conversation_id == 1));
    assert_eq!(newest.messages[0].id, MessageId::Server(11));
    assert_eq!(newest.messages[0].delivery_state, DeliveryState::Sent);

    // Bare array shorter than the page size: no more pages
    let older = api.fetch_messages(1, 2, 2).await.unwrap();
    assert!(!older.has_more);
    assert_eq!(older.messages[0].text, "first");

    assert_eq!(
        log.lock().unwrap()[0].path_and_query,
        "/api/chat/conversations/1/messages/?page=1&page_size=2"
    );
}

#[tokio::test]
async fn test_send_posts_body_and_returns_server_message() {
    let (addr, log) = spawn_backend().await;
    let api = client(addr, Some("secret"));

    let request = SendRequest {
        conversation_id: 1,
        recipient_id: 200,
        text: "How are you feeling today?".into(),
        client_id: "tmp-3".into(),
    };
    let message = api.send_message(&request).await.unwrap();
    assert_eq!(message.id, MessageId::Server(55));
    assert_eq!(message.text, "How are you feeling today?");
    // The backend did not echo the key; the message store correlates it
    assert_eq!(message.client_id, None);

    let recorded = log.lock().unwrap()[0].clone();
    assert_eq!(recorded.method, Method::POST);
    let body: SendRequest = serde_json::from_str(&recorded.body).unwrap();
    assert_eq!(body, request);
}

#[tokio::test]
async fn test_mark_read_and_unread_count() {
    let (addr, log) = spawn_backend().await;
    let api = client(addr, Some("secret"));

    api.mark_read(1).await.unwrap();
    assert_eq!(api.unread_count().await.unwrap(), 4);

    let log = log.lock().unwrap();
    assert_eq!(log[0].method, Method::POST);
    assert_eq!(log[0].path_and_query, "/api/chat/conversations/1/mark-read/");
    assert_eq!(log[1].path_and_query, "/api/chat/unread-count/");
}

#[tokio::test]
async fn test_error_statuses() {
    let (addr, _log) = spawn_backend().await;

    let rejected = client(addr, Some("stale"));
    assert!(matches!(rejected.list_conversations().await, Err(ChatError::Auth(_))));

    let api = client(addr, Some("secret"));
    match api.fetch_messages(9, 1, 50).await {
        Err(ChatError::Http { status, body }) => {
            assert_eq!(status, 500);
            assert!(body.contains("boom"));
        }
        other => panic!("unexpected: {:?}", other.map(|p| p.messages.len())),
    }
    assert!(matches!(api.mark_read(42).await, Err(ChatError::NotFound(_))));
}

#[tokio::test]
async fn test_missing_token_skips_request() {
    let (addr, log) = spawn_backend().await;
    let api = client(addr, None);

    assert!(matches!(api.unread_count().await, Err(ChatError::Auth(_))));
    assert!(log.lock().unwrap().is_empty());
}
