use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use veritaserum::{
    model::{InteractionState, Protocol, RequestSnapshot, ResponseSpec},
    proxy::http::serve,
    store::Store,
};

async fn start_proxy(store: Arc<Store>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, store));
    addr
}

/// 发送一条原始代理请求并读取整个响应（请求带 Connection: close）
async fn proxy_request(addr: SocketAddr, raw: &str) -> (u16, HashMap<String, String>, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    parse_response(&response)
}

fn parse_response(raw: &[u8]) -> (u16, HashMap<String, String>, String) {
    let text = String::from_utf8_lossy(raw).to_string();
    let (head, body) = text.split_once("\r\n\r\n").expect("no header terminator");
    let mut lines = head.lines();
    let status: u16 = lines
        .next()
        .unwrap()
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let headers = lines
        .map(|line| {
            let (name, value) = line.split_once(':').unwrap();
            (name.trim().to_lowercase(), value.trim().to_string())
        })
        .collect();
    (status, headers, body.to_string())
}

#[tokio::test]
async fn test_miss_then_configure_then_playback() {
    let store = Store::new("unused-state.json");
    let addr = start_proxy(store.clone()).await;

    let request = "GET http://api.example.com/v1/users HTTP/1.1\r\n\
                   Host: api.example.com\r\n\
                   Connection: close\r\n\r\n";

    // 首次请求：拦截并注册 pending
    let (status, _, _) = proxy_request(addr, request).await;
    assert_eq!(status, 503);

    let pending = store.list_pending().await;
    assert_eq!(pending.len(), 1);
    let interaction = &pending[0];
    assert_eq!(interaction.protocol, Protocol::Http);
    assert_eq!(interaction.key, "GET api.example.com /v1/users ");

    // 同键再次请求仍是 pending
    let (status, _, _) = proxy_request(addr, request).await;
    assert_eq!(status, 503);
    assert_eq!(store.list_all().await.len(), 1);

    // 配置后回放
    store
        .configure(
            &interaction.id,
            "list users".to_string(),
            ResponseSpec::Http {
                status_code: 200,
                headers: HashMap::new(),
                body: "[]".to_string(),
                latency_ms: 0,
            },
        )
        .await
        .unwrap();

    let (status, headers, body) = proxy_request(addr, request).await;
    assert_eq!(status, 200);
    assert_eq!(body, "[]");
    assert_eq!(headers.get("content-type").unwrap(), "application/json");
}

#[tokio::test]
async fn test_routing_key_ignores_incidental_headers() {
    let store = Store::new("unused-state.json");
    let addr = start_proxy(store.clone()).await;

    let first = "GET http://api.example.com/v1/orders HTTP/1.1\r\n\
                 Host: api.example.com\r\n\
                 User-Agent: curl/8.0\r\n\
                 Connection: close\r\n\r\n";
    let second = "GET http://api.example.com/v1/orders HTTP/1.1\r\n\
                  Host: api.example.com\r\n\
                  User-Agent: something-else/2.1\r\n\
                  X-Request-Id: abc\r\n\
                  Connection: close\r\n\r\n";

    proxy_request(addr, first).await;
    proxy_request(addr, second).await;

    // 请求头不参与路由键，两次请求命中同一条记录
    assert_eq!(store.list_all().await.len(), 1);
}

#[tokio::test]
async fn test_body_contents_change_the_key() {
    let store = Store::new("unused-state.json");
    let addr = start_proxy(store.clone()).await;

    let first = "POST http://api.example.com/v1/orders HTTP/1.1\r\n\
                 Host: api.example.com\r\n\
                 Content-Length: 9\r\n\
                 Connection: close\r\n\r\n{\"id\": 1}";
    let second = "POST http://api.example.com/v1/orders HTTP/1.1\r\n\
                  Host: api.example.com\r\n\
                  Content-Length: 9\r\n\
                  Connection: close\r\n\r\n{\"id\": 2}";

    proxy_request(addr, first).await;
    proxy_request(addr, second).await;

    assert_eq!(store.list_all().await.len(), 2);
}

#[tokio::test]
async fn test_origin_form_request_is_rejected() {
    let store = Store::new("unused-state.json");
    let addr = start_proxy(store.clone()).await;

    let request = "GET /v1/users HTTP/1.1\r\n\
                   Host: api.example.com\r\n\
                   Connection: close\r\n\r\n";
    let (status, _, _) = proxy_request(addr, request).await;
    assert_eq!(status, 400);
    assert!(store.list_all().await.is_empty());
}

#[tokio::test]
async fn test_playback_latency_is_applied() {
    let store = Store::new("unused-state.json");
    let addr = start_proxy(store.clone()).await;

    let interaction = store
        .register(
            Protocol::Http,
            "GET api.example.com /slow ".to_string(),
            RequestSnapshot::Http {
                method: "GET".to_string(),
                host: "api.example.com".to_string(),
                path: "/slow".to_string(),
                headers: HashMap::new(),
                body: String::new(),
                body_hash: String::new(),
            },
        )
        .await;
    store
        .configure(
            &interaction.id,
            String::new(),
            ResponseSpec::Http {
                status_code: 200,
                headers: HashMap::new(),
                body: "{}".to_string(),
                latency_ms: 80,
            },
        )
        .await
        .unwrap();

    let request = "GET http://api.example.com/slow HTTP/1.1\r\n\
                   Host: api.example.com\r\n\
                   Connection: close\r\n\r\n";
    let started = std::time::Instant::now();
    let (status, _, _) = proxy_request(addr, request).await;
    assert_eq!(status, 200);
    assert!(started.elapsed() >= std::time::Duration::from_millis(60));
}

#[tokio::test]
async fn test_dynamodb_recognition() {
    let store = Store::new("unused-state.json");
    let addr = start_proxy(store.clone()).await;

    let body = r#"{"TableName":"Orders","Key":{"id":{"S":"42"}}}"#;
    let request = format!(
        "POST http://dynamodb.us-east-1.amazonaws.com/ HTTP/1.1\r\n\
         Host: dynamodb.us-east-1.amazonaws.com\r\n\
         X-Amz-Target: DynamoDB_20120810.GetItem\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let (status, _, _) = proxy_request(addr, &request).await;
    assert_eq!(status, 503);

    let pending = store.list_pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].protocol, Protocol::Dynamodb);
    match &pending[0].request {
        RequestSnapshot::Dynamodb {
            operation,
            table,
            key_json,
            ..
        } => {
            assert_eq!(operation, "GetItem");
            assert_eq!(table, "Orders");
            assert_eq!(key_json, r#"{"id":{"S":"42"}}"#);
        }
        other => panic!("expected dynamodb snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_miss_registers_once() {
    let store = Store::new("unused-state.json");
    let addr = start_proxy(store.clone()).await;

    let request = "GET http://api.example.com/v1/race HTTP/1.1\r\n\
                   Host: api.example.com\r\n\
                   Connection: close\r\n\r\n";

    let mut handles = Vec::new();
    for _ in 0..8 {
        let request = request.to_string();
        handles.push(tokio::spawn(
            async move { proxy_request(addr, &request).await },
        ));
    }
    for handle in handles {
        let (status, _, _) = handle.await.unwrap();
        assert_eq!(status, 503);
    }

    let all = store.list_all().await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state, InteractionState::Pending);
}
