use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

use usersys_db::{Database, InMemorySessionStore, UserRow, UserStore};
use usersys_protocol::{Message, MessageType, Response, Status, encode_frame, reason};
use usersys_server::{Dispatcher, RpcServer, ServerHandle, ServerOptions, auth};

fn start(read_timeout: Duration) -> (ServerHandle, JoinHandle<()>) {
    let db = Database::open_in_memory().unwrap();
    db.create_user("alice", &auth::hash_password("secret").unwrap(), "Alice", "a.png")
        .unwrap();
    start_with(Arc::new(db), read_timeout)
}

/// Every lookup panics inside the worker thread.
struct PanickingStore;

impl UserStore for PanickingStore {
    fn find_by_username(&self, _username: &str) -> anyhow::Result<Option<UserRow>> {
        panic!("user table unavailable");
    }

    fn find_by_id(&self, _id: i64) -> anyhow::Result<Option<UserRow>> {
        panic!("user table unavailable");
    }

    fn update_profile(&self, _id: i64, _nickname: &str, _profile_pic: &str) -> anyhow::Result<()> {
        panic!("user table unavailable");
    }
}

fn start_with(
    users: Arc<dyn UserStore>,
    read_timeout: Duration,
) -> (ServerHandle, JoinHandle<()>) {
    let dispatcher = Dispatcher::new(
        users,
        Arc::new(InMemorySessionStore::new()),
        Duration::from_secs(3600),
    );
    RpcServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        dispatcher,
        ServerOptions { read_timeout },
    )
    .unwrap()
    .spawn()
    .unwrap()
}

fn connect(handle: &ServerHandle) -> TcpStream {
    let stream = TcpStream::connect(handle.local_addr()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
}

/// Send raw bytes, read until the server closes, decode the reply.
fn exchange(handle: &ServerHandle, bytes: &[u8]) -> Response {
    let mut stream = connect(handle);
    stream.write_all(bytes).unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    Response::decode(&reply).unwrap()
}

fn call(handle: &ServerHandle, kind: MessageType, id: u32, payload: Value) -> Response {
    exchange(handle, &Message::new(kind, id, payload).encode().unwrap())
}

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn heartbeat_round_trip() {
    let (handle, join) = start(Duration::from_secs(30));

    let resp = call(&handle, MessageType::Heartbeat, 9, Value::Null);
    assert_eq!(resp.status, Status::Success);
    assert_eq!((resp.kind, resp.id), (5, 9));
    assert_eq!(resp.message, "heartbeat received");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn login_then_profile_over_the_wire() {
    let (handle, join) = start(Duration::from_secs(30));

    let resp = call(
        &handle,
        MessageType::Login,
        1,
        json!({"username": "alice", "password": "secret"}),
    );
    assert_eq!(resp.status, Status::Success);
    assert_eq!(resp.payload["user"]["username"], "alice");
    let token = resp.payload["token"].as_str().unwrap().to_string();

    let resp = call(&handle, MessageType::GetProfile, 2, json!({ "token": token }));
    assert_eq!(resp.status, Status::Success);
    assert_eq!(resp.payload["user"]["nickname"], "Alice");

    handle.stop();
    join.join().unwrap();
}

#[test]
fn malformed_body_gets_an_error_reply() {
    let (handle, join) = start(Duration::from_secs(30));

    let resp = exchange(&handle, &encode_frame(b"{not json").unwrap());
    assert_eq!(resp.status, Status::Error);
    assert_eq!((resp.kind, resp.id), (0, 0));
    assert_eq!(resp.message, reason::MALFORMED_MESSAGE);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn unknown_type_gets_an_error_reply() {
    let (handle, join) = start(Duration::from_secs(30));

    let body = serde_json::to_vec(&json!({"type": 42, "id": 3})).unwrap();
    let resp = exchange(&handle, &encode_frame(&body).unwrap());
    assert_eq!(resp.status, Status::Error);
    assert_eq!((resp.kind, resp.id), (42, 3));
    assert_eq!(resp.message, reason::UNKNOWN_MESSAGE_TYPE);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn split_frame_is_reassembled() {
    let (handle, join) = start(Duration::from_secs(30));

    let frame = Message::new(MessageType::Heartbeat, 4, Value::Null)
        .encode()
        .unwrap();
    let (head, tail) = frame.split_at(6);

    let mut stream = connect(&handle);
    stream.write_all(head).unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(100));
    stream.write_all(tail).unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert_eq!(Response::decode(&reply).unwrap().id, 4);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn silent_client_is_dropped_without_reply() {
    let (handle, join) = start(Duration::from_millis(200));

    let mut stream = connect(&handle);
    // Half a length prefix, then nothing.
    stream.write_all(&[0, 0]).unwrap();

    let started = Instant::now();
    let mut reply = Vec::new();
    let _ = stream.read_to_end(&mut reply);
    assert!(reply.is_empty());
    assert!(started.elapsed() < Duration::from_secs(4));

    wait_for(|| handle.live_connections() == 0);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn stop_closes_live_connections() {
    let (handle, join) = start(Duration::from_secs(30));

    let mut idle = connect(&handle);
    wait_for(|| handle.live_connections() == 1);

    handle.stop();
    join.join().unwrap();

    let mut buf = Vec::new();
    let _ = idle.read_to_end(&mut buf);
    assert!(buf.is_empty());
    assert_eq!(handle.live_connections(), 0);
    assert!(!handle.is_running());
    assert!(TcpStream::connect(handle.local_addr()).is_err());
}

#[test]
fn counts_accepted_connections() {
    let (handle, join) = start(Duration::from_secs(30));

    for id in 0..3 {
        call(&handle, MessageType::Heartbeat, id, Value::Null);
    }
    assert_eq!(handle.request_count(), 3);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn panicking_worker_releases_its_connection() {
    let (handle, join) = start_with(Arc::new(PanickingStore), Duration::from_secs(30));

    let mut stream = connect(&handle);
    let login = Message::new(
        MessageType::Login,
        1,
        json!({"username": "alice", "password": "secret"}),
    );
    stream.write_all(&login.encode().unwrap()).unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert!(reply.is_empty());
    wait_for(|| handle.live_connections() == 0);

    // The accept loop is unaffected.
    let resp = call(&handle, MessageType::Heartbeat, 2, Value::Null);
    assert_eq!(resp.status, Status::Success);

    handle.stop();
    join.join().unwrap();
}

#[test]
fn unrepresentable_read_timeout_drops_the_connection() {
    let (handle, join) = start(Duration::MAX);

    let mut stream = connect(&handle);
    let frame = Message::new(MessageType::Heartbeat, 3, Value::Null)
        .encode()
        .unwrap();
    // The server may close before reading, so the write can fail.
    let _ = stream.write_all(&frame);

    let mut reply = Vec::new();
    let _ = stream.read_to_end(&mut reply);
    assert!(reply.is_empty());
    wait_for(|| handle.live_connections() == 0);
    assert!(handle.is_running());

    handle.stop();
    join.join().unwrap();
}
