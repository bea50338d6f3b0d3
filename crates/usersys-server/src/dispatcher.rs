use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use usersys_db::{SessionStore, UserStore};
use usersys_protocol::{
    LoginReply, LoginRequest, Message, ProfileReply, Request, RequestError, Response,
    TokenRequest, UpdateProfileRequest, reason,
};

use crate::auth::{self, AuthError};

const LOGIN_OK: &str = "login successful";
const PROFILE_OK: &str = "profile loaded";
const UPDATE_OK: &str = "profile updated";
const LOGOUT_OK: &str = "logout successful";
const HEARTBEAT_OK: &str = "heartbeat received";

const LOGIN_FAILED: &str = "login failed, please retry";
const PROFILE_FAILED: &str = "failed to load profile";
const UPDATE_FAILED: &str = "profile update failed";
const LOGOUT_FAILED: &str = "logout failed";
const SESSION_CHECK_FAILED: &str = "session check failed, please retry";
const ENCODE_FAILED: &str = "response serialization failed";

/// Routes a decoded message to its handler and builds the response.
///
/// Holds no per-request state; everything mutable lives in the two stores.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    session_ttl: Duration,
}

/// A refused request; the text becomes the ERROR response message.
#[derive(Debug)]
struct Rejected(&'static str);

type Outcome = Result<(&'static str, Value), Rejected>;

impl Dispatcher {
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        session_ttl: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                users,
                sessions,
                session_ttl,
            }),
        }
    }

    /// Answer one message. Never fails: every problem becomes an ERROR
    /// response echoing the message's type and id.
    pub fn dispatch(&self, message: &Message) -> Response {
        let request = match Request::from_message(message) {
            Ok(request) => request,
            Err(RequestError::UnknownType(kind)) => {
                warn!(kind, id = message.id, "unknown message type");
                return Response::error(message.kind, message.id, reason::UNKNOWN_MESSAGE_TYPE);
            }
            Err(e) => {
                debug!(id = message.id, "rejecting request: {}", e);
                return Response::error(message.kind, message.id, reason::INVALID_REQUEST_FORMAT);
            }
        };

        let kind = request.message_type();
        let outcome = match request {
            Request::Login(req) => self.login(req),
            Request::GetProfile(req) => self.get_profile(req),
            Request::UpdateProfile(req) => self.update_profile(req),
            Request::Logout(req) => self.logout(req),
            Request::Heartbeat => Ok((HEARTBEAT_OK, Value::Null)),
        };

        match outcome {
            Ok((text, payload)) => {
                debug!(kind = kind.name(), id = message.id, "request succeeded");
                Response::success(message.kind, message.id, text, payload)
            }
            Err(Rejected(text)) => {
                debug!(kind = kind.name(), id = message.id, reason = text, "request rejected");
                Response::error(message.kind, message.id, text)
            }
        }
    }

    fn login(&self, req: LoginRequest) -> Outcome {
        let user = self
            .inner
            .users
            .find_by_username(&req.username)
            .map_err(|e| store_failure(LOGIN_FAILED, e))?
            .ok_or(Rejected(reason::INVALID_CREDENTIALS))?;

        if !auth::verify_password(&req.password, &user.password_hash) {
            return Err(Rejected(reason::INVALID_CREDENTIALS));
        }

        let token = self
            .inner
            .sessions
            .create(user.id, self.inner.session_ttl)
            .map_err(|e| store_failure(LOGIN_FAILED, e))?;

        info!(user_id = user.id, username = %user.username, "user logged in");
        reply(
            LOGIN_OK,
            &LoginReply {
                token,
                user: user.to_profile(),
            },
        )
    }

    fn get_profile(&self, req: TokenRequest) -> Outcome {
        let user_id = self.authenticate(&req.token)?;

        // A live session whose user row has gone is reported like any other
        // lookup failure; the session itself is left alone.
        let user = self
            .inner
            .users
            .find_by_id(user_id)
            .map_err(|e| store_failure(PROFILE_FAILED, e))?
            .ok_or(Rejected(PROFILE_FAILED))?;

        reply(PROFILE_OK, &ProfileReply { user: user.to_profile() })
    }

    fn update_profile(&self, req: UpdateProfileRequest) -> Outcome {
        let user_id = self.authenticate(&req.token)?;

        self.inner
            .users
            .update_profile(user_id, &req.nickname, &req.profile_pic)
            .map_err(|e| store_failure(UPDATE_FAILED, e))?;

        let user = self
            .inner
            .users
            .find_by_id(user_id)
            .map_err(|e| store_failure(UPDATE_FAILED, e))?
            .ok_or(Rejected(UPDATE_FAILED))?;

        info!(user_id, "profile updated");
        reply(UPDATE_OK, &ProfileReply { user: user.to_profile() })
    }

    fn logout(&self, req: TokenRequest) -> Outcome {
        self.inner
            .sessions
            .delete(&req.token)
            .map_err(|e| store_failure(LOGOUT_FAILED, e))?;
        Ok((LOGOUT_OK, Value::Null))
    }

    fn authenticate(&self, token: &str) -> Result<i64, Rejected> {
        auth::validate(self.inner.sessions.as_ref(), token, self.inner.session_ttl).map_err(
            |e| match e {
                AuthError::InvalidSession => Rejected(reason::INVALID_SESSION),
                AuthError::Store(e) => store_failure(SESSION_CHECK_FAILED, e),
            },
        )
    }
}

fn reply<T: Serialize>(text: &'static str, payload: &T) -> Outcome {
    match serde_json::to_value(payload) {
        Ok(value) => Ok((text, value)),
        Err(e) => {
            error!("Failed to serialize reply: {}", e);
            Err(Rejected(ENCODE_FAILED))
        }
    }
}

fn store_failure(text: &'static str, err: anyhow::Error) -> Rejected {
    error!("Store failure ({}): {:#}", text, err);
    Rejected(text)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use usersys_db::{Database, InMemorySessionStore, ManualClock, UserRow};
    use usersys_protocol::{MessageType, Status};

    use super::*;

    const TTL: Duration = Duration::from_secs(3600);

    struct Fixture {
        dispatcher: Dispatcher,
        clock: Arc<ManualClock>,
        alice_id: i64,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let alice_id = db
            .create_user("alice", &auth::legacy_digest("secret"), "Alice", "alice.png")
            .unwrap();
        let clock = Arc::new(ManualClock::new());
        let sessions = InMemorySessionStore::with_clock(clock.clone());
        Fixture {
            dispatcher: Dispatcher::new(Arc::new(db), Arc::new(sessions), TTL),
            clock,
            alice_id,
        }
    }

    fn send(d: &Dispatcher, kind: MessageType, payload: Value) -> Response {
        d.dispatch(&Message::new(kind, 77, payload))
    }

    fn login(d: &Dispatcher) -> String {
        let resp = send(
            d,
            MessageType::Login,
            json!({"username": "alice", "password": "secret"}),
        );
        assert_eq!(resp.status, Status::Success, "{}", resp.message);
        resp.payload["token"].as_str().unwrap().to_string()
    }

    #[test]
    fn login_returns_token_and_user() {
        let f = fixture();
        let resp = send(
            &f.dispatcher,
            MessageType::Login,
            json!({"username": "alice", "password": "secret"}),
        );
        assert_eq!(resp.status, Status::Success);
        assert_eq!(resp.kind, 1);
        assert_eq!(resp.id, 77);

        let reply: LoginReply = serde_json::from_value(resp.payload).unwrap();
        assert!(!reply.token.is_empty());
        assert_eq!(reply.user.username, "alice");
        assert_eq!(reply.user.id, f.alice_id);
        assert_eq!(reply.user.nickname, "Alice");
    }

    #[test]
    fn wrong_password_and_unknown_user_look_the_same() {
        let f = fixture();
        let wrong = send(
            &f.dispatcher,
            MessageType::Login,
            json!({"username": "alice", "password": "wrong"}),
        );
        let unknown = send(
            &f.dispatcher,
            MessageType::Login,
            json!({"username": "mallory", "password": "secret"}),
        );
        for resp in [wrong, unknown] {
            assert_eq!(resp.status, Status::Error);
            assert_eq!(resp.message, reason::INVALID_CREDENTIALS);
            assert!(resp.payload.is_null());
        }
    }

    #[test]
    fn token_from_login_authenticates_profile_calls() {
        let f = fixture();
        let token = login(&f.dispatcher);

        let resp = send(&f.dispatcher, MessageType::GetProfile, json!({ "token": token }));
        assert_eq!(resp.status, Status::Success);
        let reply: ProfileReply = serde_json::from_value(resp.payload).unwrap();
        assert_eq!(reply.user.id, f.alice_id);
    }

    #[test]
    fn unissued_token_is_invalid_session() {
        let f = fixture();
        for kind in [MessageType::GetProfile, MessageType::UpdateProfile] {
            let resp = send(&f.dispatcher, kind, json!({"token": "forged"}));
            assert_eq!(resp.status, Status::Error);
            assert_eq!(resp.message, reason::INVALID_SESSION);
        }
    }

    #[test]
    fn update_then_get_round_trips() {
        let f = fixture();
        let token = login(&f.dispatcher);

        let resp = send(
            &f.dispatcher,
            MessageType::UpdateProfile,
            json!({"token": token, "nickname": "Ally", "profile_pic": "new.png"}),
        );
        assert_eq!(resp.status, Status::Success);
        let updated: ProfileReply = serde_json::from_value(resp.payload).unwrap();
        assert_eq!(updated.user.nickname, "Ally");

        let resp = send(&f.dispatcher, MessageType::GetProfile, json!({ "token": token }));
        let fetched: ProfileReply = serde_json::from_value(resp.payload).unwrap();
        assert_eq!(fetched.user.nickname, "Ally");
        assert_eq!(fetched.user.profile_pic, "new.png");
    }

    #[test]
    fn logout_is_idempotent_and_kills_the_session() {
        let f = fixture();
        let token = login(&f.dispatcher);

        for _ in 0..2 {
            let resp = send(&f.dispatcher, MessageType::Logout, json!({ "token": token }));
            assert_eq!(resp.status, Status::Success);
            assert!(resp.payload.is_null());
        }

        let resp = send(&f.dispatcher, MessageType::GetProfile, json!({ "token": token }));
        assert_eq!(resp.message, reason::INVALID_SESSION);
    }

    #[test]
    fn sessions_slide_and_expire_when_idle() {
        let f = fixture();
        let token = login(&f.dispatcher);
        let get = || send(&f.dispatcher, MessageType::GetProfile, json!({ "token": token }));

        f.clock.advance(TTL - Duration::from_secs(1));
        assert_eq!(get().status, Status::Success);
        f.clock.advance(TTL - Duration::from_secs(1));
        assert_eq!(get().status, Status::Success);

        f.clock.advance(TTL + Duration::from_secs(1));
        assert_eq!(get().message, reason::INVALID_SESSION);
    }

    #[test]
    fn bad_payload_is_invalid_request_format() {
        let f = fixture();
        let resp = send(&f.dispatcher, MessageType::Login, json!({"username": 5}));
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.message, reason::INVALID_REQUEST_FORMAT);
        assert_eq!(resp.id, 77);
    }

    #[test]
    fn unknown_type_is_rejected_with_echoed_envelope() {
        let f = fixture();
        let resp = f.dispatcher.dispatch(&Message {
            kind: 99,
            id: 5,
            payload: Value::Null,
        });
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.message, reason::UNKNOWN_MESSAGE_TYPE);
        assert_eq!((resp.kind, resp.id), (99, 5));
    }

    /// Fails the test if any store method is reached.
    struct Untouchable;

    impl UserStore for Untouchable {
        fn find_by_username(&self, _: &str) -> anyhow::Result<Option<UserRow>> {
            panic!("user store touched")
        }
        fn find_by_id(&self, _: i64) -> anyhow::Result<Option<UserRow>> {
            panic!("user store touched")
        }
        fn update_profile(&self, _: i64, _: &str, _: &str) -> anyhow::Result<()> {
            panic!("user store touched")
        }
    }

    impl SessionStore for Untouchable {
        fn create(&self, _: i64, _: Duration) -> anyhow::Result<String> {
            panic!("session store touched")
        }
        fn get(&self, _: &str) -> anyhow::Result<Option<i64>> {
            panic!("session store touched")
        }
        fn exists(&self, _: &str) -> anyhow::Result<bool> {
            panic!("session store touched")
        }
        fn refresh(&self, _: &str, _: Duration) -> anyhow::Result<()> {
            panic!("session store touched")
        }
        fn delete(&self, _: &str) -> anyhow::Result<()> {
            panic!("session store touched")
        }
    }

    #[test]
    fn heartbeat_never_touches_the_stores() {
        let d = Dispatcher::new(Arc::new(Untouchable), Arc::new(Untouchable), TTL);
        for payload in [Value::Null, json!({"junk": true}), json!("x")] {
            let resp = send(&d, MessageType::Heartbeat, payload);
            assert_eq!(resp.status, Status::Success);
            assert_eq!(resp.message, HEARTBEAT_OK);
        }
    }

    /// A user store that is always down.
    struct Down;

    impl UserStore for Down {
        fn find_by_username(&self, _: &str) -> anyhow::Result<Option<UserRow>> {
            anyhow::bail!("connection refused")
        }
        fn find_by_id(&self, _: i64) -> anyhow::Result<Option<UserRow>> {
            anyhow::bail!("connection refused")
        }
        fn update_profile(&self, _: i64, _: &str, _: &str) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    #[test]
    fn store_failure_becomes_error_response() {
        let d = Dispatcher::new(Arc::new(Down), Arc::new(InMemorySessionStore::new()), TTL);
        let resp = send(
            &d,
            MessageType::Login,
            json!({"username": "alice", "password": "secret"}),
        );
        assert_eq!(resp.status, Status::Error);
        assert_eq!(resp.message, LOGIN_FAILED);
    }
}
