//! Session scenarios, driven through the same [`Input`] values the
//! runtime feeds the engine. Client output, API requests, and outbound
//! stream frames are captured from their channels instead of sockets.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

use super::*;
use crate::world::DmState;

struct Harness {
    engine: Engine,
    api_rx: mpsc::UnboundedReceiver<ApiRequest>,
    #[allow(dead_code)]
    input_rx: mpsc::UnboundedReceiver<Input>,
}

fn harness(password: Option<&str>) -> Harness {
    let cfg = Config {
        slack_token: "tok".into(),
        password: password.map(str::to_owned),
        port: 6667,
        unix_socket: None,
        debug_dump: false,
    };
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (api_tx, api_rx) = mpsc::unbounded_channel();
    let api = Arc::new(ApiClient::new("tok"));
    let engine = Engine::new(&cfg, api, input_tx, api_tx, Arc::new(AtomicBool::new(false)));
    Harness {
        engine,
        api_rx,
        input_rx,
    }
}

impl Harness {
    fn connect(&mut self, conn: ConnId) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.handle(Input::Connected {
            conn,
            tx,
            peer: format!("test:{conn}"),
        });
        rx
    }

    fn line(&mut self, conn: ConnId, raw: &str) {
        let msg = Message::parse(raw).unwrap();
        self.engine.handle(Input::Line { conn, msg });
    }

    /// Inject a successful bootstrap; returns the captured outbound
    /// stream frames.
    fn go_live(&mut self, snapshot: Value) -> mpsc::UnboundedReceiver<Value> {
        let snapshot: Snapshot = serde_json::from_value(snapshot).unwrap();
        let (rtm_tx, rtm_rx) = mpsc::unbounded_channel();
        self.engine.state = SessionState::Bootstrapping;
        let gen = self.engine.generation;
        self.engine.handle(Input::BootstrapDone {
            gen,
            result: Ok((snapshot, rtm_tx)),
        });
        rtm_rx
    }

    fn rtm(&mut self, event: Value) {
        let event: RtmEvent = serde_json::from_value(event).unwrap();
        let gen = self.engine.generation;
        self.engine.handle(Input::Rtm { gen, event });
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg.to_wire());
    }
    out
}

fn drain_frames(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.push(frame);
    }
    out
}

fn drain_api(rx: &mut mpsc::UnboundedReceiver<ApiRequest>) -> Vec<ApiRequest> {
    let mut out = Vec::new();
    while let Ok(req) = rx.try_recv() {
        out.push(req);
    }
    out
}

fn method_of(req: &ApiRequest) -> &str {
    match &req.kind {
        ApiCall::Method { method, .. } => method,
        ApiCall::FetchFile { .. } => "files.fetch",
    }
}

fn snapshot() -> Value {
    json!({
        "url": "wss://example.test/ws",
        "self": { "id": "U_ME" },
        "users": [
            { "id": "U_ME", "name": "me", "real_name": "Me Myself" },
            { "id": "U_BOB", "name": "bob", "real_name": "Bob B", "presence": "active" }
        ],
        "channels": [
            { "id": "C1", "name": "general", "is_member": true,
              "topic": { "value": "general chat" }, "members": ["U_ME", "U_BOB"] },
            { "id": "C2", "name": "random", "is_member": false, "members": [] }
        ],
        "groups": [],
        "ims": [],
        "bots": []
    })
}

/// Register a client and drain its welcome burst.
fn ready_client(h: &mut Harness, conn: ConnId, nick: &str) -> mpsc::UnboundedReceiver<Message> {
    let mut rx = h.connect(conn);
    h.line(conn, &format!("NICK {nick}"));
    h.line(conn, &format!("USER {nick} 0 * :{nick}"));
    drain(&mut rx);
    rx
}

// ── Cold welcome ─────────────────────────────────────────────────

#[tokio::test]
async fn cold_welcome_waits_for_session() {
    let mut h = harness(Some("secret"));
    let mut rx = h.connect(1);

    h.line(1, "PASS secret");
    h.line(1, "NICK alice");
    h.line(1, "USER a 0 * :Alice");

    let lines = drain(&mut rx);
    assert!(
        lines.contains(&":localhost NOTICE * :Waiting for RTM connection".to_owned()),
        "got: {lines:?}"
    );

    let _frames = h.go_live(snapshot());
    let lines = drain(&mut rx);

    let pos = |needle: &str| {
        lines
            .iter()
            .position(|l| l.contains(needle))
            .unwrap_or_else(|| panic!("missing {needle:?} in {lines:?}"))
    };
    let welcome = pos(" 001 alice ");
    let motd_end = pos(" 376 alice ");
    let join = pos(":alice!alice@localhost JOIN :#general");
    let topic = pos(" 332 alice #general :general chat");
    let names = pos(" 353 alice = #general :alice bob");
    let names_end = pos(" 366 alice #general ");
    assert!(welcome < motd_end && motd_end < join && join < topic);
    assert!(topic < names && names < names_end);
    // Current self presence is active.
    assert!(lines.iter().any(|l| l.contains(" 305 alice ")));
}

#[tokio::test]
async fn bad_password_is_rejected() {
    let mut h = harness(Some("secret"));
    let mut rx = h.connect(1);

    h.line(1, "PASS wrong");
    h.line(1, "NICK alice");
    h.line(1, "USER a 0 * :Alice");

    let lines = drain(&mut rx);
    assert!(lines.contains(&"ERROR :Bad password".to_owned()), "got: {lines:?}");
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
}

#[tokio::test]
async fn nick_collision_rejects_connection() {
    let mut h = harness(None);
    h.go_live(snapshot());

    let mut rx = h.connect(1);
    h.line(1, "NICK bob"); // collides with upstream user U_BOB
    h.line(1, "USER b 0 * :Bob");

    let lines = drain(&mut rx);
    assert!(
        lines.iter().any(|l| l.contains(" 433 ") && l.contains("Nickname is already in use")),
        "got: {lines:?}"
    );
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
}

#[tokio::test]
async fn own_nick_does_not_collide_with_self() {
    let mut h = harness(None);
    h.go_live(snapshot());

    // "me" is the upstream self nick; an IRC client may take it.
    let mut rx = h.connect(1);
    h.line(1, "NICK me");
    h.line(1, "USER m 0 * :Me");
    let lines = drain(&mut rx);
    assert!(lines.iter().any(|l| l.contains(" 001 me ")), "got: {lines:?}");
}

// ── Channel echo and read-marks ──────────────────────────────────

#[tokio::test]
async fn channel_message_roundtrip() {
    let mut h = harness(None);
    let mut frames = h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    h.line(1, "PRIVMSG #general :hello <@bob> & bye");
    let sent = drain_frames(&mut frames);
    assert_eq!(
        sent,
        vec![json!({
            "id": 1,
            "type": "message",
            "channel": "C1",
            "text": "hello <@U_BOB> &amp; bye"
        })]
    );

    // The upstream echo fans out to every ready client, sender included.
    h.rtm(json!({
        "type": "message", "channel": "C1", "user": "U_ME",
        "text": "hello <@U_BOB> &amp; bye", "ts": "111.22"
    }));
    let lines = drain(&mut rx);
    assert_eq!(
        lines,
        vec![":alice!alice@localhost PRIVMSG #general :hello <@bob> & bye".to_owned()]
    );

    // The read-mark is debounced: flushing issues one channels.mark with
    // the latest timestamp.
    h.rtm(json!({
        "type": "message", "channel": "C1", "user": "U_BOB",
        "text": "later", "ts": "111.99"
    }));
    drain(&mut rx);
    let gen = h.engine.generation;
    h.engine.handle(Input::MarkFlush { gen });
    let calls = drain_api(&mut h.api_rx);
    let marks: Vec<_> = calls.iter().filter(|r| method_of(r) == "channels.mark").collect();
    assert_eq!(marks.len(), 1);
    let ApiCall::Method { params, .. } = &marks[0].kind else {
        unreachable!()
    };
    assert!(params.contains(&("channel".to_owned(), "C1".to_owned())));
    assert!(params.contains(&("ts".to_owned(), "111.99".to_owned())));

    // The queue is empty: a second flush issues nothing.
    h.engine.handle(Input::MarkFlush { gen });
    assert!(drain_api(&mut h.api_rx).is_empty());
}

#[tokio::test]
async fn inbound_message_splits_lines_and_tags_subtype() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    h.rtm(json!({
        "type": "message", "channel": "C1", "user": "U_BOB",
        "subtype": "me_message", "text": "one\ntwo", "ts": "1.2"
    }));
    let lines = drain(&mut rx);
    assert_eq!(
        lines,
        vec![
            ":bob!bob@localhost PRIVMSG #general :\u{2}[me_message]\u{2} one".to_owned(),
            ":bob!bob@localhost PRIVMSG #general :\u{2}[me_message]\u{2} two".to_owned(),
        ]
    );
}

// ── DM queueing ──────────────────────────────────────────────────

#[tokio::test]
async fn dm_queue_flushes_in_order_on_im_open() {
    let mut h = harness(None);
    let mut frames = h.go_live(snapshot());
    let _rx = ready_client(&mut h, 1, "alice");

    h.line(1, "PRIVMSG bob :hi");
    let calls = drain_api(&mut h.api_rx);
    assert!(calls.iter().any(|r| method_of(r) == "im.open"), "got: {calls:?}");
    assert_eq!(h.engine.world().users["U_BOB"].dm, DmState::Pending);

    h.line(1, "PRIVMSG bob :there");
    // Still pending: nothing sent yet.
    assert!(drain_frames(&mut frames).is_empty());

    h.rtm(json!({ "type": "im_open", "user": "U_BOB", "channel": "D1" }));
    let sent = drain_frames(&mut frames);
    assert_eq!(
        sent,
        vec![
            json!({ "id": 1, "type": "message", "channel": "D1", "text": "hi" }),
            json!({ "id": 2, "type": "message", "channel": "D1", "text": "there" }),
        ]
    );
    assert!(h.engine.world().users["U_BOB"].tx_queue.is_empty());
    assert_eq!(h.engine.world().users["U_BOB"].dm, DmState::Open("D1".into()));

    // Once open, messages go straight out.
    h.line(1, "PRIVMSG bob :again");
    let sent = drain_frames(&mut frames);
    assert_eq!(sent[0]["channel"], "D1");
    assert_eq!(sent[0]["text"], "again");
}

#[tokio::test]
async fn inbound_dm_is_delivered_to_client() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    h.rtm(json!({ "type": "im_open", "user": "U_BOB", "channel": "D1" }));
    h.rtm(json!({ "type": "message", "channel": "D1", "user": "U_BOB", "text": "psst" }));
    let lines = drain(&mut rx);
    assert_eq!(lines, vec![":bob!bob@localhost PRIVMSG alice :psst".to_owned()]);
}

// ── Archive ──────────────────────────────────────────────────────

#[tokio::test]
async fn archive_parts_and_deletes_channel() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    h.rtm(json!({ "type": "channel_archive", "channel": "C1" }));
    let lines = drain(&mut rx);
    assert_eq!(lines, vec![":alice!alice@localhost PART :#general".to_owned()]);
    assert!(h.engine.world().channels.is_empty());

    h.line(1, "JOIN #general");
    let lines = drain(&mut rx);
    assert!(
        lines.iter().any(|l| l.contains(" 401 alice #general ")),
        "got: {lines:?}"
    );
}

// ── Membership events ────────────────────────────────────────────

#[tokio::test]
async fn member_join_and_part_broadcast_once() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    // U_BOB is already a member: the duplicate join is suppressed.
    h.rtm(json!({ "type": "member_joined_channel", "user": "U_BOB", "channel": "C1" }));
    assert!(drain(&mut rx).is_empty());

    h.rtm(json!({ "type": "member_left_channel", "user": "U_BOB", "channel": "C1" }));
    assert_eq!(
        drain(&mut rx),
        vec![":bob!bob@localhost PART :#general".to_owned()]
    );

    h.rtm(json!({ "type": "member_joined_channel", "user": "U_BOB", "channel": "C1" }));
    assert_eq!(
        drain(&mut rx),
        vec![":bob!bob@localhost JOIN :#general".to_owned()]
    );
}

#[tokio::test]
async fn unknown_member_is_stubbed_and_resolved() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");
    drain_api(&mut h.api_rx);

    h.rtm(json!({ "type": "member_joined_channel", "user": "U_NEW", "channel": "C1" }));
    assert_eq!(
        drain(&mut rx),
        vec![":U_NEW!U_NEW@localhost JOIN :#general".to_owned()]
    );
    let calls = drain_api(&mut h.api_rx);
    assert!(calls.iter().any(|r| method_of(r) == "users.info"));

    // The deferred users.info supplies real attributes and renames.
    let gen = h.engine.generation;
    h.engine.handle(Input::Api {
        gen,
        ctx: ApiCtx::UserInfo { user: "U_NEW".into() },
        result: Ok(ApiData::Call(json!({
            "ok": true,
            "user": { "id": "U_NEW", "name": "carol" }
        }))),
    });
    assert_eq!(h.engine.world().users["U_NEW"].nick, "carol");
    assert_eq!(
        drain(&mut rx),
        vec![":U_NEW!U_NEW@localhost NICK :carol".to_owned()]
    );
}

// ── Presence ─────────────────────────────────────────────────────

#[tokio::test]
async fn self_presence_change_broadcasts_away_numerics() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    h.rtm(json!({ "type": "manual_presence_change", "presence": "away" }));
    let lines = drain(&mut rx);
    assert!(lines.iter().any(|l| l.contains(" 306 alice ")), "got: {lines:?}");

    // Unchanged presence does not re-broadcast.
    h.rtm(json!({ "type": "presence_change", "user": "U_ME", "presence": "away" }));
    assert!(drain(&mut rx).is_empty());

    h.rtm(json!({ "type": "presence_change", "user": "U_ME", "presence": "active" }));
    let lines = drain(&mut rx);
    assert!(lines.iter().any(|l| l.contains(" 305 alice ")), "got: {lines:?}");
}

// ── Teardown and reconnect ───────────────────────────────────────

#[tokio::test]
async fn two_missed_pongs_tear_the_session_down() {
    let mut h = harness(None);
    let mut frames = h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    let gen = h.engine.generation;
    h.engine.handle(Input::RtmPingTick { gen });
    h.engine.handle(Input::RtmPingTick { gen });
    assert_eq!(drain_frames(&mut frames).len(), 2); // two pings, no pong

    h.engine.handle(Input::RtmPingTick { gen });
    let lines = drain(&mut rx);
    assert!(
        lines.contains(&":localhost NOTICE alice :RTM ping timeout".to_owned()),
        "got: {lines:?}"
    );
    // Evicted, and the world is gone.
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    assert!(h.engine.world().users.is_empty());
    assert!(h.engine.world().channels.is_empty());
    assert!(h.engine.world().self_id.is_none());
}

#[tokio::test]
async fn pong_resets_the_heartbeat() {
    let mut h = harness(None);
    let mut frames = h.go_live(snapshot());
    let _rx = ready_client(&mut h, 1, "alice");

    let gen = h.engine.generation;
    h.engine.handle(Input::RtmPingTick { gen });
    h.rtm(json!({ "type": "pong", "reply_to": 1 }));
    h.engine.handle(Input::RtmPingTick { gen });
    h.rtm(json!({ "type": "pong", "reply_to": 2 }));
    h.engine.handle(Input::RtmPingTick { gen });

    // Three pings sent, none fatal.
    assert_eq!(drain_frames(&mut frames).len(), 3);
    assert!(h.engine.is_live());
}

#[tokio::test]
async fn stale_generation_inputs_are_discarded() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let _rx = ready_client(&mut h, 1, "alice");

    let old_gen = h.engine.generation;
    h.engine.handle(Input::RtmClosed { gen: old_gen });
    assert!(!h.engine.is_live());

    // Late completions and frames from the torn-down session are inert.
    h.engine.handle(Input::Api {
        gen: old_gen,
        ctx: ApiCtx::UserInfo { user: "U_BOB".into() },
        result: Ok(ApiData::Call(json!({ "ok": true, "user": { "id": "U_X", "name": "x" } }))),
    });
    let event: RtmEvent =
        serde_json::from_value(json!({ "type": "im_open", "user": "U_BOB", "channel": "D1" }))
            .unwrap();
    h.engine.handle(Input::Rtm { gen: old_gen, event });
    assert!(h.engine.world().users.is_empty());
}

// ── Gateway commands ─────────────────────────────────────────────

#[tokio::test]
async fn gateway_commands_call_the_api() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");
    drain_api(&mut h.api_rx);

    h.line(1, "PRIVMSG X :newgroup warroom");
    h.line(1, "PRIVMSG x :archive general");
    let calls = drain_api(&mut h.api_rx);
    assert_eq!(method_of(&calls[0]), "groups.create");
    assert_eq!(method_of(&calls[1]), "channels.archive");

    h.line(1, "PRIVMSG X :bogus");
    let lines = drain(&mut rx);
    assert!(
        lines.iter().any(|l| l.starts_with(":X!X@localhost NOTICE alice :unknown command: bogus")),
        "got: {lines:?}"
    );
}

#[tokio::test]
async fn cat_replays_file_between_delimiters() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    h.line(1, "PRIVMSG X :cat F123");
    let calls = drain_api(&mut h.api_rx);
    assert!(calls.iter().any(|r| matches!(&r.kind, ApiCall::FetchFile { id } if id == "F123")));

    let gen = h.engine.generation;
    h.engine.handle(Input::Api {
        gen,
        ctx: ApiCtx::CatFile { conn: 1 },
        result: Ok(ApiData::File(FileContent {
            id: "F123".into(),
            content: "line one\nline two".into(),
        })),
    });
    assert_eq!(
        drain(&mut rx),
        vec![
            ":X!X@localhost NOTICE alice :---- BEGIN F123 ----".to_owned(),
            ":X!X@localhost NOTICE alice :line one".to_owned(),
            ":X!X@localhost NOTICE alice :line two".to_owned(),
            ":X!X@localhost NOTICE alice :---- END F123 ----".to_owned(),
        ]
    );
}

// ── Failed DM open ───────────────────────────────────────────────

#[tokio::test]
async fn failed_im_open_drains_queue_to_notices() {
    let mut h = harness(None);
    h.go_live(snapshot());
    let mut rx = ready_client(&mut h, 1, "alice");

    h.line(1, "PRIVMSG bob :lost message");
    let gen = h.engine.generation;
    h.engine.handle(Input::Api {
        gen,
        ctx: ApiCtx::ImOpen { user: "U_BOB".into() },
        result: Err(crate::slack::api::ApiError::Upstream("user_disabled".into())),
    });
    let lines = drain(&mut rx);
    assert!(
        lines.contains(&":localhost NOTICE alice :delivery to bob failed: lost message".to_owned()),
        "got: {lines:?}"
    );
    assert_eq!(h.engine.world().users["U_BOB"].dm, DmState::Absent);
    assert!(h.engine.world().users["U_BOB"].tx_queue.is_empty());
}

// ── NAMES chunking ───────────────────────────────────────────────

#[tokio::test]
async fn names_are_chunked_in_eights() {
    let mut h = harness(None);
    let users: Vec<Value> = (0..9)
        .map(|i| json!({ "id": format!("U{i}"), "name": format!("user{i}") }))
        .chain([json!({ "id": "U_ME", "name": "me" })])
        .collect();
    let members: Vec<String> = (0..9)
        .map(|i| format!("U{i}"))
        .chain(["U_ME".to_owned()])
        .collect();
    h.go_live(json!({
        "url": "wss://example.test/ws",
        "self": { "id": "U_ME" },
        "users": users,
        "channels": [
            { "id": "C1", "name": "busy", "is_member": true, "members": members }
        ],
        "groups": [], "ims": [], "bots": []
    }));

    let mut rx = h.connect(1);
    h.line(1, "NICK alice");
    h.line(1, "USER a 0 * :Alice");
    let lines = drain(&mut rx);
    let chunks: Vec<&String> = lines.iter().filter(|l| l.contains(" 353 ")).collect();
    assert_eq!(chunks.len(), 2, "got: {lines:?}");
    let names_in = |line: &str| line.rsplit(':').next().unwrap().split(' ').count();
    assert_eq!(names_in(chunks[0]), 8);
    assert_eq!(names_in(chunks[1]), 2);
}
