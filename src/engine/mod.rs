//! The gateway engine — sole owner of the world model and all per-client
//! state.
//!
//! One task runs [`Engine::run`], draining a single [`Input`] channel fed
//! by the IRC socket tasks, the RTM stream tasks, the API runner, and
//! timers. Handlers are synchronous, so world mutation never interleaves
//! with command dispatch.
//!
//! The engine also owns the upstream session lifecycle:
//!
//! ```text
//! idle → bootstrapping → live → (teardown) → cooling → bootstrapping → …
//! ```
//!
//! Teardown bumps the session generation; every in-flight API completion,
//! stream frame, and timer fire carries the generation it was issued
//! under and is discarded when stale. That single counter is the whole
//! cancellation story.

pub mod dispatch;
pub mod gateway;
pub mod router;
#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::irc::Message;
use crate::slack::api::{ApiClient, ApiError, FileContent};
use crate::slack::event::{RtmEvent, Snapshot, UserSnapshot};
use crate::slack::rtm;
use crate::world::{Channel, ChannelKind, NickChange, Presence, World};

pub type ConnId = u64;
pub type DumpFlag = Arc<AtomicBool>;

/// The name this server presents everywhere.
pub const SERVER_NAME: &str = "localhost";
/// Source prefix for gateway-command replies.
pub const GATEWAY_PREFIX: &str = "X!X@localhost";

const RTM_PING_INTERVAL: Duration = Duration::from_secs(60);
const RTM_PING_MISS_LIMIT: u32 = 2;
const MARK_DEBOUNCE: Duration = Duration::from_secs(5);
const RECONNECT_COOLDOWN: Duration = Duration::from_secs(5);
const CLIENT_PING_MISS_LIMIT: u32 = 3;
const NAMES_CHUNK: usize = 8;

/// Everything the engine reacts to.
#[derive(Debug)]
pub enum Input {
    /// A new IRC connection was accepted.
    Connected {
        conn: ConnId,
        tx: mpsc::UnboundedSender<Message>,
        peer: String,
    },
    /// A parsed line from a client.
    Line { conn: ConnId, msg: Message },
    /// A client socket reached EOF or errored.
    Gone { conn: ConnId },
    /// A client's ping watchdog ticked.
    PingTick { conn: ConnId },

    /// The bootstrap task finished.
    BootstrapDone {
        gen: u64,
        result: Result<SessionHandles, ApiError>,
    },
    /// An inbound stream event.
    Rtm { gen: u64, event: RtmEvent },
    /// The stream closed.
    RtmClosed { gen: u64 },
    /// The upstream heartbeat ticked.
    RtmPingTick { gen: u64 },
    /// The read-mark debounce expired.
    MarkFlush { gen: u64 },
    /// The reconnect cooldown expired.
    Cooled { gen: u64 },

    /// An API call completed.
    Api {
        gen: u64,
        ctx: ApiCtx,
        result: Result<ApiData, ApiError>,
    },
}

/// What a successful bootstrap hands the engine: the snapshot and the
/// sender for outbound stream frames.
pub type SessionHandles = (Snapshot, mpsc::UnboundedSender<Value>);

/// A request for the API runner.
#[derive(Debug)]
pub struct ApiRequest {
    pub gen: u64,
    pub ctx: ApiCtx,
    pub kind: ApiCall,
}

#[derive(Debug)]
pub enum ApiCall {
    Method {
        method: String,
        params: Vec<(String, String)>,
    },
    FetchFile {
        id: String,
    },
}

/// Completion context: what the engine does with the result.
#[derive(Debug, Clone)]
pub enum ApiCtx {
    /// Fire-and-forget; failures surface as a broadcast NOTICE.
    Plain { method: String },
    /// Deferred `users.info` for a stub user.
    UserInfo { user: String },
    /// `im.open` for a queued DM; failure drains the queue to NOTICEs.
    ImOpen { user: String },
    /// `cat` gateway command; body replays to the requesting client.
    CatFile { conn: ConnId },
    /// `file_share` inline body; emitted as a message from `user`.
    ShareFile {
        user: String,
        channel: Option<String>,
        peer: Option<String>,
    },
}

#[derive(Debug)]
pub enum ApiData {
    Call(Value),
    File(FileContent),
}

/// Per-connection IRC client state.
#[derive(Debug)]
pub(crate) struct Client {
    pub tx: mpsc::UnboundedSender<Message>,
    pub peer: String,
    pub nick: Option<String>,
    pub user: Option<String>,
    pub realname: Option<String>,
    pub password: Option<String>,
    pub authed: bool,
    pub ready: bool,
    pub ping_count: u32,
}

impl Client {
    fn new(tx: mpsc::UnboundedSender<Message>, peer: String) -> Self {
        Self {
            tx,
            peer,
            nick: None,
            user: None,
            realname: None,
            password: None,
            authed: false,
            ready: false,
            ping_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Bootstrapping,
    Live,
    Cooling,
}

pub struct Engine {
    world: World,
    clients: HashMap<ConnId, Client>,
    state: SessionState,
    generation: u64,
    /// Mirror of `generation` readable from timer tasks, so a long-lived
    /// ticker can notice teardown and stop.
    live_generation: Arc<AtomicU64>,
    input_tx: mpsc::UnboundedSender<Input>,
    api_tx: mpsc::UnboundedSender<ApiRequest>,
    api: Arc<ApiClient>,
    rtm_tx: Option<mpsc::UnboundedSender<Value>>,
    next_frame_id: u64,
    mark_queue: HashMap<String, String>,
    mark_timer_pending: bool,
    rtm_pings_outstanding: u32,
    password_digest: Option<[u8; 32]>,
    started_at: u64,
    dump: DumpFlag,
}

impl Engine {
    pub fn new(
        cfg: &Config,
        api: Arc<ApiClient>,
        input_tx: mpsc::UnboundedSender<Input>,
        api_tx: mpsc::UnboundedSender<ApiRequest>,
        dump: DumpFlag,
    ) -> Self {
        let password_digest = cfg
            .password
            .as_ref()
            .map(|p| Sha256::digest(p.as_bytes()).into());
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            world: World::new(),
            clients: HashMap::new(),
            state: SessionState::Idle,
            generation: 0,
            live_generation: Arc::new(AtomicU64::new(0)),
            input_tx,
            api_tx,
            api,
            rtm_tx: None,
            next_frame_id: 1,
            mark_queue: HashMap::new(),
            mark_timer_pending: false,
            rtm_pings_outstanding: 0,
            password_digest,
            started_at,
            dump,
        }
    }

    /// Kick off the first bootstrap.
    pub fn start(&mut self) {
        if self.state == SessionState::Idle {
            self.begin_bootstrap();
        }
    }

    /// Drain the input channel forever.
    pub async fn run(mut self, mut input_rx: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = input_rx.recv().await {
            self.handle(input);
        }
    }

    /// Process one input. Synchronous: the world never changes under a
    /// handler's feet.
    pub fn handle(&mut self, input: Input) {
        match input {
            Input::Connected { conn, tx, peer } => {
                self.clients.insert(conn, Client::new(tx, peer));
            }
            Input::Line { conn, msg } => self.handle_line(conn, msg),
            Input::Gone { conn } => {
                self.clients.remove(&conn);
            }
            Input::PingTick { conn } => self.client_ping_tick(conn),

            Input::BootstrapDone { gen, result } => self.on_bootstrap(gen, result),
            Input::Rtm { gen, event } => {
                if gen == self.generation && self.state == SessionState::Live {
                    self.handle_event(event);
                }
            }
            Input::RtmClosed { gen } => {
                if gen == self.generation && self.state == SessionState::Live {
                    self.teardown("RTM connection closed");
                }
            }
            Input::RtmPingTick { gen } => self.rtm_ping_tick(gen),
            Input::MarkFlush { gen } => {
                if gen == self.generation {
                    self.mark_timer_pending = false;
                    if self.state == SessionState::Live {
                        self.flush_marks();
                    }
                }
            }
            Input::Cooled { gen } => {
                if gen == self.generation && self.state == SessionState::Cooling {
                    self.begin_bootstrap();
                }
            }

            Input::Api { gen, ctx, result } => {
                if gen == self.generation {
                    self.on_api(ctx, result);
                }
            }
        }
    }

    // ── Session lifecycle ────────────────────────────────────────

    fn begin_bootstrap(&mut self) {
        self.state = SessionState::Bootstrapping;
        info!("rtm: starting session");
        let gen = self.generation;
        let api = self.api.clone();
        let input_tx = self.input_tx.clone();
        let dump = self.dump.clone();
        tokio::spawn(async move {
            let result = match rtm::connect(&api).await {
                Ok((snapshot, ws)) => {
                    let rtm_tx = rtm::spawn_stream(ws, gen, input_tx.clone(), dump);
                    Ok((snapshot, rtm_tx))
                }
                Err(e) => Err(e),
            };
            let _ = input_tx.send(Input::BootstrapDone { gen, result });
        });
    }

    fn on_bootstrap(&mut self, gen: u64, result: Result<SessionHandles, ApiError>) {
        if gen != self.generation || self.state != SessionState::Bootstrapping {
            return; // stale; dropping the handles closes the stream
        }
        match result {
            Ok((snapshot, rtm_tx)) => {
                self.rtm_tx = Some(rtm_tx);
                self.next_frame_id = 1;
                self.rtm_pings_outstanding = 0;
                self.apply_snapshot(&snapshot);
                self.state = SessionState::Live;
                self.spawn_rtm_ping_timer();
                info!(self_id = ?self.world.self_id, "session live");

                let waiting: Vec<ConnId> = self
                    .clients
                    .iter()
                    .filter(|(_, c)| c.authed && !c.ready)
                    .map(|(id, _)| *id)
                    .collect();
                for conn in waiting {
                    self.try_welcome(conn);
                }
            }
            Err(e) => {
                warn!("rtm: bootstrap failed: {e}");
                self.broadcast_authed_notice(&format!("RTM connect failed: {e}"));
                self.state = SessionState::Cooling;
                self.schedule_cooldown();
            }
        }
    }

    /// Populate the world from the bootstrap snapshot: members, bots,
    /// DMs, member public channels, unarchived groups.
    fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        self.world.self_id = Some(snapshot.self_info.id.clone());
        for user in &snapshot.users {
            self.world.update_user(user);
        }
        for bot in &snapshot.bots {
            self.world.update_user(&bot.as_user());
        }
        for im in &snapshot.ims {
            self.ensure_user(&im.user);
            self.world.open_dm(&im.user, &im.id);
        }
        let mut stubs = Vec::new();
        for channel in &snapshot.channels {
            if channel.is_member == Some(true) {
                stubs.extend(
                    self.world
                        .update_channel(ChannelKind::Public, channel)
                        .new_stubs,
                );
            }
        }
        for group in &snapshot.groups {
            if group.is_archived != Some(true) {
                stubs.extend(self.world.update_channel(ChannelKind::Group, group).new_stubs);
            }
        }
        for stub in stubs {
            self.request_user_info(&stub);
        }
    }

    /// Tear the session down: report, discard the world, cancel in-flight
    /// work, evict every client, start the cooldown.
    pub(crate) fn teardown(&mut self, reason: &str) {
        if self.state != SessionState::Live {
            return; // a second teardown is a no-op
        }
        warn!(reason, "session teardown");
        self.broadcast_authed_notice(reason);
        self.world.clear();
        self.generation += 1;
        self.live_generation.store(self.generation, Ordering::SeqCst);
        self.rtm_tx = None;
        self.mark_queue.clear();
        self.mark_timer_pending = false;
        self.rtm_pings_outstanding = 0;
        self.clients.clear(); // dropping the senders closes the sockets
        self.state = SessionState::Cooling;
        self.schedule_cooldown();
    }

    fn schedule_cooldown(&self) {
        let gen = self.generation;
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_COOLDOWN).await;
            let _ = input_tx.send(Input::Cooled { gen });
        });
    }

    fn spawn_rtm_ping_timer(&self) {
        let gen = self.generation;
        let live_generation = self.live_generation.clone();
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(RTM_PING_INTERVAL).await;
                if live_generation.load(Ordering::SeqCst) != gen {
                    return;
                }
                if input_tx.send(Input::RtmPingTick { gen }).is_err() {
                    return;
                }
            }
        });
    }

    fn rtm_ping_tick(&mut self, gen: u64) {
        if gen != self.generation || self.state != SessionState::Live {
            return;
        }
        if self.rtm_pings_outstanding >= RTM_PING_MISS_LIMIT {
            self.teardown("RTM ping timeout");
            return;
        }
        self.rtm_pings_outstanding += 1;
        self.rtm_send(rtm::ping_frame());
    }

    pub(crate) fn rtm_pong(&mut self) {
        self.rtm_pings_outstanding = 0;
    }

    // ── Read-mark batching ───────────────────────────────────────

    /// Queue a read acknowledgement. Later timestamps on the same channel
    /// overwrite earlier ones; a 5 s debounce flushes the whole queue.
    pub(crate) fn schedule_mark(&mut self, channel_id: &str, ts: &str) {
        self.mark_queue
            .insert(channel_id.to_owned(), ts.to_owned());
        if self.mark_timer_pending {
            return;
        }
        self.mark_timer_pending = true;
        let gen = self.generation;
        let input_tx = self.input_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(MARK_DEBOUNCE).await;
            let _ = input_tx.send(Input::MarkFlush { gen });
        });
    }

    fn flush_marks(&mut self) {
        let queue = std::mem::take(&mut self.mark_queue);
        for (channel_id, ts) in queue {
            let Some(channel) = self.world.channels.get(&channel_id) else {
                continue; // archived while queued
            };
            let method = format!("{}.mark", channel.kind.api_family());
            self.api_call_plain(&method, vec![("channel", channel_id.clone()), ("ts", ts)]);
        }
    }

    // ── Upstream plumbing ────────────────────────────────────────

    /// Send a stream frame, stamping the monotonically increasing id.
    pub(crate) fn rtm_send(&mut self, mut frame: Value) {
        frame["id"] = Value::from(self.next_frame_id);
        self.next_frame_id += 1;
        if let Some(tx) = &self.rtm_tx {
            let _ = tx.send(frame);
        }
    }

    pub(crate) fn api_call(&self, ctx: ApiCtx, method: &str, params: Vec<(&str, String)>) {
        let params = params.into_iter().map(|(k, v)| (k.to_owned(), v)).collect();
        let _ = self.api_tx.send(ApiRequest {
            gen: self.generation,
            ctx,
            kind: ApiCall::Method {
                method: method.to_owned(),
                params,
            },
        });
    }

    pub(crate) fn api_call_plain(&self, method: &str, params: Vec<(&str, String)>) {
        self.api_call(
            ApiCtx::Plain {
                method: method.to_owned(),
            },
            method,
            params,
        );
    }

    pub(crate) fn api_fetch_file(&self, ctx: ApiCtx, id: &str) {
        let _ = self.api_tx.send(ApiRequest {
            gen: self.generation,
            ctx,
            kind: ApiCall::FetchFile { id: id.to_owned() },
        });
    }

    /// Make sure a referenced user exists, stubbing it and firing the
    /// deferred `users.info` when it does not.
    pub(crate) fn ensure_user(&mut self, id: &str) {
        if self.world.record_unknown_user(id) {
            self.request_user_info(id);
        }
    }

    pub(crate) fn request_user_info(&self, id: &str) {
        self.api_call(
            ApiCtx::UserInfo {
                user: id.to_owned(),
            },
            "users.info",
            vec![("user", id.to_owned())],
        );
    }

    fn on_api(&mut self, ctx: ApiCtx, result: Result<ApiData, ApiError>) {
        match ctx {
            ApiCtx::Plain { method } => {
                if let Err(e) = result {
                    debug!(%method, "api call failed");
                    self.broadcast_authed_notice(&format!("API error: {e}"));
                }
            }
            ApiCtx::UserInfo { user } => match result {
                Ok(ApiData::Call(body)) => {
                    let Some(user_value) = body.get("user").cloned() else {
                        return;
                    };
                    match serde_json::from_value::<UserSnapshot>(user_value) {
                        Ok(snap) => {
                            if let Some(change) = self.world.update_stub_user(&snap) {
                                self.broadcast_nick_change(&change);
                            }
                        }
                        Err(e) => warn!(%user, "users.info: undecodable user: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => self.broadcast_authed_notice(&format!("API error: {e}")),
            },
            ApiCtx::ImOpen { user } => {
                if let Err(e) = result {
                    let nick = self.world.nick_of(&user).to_owned();
                    let queued = self.world.fail_dm(&user);
                    for body in queued {
                        self.broadcast_authed_notice(&format!("delivery to {nick} failed: {body}"));
                    }
                    self.broadcast_authed_notice(&format!("API error: {e}"));
                }
                // Success is confirmed by the im_open event, which drains
                // the queue.
            }
            ApiCtx::CatFile { conn } => self.on_cat_result(conn, result),
            ApiCtx::ShareFile {
                user,
                channel,
                peer,
            } => self.on_share_result(&user, channel.as_deref(), peer.as_deref(), result),
        }
    }

    // ── IRC client lifecycle ─────────────────────────────────────

    fn client_ping_tick(&mut self, conn: ConnId) {
        let Some(client) = self.clients.get_mut(&conn) else {
            return;
        };
        client.ping_count += 1;
        if client.ping_count >= CLIENT_PING_MISS_LIMIT {
            info!(conn, "ping timeout");
            let _ = client
                .tx
                .send(Message::new("ERROR", vec!["Ping timeout".into()]));
            self.clients.remove(&conn);
        } else {
            let _ = client.tx.send(Message::with_prefix(
                SERVER_NAME,
                "PING",
                vec![SERVER_NAME.to_owned()],
            ));
        }
    }

    /// Try to complete registration: NICK + USER (+ PASS when required).
    pub(crate) fn attempt_register(&mut self, conn: ConnId) {
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        if client.authed || client.nick.is_none() || client.user.is_none() {
            return;
        }
        if self.password_digest.is_some() {
            match &client.password {
                None => return, // wait for PASS
                Some(supplied) => {
                    if !self.password_ok(supplied) {
                        warn!(conn, "bad password");
                        let _ = client
                            .tx
                            .send(Message::new("ERROR", vec!["Bad password".into()]));
                        self.clients.remove(&conn);
                        return;
                    }
                }
            }
        }
        if let Some(client) = self.clients.get_mut(&conn) {
            client.authed = true;
        }
        if self.state == SessionState::Live {
            self.try_welcome(conn);
        } else if let Some(client) = self.clients.get(&conn) {
            let _ = client.tx.send(Message::with_prefix(
                SERVER_NAME,
                "NOTICE",
                vec!["*".into(), "Waiting for RTM connection".into()],
            ));
        }
    }

    fn password_ok(&self, supplied: &str) -> bool {
        match &self.password_digest {
            None => true,
            Some(expected) => {
                let supplied: [u8; 32] = Sha256::digest(supplied.as_bytes()).into();
                expected.as_slice().ct_eq(supplied.as_slice()).into()
            }
        }
    }

    /// Welcome an authed client if the session is live: numerics, MOTD,
    /// world replay, away state. Rejects nick collisions with non-self
    /// users.
    pub(crate) fn try_welcome(&mut self, conn: ConnId) {
        if self.state != SessionState::Live {
            return;
        }
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        if !client.authed || client.ready {
            return;
        }
        let Some(nick) = client.nick.clone() else {
            return;
        };

        if let Some(existing) = self.world.user_by_nick(&nick) {
            if !self.world.is_self(&existing.id) {
                self.numeric(
                    conn,
                    "433",
                    vec![nick.clone(), "Nickname is already in use".into()],
                );
                self.clients.remove(&conn);
                return;
            }
        }

        if let Some(client) = self.clients.get_mut(&conn) {
            client.ready = true;
        }

        self.numeric(
            conn,
            "001",
            vec![format!("Welcome to the Slack gateway, {nick}")],
        );
        self.numeric(
            conn,
            "002",
            vec![format!("Your host is {SERVER_NAME}, running backchannel")],
        );
        self.numeric(conn, "003", vec!["This server was created just now".into()]);
        self.send_motd(conn);

        // Replay the world: JOIN + topic + NAMES for every channel self
        // is in, in name order.
        let mut channel_ids: Vec<String> = self
            .world
            .self_id
            .as_ref()
            .and_then(|sid| self.world.users.get(sid))
            .map(|u| u.channels.iter().cloned().collect())
            .unwrap_or_default();
        channel_ids.sort_by_key(|id| self.world.channels.get(id).map(|c| c.name.clone()));
        for cid in channel_ids {
            self.send_channel_intro(conn, &cid);
        }

        self.send_away_numeric(conn);
    }

    pub(crate) fn send_motd(&self, conn: ConnId) {
        self.numeric(
            conn,
            "372",
            vec!["- backchannel: your workspace, over IRC".into()],
        );
        self.numeric(conn, "372", vec!["- Talk to X for gateway commands.".into()]);
        self.numeric(conn, "376", vec!["End of /MOTD command".into()]);
    }

    fn send_away_numeric(&self, conn: ConnId) {
        let away = self
            .world
            .self_id
            .as_ref()
            .and_then(|sid| self.world.users.get(sid))
            .map(|u| u.presence == Presence::Away)
            .unwrap_or(false);
        if away {
            self.numeric(
                conn,
                "306",
                vec!["You have been marked as being away".into()],
            );
        } else {
            self.numeric(
                conn,
                "305",
                vec!["You are no longer marked as being away".into()],
            );
        }
    }

    /// Send a self-sourced JOIN, the topic numeric, and the NAMES list
    /// for one channel to one client.
    pub(crate) fn send_channel_intro(&self, conn: ConnId, channel_id: &str) {
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        let Some(nick) = client.nick.as_deref() else {
            return;
        };
        let Some(channel) = self.world.channels.get(channel_id) else {
            return;
        };
        let disp = format!("#{}", channel.name);
        let _ = client.tx.send(Message::with_prefix(
            user_prefix(nick),
            "JOIN",
            vec![disp.clone()],
        ));
        let _ = client.tx.send(Message::with_prefix(
            SERVER_NAME,
            "332",
            vec![nick.to_owned(), disp, channel.topic.clone()],
        ));
        self.send_names_to(client, nick, channel);
    }

    /// Chunked 353s and the closing 366.
    pub(crate) fn send_names_to(&self, client: &Client, nick: &str, channel: &Channel) {
        let disp = format!("#{}", channel.name);
        let flag = match channel.kind {
            ChannelKind::Public => "=",
            ChannelKind::Group => "*",
        };
        let mut members: Vec<String> = channel
            .members
            .iter()
            .map(|uid| self.nick_for(nick, uid))
            .collect();
        members.sort();
        for chunk in members.chunks(NAMES_CHUNK) {
            let _ = client.tx.send(Message::with_prefix(
                SERVER_NAME,
                "353",
                vec![
                    nick.to_owned(),
                    flag.to_owned(),
                    disp.clone(),
                    chunk.join(" "),
                ],
            ));
        }
        let _ = client.tx.send(Message::with_prefix(
            SERVER_NAME,
            "366",
            vec![nick.to_owned(), disp, "End of /NAMES list".into()],
        ));
    }

    // ── Output helpers ───────────────────────────────────────────

    /// The nick a given client should see for a user id: the client's own
    /// nick for self, the world nick otherwise.
    pub(crate) fn nick_for(&self, client_nick: &str, uid: &str) -> String {
        if self.world.is_self(uid) {
            client_nick.to_owned()
        } else {
            self.world.nick_of(uid).to_owned()
        }
    }

    /// Send one message to every ready client, built per client so self
    /// substitution can use each client's nick.
    pub(crate) fn broadcast_ready(&self, make: impl Fn(&str) -> Message) {
        for client in self.clients.values() {
            if !client.ready {
                continue;
            }
            let Some(nick) = client.nick.as_deref() else {
                continue;
            };
            let _ = client.tx.send(make(nick));
        }
    }

    /// Server NOTICE to every authed client (ready or still waiting).
    pub(crate) fn broadcast_authed_notice(&self, text: &str) {
        for client in self.clients.values() {
            if !client.authed {
                continue;
            }
            let nick = client.nick.as_deref().unwrap_or("*");
            let _ = client.tx.send(Message::with_prefix(
                SERVER_NAME,
                "NOTICE",
                vec![nick.to_owned(), text.to_owned()],
            ));
        }
    }

    pub(crate) fn broadcast_nick_change(&self, change: &NickChange) {
        self.broadcast_ready(|_| {
            Message::with_prefix(user_prefix(&change.old), "NICK", vec![change.new.clone()])
        });
    }

    /// Replay a self JOIN (with topic and NAMES) to every ready client.
    pub(crate) fn announce_self_join(&self, channel_id: &str) {
        let conns: Vec<ConnId> = self
            .clients
            .iter()
            .filter(|(_, c)| c.ready)
            .map(|(id, _)| *id)
            .collect();
        for conn in conns {
            self.send_channel_intro(conn, channel_id);
        }
    }

    pub(crate) fn broadcast_self_part(&self, channel_name: &str) {
        let disp = format!("#{channel_name}");
        self.broadcast_ready(|nick| {
            Message::with_prefix(user_prefix(nick), "PART", vec![disp.clone()])
        });
    }

    /// Numeric reply to one client; the leading target parameter is the
    /// client's nick.
    pub(crate) fn numeric(&self, conn: ConnId, code: &str, rest: Vec<String>) {
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        let nick = client.nick.as_deref().unwrap_or("*");
        let mut params = vec![nick.to_owned()];
        params.extend(rest);
        let _ = client
            .tx
            .send(Message::with_prefix(SERVER_NAME, code, params));
    }

    /// Read-only view of the world, for inspection and tests.
    pub fn world(&self) -> &World {
        &self.world
    }

    pub(crate) fn server_time(&self) -> u64 {
        self.started_at
    }

    pub(crate) fn is_live(&self) -> bool {
        self.state == SessionState::Live
    }
}

/// `nick!nick@localhost`, the prefix format for all user-sourced lines.
pub(crate) fn user_prefix(nick: &str) -> String {
    format!("{nick}!{nick}@{SERVER_NAME}")
}

/// The API runner: executes requests concurrently and feeds completions
/// back into the engine, tagged with the generation they were issued
/// under.
pub async fn run_api(
    api: Arc<ApiClient>,
    mut rx: mpsc::UnboundedReceiver<ApiRequest>,
    input_tx: mpsc::UnboundedSender<Input>,
) {
    while let Some(request) = rx.recv().await {
        let api = api.clone();
        let input_tx = input_tx.clone();
        tokio::spawn(async move {
            let ApiRequest { gen, ctx, kind } = request;
            let result = match kind {
                ApiCall::Method { method, params } => {
                    api.call(&method, &params).await.map(ApiData::Call)
                }
                ApiCall::FetchFile { id } => api.fetch_file(&id).await.map(ApiData::File),
            };
            let _ = input_tx.send(Input::Api { gen, ctx, result });
        });
    }
}
