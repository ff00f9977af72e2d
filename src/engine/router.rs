//! The event router — the sole mutator of the world.
//!
//! Every inbound stream event lands here, one at a time: the router
//! updates the world and fans the effect out to every ready client. Self
//! is shadowed per client, so every line is built per recipient.

use tracing::debug;

use super::{user_prefix, ApiCtx, ApiData, Engine};
use crate::irc::Message;
use crate::slack::api::ApiError;
use crate::slack::event::{ChannelSnapshot, MessageEvent, RtmEvent};
use crate::slack::rtm;
use crate::translate;
use crate::world::{ChannelKind, Presence};

impl Engine {
    pub(crate) fn handle_event(&mut self, event: RtmEvent) {
        match event {
            RtmEvent::PresenceChange {
                user: Some(uid),
                presence,
            } => self.apply_presence(&uid, &presence),
            RtmEvent::PresenceChange { user: None, .. } => {}
            RtmEvent::ManualPresenceChange { presence } => {
                if let Some(sid) = self.world.self_id.clone() {
                    self.apply_presence(&sid, &presence);
                }
            }

            RtmEvent::ImOpen { user, channel } => {
                let queued = self.world.open_dm(&user, &channel);
                for body in queued {
                    let frame = rtm::message_frame(&channel, &body);
                    self.rtm_send(frame);
                }
            }
            RtmEvent::ImClose { user, .. } => self.world.close_dm(&user),

            RtmEvent::ChannelJoined { channel } => {
                self.apply_channel_event(ChannelKind::Public, &channel);
            }
            RtmEvent::GroupJoined { channel } => {
                self.apply_channel_event(ChannelKind::Group, &channel);
            }
            RtmEvent::ChannelLeft { channel } | RtmEvent::GroupLeft { channel } => {
                self.self_part(&channel);
            }
            RtmEvent::ChannelArchive { channel } | RtmEvent::GroupArchive { channel } => {
                self.self_part(&channel);
                self.world.delete_channel(&channel);
                self.mark_queue.remove(&channel);
            }

            RtmEvent::MemberJoined { user, channel } => {
                self.ensure_user(&user);
                if self.world.join(&user, &channel) {
                    if self.world.is_self(&user) {
                        self.announce_self_join(&channel);
                    } else {
                        let nick = self.world.nick_of(&user).to_owned();
                        let Some(name) =
                            self.world.channels.get(&channel).map(|c| c.name.clone())
                        else {
                            return;
                        };
                        let disp = format!("#{name}");
                        self.broadcast_ready(|_| {
                            Message::with_prefix(
                                user_prefix(&nick),
                                "JOIN",
                                vec![disp.clone()],
                            )
                        });
                    }
                }
            }
            RtmEvent::MemberLeft { user, channel } => {
                let name = self.world.channels.get(&channel).map(|c| c.name.clone());
                if self.world.part(&user, &channel) {
                    let Some(name) = name else { return };
                    if self.world.is_self(&user) {
                        self.broadcast_self_part(&name);
                    } else {
                        let nick = self.world.nick_of(&user).to_owned();
                        let disp = format!("#{name}");
                        self.broadcast_ready(|_| {
                            Message::with_prefix(
                                user_prefix(&nick),
                                "PART",
                                vec![disp.clone()],
                            )
                        });
                    }
                }
            }

            RtmEvent::Message(ev) => self.apply_message(ev),

            RtmEvent::Pong { .. } => self.rtm_pong(),

            RtmEvent::Error { error } => {
                let msg = error.msg.unwrap_or_else(|| "unknown error".to_owned());
                self.broadcast_authed_notice(&format!("RTM error: {msg}"));
            }

            RtmEvent::Unknown => {}
        }
    }

    fn apply_presence(&mut self, uid: &str, presence: &str) {
        let is_self = self.world.is_self(uid);
        let new = Presence::from_api(presence);
        let changed = match self.world.users.get_mut(uid) {
            Some(user) => {
                let changed = user.presence != new;
                user.presence = new;
                changed
            }
            None => return,
        };
        if is_self && changed {
            match new {
                Presence::Away => self.broadcast_ready(|nick| {
                    Message::with_prefix(
                        super::SERVER_NAME,
                        "306",
                        vec![
                            nick.to_owned(),
                            "You have been marked as being away".into(),
                        ],
                    )
                }),
                Presence::Active => self.broadcast_ready(|nick| {
                    Message::with_prefix(
                        super::SERVER_NAME,
                        "305",
                        vec![
                            nick.to_owned(),
                            "You are no longer marked as being away".into(),
                        ],
                    )
                }),
            }
        }
    }

    fn apply_channel_event(&mut self, kind: ChannelKind, snap: &ChannelSnapshot) {
        let was_member = self
            .world
            .self_id
            .as_ref()
            .and_then(|sid| {
                self.world
                    .channels
                    .get(&snap.id)
                    .map(|c| c.members.contains(sid))
            })
            .unwrap_or(false);

        let update = self.world.update_channel(kind, snap);
        for stub in &update.new_stubs {
            self.request_user_info(stub);
        }

        if let Some(sid) = self.world.self_id.clone() {
            self.world.join(&sid, &snap.id);
            if !was_member {
                self.announce_self_join(&snap.id);
            }
        }
    }

    fn self_part(&mut self, channel_id: &str) {
        let Some(sid) = self.world.self_id.clone() else {
            return;
        };
        let name = self.world.channels.get(channel_id).map(|c| c.name.clone());
        if self.world.part(&sid, channel_id) {
            if let Some(name) = name {
                self.broadcast_self_part(&name);
            }
        }
    }

    fn apply_message(&mut self, ev: MessageEvent) {
        let Some(sender) = ev.sender().map(str::to_owned) else {
            return;
        };
        self.ensure_user(&sender);
        let Some(chan) = ev.channel.clone() else {
            return;
        };

        if self.world.channels.contains_key(&chan) {
            let subtype = ev.subtype.as_deref();
            if matches!(subtype, Some("channel_topic") | Some("group_topic")) {
                self.apply_topic_change(&sender, &chan, ev.topic.as_deref().unwrap_or(""));
                return;
            }

            let body = translate::flatten_attachments(
                ev.text.as_deref().unwrap_or(""),
                &ev.attachments,
            );
            self.emit_channel_message(&sender, &chan, &body, subtype);
            if let Some(ts) = &ev.ts {
                self.schedule_mark(&chan, ts);
            }
            if subtype == Some("file_share") {
                if let Some(file) = &ev.file {
                    self.api_fetch_file(
                        ApiCtx::ShareFile {
                            user: sender,
                            channel: Some(chan),
                            peer: None,
                        },
                        &file.id,
                    );
                }
            }
        } else if let Some(peer) = self.world.user_by_dm(&chan).map(|u| u.id.clone()) {
            let subtype = ev.subtype.as_deref();
            let body = translate::flatten_attachments(
                ev.text.as_deref().unwrap_or(""),
                &ev.attachments,
            );
            self.emit_direct_message(&sender, &peer, &body, subtype);
            if subtype == Some("file_share") {
                if let Some(file) = &ev.file {
                    self.api_fetch_file(
                        ApiCtx::ShareFile {
                            user: sender,
                            channel: None,
                            peer: Some(peer),
                        },
                        &file.id,
                    );
                }
            }
        } else {
            debug!(channel = %chan, "message for unknown conversation ignored");
        }
    }

    fn apply_topic_change(&mut self, sender: &str, channel_id: &str, topic: &str) {
        let Some(name) = self.world.channels.get(channel_id).map(|c| c.name.clone()) else {
            return;
        };
        if let Some(channel) = self.world.channels.get_mut(channel_id) {
            channel.topic = topic.to_owned();
        }
        let disp = format!("#{name}");
        let topic = topic.to_owned();
        let sender = sender.to_owned();
        self.broadcast_ready(|nick| {
            let from = self.nick_for(nick, &sender);
            Message::with_prefix(
                user_prefix(&from),
                "TOPIC",
                vec![disp.clone(), topic.clone()],
            )
        });
    }

    /// Fan a channel message out to every ready client: per recipient,
    /// translate ids, split on newlines, prepend the bold subtype tag.
    pub(crate) fn emit_channel_message(
        &self,
        sender: &str,
        channel_id: &str,
        body: &str,
        subtype: Option<&str>,
    ) {
        if body.is_empty() && subtype.is_none() {
            return;
        }
        let Some(channel) = self.world.channels.get(channel_id) else {
            return;
        };
        let disp = format!("#{}", channel.name);
        for client in self.clients.values() {
            if !client.ready {
                continue;
            }
            let Some(nick) = client.nick.as_deref() else {
                continue;
            };
            let from = self.nick_for(nick, sender);
            let translated = translate::api_to_irc(&self.world, nick, body);
            for line in translated.split('\n') {
                let text = match subtype {
                    Some(st) => format!("\u{2}[{st}]\u{2} {line}"),
                    None => line.to_owned(),
                };
                let _ = client.tx.send(Message::with_prefix(
                    user_prefix(&from),
                    "PRIVMSG",
                    vec![disp.clone(), text],
                ));
            }
        }
    }

    /// Fan a direct message out. A message sent by self (from another
    /// upstream client) is displayed as self → peer.
    fn emit_direct_message(&self, sender: &str, peer: &str, body: &str, subtype: Option<&str>) {
        if body.is_empty() && subtype.is_none() {
            return;
        }
        let sender_is_self = self.world.is_self(sender);
        for client in self.clients.values() {
            if !client.ready {
                continue;
            }
            let Some(nick) = client.nick.as_deref() else {
                continue;
            };
            let from = self.nick_for(nick, sender);
            let target = if sender_is_self {
                self.world.nick_of(peer).to_owned()
            } else {
                nick.to_owned()
            };
            let translated = translate::api_to_irc(&self.world, nick, body);
            for line in translated.split('\n') {
                let text = match subtype {
                    Some(st) => format!("\u{2}[{st}]\u{2} {line}"),
                    None => line.to_owned(),
                };
                let _ = client.tx.send(Message::with_prefix(
                    user_prefix(&from),
                    "PRIVMSG",
                    vec![target.clone(), text],
                ));
            }
        }
    }

    /// A fetched `file_share` body: emit it inline as a message whose
    /// subtype is the file id. Oversized bodies were refused upstream and
    /// are suppressed here.
    pub(crate) fn on_share_result(
        &mut self,
        user: &str,
        channel: Option<&str>,
        peer: Option<&str>,
        result: Result<ApiData, ApiError>,
    ) {
        match result {
            Ok(ApiData::File(file)) => {
                let subtype = format!(">{}", file.id);
                match channel {
                    Some(cid) => {
                        self.emit_channel_message(user, cid, &file.content, Some(&subtype));
                    }
                    None => {
                        if let Some(peer) = peer {
                            self.emit_direct_message(user, peer, &file.content, Some(&subtype));
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(ApiError::FileTooLarge { id, size }) => {
                debug!(%id, size, "file body suppressed");
            }
            Err(e) => self.broadcast_authed_notice(&format!("API error: {e}")),
        }
    }
}
