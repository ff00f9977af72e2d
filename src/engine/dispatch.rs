//! IRC command dispatch.
//!
//! NICK/USER/PASS/PING/PONG/QUIT work from the moment a socket connects;
//! everything else requires a welcomed client. Commands that change
//! upstream state turn into API calls; the confirming event updates the
//! world and fans out.

use tracing::debug;

use super::{user_prefix, ApiCtx, ConnId, Engine, SERVER_NAME};
use crate::irc::Message;
use crate::slack::rtm;
use crate::translate;
use crate::world::{names, ChannelKind, DmState, Presence};

impl Engine {
    pub(crate) fn handle_line(&mut self, conn: ConnId, msg: Message) {
        let command = msg.command.to_uppercase();
        match command.as_str() {
            "PASS" => {
                if let Some(client) = self.clients.get_mut(&conn) {
                    client.password = msg.params.first().cloned();
                }
                self.attempt_register(conn);
            }
            "NICK" => self.cmd_nick(conn, &msg.params),
            "USER" => self.cmd_user(conn, &msg.params),
            "PING" => {
                let token = msg.params.first().cloned().unwrap_or_default();
                if let Some(client) = self.clients.get(&conn) {
                    let _ = client
                        .tx
                        .send(Message::with_prefix(SERVER_NAME, "PONG", vec![token]));
                }
            }
            "PONG" => {
                if let Some(client) = self.clients.get_mut(&conn) {
                    client.ping_count = 0;
                }
            }
            "QUIT" => {
                self.clients.remove(&conn);
            }
            _ => {
                let ready = self.clients.get(&conn).is_some_and(|c| c.ready);
                if !ready {
                    debug!(conn, %command, "ignored before welcome");
                    return;
                }
                match command.as_str() {
                    "AWAY" => self.cmd_away(&msg.params),
                    "JOIN" => self.cmd_join(conn, &msg.params),
                    "PART" => self.cmd_part(conn, &msg.params),
                    "INVITE" => self.cmd_invite(conn, &msg.params),
                    "KICK" => self.cmd_kick(conn, &msg.params),
                    "MODE" => self.cmd_mode(conn, &msg.params),
                    "TOPIC" => self.cmd_topic(conn, &msg.params),
                    "NAMES" => self.cmd_names(conn, &msg.params),
                    "WHO" => self.cmd_who(conn, &msg.params),
                    "WHOIS" => self.cmd_whois(conn, &msg.params),
                    "LIST" => self.cmd_list(conn),
                    "MOTD" => self.send_motd(conn),
                    "PRIVMSG" => self.cmd_privmsg(conn, &msg.params),
                    other => debug!(conn, command = other, "unknown command ignored"),
                }
            }
        }
    }

    fn cmd_nick(&mut self, conn: ConnId, params: &[String]) {
        let Some(new_nick) = params.first().cloned() else {
            return;
        };
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        if !client.ready {
            if let Some(client) = self.clients.get_mut(&conn) {
                client.nick = Some(new_nick);
            }
            self.attempt_register(conn);
            return;
        }

        // Post-welcome rename of the shadowed self nick.
        if let Some(existing) = self.world.user_by_nick(&new_nick) {
            if !self.world.is_self(&existing.id) {
                self.numeric(
                    conn,
                    "433",
                    vec![new_nick, "Nickname is already in use".into()],
                );
                return;
            }
        }
        let Some(client) = self.clients.get_mut(&conn) else {
            return;
        };
        let old = client.nick.replace(new_nick.clone());
        if let Some(old) = old {
            let _ = client.tx.send(Message::with_prefix(
                user_prefix(&old),
                "NICK",
                vec![new_nick],
            ));
        }
    }

    fn cmd_user(&mut self, conn: ConnId, params: &[String]) {
        if let Some(client) = self.clients.get_mut(&conn) {
            client.user = params.first().cloned();
            client.realname = params.get(3).cloned();
        }
        self.attempt_register(conn);
    }

    fn cmd_away(&mut self, params: &[String]) {
        let presence = match params.first() {
            Some(reason) if !reason.is_empty() => "away",
            _ => "auto",
        };
        self.api_call_plain(
            "users.setPresence",
            vec![("presence", presence.to_owned())],
        );
    }

    fn cmd_join(&mut self, conn: ConnId, params: &[String]) {
        let Some(list) = params.first() else {
            return;
        };
        for raw in list.split(',').filter(|s| !s.is_empty()) {
            let name = raw.strip_prefix('#').unwrap_or(raw);
            let Some((cid, kind, is_member)) = self.world.channel_by_name(name).map(|c| {
                let member = self
                    .world
                    .self_id
                    .as_ref()
                    .is_some_and(|sid| c.members.contains(sid));
                (c.id.clone(), c.kind, member)
            }) else {
                self.numeric(
                    conn,
                    "401",
                    vec![raw.to_owned(), "No such nick/channel".into()],
                );
                continue;
            };
            if is_member {
                continue;
            }
            match kind {
                ChannelKind::Group => {
                    // Optimistic: groups.open rarely echoes an event.
                    self.api_call_plain("groups.open", vec![("channel", cid.clone())]);
                    if let Some(sid) = self.world.self_id.clone() {
                        if self.world.join(&sid, &cid) {
                            self.announce_self_join(&cid);
                        }
                    }
                }
                ChannelKind::Public => {
                    // The channel_joined event confirms.
                    self.api_call_plain("channels.join", vec![("name", name.to_owned())]);
                }
            }
        }
    }

    fn cmd_part(&mut self, conn: ConnId, params: &[String]) {
        let Some(list) = params.first() else {
            return;
        };
        for raw in list.split(',').filter(|s| !s.is_empty()) {
            let name = raw.strip_prefix('#').unwrap_or(raw);
            let Some((cid, kind, chan_name, is_member)) =
                self.world.channel_by_name(name).map(|c| {
                    let member = self
                        .world
                        .self_id
                        .as_ref()
                        .is_some_and(|sid| c.members.contains(sid));
                    (c.id.clone(), c.kind, c.name.clone(), member)
                })
            else {
                self.numeric(conn, "403", vec![raw.to_owned(), "No such channel".into()]);
                continue;
            };
            if !is_member {
                continue;
            }
            match kind {
                ChannelKind::Group => {
                    // Optimistic, symmetric to JOIN.
                    self.api_call_plain("groups.close", vec![("channel", cid.clone())]);
                    if let Some(sid) = self.world.self_id.clone() {
                        if self.world.part(&sid, &cid) {
                            self.broadcast_self_part(&chan_name);
                        }
                    }
                }
                ChannelKind::Public => {
                    // The channel_left event confirms.
                    self.api_call_plain("channels.leave", vec![("channel", cid.clone())]);
                }
            }
        }
    }

    fn cmd_invite(&mut self, conn: ConnId, params: &[String]) {
        let (Some(nicks), Some(chan_raw)) = (params.first(), params.get(1)) else {
            return;
        };
        self.membership_change(conn, chan_raw, nicks, "invite");
    }

    fn cmd_kick(&mut self, conn: ConnId, params: &[String]) {
        let (Some(chan_raw), Some(nicks)) = (params.first(), params.get(1)) else {
            return;
        };
        self.membership_change(conn, chan_raw, nicks, "kick");
    }

    /// Shared INVITE/KICK path: per comma-split name, one API call.
    /// Unknown nicks get a 401 carrying the name as requested.
    fn membership_change(&mut self, conn: ConnId, chan_raw: &str, nicks: &str, verb: &str) {
        let name = chan_raw.strip_prefix('#').unwrap_or(chan_raw);
        let Some((cid, kind)) = self
            .world
            .channel_by_name(name)
            .map(|c| (c.id.clone(), c.kind))
        else {
            self.numeric(
                conn,
                "403",
                vec![chan_raw.to_owned(), "No such channel".into()],
            );
            return;
        };
        for nick in nicks.split(',').filter(|s| !s.is_empty()) {
            match self.world.user_by_nick(nick).map(|u| u.id.clone()) {
                Some(uid) => {
                    let method = format!("{}.{}", kind.api_family(), verb);
                    self.api_call_plain(
                        &method,
                        vec![("channel", cid.clone()), ("user", uid)],
                    );
                }
                None => self.numeric(
                    conn,
                    "401",
                    vec![nick.to_owned(), "No such nick/channel".into()],
                ),
            }
        }
    }

    fn cmd_mode(&mut self, conn: ConnId, params: &[String]) {
        let Some(target) = params.first() else {
            return;
        };
        if let Some(name) = target.strip_prefix('#') {
            let Some((disp, kind)) = self
                .world
                .channel_by_name(name)
                .map(|c| (format!("#{}", c.name), c.kind))
            else {
                self.numeric(
                    conn,
                    "403",
                    vec![target.to_owned(), "No such channel".into()],
                );
                return;
            };
            match params.get(1).map(String::as_str) {
                None => {
                    let modes = match kind {
                        ChannelKind::Public => "+p",
                        ChannelKind::Group => "+ip",
                    };
                    self.numeric(conn, "324", vec![disp.clone(), modes.to_owned()]);
                    self.numeric(conn, "329", vec![disp, self.server_time().to_string()]);
                }
                Some("b") => {
                    self.numeric(conn, "368", vec![disp, "End of channel ban list".into()]);
                }
                Some(_) => {} // modes cannot be changed through the gateway
            }
        } else {
            let own = self
                .clients
                .get(&conn)
                .and_then(|c| c.nick.as_deref())
                .is_some_and(|nick| names::irc_eq(nick, target));
            if own {
                self.numeric(conn, "221", vec!["+i".into()]);
            }
        }
    }

    fn cmd_topic(&mut self, conn: ConnId, params: &[String]) {
        let Some(chan_raw) = params.first() else {
            return;
        };
        let name = chan_raw.strip_prefix('#').unwrap_or(chan_raw);
        let Some((cid, kind, disp, topic)) = self.world.channel_by_name(name).map(|c| {
            (
                c.id.clone(),
                c.kind,
                format!("#{}", c.name),
                c.topic.clone(),
            )
        }) else {
            self.numeric(
                conn,
                "403",
                vec![chan_raw.to_owned(), "No such channel".into()],
            );
            return;
        };
        match params.get(1) {
            Some(new_topic) => {
                // The topic-change event broadcasts the result.
                let translated = translate::irc_to_api(&self.world, new_topic);
                let method = format!("{}.setTopic", kind.api_family());
                self.api_call_plain(&method, vec![("channel", cid), ("topic", translated)]);
            }
            None => self.numeric(conn, "332", vec![disp, topic]),
        }
    }

    fn cmd_names(&mut self, conn: ConnId, params: &[String]) {
        let Some(chan_raw) = params.first() else {
            return;
        };
        let name = chan_raw.strip_prefix('#').unwrap_or(chan_raw);
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        let Some(nick) = client.nick.as_deref() else {
            return;
        };
        match self.world.channel_by_name(name) {
            Some(channel) => self.send_names_to(client, nick, channel),
            None => self.numeric(
                conn,
                "403",
                vec![chan_raw.to_owned(), "No such channel".into()],
            ),
        }
    }

    fn cmd_who(&mut self, conn: ConnId, params: &[String]) {
        let Some(target) = params.first() else {
            return;
        };
        let client_nick = self
            .clients
            .get(&conn)
            .and_then(|c| c.nick.clone())
            .unwrap_or_default();
        if let Some(name) = target.strip_prefix('#') {
            if let Some(channel) = self.world.channel_by_name(name) {
                let disp = format!("#{}", channel.name);
                let mut members: Vec<&String> = channel.members.iter().collect();
                members.sort();
                for uid in members {
                    let Some(user) = self.world.users.get(uid) else {
                        continue;
                    };
                    let nick = self.nick_for(&client_nick, uid);
                    let flags = match user.presence {
                        Presence::Active => "H",
                        Presence::Away => "G",
                    };
                    self.numeric(
                        conn,
                        "352",
                        vec![
                            disp.clone(),
                            nick.clone(),
                            SERVER_NAME.to_owned(),
                            SERVER_NAME.to_owned(),
                            nick,
                            flags.to_owned(),
                            format!("0 {}", user.realname),
                        ],
                    );
                }
            }
        }
        self.numeric(
            conn,
            "315",
            vec![target.to_owned(), "End of /WHO list".into()],
        );
    }

    fn cmd_whois(&mut self, conn: ConnId, params: &[String]) {
        let Some(target) = params.last().cloned() else {
            return;
        };
        if names::irc_eq(&target, names::GATEWAY_NICK) {
            self.numeric(
                conn,
                "311",
                vec![
                    target.clone(),
                    names::GATEWAY_NICK.to_owned(),
                    SERVER_NAME.to_owned(),
                    "*".into(),
                    "Slack gateway control".into(),
                ],
            );
            self.numeric(
                conn,
                "312",
                vec![target.clone(), SERVER_NAME.to_owned(), "backchannel".into()],
            );
            self.numeric(conn, "318", vec![target, "End of /WHOIS list".into()]);
            return;
        }

        let client_nick = self
            .clients
            .get(&conn)
            .and_then(|c| c.nick.clone())
            .unwrap_or_default();
        // The client's own nick shadows the upstream self nick.
        let uid = if names::irc_eq(&client_nick, &target) {
            self.world.self_id.clone()
        } else {
            self.world.user_by_nick(&target).map(|u| u.id.clone())
        };

        match uid.and_then(|id| self.world.users.get(&id)) {
            Some(user) => {
                let disp_nick = self.nick_for(&client_nick, &user.id);
                self.numeric(
                    conn,
                    "311",
                    vec![
                        disp_nick.clone(),
                        disp_nick.clone(),
                        SERVER_NAME.to_owned(),
                        "*".into(),
                        user.realname.clone(),
                    ],
                );
                self.numeric(
                    conn,
                    "312",
                    vec![
                        disp_nick.clone(),
                        SERVER_NAME.to_owned(),
                        "backchannel".into(),
                    ],
                );
                let mut chans: Vec<String> = user
                    .channels
                    .iter()
                    .filter_map(|cid| self.world.channels.get(cid))
                    .map(|c| format!("#{}", c.name))
                    .collect();
                chans.sort();
                if !chans.is_empty() {
                    self.numeric(conn, "319", vec![disp_nick.clone(), chans.join(" ")]);
                }
                if user.presence == Presence::Away {
                    self.numeric(conn, "301", vec![disp_nick.clone(), "User is away".into()]);
                }
                self.numeric(conn, "318", vec![disp_nick, "End of /WHOIS list".into()]);
            }
            None => {
                self.numeric(
                    conn,
                    "401",
                    vec![target.clone(), "No such nick/channel".into()],
                );
                self.numeric(conn, "318", vec![target, "End of /WHOIS list".into()]);
            }
        }
    }

    fn cmd_list(&mut self, conn: ConnId) {
        self.numeric(conn, "321", vec!["Channel".into(), "Users  Name".into()]);
        let mut channels: Vec<&crate::world::Channel> = self.world.channels.values().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        for channel in channels {
            self.numeric(
                conn,
                "322",
                vec![
                    format!("#{}", channel.name),
                    channel.members.len().to_string(),
                    channel.topic.clone(),
                ],
            );
        }
        self.numeric(conn, "323", vec!["End of /LIST".into()]);
    }

    fn cmd_privmsg(&mut self, conn: ConnId, params: &[String]) {
        let (Some(target), Some(text)) = (params.first(), params.get(1)) else {
            return;
        };
        if names::irc_eq(target, names::GATEWAY_NICK) {
            let text = text.clone();
            self.gateway_command(conn, &text);
            return;
        }
        if let Some(name) = target.strip_prefix('#') {
            let Some(cid) = self.world.channel_by_name(name).map(|c| c.id.clone()) else {
                self.numeric(
                    conn,
                    "401",
                    vec![target.to_owned(), "No such nick/channel".into()],
                );
                return;
            };
            let translated = translate::irc_to_api(&self.world, text);
            let frame = rtm::message_frame(&cid, &translated);
            self.rtm_send(frame);
        } else {
            let Some(uid) = self.world.user_by_nick(target).map(|u| u.id.clone()) else {
                self.numeric(
                    conn,
                    "401",
                    vec![target.to_owned(), "No such nick/channel".into()],
                );
                return;
            };
            let text = text.clone();
            self.send_to_user(&uid, &text);
        }
    }

    /// Send a DM, queueing while the DM channel is absent or opening.
    pub(crate) fn send_to_user(&mut self, uid: &str, text: &str) {
        let translated = translate::irc_to_api(&self.world, text);
        let Some(dm) = self.world.users.get(uid).map(|u| u.dm.clone()) else {
            return;
        };
        match dm {
            DmState::Open(dm_id) => {
                let frame = rtm::message_frame(&dm_id, &translated);
                self.rtm_send(frame);
            }
            DmState::Pending => {
                if let Some(user) = self.world.users.get_mut(uid) {
                    user.tx_queue.push_back(translated);
                }
            }
            DmState::Absent => {
                if let Some(user) = self.world.users.get_mut(uid) {
                    user.tx_queue.push_back(translated);
                    user.dm = DmState::Pending;
                }
                self.api_call(
                    ApiCtx::ImOpen {
                        user: uid.to_owned(),
                    },
                    "im.open",
                    vec![("user", uid.to_owned())],
                );
            }
        }
    }
}
