//! The `X` pseudo-user — gateway control commands over PRIVMSG.
//!
//! Commands are split on runs of spaces after the command word. Replies
//! come back as NOTICEs sourced from `X!X@localhost`.

use std::sync::atomic::Ordering;

use super::{ApiCtx, ApiData, ConnId, Engine, GATEWAY_PREFIX};
use crate::irc::Message;
use crate::slack::api::ApiError;
use crate::world::{ChannelKind, DmState};

/// Chunk size for `cat` replay lines.
const CAT_CHUNK: usize = 400;

impl Engine {
    pub(crate) fn gateway_command(&mut self, conn: ConnId, text: &str) {
        let mut words = text.split_ascii_whitespace();
        let Some(command) = words.next() else {
            self.gateway_usage(conn);
            return;
        };
        let arg = words.next();

        match command {
            "newgroup" => match arg {
                Some(name) => {
                    self.api_call_plain("groups.create", vec![("name", name.to_owned())]);
                }
                None => self.gateway_notice(conn, "usage: newgroup <name>"),
            },
            "newchan" => match arg {
                Some(name) => {
                    self.api_call_plain("channels.create", vec![("name", name.to_owned())]);
                }
                None => self.gateway_notice(conn, "usage: newchan <name>"),
            },
            "archive" => match arg {
                Some(name) => self.archive_channel(conn, name),
                None => self.gateway_notice(conn, "usage: archive <channel>"),
            },
            "close" => match arg {
                Some(name) => self.close_group(conn, name),
                None => self.gateway_notice(conn, "usage: close <channel>"),
            },
            "cat" => match arg {
                Some(file_id) => self.api_fetch_file(ApiCtx::CatFile { conn }, file_id),
                None => self.gateway_notice(conn, "usage: cat <file-id>"),
            },
            "disconnect" => {
                if self.is_live() {
                    self.teardown("disconnect requested");
                } else {
                    self.gateway_notice(conn, "not connected");
                }
            }
            "delim" => match arg {
                Some(nick) => self.close_dm_session(conn, nick),
                None => self.gateway_notice(conn, "usage: delim <nick>"),
            },
            "debug_dump_state" => self.dump_state(conn),
            "debug_dump" => {
                match arg {
                    Some("1") => self.dump.store(true, Ordering::Relaxed),
                    Some("0") => self.dump.store(false, Ordering::Relaxed),
                    _ => {}
                }
                let on = self.dump.load(Ordering::Relaxed);
                self.gateway_notice(conn, &format!("debug_dump = {}", u8::from(on)));
            }
            other => {
                self.gateway_notice(conn, &format!("unknown command: {other}"));
                self.gateway_usage(conn);
            }
        }
    }

    fn gateway_usage(&self, conn: ConnId) {
        self.gateway_notice(
            conn,
            "commands: newgroup <n>, newchan <n>, archive <n>, close <n>, cat <file-id>, \
             disconnect, delim <nick>, debug_dump_state, debug_dump [0|1]",
        );
    }

    fn archive_channel(&mut self, conn: ConnId, raw: &str) {
        let name = raw.strip_prefix('#').unwrap_or(raw);
        match self
            .world
            .channel_by_name(name)
            .map(|c| (c.id.clone(), c.kind))
        {
            Some((cid, kind)) => {
                let method = format!("{}.archive", kind.api_family());
                self.api_call_plain(&method, vec![("channel", cid)]);
            }
            None => self.gateway_notice(conn, &format!("no such channel: {raw}")),
        }
    }

    fn close_group(&mut self, conn: ConnId, raw: &str) {
        let name = raw.strip_prefix('#').unwrap_or(raw);
        match self
            .world
            .channel_by_name(name)
            .map(|c| (c.id.clone(), c.kind))
        {
            Some((cid, ChannelKind::Group)) => {
                self.api_call_plain("groups.close", vec![("channel", cid)]);
            }
            Some((_, ChannelKind::Public)) => {
                self.gateway_notice(conn, &format!("{raw} is not a group"));
            }
            None => self.gateway_notice(conn, &format!("no such channel: {raw}")),
        }
    }

    fn close_dm_session(&mut self, conn: ConnId, nick: &str) {
        match self
            .world
            .user_by_nick(nick)
            .map(|u| (u.id.clone(), u.dm.clone()))
        {
            Some((_, DmState::Open(dm_id))) => {
                self.api_call_plain("im.close", vec![("channel", dm_id)]);
            }
            Some(_) => self.gateway_notice(conn, &format!("no DM open with {nick}")),
            None => self.gateway_notice(conn, &format!("no such nick: {nick}")),
        }
    }

    fn dump_state(&self, conn: ConnId) {
        self.gateway_notice(
            conn,
            &format!(
                "generation {} live={} clients={}",
                self.generation,
                self.is_live(),
                self.clients.len()
            ),
        );
        for client in self.clients.values() {
            self.gateway_notice(
                conn,
                &format!(
                    "client {} nick={} user={} realname={} authed={} ready={}",
                    client.peer,
                    client.nick.as_deref().unwrap_or("-"),
                    client.user.as_deref().unwrap_or("-"),
                    client.realname.as_deref().unwrap_or("-"),
                    client.authed,
                    client.ready
                ),
            );
        }

        let mut users: Vec<_> = self.world.users.values().collect();
        users.sort_by(|a, b| a.nick.cmp(&b.nick));
        for user in users {
            self.gateway_notice(
                conn,
                &format!(
                    "user {} nick={} presence={:?} dm={:?} queued={}",
                    user.id,
                    user.nick,
                    user.presence,
                    user.dm,
                    user.tx_queue.len()
                ),
            );
        }

        let mut channels: Vec<_> = self.world.channels.values().collect();
        channels.sort_by(|a, b| a.name.cmp(&b.name));
        for channel in channels {
            self.gateway_notice(
                conn,
                &format!(
                    "channel {} name=#{} kind={:?} members={}",
                    channel.id,
                    channel.name,
                    channel.kind,
                    channel.members.len()
                ),
            );
        }
    }

    /// Replay a fetched file to the requesting client, delimited.
    pub(crate) fn on_cat_result(&self, conn: ConnId, result: Result<ApiData, ApiError>) {
        match result {
            Ok(ApiData::File(file)) => {
                self.gateway_notice(conn, &format!("---- BEGIN {} ----", file.id));
                for line in file.content.split('\n') {
                    let line = line.trim_end_matches('\r');
                    for chunk in chunk_line(line, CAT_CHUNK) {
                        self.gateway_notice(conn, chunk);
                    }
                }
                self.gateway_notice(conn, &format!("---- END {} ----", file.id));
            }
            Ok(_) => {}
            Err(ApiError::FileTooLarge { id, size }) => {
                self.gateway_notice(conn, &format!("{id} is too large ({size} bytes)"));
            }
            Err(e) => self.gateway_notice(conn, &format!("API error: {e}")),
        }
    }

    pub(crate) fn gateway_notice(&self, conn: ConnId, text: &str) {
        let Some(client) = self.clients.get(&conn) else {
            return;
        };
        let nick = client.nick.as_deref().unwrap_or("*");
        let _ = client.tx.send(Message::with_prefix(
            GATEWAY_PREFIX,
            "NOTICE",
            vec![nick.to_owned(), text.to_owned()],
        ));
    }
}

/// Split a line into chunks of at most `max` bytes on char boundaries.
/// Always yields at least one chunk, so empty lines survive.
fn chunk_line(line: &str, max: usize) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = line;
    while rest.len() > max {
        let mut cut = max;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        out.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    out.push(rest);
    out
}
