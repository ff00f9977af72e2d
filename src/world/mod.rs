//! In-memory model of the upstream workspace — users, channels, direct
//! messages, presence, and the local identity.
//!
//! Pure state: every mutator is synchronous, and the event router is the
//! sole caller. Entities live in two flat tables keyed by remote id, with
//! membership stored as id sets on both sides; the secondary name indices
//! are maintained in lockstep with every mutation.

pub mod names;

use std::collections::{HashMap, HashSet, VecDeque};

use crate::slack::event::{ChannelSnapshot, UserSnapshot};

/// Upstream presence of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Active,
    Away,
}

impl Presence {
    pub fn from_api(s: &str) -> Self {
        if s == "away" {
            Self::Away
        } else {
            Self::Active
        }
    }
}

/// State of a user's direct-message conduit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DmState {
    /// No DM session.
    Absent,
    /// `im.open` is in flight.
    Pending,
    /// Usable DM channel id.
    Open(String),
}

/// The two channel kinds, with parallel API namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Public,
    Group,
}

impl ChannelKind {
    /// The API method family for this kind (`channels.*` / `groups.*`).
    pub fn api_family(self) -> &'static str {
        match self {
            Self::Public => "channels",
            Self::Group => "groups",
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    /// IRC-legal nick, unique under case folding within the user set.
    pub nick: String,
    pub realname: String,
    pub presence: Presence,
    /// Channels this user is in (ids).
    pub channels: HashSet<String>,
    pub dm: DmState,
    /// Outbound DM bodies waiting for the DM channel to open.
    pub tx_queue: VecDeque<String>,
    /// Created by [`World::record_unknown_user`]; real attributes pending.
    pub is_stub: bool,
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: String,
    /// IRC-legal name without the leading `#`; group names carry a `+`.
    pub name: String,
    pub kind: ChannelKind,
    pub topic: String,
    /// Member user ids.
    pub members: HashSet<String>,
}

/// A nick reassignment produced by [`World::update_user`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NickChange {
    pub user: String,
    pub old: String,
    pub new: String,
}

/// Result of applying a channel snapshot.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    pub id: String,
    pub created: bool,
    /// Member ids that had to be stub-created; the caller owes each a
    /// `users.info` call.
    pub new_stubs: Vec<String>,
}

/// The world model. Empty whenever the upstream session is not live.
#[derive(Debug, Default)]
pub struct World {
    pub users: HashMap<String, User>,
    pub channels: HashMap<String, Channel>,
    /// Folded nick → user id.
    pub users_by_name: HashMap<String, String>,
    /// Folded channel name → channel id.
    pub channels_by_name: HashMap<String, String>,
    /// DM channel id → user id.
    pub users_by_dm: HashMap<String, String>,
    pub self_id: Option<String>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is the local identity.
    pub fn is_self(&self, id: &str) -> bool {
        self.self_id.as_deref() == Some(id)
    }

    pub fn user_by_nick(&self, nick: &str) -> Option<&User> {
        let id = self.users_by_name.get(&names::fold(nick))?;
        self.users.get(id)
    }

    /// Look up a channel by its IRC name (without the leading `#`).
    pub fn channel_by_name(&self, name: &str) -> Option<&Channel> {
        let id = self.channels_by_name.get(&names::fold(name))?;
        self.channels.get(id)
    }

    pub fn user_by_dm(&self, dm_id: &str) -> Option<&User> {
        let id = self.users_by_dm.get(dm_id)?;
        self.users.get(id)
    }

    /// The nick for a user id, or the id itself for users we have never
    /// heard of (translation must not invent entries).
    pub fn nick_of<'a>(&'a self, id: &'a str) -> &'a str {
        self.users.get(id).map_or(id, |u| u.nick.as_str())
    }

    /// Apply a user snapshot: create the user with an arbitrated nick, or
    /// re-arbitrate an existing user's nick against the current map.
    /// Returns the nick change if an existing user was renamed.
    pub fn update_user(&mut self, snap: &UserSnapshot) -> Option<NickChange> {
        let users_by_name = &mut self.users_by_name;
        if let Some(user) = self.users.get_mut(&snap.id) {
            // Remove the old folded entry first so the user can keep its
            // own nick when nothing else claimed it.
            users_by_name.remove(&names::fold(&user.nick));
            let nick = names::arbitrate(&snap.name, users_by_name);
            users_by_name.insert(names::fold(&nick), user.id.clone());

            if let Some(realname) = &snap.real_name {
                user.realname = realname.clone();
            }
            if let Some(presence) = &snap.presence {
                user.presence = Presence::from_api(presence);
            }
            user.is_stub = false;

            if user.nick != nick {
                let change = NickChange {
                    user: user.id.clone(),
                    old: std::mem::replace(&mut user.nick, nick.clone()),
                    new: nick,
                };
                Some(change)
            } else {
                None
            }
        } else {
            let nick = names::arbitrate(&snap.name, users_by_name);
            users_by_name.insert(names::fold(&nick), snap.id.clone());
            self.users.insert(
                snap.id.clone(),
                User {
                    id: snap.id.clone(),
                    nick,
                    realname: snap.real_name.clone().unwrap_or_default(),
                    presence: snap
                        .presence
                        .as_deref()
                        .map_or(Presence::Active, Presence::from_api),
                    channels: HashSet::new(),
                    dm: DmState::Absent,
                    tx_queue: VecDeque::new(),
                    is_stub: false,
                },
            );
            None
        }
    }

    /// Stub-create a user whose nick is derived from its id. Returns true
    /// if a stub was created (the caller owes a `users.info` call).
    pub fn record_unknown_user(&mut self, id: &str) -> bool {
        if self.users.contains_key(id) {
            return false;
        }
        let nick = names::arbitrate(id, &self.users_by_name);
        self.users_by_name.insert(names::fold(&nick), id.to_owned());
        self.users.insert(
            id.to_owned(),
            User {
                id: id.to_owned(),
                nick,
                realname: String::new(),
                presence: Presence::Active,
                channels: HashSet::new(),
                dm: DmState::Absent,
                tx_queue: VecDeque::new(),
                is_stub: true,
            },
        );
        true
    }

    /// Apply the deferred `users.info` result for a stub. A user that a
    /// later event already updated is left alone.
    pub fn update_stub_user(&mut self, snap: &UserSnapshot) -> Option<NickChange> {
        let is_stub = self.users.get(&snap.id).is_some_and(|u| u.is_stub);
        if is_stub {
            self.update_user(snap)
        } else {
            None
        }
    }

    /// Apply a channel snapshot: ensure every member exists (stubbing if
    /// necessary), replace the membership links, topic and kind. The name
    /// is arbitrated only on first creation so existing references stay
    /// stable. Closed groups exclude self from the membership set.
    pub fn update_channel(&mut self, kind: ChannelKind, snap: &ChannelSnapshot) -> ChannelUpdate {
        let mut new_stubs = Vec::new();
        // A snapshot without a member list leaves membership alone.
        let mut members: HashSet<String> = match &snap.members {
            Some(list) => list.iter().cloned().collect(),
            None => self
                .channels
                .get(&snap.id)
                .map(|c| c.members.clone())
                .unwrap_or_default(),
        };

        if kind == ChannelKind::Group && snap.is_open == Some(false) {
            if let Some(self_id) = &self.self_id {
                members.remove(self_id);
            }
        }

        for member in &members {
            if self.record_unknown_user(member) {
                new_stubs.push(member.clone());
            }
        }

        let topic = snap
            .topic
            .as_ref()
            .map(|t| t.value.clone())
            .unwrap_or_default();

        let created = !self.channels.contains_key(&snap.id);
        if created {
            let proposed = match kind {
                ChannelKind::Public => snap.name.clone(),
                ChannelKind::Group => format!("+{}", snap.name),
            };
            let name = names::arbitrate(&proposed, &self.channels_by_name);
            self.channels_by_name
                .insert(names::fold(&name), snap.id.clone());
            self.channels.insert(
                snap.id.clone(),
                Channel {
                    id: snap.id.clone(),
                    name,
                    kind,
                    topic,
                    members: HashSet::new(),
                },
            );
        } else if let Some(channel) = self.channels.get_mut(&snap.id) {
            channel.kind = kind;
            channel.topic = topic;
        }

        // Replace membership: unlink members that are gone, link the rest.
        let old_members = self
            .channels
            .get(&snap.id)
            .map(|c| c.members.clone())
            .unwrap_or_default();
        for gone in old_members.difference(&members) {
            self.part(gone, &snap.id);
        }
        for member in &members {
            self.join(member, &snap.id);
        }

        ChannelUpdate {
            id: snap.id.clone(),
            created,
            new_stubs,
        }
    }

    /// Remove the bidirectional links from every member, then drop the
    /// channel. Returns it for the caller's farewell broadcast.
    pub fn delete_channel(&mut self, id: &str) -> Option<Channel> {
        let channel = self.channels.remove(id)?;
        for member in &channel.members {
            if let Some(user) = self.users.get_mut(member) {
                user.channels.remove(id);
            }
        }
        self.channels_by_name.remove(&names::fold(&channel.name));
        Some(channel)
    }

    /// Insert the bidirectional membership link. Returns whether state
    /// changed (re-joining yields false).
    pub fn join(&mut self, user_id: &str, channel_id: &str) -> bool {
        let (Some(user), Some(channel)) = (
            self.users.get_mut(user_id),
            self.channels.get_mut(channel_id),
        ) else {
            return false;
        };
        let changed = user.channels.insert(channel_id.to_owned());
        channel.members.insert(user_id.to_owned());
        changed
    }

    /// Remove the bidirectional membership link. Returns whether state
    /// changed.
    pub fn part(&mut self, user_id: &str, channel_id: &str) -> bool {
        let mut changed = false;
        if let Some(user) = self.users.get_mut(user_id) {
            changed |= user.channels.remove(channel_id);
        }
        if let Some(channel) = self.channels.get_mut(channel_id) {
            changed |= channel.members.remove(user_id);
        }
        changed
    }

    /// Bind a DM channel to a user and hand back the queued bodies for
    /// FIFO transmission.
    pub fn open_dm(&mut self, user_id: &str, dm_id: &str) -> VecDeque<String> {
        let Some(user) = self.users.get_mut(user_id) else {
            return VecDeque::new();
        };
        user.dm = DmState::Open(dm_id.to_owned());
        self.users_by_dm.insert(dm_id.to_owned(), user_id.to_owned());
        std::mem::take(&mut user.tx_queue)
    }

    /// Clear a user's DM binding.
    pub fn close_dm(&mut self, user_id: &str) {
        if let Some(user) = self.users.get_mut(user_id) {
            if let DmState::Open(dm_id) = &user.dm {
                self.users_by_dm.remove(dm_id);
            }
            user.dm = DmState::Absent;
        }
    }

    /// `im.open` failed: return the queue for failure NOTICEs and put the
    /// DM state back to absent.
    pub fn fail_dm(&mut self, user_id: &str) -> VecDeque<String> {
        let Some(user) = self.users.get_mut(user_id) else {
            return VecDeque::new();
        };
        user.dm = DmState::Absent;
        std::mem::take(&mut user.tx_queue)
    }

    /// Discard the whole world (session teardown).
    pub fn clear(&mut self) {
        self.users.clear();
        self.channels.clear();
        self.users_by_name.clear();
        self.channels_by_name.clear();
        self.users_by_dm.clear();
        self.self_id = None;
    }
}
