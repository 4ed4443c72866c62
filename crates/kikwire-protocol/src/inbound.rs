//! Inbound classification: what does this frame mean?
//!
//! The client's dispatcher first checks whether a stanza answers one of
//! its pending requests. Whatever is left over is handed to [`classify`],
//! which maps it to exactly one [`Inbound`] variant. Handshake variants
//! drive the connection state machine; the rest become broadcast events.
//! Anything unrecognised is preserved as [`Inbound::Other`] rather than
//! dropped.

use crate::requests::ns;
use crate::{ChatMessage, Frame, Group, Jid, ProtocolError, Stanza, User};

/// The meaning of one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The server opened a stream. `ok` is false when the header
    /// rejects us (bad credentials, unknown node).
    StreamOpened { ok: bool, header: Stanza },
    /// The server closed the stream.
    StreamClosed,
    /// Node discovery succeeded.
    NodeIssued { node: String },
    /// Node discovery needs a captcha solved first.
    CaptchaChallenge { url: String },
    /// Node discovery failed for a reason other than a captcha.
    RegisterRejected { code: Option<u16>, text: String },
    /// A roster (friends and groups).
    Roster { groups: Vec<Group>, friends: Vec<User> },
    /// Profile information for a batch of JIDs.
    JidInfo { users: Vec<User> },
    /// A member left a group.
    UserLeftGroup { group: Jid, user: Jid },
    /// A chat message.
    Message(ChatMessage),
    /// Anything else.
    Other(Stanza),
}

impl Inbound {
    /// Returns `true` for the variants that belong to the handshake.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Self::StreamOpened { .. }
                | Self::StreamClosed
                | Self::NodeIssued { .. }
                | Self::CaptchaChallenge { .. }
                | Self::RegisterRejected { .. }
        )
    }
}

/// Classifies one frame.
pub fn classify(frame: Frame) -> Inbound {
    match frame {
        Frame::StreamOpen(header) => Inbound::StreamOpened {
            ok: header.get_attr("ok") == Some("1"),
            header,
        },
        Frame::StreamClose => Inbound::StreamClosed,
        Frame::Stanza(stanza) => classify_stanza(stanza),
    }
}

fn classify_stanza(stanza: Stanza) -> Inbound {
    match stanza.name.as_str() {
        "iq" => classify_iq(stanza),
        "message" => classify_message(stanza),
        _ => Inbound::Other(stanza),
    }
}

fn query_ns(stanza: &Stanza) -> Option<&str> {
    stanza.get_child("query").and_then(|q| q.get_attr("xmlns"))
}

fn classify_iq(stanza: Stanza) -> Inbound {
    let kind = stanza.get_attr("type").unwrap_or_default();

    if kind == "error" {
        if let Some(url) = stanza.find("captcha-url").and_then(|c| c.text.clone()) {
            return Inbound::CaptchaChallenge { url };
        }
        if query_ns(&stanza) == Some(ns::REGISTER) {
            let error = stanza.get_child("error");
            return Inbound::RegisterRejected {
                code: error
                    .and_then(|e| e.get_attr("code"))
                    .and_then(|c| c.parse().ok()),
                text: error
                    .and_then(|e| e.child_text("text").or(e.text.as_deref()))
                    .unwrap_or("registration rejected")
                    .to_string(),
            };
        }
        return Inbound::Other(stanza);
    }

    if kind != "result" && kind != "set" {
        return Inbound::Other(stanza);
    }

    match query_ns(&stanza) {
        Some(ns::REGISTER) => {
            match stanza.find("node").and_then(|n| n.text.clone()) {
                Some(node) => Inbound::NodeIssued { node },
                None => Inbound::RegisterRejected {
                    code: None,
                    text: "register reply carried no node".into(),
                },
            }
        }
        Some(ns::ROSTER) => match parse_roster(&stanza) {
            Ok((groups, friends)) => Inbound::Roster { groups, friends },
            Err(e) => {
                tracing::debug!(error = %e, "unparseable roster");
                Inbound::Other(stanza)
            }
        },
        Some(ns::FRIEND_BATCH) | Some(ns::FRIEND) => match parse_users(&stanza) {
            Ok(users) => Inbound::JidInfo { users },
            Err(e) => {
                tracing::debug!(error = %e, "unparseable jid info");
                Inbound::Other(stanza)
            }
        },
        _ => Inbound::Other(stanza),
    }
}

fn classify_message(stanza: Stanza) -> Inbound {
    let group_el = stanza.get_child("g");

    if let Some(g) = group_el {
        if let Some(user) = g.child_text("l") {
            let group = g
                .get_attr("jid")
                .or(stanza.get_attr("from"))
                .unwrap_or_default();
            return Inbound::UserLeftGroup {
                group: Jid::from(group),
                user: Jid::from(user),
            };
        }
    }

    let group = match stanza.get_attr("type") {
        Some("groupchat") => group_el.and_then(|g| g.get_attr("jid")).map(Jid::from),
        _ => None,
    };
    let body = stanza.child_text("body").map(str::to_string);
    let from = stanza.get_attr("from").map(Jid::from);

    let (Some(body), Some(from)) = (body, from) else {
        return Inbound::Other(stanza);
    };

    Inbound::Message(ChatMessage {
        id: stanza.id().map(str::to_string),
        from,
        group,
        body,
    })
}

fn user_from_item(item: &Stanza) -> Result<User, ProtocolError> {
    let jid = item
        .get_attr("jid")
        .ok_or_else(|| ProtocolError::InvalidStanza("item without jid".into()))?;
    Ok(User {
        jid: Jid::from(jid),
        username: item.child_text("username").map(str::to_string),
        display_name: item.child_text("display-name").map(str::to_string),
    })
}

/// Extracts groups and friends from a roster reply.
///
/// # Errors
/// [`ProtocolError::InvalidStanza`] if there is no `query` child or an
/// entry lacks its `jid`.
pub fn parse_roster(stanza: &Stanza) -> Result<(Vec<Group>, Vec<User>), ProtocolError> {
    let query = stanza
        .get_child("query")
        .ok_or_else(|| ProtocolError::InvalidStanza("roster without query".into()))?;

    let friends = query
        .children_named("item")
        .map(user_from_item)
        .collect::<Result<Vec<_>, _>>()?;

    let groups = query
        .children_named("g")
        .map(|g| {
            let jid = g
                .get_attr("jid")
                .ok_or_else(|| ProtocolError::InvalidStanza("group without jid".into()))?;
            Ok(Group {
                jid: Jid::from(jid),
                name: g.child_text("n").map(str::to_string),
                code: g.get_attr("code").map(str::to_string),
                users: g
                    .children_named("m")
                    .filter_map(|m| m.text.as_deref())
                    .map(Jid::from)
                    .collect(),
            })
        })
        .collect::<Result<Vec<_>, ProtocolError>>()?;

    Ok((groups, friends))
}

/// Extracts users from a JID-info reply.
///
/// Items may sit directly under `query` or inside a `success` wrapper.
///
/// # Errors
/// [`ProtocolError::InvalidStanza`] if there is no `query` child or an
/// item lacks its `jid`.
pub fn parse_users(stanza: &Stanza) -> Result<Vec<User>, ProtocolError> {
    let query = stanza
        .get_child("query")
        .ok_or_else(|| ProtocolError::InvalidStanza("jid info without query".into()))?;

    query
        .children_named("item")
        .chain(
            query
                .children_named("success")
                .flat_map(|s| s.children_named("item")),
        )
        .map(user_from_item)
        .collect()
}
