//! Stanza builders: one pure function per logical operation.
//!
//! Builders never touch the network or any state. Operations that expect
//! a reply return a [`Request`] carrying the freshly generated
//! [`CorrelationId`] the reply will echo; fire-and-forget operations
//! return a bare [`Stanza`].
//!
//! The two stream headers ([`anonymous_stream`], [`auth_stream`]) are
//! start tags only and must be sent with
//! [`codec::encode_open`](crate::codec::encode_open).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::{CorrelationId, Credentials, Jid, Stanza, USER_DOMAIN};

/// Client version advertised to the server.
pub const CLIENT_VERSION: &str = "15.21.0.22201";

/// Protocol revision advertised in stream headers and roster queries.
pub const PROTOCOL_REVISION: &str = "8";

/// Prefix the server expects in front of device ids.
pub const DEVICE_PREFIX: &str = "CAN";

const LANG: &str = "en_US";

/// Namespaces of the queries this client issues.
pub mod ns {
    pub const REGISTER: &str = "jabber:iq:register";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const FRIEND: &str = "kik:iq:friend";
    pub const FRIEND_BATCH: &str = "kik:iq:friend:batch";
    pub const GROUP_ADMIN: &str = "kik:groups:admin";
    pub const USER_PROFILE: &str = "kik:iq:user-profile";
    pub const MESSAGE_RECEIPT: &str = "kik:message:receipt";
}

/// A stanza that expects a reply, plus the id that reply will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub stanza: Stanza,
    pub id: CorrelationId,
}

impl Request {
    /// Wraps a stanza, reading its correlation id from the `id`
    /// attribute or stamping a fresh one if it has none.
    pub fn new(mut stanza: Stanza) -> Self {
        let id = match stanza.id() {
            Some(existing) => CorrelationId::new(existing),
            None => {
                let id = CorrelationId::generate();
                stanza.set_attr("id", id.as_str());
                id
            }
        };
        Self { stanza, id }
    }
}

fn now_millis() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}

fn iq(kind: &str, query: Stanza) -> Request {
    Request::new(Stanza::new("iq").attr("type", kind).child(query))
}

fn query(xmlns: &str) -> Stanza {
    Stanza::new("query").attr("xmlns", xmlns)
}

fn flag(on: bool) -> &'static str {
    if on { "1" } else { "0" }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Header that opens an anonymous stream, used before node discovery.
pub fn anonymous_stream(device_id: &str) -> Stanza {
    Stanza::new("k")
        .attr("anon", "")
        .attr("dev", format!("{DEVICE_PREFIX}{device_id}"))
        .attr("v", CLIENT_VERSION)
        .attr("lang", LANG)
        .attr("ts", now_millis())
}

/// Asks the server for a routing node (the register/login query).
///
/// When the previous attempt was answered with a captcha challenge,
/// `captcha_response` carries the solver's answer.
pub fn request_node(
    credentials: &Credentials,
    device_id: &str,
    android_id: &str,
    captcha_response: Option<&str>,
) -> Request {
    let mut q = query(ns::REGISTER)
        .child(Stanza::new("username").text(&credentials.username))
        .child(Stanza::new("passkey-u").text(&credentials.password))
        .child(Stanza::new("device-id").text(device_id))
        .child(Stanza::new("install-referrer").text("utm_source=google-play&utm_medium=organic"))
        .child(Stanza::new("operator").text("310260"))
        .child(Stanza::new("install-date").text("unknown"))
        .child(Stanza::new("device-type").text("android"))
        .child(Stanza::new("brand").text("generic"))
        .child(Stanza::new("logins-since-install").text("1"))
        .child(Stanza::new("version").text(CLIENT_VERSION))
        .child(Stanza::new("lang").text(LANG))
        .child(Stanza::new("android-sdk").text("19"))
        .child(Stanza::new("registrations-since-install").text("0"))
        .child(Stanza::new("prefix").text(DEVICE_PREFIX))
        .child(Stanza::new("android-id").text(android_id))
        .child(Stanza::new("model").text("Samsung Galaxy S5 - 4.4.4 - API 19 - 1080x1920"));
    if let Some(response) = captcha_response {
        q = q.child(
            Stanza::new("challenge").child(Stanza::new("response").text(response)),
        );
    }
    iq("set", q)
}

/// Header that opens an authenticated stream on an assigned node.
///
/// `node` may be a bare node name or a full JID; a bare name is
/// qualified with the user domain.
pub fn auth_stream(credentials: &Credentials, node: &str, device_id: &str) -> Stanza {
    let from = if node.contains('@') {
        format!("{node}/{DEVICE_PREFIX}{device_id}")
    } else {
        format!("{node}@{USER_DOMAIN}/{DEVICE_PREFIX}{device_id}")
    };
    Stanza::new("k")
        .attr("from", from)
        .attr("to", USER_DOMAIN)
        .attr("p", PROTOCOL_REVISION)
        .attr("cv", CLIENT_VERSION)
        .attr("v", CLIENT_VERSION)
        .attr("sid", CorrelationId::generate().as_str())
        .attr("n", "1")
        .attr("conn", "WIFI")
        .attr("lang", LANG)
        .attr("ts", now_millis())
        .attr("u", &credentials.username)
        .attr("passkey", &credentials.password)
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Fetches the roster (friends and groups).
pub fn get_roster() -> Request {
    iq("get", query(ns::ROSTER).attr("p", PROTOCOL_REVISION))
}

/// Looks up profile information for a batch of JIDs.
pub fn get_jid_info(jids: &[Jid]) -> Request {
    let items = jids
        .iter()
        .map(|jid| Stanza::new("item").attr("jid", jid.as_str()));
    iq("get", query(ns::FRIEND_BATCH).children(items))
}

pub fn add_friend(jid: &Jid) -> Stanza {
    iq("set", query(ns::FRIEND).child(Stanza::new("add").attr("jid", jid.as_str()))).stanza
}

pub fn remove_friend(jid: &Jid) -> Stanza {
    iq("set", query(ns::FRIEND).child(Stanza::new("remove").attr("jid", jid.as_str()))).stanza
}

pub fn set_profile_name(first: &str, last: &str) -> Stanza {
    iq(
        "set",
        query(ns::USER_PROFILE)
            .child(Stanza::new("first").text(first))
            .child(Stanza::new("last").text(last)),
    )
    .stanza
}

pub fn set_email(email: &str, password: &str) -> Stanza {
    iq(
        "set",
        query(ns::USER_PROFILE)
            .child(Stanza::new("email").text(email))
            .child(Stanza::new("passkey-e").text(password)),
    )
    .stanza
}

pub fn set_password(old_password: &str, new_password: &str) -> Stanza {
    iq(
        "set",
        query(ns::USER_PROFILE)
            .child(Stanza::new("passkey-old").text(old_password))
            .child(Stanza::new("passkey-new").text(new_password)),
    )
    .stanza
}

// ---------------------------------------------------------------------------
// Messaging
// ---------------------------------------------------------------------------

/// Sends a text message. Group JIDs get a `groupchat` message, anything
/// else a private `chat`.
pub fn send_chat_message(to: &Jid, body: &str) -> Request {
    let ts = now_millis();
    let kind = if to.is_group() { "groupchat" } else { "chat" };
    let preview: String = body.chars().take(20).collect();
    Request::new(
        Stanza::new("message")
            .attr("type", kind)
            .attr("to", to.as_str())
            .attr("cts", &ts)
            .child(Stanza::new("body").text(body))
            .child(Stanza::new("preview").text(preview))
            .child(
                Stanza::new("kik")
                    .attr("push", "true")
                    .attr("qos", "true")
                    .attr("timestamp", &ts),
            )
            .child(
                Stanza::new("request")
                    .attr("xmlns", ns::MESSAGE_RECEIPT)
                    .attr("r", "true")
                    .attr("d", "true"),
            )
            .child(Stanza::new("ri")),
    )
}

// ---------------------------------------------------------------------------
// Group administration
// ---------------------------------------------------------------------------

fn group_admin(group: &Jid, op: Stanza) -> Stanza {
    iq(
        "set",
        query(ns::GROUP_ADMIN).child(Stanza::new("g").attr("jid", group.as_str()).child(op)),
    )
    .stanza
}

/// Promotes (`true`) or demotes (`false`) a member.
pub fn set_admin(group: &Jid, user: &Jid, admin: bool) -> Stanza {
    group_admin(group, Stanza::new("m").attr("a", flag(admin)).text(user.as_str()))
}

/// Bans (`true`) or unbans (`false`) a user.
pub fn set_banned(group: &Jid, user: &Jid, banned: bool) -> Stanza {
    let op = Stanza::new("b").text(user.as_str());
    group_admin(group, if banned { op } else { op.attr("r", "1") })
}

/// Adds (`true`) or removes (`false`) a member.
pub fn set_group_member(group: &Jid, user: &Jid, member: bool) -> Stanza {
    let op = Stanza::new("m").text(user.as_str());
    group_admin(group, if member { op } else { op.attr("r", "1") })
}

pub fn set_group_name(group: &Jid, name: &str) -> Stanza {
    group_admin(group, Stanza::new("n").text(name))
}

pub fn leave_group(group: &Jid) -> Stanza {
    group_admin(group, Stanza::new("l").text(group.as_str()))
}
