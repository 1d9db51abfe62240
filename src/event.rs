//! The closed catalog of notifications a client raises, and their payloads.
//!
//! Each [`NotificationKind`] has exactly one [`Notification`] facade in
//! [`Notifications`], typed over its payload.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use bitflags::bitflags;

use crate::dispatch::{ClientId, DispatchPool, Notification};

/// Every notification a client can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NotificationKind {
    Connected,
    Disconnected,
    ClientError,
    ClientInformation,
    ClientCheckPassed,
    ClientCheckFailed,
    LoginSucceeded,
    LoginFailed,
    AccountCreated,
    AccountCreationFailed,
    SetMailRequest,
    EnteredChat,
    ChannelListReceived,
    JoinedChannel,
    ChannelWasFull,
    ChannelDidNotExist,
    ChannelWasRestricted,
    UserShown,
    UserJoined,
    UserLeft,
    UserFlagsChanged,
    UserSpoke,
    UserEmoted,
    WhisperReceived,
    WhisperSent,
    MessageSent,
    CommandSent,
    ServerBroadcast,
    ServerErrorReceived,
    InformationReceived,
    FriendListReceived,
    FriendUpdated,
    FriendAdded,
    FriendRemoved,
    ClanMemberListReceived,
    ClanMemberRemoved,
    ClanMemberStatusChanged,
    ServerNews,
    AdChanged,
    WardenUnhandled,
}

impl NotificationKind {
    /// Stable name used in logs and fault reports.
    pub fn name(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::ClientError => "ClientError",
            Self::ClientInformation => "ClientInformation",
            Self::ClientCheckPassed => "ClientCheckPassed",
            Self::ClientCheckFailed => "ClientCheckFailed",
            Self::LoginSucceeded => "LoginSucceeded",
            Self::LoginFailed => "LoginFailed",
            Self::AccountCreated => "AccountCreated",
            Self::AccountCreationFailed => "AccountCreationFailed",
            Self::SetMailRequest => "SetMailRequest",
            Self::EnteredChat => "EnteredChat",
            Self::ChannelListReceived => "ChannelListReceived",
            Self::JoinedChannel => "JoinedChannel",
            Self::ChannelWasFull => "ChannelWasFull",
            Self::ChannelDidNotExist => "ChannelDidNotExist",
            Self::ChannelWasRestricted => "ChannelWasRestricted",
            Self::UserShown => "UserShown",
            Self::UserJoined => "UserJoined",
            Self::UserLeft => "UserLeft",
            Self::UserFlagsChanged => "UserFlagsChanged",
            Self::UserSpoke => "UserSpoke",
            Self::UserEmoted => "UserEmoted",
            Self::WhisperReceived => "WhisperReceived",
            Self::WhisperSent => "WhisperSent",
            Self::MessageSent => "MessageSent",
            Self::CommandSent => "CommandSent",
            Self::ServerBroadcast => "ServerBroadcast",
            Self::ServerErrorReceived => "ServerErrorReceived",
            Self::InformationReceived => "InformationReceived",
            Self::FriendListReceived => "FriendListReceived",
            Self::FriendUpdated => "FriendUpdated",
            Self::FriendAdded => "FriendAdded",
            Self::FriendRemoved => "FriendRemoved",
            Self::ClanMemberListReceived => "ClanMemberListReceived",
            Self::ClanMemberRemoved => "ClanMemberRemoved",
            Self::ClanMemberStatusChanged => "ClanMemberStatusChanged",
            Self::ServerNews => "ServerNews",
            Self::AdChanged => "AdChanged",
            Self::WardenUnhandled => "WardenUnhandled",
        }
    }

    /// Dense index, used to route deferred work to a dispatch lane.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Flags ───────────────────────────────────────────────────────────

bitflags! {
    /// Per-user flags carried by chat events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UserFlags: u32 {
        const BLIZZARD_REP = 0x01;
        const CHANNEL_OPERATOR = 0x02;
        const SPEAKER = 0x04;
        const SERVER_ADMIN = 0x08;
        const NO_UDP = 0x10;
        const SQUELCHED = 0x20;
        const GUEST = 0x40;
    }
}

bitflags! {
    /// Flags describing a channel, reported when it is joined.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ChannelFlags: u32 {
        const PUBLIC = 0x01;
        const MODERATED = 0x02;
        const RESTRICTED = 0x04;
        const SILENT = 0x08;
        const SYSTEM = 0x10;
        const PRODUCT_SPECIFIC = 0x20;
        const GLOBAL = 0x1000;
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// Payload of `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedEvent {
    pub host: String,
    pub port: u16,
}

/// Payload of `Disconnected`. `reason` is `None` for a clean close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectedEvent {
    pub reason: Option<String>,
}

/// Client-side error or information text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientNotice {
    pub message: String,
}

/// Why the server rejected the version/key check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCheckFailure {
    /// The game version must be upgraded.
    OldVersion,
    /// The version could not be verified.
    InvalidVersion,
    /// The game version must be downgraded.
    NewerVersion,
    InvalidKey,
    KeyInUse,
    KeyBanned,
    WrongProduct,
    /// A result code this client does not know.
    Other(u32),
}

impl ClientCheckFailure {
    /// Map a `SID_AUTH_CHECK` result to a failure and whether it concerns
    /// the expansion key. `None` means the check passed.
    pub fn from_code(code: u32) -> Option<(Self, bool)> {
        let expansion = code & 0x010 != 0 && code >= 0x200;
        let reason = match code {
            0x000 => return None,
            0x100 => Self::OldVersion,
            0x101 => Self::InvalidVersion,
            0x102 => Self::NewerVersion,
            0x200 | 0x210 => Self::InvalidKey,
            0x201 | 0x211 => Self::KeyInUse,
            0x202 | 0x212 => Self::KeyBanned,
            0x203 | 0x213 => Self::WrongProduct,
            other => Self::Other(other),
        };
        Some((reason, expansion))
    }
}

/// Payload of `ClientCheckFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCheckFailedEvent {
    pub reason: ClientCheckFailure,
    /// The failure concerns the expansion key rather than the primary key.
    pub expansion: bool,
    /// Server-provided detail (e.g. the owner of a key in use).
    pub additional_info: String,
}

/// Payload of `LoginSucceeded`, `AccountCreated` and `SetMailRequest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountEvent {
    pub username: String,
}

/// Why a login attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailure {
    AccountDoesNotExist,
    InvalidPassword,
    AccountClosed,
    UpgradeRequired,
    Other(u32),
}

/// Payload of `LoginFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginFailedEvent {
    pub username: String,
    pub reason: LoginFailure,
    /// Server-provided text, when the status carries one.
    pub message: Option<String>,
}

/// Why the server refused to create an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountCreationFailure {
    NameInUse,
    NameTooShort,
    InvalidCharacters,
    BannedWord,
    TooFewAlphanumeric,
    AdjacentPunctuation,
    TooMuchPunctuation,
    Other(u32),
}

/// Payload of `AccountCreationFailed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountCreationFailedEvent {
    pub username: String,
    pub reason: AccountCreationFailure,
}

/// Payload of `EnteredChat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnteredChatEvent {
    /// The name the server assigned for this session (may carry a `#2` suffix).
    pub unique_username: String,
    pub statstring: String,
    pub account_name: String,
}

/// Payload of `ChannelListReceived`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelListEvent {
    pub channels: Vec<String>,
}

/// Payload of `JoinedChannel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedChannelEvent {
    pub channel: String,
    pub flags: ChannelFlags,
}

/// Payload of `ChannelWasFull`, `ChannelDidNotExist` and `ChannelWasRestricted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRefusedEvent {
    pub channel: String,
}

/// A user as described by a chat event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatUser {
    pub username: String,
    pub flags: UserFlags,
    pub ping: u32,
    pub statstring: String,
}

/// Text spoken, emoted or whispered by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub username: String,
    pub flags: UserFlags,
    pub ping: u32,
    pub text: String,
}

/// Text originating from the server itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerText {
    pub text: String,
}

/// Text this client sent to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingText {
    pub text: String,
}

/// A friend-list entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FriendInfo {
    pub account: String,
    pub status: u8,
    pub location_type: u8,
    /// Four-character product code, empty when offline.
    pub product: String,
    pub location: String,
}

/// Payload of `FriendListReceived`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendListEvent {
    pub friends: Vec<FriendInfo>,
}

/// Payload of `FriendUpdated`. The server omits the account name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendUpdatedEvent {
    pub index: u8,
    pub friend: FriendInfo,
}

/// Payload of `FriendAdded`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendAddedEvent {
    pub friend: FriendInfo,
}

/// Payload of `FriendRemoved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendRemovedEvent {
    pub index: u8,
}

/// A clan roster entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClanMember {
    pub username: String,
    pub rank: u8,
    pub online: bool,
    pub location: String,
}

/// Payload of `ClanMemberListReceived`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClanMemberListEvent {
    pub members: Vec<ClanMember>,
}

/// Payload of `ClanMemberRemoved`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClanMemberRemovedEvent {
    pub username: String,
}

/// Payload of `ClanMemberStatusChanged`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClanMemberStatusEvent {
    pub member: ClanMember,
}

/// Payload of `ServerNews`, one per news entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsEvent {
    pub timestamp: u32,
    pub text: String,
}

/// Payload of `AdChanged`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdEvent {
    pub ad_id: u32,
    pub extension: String,
    pub filetime: u64,
    pub filename: String,
    pub link_url: String,
}

/// Payload of `WardenUnhandled`: the raw anti-cheat challenge.
#[derive(Clone, PartialEq, Eq)]
pub struct WardenEvent {
    pub data: Vec<u8>,
}

impl fmt::Debug for WardenEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WardenEvent")
            .field("len", &self.data.len())
            .finish()
    }
}

// ── Facades ─────────────────────────────────────────────────────────

/// One [`Notification`] per [`NotificationKind`], owned by a client.
#[derive(Debug)]
pub struct Notifications {
    pub connected: Notification<ConnectedEvent>,
    pub disconnected: Notification<DisconnectedEvent>,
    pub client_error: Notification<ClientNotice>,
    pub client_information: Notification<ClientNotice>,
    pub client_check_passed: Notification<()>,
    pub client_check_failed: Notification<ClientCheckFailedEvent>,
    pub login_succeeded: Notification<AccountEvent>,
    pub login_failed: Notification<LoginFailedEvent>,
    pub account_created: Notification<AccountEvent>,
    pub account_creation_failed: Notification<AccountCreationFailedEvent>,
    pub set_mail_request: Notification<AccountEvent>,
    pub entered_chat: Notification<EnteredChatEvent>,
    pub channel_list_received: Notification<ChannelListEvent>,
    pub joined_channel: Notification<JoinedChannelEvent>,
    pub channel_was_full: Notification<ChannelRefusedEvent>,
    pub channel_did_not_exist: Notification<ChannelRefusedEvent>,
    pub channel_was_restricted: Notification<ChannelRefusedEvent>,
    pub user_shown: Notification<ChatUser>,
    pub user_joined: Notification<ChatUser>,
    pub user_left: Notification<ChatUser>,
    pub user_flags_changed: Notification<ChatUser>,
    pub user_spoke: Notification<ChatMessage>,
    pub user_emoted: Notification<ChatMessage>,
    pub whisper_received: Notification<ChatMessage>,
    pub whisper_sent: Notification<ChatMessage>,
    pub message_sent: Notification<OutgoingText>,
    pub command_sent: Notification<OutgoingText>,
    pub server_broadcast: Notification<ServerText>,
    pub server_error_received: Notification<ServerText>,
    pub information_received: Notification<ServerText>,
    pub friend_list_received: Notification<FriendListEvent>,
    pub friend_updated: Notification<FriendUpdatedEvent>,
    pub friend_added: Notification<FriendAddedEvent>,
    pub friend_removed: Notification<FriendRemovedEvent>,
    pub clan_member_list_received: Notification<ClanMemberListEvent>,
    pub clan_member_removed: Notification<ClanMemberRemovedEvent>,
    pub clan_member_status_changed: Notification<ClanMemberStatusEvent>,
    pub server_news: Notification<NewsEvent>,
    pub ad_changed: Notification<AdEvent>,
    pub warden_unhandled: Notification<WardenEvent>,
}

impl Notifications {
    /// Build empty subscription tables for every kind, all raising as
    /// `source` and deferring onto `pool`.
    pub fn new(
        source: ClientId,
        pool: Arc<DispatchPool>,
        fault_limit: Option<NonZeroU32>,
    ) -> Self {
        use NotificationKind as K;

        let factory = Factory {
            source,
            pool,
            fault_limit,
        };
        Self {
            connected: factory.make(K::Connected),
            disconnected: factory.make(K::Disconnected),
            client_error: factory.make(K::ClientError),
            client_information: factory.make(K::ClientInformation),
            client_check_passed: factory.make(K::ClientCheckPassed),
            client_check_failed: factory.make(K::ClientCheckFailed),
            login_succeeded: factory.make(K::LoginSucceeded),
            login_failed: factory.make(K::LoginFailed),
            account_created: factory.make(K::AccountCreated),
            account_creation_failed: factory.make(K::AccountCreationFailed),
            set_mail_request: factory.make(K::SetMailRequest),
            entered_chat: factory.make(K::EnteredChat),
            channel_list_received: factory.make(K::ChannelListReceived),
            joined_channel: factory.make(K::JoinedChannel),
            channel_was_full: factory.make(K::ChannelWasFull),
            channel_did_not_exist: factory.make(K::ChannelDidNotExist),
            channel_was_restricted: factory.make(K::ChannelWasRestricted),
            user_shown: factory.make(K::UserShown),
            user_joined: factory.make(K::UserJoined),
            user_left: factory.make(K::UserLeft),
            user_flags_changed: factory.make(K::UserFlagsChanged),
            user_spoke: factory.make(K::UserSpoke),
            user_emoted: factory.make(K::UserEmoted),
            whisper_received: factory.make(K::WhisperReceived),
            whisper_sent: factory.make(K::WhisperSent),
            message_sent: factory.make(K::MessageSent),
            command_sent: factory.make(K::CommandSent),
            server_broadcast: factory.make(K::ServerBroadcast),
            server_error_received: factory.make(K::ServerErrorReceived),
            information_received: factory.make(K::InformationReceived),
            friend_list_received: factory.make(K::FriendListReceived),
            friend_updated: factory.make(K::FriendUpdated),
            friend_added: factory.make(K::FriendAdded),
            friend_removed: factory.make(K::FriendRemoved),
            clan_member_list_received: factory.make(K::ClanMemberListReceived),
            clan_member_removed: factory.make(K::ClanMemberRemoved),
            clan_member_status_changed: factory.make(K::ClanMemberStatusChanged),
            server_news: factory.make(K::ServerNews),
            ad_changed: factory.make(K::AdChanged),
            warden_unhandled: factory.make(K::WardenUnhandled),
        }
    }
}

struct Factory {
    source: ClientId,
    pool: Arc<DispatchPool>,
    fault_limit: Option<NonZeroU32>,
}

impl Factory {
    fn make<P: fmt::Debug + Send + 'static>(&self, kind: NotificationKind) -> Notification<P> {
        Notification::new(kind, self.source, Arc::clone(&self.pool), self.fault_limit)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn auth_check_codes_map_to_reasons() {
        assert_eq!(ClientCheckFailure::from_code(0), None);
        assert_eq!(
            ClientCheckFailure::from_code(0x100),
            Some((ClientCheckFailure::OldVersion, false))
        );
        assert_eq!(
            ClientCheckFailure::from_code(0x201),
            Some((ClientCheckFailure::KeyInUse, false))
        );
        assert_eq!(
            ClientCheckFailure::from_code(0x212),
            Some((ClientCheckFailure::KeyBanned, true))
        );
        assert_eq!(
            ClientCheckFailure::from_code(0x999),
            Some((ClientCheckFailure::Other(0x999), true))
        );
    }

    #[test]
    fn notifications_are_wired_to_their_own_kind() {
        let pool = Arc::new(DispatchPool::with_workers(1).unwrap());
        let set = Notifications::new(ClientId::new(), pool, None);
        assert_eq!(set.connected.kind(), NotificationKind::Connected);
        assert_eq!(set.channel_was_full.kind(), NotificationKind::ChannelWasFull);
        assert_eq!(set.warden_unhandled.kind(), NotificationKind::WardenUnhandled);
        assert_eq!(set.user_spoke.kind().to_string(), "UserSpoke");
    }

    #[test]
    fn warden_debug_hides_bytes() {
        let event = WardenEvent {
            data: vec![1, 2, 3],
        };
        assert_eq!(format!("{event:?}"), "WardenEvent { len: 3 }");
    }
}
