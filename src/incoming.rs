//! Reactions to server frames.
//!
//! One function per packet id. Each parses the payload, updates the session
//! and raises the matching notification with the frame's receive buffer as
//! the release action, so the buffer goes back to the pool only after every
//! subscriber has seen the payload.

use tracing::{debug, info, warn};

use crate::buffer::PooledBuffer;
use crate::credentials::{KeyBlock, RevisionRequest};
use crate::dispatch::Notification;
use crate::error::{BncsError, Result};
use crate::event::{
    AccountCreationFailedEvent, AccountCreationFailure, AccountEvent, AdEvent, ChannelFlags,
    ChannelListEvent, ChannelRefusedEvent, ChatMessage, ChatUser, ClanMember,
    ClanMemberListEvent, ClanMemberRemovedEvent, ClanMemberStatusEvent, ClientCheckFailedEvent,
    ClientCheckFailure, ClientNotice, EnteredChatEvent, FriendAddedEvent, FriendInfo,
    FriendListEvent, FriendRemovedEvent, FriendUpdatedEvent, JoinedChannelEvent,
    LoginFailedEvent, LoginFailure, NewsEvent, ServerText, UserFlags, WardenEvent,
};
use crate::packet::{sid, ChatEventPacket, PacketReader};
use crate::session::{JoinMethod, Session, SessionState};
use crate::settings::PingMethod;

/// Chat event ids carried by `SID_CHATEVENT`.
mod eid {
    pub const SHOW_USER: u32 = 0x01;
    pub const JOIN: u32 = 0x02;
    pub const LEAVE: u32 = 0x03;
    pub const WHISPER: u32 = 0x04;
    pub const TALK: u32 = 0x05;
    pub const BROADCAST: u32 = 0x06;
    pub const CHANNEL: u32 = 0x07;
    pub const USER_FLAGS: u32 = 0x09;
    pub const WHISPER_SENT: u32 = 0x0A;
    pub const CHANNEL_FULL: u32 = 0x0D;
    pub const CHANNEL_DOES_NOT_EXIST: u32 = 0x0E;
    pub const CHANNEL_RESTRICTED: u32 = 0x0F;
    pub const INFO: u32 = 0x12;
    pub const ERROR: u32 = 0x13;
    pub const EMOTE: u32 = 0x17;
}

/// Size of each field in the zero-knowledge challenge.
const CHALLENGE_FIELD_LEN: usize = 32;

/// Handle one frame. Parse errors are logged and surfaced as `ClientError`;
/// they never end the session.
pub(crate) fn handle_frame(session: &Session, id: u8, buffer: PooledBuffer) {
    let result = match id {
        sid::NULL => Ok(()),
        sid::PING => on_ping(session, &buffer),
        sid::AUTH_INFO => on_auth_info(session, buffer),
        sid::AUTH_CHECK => on_auth_check(session, buffer),
        sid::LOGONRESPONSE2 => on_logon_response(session, buffer),
        sid::AUTH_ACCOUNTLOGON => on_account_logon(session, buffer),
        sid::AUTH_ACCOUNTLOGONPROOF => on_account_logon_proof(session, buffer),
        sid::CREATEACCOUNT2 => on_create_account(session, buffer),
        sid::AUTH_ACCOUNTCREATE => on_account_create(session, buffer),
        sid::SETEMAIL => on_set_email(session, buffer),
        sid::ENTERCHAT => on_enter_chat(session, buffer),
        sid::GETCHANNELLIST => on_channel_list(session, buffer),
        sid::CHATEVENT => on_chat_event(session, buffer),
        sid::CHECKAD => on_check_ad(session, buffer),
        sid::MESSAGEBOX => on_message_box(session, buffer),
        sid::NEWS_INFO => on_news(session, buffer),
        sid::FRIENDSLIST => on_friends_list(session, buffer),
        sid::FRIENDSUPDATE => on_friends_update(session, buffer),
        sid::FRIENDSADD => on_friends_add(session, buffer),
        sid::FRIENDSREMOVE => on_friends_remove(session, buffer),
        sid::CLANMEMBERLIST => on_clan_member_list(session, buffer),
        sid::CLANMEMBERREMOVED => on_clan_member_removed(session, buffer),
        sid::CLANMEMBERSTATUSCHANGE => on_clan_member_status(session, buffer),
        sid::WARDEN => on_warden(session, buffer),
        other => {
            debug!(client = %session.id, packet = other, "ignoring unhandled packet");
            Ok(())
        }
    };

    if let Err(e) = result {
        warn!(client = %session.id, packet = id, error = %e, "failed to handle packet");
        session.notifications.client_error.raise(ClientNotice {
            message: e.to_string(),
        });
    }
}

/// Raise `payload` and return `buffer` to the pool after the last handler.
fn deliver<P>(notification: &Notification<P>, payload: P, buffer: PooledBuffer)
where
    P: std::fmt::Debug + Send + 'static,
{
    notification.raise_with_release(payload, buffer.into_release());
}

fn username(session: &Session) -> String {
    session.settings.read().username.clone()
}

// ── Connection ──────────────────────────────────────────────────────────

fn on_ping(session: &Session, buffer: &PooledBuffer) -> Result<()> {
    let cookie = PacketReader::new(sid::PING, buffer).read_u32()?;
    let method = session.settings.read().ping_method().unwrap_or_default();
    if method != PingMethod::Normal {
        return Ok(());
    }
    let mut writer = session.writer(sid::PING);
    writer.insert_u32(cookie);
    session.transmit(writer)
}

/// Raise `ClientError` and close; used when the handshake cannot continue.
fn abandon_handshake(session: &Session, error: &BncsError) {
    warn!(client = %session.id, error = %error, "abandoning handshake");
    session.notifications.client_error.raise(ClientNotice {
        message: error.to_string(),
    });
    session.close();
}

fn on_auth_info(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let (server_token, archive_filetime, archive, formula) = {
        let mut reader = PacketReader::new(sid::AUTH_INFO, &buffer);
        let _logon_type = reader.read_u32()?;
        let server_token = reader.read_u32()?;
        let _udp_value = reader.read_u32()?;
        let filetime = reader.read_u64()?;
        let archive = reader.read_cstring()?;
        let formula = reader.read_cstring()?;
        (server_token, filetime, archive, formula)
    };
    drop(buffer);
    session.set_server_token(server_token);

    let product = session.product()?;
    let caps = product.capabilities();
    let (request, keys, owner) = {
        let settings = session.settings.read();
        let request = RevisionRequest {
            product,
            archive,
            formula,
            archive_filetime,
            game_files: [
                settings.game_exe.clone(),
                settings.game_file2.clone(),
                settings.game_file3.clone(),
            ],
            lockdown_image: settings.lockdown_image.clone(),
        };
        let keys: Vec<String> = [&settings.cd_key, &settings.expansion_cd_key]
            .into_iter()
            .take(usize::from(caps.cd_keys_required))
            .cloned()
            .collect();
        let owner = if settings.cd_key_owner.is_empty() {
            settings.username.clone()
        } else {
            settings.cd_key_owner.clone()
        };
        (request, keys, owner)
    };

    debug!(client = %session.id, archive = %request.archive, "running revision check");
    session.notifications.client_information.raise(ClientNotice {
        message: format!("checking game files against {}", request.archive),
    });
    let revision = match session.revision.check(&request) {
        Ok(revision) => revision,
        Err(reason) => {
            abandon_handshake(session, &BncsError::RevisionCheck(reason));
            return Ok(());
        }
    };

    let (client_token, server_token) = session.tokens();
    let mut blocks: Vec<KeyBlock> = Vec::with_capacity(keys.len());
    for key in &keys {
        match session.cd_keys.key_block(key, client_token, server_token) {
            Some(block) => blocks.push(block),
            None => {
                abandon_handshake(
                    session,
                    &BncsError::RevisionCheck("CD key could not be decoded".to_string()),
                );
                return Ok(());
            }
        }
    }

    let mut writer = session.writer(sid::AUTH_CHECK);
    writer
        .insert_u32(client_token)
        .insert_u32(revision.version)
        .insert_u32(revision.checksum)
        .insert_u32(u32::from(caps.cd_keys_required))
        .insert_u32(0);
    for block in &blocks {
        writer
            .insert_u32(block.key_length)
            .insert_u32(block.product_value)
            .insert_u32(block.public_value)
            .insert_u32(0)
            .insert_bytes(&block.hash);
    }
    writer
        .insert_cstring(&revision.exe_info)
        .insert_cstring(&owner);
    session.transmit(writer)
}

fn on_auth_check(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let (result, additional_info) = {
        let mut reader = PacketReader::new(sid::AUTH_CHECK, &buffer);
        let result = reader.read_u32()?;
        let info = reader.read_cstring().unwrap_or_default();
        (result, info)
    };
    session.transition(SessionState::AwaitingClientCheck, SessionState::AwaitingLogin);

    let notifications = &session.notifications;
    match ClientCheckFailure::from_code(result) {
        None => {
            info!(client = %session.id, "client check passed");
            let auto_login = session.settings.read().auto_login;
            deliver(&notifications.client_check_passed, (), buffer);
            if auto_login {
                session.begin_login(false)?;
            }
        }
        Some((reason, expansion)) => {
            warn!(client = %session.id, ?reason, expansion, "client check failed");
            deliver(
                &notifications.client_check_failed,
                ClientCheckFailedEvent {
                    reason,
                    expansion,
                    additional_info,
                },
                buffer,
            );
        }
    }
    Ok(())
}

// ── Account ─────────────────────────────────────────────────────────────

fn login_succeeded(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let username = username(session);
    session.transition(SessionState::AwaitingLogin, SessionState::EnteredChat);
    info!(client = %session.id, %username, "login succeeded");
    deliver(
        &session.notifications.login_succeeded,
        AccountEvent { username },
        buffer,
    );
    session.request_chat_entry()
}

fn login_failed(
    session: &Session,
    reason: LoginFailure,
    message: Option<String>,
    buffer: PooledBuffer,
) -> Result<()> {
    let username = username(session);
    warn!(client = %session.id, %username, ?reason, "login failed");
    deliver(
        &session.notifications.login_failed,
        LoginFailedEvent {
            username,
            reason,
            message,
        },
        buffer,
    );
    Ok(())
}

fn on_logon_response(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let (status, message) = {
        let mut reader = PacketReader::new(sid::LOGONRESPONSE2, &buffer);
        let status = reader.read_u32()?;
        (status, reader.read_cstring().ok().filter(|m| !m.is_empty()))
    };
    match status {
        0x00 => login_succeeded(session, buffer),
        0x01 => login_failed(session, LoginFailure::AccountDoesNotExist, None, buffer),
        0x02 => login_failed(session, LoginFailure::InvalidPassword, None, buffer),
        0x06 => login_failed(session, LoginFailure::AccountClosed, message, buffer),
        other => login_failed(session, LoginFailure::Other(other), message, buffer),
    }
}

fn on_account_logon(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let mut reader = PacketReader::new(sid::AUTH_ACCOUNTLOGON, &buffer);
    let status = reader.read_u32()?;
    if status == 0x00 {
        let salt = reader.read_bytes(CHALLENGE_FIELD_LEN)?;
        let server_key = reader.read_bytes(CHALLENGE_FIELD_LEN)?;
        debug!(client = %session.id, "login challenge accepted; sending proof");
        return session.send_login_proof(salt, server_key);
    }
    drop(reader);
    match status {
        0x01 => login_failed(session, LoginFailure::AccountDoesNotExist, None, buffer),
        0x05 => login_failed(session, LoginFailure::UpgradeRequired, None, buffer),
        other => login_failed(session, LoginFailure::Other(other), None, buffer),
    }
}

fn on_account_logon_proof(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let (status, message) = {
        let mut reader = PacketReader::new(sid::AUTH_ACCOUNTLOGONPROOF, &buffer);
        let status = reader.read_u32()?;
        let _server_proof = reader.read_bytes(20).unwrap_or_default();
        (status, reader.read_cstring().ok().filter(|m| !m.is_empty()))
    };
    match status {
        0x00 => login_succeeded(session, buffer),
        0x0E => {
            session.notifications.set_mail_request.raise(AccountEvent {
                username: username(session),
            });
            login_succeeded(session, buffer)
        }
        0x02 => login_failed(session, LoginFailure::InvalidPassword, None, buffer),
        0x06 => login_failed(session, LoginFailure::AccountClosed, message, buffer),
        other => login_failed(session, LoginFailure::Other(other), message, buffer),
    }
}

fn account_created(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let (username, auto_login) = {
        let settings = session.settings.read();
        (settings.username.clone(), settings.auto_login)
    };
    info!(client = %session.id, %username, "account created");
    deliver(
        &session.notifications.account_created,
        AccountEvent { username },
        buffer,
    );
    if auto_login {
        session.begin_login(false)?;
    }
    Ok(())
}

fn account_creation_failed(
    session: &Session,
    reason: AccountCreationFailure,
    buffer: PooledBuffer,
) -> Result<()> {
    let username = username(session);
    warn!(client = %session.id, %username, ?reason, "account creation failed");
    deliver(
        &session.notifications.account_creation_failed,
        AccountCreationFailedEvent { username, reason },
        buffer,
    );
    Ok(())
}

fn on_create_account(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let status = PacketReader::new(sid::CREATEACCOUNT2, &buffer).read_u32()?;
    let reason = match status {
        0x00 => return account_created(session, buffer),
        0x02 => AccountCreationFailure::InvalidCharacters,
        0x03 => AccountCreationFailure::BannedWord,
        0x04 => AccountCreationFailure::NameInUse,
        0x06 => AccountCreationFailure::TooFewAlphanumeric,
        other => AccountCreationFailure::Other(other),
    };
    account_creation_failed(session, reason, buffer)
}

fn on_account_create(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let status = PacketReader::new(sid::AUTH_ACCOUNTCREATE, &buffer).read_u32()?;
    let reason = match status {
        0x00 => return account_created(session, buffer),
        0x04 => AccountCreationFailure::NameInUse,
        0x07 => AccountCreationFailure::NameTooShort,
        0x08 => AccountCreationFailure::InvalidCharacters,
        0x09 => AccountCreationFailure::BannedWord,
        0x0A => AccountCreationFailure::TooFewAlphanumeric,
        0x0B => AccountCreationFailure::AdjacentPunctuation,
        0x0C => AccountCreationFailure::TooMuchPunctuation,
        other => AccountCreationFailure::Other(other),
    };
    account_creation_failed(session, reason, buffer)
}

fn on_set_email(session: &Session, buffer: PooledBuffer) -> Result<()> {
    deliver(
        &session.notifications.set_mail_request,
        AccountEvent {
            username: username(session),
        },
        buffer,
    );
    Ok(())
}

// ── Chat ────────────────────────────────────────────────────────────────

fn on_enter_chat(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let event = {
        let mut reader = PacketReader::new(sid::ENTERCHAT, &buffer);
        EnteredChatEvent {
            unique_username: reader.read_cstring()?,
            statstring: reader.read_cstring()?,
            account_name: reader.read_cstring()?,
        }
    };
    session.set_unique_username(event.unique_username.clone());
    session.transition(SessionState::AwaitingLogin, SessionState::EnteredChat);
    info!(client = %session.id, unique_username = %event.unique_username, "entered chat");

    let home_channel = session.settings.read().home_channel.clone();
    deliver(&session.notifications.entered_chat, event, buffer);
    if !home_channel.is_empty() {
        session.join_channel(&home_channel, JoinMethod::First)?;
    }
    Ok(())
}

fn on_channel_list(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let channels = {
        let mut reader = PacketReader::new(sid::GETCHANNELLIST, &buffer);
        let mut channels = Vec::new();
        while reader.remaining() > 0 {
            let name = reader.read_cstring()?;
            if name.is_empty() {
                break;
            }
            channels.push(name);
        }
        channels
    };
    deliver(
        &session.notifications.channel_list_received,
        ChannelListEvent { channels },
        buffer,
    );
    Ok(())
}

fn on_chat_event(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let event = ChatEventPacket::parse(&buffer)?;
    let n = &session.notifications;
    let flags = UserFlags::from_bits_retain(event.flags);
    let user = |event: ChatEventPacket| ChatUser {
        username: event.username,
        flags,
        ping: event.ping,
        statstring: event.text,
    };
    let message = |event: ChatEventPacket| ChatMessage {
        username: event.username,
        flags,
        ping: event.ping,
        text: event.text,
    };

    match event.event_id {
        eid::SHOW_USER => deliver(&n.user_shown, user(event), buffer),
        eid::JOIN => deliver(&n.user_joined, user(event), buffer),
        eid::LEAVE => deliver(&n.user_left, user(event), buffer),
        eid::USER_FLAGS => deliver(&n.user_flags_changed, user(event), buffer),
        eid::WHISPER => deliver(&n.whisper_received, message(event), buffer),
        eid::TALK => deliver(&n.user_spoke, message(event), buffer),
        eid::EMOTE => deliver(&n.user_emoted, message(event), buffer),
        eid::WHISPER_SENT => deliver(&n.whisper_sent, message(event), buffer),
        eid::BROADCAST => deliver(&n.server_broadcast, ServerText { text: event.text }, buffer),
        eid::INFO => deliver(
            &n.information_received,
            ServerText { text: event.text },
            buffer,
        ),
        eid::ERROR => deliver(
            &n.server_error_received,
            ServerText { text: event.text },
            buffer,
        ),
        eid::CHANNEL => {
            session.set_channel(event.text.clone());
            session.transition(SessionState::EnteredChat, SessionState::InChannel);
            info!(client = %session.id, channel = %event.text, "joined channel");
            deliver(
                &n.joined_channel,
                JoinedChannelEvent {
                    channel: event.text,
                    flags: ChannelFlags::from_bits_retain(event.flags),
                },
                buffer,
            );
        }
        eid::CHANNEL_FULL => deliver(
            &n.channel_was_full,
            ChannelRefusedEvent { channel: event.text },
            buffer,
        ),
        eid::CHANNEL_DOES_NOT_EXIST => deliver(
            &n.channel_did_not_exist,
            ChannelRefusedEvent { channel: event.text },
            buffer,
        ),
        eid::CHANNEL_RESTRICTED => deliver(
            &n.channel_was_restricted,
            ChannelRefusedEvent { channel: event.text },
            buffer,
        ),
        other => debug!(client = %session.id, event = other, "ignoring unknown chat event"),
    }
    Ok(())
}

fn on_message_box(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let text = {
        let mut reader = PacketReader::new(sid::MESSAGEBOX, &buffer);
        let _style = reader.read_u32()?;
        reader.read_cstring()?
    };
    deliver(
        &session.notifications.server_error_received,
        ServerText { text },
        buffer,
    );
    Ok(())
}

// ── Rosters & misc ──────────────────────────────────────────────────────

fn on_check_ad(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let event = {
        let mut reader = PacketReader::new(sid::CHECKAD, &buffer);
        AdEvent {
            ad_id: reader.read_u32()?,
            extension: reader.read_dword_code()?,
            filetime: reader.read_u64()?,
            filename: reader.read_cstring()?,
            link_url: reader.read_cstring()?,
        }
    };
    deliver(&session.notifications.ad_changed, event, buffer);
    Ok(())
}

fn on_news(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let entries = {
        let mut reader = PacketReader::new(sid::NEWS_INFO, &buffer);
        let count = reader.read_u8()?;
        let _last_logon = reader.read_u32()?;
        let _oldest = reader.read_u32()?;
        let _newest = reader.read_u32()?;
        let mut entries = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            entries.push(NewsEvent {
                timestamp: reader.read_u32()?,
                text: reader.read_cstring()?,
            });
        }
        entries
    };

    // The buffer rides on the last entry.
    let news = &session.notifications.server_news;
    let mut entries = entries.into_iter().peekable();
    let mut buffer = Some(buffer);
    while let Some(entry) = entries.next() {
        match (entries.peek().is_none(), buffer.take()) {
            (true, Some(buffer)) => deliver(news, entry, buffer),
            (_, held) => {
                buffer = held;
                news.raise(entry);
            }
        }
    }
    Ok(())
}

fn read_friend(reader: &mut PacketReader<'_>) -> Result<FriendInfo> {
    Ok(FriendInfo {
        account: reader.read_cstring()?,
        status: reader.read_u8()?,
        location_type: reader.read_u8()?,
        product: reader.read_dword_code()?,
        location: reader.read_cstring()?,
    })
}

fn on_friends_list(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let friends = {
        let mut reader = PacketReader::new(sid::FRIENDSLIST, &buffer);
        let count = reader.read_u8()?;
        (0..count)
            .map(|_| read_friend(&mut reader))
            .collect::<Result<Vec<_>>>()?
    };
    deliver(
        &session.notifications.friend_list_received,
        FriendListEvent { friends },
        buffer,
    );
    Ok(())
}

fn on_friends_update(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let event = {
        let mut reader = PacketReader::new(sid::FRIENDSUPDATE, &buffer);
        let index = reader.read_u8()?;
        FriendUpdatedEvent {
            index,
            friend: FriendInfo {
                status: reader.read_u8()?,
                location_type: reader.read_u8()?,
                product: reader.read_dword_code()?,
                location: reader.read_cstring()?,
                ..FriendInfo::default()
            },
        }
    };
    deliver(&session.notifications.friend_updated, event, buffer);
    Ok(())
}

fn on_friends_add(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let friend = read_friend(&mut PacketReader::new(sid::FRIENDSADD, &buffer))?;
    deliver(
        &session.notifications.friend_added,
        FriendAddedEvent { friend },
        buffer,
    );
    Ok(())
}

fn on_friends_remove(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let index = PacketReader::new(sid::FRIENDSREMOVE, &buffer).read_u8()?;
    deliver(
        &session.notifications.friend_removed,
        FriendRemovedEvent { index },
        buffer,
    );
    Ok(())
}

fn read_clan_member(reader: &mut PacketReader<'_>) -> Result<ClanMember> {
    Ok(ClanMember {
        username: reader.read_cstring()?,
        rank: reader.read_u8()?,
        online: reader.read_u8()? != 0,
        location: reader.read_cstring()?,
    })
}

fn on_clan_member_list(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let members = {
        let mut reader = PacketReader::new(sid::CLANMEMBERLIST, &buffer);
        let _cookie = reader.read_u32()?;
        let count = reader.read_u8()?;
        (0..count)
            .map(|_| read_clan_member(&mut reader))
            .collect::<Result<Vec<_>>>()?
    };
    deliver(
        &session.notifications.clan_member_list_received,
        ClanMemberListEvent { members },
        buffer,
    );
    Ok(())
}

fn on_clan_member_removed(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let username = PacketReader::new(sid::CLANMEMBERREMOVED, &buffer).read_cstring()?;
    deliver(
        &session.notifications.clan_member_removed,
        ClanMemberRemovedEvent { username },
        buffer,
    );
    Ok(())
}

fn on_clan_member_status(session: &Session, buffer: PooledBuffer) -> Result<()> {
    let member = read_clan_member(&mut PacketReader::new(sid::CLANMEMBERSTATUSCHANGE, &buffer))?;
    deliver(
        &session.notifications.clan_member_status_changed,
        ClanMemberStatusEvent { member },
        buffer,
    );
    Ok(())
}

fn on_warden(session: &Session, buffer: PooledBuffer) -> Result<()> {
    debug!(client = %session.id, len = buffer.len(), "anti-cheat challenge left unhandled");
    let data = buffer.to_vec();
    deliver(
        &session.notifications.warden_unhandled,
        WardenEvent { data },
        buffer,
    );
    Ok(())
}
