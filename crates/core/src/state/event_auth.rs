//! The per-room-version event authorization rules.

use std::collections::BTreeSet;

use serde::de::IgnoredAny;
use serde::Deserialize;

use super::power_levels::{
    deserialize_power_levels, deserialize_power_levels_content_fields,
    deserialize_power_levels_content_invite, deserialize_power_levels_content_redact,
};
use super::{Event, StateError, StateResult};
use crate::events::room::create::RoomCreateEventContent;
use crate::events::room::join_rule::JoinRule;
use crate::events::room::member::{MembershipState, ThirdPartyInvite};
use crate::events::room::power_levels::RoomPowerLevelsEventContent;
use crate::events::room::third_party_invite::RoomThirdPartyInviteEventContent;
use crate::events::{StateEventType, TimelineEventType};
use crate::room_version::AuthorizationRules;
use crate::serde::{Base64, RawJson, RawJsonValue};
use crate::{OwnedUserId, RoomVersionId, UserId};

#[derive(Deserialize, Debug)]
struct GetMembership {
    membership: MembershipState,
}

#[derive(Deserialize, Debug)]
struct RoomMemberContentFields {
    membership: Option<RawJson<MembershipState>>,
    join_authorised_via_users_server: Option<RawJson<OwnedUserId>>,
}

/// For the given event `kind` what are the relevant auth events that are
/// needed to authenticate this `content`.
///
/// # Errors
///
/// This function will return an error if the supplied `content` is not a
/// JSON object.
pub fn auth_types_for_event(
    kind: &TimelineEventType,
    sender: &UserId,
    state_key: Option<&str>,
    content: &RawJsonValue,
) -> serde_json::Result<Vec<(StateEventType, String)>> {
    if kind == &TimelineEventType::RoomCreate {
        return Ok(vec![]);
    }

    let mut auth_types = vec![
        (StateEventType::RoomPowerLevels, "".to_owned()),
        (StateEventType::RoomMember, sender.to_string()),
        (StateEventType::RoomCreate, "".to_owned()),
    ];

    if kind == &TimelineEventType::RoomMember {
        #[derive(Deserialize)]
        struct RoomMemberContentFields {
            membership: Option<RawJson<MembershipState>>,
            third_party_invite: Option<RawJson<ThirdPartyInvite>>,
            join_authorised_via_users_server: Option<RawJson<OwnedUserId>>,
        }

        if let Some(state_key) = state_key {
            let content: RoomMemberContentFields = serde_json::from_str(content.get())?;

            if let Some(Ok(membership)) = content.membership.map(|m| m.deserialize()) {
                if [
                    MembershipState::Join,
                    MembershipState::Invite,
                    MembershipState::Knock,
                ]
                .contains(&membership)
                {
                    let key = (StateEventType::RoomJoinRules, "".to_owned());
                    if !auth_types.contains(&key) {
                        auth_types.push(key);
                    }

                    if let Some(Ok(u)) = content
                        .join_authorised_via_users_server
                        .map(|m| m.deserialize())
                    {
                        let key = (StateEventType::RoomMember, u.to_string());
                        if !auth_types.contains(&key) {
                            auth_types.push(key);
                        }
                    }
                }

                let key = (StateEventType::RoomMember, state_key.to_owned());
                if !auth_types.contains(&key) {
                    auth_types.push(key);
                }

                if membership == MembershipState::Invite {
                    if let Some(Ok(t_id)) = content.third_party_invite.map(|t| t.deserialize())
                    {
                        let key = (StateEventType::RoomThirdPartyInvite, t_id.signed.token);
                        if !auth_types.contains(&key) {
                            auth_types.push(key);
                        }
                    }
                }
            }
        }
    }

    Ok(auth_types)
}

/// Authenticate the incoming `event` against the state the `fetch_state`
/// closure exposes.
///
/// The closure should gather state from a state snapshot: the rules decide
/// whether the event passes auth against some particular state, not against
/// a recursive collection of `auth_events` fields. Signature validity is a
/// precondition; call `signatures::verify_event` first.
pub fn auth_check<E: Event>(
    rules: &AuthorizationRules,
    incoming_event: &impl Event,
    current_third_party_invite: Option<&impl Event>,
    fetch_state: impl Fn(&StateEventType, &str) -> Option<E>,
) -> StateResult<()> {
    debug!(
        event_id = %incoming_event.event_id(),
        event_type = %incoming_event.event_type(),
        "starting auth check"
    );

    let sender = incoming_event.sender();

    // 1. If type is m.room.create:
    if *incoming_event.event_type() == TimelineEventType::RoomCreate {
        #[derive(Deserialize)]
        struct RoomCreateContentFields {
            room_version: Option<RawJson<RoomVersionId>>,
            creator: Option<RawJson<IgnoredAny>>,
        }

        // If it has any previous events, reject.
        if !incoming_event.prev_events().is_empty() {
            return Err(StateError::forbidden(
                "the room creation event had previous events",
            ));
        }

        // If the domain of the room_id does not match the domain of the
        // sender, reject. Versions that derive the room ID from the create
        // event have no domain to compare.
        if !rules.room_create_event_id_as_room_id {
            let Some(room_id_server_name) = incoming_event.room_id().server_name() else {
                return Err(StateError::forbidden("room ID has no server name"));
            };
            if room_id_server_name != sender.server_name() {
                return Err(StateError::forbidden(
                    "server name of room ID does not match server name of sender",
                ));
            }
        }

        // If content.room_version is present and is not a recognized
        // version, reject.
        let content: RoomCreateContentFields =
            serde_json::from_str(incoming_event.content().get())?;
        if content
            .room_version
            .map(|v| v.deserialize().is_err())
            .unwrap_or(false)
        {
            return Err(StateError::forbidden(
                "invalid room version found in m.room.create event",
            ));
        }

        if !rules.use_room_create_sender {
            // If content has no creator field, reject.
            if content.creator.is_none() {
                return Err(StateError::forbidden(
                    "no creator field found in m.room.create content",
                ));
            }
        }

        debug!("m.room.create event was allowed");
        return Ok(());
    }

    let room_create_event = match fetch_state(&StateEventType::RoomCreate, "") {
        None => {
            return Err(StateError::forbidden("no m.room.create event in auth chain"));
        }
        Some(e) => e,
    };

    // 3. If event does not have m.room.create in auth_events, reject.
    // Room versions that derive the room ID from the create event stop
    // carrying it in auth_events.
    if !rules.room_create_event_id_as_room_id
        && !incoming_event
            .auth_events()
            .iter()
            .any(|id| id == room_create_event.event_id())
    {
        return Err(StateError::forbidden("no m.room.create event in auth events"));
    }

    // If the create event content has the field m.federate set to false and
    // the sender domain of the event does not match the sender domain of the
    // create event, reject.
    #[derive(Deserialize)]
    struct RoomCreateContentFederate {
        #[serde(rename = "m.federate", default = "crate::serde::default_true")]
        federate: bool,
    }
    let room_create_content: RoomCreateContentFederate =
        serde_json::from_str(room_create_event.content().get())?;
    if !room_create_content.federate
        && room_create_event.sender().server_name() != incoming_event.sender().server_name()
    {
        return Err(StateError::forbidden(
            "room is not federated and event's sender domain does not match create event's \
             sender domain",
        ));
    }

    // Only in room versions 5 and below: 4. If type is m.room.aliases
    if rules.special_case_room_aliases
        && *incoming_event.event_type() == TimelineEventType::RoomAliases
    {
        debug!("starting m.room.aliases check");

        // If sender's domain doesn't match state_key, reject.
        if incoming_event.state_key() != Some(sender.server_name().as_str()) {
            return Err(StateError::forbidden("state_key does not match sender"));
        }

        debug!("m.room.aliases event was allowed");
        return Ok(());
    }

    let power_levels_event = fetch_state(&StateEventType::RoomPowerLevels, "");
    let sender_member_event = fetch_state(&StateEventType::RoomMember, sender.as_str());

    // If type is m.room.member
    if *incoming_event.event_type() == TimelineEventType::RoomMember {
        debug!("starting m.room.member check");
        let state_key = match incoming_event.state_key() {
            None => {
                return Err(StateError::forbidden("no state key in member event"));
            }
            Some(s) => s,
        };

        let content: RoomMemberContentFields =
            serde_json::from_str(incoming_event.content().get())?;
        if content
            .membership
            .as_ref()
            .and_then(|m| m.deserialize().ok())
            .is_none()
        {
            return Err(StateError::forbidden(
                "no valid membership field found for m.room.member event content",
            ));
        }

        let target_user = <&UserId>::try_from(state_key)
            .map_err(|e| StateError::InvalidPdu(e.to_string()))?;

        let user_for_join_auth = content
            .join_authorised_via_users_server
            .as_ref()
            .and_then(|u| u.deserialize().ok());

        let user_for_join_auth_membership = user_for_join_auth
            .as_ref()
            .and_then(|auth_user| fetch_state(&StateEventType::RoomMember, auth_user.as_str()))
            .and_then(|mem| serde_json::from_str::<GetMembership>(mem.content().get()).ok())
            .map(|mem| mem.membership)
            .unwrap_or(MembershipState::Leave);

        if let Some(reason) = membership_change_forbidden(
            rules,
            target_user,
            fetch_state(&StateEventType::RoomMember, target_user.as_str()).as_ref(),
            sender,
            sender_member_event.as_ref(),
            incoming_event,
            current_third_party_invite,
            power_levels_event.as_ref(),
            fetch_state(&StateEventType::RoomJoinRules, "").as_ref(),
            user_for_join_auth.as_deref(),
            &user_for_join_auth_membership,
            &room_create_event,
        )? {
            return Err(StateError::forbidden(reason));
        }

        debug!("m.room.member event was allowed");
        return Ok(());
    }

    // If the sender's current membership state is not join, reject.
    let sender_member_event = match sender_member_event {
        Some(mem) => mem,
        None => {
            return Err(StateError::forbidden(format!(
                "sender `{sender}` not found in room"
            )));
        }
    };

    let sender_membership_event_content: RoomMemberContentFields =
        serde_json::from_str(sender_member_event.content().get())?;
    let membership_state = sender_membership_event_content
        .membership
        .ok_or_else(|| StateError::InvalidPdu("missing membership field".into()))?
        .deserialize()?;

    if !matches!(membership_state, MembershipState::Join) {
        return Err(StateError::forbidden(format!(
            "sender's membership is not join, current state is `{membership_state}`"
        )));
    }

    let sender_power_level = if let Some(pl) = &power_levels_event {
        let content = deserialize_power_levels_content_fields(pl.content().get(), rules)?;
        if let Some(level) = content.users.get(sender) {
            *level
        } else {
            content.users_default
        }
    } else {
        // If no power level event found, the creator gets 100, everyone else
        // gets 0.
        let is_creator = if rules.use_room_create_sender {
            room_create_event.sender() == sender
        } else {
            serde_json::from_str::<RoomCreateEventContent>(room_create_event.content().get())
                .ok()
                .and_then(|create| create.creator)
                .is_some_and(|creator| creator == *sender)
        };

        if is_creator { 100 } else { 0 }
    };

    // Allow if and only if sender's current power level is greater than or
    // equal to the invite level.
    if *incoming_event.event_type() == TimelineEventType::RoomThirdPartyInvite {
        let invite_level = match &power_levels_event {
            Some(power_levels) => {
                deserialize_power_levels_content_invite(power_levels.content().get(), rules)?
                    .invite
            }
            None => 0,
        };

        if sender_power_level < invite_level {
            return Err(StateError::forbidden(
                "sender cannot send invites in this room",
            ));
        }

        debug!("m.room.third_party_invite event was allowed");
        return Ok(());
    }

    // If the event type's required power level is greater than the sender's
    // power level, reject. If the event has a state_key that starts with an
    // @ and does not match the sender, reject.
    if !can_send_event(incoming_event, power_levels_event.as_ref(), sender_power_level) {
        return Err(StateError::forbidden(
            "sender does not have permission to post that to the room",
        ));
    }

    // If type is m.room.power_levels
    if *incoming_event.event_type() == TimelineEventType::RoomPowerLevels {
        debug!("starting m.room.power_levels check");

        if !check_power_levels(
            rules,
            incoming_event,
            power_levels_event.as_ref(),
            sender_power_level,
        )
        .unwrap_or(false)
        {
            return Err(StateError::forbidden("power level change was not allowed"));
        }
        debug!("power levels event allowed");
    }

    // Room versions below 3: redaction events require either enough power or
    // a matching origin server, checked here. Servers should not apply
    // redactions to clients until both the redaction event and original
    // event have been seen, and are valid.
    if rules.special_case_room_redaction
        && *incoming_event.event_type() == TimelineEventType::RoomRedaction
    {
        let redact_level = match power_levels_event {
            Some(pl) => {
                deserialize_power_levels_content_redact(pl.content().get(), rules)?.redact
            }
            None => 50,
        };

        if !check_redaction(incoming_event, sender_power_level, redact_level)? {
            return Err(StateError::forbidden("redaction check failed"));
        }
    }

    debug!("allowing event passed all checks");
    Ok(())
}

/// The membership transition truth table.
///
/// Returns `None` when the change is allowed, or the reason it is not.
#[allow(clippy::too_many_arguments)]
fn membership_change_forbidden(
    rules: &AuthorizationRules,
    target_user: &UserId,
    target_user_membership_event: Option<&impl Event>,
    sender: &UserId,
    sender_membership_event: Option<&impl Event>,
    current_event: &impl Event,
    current_third_party_invite: Option<&impl Event>,
    power_levels_event: Option<&impl Event>,
    join_rule_event: Option<&impl Event>,
    user_for_join_auth: Option<&UserId>,
    user_for_join_auth_membership: &MembershipState,
    create_room: &impl Event,
) -> StateResult<Option<&'static str>> {
    #[derive(Deserialize)]
    struct GetThirdPartyInvite {
        third_party_invite: Option<RawJson<ThirdPartyInvite>>,
    }
    let content = current_event.content();

    let target_membership = serde_json::from_str::<GetMembership>(content.get())?.membership;
    let third_party_invite =
        serde_json::from_str::<GetThirdPartyInvite>(content.get())?.third_party_invite;

    let sender_membership = match &sender_membership_event {
        Some(pdu) => serde_json::from_str::<GetMembership>(pdu.content().get())?.membership,
        None => MembershipState::Leave,
    };
    let sender_is_joined = sender_membership == MembershipState::Join;

    let target_user_current_membership = match &target_user_membership_event {
        Some(pdu) => serde_json::from_str::<GetMembership>(pdu.content().get())?.membership,
        None => MembershipState::Leave,
    };

    let power_levels: RoomPowerLevelsEventContent = match &power_levels_event {
        Some(ev) => serde_json::from_str(ev.content().get())?,
        None => RoomPowerLevelsEventContent::default(),
    };

    let sender_power = power_levels
        .users
        .get(sender)
        .or_else(|| sender_is_joined.then_some(&power_levels.users_default));

    let target_power = power_levels.users.get(target_user).or_else(|| {
        (target_membership == MembershipState::Join).then_some(&power_levels.users_default)
    });

    let mut join_rule = JoinRule::Invite;
    if let Some(jr) = &join_rule_event {
        join_rule = serde_json::from_str::<crate::events::room::join_rule::RoomJoinRulesEventContent>(
            jr.content().get(),
        )?
        .join_rule;
    }

    let user_for_join_auth_is_valid = if let Some(user_for_join_auth) = user_for_join_auth {
        // Is the authorised user allowed to invite users into this room?
        let (auth_user_pl, invite_level) = if let Some(pl) = &power_levels_event {
            let invite = deserialize_power_levels_content_invite(pl.content().get(), rules)?.invite;
            let content = deserialize_power_levels_content_fields(pl.content().get(), rules)?;
            let user_pl = content
                .users
                .get(user_for_join_auth)
                .copied()
                .unwrap_or(content.users_default);
            (user_pl, invite)
        } else {
            (0, 0)
        };
        (user_for_join_auth_membership == &MembershipState::Join) && (auth_user_pl >= invite_level)
    } else {
        // No auth user was given.
        false
    };

    Ok(match target_membership {
        MembershipState::Join => {
            // If the only previous event is an m.room.create and the
            // state_key is the creator, allow.
            let prev_events = current_event.prev_events();
            let prev_event_is_only_create_event = prev_events.len() == 1
                && prev_events[0] == create_room.event_id();

            if prev_event_is_only_create_event {
                let is_creator = if rules.use_room_create_sender {
                    let creator = create_room.sender();
                    creator == sender && creator == target_user
                } else {
                    let creator = serde_json::from_str::<RoomCreateEventContent>(
                        create_room.content().get(),
                    )?
                    .creator
                    .ok_or_else(|| StateError::InvalidPdu("missing creator field".into()))?;
                    creator == *sender && creator == *target_user
                };

                if is_creator {
                    return Ok(None);
                }
            }

            if sender != target_user {
                // If the sender does not match state_key, reject.
                Some("cannot make another user join")
            } else if target_user_current_membership == MembershipState::Ban {
                // If the sender is banned, reject.
                Some("banned user cannot join")
            } else if (join_rule == JoinRule::Invite
                    || rules.knocking && join_rule == JoinRule::Knock)
                // If the join_rule is invite (or knock since v7) then allow
                // if membership state is invite or join.
                    && (target_user_current_membership == MembershipState::Join
                        || target_user_current_membership == MembershipState::Invite)
            {
                None
            } else if rules.restricted_join_rule && matches!(join_rule, JoinRule::Restricted(_))
                || rules.knock_restricted_join_rule
                    && matches!(join_rule, JoinRule::KnockRestricted(_))
            {
                // If the join_rule is restricted or knock_restricted
                if matches!(
                    target_user_current_membership,
                    MembershipState::Invite | MembershipState::Join
                ) {
                    // If membership state is join or invite, allow.
                    None
                } else if user_for_join_auth_is_valid {
                    // If the join_authorised_via_users_server key in content
                    // is a user with sufficient permission to invite other
                    // users, allow; otherwise reject.
                    None
                } else {
                    Some("not authorised by a user with sufficient permission to invite")
                }
            } else if join_rule != JoinRule::Public {
                // If the join_rule is public, allow; otherwise, reject.
                Some("room's join rule is not public")
            } else {
                None
            }
        }
        MembershipState::Invite => {
            // If content has a third_party_invite key
            if let Some(tp_id) = third_party_invite.and_then(|i| i.deserialize().ok()) {
                if target_user_current_membership == MembershipState::Ban {
                    Some("cannot invite banned user")
                } else if verify_third_party_invite(
                    Some(target_user),
                    sender,
                    &tp_id,
                    current_third_party_invite,
                ) {
                    None
                } else {
                    Some("third party invite invalid")
                }
            } else if !sender_is_joined
                || target_user_current_membership == MembershipState::Join
                || target_user_current_membership == MembershipState::Ban
            {
                Some(
                    "cannot invite user if sender is not joined or the user is currently \
                     joined or banned",
                )
            } else if sender_power
                .filter(|&p| p >= &power_levels.invite)
                .is_none()
            {
                Some("user does not have enough power to invite")
            } else {
                None
            }
        }
        MembershipState::Leave => {
            if sender == target_user {
                let membership_is_invite_or_join = matches!(
                    target_user_current_membership,
                    MembershipState::Join | MembershipState::Invite
                );
                let membership_is_knock = rules.knocking
                    && target_user_current_membership == MembershipState::Knock;
                if membership_is_invite_or_join || membership_is_knock {
                    None
                } else {
                    Some("cannot leave if not already invited, knocked, or joined")
                }
            } else if !sender_is_joined
                || target_user_current_membership == MembershipState::Ban
                    && sender_power.filter(|&p| p < &power_levels.ban).is_some()
            {
                Some("cannot kick if sender is not joined or the user is already banned")
            } else if sender_power.filter(|&p| p >= &power_levels.kick).is_none()
                || target_power >= sender_power
            {
                Some("user does not have enough power to kick")
            } else {
                None
            }
        }
        MembershipState::Ban => {
            if !sender_is_joined {
                Some("cannot ban user if sender is not joined")
            } else if sender_power.filter(|&p| p >= &power_levels.ban).is_none()
                || target_power >= sender_power
            {
                Some("user does not have enough power to ban")
            } else {
                None
            }
        }
        MembershipState::Knock if rules.knocking => {
            // If the join_rule is anything other than knock or
            // knock_restricted, reject.
            if !matches!(join_rule, JoinRule::KnockRestricted(_) | JoinRule::Knock) {
                Some("join rule is not set to knock or knock_restricted, knocking is not allowed")
            } else if matches!(join_rule, JoinRule::KnockRestricted(_))
                && !rules.knock_restricted_join_rule
            {
                Some(
                    "join rule is knock_restricted but the room version does not support \
                     knock_restricted",
                )
            } else if sender != target_user {
                Some("cannot knock for other users")
            } else if matches!(
                sender_membership,
                MembershipState::Ban | MembershipState::Invite | MembershipState::Join
            ) {
                Some("cannot knock while banned, invited or joined")
            } else {
                None
            }
        }
        _ => Some("unknown membership transition"),
    })
}

/// Is the user allowed to send a specific event based on the room's power
/// levels.
///
/// Also checks the event has the correct userId as its state_key if it's not
/// the "" state_key.
fn can_send_event(event: &impl Event, ple: Option<&impl Event>, user_level: i64) -> bool {
    let event_type_power_level = get_send_level(event.event_type(), event.state_key(), ple);

    if user_level < event_type_power_level {
        return false;
    }

    if event.state_key().is_some_and(|k| k.starts_with('@'))
        && event.state_key() != Some(event.sender().as_str())
    {
        return false; // permission required to post in this room
    }

    true
}

/// Confirm that the event sender has the required power levels to change
/// them.
fn check_power_levels(
    rules: &AuthorizationRules,
    power_event: &impl Event,
    previous_power_event: Option<&impl Event>,
    user_level: i64,
) -> Option<bool> {
    match power_event.state_key() {
        Some("") => {}
        Some(key) => {
            warn!("m.room.power_levels event has non-empty state key: {key}");
            return None;
        }
        None => {
            warn!("check_power_levels requires an m.room.power_levels state event");
            return None;
        }
    }

    // If any power-level field is present and not an integer (or, before
    // v10, a stringified integer), reject.
    let user_content = deserialize_power_levels(power_event.content().get(), rules)?;

    let current_state = match previous_power_event {
        Some(current_state) => current_state,
        // If there is no previous m.room.power_levels event in the room,
        // allow.
        None => return Some(true),
    };

    let current_content = deserialize_power_levels(current_state.content().get(), rules)?;

    let mut user_levels_to_check = BTreeSet::new();
    for user in current_content.users.keys().chain(user_content.users.keys()) {
        let user: &UserId = user;
        user_levels_to_check.insert(user);
    }

    let mut event_levels_to_check = BTreeSet::new();
    for ev_id in current_content.events.keys().chain(user_content.events.keys()) {
        event_levels_to_check.insert(ev_id);
    }

    let old_state = &current_content;
    let new_state = &user_content;

    for user in user_levels_to_check {
        let old_level = old_state.users.get(user);
        let new_level = new_state.users.get(user);
        if old_level.is_some() && new_level.is_some() && old_level == new_level {
            continue;
        }

        // If the current value is equal to the sender's current power level,
        // reject.
        if user != power_event.sender() && old_level == Some(&user_level) {
            warn!("m.room.power_levels cannot remove ops == to own");
            return Some(false);
        }

        // If the current or new value is higher than the sender's current
        // power level, reject.
        let old_level_too_big = old_level > Some(&user_level);
        let new_level_too_big = new_level > Some(&user_level);
        if old_level_too_big || new_level_too_big {
            warn!("m.room.power_levels failed to add ops > than own");
            return Some(false);
        }
    }

    for ev_type in event_levels_to_check {
        let old_level = old_state.events.get(ev_type);
        let new_level = new_state.events.get(ev_type);
        if old_level.is_some() && new_level.is_some() && old_level == new_level {
            continue;
        }

        let old_level_too_big = old_level > Some(&user_level);
        let new_level_too_big = new_level > Some(&user_level);
        if old_level_too_big || new_level_too_big {
            warn!("m.room.power_levels failed to add ops > than own");
            return Some(false);
        }
    }

    // Notifications, currently there is only @room.
    if rules.limit_notifications_power_levels {
        let old_level = old_state.notifications.room;
        let new_level = new_state.notifications.room;
        if old_level != new_level {
            let old_level_too_big = old_level > user_level;
            let new_level_too_big = new_level > user_level;
            if old_level_too_big || new_level_too_big {
                warn!("m.room.power_levels failed to add ops > than own");
                return Some(false);
            }
        }
    }

    let levels = [
        "users_default",
        "events_default",
        "state_default",
        "ban",
        "redact",
        "kick",
        "invite",
    ];
    let old_state = serde_json::to_value(old_state).ok()?;
    let new_state = serde_json::to_value(new_state).ok()?;
    for lvl_name in &levels {
        if let Some((old_lvl, new_lvl)) = get_deserialize_levels(&old_state, &new_state, lvl_name)
        {
            let old_level_too_big = old_lvl > user_level;
            let new_level_too_big = new_lvl > user_level;

            if old_level_too_big || new_level_too_big {
                warn!("cannot add ops > than own");
                return Some(false);
            }
        }
    }

    Some(true)
}

fn get_deserialize_levels(
    old: &serde_json::Value,
    new: &serde_json::Value,
    name: &str,
) -> Option<(i64, i64)> {
    Some((
        serde_json::from_value(old.get(name)?.clone()).ok()?,
        serde_json::from_value(new.get(name)?.clone()).ok()?,
    ))
}

/// Does the event redacting come from a user with enough power to redact
/// the given event.
fn check_redaction(
    redaction_event: &impl Event,
    user_level: i64,
    redact_level: i64,
) -> StateResult<bool> {
    if user_level >= redact_level {
        debug!("redaction allowed via power levels");
        return Ok(true);
    }

    // If the domain of the event_id of the event being redacted is the same
    // as the domain of the event_id of the m.room.redaction, allow.
    let redaction_server = v1_event_id_server(redaction_event.event_id().as_str());
    let redacted_server = redaction_event
        .redacts()
        .and_then(|id| v1_event_id_server(id.as_str()));
    if redaction_server.is_some() && redaction_server == redacted_server {
        debug!("redaction allowed via room version 1 rules");
        return Ok(true);
    }

    Ok(false)
}

fn v1_event_id_server(event_id: &str) -> Option<&str> {
    event_id.split_once(':').map(|(_, server)| server)
}

/// Whether any signature in the invite's `signed` block matches any public
/// key in the `m.room.third_party_invite` event.
fn verify_third_party_invite(
    target_user: Option<&UserId>,
    sender: &UserId,
    tp_id: &ThirdPartyInvite,
    current_third_party_invite: Option<&impl Event>,
) -> bool {
    // The state key must match the invitee.
    if target_user != Some(&tp_id.signed.mxid) {
        return false;
    }

    // If there is no m.room.third_party_invite event in the current room
    // state with state_key matching token, reject.
    let current_threepid = match current_third_party_invite {
        Some(id) => id,
        None => return false,
    };

    if current_threepid.state_key() != Some(&tp_id.signed.token) {
        return false;
    }

    if sender != current_threepid.sender() {
        return false;
    }

    let tpid_ev = match serde_json::from_str::<RoomThirdPartyInviteEventContent>(
        current_threepid.content().get(),
    ) {
        Ok(ev) => ev,
        Err(_) => return false,
    };

    let decoded_invite_token = match Base64::parse(&tp_id.signed.token) {
        Ok(tok) => tok,
        Err(_) => return false,
    };

    // Any public key of the third-party invite event may match.
    tpid_ev
        .all_public_keys()
        .into_iter()
        .any(|key| *key == decoded_invite_token)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use serde_json::{json, value::to_raw_value as to_raw_json_value};

    use super::auth_check;
    use crate::events::{StateEventType, TimelineEventType};
    use crate::room_version::AuthorizationRules;
    use crate::state::test_utils::{
        alice, bob, charlie, member_content_ban, member_content_join, to_pdu_event, StateEvent,
        INITIAL_EVENTS,
    };
    use crate::state::StateMap;
    use crate::OwnedEventId;

    fn auth_state(
        events: &HashMap<OwnedEventId, Arc<StateEvent>>,
    ) -> StateMap<Arc<StateEvent>> {
        events
            .values()
            .filter_map(|ev| {
                let state_key = ev.state_key.clone()?;
                Some((
                    (StateEventType::from(ev.event_type.as_str()), state_key),
                    Arc::clone(ev),
                ))
            })
            .collect()
    }

    #[test]
    fn ban_with_power_passes() {
        let events = INITIAL_EVENTS();
        let state = auth_state(&events);

        let ban = to_pdu_event(
            "BAN",
            alice(),
            TimelineEventType::RoomMember,
            Some(charlie().as_str()),
            member_content_ban(),
            &["CREATE", "IMA", "IPOWER", "IMC"],
            &["IMC"],
        );

        auth_check(
            &AuthorizationRules::V6,
            &ban,
            None::<&Arc<StateEvent>>,
            |ty, key| state.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .unwrap();
    }

    #[test]
    fn ban_without_power_fails() {
        let events = INITIAL_EVENTS();
        let state = auth_state(&events);

        let ban = to_pdu_event(
            "BAN",
            charlie(),
            TimelineEventType::RoomMember,
            Some(alice().as_str()),
            member_content_ban(),
            &["CREATE", "IMA", "IPOWER", "IMC"],
            &["IMC"],
        );

        auth_check(
            &AuthorizationRules::V6,
            &ban,
            None::<&Arc<StateEvent>>,
            |ty, key| state.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .unwrap_err();
    }

    #[test]
    fn creator_may_join_fresh_room() {
        let events = INITIAL_EVENTS();
        let create = events.values().find(|ev| ev.event_type == TimelineEventType::RoomCreate).unwrap();
        let state: StateMap<Arc<StateEvent>> = [(
            (StateEventType::RoomCreate, String::new()),
            Arc::clone(create),
        )]
        .into();

        let join = to_pdu_event(
            "JOIN",
            alice(),
            TimelineEventType::RoomMember,
            Some(alice().as_str()),
            member_content_join(),
            &["CREATE"],
            &["CREATE"],
        );

        auth_check(
            &AuthorizationRules::V6,
            &join,
            None::<&Arc<StateEvent>>,
            |ty, key| state.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .unwrap();

        // Someone else cannot short-circuit through the creator rule.
        let not_creator = to_pdu_event(
            "JOIN2",
            bob(),
            TimelineEventType::RoomMember,
            Some(bob().as_str()),
            member_content_join(),
            &["CREATE"],
            &["CREATE"],
        );
        auth_check(
            &AuthorizationRules::V6,
            &not_creator,
            None::<&Arc<StateEvent>>,
            |ty, key| state.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .unwrap_err();
    }

    #[test]
    fn power_levels_may_not_exceed_own() {
        let events = INITIAL_EVENTS();
        let state = auth_state(&events);

        // Bob (default power 0) tries to crown himself.
        let grab = to_pdu_event(
            "GRAB",
            bob(),
            TimelineEventType::RoomPowerLevels,
            Some(""),
            to_raw_json_value(&json!({ "users": { bob().as_str(): 100 } })).unwrap(),
            &["CREATE", "IMB", "IPOWER"],
            &["IMB"],
        );
        auth_check(
            &AuthorizationRules::V6,
            &grab,
            None::<&Arc<StateEvent>>,
            |ty, key| state.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .unwrap_err();

        // Alice (100) granting bob 50 is fine.
        let grant = to_pdu_event(
            "GRANT",
            alice(),
            TimelineEventType::RoomPowerLevels,
            Some(""),
            to_raw_json_value(
                &json!({ "users": { alice().as_str(): 100, bob().as_str(): 50 } }),
            )
            .unwrap(),
            &["CREATE", "IMA", "IPOWER"],
            &["IMA"],
        );
        auth_check(
            &AuthorizationRules::V6,
            &grant,
            None::<&Arc<StateEvent>>,
            |ty, key| state.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .unwrap();
    }

    #[test]
    fn sender_must_be_joined_to_speak() {
        let events = INITIAL_EVENTS();
        let mut state = auth_state(&events);
        // Forget charlie's membership.
        state.remove(&(StateEventType::RoomMember, charlie().as_str().to_owned()));

        let message = to_pdu_event(
            "MSG",
            charlie(),
            TimelineEventType::RoomMessage,
            None,
            to_raw_json_value(&json!({ "body": "hello" })).unwrap(),
            &["CREATE", "IMC", "IPOWER"],
            &["IMC"],
        );
        auth_check(
            &AuthorizationRules::V6,
            &message,
            None::<&Arc<StateEvent>>,
            |ty, key| state.get(&(ty.clone(), key.to_owned())).cloned(),
        )
        .unwrap_err();
    }
}
