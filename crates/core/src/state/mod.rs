//! State resolution and event authorization.
//!
//! Rooms are replicated DAGs; when the DAG forks, every server must
//! converge on the same view of room state. [`resolve`] implements the
//! deterministic reconciliation across forks, parameterized by room
//! version, and [`event_auth`] holds the authorization predicate it
//! iterates with.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;

mod error;
pub mod event_auth;
mod power_levels;
#[cfg(test)]
pub(crate) mod test_utils;

pub use self::error::{StateError, StateResult};
pub use self::event_auth::{auth_check, auth_types_for_event};
use crate::events::room::member::MembershipState;
use crate::events::{StateEventType, TimelineEventType};
use crate::room_version::{
    AuthorizationRules, RoomVersionRules, StateResolutionVersion,
};
use crate::serde::RawJsonValue;
use crate::{EventId, OwnedEventId, RoomId, UnixMillis, UserId};

/// A mapping of `(event type, state key)` to some value `T`, usually an
/// event ID.
pub type StateMap<T> = HashMap<(StateEventType, String), T>;

/// Abstraction of a PDU, allowing the resolver to run against any backing
/// representation.
///
/// Events reference their parents by ID only; traversal happens through a
/// fetch closure over a flat index, never through pointers.
pub trait Event {
    /// The `event_id` of this event.
    fn event_id(&self) -> &EventId;

    /// The `room_id` of this event.
    fn room_id(&self) -> &RoomId;

    /// The `sender` of this event.
    fn sender(&self) -> &UserId;

    /// The `type` of this event.
    fn event_type(&self) -> &TimelineEventType;

    /// The `content` of this event.
    fn content(&self) -> &RawJsonValue;

    /// The server timestamp of this event.
    fn origin_server_ts(&self) -> UnixMillis;

    /// The `state_key` of this event, if it is a state event.
    fn state_key(&self) -> Option<&str>;

    /// The events before this event in the room's timeline.
    fn prev_events(&self) -> &[OwnedEventId];

    /// The events that authorize this event.
    fn auth_events(&self) -> &[OwnedEventId];

    /// The event that this event redacts, if any.
    fn redacts(&self) -> Option<&EventId>;
}

impl<E: Event> Event for Arc<E> {
    fn event_id(&self) -> &EventId {
        (**self).event_id()
    }

    fn room_id(&self) -> &RoomId {
        (**self).room_id()
    }

    fn sender(&self) -> &UserId {
        (**self).sender()
    }

    fn event_type(&self) -> &TimelineEventType {
        (**self).event_type()
    }

    fn content(&self) -> &RawJsonValue {
        (**self).content()
    }

    fn origin_server_ts(&self) -> UnixMillis {
        (**self).origin_server_ts()
    }

    fn state_key(&self) -> Option<&str> {
        (**self).state_key()
    }

    fn prev_events(&self) -> &[OwnedEventId] {
        (**self).prev_events()
    }

    fn auth_events(&self) -> &[OwnedEventId] {
        (**self).auth_events()
    }

    fn redacts(&self) -> Option<&EventId> {
        (**self).redacts()
    }
}

/// Resolve the state across a set of forks into one state map.
///
/// `fork_states` holds one state map per fork; `auth_chain_sets` the event
/// IDs of the full auth chain of each fork, index-aligned. `fetch_event`
/// resolves an event ID against the caller's store; events it cannot
/// produce are left out of the resolution.
///
/// The output is deterministic: every ordering stage tie-breaks on
/// `event_id`, so any two honest callers with the same DAG view converge.
pub fn resolve<E, F>(
    rules: &RoomVersionRules,
    fork_states: &[StateMap<OwnedEventId>],
    auth_chain_sets: &[HashSet<OwnedEventId>],
    fetch_event: &F,
) -> StateResult<StateMap<OwnedEventId>>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    match rules.state_res {
        StateResolutionVersion::V1 => resolve_v1(fork_states, fetch_event),
        StateResolutionVersion::V2(v2_rules) => {
            resolve_v2(rules, v2_rules.state_reset_reduction, fork_states, auth_chain_sets, fetch_event)
        }
    }
}

/// The original resolution algorithm of room version 1: per conflicted
/// slot, the latest event by `(origin_server_ts, event_id)` wins.
fn resolve_v1<E, F>(
    fork_states: &[StateMap<OwnedEventId>],
    fetch_event: &F,
) -> StateResult<StateMap<OwnedEventId>>
where
    E: Event,
    F: Fn(&EventId) -> Option<E>,
{
    let (clean, conflicted) = separate(fork_states);

    let mut resolved = StateMap::new();
    for (key, candidates) in conflicted {
        let winner = candidates
            .into_iter()
            .filter_map(|id| {
                let event = fetch_event(&id)?;
                Some((event.origin_server_ts(), id))
            })
            .max();
        if let Some((_, id)) = winner {
            resolved.insert(key, id);
        }
    }

    resolved.extend(clean);
    Ok(resolved)
}

/// The second resolution algorithm, room version 2 onwards.
fn resolve_v2<E, F>(
    rules: &RoomVersionRules,
    state_reset_reduction: bool,
    fork_states: &[StateMap<OwnedEventId>],
    auth_chain_sets: &[HashSet<OwnedEventId>],
    fetch_event: &F,
) -> StateResult<StateMap<OwnedEventId>>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    debug!("started state resolution over {} fork states", fork_states.len());

    // 1. Partition into unconflicted and conflicted state.
    let (clean, mut conflicted) = separate(fork_states);
    if conflicted.is_empty() {
        return Ok(clean);
    }

    // Room v12: drop structurally discontinuous candidates before any
    // ordering happens. The survivors still run through the standard
    // ordering and auth below.
    if state_reset_reduction {
        reduce_state_resets(&mut conflicted, fetch_event);
    }

    // 2. The auth-chain difference: events in some fork's auth chain but
    //    not all of them.
    let auth_diff = auth_chain_difference(auth_chain_sets);

    // The full conflicted set is the union of the conflicted state and the
    // auth difference, restricted to events we can actually fetch.
    let all_conflicted: BTreeSet<OwnedEventId> = conflicted
        .values()
        .flat_map(|ids| ids.iter().cloned())
        .chain(auth_diff)
        .filter(|id| fetch_event(id).is_some())
        .collect();

    trace!(count = all_conflicted.len(), "full conflicted set");

    // 3. Split out the control events (power levels, join rules, and the
    //    kicks/bans among membership events).
    let control_events: Vec<OwnedEventId> = all_conflicted
        .iter()
        .filter(|id| {
            fetch_event(id).is_some_and(|event| is_power_event(&event))
        })
        .cloned()
        .collect();

    // 4. Reverse topological power ordering of the control events.
    let sorted_control =
        reverse_topological_power_sort(control_events, &all_conflicted, rules, fetch_event)?;

    // 5. Iteratively apply each control event on top of the unconflicted
    //    state, dropping the ones that fail auth.
    let resolved_control =
        iterative_auth_check(&rules.authorization, &sorted_control, clean.clone(), fetch_event)?;

    // 6. Mainline ordering of what is left, then the same iterative auth.
    let events_to_resolve: Vec<OwnedEventId> = all_conflicted
        .iter()
        .filter(|id| !sorted_control.contains(id))
        .cloned()
        .collect();

    let power_event = resolved_control
        .get(&(StateEventType::RoomPowerLevels, String::new()))
        .cloned();
    let sorted_rest = mainline_sort(&events_to_resolve, power_event, fetch_event)?;
    let mut resolved =
        iterative_auth_check(&rules.authorization, &sorted_rest, resolved_control, fetch_event)?;

    // 7. The unconflicted state overlays the result.
    resolved.extend(clean);
    Ok(resolved)
}

/// Split the forks' state maps into the entries every fork agrees on and
/// the entries they do not.
///
/// A slot missing from one fork but present in another counts as
/// conflicted.
fn separate(
    fork_states: &[StateMap<OwnedEventId>],
) -> (StateMap<OwnedEventId>, StateMap<BTreeSet<OwnedEventId>>) {
    let all_keys: BTreeSet<&(StateEventType, String)> =
        fork_states.iter().flat_map(|state| state.keys()).collect();

    let mut unconflicted = StateMap::new();
    let mut conflicted: StateMap<BTreeSet<OwnedEventId>> = StateMap::new();

    for key in all_keys {
        let values: Vec<Option<&OwnedEventId>> =
            fork_states.iter().map(|state| state.get(key)).collect();
        let distinct: HashSet<_> = values.iter().collect();

        if distinct.len() == 1 {
            if let Some(Some(id)) = values.first() {
                unconflicted.insert(key.clone(), (*id).clone());
            }
        } else {
            conflicted.insert(
                key.clone(),
                values.into_iter().flatten().cloned().collect(),
            );
        }
    }

    (unconflicted, conflicted)
}

/// Events appearing in some forks' auth chains but not all of them.
fn auth_chain_difference(auth_chain_sets: &[HashSet<OwnedEventId>]) -> BTreeSet<OwnedEventId> {
    let Some(first) = auth_chain_sets.first() else {
        return BTreeSet::new();
    };

    let common: HashSet<&OwnedEventId> = first
        .iter()
        .filter(|id| auth_chain_sets[1..].iter().all(|set| set.contains(*id)))
        .collect();

    auth_chain_sets
        .iter()
        .flatten()
        .filter(|id| !common.contains(id))
        .cloned()
        .collect()
}

/// Whether the event steers authorization: power levels and join rules, or
/// a kick/ban.
fn is_power_event(event: &impl Event) -> bool {
    match event.event_type() {
        TimelineEventType::RoomPowerLevels | TimelineEventType::RoomJoinRules => {
            event.state_key() == Some("")
        }
        TimelineEventType::RoomMember => {
            #[derive(Deserialize)]
            struct GetMembership {
                membership: MembershipState,
            }

            if let Ok(content) =
                serde_json::from_str::<GetMembership>(event.content().get())
            {
                if matches!(
                    content.membership,
                    MembershipState::Leave | MembershipState::Ban
                ) {
                    return Some(event.sender().as_str()) != event.state_key();
                }
            }

            false
        }
        _ => false,
    }
}

/// Order control events by reverse topological power ordering: auth
/// ancestors first, ties broken by descending sender power level, then
/// ascending timestamp, then ascending event ID.
fn reverse_topological_power_sort<E, F>(
    events: Vec<OwnedEventId>,
    all_conflicted: &BTreeSet<OwnedEventId>,
    rules: &RoomVersionRules,
    fetch_event: &F,
) -> StateResult<Vec<OwnedEventId>>
where
    E: Event,
    F: Fn(&EventId) -> Option<E>,
{
    let mut graph: HashMap<OwnedEventId, BTreeSet<OwnedEventId>> = HashMap::new();
    for event_id in events {
        add_event_and_auth_chain_to_graph(&mut graph, event_id, all_conflicted, fetch_event);
    }

    let mut event_to_power: HashMap<OwnedEventId, i64> = HashMap::new();
    for event_id in graph.keys() {
        let power = power_level_for_sender(event_id, &rules.authorization, fetch_event)?;
        event_to_power.insert(event_id.clone(), power);
    }

    lexicographical_topological_sort(&graph, &|event_id| {
        let event = fetch_event(event_id);
        let power = event_to_power.get(event_id).copied().unwrap_or_default();
        let ts = event
            .map(|e| e.origin_server_ts())
            .unwrap_or(UnixMillis(0));
        (Reverse(power), ts, event_id.to_owned())
    })
}

/// Adds the given event and the part of its auth chain that lies within the
/// conflicted set to the graph, keyed by event with its auth parents as
/// values.
fn add_event_and_auth_chain_to_graph<E, F>(
    graph: &mut HashMap<OwnedEventId, BTreeSet<OwnedEventId>>,
    event_id: OwnedEventId,
    all_conflicted: &BTreeSet<OwnedEventId>,
    fetch_event: &F,
) where
    E: Event,
    F: Fn(&EventId) -> Option<E>,
{
    let mut todo = vec![event_id];

    while let Some(event_id) = todo.pop() {
        if graph.contains_key(&event_id) {
            continue;
        }
        let auth_events: Vec<OwnedEventId> = fetch_event(&event_id)
            .map(|event| {
                event
                    .auth_events()
                    .iter()
                    .filter(|aid| all_conflicted.contains(*aid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        graph.insert(event_id, auth_events.iter().cloned().collect());
        todo.extend(auth_events);
    }
}

/// Kahn's algorithm over the auth graph with a lexicographic tie-break.
///
/// The graph maps each event to its auth parents; parents are emitted
/// before their children, ties resolved by the smallest key.
fn lexicographical_topological_sort<K, F>(
    graph: &HashMap<OwnedEventId, BTreeSet<OwnedEventId>>,
    key_fn: &F,
) -> StateResult<Vec<OwnedEventId>>
where
    K: Ord,
    F: Fn(&EventId) -> K,
{
    // Number of unemitted parents per node, and the children watching each
    // node.
    let mut pending_parents: HashMap<&OwnedEventId, usize> = HashMap::new();
    let mut children: HashMap<&OwnedEventId, Vec<&OwnedEventId>> = HashMap::new();

    for (node, parents) in graph {
        pending_parents.entry(node).or_insert(0);
        for parent in parents {
            if graph.contains_key(parent) {
                *pending_parents.entry(node).or_insert(0) += 1;
                children.entry(parent).or_default().push(node);
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<(K, &OwnedEventId)>> = pending_parents
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| Reverse((key_fn(node), *node)))
        .collect();

    let mut sorted = Vec::with_capacity(graph.len());
    while let Some(Reverse((_, node))) = ready.pop() {
        sorted.push(node.clone());

        for child in children.remove(node).unwrap_or_default() {
            let count = pending_parents
                .get_mut(child)
                .expect("every child has a pending count");
            *count -= 1;
            if *count == 0 {
                ready.push(Reverse((key_fn(child), child)));
            }
        }
    }

    if sorted.len() != graph.len() {
        // Content addressing makes real cycles impossible; this means the
        // graph handed in was malformed.
        return Err(StateError::other("auth graph contains a cycle"));
    }

    Ok(sorted)
}

/// The power level of the event's sender, looked up through the event's own
/// auth events.
fn power_level_for_sender<E, F>(
    event_id: &EventId,
    rules: &AuthorizationRules,
    fetch_event: &F,
) -> StateResult<i64>
where
    E: Event,
    F: Fn(&EventId) -> Option<E>,
{
    let event = fetch_event(event_id);
    let mut room_create_event = None;
    let mut power_levels_event = None;

    for aid in event.as_ref().map(|e| e.auth_events()).unwrap_or_default() {
        if let Some(auth_event) = fetch_event(aid) {
            match auth_event.event_type() {
                TimelineEventType::RoomPowerLevels
                    if auth_event.state_key() == Some("") =>
                {
                    power_levels_event = Some(auth_event);
                }
                TimelineEventType::RoomCreate if auth_event.state_key() == Some("") => {
                    room_create_event = Some(auth_event);
                }
                _ => {}
            }
        }
    }

    let Some(event) = event else {
        return Ok(0);
    };

    if let Some(power_levels) = power_levels_event {
        let content = power_levels::deserialize_power_levels_content_fields(
            power_levels.content().get(),
            rules,
        )?;
        Ok(content
            .users
            .get(event.sender())
            .copied()
            .unwrap_or(content.users_default))
    } else {
        // No power levels yet: the creator holds 100, everyone else 0.
        let is_creator = if let Some(create) = room_create_event {
            if rules.use_room_create_sender {
                create.sender() == event.sender()
            } else {
                #[derive(Deserialize)]
                struct GetCreator {
                    creator: Option<crate::OwnedUserId>,
                }
                serde_json::from_str::<GetCreator>(create.content().get())
                    .ok()
                    .and_then(|c| c.creator)
                    .is_some_and(|creator| creator == *event.sender())
            }
        } else {
            false
        };
        Ok(if is_creator { 100 } else { 0 })
    }
}

/// Applies the given events in order on top of `base_state`, keeping each
/// one only if it passes auth against the accumulated state.
fn iterative_auth_check<E, F>(
    rules: &AuthorizationRules,
    events: &[OwnedEventId],
    base_state: StateMap<OwnedEventId>,
    fetch_event: &F,
) -> StateResult<StateMap<OwnedEventId>>
where
    E: Event + Clone,
    F: Fn(&EventId) -> Option<E>,
{
    let mut resolved = base_state;

    for event_id in events {
        let Some(event) = fetch_event(event_id) else {
            return Err(StateError::not_found(format!(
                "event {event_id} disappeared during resolution"
            )));
        };

        let mut auth_state: StateMap<E> = StateMap::new();
        for aid in event.auth_events() {
            if let Some(auth_event) = fetch_event(aid) {
                if let Some(state_key) = auth_event.state_key() {
                    auth_state.insert(
                        (auth_event.event_type().into(), state_key.to_owned()),
                        auth_event,
                    );
                }
            } else {
                warn!(%aid, "auth event not found while resolving");
            }
        }

        // State the resolution already settled on overrides what the event
        // declared for itself.
        let auth_types = auth_types_for_event(
            event.event_type(),
            event.sender(),
            event.state_key(),
            event.content(),
        )?;
        for key in auth_types {
            if let Some(id) = resolved.get(&key) {
                if let Some(resolved_event) = fetch_event(id) {
                    auth_state.insert(key, resolved_event);
                }
            }
        }

        let current_third_party_invite = third_party_invite_token(&event)
            .and_then(|token| {
                auth_state
                    .get(&(StateEventType::RoomThirdPartyInvite, token))
                    .cloned()
            });

        let fetch_state = |ty: &StateEventType, key: &str| {
            auth_state.get(&(ty.clone(), key.to_owned())).cloned()
        };

        match auth_check(rules, &event, current_third_party_invite.as_ref(), fetch_state) {
            Ok(()) => {
                if let Some(state_key) = event.state_key() {
                    resolved.insert(
                        (event.event_type().into(), state_key.to_owned()),
                        event_id.clone(),
                    );
                }
            }
            Err(reason) => {
                debug!(%event_id, %reason, "event failed the iterative auth check");
            }
        }
    }

    Ok(resolved)
}

fn third_party_invite_token(event: &impl Event) -> Option<String> {
    #[derive(Deserialize)]
    struct GetToken {
        third_party_invite: Option<TokenContainer>,
    }

    #[derive(Deserialize)]
    struct TokenContainer {
        signed: TokenSigned,
    }

    #[derive(Deserialize)]
    struct TokenSigned {
        token: String,
    }

    if *event.event_type() != TimelineEventType::RoomMember {
        return None;
    }
    serde_json::from_str::<GetToken>(event.content().get())
        .ok()?
        .third_party_invite
        .map(|tpi| tpi.signed.token)
}

/// Orders the remaining conflicted events along the mainline of the
/// resolved power-levels event, then by timestamp, then by event ID.
fn mainline_sort<E, F>(
    events: &[OwnedEventId],
    power_event: Option<OwnedEventId>,
    fetch_event: &F,
) -> StateResult<Vec<OwnedEventId>>
where
    E: Event,
    F: Fn(&EventId) -> Option<E>,
{
    if events.is_empty() {
        return Ok(Vec::new());
    }

    // Walk the chain of power-levels events backwards from the resolved
    // one.
    let mut mainline = Vec::new();
    let mut current = power_event;
    while let Some(power_event_id) = current {
        mainline.push(power_event_id.clone());
        current = fetch_event(&power_event_id).and_then(|event| {
            event
                .auth_events()
                .iter()
                .find(|aid| {
                    fetch_event(aid).is_some_and(|auth_event| {
                        *auth_event.event_type() == TimelineEventType::RoomPowerLevels
                            && auth_event.state_key() == Some("")
                    })
                })
                .cloned()
        });
    }

    // Oldest mainline entry gets depth 0.
    let mainline_depths: HashMap<OwnedEventId, usize> = mainline
        .into_iter()
        .rev()
        .enumerate()
        .map(|(depth, id)| (id, depth))
        .collect();

    let mut order: Vec<(usize, UnixMillis, OwnedEventId)> = Vec::with_capacity(events.len());
    for event_id in events {
        let Some(event) = fetch_event(event_id) else {
            continue;
        };
        let depth = mainline_depth(&event, &mainline_depths, fetch_event);
        order.push((depth, event.origin_server_ts(), event_id.clone()));
    }

    order.sort();
    Ok(order.into_iter().map(|(_, _, id)| id).collect())
}

/// The mainline depth of the closest power-levels ancestor of the event.
fn mainline_depth<E, F>(
    event: &E,
    mainline_depths: &HashMap<OwnedEventId, usize>,
    fetch_event: &F,
) -> usize
where
    E: Event,
    F: Fn(&EventId) -> Option<E>,
{
    let mut current = Some(event.event_id().to_owned());

    while let Some(event_id) = current {
        if let Some(depth) = mainline_depths.get(&event_id) {
            return *depth;
        }

        current = fetch_event(&event_id).and_then(|event| {
            event
                .auth_events()
                .iter()
                .find(|aid| {
                    fetch_event(aid).is_some_and(|auth_event| {
                        *auth_event.event_type() == TimelineEventType::RoomPowerLevels
                            && auth_event.state_key() == Some("")
                    })
                })
                .cloned()
        });
    }

    0
}

/// The room v12 state-reset reduction.
///
/// When several events compete for one slot, each candidate is compared to
/// the predecessor it declares for that same slot in its own auth events.
/// If exactly one candidate retains structural continuity, the others are
/// dropped before the standard ordering runs.
fn reduce_state_resets<E, F>(
    conflicted: &mut StateMap<BTreeSet<OwnedEventId>>,
    fetch_event: &F,
) where
    E: Event,
    F: Fn(&EventId) -> Option<E>,
{
    for ((event_type, state_key), candidates) in conflicted.iter_mut() {
        if candidates.len() < 2 {
            continue;
        }

        let scores: Vec<(u32, OwnedEventId)> = candidates
            .iter()
            .map(|id| {
                let score = fetch_event(id)
                    .and_then(|event| {
                        let predecessor =
                            slot_predecessor(&event, event_type, state_key, fetch_event)?;
                        Some(continuity_score(
                            event_type,
                            predecessor.content(),
                            event.content(),
                        ))
                    })
                    .unwrap_or(0);
                (score, id.clone())
            })
            .collect();

        let max = scores.iter().map(|(s, _)| *s).max().unwrap_or(0);
        if max == 0 {
            continue;
        }
        let best: Vec<&OwnedEventId> = scores
            .iter()
            .filter(|(s, _)| *s == max)
            .map(|(_, id)| id)
            .collect();
        if best.len() == 1 {
            let keep = best[0].clone();
            trace!(%keep, "state-reset reduction kept a single continuous candidate");
            candidates.retain(|id| *id == keep);
        }
    }
}

/// The event occupying the same state slot in the candidate's own auth
/// events.
fn slot_predecessor<E, F>(
    event: &E,
    event_type: &StateEventType,
    state_key: &str,
    fetch_event: &F,
) -> Option<E>
where
    E: Event,
    F: Fn(&EventId) -> Option<E>,
{
    event.auth_events().iter().find_map(|aid| {
        let auth_event = fetch_event(aid)?;
        (StateEventType::from(auth_event.event_type()) == *event_type
            && auth_event.state_key() == Some(state_key))
        .then_some(auth_event)
    })
}

/// How similar a candidate's content is to its predecessor's, per slot
/// type. Higher means more continuous.
fn continuity_score(
    event_type: &StateEventType,
    old_content: &RawJsonValue,
    new_content: &RawJsonValue,
) -> u32 {
    match event_type {
        StateEventType::RoomPowerLevels => power_levels_continuity(old_content, new_content),
        StateEventType::RoomJoinRules => join_rules_continuity(old_content, new_content),
        _ => content_key_continuity(old_content, new_content),
    }
}

/// The number of `(user, level)` entries the new power levels preserve from
/// the old ones.
fn power_levels_continuity(old_content: &RawJsonValue, new_content: &RawJsonValue) -> u32 {
    #[derive(Deserialize, Default)]
    struct GetUsers {
        #[serde(default)]
        users: std::collections::BTreeMap<crate::OwnedUserId, i64>,
    }

    let old: GetUsers = serde_json::from_str(old_content.get()).unwrap_or_default();
    let new: GetUsers = serde_json::from_str(new_content.get()).unwrap_or_default();

    old.users
        .iter()
        .filter(|(user, level)| new.users.get(*user) == Some(*level))
        .count() as u32
}

/// One when the join rule is unchanged, zero otherwise.
fn join_rules_continuity(old_content: &RawJsonValue, new_content: &RawJsonValue) -> u32 {
    #[derive(Deserialize)]
    struct GetJoinRule {
        join_rule: Option<String>,
    }

    let old: Option<GetJoinRule> = serde_json::from_str(old_content.get()).ok();
    let new: Option<GetJoinRule> = serde_json::from_str(new_content.get()).ok();

    match (old, new) {
        (Some(old), Some(new)) if old.join_rule.is_some() && old.join_rule == new.join_rule => 1,
        _ => 0,
    }
}

/// The number of top-level content keys with unchanged values.
fn content_key_continuity(old_content: &RawJsonValue, new_content: &RawJsonValue) -> u32 {
    use serde_json::Value as JsonValue;

    let old: Option<serde_json::Map<String, JsonValue>> =
        serde_json::from_str(old_content.get()).ok();
    let new: Option<serde_json::Map<String, JsonValue>> =
        serde_json::from_str(new_content.get()).ok();

    match (old, new) {
        (Some(old), Some(new)) => old
            .iter()
            .filter(|(key, value)| new.get(key.as_str()) == Some(*value))
            .count() as u32,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use serde_json::{json, value::to_raw_value as to_raw_json_value};

    use super::test_utils::{
        alice, auth_chain_for, bob, event_id, initial_state, member_content_ban, to_pdu_event,
        StateEvent, INITIAL_EVENTS,
    };
    use super::{resolve, Event, StateMap};
    use crate::events::{StateEventType, TimelineEventType};
    use crate::room_version::RoomVersionRules;
    use crate::OwnedEventId;

    type TestMap = HashMap<OwnedEventId, Arc<StateEvent>>;

    fn fetcher(events: &TestMap) -> impl Fn(&crate::EventId) -> Option<Arc<StateEvent>> + '_ {
        |id| events.get(id).cloned()
    }

    fn resolve_forks(
        rules: &RoomVersionRules,
        events: &TestMap,
        forks: &[StateMap<OwnedEventId>],
    ) -> StateMap<OwnedEventId> {
        let auth_chain_sets: Vec<HashSet<OwnedEventId>> = forks
            .iter()
            .map(|fork| {
                auth_chain_for(events, &fork.values().cloned().collect::<Vec<_>>())
            })
            .collect();
        resolve(rules, forks, &auth_chain_sets, &fetcher(events)).unwrap()
    }

    /// Two forks name the room differently. The fork whose sender lacks the
    /// power to set `m.room.name` loses, regardless of timestamps.
    #[test]
    fn name_conflict_resolved_by_sender_power() {
        let mut events = INITIAL_EVENTS();

        // Power levels granting bob 100 and requiring 75 for m.room.name;
        // alice keeps 50 here so her later event cannot pass.
        let power = to_pdu_event(
            "PA",
            alice(),
            TimelineEventType::RoomPowerLevels,
            Some(""),
            to_raw_json_value(&json!({
                "users": { alice().as_str(): 50, bob().as_str(): 100 },
                "events": { "m.room.name": 75 }
            }))
            .unwrap(),
            &["CREATE", "IMA", "IPOWER"],
            &["IPOWER"],
        );
        events.insert(power.event_id.clone(), power.clone());

        let name_b = to_pdu_event(
            "NB",
            bob(),
            TimelineEventType::RoomName,
            Some(""),
            to_raw_json_value(&json!({ "name": "B" })).unwrap(),
            &["CREATE", "IMB", "PA"],
            &["PA"],
        );
        events.insert(name_b.event_id.clone(), name_b.clone());

        // Alice's event carries a later timestamp than bob's.
        let name_a = to_pdu_event(
            "NA",
            alice(),
            TimelineEventType::RoomName,
            Some(""),
            to_raw_json_value(&json!({ "name": "A" })).unwrap(),
            &["CREATE", "IMA", "PA"],
            &["PA"],
        );
        events.insert(name_a.event_id.clone(), name_a.clone());
        assert!(name_a.origin_server_ts > name_b.origin_server_ts);

        let mut base = initial_state(&events);
        base.remove(&(StateEventType::RoomName, String::new()));
        base.insert(
            (StateEventType::RoomPowerLevels, String::new()),
            power.event_id.clone(),
        );
        // Keep only the initial events plus the power event in the base.
        base.retain(|_, id| {
            !["NA", "NB"].iter().any(|name| *id == event_id(name))
        });

        let mut fork_a = base.clone();
        fork_a.insert(
            (StateEventType::RoomName, String::new()),
            name_a.event_id.clone(),
        );
        let mut fork_b = base.clone();
        fork_b.insert(
            (StateEventType::RoomName, String::new()),
            name_b.event_id.clone(),
        );

        let resolved = resolve_forks(&RoomVersionRules::V6, &events, &[fork_a, fork_b]);
        assert_eq!(
            resolved[&(StateEventType::RoomName, String::new())],
            name_b.event_id,
            "the higher-powered sender's name must win"
        );
    }

    /// Reordering the fork inputs must not change the result.
    #[test]
    fn resolution_is_input_order_independent() {
        let mut events = INITIAL_EVENTS();

        let ban = to_pdu_event(
            "BAN",
            alice(),
            TimelineEventType::RoomMember,
            Some(bob().as_str()),
            member_content_ban(),
            &["CREATE", "IMA", "IPOWER", "IMB"],
            &["IMC"],
        );
        events.insert(ban.event_id.clone(), ban.clone());

        let base = initial_state(&events);
        let mut fork_ban = base.clone();
        fork_ban.insert(
            (StateEventType::RoomMember, bob().as_str().to_owned()),
            ban.event_id.clone(),
        );

        let forward = resolve_forks(
            &RoomVersionRules::V6,
            &events,
            &[base.clone(), fork_ban.clone()],
        );
        let backward = resolve_forks(&RoomVersionRules::V6, &events, &[fork_ban, base]);

        assert_eq!(forward, backward);
        assert_eq!(
            forward[&(StateEventType::RoomMember, bob().as_str().to_owned())],
            ban.event_id,
            "the ban is newer in the auth chain and must survive"
        );
    }

    /// Room v1 rooms fall back to latest-timestamp-wins per slot.
    #[test]
    fn v1_latest_timestamp_wins() {
        let mut events = INITIAL_EVENTS();

        let topic_1 = to_pdu_event(
            "T1",
            alice(),
            TimelineEventType::RoomTopic,
            Some(""),
            to_raw_json_value(&json!({ "topic": "first" })).unwrap(),
            &["CREATE", "IMA", "IPOWER"],
            &["IJR"],
        );
        let topic_2 = to_pdu_event(
            "T2",
            alice(),
            TimelineEventType::RoomTopic,
            Some(""),
            to_raw_json_value(&json!({ "topic": "second" })).unwrap(),
            &["CREATE", "IMA", "IPOWER"],
            &["IJR"],
        );
        events.insert(topic_1.event_id.clone(), topic_1.clone());
        events.insert(topic_2.event_id.clone(), topic_2.clone());
        assert!(topic_2.origin_server_ts > topic_1.origin_server_ts);

        let base = initial_state(&events);
        let mut fork_1 = base.clone();
        fork_1.insert(
            (StateEventType::RoomTopic, String::new()),
            topic_1.event_id.clone(),
        );
        let mut fork_2 = base;
        fork_2.insert(
            (StateEventType::RoomTopic, String::new()),
            topic_2.event_id.clone(),
        );

        let resolved = resolve_forks(&RoomVersionRules::V1, &events, &[fork_1, fork_2]);
        assert_eq!(
            resolved[&(StateEventType::RoomTopic, String::new())],
            topic_2.event_id
        );
    }

    /// The unconflicted state survives resolution untouched.
    #[test]
    fn unconflicted_state_is_kept() {
        let events = INITIAL_EVENTS();
        let base = initial_state(&events);

        let resolved =
            resolve_forks(&RoomVersionRules::V6, &events, &[base.clone(), base.clone()]);
        assert_eq!(resolved, base);
    }

    /// The v12 reduction drops the candidate that severs continuity with
    /// its own predecessor when another candidate preserves it.
    #[test]
    fn state_reset_reduction_prefers_continuity() {
        let mut events = INITIAL_EVENTS();

        // A power-levels event that keeps alice at 100 and adds bob.
        let continuous = to_pdu_event(
            "PCONT",
            alice(),
            TimelineEventType::RoomPowerLevels,
            Some(""),
            to_raw_json_value(&json!({
                "users": { alice().as_str(): 100, bob().as_str(): 50 }
            }))
            .unwrap(),
            &["CREATE", "IMA", "IPOWER"],
            &["IPOWER"],
        );
        events.insert(continuous.event_id.clone(), continuous.clone());

        // A drastically different one: alice stripped of power entirely.
        let reset = to_pdu_event(
            "PRESET",
            alice(),
            TimelineEventType::RoomPowerLevels,
            Some(""),
            to_raw_json_value(&json!({
                "users": { bob().as_str(): 100 }
            }))
            .unwrap(),
            &["CREATE", "IMA", "IPOWER"],
            &["IPOWER"],
        );
        events.insert(reset.event_id.clone(), reset.clone());

        let base = initial_state(&events);
        let mut fork_continuous = base.clone();
        fork_continuous.insert(
            (StateEventType::RoomPowerLevels, String::new()),
            continuous.event_id.clone(),
        );
        let mut fork_reset = base;
        fork_reset.insert(
            (StateEventType::RoomPowerLevels, String::new()),
            reset.event_id.clone(),
        );

        let resolved = resolve_forks(
            &RoomVersionRules::V12,
            &events,
            &[fork_continuous, fork_reset],
        );
        assert_eq!(
            resolved[&(StateEventType::RoomPowerLevels, String::new())],
            continuous.event_id
        );
    }

    mod comparators {
        use serde_json::{json, value::to_raw_value};

        use crate::state::{
            content_key_continuity, join_rules_continuity, power_levels_continuity,
        };

        #[test]
        fn power_levels_counts_preserved_users() {
            let old = to_raw_value(&json!({ "users": { "@a:x": 100, "@b:x": 50 } })).unwrap();
            let same = to_raw_value(&json!({ "users": { "@a:x": 100, "@b:x": 50, "@c:x": 1 } }))
                .unwrap();
            let reset = to_raw_value(&json!({ "users": { "@c:x": 100 } })).unwrap();

            assert_eq!(power_levels_continuity(&old, &same), 2);
            assert_eq!(power_levels_continuity(&old, &reset), 0);
        }

        #[test]
        fn join_rules_compare_equal_rules() {
            let public = to_raw_value(&json!({ "join_rule": "public" })).unwrap();
            let also_public = to_raw_value(&json!({ "join_rule": "public" })).unwrap();
            let invite = to_raw_value(&json!({ "join_rule": "invite" })).unwrap();

            assert_eq!(join_rules_continuity(&public, &also_public), 1);
            assert_eq!(join_rules_continuity(&public, &invite), 0);
        }

        #[test]
        fn generic_content_counts_stable_keys() {
            let old = to_raw_value(&json!({ "name": "room", "kind": "chat" })).unwrap();
            let tweaked = to_raw_value(&json!({ "name": "room", "kind": "forum" })).unwrap();
            let replaced = to_raw_value(&json!({ "other": 1 })).unwrap();

            assert_eq!(content_key_continuity(&old, &tweaked), 1);
            assert_eq!(content_key_continuity(&old, &replaced), 0);
        }
    }
}
