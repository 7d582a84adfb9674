//! Group engine: membership, playback state, aggregate volume and
//! role-gated fan-out.
//!
//! Lock discipline: the engine's group map lock and each group's state
//! lock are ordered map → state, and cross-group actions (`switch`)
//! acquire group state locks in ascending group-id order. Wire sends are
//! collected under the state lock and dispatched after it is released.

pub mod commands;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::clock::now_micros;
use crate::endpoint::Endpoint;
use crate::events::{EventEmitter, GroupEvent};
use crate::protocol::messages::{
    ArtworkSource, ClientState, ControllerCommand, ControllerCommandKind, ControllerState,
    GroupUpdate, Message, MetadataState, PlaybackState, PlayerCommand, PlayerCommandKind,
    RepeatMode, Role, ServerCommand, ServerState, StreamRequestFormat,
};
use crate::protocol::DeltaField;
use crate::registry::ConnectionRegistry;
use crate::stream::{StreamConfig, StreamController, StreamHandle};

pub use commands::{supported_commands, MediaController};

/// Provides the audio pipeline for a group's new stream.
pub trait StreamFactory: Send + Sync {
    /// Called when a group transitions to `playing` with no active stream.
    /// `None` means nothing can be played right now.
    fn create_stream(&self, group_id: &str) -> Option<StreamConfig>;
}

/// Full accumulated metadata for a group; fan-out sends per-member deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataSnapshot {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album_artist: Option<String>,
    pub album: Option<String>,
    pub artwork_url: Option<String>,
    pub year: Option<u32>,
    pub track: Option<String>,
    pub position: Option<i64>,
    pub duration: Option<i64>,
    pub playback_speed: Option<f64>,
    pub repeat: Option<RepeatMode>,
    pub shuffle: Option<bool>,
}

impl MetadataSnapshot {
    /// Delta against what a member last saw; `None` when nothing changed.
    fn diff_against(&self, prior: &Self) -> Option<MetadataState> {
        let state = MetadataState {
            timestamp: now_micros(),
            title: DeltaField::diff(prior.title.as_ref(), self.title.as_ref()),
            artist: DeltaField::diff(prior.artist.as_ref(), self.artist.as_ref()),
            album_artist: DeltaField::diff(prior.album_artist.as_ref(), self.album_artist.as_ref()),
            album: DeltaField::diff(prior.album.as_ref(), self.album.as_ref()),
            artwork_url: DeltaField::diff(prior.artwork_url.as_ref(), self.artwork_url.as_ref()),
            year: DeltaField::diff(prior.year.as_ref(), self.year.as_ref()),
            track: DeltaField::diff(prior.track.as_ref(), self.track.as_ref()),
            position: DeltaField::diff(prior.position.as_ref(), self.position.as_ref()),
            duration: DeltaField::diff(prior.duration.as_ref(), self.duration.as_ref()),
            playback_speed: DeltaField::diff(
                prior.playback_speed.as_ref(),
                self.playback_speed.as_ref(),
            ),
            repeat: DeltaField::diff(prior.repeat.as_ref(), self.repeat.as_ref()),
            shuffle: DeltaField::diff(prior.shuffle.as_ref(), self.shuffle.as_ref()),
        };
        let changed = !(state.title.is_absent()
            && state.artist.is_absent()
            && state.album_artist.is_absent()
            && state.album.is_absent()
            && state.artwork_url.is_absent()
            && state.year.is_absent()
            && state.track.is_absent()
            && state.position.is_absent()
            && state.duration.is_absent()
            && state.playback_speed.is_absent()
            && state.repeat.is_absent()
            && state.shuffle.is_absent());
        changed.then_some(state)
    }
}

/// What a member last saw of its group context.
#[derive(Debug, Clone, Default)]
struct GroupContext {
    playback: Option<PlaybackState>,
    group_id: Option<String>,
    group_name: Option<String>,
}

/// One group member. Endpoints are referenced by id, never by pointer.
struct Member {
    roles: Vec<Role>,
    volume: u8,
    muted: bool,
    /// Volume to restore when group mute lifts.
    volume_before_mute: u8,
    /// Commands this player declared servable via `server/command`.
    player_commands: Vec<PlayerCommandKind>,
    last_group_update: GroupContext,
    last_controller: Option<ControllerState>,
    last_metadata: MetadataSnapshot,
}

impl Member {
    fn new(roles: Vec<Role>, player_commands: Vec<PlayerCommandKind>) -> Self {
        Self {
            roles,
            volume: 100,
            muted: false,
            volume_before_mute: 100,
            player_commands,
            last_group_update: GroupContext::default(),
            last_controller: None,
            last_metadata: MetadataSnapshot::default(),
        }
    }

    fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    fn is_streaming(&self) -> bool {
        self.roles.iter().any(|r| r.is_streaming())
    }
}

struct GroupState {
    name: String,
    playback: PlaybackState,
    members: BTreeMap<String, Member>,
    muted: bool,
    stream: Option<StreamHandle>,
    metadata: MetadataSnapshot,
}

/// A set of endpoints receiving the same logical playback.
pub struct Group {
    pub id: String,
    state: Mutex<GroupState>,
}

impl Group {
    fn new(id: String, name: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(GroupState {
                name,
                playback: PlaybackState::Stopped,
                members: BTreeMap::new(),
                muted: false,
                stream: None,
                metadata: MetadataSnapshot::default(),
            }),
        })
    }
}

/// Outbound messages collected under a lock, sent after release.
type Outbox = Vec<(String, Message)>;

/// The engine owning all groups of one server.
pub struct GroupEngine {
    groups: Mutex<BTreeMap<String, Arc<Group>>>,
    /// client_id → group_id index; every reporting endpoint is in exactly
    /// one group.
    membership: DashMap<String, String>,
    registry: Arc<ConnectionRegistry>,
    media: Arc<dyn MediaController>,
    streams: Arc<dyn StreamFactory>,
    emitter: Arc<dyn EventEmitter>,
}

fn solo_group_id(client_id: &str) -> String {
    format!("solo-{client_id}")
}

impl GroupEngine {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        media: Arc<dyn MediaController>,
        streams: Arc<dyn StreamFactory>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(BTreeMap::new()),
            membership: DashMap::new(),
            registry,
            media,
            streams,
            emitter,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Membership
    // ─────────────────────────────────────────────────────────────────────

    /// Admits a freshly established endpoint into its own solo group and
    /// sends the initial `group/update` so it learns its context.
    pub fn attach(self: &Arc<Self>, endpoint: &Arc<Endpoint>) {
        let Some(hello) = endpoint.client_hello() else {
            return;
        };
        let client_id = hello.client_id.clone();
        let roles = hello.supported_roles.clone();
        let player_commands = hello
            .player_support
            .as_ref()
            .map(|p| p.supported_commands.clone())
            .unwrap_or_default();

        let group = self.ensure_group(&solo_group_id(&client_id), &hello.name);
        self.join(&group, &client_id, Member::new(roles, player_commands));
    }

    /// Removes an endpoint from its group; disposes the group when it was
    /// the last member.
    pub fn detach(self: &Arc<Self>, client_id: &str) {
        let Some((_, group_id)) = self.membership.remove(client_id) else {
            return;
        };
        let Some(group) = self.group_by_id(&group_id) else {
            return;
        };

        let outbox = {
            let mut state = group.state.lock();
            state.members.remove(client_id);
            if let Some(stream) = &state.stream {
                stream.remove_member(client_id);
            }
            self.controller_outbox(&mut state)
        };
        self.dispatch(outbox);
        self.emitter.emit_group(GroupEvent::MemberLeft {
            group_id: group_id.clone(),
            client_id: client_id.to_string(),
        });
        self.dispose_if_empty(&group);
    }

    fn join(self: &Arc<Self>, group: &Arc<Group>, client_id: &str, member: Member) {
        let streaming = member.is_streaming();
        self.membership
            .insert(client_id.to_string(), group.id.clone());

        let outbox = {
            let mut state = group.state.lock();
            state.members.insert(client_id.to_string(), member);
            if streaming {
                if let (Some(stream), Some(endpoint)) =
                    (&state.stream, self.registry.get(client_id))
                {
                    stream.add_member(endpoint);
                }
            }
            let mut outbox = self.group_update_outbox(&group.id, &mut state);
            outbox.extend(self.controller_outbox(&mut state));
            outbox.extend(metadata_outbox(&mut state));
            outbox
        };
        self.dispatch(outbox);
        self.emitter.emit_group(GroupEvent::MemberJoined {
            group_id: group.id.clone(),
            client_id: client_id.to_string(),
        });
    }

    fn ensure_group(&self, group_id: &str, name: &str) -> Arc<Group> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(group_id) {
            return Arc::clone(group);
        }
        let group = Group::new(group_id.to_string(), name.to_string());
        groups.insert(group_id.to_string(), Arc::clone(&group));
        drop(groups);
        log::info!("[Group] Created group {}", group_id);
        self.emitter.emit_group(GroupEvent::Created {
            group_id: group_id.to_string(),
        });
        group
    }

    fn group_by_id(&self, group_id: &str) -> Option<Arc<Group>> {
        self.groups.lock().get(group_id).map(Arc::clone)
    }

    fn group_of(&self, client_id: &str) -> Option<Arc<Group>> {
        let group_id = self.membership.get(client_id).map(|r| r.value().clone())?;
        self.group_by_id(&group_id)
    }

    fn dispose_if_empty(&self, group: &Arc<Group>) {
        {
            let mut state = group.state.lock();
            if !state.members.is_empty() {
                return;
            }
            if let Some(stream) = state.stream.take() {
                stream.end();
            }
        }
        self.groups.lock().remove(&group.id);
        log::info!("[Group] Disposed empty group {}", group.id);
        self.emitter.emit_group(GroupEvent::Disposed {
            group_id: group.id.clone(),
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inbound message handling
    // ─────────────────────────────────────────────────────────────────────

    /// Routes a member's `client/state` report.
    pub fn handle_client_state(self: &Arc<Self>, client_id: &str, report: &ClientState) {
        let Some(player) = report.player.as_ref() else {
            return;
        };
        if player.volume > 100 {
            log::warn!(
                "[Group] Ignoring client/state from {} with volume {}",
                client_id,
                player.volume
            );
            return;
        }
        let Some(group) = self.group_of(client_id) else {
            return;
        };

        let outbox = {
            let mut state = group.state.lock();
            let Some(member) = state.members.get_mut(client_id) else {
                return;
            };
            if !member.has_role(Role::Player) {
                log::warn!(
                    "[Group] Dropping player state from {}: player role not declared",
                    client_id
                );
                return;
            }
            member.volume = player.volume;
            member.muted = player.muted;
            self.controller_outbox(&mut state)
        };
        self.dispatch(outbox);
    }

    /// Routes a controller command, enforcing role gating and ranges.
    pub fn handle_command(self: &Arc<Self>, client_id: &str, command: &ControllerCommand) {
        let Some(group) = self.group_of(client_id) else {
            return;
        };
        {
            let state = group.state.lock();
            let allowed = state
                .members
                .get(client_id)
                .is_some_and(|m| m.has_role(Role::Controller));
            if !allowed {
                log::warn!(
                    "[Group] Dropping {:?} from {}: controller role not declared",
                    command.command,
                    client_id
                );
                return;
            }
        }

        use ControllerCommandKind::*;
        match command.command {
            Play => self.play(&group),
            Pause => self.pause(&group),
            Stop => self.stop(&group),
            Next => self.media.next_track(&group.id),
            Previous => self.media.previous_track(&group.id),
            Volume => match command.volume {
                Some(volume) if volume <= 100 => self.set_group_volume(&group, volume),
                other => {
                    log::warn!(
                        "[Group] Rejecting volume command from {}: {:?} out of range",
                        client_id,
                        other
                    );
                }
            },
            Mute => {
                let muted = command.mute.unwrap_or(!group.state.lock().muted);
                self.set_group_mute(&group, muted);
            }
            RepeatOff => self.media.set_repeat(&group.id, RepeatMode::Off),
            RepeatOne => self.media.set_repeat(&group.id, RepeatMode::One),
            RepeatAll => self.media.set_repeat(&group.id, RepeatMode::All),
            Shuffle => self.media.set_shuffle(&group.id, true),
            Unshuffle => self.media.set_shuffle(&group.id, false),
            Switch => self.switch(client_id, &group),
        }
    }

    /// Routes a member's `stream/request-format`.
    pub fn handle_request_format(
        self: &Arc<Self>,
        client_id: &str,
        request: &StreamRequestFormat,
    ) {
        let Some(group) = self.group_of(client_id) else {
            return;
        };
        let state = group.state.lock();
        let Some(stream) = state.stream.as_ref() else {
            log::debug!(
                "[Group] Format request from {} with no active stream",
                client_id
            );
            return;
        };
        if let Some(player) = request.player.as_ref() {
            stream.request_format(client_id, player.clone());
        }
        if let Some(artwork) = request.artwork.as_ref() {
            stream.reconfigure_artwork(client_id, artwork.clone());
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Playback transitions
    // ─────────────────────────────────────────────────────────────────────

    /// `stopped|paused → playing`. Creates the stream when none is active
    /// and enrolls every streaming member.
    pub fn play(self: &Arc<Self>, group: &Arc<Group>) {
        let outbox = {
            let mut state = group.state.lock();
            if state.playback == PlaybackState::Playing {
                return;
            }
            if let Some(stream) = &state.stream {
                stream.resume();
            } else {
                let Some(config) = self.streams.create_stream(&group.id) else {
                    log::warn!("[Group] Nothing to play for group {}", group.id);
                    return;
                };
                let engine = Arc::downgrade(self);
                let group_id = group.id.clone();
                let handle = StreamController::spawn(
                    group.id.clone(),
                    config,
                    Arc::clone(&self.emitter),
                    Box::new(move || {
                        if let Some(engine) = engine.upgrade() {
                            engine.on_stream_ended(&group_id);
                        }
                    }),
                );
                for client_id in state
                    .members
                    .iter()
                    .filter(|(_, m)| m.is_streaming())
                    .map(|(id, _)| id)
                {
                    if let Some(endpoint) = self.registry.get(client_id) {
                        handle.add_member(endpoint);
                    }
                }
                state.stream = Some(handle);
            }
            state.playback = PlaybackState::Playing;
            self.playback_outbox(group, &mut state)
        };
        self.dispatch(outbox);
        self.notify_playback(group, PlaybackState::Playing);
    }

    /// `playing → paused`.
    pub fn pause(self: &Arc<Self>, group: &Arc<Group>) {
        let outbox = {
            let mut state = group.state.lock();
            if state.playback != PlaybackState::Playing {
                return;
            }
            if let Some(stream) = &state.stream {
                stream.pause();
            }
            state.playback = PlaybackState::Paused;
            self.playback_outbox(group, &mut state)
        };
        self.dispatch(outbox);
        self.notify_playback(group, PlaybackState::Paused);
    }

    /// `playing|paused → stopped`. Ends the active stream.
    pub fn stop(self: &Arc<Self>, group: &Arc<Group>) {
        let outbox = {
            let mut state = group.state.lock();
            if state.playback == PlaybackState::Stopped {
                return;
            }
            if let Some(stream) = state.stream.take() {
                stream.end();
            }
            state.playback = PlaybackState::Stopped;
            self.playback_outbox(group, &mut state)
        };
        self.dispatch(outbox);
        self.notify_playback(group, PlaybackState::Stopped);
    }

    /// The stream ran out of source audio.
    fn on_stream_ended(self: &Arc<Self>, group_id: &str) {
        let Some(group) = self.group_by_id(group_id) else {
            return;
        };
        let outbox = {
            let mut state = group.state.lock();
            if state.stream.take().is_none() && state.playback == PlaybackState::Stopped {
                return;
            }
            state.playback = PlaybackState::Stopped;
            self.playback_outbox(&group, &mut state)
        };
        self.dispatch(outbox);
        self.notify_playback(&group, PlaybackState::Stopped);
    }

    fn notify_playback(&self, group: &Arc<Group>, state: PlaybackState) {
        self.media.playback_changed(&group.id, state);
        self.emitter.emit_group(GroupEvent::PlaybackChanged {
            group_id: group.id.clone(),
            state,
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Volume and mute
    // ─────────────────────────────────────────────────────────────────────

    /// Sets the group volume by scaling members proportionally: ratios
    /// preserved, clamped to 0..=100, members at 0 lifted to `ceil(delta)`
    /// when raising.
    pub fn set_group_volume(self: &Arc<Self>, group: &Arc<Group>, target: u8) {
        let target = target.min(100);
        let outbox = {
            let mut state = group.state.lock();
            let current = aggregate_volume(&state);
            let delta = i32::from(target) - i32::from(current);

            let mut commands: Outbox = Vec::new();
            for (client_id, member) in state
                .members
                .iter_mut()
                .filter(|(_, m)| m.has_role(Role::Player))
            {
                let new_volume = if current == 0 {
                    target
                } else if member.volume == 0 && delta > 0 {
                    delta as u8
                } else {
                    let scaled =
                        (u32::from(member.volume) * u32::from(target) + u32::from(current) / 2)
                            / u32::from(current);
                    scaled.min(100) as u8
                };
                if new_volume == member.volume {
                    continue;
                }
                member.volume = new_volume;
                if member.player_commands.contains(&PlayerCommandKind::Volume) {
                    commands.push((
                        client_id.clone(),
                        Message::ServerCommand(ServerCommand {
                            player: Some(PlayerCommand {
                                command: PlayerCommandKind::Volume,
                                volume: Some(new_volume),
                                mute: None,
                            }),
                        }),
                    ));
                }
            }
            commands.extend(self.controller_outbox(&mut state));
            commands
        };
        self.dispatch(outbox);
        self.emit_volume(group);
    }

    /// Toggles group mute; unmuting restores each member's prior volume.
    pub fn set_group_mute(self: &Arc<Self>, group: &Arc<Group>, muted: bool) {
        let outbox = {
            let mut state = group.state.lock();
            if state.muted == muted {
                return;
            }
            state.muted = muted;

            let mut commands: Outbox = Vec::new();
            for (client_id, member) in state
                .members
                .iter_mut()
                .filter(|(_, m)| m.has_role(Role::Player))
            {
                if member.muted == muted {
                    continue;
                }
                let mut volume = None;
                if muted {
                    member.volume_before_mute = member.volume;
                } else if member.volume != member.volume_before_mute {
                    member.volume = member.volume_before_mute;
                    volume = Some(member.volume);
                }
                member.muted = muted;
                if member.player_commands.contains(&PlayerCommandKind::Mute) {
                    commands.push((
                        client_id.clone(),
                        Message::ServerCommand(ServerCommand {
                            player: Some(PlayerCommand {
                                command: PlayerCommandKind::Mute,
                                volume,
                                mute: Some(muted),
                            }),
                        }),
                    ));
                }
            }
            commands.extend(self.controller_outbox(&mut state));
            commands
        };
        self.dispatch(outbox);
        self.emit_volume(group);
    }

    fn emit_volume(&self, group: &Arc<Group>) {
        let (volume, muted) = {
            let state = group.state.lock();
            (aggregate_volume(&state), state.muted)
        };
        self.emitter.emit_group(GroupEvent::VolumeChanged {
            group_id: group.id.clone(),
            volume,
            muted,
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Metadata and artwork
    // ─────────────────────────────────────────────────────────────────────

    /// Replaces the group's metadata; members receive deltas.
    pub fn set_metadata(self: &Arc<Self>, group_id: &str, metadata: MetadataSnapshot) {
        let Some(group) = self.group_by_id(group_id) else {
            return;
        };
        let outbox = {
            let mut state = group.state.lock();
            state.metadata = metadata;
            metadata_outbox(&mut state)
        };
        self.dispatch(outbox);
    }

    /// Publishes artwork to the group's active stream channels.
    pub fn set_artwork(self: &Arc<Self>, group_id: &str, source: ArtworkSource, image: Bytes) {
        if let Some(group) = self.group_by_id(group_id) {
            let state = group.state.lock();
            if let Some(stream) = state.stream.as_ref() {
                stream.set_artwork(source, image);
            }
        }
    }

    /// Clears artwork on the group's active stream channels.
    pub fn clear_artwork(self: &Arc<Self>, group_id: &str, source: ArtworkSource) {
        if let Some(group) = self.group_by_id(group_id) {
            let state = group.state.lock();
            if let Some(stream) = state.stream.as_ref() {
                stream.clear_artwork(source);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Switch
    // ─────────────────────────────────────────────────────────────────────

    /// Cycles a controller through candidate groups: multi-member playing
    /// groups, then playing solo players, then its own solo group; each
    /// band ordered lexicographically by group id.
    fn switch(self: &Arc<Self>, client_id: &str, current: &Arc<Group>) {
        let snapshot: Vec<Arc<Group>> = self.groups.lock().values().cloned().collect();

        let mut multi_playing = Vec::new();
        let mut solo_playing = Vec::new();
        let mut player_capable = false;
        for group in &snapshot {
            // One state lock at a time; the map iterates in ascending id
            // order already.
            let state = group.state.lock();
            if let Some(member) = state.members.get(client_id) {
                player_capable = member.has_role(Role::Player);
            }
            match (state.members.len(), state.playback) {
                (n, PlaybackState::Playing) if n >= 2 => multi_playing.push(group.id.clone()),
                (1, PlaybackState::Playing) => {
                    let solo_is_player = state
                        .members
                        .values()
                        .next()
                        .is_some_and(|m| m.has_role(Role::Player));
                    if solo_is_player {
                        solo_playing.push(group.id.clone());
                    }
                }
                _ => {}
            }
        }

        let mut candidates: Vec<String> = Vec::new();
        candidates.extend(multi_playing);
        candidates.extend(solo_playing);
        if player_capable {
            candidates.push(solo_group_id(client_id));
        }
        let mut seen = std::collections::HashSet::new();
        candidates.retain(|id| seen.insert(id.clone()));
        if candidates.is_empty() {
            return;
        }

        let next = match candidates.iter().position(|id| *id == current.id) {
            Some(i) => candidates[(i + 1) % candidates.len()].clone(),
            None => candidates[0].clone(),
        };
        if next == current.id {
            return;
        }
        log::info!("[Group] Switching {} from {} to {}", client_id, current.id, next);
        self.move_member(client_id, current, &next);
    }

    /// Moves a member between groups, holding both state locks in
    /// ascending group-id order.
    pub fn move_member(self: &Arc<Self>, client_id: &str, from: &Arc<Group>, to_id: &str) {
        if from.id == to_id {
            return;
        }
        let member_name = self
            .registry
            .get(client_id)
            .and_then(|e| e.client_hello().map(|h| h.name.clone()))
            .unwrap_or_else(|| client_id.to_string());
        let to = self.ensure_group(to_id, &member_name);

        let outbox = {
            let (first, second) = if from.id < to.id {
                (from, &to)
            } else {
                (&to, from)
            };
            let mut first_state = first.state.lock();
            let mut second_state = second.state.lock();
            let (from_state, to_state) = if from.id < to.id {
                (&mut first_state, &mut second_state)
            } else {
                (&mut second_state, &mut first_state)
            };

            let Some(member) = from_state.members.remove(client_id) else {
                return;
            };
            if let Some(stream) = &from_state.stream {
                stream.remove_member(client_id);
            }

            let streaming = member.is_streaming();
            to_state.members.insert(client_id.to_string(), member);
            self.membership
                .insert(client_id.to_string(), to.id.clone());
            if streaming {
                if let (Some(stream), Some(endpoint)) =
                    (&to_state.stream, self.registry.get(client_id))
                {
                    stream.add_member(endpoint);
                }
            }

            let mut outbox = self.group_update_outbox(&to.id, to_state);
            outbox.extend(self.controller_outbox(to_state));
            outbox.extend(self.controller_outbox(from_state));
            outbox.extend(metadata_outbox(to_state));
            outbox
        };
        self.dispatch(outbox);
        self.emitter.emit_group(GroupEvent::MemberLeft {
            group_id: from.id.clone(),
            client_id: client_id.to_string(),
        });
        self.emitter.emit_group(GroupEvent::MemberJoined {
            group_id: to.id.clone(),
            client_id: client_id.to_string(),
        });
        self.dispose_if_empty(from);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Fan-out
    // ─────────────────────────────────────────────────────────────────────

    /// Per-member `group/update` deltas for the current context.
    fn group_update_outbox(&self, group_id: &str, state: &mut GroupState) -> Outbox {
        let playback = state.playback;
        let name = state.name.clone();
        let mut outbox = Vec::new();
        for (client_id, member) in state.members.iter_mut() {
            let update = GroupUpdate {
                playback_state: DeltaField::diff(
                    member.last_group_update.playback.as_ref(),
                    Some(&playback),
                ),
                group_id: DeltaField::diff(
                    member.last_group_update.group_id.as_ref(),
                    Some(&group_id.to_string()),
                ),
                group_name: DeltaField::diff(
                    member.last_group_update.group_name.as_ref(),
                    Some(&name),
                ),
            };
            if update.playback_state.is_absent()
                && update.group_id.is_absent()
                && update.group_name.is_absent()
            {
                continue;
            }
            member.last_group_update = GroupContext {
                playback: Some(playback),
                group_id: Some(group_id.to_string()),
                group_name: Some(name.clone()),
            };
            outbox.push((client_id.clone(), Message::GroupUpdate(update)));
        }
        outbox
    }

    /// Playback-change fan-out: `group/update` to all members.
    fn playback_outbox(&self, group: &Arc<Group>, state: &mut GroupState) -> Outbox {
        let mut outbox = self.group_update_outbox(&group.id, state);
        outbox.extend(self.controller_outbox(state));
        outbox
    }

    /// `server/state.controller` for controller-role members whose view
    /// changed.
    fn controller_outbox(&self, state: &mut GroupState) -> Outbox {
        let controller = ControllerState {
            supported_commands: supported_commands(&self.media.capabilities(), state.playback),
            volume: aggregate_volume(state),
            muted: state.muted,
        };
        let mut outbox = Vec::new();
        for (client_id, member) in state.members.iter_mut() {
            if !member.has_role(Role::Controller) {
                continue;
            }
            if member.last_controller.as_ref() == Some(&controller) {
                continue;
            }
            member.last_controller = Some(controller.clone());
            outbox.push((
                client_id.clone(),
                Message::ServerState(ServerState {
                    metadata: None,
                    controller: Some(controller.clone()),
                }),
            ));
        }
        outbox
    }

    /// Sends collected messages outside any lock.
    fn dispatch(&self, outbox: Outbox) {
        for (client_id, message) in outbox {
            if let Some(endpoint) = self.registry.get(&client_id) {
                let _ = endpoint.send(&message);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    /// Group ids currently alive, ascending.
    pub fn group_ids(&self) -> Vec<String> {
        self.groups.lock().keys().cloned().collect()
    }

    /// Handle to a live group.
    pub fn group_handle(&self, group_id: &str) -> Option<Arc<Group>> {
        self.group_by_id(group_id)
    }

    /// The group a client currently belongs to.
    pub fn group_id_of(&self, client_id: &str) -> Option<String> {
        self.membership.get(client_id).map(|r| r.value().clone())
    }

    /// Reported group volume: mean of member player volumes.
    pub fn group_volume(&self, group_id: &str) -> Option<u8> {
        let group = self.group_by_id(group_id)?;
        let state = group.state.lock();
        Some(aggregate_volume(&state))
    }

    /// Current playback state of a group.
    pub fn playback_state(&self, group_id: &str) -> Option<PlaybackState> {
        let group = self.group_by_id(group_id)?;
        let state = group.state.lock();
        Some(state.playback)
    }

    /// Ends every stream and drops all groups (host shutdown).
    pub fn shutdown(&self) {
        let groups: Vec<Arc<Group>> = {
            let mut map = self.groups.lock();
            let groups = map.values().cloned().collect();
            map.clear();
            groups
        };
        self.membership.clear();
        for group in groups {
            let mut state = group.state.lock();
            if let Some(stream) = state.stream.take() {
                stream.end();
            }
        }
    }
}

/// Mean of member player volumes; members at 0 are represented explicitly.
fn aggregate_volume(state: &GroupState) -> u8 {
    let volumes: Vec<u32> = state
        .members
        .values()
        .filter(|m| m.has_role(Role::Player))
        .map(|m| u32::from(m.volume))
        .collect();
    if volumes.is_empty() {
        return 0;
    }
    (volumes.iter().sum::<u32>() / volumes.len() as u32) as u8
}

/// `server/state.metadata` deltas for metadata-role members.
fn metadata_outbox(state: &mut GroupState) -> Outbox {
    let metadata = state.metadata.clone();
    let mut outbox = Vec::new();
    for (client_id, member) in state.members.iter_mut() {
        if !member.has_role(Role::Metadata) {
            continue;
        }
        if let Some(delta) = metadata.diff_against(&member.last_metadata) {
            member.last_metadata = metadata.clone();
            outbox.push((
                client_id.clone(),
                Message::ServerState(ServerState {
                    metadata: Some(delta),
                    controller: None,
                }),
            ));
        }
    }
    outbox
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player_member(volume: u8) -> Member {
        let mut member = Member::new(vec![Role::Player], vec![PlayerCommandKind::Volume]);
        member.volume = volume;
        member
    }

    fn state_with_volumes(volumes: &[u8]) -> GroupState {
        let mut members = BTreeMap::new();
        for (i, v) in volumes.iter().enumerate() {
            members.insert(format!("c{i}"), player_member(*v));
        }
        members.insert(
            "display".into(),
            Member::new(vec![Role::Metadata], Vec::new()),
        );
        GroupState {
            name: "test".into(),
            playback: PlaybackState::Stopped,
            members,
            muted: false,
            stream: None,
            metadata: MetadataSnapshot::default(),
        }
    }

    #[test]
    fn aggregate_volume_is_mean_of_players_only() {
        let state = state_with_volumes(&[20, 40, 90]);
        assert_eq!(aggregate_volume(&state), 50);

        let silent = state_with_volumes(&[0, 0]);
        assert_eq!(aggregate_volume(&silent), 0);
    }

    #[test]
    fn metadata_diff_reports_only_changes() {
        let prior = MetadataSnapshot {
            title: Some("Song A".into()),
            artist: Some("Band".into()),
            ..Default::default()
        };
        let next = MetadataSnapshot {
            title: Some("Song B".into()),
            artist: Some("Band".into()),
            year: Some(2024),
            ..Default::default()
        };

        let delta = next.diff_against(&prior).expect("changes present");
        assert_eq!(delta.title, DeltaField::Value("Song B".into()));
        assert_eq!(delta.artist, DeltaField::Absent);
        assert_eq!(delta.year, DeltaField::Value(2024));

        assert!(next.diff_against(&next.clone()).is_none());
    }

    #[test]
    fn metadata_diff_clears_with_null() {
        let prior = MetadataSnapshot {
            artwork_url: Some("http://x/cover.jpg".into()),
            ..Default::default()
        };
        let delta = MetadataSnapshot::default()
            .diff_against(&prior)
            .expect("clear is a change");
        assert_eq!(delta.artwork_url, DeltaField::Null);
    }
}
