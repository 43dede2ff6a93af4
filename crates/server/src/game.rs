//! Per-game state: team rosters, rays, membership and package handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lasertag_protocol::{
    outbound, ClientPackage, Color, Package, PlayerState, Point, RayState, StateSnapshot,
};

use crate::registry::Server;
use crate::session::{Session, SessionId};

/// Hard cap on each of the two team rosters.
pub const MAX_PLAYERS_PER_TEAM: usize = 5;

/// One of the two fixed team slots of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamId {
    First,
    Second,
}

impl TeamId {
    /// Wire representation (`team_id` field).
    pub fn index(self) -> u64 {
        match self {
            Self::First => 0,
            Self::Second => 1,
        }
    }
}

/// Team selection for a join attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeamSelect {
    First,
    Second,
    /// The team with fewer members; on a tie, the second team. If the
    /// chosen team is full the join fails without trying the other one.
    #[default]
    Random,
}

/// Tunables applied to every new game.
#[derive(Debug, Clone)]
pub struct GameSettings {
    /// Broadcast the post-leave state to the remaining players.
    pub broadcast_on_leave: bool,
    /// Starting health for new players.
    pub default_health: f64,
    /// Starting angle for new players.
    pub default_angle: f64,
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            broadcast_on_leave: true,
            default_health: 100.0,
            default_angle: 0.0,
        }
    }
}

/// A successful join: the assigned player id and the state snapshot the
/// client receives as its initial view.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub player_id: u64,
    pub state: StateSnapshot,
}

struct Member {
    session: Session,
    player: PlayerState,
}

type Roster = HashMap<SessionId, Member>;

/// A named game: a shared context for up to ten players in two teams.
///
/// Lock order, strictly: `first_team` ≺ `second_team` ≺ `players_cache` ≺
/// `rays`. Locks may be taken individually, but never out of that order
/// while another is held.
pub struct Game {
    name: String,
    first_team: RwLock<Roster>,
    second_team: RwLock<Roster>,
    /// Session → team cache for O(1) membership lookup.
    players_cache: Mutex<HashMap<SessionId, TeamId>>,
    rays: RwLock<BTreeMap<u64, RayState>>,
    /// Player ids are unique and never reused within a game's lifetime.
    next_player_id: AtomicU64,
    settings: GameSettings,
}

impl Game {
    pub fn new(name: impl Into<String>, settings: GameSettings) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            first_team: RwLock::new(HashMap::new()),
            second_team: RwLock::new(HashMap::new()),
            players_cache: Mutex::new(HashMap::new()),
            rays: RwLock::new(BTreeMap::new()),
            next_player_id: AtomicU64::new(0),
            settings,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Joins a session to this game.
    ///
    /// On success the new player is inserted into the selected team, and
    /// `ack` (built from the assigned id and the fresh state snapshot) is
    /// enqueued on the joining session before the rosters unlock. That is
    /// what guarantees the client sees its join acknowledgement before any
    /// broadcast that already includes it.
    ///
    /// Returns `None` if the selected team is full or the session already
    /// joined this game; in both cases nothing is mutated.
    pub fn join(
        &self,
        session: &Session,
        nick: &str,
        select: TeamSelect,
        ack: impl FnOnce(u64, &StateSnapshot) -> Package,
    ) -> Option<JoinOutcome> {
        if self.is_in_game(session.id()) {
            return None;
        }

        let mut first = self.first_team.write().unwrap();
        let mut second = self.second_team.write().unwrap();

        let team = match select {
            TeamSelect::First => TeamId::First,
            TeamSelect::Second => TeamId::Second,
            TeamSelect::Random => {
                if first.len() >= second.len() {
                    TeamId::Second
                } else {
                    TeamId::First
                }
            }
        };

        let roster: &mut Roster = match team {
            TeamId::First => &mut *first,
            TeamId::Second => &mut *second,
        };
        if roster.len() >= MAX_PLAYERS_PER_TEAM {
            return None;
        }

        let player_id = self.next_player_id.fetch_add(1, Ordering::Relaxed);
        let player = PlayerState {
            player_id,
            team_id: team.index(),
            nick: nick.to_owned(),
            color: Color::default(),
            health: self.settings.default_health,
            position: Point::default(),
            angle: self.settings.default_angle,
        };
        roster.insert(
            session.id(),
            Member {
                session: session.clone(),
                player,
            },
        );

        let state = self.snapshot_locked(&first, &second);
        session.write(ack(player_id, &state));
        self.players_cache.lock().unwrap().insert(session.id(), team);

        tracing::info!(
            game = %self.name,
            session = session.id(),
            player = player_id,
            team = team.index(),
            "player joined"
        );
        Some(JoinOutcome { player_id, state })
    }

    /// Removes the session's player from this game.
    ///
    /// Resolves the team through the players cache, with a linear scan of
    /// both rosters as a fallback for a stale cache. Returns whether a
    /// player was actually removed.
    pub fn leave(&self, session_id: SessionId) -> bool {
        let cached = self.players_cache.lock().unwrap().remove(&session_id);
        if let Some(team) = cached {
            let removed = match team {
                TeamId::First => self.first_team.write().unwrap().remove(&session_id),
                TeamId::Second => self.second_team.write().unwrap().remove(&session_id),
            };
            if let Some(member) = removed {
                tracing::info!(
                    game = %self.name,
                    session = session_id,
                    player = member.player.player_id,
                    "player left"
                );
                return true;
            }
            tracing::warn!(game = %self.name, session = session_id, "players cache was stale");
        }

        if self.first_team.write().unwrap().remove(&session_id).is_some() {
            return true;
        }
        if self.second_team.write().unwrap().remove(&session_id).is_some() {
            return true;
        }
        false
    }

    /// Whether the session currently has a player in this game.
    pub fn is_in_game(&self, session_id: SessionId) -> bool {
        self.players_cache.lock().unwrap().contains_key(&session_id)
    }

    /// Total players across both teams.
    pub fn player_count(&self) -> usize {
        let first = self.first_team.read().unwrap().len();
        let second = self.second_team.read().unwrap().len();
        first + second
    }

    /// Enqueues a clone of the shared package on every member session.
    pub fn broadcast(&self, package: &Package) {
        {
            let first = self.first_team.read().unwrap();
            for member in first.values() {
                member.session.write(package.clone());
            }
        }
        let second = self.second_team.read().unwrap();
        for member in second.values() {
            member.session.write(package.clone());
        }
    }

    /// A value snapshot of the current game state.
    pub fn current_state(&self) -> StateSnapshot {
        let first = self.first_team.read().unwrap();
        let second = self.second_team.read().unwrap();
        self.snapshot_locked(&first, &second)
    }

    /// Builds a snapshot from already-locked rosters (either guard kind),
    /// taking only the rays lock itself. Keeps the snapshot consistent with
    /// whatever roster locks the caller holds.
    fn snapshot_locked(&self, first: &Roster, second: &Roster) -> StateSnapshot {
        let mut players: Vec<PlayerState> =
            first.values().map(|m| m.player.clone()).collect();
        players.extend(second.values().map(|m| m.player.clone()));
        let rays = self.rays.read().unwrap().values().cloned().collect();
        StateSnapshot { players, rays }
    }

    /// Handles one validated package from a session that joined this game.
    pub fn handle_package(
        self: &Arc<Self>,
        server: &Server,
        session: &Session,
        package: ClientPackage,
    ) {
        match package {
            ClientPackage::Update {
                team_id,
                position,
                angle,
            } => self.handle_update(session, team_id, position, angle),
            ClientPackage::Leave => {
                self.leave(session.id());
                if self.settings.broadcast_on_leave {
                    self.broadcast(&outbound::update_broadcast(&self.current_state()));
                }
                server.release_to_unjoined(session, self);
            }
            ClientPackage::Join { .. } => {
                // A session cannot be in two games at once.
                tracing::warn!(
                    game = %self.name,
                    session = session.id(),
                    "join received from a session already in a game"
                );
                session.close_with(outbound::error("Already joined a game."));
            }
        }
    }

    /// Applies an `update` to the sender's player and broadcasts the result.
    ///
    /// Wire positions are floats; the map grid is integral, so both
    /// coordinates are truncated toward zero.
    fn handle_update(&self, session: &Session, team_id: u64, position: [f64; 2], angle: f64) {
        {
            let mut roster = if team_id == 0 {
                self.first_team.write().unwrap()
            } else {
                self.second_team.write().unwrap()
            };
            if let Some(member) = roster.get_mut(&session.id()) {
                member.player.angle = angle;
                member.player.position = Point {
                    x: position[0] as i64,
                    y: position[1] as i64,
                };
            }
        }
        self.broadcast(&outbound::update_broadcast(&self.current_state()));
    }

    /// Test-only ray injection; ray generation itself is gameplay logic
    /// that lives outside this runtime.
    #[cfg(test)]
    pub(crate) fn insert_ray(&self, ray: RayState) {
        self.rays.write().unwrap().insert(ray.id, ray);
    }
}
