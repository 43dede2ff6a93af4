//! The process-wide session and game registry.
//!
//! One [`Server`] is constructed at startup and passed as an `Arc` through
//! the call graph. It owns the set of connected sessions, the map of live
//! games, and the correlation between the two, and it routes packages for
//! sessions that have not joined a game yet.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use lasertag_protocol::{outbound, ClientPackage};

use crate::config::Config;
use crate::game::{Game, GameSettings, TeamSelect};
use crate::session::{Dispatch, Session, SessionId};

/// The server registry. See the module docs.
///
/// The three collections are guarded by independent mutexes; none of them
/// is held across a call into a [`Game`], except for the player-count
/// re-check when an empty game is destroyed.
pub struct Server {
    config: Config,
    game_settings: GameSettings,
    /// Live games by name.
    games: Mutex<HashMap<String, Arc<Game>>>,
    /// Session → the game it joined (`None` while unjoined).
    sessions_correlation: Mutex<HashMap<SessionId, Option<String>>>,
    /// Sessions that have not joined any game.
    unidentified_sessions: Mutex<HashMap<SessionId, Session>>,
    /// Once set, session unregistration becomes a no-op so teardown cannot
    /// race the sessions' own destruction.
    has_stopped: AtomicBool,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    pub fn new(config: Config) -> Arc<Self> {
        let game_settings = config.game_settings();
        Arc::new(Self {
            config,
            game_settings,
            games: Mutex::new(HashMap::new()),
            sessions_correlation: Mutex::new(HashMap::new()),
            unidentified_sessions: Mutex::new(HashMap::new()),
            has_stopped: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Root of the cancellation tree; sessions and the acceptor derive
    /// child tokens from it.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// The bound listener address. Only available once the acceptor is up;
    /// with a configured port of 0 this is where the OS-assigned port shows.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap()
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        *self.local_addr.lock().unwrap() = Some(addr);
    }

    /// Registers a new session as unjoined.
    ///
    /// Idempotent: registering the same session twice warns and leaves the
    /// registry unchanged (the session keeps its unjoined delegate).
    pub fn register(&self, session: &Session) {
        let mut unidentified = self.unidentified_sessions.lock().unwrap();
        if unidentified.contains_key(&session.id()) {
            tracing::warn!(session = session.id(), "session is already registered");
            return;
        }
        unidentified.insert(session.id(), session.clone());
        drop(unidentified);

        self.sessions_correlation
            .lock()
            .unwrap()
            .insert(session.id(), None);
        tracing::debug!(session = session.id(), "session registered");
    }

    /// Unregisters a session on its way out.
    ///
    /// A joined session leaves its game; a game whose player count reaches
    /// zero is destroyed. After [`shutdown`](Self::shutdown) this is a
    /// no-op.
    pub fn unregister(&self, session: &Session) {
        if self.has_stopped.load(Ordering::Relaxed) {
            return;
        }

        let correlation = self
            .sessions_correlation
            .lock()
            .unwrap()
            .remove(&session.id());
        let Some(game_name) = correlation else {
            tracing::warn!(session = session.id(), "unregistering an unknown session");
            return;
        };

        match game_name {
            None => {
                self.unidentified_sessions
                    .lock()
                    .unwrap()
                    .remove(&session.id());
            }
            Some(name) => {
                let game = self.games.lock().unwrap().get(&name).cloned();
                if let Some(game) = game {
                    game.leave(session.id());
                    self.drop_game_if_empty(&game);
                }
            }
        }
        tracing::debug!(session = session.id(), "session unregistered");
    }

    /// Handles one validated package from an unjoined session.
    pub fn handle_unjoined(&self, session: &Session, package: ClientPackage) {
        match package {
            ClientPackage::Join { id, nick, game } => {
                self.handle_join(session, id, &nick, &game)
            }
            _ => session.write(outbound::warning("Received an unidentified package.")),
        }
    }

    fn handle_join(&self, session: &Session, id: u64, nick: &str, game_name: &str) {
        let game = {
            let mut games = self.games.lock().unwrap();
            games
                .entry(game_name.to_owned())
                .or_insert_with(|| {
                    tracing::info!(game = game_name, "creating game");
                    Game::new(game_name, self.game_settings.clone())
                })
                .clone()
        };

        // The ack is enqueued by `join` itself, under the roster locks.
        let outcome = game.join(session, nick, TeamSelect::Random, |player_id, state| {
            outbound::join_ack(id, player_id, state)
        });

        match outcome {
            None => session.write(outbound::join_full(id)),
            Some(_) => {
                session.set_dispatch(Dispatch::InGame(game));
                self.unidentified_sessions
                    .lock()
                    .unwrap()
                    .remove(&session.id());
                self.sessions_correlation
                    .lock()
                    .unwrap()
                    .insert(session.id(), Some(game_name.to_owned()));
            }
        }
    }

    /// Hands a session that left its game back to the unjoined phase and
    /// destroys the game if it has no players left.
    pub fn release_to_unjoined(&self, session: &Session, game: &Arc<Game>) {
        session.set_dispatch(Dispatch::Unjoined);
        self.sessions_correlation
            .lock()
            .unwrap()
            .insert(session.id(), None);
        self.unidentified_sessions
            .lock()
            .unwrap()
            .insert(session.id(), session.clone());
        self.drop_game_if_empty(game);
    }

    /// Removes the game from the map if it still is the mapped entry and
    /// its player count is zero. The count is re-checked under the games
    /// lock so a concurrent join of the same name is not clobbered.
    fn drop_game_if_empty(&self, game: &Arc<Game>) {
        let mut games = self.games.lock().unwrap();
        let is_current = games
            .get(game.name())
            .is_some_and(|current| Arc::ptr_eq(current, game));
        if is_current && game.player_count() == 0 {
            games.remove(game.name());
            tracing::info!(game = game.name(), "game has no more players, removing");
        }
    }

    /// Begins teardown: unregistration becomes a no-op and every task
    /// derived from the cancellation tree winds down.
    pub fn shutdown(&self) {
        tracing::info!("server shutting down");
        self.has_stopped.store(true, Ordering::Relaxed);
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn game(&self, name: &str) -> Option<Arc<Game>> {
        self.games.lock().unwrap().get(name).cloned()
    }

    #[cfg(test)]
    pub(crate) fn is_unidentified(&self, session: &Session) -> bool {
        self.unidentified_sessions
            .lock()
            .unwrap()
            .contains_key(&session.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn server() -> Arc<Server> {
        Server::new(Config::default())
    }

    fn join_pkg(id: u64, game: &str) -> ClientPackage {
        ClientPackage::Join {
            id,
            nick: "nick".into(),
            game: game.into(),
        }
    }

    fn first_frame(session: &Session) -> Value {
        let frames = session.drain_queued();
        assert!(!frames.is_empty(), "expected a queued frame");
        serde_json::from_str(frames[0].as_str()).unwrap()
    }

    #[test]
    fn register_is_idempotent() {
        let server = server();
        let session = Session::detached();
        server.register(&session);
        server.register(&session);
        assert!(server.is_unidentified(&session));
        assert!(matches!(session.dispatch(), Dispatch::Unjoined));
    }

    #[test]
    fn join_creates_game_and_swaps_delegate() {
        let server = server();
        let session = Session::detached();
        server.register(&session);

        server.handle_unjoined(&session, join_pkg(7, "G"));

        let ack = first_frame(&session);
        assert_eq!(ack["id"], 7);
        assert_eq!(ack["result"], "joined");
        assert_eq!(ack["my_id"], 0);
        assert_eq!(ack["players"].as_array().unwrap().len(), 1);
        assert_eq!(ack["rays"], serde_json::json!([]));

        assert!(matches!(session.dispatch(), Dispatch::InGame(_)));
        assert!(!server.is_unidentified(&session));
        assert!(server.game("G").is_some());
    }

    #[test]
    fn join_full_game_replies_full_and_stays_unjoined() {
        let server = server();

        // Ten joiners fill both teams of G.
        for _ in 0..10 {
            let s = Session::detached();
            server.register(&s);
            server.handle_unjoined(&s, join_pkg(1, "G"));
        }
        let game = server.game("G").unwrap();
        assert_eq!(game.player_count(), 10);

        let eleventh = Session::detached();
        server.register(&eleventh);
        server.handle_unjoined(&eleventh, join_pkg(42, "G"));

        let reply = first_frame(&eleventh);
        assert_eq!(reply, serde_json::json!({"id": 42, "result": "full"}));
        assert!(matches!(eleventh.dispatch(), Dispatch::Unjoined));
        assert!(server.is_unidentified(&eleventh));
        assert_eq!(game.player_count(), 10);
    }

    #[test]
    fn non_join_while_unjoined_draws_a_warning() {
        let server = server();
        let session = Session::detached();
        server.register(&session);

        server.handle_unjoined(&session, ClientPackage::Leave);

        let warning = first_frame(&session);
        assert_eq!(warning["type"], "warning");
        assert_eq!(warning["closed"], false);
    }

    #[test]
    fn unregister_unjoined_session_removes_it() {
        let server = server();
        let session = Session::detached();
        server.register(&session);
        server.unregister(&session);
        assert!(!server.is_unidentified(&session));
        // A second unregister warns but does nothing.
        server.unregister(&session);
    }

    #[test]
    fn unregister_last_player_destroys_the_game() {
        let server = server();
        let session = Session::detached();
        server.register(&session);
        server.handle_unjoined(&session, join_pkg(1, "G"));
        assert!(server.game("G").is_some());

        server.unregister(&session);
        assert!(server.game("G").is_none());
    }

    #[test]
    fn unregister_keeps_game_with_remaining_players() {
        let server = server();
        let a = Session::detached();
        let b = Session::detached();
        server.register(&a);
        server.register(&b);
        server.handle_unjoined(&a, join_pkg(1, "G"));
        server.handle_unjoined(&b, join_pkg(2, "G"));

        server.unregister(&a);
        let game = server.game("G").expect("game should survive");
        assert_eq!(game.player_count(), 1);
    }

    #[test]
    fn protocol_leave_resets_session_to_unjoined_and_destroys_empty_game() {
        let server = server();
        let session = Session::detached();
        server.register(&session);
        server.handle_unjoined(&session, join_pkg(1, "G"));
        session.drain_queued();

        let Dispatch::InGame(game) = session.dispatch() else {
            panic!("session should be in game");
        };
        game.handle_package(&server, &session, ClientPackage::Leave);

        assert!(matches!(session.dispatch(), Dispatch::Unjoined));
        assert!(server.is_unidentified(&session));
        assert!(server.game("G").is_none());

        // The session can join a different game afterwards.
        server.handle_unjoined(&session, join_pkg(2, "H"));
        let ack = first_frame(&session);
        assert_eq!(ack["result"], "joined");
        assert!(server.game("H").is_some());
    }

    #[test]
    fn leave_broadcasts_state_to_remaining_players() {
        let server = server();
        let a = Session::detached();
        let b = Session::detached();
        server.register(&a);
        server.register(&b);
        server.handle_unjoined(&a, join_pkg(1, "G"));
        server.handle_unjoined(&b, join_pkg(2, "G"));
        a.drain_queued();
        b.drain_queued();

        let Dispatch::InGame(game) = b.dispatch() else {
            panic!("session should be in game");
        };
        game.handle_package(&server, &b, ClientPackage::Leave);

        let update = first_frame(&a);
        assert_eq!(update["type"], "update");
        assert_eq!(update["players"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn duplicate_join_while_in_game_closes_the_session() {
        let server = server();
        let session = Session::detached();
        server.register(&session);
        server.handle_unjoined(&session, join_pkg(1, "G"));
        session.drain_queued();

        let Dispatch::InGame(game) = session.dispatch() else {
            panic!("session should be in game");
        };
        game.handle_package(&server, &session, join_pkg(2, "G"));

        assert!(session.is_closing());
        let frames = session.drain_queued();
        assert_eq!(frames.len(), 1);
        let error: Value = serde_json::from_str(frames[0].as_str()).unwrap();
        assert_eq!(error["type"], "error");
        assert_eq!(error["closed"], true);
    }

    #[test]
    fn unregister_after_shutdown_is_a_noop() {
        let server = server();
        let session = Session::detached();
        server.register(&session);
        server.handle_unjoined(&session, join_pkg(1, "G"));

        server.shutdown();
        server.unregister(&session);

        // Teardown left the maps alone.
        assert!(server.game("G").is_some());
    }
}
