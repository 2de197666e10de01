//! Per-application session store.
//!
//! Two levels of locking: the store guards its id -> session map, and every session guards its own
//! attribute state. Unrelated sessions never contend on the same attribute lock.
//!
//! A session is eligible for expiry only when it is no longer new, no in-flight request holds it,
//! and its idle time exceeds a positive max-inactive interval.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::chrono::prelude::*;
use crate::core::error::SessionError;
use crate::hashbrown::HashMap;
use crate::parking_lot::{Mutex, RwLock};
use crate::rand::{distributions::Alphanumeric, thread_rng, Rng};
use crate::support::debug::{self, InfoLevel};

const ID_LENGTH: usize = 32;
const SNAPSHOT_VERSION: u32 = 1;
const SESSION_FILE_EXT: &str = "session";

/// Notified about session lifecycle and attribute changes. Every method has an empty default.
pub trait SessionListener: Send + Sync {
    fn session_created(&self, _session: &Session) {}
    fn session_destroyed(&self, _session: &Session) {}
    fn session_did_activate(&self, _session: &Session) {}
    fn session_will_passivate(&self, _session: &Session) {}
    fn attribute_added(&self, _session: &Session, _name: &str, _value: &Value) {}
    fn attribute_replaced(&self, _session: &Session, _name: &str, _old_value: &Value) {}
    fn attribute_removed(&self, _session: &Session, _name: &str, _value: &Value) {}
}

/// Finds sessions owned by other nodes. The payload is whatever the application's
/// [`SessionCodec`] produced on the peer.
pub trait Cluster: Send + Sync {
    fn find_session_elsewhere(&self, session_id: &str, app: &str) -> io::Result<Option<Vec<u8>>>;
}

/// Turns a session, attribute values included, into bytes and back.
pub trait SessionCodec: Send + Sync {
    fn encode(&self, snapshot: &SessionSnapshot) -> Result<Vec<u8>, SessionError>;
    fn decode(&self, bytes: &[u8]) -> Result<SessionSnapshot, SessionError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub id: String,
    pub created: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub max_inactive_secs: i64,
    pub is_new: bool,
    pub attributes: BTreeMap<String, Value>,
}

/// Versioned JSON encoding of a [`SessionSnapshot`].
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl SessionCodec for JsonCodec {
    fn encode(&self, snapshot: &SessionSnapshot) -> Result<Vec<u8>, SessionError> {
        Ok(serde_json::to_vec(snapshot)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<SessionSnapshot, SessionError> {
        let snapshot: SessionSnapshot = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SessionError::VersionMismatch(snapshot.version));
        }

        Ok(snapshot)
    }
}

type Listeners = Arc<Vec<Arc<dyn SessionListener>>>;
type Attributes = HashMap<String, Value>;

struct SessionState {
    attributes: Attributes,
    last_accessed: DateTime<Utc>,
    max_inactive: i64,
    is_new: bool,
    invalidated: bool,
    in_use: usize,
}

impl SessionState {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.max_inactive > 0
            && now.signed_duration_since(self.last_accessed).num_milliseconds()
                > self.max_inactive * 1000
    }
}

enum Claim {
    Claimed,
    Expired,
    Gone,
}

pub struct Session {
    id: String,
    created: DateTime<Utc>,
    state: Mutex<SessionState>,
    listeners: Listeners,
}

impl Session {
    fn new(id: String, max_inactive: i64, listeners: Listeners) -> Self {
        let now = Utc::now();

        Session {
            id,
            created: now,
            state: Mutex::new(SessionState {
                attributes: HashMap::new(),
                last_accessed: now,
                max_inactive,
                is_new: true,
                invalidated: false,
                in_use: 0,
            }),
            listeners,
        }
    }

    fn from_snapshot(snapshot: SessionSnapshot, listeners: Listeners) -> Self {
        Session {
            id: snapshot.id,
            created: snapshot.created,
            state: Mutex::new(SessionState {
                attributes: snapshot.attributes.into_iter().collect(),
                last_accessed: snapshot.last_accessed,
                max_inactive: snapshot.max_inactive_secs,
                is_new: snapshot.is_new,
                invalidated: false,
                in_use: 0,
            }),
            listeners,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_valid(&self) -> bool {
        !self.state.lock().invalidated
    }

    pub fn creation_time(&self) -> Result<DateTime<Utc>, SessionError> {
        self.read(|_| self.created)
    }

    pub fn last_accessed_time(&self) -> Result<DateTime<Utc>, SessionError> {
        self.read(|state| state.last_accessed)
    }

    pub fn is_new(&self) -> Result<bool, SessionError> {
        self.read(|state| state.is_new)
    }

    pub fn max_inactive_interval(&self) -> i64 {
        self.state.lock().max_inactive
    }

    /// Seconds; zero or negative means the session never expires.
    pub fn set_max_inactive_interval(&self, secs: i64) {
        self.state.lock().max_inactive = secs;
    }

    /// The attribute decoded as `T`. A stored value of another shape is a codec error.
    pub fn attribute<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, SessionError> {
        match self.attribute_value(name)? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn attribute_value(&self, name: &str) -> Result<Option<Value>, SessionError> {
        self.read(|state| state.attributes.get(name).cloned())
    }

    pub fn attribute_names(&self) -> Result<Vec<String>, SessionError> {
        self.read(|state| {
            let mut names: Vec<String> = state.attributes.keys().cloned().collect();
            names.sort();
            names
        })
    }

    /// Store any serializable value; returns the value it replaced.
    pub fn set_attribute<T: Serialize + ?Sized>(
        &self,
        name: &str,
        value: &T,
    ) -> Result<Option<Value>, SessionError> {
        let value = serde_json::to_value(value)?;

        let previous = {
            let mut state = self.state.lock();
            if state.invalidated {
                return Err(SessionError::Invalidated(self.id.clone()));
            }

            state.attributes.insert(name.to_owned(), value.clone())
        };

        // now notify without holding the session lock
        for listener in self.listeners.iter() {
            match previous.as_ref() {
                Some(old) => listener.attribute_replaced(self, name, old),
                None => listener.attribute_added(self, name, &value),
            }
        }

        Ok(previous)
    }

    pub fn remove_attribute(&self, name: &str) -> Result<Option<Value>, SessionError> {
        let removed = {
            let mut state = self.state.lock();
            if state.invalidated {
                return Err(SessionError::Invalidated(self.id.clone()));
            }

            state.attributes.remove(name)
        };

        if let Some(value) = removed.as_ref() {
            for listener in self.listeners.iter() {
                listener.attribute_removed(self, name, value);
            }
        }

        Ok(removed)
    }

    #[inline]
    pub fn in_use_count(&self) -> usize {
        self.state.lock().in_use
    }

    pub(crate) fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state.lock().is_expired(now)
    }

    /// Count one more request as a user, unless the session is gone or sat idle past its
    /// interval. Checked and counted under the session lock, so a sweep cannot slip in between.
    fn claim(&self, now: DateTime<Utc>) -> Claim {
        let mut state = self.state.lock();
        if state.invalidated {
            return Claim::Gone;
        }

        if state.in_use == 0 && state.is_expired(now) {
            return Claim::Expired;
        }

        state.in_use += 1;
        state.last_accessed = now;
        Claim::Claimed
    }

    /// Drop a claim without ending a request, e.g. when the request already held the session.
    pub(crate) fn release_claim(&self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
    }

    /// The request that claimed this session is done with it.
    pub(crate) fn request_finished(&self) {
        let mut state = self.state.lock();
        state.in_use = state.in_use.saturating_sub(1);
        state.is_new = false;
        state.last_accessed = Utc::now();
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();

        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            id: self.id.clone(),
            created: self.created,
            last_accessed: state.last_accessed,
            max_inactive_secs: state.max_inactive,
            is_new: state.is_new,
            attributes: state
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn read<T, F: FnOnce(&SessionState) -> T>(&self, f: F) -> Result<T, SessionError> {
        let state = self.state.lock();
        if state.invalidated {
            return Err(SessionError::Invalidated(self.id.clone()));
        }

        Ok(f(&state))
    }

    fn mark_invalidated(&self) -> Result<Attributes, SessionError> {
        let mut state = self.state.lock();
        if state.invalidated {
            return Err(SessionError::AlreadyInvalidated(self.id.clone()));
        }

        state.invalidated = true;
        Ok(std::mem::take(&mut state.attributes))
    }

    /// Invalidate only if nothing holds the session and it expired. With `spare_new`, sessions
    /// no request has finished with yet are left alone.
    fn invalidate_if_idle(&self, now: DateTime<Utc>, spare_new: bool) -> Option<Attributes> {
        let mut state = self.state.lock();
        if state.invalidated || state.in_use > 0 || (spare_new && state.is_new) {
            return None;
        }

        if !state.is_expired(now) {
            return None;
        }

        state.invalidated = true;
        Some(std::mem::take(&mut state.attributes))
    }
}

pub struct SessionStore {
    app_name: String,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    default_max_inactive: i64,
    listeners: Listeners,
    cluster: Option<Arc<dyn Cluster>>,
    codec: Arc<dyn SessionCodec>,
}

impl SessionStore {
    /// `timeout_minutes` of `None` creates sessions that never expire. A `cluster` is consulted
    /// only when the application is distributable, so pass `None` otherwise.
    pub fn new(
        app_name: &str,
        timeout_minutes: Option<i64>,
        listeners: Vec<Arc<dyn SessionListener>>,
        cluster: Option<Arc<dyn Cluster>>,
        codec: Arc<dyn SessionCodec>,
    ) -> Self {
        SessionStore {
            app_name: app_name.to_owned(),
            sessions: RwLock::new(HashMap::new()),
            default_max_inactive: timeout_minutes.map_or(-1, |minutes| minutes * 60),
            listeners: Arc::new(listeners),
            cluster,
            codec,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Create a session with a fresh random id.
    pub fn create(&self) -> Arc<Session> {
        self.insert_new(None, false)
    }

    /// Create a session under `id`, replacing any session already stored there.
    pub fn create_with_id(&self, id: &str) -> Arc<Session> {
        self.insert_new(Some(id), false)
    }

    /// Create a session already claimed by the calling request.
    pub(crate) fn create_claimed(&self) -> Arc<Session> {
        self.insert_new(None, true)
    }

    fn insert_new(&self, id: Option<&str>, claimed: bool) -> Arc<Session> {
        let session = {
            let mut sessions = self.sessions.write();

            let id = match id {
                Some(id) => id.to_owned(),
                None => loop {
                    let id = generate_id();
                    if !sessions.contains_key(&id) {
                        break id;
                    }
                },
            };

            let session = Arc::new(Session::new(
                id.clone(),
                self.default_max_inactive,
                Arc::clone(&self.listeners),
            ));

            if claimed {
                session.state.lock().in_use = 1;
            }

            sessions.insert(id, Arc::clone(&session));
            session
        };

        for listener in self.listeners.iter() {
            listener.session_created(&session);
        }

        session
    }

    /// Local lookup first; then, unless `local_only`, ask the cluster and adopt what it finds.
    /// An expired, unused local session is invalidated and reported as absent.
    pub fn get(&self, id: &str, local_only: bool) -> Option<Arc<Session>> {
        self.lookup(id, local_only, false)
    }

    /// Like [`get`](Self::get), and the session comes back counted as in use by the caller.
    /// The caller ends the claim with `request_finished` or `release_claim`.
    pub(crate) fn claim(&self, id: &str, local_only: bool) -> Option<Arc<Session>> {
        self.lookup(id, local_only, true)
    }

    fn lookup(&self, id: &str, local_only: bool, claim: bool) -> Option<Arc<Session>> {
        let now = Utc::now();

        let expired = {
            let sessions = self.sessions.read();
            match sessions.get(id) {
                Some(session) if claim => match session.claim(now) {
                    Claim::Claimed => return Some(Arc::clone(session)),
                    Claim::Expired => Some(Arc::clone(session)),
                    Claim::Gone => return None,
                },
                Some(session) => {
                    if session.in_use_count() == 0 && session.is_expired(now) {
                        Some(Arc::clone(session))
                    } else {
                        return Some(Arc::clone(session));
                    }
                }
                None => None,
            }
        };

        if let Some(session) = expired {
            if let Some(attributes) = session.invalidate_if_idle(now, false) {
                self.finish_invalidation(&session, attributes);
            }
            return None;
        }

        if local_only {
            return None;
        }

        self.find_in_cluster(id, claim)
    }

    fn find_in_cluster(&self, id: &str, claim: bool) -> Option<Arc<Session>> {
        let cluster = self.cluster.as_ref()?;

        let bytes = match cluster.find_session_elsewhere(id, &self.app_name) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                debug::print(
                    &format!("Cluster session lookup for {} failed: {}", id, err),
                    InfoLevel::Warning,
                );
                return None;
            }
        };

        let snapshot = match self.codec.decode(&bytes) {
            Ok(snapshot) if snapshot.id == id => snapshot,
            Ok(_) => {
                debug::print("Cluster returned a session with a different id", InfoLevel::Warning);
                return None;
            }
            Err(err) => {
                debug::print(
                    &format!("Unable to decode session {} from the cluster: {}", id, err),
                    InfoLevel::Warning,
                );
                return None;
            }
        };

        Some(self.adopt(snapshot, claim))
    }

    fn adopt(&self, snapshot: SessionSnapshot, claimed: bool) -> Arc<Session> {
        let session = Arc::new(Session::from_snapshot(snapshot, Arc::clone(&self.listeners)));
        if claimed {
            let mut state = session.state.lock();
            state.in_use = 1;
            state.last_accessed = Utc::now();
        }

        self.sessions
            .write()
            .insert(session.id.clone(), Arc::clone(&session));

        for listener in self.listeners.iter() {
            listener.session_did_activate(&session);
        }

        session
    }

    /// Invalidate a session. A second call for the same session fails with
    /// [`SessionError::AlreadyInvalidated`].
    pub fn invalidate(&self, session: &Session) -> Result<(), SessionError> {
        let attributes = session.mark_invalidated()?;
        self.finish_invalidation(session, attributes);
        Ok(())
    }

    fn finish_invalidation(&self, session: &Session, attributes: Attributes) {
        for listener in self.listeners.iter().rev() {
            listener.session_destroyed(session);
        }

        for (name, value) in attributes.iter() {
            for listener in self.listeners.iter() {
                listener.attribute_removed(session, name, value);
            }
        }

        self.forget(session);
    }

    // drop the map entry, unless it has been replaced by another session under the same id
    fn forget(&self, session: &Session) {
        let mut sessions = self.sessions.write();
        if let Some(stored) = sessions.get(&session.id) {
            if std::ptr::eq(Arc::as_ptr(stored), session) {
                sessions.remove(&session.id);
            }
        }
    }

    /// Returns `false` when no local session carries `id`.
    pub fn invalidate_by_id(&self, id: &str) -> Result<bool, SessionError> {
        let stored = self.sessions.read().get(id).cloned();
        match stored {
            Some(session) => self.invalidate(&session).map(|_| true),
            None => Ok(false),
        }
    }

    /// Invalidate every expiry-eligible session; returns how many went away.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let all: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();

        let mut count = 0;
        for session in all {
            // eligibility is decided under the session lock, where requests claim it
            if let Some(attributes) = session.invalidate_if_idle(now, true) {
                self.finish_invalidation(&session, attributes);
                count += 1;
            }
        }

        if count > 0 {
            debug::print(
                &format!("Expired {} session(s) in {}", count, self.app_name),
                InfoLevel::Info,
            );
        }

        count
    }

    pub fn invalidate_all(&self) {
        let all: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        for session in all {
            let _ = self.invalidate(&session);
        }
    }

    /// Passivate and write every session to `dir`, one file each. A session leaves memory only
    /// once its file is written. Sessions that cannot be written are invalidated, so their
    /// listeners still hear about it, and the first such failure is returned.
    pub fn persist(&self, dir: &Path) -> Result<usize, SessionError> {
        if let Err(err) = fs::create_dir_all(dir) {
            self.invalidate_all();
            return Err(err.into());
        }

        let all: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        let mut count = 0;
        let mut failure = None;

        for session in all {
            match self.persist_one(dir, &session) {
                Ok(()) => {
                    self.forget(&session);
                    count += 1;
                }
                Err(err) => {
                    debug::print(
                        &format!("Unable to persist session {}: {}", session.id, err),
                        InfoLevel::Warning,
                    );
                    let _ = self.invalidate(&session);
                    failure.get_or_insert(err);
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(count),
        }
    }

    fn persist_one(&self, dir: &Path, session: &Session) -> Result<(), SessionError> {
        if !is_safe_id(&session.id) {
            return Err(SessionError::Codec(format!("unsafe session id {:?}", session.id)));
        }

        for listener in self.listeners.iter() {
            listener.session_will_passivate(session);
        }

        let bytes = self.codec.encode(&session.snapshot())?;
        fs::write(dir.join(format!("{}.{}", session.id, SESSION_FILE_EXT)), bytes)?;
        Ok(())
    }

    /// Read back sessions written by [`persist`](Self::persist). A file is removed once it
    /// decodes; sessions that expired while stored are discarded. Files that cannot be read or
    /// decoded are logged and left in place.
    pub fn load(&self, dir: &Path) -> Result<usize, SessionError> {
        if !dir.is_dir() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut count = 0;

        for entry in fs::read_dir(dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    debug::print(
                        &format!("Unable to list a session file: {}", err),
                        InfoLevel::Warning,
                    );
                    continue;
                }
            };

            if path.extension().and_then(|ext| ext.to_str()) != Some(SESSION_FILE_EXT) {
                continue;
            }

            let snapshot = match fs::read(&path)
                .map_err(SessionError::from)
                .and_then(|bytes| self.codec.decode(&bytes))
            {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    debug::print(
                        &format!("Skipping unreadable session file {:?}: {}", path, err),
                        InfoLevel::Warning,
                    );
                    continue;
                }
            };

            if let Err(err) = fs::remove_file(&path) {
                debug::print(
                    &format!("Unable to remove session file {:?}: {}", path, err),
                    InfoLevel::Warning,
                );
            }

            if snapshot_is_expired(&snapshot, now) {
                continue;
            }

            self.adopt(snapshot, false);
            count += 1;
        }

        Ok(count)
    }
}

fn snapshot_is_expired(snapshot: &SessionSnapshot, now: DateTime<Utc>) -> bool {
    snapshot.max_inactive_secs > 0
        && now.signed_duration_since(snapshot.last_accessed).num_milliseconds()
            > snapshot.max_inactive_secs * 1000
}

fn generate_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ID_LENGTH)
        .map(char::from)
        .collect()
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}
