//! In-memory session store: ID cookie → session record with TTL.
//!
//! Open-hashed over 1024 buckets with djb2 on the hex ID. Expired records
//! are treated as absent on lookup but never eagerly evicted; the store
//! lives for the process lifetime.

use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use arrayvec::ArrayVec;
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

pub const SESSION_LIFETIME_SECS: u64 = 30 * 60;
pub const MAX_SESSION_DATA: usize = 16;
pub const SESSION_ID_LEN: usize = 32;

const STORE_BUCKETS: usize = 1024;

#[derive(Debug)]
pub struct Session {
    pub id: String,
    /// Unix timestamp; refreshed on every touch.
    pub expires: u64,
    data: ArrayVec<(String, String), MAX_SESSION_DATA>,
}

impl Session {
    pub fn get_value(&self, key: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Update in place if the key exists, append while under the ceiling;
    /// extra keys are silently dropped.
    pub fn set_value(&mut self, key: &str, value: &str) {
        for (k, v) in self.data.iter_mut() {
            if k == key {
                *v = value.to_string();
                return;
            }
        }
        if self.data.len() < MAX_SESSION_DATA {
            self.data.push((key.to_string(), value.to_string()));
        }
    }

    pub fn value_count(&self) -> usize {
        self.data.len()
    }
}

pub type SessionHandle = Rc<RefCell<Session>>;

pub struct SessionStore {
    buckets: Vec<Vec<SessionHandle>>,
}

fn djb2(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_LEN / 2];
    OsRng.fill_bytes(&mut bytes);
    let mut id = String::with_capacity(SESSION_ID_LEN);
    for byte in bytes {
        let _ = write!(id, "{:02x}", byte);
    }
    id
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore {
            buckets: (0..STORE_BUCKETS).map(|_| Vec::new()).collect(),
        }
    }

    /// Return the live session for `session_id`, refreshing its TTL, or mint
    /// a fresh one. Expired records found on the way are skipped.
    pub fn get_or_create(&mut self, session_id: Option<&str>) -> SessionHandle {
        let now = unix_now();

        if let Some(id) = session_id {
            let bucket = &self.buckets[(djb2(id) % STORE_BUCKETS as u64) as usize];
            for session in bucket {
                if session.borrow().id == id {
                    if now < session.borrow().expires {
                        session.borrow_mut().expires = now + SESSION_LIFETIME_SECS;
                        debug!(target: "session", id = %id, "session refreshed");
                        return session.clone();
                    }
                    debug!(target: "session", id = %id, "session expired");
                    break;
                }
            }
        }

        let id = generate_session_id();
        debug!(target: "session", id = %id, "new session");
        let session = Rc::new(RefCell::new(Session {
            id: id.clone(),
            expires: now + SESSION_LIFETIME_SECS,
            data: ArrayVec::new(),
        }));
        self.buckets[(djb2(&id) % STORE_BUCKETS as u64) as usize].push(session.clone());
        session
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_id_is_32_lowercase_hex() {
        let mut store = SessionStore::new();
        let session = store.get_or_create(None);
        let id = session.borrow().id.clone();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn lookup_returns_same_record_and_refreshes() {
        let mut store = SessionStore::new();
        let first = store.get_or_create(None);
        let id = first.borrow().id.clone();
        first.borrow_mut().expires = unix_now() + 5;

        let second = store.get_or_create(Some(&id));
        assert!(Rc::ptr_eq(&first, &second));
        assert_eq!(
            second.borrow().expires,
            unix_now() + SESSION_LIFETIME_SECS
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn expired_session_is_replaced() {
        let mut store = SessionStore::new();
        let first = store.get_or_create(None);
        let id = first.borrow().id.clone();
        first.borrow_mut().expires = unix_now().saturating_sub(1);

        let second = store.get_or_create(Some(&id));
        assert!(!Rc::ptr_eq(&first, &second));
        assert_ne!(second.borrow().id, id);
    }

    #[test]
    fn unknown_id_mints_fresh_session() {
        let mut store = SessionStore::new();
        let session = store.get_or_create(Some("ffffffffffffffffffffffffffffffff"));
        assert_ne!(session.borrow().id, "ffffffffffffffffffffffffffffffff");
    }

    #[test]
    fn ids_are_unique() {
        let mut store = SessionStore::new();
        let a = store.get_or_create(None).borrow().id.clone();
        let b = store.get_or_create(None).borrow().id.clone();
        assert_ne!(a, b);
    }

    #[test]
    fn value_table_updates_in_place_and_caps_at_16() {
        let mut store = SessionStore::new();
        let session = store.get_or_create(None);
        let mut session = session.borrow_mut();

        session.set_value("user", "alice");
        session.set_value("user", "bob");
        assert_eq!(session.get_value("user"), Some("bob"));
        assert_eq!(session.value_count(), 1);

        for i in 0..20 {
            session.set_value(&format!("k{i}"), "v");
        }
        assert_eq!(session.value_count(), MAX_SESSION_DATA);
        assert_eq!(session.get_value("k18"), None);
    }
}
