//! Identity Tables
//!
//! Node-wide concurrent maps from protocol identifiers to the partition and
//! entities that own them. These are the only session structures touched
//! by more than one partition: lookups may come from anywhere, mutation is
//! serialized per key by the map shards.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::context::{PdnHandle, UeHandle};
use crate::error::{SaegwcError, SaegwcResult};
use crate::types::Imsi;

/// Index of a session-owning partition
pub type PartitionId = usize;

/// Owner of an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub partition: PartitionId,
    pub ue: UeHandle,
    /// Set when the identifier is scoped to a single PDN connection
    pub pdn: Option<PdnHandle>,
}

impl Owner {
    pub fn ue(partition: PartitionId, ue: UeHandle) -> Self {
        Self {
            partition,
            ue,
            pdn: None,
        }
    }

    pub fn pdn(partition: PartitionId, ue: UeHandle, pdn: PdnHandle) -> Self {
        Self {
            partition,
            ue,
            pdn: Some(pdn),
        }
    }
}

/// Identifier spaces held by the tables
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    /// Local control plane TEID, unique
    Teid(u32),
    /// Local PFCP SEID, unique
    Seid(u64),
    /// Gx Session-Id, unique
    GxSession(String),
    /// Subscriber identity, latest owner wins
    Imsi(Imsi),
}

impl IdentityKey {
    /// Whether inserting over an existing entry is an error
    pub fn is_unique(&self) -> bool {
        !matches!(self, IdentityKey::Imsi(_))
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityKey::Teid(teid) => write!(f, "TEID[0x{teid:08x}]"),
            IdentityKey::Seid(seid) => write!(f, "SEID[0x{seid:016x}]"),
            IdentityKey::GxSession(sid) => write!(f, "GX_SESSION[{sid}]"),
            IdentityKey::Imsi(imsi) => write!(f, "IMSI[{imsi}]"),
        }
    }
}

/// Concurrent identity maps
#[derive(Debug, Default)]
pub struct IdentityTables {
    teids: DashMap<u32, Owner>,
    seids: DashMap<u64, Owner>,
    gx_sessions: DashMap<String, Owner>,
    imsis: DashMap<Imsi, Owner>,
}

fn insert_into<K>(map: &DashMap<K, Owner>, key: K, owner: Owner, unique: bool) -> bool
where
    K: Eq + std::hash::Hash,
{
    match map.entry(key) {
        Entry::Occupied(mut entry) => {
            if unique {
                return false;
            }
            entry.insert(owner);
            true
        }
        Entry::Vacant(entry) => {
            entry.insert(owner);
            true
        }
    }
}

fn remove_owned<K>(map: &DashMap<K, Owner>, key: &K, owner: &Owner) -> bool
where
    K: Eq + std::hash::Hash,
{
    map.remove_if(key, |_, current| current == owner).is_some()
}

impl IdentityTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an identifier; fails with `DuplicateKey` in unique spaces
    pub fn insert(&self, key: IdentityKey, owner: Owner) -> SaegwcResult<()> {
        let unique = key.is_unique();
        let label = key.to_string();
        let inserted = match key {
            IdentityKey::Teid(teid) => insert_into(&self.teids, teid, owner, unique),
            IdentityKey::Seid(seid) => insert_into(&self.seids, seid, owner, unique),
            IdentityKey::GxSession(sid) => insert_into(&self.gx_sessions, sid, owner, unique),
            IdentityKey::Imsi(imsi) => insert_into(&self.imsis, imsi, owner, unique),
        };
        if inserted {
            log::trace!("Identity insert {label} -> partition {}", owner.partition);
            Ok(())
        } else {
            Err(SaegwcError::DuplicateKey(label))
        }
    }

    /// Resolve an identifier; absence is a normal outcome
    pub fn lookup(&self, key: &IdentityKey) -> Option<Owner> {
        match key {
            IdentityKey::Teid(teid) => self.teids.get(teid).map(|e| *e.value()),
            IdentityKey::Seid(seid) => self.seids.get(seid).map(|e| *e.value()),
            IdentityKey::GxSession(sid) => self.gx_sessions.get(sid).map(|e| *e.value()),
            IdentityKey::Imsi(imsi) => self.imsis.get(imsi).map(|e| *e.value()),
        }
    }

    /// Remove an identifier; absent keys are a no-op
    pub fn remove(&self, key: &IdentityKey) {
        match key {
            IdentityKey::Teid(teid) => {
                self.teids.remove(teid);
            }
            IdentityKey::Seid(seid) => {
                self.seids.remove(seid);
            }
            IdentityKey::GxSession(sid) => {
                self.gx_sessions.remove(sid);
            }
            IdentityKey::Imsi(imsi) => {
                self.imsis.remove(imsi);
            }
        }
    }

    /// Remove an identifier only while it still points at `owner`
    ///
    /// Used for latest-owner-wins spaces so that tearing down a replaced
    /// context does not erase its successor.
    pub fn remove_if_owned(&self, key: &IdentityKey, owner: &Owner) -> bool {
        match key {
            IdentityKey::Teid(teid) => remove_owned(&self.teids, teid, owner),
            IdentityKey::Seid(seid) => remove_owned(&self.seids, seid, owner),
            IdentityKey::GxSession(sid) => remove_owned(&self.gx_sessions, sid, owner),
            IdentityKey::Imsi(imsi) => remove_owned(&self.imsis, imsi, owner),
        }
    }

    pub fn teid_count(&self) -> usize {
        self.teids.len()
    }

    pub fn seid_count(&self) -> usize {
        self.seids.len()
    }

    pub fn gx_session_count(&self) -> usize {
        self.gx_sessions.len()
    }

    pub fn imsi_count(&self) -> usize {
        self.imsis.len()
    }
}
