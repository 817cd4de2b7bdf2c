//! Access scope resolution.
//!
//! A `Scope` carries two halves that must travel together for a whole
//! counting session:
//! - the owner narrowing pushed into every store query (`server_filter`)
//! - the per-record partner predicate evaluated client-side (`includes`),
//!   because partner affiliation is not a queryable field on a case
//!
//! The Initial Aggregator and the Reconciler share one `Arc<Scope>`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::CaseRecord;
use crate::store::{CaseFilter, CaseStore, ClinicInfo, OwnerFilter, StoreError};

// ═══════════════════════════════════════════════════════════
// Caller
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Sees every case.
    Admin,
    /// Sees cases where they are the primary assigned doctor.
    Doctor,
    /// Sees cases assigned to them for pharmacist review.
    Pharmacist,
    /// Sees every case of one partner organisation.
    Partner,
    /// Sees cases they created.
    Agent,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Doctor => "doctor",
            Self::Pharmacist => "pharmacist",
            Self::Partner => "partner",
            Self::Agent => "agent",
        }
    }
}

/// Who is asking, as resolved by the (external) authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Caller {
    pub role: Role,
    pub user_id: String,
    /// Partner filter. Required for `Partner`; optional narrowing for others.
    pub partner: Option<String>,
}

impl Caller {
    pub fn new(role: Role, user_id: impl Into<String>) -> Self {
        Self {
            role,
            user_id: user_id.into(),
            partner: None,
        }
    }

    pub fn with_partner(mut self, partner: impl Into<String>) -> Self {
        self.partner = Some(partner.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════
// ClinicDirectory
// ═══════════════════════════════════════════════════════════

/// Loaded once and shared behind an `Arc`; never mutated afterwards, so
/// any number of sessions read it without locking.
#[derive(Debug, Clone, Default)]
pub struct ClinicDirectory {
    clinics: HashMap<String, ClinicInfo>,
}

impl ClinicDirectory {
    pub fn from_entries(entries: impl IntoIterator<Item = ClinicInfo>) -> Self {
        Self {
            clinics: entries
                .into_iter()
                .map(|info| (info.clinic_id.clone(), info))
                .collect(),
        }
    }

    /// Resolve `clinic_ids` through the store in batches of `batch_size`.
    ///
    /// Duplicate and blank ids are dropped before querying. Unknown ids are
    /// simply missing from the directory.
    pub async fn load<S: CaseStore>(
        store: &S,
        clinic_ids: &[String],
        batch_size: usize,
    ) -> Result<Self, StoreError> {
        let mut seen = HashSet::new();
        let mut unique: Vec<String> = Vec::new();
        for id in clinic_ids {
            if !id.trim().is_empty() && seen.insert(id.as_str()) {
                unique.push(id.clone());
            }
        }

        let mut clinics = HashMap::with_capacity(unique.len());
        for chunk in unique.chunks(batch_size.max(1)) {
            for info in store.lookup_clinics(chunk).await? {
                clinics.insert(info.clinic_id.clone(), info);
            }
        }

        tracing::debug!(requested = unique.len(), resolved = clinics.len(), "Clinic directory loaded");
        Ok(Self { clinics })
    }

    pub fn get(&self, clinic_id: &str) -> Option<&ClinicInfo> {
        self.clinics.get(clinic_id)
    }

    pub fn partner_for(&self, clinic_id: &str) -> Option<&str> {
        self.get(clinic_id).map(|info| info.partner_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.clinics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clinics.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════
// Scope
// ═══════════════════════════════════════════════════════════

/// Structural identity of a scope. Two callers with equal keys see
/// exactly the same records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScopeKey {
    pub role: Role,
    pub owner: OwnerFilter,
    pub partner: Option<String>,
}

impl ScopeKey {
    fn owner_id(&self) -> Option<&str> {
        self.owner
            .assigned_doctor
            .as_deref()
            .or(self.owner.pharmacist_id.as_deref())
            .or(self.owner.created_by.as_deref())
    }
}

/// `role:owner:partner`, `*` for an unset part. Separators inside ids are
/// backslash-escaped so distinct keys never render the same.
impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.role.as_str())?;
        for part in [self.owner_id(), self.partner.as_deref()] {
            f.write_str(":")?;
            match part {
                None => f.write_str("*")?,
                Some(value) => {
                    for c in value.chars() {
                        if matches!(c, '\\' | ':' | '*') {
                            f.write_str("\\")?;
                        }
                        write!(f, "{c}")?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Scope {
    key: ScopeKey,
    role: Role,
    owner: OwnerFilter,
    partner: Option<String>,
    clinics: Arc<ClinicDirectory>,
}

impl Scope {
    pub fn key(&self) -> &ScopeKey {
        &self.key
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn partner(&self) -> Option<&str> {
        self.partner.as_deref()
    }

    pub fn owner(&self) -> &OwnerFilter {
        &self.owner
    }

    /// Base query narrowing. Never narrows by partner.
    pub fn server_filter(&self) -> CaseFilter {
        CaseFilter::owned(self.owner.clone())
    }

    /// Client-side predicate: does this record count for the scope at all?
    pub fn includes(&self, record: &CaseRecord) -> bool {
        if !self.owner.matches(record) {
            return false;
        }
        match &self.partner {
            None => true,
            Some(wanted) => self.partner_of(record).is_some_and(|p| p == wanted.as_str()),
        }
    }

    pub fn excludes(&self, record: &CaseRecord) -> bool {
        !self.includes(record)
    }

    /// The record's own `partnerName` wins over the clinic mapping.
    fn partner_of<'a>(&'a self, record: &'a CaseRecord) -> Option<&'a str> {
        record.partner_name.as_deref().or_else(|| {
            record
                .clinic_id
                .as_deref()
                .and_then(|id| self.clinics.partner_for(id))
        })
    }
}

/// Build the scope for `caller`.
pub fn resolve_scope(caller: &Caller, clinics: Arc<ClinicDirectory>) -> Result<Scope, ScopeError> {
    let user_id = caller.user_id.trim();
    let partner = caller
        .partner
        .as_deref()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string);

    let owner = match caller.role {
        Role::Admin | Role::Partner => OwnerFilter::default(),
        Role::Doctor => OwnerFilter {
            assigned_doctor: Some(require_user(user_id, caller.role)?),
            ..OwnerFilter::default()
        },
        Role::Pharmacist => OwnerFilter {
            pharmacist_id: Some(require_user(user_id, caller.role)?),
            ..OwnerFilter::default()
        },
        Role::Agent => OwnerFilter {
            created_by: Some(require_user(user_id, caller.role)?),
            ..OwnerFilter::default()
        },
    };

    if caller.role == Role::Partner && partner.is_none() {
        return Err(ScopeError::MissingPartner);
    }

    let key = ScopeKey {
        role: caller.role,
        owner: owner.clone(),
        partner: partner.clone(),
    };

    Ok(Scope {
        key,
        role: caller.role,
        owner,
        partner,
        clinics,
    })
}

fn require_user(user_id: &str, role: Role) -> Result<String, ScopeError> {
    if user_id.is_empty() {
        Err(ScopeError::MissingUserId { role })
    } else {
        Ok(user_id.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScopeError {
    #[error("Role {role:?} requires a user id")]
    MissingUserId { role: Role },
    #[error("Partner role requires a partner filter")]
    MissingPartner,
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCaseStore;
    use chrono::Utc;

    fn directory() -> Arc<ClinicDirectory> {
        Arc::new(ClinicDirectory::from_entries([
            ClinicInfo {
                clinic_id: "k1".into(),
                partner_name: "Acme".into(),
                clinic_code: None,
            },
            ClinicInfo {
                clinic_id: "k2".into(),
                partner_name: "Globex".into(),
                clinic_code: None,
            },
        ]))
    }

    fn record(clinic: &str) -> CaseRecord {
        let mut r = CaseRecord::new("c1", Utc::now());
        r.clinic_id = Some(clinic.into());
        r.assigned_doctor = Some("doc-1".into());
        r
    }

    #[test]
    fn admin_sees_everything() {
        let scope = resolve_scope(&Caller::new(Role::Admin, "root"), directory()).unwrap();
        assert!(scope.server_filter().owner.is_unrestricted());
        assert!(scope.includes(&record("k1")));
        assert!(scope.includes(&record("unknown")));
    }

    #[test]
    fn doctor_narrows_server_side() {
        let scope = resolve_scope(&Caller::new(Role::Doctor, "doc-1"), directory()).unwrap();
        assert_eq!(scope.server_filter().owner.assigned_doctor.as_deref(), Some("doc-1"));
        assert!(scope.includes(&record("k1")));

        let other = resolve_scope(&Caller::new(Role::Doctor, "doc-2"), directory()).unwrap();
        assert!(other.excludes(&record("k1")));
    }

    #[test]
    fn pharmacist_and_agent_narrow_their_own_fields() {
        let ph = resolve_scope(&Caller::new(Role::Pharmacist, "ph-1"), directory()).unwrap();
        assert_eq!(ph.owner().pharmacist_id.as_deref(), Some("ph-1"));

        let agent = resolve_scope(&Caller::new(Role::Agent, "ag-1"), directory()).unwrap();
        assert_eq!(agent.owner().created_by.as_deref(), Some("ag-1"));
    }

    #[test]
    fn partner_filter_uses_clinic_mapping() {
        let caller = Caller::new(Role::Partner, "p-user").with_partner("Acme");
        let scope = resolve_scope(&caller, directory()).unwrap();
        assert!(scope.server_filter().owner.is_unrestricted());
        assert!(scope.includes(&record("k1")));
        assert!(scope.excludes(&record("k2")));
        assert!(scope.excludes(&record("unknown")), "unmapped clinic never matches a partner");
    }

    #[test]
    fn record_partner_name_wins_over_mapping() {
        let caller = Caller::new(Role::Partner, "p-user").with_partner("Globex");
        let scope = resolve_scope(&caller, directory()).unwrap();
        let mut r = record("k1");
        r.partner_name = Some("Globex".into());
        assert!(scope.includes(&r));
    }

    #[test]
    fn partner_role_requires_partner() {
        let err = resolve_scope(&Caller::new(Role::Partner, "p"), directory()).unwrap_err();
        assert!(matches!(err, ScopeError::MissingPartner));

        let blank = Caller::new(Role::Partner, "p").with_partner("  ");
        assert!(resolve_scope(&blank, directory()).is_err());
    }

    #[test]
    fn owner_roles_require_user_id() {
        let err = resolve_scope(&Caller::new(Role::Doctor, " "), directory()).unwrap_err();
        assert!(matches!(err, ScopeError::MissingUserId { role: Role::Doctor }));
    }

    #[test]
    fn keys_distinguish_scopes() {
        let a = resolve_scope(&Caller::new(Role::Admin, "x"), directory()).unwrap();
        let b = resolve_scope(&Caller::new(Role::Admin, "y"), directory()).unwrap();
        let c = resolve_scope(&Caller::new(Role::Admin, "x").with_partner("Acme"), directory()).unwrap();
        let d = resolve_scope(&Caller::new(Role::Doctor, "x"), directory()).unwrap();

        assert_eq!(a.key(), b.key(), "admin scope does not depend on who asks");
        assert_ne!(a.key(), c.key());
        assert_ne!(a.key(), d.key());
        assert_eq!(d.key().to_string(), "doctor:x:*");
    }

    #[test]
    fn separators_inside_ids_do_not_collide() {
        let a = resolve_scope(&Caller::new(Role::Doctor, "x:y").with_partner("z"), directory()).unwrap();
        let b = resolve_scope(&Caller::new(Role::Doctor, "x").with_partner("y:z"), directory()).unwrap();

        assert_ne!(a.key(), b.key());
        assert_ne!(a.key().to_string(), b.key().to_string());
        assert_eq!(a.key().to_string(), "doctor:x\\:y:z");

        let star = resolve_scope(&Caller::new(Role::Agent, "*"), directory()).unwrap();
        let none = resolve_scope(&Caller::new(Role::Admin, "root"), directory()).unwrap();
        assert_eq!(star.key().to_string(), "agent:\\*:*");
        assert_eq!(none.key().to_string(), "admin:*:*");
    }

    #[tokio::test]
    async fn directory_loads_in_batches() {
        let store = MemoryCaseStore::new();
        for (id, partner) in [("k1", "Acme"), ("k2", "Globex"), ("k3", "Acme")] {
            store
                .add_clinic(ClinicInfo {
                    clinic_id: id.into(),
                    partner_name: partner.into(),
                    clinic_code: None,
                })
                .unwrap();
        }

        let ids: Vec<String> = ["k1", "k2", "k1", "", "k3", "missing"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let dir = ClinicDirectory::load(&store, &ids, 2).await.unwrap();

        assert_eq!(dir.len(), 3);
        assert_eq!(dir.partner_for("k3"), Some("Acme"));
        assert!(dir.get("missing").is_none());
    }
}
