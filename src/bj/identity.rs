use std::collections::BTreeSet;
use users::{get_current_uid, get_user_by_uid};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    SeeForeignJobs,
    StopJobs,
    StopForeignJobs,
    DeleteJobs,
    DeleteForeignJobs,
}

impl Permission {
    pub const ALL: [Permission; 5] = [
        Permission::SeeForeignJobs,
        Permission::StopJobs,
        Permission::StopForeignJobs,
        Permission::DeleteJobs,
        Permission::DeleteForeignJobs,
    ];
}

/// Who is asking, and what they may do with jobs.
pub trait UserContext {
    /// `None` for anonymous callers (e.g. jobs started by the system itself).
    fn user_id(&self) -> Option<&str>;
    fn may(&self, permission: Permission) -> bool;
}

/// Fixed identity with an explicit permission set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticUser {
    user_id: Option<String>,
    permissions: BTreeSet<Permission>,
}

impl StaticUser {
    pub fn new(user_id: Option<&str>, permissions: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            user_id: user_id.map(str::to_string),
            permissions: permissions.into_iter().collect(),
        }
    }

    pub fn admin(user_id: &str) -> Self {
        Self::new(Some(user_id), Permission::ALL)
    }
}

impl UserContext for StaticUser {
    fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    fn may(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }
}

/// The OS user running the CLI. root and configured admins get every permission,
/// everyone else may stop and delete their own jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUser {
    inner: StaticUser,
}

impl LocalUser {
    pub fn current(admin_users: &[String]) -> Self {
        let uid = get_current_uid();
        let name = get_user_by_uid(uid).map(|u| u.name().to_string_lossy().into_owned());
        Self::from_parts(uid, name.as_deref(), admin_users)
    }

    fn from_parts(uid: u32, name: Option<&str>, admin_users: &[String]) -> Self {
        let admin = uid == 0 || name.is_some_and(|n| admin_users.iter().any(|a| a == n));
        let user_id = name.map(str::to_string).unwrap_or_else(|| uid.to_string());
        let inner = if admin {
            StaticUser::admin(&user_id)
        } else {
            StaticUser::new(Some(&user_id), [Permission::StopJobs, Permission::DeleteJobs])
        };
        Self { inner }
    }
}

impl UserContext for LocalUser {
    fn user_id(&self) -> Option<&str> {
        self.inner.user_id()
    }

    fn may(&self, permission: Permission) -> bool {
        self.inner.may(permission)
    }
}
