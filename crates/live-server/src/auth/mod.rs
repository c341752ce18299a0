//! Authentication and capability checks.

pub mod login;
pub mod permissions;

pub use login::{authenticate, Identity};
pub use permissions::{
    can_see_secrets, capability, has_permission, roles_for, Principal, ADMIN_TRAIT,
};
