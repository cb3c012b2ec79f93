//! Identity gateway core library
//!
//! Pure, I/O-free building blocks shared by the gateway:
//!
//! - [`claims`]: claims derived from a validated token
//! - [`permission`]: ownership and role based authorization decisions
//! - [`user`]: managed-user records, creation input and update patches

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod claims;
pub mod permission;
pub mod user;

pub use claims::{RawClaims, RoleSet, TokenClaims};
pub use permission::{DEFAULT_ADMIN_ROLES, PermissionDecision, PermissionEvaluator};
pub use user::{
    AttributeValue, ManagedUserRecord, NewUser, PatchReport, UserPatch, BIRTH_DATE_ATTRIBUTE,
    GENDER_ATTRIBUTE, OWNER_ATTRIBUTE, PHONE_ATTRIBUTE, PROFESSOR_ATTRIBUTE,
};
