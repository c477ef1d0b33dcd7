//! Contents of the `m.room.*` state events the federation core inspects.

pub mod create;
pub mod join_rule;
pub mod member;
pub mod power_levels;
pub mod server_acl;
pub mod third_party_invite;
